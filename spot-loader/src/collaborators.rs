//  Copyright 2024 SRA Tools Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The trait interfaces §6 draws around this crate's out-of-scope collaborators: the
//! BAM decoder, the reference-sequence verifier, and the sequence/alignment writers.
//! None of these are implemented here - the host process supplies them, and
//! `spot-loader`'s tests substitute in-memory mocks (§10.5).

use spot_common::error::Result;
use spot_common::key::SpotKey;
use spot_index::ReadNumber;

use crate::record::AlignmentRecord;

/// A lazy, restartable source of decoded alignment records. `next_record` returns
/// `Ok(None)` at end of input.
pub trait BamDecoder {
    fn next_record(&mut self) -> Result<Option<AlignmentRecord>>;
}

/// Outcome of [`ReferenceCollaborator::set_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceFileInfo {
    pub should_unmap: bool,
    pub was_renamed: bool,
    pub is_new: bool,
}

/// Outcome of [`ReferenceCollaborator::read`]: how many bases of the CIGAR-aligned
/// portion of a read matched vs. mismatched the reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchStats {
    pub matches: u32,
    pub mismatches: u32,
}

impl MatchStats {
    pub fn total(self) -> u32 {
        self.matches + self.mismatches
    }
}

/// The reference-sequence verifier (§6), out of scope as a feature but reached through
/// this trait for alignment validation (§4.6 step 4).
pub trait ReferenceCollaborator {
    fn verify(&mut self, name: &[u8], length: u64, checksum: &str) -> Result<()>;
    fn set_file(&mut self, name: &[u8], length: u64, checksum: &str) -> Result<ReferenceFileInfo>;
    fn read(
        &mut self,
        record: &AlignmentRecord,
        pos: i64,
        cigar: &[crate::record::CigarOp],
        seq: &[u8],
        readlen: usize,
        intron_mode: bool,
    ) -> Result<MatchStats>;
    fn first_row_of(&self, name: &[u8]) -> Option<u64>;
    fn add_align_id(&mut self, id: u64, is_primary: bool);
    /// Whether `reference_id` names a reference this collaborator knows about; used by
    /// §4.6 step 4's "verify the reference id maps to a known reference".
    fn is_known_reference(&self, reference_id: u32) -> bool;
}

/// One assembled spot, ready for [`SequenceWriter::write`].
#[derive(Debug, Clone)]
pub struct SequenceRecord {
    pub key: SpotKey,
    pub num_reads: u8,
    pub read_1: Option<ReadPayload>,
    pub read_2: Option<ReadPayload>,
}

#[derive(Debug, Clone)]
pub struct ReadPayload {
    pub sequence: Vec<u8>,
    pub qualities: Vec<u8>,
}

/// The sequence-table writer (§6).
pub trait SequenceWriter {
    fn write(&mut self, record: &SequenceRecord, is_color_space: bool, pcr_dup: bool, platform: u16) -> Result<u64>;
    fn read_key(&self, row: u64) -> SpotKey;
    fn update_align_data(&mut self, row: u64, num_reads: u8, primary_ids: [u64; 2], counts: [u16; 2]);
    fn done(&mut self);
}

/// One alignment row, ready for [`AlignmentWriter::write`].
#[derive(Debug, Clone)]
pub struct AlignmentWriteRecord {
    pub key: SpotKey,
    pub read_number: Option<ReadNumber>,
    pub reference_id: u32,
    pub reference_pos: i64,
    pub mapping_quality: u8,
    pub cigar: Vec<crate::record::CigarOp>,
    pub sequence: Vec<u8>,
    pub qualities: Vec<u8>,
    pub is_primary: bool,
    /// The id assigned in §4.6 step 5: a `primary_id` for a primary sighting, a secondary
    /// id (from the separate secondary counter) otherwise.
    pub align_id: u64,
}

/// The alignment-table writer (§6).
pub trait AlignmentWriter {
    fn write(&mut self, record: &AlignmentWriteRecord) -> Result<u64>;
    fn start_updating_spot_ids(&mut self);
    /// Iterates alignment rows in insertion order for Pass C; `None` once exhausted.
    fn get_spot_key(&mut self) -> Option<SpotKey>;
    fn write_spot_id(&mut self, id: u64);
}
