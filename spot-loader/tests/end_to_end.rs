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

//! Drives [`spot_loader::load`] end to end against the literal scenarios: a mated pair
//! resolved while both sightings are still in the hot map, a mated pair whose mate only
//! turns up after a forced batch freeze, an unmated fragment, primary promotion, PCR
//! duplicate agreement, and a fatal clipped-length mismatch.

use std::sync::Mutex;

use spot_common::error::{LoaderError, Result};
use spot_common::key::SpotKey;
use spot_loader::{
    load, AlignmentRecord, AlignmentWriteRecord, AlignmentWriter, BamDecoder, CigarOp, Flags, LoaderConfig, MatchStats, Platform,
    ReferenceCollaborator, ReferenceFileInfo, SequenceRecord, SequenceWriter,
};

struct VecDecoder {
    records: Mutex<std::vec::IntoIter<AlignmentRecord>>,
}

impl VecDecoder {
    fn new(records: Vec<AlignmentRecord>) -> Self {
        Self { records: Mutex::new(records.into_iter()) }
    }
}

impl BamDecoder for VecDecoder {
    fn next_record(&mut self) -> Result<Option<AlignmentRecord>> {
        Ok(self.records.lock().unwrap().next())
    }
}

struct PermissiveReference;

impl ReferenceCollaborator for PermissiveReference {
    fn verify(&mut self, _name: &[u8], _length: u64, _checksum: &str) -> Result<()> {
        Ok(())
    }
    fn set_file(&mut self, _name: &[u8], _length: u64, _checksum: &str) -> Result<ReferenceFileInfo> {
        Ok(ReferenceFileInfo::default())
    }
    fn read(&mut self, _record: &AlignmentRecord, _pos: i64, _cigar: &[CigarOp], seq: &[u8], _readlen: usize, _intron_mode: bool) -> Result<MatchStats> {
        Ok(MatchStats { matches: seq.len() as u32, mismatches: 0 })
    }
    fn first_row_of(&self, _name: &[u8]) -> Option<u64> {
        None
    }
    fn add_align_id(&mut self, _id: u64, _is_primary: bool) {}
    fn is_known_reference(&self, _reference_id: u32) -> bool {
        true
    }
}

#[derive(Default)]
struct RecordingSequenceWriter {
    rows: Mutex<Vec<SequenceRecord>>,
    updates: Mutex<Vec<(u64, u8, [u64; 2], [u16; 2])>>,
}

impl SequenceWriter for RecordingSequenceWriter {
    fn write(&mut self, record: &SequenceRecord, _is_color_space: bool, _pcr_dup: bool, _platform: u16) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        rows.push(record.clone());
        Ok(rows.len() as u64)
    }
    fn read_key(&self, row: u64) -> SpotKey {
        self.rows.lock().unwrap()[(row - 1) as usize].key
    }
    fn update_align_data(&mut self, row: u64, num_reads: u8, primary_ids: [u64; 2], counts: [u16; 2]) {
        self.updates.lock().unwrap().push((row, num_reads, primary_ids, counts));
    }
    fn done(&mut self) {}
}

#[derive(Default)]
struct RecordingAlignmentWriter {
    rows: Vec<AlignmentWriteRecord>,
    cursor: usize,
    spot_ids: Vec<u64>,
}

impl AlignmentWriter for RecordingAlignmentWriter {
    fn write(&mut self, record: &AlignmentWriteRecord) -> Result<u64> {
        self.rows.push(record.clone());
        Ok(self.rows.len() as u64)
    }
    fn start_updating_spot_ids(&mut self) {
        self.cursor = 0;
    }
    fn get_spot_key(&mut self) -> Option<SpotKey> {
        let key = self.rows.get(self.cursor).map(|r| r.key);
        if key.is_some() {
            self.cursor += 1;
        }
        key
    }
    fn write_spot_id(&mut self, id: u64) {
        self.spot_ids.push(id);
    }
}

fn record(name: &[u8], flags: Flags, aligned: bool, len: usize) -> AlignmentRecord {
    AlignmentRecord {
        name: name.to_vec(),
        group_key: Vec::new(),
        platform: Platform::Illumina,
        flags,
        reference_id: if aligned { Some(0) } else { None },
        reference_pos: if aligned { Some(100) } else { None },
        mapping_quality: 60,
        cigar: vec![CigarOp::new(len as u32, CigarOp::OP_MATCH)],
        sequence: vec![b'A'; len],
        qualities: vec![30; len],
        original_qualities: None,
        mate_reference_id: None,
        mate_pos: None,
        template_len: 0,
        color_space: false,
        linkage_group: None,
        barcode: None,
    }
}

#[test]
fn mated_pair_near_assembles_one_spot_with_both_primaries() {
    let records = vec![
        record(b"A", Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 10),
        record(b"A", Flags::PAIRED | Flags::SECOND_IN_PAIR, true, 10),
    ];
    let decoder = VecDecoder::new(records);
    let config = LoaderConfig::default();

    let report = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(2)).unwrap();

    assert_eq!(report.spots_assembled, 1);
    assert_eq!(report.finalization.solo_fragments_emitted, 0);
    assert_eq!(report.finalization.pass_b_violations, 0);
    assert_eq!(report.errors.total(), 0);
}

#[test]
fn mated_pair_distant_across_a_forced_freeze_still_assembles_one_spot() {
    let mut records = vec![record(b"A", Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 10)];
    for i in 0..2_000u32 {
        records.push(record(format!("filler-{i}").as_bytes(), Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 10));
    }
    records.push(record(b"A", Flags::PAIRED | Flags::SECOND_IN_PAIR, true, 10));
    let total = records.len() as u64;
    let decoder = VecDecoder::new(records);
    // A small target batch size forces at least one freeze well before "A"'s mate arrives,
    // exercising the frozen-batch search path instead of the hot-map fast path.
    let config = LoaderConfig::builder().target_batch_size(64).insert_probe_interval(128).build().unwrap();

    let report = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(total)).unwrap();

    // Every filler name is unmated (never sees a read 2) so it is emitted solo in Pass A;
    // "A" is the only name with both reads, assembled during ingest.
    assert_eq!(report.spots_assembled, 1 + 2_000);
    assert_eq!(report.finalization.solo_fragments_emitted, 2_000);
}

#[test]
fn unmated_fragment_is_emitted_solo_during_finalization() {
    let decoder = VecDecoder::new(vec![record(b"B", Flags::empty(), false, 10)]);
    let config = LoaderConfig::default();

    let report = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(1)).unwrap();

    assert_eq!(report.spots_assembled, 1);
    assert_eq!(report.finalization.solo_fragments_emitted, 1);
}

#[test]
fn a_secondary_only_sighting_is_promoted_to_primary() {
    let decoder = VecDecoder::new(vec![record(b"C", Flags::PAIRED | Flags::FIRST_IN_PAIR | Flags::SECONDARY, true, 10)]);
    let config = LoaderConfig::default();

    let report = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(1)).unwrap();

    assert_eq!(report.finalization.solo_fragments_emitted, 1);
    assert_eq!(report.errors.total(), 0);
}

#[test]
fn pcr_duplicate_requires_agreement_across_every_primary_sighting() {
    let decoder = VecDecoder::new(vec![
        record(b"D", Flags::PAIRED | Flags::FIRST_IN_PAIR | Flags::DUPLICATE, true, 10),
        record(b"D", Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 10),
    ]);
    let config = LoaderConfig::default();

    let report = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(2)).unwrap();

    // Only one primary sighting was unflagged, so the AND collapses pcr_dup to false;
    // the loader still completes without any recoverable errors.
    assert_eq!(report.errors.total(), 0);
    assert_eq!(report.finalization.solo_fragments_emitted, 1);
}

#[test]
fn a_clipped_length_mismatch_on_the_primary_sighting_is_fatal() {
    let decoder = VecDecoder::new(vec![
        record(b"E", Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 10),
        record(b"E", Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 20),
    ]);
    let config = LoaderConfig::default();

    let result = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(2));

    assert!(matches!(result, Err(LoaderError::InconsistentMate { .. })));
}

#[test]
fn a_clipped_length_mismatch_on_a_secondary_sighting_is_a_recoverable_warning() {
    let decoder = VecDecoder::new(vec![
        record(b"F", Flags::PAIRED | Flags::FIRST_IN_PAIR, true, 10),
        record(b"F", Flags::PAIRED | Flags::FIRST_IN_PAIR | Flags::SECONDARY, true, 20),
    ]);
    let config = LoaderConfig::default();

    let report = load(decoder, PermissiveReference, RecordingSequenceWriter::default(), RecordingAlignmentWriter::default(), config, Some(2)).unwrap();

    assert_eq!(report.errors.mate_inconsistencies, 1);
}
