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

//! The spot-assembly loader core: ties [`spot_index`]'s name index, [`spot_filter`]'s
//! key filter, and [`spot_bank`]'s Mate Bank into the end-to-end pipeline described in
//! the system overview - decoder -> ingest queue -> record processor -> (on end of
//! input) the three finalization passes.
//!
//! [`load`] is the one entry point a host process needs; everything else (the
//! collaborator traits, [`LoaderConfig`], the individual pipeline stages) is exported for
//! callers who want to drive the pipeline by hand - a resumable loader, or one that
//! interleaves finalization with something else, for instance.

pub mod collaborators;
pub mod config;
pub mod finalize;
pub mod fragment;
pub mod ingest;
pub mod processor;
pub mod record;
pub mod sampler;

pub use collaborators::{
    AlignmentWriteRecord, AlignmentWriter, BamDecoder, MatchStats, ReadPayload, ReferenceCollaborator, ReferenceFileInfo, SequenceRecord,
    SequenceWriter,
};
pub use config::LoaderConfig;
pub use finalize::FinalizationSummary;
pub use ingest::IngestCoordinator;
pub use processor::{IdCounters, RecordProcessor};
pub use record::{AlignmentRecord, CigarOp, Flags, Platform};
pub use sampler::{MemorySample, MemorySampler};

use spot_common::error::{ErrorCounters, Result};
use spot_common::key::KeyCodec;
use spot_bank::{MateBank, MateBankConfig};
use spot_filter::{KeyFilter, Tier};
use spot_index::{SpotIndex, WorkerPool};

/// How often, in processed records, the umbrella loader re-checks the memory-budget
/// projection against a hard failure (§5). Matches [`crate::processor`]'s own internal
/// sampling cadence for the soft/logged check.
const MEMORY_CHECK_INTERVAL: u64 = 100_000;

/// What one complete load produced: how many spots were assembled, which recoverable
/// error classes fired and how often, and what each finalization pass did.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub spots_assembled: u64,
    pub errors: ErrorCounters,
    pub finalization: FinalizationSummary,
}

/// Runs one complete load: spawns the ingest coordinator over `decoder`, feeds every
/// decoded record through a [`RecordProcessor`], then runs [`finalize::run`] once ingest
/// reaches end of input.
///
/// Any fatal error - from decoding, the per-record state machine, the memory-budget
/// sampler, or finalization - cancels the decoder thread and propagates. Finalization
/// never starts if ingest itself ended in error, per §4.8's refusal rule.
pub fn load<D, R, S, A>(
    decoder: D,
    reference: R,
    sequence_writer: S,
    alignment_writer: A,
    config: LoaderConfig,
    total_records_hint: Option<u64>,
) -> Result<LoadReport>
where
    D: BamDecoder + Send + 'static,
    R: ReferenceCollaborator,
    S: SequenceWriter + Sync,
    A: AlignmentWriter,
{
    let codec = KeyCodec::new(config.group_bits);
    let estimated_spots = total_records_hint.unwrap_or(0) as f64 / 2.0;
    let filter = KeyFilter::new(Tier::for_estimated_spots(estimated_spots));
    let pool = WorkerPool::new(config.worker_threads);
    let index = SpotIndex::new(codec, filter, pool, config.insert_probe_interval, config.target_batch_size);
    let mate_bank = MateBank::new(MateBankConfig { large_chunk_size: config.mate_bank_large_chunk, small_chunk_size: config.mate_bank_small_chunk });

    let mut processor = RecordProcessor::new(index, mate_bank, reference, sequence_writer, alignment_writer, config.clone(), total_records_hint);

    let coordinator = IngestCoordinator::spawn(decoder, config.ingest_queue_capacity);
    let mut processed = 0u64;
    loop {
        let record = match coordinator.recv() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) => return Err(err),
        };
        if let Err(err) = processor.process(record) {
            coordinator.cancel();
            return Err(err);
        }
        processed += 1;
        if processed % MEMORY_CHECK_INTERVAL == 0 {
            if let Err(err) = processor.check_memory_budget() {
                coordinator.cancel();
                return Err(err);
            }
        }
    }
    drop(coordinator);

    let finalization = finalize::run(&mut processor)?;
    let ids = processor.ids();
    let errors = processor.errors();
    Ok(LoadReport { spots_assembled: ids.spot_count(), errors, finalization })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AlignmentWriteRecord, MatchStats, ReferenceFileInfo};
    use crate::record::{AlignmentRecord, CigarOp, Flags, Platform};
    use spot_common::key::SpotKey;
    use std::sync::Mutex;

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

    struct MockReference;
    impl ReferenceCollaborator for MockReference {
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
    struct MockSequenceWriter {
        rows: Mutex<Vec<SequenceRecord>>,
        updates: Mutex<Vec<(u64, u8, [u64; 2], [u16; 2])>>,
    }
    impl SequenceWriter for MockSequenceWriter {
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
    struct MockAlignmentWriter {
        rows: Vec<AlignmentWriteRecord>,
        cursor: usize,
        spot_ids: Vec<u64>,
    }
    impl AlignmentWriter for MockAlignmentWriter {
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

    fn record(name: &[u8], flags: Flags, aligned: bool) -> AlignmentRecord {
        AlignmentRecord {
            name: name.to_vec(),
            group_key: Vec::new(),
            platform: Platform::Illumina,
            flags,
            reference_id: if aligned { Some(0) } else { None },
            reference_pos: if aligned { Some(100) } else { None },
            mapping_quality: 60,
            cigar: vec![CigarOp::new(10, CigarOp::OP_MATCH)],
            sequence: b"ACGTACGTAC".to_vec(),
            qualities: vec![30; 10],
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
    fn end_to_end_load_assembles_a_mated_pair_and_a_solo_fragment() {
        let records = vec![
            record(b"mated", Flags::PAIRED | Flags::FIRST_IN_PAIR, true),
            record(b"mated", Flags::PAIRED | Flags::SECOND_IN_PAIR, true),
            record(b"solo", Flags::PAIRED | Flags::FIRST_IN_PAIR, true),
        ];
        let decoder = VecDecoder::new(records);
        let config = LoaderConfig::builder().worker_threads(2).build().unwrap();

        let report = load(decoder, MockReference, MockSequenceWriter::default(), MockAlignmentWriter::default(), config, Some(3)).unwrap();

        assert_eq!(report.spots_assembled, 2);
        assert_eq!(report.finalization.solo_fragments_emitted, 1);
        assert_eq!(report.finalization.pass_c_rows, 3);
        assert_eq!(report.errors.total(), 0);
    }

    #[test]
    fn an_unknown_reference_in_strict_mode_fails_the_load() {
        struct RejectingReference;
        impl ReferenceCollaborator for RejectingReference {
            fn verify(&mut self, _name: &[u8], _length: u64, _checksum: &str) -> Result<()> {
                Ok(())
            }
            fn set_file(&mut self, _name: &[u8], _length: u64, _checksum: &str) -> Result<ReferenceFileInfo> {
                Ok(ReferenceFileInfo::default())
            }
            fn read(&mut self, _record: &AlignmentRecord, _pos: i64, _cigar: &[CigarOp], _seq: &[u8], _readlen: usize, _intron_mode: bool) -> Result<MatchStats> {
                Ok(MatchStats { matches: 10, mismatches: 0 })
            }
            fn first_row_of(&self, _name: &[u8]) -> Option<u64> {
                None
            }
            fn add_align_id(&mut self, _id: u64, _is_primary: bool) {}
            fn is_known_reference(&self, _reference_id: u32) -> bool {
                false
            }
        }

        let decoder = VecDecoder::new(vec![record(b"a", Flags::PAIRED | Flags::FIRST_IN_PAIR, true)]);
        let config = LoaderConfig::builder().strict(true).build().unwrap();
        let result = load(decoder, RejectingReference, MockSequenceWriter::default(), MockAlignmentWriter::default(), config, Some(1));
        assert!(result.is_err());
    }
}
