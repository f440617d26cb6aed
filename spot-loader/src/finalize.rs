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

//! The three end-of-ingest passes (C8, §4.8), run once the ingest coordinator and
//! [`crate::processor`] have consumed every record: solo-fragment emission, the
//! sequence-to-alignment back-link, and the alignment-to-spot-id write-back.
//!
//! Pass B's gather stage is laid out elsewhere as a three-stage pipeline of bounded
//! queues. This crate already commits to a `crossbeam`-channel, worker-pool idiom for
//! every other background computation
//! ([`spot_index::WorkerPool`], [`crate::ingest::IngestCoordinator`]); reproducing that
//! here would mean wrapping the whole [`SpotIndex`] in an `Arc` to satisfy the pool's
//! `'static` bound, which would force every other caller of the index to go through an
//! `Arc` too. [`std::thread::scope`] gives the same fan-out without that cost, since the
//! index and sequence writer only need to outlive the scope, not `'static`.

use std::ops::Range;

use spot_common::error::{LoaderError, Result};
use spot_common::key::SpotKey;
use spot_index::{ReadNumber, SpotIndex};
use tracing::{debug, warn};

use crate::collaborators::{AlignmentWriter, ReadPayload, ReferenceCollaborator, SequenceRecord, SequenceWriter};
use crate::processor::RecordProcessor;

/// Row-batch width for Pass B's gather/update split (§4.8).
const PASS_B_BATCH_SIZE: u64 = 10_000_000;

/// Tally of what each pass actually did, returned for logging/metrics by the umbrella
/// loader rather than printed here.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinalizationSummary {
    pub solo_fragments_emitted: u64,
    pub pass_b_rows: u64,
    pub pass_b_violations: u64,
    pub pass_c_rows: u64,
}

/// Runs Pass A, Pass B, and Pass C in order against an ingest-complete processor.
/// Refuses to run at all if the caller has already observed a fatal ingest error -
/// finalization assumes every row it visits was left in a consistent state (§4.8's
/// "Finalization passes refuse to start if ingest ended in error").
pub fn run<R, S, A>(processor: &mut RecordProcessor<R, S, A>) -> Result<FinalizationSummary>
where
    R: ReferenceCollaborator,
    S: SequenceWriter + Sync,
    A: AlignmentWriter,
{
    let solo_fragments_emitted = run_pass_a(processor)?;
    let (pass_b_rows, pass_b_violations) = run_pass_b(processor)?;
    let pass_c_rows = run_pass_c(processor)?;
    Ok(FinalizationSummary { solo_fragments_emitted, pass_b_rows, pass_b_violations, pass_c_rows })
}

/// Pass A (§4.8): every row across every group still holding a banked fragment never
/// found its mate during ingest. Reconstructs the lone read's sequence record, frees the
/// blob, and assigns it the next spot id - exactly the "no mate arrived" branch of
/// [`crate::processor::RecordProcessor::process`] step 6, just deferred to end of ingest.
fn run_pass_a<R, S, A>(processor: &mut RecordProcessor<R, S, A>) -> Result<u64>
where
    R: ReferenceCollaborator,
    S: SequenceWriter,
    A: AlignmentWriter,
{
    let group_count = processor.index.group_count();
    let mut emitted = 0u64;

    for group_id in 0..group_count as u32 {
        let mut solo_rows: Vec<(u64, u32, bool)> = Vec::new();
        processor.index.for_each_row_mut(group_id, |global_row, frame, local_row| {
            let handle = frame.fragment_id(local_row);
            if handle != 0 {
                solo_rows.push((global_row, handle, frame.unmated(local_row)));
            }
        });

        let platform = if processor.index.is_single_group_mode() { None } else { processor.index.group_platform(group_id) };

        for (global_row, handle, unmated) in solo_rows {
            let payload = processor.read_fragment(handle)?;
            processor.mate_bank.free(handle);

            let key = processor.index.encode_key(group_id, global_row);
            let spot_id = processor.ids.next_spot();
            let (pcr_dup, row_platform) =
                processor.index.with_metadata_mut(key, |frame, row| {
                    frame.set_spot_id(row, spot_id);
                    frame.set_fragment_id(row, 0);
                    (frame.pcr_dup(row), frame.platform(row))
                });

            let read_payload = ReadPayload { sequence: payload.sequence.clone(), qualities: payload.qualities.clone() };
            let (read_1, read_2) = if unmated {
                (Some(read_payload), None)
            } else {
                match payload.read_number {
                    ReadNumber::One => (Some(read_payload), None),
                    ReadNumber::Two => (None, Some(read_payload)),
                }
            };
            let record = SequenceRecord { key, num_reads: 1, read_1, read_2 };
            let effective_platform = platform.unwrap_or(row_platform);
            processor.sequence_writer.write(&record, payload.color_space, pcr_dup, effective_platform)?;
            emitted += 1;
        }

        processor.index.clear_post_solo_fragment_columns(group_id);
    }

    debug!(emitted, "pass A emitted solo fragments");
    Ok(emitted)
}

/// One row's metadata as gathered by a Pass B worker, before the single-threaded updater
/// stage applies it to the sequence writer.
struct RowMetadata {
    row: u64,
    primary_ids: [u64; 2],
    counts: [u16; 2],
    num_reads: u8,
    violation: bool,
}

fn gather_row<S: SequenceWriter + Sync>(index: &SpotIndex, sequence_writer: &S, row: u64) -> RowMetadata {
    let key = sequence_writer.read_key(row);
    let (primary_1, primary_2, count_1, count_2, unmated) = index.with_metadata(key, |frame, local_row| {
        (
            frame.primary_id(local_row, ReadNumber::One),
            frame.primary_id(local_row, ReadNumber::Two),
            frame.alignment_count(local_row, ReadNumber::One),
            frame.alignment_count(local_row, ReadNumber::Two),
            frame.unmated(local_row),
        )
    });
    let violation = (count_1 > 0 && primary_1 == 0) || (count_2 > 0 && primary_2 == 0);
    RowMetadata {
        row,
        primary_ids: [primary_1, primary_2],
        counts: [count_1, count_2],
        num_reads: if unmated { 1 } else { 2 },
        violation,
    }
}

fn gather_batch<S: SequenceWriter + Sync>(index: &SpotIndex, sequence_writer: &S, rows: Range<u64>, worker_threads: usize) -> Vec<RowMetadata> {
    let rows: Vec<u64> = rows.collect();
    if rows.is_empty() {
        return Vec::new();
    }
    let chunk_size = rows.len().div_ceil(worker_threads.max(1));
    let chunks: Vec<&[u64]> = rows.chunks(chunk_size).collect();

    std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| scope.spawn(move || chunk.iter().map(|&row| gather_row(index, sequence_writer, row)).collect::<Vec<_>>()))
            .collect();
        handles.into_iter().flat_map(|h| h.join().expect("pass B gather worker panicked")).collect()
    })
}

/// Pass B (§4.8): walks every sequence-writer row in ascending order, gathering each
/// row's resolved mate metadata in parallel (bounded by [`PASS_B_BATCH_SIZE`]) and
/// applying it back to the sequence writer in row order on a single thread. Ends by
/// snapshotting every group's `spot_id` column into the dense array Pass C reads from.
fn run_pass_b<R, S, A>(processor: &mut RecordProcessor<R, S, A>) -> Result<(u64, u64)>
where
    R: ReferenceCollaborator,
    S: SequenceWriter + Sync,
    A: AlignmentWriter,
{
    let total_rows = processor.ids().spot_count();
    let worker_threads = processor.config.worker_threads;
    let cancel = processor.index.cancel_token();

    let mut rows_seen = 0u64;
    let mut violations = 0u64;
    let mut start = 1u64;
    while start <= total_rows {
        if cancel.load(std::sync::atomic::Ordering::Acquire) {
            return Err(LoaderError::Cancelled);
        }
        let end = (start + PASS_B_BATCH_SIZE).min(total_rows + 1);
        let gathered = gather_batch(&processor.index, &processor.sequence_writer, start..end, worker_threads);

        for metadata in gathered {
            if metadata.violation {
                violations += 1;
                let reason = format!(
                    "row {}: alignment_count [{}, {}] without a matching primary_id [{}, {}]",
                    metadata.row, metadata.counts[0], metadata.counts[1], metadata.primary_ids[0], metadata.primary_ids[1]
                );
                if processor.config.strict {
                    return Err(LoaderError::InconsistentMate { name: format!("sequence row {}", metadata.row), reason });
                }
                warn!(row = metadata.row, reason = %reason, "pass B primary/alignment-count mismatch");
            }
            processor.sequence_writer.update_align_data(metadata.row, metadata.num_reads, metadata.primary_ids, metadata.counts);
            rows_seen += 1;
        }

        start = end;
    }

    processor.index.snapshot_spot_ids();
    processor.sequence_writer.done();
    debug!(rows_seen, violations, "pass B resolved sequence back-links");
    Ok((rows_seen, violations))
}

/// Pass C (§4.8): the alignment writer's own row cursor drives this pass - it iterates
/// its rows in insertion order and we just resolve and write back each one's spot id.
fn run_pass_c<R, S, A>(processor: &mut RecordProcessor<R, S, A>) -> Result<u64>
where
    R: ReferenceCollaborator,
    S: SequenceWriter,
    A: AlignmentWriter,
{
    processor.alignment_writer.start_updating_spot_ids();
    let mut rows = 0u64;
    while let Some(key) = next_alignment_key(&mut processor.alignment_writer) {
        let spot_id = processor.index.spot_id_for(key);
        if spot_id == 0 {
            return Err(LoaderError::InconsistentMate {
                name: format!("alignment row {rows}"),
                reason: "no spot id was ever assigned to this alignment's spot".to_string(),
            });
        }
        processor.alignment_writer.write_spot_id(spot_id);
        rows += 1;
    }
    debug!(rows, "pass C wrote back alignment spot ids");
    Ok(rows)
}

fn next_alignment_key<A: AlignmentWriter>(writer: &mut A) -> Option<SpotKey> {
    writer.get_spot_key()
}
