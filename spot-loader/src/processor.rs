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

//! The per-alignment state machine (C6, §4.6): resolves a record's spot via the index,
//! reconciles it against whatever prior sightings of that spot already recorded, assigns
//! primary/secondary ids, assembles paired reads through the Mate Bank, and emits the
//! alignment row. [`crate::finalize`] drives the three end-of-ingest passes over the
//! state this leaves behind.

use std::sync::Arc;

use spot_bank::{MateBank, Placement};
use spot_common::error::{ErrorCounters, LoaderError, Result};
use spot_common::metrics::Metrics;
use spot_index::{ReadNumber, SpotIndex};
use tracing::{debug, trace, warn};

use crate::collaborators::{AlignmentWriteRecord, AlignmentWriter, ReadPayload, ReferenceCollaborator, SequenceRecord, SequenceWriter};
use crate::config::LoaderConfig;
use crate::fragment::FragmentPayload;
use crate::record::AlignmentRecord;
use crate::sampler::{MemorySample, MemorySampler};

/// The three independent monotonically increasing counters named in §9's "global mutable
/// state" note: primary id, secondary id, spot id. Owned by the processor, never shared.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdCounters {
    next_primary: u64,
    next_secondary: u64,
    next_spot: u64,
}

impl IdCounters {
    pub fn next_primary(&mut self) -> u64 {
        self.next_primary += 1;
        self.next_primary
    }

    pub fn next_secondary(&mut self) -> u64 {
        self.next_secondary += 1;
        self.next_secondary
    }

    pub fn next_spot(&mut self) -> u64 {
        self.next_spot += 1;
        self.next_spot
    }

    pub fn spot_count(&self) -> u64 {
        self.next_spot
    }
}

/// The per-alignment-record state machine plus everything it needs to run it: the spot
/// index, the Mate Bank, the id counters, the running error counters, the memory
/// sampler, and the three external collaborators (§6). A host process constructs one of
/// these per load and feeds it every decoded record in order.
pub struct RecordProcessor<R, S, A> {
    pub(crate) index: SpotIndex,
    pub(crate) mate_bank: MateBank,
    pub(crate) reference: R,
    pub(crate) sequence_writer: S,
    pub(crate) alignment_writer: A,
    pub(crate) config: LoaderConfig,
    pub(crate) ids: IdCounters,
    pub(crate) errors: ErrorCounters,
    sampler: MemorySampler,
    metrics: Arc<Metrics>,
    records_processed: u64,
    total_records_hint: Option<u64>,
}

impl<R, S, A> RecordProcessor<R, S, A>
where
    R: ReferenceCollaborator,
    S: SequenceWriter,
    A: AlignmentWriter,
{
    pub fn new(
        index: SpotIndex,
        mate_bank: MateBank,
        reference: R,
        sequence_writer: S,
        alignment_writer: A,
        config: LoaderConfig,
        total_records_hint: Option<u64>,
    ) -> Self {
        let sampler = MemorySampler::new(config.memory_limit_bytes, config.unknown_input_length || total_records_hint.is_none());
        Self {
            index,
            mate_bank,
            reference,
            sequence_writer,
            alignment_writer,
            config,
            ids: IdCounters::default(),
            errors: ErrorCounters::default(),
            sampler,
            metrics: Metrics::new(),
            records_processed: 0,
            total_records_hint,
        }
    }

    pub fn ids(&self) -> IdCounters {
        self.ids
    }

    pub fn errors(&self) -> ErrorCounters {
        self.errors
    }

    pub fn index(&self) -> &SpotIndex {
        &self.index
    }

    /// Runs §4.6's state machine for one decoded record. Errors that §7 classifies as
    /// fatal propagate; everything else is counted and logged, and the record is simply
    /// dropped from further processing.
    pub fn process(&mut self, record: AlignmentRecord) -> Result<()> {
        let span = tracing::trace_span!("process_record", name = %String::from_utf8_lossy(&record.name));
        let _enter = span.enter();

        // Step 1: resolve (group, row) via find_or_insert.
        let group_id = self.index.group_id_for(&record.group_key)?;
        if !self.index.is_single_group_mode() && self.index.group_platform(group_id).is_none() {
            self.index.set_group_platform(group_id, record.platform.id());
        }
        let found = self.index.find_or_insert(group_id, &record.name);
        let key = found.key;
        let read = record.read_number().unwrap_or(ReadNumber::One);
        let is_unmated = record.read_number().is_none();

        if found.was_inserted {
            self.metrics.spots_total.increment(1);
        }

        // Step 2: first-sighting initialization.
        let is_duplicate = record.flags.is_duplicate();
        if found.was_inserted {
            let single_group_mode = self.index.is_single_group_mode();
            let platform_id = record.platform.id();
            let is_primary_candidate = record.flags.is_primary_candidate();
            self.index.with_metadata_mut(key, |frame, row| {
                frame.set_unmated(row, is_unmated);
                if is_primary_candidate {
                    frame.set_primary_is_set(row, true);
                    frame.set_pcr_dup(row, is_duplicate);
                } else {
                    frame.set_pcr_dup(row, false);
                }
                if single_group_mode {
                    frame.set_platform(row, platform_id);
                }
            });
        } else if record.flags.is_primary_candidate() {
            // §8 scenario 5: pcr_dup is the AND of every primary sighting's duplicate
            // flag, not just the first's - a single non-duplicate-flagged primary record
            // clears it even if an earlier sighting set it.
            self.index.with_metadata_mut(key, |frame, row| {
                let current = frame.pcr_dup(row);
                frame.set_pcr_dup(row, current && is_duplicate);
            });
        }

        // Step 3: consistency checks against prior sightings of this row.
        let is_primary_candidate = record.flags.is_primary_candidate();
        let record_aligned = record.is_aligned();
        let mate_read = match read {
            ReadNumber::One => ReadNumber::Two,
            ReadNumber::Two => ReadNumber::One,
        };
        let (mate_flip, primary_exists, mate_unaligned, prior_len) = self.index.with_metadata(key, |frame, row| {
            (
                !found.was_inserted && frame.unmated(row) != is_unmated,
                frame.primary_id(row, read) != 0,
                !is_unmated && frame.unaligned(row, mate_read),
                frame.fragment_len(row, read),
            )
        });

        if mate_flip {
            self.errors.mate_inconsistencies += 1;
            self.metrics.records_discarded.increment(1);
            warn!(name = %String::from_utf8_lossy(&record.name), "paired/unmated status flipped between sightings; discarding");
            return Ok(());
        }

        // A record flagged secondary/supplementary is still promoted to primary when no
        // primary sighting has been recorded yet for this read (§8's "primary promotion"
        // scenario); a record already claiming primary is demoted if a primary already
        // exists, or if its mate was previously observed unaligned and this sighting is
        // itself aligned.
        let mut is_primary = if is_primary_candidate { true } else { !primary_exists };
        if is_primary && (primary_exists || (mate_unaligned && record_aligned)) {
            is_primary = false;
            self.metrics.records_demoted.increment(1);
            debug!(name = %String::from_utf8_lossy(&record.name), primary_exists, mate_unaligned, "demoting record to secondary");
        }

        // Length-mismatch check: a read seen before with a different clipped length.
        // Fatal-vs-warning hinges on whether this record's own flags claim primary, not
        // on whether it was just demoted above - a flag-level primary sighting reporting
        // a conflicting length points at corrupt input, while a flag-level secondary
        // disagreeing with an established primary is just discarded.
        let clipped_len = record.clipped_len();
        if prior_len != 0 && prior_len as usize != clipped_len {
            if is_primary_candidate {
                return Err(LoaderError::InconsistentMate {
                    name: String::from_utf8_lossy(&record.name).into_owned(),
                    reason: format!("primary alignment reports clipped length {clipped_len}, prior sighting recorded {prior_len}"),
                });
            }
            self.errors.mate_inconsistencies += 1;
            self.metrics.records_discarded.increment(1);
            warn!(name = %String::from_utf8_lossy(&record.name), prior_len, clipped_len, "clipped length mismatch; discarding secondary");
            return Ok(());
        }

        // Step 4: alignment validation.
        let mut aligned = record.is_aligned();
        if aligned {
            let reference_id = record.reference_id.expect("is_aligned guarantees a reference id");
            if !self.reference.is_known_reference(reference_id) {
                aligned = false;
                self.errors.unknown_references += 1;
                if self.config.strict {
                    return Err(LoaderError::BadReference {
                        name: String::from_utf8_lossy(&record.name).into_owned(),
                        reason: format!("reference id {reference_id} is not known"),
                    });
                }
                warn!(reference_id, "unknown reference; treating record as unaligned");
            } else {
                let pos = record.reference_pos.unwrap_or(0);
                let stats = self.reference.read(&record, pos, &record.cigar, &record.sequence, clipped_len, false)?;
                if stats.matches < self.config.min_match {
                    if is_primary {
                        warn!(matches = stats.matches, min_match = self.config.min_match, "primary alignment below minimum match count");
                    } else {
                        self.metrics.records_discarded.increment(1);
                        debug!(matches = stats.matches, "discarding secondary alignment below minimum match count");
                        return Ok(());
                    }
                }
                if stats.matches == 0 {
                    self.errors.low_match_events += 1;
                    if self.errors.low_match_events > self.config.low_match_limit {
                        return Err(LoaderError::LowMatch { count: self.errors.low_match_events, limit: self.config.low_match_limit });
                    }
                }
            }
        }

        if !aligned {
            self.index.with_metadata_mut(key, |frame, row| frame.set_unaligned(row, read, true));
        }
        if record.has_hardclip() {
            self.index.with_metadata_mut(key, |frame, row| frame.set_hardclipped(row, true));
        }
        self.index.with_metadata_mut(key, |frame, row| frame.set_fragment_len(row, read, clipped_len));

        // Step 5: primary/secondary accounting.
        let assigned_id = if is_primary {
            let id = self.ids.next_primary();
            self.index.with_metadata_mut(key, |frame, row| {
                frame.set_primary_id(row, read, id);
                frame.set_primary_is_set(row, true);
            });
            id
        } else {
            self.ids.next_secondary()
        };
        if aligned {
            self.index.with_metadata_mut(key, |frame, row| {
                frame.inc_alignment_count(row, read);
            });
        }

        // Step 6: spot assembly via the Mate Bank.
        let (spot_id_existing, fragment_id_existing) = self.index.with_metadata(key, |frame, row| (frame.spot_id(row), frame.fragment_id(row)));

        if spot_id_existing == 0 {
            if fragment_id_existing == 0 {
                let payload = FragmentPayload {
                    read_number: read,
                    aligned,
                    reverse: record.flags.is_reverse(),
                    color_space: record.color_space,
                    template_len: record.template_len,
                    sequence: record.sequence.clone(),
                    qualities: record.qualities.clone(),
                    group_key: record.group_key.clone(),
                    linkage_group: record.linkage_group.clone(),
                };
                let bytes = payload.encode();
                // A read expected to be reunited with its mate within the same reference
                // region goes to the small pool; unmated reads (never reunited until Pass
                // A) go to the large pool, where longer residency is expected.
                let placement = if is_unmated { Placement::Far } else { Placement::Near };
                let handle = self.mate_bank.alloc(bytes.len() as u64, placement)?;
                self.mate_bank.write(handle, 0, &bytes)?;
                self.index.with_metadata_mut(key, |frame, row| frame.set_fragment_id(row, handle as u32));
            } else if !is_unmated {
                let banked = self.read_fragment(fragment_id_existing as u32)?;
                self.mate_bank.free(fragment_id_existing as u32);
                let spot_id = self.ids.next_spot();
                self.index.with_metadata_mut(key, |frame, row| {
                    frame.set_spot_id(row, spot_id);
                    frame.set_fragment_id(row, 0);
                });
                self.emit_sequence(key, spot_id, read, &record, clipped_len, banked)?;
            }
        }

        // Step 7: emission.
        let (sequence, qualities) = edit_qualities(&record, aligned, &self.config);
        let write_record = AlignmentWriteRecord {
            key,
            read_number: record.read_number(),
            reference_id: record.reference_id.unwrap_or(u32::MAX),
            reference_pos: record.reference_pos.unwrap_or(-1),
            mapping_quality: record.mapping_quality,
            cigar: record.cigar.clone(),
            sequence,
            qualities,
            is_primary,
            align_id: assigned_id,
        };
        let row_id = self.alignment_writer.write(&write_record)?;
        self.reference.add_align_id(row_id, is_primary);

        self.records_processed += 1;
        self.sample_memory();
        Ok(())
    }

    pub(crate) fn read_fragment(&self, handle: u32) -> Result<FragmentPayload> {
        let size = self.mate_bank.size(handle);
        let mut buf = vec![0u8; size as usize];
        self.mate_bank.read(handle, 0, &mut buf)?;
        Ok(FragmentPayload::decode(&buf))
    }

    fn emit_sequence(
        &mut self,
        key: spot_common::key::SpotKey,
        spot_id: u64,
        this_read: ReadNumber,
        this_record: &AlignmentRecord,
        this_len: usize,
        other: FragmentPayload,
    ) -> Result<()> {
        let this_payload = ReadPayload { sequence: this_record.sequence.clone(), qualities: this_record.qualities.clone() };
        let other_payload = ReadPayload { sequence: other.sequence.clone(), qualities: other.qualities.clone() };
        let (read_1, read_2) = match this_read {
            ReadNumber::One => (Some(this_payload), Some(other_payload)),
            ReadNumber::Two => (Some(other_payload), Some(this_payload)),
        };
        let _ = this_len;
        let platform = this_record.platform.id();
        let pcr_dup = self.index.with_metadata(key, |frame, row| frame.pcr_dup(row));
        let record = SequenceRecord { key, num_reads: 2, read_1, read_2 };
        let _row_id = self.sequence_writer.write(&record, this_record.color_space, pcr_dup, platform)?;
        self.metrics.mate_bank_live_bytes.set(self.mate_bank.disk_used() as f64);
        let _ = spot_id;
        Ok(())
    }

    fn sample_memory(&mut self) {
        if self.records_processed % 100_000 != 0 {
            return;
        }
        let progress = match self.total_records_hint {
            Some(total) if total > 0 => (self.records_processed as f64 / total as f64).min(1.0),
            _ => 0.0,
        };
        let sample = MemorySample {
            live_spot_memory: self.index.memory_used() as u64 + self.mate_bank.disk_used(),
            current_spot_count: self.ids.spot_count().max(1),
            reference_memory: 0,
            filter_memory: self.index.filter().memory_used() as u64,
        };
        self.metrics.memory_estimate_bytes.set(sample.live_spot_memory as f64);
        if let Err(err) = self.sampler.sample(progress, sample) {
            warn!(error = %err, "memory budget projection exceeded");
        }
    }

    /// Surfaces the memory sampler's verdict as a hard error, called by the umbrella
    /// loader at the same cadence bookkeeping happens rather than silently logging.
    pub fn check_memory_budget(&mut self) -> Result<()> {
        let progress = match self.total_records_hint {
            Some(total) if total > 0 => (self.records_processed as f64 / total as f64).min(1.0),
            _ => 0.0,
        };
        let sample = MemorySample {
            live_spot_memory: self.index.memory_used() as u64 + self.mate_bank.disk_used(),
            current_spot_count: self.ids.spot_count().max(1),
            reference_memory: 0,
            filter_memory: self.index.filter().memory_used() as u64,
        };
        self.sampler.sample(progress, sample)
    }

    pub fn into_parts(self) -> (SpotIndex, MateBank, R, S, A, IdCounters, ErrorCounters, LoaderConfig) {
        (
            self.index,
            self.mate_bank,
            self.reference,
            self.sequence_writer,
            self.alignment_writer,
            self.ids,
            self.errors,
            self.config,
        )
    }
}

/// Applies §4.6's quality-editing policies, in order, and returns `(sequence, qualities)`
/// ready for emission. Kept as a dedicated function so each policy's precondition stays
/// legible on its own line:
///
/// 1. Reverse-strand records are reverse-complemented (sequence) and reversed (qualities)
///    back into reference orientation.
/// 2. A configured fixed match quality overwrites every base covered by CIGAR match/insert
///    ops, but only when that would actually change the string - a record already uniform
///    at that value is left untouched so the edit is idempotent across re-runs.
/// 3. The `OQ`-style original quality string, when the decoder captured one, replaces the
///    quality string built by the previous two steps. `OQ` is defined in the same
///    orientation as `QUAL`, i.e. already reference-oriented, so it is substituted in as-is
///    rather than re-reversed.
/// 4. Soft-clipped (unaligned) positions are zeroed when the host has asked for that; an
///    entirely unaligned record is zeroed in full.
fn edit_qualities(record: &AlignmentRecord, aligned: bool, config: &LoaderConfig) -> (Vec<u8>, Vec<u8>) {
    let mut sequence = record.sequence.clone();
    let mut qualities = record.qualities.clone();

    if record.flags.is_reverse() {
        reverse_complement_in_place(&mut sequence);
        qualities.reverse();
    }

    if let Some(fixed) = config.fixed_match_quality {
        if aligned {
            let (lead, trail) = soft_clip_span(&record.cigar);
            let start = lead.min(qualities.len());
            let end = qualities.len().saturating_sub(trail).max(start);
            if qualities[start..end].iter().any(|&q| q != fixed) {
                for q in &mut qualities[start..end] {
                    *q = fixed;
                }
            }
        }
    }

    if let Some(original) = &record.original_qualities {
        qualities = original.clone();
    }

    if config.mask_unaligned_qualities {
        if aligned {
            let (lead, trail) = soft_clip_span(&record.cigar);
            let lead = lead.min(qualities.len());
            for q in &mut qualities[..lead] {
                *q = 0;
            }
            let trail_start = qualities.len().saturating_sub(trail);
            for q in &mut qualities[trail_start..] {
                *q = 0;
            }
        } else {
            for q in &mut qualities {
                *q = 0;
            }
        }
    }

    (sequence, qualities)
}

/// Read-space span, in bases, clipped by a leading/trailing soft-clip CIGAR op. Used to
/// bound the quality-editing policies to the portion of the read that was actually
/// aligned (§4.6's "unaligned-base" notion is CIGAR-derived, not a separate flag).
fn soft_clip_span(cigar: &[crate::record::CigarOp]) -> (usize, usize) {
    let leading = cigar
        .first()
        .filter(|op| op.code() == crate::record::CigarOp::OP_SOFT_CLIP)
        .map(|op| op.length() as usize)
        .unwrap_or(0);
    let trailing = cigar
        .last()
        .filter(|op| op.code() == crate::record::CigarOp::OP_SOFT_CLIP)
        .map(|op| op.length() as usize)
        .unwrap_or(0);
    (leading, trailing)
}

fn reverse_complement_in_place(sequence: &mut [u8]) {
    sequence.reverse();
    for base in sequence.iter_mut() {
        *base = match base.to_ascii_uppercase() {
            b'A' => b'T',
            b'T' | b'U' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            other => other,
        };
    }
}
