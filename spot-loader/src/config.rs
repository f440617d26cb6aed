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

//! `LoaderConfig` (§10.4): every tunable named across the preceding sections, builder-style
//! with their documented defaults. Loading this from a CLI or config file is the host
//! process's job; this crate only defines and validates the struct.

use spot_common::key::DEFAULT_GROUP_BITS;

/// Fixed quality value substituted for aligned-match bases, when that substitution is
/// enabled (§4.6's quality editing policies).
pub const DEFAULT_MATCH_QUALITY: u8 = 30;

/// Minimum match count below which an alignment is flagged low-match (§4.6 step 4).
pub const DEFAULT_MIN_MATCH: u32 = 10;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Width, in bits, of the group index held in the high bits of a spot key.
    pub group_bits: u32,
    /// Maximum number of concurrently live read groups before single-group collapse.
    pub group_cap: u32,
    /// Insertions between packing-policy sweeps (§4.4).
    pub insert_probe_interval: u64,
    /// Target hot-window size a group freezes at (§4.4's packing policy).
    pub target_batch_size: u32,
    /// Minimum reference-matching base count for a "good" alignment (§4.6 step 4).
    pub min_match: u32,
    /// Maximum running count of low-match events tolerated before the load fails.
    pub low_match_limit: u64,
    /// Maximum running count of malformed records tolerated before the load fails.
    pub malformed_record_limit: u64,
    /// Promotes recoverable per-record warnings (§7) to fatal errors.
    pub strict: bool,
    /// Width of the shared worker pool backing background batch builds and frozen-batch
    /// search (§5, default 4-8).
    pub worker_threads: usize,
    /// Capacity of the bounded ingest queue between the decoder and the processor (§4.5).
    pub ingest_queue_capacity: usize,
    /// Mate Bank large-chunk size in bytes (§4.7).
    pub mate_bank_large_chunk: u64,
    /// Mate Bank small-chunk size in bytes (§4.7).
    pub mate_bank_small_chunk: u64,
    /// RAM budget, in bytes, enforced by the memory-budget sampler (§5).
    pub memory_limit_bytes: u64,
    /// Substitute a fixed quality value for aligned-match bases.
    pub fixed_match_quality: Option<u8>,
    /// Mask base qualities at unaligned positions.
    pub mask_unaligned_qualities: bool,
    /// Treat the input stream as of unknown length (e.g. stdin): the memory sampler
    /// falls back to a direct current-usage check only (§5).
    pub unknown_input_length: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            group_bits: DEFAULT_GROUP_BITS,
            group_cap: 1 << DEFAULT_GROUP_BITS,
            insert_probe_interval: 10_000_000,
            target_batch_size: spot_index::DEFAULT_TARGET_BATCH_SIZE,
            min_match: DEFAULT_MIN_MATCH,
            low_match_limit: 1_000_000,
            malformed_record_limit: 10_000,
            strict: false,
            worker_threads: 4,
            ingest_queue_capacity: 1024,
            mate_bank_large_chunk: 64 << 20,
            mate_bank_small_chunk: 16 << 20,
            memory_limit_bytes: bytesize::ByteSize::gb(8).as_u64(),
            fixed_match_quality: None,
            mask_unaligned_qualities: false,
            unknown_input_length: false,
        }
    }
}

impl LoaderConfig {
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder { inner: LoaderConfig::default() }
    }

    /// Rejects configurations that could never satisfy the invariants named in §8 (e.g.
    /// a `group_cap` that does not fit in `group_bits`).
    pub fn validate(&self) -> Result<(), String> {
        if self.group_bits == 0 || self.group_bits >= 64 {
            return Err(format!("group_bits ({}) must leave room for a local row index", self.group_bits));
        }
        if self.group_cap as u64 > (1u64 << self.group_bits) {
            return Err(format!(
                "group_cap ({}) cannot exceed 2^group_bits ({})",
                self.group_cap,
                1u64 << self.group_bits
            ));
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be at least 1".to_string());
        }
        if self.target_batch_size == 0 {
            return Err("target_batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Builder for [`LoaderConfig`], following the crate's `XxxOptions`/builder convention
/// rather than exposing the struct's fields as `pub` for construction.
#[derive(Debug, Clone)]
pub struct LoaderConfigBuilder {
    inner: LoaderConfig,
}

macro_rules! setter {
    ($field:ident, $ty:ty) => {
        pub fn $field(mut self, value: $ty) -> Self {
            self.inner.$field = value;
            self
        }
    };
}

impl LoaderConfigBuilder {
    setter!(group_bits, u32);
    setter!(group_cap, u32);
    setter!(insert_probe_interval, u64);
    setter!(target_batch_size, u32);
    setter!(min_match, u32);
    setter!(low_match_limit, u64);
    setter!(malformed_record_limit, u64);
    setter!(strict, bool);
    setter!(worker_threads, usize);
    setter!(ingest_queue_capacity, usize);
    setter!(mate_bank_large_chunk, u64);
    setter!(mate_bank_small_chunk, u64);
    setter!(memory_limit_bytes, u64);
    setter!(fixed_match_quality, Option<u8>);
    setter!(mask_unaligned_qualities, bool);
    setter!(unknown_input_length, bool);

    pub fn build(self) -> Result<LoaderConfig, String> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(LoaderConfig::default().validate().is_ok());
    }

    #[test]
    fn group_cap_exceeding_bit_width_is_rejected() {
        let err = LoaderConfig::builder().group_bits(4).group_cap(100).build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_round_trips_a_custom_value() {
        let config = LoaderConfig::builder().strict(true).min_match(20).build().unwrap();
        assert!(config.strict);
        assert_eq!(config.min_match, 20);
    }
}
