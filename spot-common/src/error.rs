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

use thiserror::Error;

/// The typed error taxonomy raised by the spot-assembly core. A host process maps these
/// to exit codes; this crate only ever surfaces one of these variants, never a bare
/// `anyhow`-style string.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to decode a BAM record: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("reference '{name}' could not be verified: {reason}")]
    BadReference { name: String, reason: String },

    #[error("{found} distinct read groups exceed capacity {cap}; should have collapsed to single-group mode before ingest")]
    TooManyGroups { found: usize, cap: usize },

    #[error("mate inconsistency for read '{name}': {reason}")]
    InconsistentMate { name: String, reason: String },

    #[error("too many low-match alignments against the reference set: {count} (limit {limit})")]
    LowMatch { count: u64, limit: u64 },

    #[error(
        "projected memory usage ({projected} bytes) exceeded 1.25x the {limit} byte budget for {consecutive} consecutive samples"
    )]
    OutOfMemoryPrediction { projected: u64, limit: u64, consecutive: u32 },

    #[error("writer I/O error: {0}")]
    WriterIo(#[from] std::io::Error),

    #[error("mate bank I/O error: {0}")]
    BankIo(std::io::Error),

    #[error("load cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Counters accumulated across a class of recoverable error, surfaced in the single
/// concise diagnostic described by the error handling design (recoverable counts stay
/// recoverable up to a configured limit, then the class becomes fatal).
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorCounters {
    pub malformed_records: u64,
    pub unknown_references: u64,
    pub mate_inconsistencies: u64,
    pub low_match_events: u64,
}

impl ErrorCounters {
    pub fn total(&self) -> u64 {
        self.malformed_records + self.unknown_references + self.mate_inconsistencies + self.low_match_events
    }
}
