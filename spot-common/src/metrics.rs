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

//! Metric handles shared across the crates of the spot-assembly core.
//!
//! Registration happens once, at [`Metrics::new`]; every other call site holds a cheap
//! `Arc<Metrics>` and increments/sets through it rather than re-resolving the handle by
//! name on the hot path.

use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram};

#[derive(Debug)]
pub struct Metrics {
    pub spots_total: Counter,
    pub groups_total: Counter,
    pub batches_frozen: Counter,
    pub filter_seen_hits: Counter,
    pub filter_seen_misses: Counter,
    pub filter_rebuilds: Counter,
    pub records_discarded: Counter,
    pub records_demoted: Counter,
    pub mate_bank_live_bytes: Gauge,
    pub memory_estimate_bytes: Gauge,
    pub batch_freeze_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spots_total: metrics::counter!("spot_assembly_spots_total"),
            groups_total: metrics::counter!("spot_assembly_groups_total"),
            batches_frozen: metrics::counter!("spot_assembly_batches_frozen_total"),
            filter_seen_hits: metrics::counter!("spot_assembly_filter_seen_hits_total"),
            filter_seen_misses: metrics::counter!("spot_assembly_filter_seen_misses_total"),
            filter_rebuilds: metrics::counter!("spot_assembly_filter_rebuilds_total"),
            records_discarded: metrics::counter!("spot_assembly_records_discarded_total"),
            records_demoted: metrics::counter!("spot_assembly_records_demoted_total"),
            mate_bank_live_bytes: metrics::gauge!("spot_assembly_mate_bank_live_bytes"),
            memory_estimate_bytes: metrics::gauge!("spot_assembly_memory_estimate_bytes"),
            batch_freeze_latency_seconds: metrics::histogram!("spot_assembly_batch_freeze_latency_seconds"),
        })
    }
}
