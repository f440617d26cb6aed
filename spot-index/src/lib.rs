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

//! The succinct, batched, concurrent spot index (C2-C4): a fixed-schema columnar
//! metadata store, frozen name-dictionary batches built in the background, and the
//! per-group hot-map/frozen-batch search that ties them together into one
//! `find_or_insert` surface spanning every read-group in a load.

pub mod batch;
pub mod column;
pub mod dictionary;
pub mod group;
pub mod index;
pub mod metadata;
pub mod pool;

pub use group::{FindResult, GroupIndex};
pub use index::{IndexFindResult, SpotIndex, DEFAULT_TARGET_BATCH_SIZE};
pub use metadata::{MetadataFrame, ReadNumber, ALIGNMENT_COUNT_CAP};
pub use pool::WorkerPool;
