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

//! The frozen volume (C3): a sorted name dictionary plus row index, built on a
//! background worker from the hot window a group just froze, with a lazy building-state
//! fallback to the still-live hot map it was built from.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::dictionary::NameDictionary;
use crate::group::HotMap;
use crate::metadata::MetadataFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Building,
    Ready,
}

struct ReadyData {
    dict: NameDictionary,
    index: Box<[u32]>,
}

/// One frozen slice of a group: `offset` and `batch_size` fix the global row range it
/// covers, `data`/`index` (once built) answer `find`, and `metadata` stays mutable for
/// the remainder of the load (only the name index is frozen - later records can still
/// update a row's counters, primary ids, and spot id).
pub struct Batch {
    offset: u64,
    batch_size: u32,
    ready: OnceLock<ReadyData>,
    hot_map: Mutex<Option<HotMap>>,
    metadata: RwLock<MetadataFrame>,
    dict_memory: AtomicUsize,
}

impl Batch {
    /// Begins a freeze: takes ownership of the group's hot map and hot metadata. The
    /// batch is immediately queryable (via the still-live hot map) even though its
    /// sorted dictionary has not been built yet.
    pub fn begin_freeze(offset: u64, batch_size: u32, hot_map: HotMap, metadata: MetadataFrame) -> Arc<Self> {
        Arc::new(Self {
            offset,
            batch_size,
            ready: OnceLock::new(),
            hot_map: Mutex::new(Some(hot_map)),
            metadata: RwLock::new(metadata),
            dict_memory: AtomicUsize::new(0),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn state(&self) -> BatchState {
        if self.ready.get().is_some() {
            BatchState::Ready
        } else {
            BatchState::Building
        }
    }

    pub fn metadata(&self) -> &RwLock<MetadataFrame> {
        &self.metadata
    }

    pub fn memory_used(&self) -> usize {
        self.dict_memory.load(Ordering::Relaxed) + self.metadata.read().memory_used()
    }

    /// The background build procedure (§4.3 steps 1-6), run off the processor thread.
    /// Aborts without publishing if `stop_packing` is observed set at any checkpoint.
    pub fn build(&self, stop_packing: &AtomicBool) {
        if stop_packing.load(Ordering::Acquire) {
            return;
        }
        let entries: Vec<(Box<[u8]>, u32)> = {
            let guard = self.hot_map.lock();
            match guard.as_ref() {
                Some(map) => map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                None => return,
            }
        };
        if stop_packing.load(Ordering::Acquire) {
            return;
        }

        let mut entries = entries;
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        if stop_packing.load(Ordering::Acquire) {
            return;
        }

        let index: Box<[u32]> = entries.iter().map(|(_, row)| *row).collect();
        let dict = NameDictionary::from_sorted(entries.iter().map(|(name, _)| name.as_ref()));

        if stop_packing.load(Ordering::Acquire) {
            return;
        }

        self.dict_memory
            .store(dict.memory_used() + index.len() * std::mem::size_of::<u32>(), Ordering::Relaxed);

        // Release fence: any thread that subsequently observes `ready` populated via
        // `OnceLock::get` also observes the fully constructed dictionary and index.
        let _ = self.ready.set(ReadyData { dict, index });
    }

    /// `find(name) -> Option<local_row>`. After `ready`, a binary search over the sorted
    /// dictionary; before `ready`, a lookup against the hot map this batch was built
    /// from. The first call that observes `ready` populated also drops that hot map.
    pub fn find(&self, name: &[u8]) -> Option<u32> {
        if let Some(ready) = self.ready.get() {
            self.release_hot_map();
            return ready.dict.binary_search(name).ok().map(|position| ready.index[position]);
        }
        let guard = self.hot_map.lock();
        guard.as_ref().and_then(|map| map.get(name).copied())
    }

    fn release_hot_map(&self) {
        let mut guard = self.hot_map.lock();
        guard.take();
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("offset", &self.offset)
            .field("batch_size", &self.batch_size)
            .field("state", &self.state())
            .finish()
    }
}
