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

//! Per-group spot assembly (C4): the ordered arena of a group's frozen [`Batch`]es plus
//! its still-mutable hot window, and the `find_or_insert` hot path that ties the
//! [`spot_filter::KeyFilter`] to the hot map to the frozen-batch fan-out search.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::bounded;
use hashbrown::hash_map::RawEntryMut;
use spot_filter::KeyFilter;

use crate::batch::Batch;
use crate::metadata::MetadataFrame;
use crate::pool::WorkerPool;

/// The hot, still-mutable name -> local-row map of one group's unfrozen tail.
///
/// Lookups and inserts go through `raw_entry_mut` so the caller can hand in the hash
/// [`KeyFilter::last_hash`] already computed, instead of rehashing the name here.
pub type HotMap = hashbrown::HashMap<Box<[u8]>, u32>;

pub fn new_hot_map() -> HotMap {
    HotMap::new()
}

pub fn new_hot_map_with_capacity(capacity: usize) -> HotMap {
    HotMap::with_capacity(capacity)
}

/// Outcome of [`GroupIndex::find_or_insert`].
#[derive(Debug, Clone, Copy)]
pub struct FindResult {
    /// The group-relative row index (`offset + local_row` in §3's vocabulary): stable
    /// for the remainder of the load, used as the low bits of a [`spot_common::SpotKey`].
    pub row: u64,
    pub was_inserted: bool,
}

/// One group's batches plus its hot window (§3's "Group state").
pub struct GroupIndex {
    name: Box<[u8]>,
    batches: Vec<Arc<Batch>>,
    hot_map: HotMap,
    hot_metadata: MetadataFrame,
    offset: u64,
    curr_row: u32,
    total_spots: u64,
    platform: Option<u16>,
    spot_ids: Option<Box<[u64]>>,
}

impl GroupIndex {
    pub fn new(name: impl Into<Box<[u8]>>) -> Self {
        Self {
            name: name.into(),
            batches: Vec::new(),
            hot_map: new_hot_map(),
            hot_metadata: MetadataFrame::new(),
            offset: 0,
            curr_row: 0,
            total_spots: 0,
            platform: None,
            spot_ids: None,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn total_spots(&self) -> u64 {
        self.total_spots
    }

    pub fn hot_rows(&self) -> u32 {
        self.curr_row
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn batches(&self) -> &[Arc<Batch>] {
        &self.batches
    }

    pub fn platform(&self) -> Option<u16> {
        self.platform
    }

    pub fn set_platform(&mut self, platform: u16) {
        self.platform = Some(platform);
    }

    /// The hot path (§4.4): resolves `name` to its group-relative row, inserting a fresh
    /// row on first sighting. `hash` is the precomputed [`KeyFilter::last_hash`] for
    /// `name`, reused for the hot-map probe rather than rehashed.
    pub fn find_or_insert(&mut self, name: &[u8], hash: u64, pool: &WorkerPool) -> FindResult {
        if let Some(&row) = self.hot_map_get(name, hash) {
            return FindResult { row: self.offset + row as u64, was_inserted: false };
        }
        if let Some(row) = self.search_frozen(name, pool) {
            return FindResult { row, was_inserted: false };
        }
        self.insert_new(name, hash)
    }

    /// Step 4 of §4.4's algorithm on its own: inserts `name` as a fresh row without
    /// probing the hot map or any frozen batch first. Used when the [`KeyFilter`] has
    /// already answered "never seen" for `name`, which makes both of those probes
    /// provably unnecessary.
    pub fn insert_new(&mut self, name: &[u8], hash: u64) -> FindResult {
        let row = self.curr_row;
        self.hot_map_insert(name, hash, row);
        self.curr_row += 1;
        self.total_spots += 1;
        FindResult { row: self.offset + row as u64, was_inserted: true }
    }

    /// Every name currently live in the hot map, for a [`spot_filter::KeyFilter`]
    /// rebuild replay. Frozen batches have already released theirs once queried past
    /// `ready` (§4.3); a filter upgrade must happen before that point to see them.
    pub fn live_names(&self) -> impl Iterator<Item = Box<[u8]>> + '_ {
        self.hot_map.keys().cloned()
    }

    fn hot_map_get(&self, name: &[u8], hash: u64) -> Option<&u32> {
        match self.hot_map.raw_entry().from_hash(hash, |k| k.as_ref() == name) {
            Some((_, row)) => Some(row),
            None => None,
        }
    }

    fn hot_map_insert(&mut self, name: &[u8], hash: u64, row: u32) {
        match self.hot_map.raw_entry_mut().from_hash(hash, |k| k.as_ref() == name) {
            RawEntryMut::Occupied(mut occupied) => {
                occupied.insert(row);
            }
            RawEntryMut::Vacant(vacant) => {
                vacant.insert_with_hasher(hash, name.to_vec().into_boxed_slice(), row, |k| {
                    spot_filter::fnv1a_64(k)
                });
            }
        }
    }

    /// Fans out a binary search across every frozen batch, newest-first, on the shared
    /// worker pool; the first batch to find `name` wins and every other search is told
    /// (best-effort) to skip its own work.
    fn search_frozen(&self, name: &[u8], pool: &WorkerPool) -> Option<u64> {
        if self.batches.is_empty() {
            return None;
        }
        let found: Arc<parking_lot::Mutex<Option<u64>>> = Arc::new(parking_lot::Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        let name: Arc<[u8]> = Arc::from(name);
        let (tx, rx) = bounded::<()>(self.batches.len());

        for batch in self.batches.iter().rev().cloned() {
            let found = found.clone();
            let done = done.clone();
            let name = name.clone();
            let tx = tx.clone();
            pool.spawn(Box::new(move || {
                if !done.load(Ordering::Acquire) {
                    if let Some(local_row) = batch.find(&name) {
                        let mut slot = found.lock();
                        if slot.is_none() {
                            *slot = Some(batch.offset() + local_row as u64);
                        }
                        done.store(true, Ordering::Release);
                    }
                }
                let _ = tx.send(());
            }));
        }

        for _ in 0..self.batches.len() {
            let _ = rx.recv();
        }
        let result = *found.lock();
        result
    }

    /// Accesses the metadata frame owning `row` (hot window or a frozen batch),
    /// resolving to a read lock transparently on the caller's behalf.
    pub fn with_metadata<R>(&self, row: u64, f: impl FnOnce(&MetadataFrame, usize) -> R) -> R {
        if row >= self.offset {
            f(&self.hot_metadata, (row - self.offset) as usize)
        } else {
            let batch = self.batch_containing(row);
            let guard = batch.metadata().read();
            f(&guard, (row - batch.offset()) as usize)
        }
    }

    /// As [`Self::with_metadata`] but takes a write lock / direct mutable borrow.
    pub fn with_metadata_mut<R>(&mut self, row: u64, f: impl FnOnce(&mut MetadataFrame, usize) -> R) -> R {
        if row >= self.offset {
            f(&mut self.hot_metadata, (row - self.offset) as usize)
        } else {
            let batch = self.batch_containing(row);
            let mut guard = batch.metadata().write();
            f(&mut guard, (row - batch.offset()) as usize)
        }
    }

    /// Visits every metadata row owned by this group, oldest batch first and the hot
    /// window last, matching insertion order (§4.8 Pass A: "iterate every metadata row
    /// across every group and every batch in insertion order"). `f` receives the
    /// group-relative row (suitable for [`spot_common::KeyCodec::encode`]), the frame
    /// owning it, and the row's index within that frame.
    pub fn for_each_row_mut(&mut self, mut f: impl FnMut(u64, &mut MetadataFrame, usize)) {
        for batch in &self.batches {
            let mut guard = batch.metadata().write();
            for local_row in 0..batch.batch_size() as usize {
                f(batch.offset() + local_row as u64, &mut guard, local_row);
            }
        }
        for local_row in 0..self.curr_row as usize {
            f(self.offset + local_row as u64, &mut self.hot_metadata, local_row);
        }
    }

    /// Retires the columns Pass A clears once every row's mate status is resolved
    /// (`fragment_*`, `fragment_len_*`, `platform`, `pcr_dup`), across every frame this
    /// group owns.
    pub fn clear_post_solo_fragment_columns(&mut self) {
        for batch in &self.batches {
            batch.metadata().write().clear_post_solo_fragment();
        }
        self.hot_metadata.clear_post_solo_fragment();
    }

    /// Pass B's per-group `spot_id` snapshot (§3's lifecycle note): copies every row's
    /// `spot_id` into one dense array indexed by group-relative row, then drops every
    /// remaining metadata column. After this call, [`Self::with_metadata`] /
    /// [`Self::with_metadata_mut`] still work but read back only defaults; callers must
    /// use [`Self::spot_id_at`] for `spot_id` from this point on.
    pub fn snapshot_spot_ids(&mut self) {
        let total_rows = (self.offset + self.curr_row as u64) as usize;
        let mut spot_ids = vec![0u64; total_rows];
        for batch in &self.batches {
            let mut guard = batch.metadata().write();
            let base = batch.offset() as usize;
            for local_row in 0..batch.batch_size() as usize {
                spot_ids[base + local_row] = guard.spot_id(local_row);
            }
            guard.clear_all();
        }
        let base = self.offset as usize;
        for local_row in 0..self.curr_row as usize {
            spot_ids[base + local_row] = self.hot_metadata.spot_id(local_row);
        }
        self.hot_metadata.clear_all();
        self.spot_ids = Some(spot_ids.into_boxed_slice());
    }

    /// `spot_id` for a group-relative row, from the dense snapshot if
    /// [`Self::snapshot_spot_ids`] has already run, otherwise straight from the live
    /// metadata.
    pub fn spot_id_at(&self, row: u64) -> u64 {
        match &self.spot_ids {
            Some(dense) => dense[row as usize],
            None => self.with_metadata(row, |frame, local_row| frame.spot_id(local_row)),
        }
    }

    fn batch_containing(&self, row: u64) -> Arc<Batch> {
        self.batches
            .iter()
            .find(|b| row >= b.offset() && row < b.offset() + b.batch_size() as u64)
            .cloned()
            .unwrap_or_else(|| panic!("row {row} not covered by any batch or the hot window of group {:?}", String::from_utf8_lossy(&self.name)))
    }

    /// Freezes the hot window into a new batch and schedules its background build.
    /// Returns `false` if the hot window was empty (nothing to freeze).
    pub fn freeze(&mut self, pool: &WorkerPool, cancel: Arc<AtomicBool>) -> bool {
        if self.curr_row == 0 {
            return false;
        }
        let expected_capacity = self.curr_row as usize;
        let hot_map = std::mem::replace(&mut self.hot_map, new_hot_map_with_capacity(expected_capacity));
        let hot_metadata = std::mem::take(&mut self.hot_metadata);
        let batch = Batch::begin_freeze(self.offset, self.curr_row, hot_map, hot_metadata);
        self.offset += self.curr_row as u64;
        self.curr_row = 0;
        self.batches.push(batch.clone());
        pool.spawn(Box::new(move || batch.build(&cancel)));
        true
    }

    pub fn memory_used(&self) -> usize {
        let hot = self.hot_metadata.memory_used() + self.hot_map.iter().map(|(k, _)| k.len() + std::mem::size_of::<u32>()).sum::<usize>();
        let frozen: usize = self.batches.iter().map(|b| b.memory_used()).sum();
        hot + frozen
    }
}

impl std::fmt::Debug for GroupIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupIndex")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("batches", &self.batches.len())
            .field("offset", &self.offset)
            .field("curr_row", &self.curr_row)
            .field("total_spots", &self.total_spots)
            .finish()
    }
}

/// Convenience used by callers who already hold a [`spot_filter::KeyFilter`] and want
/// one call that both queries it and feeds its hash into `find_or_insert`.
pub fn find_or_insert_with_filter(
    group: &mut GroupIndex,
    filter: &mut KeyFilter,
    name: &[u8],
    pool: &WorkerPool,
) -> FindResult {
    filter.seen(name);
    group.find_or_insert(name, filter.last_hash(), pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<WorkerPool> {
        WorkerPool::new(2)
    }

    #[test]
    fn first_sighting_inserts_and_repeat_finds() {
        let mut group = GroupIndex::new(b"rg1".to_vec().into_boxed_slice());
        let pool = pool();
        let hash = spot_filter::fnv1a_64(b"SRR1.1");
        let a = group.find_or_insert(b"SRR1.1", hash, &pool);
        assert!(a.was_inserted);
        let b = group.find_or_insert(b"SRR1.1", hash, &pool);
        assert!(!b.was_inserted);
        assert_eq!(a.row, b.row);
    }

    #[test]
    fn distinct_names_get_distinct_rows() {
        let mut group = GroupIndex::new(Box::from(&b""[..]));
        let pool = pool();
        let a = group.find_or_insert(b"A", spot_filter::fnv1a_64(b"A"), &pool);
        let b = group.find_or_insert(b"B", spot_filter::fnv1a_64(b"B"), &pool);
        assert_ne!(a.row, b.row);
    }

    #[test]
    fn freeze_then_find_via_frozen_batch() {
        let mut group = GroupIndex::new(Box::from(&b""[..]));
        let pool = pool();
        let cancel = Arc::new(AtomicBool::new(false));
        let hash_a = spot_filter::fnv1a_64(b"A");
        let first = group.find_or_insert(b"A", hash_a, &pool);
        assert!(group.freeze(&pool, cancel.clone()));
        // give the background build a moment; search_frozen tolerates the building
        // state by falling back to the batch's retained hot map regardless.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = group.find_or_insert(b"A", hash_a, &pool);
        assert!(!second.was_inserted);
        assert_eq!(first.row, second.row);
    }

    #[test]
    fn empty_hot_window_does_not_freeze() {
        let mut group = GroupIndex::new(Box::from(&b""[..]));
        let pool = pool();
        assert!(!group.freeze(&pool, Arc::new(AtomicBool::new(false))));
    }

    #[test]
    fn for_each_row_mut_visits_batches_then_hot_window_in_order() {
        let mut group = GroupIndex::new(Box::from(&b""[..]));
        let pool = pool();
        let cancel = Arc::new(AtomicBool::new(false));
        group.find_or_insert(b"A", spot_filter::fnv1a_64(b"A"), &pool);
        group.freeze(&pool, cancel.clone());
        group.find_or_insert(b"B", spot_filter::fnv1a_64(b"B"), &pool);

        let mut visited = Vec::new();
        group.for_each_row_mut(|row, frame, local_row| {
            frame.set_spot_id(local_row, row + 100);
            visited.push(row);
        });
        assert_eq!(visited, vec![0, 1], "batch row then hot-window row, in that order");
    }

    #[test]
    fn snapshot_spot_ids_preserves_values_and_drops_metadata() {
        let mut group = GroupIndex::new(Box::from(&b""[..]));
        let pool = pool();
        group.find_or_insert(b"A", spot_filter::fnv1a_64(b"A"), &pool);
        group.find_or_insert(b"B", spot_filter::fnv1a_64(b"B"), &pool);
        group.with_metadata_mut(0, |frame, row| frame.set_spot_id(row, 7));
        group.with_metadata_mut(1, |frame, row| frame.set_spot_id(row, 9));
        group.with_metadata_mut(0, |frame, row| frame.set_primary_id(row, crate::metadata::ReadNumber::One, 42));

        group.snapshot_spot_ids();
        assert_eq!(group.spot_id_at(0), 7);
        assert_eq!(group.spot_id_at(1), 9);
        // Every other column was dropped by the snapshot.
        assert_eq!(group.with_metadata(0, |frame, row| frame.primary_id(row, crate::metadata::ReadNumber::One)), 0);
    }
}
