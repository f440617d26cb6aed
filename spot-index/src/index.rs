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

//! [`SpotIndex`]: the whole-of-load view over every group (§3's "Group" partitioning),
//! the read-group name -> group-id registry, the single-group-mode collapse, and the
//! cross-group packing policy that keeps the hot window bounded (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use spot_common::error::{LoaderError, Result};
use spot_common::key::{KeyCodec, SpotKey};
use spot_filter::KeyFilter;

use crate::group::GroupIndex;
use crate::metadata::MetadataFrame;
use crate::pool::WorkerPool;

/// Name of the synthetic group every record is routed to once the load has collapsed
/// into single-group mode (§3).
const SINGLE_GROUP_NAME: &[u8] = b"";

/// Outcome of [`SpotIndex::find_or_insert`].
#[derive(Debug, Clone, Copy)]
pub struct IndexFindResult {
    pub key: SpotKey,
    pub was_inserted: bool,
}

/// The whole-of-load spot index: every [`GroupIndex`], the registry mapping read-group
/// names to group ids, and the packing policy that freezes hot windows under pressure.
pub struct SpotIndex {
    codec: KeyCodec,
    groups: Vec<GroupIndex>,
    group_ids: HashMap<Box<[u8]>, u32>,
    group_cap: u32,
    single_group_mode: bool,
    filter: KeyFilter,
    pool: Arc<WorkerPool>,
    cancel: Arc<AtomicBool>,
    target_batch_size: u32,
    insertions_since_probe: u64,
    insert_probe_interval: u64,
}

/// Default packing-policy batch size; callers may retune per the open question in §9.
pub const DEFAULT_TARGET_BATCH_SIZE: u32 = 1_000_000;

impl SpotIndex {
    pub fn new(codec: KeyCodec, filter: KeyFilter, pool: Arc<WorkerPool>, insert_probe_interval: u64, target_batch_size: u32) -> Self {
        Self {
            codec,
            groups: Vec::new(),
            group_ids: HashMap::new(),
            group_cap: codec.max_groups().min(u32::MAX as u64) as u32,
            single_group_mode: false,
            filter,
            pool,
            cancel: Arc::new(AtomicBool::new(false)),
            target_batch_size,
            insertions_since_probe: 0,
            insert_probe_interval,
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn filter(&self) -> &KeyFilter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut KeyFilter {
        &mut self.filter
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn is_single_group_mode(&self) -> bool {
        self.single_group_mode
    }

    /// Forces single-group mode before ingest begins, per §3: the host process checks
    /// the BAM header's distinct read-group count against `group_cap` up front and calls
    /// this instead of letting ingest discover the overflow mid-stream.
    pub fn force_single_group_mode(&mut self) {
        if self.single_group_mode {
            return;
        }
        self.single_group_mode = true;
        self.groups.clear();
        self.group_ids.clear();
        self.group_ids.insert(Box::from(SINGLE_GROUP_NAME), 0);
        self.groups.push(GroupIndex::new(Box::from(SINGLE_GROUP_NAME)));
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn total_spots(&self) -> u64 {
        self.groups.iter().map(GroupIndex::total_spots).sum()
    }

    /// Resolves a read-group name to its group id, creating a new group on first
    /// sighting. Returns [`LoaderError::TooManyGroups`] if this would exceed
    /// `group_cap` and the load has not already collapsed into single-group mode.
    pub fn group_id_for(&mut self, group_name: &[u8]) -> Result<u32> {
        if self.single_group_mode {
            return Ok(0);
        }
        if let Some(&id) = self.group_ids.get(group_name) {
            return Ok(id);
        }
        if self.groups.len() as u32 >= self.group_cap {
            return Err(LoaderError::TooManyGroups { found: self.groups.len() + 1, cap: self.group_cap as usize });
        }
        let id = self.groups.len() as u32;
        self.group_ids.insert(Box::from(group_name), id);
        self.groups.push(GroupIndex::new(Box::from(group_name)));
        Ok(id)
    }

    fn group_mut(&mut self, id: u32) -> &mut GroupIndex {
        &mut self.groups[id as usize]
    }

    pub fn group(&self, id: u32) -> &GroupIndex {
        &self.groups[id as usize]
    }

    /// The read-group's platform hint, once §4.6 step 2 has recorded one (outside
    /// single-group mode, where `platform` lives in the metadata column instead).
    pub fn group_platform(&self, group_id: u32) -> Option<u16> {
        self.groups[group_id as usize].platform()
    }

    pub fn set_group_platform(&mut self, group_id: u32, platform: u16) {
        self.groups[group_id as usize].set_platform(platform);
    }

    pub fn group_name(&self, group_id: u32) -> &[u8] {
        self.groups[group_id as usize].name()
    }

    /// The hot path (§4.4): resolves `(group_id, name)` to a stable [`SpotKey`],
    /// inserting a fresh row on first sighting. Runs the [`KeyFilter`] first so a
    /// plainly-never-seen name skips the hot-map probe entirely.
    pub fn find_or_insert(&mut self, group_id: u32, name: &[u8]) -> IndexFindResult {
        let seen = self.filter.seen(name);
        let hash = self.filter.last_hash();
        let result = if seen {
            self.group_mut(group_id).find_or_insert(name, hash, &self.pool)
        } else {
            // The filter has never observed this name: it cannot be in the hot map or
            // any frozen batch, so go straight to insertion without probing either.
            self.group_mut(group_id).insert_new(name, hash)
        };
        self.insertions_since_probe += 1;
        if self.insertions_since_probe >= self.insert_probe_interval {
            self.insertions_since_probe = 0;
            self.pack_heavy_groups();
        }
        IndexFindResult { key: self.codec.encode(group_id, result.row), was_inserted: result.was_inserted }
    }

    pub fn with_metadata<R>(&self, key: SpotKey, f: impl FnOnce(&MetadataFrame, usize) -> R) -> R {
        let (group, row) = self.codec.decode(key);
        self.groups[group as usize].with_metadata(row, f)
    }

    pub fn with_metadata_mut<R>(&mut self, key: SpotKey, f: impl FnOnce(&mut MetadataFrame, usize) -> R) -> R {
        let (group, row) = self.codec.decode(key);
        self.groups[group as usize].with_metadata_mut(row, f)
    }

    /// Visits every metadata row of one group in insertion order (§4.8 Pass A).
    pub fn for_each_row_mut(&mut self, group_id: u32, f: impl FnMut(u64, &mut MetadataFrame, usize)) {
        self.groups[group_id as usize].for_each_row_mut(f);
    }

    /// Retires the solo-fragment-only columns across every frame of one group (§4.8
    /// Pass A, run once the group's rows have all been visited).
    pub fn clear_post_solo_fragment_columns(&mut self, group_id: u32) {
        self.groups[group_id as usize].clear_post_solo_fragment_columns();
    }

    /// Encodes `(group_id, group_relative_row)` into a [`SpotKey`] using this index's
    /// codec; a thin convenience for callers (Pass A) that only have the row, not a
    /// pre-built key, in hand.
    pub fn encode_key(&self, group_id: u32, row: u64) -> SpotKey {
        self.codec.encode(group_id, row)
    }

    /// Pass B's dense `spot_id` snapshot (§3's lifecycle note), run across every group.
    pub fn snapshot_spot_ids(&mut self) {
        for group in &mut self.groups {
            group.snapshot_spot_ids();
        }
    }

    /// `spot_id` for `key`, from the dense snapshot if [`Self::snapshot_spot_ids`] has
    /// already run, otherwise straight from the live metadata (Pass C).
    pub fn spot_id_for(&self, key: SpotKey) -> u64 {
        let (group, row) = self.codec.decode(key);
        self.groups[group as usize].spot_id_at(row)
    }

    /// The packing policy of §4.4: invoked after every `insert_probe_interval`
    /// insertions. Freezes any group whose hot window alone exceeds the target size,
    /// then force-freezes proportionally among groups with at least a million hot rows,
    /// then keeps freezing the single largest hot window while the global total stays at
    /// or above twice the target.
    pub fn pack_heavy_groups(&mut self) {
        let target = self.target_batch_size;

        for idx in 0..self.groups.len() {
            if self.groups[idx].hot_rows() >= target {
                self.groups[idx].freeze(&self.pool, self.cancel.clone());
            }
        }

        const HEAVY_THRESHOLD: u32 = 1_000_000;
        let heavy: Vec<usize> = (0..self.groups.len()).filter(|&i| self.groups[i].hot_rows() >= HEAVY_THRESHOLD).collect();
        if !heavy.is_empty() {
            let candidates = heavy.len() as u64;
            let half_target = target as u64 / 2;
            let force_threshold = (candidates * half_target + half_target) / candidates;
            for idx in heavy {
                if self.groups[idx].hot_rows() as u64 >= force_threshold {
                    self.groups[idx].freeze(&self.pool, self.cancel.clone());
                }
            }
        }

        let two_target = 2u64 * target as u64;
        loop {
            let total: u64 = self.groups.iter().map(|g| g.hot_rows() as u64).sum();
            if total < two_target {
                break;
            }
            let Some((idx, _)) = self.groups.iter().enumerate().max_by_key(|(_, g)| g.hot_rows()) else {
                break;
            };
            if self.groups[idx].hot_rows() == 0 {
                break;
            }
            self.groups[idx].freeze(&self.pool, self.cancel.clone());
        }
    }

    /// Approximate resident memory of the whole index: every group's hot window and
    /// frozen batches, plus the key filter's bitmaps. Used by the memory-budget sampler.
    pub fn memory_used(&self) -> usize {
        self.filter.memory_used() + self.groups.iter().map(GroupIndex::memory_used).sum::<usize>()
    }

    /// Replaces the active [`KeyFilter`] tier, replaying every name currently live in
    /// every group's hot map (§3's filter-upgrade rule: "every previously inserted name
    /// is replayed through the new variant"). Frozen batches no longer retain names once
    /// their hot map is released, so an upgrade must happen before those batches' hot
    /// maps are dropped, or the replay set is necessarily incomplete for that portion of
    /// the load - in practice upgrades are sequenced early, well before the first freeze.
    pub fn upgrade_filter(&mut self, tier: spot_filter::Tier) {
        // Collected rather than streamed: rebuild must see a stable snapshot since the
        // hot maps keep mutating concurrently with nothing else during a synchronous
        // load (single-threaded processor), so this is safe and simple.
        let mut names: Vec<Box<[u8]>> = Vec::new();
        for group in &self.groups {
            names.extend(group.live_names());
        }
        self.filter.rebuild_from(tier, names.iter().map(|n| n.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_index(target_batch_size: u32) -> SpotIndex {
        let codec = KeyCodec::default();
        let filter = KeyFilter::new(spot_filter::Tier::Small);
        let pool = WorkerPool::new(2);
        SpotIndex::new(codec, filter, pool, 10_000_000, target_batch_size)
    }

    #[test]
    fn repeat_name_never_reinserts() {
        let mut index = build_index(DEFAULT_TARGET_BATCH_SIZE);
        let group = index.group_id_for(b"rg1").unwrap();
        let a = index.find_or_insert(group, b"A");
        let b = index.find_or_insert(group, b"A");
        assert!(a.was_inserted);
        assert!(!b.was_inserted);
        assert_eq!(a.key.raw(), b.key.raw());
    }

    #[test]
    fn group_cap_enforced_until_single_group_collapse() {
        let codec = KeyCodec::new(2); // cap = 4 groups
        let filter = KeyFilter::new(spot_filter::Tier::Small);
        let pool = WorkerPool::new(1);
        let mut index = SpotIndex::new(codec, filter, pool, 10_000_000, DEFAULT_TARGET_BATCH_SIZE);
        for i in 0..4 {
            index.group_id_for(format!("rg{i}").as_bytes()).unwrap();
        }
        assert!(index.group_id_for(b"rg_overflow").is_err());
        index.force_single_group_mode();
        assert_eq!(index.group_id_for(b"rg_overflow").unwrap(), 0);
        assert_eq!(index.group_id_for(b"rg0").unwrap(), 0);
    }

    #[test]
    fn packing_freezes_groups_at_or_above_target() {
        let mut index = build_index(16);
        let group = index.group_id_for(b"rg1").unwrap();
        for i in 0..20u32 {
            index.find_or_insert(group, format!("name-{i}").as_bytes());
        }
        index.pack_heavy_groups();
        assert_eq!(index.group(group).batches().len(), 1, "hot window at/over target must freeze");
        assert!(index.group(group).hot_rows() < 16);
    }

    #[test]
    fn key_round_trips_through_decode() {
        let mut index = build_index(DEFAULT_TARGET_BATCH_SIZE);
        let group = index.group_id_for(b"rg1").unwrap();
        let result = index.find_or_insert(group, b"A");
        let (decoded_group, decoded_row) = index.codec().decode(result.key);
        assert_eq!(decoded_group, group);
        assert_eq!(decoded_row, 0);
    }
}
