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

//! The per-spot metadata schema (§3) realized atop [`ColumnStore`]: one named accessor
//! per column instead of a bare column index, so callers never have to remember which
//! integer means `spot_id`.

use crate::column::{ColumnKind, ColumnStore};

mod col {
    pub const PRIMARY_ID_1: usize = 0;
    pub const PRIMARY_ID_2: usize = 1;
    pub const SPOT_ID: usize = 2;
    pub const FRAGMENT_ID: usize = 3;
    pub const FRAGMENT_LEN_1: usize = 4;
    pub const FRAGMENT_LEN_2: usize = 5;
    pub const ALIGNMENT_COUNT_1: usize = 6;
    pub const ALIGNMENT_COUNT_2: usize = 7;
    pub const PLATFORM: usize = 8;
    pub const UNMATED: usize = 9;
    pub const PCR_DUP: usize = 10;
    pub const UNALIGNED_1: usize = 11;
    pub const UNALIGNED_2: usize = 12;
    pub const HARDCLIPPED: usize = 13;
    pub const PRIMARY_IS_SET: usize = 14;
    pub const COUNT: usize = 15;
}

/// Saturating alignment-count counters cap at 254; 255 is reserved to mean "too many to
/// count exactly".
pub const ALIGNMENT_COUNT_CAP: u16 = 254;

/// Which mate a column or accessor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadNumber {
    One,
    Two,
}

fn schema() -> Vec<ColumnKind> {
    let mut kinds = vec![ColumnKind::U64; col::COUNT];
    kinds[col::FRAGMENT_ID] = ColumnKind::U32;
    kinds[col::FRAGMENT_LEN_1] = ColumnKind::U16;
    kinds[col::FRAGMENT_LEN_2] = ColumnKind::U16;
    kinds[col::ALIGNMENT_COUNT_1] = ColumnKind::U16;
    kinds[col::ALIGNMENT_COUNT_2] = ColumnKind::U16;
    kinds[col::PLATFORM] = ColumnKind::U16;
    kinds[col::UNMATED] = ColumnKind::Bit;
    kinds[col::PCR_DUP] = ColumnKind::Bit;
    kinds[col::UNALIGNED_1] = ColumnKind::Bit;
    kinds[col::UNALIGNED_2] = ColumnKind::Bit;
    kinds[col::HARDCLIPPED] = ColumnKind::Bit;
    kinds[col::PRIMARY_IS_SET] = ColumnKind::Bit;
    kinds
}

/// The per-spot metadata frame: every column named in §3's table, indexed by local row.
#[derive(Debug, Clone)]
pub struct MetadataFrame {
    store: ColumnStore,
}

impl Default for MetadataFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataFrame {
    pub fn new() -> Self {
        Self { store: ColumnStore::new(schema()) }
    }

    pub fn rows(&self) -> usize {
        self.store.rows()
    }

    pub fn optimize(&mut self) -> usize {
        self.store.optimize()
    }

    pub fn memory_used(&self) -> usize {
        self.store.memory_used()
    }

    fn read_col(&self, read: ReadNumber) -> usize {
        match read {
            ReadNumber::One => col::PRIMARY_ID_1,
            ReadNumber::Two => col::PRIMARY_ID_2,
        }
    }

    pub fn primary_id(&self, row: usize, read: ReadNumber) -> u64 {
        self.store.get_u64(self.read_col(read), row)
    }

    pub fn set_primary_id(&mut self, row: usize, read: ReadNumber, value: u64) {
        let c = self.read_col(read);
        self.store.set_u64(c, row, value);
    }

    pub fn spot_id(&self, row: usize) -> u64 {
        self.store.get_u64(col::SPOT_ID, row)
    }

    pub fn set_spot_id(&mut self, row: usize, value: u64) {
        self.store.set_u64(col::SPOT_ID, row, value);
    }

    pub fn fragment_id(&self, row: usize) -> u32 {
        self.store.get_u32(col::FRAGMENT_ID, row)
    }

    pub fn set_fragment_id(&mut self, row: usize, value: u32) {
        self.store.set_u32(col::FRAGMENT_ID, row, value);
    }

    fn fragment_len_col(&self, read: ReadNumber) -> usize {
        match read {
            ReadNumber::One => col::FRAGMENT_LEN_1,
            ReadNumber::Two => col::FRAGMENT_LEN_2,
        }
    }

    pub fn fragment_len(&self, row: usize, read: ReadNumber) -> u16 {
        self.store.get_u16(self.fragment_len_col(read), row)
    }

    /// Clipped read length, capped at 255 per §3.
    pub fn set_fragment_len(&mut self, row: usize, read: ReadNumber, len: usize) {
        let c = self.fragment_len_col(read);
        self.store.set_u16(c, row, len.min(255) as u16);
    }

    fn alignment_count_col(&self, read: ReadNumber) -> usize {
        match read {
            ReadNumber::One => col::ALIGNMENT_COUNT_1,
            ReadNumber::Two => col::ALIGNMENT_COUNT_2,
        }
    }

    pub fn alignment_count(&self, row: usize, read: ReadNumber) -> u16 {
        self.store.get_u16(self.alignment_count_col(read), row)
    }

    pub fn inc_alignment_count(&mut self, row: usize, read: ReadNumber) -> u16 {
        let c = self.alignment_count_col(read);
        self.store.inc_u16(c, row, ALIGNMENT_COUNT_CAP)
    }

    pub fn platform(&self, row: usize) -> u16 {
        self.store.get_u16(col::PLATFORM, row)
    }

    pub fn set_platform(&mut self, row: usize, value: u16) {
        self.store.set_u16(col::PLATFORM, row, value);
    }

    pub fn unmated(&self, row: usize) -> bool {
        self.store.get_bit(col::UNMATED, row)
    }

    pub fn set_unmated(&mut self, row: usize, value: bool) {
        self.store.set_bit(col::UNMATED, row, value);
    }

    pub fn pcr_dup(&self, row: usize) -> bool {
        self.store.get_bit(col::PCR_DUP, row)
    }

    pub fn set_pcr_dup(&mut self, row: usize, value: bool) {
        self.store.set_bit(col::PCR_DUP, row, value);
    }

    fn unaligned_col(&self, read: ReadNumber) -> usize {
        match read {
            ReadNumber::One => col::UNALIGNED_1,
            ReadNumber::Two => col::UNALIGNED_2,
        }
    }

    pub fn unaligned(&self, row: usize, read: ReadNumber) -> bool {
        self.store.get_bit(self.unaligned_col(read), row)
    }

    pub fn set_unaligned(&mut self, row: usize, read: ReadNumber, value: bool) {
        let c = self.unaligned_col(read);
        self.store.set_bit(c, row, value);
    }

    pub fn hardclipped(&self, row: usize) -> bool {
        self.store.get_bit(col::HARDCLIPPED, row)
    }

    pub fn set_hardclipped(&mut self, row: usize, value: bool) {
        self.store.set_bit(col::HARDCLIPPED, row, value);
    }

    pub fn primary_is_set(&self, row: usize, read: ReadNumber) -> bool {
        // `primary_is_set` is a single flag in §3's table, tracked per spot; read 1 and
        // read 2 share no separate bit there, so both reads observe the one column.
        let _ = read;
        self.store.get_bit(col::PRIMARY_IS_SET, row)
    }

    pub fn set_primary_is_set(&mut self, row: usize, value: bool) {
        self.store.set_bit(col::PRIMARY_IS_SET, row, value);
    }

    /// Clears the columns the Pass A solo-fragment emitter retires once a row's mate
    /// status is resolved: `fragment_*`, `fragment_len_*`, `platform`, `pcr_dup`.
    pub fn clear_post_solo_fragment(&mut self) {
        for c in [
            col::FRAGMENT_ID,
            col::FRAGMENT_LEN_1,
            col::FRAGMENT_LEN_2,
            col::PLATFORM,
            col::PCR_DUP,
        ] {
            self.store.clear(c);
        }
    }

    /// Drops every remaining metadata column once Pass B has snapshotted `spot_id` into
    /// the dense parallel array described in §3's lifecycle note.
    pub fn clear_all(&mut self) {
        for c in 0..col::COUNT {
            self.store.clear(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_round_trip() {
        let mut frame = MetadataFrame::new();
        frame.set_primary_id(3, ReadNumber::One, 7);
        frame.set_primary_id(3, ReadNumber::Two, 8);
        frame.set_spot_id(3, 99);
        frame.set_unmated(3, true);
        assert_eq!(frame.primary_id(3, ReadNumber::One), 7);
        assert_eq!(frame.primary_id(3, ReadNumber::Two), 8);
        assert_eq!(frame.spot_id(3), 99);
        assert!(frame.unmated(3));
        assert!(!frame.unmated(4));
    }

    #[test]
    fn fragment_len_caps_at_255() {
        let mut frame = MetadataFrame::new();
        frame.set_fragment_len(0, ReadNumber::One, 400);
        assert_eq!(frame.fragment_len(0, ReadNumber::One), 255);
    }

    #[test]
    fn clear_post_solo_fragment_retires_only_named_columns() {
        let mut frame = MetadataFrame::new();
        frame.set_fragment_id(0, 5);
        frame.set_spot_id(0, 42);
        frame.clear_post_solo_fragment();
        assert_eq!(frame.fragment_id(0), 0);
        assert_eq!(frame.spot_id(0), 42);
    }
}
