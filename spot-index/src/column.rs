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

//! The fixed-schema columnar data frame (C2): parallel succinct bit / u16 / u32 / u64
//! columns, each indexed by the local row the owning [`crate::group::GroupIndex`] or
//! [`crate::batch::Batch`] assigned.
//!
//! A frame never knows what its columns *mean* - that vocabulary lives one layer up, in
//! [`crate::metadata::MetadataFrame`]. This module only knows how to grow, read, and
//! compact typed columns by index.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

/// The primitive type one column of a [`ColumnStore`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bit,
    U16,
    U32,
    U64,
}

#[derive(Debug, Clone)]
enum Column {
    Bit(BitVec<usize, Lsb0>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl Column {
    fn new(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Bit => Column::Bit(BitVec::new()),
            ColumnKind::U16 => Column::U16(Vec::new()),
            ColumnKind::U32 => Column::U32(Vec::new()),
            ColumnKind::U64 => Column::U64(Vec::new()),
        }
    }

    fn kind(&self) -> ColumnKind {
        match self {
            Column::Bit(_) => ColumnKind::Bit,
            Column::U16(_) => ColumnKind::U16,
            Column::U32(_) => ColumnKind::U32,
            Column::U64(_) => ColumnKind::U64,
        }
    }

    fn len(&self) -> usize {
        match self {
            Column::Bit(v) => v.len(),
            Column::U16(v) => v.len(),
            Column::U32(v) => v.len(),
            Column::U64(v) => v.len(),
        }
    }

    fn grow_to(&mut self, row: usize) {
        if row < self.len() {
            return;
        }
        match self {
            Column::Bit(v) => v.resize(row + 1, false),
            Column::U16(v) => v.resize(row + 1, 0),
            Column::U32(v) => v.resize(row + 1, 0),
            Column::U64(v) => v.resize(row + 1, 0),
        }
    }

    fn memory_used(&self) -> usize {
        match self {
            Column::Bit(v) => v.as_raw_slice().len() * std::mem::size_of::<usize>(),
            Column::U16(v) => v.capacity() * std::mem::size_of::<u16>(),
            Column::U32(v) => v.capacity() * std::mem::size_of::<u32>(),
            Column::U64(v) => v.capacity() * std::mem::size_of::<u64>(),
        }
    }

    fn shrink_to_fit(&mut self) {
        match self {
            Column::Bit(v) => v.shrink_to_fit(),
            Column::U16(v) => v.shrink_to_fit(),
            Column::U32(v) => v.shrink_to_fit(),
            Column::U64(v) => v.shrink_to_fit(),
        }
    }

    fn clear(&mut self) {
        match self {
            Column::Bit(v) => *v = BitVec::new(),
            Column::U16(v) => *v = Vec::new(),
            Column::U32(v) => *v = Vec::new(),
            Column::U64(v) => *v = Vec::new(),
        }
    }
}

/// A fixed-schema frame of parallel columns, each growable independently as rows are
/// first touched. Bit columns read `false`, integer columns read `0`, for any row never
/// written - there is no sentinel "unset" state beyond that default.
#[derive(Debug, Clone)]
pub struct ColumnStore {
    schema: Vec<ColumnKind>,
    columns: Vec<Column>,
}

impl ColumnStore {
    /// Builds an empty frame with the given column schema. `schema[i]` fixes the type of
    /// column `i` for the frame's lifetime.
    pub fn new(schema: Vec<ColumnKind>) -> Self {
        let columns = schema.iter().copied().map(Column::new).collect();
        Self { schema, columns }
    }

    pub fn schema(&self) -> &[ColumnKind] {
        &self.schema
    }

    fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    fn column_mut(&mut self, index: usize) -> &mut Column {
        &mut self.columns[index]
    }

    /// Number of rows any column would report if queried at its longest - columns grow
    /// independently, so this is the frame-wide high-water mark, not a per-column length.
    pub fn rows(&self) -> usize {
        self.columns.iter().map(Column::len).max().unwrap_or(0)
    }

    pub fn get_bit(&self, column_index: usize, row: usize) -> bool {
        match self.column(column_index) {
            Column::Bit(v) => v.get(row).map(|b| *b).unwrap_or(false),
            other => panic!("column {column_index} is {:?}, not Bit", other.kind()),
        }
    }

    pub fn set_bit(&mut self, column_index: usize, row: usize, value: bool) {
        let col = self.column_mut(column_index);
        col.grow_to(row);
        match col {
            Column::Bit(v) => v.set(row, value),
            other => panic!("column {column_index} is {:?}, not Bit", other.kind()),
        }
    }

    pub fn get_u16(&self, column_index: usize, row: usize) -> u16 {
        match self.column(column_index) {
            Column::U16(v) => v.get(row).copied().unwrap_or(0),
            other => panic!("column {column_index} is {:?}, not U16", other.kind()),
        }
    }

    pub fn set_u16(&mut self, column_index: usize, row: usize, value: u16) {
        let col = self.column_mut(column_index);
        col.grow_to(row);
        match col {
            Column::U16(v) => v[row] = value,
            other => panic!("column {column_index} is {:?}, not U16", other.kind()),
        }
    }

    /// Saturating increment capped at `cap` (the metadata schema uses `cap = 254`, 255
    /// being reserved to mean "too many to count"). Returns the value after the increment.
    pub fn inc_u16(&mut self, column_index: usize, row: usize, cap: u16) -> u16 {
        let col = self.column_mut(column_index);
        col.grow_to(row);
        match col {
            Column::U16(v) => {
                if v[row] < cap {
                    v[row] += 1;
                }
                v[row]
            }
            other => panic!("column {column_index} is {:?}, not U16", other.kind()),
        }
    }

    pub fn get_u32(&self, column_index: usize, row: usize) -> u32 {
        match self.column(column_index) {
            Column::U32(v) => v.get(row).copied().unwrap_or(0),
            other => panic!("column {column_index} is {:?}, not U32", other.kind()),
        }
    }

    pub fn set_u32(&mut self, column_index: usize, row: usize, value: u32) {
        let col = self.column_mut(column_index);
        col.grow_to(row);
        match col {
            Column::U32(v) => v[row] = value,
            other => panic!("column {column_index} is {:?}, not U32", other.kind()),
        }
    }

    pub fn get_u64(&self, column_index: usize, row: usize) -> u64 {
        match self.column(column_index) {
            Column::U64(v) => v.get(row).copied().unwrap_or(0),
            other => panic!("column {column_index} is {:?}, not U64", other.kind()),
        }
    }

    pub fn set_u64(&mut self, column_index: usize, row: usize, value: u64) {
        let col = self.column_mut(column_index);
        col.grow_to(row);
        match col {
            Column::U64(v) => v[row] = value,
            other => panic!("column {column_index} is {:?}, not U64", other.kind()),
        }
    }

    /// Copies `count` consecutive `u64` values starting at `first_row` out of `column_index`
    /// into `dst`. Used by the Pass B gatherer stage to pull a row-batch of metadata without
    /// per-row call overhead.
    pub fn extract_u64(&self, column_index: usize, first_row: usize, count: usize, dst: &mut Vec<u64>) {
        dst.clear();
        match self.column(column_index) {
            Column::U64(v) => {
                for row in first_row..first_row + count {
                    dst.push(v.get(row).copied().unwrap_or(0));
                }
            }
            other => panic!("column {column_index} is {:?}, not U64", other.kind()),
        }
    }

    /// Compresses every column in place, returning the new memory footprint. Safe to call
    /// concurrently with `optimize` on a *different* instance; the contract leaves it up to
    /// the caller to serialize this against mutating access on the *same* instance (the
    /// background batch builder and the single-threaded processor never touch the same
    /// frame once it is handed off, so no lock is needed here).
    pub fn optimize(&mut self) -> usize {
        for column in &mut self.columns {
            column.shrink_to_fit();
        }
        self.memory_used()
    }

    /// Drops storage for one column while keeping the frame's row count consistent for
    /// every other column (a cleared column simply reads back as all-default).
    pub fn clear(&mut self, column_index: usize) {
        self.columns[column_index].clear();
    }

    pub fn memory_used(&self) -> usize {
        self.columns.iter().map(Column::memory_used).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ColumnKind> {
        vec![ColumnKind::Bit, ColumnKind::U16, ColumnKind::U32, ColumnKind::U64]
    }

    #[test]
    fn unset_rows_read_as_default() {
        let store = ColumnStore::new(schema());
        assert!(!store.get_bit(0, 10));
        assert_eq!(store.get_u16(1, 10), 0);
        assert_eq!(store.get_u32(2, 10), 0);
        assert_eq!(store.get_u64(3, 10), 0);
    }

    #[test]
    fn out_of_range_writes_grow_the_column() {
        let mut store = ColumnStore::new(schema());
        store.set_u64(3, 1000, 42);
        assert_eq!(store.get_u64(3, 1000), 42);
        assert_eq!(store.get_u64(3, 999), 0);
    }

    #[test]
    fn saturating_inc_stops_at_cap() {
        let mut store = ColumnStore::new(schema());
        for _ in 0..300 {
            store.inc_u16(1, 0, 254);
        }
        assert_eq!(store.get_u16(1, 0), 254);
    }

    #[test]
    fn clear_resets_column_to_defaults() {
        let mut store = ColumnStore::new(schema());
        store.set_bit(0, 5, true);
        store.clear(0);
        assert!(!store.get_bit(0, 5));
    }

    #[test]
    fn extract_u64_pulls_a_contiguous_range() {
        let mut store = ColumnStore::new(schema());
        for row in 0..5 {
            store.set_u64(3, row, row as u64 * 10);
        }
        let mut dst = Vec::new();
        store.extract_u64(3, 1, 3, &mut dst);
        assert_eq!(dst, vec![10, 20, 30]);
    }
}
