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

//! One disk-backed chunk: a single temp file bump-allocated from the front, with a
//! first-fit free list recycling space `free()` hands back. A [`crate::heap::MateBank`]
//! owns a growable vec of these per placement tier.

use std::io::{Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;
use spot_common::error::{LoaderError, Result};

/// A single fixed-capacity disk-backed region. `alloc` bump-allocates from `cursor`
/// until the chunk is full, falling back to a first-fit scan of `free_list` for space
/// reclaimed by earlier `free` calls once the chunk can no longer grow.
pub struct Chunk {
    file: Mutex<std::fs::File>,
    capacity: u64,
    cursor: Mutex<u64>,
    free_list: Mutex<Vec<(u64, u64)>>,
}

impl Chunk {
    pub fn create(capacity: u64) -> Result<Self> {
        let file = tempfile::tempfile().map_err(LoaderError::BankIo)?;
        Ok(Self {
            file: Mutex::new(file),
            capacity,
            cursor: Mutex::new(0),
            free_list: Mutex::new(Vec::new()),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reserves `size` contiguous bytes, preferring to bump-allocate from the unused
    /// tail and falling back to the first free-listed span big enough to hold it.
    /// Returns `None` if neither has room.
    pub fn try_alloc(&self, size: u64) -> Option<u64> {
        {
            let mut cursor = self.cursor.lock();
            if self.capacity - *cursor >= size {
                let offset = *cursor;
                *cursor += size;
                return Some(offset);
            }
        }
        let mut free_list = self.free_list.lock();
        if let Some(pos) = free_list.iter().position(|&(_, len)| len >= size) {
            let (offset, len) = free_list.remove(pos);
            if len > size {
                free_list.push((offset + size, len - size));
            }
            return Some(offset);
        }
        None
    }

    pub fn free(&self, offset: u64, size: u64) {
        self.free_list.lock().push((offset, size));
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(LoaderError::BankIo)?;
        file.write_all(buf).map_err(LoaderError::BankIo)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(LoaderError::BankIo)?;
        file.read_exact(buf).map_err(LoaderError::BankIo)?;
        Ok(())
    }

    /// Bytes currently reachable via bump allocation or free-list reuse, live or not;
    /// used only for diagnostics, not for the memory-budget sampler (this is disk, not
    /// RAM).
    pub fn used(&self) -> u64 {
        *self.cursor.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_until_full() {
        let chunk = Chunk::create(16).unwrap();
        assert_eq!(chunk.try_alloc(10), Some(0));
        assert_eq!(chunk.try_alloc(10), None, "only 6 bytes left");
        assert_eq!(chunk.try_alloc(6), Some(10));
    }

    #[test]
    fn freed_space_is_reused_first_fit() {
        let chunk = Chunk::create(16).unwrap();
        let a = chunk.try_alloc(8).unwrap();
        chunk.try_alloc(8).unwrap();
        assert_eq!(chunk.try_alloc(1), None, "chunk is full");
        chunk.free(a, 8);
        assert_eq!(chunk.try_alloc(4), Some(a));
    }

    #[test]
    fn write_then_read_round_trips() {
        let chunk = Chunk::create(64).unwrap();
        let offset = chunk.try_alloc(5).unwrap();
        chunk.write_at(offset, b"hello").unwrap();
        let mut buf = [0u8; 5];
        chunk.read_at(offset, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
