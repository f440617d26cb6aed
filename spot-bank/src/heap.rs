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

//! The Mate Bank (C7): a variable-size blob heap over two pools of disk-backed
//! [`crate::chunk::Chunk`]s, indexed by a `u32` handle. A blob holds one read's data
//! while its mate is awaited; callers serialize the fragment header, sequence,
//! qualities, and group labels of the loader's per-read data model themselves - this
//! crate only ever sees bytes.

use parking_lot::Mutex;
use spot_common::error::{LoaderError, Result};

use crate::chunk::Chunk;

/// Hints which chunk pool should host a blob. Sizes the large pool around half the
/// configured cache size and the small pool a quarter of that (§4.7). Resolved here as:
/// a read expected to find its mate nearby in the stream (and so be freed again soon)
/// goes to the small pool, where churn is cheap; a read expected to wait a long time for
/// a cross-reference mate goes to the large pool, where fewer, bigger chunks amortize
/// per-chunk bookkeeping over a longer residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Mate expected to arrive soon (e.g. same reference region).
    Near,
    /// Mate expected to be distant (e.g. a cross-reference or unmapped pairing).
    Far,
}

struct Slot {
    pool: Pool,
    chunk: usize,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Small,
    Large,
}

/// Chunk configuration for a [`MateBank`]. Defaults follow §4.7: the large chunk is
/// about half the configured cache size, the small chunk a quarter of the large one.
#[derive(Debug, Clone, Copy)]
pub struct MateBankConfig {
    pub large_chunk_size: u64,
    pub small_chunk_size: u64,
}

impl MateBankConfig {
    /// Derives chunk sizes from a cache-size hint, per §4.7's stated defaults.
    pub fn from_cache_size(cache_size: u64) -> Self {
        let large_chunk_size = (cache_size / 2).max(1);
        let small_chunk_size = (large_chunk_size / 4).max(1);
        Self { large_chunk_size, small_chunk_size }
    }
}

impl Default for MateBankConfig {
    fn default() -> Self {
        // A conservative default independent of any host cache-size hint: 64 MiB large
        // chunks, 16 MiB small chunks.
        Self { large_chunk_size: 64 << 20, small_chunk_size: 16 << 20 }
    }
}

/// The variable-size blob heap described above. `u32::MAX` blobs can be live at once;
/// handle `0` is never issued, matching the metadata schema's "0 = none" convention for
/// `fragment_id`.
pub struct MateBank {
    config: MateBankConfig,
    small_chunks: Mutex<Vec<Chunk>>,
    large_chunks: Mutex<Vec<Chunk>>,
    slots: Mutex<Vec<Option<Slot>>>,
    free_handles: Mutex<Vec<u32>>,
}

impl MateBank {
    pub fn new(config: MateBankConfig) -> Self {
        Self {
            config,
            small_chunks: Mutex::new(Vec::new()),
            large_chunks: Mutex::new(Vec::new()),
            slots: Mutex::new(vec![None]), // index 0 reserved, never issued as a handle
            free_handles: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a `size`-byte blob in the pool `placement` favors. The blob is
    /// uninitialized; callers write their fragment payload with [`Self::write`] before
    /// anyone else reads it.
    pub fn alloc(&self, size: u64, placement: Placement) -> Result<u32> {
        let pool = match placement {
            Placement::Near => Pool::Small,
            Placement::Far => Pool::Large,
        };
        let chunk_size = match pool {
            Pool::Small => self.config.small_chunk_size,
            Pool::Large => self.config.large_chunk_size,
        };
        let mut chunks = match pool {
            Pool::Small => self.small_chunks.lock(),
            Pool::Large => self.large_chunks.lock(),
        };

        for (idx, chunk) in chunks.iter().enumerate() {
            if let Some(offset) = chunk.try_alloc(size) {
                drop(chunks);
                return Ok(self.install(Slot { pool, chunk: idx, offset, size }));
            }
        }

        let new_chunk = Chunk::create(chunk_size.max(size))?;
        let offset = new_chunk.try_alloc(size).expect("freshly created chunk sized to fit this allocation");
        let idx = chunks.len();
        chunks.push(new_chunk);
        drop(chunks);
        Ok(self.install(Slot { pool, chunk: idx, offset, size }))
    }

    fn install(&self, slot: Slot) -> u32 {
        let mut slots = slots_or_panic(&self.slots);
        if let Some(handle) = self.free_handles.lock().pop() {
            slots[handle as usize] = Some(slot);
            handle
        } else {
            slots.push(Some(slot));
            (slots.len() - 1) as u32
        }
    }

    fn chunk(&self, pool: Pool, index: usize) -> parking_lot::MappedMutexGuard<'_, Chunk> {
        match pool {
            Pool::Small => parking_lot::MutexGuard::map(self.small_chunks.lock(), |chunks| &mut chunks[index]),
            Pool::Large => parking_lot::MutexGuard::map(self.large_chunks.lock(), |chunks| &mut chunks[index]),
        }
    }

    fn slot(&self, handle: u32) -> Slot {
        let slots = slots_or_panic(&self.slots);
        match slots.get(handle as usize).and_then(|s| s.as_ref()) {
            Some(slot) => Slot { pool: slot.pool, chunk: slot.chunk, offset: slot.offset, size: slot.size },
            None => panic!("mate bank handle {handle} is not live"),
        }
    }

    pub fn size(&self, handle: u32) -> u64 {
        self.slot(handle).size
    }

    pub fn write(&self, handle: u32, offset: u64, buf: &[u8]) -> Result<()> {
        let slot = self.slot(handle);
        self.bounds_check(&slot, offset, buf.len() as u64)?;
        self.chunk(slot.pool, slot.chunk).write_at(slot.offset + offset, buf)
    }

    pub fn read(&self, handle: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let slot = self.slot(handle);
        self.bounds_check(&slot, offset, buf.len() as u64)?;
        self.chunk(slot.pool, slot.chunk).read_at(slot.offset + offset, buf)
    }

    fn bounds_check(&self, slot: &Slot, offset: u64, len: u64) -> Result<()> {
        if offset + len > slot.size {
            return Err(LoaderError::BankIo(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("mate bank access [{offset}, {}) exceeds blob size {}", offset + len, slot.size),
            )));
        }
        Ok(())
    }

    /// Releases `handle`'s backing bytes for reuse and frees the handle itself.
    pub fn free(&self, handle: u32) {
        let slot = {
            let mut slots = slots_or_panic(&self.slots);
            slots[handle as usize].take().expect("double free of mate bank handle")
        };
        self.chunk(slot.pool, slot.chunk).free(slot.offset, slot.size);
        self.free_handles.lock().push(handle);
    }

    /// Disk bytes currently reserved across every chunk (live and free-listed); a
    /// diagnostic, not an input to the RAM budget sampler.
    pub fn disk_used(&self) -> u64 {
        let small: u64 = self.small_chunks.lock().iter().map(Chunk::used).sum();
        let large: u64 = self.large_chunks.lock().iter().map(Chunk::used).sum();
        small + large
    }
}

fn slots_or_panic(mutex: &Mutex<Vec<Option<Slot>>>) -> parking_lot::MutexGuard<'_, Vec<Option<Slot>>> {
    mutex.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> MateBank {
        MateBank::new(MateBankConfig { large_chunk_size: 256, small_chunk_size: 64 })
    }

    #[test]
    fn alloc_write_read_round_trips() {
        let bank = bank();
        let handle = bank.alloc(5, Placement::Near).unwrap();
        assert_ne!(handle, 0);
        bank.write(handle, 0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        bank.read(handle, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(bank.size(handle), 5);
    }

    #[test]
    fn freed_handles_are_recycled() {
        let bank = bank();
        let a = bank.alloc(4, Placement::Near).unwrap();
        bank.free(a);
        let b = bank.alloc(4, Placement::Near).unwrap();
        assert_eq!(a, b, "freeing a handle must make it available for reuse");
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let bank = bank();
        let handle = bank.alloc(4, Placement::Far).unwrap();
        let mut buf = [0u8; 8];
        assert!(bank.read(handle, 0, &mut buf).is_err());
    }

    #[test]
    fn oversized_blob_still_allocates_its_own_chunk() {
        let bank = bank();
        let handle = bank.alloc(1000, Placement::Near).unwrap();
        bank.write(handle, 0, &vec![7u8; 1000]).unwrap();
        let mut buf = vec![0u8; 1000];
        bank.read(handle, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let bank = bank();
        let handle = bank.alloc(4, Placement::Near).unwrap();
        bank.free(handle);
        bank.free(handle);
    }
}
