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

//! The sorted, succinct name dictionary a frozen [`crate::batch::Batch`] searches: every
//! name packed into one shared byte buffer instead of one heap allocation apiece, with a
//! parallel offset table marking where each name starts and ends.

/// A lexicographically sorted set of byte strings, stored back-to-back in one buffer.
///
/// Building one always goes through [`NameDictionary::from_sorted`]: the caller is
/// responsible for handing names in already-sorted order (the batch builder sorts the
/// hot map's keys before streaming them in), since re-sorting here would mean holding a
/// second, unsorted copy around just to throw it away.
#[derive(Debug, Clone)]
pub struct NameDictionary {
    buffer: Box<[u8]>,
    offsets: Box<[u32]>,
}

impl NameDictionary {
    /// Packs an already-sorted, duplicate-free sequence of names into one dictionary.
    ///
    /// # Panics
    /// Panics in debug builds if `names` is not sorted, or if the packed buffer would
    /// exceed `u32::MAX` bytes (a single batch is bounded well below that by the
    /// packing policy's `target_batch_size`).
    pub fn from_sorted<I, B>(names: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut buffer = Vec::new();
        let mut offsets = vec![0u32];
        #[cfg(debug_assertions)]
        let mut prev: Option<Vec<u8>> = None;
        for name in names {
            let name = name.as_ref();
            #[cfg(debug_assertions)]
            {
                if let Some(prev) = &prev {
                    debug_assert!(prev.as_slice() <= name, "names must be handed to NameDictionary in sorted order");
                }
                prev = Some(name.to_vec());
            }
            buffer.extend_from_slice(name);
            offsets.push(u32::try_from(buffer.len()).expect("packed dictionary exceeds u32::MAX bytes"));
        }
        Self { buffer: buffer.into_boxed_slice(), offsets: offsets.into_boxed_slice() }
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, position: usize) -> &[u8] {
        let start = self.offsets[position] as usize;
        let end = self.offsets[position + 1] as usize;
        &self.buffer[start..end]
    }

    /// The binary-search accelerator bound to this dictionary (the batch's "scanner"):
    /// returns the dictionary position of `name`, or the position it would be inserted at.
    pub fn binary_search(&self, name: &[u8]) -> Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.get(mid).cmp(name) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    pub fn memory_used(&self) -> usize {
        self.buffer.len() + self.offsets.len() * std::mem::size_of::<u32>()
    }
}
