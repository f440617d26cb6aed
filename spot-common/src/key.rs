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

//! 64-bit opaque spot key: `(group, local_row)` packed so the group occupies the high
//! `GROUP_BITS` bits and the local row the remaining low bits.

use std::fmt;

/// Default width, in bits, of the group index held in the high bits of a [`SpotKey`].
pub const DEFAULT_GROUP_BITS: u32 = 24;

/// An opaque 64-bit identifier naming one spot. Never interpreted by callers; only
/// [`KeyCodec`] knows how to take it apart.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpotKey(pub u64);

impl SpotKey {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SpotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpotKey({:#018x})", self.0)
    }
}

impl From<u64> for SpotKey {
    fn from(raw: u64) -> Self {
        SpotKey(raw)
    }
}

/// Packs/unpacks [`SpotKey`] values for a fixed `group_bits` width.
///
/// `group_bits` is chosen once per load (from [`DEFAULT_GROUP_BITS`] or a configured
/// override) and never changes afterwards; group count and local-row count are capped
/// accordingly for the rest of the load.
#[derive(Debug, Clone, Copy)]
pub struct KeyCodec {
    group_bits: u32,
    row_shift: u32,
    row_mask: u64,
    group_mask: u64,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_BITS)
    }
}

impl KeyCodec {
    /// Builds a codec for the given group-index width. Panics if `group_bits` does not
    /// leave room for at least one local-row bit, or does not fit in a u64.
    pub fn new(group_bits: u32) -> Self {
        assert!(
            group_bits > 0 && group_bits < 64,
            "group_bits ({group_bits}) must leave room for a local row index"
        );
        let row_shift = 64 - group_bits;
        let row_mask = if row_shift == 64 { u64::MAX } else { (1u64 << row_shift) - 1 };
        let group_mask = (1u64 << group_bits) - 1;
        Self {
            group_bits,
            row_shift,
            row_mask,
            group_mask,
        }
    }

    pub fn group_bits(&self) -> u32 {
        self.group_bits
    }

    /// `2^GROUP_BITS`: the maximum number of concurrently live groups.
    pub fn max_groups(&self) -> u64 {
        self.group_mask + 1
    }

    /// `2^(64 - GROUP_BITS)`: the maximum number of rows addressable within one group.
    pub fn max_rows_per_group(&self) -> u64 {
        self.row_mask + 1
    }

    pub fn fits_group(&self, group: u32) -> bool {
        (group as u64) <= self.group_mask
    }

    pub fn fits_row(&self, local_row: u64) -> bool {
        local_row <= self.row_mask
    }

    /// Packs `(group, local_row)` into an opaque [`SpotKey`].
    ///
    /// # Panics
    /// Panics in debug builds if either component overflows its allotted bit width.
    pub fn encode(&self, group: u32, local_row: u64) -> SpotKey {
        debug_assert!(self.fits_group(group), "group {group} exceeds {}-bit width", self.group_bits);
        debug_assert!(
            self.fits_row(local_row),
            "local row {local_row} exceeds {}-bit width",
            self.row_shift
        );
        SpotKey(((group as u64) << self.row_shift) | (local_row & self.row_mask))
    }

    /// Splits a [`SpotKey`] back into `(group, local_row)`.
    pub fn decode(&self, key: SpotKey) -> (u32, u64) {
        let local_row = key.0 & self.row_mask;
        let group = (key.0 >> self.row_shift) as u32;
        (group, local_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_width() {
        let codec = KeyCodec::default();
        for (group, row) in [(0u32, 0u64), (1, 1), (42, 1_000_000), (codec.max_groups() as u32 - 1, codec.max_rows_per_group() - 1)] {
            let key = codec.encode(group, row);
            assert_eq!(codec.decode(key), (group, row));
        }
    }

    #[test]
    fn roundtrip_narrow_width() {
        // A narrow group width exercises the boundary math differently from the default.
        let codec = KeyCodec::new(4);
        assert_eq!(codec.max_groups(), 16);
        assert_eq!(codec.max_rows_per_group(), 1 << 60);
        let key = codec.encode(15, 123_456_789);
        assert_eq!(codec.decode(key), (15, 123_456_789));
    }

    #[test]
    fn distinct_inputs_never_collide() {
        let codec = KeyCodec::new(8);
        let a = codec.encode(1, 5);
        let b = codec.encode(1, 6);
        let c = codec.encode(2, 5);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
