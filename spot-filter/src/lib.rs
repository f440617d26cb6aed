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

//! A layered, never-false-negative "seen this read name before" test.
//!
//! [`KeyFilter`] answers the dominant ingest-time question — "is this the first time
//! we've seen this read name?" — without ever touching the name→row hash map for names
//! that plainly were never seen. It is a tagged sum of four variants ([`Tier`]),
//! selected once per load from the estimated final spot count, each splatting a
//! different number of independent 32-bit hash projections across per-projection
//! [`roaring::RoaringBitmap`]s. Using a compressed bitmap per projection (rather than a
//! flat `2^32`-bit array) keeps the filter's memory proportional to the number of
//! distinct names actually seen, which is the point of calling it "succinct".

mod hashing;

use roaring::RoaringBitmap;
use sha1::{Digest, Sha1};
use sha2::{Sha224, Sha256};

pub use hashing::{fnv1a_64, murmur2_64a};

/// Which filter implementation is active. Selected once, from the estimated final spot
/// count observed during the first 10% of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// `N < 1e9`: two 32-bit FNV-1a projections plus two 32-bit Murmur projections.
    Small,
    /// `1e9 <= N < 2e9`: five 32-bit projections carved out of a SHA-1 digest.
    Medium,
    /// `2e9 <= N < 3e9`: seven 32-bit projections carved out of a SHA-224 digest.
    Large,
    /// `N >= 3e9`: eight 32-bit projections carved out of a SHA-256 digest.
    XLarge,
}

impl Tier {
    /// Chooses a tier from an estimated final spot count, per the load-time thresholds.
    pub fn for_estimated_spots(estimated: f64) -> Tier {
        if estimated < 1e9 {
            Tier::Small
        } else if estimated < 2e9 {
            Tier::Medium
        } else if estimated < 3e9 {
            Tier::Large
        } else {
            Tier::XLarge
        }
    }
}

enum Variant {
    Small([RoaringBitmap; 4]),
    Medium([RoaringBitmap; 5]),
    Large([RoaringBitmap; 7]),
    XLarge([RoaringBitmap; 8]),
}

impl Variant {
    fn new(tier: Tier) -> Self {
        match tier {
            Tier::Small => Variant::Small(std::array::from_fn(|_| RoaringBitmap::new())),
            Tier::Medium => Variant::Medium(std::array::from_fn(|_| RoaringBitmap::new())),
            Tier::Large => Variant::Large(std::array::from_fn(|_| RoaringBitmap::new())),
            Tier::XLarge => Variant::XLarge(std::array::from_fn(|_| RoaringBitmap::new())),
        }
    }

    /// Tests-and-sets each projection's bit; returns `true` only if every projection
    /// already had its bit set (i.e. the name has been seen before, as far as this
    /// filter can tell).
    fn seen(&mut self, bytes: &[u8]) -> bool {
        match self {
            Variant::Small(buckets) => {
                let fnv = hashing::fnv1a_64(bytes);
                let murmur = hashing::murmur2_64a(bytes, 0);
                let projections = [fnv as u32, (fnv >> 32) as u32, murmur as u32, (murmur >> 32) as u32];
                test_and_set_all(buckets, &projections)
            }
            Variant::Medium(buckets) => {
                let digest = Sha1::digest(bytes);
                let projections = words_from_digest::<5>(&digest);
                test_and_set_all(buckets, &projections)
            }
            Variant::Large(buckets) => {
                let digest = Sha224::digest(bytes);
                let projections = words_from_digest::<7>(&digest);
                test_and_set_all(buckets, &projections)
            }
            Variant::XLarge(buckets) => {
                let digest = Sha256::digest(bytes);
                let projections = words_from_digest::<8>(&digest);
                test_and_set_all(buckets, &projections)
            }
        }
    }

    fn projection_count(&self) -> usize {
        match self {
            Variant::Small(_) => 4,
            Variant::Medium(_) => 5,
            Variant::Large(_) => 7,
            Variant::XLarge(_) => 8,
        }
    }

    fn memory_used(&self) -> usize {
        let buckets: Vec<&RoaringBitmap> = match self {
            Variant::Small(b) => b.iter().collect(),
            Variant::Medium(b) => b.iter().collect(),
            Variant::Large(b) => b.iter().collect(),
            Variant::XLarge(b) => b.iter().collect(),
        };
        buckets.iter().map(|b| b.serialized_size()).sum()
    }
}

/// Tests and sets the bit for each projection in its own bucket; `true` iff every
/// bucket already had its bit set before this call.
fn test_and_set_all<const N: usize>(buckets: &mut [RoaringBitmap; N], projections: &[u32; N]) -> bool {
    let mut all_present = true;
    for (bucket, &projection) in buckets.iter_mut().zip(projections.iter()) {
        if !bucket.contains(projection) {
            all_present = false;
            bucket.insert(projection);
        }
    }
    all_present
}

/// Splits a SHA digest into `N` big-endian 32-bit words, one per projection bucket.
fn words_from_digest<const N: usize>(digest: &[u8]) -> [u32; N] {
    debug_assert_eq!(digest.len(), N * 4, "digest length must exactly cover N 32-bit words");
    let mut out = [0u32; N];
    for (i, word) in digest.chunks_exact(4).enumerate().take(N) {
        out[i] = u32::from_be_bytes(word.try_into().unwrap());
    }
    out
}

/// The tiered, never-false-negative "seen before" test over read names.
pub struct KeyFilter {
    tier: Tier,
    variant: Variant,
    last_hash: u64,
}

impl KeyFilter {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            variant: Variant::new(tier),
            last_hash: 0,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Returns `true` iff `bytes` was already seen (as far as this filter can tell);
    /// otherwise records it and returns `false`. Always refreshes [`Self::last_hash`]
    /// with the 64-bit FNV-1a hash of `bytes`, independent of which tier is active, so
    /// callers can reuse it for a downstream hash-map lookup without rehashing.
    pub fn seen(&mut self, bytes: &[u8]) -> bool {
        self.last_hash = hashing::fnv1a_64(bytes);
        self.variant.seen(bytes)
    }

    /// The 64-bit FNV-1a hash computed during the most recent [`Self::seen`] call.
    pub fn last_hash(&self) -> u64 {
        self.last_hash
    }

    /// Replaces the active tier, replaying every name `iter` yields through the new
    /// variant. Must only be called while no other thread can observe or mutate the
    /// filter; the source recommends sequencing rebuilds between batch freezes.
    pub fn rebuild_from<I, B>(&mut self, tier: Tier, iter: I)
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        self.tier = tier;
        self.variant = Variant::new(tier);
        for name in iter {
            // Discard the seen/unseen result: rebuilding is a pure replay, every name
            // must end up present regardless of whether it collided during replay.
            self.variant.seen(name.as_ref());
        }
    }

    pub fn projection_count(&self) -> usize {
        self.variant.projection_count()
    }

    /// Approximate memory footprint of the underlying compressed bitmaps.
    pub fn memory_used(&self) -> usize {
        self.variant.memory_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_selection_matches_thresholds() {
        assert_eq!(Tier::for_estimated_spots(0.0), Tier::Small);
        assert_eq!(Tier::for_estimated_spots(999_999_999.0), Tier::Small);
        assert_eq!(Tier::for_estimated_spots(1e9), Tier::Medium);
        assert_eq!(Tier::for_estimated_spots(2e9), Tier::Large);
        assert_eq!(Tier::for_estimated_spots(3e9), Tier::XLarge);
        assert_eq!(Tier::for_estimated_spots(5e9), Tier::XLarge);
    }

    #[test]
    fn never_false_negative_across_tiers() {
        for tier in [Tier::Small, Tier::Medium, Tier::Large, Tier::XLarge] {
            let mut filter = KeyFilter::new(tier);
            let names: Vec<String> = (0..2000).map(|i| format!("SRR{i:09}.1")).collect();
            for name in &names {
                assert!(!filter.seen(name.as_bytes()), "first sighting must never read as seen");
            }
            for name in &names {
                assert!(filter.seen(name.as_bytes()), "a previously-seen name must never read as unseen");
            }
        }
    }

    #[test]
    fn last_hash_is_plain_fnv1a_regardless_of_tier() {
        let mut filter = KeyFilter::new(Tier::XLarge);
        filter.seen(b"SRR000001.1");
        assert_eq!(filter.last_hash(), fnv1a_64(b"SRR000001.1"));
    }

    #[test]
    fn rebuild_replays_every_prior_name() {
        let mut filter = KeyFilter::new(Tier::Small);
        let names: Vec<String> = (0..500).map(|i| format!("name-{i}")).collect();
        for name in &names {
            filter.seen(name.as_bytes());
        }
        filter.rebuild_from(Tier::Medium, names.iter().map(|n| n.as_bytes()));
        assert_eq!(filter.tier(), Tier::Medium);
        for name in &names {
            assert!(filter.seen(name.as_bytes()), "replayed name must read as seen after rebuild");
        }
    }
}
