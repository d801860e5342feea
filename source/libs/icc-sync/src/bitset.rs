// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

/// Fixed-size bitset with atomic acquire-first-clear and test-and-clear.
///
/// Storage is `WORDS` 64-bit words; only the first `len` bits are addressable. Out of range
/// indices are rejected with `None` instead of touching storage.
pub struct AtomicBitset<const WORDS: usize> {
    words: [AtomicU64; WORDS],
    len: usize,
}

impl<const WORDS: usize> AtomicBitset<WORDS> {
    /// Largest `len` this storage can hold.
    pub const CAPACITY: usize = WORDS * WORD_BITS;

    /// Creates an empty bitset with `len` addressable bits.
    ///
    /// Panics if `len` exceeds [`Self::CAPACITY`].
    pub const fn new(len: usize) -> Self {
        assert!(len <= WORDS * WORD_BITS, "bitset length exceeds storage");
        Self { words: [ZERO; WORDS], len }
    }

    /// Clears bit `index` and returns its previous value.
    pub fn test_and_clear(&self, index: usize) -> Option<bool> {
        let (word, mask) = self.locate(index)?;
        Some(self.words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0)
    }

    /// Finds the lowest clear bit, sets it and returns its index.
    pub fn acquire_first_clear(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            let base = w * WORD_BITS;
            if base >= self.len {
                break;
            }
            let valid = valid_mask(self.len - base);
            let mut current = word.load(Ordering::Acquire);
            loop {
                let free = !current & valid;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                let mask = 1u64 << bit;
                match word.compare_exchange_weak(
                    current,
                    current | mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(base + bit),
                    Err(observed) => current = observed,
                }
            }
        }
        None
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    fn locate(&self, index: usize) -> Option<(usize, u64)> {
        if index >= self.len {
            return None;
        }
        Some((index / WORD_BITS, 1u64 << (index % WORD_BITS)))
    }
}

fn valid_mask(remaining: usize) -> u64 {
    if remaining >= WORD_BITS {
        u64::MAX
    } else {
        (1u64 << remaining) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicBitset;
    use proptest::prelude::*;

    #[test]
    fn acquire_skips_set_bits_and_respects_len() {
        let set: AtomicBitset<1> = AtomicBitset::new(3);
        assert_eq!(set.acquire_first_clear(), Some(0));
        assert_eq!(set.acquire_first_clear(), Some(1));
        assert_eq!(set.acquire_first_clear(), Some(2));
        assert_eq!(set.acquire_first_clear(), None);
        assert_eq!(set.test_and_clear(1), Some(true));
        assert_eq!(set.acquire_first_clear(), Some(1));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let set: AtomicBitset<1> = AtomicBitset::new(8);
        assert_eq!(set.test_and_clear(8), None);
        assert_eq!(set.test_and_clear(64), None);
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn spans_multiple_words() {
        let set: AtomicBitset<2> = AtomicBitset::new(70);
        for expected in 0..70 {
            assert_eq!(set.acquire_first_clear(), Some(expected));
        }
        assert_eq!(set.acquire_first_clear(), None);
        assert_eq!(set.count(), 70);
    }

    proptest! {
        #[test]
        fn acquired_indices_are_unique(len in 1usize..128, frees in proptest::collection::vec(0usize..128, 0..16)) {
            let set: AtomicBitset<2> = AtomicBitset::new(len);
            let mut held = std::collections::BTreeSet::new();
            while let Some(i) = set.acquire_first_clear() {
                prop_assert!(i < len);
                prop_assert!(held.insert(i));
            }
            prop_assert_eq!(held.len(), len);
            for f in frees {
                if set.test_and_clear(f % len) == Some(true) {
                    held.remove(&(f % len));
                }
            }
            while let Some(i) = set.acquire_first_clear() {
                prop_assert!(held.insert(i));
            }
            prop_assert_eq!(set.count(), len);
        }
    }
}
