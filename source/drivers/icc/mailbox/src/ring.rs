// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity circular buffer shared between the two cores
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests + proptest occupancy bound
//!
//! INDEX CONVENTION:
//!   - Both indices count the bytes remaining before the end of the buffer.
//!   - They start at `capacity`, decrement as data is produced/consumed and wrap back to
//!     `capacity` when they reach zero. The peer core uses the same convention.
//!   - `read == write` means empty. One word is always left unused so a full ring never
//!     looks empty.
//!
//! NOTE:
//!   - The ring knows nothing about messages; callers move whole word slices.
//!   - Visibility to the other core is delegated to `icc_hal::Coherence` around every
//!     data access; index stores use release/acquire ordering.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use icc_hal::Coherence;

const WORD: u32 = 4;
/// Bytes that always stay empty to disambiguate full from empty.
pub const RESERVED_BYTES: u32 = WORD;

/// Circular buffer of 32-bit words with independently advanced read/write indices.
pub struct RingBuffer {
    read: AtomicU32,
    write: AtomicU32,
    capacity: u32,
    slots: Box<[AtomicU32]>,
}

impl RingBuffer {
    /// Creates an empty ring of `capacity` bytes.
    ///
    /// Panics unless `capacity` is a power of two of at least two words; configuration
    /// validation rejects such values before a ring is built.
    pub fn new(capacity: u32) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2 * WORD,
            "ring capacity must be a power of two of at least two words"
        );
        let slots = (0..capacity / WORD).map(|_| AtomicU32::new(0)).collect();
        Self {
            read: AtomicU32::new(capacity),
            write: AtomicU32::new(capacity),
            capacity,
            slots,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    fn offset_of(&self, index: u32) -> u32 {
        (self.capacity - index) & self.mask()
    }

    fn advanced(&self, index: u32, n: u32) -> u32 {
        let offset = (self.offset_of(index) + n) & self.mask();
        self.capacity - offset
    }

    /// Raw read index (remaining-bytes form).
    pub fn read_index(&self) -> u32 {
        self.read.load(Ordering::Acquire)
    }

    /// Raw write index (remaining-bytes form).
    pub fn write_index(&self) -> u32 {
        self.write.load(Ordering::Acquire)
    }

    pub fn not_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) != self.write.load(Ordering::Acquire)
    }

    /// Bytes currently holding unread data.
    pub fn used(&self) -> u32 {
        let r = self.offset_of(self.read.load(Ordering::Acquire));
        let w = self.offset_of(self.write.load(Ordering::Acquire));
        w.wrapping_sub(r) & self.mask()
    }

    /// Bytes the producer may still write.
    pub fn space_available(&self) -> u32 {
        self.capacity
            .saturating_sub(self.used())
            .saturating_sub(RESERVED_BYTES)
    }

    /// Consumer: marks `n` bytes as read.
    pub fn advance_read(&self, n: u32) {
        debug_assert!(n % WORD == 0 && n <= self.used());
        let next = self.advanced(self.read.load(Ordering::Relaxed), n);
        self.read.store(next, Ordering::Release);
    }

    /// Producer: publishes `n` bytes previously written with `write_at_offset`.
    pub fn advance_write(&self, n: u32) {
        debug_assert!(n % WORD == 0 && n <= self.space_available());
        let next = self.advanced(self.write.load(Ordering::Relaxed), n);
        self.write.store(next, Ordering::Release);
    }

    /// Producer: stores `words` starting `rel` bytes past the write index.
    pub fn write_at_offset(&self, rel: u32, words: &[u32]) {
        let base = self.offset_of(self.write.load(Ordering::Relaxed)) + rel;
        for (i, &w) in words.iter().enumerate() {
            self.slot(base + i as u32 * WORD).store(w, Ordering::Relaxed);
        }
    }

    /// Consumer: loads `out.len()` words starting `rel` bytes past the read index.
    pub fn read_at_offset(&self, rel: u32, out: &mut [u32]) {
        let base = self.offset_of(self.read.load(Ordering::Relaxed)) + rel;
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.slot(base + i as u32 * WORD).load(Ordering::Relaxed);
        }
    }

    /// Clears a span after it has been consumed.
    fn clear_at_read(&self, len_words: usize) {
        let base = self.offset_of(self.read.load(Ordering::Relaxed));
        for i in 0..len_words {
            self.slot(base + i as u32 * WORD).store(0, Ordering::Relaxed);
        }
    }

    fn slot(&self, byte_offset: u32) -> &AtomicU32 {
        &self.slots[((byte_offset & self.mask()) / WORD) as usize]
    }

    /// Returns the (address, length) spans covering `len` bytes from `offset`, split at the
    /// end of the buffer. The second span is empty when no wrap occurs.
    fn spans(&self, offset: u32, len: u32) -> [(usize, usize); 2] {
        let base = self.slots.as_ptr() as usize;
        let offset = offset & self.mask();
        let first = len.min(self.capacity - offset);
        [
            (base + offset as usize, first as usize),
            (base, (len - first) as usize),
        ]
    }

    /// Producer: copies `words` in, publishes them to the peer and advances the write
    /// index. Returns false without touching the ring when there is not enough space.
    pub fn push_words(&self, words: &[u32], coherence: &dyn Coherence) -> bool {
        let len = words.len() as u32 * WORD;
        if self.space_available() < len {
            return false;
        }
        let offset = self.offset_of(self.write.load(Ordering::Relaxed));
        self.write_at_offset(0, words);
        for (addr, n) in self.spans(offset, len) {
            if n > 0 {
                coherence.publish(addr, n);
            }
        }
        self.advance_write(len);
        true
    }

    /// Consumer: fills `out` with the next words, clears the consumed span and advances the
    /// read index. Returns false when fewer than `out.len()` words are available.
    pub fn pop_words(&self, out: &mut [u32], coherence: &dyn Coherence) -> bool {
        let len = out.len() as u32 * WORD;
        if self.used() < len {
            return false;
        }
        let offset = self.offset_of(self.read.load(Ordering::Relaxed));
        for (addr, n) in self.spans(offset, len) {
            if n > 0 {
                coherence.acquire(addr, n);
            }
        }
        self.read_at_offset(0, out);
        self.clear_at_read(out.len());
        self.advance_read(len);
        true
    }

    /// Returns both indices to their initial value. Only valid while neither core is
    /// accessing the ring.
    pub fn reset(&self) {
        self.read.store(self.capacity, Ordering::Release);
        self.write.store(self.capacity, Ordering::Release);
    }
}

/// The two rings that make up one mailbox.
#[derive(Clone)]
pub struct SharedRings {
    /// Control core to companion core.
    pub downstream: Arc<RingBuffer>,
    /// Companion core to control core.
    pub upstream: Arc<RingBuffer>,
}

impl SharedRings {
    pub fn new(capacity: u32) -> Self {
        Self {
            downstream: Arc::new(RingBuffer::new(capacity)),
            upstream: Arc::new(RingBuffer::new(capacity)),
        }
    }
}
