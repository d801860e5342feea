// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Hardware seams for the inter-core mailbox (doorbell + shared-memory visibility)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests + tests/doorbell.rs
//!
//! PUBLIC API:
//!   - Bus: register access used by doorbell implementations
//!   - Doorbell: raise the peer core's interrupt
//!   - Coherence: publish()/acquire() around shared-memory accesses
//!   - MmioDoorbell: Doorbell over a Bus register bit
//!   - CoherentFabric / NonCoherentFabric: Coherence for coherent and cache-incoherent SoCs
//!
//! NOTE:
//!   - Coherence is the only place platform memory-ordering code is allowed to live.
//!   - Register offsets are supplied by SoC glue; nothing here hardcodes a layout.

use core::sync::atomic::{fence, Ordering};

/// Basic bus access trait shared by user drivers.
pub trait Bus {
    fn read(&self, addr: usize) -> u32;
    fn write(&self, addr: usize, value: u32);
}

/// Notifies the peer core that new data is waiting.
pub trait Doorbell: Send + Sync {
    fn ring(&self);
}

/// Makes shared-memory writes visible to the peer core and peer writes visible to us.
///
/// `addr`/`len` describe the byte span just written (publish) or about to be read (acquire).
pub trait Coherence: Send + Sync {
    /// Called after the producer wrote `len` bytes at `addr`, before the index update.
    fn publish(&self, addr: usize, len: usize);
    /// Called after the consumer observed the index update, before reading `len` bytes at `addr`.
    fn acquire(&self, addr: usize, len: usize);
}

/// Coherence for SoCs where both cores share a coherent view of memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoherentFabric;

impl Coherence for CoherentFabric {
    fn publish(&self, _addr: usize, _len: usize) {
        fence(Ordering::Release);
    }

    fn acquire(&self, _addr: usize, _len: usize) {
        fence(Ordering::Acquire);
    }
}

/// Data-cache maintenance primitives for cores without mutual coherence.
pub trait CacheMaintenance: Send + Sync {
    /// Writes back dirty lines covering the span.
    fn clean(&self, addr: usize, len: usize);
    /// Discards lines covering the span so the next read observes memory.
    fn invalidate(&self, addr: usize, len: usize);
}

/// Coherence for SoCs where the peer core does not snoop our caches.
pub struct NonCoherentFabric<M: CacheMaintenance> {
    cache: M,
}

impl<M: CacheMaintenance> NonCoherentFabric<M> {
    pub const fn new(cache: M) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &M {
        &self.cache
    }
}

impl<M: CacheMaintenance> Coherence for NonCoherentFabric<M> {
    fn publish(&self, addr: usize, len: usize) {
        fence(Ordering::Release);
        self.cache.clean(addr, len);
        fence(Ordering::SeqCst);
    }

    fn acquire(&self, addr: usize, len: usize) {
        fence(Ordering::SeqCst);
        self.cache.invalidate(addr, len);
        fence(Ordering::Acquire);
    }
}

/// Doorbell that raises the peer interrupt by writing one bit of a set-register.
///
/// `bus.write(offset)` is interpreted as an MMIO register offset.
pub struct MmioDoorbell<B: Bus> {
    bus: B,
    offset: usize,
    bit: u32,
}

impl<B: Bus> MmioDoorbell<B> {
    pub fn new(bus: B, offset: usize, bit: u32) -> Self {
        Self { bus, offset, bit: bit & 31 }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B: Bus + Send + Sync> Doorbell for MmioDoorbell<B> {
    fn ring(&self) {
        fence(Ordering::SeqCst);
        self.bus.write(self.offset, 1 << self.bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBus(Mutex<Vec<(usize, u32)>>);

    impl Bus for MockBus {
        fn read(&self, _addr: usize) -> u32 {
            0
        }

        fn write(&self, addr: usize, value: u32) {
            self.0.lock().unwrap().push((addr, value));
        }
    }

    #[derive(Default)]
    struct RecordingCache(Mutex<Vec<(&'static str, usize, usize)>>);

    impl CacheMaintenance for RecordingCache {
        fn clean(&self, addr: usize, len: usize) {
            self.0.lock().unwrap().push(("clean", addr, len));
        }

        fn invalidate(&self, addr: usize, len: usize) {
            self.0.lock().unwrap().push(("invalidate", addr, len));
        }
    }

    #[test]
    fn doorbell_writes_interrupt_bit() {
        let bell = MmioDoorbell::new(MockBus::default(), 0x40, 3);
        bell.ring();
        assert_eq!(*bell.bus().0.lock().unwrap(), vec![(0x40, 1 << 3)]);
    }

    #[test]
    fn non_coherent_fabric_cleans_and_invalidates() {
        let fabric = NonCoherentFabric::new(RecordingCache::default());
        fabric.publish(0x1000, 64);
        fabric.acquire(0x2000, 64);
        assert_eq!(
            *fabric.cache().0.lock().unwrap(),
            vec![("clean", 0x1000, 64), ("invalidate", 0x2000, 64)]
        );
    }
}
