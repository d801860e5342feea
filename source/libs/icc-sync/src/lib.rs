// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Lock and bitset primitives shared by the inter-core mailbox
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests + proptest (bitset)
//!
//! PUBLIC API:
//!   - SpinLock: busy-wait lock for environments without blocking primitives
//!   - IrqSpinLock: spin lock that masks local interrupts while held
//!   - IrqControl / IrqState / NoIrq: interrupt masking hook
//!   - AtomicBitset: fixed-size bitset with atomic acquire/clear
//!
//! INVARIANTS:
//!   - IrqSpinLock restores the saved interrupt state only after the lock is released
//!   - AtomicBitset never reports an index >= its configured length

mod bitset;

pub use bitset::AtomicBitset;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A simple spin lock for environments without blocking primitives.
pub struct SpinLock<T: ?Sized> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        acquire(&self.flag);
        SpinLockGuard { lock: self }
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn acquire(flag: &AtomicBool) {
    while flag
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        while flag.load(Ordering::Relaxed) {
            core::hint::spin_loop();
        }
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Opaque interrupt state captured by [`IrqControl::save_and_disable`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IrqState(pub usize);

/// Local interrupt masking hook.
///
/// Platform glue implements this with the CPU's interrupt-enable bit; hosted builds use
/// [`NoIrq`].
pub trait IrqControl: Send + Sync {
    /// Masks local interrupts and returns the state to restore later.
    fn save_and_disable(&self) -> IrqState;
    /// Restores a state previously returned by `save_and_disable`.
    fn restore(&self, state: IrqState);
}

/// Interrupt control for hosted builds where there is nothing to mask.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIrq;

impl IrqControl for NoIrq {
    fn save_and_disable(&self) -> IrqState {
        IrqState(0)
    }

    fn restore(&self, _state: IrqState) {}
}

/// Spin lock that keeps local interrupts masked for as long as it is held, so the same
/// lock may be taken from task context and from an interrupt handler.
pub struct IrqSpinLock<T: ?Sized> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for IrqSpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> IrqSpinLock<T> {
    /// Masks interrupts through `irq`, then spins until the lock is free.
    pub fn lock_irqsave<'a>(&'a self, irq: &'a dyn IrqControl) -> IrqSpinLockGuard<'a, T> {
        let saved = irq.save_and_disable();
        acquire(&self.flag);
        IrqSpinLockGuard { lock: self, irq, saved }
    }
}

pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    lock: &'a IrqSpinLock<T>,
    irq: &'a dyn IrqControl,
    saved: IrqState,
}

impl<'a, T: ?Sized> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for IrqSpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for IrqSpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
        self.irq.restore(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn guard_provides_mut_access() {
        let lock = SpinLock::new(1_u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[derive(Default)]
    struct CountingIrq {
        depth: AtomicUsize,
        restores: AtomicUsize,
    }

    impl IrqControl for CountingIrq {
        fn save_and_disable(&self) -> IrqState {
            IrqState(self.depth.fetch_add(1, Ordering::SeqCst))
        }

        fn restore(&self, state: IrqState) {
            self.depth.store(state.0, Ordering::SeqCst);
            self.restores.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn irq_lock_masks_while_held() {
        let irq = CountingIrq::default();
        let lock = IrqSpinLock::new(0_u8);
        {
            let mut guard = lock.lock_irqsave(&irq);
            *guard = 7;
            assert_eq!(irq.depth.load(Ordering::SeqCst), 1);
        }
        assert_eq!(irq.depth.load(Ordering::SeqCst), 0);
        assert_eq!(irq.restores.load(Ordering::SeqCst), 1);
        assert_eq!(*lock.lock_irqsave(&NoIrq), 7);
    }
}
