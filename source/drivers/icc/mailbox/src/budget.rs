// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bounded retry loops and deadlines for ring writes and synchronous calls.
//!
//! Callers make non-blocking attempts that fail with `IccError::Busy` and this module
//! decides how long to keep trying: a fixed number of delayed retries in task context, or
//! a fixed number of spins where sleeping is not allowed.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)

use core::time::Duration;
use std::time::Instant;

use crate::{IccError, Result};

/// Time source used by retry loops and call deadlines.
pub trait Clock: Send + Sync {
    /// Monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;
    /// Suspends the calling task for roughly `d`.
    fn delay(&self, d: Duration);
}

/// Host clock backed by `std::time::Instant`.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        duration_to_ns(self.start.elapsed())
    }

    fn delay(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

pub(crate) fn duration_to_ns(d: Duration) -> u64 {
    d.as_secs().saturating_mul(1_000_000_000).saturating_add(u64::from(d.subsec_nanos()))
}

/// Deadline `budget` from now on `clock`.
pub fn deadline_after(clock: &dyn Clock, budget: Duration) -> u64 {
    clock.now_ns().saturating_add(duration_to_ns(budget))
}

/// Runs `op`, retrying up to `retries` more times with `delay` in between while it reports
/// `Busy`. Returns `Busy` once the retries are used up; any other error ends the loop.
pub fn retry_with_delay<T>(
    clock: &dyn Clock,
    retries: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Err(IccError::Busy) if attempt < retries => {
                attempt += 1;
                clock.delay(delay);
            }
            other => return other,
        }
    }
}

/// Runs `op` up to `limit + 1` times without sleeping while it reports `Busy`.
pub fn spin_bounded<T>(limit: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut spins = 0u32;
    loop {
        match op() {
            Err(IccError::Busy) if spins < limit => {
                spins += 1;
                core::hint::spin_loop();
            }
            other => return other,
        }
    }
}
