// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Moves raw wire records between the rings and the rest of the mailbox
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal
//! TEST_COVERAGE: unit tests (retry budget, spin budget, doorbell, drain)
//!
//! PRODUCER SIDE:
//!   - Writers on the control core are serialized by an interrupt-masking lock so a handler
//!     that sends cannot deadlock against the task it interrupted.
//!   - A full downstream ring is retried with a delay in task context and escalates to
//!     `Fatal`; in interrupt context it spins briefly and reports `Busy`.
//!   - Every successful write is published and then the peer's doorbell is rung.
//!
//! CONSUMER SIDE:
//!   - Exactly one consumer reads the upstream ring at a time (`Consumer`). The interrupt
//!     drain and the synchronous busy-poll compete for the same gate; the loser leaves the
//!     ring to the winner, who rechecks it before releasing.
//!
//! LOCK ORDER:
//!   - consumer gate, then writer lock. Routing can emit flow-control records while the
//!     gate is held, so nothing may take the gate while holding the writer lock.

use std::sync::Arc;

use icc_hal::{Coherence, Doorbell};
use icc_sync::{IrqControl, IrqSpinLock, SpinLock, SpinLockGuard};
use log::warn;

use crate::budget::{retry_with_delay, spin_bounded, Clock};
use crate::ring::SharedRings;
use crate::stats::{bump, Counters};
use crate::wire::{WireMessage, WIRE_WORDS};
use crate::{CallContext, IccError, Result};

/// Limits applied when the downstream ring is full.
#[derive(Clone, Copy, Debug)]
pub struct WritePolicy {
    pub max_retries: u32,
    pub retry_delay: core::time::Duration,
    pub spin_limit: u32,
}

/// Platform hooks the transport needs.
#[derive(Clone)]
pub struct Platform {
    pub coherence: Arc<dyn Coherence>,
    /// Raises the companion core's interrupt.
    pub doorbell: Arc<dyn Doorbell>,
    pub irq: Arc<dyn IrqControl>,
    pub clock: Arc<dyn Clock>,
}

pub struct Transport {
    rings: SharedRings,
    platform: Platform,
    policy: WritePolicy,
    tx: IrqSpinLock<()>,
    rx: SpinLock<()>,
    counters: Counters,
}

/// Exclusive read access to the upstream ring.
pub struct Consumer<'t> {
    transport: &'t Transport,
    _gate: SpinLockGuard<'t, ()>,
}

impl Consumer<'_> {
    /// Reads one record, or `None` if the ring is empty.
    pub fn read_message(&self) -> Option<WireMessage> {
        let t = self.transport;
        t.counters.observe_occupancy(t.rings.upstream.used());
        let mut words = [0u32; WIRE_WORDS];
        if !t.rings.upstream.pop_words(&mut words, &*t.platform.coherence) {
            return None;
        }
        bump(&t.counters.messages_received);
        Some(WireMessage::from_words(words))
    }

    /// Reads until the ring is empty, handing every record to `route`.
    pub fn drain(&self, route: &mut dyn FnMut(WireMessage)) -> usize {
        let mut n = 0;
        while let Some(wire) = self.read_message() {
            route(wire);
            n += 1;
        }
        n
    }
}

impl Transport {
    pub fn new(rings: SharedRings, platform: Platform, policy: WritePolicy) -> Self {
        Self {
            rings,
            platform,
            policy,
            tx: IrqSpinLock::new(()),
            rx: SpinLock::new(()),
            counters: Counters::default(),
        }
    }

    pub fn rings(&self) -> &SharedRings {
        &self.rings
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    fn try_write(&self, wire: &WireMessage) -> Result<()> {
        let _guard = self.tx.lock_irqsave(&*self.platform.irq);
        if self.rings.downstream.push_words(wire.words(), &*self.platform.coherence) {
            Ok(())
        } else {
            Err(IccError::Busy)
        }
    }

    /// Writes one record to the downstream ring and notifies the peer.
    ///
    /// Task context: `Busy` is retried `max_retries` times, then reported as `Fatal`.
    /// Interrupt context: spins `spin_limit` times, then reports `Busy`.
    pub fn write_message(&self, wire: &WireMessage, ctx: CallContext) -> Result<()> {
        let result = match ctx {
            CallContext::Suspendable => {
                let mut attempts = 0u64;
                let r = retry_with_delay(
                    &*self.platform.clock,
                    self.policy.max_retries,
                    self.policy.retry_delay,
                    || {
                        attempts += 1;
                        self.try_write(wire)
                    },
                );
                self.counters
                    .write_retries
                    .fetch_add(attempts.saturating_sub(1), core::sync::atomic::Ordering::Relaxed);
                r.map_err(|e| match e {
                    IccError::Busy => {
                        bump(&self.counters.fatal);
                        warn!(
                            "icc: downstream ring still full after {} retries; peer unresponsive",
                            self.policy.max_retries
                        );
                        IccError::Fatal
                    }
                    other => other,
                })
            }
            CallContext::NonSuspendable => {
                spin_bounded(self.policy.spin_limit, || self.try_write(wire)).inspect_err(|e| {
                    if *e == IccError::Busy {
                        bump(&self.counters.busy);
                    }
                })
            }
        };
        if result.is_ok() {
            bump(&self.counters.messages_sent);
            self.platform.doorbell.ring();
        }
        result
    }

    /// Claims the upstream ring, or `None` if another consumer holds it.
    pub fn try_consumer(&self) -> Option<Consumer<'_>> {
        self.rx.try_lock().map(|gate| Consumer { transport: self, _gate: gate })
    }

    /// Non-blocking single read; `None` when the ring is empty or being consumed elsewhere.
    pub fn read_message(&self) -> Option<WireMessage> {
        self.try_consumer()?.read_message()
    }

    /// Interrupt path: drains the upstream ring into `route`.
    ///
    /// Returns without reading if another consumer holds the ring; that consumer drains
    /// whatever it leaves behind.
    pub fn drain(&self, route: &mut dyn FnMut(WireMessage)) -> usize {
        let mut total = 0;
        loop {
            let Some(consumer) = self.try_consumer() else {
                return total;
            };
            total += consumer.drain(route);
            drop(consumer);
            if !self.rings.upstream.not_empty() {
                return total;
            }
        }
    }

    /// Returns both rings to their initial state. Callers ensure the peer is quiescent.
    ///
    /// Waits for an active consumer to finish, including any records it writes meanwhile.
    pub fn reset_rings(&self) {
        let _rx = self.rx.lock();
        let _tx = self.tx.lock_irqsave(&*self.platform.irq);
        self.rings.downstream.reset();
        self.rings.upstream.reset();
    }
}
