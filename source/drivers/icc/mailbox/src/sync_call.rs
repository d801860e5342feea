// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous call engine: one request, one correlated reply
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests (waiter) + tests/sync_call.rs (loopback scenarios)
//!
//! CALL LIFECYCLE:
//!   Idle -> SlotAllocated -> Sent -> Completed | TimedOut | PeerError
//!
//! TIMEOUT:
//!   - The call budget starts when the request is stamped and is measured on the platform
//!     clock, not on wall time.
//!
//! CORRELATION:
//!   - A reply matches only if its destination, slot and sequence all equal what the call
//!     stamped. Anything else is left for its owner or discarded as late.
//!   - The slot is held by a `SlotLease` and released on every exit path, so a reply that
//!     arrives after a timeout finds either an idle waiter or one armed with a newer
//!     sequence.
//!
//! INTERRUPT CONTEXT:
//!   - Calls that may not sleep poll the upstream ring directly for a bounded number of
//!     iterations. Records that are not the awaited reply are routed exactly as the
//!     interrupt handler would route them.
//!   - Only one consumer reads the upstream ring at a time. Two polling calls take turns;
//!     each one checks its own waiter on every iteration, so a reply read by the other
//!     caller is still delivered.

use core::fmt;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::budget::{deadline_after, Clock};
use crate::mailbox::Mailbox;
use crate::registry::Registry;
use crate::stats::bump;
use crate::wire::{ClientId, Message, MessageFlags};
use crate::{CallContext, IccError, Result};

/// Longest single sleep of a waiting call. The clock is consulted after each one.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitState {
    Idle,
    Armed { sequence: u32 },
    Completed(Message),
    Cancelled(IccError),
}

/// Wait object for one semaphore slot.
pub(crate) struct SlotWaiter {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl SlotWaiter {
    pub fn new() -> Self {
        Self { state: Mutex::new(WaitState::Idle), cv: Condvar::new() }
    }

    pub fn arm(&self, sequence: u32) {
        debug_assert!(sequence != 0);
        *self.state.lock() = WaitState::Armed { sequence };
    }

    /// Hands `reply` to the armed call if its sequence matches. Returns false for a late
    /// or stale reply.
    pub fn complete(&self, reply: Message) -> bool {
        let mut state = self.state.lock();
        match *state {
            WaitState::Armed { sequence } if sequence == reply.sequence => {
                *state = WaitState::Completed(reply);
                self.cv.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Wakes an armed call with `err`.
    pub fn cancel(&self, err: IccError) {
        let mut state = self.state.lock();
        if let WaitState::Armed { .. } = *state {
            *state = WaitState::Cancelled(err);
            self.cv.notify_all();
        }
    }

    /// Takes the outcome if one has been delivered.
    pub fn try_take(&self) -> Option<Result<Message>> {
        let mut state = self.state.lock();
        Self::take(&mut state)
    }

    pub fn has_outcome(&self) -> bool {
        matches!(*self.state.lock(), WaitState::Completed(_) | WaitState::Cancelled(_))
    }

    fn take(state: &mut WaitState) -> Option<Result<Message>> {
        match *state {
            WaitState::Completed(reply) => {
                *state = WaitState::Idle;
                Some(Ok(reply))
            }
            WaitState::Cancelled(err) => {
                *state = WaitState::Idle;
                Some(Err(err))
            }
            _ => None,
        }
    }

    /// Blocks until an outcome is delivered or `clock` passes `deadline`.
    pub fn wait(&self, clock: &dyn Clock, deadline: u64) -> Result<Message> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = Self::take(&mut state) {
                return outcome;
            }
            let remaining = deadline.saturating_sub(clock.now_ns());
            if remaining == 0 {
                return Err(IccError::TimedOut);
            }
            let slice = Duration::from_nanos(remaining).min(WAIT_SLICE);
            self.cv.wait_for(&mut state, slice);
        }
    }

    pub fn disarm(&self) {
        *self.state.lock() = WaitState::Idle;
    }
}

impl Default for SlotWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Semaphore slot held for the duration of one call.
pub(crate) struct SlotLease<'r> {
    registry: &'r Registry,
    client: ClientId,
    slot: u8,
}

impl<'r> SlotLease<'r> {
    pub fn acquire(registry: &'r Registry, client: ClientId) -> Result<Self> {
        let slot = registry.alloc_slot(client)?;
        Ok(Self { registry, client, slot })
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        let _ = self.registry.free_slot(self.client, self.slot);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallState {
    SlotAllocated,
    Sent,
    Completed,
    TimedOut,
    PeerError,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SlotAllocated => "slot-allocated",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::TimedOut => "timed-out",
            Self::PeerError => "peer-error",
        };
        f.write_str(s)
    }
}

struct CallTrace {
    client: ClientId,
    slot: u8,
    sequence: u32,
}

impl CallTrace {
    fn enter(&self, state: CallState) {
        debug!(
            "icc: {} sync slot={} seq={} -> {}",
            self.client, self.slot, self.sequence, state
        );
    }
}

impl Mailbox {
    /// Sends `msg` and waits for the reply stamped with the same slot and sequence.
    ///
    /// `Suspendable` callers sleep for at most the configured call timeout.
    /// `NonSuspendable` callers poll the upstream ring for at most `poll_iterations`.
    pub fn send_sync(&self, id: ClientId, mut msg: Message, ctx: CallContext) -> Result<Message> {
        self.ensure_running()?;
        self.registry.client(id)?;
        if msg.src != id {
            return Err(IccError::SourceMismatch);
        }
        if self.registry.is_peer_blocked(id) {
            return Err(IccError::PeerBlocked);
        }

        let lease = SlotLease::acquire(&self.registry, id)?;
        let sequence = self.registry.next_sequence(id)?;
        let trace = CallTrace { client: id, slot: lease.slot(), sequence };
        trace.enter(CallState::SlotAllocated);

        msg.slot = lease.slot();
        msg.sequence = sequence;
        msg.flags |= MessageFlags::SYNC | MessageFlags::PRIORITY;

        let waiter = self.registry.waiter(id, lease.slot()).ok_or(IccError::InvalidSlot)?;
        waiter.arm(sequence);
        let clock = &*self.transport.platform().clock;
        let deadline = deadline_after(clock, self.config.sync_timeout());

        if let Err(err) = self.transport.write_message(&msg.encode(), ctx) {
            waiter.disarm();
            if err == IccError::Fatal {
                self.registry.mark_peer_blocked(id);
            }
            trace.enter(CallState::PeerError);
            return Err(err);
        }
        trace.enter(CallState::Sent);

        let outcome = match ctx {
            CallContext::Suspendable => waiter.wait(clock, deadline),
            CallContext::NonSuspendable => self.poll_reply(id, lease.slot(), sequence),
        };
        waiter.disarm();
        drop(lease);

        match outcome {
            Ok(reply) => {
                bump(&self.transport.counters().sync_completed);
                trace.enter(CallState::Completed);
                Ok(reply)
            }
            Err(IccError::TimedOut) => {
                bump(&self.transport.counters().sync_timed_out);
                trace.enter(CallState::TimedOut);
                warn!("icc: {id} sync call slot={} seq={sequence} timed out", trace.slot);
                Err(IccError::TimedOut)
            }
            Err(err) => {
                trace.enter(CallState::PeerError);
                Err(err)
            }
        }
    }

    fn poll_reply(&self, id: ClientId, slot: u8, sequence: u32) -> Result<Message> {
        let waiter = self.registry.waiter(id, slot).ok_or(IccError::InvalidSlot)?;
        let outcome = self.poll_loop(id, slot, sequence);
        // Records left behind while this call held the ring go through the normal path.
        self.handle_interrupt();
        match outcome {
            Some(reply) => {
                self.notify(id);
                Ok(reply)
            }
            None => waiter.try_take().unwrap_or(Err(IccError::TimedOut)),
        }
    }

    /// Returns the reply if this call read it itself; `None` when the budget ran out or
    /// another consumer delivered an outcome to the waiter.
    fn poll_loop(&self, id: ClientId, slot: u8, sequence: u32) -> Option<Message> {
        let waiter = self.registry.waiter(id, slot)?;
        for _ in 0..self.config.poll_iterations {
            if waiter.has_outcome() {
                return None;
            }
            if let Some(consumer) = self.transport.try_consumer() {
                if let Some(wire) = consumer.read_message() {
                    let reply = wire.decode();
                    if reply.answers(id, slot, sequence) {
                        return Some(reply);
                    }
                    self.route(wire);
                }
            }
            core::hint::spin_loop();
        }
        None
    }
}
