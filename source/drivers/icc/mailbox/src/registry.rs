// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-client state on the control core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal
//! TEST_COVERAGE: unit tests + proptest (sequence wrap, slot uniqueness)
//!
//! LOCKING:
//!   - Installed flags and sequence counters change under one interrupt-masking lock with
//!     O(1) critical sections.
//!   - Semaphore slots live in an atomic bitset; a set bit is owned by exactly one
//!     outstanding call and only that call clears it.
//!   - Each client queue has one producer (the upstream drain) and one consumer (`recv`).

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use icc_sync::{AtomicBitset, IrqControl, IrqSpinLock};
use log::debug;
use parking_lot::Mutex;

use crate::sync_call::SlotWaiter;
use crate::wire::{ClientId, Message, CONTROL_CLIENT, MAX_CLIENT, MAX_PERC_MSG};
use crate::{IccError, ReadyMask, Result};

/// Notification callback: receives the client id and its current ready conditions.
pub type Callback = Arc<dyn Fn(ClientId, ReadyMask) + Send + Sync>;

/// Per-client sequence counter. Yields 1..=0xFFFE and then wraps to 1; never 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceGen {
    next: u32,
}

impl SequenceGen {
    pub const FIRST: u32 = 1;
    pub const LAST: u32 = 0xFFFE;

    pub const fn new() -> Self {
        Self { next: Self::FIRST }
    }

    pub fn next_sequence(&mut self) -> u32 {
        let out = self.next;
        self.next = if out >= Self::LAST { Self::FIRST } else { out + 1 };
        out
    }
}

impl Default for SequenceGen {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for SequenceGen {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_sequence())
    }
}

pub(crate) struct ClientState {
    installed: AtomicBool,
    slots: AtomicBitset<1>,
    queue: Mutex<VecDeque<Message>>,
    /// Set by `Fatal`; cleared only by recovery.
    peer_blocked: AtomicBool,
    /// We told the peer to pause this client.
    flow_paused: AtomicBool,
    /// A flow-control record for this client could not be written yet.
    flow_pending: AtomicBool,
    /// The peer told us to pause this client.
    remote_paused: AtomicBool,
    callback: Mutex<Option<Callback>>,
    waiters: [SlotWaiter; MAX_PERC_MSG],
}

impl ClientState {
    fn new(depth: usize) -> Self {
        Self {
            installed: AtomicBool::new(false),
            slots: AtomicBitset::new(MAX_PERC_MSG),
            queue: Mutex::new(VecDeque::with_capacity(depth)),
            peer_blocked: AtomicBool::new(false),
            flow_paused: AtomicBool::new(false),
            flow_pending: AtomicBool::new(false),
            remote_paused: AtomicBool::new(false),
            callback: Mutex::new(None),
            waiters: core::array::from_fn(|_| SlotWaiter::new()),
        }
    }
}

pub struct Registry {
    clients: Box<[ClientState]>,
    sequences: IrqSpinLock<[SequenceGen; MAX_CLIENT]>,
    irq: Arc<dyn IrqControl>,
    depth: usize,
}

fn check_id(id: ClientId) -> Result<()> {
    if id == CONTROL_CLIENT || id.index() >= MAX_CLIENT {
        return Err(IccError::InvalidClient);
    }
    Ok(())
}

impl Registry {
    pub fn new(queue_depth: usize, irq: Arc<dyn IrqControl>) -> Self {
        Self {
            clients: (0..MAX_CLIENT).map(|_| ClientState::new(queue_depth)).collect(),
            sequences: IrqSpinLock::new([SequenceGen::new(); MAX_CLIENT]),
            irq,
            depth: queue_depth,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.depth
    }

    fn state(&self, id: ClientId) -> Result<&ClientState> {
        check_id(id)?;
        Ok(&self.clients[id.index()])
    }

    /// State of an installed client.
    pub(crate) fn client(&self, id: ClientId) -> Result<&ClientState> {
        let state = self.state(id)?;
        if !state.installed.load(Ordering::Acquire) {
            return Err(IccError::InvalidClient);
        }
        Ok(state)
    }

    pub fn is_installed(&self, id: ClientId) -> bool {
        self.client(id).is_ok()
    }

    pub fn installed_clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        (1..MAX_CLIENT as u8)
            .map(ClientId::new)
            .filter(move |&id| self.is_installed(id))
    }

    pub fn register(&self, id: ClientId) -> Result<()> {
        let state = self.state(id)?;
        let mut seqs = self.sequences.lock_irqsave(&*self.irq);
        if state.installed.load(Ordering::Acquire) {
            return Err(IccError::AlreadyOpen);
        }
        seqs[id.index()] = SequenceGen::new();
        state.queue.lock().clear();
        state.peer_blocked.store(false, Ordering::Relaxed);
        state.flow_paused.store(false, Ordering::Relaxed);
        state.flow_pending.store(false, Ordering::Relaxed);
        state.remote_paused.store(false, Ordering::Relaxed);
        state.installed.store(true, Ordering::Release);
        drop(seqs);
        debug!("icc: {id} registered");
        Ok(())
    }

    /// Removes a client. Pending synchronous calls are woken with `err`; their slots are
    /// released by the calls themselves, so nothing is freed twice.
    pub fn unregister(&self, id: ClientId, err: IccError) -> Result<()> {
        let state = self.state(id)?;
        {
            let _seqs = self.sequences.lock_irqsave(&*self.irq);
            if !state.installed.swap(false, Ordering::AcqRel) {
                return Err(IccError::InvalidClient);
            }
        }
        for waiter in &state.waiters {
            waiter.cancel(err);
        }
        state.queue.lock().clear();
        *state.callback.lock() = None;
        debug!("icc: {id} unregistered");
        Ok(())
    }

    pub fn alloc_slot(&self, id: ClientId) -> Result<u8> {
        let state = self.client(id)?;
        state
            .slots
            .acquire_first_clear()
            .map(|slot| slot as u8)
            .ok_or(IccError::NoFreeSlot)
    }

    /// Releases a slot. Returns whether it was held.
    pub fn free_slot(&self, id: ClientId, slot: u8) -> Result<bool> {
        let state = self.state(id)?;
        state.slots.test_and_clear(usize::from(slot)).ok_or(IccError::InvalidSlot)
    }

    pub fn slots_in_use(&self, id: ClientId) -> Result<usize> {
        Ok(self.state(id)?.slots.count())
    }

    pub fn next_sequence(&self, id: ClientId) -> Result<u32> {
        self.client(id)?;
        let mut seqs = self.sequences.lock_irqsave(&*self.irq);
        Ok(seqs[id.index()].next_sequence())
    }

    /// Appends to the client's queue and returns the free entries left. A full queue is
    /// left untouched and reported as `Busy`.
    pub fn enqueue(&self, id: ClientId, msg: Message) -> Result<usize> {
        let state = self.client(id)?;
        let mut queue = state.queue.lock();
        if queue.len() >= self.depth {
            return Err(IccError::Busy);
        }
        queue.push_back(msg);
        Ok(self.depth - queue.len())
    }

    /// Pops the oldest message together with the free entries left after the pop.
    pub fn dequeue(&self, id: ClientId) -> Result<Option<(Message, usize)>> {
        let state = self.client(id)?;
        let mut queue = state.queue.lock();
        Ok(queue.pop_front().map(|msg| (msg, self.depth - queue.len())))
    }

    pub fn queued(&self, id: ClientId) -> Result<usize> {
        Ok(self.client(id)?.queue.lock().len())
    }

    pub fn readiness(&self, id: ClientId) -> Result<ReadyMask> {
        let state = self.client(id)?;
        let mut mask = ReadyMask::empty();
        if !state.queue.lock().is_empty() {
            mask |= ReadyMask::CAN_READ;
        }
        if !state.peer_blocked.load(Ordering::Acquire)
            && !state.remote_paused.load(Ordering::Acquire)
        {
            mask |= ReadyMask::CAN_WRITE;
        }
        Ok(mask)
    }

    pub fn mark_peer_blocked(&self, id: ClientId) {
        if let Ok(state) = self.state(id) {
            state.peer_blocked.store(true, Ordering::Release);
        }
    }

    /// Clears the `Fatal` mark. Returns whether it was set.
    pub fn clear_peer_blocked(&self, id: ClientId) -> Result<bool> {
        Ok(self.client(id)?.peer_blocked.swap(false, Ordering::AcqRel))
    }

    pub fn is_peer_blocked(&self, id: ClientId) -> bool {
        self.state(id).map(|s| s.peer_blocked.load(Ordering::Acquire)).unwrap_or(false)
    }

    /// Sets or clears the "pause sent" mark. Returns the previous value.
    pub(crate) fn swap_flow_paused(&self, id: ClientId, paused: bool) -> bool {
        self.state(id)
            .map(|s| s.flow_paused.swap(paused, Ordering::AcqRel))
            .unwrap_or(paused)
    }

    pub fn is_flow_paused(&self, id: ClientId) -> bool {
        self.state(id).map(|s| s.flow_paused.load(Ordering::Acquire)).unwrap_or(false)
    }

    pub(crate) fn set_flow_pending(&self, id: ClientId) {
        if let Ok(state) = self.state(id) {
            state.flow_pending.store(true, Ordering::Release);
        }
    }

    /// Clears the pending mark of an installed client. Returns whether it was set.
    pub(crate) fn take_flow_pending(&self, id: ClientId) -> bool {
        self.client(id).is_ok_and(|s| s.flow_pending.swap(false, Ordering::AcqRel))
    }

    pub fn is_flow_pending(&self, id: ClientId) -> bool {
        self.state(id).map(|s| s.flow_pending.load(Ordering::Acquire)).unwrap_or(false)
    }

    /// Installed clients with a flow-control record still owed to the peer.
    pub(crate) fn flow_pending_clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.installed_clients().filter(move |&id| self.is_flow_pending(id))
    }

    /// Records a pause/resume request from the peer. Returns the previous value.
    pub(crate) fn set_remote_paused(&self, id: ClientId, paused: bool) -> Result<bool> {
        Ok(self.client(id)?.remote_paused.swap(paused, Ordering::AcqRel))
    }

    pub fn is_remote_paused(&self, id: ClientId) -> bool {
        self.state(id).map(|s| s.remote_paused.load(Ordering::Acquire)).unwrap_or(false)
    }

    pub fn set_callback(&self, id: ClientId, callback: Option<Callback>) -> Result<()> {
        *self.client(id)?.callback.lock() = callback;
        Ok(())
    }

    pub fn callback(&self, id: ClientId) -> Option<Callback> {
        self.client(id).ok().and_then(|s| s.callback.lock().clone())
    }

    pub(crate) fn waiter(&self, id: ClientId, slot: u8) -> Option<&SlotWaiter> {
        self.state(id).ok()?.waiters.get(usize::from(slot))
    }

    /// Wakes every pending call of every client with `err`.
    pub(crate) fn cancel_all(&self, err: IccError) {
        for state in self.clients.iter() {
            for waiter in &state.waiters {
                waiter.cancel(err);
            }
        }
    }
}
