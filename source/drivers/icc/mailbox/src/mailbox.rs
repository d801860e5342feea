// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mailbox facade used by drivers and the device shim
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: tests/basic.rs, tests/flow.rs, tests/sync_call.rs, tests/recovery.rs
//!
//! ROUTING (interrupt path):
//!   - control client records: flow pause/resume from the peer
//!   - synchronous records: completed into the matching slot waiter, otherwise discarded
//!     as late
//!   - everything else: appended to the destination client's queue, then flow control,
//!     then a ready notification through the dispatcher
//!
//! FLOW CONTROL:
//!   - Pause is announced from the interrupt path, resume from `recv` in task context.
//!   - A record that cannot be written leaves the client pending. Pending clients are
//!     retried on every interrupt, on `recv` and on `recover`, against the queue as it is
//!     then. `Fatal` while announcing marks the client peer-blocked like any other send.
//!
//! ERRORS:
//!   - Every failure reaches the caller as `IccError`; logging is informational only.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::config::{ConfigError, MailboxConfig};
use crate::dispatch::{dispatcher_for, Dispatcher};
use crate::flow::{control_message, parse_control, FlowControl, FlowSignal};
use crate::registry::{Callback, Registry};
use crate::ring::SharedRings;
use crate::stats::{bump, MailboxStats};
use crate::transport::{Platform, Transport, WritePolicy};
use crate::wire::{ClientId, Message, MessageFlags, WireMessage, CONTROL_CLIENT, WIRE_MESSAGE_SIZE};
use crate::{CallContext, IccError, ReadyMask, Result, SendOptions};

pub struct Mailbox {
    pub(crate) config: MailboxConfig,
    pub(crate) transport: Transport,
    pub(crate) registry: Registry,
    flow: FlowControl,
    dispatcher: Box<dyn Dispatcher>,
    running: AtomicBool,
}

impl Mailbox {
    /// Builds a mailbox over `rings` with the dispatcher selected by `config.dispatch`.
    pub fn new(
        config: MailboxConfig,
        rings: SharedRings,
        platform: Platform,
    ) -> core::result::Result<Self, ConfigError> {
        let dispatcher = dispatcher_for(&config.dispatch);
        Self::with_dispatcher(config, rings, platform, dispatcher)
    }

    pub fn with_dispatcher(
        config: MailboxConfig,
        rings: SharedRings,
        platform: Platform,
        dispatcher: Box<dyn Dispatcher>,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        if rings.downstream.capacity() != config.ring_capacity
            || rings.upstream.capacity() != config.ring_capacity
        {
            return Err(ConfigError::Invalid("ring size differs from ring_capacity"));
        }
        let policy = WritePolicy {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            spin_limit: config.spin_limit,
        };
        let registry = Registry::new(config.queue_depth, platform.irq.clone());
        Ok(Self {
            flow: FlowControl::new(config.low_water, config.high_water),
            transport: Transport::new(rings, platform, policy),
            registry,
            dispatcher,
            running: AtomicBool::new(true),
            config,
        })
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> MailboxStats {
        self.transport.counters().snapshot()
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(IccError::ShutDown)
        }
    }

    pub fn register_client(&self, id: ClientId) -> Result<ClientHandle<'_>> {
        self.ensure_running()?;
        self.registry.register(id)?;
        Ok(ClientHandle { mailbox: self, id })
    }

    /// Removes `id`. Pending synchronous calls of the client fail with `InvalidClient`.
    pub fn unregister_client(&self, id: ClientId) -> Result<()> {
        self.registry.unregister(id, IccError::InvalidClient)?;
        self.dispatcher.detach(id);
        Ok(())
    }

    /// Handle for an already registered client.
    pub fn client(&self, id: ClientId) -> Result<ClientHandle<'_>> {
        self.registry.client(id)?;
        Ok(ClientHandle { mailbox: self, id })
    }

    pub fn register_callback(&self, id: ClientId, callback: Callback) -> Result<()> {
        self.ensure_running()?;
        self.registry.client(id)?;
        self.dispatcher.attach(id)?;
        self.registry.set_callback(id, Some(callback))
    }

    pub fn unregister_callback(&self, id: ClientId) -> Result<()> {
        self.registry.set_callback(id, None)?;
        self.dispatcher.detach(id);
        Ok(())
    }

    /// Sends an asynchronous message and returns the bytes written to the ring.
    pub fn send(&self, id: ClientId, mut msg: Message, opts: SendOptions) -> Result<usize> {
        self.ensure_running()?;
        self.registry.client(id)?;
        if msg.src != id {
            return Err(IccError::SourceMismatch);
        }
        if self.registry.is_peer_blocked(id) {
            return Err(IccError::PeerBlocked);
        }
        if self.registry.is_remote_paused(id) {
            return Err(IccError::WouldBlock);
        }
        msg.sequence = self.registry.next_sequence(id)?;
        msg.slot = 0;
        msg.flags.remove(MessageFlags::SYNC);
        msg.flags.set(MessageFlags::PRIORITY, opts.priority);
        match self.transport.write_message(&msg.encode(), opts.context) {
            Ok(()) => Ok(WIRE_MESSAGE_SIZE),
            Err(IccError::Fatal) => {
                self.registry.mark_peer_blocked(id);
                warn!("icc: {id} marked peer-blocked");
                Err(IccError::Fatal)
            }
            Err(err) => Err(err),
        }
    }

    /// Takes the oldest queued message for `id`, or `WouldBlock` if there is none.
    ///
    /// Runs in task context: an owed resume is written with delayed retries.
    pub fn recv(&self, id: ClientId) -> Result<Message> {
        self.ensure_running()?;
        let dequeued = self.registry.dequeue(id)?;
        let ctx = self.flow_context(id);
        let Some((msg, free)) = dequeued else {
            self.retry_flow(id, ctx);
            return Err(IccError::WouldBlock);
        };
        let paused = self.registry.is_flow_paused(id);
        match self.flow.after_dequeue(free, paused) {
            Some(signal) => self.signal_flow(id, signal, ctx),
            None => self.retry_flow(id, ctx),
        }
        Ok(msg)
    }

    pub fn readiness(&self, id: ClientId) -> Result<ReadyMask> {
        self.registry.readiness(id)
    }

    /// Interrupt entry point: drains the upstream ring and routes every record.
    pub fn handle_interrupt(&self) -> usize {
        if self.ensure_running().is_err() {
            return 0;
        }
        let pending: Vec<ClientId> = self.registry.flow_pending_clients().collect();
        for id in pending {
            self.retry_flow(id, CallContext::NonSuspendable);
        }
        self.transport.drain(&mut |wire| self.route(wire))
    }

    pub(crate) fn route(&self, wire: WireMessage) {
        let msg = wire.decode();
        if msg.dst == CONTROL_CLIENT {
            self.route_control(&msg);
            return;
        }
        if !self.registry.is_installed(msg.dst) {
            bump(&self.transport.counters().dropped);
            warn!("icc: message {:#x} for unregistered {} dropped", msg.msg_id, msg.dst);
            return;
        }
        if msg.is_sync() {
            let completed = self
                .registry
                .waiter(msg.dst, msg.slot)
                .is_some_and(|waiter| waiter.complete(msg));
            if completed {
                self.notify(msg.dst);
            } else {
                bump(&self.transport.counters().late_replies);
                warn!(
                    "icc: late reply for {} slot={} seq={} discarded",
                    msg.dst, msg.slot, msg.sequence
                );
            }
            return;
        }
        match self.registry.enqueue(msg.dst, msg) {
            Ok(free) => {
                let paused = self.registry.is_flow_paused(msg.dst);
                if let Some(signal) = self.flow.after_enqueue(free, paused) {
                    self.signal_flow(msg.dst, signal, CallContext::NonSuspendable);
                }
                self.notify(msg.dst);
            }
            Err(_) => {
                bump(&self.transport.counters().dropped);
                warn!("icc: queue of {} full; message {:#x} dropped", msg.dst, msg.msg_id);
            }
        }
    }

    fn route_control(&self, msg: &Message) {
        let Some((signal, client)) = parse_control(msg) else {
            bump(&self.transport.counters().dropped);
            warn!("icc: unknown control message {:#x} dropped", msg.msg_id);
            return;
        };
        let paused = signal == FlowSignal::Pause;
        match self.registry.set_remote_paused(client, paused) {
            Ok(was_paused) => {
                let counter = if paused {
                    &self.transport.counters().pauses_received
                } else {
                    &self.transport.counters().resumes_received
                };
                bump(counter);
                debug!("icc: peer {:?} for {client}", signal);
                if was_paused && !paused {
                    self.notify(client);
                }
            }
            Err(_) => {
                bump(&self.transport.counters().dropped);
                warn!("icc: flow {:?} for unregistered {client} dropped", signal);
            }
        }
    }

    /// Announces `signal` for `id` to the peer. The per-client mark is taken before the
    /// write. On failure it is restored and the client is left pending.
    fn signal_flow(&self, id: ClientId, signal: FlowSignal, ctx: CallContext) {
        let pause = signal == FlowSignal::Pause;
        if self.registry.swap_flow_paused(id, pause) == pause {
            return;
        }
        let written = control_message(signal, id)
            .map_err(IccError::from)
            .and_then(|msg| self.transport.write_message(&msg.encode(), ctx));
        match written {
            Ok(()) => {
                let counter = if pause {
                    &self.transport.counters().pauses_sent
                } else {
                    &self.transport.counters().resumes_sent
                };
                bump(counter);
                debug!("icc: sent {:?} for {id}", signal);
            }
            Err(err) => {
                self.registry.swap_flow_paused(id, !pause);
                self.registry.set_flow_pending(id);
                warn!("icc: could not send {:?} for {id}: {err}; retrying later", signal);
                if err == IccError::Fatal {
                    self.registry.mark_peer_blocked(id);
                    warn!("icc: {id} marked peer-blocked");
                    self.notify(id);
                }
            }
        }
    }

    /// Announces whatever the queue of `id` now calls for, if an earlier record was lost.
    fn retry_flow(&self, id: ClientId, ctx: CallContext) {
        if !self.registry.take_flow_pending(id) {
            return;
        }
        let Ok(queued) = self.registry.queued(id) else {
            return;
        };
        let free = self.registry.queue_depth().saturating_sub(queued);
        let paused = self.registry.is_flow_paused(id);
        if let Some(signal) = self.flow.reconcile(free, paused) {
            self.signal_flow(id, signal, ctx);
        }
    }

    /// A client already marked peer-blocked gets one bounded attempt instead of delays.
    fn flow_context(&self, id: ClientId) -> CallContext {
        if self.registry.is_peer_blocked(id) {
            CallContext::NonSuspendable
        } else {
            CallContext::Suspendable
        }
    }

    /// Queues a ready notification for `id` if it has a callback.
    pub(crate) fn notify(&self, id: ClientId) {
        let Some(callback) = self.registry.callback(id) else {
            return;
        };
        if let Ok(ready) = self.registry.readiness(id) {
            self.dispatcher.dispatch(id, ready, callback);
        }
    }

    /// Clears the `Fatal` mark of `id` once the peer has been brought back, then sends any
    /// flow-control record still owed for it. Reports `Fatal` if that record cannot be
    /// written either.
    pub fn recover(&self, id: ClientId) -> Result<()> {
        self.ensure_running()?;
        let was_blocked = self.registry.clear_peer_blocked(id)?;
        self.retry_flow(id, CallContext::Suspendable);
        if self.registry.is_peer_blocked(id) {
            return Err(IccError::Fatal);
        }
        if was_blocked {
            debug!("icc: {id} recovered");
            self.notify(id);
        }
        Ok(())
    }

    /// Returns both rings to their initial state. The peer must be quiescent.
    pub fn reset_rings(&self) {
        self.transport.reset_rings();
        debug!("icc: rings reset");
    }

    /// Stops the mailbox: pending calls fail with `ShutDown`, clients are removed, workers
    /// exit and the rings are reset. Later operations fail with `ShutDown`.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.registry.cancel_all(IccError::ShutDown);
        let clients: Vec<ClientId> = self.registry.installed_clients().collect();
        for id in clients {
            let _ = self.registry.unregister(id, IccError::ShutDown);
        }
        self.dispatcher.shutdown();
        self.transport.reset_rings();
        debug!("icc: mailbox shut down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

/// Per-client view of a mailbox.
#[derive(Clone, Copy)]
pub struct ClientHandle<'m> {
    mailbox: &'m Mailbox,
    id: ClientId,
}

impl<'m> ClientHandle<'m> {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn mailbox(&self) -> &'m Mailbox {
        self.mailbox
    }

    /// New message from this client to `dst`.
    pub fn message(&self, dst: ClientId, msg_id: u8) -> Message {
        Message::new(self.id, dst, msg_id)
    }

    pub fn send(&self, msg: Message, opts: SendOptions) -> Result<usize> {
        self.mailbox.send(self.id, msg, opts)
    }

    pub fn send_sync(&self, msg: Message, ctx: CallContext) -> Result<Message> {
        self.mailbox.send_sync(self.id, msg, ctx)
    }

    pub fn recv(&self) -> Result<Message> {
        self.mailbox.recv(self.id)
    }

    pub fn readiness(&self) -> Result<ReadyMask> {
        self.mailbox.readiness(self.id)
    }

    pub fn register_callback(&self, callback: Callback) -> Result<()> {
        self.mailbox.register_callback(self.id, callback)
    }

    pub fn unregister_callback(&self) -> Result<()> {
        self.mailbox.unregister_callback(self.id)
    }

    pub fn unregister(self) -> Result<()> {
        self.mailbox.unregister_client(self.id)
    }
}
