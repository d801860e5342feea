// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Inter-core mailbox between the control core and the companion core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests per module + tests/ scenarios over the loopback peer
//!
//! PUBLIC API:
//!   - Mailbox: client registration, send/recv, synchronous calls, interrupt entry point
//!   - ClientHandle: per-client view returned by `Mailbox::register_client`
//!   - Message / WireMessage: decoded and raw forms of the 64-byte wire record
//!   - MailboxConfig: TOML-loadable tuning knobs
//!   - Dispatcher: delivery of ready notifications off the receive path
//!   - host::loopback(): in-process companion core for tests and bring-up
//!
//! DEPENDENCIES:
//!   - icc-hal: doorbell and cache-coherence seams
//!   - icc-sync: interrupt-masking spin lock and atomic bitset
//!   - parking_lot: per-slot wait objects and client queues
//!
//! LAYERING:
//!   ring -> wire -> transport -> registry -> sync_call / flow -> dispatch -> mailbox

#![forbid(unsafe_code)]
#![deny(clippy::all)]

pub mod budget;
pub mod config;
pub mod dispatch;
mod error;
pub mod flow;
pub mod host;
mod mailbox;
pub mod registry;
pub mod ring;
mod stats;
pub mod sync_call;
pub mod transport;
pub mod wire;

pub use config::{ConfigError, DispatchMode, MailboxConfig};
pub use error::{IccError, Result};
pub use mailbox::{ClientHandle, Mailbox};
pub use registry::Callback;
pub use stats::MailboxStats;
pub use transport::Platform;
pub use wire::{
    ClientId, Message, MessageFlags, Param, WireMessage, CONTROL_CLIENT, MAX_CLIENT,
    MAX_PERC_MSG, PAYLOAD_WORDS, WIRE_MESSAGE_SIZE,
};

/// Whether the caller may block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallContext {
    /// Task context: may sleep on wait objects and between retries.
    #[default]
    Suspendable,
    /// Interrupt handler or interrupts disabled: bounded spinning only.
    NonSuspendable,
}

bitflags::bitflags! {
    /// Conditions reported to a client's notification callback.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ReadyMask: u8 {
        /// The client's queue holds at least one message.
        const CAN_READ = 1 << 0;
        /// The client may send.
        const CAN_WRITE = 1 << 1;
    }
}

/// Per-send options for asynchronous messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub priority: bool,
    pub context: CallContext,
}

impl SendOptions {
    pub const fn urgent() -> Self {
        Self { priority: true, context: CallContext::Suspendable }
    }

    pub const fn from_interrupt() -> Self {
        Self { priority: false, context: CallContext::NonSuspendable }
    }
}
