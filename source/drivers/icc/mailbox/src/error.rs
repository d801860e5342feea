// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for mailbox operations.

use crate::wire::WireError;

/// Result type returned by mailbox operations.
pub type Result<T> = core::result::Result<T, IccError>;

/// Errors produced by the mailbox transport and its clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IccError {
    /// Client id out of range, reserved, or not registered.
    #[error("invalid or unregistered client")]
    InvalidClient,
    /// The client id is already registered.
    #[error("client already open")]
    AlreadyOpen,
    /// Every synchronous-call slot of the client is in use.
    #[error("no free semaphore slot")]
    NoFreeSlot,
    /// Semaphore slot index outside the per-client range.
    #[error("semaphore slot out of range")]
    InvalidSlot,
    /// Downstream ring full and the caller cannot wait for space.
    #[error("mailbox ring full")]
    Busy,
    /// Peer stopped draining the ring; the client needs recovery.
    #[error("peer core unresponsive")]
    Fatal,
    /// The client was marked unusable by an earlier `Fatal`.
    #[error("client blocked until peer recovery")]
    PeerBlocked,
    /// No matching reply arrived within the call budget.
    #[error("synchronous call timed out")]
    TimedOut,
    /// Nothing to receive, or the peer asked this client to pause sending.
    #[error("operation would block")]
    WouldBlock,
    /// Message source differs from the calling client.
    #[error("message source does not match caller")]
    SourceMismatch,
    /// A notification worker could not be started.
    #[error("dispatcher worker unavailable")]
    Dispatch,
    /// The mailbox has been shut down.
    #[error("mailbox shut down")]
    ShutDown,
    /// A record could not be built.
    #[error(transparent)]
    Wire(#[from] WireError),
}
