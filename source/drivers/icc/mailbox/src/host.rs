// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process companion core for host-based testing and bring-up
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - loopback(): mailbox plus a PeerCore sharing the same pair of rings
//!   - loopback_with_clock(): same, with an injected clock for retries and call deadlines
//!   - PeerCore: reads downstream records, writes upstream records and raises the
//!     control core's interrupt
//!
//! INVARIANTS:
//!   - PeerCore is the only producer on the upstream ring and the only consumer on the
//!     downstream ring
//!   - `send` runs the mailbox interrupt handler on the calling thread; `send_quiet` leaves
//!     the record for a poller
//!
//! DEPENDENCIES:
//!   - parking_lot::{Mutex, Condvar}: doorbell wakeups for `recv_timeout`

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use icc_hal::{Coherence, CoherentFabric, Doorbell};
use icc_sync::NoIrq;
use parking_lot::{Condvar, Mutex};

use crate::budget::{Clock, HostClock};
use crate::config::{ConfigError, MailboxConfig};
use crate::ring::SharedRings;
use crate::transport::Platform;
use crate::wire::{Message, MessageFlags, WireError, WireMessage, WIRE_MESSAGE_SIZE, WIRE_WORDS};
use crate::{IccError, Mailbox, Result};

/// Doorbell of the companion core: counts rings and wakes a waiting `recv_timeout`.
#[derive(Default)]
pub struct PeerBell {
    rings: Mutex<u64>,
    cv: Condvar,
}

impl PeerBell {
    pub fn count(&self) -> u64 {
        *self.rings.lock()
    }
}

impl Doorbell for PeerBell {
    fn ring(&self) {
        *self.rings.lock() += 1;
        self.cv.notify_all();
    }
}

/// Creates a mailbox wired to an in-process companion core.
pub fn loopback(config: MailboxConfig) -> core::result::Result<(Arc<Mailbox>, PeerCore), ConfigError> {
    loopback_with_clock(config, Arc::new(HostClock::new()))
}

pub fn loopback_with_clock(
    config: MailboxConfig,
    clock: Arc<dyn Clock>,
) -> core::result::Result<(Arc<Mailbox>, PeerCore), ConfigError> {
    config.validate()?;
    let rings = SharedRings::new(config.ring_capacity);
    let bell = Arc::new(PeerBell::default());
    let coherence: Arc<dyn Coherence> = Arc::new(CoherentFabric);
    let platform = Platform {
        coherence: Arc::clone(&coherence),
        doorbell: bell.clone(),
        irq: Arc::new(NoIrq),
        clock,
    };
    let mailbox = Arc::new(Mailbox::new(config, rings.clone(), platform)?);
    let peer = PeerCore { rings, coherence, mailbox: Arc::downgrade(&mailbox), bell };
    Ok((mailbox, peer))
}

/// The companion core's end of the mailbox.
pub struct PeerCore {
    rings: SharedRings,
    coherence: Arc<dyn Coherence>,
    mailbox: Weak<Mailbox>,
    bell: Arc<PeerBell>,
}

impl PeerCore {
    /// Takes the next record the control core sent, if any.
    pub fn recv(&self) -> Option<Message> {
        let mut words = [0u32; WIRE_WORDS];
        self.rings
            .downstream
            .pop_words(&mut words, &*self.coherence)
            .then(|| WireMessage::from_words(words).decode())
    }

    /// Waits up to `timeout` for the next record.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.bell.count();
            if let Some(msg) = self.recv() {
                return Some(msg);
            }
            let mut rings = self.bell.rings.lock();
            if *rings == seen && self.bell.cv.wait_until(&mut rings, deadline).timed_out() {
                drop(rings);
                return self.recv();
            }
        }
    }

    /// Writes `msg` upstream and raises the control core's interrupt.
    pub fn send(&self, msg: &Message) -> Result<()> {
        self.send_quiet(msg)?;
        self.raise_irq();
        Ok(())
    }

    /// Writes `msg` upstream without raising the interrupt.
    pub fn send_quiet(&self, msg: &Message) -> Result<()> {
        if self.rings.upstream.push_words(msg.encode().words(), &*self.coherence) {
            Ok(())
        } else {
            Err(IccError::Busy)
        }
    }

    /// Runs the control core's interrupt handler. Returns the records it routed.
    pub fn raise_irq(&self) -> usize {
        self.mailbox.upgrade().map_or(0, |mb| mb.handle_interrupt())
    }

    /// Builds the reply to a synchronous `request` carrying `words`.
    pub fn reply_to(&self, request: &Message, words: &[u32]) -> core::result::Result<Message, WireError> {
        let mut reply = Message::with_payload(request.dst, request.src, request.msg_id, words)?;
        reply.slot = request.slot;
        reply.sequence = request.sequence;
        reply.flags = MessageFlags::SYNC;
        Ok(reply)
    }

    /// Number of times the control core rang this core's doorbell.
    pub fn doorbells(&self) -> u64 {
        self.bell.count()
    }

    /// Records waiting in the downstream ring.
    pub fn pending(&self) -> usize {
        self.rings.downstream.used() as usize / WIRE_MESSAGE_SIZE
    }

    pub fn rings(&self) -> &SharedRings {
        &self.rings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ClientId;
    use crate::SendOptions;
    use std::thread;

    #[test]
    fn loopback_carries_both_directions() {
        let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
        let client = mb.register_client(ClientId::new(2)).unwrap();
        client.send(client.message(ClientId::new(8), 0x11), SendOptions::default()).unwrap();
        assert_eq!(peer.doorbells(), 1);
        assert_eq!(peer.pending(), 1);
        let got = peer.recv().unwrap();
        assert_eq!((got.src, got.dst, got.msg_id), (ClientId::new(2), ClientId::new(8), 0x11));

        let back = Message::with_payload(ClientId::new(8), ClientId::new(2), 0x12, &[5]).unwrap();
        peer.send(&back).unwrap();
        assert_eq!(client.recv().unwrap().payload()[0], 5);
    }

    #[test]
    fn recv_timeout_wakes_on_doorbell() {
        let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
        mb.register_client(ClientId::new(3)).unwrap();
        let sender = Arc::clone(&mb);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let msg = Message::new(ClientId::new(3), ClientId::new(4), 1);
            sender.send(ClientId::new(3), msg, SendOptions::default()).unwrap();
        });
        assert!(peer.recv_timeout(Duration::from_secs(5)).is_some());
        t.join().unwrap();
        assert!(peer.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn reply_copies_correlation_fields() {
        let (_mb, peer) = loopback(MailboxConfig::default()).unwrap();
        let mut req = Message::new(ClientId::new(5), ClientId::new(9), 0x20);
        req.slot = 3;
        req.sequence = 41;
        let reply = peer.reply_to(&req, &[1, 2]).unwrap();
        assert!(reply.answers(ClientId::new(5), 3, 41));
    }
}
