// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for synchronous calls over the loopback companion core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 9 integration tests
//!
//! TEST_SCOPE:
//!   - Reply correlation by (destination, slot, sequence)
//!   - Task-context waits and interrupt-context polling
//!   - Slot release on every exit path
//!
//! TEST_SCENARIOS:
//!   - reply_with_wrong_sequence_is_ignored(): off-by-one reply discarded, real reply returned
//!   - poll_path_hands_off_unrelated_traffic(): interrupt-context call routes what it reads
//!   - poll_timeout_frees_slot(): bounded poll ends in TimedOut and the slot is reusable
//!   - suspendable_timeout_then_late_reply(): late reply is discarded, next call unaffected
//!   - source_mismatch_rejected(): declared source must be the caller
//!   - no_free_slot_when_all_outstanding(): 16 outstanding calls exhaust the client
//!   - unregister_wakes_pending_call(): waiter fails with InvalidClient
//!   - shutdown_wakes_pending_call(): waiter fails with ShutDown
//!   - concurrent_callers_get_their_own_replies(): replies matched per slot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use icc_mailbox::budget::Clock;
use icc_mailbox::host::{loopback, loopback_with_clock, PeerCore};
use icc_mailbox::{
    CallContext, ClientId, IccError, MailboxConfig, Message, MessageFlags, MAX_PERC_MSG,
};

const SERVICE: ClientId = ClientId::new(21);

fn request(src: ClientId, words: &[u32]) -> Message {
    Message::with_payload(src, SERVICE, 0x50, words).unwrap()
}

/// Clock that only moves when the test moves it.
#[derive(Default)]
struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    fn advance(&self, d: Duration) {
        self.now.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay(&self, d: Duration) {
        self.advance(d);
    }
}

/// Answers the next request with its first payload word doubled.
fn answer_one(peer: &PeerCore) -> Message {
    let req = peer.recv_timeout(Duration::from_secs(5)).expect("request");
    let reply = peer.reply_to(&req, &[req.payload()[0] * 2]).unwrap();
    peer.send(&reply).unwrap();
    req
}

#[test]
fn reply_with_wrong_sequence_is_ignored() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let client = mb.register_client(ClientId::new(3)).unwrap();

    let responder = thread::spawn(move || {
        let req = peer.recv_timeout(Duration::from_secs(5)).expect("request");
        assert!(req.flags.contains(MessageFlags::SYNC | MessageFlags::PRIORITY));
        let mut stale = peer.reply_to(&req, &[0xbad]).unwrap();
        stale.sequence += 1;
        peer.send(&stale).unwrap();
        let good = peer.reply_to(&req, &[req.payload()[0] + 1]).unwrap();
        peer.send(&good).unwrap();
        peer
    });

    let reply = client.send_sync(request(client.id(), &[41]), CallContext::Suspendable).unwrap();
    assert_eq!(reply.payload()[0], 42);
    let _peer = responder.join().unwrap();

    let stats = mb.stats();
    assert_eq!(stats.late_replies, 1);
    assert_eq!(stats.sync_completed, 1);
    assert_eq!(mb.registry().slots_in_use(client.id()), Ok(0));
}

#[test]
fn poll_path_hands_off_unrelated_traffic() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let caller = mb.register_client(ClientId::new(4)).unwrap();
    let other = mb.register_client(ClientId::new(5)).unwrap();

    // First call of a fresh client: slot 0, sequence 1.
    let mut expected = Message::with_payload(SERVICE, caller.id(), 0x50, &[7]).unwrap();
    expected.flags = MessageFlags::SYNC;
    expected.sequence = 1;
    let mut wrong = expected;
    wrong.sequence = 2;
    peer.send_quiet(&Message::new(SERVICE, other.id(), 0x61)).unwrap();
    peer.send_quiet(&wrong).unwrap();
    peer.send_quiet(&expected).unwrap();
    peer.send_quiet(&Message::new(SERVICE, other.id(), 0x62)).unwrap();

    let reply = caller.send_sync(request(caller.id(), &[1]), CallContext::NonSuspendable).unwrap();
    assert_eq!(reply, expected);
    assert_eq!(other.recv().unwrap().msg_id, 0x61);
    assert_eq!(other.recv().unwrap().msg_id, 0x62);
    assert_eq!(mb.stats().late_replies, 1);
    assert!(!peer.rings().upstream.not_empty());
}

#[test]
fn poll_timeout_frees_slot() {
    let cfg = MailboxConfig { poll_iterations: 1_000, ..MailboxConfig::default() };
    let (mb, peer) = loopback(cfg).unwrap();
    let client = mb.register_client(ClientId::new(6)).unwrap();

    let err = client.send_sync(request(client.id(), &[1]), CallContext::NonSuspendable);
    assert_eq!(err, Err(IccError::TimedOut));
    assert_eq!(mb.registry().slots_in_use(client.id()), Ok(0));
    assert_eq!(mb.registry().alloc_slot(client.id()), Ok(0));
    assert_eq!(mb.registry().free_slot(client.id(), 0), Ok(true));
    assert_eq!(mb.stats().sync_timed_out, 1);
    assert_eq!(peer.pending(), 1);
}

#[test]
fn suspendable_timeout_then_late_reply() {
    let clock = Arc::new(ManualClock::default());
    let (mb, peer) = loopback_with_clock(MailboxConfig::default(), clock.clone()).unwrap();
    let id = ClientId::new(7);
    mb.register_client(id).unwrap();

    let mb2 = Arc::clone(&mb);
    let caller = thread::spawn(move || mb2.send_sync(id, request(id, &[1]), CallContext::Suspendable));
    let first = peer.recv_timeout(Duration::from_secs(5)).expect("request");
    thread::sleep(Duration::from_millis(30));
    assert!(!caller.is_finished());
    clock.advance(mb.config().sync_timeout());
    assert_eq!(caller.join().unwrap(), Err(IccError::TimedOut));
    assert_eq!(mb.registry().slots_in_use(id), Ok(0));

    peer.send(&peer.reply_to(&first, &[99]).unwrap()).unwrap();
    assert_eq!(mb.stats().late_replies, 1);

    // The clock is frozen, so the second call can only end with its own reply.
    let mb2 = Arc::clone(&mb);
    let caller = thread::spawn(move || mb2.send_sync(id, request(id, &[10]), CallContext::Suspendable));
    let second = answer_one(&peer);
    assert_eq!(second.slot, first.slot);
    assert_eq!(second.sequence, first.sequence + 1);
    assert_eq!(caller.join().unwrap().map(|reply| reply.payload()[0]), Ok(20));
    assert_eq!(mb.stats().sync_timed_out, 1);
}

#[test]
fn source_mismatch_rejected() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let client = mb.register_client(ClientId::new(8)).unwrap();
    let err = client.send_sync(request(ClientId::new(9), &[]), CallContext::Suspendable);
    assert_eq!(err, Err(IccError::SourceMismatch));
    assert_eq!(peer.pending(), 0);
    assert_eq!(mb.registry().slots_in_use(client.id()), Ok(0));
}

#[test]
fn no_free_slot_when_all_outstanding() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let id = ClientId::new(10);
    mb.register_client(id).unwrap();
    for _ in 0..MAX_PERC_MSG {
        mb.registry().alloc_slot(id).unwrap();
    }
    let err = mb.send_sync(id, request(id, &[]), CallContext::Suspendable);
    assert_eq!(err, Err(IccError::NoFreeSlot));
    assert_eq!(peer.pending(), 0);
}

#[test]
fn unregister_wakes_pending_call() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let id = ClientId::new(11);
    mb.register_client(id).unwrap();
    let mb2 = Arc::clone(&mb);
    let caller = thread::spawn(move || mb2.send_sync(id, request(id, &[]), CallContext::Suspendable));
    assert!(peer.recv_timeout(Duration::from_secs(5)).is_some());
    mb.unregister_client(id).unwrap();
    assert_eq!(caller.join().unwrap(), Err(IccError::InvalidClient));
    assert_eq!(mb.registry().slots_in_use(id), Ok(0));
}

#[test]
fn shutdown_wakes_pending_call() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let id = ClientId::new(12);
    mb.register_client(id).unwrap();
    let mb2 = Arc::clone(&mb);
    let caller = thread::spawn(move || mb2.send_sync(id, request(id, &[]), CallContext::Suspendable));
    assert!(peer.recv_timeout(Duration::from_secs(5)).is_some());
    mb.shutdown();
    assert_eq!(caller.join().unwrap(), Err(IccError::ShutDown));
    assert_eq!(mb.register_client(id).err(), Some(IccError::ShutDown));
}

#[test]
fn concurrent_callers_get_their_own_replies() {
    let (mb, peer) = loopback(MailboxConfig::default()).unwrap();
    let id = ClientId::new(13);
    mb.register_client(id).unwrap();

    let callers: Vec<_> = (1..=4u32)
        .map(|n| {
            let mb = Arc::clone(&mb);
            thread::spawn(move || {
                let reply = mb.send_sync(id, request(id, &[n]), CallContext::Suspendable).unwrap();
                (n, reply.payload()[0])
            })
        })
        .collect();

    let mut requests = Vec::new();
    while requests.len() < 4 {
        requests.push(peer.recv_timeout(Duration::from_secs(5)).expect("request"));
    }
    let mut slots: Vec<u8> = requests.iter().map(|r| r.slot).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 4);
    for req in requests.iter().rev() {
        peer.send(&peer.reply_to(req, &[req.payload()[0] * 2]).unwrap()).unwrap();
    }
    for caller in callers {
        let (n, doubled) = caller.join().unwrap();
        assert_eq!(doubled, n * 2);
    }
}
