// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transport counters, updated lock-free on the hot paths and read as a snapshot.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Point-in-time copy of the mailbox counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Full-ring retries performed in task context.
    pub write_retries: u64,
    pub busy: u64,
    pub fatal: u64,
    /// Highest upstream occupancy observed by the drain loop, in bytes.
    pub upstream_peak: u32,
    pub late_replies: u64,
    /// Messages for clients that are not registered or whose queue was full.
    pub dropped: u64,
    pub pauses_sent: u64,
    pub resumes_sent: u64,
    pub pauses_received: u64,
    pub resumes_received: u64,
    pub sync_completed: u64,
    pub sync_timed_out: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub write_retries: AtomicU64,
    pub busy: AtomicU64,
    pub fatal: AtomicU64,
    pub upstream_peak: AtomicU32,
    pub late_replies: AtomicU64,
    pub dropped: AtomicU64,
    pub pauses_sent: AtomicU64,
    pub resumes_sent: AtomicU64,
    pub pauses_received: AtomicU64,
    pub resumes_received: AtomicU64,
    pub sync_completed: AtomicU64,
    pub sync_timed_out: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn observe_occupancy(&self, used: u32) {
        self.upstream_peak.fetch_max(used, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MailboxStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MailboxStats {
            messages_sent: get(&self.messages_sent),
            messages_received: get(&self.messages_received),
            write_retries: get(&self.write_retries),
            busy: get(&self.busy),
            fatal: get(&self.fatal),
            upstream_peak: self.upstream_peak.load(Ordering::Relaxed),
            late_replies: get(&self.late_replies),
            dropped: get(&self.dropped),
            pauses_sent: get(&self.pauses_sent),
            resumes_sent: get(&self.resumes_sent),
            pauses_received: get(&self.pauses_received),
            resumes_received: get(&self.resumes_received),
            sync_completed: get(&self.sync_completed),
            sync_timed_out: get(&self.sync_timed_out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_only_grows() {
        let c = Counters::default();
        c.observe_occupancy(128);
        c.observe_occupancy(64);
        bump(&c.busy);
        let s = c.snapshot();
        assert_eq!(s.upstream_peak, 128);
        assert_eq!(s.busy, 1);
        assert_eq!(s.fatal, 0);
    }
}
