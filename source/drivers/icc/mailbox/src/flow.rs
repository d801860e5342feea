// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Queue-occupancy backpressure between the two cores
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests
//!
//! Thresholds count free entries in a client's queue. Falling to `low_water` asks the peer
//! to pause that client; climbing back to `high_water` lets it resume. A per-client mark
//! ensures each transition is announced once.

use crate::wire::{ClientId, Message, WireError, CONTROL_CLIENT, MSG_FLOW_PAUSE, MSG_FLOW_RESUME};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
}

impl FlowSignal {
    pub const fn msg_id(self) -> u8 {
        match self {
            Self::Pause => MSG_FLOW_PAUSE,
            Self::Resume => MSG_FLOW_RESUME,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControl {
    low_water: usize,
    high_water: usize,
}

impl FlowControl {
    pub const fn new(low_water: usize, high_water: usize) -> Self {
        Self { low_water, high_water }
    }

    /// Decision after an enqueue left `free` entries; `paused` is the current mark.
    pub fn after_enqueue(&self, free: usize, paused: bool) -> Option<FlowSignal> {
        (!paused && free <= self.low_water).then_some(FlowSignal::Pause)
    }

    /// Decision after a dequeue left `free` entries; `paused` is the current mark.
    pub fn after_dequeue(&self, free: usize, paused: bool) -> Option<FlowSignal> {
        (paused && free >= self.high_water).then_some(FlowSignal::Resume)
    }

    /// Signal owed to the peer when `free` entries are left, whatever changed the queue.
    pub fn reconcile(&self, free: usize, paused: bool) -> Option<FlowSignal> {
        self.after_enqueue(free, paused).or_else(|| self.after_dequeue(free, paused))
    }
}

/// Builds the one-word control record announcing `signal` for `client`.
pub fn control_message(
    signal: FlowSignal,
    client: ClientId,
) -> core::result::Result<Message, WireError> {
    let word = u32::from(client.raw());
    Message::with_payload(CONTROL_CLIENT, CONTROL_CLIENT, signal.msg_id(), &[word])
}

/// Recognizes a flow-control record and returns the signal and the client it names.
pub fn parse_control(msg: &Message) -> Option<(FlowSignal, ClientId)> {
    if msg.dst != CONTROL_CLIENT {
        return None;
    }
    let signal = match msg.msg_id {
        MSG_FLOW_PAUSE => FlowSignal::Pause,
        MSG_FLOW_RESUME => FlowSignal::Resume,
        _ => return None,
    };
    let word = msg.param(0)?.word();
    let client = u8::try_from(word).ok()?;
    Some((signal, ClientId::new(client)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_fires_once_per_low_condition() {
        let fc = FlowControl::new(2, 5);
        let mut paused = false;
        let mut pauses = 0;
        for free in (0..8).rev() {
            if fc.after_enqueue(free, paused).is_some() {
                pauses += 1;
                paused = true;
            }
        }
        assert_eq!(pauses, 1);
    }

    #[test]
    fn resume_requires_high_water_and_mark() {
        let fc = FlowControl::new(2, 5);
        assert_eq!(fc.after_dequeue(4, true), None);
        assert_eq!(fc.after_dequeue(5, true), Some(FlowSignal::Resume));
        assert_eq!(fc.after_dequeue(8, false), None);
    }

    #[test]
    fn reconcile_matches_current_occupancy() {
        let fc = FlowControl::new(2, 5);
        assert_eq!(fc.reconcile(1, false), Some(FlowSignal::Pause));
        assert_eq!(fc.reconcile(1, true), None);
        assert_eq!(fc.reconcile(8, true), Some(FlowSignal::Resume));
        assert_eq!(fc.reconcile(3, true), None);
        assert_eq!(fc.reconcile(3, false), None);
    }

    #[test]
    fn control_message_round_trips() {
        let msg = control_message(FlowSignal::Pause, ClientId::new(7)).unwrap();
        assert_eq!(msg.src, CONTROL_CLIENT);
        assert_eq!(msg.payload()[0], 7);
        assert_eq!(parse_control(&msg), Some((FlowSignal::Pause, ClientId::new(7))));
        let decoded = msg.encode().decode();
        assert_eq!(parse_control(&decoded), Some((FlowSignal::Pause, ClientId::new(7))));
    }

    #[test]
    fn non_control_traffic_is_ignored() {
        let msg = Message::new(ClientId::new(1), ClientId::new(2), MSG_FLOW_PAUSE);
        assert_eq!(parse_control(&msg), None);
        let msg = Message::new(CONTROL_CLIENT, CONTROL_CLIENT, 0x10);
        assert_eq!(parse_control(&msg), None);
    }
}
