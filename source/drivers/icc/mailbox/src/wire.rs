// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-size mailbox wire record and its decoded form
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (both cores must be rebuilt together on any change)
//! TEST_COVERAGE: unit tests + proptest round trip
//!
//! WIRE LAYOUT (little-endian, 64 bytes):
//!   - byte 0: source client id
//!   - byte 1: destination client id
//!   - byte 2: message id
//!   - byte 3: parameter attribute mask (bit n set => payload word n is an address)
//!   - bytes 4..8: sequence number (u32)
//!   - byte 8: semaphore slot index
//!   - byte 9: flags (bit 0 synchronous, bit 1 priority)
//!   - bytes 10..12: reserved, zero
//!   - bytes 12..64: payload, 13 x u32
//!
//! INVARIANTS:
//!   - `WIRE_MESSAGE_SIZE` is the ring quantum on both cores
//!   - decode(encode(m)) == m for every message built through the public constructors
//!   - address-tagged words are carried verbatim; translation happens outside this layer

use core::fmt;

/// Number of payload words per message.
pub const PAYLOAD_WORDS: usize = 13;
/// Total message size in 32-bit words.
pub const WIRE_WORDS: usize = HEADER_WORDS + PAYLOAD_WORDS;
/// Total message size in bytes; the ring quantum.
pub const WIRE_MESSAGE_SIZE: usize = WIRE_WORDS * 4;
/// Payload words that can carry an address tag (width of the attribute mask).
pub const ADDRESS_TAG_WORDS: usize = 8;

/// Number of client ids, including the reserved control endpoint.
pub const MAX_CLIENT: usize = 32;
/// Synchronous-call slots per client.
pub const MAX_PERC_MSG: usize = 16;
/// Reserved endpoint that carries transport control traffic.
pub const CONTROL_CLIENT: ClientId = ClientId(0);

/// Control message: receiver queue is nearly full, stop sending for the client in word 0.
pub const MSG_FLOW_PAUSE: u8 = 0xf0;
/// Control message: receiver queue drained, sending may resume for the client in word 0.
pub const MSG_FLOW_RESUME: u8 = 0xf1;

const HEADER_WORDS: usize = 3;
const FLAG_SYNC: u8 = 1 << 0;
const FLAG_PRIORITY: u8 = 1 << 1;

/// Logical endpoint on the control core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u8);

impl ClientId {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u8> for ClientId {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

bitflags::bitflags! {
    /// Flag bits carried in byte 9 of the wire record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        /// Message belongs to a synchronous call (request or reply).
        const SYNC = FLAG_SYNC;
        /// Message should be handled ahead of normal traffic.
        const PRIORITY = FLAG_PRIORITY;
    }
}

/// One payload word, either a plain value or an address the peer must not reinterpret.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Param {
    Value(u32),
    Address(u32),
}

impl Param {
    pub const fn word(self) -> u32 {
        match self {
            Self::Value(w) | Self::Address(w) => w,
        }
    }

    pub const fn is_address(self) -> bool {
        matches!(self, Self::Address(_))
    }
}

impl Default for Param {
    fn default() -> Self {
        Self::Value(0)
    }
}

/// Errors raised while building a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Payload index beyond `PAYLOAD_WORDS`.
    #[error("payload index {0} out of range")]
    PayloadIndex(usize),
    /// Address tag requested for a word the attribute mask cannot describe.
    #[error("payload word {0} cannot carry an address tag")]
    AddressIndex(usize),
    /// More payload words supplied than fit in one message.
    #[error("payload of {0} words does not fit")]
    PayloadTooLong(usize),
}

/// Decoded mailbox message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Message {
    pub src: ClientId,
    pub dst: ClientId,
    pub msg_id: u8,
    pub sequence: u32,
    pub slot: u8,
    pub flags: MessageFlags,
    params: [Param; PAYLOAD_WORDS],
}

impl Message {
    /// Creates a message with an all-zero payload.
    pub fn new(src: ClientId, dst: ClientId, msg_id: u8) -> Self {
        Self {
            src,
            dst,
            msg_id,
            sequence: 0,
            slot: 0,
            flags: MessageFlags::empty(),
            params: [Param::default(); PAYLOAD_WORDS],
        }
    }

    /// Creates a message whose leading payload words are `words` (all plain values).
    pub fn with_payload(
        src: ClientId,
        dst: ClientId,
        msg_id: u8,
        words: &[u32],
    ) -> core::result::Result<Self, WireError> {
        if words.len() > PAYLOAD_WORDS {
            return Err(WireError::PayloadTooLong(words.len()));
        }
        let mut msg = Self::new(src, dst, msg_id);
        for (param, &w) in msg.params.iter_mut().zip(words) {
            *param = Param::Value(w);
        }
        Ok(msg)
    }

    pub fn set_value(&mut self, index: usize, value: u32) -> core::result::Result<(), WireError> {
        let slot = self.params.get_mut(index).ok_or(WireError::PayloadIndex(index))?;
        *slot = Param::Value(value);
        Ok(())
    }

    /// Tags payload word `index` as an address.
    pub fn set_address(&mut self, index: usize, addr: u32) -> core::result::Result<(), WireError> {
        if index >= PAYLOAD_WORDS {
            return Err(WireError::PayloadIndex(index));
        }
        if index >= ADDRESS_TAG_WORDS {
            return Err(WireError::AddressIndex(index));
        }
        self.params[index] = Param::Address(addr);
        Ok(())
    }

    pub fn param(&self, index: usize) -> Option<Param> {
        self.params.get(index).copied()
    }

    pub fn params(&self) -> &[Param; PAYLOAD_WORDS] {
        &self.params
    }

    /// Raw payload words with address tags stripped.
    pub fn payload(&self) -> [u32; PAYLOAD_WORDS] {
        let mut out = [0u32; PAYLOAD_WORDS];
        for (o, p) in out.iter_mut().zip(&self.params) {
            *o = p.word();
        }
        out
    }

    /// Attribute mask describing which payload words are addresses.
    pub fn param_attr(&self) -> u8 {
        self.params
            .iter()
            .take(ADDRESS_TAG_WORDS)
            .enumerate()
            .filter(|(_, p)| p.is_address())
            .fold(0u8, |acc, (i, _)| acc | (1 << i))
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(MessageFlags::SYNC)
    }

    pub fn is_priority(&self) -> bool {
        self.flags.contains(MessageFlags::PRIORITY)
    }

    /// Returns true when this is the reply to the call stamped with (`caller`, `slot`, `sequence`).
    ///
    /// All three must agree; a partial match is not a reply.
    pub fn answers(&self, caller: ClientId, slot: u8, sequence: u32) -> bool {
        self.is_sync() && self.dst == caller && self.slot == slot && self.sequence == sequence
    }

    pub fn encode(&self) -> WireMessage {
        encode(self)
    }
}

/// Raw wire record as it sits in the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WireMessage {
    words: [u32; WIRE_WORDS],
}

impl WireMessage {
    pub const fn from_words(words: [u32; WIRE_WORDS]) -> Self {
        Self { words }
    }

    pub const fn words(&self) -> &[u32; WIRE_WORDS] {
        &self.words
    }

    pub fn to_bytes(&self) -> [u8; WIRE_MESSAGE_SIZE] {
        let mut buf = [0u8; WIRE_MESSAGE_SIZE];
        for (chunk, w) in buf.chunks_exact_mut(4).zip(&self.words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8; WIRE_MESSAGE_SIZE]) -> Self {
        let mut words = [0u32; WIRE_WORDS];
        for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { words }
    }

    pub fn src(&self) -> ClientId {
        ClientId(self.words[0] as u8)
    }

    pub fn dst(&self) -> ClientId {
        ClientId((self.words[0] >> 8) as u8)
    }

    pub fn msg_id(&self) -> u8 {
        (self.words[0] >> 16) as u8
    }

    pub fn param_attr(&self) -> u8 {
        (self.words[0] >> 24) as u8
    }

    pub fn sequence(&self) -> u32 {
        self.words[1]
    }

    pub fn slot(&self) -> u8 {
        self.words[2] as u8
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate((self.words[2] >> 8) as u8)
    }

    pub fn decode(&self) -> Message {
        decode(self)
    }
}

/// Translates a decoded message into its wire record.
pub fn encode(msg: &Message) -> WireMessage {
    let mut words = [0u32; WIRE_WORDS];
    words[0] = u32::from_le_bytes([msg.src.0, msg.dst.0, msg.msg_id, msg.param_attr()]);
    words[1] = msg.sequence;
    words[2] = u32::from_le_bytes([msg.slot, msg.flags.bits(), 0, 0]);
    words[HEADER_WORDS..].copy_from_slice(&msg.payload());
    WireMessage { words }
}

/// Translates a wire record into a decoded message. Unknown flag bits are dropped.
pub fn decode(wire: &WireMessage) -> Message {
    let attr = wire.param_attr();
    let mut params = [Param::default(); PAYLOAD_WORDS];
    for (i, (param, &w)) in params.iter_mut().zip(&wire.words[HEADER_WORDS..]).enumerate() {
        *param = if i < ADDRESS_TAG_WORDS && attr & (1 << i) != 0 {
            Param::Address(w)
        } else {
            Param::Value(w)
        };
    }
    Message {
        src: wire.src(),
        dst: wire.dst(),
        msg_id: wire.msg_id(),
        sequence: wire.sequence(),
        slot: wire.slot(),
        flags: wire.flags(),
        params,
    }
}
