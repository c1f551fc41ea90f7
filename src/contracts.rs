//! Wire contracts for the Everline broadcast protocol
//!
//! The data packet is a fixed 27-byte record with no padding:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | kind tag (`DATA` = 2) |
//! | 1 | 16 | identity, NUL-padded |
//! | 17 | 6 | link address |
//! | 23 | 4 | event count, little-endian |
//!
//! There is no checksum. A same-length buffer with a valid tag is accepted
//! as-is, whatever its content.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::errors::{EverlineError, Result};

/// Size of the identity field on the wire
pub const IDENTITY_LEN: usize = 16;

/// Size of a link-layer address
pub const LINK_ADDRESS_LEN: usize = 6;

/// Fixed size of an encoded packet (1 + 16 + 6 + 4)
pub const PACKET_SIZE: usize = 1 + IDENTITY_LEN + LINK_ADDRESS_LEN + 4;

/// Packet discriminator. Only `Data` is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Data = 2,
}

impl PacketKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            2 => Ok(Self::Data),
            other => Err(EverlineError::UnknownPacketKind(other)),
        }
    }
}

/// Human-readable follower name, stored exactly as it travels on the wire.
///
/// Bytes after the first NUL are always zero, so two identities that render
/// the same also compare equal. Ordering is byte-wise on the terminated
/// content, which is what the leader's summary sorts by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FollowerIdentity([u8; IDENTITY_LEN]);

impl FollowerIdentity {
    /// Strict constructor: 1..=16 bytes, no interior NUL.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(EverlineError::InvalidIdentity("identity is empty".to_string()));
        }
        if name.len() > IDENTITY_LEN {
            return Err(EverlineError::InvalidIdentity(format!(
                "'{}' is {} bytes, limit is {}",
                name,
                name.len(),
                IDENTITY_LEN
            )));
        }
        if name.as_bytes().contains(&0) {
            return Err(EverlineError::InvalidIdentity(
                "identity contains a NUL byte".to_string(),
            ));
        }
        let mut raw = [0u8; IDENTITY_LEN];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self(raw))
    }

    /// Lossy constructor: cuts at the first NUL, then to 16 bytes on a char
    /// boundary.
    pub fn truncated(name: &str) -> Self {
        let name = name.split('\0').next().unwrap_or_default();
        let mut end = name.len().min(IDENTITY_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut raw = [0u8; IDENTITY_LEN];
        raw[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self(raw)
    }

    /// Normalizes a raw wire field: everything after the first NUL is zeroed.
    pub fn from_wire(field: [u8; IDENTITY_LEN]) -> Self {
        let mut raw = [0u8; IDENTITY_LEN];
        let len = field.iter().position(|&b| b == 0).unwrap_or(IDENTITY_LEN);
        raw[..len].copy_from_slice(&field[..len]);
        Self(raw)
    }

    /// Identity bytes up to the terminator.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(IDENTITY_LEN);
        &self.0[..len]
    }

    /// Full NUL-padded wire field.
    pub fn wire_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl fmt::Display for FollowerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for FollowerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FollowerIdentity({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl FromStr for FollowerIdentity {
    type Err = EverlineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Six-byte link-layer (MAC) address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LinkAddress(pub [u8; LINK_ADDRESS_LEN]);

impl LinkAddress {
    /// All-ones destination; every listener on the channel receives it.
    pub const BROADCAST: LinkAddress = LinkAddress([0xFF; LINK_ADDRESS_LEN]);

    pub fn new(octets: [u8; LINK_ADDRESS_LEN]) -> Self {
        Self(octets)
    }

    /// Random unicast address with the locally-administered bit set.
    pub fn random_local<R: Rng>(rng: &mut R) -> Self {
        let mut octets = [0u8; LINK_ADDRESS_LEN];
        rng.fill(&mut octets[..]);
        octets[0] = (octets[0] & 0xFC) | 0x02;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; LINK_ADDRESS_LEN] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

impl fmt::Debug for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkAddress({})", self)
    }
}

impl FromStr for LinkAddress {
    type Err = EverlineError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(|c: char| c == ':' || c == '-').collect();
        if parts.len() != LINK_ADDRESS_LEN {
            return Err(EverlineError::InvalidLinkAddress(s.to_string()));
        }
        let mut octets = [0u8; LINK_ADDRESS_LEN];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(EverlineError::InvalidLinkAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| EverlineError::InvalidLinkAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

/// Decoded data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub identity: FollowerIdentity,
    pub link_address: LinkAddress,
    pub event_count: u32,
}

impl Packet {
    /// Build a `DATA` packet
    pub fn data(identity: FollowerIdentity, link_address: LinkAddress, event_count: u32) -> Self {
        Self {
            kind: PacketKind::Data,
            identity,
            link_address,
            event_count,
        }
    }

    pub fn encode(&self) -> Bytes {
        encode(self)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        decode(raw)
    }
}

/// Serialize a packet into exactly `PACKET_SIZE` bytes.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(PACKET_SIZE);
    buf.put_u8(packet.kind.tag());
    buf.put_slice(packet.identity.wire_bytes());
    buf.put_slice(&packet.link_address.0);
    buf.put_u32_le(packet.event_count);
    debug_assert_eq!(buf.len(), PACKET_SIZE);
    buf.freeze()
}

/// Parse a received datagram.
///
/// Length is checked before the tag so a short foreign frame is reported as
/// a length problem rather than a kind problem.
pub fn decode(raw: &[u8]) -> Result<Packet> {
    if raw.len() != PACKET_SIZE {
        return Err(EverlineError::InvalidPacketLength {
            expected: PACKET_SIZE,
            received: raw.len(),
        });
    }

    let mut buf = raw;
    let kind = PacketKind::from_tag(buf.get_u8())?;

    let mut identity = [0u8; IDENTITY_LEN];
    buf.copy_to_slice(&mut identity);

    let mut link_address = [0u8; LINK_ADDRESS_LEN];
    buf.copy_to_slice(&mut link_address);

    let event_count = buf.get_u32_le();

    Ok(Packet {
        kind,
        identity: FollowerIdentity::from_wire(identity),
        link_address: LinkAddress(link_address),
        event_count,
    })
}

/// Leader-side record for one follower. Replaced wholesale on every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerState {
    pub identity: FollowerIdentity,
    pub link_address: LinkAddress,
    pub event_count: u32,
    /// Leader clock reading (ms) when the last valid packet arrived
    pub last_seen: u64,
}

impl FollowerState {
    pub fn from_packet(packet: &Packet, now_ms: u64) -> Self {
        Self {
            identity: packet.identity,
            link_address: packet.link_address,
            event_count: packet.event_count,
            last_seen: now_ms,
        }
    }

    /// Strictly-greater comparison: an entry exactly `timeout_ms` old is live.
    pub fn is_stale(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > timeout_ms
    }
}
