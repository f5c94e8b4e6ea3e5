//! Read-codec interface and the header material this crate interprets itself
//!
//! The codec collaborator owns the QUIC wire format: it splits a UDP payload
//! into coalesced packets, removes header protection, decrypts, and parses
//! frames. The connection core drives it one packet at a time and dispatches
//! on the structured [`CodecResult`].

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    cid::ConnectionId,
    crypto::{HeaderKey, Keys, PacketKey},
    frame::Frame,
    Version,
};

/// Packet number spaces
///
/// ACKs, packet numbers, and loss detection are independent per space; a
/// packet's space is a function of its header type alone.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    /// Zero-RTT and application data
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().copied()
    }
}

/// Epochs at which distinct key material protects packets
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    ZeroRtt,
    AppData,
}

/// Packet protection flavor, as recovered from the packet header
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ProtectionType {
    Initial,
    ZeroRtt,
    Handshake,
    KeyPhaseZero,
    KeyPhaseOne,
}

impl ProtectionType {
    pub fn encryption_level(self) -> EncryptionLevel {
        match self {
            Self::Initial => EncryptionLevel::Initial,
            Self::Handshake => EncryptionLevel::Handshake,
            Self::ZeroRtt => EncryptionLevel::ZeroRtt,
            Self::KeyPhaseZero | Self::KeyPhaseOne => EncryptionLevel::AppData,
        }
    }

    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::KeyPhaseZero | Self::KeyPhaseOne => SpaceId::Data,
        }
    }

    /// Whether packets of this type are fully protected
    ///
    /// Initial and Handshake packets are encrypted with publicly derivable
    /// material and only admit a restricted frame set.
    pub fn is_protected(self) -> bool {
        matches!(self, Self::ZeroRtt | Self::KeyPhaseZero | Self::KeyPhaseOne)
    }
}

/// Long header packet types the server can receive
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
}

impl LongType {
    pub fn protection(self) -> ProtectionType {
        match self {
            Self::Initial => ProtectionType::Initial,
            Self::ZeroRtt => ProtectionType::ZeroRtt,
            Self::Handshake => ProtectionType::Handshake,
        }
    }
}

/// Header of a successfully unprotected packet
#[derive(Debug, Clone)]
pub enum PacketHeader {
    Long {
        ty: LongType,
        version: Version,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: u64,
    },
    Short {
        dst_cid: ConnectionId,
        number: u64,
        key_phase: bool,
    },
}

impl PacketHeader {
    pub fn number(&self) -> u64 {
        match *self {
            Self::Long { number, .. } | Self::Short { number, .. } => number,
        }
    }

    pub fn protection(&self) -> ProtectionType {
        match *self {
            Self::Long { ty, .. } => ty.protection(),
            Self::Short { key_phase, .. } => {
                if key_phase {
                    ProtectionType::KeyPhaseOne
                } else {
                    ProtectionType::KeyPhaseZero
                }
            }
        }
    }

    pub fn space(&self) -> SpaceId {
        self.protection().space()
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.protection().encryption_level()
    }

    pub fn long_version(&self) -> Option<Version> {
        match *self {
            Self::Long { version, .. } => Some(version),
            Self::Short { .. } => None,
        }
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Self::Long { dst_cid, .. } | Self::Short { dst_cid, .. } => dst_cid,
        }
    }
}

/// A fully decrypted and parsed packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub frames: Vec<Frame>,
}

/// A packet the codec could not decrypt yet because the corresponding read
/// key has not been installed
#[derive(Debug, Clone)]
pub struct UndecryptablePacket {
    pub protection: ProtectionType,
    pub data: Bytes,
}

/// Outcome of asking the codec for the next packet in a UDP payload
pub enum CodecResult {
    /// A regular packet
    Packet(Packet),
    /// Keys for this epoch are not installed yet; the packet may be buffered
    /// and replayed later
    CipherUnavailable(UndecryptablePacket),
    /// A retry packet, which a server must never accept
    Retry,
    /// A stateless reset, which a server must never accept
    StatelessReset,
    /// Nothing usable could be extracted
    Nothing,
}

/// Per-connection read codec
///
/// Created once the first Initial has been seen and the Initial read keys are
/// derivable. Subsequent read keys are pushed in as the handshake makes them
/// available.
pub trait ReadCodec: Send {
    /// Parse and remove one coalesced packet from the front of `data`
    ///
    /// `largest_pns` carries the largest received packet number per space for
    /// packet number decoding.
    fn parse_packet(&mut self, data: &mut BytesMut, largest_pns: &[Option<u64>; 3]) -> CodecResult;

    /// The client-chosen connection ID from the first Initial
    fn client_connection_id(&self) -> &ConnectionId;

    fn install_zero_rtt_key(&mut self, key: Box<dyn PacketKey>);
    fn install_zero_rtt_header_key(&mut self, key: Box<dyn HeaderKey>);
    fn install_handshake_keys(&mut self, keys: Keys);
    fn install_one_rtt_key(&mut self, key: Box<dyn PacketKey>);
    fn install_one_rtt_header_key(&mut self, key: Box<dyn HeaderKey>);

    /// Drop the Initial read keys; packets of that epoch are undecryptable
    /// from now on
    fn discard_initial_keys(&mut self);

    /// Update the exponent used to scale ack delay fields in parsed ACKs
    fn set_ack_delay_exponent(&mut self, exponent: u8);
}

/// Builds the per-connection read codec once the first Initial has been
/// accepted
pub trait CodecFactory: Send + Sync {
    fn new_codec(
        &self,
        version: Version,
        client_cid: ConnectionId,
        server_cid: ConnectionId,
        initial_read_keys: Keys,
    ) -> Box<dyn ReadCodec>;
}

/// The version-independent prefix of a long header
#[derive(Debug, Clone)]
pub struct HeaderInvariant {
    pub wire_version: u32,
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
}

/// Parse the invariant long header fields from the front of a datagram
///
/// Used exactly once per connection, before any codec exists, to bootstrap
/// from the client's first flight. Returns `None` for anything that is not a
/// well-formed long header.
pub fn parse_header_invariant(data: &[u8]) -> Option<HeaderInvariant> {
    let mut buf = data;
    if buf.remaining() < 1 {
        return None;
    }
    let first = buf.get_u8();
    // Long header form bit
    if first & 0x80 == 0 {
        return None;
    }
    if buf.remaining() < 4 {
        return None;
    }
    let wire_version = buf.get_u32();
    let dst_cid = parse_cid(&mut buf)?;
    let src_cid = parse_cid(&mut buf)?;
    Some(HeaderInvariant {
        wire_version,
        dst_cid,
        src_cid,
    })
}

fn parse_cid(buf: &mut &[u8]) -> Option<ConnectionId> {
    if buf.remaining() < 1 {
        return None;
    }
    let len = buf.get_u8() as usize;
    if len > crate::cid::MAX_CID_SIZE || buf.remaining() < len {
        return None;
    }
    let cid = ConnectionId::new(&buf.chunk()[..len]);
    buf.advance(len);
    Some(cid)
}
