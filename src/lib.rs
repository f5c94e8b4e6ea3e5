//! Protocol state machine for the server side of a QUIC connection.
//!
//! This crate contains no networking or cryptographic code. It accepts
//! already-received UDP payloads from a caller-owned event loop, drives them
//! through an externally supplied read codec and TLS handshake engine, and
//! mutates per-connection state: packet-number spaces and acknowledgement
//! scheduling, RTT estimation, logical stream lifecycle, and peer address
//! migration. Everything runs synchronously on the thread that owns the
//! connection; timers and writes are signalled to the driver through pending
//! event flags.

use std::{fmt, ops};

mod range_set;
pub use range_set::{ArrayRangeSet, RangeSet};

mod varint;
pub use varint::{VarInt, VarIntBoundsExceeded};

mod transport_error;
pub use transport_error::{Code as TransportErrorCode, TransportError};

pub mod frame;
pub use frame::Frame;

pub mod cid;
pub use cid::ConnectionId;

pub mod codec;
pub use codec::{CodecResult, EncryptionLevel, Packet, PacketHeader, ProtectionType, SpaceId};

pub mod crypto;
pub mod handshake;

pub mod congestion;

mod qlog;
pub use qlog::{PacketDropReason, QlogSink};

mod config;
pub use config::{
    D6dConfig, DatagramConfig, ServerConfig, TransportConfig, ZeroRttSourceTokenMatchingPolicy,
};

pub mod knobs;

pub mod transport_parameters;

mod connection;
pub use connection::{
    datagrams::Datagrams,
    paths::{CongestionAndRttState, MigrationState, RttEstimator},
    spaces::{AckState, CryptoStream, PacketSpace, Retransmits, SentFrame, SentPacket},
    stats::{ConnectionStats, FrameStats},
    streams::{
        LocalStreamError, Priority, RecvState, SendState, StreamBuffer, StreamFlowControl,
        StreamManager, StreamPriorityObserver, StreamState, WriteBufferMeta,
    },
    CloseCode, Connection, ConnectionFlowControl, PendingEvents, ReadData, State,
};

#[cfg(test)]
mod tests;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub(crate) fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().copied()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The low two bits encode the initiating side and the directionality;
/// consecutive streams of the same kind are spaced [`STREAM_ID_INCREMENT`]
/// apart.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a new StreamId
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Whether the given side may send application data on this stream
    pub fn is_send_side(self, side: Side) -> bool {
        self.dir() == Dir::Bi || self.initiator() == side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} {} stream {}", initiator, self.dir(), self.index())
    }
}

impl From<StreamId> for u64 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl From<u64> for StreamId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// QUIC versions this server recognizes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Version {
    /// IETF draft 29
    Draft29,
    /// RFC 9000
    V1,
    /// Internal version identifier for staged experiments; behaves as V1
    /// except where explicitly hooked
    Experimental,
}

impl Version {
    /// The wire encoding reserved for version negotiation packets
    pub const NEGOTIATION: u32 = 0;

    /// Decode a version field from a long header
    pub fn from_wire(wire: u32) -> Option<Self> {
        match wire {
            0xff00_001d => Some(Self::Draft29),
            0x0000_0001 => Some(Self::V1),
            0xfaceb00e => Some(Self::Experimental),
            _ => None,
        }
    }
}

//
// Useful internal constants
//

/// Stride between consecutive stream IDs of the same initiator and directionality
pub const STREAM_ID_INCREMENT: u64 = 4;

/// Lowest-urgency stream priority level; level 0 is the most urgent
pub const MAX_PRIORITY: u8 = 7;

/// The maximum number of streams of one kind that may exist over a connection's lifetime
pub const MAX_STREAM_COUNT: u64 = 1 << 60;

/// Packet numbers above this cannot be represented; approaching it forces a close
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Smallest destination connection ID a client may send in its first Initial
pub(crate) const MIN_INITIAL_DST_CID_LEN: usize = 8;

/// Coalesced QUIC packets processed from a single UDP datagram before yielding
pub(crate) const MAX_COALESCED_PACKETS: usize = 6;

/// Lowest `max_udp_payload_size` a peer may advertise
pub(crate) const MIN_MAX_UDP_PAYLOAD: u64 = 1200;

/// Largest UDP payload we will ever send, and the default PMTU probing ceiling
pub(crate) const MAX_UDP_PAYLOAD: u64 = 1452;

/// Conservative default UDP payload size before path MTU is known
pub(crate) const DEFAULT_UDP_SEND_PACKET_LEN: u64 = 1252;

/// `max_ack_delay` values at or above this are a transport parameter error
pub(crate) const MAX_ACK_DELAY_MS: u64 = 1 << 14;

/// Largest permitted `ack_delay_exponent`
pub(crate) const MAX_ACK_DELAY_EXPONENT: u64 = 20;

pub(crate) const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;

pub(crate) const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

/// Ceiling applied to the peer's advertised idle timeout
pub(crate) const MAX_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// Framing overhead that makes smaller DATAGRAM size advertisements useless
pub(crate) const MAX_DATAGRAM_PACKET_OVERHEAD: u64 = 10;

/// Peer address changes tolerated over the lifetime of a connection
pub(crate) const MAX_MIGRATIONS: u32 = 6;

/// How long saved congestion and RTT state stays restorable after migrating
/// away from a validated path
pub(crate) const CONGESTION_STATE_RETENTION: std::time::Duration =
    std::time::Duration::from_secs(60);

/// Client IPs remembered in the zero-RTT source address token
pub(crate) const MAX_TOKEN_SOURCE_ADDRESSES: usize = 3;

/// Attempts to find an acceptable self connection ID before settling
pub(crate) const CID_ENCODING_RETRY_LIMIT: usize = 16;

/// Sentinel minimum RTT before the first sample arrives
pub(crate) const DEFAULT_MIN_RTT: std::time::Duration = std::time::Duration::MAX;

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn stream_id_parity() {
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        assert_eq!(u64::from(id), 0);
        let id = StreamId::new(Side::Server, Dir::Bi, 0);
        assert_eq!(u64::from(id), 1);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        assert_eq!(u64::from(id), 2);
        let id = StreamId::new(Side::Server, Dir::Uni, 3);
        assert_eq!(u64::from(id), 15);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn version_wire_codes() {
        assert_eq!(Version::from_wire(1), Some(Version::V1));
        assert_eq!(Version::from_wire(0xff00_001d), Some(Version::Draft29));
        assert_eq!(Version::from_wire(0), None);
        assert_eq!(Version::from_wire(0x5a5a_5a5a), None);
    }
}
