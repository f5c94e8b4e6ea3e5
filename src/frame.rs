//! Parsed frame representation
//!
//! The wire codec owns framing and header protection; what it hands this
//! crate is the structured form below. Frames therefore carry decoded
//! values (ack delay already scaled by the peer's `ack_delay_exponent`,
//! payloads as owned [`Bytes`]) rather than raw wire ranges.

use std::{fmt, ops::Range};

use bytes::Bytes;

use crate::{range_set::ArrayRangeSet, Dir, StreamId, TransportErrorCode, VarInt};

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    Crypto(Crypto),
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    Close(Close),
    Datagram(Datagram),
    Simple(SimpleFrame),
}

impl Frame {
    /// Whether receipt of this frame makes the packet it arrived in count
    /// towards the ack-elicitation thresholds
    ///
    /// PING and DATAGRAM are not retransmitted on loss but are counted here
    /// anyway so that they are acknowledged promptly.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Self::Padding | Self::Ack(_) | Self::Close(_))
    }

    /// Whether this frame may appear in a packet without qualifying the
    /// packet as non-probing
    ///
    /// A packet consisting solely of probing frames must not trigger
    /// connection migration.
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Self::Padding
                | Self::Simple(SimpleFrame::PathChallenge(_))
                | Self::Simple(SimpleFrame::PathResponse(_))
        )
    }

    /// Whether this frame carries handshake data
    pub fn is_crypto(&self) -> bool {
        matches!(self, Self::Crypto(_))
    }

    /// Whether this frame is permitted in packets that are not fully protected
    /// (Initial and Handshake encryption levels)
    pub fn permitted_unprotected(&self) -> bool {
        matches!(
            self,
            Self::Padding | Self::Ack(_) | Self::Close(_) | Self::Crypto(_) | Self::Ping
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Padding => "PADDING",
            Self::Ping => "PING",
            Self::Ack(_) => "ACK",
            Self::ResetStream(_) => "RESET_STREAM",
            Self::Crypto(_) => "CRYPTO",
            Self::Stream(_) => "STREAM",
            Self::MaxData(_) => "MAX_DATA",
            Self::MaxStreamData { .. } => "MAX_STREAM_DATA",
            Self::DataBlocked { .. } => "DATA_BLOCKED",
            Self::StreamDataBlocked { .. } => "STREAM_DATA_BLOCKED",
            Self::StreamsBlocked { .. } => "STREAMS_BLOCKED",
            Self::Close(_) => "CONNECTION_CLOSE",
            Self::Datagram(_) => "DATAGRAM",
            Self::Simple(simple) => simple.name(),
        };
        f.write_str(name)
    }
}

/// An ACK frame, with ACK_ECN folded in via the optional `ecn` counts
#[derive(Debug, Clone)]
pub struct Ack {
    /// Largest packet number being acknowledged
    pub largest: u64,
    /// Time the peer held `largest` before acknowledging it, already scaled
    /// by the peer's ack delay exponent
    pub delay: std::time::Duration,
    /// Acknowledged packet number ranges, ascending
    pub ranges: ArrayRangeSet,
    /// ECN counters, present iff the frame was ACK_ECN on the wire
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.ranges.iter()
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Copy, Clone)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: VarInt,
    pub final_size: u64,
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
}

/// CONNECTION_CLOSE in either its transport or application form
#[derive(Debug, Clone)]
pub enum Close {
    Connection(ConnectionClose),
    Application(ApplicationClose),
}

impl Close {
    pub fn reason(&self) -> &Bytes {
        match self {
            Self::Connection(x) => &x.reason,
            Self::Application(x) => &x.reason,
        }
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: TransportErrorCode,
    /// Type of the frame that triggered the close, if any
    pub frame_type: Option<u64>,
    pub reason: Bytes,
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone)]
pub struct ApplicationClose {
    pub error_code: VarInt,
    pub reason: Bytes,
}

/// Frames with no stream payload, dispatched through a single handler
#[derive(Debug, Clone)]
pub enum SimpleFrame {
    StopSending { id: StreamId, error_code: VarInt },
    MaxStreams { dir: Dir, count: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    NewToken { token: Bytes },
    PathChallenge(u64),
    PathResponse(u64),
    HandshakeDone,
}

impl SimpleFrame {
    fn name(&self) -> &'static str {
        match self {
            Self::StopSending { .. } => "STOP_SENDING",
            Self::MaxStreams { .. } => "MAX_STREAMS",
            Self::NewConnectionId(_) => "NEW_CONNECTION_ID",
            Self::RetireConnectionId { .. } => "RETIRE_CONNECTION_ID",
            Self::NewToken { .. } => "NEW_TOKEN",
            Self::PathChallenge(_) => "PATH_CHALLENGE",
            Self::PathResponse(_) => "PATH_RESPONSE",
            Self::HandshakeDone => "HANDSHAKE_DONE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: crate::ConnectionId,
    pub reset_token: [u8; crate::cid::RESET_TOKEN_SIZE],
}

/// Metadata about a STREAM frame written into an outgoing packet
///
/// The payload itself stays in the stream's retransmission buffer; this is
/// what ack processing and loss detection operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMeta {
    pub id: StreamId,
    pub offsets: Range<u64>,
    pub fin: bool,
}
