//! Observability sink interface
//!
//! Mirrors the event vocabulary a qlog writer needs from the connection
//! core. All methods default to no-ops so sinks implement only what they
//! record; the connection holds exactly one boxed sink.

use std::time::Duration;

use crate::codec::{ProtectionType, SpaceId};

/// Why a received packet was discarded without being processed
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PacketDropReason {
    ParseError,
    InvalidPacket,
    InitialConnIdSmall,
    PeerAddressChange,
    ProtocolViolation,
    TransportParameterError,
    ServerStateClosed,
    MaxBuffered,
    BufferUnavailable,
    NoData,
    UnexpectedProtectionLevel,
    CipherUnavailable,
    Retry,
    Reset,
}

/// Per-connection event sink
pub trait QlogSink: Send {
    fn on_packet_received(&mut self, _space: SpaceId, _packet_number: u64, _size: usize) {}

    fn on_packet_drop(&mut self, _size: usize, _reason: PacketDropReason) {}

    fn on_packet_buffered(&mut self, _protection: ProtectionType, _size: usize) {}

    /// Free-form state transition marker, e.g. key installation
    fn on_transport_state_update(&mut self, _update: &str) {}

    fn on_metric_update(
        &mut self,
        _latest_rtt: Duration,
        _min_rtt: Duration,
        _smoothed_rtt: Duration,
        _ack_delay: Duration,
    ) {
    }

    fn on_connection_migration(&mut self, _intentional: bool) {}

    fn on_cids_chosen(&mut self, _local: &crate::ConnectionId, _remote: &crate::ConnectionId) {}
}

/// Discards everything
pub(crate) struct NullQlogSink;

impl QlogSink for NullQlogSink {}

// Transport state update markers
pub(crate) const DERIVED_ZERO_RTT_READ_CIPHER: &str = "derived 0-rtt read cipher";
pub(crate) const DERIVED_ONE_RTT_WRITE_CIPHER: &str = "derived 1-rtt write cipher";
pub(crate) const DERIVED_ONE_RTT_READ_CIPHER: &str = "derived 1-rtt read cipher";
pub(crate) const PEER_CLOSE: &str = "peer close";
