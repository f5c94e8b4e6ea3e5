//! Connection statistics

/// Counters for observing connection behavior
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// Packets fully processed through the frame pipeline
    pub packets_processed: u64,
    /// Packets discarded before processing, for any reason
    pub packets_dropped: u64,
    /// Undecryptable packets parked in the pending queues
    pub packets_buffered: u64,
    /// Packets that arrived below the largest received number in their space
    pub out_of_order_packets: u64,
    /// Stream state records created
    pub streams_opened: u64,
    /// Streams fully closed and removed
    pub streams_closed: u64,
    /// Peer address changes committed
    pub migrations: u64,
    /// Statistics on received frames
    pub frame_rx: FrameStats,
}

/// Number of frames received of each frame type
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct FrameStats {
    pub acks: u64,
    pub crypto: u64,
    pub connection_close: u64,
    pub datagram: u64,
    pub max_data: u64,
    pub max_stream_data: u64,
    pub padding: u64,
    pub ping: u64,
    pub reset_stream: u64,
    pub stream: u64,
    pub data_blocked: u64,
    pub stream_data_blocked: u64,
    pub streams_blocked: u64,
    pub simple: u64,
}
