use std::{fmt, sync::Arc, time::Duration};

use crate::{
    cid::{ConnectionIdGenerator, ConnectionIdRejector, RandomConnectionIdGenerator,
          ResetTokenFactory},
    codec::CodecFactory,
    congestion::{ControllerFactory, FixedWindowFactory},
    crypto::CryptoFactory,
    MAX_UDP_PAYLOAD,
};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications.
/// In some cases, performance or resource requirements can be improved by
/// tuning these values to suit a particular application and/or network
/// connection: data window sizes in particular should be chosen for the
/// expected round trip time and link capacity, since worst-case memory use
/// grows with both.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) advertised_connection_window: u64,
    pub(crate) advertised_bidi_local_stream_window: u64,
    pub(crate) advertised_bidi_remote_stream_window: u64,
    pub(crate) advertised_uni_stream_window: u64,
    pub(crate) advertised_max_streams_bidi: u64,
    pub(crate) advertised_max_streams_uni: u64,
    pub(crate) idle_timeout: Duration,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) max_recv_packet_size: u64,

    pub(crate) rx_packets_before_ack_init_threshold: u64,
    pub(crate) rx_packets_before_ack_before_init: u16,
    pub(crate) rx_packets_before_ack_after_init: u16,

    pub(crate) max_packets_to_buffer: usize,
    pub(crate) limited_cwnd_in_mss: u64,
    pub(crate) disable_migration: bool,
    pub(crate) zero_rtt_source_token_matching_policy: ZeroRttSourceTokenMatchingPolicy,
    pub(crate) stream_limit_windowing_fraction: u64,
    pub(crate) force_path_mtu: bool,
    pub(crate) pacing_enabled: bool,
    pub(crate) datagram: DatagramConfig,
    pub(crate) d6d: D6dConfig,

    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory>,
}

impl TransportConfig {
    /// Connection-level flow control window advertised to the client
    pub fn advertised_connection_window(&mut self, value: u64) -> &mut Self {
        self.advertised_connection_window = value;
        self
    }

    /// Stream flow control window for client-initiated bidirectional streams
    pub fn advertised_bidi_local_stream_window(&mut self, value: u64) -> &mut Self {
        self.advertised_bidi_local_stream_window = value;
        self
    }

    /// Stream flow control window for server-initiated bidirectional streams
    pub fn advertised_bidi_remote_stream_window(&mut self, value: u64) -> &mut Self {
        self.advertised_bidi_remote_stream_window = value;
        self
    }

    /// Stream flow control window for unidirectional streams
    pub fn advertised_uni_stream_window(&mut self, value: u64) -> &mut Self {
        self.advertised_uni_stream_window = value;
        self
    }

    /// Number of bidirectional streams the client may open before the first
    /// MAX_STREAMS update
    pub fn advertised_max_streams_bidi(&mut self, value: u64) -> &mut Self {
        self.advertised_max_streams_bidi = value;
        self
    }

    /// Variant of `advertised_max_streams_bidi` affecting unidirectional streams
    pub fn advertised_max_streams_uni(&mut self, value: u64) -> &mut Self {
        self.advertised_max_streams_uni = value;
        self
    }

    /// Maximum duration of inactivity to accept before timing out the
    /// connection
    ///
    /// The effective timeout is the minimum of this and the peer's advertised
    /// idle timeout.
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Exponent used to scale the ack delay field in ACK frames we send
    pub fn ack_delay_exponent(&mut self, value: u8) -> &mut Self {
        self.ack_delay_exponent = value;
        self
    }

    /// `max_udp_payload_size` advertised to the client
    pub fn max_recv_packet_size(&mut self, value: u64) -> &mut Self {
        self.max_recv_packet_size = value;
        self
    }

    /// Largest received packet number below which the pre-init ack threshold
    /// applies
    pub fn rx_packets_before_ack_init_threshold(&mut self, value: u64) -> &mut Self {
        self.rx_packets_before_ack_init_threshold = value;
        self
    }

    /// Packets received before an ACK is forced, while the connection is young
    pub fn rx_packets_before_ack_before_init(&mut self, value: u16) -> &mut Self {
        self.rx_packets_before_ack_before_init = value;
        self
    }

    /// Packets received before an ACK is forced, at steady state
    pub fn rx_packets_before_ack_after_init(&mut self, value: u16) -> &mut Self {
        self.rx_packets_before_ack_after_init = value;
        self
    }

    /// Undecryptable packets buffered while their keys are pending, per
    /// connection across the 0-RTT and 1-RTT queues
    pub fn max_packets_to_buffer(&mut self, value: usize) -> &mut Self {
        self.max_packets_to_buffer = value;
        self
    }

    /// Congestion window granted per received packet, in packets, while a
    /// writable-bytes limit is active
    pub fn limited_cwnd_in_mss(&mut self, value: u64) -> &mut Self {
        self.limited_cwnd_in_mss = value;
        self
    }

    /// Refuse all peer address changes after the handshake
    pub fn disable_migration(&mut self, value: bool) -> &mut Self {
        self.disable_migration = value;
        self
    }

    /// How a presented source-address token gates zero-RTT admission
    pub fn zero_rtt_source_token_matching_policy(
        &mut self,
        value: ZeroRttSourceTokenMatchingPolicy,
    ) -> &mut Self {
        self.zero_rtt_source_token_matching_policy = value;
        self
    }

    /// Fraction of the initial stream limit that must be returned as closed
    /// streams before a MAX_STREAMS update is issued
    pub fn stream_limit_windowing_fraction(&mut self, value: u64) -> &mut Self {
        debug_assert!(value > 0);
        self.stream_limit_windowing_fraction = value;
        self
    }

    /// Pin the send packet size to the peer's `max_udp_payload_size` instead
    /// of probing the path MTU
    pub fn force_path_mtu(&mut self, value: bool) -> &mut Self {
        self.force_path_mtu = value;
        self
    }

    /// Whether the pacer is consulted at all
    pub fn pacing_enabled(&mut self, value: bool) -> &mut Self {
        self.pacing_enabled = value;
        self
    }

    /// DATAGRAM frame support
    pub fn datagram(&mut self, value: DatagramConfig) -> &mut Self {
        self.datagram = value;
        self
    }

    /// Peer-driven PLPMTUD extension
    pub fn d6d(&mut self, value: D6dConfig) -> &mut Self {
        self.d6d = value;
        self
    }

    /// How congestion controllers are built, at connection setup and after
    /// migration to an unknown path
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            advertised_connection_window: 1024 * 1024,
            advertised_bidi_local_stream_window: 256 * 1024,
            advertised_bidi_remote_stream_window: 256 * 1024,
            advertised_uni_stream_window: 256 * 1024,
            advertised_max_streams_bidi: 2048,
            advertised_max_streams_uni: 2048,
            idle_timeout: Duration::from_secs(60),
            ack_delay_exponent: 3,
            max_recv_packet_size: MAX_UDP_PAYLOAD,

            rx_packets_before_ack_init_threshold: 100,
            rx_packets_before_ack_before_init: 10,
            rx_packets_before_ack_after_init: 10,

            max_packets_to_buffer: 20,
            limited_cwnd_in_mss: 3,
            disable_migration: false,
            zero_rtt_source_token_matching_policy: ZeroRttSourceTokenMatchingPolicy::AlwaysReject,
            stream_limit_windowing_fraction: 2,
            force_path_mtu: false,
            pacing_enabled: false,
            datagram: DatagramConfig::default(),
            d6d: D6dConfig::default(),

            congestion_controller_factory: Arc::new(FixedWindowFactory::new(10 * MAX_UDP_PAYLOAD)),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("advertised_connection_window", &self.advertised_connection_window)
            .field("advertised_max_streams_bidi", &self.advertised_max_streams_bidi)
            .field("advertised_max_streams_uni", &self.advertised_max_streams_uni)
            .field("idle_timeout", &self.idle_timeout)
            .field("disable_migration", &self.disable_migration)
            .field("max_packets_to_buffer", &self.max_packets_to_buffer)
            .finish_non_exhaustive()
    }
}

/// Zero-RTT admission policy applied to the source-address token
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ZeroRttSourceTokenMatchingPolicy {
    /// Never accept early data
    AlwaysReject,
    /// Accept early data only when the client's current IP appears in the
    /// token it presented
    RejectIfNoExactMatch,
    /// Always accept early data, but cap writable bytes until the client
    /// Finished arrives when the IP did not match
    LimitIfNoExactMatch,
}

/// DATAGRAM frame settings
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub enabled: bool,
    /// Largest DATAGRAM frame we advertise willingness to receive
    pub max_read_frame_size: u64,
    /// Received datagrams buffered before the oldest is dropped
    pub recv_buffer_len: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_read_frame_size: 65535,
            recv_buffer_len: 16,
        }
    }
}

/// Peer-driven PLPMTUD settings
#[derive(Debug, Clone, Default)]
pub struct D6dConfig {
    pub enabled: bool,
}

/// Per-server configuration shared by all of its connections
#[derive(Clone)]
pub struct ServerConfig {
    /// Transport configuration to use for incoming connections
    pub transport: Arc<TransportConfig>,
    /// Derives Initial secrets for new connections
    pub crypto: Arc<dyn CryptoFactory>,
    /// Builds the per-connection read codec
    pub codec: Arc<dyn CodecFactory>,
    /// Chooses server connection IDs
    pub cid_generator: Arc<dyn ConnectionIdGenerator>,
    /// Vetoes generated connection IDs, if present
    pub cid_rejector: Option<Arc<dyn ConnectionIdRejector>>,
    /// Derives stateless reset tokens for issued connection IDs
    pub reset_tokens: Arc<dyn ResetTokenFactory>,
}

impl ServerConfig {
    pub fn new(
        crypto: Arc<dyn CryptoFactory>,
        codec: Arc<dyn CodecFactory>,
        reset_tokens: Arc<dyn ResetTokenFactory>,
    ) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            crypto,
            codec,
            cid_generator: Arc::new(RandomConnectionIdGenerator::default()),
            cid_rejector: None,
            reset_tokens,
        }
    }
}
