//! Server connection state machine
//!
//! One `Connection` per accepted client, owned by a single worker thread.
//! The worker delivers received UDP payloads, timeout notifications, and
//! write opportunities; everything here runs synchronously to completion.
//! Protocol errors unwind as `Err(TransportError)` to the boundary of
//! [`Connection::on_read_data`], where they become a close schedule and the
//! one-way transition to `Closed`.

use std::{
    cmp,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::{
    cid::IssuedCid,
    codec::{
        parse_header_invariant, CodecResult, EncryptionLevel, Packet, PacketHeader,
        ProtectionType, ReadCodec, SpaceId, UndecryptablePacket,
    },
    config::{ServerConfig, TransportConfig, ZeroRttSourceTokenMatchingPolicy},
    congestion::{update_pacing_on_key_established, Controller, Pacer},
    crypto::{HeaderKey, Keys, PacketKey},
    frame::{self, Frame, SimpleFrame},
    handshake::Handshake,
    qlog::{self, NullQlogSink, PacketDropReason, QlogSink},
    transport_parameters::{
        ClientTransportParameters, ServerTransportParameters, TransportParameterId,
    },
    ConnectionId, Side, TransportError, TransportErrorCode, VarInt, Version,
    CID_ENCODING_RETRY_LIMIT, CONGESTION_STATE_RETENTION, DEFAULT_ACK_DELAY_EXPONENT,
    DEFAULT_ACTIVE_CONNECTION_ID_LIMIT, DEFAULT_UDP_SEND_PACKET_LEN, MAX_ACK_DELAY_EXPONENT,
    MAX_ACK_DELAY_MS, MAX_COALESCED_PACKETS, MAX_DATAGRAM_PACKET_OVERHEAD, MAX_IDLE_TIMEOUT,
    MAX_MIGRATIONS, MAX_PACKET_NUMBER, MAX_TOKEN_SOURCE_ADDRESSES, MAX_UDP_PAYLOAD,
    MIN_INITIAL_DST_CID_LEN, MIN_MAX_UDP_PAYLOAD,
};

pub(crate) mod assembler;
pub mod datagrams;
mod mtud;
pub mod paths;
pub mod spaces;
pub mod stats;
pub mod streams;

use datagrams::Datagrams;
use mtud::PeerPmtud;
use paths::{
    maybe_nat_rebinding, CongestionAndRttState, MigrationState, PendingPathRateLimiter,
    RttEstimator,
};
use spaces::{PacketSpaces, SentFrame, SentPacket};
use stats::ConnectionStats;
use streams::{PeerStreamWindows, StreamManager};

/// A received UDP payload, as delivered by the socket layer
pub struct ReadData {
    pub peer: SocketAddr,
    pub data: BytesMut,
    pub receive_time: Instant,
}

/// Work the driver picks up between events
///
/// Setters are idempotent; the driver reads and clears these in one pass
/// per event-loop iteration. Clearing a flag unschedules the matching
/// timer.
#[derive(Debug, Default)]
pub struct PendingEvents {
    pub schedule_ack_timeout: bool,
    pub cancel_ping_timeout: bool,
    /// PATH_CHALLENGE datum to transmit on the current (new) path
    pub path_challenge: Option<u64>,
    /// PATH_RESPONSE datum owed to the peer
    pub path_response: Option<u64>,
    pub schedule_path_validation_timeout: bool,
    /// The packet-number space is nearly exhausted; close cleanly
    pub close_transport: bool,
    /// A CONNECTION_CLOSE should be written
    pub connection_close: bool,
}

/// Connection lifecycle; the transition is one-way
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Open,
    Closed,
}

/// Error code carried in a peer CONNECTION_CLOSE
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CloseCode {
    Transport(TransportErrorCode),
    Application(VarInt),
}

/// Connection-level flow control accounting
#[derive(Debug, Default, Copy, Clone)]
pub struct ConnectionFlowControl {
    /// Largest connection offset the peer permits us to send
    pub peer_advertised_max_offset: u64,
    /// Largest connection offset we have advertised
    pub advertised_max_offset: u64,
    /// Sum of stream end offsets received, gaps included
    pub bytes_received: u64,
}

pub struct Connection {
    pub(crate) state: State,
    pub(crate) version: Option<Version>,
    pub(crate) original_peer_address: SocketAddr,
    pub(crate) peer_address: SocketAddr,
    server_addr: SocketAddr,

    pub(crate) client_cid: Option<ConnectionId>,
    pub(crate) server_cid: Option<ConnectionId>,
    pub(crate) self_cids: Vec<IssuedCid>,
    next_self_cid_sequence: u64,
    peer_cids: Vec<frame::NewConnectionId>,

    pub(crate) codec: Option<Box<dyn ReadCodec>>,
    pub(crate) initial_write_keys: Option<Keys>,
    pub(crate) one_rtt_write_key: Option<Box<dyn PacketKey>>,
    pub(crate) one_rtt_write_header_key: Option<Box<dyn HeaderKey>>,
    handshake: Box<dyn Handshake>,
    handshake_done_sent: bool,
    pub(crate) handshake_confirmed: bool,
    /// Whether our transport parameters have been handed to the handshake
    transport_parameters_encoded: bool,
    pub(crate) used_zero_rtt: bool,

    pub(crate) spaces: PacketSpaces,
    pub(crate) rtt: RttEstimator,
    pub(crate) congestion: Option<Box<dyn Controller>>,
    pacer: Option<Box<dyn Pacer>>,

    pub(crate) streams: StreamManager,
    pub(crate) flow_control: ConnectionFlowControl,
    pub(crate) datagrams: Datagrams,
    pmtud: PeerPmtud,

    pub(crate) migration: MigrationState,
    /// Challenge datum in flight for the current path validation
    pub(crate) outstanding_path_validation: Option<u64>,
    path_validation_limiter: Option<PendingPathRateLimiter>,

    pub(crate) pending: PendingEvents,
    /// Anti-amplification / zero-RTT byte cap, when active
    pub(crate) writable_bytes_limit: Option<u64>,
    pending_zero_rtt: Option<Vec<ReadData>>,
    pending_one_rtt: Option<Vec<ReadData>>,

    pub(crate) peer_error: Option<(CloseCode, String)>,
    pub(crate) close_cause: Option<TransportError>,

    pub(crate) settings: TransportConfig,
    config: Arc<ServerConfig>,

    pub(crate) udp_send_packet_len: u64,
    peer_max_udp_payload_size: u64,
    pub(crate) peer_idle_timeout: Duration,
    pub(crate) peer_ack_delay_exponent: u8,
    pub(crate) peer_min_ack_delay: Option<Duration>,
    peer_active_connection_id_limit: u64,

    pub(crate) token_source_addresses: Vec<IpAddr>,
    pub(crate) source_token_matching: Option<bool>,

    qlog: Box<dyn QlogSink>,
    pub(crate) stats: ConnectionStats,
}

impl Connection {
    pub fn new(
        config: Arc<ServerConfig>,
        server_addr: SocketAddr,
        original_peer_address: SocketAddr,
        handshake: Box<dyn Handshake>,
        qlog: Option<Box<dyn QlogSink>>,
        now: Instant,
    ) -> Self {
        let settings = TransportConfig::clone(&config.transport);
        let congestion = settings.congestion_controller_factory.build(now);
        let streams = StreamManager::new(Side::Server, &settings);
        let datagrams = Datagrams::new(&settings.datagram);
        let advertised_connection_window = settings.advertised_connection_window;
        Self {
            state: State::Open,
            version: None,
            original_peer_address,
            peer_address: original_peer_address,
            server_addr,
            client_cid: None,
            server_cid: None,
            self_cids: Vec::new(),
            next_self_cid_sequence: 0,
            peer_cids: Vec::new(),
            codec: None,
            initial_write_keys: None,
            one_rtt_write_key: None,
            one_rtt_write_header_key: None,
            handshake,
            handshake_done_sent: false,
            handshake_confirmed: false,
            transport_parameters_encoded: false,
            used_zero_rtt: false,
            spaces: PacketSpaces::new(),
            rtt: RttEstimator::default(),
            congestion: Some(congestion),
            pacer: None,
            streams,
            flow_control: ConnectionFlowControl {
                peer_advertised_max_offset: 0,
                advertised_max_offset: advertised_connection_window,
                bytes_received: 0,
            },
            datagrams,
            pmtud: PeerPmtud::default(),
            migration: MigrationState::default(),
            outstanding_path_validation: None,
            path_validation_limiter: None,
            pending: PendingEvents::default(),
            writable_bytes_limit: None,
            pending_zero_rtt: Some(Vec::new()),
            pending_one_rtt: Some(Vec::new()),
            peer_error: None,
            close_cause: None,
            settings,
            config,
            udp_send_packet_len: DEFAULT_UDP_SEND_PACKET_LEN,
            peer_max_udp_payload_size: MAX_UDP_PAYLOAD,
            peer_idle_timeout: Duration::ZERO,
            peer_ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT as u8,
            peer_min_ack_delay: None,
            peer_active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
            token_source_addresses: Vec::new(),
            source_token_matching: None,
            qlog: qlog.unwrap_or_else(|| Box::new(NullQlogSink)),
            stats: ConnectionStats::default(),
        }
    }

    /// Process one received UDP payload
    ///
    /// On a protocol error the connection has already transitioned to
    /// `Closed` and scheduled a CONNECTION_CLOSE by the time the error is
    /// returned; the error is for the caller's observability. A peer close
    /// surfaces as NO_ERROR here, with the peer's own code available via
    /// [`Connection::peer_error`].
    pub fn on_read_data(&mut self, mut read_data: ReadData) -> Result<(), TransportError> {
        match self.state {
            State::Open => {
                if let Err(error) = self.on_read_open(&mut read_data) {
                    self.handle_transport_error(error.clone());
                    return Err(error);
                }
                Ok(())
            }
            State::Closed => self.on_read_closed(&mut read_data),
        }
    }

    /// Close initiated locally
    pub fn close(&mut self) {
        if self.state == State::Open {
            self.state = State::Closed;
            self.pending.connection_close = true;
        }
    }

    /// The write path transmitted a CONNECTION_CLOSE; remember what the
    /// peer had sent by then so further incoming packets can be answered
    /// with at most one more close
    pub fn on_close_sent(&mut self) {
        self.pending.connection_close = false;
        self.spaces.update_largest_received_at_last_close_sent();
    }

    /// Whether an incoming packet since our last close warrants another one
    pub fn should_resend_close(&self) -> bool {
        !self.spaces.has_not_received_new_packets_since_last_close_sent()
    }

    fn handle_transport_error(&mut self, error: TransportError) {
        if self.state == State::Open {
            debug!(code = ?error.code, reason = %error.reason, "closing connection");
            self.close_cause = Some(error);
            self.pending.connection_close = true;
            self.state = State::Closed;
        }
    }

    //
    // Open-state receive path
    //

    fn on_read_open(&mut self, read_data: &mut ReadData) -> Result<(), TransportError> {
        debug_assert_eq!(self.state, State::Open);
        if read_data.data.is_empty() {
            return Ok(());
        }
        if self.codec.is_none() && !self.bootstrap_from_first_packet(read_data)? {
            return Ok(());
        }
        let mut processed_packets = 0;
        while !read_data.data.is_empty() && processed_packets < MAX_COALESCED_PACKETS {
            processed_packets += 1;
            let size_before = read_data.data.len();
            let largest_pns = self.spaces.largest_received();
            let result = self
                .codec
                .as_mut()
                .unwrap()
                .parse_packet(&mut read_data.data, &largest_pns);
            let packet_size = size_before - read_data.data.len();

            let packet = match result {
                CodecResult::Packet(packet) => packet,
                CodecResult::CipherUnavailable(undecryptable) => {
                    self.handle_cipher_unavailable(undecryptable, packet_size, read_data);
                    continue;
                }
                CodecResult::Retry => {
                    trace!("dropping retry, the server is not supposed to receive one");
                    self.drop_packet(packet_size, PacketDropReason::Retry);
                    continue;
                }
                CodecResult::StatelessReset => {
                    trace!("dropping stateless reset");
                    self.drop_packet(packet_size, PacketDropReason::Reset);
                    continue;
                }
                CodecResult::Nothing => {
                    self.drop_packet(packet_size, PacketDropReason::CipherUnavailable);
                    continue;
                }
            };
            self.process_packet(packet, packet_size, read_data.peer, read_data.receive_time)?;
            self.stats.packets_processed += 1;
        }
        if !read_data.data.is_empty() {
            debug!(
                remaining = read_data.data.len(),
                limit = MAX_COALESCED_PACKETS,
                "leaving bytes unprocessed after coalesced packet limit"
            );
        }
        Ok(())
    }

    /// First packet from the peer: parse the invariant header, choose a
    /// server connection ID, derive Initial keys, and stand up the codec
    ///
    /// Returns false when the datagram should simply be dropped.
    fn bootstrap_from_first_packet(
        &mut self,
        read_data: &ReadData,
    ) -> Result<bool, TransportError> {
        debug_assert!(!self.transport_parameters_encoded);
        let header = match parse_header_invariant(&read_data.data) {
            Some(header) => header,
            None => {
                debug!("could not parse initial packet header");
                self.drop_packet(read_data.data.len(), PacketDropReason::ParseError);
                return Ok(false);
            }
        };
        if header.wire_version == Version::NEGOTIATION {
            debug!("server dropping version negotiation packet");
            self.drop_packet(read_data.data.len(), PacketDropReason::InvalidPacket);
            return Ok(false);
        }
        let version = match Version::from_wire(header.wire_version) {
            Some(version) => version,
            None => {
                debug!(version = header.wire_version, "unsupported version");
                self.drop_packet(read_data.data.len(), PacketDropReason::InvalidPacket);
                return Ok(false);
            }
        };
        let client_cid = header.src_cid;
        let initial_dst_cid = header.dst_cid;
        if initial_dst_cid.len() < MIN_INITIAL_DST_CID_LEN {
            debug!("initial connection id too small");
            self.drop_packet(read_data.data.len(), PacketDropReason::InitialConnIdSmall);
            return Ok(false);
        }

        let issued = self.create_and_add_new_self_cid();
        self.server_cid = Some(issued.cid);
        self.client_cid = Some(client_cid);

        let params = ServerTransportParameters {
            initial_max_data: self.settings.advertised_connection_window,
            initial_max_stream_data_bidi_local: self.settings.advertised_bidi_local_stream_window,
            initial_max_stream_data_bidi_remote: self
                .settings
                .advertised_bidi_remote_stream_window,
            initial_max_stream_data_uni: self.settings.advertised_uni_stream_window,
            initial_max_streams_bidi: self.settings.advertised_max_streams_bidi,
            initial_max_streams_uni: self.settings.advertised_max_streams_uni,
            max_idle_timeout: self.settings.idle_timeout,
            ack_delay_exponent: self.settings.ack_delay_exponent,
            max_udp_payload_size: self.settings.max_recv_packet_size,
            stateless_reset_token: issued.reset_token,
            initial_source_connection_id: issued.cid,
            original_destination_connection_id: initial_dst_cid,
            extra: self.extension_transport_parameters(),
        };
        self.handshake.accept(params);
        self.transport_parameters_encoded = true;

        let initial_read_keys = self.config.crypto.client_initial_keys(&initial_dst_cid, version);
        self.initial_write_keys = Some(
            self.config
                .crypto
                .server_initial_keys(&initial_dst_cid, version),
        );
        let mut codec =
            self.config
                .codec
                .new_codec(version, client_cid, issued.cid, initial_read_keys);
        codec.set_ack_delay_exponent(self.peer_ack_delay_exponent);
        self.codec = Some(codec);
        self.qlog.on_cids_chosen(&issued.cid, &initial_dst_cid);
        self.peer_address = self.original_peer_address;
        Ok(true)
    }

    /// Extension parameters advertised alongside the standard set
    fn extension_transport_parameters(&self) -> Vec<crate::transport_parameters::TransportParameter> {
        let mut extra = Vec::new();
        if self.settings.datagram.enabled {
            extra.push(crate::transport_parameters::TransportParameter::integer(
                TransportParameterId::MaxDatagramFrameSize,
                self.datagrams.max_read_frame_size,
            ));
        }
        extra
    }

    /// Choose and record a fresh self connection ID
    ///
    /// The rejector gets a bounded number of vetoes; after that the last
    /// candidate is used regardless, since an unroutable ID still beats no
    /// connection at all.
    pub fn create_and_add_new_self_cid(&mut self) -> IssuedCid {
        let mut cid = self.config.cid_generator.generate_cid();
        if let Some(rejector) = &self.config.cid_rejector {
            let mut attempts = 1;
            while rejector.reject_cid(&cid) && attempts < CID_ENCODING_RETRY_LIMIT {
                cid = self.config.cid_generator.generate_cid();
                attempts += 1;
            }
            if attempts == CID_ENCODING_RETRY_LIMIT {
                warn!("connection id rejector rejected every candidate");
            }
        }
        let issued = IssuedCid {
            cid,
            sequence: self.next_self_cid_sequence,
            reset_token: self.config.reset_tokens.generate_token(&cid),
        };
        self.next_self_cid_sequence += 1;
        self.self_cids.push(issued.clone());
        issued
    }

    fn handle_cipher_unavailable(
        &mut self,
        packet: UndecryptablePacket,
        packet_size: usize,
        read_data: &ReadData,
    ) {
        if packet.data.is_empty() {
            trace!("drop, cipher unavailable with no data");
            self.drop_packet(packet_size, PacketDropReason::NoData);
            return;
        }
        if !matches!(
            packet.protection,
            ProtectionType::ZeroRtt | ProtectionType::KeyPhaseZero
        ) {
            trace!("drop, unexpected protection level");
            self.drop_packet(packet_size, PacketDropReason::UnexpectedProtectionLevel);
            return;
        }
        let buffered = self.pending_zero_rtt.as_ref().map_or(0, Vec::len)
            + self.pending_one_rtt.as_ref().map_or(0, Vec::len);
        if buffered >= self.settings.max_packets_to_buffer {
            trace!("drop, pending packet buffers full");
            self.drop_packet(packet_size, PacketDropReason::MaxBuffered);
            return;
        }
        let queue = match packet.protection {
            ProtectionType::ZeroRtt => &mut self.pending_zero_rtt,
            _ => &mut self.pending_one_rtt,
        };
        match queue {
            Some(queue) => {
                queue.push(ReadData {
                    peer: read_data.peer,
                    data: BytesMut::from(&packet.data[..]),
                    receive_time: read_data.receive_time,
                });
                trace!(
                    buffered = queue.len(),
                    protection = ?packet.protection,
                    "buffered undecryptable packet"
                );
                self.qlog.on_packet_buffered(packet.protection, packet_size);
                self.stats.packets_buffered += 1;
            }
            None => {
                trace!("drop, pending buffer no longer available");
                self.drop_packet(packet_size, PacketDropReason::BufferUnavailable);
            }
        }
    }

    fn process_packet(
        &mut self,
        packet: Packet,
        packet_size: usize,
        peer: SocketAddr,
        receive_time: Instant,
    ) -> Result<(), TransportError> {
        if packet.frames.is_empty() {
            // A parseable header with no frames is not a decode problem, it
            // is the peer violating the protocol
            self.drop_packet(packet_size, PacketDropReason::ProtocolViolation);
            return Err(TransportError::PROTOCOL_VIOLATION("packet has no frames"));
        }
        let protection = packet.header.protection();
        let encryption_level = protection.encryption_level();
        let space_id = packet.header.space();
        let packet_num = packet.header.number();

        if !protection.is_protected() {
            for frame in &packet.frames {
                if !frame.permitted_unprotected() {
                    self.drop_packet(packet_size, PacketDropReason::ProtocolViolation);
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "invalid frame at unprotected level",
                    ));
                }
            }
        }
        debug_assert!(self.client_cid.is_some());
        self.qlog.on_packet_received(space_id, packet_num, packet_size);

        if self.version.is_none() {
            // The worker validated support before dispatching to us
            let version = match packet.header.long_version() {
                Some(version) => version,
                None => {
                    return Err(TransportError::PROTOCOL_VIOLATION("invalid packet type"));
                }
            };
            self.version = Some(version);
            if version == Version::Experimental {
                self.apply_experimental_settings();
            }
        }

        if self.peer_address != peer {
            if encryption_level != EncryptionLevel::AppData {
                self.drop_packet(packet_size, PacketDropReason::PeerAddressChange);
                return Err(TransportError::INVALID_MIGRATION(
                    "migration not allowed during handshake",
                ));
            }
            if self.settings.disable_migration {
                self.drop_packet(packet_size, PacketDropReason::PeerAddressChange);
                return Err(TransportError::INVALID_MIGRATION("migration disabled"));
            }
        }

        let out_of_order = self.spaces[space_id]
            .ack_state
            .on_packet_number_received(packet_num, receive_time);
        if out_of_order {
            self.stats.out_of_order_packets += 1;
        }
        debug_assert!(self.spaces.has_received_packets());

        let mut has_retransmittable_data = false;
        let mut has_crypto_data = false;
        let mut is_non_probing = false;
        let mut handshake_confirmed_this_loop = false;

        for quic_frame in packet.frames {
            is_non_probing |= !quic_frame.is_probing();
            has_retransmittable_data |= quic_frame.is_ack_eliciting();
            match quic_frame {
                Frame::Ack(ack) => {
                    trace!(packet_num, largest = ack.largest, "received ack");
                    self.stats.frame_rx.acks += 1;
                    handshake_confirmed_this_loop |=
                        self.process_ack_frame(space_id, &ack, receive_time)?;
                }
                Frame::ResetStream(reset) => {
                    trace!(stream = %reset.id, "received reset");
                    self.stats.frame_rx.reset_stream += 1;
                    let new_bytes = match self.streams.get_stream(reset.id)? {
                        Some(stream) => Some(stream.receive_reset(reset)?),
                        None => None,
                    };
                    if let Some(new_bytes) = new_bytes {
                        self.connection_flow_control_on_new_bytes(new_bytes)?;
                        self.streams.update_readable_streams(reset.id, receive_time);
                        self.streams.update_peekable_streams(reset.id);
                    }
                }
                Frame::Crypto(crypto) => {
                    trace!(
                        offset = crypto.offset,
                        len = crypto.data.len(),
                        "received crypto data"
                    );
                    has_crypto_data = true;
                    self.stats.frame_rx.crypto += 1;
                    self.spaces[space_id]
                        .crypto_stream
                        .received(crypto.offset, crypto.data);
                }
                Frame::Stream(stream_frame) => {
                    trace!(
                        stream = %stream_frame.id,
                        offset = stream_frame.offset,
                        len = stream_frame.data.len(),
                        fin = stream_frame.fin,
                        "received stream data"
                    );
                    self.stats.frame_rx.stream += 1;
                    let id = stream_frame.id;
                    // Data for streams we no longer track is silently gone
                    let new_bytes = match self.streams.get_stream(id)? {
                        Some(stream) => Some(stream.receive(stream_frame)?),
                        None => None,
                    };
                    if let Some(new_bytes) = new_bytes {
                        self.connection_flow_control_on_new_bytes(new_bytes)?;
                        self.streams.update_readable_streams(id, receive_time);
                        self.streams.update_peekable_streams(id);
                    }
                }
                Frame::MaxData(maximum) => {
                    trace!(maximum = maximum.into_inner(), "received max data");
                    self.stats.frame_rx.max_data += 1;
                    let maximum = maximum.into_inner();
                    if maximum > self.flow_control.peer_advertised_max_offset {
                        self.flow_control.peer_advertised_max_offset = maximum;
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    trace!(stream = %id, offset, "received max stream data");
                    self.stats.frame_rx.max_stream_data += 1;
                    if !id.is_send_side(Side::Server) {
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "MAX_STREAM_DATA on receive-only stream",
                        ));
                    }
                    let increased = match self.streams.get_stream(id)? {
                        Some(stream) => stream.on_max_stream_data(offset),
                        None => false,
                    };
                    if increased {
                        self.streams.queue_flow_control_updated(id);
                        self.streams.update_writable_streams(id);
                    }
                }
                Frame::DataBlocked { offset } => {
                    trace!(offset, "received data blocked");
                    self.stats.frame_rx.data_blocked += 1;
                }
                Frame::StreamDataBlocked { id, offset } => {
                    trace!(stream = %id, offset, "received stream data blocked");
                    self.stats.frame_rx.stream_data_blocked += 1;
                }
                Frame::StreamsBlocked { dir, limit } => {
                    // The peer wants more streams than we have granted
                    trace!(%dir, limit, "received streams blocked");
                    self.stats.frame_rx.streams_blocked += 1;
                }
                Frame::Close(close) => {
                    self.stats.frame_rx.connection_close += 1;
                    self.store_peer_close(&close);
                    // Acknowledge closure without echoing the peer's error
                    return Err(TransportError::NO_ERROR("peer closed"));
                }
                Frame::Ping => {
                    self.stats.frame_rx.ping += 1;
                }
                Frame::Padding => {
                    self.stats.frame_rx.padding += 1;
                }
                Frame::Datagram(datagram) => {
                    trace!(len = datagram.data.len(), "received datagram");
                    self.stats.frame_rx.datagram += 1;
                    self.datagrams.received(datagram.data);
                }
                Frame::Simple(simple) => {
                    self.stats.frame_rx.simple += 1;
                    self.process_simple_frame(simple)?;
                }
            }
        }

        if handshake_confirmed_this_loop {
            // Deferred past the frame loop to avoid re-entering codec state
            self.on_handshake_confirmed();
        }

        // Extend the writable limit before processing handshake data, so an
        // undecided zero-RTT admission does not grow the budget
        self.update_writable_byte_limit_on_recv_packet();

        if self.peer_address != peer {
            if is_non_probing {
                if Some(packet_num) == self.spaces[space_id].ack_state.largest_received {
                    let intentional_migration = match &packet.header {
                        PacketHeader::Short { dst_cid, .. } => {
                            self.server_cid.as_ref() != Some(dst_cid)
                        }
                        PacketHeader::Long { .. } => false,
                    };
                    self.on_connection_migration(peer, intentional_migration, receive_time)?;
                }
            } else {
                // A probing packet from an unknown path gets a PATH_RESPONSE
                // without moving the connection; that is not supported yet
                self.drop_packet(packet_size, PacketDropReason::PeerAddressChange);
                return Err(TransportError::INVALID_MIGRATION(
                    "probing on a new path not supported",
                ));
            }
        }

        // Deliver any newly contiguous crypto bytes and advance the handshake
        let mut delivered_crypto = false;
        while let Some(data) = self.spaces[space_id].crypto_stream.read_to_deliver() {
            delivered_crypto = true;
            self.handshake.read_handshake(data, encryption_level)?;
        }
        if delivered_crypto {
            if let Err(error) = self.update_handshake_state(receive_time) {
                self.drop_packet(packet_size, PacketDropReason::TransportParameterError);
                return Err(error);
            }
        }

        self.spaces[space_id].ack_state.on_packet_processed(
            &self.settings,
            &mut self.pending,
            out_of_order,
            has_retransmittable_data,
            has_crypto_data,
        );

        // First packet at the Handshake level retires the Initial epoch
        if encryption_level == EncryptionLevel::Handshake && self.initial_write_keys.is_some() {
            trace!("discarding initial keys");
            self.initial_write_keys = None;
            self.codec.as_mut().unwrap().discard_initial_keys();
            let space = &mut self.spaces[SpaceId::Initial];
            space.crypto_stream.implicitly_ack(&mut space.pending);
        }

        if let Some(idle) = self.streams.take_app_idle_change() {
            if let Some(congestion) = &mut self.congestion {
                congestion.set_app_idle(idle, receive_time);
            }
        }
        Ok(())
    }

    fn store_peer_close(&mut self, close: &frame::Close) {
        let reason = String::from_utf8_lossy(close.reason());
        let message = format!("server closed by peer reason={reason}");
        debug!("{message}");
        self.qlog.on_transport_state_update(qlog::PEER_CLOSE);
        let code = match close {
            frame::Close::Connection(transport) => CloseCode::Transport(transport.error_code),
            frame::Close::Application(application) => {
                CloseCode::Application(application.error_code)
            }
        };
        self.peer_error = Some((code, message));
    }

    fn process_simple_frame(&mut self, simple: SimpleFrame) -> Result<(), TransportError> {
        match simple {
            SimpleFrame::StopSending { id, error_code } => {
                trace!(stream = %id, "received stop sending");
                if !id.is_send_side(Side::Server) {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "STOP_SENDING on receive-only stream",
                    ));
                }
                if self.streams.get_stream(id)?.is_some() {
                    self.streams.queue_stop_sending(id, error_code);
                }
            }
            SimpleFrame::MaxStreams { dir, count } => {
                trace!(%dir, count, "received max streams");
                self.streams.on_max_streams(dir, count)?;
            }
            SimpleFrame::NewConnectionId(new_cid) => {
                trace!(sequence = new_cid.sequence, "received new connection id");
                if !self
                    .peer_cids
                    .iter()
                    .any(|existing| existing.sequence == new_cid.sequence)
                {
                    self.peer_cids.push(new_cid);
                }
            }
            SimpleFrame::RetireConnectionId { sequence } => {
                trace!(sequence, "received retire connection id");
                self.self_cids.retain(|issued| issued.sequence != sequence);
            }
            SimpleFrame::NewToken { .. } => {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "client sent NEW_TOKEN",
                ));
            }
            SimpleFrame::PathChallenge(data) => {
                self.pending.path_response = Some(data);
            }
            SimpleFrame::PathResponse(data) => {
                if self.outstanding_path_validation == Some(data) {
                    trace!("path validated");
                    self.outstanding_path_validation = None;
                    self.pending.schedule_path_validation_timeout = false;
                    self.path_validation_limiter = None;
                }
            }
            SimpleFrame::HandshakeDone => {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "client sent HANDSHAKE_DONE",
                ));
            }
        }
        Ok(())
    }

    /// Process an ACK frame against this space's outstanding packets
    ///
    /// Returns whether an acknowledged packet carried HANDSHAKE_DONE, which
    /// the caller acts on after the frame loop.
    fn process_ack_frame(
        &mut self,
        space_id: SpaceId,
        ack: &frame::Ack,
        receive_time: Instant,
    ) -> Result<bool, TransportError> {
        if ack.largest >= self.spaces[space_id].ack_state.next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "ack of a packet that was never sent",
            ));
        }
        let mut newly_acked: Vec<(u64, SentPacket)> = Vec::new();
        {
            let space = &mut self.spaces[space_id];
            for range in ack.iter() {
                let numbers: Vec<u64> = space
                    .sent_packets
                    .range(range.clone())
                    .map(|(&pn, _)| pn)
                    .collect();
                for pn in numbers {
                    newly_acked.push((pn, space.sent_packets.remove(&pn).unwrap()));
                }
            }
        }
        if newly_acked.is_empty() {
            return Ok(false);
        }

        // Only an ack that advances the largest acknowledged packet yields
        // an RTT sample
        if let Some((pn, packet)) = newly_acked.last() {
            if *pn == ack.largest {
                let rtt_sample = receive_time.saturating_duration_since(packet.time_sent);
                self.rtt.update(rtt_sample, ack.delay);
                self.qlog.on_metric_update(
                    self.rtt.latest(),
                    self.rtt.min(),
                    self.rtt.smoothed(),
                    ack.delay,
                );
            }
        }

        let mut handshake_done_acked = false;
        let mut acked_bytes = 0u64;
        for (_, packet) in &newly_acked {
            if packet.ack_eliciting {
                acked_bytes += u64::from(packet.size);
            }
            for sent_frame in &packet.frames {
                match sent_frame {
                    SentFrame::Stream(meta) => {
                        trace!(stream = %meta.id, offsets = ?meta.offsets, fin = meta.fin, "ack of stream data");
                        let acked = match self.streams.find_stream_mut(meta.id) {
                            Some(stream) => {
                                stream.on_frame_acked(meta);
                                Some(stream.in_terminal_states())
                            }
                            None => None,
                        };
                        if let Some(finished) = acked {
                            self.streams.add_deliverable(meta.id);
                            if finished {
                                self.streams.remove_closed_stream(meta.id)?;
                            } else {
                                self.streams.update_writable_streams(meta.id);
                            }
                        }
                    }
                    SentFrame::Crypto { offsets } => {
                        self.spaces[space_id].crypto_stream.on_ack(offsets.clone());
                    }
                    SentFrame::ResetStream(id) => {
                        trace!(stream = %id, "ack of reset");
                        let finished = match self.streams.find_stream_mut(*id) {
                            Some(stream) => {
                                stream.on_reset_acked();
                                stream.in_terminal_states()
                            }
                            None => false,
                        };
                        if finished {
                            self.streams.remove_closed_stream(*id)?;
                        }
                    }
                    SentFrame::Ack { ranges } => {
                        // The peer saw these acknowledgements; stop resending them
                        let ack_state = &mut self.spaces[space_id].ack_state;
                        for range in ranges.iter() {
                            ack_state.acks.remove(range);
                        }
                    }
                    SentFrame::Ping { mtu_probe } => {
                        if !mtu_probe {
                            self.pending.cancel_ping_timeout = true;
                        }
                    }
                    SentFrame::HandshakeDone => {
                        handshake_done_acked = true;
                    }
                    SentFrame::Datagram => {}
                }
            }
        }
        if acked_bytes > 0 {
            if let Some(congestion) = &mut self.congestion {
                congestion.on_ack(receive_time, acked_bytes);
            }
        }

        let lost = self.spaces[space_id].detect_lost_packets(ack.largest);
        let mut lost_bytes = 0u64;
        for (pn, packet) in lost {
            trace!(pn, "packet declared lost");
            if packet.ack_eliciting {
                lost_bytes += u64::from(packet.size);
            }
            for sent_frame in packet.frames {
                match sent_frame {
                    SentFrame::Stream(meta) => {
                        if let Some(stream) = self.streams.find_stream_mut(meta.id) {
                            stream.on_frame_lost(&meta);
                            self.streams.add_loss(meta.id);
                            self.streams.update_writable_streams(meta.id);
                        }
                    }
                    SentFrame::Crypto { offsets } => {
                        self.spaces[space_id].pending.crypto.push_back(offsets);
                    }
                    SentFrame::HandshakeDone => {
                        self.spaces[space_id].pending.handshake_done = true;
                    }
                    SentFrame::Ping { mtu_probe } => {
                        if !mtu_probe {
                            self.spaces[space_id].pending.ping = true;
                        }
                    }
                    // RESET_STREAM retransmission is driven by the stream's
                    // send state, acks retire naturally
                    SentFrame::ResetStream(_) | SentFrame::Ack { .. } | SentFrame::Datagram => {}
                }
            }
        }
        if lost_bytes > 0 {
            if let Some(congestion) = &mut self.congestion {
                congestion.on_loss(receive_time, lost_bytes, false);
            }
        }
        Ok(handshake_done_acked)
    }

    fn connection_flow_control_on_new_bytes(
        &mut self,
        new_bytes: u64,
    ) -> Result<(), TransportError> {
        self.flow_control.bytes_received = self.flow_control.bytes_received.saturating_add(new_bytes);
        if self.flow_control.bytes_received > self.flow_control.advertised_max_offset {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection data beyond advertised window",
            ));
        }
        Ok(())
    }

    //
    // Migration
    //

    fn on_connection_migration(
        &mut self,
        new_peer_address: SocketAddr,
        intentional: bool,
        now: Instant,
    ) -> Result<(), TransportError> {
        if self.migration.num_migrations >= MAX_MIGRATIONS {
            self.drop_packet(0, PacketDropReason::PeerAddressChange);
            return Err(TransportError::INVALID_MIGRATION("too many migrations"));
        }
        self.migration.num_migrations += 1;
        self.stats.migrations += 1;

        let had_pending_path_challenge = self.pending.path_challenge.is_some();
        // A challenge queued for the previous path is useless now
        self.pending.path_challenge = None;

        let known_path = self
            .migration
            .previous_peer_addresses
            .iter()
            .position(|&address| address == new_peer_address);
        match known_path {
            None => {
                // The write path sets `outstanding_path_validation` and arms
                // the timeout when it actually transmits this challenge
                let challenge_data: u64 = rand::thread_rng().gen();
                self.pending.path_challenge = Some(challenge_data);
                self.path_validation_limiter =
                    Some(PendingPathRateLimiter::new(self.udp_send_packet_len));
            }
            Some(position) => {
                self.migration.previous_peer_addresses.remove(position);
            }
        }

        let nat_rebinding = maybe_nat_rebinding(&new_peer_address, &self.peer_address);
        if had_pending_path_challenge || self.outstanding_path_validation.is_some() {
            // A validation of the previous path was still in progress;
            // cancel it. Unless this is rebinding, the congestion state no
            // longer matches any validated path.
            self.pending.schedule_path_validation_timeout = false;
            self.outstanding_path_validation = None;
            if !nat_rebinding {
                self.recover_or_reset_congestion_and_rtt(new_peer_address, now);
            }
        } else {
            // Leaving a validated path; remember it and its congestion state
            self.migration
                .previous_peer_addresses
                .push(self.peer_address);
            if !nat_rebinding {
                let saved = self.park_congestion_and_rtt(now);
                self.recover_or_reset_congestion_and_rtt(new_peer_address, now);
                self.migration.last_congestion_and_rtt = Some(saved);
            }
        }

        self.qlog.on_connection_migration(intentional);
        trace!(
            %new_peer_address,
            migrations = self.migration.num_migrations,
            nat_rebinding,
            "connection migrated"
        );
        self.peer_address = new_peer_address;
        Ok(())
    }

    fn park_congestion_and_rtt(&mut self, now: Instant) -> CongestionAndRttState {
        CongestionAndRttState {
            peer_address: self.peer_address,
            record_time: now,
            congestion: self.congestion.take().unwrap(),
            rtt: self.rtt,
        }
    }

    fn recover_or_reset_congestion_and_rtt(&mut self, peer_address: SocketAddr, now: Instant) {
        match self.migration.last_congestion_and_rtt.take() {
            Some(saved)
                if saved.peer_address == peer_address
                    && now.saturating_duration_since(saved.record_time)
                        <= CONGESTION_STATE_RETENTION =>
            {
                trace!("restoring congestion and rtt state for known path");
                self.congestion = Some(saved.congestion);
                self.rtt = saved.rtt;
            }
            stale => {
                // Either no saved state, a different path, or too old
                self.migration.last_congestion_and_rtt = stale;
                self.congestion =
                    Some(self.settings.congestion_controller_factory.build(now));
                self.rtt.reset();
            }
        }
    }

    //
    // Handshake progression
    //

    fn update_handshake_state(&mut self, now: Instant) -> Result<(), TransportError> {
        // Zero-RTT read keys exist once the client hello has been processed
        // and the early data attempt accepted
        if let Some(keys) = self.handshake.zero_rtt_read_keys() {
            self.used_zero_rtt = true;
            self.qlog
                .on_transport_state_update(qlog::DERIVED_ZERO_RTT_READ_CIPHER);
            let codec = self.codec.as_mut().unwrap();
            codec.install_zero_rtt_key(keys.packet);
            codec.install_zero_rtt_header_key(keys.header);
        }
        if let Some(header_key) = self.handshake.one_rtt_write_header_key() {
            self.one_rtt_write_header_key = Some(header_key);
        }
        if let Some(header_key) = self.handshake.one_rtt_read_header_key() {
            self.codec
                .as_mut()
                .unwrap()
                .install_one_rtt_header_key(header_key);
        }
        if let Some(write_key) = self.handshake.one_rtt_write_key() {
            self.qlog
                .on_transport_state_update(qlog::DERIVED_ONE_RTT_WRITE_CIPHER);
            if self.one_rtt_write_key.is_some() {
                return Err(TransportError::CRYPTO_ERROR("duplicate 1-rtt write cipher"));
            }
            self.one_rtt_write_key = Some(write_key);
            update_pacing_on_key_established(self.pacer.as_mut(), &self.settings, now);
            // Transport parameters are negotiated the moment the 1-RTT
            // write keys exist
            let client_params = self.handshake.client_transport_parameters().ok_or_else(|| {
                TransportError::TRANSPORT_PARAMETER_ERROR("no client transport params")
            })?;
            self.process_client_initial_params(&client_params)?;
        }
        if let Some(read_key) = self.handshake.one_rtt_read_key() {
            self.qlog
                .on_transport_state_update(qlog::DERIVED_ONE_RTT_READ_CIPHER);
            // The client Finished has arrived; the zero-RTT byte cap ends
            self.writable_bytes_limit = None;
            self.codec.as_mut().unwrap().install_one_rtt_key(read_key);
        }
        if let Some(keys) = self.handshake.handshake_read_keys() {
            self.codec.as_mut().unwrap().install_handshake_keys(keys);
        }
        if self.handshake.is_done() {
            debug_assert!(self.one_rtt_write_key.is_some());
            if !self.handshake_done_sent {
                self.spaces[SpaceId::Data].pending.handshake_done = true;
                self.handshake_done_sent = true;
            }
        }
        Ok(())
    }

    /// HANDSHAKE_DONE was acknowledged; the client has confirmed 1-RTT
    fn on_handshake_confirmed(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        trace!("handshake confirmed");
        self.handshake_confirmed = true;
        let space = &mut self.spaces[SpaceId::Handshake];
        space.crypto_stream.implicitly_ack(&mut space.pending);
        // Undecryptable-packet buffers have no further purpose
        self.pending_zero_rtt = None;
        self.pending_one_rtt = None;
    }

    /// Validate and apply the client's transport parameters
    pub(crate) fn process_client_initial_params(
        &mut self,
        client_params: &ClientTransportParameters,
    ) -> Result<(), TransportError> {
        use TransportParameterId as Id;
        let preferred_address = client_params.get_integer(Id::PreferredAddress)?;
        let orig_dst_cid = client_params.get_integer(Id::OriginalDestinationConnectionId)?;
        let stateless_reset_token = client_params.get_integer(Id::StatelessResetToken)?;
        let retry_src_cid = client_params.get_integer(Id::RetrySourceConnectionId)?;

        let max_data = client_params.get_integer(Id::InitialMaxData)?;
        let max_stream_data_bidi_local =
            client_params.get_integer(Id::InitialMaxStreamDataBidiLocal)?;
        let max_stream_data_bidi_remote =
            client_params.get_integer(Id::InitialMaxStreamDataBidiRemote)?;
        let max_stream_data_uni = client_params.get_integer(Id::InitialMaxStreamDataUni)?;
        let max_streams_bidi = client_params.get_integer(Id::InitialMaxStreamsBidi)?;
        let max_streams_uni = client_params.get_integer(Id::InitialMaxStreamsUni)?;
        let idle_timeout = client_params.get_integer(Id::MaxIdleTimeout)?;
        let ack_delay_exponent = client_params.get_integer(Id::AckDelayExponent)?;
        let packet_size = client_params.get_integer(Id::MaxUdpPayloadSize)?;
        let active_connection_id_limit =
            client_params.get_integer(Id::ActiveConnectionIdLimit)?;
        let d6d_base_pmtu = client_params.get_integer(Id::D6dBasePmtu)?;
        let d6d_raise_timeout = client_params.get_integer(Id::D6dRaiseTimeout)?;
        let d6d_probe_timeout = client_params.get_integer(Id::D6dProbeTimeout)?;
        let min_ack_delay = client_params.get_integer(Id::MinAckDelay)?;
        let max_ack_delay = client_params.get_integer(Id::MaxAckDelay)?;
        let max_datagram_frame_size = client_params.get_integer(Id::MaxDatagramFrameSize)?;

        if matches!(self.version, Some(Version::V1) | Some(Version::Draft29)) {
            let initial_source_cid =
                client_params.get_connection_id(Id::InitialSourceConnectionId);
            let client_cid = self.codec.as_ref().unwrap().client_connection_id();
            if initial_source_cid.as_ref() != Some(client_cid) {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "initial source connection id does not match",
                ));
            }
        }

        // Server-only parameters must not arrive from a client
        if preferred_address.map_or(false, |value| value != 0) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "preferred address is received by server",
            ));
        }
        if orig_dst_cid.map_or(false, |value| value != 0) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "original destination connection id is received by server",
            ));
        }
        if stateless_reset_token.map_or(false, |value| value != 0) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "stateless reset token is received by server",
            ));
        }
        if retry_src_cid.map_or(false, |value| value != 0) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "retry source connection id is received by server",
            ));
        }
        if max_ack_delay.map_or(false, |value| value >= MAX_ACK_DELAY_MS) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "Max Ack Delay is greater than 2^14",
            ));
        }
        if let Some(size) = packet_size {
            if size < MIN_MAX_UDP_PAYLOAD {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(format!(
                    "max packet size too small, received max_udp_payload_size = {size}"
                )));
            }
        }

        trace!(
            conn = max_data.unwrap_or(0),
            bidi_local = max_stream_data_bidi_local.unwrap_or(0),
            bidi_remote = max_stream_data_bidi_remote.unwrap_or(0),
            uni = max_stream_data_uni.unwrap_or(0),
            "client advertised flow control"
        );
        self.flow_control.peer_advertised_max_offset = max_data.unwrap_or(0);
        self.streams.set_peer_params(
            PeerStreamWindows {
                bidi_local: max_stream_data_bidi_local.unwrap_or(0),
                bidi_remote: max_stream_data_bidi_remote.unwrap_or(0),
                uni: max_stream_data_uni.unwrap_or(0),
            },
            max_streams_bidi.unwrap_or(0),
            max_streams_uni.unwrap_or(0),
        )?;
        self.peer_idle_timeout = cmp::min(
            Duration::from_millis(idle_timeout.unwrap_or(0)),
            MAX_IDLE_TIMEOUT,
        );
        if ack_delay_exponent.map_or(false, |value| value > MAX_ACK_DELAY_EXPONENT) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "ack_delay_exponent too large",
            ));
        }
        self.peer_ack_delay_exponent =
            ack_delay_exponent.unwrap_or(DEFAULT_ACK_DELAY_EXPONENT) as u8;
        self.codec
            .as_mut()
            .unwrap()
            .set_ack_delay_exponent(self.peer_ack_delay_exponent);
        if let Some(delay) = min_ack_delay {
            self.peer_min_ack_delay = Some(Duration::from_micros(delay));
        }
        if let Some(frame_size) = max_datagram_frame_size {
            if frame_size > 0 && frame_size <= MAX_DATAGRAM_PACKET_OVERHEAD {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "max_datagram_frame_size too small",
                ));
            }
            self.datagrams.max_write_frame_size = frame_size;
        }

        // Path MTU can be probed from here on; the peer's limit is the cap
        let mut max_udp_payload_size = MAX_UDP_PAYLOAD;
        if let Some(size) = packet_size {
            max_udp_payload_size = cmp::min(size, max_udp_payload_size);
            self.peer_max_udp_payload_size = max_udp_payload_size;
            if self.settings.force_path_mtu {
                if size > MAX_UDP_PAYLOAD {
                    // A sane peer never advertises beyond the default limit,
                    // fall back rather than trust it
                    self.udp_send_packet_len = DEFAULT_UDP_SEND_PACKET_LEN;
                } else {
                    self.udp_send_packet_len = max_udp_payload_size;
                }
            }
        }

        self.peer_active_connection_id_limit =
            active_connection_id_limit.unwrap_or(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT);

        if self.settings.d6d.enabled {
            self.pmtud.on_peer_params(
                d6d_base_pmtu,
                d6d_raise_timeout,
                d6d_probe_timeout,
                self.udp_send_packet_len,
                max_udp_payload_size,
            );
        }
        Ok(())
    }

    //
    // Zero-RTT source-address token
    //

    /// Check the source addresses presented in the client's session token
    /// and decide zero-RTT admission per the configured policy
    ///
    /// The updated list is retained for issuing the next session token.
    pub fn validate_and_update_source_token(
        &mut self,
        mut source_addresses: Vec<IpAddr>,
    ) -> bool {
        let peer_ip = self.peer_address.ip();
        let mut found_match = false;
        let mut index = source_addresses.len();
        while index > 0 {
            index -= 1;
            if source_addresses[index] == peer_ip {
                found_match = true;
                // Move the match to the most-recently-used end
                source_addresses.remove(index);
                source_addresses.push(peer_ip);
            }
        }
        self.source_token_matching = Some(found_match);
        let policy = self.settings.zero_rtt_source_token_matching_policy;
        let mut accept_zero_rtt =
            policy != ZeroRttSourceTokenMatchingPolicy::AlwaysReject && found_match;

        if !found_match {
            // Remember this address for the next resumption
            if source_addresses.len() >= MAX_TOKEN_SOURCE_ADDRESSES {
                source_addresses.remove(0);
            }
            source_addresses.push(peer_ip);

            match policy {
                ZeroRttSourceTokenMatchingPolicy::AlwaysReject
                | ZeroRttSourceTokenMatchingPolicy::RejectIfNoExactMatch => {
                    accept_zero_rtt = false;
                }
                ZeroRttSourceTokenMatchingPolicy::LimitIfNoExactMatch => {
                    accept_zero_rtt = true;
                    self.writable_bytes_limit =
                        Some(self.settings.limited_cwnd_in_mss * self.udp_send_packet_len);
                }
            }
        }
        self.token_source_addresses = source_addresses;
        accept_zero_rtt
    }

    /// Each received packet buys the peer one more window of writable
    /// bytes; it could open a fresh connection to the same effect
    fn update_writable_byte_limit_on_recv_packet(&mut self) {
        if let Some(limit) = self.writable_bytes_limit {
            self.writable_bytes_limit =
                Some(limit + self.settings.limited_cwnd_in_mss * self.udp_send_packet_len);
        }
    }

    /// Apply transport settings resumed from a session ticket
    #[allow(clippy::too_many_arguments)]
    pub fn update_transport_params_from_ticket(
        &mut self,
        idle_timeout: Duration,
        max_recv_packet_size: u64,
        initial_max_data: u64,
        initial_max_stream_data_bidi_local: u64,
        initial_max_stream_data_bidi_remote: u64,
        initial_max_stream_data_uni: u64,
        initial_max_streams_bidi: u64,
        initial_max_streams_uni: u64,
    ) {
        self.settings.idle_timeout = idle_timeout;
        self.settings.max_recv_packet_size = max_recv_packet_size;
        self.settings.advertised_connection_window = initial_max_data;
        self.settings.advertised_bidi_local_stream_window = initial_max_stream_data_bidi_local;
        self.settings.advertised_bidi_remote_stream_window = initial_max_stream_data_bidi_remote;
        self.settings.advertised_uni_stream_window = initial_max_stream_data_uni;
        self.settings.advertised_max_streams_bidi = initial_max_streams_bidi;
        self.settings.advertised_max_streams_uni = initial_max_streams_uni;
        self.flow_control.advertised_max_offset = initial_max_data;
        self.streams.refresh_transport_settings(&self.settings);
    }

    /// Hook for the experimental wire version; intentionally inert
    fn apply_experimental_settings(&mut self) {}

    //
    // Closed-state receive path
    //

    fn on_read_closed(&mut self, read_data: &mut ReadData) -> Result<(), TransportError> {
        debug_assert_eq!(self.state, State::Closed);
        let packet_size = read_data.data.len();
        if self.codec.is_none() {
            // Closed before the first packet ever parsed; drop everything
            self.drop_packet(packet_size, PacketDropReason::ServerStateClosed);
            return Ok(());
        }
        if self.peer_error.is_some() {
            // Already have a peer error; nothing further matters
            self.drop_packet(packet_size, PacketDropReason::ServerStateClosed);
            return Ok(());
        }
        let largest_pns = self.spaces.largest_received();
        let result = self
            .codec
            .as_mut()
            .unwrap()
            .parse_packet(&mut read_data.data, &largest_pns);
        let packet = match result {
            CodecResult::Packet(packet) => packet,
            CodecResult::CipherUnavailable(_) | CodecResult::Nothing => {
                self.drop_packet(packet_size, PacketDropReason::CipherUnavailable);
                return Ok(());
            }
            CodecResult::Retry => {
                self.drop_packet(packet_size, PacketDropReason::Retry);
                return Ok(());
            }
            CodecResult::StatelessReset => {
                self.drop_packet(packet_size, PacketDropReason::Reset);
                return Ok(());
            }
        };
        if packet.frames.is_empty() {
            self.drop_packet(packet_size, PacketDropReason::ProtocolViolation);
            return Err(TransportError::PROTOCOL_VIOLATION("packet has no frames"));
        }
        let packet_num = packet.header.number();
        let space_id = packet.header.space();
        self.qlog.on_packet_received(space_id, packet_num, packet_size);

        // Only close frames matter in this state
        for quic_frame in &packet.frames {
            if let Frame::Close(close) = quic_frame {
                self.store_peer_close(close);
            }
        }

        // Track the largest received packet number so the driver can decide
        // whether a new close needs to go out
        let ack_state = &mut self.spaces[space_id].ack_state;
        ack_state.largest_received = Some(
            ack_state
                .largest_received
                .map_or(packet_num, |largest| largest.max(packet_num)),
        );
        Ok(())
    }

    //
    // Driver hooks
    //

    /// The delayed-ack timer fired
    pub fn on_ack_timeout(&mut self) {
        self.spaces[SpaceId::Data]
            .ack_state
            .on_ack_timeout(&mut self.pending);
    }

    /// The write path transmitted the queued PATH_CHALLENGE
    pub fn on_path_challenge_sent(&mut self) {
        if let Some(data) = self.pending.path_challenge.take() {
            self.outstanding_path_validation = Some(data);
            self.pending.schedule_path_validation_timeout = true;
        }
    }

    /// The path-validation timer fired without a matching PATH_RESPONSE
    pub fn on_path_validation_timeout(&mut self) {
        self.outstanding_path_validation = None;
        self.pending.schedule_path_validation_timeout = false;
        self.handle_transport_error(TransportError::INVALID_MIGRATION(
            "path validation timed out",
        ));
    }

    /// Record transmission of a packet assembled by the write path, and
    /// return the packet number it consumed
    pub fn on_packet_sent(&mut self, space_id: SpaceId, packet: SentPacket) -> u64 {
        let packet_number = {
            let ack_state = &mut self.spaces[space_id].ack_state;
            let packet_number = ack_state.next_packet_number;
            ack_state.next_packet_number += 1;
            packet_number
        };
        if self.spaces[space_id].ack_state.next_packet_number == MAX_PACKET_NUMBER - 1 {
            self.pending.close_transport = true;
        }
        let mut sent_acks_largest = None;
        for sent_frame in &packet.frames {
            match sent_frame {
                SentFrame::Crypto { offsets } => {
                    self.spaces[space_id].crypto_stream.on_data_sent(offsets.clone());
                }
                SentFrame::Stream(meta) => {
                    if let Some(stream) = self.streams.find_stream_mut(meta.id) {
                        stream.on_sent(meta);
                    }
                    self.streams.add_tx(meta.id);
                    self.streams.update_writable_streams(meta.id);
                }
                SentFrame::Ack { ranges } => {
                    sent_acks_largest = ranges.max();
                }
                SentFrame::HandshakeDone => {
                    self.spaces[space_id].pending.handshake_done = false;
                }
                SentFrame::Ping { .. } => {
                    self.spaces[space_id].pending.ping = false;
                }
                SentFrame::ResetStream(_) | SentFrame::Datagram => {}
            }
        }
        if let Some(largest) = sent_acks_largest {
            self.spaces[space_id]
                .ack_state
                .on_sent_packet_with_acks(&mut self.pending, largest);
        }
        if packet.ack_eliciting {
            if let Some(congestion) = &mut self.congestion {
                congestion.on_sent(packet.time_sent, u64::from(packet.size));
            }
        }
        if let Some(limiter) = &mut self.path_validation_limiter {
            limiter.on_packet_sent(u64::from(packet.size));
        }
        self.spaces[space_id].sent_packets.insert(packet_number, packet);
        packet_number
    }

    /// Bytes the write path may emit right now, combining the congestion
    /// window, the zero-RTT cap, and the path-validation limiter
    pub fn writable_bytes(&mut self, now: Instant) -> u64 {
        let window = self
            .congestion
            .as_ref()
            .map_or(u64::MAX, |congestion| congestion.window());
        let limit = self.writable_bytes_limit.unwrap_or(u64::MAX);
        let rtt = if self.rtt.has_sample() {
            self.rtt.smoothed()
        } else {
            Duration::from_millis(100)
        };
        let path = match &mut self.path_validation_limiter {
            Some(limiter) => limiter.current_credit(now, rtt),
            None => u64::MAX,
        };
        window.min(limit).min(path)
    }

    /// Replay buffer for zero-RTT packets that arrived before their keys
    ///
    /// Taking the contents retires the buffer; later undecryptable packets
    /// at that epoch are dropped instead of buffered.
    pub fn drain_pending_zero_rtt_data(&mut self) -> Vec<ReadData> {
        self.pending_zero_rtt.take().unwrap_or_default()
    }

    /// Replay buffer for 1-RTT packets that arrived before their keys
    pub fn drain_pending_one_rtt_data(&mut self) -> Vec<ReadData> {
        self.pending_one_rtt.take().unwrap_or_default()
    }

    pub fn set_pacer(&mut self, pacer: Box<dyn Pacer>) {
        self.pacer = Some(pacer);
    }

    /// Override the ack-elicitation threshold for one space
    pub fn set_ack_tolerance(&mut self, space_id: SpaceId, tolerance: u16) {
        self.spaces[space_id].ack_state.tolerance = Some(tolerance);
    }

    fn drop_packet(&mut self, size: usize, reason: PacketDropReason) {
        self.qlog.on_packet_drop(size, reason);
        self.stats.packets_dropped += 1;
    }

    //
    // Accessors
    //

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn original_peer_address(&self) -> SocketAddr {
        self.original_peer_address
    }

    pub fn local_address(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn server_connection_id(&self) -> Option<&ConnectionId> {
        self.server_cid.as_ref()
    }

    pub fn client_connection_id(&self) -> Option<&ConnectionId> {
        self.client_cid.as_ref()
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamManager {
        &mut self.streams
    }

    pub fn datagrams_mut(&mut self) -> &mut Datagrams {
        &mut self.datagrams
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        stats.streams_opened = self.streams.streams_opened;
        stats.streams_closed = self.streams.streams_closed;
        stats
    }

    pub fn pending_events(&self) -> &PendingEvents {
        &self.pending
    }

    pub fn pending_events_mut(&mut self) -> &mut PendingEvents {
        &mut self.pending
    }

    /// The peer's close code and reason, if it closed the connection
    pub fn peer_error(&self) -> Option<&(CloseCode, String)> {
        self.peer_error.as_ref()
    }

    /// The local error the connection closed with, if any
    pub fn close_cause(&self) -> Option<&TransportError> {
        self.close_cause.as_ref()
    }

    pub fn migration_state(&self) -> &MigrationState {
        &self.migration
    }

    pub fn source_token_matching(&self) -> Option<bool> {
        self.source_token_matching
    }

    pub fn token_source_addresses(&self) -> &[IpAddr] {
        &self.token_source_addresses
    }

    /// Effective idle timeout: the smaller of ours and the peer's
    pub fn idle_timeout(&self) -> Duration {
        if self.peer_idle_timeout > Duration::ZERO {
            cmp::min(self.settings.idle_timeout, self.peer_idle_timeout)
        } else {
            self.settings.idle_timeout
        }
    }

    /// Whether the peer's early data was decrypted on this connection
    pub fn used_zero_rtt(&self) -> bool {
        self.used_zero_rtt
    }

    pub fn peer_min_ack_delay(&self) -> Option<Duration> {
        self.peer_min_ack_delay
    }

    pub fn peer_max_udp_payload_size(&self) -> u64 {
        self.peer_max_udp_payload_size
    }

    pub fn peer_active_connection_id_limit(&self) -> u64 {
        self.peer_active_connection_id_limit
    }

    /// Connection IDs the peer has issued for future migrations
    pub fn peer_connection_ids(&self) -> &[frame::NewConnectionId] {
        &self.peer_cids
    }
}
