use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Instant,
};

use bytes::{Bytes, BytesMut};

use crate::{
    cid::{ResetToken, ResetTokenFactory},
    codec::{
        CodecResult, EncryptionLevel, LongType, Packet, PacketHeader, ReadCodec,
    },
    congestion::{Controller, ControllerFactory},
    crypto::{CryptoFactory, HeaderKey, Keys, PacketKey},
    frame::Frame,
    handshake::Handshake,
    qlog::{PacketDropReason, QlogSink},
    transport_parameters::{
        ClientTransportParameters, ServerTransportParameters, TransportParameter,
        TransportParameterId,
    },
    Connection, ConnectionId, ReadData, ServerConfig, TransportConfig, TransportError, Version,
};

pub(super) const ORIGINAL_DST_CID: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
pub(super) const CLIENT_CID: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];

/// Bytes the mock codec consumes per scripted packet
const MOCK_PACKET_LEN: usize = 64;

pub(super) fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

pub(super) fn client_addr() -> SocketAddr {
    "10.0.0.1:5000".parse().unwrap()
}

//
// Key material
//

struct TestPacketKey;

impl PacketKey for TestPacketKey {
    fn tag_len(&self) -> usize {
        16
    }
}

struct TestHeaderKey;

impl HeaderKey for TestHeaderKey {
    fn sample_size(&self) -> usize {
        16
    }
}

pub(super) fn test_keys() -> Keys {
    Keys {
        packet: Box::new(TestPacketKey),
        header: Box::new(TestHeaderKey),
    }
}

pub(super) fn test_packet_key() -> Box<dyn PacketKey> {
    Box::new(TestPacketKey)
}

pub(super) fn test_header_key() -> Box<dyn HeaderKey> {
    Box::new(TestHeaderKey)
}

struct TestCryptoFactory;

impl CryptoFactory for TestCryptoFactory {
    fn client_initial_keys(&self, _dst_cid: &ConnectionId, _version: Version) -> Keys {
        test_keys()
    }

    fn server_initial_keys(&self, _dst_cid: &ConnectionId, _version: Version) -> Keys {
        test_keys()
    }
}

//
// Scripted codec
//

/// Shared between the test and the codec the connection owns
#[derive(Default)]
pub(super) struct CodecScript {
    pub results: Mutex<VecDeque<CodecResult>>,
    /// Names of key-management calls, in order
    pub installed: Mutex<Vec<&'static str>>,
}

pub(super) struct TestCodecFactory {
    pub script: Arc<CodecScript>,
}

impl crate::codec::CodecFactory for TestCodecFactory {
    fn new_codec(
        &self,
        _version: Version,
        client_cid: ConnectionId,
        _server_cid: ConnectionId,
        _initial_read_keys: Keys,
    ) -> Box<dyn ReadCodec> {
        self.script.installed.lock().unwrap().push("initial read");
        Box::new(TestCodec {
            script: self.script.clone(),
            client_cid,
        })
    }
}

struct TestCodec {
    script: Arc<CodecScript>,
    client_cid: ConnectionId,
}

impl ReadCodec for TestCodec {
    fn parse_packet(&mut self, data: &mut BytesMut, _largest_pns: &[Option<u64>; 3]) -> CodecResult {
        let take = data.len().min(MOCK_PACKET_LEN);
        let _ = data.split_to(take);
        match self.script.results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => CodecResult::Nothing,
        }
    }

    fn client_connection_id(&self) -> &ConnectionId {
        &self.client_cid
    }

    fn install_zero_rtt_key(&mut self, _key: Box<dyn PacketKey>) {
        self.script.installed.lock().unwrap().push("0-rtt read");
    }

    fn install_zero_rtt_header_key(&mut self, _key: Box<dyn HeaderKey>) {
        self.script.installed.lock().unwrap().push("0-rtt header");
    }

    fn install_handshake_keys(&mut self, _keys: Keys) {
        self.script.installed.lock().unwrap().push("handshake read");
    }

    fn install_one_rtt_key(&mut self, _key: Box<dyn PacketKey>) {
        self.script.installed.lock().unwrap().push("1-rtt read");
    }

    fn install_one_rtt_header_key(&mut self, _key: Box<dyn HeaderKey>) {
        self.script.installed.lock().unwrap().push("1-rtt header");
    }

    fn discard_initial_keys(&mut self) {
        self.script.installed.lock().unwrap().push("discard initial");
    }

    fn set_ack_delay_exponent(&mut self, _exponent: u8) {}
}

//
// Scripted handshake engine
//

#[derive(Default)]
pub(super) struct HandshakeInner {
    pub accepted: Option<ServerTransportParameters>,
    pub received: Vec<(Bytes, EncryptionLevel)>,
    pub zero_rtt_read_keys: Option<Keys>,
    pub handshake_read_keys: Option<Keys>,
    pub one_rtt_write_key: Option<Box<dyn PacketKey>>,
    pub one_rtt_write_header_key: Option<Box<dyn HeaderKey>>,
    pub one_rtt_read_key: Option<Box<dyn PacketKey>>,
    pub one_rtt_read_header_key: Option<Box<dyn HeaderKey>>,
    pub client_params: Option<ClientTransportParameters>,
    pub done: bool,
}

pub(super) struct TestHandshake {
    pub inner: Arc<Mutex<HandshakeInner>>,
}

impl Handshake for TestHandshake {
    fn accept(&mut self, params: ServerTransportParameters) {
        self.inner.lock().unwrap().accepted = Some(params);
    }

    fn read_handshake(
        &mut self,
        data: Bytes,
        level: EncryptionLevel,
    ) -> Result<(), TransportError> {
        self.inner.lock().unwrap().received.push((data, level));
        Ok(())
    }

    fn zero_rtt_read_keys(&mut self) -> Option<Keys> {
        self.inner.lock().unwrap().zero_rtt_read_keys.take()
    }

    fn handshake_read_keys(&mut self) -> Option<Keys> {
        self.inner.lock().unwrap().handshake_read_keys.take()
    }

    fn one_rtt_write_key(&mut self) -> Option<Box<dyn PacketKey>> {
        self.inner.lock().unwrap().one_rtt_write_key.take()
    }

    fn one_rtt_write_header_key(&mut self) -> Option<Box<dyn HeaderKey>> {
        self.inner.lock().unwrap().one_rtt_write_header_key.take()
    }

    fn one_rtt_read_key(&mut self) -> Option<Box<dyn PacketKey>> {
        self.inner.lock().unwrap().one_rtt_read_key.take()
    }

    fn one_rtt_read_header_key(&mut self) -> Option<Box<dyn HeaderKey>> {
        self.inner.lock().unwrap().one_rtt_read_header_key.take()
    }

    fn client_transport_parameters(&mut self) -> Option<ClientTransportParameters> {
        self.inner.lock().unwrap().client_params.take()
    }

    fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }
}

//
// Congestion controller with an identity tag
//

/// Controllers report `window = WINDOW_TAG_BASE + id`, which lets tests
/// check identity across park/restore without downcasting
pub(super) const WINDOW_TAG_BASE: u64 = 100_000;

struct TestController {
    id: u64,
    app_idle_events: Arc<Mutex<Vec<bool>>>,
}

impl Controller for TestController {
    fn on_sent(&mut self, _now: Instant, _bytes: u64) {}
    fn on_ack(&mut self, _now: Instant, _bytes: u64) {}
    fn on_loss(&mut self, _now: Instant, _bytes: u64, _persistent: bool) {}

    fn set_app_idle(&mut self, idle: bool, _now: Instant) {
        self.app_idle_events.lock().unwrap().push(idle);
    }

    fn window(&self) -> u64 {
        WINDOW_TAG_BASE + self.id
    }
}

pub(super) struct TestControllerFactory {
    pub built: Arc<Mutex<u64>>,
    pub app_idle_events: Arc<Mutex<Vec<bool>>>,
}

impl ControllerFactory for TestControllerFactory {
    fn build(&self, _now: Instant) -> Box<dyn Controller> {
        let mut built = self.built.lock().unwrap();
        *built += 1;
        Box::new(TestController {
            id: *built,
            app_idle_events: self.app_idle_events.clone(),
        })
    }
}

//
// Misc collaborators
//

struct TestResetTokens;

impl ResetTokenFactory for TestResetTokens {
    fn generate_token(&self, cid: &ConnectionId) -> ResetToken {
        let mut token = [0u8; 16];
        token[..cid.len().min(16)].copy_from_slice(&cid[..cid.len().min(16)]);
        ResetToken(token)
    }
}

#[derive(Default)]
pub(super) struct RecordingQlog {
    pub drops: Arc<Mutex<Vec<PacketDropReason>>>,
}

struct RecordingQlogSink {
    drops: Arc<Mutex<Vec<PacketDropReason>>>,
}

impl QlogSink for RecordingQlogSink {
    fn on_packet_drop(&mut self, _size: usize, reason: PacketDropReason) {
        self.drops.lock().unwrap().push(reason);
    }
}

//
// Server fixture
//

pub(super) struct TestServer {
    pub conn: Connection,
    pub codec: Arc<CodecScript>,
    pub handshake: Arc<Mutex<HandshakeInner>>,
    pub controllers_built: Arc<Mutex<u64>>,
    pub app_idle_events: Arc<Mutex<Vec<bool>>>,
    pub drops: Arc<Mutex<Vec<PacketDropReason>>>,
    pub now: Instant,
}

/// Route logs through the test harness; `RUST_LOG=trace` shows the run
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(super) fn server_with(mut transport: TransportConfig) -> TestServer {
    init_tracing();
    let controllers_built = Arc::new(Mutex::new(0));
    let app_idle_events = Arc::new(Mutex::new(Vec::new()));
    transport.congestion_controller_factory = Arc::new(TestControllerFactory {
        built: controllers_built.clone(),
        app_idle_events: app_idle_events.clone(),
    });
    let script = Arc::new(CodecScript::default());
    let config = ServerConfig {
        transport: Arc::new(transport),
        crypto: Arc::new(TestCryptoFactory),
        codec: Arc::new(TestCodecFactory {
            script: script.clone(),
        }),
        cid_generator: Arc::new(crate::cid::RandomConnectionIdGenerator::new(8)),
        cid_rejector: None,
        reset_tokens: Arc::new(TestResetTokens),
    };
    let handshake = Arc::new(Mutex::new(HandshakeInner::default()));
    let qlog = RecordingQlog::default();
    let drops = qlog.drops.clone();
    let now = Instant::now();
    let conn = Connection::new(
        Arc::new(config),
        server_addr(),
        client_addr(),
        Box::new(TestHandshake {
            inner: handshake.clone(),
        }),
        Some(Box::new(RecordingQlogSink {
            drops: drops.clone(),
        })),
        now,
    );
    TestServer {
        conn,
        codec: script,
        handshake,
        controllers_built,
        app_idle_events,
        drops,
        now,
    }
}

pub(super) fn default_server() -> TestServer {
    server_with(TransportConfig::default())
}

//
// Packet construction
//

pub(super) fn initial_header_bytes() -> BytesMut {
    let mut data = Vec::new();
    data.push(0xc0);
    data.extend_from_slice(&1u32.to_be_bytes());
    data.push(ORIGINAL_DST_CID.len() as u8);
    data.extend_from_slice(&ORIGINAL_DST_CID);
    data.push(CLIENT_CID.len() as u8);
    data.extend_from_slice(&CLIENT_CID);
    data.resize(MOCK_PACKET_LEN, 0);
    BytesMut::from(&data[..])
}

pub(super) fn initial_packet(number: u64, frames: Vec<Frame>) -> CodecResult {
    CodecResult::Packet(Packet {
        header: PacketHeader::Long {
            ty: LongType::Initial,
            version: Version::V1,
            dst_cid: ConnectionId::new(&ORIGINAL_DST_CID),
            src_cid: ConnectionId::new(&CLIENT_CID),
            number,
        },
        frames,
    })
}

pub(super) fn handshake_packet(number: u64, frames: Vec<Frame>) -> CodecResult {
    CodecResult::Packet(Packet {
        header: PacketHeader::Long {
            ty: LongType::Handshake,
            version: Version::V1,
            dst_cid: ConnectionId::new(&ORIGINAL_DST_CID),
            src_cid: ConnectionId::new(&CLIENT_CID),
            number,
        },
        frames,
    })
}

pub(super) fn short_packet(number: u64, dst_cid: ConnectionId, frames: Vec<Frame>) -> CodecResult {
    CodecResult::Packet(Packet {
        header: PacketHeader::Short {
            dst_cid,
            number,
            key_phase: false,
        },
        frames,
    })
}

/// Queue scripted codec results and deliver a datagram from `peer`
pub(super) fn deliver(
    server: &mut TestServer,
    peer: SocketAddr,
    results: Vec<CodecResult>,
    now: Instant,
) -> Result<(), TransportError> {
    let count = results.len().max(1);
    server.codec.results.lock().unwrap().extend(results);
    let data = BytesMut::zeroed(MOCK_PACKET_LEN * count);
    server.conn.on_read_data(ReadData {
        peer,
        data,
        receive_time: now,
    })
}

/// Deliver the client's first flight: a real invariant header plus one
/// scripted Initial packet carrying `frames`
pub(super) fn deliver_first_flight(
    server: &mut TestServer,
    frames: Vec<Frame>,
    now: Instant,
) -> Result<(), TransportError> {
    server
        .codec
        .results
        .lock()
        .unwrap()
        .push_back(initial_packet(0, frames));
    server.conn.on_read_data(ReadData {
        peer: client_addr(),
        data: initial_header_bytes(),
        receive_time: now,
    })
}

//
// Client transport parameters
//

/// A parameter set that passes validation
pub(super) fn client_params() -> ClientTransportParameters {
    use TransportParameterId as Id;
    ClientTransportParameters {
        parameters: vec![
            TransportParameter::integer(Id::InitialMaxData, 1 << 20),
            TransportParameter::integer(Id::InitialMaxStreamDataBidiLocal, 1 << 18),
            TransportParameter::integer(Id::InitialMaxStreamDataBidiRemote, 1 << 18),
            TransportParameter::integer(Id::InitialMaxStreamDataUni, 1 << 18),
            TransportParameter::integer(Id::InitialMaxStreamsBidi, 100),
            TransportParameter::integer(Id::InitialMaxStreamsUni, 100),
            TransportParameter::integer(Id::MaxIdleTimeout, 30_000),
            TransportParameter::integer(Id::AckDelayExponent, 3),
            TransportParameter::integer(Id::MaxUdpPayloadSize, 1452),
            TransportParameter::integer(Id::ActiveConnectionIdLimit, 4),
            TransportParameter::integer(Id::MaxAckDelay, 25),
            TransportParameter {
                id: Id::InitialSourceConnectionId as u64,
                value: Bytes::copy_from_slice(&CLIENT_CID),
            },
        ],
    }
}

/// Replace or add an integer parameter in a parameter set
pub(super) fn set_param(
    params: &mut ClientTransportParameters,
    id: TransportParameterId,
    value: u64,
) {
    params.parameters.retain(|param| param.id != id as u64);
    params
        .parameters
        .push(TransportParameter::integer(id, value));
}

pub(super) fn crypto_frame(offset: u64, data: &'static [u8]) -> Frame {
    Frame::Crypto(crate::frame::Crypto {
        offset,
        data: Bytes::from_static(data),
    })
}
