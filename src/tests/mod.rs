use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches::assert_matches;
use bytes::Bytes;

use crate::{
    cid::{ConnectionIdGenerator, ResetToken, ResetTokenFactory},
    codec::{EncryptionLevel, ProtectionType, SpaceId, UndecryptablePacket},
    frame::{self, Frame},
    qlog::PacketDropReason,
    transport_parameters::TransportParameterId,
    ArrayRangeSet, CloseCode, ConnectionId, SendState, SentFrame, SentPacket, TransportConfig,
    TransportErrorCode, VarInt, ZeroRttSourceTokenMatchingPolicy,
};

mod util;
use util::*;

#[test]
fn first_packet_bootstrap() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();

    let server_cid = server.conn.server_connection_id().unwrap();
    assert_eq!(server_cid.len(), 8);
    assert_eq!(
        server.conn.client_connection_id().map(|cid| &cid[..]),
        Some(&CLIENT_CID[..])
    );
    assert_eq!(server.conn.peer_address(), client_addr());
    assert_eq!(server.conn.version(), Some(crate::Version::V1));
    assert!(server.conn.initial_write_keys.is_some());
    assert!(server
        .codec
        .installed
        .lock()
        .unwrap()
        .contains(&"initial read"));

    let inner = server.handshake.lock().unwrap();
    let accepted = inner.accepted.as_ref().unwrap();
    assert_eq!(
        &accepted.original_destination_connection_id[..],
        &ORIGINAL_DST_CID[..]
    );
    assert_eq!(inner.received.len(), 1);
    assert_eq!(inner.received[0].0, Bytes::from_static(b"client hello"));
    assert_eq!(inner.received[0].1, EncryptionLevel::Initial);
}

#[test]
fn version_negotiation_packet_dropped() {
    let mut server = default_server();
    let now = server.now;
    let mut data = initial_header_bytes();
    // Overwrite the version field with the negotiation sentinel
    data[1..5].copy_from_slice(&0u32.to_be_bytes());
    server
        .conn
        .on_read_data(crate::ReadData {
            peer: client_addr(),
            data,
            receive_time: now,
        })
        .unwrap();
    assert!(server.conn.server_connection_id().is_none());
    assert_eq!(
        server.drops.lock().unwrap().as_slice(),
        &[PacketDropReason::InvalidPacket]
    );
}

#[test]
fn short_initial_connection_id_dropped() {
    let mut server = default_server();
    let now = server.now;
    let mut data = Vec::new();
    data.push(0xc0);
    data.extend_from_slice(&1u32.to_be_bytes());
    data.push(4);
    data.extend_from_slice(&[9, 9, 9, 9]);
    data.push(0);
    data.resize(64, 0);
    server
        .conn
        .on_read_data(crate::ReadData {
            peer: client_addr(),
            data: bytes::BytesMut::from(&data[..]),
            receive_time: now,
        })
        .unwrap();
    assert!(server.conn.server_connection_id().is_none());
    assert_eq!(
        server.drops.lock().unwrap().as_slice(),
        &[PacketDropReason::InitialConnIdSmall]
    );
}

#[test]
fn transport_parameter_rejection() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    {
        let mut inner = server.handshake.lock().unwrap();
        inner.one_rtt_write_key = Some(test_packet_key());
        let mut params = client_params();
        set_param(&mut params, TransportParameterId::InitialMaxData, 1_000_000);
        set_param(&mut params, TransportParameterId::MaxAckDelay, 16385);
        inner.client_params = Some(params);
    }
    let err = deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(1, vec![crypto_frame(12, b"finished")])],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::TRANSPORT_PARAMETER_ERROR);
    assert_eq!(err.reason, "Max Ack Delay is greater than 2^14");
    assert!(server.conn.is_closed());
    assert!(server.conn.pending_events().connection_close);
    assert!(server
        .drops
        .lock()
        .unwrap()
        .contains(&PacketDropReason::TransportParameterError));
}

#[test]
fn client_params_applied() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    {
        let mut inner = server.handshake.lock().unwrap();
        inner.one_rtt_write_key = Some(test_packet_key());
        inner.client_params = Some(client_params());
    }
    deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(1, vec![crypto_frame(12, b"finished")])],
        now,
    )
    .unwrap();
    assert!(server.conn.one_rtt_write_key.is_some());
    assert_eq!(server.conn.flow_control.peer_advertised_max_offset, 1 << 20);
    assert_eq!(server.conn.peer_idle_timeout, Duration::from_secs(30));
    // Local streams became openable
    assert_eq!(
        server.conn.streams().openable_local_bidirectional_streams(),
        100
    );
}

#[test]
fn duplicate_one_rtt_write_cipher() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    {
        let mut inner = server.handshake.lock().unwrap();
        inner.one_rtt_write_key = Some(test_packet_key());
        inner.client_params = Some(client_params());
    }
    deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(1, vec![crypto_frame(12, b"first")])],
        now,
    )
    .unwrap();
    assert!(server.conn.one_rtt_write_key.is_some());

    // The engine hands out a second 1-RTT write key
    server.handshake.lock().unwrap().one_rtt_write_key = Some(test_packet_key());
    let err = deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(2, vec![crypto_frame(17, b"again")])],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::CRYPTO_ERROR);
    assert_eq!(err.reason, "duplicate 1-rtt write cipher");
    assert!(server.conn.is_closed());
}

#[test]
fn handshake_packet_discards_initial_keys() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    assert!(server.conn.initial_write_keys.is_some());
    deliver(
        &mut server,
        client_addr(),
        vec![handshake_packet(0, vec![crypto_frame(0, b"hs fin")])],
        now,
    )
    .unwrap();
    assert!(server.conn.initial_write_keys.is_none());
    assert!(server
        .codec
        .installed
        .lock()
        .unwrap()
        .contains(&"discard initial"));
}

#[test]
fn zero_frame_packet_is_protocol_violation() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let err = deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(1, vec![])],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::PROTOCOL_VIOLATION);
    assert_eq!(err.reason, "packet has no frames");
    assert!(server.conn.is_closed());
}

#[test]
fn restricted_frames_at_unprotected_levels() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let err = deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(
            1,
            vec![Frame::MaxData(VarInt::from_u32(5000))],
        )],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::PROTOCOL_VIOLATION);
    assert_eq!(err.reason, "invalid frame at unprotected level");
}

#[test]
fn migration_with_restored_congestion_state() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    server
        .conn
        .rtt
        .update(Duration::from_millis(50), Duration::ZERO);
    let srtt_before = server.conn.rtt.smoothed();
    assert_eq!(*server.controllers_built.lock().unwrap(), 1);

    // Non-probing packet from a new address, beyond the NAT-rebind heuristic
    let new_path: SocketAddr = "10.99.0.1:6000".parse().unwrap();
    deliver(
        &mut server,
        new_path,
        vec![short_packet(1, server_cid, vec![Frame::Ping])],
        now,
    )
    .unwrap();
    assert_eq!(server.conn.migration_state().num_migrations(), 1);
    assert_eq!(server.conn.peer_address(), new_path);
    assert!(server.conn.pending_events().path_challenge.is_some());
    {
        let saved = server.conn.migration.last_congestion_and_rtt.as_ref().unwrap();
        assert_eq!(saved.peer_address, client_addr());
        assert_eq!(saved.congestion.window(), WINDOW_TAG_BASE + 1);
        assert_eq!(saved.rtt.smoothed(), srtt_before);
    }
    // A fresh controller and estimator drive the unvalidated path
    assert_eq!(
        server.conn.congestion.as_ref().unwrap().window(),
        WINDOW_TAG_BASE + 2
    );
    assert!(!server.conn.rtt.has_sample());
    assert_eq!(
        server.conn.migration_state().previous_peer_addresses(),
        &[client_addr()]
    );

    // The peer returns to the original path within the retention window
    deliver(
        &mut server,
        client_addr(),
        vec![short_packet(2, server_cid, vec![Frame::Ping])],
        now,
    )
    .unwrap();
    assert_eq!(server.conn.migration_state().num_migrations(), 2);
    assert_eq!(server.conn.peer_address(), client_addr());
    // The parked controller comes back, same object
    assert_eq!(
        server.conn.congestion.as_ref().unwrap().window(),
        WINDOW_TAG_BASE + 1
    );
    assert_eq!(server.conn.rtt.smoothed(), srtt_before);
    assert!(server.conn.migration.last_congestion_and_rtt.is_none());
    assert!(server.conn.pending_events().path_challenge.is_none());
    assert!(server
        .conn
        .migration_state()
        .previous_peer_addresses()
        .is_empty());
}

#[test]
fn nat_rebinding_keeps_congestion_state() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    server
        .conn
        .rtt
        .update(Duration::from_millis(40), Duration::ZERO);
    let srtt = server.conn.rtt.smoothed();

    // Port-only change
    let rebound: SocketAddr = "10.0.0.1:9999".parse().unwrap();
    deliver(
        &mut server,
        rebound,
        vec![short_packet(1, server_cid, vec![Frame::Ping])],
        now,
    )
    .unwrap();
    assert_eq!(server.conn.migration_state().num_migrations(), 1);
    // Same controller, same estimator
    assert_eq!(
        server.conn.congestion.as_ref().unwrap().window(),
        WINDOW_TAG_BASE + 1
    );
    assert_eq!(server.conn.rtt.smoothed(), srtt);
    // Validation is still requested for the new path
    assert!(server.conn.pending_events().path_challenge.is_some());
}

#[test]
fn migration_rate_limited() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    for migration in 1..=6u64 {
        let peer: SocketAddr = format!("10.{migration}.0.1:6000").parse().unwrap();
        deliver(
            &mut server,
            peer,
            vec![short_packet(migration, server_cid, vec![Frame::Ping])],
            now,
        )
        .unwrap();
        assert_eq!(
            server.conn.migration_state().num_migrations(),
            migration as u32
        );
    }
    let one_too_many: SocketAddr = "10.7.0.1:6000".parse().unwrap();
    let err = deliver(
        &mut server,
        one_too_many,
        vec![short_packet(7, server_cid, vec![Frame::Ping])],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::INVALID_MIGRATION);
    assert_eq!(err.reason, "too many migrations");
    assert!(server.conn.is_closed());
}

#[test]
fn migration_rejected_during_handshake() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let moved: SocketAddr = "10.5.0.1:6000".parse().unwrap();
    let err = deliver(
        &mut server,
        moved,
        vec![initial_packet(1, vec![Frame::Ping])],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::INVALID_MIGRATION);
    assert_eq!(err.reason, "migration not allowed during handshake");
    assert!(server.conn.is_closed());
}

#[test]
fn migration_rejected_when_disabled() {
    let mut transport = TransportConfig::default();
    transport.disable_migration(true);
    let mut server = server_with(transport);
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    let moved: SocketAddr = "10.5.0.1:6000".parse().unwrap();
    let err = deliver(
        &mut server,
        moved,
        vec![short_packet(1, server_cid, vec![Frame::Ping])],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::INVALID_MIGRATION);
    assert_eq!(err.reason, "migration disabled");
}

#[test]
fn probing_packet_does_not_migrate() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    let moved: SocketAddr = "10.5.0.1:6000".parse().unwrap();
    let err = deliver(
        &mut server,
        moved,
        vec![short_packet(
            1,
            server_cid,
            vec![
                Frame::Simple(frame::SimpleFrame::PathChallenge(7)),
                Frame::Padding,
            ],
        )],
        now,
    )
    .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::INVALID_MIGRATION);
    assert_eq!(server.conn.migration_state().num_migrations(), 0);
}

#[test]
fn peer_close_delivers_error_and_answers_no_error() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    let err = deliver(
        &mut server,
        client_addr(),
        vec![short_packet(
            1,
            server_cid,
            vec![Frame::Close(frame::Close::Application(
                frame::ApplicationClose {
                    error_code: VarInt::from_u32(0x17),
                    reason: Bytes::from_static(b"done with you"),
                },
            ))],
        )],
        now,
    )
    .unwrap_err();
    // The wire answer is NO_ERROR; the app sees the peer's code
    assert_eq!(err.code, TransportErrorCode::NO_ERROR);
    assert!(server.conn.is_closed());
    let (code, message) = server.conn.peer_error().unwrap();
    assert_eq!(*code, CloseCode::Application(VarInt::from_u32(0x17)));
    assert!(message.contains("done with you"));

    // Everything after the peer error is dropped
    deliver(&mut server, client_addr(), vec![], now).unwrap();
    assert!(server
        .drops
        .lock()
        .unwrap()
        .contains(&PacketDropReason::ServerStateClosed));
}

#[test]
fn closed_state_records_largest_received_for_close_echo() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    server.conn.close();
    assert!(server.conn.is_closed());
    assert!(server.conn.should_resend_close());
    server.conn.on_close_sent();
    assert!(!server.conn.should_resend_close());

    deliver(
        &mut server,
        client_addr(),
        vec![short_packet(
            9,
            server_cid,
            vec![Frame::Close(frame::Close::Connection(
                frame::ConnectionClose {
                    error_code: TransportErrorCode::NO_ERROR,
                    frame_type: None,
                    reason: Bytes::new(),
                },
            ))],
        )],
        now,
    )
    .unwrap();
    assert!(server.conn.peer_error().is_some());
    assert_eq!(
        server.conn.spaces[SpaceId::Data].ack_state.largest_received,
        Some(9)
    );
    assert!(server.conn.should_resend_close());
}

#[test]
fn undecryptable_packets_buffer_until_capacity() {
    let mut transport = TransportConfig::default();
    transport.max_packets_to_buffer(2);
    let mut server = server_with(transport);
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();

    let undecryptable = || {
        crate::codec::CodecResult::CipherUnavailable(UndecryptablePacket {
            protection: ProtectionType::ZeroRtt,
            data: Bytes::from_static(b"sealed"),
        })
    };
    for _ in 0..2 {
        deliver(&mut server, client_addr(), vec![undecryptable()], now).unwrap();
    }
    assert_eq!(server.conn.stats().packets_buffered, 2);

    deliver(&mut server, client_addr(), vec![undecryptable()], now).unwrap();
    assert!(server
        .drops
        .lock()
        .unwrap()
        .contains(&PacketDropReason::MaxBuffered));

    let buffered = server.conn.drain_pending_zero_rtt_data();
    assert_eq!(buffered.len(), 2);
    assert_eq!(buffered[0].peer, client_addr());

    // The buffer is retired once drained
    deliver(&mut server, client_addr(), vec![undecryptable()], now).unwrap();
    assert!(server
        .drops
        .lock()
        .unwrap()
        .contains(&PacketDropReason::BufferUnavailable));
}

#[test]
fn handshake_done_queued_once_and_confirmed_by_ack() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    {
        let mut inner = server.handshake.lock().unwrap();
        inner.one_rtt_write_key = Some(test_packet_key());
        inner.client_params = Some(client_params());
        inner.done = true;
    }
    deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(1, vec![crypto_frame(12, b"finished")])],
        now,
    )
    .unwrap();
    assert!(server.conn.spaces[SpaceId::Data].pending.handshake_done);

    // The write path sends it; the queue bit clears and does not re-arm
    let packet_number = server.conn.on_packet_sent(
        SpaceId::Data,
        SentPacket {
            time_sent: now,
            size: 120,
            ack_eliciting: true,
            frames: vec![SentFrame::HandshakeDone],
        },
    );
    assert_eq!(packet_number, 0);
    assert!(!server.conn.spaces[SpaceId::Data].pending.handshake_done);
    deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(2, vec![crypto_frame(20, b"extra")])],
        now,
    )
    .unwrap();
    assert!(!server.conn.spaces[SpaceId::Data].pending.handshake_done);

    // Its acknowledgement confirms the handshake
    let server_cid = *server.conn.server_connection_id().unwrap();
    deliver(
        &mut server,
        client_addr(),
        vec![short_packet(
            1,
            server_cid,
            vec![Frame::Ack(frame::Ack {
                largest: 0,
                delay: Duration::from_millis(2),
                ranges: ArrayRangeSet::from_iter([0..1]),
                ecn: None,
            })],
        )],
        now + Duration::from_millis(30),
    )
    .unwrap();
    assert!(server.conn.handshake_confirmed);
    assert!(server.conn.rtt.has_sample());
    // Pending-packet buffers are gone after confirmation
    assert!(server.conn.drain_pending_zero_rtt_data().is_empty());
    assert!(server.conn.drain_pending_one_rtt_data().is_empty());
}

#[test]
fn ack_drives_stream_visitors_and_loss() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    {
        let mut inner = server.handshake.lock().unwrap();
        inner.one_rtt_write_key = Some(test_packet_key());
        inner.client_params = Some(client_params());
    }
    deliver(
        &mut server,
        client_addr(),
        vec![initial_packet(1, vec![crypto_frame(12, b"finished")])],
        now,
    )
    .unwrap();

    // A finished local stream whose data flies in packets 0..=4
    let id = {
        let stream = server
            .conn
            .streams_mut()
            .create_next_unidirectional_stream()
            .unwrap();
        stream.write(Bytes::from_static(b"aaaabbbb"));
        stream.finish();
        stream.id
    };
    for (range, fin) in [(0..4u64, false), (4..8, true)] {
        server.conn.on_packet_sent(
            SpaceId::Data,
            SentPacket {
                time_sent: now,
                size: 1200,
                ack_eliciting: true,
                frames: vec![SentFrame::Stream(frame::StreamMeta {
                    id,
                    offsets: range,
                    fin,
                })],
            },
        );
    }
    // Five more ack-eliciting packets so packet-threshold loss can fire
    for _ in 0..5 {
        server.conn.on_packet_sent(
            SpaceId::Data,
            SentPacket {
                time_sent: now,
                size: 1200,
                ack_eliciting: true,
                frames: vec![SentFrame::Ping { mtu_probe: false }],
            },
        );
    }

    let server_cid = *server.conn.server_connection_id().unwrap();
    // Acknowledge packets 1 and 5..=6: packet 0 has fallen more than the
    // reordering threshold behind and is declared lost
    deliver(
        &mut server,
        client_addr(),
        vec![short_packet(
            1,
            server_cid,
            vec![Frame::Ack(frame::Ack {
                largest: 6,
                delay: Duration::ZERO,
                ranges: ArrayRangeSet::from_iter([1..2, 5..7]),
                ecn: None,
            })],
        )],
        now + Duration::from_millis(20),
    )
    .unwrap();

    let stream = server.conn.streams().find_stream(id).unwrap();
    // The 0..4 frame was lost and sits in the loss buffer for retransmission
    assert!(stream.has_loss());
    assert!(server.conn.streams().has_loss());
    // The 4..8+fin frame was acked; the half is not yet closed
    assert_eq!(stream.send_state, SendState::Open);
}

#[test]
fn source_token_policies() {
    // Always reject
    let mut server = default_server();
    assert!(!server.conn.validate_and_update_source_token(vec![]));
    assert_eq!(server.conn.token_source_addresses(), &[client_addr().ip()]);
    assert_eq!(server.conn.source_token_matching(), Some(false));

    // Reject without an exact match, accept with one
    let mut transport = TransportConfig::default();
    transport
        .zero_rtt_source_token_matching_policy(ZeroRttSourceTokenMatchingPolicy::RejectIfNoExactMatch);
    let mut server = server_with(transport);
    assert!(!server
        .conn
        .validate_and_update_source_token(vec!["10.9.9.9".parse().unwrap()]));
    let mut transport = TransportConfig::default();
    transport
        .zero_rtt_source_token_matching_policy(ZeroRttSourceTokenMatchingPolicy::RejectIfNoExactMatch);
    let mut server = server_with(transport);
    assert!(server.conn.validate_and_update_source_token(vec![
        "10.9.9.9".parse().unwrap(),
        client_addr().ip(),
    ]));
    // The matched address moves to the most-recently-used end
    assert_eq!(
        server.conn.token_source_addresses().last(),
        Some(&client_addr().ip())
    );
    assert!(server.conn.writable_bytes_limit.is_none());

    // Limit mode accepts but caps writable bytes until the client Finished
    let mut transport = TransportConfig::default();
    transport
        .zero_rtt_source_token_matching_policy(ZeroRttSourceTokenMatchingPolicy::LimitIfNoExactMatch);
    let mut server = server_with(transport);
    assert!(server.conn.validate_and_update_source_token(vec![]));
    let window = 3 * crate::DEFAULT_UDP_SEND_PACKET_LEN;
    assert_eq!(server.conn.writable_bytes_limit, Some(window));

    // Each received packet extends the budget by one window
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    assert_eq!(server.conn.writable_bytes_limit, Some(2 * window));
}

#[test]
fn source_token_list_is_a_capped_fifo() {
    let mut server = default_server();
    let stale: Vec<std::net::IpAddr> = vec![
        "10.1.1.1".parse().unwrap(),
        "10.2.2.2".parse().unwrap(),
        "10.3.3.3".parse().unwrap(),
    ];
    server.conn.validate_and_update_source_token(stale);
    let kept = server.conn.token_source_addresses();
    assert_eq!(kept.len(), 3);
    // Oldest entry evicted, current peer appended
    assert_eq!(kept[0], "10.2.2.2".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(kept[2], client_addr().ip());
}

#[test]
fn connection_id_rejector_bounded_retry() {
    struct SequentialCids {
        counter: Mutex<u8>,
    }
    impl ConnectionIdGenerator for SequentialCids {
        fn generate_cid(&self) -> ConnectionId {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            ConnectionId::new(&[*counter; 8])
        }
        fn cid_len(&self) -> usize {
            8
        }
    }
    struct RejectBelow(u8);
    impl crate::cid::ConnectionIdRejector for RejectBelow {
        fn reject_cid(&self, cid: &ConnectionId) -> bool {
            cid[0] < self.0
        }
    }
    struct FixedTokens;
    impl ResetTokenFactory for FixedTokens {
        fn generate_token(&self, _cid: &ConnectionId) -> ResetToken {
            ResetToken([0; 16])
        }
    }

    let script = Arc::new(CodecScript::default());
    let config = crate::ServerConfig {
        transport: Arc::new(TransportConfig::default()),
        crypto: Arc::new(NoopCrypto),
        codec: Arc::new(TestCodecFactory {
            script: script.clone(),
        }),
        cid_generator: Arc::new(SequentialCids {
            counter: Mutex::new(0),
        }),
        cid_rejector: Some(Arc::new(RejectBelow(4))),
        reset_tokens: Arc::new(FixedTokens),
    };
    let handshake = Arc::new(Mutex::new(HandshakeInner::default()));
    let mut conn = crate::Connection::new(
        Arc::new(config),
        server_addr(),
        client_addr(),
        Box::new(TestHandshake { inner: handshake }),
        None,
        std::time::Instant::now(),
    );
    // Candidates 1..3 are vetoed; the fourth sticks
    let issued = conn.create_and_add_new_self_cid();
    assert_eq!(issued.cid[0], 4);
    assert_eq!(issued.sequence, 0);
    // Sequence numbers are monotonic
    let next = conn.create_and_add_new_self_cid();
    assert_eq!(next.sequence, 1);
}

struct NoopCrypto;

impl crate::crypto::CryptoFactory for NoopCrypto {
    fn client_initial_keys(
        &self,
        _dst_cid: &ConnectionId,
        _version: crate::Version,
    ) -> crate::crypto::Keys {
        test_keys()
    }
    fn server_initial_keys(
        &self,
        _dst_cid: &ConnectionId,
        _version: crate::Version,
    ) -> crate::crypto::Keys {
        test_keys()
    }
}

#[test]
fn largest_received_is_monotonic_across_receives() {
    let mut server = default_server();
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    for pn in [3u64, 1, 7, 5] {
        deliver(
            &mut server,
            client_addr(),
            vec![short_packet(pn, server_cid, vec![Frame::Ping])],
            now,
        )
        .unwrap();
        let largest = server.conn.spaces[SpaceId::Data]
            .ack_state
            .largest_received
            .unwrap();
        assert!(largest >= pn);
    }
    assert_eq!(
        server.conn.spaces[SpaceId::Data].ack_state.largest_received,
        Some(7)
    );
    assert_matches!(server.conn.stats().out_of_order_packets, 2);
}

#[test]
fn datagram_frames_reach_the_receive_queue() {
    let mut transport = TransportConfig::default();
    transport.datagram(crate::config::DatagramConfig {
        enabled: true,
        max_read_frame_size: 1200,
        recv_buffer_len: 4,
    });
    let mut server = server_with(transport);
    let now = server.now;
    deliver_first_flight(&mut server, vec![crypto_frame(0, b"client hello")], now).unwrap();
    let server_cid = *server.conn.server_connection_id().unwrap();
    deliver(
        &mut server,
        client_addr(),
        vec![short_packet(
            1,
            server_cid,
            vec![Frame::Datagram(frame::Datagram {
                data: Bytes::from_static(b"fire and forget"),
            })],
        )],
        now,
    )
    .unwrap();
    assert_eq!(
        server.conn.datagrams_mut().recv(),
        Some(Bytes::from_static(b"fire and forget"))
    );
}
