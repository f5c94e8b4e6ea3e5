//! QUIC transport parameters
//!
//! The handshake engine carries these opaquely in the TLS extension; this
//! module owns their structured form. Client parameters arrive as raw
//! (id, value) entries and are validated and applied by the connection;
//! server parameters are assembled from configuration and handed to the
//! engine when the connection accepts.

use std::time::Duration;

use bytes::Bytes;

use crate::{
    cid::{ConnectionId, ResetToken, MAX_CID_SIZE},
    TransportError, VarInt,
};

/// Parameter IDs the server reads or writes
///
/// The D6D entries are a private-use extension negotiated with clients that
/// support peer-driven path MTU discovery.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u64)]
pub enum TransportParameterId {
    OriginalDestinationConnectionId = 0x00,
    MaxIdleTimeout = 0x01,
    StatelessResetToken = 0x02,
    MaxUdpPayloadSize = 0x03,
    InitialMaxData = 0x04,
    InitialMaxStreamDataBidiLocal = 0x05,
    InitialMaxStreamDataBidiRemote = 0x06,
    InitialMaxStreamDataUni = 0x07,
    InitialMaxStreamsBidi = 0x08,
    InitialMaxStreamsUni = 0x09,
    AckDelayExponent = 0x0a,
    MaxAckDelay = 0x0b,
    DisableActiveMigration = 0x0c,
    PreferredAddress = 0x0d,
    ActiveConnectionIdLimit = 0x0e,
    InitialSourceConnectionId = 0x0f,
    RetrySourceConnectionId = 0x10,
    MaxDatagramFrameSize = 0x20,
    MinAckDelay = 0xde1a,
    D6dBasePmtu = 0xd6d0,
    D6dRaiseTimeout = 0xd6d1,
    D6dProbeTimeout = 0xd6d2,
}

/// One raw transport parameter entry
#[derive(Debug, Clone)]
pub struct TransportParameter {
    pub id: u64,
    pub value: Bytes,
}

impl TransportParameter {
    /// A parameter whose value is a single variable-length integer
    pub fn integer(id: TransportParameterId, value: u64) -> Self {
        let mut buf = Vec::with_capacity(8);
        VarInt::from_u64(value)
            .unwrap_or(VarInt::MAX)
            .encode(&mut buf);
        Self {
            id: id as u64,
            value: buf.into(),
        }
    }
}

/// The parameter set advertised by the client in its hello
#[derive(Debug, Clone, Default)]
pub struct ClientTransportParameters {
    pub parameters: Vec<TransportParameter>,
}

impl ClientTransportParameters {
    /// Decode the integer parameter `id`, if present
    ///
    /// A present entry that does not decode as exactly one varint is a
    /// TRANSPORT_PARAMETER_ERROR.
    pub fn get_integer(
        &self,
        id: TransportParameterId,
    ) -> Result<Option<u64>, TransportError> {
        let param = match self.find(id) {
            Some(x) => x,
            None => return Ok(None),
        };
        let mut buf = &param.value[..];
        let value = VarInt::decode(&mut buf)
            .ok_or_else(|| TransportError::TRANSPORT_PARAMETER_ERROR("malformed integer parameter"))?;
        if !buf.is_empty() {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "trailing bytes in integer parameter",
            ));
        }
        Ok(Some(value.into_inner()))
    }

    /// Read the parameter `id` as a connection ID, if present and well-formed
    pub fn get_connection_id(&self, id: TransportParameterId) -> Option<ConnectionId> {
        let param = self.find(id)?;
        if param.value.len() > MAX_CID_SIZE {
            return None;
        }
        Some(ConnectionId::new(&param.value))
    }

    fn find(&self, id: TransportParameterId) -> Option<&TransportParameter> {
        self.parameters.iter().find(|p| p.id == id as u64)
    }
}

/// The parameter set this server advertises
///
/// Assembled from configuration when the first Initial is accepted and
/// handed to the handshake engine for encoding into the TLS extension.
#[derive(Debug, Clone)]
pub struct ServerTransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout: Duration,
    pub ack_delay_exponent: u8,
    pub max_udp_payload_size: u64,
    pub stateless_reset_token: ResetToken,
    pub initial_source_connection_id: ConnectionId,
    pub original_destination_connection_id: ConnectionId,
    /// Extension parameters, e.g. `max_datagram_frame_size` when datagram
    /// support is enabled
    pub extra: Vec<TransportParameter>,
}

impl ServerTransportParameters {
    /// Materialize the raw entries in the form the handshake engine encodes
    pub fn encode(&self) -> Vec<TransportParameter> {
        let mut params = vec![
            TransportParameter::integer(TransportParameterId::InitialMaxData, self.initial_max_data),
            TransportParameter::integer(
                TransportParameterId::InitialMaxStreamDataBidiLocal,
                self.initial_max_stream_data_bidi_local,
            ),
            TransportParameter::integer(
                TransportParameterId::InitialMaxStreamDataBidiRemote,
                self.initial_max_stream_data_bidi_remote,
            ),
            TransportParameter::integer(
                TransportParameterId::InitialMaxStreamDataUni,
                self.initial_max_stream_data_uni,
            ),
            TransportParameter::integer(
                TransportParameterId::InitialMaxStreamsBidi,
                self.initial_max_streams_bidi,
            ),
            TransportParameter::integer(
                TransportParameterId::InitialMaxStreamsUni,
                self.initial_max_streams_uni,
            ),
            TransportParameter::integer(
                TransportParameterId::MaxIdleTimeout,
                self.max_idle_timeout.as_millis() as u64,
            ),
            TransportParameter::integer(
                TransportParameterId::AckDelayExponent,
                u64::from(self.ack_delay_exponent),
            ),
            TransportParameter::integer(
                TransportParameterId::MaxUdpPayloadSize,
                self.max_udp_payload_size,
            ),
            TransportParameter {
                id: TransportParameterId::StatelessResetToken as u64,
                value: Bytes::copy_from_slice(&self.stateless_reset_token),
            },
            TransportParameter {
                id: TransportParameterId::InitialSourceConnectionId as u64,
                value: Bytes::copy_from_slice(&self.initial_source_connection_id),
            },
            TransportParameter {
                id: TransportParameterId::OriginalDestinationConnectionId as u64,
                value: Bytes::copy_from_slice(&self.original_destination_connection_id),
            },
        ];
        params.extend(self.extra.iter().cloned());
        params
    }
}
