//! Interface to the TLS handshake engine
//!
//! The engine consumes contiguous crypto-stream bytes and exposes key
//! material and the client's transport parameters as they become derivable.
//! Every getter transfers ownership at most once: the engine returns `Some`
//! the first time a secret is available and `None` thereafter, which lets
//! the connection poll after every packet without bookkeeping on this side
//! of the boundary.

use bytes::Bytes;

use crate::{
    codec::EncryptionLevel,
    crypto::{HeaderKey, Keys, PacketKey},
    transport_parameters::{ClientTransportParameters, ServerTransportParameters},
    TransportError,
};

pub trait Handshake: Send {
    /// Start the handshake, handing over the parameters this server will
    /// advertise to the client
    fn accept(&mut self, params: ServerTransportParameters);

    /// Feed newly contiguous crypto-stream bytes received at `level`
    ///
    /// Errors surface as CRYPTO_ERROR on the wire.
    fn read_handshake(&mut self, data: Bytes, level: EncryptionLevel) -> Result<(), TransportError>;

    /// Available once the client hello has been processed and its early data
    /// has been accepted
    fn zero_rtt_read_keys(&mut self) -> Option<Keys>;

    /// Available together with the handshake read key
    fn handshake_read_keys(&mut self) -> Option<Keys>;

    /// Available once the client hello has been processed, but only released
    /// early when zero-RTT was accepted; otherwise released with the
    /// client Finished
    fn one_rtt_write_key(&mut self) -> Option<Box<dyn PacketKey>>;
    fn one_rtt_write_header_key(&mut self) -> Option<Box<dyn HeaderKey>>;

    /// Available once the client Finished has been processed
    fn one_rtt_read_key(&mut self) -> Option<Box<dyn PacketKey>>;
    fn one_rtt_read_header_key(&mut self) -> Option<Box<dyn HeaderKey>>;

    /// The transport parameters the client advertised in its hello
    ///
    /// Must be present by the time the 1-RTT write key is released.
    fn client_transport_parameters(&mut self) -> Option<ClientTransportParameters>;

    /// Whether the handshake has completed
    fn is_done(&self) -> bool;
}
