//! Interfaces for the cryptographic material this crate holds but never uses
//! directly
//!
//! Payload protection and header protection happen inside the wire codec and
//! the write path. The connection core is only responsible for *owning* the
//! key objects, installing them at the right epoch exactly once, and
//! discarding them when a packet-number space ends.

use crate::{cid::ConnectionId, Version};

/// Keys for protecting or unprotecting packet payloads at some epoch
pub trait PacketKey: Send {
    /// Length of the authentication tag appended to every protected payload
    fn tag_len(&self) -> usize;
}

/// Keys for QUIC header protection at some epoch
pub trait HeaderKey: Send {
    /// Number of ciphertext bytes sampled when masking a header
    fn sample_size(&self) -> usize;
}

/// A matched pair of payload and header keys for one direction of one epoch
pub struct Keys {
    pub packet: Box<dyn PacketKey>,
    pub header: Box<dyn HeaderKey>,
}

/// Derives the version-specific Initial secrets
///
/// Both directions of the Initial epoch are a pure function of the client's
/// original destination connection ID and the negotiated version.
pub trait CryptoFactory: Send + Sync {
    /// Keys for reading the client's Initial packets
    fn client_initial_keys(&self, dst_cid: &ConnectionId, version: Version) -> Keys;
    /// Keys for writing this server's Initial packets
    fn server_initial_keys(&self, dst_cid: &ConnectionId, version: Version) -> Keys;
}
