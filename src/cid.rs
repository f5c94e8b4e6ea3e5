//! Connection ID plumbing: the ID type itself, the pluggable generation and
//! rejection interfaces used when choosing server IDs, and stateless reset
//! token issuance.

use std::{fmt, ops};

use rand::RngCore;

/// Maximum number of bytes in a connection ID
pub const MAX_CID_SIZE: usize = 20;

/// Length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;

/// Protocol-level identifier for a connection
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    ///
    /// # Panics
    /// - if `bytes.len() > MAX_CID_SIZE`
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Token sent to the peer that lets it signal a reset of this connection
/// without per-connection state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetToken(pub [u8; RESET_TOKEN_SIZE]);

impl ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// Generates server-chosen connection IDs
///
/// Deployments that encode routing information into IDs supply their own
/// implementation; [`RandomConnectionIdGenerator`] is the plain default.
pub trait ConnectionIdGenerator: Send + Sync {
    /// Generate a new CID
    fn generate_cid(&self) -> ConnectionId;
    /// Returns the length of a CID for connections created by this generator
    fn cid_len(&self) -> usize;
}

/// Vetoes candidate connection IDs, e.g. ones that would collide with
/// routing state elsewhere in the fleet
pub trait ConnectionIdRejector: Send + Sync {
    fn reject_cid(&self, cid: &ConnectionId) -> bool;
}

/// Generates purely random connection IDs of a given length
#[derive(Debug, Copy, Clone)]
pub struct RandomConnectionIdGenerator {
    cid_len: usize,
}

impl Default for RandomConnectionIdGenerator {
    fn default() -> Self {
        Self { cid_len: 8 }
    }
}

impl RandomConnectionIdGenerator {
    /// Initialize Random CID generator with a fixed CID length
    ///
    /// The given length must not be larger than `MAX_CID_SIZE`.
    pub fn new(cid_len: usize) -> Self {
        debug_assert!(cid_len <= MAX_CID_SIZE);
        Self { cid_len }
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate_cid(&self) -> ConnectionId {
        let mut bytes_arr = [0; MAX_CID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes_arr[..self.cid_len]);
        ConnectionId::new(&bytes_arr[..self.cid_len])
    }

    fn cid_len(&self) -> usize {
        self.cid_len
    }
}

/// Derives stateless reset tokens for self-issued connection IDs
///
/// Implementations key the derivation on a static secret and the server's
/// own address so that any instance behind the same address can reproduce
/// the token from the CID alone.
pub trait ResetTokenFactory: Send + Sync {
    fn generate_token(&self, cid: &ConnectionId) -> ResetToken;
}

/// A connection ID issued by this endpoint, with its sequence number and the
/// reset token advertised alongside it
#[derive(Debug, Clone)]
pub struct IssuedCid {
    pub cid: ConnectionId,
    pub sequence: u64,
    pub reset_token: ResetToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_round_trip() {
        let cid = ConnectionId::new(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(cid.len(), 8);
        assert_eq!(&cid[..], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(format!("{cid}"), "0001020304050607");
    }

    #[test]
    fn random_generator_respects_len() {
        let generator = RandomConnectionIdGenerator::new(10);
        let cid = generator.generate_cid();
        assert_eq!(cid.len(), 10);
        assert_eq!(generator.cid_len(), 10);
    }
}
