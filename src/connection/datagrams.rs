use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::config::DatagramConfig;

/// DATAGRAM frame state
///
/// Receives are buffered in a bounded FIFO; when the application falls
/// behind, the oldest datagram is dropped first, since datagram traffic is
/// freshest-first by nature.
pub struct Datagrams {
    /// Largest frame the peer has told us it will accept; zero until its
    /// transport parameters arrive
    pub(crate) max_write_frame_size: u64,
    pub(crate) max_read_frame_size: u64,
    pub(crate) recv_buffer: VecDeque<Bytes>,
    pub(crate) recv_buffer_len: usize,
    pub(crate) dropped: u64,
}

impl Datagrams {
    pub(crate) fn new(config: &DatagramConfig) -> Self {
        Self {
            max_write_frame_size: 0,
            max_read_frame_size: config.max_read_frame_size,
            recv_buffer: VecDeque::new(),
            recv_buffer_len: config.recv_buffer_len,
            dropped: 0,
        }
    }

    pub(crate) fn received(&mut self, data: Bytes) {
        if data.len() as u64 > self.max_read_frame_size {
            trace!(len = data.len(), "dropping oversized datagram");
            self.dropped += 1;
            return;
        }
        if self.recv_buffer.len() >= self.recv_buffer_len {
            trace!("datagram receive buffer full, dropping oldest");
            self.recv_buffer.pop_front();
            self.dropped += 1;
        }
        self.recv_buffer.push_back(data);
    }

    /// Dequeue the oldest received datagram
    pub fn recv(&mut self) -> Option<Bytes> {
        self.recv_buffer.pop_front()
    }

    /// Largest datagram payload the peer accepts, if it accepts any
    pub fn max_write_size(&self) -> Option<u64> {
        (self.max_write_frame_size > 0).then_some(self.max_write_frame_size)
    }

    /// Datagrams discarded due to overflow or oversize
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagrams(cap: usize) -> Datagrams {
        Datagrams::new(&DatagramConfig {
            enabled: true,
            max_read_frame_size: 16,
            recv_buffer_len: cap,
        })
    }

    #[test]
    fn fifo_order() {
        let mut state = datagrams(4);
        state.received(Bytes::from_static(b"one"));
        state.received(Bytes::from_static(b"two"));
        assert_eq!(state.recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(state.recv().unwrap(), Bytes::from_static(b"two"));
        assert!(state.recv().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut state = datagrams(2);
        state.received(Bytes::from_static(b"a"));
        state.received(Bytes::from_static(b"b"));
        state.received(Bytes::from_static(b"c"));
        assert_eq!(state.dropped(), 1);
        assert_eq!(state.recv().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(state.recv().unwrap(), Bytes::from_static(b"c"));
    }

    #[test]
    fn oversize_rejected() {
        let mut state = datagrams(2);
        state.received(Bytes::from_static(b"this datagram is too large...."));
        assert_eq!(state.dropped(), 1);
        assert!(state.recv().is_none());
    }
}
