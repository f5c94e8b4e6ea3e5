use std::{
    collections::{BTreeMap, VecDeque},
    ops::{Index, IndexMut, Range},
    time::Instant,
};

use bytes::Bytes;
use tracing::trace;

use super::{assembler::Assembler, PendingEvents};
use crate::{
    codec::SpaceId,
    config::TransportConfig,
    frame,
    range_set::{ArrayRangeSet, RangeSet},
    StreamId,
};

/// Ack-elicitation threshold applied while only non-eliciting packets have
/// arrived since the last ACK
const NON_RX_PACKETS_BEFORE_ACK: u16 = 20;

/// Ack ranges retained per space; bounds the encoded size of one ACK frame
const MAX_ACK_RANGES: usize = 64;

/// Packet reordering tolerated before an outstanding packet below the
/// largest acknowledged is declared lost
const REORDERING_THRESHOLD: u64 = 3;

/// Receive-side tracking and ACK scheduling for one packet-number space
#[derive(Debug)]
pub struct AckState {
    /// Number the next outgoing packet in this space will carry
    pub next_packet_number: u64,
    /// Received packet numbers not yet retired by an acknowledged ACK
    pub acks: RangeSet,
    pub largest_received: Option<u64>,
    pub largest_received_time: Option<Instant>,
    /// Largest received at the time our most recent close was sent; used to
    /// suppress echoing a close for every incoming packet
    pub largest_received_at_last_close_sent: Option<u64>,
    /// Ack-eliciting packets received since the last ACK left
    pub num_rx_packets_recvd: u16,
    /// Other packets received since the last ACK left
    pub num_non_rx_packets_recvd: u16,
    pub needs_to_send_ack_immediately: bool,
    /// Explicit threshold override, e.g. from an ack-frequency extension
    pub tolerance: Option<u16>,
    /// Suppress the out-of-order trigger, leaving only thresholds and crypto
    pub ignore_reorder: bool,
    pub largest_ack_scheduled: Option<u64>,
}

impl AckState {
    fn new() -> Self {
        Self {
            next_packet_number: 0,
            acks: RangeSet::new(),
            largest_received: None,
            largest_received_time: None,
            largest_received_at_last_close_sent: None,
            num_rx_packets_recvd: 0,
            num_non_rx_packets_recvd: 0,
            needs_to_send_ack_immediately: false,
            tolerance: None,
            ignore_reorder: false,
            largest_ack_scheduled: None,
        }
    }

    /// Record receipt of packet number `pn`
    ///
    /// Returns whether the packet arrived out of order. The receive time is
    /// only retained for the largest packet seen so far, which is the one an
    /// ACK frame reports a delay for.
    pub(crate) fn on_packet_number_received(&mut self, pn: u64, receive_time: Instant) -> bool {
        let out_of_order = self.largest_received.map_or(false, |largest| pn < largest);
        if self.largest_received.map_or(true, |largest| pn > largest) {
            self.largest_received = Some(pn);
            self.largest_received_time = Some(receive_time);
        }
        self.acks.insert_one(pn);
        while self.acks.len() > MAX_ACK_RANGES {
            self.acks.pop_min();
        }
        out_of_order
    }

    /// Advance the ACK scheduling state for a processed packet
    ///
    /// Crypto data, reordering, and the receive-count thresholds force an
    /// immediate ACK; anything else ack-eliciting arms the coalescing
    /// timeout.
    pub(crate) fn on_packet_processed(
        &mut self,
        config: &TransportConfig,
        pending: &mut PendingEvents,
        mut out_of_order: bool,
        ack_eliciting: bool,
        has_crypto: bool,
    ) {
        debug_assert!(!has_crypto || ack_eliciting);
        let mut thresh = u64::from(NON_RX_PACKETS_BEFORE_ACK);
        if ack_eliciting || self.num_rx_packets_recvd > 0 {
            thresh = match self.tolerance {
                Some(tolerance) => u64::from(tolerance),
                None => {
                    if self.largest_received.unwrap_or(0)
                        > config.rx_packets_before_ack_init_threshold
                    {
                        u64::from(config.rx_packets_before_ack_after_init)
                    } else {
                        u64::from(config.rx_packets_before_ack_before_init)
                    }
                }
            };
        }
        if self.ignore_reorder {
            out_of_order = false;
        }
        if ack_eliciting {
            self.num_rx_packets_recvd = self.num_rx_packets_recvd.saturating_add(1);
            let combined =
                u64::from(self.num_rx_packets_recvd) + u64::from(self.num_non_rx_packets_recvd);
            if has_crypto || out_of_order || combined >= thresh {
                trace!(
                    has_crypto,
                    out_of_order,
                    combined,
                    thresh,
                    "ack immediately"
                );
                pending.schedule_ack_timeout = false;
                self.needs_to_send_ack_immediately = true;
            } else if !self.needs_to_send_ack_immediately {
                trace!(combined, thresh, "scheduling ack timeout");
                pending.schedule_ack_timeout = true;
            }
        } else {
            self.num_non_rx_packets_recvd = self.num_non_rx_packets_recvd.saturating_add(1);
            let combined =
                u64::from(self.num_rx_packets_recvd) + u64::from(self.num_non_rx_packets_recvd);
            if combined >= thresh {
                trace!(combined, thresh, "ack immediately, non-eliciting threshold");
                pending.schedule_ack_timeout = false;
                self.needs_to_send_ack_immediately = true;
            }
        }
        if self.needs_to_send_ack_immediately {
            self.num_rx_packets_recvd = 0;
            self.num_non_rx_packets_recvd = 0;
        }
    }

    /// The coalescing timeout fired; force the next write to carry an ACK
    pub(crate) fn on_ack_timeout(&mut self, pending: &mut PendingEvents) {
        trace!("ack immediately due to ack timeout");
        self.needs_to_send_ack_immediately = true;
        self.num_rx_packets_recvd = 0;
        self.num_non_rx_packets_recvd = 0;
        pending.schedule_ack_timeout = false;
    }

    /// A packet carrying an ACK frame was transmitted
    ///
    /// We assume all current ack ranges fit in a single frame, so both the
    /// immediate latch and the counters reset here; if that assumption ever
    /// failed the peer would retransmit whatever went unacknowledged.
    pub(crate) fn on_sent_packet_with_acks(
        &mut self,
        pending: &mut PendingEvents,
        largest_ack_scheduled: u64,
    ) {
        trace!("unset ack immediately due to sending packet with acks");
        pending.schedule_ack_timeout = false;
        self.needs_to_send_ack_immediately = false;
        self.num_rx_packets_recvd = 0;
        self.num_non_rx_packets_recvd = 0;
        self.largest_ack_scheduled = Some(largest_ack_scheduled);
    }
}

/// Retransmittable data queued in one space for the write path
#[derive(Debug, Default)]
pub struct Retransmits {
    /// Lost crypto-stream ranges
    pub crypto: VecDeque<Range<u64>>,
    pub ping: bool,
    /// Only ever set in the application data space
    pub handshake_done: bool,
}

/// Metadata retained for a transmitted packet until it is acknowledged or
/// declared lost
#[derive(Debug)]
pub struct SentPacket {
    pub time_sent: Instant,
    /// Bytes on the wire, QUIC framing included, UDP/IP excluded
    pub size: u16,
    pub ack_eliciting: bool,
    /// What the packet carried, for the per-frame acknowledgement visitors
    pub frames: Vec<SentFrame>,
}

/// Frames whose acknowledgement or loss has side effects
#[derive(Debug, Clone)]
pub enum SentFrame {
    Stream(frame::StreamMeta),
    Crypto { offsets: Range<u64> },
    ResetStream(StreamId),
    /// An ACK frame; its ranges are retired from the receive set when it is
    /// itself acknowledged
    Ack { ranges: ArrayRangeSet },
    Ping { mtu_probe: bool },
    HandshakeDone,
    Datagram,
}

/// One packet-number space
pub struct PacketSpace {
    pub ack_state: AckState,
    pub sent_packets: BTreeMap<u64, SentPacket>,
    /// Incoming cryptographic handshake stream at this level
    pub crypto_stream: CryptoStream,
    pub pending: Retransmits,
    /// Earliest time at which a remaining outstanding packet in this space
    /// may be declared lost by time threshold
    pub loss_time: Option<Instant>,
}

impl PacketSpace {
    fn new() -> Self {
        Self {
            ack_state: AckState::new(),
            sent_packets: BTreeMap::new(),
            crypto_stream: CryptoStream::default(),
            pending: Retransmits::default(),
            loss_time: None,
        }
    }

    /// Remove and return packets now considered lost by packet threshold
    pub(crate) fn detect_lost_packets(&mut self, largest_acked: u64) -> Vec<(u64, SentPacket)> {
        let cutoff = largest_acked.saturating_sub(REORDERING_THRESHOLD);
        let numbers: Vec<u64> = self.sent_packets.range(..cutoff).map(|(&pn, _)| pn).collect();
        numbers
            .into_iter()
            .map(|pn| (pn, self.sent_packets.remove(&pn).unwrap()))
            .collect()
    }
}

/// The triplet of packet-number spaces
pub struct PacketSpaces {
    spaces: [PacketSpace; 3],
}

impl PacketSpaces {
    pub(crate) fn new() -> Self {
        Self {
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
        }
    }

    /// Largest received packet number per space, in the shape the codec
    /// wants for packet number decoding
    pub(crate) fn largest_received(&self) -> [Option<u64>; 3] {
        [
            self.spaces[0].ack_state.largest_received,
            self.spaces[1].ack_state.largest_received,
            self.spaces[2].ack_state.largest_received,
        ]
    }

    pub(crate) fn has_received_packets(&self) -> bool {
        self.spaces
            .iter()
            .any(|space| space.ack_state.largest_received.is_some())
    }

    /// Whether nothing new has arrived since our last close went out
    ///
    /// Used to suppress retransmitting CONNECTION_CLOSE for every incoming
    /// packet.
    pub(crate) fn has_not_received_new_packets_since_last_close_sent(&self) -> bool {
        self.spaces.iter().all(|space| {
            space.ack_state.largest_received_at_last_close_sent
                == space.ack_state.largest_received
        })
    }

    pub(crate) fn update_largest_received_at_last_close_sent(&mut self) {
        for space in &mut self.spaces {
            space.ack_state.largest_received_at_last_close_sent =
                space.ack_state.largest_received;
        }
    }
}

impl Index<SpaceId> for PacketSpaces {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.spaces[space as usize]
    }
}

impl IndexMut<SpaceId> for PacketSpaces {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.spaces[space as usize]
    }
}

/// The cryptographic handshake stream at one encryption level
#[derive(Default)]
pub struct CryptoStream {
    /// Reassembly of the peer's crypto stream
    pub(crate) assembler: Assembler,
    /// Offsets of our own crypto data in flight
    pub unacked: RangeSet,
    /// Offset of the next crypto byte the write path will send
    pub write_offset: u64,
}

impl CryptoStream {
    /// Queue received crypto bytes for in-order delivery
    pub(crate) fn received(&mut self, offset: u64, data: Bytes) {
        self.assembler.insert(offset, data);
    }

    /// Pull the next contiguous run of received crypto bytes, if any
    pub(crate) fn read_to_deliver(&mut self) -> Option<Bytes> {
        self.assembler.read()
    }

    pub(crate) fn on_data_sent(&mut self, offsets: Range<u64>) {
        self.write_offset = self.write_offset.max(offsets.end);
        self.unacked.insert(offsets);
    }

    pub(crate) fn on_ack(&mut self, offsets: Range<u64>) {
        self.unacked.remove(offsets);
    }

    /// Treat all in-flight data at this level as delivered
    ///
    /// Invoked when keys for a higher level arrive, which proves the peer
    /// processed everything we sent at this one.
    pub(crate) fn implicitly_ack(&mut self, pending: &mut Retransmits) {
        self.unacked = RangeSet::new();
        pending.crypto.clear();
    }
}
