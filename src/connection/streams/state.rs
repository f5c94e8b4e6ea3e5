use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::Priority;
use crate::{connection::assembler::Assembler, frame, StreamId, TransportError, VarInt};

/// Send-half state machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    Open,
    /// RESET_STREAM sent, waiting for its acknowledgement
    ResetSent,
    Closed,
    /// Half does not exist for this stream's directionality
    Invalid,
}

/// Receive-half state machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    Open,
    Closed,
    /// Half does not exist for this stream's directionality
    Invalid,
}

/// A chunk of outgoing stream data, positioned by offset
#[derive(Debug)]
pub struct StreamBuffer {
    pub data: Bytes,
    pub offset: u64,
    pub eof: bool,
}

/// A buffer representation without the actual data, for streams whose
/// payload is assembled by a downstream offload path
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct WriteBufferMeta {
    pub length: u64,
    /// Zero until the first append; real data always precedes meta bytes
    pub offset: u64,
    pub eof: bool,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct StreamFlowControl {
    /// Receive window size used when issuing window updates
    pub window_size: u64,
    /// Largest receive offset we have advertised to the peer
    pub advertised_max_offset: u64,
    /// Largest send offset the peer currently permits
    pub peer_advertised_max_offset: u64,
    /// When we last sent a window update for this stream
    pub time_of_last_flow_control_update: Option<Instant>,
}

/// Everything the connection tracks for one stream
///
/// State records are allocated lazily: a stream can be a member of the open
/// set with no record yet, and operations construct the record on first
/// touch.
#[derive(Debug)]
pub struct StreamState {
    pub id: StreamId,
    pub send_state: SendState,
    pub recv_state: RecvState,

    // Receive half
    pub(crate) read_buffer: Assembler,
    pub max_offset_observed: u64,
    pub final_read_offset: Option<u64>,

    // Send half
    pub(crate) write_buffer: VecDeque<Bytes>,
    pub(crate) write_buffer_len: u64,
    /// Offset of the next byte the write path will transmit; one past the
    /// FIN offset once FIN has been sent
    pub current_write_offset: u64,
    pub final_write_offset: Option<u64>,
    /// Sent and unacknowledged data, keyed by starting offset
    pub(crate) retransmission_buffer: BTreeMap<u64, StreamBuffer>,
    /// Data declared lost, awaiting retransmission; ordered by offset
    pub(crate) loss_buffer: VecDeque<StreamBuffer>,

    // Offloaded writes
    pub write_buf_meta: WriteBufferMeta,
    pub(crate) loss_buf_metas: VecDeque<WriteBufferMeta>,
    /// Whether an offload sender is attached to this stream
    pub dsr: bool,

    pub flow_control: StreamFlowControl,

    /// Error observed on the receive half, from RESET_STREAM
    pub read_error: Option<VarInt>,
    /// Error applied to the send half, from reset or STOP_SENDING
    pub write_error: Option<VarInt>,

    /// Marked by the application as out-of-band signalling; excluded from
    /// app-idle accounting
    pub is_control: bool,

    /// Set while the stream is head-of-line blocked
    pub(crate) last_holb_time: Option<Instant>,
    pub total_holb_time: Duration,
    /// Times the stream has entered the blocked state
    pub holb_count: u32,

    pub priority: Priority,
}

impl StreamState {
    pub(crate) fn new(id: StreamId, recv_window: u64, peer_max_offset: u64) -> Self {
        Self {
            id,
            send_state: SendState::Open,
            recv_state: RecvState::Open,
            read_buffer: Assembler::default(),
            max_offset_observed: 0,
            final_read_offset: None,
            write_buffer: VecDeque::new(),
            write_buffer_len: 0,
            current_write_offset: 0,
            final_write_offset: None,
            retransmission_buffer: BTreeMap::new(),
            loss_buffer: VecDeque::new(),
            write_buf_meta: WriteBufferMeta::default(),
            loss_buf_metas: VecDeque::new(),
            dsr: false,
            flow_control: StreamFlowControl {
                window_size: recv_window,
                advertised_max_offset: recv_window,
                peer_advertised_max_offset: peer_max_offset,
                time_of_last_flow_control_update: None,
            },
            read_error: None,
            write_error: None,
            is_control: false,
            last_holb_time: None,
            total_holb_time: Duration::ZERO,
            holb_count: 0,
            priority: Priority::default(),
        }
    }

    /// Returns true if both halves are in a terminal state
    pub fn in_terminal_states(&self) -> bool {
        let send_terminal =
            self.send_state == SendState::Closed || self.send_state == SendState::Invalid;
        let recv_terminal =
            self.recv_state == RecvState::Closed || self.recv_state == RecvState::Invalid;
        send_terminal && recv_terminal
    }

    //
    // Receive half
    //

    /// Ingest a STREAM frame
    ///
    /// Returns the number of previously unseen bytes, for connection-level
    /// flow control accounting. Data for a closed half is silently ignored.
    pub(crate) fn receive(&mut self, stream: frame::Stream) -> Result<u64, TransportError> {
        if self.recv_state != RecvState::Open {
            trace!(stream = %self.id, "dropping frame for closed receive half");
            return Ok(0);
        }
        let end = stream.offset + stream.data.len() as u64;
        if end > self.flow_control.advertised_max_offset {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "stream data beyond advertised window",
            ));
        }
        if let Some(final_offset) = self.final_read_offset {
            if end > final_offset || (stream.fin && end != final_offset) {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "stream data beyond final size",
                ));
            }
        }
        if stream.fin {
            if self.max_offset_observed > end {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "final size below data already received",
                ));
            }
            self.final_read_offset = Some(end);
        }
        let new_bytes = end.saturating_sub(self.max_offset_observed);
        self.max_offset_observed = self.max_offset_observed.max(end);
        if !stream.data.is_empty() {
            self.read_buffer.insert(stream.offset, stream.data);
        }
        Ok(new_bytes)
    }

    /// Ingest a RESET_STREAM frame
    ///
    /// Returns the flow-control delta: final-size bytes we had not yet seen.
    pub(crate) fn receive_reset(
        &mut self,
        reset: frame::ResetStream,
    ) -> Result<u64, TransportError> {
        if self.recv_state != RecvState::Open {
            return Ok(0);
        }
        if reset.final_size < self.max_offset_observed {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "reset final size below data already received",
            ));
        }
        if let Some(final_offset) = self.final_read_offset {
            if reset.final_size != final_offset {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "reset final size conflicts with FIN",
                ));
            }
        }
        let new_bytes = reset.final_size - self.max_offset_observed;
        self.max_offset_observed = reset.final_size;
        self.final_read_offset = Some(reset.final_size);
        self.read_error = Some(reset.error_code);
        self.recv_state = RecvState::Closed;
        Ok(new_bytes)
    }

    /// Pull the next contiguous chunk of received data
    ///
    /// The second element reports whether the stream's final offset has now
    /// been fully consumed, which closes the receive half.
    pub fn read(&mut self) -> Option<(Bytes, bool)> {
        let data = self.read_buffer.read()?;
        let fin = self.final_read_offset == Some(self.read_buffer.bytes_read());
        if fin {
            self.recv_state = RecvState::Closed;
        }
        Some((data, fin))
    }

    /// Offset of the next byte the application will read
    pub fn current_read_offset(&self) -> u64 {
        self.read_buffer.bytes_read()
    }

    pub fn has_readable_data(&self) -> bool {
        self.read_buffer.first_offset() == Some(self.read_buffer.bytes_read())
            || (self.final_read_offset == Some(self.read_buffer.bytes_read())
                && self.recv_state == RecvState::Open)
    }

    pub fn has_peekable_data(&self) -> bool {
        !self.read_buffer.is_empty()
    }

    /// Window update to advertise, once the peer has consumed half the window
    pub fn next_window_update(&self) -> Option<u64> {
        if self.recv_state != RecvState::Open {
            return None;
        }
        let consumed = self
            .flow_control
            .advertised_max_offset
            .saturating_sub(self.read_buffer.bytes_read());
        (consumed < self.flow_control.window_size / 2)
            .then(|| self.read_buffer.bytes_read() + self.flow_control.window_size)
    }

    pub fn on_window_update_sent(&mut self, new_max: u64, now: Instant) {
        self.flow_control.advertised_max_offset = new_max;
        self.flow_control.time_of_last_flow_control_update = Some(now);
    }

    //
    // Send half
    //

    /// Queue application data for transmission
    pub fn write(&mut self, data: Bytes) {
        debug_assert_eq!(self.send_state, SendState::Open);
        debug_assert!(self.final_write_offset.is_none());
        self.write_buffer_len += data.len() as u64;
        self.write_buffer.push_back(data);
    }

    /// No more data will be written; FIN goes out after the buffered bytes
    pub fn finish(&mut self) {
        debug_assert!(self.final_write_offset.is_none());
        self.final_write_offset = Some(self.current_write_offset + self.write_buffer_len);
    }

    pub fn writable(&self) -> bool {
        self.send_state == SendState::Open && self.final_write_offset.is_none()
    }

    /// Whether a regular (non-offloaded) write could produce a frame
    pub fn has_writable_data(&self) -> bool {
        if !self.write_buffer.is_empty() {
            return self.flow_control.peer_advertised_max_offset > self.current_write_offset;
        }
        if let Some(final_offset) = self.final_write_offset {
            // A FIN-only frame, held back while offloaded bytes remain
            return self.write_buf_meta.length == 0
                && self.current_write_offset <= final_offset
                && self.write_buf_meta.offset <= final_offset;
        }
        false
    }

    pub fn has_writable_buf_meta(&self) -> bool {
        if self.write_buf_meta.offset == 0 {
            return false;
        }
        if self.write_buf_meta.length > 0 {
            return self.flow_control.peer_advertised_max_offset > self.write_buf_meta.offset;
        }
        if let Some(final_offset) = self.final_write_offset {
            return self.write_buf_meta.offset <= final_offset;
        }
        false
    }

    pub fn has_loss(&self) -> bool {
        !self.loss_buffer.is_empty()
    }

    pub fn has_dsr_loss(&self) -> bool {
        !self.loss_buf_metas.is_empty()
    }

    pub fn should_send_flow_control(&self) -> bool {
        self.recv_state == RecvState::Open
    }

    /// The write path transmitted `meta`; move its bytes from the write
    /// buffer into the retransmission buffer
    pub(crate) fn on_sent(&mut self, meta: &frame::StreamMeta) {
        debug_assert_eq!(meta.offsets.start, self.current_write_offset);
        let len = meta.offsets.end - meta.offsets.start;
        let mut collected = BytesMut::with_capacity(len as usize);
        let mut remaining = len as usize;
        while remaining > 0 {
            let front = self
                .write_buffer
                .front_mut()
                .expect("sent data not present in write buffer");
            if front.len() <= remaining {
                remaining -= front.len();
                collected.extend_from_slice(front);
                self.write_buffer.pop_front();
            } else {
                collected.extend_from_slice(&front.split_to(remaining));
                remaining = 0;
            }
        }
        self.write_buffer_len -= len;
        if len > 0 || meta.fin {
            self.retransmission_buffer.insert(
                meta.offsets.start,
                StreamBuffer {
                    data: collected.freeze(),
                    offset: meta.offsets.start,
                    eof: meta.fin,
                },
            );
        }
        self.current_write_offset = if meta.fin {
            meta.offsets.end + 1
        } else {
            meta.offsets.end
        };
    }

    /// A STREAM frame we sent was acknowledged
    ///
    /// Returns whether the send half has now fully closed.
    pub(crate) fn on_frame_acked(&mut self, meta: &frame::StreamMeta) -> bool {
        self.retransmission_buffer.remove(&meta.offsets.start);
        // Data lost and retransmitted under a different offset key may still
        // be covered by this ack; the loss buffer is purged lazily by the
        // write path, so only the terminal condition matters here.
        if self.send_state == SendState::Open
            && self.all_data_sent()
            && self.retransmission_buffer.is_empty()
            && self.loss_buffer.is_empty()
            && self.loss_buf_metas.is_empty()
        {
            self.send_state = SendState::Closed;
            return true;
        }
        false
    }

    /// A STREAM frame we sent was declared lost; queue its bytes for
    /// retransmission
    pub(crate) fn on_frame_lost(&mut self, meta: &frame::StreamMeta) {
        if let Some(buffer) = self.retransmission_buffer.remove(&meta.offsets.start) {
            self.insert_into_loss_buffer(buffer);
        }
    }

    /// Whether everything through FIN has been transmitted at least once
    pub fn all_data_sent(&self) -> bool {
        match self.final_write_offset {
            Some(final_offset) => self.current_write_offset > final_offset,
            None => false,
        }
    }

    /// Abandon transmission with the given application error
    pub fn reset(&mut self, error_code: VarInt) {
        self.write_error = Some(error_code);
        self.write_buffer.clear();
        self.write_buffer_len = 0;
        self.retransmission_buffer.clear();
        self.loss_buffer.clear();
        self.loss_buf_metas.clear();
        self.send_state = SendState::ResetSent;
    }

    /// The peer acknowledged our RESET_STREAM
    pub(crate) fn on_reset_acked(&mut self) {
        if self.send_state == SendState::ResetSent {
            self.send_state = SendState::Closed;
        }
    }

    /// Handle MAX_STREAM_DATA; returns whether the limit advanced
    pub(crate) fn on_max_stream_data(&mut self, maximum: u64) -> bool {
        if maximum > self.flow_control.peer_advertised_max_offset {
            self.flow_control.peer_advertised_max_offset = maximum;
            return true;
        }
        false
    }

    /// Either insert a new entry into the loss buffer, or merge it into an
    /// adjacent one
    pub(crate) fn insert_into_loss_buffer(&mut self, buffer: StreamBuffer) {
        let pos = self
            .loss_buffer
            .iter()
            .position(|existing| buffer.offset < existing.offset)
            .unwrap_or(self.loss_buffer.len());
        if pos > 0 {
            let prev = &mut self.loss_buffer[pos - 1];
            if prev.offset + prev.data.len() as u64 == buffer.offset {
                let mut merged = BytesMut::with_capacity(prev.data.len() + buffer.data.len());
                merged.extend_from_slice(&prev.data);
                merged.extend_from_slice(&buffer.data);
                prev.data = merged.freeze();
                prev.eof = buffer.eof;
                return;
            }
        }
        self.loss_buffer.insert(pos, buffer);
    }
}
