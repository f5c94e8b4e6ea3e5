//! Logical stream lifecycle and bookkeeping
//!
//! Streams exist at two levels: membership in an open set, which is cheap
//! and covers implicitly opened streams, and a state record, allocated
//! lazily the first time a stream is actually touched. The manager also
//! maintains the auxiliary indices the transport and application iterate:
//! readable/peekable sets, priority-ordered writable queues, loss and
//! blocked sets, and pending window/limit updates.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::trace;

use crate::{
    config::TransportConfig, Dir, Side, StreamId, TransportError, VarInt, MAX_PRIORITY,
    MAX_STREAM_COUNT, STREAM_ID_INCREMENT,
};

mod state;
pub use state::{RecvState, SendState, StreamBuffer, StreamFlowControl, StreamState,
                WriteBufferMeta};

use std::time::Instant;

/// Stream priority: lower level is more urgent; incremental streams share
/// their level round-robin instead of strictly
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Priority {
    pub level: u8,
    pub incremental: bool,
}

impl Priority {
    pub fn new(level: u8, incremental: bool) -> Self {
        debug_assert!(level <= MAX_PRIORITY);
        Self {
            level: level.min(MAX_PRIORITY),
            incremental,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            level: 3,
            incremental: false,
        }
    }
}

/// Errors returned to the local caller of stream-creation APIs; these never
/// appear on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum LocalStreamError {
    #[error("creating a stream that already exists")]
    CreatingExistingStream,
    #[error("stream limit exceeded")]
    StreamLimitExceeded,
}

/// Observer notified whenever the set of stream priorities changes
pub trait StreamPriorityObserver: Send {
    fn on_stream_priorities_change(&mut self);
}

/// Peer-advertised initial per-stream flow control limits
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct PeerStreamWindows {
    /// Limit on streams the peer initiated
    pub bidi_local: u64,
    /// Limit on streams we initiated
    pub bidi_remote: u64,
    pub uni: u64,
}

pub struct StreamManager {
    side: Side,

    /// Stream state records; absence of a record for an open stream means it
    /// has not been touched yet
    streams: FxHashMap<StreamId, StreamState>,

    open_bidi_local: FxHashSet<StreamId>,
    open_uni_local: FxHashSet<StreamId>,
    open_bidi_peer: FxHashSet<StreamId>,
    open_uni_peer: FxHashSet<StreamId>,

    next_bidi_stream_id: u64,
    next_uni_stream_id: u64,
    next_acceptable_local_bidi: u64,
    next_acceptable_local_uni: u64,
    next_acceptable_peer_bidi: u64,
    next_acceptable_peer_uni: u64,

    initial_local_bidi: u64,
    initial_local_uni: u64,
    initial_peer_bidi: u64,
    initial_peer_uni: u64,

    max_local_bidi_stream_id: u64,
    max_local_uni_stream_id: u64,
    max_remote_bidi_stream_id: u64,
    max_remote_uni_stream_id: u64,

    max_local_bidi_increased: bool,
    max_local_uni_increased: bool,
    remote_bidi_limit_update: Option<u64>,
    remote_uni_limit_update: Option<u64>,

    /// Peer streams opened since the last drain, for accept notification
    new_peer_streams: Vec<StreamId>,

    // Auxiliary indices
    readable: FxHashSet<StreamId>,
    peekable: FxHashSet<StreamId>,
    writable: PriorityQueue,
    writable_dsr: PriorityQueue,
    writable_control: FxHashSet<StreamId>,
    loss_streams: FxHashSet<StreamId>,
    loss_dsr_streams: FxHashSet<StreamId>,
    blocked: FxHashSet<StreamId>,
    deliverable: FxHashSet<StreamId>,
    tx: FxHashSet<StreamId>,
    window_updates: FxHashSet<StreamId>,
    stop_sending: FxHashMap<StreamId, VarInt>,
    flow_control_updated: FxHashSet<StreamId>,
    priority_levels: FxHashMap<StreamId, u8>,

    num_control_streams: u64,
    app_idle: bool,
    /// Transition pending delivery to the congestion controller
    app_idle_changed: Option<bool>,

    priority_observer: Option<Box<dyn StreamPriorityObserver>>,

    // Settings snapshot
    advertised_max_streams_bidi: u64,
    advertised_max_streams_uni: u64,
    windowing_fraction: u64,
    window_bidi_local: u64,
    window_bidi_remote: u64,
    window_uni: u64,
    peer_windows: PeerStreamWindows,

    pub(crate) streams_opened: u64,
    pub(crate) streams_closed: u64,
}

impl StreamManager {
    pub(crate) fn new(side: Side, config: &TransportConfig) -> Self {
        let initial_local_bidi = StreamId::new(side, Dir::Bi, 0).into();
        let initial_local_uni = StreamId::new(side, Dir::Uni, 0).into();
        let initial_peer_bidi = StreamId::new(!side, Dir::Bi, 0).into();
        let initial_peer_uni = StreamId::new(!side, Dir::Uni, 0).into();
        let mut manager = Self {
            side,
            streams: FxHashMap::default(),
            open_bidi_local: FxHashSet::default(),
            open_uni_local: FxHashSet::default(),
            open_bidi_peer: FxHashSet::default(),
            open_uni_peer: FxHashSet::default(),
            next_bidi_stream_id: initial_local_bidi,
            next_uni_stream_id: initial_local_uni,
            next_acceptable_local_bidi: initial_local_bidi,
            next_acceptable_local_uni: initial_local_uni,
            next_acceptable_peer_bidi: initial_peer_bidi,
            next_acceptable_peer_uni: initial_peer_uni,
            initial_local_bidi,
            initial_local_uni,
            initial_peer_bidi,
            initial_peer_uni,
            // Local limits stay zero until the peer's parameters arrive
            max_local_bidi_stream_id: initial_local_bidi,
            max_local_uni_stream_id: initial_local_uni,
            max_remote_bidi_stream_id: initial_peer_bidi,
            max_remote_uni_stream_id: initial_peer_uni,
            max_local_bidi_increased: false,
            max_local_uni_increased: false,
            remote_bidi_limit_update: None,
            remote_uni_limit_update: None,
            new_peer_streams: Vec::new(),
            readable: FxHashSet::default(),
            peekable: FxHashSet::default(),
            writable: PriorityQueue::new(),
            writable_dsr: PriorityQueue::new(),
            writable_control: FxHashSet::default(),
            loss_streams: FxHashSet::default(),
            loss_dsr_streams: FxHashSet::default(),
            blocked: FxHashSet::default(),
            deliverable: FxHashSet::default(),
            tx: FxHashSet::default(),
            window_updates: FxHashSet::default(),
            stop_sending: FxHashMap::default(),
            flow_control_updated: FxHashSet::default(),
            priority_levels: FxHashMap::default(),
            num_control_streams: 0,
            app_idle: false,
            app_idle_changed: None,
            priority_observer: None,
            advertised_max_streams_bidi: config.advertised_max_streams_bidi,
            advertised_max_streams_uni: config.advertised_max_streams_uni,
            windowing_fraction: config.stream_limit_windowing_fraction,
            window_bidi_local: config.advertised_bidi_local_stream_window,
            window_bidi_remote: config.advertised_bidi_remote_stream_window,
            window_uni: config.advertised_uni_stream_window,
            peer_windows: PeerStreamWindows::default(),
            streams_opened: 0,
            streams_closed: 0,
        };
        manager.refresh_transport_settings(config);
        manager
    }

    /// Re-apply advertised stream limits after settings change, e.g. from a
    /// resumption ticket
    pub(crate) fn refresh_transport_settings(&mut self, config: &TransportConfig) {
        self.advertised_max_streams_bidi = config.advertised_max_streams_bidi;
        self.advertised_max_streams_uni = config.advertised_max_streams_uni;
        self.windowing_fraction = config.stream_limit_windowing_fraction;
        self.window_bidi_local = config.advertised_bidi_local_stream_window;
        self.window_bidi_remote = config.advertised_bidi_remote_stream_window;
        self.window_uni = config.advertised_uni_stream_window;
        // Forced: ticket values may be below what a previous update advertised
        self.set_max_remote_bidi_internal(config.advertised_max_streams_bidi, true)
            .ok();
        self.set_max_remote_uni_internal(config.advertised_max_streams_uni, true)
            .ok();
    }

    /// Apply the peer's initial stream windows and stream limits
    pub(crate) fn set_peer_params(
        &mut self,
        windows: PeerStreamWindows,
        max_streams_bidi: u64,
        max_streams_uni: u64,
    ) -> Result<(), TransportError> {
        self.peer_windows = windows;
        self.set_max_local_bidi(max_streams_bidi, false)?;
        self.set_max_local_uni(max_streams_uni, false)?;
        Ok(())
    }

    pub fn stream_exists(&self, id: StreamId) -> bool {
        self.open_set(id).contains(&id)
    }

    pub fn find_stream(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn find_stream_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Look up a stream for frame processing, lazily materializing its state
    /// record and implicitly opening peer streams up to `id`
    ///
    /// Returns `None` for streams that have existed and since closed.
    pub fn get_stream(&mut self, id: StreamId) -> Result<Option<&mut StreamState>, TransportError> {
        if id.initiator() != self.side {
            self.ensure_peer_stream(id)?;
            self.update_app_idle_state();
            return Ok(self.streams.get_mut(&id));
        }
        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id));
        }
        let next_acceptable = match id.dir() {
            Dir::Bi => self.next_acceptable_local_bidi,
            Dir::Uni => self.next_acceptable_local_uni,
        };
        if !self.stream_exists(id) && u64::from(id) >= next_acceptable {
            return Err(TransportError::STREAM_STATE_ERROR(
                "getting unopened local stream",
            ));
        }
        self.ensure_opened_local_stream(id);
        self.update_app_idle_state();
        Ok(self.streams.get_mut(&id))
    }

    /// Open the next locally-initiated bidirectional stream
    pub fn create_next_bidirectional_stream(
        &mut self,
    ) -> Result<&mut StreamState, LocalStreamError> {
        let id = StreamId::from(self.next_bidi_stream_id);
        self.create_local_stream(id)?;
        self.next_bidi_stream_id += STREAM_ID_INCREMENT;
        Ok(self.streams.get_mut(&id).unwrap())
    }

    /// Open the next locally-initiated unidirectional stream
    pub fn create_next_unidirectional_stream(
        &mut self,
    ) -> Result<&mut StreamState, LocalStreamError> {
        let id = StreamId::from(self.next_uni_stream_id);
        self.create_local_stream(id)?;
        self.next_uni_stream_id += STREAM_ID_INCREMENT;
        Ok(self.streams.get_mut(&id).unwrap())
    }

    /// Open a specific locally-initiated stream
    ///
    /// IDs with the wrong parity for this endpoint are a protocol-level
    /// stream state error; limit problems are returned to the caller and
    /// never reach the wire.
    pub fn create_stream(
        &mut self,
        id: StreamId,
    ) -> Result<Result<&mut StreamState, LocalStreamError>, TransportError> {
        if id.initiator() != self.side {
            return Err(TransportError::STREAM_STATE_ERROR(
                "creating stream with peer's parity",
            ));
        }
        Ok(self.create_local_stream(id))
    }

    fn create_local_stream(
        &mut self,
        id: StreamId,
    ) -> Result<&mut StreamState, LocalStreamError> {
        debug_assert_eq!(id.initiator(), self.side);
        if self.stream_exists(id) {
            if !self.streams.contains_key(&id) {
                self.ensure_opened_local_stream(id);
                self.update_app_idle_state();
            }
            return Ok(self.streams.get_mut(&id).unwrap());
        }
        let (next_acceptable, max_stream_id) = match id.dir() {
            Dir::Bi => (self.next_acceptable_local_bidi, self.max_local_bidi_stream_id),
            Dir::Uni => (self.next_acceptable_local_uni, self.max_local_uni_stream_id),
        };
        let raw = u64::from(id);
        if raw < next_acceptable {
            return Err(LocalStreamError::CreatingExistingStream);
        }
        if raw >= max_stream_id {
            return Err(LocalStreamError::StreamLimitExceeded);
        }
        // Open every intermediate stream as well; they may be touched later
        let mut cursor = next_acceptable;
        while cursor <= raw {
            self.open_set_mut(id).insert(StreamId::from(cursor));
            cursor += STREAM_ID_INCREMENT;
        }
        match id.dir() {
            Dir::Bi => self.next_acceptable_local_bidi = raw + STREAM_ID_INCREMENT,
            Dir::Uni => self.next_acceptable_local_uni = raw + STREAM_ID_INCREMENT,
        }
        self.insert_stream_record(id);
        self.update_app_idle_state();
        Ok(self.streams.get_mut(&id).unwrap())
    }

    /// Allocate the record for an already-open local stream, if it is open
    fn ensure_opened_local_stream(&mut self, id: StreamId) {
        if !self.open_set(id).contains(&id) {
            return;
        }
        if !self.streams.contains_key(&id) {
            self.insert_stream_record(id);
        }
    }

    /// Open a peer stream if needed, materializing its record
    ///
    /// Maintains three invariants:
    /// 1. streams below the next-acceptable cursor have been seen before;
    ///    everything at or above it can be opened
    /// 2. seen streams always have an open-set entry; a seen stream with no
    ///    entry is closed
    /// 3. if stream n is open, every peer stream below n has been seen
    ///
    /// A stream that has been seen and closed leaves no record behind; the
    /// caller observes that through the map lookup afterwards.
    fn ensure_peer_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        debug_assert_ne!(id.initiator(), self.side);
        if self.side.is_server() && id.initiator().is_server() {
            return Err(TransportError::STREAM_STATE_ERROR(
                "getting server peer stream on server",
            ));
        }
        if self.streams.contains_key(&id) {
            return Ok(());
        }
        if self.open_set(id).contains(&id) {
            // Stream was already open; create the state for it lazily
            self.insert_stream_record(id);
            return Ok(());
        }
        let (next_acceptable, max_stream_id) = match id.dir() {
            Dir::Bi => (self.next_acceptable_peer_bidi, self.max_remote_bidi_stream_id),
            Dir::Uni => (self.next_acceptable_peer_uni, self.max_remote_uni_stream_id),
        };
        let raw = u64::from(id);
        if raw < next_acceptable {
            // Stream is known and closed
            return Ok(());
        }
        if raw >= max_stream_id {
            return Err(TransportError::STREAM_LIMIT_ERROR("exceeded stream limit"));
        }
        // Open all streams up to and including the requested one
        let mut cursor = next_acceptable;
        while cursor <= raw {
            let opened = StreamId::from(cursor);
            self.open_set_mut(id).insert(opened);
            self.new_peer_streams.push(opened);
            cursor += STREAM_ID_INCREMENT;
        }
        match id.dir() {
            Dir::Bi => self.next_acceptable_peer_bidi = raw + STREAM_ID_INCREMENT,
            Dir::Uni => self.next_acceptable_peer_uni = raw + STREAM_ID_INCREMENT,
        }
        self.insert_stream_record(id);
        Ok(())
    }

    fn insert_stream_record(&mut self, id: StreamId) {
        let local = id.initiator() == self.side;
        let (recv_window, send_max) = match (local, id.dir()) {
            (true, Dir::Bi) => (self.window_bidi_local, self.peer_windows.bidi_remote),
            (true, Dir::Uni) => (0, self.peer_windows.uni),
            (false, Dir::Bi) => (self.window_bidi_remote, self.peer_windows.bidi_local),
            (false, Dir::Uni) => (self.window_uni, 0),
        };
        let mut stream = StreamState::new(id, recv_window, send_max);
        if id.dir() == Dir::Uni {
            if local {
                stream.recv_state = RecvState::Invalid;
            } else {
                stream.send_state = SendState::Invalid;
            }
        }
        let priority = stream.priority;
        let previous = self.streams.insert(id, stream);
        debug_assert!(previous.is_none());
        self.priority_levels.insert(id, priority.level);
        self.streams_opened += 1;
        self.notify_priority_changes();
    }

    /// Remove a stream whose halves are both terminal, dropping it from
    /// every auxiliary index
    ///
    /// Closing peer streams may return capacity to the peer via a
    /// MAX_STREAMS update, surfaced through the limit-update accessors.
    pub fn remove_closed_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        let stream = match self.streams.get(&id) {
            Some(stream) => stream,
            None => {
                trace!(stream = %id, "removing already closed stream");
                return Ok(());
            }
        };
        trace!(stream = %id, "removing closed stream");
        debug_assert!(stream.in_terminal_states());
        let is_control = stream.is_control;

        self.readable.remove(&id);
        self.peekable.remove(&id);
        self.writable.erase(id);
        self.writable_dsr.erase(id);
        self.writable_control.remove(&id);
        self.loss_streams.remove(&id);
        self.loss_dsr_streams.remove(&id);
        self.blocked.remove(&id);
        self.deliverable.remove(&id);
        self.tx.remove(&id);
        self.window_updates.remove(&id);
        self.stop_sending.remove(&id);
        self.flow_control_updated.remove(&id);
        if self.priority_levels.remove(&id).is_none() {
            return Err(TransportError::STREAM_STATE_ERROR(
                "removed stream is not in the priority map",
            ));
        }
        if is_control {
            debug_assert!(self.num_control_streams > 0);
            self.num_control_streams -= 1;
        }
        self.streams.remove(&id);
        self.streams_closed += 1;

        if id.initiator() != self.side {
            self.open_set_mut(id).remove(&id);
            self.maybe_issue_stream_limit_update(id);
        } else {
            self.open_set_mut(id).remove(&id);
        }
        self.update_app_idle_state();
        self.notify_priority_changes();
        Ok(())
    }

    /// Issue a MAX_STREAMS update once enough closed peer streams have
    /// accumulated relative to the windowing fraction
    fn maybe_issue_stream_limit_update(&mut self, id: StreamId) {
        let uni = id.dir() == Dir::Uni;
        let initial_limit = if uni {
            self.advertised_max_streams_uni
        } else {
            self.advertised_max_streams_bidi
        };
        let stream_window = initial_limit / self.windowing_fraction;
        let openable = if uni {
            self.openable_remote_unidirectional_streams()
        } else {
            self.openable_remote_bidirectional_streams()
        };
        let open_count = if uni {
            self.open_uni_peer.len() as u64
        } else {
            self.open_bidi_peer.len() as u64
        };
        // Capacity we have reclaimed relative to the initial advertisement
        let stream_credit = initial_limit
            .saturating_sub(openable)
            .saturating_sub(open_count);
        if stream_credit < stream_window {
            return;
        }
        if uni {
            let max_streams =
                (self.max_remote_uni_stream_id - self.initial_peer_uni) / STREAM_ID_INCREMENT;
            let new_max = max_streams + stream_credit;
            self.set_max_remote_uni_internal(new_max, false).ok();
            self.remote_uni_limit_update = Some(new_max);
        } else {
            let max_streams =
                (self.max_remote_bidi_stream_id - self.initial_peer_bidi) / STREAM_ID_INCREMENT;
            let new_max = max_streams + stream_credit;
            self.set_max_remote_bidi_internal(new_max, false).ok();
            self.remote_bidi_limit_update = Some(new_max);
        }
    }

    /// Pending MAX_STREAMS (bidirectional) value to transmit, if any
    pub fn remote_bidirectional_stream_limit_update(&mut self) -> Option<u64> {
        self.remote_bidi_limit_update.take()
    }

    /// Pending MAX_STREAMS (unidirectional) value to transmit, if any
    pub fn remote_unidirectional_stream_limit_update(&mut self) -> Option<u64> {
        self.remote_uni_limit_update.take()
    }

    pub fn openable_remote_bidirectional_streams(&self) -> u64 {
        (self.max_remote_bidi_stream_id - self.next_acceptable_peer_bidi) / STREAM_ID_INCREMENT
    }

    pub fn openable_remote_unidirectional_streams(&self) -> u64 {
        (self.max_remote_uni_stream_id - self.next_acceptable_peer_uni) / STREAM_ID_INCREMENT
    }

    pub fn openable_local_bidirectional_streams(&self) -> u64 {
        (self.max_local_bidi_stream_id.saturating_sub(self.next_bidi_stream_id))
            / STREAM_ID_INCREMENT
    }

    pub fn openable_local_unidirectional_streams(&self) -> u64 {
        (self.max_local_uni_stream_id.saturating_sub(self.next_uni_stream_id))
            / STREAM_ID_INCREMENT
    }

    /// Raise the number of bidirectional streams we may open
    pub(crate) fn set_max_local_bidi(
        &mut self,
        max_streams: u64,
        force: bool,
    ) -> Result<(), TransportError> {
        Self::check_stream_count(max_streams)?;
        let max_stream_id = max_streams * STREAM_ID_INCREMENT + self.initial_local_bidi;
        if force || max_stream_id > self.max_local_bidi_stream_id {
            self.max_local_bidi_stream_id = max_stream_id;
            self.max_local_bidi_increased = true;
        }
        Ok(())
    }

    /// Raise the number of unidirectional streams we may open
    pub(crate) fn set_max_local_uni(
        &mut self,
        max_streams: u64,
        force: bool,
    ) -> Result<(), TransportError> {
        Self::check_stream_count(max_streams)?;
        let max_stream_id = max_streams * STREAM_ID_INCREMENT + self.initial_local_uni;
        if force || max_stream_id > self.max_local_uni_stream_id {
            self.max_local_uni_stream_id = max_stream_id;
            self.max_local_uni_increased = true;
        }
        Ok(())
    }

    fn set_max_remote_bidi_internal(
        &mut self,
        max_streams: u64,
        force: bool,
    ) -> Result<(), TransportError> {
        Self::check_stream_count(max_streams)?;
        let max_stream_id = max_streams * STREAM_ID_INCREMENT + self.initial_peer_bidi;
        if force || max_stream_id > self.max_remote_bidi_stream_id {
            self.max_remote_bidi_stream_id = max_stream_id;
        }
        Ok(())
    }

    fn set_max_remote_uni_internal(
        &mut self,
        max_streams: u64,
        force: bool,
    ) -> Result<(), TransportError> {
        Self::check_stream_count(max_streams)?;
        let max_stream_id = max_streams * STREAM_ID_INCREMENT + self.initial_peer_uni;
        if force || max_stream_id > self.max_remote_uni_stream_id {
            self.max_remote_uni_stream_id = max_stream_id;
        }
        Ok(())
    }

    fn check_stream_count(max_streams: u64) -> Result<(), TransportError> {
        if max_streams > MAX_STREAM_COUNT {
            return Err(TransportError::STREAM_LIMIT_ERROR(
                "attempt to set max streams beyond the allowed maximum",
            ));
        }
        Ok(())
    }

    /// Whether a MAX_STREAMS increase from the peer arrived since last asked
    pub fn consume_max_local_bidi_increased(&mut self) -> bool {
        std::mem::take(&mut self.max_local_bidi_increased)
    }

    pub fn consume_max_local_uni_increased(&mut self) -> bool {
        std::mem::take(&mut self.max_local_uni_increased)
    }

    /// Handle MAX_STREAMS from the peer
    pub(crate) fn on_max_streams(&mut self, dir: Dir, count: u64) -> Result<(), TransportError> {
        match dir {
            Dir::Bi => self.set_max_local_bidi(count, false),
            Dir::Uni => self.set_max_local_uni(count, false),
        }
    }

    //
    // Index maintenance
    //

    /// Recompute readable membership and head-of-line accounting after any
    /// receive-side change
    pub fn update_readable_streams(&mut self, id: StreamId, now: Instant) {
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return,
        };
        update_hol_blocked_time(stream, now);
        if stream.has_readable_data() || stream.read_error.is_some() {
            self.readable.insert(id);
        } else {
            self.readable.remove(&id);
        }
    }

    pub fn update_peekable_streams(&mut self, id: StreamId) {
        let stream = match self.streams.get(&id) {
            Some(stream) => stream,
            None => return,
        };
        if stream.has_peekable_data() || stream.read_error.is_some() {
            self.peekable.insert(id);
        } else {
            self.peekable.remove(&id);
        }
    }

    /// Recompute writable-queue membership after any send-side change
    pub fn update_writable_streams(&mut self, id: StreamId) {
        let stream = match self.streams.get(&id) {
            Some(stream) => stream,
            None => return,
        };
        if stream.write_error.is_some() {
            debug_assert!(!stream.has_loss());
            debug_assert!(!stream.has_dsr_loss());
            self.writable.erase(id);
            self.writable_control.remove(&id);
            self.writable_dsr.erase(id);
            return;
        }
        let priority = stream.priority;
        let is_control = stream.is_control;
        if stream.has_writable_data() || stream.has_loss() {
            if is_control {
                self.writable_control.insert(id);
            } else {
                self.writable.insert_or_update(id, priority);
            }
        } else {
            self.writable.erase(id);
            self.writable_control.remove(&id);
        }
        if is_control {
            return;
        }
        let stream = self.streams.get(&id).unwrap();
        if stream.dsr && (stream.has_writable_buf_meta() || stream.has_dsr_loss()) {
            self.writable_dsr.insert_or_update(id, priority);
        } else {
            self.writable_dsr.erase(id);
        }
    }

    /// Change a stream's priority, updating every structure that orders by it
    ///
    /// Returns whether anything changed.
    pub fn set_stream_priority(
        &mut self,
        id: StreamId,
        priority: Priority,
    ) -> Result<bool, TransportError> {
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Ok(false),
        };
        if stream.priority == priority {
            return Ok(false);
        }
        stream.priority = priority;
        match self.priority_levels.get_mut(&id) {
            Some(level) => *level = priority.level,
            None => {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "active stream not in stream priority map",
                ))
            }
        }
        self.writable.update_if_exists(id, priority);
        self.writable_dsr.update_if_exists(id, priority);
        self.notify_priority_changes();
        Ok(true)
    }

    /// The most urgent level among live streams; lower is more urgent
    pub fn get_highest_priority_level(&self) -> u8 {
        let mut min = MAX_PRIORITY;
        for &level in self.priority_levels.values() {
            if level < min {
                min = level;
            }
            if min == 0 {
                break;
            }
        }
        min
    }

    pub fn set_priority_observer(&mut self, observer: Box<dyn StreamPriorityObserver>) {
        self.priority_observer = Some(observer);
    }

    pub fn reset_priority_observer(&mut self) {
        self.priority_observer = None;
    }

    fn notify_priority_changes(&mut self) {
        if let Some(observer) = &mut self.priority_observer {
            observer.on_stream_priorities_change();
        }
    }

    /// Mark a stream as application-level signalling, excluding it from
    /// app-idle accounting
    pub fn set_stream_as_control(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if !stream.is_control {
                stream.is_control = true;
                self.num_control_streams += 1;
            }
        }
        self.update_app_idle_state();
    }

    pub fn is_app_idle(&self) -> bool {
        self.app_idle
    }

    /// The connection is app-idle iff no non-control streams exist.
    /// Transitions are surfaced once so the congestion controller can be
    /// notified with a timestamp.
    fn update_app_idle_state(&mut self) {
        let has_non_ctrl = self.streams.len() as u64 > self.num_control_streams;
        let idle = !has_non_ctrl;
        if idle == self.app_idle {
            return;
        }
        self.app_idle = idle;
        self.app_idle_changed = Some(idle);
    }

    pub(crate) fn take_app_idle_change(&mut self) -> Option<bool> {
        self.app_idle_changed.take()
    }

    //
    // Pending-work accessors
    //

    pub fn drain_new_peer_streams(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.new_peer_streams)
    }

    pub fn readable_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.readable.iter().copied()
    }

    pub fn peekable_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.peekable.iter().copied()
    }

    pub fn writable_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.writable.iter()
    }

    pub fn writable_dsr_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.writable_dsr.iter()
    }

    pub fn writable_control_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.writable_control.iter().copied()
    }

    pub(crate) fn add_loss(&mut self, id: StreamId) {
        self.loss_streams.insert(id);
    }

    pub fn add_dsr_loss(&mut self, id: StreamId) {
        self.loss_dsr_streams.insert(id);
    }

    pub fn remove_loss(&mut self, id: StreamId) {
        self.loss_streams.remove(&id);
        self.loss_dsr_streams.remove(&id);
    }

    pub fn has_loss(&self) -> bool {
        !self.loss_streams.is_empty() || !self.loss_dsr_streams.is_empty()
    }

    pub fn queue_window_update(&mut self, id: StreamId) {
        self.window_updates.insert(id);
    }

    pub fn pending_window_updates(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.window_updates.iter().copied()
    }

    pub fn remove_window_update(&mut self, id: StreamId) {
        self.window_updates.remove(&id);
    }

    pub(crate) fn queue_stop_sending(&mut self, id: StreamId, error: VarInt) {
        self.stop_sending.insert(id, error);
    }

    pub fn stop_sending_streams(&self) -> impl Iterator<Item = (StreamId, VarInt)> + '_ {
        self.stop_sending.iter().map(|(&id, &err)| (id, err))
    }

    pub(crate) fn queue_flow_control_updated(&mut self, id: StreamId) {
        self.flow_control_updated.insert(id);
    }

    /// Streams whose peer-advertised flow control advanced, for app notify
    pub fn consume_flow_control_updated(&mut self) -> Vec<StreamId> {
        self.flow_control_updated.drain().collect()
    }

    pub fn queue_blocked(&mut self, id: StreamId) {
        self.blocked.insert(id);
    }

    pub fn blocked_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.blocked.iter().copied()
    }

    pub(crate) fn add_tx(&mut self, id: StreamId) {
        self.tx.insert(id);
    }

    pub(crate) fn add_deliverable(&mut self, id: StreamId) {
        self.deliverable.insert(id);
    }

    pub fn deliverable_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.deliverable.iter().copied()
    }

    fn open_set(&self, id: StreamId) -> &FxHashSet<StreamId> {
        match (id.initiator() == self.side, id.dir()) {
            (true, Dir::Bi) => &self.open_bidi_local,
            (true, Dir::Uni) => &self.open_uni_local,
            (false, Dir::Bi) => &self.open_bidi_peer,
            (false, Dir::Uni) => &self.open_uni_peer,
        }
    }

    fn open_set_mut(&mut self, id: StreamId) -> &mut FxHashSet<StreamId> {
        match (id.initiator() == self.side, id.dir()) {
            (true, Dir::Bi) => &mut self.open_bidi_local,
            (true, Dir::Uni) => &mut self.open_uni_local,
            (false, Dir::Bi) => &mut self.open_bidi_peer,
            (false, Dir::Uni) => &mut self.open_uni_peer,
        }
    }
}

/// Update head-of-line blocked accounting for a stream
///
/// A stream becomes blocked when it has buffered data with a gap at the
/// current read offset, and unblocks when the gap fills, the data is read,
/// or the peer resets the stream.
fn update_hol_blocked_time(stream: &mut StreamState, now: Instant) {
    if stream.read_buffer.is_empty()
        || stream.read_buffer.first_offset() == Some(stream.current_read_offset())
    {
        if let Some(since) = stream.last_holb_time.take() {
            stream.total_holb_time += now.saturating_duration_since(since);
        }
        return;
    }
    if stream.last_holb_time.is_some() {
        return;
    }
    stream.last_holb_time = Some(now);
    stream.holb_count += 1;
}

/// Streams with pending work, ordered by priority level with incremental
/// streams after strict ones at the same level
pub(crate) struct PriorityQueue {
    levels: Vec<Level>,
}

#[derive(Default)]
struct Level {
    queue: VecDeque<StreamId>,
    members: FxHashSet<StreamId>,
}

impl PriorityQueue {
    fn new() -> Self {
        let mut levels = Vec::new();
        levels.resize_with(2 * (usize::from(MAX_PRIORITY) + 1), Level::default);
        Self { levels }
    }

    fn index(priority: Priority) -> usize {
        usize::from(priority.level) * 2 + usize::from(priority.incremental)
    }

    pub(crate) fn insert_or_update(&mut self, id: StreamId, priority: Priority) {
        let index = Self::index(priority);
        if self.levels[index].members.contains(&id) {
            return;
        }
        self.erase(id);
        self.levels[index].members.insert(id);
        self.levels[index].queue.push_back(id);
    }

    pub(crate) fn update_if_exists(&mut self, id: StreamId, priority: Priority) {
        if self.contains(id) {
            self.erase(id);
            self.insert_or_update(id, priority);
        }
    }

    pub(crate) fn erase(&mut self, id: StreamId) {
        for level in &mut self.levels {
            if level.members.remove(&id) {
                level.queue.retain(|&queued| queued != id);
                return;
            }
        }
    }

    pub(crate) fn contains(&self, id: StreamId) -> bool {
        self.levels.iter().any(|level| level.members.contains(&id))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels.iter().all(|level| level.queue.is_empty())
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.iter().map(|level| level.queue.len()).sum()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.levels
            .iter()
            .flat_map(|level| level.queue.iter().copied())
    }
}
