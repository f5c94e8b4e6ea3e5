use std::{
    cmp,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use crate::{congestion::Controller, DEFAULT_MIN_RTT};

const RTT_ALPHA: u32 = 8;
const RTT_BETA: u32 = 4;

/// Unvalidated-path sends allowed per RTT window, in packets
const MIN_CWND_IN_MSS: u64 = 2;

/// Smoothed RTT estimation as described in the recovery RFC, with the
/// original's treatment of peer-reported ack delay
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RttEstimator {
    srtt: Duration,
    /// Latest sample, after ack-delay adjustment
    lrtt: Duration,
    rttvar: Duration,
    mrtt: Duration,
    /// Largest ack delay the peer has ever reported
    max_ack_delay: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: Duration::ZERO,
            lrtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            mrtt: DEFAULT_MIN_RTT,
            max_ack_delay: Duration::ZERO,
        }
    }
}

impl RttEstimator {
    /// Incorporate one sample, measured from packet send to ACK receive
    ///
    /// The peer-reported `ack_delay` is subtracted only when doing so cannot
    /// push the sample below the observed path minimum. The minimum itself
    /// always ignores ack delay.
    pub fn update(&mut self, mut rtt_sample: Duration, ack_delay: Duration) {
        let min_rtt = cmp::min(self.mrtt, rtt_sample);
        self.max_ack_delay = cmp::max(self.max_ack_delay, ack_delay);
        let use_ack_delay = rtt_sample > ack_delay
            && (rtt_sample > min_rtt + ack_delay || self.mrtt == DEFAULT_MIN_RTT);
        if use_ack_delay {
            rtt_sample -= ack_delay;
        }
        self.mrtt = min_rtt;
        self.lrtt = rtt_sample;
        if self.srtt == Duration::ZERO {
            self.srtt = rtt_sample;
            self.rttvar = rtt_sample / 2;
        } else {
            let var_sample = if self.srtt > rtt_sample {
                self.srtt - rtt_sample
            } else {
                rtt_sample - self.srtt
            };
            self.rttvar = self.rttvar * (RTT_BETA - 1) / RTT_BETA + var_sample / RTT_BETA;
            self.srtt = self.srtt * (RTT_ALPHA - 1) / RTT_ALPHA + rtt_sample / RTT_ALPHA;
        }
    }

    /// Smoothed RTT; zero until the first sample arrives
    pub fn smoothed(&self) -> Duration {
        self.srtt
    }

    /// The most recent adjusted sample
    pub fn latest(&self) -> Duration {
        self.lrtt
    }

    pub fn var(&self) -> Duration {
        self.rttvar
    }

    /// Minimum RTT observed, ignoring ack delay
    pub fn min(&self) -> Duration {
        self.mrtt
    }

    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    pub fn has_sample(&self) -> bool {
        self.srtt != Duration::ZERO
    }

    /// Forget everything, as after migrating to an unknown path
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Congestion and RTT state parked while the peer is away from a validated
/// path, restorable if it comes back soon enough
pub struct CongestionAndRttState {
    /// The path this state belongs to
    pub peer_address: SocketAddr,
    /// When the state was parked, i.e. when migration happened
    pub record_time: Instant,
    pub congestion: Box<dyn Controller>,
    pub rtt: RttEstimator,
}

/// Everything the connection remembers about peer address changes
#[derive(Default)]
pub struct MigrationState {
    pub(crate) num_migrations: u32,
    /// Previously validated peer addresses, current address excluded
    pub(crate) previous_peer_addresses: Vec<SocketAddr>,
    /// State parked at the last migration off a validated path
    pub(crate) last_congestion_and_rtt: Option<CongestionAndRttState>,
}

impl MigrationState {
    pub fn num_migrations(&self) -> u32 {
        self.num_migrations
    }

    pub fn previous_peer_addresses(&self) -> &[SocketAddr] {
        &self.previous_peer_addresses
    }
}

/// Caps how much may be written to a peer address still under validation
///
/// Credit refreshes once per RTT; the window is a small multiple of the
/// send packet size so an attacker spoofing a victim's address cannot turn
/// the server into an amplifier.
pub(crate) struct PendingPathRateLimiter {
    max_credit: u64,
    credit: u64,
    last_checked: Option<Instant>,
}

impl PendingPathRateLimiter {
    pub(crate) fn new(udp_send_packet_len: u64) -> Self {
        let max_credit = MIN_CWND_IN_MSS * udp_send_packet_len;
        Self {
            max_credit,
            credit: max_credit,
            last_checked: None,
        }
    }

    /// Bytes currently allowed towards the unvalidated path
    pub(crate) fn current_credit(&mut self, now: Instant, rtt: Duration) -> u64 {
        match self.last_checked {
            Some(checked) if now.saturating_duration_since(checked) < rtt => {}
            _ => {
                self.last_checked = Some(now);
                self.credit = self.max_credit;
            }
        }
        self.credit
    }

    pub(crate) fn on_packet_sent(&mut self, bytes: u64) {
        self.credit = self.credit.saturating_sub(bytes);
    }
}

/// Heuristic for address changes that are likely NAT rebinding rather than
/// genuine movement: a port-only change, or an IPv4 neighbor within the
/// same /24. Congestion state survives rebinding.
pub(crate) fn maybe_nat_rebinding(new_peer: &SocketAddr, old_peer: &SocketAddr) -> bool {
    let (new_ip, old_ip) = (new_peer.ip(), old_peer.ip());
    if new_ip == old_ip {
        return true;
    }
    match (new_ip, old_ip) {
        (IpAddr::V4(new_v4), IpAddr::V4(old_v4)) => new_v4.octets()[..3] == old_v4.octets()[..3],
        _ => false,
    }
}
