use std::time::Duration;

use tracing::warn;

use crate::{MAX_UDP_PAYLOAD, MIN_MAX_UDP_PAYLOAD};

const MIN_RAISE_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Peer-driven path MTU discovery
///
/// Activated only when the peer sends the base-PMTU extension parameter and
/// it passes the sanity checks; otherwise stays `Disabled` and the probing
/// machinery elsewhere never engages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(dead_code)]
pub(crate) enum PmtudState {
    Disabled,
    /// Validated at the base PMTU; may start searching upward
    Base,
    Searching,
    Error,
    SearchComplete,
}

#[allow(dead_code)]
pub(crate) struct PeerPmtud {
    pub(crate) state: PmtudState,
    pub(crate) base_pmtu: u64,
    pub(crate) max_pmtu: u64,
    pub(crate) raise_timeout: Duration,
    pub(crate) probe_timeout: Duration,
    /// Blackhole detection stays off while the peer drives probing
    pub(crate) no_blackhole_detection: bool,
}

impl Default for PeerPmtud {
    fn default() -> Self {
        Self {
            state: PmtudState::Disabled,
            base_pmtu: MIN_MAX_UDP_PAYLOAD,
            max_pmtu: MAX_UDP_PAYLOAD,
            raise_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(15),
            no_blackhole_detection: false,
        }
    }
}

impl PeerPmtud {
    /// Apply the peer's PMTUD extension parameters
    ///
    /// The base parameter doubles as the activation switch; without it the
    /// remaining timeouts are not even inspected.
    pub(crate) fn on_peer_params(
        &mut self,
        base_pmtu: Option<u64>,
        raise_timeout: Option<u64>,
        probe_timeout: Option<u64>,
        udp_send_packet_len: u64,
        max_udp_payload: u64,
    ) {
        let base = match base_pmtu {
            Some(base) => base,
            None => return,
        };
        if !(MIN_MAX_UDP_PAYLOAD..=MAX_UDP_PAYLOAD).contains(&base) {
            warn!(base, "peer base PMTU fails sanity check");
            return;
        }
        // Probing below what we already send would only add delay
        self.base_pmtu = base.max(udp_send_packet_len);
        self.max_pmtu = max_udp_payload;
        self.state = PmtudState::Base;
        self.no_blackhole_detection = true;

        if let Some(raise) = raise_timeout {
            let raise = Duration::from_secs(raise);
            if raise >= MIN_RAISE_TIMEOUT {
                self.raise_timeout = raise;
            } else {
                warn!(?raise, "peer raise timeout fails sanity check");
            }
        }
        if let Some(probe) = probe_timeout {
            let probe = Duration::from_secs(probe);
            if probe >= MIN_PROBE_TIMEOUT {
                self.probe_timeout = probe;
            } else {
                warn!(?probe, "peer probe timeout fails sanity check");
            }
        }
    }
}
