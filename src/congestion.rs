//! Interfaces to the congestion controller and pacer
//!
//! Concrete algorithms live outside this crate. The connection core owns a
//! boxed controller, feeds it send/ack/loss events, and may move it into the
//! migration state to be restored when the peer returns to a prior path.

use std::time::Instant;

use crate::config::TransportConfig;

/// A congestion controller, uniquely owned by one connection at a time
pub trait Controller: Send {
    /// A packet counting towards the congestion window was transmitted
    fn on_sent(&mut self, now: Instant, bytes: u64);

    /// Previously sent bytes were acknowledged
    fn on_ack(&mut self, now: Instant, bytes: u64);

    /// Previously sent bytes were declared lost
    fn on_loss(&mut self, now: Instant, bytes: u64, persistent: bool);

    /// The application went idle, or became active again
    ///
    /// Idle here means no non-control streams exist; controllers typically
    /// stop growing the window while idle.
    fn set_app_idle(&mut self, idle: bool, now: Instant);

    /// Current congestion window, in bytes
    fn window(&self) -> u64;
}

/// Constructs controllers on demand
///
/// Used at connection setup and again whenever migration requires a fresh
/// controller for an unknown path.
pub trait ControllerFactory: Send + Sync {
    fn build(&self, now: Instant) -> Box<dyn Controller>;
}

/// A pacer, notified when the 1-RTT keys are established so it can switch
/// from handshake pacing to steady-state pacing
pub trait Pacer: Send {
    fn on_key_established(&mut self, now: Instant);
}

pub(crate) fn update_pacing_on_key_established(
    pacer: Option<&mut Box<dyn Pacer>>,
    config: &TransportConfig,
    now: Instant,
) {
    if !config.pacing_enabled {
        return;
    }
    if let Some(pacer) = pacer {
        pacer.on_key_established(now);
    }
}

/// Congestion control algorithms selectable through transport knobs
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
pub enum CongestionControlType {
    None = 0,
    NewReno = 1,
    Cubic = 2,
    Copa = 3,
    Bbr = 4,
}

impl CongestionControlType {
    /// Parse a lowercase algorithm name, as carried in configuration knobs
    pub fn from_knob_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "newreno" => Some(Self::NewReno),
            "cubic" => Some(Self::Cubic),
            "copa" => Some(Self::Copa),
            "bbr" => Some(Self::Bbr),
            _ => None,
        }
    }
}

/// A controller with a window fixed at construction time
///
/// The default factory product; useful for tests and for deployments that
/// drive the real controller from outside the core.
pub struct FixedWindowController {
    window: u64,
}

impl FixedWindowController {
    pub fn new(window: u64) -> Self {
        Self { window }
    }
}

impl Controller for FixedWindowController {
    fn on_sent(&mut self, _now: Instant, _bytes: u64) {}
    fn on_ack(&mut self, _now: Instant, _bytes: u64) {}
    fn on_loss(&mut self, _now: Instant, _bytes: u64, _persistent: bool) {}
    fn set_app_idle(&mut self, _idle: bool, _now: Instant) {}

    fn window(&self) -> u64 {
        self.window
    }
}

/// Factory for [`FixedWindowController`]
pub struct FixedWindowFactory {
    window: u64,
}

impl FixedWindowFactory {
    pub fn new(window: u64) -> Self {
        Self { window }
    }
}

impl ControllerFactory for FixedWindowFactory {
    fn build(&self, _now: Instant) -> Box<dyn Controller> {
        Box::new(FixedWindowController::new(self.window))
    }
}
