use crate::types::ViewStamp;
use log::{debug, info};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PacemakerConfig {
    /// How long a view may stall before the round is forced forward.
    pub timeout: Duration,
    /// Suspends timers; views only advance through `TriggerNextView`.
    pub manual_mode: bool,
    /// Pause applied to leader broadcasts so a local devnet can be followed by eye.
    pub debug_interval: Duration,
}

impl Default for PacemakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            manual_mode: false,
            debug_interval: Duration::ZERO,
        }
    }
}

/// Liveness controller.
///
/// The pacemaker never owns a clock. It remembers the stamp of the single timer it
/// considers live; the node loop schedules the actual sleep and hands the stamp back
/// when it fires. A fire is honoured only if it carries the live stamp and the replica
/// is still in that view, so stale timers need no explicit cancellation.
#[derive(Debug)]
pub struct Pacemaker {
    config: PacemakerConfig,
    armed: Option<ViewStamp>,
}

impl Pacemaker {
    pub fn new(config: PacemakerConfig) -> Self {
        Self {
            config,
            armed: None,
        }
    }

    pub fn config(&self) -> &PacemakerConfig {
        &self.config
    }

    pub fn is_manual(&self) -> bool {
        self.config.manual_mode
    }

    pub fn armed(&self) -> Option<ViewStamp> {
        self.armed
    }

    /// Arms the view timer for `stamp`, superseding any earlier one.
    /// Returns the delay to schedule, or `None` while in manual mode.
    pub fn arm(&mut self, stamp: ViewStamp) -> Option<Duration> {
        if self.config.manual_mode {
            self.armed = None;
            return None;
        }
        self.armed = Some(stamp);
        Some(self.config.timeout)
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    /// Whether a timer stamped `fired` should force a view change, given the replica
    /// is currently at `current`. Consumes the armed timer when it does.
    pub fn on_timeout(&mut self, fired: ViewStamp, current: ViewStamp) -> bool {
        if self.armed != Some(fired) || fired != current {
            debug!("Ignoring stale timeout {} (now at {})", fired, current);
            return false;
        }
        self.armed = None;
        true
    }

    /// Flips manual mode and returns the new setting.
    pub fn toggle_manual_mode(&mut self) -> bool {
        self.config.manual_mode = !self.config.manual_mode;
        if self.config.manual_mode {
            self.armed = None;
        }
        info!("Pacemaker manual mode: {}", self.config.manual_mode);
        self.config.manual_mode
    }
}
