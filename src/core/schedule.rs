use std::time::{Duration, Instant};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);

/// Decides on which animation frames clustering should be recomputed.
///
/// Requests between two frames coalesce into one run. While a pan or zoom
/// gesture is in progress every frame runs. When the gesture ends one more run
/// is armed `settle_delay` later to correct positions projected mid-animation.
#[derive(Debug, Clone)]
pub struct RecomputeScheduler {
    settle_delay: Duration,
    pending: bool,
    gesture_active: bool,
    settle_at: Option<Instant>,
    runs: u64,
}

impl RecomputeScheduler {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            pending: false,
            gesture_active: false,
            settle_at: None,
            runs: 0,
        }
    }

    /// Point set changed, or a discrete pan/zoom happened.
    pub fn request(&mut self) {
        self.pending = true;
    }

    pub fn gesture_started(&mut self) {
        self.gesture_active = true;
        self.settle_at = None;
    }

    pub fn gesture_ended(&mut self, now: Instant) {
        self.gesture_active = false;
        self.pending = true;
        self.settle_at = Some(now + self.settle_delay);
    }

    /// Called once per animation frame; `true` means recompute now.
    pub fn on_frame(&mut self, now: Instant) -> bool {
        let settle_due = self.settle_at.is_some_and(|at| now >= at);
        if settle_due {
            self.settle_at = None;
        }

        let run = self.gesture_active || self.pending || settle_due;
        if run {
            self.pending = false;
            self.runs += 1;
        }
        run
    }

    /// A settle pass is armed but not yet due.
    pub fn is_settling(&self) -> bool {
        self.settle_at.is_some()
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }
}

impl Default for RecomputeScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_DELAY)
    }
}
