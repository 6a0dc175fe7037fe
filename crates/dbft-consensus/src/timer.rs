use dbft_primitives::{Height, View};
use std::time::Duration;
use tokio::time::Instant;

/// Single cancellable delayed-event source.
///
/// The timer holds at most one deadline, stamped with the `(height, view)`
/// it was armed for. Scheduling replaces any prior deadline, so exclusivity
/// holds by construction. The driver loop sleeps on the deadline and posts a
/// tick carrying the stamp; a tick whose stamp no longer matches the live
/// round is stale and must be dropped.
#[derive(Debug)]
pub struct Timer {
    deadline: Instant,
    height: Height,
    view: View,
    armed: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            deadline: Instant::now(),
            height: 0,
            view: 0,
            armed: false,
        }
    }

    /// Arms the timer `delay` from now for the given round, cancelling any
    /// previously scheduled tick.
    pub fn schedule(&mut self, delay: Duration, height: Height, view: View) {
        self.deadline = Instant::now() + delay;
        self.height = height;
        self.view = view;
        self.armed = true;
        tracing::debug!(height, view, delay_ms = delay.as_millis() as u64, "timer armed");
    }

    /// Cancels the pending tick, if any.
    pub fn disarm(&mut self) {
        if self.armed {
            tracing::debug!(height = self.height, view = self.view, "timer disarmed");
        }
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The round the pending tick belongs to.
    pub fn stamp(&self) -> (Height, View) {
        (self.height, self.view)
    }

    /// True when an armed tick targets exactly this round.
    pub fn matches(&self, height: Height, view: View) -> bool {
        self.armed && self.height == height && self.view == view
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
