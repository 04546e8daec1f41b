//! Timed observation window.
//!
//! The window is anchored to the moment the app was seen running, not to the
//! moment [`ObservationScheduler::wait`] is called: setup work done between
//! launch and the wait eats into the window instead of extending it.

use crate::cancel::CancelToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Source of wall-clock time and blocking sleeps.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Time elapsed since `anchor`, zero if the anchor is in the future.
pub fn elapsed_since(clock: &dyn Clock, anchor: DateTime<Utc>) -> Duration {
    (clock.now() - anchor).to_std().unwrap_or(Duration::ZERO)
}

/// Observation window `{anchor, duration}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationWindow {
    pub anchor: DateTime<Utc>,
    #[serde(with = "crate::exec::duration_ms")]
    pub duration: Duration,
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The window elapsed.
    Elapsed { blocked: Duration },
    /// The cancellation token fired first.
    Cancelled { blocked: Duration },
}

impl WaitOutcome {
    pub fn blocked(&self) -> Duration {
        match self {
            WaitOutcome::Elapsed { blocked } | WaitOutcome::Cancelled { blocked } => *blocked,
        }
    }
}

/// Blocks until an observation window anchored in the past has elapsed.
pub struct ObservationScheduler<'a> {
    clock: &'a dyn Clock,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl<'a> ObservationScheduler<'a> {
    pub fn new(clock: &'a dyn Clock, poll_interval: Duration, cancel: CancelToken) -> Self {
        Self {
            clock,
            poll_interval,
            cancel,
        }
    }

    /// Block until `window.duration` has passed since `window.anchor`.
    ///
    /// Elapsed time is recomputed from the anchor after every sleep, and each
    /// sleep is capped at the remaining time, so a wait entered at
    /// `anchor + d` blocks for `duration - d` (or not at all once `d` reaches
    /// the duration).
    pub fn wait(&self, window: ObservationWindow) -> WaitOutcome {
        let entered = self.clock.now();
        let blocked = || (self.clock.now() - entered).to_std().unwrap_or(Duration::ZERO);

        debug!(
            anchor = %window.anchor,
            duration_ms = window.duration.as_millis() as u64,
            already_elapsed_ms = elapsed_since(self.clock, window.anchor).as_millis() as u64,
            "observation window"
        );

        loop {
            if self.cancel.is_cancelled() {
                return WaitOutcome::Cancelled { blocked: blocked() };
            }

            let elapsed = elapsed_since(self.clock, window.anchor);
            if elapsed >= window.duration {
                return WaitOutcome::Elapsed { blocked: blocked() };
            }

            let remaining = window.duration - elapsed;
            let step = remaining.min(self.poll_interval);
            trace!(remaining_ms = remaining.as_millis() as u64, "observing");
            self.clock.sleep(step);
        }
    }
}
