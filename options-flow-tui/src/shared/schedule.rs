//! Cooperative timing primitives polled from the UI loop.
//!
//! Nothing here spawns timers: the loop passes the current `Instant` in and acts on the
//! answer, which keeps every mutation on the task that owns the session.

use std::time::{Duration, Instant};

/// Cancel-and-reschedule debounce.
///
/// Each `trigger` pushes the deadline out by `delay`; `poll` fires once the burst has
/// been quiet for `delay` and then disarms.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true exactly once per quiet burst
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Leading-edge throttle: allows an action at most once per `interval`.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.last_fired
            .map(|t| now.saturating_duration_since(t) >= self.interval)
            .unwrap_or(true)
    }

    /// Fire if the interval has elapsed, recording the attempt
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.ready(now) {
            self.last_fired = Some(now);
            true
        } else {
            false
        }
    }

    /// Record an out-of-band firing (e.g. a forced redraw) so the next throttled one waits
    pub fn mark(&mut self, now: Instant) {
        self.last_fired = Some(now);
    }
}

/// Why a redraw was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawReason {
    /// New samples from the push source, batched by the throttle
    Data,
    /// Terminal resized
    Resize,
    /// Pointer moved over the chart
    Hover,
    /// Explicit full-history reload
    Reload,
}

/// Batches data-driven redraws while letting interactive ones through immediately.
#[derive(Debug, Clone)]
pub struct RedrawScheduler {
    throttle: Throttle,
    dirty: bool,
    forced: bool,
}

impl RedrawScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            throttle: Throttle::new(interval),
            dirty: false,
            forced: false,
        }
    }

    pub fn request(&mut self, reason: RedrawReason) {
        match reason {
            RedrawReason::Data => self.dirty = true,
            RedrawReason::Resize | RedrawReason::Hover | RedrawReason::Reload => self.forced = true,
        }
    }

    /// Returns true when the caller should repaint now
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.forced {
            self.forced = false;
            self.dirty = false;
            self.throttle.mark(now);
            return true;
        }

        if self.dirty && self.throttle.try_fire(now) {
            self.dirty = false;
            return true;
        }

        false
    }
}
