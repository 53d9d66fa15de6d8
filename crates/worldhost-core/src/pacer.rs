//! Tick pacing and the persistence schedule.
//!
//! [`TickPacer`] keeps the completion times of recent ticks inside a
//! sliding window and answers two questions after every tick: how fast the
//! loop is actually running, and how much time is left before the next
//! tick is due if the loop is to average the target period over the window.
//! That remaining time is the tick's *spare time*. It is positive when the
//! loop is ahead of schedule and negative when it is behind.
//!
//! [`PersistTimer`] is a restartable one-shot timer used for periodic syncs.

use std::collections::VecDeque;
use std::time::Duration;

/// Sliding-window tick rate measurement against a fixed target period.
#[derive(Debug, Clone)]
pub struct TickPacer {
    /// Desired time between ticks.
    target_period: Duration,

    /// How far back completion times are kept.
    window: Duration,

    /// Completion times of recent ticks, oldest first.
    ticks: VecDeque<Duration>,
}

impl TickPacer {
    /// Create a pacer. A zero window is widened to one target period.
    pub fn new(target_period: Duration, window: Duration) -> Self {
        Self {
            target_period,
            window: window.max(target_period),
            ticks: VecDeque::new(),
        }
    }

    /// Record a tick completed at `now` and drop samples older than the
    /// window. The newest sample is always kept.
    pub fn tick(&mut self, now: Duration) {
        self.ticks.push_back(now);
        let horizon = now.saturating_sub(self.window);
        while self.ticks.len() > 1 && self.ticks.front().is_some_and(|&t| t < horizon) {
            self.ticks.pop_front();
        }
    }

    /// Achieved ticks per second over the window, or `0.0` before two
    /// ticks have been recorded.
    pub fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.ticks.front(), self.ticks.back()) else {
            return 0.0;
        };
        let span = last.saturating_sub(*first).as_secs_f64();
        let intervals = self.ticks.len().saturating_sub(1);
        if intervals == 0 || span <= 0.0 {
            return 0.0;
        }
        f64::from(u32::try_from(intervals).unwrap_or(u32::MAX)) / span
    }

    /// Seconds until the next tick is due, as of the most recent tick.
    ///
    /// With `n` ticks in the window starting at `t0` and the latest at
    /// `t_last`, the next tick is due at `t0 + n * target_period`. The
    /// result is that due time minus `t_last`: one full target period when
    /// the loop is exactly on schedule, less when ticks have been running
    /// long, and negative once the window has fallen more than a period
    /// behind. Before any tick it is one target period.
    pub fn spare_time(&self) -> f64 {
        let Some((due, last)) = self.schedule() else {
            return self.target_period.as_secs_f64();
        };
        if due >= last {
            due.saturating_sub(last).as_secs_f64()
        } else {
            -last.saturating_sub(due).as_secs_f64()
        }
    }

    /// Positive spare time as a sleepable duration; `None` when the loop
    /// is on or behind schedule.
    pub fn spare_duration(&self) -> Option<Duration> {
        let spare = match self.schedule() {
            Some((due, last)) => due.saturating_sub(last),
            None => self.target_period,
        };
        (!spare.is_zero()).then_some(spare)
    }

    /// Due time of the next tick and completion time of the latest one.
    fn schedule(&self) -> Option<(Duration, Duration)> {
        let (first, last) = (self.ticks.front()?, self.ticks.back()?);
        let count = u32::try_from(self.ticks.len()).unwrap_or(u32::MAX);
        let due = self
            .target_period
            .checked_mul(count)
            .and_then(|span| first.checked_add(span))
            .unwrap_or(Duration::MAX);
        Some((due, *last))
    }
}

/// Restartable timer that reports when an interval has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistTimer {
    /// Time between firings.
    interval: Duration,

    /// When the current interval started.
    started_at: Duration,
}

impl PersistTimer {
    /// Start a timer at `now`.
    pub const fn new(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            started_at: now,
        }
    }

    /// Whether a full interval has elapsed since the last (re)start.
    pub fn time_up(&self, now: Duration) -> bool {
        now.saturating_sub(self.started_at) >= self.interval
    }

    /// Begin a new interval at `now`.
    pub const fn restart(&mut self, now: Duration) {
        self.started_at = now;
    }
}
