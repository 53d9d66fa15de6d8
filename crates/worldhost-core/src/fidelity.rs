//! Adaptive fidelity control.
//!
//! [`FidelityController`] maps observed spare tick time to a discrete
//! [`Fidelity`] level. It is a hysteresis controller: spare time (negative
//! when a tick overran its budget) accumulates into a score, and the level
//! moves a single step only when the score crosses one of two thresholds.
//! The score resets to zero on every crossing and at no other time.
//!
//! In [`FidelityMode::Locked`] the controller never changes anything and
//! the configured level is reported verbatim.

use worldhost_types::{Fidelity, FidelityMode};

/// Adaptive fidelity state for one world.
#[derive(Debug, Clone, PartialEq)]
pub struct FidelityController {
    /// Locked level or automatic selection.
    mode: FidelityMode,

    /// Level chosen by the controller in automatic mode.
    automatic: Fidelity,

    /// Accumulated spare time since the last threshold crossing, in seconds.
    score: f64,

    /// Score at or below which the level drops. Always `<= 0`.
    decrement_threshold: f64,

    /// Score at or above which the level rises. Always `>= 0`.
    increment_threshold: f64,
}

impl FidelityController {
    /// Create a controller. Automatic mode starts at [`Fidelity::Medium`].
    ///
    /// Thresholds on the wrong side of zero are clamped to zero.
    pub fn new(mode: FidelityMode, decrement_threshold: f64, increment_threshold: f64) -> Self {
        Self {
            mode,
            automatic: Fidelity::Medium,
            score: 0.0,
            decrement_threshold: decrement_threshold.min(0.0),
            increment_threshold: increment_threshold.max(0.0),
        }
    }

    /// The fidelity to use for the next tick.
    pub const fn current(&self) -> Fidelity {
        match self.mode {
            FidelityMode::Locked(level) => level,
            FidelityMode::Automatic => self.automatic,
        }
    }

    /// Accumulated score since the last threshold crossing.
    pub const fn score(&self) -> f64 {
        self.score
    }

    /// Feed one tick's spare time (seconds, negative when behind) and
    /// return the fidelity for the next tick.
    ///
    /// Non-finite samples are ignored.
    pub fn record(&mut self, spare_time: f64) -> Fidelity {
        if self.mode != FidelityMode::Automatic || !spare_time.is_finite() {
            return self.current();
        }

        self.score += spare_time;

        if self.score <= self.decrement_threshold {
            self.automatic = self.automatic.lower();
            self.score = 0.0;
        } else if self.score >= self.increment_threshold {
            self.automatic = self.automatic.higher();
            self.score = 0.0;
        }

        self.automatic
    }
}
