//! Driver lifecycle state.
//!
//! ```text
//! Stopped --start--> Running --stop--> Stopped
//!                       |
//!                     fault
//!                       v
//!                    Faulted --start--> Running
//! ```
//!
//! `Faulted` is a latch: only an explicit [`StatusCell::begin_running`]
//! (issued by `start`) leaves it. A stop never clears it.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a world driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    /// No loop is running. The driver can be started.
    Stopped,
    /// The tick loop is running.
    Running,
    /// An unrecoverable failure occurred. Restart to continue.
    Faulted,
}

impl DriverState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Faulted => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Faulted,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Atomically updated [`DriverState`], readable without any lock.
#[derive(Debug)]
pub struct StatusCell {
    /// Encoded [`DriverState`].
    state: AtomicU8,
}

impl StatusCell {
    /// Create a cell in [`DriverState::Stopped`].
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(DriverState::Stopped.to_u8()),
        }
    }

    /// Current state.
    pub fn get(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Enter `Running` from any state. This is the only way out of
    /// `Faulted`.
    pub fn begin_running(&self) {
        self.state
            .store(DriverState::Running.to_u8(), Ordering::Release);
    }

    /// Move `Running` to `Stopped`. A fault is left in place. Returns the
    /// state after the call.
    pub fn mark_stopped(&self) -> DriverState {
        match self.state.compare_exchange(
            DriverState::Running.to_u8(),
            DriverState::Stopped.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => DriverState::Stopped,
            Err(current) => DriverState::from_u8(current),
        }
    }

    /// Latch `Faulted`. Returns `true` if this call set the latch.
    pub fn latch_fault(&self) -> bool {
        self.state
            .swap(DriverState::Faulted.to_u8(), Ordering::AcqRel)
            != DriverState::Faulted.to_u8()
    }

    /// Whether the fault latch is set.
    pub fn is_faulted(&self) -> bool {
        self.get() == DriverState::Faulted
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
