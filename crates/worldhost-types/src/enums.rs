//! Enumeration types shared between the driver and its collaborators.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a fidelity name does not match any known level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fidelity level: {name}")]
pub struct ParseFidelityError {
    /// The name that failed to parse.
    pub name: String,
}

// ---------------------------------------------------------------------------
// Fidelity
// ---------------------------------------------------------------------------

/// Simulation detail level, traded against tick cost.
///
/// Levels are totally ordered from [`Fidelity::Minimum`] to
/// [`Fidelity::High`]. Stepping past either end saturates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Fidelity {
    /// Only what is needed to keep clients connected.
    Minimum,
    /// Reduced detail.
    Low,
    /// Default detail, and the starting level in automatic mode.
    #[default]
    Medium,
    /// Full detail.
    High,
}

impl Fidelity {
    /// Every level, lowest first.
    pub const ALL: [Self; 4] = [Self::Minimum, Self::Low, Self::Medium, Self::High];

    /// The next lower level, or `self` at [`Fidelity::Minimum`].
    pub const fn lower(self) -> Self {
        match self {
            Self::Minimum | Self::Low => Self::Minimum,
            Self::Medium => Self::Low,
            Self::High => Self::Medium,
        }
    }

    /// The next higher level, or `self` at [`Fidelity::High`].
    pub const fn higher(self) -> Self {
        match self {
            Self::Minimum => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }

    /// Lowercase name used in configuration and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Minimum => "minimum",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Fidelity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Fidelity {
    type Err = ParseFidelityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseFidelityError { name: s.to_owned() })
    }
}

// ---------------------------------------------------------------------------
// Fidelity mode
// ---------------------------------------------------------------------------

/// How the driver chooses the fidelity for each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FidelityMode {
    /// The configured level is used verbatim every tick.
    Locked(Fidelity),
    /// The adaptive controller picks the level from observed spare time.
    #[default]
    Automatic,
}

impl fmt::Display for FidelityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked(level) => write!(f, "{level}"),
            Self::Automatic => f.write_str("automatic"),
        }
    }
}

impl FromStr for FidelityMode {
    type Err = ParseFidelityError;

    /// Accepts `"automatic"` or a level name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("automatic") {
            return Ok(Self::Automatic);
        }
        s.parse().map(Self::Locked)
    }
}
