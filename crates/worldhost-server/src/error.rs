//! Error types for the host binary.
//!
//! [`HostError`] covers the failures that end the host process. Faults
//! inside a world never surface here; the supervisor handles them.

/// Top-level error for the host binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: worldhost_core::config::ConfigError,
    },

    /// The synthetic traffic thread could not be started or panicked.
    #[error("traffic error: {message}")]
    Traffic {
        /// Description of the traffic failure.
        message: String,
    },
}
