//! Custom error types for the application.
//!
//! Each subsystem owns a `thiserror` enum for the failures its callers need to tell
//! apart (`StoreError::AlreadyExists` versus plain I/O, `RelayError::Closed` versus a
//! codec failure). `ScopeError` consolidates them for the binary and for callers that
//! only need to report, with `#[from]` conversions so `?` works across layers.
//!
//! Device and capability code returns `anyhow::Result` so that the underlying driver
//! error reaches the caller unchanged.

use thiserror::Error;

pub use crate::data::store::StoreError;
pub use crate::experiment::grid::GridError;
pub use crate::experiment::schedule::ScheduleError;
pub use crate::hardware::control::ControlError;
pub use crate::relay::RelayError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Failed to parse acquisition plan: {0}")]
    Plan(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("Acquisition failed: {0}")]
    Acquisition(#[source] anyhow::Error),
}

impl ScopeError {
    /// Whether the error came from the relay transport closing, which the host
    /// treats as the display process exiting rather than as a failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ScopeError::Relay(err) if err.is_disconnect())
    }
}
