//! Host/display relay.
//!
//! The host (acquisition) process owns a [`supervisor::Supervisor`] that spawns the
//! display process and serves named routes over the child's stdin/stdout. The display
//! side talks back through a [`client::Relay`]:
//!
//! - `get`: send a request, block for exactly one reply
//! - `post`: send a request, expect no reply
//! - `poll`: `get` on a fixed period, handing each reply to a callback
//!
//! Routes are typed ([`routes::GetRoute`], [`routes::PostRoute`]); the string-keyed
//! table behind them is internal to the supervisor.

pub mod client;
pub mod protocol;
pub mod routes;
pub mod run_control;
pub mod supervisor;

use thiserror::Error;

pub use client::Relay;
pub use routes::{GetRoute, PostRoute, Route};
pub use run_control::{Cancelled, RunControl};
pub use supervisor::{DisplayLauncher, Supervisor};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay channel closed")]
    Closed,

    #[error("Unknown route '{0}'")]
    UnknownRoute(String),

    #[error("Route '{0}' is registered twice")]
    DuplicateRoute(String),

    #[error("Routes cannot be registered after the supervisor has started")]
    AlreadyStarted,

    #[error("Supervisor has no display to talk to")]
    NoTransport,

    #[error("Message of {0} bytes exceeds the size limit")]
    MessageTooLarge(usize),

    #[error("Message encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Route '{route}' failed: {source}")]
    Handler {
        route: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RelayError {
    /// Whether the error means the other side went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RelayError::Closed => true,
            RelayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(RelayError::Closed.is_disconnect());
        assert!(RelayError::Io(std::io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!RelayError::Io(std::io::ErrorKind::PermissionDenied.into()).is_disconnect());
        assert!(!RelayError::UnknownRoute("x".into()).is_disconnect());
    }
}
