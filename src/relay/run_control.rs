//! Pause/resume/quit flags shared between the dispatch task and workers.
//!
//! `running` is a gate: set means proceed, cleared means pause. `quit` is terminal and
//! never cleared. Workers call [`RunControl::checkpoint`] before each unit of work; it
//! blocks while paused and fails with [`Cancelled`] once quit is set, including when
//! quit arrives during a pause.
//!
//! ```
//! use scope_daq::relay::{Cancelled, RunControl};
//!
//! # tokio_test::block_on(async {
//! let host = RunControl::new();
//! let run = host.child();
//! assert!(run.checkpoint().await.is_ok());
//!
//! run.quit();
//! assert_eq!(run.checkpoint().await, Err(Cancelled));
//! assert!(!host.is_quit());
//! # });
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Returned by cancellation-aware waits once quit has been requested.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Run cancelled")]
pub struct Cancelled;

/// Cloneable handle onto the run-control flags.
#[derive(Debug, Clone)]
pub struct RunControl {
    running: Arc<watch::Sender<bool>>,
    quit: CancellationToken,
    /// Only the handle that created the gate reopens it on quit
    owns_gate: bool,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// Flags in the initial state: running, not quit.
    pub fn new() -> Self {
        let (running, _) = watch::channel(true);
        Self {
            running: Arc::new(running),
            quit: CancellationToken::new(),
            owns_gate: true,
        }
    }

    /// A handle sharing this pause gate whose quit flag is set by this handle's quit
    /// but can also be set on its own, cancelling one run without quitting the host.
    ///
    /// Quitting the child leaves the shared gate alone: a paused host stays paused.
    pub fn child(&self) -> Self {
        Self {
            running: self.running.clone(),
            quit: self.quit.child_token(),
            owns_gate: false,
        }
    }

    /// Clear the running gate.
    pub fn pause(&self) {
        if !self.quit.is_cancelled() {
            self.running.send_replace(false);
        }
    }

    /// Set the running gate.
    pub fn resume(&self) {
        self.running.send_replace(true);
    }

    /// Set quit. The owning handle also sets the running gate so nothing stays
    /// blocked on it; a child's waiters are woken by its own quit flag. Idempotent.
    pub fn quit(&self) {
        self.quit.cancel();
        if self.owns_gate {
            self.running.send_replace(true);
        }
    }

    /// Whether the gate is cleared.
    pub fn is_paused(&self) -> bool {
        !*self.running.borrow()
    }

    /// Whether quit has been requested.
    pub fn is_quit(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Resolves once quit is requested.
    pub async fn cancelled(&self) {
        self.quit.cancelled().await
    }

    /// Block while paused, then fail if quit was requested.
    pub async fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.quit.is_cancelled() {
            return Err(Cancelled);
        }
        let mut gate = self.running.subscribe();
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => return Err(Cancelled),
            _ = gate.wait_for(|running| *running) => {}
        }
        if self.quit.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early on quit.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
