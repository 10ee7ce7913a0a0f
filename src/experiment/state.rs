//! Acquisition lifecycle state.

use serde::{Deserialize, Serialize};

/// Acquisition execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──region known──────────────────> Running ──> Done
///   │                                      ▲  │
///   └─region needed─> AwaitingPosition ────┘  ├────> Cancelled
///                         │                   │
///                         └───────────────────┴────> Failed
/// ```
///
/// `AwaitingPosition -> Running` fires at most once, when the operator submits a
/// boundary or a position list. Pausing does not change the state; it is reported
/// separately in [`AcquisitionStatus::paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Not started
    Idle,
    /// Streaming live frames until the operator picks a region
    AwaitingPosition,
    /// Executing the schedule
    Running,
    /// Every frame was written
    Done,
    /// Stopped early by cancellation; written chunks remain valid
    Cancelled,
    /// Stopped by an error
    Failed,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::AwaitingPosition => write!(f, "AwaitingPosition"),
            AcquisitionState::Running => write!(f, "Running"),
            AcquisitionState::Done => write!(f, "Done"),
            AcquisitionState::Cancelled => write!(f, "Cancelled"),
            AcquisitionState::Failed => write!(f, "Failed"),
        }
    }
}

impl AcquisitionState {
    /// Check if the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AcquisitionState::Done | AcquisitionState::Cancelled | AcquisitionState::Failed
        )
    }

    /// Check if the state accepts an operator-chosen region.
    pub fn accepts_region(&self) -> bool {
        matches!(self, AcquisitionState::AwaitingPosition)
    }
}

/// Progress snapshot served to the display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStatus {
    /// Lifecycle state
    pub state: AcquisitionState,
    /// Whether the run is currently paused
    pub paused: bool,
    /// Frames written so far
    pub frames_written: u64,
    /// Time entries completed, settle-only ones included
    pub heartbeats: u64,
    /// Frames the schedule will produce, once known
    pub frames_expected: Option<u64>,
    /// Name of the array being written, once declared
    pub array: Option<String>,
    /// Error that ended the run, if it failed
    pub last_error: Option<String>,
}

impl Default for AcquisitionStatus {
    fn default() -> Self {
        Self {
            state: AcquisitionState::Idle,
            paused: false,
            frames_written: 0,
            heartbeats: 0,
            frames_expected: None,
            array: None,
            last_error: None,
        }
    }
}

impl AcquisitionStatus {
    /// Fraction of expected frames written, if the total is known.
    pub fn progress(&self) -> Option<f64> {
        match self.frames_expected {
            Some(0) => Some(1.0),
            Some(total) => Some(self.frames_written as f64 / total as f64),
            None => None,
        }
    }
}
