//! Acquisition planning and execution.
//!
//! - [`plan`]: the TOML acquisition plan
//! - [`grid`]: region and overlap to stage positions
//! - [`schedule`]: time and channel tables to ordered device configurations
//! - [`engine`]: the state machine that drives the control surface through a plan
//! - [`state`]: lifecycle states and the progress snapshot served to the display

pub mod engine;
pub mod grid;
pub mod plan;
pub mod schedule;
pub mod state;

pub use engine::{Acquisition, AcquisitionEvent, FrameRecord, LiveView, RetryPolicy};
pub use grid::{Boundary, Region, Tile, TileGrid, TileIndex};
pub use plan::AcquisitionSpec;
pub use schedule::{ConfigTree, Schedule};
pub use state::{AcquisitionState, AcquisitionStatus};
