//! # scope_daq
//!
//! Tiled, scheduled image acquisition on a microscope control surface, with live
//! progress mirrored into a separate display process.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: Capability traits (`Capturable`, `Positionable`, `Stateful`, ...),
//!   the `Control` aggregate that dispatches over them, and mock devices.
//! - **`experiment`**: The acquisition plan, the grid builder, the schedule expander
//!   and the acquisition state machine that drives the control surface.
//! - **`data`**: The chunk-addressed array store (Zarr V3) that frames are written to
//!   and that the display process reopens read-only.
//! - **`relay`**: The host/display wire protocol, the display-side `Relay`, the
//!   `Supervisor` that owns the display process and serves routes, and `RunControl`
//!   for pause/resume/cancel.
//! - **`display`**: The headless display process entry point.
//! - **`config`** / **`telemetry`** / **`error`**: Configuration loading, tracing setup
//!   and the crate-level error type.

pub mod config;
pub mod data;
pub mod display;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod relay;
pub mod telemetry;
