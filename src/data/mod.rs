//! Persistent frame storage.
//!
//! [`store::ArrayStore`] writes frames into named, chunk-addressed Zarr arrays and is
//! reopened read-only by the display process.

pub mod store;

pub use store::{ArrayMetadata, ArrayStore, AxisSpec, StoreError};
