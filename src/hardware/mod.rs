//! Control-surface abstractions.
//!
//! Devices advertise what they can do through the capability traits in
//! [`capabilities`]; [`control::Control`] aggregates a set of devices and exposes the
//! microscope-level operations (snap, move, wait, apply a configuration) that the
//! acquisition engine drives.

pub mod capabilities;
pub mod control;
pub mod mock;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use capabilities::{
    Capturable, Device, Focusable, Positionable, StateValue, Stateful, ValveKey, ValveState,
    Valved, Waitable, Zoomable,
};
pub use control::Control;

/// A single 16-bit camera frame in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data, `width * height` values
    pub buffer: Vec<u16>,
}

impl Frame {
    /// Create a frame from raw pixel data.
    pub fn new(width: u32, height: u32, buffer: Vec<u16>) -> Self {
        Self {
            width,
            height,
            buffer,
        }
    }

    /// A frame filled with zeros, the store's "not yet written" value.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0; width as usize * height as usize])
    }

    /// `(height, width)`, the order the frame axes take in stored arrays.
    pub fn shape(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// Whether the buffer length matches the declared dimensions.
    pub fn is_consistent(&self) -> bool {
        self.buffer.len() == self.width as usize * self.height as usize
    }

    /// Minimum and maximum pixel values, used for display auto-contrast.
    pub fn min_max(&self) -> Option<(u16, u16)> {
        let mut iter = self.buffer.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.buffer.is_empty() {
            return 0.0;
        }
        self.buffer.iter().map(|&v| v as f64).sum::<f64>() / self.buffer.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_and_mean() {
        let frame = Frame::new(2, 2, vec![4, 1, 9, 2]);
        assert_eq!(frame.min_max(), Some((1, 9)));
        assert_eq!(frame.mean(), 4.0);
        assert_eq!(frame.shape(), (2, 2));
        assert!(frame.is_consistent());
    }

    #[test]
    fn empty_frame_has_no_contrast() {
        let frame = Frame::new(0, 0, vec![]);
        assert_eq!(frame.min_max(), None);
        assert_eq!(frame.mean(), 0.0);
    }
}
