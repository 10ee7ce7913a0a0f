//! Acquisition plans.
//!
//! A plan is a TOML document naming the array to write, where to acquire, and the
//! time/channel schedule:
//!
//! ```toml
//! name = "tiles"
//! overlap = 0.1
//!
//! [region]
//! top_left = [0.0, 0.0]
//! bottom_right = [1000.0, 800.0]
//!
//! [default_state]
//! "light.state" = false
//!
//! [times.baseline]
//! wait = "30s"
//! acquire = true
//!
//! [channels.dapi]
//! filter = "DAPI"
//! "light.state" = true
//! ```
//!
//! Without a `region` the run waits for the operator to pick a boundary or a list of
//! positions in the display. Table order is significant: it is the order of the stored
//! `time` and `channel` axes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, ScopeError};
use crate::experiment::grid::Region;
use crate::experiment::schedule::{ConfigTree, Schedule, ScheduleError};

fn default_name() -> String {
    "acquisition".to_string()
}

/// A complete acquisition description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionSpec {
    /// Name of the stored array group
    #[serde(default = "default_name")]
    pub name: String,

    /// Region to acquire; chosen interactively when absent
    #[serde(default)]
    pub region: Option<Region>,

    /// Fractional tile overlap in [0, 1); requires a boundary region
    #[serde(default)]
    pub overlap: Option<f64>,

    /// Time entries: label -> device overrides plus `wait` and `acquire`
    #[serde(default)]
    pub times: ConfigTree,

    /// Channels: label -> device overrides
    #[serde(default)]
    pub channels: ConfigTree,

    /// Baseline configuration restored between steps
    #[serde(default)]
    pub default_state: ConfigTree,
}

impl Default for AcquisitionSpec {
    fn default() -> Self {
        Self {
            name: default_name(),
            region: None,
            overlap: None,
            times: ConfigTree::new(),
            channels: ConfigTree::new(),
            default_state: ConfigTree::new(),
        }
    }
}

impl AcquisitionSpec {
    /// Parse and validate a plan from TOML text.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let spec: Self = toml::from_str(text)?;
        spec.validate().map_err(ScopeError::Configuration)?;
        Ok(spec)
    }

    /// Load and validate a plan file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check invariants that do not depend on hardware.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty()
            || self.name.starts_with('.')
            || self.name.starts_with("__")
            || self.name.contains(['/', '\\'])
        {
            return Err(format!("'{}' is not a valid array name", self.name));
        }

        if let Some(overlap) = self.overlap {
            if !(0.0..1.0).contains(&overlap) {
                return Err(format!("overlap must be within [0, 1), got {overlap}"));
            }
            if matches!(self.region, Some(Region::Positions { .. })) {
                return Err("overlap requires a top_left/bottom_right region".to_string());
            }
        }

        if let Some(Region::Positions { positions }) = &self.region {
            if positions.is_empty() {
                return Err("positions must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Whether the operator must supply the region before the run can start.
    pub fn needs_region(&self) -> bool {
        self.region.is_none()
    }

    /// Expand the time and channel tables.
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::expand(&self.times, &self.channels, &self.default_state)
    }
}
