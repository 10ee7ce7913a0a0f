//! Device construction from declarative configuration.
//!
//! `[[devices]]` entries in the application config name a device and its driver kind;
//! [`build_control`] instantiates each one and assembles the [`Control`] surface.
//! Only the mock drivers are available, which keeps every acquisition path runnable
//! on a machine without hardware.
//!
//! ```toml
//! [[devices]]
//! name = "camera"
//! kind = "mock_camera"
//! width = 512
//! height = 512
//! px_len = 6.5
//!
//! [[devices]]
//! name = "filter"
//! kind = "mock_filter"
//! positions = ["DAPI", "GFP", "RFP"]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::hardware::capabilities::Device;
use crate::hardware::control::{Control, ControlError};
use crate::hardware::mock::{
    MockCamera, MockFilter, MockFocus, MockLight, MockObjective, MockStage, MockValves,
};

/// Hardware capabilities a device can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Captures frames
    Capture,
    /// Moves in XY
    Position,
    /// Moves in Z
    Focus,
    /// Has a configurable state
    State,
    /// Can be waited on
    Wait,
    /// Scales the image
    Zoom,
    /// Drives valves
    Valves,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Capture => "capture",
            Capability::Position => "position",
            Capability::Focus => "focus",
            Capability::State => "state",
            Capability::Wait => "wait",
            Capability::Zoom => "zoom",
            Capability::Valves => "valves",
        };
        f.write_str(name)
    }
}

/// Capabilities a device actually exposes.
pub fn capabilities(device: &dyn Device) -> Vec<Capability> {
    let mut caps = Vec::new();
    if device.as_capturable().is_some() {
        caps.push(Capability::Capture);
    }
    if device.as_positionable().is_some() {
        caps.push(Capability::Position);
    }
    if device.as_focusable().is_some() {
        caps.push(Capability::Focus);
    }
    if device.as_stateful().is_some() {
        caps.push(Capability::State);
    }
    if device.as_waitable().is_some() {
        caps.push(Capability::Wait);
    }
    if device.as_zoomable().is_some() {
        caps.push(Capability::Zoom);
    }
    if device.as_valved().is_some() {
        caps.push(Capability::Valves);
    }
    caps
}

fn default_frame_size() -> u32 {
    64
}

fn default_px_len() -> f64 {
    1.0
}

fn default_valve_count() -> usize {
    MockValves::DEFAULT_COUNT
}

/// Driver configuration, selected by the `kind` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverType {
    /// Pattern-generating camera
    MockCamera {
        /// Sensor width in pixels
        #[serde(default = "default_frame_size")]
        width: u32,
        /// Sensor height in pixels
        #[serde(default = "default_frame_size")]
        height: u32,
        /// Physical pixel size in stage units
        #[serde(default = "default_px_len")]
        px_len: f64,
        /// Simulated readout time
        #[serde(default, with = "humantime_serde")]
        readout: Option<Duration>,
    },

    /// XY stage
    MockStage {
        /// Initial position
        #[serde(default)]
        position: (f64, f64),
        /// Motion speed in stage units per second; instantaneous if absent
        #[serde(default)]
        speed: Option<f64>,
        /// Settling time observed by `wait`
        #[serde(default, with = "humantime_serde")]
        settle: Option<Duration>,
    },

    /// Z drive
    MockFocus,

    /// Filter wheel
    MockFilter {
        /// Slot names in order
        positions: Vec<String>,
    },

    /// Light source with an intensity attribute
    MockLight,

    /// Objective lens
    MockObjective {
        /// Magnification
        zoom: f64,
    },

    /// Valve bank
    MockValves {
        /// Number of valves
        #[serde(default = "default_valve_count")]
        count: usize,
        /// Valve names in index order
        #[serde(default)]
        names: Vec<String>,
    },
}

impl DriverType {
    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::MockCamera { .. } => "mock_camera",
            DriverType::MockStage { .. } => "mock_stage",
            DriverType::MockFocus => "mock_focus",
            DriverType::MockFilter { .. } => "mock_filter",
            DriverType::MockLight => "mock_light",
            DriverType::MockObjective { .. } => "mock_objective",
            DriverType::MockValves { .. } => "mock_valves",
        }
    }
}

/// A named device definition from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name, the key used in configuration trees
    pub name: String,
    /// Driver type and configuration
    #[serde(flatten)]
    pub driver: DriverType,
}

impl DeviceConfig {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, driver: DriverType) -> Self {
        Self {
            name: name.into(),
            driver,
        }
    }

    /// Instantiate the device.
    pub fn instantiate(&self) -> Arc<dyn Device> {
        let name = self.name.clone();
        match &self.driver {
            DriverType::MockCamera {
                width,
                height,
                px_len,
                readout,
            } => Arc::new(
                MockCamera::new(name, *width, *height)
                    .with_px_len(*px_len)
                    .with_readout(readout.unwrap_or_default()),
            ),
            DriverType::MockStage {
                position,
                speed,
                settle,
            } => {
                let mut stage = MockStage::new(name)
                    .with_position(position.0, position.1)
                    .with_settle(settle.unwrap_or_default());
                if let Some(speed) = speed {
                    stage = stage.with_speed(*speed);
                }
                Arc::new(stage)
            }
            DriverType::MockFocus => Arc::new(MockFocus::new(name)),
            DriverType::MockFilter { positions } => {
                let positions: Vec<&str> = positions.iter().map(String::as_str).collect();
                Arc::new(MockFilter::new(name, &positions))
            }
            DriverType::MockLight => Arc::new(MockLight::new(name)),
            DriverType::MockObjective { zoom } => Arc::new(MockObjective::new(name, *zoom)),
            DriverType::MockValves { count, names } => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                Arc::new(MockValves::new(name, *count).with_names(&names))
            }
        }
    }
}

/// Instantiate every configured device and assemble the control surface.
pub fn build_control(devices: &[DeviceConfig]) -> Result<Control, ControlError> {
    let mut instances = Vec::with_capacity(devices.len());
    for config in devices {
        let device = config.instantiate();
        let caps: Vec<String> = capabilities(device.as_ref())
            .iter()
            .map(ToString::to_string)
            .collect();
        info!(
            device = %config.name,
            driver = config.driver.driver_name(),
            capabilities = %caps.join(","),
            "Registered device"
        );
        instances.push(device);
    }
    Control::new(instances)
}

/// The default simulated microscope: camera, XY stage, focus, filter wheel, light,
/// objective and a 48-valve bank.
pub fn mock_microscope() -> Vec<DeviceConfig> {
    vec![
        DeviceConfig::new(
            "camera",
            DriverType::MockCamera {
                width: default_frame_size(),
                height: default_frame_size(),
                px_len: 6.5,
                readout: Some(Duration::from_millis(10)),
            },
        ),
        DeviceConfig::new(
            "stage",
            DriverType::MockStage {
                position: (0.0, 0.0),
                speed: None,
                settle: None,
            },
        ),
        DeviceConfig::new("focus", DriverType::MockFocus),
        DeviceConfig::new(
            "filter",
            DriverType::MockFilter {
                positions: vec!["DAPI".into(), "GFP".into(), "RFP".into()],
            },
        ),
        DeviceConfig::new("light", DriverType::MockLight),
        DeviceConfig::new("objective", DriverType::MockObjective { zoom: 10.0 }),
        DeviceConfig::new(
            "valves",
            DriverType::MockValves {
                count: MockValves::DEFAULT_COUNT,
                names: Vec::new(),
            },
        ),
    ]
}
