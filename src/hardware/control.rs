//! The microscope control surface.
//!
//! `Control` owns the device set and routes microscope-level operations to whichever
//! device exposes the matching capability: the first capturable device is the camera,
//! the first positionable one the XY stage, the first focusable one the focus drive.
//! Readiness waits on every waitable device and the effective pixel size accounts for
//! every zoom element in the light path.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::experiment::schedule::ConfigTree;
use crate::hardware::capabilities::{
    Capturable, Device, Focusable, Positionable, StateValue, ValveKey, ValveState, Valved,
};
use crate::hardware::Frame;

/// Failures resolving a device or capability on the control surface.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{0}' is defined more than once")]
    DuplicateDevice(String),

    #[error("Device '{device}' does not support {capability}")]
    MissingCapability {
        device: String,
        capability: &'static str,
    },

    #[error("No {0} device on the control surface")]
    NoDevice(&'static str),

    #[error("Invalid configuration for device '{device}': {reason}")]
    InvalidConfig { device: String, reason: String },
}

/// One valve as reported to the display.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ValveEntry {
    /// Position in the bank
    pub index: usize,
    /// Configured name, if any
    pub name: Option<String>,
    /// Current output state
    pub state: ValveState,
}

/// Aggregate of all devices on the microscope.
pub struct Control {
    devices: Vec<Arc<dyn Device>>,
    camera: Option<usize>,
    stage: Option<usize>,
    focus: Option<usize>,
}

impl Control {
    /// Build a control surface, picking the first device of each kind as the active
    /// camera, stage and focus drive.
    pub fn new(devices: Vec<Arc<dyn Device>>) -> Result<Self, ControlError> {
        for (i, device) in devices.iter().enumerate() {
            if devices[..i].iter().any(|d| d.name() == device.name()) {
                return Err(ControlError::DuplicateDevice(device.name().to_string()));
            }
        }

        let camera = devices.iter().position(|d| d.as_capturable().is_some());
        let stage = devices.iter().position(|d| d.as_positionable().is_some());
        let focus = devices.iter().position(|d| d.as_focusable().is_some());

        debug!(
            devices = devices.len(),
            camera = camera.map(|i| devices[i].name()),
            stage = stage.map(|i| devices[i].name()),
            focus = focus.map(|i| devices[i].name()),
            "Control surface assembled"
        );

        Ok(Self {
            devices,
            camera,
            stage,
            focus,
        })
    }

    /// Names of all devices, in definition order.
    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name()).collect()
    }

    /// Look up a device by name.
    pub fn device(&self, name: &str) -> Result<&Arc<dyn Device>, ControlError> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| ControlError::UnknownDevice(name.to_string()))
    }

    fn index_of(&self, name: &str) -> Result<usize, ControlError> {
        self.devices
            .iter()
            .position(|d| d.name() == name)
            .ok_or_else(|| ControlError::UnknownDevice(name.to_string()))
    }

    /// Make `name` the active camera.
    pub fn select_camera(&mut self, name: &str) -> Result<(), ControlError> {
        let index = self.index_of(name)?;
        self.require(index, "capture", |d| d.as_capturable().is_some())?;
        self.camera = Some(index);
        Ok(())
    }

    /// Make `name` the active XY stage.
    pub fn select_stage(&mut self, name: &str) -> Result<(), ControlError> {
        let index = self.index_of(name)?;
        self.require(index, "XY positioning", |d| d.as_positionable().is_some())?;
        self.stage = Some(index);
        Ok(())
    }

    /// Make `name` the active focus drive.
    pub fn select_focus(&mut self, name: &str) -> Result<(), ControlError> {
        let index = self.index_of(name)?;
        self.require(index, "focus", |d| d.as_focusable().is_some())?;
        self.focus = Some(index);
        Ok(())
    }

    fn require(
        &self,
        index: usize,
        capability: &'static str,
        has: impl Fn(&dyn Device) -> bool,
    ) -> Result<(), ControlError> {
        let device = &self.devices[index];
        if has(device.as_ref()) {
            Ok(())
        } else {
            Err(ControlError::MissingCapability {
                device: device.name().to_string(),
                capability,
            })
        }
    }

    /// The active camera.
    pub fn camera(&self) -> Result<&dyn Capturable, ControlError> {
        self.camera
            .and_then(|i| self.devices[i].as_capturable())
            .ok_or(ControlError::NoDevice("camera"))
    }

    /// The active XY stage.
    pub fn stage(&self) -> Result<&dyn Positionable, ControlError> {
        self.stage
            .and_then(|i| self.devices[i].as_positionable())
            .ok_or(ControlError::NoDevice("stage"))
    }

    /// The active focus drive.
    pub fn focus(&self) -> Result<&dyn Focusable, ControlError> {
        self.focus
            .and_then(|i| self.devices[i].as_focusable())
            .ok_or(ControlError::NoDevice("focus"))
    }

    /// The first valve bank.
    pub fn valves(&self) -> Result<&dyn Valved, ControlError> {
        self.devices
            .iter()
            .find_map(|d| d.as_valved())
            .ok_or(ControlError::NoDevice("valve"))
    }

    /// Capture one frame with the active camera.
    pub async fn snap(&self) -> Result<Frame> {
        Ok(self.camera()?.snap().await?)
    }

    /// Wait until every device that can be busy reports idle.
    pub async fn wait(&self) -> Result<()> {
        for waitable in self.devices.iter().filter_map(|d| d.as_waitable()) {
            waitable.wait().await?;
        }
        Ok(())
    }

    /// Effective pixel size: the camera pixel size divided by every zoom factor.
    pub fn px_len(&self) -> Result<f64, ControlError> {
        let camera = self.camera()?.px_len();
        let zoom: f64 = self
            .devices
            .iter()
            .filter_map(|d| d.as_zoomable())
            .map(|z| z.zoom())
            .product();
        Ok(camera / zoom)
    }

    /// Current stage position.
    pub async fn xy(&self) -> Result<(f64, f64)> {
        Ok(self.stage()?.xy().await?)
    }

    /// Move the stage. Does not wait for the move to complete.
    pub async fn set_xy(&self, x: f64, y: f64) -> Result<()> {
        Ok(self.stage()?.set_xy(x, y).await?)
    }

    /// Current focus position.
    pub async fn z(&self) -> Result<f64> {
        Ok(self.focus()?.z().await?)
    }

    /// Move the focus drive.
    pub async fn set_z(&self, z: f64) -> Result<()> {
        Ok(self.focus()?.set_z(z).await?)
    }

    /// State of the named device.
    pub async fn state(&self, name: &str) -> Result<StateValue> {
        let device = self.device(name)?;
        let stateful = device
            .as_stateful()
            .ok_or_else(|| ControlError::MissingCapability {
                device: name.to_string(),
                capability: "state",
            })?;
        stateful.state().await
    }

    /// Set the state of the named device.
    pub async fn set_state(&self, name: &str, value: StateValue) -> Result<()> {
        let device = self.device(name)?;
        let stateful = device
            .as_stateful()
            .ok_or_else(|| ControlError::MissingCapability {
                device: name.to_string(),
                capability: "state",
            })?;
        stateful.set_state(value).await
    }

    /// States of every stateful device, in definition order.
    pub async fn device_states(&self) -> Result<Vec<(String, StateValue)>> {
        let mut states = Vec::new();
        for device in &self.devices {
            if let Some(stateful) = device.as_stateful() {
                states.push((device.name().to_string(), stateful.state().await?));
            }
        }
        Ok(states)
    }

    /// States of every valve in the first valve bank.
    pub async fn valve_states(&self) -> Result<Vec<ValveEntry>> {
        let valves = self.valves()?;
        let mut entries = Vec::with_capacity(valves.len());
        for index in 0..valves.len() {
            entries.push(ValveEntry {
                index,
                name: valves.valve_name(index).map(str::to_string),
                state: valves.valve(&ValveKey::Index(index)).await?,
            });
        }
        Ok(entries)
    }

    /// Set one valve in the first valve bank.
    pub async fn set_valve(&self, key: &ValveKey, state: ValveState) -> Result<()> {
        self.valves()?.set_valve(key, state).await
    }

    /// Apply a configuration tree.
    ///
    /// Top-level keys name devices. A leaf value sets the device state; a nested map
    /// sets named device attributes. Keys are applied in tree order.
    #[instrument(skip_all, fields(devices = config.len()))]
    pub async fn apply(&self, config: &ConfigTree) -> Result<()> {
        for (name, value) in config {
            let device = self.device(name)?;
            let stateful = device
                .as_stateful()
                .ok_or_else(|| ControlError::MissingCapability {
                    device: name.clone(),
                    capability: "state",
                })?;

            match value {
                serde_json::Value::Object(attributes) => {
                    for (attribute, value) in attributes {
                        let value = leaf_state(name, value)?;
                        stateful.set_attribute(attribute, value).await?;
                    }
                }
                leaf => stateful.set_state(leaf_state(name, leaf)?).await?,
            }
        }
        Ok(())
    }
}

fn leaf_state(device: &str, value: &serde_json::Value) -> Result<StateValue, ControlError> {
    StateValue::from_json(value).ok_or_else(|| ControlError::InvalidConfig {
        device: device.to_string(),
        reason: format!("{value} is not a device state"),
    })
}
