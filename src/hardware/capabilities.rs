//! Atomic Hardware Capabilities
//!
//! Devices implement only the capabilities they actually support:
//!
//! - A camera implements `Capturable` (and usually `Waitable`)
//! - An XY stage implements `Positionable + Waitable`
//! - A filter wheel implements `Stateful + Waitable`
//! - A valve bank implements `Valved`
//!
//! Code that needs "something that can snap" asks a [`Device`] for that capability
//! through its `as_*` accessors instead of probing for attributes. The defaults return
//! `None`, so a device opts in by overriding the accessors for the traits it
//! implements.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result so driver errors reach the caller intact
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! struct FilterWheel { position: RwLock<StateValue> }
//!
//! #[async_trait]
//! impl Stateful for FilterWheel {
//!     async fn state(&self) -> Result<StateValue> {
//!         Ok(self.position.read().await.clone())
//!     }
//!
//!     async fn set_state(&self, value: StateValue) -> Result<()> {
//!         *self.position.write().await = value;
//!         Ok(())
//!     }
//! }
//!
//! impl Device for FilterWheel {
//!     fn name(&self) -> &str { "filter" }
//!     fn as_stateful(&self) -> Option<&dyn Stateful> { Some(self) }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hardware::Frame;

/// A device state value as it appears in configuration trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Boolean state (shutter open, light on)
    Bool(bool),
    /// Integer state (filter slot, objective turret position)
    Int(i64),
    /// Floating point state (intensity, voltage)
    Float(f64),
    /// Named state ("GFP", "open", "eyepiece")
    Text(String),
}

impl StateValue {
    /// Convert a configuration leaf into a state value.
    ///
    /// Returns `None` for nulls, arrays and maps, which are not device states.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(StateValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(StateValue::Int)
                .or_else(|| n.as_f64().map(StateValue::Float)),
            serde_json::Value::String(s) => Some(StateValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Int(i) => Some(*i as f64),
            StateValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{b}"),
            StateValue::Int(i) => write!(f, "{i}"),
            StateValue::Float(x) => write!(f, "{x}"),
            StateValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

/// Binary output state of a single valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    /// Fluid passes
    Open,
    /// Fluid blocked
    Closed,
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveState::Open => write!(f, "open"),
            ValveState::Closed => write!(f, "closed"),
        }
    }
}

/// Address of a valve: its index in the bank or its configured name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValveKey {
    /// Zero-based position in the bank
    Index(usize),
    /// Configured valve name
    Name(String),
}

impl fmt::Display for ValveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveKey::Index(i) => write!(f, "#{i}"),
            ValveKey::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Capability: Image Capture
///
/// Devices that produce 2D frames on demand (cameras).
///
/// # Contract
/// - `snap()` exposes and reads out exactly one frame
/// - Transient failures are returned as errors; retrying is the caller's business
/// - `px_len()` is the physical edge length of one pixel at the sample plane,
///   before any magnification changer is accounted for
#[async_trait]
pub trait Capturable: Send + Sync {
    /// Capture one frame.
    async fn snap(&self) -> Result<Frame>;

    /// Physical size of one pixel in stage units.
    fn px_len(&self) -> f64;
}

/// Capability: XY Positioning
///
/// Devices that move the sample laterally (XY stages).
///
/// # Contract
/// - Positions are in stage units (typically µm)
/// - `set_xy` may return before the motion completes; callers `wait()` afterwards
#[async_trait]
pub trait Positionable: Send + Sync {
    /// Current `(x, y)` position.
    async fn xy(&self) -> Result<(f64, f64)>;

    /// Move to an absolute `(x, y)` position.
    async fn set_xy(&self, x: f64, y: f64) -> Result<()>;

    /// Current x position.
    async fn x(&self) -> Result<f64> {
        Ok(self.xy().await?.0)
    }

    /// Current y position.
    async fn y(&self) -> Result<f64> {
        Ok(self.xy().await?.1)
    }

    /// Move along x only.
    async fn set_x(&self, x: f64) -> Result<()> {
        let (_, y) = self.xy().await?;
        self.set_xy(x, y).await
    }

    /// Move along y only.
    async fn set_y(&self, y: f64) -> Result<()> {
        let (x, _) = self.xy().await?;
        self.set_xy(x, y).await
    }
}

/// Capability: Focus
///
/// Devices that move the objective or sample along the optical axis.
#[async_trait]
pub trait Focusable: Send + Sync {
    /// Current z position.
    async fn z(&self) -> Result<f64>;

    /// Move to an absolute z position.
    async fn set_z(&self, z: f64) -> Result<()>;
}

/// Capability: Discrete State
///
/// Devices whose configuration is a named state (filter wheels, shutters, light
/// paths), optionally with further named attributes (a light source with both an
/// on/off state and an intensity).
///
/// # Contract
/// - A configuration leaf addressed to the device sets its `state`
/// - A nested configuration map sets named attributes one by one
/// - Devices without attributes keep the default implementations, which fail
#[async_trait]
pub trait Stateful: Send + Sync {
    /// Current state.
    async fn state(&self) -> Result<StateValue>;

    /// Change state.
    async fn set_state(&self, value: StateValue) -> Result<()>;

    /// Read a named attribute.
    async fn attribute(&self, name: &str) -> Result<StateValue> {
        anyhow::bail!("Attribute '{name}' not supported by this device")
    }

    /// Set a named attribute.
    async fn set_attribute(&self, name: &str, _value: StateValue) -> Result<()> {
        anyhow::bail!("Attribute '{name}' not supported by this device")
    }
}

/// Capability: Readiness
///
/// Devices that can be busy after a command (moving stages, spinning filter wheels).
#[async_trait]
pub trait Waitable: Send + Sync {
    /// Block until the device reports it is idle.
    async fn wait(&self) -> Result<()>;
}

/// Capability: Magnification
///
/// Optical elements that scale the image (objectives, zoom lenses).
pub trait Zoomable: Send + Sync {
    /// Magnification factor applied to the camera pixel size.
    fn zoom(&self) -> f64;
}

/// Capability: Binary Outputs
///
/// Valve banks and other collections of open/closed outputs addressed by index or
/// by name.
#[async_trait]
pub trait Valved: Send + Sync {
    /// Number of valves in the bank.
    fn len(&self) -> usize;

    /// Whether the bank is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the valve at `index`, if it has one.
    fn valve_name(&self, index: usize) -> Option<&str>;

    /// Read one valve.
    async fn valve(&self, key: &ValveKey) -> Result<ValveState>;

    /// Set one valve.
    async fn set_valve(&self, key: &ValveKey, state: ValveState) -> Result<()>;
}

/// A named device and the capabilities it exposes.
///
/// The `as_*` accessors are the dispatch mechanism: `Control` looks for the first
/// device returning `Some` from `as_capturable` to find its camera, waits on every
/// device returning `Some` from `as_waitable`, and so on.
pub trait Device: Send + Sync {
    /// Unique device name, used as the key in configuration trees.
    fn name(&self) -> &str;

    /// Capture capability, if any.
    fn as_capturable(&self) -> Option<&dyn Capturable> {
        None
    }

    /// XY positioning capability, if any.
    fn as_positionable(&self) -> Option<&dyn Positionable> {
        None
    }

    /// Focus capability, if any.
    fn as_focusable(&self) -> Option<&dyn Focusable> {
        None
    }

    /// State capability, if any.
    fn as_stateful(&self) -> Option<&dyn Stateful> {
        None
    }

    /// Readiness capability, if any.
    fn as_waitable(&self) -> Option<&dyn Waitable> {
        None
    }

    /// Magnification capability, if any.
    fn as_zoomable(&self) -> Option<&dyn Zoomable> {
        None
    }

    /// Valve capability, if any.
    fn as_valved(&self) -> Option<&dyn Valved> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Shutter {
        open: std::sync::Mutex<bool>,
    }

    #[async_trait]
    impl Stateful for Shutter {
        async fn state(&self) -> Result<StateValue> {
            let open = self
                .open
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?;
            Ok(StateValue::Bool(*open))
        }

        async fn set_state(&self, value: StateValue) -> Result<()> {
            let StateValue::Bool(open) = value else {
                anyhow::bail!("shutter state must be a bool");
            };
            *self
                .open
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))? = open;
            Ok(())
        }
    }

    impl Device for Shutter {
        fn name(&self) -> &str {
            "shutter"
        }

        fn as_stateful(&self) -> Option<&dyn Stateful> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn test_capability_queries() {
        let shutter = Shutter {
            open: std::sync::Mutex::new(false),
        };
        let device: &dyn Device = &shutter;

        assert!(device.as_capturable().is_none());
        assert!(device.as_positionable().is_none());

        let stateful = device.as_stateful().unwrap();
        stateful.set_state(true.into()).await.unwrap();
        assert_eq!(stateful.state().await.unwrap(), StateValue::Bool(true));

        // Attributes are opt-in
        assert!(stateful.attribute("intensity").await.is_err());
    }

    #[test]
    fn test_state_value_from_json() {
        assert_eq!(
            StateValue::from_json(&json!("GFP")),
            Some(StateValue::Text("GFP".into()))
        );
        assert_eq!(StateValue::from_json(&json!(3)), Some(StateValue::Int(3)));
        assert_eq!(
            StateValue::from_json(&json!(0.5)),
            Some(StateValue::Float(0.5))
        );
        assert_eq!(StateValue::from_json(&json!(null)), None);
        assert_eq!(StateValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_valve_wire_format() {
        assert_eq!(serde_json::to_value(ValveState::Open).unwrap(), json!("open"));
        let key: ValveKey = serde_json::from_value(json!(4)).unwrap();
        assert_eq!(key, ValveKey::Index(4));
        let key: ValveKey = serde_json::from_value(json!("waste")).unwrap();
        assert_eq!(key, ValveKey::Name("waste".into()));
    }
}
