//! Mock Hardware Implementations
//!
//! Provides simulated microscope devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockCamera` - Pattern frames, configurable size and pixel size, injectable failures
//! - `MockStage` - XY stage with optional motion speed and settling time
//! - `MockFocus` - Z drive
//! - `MockFilter` - Filter wheel restricted to a set of named positions
//! - `MockLight` - Light source with an on/off state and an intensity attribute
//! - `MockObjective` - Fixed magnification
//! - `MockValves` - Bank of open/closed valves addressable by index or name
//!
//! Every mock keeps enough history (snap counts, move lists, state changes) for tests
//! to assert on what the acquisition engine actually did.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{
    Capturable, Device, Focusable, Positionable, StateValue, Stateful, ValveKey, ValveState,
    Valved, Waitable, Zoomable,
};
use crate::hardware::Frame;

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera producing deterministic, never-zero pattern frames
///
/// Each frame's pixels are `((i + n) % 65535) + 1` where `i` is the pixel index and
/// `n` the frame number, so written chunks are always distinguishable from the
/// store's zero fill value.
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new("camera", 64, 48).with_px_len(6.5);
/// camera.fail_next(3); // next three snaps fail
/// ```
pub struct MockCamera {
    name: String,
    width: u32,
    height: u32,
    px_len: f64,
    readout: Duration,
    frame_count: AtomicU64,
    pending_failures: AtomicU32,
    attempts: AtomicU64,
}

impl MockCamera {
    /// Create a camera with the given sensor size, 1.0 pixel size and no readout delay.
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            px_len: 1.0,
            readout: Duration::ZERO,
            frame_count: AtomicU64::new(0),
            pending_failures: AtomicU32::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    /// Set the physical pixel size.
    pub fn with_px_len(mut self, px_len: f64) -> Self {
        self.px_len = px_len;
        self
    }

    /// Simulate a readout time per frame.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Make the next `n` snaps fail.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Number of frames successfully captured.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Number of snap attempts, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn pattern(&self, n: u64) -> Vec<u16> {
        let len = self.width as u64 * self.height as u64;
        (0..len).map(|i| ((i + n) % 65535 + 1) as u16).collect()
    }
}

#[async_trait]
impl Capturable for MockCamera {
    async fn snap(&self) -> Result<Frame> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.readout.is_zero() {
            sleep(self.readout).await;
        }

        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("MockCamera: injected capture failure");
        }

        let n = self.frame_count.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::new(self.width, self.height, self.pattern(n)))
    }

    fn px_len(&self) -> f64 {
        self.px_len
    }
}

#[async_trait]
impl Waitable for MockCamera {
    async fn wait(&self) -> Result<()> {
        Ok(())
    }
}

impl Device for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_capturable(&self) -> Option<&dyn Capturable> {
        Some(self)
    }

    fn as_waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}

// =============================================================================
// MockStage - Simulated XY Stage
// =============================================================================

/// Mock XY stage
///
/// Moves are instantaneous by default. With a speed set, `set_xy` sleeps for the
/// travel time; with a settle time set, `wait` sleeps after every move. Every target
/// position is recorded in order.
pub struct MockStage {
    name: String,
    position: RwLock<(f64, f64)>,
    speed: Option<f64>,
    settle: Duration,
    moves: RwLock<Vec<(f64, f64)>>,
}

impl MockStage {
    /// Create a stage at the origin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: RwLock::new((0.0, 0.0)),
            speed: None,
            settle: Duration::ZERO,
            moves: RwLock::new(Vec::new()),
        }
    }

    /// Start at the given position.
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = RwLock::new((x, y));
        self
    }

    /// Simulate motion at `units_per_sec`.
    pub fn with_speed(mut self, units_per_sec: f64) -> Self {
        self.speed = Some(units_per_sec);
        self
    }

    /// Simulate a settling time observed by `wait`.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Every commanded target, in order.
    pub async fn moves(&self) -> Vec<(f64, f64)> {
        self.moves.read().await.clone()
    }
}

#[async_trait]
impl Positionable for MockStage {
    async fn xy(&self) -> Result<(f64, f64)> {
        Ok(*self.position.read().await)
    }

    async fn set_xy(&self, x: f64, y: f64) -> Result<()> {
        if !x.is_finite() || !y.is_finite() {
            bail!("MockStage: target ({x}, {y}) is not finite");
        }

        if let Some(speed) = self.speed {
            let (cx, cy) = *self.position.read().await;
            let distance = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
            sleep(Duration::from_secs_f64(distance / speed)).await;
        }

        *self.position.write().await = (x, y);
        self.moves.write().await.push((x, y));
        Ok(())
    }
}

#[async_trait]
impl Waitable for MockStage {
    async fn wait(&self) -> Result<()> {
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        Ok(())
    }
}

impl Device for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_positionable(&self) -> Option<&dyn Positionable> {
        Some(self)
    }

    fn as_waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}

// =============================================================================
// MockFocus - Simulated Z Drive
// =============================================================================

/// Mock focus drive
pub struct MockFocus {
    name: String,
    z: RwLock<f64>,
}

impl MockFocus {
    /// Create a focus drive at z = 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            z: RwLock::new(0.0),
        }
    }
}

#[async_trait]
impl Focusable for MockFocus {
    async fn z(&self) -> Result<f64> {
        Ok(*self.z.read().await)
    }

    async fn set_z(&self, z: f64) -> Result<()> {
        *self.z.write().await = z;
        Ok(())
    }
}

impl Device for MockFocus {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_focusable(&self) -> Option<&dyn Focusable> {
        Some(self)
    }
}

// =============================================================================
// MockFilter - Simulated Filter Wheel
// =============================================================================

/// Mock filter wheel
///
/// Accepts a position name or a slot index; starts in the first slot. Every state
/// change is recorded so tests can check the order configurations were applied in.
pub struct MockFilter {
    name: String,
    positions: Vec<String>,
    state: RwLock<String>,
    history: RwLock<Vec<String>>,
}

impl MockFilter {
    /// Create a wheel with the given slot names.
    pub fn new(name: impl Into<String>, positions: &[&str]) -> Self {
        let positions: Vec<String> = positions.iter().map(|p| p.to_string()).collect();
        let initial = positions.first().cloned().unwrap_or_default();
        Self {
            name: name.into(),
            positions,
            state: RwLock::new(initial),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Every state set, in order.
    pub async fn history(&self) -> Vec<String> {
        self.history.read().await.clone()
    }

    fn resolve(&self, value: &StateValue) -> Result<String> {
        match value {
            StateValue::Text(name) if self.positions.contains(name) => Ok(name.clone()),
            StateValue::Int(slot) => usize::try_from(*slot)
                .ok()
                .and_then(|slot| self.positions.get(slot))
                .cloned()
                .ok_or_else(|| anyhow!("MockFilter: no slot {slot}")),
            other => Err(anyhow!(
                "MockFilter '{}': '{other}' is not one of {:?}",
                self.name,
                self.positions
            )),
        }
    }
}

#[async_trait]
impl Stateful for MockFilter {
    async fn state(&self) -> Result<StateValue> {
        Ok(StateValue::Text(self.state.read().await.clone()))
    }

    async fn set_state(&self, value: StateValue) -> Result<()> {
        let position = self.resolve(&value)?;
        *self.state.write().await = position.clone();
        self.history.write().await.push(position);
        Ok(())
    }
}

#[async_trait]
impl Waitable for MockFilter {
    async fn wait(&self) -> Result<()> {
        Ok(())
    }
}

impl Device for MockFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }

    fn as_waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}

// =============================================================================
// MockLight - Simulated Light Source
// =============================================================================

/// Mock light source with a boolean state and an `intensity` attribute
pub struct MockLight {
    name: String,
    on: RwLock<bool>,
    intensity: RwLock<f64>,
}

impl MockLight {
    /// Create a light that is off at full intensity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on: RwLock::new(false),
            intensity: RwLock::new(100.0),
        }
    }
}

#[async_trait]
impl Stateful for MockLight {
    async fn state(&self) -> Result<StateValue> {
        Ok(StateValue::Bool(*self.on.read().await))
    }

    async fn set_state(&self, value: StateValue) -> Result<()> {
        let StateValue::Bool(on) = value else {
            bail!("MockLight '{}': state must be true or false", self.name);
        };
        *self.on.write().await = on;
        Ok(())
    }

    async fn attribute(&self, name: &str) -> Result<StateValue> {
        match name {
            "state" => self.state().await,
            "intensity" => {
                let intensity = *self.intensity.read().await;
                // Integral intensities read back as integers
                if intensity.fract() == 0.0 {
                    Ok(StateValue::Int(intensity as i64))
                } else {
                    Ok(StateValue::Float(intensity))
                }
            }
            other => bail!("MockLight: unknown attribute '{other}'"),
        }
    }

    async fn set_attribute(&self, name: &str, value: StateValue) -> Result<()> {
        match name {
            "state" => self.set_state(value).await,
            "intensity" => {
                let intensity = value
                    .as_f64()
                    .filter(|v| (0.0..=100.0).contains(v))
                    .ok_or_else(|| anyhow!("MockLight: intensity must be within 0..=100"))?;
                *self.intensity.write().await = intensity;
                Ok(())
            }
            other => bail!("MockLight: unknown attribute '{other}'"),
        }
    }
}

impl Device for MockLight {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }
}

// =============================================================================
// MockObjective - Fixed Magnification
// =============================================================================

/// Mock objective lens
pub struct MockObjective {
    name: String,
    zoom: f64,
}

impl MockObjective {
    /// Create an objective with the given magnification.
    pub fn new(name: impl Into<String>, zoom: f64) -> Self {
        Self {
            name: name.into(),
            zoom,
        }
    }
}

impl Zoomable for MockObjective {
    fn zoom(&self) -> f64 {
        self.zoom
    }
}

impl Device for MockObjective {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_zoomable(&self) -> Option<&dyn Zoomable> {
        Some(self)
    }
}

// =============================================================================
// MockValves - Simulated Valve Bank
// =============================================================================

/// Mock valve bank, all valves initially closed
pub struct MockValves {
    name: String,
    names: Vec<Option<String>>,
    states: RwLock<Vec<ValveState>>,
}

impl MockValves {
    /// Default bank size of the microfluidics controller.
    pub const DEFAULT_COUNT: usize = 48;

    /// Create a bank of `count` unnamed valves.
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            names: vec![None; count],
            states: RwLock::new(vec![ValveState::Closed; count]),
        }
    }

    /// Name valves in index order; extra names are ignored.
    pub fn with_names(mut self, names: &[&str]) -> Self {
        for (slot, name) in self.names.iter_mut().zip(names) {
            *slot = Some(name.to_string());
        }
        self
    }

    fn index(&self, key: &ValveKey) -> Result<usize> {
        match key {
            ValveKey::Index(i) if *i < self.names.len() => Ok(*i),
            ValveKey::Index(i) => bail!("MockValves: index {i} out of range"),
            ValveKey::Name(name) => self
                .names
                .iter()
                .position(|n| n.as_deref() == Some(name.as_str()))
                .ok_or_else(|| anyhow!("MockValves: no valve named '{name}'")),
        }
    }
}

#[async_trait]
impl Valved for MockValves {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn valve_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).and_then(|n| n.as_deref())
    }

    async fn valve(&self, key: &ValveKey) -> Result<ValveState> {
        let index = self.index(key)?;
        Ok(self.states.read().await[index])
    }

    async fn set_valve(&self, key: &ValveKey, state: ValveState) -> Result<()> {
        let index = self.index(key)?;
        self.states.write().await[index] = state;
        Ok(())
    }
}

impl Device for MockValves {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_valved(&self) -> Option<&dyn Valved> {
        Some(self)
    }
}
