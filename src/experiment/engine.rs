//! The acquisition state machine.
//!
//! An [`Acquisition`] owns one run: it resolves the region into a [`TileGrid`],
//! declares the array, then walks the schedule with the control surface.
//!
//! # Architecture
//!
//! ```text
//!  produce ──AcquisitionEvent──> bounded mpsc ──> consume ──> ArrayStore::write
//!  (devices, pause/quit)                             └──────> LiveView (img, contrast)
//! ```
//!
//! The producer is the only part that touches devices. It checks the run-control
//! gate before every unit of work (time entry, tile, channel) and stops with
//! [`Cancelled`] when quit is set. The consumer drains whatever the producer already
//! sent, so every frame captured before a cancel is still written. The end of the
//! stream is the producer dropping its sender.
//!
//! Whatever happens, `default_state` is applied again when the run ends.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::AcquisitionConfig;
use crate::data::{ArrayStore, AxisSpec};
use crate::error::{AppResult, ScopeError};
use crate::experiment::grid::{Boundary, Region, TileGrid};
use crate::experiment::plan::AcquisitionSpec;
use crate::experiment::schedule::Schedule;
use crate::experiment::state::{AcquisitionState, AcquisitionStatus};
use crate::hardware::{Control, Frame};
use crate::relay::routes::{
    Contrast, DeclaredArrays, LiveImage, RunCommand, RunCommandRoute, RunStatus, SubmitBoundary,
    SubmitPositions,
};
use crate::relay::{Cancelled, RelayError, RunControl, Supervisor};

fn default_attempts() -> u32 {
    10
}

fn default_delay() -> Duration {
    Duration::from_millis(100)
}

/// How often a failed capture is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first included
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Pause between attempts
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay: default_delay(),
        }
    }
}

/// Capture a frame, retrying failures up to `policy.attempts` times in total.
///
/// When every attempt fails the last device error is returned as is. The delay
/// between attempts wakes early on quit.
pub async fn capture_with_retry(
    control: &Control,
    policy: &RetryPolicy,
    run: &RunControl,
) -> Result<Frame> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match control.snap().await {
            Ok(frame) => {
                if attempt > 1 {
                    debug!(attempt, "Capture recovered");
                }
                return Ok(frame);
            }
            Err(e) if attempt >= attempts => {
                error!(attempts, error = %e, "Capture failed, retries exhausted");
                return Err(e);
            }
            Err(e) => {
                warn!(attempt, attempts, error = %e, "Capture failed, retrying");
                run.sleep(policy.delay).await?;
                attempt += 1;
            }
        }
    }
}

/// A captured frame and where it goes in the stored array.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// The frame
    pub frame: Frame,
    /// `[channel, time, row, col]`, or `[channel, time, position]`
    pub index: Vec<u64>,
}

impl FrameRecord {
    /// Channel index.
    pub fn channel(&self) -> usize {
        self.index.first().copied().unwrap_or_default() as usize
    }

    /// Whether this is the channel's first frame: first acquired time, first tile.
    pub fn is_channel_origin(&self) -> bool {
        self.index.iter().skip(1).all(|&i| i == 0)
    }
}

/// What the producer sends to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// A frame to store
    Frame(FrameRecord),
    /// A time entry finished settling
    Heartbeat,
}

/// Latest frame and per-channel contrast limits, as served to the display.
#[derive(Debug, Default)]
pub struct LiveView {
    frame: RwLock<Option<Frame>>,
    contrast: RwLock<HashMap<usize, (u16, u16)>>,
}

impl LiveView {
    /// Empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the live frame.
    pub async fn publish(&self, frame: Frame) {
        *self.frame.write().await = Some(frame);
    }

    /// The live frame, if any.
    pub async fn latest(&self) -> Option<Frame> {
        self.frame.read().await.clone()
    }

    /// Record auto-contrast limits for a channel.
    pub async fn set_contrast(&self, channel: usize, limits: (u16, u16)) {
        debug!(channel, lo = limits.0, hi = limits.1, "Auto-contrast");
        self.contrast.write().await.insert(channel, limits);
    }

    /// Auto-contrast limits of a channel.
    pub async fn contrast(&self, channel: usize) -> Option<(u16, u16)> {
        self.contrast.read().await.get(&channel).copied()
    }
}

/// Serve `img` and `contrast` from a live view.
pub fn register_live_routes(
    supervisor: &mut Supervisor,
    live: Arc<LiveView>,
) -> Result<(), RelayError> {
    let view = live.clone();
    supervisor.serve_get::<LiveImage, _, _>(move |()| {
        let view = view.clone();
        async move { Ok(view.latest().await) }
    })?;

    supervisor.serve_get::<Contrast, _, _>(move |(channel,)| {
        let view = live.clone();
        async move { Ok(view.contrast(channel).await) }
    })?;
    Ok(())
}

/// Capture continuously into `live` until quit.
///
/// Exhausted capture retries end the preview with a warning rather than an error.
pub async fn live_preview(
    control: &Control,
    live: &LiveView,
    config: &AcquisitionConfig,
    run: &RunControl,
) -> Result<()> {
    info!("Live preview started");
    loop {
        run.checkpoint().await?;
        control.wait().await?;
        match capture_with_retry(control, &config.retry, run).await {
            Ok(frame) => {
                if live.contrast(0).await.is_none() {
                    if let Some(limits) = frame.min_max() {
                        live.set_contrast(0, limits).await;
                    }
                }
                live.publish(frame).await;
            }
            Err(e) if e.is::<Cancelled>() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Live preview stopped after repeated capture failures");
                return Ok(());
            }
        }
        run.sleep(config.live_interval).await?;
    }
}

/// One acquisition run.
pub struct Acquisition {
    spec: AcquisitionSpec,
    schedule: Schedule,
    control: Arc<Control>,
    store: Arc<ArrayStore>,
    config: AcquisitionConfig,
    run: RunControl,
    live: Arc<LiveView>,
    status: RwLock<AcquisitionStatus>,
    declared: RwLock<Vec<String>>,
    region_tx: Mutex<Option<oneshot::Sender<Region>>>,
    region_rx: Mutex<Option<oneshot::Receiver<Region>>>,
    started: AtomicBool,
}

impl Acquisition {
    /// Prepare a run. `run` should be a child of the supervisor's run control so a
    /// cancel stops this run without quitting the host.
    pub fn new(
        spec: AcquisitionSpec,
        control: Arc<Control>,
        store: Arc<ArrayStore>,
        config: AcquisitionConfig,
        run: RunControl,
    ) -> AppResult<Self> {
        spec.validate().map_err(ScopeError::Configuration)?;
        let schedule = spec.schedule()?;

        let (region_tx, region_rx) = if spec.needs_region() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Ok(Self {
            spec,
            schedule,
            control,
            store,
            config,
            run,
            live: Arc::new(LiveView::new()),
            status: RwLock::new(AcquisitionStatus::default()),
            declared: RwLock::new(Vec::new()),
            region_tx: Mutex::new(region_tx),
            region_rx: Mutex::new(region_rx),
            started: AtomicBool::new(false),
        })
    }

    /// The expanded schedule.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Live frame and contrast shared with the display routes.
    pub fn live(&self) -> Arc<LiveView> {
        self.live.clone()
    }

    /// This run's run-control handle.
    pub fn run_control(&self) -> &RunControl {
        &self.run
    }

    /// Progress snapshot.
    pub async fn status(&self) -> AcquisitionStatus {
        let mut status = self.status.read().await.clone();
        status.paused = self.run.is_paused();
        status
    }

    /// Arrays declared by this run.
    pub async fn declared_arrays(&self) -> Vec<String> {
        self.declared.read().await.clone()
    }

    /// Apply a pause/resume/cancel command from the display.
    pub fn command(&self, command: RunCommand) {
        info!(?command, "Run command");
        match command {
            RunCommand::Pause => self.run.pause(),
            RunCommand::Resume => self.run.resume(),
            RunCommand::Cancel => self.run.quit(),
        }
    }

    /// Hand the operator's region to a run waiting in `AwaitingPosition`.
    ///
    /// Only the first submission starts the run; later ones are logged and dropped.
    /// A malformed region is an error.
    pub async fn submit_region(&self, region: Region) -> Result<()> {
        validate_region(&region)?;
        let sender = self.region_tx.lock().await.take();
        match sender {
            Some(sender) => {
                info!(?region, "Region chosen");
                if sender.send(region).is_err() {
                    warn!("Acquisition is no longer waiting for a region");
                }
            }
            None => warn!("Region already set, ignoring submission"),
        }
        Ok(())
    }

    /// Serve the acquisition routes: `img`, `contrast`, `arrays`, `status`,
    /// `run_command`, `boundaries` and `positions`.
    pub fn register_routes(self: &Arc<Self>, supervisor: &mut Supervisor) -> Result<(), RelayError> {
        register_live_routes(supervisor, self.live.clone())?;

        let acq = self.clone();
        supervisor.serve_get::<DeclaredArrays, _, _>(move |()| {
            let acq = acq.clone();
            async move { Ok(acq.declared_arrays().await) }
        })?;

        let acq = self.clone();
        supervisor.serve_get::<RunStatus, _, _>(move |()| {
            let acq = acq.clone();
            async move { Ok(acq.status().await) }
        })?;

        let acq = self.clone();
        supervisor.serve_post::<RunCommandRoute, _, _>(move |(command,)| {
            acq.command(command);
            async { Ok(()) }
        })?;

        let acq = self.clone();
        supervisor.serve_post::<SubmitBoundary, _, _>(move |(top_left, bottom_right)| {
            let acq = acq.clone();
            async move {
                acq.submit_region(Region::Boundary(Boundary {
                    top_left,
                    bottom_right,
                }))
                .await
            }
        })?;

        let acq = self.clone();
        supervisor.serve_post::<SubmitPositions, _, _>(move |(positions,)| {
            let acq = acq.clone();
            async move { acq.submit_region(Region::Positions { positions }).await }
        })?;

        Ok(())
    }

    /// Execute the run.
    ///
    /// A cancelled run returns `Ok`; its state is [`AcquisitionState::Cancelled`].
    /// A run can only be executed once.
    #[instrument(skip(self), fields(array = %self.spec.name))]
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("Acquisition '{}' has already been started", self.spec.name);
        }

        let result = self.execute().await;

        if let Err(e) = self.control.apply(&self.schedule.default_state).await {
            warn!(error = %e, "Failed to restore the default state");
        }

        match result {
            Ok(()) => {
                self.set_state(AcquisitionState::Done).await;
                Ok(())
            }
            Err(e) if e.is::<Cancelled>() => {
                self.set_state(AcquisitionState::Cancelled).await;
                Ok(())
            }
            Err(e) => {
                self.status.write().await.last_error = Some(format!("{e:#}"));
                self.set_state(AcquisitionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn execute(&self) -> Result<()> {
        self.control.apply(&self.schedule.default_state).await?;
        self.control.wait().await?;

        let region = match &self.spec.region {
            Some(region) => region.clone(),
            None => self.await_region().await?,
        };
        self.set_state(AcquisitionState::Running).await;

        let first = capture_with_retry(&self.control, &self.config.retry, &self.run).await?;
        let frame_shape = first.shape();
        let px_len = self.control.px_len()?;
        let current = self.control.xy().await?;
        let grid = TileGrid::resolve(
            &region,
            self.spec.overlap,
            (first.width, first.height),
            px_len,
            current,
        )?;
        self.live.publish(first).await;
        info!(tiles = grid.len(), px_len, "Grid resolved");

        self.declare(&grid, frame_shape).await?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (produced, consumed) = tokio::join!(self.produce(&grid, tx), self.consume(rx));
        match (produced, consumed) {
            // A consumer failure also stops the producer; report the cause
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn await_region(&self) -> Result<Region> {
        let mut receiver = self
            .region_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("Region receiver already taken"))?;
        self.set_state(AcquisitionState::AwaitingPosition).await;
        info!("Waiting for the operator to choose a region");

        let preview = live_preview(&self.control, &self.live, &self.config, &self.run);
        tokio::pin!(preview);
        let mut previewing = true;
        loop {
            tokio::select! {
                region = &mut receiver => {
                    return region.map_err(|_| anyhow!("Region submission channel closed"));
                }
                result = &mut preview, if previewing => {
                    result?;
                    previewing = false;
                }
                _ = self.run.cancelled(), if !previewing => return Err(Cancelled.into()),
            }
        }
    }

    async fn declare(&self, grid: &TileGrid, frame_shape: (u32, u32)) -> Result<()> {
        let coords =
            |labels: Vec<&str>| AxisSpec::Coords(labels.into_iter().map(Value::from).collect());
        let mut dims = vec![
            ("channel".to_string(), coords(self.schedule.channel_labels())),
            ("time".to_string(), coords(self.schedule.acquired_labels())),
        ];
        dims.extend(
            grid.storage_axes()
                .into_iter()
                .map(|(axis, coords)| (axis, AxisSpec::Coords(coords))),
        );

        let mut attributes = Map::new();
        attributes.insert("times".into(), Value::Object(self.spec.times.clone()));
        attributes.insert("channels".into(), Value::Object(self.spec.channels.clone()));
        attributes.insert(
            "default_state".into(),
            Value::Object(self.spec.default_state.clone()),
        );
        attributes.insert("overlap".into(), json!(self.spec.overlap));
        attributes.insert(
            "source".into(),
            json!(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))),
        );
        attributes.insert("created".into(), json!(chrono::Utc::now().to_rfc3339()));

        let metadata = self
            .store
            .declare(&self.spec.name, &dims, frame_shape, attributes)
            .await?;
        self.declared.write().await.push(metadata.name.clone());

        let mut status = self.status.write().await;
        status.array = Some(metadata.name.clone());
        status.frames_expected = Some(metadata.frame_count());
        Ok(())
    }

    async fn produce(&self, grid: &TileGrid, tx: mpsc::Sender<AcquisitionEvent>) -> Result<()> {
        let tiles = grid.tiles();

        let mut acquired: Option<u64> = None;
        for step in &self.schedule.times {
            self.run.checkpoint().await?;
            let time_state = self.schedule.time_state(step);
            self.control.wait().await?;
            self.control.apply(&time_state).await?;
            if let Some(wait) = step.wait {
                info!(time = %step.label, wait = ?wait, "Waiting");
                self.run.sleep(wait).await?;
            }
            emit(&tx, AcquisitionEvent::Heartbeat).await?;

            if !step.acquire {
                debug!(time = %step.label, "Settle-only entry");
                continue;
            }
            let t = acquired.map_or(0, |t| t + 1);
            acquired = Some(t);
            info!(time = %step.label, index = t, "Acquiring time point");

            for tile in &tiles {
                self.run.checkpoint().await?;
                self.control.set_xy(tile.x, tile.y).await?;
                self.control.wait().await?;

                for (c, channel) in self.schedule.channels.iter().enumerate() {
                    self.run.checkpoint().await?;
                    self.control.wait().await?;
                    self.control
                        .apply(&self.schedule.channel_state(channel, &time_state))
                        .await?;

                    let frame =
                        capture_with_retry(&self.control, &self.config.retry, &self.run).await?;
                    let mut index = vec![c as u64, t];
                    index.extend(tile.index.to_indices());
                    trace!(?index, x = tile.x, y = tile.y, "Captured");
                    emit(&tx, AcquisitionEvent::Frame(FrameRecord { frame, index })).await?;

                    self.control.apply(&self.schedule.default_state).await?;
                }
            }
        }
        Ok(())
    }

    async fn consume(&self, mut rx: mpsc::Receiver<AcquisitionEvent>) -> Result<()> {
        while let Some(event) = rx.recv().await {
            match event {
                AcquisitionEvent::Heartbeat => {
                    self.status.write().await.heartbeats += 1;
                }
                AcquisitionEvent::Frame(record) => {
                    self.store
                        .write(&self.spec.name, &record.index, &record.frame)
                        .await?;
                    if record.is_channel_origin() {
                        if let Some(limits) = record.frame.min_max() {
                            self.live.set_contrast(record.channel(), limits).await;
                        }
                    }
                    self.live.publish(record.frame).await;
                    self.status.write().await.frames_written += 1;
                }
            }
        }
        Ok(())
    }

    async fn set_state(&self, state: AcquisitionState) {
        let mut status = self.status.write().await;
        if status.state != state {
            info!(from = %status.state, to = %state, "Acquisition state changed");
            status.state = state;
        }
    }
}

async fn emit(tx: &mpsc::Sender<AcquisitionEvent>, event: AcquisitionEvent) -> Result<()> {
    tx.send(event)
        .await
        .map_err(|_| anyhow!("Frame consumer stopped"))
}

fn validate_region(region: &Region) -> Result<()> {
    match region {
        Region::Boundary(Boundary {
            top_left,
            bottom_right,
        }) => {
            let corners = [top_left.0, top_left.1, bottom_right.0, bottom_right.1];
            if corners.iter().any(|v| !v.is_finite()) {
                bail!("Boundary corners must be finite, got {top_left:?} and {bottom_right:?}");
            }
        }
        Region::Positions { positions } => {
            if positions.is_empty() {
                bail!("Position list is empty");
            }
            if positions.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                bail!("Positions must be finite");
            }
        }
    }
    Ok(())
}
