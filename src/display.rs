//! The display process.
//!
//! Runs as a child of the acquisition host with the relay on its stdin/stdout. It
//! never touches devices or writes data. It asks the host for the initial state,
//! optionally submits the operator's region, then polls the live frame, the run
//! status and the declared arrays until the host closes the channel. Declared arrays
//! are read straight from the store, reopened read-only, so the display catches up
//! at its own pace.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::data::{ArrayMetadata, ArrayStore, StoreError};
use crate::error::{AppResult, ScopeError};
use crate::experiment::grid::Boundary;
use crate::experiment::state::{AcquisitionState, AcquisitionStatus};
use crate::relay::routes::{
    DeclaredArrays, DeviceStates, LiveImage, RunStatus, StagePosition, SubmitBoundary,
    SubmitPositions,
};
use crate::relay::{Relay, RelayError};

/// Builds a boundary from stage positions read back from the host.
///
/// The operator drives the stage to one corner, records it, drives to the other and
/// records that; [`submit`](Self::submit) refuses to send until both are set.
pub struct BoundarySelector {
    relay: Arc<Relay>,
    top_left: Option<(f64, f64)>,
    bottom_right: Option<(f64, f64)>,
}

impl BoundarySelector {
    /// Selector with no corners set.
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            top_left: None,
            bottom_right: None,
        }
    }

    /// Record the current stage position as the top-left corner.
    pub async fn set_top_left(&mut self) -> Result<(f64, f64), RelayError> {
        let xy = self.relay.get::<StagePosition>(()).await?;
        info!(x = xy.0, y = xy.1, "Top-left corner set");
        self.top_left = Some(xy);
        Ok(xy)
    }

    /// Record the current stage position as the bottom-right corner.
    pub async fn set_bottom_right(&mut self) -> Result<(f64, f64), RelayError> {
        let xy = self.relay.get::<StagePosition>(()).await?;
        info!(x = xy.0, y = xy.1, "Bottom-right corner set");
        self.bottom_right = Some(xy);
        Ok(xy)
    }

    /// The selected boundary, once both corners are set.
    pub fn boundary(&self) -> AppResult<Boundary> {
        match (self.top_left, self.bottom_right) {
            (Some(top_left), Some(bottom_right)) => Ok(Boundary {
                top_left,
                bottom_right,
            }),
            (None, _) => Err(ScopeError::Configuration(
                "Top-left corner has not been set".to_string(),
            )),
            (_, None) => Err(ScopeError::Configuration(
                "Bottom-right corner has not been set".to_string(),
            )),
        }
    }

    /// Post the boundary to the host.
    pub async fn submit(&self) -> AppResult<Boundary> {
        let boundary = self.boundary()?;
        self.relay
            .post::<SubmitBoundary>((boundary.top_left, boundary.bottom_right))
            .await?;
        info!(?boundary, "Boundary submitted");
        Ok(boundary)
    }
}

/// What the display submits when the host is waiting for a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// A fixed boundary
    Boundary(Boundary),
    /// A fixed position list
    Positions(Vec<(f64, f64)>),
    /// Both corners at the current stage position
    CurrentPosition,
}

/// Headless display: logs what a viewer would draw.
pub struct DisplayApp {
    relay: Arc<Relay>,
    store_root: PathBuf,
    poll_interval: Duration,
    live_only: bool,
}

impl DisplayApp {
    /// Display reading arrays from `store_root` and polling every `poll_interval`.
    pub fn new(relay: Arc<Relay>, store_root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            relay,
            store_root: store_root.into(),
            poll_interval,
            live_only: false,
        }
    }

    /// Only watch the live frame; the host is running a live preview, not an
    /// acquisition, and serves no run routes.
    pub fn live_only(mut self, live_only: bool) -> Self {
        self.live_only = live_only;
        self
    }

    /// Run until the host closes the channel.
    pub async fn run(&self, selection: Option<Selection>) -> AppResult<()> {
        match self.session(selection).await {
            Err(e) if e.is_disconnect() => {
                info!("Host closed the relay");
                Ok(())
            }
            result => result,
        }
    }

    async fn session(&self, selection: Option<Selection>) -> AppResult<()> {
        let states = self.relay.get::<DeviceStates>(()).await?;
        for (device, state) in &states {
            info!(%device, %state, "Device state");
        }

        if self.live_only {
            self.watch_live().await?;
            info!("Host closed the relay");
            return Ok(());
        }

        let mut status = self.relay.get::<RunStatus>(()).await?;
        info!(state = %status.state, "Connected to host");
        if let Some(selection) = selection {
            // The run may not have reached its region prompt yet
            while status.state == AcquisitionState::Idle {
                tokio::time::sleep(self.poll_interval).await;
                status = self.relay.get::<RunStatus>(()).await?;
            }
            if status.state == AcquisitionState::AwaitingPosition {
                self.submit(selection).await?;
            } else {
                info!(state = %status.state, "Host did not ask for a region, selection unused");
            }
        } else if status.state == AcquisitionState::AwaitingPosition {
            info!("Host is waiting for a region; none was given");
        }

        tokio::try_join!(self.watch_live(), self.watch_status(), self.watch_arrays())?;
        info!("Host closed the relay");
        Ok(())
    }

    async fn submit(&self, selection: Selection) -> AppResult<()> {
        match selection {
            Selection::Boundary(boundary) => {
                self.relay
                    .post::<SubmitBoundary>((boundary.top_left, boundary.bottom_right))
                    .await?;
            }
            Selection::Positions(positions) => {
                self.relay.post::<SubmitPositions>((positions,)).await?;
            }
            Selection::CurrentPosition => {
                let mut selector = BoundarySelector::new(self.relay.clone());
                selector.set_top_left().await?;
                selector.set_bottom_right().await?;
                selector.submit().await?;
            }
        }
        Ok(())
    }

    async fn watch_live(&self) -> AppResult<()> {
        self.relay
            .poll::<LiveImage, _>(self.poll_interval, (), |frame| {
                if let Some(frame) = frame {
                    let (lo, hi) = frame.min_max().unwrap_or_default();
                    debug!(
                        width = frame.width,
                        height = frame.height,
                        mean = frame.mean(),
                        lo,
                        hi,
                        "Live frame"
                    );
                }
            })
            .await?;
        Ok(())
    }

    async fn watch_status(&self) -> AppResult<()> {
        let mut last: Option<AcquisitionStatus> = None;
        self.relay
            .poll::<RunStatus, _>(self.poll_interval, (), |status| {
                if last.as_ref() != Some(&status) {
                    info!(
                        state = %status.state,
                        paused = status.paused,
                        written = status.frames_written,
                        expected = ?status.frames_expected,
                        progress = ?status.progress(),
                        "Run status"
                    );
                    if let Some(error) = &status.last_error {
                        warn!(%error, "Run failed");
                    }
                    last = Some(status);
                }
            })
            .await?;
        Ok(())
    }

    async fn watch_arrays(&self) -> AppResult<()> {
        let mut store: Option<ArrayStore> = None;
        let mut known: HashMap<String, ArrayMetadata> = HashMap::new();
        let mut written: HashMap<String, u64> = HashMap::new();

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let names = match self.relay.get::<DeclaredArrays>(()).await {
                Ok(names) => names,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if names.is_empty() {
                continue;
            }

            if store.is_none() {
                store = Some(ArrayStore::open_read_only(&self.store_root).await?);
            }
            let Some(store) = store.as_ref() else {
                continue;
            };

            for name in names {
                if !known.contains_key(&name) {
                    let metadata = match store.metadata(&name).await {
                        Ok(metadata) => metadata,
                        // Declared on the host but not yet visible here
                        Err(StoreError::NotFound(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    info!(
                        array = %name,
                        dims = ?metadata.dims,
                        shape = ?metadata.shape,
                        "Array declared"
                    );
                    known.insert(name.clone(), metadata);
                }
                let Some(metadata) = known.get(&name) else {
                    continue;
                };

                let count = count_written(store, metadata);
                if written.get(&name) != Some(&count) {
                    info!(
                        array = %name,
                        written = count,
                        total = metadata.frame_count(),
                        "Chunks on disk"
                    );
                    written.insert(name, count);
                }
            }
        }
    }
}

/// Number of frames of `metadata`'s array present on disk.
pub fn count_written(store: &ArrayStore, metadata: &ArrayMetadata) -> u64 {
    let leading = &metadata.shape[..metadata.leading_dims()];
    leading_indices(leading)
        .iter()
        .filter(|index| store.chunk_written(&metadata.name, index))
        .count() as u64
}

/// Every index over `shape`, last axis fastest.
fn leading_indices(shape: &[u64]) -> Vec<Vec<u64>> {
    let mut indices = vec![Vec::with_capacity(shape.len())];
    for &len in shape {
        indices = indices
            .into_iter()
            .flat_map(|prefix| {
                (0..len).map(move |i| {
                    let mut index = prefix.clone();
                    index.push(i);
                    index
                })
            })
            .collect();
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{self, Request};
    use serde_json::json;

    #[test]
    fn test_leading_indices_order() {
        assert_eq!(
            leading_indices(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert_eq!(leading_indices(&[]), vec![Vec::<u64>::new()]);
        assert!(leading_indices(&[3, 0]).is_empty());
    }

    #[tokio::test]
    async fn test_selector_requires_both_corners() {
        let (host, display) = tokio::io::duplex(1024);
        let (rx, tx) = tokio::io::split(display);
        let relay = Arc::new(Relay::new(rx, tx));

        let (mut host_rx, mut host_tx) = tokio::io::split(host);
        let server = tokio::spawn(async move {
            let mut posted = Vec::new();
            for xy in [json!([1.0, 2.0]), json!([30.0, 40.0])] {
                let request: Request = protocol::recv(&mut host_rx).await.unwrap();
                assert_eq!(request.route(), "xy");
                protocol::send(&mut host_tx, &xy).await.unwrap();
            }
            let request: Request = protocol::recv(&mut host_rx).await.unwrap();
            posted.push(request);
            posted
        });

        let mut selector = BoundarySelector::new(relay);
        assert!(selector.submit().await.is_err());

        selector.set_top_left().await.unwrap();
        assert!(selector.boundary().is_err());
        selector.set_bottom_right().await.unwrap();
        let boundary = selector.submit().await.unwrap();
        assert_eq!(boundary.top_left, (1.0, 2.0));
        assert_eq!(boundary.bottom_right, (30.0, 40.0));

        let posted = server.await.unwrap();
        assert_eq!(
            posted,
            vec![Request::new(
                "boundaries",
                vec![json!([1.0, 2.0]), json!([30.0, 40.0])]
            )]
        );
    }
}
