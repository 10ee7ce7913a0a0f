//! Integration tests for the acquisition state machine
//!
//! Each test runs a plan against mock devices and a temporary array store, then
//! checks what the devices saw and what ended up on disk.

use scope_daq::config::AcquisitionConfig;
use scope_daq::data::{ArrayStore, StoreError};
use scope_daq::display::count_written;
use scope_daq::experiment::grid::GridError;
use scope_daq::experiment::{
    Acquisition, AcquisitionSpec, AcquisitionState, Boundary, Region, RetryPolicy,
};
use scope_daq::hardware::mock::{MockCamera, MockFilter, MockStage};
use scope_daq::hardware::{Control, Device, StateValue};
use scope_daq::relay::RunControl;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Rig {
    camera: Arc<MockCamera>,
    stage: Arc<MockStage>,
    filter: Arc<MockFilter>,
    control: Arc<Control>,
    store: Arc<ArrayStore>,
    _dir: TempDir,
}

async fn rig(camera: MockCamera) -> Rig {
    let camera = Arc::new(camera);
    let stage = Arc::new(MockStage::new("stage"));
    let filter = Arc::new(MockFilter::new("filter", &["DAPI", "GFP", "RFP"]));
    let devices: Vec<Arc<dyn Device>> = vec![
        camera.clone() as Arc<dyn Device>,
        stage.clone() as Arc<dyn Device>,
        filter.clone() as Arc<dyn Device>,
    ];
    let control = Arc::new(Control::new(devices).unwrap());

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArrayStore::create(dir.path().join("run.zarr")).await.unwrap());
    Rig {
        camera,
        stage,
        filter,
        control,
        store,
        _dir: dir,
    }
}

fn settings() -> AcquisitionConfig {
    AcquisitionConfig {
        retry: RetryPolicy {
            attempts: 10,
            delay: Duration::from_millis(1),
        },
        channel_capacity: 4,
        live_interval: Duration::from_millis(5),
    }
}

fn acquisition(rig: &Rig, plan: &str, run: RunControl) -> Acquisition {
    let spec = AcquisitionSpec::from_toml_str(plan).unwrap();
    Acquisition::new(
        spec,
        rig.control.clone(),
        rig.store.clone(),
        settings(),
        run,
    )
    .unwrap()
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

const TILES_PLAN: &str = r#"
name = "tiles"
overlap = 0.0

[region]
top_left = [0.0, 0.0]
bottom_right = [100.0, 100.0]

[default_state]
filter = "DAPI"

[channels.dapi]
filter = "DAPI"

[channels.gfp]
filter = "GFP"
"#;

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_tiled_acquisition_end_to_end() {
    let rig = rig(MockCamera::new("camera", 50, 50)).await;
    let acq = acquisition(&rig, TILES_PLAN, RunControl::new());

    acq.run().await.unwrap();

    let status = acq.status().await;
    assert_eq!(status.state, AcquisitionState::Done);
    assert_eq!(status.frames_written, 18);
    assert_eq!(status.frames_expected, Some(18));
    assert_eq!(status.heartbeats, 1);

    let reader = ArrayStore::open_read_only(rig.store.root()).await.unwrap();
    let metadata = reader.metadata("tiles").await.unwrap();
    assert_eq!(metadata.shape, vec![2, 1, 3, 3, 50, 50]);
    assert_eq!(metadata.dims, vec!["channel", "time", "row", "col", "y", "x"]);
    assert_eq!(metadata.attributes["coords"]["channel"], serde_json::json!(["dapi", "gfp"]));
    assert_eq!(metadata.attributes["coords"]["time"], serde_json::json!(["0"]));
    assert_eq!(
        metadata.attributes["coords"]["col"],
        serde_json::json!([0.0, 50.0, 100.0])
    );
    assert_eq!(metadata.attributes["overlap"], serde_json::json!(0.0));
    assert_eq!(count_written(&reader, &metadata), 18);

    let frame = reader.read("tiles", &[1, 0, 2, 2]).await.unwrap();
    assert_eq!(frame.shape(), (50, 50));
    assert!(frame.buffer.iter().all(|&v| v > 0));
}

#[tokio::test]
async fn test_snake_order_and_state_restore() {
    let rig = rig(MockCamera::new("camera", 50, 50)).await;
    let acq = acquisition(&rig, TILES_PLAN, RunControl::new());
    acq.run().await.unwrap();

    assert_eq!(
        rig.stage.moves().await,
        vec![
            (0.0, 0.0),
            (50.0, 0.0),
            (100.0, 0.0),
            (100.0, 50.0),
            (50.0, 50.0),
            (0.0, 50.0),
            (0.0, 100.0),
            (50.0, 100.0),
            (100.0, 100.0),
        ]
    );

    // Every channel capture is followed by a restore of the default state
    let history = rig.filter.history().await;
    assert_eq!(history.iter().filter(|s| *s == "GFP").count(), 9);
    assert_eq!(history.last().map(String::as_str), Some("DAPI"));
    assert_eq!(
        rig.control.state("filter").await.unwrap(),
        StateValue::from("DAPI")
    );
}

#[tokio::test]
async fn test_settle_only_entries_and_positions() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    let plan = r#"
name = "timelapse"

[region]
positions = [[0.0, 0.0], [10.0, 20.0]]

[times.settle]
wait = 0.01

[times.t1]
acquire = true

[times.rest]
wait = "10ms"
filter = "RFP"

[times.t2]
acquire = true
"#;
    let acq = acquisition(&rig, plan, RunControl::new());
    acq.run().await.unwrap();

    let status = acq.status().await;
    assert_eq!(status.state, AcquisitionState::Done);
    assert_eq!(status.heartbeats, 4);
    assert_eq!(status.frames_written, 4);

    let metadata = rig.store.metadata("timelapse").await.unwrap();
    assert_eq!(metadata.shape, vec![1, 2, 2, 8, 8]);
    assert_eq!(metadata.dims, vec!["channel", "time", "position", "y", "x"]);
    assert_eq!(metadata.attributes["coords"]["time"], serde_json::json!(["t1", "t2"]));
    assert_eq!(
        metadata.attributes["coords"]["position"],
        serde_json::json!([[0.0, 0.0], [10.0, 20.0]])
    );

    // Positions are visited verbatim, once per acquired time point
    assert_eq!(
        rig.stage.moves().await,
        vec![(0.0, 0.0), (10.0, 20.0), (0.0, 0.0), (10.0, 20.0)]
    );
    assert!(rig.filter.history().await.contains(&"RFP".to_string()));
}

// =============================================================================
// Capture retries
// =============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    rig.camera.fail_next(9);
    let acq = acquisition(&rig, "name = \"retry\"\n[region]\npositions = [[0.0, 0.0]]\n", RunControl::new());

    acq.run().await.unwrap();
    assert_eq!(acq.status().await.state, AcquisitionState::Done);
    assert!(rig.store.chunk_written("retry", &[0, 0, 0]));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    rig.camera.fail_next(10);
    let acq = acquisition(&rig, "name = \"retry\"\n[region]\npositions = [[0.0, 0.0]]\n", RunControl::new());

    let err = acq.run().await.unwrap_err();
    assert_eq!(err.to_string(), "MockCamera: injected capture failure");

    let status = acq.status().await;
    assert_eq!(status.state, AcquisitionState::Failed);
    assert!(status
        .last_error
        .unwrap()
        .contains("injected capture failure"));
    assert_eq!(rig.camera.attempts(), 10);
}

// =============================================================================
// Pause, resume, cancel
// =============================================================================

#[tokio::test]
async fn test_pause_and_resume() {
    let rig = rig(MockCamera::new("camera", 16, 16).with_readout(Duration::from_millis(10))).await;
    let run = RunControl::new();
    let acq = Arc::new(acquisition(&rig, TILES_PLAN, run.clone()));

    let task = {
        let acq = acq.clone();
        tokio::spawn(async move { acq.run().await })
    };

    wait_until(|| {
        let acq = acq.clone();
        async move { acq.status().await.frames_written >= 2 }
    })
    .await;
    run.pause();
    assert!(acq.status().await.paused);

    // Let the frame in flight land, then nothing moves
    tokio::time::sleep(Duration::from_millis(60)).await;
    let before = acq.status().await.frames_written;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(acq.status().await.frames_written, before);
    assert!(before < 18);

    run.resume();
    task.await.unwrap().unwrap();
    let status = acq.status().await;
    assert_eq!(status.state, AcquisitionState::Done);
    assert_eq!(status.frames_written, 18);
}

#[tokio::test]
async fn test_quit_during_pause_cancels_and_keeps_written_chunks() {
    let rig = rig(MockCamera::new("camera", 16, 16).with_readout(Duration::from_millis(10))).await;
    let host = RunControl::new();
    let acq = Arc::new(acquisition(&rig, TILES_PLAN, host.child()));

    let task = {
        let acq = acq.clone();
        tokio::spawn(async move { acq.run().await })
    };

    wait_until(|| {
        let acq = acq.clone();
        async move { acq.status().await.frames_written >= 3 }
    })
    .await;
    host.pause();
    tokio::time::sleep(Duration::from_millis(40)).await;
    host.quit();

    // Cancellation is not an error
    task.await.unwrap().unwrap();
    let status = acq.status().await;
    assert_eq!(status.state, AcquisitionState::Cancelled);
    assert!(status.frames_written < 18);

    let metadata = rig.store.metadata("tiles").await.unwrap();
    assert_eq!(count_written(&rig.store, &metadata), status.frames_written);
    assert_eq!(
        rig.control.state("filter").await.unwrap(),
        StateValue::from("DAPI")
    );
}

#[tokio::test]
async fn test_run_cancel_leaves_host_running() {
    let rig = rig(MockCamera::new("camera", 16, 16).with_readout(Duration::from_millis(10))).await;
    let host = RunControl::new();
    let acq = Arc::new(acquisition(&rig, TILES_PLAN, host.child()));

    let task = {
        let acq = acq.clone();
        tokio::spawn(async move { acq.run().await })
    };
    wait_until(|| {
        let acq = acq.clone();
        async move { acq.status().await.frames_written >= 1 }
    })
    .await;

    acq.command(scope_daq::relay::routes::RunCommand::Cancel);
    task.await.unwrap().unwrap();
    assert_eq!(acq.status().await.state, AcquisitionState::Cancelled);
    assert!(!host.is_quit());
}

#[tokio::test]
async fn test_run_cancel_while_paused_keeps_host_paused() {
    let rig = rig(MockCamera::new("camera", 16, 16).with_readout(Duration::from_millis(10))).await;
    let host = RunControl::new();
    let acq = Arc::new(acquisition(&rig, TILES_PLAN, host.child()));

    let task = {
        let acq = acq.clone();
        tokio::spawn(async move { acq.run().await })
    };
    wait_until(|| {
        let acq = acq.clone();
        async move { acq.status().await.frames_written >= 1 }
    })
    .await;

    host.pause();
    acq.command(scope_daq::relay::routes::RunCommand::Cancel);
    task.await.unwrap().unwrap();

    assert_eq!(acq.status().await.state, AcquisitionState::Cancelled);
    assert!(host.is_paused());
    assert!(!host.is_quit());
}

#[tokio::test]
async fn test_run_executes_once() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    let acq = acquisition(&rig, "name = \"once\"\n[region]\npositions = [[0.0, 0.0]]\n", RunControl::new());
    acq.run().await.unwrap();
    assert!(acq.run().await.is_err());
}

// =============================================================================
// Operator-chosen region
// =============================================================================

#[tokio::test]
async fn test_awaiting_position_streams_live_then_runs_once() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    let acq = Arc::new(acquisition(&rig, "name = \"picked\"\noverlap = 0.5\n", RunControl::new()));

    let task = {
        let acq = acq.clone();
        tokio::spawn(async move { acq.run().await })
    };

    wait_until(|| {
        let acq = acq.clone();
        async move { acq.status().await.state == AcquisitionState::AwaitingPosition }
    })
    .await;
    wait_until(|| {
        let acq = acq.clone();
        async move { acq.live().latest().await.is_some() }
    })
    .await;
    // Nothing is declared while waiting
    assert!(acq.declared_arrays().await.is_empty());

    let corner = Region::Boundary(Boundary {
        top_left: (5.0, 5.0),
        bottom_right: (5.0, 5.0),
    });
    acq.submit_region(corner.clone()).await.unwrap();
    acq.submit_region(corner).await.unwrap();

    task.await.unwrap().unwrap();
    assert_eq!(acq.status().await.state, AcquisitionState::Done);
    assert_eq!(acq.declared_arrays().await, vec!["picked".to_string()]);

    let metadata = rig.store.metadata("picked").await.unwrap();
    assert_eq!(metadata.shape, vec![1, 1, 1, 1, 8, 8]);
    assert_eq!(rig.stage.moves().await, vec![(5.0, 5.0)]);
}

#[tokio::test]
async fn test_oversized_region_fails_the_run() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    let acq = acquisition(&rig, "name = \"huge\"\noverlap = 0.0\n", RunControl::new());

    // Submitted before the run reaches its region prompt
    acq.submit_region(Region::Boundary(Boundary {
        top_left: (0.0, 0.0),
        bottom_right: (1e300, 0.0),
    }))
    .await
    .unwrap();

    let err = acq.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GridError>(),
        Some(GridError::TooManyTiles(_))
    ));
    assert_eq!(acq.status().await.state, AcquisitionState::Failed);
    assert!(acq.declared_arrays().await.is_empty());
    assert!(rig.stage.moves().await.is_empty());
}

#[tokio::test]
async fn test_malformed_region_is_rejected() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    let acq = acquisition(&rig, "name = \"picked\"\n", RunControl::new());
    let result = acq
        .submit_region(Region::Boundary(Boundary {
            top_left: (f64::INFINITY, 0.0),
            bottom_right: (1.0, 1.0),
        }))
        .await;
    assert!(result.is_err());
}

// =============================================================================
// Store conflicts
// =============================================================================

#[tokio::test]
async fn test_existing_array_fails_the_run() {
    let rig = rig(MockCamera::new("camera", 8, 8)).await;
    let plan = "name = \"dup\"\n[region]\npositions = [[0.0, 0.0]]\n";

    acquisition(&rig, plan, RunControl::new()).run().await.unwrap();

    let second = acquisition(&rig, plan, RunControl::new());
    let err = second.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AlreadyExists(name)) if name == "dup"
    ));
    assert_eq!(second.status().await.state, AcquisitionState::Failed);
}
