//! Integration tests for the host/display relay
//!
//! The supervisor serves over one end of an in-memory duplex; a `Relay` client on
//! the other end plays the display.

use scope_daq::config::AcquisitionConfig;
use scope_daq::data::ArrayStore;
use scope_daq::display::{DisplayApp, Selection};
use scope_daq::experiment::{
    Acquisition, AcquisitionSpec, AcquisitionState, Boundary, RetryPolicy,
};
use scope_daq::hardware::capabilities::{ValveKey, ValveState};
use scope_daq::hardware::mock::{MockCamera, MockFilter, MockStage, MockValves};
use scope_daq::hardware::{Control, Device, StateValue};
use scope_daq::relay::routes::{
    register_control_routes, Contrast, DeclaredArrays, DeviceStates, RunCommand,
    RunCommandRoute, RunStatus, SetDeviceState, SetValve, StagePosition, SubmitBoundary,
    ValveStates,
};
use scope_daq::relay::{Relay, RelayError, Supervisor};
use std::sync::Arc;
use std::time::Duration;

fn control() -> Arc<Control> {
    let devices: Vec<Arc<dyn Device>> = vec![
        Arc::new(MockCamera::new("camera", 10, 10)),
        Arc::new(MockStage::new("stage").with_position(3.0, 4.0)),
        Arc::new(MockFilter::new("filter", &["DAPI", "GFP"])),
        Arc::new(MockValves::new("valves", 4).with_names(&["inlet", "outlet"])),
    ];
    Arc::new(Control::new(devices).unwrap())
}

/// A supervisor over an in-memory channel and the client end of it.
fn connect() -> (Supervisor, Relay) {
    let (host, display) = tokio::io::duplex(64 * 1024);
    let (host_rx, host_tx) = tokio::io::split(host);
    let (display_rx, display_tx) = tokio::io::split(display);
    (
        Supervisor::with_transport(host_rx, host_tx),
        Relay::new(display_rx, display_tx),
    )
}

// =============================================================================
// Control routes
// =============================================================================

#[tokio::test]
async fn test_control_routes() {
    let control = control();
    let (mut supervisor, relay) = connect();
    register_control_routes(&mut supervisor, control.clone()).unwrap();
    supervisor.start().unwrap();

    assert_eq!(relay.get::<StagePosition>(()).await.unwrap(), (3.0, 4.0));

    let valves = relay.get::<ValveStates>(()).await.unwrap();
    assert_eq!(valves.len(), 4);
    assert_eq!(valves[1].name.as_deref(), Some("outlet"));
    assert!(valves.iter().all(|v| v.state == ValveState::Closed));

    relay
        .post::<SetValve>((ValveKey::Name("inlet".into()), ValveState::Open))
        .await
        .unwrap();
    relay
        .post::<SetDeviceState>(("filter".into(), StateValue::from("GFP")))
        .await
        .unwrap();

    // Replies come back in order, so the posts above have been handled
    let valves = relay.get::<ValveStates>(()).await.unwrap();
    assert_eq!(valves[0].state, ValveState::Open);

    let states = relay.get::<DeviceStates>(()).await.unwrap();
    assert!(states.contains(&("filter".to_string(), StateValue::from("GFP"))));

    drop(relay);
    supervisor.wait().await.unwrap();
    assert!(supervisor.is_quit());
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_unknown_route_stops_the_supervisor() {
    let (mut supervisor, relay) = connect();
    register_control_routes(&mut supervisor, control()).unwrap();
    supervisor.start().unwrap();

    let err = relay.get_raw("teleport", vec![]).await.unwrap_err();
    assert!(err.is_disconnect());

    let err = supervisor.wait().await.unwrap_err();
    assert!(matches!(err, RelayError::UnknownRoute(route) if route == "teleport"));
    assert!(supervisor.is_quit());
}

#[tokio::test]
async fn test_handler_error_stops_the_supervisor() {
    let (mut supervisor, relay) = connect();
    register_control_routes(&mut supervisor, control()).unwrap();
    supervisor.start().unwrap();

    relay
        .post::<SetValve>((ValveKey::Index(99), ValveState::Open))
        .await
        .unwrap();

    let err = supervisor.wait().await.unwrap_err();
    match err {
        RelayError::Handler { route, source } => {
            assert_eq!(route, "set_valve");
            assert!(source.to_string().contains("out of range"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(supervisor.is_quit());
}

#[tokio::test]
async fn test_display_exit_is_a_clean_shutdown() {
    let (mut supervisor, relay) = connect();
    register_control_routes(&mut supervisor, control()).unwrap();
    supervisor.start().unwrap();
    let run = supervisor.run_control();

    relay.get::<StagePosition>(()).await.unwrap();
    drop(relay);

    tokio::time::timeout(Duration::from_secs(5), run.cancelled())
        .await
        .unwrap();
    supervisor.wait().await.unwrap();
}

// =============================================================================
// Acquisition over the relay
// =============================================================================

fn settings() -> AcquisitionConfig {
    AcquisitionConfig {
        retry: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        },
        channel_capacity: 4,
        live_interval: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn test_display_drives_an_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArrayStore::create(dir.path().join("run.zarr")).await.unwrap());
    let control = control();

    let spec = AcquisitionSpec::from_toml_str(
        r#"
name = "picked"
overlap = 0.0

[channels.dapi]
filter = "DAPI"
"#,
    )
    .unwrap();

    let (mut supervisor, relay) = connect();
    let acquisition = Arc::new(
        Acquisition::new(
            spec,
            control.clone(),
            store.clone(),
            settings(),
            supervisor.run_control().child(),
        )
        .unwrap(),
    );
    register_control_routes(&mut supervisor, control).unwrap();
    acquisition.register_routes(&mut supervisor).unwrap();
    supervisor.start().unwrap();

    let worker = acquisition.clone();
    supervisor.spawn_worker("acquisition", move |_| async move { worker.run().await });

    // Wait for the run to ask for a region
    let mut status = relay.get::<RunStatus>(()).await.unwrap();
    while status.state != AcquisitionState::AwaitingPosition {
        tokio::time::sleep(Duration::from_millis(5)).await;
        status = relay.get::<RunStatus>(()).await.unwrap();
    }
    assert!(relay.get::<DeclaredArrays>(()).await.unwrap().is_empty());

    relay
        .post::<SubmitBoundary>(((0.0, 0.0), (10.0, 0.0)))
        .await
        .unwrap();
    supervisor.join_workers().await.unwrap();

    let status = relay.get::<RunStatus>(()).await.unwrap();
    assert_eq!(status.state, AcquisitionState::Done);
    assert_eq!(status.frames_written, 2);
    assert_eq!(status.progress(), Some(1.0));
    assert_eq!(
        relay.get::<DeclaredArrays>(()).await.unwrap(),
        vec!["picked".to_string()]
    );

    let (lo, hi) = relay.get::<Contrast>((0,)).await.unwrap().unwrap();
    assert!(lo <= hi);
    assert_eq!(relay.get::<Contrast>((1,)).await.unwrap(), None);

    let reader = ArrayStore::open_read_only(store.root()).await.unwrap();
    assert_eq!(reader.metadata("picked").await.unwrap().shape, vec![1, 1, 1, 2, 10, 10]);

    drop(relay);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_run_cancel_keeps_the_relay_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArrayStore::create(dir.path().join("run.zarr")).await.unwrap());
    let control = control();
    let spec = AcquisitionSpec::from_toml_str("name = \"waiting\"\n").unwrap();

    let (mut supervisor, relay) = connect();
    let acquisition = Arc::new(
        Acquisition::new(
            spec,
            control.clone(),
            store,
            settings(),
            supervisor.run_control().child(),
        )
        .unwrap(),
    );
    acquisition.register_routes(&mut supervisor).unwrap();
    supervisor.start().unwrap();

    let worker = acquisition.clone();
    supervisor.spawn_worker("acquisition", move |_| async move { worker.run().await });

    let mut status = relay.get::<RunStatus>(()).await.unwrap();
    while status.state != AcquisitionState::AwaitingPosition {
        tokio::time::sleep(Duration::from_millis(5)).await;
        status = relay.get::<RunStatus>(()).await.unwrap();
    }

    relay
        .post::<RunCommandRoute>((RunCommand::Cancel,))
        .await
        .unwrap();
    supervisor.join_workers().await.unwrap();

    assert!(!supervisor.is_quit());
    let status = relay.get::<RunStatus>(()).await.unwrap();
    assert_eq!(status.state, AcquisitionState::Cancelled);

    drop(relay);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn test_display_connecting_before_the_run_still_submits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArrayStore::create(dir.path().join("run.zarr")).await.unwrap());
    let control = control();
    let spec = AcquisitionSpec::from_toml_str("name = \"early\"\noverlap = 0.1\n").unwrap();

    let (mut supervisor, relay) = connect();
    let acquisition = Arc::new(
        Acquisition::new(
            spec,
            control.clone(),
            store.clone(),
            settings(),
            supervisor.run_control().child(),
        )
        .unwrap(),
    );
    register_control_routes(&mut supervisor, control).unwrap();
    acquisition.register_routes(&mut supervisor).unwrap();
    supervisor.start().unwrap();

    let display = DisplayApp::new(Arc::new(relay), store.root(), Duration::from_millis(5));
    let selection = Selection::Boundary(Boundary {
        top_left: (7.0, 9.0),
        bottom_right: (7.0, 9.0),
    });
    let display = tokio::spawn(async move { display.run(Some(selection)).await });

    // The display sees an idle run first
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(acquisition.status().await.state, AcquisitionState::Idle);

    let worker = acquisition.clone();
    supervisor.spawn_worker("acquisition", move |_| async move { worker.run().await });
    tokio::time::timeout(Duration::from_secs(5), supervisor.join_workers())
        .await
        .unwrap()
        .unwrap();

    let status = acquisition.status().await;
    assert_eq!(status.state, AcquisitionState::Done);
    assert_eq!(status.frames_written, 1);

    supervisor.shutdown().await.unwrap();
    display.await.unwrap().unwrap();
}
