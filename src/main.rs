//! CLI entry point for scope-daq
//!
//! - `acquire`: run an acquisition plan, with the display as a child process
//! - `live`: stream live frames to the display without writing anything
//! - `display`: the display process itself; spawned by the other two, relay on
//!   stdin/stdout
//!
//! # Usage
//!
//! ```bash
//! scope-daq --config config/scope_daq.toml acquire demos/tiles.toml
//! scope-daq live
//! ```
//!
//! Logs always go to stderr. In the display process stdout belongs to the relay.

use anyhow::Result;
use clap::{Parser, Subcommand};
use scope_daq::config::AppConfig;
use scope_daq::data::ArrayStore;
use scope_daq::display::{DisplayApp, Selection};
use scope_daq::experiment::engine::{live_preview, register_live_routes};
use scope_daq::experiment::{Acquisition, AcquisitionSpec, Boundary, LiveView};
use scope_daq::hardware::registry::build_control;
use scope_daq::relay::routes::register_control_routes;
use scope_daq::relay::{Cancelled, DisplayLauncher, Relay, RunControl, Supervisor};
use scope_daq::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "scope-daq")]
#[command(about = "Tiled, scheduled microscope acquisition with a live display", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/scope_daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition plan
    Acquire {
        /// Path to the TOML plan
        plan: PathBuf,

        /// Run without launching the display
        #[arg(long)]
        no_display: bool,
    },

    /// Stream live frames to the display
    Live,

    /// Display process (spawned by `acquire` and `live`)
    Display {
        /// Only watch the live frame
        #[arg(long)]
        live_only: bool,

        /// Region to submit if the host is waiting for one: x0,y0,x1,y1
        #[arg(long, value_parser = parse_boundary, conflicts_with_all = ["position", "here"])]
        boundary: Option<Boundary>,

        /// Position to submit if the host is waiting for a region: x,y (repeatable)
        #[arg(long, value_parser = parse_position, conflicts_with = "here")]
        position: Vec<(f64, f64)>,

        /// Submit a single tile at the current stage position
        #[arg(long)]
        here: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    telemetry::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Acquire { plan, no_display } => {
            acquire(&config, cli.config.as_ref(), plan, no_display).await
        }
        Commands::Live => live(&config, cli.config.as_ref()).await,
        Commands::Display {
            live_only,
            boundary,
            position,
            here,
        } => {
            let selection = match (boundary, position.is_empty(), here) {
                (Some(boundary), _, _) => Some(Selection::Boundary(boundary)),
                (None, false, _) => Some(Selection::Positions(position)),
                (None, true, true) => Some(Selection::CurrentPosition),
                (None, true, false) => None,
            };
            display(&config, live_only, selection).await
        }
    }
}

async fn acquire(
    config: &AppConfig,
    config_path: Option<&PathBuf>,
    plan: PathBuf,
    no_display: bool,
) -> Result<()> {
    info!(plan = %plan.display(), "Loading acquisition plan");
    let spec = AcquisitionSpec::load(&plan)?;

    let control = Arc::new(build_control(&config.devices)?);
    let store = Arc::new(ArrayStore::create(&config.storage.root).await?);

    if no_display || !config.display.enabled {
        if spec.needs_region() {
            anyhow::bail!("The plan has no region and there is no display to choose one");
        }
        let run = RunControl::new();
        quit_on_interrupt(run.clone());
        let acquisition = Acquisition::new(spec, control, store, config.acquisition.clone(), run)?;
        let outcome = acquisition.run().await;
        report(&acquisition).await;
        return outcome;
    }

    let mut supervisor = Supervisor::new(launcher(config, config_path, false)?);
    let acquisition = Arc::new(Acquisition::new(
        spec,
        control.clone(),
        store,
        config.acquisition.clone(),
        supervisor.run_control().child(),
    )?);
    register_control_routes(&mut supervisor, control)?;
    acquisition.register_routes(&mut supervisor)?;
    supervisor.start()?;
    quit_on_interrupt(supervisor.run_control());

    let worker = acquisition.clone();
    supervisor.spawn_worker("acquisition", move |_| async move { worker.run().await });

    let outcome = supervisor.join_workers().await;
    report(&acquisition).await;
    if let Err(e) = supervisor.shutdown().await {
        error!(error = %e, "Display relay failed");
    }
    outcome
}

async fn live(config: &AppConfig, config_path: Option<&PathBuf>) -> Result<()> {
    let control = Arc::new(build_control(&config.devices)?);
    let view = Arc::new(LiveView::new());

    let mut supervisor = Supervisor::new(launcher(config, config_path, true)?);
    register_control_routes(&mut supervisor, control.clone())?;
    register_live_routes(&mut supervisor, view.clone())?;
    supervisor.start()?;
    quit_on_interrupt(supervisor.run_control());

    let settings = config.acquisition.clone();
    supervisor.spawn_worker("live", move |run| async move {
        match live_preview(&control, &view, &settings, &run).await {
            Err(e) if e.is::<Cancelled>() => Ok(()),
            other => other,
        }
    });

    let outcome = supervisor.join_workers().await;
    supervisor.shutdown().await?;
    outcome
}

async fn display(config: &AppConfig, live_only: bool, selection: Option<Selection>) -> Result<()> {
    let relay = Arc::new(Relay::stdio());
    DisplayApp::new(relay, &config.storage.root, config.display.poll_interval)
        .live_only(live_only)
        .run(selection)
        .await?;
    Ok(())
}

/// The display command line: this binary's `display` subcommand unless configured
/// otherwise, with the host's config file passed along.
fn launcher(
    config: &AppConfig,
    config_path: Option<&PathBuf>,
    live_only: bool,
) -> Result<DisplayLauncher> {
    let mut launcher = config.display_launcher()?;
    if let Some(path) = config_path {
        launcher.args.push("--config".to_string());
        launcher.args.push(path.display().to_string());
    }
    if live_only {
        launcher.args.push("--live-only".to_string());
    }
    Ok(launcher)
}

fn quit_on_interrupt(run: RunControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            run.quit();
        }
    });
}

async fn report(acquisition: &Acquisition) {
    let status = acquisition.status().await;
    info!(
        state = %status.state,
        written = status.frames_written,
        expected = ?status.frames_expected,
        array = ?status.array,
        "Acquisition finished"
    );
}

fn parse_floats<const N: usize>(text: &str) -> Result<[f64; N], String> {
    let values: Vec<f64> = text
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{v}': {e}")))
        .collect::<Result<_, _>>()?;
    values
        .try_into()
        .map_err(|_| format!("expected {N} comma-separated numbers, got '{text}'"))
}

fn parse_boundary(text: &str) -> Result<Boundary, String> {
    let [x0, y0, x1, y1] = parse_floats::<4>(text)?;
    Ok(Boundary {
        top_left: (x0, y0),
        bottom_right: (x1, y1),
    })
}

fn parse_position(text: &str) -> Result<(f64, f64), String> {
    let [x, y] = parse_floats::<2>(text)?;
    Ok((x, y))
}
