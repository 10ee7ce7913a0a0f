//! Host-side supervisor: owns the display process, the dispatch task that serves
//! routes to it, and the worker tasks that drive acquisition.
//!
//! # Lifecycle
//!
//! ```text
//! new/with_transport ──route/serve_get/serve_post──> start ──spawn_worker──> ...
//!                                                     │
//!         display exits / pipe breaks / quit() ───────┴──> quit: workers see
//!                                                          Cancelled, child is
//!                                                          terminated, pipe closed
//! ```
//!
//! The dispatch task reads `[route, args, kwargs]` requests one at a time, runs the
//! handler and writes its reply unless the route is a post route. A broken pipe or
//! end of stream is the display exiting: the supervisor quits and dispatch ends
//! cleanly. An unknown route or a failing handler also quits the supervisor and is
//! then returned from [`Supervisor::wait`], so the error is visible and the child is
//! not orphaned.

use futures::future::BoxFuture;
use futures::Future;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::relay::protocol::{self, Request};
use crate::relay::routes::{Call, GetRoute, Handler, PostRoute, Reply};
use crate::relay::run_control::RunControl;
use crate::relay::RelayError;

/// Boxed read half of a relay channel.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a relay channel.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long the display gets to exit on its own after the pipe closes.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Command line of the display process. Its stdin and stdout carry the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayLauncher {
    /// Executable
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
}

impl DisplayLauncher {
    /// Launcher for `program args...`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

enum Transport {
    Launch(DisplayLauncher),
    Streams(BoxReader, BoxWriter),
}

/// Owner of the display process, the route table and the worker tasks.
pub struct Supervisor {
    routes: HashMap<String, Handler>,
    transport: Option<Transport>,
    run: RunControl,
    started: bool,
    dispatch: Option<JoinHandle<Result<(), RelayError>>>,
    reaper: Option<JoinHandle<()>>,
    workers: Vec<(String, JoinHandle<anyhow::Result<()>>)>,
}

impl Supervisor {
    /// Supervisor that will spawn the display with `launcher` on [`start`](Self::start).
    pub fn new(launcher: DisplayLauncher) -> Self {
        Self::with(Transport::Launch(launcher))
    }

    /// Supervisor serving an already-connected channel instead of a child process.
    pub fn with_transport<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with(Transport::Streams(Box::new(reader), Box::new(writer)))
    }

    fn with(transport: Transport) -> Self {
        Self {
            routes: HashMap::new(),
            transport: Some(transport),
            run: RunControl::new(),
            started: false,
            dispatch: None,
            reaper: None,
            workers: Vec::new(),
        }
    }

    /// Register a raw handler under `name`. Only valid before `start`.
    pub fn route<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RelayError>
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        if self.started {
            return Err(RelayError::AlreadyStarted);
        }
        if self.routes.contains_key(name) {
            return Err(RelayError::DuplicateRoute(name.to_string()));
        }
        let boxed: Handler = Arc::new(
            move |call: Call| -> BoxFuture<'static, anyhow::Result<Reply>> {
                Box::pin(handler(call))
            },
        );
        self.routes.insert(name.to_string(), boxed);
        debug!(route = name, "Registered route");
        Ok(())
    }

    /// Serve a typed request/reply route.
    pub fn serve_get<R, F, Fut>(&mut self, handler: F) -> Result<(), RelayError>
    where
        R: GetRoute,
        F: Fn(R::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R::Reply>> + Send + 'static,
    {
        self.route(R::NAME, move |call: Call| {
            let pending = protocol::decode_args::<R::Args>(call.args).map(&handler);
            async move {
                let reply = pending?.await?;
                Ok(Reply::Value(serde_json::to_value(reply)?))
            }
        })
    }

    /// Serve a typed fire-and-forget route.
    pub fn serve_post<R, F, Fut>(&mut self, handler: F) -> Result<(), RelayError>
    where
        R: PostRoute,
        F: Fn(R::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.route(R::NAME, move |call: Call| {
            let pending = protocol::decode_args::<R::Args>(call.args).map(&handler);
            async move {
                pending?.await?;
                Ok(Reply::Nothing)
            }
        })
    }

    /// Names of the registered routes.
    pub fn route_names(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Spawn the display (or take the provided channel) and start serving routes.
    pub fn start(&mut self) -> Result<(), RelayError> {
        if self.started {
            return Err(RelayError::AlreadyStarted);
        }
        let transport = self.transport.take().ok_or(RelayError::NoTransport)?;

        let (reader, writer): (BoxReader, BoxWriter) = match transport {
            Transport::Streams(reader, writer) => (reader, writer),
            Transport::Launch(launcher) => {
                let mut child = launcher.command().spawn()?;
                let stdin = child.stdin.take().ok_or(RelayError::NoTransport)?;
                let stdout = child.stdout.take().ok_or(RelayError::NoTransport)?;
                info!(
                    pid = child.id(),
                    program = %launcher.program.display(),
                    "Display process started"
                );
                self.reaper = Some(tokio::spawn(reap(child, self.run.clone())));
                (Box::new(stdout), Box::new(stdin))
            }
        };

        self.started = true;
        let routes = Arc::new(std::mem::take(&mut self.routes));
        info!(routes = routes.len(), "Dispatch started");
        self.dispatch = Some(tokio::spawn(dispatch(
            routes,
            reader,
            writer,
            self.run.clone(),
        )));
        Ok(())
    }

    /// Run a worker with a handle on the run-control flags.
    pub fn spawn_worker<F, Fut>(&mut self, name: &str, worker: F)
    where
        F: FnOnce(RunControl) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task = worker(self.run.clone());
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => debug!(worker = %label, "Worker finished"),
                Err(e) => error!(worker = %label, error = %e, "Worker failed"),
            }
            result
        });
        self.workers.push((name.to_string(), handle));
    }

    /// Shared run-control flags.
    pub fn run_control(&self) -> RunControl {
        self.run.clone()
    }

    /// Clear the running gate.
    pub fn pause(&self) {
        info!("Pausing");
        self.run.pause();
    }

    /// Set the running gate.
    pub fn resume(&self) {
        info!("Resuming");
        self.run.resume();
    }

    /// Set quit, release paused workers, terminate the display and close the pipe.
    /// Idempotent.
    pub fn quit(&self) {
        if !self.run.is_quit() {
            info!("Quitting");
        }
        self.run.quit();
    }

    /// Whether quit has been set.
    pub fn is_quit(&self) -> bool {
        self.run.is_quit()
    }

    /// Wait for every worker. All are joined; the first failure is returned.
    pub async fn join_workers(&mut self) -> anyhow::Result<()> {
        let mut first_error = None;
        for (name, handle) in self.workers.drain(..) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Worker '{name}' panicked: {e}")),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Wait for dispatch to end and the display to exit.
    ///
    /// Returns the error that stopped dispatch, other than the display disconnecting.
    pub async fn wait(&mut self) -> Result<(), RelayError> {
        let result = match self.dispatch.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        };
        if let Some(reaper) = self.reaper.take() {
            if let Err(e) = reaper.await {
                warn!(error = %e, "Display reaper failed");
            }
        }
        result
    }

    /// Quit, then wait for dispatch and the display.
    pub async fn shutdown(&mut self) -> Result<(), RelayError> {
        self.quit();
        self.wait().await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.run.quit();
    }
}

async fn dispatch(
    routes: Arc<HashMap<String, Handler>>,
    mut reader: BoxReader,
    mut writer: BoxWriter,
    run: RunControl,
) -> Result<(), RelayError> {
    let result = serve(&routes, &mut reader, &mut writer, &run).await;

    run.quit();
    if let Err(e) = writer.shutdown().await {
        trace!(error = %e, "Relay pipe already closed");
    }

    match result {
        Ok(()) => {
            debug!("Dispatch stopped");
            Ok(())
        }
        Err(e) if e.is_disconnect() => {
            info!("Display disconnected");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Dispatch failed");
            Err(e)
        }
    }
}

async fn serve(
    routes: &HashMap<String, Handler>,
    reader: &mut BoxReader,
    writer: &mut BoxWriter,
    run: &RunControl,
) -> Result<(), RelayError> {
    loop {
        let Request(route, args, kwargs) = tokio::select! {
            biased;
            _ = run.cancelled() => return Ok(()),
            request = protocol::recv::<_, Request>(reader) => request?,
        };

        let handler = routes
            .get(&route)
            .ok_or_else(|| RelayError::UnknownRoute(route.clone()))?;
        trace!(%route, "Dispatching");

        let reply = handler(Call { args, kwargs })
            .await
            .map_err(|source| RelayError::Handler {
                route: route.clone(),
                source,
            })?;

        if let Reply::Value(value) = reply {
            protocol::send(writer, &value).await?;
        }
    }
}

async fn reap(mut child: Child, run: RunControl) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(%status, "Display process exited"),
                Err(e) => warn!(error = %e, "Failed to wait on display process"),
            }
            run.quit();
        }
        _ = run.cancelled() => {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "Display process exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait on display process"),
                Err(_) => {
                    warn!("Display process did not exit, terminating");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to terminate display process");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::routes::{Contrast, SetDeviceState};
    use serde_json::{json, Value};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_registration_after_start_is_rejected() {
        let (host, _display) = duplex(1024);
        let (reader, writer) = tokio::io::split(host);
        let mut supervisor = Supervisor::with_transport(reader, writer);
        supervisor
            .serve_get::<Contrast, _, _>(|(_channel,)| async { Ok(None) })
            .unwrap();
        assert!(matches!(
            supervisor.serve_get::<Contrast, _, _>(|(_channel,)| async { Ok(None) }),
            Err(RelayError::DuplicateRoute(_))
        ));

        supervisor.start().unwrap();
        assert!(matches!(
            supervisor.serve_post::<SetDeviceState, _, _>(|_| async { Ok(()) }),
            Err(RelayError::AlreadyStarted)
        ));
        assert!(matches!(supervisor.start(), Err(RelayError::AlreadyStarted)));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_route_sees_kwargs() {
        let (host, display) = duplex(1024);
        let (reader, writer) = tokio::io::split(host);
        let mut supervisor = Supervisor::with_transport(reader, writer);
        supervisor
            .route("echo", |call: Call| async move {
                Ok(Reply::Value(json!({"args": call.args, "kwargs": call.kwargs})))
            })
            .unwrap();
        supervisor.start().unwrap();

        let (mut rx, mut tx) = tokio::io::split(display);
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("fast".to_string(), json!(true));
        protocol::send(&mut tx, &Request("echo".into(), vec![json!(1)], kwargs))
            .await
            .unwrap();
        let reply: Value = protocol::recv(&mut rx).await.unwrap();
        assert_eq!(reply, json!({"args": [1], "kwargs": {"fast": true}}));

        drop(tx);
        drop(rx);
        supervisor.wait().await.unwrap();
        assert!(supervisor.is_quit());
    }

    #[tokio::test]
    async fn test_missing_transport() {
        let (host, _display) = duplex(64);
        let (reader, writer) = tokio::io::split(host);
        let mut supervisor = Supervisor::with_transport(reader, writer);
        supervisor.transport = None;
        assert!(matches!(supervisor.start(), Err(RelayError::NoTransport)));
    }
}
