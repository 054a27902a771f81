//! Lifecycle supervisor.
//!
//! Keeps the relay host alive: the host is started on `BootCompleted` or
//! `Restart`, and when it exits abnormally the supervisor sends itself a
//! `Restart`. A clean host exit (the user asked it to stop) or a `Shutdown`
//! signal ends supervision.

use crate::daemon::backoff::{self, BackoffPolicy};
use crate::ipc::client::DaemonClient;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

/// Host exit code meaning "terminated unexpectedly, please restart me".
pub const EXIT_RESTART_REQUESTED: i32 = 75;

/// How long a stopping host gets before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Host system finished booting (or the supervisor was just launched)
    BootCompleted,
    /// Start the host again after it went away
    Restart,
    /// Stop the host and end supervision
    Shutdown,
}

/// How a supervised execution unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// Stopped on request; do not restart
    Clean,
    /// Unit asked to be restarted
    RestartRequested,
    /// Unit failed or was killed
    Failed(String),
}

impl UnitExit {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => UnitExit::Clean,
            Some(EXIT_RESTART_REQUESTED) => UnitExit::RestartRequested,
            Some(code) => UnitExit::Failed(format!("exit code {}", code)),
            None => UnitExit::Failed("terminated by signal".to_string()),
        }
    }

    fn wants_restart(&self) -> bool {
        !matches!(self, UnitExit::Clean)
    }
}

/// Why supervision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// A `Shutdown` signal arrived
    ShutdownRequested,
    /// The unit exited cleanly on its own
    UnitStopped,
    /// Every signal sender went away
    SignalsClosed,
}

pub struct Supervisor {
    signals_tx: mpsc::Sender<LifecycleSignal>,
    signals_rx: mpsc::Receiver<LifecycleSignal>,
    backoff: Option<(PathBuf, BackoffPolicy)>,
}

struct RunningUnit {
    handle: JoinHandle<UnitExit>,
    stop_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (signals_tx, signals_rx) = mpsc::channel(16);
        Self {
            signals_tx,
            signals_rx,
            backoff: None,
        }
    }

    /// Persist starts at `path` and back off when the unit keeps dying.
    pub fn with_backoff(self, path: PathBuf) -> Self {
        self.with_backoff_policy(path, BackoffPolicy::default())
    }

    pub fn with_backoff_policy(mut self, path: PathBuf, policy: BackoffPolicy) -> Self {
        self.backoff = Some((path, policy));
        self
    }

    /// Sender for delivering lifecycle signals from outside.
    pub fn signals(&self) -> mpsc::Sender<LifecycleSignal> {
        self.signals_tx.clone()
    }

    /// Supervise units produced by `launch` until shutdown.
    ///
    /// `launch` receives a stop flag; a unit should wind down and return
    /// `UnitExit::Clean` once it flips to `true`.
    pub async fn run<F, Fut>(mut self, mut launch: F) -> SupervisorExit
    where
        F: FnMut(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = UnitExit> + Send + 'static,
    {
        let mut running: Option<RunningUnit> = None;
        // A start held back by restart backoff
        let mut pending: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                signal = self.signals_rx.recv() => match signal {
                    Some(LifecycleSignal::BootCompleted) | Some(LifecycleSignal::Restart) => {
                        if running.is_some() || pending.is_some() {
                            debug!(?signal, "Host already running or about to start");
                            continue;
                        }
                        let delay = self.start_delay().await;
                        if delay.is_zero() {
                            info!(?signal, "Starting relay host");
                            running = Some(start_unit(&mut launch));
                        } else {
                            info!(?signal, delay_secs = delay.as_secs(), "Relay host start held back");
                            pending = Some(Box::pin(tokio::time::sleep(delay)));
                        }
                    }
                    Some(LifecycleSignal::Shutdown) => {
                        if let Some(unit) = running.take() {
                            stop_unit(unit).await;
                        }
                        info!("Supervisor shutting down");
                        return SupervisorExit::ShutdownRequested;
                    }
                    None => {
                        if let Some(unit) = running.take() {
                            stop_unit(unit).await;
                        }
                        return SupervisorExit::SignalsClosed;
                    }
                },
                _ = wait_pending(&mut pending), if pending.is_some() => {
                    pending = None;
                    info!("Starting relay host after backoff");
                    running = Some(start_unit(&mut launch));
                }
                exit = wait_unit(&mut running), if running.is_some() => {
                    running = None;
                    if !exit.wants_restart() {
                        info!("Relay host stopped cleanly");
                        return SupervisorExit::UnitStopped;
                    }
                    warn!(?exit, "Relay host terminated, requesting restart");
                    if let Err(err) = self.signals_tx.try_send(LifecycleSignal::Restart) {
                        error!(error = %err, "Failed to emit restart signal");
                    }
                }
            }
        }
    }

    /// Record a start and return how long it must wait.
    async fn start_delay(&self) -> Duration {
        let Some((path, policy)) = self.backoff.clone() else {
            return Duration::ZERO;
        };
        tokio::task::spawn_blocking(move || backoff::record_start(&path, &policy))
            .await
            .ok()
            .flatten()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn start_unit<F, Fut>(launch: &mut F) -> RunningUnit
where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = UnitExit> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    RunningUnit {
        handle: tokio::spawn(launch(stop_rx)),
        stop_tx,
    }
}

async fn wait_pending(pending: &mut Option<Pin<Box<Sleep>>>) {
    match pending.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

async fn wait_unit(running: &mut Option<RunningUnit>) -> UnitExit {
    match running.as_mut() {
        Some(unit) => join_exit((&mut unit.handle).await),
        None => std::future::pending().await,
    }
}

fn join_exit(result: Result<UnitExit, tokio::task::JoinError>) -> UnitExit {
    result.unwrap_or_else(|err| UnitExit::Failed(format!("unit task failed: {}", err)))
}

async fn stop_unit(mut unit: RunningUnit) {
    let _ = unit.stop_tx.send(true);
    match tokio::time::timeout(STOP_GRACE, &mut unit.handle).await {
        Ok(result) => debug!(exit = ?join_exit(result), "Relay host stopped"),
        Err(_) => {
            warn!("Relay host did not stop in time, aborting");
            unit.handle.abort();
        }
    }
}

/// Run the relay host as a child process (`<exe> <args>`) until it exits or
/// `stop` flips.
///
/// The child is killed if this future is dropped.
pub async fn run_host_process(
    exe: PathBuf,
    args: Vec<String>,
    socket_path: PathBuf,
    mut stop: watch::Receiver<bool>,
) -> UnitExit {
    let mut child = match Command::new(&exe)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return UnitExit::Failed(format!("failed to spawn host: {}", err)),
    };
    debug!(pid = ?child.id(), "Relay host process spawned");

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => UnitExit::from_status(status),
            Err(err) => UnitExit::Failed(format!("failed to wait for host: {}", err)),
        },
        _ = async { let _ = stop.wait_for(|stop| *stop).await; } => {
            request_host_shutdown(&socket_path).await;
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(_)) => UnitExit::Clean,
                _ => {
                    warn!("Relay host ignored shutdown, killing it");
                    let _ = child.kill().await;
                    UnitExit::Clean
                }
            }
        }
    }
}

async fn request_host_shutdown(socket_path: &Path) {
    let socket_path = socket_path.to_path_buf();
    let delivered = tokio::task::spawn_blocking(move || {
        let mut client = DaemonClient::new();
        client.connect_to(&socket_path) && client.shutdown()
    })
    .await
    .unwrap_or(false);
    if !delivered {
        debug!("Relay host did not acknowledge shutdown");
    }
}
