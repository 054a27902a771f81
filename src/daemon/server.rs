//! Unix socket server for the relay host.

use crate::daemon::notifier::{relay_channels, NotificationSink, PostRequest, KEEP_ALIVE_CHANNEL};
use crate::daemon::relay::RelayEngine;
use crate::ipc::messages::{
    get_pid_file_path, get_socket_path, DaemonCommand, DaemonResponse, NotificationId,
};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Id of the "relay is running" indicator.
pub const KEEP_ALIVE_ID: NotificationId = NotificationId(9999);

/// Why the host stopped serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    /// A client sent `Shutdown`
    Requested,
    /// Terminated from outside (SIGTERM/SIGINT); should be restarted
    Terminated,
}

/// Relay host: owns the engine and serves inbound events over a socket
pub struct RelayHost {
    engine: Arc<RelayEngine>,
    sink: Arc<dyn NotificationSink>,
    start_time: Instant,
    shutdown: Arc<Notify>,
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl RelayHost {
    /// Create a new host serving at the default socket
    pub fn new(engine: Arc<RelayEngine>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            engine,
            sink,
            start_time: Instant::now(),
            shutdown: Arc::new(Notify::new()),
            socket_path: get_socket_path(),
            pid_path: get_pid_file_path(),
        }
    }

    /// Serve at a different socket (and keep the PID file next to it)
    #[cfg(test)]
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.pid_path = socket_path.with_extension("pid");
        self.socket_path = socket_path;
        self
    }

    /// Run the host until shutdown is requested or the process is terminated.
    /// The keep-alive indicator, socket and PID file are removed on every
    /// exit path, including a failed start.
    pub async fn run(&self) -> Result<HostExit> {
        self.enter_foreground();
        let exit = self.serve().await;
        self.teardown().await;
        exit
    }

    async fn serve(&self) -> Result<HostExit> {
        // Handlers go in before the socket appears, so a client that can
        // connect can also rely on SIGTERM being handled.
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path).context("Failed to remove existing socket")?;
        }
        fs::write(&self.pid_path, std::process::id().to_string())
            .context("Failed to write PID file")?;

        let listener = UnixListener::bind(&self.socket_path).context("Failed to bind to socket")?;
        info!(path = %self.socket_path.display(), "Relay host listening");

        let exit = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let engine = Arc::clone(&self.engine);
                        let shutdown = Arc::clone(&self.shutdown);
                        let start_time = self.start_time;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, engine, shutdown, start_time).await {
                                debug!(error = %e, "Connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "Failed to accept connection"),
                },
                _ = self.shutdown.notified() => {
                    info!("Shutdown requested");
                    break HostExit::Requested;
                }
                _ = sigterm.recv() => {
                    warn!("Terminated unexpectedly, requesting restart");
                    break HostExit::Terminated;
                }
                _ = sigint.recv() => {
                    warn!("Interrupted, requesting restart");
                    break HostExit::Terminated;
                }
            }
        };
        Ok(exit)
    }

    /// Register channels and raise the keep-alive indicator. Failures are
    /// logged; the host keeps running without them.
    fn enter_foreground(&self) {
        if let Err(err) = self.sink.register_channels(&relay_channels()) {
            error!(error = %err, "Failed to register notification channels");
            return;
        }
        let indicator = PostRequest {
            channel_id: KEEP_ALIVE_CHANNEL.to_string(),
            id: KEEP_ALIVE_ID,
            title: "Companion relay".to_string(),
            body: "Relay running (this notice can be hidden)".to_string(),
            tap_action: None,
            auto_cancel: false,
            ongoing: true,
        };
        if let Err(err) = self.sink.post(&indicator) {
            error!(error = %err, "Failed to show keep-alive indicator");
        }
    }

    async fn teardown(&self) {
        self.engine.slot().withdraw().await;
        let sink = Arc::clone(&self.sink);
        let cancelled = tokio::task::spawn_blocking(move || sink.cancel(KEEP_ALIVE_ID)).await;
        if let Ok(Err(err)) = cancelled {
            warn!(error = %err, "Failed to remove keep-alive indicator");
        }
        let _ = fs::remove_file(&self.socket_path);
        let _ = fs::remove_file(&self.pid_path);
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    engine: Arc<RelayEngine>,
    shutdown: Arc<Notify>,
    start_time: Instant,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command: DaemonCommand = match serde_json::from_str(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                let response = DaemonResponse::Error {
                    message: format!("Invalid command: {}", e),
                };
                send_response(&mut writer, &response).await?;
                continue;
            }
        };

        let response = handle_command(command, &engine, &shutdown, start_time).await;
        send_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Handle a single command and return a response
async fn handle_command(
    command: DaemonCommand,
    engine: &Arc<RelayEngine>,
    shutdown: &Notify,
    start_time: Instant,
) -> DaemonResponse {
    match command {
        DaemonCommand::Post(event) => {
            debug!(source = %event.source_app_id, id = %event.notification_id, "Event received");
            // Fire and forget: the outcome is logged by the engine.
            drop(engine.dispatch(event));
            DaemonResponse::Ok
        }

        DaemonCommand::Withdraw => {
            engine.slot().withdraw().await;
            DaemonResponse::Ok
        }

        DaemonCommand::Status => DaemonResponse::Status {
            running: true,
            uptime_secs: start_time.elapsed().as_secs(),
            substitute_displayed_at: engine.slot().displayed_at().await.map(|t| t.to_rfc3339()),
            substitute_expires_at: engine.slot().expires_at().await.map(|t| t.to_rfc3339()),
            stats: engine.stats(),
        },

        DaemonCommand::Shutdown => {
            shutdown.notify_one();
            DaemonResponse::Ok
        }

        DaemonCommand::Ping => DaemonResponse::Pong,
    }
}

/// Send a response to a client
async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// PID recorded by the last host start, if that process is still alive
pub fn running_host_pid() -> Option<u32> {
    let pid: u32 = fs::read_to_string(get_pid_file_path())
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let sys = sysinfo::System::new_all();
    sys.process(sysinfo::Pid::from_u32(pid)).map(|_| pid)
}
