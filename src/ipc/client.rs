//! Client for talking to the relay host.

use crate::ipc::messages::{
    get_socket_path, DaemonCommand, DaemonResponse, NotificationEvent, RelayStatsSnapshot,
};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Client for communicating with the relay host
pub struct DaemonClient {
    stream: Option<UnixStream>,
}

impl DaemonClient {
    /// Create a new client
    pub fn new() -> Self {
        Self { stream: None }
    }

    /// Try to connect to the host at the default socket
    pub fn connect(&mut self) -> bool {
        self.connect_to(&get_socket_path())
    }

    /// Try to connect to the host at a specific socket
    pub fn connect_to(&mut self, socket_path: &Path) -> bool {
        if !socket_path.exists() {
            self.stream = None;
            return false;
        }

        match UnixStream::connect(socket_path) {
            Ok(stream) => {
                let _ = stream.set_read_timeout(Some(Duration::from_millis(2000)));
                let _ = stream.set_write_timeout(Some(Duration::from_millis(1000)));
                self.stream = Some(stream);
                true
            }
            Err(_) => {
                self.stream = None;
                false
            }
        }
    }

    /// Send a command and receive a response
    pub fn send_command(&mut self, command: DaemonCommand) -> Option<DaemonResponse> {
        let stream = self.stream.as_mut()?;

        let json = serde_json::to_string(&command).ok()?;
        writeln!(stream, "{}", json).ok()?;
        stream.flush().ok()?;

        let mut reader = BufReader::new(stream.try_clone().ok()?);
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;

        serde_json::from_str(&line).ok()
    }

    /// Hand an inbound notification to the relay
    pub fn post(&mut self, event: NotificationEvent) -> bool {
        matches!(
            self.send_command(DaemonCommand::Post(event)),
            Some(DaemonResponse::Ok)
        )
    }

    /// Check host status
    pub fn status(&mut self) -> Option<HostStatus> {
        match self.send_command(DaemonCommand::Status)? {
            DaemonResponse::Status {
                running,
                uptime_secs,
                substitute_displayed_at,
                substitute_expires_at,
                stats,
            } => Some(HostStatus {
                running,
                uptime_secs,
                substitute_displayed_at,
                substitute_expires_at,
                stats,
            }),
            _ => None,
        }
    }

    /// Ask the host to shut down without being restarted
    pub fn shutdown(&mut self) -> bool {
        matches!(
            self.send_command(DaemonCommand::Shutdown),
            Some(DaemonResponse::Ok)
        )
    }

    /// Ping host for health check
    pub fn ping(&mut self) -> bool {
        matches!(self.send_command(DaemonCommand::Ping), Some(DaemonResponse::Pong))
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Host status information
#[derive(Debug)]
pub struct HostStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub substitute_displayed_at: Option<String>,
    pub substitute_expires_at: Option<String>,
    pub stats: RelayStatsSnapshot,
}
