//! IPC message types between the CLI and the relay host.

use serde::{Deserialize, Serialize};

/// Notification id, as assigned by the application that posted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub i64);

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A notification that was just posted somewhere on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Application that posted the notification
    pub source_app_id: String,
    /// Id the posting application gave it
    pub notification_id: NotificationId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Opaque handle that re-opens the conversation in the source app
    #[serde(default)]
    pub tap_action: Option<String>,
}

/// Commands sent from the CLI to the relay host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonCommand {
    /// Deliver an inbound notification event
    Post(NotificationEvent),
    /// Withdraw the substitute notification if one is showing
    Withdraw,
    /// Request host status
    Status,
    /// Graceful shutdown (no restart)
    Shutdown,
    /// Ping for health check
    Ping,
}

/// Relay counters since the host started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub received: u64,
    pub ignored: u64,
    pub disabled: u64,
    pub suppressed: u64,
    pub relayed: u64,
    pub failed: u64,
}

/// Response from the relay host to the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Operation completed successfully
    Ok,
    /// Error response
    Error { message: String },
    /// Pong response for health check
    Pong,
    /// Host status info
    Status {
        running: bool,
        uptime_secs: u64,
        /// RFC 3339 time the current substitute was displayed, if any
        substitute_displayed_at: Option<String>,
        /// RFC 3339 time the current substitute is due to be withdrawn
        substitute_expires_at: Option<String>,
        stats: RelayStatsSnapshot,
    },
}

fn cache_root() -> std::path::PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp"))
        .join("companion-relay")
}

/// Socket path for host communication
pub fn get_socket_path() -> std::path::PathBuf {
    cache_root().join("daemon.sock")
}

/// PID file path for the relay host
pub fn get_pid_file_path() -> std::path::PathBuf {
    cache_root().join("daemon.pid")
}

/// Start log used by the supervisor's restart backoff
pub fn get_backoff_file_path() -> std::path::PathBuf {
    cache_root().join("supervisor-backoff.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_optional_fields_default_to_none() {
        let json = r#"{"source_app_id":"com.tencent.mm","notification_id":42}"#;
        let event: NotificationEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.notification_id, NotificationId(42));
        assert!(event.title.is_none());
        assert!(event.body.is_none());
        assert!(event.tap_action.is_none());
    }

    #[test]
    fn test_post_command_wire_shape() {
        let command = DaemonCommand::Post(NotificationEvent {
            source_app_id: "com.tencent.mm".into(),
            notification_id: NotificationId(7),
            title: Some("Alice".into()),
            body: None,
            tap_action: None,
        });
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.starts_with(r#"{"Post":{"source_app_id":"com.tencent.mm","notification_id":7"#));
    }
}
