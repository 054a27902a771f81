//! Platform-native notifications for the relay host.
//!
//! Everything the relay shows goes through [`NotificationSink`]: the
//! keep-alive indicator and the substitute notifications. Channels must be
//! registered before anything is posted on them.

use crate::common::command::{run_tool, TOOL_TIMEOUT};
use crate::common::error::{RelayError, Result};
use crate::daemon::filter::RELAY_APP_ID;
use crate::ipc::messages::NotificationId;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Channel carrying the "relay is running" indicator.
pub const KEEP_ALIVE_CHANNEL: &str = "keep_alive";
/// Channel carrying relayed messages.
pub const RELAY_MESSAGE_CHANNEL: &str = "relay_message";

/// Presentation importance of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Importance {
    Low,
    Default,
}

/// Presentation channel registered with the sink before first use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub importance: Importance,
    pub show_badge: bool,
    pub vibration: bool,
    pub sound: bool,
}

/// The two channels the relay posts on. Both are silent.
pub fn relay_channels() -> Vec<ChannelSpec> {
    vec![
        ChannelSpec {
            id: KEEP_ALIVE_CHANNEL.to_string(),
            name: "Background relay service".to_string(),
            description: "Keeps the relay running; safe to hide, relaying is unaffected"
                .to_string(),
            importance: Importance::Low,
            show_badge: false,
            vibration: false,
            sound: false,
        },
        ChannelSpec {
            id: RELAY_MESSAGE_CHANNEL.to_string(),
            name: "Relayed messages".to_string(),
            description: "Messages shown while the companion device is away".to_string(),
            importance: Importance::Default,
            show_badge: true,
            vibration: false,
            sound: false,
        },
    ]
}

/// A notification to display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRequest {
    pub channel_id: String,
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub tap_action: Option<String>,
    /// Dismiss when the user activates it
    pub auto_cancel: bool,
    /// Stay up until explicitly cancelled
    pub ongoing: bool,
}

/// Outbound notification pipeline.
pub trait NotificationSink: Send + Sync {
    fn register_channels(&self, channels: &[ChannelSpec]) -> Result<()>;
    /// Show a notification; a repeat id replaces the earlier one.
    fn post(&self, request: &PostRequest) -> Result<()>;
    /// Remove a notification. Unknown ids are not an error.
    fn cancel(&self, id: NotificationId) -> Result<()>;
}

#[derive(Debug, Default)]
struct ChannelRegistry {
    channels: Mutex<HashMap<String, ChannelSpec>>,
}

impl ChannelRegistry {
    fn register(&self, channels: &[ChannelSpec]) {
        let mut map = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        for channel in channels {
            debug!(
                id = %channel.id,
                name = %channel.name,
                description = %channel.description,
                importance = ?channel.importance,
                badge = channel.show_badge,
                vibration = channel.vibration,
                sound = channel.sound,
                "Notification channel registered"
            );
            map.insert(channel.id.clone(), channel.clone());
        }
    }

    fn lookup(&self, channel_id: &str) -> Result<ChannelSpec> {
        self.channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(channel_id)
            .cloned()
            .ok_or_else(|| RelayError::ChannelNotRegistered(channel_id.to_string()))
    }
}

// ============================================================================
// Desktop sink
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
enum Backend {
    /// libnotify `notify-send`, closed through `gdbus`
    NotifySend,
    /// macOS `terminal-notifier`
    TerminalNotifier,
    /// macOS `osascript`; cannot withdraw notifications or route taps
    AppleScript,
}

/// Action key `notify-send --wait` prints when the notification body is clicked.
const DEFAULT_ACTION: &str = "default";

/// Sink that talks to the desktop notification service.
pub struct DesktopSink {
    backend: Backend,
    registry: ChannelRegistry,
    /// Local notification id -> id assigned by the notification server
    server_ids: Mutex<HashMap<NotificationId, u32>>,
    /// `notify-send --wait` processes listening for activation
    watchers: Mutex<HashMap<NotificationId, Child>>,
}

impl DesktopSink {
    /// Pick the best available backend for this platform.
    pub fn detect() -> Result<Self> {
        let backend = detect_backend().ok_or(RelayError::SinkUnavailable)?;
        debug!(?backend, "Notification backend selected");
        Ok(Self {
            backend,
            registry: ChannelRegistry::default(),
            server_ids: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    fn post_linux(&self, channel: &ChannelSpec, request: &PostRequest) -> Result<()> {
        self.stop_watcher(request.id);
        let args = notify_send_args(channel, request, self.server_id(request.id));

        let server_id = match &request.tap_action {
            Some(tap) => self.post_with_activation(request.id, &args, tap)?,
            None => parse_server_id(&run_tool("notify-send", &args, TOOL_TIMEOUT)?),
        };
        match server_id {
            Some(server_id) => {
                self.lock_ids().insert(request.id, server_id);
            }
            None => debug!(id = %request.id, "notify-send did not report a notification id"),
        }
        Ok(())
    }

    /// Post through a `notify-send --wait` that lives as long as the
    /// notification, opening `tap` if the user activates it.
    fn post_with_activation(
        &self,
        id: NotificationId,
        args: &[String],
        tap: &str,
    ) -> Result<Option<u32>> {
        let mut child = Command::new("notify-send")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| RelayError::command_failed("notify-send", err.to_string()))?;
        let Some(stdout) = child.stdout.take() else {
            reap(child);
            return Err(RelayError::command_failed("notify-send", "stdout not captured"));
        };

        let (id_tx, id_rx) = mpsc::channel();
        let tap = tap.to_string();
        thread::spawn(move || {
            watch_activation(BufReader::new(stdout), id_tx, || open_tap_action(&tap))
        });

        match id_rx.recv_timeout(TOOL_TIMEOUT) {
            Ok(Some(server_id)) => {
                self.lock_watchers().insert(id, child);
                Ok(Some(server_id))
            }
            _ => {
                reap(child);
                Err(RelayError::command_failed(
                    "notify-send",
                    "notification was not posted",
                ))
            }
        }
    }

    fn cancel_linux(&self, id: NotificationId) -> Result<()> {
        self.stop_watcher(id);
        let Some(server_id) = self.lock_ids().remove(&id) else {
            return Ok(());
        };
        run_tool(
            "gdbus",
            &[
                "call".to_string(),
                "--session".to_string(),
                "--dest=org.freedesktop.Notifications".to_string(),
                "--object-path=/org/freedesktop/Notifications".to_string(),
                "--method=org.freedesktop.Notifications.CloseNotification".to_string(),
                server_id.to_string(),
            ],
            TOOL_TIMEOUT,
        )
        .map(|_| ())
    }

    fn post_terminal_notifier(&self, request: &PostRequest) -> Result<()> {
        let mut args = vec![
            "-title".to_string(),
            request.title.clone(),
            "-message".to_string(),
            request.body.clone(),
            "-group".to_string(),
            group_name(request.id),
        ];
        if let Some(tap) = &request.tap_action {
            args.push("-open".to_string());
            args.push(tap.clone());
        }
        run_tool("terminal-notifier", &args, TOOL_TIMEOUT).map(|_| ())
    }

    fn cancel_terminal_notifier(&self, id: NotificationId) -> Result<()> {
        run_tool(
            "terminal-notifier",
            &["-remove".to_string(), group_name(id)],
            TOOL_TIMEOUT,
        )
        .map(|_| ())
    }

    fn post_applescript(&self, request: &PostRequest) -> Result<()> {
        if request.tap_action.is_some() {
            debug!(id = %request.id, "osascript notifications cannot open the source app");
        }
        run_tool(
            "osascript",
            &["-e".to_string(), applescript_notification(request)],
            TOOL_TIMEOUT,
        )
        .map(|_| ())
    }

    fn server_id(&self, id: NotificationId) -> Option<u32> {
        self.lock_ids().get(&id).copied()
    }

    fn stop_watcher(&self, id: NotificationId) {
        if let Some(child) = self.lock_watchers().remove(&id) {
            reap(child);
        }
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, HashMap<NotificationId, u32>> {
        self.server_ids.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, HashMap<NotificationId, Child>> {
        self.watchers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl NotificationSink for DesktopSink {
    fn register_channels(&self, channels: &[ChannelSpec]) -> Result<()> {
        self.registry.register(channels);
        Ok(())
    }

    fn post(&self, request: &PostRequest) -> Result<()> {
        let channel = self.registry.lookup(&request.channel_id)?;
        match self.backend {
            Backend::NotifySend => self.post_linux(&channel, request),
            Backend::TerminalNotifier => self.post_terminal_notifier(request),
            Backend::AppleScript => self.post_applescript(request),
        }
    }

    fn cancel(&self, id: NotificationId) -> Result<()> {
        match self.backend {
            Backend::NotifySend => self.cancel_linux(id),
            Backend::TerminalNotifier => self.cancel_terminal_notifier(id),
            Backend::AppleScript => {
                debug!(id = %id, "osascript notifications cannot be withdrawn");
                Ok(())
            }
        }
    }
}

impl Drop for DesktopSink {
    fn drop(&mut self) {
        for (_, child) in self.lock_watchers().drain() {
            reap(child);
        }
    }
}

/// Argument list for `notify-send`. The message text always follows `--`,
/// so content starting with `-` is never parsed as an option.
fn notify_send_args(
    channel: &ChannelSpec,
    request: &PostRequest,
    replace_id: Option<u32>,
) -> Vec<String> {
    let urgency = match channel.importance {
        Importance::Low => "low",
        Importance::Default => "normal",
    };
    let mut args: Vec<String> = vec![
        "--print-id".into(),
        format!("--app-name={}", RELAY_APP_ID),
        format!("--urgency={}", urgency),
        format!("--category=im.{}", channel.id),
    ];
    if !channel.sound {
        args.push("--hint=boolean:suppress-sound:true".into());
    }
    if request.ongoing {
        args.push("--expire-time=0".into());
        args.push("--hint=boolean:resident:true".into());
    } else if request.auto_cancel {
        args.push("--hint=boolean:resident:false".into());
    }
    if request.tap_action.is_some() {
        args.push(format!("--action={}=Open", DEFAULT_ACTION));
        args.push("--wait".into());
    }
    if let Some(server_id) = replace_id {
        args.push(format!("--replace-id={}", server_id));
    }
    args.push("--".into());
    args.push(request.title.clone());
    args.push(request.body.clone());
    args
}

fn parse_server_id(line: &str) -> Option<u32> {
    line.trim().parse().ok()
}

/// Follow a `notify-send --print-id --wait` transcript: the first line is
/// the server id, later lines name invoked actions.
fn watch_activation<R: BufRead>(
    reader: R,
    id_tx: mpsc::Sender<Option<u32>>,
    on_activate: impl FnOnce(),
) {
    let mut lines = reader.lines().map_while(std::result::Result::ok);
    let server_id = lines.next().as_deref().and_then(parse_server_id);
    let _ = id_tx.send(server_id);
    if server_id.is_none() {
        return;
    }
    for line in lines {
        if line.trim() == DEFAULT_ACTION {
            on_activate();
            return;
        }
    }
}

fn open_tap_action(tap: &str) {
    info!(tap, "Substitute activated, opening source conversation");
    if let Err(err) = run_tool("xdg-open", &[tap], TOOL_TIMEOUT) {
        warn!(error = %err, "Failed to open source conversation");
    }
}

fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn group_name(id: NotificationId) -> String {
    format!("{}-{}", RELAY_APP_ID, id)
}

fn applescript_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn applescript_notification(request: &PostRequest) -> String {
    format!(
        "display notification {} with title {}",
        applescript_quote(&request.body),
        applescript_quote(&request.title)
    )
}

fn tool_exists(program: &str) -> bool {
    run_tool("which", &[program], TOOL_TIMEOUT).is_ok()
}

#[cfg(target_os = "macos")]
fn detect_backend() -> Option<Backend> {
    if tool_exists("terminal-notifier") {
        Some(Backend::TerminalNotifier)
    } else {
        // osascript ships with macOS
        Some(Backend::AppleScript)
    }
}

#[cfg(not(target_os = "macos"))]
fn detect_backend() -> Option<Backend> {
    (tool_exists("notify-send") && tool_exists("gdbus")).then_some(Backend::NotifySend)
}

/// Check if a desktop notification backend is available
pub fn is_notification_available() -> bool {
    detect_backend().is_some()
}

// ============================================================================
// Log sink
// ============================================================================

/// Fallback sink for headless hosts: notifications only reach the log.
#[derive(Debug, Default)]
pub struct LogSink {
    registry: ChannelRegistry,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSink for LogSink {
    fn register_channels(&self, channels: &[ChannelSpec]) -> Result<()> {
        self.registry.register(channels);
        Ok(())
    }

    fn post(&self, request: &PostRequest) -> Result<()> {
        let channel = self.registry.lookup(&request.channel_id)?;
        info!(
            channel = %channel.name,
            id = %request.id,
            title = %request.title,
            body = %request.body,
            "Notification"
        );
        Ok(())
    }

    fn cancel(&self, id: NotificationId) -> Result<()> {
        info!(id = %id, "Notification withdrawn");
        Ok(())
    }
}

/// Desktop sink when the platform has one, log sink otherwise.
pub fn default_sink() -> Box<dyn NotificationSink> {
    match DesktopSink::detect() {
        Ok(sink) => Box::new(sink),
        Err(err) => {
            warn!(error = %err, "Falling back to log-only notifications");
            Box::new(LogSink::new())
        }
    }
}
