//! Relay decision engine.
//!
//! For every inbound notification: filter, read the configuration, probe the
//! companion, then either suppress or re-post the message into the
//! substitute slot. Each event runs on its own worker task so intake never
//! waits on the probe; there is no ordering guarantee between workers. The
//! slot serializes overlapping relays, and the last one posted wins.

use crate::common::config::ConfigSource;
use crate::daemon::filter::{FilterDecision, RelayFilter, SUBSTITUTE_ID};
use crate::daemon::notifier::{PostRequest, RELAY_MESSAGE_CHANNEL};
use crate::daemon::probe::ConnectivityProbe;
use crate::daemon::slot::SubstituteSlot;
use crate::ipc::messages::{NotificationEvent, RelayStatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Title used when the original notification has none.
pub const DEFAULT_TITLE: &str = "WeChat";
/// Body used when the original notification has none.
pub const DEFAULT_BODY: &str = "New message received";
/// Upper bound on events processed at once.
pub const DEFAULT_MAX_WORKERS: usize = 8;
/// How long a relay decision waits for the probe before assuming the
/// companion is away. Covers every tool call one probe can make.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a single relay decision currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Probing,
    Suppressed,
    Relaying,
}

/// How a relay decision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Rejected by the filter
    Ignored(FilterDecision),
    /// No companion configured (or configuration unreadable)
    Disabled,
    /// Companion connected, nothing to do
    Suppressed,
    /// Substitute posted
    Relayed,
    /// Substitute could not be posted
    Failed(String),
}

#[derive(Debug, Default)]
struct RelayStats {
    received: AtomicU64,
    ignored: AtomicU64,
    disabled: AtomicU64,
    suppressed: AtomicU64,
    relayed: AtomicU64,
    failed: AtomicU64,
}

impl RelayStats {
    fn record(&self, outcome: &RelayOutcome) {
        let counter = match outcome {
            RelayOutcome::Ignored(_) => &self.ignored,
            RelayOutcome::Disabled => &self.disabled,
            RelayOutcome::Suppressed => &self.suppressed,
            RelayOutcome::Relayed => &self.relayed,
            RelayOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            disabled: self.disabled.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct RelayEngine {
    filter: RelayFilter,
    config: Arc<dyn ConfigSource>,
    probe: Arc<dyn ConnectivityProbe>,
    slot: SubstituteSlot,
    workers: Arc<Semaphore>,
    probe_timeout: Duration,
    stats: RelayStats,
}

impl RelayEngine {
    pub fn new(
        filter: RelayFilter,
        config: Arc<dyn ConfigSource>,
        probe: Arc<dyn ConnectivityProbe>,
        slot: SubstituteSlot,
    ) -> Self {
        Self {
            filter,
            config,
            probe,
            slot,
            workers: Arc::new(Semaphore::new(DEFAULT_MAX_WORKERS)),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            stats: RelayStats::default(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(max_workers.max(1)));
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn slot(&self) -> &SubstituteSlot {
        &self.slot
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Hand an event to a worker and return immediately.
    pub fn dispatch(self: &Arc<Self>, event: NotificationEvent) -> JoinHandle<RelayOutcome> {
        let engine = Arc::clone(self);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            // The semaphore is never closed, so acquiring cannot fail.
            let _permit = workers.acquire_owned().await.ok();
            engine.on_event(event).await
        })
    }

    /// Run one relay decision to completion.
    pub async fn on_event(&self, event: NotificationEvent) -> RelayOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let outcome = self.decide(event).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn decide(&self, event: NotificationEvent) -> RelayOutcome {
        if !self.filter.should_consider(&event) {
            let decision = self.filter.evaluate(&event);
            debug!(
                source = %event.source_app_id,
                id = %event.notification_id,
                ?decision,
                "Event not considered for relay"
            );
            return RelayOutcome::Ignored(decision);
        }

        let config = match self.config.load() {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "Configuration unreadable, relay disabled for this event");
                return RelayOutcome::Disabled;
            }
        };
        if !config.is_enabled() {
            debug!("No companion address configured");
            return RelayOutcome::Disabled;
        }

        let mut state = RelayState::Idle;
        transition(&mut state, RelayState::Probing);
        let probe = Arc::clone(&self.probe);
        let address = config.mac.clone();
        let probe_call = tokio::task::spawn_blocking(move || probe.is_companion_connected(&address));
        let connected = match tokio::time::timeout(self.probe_timeout, probe_call).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                warn!(error = %err, "Probe worker failed, treating companion as disconnected");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Probe did not answer in time, treating companion as disconnected"
                );
                false
            }
        };

        if connected {
            transition(&mut state, RelayState::Suppressed);
            debug!(address = %config.mac, "Companion connected, not relaying");
            transition(&mut state, RelayState::Idle);
            return RelayOutcome::Suppressed;
        }

        transition(&mut state, RelayState::Relaying);
        let request = build_substitute(&event);
        let outcome = match self.slot.replace(request, config.display_duration()).await {
            Ok(()) => {
                info!(
                    id = %event.notification_id,
                    display_secs = config.delay,
                    "Companion away, relayed notification"
                );
                RelayOutcome::Relayed
            }
            Err(err) => {
                warn!(error = %err, id = %event.notification_id, "Relay failed");
                RelayOutcome::Failed(err.to_string())
            }
        };
        transition(&mut state, RelayState::Idle);
        outcome
    }
}

fn transition(state: &mut RelayState, next: RelayState) {
    tracing::trace!(from = ?*state, to = ?next, "Relay state");
    *state = next;
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Substitute notification carrying the original content and tap action.
pub fn build_substitute(event: &NotificationEvent) -> PostRequest {
    PostRequest {
        channel_id: RELAY_MESSAGE_CHANNEL.to_string(),
        id: SUBSTITUTE_ID,
        title: non_blank(&event.title).unwrap_or(DEFAULT_TITLE).to_string(),
        body: non_blank(&event.body).unwrap_or(DEFAULT_BODY).to_string(),
        tap_action: event.tap_action.clone(),
        auto_cancel: true,
        ongoing: false,
    }
}
