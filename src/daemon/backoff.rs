//! Restart pacing for the supervisor.
//!
//! Starts of the relay host are kept in a small JSON history. A host that
//! keeps dying right after launch is only started again after a delay that
//! grows with every extra start inside the window. The delay is returned,
//! not slept, so the supervisor can abandon it on shutdown.

use crate::common::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// How restart delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Starts older than this are forgotten
    pub window: Duration,
    /// Starts inside the window that go through without delay
    pub free_starts: usize,
    /// Added for every start beyond `free_starts`
    pub step: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(120),
            free_starts: 3,
            step: Duration::from_secs(10),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay for a start that brings the in-window count to `starts`.
    pub fn delay_for(&self, starts: usize) -> Option<Duration> {
        let extra = starts.saturating_sub(self.free_starts);
        if extra == 0 {
            return None;
        }
        let extra = u32::try_from(extra).unwrap_or(u32::MAX);
        Some(self.step.saturating_mul(extra).min(self.cap))
    }
}

/// Persisted start times, oldest first.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartHistory {
    starts: Vec<DateTime<Utc>>,
}

impl StartHistory {
    /// Load the history. A missing file is an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the history atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Drop starts outside `window` (or in the future), append `now`, and
    /// return how many starts the window now holds.
    fn push(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.starts
            .retain(|at| *at <= now && now.signed_duration_since(*at) <= window);
        self.starts.push(now);
        self.starts.len()
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }
}

/// Record a start in the history at `path` and return how long to hold it
/// back. History I/O problems are logged and never block a start.
pub fn record_start(path: &Path, policy: &BackoffPolicy) -> Option<Duration> {
    record_start_at(path, policy, Utc::now())
}

fn record_start_at(path: &Path, policy: &BackoffPolicy, now: DateTime<Utc>) -> Option<Duration> {
    let mut history = StartHistory::load(path).unwrap_or_else(|err| {
        warn!(error = %err, "Discarding unreadable start history");
        StartHistory::default()
    });
    let recent = history.push(now, policy.window);
    if let Err(err) = history.save(path) {
        warn!(error = %err, "Failed to persist start history");
    }

    let delay = policy.delay_for(recent);
    if let Some(delay) = delay {
        warn!(recent, delay_secs = delay.as_secs(), "Restart backoff engaged");
    }
    delay
}
