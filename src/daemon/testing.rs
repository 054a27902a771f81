//! Fakes shared by the daemon unit tests.

use crate::common::config::{ConfigSource, RelayConfig};
use crate::common::error::{RelayError, Result};
use crate::daemon::notifier::{relay_channels, ChannelSpec, NotificationSink, PostRequest};
use crate::daemon::probe::ConnectivityProbe;
use crate::ipc::messages::NotificationId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Sink that remembers what is currently visible.
#[derive(Default)]
pub struct RecordingSink {
    channels: Mutex<Vec<String>>,
    visible: Mutex<HashMap<NotificationId, PostRequest>>,
    posts: Mutex<Vec<PostRequest>>,
    cancels: AtomicUsize,
    fail_posts: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registered() -> Arc<Self> {
        let sink = Self::new();
        sink.register_channels(&relay_channels()).unwrap();
        sink
    }

    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    /// Simulate the user swiping the notification away.
    pub fn dismiss(&self, id: NotificationId) {
        self.visible.lock().unwrap().remove(&id);
    }

    pub fn is_visible(&self, id: NotificationId) -> bool {
        self.visible.lock().unwrap().contains_key(&id)
    }

    pub fn visible_title(&self, id: NotificationId) -> Option<String> {
        self.visible.lock().unwrap().get(&id).map(|r| r.title.clone())
    }

    pub fn visible(&self, id: NotificationId) -> Option<PostRequest> {
        self.visible.lock().unwrap().get(&id).cloned()
    }

    pub fn visible_count(&self) -> usize {
        self.visible.lock().unwrap().len()
    }

    pub fn posts(&self) -> Vec<PostRequest> {
        self.posts.lock().unwrap().clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl NotificationSink for RecordingSink {
    fn register_channels(&self, channels: &[ChannelSpec]) -> Result<()> {
        let mut registered = self.channels.lock().unwrap();
        registered.extend(channels.iter().map(|c| c.id.clone()));
        Ok(())
    }

    fn post(&self, request: &PostRequest) -> Result<()> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(RelayError::command_failed("fake", "post rejected"));
        }
        if !self.channels.lock().unwrap().contains(&request.channel_id) {
            return Err(RelayError::ChannelNotRegistered(request.channel_id.clone()));
        }
        self.posts.lock().unwrap().push(request.clone());
        self.visible
            .lock()
            .unwrap()
            .insert(request.id, request.clone());
        Ok(())
    }

    fn cancel(&self, id: NotificationId) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.visible.lock().unwrap().remove(&id);
        Ok(())
    }
}

/// Probe with a fixed answer that counts how often it was asked.
#[derive(Default)]
pub struct FakeProbe {
    connected: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(connected: bool) -> Arc<Self> {
        let probe = Self::default();
        probe.connected.store(connected, Ordering::SeqCst);
        Arc::new(probe)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConnectivityProbe for FakeProbe {
    fn is_companion_connected(&self, _address: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst)
    }
}

/// Probe that blocks until released, like a tool stuck on a dead service.
#[derive(Default)]
pub struct HangingProbe {
    released: Mutex<bool>,
    wake: Condvar,
}

impl HangingProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.wake.notify_all();
    }
}

impl ConnectivityProbe for HangingProbe {
    fn is_companion_connected(&self, _address: &str) -> bool {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.wake.wait(released).unwrap();
        }
        true
    }
}

/// In-memory configuration record.
pub struct StaticConfig(Mutex<Option<RelayConfig>>);

impl StaticConfig {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(config))))
    }

    /// A source whose every read fails.
    pub fn unreadable() -> Arc<Self> {
        Arc::new(Self(Mutex::new(None)))
    }
}

impl ConfigSource for StaticConfig {
    fn load(&self) -> Result<RelayConfig> {
        self.0
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RelayError::ConfigParse {
                path: "memory".into(),
                details: "unreadable".to_string(),
            })
    }
}
