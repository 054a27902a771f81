//! Single-occupancy register for the substitute notification.
//!
//! At most one substitute is visible at a time. Replacing it cancels the
//! previous withdrawal timer and arms a new one, so exactly one withdrawal
//! fires and it always targets the newest substitute.

use crate::common::error::{RelayError, Result};
use crate::daemon::filter::SUBSTITUTE_ID;
use crate::daemon::notifier::{NotificationSink, PostRequest};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ActiveSubstitute {
    generation: u64,
    displayed_at: DateTime<Utc>,
    expires_after: Duration,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct SlotState {
    active: Option<ActiveSubstitute>,
    generation: u64,
}

/// Owner of the substitute notification and its withdrawal timer.
#[derive(Clone)]
pub struct SubstituteSlot {
    sink: Arc<dyn NotificationSink>,
    state: Arc<Mutex<SlotState>>,
}

impl SubstituteSlot {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new(SlotState::default())),
        }
    }

    /// Post `request` under the substitute id, replacing whatever is showing,
    /// and schedule its withdrawal after `expires_after`.
    ///
    /// If the post fails the slot is left as it was.
    pub async fn replace(&self, mut request: PostRequest, expires_after: Duration) -> Result<()> {
        request.id = SUBSTITUTE_ID;
        let mut state = self.state.lock().await;

        let sink = Arc::clone(&self.sink);
        run_blocking(move || sink.post(&request)).await?;

        if let Some(previous) = state.active.take() {
            previous.timer.abort();
            debug!(generation = previous.generation, "Replaced active substitute");
        }

        state.generation += 1;
        let generation = state.generation;
        let timer = self.arm_withdrawal(generation, expires_after);
        state.active = Some(ActiveSubstitute {
            generation,
            displayed_at: Utc::now(),
            expires_after,
            timer,
        });
        Ok(())
    }

    /// Withdraw the substitute now. Safe to call when nothing is showing or
    /// when the user already dismissed it.
    pub async fn withdraw(&self) -> bool {
        let mut state = self.state.lock().await;
        let was_active = match state.active.take() {
            Some(active) => {
                active.timer.abort();
                true
            }
            None => false,
        };
        self.cancel_substitute().await;
        was_active
    }

    /// When the current substitute went up, if one is showing
    pub async fn displayed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.active.as_ref().map(|a| a.displayed_at)
    }

    /// When the current substitute is due to be withdrawn. `None` when
    /// nothing is showing or the window runs past the representable range.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        let active = state.active.as_ref()?;
        let delay = chrono::Duration::from_std(active.expires_after).ok()?;
        active.displayed_at.checked_add_signed(delay)
    }

    fn arm_withdrawal(&self, generation: u64, expires_after: Duration) -> JoinHandle<()> {
        let slot = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(expires_after).await;
            slot.expire(generation).await;
        })
    }

    async fn expire(&self, generation: u64) {
        let mut state = self.state.lock().await;
        match &state.active {
            Some(active) if active.generation == generation => {
                state.active = None;
            }
            _ => {
                debug!(generation, "Stale withdrawal timer, nothing to do");
                return;
            }
        }
        debug!(generation, "Substitute display window elapsed");
        self.cancel_substitute().await;
    }

    async fn cancel_substitute(&self) {
        let sink = Arc::clone(&self.sink);
        if let Err(err) = run_blocking(move || sink.cancel(SUBSTITUTE_ID)).await {
            warn!(error = %err, "Failed to withdraw substitute notification");
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| RelayError::Worker(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::notifier::RELAY_MESSAGE_CHANNEL;
    use crate::daemon::testing::RecordingSink;
    use crate::ipc::messages::NotificationId;

    fn request(title: &str) -> PostRequest {
        PostRequest {
            channel_id: RELAY_MESSAGE_CHANNEL.to_string(),
            id: NotificationId(1),
            title: title.to_string(),
            body: "body".to_string(),
            tap_action: None,
            auto_cancel: true,
            ongoing: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_after_display_window() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        slot.replace(request("hello"), Duration::from_secs(2)).await.unwrap();
        assert_eq!(sink.visible_title(SUBSTITUTE_ID).as_deref(), Some("hello"));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(sink.is_visible(SUBSTITUTE_ID));
        assert!(slot.displayed_at().await.is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!sink.is_visible(SUBSTITUTE_ID));
        assert!(slot.displayed_at().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_posts_under_substitute_id() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        slot.replace(request("hello"), Duration::from_secs(3)).await.unwrap();
        let posts = sink.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, SUBSTITUTE_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_rearms_single_timer() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        slot.replace(request("first"), Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        slot.replace(request("second"), Duration::from_secs(2)).await.unwrap();

        // The first timer would have fired here; it must not take down the
        // second substitute.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(sink.visible_title(SUBSTITUTE_ID).as_deref(), Some("second"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!sink.is_visible(SUBSTITUTE_ID));
        assert_eq!(sink.cancel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_is_idempotent() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        assert!(!slot.withdraw().await);

        slot.replace(request("hello"), Duration::from_secs(5)).await.unwrap();
        assert!(slot.withdraw().await);
        assert!(!slot.withdraw().await);
        assert!(!sink.is_visible(SUBSTITUTE_ID));

        // The cancelled timer never fires a second withdrawal.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.cancel_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_tolerates_user_dismissal() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        slot.replace(request("hello"), Duration::from_secs(1)).await.unwrap();
        sink.dismiss(SUBSTITUTE_ID);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(slot.displayed_at().await.is_none());
        assert!(!sink.is_visible(SUBSTITUTE_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_post_leaves_slot_untouched() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        slot.replace(request("first"), Duration::from_secs(2)).await.unwrap();
        sink.fail_posts(true);
        assert!(slot.replace(request("second"), Duration::from_secs(10)).await.is_err());

        assert_eq!(sink.visible_title(SUBSTITUTE_ID).as_deref(), Some("first"));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!sink.is_visible(SUBSTITUTE_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_at_tracks_window() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());
        assert!(slot.expires_at().await.is_none());

        slot.replace(request("hello"), Duration::from_secs(4)).await.unwrap();
        let shown = slot.displayed_at().await.unwrap();
        let due = slot.expires_at().await.unwrap();
        assert_eq!((due - shown).num_seconds(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_at_survives_huge_window() {
        let sink = RecordingSink::registered();
        let slot = SubstituteSlot::new(sink.clone());

        slot.replace(request("hello"), Duration::from_secs(1_000_000_000_000_000))
            .await
            .unwrap();
        assert!(slot.displayed_at().await.is_some());
        assert!(slot.expires_at().await.is_none());
        assert!(sink.is_visible(SUBSTITUTE_ID));
    }
}
