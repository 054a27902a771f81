//! Decides which inbound notifications are relay candidates.

use crate::ipc::messages::{NotificationEvent, NotificationId};

/// Id every substitute notification is posted under. Seeing it come back in
/// means we are looking at our own output.
pub const SUBSTITUTE_ID: NotificationId = NotificationId(10086);

/// Application id the relay posts its own notifications as.
pub const RELAY_APP_ID: &str = "companion-relay";

/// Why an event was (not) accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    OtherSource,
    OwnNotification,
    SubstituteLoop,
}

impl FilterDecision {
    pub fn is_accept(self) -> bool {
        self == FilterDecision::Accept
    }
}

#[derive(Debug, Clone)]
pub struct RelayFilter {
    source_app_id: String,
}

impl RelayFilter {
    pub fn new(source_app_id: impl Into<String>) -> Self {
        Self {
            source_app_id: source_app_id.into(),
        }
    }

    pub fn evaluate(&self, event: &NotificationEvent) -> FilterDecision {
        if event.source_app_id == RELAY_APP_ID {
            return FilterDecision::OwnNotification;
        }
        if event.notification_id == SUBSTITUTE_ID {
            return FilterDecision::SubstituteLoop;
        }
        if event.source_app_id != self.source_app_id {
            return FilterDecision::OtherSource;
        }
        FilterDecision::Accept
    }

    pub fn should_consider(&self, event: &NotificationEvent) -> bool {
        self.evaluate(event).is_accept()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: &str, id: i64) -> NotificationEvent {
        NotificationEvent {
            source_app_id: source.to_string(),
            notification_id: NotificationId(id),
            title: Some("Alice".to_string()),
            body: Some("hi".to_string()),
            tap_action: None,
        }
    }

    #[test]
    fn test_accepts_monitored_source() {
        let filter = RelayFilter::new("com.tencent.mm");
        assert!(filter.should_consider(&event("com.tencent.mm", 1)));
    }

    #[test]
    fn test_rejects_other_sources() {
        let filter = RelayFilter::new("com.tencent.mm");
        for source in ["org.telegram.messenger", "", "com.tencent.mm.extra", "COM.TENCENT.MM"] {
            assert_eq!(
                filter.evaluate(&event(source, 1)),
                FilterDecision::OtherSource,
                "source {:?}",
                source
            );
        }
    }

    #[test]
    fn test_rejects_substitute_id_even_from_monitored_source() {
        let filter = RelayFilter::new("com.tencent.mm");
        assert_eq!(
            filter.evaluate(&event("com.tencent.mm", SUBSTITUTE_ID.0)),
            FilterDecision::SubstituteLoop
        );
    }

    #[test]
    fn test_rejects_own_notifications() {
        // Even if someone configures the relay to watch itself.
        let filter = RelayFilter::new(RELAY_APP_ID);
        assert_eq!(
            filter.evaluate(&event(RELAY_APP_ID, 9999)),
            FilterDecision::OwnNotification
        );
    }
}
