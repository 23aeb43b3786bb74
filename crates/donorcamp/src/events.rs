//! Change-notification channel for campaign state mutations.
//!
//! Every state-mutating operation emits a [`CampaignChangeEvent`] keyed by
//! session id; presentation layers subscribe instead of polling or poking
//! caches.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    SessionCreated,
    GenerationStarted,
    GenerationFinished,
    EmailsReviewed,
    EmailUpdated,
    SendScheduled,
    SendingPaused,
    SendingResumed,
    SendingCancelled,
    EmailSent,
    JobFailed,
    SessionCompleted,
    SessionFailed,
    SessionDeleted,
    ScheduleConfigUpdated,
}

/// A change notification for one campaign session (or, for config
/// changes, an organization).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignChangeEvent {
    /// Session the change applies to. Empty for org-level config changes.
    pub session_id: String,
    /// Organization scope of the change.
    pub organization_id: String,
    /// What changed.
    pub kind: ChangeKind,
    /// Timestamp of this event.
    pub timestamp: DateTime<Utc>,
}

impl CampaignChangeEvent {
    pub fn new(session_id: &str, organization_id: &str, kind: ChangeKind) -> Self {
        Self {
            session_id: session_id.to_string(),
            organization_id: organization_id.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcasts campaign change events to any number of subscribers.
#[derive(Clone)]
pub struct ChangeBroadcaster {
    sender: Arc<broadcast::Sender<CampaignChangeEvent>>,
}

impl ChangeBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a change event to all subscribers.
    pub fn send(&self, event: CampaignChangeEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Convenience: build and send an event in one call.
    pub fn notify(&self, session_id: &str, organization_id: &str, kind: ChangeKind) {
        self.send(CampaignChangeEvent::new(session_id, organization_id, kind));
    }

    /// Creates a new subscriber for change events.
    pub fn subscribe(&self) -> broadcast::Receiver<CampaignChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
