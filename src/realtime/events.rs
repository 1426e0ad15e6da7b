//! View event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reconcile::Transcript;
use crate::types::{Event, Notification, ScopeId, SubscriptionStatus};

/// Types of view events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewEventType {
    Transcript,
    Notification,
    SubscriptionStatus,
}

/// An update pushed to dashboard clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewEvent {
    #[serde(rename = "type")]
    pub event_type: ViewEventType,
    pub timestamp: DateTime<Utc>,
    /// Conversation the update belongs to; `None` for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    /// Transcript version, increases with every emission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Full ordered transcript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
    /// Live notifications, oldest first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Vec<Notification>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    /// Text the dashboard shows for `status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ViewEvent {
    fn empty(event_type: ViewEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            scope_id: None,
            version: None,
            events: None,
            notifications: None,
            status: None,
            label: None,
        }
    }

    /// A transcript re-render
    pub fn transcript(transcript: &Transcript) -> Self {
        Self {
            scope_id: Some(transcript.scope_id.clone()),
            version: Some(transcript.version),
            events: Some(transcript.events.to_vec()),
            ..Self::empty(ViewEventType::Transcript)
        }
    }

    /// The live notification list changed
    pub fn notifications(notifications: Vec<Notification>) -> Self {
        Self {
            notifications: Some(notifications),
            ..Self::empty(ViewEventType::Notification)
        }
    }

    /// A conversation subscription changed status
    pub fn subscription_status(scope_id: impl Into<ScopeId>, status: SubscriptionStatus) -> Self {
        Self {
            scope_id: Some(scope_id.into()),
            status: Some(status),
            label: Some(status_label(status).to_string()),
            ..Self::empty(ViewEventType::SubscriptionStatus)
        }
    }

    /// Encode for the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Channel errors read as "disconnected" to the operator
fn status_label(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Connecting => "connecting",
        SubscriptionStatus::Open => "live",
        SubscriptionStatus::Closed => "closed",
        SubscriptionStatus::Error => "disconnected",
    }
}

/// Which view events a client wants
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewFilter {
    /// Only updates for these conversations
    pub scope_ids: Option<Vec<ScopeId>>,
    /// Only these event types
    pub event_types: Option<Vec<ViewEventType>>,
}

impl ViewFilter {
    /// Parse a filter sent by a client
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &ViewEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }

        // Notifications are not scoped and reach every client
        if let (Some(scopes), Some(scope_id)) = (&self.scope_ids, &event.scope_id) {
            if !scopes.contains(scope_id) {
                return false;
            }
        }

        true
    }
}
