//! Core types for Switchboard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};

/// Identifier partitioning events (a conversation id, or a table-wide scope)
pub type ScopeId = String;

/// Unique identifier for an event within its scope
pub type EventId = String;

/// Table whose inserts feed conversation transcripts
pub const MESSAGES_TABLE: &str = "messages";

/// Table whose inserts raise order alerts
pub const ORDERS_TABLE: &str = "orders";

/// Column that partitions `messages` rows by conversation
pub const SCOPE_COLUMN: &str = "conversation_id";

/// Prefix of client-generated event ids; server ids never carry it
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Direction of a message relative to the business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// Where an event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Produced by the operator in this view, not yet round-tripped
    Local,
    /// Pushed by the backing store
    Remote,
}

/// Delivery state of an event in the rendered sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Optimistic entry waiting for confirmation
    #[default]
    Pending,
    /// Acknowledged by the backing store
    Confirmed,
    /// Write failed or confirmation never arrived in time
    NotDelivered,
}

/// Message content carried by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Message text
    pub text: String,
    /// Who wrote it ("customer", "agent", ...)
    #[serde(default = "default_sender_type")]
    pub sender_type: String,
    /// Whether an automation produced it
    #[serde(default)]
    pub is_automated: bool,
}

fn default_sender_type() -> String {
    "customer".to_string()
}

impl MessageBody {
    /// Message typed by the operator in the dashboard
    pub fn operator(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender_type: "agent".to_string(),
            is_automated: false,
        }
    }

    /// Inbound customer message
    pub fn customer(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender_type: "customer".to_string(),
            is_automated: false,
        }
    }
}

/// An entry of a conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique within `scope_id`
    pub id: EventId,
    /// Conversation this event belongs to
    pub scope_id: ScopeId,
    /// Message content
    pub payload: MessageBody,
    pub direction: Direction,
    pub origin: Origin,
    /// Confirmation state; `Confirmed` is the only confirmed state
    #[serde(default)]
    pub delivery: DeliveryState,
    /// Logical ordering key
    pub created_at: DateTime<Utc>,
    /// Idempotency key round-tripped through the write path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Event {
    /// Create a confirmed event as pushed by the backing store
    pub fn remote(
        id: impl Into<EventId>,
        scope_id: impl Into<ScopeId>,
        payload: MessageBody,
        direction: Direction,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.into(),
            payload,
            direction,
            origin: Origin::Remote,
            delivery: DeliveryState::Confirmed,
            created_at,
            client_ref: None,
        }
    }

    /// Attach an idempotency key
    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery == DeliveryState::Confirmed
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    /// Decode a `messages` row as delivered by the channel or the store
    pub fn from_row(row: &serde_json::Value) -> Result<Self> {
        let row: MessageRow = serde_json::from_value(row.clone())
            .map_err(|e| SwitchboardError::Decode(format!("messages row: {}", e)))?;

        let id = match row.id {
            serde_json::Value::String(s) if !s.is_empty() => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(SwitchboardError::Decode(format!(
                    "messages row has no usable id: {}",
                    other
                )))
            }
        };
        if id.starts_with(LOCAL_ID_PREFIX) {
            return Err(SwitchboardError::Decode(format!(
                "server row uses a client-local id: {}",
                id
            )));
        }

        Ok(Self {
            id,
            scope_id: row.conversation_id,
            payload: MessageBody {
                text: row.message_text,
                sender_type: row.sender_type,
                is_automated: row.is_automated,
            },
            direction: row.direction,
            origin: Origin::Remote,
            delivery: DeliveryState::Confirmed,
            created_at: row.created_at,
            client_ref: row.client_ref,
        })
    }

    /// Encode as a `messages` row (inverse of [`Event::from_row`])
    pub fn to_row(&self) -> serde_json::Value {
        let mut row = serde_json::json!({
            "id": self.id,
            "conversation_id": self.scope_id,
            "message_text": self.payload.text,
            "direction": self.direction,
            "sender_type": self.payload.sender_type,
            "is_automated": self.payload.is_automated,
            "created_at": self.created_at,
        });
        if let Some(ref client_ref) = self.client_ref {
            row["client_ref"] = serde_json::Value::String(client_ref.clone());
        }
        row
    }
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: serde_json::Value,
    conversation_id: ScopeId,
    message_text: String,
    direction: Direction,
    #[serde(default = "default_sender_type")]
    sender_type: String,
    #[serde(default)]
    is_automated: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    client_ref: Option<String>,
}

/// Row mutation kind reported by the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A change pushed by the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub table: String,
    pub operation: Operation,
    /// The row after the change (before it, for deletes)
    pub row: serde_json::Value,
}

impl RawEvent {
    pub fn insert(table: impl Into<String>, row: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Insert,
            row,
        }
    }

    /// Read a column as a string, accepting numeric columns too
    pub fn column(&self, name: &str) -> Option<String> {
        match self.row.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Kinds of alerts the dashboard raises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewOrder,
}

/// Content of an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Headline shown to the operator
    pub message: String,
    /// Amount attached to the record, if any
    pub amount: Option<f64>,
    /// Id of the record that raised the alert
    pub record_id: Option<String>,
}

/// A transient alert; lives only in memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub payload: NotificationPayload,
    pub created_at: DateTime<Utc>,
    pub dismissed: bool,
}

/// Lifecycle of a channel subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Connecting,
    Open,
    Closed,
    Error,
}

impl SubscriptionStatus {
    /// Whether the subscription still holds (or is acquiring) a channel
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Connecting | SubscriptionStatus::Open
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Connecting => write!(f, "connecting"),
            SubscriptionStatus::Open => write!(f, "open"),
            SubscriptionStatus::Closed => write!(f, "closed"),
            SubscriptionStatus::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_row() -> serde_json::Value {
        json!({
            "id": "9b0c5c1e-0000-4000-8000-000000000001",
            "conversation_id": "conv-1",
            "message_text": "Hola, quiero dos camisetas",
            "direction": "inbound",
            "sender_type": "customer",
            "is_automated": false,
            "created_at": "2025-03-02T10:15:00.123456+00:00",
            "whatsapp_message_id": "SM123"
        })
    }

    #[test]
    fn test_event_from_row() {
        let event = Event::from_row(&message_row()).unwrap();
        assert_eq!(event.id, "9b0c5c1e-0000-4000-8000-000000000001");
        assert_eq!(event.scope_id, "conv-1");
        assert_eq!(event.direction, Direction::Inbound);
        assert_eq!(event.origin, Origin::Remote);
        assert!(event.is_confirmed());
        assert!(event.client_ref.is_none());
    }

    #[test]
    fn test_event_from_row_numeric_id() {
        let mut row = message_row();
        row["id"] = json!(42);
        let event = Event::from_row(&row).unwrap();
        assert_eq!(event.id, "42");
    }

    #[test]
    fn test_event_from_row_rejects_missing_columns() {
        let row = json!({"id": "x", "conversation_id": "conv-1"});
        assert!(matches!(
            Event::from_row(&row),
            Err(SwitchboardError::Decode(_))
        ));
    }

    #[test]
    fn test_event_from_row_rejects_local_id() {
        let mut row = message_row();
        row["id"] = json!("local-abc");
        assert!(Event::from_row(&row).is_err());
    }

    #[test]
    fn test_row_roundtrip_keeps_client_ref() {
        let event = Event::from_row(&message_row())
            .unwrap()
            .with_client_ref("ref-1");
        let decoded = Event::from_row(&event.to_row()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("OUTBOUND".parse::<Direction>(), Ok(Direction::Outbound));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_raw_event_column() {
        let raw = RawEvent::insert("orders", json!({"order_number": "ORD-1", "total": 59.9}));
        assert_eq!(raw.column("order_number").as_deref(), Some("ORD-1"));
        assert_eq!(raw.column("total").as_deref(), Some("59.9"));
        assert_eq!(raw.column("missing"), None);
    }
}
