//! Push channel abstraction
//!
//! The transport that pushes row changes from the backing store is external;
//! this module only fixes its shape. Delivery is at-least-once with no
//! ordering guarantee, and a reconnect may leave a gap that the consumer has
//! to close by re-reading the snapshot.

mod memory;

pub use memory::MemoryChannel;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};
use crate::types::{Operation, RawEvent};

/// Opaque handle identifying one channel subscription
pub type ChannelHandle = u64;

/// Items produced by a channel subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// A row change matching the subscription filter
    Change(RawEvent),
    /// The transport reconnected; changes may have been missed
    Resumed,
    /// The transport failed; no further changes will arrive
    Failed(String),
}

/// Stream of channel messages for one subscription
pub type ChannelStream = BoxStream<'static, ChannelMessage>;

/// The external publish/subscribe transport
#[async_trait]
pub trait Channel: Send + Sync {
    /// Subscribe to changes matching `filter` on a channel called `name`
    async fn subscribe(
        &self,
        name: &str,
        filter: ChannelFilter,
    ) -> Result<(ChannelHandle, ChannelStream)>;

    /// Release a subscription; unknown handles are ignored
    async fn unsubscribe(&self, handle: ChannelHandle) -> Result<()>;
}

/// Which row changes a subscription wants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    /// Table the changes come from
    pub table: String,
    /// Only this mutation kind (all kinds when `None`)
    pub operation: Option<Operation>,
    /// Only rows whose column equals the value
    pub column_eq: Option<(String, String)>,
}

impl ChannelFilter {
    /// All changes of one table
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            operation: None,
            column_eq: None,
        }
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn column_eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.column_eq = Some((column.into(), value.into()));
        self
    }

    /// Parse a `column=eq.value` expression into the column filter
    pub fn with_expr(mut self, expr: &str) -> Result<Self> {
        let (column, value) = expr
            .split_once("=eq.")
            .filter(|(c, v)| !c.is_empty() && !v.is_empty())
            .ok_or_else(|| {
                SwitchboardError::InvalidInput(format!("Unsupported filter expression: {}", expr))
            })?;
        self.column_eq = Some((column.to_string(), value.to_string()));
        Ok(self)
    }

    /// Render the column filter as `column=eq.value`
    pub fn expr(&self) -> Option<String> {
        self.column_eq
            .as_ref()
            .map(|(column, value)| format!("{}=eq.{}", column, value))
    }

    /// Check if a change matches this filter
    pub fn matches(&self, event: &RawEvent) -> bool {
        if event.table != self.table {
            return false;
        }

        if let Some(operation) = self.operation {
            if event.operation != operation {
                return false;
            }
        }

        if let Some((ref column, ref value)) = self.column_eq {
            match event.column(column) {
                Some(actual) if &actual == value => {}
                _ => return false,
            }
        }

        true
    }
}

impl std::fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table)?;
        if let Some(operation) = self.operation {
            write!(f, "/{}", operation)?;
        }
        if let Some(expr) = self.expr() {
            write!(f, "?{}", expr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_scope() {
        let filter = ChannelFilter::table("messages")
            .operation(Operation::Insert)
            .column_eq("conversation_id", "c1");

        let hit = RawEvent::insert("messages", json!({"id": "m1", "conversation_id": "c1"}));
        let other_scope =
            RawEvent::insert("messages", json!({"id": "m2", "conversation_id": "c2"}));
        let other_table = RawEvent::insert("orders", json!({"id": "o1", "conversation_id": "c1"}));
        let update = RawEvent {
            operation: Operation::Update,
            ..hit.clone()
        };

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&other_scope));
        assert!(!filter.matches(&other_table));
        assert!(!filter.matches(&update));
    }

    #[test]
    fn test_filter_expr() {
        let filter = ChannelFilter::table("messages")
            .with_expr("conversation_id=eq.abc")
            .unwrap();
        assert_eq!(
            filter.column_eq,
            Some(("conversation_id".to_string(), "abc".to_string()))
        );
        assert_eq!(filter.expr().as_deref(), Some("conversation_id=eq.abc"));
        assert_eq!(filter.to_string(), "messages?conversation_id=eq.abc");

        assert!(ChannelFilter::table("messages").with_expr("id=gt.3").is_err());
        assert!(ChannelFilter::table("messages").with_expr("=eq.3").is_err());
    }
}
