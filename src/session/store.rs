//! In-process conversation store
//!
//! Holds `messages` and `orders` rows and publishes every insert on a
//! [`MemoryChannel`], the way the hosted database pushes row changes to its
//! realtime clients. Used by the dev server and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use super::{ConversationStore, OutboundMessage};
use crate::channel::MemoryChannel;
use crate::error::{Result, SwitchboardError};
use crate::types::{Direction, Event, MessageBody, RawEvent, MESSAGES_TABLE, ORDERS_TABLE};

pub struct MemoryStore {
    channel: MemoryChannel,
    messages: Mutex<HashMap<String, Vec<Event>>>,
    orders: Mutex<Vec<serde_json::Value>>,
    next_id: AtomicU64,
    /// Persist the idempotency key and send it back with the echo
    echo_client_ref: AtomicBool,
    fail_sends: AtomicBool,
}

impl MemoryStore {
    pub fn new(channel: MemoryChannel) -> Self {
        Self {
            channel,
            messages: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            echo_client_ref: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &MemoryChannel {
        &self.channel
    }

    /// Drop the idempotency key on write, like a store without that column
    pub fn set_echo_client_ref(&self, echo: bool) {
        self.echo_client_ref.store(echo, Ordering::SeqCst);
    }

    /// Make `send_message` fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Store a customer message and publish it
    pub fn insert_inbound(&self, scope_id: &str, text: &str) -> Event {
        let event = self.store_message(scope_id, MessageBody::customer(text), Direction::Inbound, None);
        self.channel
            .publish(RawEvent::insert(MESSAGES_TABLE, event.to_row()));
        event
    }

    /// Store a customer message without publishing it, as if the push was
    /// lost during a disconnect
    pub fn insert_silently(&self, scope_id: &str, text: &str) -> Event {
        self.store_message(scope_id, MessageBody::customer(text), Direction::Inbound, None)
    }

    /// Store an order numbered `ORD-<unix seconds>` and publish it
    pub fn create_order(&self, total: f64) -> serde_json::Value {
        let now = Utc::now();
        let row = json!({
            "id": self.allocate_id("ord"),
            "order_number": format!("ORD-{}", now.timestamp()),
            "total": total,
            "status": "pending",
            "created_at": now,
        });
        self.orders.lock().push(row.clone());
        self.channel.publish(RawEvent::insert(ORDERS_TABLE, row.clone()));
        row
    }

    pub fn orders(&self) -> Vec<serde_json::Value> {
        self.orders.lock().clone()
    }

    pub fn message_count(&self, scope_id: &str) -> usize {
        self.messages
            .lock()
            .get(scope_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn allocate_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn store_message(
        &self,
        scope_id: &str,
        payload: MessageBody,
        direction: Direction,
        client_ref: Option<String>,
    ) -> Event {
        let mut event = Event::remote(
            self.allocate_id("msg"),
            scope_id,
            payload,
            direction,
            Utc::now(),
        );
        event.client_ref = client_ref;
        self.messages
            .lock()
            .entry(scope_id.to_string())
            .or_default()
            .push(event.clone());
        event
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load_transcript(&self, scope_id: &str) -> Result<Vec<Event>> {
        let mut events = self
            .messages
            .lock()
            .get(scope_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<Event> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SwitchboardError::Store(format!(
                "insert into {} rejected",
                MESSAGES_TABLE
            )));
        }
        if message.payload.text.trim().is_empty() {
            return Err(SwitchboardError::InvalidInput(
                "message_text must not be blank".to_string(),
            ));
        }

        let client_ref = self
            .echo_client_ref
            .load(Ordering::SeqCst)
            .then_some(message.client_ref);
        let event = self.store_message(
            &message.scope_id,
            message.payload,
            message.direction,
            client_ref,
        );
        self.channel
            .publish(RawEvent::insert(MESSAGES_TABLE, event.to_row()));
        Ok(event)
    }
}
