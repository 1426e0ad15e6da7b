//! Channel subscription lifecycle
//!
//! One subscription per monitored scope. Received changes are forwarded into
//! the handler's bounded queue tagged with the subscription generation, so a
//! handler can tell deliveries of a closed subscription from current ones.
//! Channel failures are surfaced as [`SubscriptionStatus::Error`] and never
//! retried here; reconnecting is up to the view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelFilter, ChannelHandle, ChannelMessage, ChannelStream};
use crate::error::{Result, SwitchboardError};
use crate::types::{Operation, ScopeId, SubscriptionStatus, MESSAGES_TABLE, SCOPE_COLUMN};

/// What a subscription monitors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// Inserted messages of one conversation
    Conversation(ScopeId),
    /// Inserted rows of a whole table
    Table(String),
}

impl SubscriptionTarget {
    /// Registry key; table scopes are prefixed so they never collide with
    /// conversation ids
    pub fn scope_id(&self) -> ScopeId {
        match self {
            SubscriptionTarget::Conversation(id) => id.clone(),
            SubscriptionTarget::Table(table) => format!("table:{}", table),
        }
    }

    /// Channel name as the transport knows it
    pub fn channel_name(&self) -> String {
        match self {
            SubscriptionTarget::Conversation(id) => format!("conversation:{}", id),
            SubscriptionTarget::Table(table) => format!("{}-channel", table),
        }
    }

    /// Row insertions of the target, nothing else
    pub fn filter(&self) -> ChannelFilter {
        match self {
            SubscriptionTarget::Conversation(id) => ChannelFilter::table(MESSAGES_TABLE)
                .operation(Operation::Insert)
                .column_eq(SCOPE_COLUMN, id.clone()),
            SubscriptionTarget::Table(table) => {
                ChannelFilter::table(table.clone()).operation(Operation::Insert)
            }
        }
    }
}

/// A channel message handed to the registered handler
#[derive(Debug, Clone)]
pub struct Delivery {
    pub scope_id: ScopeId,
    /// Generation of the subscription that produced it
    pub generation: u64,
    pub message: ChannelMessage,
}

/// Handle to an open subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub scope_id: ScopeId,
    pub channel_handle: ChannelHandle,
    pub generation: u64,
    status: watch::Receiver<SubscriptionStatus>,
}

impl Subscription {
    /// Current status
    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status transition
    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }
}

struct Entry {
    generation: u64,
    handle: Option<ChannelHandle>,
    status: watch::Sender<SubscriptionStatus>,
    forwarder: Option<JoinHandle<()>>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.status.borrow().is_live()
    }
}

/// Owns every channel subscription of the dashboard
pub struct SubscriptionManager {
    channel: Arc<dyn Channel>,
    entries: Mutex<HashMap<ScopeId, Entry>>,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    /// Create a manager over a channel
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Open the single subscription for a target.
    ///
    /// Fails with [`SwitchboardError::AlreadySubscribed`] while another
    /// subscription for the same scope is connecting or open.
    pub async fn open(
        &self,
        target: SubscriptionTarget,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<Subscription> {
        let scope_id = target.scope_id();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Connecting);

        let stale = {
            let mut entries = self.entries.lock();
            if entries.get(&scope_id).is_some_and(Entry::is_live) {
                return Err(SwitchboardError::AlreadySubscribed(scope_id));
            }
            entries.insert(
                scope_id.clone(),
                Entry {
                    generation,
                    handle: None,
                    status: status_tx.clone(),
                    forwarder: None,
                },
            )
        };
        if let Some(stale) = stale {
            self.release(stale).await;
        }

        tracing::debug!(scope = %scope_id, generation, "opening subscription");

        let (handle, stream) = match self
            .channel
            .subscribe(&target.channel_name(), target.filter())
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(scope = %scope_id, generation, "subscription failed: {}", e);
                status_tx.send_replace(SubscriptionStatus::Error);
                return Err(e);
            }
        };

        // close() may have raced with the subscribe call
        let still_current = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&scope_id) {
                Some(entry) if entry.generation == generation && entry.is_live() => {
                    entry.handle = Some(handle);
                    status_tx.send_replace(SubscriptionStatus::Open);
                    entry.forwarder = Some(tokio::spawn(forward(
                        scope_id.clone(),
                        generation,
                        stream,
                        sink,
                        status_tx.clone(),
                    )));
                    true
                }
                _ => false,
            }
        };
        if !still_current {
            if let Err(e) = self.channel.unsubscribe(handle).await {
                tracing::warn!(handle, "unsubscribe failed: {}", e);
            }
            return Err(SwitchboardError::Channel(format!(
                "subscription for {} closed while connecting",
                scope_id
            )));
        }

        tracing::info!(scope = %scope_id, generation, handle, "subscription open");

        Ok(Subscription {
            scope_id,
            channel_handle: handle,
            generation,
            status: status_rx,
        })
    }

    /// Close a subscription. Idempotent; closing a superseded subscription
    /// is a no-op.
    pub async fn close(&self, subscription: &Subscription) {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(&subscription.scope_id) {
                Some(entry) if entry.generation == subscription.generation => {
                    entries.remove(&subscription.scope_id)
                }
                _ => None,
            }
        };
        if let Some(entry) = entry {
            tracing::info!(
                scope = %subscription.scope_id,
                generation = subscription.generation,
                "subscription closed"
            );
            self.release(entry).await;
        }
    }

    /// Close whatever subscription a scope currently has
    pub async fn close_scope(&self, scope_id: &str) {
        let entry = self.entries.lock().remove(scope_id);
        if let Some(entry) = entry {
            self.release(entry).await;
        }
    }

    /// Status of a scope's subscription, if it has one
    pub fn status(&self, scope_id: &str) -> Option<SubscriptionStatus> {
        self.entries
            .lock()
            .get(scope_id)
            .map(|entry| *entry.status.borrow())
    }

    /// Number of connecting or open subscriptions
    pub fn live_count(&self) -> usize {
        self.entries.lock().values().filter(|e| e.is_live()).count()
    }

    async fn release(&self, entry: Entry) {
        if let Some(forwarder) = entry.forwarder {
            forwarder.abort();
        }
        entry.status.send_replace(SubscriptionStatus::Closed);
        if let Some(handle) = entry.handle {
            if let Err(e) = self.channel.unsubscribe(handle).await {
                tracing::warn!(handle, "unsubscribe failed: {}", e);
            }
        }
    }
}

/// Hand every channel message to the sink until the stream ends, fails, or
/// the handler goes away
async fn forward(
    scope_id: ScopeId,
    generation: u64,
    mut stream: ChannelStream,
    sink: mpsc::Sender<Delivery>,
    status: watch::Sender<SubscriptionStatus>,
) {
    while let Some(message) = stream.next().await {
        let failed = matches!(message, ChannelMessage::Failed(_));
        if let ChannelMessage::Failed(ref reason) = message {
            tracing::warn!(scope = %scope_id, generation, "channel error: {}", reason);
            status.send_replace(SubscriptionStatus::Error);
        }

        let delivery = Delivery {
            scope_id: scope_id.clone(),
            generation,
            message,
        };
        if sink.send(delivery).await.is_err() {
            tracing::debug!(scope = %scope_id, generation, "handler gone, stopping delivery");
            break;
        }
        if failed {
            break;
        }
    }

    status.send_if_modified(|current| {
        if *current == SubscriptionStatus::Open {
            *current = SubscriptionStatus::Closed;
            true
        } else {
            false
        }
    });
}
