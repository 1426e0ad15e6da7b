//! In-process channel backed by a broadcast bus

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::{Channel, ChannelFilter, ChannelHandle, ChannelMessage, ChannelStream};
use crate::error::{Result, SwitchboardError};
use crate::types::RawEvent;

struct Registration {
    name: String,
    filter: ChannelFilter,
    cancel: oneshot::Sender<()>,
}

/// Channel that fans published changes out to in-process subscribers.
///
/// A subscriber that falls behind the bus capacity receives
/// [`ChannelMessage::Resumed`] in place of the changes it missed.
#[derive(Clone)]
pub struct MemoryChannel {
    tx: broadcast::Sender<ChannelMessage>,
    registrations: Arc<Mutex<HashMap<ChannelHandle, Registration>>>,
    next_handle: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Create a channel buffering up to `capacity` undelivered messages
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(1)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish a row change to every matching subscriber
    pub fn publish(&self, event: RawEvent) {
        // No receivers is not an error: nobody is watching that table
        let _ = self.tx.send(ChannelMessage::Change(event));
    }

    /// Simulate a transport reconnect
    pub fn resume(&self) {
        let _ = self.tx.send(ChannelMessage::Resumed);
    }

    /// Simulate a transport failure
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ChannelMessage::Failed(reason.into()));
    }

    /// Make subsequent `subscribe` calls fail
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Names of live subscriptions, sorted
    pub fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registrations
            .lock()
            .values()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Filter of a live subscription
    pub fn filter_of(&self, handle: ChannelHandle) -> Option<ChannelFilter> {
        self.registrations
            .lock()
            .get(&handle)
            .map(|r| r.filter.clone())
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn subscribe(
        &self,
        name: &str,
        filter: ChannelFilter,
    ) -> Result<(ChannelHandle, ChannelStream)> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SwitchboardError::Channel(format!(
                "channel {} unavailable: transport offline",
                name
            )));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let (cancel, cancelled) = oneshot::channel();
        let rx = self.tx.subscribe();

        self.registrations.lock().insert(
            handle,
            Registration {
                name: name.to_string(),
                filter: filter.clone(),
                cancel,
            },
        );
        tracing::debug!(handle, channel = name, %filter, "memory channel subscribed");

        let stream = BroadcastStream::new(rx)
            .filter_map(move |item| {
                let message = match item {
                    Ok(ChannelMessage::Change(event)) => {
                        filter.matches(&event).then_some(ChannelMessage::Change(event))
                    }
                    Ok(other) => Some(other),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "memory channel subscriber lagged");
                        Some(ChannelMessage::Resumed)
                    }
                };
                futures::future::ready(message)
            })
            .take_until(cancelled)
            .boxed();

        Ok((handle, stream))
    }

    async fn unsubscribe(&self, handle: ChannelHandle) -> Result<()> {
        if let Some(registration) = self.registrations.lock().remove(&handle) {
            let _ = registration.cancel.send(());
            tracing::debug!(handle, channel = %registration.name, "memory channel unsubscribed");
        }
        Ok(())
    }
}
