//! Live transcript sessions
//!
//! A session owns the [`Reconciler`] of one conversation and is its only
//! writer: channel deliveries, operator sends, write acknowledgements and
//! expiry sweeps all pass through one command loop, so ingestion is
//! serialized no matter how the transport races.

mod store;

pub use store::MemoryStore;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::channel::ChannelMessage;
use crate::error::{Result, SwitchboardError};
use crate::optimistic::{LocalEntry, PendingHandle};
use crate::reconcile::{Reconciler, ReconcilerConfig, Transcript};
use crate::subscription::{Delivery, Subscription, SubscriptionManager, SubscriptionTarget};
use crate::types::{
    Direction, Event, MessageBody, ScopeId, SubscriptionStatus, MESSAGES_TABLE,
};

/// A message handed to the write path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub scope_id: ScopeId,
    pub payload: MessageBody,
    pub direction: Direction,
    /// Idempotency key; the store should persist and echo it
    pub client_ref: String,
}

/// The backing store as seen by a transcript view
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation's messages ordered by `created_at` ascending
    async fn load_transcript(&self, scope_id: &str) -> Result<Vec<Event>>;

    /// Persist a message and return the confirmed event
    async fn send_message(&self, message: OutboundMessage) -> Result<Event>;
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconciler: ReconcilerConfig,
    /// Capacity of the delivery queue between channel and loop (default: 256)
    pub queue_capacity: usize,
    /// How often overdue optimistic entries are expired (default: 1 second)
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            queue_capacity: 256,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        self.reconciler.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(SwitchboardError::Config(
                "sweep_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Commands for the session loop
#[derive(Debug)]
enum SessionCommand {
    /// Operator sends a message
    Send {
        payload: MessageBody,
        reply: oneshot::Sender<Result<LocalEntry>>,
    },
    /// The write path confirmed a pending entry
    WriteConfirmed { handle: PendingHandle, event: Event },
    /// The write path failed for a pending entry
    WriteFailed { handle: PendingHandle, error: String },
    /// A re-fetched snapshot after a possible gap
    Resync(Vec<Event>),
    /// Stop the loop
    Close,
}

/// Handle to the live view of one conversation
pub struct TranscriptSession {
    scope_id: ScopeId,
    commands: mpsc::Sender<SessionCommand>,
    transcript: watch::Receiver<Transcript>,
    subscription: Subscription,
    manager: Arc<SubscriptionManager>,
    task: JoinHandle<()>,
}

impl TranscriptSession {
    /// Subscribe to a conversation, load its snapshot and start the loop.
    ///
    /// The subscription is opened before the snapshot is read, so rows
    /// inserted in between are delivered rather than lost; the overlap is
    /// absorbed by id deduplication.
    pub async fn start(
        scope_id: impl Into<ScopeId>,
        manager: Arc<SubscriptionManager>,
        store: Arc<dyn ConversationStore>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let scope_id = scope_id.into();
        let (sink, deliveries) = mpsc::channel(config.queue_capacity.max(1));
        let subscription = manager
            .open(SubscriptionTarget::Conversation(scope_id.clone()), sink)
            .await?;

        let snapshot = match store.load_transcript(&scope_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                manager.close(&subscription).await;
                return Err(e);
            }
        };

        let mut reconciler = Reconciler::new(scope_id.clone(), config.reconciler.clone());
        reconciler.snapshot(snapshot);
        let transcript = reconciler.subscribe();

        let (commands, command_rx) = mpsc::channel(64);
        let session_loop = SessionLoop {
            reconciler,
            store,
            generation: subscription.generation,
            status: subscription.watch_status(),
            loopback: commands.downgrade(),
        };
        let task = tokio::spawn(session_loop.run(command_rx, deliveries, config.sweep_interval));

        tracing::info!(scope = %scope_id, "transcript session started");

        Ok(Self {
            scope_id,
            commands,
            transcript,
            subscription,
            manager,
            task,
        })
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Current transcript
    pub fn transcript(&self) -> Transcript {
        self.transcript.borrow().clone()
    }

    /// Receiver that sees every transcript emission
    pub fn watch(&self) -> watch::Receiver<Transcript> {
        self.transcript.clone()
    }

    /// Subscription status ("disconnected" in the view when `Error`)
    pub fn status(&self) -> SubscriptionStatus {
        self.subscription.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.subscription.watch_status()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Send an operator message. The entry is shown immediately; its
    /// confirmation or failure arrives through the transcript.
    pub async fn send(&self, text: impl Into<String>) -> Result<LocalEntry> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send {
                payload: MessageBody::operator(text),
                reply,
            })
            .await
            .map_err(|_| SwitchboardError::SessionClosed(self.scope_id.clone()))?;
        response
            .await
            .map_err(|_| SwitchboardError::SessionClosed(self.scope_id.clone()))?
    }

    /// Close the subscription and stop the loop. Deliveries still queued
    /// are discarded. Returns the last transcript.
    pub async fn close(self) -> Transcript {
        self.manager.close(&self.subscription).await;
        let _ = self.commands.send(SessionCommand::Close).await;
        if let Err(e) = self.task.await {
            tracing::warn!(scope = %self.scope_id, "session task ended abnormally: {}", e);
        }
        tracing::info!(scope = %self.scope_id, "transcript session closed");
        let transcript = self.transcript.borrow().clone();
        transcript
    }
}

struct SessionLoop {
    reconciler: Reconciler,
    store: Arc<dyn ConversationStore>,
    generation: u64,
    status: watch::Receiver<SubscriptionStatus>,
    loopback: mpsc::WeakSender<SessionCommand>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut deliveries: mpsc::Receiver<Delivery>,
        sweep_every: Duration,
    ) {
        let mut sweep = interval(sweep_every);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(delivery) = deliveries.recv() => self.handle_delivery(delivery),
                _ = sweep.tick() => {
                    self.reconciler.expire_overdue(Instant::now());
                }
            }
        }

        tracing::debug!(
            scope = %self.reconciler.scope_id(),
            discarded = deliveries.len(),
            "session loop stopped"
        );
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send { payload, reply } => {
                let result = self.reconciler.add_local(payload, Direction::Outbound);
                if let Ok(ref entry) = result {
                    self.spawn_write(entry);
                }
                let _ = reply.send(result);
            }
            SessionCommand::WriteConfirmed { handle, event } => {
                self.reconciler.confirm_local(handle, event);
            }
            SessionCommand::WriteFailed { handle, error } => {
                tracing::warn!(scope = %self.reconciler.scope_id(), %handle, "write failed: {}", error);
                if let Err(e) = self.reconciler.mark_failed(handle) {
                    // Already expired by the sweep
                    tracing::debug!(%handle, "{}", e);
                }
            }
            SessionCommand::Resync(events) => {
                self.reconciler.resync(events);
            }
            SessionCommand::Close => {}
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        if delivery.generation != self.generation
            || *self.status.borrow() == SubscriptionStatus::Closed
        {
            tracing::debug!(
                scope = %delivery.scope_id,
                generation = delivery.generation,
                "delivery after close dropped"
            );
            return;
        }

        match delivery.message {
            ChannelMessage::Change(raw) if raw.table == MESSAGES_TABLE => {
                match Event::from_row(&raw.row) {
                    Ok(event) => {
                        self.reconciler.ingest(event);
                    }
                    Err(e) => {
                        tracing::warn!(scope = %delivery.scope_id, "skipping undecodable row: {}", e);
                    }
                }
            }
            ChannelMessage::Change(raw) => {
                tracing::debug!(table = %raw.table, "ignoring change from unrelated table");
            }
            ChannelMessage::Resumed => self.spawn_resync(),
            ChannelMessage::Failed(reason) => {
                tracing::warn!(scope = %delivery.scope_id, "transcript disconnected: {}", reason);
            }
        }
    }

    fn spawn_write(&self, entry: &LocalEntry) {
        let handle = entry.handle;
        let message = OutboundMessage {
            scope_id: entry.event.scope_id.clone(),
            payload: entry.event.payload.clone(),
            direction: entry.event.direction,
            client_ref: entry.event.client_ref.clone().unwrap_or_default(),
        };
        let store = self.store.clone();
        let loopback = self.loopback.clone();

        tokio::spawn(async move {
            let command = match store.send_message(message).await {
                Ok(event) => SessionCommand::WriteConfirmed { handle, event },
                Err(e) => SessionCommand::WriteFailed {
                    handle,
                    error: e.to_string(),
                },
            };
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(command).await;
            }
        });
    }

    fn spawn_resync(&self) {
        let scope_id = self.reconciler.scope_id().to_string();
        let store = self.store.clone();
        let loopback = self.loopback.clone();

        tracing::info!(scope = %scope_id, "channel resumed, re-reading snapshot");
        tokio::spawn(async move {
            match store.load_transcript(&scope_id).await {
                Ok(events) => {
                    if let Some(tx) = loopback.upgrade() {
                        let _ = tx.send(SessionCommand::Resync(events)).await;
                    }
                }
                Err(e) => tracing::warn!(scope = %scope_id, "resync failed: {}", e),
            }
        });
    }
}
