//! Transient alerts for alert-worthy row inserts
//!
//! One live notification per kind: a newer matching insert replaces the
//! current one. Alerts are advisory and never feed back into transcripts,
//! and side effects such as the chime may fail without consequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::channel::ChannelMessage;
use crate::error::{Result, SwitchboardError};
use crate::subscription::{Delivery, Subscription, SubscriptionManager, SubscriptionTarget};
use crate::types::{
    Notification, NotificationKind, NotificationPayload, Operation, RawEvent, ORDERS_TABLE,
};

/// A row change kind that raises a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub kind: NotificationKind,
    pub table: String,
    pub operation: Operation,
}

impl Interest {
    /// Inserted orders
    pub fn new_orders() -> Self {
        Self {
            kind: NotificationKind::NewOrder,
            table: ORDERS_TABLE.to_string(),
            operation: Operation::Insert,
        }
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        event.table == self.table && event.operation == self.operation
    }
}

/// Best-effort side effect of a notification (sound, desktop badge, ...)
pub trait AlertEffect: Send + Sync {
    fn name(&self) -> &str;

    fn fire(&self, notification: &Notification) -> Result<()>;
}

/// Effect that records the chime in the log; stands in for audio playback
/// where no audio device exists
pub struct LogChime {
    sound: String,
}

impl LogChime {
    pub fn new(sound: impl Into<String>) -> Self {
        Self {
            sound: sound.into(),
        }
    }
}

impl Default for LogChime {
    fn default() -> Self {
        Self::new("/notification.mp3")
    }
}

impl AlertEffect for LogChime {
    fn name(&self) -> &str {
        "chime"
    }

    fn fire(&self, notification: &Notification) -> Result<()> {
        tracing::info!(sound = %self.sound, notification = %notification.id, "chime");
        Ok(())
    }
}

/// Record ids remembered per kind to absorb redelivery (default: 256)
pub const DEFAULT_ROUTED_MEMORY: usize = 256;

/// Bounded memory of the record ids that already raised a notification
struct RoutedRecords {
    order: VecDeque<String>,
    seen: HashSet<String>,
    max_size: usize,
}

impl RoutedRecords {
    fn new(max_size: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            max_size: max_size.max(1),
        }
    }

    /// Remember a record id. Returns `false` if it was already routed.
    fn insert(&mut self, record_id: &str) -> bool {
        if self.seen.contains(record_id) {
            return false;
        }
        if self.order.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(record_id.to_string());
        self.seen.insert(record_id.to_string());
        true
    }
}

/// Single-slot register of live notifications per kind
pub struct NotificationRouter {
    interests: Vec<Interest>,
    /// Latest notification per kind; a dismissed one stays until replaced
    slots: HashMap<NotificationKind, Notification>,
    routed: HashMap<NotificationKind, RoutedRecords>,
    routed_memory: usize,
    effects: Vec<Arc<dyn AlertEffect>>,
    tx: watch::Sender<Vec<Notification>>,
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new(vec![Interest::new_orders()])
    }
}

impl NotificationRouter {
    pub fn new(interests: Vec<Interest>) -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            interests,
            slots: HashMap::new(),
            routed: HashMap::new(),
            routed_memory: DEFAULT_ROUTED_MEMORY,
            effects: Vec::new(),
            tx,
        }
    }

    /// Add a side effect fired for every new notification
    pub fn with_effect(mut self, effect: Arc<dyn AlertEffect>) -> Self {
        self.effects.push(effect);
        self
    }

    /// How many record ids per kind are remembered as already routed
    pub fn with_routed_memory(mut self, max_size: usize) -> Self {
        self.routed_memory = max_size;
        self
    }

    /// Receiver of the live notification list
    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.tx.subscribe()
    }

    /// Live notification of a kind
    pub fn current(&self, kind: NotificationKind) -> Option<&Notification> {
        self.slots.get(&kind).filter(|n| !n.dismissed)
    }

    /// Live notifications, oldest first
    pub fn active(&self) -> Vec<Notification> {
        let mut active: Vec<Notification> = self
            .slots
            .values()
            .filter(|n| !n.dismissed)
            .cloned()
            .collect();
        active.sort_by_key(|n| n.created_at);
        active
    }

    /// Raise (or replace) the notification for a matching change
    pub fn route(&mut self, event: &RawEvent) -> Option<Notification> {
        let kind = self.interests.iter().find(|i| i.matches(event))?.kind;
        let notification = build_notification(kind, event);

        if let Some(ref record_id) = notification.payload.record_id {
            let memory = self.routed_memory;
            let fresh = self
                .routed
                .entry(kind)
                .or_insert_with(|| RoutedRecords::new(memory))
                .insert(record_id);
            if !fresh {
                tracing::debug!(notification = %notification.id, "notification redelivery absorbed");
                return None;
            }
        }

        if let Some(replaced) = self.slots.insert(kind, notification.clone()) {
            tracing::debug!(replaced = %replaced.id, by = %notification.id, "notification replaced");
        }
        tracing::info!(
            notification = %notification.id,
            kind = ?kind,
            "{}",
            notification.payload.message
        );

        for effect in &self.effects {
            if let Err(e) = effect.fire(&notification) {
                tracing::warn!(effect = effect.name(), "alert effect failed: {}", e);
            }
        }

        self.publish();
        Some(notification)
    }

    /// Dismiss the live notification with this id. Returns `false` for
    /// stale or unknown ids, which are otherwise ignored.
    pub fn dismiss(&mut self, notification_id: &str) -> bool {
        let Some(dismissed) = self
            .slots
            .values_mut()
            .find(|n| n.id == notification_id && !n.dismissed)
        else {
            tracing::debug!(notification = notification_id, "stale dismiss ignored");
            return false;
        };

        dismissed.dismissed = true;
        tracing::debug!(notification = %dismissed.id, "notification dismissed");
        self.publish();
        true
    }

    fn publish(&self) {
        self.tx.send_replace(self.active());
    }
}

fn build_notification(kind: NotificationKind, event: &RawEvent) -> Notification {
    let record_id = event.column("id");
    let payload = match kind {
        NotificationKind::NewOrder => {
            let order_number = event
                .column("order_number")
                .or_else(|| record_id.clone())
                .unwrap_or_else(|| "?".to_string());
            let amount = event.row.get("total").and_then(|total| {
                total
                    .as_f64()
                    .or_else(|| total.as_str().and_then(|s| s.parse().ok()))
            });
            NotificationPayload {
                message: format!("New order #{} received!", order_number),
                amount,
                record_id: record_id.clone(),
            }
        }
    };

    Notification {
        id: record_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        kind,
        payload,
        created_at: Utc::now(),
        dismissed: false,
    }
}

enum NotifyCommand {
    Dismiss {
        notification_id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Runs a [`NotificationRouter`] as the single writer of the notification
/// register, fed by a table-wide subscription
pub struct NotificationService {
    commands: mpsc::Sender<NotifyCommand>,
    notifications: watch::Receiver<Vec<Notification>>,
    subscription: Subscription,
    manager: Arc<SubscriptionManager>,
    task: JoinHandle<()>,
}

impl NotificationService {
    /// Subscribe to the router's table and start routing
    pub async fn start(
        manager: Arc<SubscriptionManager>,
        router: NotificationRouter,
        table: &str,
        queue_capacity: usize,
    ) -> Result<Self> {
        let (sink, deliveries) = mpsc::channel(queue_capacity.max(1));
        let subscription = manager
            .open(SubscriptionTarget::Table(table.to_string()), sink)
            .await?;

        let (commands, command_rx) = mpsc::channel(32);
        let notifications = router.subscribe();
        let task = tokio::spawn(run(
            router,
            subscription.generation,
            deliveries,
            command_rx,
        ));

        Ok(Self {
            commands,
            notifications,
            subscription,
            manager,
            task,
        })
    }

    /// Dismiss a notification; `Ok(false)` for stale ids
    pub async fn dismiss(&self, notification_id: impl Into<String>) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NotifyCommand::Dismiss {
                notification_id: notification_id.into(),
                reply,
            })
            .await
            .map_err(|_| SwitchboardError::SessionClosed(self.subscription.scope_id.clone()))?;
        response
            .await
            .map_err(|_| SwitchboardError::SessionClosed(self.subscription.scope_id.clone()))
    }

    /// Receiver of the live notification list
    pub fn watch(&self) -> watch::Receiver<Vec<Notification>> {
        self.notifications.clone()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Close the subscription and stop routing
    pub async fn shutdown(self) {
        self.manager.close(&self.subscription).await;
        self.task.abort();
    }
}

async fn run(
    mut router: NotificationRouter,
    generation: u64,
    mut deliveries: mpsc::Receiver<Delivery>,
    mut commands: mpsc::Receiver<NotifyCommand>,
) {
    loop {
        tokio::select! {
            Some(delivery) = deliveries.recv() => {
                if delivery.generation != generation {
                    continue;
                }
                match delivery.message {
                    ChannelMessage::Change(event) => {
                        router.route(&event);
                    }
                    ChannelMessage::Resumed => {
                        tracing::debug!("alert channel resumed; missed alerts are not replayed");
                    }
                    ChannelMessage::Failed(reason) => {
                        tracing::warn!("alert channel failed: {}", reason);
                    }
                }
            }
            Some(command) = commands.recv() => match command {
                NotifyCommand::Dismiss { notification_id, reply } => {
                    let _ = reply.send(router.dismiss(&notification_id));
                }
            },
            else => break,
        }
    }

    tracing::info!("Notification router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use parking_lot::Mutex;
    use serde_json::json;

    fn order(id: &str, number: &str, total: f64) -> RawEvent {
        RawEvent::insert(
            "orders",
            json!({"id": id, "order_number": number, "total": total}),
        )
    }

    struct RecordingEffect {
        fired: Mutex<Vec<String>>,
    }

    impl AlertEffect for RecordingEffect {
        fn name(&self) -> &str {
            "recording"
        }

        fn fire(&self, notification: &Notification) -> Result<()> {
            self.fired.lock().push(notification.id.clone());
            Ok(())
        }
    }

    struct BrokenSpeaker;

    impl AlertEffect for BrokenSpeaker {
        fn name(&self) -> &str {
            "speaker"
        }

        fn fire(&self, _: &Notification) -> Result<()> {
            Err(SwitchboardError::Internal("no audio device".to_string()))
        }
    }

    #[test]
    fn test_new_order_message() {
        let mut router = NotificationRouter::default();
        let n = router.route(&order("o1", "ORD-1700000000", 59.9)).unwrap();

        assert_eq!(n.id, "o1");
        assert_eq!(n.kind, NotificationKind::NewOrder);
        assert_eq!(n.payload.message, "New order #ORD-1700000000 received!");
        assert_eq!(n.payload.amount, Some(59.9));
        assert!(!n.dismissed);
    }

    #[test]
    fn test_second_order_replaces_first() {
        let mut router = NotificationRouter::default();
        let first = router.route(&order("o1", "ORD-1", 10.0)).unwrap();
        let second = router.route(&order("o2", "ORD-2", 20.0)).unwrap();

        let active = router.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);

        assert!(router.dismiss(&second.id));
        assert!(router.active().is_empty());
        // Stale dismiss is a no-op
        assert!(!router.dismiss(&first.id));
        assert!(!router.dismiss(&second.id));
    }

    #[test]
    fn test_ignores_uninteresting_changes() {
        let mut router = NotificationRouter::default();
        let update = RawEvent {
            operation: Operation::Update,
            ..order("o1", "ORD-1", 10.0)
        };
        assert!(router.route(&update).is_none());
        assert!(router
            .route(&RawEvent::insert("customers", json!({"id": "c1"})))
            .is_none());
    }

    #[test]
    fn test_redelivered_order_absorbed() {
        let effect = Arc::new(RecordingEffect {
            fired: Mutex::new(Vec::new()),
        });
        let mut router = NotificationRouter::default().with_effect(effect.clone());

        router.route(&order("o1", "ORD-1", 10.0));
        assert!(router.route(&order("o1", "ORD-1", 10.0)).is_none());
        assert_eq!(*effect.fired.lock(), vec!["o1".to_string()]);
    }

    #[test]
    fn test_effect_failure_contained() {
        let mut router = NotificationRouter::default().with_effect(Arc::new(BrokenSpeaker));
        let n = router.route(&order("o1", "ORD-1", 10.0));
        assert!(n.is_some());
        assert_eq!(router.active().len(), 1);
    }

    #[test]
    fn test_older_order_redelivered_keeps_newer_alert() {
        let effect = Arc::new(RecordingEffect {
            fired: Mutex::new(Vec::new()),
        });
        let mut router = NotificationRouter::default().with_effect(effect.clone());

        router.route(&order("o1", "ORD-1", 10.0));
        router.route(&order("o2", "ORD-2", 20.0));
        // Reconnect replays o1
        assert!(router.route(&order("o1", "ORD-1", 10.0)).is_none());

        let active = router.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "o2");
        assert_eq!(
            *effect.fired.lock(),
            vec!["o1".to_string(), "o2".to_string()]
        );
    }

    #[test]
    fn test_dismissed_alert_not_raised_by_redelivery() {
        let mut router = NotificationRouter::default();
        router.route(&order("o1", "ORD-1", 10.0));
        router.route(&order("o2", "ORD-2", 20.0));
        assert!(router.dismiss("o2"));

        assert!(router.route(&order("o1", "ORD-1", 10.0)).is_none());
        assert!(router.route(&order("o2", "ORD-2", 20.0)).is_none());
        assert!(router.active().is_empty());
        assert!(router.current(NotificationKind::NewOrder).is_none());

        // A genuinely new order still raises
        let n = router.route(&order("o3", "ORD-3", 30.0)).unwrap();
        assert_eq!(router.active(), vec![n]);
    }

    #[test]
    fn test_dismiss_marks_slot() {
        let mut router = NotificationRouter::default();
        router.route(&order("o1", "ORD-1", 10.0));
        assert!(router.dismiss("o1"));

        let slot = &router.slots[&NotificationKind::NewOrder];
        assert_eq!(slot.id, "o1");
        assert!(slot.dismissed);
        assert!(!router.dismiss("o1"));
    }

    #[test]
    fn test_routed_memory_is_bounded() {
        let mut router = NotificationRouter::default().with_routed_memory(2);
        router.route(&order("o1", "ORD-1", 10.0));
        router.route(&order("o2", "ORD-2", 20.0));
        router.route(&order("o3", "ORD-3", 30.0));

        let routed = &router.routed[&NotificationKind::NewOrder];
        assert_eq!(routed.order.len(), 2);
        assert!(!routed.seen.contains("o1"));
        // Evicted ids are treated as new again
        assert!(router.route(&order("o1", "ORD-1", 10.0)).is_some());
    }

    #[test]
    fn test_amount_from_string_total() {
        let mut router = NotificationRouter::default();
        let raw = RawEvent::insert(
            "orders",
            json!({"id": "o9", "order_number": "ORD-9", "total": "120.50"}),
        );
        assert_eq!(router.route(&raw).unwrap().payload.amount, Some(120.5));
    }

    #[tokio::test]
    async fn test_service_routes_and_dismisses() {
        let channel = MemoryChannel::new(64);
        let manager = Arc::new(SubscriptionManager::new(Arc::new(channel.clone())));
        let service = NotificationService::start(
            manager.clone(),
            NotificationRouter::default(),
            "orders",
            16,
        )
        .await
        .unwrap();
        let mut rx = service.watch();

        channel.publish(order("o1", "ORD-1", 10.0));
        channel.publish(order("o2", "ORD-2", 20.0));

        let active = rx
            .wait_for(|list| list.first().is_some_and(|n| n.id == "o2"))
            .await
            .unwrap()
            .clone();
        assert_eq!(active.len(), 1);

        assert!(service.dismiss("o2").await.unwrap());
        assert!(!service.dismiss("o1").await.unwrap());
        assert!(rx.borrow().is_empty());

        service.shutdown().await;
        assert_eq!(manager.live_count(), 0);
    }
}
