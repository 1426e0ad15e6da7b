//! Transcript reconciliation
//!
//! Merges the initial snapshot, optimistic local entries and confirmed
//! events pushed by the channel into one sequence that is sorted by
//! `created_at` (stable by arrival) and never holds two entries with the
//! same id.
//!
//! The insert position is found by binary search, but the sequence is a
//! `Vec`, so each insert still shifts the tail. That is fine for
//! transcripts of a few hundred entries; past a few thousand the shift
//! dominates and a chunked structure would be needed.

mod correlate;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::{Result, SwitchboardError};
use crate::optimistic::{LocalEntry, OptimisticBuffer, PendingHandle, DEFAULT_MAX_PENDING};
use crate::types::{DeliveryState, Direction, Event, EventId, MessageBody, Origin, ScopeId};

use correlate::{correlate, Correlation};

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Max distance between a local entry's timestamp and its confirmation
    /// for content-based correlation (default: 2 minutes)
    pub correlation_window: Duration,
    /// How long a local entry may stay unconfirmed (default: 30 seconds)
    pub unconfirmed_timeout: Duration,
    /// Cap on unconfirmed entries (default: 256)
    pub max_pending: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::from_secs(120),
            unconfirmed_timeout: Duration::from_secs(30),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl ReconcilerConfig {
    /// Reject settings under which no message could ever be confirmed
    pub fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(SwitchboardError::Config(
                "max_pending must be at least 1".to_string(),
            ));
        }
        if self.unconfirmed_timeout.is_zero() {
            return Err(SwitchboardError::Config(
                "unconfirmed_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// What happened to an ingested event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New entry inserted at its `created_at` position
    Inserted,
    /// An optimistic entry was upgraded to confirmed
    Upgraded { local_id: EventId },
    /// Same id already rendered; redelivery absorbed
    Duplicate,
    /// Event belongs to another scope and was ignored
    OtherScope,
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Inserted | IngestOutcome::Upgraded { .. }
        )
    }
}

/// Rendered state of a transcript, as emitted to the view
#[derive(Debug, Clone)]
pub struct Transcript {
    pub scope_id: ScopeId,
    /// Bumped on every emission
    pub version: u64,
    pub events: Arc<Vec<Event>>,
}

impl Transcript {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Merge engine for one scope. Not thread-safe by itself; a single task
/// owns it (see [`crate::session`]).
pub struct Reconciler {
    scope_id: ScopeId,
    config: ReconcilerConfig,
    sequence: Vec<Event>,
    ids: HashSet<EventId>,
    buffer: OptimisticBuffer,
    version: u64,
    tx: watch::Sender<Transcript>,
}

impl Reconciler {
    pub fn new(scope_id: impl Into<ScopeId>, config: ReconcilerConfig) -> Self {
        let scope_id = scope_id.into();
        let (tx, _) = watch::channel(Transcript {
            scope_id: scope_id.clone(),
            version: 0,
            events: Arc::new(Vec::new()),
        });
        Self {
            scope_id,
            buffer: OptimisticBuffer::new(config.max_pending),
            config,
            sequence: Vec::new(),
            ids: HashSet::new(),
            version: 0,
            tx,
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Receiver that sees every emitted transcript
    pub fn subscribe(&self) -> watch::Receiver<Transcript> {
        self.tx.subscribe()
    }

    /// Current transcript
    pub fn transcript(&self) -> Transcript {
        self.tx.borrow().clone()
    }

    /// Rendered entries in order
    pub fn events(&self) -> &[Event] {
        &self.sequence
    }

    /// Number of unconfirmed local entries
    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    /// Seed the sequence from a freshly loaded snapshot.
    ///
    /// Previously confirmed entries are replaced; local entries that are
    /// still pending or undelivered are kept and may correlate with
    /// snapshot rows.
    pub fn snapshot(&mut self, mut events: Vec<Event>) {
        self.sequence.retain(|e| e.is_local() && !e.is_confirmed());
        self.ids = self.sequence.iter().map(|e| e.id.clone()).collect();

        events.sort_by_key(|e| e.created_at);
        let mut inserted = 0usize;
        for event in events {
            if self.ingest_inner(event).changed() {
                inserted += 1;
            }
        }

        tracing::debug!(scope = %self.scope_id, inserted, "snapshot seeded");
        self.emit();
    }

    /// Merge a re-fetched snapshot without dropping anything already shown.
    /// Returns how many entries changed.
    pub fn resync(&mut self, mut events: Vec<Event>) -> usize {
        events.sort_by_key(|e| e.created_at);
        let changed = events
            .into_iter()
            .map(|event| self.ingest_inner(event))
            .filter(IngestOutcome::changed)
            .count();

        if changed > 0 {
            tracing::info!(scope = %self.scope_id, changed, "resync closed a delivery gap");
            self.emit();
        }
        changed
    }

    /// Fold one confirmed event into the sequence
    pub fn ingest(&mut self, event: Event) -> IngestOutcome {
        let event_id = event.id.clone();
        let outcome = self.ingest_inner(event);
        match outcome {
            IngestOutcome::Duplicate => {
                tracing::debug!(scope = %self.scope_id, %event_id, "duplicate delivery absorbed");
            }
            IngestOutcome::OtherScope => {
                tracing::debug!(scope = %self.scope_id, %event_id, "event for another scope ignored");
            }
            _ => self.emit(),
        }
        outcome
    }

    /// Show a locally produced message immediately and register it as
    /// pending
    pub fn add_local(&mut self, payload: MessageBody, direction: Direction) -> Result<LocalEntry> {
        if payload.text.trim().is_empty() {
            return Err(SwitchboardError::InvalidInput(
                "message text is empty".to_string(),
            ));
        }

        let entry = self.buffer.add(Event {
            id: String::new(),
            scope_id: self.scope_id.clone(),
            payload,
            direction,
            origin: Origin::Local,
            delivery: DeliveryState::Pending,
            created_at: Utc::now(),
            client_ref: None,
        })?;

        self.ids.insert(entry.event.id.clone());
        self.insert_sorted(entry.event.clone());
        tracing::debug!(
            scope = %self.scope_id,
            handle = %entry.handle,
            local_id = %entry.event.id,
            "optimistic entry added"
        );
        self.emit();
        Ok(entry)
    }

    /// Acknowledge a write: the store returned the confirmed event for a
    /// pending entry
    pub fn confirm_local(&mut self, handle: PendingHandle, event: Event) -> IngestOutcome {
        if event.scope_id != self.scope_id {
            return IngestOutcome::OtherScope;
        }
        if self.ids.contains(&event.id) {
            tracing::debug!(
                scope = %self.scope_id,
                %handle,
                event_id = %event.id,
                "write confirmation already applied"
            );
            return IngestOutcome::Duplicate;
        }

        match self.buffer.resolve(handle) {
            Some(entry) => {
                self.upgrade(&entry.local_id, event);
                self.emit();
                IngestOutcome::Upgraded {
                    local_id: entry.local_id,
                }
            }
            // Expired, or resolved by an echo that matched a twin entry
            None => self.ingest(event),
        }
    }

    /// Mark a pending entry as not delivered after a failed write
    pub fn mark_failed(&mut self, handle: PendingHandle) -> Result<()> {
        let entry = self
            .buffer
            .expire(handle)
            .ok_or(SwitchboardError::UnknownHandle(handle.0))?;
        self.set_undelivered(&entry.local_id);
        tracing::warn!(
            scope = %self.scope_id,
            %handle,
            local_id = %entry.local_id,
            "send failed, entry marked not delivered"
        );
        self.emit();
        Ok(())
    }

    /// Expire every entry that waited longer than the unconfirmed timeout
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<PendingHandle> {
        let overdue = self.buffer.overdue(now, self.config.unconfirmed_timeout);
        for &handle in &overdue {
            if let Some(entry) = self.buffer.expire(handle) {
                let timeout = SwitchboardError::UnconfirmedTimeout {
                    handle: handle.0,
                    waited_ms: now.saturating_duration_since(entry.added_at).as_millis() as u64,
                };
                tracing::warn!(scope = %self.scope_id, local_id = %entry.local_id, "{}", timeout);
                self.set_undelivered(&entry.local_id);
            }
        }
        if !overdue.is_empty() {
            self.emit();
        }
        overdue
    }

    fn ingest_inner(&mut self, event: Event) -> IngestOutcome {
        if event.scope_id != self.scope_id {
            return IngestOutcome::OtherScope;
        }
        if self.ids.contains(&event.id) {
            return IngestOutcome::Duplicate;
        }

        let local_id = match correlate(
            &self.buffer,
            &self.sequence,
            &event,
            self.config.correlation_window,
        ) {
            Some(Correlation::Pending(handle)) => {
                self.buffer.resolve(handle).map(|entry| entry.local_id)
            }
            Some(Correlation::Undelivered(local_id)) => Some(local_id),
            None => None,
        };

        match local_id {
            Some(local_id) => {
                tracing::debug!(
                    scope = %self.scope_id,
                    %local_id,
                    event_id = %event.id,
                    "optimistic entry confirmed"
                );
                self.upgrade(&local_id, event);
                IngestOutcome::Upgraded { local_id }
            }
            None => {
                self.ids.insert(event.id.clone());
                self.insert_sorted(event);
                IngestOutcome::Inserted
            }
        }
    }

    /// Turn the local entry into the confirmed one. The entry keeps its
    /// local origin; id, timestamp and payload become authoritative.
    fn upgrade(&mut self, local_id: &str, confirmed: Event) {
        let Some(idx) = self.sequence.iter().position(|e| e.id == local_id) else {
            // Entry vanished (snapshot reset); show the confirmation as new
            self.ids.insert(confirmed.id.clone());
            self.insert_sorted(confirmed);
            return;
        };

        let mut entry = self.sequence.remove(idx);
        self.ids.remove(local_id);
        entry.id = confirmed.id;
        entry.created_at = confirmed.created_at;
        entry.payload = confirmed.payload;
        entry.delivery = DeliveryState::Confirmed;
        if confirmed.client_ref.is_some() {
            entry.client_ref = confirmed.client_ref;
        }

        self.ids.insert(entry.id.clone());
        self.insert_sorted(entry);
    }

    fn set_undelivered(&mut self, local_id: &str) {
        if let Some(entry) = self.sequence.iter_mut().find(|e| e.id == local_id) {
            entry.delivery = DeliveryState::NotDelivered;
        }
    }

    fn insert_sorted(&mut self, event: Event) {
        let idx = insertion_index(&self.sequence, event.created_at);
        self.sequence.insert(idx, event);
    }

    fn emit(&mut self) {
        self.version += 1;
        self.tx.send_replace(Transcript {
            scope_id: self.scope_id.clone(),
            version: self.version,
            events: Arc::new(self.sequence.clone()),
        });
    }
}

/// Position after every entry with `created_at <= at`, so equal timestamps
/// keep arrival order
fn insertion_index(sequence: &[Event], at: DateTime<Utc>) -> usize {
    sequence.partition_point(|e| e.created_at <= at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn inbound(id: &str, text: &str, secs: i64) -> Event {
        Event::remote(id, "c1", MessageBody::customer(text), Direction::Inbound, at(secs))
    }

    fn outbound_echo(id: &str, text: &str) -> Event {
        Event::remote(
            id,
            "c1",
            MessageBody::operator(text),
            Direction::Outbound,
            Utc::now(),
        )
    }

    fn ids(reconciler: &Reconciler) -> Vec<String> {
        reconciler.events().iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_snapshot_sorts_and_dedups() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        r.snapshot(vec![
            inbound("b", "second", 2),
            inbound("a", "first", 1),
            inbound("b", "second", 2),
        ]);
        assert_eq!(ids(&r), vec!["a", "b"]);
        assert_eq!(r.transcript().version, 1);
    }

    #[test]
    fn test_local_then_confirm_scenario() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        r.snapshot(vec![]);

        let local = r
            .add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();
        assert_eq!(r.events().len(), 1);
        assert_eq!(r.events()[0].id, local.event.id);
        assert!(!r.events()[0].is_confirmed());

        let outcome = r.ingest(outbound_echo("srv1", "Hi"));
        assert_eq!(
            outcome,
            IngestOutcome::Upgraded {
                local_id: local.event.id.clone()
            }
        );
        assert_eq!(r.events().len(), 1);
        assert_eq!(r.events()[0].id, "srv1");
        assert_eq!(r.events()[0].payload.text, "Hi");
        assert!(r.events()[0].is_confirmed());
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        assert_eq!(r.ingest(inbound("m1", "hola", 1)), IngestOutcome::Inserted);
        let before = r.transcript();

        assert_eq!(r.ingest(inbound("m1", "hola", 1)), IngestOutcome::Duplicate);
        assert_eq!(r.events(), before.events.as_slice());
        assert_eq!(r.transcript().version, before.version);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        r.ingest(inbound("A", "first", 5));
        r.ingest(inbound("B", "second", 5));
        r.ingest(inbound("early", "zero", 1));
        assert_eq!(ids(&r), vec!["early", "A", "B"]);
    }

    #[test]
    fn test_out_of_order_delivery_sorted() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        r.ingest(inbound("m3", "c", 3));
        r.ingest(inbound("m1", "a", 1));
        r.ingest(inbound("m2", "b", 2));
        assert_eq!(ids(&r), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_other_scope_ignored() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        let mut event = inbound("m1", "hola", 1);
        event.scope_id = "c2".to_string();
        assert_eq!(r.ingest(event), IngestOutcome::OtherScope);
        assert!(r.events().is_empty());
    }

    #[test]
    fn test_blank_local_rejected() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        assert!(matches!(
            r.add_local(MessageBody::operator("   "), Direction::Outbound),
            Err(SwitchboardError::InvalidInput(_))
        ));
        assert!(r.events().is_empty());
    }

    #[test]
    fn test_confirm_local_then_echo() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        let local = r
            .add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();
        let client_ref = local.event.client_ref.clone().unwrap();

        let confirmed = outbound_echo("srv1", "Hi").with_client_ref(client_ref);
        assert!(matches!(
            r.confirm_local(local.handle, confirmed.clone()),
            IngestOutcome::Upgraded { .. }
        ));
        assert_eq!(r.ingest(confirmed), IngestOutcome::Duplicate);
        assert_eq!(ids(&r), vec!["srv1"]);
    }

    #[test]
    fn test_echo_then_confirm_local() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        let local = r
            .add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();

        r.ingest(outbound_echo("srv1", "Hi"));
        assert_eq!(
            r.confirm_local(local.handle, outbound_echo("srv1", "Hi")),
            IngestOutcome::Duplicate
        );
        assert_eq!(ids(&r), vec!["srv1"]);
    }

    #[test]
    fn test_identical_twins_both_confirmed() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        let first = r
            .add_local(MessageBody::operator("ok"), Direction::Outbound)
            .unwrap();
        let second = r
            .add_local(MessageBody::operator("ok"), Direction::Outbound)
            .unwrap();

        // Echo of the second write arrives first, without a client_ref
        r.ingest(outbound_echo("srv2", "ok"));
        r.confirm_local(first.handle, outbound_echo("srv1", "ok"));
        r.confirm_local(second.handle, outbound_echo("srv2", "ok"));

        let mut shown = ids(&r);
        shown.sort();
        assert_eq!(shown, vec!["srv1", "srv2"]);
        assert!(r.events().iter().all(Event::is_confirmed));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_failed_send_marked_not_delivered() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        let local = r
            .add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();

        r.mark_failed(local.handle).unwrap();
        assert_eq!(r.events()[0].delivery, DeliveryState::NotDelivered);
        assert_eq!(r.pending_count(), 0);
        assert!(matches!(
            r.mark_failed(local.handle),
            Err(SwitchboardError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(ReconcilerConfig::default().validate().is_ok());

        let no_room = ReconcilerConfig {
            max_pending: 0,
            ..ReconcilerConfig::default()
        };
        assert!(matches!(no_room.validate(), Err(SwitchboardError::Config(_))));

        let no_wait = ReconcilerConfig {
            unconfirmed_timeout: Duration::ZERO,
            ..ReconcilerConfig::default()
        };
        assert!(matches!(no_wait.validate(), Err(SwitchboardError::Config(_))));
    }

    #[test]
    fn test_expire_overdue_and_late_confirmation() {
        let config = ReconcilerConfig {
            unconfirmed_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let mut r = Reconciler::new("c1", config);
        let local = r
            .add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();
        let client_ref = local.event.client_ref.clone().unwrap();

        assert!(r.expire_overdue(Instant::now()).is_empty());
        let expired = r.expire_overdue(Instant::now() + Duration::from_secs(6));
        assert_eq!(expired, vec![local.handle]);
        assert_eq!(r.events()[0].delivery, DeliveryState::NotDelivered);

        let late = outbound_echo("srv1", "Hi").with_client_ref(client_ref);
        assert!(matches!(r.ingest(late), IngestOutcome::Upgraded { .. }));
        assert_eq!(ids(&r), vec!["srv1"]);
        assert!(r.events()[0].is_confirmed());
    }

    #[test]
    fn test_uncorrelatable_echo_does_not_accumulate() {
        let config = ReconcilerConfig {
            unconfirmed_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let mut r = Reconciler::new("c1", config);
        r.add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();

        // The store rewrote the text and dropped the key: no correlation
        r.ingest(outbound_echo("srv1", "Hi!"));
        assert_eq!(r.events().len(), 2);
        assert_eq!(r.pending_count(), 1);

        r.expire_overdue(Instant::now() + Duration::from_secs(6));
        assert_eq!(r.pending_count(), 0);
        assert_eq!(r.events().len(), 2);
        r.ingest(outbound_echo("srv1", "Hi!"));
        assert_eq!(r.events().len(), 2);
    }

    #[test]
    fn test_snapshot_keeps_pending_locals() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        r.ingest(inbound("old", "stale", 1));
        let local = r
            .add_local(MessageBody::operator("Hi"), Direction::Outbound)
            .unwrap();

        r.snapshot(vec![inbound("m1", "hola", 2)]);
        assert_eq!(ids(&r), vec!["m1".to_string(), local.event.id.clone()]);
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_resync_fills_gap() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        r.snapshot(vec![inbound("m1", "a", 1)]);
        r.ingest(inbound("m3", "c", 3));

        let changed = r.resync(vec![
            inbound("m1", "a", 1),
            inbound("m2", "b", 2),
            inbound("m3", "c", 3),
        ]);
        assert_eq!(changed, 1);
        assert_eq!(ids(&r), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_emits_to_subscribers() {
        let mut r = Reconciler::new("c1", ReconcilerConfig::default());
        let mut rx = r.subscribe();

        r.ingest(inbound("m1", "hola", 1));
        rx.changed().await.unwrap();
        let transcript = rx.borrow_and_update().clone();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.version, 1);
    }
}
