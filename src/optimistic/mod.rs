//! Optimistic buffer for locally produced, unconfirmed events
//!
//! Entries live here from the moment the operator sends until the backing
//! store confirms them or the unconfirmed timeout expires them. The buffer
//! never touches the network.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{Result, SwitchboardError};
use crate::types::{Direction, Event, EventId, Origin, ScopeId, LOCAL_ID_PREFIX};

/// Default cap on unconfirmed entries per scope
pub const DEFAULT_MAX_PENDING: usize = 256;

/// Handle to a pending entry; never reused within a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingHandle(pub u64);

impl std::fmt::Display for PendingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pending-{}", self.0)
    }
}

/// A registered optimistic entry
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub handle: PendingHandle,
    /// Client-local id the entry is rendered under
    pub local_id: EventId,
    pub scope_id: ScopeId,
    /// Idempotency key sent along with the write
    pub client_ref: String,
    /// Content fingerprint, see [`fingerprint`]
    pub fingerprint: String,
    /// Client clock at send time
    pub created_at: DateTime<Utc>,
    pub added_at: Instant,
}

/// Result of registering a local event
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub handle: PendingHandle,
    /// The event with its client-local id and idempotency key filled in
    pub event: Event,
}

/// Collapse whitespace so that trimming by the write path does not break
/// correlation
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compute the correlation fingerprint of a message
pub fn fingerprint(scope_id: &str, direction: Direction, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(direction.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Fingerprint of an event's content
pub fn event_fingerprint(event: &Event) -> String {
    fingerprint(&event.scope_id, event.direction, &event.payload.text)
}

/// Unconfirmed local events, oldest first
#[derive(Debug)]
pub struct OptimisticBuffer {
    entries: Vec<PendingEntry>,
    next_handle: u64,
    max_pending: usize,
}

impl Default for OptimisticBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl OptimisticBuffer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 1,
            max_pending: max_pending.max(1),
        }
    }

    /// Register a local event.
    ///
    /// Assigns a client-local id and, when missing, an idempotency key.
    pub fn add(&mut self, mut event: Event) -> Result<LocalEntry> {
        if self.entries.len() >= self.max_pending {
            return Err(SwitchboardError::BufferFull(self.entries.len()));
        }

        let handle = PendingHandle(self.next_handle);
        self.next_handle += 1;

        event.id = format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4());
        event.origin = Origin::Local;
        let client_ref = event
            .client_ref
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        self.entries.push(PendingEntry {
            handle,
            local_id: event.id.clone(),
            scope_id: event.scope_id.clone(),
            client_ref,
            fingerprint: event_fingerprint(&event),
            created_at: event.created_at,
            added_at: Instant::now(),
        });

        Ok(LocalEntry { handle, event })
    }

    /// Remove an entry after confirmation
    pub fn resolve(&mut self, handle: PendingHandle) -> Option<PendingEntry> {
        self.take(handle)
    }

    /// Remove an entry that was never confirmed
    pub fn expire(&mut self, handle: PendingHandle) -> Option<PendingEntry> {
        let entry = self.take(handle)?;
        tracing::debug!(
            %handle,
            local_id = %entry.local_id,
            waited_ms = entry.added_at.elapsed().as_millis() as u64,
            "optimistic entry expired"
        );
        Some(entry)
    }

    pub fn get(&self, handle: PendingHandle) -> Option<&PendingEntry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    /// Entry carrying an idempotency key
    pub fn find_by_ref(&self, client_ref: &str) -> Option<&PendingEntry> {
        self.entries.iter().find(|e| e.client_ref == client_ref)
    }

    /// Entries of a scope with the given fingerprint, oldest first
    pub fn candidates(&self, scope_id: &str, fingerprint: &str) -> Vec<&PendingEntry> {
        self.entries
            .iter()
            .filter(|e| e.scope_id == scope_id && e.fingerprint == fingerprint)
            .collect()
    }

    /// Handles that have waited longer than `timeout`
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<PendingHandle> {
        self.entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.added_at) >= timeout)
            .map(|e| e.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn take(&mut self, handle: PendingHandle) -> Option<PendingEntry> {
        let idx = self.entries.iter().position(|e| e.handle == handle)?;
        Some(self.entries.remove(idx))
    }
}
