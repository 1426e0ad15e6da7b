//! Matching confirmed events to optimistic entries
//!
//! Local ids and server ids come from different namespaces, so identity is
//! never compared. Two keys are tried in order:
//!
//! 1. the idempotency key (`client_ref`) the write path round-trips;
//! 2. a content fingerprint (scope, direction, normalized text) limited to
//!    entries whose timestamp lies within the correlation window.
//!
//! A confirmed event that carries a `client_ref` matching nothing of ours
//! was written by someone else and is never fingerprint-matched.

use std::time::Duration;

use crate::optimistic::{event_fingerprint, OptimisticBuffer, PendingHandle};
use crate::types::{DeliveryState, Event, EventId};

/// The local entry a confirmed event stands for
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Correlation {
    /// Still waiting in the optimistic buffer
    Pending(PendingHandle),
    /// Already marked not delivered; the confirmation arrived late
    Undelivered(EventId),
}

pub(crate) fn correlate(
    buffer: &OptimisticBuffer,
    sequence: &[Event],
    event: &Event,
    window: Duration,
) -> Option<Correlation> {
    if let Some(ref client_ref) = event.client_ref {
        if let Some(entry) = buffer
            .find_by_ref(client_ref)
            .filter(|entry| entry.scope_id == event.scope_id)
        {
            return Some(Correlation::Pending(entry.handle));
        }
        return sequence
            .iter()
            .find(|e| {
                e.delivery == DeliveryState::NotDelivered
                    && e.client_ref.as_deref() == Some(client_ref.as_str())
            })
            .map(|e| Correlation::Undelivered(e.id.clone()));
    }

    let fingerprint = event_fingerprint(event);
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    let candidates: Vec<_> = buffer
        .candidates(&event.scope_id, &fingerprint)
        .into_iter()
        .filter(|entry| {
            (entry.created_at - event.created_at)
                .num_milliseconds()
                .abs()
                <= window_ms
        })
        .collect();

    match candidates.as_slice() {
        [] => None,
        [only] => Some(Correlation::Pending(only.handle)),
        [oldest, ..] => {
            tracing::warn!(
                scope = %event.scope_id,
                event_id = %event.id,
                candidates = candidates.len(),
                chosen = %oldest.handle,
                "ambiguous correlation, matching oldest pending entry"
            );
            Some(Correlation::Pending(oldest.handle))
        }
    }
}
