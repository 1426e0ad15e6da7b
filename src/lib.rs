//! Switchboard - real-time event sync for messaging dashboards
//!
//! Keeps conversation transcripts consistent while confirmed rows arrive
//! over an at-least-once push channel and the operator writes optimistically,
//! and raises transient alerts for new orders.

pub mod channel;
pub mod error;
pub mod notify;
pub mod optimistic;
pub mod realtime;
pub mod reconcile;
pub mod session;
pub mod subscription;
pub mod types;

pub use channel::{Channel, ChannelFilter, ChannelMessage, MemoryChannel};
pub use error::{Result, SwitchboardError};
pub use notify::{NotificationRouter, NotificationService};
pub use reconcile::{IngestOutcome, Reconciler, ReconcilerConfig, Transcript};
pub use session::{ConversationStore, MemoryStore, SessionConfig, TranscriptSession};
pub use subscription::{SubscriptionManager, SubscriptionTarget};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
