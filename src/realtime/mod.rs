//! Real-time view updates via WebSocket
//!
//! Pushes transcript re-renders, notification changes and subscription
//! status to connected dashboard clients.

mod events;
mod server;

pub use events::{ViewEvent, ViewEventType, ViewFilter};
pub use server::{ConnectionId, ViewHub, ViewServer};
