//! WebSocket fan-out of view events

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::{ViewEvent, ViewFilter};
use crate::error::Result;
use crate::reconcile::Transcript;
use crate::types::{Notification, ScopeId, SubscriptionStatus};

/// Connection ID
pub type ConnectionId = String;

/// Broadcasts view events to connected dashboard clients
#[derive(Clone)]
pub struct ViewHub {
    tx: broadcast::Sender<ViewEvent>,
    /// Connected clients with their filters
    clients: Arc<RwLock<HashMap<ConnectionId, ViewFilter>>>,
}

impl ViewHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Broadcast an event to all matching clients
    pub fn broadcast(&self, event: ViewEvent) {
        let _ = self.tx.send(event);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.tx.subscribe()
    }

    pub fn register_client(&self, id: ConnectionId, filter: ViewFilter) {
        self.clients.write().insert(id, filter);
    }

    pub fn unregister_client(&self, id: &str) {
        self.clients.write().remove(id);
    }

    pub fn client_filter(&self, id: &str) -> Option<ViewFilter> {
        self.clients.read().get(id).cloned()
    }

    /// Forward every transcript emission and status change of a session
    /// until both sources are gone
    pub fn relay_transcript(
        &self,
        scope_id: impl Into<ScopeId>,
        mut transcript: watch::Receiver<Transcript>,
        mut status: watch::Receiver<SubscriptionStatus>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        let scope_id = scope_id.into();

        tokio::spawn(async move {
            hub.broadcast(ViewEvent::transcript(&transcript.borrow_and_update()));
            hub.broadcast(ViewEvent::subscription_status(
                scope_id.clone(),
                *status.borrow_and_update(),
            ));

            let mut transcript_open = true;
            let mut status_open = true;
            while transcript_open || status_open {
                tokio::select! {
                    changed = transcript.changed(), if transcript_open => match changed {
                        Ok(()) => {
                            let event = ViewEvent::transcript(&transcript.borrow_and_update());
                            hub.broadcast(event);
                        }
                        Err(_) => transcript_open = false,
                    },
                    changed = status.changed(), if status_open => match changed {
                        Ok(()) => {
                            let current = *status.borrow_and_update();
                            hub.broadcast(ViewEvent::subscription_status(scope_id.clone(), current));
                        }
                        Err(_) => status_open = false,
                    },
                }
            }

            tracing::debug!(scope = %scope_id, "transcript relay finished");
        })
    }

    /// Forward changes of the live notification list
    pub fn relay_notifications(
        &self,
        mut notifications: watch::Receiver<Vec<Notification>>,
    ) -> JoinHandle<()> {
        let hub = self.clone();

        tokio::spawn(async move {
            while notifications.changed().await.is_ok() {
                let current = notifications.borrow_and_update().clone();
                hub.broadcast(ViewEvent::notifications(current));
            }
        })
    }
}

impl Default for ViewHub {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// WebSocket server for dashboard clients
pub struct ViewServer {
    hub: ViewHub,
    addr: SocketAddr,
}

impl ViewServer {
    pub fn new(hub: ViewHub, port: u16) -> Self {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Self { hub, addr }
    }

    /// `/ws` and `/health`
    pub fn router(hub: ViewHub) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(hub)
    }

    /// Serve only the view routes
    pub async fn start(self) -> Result<()> {
        let app = Self::router(self.hub);

        tracing::info!("View server listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn health_handler(State(hub): State<ViewHub>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "clients": hub.client_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<ViewHub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: ViewHub) {
    let connection_id = Uuid::new_v4().to_string();

    hub.register_client(connection_id.clone(), ViewFilter::default());
    tracing::info!("Client connected: {}", connection_id);

    let (mut sender, mut receiver) = socket.split();
    let mut rx = hub.subscribe();

    let conn_id = connection_id.clone();
    let send_hub = hub.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Every transcript event is a full re-render; the next
                    // one catches the client up
                    tracing::debug!(client = %conn_id, skipped, "view client lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(filter) = send_hub.client_filter(&conn_id) else {
                break;
            };
            if !filter.matches(&event) {
                continue;
            }
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Failed to encode view event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let conn_id = connection_id.clone();
    let recv_hub = hub.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match ViewFilter::from_json(&text) {
                    Ok(filter) => {
                        recv_hub.register_client(conn_id.clone(), filter);
                        tracing::debug!("Updated filter for client {}", conn_id);
                    }
                    Err(e) => tracing::debug!("Ignoring client message: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    hub.unregister_client(&connection_id);
    tracing::info!("Client disconnected: {}", connection_id);
}
