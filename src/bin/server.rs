//! Switchboard development server
//!
//! Wires sessions, the order alert router and the view WebSocket against the
//! in-process channel and store.
//!
//! Run with: switchboard-server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchboard::notify::LogChime;
use switchboard::realtime::{ViewHub, ViewServer};
use switchboard::{
    MemoryChannel, MemoryStore, NotificationRouter, NotificationService, ReconcilerConfig,
    ScopeId, SessionConfig, SubscriptionManager, SwitchboardError, TranscriptSession,
    ORDERS_TABLE,
};

#[derive(Parser, Debug)]
#[command(name = "switchboard-server")]
#[command(about = "Switchboard development server for the operator dashboard")]
struct Args {
    /// HTTP and WebSocket port
    #[arg(long, env = "SWITCHBOARD_PORT", default_value = "8787")]
    port: u16,

    /// Capacity of each subscription's delivery queue
    #[arg(long, env = "SWITCHBOARD_QUEUE_CAPACITY", default_value = "256")]
    queue_capacity: usize,

    /// Capacity of the in-process push channel
    #[arg(long, env = "SWITCHBOARD_CHANNEL_CAPACITY", default_value = "1024")]
    channel_capacity: usize,

    /// Seconds a sent message may stay unconfirmed before it shows as not delivered
    #[arg(long, env = "SWITCHBOARD_UNCONFIRMED_TIMEOUT", default_value = "30")]
    unconfirmed_timeout_secs: u64,

    /// Seconds between a local message and its echo for content correlation
    #[arg(long, env = "SWITCHBOARD_CORRELATION_WINDOW", default_value = "120")]
    correlation_window_secs: u64,

    /// Maximum unconfirmed messages per conversation
    #[arg(long, env = "SWITCHBOARD_MAX_PENDING", default_value = "256")]
    max_pending: usize,

    /// Expiry sweep interval in milliseconds
    #[arg(long, env = "SWITCHBOARD_SWEEP_INTERVAL_MS", default_value = "1000")]
    sweep_interval_ms: u64,

    /// Emit JSON logs
    #[arg(long, env = "SWITCHBOARD_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn session_config(&self) -> switchboard::Result<SessionConfig> {
        let config = SessionConfig {
            reconciler: ReconcilerConfig {
                correlation_window: Duration::from_secs(self.correlation_window_secs),
                unconfirmed_timeout: Duration::from_secs(self.unconfirmed_timeout_secs),
                max_pending: self.max_pending,
            },
            queue_capacity: self.queue_capacity,
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

struct OpenSession {
    session: TranscriptSession,
    relay: JoinHandle<()>,
}

#[derive(Clone)]
struct AppState {
    hub: ViewHub,
    manager: Arc<SubscriptionManager>,
    store: Arc<MemoryStore>,
    notifications: Arc<NotificationService>,
    sessions: Arc<Mutex<HashMap<ScopeId, Arc<OpenSession>>>>,
    session_config: SessionConfig,
}

impl AppState {
    fn session(&self, scope_id: &str) -> Result<Arc<OpenSession>, ApiError> {
        self.sessions
            .lock()
            .get(scope_id)
            .cloned()
            .ok_or_else(|| ApiError::NotOpen(scope_id.to_string()))
    }
}

enum ApiError {
    Switchboard(SwitchboardError),
    NotOpen(String),
}

impl From<SwitchboardError> for ApiError {
    fn from(e: SwitchboardError) -> Self {
        ApiError::Switchboard(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Switchboard(e) => (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.to_string(),
            ),
            ApiError::NotOpen(scope_id) => (
                StatusCode::NOT_FOUND,
                format!("conversation {} is not open", scope_id),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Deserialize)]
struct OrderRequest {
    total: f64,
}

async fn open_conversation(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = TranscriptSession::start(
        scope_id.clone(),
        state.manager.clone(),
        state.store.clone(),
        state.session_config.clone(),
    )
    .await?;
    let relay = state
        .hub
        .relay_transcript(scope_id.clone(), session.watch(), session.watch_status());
    let transcript = session.transcript();

    state
        .sessions
        .lock()
        .insert(scope_id.clone(), Arc::new(OpenSession { session, relay }));

    Ok(Json(json!({
        "scope_id": scope_id,
        "version": transcript.version,
        "events": &*transcript.events,
    })))
}

async fn close_conversation(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let open = state
        .sessions
        .lock()
        .remove(&scope_id)
        .ok_or_else(|| ApiError::NotOpen(scope_id.clone()))?;

    match Arc::try_unwrap(open) {
        Ok(OpenSession { session, relay }) => {
            session.close().await;
            let _ = relay.await;
        }
        // A request still holds it; closing the subscription is enough
        Err(shared) => state.manager.close(shared.session.subscription()).await,
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let open = state.session(&scope_id)?;
    let transcript = open.session.transcript();
    Ok(Json(json!({
        "scope_id": scope_id,
        "status": open.session.status(),
        "version": transcript.version,
        "events": &*transcript.events,
    })))
}

async fn send_message(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
    Json(body): Json<TextRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let open = state.session(&scope_id)?;
    let entry = open.session.send(body.text).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "handle": entry.handle.0,
            "event": entry.event,
        })),
    ))
}

async fn insert_inbound(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
    Json(body): Json<TextRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.text.trim().is_empty() {
        return Err(SwitchboardError::InvalidInput("text must not be blank".to_string()).into());
    }
    let event = state.store.insert_inbound(&scope_id, &body.text);
    Ok((StatusCode::CREATED, Json(json!(event))))
}

async fn create_order(
    State(state): State<AppState>,
    Json(body): Json<OrderRequest>,
) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(state.store.create_order(body.total)))
}

async fn dismiss_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let dismissed = state.notifications.dismiss(notification_id).await?;
    Ok(Json(json!({ "dismissed": dismissed })))
}

async fn list_notifications(State(state): State<AppState>) -> Json<Value> {
    let notifications = state.notifications.watch();
    let active = notifications.borrow().clone();
    Json(json!(active))
}

fn api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/conversations/:id",
            get(get_transcript)
                .post(open_conversation)
                .delete(close_conversation),
        )
        .route("/conversations/:id/messages", post(send_message))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/dismiss", post(dismiss_notification))
        .route("/dev/conversations/:id/inbound", post(insert_inbound))
        .route("/dev/orders", post(create_order))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let session_config = args.session_config().context("invalid configuration")?;

    // Logs go to stderr
    tracing_subscriber::registry()
        .with(args.log_json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!args.log_json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
        }))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let channel = MemoryChannel::new(args.channel_capacity);
    let store = Arc::new(MemoryStore::new(channel.clone()));
    let manager = Arc::new(SubscriptionManager::new(Arc::new(channel)));
    let hub = ViewHub::default();

    let router = NotificationRouter::default().with_effect(Arc::new(LogChime::default()));
    let notifications = NotificationService::start(
        manager.clone(),
        router,
        ORDERS_TABLE,
        args.queue_capacity,
    )
    .await
    .context("failed to subscribe to order alerts")?;
    let notification_relay = hub.relay_notifications(notifications.watch());

    let sessions: Arc<Mutex<HashMap<ScopeId, Arc<OpenSession>>>> = Arc::default();
    let state = AppState {
        hub: hub.clone(),
        manager: manager.clone(),
        store,
        notifications: Arc::new(notifications),
        sessions: sessions.clone(),
        session_config,
    };

    let app = api_router(state.clone())
        .merge(ViewServer::router(hub))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Switchboard server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Shutting down sessions...");
    let open: Vec<_> = sessions.lock().drain().map(|(_, s)| s).collect();
    for open in open {
        manager.close(open.session.subscription()).await;
        open.relay.abort();
    }
    manager.close(state.notifications.subscription()).await;
    notification_relay.abort();

    Ok(())
}
