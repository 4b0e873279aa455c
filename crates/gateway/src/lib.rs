//! HTTP gateway for Stepweave.
//!
//! Serves the chat API over resumable SSE streams, the approval endpoint
//! answering parked tool calls, a feed of domain events and a health check.
//!
//! Built on Axum. Shared subsystems (model router, tool provider cache,
//! approval gate, stream registry) are built once in [`GatewayState`] and
//! shared by every request.

pub mod auth;
pub mod chat;
pub mod error;
pub mod persistence;
pub mod resumable;

use axum::{
    Router,
    extract::State,
    response::Json,
    response::sse::{Event as SseEvent, Sse},
    routing::{get, post},
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use stepweave_agent::ApprovalGate;
use stepweave_config::AppConfig;
use stepweave_core::event::EventBus;
use stepweave_core::store::ChatStore;
use stepweave_providers::ModelRouter;
use stepweave_store::InMemoryChatStore;
use stepweave_tools::{IsolationPolicy, ToolProviderCache};

use crate::auth::Users;
use crate::persistence::{ApprovalClaims, ChatLocks};
use crate::resumable::StreamRegistry;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: AppConfig,
    pub store: Arc<dyn ChatStore>,
    pub models: ModelRouter,
    pub tools: ToolProviderCache,
    pub approvals: Arc<ApprovalGate>,
    pub event_bus: Arc<EventBus>,
    pub streams: StreamRegistry,
    pub locks: ChatLocks,
    pub claims: ApprovalClaims,
    pub users: Users,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ChatStore>,
        models: ModelRouter,
        tools: ToolProviderCache,
    ) -> Self {
        Self {
            streams: StreamRegistry::new(Duration::from_secs(config.resumable.retention_secs)),
            users: Users::new(&config.gateway.users),
            approvals: Arc::new(ApprovalGate::new()),
            event_bus: Arc::new(EventBus::default()),
            locks: ChatLocks::default(),
            claims: ApprovalClaims::default(),
            config,
            store,
            models,
            tools,
        }
    }

    /// Build every subsystem from configuration, with an in-memory store.
    pub fn from_config(config: AppConfig) -> Self {
        let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
        let models = stepweave_providers::build_from_config(&config);
        let artifact_model = models.resolve(Some(config.models.artifact_model.as_str()));
        let factory = stepweave_tools::provider_factory(&config.tools, artifact_model, Arc::clone(&store));
        let tools = ToolProviderCache::new(
            factory,
            IsolationPolicy::from_config(&config.tools),
            config.tools.cache_providers,
        );
        Self::new(config, store, models, tools)
    }
}

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("last-event-id"),
        ])
        .expose_headers([axum::http::HeaderName::from_static(chat::STREAM_ID_HEADER)])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat::post_chat).delete(chat::delete_chat))
        .route("/api/chat/approval", post(chat::respond_approval))
        .route("/api/chat/{id}/stream", get(chat::resume_stream))
        .route("/api/chat/{id}/messages", get(chat::list_messages))
        .route("/api/events", get(events_handler))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = Arc::new(GatewayState::from_config(config));

    let app = build_router(Arc::clone(&state));

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.tools.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /api/events`: SSE stream of domain events.
async fn events_handler(
    State(state): State<SharedState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok(SseEvent::default().event(event.kind()).data(data))
        });

    Sse::new(stream)
}
