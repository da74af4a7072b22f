use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use trail_core::events::{LiveSnapshot, ObjectEvent};
use trail_engine::EngineError;

use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9323,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
}

/// `POST /events` takes one event or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventBatch {
    Many(Vec<ObjectEvent>),
    One(ObjectEvent),
}

impl EventBatch {
    fn into_vec(self) -> Vec<ObjectEvent> {
        match self {
            Self::Many(events) => events,
            Self::One(event) => vec![event],
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsAccepted {
    pub accepted: usize,
    pub dropped: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(events_handler))
        .route("/reconcile", post(reconcile_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `token` is cancelled.
pub async fn start(
    config: ServerConfig,
    handler_state: Arc<HandlerState>,
    token: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { handler_state });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "trail server started");

    let server = tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            warn!(error = %e, "server stopped with error");
        }
        info!("trail server stopped");
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// The serving task, for handing to a shutdown coordinator.
    pub fn into_task(self) -> tokio::task::JoinHandle<()> {
        self.server
    }
}

async fn events_handler(State(state): State<AppState>, Json(batch): Json<EventBatch>) -> Json<EventsAccepted> {
    let mut counts = EventsAccepted::default();
    for event in batch.into_vec() {
        if state.handler_state.trail.handle_event(event).await {
            counts.accepted += 1;
        } else {
            counts.dropped += 1;
        }
    }
    Json(counts)
}

async fn reconcile_handler(State(state): State<AppState>, Json(snapshot): Json<LiveSnapshot>) -> impl IntoResponse {
    match state.handler_state.trail.reconcile(&snapshot).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::to_value(&report).unwrap_or_default())),
        Err(e) => {
            let status = match e {
                EngineError::StoreUnavailable(_) | EngineError::ProbeTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(error = %e, "reconcile request failed");
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

/// Raw body so malformed JSON still gets an envelope back.
async fn rpc_handler(State(state): State<AppState>, body: String) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(_) => return Json(RpcResponse::parse_error()),
    };
    let params = request.params.unwrap_or(serde_json::json!({}));
    Json(handlers::dispatch(&state.handler_state, &request.method, &params, request.id))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(&state.handler_state, "health", &serde_json::json!({}), None);

    let status = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");

    let http_status = if status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, Json(resp.result.unwrap_or_default()))
}
