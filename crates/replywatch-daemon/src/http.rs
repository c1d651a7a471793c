//! HTTP ingress surface.
//!
//! | Method | Path | Effect |
//! |--------|------|--------|
//! | POST | `/conversations/{id}/agent-message` | start/restart tracking |
//! | POST | `/conversations/{id}/customer-response` | cancel tracking |
//! | GET | `/health` | liveness + leadership + waiting count |
//! | GET | `/status` | replica status |
//! | GET | `/metrics` | Prometheus text format |
//!
//! Bodies are parsed by hand from raw bytes so malformed JSON is always a
//! 400 regardless of how it is malformed. Conversation ids are opaque:
//! any non-empty path segment is accepted. Store errors surface as 500;
//! a failing health probe answers 503.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use replywatch_core::clock::Clock;
use replywatch_core::event::{AgentMessage, CustomerResponse};
use replywatch_core::store::StoreError;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::index::TimeoutIndex;
use crate::leader::LeaderElector;
use crate::metrics::SharedMetrics;

/// Shared state for all ingress handlers.
pub struct AppState {
    /// Timeout index backing the ingress operations.
    pub index: TimeoutIndex,
    /// Leader elector, consulted for verified leadership.
    pub leader: Arc<LeaderElector>,
    /// Metrics registry for the `/metrics` endpoint.
    pub metrics: SharedMetrics,
    /// Time source for defaulted timestamps.
    pub clock: Arc<dyn Clock>,
    /// This replica's identity, reported on `/status`.
    pub pod_id: String,
}

/// Builds the ingress router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conversations/{id}/agent-message", post(agent_message))
        .route(
            "/conversations/{id}/customer-response",
            post(customer_response),
        )
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Errors surfaced to HTTP clients.
enum ApiError {
    /// Malformed request: missing id or unparseable body.
    BadRequest(&'static str),
    /// Store failure while handling the request.
    Internal,
    /// Health probe could not reach the store.
    Unavailable,
}

impl From<StoreError> for ApiError {
    fn from(_: StoreError) -> Self {
        Self::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            Self::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            },
            Self::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "Health check failed").into_response()
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentMessageRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    message_id: String,
    /// Send time in ms since epoch; defaults to now.
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CustomerResponseRequest {
    #[serde(default)]
    customer_id: String,
    #[serde(default)]
    message_id: String,
    /// Response time in ms since epoch; defaults to now.
    timestamp: Option<i64>,
}

fn require_id(id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing conversation ID"));
    }
    Ok(())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("Invalid request body"))
}

async fn agent_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_id(&id)?;
    let request: AgentMessageRequest = parse_body(&body)?;
    let timestamp_ms = request.timestamp.unwrap_or_else(|| state.clock.now_ms());

    let message = AgentMessage {
        conversation_id: id.clone(),
        agent_id: request.agent_id,
        message_id: request.message_id,
        timestamp_ms,
    };
    state.index.track_agent_message(&message).await?;

    Ok(Json(json!({
        "success": true,
        "conversation_id": id,
        "tracked_at": timestamp_ms,
    }))
    .into_response())
}

async fn customer_response(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_id(&id)?;
    let request: CustomerResponseRequest = parse_body(&body)?;
    let timestamp_ms = request.timestamp.unwrap_or_else(|| state.clock.now_ms());

    let response = CustomerResponse {
        conversation_id: id.clone(),
        customer_id: request.customer_id,
        message_id: request.message_id,
        timestamp_ms,
    };
    state.index.clear_on_customer_response(&response).await?;

    Ok(Json(json!({
        "success": true,
        "conversation_id": id,
        "cleared_at": timestamp_ms,
    }))
    .into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let waiting = state
        .index
        .waiting_count()
        .await
        .map_err(|_| ApiError::Unavailable)?;

    Ok(Json(json!({
        "status": "healthy",
        "is_leader": state.leader.is_leader_verified().await,
        "waiting_conversations": waiting,
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response())
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let waiting = state.index.waiting_count().await?;

    Ok(Json(json!({
        "pod_id": state.pod_id,
        "is_leader": state.leader.is_leader_verified().await,
        "waiting_conversations": waiting,
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        },
    }
}
