//! Agent-facing routes, authenticated by forwarded client certificate.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Extension, Json, Router};

use nkudo_core::wire::{
    HeartbeatRequest, HeartbeatResponse, LogBatchRequest, LogIngestResponse,
};

use crate::auth::AgentIdentity;
use crate::error::ApiError;
use crate::services::{heartbeat, logs};
use crate::state::AppState;

/// Router for `/v1/agent` (wrap with the agent auth middleware).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/heartbeat", post(heartbeat_handler))
        .route("/logs", post(logs_handler))
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    heartbeat::handle(&state, &identity, &req).await.map(Json)
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Json(batch): Json<LogBatchRequest>,
) -> Result<Json<LogIngestResponse>, ApiError> {
    logs::ingest(&state, &identity, &batch).await.map(Json)
}
