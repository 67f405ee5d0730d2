//! Enrollment and renewal routes (no client certificate yet).
//!
//! `POST /v1/enroll` redeems a one-time token; `POST /v1/enroll/renew`
//! authenticates with the agent's refresh token carried in the body.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use nkudo_core::wire::{EnrollRequest, EnrollResponse, RenewRequest, RenewResponse};

use crate::error::ApiError;
use crate::services::enrollment;
use crate::state::AppState;

/// Router for `/v1/enroll`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(enroll))
        .route("/renew", post(renew))
}

async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, ApiError> {
    enrollment::enroll(&state, &req).await.map(Json)
}

async fn renew(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RenewRequest>,
) -> Result<Json<RenewResponse>, ApiError> {
    enrollment::renew(&state, &req).await.map(Json)
}
