//! CRL serving for out-of-band certificate verification.
//!
//! Standard X.509 v2 CRLs signed by the tenant CA, in DER
//! (`application/pkix-crl`) and PEM.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Router for `/v1/pki`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tenants/{tenant_id}/crl", get(crl_der))
        .route("/tenants/{tenant_id}/crl.pem", get(crl_pem))
        .route("/tenants/{tenant_id}/ca.pem", get(ca_pem))
}

async fn crl_der(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ca = state.authority_for(tenant_id).await?;
    let crl = ca.crl().await?;
    Ok((
        [(header::CONTENT_TYPE, "application/pkix-crl")],
        crl.der.clone(),
    ))
}

async fn crl_pem(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ca = state.authority_for(tenant_id).await?;
    let crl = ca.crl().await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        crl.pem.clone(),
    ))
}

async fn ca_pem(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ca = state.authority_for(tenant_id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        ca.ca_pem().to_owned(),
    ))
}
