//! Admin bootstrap routes, guarded by the configured bearer token.
//!
//! These are the narrow interface of the (out-of-scope) admin flow:
//! enough to create a tenant with its CA, register a site, mint an
//! enrollment token, submit plans, and revoke an agent. The full CRUD
//! surface belongs to the dashboard backend, not here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_core::pki::RevocationReason;
use nkudo_core::secrets::{self, ENROLL_TOKEN_PREFIX};
use nkudo_core::wire::{ApplyPlanRequest, ApplyPlanResponse};

use crate::error::ApiError;
use crate::models::{AuditEvent, Plan, Site, Tenant};
use crate::services::plans;
use crate::state::AppState;
use crate::repository;

/// Router for `/v1/admin` (wrap with the admin auth middleware).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tenants", post(create_tenant))
        .route("/tenants/{tenant_id}/sites", post(create_site))
        .route(
            "/tenants/{tenant_id}/sites/{site_id}/tokens",
            post(mint_token),
        )
        .route(
            "/tenants/{tenant_id}/sites/{site_id}/plans",
            post(apply_plan).get(list_plans),
        )
        .route(
            "/tenants/{tenant_id}/agents/{agent_id}/revoke",
            post(revoke_agent),
        )
        .route("/tenants/{tenant_id}/audit", get(list_audit))
}

// ── Tenants & sites ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTenantRequest {
    slug: String,
    name: String,
    #[serde(default = "default_retention")]
    retention_days: i32,
}

const fn default_retention() -> i32 {
    30
}

async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<Json<Tenant>, ApiError> {
    if req.slug.trim().is_empty() {
        return Err(ApiError::BadRequest("slug is required".to_owned()));
    }

    let tenant =
        repository::create_tenant(&state.pool, &req.slug, &req.name, req.retention_days)
            .await?;

    // Every tenant gets its own issuing root at creation time.
    state
        .create_authority(tenant.id, &format!("nkudo tenant {} root", req.slug))
        .await?;

    tracing::info!(tenant_id = %tenant.id, slug = %req.slug, "tenant created");
    Ok(Json(tenant))
}

#[derive(Debug, Deserialize)]
struct CreateSiteRequest {
    name: String,
    external_key: String,
}

async fn create_site(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<CreateSiteRequest>,
) -> Result<Json<Site>, ApiError> {
    repository::get_tenant(&state.pool, tenant_id).await?;
    let site =
        repository::create_site(&state.pool, tenant_id, &req.name, &req.external_key)
            .await?;
    Ok(Json(site))
}

// ── Enrollment tokens ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MintTokenRequest {
    /// Token lifetime in minutes (default 15).
    #[serde(default = "default_token_ttl")]
    ttl_minutes: i64,
}

const fn default_token_ttl() -> i64 {
    15
}

#[derive(Debug, Serialize)]
struct MintTokenResponse {
    token_id: Uuid,
    /// The plaintext token — shown once, never stored.
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

async fn mint_token(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, site_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<MintTokenRequest>,
) -> Result<Json<MintTokenResponse>, ApiError> {
    repository::get_site(&state.pool, tenant_id, site_id).await?;

    let token = secrets::generate_secret(ENROLL_TOKEN_PREFIX);
    let expires_at = Utc::now() + Duration::minutes(req.ttl_minutes.clamp(1, 24 * 60));

    let row = repository::insert_enrollment_token(
        &state.pool,
        tenant_id,
        site_id,
        &secrets::hash_secret(&token),
        &secrets::secret_prefix(&token),
        expires_at,
    )
    .await?;

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;
    repository::write_audit(
        &mut tx,
        tenant_id,
        "admin",
        "token.minted",
        &format!("enrollment-token/{}", row.id),
        &serde_json::json!({ "site_id": site_id, "expires_at": expires_at }),
    )
    .await?;
    tx.commit().await.map_err(ApiError::from)?;

    Ok(Json(MintTokenResponse {
        token_id: row.id,
        token,
        expires_at,
    }))
}

// ── Plans ────────────────────────────────────────────────────────────

async fn apply_plan(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, site_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ApplyPlanRequest>,
) -> Result<Json<ApplyPlanResponse>, ApiError> {
    plans::apply_plan(&state, tenant_id, site_id, &req)
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

const fn default_limit() -> i64 {
    50
}

async fn list_plans(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, site_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Plan>>, ApiError> {
    repository::get_site(&state.pool, tenant_id, site_id).await?;
    repository::list_site_plans(&state.pool, tenant_id, site_id, query.limit.clamp(1, 500))
        .await
        .map(Json)
}

// ── Agent revocation ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RevokeAgentRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct RevokeAgentResponse {
    agent_id: Uuid,
    cert_serial: Option<String>,
    crl_number: Option<u64>,
}

async fn revoke_agent(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, agent_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<RevokeAgentRequest>,
) -> Result<Json<RevokeAgentResponse>, ApiError> {
    let reason: RevocationReason = req
        .reason
        .as_deref()
        .unwrap_or("privilege_withdrawn")
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;
    let agent = repository::revoke_agent(&mut tx, tenant_id, agent_id).await?;

    if let Some(serial) = &agent.cert_serial {
        repository::revoke_cert(&mut tx, tenant_id, serial, &reason.to_string()).await?;
    }

    repository::write_audit(
        &mut tx,
        tenant_id,
        "admin",
        "agent.revoked",
        &format!("agent/{agent_id}"),
        &serde_json::json!({ "reason": reason.to_string() }),
    )
    .await?;
    tx.commit().await.map_err(ApiError::from)?;

    // Publish the new CRL after the durable record is committed.
    let crl_number = match &agent.cert_serial {
        Some(serial) => {
            let ca = state.authority_for(tenant_id).await?;
            Some(ca.revoke(serial, reason).await?.crl_number)
        }
        None => None,
    };

    Ok(Json(RevokeAgentResponse {
        agent_id,
        cert_serial: agent.cert_serial,
        crl_number,
    }))
}

// ── Audit ────────────────────────────────────────────────────────────

async fn list_audit(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    repository::list_audit(
        &state.pool,
        tenant_id,
        query.limit.clamp(1, 500),
        query.offset.max(0),
    )
    .await
    .map(Json)
}
