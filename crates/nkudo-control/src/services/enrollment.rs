//! Enrollment and certificate renewal.
//!
//! Enrollment is a single atomic unit against storage: the one-time
//! token is redeemed with a conditional decrement, the host is created
//! or reused, the agent is created, the CSR is signed by the tenant CA,
//! and only the refresh token's hash is persisted. Concurrent
//! redemptions of the same token see exactly one winner.

use chrono::Duration;

use nkudo_core::secrets::{self, REFRESH_TOKEN_PREFIX};
use nkudo_core::wire::{EnrollRequest, EnrollResponse, RenewRequest, RenewResponse};

use crate::error::ApiError;
use crate::models::AgentLifecycle;
use crate::repository;
use crate::state::AppState;

/// Redeem a one-time token and bootstrap an agent identity.
///
/// # Errors
///
/// `unauthorized` for an unknown/expired/spent token, `conflict` when
/// the host already has a live agent, `bad_input` for a rejected CSR,
/// `unavailable` when the CA or storage cannot be reached.
pub async fn enroll(
    state: &AppState,
    req: &EnrollRequest,
) -> Result<EnrollResponse, ApiError> {
    if req.hostname.trim().is_empty() {
        return Err(ApiError::BadRequest("hostname is required".to_owned()));
    }
    if req.host_fingerprint.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "host_fingerprint is required".to_owned(),
        ));
    }

    let token_hash = secrets::hash_secret(&req.token);

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;

    let token = repository::redeem_token(&mut tx, &token_hash)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("token_invalid".to_owned()))?;

    let host = repository::upsert_host(
        &mut tx,
        token.tenant_id,
        token.site_id,
        &req.hostname,
        &req.host_fingerprint,
    )
    .await?;

    if repository::host_has_live_agent(&mut tx, host.id).await? {
        return Err(ApiError::Conflict(
            "an agent is already enrolled for this host".to_owned(),
        ));
    }

    let refresh_token = secrets::generate_secret(REFRESH_TOKEN_PREFIX);
    let agent = repository::insert_agent(
        &mut tx,
        token.tenant_id,
        token.site_id,
        host.id,
        &req.agent_version,
        &secrets::hash_secret(&refresh_token),
    )
    .await?;

    repository::stamp_token_consumer(&mut tx, token.id, agent.id).await?;

    // Sign the CSR. CA state lives outside this transaction; a signing
    // failure aborts the whole unit, so nothing partial is visible.
    let ca = state.authority_for(token.tenant_id).await?;
    let issued = ca.issue_from_csr(
        &req.csr_pem,
        agent.id,
        token.site_id,
        Duration::hours(state.config.cert_ttl_hours),
    )?;

    repository::insert_agent_cert(
        &mut tx,
        &issued.serial,
        token.tenant_id,
        agent.id,
        issued.not_before,
        issued.not_after,
    )
    .await?;
    repository::set_agent_cert_serial(&mut tx, agent.id, &issued.serial).await?;

    repository::write_audit(
        &mut tx,
        token.tenant_id,
        &format!("agent/{}", agent.id),
        "agent.enrolled",
        &format!("host/{}", host.id),
        &serde_json::json!({
            "hostname": req.hostname,
            "agent_version": req.agent_version,
            "token_prefix": token.token_prefix,
            "cert_serial": issued.serial,
            "labels": req.labels,
        }),
    )
    .await?;

    tx.commit().await.map_err(ApiError::from)?;

    tracing::info!(
        tenant_id = %token.tenant_id,
        site_id = %token.site_id,
        agent_id = %agent.id,
        serial = %issued.serial,
        "agent enrolled"
    );

    Ok(EnrollResponse {
        tenant_id: token.tenant_id,
        site_id: token.site_id,
        host_id: host.id,
        agent_id: agent.id,
        client_cert_pem: issued.certificate_pem,
        ca_cert_pem: ca.ca_pem().to_owned(),
        refresh_token,
        heartbeat_interval_s: state.config.heartbeat_interval_s,
    })
}

/// Renew an agent's client certificate with its refresh token.
///
/// Rotates the refresh token on every successful renewal.
///
/// # Errors
///
/// `unauthorized` for a bad refresh token, `forbidden` for a revoked
/// agent, `bad_input` for a rejected CSR.
pub async fn renew(state: &AppState, req: &RenewRequest) -> Result<RenewResponse, ApiError> {
    let agent = repository::get_agent(&state.pool, req.agent_id).await?;

    if agent.lifecycle() == AgentLifecycle::Revoked {
        return Err(ApiError::Forbidden("agent is revoked".to_owned()));
    }

    if !secrets::hashes_equal(
        &agent.refresh_token_hash,
        &secrets::hash_secret(&req.refresh_token),
    ) {
        return Err(ApiError::Unauthorized("invalid refresh token".to_owned()));
    }

    let ca = state.authority_for(agent.tenant_id).await?;
    let issued = ca.issue_from_csr(
        &req.csr_pem,
        agent.id,
        agent.site_id,
        Duration::hours(state.config.cert_ttl_hours),
    )?;

    let next_refresh = secrets::generate_secret(REFRESH_TOKEN_PREFIX);

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;
    repository::insert_agent_cert(
        &mut tx,
        &issued.serial,
        agent.tenant_id,
        agent.id,
        issued.not_before,
        issued.not_after,
    )
    .await?;
    repository::set_agent_cert_serial(&mut tx, agent.id, &issued.serial).await?;
    repository::set_refresh_token_hash(
        &mut tx,
        agent.id,
        &secrets::hash_secret(&next_refresh),
    )
    .await?;
    repository::write_audit(
        &mut tx,
        agent.tenant_id,
        &format!("agent/{}", agent.id),
        "agent.cert_renewed",
        &format!("cert/{}", issued.serial),
        &serde_json::json!({ "not_after": issued.not_after }),
    )
    .await?;
    tx.commit().await.map_err(ApiError::from)?;

    tracing::info!(agent_id = %agent.id, serial = %issued.serial, "certificate renewed");

    Ok(RenewResponse {
        client_cert_pem: issued.certificate_pem,
        ca_cert_pem: ca.ca_pem().to_owned(),
        refresh_token: Some(next_refresh),
    })
}
