//! Control-plane repository — `PostgreSQL` queries for all entities.
//!
//! Every function takes a `&PgPool` (standalone reads/writes) or a
//! `&mut PgConnection` (transaction participants, called with
//! `&mut *tx`) and returns `Result<T, ApiError>`. Queries use
//! parameterized statements (sqlx) — no SQL injection risk. Mutations
//! that must be atomic (token redemption, plan leasing, sequence
//! high-water advancement) are single conditional statements whose
//! row counts decide the winner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use nkudo_core::wire::HostFacts;

use crate::error::ApiError;
use crate::models::{
    Agent, AgentCert, AuditEvent, CaRoot, EnrollmentToken, Execution, Host, MicroVm,
    Plan, Site, Tenant,
};

// ── Tenants ──────────────────────────────────────────────────────────

/// Create a new tenant.
///
/// # Errors
///
/// Returns `ApiError::Conflict` if the slug is already taken.
pub async fn create_tenant(
    pool: &PgPool,
    slug: &str,
    name: &str,
    retention_days: i32,
) -> Result<Tenant, ApiError> {
    let tenant = sqlx::query_as::<_, Tenant>(
        r"INSERT INTO tenants (id, slug, name, retention_days)
          VALUES ($1, $2, $3, $4)
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(slug)
    .bind(name)
    .bind(retention_days)
    .fetch_one(pool)
    .await?;

    Ok(tenant)
}

/// Get a tenant by ID.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if the tenant does not exist.
pub async fn get_tenant(pool: &PgPool, tenant_id: Uuid) -> Result<Tenant, ApiError> {
    sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("tenant not found".to_owned()))
}

// ── Sites ────────────────────────────────────────────────────────────

/// Create a new site under a tenant.
///
/// # Errors
///
/// Returns `ApiError::Conflict` on duplicate external key.
pub async fn create_site(
    pool: &PgPool,
    tenant_id: Uuid,
    name: &str,
    external_key: &str,
) -> Result<Site, ApiError> {
    let site = sqlx::query_as::<_, Site>(
        r"INSERT INTO sites (id, tenant_id, name, external_key, connectivity_state)
          VALUES ($1, $2, $3, $4, 'unknown')
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(name)
    .bind(external_key)
    .fetch_one(pool)
    .await?;

    Ok(site)
}

/// Get a site by ID (with tenant ownership check).
///
/// # Errors
///
/// Returns `ApiError::NotFound` if absent or owned by another tenant.
pub async fn get_site(
    pool: &PgPool,
    tenant_id: Uuid,
    site_id: Uuid,
) -> Result<Site, ApiError> {
    sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE id = $1 AND tenant_id = $2")
        .bind(site_id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("site not found".to_owned()))
}

/// Stamp a site's heartbeat and mark it online.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn touch_site(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query(
        r"UPDATE sites SET last_heartbeat_at = now(), connectivity_state = 'online'
          WHERE id = $1 AND tenant_id = $2",
    )
    .bind(site_id)
    .bind(tenant_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Mark sites offline when silent past the threshold. Returns the
/// number of sites flipped this scan.
///
/// # Errors
///
/// Returns `ApiError::Unavailable` if storage is unreachable.
pub async fn mark_silent_sites_offline(
    pool: &PgPool,
    offline_after: Duration,
) -> Result<u64, ApiError> {
    let result = sqlx::query(
        r"UPDATE sites SET connectivity_state = 'offline'
          WHERE connectivity_state <> 'offline'
            AND last_heartbeat_at IS NOT NULL
            AND last_heartbeat_at < now() - make_interval(secs => $1)",
    )
    .bind(offline_after.as_secs_f64())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Mark agents offline when silent past the threshold.
///
/// # Errors
///
/// Returns `ApiError::Unavailable` if storage is unreachable.
pub async fn mark_silent_agents_offline(
    pool: &PgPool,
    offline_after: Duration,
) -> Result<u64, ApiError> {
    let result = sqlx::query(
        r"UPDATE agents SET lifecycle = 'offline'
          WHERE lifecycle IN ('online', 'degraded')
            AND last_heartbeat_at IS NOT NULL
            AND last_heartbeat_at < now() - make_interval(secs => $1)",
    )
    .bind(offline_after.as_secs_f64())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ── Hosts ────────────────────────────────────────────────────────────

/// Create or reuse the host row keyed by `(tenant, site, hostname, fingerprint)`.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn upsert_host(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
    hostname: &str,
    fingerprint: &str,
) -> Result<Host, ApiError> {
    let host = sqlx::query_as::<_, Host>(
        r"INSERT INTO hosts (id, tenant_id, site_id, hostname, fingerprint)
          VALUES ($1, $2, $3, $4, $5)
          ON CONFLICT (tenant_id, site_id, hostname, fingerprint) DO UPDATE SET
            hostname = EXCLUDED.hostname
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(site_id)
    .bind(hostname)
    .bind(fingerprint)
    .fetch_one(conn)
    .await?;

    Ok(host)
}

/// Refresh host capacity from reported facts.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn update_host_facts(
    conn: &mut PgConnection,
    host_id: Uuid,
    facts: &HostFacts,
) -> Result<(), ApiError> {
    sqlx::query(
        r"UPDATE hosts SET
            cpu_cores = $2, memory_bytes = $3, storage_bytes = $4,
            kvm_available = $5, chv_available = $6, last_facts_at = now()
          WHERE id = $1",
    )
    .bind(host_id)
    .bind(i32::try_from(facts.cpu_cores).unwrap_or(i32::MAX))
    .bind(i64::try_from(facts.memory_bytes).unwrap_or(i64::MAX))
    .bind(i64::try_from(facts.storage_bytes).unwrap_or(i64::MAX))
    .bind(facts.kvm_available)
    .bind(facts.chv_available)
    .execute(conn)
    .await?;

    Ok(())
}

// ── Agents ───────────────────────────────────────────────────────────

/// Insert a freshly enrolled agent.
///
/// # Errors
///
/// Returns `ApiError::Conflict` if the host already has a live agent.
#[allow(clippy::too_many_arguments)]
pub async fn insert_agent(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
    host_id: Uuid,
    agent_version: &str,
    refresh_token_hash: &str,
) -> Result<Agent, ApiError> {
    let agent = sqlx::query_as::<_, Agent>(
        r"INSERT INTO agents
            (id, tenant_id, site_id, host_id, agent_version, os, arch,
             kernel_version, refresh_token_hash, lifecycle, heartbeat_seq_high_water)
          VALUES ($1, $2, $3, $4, $5, '', '', '', $6, 'pending', 0)
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(site_id)
    .bind(host_id)
    .bind(agent_version)
    .bind(refresh_token_hash)
    .fetch_one(conn)
    .await?;

    Ok(agent)
}

/// Whether a non-revoked agent already exists for this host.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn host_has_live_agent(
    conn: &mut PgConnection,
    host_id: Uuid,
) -> Result<bool, ApiError> {
    let exists: Option<bool> = sqlx::query_scalar(
        "SELECT true FROM agents WHERE host_id = $1 AND lifecycle <> 'revoked' LIMIT 1",
    )
    .bind(host_id)
    .fetch_optional(conn)
    .await?;

    Ok(exists.is_some())
}

/// Get an agent by ID.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if the agent does not exist.
pub async fn get_agent(pool: &PgPool, agent_id: Uuid) -> Result<Agent, ApiError> {
    sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(agent_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("agent not found".to_owned()))
}

/// Advance the heartbeat high-water mark. Returns `false` when the
/// submitted sequence is a replay (not strictly greater).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn try_advance_heartbeat_seq(
    conn: &mut PgConnection,
    agent_id: Uuid,
    heartbeat_seq: i64,
) -> Result<bool, ApiError> {
    let result = sqlx::query(
        r"UPDATE agents SET
            heartbeat_seq_high_water = $2, last_heartbeat_at = now(),
            lifecycle = CASE WHEN lifecycle IN ('pending','offline','degraded')
                             THEN 'online' ELSE lifecycle END
          WHERE id = $1 AND heartbeat_seq_high_water < $2 AND lifecycle <> 'revoked'",
    )
    .bind(agent_id)
    .bind(heartbeat_seq)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Refresh an agent's platform facts from a heartbeat.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn update_agent_facts(
    conn: &mut PgConnection,
    agent_id: Uuid,
    facts: &HostFacts,
) -> Result<(), ApiError> {
    sqlx::query(
        r"UPDATE agents SET agent_version = $2, os = $3, arch = $4, kernel_version = $5
          WHERE id = $1",
    )
    .bind(agent_id)
    .bind(&facts.agent_version)
    .bind(&facts.os)
    .bind(&facts.arch)
    .bind(&facts.kernel_version)
    .execute(conn)
    .await?;

    Ok(())
}

/// Rotate the stored refresh-token hash.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn set_refresh_token_hash(
    conn: &mut PgConnection,
    agent_id: Uuid,
    refresh_token_hash: &str,
) -> Result<(), ApiError> {
    sqlx::query("UPDATE agents SET refresh_token_hash = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(refresh_token_hash)
        .execute(conn)
        .await?;

    Ok(())
}

/// Record the agent's current certificate serial.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn set_agent_cert_serial(
    conn: &mut PgConnection,
    agent_id: Uuid,
    serial: &str,
) -> Result<(), ApiError> {
    sqlx::query("UPDATE agents SET cert_serial = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(serial)
        .execute(conn)
        .await?;

    Ok(())
}

/// Flip an agent to offline after its final `shutdown` heartbeat.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn mark_agent_offline(
    conn: &mut PgConnection,
    agent_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE agents SET lifecycle = 'offline' WHERE id = $1 AND lifecycle <> 'revoked'",
    )
    .bind(agent_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Mark an agent revoked. Returns the updated row.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if absent or owned by another tenant.
pub async fn revoke_agent(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    agent_id: Uuid,
) -> Result<Agent, ApiError> {
    sqlx::query_as::<_, Agent>(
        r"UPDATE agents SET lifecycle = 'revoked'
          WHERE id = $1 AND tenant_id = $2
          RETURNING *",
    )
    .bind(agent_id)
    .bind(tenant_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| ApiError::NotFound("agent not found".to_owned()))
}

// ── Enrollment tokens ────────────────────────────────────────────────

/// Mint a new single-use enrollment token row (hash only).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn insert_enrollment_token(
    pool: &PgPool,
    tenant_id: Uuid,
    site_id: Uuid,
    token_hash: &str,
    token_prefix: &str,
    expires_at: DateTime<Utc>,
) -> Result<EnrollmentToken, ApiError> {
    let token = sqlx::query_as::<_, EnrollmentToken>(
        r"INSERT INTO enrollment_tokens
            (id, tenant_id, site_id, token_hash, token_prefix, expires_at, uses_remaining)
          VALUES ($1, $2, $3, $4, $5, $6, 1)
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(site_id)
    .bind(token_hash)
    .bind(token_prefix)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;

    Ok(token)
}

/// Atomically redeem a token by hash: decrement-and-return in one
/// statement so concurrent redemptions see exactly one winner.
///
/// Returns `None` when the token is unknown, expired, or already used.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn redeem_token(
    conn: &mut PgConnection,
    token_hash: &str,
) -> Result<Option<EnrollmentToken>, ApiError> {
    let token = sqlx::query_as::<_, EnrollmentToken>(
        r"UPDATE enrollment_tokens SET uses_remaining = uses_remaining - 1
          WHERE token_hash = $1 AND uses_remaining > 0 AND expires_at > now()
          RETURNING *",
    )
    .bind(token_hash)
    .fetch_optional(conn)
    .await?;

    Ok(token)
}

/// Stamp the agent that consumed a token (audit trail).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn stamp_token_consumer(
    conn: &mut PgConnection,
    token_id: Uuid,
    agent_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query("UPDATE enrollment_tokens SET consumed_by_agent_id = $2 WHERE id = $1")
        .bind(token_id)
        .bind(agent_id)
        .execute(conn)
        .await?;

    Ok(())
}

// ── CA roots & certificates ──────────────────────────────────────────

/// Persist a tenant's CA root (key sealed by the caller).
///
/// # Errors
///
/// Returns `ApiError::Conflict` if the tenant already has a root.
pub async fn insert_ca_root(
    pool: &PgPool,
    tenant_id: Uuid,
    certificate_pem: &str,
    private_key_enc: &[u8],
    key_nonce: &[u8],
    common_name: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        r"INSERT INTO ca_roots (tenant_id, certificate_pem, private_key_enc, key_nonce, common_name)
          VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(tenant_id)
    .bind(certificate_pem)
    .bind(private_key_enc)
    .bind(key_nonce)
    .bind(common_name)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a tenant's CA root, if one exists.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn get_ca_root(pool: &PgPool, tenant_id: Uuid) -> Result<Option<CaRoot>, ApiError> {
    let root = sqlx::query_as::<_, CaRoot>("SELECT * FROM ca_roots WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;

    Ok(root)
}

/// Record an issued certificate.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn insert_agent_cert(
    conn: &mut PgConnection,
    serial: &str,
    tenant_id: Uuid,
    agent_id: Uuid,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<(), ApiError> {
    sqlx::query(
        r"INSERT INTO agent_certs (serial, tenant_id, agent_id, not_before, not_after)
          VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(serial)
    .bind(tenant_id)
    .bind(agent_id)
    .bind(not_before)
    .bind(not_after)
    .execute(conn)
    .await?;

    Ok(())
}

/// Durably revoke a certificate, keeping the first reason on repeats.
/// Returns `true` when this call performed the revocation.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn revoke_cert(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    serial: &str,
    reason: &str,
) -> Result<bool, ApiError> {
    let result = sqlx::query(
        r"UPDATE agent_certs SET revoked_at = now(), revocation_reason = $3
          WHERE serial = $1 AND tenant_id = $2 AND revoked_at IS NULL",
    )
    .bind(serial)
    .bind(tenant_id)
    .bind(reason)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// All revoked certificates of a tenant (CRL rebuild at boot).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn list_revocations(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Vec<AgentCert>, ApiError> {
    let certs = sqlx::query_as::<_, AgentCert>(
        "SELECT * FROM agent_certs WHERE tenant_id = $1 AND revoked_at IS NOT NULL",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    Ok(certs)
}

// ── MicroVMs ─────────────────────────────────────────────────────────

/// Get a microVM with tenant ownership check.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn get_vm(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    vm_id: Uuid,
) -> Result<Option<MicroVm>, ApiError> {
    let vm = sqlx::query_as::<_, MicroVm>(
        "SELECT * FROM microvms WHERE id = $1 AND tenant_id = $2",
    )
    .bind(vm_id)
    .bind(tenant_id)
    .fetch_optional(conn)
    .await?;

    Ok(vm)
}

/// Upsert a microVM's reported state, keyed `(tenant_id, vm_id)`.
///
/// The caller has already run the transition rules and decided the
/// stored state and error marker.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_vm_state(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
    host_id: Uuid,
    vm_id: Uuid,
    name: &str,
    state: &str,
    vcpu_count: i32,
    memory_mib: i64,
    last_error: Option<&str>,
) -> Result<(), ApiError> {
    sqlx::query(
        r"INSERT INTO microvms
            (id, tenant_id, site_id, host_id, name, state, vcpu_count, memory_mib,
             last_error, last_transition_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
          ON CONFLICT (id) DO UPDATE SET
            state = EXCLUDED.state,
            name = EXCLUDED.name,
            host_id = EXCLUDED.host_id,
            vcpu_count = EXCLUDED.vcpu_count,
            memory_mib = EXCLUDED.memory_mib,
            last_error = EXCLUDED.last_error,
            last_transition_at = CASE
              WHEN microvms.state <> EXCLUDED.state THEN now()
              ELSE microvms.last_transition_at
            END",
    )
    .bind(vm_id)
    .bind(tenant_id)
    .bind(site_id)
    .bind(host_id)
    .bind(name)
    .bind(state)
    .bind(vcpu_count)
    .bind(memory_mib)
    .bind(last_error)
    .execute(conn)
    .await?;

    Ok(())
}

/// Remove a microVM row once its deletion completes.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn delete_vm(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    vm_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query("DELETE FROM microvms WHERE id = $1 AND tenant_id = $2")
        .bind(vm_id)
        .bind(tenant_id)
        .execute(conn)
        .await?;

    Ok(())
}

// ── Plans ────────────────────────────────────────────────────────────

/// Serialize concurrent submissions of the same idempotency key within
/// this transaction (advisory lock keyed on tenant + key).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn lock_idempotency_key(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    idempotency_key: &str,
) -> Result<(), ApiError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || ':' || $2, 0))")
        .bind(tenant_id.to_string())
        .bind(idempotency_key)
        .execute(conn)
        .await?;

    Ok(())
}

/// Find a plan by idempotency key inside the dedup window.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn find_plan_by_idempotency(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    idempotency_key: &str,
    window: Duration,
) -> Result<Option<Plan>, ApiError> {
    let plan = sqlx::query_as::<_, Plan>(
        r"SELECT * FROM plans
          WHERE tenant_id = $1 AND idempotency_key = $2 AND created_at > now() - make_interval(secs => $3)
          ORDER BY created_at DESC
          LIMIT 1",
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .bind(window.as_secs_f64())
    .fetch_optional(conn)
    .await?;

    Ok(plan)
}

/// Next strictly-increasing plan version for a site.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn next_plan_version(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
) -> Result<i64, ApiError> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(plan_version) FROM plans WHERE tenant_id = $1 AND site_id = $2",
    )
    .bind(tenant_id)
    .bind(site_id)
    .fetch_one(conn)
    .await?;

    Ok(max.unwrap_or(0).saturating_add(1))
}

/// Cancel still-pending, unleased plans superseded by a new version.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn cancel_superseded_plans(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
) -> Result<u64, ApiError> {
    let result = sqlx::query(
        r"UPDATE plans SET status = 'cancelled'
          WHERE tenant_id = $1 AND site_id = $2 AND status = 'pending'
            AND (leased_by IS NULL OR lease_expires_at < now())",
    )
    .bind(tenant_id)
    .bind(site_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Insert a new pending plan.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn insert_plan(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
    plan_version: i64,
    idempotency_key: &str,
    ops_hash: &str,
) -> Result<Plan, ApiError> {
    let plan = sqlx::query_as::<_, Plan>(
        r"INSERT INTO plans (id, tenant_id, site_id, plan_version, idempotency_key, ops_hash, status)
          VALUES ($1, $2, $3, $4, $5, $6, 'pending')
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(site_id)
    .bind(plan_version)
    .bind(idempotency_key)
    .bind(ops_hash)
    .fetch_one(conn)
    .await?;

    Ok(plan)
}

/// Get a plan by ID with tenant check.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if absent.
pub async fn get_plan(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_id: Uuid,
) -> Result<Plan, ApiError> {
    sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1 AND tenant_id = $2")
        .bind(plan_id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("plan not found".to_owned()))
}

/// Plans of a site, newest first (admin listing).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn list_site_plans(
    pool: &PgPool,
    tenant_id: Uuid,
    site_id: Uuid,
    limit: i64,
) -> Result<Vec<Plan>, ApiError> {
    let plans = sqlx::query_as::<_, Plan>(
        r"SELECT * FROM plans WHERE tenant_id = $1 AND site_id = $2
          ORDER BY plan_version DESC LIMIT $3",
    )
    .bind(tenant_id)
    .bind(site_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(plans)
}

/// Leasable plans for a site, oldest version first, rows locked.
///
/// `FOR UPDATE SKIP LOCKED` keeps two agents of the same site from
/// blocking on each other — the loser simply sees fewer candidates.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn leasable_plans(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    site_id: Uuid,
    limit: i64,
) -> Result<Vec<Plan>, ApiError> {
    let plans = sqlx::query_as::<_, Plan>(
        r"SELECT * FROM plans
          WHERE tenant_id = $1 AND site_id = $2
            AND status IN ('pending', 'in_progress')
            AND (leased_by IS NULL OR lease_expires_at < now())
          ORDER BY plan_version ASC, created_at ASC
          LIMIT $3
          FOR UPDATE SKIP LOCKED",
    )
    .bind(tenant_id)
    .bind(site_id)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(plans)
}

/// Conditionally take the lease on one plan. Returns `false` when a
/// competing agent won the row in between.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn lease_plan(
    conn: &mut PgConnection,
    plan_id: Uuid,
    agent_id: Uuid,
    lease_ttl: Duration,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let expires: Option<DateTime<Utc>> = sqlx::query_scalar(
        r"UPDATE plans SET
            leased_by = $2, leased_at = now(), lease_expires_at = now() + make_interval(secs => $3),
            status = 'in_progress'
          WHERE id = $1
            AND status IN ('pending', 'in_progress')
            AND (leased_by IS NULL OR lease_expires_at < now())
          RETURNING lease_expires_at",
    )
    .bind(plan_id)
    .bind(agent_id)
    .bind(lease_ttl.as_secs_f64())
    .fetch_optional(conn)
    .await?;

    Ok(expires)
}

/// Latch a terminal plan status (never overwrites a terminal one).
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn latch_plan_status(
    conn: &mut PgConnection,
    plan_id: Uuid,
    status: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        r"UPDATE plans SET status = $2
          WHERE id = $1 AND status NOT IN ('succeeded', 'failed', 'cancelled')",
    )
    .bind(plan_id)
    .bind(status)
    .execute(conn)
    .await?;

    Ok(())
}

// ── Executions ───────────────────────────────────────────────────────

/// Insert one pending execution row per plan operation.
///
/// # Errors
///
/// Returns `ApiError::Conflict` on duplicate `(plan_id, operation_id)`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_execution(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    plan_id: Uuid,
    operation_id: &str,
    op_type: &str,
    vm_id: Option<Uuid>,
    params: Option<&serde_json::Value>,
) -> Result<Execution, ApiError> {
    let execution = sqlx::query_as::<_, Execution>(
        r"INSERT INTO executions
            (id, tenant_id, plan_id, operation_id, op_type, vm_id, params, state, log_seq_high_water)
          VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0)
          RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(plan_id)
    .bind(operation_id)
    .bind(op_type)
    .bind(vm_id)
    .bind(params)
    .fetch_one(conn)
    .await?;

    Ok(execution)
}

/// All executions of a plan in insertion order.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn executions_for_plan(
    conn: &mut PgConnection,
    plan_id: Uuid,
) -> Result<Vec<Execution>, ApiError> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE plan_id = $1 ORDER BY created_at, operation_id",
    )
    .bind(plan_id)
    .fetch_all(conn)
    .await?;

    Ok(executions)
}

/// Get an execution row by ID.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn get_execution(
    conn: &mut PgConnection,
    execution_id: Uuid,
) -> Result<Option<Execution>, ApiError> {
    let execution =
        sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(conn)
            .await?;

    Ok(execution)
}

/// Latch an execution's state: terminal states never regress, and a
/// `running` report never overwrites a terminal state. Returns the
/// updated row when the latch advanced.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn latch_execution_state(
    conn: &mut PgConnection,
    execution_id: Uuid,
    state: &str,
    error_code: Option<&str>,
    error_message: Option<&str>,
) -> Result<Option<Execution>, ApiError> {
    let execution = sqlx::query_as::<_, Execution>(
        r"UPDATE executions SET
            state = $2, error_code = $3, error_message = $4, updated_at = now()
          WHERE id = $1 AND state NOT IN ('succeeded', 'failed', 'skipped')
          RETURNING *",
    )
    .bind(execution_id)
    .bind(state)
    .bind(error_code)
    .bind(error_message)
    .fetch_optional(conn)
    .await?;

    Ok(execution)
}

/// Current states of every execution in a plan.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn plan_execution_states(
    conn: &mut PgConnection,
    plan_id: Uuid,
) -> Result<Vec<String>, ApiError> {
    let states: Vec<String> =
        sqlx::query_scalar("SELECT state FROM executions WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_all(conn)
            .await?;

    Ok(states)
}

// ── Log frames ───────────────────────────────────────────────────────

/// Advance an execution's log high-water mark. Returns `false` for
/// duplicate or out-of-order sequence numbers (the frame is dropped).
///
/// Ownership is enforced here: a frame for another tenant's execution
/// never matches the `tenant_id` predicate.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn try_advance_log_seq(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    execution_id: Uuid,
    seq: i64,
) -> Result<bool, ApiError> {
    let result = sqlx::query(
        r"UPDATE executions SET log_seq_high_water = $3
          WHERE id = $1 AND tenant_id = $2 AND log_seq_high_water < $3",
    )
    .bind(execution_id)
    .bind(tenant_id)
    .bind(seq)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Bulk-insert accepted log frames.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn insert_log_frames(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    frames: &[AcceptedFrame],
) -> Result<(), ApiError> {
    for frame in frames {
        sqlx::query(
            r"INSERT INTO log_frames
                (tenant_id, execution_id, operation_id, vm_id, seq, severity, message, emitted_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              ON CONFLICT (execution_id, seq) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(frame.execution_id)
        .bind(frame.operation_id.as_deref())
        .bind(frame.vm_id)
        .bind(frame.seq)
        .bind(&frame.severity)
        .bind(&frame.message)
        .bind(frame.emitted_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// A frame that passed ordering and ownership checks.
#[derive(Debug, Clone)]
pub struct AcceptedFrame {
    pub execution_id: Uuid,
    pub operation_id: Option<String>,
    pub vm_id: Option<Uuid>,
    pub seq: i64,
    pub severity: String,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

// ── Audit ────────────────────────────────────────────────────────────

/// Write an audit trail entry.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn write_audit(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    actor: &str,
    action: &str,
    resource: &str,
    metadata: &serde_json::Value,
) -> Result<(), ApiError> {
    sqlx::query(
        r"INSERT INTO audit_events (tenant_id, actor, action, resource, metadata)
          VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(tenant_id)
    .bind(actor)
    .bind(action)
    .bind(resource)
    .bind(metadata)
    .execute(conn)
    .await?;

    Ok(())
}

/// Recent audit entries for a tenant.
///
/// # Errors
///
/// Returns `ApiError::Internal` on database failure.
pub async fn list_audit(
    pool: &PgPool,
    tenant_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditEvent>, ApiError> {
    let entries = sqlx::query_as::<_, AuditEvent>(
        r"SELECT * FROM audit_events
          WHERE tenant_id = $1
          ORDER BY at DESC
          LIMIT $2 OFFSET $3",
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}
