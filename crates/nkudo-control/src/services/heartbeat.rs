//! Heartbeat ingest and plan leasing.
//!
//! One heartbeat is one transaction: advance the replay-protecting
//! sequence high-water, refresh site/host/agent liveness, fold in
//! microVM state reports under the transition rules, latch execution
//! updates into their plans, then lease up to the configured number of
//! pending plans. A replayed sequence number mutates nothing but still
//! gets a lease response, so a retrying agent keeps making progress.

use uuid::Uuid;

use nkudo_core::microvm::{self, VmState, INVALID_TRANSITION};
use nkudo_core::pki::rotation_due;
use nkudo_core::plan::{self, ExecutionState};
use nkudo_core::wire::{
    ExecutionUpdate, HeartbeatRequest, HeartbeatResponse, LeasedOperation, LeasedPlan,
    VmStatusReport,
};

use crate::auth::AgentIdentity;
use crate::error::ApiError;
use crate::repository;
use crate::state::AppState;

/// Process one heartbeat from an authenticated agent.
///
/// # Errors
///
/// `unavailable` on storage failure; everything domain-level inside the
/// heartbeat (bad VM transitions, cross-tenant updates) is absorbed and
/// recorded rather than failing the request.
pub async fn handle(
    state: &AppState,
    identity: &AgentIdentity,
    req: &HeartbeatRequest,
) -> Result<HeartbeatResponse, ApiError> {
    let agent = &identity.agent;
    let seq = i64::try_from(req.heartbeat_seq)
        .map_err(|_| ApiError::BadRequest("heartbeat_seq out of range".to_owned()))?;

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;

    let fresh = repository::try_advance_heartbeat_seq(&mut tx, agent.id, seq).await?;
    if fresh {
        repository::touch_site(&mut tx, agent.tenant_id, agent.site_id).await?;
        repository::update_host_facts(&mut tx, agent.host_id, &req.facts).await?;
        repository::update_agent_facts(&mut tx, agent.id, &req.facts).await?;

        for report in &req.microvms {
            apply_vm_report(&mut tx, agent, report).await?;
        }
        for update in &req.executions {
            apply_execution_update(&mut tx, agent, update).await?;
        }
    } else {
        tracing::debug!(
            agent_id = %agent.id,
            heartbeat_seq = req.heartbeat_seq,
            high_water = agent.heartbeat_seq_high_water,
            "replayed heartbeat, state mutations skipped"
        );
    }

    // Leasing happens even on replays — the agent may have restarted
    // and be re-requesting work it never acknowledged.
    let plans = if req.shutdown {
        if fresh {
            repository::mark_agent_offline(&mut tx, agent.id).await?;
        }
        Vec::new()
    } else {
        lease_plans(&mut tx, state, agent.tenant_id, agent.site_id, agent.id).await?
    };

    tx.commit().await.map_err(ApiError::from)?;

    Ok(HeartbeatResponse {
        next_heartbeat_s: state.config.heartbeat_interval_s,
        plans,
        rotate_certificate: rotation_due(
            identity.cert.not_before,
            identity.cert.not_after,
            chrono::Utc::now(),
        ),
    })
}

/// Fold one microVM status report into the registry.
///
/// A transition outside the state machine is recorded, but the stored
/// state is forced to `error` with an `invalid_transition` marker. A
/// legal arrival at `deleting` removes the row — deletion is terminal.
async fn apply_vm_report(
    tx: &mut sqlx::PgConnection,
    agent: &crate::models::Agent,
    report: &VmStatusReport,
) -> Result<(), ApiError> {
    let current = repository::get_vm(tx, agent.tenant_id, report.vm_id).await?;

    let decided = match &current {
        None => report.state,
        Some(row) => {
            let from: VmState = row
                .state
                .parse()
                .map_err(|e: String| ApiError::Internal(e))?;
            match microvm::validate_transition(from, report.state) {
                Ok(()) => report.state,
                Err(err) => {
                    tracing::warn!(
                        vm_id = %report.vm_id,
                        agent_id = %agent.id,
                        %err,
                        "rejected microVM transition"
                    );
                    VmState::Error
                }
            }
        }
    };

    if decided == VmState::Deleting && current.is_some() {
        repository::delete_vm(tx, agent.tenant_id, report.vm_id).await?;
        return Ok(());
    }

    let last_error = if decided == VmState::Error && report.state != VmState::Error {
        Some(INVALID_TRANSITION)
    } else {
        report.last_error.as_deref()
    };

    repository::upsert_vm_state(
        tx,
        agent.tenant_id,
        agent.site_id,
        agent.host_id,
        report.vm_id,
        &report.name,
        &decided.to_string(),
        i32::try_from(report.vcpu_count).unwrap_or(i32::MAX),
        i64::try_from(report.memory_mib).unwrap_or(i64::MAX),
        last_error,
    )
    .await?;

    Ok(())
}

/// Latch one execution update; on a terminal state, aggregate the
/// parent plan. Updates for executions outside the agent's tenant are
/// dropped and audited.
async fn apply_execution_update(
    tx: &mut sqlx::PgConnection,
    agent: &crate::models::Agent,
    update: &ExecutionUpdate,
) -> Result<(), ApiError> {
    let Some(execution) = repository::get_execution(tx, update.execution_id).await? else {
        tracing::warn!(
            execution_id = %update.execution_id,
            agent_id = %agent.id,
            "execution update for unknown execution, dropped"
        );
        return Ok(());
    };

    if execution.tenant_id != agent.tenant_id {
        repository::write_audit(
            tx,
            agent.tenant_id,
            &format!("agent/{}", agent.id),
            "security.cross_tenant_attempt",
            &format!("execution/{}", update.execution_id),
            &serde_json::json!({ "reported_state": update.state }),
        )
        .await?;
        tracing::warn!(
            execution_id = %update.execution_id,
            agent_id = %agent.id,
            "cross-tenant execution update dropped"
        );
        return Ok(());
    }

    let latched = repository::latch_execution_state(
        tx,
        execution.id,
        &update.state.to_string(),
        update.error_code.as_deref(),
        update.error_message.as_deref(),
    )
    .await?;

    if latched.is_some() && update.state.is_terminal() {
        let states = repository::plan_execution_states(tx, execution.plan_id).await?;
        let parsed: Vec<ExecutionState> = states
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if parsed.len() == states.len() {
            if let Some(status) = plan::aggregate_status(&parsed) {
                repository::latch_plan_status(tx, execution.plan_id, &status.to_string())
                    .await?;
                tracing::info!(
                    plan_id = %execution.plan_id,
                    %status,
                    "plan reached terminal status"
                );
            }
        }
    }

    Ok(())
}

/// Lease eligible plans to this agent, oldest version first.
///
/// The conditional update in [`repository::lease_plan`] is the
/// tie-break between competing agents: exactly one sees the row flip,
/// the loser gets fewer (or zero) plans this round.
async fn lease_plans(
    tx: &mut sqlx::PgConnection,
    state: &AppState,
    tenant_id: Uuid,
    site_id: Uuid,
    agent_id: Uuid,
) -> Result<Vec<LeasedPlan>, ApiError> {
    let candidates = repository::leasable_plans(
        tx,
        tenant_id,
        site_id,
        state.config.max_plans_per_heartbeat,
    )
    .await?;

    let mut leased = Vec::with_capacity(candidates.len());
    for plan in candidates {
        let Some(expires) =
            repository::lease_plan(tx, plan.id, agent_id, state.config.lease_ttl).await?
        else {
            continue;
        };

        let executions = repository::executions_for_plan(tx, plan.id).await?;
        let mut operations = Vec::with_capacity(executions.len());
        for exec in executions {
            let op_type = exec
                .op_type
                .parse()
                .map_err(|e: String| ApiError::Internal(e))?;
            let create = match exec.params {
                Some(value) => Some(
                    serde_json::from_value(value)
                        .map_err(|e| ApiError::Internal(format!("stored params: {e}")))?,
                ),
                None => None,
            };
            operations.push(LeasedOperation {
                execution_id: exec.id,
                operation_id: exec.operation_id,
                op_type,
                vm_id: exec.vm_id,
                create,
            });
        }

        tracing::info!(
            plan_id = %plan.id,
            agent_id = %agent_id,
            lease_expires_at = %expires,
            "plan leased"
        );
        leased.push(LeasedPlan {
            plan_id: plan.id,
            plan_version: plan.plan_version,
            lease_expires_at: expires,
            operations,
        });
    }

    Ok(leased)
}
