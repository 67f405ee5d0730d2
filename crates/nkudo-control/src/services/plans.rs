//! Plan application — idempotent desired-state submissions.
//!
//! A reused `(tenant, idempotency_key)` within the dedup window returns
//! the stored plan when the operation-set hash matches and `conflict`
//! when it does not. New submissions take the next per-site plan
//! version and cancel superseded pending plans. The whole unit runs in
//! one transaction serialized per key by a transaction-scoped advisory
//! lock, so concurrent identical submissions create exactly one plan.

use std::time::Duration;

use uuid::Uuid;

use nkudo_core::plan::{operation_set_hash, validate_operations, OperationType, PlanStatus};
use nkudo_core::wire::{ApplyPlanRequest, ApplyPlanResponse};

use crate::error::ApiError;
use crate::repository;
use crate::state::AppState;

/// How long an idempotency key stays binding.
const DEDUP_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Apply a plan to a site.
///
/// # Errors
///
/// `bad_input` for invalid operations or foreign `vm_id`s, `conflict`
/// for a reused key with a different body, `not_found` for an unknown
/// site.
pub async fn apply_plan(
    state: &AppState,
    tenant_id: Uuid,
    site_id: Uuid,
    req: &ApplyPlanRequest,
) -> Result<ApplyPlanResponse, ApiError> {
    if req.idempotency_key.trim().is_empty() {
        return Err(ApiError::BadRequest("idempotency_key is required".to_owned()));
    }
    validate_operations(&req.operations)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Site must exist under this tenant before anything else.
    repository::get_site(&state.pool, tenant_id, site_id).await?;

    let ops_hash = operation_set_hash(&req.operations);

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;

    repository::lock_idempotency_key(&mut tx, tenant_id, &req.idempotency_key).await?;

    if let Some(existing) =
        repository::find_plan_by_idempotency(&mut tx, tenant_id, &req.idempotency_key, DEDUP_WINDOW)
            .await?
    {
        if existing.ops_hash == ops_hash {
            let status: PlanStatus = existing
                .status
                .parse()
                .map_err(|e: String| ApiError::Internal(e))?;
            tx.commit().await.map_err(ApiError::from)?;
            tracing::debug!(
                plan_id = %existing.id,
                idempotency_key = %req.idempotency_key,
                "plan submission deduplicated"
            );
            return Ok(ApplyPlanResponse {
                plan_id: existing.id,
                plan_version: existing.plan_version,
                plan_status: status,
                deduplicated: true,
            });
        }
        return Err(ApiError::Conflict(format!(
            "idempotency_key '{}' was already used with a different operation set",
            req.idempotency_key
        )));
    }

    // Referenced VMs must belong to this tenant and site.
    for op in &req.operations {
        if let Some(vm_id) = op.vm_id {
            let vm = repository::get_vm(&mut tx, tenant_id, vm_id)
                .await?
                .filter(|vm| vm.site_id == site_id);
            if vm.is_none() {
                return Err(ApiError::BadRequest(format!(
                    "operation '{}' references vm {vm_id} outside this site",
                    op.operation_id
                )));
            }
        }
    }

    let cancelled = repository::cancel_superseded_plans(&mut tx, tenant_id, site_id).await?;
    if cancelled > 0 {
        repository::write_audit(
            &mut tx,
            tenant_id,
            "control-plane",
            "plan.cancelled",
            &format!("site/{site_id}"),
            &serde_json::json!({ "superseded": cancelled }),
        )
        .await?;
    }

    let plan_version = repository::next_plan_version(&mut tx, tenant_id, site_id).await?;
    let plan = repository::insert_plan(
        &mut tx,
        tenant_id,
        site_id,
        plan_version,
        &req.idempotency_key,
        &ops_hash,
    )
    .await?;

    for op in &req.operations {
        let params = match op.op_type {
            OperationType::Create => Some(
                serde_json::to_value(&op.create)
                    .map_err(|e| ApiError::Internal(format!("spec serialization: {e}")))?,
            ),
            _ => None,
        };
        repository::insert_execution(
            &mut tx,
            tenant_id,
            plan.id,
            &op.operation_id,
            &op.op_type.to_string(),
            op.vm_id,
            params.as_ref(),
        )
        .await?;
    }

    repository::write_audit(
        &mut tx,
        tenant_id,
        "control-plane",
        "plan.applied",
        &format!("plan/{}", plan.id),
        &serde_json::json!({
            "site_id": site_id,
            "plan_version": plan_version,
            "operations": req.operations.len(),
            "client_request_id": req.client_request_id,
        }),
    )
    .await?;

    tx.commit().await.map_err(ApiError::from)?;

    tracing::info!(
        plan_id = %plan.id,
        tenant_id = %tenant_id,
        site_id = %site_id,
        plan_version,
        "plan applied"
    );

    Ok(ApplyPlanResponse {
        plan_id: plan.id,
        plan_version,
        plan_status: PlanStatus::Pending,
        deduplicated: false,
    })
}
