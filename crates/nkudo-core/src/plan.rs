//! Plans and their operations.
//!
//! A plan is a tenant-submitted batch of desired-state operations for a
//! site. Submissions are idempotent: the canonical hash of the operation
//! set decides whether a reused idempotency key is a duplicate (same
//! hash → same plan) or a conflict (different hash).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PlanError;
use crate::microvm::VmSpec;

// ── Enums ────────────────────────────────────────────────────────────

/// Operation kind inside a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Start,
    Stop,
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Status of a plan as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Terminal statuses are latched and never overwritten.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown plan status: {other}")),
        }
    }
}

/// State of a single operation's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl ExecutionState {
    /// Whether this state will never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown execution state: {other}")),
        }
    }
}

// ── Operations ───────────────────────────────────────────────────────

/// One operation inside a plan submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<uuid::Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<VmSpec>,
}

/// Validate the operation set of a submission.
///
/// `create` requires a spec; `start|stop|delete` require `vm_id`;
/// operation ids must be unique and non-empty.
///
/// # Errors
///
/// Returns the first [`PlanError`] encountered.
pub fn validate_operations(operations: &[OperationRequest]) -> Result<(), PlanError> {
    if operations.is_empty() {
        return Err(PlanError::Empty);
    }
    let mut seen = std::collections::HashSet::with_capacity(operations.len());
    for op in operations {
        if op.operation_id.trim().is_empty() {
            return Err(PlanError::InvalidOperation {
                operation_id: op.operation_id.clone(),
                reason: "operation_id is empty".to_owned(),
            });
        }
        if !seen.insert(op.operation_id.as_str()) {
            return Err(PlanError::DuplicateOperation {
                operation_id: op.operation_id.clone(),
            });
        }
        match op.op_type {
            OperationType::Create => {
                if op.create.is_none() {
                    return Err(PlanError::InvalidOperation {
                        operation_id: op.operation_id.clone(),
                        reason: "create requires name, vcpu_count, memory_mib".to_owned(),
                    });
                }
            }
            OperationType::Start | OperationType::Stop | OperationType::Delete => {
                if op.vm_id.is_none() {
                    return Err(PlanError::InvalidOperation {
                        operation_id: op.operation_id.clone(),
                        reason: format!("{} requires vm_id", op.op_type),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Canonical hash of an operation set, used for idempotent dedup.
///
/// The hash covers `(operation_id, type, vm_id, create-params)` tuples
/// sorted by `operation_id`, so submission order does not matter but
/// any semantic change does.
#[must_use]
pub fn operation_set_hash(operations: &[OperationRequest]) -> String {
    let mut tuples: Vec<_> = operations
        .iter()
        .map(|op| {
            (
                op.operation_id.as_str(),
                op.op_type.to_string(),
                op.vm_id.map(|v| v.to_string()),
                op.create.as_ref().map(|c| {
                    (c.name.as_str(), c.vcpu_count, c.memory_mib)
                }),
            )
        })
        .collect();
    tuples.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (id, ty, vm, create) in tuples {
        hasher.update(id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(ty.as_bytes());
        hasher.update([0x1f]);
        hasher.update(vm.unwrap_or_default().as_bytes());
        hasher.update([0x1f]);
        if let Some((name, vcpu, mem)) = create {
            hasher.update(name.as_bytes());
            hasher.update(vcpu.to_be_bytes());
            hasher.update(mem.to_be_bytes());
        }
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Fold terminal operation states into a plan status.
///
/// Returns `None` while any operation is non-terminal. All terminal:
/// `Failed` if any failed, otherwise `Succeeded` (skipped counts as
/// success — the work was already done).
#[must_use]
pub fn aggregate_status(states: &[ExecutionState]) -> Option<PlanStatus> {
    if states.is_empty() || states.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    if states.contains(&ExecutionState::Failed) {
        Some(PlanStatus::Failed)
    } else {
        Some(PlanStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn create_op(id: &str, name: &str, mem: u64) -> OperationRequest {
        OperationRequest {
            operation_id: id.to_owned(),
            op_type: OperationType::Create,
            vm_id: None,
            create: Some(VmSpec {
                name: name.to_owned(),
                vcpu_count: 1,
                memory_mib: mem,
            }),
        }
    }

    fn start_op(id: &str, vm: uuid::Uuid) -> OperationRequest {
        OperationRequest {
            operation_id: id.to_owned(),
            op_type: OperationType::Start,
            vm_id: Some(vm),
            create: None,
        }
    }

    #[test]
    fn validation_catches_missing_fields() {
        assert!(matches!(validate_operations(&[]), Err(PlanError::Empty)));

        let mut op = create_op("o1", "v1", 256);
        op.create = None;
        assert!(matches!(
            validate_operations(&[op]),
            Err(PlanError::InvalidOperation { .. })
        ));

        let mut op = start_op("o1", uuid::Uuid::new_v4());
        op.vm_id = None;
        assert!(matches!(
            validate_operations(&[op]),
            Err(PlanError::InvalidOperation { .. })
        ));

        let vm = uuid::Uuid::new_v4();
        let dup = [start_op("o1", vm), start_op("o1", vm)];
        assert!(matches!(
            validate_operations(&dup),
            Err(PlanError::DuplicateOperation { .. })
        ));

        let ok = [create_op("o1", "v1", 256), start_op("o2", vm)];
        assert!(validate_operations(&ok).is_ok());
    }

    #[test]
    fn hash_is_order_insensitive_but_body_sensitive() {
        let vm = uuid::Uuid::new_v4();
        let a = [create_op("o1", "v1", 256), start_op("o2", vm)];
        let b = [start_op("o2", vm), create_op("o1", "v1", 256)];
        assert_eq!(operation_set_hash(&a), operation_set_hash(&b));

        let changed = [create_op("o1", "v1", 512), start_op("o2", vm)];
        assert_ne!(operation_set_hash(&a), operation_set_hash(&changed));
    }

    #[test]
    fn aggregation_follows_the_spec_table() {
        use ExecutionState as E;
        assert_eq!(aggregate_status(&[E::Succeeded, E::Running]), None);
        assert_eq!(aggregate_status(&[E::Pending]), None);
        assert_eq!(
            aggregate_status(&[E::Succeeded, E::Skipped]),
            Some(PlanStatus::Succeeded)
        );
        assert_eq!(
            aggregate_status(&[E::Succeeded, E::Failed]),
            Some(PlanStatus::Failed)
        );
        assert_eq!(aggregate_status(&[]), None);
    }

    #[test]
    fn enums_roundtrip() {
        for t in [
            OperationType::Create,
            OperationType::Start,
            OperationType::Stop,
            OperationType::Delete,
        ] {
            assert_eq!(t.to_string().parse::<OperationType>().unwrap(), t);
        }
        for s in [
            PlanStatus::Pending,
            PlanStatus::InProgress,
            PlanStatus::Succeeded,
            PlanStatus::Failed,
            PlanStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<PlanStatus>().unwrap(), s);
        }
        assert!(PlanStatus::Succeeded.is_terminal());
        assert!(!PlanStatus::InProgress.is_terminal());
    }
}
