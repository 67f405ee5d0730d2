//! Wire types shared between the control plane and the edge agent.
//!
//! Everything here serializes as JSON with snake_case fields; timestamps
//! are UTC RFC 3339 via chrono's serde impls. PEM strings are standard
//! X.509 Base64. Both sides depend on these types so the contract cannot
//! drift.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::microvm::{VmSpec, VmState};
use crate::plan::{ExecutionState, OperationType, PlanStatus};
pub use crate::plan::OperationRequest;

/// Log messages longer than this are truncated at ingest.
pub const MAX_LOG_MESSAGE_BYTES: usize = 8 * 1024;

/// Log frames buffered before the ingest service flushes a batch.
pub const LOG_FLUSH_THRESHOLD: usize = 100;

// ── Enrollment ───────────────────────────────────────────────────────

/// One-time enrollment of a fresh agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub token: String,
    pub hostname: String,
    pub csr_pem: String,
    pub agent_version: String,
    pub host_fingerprint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub agent_id: Uuid,
    pub client_cert_pem: String,
    pub ca_cert_pem: String,
    pub refresh_token: String,
    pub heartbeat_interval_s: u64,
}

/// Certificate renewal using the long-lived refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub agent_id: Uuid,
    pub csr_pem: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResponse {
    pub client_cert_pem: String,
    pub ca_cert_pem: String,
    /// Present when the server also rotated the refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

// ── Heartbeat ────────────────────────────────────────────────────────

/// Host capacity and platform facts reported on every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub kvm_available: bool,
    pub chv_available: bool,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub agent_version: String,
}

/// Observed state of one microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatusReport {
    pub vm_id: Uuid,
    pub name: String,
    pub state: VmState,
    pub vcpu_count: u32,
    pub memory_mib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Progress report for one execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: Uuid,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Strictly increasing per agent; replays mutate nothing.
    pub heartbeat_seq: u64,
    /// Set on the final heartbeat before a graceful agent exit.
    #[serde(default)]
    pub shutdown: bool,
    pub facts: HostFacts,
    #[serde(default)]
    pub microvms: Vec<VmStatusReport>,
    #[serde(default)]
    pub executions: Vec<ExecutionUpdate>,
}

/// One operation inside a leased plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedOperation {
    pub execution_id: Uuid,
    pub operation_id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<VmSpec>,
}

/// A plan leased to this agent for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedPlan {
    pub plan_id: Uuid,
    pub plan_version: i64,
    pub lease_expires_at: DateTime<Utc>,
    pub operations: Vec<LeasedOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub next_heartbeat_s: u64,
    pub plans: Vec<LeasedPlan>,
    pub rotate_certificate: bool,
}

// ── Plan application ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyPlanRequest {
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
    pub operations: Vec<OperationRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyPlanResponse {
    pub plan_id: Uuid,
    pub plan_version: i64,
    pub plan_status: PlanStatus,
    pub deduplicated: bool,
}

// ── Log ingest ───────────────────────────────────────────────────────

/// Severity of a log frame. Ingest lowercases unknown spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LogSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// One frame of an execution's log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFrame {
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<Uuid>,
    /// Strictly increasing per execution; duplicates are dropped.
    pub seq: u64,
    pub severity: LogSeverity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
    /// Marks the final frame of the stream.
    #[serde(default)]
    pub eof: bool,
}

/// A batch of frames pushed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatchRequest {
    pub frames: Vec<LogFrame>,
}

/// Counts returned when a batch (or the stream) closes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogIngestResponse {
    pub accepted: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn heartbeat_request_roundtrips_via_json() {
        let req = HeartbeatRequest {
            heartbeat_seq: 7,
            shutdown: false,
            facts: HostFacts {
                hostname: "h1".to_owned(),
                cpu_cores: 8,
                memory_bytes: 16 << 30,
                storage_bytes: 500 << 30,
                kvm_available: true,
                chv_available: true,
                os: "linux".to_owned(),
                arch: "x86_64".to_owned(),
                kernel_version: "6.8".to_owned(),
                agent_version: "0.2.0".to_owned(),
            },
            microvms: vec![VmStatusReport {
                vm_id: Uuid::new_v4(),
                name: "vm1".to_owned(),
                state: VmState::Running,
                vcpu_count: 2,
                memory_mib: 512,
                last_error: None,
            }],
            executions: vec![],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: HeartbeatRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.heartbeat_seq, 7);
        assert_eq!(back.microvms.len(), 1);
        assert!(json.contains("\"state\":\"running\""));
    }

    #[test]
    fn operation_type_field_serializes_as_type() {
        let op = LeasedOperation {
            execution_id: Uuid::new_v4(),
            operation_id: "o1".to_owned(),
            op_type: OperationType::Create,
            vm_id: None,
            create: Some(VmSpec {
                name: "v1".to_owned(),
                vcpu_count: 1,
                memory_mib: 256,
            }),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"create\""));
        assert!(!json.contains("vm_id"));
    }

    #[test]
    fn severity_parses_forgivingly() {
        assert_eq!("WARNING".parse::<LogSeverity>().unwrap(), LogSeverity::Warn);
        assert_eq!("Error".parse::<LogSeverity>().unwrap(), LogSeverity::Error);
        assert!("fatal".parse::<LogSeverity>().is_err());
    }
}
