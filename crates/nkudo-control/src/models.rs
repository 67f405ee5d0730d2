//! Control-plane data models.
//!
//! Domain rows for tenants, sites, hosts, agents, enrollment tokens,
//! certificates, microVMs, plans, executions, log frames, and audit
//! events. All IDs are UUIDs; state enums are stored as text and parsed
//! through their `FromStr` impls. Secret material never appears here —
//! only hashes and display prefixes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Lifecycle enums ──────────────────────────────────────────────────

/// Agent lifecycle as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLifecycle {
    Pending,
    Online,
    Degraded,
    Offline,
    Revoked,
}

impl std::fmt::Display for AgentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Revoked => "revoked",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AgentLifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            "revoked" => Ok(Self::Revoked),
            other => Err(format!("unknown agent lifecycle: {other}")),
        }
    }
}

/// Site connectivity derived from heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Unknown,
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConnectivityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown connectivity state: {other}")),
        }
    }
}

// ── Tenancy ──────────────────────────────────────────────────────────

/// A tenant — the root of multi-tenancy.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub retention_days: i32,
    pub created_at: DateTime<Utc>,
}

/// A customer site within a tenant.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Site {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub external_key: String,
    pub connectivity_state: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A physical or virtual Linux host running one agent.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Host {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub hostname: String,
    pub fingerprint: String,
    pub cpu_cores: i32,
    pub memory_bytes: i64,
    pub storage_bytes: i64,
    pub kvm_available: bool,
    pub chv_available: bool,
    pub last_facts_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An enrolled edge agent.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub cert_serial: Option<String>,
    #[serde(skip)]
    pub refresh_token_hash: String,
    pub lifecycle: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_seq_high_water: i64,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Parsed lifecycle; unknown strings map to `Offline`.
    #[must_use]
    pub fn lifecycle(&self) -> AgentLifecycle {
        self.lifecycle.parse().unwrap_or(AgentLifecycle::Offline)
    }
}

// ── Credentials ──────────────────────────────────────────────────────

/// A single-use enrollment token (hash only).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EnrollmentToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    #[serde(skip)]
    pub token_hash: String,
    pub token_prefix: String,
    pub expires_at: DateTime<Utc>,
    pub uses_remaining: i32,
    pub consumed_by_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Persisted CA material for one tenant; private key sealed at rest.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CaRoot {
    pub tenant_id: Uuid,
    pub certificate_pem: String,
    pub private_key_enc: Vec<u8>,
    pub key_nonce: Vec<u8>,
    pub common_name: String,
    pub created_at: DateTime<Utc>,
}

/// An issued agent client certificate (metadata only).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentCert {
    pub serial: String,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── MicroVMs ─────────────────────────────────────────────────────────

/// A microVM as last reported by its site's agent.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MicroVm {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Option<Uuid>,
    pub name: String,
    pub state: String,
    pub vcpu_count: i32,
    pub memory_mib: i64,
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Plans & executions ───────────────────────────────────────────────

/// A desired-state plan for a site.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub plan_version: i64,
    pub idempotency_key: String,
    pub ops_hash: String,
    pub status: String,
    pub leased_by: Option<Uuid>,
    pub leased_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One operation of a plan and its execution record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub operation_id: String,
    pub op_type: String,
    pub vm_id: Option<Uuid>,
    pub params: Option<serde_json::Value>,
    pub state: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub log_seq_high_water: i64,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Audit ────────────────────────────────────────────────────────────

/// An audit trail entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub tenant_id: Uuid,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn lifecycle_roundtrips() {
        for l in [
            AgentLifecycle::Pending,
            AgentLifecycle::Online,
            AgentLifecycle::Degraded,
            AgentLifecycle::Offline,
            AgentLifecycle::Revoked,
        ] {
            assert_eq!(l.to_string().parse::<AgentLifecycle>().unwrap(), l);
        }
        assert!("zombie".parse::<AgentLifecycle>().is_err());
    }

    #[test]
    fn connectivity_roundtrips() {
        for c in [
            ConnectivityState::Unknown,
            ConnectivityState::Online,
            ConnectivityState::Degraded,
            ConnectivityState::Offline,
        ] {
            assert_eq!(c.to_string().parse::<ConnectivityState>().unwrap(), c);
        }
    }
}
