//! Error types for `nkudo-core`.
//!
//! Each variant carries enough context to diagnose the problem without a
//! debugger. PKI errors never include key material — only serials, subject
//! names, or operation descriptions.

/// Errors from the certificate authority.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// The CSR could not be parsed or its signature did not verify.
    #[error("invalid CSR: {reason}")]
    BadCsr { reason: String },

    /// The CSR's public key is below the issuance policy floor.
    #[error("key too weak: {key_type} {bits} bits (minimum {minimum})")]
    KeyTooWeak {
        key_type: &'static str,
        bits: usize,
        minimum: usize,
    },

    /// Certificate or CRL generation failed.
    #[error("certificate generation failed: {reason}")]
    CertGeneration { reason: String },

    /// No CA material is loaded for this tenant.
    #[error("CA unavailable: {reason}")]
    Unavailable { reason: String },

    /// A presented certificate failed verification.
    #[error("certificate verification failed: {0}")]
    Verification(#[from] VerifyError),

    /// Internal error (serialization, unexpected state).
    #[error("PKI internal error: {reason}")]
    Internal { reason: String },
}

/// Why a presented client certificate was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// `not_after` is in the past.
    #[error("certificate expired")]
    Expired,

    /// `not_before` is in the future.
    #[error("certificate not yet valid")]
    NotYetValid,

    /// The certificate does not chain to this CA.
    #[error("unknown issuer")]
    UnknownIssuer,

    /// The serial is on the revocation list.
    #[error("certificate revoked: {reason}")]
    Revoked { reason: crate::pki::RevocationReason },

    /// The certificate bytes could not be parsed at all.
    #[error("malformed certificate: {reason}")]
    Malformed { reason: String },
}

/// Errors from microVM state-machine checks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The requested transition is outside the allowed set.
    #[error("invalid transition: {from} -> {to}")]
    Invalid {
        from: crate::microvm::VmState,
        to: crate::microvm::VmState,
    },
}

/// Errors from microVM spec validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    /// The VM name is empty or not a valid identifier.
    #[error("invalid VM name: {reason}")]
    Name { reason: String },

    /// vCPU count outside `1..=host_limit`.
    #[error("vcpu count {requested} outside 1..={limit}")]
    Vcpu { requested: u32, limit: u32 },

    /// Memory below the 64 MiB floor.
    #[error("memory {requested} MiB below minimum {minimum} MiB")]
    Memory { requested: u64, minimum: u64 },
}

/// Errors from plan validation and hashing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// An operation is missing a required field for its type.
    #[error("operation '{operation_id}' invalid: {reason}")]
    InvalidOperation {
        operation_id: String,
        reason: String,
    },

    /// The plan has no operations.
    #[error("plan has no operations")]
    Empty,

    /// Two operations share the same `operation_id`.
    #[error("duplicate operation_id '{operation_id}'")]
    DuplicateOperation { operation_id: String },
}
