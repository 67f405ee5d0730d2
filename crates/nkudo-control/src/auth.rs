//! Request authentication.
//!
//! Two auth paths:
//! 1. **Agent auth**: mTLS is terminated by the fronting proxy, which
//!    forwards the client certificate as a URL-encoded PEM header
//!    (`x-nkudo-client-cert`). The middleware extracts the agent id
//!    from the CN, loads the agent row, and verifies the certificate
//!    against the tenant's CA — chain, validity window, revocation set.
//! 2. **Admin auth**: the bootstrap routes take a static bearer token
//!    from configuration, compared constant-time.
//!
//! On success an [`AgentIdentity`] (or nothing, for admin) lands in the
//! request extensions.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use x509_parser::prelude::{FromDer, X509Certificate};

use nkudo_core::pki::VerifiedClient;

use crate::error::ApiError;
use crate::models::{Agent, AgentLifecycle};
use crate::repository;
use crate::state::AppState;

/// Header carrying the proxy-forwarded client certificate.
pub const CLIENT_CERT_HEADER: &str = "x-nkudo-client-cert";

/// Identity of an authenticated agent request.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// The registry row for this agent.
    pub agent: Agent,
    /// Details of the presented certificate.
    pub cert: VerifiedClient,
}

/// Axum middleware authenticating agent requests via the forwarded
/// client certificate.
///
/// # Errors
///
/// `unauthorized` when the header is missing or the certificate fails
/// verification, `forbidden` when the agent is revoked.
pub async fn agent_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(CLIENT_CERT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::Unauthorized("client certificate required".to_owned())
        })?;

    let cert_pem = urlencoding::decode(header)
        .map_err(|_| ApiError::Unauthorized("malformed certificate header".to_owned()))?
        .into_owned();

    let identity = authenticate_agent(&state, &cert_pem).await?;
    req.extensions_mut().insert(identity);

    Ok(next.run(req).await)
}

/// Verify a presented certificate and resolve the agent it names.
///
/// # Errors
///
/// See [`agent_auth_middleware`].
pub async fn authenticate_agent(
    state: &AppState,
    cert_pem: &str,
) -> Result<AgentIdentity, ApiError> {
    // Peek at the CN before verification — the agent row tells us which
    // tenant CA to verify against.
    let agent_id = peek_common_name(cert_pem)?;

    let agent = repository::get_agent(&state.pool, agent_id)
        .await
        .map_err(|_| ApiError::Unauthorized("unknown agent".to_owned()))?;

    if agent.lifecycle() == AgentLifecycle::Revoked {
        return Err(ApiError::Forbidden("agent is revoked".to_owned()));
    }

    let ca = state.authority_for(agent.tenant_id).await?;
    let cert = ca.verify(cert_pem).await?;

    if cert.agent_id != agent.id {
        return Err(ApiError::Unauthorized(
            "certificate subject mismatch".to_owned(),
        ));
    }

    Ok(AgentIdentity { agent, cert })
}

/// Axum middleware guarding admin bootstrap routes with the configured
/// bearer token.
///
/// # Errors
///
/// `unauthorized` when no admin token is configured or the presented
/// one does not match.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let configured = state.config.admin_token.as_bytes();
    if configured.is_empty() {
        return Err(ApiError::Unauthorized(
            "admin API disabled: NKUDO_ADMIN_TOKEN is not set".to_owned(),
        ));
    }

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("bearer token required".to_owned()))?;

    let matches: bool = presented.as_bytes().ct_eq(configured).into();
    if presented.len() != configured.len() || !matches {
        return Err(ApiError::Unauthorized("invalid admin token".to_owned()));
    }

    Ok(next.run(req).await)
}

/// Extract the subject CN (agent id) without verifying the chain.
fn peek_common_name(cert_pem: &str) -> Result<Uuid, ApiError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|_| ApiError::Unauthorized("malformed certificate".to_owned()))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|_| ApiError::Unauthorized("malformed certificate".to_owned()))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("certificate has no CN".to_owned()))?;
    cn.parse()
        .map_err(|_| ApiError::Unauthorized("certificate CN is not an agent id".to_owned()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn peek_cn_rejects_garbage() {
        assert!(peek_common_name("not a pem").is_err());
    }

    #[test]
    fn peek_cn_reads_issued_cert() {
        let tenant = Uuid::new_v4();
        let (ca, _) =
            nkudo_core::pki::CertificateAuthority::generate_root(tenant, "test root")
                .unwrap();
        let agent_id = Uuid::new_v4();
        let (_key, csr) =
            nkudo_core::pki::generate_key_and_csr(&agent_id.to_string()).unwrap();
        let issued = ca
            .issue_from_csr(&csr, agent_id, Uuid::new_v4(), chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(peek_common_name(&issued.certificate_pem).unwrap(), agent_id);
    }
}
