//! Shared application state for the control plane.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It owns the connection pool, configuration,
//! and a per-tenant cache of certificate authorities rebuilt lazily from
//! persisted (sealed) CA material. There are no process-wide singletons.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use nkudo_core::pki::{CaMaterial, CertificateAuthority, RevokedEntry};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::{repository, seal};

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// PostgreSQL connection pool.
    pub pool: PgPool,
    /// Immutable server configuration.
    pub config: ServerConfig,
    /// Per-tenant certificate authorities, loaded on first use.
    authorities: RwLock<HashMap<Uuid, Arc<CertificateAuthority>>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Build state around an already-connected pool.
    #[must_use]
    pub fn new(pool: PgPool, config: ServerConfig) -> Self {
        Self {
            pool,
            config,
            authorities: RwLock::new(HashMap::new()),
        }
    }

    /// The CA for a tenant, rebuilding from sealed material if needed.
    ///
    /// The rebuilt authority is seeded with the tenant's persisted
    /// revocations so `verify` and the CRL agree with storage.
    ///
    /// # Errors
    ///
    /// `NotFound` if the tenant has no CA root, `Unavailable` if the
    /// sealed key cannot be opened, `Internal` on parse failures.
    pub async fn authority_for(
        &self,
        tenant_id: Uuid,
    ) -> Result<Arc<CertificateAuthority>, ApiError> {
        if let Some(ca) = self.authorities.read().await.get(&tenant_id) {
            return Ok(Arc::clone(ca));
        }

        let root = repository::get_ca_root(&self.pool, tenant_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("tenant has no CA root".to_owned()))?;

        let key_pem = seal::open(&self.config.ca_kek, &root.private_key_enc, &root.key_nonce)
            .map_err(|e| ApiError::Unavailable(format!("CA key unsealing failed: {e}")))?;
        let key_pem = Zeroizing::new(String::from_utf8(key_pem.to_vec()).map_err(|_| {
            ApiError::Internal("sealed CA key is not UTF-8".to_owned())
        })?);

        let material = CaMaterial {
            certificate_pem: root.certificate_pem,
            private_key_pem: key_pem.to_string(),
            common_name: root.common_name,
            created_at: root.created_at,
        };
        let ca = CertificateAuthority::from_material(tenant_id, &material)?;

        let revocations = repository::list_revocations(&self.pool, tenant_id).await?;
        ca.load_revocations(revocations.into_iter().map(|c| {
            let reason = c
                .revocation_reason
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or(nkudo_core::pki::RevocationReason::Unspecified);
            (
                c.serial,
                RevokedEntry {
                    reason,
                    revoked_at: c.revoked_at.unwrap_or(c.created_at),
                },
            )
        }))
        .await?;

        let ca = Arc::new(ca);
        self.authorities
            .write()
            .await
            .insert(tenant_id, Arc::clone(&ca));
        Ok(ca)
    }

    /// Generate, persist, and cache a fresh CA root for a new tenant.
    ///
    /// # Errors
    ///
    /// Surfaces generation, sealing, and storage failures.
    pub async fn create_authority(
        &self,
        tenant_id: Uuid,
        common_name: &str,
    ) -> Result<Arc<CertificateAuthority>, ApiError> {
        let (ca, material) = CertificateAuthority::generate_root(tenant_id, common_name)?;

        let (sealed, nonce) =
            seal::seal(&self.config.ca_kek, material.private_key_pem.as_bytes())
                .map_err(|e| ApiError::Internal(format!("CA key sealing failed: {e}")))?;

        repository::insert_ca_root(
            &self.pool,
            tenant_id,
            &material.certificate_pem,
            &sealed,
            &nonce,
            &material.common_name,
        )
        .await?;

        let ca = Arc::new(ca);
        self.authorities
            .write()
            .await
            .insert(tenant_id, Arc::clone(&ca));
        Ok(ca)
    }
}
