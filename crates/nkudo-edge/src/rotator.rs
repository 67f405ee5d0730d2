//! Certificate rotator.
//!
//! A single cooperative task: every check interval it reads the current
//! client certificate and, once the remaining lifetime drops under
//! `max(6h, 20% of total)` (or the cert is missing/expired), performs a
//! rotation — fresh key + CSR, renewal against the control plane with
//! the refresh token, validation of the returned chain, and an atomic
//! swap of the credential triple. Transient failures retry with bounded
//! exponential backoff (base 5 s, cap 5 min); other failures surface to
//! logs and wait for the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use zeroize::Zeroizing;

use nkudo_core::pki::{generate_key_and_csr, rotation_due};
use nkudo_core::wire::RenewRequest;

use crate::client::{ClientError, ControlPlaneClient};
use crate::config::AgentConfig;
use crate::identity::{
    cert_window, install_credentials, read_client_cert, validate_renewal, IdentityError,
};
use crate::statestore::{Identity, StateStore, StateStoreError};

/// Backoff base for retriable failures.
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Retriable attempts within one tick before giving up until the next.
const MAX_ATTEMPTS: u32 = 6;

/// Errors from a rotation attempt.
#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("csr generation failed: {0}")]
    Pki(#[from] nkudo_core::error::PkiError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    State(#[from] StateStoreError),
}

impl RotateError {
    fn is_retriable(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_retriable())
    }
}

/// The rotator task.
pub struct Rotator {
    config: AgentConfig,
    store: Arc<StateStore>,
    client: ControlPlaneClient,
}

impl Rotator {
    #[must_use]
    pub fn new(config: AgentConfig, store: Arc<StateStore>, client: ControlPlaneClient) -> Self {
        Self {
            config,
            store,
            client,
        }
    }

    /// Run until shutdown. `nudge` wakes the loop early when the
    /// control plane hints `rotate_certificate` on a heartbeat.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        nudge: Arc<tokio::sync::Notify>,
    ) {
        let mut interval = tokio::time::interval(self.config.rotation_check_interval);
        tracing::info!(
            interval_secs = self.config.rotation_check_interval.as_secs(),
            "cert rotator started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = nudge.notified() => {
                    tracing::debug!("rotation nudged by control plane hint");
                }
                _ = shutdown.changed() => {
                    tracing::info!("cert rotator shutting down");
                    return;
                }
            }

            match self.tick(&mut shutdown).await {
                Ok(true) => tracing::info!("client certificate rotated"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "rotation failed, waiting for next tick"),
            }

            if *shutdown.borrow() {
                tracing::info!("cert rotator shutting down");
                return;
            }
        }
    }

    /// One check: rotate if due. Retries retriable failures with
    /// backoff, aborting cleanly when shutdown is signalled.
    ///
    /// # Errors
    ///
    /// The last error once retries are exhausted or for terminal kinds.
    pub async fn tick(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool, RotateError> {
        let Some(identity) = self.store.identity().await else {
            return Ok(false);
        };

        if !self.due()? {
            return Ok(false);
        }

        let mut backoff = BACKOFF_BASE;
        let mut last_err: Option<RotateError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.rotate(&identity).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_retriable() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "rotation attempt failed, backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Ok(false),
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(RotateError::Client(ClientError::Transport(
            "retries exhausted".to_owned(),
        ))))
    }

    /// Rotate immediately regardless of the window (`nkudo-edge renew`).
    ///
    /// # Errors
    ///
    /// Any [`RotateError`] from the single attempt.
    pub async fn rotate_now(&self) -> Result<(), RotateError> {
        let identity = self.store.identity().await.ok_or_else(|| {
            RotateError::Identity(IdentityError::Rejected {
                reason: "agent is not enrolled".to_owned(),
            })
        })?;
        self.rotate(&identity).await
    }

    /// Whether the current certificate is inside the rotation window.
    /// A missing or unreadable certificate counts as overdue.
    fn due(&self) -> Result<bool, RotateError> {
        match read_client_cert(&self.config)? {
            None => Ok(true),
            Some(pem) => match cert_window(&pem) {
                Ok(window) => Ok(rotation_due(window.not_before, window.not_after, Utc::now())),
                Err(e) => {
                    tracing::warn!(error = %e, "client cert unreadable, forcing rotation");
                    Ok(true)
                }
            },
        }
    }

    async fn rotate(&self, identity: &Identity) -> Result<(), RotateError> {
        let (key_pem, csr_pem) = generate_key_and_csr(&identity.agent_id.to_string())?;
        let key_pem = Zeroizing::new(key_pem);

        let resp = self
            .client
            .renew(&RenewRequest {
                agent_id: identity.agent_id,
                csr_pem,
                refresh_token: identity.refresh_token.clone(),
            })
            .await?;

        validate_renewal(&resp.client_cert_pem, &resp.ca_cert_pem, Utc::now())?;

        install_credentials(
            &self.config,
            &key_pem,
            &resp.client_cert_pem,
            &resp.ca_cert_pem,
        )?;

        if let Some(next_refresh) = resp.refresh_token {
            self.store
                .mutate(|state| {
                    if let Some(id) = state.identity.as_mut() {
                        id.refresh_token = next_refresh;
                    }
                })
                .await?;
        }

        Ok(())
    }
}
