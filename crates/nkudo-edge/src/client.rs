//! HTTP client for the control plane.
//!
//! A thin JSON client over reqwest. Authenticated calls carry the
//! agent's client certificate in the forwarded-cert header the control
//! plane's mTLS-terminating proxy would normally populate. Errors are
//! classified so callers can tell retriable transport failures from
//! terminal API rejections.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use nkudo_core::wire::{
    EnrollRequest, EnrollResponse, HeartbeatRequest, HeartbeatResponse, LogBatchRequest,
    LogIngestResponse, RenewRequest, RenewResponse,
};

/// Header carrying the client certificate on agent calls.
const CLIENT_CERT_HEADER: &str = "x-nkudo-client-cert";

/// Errors from control-plane calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection, DNS, or timeout failure — safe to retry.
    #[error("control plane unreachable: {0}")]
    Transport(String),

    /// The server rejected the request.
    #[error("control plane rejected request ({status}): {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The response body could not be decoded.
    #[error("malformed control plane response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether retrying later can reasonably succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 503 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

/// JSON error body shape returned by the control plane.
#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    error: String,
    message: String,
}

/// Client for one control plane endpoint.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    /// Build a client with the given timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the TLS backend fails to
    /// initialize.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
        })
    }

    /// Redeem an enrollment token.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn enroll(&self, req: &EnrollRequest) -> Result<EnrollResponse, ClientError> {
        self.post_json("/v1/enroll", req, None).await
    }

    /// Renew the client certificate with the refresh token.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn renew(&self, req: &RenewRequest) -> Result<RenewResponse, ClientError> {
        self.post_json("/v1/enroll/renew", req, None).await
    }

    /// Send a heartbeat, authenticated by the client certificate.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn heartbeat(
        &self,
        cert_pem: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, ClientError> {
        self.post_json("/v1/agent/heartbeat", req, Some(cert_pem))
            .await
    }

    /// Push a batch of log frames.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn push_logs(
        &self,
        cert_pem: &str,
        batch: &LogBatchRequest,
    ) -> Result<LogIngestResponse, ClientError> {
        self.post_json("/v1/agent/logs", batch, Some(cert_pem)).await
    }

    /// Liveness probe used by `nkudo-edge check`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when unreachable.
    pub async fn health(&self) -> Result<(), ClientError> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Api {
                status: resp.status().as_u16(),
                code: "unhealthy".to_owned(),
                message: format!("healthz returned {}", resp.status()),
            })
        }
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        cert_pem: Option<&str>,
    ) -> Result<T, ClientError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.http.post(url).json(body);
        if let Some(pem) = cert_pem {
            req = req.header(CLIENT_CERT_HEADER, urlencoding::encode(pem).into_owned());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            resp.json::<T>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))
        } else {
            let body = resp
                .json::<ApiErrorBody>()
                .await
                .unwrap_or_else(|_| ApiErrorBody {
                    error: "unknown".to_owned(),
                    message: format!("HTTP {status}"),
                });
            Err(ClientError::Api {
                status: status.as_u16(),
                code: body.error,
                message: body.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriability_classification() {
        assert!(ClientError::Transport("timeout".to_owned()).is_retriable());
        assert!(ClientError::Api {
            status: 503,
            code: "unavailable".to_owned(),
            message: String::new()
        }
        .is_retriable());
        assert!(!ClientError::Api {
            status: 409,
            code: "conflict".to_owned(),
            message: String::new()
        }
        .is_retriable());
        assert!(!ClientError::Decode("eof".to_owned()).is_retriable());
    }
}
