//! Tenant-scoped certificate authority.
//!
//! Each tenant gets a self-signed root that issues short-lived client
//! certificates to agents from their CSRs. Uses `rcgen` for pure-Rust
//! certificate generation — no OpenSSL dependency — and `x509-parser`
//! for CSR/certificate inspection. Revocations live in an in-memory set
//! mirrored durably by the caller; the CRL is an immutable snapshot
//! versioned by `crl_number` and swapped atomically under a writer lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::error::{PkiError, VerifyError};

/// Clock-skew allowance on `not_before` of issued certificates.
const BACKDATE_MINUTES: i64 = 5;

/// How long a published CRL stays fresh.
const CRL_VALIDITY_DAYS: i64 = 7;

/// Minimum RSA modulus accepted from a CSR, in bits.
const MIN_RSA_BITS: usize = 2048;

/// Minimum EC field size accepted from a CSR, in bits.
const MIN_EC_BITS: usize = 256;

/// Private OID arc for the tenant-id certificate extension.
const OID_TENANT_ID: &[u64] = &[1, 3, 6, 1, 4, 1, 58854, 1, 1];

/// Private OID arc for the site-id certificate extension.
const OID_SITE_ID: &[u64] = &[1, 3, 6, 1, 4, 1, 58854, 1, 2];

// ── Material & documents ─────────────────────────────────────────────

/// Root CA material, persisted by the caller (key encrypted at rest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaMaterial {
    /// PEM-encoded CA certificate. Safe to distribute.
    pub certificate_pem: String,
    /// PEM-encoded CA private key. Never logged, zeroized where held.
    pub private_key_pem: String,
    /// Subject common name of the root.
    pub common_name: String,
    /// When the root was generated.
    pub created_at: DateTime<Utc>,
}

/// A certificate issued to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCert {
    /// PEM-encoded leaf certificate.
    pub certificate_pem: String,
    /// Serial number, lowercase hex.
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// An immutable, signed CRL snapshot.
#[derive(Debug, Clone)]
pub struct CrlDocument {
    pub der: Vec<u8>,
    pub pem: String,
    /// Monotone version of this CRL.
    pub crl_number: u64,
    pub next_update: DateTime<Utc>,
}

/// Identity extracted from a verified client certificate.
#[derive(Debug, Clone)]
pub struct VerifiedClient {
    pub agent_id: uuid::Uuid,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

// ── Revocation reasons ───────────────────────────────────────────────

/// RFC 5280 reason codes this CA records (id-ce-cRLReasons, 2.5.29.21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    Superseded,
    AffiliationChanged,
    CessationOfOperation,
    PrivilegeWithdrawn,
}

impl RevocationReason {
    const fn to_rcgen(self) -> rcgen::RevocationReason {
        match self {
            Self::Unspecified => rcgen::RevocationReason::Unspecified,
            Self::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
            Self::Superseded => rcgen::RevocationReason::Superseded,
            Self::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
            Self::CessationOfOperation => rcgen::RevocationReason::CessationOfOperation,
            Self::PrivilegeWithdrawn => rcgen::RevocationReason::PrivilegeWithdrawn,
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "key_compromise",
            Self::Superseded => "superseded",
            Self::AffiliationChanged => "affiliation_changed",
            Self::CessationOfOperation => "cessation_of_operation",
            Self::PrivilegeWithdrawn => "privilege_withdrawn",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(Self::Unspecified),
            "key_compromise" => Ok(Self::KeyCompromise),
            "superseded" => Ok(Self::Superseded),
            "affiliation_changed" => Ok(Self::AffiliationChanged),
            "cessation_of_operation" => Ok(Self::CessationOfOperation),
            "privilege_withdrawn" => Ok(Self::PrivilegeWithdrawn),
            other => Err(format!("unknown revocation reason: {other}")),
        }
    }
}

/// A recorded revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
}

// ── The CA ───────────────────────────────────────────────────────────

struct RevocationState {
    revoked: HashMap<String, RevokedEntry>,
    crl_number: u64,
    current: Arc<CrlDocument>,
}

/// The issuing authority for one tenant's agent client certificates.
pub struct CertificateAuthority {
    tenant_id: uuid::Uuid,
    ca_pem: String,
    ca_der: Vec<u8>,
    issuer_cert: rcgen::Certificate,
    issuer_key: rcgen::KeyPair,
    state: RwLock<RevocationState>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a fresh self-signed root for a tenant.
    ///
    /// Returns the authority plus the material the caller must persist
    /// (the private key encrypted at rest).
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] if key or certificate
    /// generation fails.
    pub fn generate_root(
        tenant_id: uuid::Uuid,
        common_name: &str,
    ) -> Result<(Self, CaMaterial), PkiError> {
        if common_name.is_empty() {
            return Err(PkiError::CertGeneration {
                reason: "common_name is required".to_owned(),
            });
        }

        let key = rcgen::KeyPair::generate().map_err(|e| PkiError::CertGeneration {
            reason: format!("CA key generation failed: {e}"),
        })?;

        let mut params =
            rcgen::CertificateParams::new(Vec::<String>::new()).map_err(|e| {
                PkiError::CertGeneration {
                    reason: format!("failed to create CA params: {e}"),
                }
            })?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("CA self-signing failed: {e}"),
            })?;

        let material = CaMaterial {
            certificate_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
            common_name: common_name.to_owned(),
            created_at: Utc::now(),
        };

        let authority = Self::assemble(tenant_id, cert.pem(), cert, key)?;
        Ok((authority, material))
    }

    /// Rebuild an authority from persisted material (e.g. at boot).
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::Unavailable`] if the material cannot be
    /// parsed back into a signing identity.
    pub fn from_material(
        tenant_id: uuid::Uuid,
        material: &CaMaterial,
    ) -> Result<Self, PkiError> {
        let key_pem = Zeroizing::new(material.private_key_pem.clone());
        let key = rcgen::KeyPair::from_pem(&key_pem).map_err(|e| PkiError::Unavailable {
            reason: format!("failed to parse CA key: {e}"),
        })?;

        let params = rcgen::CertificateParams::from_ca_cert_pem(&material.certificate_pem)
            .map_err(|e| PkiError::Unavailable {
                reason: format!("failed to parse CA certificate: {e}"),
            })?;
        // Re-signing with the same key and DN yields an issuer whose SPKI
        // and subject match the distributed PEM, which is all chain
        // verification consults.
        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::Unavailable {
                reason: format!("failed to rebuild CA issuer: {e}"),
            })?;

        Self::assemble(tenant_id, material.certificate_pem.clone(), cert, key)
    }

    fn assemble(
        tenant_id: uuid::Uuid,
        ca_pem: String,
        issuer_cert: rcgen::Certificate,
        issuer_key: rcgen::KeyPair,
    ) -> Result<Self, PkiError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(ca_pem.as_bytes()).map_err(|e| {
            PkiError::Internal {
                reason: format!("CA PEM re-parse failed: {e}"),
            }
        })?;
        let ca_der = pem.contents.clone();

        let authority = Self {
            tenant_id,
            ca_pem,
            ca_der,
            issuer_cert,
            issuer_key,
            state: RwLock::new(RevocationState {
                revoked: HashMap::new(),
                crl_number: 0,
                current: Arc::new(CrlDocument {
                    der: Vec::new(),
                    pem: String::new(),
                    crl_number: 0,
                    next_update: Utc::now(),
                }),
            }),
        };
        Ok(authority)
    }

    /// The tenant this authority issues for.
    #[must_use]
    pub const fn tenant_id(&self) -> uuid::Uuid {
        self.tenant_id
    }

    /// PEM of the root certificate, as distributed to agents.
    #[must_use]
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Sign an agent's CSR into a short-lived client certificate.
    ///
    /// The CSR supplies only the public key — subject CN and SAN are
    /// replaced with `agent_id`, and tenant/site ids are embedded as
    /// private extensions. `not_before` is backdated five minutes for
    /// clock skew.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::BadCsr`] for unparseable or unsigned CSRs,
    /// [`PkiError::KeyTooWeak`] when the key is below policy, and
    /// [`PkiError::CertGeneration`] if signing fails.
    pub fn issue_from_csr(
        &self,
        csr_pem: &str,
        agent_id: uuid::Uuid,
        site_id: uuid::Uuid,
        ttl: Duration,
    ) -> Result<IssuedCert, PkiError> {
        validate_csr_key_policy(csr_pem)?;

        let mut csr = rcgen::CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::BadCsr {
                reason: format!("CSR rejected: {e}"),
            })?;

        let now = Utc::now();
        let not_before = now - Duration::minutes(BACKDATE_MINUTES);
        let not_after = now + ttl;

        let serial_bytes = random_serial();
        let agent_name = agent_id.to_string();

        csr.params.distinguished_name = rcgen::DistinguishedName::new();
        csr.params
            .distinguished_name
            .push(rcgen::DnType::CommonName, agent_name.as_str());
        csr.params.subject_alt_names =
            vec![rcgen::SanType::DnsName(agent_name.as_str().try_into().map_err(
                |e| PkiError::Internal {
                    reason: format!("agent id not IA5: {e}"),
                },
            )?)];
        csr.params.is_ca = rcgen::IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial_bytes));
        csr.params.not_before = to_offset(not_before)?;
        csr.params.not_after = to_offset(not_after)?;
        csr.params.custom_extensions = vec![
            rcgen::CustomExtension::from_oid_content(
                OID_TENANT_ID,
                self.tenant_id.to_string().into_bytes(),
            ),
            rcgen::CustomExtension::from_oid_content(
                OID_SITE_ID,
                site_id.to_string().into_bytes(),
            ),
        ];

        let cert = csr
            .signed_by(&self.issuer_cert, &self.issuer_key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("CSR signing failed: {e}"),
            })?;

        Ok(IssuedCert {
            certificate_pem: cert.pem(),
            serial: hex::encode(serial_bytes),
            not_before,
            not_after,
        })
    }

    /// Record a revocation and publish a new CRL snapshot.
    ///
    /// Idempotent: revoking an already-revoked serial keeps the first
    /// reason and timestamp but still returns the current CRL.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] if CRL signing fails.
    pub async fn revoke(
        &self,
        serial: &str,
        reason: RevocationReason,
    ) -> Result<Arc<CrlDocument>, PkiError> {
        let mut state = self.state.write().await;
        state
            .revoked
            .entry(serial.to_owned())
            .or_insert_with(|| RevokedEntry {
                reason,
                revoked_at: Utc::now(),
            });
        let next = state.crl_number.saturating_add(1);
        let doc = Arc::new(self.render_crl(&state.revoked, next)?);
        state.crl_number = next;
        state.current = Arc::clone(&doc);
        tracing::info!(serial, %reason, crl_number = next, "certificate revoked");
        Ok(doc)
    }

    /// Seed the revocation set from durable storage (boot path), then
    /// publish CRL version 1.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] if CRL signing fails.
    pub async fn load_revocations(
        &self,
        entries: impl IntoIterator<Item = (String, RevokedEntry)>,
    ) -> Result<(), PkiError> {
        let mut state = self.state.write().await;
        state.revoked.extend(entries);
        let next = state.crl_number.saturating_add(1);
        let doc = Arc::new(self.render_crl(&state.revoked, next)?);
        state.crl_number = next;
        state.current = doc;
        Ok(())
    }

    /// Snapshot of the current CRL. Renders lazily on first read.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] if the initial render fails.
    pub async fn crl(&self) -> Result<Arc<CrlDocument>, PkiError> {
        {
            let state = self.state.read().await;
            if state.crl_number > 0 {
                return Ok(Arc::clone(&state.current));
            }
        }
        let mut state = self.state.write().await;
        if state.crl_number == 0 {
            let doc = Arc::new(self.render_crl(&state.revoked, 1)?);
            state.crl_number = 1;
            state.current = doc;
        }
        Ok(Arc::clone(&state.current))
    }

    /// Validate a presented client certificate: chain to this CA,
    /// validity window, and the revocation set. Extracts the agent id
    /// from the subject CN.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::Verification`] with the precise failure.
    pub async fn verify(&self, cert_pem: &str) -> Result<VerifiedClient, PkiError> {
        let (_, pem) =
            x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| {
                VerifyError::Malformed {
                    reason: format!("PEM parse: {e}"),
                }
            })?;
        let (_, cert) = X509Certificate::from_der(&pem.contents).map_err(|e| {
            VerifyError::Malformed {
                reason: format!("DER parse: {e}"),
            }
        })?;

        let (_, ca) = X509Certificate::from_der(&self.ca_der).map_err(|e| {
            PkiError::Internal {
                reason: format!("CA DER parse: {e}"),
            }
        })?;

        if cert.issuer() != ca.subject()
            || cert.verify_signature(Some(ca.public_key())).is_err()
        {
            return Err(VerifyError::UnknownIssuer.into());
        }

        let now = Utc::now().timestamp();
        if cert.validity().not_before.timestamp() > now {
            return Err(VerifyError::NotYetValid.into());
        }
        if cert.validity().not_after.timestamp() < now {
            return Err(VerifyError::Expired.into());
        }

        let serial = hex::encode(cert.raw_serial());
        if let Some(entry) = self.state.read().await.revoked.get(&serial) {
            return Err(VerifyError::Revoked {
                reason: entry.reason,
            }
            .into());
        }

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .ok_or_else(|| VerifyError::Malformed {
                reason: "no common name".to_owned(),
            })?;
        let agent_id = cn.parse().map_err(|_| VerifyError::Malformed {
            reason: format!("common name '{cn}' is not an agent id"),
        })?;

        let not_before =
            from_timestamp(cert.validity().not_before.timestamp()).ok_or_else(|| {
                VerifyError::Malformed {
                    reason: "not_before out of range".to_owned(),
                }
            })?;
        let not_after =
            from_timestamp(cert.validity().not_after.timestamp()).ok_or_else(|| {
                VerifyError::Malformed {
                    reason: "not_after out of range".to_owned(),
                }
            })?;

        Ok(VerifiedClient {
            agent_id,
            serial,
            not_before,
            not_after,
        })
    }

    fn render_crl(
        &self,
        revoked: &HashMap<String, RevokedEntry>,
        crl_number: u64,
    ) -> Result<CrlDocument, PkiError> {
        let now = Utc::now();
        let next_update = now + Duration::days(CRL_VALIDITY_DAYS);

        let mut revoked_certs = Vec::with_capacity(revoked.len());
        for (serial, entry) in revoked {
            let bytes = hex::decode(serial).map_err(|e| PkiError::Internal {
                reason: format!("stored serial not hex: {e}"),
            })?;
            revoked_certs.push(rcgen::RevokedCertParams {
                serial_number: rcgen::SerialNumber::from_slice(&bytes),
                revocation_time: to_offset(entry.revoked_at)?,
                reason_code: Some(entry.reason.to_rcgen()),
                invalidity_date: None,
            });
        }

        let params = rcgen::CertificateRevocationListParams {
            this_update: to_offset(now)?,
            next_update: to_offset(next_update)?,
            crl_number: rcgen::SerialNumber::from_slice(&crl_number.to_be_bytes()),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        };

        let crl = params
            .signed_by(&self.issuer_cert, &self.issuer_key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("CRL signing failed: {e}"),
            })?;
        let pem = crl.pem().map_err(|e| PkiError::CertGeneration {
            reason: format!("CRL PEM encoding failed: {e}"),
        })?;

        Ok(CrlDocument {
            der: crl.der().as_ref().to_vec(),
            pem,
            crl_number,
            next_update,
        })
    }
}

// ── Rotation window ──────────────────────────────────────────────────

/// Whether a certificate is due for rotation at `now`.
///
/// Due when the remaining lifetime drops under `max(6h, 20% of total)`,
/// or once the window is already past.
#[must_use]
pub fn rotation_due(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let lifetime = not_after - not_before;
    let threshold = lifetime / 5;
    let min_window = Duration::hours(6);
    let window = if threshold > min_window {
        threshold
    } else {
        min_window
    };
    (not_after - now) < window
}

// ── Helpers ──────────────────────────────────────────────────────────

/// 16 bytes of CSPRNG randomness with the top bit cleared so the DER
/// integer encoding stays canonical and round-trips through parsers.
fn random_serial() -> [u8; 16] {
    let mut bytes = *uuid::Uuid::new_v4().as_bytes();
    bytes[0] &= 0x7f;
    if bytes[0] == 0 {
        bytes[0] = 0x01;
    }
    bytes
}

fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime, PkiError> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp()).map_err(|e| {
        PkiError::Internal {
            reason: format!("timestamp out of range: {e}"),
        }
    })
}

fn from_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts, 0)
}

/// Enforce the issuance key policy on a CSR: parseable, self-signed,
/// and carrying a key of at least 2048-bit RSA or 256-bit EC.
fn validate_csr_key_policy(csr_pem: &str) -> Result<(), PkiError> {
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::public_key::PublicKey;

    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes()).map_err(|e| {
        PkiError::BadCsr {
            reason: format!("PEM parse: {e}"),
        }
    })?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents).map_err(|e| {
        PkiError::BadCsr {
            reason: format!("DER parse: {e}"),
        }
    })?;

    csr.verify_signature().map_err(|e| PkiError::BadCsr {
        reason: format!("signature verification failed: {e}"),
    })?;

    match csr
        .certification_request_info
        .subject_pki
        .parsed()
        .map_err(|e| PkiError::BadCsr {
            reason: format!("unreadable public key: {e}"),
        })? {
        PublicKey::RSA(rsa) => {
            let bits = rsa.key_size();
            if bits < MIN_RSA_BITS {
                return Err(PkiError::KeyTooWeak {
                    key_type: "rsa",
                    bits,
                    minimum: MIN_RSA_BITS,
                });
            }
        }
        PublicKey::EC(point) => {
            // Uncompressed point: 1 tag byte + two field elements.
            let bits = point.data().len().saturating_sub(1) / 2 * 8;
            if bits < MIN_EC_BITS {
                return Err(PkiError::KeyTooWeak {
                    key_type: "ec",
                    bits,
                    minimum: MIN_EC_BITS,
                });
            }
        }
        _ => {
            return Err(PkiError::BadCsr {
                reason: "unsupported public key algorithm".to_owned(),
            });
        }
    }

    Ok(())
}

/// Generate a fresh EC keypair and CSR with the given common name.
///
/// Used by the agent at enrollment and rotation; lives here so both
/// sides share one notion of what a well-formed CSR looks like.
///
/// # Errors
///
/// Returns [`PkiError::CertGeneration`] if generation fails.
pub fn generate_key_and_csr(common_name: &str) -> Result<(String, String), PkiError> {
    let key = rcgen::KeyPair::generate().map_err(|e| PkiError::CertGeneration {
        reason: format!("key generation failed: {e}"),
    })?;
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).map_err(|e| {
            PkiError::CertGeneration {
                reason: format!("CSR params failed: {e}"),
            }
        })?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let csr = params
        .serialize_request(&key)
        .map_err(|e| PkiError::CertGeneration {
            reason: format!("CSR serialization failed: {e}"),
        })?;
    let csr_pem = csr.pem().map_err(|e| PkiError::CertGeneration {
        reason: format!("CSR PEM encoding failed: {e}"),
    })?;
    Ok((key.serialize_pem(), csr_pem))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn test_ca() -> CertificateAuthority {
        let tenant = uuid::Uuid::new_v4();
        let (ca, _) = CertificateAuthority::generate_root(tenant, "nkudo tenant root").unwrap();
        ca
    }

    #[tokio::test]
    async fn issue_and_verify_roundtrip() {
        let ca = test_ca();
        let agent_id = uuid::Uuid::new_v4();
        let site_id = uuid::Uuid::new_v4();
        let (_key, csr) = generate_key_and_csr(&agent_id.to_string()).unwrap();

        let issued = ca
            .issue_from_csr(&csr, agent_id, site_id, Duration::hours(24))
            .unwrap();
        assert_eq!(issued.serial.len(), 32);
        assert!(issued.not_before < issued.not_after);

        let verified = ca.verify(&issued.certificate_pem).await.unwrap();
        assert_eq!(verified.agent_id, agent_id);
        assert_eq!(verified.serial, issued.serial);
    }

    #[tokio::test]
    async fn rotation_produces_distinct_serial_same_chain() {
        let ca = test_ca();
        let agent_id = uuid::Uuid::new_v4();
        let site_id = uuid::Uuid::new_v4();

        let (_k1, csr1) = generate_key_and_csr(&agent_id.to_string()).unwrap();
        let (_k2, csr2) = generate_key_and_csr(&agent_id.to_string()).unwrap();
        let first = ca
            .issue_from_csr(&csr1, agent_id, site_id, Duration::hours(24))
            .unwrap();
        let second = ca
            .issue_from_csr(&csr2, agent_id, site_id, Duration::hours(24))
            .unwrap();

        assert_ne!(first.serial, second.serial);
        assert!(ca.verify(&first.certificate_pem).await.is_ok());
        assert!(ca.verify(&second.certificate_pem).await.is_ok());
    }

    #[tokio::test]
    async fn verify_rejects_foreign_issuer() {
        let ca = test_ca();
        let other = test_ca();
        let agent_id = uuid::Uuid::new_v4();
        let (_key, csr) = generate_key_and_csr(&agent_id.to_string()).unwrap();
        let issued = other
            .issue_from_csr(&csr, agent_id, uuid::Uuid::new_v4(), Duration::hours(1))
            .unwrap();

        let err = ca.verify(&issued.certificate_pem).await.unwrap_err();
        assert!(matches!(
            err,
            PkiError::Verification(VerifyError::UnknownIssuer)
        ));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_keeps_first_reason() {
        let ca = test_ca();
        let agent_id = uuid::Uuid::new_v4();
        let (_key, csr) = generate_key_and_csr(&agent_id.to_string()).unwrap();
        let issued = ca
            .issue_from_csr(&csr, agent_id, uuid::Uuid::new_v4(), Duration::hours(1))
            .unwrap();

        let crl1 = ca
            .revoke(&issued.serial, RevocationReason::KeyCompromise)
            .await
            .unwrap();
        let crl2 = ca
            .revoke(&issued.serial, RevocationReason::Superseded)
            .await
            .unwrap();
        assert!(crl2.crl_number > crl1.crl_number);

        let err = ca.verify(&issued.certificate_pem).await.unwrap_err();
        assert!(matches!(
            err,
            PkiError::Verification(VerifyError::Revoked {
                reason: RevocationReason::KeyCompromise
            })
        ));
    }

    #[tokio::test]
    async fn crl_number_is_monotone_and_pem_renders() {
        let ca = test_ca();
        let first = ca.crl().await.unwrap();
        assert_eq!(first.crl_number, 1);
        assert!(first.pem.contains("BEGIN X509 CRL"));

        let after = ca
            .revoke("00112233445566778899aabbccddeeff", RevocationReason::Unspecified)
            .await
            .unwrap();
        assert_eq!(after.crl_number, 2);
        assert!(!after.der.is_empty());
    }

    #[tokio::test]
    async fn rebuild_from_material_still_chains() {
        let tenant = uuid::Uuid::new_v4();
        let (ca, material) =
            CertificateAuthority::generate_root(tenant, "nkudo tenant root").unwrap();
        let agent_id = uuid::Uuid::new_v4();
        let (_key, csr) = generate_key_and_csr(&agent_id.to_string()).unwrap();
        let issued = ca
            .issue_from_csr(&csr, agent_id, uuid::Uuid::new_v4(), Duration::hours(1))
            .unwrap();

        let rebuilt = CertificateAuthority::from_material(tenant, &material).unwrap();
        let issued2 = rebuilt
            .issue_from_csr(&csr, agent_id, uuid::Uuid::new_v4(), Duration::hours(1))
            .unwrap();

        // Certs from before and after the rebuild verify against both.
        assert!(rebuilt.verify(&issued.certificate_pem).await.is_ok());
        assert!(ca.verify(&issued2.certificate_pem).await.is_ok());
    }

    #[test]
    fn csr_policy_rejects_garbage() {
        let err = validate_csr_key_policy("not a csr").unwrap_err();
        assert!(matches!(err, PkiError::BadCsr { .. }));
    }

    #[test]
    fn rotation_window_boundaries() {
        let nb = Utc::now();
        let na = nb + Duration::hours(24);
        // Fresh cert: not due.
        assert!(!rotation_due(nb, na, nb + Duration::hours(1)));
        // 24h lifetime → window = max(6h, 4.8h) = 6h; due at 19h.
        assert!(rotation_due(nb, na, nb + Duration::hours(19)));
        assert!(!rotation_due(nb, na, nb + Duration::hours(17)));
        // Expired cert is always due.
        assert!(rotation_due(nb, na, na + Duration::hours(1)));
        // Long-lived cert: 20% dominates. 10 days → window 2 days.
        let na_long = nb + Duration::days(10);
        assert!(rotation_due(nb, na_long, nb + Duration::days(9)));
        assert!(!rotation_due(nb, na_long, nb + Duration::days(7)));
    }
}
