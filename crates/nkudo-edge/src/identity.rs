//! Agent key material and host identity.
//!
//! The credential triple (`client.key`, `client.crt`, `ca.crt`) is
//! installed with write-to-temp + rename inside the pki directory, so a
//! crash mid-rotation leaves the previous triple intact. Keys are 0600,
//! certificates 0644, the directory 0700.

use std::path::Path;

use chrono::{DateTime, Utc};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::{
    AgentConfig, set_mode, CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE,
};

/// Errors from credential handling.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Filesystem failure.
    #[error("credential io error: {0}")]
    Io(#[from] std::io::Error),

    /// A PEM/DER document could not be parsed.
    #[error("malformed certificate: {reason}")]
    Malformed { reason: String },

    /// The renewed certificate failed validation.
    #[error("renewed certificate rejected: {reason}")]
    Rejected { reason: String },
}

/// Validity window of a certificate on disk or from the wire.
#[derive(Debug, Clone, Copy)]
pub struct CertWindow {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Parse the validity window out of a PEM certificate.
///
/// # Errors
///
/// Returns [`IdentityError::Malformed`] for unparseable input.
pub fn cert_window(cert_pem: &str) -> Result<CertWindow, IdentityError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| {
        IdentityError::Malformed {
            reason: format!("PEM parse: {e}"),
        }
    })?;
    let (_, cert) =
        X509Certificate::from_der(&pem.contents).map_err(|e| IdentityError::Malformed {
            reason: format!("DER parse: {e}"),
        })?;

    let not_before = DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| IdentityError::Malformed {
            reason: "not_before out of range".to_owned(),
        })?;
    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| IdentityError::Malformed {
            reason: "not_after out of range".to_owned(),
        })?;

    Ok(CertWindow {
        not_before,
        not_after,
    })
}

/// Validate a renewal response: the new certificate must chain to the
/// returned CA and its window must cover `now`.
///
/// # Errors
///
/// Returns [`IdentityError::Rejected`] with the failing check.
pub fn validate_renewal(
    cert_pem: &str,
    ca_pem: &str,
    now: DateTime<Utc>,
) -> Result<CertWindow, IdentityError> {
    let window = cert_window(cert_pem)?;
    if window.not_after <= now {
        return Err(IdentityError::Rejected {
            reason: "certificate is already expired".to_owned(),
        });
    }

    let (_, cert_doc) =
        x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| {
            IdentityError::Malformed {
                reason: format!("PEM parse: {e}"),
            }
        })?;
    let (_, ca_doc) = x509_parser::pem::parse_x509_pem(ca_pem.as_bytes()).map_err(|e| {
        IdentityError::Malformed {
            reason: format!("CA PEM parse: {e}"),
        }
    })?;
    let (_, cert) =
        X509Certificate::from_der(&cert_doc.contents).map_err(|e| IdentityError::Malformed {
            reason: format!("DER parse: {e}"),
        })?;
    let (_, ca) =
        X509Certificate::from_der(&ca_doc.contents).map_err(|e| IdentityError::Malformed {
            reason: format!("CA DER parse: {e}"),
        })?;

    if cert.issuer() != ca.subject() {
        return Err(IdentityError::Rejected {
            reason: "issuer does not match returned CA".to_owned(),
        });
    }
    cert.verify_signature(Some(ca.public_key())).map_err(|_| {
        IdentityError::Rejected {
            reason: "signature does not chain to returned CA".to_owned(),
        }
    })?;

    Ok(window)
}

/// Atomically install the credential triple.
///
/// Each file is written to a temp name in the pki directory and renamed
/// into place; rename within one directory (and filesystem) is the
/// commit point, so partial failure leaves the old triple usable.
///
/// # Errors
///
/// Propagates filesystem failures.
pub fn install_credentials(
    config: &AgentConfig,
    key_pem: &str,
    cert_pem: &str,
    ca_pem: &str,
) -> Result<(), IdentityError> {
    let dir = config.pki_dir();
    std::fs::create_dir_all(&dir)?;
    set_mode(&dir, 0o700)?;

    write_via_rename(&dir, CLIENT_KEY_FILE, key_pem.as_bytes(), 0o600)?;
    write_via_rename(&dir, CLIENT_CERT_FILE, cert_pem.as_bytes(), 0o644)?;
    write_via_rename(&dir, CA_CERT_FILE, ca_pem.as_bytes(), 0o644)?;
    Ok(())
}

/// Remove the credential triple (unenroll).
///
/// # Errors
///
/// Propagates filesystem failures other than absence.
pub fn remove_credentials(config: &AgentConfig) -> Result<(), IdentityError> {
    for name in [CLIENT_KEY_FILE, CLIENT_CERT_FILE, CA_CERT_FILE] {
        match std::fs::remove_file(config.pki_file(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read the current client certificate PEM, if present.
///
/// # Errors
///
/// Propagates filesystem failures other than absence.
pub fn read_client_cert(config: &AgentConfig) -> Result<Option<String>, IdentityError> {
    match std::fs::read_to_string(config.pki_file(CLIENT_CERT_FILE)) {
        Ok(pem) => Ok(Some(pem)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_via_rename(
    dir: &Path,
    name: &str,
    contents: &[u8],
    mode: u32,
) -> Result<(), IdentityError> {
    use std::io::Write;

    let tmp = dir.join(format!(".{name}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    set_mode(&tmp, mode)?;
    std::fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

// ── Host facts ───────────────────────────────────────────────────────

/// Stable fingerprint of this host, derived from the machine id.
#[must_use]
pub fn host_fingerprint() -> String {
    let machine_id = std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .unwrap_or_else(|_| hostname());
    nkudo_core::secrets::hash_secret(machine_id.trim())
}

/// The host's name.
#[must_use]
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Collect host capacity and platform facts for the heartbeat.
#[must_use]
pub fn collect_facts(config: &AgentConfig) -> nkudo_core::wire::HostFacts {
    nkudo_core::wire::HostFacts {
        hostname: hostname(),
        cpu_cores: std::thread::available_parallelism().map_or(1, |n| n.get() as u32),
        memory_bytes: total_memory_bytes(),
        storage_bytes: data_dir_capacity_bytes(config),
        kvm_available: Path::new("/dev/kvm").exists(),
        chv_available: config.hypervisor.resolve_binary(config).is_some(),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        kernel_version: std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|s| s.trim().to_owned())
            .unwrap_or_default(),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
    }
}

fn total_memory_bytes() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb.saturating_mul(1024))
}

fn data_dir_capacity_bytes(config: &AgentConfig) -> u64 {
    // `df` keeps this free of platform-specific syscalls; absence of
    // the tool just zeroes the fact.
    let out = std::process::Command::new("df")
        .args(["--output=size", "-B1"])
        .arg(&config.data_dir)
        .output();
    let Ok(out) = out else { return 0 };
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .nth(1)
        .and_then(|l| l.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn issued_pair() -> (String, String) {
        let tenant = uuid::Uuid::new_v4();
        let (ca, _) =
            nkudo_core::pki::CertificateAuthority::generate_root(tenant, "test root")
                .unwrap();
        let agent_id = uuid::Uuid::new_v4();
        let (_key, csr) =
            nkudo_core::pki::generate_key_and_csr(&agent_id.to_string()).unwrap();
        let issued = ca
            .issue_from_csr(&csr, agent_id, uuid::Uuid::new_v4(), chrono::Duration::hours(24))
            .unwrap();
        (issued.certificate_pem, ca.ca_pem().to_owned())
    }

    #[test]
    fn window_parses_and_renewal_validates() {
        let (cert, ca) = issued_pair();
        let window = cert_window(&cert).unwrap();
        assert!(window.not_before < window.not_after);
        assert!(validate_renewal(&cert, &ca, Utc::now()).is_ok());
    }

    #[test]
    fn renewal_rejects_foreign_ca() {
        let (cert, _) = issued_pair();
        let (_, other_ca) = issued_pair();
        let err = validate_renewal(&cert, &other_ca, Utc::now()).unwrap_err();
        assert!(matches!(err, IdentityError::Rejected { .. }));
    }

    #[test]
    fn install_is_atomic_and_survives_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        install_credentials(&config, "key-1", "cert-1", "ca-1").unwrap();
        assert_eq!(
            std::fs::read_to_string(config.pki_file(CLIENT_KEY_FILE)).unwrap(),
            "key-1"
        );

        // A stale temp file from an interrupted rotation must not
        // shadow the installed triple.
        std::fs::write(config.pki_dir().join(".client.crt.tmp"), "garbage").unwrap();
        install_credentials(&config, "key-2", "cert-2", "ca-2").unwrap();
        assert_eq!(
            std::fs::read_to_string(config.pki_file(CLIENT_CERT_FILE)).unwrap(),
            "cert-2"
        );
    }

    #[cfg(unix)]
    #[test]
    fn key_is_owner_only_certs_are_world_readable() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        install_credentials(&config, "k", "c", "a").unwrap();

        let key_mode =
            std::fs::metadata(config.pki_file(CLIENT_KEY_FILE)).unwrap().mode() & 0o777;
        assert_eq!(key_mode, 0o600);
        let cert_mode =
            std::fs::metadata(config.pki_file(CLIENT_CERT_FILE)).unwrap().mode() & 0o777;
        assert_eq!(cert_mode, 0o644);
        let dir_mode = std::fs::metadata(config.pki_dir()).unwrap().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    fn test_config(root: &Path) -> AgentConfig {
        AgentConfig {
            control_plane_url: "http://127.0.0.1:1".to_owned(),
            data_dir: root.to_owned(),
            state_key: None,
            hypervisor: crate::provider::hypervisor::HypervisorKind::CloudHypervisor,
            hypervisor_binary: None,
            bridge: "nkbr0".to_owned(),
            base_image: root.join("base.img"),
            kernel_image: None,
            http_timeout: std::time::Duration::from_secs(1),
            rotation_check_interval: std::time::Duration::from_secs(300),
            stop_timeout: std::time::Duration::from_secs(15),
            operation_timeout: std::time::Duration::from_secs(60),
            create_timeout: std::time::Duration::from_secs(120),
        }
    }
}
