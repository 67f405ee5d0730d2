//! Agent configuration and on-disk layout.
//!
//! Loaded from environment variables; the CLI can override the control
//! plane URL and data directory per invocation. Everything the agent
//! persists lives under one data root:
//!
//! ```text
//! <data_dir>/
//!   state/edge-state.json          identity, microVM and action records
//!   pki/{ca.crt, client.crt, client.key}
//!   images/<sha256>.img            content-addressed base image cache
//!   vms/<vm_id>/{state disk, seed ISO, logs, api socket, pid file}
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::provider::hypervisor::HypervisorKind;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the control plane.
    pub control_plane_url: String,
    /// Data root (default `/var/lib/nkudo-edge`).
    pub data_dir: PathBuf,
    /// Optional 32-byte key enabling the encrypted state store.
    pub state_key: Option<[u8; 32]>,
    /// Which hypervisor drives microVMs on this host.
    pub hypervisor: HypervisorKind,
    /// Override for the hypervisor binary path.
    pub hypervisor_binary: Option<PathBuf>,
    /// Bridge TAP devices attach to.
    pub bridge: String,
    /// Base image the root disk of new microVMs is cloned from.
    pub base_image: PathBuf,
    /// Guest kernel image (required by Firecracker, optional for
    /// Cloud Hypervisor which can firmware-boot the disk).
    pub kernel_image: Option<PathBuf>,
    /// HTTP timeout for heartbeat and other control-plane calls.
    pub http_timeout: Duration,
    /// Cert rotation check interval.
    pub rotation_check_interval: Duration,
    /// Graceful stop window before SIGKILL.
    pub stop_timeout: Duration,
    /// Per-operation executor timeout.
    pub operation_timeout: Duration,
    /// Executor timeout for create operations (disk clone + seed build).
    pub create_timeout: Duration,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CONTROL_PLANE_URL` — control plane base URL (default `http://127.0.0.1:8700`)
    /// - `NKUDO_DATA_DIR` — data root (default `/var/lib/nkudo-edge`)
    /// - `NKUDO_STATE_KEY` — 64 hex chars enabling encrypted state at rest
    /// - `NKUDO_HYPERVISOR` — `cloud-hypervisor` (default) or `firecracker`
    /// - `NKUDO_HYPERVISOR_BIN` — explicit hypervisor binary path
    /// - `NKUDO_BRIDGE` — bridge name (default `nkbr0`)
    /// - `NKUDO_BASE_IMAGE` — base root disk image path
    /// - `NKUDO_HTTP_TIMEOUT_SECS` — control-plane HTTP timeout (default `30`)
    /// - `NKUDO_ROTATION_CHECK_SECS` — rotator tick (default `300`)
    /// - `NKUDO_STOP_TIMEOUT_SECS` — graceful stop window (default `15`)
    #[must_use]
    pub fn from_env() -> Self {
        let control_plane_url = std::env::var("CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8700".to_owned());

        let data_dir = std::env::var("NKUDO_DATA_DIR")
            .map_or_else(|_| PathBuf::from("/var/lib/nkudo-edge"), PathBuf::from);

        let state_key = std::env::var("NKUDO_STATE_KEY").ok().and_then(|hex_key| {
            let bytes = hex::decode(hex_key.trim()).ok()?;
            <[u8; 32]>::try_from(bytes.as_slice()).ok()
        });

        let hypervisor = std::env::var("NKUDO_HYPERVISOR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(HypervisorKind::CloudHypervisor);

        let hypervisor_binary = std::env::var("NKUDO_HYPERVISOR_BIN")
            .ok()
            .map(PathBuf::from);

        let bridge = std::env::var("NKUDO_BRIDGE").unwrap_or_else(|_| "nkbr0".to_owned());

        let base_image = std::env::var("NKUDO_BASE_IMAGE").map_or_else(
            |_| PathBuf::from("/var/lib/nkudo-edge/base/rootfs.img"),
            PathBuf::from,
        );

        let kernel_image = std::env::var("NKUDO_KERNEL_IMAGE").ok().map(PathBuf::from);

        Self {
            control_plane_url,
            data_dir,
            state_key,
            hypervisor,
            hypervisor_binary,
            bridge,
            base_image,
            kernel_image,
            http_timeout: Duration::from_secs(env_u64("NKUDO_HTTP_TIMEOUT_SECS", 30)),
            rotation_check_interval: Duration::from_secs(env_u64(
                "NKUDO_ROTATION_CHECK_SECS",
                300,
            )),
            stop_timeout: Duration::from_secs(env_u64("NKUDO_STOP_TIMEOUT_SECS", 15)),
            operation_timeout: Duration::from_secs(60),
            create_timeout: Duration::from_secs(120),
        }
    }

    /// `state/edge-state.json`.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state").join("edge-state.json")
    }

    /// Directory holding the client key material, mode 0700.
    #[must_use]
    pub fn pki_dir(&self) -> PathBuf {
        self.data_dir.join("pki")
    }

    /// Content-addressed base image cache.
    #[must_use]
    pub fn image_cache_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Per-VM working directory.
    #[must_use]
    pub fn vm_dir(&self, vm_id: uuid::Uuid) -> PathBuf {
        self.data_dir.join("vms").join(vm_id.to_string())
    }

    /// Path of a file inside the pki directory.
    #[must_use]
    pub fn pki_file(&self, name: &str) -> PathBuf {
        self.pki_dir().join(name)
    }
}

/// Names of the credential triple under `pki/`.
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Restrict a path to owner-only access.
///
/// # Errors
///
/// Propagates the underlying `chmod` failure.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// No-op off unix.
///
/// # Errors
///
/// Never fails.
#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
