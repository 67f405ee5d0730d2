//! MicroVM provider.
//!
//! Drives one hypervisor (Cloud Hypervisor or Firecracker) through the
//! lifecycle `creating → stopped ↔ running → deleting`. Every mutation
//! of the persisted metadata goes through the state store's mutex and
//! its temp+rename discipline. A deleted VM leaves a `deleting`
//! tombstone record so the next heartbeat can report the terminal
//! transition before the record is dropped.

pub mod hypervisor;
pub mod image;
pub mod net;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use nkudo_core::error::{SpecError, TransitionError};
use nkudo_core::microvm::{validate_transition, VmSpec, VmState};
use nkudo_core::wire::VmStatusReport;

use crate::config::AgentConfig;
use crate::statestore::{StateStore, StateStoreError, VmRecord};
use hypervisor::{HypervisorKind, VmPaths};

/// How often the stop path polls for process exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The requested lifecycle transition is forbidden.
    #[error(transparent)]
    InvalidState(#[from] TransitionError),

    /// The VM spec failed validation.
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// No record of this VM exists.
    #[error("vm not found: {vm_id}")]
    NotFound { vm_id: Uuid },

    /// A host resource (image, TAP, ISO tool) was unavailable.
    #[error("host resource failure: {detail}")]
    HostResource { detail: String },

    /// The hypervisor binary failed to spawn or misbehaved.
    #[error("hypervisor failure: {detail}")]
    Hypervisor { detail: String },

    /// Persisting metadata failed.
    #[error("state store failure: {0}")]
    State(#[from] StateStoreError),
}

impl ProviderError {
    /// Stable short code for execution reports.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "invalid_state",
            Self::Spec(_) => "bad_input",
            Self::NotFound { .. } => "not_found",
            Self::HostResource { .. } | Self::Hypervisor { .. } => "unavailable",
            Self::State(_) => "internal",
        }
    }
}

/// The microVM provider for this host.
pub struct Provider {
    config: AgentConfig,
    store: Arc<StateStore>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("hypervisor", &self.config.hypervisor)
            .finish_non_exhaustive()
    }
}

impl Provider {
    #[must_use]
    pub fn new(config: AgentConfig, store: Arc<StateStore>) -> Self {
        Self { config, store }
    }

    fn paths(&self, vm_id: Uuid) -> VmPaths {
        VmPaths::new(self.config.vm_dir(vm_id))
    }

    /// Create a microVM: validate the spec, clone the root disk from
    /// the content-addressed cache, build the cloud-init seed, allocate
    /// the TAP device, and persist the metadata.
    ///
    /// Re-creating an already created VM is a no-op success.
    ///
    /// # Errors
    ///
    /// See [`ProviderError`]; on failure the record lands in `error`
    /// with the detail preserved.
    pub async fn create(&self, vm_id: Uuid, spec: &VmSpec) -> Result<(), ProviderError> {
        let host_limit = std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        spec.validate(host_limit)?;

        let snapshot = self.store.snapshot().await;
        if let Some(existing) = snapshot.microvms.get(&vm_id) {
            match existing.state {
                VmState::Stopped | VmState::Running => return Ok(()),
                VmState::Creating | VmState::Error => {} // retry the build
                VmState::Deleting => {
                    return Err(TransitionError::Invalid {
                        from: VmState::Deleting,
                        to: VmState::Creating,
                    }
                    .into());
                }
            }
        }

        let paths = self.paths(vm_id);
        let tap = net::tap_name(vm_id);

        // Record the attempt before touching host resources.
        self.store
            .mutate(|state| {
                state.microvms.insert(
                    vm_id,
                    VmRecord {
                        id: vm_id,
                        name: spec.name.clone(),
                        state: VmState::Creating,
                        vcpu_count: spec.vcpu_count,
                        memory_mib: spec.memory_mib,
                        disk_path: paths.disk.clone(),
                        seed_iso_path: paths.seed_iso.clone(),
                        api_socket_path: paths.api_socket.clone(),
                        console_path: paths.console_log.clone(),
                        tap_name: tap.clone(),
                        pid: None,
                        last_error: None,
                        created_at: Utc::now(),
                    },
                );
            })
            .await?;

        let result = self.build_vm(vm_id, spec, &paths, &tap).await;

        match result {
            Ok(()) => {
                self.set_state(vm_id, VmState::Stopped, None).await?;
                tracing::info!(%vm_id, name = %spec.name, "microVM created");
                Ok(())
            }
            Err(e) => {
                self.set_state(vm_id, VmState::Error, Some(e.to_string())).await?;
                Err(e)
            }
        }
    }

    async fn build_vm(
        &self,
        vm_id: Uuid,
        spec: &VmSpec,
        paths: &VmPaths,
        tap: &str,
    ) -> Result<(), ProviderError> {
        std::fs::create_dir_all(&paths.dir).map_err(|e| ProviderError::HostResource {
            detail: format!("vm dir: {e}"),
        })?;

        let cached = image::ensure_cached(&self.config.base_image, &self.config.image_cache_dir())?;
        image::clone_root_disk(&cached, &paths.disk)?;
        image::build_seed_iso(&paths.dir, &paths.seed_iso, vm_id, &spec.name).await?;
        net::create_tap(tap, &self.config.bridge).await?;
        Ok(())
    }

    /// Start a stopped microVM. Starting one that is already running
    /// with a live process is a no-op success.
    ///
    /// A supervisor task watches the child and flips the record back to
    /// `stopped` when the persisted pid matches the exited process.
    ///
    /// # Errors
    ///
    /// See [`ProviderError`].
    pub async fn start(self: &Arc<Self>, vm_id: Uuid) -> Result<(), ProviderError> {
        let record = self
            .record(vm_id)
            .await?
            .ok_or(ProviderError::NotFound { vm_id })?;

        if record.state == VmState::Running {
            if let Some(pid) = record.pid {
                if pid_alive(pid) {
                    return Ok(());
                }
            }
            // Stale running record with a dead process — fall through
            // and respawn.
        } else {
            validate_transition(record.state, VmState::Running)?;
        }

        let kind = self.config.hypervisor;
        let binary =
            kind.resolve_binary(&self.config)
                .ok_or_else(|| ProviderError::HostResource {
                    detail: format!("{} binary not found", kind.binary_name()),
                })?;

        let paths = self.paths(vm_id);

        if kind == HypervisorKind::Firecracker {
            let kernel = self.config.kernel_image.as_deref().ok_or_else(|| {
                ProviderError::HostResource {
                    detail: "firecracker requires NKUDO_KERNEL_IMAGE".to_owned(),
                }
            })?;
            let fc_config = HypervisorKind::render_firecracker_config(
                &paths,
                record.vcpu_count,
                record.memory_mib,
                &record.tap_name,
                kernel,
            );
            std::fs::write(
                &paths.fc_config,
                serde_json::to_vec_pretty(&fc_config).map_err(|e| {
                    ProviderError::Hypervisor {
                        detail: format!("fc config: {e}"),
                    }
                })?,
            )
            .map_err(|e| ProviderError::HostResource {
                detail: format!("fc config write: {e}"),
            })?;
        }

        // A fresh start owns the API socket path.
        let _ = std::fs::remove_file(&paths.api_socket);

        let args = kind.render_args(
            &paths,
            record.vcpu_count,
            record.memory_mib,
            &record.tap_name,
            self.config.kernel_image.as_deref(),
        );

        let stdout = log_file(&paths.stdout_log)?;
        let stderr = log_file(&paths.stderr_log)?;

        let mut child = tokio::process::Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| ProviderError::Hypervisor {
                detail: format!("spawn {}: {e}", binary.display()),
            })?;

        let pid = child.id().ok_or_else(|| ProviderError::Hypervisor {
            detail: "child exited before pid capture".to_owned(),
        })?;

        self.store
            .mutate(|state| {
                if let Some(vm) = state.microvms.get_mut(&vm_id) {
                    vm.state = VmState::Running;
                    vm.pid = Some(pid);
                    vm.last_error = None;
                }
            })
            .await?;

        tracing::info!(%vm_id, pid, hypervisor = %kind, "microVM started");

        // Supervisor: mark stopped when this exact process exits.
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit = status
                .as_ref()
                .map(std::string::ToString::to_string)
                .unwrap_or_else(|e| e.to_string());
            tracing::info!(%vm_id, pid, exit = %exit, "hypervisor child exited");
            let result = store
                .mutate(|state| {
                    if let Some(vm) = state.microvms.get_mut(&vm_id) {
                        if vm.pid == Some(pid) && vm.state == VmState::Running {
                            vm.state = VmState::Stopped;
                            vm.pid = None;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                tracing::error!(%vm_id, error = %e, "failed to persist child exit");
            }
        });

        Ok(())
    }

    /// Stop a running microVM: graceful shutdown through the API
    /// socket (or SIGTERM), escalating to SIGKILL after the stop
    /// timeout. Stopping a stopped VM is a no-op success.
    ///
    /// # Errors
    ///
    /// See [`ProviderError`].
    pub async fn stop(&self, vm_id: Uuid) -> Result<(), ProviderError> {
        let record = self
            .record(vm_id)
            .await?
            .ok_or(ProviderError::NotFound { vm_id })?;

        if record.state == VmState::Stopped {
            return Ok(());
        }
        validate_transition(record.state, VmState::Stopped)?;

        let Some(pid) = record.pid else {
            self.set_state(vm_id, VmState::Stopped, None).await?;
            return Ok(());
        };

        let paths = self.paths(vm_id);
        if let Some((cmd, args)) = self.config.hypervisor.graceful_shutdown_command(&paths) {
            let _ = tokio::process::Command::new(cmd).args(args).output().await;
        } else {
            signal(pid, "-TERM").await;
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        while pid_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if pid_alive(pid) {
            tracing::warn!(%vm_id, pid, "graceful stop timed out, escalating to SIGKILL");
            signal(pid, "-KILL").await;
            let hard_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while pid_alive(pid) && tokio::time::Instant::now() < hard_deadline {
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
        }

        self.store
            .mutate(|state| {
                if let Some(vm) = state.microvms.get_mut(&vm_id) {
                    vm.state = VmState::Stopped;
                    vm.pid = None;
                }
            })
            .await?;

        tracing::info!(%vm_id, "microVM stopped");
        Ok(())
    }

    /// Delete a microVM: ensure it is stopped, remove the TAP device
    /// and the VM directory, and leave a `deleting` tombstone for the
    /// next heartbeat to report.
    ///
    /// # Errors
    ///
    /// See [`ProviderError`].
    pub async fn delete(&self, vm_id: Uuid) -> Result<(), ProviderError> {
        let Some(record) = self.record(vm_id).await? else {
            // Nothing to delete — the work was already done.
            return Ok(());
        };

        if record.state == VmState::Running {
            self.stop(vm_id).await?;
        }
        let current = self
            .record(vm_id)
            .await?
            .map_or(VmState::Stopped, |r| r.state);
        validate_transition(current, VmState::Deleting)?;

        net::delete_tap(&record.tap_name).await?;

        let paths = self.paths(vm_id);
        if paths.dir.exists() {
            std::fs::remove_dir_all(&paths.dir).map_err(|e| ProviderError::HostResource {
                detail: format!("removing vm dir: {e}"),
            })?;
        }

        self.set_state(vm_id, VmState::Deleting, None).await?;
        tracing::info!(%vm_id, "microVM deleted");
        Ok(())
    }

    /// Current status reports for the heartbeat, reconciling records
    /// against live processes.
    pub async fn statuses(&self) -> Result<Vec<VmStatusReport>, ProviderError> {
        let snapshot = self.store.snapshot().await;
        let mut reports = Vec::with_capacity(snapshot.microvms.len());
        for record in snapshot.microvms.values() {
            let state = match (record.state, record.pid) {
                // The supervisor normally catches exits; this covers an
                // agent restart that orphaned the record.
                (VmState::Running, Some(pid)) if !pid_alive(pid) => VmState::Stopped,
                (VmState::Running, None) => VmState::Stopped,
                (state, _) => state,
            };
            reports.push(VmStatusReport {
                vm_id: record.id,
                name: record.name.clone(),
                state,
                vcpu_count: record.vcpu_count,
                memory_mib: record.memory_mib,
                last_error: record.last_error.clone(),
            });
        }
        Ok(reports)
    }

    /// Drop tombstone records whose deletion has been reported.
    ///
    /// # Errors
    ///
    /// Propagates persist failures.
    pub async fn prune_tombstones(&self) -> Result<(), ProviderError> {
        self.store
            .mutate(|state| {
                state
                    .microvms
                    .retain(|_, vm| vm.state != VmState::Deleting);
            })
            .await?;
        Ok(())
    }

    /// IDs of currently running microVMs (shutdown drain).
    pub async fn running_vms(&self) -> Vec<Uuid> {
        self.store
            .snapshot()
            .await
            .microvms
            .values()
            .filter(|vm| vm.state == VmState::Running)
            .map(|vm| vm.id)
            .collect()
    }

    async fn record(&self, vm_id: Uuid) -> Result<Option<VmRecord>, ProviderError> {
        Ok(self.store.snapshot().await.microvms.get(&vm_id).cloned())
    }

    async fn set_state(
        &self,
        vm_id: Uuid,
        state: VmState,
        last_error: Option<String>,
    ) -> Result<(), ProviderError> {
        self.store
            .mutate(|s| {
                if let Some(vm) = s.microvms.get_mut(&vm_id) {
                    vm.state = state;
                    vm.last_error = last_error;
                }
            })
            .await?;
        Ok(())
    }
}

/// Whether a process is still alive, by `/proc` lookup.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

async fn signal(pid: u32, sig: &str) {
    let _ = tokio::process::Command::new("kill")
        .arg(sig)
        .arg(pid.to_string())
        .output()
        .await;
}

fn log_file(path: &Path) -> Result<std::fs::File, ProviderError> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ProviderError::HostResource {
            detail: format!("log file {}: {e}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn error_codes_match_the_taxonomy() {
        let invalid: ProviderError = TransitionError::Invalid {
            from: VmState::Deleting,
            to: VmState::Running,
        }
        .into();
        assert_eq!(invalid.code(), "invalid_state");

        let spec: ProviderError = SpecError::Memory {
            requested: 32,
            minimum: 64,
        }
        .into();
        assert_eq!(spec.code(), "bad_input");

        assert_eq!(
            ProviderError::NotFound {
                vm_id: Uuid::new_v4()
            }
            .code(),
            "not_found"
        );
        assert_eq!(
            ProviderError::HostResource {
                detail: String::new()
            }
            .code(),
            "unavailable"
        );
    }

    #[tokio::test]
    async fn create_rejects_bad_specs_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            StateStore::open(&dir.path().join("state.json"), None).unwrap(),
        );
        let config = test_config(dir.path());
        let provider = Provider::new(config, Arc::clone(&store));

        let err = provider
            .create(
                Uuid::new_v4(),
                &VmSpec {
                    name: String::new(),
                    vcpu_count: 1,
                    memory_mib: 256,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_input");
        assert!(store.snapshot().await.microvms.is_empty());
    }

    #[tokio::test]
    async fn create_with_missing_base_image_lands_in_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            StateStore::open(&dir.path().join("state.json"), None).unwrap(),
        );
        let config = test_config(dir.path());
        let provider = Provider::new(config, Arc::clone(&store));
        let vm_id = Uuid::new_v4();

        let err = provider
            .create(
                vm_id,
                &VmSpec {
                    name: "vm1".to_owned(),
                    vcpu_count: 1,
                    memory_mib: 256,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unavailable");

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.microvms[&vm_id].state, VmState::Error);
        assert!(snapshot.microvms[&vm_id].last_error.is_some());
    }

    #[tokio::test]
    async fn stop_of_missing_vm_is_not_found_and_start_needs_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            StateStore::open(&dir.path().join("state.json"), None).unwrap(),
        );
        let provider = Arc::new(Provider::new(test_config(dir.path()), store));
        let vm_id = Uuid::new_v4();

        assert!(matches!(
            provider.stop(vm_id).await.unwrap_err(),
            ProviderError::NotFound { .. }
        ));
        assert!(matches!(
            provider.start(vm_id).await.unwrap_err(),
            ProviderError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn delete_of_unknown_vm_is_idempotent_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            StateStore::open(&dir.path().join("state.json"), None).unwrap(),
        );
        let provider = Provider::new(test_config(dir.path()), store);
        provider.delete(Uuid::new_v4()).await.unwrap();
    }

    fn test_config(root: &Path) -> AgentConfig {
        AgentConfig {
            control_plane_url: "http://127.0.0.1:1".to_owned(),
            data_dir: root.to_owned(),
            state_key: None,
            hypervisor: HypervisorKind::CloudHypervisor,
            hypervisor_binary: None,
            bridge: "nkbr0".to_owned(),
            base_image: root.join("missing-base.img"),
            kernel_image: None,
            http_timeout: Duration::from_secs(1),
            rotation_check_interval: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(60),
            create_timeout: Duration::from_secs(120),
        }
    }
}
