//! Hypervisor flavors.
//!
//! The provider drives either Cloud Hypervisor or Firecracker. The
//! flavor is a tagged variant, not a trait object: each knows how to
//! render its spawn arguments and how to ask the guest to shut down
//! through its API socket.

use std::path::{Path, PathBuf};

use crate::config::AgentConfig;

/// Default Cloud Hypervisor firmware for disk boot.
const CH_FIRMWARE: &str = "/usr/share/cloud-hypervisor/hypervisor-fw";

/// Which hypervisor binary drives microVMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HypervisorKind {
    CloudHypervisor,
    Firecracker,
}

impl std::fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CloudHypervisor => write!(f, "cloud-hypervisor"),
            Self::Firecracker => write!(f, "firecracker"),
        }
    }
}

impl std::str::FromStr for HypervisorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cloud-hypervisor" | "ch" | "chv" => Ok(Self::CloudHypervisor),
            "firecracker" | "fc" => Ok(Self::Firecracker),
            other => Err(format!("unknown hypervisor: {other}")),
        }
    }
}

/// Filesystem locations of one microVM's artifacts.
#[derive(Debug, Clone)]
pub struct VmPaths {
    pub dir: PathBuf,
    pub disk: PathBuf,
    pub seed_iso: PathBuf,
    pub api_socket: PathBuf,
    pub console_log: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub fc_config: PathBuf,
}

impl VmPaths {
    /// Standard layout under the per-VM directory.
    #[must_use]
    pub fn new(vm_dir: PathBuf) -> Self {
        Self {
            disk: vm_dir.join("disk.img"),
            seed_iso: vm_dir.join("cloud-init.iso"),
            api_socket: vm_dir.join("api.sock"),
            console_log: vm_dir.join("console.log"),
            stdout_log: vm_dir.join("stdout.log"),
            stderr_log: vm_dir.join("stderr.log"),
            fc_config: vm_dir.join("fc.json"),
            dir: vm_dir,
        }
    }
}

impl HypervisorKind {
    /// The binary this flavor spawns.
    #[must_use]
    pub const fn binary_name(self) -> &'static str {
        match self {
            Self::CloudHypervisor => "cloud-hypervisor",
            Self::Firecracker => "firecracker",
        }
    }

    /// Locate the hypervisor binary: explicit override first, then PATH.
    #[must_use]
    pub fn resolve_binary(self, config: &AgentConfig) -> Option<PathBuf> {
        if let Some(explicit) = &config.hypervisor_binary {
            return explicit.exists().then(|| explicit.clone());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(self.binary_name()))
            .find(|candidate| candidate.exists())
    }

    /// Render the spawn arguments for one microVM.
    ///
    /// Firecracker takes everything through a JSON config file the
    /// caller writes to `paths.fc_config` beforehand (see
    /// [`Self::render_firecracker_config`]).
    #[must_use]
    pub fn render_args(
        self,
        paths: &VmPaths,
        vcpu_count: u32,
        memory_mib: u64,
        tap_name: &str,
        kernel: Option<&Path>,
    ) -> Vec<String> {
        match self {
            Self::CloudHypervisor => {
                let mut args = vec![
                    "--api-socket".to_owned(),
                    paths.api_socket.display().to_string(),
                    "--cpus".to_owned(),
                    format!("boot={vcpu_count}"),
                    "--memory".to_owned(),
                    format!("size={memory_mib}M"),
                    "--disk".to_owned(),
                    format!("path={}", paths.disk.display()),
                    format!("path={},readonly=on", paths.seed_iso.display()),
                    "--net".to_owned(),
                    format!("tap={tap_name}"),
                    "--serial".to_owned(),
                    format!("file={}", paths.console_log.display()),
                    "--console".to_owned(),
                    "off".to_owned(),
                ];
                match kernel {
                    Some(kernel) => {
                        args.push("--kernel".to_owned());
                        args.push(kernel.display().to_string());
                        args.push("--cmdline".to_owned());
                        args.push("console=ttyS0 root=/dev/vda rw".to_owned());
                    }
                    None => {
                        args.push("--firmware".to_owned());
                        args.push(CH_FIRMWARE.to_owned());
                    }
                }
                args
            }
            Self::Firecracker => vec![
                "--api-sock".to_owned(),
                paths.api_socket.display().to_string(),
                "--config-file".to_owned(),
                paths.fc_config.display().to_string(),
            ],
        }
    }

    /// Firecracker machine config JSON.
    #[must_use]
    pub fn render_firecracker_config(
        paths: &VmPaths,
        vcpu_count: u32,
        memory_mib: u64,
        tap_name: &str,
        kernel: &Path,
    ) -> serde_json::Value {
        serde_json::json!({
            "boot-source": {
                "kernel_image_path": kernel.display().to_string(),
                "boot_args": "console=ttyS0 reboot=k panic=1 root=/dev/vda rw"
            },
            "drives": [
                {
                    "drive_id": "rootfs",
                    "path_on_host": paths.disk.display().to_string(),
                    "is_root_device": true,
                    "is_read_only": false
                },
                {
                    "drive_id": "seed",
                    "path_on_host": paths.seed_iso.display().to_string(),
                    "is_root_device": false,
                    "is_read_only": true
                }
            ],
            "network-interfaces": [
                {
                    "iface_id": "eth0",
                    "host_dev_name": tap_name
                }
            ],
            "machine-config": {
                "vcpu_count": vcpu_count,
                "mem_size_mib": memory_mib
            }
        })
    }

    /// Arguments for a graceful shutdown request through the API
    /// socket, when the flavor supports one (`None` means go straight
    /// to signals).
    #[must_use]
    pub fn graceful_shutdown_command(self, paths: &VmPaths) -> Option<(String, Vec<String>)> {
        match self {
            Self::CloudHypervisor => Some((
                "ch-remote".to_owned(),
                vec![
                    "--api-socket".to_owned(),
                    paths.api_socket.display().to_string(),
                    "shutdown-vm".to_owned(),
                ],
            )),
            // Firecracker's API has no guest-cooperative shutdown;
            // SIGTERM is the graceful path.
            Self::Firecracker => None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn kind_roundtrips_and_accepts_aliases() {
        assert_eq!(
            "cloud-hypervisor".parse::<HypervisorKind>().unwrap(),
            HypervisorKind::CloudHypervisor
        );
        assert_eq!(
            "fc".parse::<HypervisorKind>().unwrap(),
            HypervisorKind::Firecracker
        );
        assert!("qemu".parse::<HypervisorKind>().is_err());
    }

    #[test]
    fn ch_args_cover_disk_net_and_serial() {
        let paths = VmPaths::new(PathBuf::from("/tmp/vm"));
        let args = HypervisorKind::CloudHypervisor.render_args(&paths, 2, 512, "nkabc", None);
        let joined = args.join(" ");
        assert!(joined.contains("--cpus boot=2"));
        assert!(joined.contains("size=512M"));
        assert!(joined.contains("path=/tmp/vm/disk.img"));
        assert!(joined.contains("tap=nkabc"));
        assert!(joined.contains("--firmware"));

        let with_kernel = HypervisorKind::CloudHypervisor.render_args(
            &paths,
            2,
            512,
            "nkabc",
            Some(Path::new("/boot/vmlinux")),
        );
        assert!(with_kernel.join(" ").contains("--kernel /boot/vmlinux"));
    }

    #[test]
    fn fc_config_names_both_drives() {
        let paths = VmPaths::new(PathBuf::from("/tmp/vm"));
        let cfg = HypervisorKind::render_firecracker_config(
            &paths,
            1,
            256,
            "nkdef",
            Path::new("/boot/vmlinux"),
        );
        assert_eq!(cfg["machine-config"]["vcpu_count"], 1);
        assert_eq!(cfg["drives"][0]["is_root_device"], true);
        assert_eq!(cfg["network-interfaces"][0]["host_dev_name"], "nkdef");
    }

    #[test]
    fn only_ch_has_api_shutdown() {
        let paths = VmPaths::new(PathBuf::from("/tmp/vm"));
        assert!(HypervisorKind::CloudHypervisor
            .graceful_shutdown_command(&paths)
            .is_some());
        assert!(HypervisorKind::Firecracker
            .graceful_shutdown_command(&paths)
            .is_none());
    }
}
