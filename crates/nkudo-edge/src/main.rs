//! nkudo edge agent CLI.
//!
//! One binary per host. `run` is the long-lived agent; the other
//! subcommands are one-shot operations against the local state or the
//! control plane. Exit codes: 0 success, 1 user/validation error,
//! 2 transient remote error, 3 fatal local error.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod agent;
mod client;
mod config;
mod executor;
mod identity;
mod provider;
mod rotator;
mod statestore;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use nkudo_core::plan::ExecutionState;
use nkudo_core::wire::{EnrollRequest, LeasedOperation, LeasedPlan, OperationRequest};

use client::{ClientError, ControlPlaneClient};
use config::AgentConfig;
use statestore::{Identity, StateStore};

/// nkudo edge agent — microVMs on your own hosts.
#[derive(Parser)]
#[command(
    name = "nkudo-edge",
    version,
    about = "nkudo edge agent — enroll this host and run microVM plans from the control plane",
    long_about = None,
)]
struct Cli {
    /// Control plane base URL.
    #[arg(long, env = "CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,

    /// Data directory (state, pki, images, vms).
    #[arg(long, env = "NKUDO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Redeem an enrollment token and persist this host's identity.
    Enroll {
        /// One-time enrollment token.
        #[arg(long, env = "NKUDO_ENROLL_TOKEN")]
        token: Option<String>,
        /// Hostname to register (default: the kernel hostname).
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Run the agent loop (heartbeat, executor, rotator).
    Run,
    /// Execute a local plan file without the control plane.
    Apply {
        /// JSON file with `{ "operations": [...] }`.
        file: PathBuf,
    },
    /// Show identity and microVM state.
    Status,
    /// Rotate the client certificate now.
    Renew,
    /// Remove this host's identity and key material.
    Unenroll {
        /// Skip the confirmation requirement.
        #[arg(long)]
        yes: bool,
    },
    /// Preflight the host: kvm, hypervisor, tools, connectivity.
    Check,
    /// Print the agent version.
    Version,
}

/// Failure classified for the exit-code contract.
enum CliError {
    /// User or validation error → exit 1.
    Validation(String),
    /// Transient remote error → exit 2.
    Remote(String),
    /// Fatal local error → exit 3.
    Fatal(String),
}

impl From<ClientError> for CliError {
    fn from(e: ClientError) -> Self {
        if e.is_retriable() {
            Self::Remote(e.to_string())
        } else {
            Self::Validation(e.to_string())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = AgentConfig::from_env();
    if let Some(url) = &cli.control_plane_url {
        config.control_plane_url.clone_from(url);
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }

    init_logging(matches!(cli.command, Commands::Run));

    let result = match cli.command {
        Commands::Enroll { token, hostname } => cmd_enroll(&config, token, hostname).await,
        Commands::Run => agent::run(config)
            .await
            .map_err(|e| CliError::Fatal(format!("{e:#}"))),
        Commands::Apply { file } => cmd_apply(&config, &file).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Renew => cmd_renew(&config).await,
        Commands::Unenroll { yes } => cmd_unenroll(&config, yes).await,
        Commands::Check => cmd_check(&config).await,
        Commands::Version => {
            println!("nkudo-edge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Validation(msg)) => {
            eprintln!("Error: {msg}");
            ExitCode::from(1)
        }
        Err(CliError::Remote(msg)) => {
            eprintln!("Error (transient): {msg}");
            ExitCode::from(2)
        }
        Err(CliError::Fatal(msg)) => {
            eprintln!("Fatal: {msg}");
            ExitCode::from(3)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .compact()
        .init();
}

// ── enroll ───────────────────────────────────────────────────────────

async fn cmd_enroll(
    config: &AgentConfig,
    token: Option<String>,
    hostname: Option<String>,
) -> Result<(), CliError> {
    let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
        return Err(CliError::Validation(
            "an enrollment token is required (--token or NKUDO_ENROLL_TOKEN)".to_owned(),
        ));
    };

    let store = open_store(config)?;
    if store.identity().await.is_some() {
        return Err(CliError::Validation(
            "this host is already enrolled — run `nkudo-edge unenroll` first".to_owned(),
        ));
    }

    let hostname = hostname.unwrap_or_else(identity::hostname);
    let (key_pem, csr_pem) = nkudo_core::pki::generate_key_and_csr(&hostname)
        .map_err(|e| CliError::Fatal(e.to_string()))?;

    let client = new_client(config)?;
    let resp = client
        .enroll(&EnrollRequest {
            token,
            hostname: hostname.clone(),
            csr_pem,
            agent_version: env!("CARGO_PKG_VERSION").to_owned(),
            host_fingerprint: identity::host_fingerprint(),
            labels: std::collections::HashMap::new(),
        })
        .await?;

    identity::install_credentials(config, &key_pem, &resp.client_cert_pem, &resp.ca_cert_pem)
        .map_err(|e| CliError::Fatal(e.to_string()))?;

    store
        .mutate(|state| {
            state.identity = Some(Identity {
                tenant_id: resp.tenant_id,
                site_id: resp.site_id,
                host_id: resp.host_id,
                agent_id: resp.agent_id,
                refresh_token: resp.refresh_token.clone(),
            });
        })
        .await
        .map_err(|e| CliError::Fatal(e.to_string()))?;

    println!("Enrolled.");
    println!("  tenant:  {}", resp.tenant_id);
    println!("  site:    {}", resp.site_id);
    println!("  host:    {}", resp.host_id);
    println!("  agent:   {}", resp.agent_id);
    println!("  next:    nkudo-edge run");
    Ok(())
}

// ── apply ────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct LocalPlanFile {
    operations: Vec<OperationRequest>,
}

async fn cmd_apply(config: &AgentConfig, file: &PathBuf) -> Result<(), CliError> {
    let raw = std::fs::read(file)
        .map_err(|e| CliError::Validation(format!("{}: {e}", file.display())))?;
    let plan_file: LocalPlanFile = serde_json::from_slice(&raw)
        .map_err(|e| CliError::Validation(format!("invalid plan file: {e}")))?;
    nkudo_core::plan::validate_operations(&plan_file.operations)
        .map_err(|e| CliError::Validation(e.to_string()))?;

    let store = Arc::new(open_store(config)?);
    let provider = Arc::new(provider::Provider::new(config.clone(), Arc::clone(&store)));
    let (log_tx, mut log_rx) = tokio::sync::mpsc::channel(256);
    let executor =
        executor::Executor::new(config.clone(), Arc::clone(&store), provider, log_tx);
    tokio::spawn(async move { while log_rx.recv().await.is_some() {} });

    // Identifiers derive from the file content so re-applying the same
    // plan hits the idempotency cache.
    let plan_id = derived_uuid(&raw, "plan");
    let operations = plan_file
        .operations
        .iter()
        .map(|op| LeasedOperation {
            execution_id: derived_uuid(op.operation_id.as_bytes(), "exec"),
            operation_id: op.operation_id.clone(),
            op_type: op.op_type,
            vm_id: op.vm_id,
            create: op.create.clone(),
        })
        .collect();

    let leased = LeasedPlan {
        plan_id,
        plan_version: 0,
        lease_expires_at: chrono::Utc::now(),
        operations,
    };

    let updates = executor.execute_plan(&leased).await;
    let mut failed = 0;
    for (op, update) in leased.operations.iter().zip(&updates) {
        match update.state {
            ExecutionState::Succeeded => println!("ok    {}", op.operation_id),
            _ => {
                failed += 1;
                println!(
                    "FAIL  {}  {}: {}",
                    op.operation_id,
                    update.error_code.as_deref().unwrap_or("error"),
                    update.error_message.as_deref().unwrap_or("")
                );
            }
        }
    }

    if failed > 0 {
        Err(CliError::Validation(format!("{failed} operation(s) failed")))
    } else {
        Ok(())
    }
}

fn derived_uuid(bytes: &[u8], label: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    hasher.update([0x1f]);
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(out)
}

// ── status ───────────────────────────────────────────────────────────

async fn cmd_status(config: &AgentConfig) -> Result<(), CliError> {
    let store = open_store(config)?;
    let snapshot = store.snapshot().await;

    match &snapshot.identity {
        Some(id) => {
            println!("Enrolled");
            println!("  tenant:  {}", id.tenant_id);
            println!("  site:    {}", id.site_id);
            println!("  agent:   {}", id.agent_id);
        }
        None => println!("Not enrolled"),
    }

    if let Ok(Some(pem)) = identity::read_client_cert(config) {
        if let Ok(window) = identity::cert_window(&pem) {
            println!("Certificate");
            println!("  not_after: {}", window.not_after.to_rfc3339());
            let due = nkudo_core::pki::rotation_due(
                window.not_before,
                window.not_after,
                chrono::Utc::now(),
            );
            println!("  rotation due: {due}");
        }
    }

    if snapshot.microvms.is_empty() {
        println!("No microVMs");
    } else {
        println!("MicroVMs");
        for vm in snapshot.microvms.values() {
            println!(
                "  {}  {:10}  {} vcpu  {} MiB  {}",
                vm.id, vm.state, vm.vcpu_count, vm.memory_mib, vm.name
            );
        }
    }
    Ok(())
}

// ── renew / unenroll / check ─────────────────────────────────────────

async fn cmd_renew(config: &AgentConfig) -> Result<(), CliError> {
    let store = Arc::new(open_store(config)?);
    let client = new_client(config)?;
    let rotator = rotator::Rotator::new(config.clone(), store, client);
    rotator.rotate_now().await.map_err(|e| match e {
        rotator::RotateError::Client(c) => c.into(),
        other => CliError::Fatal(other.to_string()),
    })?;
    println!("Certificate rotated.");
    Ok(())
}

async fn cmd_unenroll(config: &AgentConfig, yes: bool) -> Result<(), CliError> {
    if !yes {
        return Err(CliError::Validation(
            "unenroll removes this host's identity and key material; pass --yes to confirm"
                .to_owned(),
        ));
    }

    let store = open_store(config)?;
    store
        .mutate(|state| {
            state.identity = None;
            state.actions.clear();
        })
        .await
        .map_err(|e| CliError::Fatal(e.to_string()))?;
    identity::remove_credentials(config).map_err(|e| CliError::Fatal(e.to_string()))?;

    println!("Unenrolled. MicroVM records were kept; delete them via plans if needed.");
    Ok(())
}

async fn cmd_check(config: &AgentConfig) -> Result<(), CliError> {
    let mut failures = 0;
    let mut remote_failure = false;

    let check = |ok: bool, label: &str, detail: String| {
        println!("{}  {label}{detail}", if ok { "ok  " } else { "FAIL" });
        ok
    };

    if !check(
        std::path::Path::new("/dev/kvm").exists(),
        "kvm",
        " (/dev/kvm)".to_owned(),
    ) {
        failures += 1;
    }

    let binary = config.hypervisor.resolve_binary(config);
    if !check(
        binary.is_some(),
        "hypervisor",
        format!(
            " ({}: {})",
            config.hypervisor,
            binary
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "not found".to_owned())
        ),
    ) {
        failures += 1;
    }

    let iso_tool = ["genisoimage", "mkisofs", "xorriso"]
        .into_iter()
        .find(|tool| {
            std::env::var_os("PATH").is_some_and(|path| {
                std::env::split_paths(&path).any(|dir| dir.join(*tool).exists())
            })
        });
    if !check(
        iso_tool.is_some(),
        "iso tool",
        format!(" ({})", iso_tool.unwrap_or("none")),
    ) {
        failures += 1;
    }

    let bridge_path = format!("/sys/class/net/{}", config.bridge);
    if !check(
        std::path::Path::new(&bridge_path).exists(),
        "bridge",
        format!(" ({})", config.bridge),
    ) {
        failures += 1;
    }

    let writable = std::fs::create_dir_all(&config.data_dir).is_ok();
    if !check(
        writable,
        "data dir",
        format!(" ({})", config.data_dir.display()),
    ) {
        failures += 1;
    }

    let client = new_client(config)?;
    let reachable = client.health().await.is_ok();
    if !check(
        reachable,
        "control plane",
        format!(" ({})", config.control_plane_url),
    ) {
        remote_failure = true;
    }

    if failures > 0 {
        Err(CliError::Validation(format!("{failures} check(s) failed")))
    } else if remote_failure {
        Err(CliError::Remote("control plane unreachable".to_owned()))
    } else {
        println!("All checks passed.");
        Ok(())
    }
}

// ── helpers ──────────────────────────────────────────────────────────

fn open_store(config: &AgentConfig) -> Result<StateStore, CliError> {
    StateStore::open(&config.state_file(), config.state_key)
        .map_err(|e| CliError::Fatal(e.to_string()))
}

fn new_client(config: &AgentConfig) -> Result<ControlPlaneClient, CliError> {
    ControlPlaneClient::new(&config.control_plane_url, config.http_timeout)
        .map_err(|e| CliError::Fatal(e.to_string()))
}
