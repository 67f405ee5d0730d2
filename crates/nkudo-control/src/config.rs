//! Server configuration for the nkudo control plane.
//!
//! Loads configuration from environment variables with sensible
//! defaults. All settings can be overridden via `NKUDO_*` variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Control-plane configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
    /// Bearer token guarding the admin bootstrap routes.
    pub admin_token: String,
    /// A site with no heartbeat for this long is marked offline.
    pub offline_after: Duration,
    /// How long a plan lease is held before it becomes reclaimable.
    pub lease_ttl: Duration,
    /// Interval agents are told to heartbeat at, in seconds.
    pub heartbeat_interval_s: u64,
    /// Maximum plans leased per heartbeat.
    pub max_plans_per_heartbeat: i64,
    /// Lifetime of issued agent client certificates, in hours.
    pub cert_ttl_hours: i64,
    /// In-flight handlers get this long to finish on shutdown.
    pub shutdown_grace: Duration,
    /// Interval between site-offline scans.
    pub offline_scan_interval: Duration,
    /// Key-encryption key sealing persisted CA private keys (32 bytes).
    /// Ephemeral (with a warning) when `NKUDO_CA_KEK` is unset.
    pub ca_kek: [u8; 32],
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NKUDO_BIND_ADDR` — full bind address (overrides `PORT`, default: `127.0.0.1:8700`)
    /// - `PORT` — port only, binds `0.0.0.0` (platform convention)
    /// - `DATABASE_URL` — PostgreSQL connection string (required)
    /// - `NKUDO_LOG_LEVEL` — log filter (default: `info`)
    /// - `NKUDO_ADMIN_TOKEN` — admin bearer token (required for admin routes)
    /// - `NKUDO_OFFLINE_AFTER_SECS` — site offline threshold (default: `60`)
    /// - `NKUDO_LEASE_TTL_SECS` — plan lease TTL (default: `45`)
    /// - `NKUDO_HEARTBEAT_INTERVAL_SECS` — advertised heartbeat interval (default: `15`)
    /// - `NKUDO_MAX_PLANS_PER_HEARTBEAT` — lease cap per heartbeat (default: `2`)
    /// - `NKUDO_CERT_TTL_HOURS` — client cert lifetime (default: `24`)
    /// - `NKUDO_SHUTDOWN_GRACE_SECS` — drain deadline on shutdown (default: `30`)
    /// - `NKUDO_OFFLINE_SCAN_INTERVAL_SECS` — scanner tick (default: `15`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("NKUDO_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8700)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8700);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8700))
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/nkudo".to_owned());

        let log_level =
            std::env::var("NKUDO_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let admin_token = std::env::var("NKUDO_ADMIN_TOKEN").unwrap_or_default();

        let ca_kek = load_kek();

        Self {
            bind_addr,
            database_url,
            log_level,
            admin_token,
            offline_after: Duration::from_secs(env_u64("NKUDO_OFFLINE_AFTER_SECS", 60)),
            lease_ttl: Duration::from_secs(env_u64("NKUDO_LEASE_TTL_SECS", 45)),
            heartbeat_interval_s: env_u64("NKUDO_HEARTBEAT_INTERVAL_SECS", 15),
            max_plans_per_heartbeat: i64::try_from(env_u64(
                "NKUDO_MAX_PLANS_PER_HEARTBEAT",
                2,
            ))
            .unwrap_or(2),
            cert_ttl_hours: i64::try_from(env_u64("NKUDO_CERT_TTL_HOURS", 24))
                .unwrap_or(24),
            shutdown_grace: Duration::from_secs(env_u64("NKUDO_SHUTDOWN_GRACE_SECS", 30)),
            offline_scan_interval: Duration::from_secs(env_u64(
                "NKUDO_OFFLINE_SCAN_INTERVAL_SECS",
                15,
            )),
            ca_kek,
        }
    }
}

/// Parse `NKUDO_CA_KEK` (64 hex chars) or fall back to an ephemeral key.
///
/// With an ephemeral key, persisted CA material cannot be opened after a
/// restart — fine for development, loudly wrong for production.
fn load_kek() -> [u8; 32] {
    if let Ok(hex_key) = std::env::var("NKUDO_CA_KEK") {
        if let Ok(bytes) = hex::decode(hex_key.trim()) {
            if let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) {
                return key;
            }
        }
        tracing::warn!("NKUDO_CA_KEK is set but not 64 hex chars, ignoring");
    } else {
        tracing::warn!(
            "NKUDO_CA_KEK unset — using an ephemeral KEK, CA keys will not survive restart"
        );
    }
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(a.as_bytes());
    key[16..].copy_from_slice(b.as_bytes());
    key
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
