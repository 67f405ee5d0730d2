//! TAP device plumbing.
//!
//! Each microVM gets one TAP device attached to the configured bridge,
//! managed through `ip(8)`. Device names derive from the VM id so a
//! restarted agent finds its devices again.

use uuid::Uuid;

use super::ProviderError;

/// Deterministic TAP name for a VM (IFNAMSIZ-safe).
#[must_use]
pub fn tap_name(vm_id: Uuid) -> String {
    let hex = vm_id.simple().to_string();
    format!("nk{}", &hex[..10])
}

/// Create the TAP device, attach it to the bridge, bring it up.
///
/// # Errors
///
/// [`ProviderError::HostResource`] when any `ip` invocation fails.
pub async fn create_tap(tap: &str, bridge: &str) -> Result<(), ProviderError> {
    ip(&["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
    ip(&["link", "set", tap, "master", bridge]).await?;
    ip(&["link", "set", tap, "up"]).await?;
    Ok(())
}

/// Tear the TAP device down; absence is not an error.
///
/// # Errors
///
/// [`ProviderError::HostResource`] only when `ip` itself cannot run.
pub async fn delete_tap(tap: &str) -> Result<(), ProviderError> {
    let out = tokio::process::Command::new("ip")
        .args(["link", "del", tap])
        .output()
        .await
        .map_err(|e| ProviderError::HostResource {
            detail: format!("ip link del: {e}"),
        })?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !stderr.contains("Cannot find device") {
            tracing::warn!(tap, error = %stderr.trim(), "tap teardown failed");
        }
    }
    Ok(())
}

async fn ip(args: &[&str]) -> Result<(), ProviderError> {
    let out = tokio::process::Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| ProviderError::HostResource {
            detail: format!("ip {}: {e}", args.join(" ")),
        })?;
    if out.status.success() {
        Ok(())
    } else {
        Err(ProviderError::HostResource {
            detail: format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_names_are_short_and_stable() {
        let id = Uuid::new_v4();
        let name = tap_name(id);
        assert!(name.len() <= 15, "must fit IFNAMSIZ");
        assert!(name.starts_with("nk"));
        assert_eq!(name, tap_name(id));
        assert_ne!(name, tap_name(Uuid::new_v4()));
    }
}
