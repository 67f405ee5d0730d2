//! Root-disk preparation.
//!
//! Base images are cached content-addressed (keyed by the SHA-256 of
//! the canonical source path), then cloned per VM — hard link when the
//! filesystem allows it, byte copy otherwise. The cloud-init seed is a
//! tiny ISO9660 volume labelled `cidata`, built with whichever ISO tool
//! the host has.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::ProviderError;

/// Cache key for a base image: hash of its canonical path.
#[must_use]
pub fn cache_key(source: &Path) -> String {
    let canonical = source
        .canonicalize()
        .unwrap_or_else(|_| source.to_owned());
    hex::encode(Sha256::digest(canonical.display().to_string().as_bytes()))
}

/// Ensure the base image is present in the cache; returns the cached
/// path.
///
/// # Errors
///
/// [`ProviderError::HostResource`] when the source image is missing or
/// the copy fails.
pub fn ensure_cached(source: &Path, cache_dir: &Path) -> Result<PathBuf, ProviderError> {
    if !source.exists() {
        return Err(ProviderError::HostResource {
            detail: format!("base image not found: {}", source.display()),
        });
    }
    std::fs::create_dir_all(cache_dir).map_err(|e| ProviderError::HostResource {
        detail: format!("image cache dir: {e}"),
    })?;

    let cached = cache_dir.join(format!("{}.img", cache_key(source)));
    if cached.exists() {
        return Ok(cached);
    }

    // Copy to a temp name first so a torn copy never looks cached.
    let tmp = cache_dir.join(format!(".{}.partial", cache_key(source)));
    std::fs::copy(source, &tmp).map_err(|e| ProviderError::HostResource {
        detail: format!("caching base image: {e}"),
    })?;
    std::fs::rename(&tmp, &cached).map_err(|e| ProviderError::HostResource {
        detail: format!("committing cached image: {e}"),
    })?;

    tracing::info!(source = %source.display(), cached = %cached.display(), "base image cached");
    Ok(cached)
}

/// Clone the cached base image into a VM's root disk.
///
/// # Errors
///
/// [`ProviderError::HostResource`] when both hard link and copy fail.
pub fn clone_root_disk(cached: &Path, dest: &Path) -> Result<(), ProviderError> {
    if dest.exists() {
        return Ok(());
    }
    if std::fs::hard_link(cached, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(cached, dest)
        .map(|_| ())
        .map_err(|e| ProviderError::HostResource {
            detail: format!("cloning root disk: {e}"),
        })
}

/// Build the cloud-init seed ISO (metadata + user-data) for a VM.
///
/// # Errors
///
/// [`ProviderError::HostResource`] when no ISO tool is available or the
/// build fails.
pub async fn build_seed_iso(
    vm_dir: &Path,
    iso_path: &Path,
    vm_id: uuid::Uuid,
    name: &str,
) -> Result<(), ProviderError> {
    let seed_dir = vm_dir.join("seed");
    std::fs::create_dir_all(&seed_dir).map_err(|e| ProviderError::HostResource {
        detail: format!("seed dir: {e}"),
    })?;

    let meta_data = format!("instance-id: {vm_id}\nlocal-hostname: {name}\n");
    let user_data = format!(
        "#cloud-config\nhostname: {name}\npreserve_hostname: false\n"
    );
    std::fs::write(seed_dir.join("meta-data"), meta_data).map_err(|e| {
        ProviderError::HostResource {
            detail: format!("meta-data: {e}"),
        }
    })?;
    std::fs::write(seed_dir.join("user-data"), user_data).map_err(|e| {
        ProviderError::HostResource {
            detail: format!("user-data: {e}"),
        }
    })?;

    // genisoimage, mkisofs, and xorriso take the same essential flags.
    for tool in ["genisoimage", "mkisofs", "xorriso"] {
        let mut cmd = tokio::process::Command::new(tool);
        if tool == "xorriso" {
            cmd.args(["-as", "mkisofs"]);
        }
        cmd.args(["-output"])
            .arg(iso_path)
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(seed_dir.join("user-data"))
            .arg(seed_dir.join("meta-data"));

        match cmd.output().await {
            Ok(out) if out.status.success() => return Ok(()),
            Ok(out) => {
                return Err(ProviderError::HostResource {
                    detail: format!(
                        "{tool} failed: {}",
                        String::from_utf8_lossy(&out.stderr).trim()
                    ),
                });
            }
            // Tool not installed — try the next one.
            Err(_) => {}
        }
    }

    Err(ProviderError::HostResource {
        detail: "no ISO tool found (genisoimage, mkisofs, xorriso)".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn cache_key_is_stable_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("base.img");
        std::fs::write(&img, b"rootfs").unwrap();
        assert_eq!(cache_key(&img), cache_key(&img));
        let other = dir.path().join("other.img");
        std::fs::write(&other, b"rootfs").unwrap();
        assert_ne!(cache_key(&img), cache_key(&other));
    }

    #[test]
    fn caching_and_cloning_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("base.img");
        std::fs::write(&source, b"rootfs-bytes").unwrap();
        let cache = dir.path().join("cache");

        let cached = ensure_cached(&source, &cache).unwrap();
        assert!(cached.exists());
        // Second call is a no-op hit.
        assert_eq!(ensure_cached(&source, &cache).unwrap(), cached);

        let dest = dir.path().join("disk.img");
        clone_root_disk(&cached, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"rootfs-bytes");
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_cached(&dir.path().join("nope.img"), &dir.path().join("cache"))
            .unwrap_err();
        assert!(matches!(err, ProviderError::HostResource { .. }));
    }
}
