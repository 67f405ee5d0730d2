//! Enrollment-token and refresh-token secret handling.
//!
//! Secrets are never stored in plaintext — they are SHA-256 hashed before
//! persisting, and comparison of hashes uses constant-time equality to
//! prevent timing side-channels. Plaintext is returned exactly once at
//! mint time.
//!
//! # Security model
//!
//! - Secrets are 256 bits of OS CSPRNG randomness (two UUID v4 values),
//!   hex-encoded for transport.
//! - Stored as `SHA-256(secret)` hex. Lookup is by hash: the caller
//!   provides plaintext, we hash it and look up the hash.
//! - Hash comparison uses `subtle::ConstantTimeEq`.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix on enrollment tokens handed to operators.
pub const ENROLL_TOKEN_PREFIX: &str = "nket_";

/// Prefix on refresh tokens handed to agents.
pub const REFRESH_TOKEN_PREFIX: &str = "nkrt_";

/// Generate a new 256-bit secret, hex-encoded with the given prefix.
#[must_use]
pub fn generate_secret(prefix: &str) -> String {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(a.as_bytes());
    bytes[16..].copy_from_slice(b.as_bytes());
    format!("{prefix}{}", hex::encode(bytes))
}

/// Hash a secret with SHA-256 for storage/lookup (hex-encoded).
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)
}

/// Constant-time equality of two stored hashes.
///
/// Both inputs are hex digests of equal length in the normal case; a
/// length mismatch returns `false` without leaking where they differ.
#[must_use]
pub fn hashes_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Extract the display prefix of a secret (first 12 chars).
///
/// Safe to log and store — reveals only the token family and a few
/// characters of entropy.
#[must_use]
pub fn secret_prefix(secret: &str) -> String {
    let end = secret.len().min(12);
    format!("{}...", &secret[..end])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn generated_secrets_are_unique_and_prefixed() {
        let a = generate_secret(ENROLL_TOKEN_PREFIX);
        let b = generate_secret(ENROLL_TOKEN_PREFIX);
        assert_ne!(a, b);
        assert!(a.starts_with("nket_"));
        // prefix + 64 hex chars
        assert_eq!(a.len(), ENROLL_TOKEN_PREFIX.len() + 64);
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let h1 = hash_secret("nket_abc");
        let h2 = hash_secret("nket_abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hashes_equal_constant_time_paths() {
        let h = hash_secret("x");
        assert!(hashes_equal(&h, &h));
        assert!(!hashes_equal(&h, &hash_secret("y")));
        assert!(!hashes_equal(&h, "short"));
    }

    #[test]
    fn prefix_is_truncated() {
        let token = generate_secret(REFRESH_TOKEN_PREFIX);
        let p = secret_prefix(&token);
        assert_eq!(p.len(), 15); // 12 chars + "..."
        assert!(p.starts_with("nkrt_"));
    }
}
