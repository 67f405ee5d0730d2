//! Persistent agent state.
//!
//! One JSON document holds the enrolled identity, the microVM records,
//! and the per-operation action records that back executor idempotency.
//! Every update goes through write-to-temp + rename in the same
//! directory, so a crash never leaves a partial file; the state file is
//! 0600 inside a 0700 directory.
//!
//! Two backings share the same document: plain JSON on disk, and an
//! AES-256-GCM encrypted variant keyed by `NKUDO_STATE_KEY`. Selection
//! happens at open time — a key means encrypted; without one the store
//! falls back to plaintext unless an encrypted file already exists
//! (refusing to silently downgrade).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use nkudo_core::microvm::VmState;

/// Magic prefix marking an encrypted state file.
const ENCRYPTED_MAGIC: &[u8] = b"NKEDGE1\n";

/// Errors from the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// Filesystem failure.
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be (de)serialized.
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The file is encrypted but no key was supplied, or vice versa.
    #[error("state key mismatch: {reason}")]
    KeyMismatch { reason: String },

    /// Decryption failed (wrong key or corrupted file).
    #[error("state decryption failed")]
    Decrypt,

    /// Encryption failed.
    #[error("state encryption failed: {reason}")]
    Encrypt { reason: String },
}

// ── Document ─────────────────────────────────────────────────────────

/// The enrolled identity of this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub agent_id: Uuid,
    /// Long-lived renewal credential. Plaintext here by necessity —
    /// the encrypted store variant protects it at rest.
    pub refresh_token: String,
}

/// Persisted record of one microVM this agent manages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: Uuid,
    pub name: String,
    pub state: VmState,
    pub vcpu_count: u32,
    pub memory_mib: u64,
    pub disk_path: PathBuf,
    pub seed_iso_path: PathBuf,
    pub api_socket_path: PathBuf,
    pub console_path: PathBuf,
    pub tap_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cached outcome of one executed operation, keyed by action id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub execution_id: Uuid,
    pub operation_id: String,
    pub plan_id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// The full on-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub microvms: BTreeMap<Uuid, VmRecord>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionRecord>,
}

// ── Store ────────────────────────────────────────────────────────────

/// Mutex-serialized owner of the persisted agent state.
pub struct StateStore {
    path: PathBuf,
    key: Option<[u8; 32]>,
    state: Mutex<EdgeState>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("encrypted", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or initialize) the state file.
    ///
    /// # Errors
    ///
    /// [`StateStoreError::KeyMismatch`] when an encrypted file exists
    /// without a key; decode and IO failures otherwise.
    pub fn open(path: &Path, key: Option<[u8; 32]>) -> Result<Self, StateStoreError> {
        let state = if path.exists() {
            let raw = std::fs::read(path)?;
            decode(&raw, key.as_ref())?
        } else {
            EdgeState::default()
        };

        Ok(Self {
            path: path.to_owned(),
            key,
            state: Mutex::new(state),
        })
    }

    /// Snapshot of the current document.
    pub async fn snapshot(&self) -> EdgeState {
        self.state.lock().await.clone()
    }

    /// Mutate the document and persist it atomically before returning.
    ///
    /// The mutex guarantees the file is never written concurrently.
    ///
    /// # Errors
    ///
    /// Persist failures leave the in-memory state already mutated but
    /// the previous file intact (rename is the commit point).
    pub async fn mutate<F, T>(&self, f: F) -> Result<T, StateStoreError>
    where
        F: FnOnce(&mut EdgeState) -> T,
    {
        let mut guard = self.state.lock().await;
        let out = f(&mut guard);
        persist(&self.path, &guard, self.key.as_ref())?;
        Ok(out)
    }

    /// The enrolled identity, if any.
    pub async fn identity(&self) -> Option<Identity> {
        self.state.lock().await.identity.clone()
    }
}

// ── Encoding ─────────────────────────────────────────────────────────

fn decode(raw: &[u8], key: Option<&[u8; 32]>) -> Result<EdgeState, StateStoreError> {
    let encrypted = raw.starts_with(ENCRYPTED_MAGIC);
    match (encrypted, key) {
        (true, Some(key)) => {
            let body = &raw[ENCRYPTED_MAGIC.len()..];
            if body.len() < 12 {
                return Err(StateStoreError::Decrypt);
            }
            let (nonce, ciphertext) = body.split_at(12);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
            let plaintext = cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| StateStoreError::Decrypt)?;
            Ok(serde_json::from_slice(&plaintext)?)
        }
        (true, None) => Err(StateStoreError::KeyMismatch {
            reason: "state file is encrypted but NKUDO_STATE_KEY is not set".to_owned(),
        }),
        (false, _) => {
            // Plaintext file. With a key present we read it and the
            // next persist upgrades it to the encrypted format.
            Ok(serde_json::from_slice(raw)?)
        }
    }
}

fn encode(state: &EdgeState, key: Option<&[u8; 32]>) -> Result<Vec<u8>, StateStoreError> {
    let json = serde_json::to_vec_pretty(state)?;
    match key {
        None => Ok(json),
        Some(key) => {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext =
                cipher
                    .encrypt(&nonce, json.as_slice())
                    .map_err(|e| StateStoreError::Encrypt {
                        reason: e.to_string(),
                    })?;
            let mut out =
                Vec::with_capacity(ENCRYPTED_MAGIC.len() + 12 + ciphertext.len());
            out.extend_from_slice(ENCRYPTED_MAGIC);
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
    }
}

fn persist(
    path: &Path,
    state: &EdgeState,
    key: Option<&[u8; 32]>,
) -> Result<(), StateStoreError> {
    let encoded = encode(state, key)?;
    atomic_write(path, &encoded)
}

/// Write-to-temp + rename in the same directory; 0600 on the temp file
/// before any content lands, 0700 on the parent directory.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), StateStoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StateStoreError::Io(std::io::Error::other("state path has no parent")))?;
    std::fs::create_dir_all(dir)?;
    crate::config::set_mode(dir, 0o700)?;

    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("edge-state.json")
    ));

    {
        use std::io::Write;
        let mut file = open_owner_only(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sample_identity() -> Identity {
        Identity {
            tenant_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            refresh_token: "nkrt_deadbeef".to_owned(),
        }
    }

    #[tokio::test]
    async fn roundtrip_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("edge-state.json");

        let store = StateStore::open(&path, None).unwrap();
        let identity = sample_identity();
        store
            .mutate(|s| s.identity = Some(identity.clone()))
            .await
            .unwrap();

        let reopened = StateStore::open(&path, None).unwrap();
        let loaded = reopened.identity().await.unwrap();
        assert_eq!(loaded.agent_id, identity.agent_id);

        // Plaintext file starts with JSON.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw[0], b'{');
    }

    #[tokio::test]
    async fn roundtrip_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge-state.json");
        let key = [42u8; 32];

        let store = StateStore::open(&path, Some(key)).unwrap();
        store
            .mutate(|s| s.identity = Some(sample_identity()))
            .await
            .unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(ENCRYPTED_MAGIC));
        assert!(!String::from_utf8_lossy(&raw).contains("nkrt"));

        let reopened = StateStore::open(&path, Some(key)).unwrap();
        assert!(reopened.identity().await.is_some());
    }

    #[test]
    fn encrypted_file_without_key_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge-state.json");
        let key = [9u8; 32];
        let encoded = encode(&EdgeState::default(), Some(&key)).unwrap();
        std::fs::write(&path, encoded).unwrap();

        let err = StateStore::open(&path, None).unwrap_err();
        assert!(matches!(err, StateStoreError::KeyMismatch { .. }));
    }

    #[test]
    fn wrong_key_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge-state.json");
        let encoded = encode(&EdgeState::default(), Some(&[1u8; 32])).unwrap();
        std::fs::write(&path, encoded).unwrap();

        let err = StateStore::open(&path, Some([2u8; 32])).unwrap_err();
        assert!(matches!(err, StateStoreError::Decrypt));
    }

    #[tokio::test]
    async fn plaintext_upgrades_to_encrypted_when_key_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge-state.json");

        let store = StateStore::open(&path, None).unwrap();
        store
            .mutate(|s| s.identity = Some(sample_identity()))
            .await
            .unwrap();

        let key = [5u8; 32];
        let upgraded = StateStore::open(&path, Some(key)).unwrap();
        assert!(upgraded.identity().await.is_some());
        upgraded.mutate(|_| ()).await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(ENCRYPTED_MAGIC));
    }

    #[tokio::test]
    async fn action_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge-state.json");

        let store = StateStore::open(&path, None).unwrap();
        let record = ActionRecord {
            action_id: "p1:o1".to_owned(),
            execution_id: Uuid::new_v4(),
            operation_id: "o1".to_owned(),
            plan_id: Uuid::new_v4(),
            ok: true,
            error_code: None,
            message: None,
            finished_at: Utc::now(),
        };
        store
            .mutate(|s| {
                s.actions.insert(record.action_id.clone(), record.clone());
            })
            .await
            .unwrap();

        let reopened = StateStore::open(&path, None).unwrap();
        let snapshot = reopened.snapshot().await;
        assert!(snapshot.actions.contains_key("p1:o1"));
        assert!(snapshot.actions["p1:o1"].ok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("edge-state.json");
        let store = StateStore::open(&path, None).unwrap();
        store.mutate(|_| ()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
