//! Encrypted identity store
//!
//! Persists the long-term identity: LTAC, its private key, the captured
//! issuing authority and the revocation token bound at provisioning.
//!
//! # Storage Format
//!
//! One file per agent at `<dir>/<agent_id>.identity` containing
//! `nonce ‖ ChaCha20-Poly1305(JSON record)`, sealed with a key derived from
//! the agent identifier. Writes go to a temporary file that is synced and
//! renamed over the blob, so a crash leaves either the old or the new
//! identity, never a partial one.
//!
//! A blob that fails to decrypt or parse reads as "not provisioned". That
//! keeps the reset path always available; the condition is logged at warn
//! so real corruption stays visible.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use keystone_common::{AgentId, Disposition};
use keystone_infra::crypto::StoreKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const RECORD_VERSION: u8 = 1;
const BLOB_EXTENSION: &str = "identity";

/// Identity store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No usable identity blob
    #[error("identity not provisioned")]
    NotProvisioned,

    /// File system error
    #[error("identity store I/O error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Record could not be serialized or sealed
    #[error("failed to encode identity record: {0}")]
    Encode(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// What the caller should do next
    pub fn disposition(&self) -> Disposition {
        match self {
            StoreError::NotProvisioned => Disposition::Reprovision,
            StoreError::Io { .. } => Disposition::RetryAsIs,
            StoreError::Encode(_) => Disposition::Fatal,
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// The long-term identity material
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityBundle {
    /// DER long-term agent certificate
    pub ltac_der: Vec<u8>,
    /// PKCS#8 DER private key of the LTAC
    pub ltac_key_der: Zeroizing<Vec<u8>>,
    /// DER issuing authority certificate captured at bootstrap
    pub sca_der: Vec<u8>,
    /// Revocation token as issued
    pub revocation_token: String,
    /// Canonical claims of the bound revocation token
    pub revocation_canonical: Vec<u8>,
}

impl fmt::Debug for IdentityBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityBundle")
            .field("ltac_der", &format_args!("{} bytes", self.ltac_der.len()))
            .field("ltac_key_der", &"[REDACTED]")
            .field("sca_der", &format_args!("{} bytes", self.sca_der.len()))
            .field("revocation_token", &self.revocation_token)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    version: u8,
    ltac: String,
    ltac_key: String,
    sca: String,
    revocation_token: String,
    revocation_canonical: String,
}

impl StoredRecord {
    fn from_bundle(bundle: &IdentityBundle) -> Self {
        Self {
            version: RECORD_VERSION,
            ltac: STANDARD.encode(&bundle.ltac_der),
            ltac_key: STANDARD.encode(bundle.ltac_key_der.as_slice()),
            sca: STANDARD.encode(&bundle.sca_der),
            revocation_token: bundle.revocation_token.clone(),
            revocation_canonical: STANDARD.encode(&bundle.revocation_canonical),
        }
    }

    fn into_bundle(self) -> std::result::Result<IdentityBundle, String> {
        if self.version != RECORD_VERSION {
            return Err(format!("unsupported record version {}", self.version));
        }
        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| format!("invalid {} encoding: {}", field, e))
        };
        Ok(IdentityBundle {
            ltac_der: decode("ltac", &self.ltac)?,
            ltac_key_der: Zeroizing::new(decode("ltac_key", &self.ltac_key)?),
            sca_der: decode("sca", &self.sca)?,
            revocation_token: self.revocation_token,
            revocation_canonical: decode("revocation_canonical", &self.revocation_canonical)?,
        })
    }
}

/// Encrypted on-disk store for one agent's identity
///
/// Reads share a lock, writes and resets are exclusive.
pub struct IdentityStore {
    dir: PathBuf,
    agent_id: AgentId,
    key: StoreKey,
    lock: RwLock<()>,
}

impl IdentityStore {
    /// Create a store for `agent_id` rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>, agent_id: AgentId) -> Self {
        Self {
            dir: dir.into(),
            key: StoreKey::derive(&agent_id),
            agent_id,
            lock: RwLock::new(()),
        }
    }

    /// Agent this store belongs to
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Path of the encrypted blob
    pub fn blob_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.agent_id, BLOB_EXTENSION))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir
            .join(format!(".{}.{}.tmp", self.agent_id, BLOB_EXTENSION))
    }

    /// Load the identity
    ///
    /// Returns [`StoreError::NotProvisioned`] when no blob exists or it
    /// cannot be decrypted or parsed.
    pub async fn get(&self) -> Result<IdentityBundle> {
        let _guard = self.lock.read().await;
        let path = self.blob_path();

        let sealed = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotProvisioned)
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let plaintext = match self.key.open(&sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(
                    agent_id = %self.agent_id,
                    path = %path.display(),
                    error = %e,
                    "identity blob failed to decrypt, treating as not provisioned"
                );
                return Err(StoreError::NotProvisioned);
            }
        };

        let record: StoredRecord = match serde_json::from_slice(&plaintext) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "identity record failed to parse, treating as not provisioned"
                );
                return Err(StoreError::NotProvisioned);
            }
        };

        record.into_bundle().map_err(|reason| {
            warn!(agent_id = %self.agent_id, %reason, "identity record invalid, treating as not provisioned");
            StoreError::NotProvisioned
        })
    }

    /// Whether a readable identity exists
    pub async fn is_provisioned(&self) -> bool {
        self.get().await.is_ok()
    }

    /// Seal and atomically persist the identity
    pub async fn put(&self, bundle: &IdentityBundle) -> Result<()> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&StoredRecord::from_bundle(bundle))
                .map_err(|e| StoreError::Encode(e.to_string()))?,
        );
        let sealed = self
            .key
            .seal(&plaintext)
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        let _guard = self.lock.write().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let temp_path = self.temp_path();
        let path = self.blob_path();
        if let Err(e) = write_synced(&temp_path, &sealed).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&temp_path, e));
        }
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        info!(agent_id = %self.agent_id, path = %path.display(), "identity persisted");
        Ok(())
    }

    /// Delete the identity; succeeds if none exists
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let path = self.blob_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(agent_id = %self.agent_id, "identity erased");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(agent_id = %self.agent_id, "identity already absent");
                Ok(())
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

impl fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityStore")
            .field("dir", &self.dir)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}
