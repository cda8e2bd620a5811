//! Master-password credential vault.
//!
//! The vault owns a collection of [`CredentialRecord`]s and a verifier for
//! the master password. Every secret is sealed on its own with
//! [`cipher::encrypt`]. Every password-gated operation checks the verifier
//! before it touches any record, and every mutation persists the whole
//! document atomically before the in-memory state changes.

pub mod cipher;
pub mod record;
pub mod store;
pub mod verifier;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use cipher::{CipherError, EncryptedBlob, KdfParams};
pub use record::{Credential, CredentialDraft, CredentialRecord, CredentialSummary};
pub use store::VaultState;

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Master password missing, not set, or wrong.
    #[error("Invalid master password")]
    Authentication,

    /// A stored secret could not be opened.
    #[error("Decryption failed")]
    Decryption,

    /// No credential with the given id.
    #[error("Credential not found: {0}")]
    NotFound(String),

    /// Rejected input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Vault document is not valid JSON.
    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// File too large.
    #[error("File too large (max {} bytes)", store::MAX_FILE_SIZE)]
    FileTooLarge,

    /// Sealing a secret failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Background worker failed.
    #[error("Vault task failed: {0}")]
    Task(String),
}

impl From<CipherError> for VaultError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Decryption => Self::Decryption,
            CipherError::Encryption(msg) | CipherError::Kdf(msg) => Self::Encryption(msg),
            CipherError::Task(msg) => Self::Task(msg),
        }
    }
}

/// Read-only vault status. Needs no password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultStatus {
    /// True once a master password has been set.
    pub has_verifier: bool,
    /// Number of stored credentials.
    pub credential_count: usize,
}

/// Encrypted credential vault backed by a single JSON document.
pub struct Vault {
    path: PathBuf,
    /// Parameters for new verifiers and for blobs sealed after a re-key.
    configured_kdf: KdfParams,
    state: RwLock<VaultState>,
    /// Serializes read-modify-write-persist cycles.
    mutation: Mutex<()>,
}

impl Vault {
    /// Opens the vault at `path`. A missing file yields an empty,
    /// uninitialized vault; nothing is written until the first mutation.
    ///
    /// # Errors
    /// Returns error if an existing document cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>, configured_kdf: KdfParams) -> Result<Self, VaultError> {
        let path = path.into();
        let state = match store::load(&path)? {
            Some(state) => state,
            None => {
                debug!("No vault at {}, starting empty", path.display());
                VaultState::new(configured_kdf)
            }
        };

        info!(
            "Opened vault {} (initialized={}, credentials={})",
            path.display(),
            state.master_verifier.is_some(),
            state.credentials.len()
        );

        Ok(Self {
            path,
            configured_kdf,
            state: RwLock::new(state),
            mutation: Mutex::new(()),
        })
    }

    /// Returns the vault document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reports whether a master password is set and how many records exist.
    pub async fn status(&self) -> VaultStatus {
        let state = self.state.read().await;
        VaultStatus {
            has_verifier: state.master_verifier.is_some(),
            credential_count: state.credentials.len(),
        }
    }

    /// Sets or changes the master password.
    ///
    /// With a verifier present, `old` must match it; every stored secret is
    /// then re-sealed under `new` and written together with the new verifier.
    /// If any secret fails to open, nothing changes.
    ///
    /// # Errors
    /// `InvalidInput` for an empty `new`, `Authentication` when `old` is
    /// missing or wrong, `Decryption` when a stored secret cannot be opened.
    pub async fn set_master_password(
        &self,
        new: &str,
        old: Option<&str>,
    ) -> Result<(), VaultError> {
        if new.is_empty() {
            return Err(VaultError::InvalidInput(
                "master password cannot be empty".to_string(),
            ));
        }

        let _guard = self.mutation.lock().await;
        let snapshot = self.state.read().await.clone();

        let existing = snapshot.master_verifier.clone();
        let next = match existing {
            Some(ref verifier) => {
                let old = old.ok_or(VaultError::Authentication)?;
                authorize(Some(verifier), old).await?;
                rekey(snapshot, old, new, self.configured_kdf).await?
            }
            None => establish(snapshot, new, self.configured_kdf).await?,
        };

        store::persist(&self.path, &next)?;
        let count = next.credentials.len();
        *self.state.write().await = next;

        info!("Master password updated ({} credentials re-sealed)", count);
        Ok(())
    }

    /// Checks `candidate` against the stored verifier. Never errors.
    pub async fn verify_master_password(&self, candidate: &str) -> bool {
        let verifier = self.state.read().await.master_verifier.clone();
        authorize(verifier.as_ref(), candidate).await.is_ok()
    }

    /// Lists every credential without secrets, in insertion order.
    ///
    /// # Errors
    /// Returns `Authentication` if `password` is wrong.
    pub async fn list_credentials(
        &self,
        password: &str,
    ) -> Result<Vec<CredentialSummary>, VaultError> {
        let snapshot = self.authorized_snapshot(password).await?;
        Ok(snapshot
            .credentials
            .iter()
            .map(CredentialRecord::summary)
            .collect())
    }

    /// Returns one credential with its secret decrypted.
    ///
    /// # Errors
    /// `Authentication` for a wrong password, `NotFound` for an unknown id,
    /// `Decryption` if the stored blob is corrupt.
    pub async fn get_credential(&self, id: &str, password: &str) -> Result<Credential, VaultError> {
        let snapshot = self.authorized_snapshot(password).await?;
        let record = snapshot
            .credentials
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;

        let secret = match record.secret {
            Some(ref blob) => Some(
                cipher::decrypt_async(
                    blob.clone(),
                    Zeroizing::new(password.to_string()),
                    snapshot.kdf,
                )
                .await?,
            ),
            None => None,
        };

        Ok(Credential {
            summary: record.summary(),
            secret,
        })
    }

    /// Inserts or replaces a credential and returns its id.
    ///
    /// A draft without an id gets a fresh UUID. A draft whose id matches an
    /// existing record replaces that record entirely.
    ///
    /// # Errors
    /// `Authentication` for a wrong password (checked first), `InvalidInput`
    /// for a draft without host or username, or a persistence error.
    pub async fn save_credential(
        &self,
        draft: CredentialDraft,
        password: &str,
    ) -> Result<String, VaultError> {
        let _guard = self.mutation.lock().await;
        let mut next = self.authorized_snapshot(password).await?;
        validate(&draft)?;

        let secret = match draft.secret {
            Some(plaintext) => Some(
                cipher::encrypt_async(plaintext, Zeroizing::new(password.to_string()), next.kdf)
                    .await?,
            ),
            None => None,
        };

        let id = draft
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let record = CredentialRecord {
            id: id.clone(),
            host: draft.host,
            port: draft.port,
            username: draft.username,
            secret,
            display_name: draft.display_name.filter(|n| !n.is_empty()),
            tags: draft.tags,
            last_used_at: now_millis(),
        };

        let replaced = match next.position(&id) {
            Some(index) => {
                next.credentials[index] = record;
                true
            }
            None => {
                next.credentials.push(record);
                false
            }
        };

        store::persist(&self.path, &next)?;
        *self.state.write().await = next;

        info!("Saved credential {} (replaced={})", id, replaced);
        Ok(id)
    }

    /// Removes a credential. Returns false when the id was not present.
    ///
    /// # Errors
    /// `Authentication` for a wrong password, or a persistence error.
    pub async fn delete_credential(&self, id: &str, password: &str) -> Result<bool, VaultError> {
        let _guard = self.mutation.lock().await;
        let mut next = self.authorized_snapshot(password).await?;

        let Some(index) = next.position(id) else {
            debug!("Delete of unknown credential {} ignored", id);
            return Ok(false);
        };
        next.credentials.remove(index);

        store::persist(&self.path, &next)?;
        *self.state.write().await = next;

        info!("Deleted credential {}", id);
        Ok(true)
    }

    /// Case-insensitive substring search over display name, host, username
    /// and tags. Insertion order is kept.
    ///
    /// # Errors
    /// Returns `Authentication` if `password` is wrong.
    pub async fn search_credentials(
        &self,
        query: &str,
        password: &str,
    ) -> Result<Vec<CredentialSummary>, VaultError> {
        let snapshot = self.authorized_snapshot(password).await?;
        let needle = query.to_lowercase();
        Ok(snapshot
            .credentials
            .iter()
            .filter(|c| c.matches(&needle))
            .map(CredentialRecord::summary)
            .collect())
    }

    /// Stamps a credential as used now.
    ///
    /// # Errors
    /// `Authentication`, `NotFound`, or a persistence error.
    pub async fn touch_credential(&self, id: &str, password: &str) -> Result<(), VaultError> {
        let _guard = self.mutation.lock().await;
        let mut next = self.authorized_snapshot(password).await?;

        let index = next
            .position(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        next.credentials[index].last_used_at = now_millis();

        store::persist(&self.path, &next)?;
        *self.state.write().await = next;
        Ok(())
    }

    /// Verifies `password` and returns a consistent copy of the state.
    async fn authorized_snapshot(&self, password: &str) -> Result<VaultState, VaultError> {
        let snapshot = self.state.read().await.clone();
        authorize(snapshot.master_verifier.as_ref(), password).await?;
        Ok(snapshot)
    }
}

/// Checks `password` against `verifier` on the blocking pool.
async fn authorize(verifier: Option<&String>, password: &str) -> Result<(), VaultError> {
    let Some(verifier) = verifier.cloned() else {
        return Err(VaultError::Authentication);
    };
    let candidate = Zeroizing::new(password.to_string());

    let valid = tokio::task::spawn_blocking(move || verifier::verify(&candidate, &verifier))
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?;

    if valid {
        Ok(())
    } else {
        warn!("Master password verification failed");
        Err(VaultError::Authentication)
    }
}

/// First-time setup: sets the verifier and keeps any existing records.
async fn establish(
    mut state: VaultState,
    new: &str,
    configured_kdf: KdfParams,
) -> Result<VaultState, VaultError> {
    // Records sealed before a verifier existed keep their parameters.
    if !state.credentials.iter().any(|c| c.secret.is_some()) {
        state.kdf = configured_kdf;
    }

    let password = Zeroizing::new(new.to_string());
    let kdf = state.kdf;
    let verifier = tokio::task::spawn_blocking(move || verifier::create(&password, &kdf))
        .await
        .map_err(|e| VaultError::Task(e.to_string()))??;

    state.master_verifier = Some(verifier);
    Ok(state)
}

/// Re-seals every secret from `old` to `new` under `target_kdf`.
async fn rekey(
    state: VaultState,
    old: &str,
    new: &str,
    target_kdf: KdfParams,
) -> Result<VaultState, VaultError> {
    let old = Zeroizing::new(old.to_string());
    let new = Zeroizing::new(new.to_string());

    tokio::task::spawn_blocking(move || -> Result<VaultState, VaultError> {
        let mut next = state;
        for record in &mut next.credentials {
            if let Some(ref blob) = record.secret {
                let plaintext = cipher::decrypt(blob, &old, &next.kdf)?;
                record.secret = Some(cipher::encrypt(&plaintext, &new, &target_kdf)?);
            }
        }
        next.kdf = target_kdf;
        next.master_verifier = Some(verifier::create(&new, &target_kdf)?);
        Ok(next)
    })
    .await
    .map_err(|e| VaultError::Task(e.to_string()))?
}

fn validate(draft: &CredentialDraft) -> Result<(), VaultError> {
    if draft.host.trim().is_empty() {
        return Err(VaultError::InvalidInput("host cannot be empty".to_string()));
    }
    if draft.username.trim().is_empty() {
        return Err(VaultError::InvalidInput(
            "username cannot be empty".to_string(),
        ));
    }
    if draft.port == 0 {
        return Err(VaultError::InvalidInput("port cannot be 0".to_string()));
    }
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
