//! Vault document persistence.
//!
//! The whole vault is one JSON document. Every write replaces it
//! atomically: serialize, write a sibling temp file, sync, rename.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::VaultError;
use super::cipher::KdfParams;
use super::record::CredentialRecord;

/// Maximum size of the vault document (1MB).
pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Persisted vault state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultState {
    /// Master password verifier; absent until a password is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_verifier: Option<String>,
    /// KDF parameters every stored blob was sealed with.
    #[serde(default)]
    pub kdf: KdfParams,
    /// Records in insertion order.
    #[serde(default)]
    pub credentials: Vec<CredentialRecord>,
}

impl VaultState {
    /// Creates an empty, uninitialized state.
    #[must_use]
    pub fn new(kdf: KdfParams) -> Self {
        Self {
            master_verifier: None,
            kdf,
            credentials: Vec::new(),
        }
    }

    /// Returns the index of the record with `id`.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.credentials.iter().position(|c| c.id == id)
    }
}

/// Returns the default vault path (`~/.sshdeck/vault.json`).
#[must_use]
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sshdeck")
        .join("vault.json")
}

/// Loads the vault document, or `None` if the file does not exist.
///
/// # Errors
/// Returns error if the file is unreadable, too large, or not a vault.
pub fn load(path: &Path) -> Result<Option<VaultState>, VaultError> {
    if !path.exists() {
        return Ok(None);
    }

    let metadata = fs::metadata(path)?;
    if metadata.len() > MAX_FILE_SIZE {
        return Err(VaultError::FileTooLarge);
    }

    let content = fs::read_to_string(path)?;
    let state: VaultState = serde_json::from_str(&content)?;
    debug!(
        "Loaded vault from {} ({} credentials)",
        path.display(),
        state.credentials.len()
    );
    Ok(Some(state))
}

/// Writes the whole vault document atomically.
///
/// # Errors
/// Returns error if serialization or any filesystem step fails. On error
/// the previous document is left in place.
pub fn persist(path: &Path, state: &VaultState) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = serde_json::to_string_pretty(state)?;
    if content.len() as u64 > MAX_FILE_SIZE {
        return Err(VaultError::FileTooLarge);
    }

    let temp_path = path.with_extension("tmp");
    if let Err(e) = write_private(&temp_path, content.as_bytes()) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    debug!(
        "Persisted vault to {} ({} credentials)",
        path.display(),
        state.credentials.len()
    );
    Ok(())
}

/// Writes `content` to a fresh file readable only by the owner.
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    // A leftover temp file may carry wider permissions.
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}
