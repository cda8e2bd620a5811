//! Authenticated blob cipher for stored secrets.
//!
//! Each secret is sealed on its own: a fresh random salt feeds Argon2id to
//! derive a 256-bit key from the master password, and a fresh random nonce
//! is used for AES-256-GCM. The resulting blob is self-contained and can be
//! opened with nothing but the password and the KDF parameters.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Salt length for key derivation in bytes.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Derived key length in bytes (AES-256).
const KEY_LEN: usize = 32;

/// Default Argon2id memory cost in KiB (19 MiB).
pub const DEFAULT_MEMORY_KIB: u32 = 19_456;

/// Default Argon2id iteration count.
pub const DEFAULT_ITERATIONS: u32 = 2;

/// Default Argon2id lane count.
pub const DEFAULT_PARALLELISM: u32 = 1;

/// Errors produced by the blob cipher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// Blob could not be opened. Deliberately carries no cause.
    #[error("Decryption failed")]
    Decryption,

    /// Sealing failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// KDF parameters were rejected.
    #[error("Invalid key derivation parameters: {0}")]
    Kdf(String),

    /// Background worker failed.
    #[error("Cipher task failed: {0}")]
    Task(String),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_MEMORY_KIB,
            iterations: DEFAULT_ITERATIONS,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Creates a parameter set.
    #[must_use]
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }

    /// Builds the Argon2id context for these parameters.
    pub(crate) fn argon2(&self) -> Result<Argon2<'static>, CipherError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CipherError::Kdf(e.to_string()))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// A sealed secret. All fields are lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    /// KDF salt.
    pub salt: String,
    /// AES-GCM nonce.
    pub iv: String,
    /// Ciphertext without the tag.
    pub ciphertext: String,
    /// GCM authentication tag.
    pub auth_tag: String,
}

/// Derives the symmetric key for one blob.
fn derive_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
    let argon2 = params.argon2()?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| CipherError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Seals `plaintext` under `password`.
///
/// Salt and nonce are drawn from the OS RNG on every call, so sealing the
/// same plaintext twice never yields the same blob.
///
/// # Errors
/// Returns `Kdf` for unusable parameters, `Encryption` if AES-GCM fails.
pub fn encrypt(
    plaintext: &str,
    password: &str,
    params: &KdfParams,
) -> Result<EncryptedBlob, CipherError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CipherError::Encryption(e.to_string()))?;

    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| CipherError::Encryption(e.to_string()))?;

    // aes-gcm appends the tag to the ciphertext
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedBlob {
        salt: hex::encode(salt),
        iv: hex::encode(nonce),
        ciphertext: hex::encode(&sealed),
        auth_tag: hex::encode(tag),
    })
}

/// Opens a blob sealed by [`encrypt`].
///
/// # Errors
/// Returns `Decryption` for a wrong password, a tampered or truncated blob,
/// malformed hex, or non-UTF-8 plaintext. The cases are indistinguishable.
pub fn decrypt(
    blob: &EncryptedBlob,
    password: &str,
    params: &KdfParams,
) -> Result<Zeroizing<String>, CipherError> {
    let salt = hex::decode(&blob.salt).map_err(|_| CipherError::Decryption)?;
    let nonce = hex::decode(&blob.iv).map_err(|_| CipherError::Decryption)?;
    let mut sealed = hex::decode(&blob.ciphertext).map_err(|_| CipherError::Decryption)?;
    let tag = hex::decode(&blob.auth_tag).map_err(|_| CipherError::Decryption)?;

    if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(CipherError::Decryption);
    }

    let key = derive_key(password, &salt, params).map_err(|_| CipherError::Decryption)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CipherError::Decryption)?;

    sealed.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| CipherError::Decryption)?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| CipherError::Decryption)
}

/// [`encrypt`] on the blocking pool, so Argon2 never stalls I/O tasks.
pub async fn encrypt_async(
    plaintext: Zeroizing<String>,
    password: Zeroizing<String>,
    params: KdfParams,
) -> Result<EncryptedBlob, CipherError> {
    tokio::task::spawn_blocking(move || encrypt(&plaintext, &password, &params))
        .await
        .map_err(|e| CipherError::Task(e.to_string()))?
}

/// [`decrypt`] on the blocking pool.
pub async fn decrypt_async(
    blob: EncryptedBlob,
    password: Zeroizing<String>,
    params: KdfParams,
) -> Result<Zeroizing<String>, CipherError> {
    tokio::task::spawn_blocking(move || decrypt(&blob, &password, &params))
        .await
        .map_err(|e| CipherError::Task(e.to_string()))?
}
