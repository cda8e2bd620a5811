//! Master password verifier.
//!
//! The verifier is an Argon2id PHC string with its own random salt, kept
//! independent from the per-blob salts used for encryption. Vaults written
//! by older releases stored an unsalted SHA-256 hex digest; those are still
//! accepted for verification and replaced on the next password change.

use aes_gcm::aead::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::cipher::{CipherError, KdfParams};

/// Length of a legacy hex-encoded SHA-256 verifier.
const LEGACY_VERIFIER_LEN: usize = 64;

/// Computes a fresh verifier for `password`.
///
/// # Errors
/// Returns `Kdf` if the parameters are unusable.
pub fn create(password: &str, params: &KdfParams) -> Result<String, CipherError> {
    let argon2 = params.argon2()?;
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CipherError::Kdf(e.to_string()))
}

/// Checks `candidate` against a stored verifier. Never panics.
#[must_use]
pub fn verify(candidate: &str, verifier: &str) -> bool {
    if is_legacy(verifier) {
        let digest = hex::encode(Sha256::digest(candidate.as_bytes()));
        return digest
            .as_bytes()
            .ct_eq(verifier.to_ascii_lowercase().as_bytes())
            .into();
    }

    let Ok(parsed) = PasswordHash::new(verifier) else {
        return false;
    };

    // Cost parameters are read back from the PHC string.
    argon2::Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

/// Returns true for verifiers written in the legacy SHA-256 format.
#[must_use]
pub fn is_legacy(verifier: &str) -> bool {
    verifier.len() == LEGACY_VERIFIER_LEN && verifier.bytes().all(|b| b.is_ascii_hexdigit())
}
