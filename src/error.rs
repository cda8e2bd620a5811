//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::remote::FsError;
use crate::session::SessionError;
use crate::transport::TransportError;
use crate::vault::{CipherError, VaultError};

/// Any error surfaced by sshdeck.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad command line or input.
    #[error("{0}")]
    Usage(String),
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
