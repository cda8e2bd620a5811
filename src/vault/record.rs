//! Credential record types.
//!
//! [`CredentialRecord`] is the persisted form and never leaves the vault.
//! Callers see [`CredentialSummary`] (metadata only) or [`Credential`]
//! (metadata plus the decrypted secret).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::cipher::EncryptedBlob;
use crate::transport::Endpoint;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// A stored login as persisted in the vault document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Stable unique identifier.
    pub id: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Sealed secret, if one was saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<EncryptedBlob>,
    /// User-facing label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Last save or use, epoch milliseconds.
    #[serde(default)]
    pub last_used_at: i64,
}

impl CredentialRecord {
    /// Strips the secret, keeping only a presence flag.
    #[must_use]
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            tags: self.tags.clone(),
            last_used_at: self.last_used_at,
            has_secret: self.secret.is_some(),
        }
    }

    /// Case-insensitive substring match on name, host, username and tags.
    ///
    /// `needle` must already be lowercase.
    #[must_use]
    pub fn matches(&self, needle: &str) -> bool {
        let hit = |s: &str| s.to_lowercase().contains(needle);

        self.display_name.as_deref().is_some_and(hit)
            || hit(&self.host)
            || hit(&self.username)
            || self.tags.iter().any(|t| hit(t))
    }
}

/// Input for saving a credential.
#[derive(Clone, Default)]
pub struct CredentialDraft {
    /// Existing id to replace; a new id is generated when absent.
    pub id: Option<String>,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Plaintext secret to seal.
    pub secret: Option<Zeroizing<String>>,
    /// User-facing label.
    pub display_name: Option<String>,
    /// Free-form tags.
    pub tags: BTreeSet<String>,
}

impl CredentialDraft {
    /// Creates a draft for `username@host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            ..Self::default()
        }
    }

    /// Sets the id of the record to replace.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the secret to seal.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(Zeroizing::new(secret.into()));
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Credential metadata without the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub display_name: Option<String>,
    pub tags: BTreeSet<String>,
    pub last_used_at: i64,
    /// True when a sealed secret is stored.
    pub has_secret: bool,
}

impl CredentialSummary {
    /// Returns the display name, or the host when unnamed.
    #[must_use]
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.host)
    }

    /// Returns `user@host` with the port appended when non-default.
    #[must_use]
    pub fn connection_string(&self) -> String {
        if self.port == DEFAULT_PORT {
            format!("{}@{}", self.username, self.host)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

/// A credential with its secret decrypted.
#[derive(Clone)]
pub struct Credential {
    /// Record metadata.
    pub summary: CredentialSummary,
    /// Decrypted secret, wiped on drop.
    pub secret: Option<Zeroizing<String>>,
}

impl Credential {
    /// Builds connection parameters from this credential.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        let endpoint = Endpoint::new(
            self.summary.host.clone(),
            self.summary.port,
            self.summary.username.clone(),
        );
        match self.secret {
            Some(ref secret) => endpoint.with_password(secret.as_str()),
            None => endpoint,
        }
    }
}

impl fmt::Debug for CredentialDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialDraft")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("has_secret", &self.secret.is_some())
            .field("display_name", &self.display_name)
            .field("tags", &self.tags)
            .finish()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("summary", &self.summary)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Parses `user@host[:port]` into its parts.
#[must_use]
pub fn parse_target(target: &str) -> Option<(String, String, u16)> {
    let (user, rest) = target.split_once('@')?;
    if user.is_empty() || rest.is_empty() {
        return None;
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (rest, DEFAULT_PORT),
    };
    if host.is_empty() || port == 0 {
        return None;
    }

    Some((user.to_string(), host.to_string(), port))
}
