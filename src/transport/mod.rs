//! Remote-authentication client boundary.
//!
//! Everything above this module talks to remote hosts only through the
//! [`Transport`], [`Connection`] and [`RemoteFs`] traits. The production
//! implementation lives in [`ssh`]; tests plug in an in-memory one.

pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::remote::RemoteEntry;

pub use ssh::SshTransport;

/// Connection parameters for one remote host.
#[derive(Clone)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Password, or key passphrase when `key_path` is set.
    pub password: Option<Zeroizing<String>>,
    /// Private key file.
    pub key_path: Option<PathBuf>,
}

impl Endpoint {
    /// Creates an endpoint without credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            key_path: None,
        }
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(Zeroizing::new(password.to_string()));
        self
    }

    /// Sets the private key file.
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns `user@host:port` for logs and messages.
    #[must_use]
    pub fn display_string(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Pseudo-terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Result of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl ExecOutput {
    /// True when the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Control messages for an interactive shell channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    /// Raw bytes for the remote side.
    Data(Vec<u8>),
    /// PTY size change.
    Resize(PtySize),
    /// Close the channel.
    Close,
}

/// An open interactive shell.
///
/// `output` yields remote bytes in arrival order and ends when the channel
/// closes. Dropping `control` also closes the channel.
#[derive(Debug)]
pub struct ShellChannel {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub control: mpsc::UnboundedSender<ShellInput>,
}

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// TCP connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SSH handshake failed.
    #[error("SSH handshake failed: {0}")]
    HandshakeFailed(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Channel or subsystem could not be opened.
    #[error("Channel error: {0}")]
    ChannelFailed(String),

    /// Remote file operation failed.
    #[error("File error: {0}")]
    FileError(String),

    /// Command execution failed.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Local I/O failed.
    #[error("IO error: {0}")]
    Io(String),
}

/// Opens authenticated connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects and authenticates to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;
}

/// One authenticated connection. Channels opened from it are independent.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens an interactive shell with a PTY.
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError>;

    /// Runs `command` to completion and collects its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError>;

    /// Starts the file transfer subsystem.
    async fn open_filesystem(&self) -> Result<Box<dyn RemoteFs>, TransportError>;

    /// Disconnects. Safe to call more than once.
    async fn close(&self);
}

/// Remote filesystem operations over one connection.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Lists `path` without `.` and `..`, in server order.
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    /// Copies a local file to `remote`, returning bytes written.
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError>;

    /// Copies `remote` to a local file, returning bytes written.
    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError>;

    /// Removes a file or an empty directory.
    async fn remove(&self, path: &str) -> Result<(), TransportError>;

    /// Creates a directory.
    async fn mkdir(&self, path: &str) -> Result<(), TransportError>;

    /// Renames or moves an entry.
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;
}
