//! Remote filesystem channels.
//!
//! Each channel owns its own connection and file transfer subsystem and a
//! directory cursor. Operations on one channel run one at a time; separate
//! channels proceed independently. A failed operation is reported with the
//! channel id and leaves the channel open.

pub mod entry;

pub use entry::{DirectoryListing, EntryKind, RemoteEntry, compare_entries, sort_entries};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::transport::{Connection, Endpoint, RemoteFs, Transport};

/// Directory listed when a channel opens without an explicit path.
pub const DEFAULT_REMOTE_PATH: &str = "/";

/// Identifier of a filesystem channel. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from filesystem channel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// No open channel with this id.
    #[error("Filesystem channel {0} not found")]
    NotFound(ChannelId),

    /// Connecting or starting the subsystem failed; no channel was opened.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// An operation on an open channel failed. The channel stays open.
    #[error("Channel {channel_id}: {message}")]
    Channel {
        channel_id: ChannelId,
        message: String,
    },
}

/// Result of a mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub channel_id: ChannelId,
    /// Remote path that was changed.
    pub path: String,
    /// Bytes transferred, for uploads.
    pub bytes: Option<u64>,
    /// Fresh listing of the cursor directory, if the refresh succeeded.
    pub listing: Option<DirectoryListing>,
}

/// Result of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub channel_id: ChannelId,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub bytes: u64,
}

/// State of one open channel.
struct FsChannel {
    endpoint: Endpoint,
    connection: Box<dyn Connection>,
    fs: Box<dyn RemoteFs>,
    current_path: String,
    last_error: Option<String>,
}

impl FsChannel {
    /// Records `err` and wraps it with the channel id.
    fn fail(&mut self, id: ChannelId, err: impl fmt::Display) -> FsError {
        let message = err.to_string();
        warn!(
            "Filesystem channel {} ({}): {}",
            id,
            self.endpoint.display_string(),
            message
        );
        self.last_error = Some(message.clone());
        FsError::Channel {
            channel_id: id,
            message,
        }
    }

    async fn list(&self, id: ChannelId, path: &str) -> Result<DirectoryListing, String> {
        let mut entries = self.fs.read_dir(path).await.map_err(|e| e.to_string())?;
        sort_entries(&mut entries);
        Ok(DirectoryListing {
            channel_id: id,
            path: path.to_string(),
            entries,
        })
    }

    /// Builds a mutation outcome with a best-effort refresh of the cursor.
    async fn outcome(&mut self, id: ChannelId, path: String, bytes: Option<u64>) -> MutationOutcome {
        self.last_error = None;
        let cursor = self.current_path.clone();
        let listing = match self.list(id, &cursor).await {
            Ok(listing) => Some(listing),
            Err(e) => {
                debug!("Refresh of {} on channel {} failed: {}", cursor, id, e);
                None
            }
        };
        MutationOutcome {
            channel_id: id,
            path,
            bytes,
            listing,
        }
    }
}

/// Owns every open filesystem channel.
pub struct FilesystemManager {
    transport: Arc<dyn Transport>,
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<FsChannel>>>>,
    next_id: AtomicU64,
    default_path: String,
    download_dir: PathBuf,
}

impl FilesystemManager {
    /// Creates a manager with `/` as default path and the user's download
    /// directory as download target.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_path: DEFAULT_REMOTE_PATH.to_string(),
            download_dir: default_download_dir(),
        }
    }

    /// Sets the directory listed when no initial path is given.
    #[must_use]
    pub fn with_default_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        assert!(!path.is_empty(), "default path must not be empty");
        self.default_path = path;
        self
    }

    /// Sets where downloads land when no local path is given.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Connects, starts the subsystem and lists the initial directory.
    ///
    /// If the initial listing fails the channel stays open and the error
    /// carries its id, so the caller can retry with another path.
    ///
    /// # Errors
    /// `Connection` if no channel could be opened, `Channel` if the initial
    /// listing failed.
    pub async fn open_channel(
        &self,
        endpoint: &Endpoint,
        initial_path: Option<&str>,
    ) -> Result<DirectoryListing, FsError> {
        let connection = self
            .transport
            .connect(endpoint)
            .await
            .map_err(|e| FsError::Connection(e.to_string()))?;

        let fs = match connection.open_filesystem().await {
            Ok(fs) => fs,
            Err(e) => {
                connection.close().await;
                return Err(FsError::Connection(e.to_string()));
            }
        };

        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let path = normalize_path(initial_path.unwrap_or(&self.default_path));

        let mut channel = FsChannel {
            endpoint: endpoint.clone(),
            connection,
            fs,
            current_path: path.clone(),
            last_error: None,
        };

        let listed = channel.list(id, &path).await;
        let result = listed.map_err(|e| channel.fail(id, e));

        self.channels
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(channel)));
        info!(
            "Opened filesystem channel {} to {}",
            id,
            endpoint.display_string()
        );

        result
    }

    /// Lists `path` (relative paths resolve against the cursor) and moves
    /// the cursor there on success.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if listing failed.
    pub async fn list_directory(
        &self,
        id: ChannelId,
        path: &str,
    ) -> Result<DirectoryListing, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let target = resolve_path(path, &channel.current_path);
        let result = channel.list(id, &target).await;
        match result {
            Ok(listing) => {
                channel.current_path = target;
                channel.last_error = None;
                Ok(listing)
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Lists the parent of the cursor directory and moves there. At `/` the
    /// root is listed again.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if listing failed.
    pub async fn go_up(&self, id: ChannelId) -> Result<DirectoryListing, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let target = parent_path(&channel.current_path);
        let result = channel.list(id, &target).await;
        match result {
            Ok(listing) => {
                channel.current_path = target;
                channel.last_error = None;
                Ok(listing)
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Uploads a local file. The remote path defaults to the cursor
    /// directory plus the local file name.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if the transfer failed.
    pub async fn upload_file(
        &self,
        id: ChannelId,
        local: &Path,
        remote: Option<&str>,
    ) -> Result<MutationOutcome, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let target = match remote {
            Some(remote) => resolve_path(remote, &channel.current_path),
            None => match local.file_name() {
                Some(name) => join_path(&channel.current_path, &name.to_string_lossy()),
                None => {
                    return Err(channel.fail(
                        id,
                        format!("Invalid local file: {}", local.display()),
                    ));
                }
            },
        };

        let result = channel.fs.upload(local, &target).await;
        match result {
            Ok(bytes) => {
                info!("Uploaded {} to {} ({} bytes)", local.display(), target, bytes);
                Ok(channel.outcome(id, target, Some(bytes)).await)
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Downloads a remote file. The local path defaults to the download
    /// directory plus the remote base name.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if the transfer failed.
    pub async fn download_file(
        &self,
        id: ChannelId,
        remote: &str,
        local: Option<&Path>,
    ) -> Result<DownloadOutcome, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let source = resolve_path(remote, &channel.current_path);
        let local_path = match local {
            Some(path) => path.to_path_buf(),
            None => self.download_dir.join(base_name(&source)),
        };

        let result = channel.fs.download(&source, &local_path).await;
        match result {
            Ok(bytes) => {
                channel.last_error = None;
                info!(
                    "Downloaded {} to {} ({} bytes)",
                    source,
                    local_path.display(),
                    bytes
                );
                Ok(DownloadOutcome {
                    channel_id: id,
                    remote_path: source,
                    local_path,
                    bytes,
                })
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Deletes a file or an empty directory.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if the delete failed.
    pub async fn delete_entry(&self, id: ChannelId, path: &str) -> Result<MutationOutcome, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let target = resolve_path(path, &channel.current_path);
        if target == "/" {
            return Err(channel.fail(id, "Refusing to delete /"));
        }

        let result = channel.fs.remove(&target).await;
        match result {
            Ok(()) => {
                info!("Deleted {} on channel {}", target, id);
                Ok(channel.outcome(id, target, None).await)
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Creates a directory.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if creation failed.
    pub async fn create_directory(
        &self,
        id: ChannelId,
        path: &str,
    ) -> Result<MutationOutcome, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let target = resolve_path(path, &channel.current_path);
        let result = channel.fs.mkdir(&target).await;
        match result {
            Ok(()) => {
                info!("Created directory {} on channel {}", target, id);
                Ok(channel.outcome(id, target, None).await)
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Renames or moves an entry.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel, `Channel` if the rename failed.
    pub async fn rename(
        &self,
        id: ChannelId,
        from: &str,
        to: &str,
    ) -> Result<MutationOutcome, FsError> {
        let handle = self.channel(id).await?;
        let mut channel = handle.lock().await;

        let source = resolve_path(from, &channel.current_path);
        let target = resolve_path(to, &channel.current_path);
        let result = channel.fs.rename(&source, &target).await;
        match result {
            Ok(()) => {
                info!("Renamed {} to {} on channel {}", source, target, id);
                Ok(channel.outcome(id, target, None).await)
            }
            Err(e) => Err(channel.fail(id, e)),
        }
    }

    /// Disconnects and forgets a channel. Returns false if it was unknown.
    pub async fn close_channel(&self, id: ChannelId) -> bool {
        let Some(handle) = self.channels.write().await.remove(&id) else {
            return false;
        };

        // Waits for any in-flight operation on this channel.
        let channel = handle.lock().await;
        channel.connection.close().await;
        info!("Closed filesystem channel {}", id);
        true
    }

    /// Closes every open channel.
    pub async fn close_all(&self) {
        let ids: Vec<_> = self.channels.read().await.keys().copied().collect();
        for id in ids {
            self.close_channel(id).await;
        }
    }

    /// Returns the cursor directory of a channel.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub async fn current_path(&self, id: ChannelId) -> Result<String, FsError> {
        let handle = self.channel(id).await?;
        let channel = handle.lock().await;
        Ok(channel.current_path.clone())
    }

    /// Returns the most recent error of a channel, cleared by the next
    /// successful operation.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub async fn last_error(&self, id: ChannelId) -> Result<Option<String>, FsError> {
        let handle = self.channel(id).await?;
        let channel = handle.lock().await;
        Ok(channel.last_error.clone())
    }

    /// Ids of all open channels, ascending.
    pub async fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of open channels.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// True if no channel is open.
    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    async fn channel(&self, id: ChannelId) -> Result<Arc<Mutex<FsChannel>>, FsError> {
        self.channels
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FsError::NotFound(id))
    }
}

/// Returns `~/Downloads`, or the platform download directory.
#[must_use]
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Downloads")
    })
}

/// Resolves `path` against `cwd` and normalizes `.` and `..` segments.
#[must_use]
pub fn resolve_path(path: &str, cwd: &str) -> String {
    if path.is_empty() {
        return normalize_path(cwd);
    }
    if path.starts_with('/') {
        normalize_path(path)
    } else {
        normalize_path(&format!("{}/{}", cwd.trim_end_matches('/'), path))
    }
}

/// Collapses duplicate slashes, `.` and `..` in an absolute path.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Joins a directory and a name with exactly one slash.
#[must_use]
pub fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Last segment of a remote path.
#[must_use]
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Parent directory of a remote path.
#[must_use]
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}
