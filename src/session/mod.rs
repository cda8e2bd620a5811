//! Live session registry.
//!
//! A session is one authenticated connection plus one interactive shell
//! channel. The registry hands out [`SessionId`]s from a monotonically
//! increasing counter and multiplexes every session's output onto a single
//! [`SessionEvents`] stream. Each session produces exactly one
//! [`SessionEvent::Closed`], whether the local side or the remote side ends
//! it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::transport::{Connection, Endpoint, PtySize, ShellChannel, ShellInput, Transport};

/// Events buffered before forwarders wait for the consumer.
const EVENT_BACKLOG: usize = 1024;

/// Identifier of a session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an issued session id.
///
/// Ids are issued only once the shell is open, so a connecting session has
/// no id yet; [`SessionRegistry::connecting`] counts those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Shell open and relaying.
    Ready,
    /// Terminal; the id is gone from the registry and never reused.
    Closed,
}

/// Event delivered on the multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Shell output, in arrival order per session.
    Data { id: SessionId, bytes: Vec<u8> },
    /// The session ended. Sent once per session, after its last `Data`.
    Closed { id: SessionId },
}

impl SessionEvent {
    /// Session the event belongs to.
    #[must_use]
    pub fn id(&self) -> SessionId {
        match self {
            Self::Data { id, .. } | Self::Closed { id } => *id,
        }
    }
}

/// Receiving half of the multiplexed event stream.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Waits for the next event. Returns `None` once the registry and every
    /// forwarder are gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Returns an event if one is ready.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Errors from session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Connecting, authenticating or opening the shell failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No live session with this id.
    #[error("Session {0} not found")]
    NotFound(SessionId),
}

/// Snapshot of one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub endpoint: Endpoint,
    pub created_at: DateTime<Local>,
    /// Most recent failure to reach the shell, if any.
    pub last_error: Option<String>,
}

struct SessionEntry {
    endpoint: Endpoint,
    created_at: DateTime<Local>,
    last_error: Option<String>,
    control: mpsc::UnboundedSender<ShellInput>,
    connection: Arc<dyn Connection>,
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
    connecting: AtomicUsize,
    events: mpsc::Sender<SessionEvent>,
    pty_size: PtySize,
}

impl RegistryInner {
    /// Removes a session and tears down its channel and connection.
    async fn retire(&self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.write().await.remove(&id) else {
            return false;
        };

        let _ = entry.control.send(ShellInput::Close);
        entry.connection.close().await;
        info!(
            "Session {} to {} closed",
            id,
            entry.endpoint.display_string()
        );
        true
    }

    /// Sends a control message to a live shell. A failed send is recorded
    /// as the session's last error.
    async fn send_control(&self, id: SessionId, input: ShellInput) -> bool {
        let failure = {
            let sessions = self.sessions.read().await;
            let Some(entry) = sessions.get(&id) else {
                debug!("Input for unknown session {} dropped", id);
                return false;
            };
            match entry.control.send(input) {
                Ok(()) => return true,
                Err(_) => format!("Shell channel of session {} is closed", id),
            }
        };

        warn!("{}", failure);
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.last_error = Some(failure);
        }
        false
    }
}

/// Registry of live sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Creates a registry with an 80x24 PTY for new shells.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> (Self, SessionEvents) {
        Self::with_pty_size(transport, PtySize::default())
    }

    /// Creates a registry that opens shells with `pty_size`.
    #[must_use]
    pub fn with_pty_size(
        transport: Arc<dyn Transport>,
        pty_size: PtySize,
    ) -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::channel(EVENT_BACKLOG);
        let registry = Self {
            inner: Arc::new(RegistryInner {
                transport,
                sessions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connecting: AtomicUsize::new(0),
                events: tx,
                pty_size,
            }),
        };
        (registry, SessionEvents { rx })
    }

    /// Connects to `endpoint`, opens a shell and registers the session.
    ///
    /// On failure nothing is registered and any partial connection is
    /// closed.
    ///
    /// # Errors
    /// Returns `Connection` with the transport's message.
    pub async fn create_session(&self, endpoint: &Endpoint) -> Result<SessionId, SessionError> {
        self.inner.connecting.fetch_add(1, Ordering::SeqCst);
        info!(
            "Creating session to {} ({} connecting)",
            endpoint.display_string(),
            self.connecting()
        );

        let opened = self.open(endpoint).await;
        self.inner.connecting.fetch_sub(1, Ordering::SeqCst);

        let (connection, shell) = opened.inspect_err(|e| {
            warn!("Session to {} failed: {}", endpoint.display_string(), e);
        })?;

        let ShellChannel { output, control } = shell;

        // Issue the id under the write lock so `state` never sees it early.
        let id = {
            let mut sessions = self.inner.sessions.write().await;
            let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            sessions.insert(
                id,
                SessionEntry {
                    endpoint: endpoint.clone(),
                    created_at: Local::now(),
                    last_error: None,
                    control,
                    connection,
                },
            );
            id
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(forward(inner, id, output));

        info!("Session {} ready ({})", id, endpoint.display_string());
        Ok(id)
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
    ) -> Result<(Arc<dyn Connection>, ShellChannel), SessionError> {
        let connection: Arc<dyn Connection> = self
            .inner
            .transport
            .connect(endpoint)
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?
            .into();

        match connection.open_shell(self.inner.pty_size).await {
            Ok(shell) => Ok((connection, shell)),
            Err(e) => {
                connection.close().await;
                Err(SessionError::Connection(e.to_string()))
            }
        }
    }

    /// Writes raw bytes to a session's shell. Unknown ids are ignored and
    /// return false; a shell that no longer accepts input sets `last_error`.
    pub async fn send_input(&self, id: SessionId, bytes: &[u8]) -> bool {
        self.inner
            .send_control(id, ShellInput::Data(bytes.to_vec()))
            .await
    }

    /// Forwards a PTY size change. Unknown ids are ignored and return false.
    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> bool {
        self.inner
            .send_control(id, ShellInput::Resize(PtySize { cols, rows }))
            .await
    }

    /// Closes a session. Returns false if it was not open.
    pub async fn close_session(&self, id: SessionId) -> bool {
        self.inner.retire(id).await
    }

    /// Closes every open session.
    pub async fn close_all(&self) {
        for id in self.session_ids().await {
            self.inner.retire(id).await;
        }
    }

    /// Returns the endpoint a session was opened with.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown or closed session.
    pub async fn endpoint(&self, id: SessionId) -> Result<Endpoint, SessionError> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.endpoint.clone())
            .ok_or(SessionError::NotFound(id))
    }

    /// Returns a snapshot of a session.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown or closed session.
    pub async fn session_info(&self, id: SessionId) -> Result<SessionInfo, SessionError> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .map(|entry| SessionInfo {
                id,
                endpoint: entry.endpoint.clone(),
                created_at: entry.created_at,
                last_error: entry.last_error.clone(),
            })
            .ok_or(SessionError::NotFound(id))
    }

    /// State of an id: `Ready` while live, `Closed` once retired, `None` if
    /// it was never issued.
    pub async fn state(&self, id: SessionId) -> Option<SessionState> {
        let sessions = self.inner.sessions.read().await;
        if sessions.contains_key(&id) {
            Some(SessionState::Ready)
        } else if id.0 >= 1 && id.0 < self.inner.next_id.load(Ordering::SeqCst) {
            Some(SessionState::Closed)
        } else {
            None
        }
    }

    /// Ids of all live sessions, ascending.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.sessions.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// True if no session is live.
    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// Number of `create_session` calls still connecting.
    #[must_use]
    pub fn connecting(&self) -> usize {
        self.inner.connecting.load(Ordering::SeqCst)
    }
}

/// Relays one shell's output, then retires the session and announces the
/// closure.
async fn forward(inner: Arc<RegistryInner>, id: SessionId, mut output: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = output.recv().await {
        if inner.events.send(SessionEvent::Data { id, bytes }).await.is_err() {
            debug!("Event stream dropped, discarding output of session {}", id);
        }
    }

    if inner.retire(id).await {
        debug!("Session {} ended by remote side", id);
    }
    let _ = inner.events.send(SessionEvent::Closed { id }).await;
}
