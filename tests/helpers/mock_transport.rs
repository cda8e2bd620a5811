//! In-memory transport for integration tests.
//!
//! `MockTransport` implements the transport traits without any network:
//! shells echo their input back, `exec` answers from a table keyed by the
//! exact command string, and the filesystem is a path map shared by every
//! connection. Failures and hangs can be injected per behavior.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use sshdeck::remote::{EntryKind, RemoteEntry, normalize_path, parent_path};
use sshdeck::transport::{
    Connection, Endpoint, ExecOutput, PtySize, RemoteFs, ShellChannel, ShellInput, Transport,
    TransportError,
};

/// Canned answer for one command.
#[derive(Debug, Clone)]
pub enum MockExec {
    Output(ExecOutput),
    Fail(TransportError),
    /// Never completes.
    Hang,
}

impl MockExec {
    /// Successful run printing `stdout`.
    pub fn stdout(stdout: &str) -> Self {
        Self::Output(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: 0,
        })
    }

    /// Run with the given stderr and exit status.
    pub fn failing(stderr: &str, exit_status: i32) -> Self {
        Self::Output(ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_status,
        })
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct MockState {
    connect_error: Mutex<Option<TransportError>>,
    connect_delay: Mutex<Option<Duration>>,
    close_delay: Mutex<Option<Duration>>,
    shell_error: Mutex<Option<TransportError>>,
    fs_error: Mutex<Option<TransportError>>,
    commands: Mutex<HashMap<String, MockExec>>,
    tree: Mutex<BTreeMap<String, Node>>,
    denied: Mutex<HashSet<String>>,
    hangups: Mutex<Vec<Arc<Notify>>>,
    shell_sizes: Mutex<Vec<PtySize>>,
    deaf_shells: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// Scriptable in-memory transport. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a transport whose filesystem holds only `/`.
    pub fn new() -> Self {
        let state = MockState::default();
        state.tree.lock().unwrap().insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(state),
        }
    }

    /// Makes every connect fail with `err`.
    pub fn fail_connect(&self, err: TransportError) {
        *self.state.connect_error.lock().unwrap() = Some(err);
    }

    /// Delays every connect by `delay`.
    pub fn delay_connect(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Makes every close take `delay` before it counts.
    pub fn delay_close(&self, delay: Duration) {
        *self.state.close_delay.lock().unwrap() = Some(delay);
    }

    /// Makes `open_shell` fail with `err`.
    pub fn fail_shell(&self, err: TransportError) {
        *self.state.shell_error.lock().unwrap() = Some(err);
    }

    /// Makes new shells stop reading input while their output stays open
    /// until hang-up.
    pub fn deaf_shells(&self) {
        self.state.deaf_shells.store(true, Ordering::SeqCst);
    }

    /// Makes `open_filesystem` fail with `err`.
    pub fn fail_filesystem(&self, err: TransportError) {
        *self.state.fs_error.lock().unwrap() = Some(err);
    }

    /// Sets the answer for `command`. Unknown commands exit with 127.
    pub fn on_exec(&self, command: &str, answer: MockExec) {
        self.state
            .commands
            .lock()
            .unwrap()
            .insert(command.to_string(), answer);
    }

    /// Adds a directory, creating parents.
    pub fn add_dir(&self, path: &str) {
        let mut tree = self.state.tree.lock().unwrap();
        let mut current = normalize_path(path);
        while current != "/" {
            tree.entry(current.clone()).or_insert(Node::Dir);
            current = parent_path(&current);
        }
    }

    /// Adds a file, creating parent directories.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        let path = normalize_path(path);
        self.add_dir(&parent_path(&path));
        self.state
            .tree
            .lock()
            .unwrap()
            .insert(path, Node::File(content.to_vec()));
    }

    /// Makes every operation touching `path` fail with permission denied.
    pub fn deny(&self, path: &str) {
        self.state.denied.lock().unwrap().insert(normalize_path(path));
    }

    /// True if `path` exists.
    pub fn exists(&self, path: &str) -> bool {
        self.state.tree.lock().unwrap().contains_key(&normalize_path(path))
    }

    /// Content of the file at `path`.
    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.tree.lock().unwrap().get(&normalize_path(path)) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    /// Ends every open shell from the remote side.
    pub fn hang_up_all(&self) {
        for hangup in self.state.hangups.lock().unwrap().drain(..) {
            hangup.notify_one();
        }
    }

    /// PTY sizes seen by `open_shell` and resize requests, in order.
    pub fn shell_sizes(&self) -> Vec<PtySize> {
        self.state.shell_sizes.lock().unwrap().clone()
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed.
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` connections are closed.
    pub async fn wait_for_closes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.closes() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connections were not closed");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let error = self.state.connect_error.lock().unwrap().clone();
        if let Some(err) = error {
            return Err(err);
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError> {
        let error = self.state.shell_error.lock().unwrap().clone();
        if let Some(err) = error {
            return Err(err);
        }

        self.state.shell_sizes.lock().unwrap().push(size);
        let (output_tx, output_rx) = mpsc::channel(64);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let hangup = Arc::new(Notify::new());
        self.state.hangups.lock().unwrap().push(Arc::clone(&hangup));

        if self.state.deaf_shells.load(Ordering::SeqCst) {
            drop(control_rx);
            tokio::spawn(async move {
                hangup.notified().await;
                drop(output_tx);
            });
            return Ok(ShellChannel {
                output: output_rx,
                control: control_tx,
            });
        }

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    input = control_rx.recv() => match input {
                        Some(ShellInput::Data(bytes)) => {
                            if output_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(ShellInput::Resize(size)) => {
                            state.shell_sizes.lock().unwrap().push(size);
                        }
                        Some(ShellInput::Close) | None => break,
                    },
                    () = hangup.notified() => break,
                }
            }
        });

        Ok(ShellChannel {
            output: output_rx,
            control: control_tx,
        })
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let answer = self.state.commands.lock().unwrap().get(command).cloned();
        match answer {
            Some(MockExec::Output(output)) => Ok(output),
            Some(MockExec::Fail(err)) => Err(err),
            Some(MockExec::Hang) => std::future::pending().await,
            None => Ok(ExecOutput {
                stdout: String::new(),
                stderr: format!("sh: {}: command not found", command),
                exit_status: 127,
            }),
        }
    }

    async fn open_filesystem(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        let error = self.state.fs_error.lock().unwrap().clone();
        if let Some(err) = error {
            return Err(err);
        }
        Ok(Box::new(MockFs {
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = *self.state.close_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockFs {
    state: Arc<MockState>,
}

impl MockFs {
    fn check(&self, path: &str) -> Result<(), TransportError> {
        if self.state.denied.lock().unwrap().contains(path) {
            return Err(TransportError::FileError(format!(
                "{}: Permission denied",
                path
            )));
        }
        Ok(())
    }
}

fn missing(path: &str) -> TransportError {
    TransportError::FileError(format!("{}: No such file", path))
}

fn is_child(parent: &str, path: &str) -> bool {
    path != "/" && parent_path(path) == parent
}

#[async_trait]
impl RemoteFs for MockFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        self.check(path)?;
        let tree = self.state.tree.lock().unwrap();
        match tree.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(TransportError::FileError(format!(
                    "{}: Not a directory",
                    path
                )));
            }
            None => return Err(missing(path)),
        }

        // Reverse key order stands in for arbitrary server order.
        Ok(tree
            .iter()
            .rev()
            .filter(|(child, _)| is_child(path, child))
            .map(|(child, node)| {
                let (kind, size, permissions) = match node {
                    Node::Dir => (EntryKind::Directory, 4096, 0o755),
                    Node::File(content) => (EntryKind::File, content.len() as u64, 0o644),
                };
                RemoteEntry {
                    name: child.rsplit('/').next().unwrap_or(child).to_string(),
                    path: child.clone(),
                    kind,
                    size,
                    permissions,
                    accessed: None,
                    modified: Some(1_700_000_000),
                }
            })
            .collect())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        self.check(remote)?;
        let content = std::fs::read(local).map_err(|e| TransportError::Io(e.to_string()))?;
        let mut tree = self.state.tree.lock().unwrap();
        if !matches!(tree.get(&parent_path(remote)), Some(Node::Dir)) {
            return Err(missing(&parent_path(remote)));
        }
        let len = content.len() as u64;
        tree.insert(remote.to_string(), Node::File(content));
        Ok(len)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        self.check(remote)?;
        let content = match self.state.tree.lock().unwrap().get(remote) {
            Some(Node::File(content)) => content.clone(),
            Some(Node::Dir) => {
                return Err(TransportError::FileError(format!(
                    "{}: Is a directory",
                    remote
                )));
            }
            None => return Err(missing(remote)),
        };
        std::fs::write(local, &content).map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(content.len() as u64)
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        self.check(path)?;
        let mut tree = self.state.tree.lock().unwrap();
        let is_dir = match tree.get(path) {
            Some(Node::Dir) => true,
            Some(Node::File(_)) => false,
            None => return Err(missing(path)),
        };
        if is_dir && tree.keys().any(|k| is_child(path, k)) {
            return Err(TransportError::FileError(format!(
                "{}: Directory not empty",
                path
            )));
        }
        tree.remove(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        self.check(path)?;
        let mut tree = self.state.tree.lock().unwrap();
        if tree.contains_key(path) {
            return Err(TransportError::FileError(format!("{}: File exists", path)));
        }
        if !matches!(tree.get(&parent_path(path)), Some(Node::Dir)) {
            return Err(missing(&parent_path(path)));
        }
        tree.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.check(from)?;
        self.check(to)?;
        let mut tree = self.state.tree.lock().unwrap();
        if !tree.contains_key(from) {
            return Err(missing(from));
        }
        if tree.contains_key(to) {
            return Err(TransportError::FileError(format!("{}: File exists", to)));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = tree
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                tree.insert(new, node);
            }
        }
        Ok(())
    }
}
