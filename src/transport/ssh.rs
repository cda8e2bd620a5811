//! `ssh2`-backed transport.
//!
//! libssh2 is blocking, so every call runs on the tokio blocking pool. An
//! interactive shell is served by a dedicated blocking task that polls the
//! channel in non-blocking mode and relays bytes in both directions.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::{Channel, FileStat, Session, Sftp};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use super::{
    Connection, Endpoint, ExecOutput, PtySize, RemoteFs, ShellChannel, ShellInput, Transport,
    TransportError,
};
use crate::remote::{EntryKind, RemoteEntry};

/// Default TCP connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read/write timeout in seconds for blocking calls.
const IO_TIMEOUT_SECS: u64 = 30;

/// Shell output buffer size.
const READ_CHUNK: usize = 8192;

/// Buffered output chunks per shell before the pump waits for the reader.
const OUTPUT_BACKLOG: usize = 256;

/// Sleep between polls when a shell is idle.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Terminal type requested for shells.
const TERM: &str = "xterm-256color";

/// Opens SSH connections with `ssh2`.
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

impl SshTransport {
    /// Creates a transport with the given TCP connect timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        assert!(!connect_timeout.is_zero(), "connect timeout must be positive");
        Self {
            connect_timeout,
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let endpoint = endpoint.clone();
        let connect_timeout = self.connect_timeout;
        let io_timeout = self.io_timeout;

        let session =
            blocking(move || open_session(&endpoint, connect_timeout, io_timeout)).await?;

        Ok(Box::new(SshConnection {
            session,
            io_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Runs a blocking libssh2 call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::Io(format!("worker task failed: {}", e)))?
}

/// Connects, handshakes and authenticates.
fn open_session(
    endpoint: &Endpoint,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<Session, TransportError> {
    assert!(!endpoint.host.is_empty(), "host must not be empty");
    assert!(!endpoint.username.is_empty(), "username must not be empty");

    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let mut last_error = format!("no address for {}", endpoint.address());
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    let tcp = stream.ok_or(TransportError::ConnectionFailed(last_error))?;

    // Prevent indefinite hangs
    let _ = tcp.set_read_timeout(Some(io_timeout));
    let _ = tcp.set_write_timeout(Some(io_timeout));

    let mut session =
        Session::new().map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
    session.set_timeout(u32::try_from(io_timeout.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    authenticate(&mut session, endpoint)?;

    info!("SSH connected to {}", endpoint.display_string());
    Ok(session)
}

/// Tries key file, then password, then the SSH agent.
fn authenticate(session: &mut Session, endpoint: &Endpoint) -> Result<(), TransportError> {
    if let Some(ref key_path) = endpoint.key_path {
        if key_path.exists() {
            let result = session.userauth_pubkey_file(
                &endpoint.username,
                None,
                key_path,
                endpoint.password.as_ref().map(|p| p.as_str()),
            );
            if result.is_ok() && session.authenticated() {
                return Ok(());
            }
            debug!("Key authentication failed for {}", endpoint.display_string());
        }
    }

    if let Some(ref password) = endpoint.password {
        session
            .userauth_password(&endpoint.username, password)
            .map_err(|e| TransportError::AuthFailed(e.to_string()))?;

        if session.authenticated() {
            return Ok(());
        }
    }

    let result = session.userauth_agent(&endpoint.username);
    if result.is_ok() && session.authenticated() {
        return Ok(());
    }

    Err(TransportError::AuthFailed(
        "No valid authentication method".to_string(),
    ))
}

/// An authenticated `ssh2` session.
///
/// Once a shell is open the session runs in non-blocking mode and is
/// dedicated to that shell.
struct SshConnection {
    session: Session,
    io_timeout: Duration,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError> {
        let session = self.session.clone();
        let channel = blocking(move || {
            let mut channel = session
                .channel_session()
                .map_err(|e| TransportError::ChannelFailed(e.to_string()))?;
            channel
                .request_pty(
                    TERM,
                    None,
                    Some((u32::from(size.cols), u32::from(size.rows), 0, 0)),
                )
                .map_err(|e| TransportError::ChannelFailed(format!("PTY request: {}", e)))?;
            channel
                .shell()
                .map_err(|e| TransportError::ChannelFailed(format!("shell request: {}", e)))?;
            Ok(channel)
        })
        .await?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BACKLOG);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let session = self.session.clone();
        let closed = Arc::clone(&self.closed);
        tokio::task::spawn_blocking(move || {
            pump_shell(&session, channel, &output_tx, control_rx);
            closed.store(true, Ordering::SeqCst);
            let _ = session.disconnect(None, "shell closed", None);
        });

        Ok(ShellChannel {
            output: output_rx,
            control: control_tx,
        })
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        assert!(!command.is_empty(), "command must not be empty");

        let session = self.session.clone();
        let command = command.to_string();
        let io_timeout = self.io_timeout;
        blocking(move || {
            let mut channel = session
                .channel_session()
                .map_err(|e| TransportError::CommandFailed(format!("Cannot open channel: {}", e)))?;

            channel.exec(&command).map_err(|e| {
                TransportError::CommandFailed(format!("Cannot execute command: {}", e))
            })?;

            session.set_blocking(false);
            let drained = drain_exec(&mut channel, io_timeout);
            session.set_blocking(true);
            let (stdout, stderr) = drained
                .map_err(|e| TransportError::CommandFailed(format!("Cannot read output: {}", e)))?;

            channel.wait_close().ok();
            let exit_status = channel.exit_status().unwrap_or(-1);

            Ok(exec_output(&stdout, &stderr, exit_status))
        })
        .await
    }

    async fn open_filesystem(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        let session = self.session.clone();
        let sftp = blocking(move || {
            session
                .sftp()
                .map_err(|e| TransportError::ChannelFailed(format!("SFTP init failed: {}", e)))
        })
        .await?;

        Ok(Box::new(SshFs {
            sftp: Arc::new(Mutex::new(sftp)),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.clone();
        let _ = blocking(move || {
            session
                .disconnect(None, "closed by client", None)
                .map_err(|e| TransportError::Io(e.to_string()))
        })
        .await;
    }
}

/// Relays bytes between a shell channel and its async handles until either
/// side closes.
fn pump_shell(
    session: &Session,
    mut channel: Channel,
    output: &mpsc::Sender<Vec<u8>>,
    mut control: mpsc::UnboundedReceiver<ShellInput>,
) {
    session.set_blocking(false);
    let mut buf = [0u8; READ_CHUNK];

    'pump: loop {
        let mut idle = true;

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    debug!("Shell channel reached EOF");
                    break;
                }
            }
            Ok(n) => {
                idle = false;
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("Shell read failed: {}", e);
                break;
            }
        }

        loop {
            match control.try_recv() {
                Ok(ShellInput::Data(bytes)) => {
                    idle = false;
                    if let Err(e) = write_nonblocking(&mut channel, &bytes) {
                        warn!("Shell write failed: {}", e);
                        break 'pump;
                    }
                }
                Ok(ShellInput::Resize(size)) => {
                    if let Err(e) = resize_nonblocking(&mut channel, size) {
                        debug!("PTY resize failed: {}", e);
                    }
                }
                Ok(ShellInput::Close) | Err(TryRecvError::Disconnected) => break 'pump,
                Err(TryRecvError::Empty) => break,
            }
        }

        if idle {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    session.set_blocking(true);
    let _ = channel.close();
    let _ = channel.wait_close();
}

/// The two output streams of a running command.
trait ExecStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn eof(&self) -> bool;
}

impl ExecStreams for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr().read(buf)
    }

    fn eof(&self) -> bool {
        Channel::eof(self)
    }
}

/// Reads stdout and stderr side by side so a command blocked on one stream
/// still makes progress. Expects non-blocking reads.
fn drain_exec<S: ExecStreams>(
    streams: &mut S,
    limit: Duration,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let deadline = Instant::now() + limit;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        let mut idle = true;

        if !stdout_done {
            match streams.read_stdout(&mut buf) {
                Ok(0) => stdout_done = streams.eof(),
                Ok(n) => {
                    idle = false;
                    stdout.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if !stderr_done {
            match streams.read_stderr(&mut buf) {
                Ok(0) => stderr_done = streams.eof(),
                Ok(n) => {
                    idle = false;
                    stderr.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if idle {
            if Instant::now() >= deadline {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    Ok((stdout, stderr))
}

/// Builds an exec result. Output is decoded lossily.
fn exec_output(stdout: &[u8], stderr: &[u8], exit_status: i32) -> ExecOutput {
    ExecOutput {
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
        exit_status,
    }
}

fn write_nonblocking(channel: &mut Channel, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match channel.write(bytes) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(e),
        }
    }
    channel.flush()
}

fn resize_nonblocking(channel: &mut Channel, size: PtySize) -> io::Result<()> {
    loop {
        match channel.request_pty_size(u32::from(size.cols), u32::from(size.rows), None, None) {
            Ok(()) => return Ok(()),
            Err(e) => {
                let err = io::Error::from(e);
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(err);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// SFTP subsystem over one session.
struct SshFs {
    sftp: Arc<Mutex<Sftp>>,
}

impl SshFs {
    /// Runs `f` against the SFTP handle on the blocking pool.
    async fn with_sftp<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&Sftp) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let sftp = Arc::clone(&self.sftp);
        blocking(move || {
            let guard = sftp
                .lock()
                .map_err(|_| TransportError::FileError("SFTP handle poisoned".to_string()))?;
            f(&guard)
        })
        .await
    }
}

#[async_trait]
impl RemoteFs for SshFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let entries = sftp
                .readdir(Path::new(&path))
                .map_err(|e| TransportError::FileError(format!("Cannot read directory: {}", e)))?;

            Ok(entries
                .iter()
                .map(|(entry_path, stat)| to_entry(entry_path, stat))
                .filter(|entry| entry.name != "." && entry.name != "..")
                .collect())
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_sftp(move |sftp| {
            let mut source =
                fs::File::open(&local).map_err(|e| TransportError::Io(e.to_string()))?;
            let mut target = sftp
                .create(Path::new(&remote))
                .map_err(|e| TransportError::FileError(format!("Cannot create file: {}", e)))?;
            io::copy(&mut source, &mut target)
                .map_err(|e| TransportError::FileError(format!("Cannot write file: {}", e)))
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_sftp(move |sftp| {
            let mut source = sftp
                .open(Path::new(&remote))
                .map_err(|e| TransportError::FileError(format!("Cannot open file: {}", e)))?;
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).map_err(|e| TransportError::Io(e.to_string()))?;
            }
            let mut target =
                fs::File::create(&local).map_err(|e| TransportError::Io(e.to_string()))?;
            io::copy(&mut source, &mut target)
                .map_err(|e| TransportError::FileError(format!("Cannot read file: {}", e)))
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let target = Path::new(&path);
            let stat = sftp
                .lstat(target)
                .map_err(|e| TransportError::FileError(format!("Cannot stat: {}", e)))?;
            let result = if stat.is_dir() {
                sftp.rmdir(target)
            } else {
                sftp.unlink(target)
            };
            result.map_err(|e| TransportError::FileError(format!("Cannot delete: {}", e)))
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            sftp.mkdir(Path::new(&path), 0o755)
                .map_err(|e| TransportError::FileError(format!("Cannot create directory: {}", e)))
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_sftp(move |sftp| {
            sftp.rename(Path::new(&from), Path::new(&to), None)
                .map_err(|e| TransportError::FileError(format!("Cannot rename: {}", e)))
        })
        .await
    }
}

fn to_entry(path: &Path, stat: &FileStat) -> RemoteEntry {
    let file_type = stat.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    RemoteEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_string_lossy().to_string(),
        kind,
        size: stat.size.unwrap_or(0),
        permissions: stat.perm.unwrap_or(0) & 0o7777,
        accessed: stat.atime,
        modified: stat.mtime,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_to_entry_directory() {
        let stat = FileStat {
            size: Some(4096),
            uid: None,
            gid: None,
            perm: Some(0o040755),
            atime: Some(10),
            mtime: Some(20),
        };
        let entry = to_entry(Path::new("/var/log"), &stat);
        assert_eq!(entry.name, "log");
        assert_eq!(entry.path, "/var/log");
        assert_eq!(entry.kind, EntryKind::Directory);
        assert_eq!(entry.permissions, 0o755);
        assert_eq!(entry.modified, Some(20));
    }

    #[test]
    fn test_to_entry_file_and_symlink() {
        let file = FileStat {
            size: Some(12),
            uid: None,
            gid: None,
            perm: Some(0o100644),
            atime: None,
            mtime: None,
        };
        assert_eq!(to_entry(Path::new("/a.txt"), &file).kind, EntryKind::File);

        let link = FileStat {
            perm: Some(0o120777),
            ..file
        };
        assert_eq!(to_entry(Path::new("/l"), &link).kind, EntryKind::Symlink);
    }

    /// Command that only produces stdout once all of its stderr was read.
    struct StderrFirst {
        stderr: Vec<u8>,
        stdout: Vec<u8>,
    }

    impl ExecStreams for StderrFirst {
        fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.stderr.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.stdout.len());
            buf[..n].copy_from_slice(&self.stdout[..n]);
            self.stdout.drain(..n);
            Ok(n)
        }

        fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.stderr.len());
            buf[..n].copy_from_slice(&self.stderr[..n]);
            self.stderr.drain(..n);
            Ok(n)
        }

        fn eof(&self) -> bool {
            self.stdout.is_empty() && self.stderr.is_empty()
        }
    }

    #[test]
    fn test_drain_reads_stderr_while_stdout_waits() {
        let mut streams = StderrFirst {
            stderr: vec![b'e'; 64 * 1024],
            stdout: b"done\n".to_vec(),
        };

        let (stdout, stderr) = drain_exec(&mut streams, Duration::from_secs(1)).unwrap();
        assert_eq!(stdout, b"done\n");
        assert_eq!(stderr.len(), 64 * 1024);
    }

    #[test]
    fn test_drain_times_out_when_idle() {
        struct Silent;
        impl ExecStreams for Silent {
            fn read_stdout(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            fn read_stderr(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            fn eof(&self) -> bool {
                false
            }
        }

        let err = drain_exec(&mut Silent, Duration::from_millis(30)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_exec_output_is_lossy() {
        let output = exec_output(b"ok \xff\xfe", b"", 0);
        assert_eq!(output.stdout, "ok \u{fffd}\u{fffd}");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on localhost is expected to refuse connections.
        let transport = SshTransport::new(Duration::from_secs(2));
        let endpoint = Endpoint::new("127.0.0.1", 1, "nobody");
        let result = transport.connect(&endpoint).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
