//! Local IPC transport between the daemon and its clients.
//!
//! Uses Unix domain sockets on Unix platforms and named pipes on Windows.
//! The endpoint name is derived from the home directory alone, so the daemon
//! and every client agree on it without any extra coordination.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Absolute form of `home` with `.`, `..` and trailing separators folded
/// away, so every spelling of one directory yields the same endpoint.
///
/// Resolution is lexical: the directory need not exist yet.
fn normalize(home: &Path) -> PathBuf {
    let home = std::path::absolute(home).unwrap_or_else(|_| home.to_path_buf());
    let mut normal = PathBuf::new();
    for component in home.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other),
        }
    }
    normal
}

/// Stable short digest of the home directory path.
fn home_digest(home: &Path) -> String {
    let digest = Sha256::digest(normalize(home).to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// Endpoint the daemon serving `home` listens on.
///
/// The socket lives in the system temp directory, keyed by a hash of the
/// home path.
#[cfg(unix)]
pub fn endpoint_path(home: &Path) -> PathBuf {
    std::env::temp_dir().join(format!("webpier-{}.sock", home_digest(home)))
}

/// Endpoint the daemon serving `home` listens on.
#[cfg(windows)]
pub fn endpoint_path(home: &Path) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\webpier-{}", home_digest(home)))
}

/// Newline-delimited message stream over any local byte stream.
pub struct IpcStream<S> {
    stream: BufReader<S>,
}

impl<S> IpcStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Read one line without its terminator; `None` once the peer hung up.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.stream.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    /// Write one line, appending the terminator when missing.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Receive and decode one message.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.read_line().await? {
            Some(line) => Message::decode(&line).map(Some),
            None => Ok(None),
        }
    }

    /// Encode and send one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.write_line(&message.encode()?).await
    }

    /// Send a request and wait for its response.
    pub async fn exchange(&mut self, request: &Message) -> Result<Message> {
        self.send(request).await?;
        self.recv()
            .await?
            .ok_or_else(|| Error::Protocol("Connection closed before response".into()))
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

/// Stream accepted by the daemon.
#[cfg(unix)]
pub type ServerStream = IpcStream<UnixStream>;

/// Stream opened by a client.
#[cfg(unix)]
pub type ClientStream = IpcStream<UnixStream>;

/// Connect to the endpoint at `path`.
#[cfg(unix)]
pub async fn connect(path: &Path) -> std::io::Result<ClientStream> {
    Ok(IpcStream::new(UnixStream::connect(path).await?))
}

/// Listening endpoint of the daemon.
///
/// The socket file is removed when the listener is dropped.
#[cfg(unix)]
pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl IpcListener {
    /// Bind to `path`, removing a stale socket file first.
    ///
    /// Callers hold the single-instance lock, so whatever is at `path` belongs
    /// to a daemon that is gone.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection.
    pub async fn accept(&mut self) -> Result<ServerStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream::new(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============================================================================
// Windows Implementation (named pipes)
// ============================================================================

#[cfg(windows)]
pub type ServerStream = IpcStream<NamedPipeServer>;

#[cfg(windows)]
pub type ClientStream = IpcStream<NamedPipeClient>;

#[cfg(windows)]
pub async fn connect(path: &Path) -> std::io::Result<ClientStream> {
    Ok(IpcStream::new(ClientOptions::new().open(path)?))
}

#[cfg(windows)]
pub struct IpcListener {
    server: NamedPipeServer,
    path: PathBuf,
}

#[cfg(windows)]
impl IpcListener {
    pub fn bind(path: &Path) -> Result<Self> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(path)?;
        Ok(Self {
            server,
            path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection, leaving a fresh pipe instance behind.
    pub async fn accept(&mut self) -> Result<ServerStream> {
        self.server.connect().await?;
        let next = ServerOptions::new().create(&self.path)?;
        let connected = std::mem::replace(&mut self.server, next);
        Ok(IpcStream::new(connected))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::{Action, Handle};

    #[test]
    fn endpoint_is_deterministic() {
        let a = endpoint_path(Path::new("/home/alice/.webpier"));
        let b = endpoint_path(Path::new("/home/alice/.webpier"));
        let c = endpoint_path(Path::new("/home/bob/.webpier"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string_lossy().contains("webpier-"));
    }

    #[test]
    fn endpoint_ignores_spelling_of_home() {
        let plain = endpoint_path(Path::new("/tmp/h/.webpier"));
        for spelling in [
            "/tmp/h/.webpier/",
            "/tmp/h/x/../.webpier",
            "/tmp/h/./.webpier",
            "/tmp//h/.webpier//",
        ] {
            assert_eq!(endpoint_path(Path::new(spelling)), plain, "{spelling}");
        }
    }

    #[test]
    fn relative_home_resolves_against_current_dir() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            endpoint_path(Path::new(".webpier")),
            endpoint_path(&cwd.join(".webpier"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_and_response_cross_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let mut listener = IpcListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let request = conn.recv().await.unwrap().unwrap();
            conn.send(&Message::failure(request.action, "unknown service"))
                .await
                .unwrap();
            assert!(conn.recv().await.unwrap().is_none());
        });

        let mut client = connect(&path).await.unwrap();
        let response = client
            .exchange(&Message::with_handle(
                Action::Status,
                Handle::new("alice/home", "ssh"),
            ))
            .await
            .unwrap();
        assert_eq!(response.action, Action::Status);
        assert_eq!(response.error(), Some("unknown service"));
        drop(client);
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = IpcListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
