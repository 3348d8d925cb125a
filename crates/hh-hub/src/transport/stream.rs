//! Platform stream plumbing: listeners, dialing, and splitting a connection
//! into a buffered reader and a writer.
//!
//! - Unix: `ipc://` endpoints are Unix domain sockets.
//! - Everywhere: `tcp://` endpoints are TCP sockets.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};

use hh_types::address::Endpoint;

use super::TransportError;

pub(crate) type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One established connection to a peer.
pub(crate) struct Conn {
    pub reader: Reader,
    pub writer: Writer,
    pub peer: String,
}

impl Conn {
    fn new<R, W>(read_half: R, write_half: W, peer: String) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            peer,
        }
    }
}

// ─── Platform-specific transport ──────────────────────────────────────────────

#[cfg(unix)]
mod platform {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    pub type IpcListener = UnixListener;

    pub async fn bind_ipc(path: &Path) -> io::Result<UnixListener> {
        if path.exists() {
            // A live listener answers; a stale file from a dead node does not.
            // The liveness check connection is dropped straight away.
            if UnixStream::connect(path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "another node is already listening on this socket",
                ));
            }
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        UnixListener::bind(path)
    }

    pub async fn accept_ipc(listener: &UnixListener, label: &str) -> io::Result<Conn> {
        let (stream, _) = listener.accept().await?;
        let (r, w) = stream.into_split();
        Ok(Conn::new(r, w, label.to_string()))
    }

    pub async fn dial_ipc(path: &Path, label: String) -> io::Result<Conn> {
        let stream = UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        Ok(Conn::new(r, w, label))
    }
}

#[cfg(not(unix))]
mod platform {
    use super::*;

    pub enum IpcListener {}

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "ipc:// needs Unix domain sockets")
    }

    pub async fn bind_ipc(_path: &Path) -> io::Result<IpcListener> {
        Err(unsupported())
    }

    pub async fn accept_ipc(listener: &IpcListener, _label: &str) -> io::Result<Conn> {
        match *listener {}
    }

    pub async fn dial_ipc(_path: &Path, _label: String) -> io::Result<Conn> {
        Err(unsupported())
    }
}

// ─── Cross-platform API ───────────────────────────────────────────────────────

/// A bound, accepting endpoint.
pub(crate) enum Listener {
    Ipc(platform::IpcListener, IpcGuard),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `endpoint`. Any failure is a [`TransportError::Bind`] naming the
    /// address.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let bind_err = |source: io::Error| TransportError::Bind {
            address: endpoint.to_string(),
            source,
        };
        match endpoint {
            Endpoint::Ipc(path) => {
                let listener = platform::bind_ipc(path).await.map_err(bind_err)?;
                Ok(Listener::Ipc(listener, IpcGuard(path.clone())))
            }
            Endpoint::Tcp { .. } => {
                let target = endpoint.tcp_target().unwrap_or_default();
                let listener = TcpListener::bind(target.as_str()).await.map_err(bind_err)?;
                Ok(Listener::Tcp(listener))
            }
        }
    }

    pub async fn accept(&self, label: &str) -> io::Result<Conn> {
        match self {
            Listener::Ipc(listener, _) => platform::accept_ipc(listener, label).await,
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok(Conn::new(r, w, format!("{label} <- {addr}")))
            }
        }
    }
}

/// Dial `endpoint` once.
pub(crate) async fn dial(endpoint: &Endpoint) -> io::Result<Conn> {
    let label = endpoint.to_string();
    match endpoint {
        Endpoint::Ipc(path) => platform::dial_ipc(path, label).await,
        Endpoint::Tcp { .. } => {
            let target = endpoint.tcp_target().unwrap_or_default();
            let stream = TcpStream::connect(target.as_str()).await?;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            Ok(Conn::new(r, w, label))
        }
    }
}

/// Removes a bound IPC socket file when the listener goes away.
pub(crate) struct IpcGuard(PathBuf);

impl Drop for IpcGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!("Failed to remove socket {}: {e}", self.0.display());
            }
        }
    }
}
