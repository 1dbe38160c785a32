//! Transports a session can run over.
//!
//! - stdio (default): frames on stdin/stdout.
//! - Unix socket: listen, accept exactly one client, serve it.
//! - TCP: connect back to a client that is already listening.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{TcpStream, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, FramedReader, FramedWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Listen(PathBuf),
    Connect(SocketAddr),
}

/// An open channel, plus whatever must be cleaned up when it closes.
pub struct Connection {
    pub channel: Channel,
    _socket: Option<SocketFile>,
}

/// Removes a listening socket's file on drop.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            tracing::debug!(?e, path = %self.0.display(), "could not remove socket file");
        }
    }
}

/// Open the transport. Returns `Ok(None)` if `cancel` fires while waiting
/// for a client.
pub async fn open(
    transport: &Transport,
    cancel: &CancellationToken,
) -> io::Result<Option<Connection>> {
    match transport {
        Transport::Stdio => Ok(Some(Connection {
            channel: Channel::new(
                FramedReader::new(tokio::io::stdin()),
                FramedWriter::new(tokio::io::stdout()),
            ),
            _socket: None,
        })),
        Transport::Listen(path) => accept_one(path, cancel).await,
        Transport::Connect(addr) => {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                stream = TcpStream::connect(addr) => stream?,
            };
            stream.set_nodelay(true)?;
            tracing::info!(%addr, "connected to client");
            Ok(Some(Connection {
                channel: Channel::from_stream(stream),
                _socket: None,
            }))
        }
    }
}

async fn accept_one(
    socket_path: &Path,
    cancel: &CancellationToken,
) -> io::Result<Option<Connection>> {
    // Remove stale socket file if it exists, but check for active server first.
    // The connect() probe runs on a blocking thread since it can hang on an
    // unresponsive listener.
    if socket_path.exists() {
        let path_owned = socket_path.to_path_buf();
        let is_active = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || {
                std::os::unix::net::UnixStream::connect(&path_owned).is_ok()
            }),
        )
        .await;

        match is_active {
            Ok(Ok(true)) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another host is already listening on {}", socket_path.display()),
                ));
            }
            _ => std::fs::remove_file(socket_path)?,
        }
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    let socket = SocketFile(socket_path.to_path_buf());

    // Owner only (0600)
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %socket_path.display(), "waiting for client");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("cancelled while waiting for client");
                return Ok(None);
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tracing::info!("client connected");
                        return Ok(Some(Connection {
                            channel: Channel::from_stream(stream),
                            _socket: Some(socket),
                        }));
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept Unix socket connection");
                        // Backoff to prevent tight loop under sustained accept errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}
