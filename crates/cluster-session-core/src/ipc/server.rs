//! Unix socket coordinator that owns the session table.
//!
//! Binds a filesystem socket, accepts any number of peer connections, and
//! applies each framed [`Request`] to the shared [`MemoryStore`].
//!
//! # Connections
//!
//! Each connection runs a reader loop and a writer task joined by a bounded
//! channel, so a peer can pipeline requests without waiting for earlier
//! responses to be written. Undecodable or oversized frames close only the
//! offending connection. A store fault is reported to that peer and then
//! closes its connection; other connections keep working.

use super::protocol::{
    decode, encode, read_frame, ttl_from_ms, write_frame, Operation, Request, Response,
};
use crate::config::IpcConfig;
use crate::store::MemoryStore;
use crate::{Result, SessionError};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running coordinator. Dropping shuts it down.
#[derive(Debug)]
pub struct CoordinatorHandle {
    socket_path: PathBuf,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Path of the bound socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of peer connections currently open.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting, close every peer connection, and remove the socket file.
    pub fn shutdown(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());
        let _ = self.conn_shutdown_tx.send(true);

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove coordinator socket {}: {}",
                    self.socket_path.display(),
                    e
                );
            }
        }
        info!("Coordinator on {} shut down", self.socket_path.display());
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Session coordinator listening on a Unix domain socket.
pub struct Coordinator;

impl Coordinator {
    /// Bind `socket_path` and start serving `store` in background tasks.
    ///
    /// A socket file left behind by a dead coordinator is replaced. If another
    /// coordinator is still answering on the path, binding fails.
    pub async fn start(
        socket_path: impl Into<PathBuf>,
        store: Arc<MemoryStore>,
    ) -> Result<CoordinatorHandle> {
        let socket_path = socket_path.into();
        let listener = Self::bind(&socket_path)?;

        info!("Session coordinator listening on {}", socket_path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            store,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(CoordinatorHandle {
            socket_path,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    fn bind(socket_path: &Path) -> Result<UnixListener> {
        let path_len = socket_path.as_os_str().len();
        if path_len == 0 || path_len >= IpcConfig::MAX_SOCKET_PATH {
            return Err(SessionError::Config {
                message: format!(
                    "socket path must be 1..{} bytes, got {}: {}",
                    IpcConfig::MAX_SOCKET_PATH,
                    path_len,
                    socket_path.display()
                ),
            });
        }

        match std::fs::symlink_metadata(socket_path) {
            Ok(metadata) => {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    return Err(SessionError::Config {
                        message: format!(
                            "{} exists and is not a socket, refusing to replace it",
                            socket_path.display()
                        ),
                    });
                }
                if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
                    return Err(SessionError::Config {
                        message: format!(
                            "another coordinator is already listening on {}",
                            socket_path.display()
                        ),
                    });
                }
                debug!("Removing stale socket {}", socket_path.display());
                std::fs::remove_file(socket_path)
                    .map_err(|e| SessionError::io_with_path(e, socket_path))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SessionError::io_with_path(e, socket_path)),
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SessionError::io_with_path(e, parent))?;
            }
        }

        let listener = std::os::unix::net::UnixListener::bind(socket_path)
            .map_err(|e| SessionError::io_with_path(e, socket_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SessionError::io_with_path(e, socket_path))?;
        }

        listener.set_nonblocking(true)?;
        Ok(UnixListener::from_std(listener)?)
    }

    async fn accept_loop(
        listener: UnixListener,
        store: Arc<MemoryStore>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut next_conn_id: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Coordinator accept loop stopping");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            next_conn_id += 1;
                            let conn_id = next_conn_id;
                            let store = store.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            conns.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                debug!("Peer connection {} opened", conn_id);
                                match Self::handle_connection(stream, &store, &mut conn_shutdown).await {
                                    Ok(()) => debug!("Peer connection {} closed", conn_id),
                                    Err(SessionError::Internal(msg)) => {
                                        error!("Peer connection {} closed after store fault: {}", conn_id, msg);
                                    }
                                    Err(e) => warn!("Peer connection {} dropped: {}", conn_id, e),
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Coordinator accept error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: UnixStream,
        store: &MemoryStore,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (response_tx, response_rx) = mpsc::channel::<Response>(IpcConfig::OUTBOUND_QUEUE_DEPTH);
        let writer_task = tokio::spawn(Self::write_responses(writer, response_rx));

        let result = loop {
            // Dropping a half-read frame is fine here: shutdown closes the stream.
            let frame = tokio::select! {
                result = read_frame(&mut reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.changed() => break Ok(()),
            };

            let request: Request = match decode(&frame) {
                Ok(request) => request,
                Err(e) => break Err(e),
            };
            let request_id = request.request_id;

            match Self::apply(store, request) {
                Ok(response) => {
                    if response_tx.send(response).await.is_err() {
                        // Writer is gone, so is the peer.
                        break Ok(());
                    }
                }
                Err(e) => {
                    let _ = response_tx
                        .send(Response::error(request_id, e.to_string()))
                        .await;
                    break Err(e);
                }
            }
        };

        drop(response_tx);
        match writer_task.await {
            Ok(Err(e)) => debug!("Response writer ended: {}", e),
            Err(e) => debug!("Response writer task failed: {}", e),
            Ok(Ok(())) => {}
        }

        result
    }

    async fn write_responses(
        mut writer: OwnedWriteHalf,
        mut responses: mpsc::Receiver<Response>,
    ) -> Result<()> {
        while let Some(response) = responses.recv().await {
            let bytes = encode(&response)?;
            write_frame(&mut writer, &bytes).await?;
        }
        Ok(())
    }

    /// Apply one request to the store.
    ///
    /// `NotFound` from the store becomes a `not_found` response; any other
    /// store error is returned so the caller can close the connection.
    pub(crate) fn apply(store: &MemoryStore, request: Request) -> Result<Response> {
        let id = request.request_id;

        let response = match request.operation {
            Operation::Get { session_id } => match store.get(&session_id)? {
                Some(record) => Response::ok(id, Some(record.payload)),
                None => Response::not_found(id),
            },
            Operation::Set {
                session_id,
                payload,
                ttl_ms,
            } => {
                store.set(&session_id, payload, ttl_from_ms(ttl_ms))?;
                Response::ok(id, None)
            }
            Operation::Destroy { session_id } => {
                store.destroy(&session_id)?;
                Response::ok(id, None)
            }
            Operation::Touch { session_id, ttl_ms } => {
                match store.touch(&session_id, ttl_from_ms(ttl_ms)) {
                    Ok(()) => Response::ok(id, None),
                    Err(e) if e.is_not_found() => Response::not_found(id),
                    Err(e) => return Err(e),
                }
            }
            Operation::Length => Response::ok(id, Some(json!(store.length()?))),
            Operation::Clear => {
                store.clear()?;
                Response::ok(id, None)
            }
            Operation::Ping => Response::ok(id, Some(json!("pong"))),
        };

        Ok(response)
    }
}
