//! Peer-side adapter that forwards session operations to the coordinator.
//!
//! A [`PeerClient`] keeps one long-lived Unix socket connection and
//! multiplexes concurrent calls over it. Each call registers a oneshot in the
//! pending table under its request id and is resolved when the matching
//! response arrives, when the per-call timeout elapses, or when the connection
//! drops. A background supervisor task reconnects with exponential backoff.
//!
//! Every transport failure surfaces as [`SessionError::Unavailable`].

use super::protocol::{
    decode, encode, read_frame, ttl_to_ms, write_frame, Operation, Request, Response, Status,
};
use crate::backoff::{retry_async, BackoffConfig};
use crate::config::{IpcConfig, SessionConfig};
use crate::error::Unavailable;
use crate::session_store::SessionStore;
use crate::{Result, SessionError};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = std::result::Result<Response, Unavailable>;

/// An encoded request waiting for the supervisor to write it.
struct Outbound {
    request_id: u64,
    /// Connection generation the caller saw when it queued the frame.
    generation: u64,
    frame: Vec<u8>,
}

/// State shared between callers, the supervisor, and the reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    connected: AtomicBool,
    /// Bumped on every disconnect. Frames queued under an older generation
    /// are never written.
    generation: AtomicU64,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        // The map holds no invariants a panicking holder could break.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, response: Response) {
        let waiter = self.lock_pending().remove(&response.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => debug!(
                "Discarding response for unknown or expired request {}",
                response.request_id
            ),
        }
    }

    fn fail(&self, request_id: u64, cause: Unavailable) {
        if let Some(tx) = self.lock_pending().remove(&request_id) {
            let _ = tx.send(Err(cause));
        }
    }

    fn fail_all(&self, cause: Unavailable) -> usize {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(cause.clone()));
        }
        count
    }
}

/// Removes a call's pending entry however the call ends.
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(&self.request_id);
    }
}

/// Session store client for worker processes.
#[derive(Debug)]
pub struct PeerClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    next_id: AtomicU64,
    request_timeout: Duration,
    socket_path: PathBuf,
    supervisor: JoinHandle<()>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("pending", &self.lock_pending().len())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl PeerClient {
    /// Connect to the coordinator named by `config.socket_path`.
    ///
    /// The initial connect is retried per `config.reconnect`; if every attempt
    /// fails the peer is reported as unavailable.
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        let socket_path = config.socket_path.clone();
        let stream = retry_async(&config.reconnect, || Self::connect_once(&socket_path))
            .await
            .map_err(|e| {
                warn!(
                    "Could not reach session coordinator at {}: {}",
                    socket_path.display(),
                    e
                );
                SessionError::Unavailable(Unavailable::NotConnected)
            })?;

        info!("Connected to session coordinator at {}", socket_path.display());

        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::Release);
        let (outbound_tx, outbound_rx) = mpsc::channel(IpcConfig::OUTBOUND_QUEUE_DEPTH);

        let supervisor = tokio::spawn(Self::supervise(
            stream,
            shared.clone(),
            outbound_rx,
            socket_path.clone(),
            config.reconnect.clone(),
        ));

        Ok(Self {
            shared,
            outbound: outbound_tx,
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout,
            socket_path,
            supervisor,
        })
    }

    async fn connect_once(path: &Path) -> Result<UnixStream> {
        match tokio::time::timeout(IpcConfig::IPC_CONNECT_TIMEOUT, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(SessionError::io_with_path(e, path)),
            Err(_) => Err(SessionError::Unavailable(Unavailable::Timeout(
                IpcConfig::IPC_CONNECT_TIMEOUT,
            ))),
        }
    }

    /// Owns the connection: writes queued requests, notices disconnects,
    /// fails in-flight calls, and reconnects.
    async fn supervise(
        stream: UnixStream,
        shared: Arc<Shared>,
        mut outbound: mpsc::Receiver<Outbound>,
        socket_path: PathBuf,
        backoff: BackoffConfig,
    ) {
        let mut stream = Some(stream);

        loop {
            let current = match stream.take() {
                Some(s) => s,
                None => Self::reconnect(&socket_path, &backoff).await,
            };
            let generation = shared.generation.load(Ordering::Acquire);
            shared.connected.store(true, Ordering::Release);

            let (reader, mut writer) = current.into_split();
            let mut reader_task = tokio::spawn(Self::read_responses(reader, shared.clone()));

            let client_dropped = loop {
                tokio::select! {
                    next = outbound.recv() => match next {
                        Some(Outbound { request_id, generation: queued_on, .. })
                            if queued_on != generation =>
                        {
                            debug!("Dropping request {} queued before a reconnect", request_id);
                            shared.fail(request_id, Unavailable::ConnectionLost);
                        }
                        Some(Outbound { request_id, frame, .. }) => {
                            if let Err(e) = write_frame(&mut writer, &frame).await {
                                debug!("Write of request {} failed: {}", request_id, e);
                                break false;
                            }
                        }
                        None => break true,
                    },
                    _ = &mut reader_task => break false,
                }
            };

            reader_task.abort();
            shared.connected.store(false, Ordering::Release);
            shared.generation.fetch_add(1, Ordering::AcqRel);
            while outbound.try_recv().is_ok() {}
            let failed = shared.fail_all(Unavailable::ConnectionLost);

            if client_dropped {
                debug!("Peer client dropped, closing coordinator connection");
                return;
            }
            warn!(
                "Lost connection to session coordinator at {} ({} in-flight requests failed)",
                socket_path.display(),
                failed
            );
        }
    }

    async fn reconnect(socket_path: &Path, backoff: &BackoffConfig) -> UnixStream {
        let mut attempt: u32 = 0;
        loop {
            tokio::time::sleep(backoff.calculate_delay(attempt)).await;
            match Self::connect_once(socket_path).await {
                Ok(stream) => {
                    info!(
                        "Reconnected to session coordinator at {} after {} attempts",
                        socket_path.display(),
                        attempt + 1
                    );
                    return stream;
                }
                Err(e) => {
                    debug!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn read_responses(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Coordinator closed the connection");
                    return;
                }
                Err(e) => {
                    warn!("Coordinator connection failed: {}", e);
                    return;
                }
            };

            match decode::<Response>(&frame) {
                Ok(response) => shared.resolve(response),
                Err(e) => {
                    warn!("Dropping coordinator connection: {}", e);
                    return;
                }
            }
        }
    }

    /// Send one request and wait for its response.
    async fn call(&self, operation: Operation) -> Result<Response> {
        // Read the generation first: a disconnect bumps it after clearing
        // `connected`, so a stale generation is caught by the writer.
        let generation = self.shared.generation.load(Ordering::Acquire);
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(Unavailable::NotConnected.into());
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op_name = operation.name();
        let frame = encode(&Request::new(request_id, operation))?;
        if frame.len() > IpcConfig::MAX_IPC_MESSAGE_SIZE {
            return Err(Unavailable::Protocol(format!(
                "{} request is {} bytes, maximum is {}",
                op_name,
                frame.len(),
                IpcConfig::MAX_IPC_MESSAGE_SIZE
            ))
            .into());
        }

        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(request_id, tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            request_id,
        };

        let exchange = async {
            let queued = Outbound {
                request_id,
                generation,
                frame,
            };
            if self.outbound.send(queued).await.is_err() {
                return Err(Unavailable::ConnectionLost);
            }
            rx.await.unwrap_or(Err(Unavailable::ConnectionLost))
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(cause)) => Err(cause.into()),
            Err(_) => {
                debug!("{} request {} timed out", op_name, request_id);
                Err(Unavailable::Timeout(self.request_timeout).into())
            }
        }
    }

    fn expect_ok(response: Response) -> Result<Option<Value>> {
        match response.status {
            Status::Ok => Ok(response.payload),
            Status::NotFound => Ok(None),
            Status::Error => Err(SessionError::Internal(
                response
                    .message
                    .unwrap_or_else(|| "coordinator reported an error".to_string()),
            )),
        }
    }

    /// Check the coordinator answers.
    pub async fn ping(&self) -> Result<()> {
        let response = self.call(Operation::Ping).await?;
        Self::expect_ok(response).map(|_| ())
    }

    /// Whether the connection to the coordinator is currently up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Calls still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.lock_pending().len()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.shared.fail_all(Unavailable::ConnectionLost);
    }
}

#[async_trait::async_trait]
impl SessionStore for PeerClient {
    async fn get(&self, session_id: &str) -> Result<Option<Value>> {
        let response = self
            .call(Operation::Get {
                session_id: session_id.to_string(),
            })
            .await?;
        match response.status {
            Status::Ok => Ok(Some(response.payload.unwrap_or(Value::Null))),
            _ => Self::expect_ok(response),
        }
    }

    async fn set(&self, session_id: &str, payload: Value, ttl: Option<Duration>) -> Result<()> {
        let response = self
            .call(Operation::Set {
                session_id: session_id.to_string(),
                payload,
                ttl_ms: ttl_to_ms(ttl),
            })
            .await?;
        Self::expect_ok(response).map(|_| ())
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        let response = self
            .call(Operation::Destroy {
                session_id: session_id.to_string(),
            })
            .await?;
        Self::expect_ok(response).map(|_| ())
    }

    async fn touch(&self, session_id: &str, ttl: Option<Duration>) -> Result<()> {
        let response = self
            .call(Operation::Touch {
                session_id: session_id.to_string(),
                ttl_ms: ttl_to_ms(ttl),
            })
            .await?;
        if response.status == Status::NotFound {
            return Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            });
        }
        Self::expect_ok(response).map(|_| ())
    }

    async fn length(&self) -> Result<usize> {
        let response = self.call(Operation::Length).await?;
        Self::expect_ok(response)?
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .ok_or_else(|| {
                Unavailable::Protocol("length response missing count".to_string()).into()
            })
    }

    async fn clear(&self) -> Result<()> {
        let response = self.call(Operation::Clear).await?;
        Self::expect_ok(response).map(|_| ())
    }
}
