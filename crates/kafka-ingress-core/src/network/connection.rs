//! Accepted client connections.
//!
//! A [`Connection`] is shared (`Arc`) by the acceptor, the connection's
//! pipeline task and every background completion spawned for it. It owns
//! the write half of the stream; the read half is handed out once as a
//! [`ConnectionInput`] and is owned by the pipeline alone.
//!
//! Two lifecycle primitives live here:
//! - the abort token: cancelled once, stops further reads and dispatch;
//! - the gate: tracks every background task spawned for the connection.
//!   The connection is fully stopped only once the gate has drained.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::SinkExt;
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::auth::{AuthState, SaslState};
use crate::error::{IngressError, Result};

use super::codec::{OutboundFrame, ResponseEncoder};
use super::stream::ClientStream;

/// Buffered read half of a connection, owned by its pipeline.
pub type ConnectionInput = BufReader<ReadHalf<ClientStream>>;

type ConnectionWriter = FramedWrite<WriteHalf<ClientStream>, ResponseEncoder>;

/// Default read buffer size.
const DEFAULT_RECV_BUFFER: usize = 8 * 1024;

/// One accepted client connection.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    listener: Arc<str>,
    tls: bool,
    created_at: Instant,
    abort: CancellationToken,
    gate: TaskTracker,
    /// `None` once the connection has been shut down.
    writer: Mutex<Option<ConnectionWriter>>,
    auth: AuthState,
}

impl Connection {
    /// Wrap an accepted stream. Returns the shared connection and the read
    /// half for its pipeline.
    pub fn new(
        id: u64,
        listener: Arc<str>,
        peer_addr: SocketAddr,
        stream: ClientStream,
        auth: AuthState,
    ) -> (Arc<Self>, ConnectionInput) {
        let tls = stream.is_tls();
        let (read, write) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            id,
            peer_addr,
            listener,
            tls,
            created_at: Instant::now(),
            abort: CancellationToken::new(),
            gate: TaskTracker::new(),
            writer: Mutex::new(Some(FramedWrite::new(write, ResponseEncoder))),
            auth,
        });
        (conn, BufReader::with_capacity(DEFAULT_RECV_BUFFER, read))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn listener_name(&self) -> &str {
        &self.listener
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    #[must_use]
    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    /// Abort token. Cancelled when input shutdown is requested.
    #[must_use]
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Stop reading and dispatching. In-flight responses may still drain.
    pub fn shutdown_input(&self) {
        if !self.abort.is_cancelled() {
            debug!(connection_id = self.id, peer = %self.peer_addr, "shutting down connection input");
            self.abort.cancel();
        }
    }

    /// Spawn `task` under the connection's gate.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::GateClosed`] once the connection is shutting
    /// down; `task` is dropped without running.
    pub fn spawn_in_gate<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.gate.is_closed() {
            return Err(IngressError::GateClosed);
        }
        Ok(self.gate.spawn(task))
    }

    /// Background tasks currently tracked by the gate.
    #[must_use]
    pub fn gate_len(&self) -> usize {
        self.gate.len()
    }

    #[must_use]
    pub fn is_gate_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Write one frame. Returns the bytes written, or zero when the
    /// connection was already shut down and the write was suppressed.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub async fn write(&self, frame: OutboundFrame) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            trace!(connection_id = self.id, "write after shutdown suppressed");
            return Ok(0);
        };
        let len = super::codec::LENGTH_PREFIX_LEN + frame.payload_len();
        sink.send(frame).await?;
        Ok(len)
    }

    /// Shut the connection down: stop input, close the gate, wait for every
    /// tracked task, then close the socket.
    pub async fn shutdown(&self) {
        self.shutdown_input();
        self.gate.close();
        self.gate.wait().await;

        let writer = self.writer.lock().await.take();
        if let Some(mut sink) = writer {
            if let Err(e) = sink.close().await {
                trace!(connection_id = self.id, error = %e, "error closing socket");
            }
        }
        debug!(connection_id = self.id, peer = %self.peer_addr, "connection shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) finished.
    pub async fn is_shut_down(&self) -> bool {
        self.gate.is_closed() && self.gate.is_empty() && self.writer.lock().await.is_none()
    }

    /// Snapshot for observability.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            listener: self.listener.to_string(),
            tls: self.tls,
            age: self.created_at.elapsed(),
            in_flight: self.gate.len(),
            aborted: self.abort.is_cancelled(),
            sasl_state: self.auth.state(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("listener", &self.listener)
            .field("aborted", &self.abort.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub listener: String,
    pub tls: bool,
    pub age: Duration,
    /// Background tasks still tracked by the connection's gate.
    pub in_flight: usize,
    pub aborted: bool,
    pub sasl_state: SaslState,
}

/// Active connections of a server.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<u64, Arc<Connection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, conn: &Arc<Connection>) {
        self.connections.insert(conn.id(), Arc::clone(conn));
    }

    pub fn deregister(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Every registered connection.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Snapshot of every registered connection, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.connections.iter().map(|e| e.value().info()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}
