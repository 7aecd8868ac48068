//! Connection acceptor.
//!
//! [`IngressServer`] binds every configured listener and runs one accept
//! loop per listener. Each accepted socket goes through the connection
//! gates (quota, socket tuning, rate limiter) on the accept loop; the TLS
//! handshake and the request pipeline run in a task of their own, tracked by
//! the server gate.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::admission::{AdmissionController, ConnectionQuotaUnits};
use crate::auth::{AuthState, AuthStateObserver};
use crate::config::{IngressConfig, SocketConfig};
use crate::error::{ConfigResult, IngressError, Result};
use crate::handlers::RequestDispatcher;
use crate::metrics::IngressMetrics;
use crate::pipeline::RequestPipeline;
use crate::tls::TlsServerAcceptor;

use super::connection::{Connection, ConnectionInfo, ConnectionRegistry};
use super::stream::ClientStream;

/// A bound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub name: String,
    pub address: SocketAddr,
    pub tls: bool,
    pub sasl: bool,
}

/// Per-listener settings shared by its accept loop and connection tasks.
struct Endpoint {
    name: Arc<str>,
    sasl: bool,
    tls: Option<TlsServerAcceptor>,
}

struct Shared {
    config: IngressConfig,
    dispatcher: Arc<dyn RequestDispatcher>,
    admission: Arc<AdmissionController>,
    metrics: Arc<IngressMetrics>,
    connections: ConnectionRegistry,
    observers: Vec<Arc<dyn AuthStateObserver>>,
    /// Cancelled by `shutdown_input`; stops every accept loop.
    abort: CancellationToken,
    /// Tracks accept loops, connection tasks and housekeeping.
    gate: TaskTracker,
    listeners: Mutex<Vec<ListenerInfo>>,
}

impl Shared {
    fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.gate.is_closed() {
            return Err(IngressError::GateClosed);
        }
        self.gate.spawn(task);
        Ok(())
    }
}

/// Client-facing server: listeners, admission and connection lifecycle.
#[derive(Clone)]
pub struct IngressServer {
    shared: Arc<Shared>,
}

impl IngressServer {
    /// Build a server from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: IngressConfig,
        dispatcher: Arc<dyn RequestDispatcher>,
        metrics: Arc<IngressMetrics>,
    ) -> ConfigResult<Self> {
        Self::with_observers(config, dispatcher, metrics, Vec::new())
    }

    /// [`new`](Self::new) with hooks invoked on every authentication state
    /// transition of every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_observers(
        config: IngressConfig,
        dispatcher: Arc<dyn RequestDispatcher>,
        metrics: Arc<IngressMetrics>,
        observers: Vec<Arc<dyn AuthStateObserver>>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let admission = Arc::new(AdmissionController::from_config(&config.admission)?);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                admission,
                metrics,
                connections: ConnectionRegistry::new(),
                observers,
                abort: CancellationToken::new(),
                gate: TaskTracker::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind every listener and start accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS setup or binding fails for any listener.
    /// Listeners bound before the failure are stopped.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;

        let mut bound = Vec::with_capacity(shared.config.listeners.len());
        for listener_config in &shared.config.listeners {
            let tls = listener_config
                .tls
                .as_ref()
                .map(TlsServerAcceptor::new)
                .transpose()?;
            let listener = TcpListener::bind(&listener_config.address)
                .await
                .map_err(|source| IngressError::Bind {
                    name: listener_config.name.clone(),
                    address: listener_config.address.clone(),
                    source,
                })?;
            let address = listener.local_addr()?;
            info!(
                listener = %listener_config.name,
                %address,
                tls = tls.is_some(),
                sasl = listener_config.sasl,
                "listening"
            );

            let info = ListenerInfo {
                name: listener_config.name.clone(),
                address,
                tls: tls.is_some(),
                sasl: listener_config.sasl,
            };
            let endpoint = Arc::new(Endpoint {
                name: Arc::from(listener_config.name.as_str()),
                sasl: listener_config.sasl,
                tls,
            });
            bound.push((info, listener, endpoint));
        }

        for (info, listener, endpoint) in bound {
            self.listeners_guard().push(info);
            shared.spawn(accept_loop(Arc::clone(shared), listener, endpoint))?;
        }

        if let Some(throughput) = &shared.config.admission.throughput {
            let interval = Duration::from_millis(throughput.gc_interval_ms.max(1));
            let admission = Arc::clone(&shared.admission);
            let abort = shared.abort.clone();
            shared.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = abort.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Some(quota) = admission.throughput() {
                                let removed = quota.gc();
                                trace!(removed, "throughput quota gc");
                            }
                        }
                    }
                }
            })?;
        }

        Ok(())
    }

    fn listeners_guard(&self) -> std::sync::MutexGuard<'_, Vec<ListenerInfo>> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Stop accepting and tell every connection to stop reading.
    pub fn shutdown_input(&self) {
        let shared = &self.shared;
        if !shared.abort.is_cancelled() {
            info!(connections = shared.connections.len(), "shutting down ingress input");
        }
        shared.abort.cancel();
        for conn in shared.connections.all() {
            conn.shutdown_input();
        }
    }

    /// Shut input down if needed and wait until every accept loop and
    /// connection task has finished.
    pub async fn wait_for_shutdown(&self) {
        let shared = &self.shared;
        if !shared.abort.is_cancelled() {
            self.shutdown_input();
        }
        shared.admission.stop();
        shared.gate.close();
        shared.gate.wait().await;

        for conn in shared.connections.all() {
            conn.shutdown().await;
        }
        info!("ingress stopped");
    }

    /// Full shutdown. A no-op if input shutdown was already requested; the
    /// caller that requested it is expected to wait.
    pub async fn stop(&self) {
        if self.shared.abort.is_cancelled() {
            return;
        }
        self.wait_for_shutdown().await;
    }

    /// Whether input shutdown was requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.abort.is_cancelled()
    }

    /// Active connections, ordered by id.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections.snapshot()
    }

    /// Bound listeners.
    #[must_use]
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners_guard().clone()
    }

    /// Bound address of listener `name`.
    #[must_use]
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners_guard()
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.address)
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<IngressMetrics> {
        &self.shared.metrics
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.shared.admission
    }
}

#[instrument(name = "accept", skip_all, fields(listener = %endpoint.name))]
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, endpoint: Arc<Endpoint>) {
    loop {
        let (socket, peer) = tokio::select! {
            biased;
            () = shared.abort.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        tune_keepalive(&socket, &shared.config.socket, peer);

        let quota_units = match shared.admission.reserve_connection(peer.ip()) {
            Ok(units) => units,
            Err(e) => {
                shared.metrics.connections_rejected.inc();
                info!(%peer, error = %e, "connection rejected");
                continue;
            }
        };

        tune_buffers(&socket, &shared.config.socket, peer);

        let admitted = tokio::select! {
            biased;
            () = shared.abort.cancelled() => break,
            admitted = shared.admission.wait_connection_rate(peer.ip()) => admitted,
        };
        if let Err(e) = admitted {
            shared.metrics.rate_limit_timeouts.inc();
            trace!(%peer, error = %e, "connection dropped by rate limiter");
            continue;
        }

        let task = serve_connection(
            Arc::clone(&shared),
            Arc::clone(&endpoint),
            socket,
            peer,
            quota_units,
        );
        if let Err(e) = shared.spawn(task) {
            debug!(%peer, error = %e, "connection dropped");
            break;
        }
    }
    debug!("accept loop stopped");
}

async fn serve_connection(
    shared: Arc<Shared>,
    endpoint: Arc<Endpoint>,
    socket: TcpStream,
    peer: SocketAddr,
    quota_units: Option<ConnectionQuotaUnits>,
) {
    let stream = match &endpoint.tls {
        None => ClientStream::plain(socket),
        Some(tls) => {
            let handshake = tokio::select! {
                () = shared.abort.cancelled() => return,
                handshake = tls.accept(socket) => handshake,
            };
            match handshake {
                Ok(stream) => ClientStream::tls(stream),
                Err(e) => {
                    debug!(%peer, listener = %endpoint.name, error = %e, "TLS handshake failed");
                    return;
                }
            }
        }
    };

    let id = shared.connections.next_id();
    let auth = AuthState::new(id, endpoint.sasl, shared.observers.clone());
    let (conn, input) = Connection::new(id, Arc::clone(&endpoint.name), peer, stream, auth);
    shared.connections.register(&conn);
    shared.metrics.record_connection_accepted(&endpoint.name);
    shared.metrics.active_connections.inc();
    debug!(connection_id = id, %peer, listener = %endpoint.name, "connection accepted");

    // Input shutdown may have swept the registry before this connection
    // was registered.
    if shared.abort.is_cancelled() {
        conn.shutdown_input();
    }

    RequestPipeline::new(
        Arc::clone(&conn),
        input,
        Arc::clone(&shared.dispatcher),
        Arc::clone(&shared.admission),
        Arc::clone(&shared.metrics),
    )
    .run()
    .await;

    conn.shutdown().await;
    shared.connections.deregister(id);
    shared.metrics.active_connections.dec();
    drop(quota_units);
    debug!(connection_id = id, %peer, "connection closed");
}

fn tune_keepalive(socket: &TcpStream, config: &SocketConfig, peer: SocketAddr) {
    if let Err(e) = socket.set_nodelay(config.nodelay) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
    if config.keepalive {
        let keepalive =
            TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_idle_secs));
        if let Err(e) = SockRef::from(socket).set_tcp_keepalive(&keepalive) {
            debug!(%peer, error = %e, "TCP keepalive setup failed");
        }
    }
}

fn tune_buffers(socket: &TcpStream, config: &SocketConfig, peer: SocketAddr) {
    let sock = SockRef::from(socket);
    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = sock.set_recv_buffer_size(size) {
            debug!(%peer, size, error = %e, "failed to set SO_RCVBUF");
        }
    }
    if let Some(size) = config.send_buffer_size {
        if let Err(e) = sock.set_send_buffer_size(size) {
            debug!(%peer, size, error = %e, "failed to set SO_SNDBUF");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::handlers::HandlerRegistry;

    fn server(config: IngressConfig) -> IngressServer {
        IngressServer::new(
            config,
            Arc::new(HandlerRegistry::new()),
            Arc::new(IngressMetrics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_records_listeners() {
        let mut config = IngressConfig::single_listener("internal", "127.0.0.1:0");
        config
            .listeners
            .push(ListenerConfig::plaintext("external", "127.0.0.1:0"));
        let server = server(config);
        server.start().await.unwrap();

        let listeners = server.listeners();
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].name, "internal");
        assert_ne!(listeners[0].address.port(), 0);
        assert!(server.local_addr("external").is_some());
        assert!(server.local_addr("missing").is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let server = server(IngressConfig::single_listener("dup", address));

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, IngressError::Bind { .. }));
        assert!(server.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_stop_after_shutdown_input_is_noop() {
        let server = server(IngressConfig::single_listener("internal", "127.0.0.1:0"));
        server.start().await.unwrap();

        server.shutdown_input();
        assert!(server.is_shutting_down());
        server.stop().await;

        server.wait_for_shutdown().await;
        let address = server.local_addr("internal").unwrap();
        assert!(TcpStream::connect(address).await.is_err());
    }

    #[tokio::test]
    async fn test_socket_tuning() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (socket, peer) = listener.accept().await.unwrap();

        let config = SocketConfig {
            recv_buffer_size: Some(64 * 1024),
            ..SocketConfig::default()
        };
        tune_keepalive(&socket, &config, peer);
        tune_buffers(&socket, &config, peer);

        assert!(socket.nodelay().unwrap());
        assert!(SockRef::from(&socket).keepalive().unwrap());
    }
}
