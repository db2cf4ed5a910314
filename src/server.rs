//! Server lifecycle: bind, accept, dispatch, and graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnShared, Connection};
use crate::date::DateService;
use crate::form::TextEncoding;
use crate::handler::{RequestHandler, ServerContext};
use crate::protocol::{BoxError, ServerError};
use crate::timeout::TimeoutManager;
use crate::tls::TlsSettings;

/// Lifecycle states of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Observer for handler errors; returning `true` marks the error handled
/// and keeps the host's response.
pub type UnhandledErrorObserver = dyn Fn(&mut ServerContext<'_>, &BoxError) -> bool + Send + Sync;

/// Observer for server state transitions.
pub type StateChangedObserver = dyn Fn(ServerState) + Send + Sync;

/// Server configuration. All durations and sizes have workable defaults;
/// an endpoint with port 0 binds an ephemeral port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: SocketAddr,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_read_buffer_size: usize,
    pub spill_threshold: usize,
    pub banner: String,
    pub reuse_addr: bool,
    pub header_encoding: TextEncoding,
    pub form_encoding: TextEncoding,
    pub tls: Option<TlsSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], 0)),
            read_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(30),
            read_buffer_size: 4 * 1024,
            write_buffer_size: 4 * 1024,
            max_read_buffer_size: 1024 * 1024,
            spill_threshold: 64 * 1024,
            banner: concat!("ember-http/", env!("CARGO_PKG_VERSION")).to_string(),
            reuse_addr: true,
            header_encoding: TextEncoding::Utf8,
            form_encoding: TextEncoding::Utf8,
            tls: None,
        }
    }
}

/// Live-connection registry: a concurrent set with a wakeup the shutdown
/// path waits on.
pub(crate) struct Registry {
    conns: Mutex<HashMap<u64, Arc<ConnShared>>>,
    changed: Notify,
}

impl Registry {
    fn new() -> Self {
        Self { conns: Mutex::new(HashMap::new()), changed: Notify::new() }
    }

    pub(crate) fn insert(&self, conn: Arc<ConnShared>) {
        self.conns.lock().expect("registry poisoned").insert(conn.id, conn);
        self.changed.notify_waiters();
    }

    pub(crate) fn remove(&self, id: u64) {
        self.conns.lock().expect("registry poisoned").remove(&id);
        self.changed.notify_waiters();
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ConnShared>> {
        self.conns.lock().expect("registry poisoned").values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.lock().expect("registry poisoned").len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until the registry drains or the deadline passes; returns
    /// whether it drained. The waiter is armed before the emptiness check
    /// so a removal in between is not lost.
    async fn wait_drained_until(&self, deadline: tokio::time::Instant) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Background services that exist only while the server runs.
pub(crate) struct ServerRuntime {
    pub timeouts: TimeoutManager,
    pub date: DateService,
}

impl ServerRuntime {
    pub(crate) fn start(read_timeout: Duration, write_timeout: Duration) -> Self {
        Self { timeouts: TimeoutManager::start(read_timeout, write_timeout), date: DateService::new() }
    }
}

/// State shared between the server handle, the accept loop, and every
/// connection task.
pub(crate) struct ServerCore {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    error_observer: Option<Box<UnhandledErrorObserver>>,
    state_observer: Option<Box<StateChangedObserver>>,
    state: Mutex<ServerState>,
    pub(crate) registry: Registry,
    runtime: ArcSwapOption<ServerRuntime>,
    bound: ArcSwapOption<SocketAddr>,
    next_conn_id: AtomicU64,
}

impl ServerCore {
    pub(crate) fn new(
        config: ServerConfig,
        handler: Arc<dyn RequestHandler>,
        error_observer: Option<Box<UnhandledErrorObserver>>,
        state_observer: Option<Box<StateChangedObserver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            error_observer,
            state_observer,
            state: Mutex::new(ServerState::Stopped),
            registry: Registry::new(),
            runtime: ArcSwapOption::empty(),
            bound: ArcSwapOption::empty(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn handler(&self) -> &dyn RequestHandler {
        self.handler.as_ref()
    }

    pub(crate) fn state(&self) -> ServerState {
        *self.state.lock().expect("state poisoned")
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().expect("state poisoned") = state;
        if let Some(observer) = &self.state_observer {
            observer(state);
        }
    }

    /// Verify-and-transition under the state lock.
    fn transition(&self, from: ServerState, to: ServerState, failure: ServerError) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock().expect("state poisoned");
            if *state != from {
                return Err(failure);
            }
            *state = to;
        }
        if let Some(observer) = &self.state_observer {
            observer(to);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ServerState) {
        *self.state.lock().expect("state poisoned") = state;
    }

    pub(crate) fn observe_unhandled_error(&self, ctx: &mut ServerContext<'_>, error: &BoxError) -> bool {
        match &self.error_observer {
            Some(observer) => observer(ctx, error),
            None => false,
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// The embeddable HTTP server.
///
/// Configure through [`Server::builder`], then `start`. `stop` winds the
/// listener and live connections down gracefully; dropping a running
/// server force-closes everything without draining.
pub struct Server {
    core: Arc<ServerCore>,
    accept_token: CancellationToken,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn state(&self) -> ServerState {
        self.core.state()
    }

    /// The bound endpoint, available once started. With port 0 requested
    /// this is where the ephemeral port shows up.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.core.bound.load().as_deref().copied()
    }

    pub fn use_tls(&self) -> bool {
        self.core.config.tls.is_some()
    }

    /// Binds the listener and launches the accept loop.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        self.core.transition(ServerState::Stopped, ServerState::Starting, ServerError::AlreadyRunning)?;

        match self.do_start().await {
            Ok(()) => Ok(()),
            Err(error) => {
                error!(cause = %error, "server start failed");
                self.core.runtime.store(None);
                self.core.set_state(ServerState::Stopped);
                Err(error)
            }
        }
    }

    async fn do_start(&mut self) -> Result<(), ServerError> {
        let config = &self.core.config;

        let acceptor = match &config.tls {
            Some(tls) => Some(tls.build_acceptor()?),
            None => None,
        };

        let listener = bind_listener(config)?;
        let bound = listener.local_addr().map_err(|source| ServerError::Bind { source })?;
        self.core.bound.store(Some(Arc::new(bound)));

        let runtime = Arc::new(ServerRuntime::start(config.read_timeout, config.write_timeout));
        self.core.runtime.store(Some(Arc::clone(&runtime)));

        self.core.set_state(ServerState::Started);

        let token = CancellationToken::new();
        self.accept_token = token.clone();
        self.accept_task =
            Some(tokio::spawn(accept_loop(Arc::clone(&self.core), runtime, acceptor, listener, token)));

        info!(endpoint = %bound, tls = self.use_tls(), "server started");
        Ok(())
    }

    /// Graceful shutdown: refuse new connections, ask live ones to wind
    /// down, force-close whatever outlives the shutdown timeout.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        self.core.transition(ServerState::Started, ServerState::Stopping, ServerError::NotRunning)?;
        info!("server stopping");

        self.accept_token.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        for conn in self.core.registry.snapshot() {
            conn.request_close();
        }

        let deadline = tokio::time::Instant::now() + self.core.config.shutdown_timeout;
        if !self.core.registry.wait_drained_until(deadline).await {
            warn!(remaining = self.core.registry.len(), "shutdown timeout elapsed, force closing");
            for conn in self.core.registry.snapshot() {
                conn.force_close();
            }
            self.core.registry.wait_drained().await;
        }

        self.core.runtime.store(None);
        self.core.set_state(ServerState::Stopped);
        info!("server stopped");
        Ok(())
    }

    /// Stops the server if it is still running, then releases it.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if self.state() == ServerState::Started {
            self.stop().await?;
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.core.state() != ServerState::Stopped {
            self.accept_token.cancel();
            for conn in self.core.registry.snapshot() {
                conn.force_close();
            }
            self.core.runtime.store(None);
        }
    }
}

fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let socket = if config.endpoint.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(config.reuse_addr)?;
    socket.bind(config.endpoint)?;
    Ok(socket.listen(1024)?)
}

async fn accept_loop(
    core: Arc<ServerCore>,
    runtime: Arc<ServerRuntime>,
    acceptor: Option<TlsAcceptor>,
    listener: TcpListener,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let core = Arc::clone(&core);
                let runtime = Arc::clone(&runtime);
                let acceptor = acceptor.clone();
                tokio::spawn(serve_connection(core, runtime, acceptor, stream, peer_addr));
            }
            Err(e) => {
                warn!(cause = %e, "failed to accept");
            }
        }
    }
    // dropping the listener refuses further connections
    debug!("accept loop stopped");
}

async fn serve_connection(
    core: Arc<ServerCore>,
    runtime: Arc<ServerRuntime>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let id = core.next_conn_id();
    let local_addr = stream
        .local_addr()
        .ok()
        .or_else(|| core.bound.load().as_deref().copied())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let shared = Arc::new(ConnShared::new(id));
    core.registry.insert(Arc::clone(&shared));
    let _guard = RegistryGuard { core: Arc::clone(&core), id };

    match acceptor {
        Some(acceptor) => {
            // the transport speaks TLS before any HTTP bytes
            let handshake = tokio::select! {
                biased;
                _ = shared.token.cancelled() => return,
                handshake = acceptor.accept(stream) => handshake,
            };
            match handshake {
                Ok(tls_stream) => {
                    Connection::new(tls_stream, peer_addr, local_addr, true, shared, core, runtime).run().await;
                }
                Err(e) => {
                    // failed handshakes close silently
                    debug!(conn_id = id, cause = %e, "tls handshake failed");
                }
            }
        }
        None => {
            Connection::new(stream, peer_addr, local_addr, false, shared, core, runtime).run().await;
        }
    }
}

struct RegistryGuard {
    core: Arc<ServerCore>,
    id: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.core.registry.remove(self.id);
    }
}

/// Builder for a [`Server`], in the usual set-then-build shape.
pub struct ServerBuilder {
    config: ServerConfig,
    handler: Option<Arc<dyn RequestHandler>>,
    error_observer: Option<Box<UnhandledErrorObserver>>,
    state_observer: Option<Box<StateChangedObserver>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { config: ServerConfig::default(), handler: None, error_observer: None, state_observer: None }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = banner.into();
        self
    }

    pub fn reuse_addr(mut self, reuse: bool) -> Self {
        self.config.reuse_addr = reuse;
        self
    }

    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.config.tls = Some(settings);
        self
    }

    /// The request-received slot. Required.
    pub fn handler(mut self, handler: impl RequestHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn on_unhandled_error(
        mut self,
        observer: impl Fn(&mut ServerContext<'_>, &BoxError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.error_observer = Some(Box::new(observer));
        self
    }

    pub fn on_state_changed(mut self, observer: impl Fn(ServerState) + Send + Sync + 'static) -> Self {
        self.state_observer = Some(Box::new(observer));
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        let handler = self.handler.ok_or(ServerError::MissingHandler)?;
        let core = ServerCore::new(self.config, handler, self.error_observer, self.state_observer);
        Ok(Server { core, accept_token: CancellationToken::new(), accept_task: None })
    }
}
