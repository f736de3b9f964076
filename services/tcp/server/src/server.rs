//! TCP server: listening points, admission control and idle sweeping.
//!
//! A [`Server`] listens on every configured [`Binding`] with a pool of
//! [`Acceptor`]s per socket. Each accepted socket becomes an
//! [`InboundSession`] whose protocol handler is produced by the
//! [`SessionFactory`]. Sessions that pass admission control are registered in
//! the server's [`SessionRegistry`] until they disconnect.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tcp_session::{
    InboundSession, LogEntry, LogSink, Observers, Rejection, Session, SessionError, SessionEvent,
    SessionHandler, SessionId, SessionRegistry,
};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::acceptor::Acceptor;
use crate::binding::Binding;
use crate::error::{Result, ServerError};

/// Default idle timeout before the sweep disconnects a session
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(100);

/// Default number of acceptors per listening socket
pub const DEFAULT_ACCEPTORS_PER_SOCKET: usize = 10;

/// Largest allowed number of acceptors per listening socket
pub const MAX_ACCEPTORS_PER_SOCKET: usize = 50;

/// Default period of the idle sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default upper bound on a handler's idle timeout hook
pub const DEFAULT_TIMEOUT_HOOK_LIMIT: Duration = Duration::from_secs(5);

/// Default `listen` backlog
pub const DEFAULT_LISTEN_BACKLOG: u32 = 100;

/// Connection limits and timing of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    /// Maximum concurrent sessions; 0 is unlimited
    pub max_connections: usize,
    /// Maximum concurrent sessions per remote IP; 0 is unlimited
    pub max_connections_per_ip: usize,
    /// Inactivity after which the sweep disconnects a session; zero disables the sweep
    pub session_idle_timeout: Duration,
    /// Acceptors per listening socket (1..=50)
    pub acceptors_per_socket: usize,
    /// Period of the idle sweep
    pub sweep_interval: Duration,
    /// `listen` backlog of every socket
    pub listen_backlog: u32,
    /// How long the sweep lets [`SessionHandler::on_timeout`] run before it
    /// disconnects the session anyway
    pub timeout_hook_limit: Duration,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_connections_per_ip: 0,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            acceptors_per_socket: DEFAULT_ACCEPTORS_PER_SOCKET,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            timeout_hook_limit: DEFAULT_TIMEOUT_HOOK_LIMIT,
        }
    }
}

impl ServerLimits {
    /// Check the values are usable
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ACCEPTORS_PER_SOCKET).contains(&self.acceptors_per_socket) {
            return Err(ServerError::InvalidArgument(format!(
                "acceptors_per_socket must be between 1 and {}, got {}",
                MAX_ACCEPTORS_PER_SOCKET, self.acceptors_per_socket
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(ServerError::InvalidArgument(
                "sweep_interval must be greater than zero".into(),
            ));
        }
        if self.listen_backlog == 0 {
            return Err(ServerError::InvalidArgument(
                "listen_backlog must be greater than zero".into(),
            ));
        }
        if self.timeout_hook_limit.is_zero() {
            return Err(ServerError::InvalidArgument(
                "timeout_hook_limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Events emitted by a server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Listening points were built. Not raised when every binding failed to
    /// open; an [`ServerEvent::Error`] is raised instead.
    Started,
    /// Listening stopped
    Stopped,
    /// An error that did not fail a caller-visible operation
    Error(Arc<anyhow::Error>),
    /// Server was disposed
    Disposed,
    /// Structured log entry from one of the sessions
    Log(LogEntry),
    /// A session passed admission control and is about to start
    SessionCreated(Arc<InboundSession>),
}

/// Creates the protocol handler for every accepted connection
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Handler for a session accepted on `binding`
    fn create(&self, binding: &Binding) -> Arc<dyn SessionHandler>;

    /// Called before a session is dropped because `max_connections` was
    /// reached. May write a rejection message.
    async fn on_max_connections_exceeded(&self, _session: &Arc<InboundSession>) {}

    /// Called before a session is dropped because its remote address reached
    /// `max_connections_per_ip`. May write a rejection message.
    async fn on_max_connections_per_ip_exceeded(&self, _session: &Arc<InboundSession>) {}
}

impl<F> SessionFactory for F
where
    F: Fn(&Binding) -> Arc<dyn SessionHandler> + Send + Sync,
{
    fn create(&self, binding: &Binding) -> Arc<dyn SessionHandler> {
        self(binding)
    }
}

/// One bound socket with its acceptors
struct ListeningPoint {
    binding: Binding,
    local_addr: SocketAddr,
    acceptors: Vec<Acceptor>,
}

impl ListeningPoint {
    /// Stop accepting; returns the accept tasks still releasing the socket
    fn close(self) -> Vec<JoinHandle<()>> {
        let tasks = self.acceptors.iter().filter_map(Acceptor::dispose).collect();
        debug!(local = %self.local_addr, "listening point closed");
        tasks
    }
}

struct Config {
    bindings: Vec<Binding>,
    limits: ServerLimits,
}

#[derive(Default)]
struct State {
    running: bool,
    generation: u64,
    start_time: Option<DateTime<Utc>>,
    listening: Vec<ListeningPoint>,
    /// Accept tasks of closed listening points that may still hold a socket
    draining: Vec<JoinHandle<()>>,
    startup: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

struct Inner {
    factory: Arc<dyn SessionFactory>,
    config: RwLock<Config>,
    state: Mutex<State>,
    sessions: SessionRegistry<InboundSession>,
    events: Observers<ServerEvent>,
    /// Sessions whose idle timeout is being handled
    timing_out: Mutex<HashSet<SessionId>>,
    disposed: AtomicBool,
}

/// Protocol-agnostic TCP server
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Create a stopped server with no bindings
    pub fn new(factory: impl SessionFactory + 'static) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    /// Create a stopped server sharing `factory`
    pub fn with_factory(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                config: RwLock::new(Config {
                    bindings: Vec::new(),
                    limits: ServerLimits::default(),
                }),
                state: Mutex::new(State::default()),
                sessions: SessionRegistry::new(),
                events: Observers::new(),
                timing_out: Mutex::new(HashSet::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Current bindings
    pub fn bindings(&self) -> Vec<Binding> {
        self.inner.config().bindings.clone()
    }

    /// Replace the bindings.
    ///
    /// A set equal to the current one is a no-op. Otherwise a running server
    /// closes every listening point and listens again on the new set.
    pub fn set_bindings(&self, bindings: Vec<Binding>) -> Result<()> {
        self.inner.ensure_not_disposed()?;
        {
            let mut config = self.inner.config_mut();
            if config.bindings == bindings {
                return Ok(());
            }
            config.bindings = bindings;
        }
        if self.is_running() {
            info!("bindings changed, listening again");
            self.inner.relisten();
        }
        Ok(())
    }

    /// Current limits
    pub fn limits(&self) -> ServerLimits {
        self.inner.config().limits
    }

    /// Replace the limits. Acceptor count and backlog apply on the next listen.
    pub fn set_limits(&self, limits: ServerLimits) -> Result<()> {
        limits.validate()?;
        self.inner.config_mut().limits = limits;
        Ok(())
    }

    /// Maximum concurrent sessions; 0 is unlimited
    pub fn set_max_connections(&self, max: usize) {
        self.inner.config_mut().limits.max_connections = max;
    }

    /// Maximum concurrent sessions per remote IP; 0 is unlimited
    pub fn set_max_connections_per_ip(&self, max: usize) {
        self.inner.config_mut().limits.max_connections_per_ip = max;
    }

    /// Idle timeout; zero disables the sweep
    pub fn set_session_idle_timeout(&self, timeout: Duration) {
        self.inner.config_mut().limits.session_idle_timeout = timeout;
    }

    /// Registered sessions
    pub fn sessions(&self) -> &SessionRegistry<InboundSession> {
        &self.inner.sessions
    }

    /// Server event observers
    pub fn events(&self) -> &Observers<ServerEvent> {
        &self.inner.events
    }

    /// True between [`Server::start`] and [`Server::stop`]
    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    /// When the server was last started
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.state().start_time
    }

    /// Addresses actually bound by the current listening points
    pub fn listening_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .state()
            .listening
            .iter()
            .map(|p| p.local_addr)
            .collect()
    }

    /// Start listening. No-op when already running.
    ///
    /// Returns immediately; listening points are built on a separate task and
    /// [`ServerEvent::Started`] is emitted once they are in place. Must be
    /// called from inside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.inner.ensure_not_disposed()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ServerError::InvalidState(
                "server must be started inside a tokio runtime",
            ));
        }
        let limits = self.limits();
        limits.validate()?;

        let mut state = self.inner.state();
        if state.running {
            return Ok(());
        }
        state.running = true;
        state.generation += 1;
        state.start_time = Some(Utc::now());

        if limits.session_idle_timeout.is_zero() {
            warn!("session idle timeout is zero; idle sessions will never be disconnected");
        } else {
            state.sweeper = Some(Inner::spawn_sweeper(&self.inner, limits.sweep_interval));
        }
        let generation = state.generation;
        state.startup = Some(tokio::spawn(Inner::build_listening_points(
            Arc::clone(&self.inner),
            generation,
        )));
        info!("server starting");
        Ok(())
    }

    /// Stop listening. No-op when not running.
    ///
    /// Active sessions stay connected; only accepting stops.
    pub fn stop(&self) {
        let (points, startup, sweeper) = {
            let mut state = self.inner.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.generation += 1;
            (
                std::mem::take(&mut state.listening),
                state.startup.take(),
                state.sweeper.take(),
            )
        };

        if let Some(task) = startup {
            task.abort();
        }
        if let Some(task) = sweeper {
            task.abort();
        }
        self.inner.retire(points);
        info!("server stopped");
        self.inner.events.emit(&ServerEvent::Stopped);
    }

    /// Stop and start again if running
    pub fn restart(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.stop();
        self.start()
    }

    /// Run one idle sweep now and wait for it to finish. Returns the number
    /// of sessions timed out.
    pub async fn sweep_idle_sessions(&self) -> usize {
        let tasks = self.inner.sweep();
        let expired = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        expired
    }

    /// Concrete addresses the server is reachable on.
    ///
    /// Wildcard bindings are expanded to every local interface address of the
    /// same family. Port 0 is replaced by the bound port while listening.
    pub fn local_end_points(&self) -> Result<Vec<SocketAddr>> {
        let bindings = self.bindings();
        let bound: Vec<(Binding, SocketAddr)> = self
            .inner
            .state()
            .listening
            .iter()
            .map(|p| (p.binding.clone(), p.local_addr))
            .collect();

        let mut interfaces: Option<Vec<IpAddr>> = None;
        let mut end_points = Vec::new();
        for binding in &bindings {
            let port = bound
                .iter()
                .find(|(b, _)| b == binding)
                .map(|(_, addr)| addr.port())
                .unwrap_or(binding.port());

            if binding.ip().is_unspecified() {
                if interfaces.is_none() {
                    interfaces = Some(
                        if_addrs::get_if_addrs()?
                            .into_iter()
                            .map(|i| i.ip())
                            .collect(),
                    );
                }
                let want_v4 = binding.ip().is_ipv4();
                for ip in interfaces.iter().flatten() {
                    if ip.is_ipv4() == want_v4 {
                        end_points.push(SocketAddr::new(*ip, port));
                    }
                }
            } else {
                end_points.push(SocketAddr::new(binding.ip(), port));
            }
        }

        let mut unique = Vec::with_capacity(end_points.len());
        for addr in end_points {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        Ok(unique)
    }

    /// Stop, disconnect and dispose every session, then detach all observers.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        for session in self.inner.sessions.snapshot() {
            session.disconnect().await;
            session.dispose().await;
        }
        info!("server disposed");
        self.inner.events.emit(&ServerEvent::Disposed);
        self.inner.events.clear();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.is_running())
            .field("sessions", &self.inner.sessions.len())
            .field("listening", &self.listening_addrs())
            .finish()
    }
}

impl Inner {
    fn config(&self) -> std::sync::RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_mut(&self) -> std::sync::RwLockWriteGuard<'_, Config> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ServerError::Disposed);
        }
        Ok(())
    }

    fn emit_error(&self, err: anyhow::Error) {
        error!("{:#}", err);
        self.events.emit(&ServerEvent::Error(Arc::new(err)));
    }

    /// Close listening points, keeping their accept tasks until they finish
    fn retire(&self, points: Vec<ListeningPoint>) {
        let tasks: Vec<JoinHandle<()>> = points.into_iter().flat_map(ListeningPoint::close).collect();
        let mut state = self.state();
        state.draining.retain(|t| !t.is_finished());
        state.draining.extend(tasks);
    }

    /// Close the current listening points and build new ones
    fn relisten(self: &Arc<Self>) {
        let (points, startup) = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.generation += 1;
            (std::mem::take(&mut state.listening), state.startup.take())
        };
        if let Some(task) = startup {
            task.abort();
        }
        self.retire(points);

        let mut state = self.state();
        if state.running && state.startup.is_none() {
            let generation = state.generation;
            state.startup = Some(tokio::spawn(Inner::build_listening_points(
                Arc::clone(self),
                generation,
            )));
        }
    }

    async fn build_listening_points(self: Arc<Self>, generation: u64) {
        // Old sockets must be released before the same ports are bound again.
        let draining = std::mem::take(&mut self.state().draining);
        for task in draining {
            let _ = task.await;
        }

        let (bindings, limits) = {
            let config = self.config();
            (config.bindings.clone(), config.limits)
        };

        let requested = bindings.len();
        let mut points = Vec::with_capacity(requested);
        for binding in bindings {
            match self.open_listening_point(binding, &limits) {
                Ok(point) => points.push(point),
                Err(e) => self.emit_error(anyhow::Error::new(e)),
            }
        }

        {
            let mut state = self.state();
            if !state.running || state.generation != generation {
                drop(state);
                self.retire(points);
                return;
            }
            for point in &points {
                info!(
                    local = %point.local_addr,
                    acceptors = point.acceptors.len(),
                    "listening on {}",
                    point.binding
                );
            }
            state.listening = points;
            state.startup = None;
            if requested > 0 && state.listening.is_empty() {
                drop(state);
                // Still running: a binding change listens again.
                self.emit_error(anyhow::anyhow!(
                    "none of the {} bindings could be opened; server is not listening",
                    requested
                ));
                return;
            }
        }
        self.events.emit(&ServerEvent::Started);
    }

    fn open_listening_point(
        self: &Arc<Self>,
        binding: Binding,
        limits: &ServerLimits,
    ) -> Result<ListeningPoint> {
        let requested = binding.socket_addr();
        let listener = Arc::new(listen(requested, limits.listen_backlog).map_err(|source| {
            ServerError::Bind {
                addr: requested,
                source,
            }
        })?);
        let local_addr = listener.local_addr()?;

        let mut acceptors = Vec::with_capacity(limits.acceptors_per_socket);
        for _ in 0..limits.acceptors_per_socket {
            let on_accepted = {
                let weak = Arc::downgrade(self);
                let binding = binding.clone();
                move |stream: TcpStream, peer: SocketAddr| {
                    if let Some(inner) = weak.upgrade() {
                        tokio::spawn(inner.handle_accepted(stream, peer, binding.clone()));
                    }
                }
            };
            let on_error = {
                let weak = Arc::downgrade(self);
                move |e: std::io::Error| {
                    if let Some(inner) = weak.upgrade() {
                        inner.emit_error(
                            anyhow::Error::new(e).context(format!("accept failed on {}", local_addr)),
                        );
                    }
                }
            };
            acceptors.push(Acceptor::spawn(Arc::clone(&listener), on_accepted, on_error)?);
        }

        Ok(ListeningPoint {
            binding,
            local_addr,
            acceptors,
        })
    }

    /// Admission control and session lifetime for one accepted socket
    async fn handle_accepted(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, binding: Binding) {
        let limits = self.config().limits;
        let handler = self.factory.create(&binding);

        let mut options = binding.inbound_options();
        options.log = Some(self.log_sink());
        let session = match InboundSession::init(stream, options, handler) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.emit_error(
                    anyhow::Error::new(e).context(format!("failed to initialize session for {}", peer)),
                );
                return;
            }
        };
        let id = match session.id() {
            Ok(id) => id,
            Err(_) => return,
        };

        // Subscribe before registering so a disconnect can never be missed.
        let weak = Arc::downgrade(&self);
        session.events().subscribe(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                SessionEvent::Disconnected => {
                    inner.sessions.remove(id);
                }
                SessionEvent::Error(e) => {
                    inner.events.emit(&ServerEvent::Error(Arc::clone(e)));
                }
                _ => {}
            }
        });

        match self.sessions.try_add(
            Arc::clone(&session),
            limits.max_connections,
            limits.max_connections_per_ip,
        ) {
            Ok(()) => {}
            Err(Rejection::MaxConnections) => {
                info!(session_id = %id, remote = %peer, "maximum connections exceeded, rejecting");
                self.factory.on_max_connections_exceeded(&session).await;
                session.dispose().await;
                return;
            }
            Err(Rejection::MaxConnectionsPerIp(ip)) => {
                info!(session_id = %id, remote = %peer, "maximum connections for {} exceeded, rejecting", ip);
                self.factory.on_max_connections_per_ip_exceeded(&session).await;
                session.dispose().await;
                return;
            }
            Err(e) => {
                self.emit_error(anyhow::Error::new(e));
                session.dispose().await;
                return;
            }
        }

        debug!(session_id = %id, remote = %peer, "session registered");
        self.events
            .emit(&ServerEvent::SessionCreated(Arc::clone(&session)));

        match session.start().await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!(session_id = %id, "session ended by disconnect: {}", e);
            }
            // Already reported through the session's error event.
            Err(SessionError::Handler(_)) => {}
            Err(e) => {
                warn!(session_id = %id, remote = %peer, "session start failed: {}", e);
                self.emit_error(anyhow::Error::new(e).context(format!("session {} failed", id)));
            }
        }
        session.disconnect().await;
        session.dispose().await;
    }

    /// Forward session log entries as server events
    fn log_sink(self: &Arc<Self>) -> Arc<dyn LogSink> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |entry: &LogEntry| {
            if let Some(inner) = weak.upgrade() {
                if !inner.events.is_empty() {
                    inner.events.emit(&ServerEvent::Log(entry.clone()));
                }
            }
        })
    }

    fn spawn_sweeper(inner: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Timeouts run detached; a slow handler never delays the next tick.
                drop(inner.sweep());
            }
        })
    }

    /// Start timing out every idle session not already being timed out.
    ///
    /// Each session is handled on its own task: the handler's hook runs for
    /// at most `timeout_hook_limit`, then the session is disconnected and
    /// disposed unless it already was.
    fn sweep(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let limits = self.config().limits;
        let timeout = limits.session_idle_timeout;
        if timeout.is_zero() {
            return Vec::new();
        }

        let mut tasks = Vec::new();
        for session in self.sessions.snapshot() {
            if session.is_disposed() || session.idle_for() <= timeout {
                continue;
            }
            let Ok(id) = session.id() else {
                continue;
            };
            if !self.timing_out().insert(id) {
                continue;
            }

            let inner = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let guard = TimingOut {
                    inner: Arc::clone(&inner),
                    id,
                };
                debug!(session_id = %id, idle = ?session.idle_for(), "session idle timeout");
                let hook = {
                    let session = Arc::clone(&session);
                    tokio::spawn(async move { session.on_timeout().await })
                };
                let abort = hook.abort_handle();
                match tokio::time::timeout(limits.timeout_hook_limit, hook).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => inner.emit_error(anyhow::anyhow!(
                        "idle timeout handler of session {} failed: {}",
                        id,
                        e
                    )),
                    Err(_) => {
                        abort.abort();
                        warn!(
                            session_id = %id,
                            limit = ?limits.timeout_hook_limit,
                            "idle timeout handler did not finish, disconnecting"
                        );
                    }
                }
                if !session.is_disposed() {
                    session.disconnect().await;
                    session.dispose().await;
                }
                drop(guard);
            }));
        }

        if !tasks.is_empty() {
            info!(expired = tasks.len(), "idle sweep timing out sessions");
        }
        tasks
    }

    fn timing_out(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        self.timing_out.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a session as being timed out until dropped
struct TimingOut {
    inner: Arc<Inner>,
    id: SessionId,
}

impl Drop for TimingOut {
    fn drop(&mut self) {
        self.inner.timing_out().remove(&self.id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.startup.take() {
            task.abort();
        }
        if let Some(task) = state.sweeper.take() {
            task.abort();
        }
    }
}

/// Bind and listen on `addr`
fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::self_signed;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use tcp_session::{ClientOptions, ClientSession, ClientTlsOptions, LineOverflow};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    /// Greets, echoes lines, answers QUIT and says goodbye on idle timeout
    struct Echo;

    #[async_trait]
    impl SessionHandler for Echo {
        async fn on_start(&self, session: Arc<InboundSession>) -> anyhow::Result<()> {
            session
                .write_line(&format!("220 {} ready", session.host_name()))
                .await?;
            loop {
                match session.read_line(LineOverflow::Fail).await {
                    Ok(Some(line)) if line == "QUIT" => {
                        session.disconnect_with(Some("221 bye")).await;
                        return Ok(());
                    }
                    Ok(Some(line)) => session.write_line(&format!("250 {}", line)).await?,
                    Ok(None) => return Ok(()),
                    Err(e) if e.is_disconnect() => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        async fn on_timeout(&self, session: &Arc<InboundSession>) {
            session.disconnect_with(Some("421 idle timeout")).await;
        }
    }

    #[derive(Default)]
    struct EchoFactory {
        over_max: AtomicUsize,
        over_per_ip: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for EchoFactory {
        fn create(&self, _binding: &Binding) -> Arc<dyn SessionHandler> {
            Arc::new(Echo)
        }

        async fn on_max_connections_exceeded(&self, session: &Arc<InboundSession>) {
            self.over_max.fetch_add(1, Ordering::SeqCst);
            let _ = session.write_line("421 too many connections").await;
        }

        async fn on_max_connections_per_ip_exceeded(&self, session: &Arc<InboundSession>) {
            self.over_per_ip.fetch_add(1, Ordering::SeqCst);
            let _ = session.write_line("421 too many connections from your address").await;
        }
    }

    fn localhost(port: u16) -> Binding {
        Binding::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port).with_host_name("test.local")
    }

    fn event_channel(server: &Server) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.events().subscribe(move |e| {
            if !matches!(e, ServerEvent::Log(_)) {
                let _ = tx.send(e.clone());
            }
        });
        rx
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ServerEvent>, wanted: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Start `server` and wait until it listens
    async fn start(server: &Server) -> mpsc::UnboundedReceiver<ServerEvent> {
        let mut rx = event_channel(server);
        server.start().unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Started)).await;
        rx
    }

    async fn connect(addr: SocketAddr) -> (ClientSession, String) {
        let mut client = ClientSession::new(ClientOptions::default());
        client.connect_addr(None, addr, false).await.unwrap();
        let line = client.read_line(LineOverflow::Fail).await.unwrap().unwrap();
        (client, line)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_limits_validation() {
        assert!(ServerLimits::default().validate().is_ok());
        let bad = ServerLimits {
            acceptors_per_socket: 0,
            ..ServerLimits::default()
        };
        assert!(bad.validate().is_err());
        let bad = ServerLimits {
            acceptors_per_socket: 51,
            ..ServerLimits::default()
        };
        assert!(bad.validate().is_err());
        let bad = ServerLimits {
            sweep_interval: Duration::ZERO,
            ..ServerLimits::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let server = Server::new(EchoFactory::default());
        assert!(matches!(server.start(), Err(ServerError::InvalidState(_))));
        assert!(!server.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_max_connections() {
        let factory = Arc::new(EchoFactory::default());
        let server = Server::with_factory(factory.clone());
        server.set_bindings(vec![localhost(0)]).unwrap();
        server.set_max_connections(1);
        let mut rx = start(&server).await;
        let addr = server.listening_addrs()[0];
        assert!(server.start_time().is_some());

        let (first, greeting) = connect(addr).await;
        assert_eq!(greeting, "220 test.local ready");
        let created = wait_for(&mut rx, |e| matches!(e, ServerEvent::SessionCreated(_))).await;
        let ServerEvent::SessionCreated(session) = created else {
            unreachable!()
        };
        assert_eq!(session.remote_addr().unwrap(), first.local_addr().unwrap());

        let (second, rejection) = connect(addr).await;
        assert_eq!(rejection, "421 too many connections");
        assert_eq!(factory.over_max.load(Ordering::SeqCst), 1);
        assert_eq!(server.sessions().len(), 1);
        let second_local = second.local_addr().unwrap();
        assert!(server
            .sessions()
            .snapshot()
            .iter()
            .all(|s| s.remote_addr().unwrap() != second_local));

        first.write_line("hello").await.unwrap();
        assert_eq!(
            first.read_line(LineOverflow::Fail).await.unwrap().as_deref(),
            Some("250 hello")
        );
        first.write_line("QUIT").await.unwrap();
        assert_eq!(
            first.read_line(LineOverflow::Fail).await.unwrap().as_deref(),
            Some("221 bye")
        );
        wait_until(|| server.sessions().is_empty()).await;

        first.dispose().await;
        second.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_ip_limit() {
        let factory = Arc::new(EchoFactory::default());
        let server = Server::with_factory(factory.clone());
        server.set_bindings(vec![localhost(0)]).unwrap();
        server.set_max_connections_per_ip(1);
        start(&server).await;
        let addr = server.listening_addrs()[0];

        let (first, greeting) = connect(addr).await;
        assert!(greeting.starts_with("220"));
        let (second, rejection) = connect(addr).await;
        assert_eq!(rejection, "421 too many connections from your address");
        assert_eq!(factory.over_per_ip.load(Ordering::SeqCst), 1);
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(
            server
                .sessions()
                .connections_per_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            1
        );

        first.dispose().await;
        second.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_admits_exactly_k() {
        let factory = Arc::new(EchoFactory::default());
        let server = Server::with_factory(factory.clone());
        server.set_bindings(vec![localhost(0)]).unwrap();
        server.set_max_connections(3);
        start(&server).await;
        let addr = server.listening_addrs()[0];

        let handles: Vec<_> = (0..4).map(|_| tokio::spawn(connect(addr))).collect();
        let mut clients = Vec::new();
        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            let (client, line) = handle.await.unwrap();
            if line.starts_with("220") {
                accepted += 1;
            } else {
                assert_eq!(line, "421 too many connections");
                rejected += 1;
            }
            clients.push(client);
        }
        assert_eq!((accepted, rejected), (3, 1));
        assert_eq!(server.sessions().len(), 3);
        assert_eq!(factory.over_max.load(Ordering::SeqCst), 1);

        for client in clients {
            client.dispose().await;
        }
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_sweep_disconnects_only_idle_sessions() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        server
            .set_limits(ServerLimits {
                session_idle_timeout: Duration::from_millis(300),
                sweep_interval: Duration::from_secs(3600),
                ..ServerLimits::default()
            })
            .unwrap();
        start(&server).await;
        let addr = server.listening_addrs()[0];

        let (idle, _) = connect(addr).await;
        let (active, _) = connect(addr).await;
        wait_until(|| server.sessions().len() == 2).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        active.write_line("still here").await.unwrap();
        active.read_line(LineOverflow::Fail).await.unwrap();

        assert_eq!(server.sweep_idle_sessions().await, 1);
        assert_eq!(
            idle.read_line(LineOverflow::Fail).await.unwrap().as_deref(),
            Some("421 idle timeout")
        );
        assert_eq!(idle.read_line(LineOverflow::Fail).await.unwrap(), None);
        assert_eq!(server.sessions().len(), 1);

        active.write_line("ping").await.unwrap();
        assert_eq!(
            active.read_line(LineOverflow::Fail).await.unwrap().as_deref(),
            Some("250 ping")
        );

        idle.dispose().await;
        active.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_periodic_sweep() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        server
            .set_limits(ServerLimits {
                session_idle_timeout: Duration::from_millis(100),
                sweep_interval: Duration::from_millis(50),
                ..ServerLimits::default()
            })
            .unwrap();
        start(&server).await;

        let (client, _) = connect(server.listening_addrs()[0]).await;
        let farewell = tokio::time::timeout(WAIT, client.read_line(LineOverflow::Fail))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(farewell.as_deref(), Some("421 idle timeout"));
        wait_until(|| server.sessions().is_empty()).await;

        client.dispose().await;
        server.dispose().await;
    }

    /// Reads until disconnected; its idle timeout hook never returns
    struct Stalled {
        timeouts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionHandler for Stalled {
        async fn on_start(&self, session: Arc<InboundSession>) -> anyhow::Result<()> {
            session.write_line("220 stalled ready").await?;
            while let Ok(Some(_)) = session.read_line(LineOverflow::Fail).await {}
            Ok(())
        }

        async fn on_timeout(&self, _session: &Arc<InboundSession>) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stalled_timeout_hook_does_not_block_sweep() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let factory = {
            let timeouts = Arc::clone(&timeouts);
            move |binding: &Binding| -> Arc<dyn SessionHandler> {
                if binding.host_name() == "stalled.local" {
                    Arc::new(Stalled {
                        timeouts: Arc::clone(&timeouts),
                    })
                } else {
                    Arc::new(Echo)
                }
            }
        };
        let server = Server::new(factory);
        server
            .set_bindings(vec![
                localhost(0).with_host_name("stalled.local"),
                localhost(0),
            ])
            .unwrap();
        server
            .set_limits(ServerLimits {
                session_idle_timeout: Duration::from_millis(100),
                sweep_interval: Duration::from_millis(50),
                timeout_hook_limit: Duration::from_millis(1500),
                ..ServerLimits::default()
            })
            .unwrap();
        start(&server).await;
        let addrs = server.listening_addrs();
        assert_eq!(addrs.len(), 2);
        // Listening points follow binding order.
        let (stalled_addr, echo_addr) = (addrs[0], addrs[1]);

        let (stalled, greeting) = connect(stalled_addr).await;
        assert_eq!(greeting, "220 stalled ready");
        wait_until(|| timeouts.load(Ordering::SeqCst) == 1).await;

        // The stalled hook is still running while this session goes idle.
        let (idle, _) = connect(echo_addr).await;
        let farewell = tokio::time::timeout(Duration::from_secs(1), idle.read_line(LineOverflow::Fail))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(farewell.as_deref(), Some("421 idle timeout"));
        wait_until(|| server.sessions().len() == 1).await;

        // The stalled session is forced out once the hook limit expires.
        assert_eq!(
            tokio::time::timeout(WAIT, stalled.read_line(LineOverflow::Fail))
                .await
                .unwrap()
                .unwrap(),
            None
        );
        wait_until(|| server.sessions().is_empty()).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        stalled.dispose().await;
        idle.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_zero_idle_timeout_disables_sweep() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        server.set_session_idle_timeout(Duration::ZERO);
        start(&server).await;

        let (client, _) = connect(server.listening_addrs()[0]).await;
        wait_until(|| server.sessions().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.sweep_idle_sessions().await, 0);
        assert_eq!(server.sessions().len(), 1);

        client.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_keeps_sessions_and_restart_listens_again() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        let mut rx = start(&server).await;
        let (client, _) = connect(server.listening_addrs()[0]).await;

        server.stop();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Stopped)).await;
        assert!(!server.is_running());
        assert!(server.listening_addrs().is_empty());
        server.stop();

        client.write_line("after stop").await.unwrap();
        assert_eq!(
            client.read_line(LineOverflow::Fail).await.unwrap().as_deref(),
            Some("250 after stop")
        );

        // Restart of a stopped server is a no-op.
        server.restart().unwrap();
        assert!(!server.is_running());

        server.start().unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Started)).await;
        server.restart().unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Stopped)).await;
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Started)).await;
        assert!(server.is_running());

        let (second, greeting) = connect(server.listening_addrs()[0]).await;
        assert!(greeting.starts_with("220"));

        client.dispose().await;
        second.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_binding_changes() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        let mut rx = start(&server).await;
        let before = server.listening_addrs();

        // Same set: nothing happens.
        server.set_bindings(vec![localhost(0)]).unwrap();
        assert_eq!(server.listening_addrs(), before);

        server
            .set_bindings(vec![localhost(0), localhost(0).with_host_name("second.local")])
            .unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Started)).await;
        let after = server.listening_addrs();
        assert_eq!(after.len(), 2);

        let (client, greeting) = connect(after[1]).await;
        assert_eq!(greeting, "220 second.local ready");

        client.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listen_error_does_not_stop_other_bindings() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let server = Server::new(EchoFactory::default());
        server
            .set_bindings(vec![localhost(taken_port), localhost(0)])
            .unwrap();
        let mut rx = event_channel(&server);
        server.start().unwrap();

        let error = wait_for(&mut rx, |e| matches!(e, ServerEvent::Error(_))).await;
        let ServerEvent::Error(err) = error else {
            unreachable!()
        };
        assert!(err.downcast_ref::<ServerError>().is_some());
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Started)).await;
        assert_eq!(server.listening_addrs().len(), 1);

        let (client, greeting) = connect(server.listening_addrs()[0]).await;
        assert!(greeting.starts_with("220"));
        client.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_started_event_when_nothing_listens() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(taken_port)]).unwrap();
        let mut rx = event_channel(&server);
        server.start().unwrap();

        let bind_error = wait_for(&mut rx, |e| matches!(e, ServerEvent::Error(_))).await;
        let ServerEvent::Error(err) = bind_error else {
            unreachable!()
        };
        assert!(err.downcast_ref::<ServerError>().is_some());
        let summary = wait_for(&mut rx, |e| !matches!(e, ServerEvent::SessionCreated(_))).await;
        assert!(matches!(summary, ServerEvent::Error(_)));
        assert!(server.listening_addrs().is_empty());
        assert!(server.is_running());

        // A working binding set recovers without a restart.
        server.set_bindings(vec![localhost(0)]).unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Started)).await;
        assert_eq!(server.listening_addrs().len(), 1);

        drop(taken);
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tls_binding() {
        let cert = self_signed("localhost");
        let server = Server::new(EchoFactory::default());
        server
            .set_bindings(vec![localhost(0).with_tls(cert.clone())])
            .unwrap();
        let mut rx = start(&server).await;

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert.leaf().clone()).unwrap();
        let mut client = ClientSession::new(ClientOptions {
            tls: ClientTlsOptions {
                roots: Arc::new(roots),
                ..ClientTlsOptions::default()
            },
            ..ClientOptions::default()
        });
        client
            .connect_addr(None, server.listening_addrs()[0], true)
            .await
            .unwrap();
        assert_eq!(
            client.read_line(LineOverflow::Fail).await.unwrap().as_deref(),
            Some("220 test.local ready")
        );

        let created = wait_for(&mut rx, |e| matches!(e, ServerEvent::SessionCreated(_))).await;
        let ServerEvent::SessionCreated(session) = created else {
            unreachable!()
        };
        assert!(session.is_secure().unwrap());

        client.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_log_entries_are_forwarded() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        let (tx, mut logs) = mpsc::unbounded_channel();
        server.events().subscribe(move |e| {
            if let ServerEvent::Log(entry) = e {
                let _ = tx.send(entry.clone());
            }
        });
        start(&server).await;

        let (client, _) = connect(server.listening_addrs()[0]).await;
        let entry = tokio::time::timeout(WAIT, logs.recv()).await.unwrap().unwrap();
        assert_eq!(entry.kind, tcp_session::LogEntryKind::Write);
        assert_eq!(entry.remote_addr, Some(client.local_addr().unwrap()));

        client.dispose().await;
        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_end_points() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![Binding::any(0), localhost(0)]).unwrap();
        start(&server).await;
        let bound = server.listening_addrs();

        let end_points = server.local_end_points().unwrap();
        assert!(end_points.iter().all(|a| a.is_ipv4()));
        assert!(end_points.contains(&SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            bound[0].port()
        )));
        assert!(end_points.contains(&bound[1]));
        let mut deduped = end_points.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), end_points.len());

        server.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispose_disconnects_sessions() {
        let server = Server::new(EchoFactory::default());
        server.set_bindings(vec![localhost(0)]).unwrap();
        let mut rx = start(&server).await;
        let (client, _) = connect(server.listening_addrs()[0]).await;
        wait_until(|| server.sessions().len() == 1).await;

        server.dispose().await;
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Disposed)).await;
        assert!(server.sessions().is_empty());
        assert!(server.events().is_empty());
        assert_eq!(client.read_line(LineOverflow::Fail).await.unwrap(), None);
        assert!(matches!(server.start(), Err(ServerError::Disposed)));
        server.dispose().await;

        client.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_closure_factory() {
        let server = Server::new(|_: &Binding| -> Arc<dyn SessionHandler> { Arc::new(Echo) });
        server.set_bindings(vec![localhost(0)]).unwrap();
        start(&server).await;
        let (client, greeting) = connect(server.listening_addrs()[0]).await;
        assert!(greeting.starts_with("220"));
        client.dispose().await;
        server.dispose().await;
    }
}
