//! Inbound (server-side) sessions.
//!
//! An [`InboundSession`] is created by the server for every accepted socket.
//! Protocol behavior is supplied through a [`SessionHandler`]: the server
//! calls [`InboundSession::start`], which performs the TLS handshake when the
//! binding requires it and then hands the session to
//! [`SessionHandler::on_start`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use socket2::SockRef;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::events::{Observers, SessionEvent};
use crate::log::{LogEntry, LogEntryKind, LogSink};
use crate::session::{LineSettings, Session, SessionCore, SessionId};
use crate::tls::{self, TlsCertificate};
use crate::transport::{IoStream, LineOverflow};

/// Send and receive buffer size applied to accepted sockets
pub const SOCKET_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on delivering a farewell message
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol behavior of an inbound session
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Run the protocol.
    ///
    /// Called once, after the TLS handshake when the binding requires TLS.
    /// The server disconnects and disposes the session when this returns.
    async fn on_start(&self, session: Arc<InboundSession>) -> anyhow::Result<()>;

    /// Called by the server's idle sweep before it force-disconnects the
    /// session. A handler may send a final message here.
    async fn on_timeout(&self, _session: &Arc<InboundSession>) {}
}

/// Settings an inbound session is initialized with
#[derive(Clone, Debug)]
pub struct InboundOptions {
    /// Host name of the listening point that accepted the connection
    pub host_name: String,
    /// Perform a server TLS handshake before the protocol starts
    pub require_tls: bool,
    /// Certificate for TLS; required when `require_tls` is set
    pub certificate: Option<TlsCertificate>,
    /// Timeout for every read and write; `None` waits indefinitely
    pub io_timeout: Option<Duration>,
    /// Line reading settings
    pub lines: LineSettings,
    /// Structured log sink
    pub log: Option<Arc<dyn LogSink>>,
}

impl Default for InboundOptions {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            require_tls: false,
            certificate: None,
            io_timeout: None,
            lines: LineSettings::default(),
            log: None,
        }
    }
}

/// Session accepted by a server
pub struct InboundSession {
    core: SessionCore,
    host_name: String,
    require_tls: bool,
    certificate: Option<TlsCertificate>,
    handler: Arc<dyn SessionHandler>,
    events: Observers<SessionEvent>,
    started: AtomicBool,
    terminated: AtomicBool,
    disposed: AtomicBool,
}

impl InboundSession {
    /// Initialize a session around an accepted socket
    pub fn init(
        stream: TcpStream,
        options: InboundOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        let socket = SockRef::from(&stream);
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;

        let core = SessionCore::new(
            IoStream::Plain(stream),
            options.io_timeout,
            options.lines,
            options.log,
        )?;
        debug!(
            session_id = %core.id(),
            local = %core.local_addr(),
            remote = %core.remote_addr(),
            "inbound session initialized"
        );
        Ok(Self {
            core,
            host_name: options.host_name,
            require_tls: options.require_tls,
            certificate: options.certificate,
            handler,
            events: Observers::new(),
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Host name of the accepting listening point
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// True when the binding requires TLS from the first byte
    pub fn require_tls(&self) -> bool {
        self.require_tls
    }

    /// True after [`Session::dispose`]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Time since the last read or write
    pub fn idle_for(&self) -> Duration {
        self.core.idle_for()
    }

    /// Perform the TLS handshake if required, then run the protocol handler
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let core = self.core()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::InvalidState("session already started"));
        }

        if self.require_tls {
            self.switch_to_secure().await?;
        }

        info!(
            session_id = %core.id(),
            remote = %core.remote_addr(),
            secure = core.is_secure(),
            "inbound session started"
        );
        if let Err(e) = self.handler.on_start(Arc::clone(self)).await {
            let e = Arc::new(e);
            core.log(LogEntry::new(LogEntryKind::Exception).with_error(Arc::clone(&e)));
            self.events.emit(&SessionEvent::Error(Arc::clone(&e)));
            return Err(SessionError::Handler(e));
        }
        Ok(())
    }

    /// Run a server TLS handshake on the open connection
    pub async fn switch_to_secure(&self) -> Result<()> {
        let core = self.core()?;
        if core.is_secure() {
            return Err(SessionError::AlreadySecure);
        }
        let certificate = self.certificate.as_ref().ok_or(SessionError::NoCertificate)?;
        let acceptor = tls::server_tls_acceptor(certificate)?;
        if let Err(e) = core.stream().upgrade_to_server_tls(acceptor).await {
            core.log_error(&e);
            return Err(e);
        }
        core.log(LogEntry::new(LogEntryKind::Text).with_text("tls handshake completed"));
        debug!(session_id = %core.id(), "inbound session switched to tls");
        Ok(())
    }

    /// Idle timeout notification from the server's sweep
    pub async fn on_timeout(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        self.core.log(LogEntry::new(LogEntryKind::Text).with_text("idle timeout"));
        self.events.emit(&SessionEvent::IdleTimeout);
        self.handler.on_timeout(self).await;
    }

    /// Close the connection, optionally sending `farewell` as a final line.
    ///
    /// Idempotent. The farewell is best effort. [`SessionEvent::Disconnected`]
    /// is raised exactly once.
    pub async fn disconnect_with(&self, farewell: Option<&str>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(text) = farewell {
            match tokio::time::timeout(FAREWELL_TIMEOUT, self.core.write_line(text)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id = %self.core.id(), "farewell not delivered: {}", e),
                Err(_) => debug!(session_id = %self.core.id(), "farewell timed out"),
            }
        }

        self.core.close().await;
        self.core
            .log(LogEntry::new(LogEntryKind::Text).with_text("disconnected"));
        debug!(
            session_id = %self.core.id(),
            remote = %self.core.remote_addr(),
            "inbound session disconnected"
        );
        self.events.emit(&SessionEvent::Disconnected);
    }

    /// Read one line using the configured terminator and length limit
    pub async fn read_line(&self, overflow: LineOverflow) -> Result<Option<String>> {
        self.core()?.read_line(overflow).await
    }

    /// Read whatever is available. 0 means EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.core()?.read(buf).await
    }

    /// Fill `buf` completely
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.core()?.read_exact(buf).await
    }

    /// Send text as-is
    pub async fn write(&self, text: &str) -> Result<()> {
        self.core()?.write_text(text).await
    }

    /// Send `line` followed by CRLF
    pub async fn write_line(&self, line: &str) -> Result<()> {
        self.core()?.write_line(line).await
    }

    /// Send raw bytes
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.core()?.write_bytes(data).await
    }

    /// Send `count` bytes from `source`, or all of it when `count` is `None`
    pub async fn write_stream<R>(&self, source: &mut R, count: Option<u64>) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.core()?.write_from(source, count).await
    }

    /// Flush pending writes
    pub async fn flush(&self) -> Result<()> {
        self.core()?.stream().flush().await
    }

    /// Record the identity the protocol authenticated as
    pub fn set_authenticated_identity(&self, identity: Option<String>) -> Result<()> {
        self.core()?.set_authenticated_identity(identity);
        Ok(())
    }

    /// Total bytes read
    pub fn bytes_read(&self) -> Result<u64> {
        Ok(self.core()?.stream().bytes_read())
    }

    /// Total bytes written
    pub fn bytes_written(&self) -> Result<u64> {
        Ok(self.core()?.stream().bytes_written())
    }

    /// Emit a free-form log entry
    pub fn log_text(&self, text: impl Into<String>) {
        self.core.log(LogEntry::new(LogEntryKind::Text).with_text(text));
    }

    fn core(&self) -> Result<&SessionCore> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        Ok(&self.core)
    }
}

#[async_trait]
impl Session for InboundSession {
    fn id(&self) -> Result<SessionId> {
        Ok(self.core()?.id())
    }

    fn is_connected(&self) -> bool {
        !self.is_disposed() && !self.terminated.load(Ordering::Acquire) && self.core.is_open()
    }

    fn is_secure(&self) -> Result<bool> {
        Ok(self.core()?.is_secure())
    }

    fn connect_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.core()?.connect_time())
    }

    fn last_activity(&self) -> Result<DateTime<Utc>> {
        Ok(self.core()?.last_activity())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.core()?.local_addr())
    }

    fn remote_addr(&self) -> Result<SocketAddr> {
        Ok(self.core()?.remote_addr())
    }

    fn authenticated_identity(&self) -> Option<String> {
        self.core.authenticated_identity()
    }

    fn events(&self) -> &Observers<SessionEvent> {
        &self.events
    }

    async fn disconnect(&self) {
        self.disconnect_with(None).await;
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disconnect_with(None).await;
        self.events.emit(&SessionEvent::Disposed);
        self.events.clear();
    }
}

impl Drop for InboundSession {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::Acquire) {
            warn!(session_id = %self.core.id(), "inbound session dropped while connected");
        }
    }
}

impl std::fmt::Debug for InboundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundSession")
            .field("core", &self.core)
            .field("host_name", &self.host_name)
            .field("require_tls", &self.require_tls)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
