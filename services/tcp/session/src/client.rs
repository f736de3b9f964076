//! Outbound (client-side) sessions.
//!
//! A [`ClientSession`] dials a remote host itself. Host names are resolved to
//! an ordered address list and tried one by one until a TCP connection is
//! established; any failure after that point (for example the TLS handshake)
//! is returned immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio::net::TcpSocket;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::events::{Observers, SessionEvent};
use crate::log::{LogEntry, LogEntryKind, LogSink};
use crate::resolver::{Resolver, SystemResolver};
use crate::session::{LineSettings, Session, SessionCore, SessionId};
use crate::tls::{self, ClientTlsOptions};
use crate::transport::{IoStream, LineOverflow};

/// Default read/write timeout for client sessions
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a client session
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Local address to bind before connecting
    pub local_addr: Option<SocketAddr>,
    /// Timeout for connect, every read and every write
    pub io_timeout: Option<Duration>,
    /// Line reading settings
    pub lines: LineSettings,
    /// Host name resolver
    pub resolver: Arc<dyn Resolver>,
    /// TLS settings used by `use_tls` and [`ClientSession::switch_to_secure`]
    pub tls: ClientTlsOptions,
    /// Structured log sink
    pub log: Option<Arc<dyn LogSink>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            local_addr: None,
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            lines: LineSettings::default(),
            resolver: Arc::new(SystemResolver),
            tls: ClientTlsOptions::default(),
            log: None,
        }
    }
}

/// Session dialed by application code
pub struct ClientSession {
    options: ClientOptions,
    core: Option<SessionCore>,
    server_name: Option<String>,
    events: Observers<SessionEvent>,
    disposed: AtomicBool,
}

impl ClientSession {
    /// Create an unconnected session
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            core: None,
            server_name: None,
            events: Observers::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Options this session was created with
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Resolve `host` and connect to the first address that accepts.
    ///
    /// Only a failure to establish the TCP connection moves on to the next
    /// address. The error of the last attempt is returned.
    pub async fn connect(&mut self, host: &str, port: u16, use_tls: bool) -> Result<()> {
        self.ensure_connectable()?;
        if host.trim().is_empty() {
            return Err(SessionError::InvalidArgument("host is empty".into()));
        }

        let addrs = self.options.resolver.resolve(host, port).await?;
        if addrs.is_empty() {
            return Err(SessionError::Resolve {
                host: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            });
        }

        let last = addrs.len() - 1;
        for (i, remote) in addrs.into_iter().enumerate() {
            match self
                .connect_to(self.options.local_addr, remote, use_tls, host)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !self.is_connected() && i < last => {
                    debug!(host, %remote, "connect attempt failed, trying next address: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::InvalidState("no address was attempted"))
    }

    /// Connect to one address, optionally from a fixed local address
    pub async fn connect_addr(
        &mut self,
        local_addr: Option<SocketAddr>,
        remote_addr: SocketAddr,
        use_tls: bool,
    ) -> Result<()> {
        self.ensure_connectable()?;
        let name = remote_addr.ip().to_string();
        self.connect_to(local_addr, remote_addr, use_tls, &name).await
    }

    async fn connect_to(
        &mut self,
        local_addr: Option<SocketAddr>,
        remote_addr: SocketAddr,
        use_tls: bool,
        server_name: &str,
    ) -> Result<()> {
        let socket = if remote_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = local_addr {
            if local.is_ipv4() != remote_addr.is_ipv4() {
                return Err(SessionError::InvalidArgument(format!(
                    "local address {} does not match the family of {}",
                    local, remote_addr
                )));
            }
            socket.bind(local)?;
        }

        let stream = match self.options.io_timeout {
            Some(limit) => tokio::time::timeout(limit, socket.connect(remote_addr))
                .await
                .map_err(|_| SessionError::Timeout(limit))??,
            None => socket.connect(remote_addr).await?,
        };

        let core = SessionCore::new(
            IoStream::Plain(stream),
            self.options.io_timeout,
            self.options.lines,
            self.options.log.clone(),
        )?;
        info!(
            session_id = %core.id(),
            local = %core.local_addr(),
            remote = %core.remote_addr(),
            "client session connected"
        );
        core.log(
            LogEntry::new(LogEntryKind::Text)
                .with_text(format!("connected to {}", core.remote_addr())),
        );
        self.core = Some(core);
        self.server_name = Some(server_name.to_string());

        if use_tls {
            self.switch_to_secure().await?;
        }
        Ok(())
    }

    /// Run a client TLS handshake on the open connection
    pub async fn switch_to_secure(&self) -> Result<()> {
        let core = self.core()?;
        if core.is_secure() {
            return Err(SessionError::AlreadySecure);
        }
        let name = self
            .server_name
            .as_deref()
            .ok_or(SessionError::NotConnected)?;

        let connector = tls::client_tls_connector(&self.options.tls)?;
        let server_name = tls::server_name(name)?;
        if let Err(e) = core.stream().upgrade_to_client_tls(connector, server_name).await {
            core.log_error(&e);
            return self.reported(Err(e));
        }
        core.log(LogEntry::new(LogEntryKind::Text).with_text("tls handshake completed"));
        debug!(session_id = %core.id(), "client session switched to tls");
        Ok(())
    }

    /// Read one line using the configured terminator and length limit
    pub async fn read_line(&self, overflow: LineOverflow) -> Result<Option<String>> {
        self.reported(self.core()?.read_line(overflow).await)
    }

    /// Read whatever is available. 0 means EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.reported(self.core()?.read(buf).await)
    }

    /// Fill `buf` completely
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.reported(self.core()?.read_exact(buf).await)
    }

    /// Send text as-is
    pub async fn write(&self, text: &str) -> Result<()> {
        self.reported(self.core()?.write_text(text).await)
    }

    /// Send `line` followed by CRLF
    pub async fn write_line(&self, line: &str) -> Result<()> {
        self.reported(self.core()?.write_line(line).await)
    }

    /// Send raw bytes
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.reported(self.core()?.write_bytes(data).await)
    }

    /// Send `count` bytes from `source`, or all of it when `count` is `None`
    pub async fn write_stream<R>(&self, source: &mut R, count: Option<u64>) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.reported(self.core()?.write_from(source, count).await)
    }

    /// Flush pending writes
    pub async fn flush(&self) -> Result<()> {
        self.reported(self.core()?.stream().flush().await)
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
        if let Some(core) = &self.core {
            core.log(LogEntry::new(LogEntryKind::Text).with_text(text));
        }
    }

    /// Raise [`SessionEvent::Error`] for transport failures. Usage errors and
    /// a closed connection are only returned.
    fn reported<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(
                e,
                SessionError::Io(_) | SessionError::Tls(_) | SessionError::Timeout(_)
            ) && !e.is_disconnect()
            {
                self.events
                    .emit(&SessionEvent::Error(Arc::new(anyhow::anyhow!("{}", e))));
            }
        }
        result
    }

    fn core(&self) -> Result<&SessionCore> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionError::Disposed);
        }
        self.core.as_ref().ok_or(SessionError::NotConnected)
    }

    fn ensure_connectable(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionError::Disposed);
        }
        if self.is_connected() {
            return Err(SessionError::InvalidState("session is already connected"));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for ClientSession {
    fn id(&self) -> Result<SessionId> {
        Ok(self.core()?.id())
    }

    fn is_connected(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.core.as_ref().is_some_and(|c| c.is_open())
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
        self.core.as_ref().and_then(|c| c.authenticated_identity())
    }

    fn events(&self) -> &Observers<SessionEvent> {
        &self.events
    }

    async fn disconnect(&self) {
        let Some(core) = &self.core else {
            return;
        };
        if !core.is_open() {
            return;
        }
        core.close().await;
        core.log(LogEntry::new(LogEntryKind::Text).with_text("disconnected"));
        debug!(session_id = %core.id(), "client session disconnected");
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(core) = &self.core {
            if core.is_open() {
                core.close().await;
            }
        }
        self.events.emit(&SessionEvent::Disposed);
        self.events.clear();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) && self.is_connected() {
            warn!("client session dropped without dispose; socket closed by drop");
        }
    }
}
