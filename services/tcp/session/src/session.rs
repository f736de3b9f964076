//! Session contract and the connection state shared by both session roles.
//!
//! A [`Session`] is one logical connection, either accepted by a server
//! ([`crate::InboundSession`]) or dialed by application code
//! ([`crate::ClientSession`]). Both roles keep their connection state in a
//! [`SessionCore`], which owns the transport and produces log entries.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{Observers, SessionEvent};
use crate::log::{self, LogEntry, LogEntryKind, LogSink};
use crate::transport::{IoStream, LineOverflow, LineTermination, SmartStream};

/// Unique session identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0.simple())
    }
}

/// Operations common to every session role.
///
/// Accessors fail with [`crate::SessionError::NotConnected`] before the
/// session is connected and with [`crate::SessionError::Disposed`] after
/// [`Session::dispose`].
#[async_trait]
pub trait Session: Send + Sync {
    /// Session id, assigned at connect/accept time
    fn id(&self) -> Result<SessionId>;

    /// True while the transport is open
    fn is_connected(&self) -> bool;

    /// True once TLS is active; never goes back to false
    fn is_secure(&self) -> Result<bool>;

    /// When the session was connected
    fn connect_time(&self) -> Result<DateTime<Utc>>;

    /// Last read or write
    fn last_activity(&self) -> Result<DateTime<Utc>>;

    /// Local endpoint
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Remote endpoint
    fn remote_addr(&self) -> Result<SocketAddr>;

    /// Identity established by the protocol layer, if any
    fn authenticated_identity(&self) -> Option<String>;

    /// Event observers of this session
    fn events(&self) -> &Observers<SessionEvent>;

    /// Close the connection. Idempotent; secondary errors are swallowed.
    async fn disconnect(&self);

    /// Release the transport and detach every observer. Idempotent.
    async fn dispose(&self);
}

/// Line reading settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    /// Accepted terminator
    pub termination: LineTermination,
    /// Maximum line length in bytes
    pub max_len: usize,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            termination: LineTermination::CrLf,
            max_len: 32 * 1024,
        }
    }
}

/// Connection state of a connected session
pub struct SessionCore {
    id: SessionId,
    connect_time: DateTime<Utc>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    stream: SmartStream,
    lines: LineSettings,
    authenticated: RwLock<Option<String>>,
    log: Option<Arc<dyn LogSink>>,
}

impl SessionCore {
    /// Take ownership of a connected stream and assign a new id
    pub fn new(
        stream: IoStream,
        io_timeout: Option<Duration>,
        lines: LineSettings,
        log: Option<Arc<dyn LogSink>>,
    ) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            id: SessionId::new(),
            connect_time: Utc::now(),
            local_addr,
            remote_addr,
            stream: SmartStream::new(stream, io_timeout),
            lines,
            authenticated: RwLock::new(None),
            log,
        })
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connect time
    pub fn connect_time(&self) -> DateTime<Utc> {
        self.connect_time
    }

    /// Last read or write
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.stream.activity().last()
    }

    /// Time since the last read or write
    pub fn idle_for(&self) -> Duration {
        self.stream.activity().idle_for()
    }

    /// Local endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True once TLS is active
    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    /// True while the transport is open
    pub fn is_open(&self) -> bool {
        !self.stream.is_closed()
    }

    /// Underlying transport
    pub fn stream(&self) -> &SmartStream {
        &self.stream
    }

    /// Line reading settings
    pub fn line_settings(&self) -> LineSettings {
        self.lines
    }

    /// Identity established by the protocol layer
    pub fn authenticated_identity(&self) -> Option<String> {
        self.authenticated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the identity established by the protocol layer
    pub fn set_authenticated_identity(&self, identity: Option<String>) {
        *self
            .authenticated
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identity;
    }

    /// Read one line and log it
    pub async fn read_line(&self, overflow: LineOverflow) -> Result<Option<String>> {
        let before = self.stream.bytes_read();
        let result = self
            .stream
            .read_line(self.lines.termination, self.lines.max_len, overflow)
            .await;
        let size = self.stream.bytes_read() - before;
        match &result {
            Ok(Some(line)) => self.log(
                LogEntry::new(LogEntryKind::Read)
                    .with_size(size)
                    .with_text(line.clone()),
            ),
            Ok(None) => self.log(LogEntry::new(LogEntryKind::Text).with_text("end of stream")),
            Err(e) => self.log_error(e),
        }
        result
    }

    /// Read raw bytes and log the count
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.stream.read(buf).await?;
        self.log(LogEntry::new(LogEntryKind::Read).with_size(n as u64));
        Ok(n)
    }

    /// Fill `buf` completely and log the count
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).await?;
        self.log(LogEntry::new(LogEntryKind::Read).with_size(buf.len() as u64));
        Ok(())
    }

    /// Write text as-is
    pub async fn write_text(&self, text: &str) -> Result<()> {
        self.stream.write_all(text.as_bytes()).await?;
        self.log(
            LogEntry::new(LogEntryKind::Write)
                .with_size(text.len() as u64)
                .with_text(text),
        );
        Ok(())
    }

    /// Write `line` followed by CRLF
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut data = String::with_capacity(line.len() + 2);
        data.push_str(line);
        data.push_str("\r\n");
        self.stream.write_all(data.as_bytes()).await?;
        self.log(
            LogEntry::new(LogEntryKind::Write)
                .with_size(data.len() as u64)
                .with_text(line),
        );
        Ok(())
    }

    /// Write raw bytes
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.log(
            LogEntry::new(LogEntryKind::Write)
                .with_size(data.len() as u64)
                .with_data(Bytes::copy_from_slice(data)),
        );
        Ok(())
    }

    /// Copy from a reader; see [`SmartStream::write_from`]
    pub async fn write_from<R>(&self, source: &mut R, count: Option<u64>) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let sent = self.stream.write_from(source, count).await?;
        self.log(LogEntry::new(LogEntryKind::Write).with_size(sent));
        Ok(sent)
    }

    /// Close the transport
    pub async fn close(&self) {
        self.stream.close().await;
    }

    /// Emit a log entry stamped with this session's identity and endpoints
    pub fn log(&self, mut entry: LogEntry) {
        entry.session_id = Some(self.id);
        entry.authenticated_identity = self.authenticated_identity();
        entry.local_addr = Some(self.local_addr);
        entry.remote_addr = Some(self.remote_addr);
        log::dispatch(self.log.as_ref(), entry);
    }

    /// Emit an exception entry
    pub fn log_error(&self, error: &crate::SessionError) {
        self.log(
            LogEntry::new(LogEntryKind::Exception)
                .with_error(Arc::new(anyhow::anyhow!(error.to_string()))),
        );
    }
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
