//! Structured per-session log entries.
//!
//! Sessions report every read, write, free-form note and swallowed error as a
//! [`LogEntry`]. Entries go to an optional [`LogSink`] supplied by the
//! application and are mirrored to `tracing` at trace level.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

use crate::session::SessionId;

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryKind {
    /// Bytes were read from the peer
    Read,
    /// Bytes were written to the peer
    Write,
    /// Free-form text
    Text,
    /// An error occurred
    Exception,
}

impl std::fmt::Display for LogEntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogEntryKind::Read => "read",
            LogEntryKind::Write => "write",
            LogEntryKind::Text => "text",
            LogEntryKind::Exception => "exception",
        };
        f.write_str(s)
    }
}

/// One structured log record
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Entry kind
    pub kind: LogEntryKind,
    /// When the entry was produced
    pub timestamp: DateTime<Utc>,
    /// Number of bytes read or written (0 for text/exception)
    pub size: u64,
    /// Session the entry belongs to
    pub session_id: Option<SessionId>,
    /// Authenticated user of the session, if any
    pub authenticated_identity: Option<String>,
    /// Text payload (the line read/written, or a note)
    pub text: Option<String>,
    /// Raw payload, when the caller wants it logged
    pub data: Option<Bytes>,
    /// Error for [`LogEntryKind::Exception`] entries
    pub error: Option<Arc<anyhow::Error>>,
    /// Local endpoint
    pub local_addr: Option<SocketAddr>,
    /// Remote endpoint
    pub remote_addr: Option<SocketAddr>,
}

impl LogEntry {
    /// Create an entry of the given kind with no payload
    pub fn new(kind: LogEntryKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            size: 0,
            session_id: None,
            authenticated_identity: None,
            text: None,
            data: None,
            error: None,
            local_addr: None,
            remote_addr: None,
        }
    }

    /// Set the byte count
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set the text payload
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the raw payload
    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach an error
    pub fn with_error(mut self, error: Arc<anyhow::Error>) -> Self {
        self.error = Some(error);
        self
    }
}

/// Receiver of structured session log entries
pub trait LogSink: Send + Sync {
    /// Accept one entry
    fn add_entry(&self, entry: &LogEntry);
}

impl std::fmt::Debug for dyn LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogSink")
    }
}

impl<F> LogSink for F
where
    F: Fn(&LogEntry) + Send + Sync,
{
    fn add_entry(&self, entry: &LogEntry) {
        self(entry)
    }
}

/// Deliver an entry to an optional sink and mirror it to tracing
pub(crate) fn dispatch(sink: Option<&Arc<dyn LogSink>>, entry: LogEntry) {
    trace!(
        kind = %entry.kind,
        size = entry.size,
        session_id = ?entry.session_id,
        remote = ?entry.remote_addr,
        text = ?entry.text,
        error = ?entry.error.as_ref().map(|e| e.to_string()),
        "session log"
    );
    if let Some(sink) = sink {
        sink.add_entry(&entry);
    }
}
