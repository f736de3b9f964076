//! Session error types.

use std::io;
use thiserror::Error;

/// Errors raised by sessions and the transport underneath them
#[derive(Error, Debug)]
pub enum SessionError {
    /// Caller passed an argument the operation cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not valid in the current session state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Session (or its transport) has been disposed
    #[error("session disposed")]
    Disposed,

    /// Session has not been connected yet
    #[error("session not connected")]
    NotConnected,

    /// Session was disconnected while the operation was pending
    #[error("session disconnected")]
    Disconnected,

    /// TLS is already active on this session
    #[error("session is already secure")]
    AlreadySecure,

    /// TLS was required but no certificate was configured
    #[error("tls required but no certificate was supplied")]
    NoCertificate,

    /// A line exceeded the configured maximum length
    #[error("line exceeds maximum length of {limit} bytes")]
    LineTooLong {
        /// Configured limit
        limit: usize,
    },

    /// Host name could not be resolved
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Host that was looked up
        host: String,
        /// Underlying resolver error
        #[source]
        source: io::Error,
    },

    /// TLS configuration or handshake failure
    #[error("tls error: {0}")]
    Tls(String),

    /// Read or write did not complete within the configured timeout
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The protocol handler attached to an inbound session failed
    #[error("session handler failed: {0:#}")]
    Handler(std::sync::Arc<anyhow::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rustls::Error> for SessionError {
    fn from(err: rustls::Error) -> Self {
        SessionError::Tls(err.to_string())
    }
}

impl SessionError {
    /// True for errors that mean the peer or the local side closed the connection
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Disconnected | SessionError::Disposed => true,
            SessionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
