//! Server error types.

use std::io;
use std::net::SocketAddr;

use tcp_session::SessionError;
use thiserror::Error;

/// Errors raised by the server and its listening points
#[derive(Error, Debug)]
pub enum ServerError {
    /// Caller passed an argument the server cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not valid in the current server state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Server has been disposed
    #[error("server disposed")]
    Disposed,

    /// A binding could not be bound or put into listening state
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// Session error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;
