//! Sessions, buffered transport and TLS for the redb TCP framework.
//!
//! This crate provides the per-connection half of the framework: the session
//! contract, the inbound (server-side) and client (outbound) session roles,
//! the buffered transport stream with in-place TLS upgrade, and the registry
//! servers use to track live sessions.
//!
//! ## Features
//!
//! - **Client sessions**: connect with address failover, optional TLS
//! - **Inbound sessions**: protocol handlers, idle timeout hook, farewell on disconnect
//! - **Transport**: line reading (CRLF or LF-tolerant), byte counters, STARTTLS-style upgrade
//! - **TLS**: rustls with pluggable certificate validation and client certificate selection
//! - **Registry**: thread-safe session map with per-address counts and atomic admission
//!
//! ## Example
//!
//! ```rust,no_run
//! use tcp_session::{ClientOptions, ClientSession, LineOverflow, Session};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut session = ClientSession::new(ClientOptions::default());
//! session.connect("mail.example.org", 25, false).await?;
//!
//! if let Some(greeting) = session.read_line(LineOverflow::Fail).await? {
//!     println!("server says: {}", greeting);
//! }
//! session.write_line("QUIT").await?;
//! session.dispose().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod events;
pub mod inbound;
pub mod log;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod tls;
pub mod transport;

// Re-export main types
pub use client::{ClientOptions, ClientSession};
pub use error::{Result, SessionError};
pub use events::{Observers, SessionEvent, Subscription};
pub use inbound::{InboundOptions, InboundSession, SessionHandler};
pub use log::{LogEntry, LogEntryKind, LogSink};
pub use registry::{Rejection, SessionRegistry};
pub use resolver::{Resolver, StaticResolver, SystemResolver};
pub use session::{LineSettings, Session, SessionCore, SessionId};
pub use tls::{
    CertificateCheck, CertificatePolicyErrors, CertificateValidator, ClientCertificateSelector,
    ClientTlsOptions, DefaultCertificateValidator, TlsCertificate,
};
pub use transport::{IoStream, LineOverflow, LineTermination, SmartStream};
