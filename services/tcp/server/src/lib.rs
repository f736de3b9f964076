//! Server half of the redb TCP framework.
//!
//! A [`Server`] owns the listening sockets described by its [`Binding`]s,
//! runs a pool of [`Acceptor`]s per socket, applies admission control to
//! every accepted connection and disconnects idle sessions on a periodic
//! sweep. Protocol behavior is plugged in through a [`SessionFactory`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tcp_server::{Binding, Server};
//! use tcp_session::{InboundSession, SessionHandler};
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl SessionHandler for Greeter {
//!     async fn on_start(&self, session: Arc<InboundSession>) -> anyhow::Result<()> {
//!         session.write_line("hello").await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(|_: &Binding| -> Arc<dyn SessionHandler> { Arc::new(Greeter) });
//! server.set_bindings(vec![Binding::any(2525)])?;
//! server.start()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod binding;
pub mod error;
pub mod server;

// Re-export main types
pub use acceptor::Acceptor;
pub use binding::{Binding, TlsMode};
pub use error::{Result, ServerError};
pub use server::{
    Server, ServerEvent, ServerLimits, SessionFactory, DEFAULT_ACCEPTORS_PER_SOCKET,
    DEFAULT_LISTEN_BACKLOG, DEFAULT_SESSION_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
    MAX_ACCEPTORS_PER_SOCKET,
};
