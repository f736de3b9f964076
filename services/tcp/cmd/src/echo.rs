//! Line-echo demo protocol served by `redb-tcp serve`.
//!
//! ```text
//! S: 220 <host> redb-tcp ready
//! C: hello
//! S: 250 hello
//! C: STARTTLS
//! S: 220 ready to start TLS
//! C: QUIT
//! S: 221 <host> closing connection
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tcp_server::{Binding, SessionFactory, TlsMode};
use tcp_session::{InboundSession, LineOverflow, Session, SessionError, SessionHandler};
use tracing::debug;

/// Handler for one echo session
pub struct EchoHandler {
    host_name: String,
    starttls_available: bool,
}

impl EchoHandler {
    fn new(binding: &Binding) -> Self {
        Self {
            host_name: binding.host_name().to_string(),
            starttls_available: binding.tls_mode() == TlsMode::None
                && binding.certificate().is_some(),
        }
    }

    async fn starttls(&self, session: &InboundSession) -> Result<(), SessionError> {
        if session.is_secure()? {
            return session.write_line("503 connection is already secure").await;
        }
        if !self.starttls_available {
            return session.write_line("454 TLS not available").await;
        }
        session.write_line("220 ready to start TLS").await?;
        session.switch_to_secure().await
    }
}

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn on_start(&self, session: Arc<InboundSession>) -> anyhow::Result<()> {
        session
            .write_line(&format!("220 {} redb-tcp ready", self.host_name))
            .await?;

        loop {
            let line = match session.read_line(LineOverflow::Fail).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(SessionError::LineTooLong { .. }) => {
                    session.write_line("500 line too long").await?;
                    continue;
                }
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match line.trim().to_ascii_uppercase().as_str() {
                "QUIT" => {
                    session
                        .disconnect_with(Some(&format!("221 {} closing connection", self.host_name)))
                        .await;
                    return Ok(());
                }
                "STARTTLS" => self.starttls(&session).await?,
                _ => session.write_line(&format!("250 {}", line)).await?,
            }
        }
    }

    async fn on_timeout(&self, session: &Arc<InboundSession>) {
        debug!(remote = ?session.remote_addr().ok(), "echo session idle");
        session
            .disconnect_with(Some(&format!("421 {} idle timeout", self.host_name)))
            .await;
    }
}

/// Creates an [`EchoHandler`] per accepted connection
#[derive(Debug, Default)]
pub struct EchoFactory;

#[async_trait]
impl SessionFactory for EchoFactory {
    fn create(&self, binding: &Binding) -> Arc<dyn SessionHandler> {
        Arc::new(EchoHandler::new(binding))
    }

    async fn on_max_connections_exceeded(&self, session: &Arc<InboundSession>) {
        let _ = session.write_line("421 too many connections, try again later").await;
    }

    async fn on_max_connections_per_ip_exceeded(&self, session: &Arc<InboundSession>) {
        let _ = session
            .write_line("421 too many connections from your address")
            .await;
    }
}
