//! Accept loop for one listening socket.
//!
//! `TcpListener::accept` first tries a non-blocking accept and only parks the
//! task on the reactor when no connection is pending, so a burst of queued
//! connections is drained in one loop without any task hand-off.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Pause after a failed accept so persistent errors (e.g. EMFILE) do not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Keeps one listening socket accepting until disposed
pub struct Acceptor {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Start accepting on `listener`.
    ///
    /// `on_accepted` receives every accepted socket; `on_error` every failed
    /// accept. A failed accept never stops the loop.
    pub fn spawn<A, E>(listener: Arc<TcpListener>, on_accepted: A, on_error: E) -> io::Result<Self>
    where
        A: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
        E: Fn(io::Error) + Send + Sync + 'static,
    {
        let local_addr = listener.local_addr()?;
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            trace!(local = %local_addr, remote = %peer, "accepted connection");
                            on_accepted(stream, peer);
                        }
                        Err(e) => {
                            on_error(e);
                            tokio::select! {
                                _ = stop.changed() => break,
                                _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                            }
                        }
                    },
                }
            }
            debug!(local = %local_addr, "acceptor stopped");
        });

        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Address of the listening socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop issuing accepts. In-flight accepts are abandoned. Idempotent.
    ///
    /// The first call returns the aborted accept task; the socket is released
    /// once that task has finished.
    pub fn dispose(&self) -> Option<JoinHandle<()>> {
        self.shutdown.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        task.abort();
        Some(task)
    }

    /// True after [`Acceptor::dispose`]
    pub fn is_disposed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
