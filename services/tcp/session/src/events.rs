//! Observer lists for session and server events.
//!
//! Every event source owns an [`Observers`] list. Handlers are registered
//! explicitly and stay registered until [`Observers::unsubscribe`] or
//! [`Observers::clear`] is called; disposing a session or server clears its
//! lists so nothing keeps a disposed object reachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by [`Observers::subscribe`], used to unsubscribe later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe list of event handlers
pub struct Observers<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(Subscription, Handler<E>)>>,
}

impl<E> Observers<E> {
    /// Create an empty observer list
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: Subscription) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no handler is registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver an event to every handler.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe from inside a callback.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in snapshot {
            handler(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Subscription, Handler<E>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("handlers", &self.len()).finish()
    }
}

/// Events emitted by sessions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An error that did not fail a caller-visible operation
    Error(Arc<anyhow::Error>),
    /// Inbound session was disconnected (raised exactly once)
    Disconnected,
    /// Inbound session exceeded the server's idle timeout
    IdleTimeout,
    /// Session was disposed
    Disposed,
}
