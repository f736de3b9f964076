//! Thread-safe session registry with per-address connection counts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::error::SessionError;
use crate::session::{Session, SessionId};

/// Why a session was not registered
#[derive(Error, Debug)]
pub enum Rejection {
    /// The registry already holds the maximum number of sessions
    #[error("maximum number of connections reached")]
    MaxConnections,

    /// The remote address already holds its maximum number of sessions
    #[error("maximum number of connections for {0} reached")]
    MaxConnectionsPerIp(IpAddr),

    /// A session with the same id is already registered
    #[error("session {0} is already registered")]
    Duplicate(SessionId),

    /// The session could not report its id or remote address
    #[error("session cannot be registered: {0}")]
    Unavailable(#[from] SessionError),
}

struct Entry<S: ?Sized> {
    session: Arc<S>,
    ip: IpAddr,
}

struct Inner<S: ?Sized> {
    sessions: HashMap<SessionId, Entry<S>>,
    per_ip: HashMap<IpAddr, usize>,
}

/// Live sessions keyed by id, with a count of sessions per remote IP.
///
/// Insertion, removal and the admission checks run under one lock, so
/// `sum(per-IP counts) == len()` holds whenever no call is in progress.
pub struct SessionRegistry<S: ?Sized> {
    inner: Mutex<Inner<S>>,
}

impl<S: Session + ?Sized> SessionRegistry<S> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                per_ip: HashMap::new(),
            }),
        }
    }

    /// Register `session` unless a limit is reached. A limit of 0 is unlimited.
    ///
    /// `max_connections = K` admits exactly K sessions; the checks and the
    /// insertion are a single atomic step.
    pub fn try_add(
        &self,
        session: Arc<S>,
        max_connections: usize,
        max_connections_per_ip: usize,
    ) -> Result<(), Rejection> {
        let id = session.id()?;
        let ip = session.remote_addr()?.ip().to_canonical();

        let mut inner = self.lock();
        if inner.sessions.contains_key(&id) {
            return Err(Rejection::Duplicate(id));
        }
        if max_connections > 0 && inner.sessions.len() >= max_connections {
            return Err(Rejection::MaxConnections);
        }
        let count = inner.per_ip.get(&ip).copied().unwrap_or(0);
        if max_connections_per_ip > 0 && count >= max_connections_per_ip {
            return Err(Rejection::MaxConnectionsPerIp(ip));
        }

        inner.sessions.insert(id, Entry { session, ip });
        *inner.per_ip.entry(ip).or_insert(0) += 1;
        Ok(())
    }

    /// Register `session` without limits
    pub fn add(&self, session: Arc<S>) -> Result<(), Rejection> {
        self.try_add(session, 0, 0)
    }

    /// Remove a session. Returns `None` when it was not registered.
    pub fn remove(&self, id: SessionId) -> Option<Arc<S>> {
        let mut inner = self.lock();
        let entry = inner.sessions.remove(&id)?;
        if let Some(count) = inner.per_ip.get_mut(&entry.ip) {
            *count -= 1;
            if *count == 0 {
                inner.per_ip.remove(&entry.ip);
            }
        }
        Some(entry.session)
    }

    /// Look up a session by id
    pub fn get(&self, id: SessionId) -> Option<Arc<S>> {
        self.lock().sessions.get(&id).map(|e| Arc::clone(&e.session))
    }

    /// True when `id` is registered
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// True when no session is registered
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// Number of registered sessions from `ip`
    pub fn connections_per_ip(&self, ip: IpAddr) -> usize {
        self.lock()
            .per_ip
            .get(&ip.to_canonical())
            .copied()
            .unwrap_or(0)
    }

    /// Per-address counts
    pub fn ip_counts(&self) -> HashMap<IpAddr, usize> {
        self.lock().per_ip.clone()
    }

    /// Point-in-time copy of the registered sessions
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.lock()
            .sessions
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Session + ?Sized> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> std::fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SessionRegistry")
            .field("sessions", &inner.sessions.len())
            .field("addresses", &inner.per_ip.len())
            .finish()
    }
}
