//! Membership of currently connected sessions.
//!
//! The registry is created once per server and handed to every connection
//! handler. It only stores [`SessionHandle`]s; the connection itself stays
//! with the handler that accepted it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::session::{SessionHandle, SessionId};

#[derive(Debug, Default)]
pub struct Registry {
    // Registration order doubles as fan-out order.
    sessions: Mutex<Vec<SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<SessionHandle>> {
        // Nothing in the critical sections can leave the list half-updated.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session. Returns `false` if that id was already present,
    /// in which case the registry is left unchanged.
    pub fn add(&self, session: SessionHandle) -> bool {
        let mut sessions = self.sessions();
        if sessions.iter().any(|existing| existing.id() == session.id()) {
            return false;
        }
        sessions.push(session);
        true
    }

    /// Deregisters a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions();
        match sessions.iter().position(|session| session.id() == id) {
            Some(index) => {
                sessions.remove(index);
                true
            }
            None => false,
        }
    }

    /// Copies the current membership so fan-out can run without the lock.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions().clone()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions().iter().any(|session| session.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Registers `session` for as long as the returned guard lives.
    pub fn join(self: &Arc<Self>, session: SessionHandle) -> Membership {
        let id = session.id();
        self.add(session);
        debug!(session = %id, members = self.len(), "session registered");
        Membership {
            registry: Arc::clone(self),
            id,
        }
    }
}

/// Scoped registration; dropping it removes the session from the registry.
#[derive(Debug)]
pub struct Membership {
    registry: Arc<Registry>,
    id: SessionId,
}

impl Membership {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            debug!(session = %self.id, members = self.registry.len(), "session unregistered");
        }
    }
}
