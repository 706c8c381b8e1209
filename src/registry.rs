//! Session registry
//!
//! Maps each admitted connection to its username and remote address. All
//! access goes through one mutex that is never held across network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::HandshakeError;
use crate::protocol::same_username;
use crate::types::{ConnectionId, Roster, RosterEntry};

/// One admitted chat participant
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub addr: SocketAddr,
    pub conn: Arc<Connection>,
}

impl Session {
    pub fn new(username: String, addr: SocketAddr, conn: Arc<Connection>) -> Self {
        Self {
            username,
            addr,
            conn,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id
    }
}

/// Thread-safe set of sessions, owned by one server instance
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<ConnectionId, Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless its username is already taken
    ///
    /// The collision check and the insert share one critical section.
    pub fn admit(&self, session: Session) -> Result<(), HandshakeError> {
        let mut sessions = self.sessions.lock();
        if sessions
            .values()
            .any(|s| same_username(&s.username, &session.username))
        {
            return Err(HandshakeError::UsernameTaken);
        }
        sessions.insert(session.id(), session);
        Ok(())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Session> {
        self.sessions.lock().remove(&id)
    }

    /// Remove every listed connection, returning how many were present
    pub fn remove_all(&self, ids: &[ConnectionId]) -> usize {
        let mut sessions = self.sessions.lock();
        ids.iter().filter(|id| sessions.remove(id).is_some()).count()
    }

    /// Remove the session whose username matches exactly
    pub fn remove_by_username(&self, username: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let id = sessions
            .iter()
            .find(|(_, s)| s.username == username)
            .map(|(id, _)| *id)?;
        sessions.remove(&id)
    }

    /// Connections currently eligible for broadcast
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.sessions
            .lock()
            .values()
            .map(|s| Arc::clone(&s.conn))
            .collect()
    }

    /// Sorted copy of the current sessions
    pub fn snapshot(&self) -> Roster {
        let mut roster: Roster = self
            .sessions
            .lock()
            .values()
            .map(|s| RosterEntry {
                username: s.username.clone(),
                addr: s.addr,
            })
            .collect();
        roster.sort_by_cached_key(|e| e.username.to_lowercase());
        roster
    }

    /// Empty the registry, handing back what it held
    pub fn drain(&self) -> Vec<Session> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
