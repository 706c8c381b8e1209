//! Basic type definitions for the chat relay
//!
//! Provides:
//! - `ConnectionId`: UUID-based handle for one accepted TCP connection
//! - `RosterEntry` / `Roster`: point-in-time view of admitted sessions

use std::net::SocketAddr;

use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. This is the registry key, so it implements Hash and Eq.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One admitted participant as seen by observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub username: String,
    pub addr: SocketAddr,
}

impl std::fmt::Display for RosterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.username, self.addr)
    }
}

/// Roster snapshot, sorted by username case-insensitively
pub type Roster = Vec<RosterEntry>;
