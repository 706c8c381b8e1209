//! Error types for the chat relay
//!
//! Handshake rejections carry the exact wire code so both ends can match on
//! them; server, client and per-connection send failures each get their own
//! enum. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Handshake rejection reasons
///
/// Every variant is communicated to the peer before the connection closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// First line was not `HELLO <version>`
    #[error("Bad protocol hello")]
    BadHello,

    /// Client declared a different protocol version
    #[error("Protocol mismatch (server={server}, client={client})")]
    ProtocolMismatch { server: i64, client: i64 },

    /// Username empty after trimming
    #[error("Username is empty")]
    UsernameEmpty,

    /// Username is "server" in some casing
    #[error("Username \"SERVER\" is reserved")]
    UsernameReserved,

    /// Another session already uses this username (case-insensitive)
    #[error("Username already in use")]
    UsernameTaken,
}

/// Server engine errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listening port is held by someone else
    #[error("Port {port} is already in use")]
    AddrInUse { port: u16 },

    /// Any other bind/listen failure
    #[error("Server failed to start: {0}")]
    Bind(#[source] std::io::Error),

    /// Bind host did not resolve to an address
    #[error("Cannot resolve bind address: {0}")]
    Resolve(String),

    /// Kick target has no session
    #[error("User not found: {0}")]
    UserNotFound(String),
}

/// Client engine errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client already connected")]
    AlreadyConnected,

    #[error("Client is not connected")]
    NotConnected,

    /// Host, port or username rejected before any network I/O
    #[error("{0}")]
    InvalidInput(String),

    /// Server refused the handshake with a known code
    #[error("{0}")]
    Handshake(#[from] HandshakeError),

    /// Server refused the handshake with a code we do not know
    #[error("Server rejected connection: {0}")]
    Rejected(String),

    /// Server answered with something outside the handshake vocabulary
    #[error("Invalid server handshake response")]
    InvalidHandshake,

    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Server closed connection during handshake")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Send failed: {0}")]
    Send(#[from] SendError),
}

/// Line send errors
///
/// Occurs when writing to a connection that is closed or broken.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection was already force-closed
    #[error("Connection closed")]
    Closed,

    /// A bounded write did not finish in time
    #[error("Write timed out")]
    Timeout,

    /// The OS refused the write
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure inside one server worker
///
/// Contained to that connection; the worker logs it and runs its cleanup.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Send(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_messages() {
        assert_eq!(HandshakeError::UsernameTaken.to_string(), "Username already in use");
        assert_eq!(
            HandshakeError::ProtocolMismatch { server: 1, client: 2 }.to_string(),
            "Protocol mismatch (server=1, client=2)"
        );
    }

    #[test]
    fn test_client_error_wraps_handshake() {
        let err: ClientError = HandshakeError::UsernameReserved.into();
        assert!(matches!(err, ClientError::Handshake(HandshakeError::UsernameReserved)));
        assert_eq!(err.to_string(), "Username \"SERVER\" is reserved");
    }
}
