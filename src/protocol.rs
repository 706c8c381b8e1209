//! Handshake and control vocabulary
//!
//! Before chat traffic flows, the client sends `HELLO <version>` and then its
//! username; the server answers each step with an OK or an error line.
//! Once admitted, the server may push control lines prefixed with `@`.

use std::num::IntErrorKind;

use crate::error::HandshakeError;

/// Protocol version both sides must agree on exactly
pub const PROTOCOL_VERSION: i64 = 1;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 55555;

/// Username nobody may register; used to sign operator announcements
pub const RESERVED_USERNAME: &str = "server";

pub const OK: &str = "@OK";
pub const KICK: &str = "@KICK";
pub const SERVER_CLOSED: &str = "@SERVER_CLOSED";
pub const CLIENTS_PREFIX: &str = "@CLIENTS ";
pub const ERR_PREFIX: &str = "@ERR ";
pub const MISMATCH_PREFIX: &str = "ERR PROTOCOL_MISMATCH";

pub fn make_hello(version: i64) -> String {
    format!("HELLO {}", version)
}

/// Parse a `HELLO <version>` line (already trimmed)
///
/// Any integer is a well-formed version, including negative ones; integers
/// beyond the `i64` range clamp to its bounds so they still read as a
/// mismatch rather than a malformed hello.
pub fn parse_hello(line: &str) -> Result<i64, HandshakeError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("HELLO"), Some(version), None) => parse_version(version),
        _ => Err(HandshakeError::BadHello),
    }
}

fn parse_version(raw: &str) -> Result<i64, HandshakeError> {
    raw.parse::<i64>().or_else(|e| match e.kind() {
        IntErrorKind::PosOverflow => Ok(i64::MAX),
        IntErrorKind::NegOverflow => Ok(i64::MIN),
        _ => Err(HandshakeError::BadHello),
    })
}

pub fn make_protocol_ok(version: i64) -> String {
    format!("OK PROTOCOL {}", version)
}

pub fn make_protocol_mismatch(server: i64, client: i64) -> String {
    format!("{} server={} client={}", MISMATCH_PREFIX, server, client)
}

/// Recover both versions from a mismatch line
pub fn parse_protocol_mismatch(line: &str) -> Option<(i64, i64)> {
    let rest = line.strip_prefix(MISMATCH_PREFIX)?;
    let mut server = None;
    let mut client = None;
    for field in rest.split_whitespace() {
        if let Some(v) = field.strip_prefix("server=") {
            server = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("client=") {
            client = v.parse().ok();
        }
    }
    Some((server?, client?))
}

/// Check a requested username and return its trimmed form
pub fn validate_username(raw: &str) -> Result<&str, HandshakeError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(HandshakeError::UsernameEmpty);
    }
    if username.to_lowercase() == RESERVED_USERNAME {
        return Err(HandshakeError::UsernameReserved);
    }
    Ok(username)
}

/// Case-insensitive username comparison used for uniqueness
pub fn same_username(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

impl HandshakeError {
    /// Wire code carried after `@ERR`
    pub fn code(&self) -> &'static str {
        match self {
            HandshakeError::BadHello => "bad_hello",
            HandshakeError::ProtocolMismatch { .. } => "protocol_mismatch",
            HandshakeError::UsernameEmpty => "username_empty",
            HandshakeError::UsernameReserved => "username_reserved",
            HandshakeError::UsernameTaken => "username_taken",
        }
    }

    /// Map an `@ERR` code back to its error, `None` for unknown codes
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "bad_hello" => Some(HandshakeError::BadHello),
            "username_empty" => Some(HandshakeError::UsernameEmpty),
            "username_reserved" => Some(HandshakeError::UsernameReserved),
            "username_taken" => Some(HandshakeError::UsernameTaken),
            _ => None,
        }
    }

    /// Line the server sends before closing the connection
    pub fn reply_line(&self) -> String {
        match self {
            HandshakeError::ProtocolMismatch { server, client } => {
                make_protocol_mismatch(*server, *client)
            }
            other => format!("{}{}", ERR_PREFIX, other.code()),
        }
    }
}

/// Build the `@CLIENTS` roster line
pub fn make_clients_line<S: AsRef<str>>(usernames: &[S]) -> Result<String, serde_json::Error> {
    let names: Vec<&str> = usernames.iter().map(AsRef::as_ref).collect();
    Ok(format!("{}{}", CLIENTS_PREFIX, serde_json::to_string(&names)?))
}

/// Classification of a line received by a client after admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// Operator removed us
    Kick,
    /// Server is shutting down
    ServerClosed,
    /// Roster update
    Clients(Vec<String>),
    /// Control line with no effect outside the handshake
    Ignored,
    /// Ordinary chat or notice text
    Chat(String),
}

impl ServerLine {
    pub fn parse(line: &str) -> Self {
        if line == KICK {
            return ServerLine::Kick;
        }
        if line == SERVER_CLOSED {
            return ServerLine::ServerClosed;
        }
        if let Some(payload) = line.strip_prefix(CLIENTS_PREFIX) {
            return match serde_json::from_str::<Vec<serde_json::Value>>(payload.trim()) {
                Ok(values) => ServerLine::Clients(
                    values
                        .into_iter()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect(),
                ),
                Err(_) => ServerLine::Ignored,
            };
        }
        if line == OK || line.starts_with(ERR_PREFIX) {
            return ServerLine::Ignored;
        }
        ServerLine::Chat(line.to_string())
    }
}
