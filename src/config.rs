//! Engine configuration
//!
//! Plain structs with defaults; the server side can also be read from the
//! environment (`LINE_RELAY_HOST`, `LINE_RELAY_PORT`).

use std::env;
use std::time::Duration;

use crate::protocol::DEFAULT_PORT;

/// Default bind host (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default connect + handshake deadline for clients
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server bind settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// `0` asks the OS for an ephemeral port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Defaults overridden by `LINE_RELAY_HOST` / `LINE_RELAY_PORT`
    ///
    /// An unparsable port falls back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = env::var("LINE_RELAY_HOST") {
            if !host.trim().is_empty() {
                config.host = host.trim().to_string();
            }
        }
        if let Some(port) = env::var("LINE_RELAY_PORT")
            .ok()
            .and_then(|p| p.trim().parse().ok())
        {
            config.port = port;
        }
        config
    }
}

/// Client connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Bound on connect plus the whole handshake; removed once admitted
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}
