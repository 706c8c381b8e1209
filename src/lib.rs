//! Multi-user TCP Chat Relay Library
//!
//! A line-oriented chat relay over raw TCP built on tokio: the server
//! negotiates a protocol version and a unique username with every
//! connection, then relays chat lines between all admitted sessions.
//!
//! # Features
//! - Two-step handshake (`HELLO <version>`, then username)
//! - Case-insensitive unique usernames, "server" reserved
//! - Broadcast with dead-connection detection and a single roster settle
//! - Operator kick, announcements and graceful shutdown
//! - Client engine with a background receive loop
//!
//! # Architecture
//! - `ChatServer` owns the listener, the accept loop and the `Registry`
//! - Each accepted connection has a `handler` task performing the handshake
//! - The registry is the only shared state; its lock is never held across I/O
//! - Observers consume `ServerEvent` / `ClientEvent` from mpsc channels
//!
//! # Example
//! ```ignore
//! use tokio::sync::mpsc;
//! use line_relay::{ChatClient, ChatServer, ClientConfig, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (server_tx, _server_rx) = mpsc::unbounded_channel();
//!     let server = ChatServer::new(ServerConfig::new("127.0.0.1", 0), server_tx);
//!     let addr = server.start().await.unwrap();
//!
//!     let (client_tx, _client_rx) = mpsc::unbounded_channel();
//!     let client = ChatClient::new(ClientConfig::default(), client_tx);
//!     client.connect("127.0.0.1", addr.port(), "alice").await.unwrap();
//!     client.send("hi").await.unwrap();
//!
//!     server.stop().await;
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use client::ChatClient;
pub use codec::{encode_line, split_lines, LineBuffer};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ClientError, HandshakeError, SendError, ServerError, SessionError};
pub use event::{ClientEvent, LogKind, ServerEvent};
pub use protocol::{DEFAULT_PORT, PROTOCOL_VERSION};
pub use registry::{Registry, Session};
pub use server::ChatServer;
pub use types::{ConnectionId, Roster, RosterEntry};
