//! Events pushed to whatever front end observes the engines
//!
//! Both engines write into unbounded channels so a slow consumer can never
//! stall a connection task. A dropped receiver is ignored.

use tokio::sync::mpsc;

use crate::types::Roster;

/// Category and severity of a server log event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Warn,
    Error,
    Chat,
    Connect,
    Disconnect,
}

/// Server → observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Human-readable log line
    Log { kind: LogKind, text: String },
    /// Roster changed; carries the fresh snapshot
    Roster(Roster),
}

/// Client → observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Chat or notice line from the server
    Line(String),
    /// Usernames from the latest `@CLIENTS` update
    Roster(Vec<String>),
    /// Connection ended; fired once per connection
    Disconnected(String),
}

pub type ServerEvents = mpsc::UnboundedSender<ServerEvent>;
pub type ClientEvents = mpsc::UnboundedSender<ClientEvent>;

/// Mirror a log event into tracing and forward it to the observer
pub(crate) fn emit_log(events: &ServerEvents, kind: LogKind, text: String) {
    match kind {
        LogKind::Error => tracing::error!("{}", text),
        LogKind::Warn => tracing::warn!("{}", text),
        LogKind::Chat => tracing::debug!("{}", text),
        LogKind::Info | LogKind::Connect | LogKind::Disconnect => tracing::info!("{}", text),
    }
    let _ = events.send(ServerEvent::Log { kind, text });
}
