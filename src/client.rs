//! ChatClient engine
//!
//! Owns one outbound connection: runs the client side of the handshake,
//! then a background task that reads server lines and turns them into
//! [`ClientEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{Connection, LineReader};
use crate::error::{ClientError, HandshakeError};
use crate::event::{ClientEvent, ClientEvents};
use crate::protocol::{
    make_hello, make_protocol_ok, parse_protocol_mismatch, validate_username, ServerLine,
    ERR_PREFIX, MISMATCH_PREFIX, OK, PROTOCOL_VERSION,
};

pub const REASON_KICKED: &str = "kicked by server";
pub const REASON_SERVER_CLOSED: &str = "server closed";
pub const REASON_CONNECTION_LOST: &str = "connection lost";

/// One admitted connection and its disconnect bookkeeping
struct Link {
    conn: Connection,
    username: String,
    /// First recorded reason wins
    reason: Mutex<Option<String>>,
    notified: AtomicBool,
}

impl Link {
    fn record_reason(&self, reason: &str) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    /// Emit `Disconnected` unless it was already emitted for this link
    fn notify_once(&self, events: &ClientEvents) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = self
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| REASON_CONNECTION_LOST.to_string());
        info!("Disconnected: {}", reason);
        let _ = events.send(ClientEvent::Disconnected(reason));
    }
}

struct ClientInner {
    config: ClientConfig,
    events: ClientEvents,
    link: Mutex<Option<Arc<Link>>>,
}

impl ClientInner {
    fn current(&self) -> Option<Arc<Link>> {
        self.link.lock().clone()
    }

    /// Clear the slot if it still holds `link`
    fn release(&self, link: &Arc<Link>) {
        let mut slot = self.link.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, link)) {
            *slot = None;
        }
    }
}

/// The chat client engine
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    pub fn new(config: ClientConfig, events: ClientEvents) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                events,
                link: Mutex::new(None),
            }),
        }
    }

    /// Connect, negotiate and start receiving
    ///
    /// Input is validated before any network I/O. The connect and the whole
    /// handshake share one deadline; on any failure the socket is closed.
    pub async fn connect(&self, host: &str, port: u16, username: &str) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let host = host.trim();
        if host.is_empty() {
            return Err(ClientError::InvalidInput("Host is empty".to_string()));
        }
        if port == 0 {
            return Err(ClientError::InvalidInput(
                "Port must be in range 1..65535".to_string(),
            ));
        }
        let username = validate_username(username)?.to_string();

        let attempt = handshake(host, port, &username);
        let (conn, reader) = tokio::time::timeout(self.inner.config.handshake_timeout, attempt)
            .await
            .map_err(|_| ClientError::Timeout)??;

        let link = Arc::new(Link {
            conn,
            username,
            reason: Mutex::new(None),
            notified: AtomicBool::new(false),
        });

        let raced = {
            let mut slot = self.inner.link.lock();
            if slot.as_ref().is_some_and(|current| !current.conn.is_closed()) {
                true
            } else {
                *slot = Some(Arc::clone(&link));
                false
            }
        };
        if raced {
            link.conn.close().await;
            return Err(ClientError::AlreadyConnected);
        }

        info!("Connected to {}:{} as {}", host, port, link.username);
        tokio::spawn(receive_loop(Arc::clone(&self.inner), link, reader));
        Ok(())
    }

    /// Send one chat line; trailing newlines are stripped first
    pub async fn send(&self, text: &str) -> Result<(), ClientError> {
        let link = self
            .inner
            .current()
            .filter(|link| !link.conn.is_closed())
            .ok_or(ClientError::NotConnected)?;

        link.conn.send_line(text.trim_end_matches('\n')).await?;
        Ok(())
    }

    /// Close the connection with `reason`
    ///
    /// `Disconnected` fires at most once per connection, whichever of this
    /// call and the receive loop gets there first.
    pub async fn disconnect(&self, reason: &str) {
        let link = self.inner.link.lock().take();
        let Some(link) = link else {
            debug!("Disconnect requested while not connected");
            return;
        };

        link.record_reason(reason);
        link.conn.close().await;
        link.notify_once(&self.inner.events);
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .current()
            .is_some_and(|link| !link.conn.is_closed())
    }

    /// Username of the current connection
    pub fn username(&self) -> Option<String> {
        self.inner.current().map(|link| link.username.clone())
    }
}

/// Open the socket and run both handshake steps
async fn handshake(
    host: &str,
    port: u16,
    username: &str,
) -> Result<(Connection, LineReader), ClientError> {
    let stream = TcpStream::connect((host, port)).await?;
    let (reader, writer) = stream.into_split();
    let conn = Connection::new(writer);
    let mut reader = LineReader::new(reader, conn.subscribe_close());

    match negotiate(&conn, &mut reader, username).await {
        Ok(()) => Ok((conn, reader)),
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}

async fn negotiate(
    conn: &Connection,
    reader: &mut LineReader,
    username: &str,
) -> Result<(), ClientError> {
    conn.send_line(&make_hello(PROTOCOL_VERSION)).await?;

    let reply = reader.next_line().await?.ok_or(ClientError::ConnectionClosed)?;
    let reply = reply.trim();
    if reply.starts_with(MISMATCH_PREFIX) {
        return Err(match parse_protocol_mismatch(reply) {
            Some((server, client)) => HandshakeError::ProtocolMismatch { server, client }.into(),
            None => ClientError::InvalidHandshake,
        });
    }
    if let Some(code) = reply.strip_prefix(ERR_PREFIX) {
        return Err(rejection(code));
    }
    if reply != make_protocol_ok(PROTOCOL_VERSION) {
        return Err(ClientError::InvalidHandshake);
    }

    conn.send_line(username).await?;

    let reply = reader.next_line().await?.ok_or(ClientError::ConnectionClosed)?;
    let reply = reply.trim();
    if let Some(code) = reply.strip_prefix(ERR_PREFIX) {
        return Err(rejection(code));
    }
    if reply != OK {
        return Err(ClientError::InvalidHandshake);
    }
    Ok(())
}

fn rejection(code: &str) -> ClientError {
    let code = code.trim();
    match HandshakeError::from_code(code) {
        Some(e) => ClientError::Handshake(e),
        None => ClientError::Rejected(code.to_string()),
    }
}

/// Dispatch server lines until the connection ends
async fn receive_loop(inner: Arc<ClientInner>, link: Arc<Link>, mut reader: LineReader) {
    'read: loop {
        for line in reader.drain_lines() {
            match ServerLine::parse(&line) {
                ServerLine::Kick => {
                    link.record_reason(REASON_KICKED);
                    break 'read;
                }
                ServerLine::ServerClosed => {
                    link.record_reason(REASON_SERVER_CLOSED);
                    break 'read;
                }
                ServerLine::Clients(names) => {
                    let _ = inner.events.send(ClientEvent::Roster(names));
                }
                ServerLine::Ignored => {}
                ServerLine::Chat(text) => {
                    let _ = inner.events.send(ClientEvent::Line(text));
                }
            }
        }

        match reader.fill().await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                debug!("Receive failed: {}", e);
                break;
            }
        }
    }

    inner.release(&link);
    link.conn.close().await;
    drop(reader);
    link.notify_once(&inner.events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client() -> ChatClient {
        let (tx, _rx) = mpsc::unbounded_channel();
        ChatClient::new(ClientConfig::default(), tx)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = client();
        assert!(!client.is_connected());
        assert!(matches!(
            client.send("hi").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_input_validated_before_io() {
        let client = client();

        assert!(matches!(
            client.connect("", 55555, "alice").await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            client.connect("127.0.0.1", 0, "alice").await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            client.connect("127.0.0.1", 55555, "  ").await,
            Err(ClientError::Handshake(HandshakeError::UsernameEmpty))
        ));
        assert!(matches!(
            client.connect("127.0.0.1", 55555, "Server").await,
            Err(ClientError::Handshake(HandshakeError::UsernameReserved))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ChatClient::new(ClientConfig::default(), tx);

        client.disconnect("logged out").await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rejection_codes() {
        assert!(matches!(
            rejection("username_taken"),
            ClientError::Handshake(HandshakeError::UsernameTaken)
        ));
        assert!(matches!(
            rejection("bad_hello"),
            ClientError::Handshake(HandshakeError::BadHello)
        ));
        assert!(matches!(rejection("banned"), ClientError::Rejected(code) if code == "banned"));
    }
}
