//! Per-connection worker
//!
//! Runs the server side of the handshake for one accepted socket, relays
//! its chat lines while it is registered, and always finishes with the same
//! cleanup no matter how the connection ended.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::connection::{Connection, LineReader};
use crate::error::{HandshakeError, SessionError};
use crate::event::LogKind;
use crate::protocol::{
    make_protocol_ok, parse_hello, validate_username, OK, PROTOCOL_VERSION, SERVER_CLOSED,
};
use crate::registry::Session;
use crate::server::Shared;

/// Handle one accepted TCP connection until it closes
///
/// Errors never escape: they are logged and the connection is cleaned up.
pub(crate) async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let conn = Arc::new(Connection::new(writer));
    let mut reader = LineReader::new(reader, conn.subscribe_close()).with_shutdown(shutdown_rx);
    let mut username = None;

    if let Err(e) = serve(&shared, &conn, addr, &mut reader, &mut username).await {
        shared.log(LogKind::Error, format!("[!] client error {}: {}", addr, e));
    }

    // Cleanup
    shared.registry.remove(conn.id);
    conn.close().await;
    drop(reader);

    // Connections that never got admitted leave no trace in the roster
    if let Some(name) = username {
        if shared.is_running() {
            shared.broadcast(&format!("* {} left", name), None).await;
        }
        shared.emit_roster().await;
        shared.log(LogKind::Disconnect, format!("[-] {} disconnected", name));
    }
    debug!("Worker for {} finished", addr);
}

/// Handshake, then relay lines; `username` is set once the session is admitted
async fn serve(
    shared: &Shared,
    conn: &Arc<Connection>,
    addr: SocketAddr,
    reader: &mut LineReader,
    username: &mut Option<String>,
) -> Result<(), SessionError> {
    // Step 1: protocol version
    let Some(hello) = reader.next_line().await? else {
        debug!("{} closed before hello", addr);
        return Ok(());
    };
    let version = match parse_hello(hello.trim()) {
        Ok(version) => version,
        Err(e) => return reject(shared, conn, addr, e).await,
    };
    if version != PROTOCOL_VERSION {
        let err = HandshakeError::ProtocolMismatch {
            server: PROTOCOL_VERSION,
            client: version,
        };
        return reject(shared, conn, addr, err).await;
    }
    conn.send_line(&make_protocol_ok(PROTOCOL_VERSION)).await?;

    // Step 2: username
    let Some(requested) = reader.next_line().await? else {
        debug!("{} closed before username", addr);
        return Ok(());
    };
    let name = match validate_username(&requested) {
        Ok(name) => name.to_string(),
        Err(e) => return reject(shared, conn, addr, e).await,
    };
    // Admission and @OK go out together so no broadcast can precede the reply
    let session = Session::new(name.clone(), addr, Arc::clone(conn));
    if let Err(e) = conn
        .send_line_after(OK, || shared.registry.admit(session))
        .await?
    {
        return reject(shared, conn, addr, e).await;
    }
    *username = Some(name.clone());
    // Registered sessions end only through their own close, which stop()
    // issues after @SERVER_CLOSED
    reader.detach_shutdown();

    // Admitted after stop() drained the registry
    if !shared.is_running() {
        if shared.registry.remove(conn.id).is_some() {
            if let Err(e) = conn.send_control(SERVER_CLOSED).await {
                debug!("Could not notify {}: {}", addr, e);
            }
        }
        return Ok(());
    }

    shared.log(
        LogKind::Connect,
        format!("[+] {} connected from {}", name, addr),
    );
    shared.emit_roster().await;
    shared.broadcast(&format!("* {} joined", name), None).await;

    // Registered: relay until the peer goes away or we are closed
    loop {
        for line in reader.drain_lines() {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let message = format!("{}: {}", name, text);
            shared.log(LogKind::Chat, message.clone());
            shared.broadcast(&message, Some(conn.id)).await;
        }

        if !reader.fill().await? {
            break;
        }
    }

    Ok(())
}

/// Tell the peer why it is refused; the caller's cleanup closes the socket
async fn reject(
    shared: &Shared,
    conn: &Connection,
    addr: SocketAddr,
    err: HandshakeError,
) -> Result<(), SessionError> {
    if let Err(e) = conn.send_line(&err.reply_line()).await {
        debug!("Could not send rejection to {}: {}", addr, e);
    }
    shared.log(
        LogKind::Warn,
        format!("[!] Handshake rejected from {}: {}", addr, err),
    );
    Ok(())
}
