//! ChatServer engine
//!
//! Owns the listening socket, the accept loop and the session registry.
//! Each accepted connection gets its own worker task (see [`crate::handler`]);
//! workers and operator calls meet only at the registry and the event channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::codec::encode_line;
use crate::config::ServerConfig;
use crate::connection::{wait_for_close, Connection};
use crate::error::ServerError;
use crate::event::{emit_log, LogKind, ServerEvent, ServerEvents};
use crate::handler::handle_connection;
use crate::protocol::{make_clients_line, KICK, SERVER_CLOSED};
use crate::registry::Registry;
use crate::types::{ConnectionId, Roster};

/// Upper bound on one accept wait, so the loop notices shutdown promptly
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Listen backlog
const BACKLOG: u32 = 1024;

/// Prefix for operator announcements
pub const ANNOUNCE_PREFIX: &str = "SERVER: ";

/// State of one start..stop cycle
struct RunState {
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
    started_at: Instant,
}

/// State shared between the engine handle, the accept loop and workers
pub(crate) struct Shared {
    config: ServerConfig,
    pub(crate) registry: Registry,
    events: ServerEvents,
    running: AtomicBool,
    run: Mutex<Option<RunState>>,
    /// Serialises start and stop
    lifecycle: tokio::sync::Mutex<()>,
}

/// The chat server engine
///
/// Cheap to clone; every clone drives the same server instance.
#[derive(Clone)]
pub struct ChatServer {
    shared: Arc<Shared>,
}

impl ChatServer {
    /// Create a stopped server that reports to `events`
    pub fn new(config: ServerConfig, events: ServerEvents) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                events,
                running: AtomicBool::new(false),
                run: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Bind, listen and spawn the accept loop
    ///
    /// Returns the bound address. Calling this while running does nothing
    /// and returns the current address. On a bind failure nothing stays open,
    /// the engine stays stopped and one roster event is still emitted.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let _lifecycle = self.shared.lifecycle.lock().await;

        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                let text = match &e {
                    ServerError::AddrInUse { port } => {
                        format!("[!] Port {} is already in use (server not started).", port)
                    }
                    other => format!("[!] {}", other),
                };
                emit_log(&self.shared.events, LogKind::Error, text);
                self.shared.emit_roster().await;
                return Err(e);
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                drop(listener);
                emit_log(
                    &self.shared.events,
                    LogKind::Error,
                    format!("[!] Server failed to start: {}", e),
                );
                self.shared.emit_roster().await;
                return Err(ServerError::Bind(e));
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shared.running.store(true, Ordering::SeqCst);
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            shutdown_rx,
        ));

        *self.shared.run.lock() = Some(RunState {
            shutdown_tx,
            accept_task,
            local_addr,
            started_at: Instant::now(),
        });

        emit_log(
            &self.shared.events,
            LogKind::Info,
            format!("Chat relay running on {}", local_addr),
        );
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let ServerConfig { host, port } = &self.shared.config;
        let target = format!("{}:{}", host, port);

        let addr = lookup_host(target.as_str())
            .await
            .map_err(|_| ServerError::Resolve(target.clone()))?
            .next()
            .ok_or_else(|| ServerError::Resolve(target.clone()))?;

        let classify = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ServerError::AddrInUse { port: *port }
            } else {
                ServerError::Bind(e)
            }
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ServerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ServerError::Bind)?;
        socket.bind(addr).map_err(classify)?;
        socket.listen(BACKLOG).map_err(classify)
    }

    /// Shut the server down
    ///
    /// Returns `false` (and only logs) when it was not running. Otherwise the
    /// listener is closed, every session is told `@SERVER_CLOSED`, all
    /// connections are closed and the registry ends up empty.
    ///
    /// The shutdown signal reaches the accept loop and connections still in
    /// their handshake; admitted sessions wait for the notice and the close.
    pub async fn stop(&self) -> bool {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let run = self.shared.run.lock().take();
        let Some(run) = run else {
            emit_log(&self.shared.events, LogKind::Info, "Server is not running".to_string());
            return false;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        run.shutdown_tx.send_replace(true);
        if let Err(e) = run.accept_task.await {
            error!("Accept loop task failed: {}", e);
        }

        let sessions = self.shared.registry.drain();
        info!("Stopping with {} active sessions", sessions.len());

        join_all(sessions.iter().map(|s| async move {
            if let Err(e) = s.conn.send_control(SERVER_CLOSED).await {
                debug!("Could not notify {}: {}", s.username, e);
            }
        }))
        .await;
        join_all(sessions.iter().map(|s| s.conn.close())).await;

        self.shared.emit_roster().await;
        emit_log(&self.shared.events, LogKind::Warn, "Server stopped".to_string());
        true
    }

    /// Disconnect the session with exactly this username
    ///
    /// The session leaves the registry before anything is written to it.
    pub async fn kick(&self, username: &str) -> Result<(), ServerError> {
        let session = self
            .shared
            .registry
            .remove_by_username(username)
            .ok_or_else(|| ServerError::UserNotFound(username.to_string()))?;

        if let Err(e) = session.conn.send_control(KICK).await {
            debug!("Could not send kick to {}: {}", username, e);
        }
        session.conn.close().await;

        emit_log(
            &self.shared.events,
            LogKind::Warn,
            format!("[!] {} kicked", username),
        );
        self.shared.emit_roster().await;
        Ok(())
    }

    /// Broadcast an operator message as `SERVER: <text>`
    ///
    /// Returns `false` for empty text or a stopped server.
    pub async fn announce(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || !self.is_running() {
            return false;
        }

        let line = format!("{}{}", ANNOUNCE_PREFIX, text);
        self.shared.broadcast(&line, None).await;
        emit_log(&self.shared.events, LogKind::Chat, line);
        true
    }

    /// Send a raw line to every session except `exclude`
    pub async fn broadcast(&self, line: &str, exclude: Option<ConnectionId>) {
        self.shared.broadcast(line, exclude).await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.run.lock().as_ref().map(|run| run.local_addr)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.shared.run.lock().as_ref().map(|run| run.started_at)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at().map(|t| t.elapsed())
    }

    /// Current roster, sorted by username
    pub fn roster(&self) -> Roster {
        self.shared.registry.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn log(&self, kind: LogKind, text: String) {
        emit_log(&self.events, kind, text);
    }

    /// Send `line` to every registered connection but `exclude`, then drop
    /// the ones that failed and announce the new roster once.
    pub(crate) async fn broadcast(&self, line: &str, exclude: Option<ConnectionId>) {
        let dead = self.fan_out(line, exclude).await;
        if !dead.is_empty() {
            self.drop_connections(&dead).await;
            self.emit_roster().await;
        }
    }

    /// Report the roster to the observer and push `@CLIENTS` to every session
    ///
    /// Dead connections found here are dropped without another roster pass.
    pub(crate) async fn emit_roster(&self) {
        let roster = self.registry.snapshot();
        let names: Vec<&str> = roster.iter().map(|e| e.username.as_str()).collect();

        let line = match make_clients_line(&names) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode roster: {}", e);
                let _ = self.events.send(ServerEvent::Roster(roster));
                return;
            }
        };
        let _ = self.events.send(ServerEvent::Roster(roster));

        let dead = self.fan_out(&line, None).await;
        if !dead.is_empty() {
            self.drop_connections(&dead).await;
        }
    }

    /// One concurrent send pass over a registry snapshot; returns failures
    async fn fan_out(&self, line: &str, exclude: Option<ConnectionId>) -> Vec<Arc<Connection>> {
        let targets: Vec<Arc<Connection>> = self
            .registry
            .connections()
            .into_iter()
            .filter(|conn| Some(conn.id) != exclude)
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let frame = encode_line(line);
        let results = join_all(targets.iter().map(|conn| conn.send_frame(&frame))).await;

        targets
            .into_iter()
            .zip(results)
            .filter_map(|(conn, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    debug!("Send to {} failed: {}", conn.id, e);
                    Some(conn)
                }
            })
            .collect()
    }

    async fn drop_connections(&self, dead: &[Arc<Connection>]) {
        let ids: Vec<ConnectionId> = dead.iter().map(|conn| conn.id).collect();
        let removed = self.registry.remove_all(&ids);
        debug!("Dropped {} dead connections", removed);
        join_all(dead.iter().map(|conn| conn.close())).await;
    }
}

/// Accept connections until shutdown, one worker task per connection
async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let worker_shutdown = shutdown_rx.clone();

    while shared.is_running() {
        tokio::select! {
            _ = wait_for_close(&mut shutdown_rx) => break,
            accepted = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()) => {
                match accepted {
                    Err(_) => continue,
                    Ok(Ok((stream, addr))) => {
                        debug!("New connection from {}", addr);
                        tokio::spawn(handle_connection(
                            Arc::clone(&shared),
                            stream,
                            addr,
                            worker_shutdown.clone(),
                        ));
                    }
                    Ok(Err(e)) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    debug!("Accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Session;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    fn local_server() -> (ChatServer, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChatServer::new(ServerConfig::new("127.0.0.1", 0), tx), rx)
    }

    /// A registrable session plus the remote end of its socket
    async fn session(username: &str) -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, remote) = accepted.unwrap();
        let (_read, write) = stream.into_split();
        let conn = Arc::new(Connection::new(write));
        (Session::new(username.to_string(), remote, conn), peer.unwrap())
    }

    fn rosters(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<Vec<String>> {
        let mut rosters = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::Roster(roster) = event {
                rosters.push(roster.into_iter().map(|e| e.username).collect());
            }
        }
        rosters
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_connections_in_one_pass() {
        let (server, mut rx) = local_server();
        let (alice, alice_peer) = session("alice").await;
        let (bob, _bob_peer) = session("bob").await;
        let (carol, _carol_peer) = session("carol").await;
        bob.conn.close().await;
        carol.conn.close().await;
        for s in [alice, bob, carol] {
            server.shared.registry.admit(s).unwrap();
        }

        server.broadcast("hello", None).await;

        assert_eq!(server.session_count(), 1);
        assert_eq!(rosters(&mut rx), vec![vec!["alice".to_string()]]);

        let mut lines = BufReader::new(alice_peer).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("@CLIENTS [\"alice\"]")
        );
    }

    #[tokio::test]
    async fn test_broadcast_without_failures_keeps_roster_quiet() {
        let (server, mut rx) = local_server();
        let (alice, _alice_peer) = session("alice").await;
        server.shared.registry.admit(alice).unwrap();

        server.broadcast("hello", None).await;

        assert_eq!(server.session_count(), 1);
        assert!(rosters(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_roster_push_failure_does_not_recurse() {
        let (server, mut rx) = local_server();
        let (alice, _alice_peer) = session("alice").await;
        let (bob, _bob_peer) = session("bob").await;
        bob.conn.close().await;
        server.shared.registry.admit(alice).unwrap();
        server.shared.registry.admit(bob).unwrap();

        server.shared.emit_roster().await;

        // The failed @CLIENTS push removes bob without a second roster event
        assert_eq!(server.session_count(), 1);
        assert_eq!(
            rosters(&mut rx),
            vec![vec!["alice".to_string(), "bob".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (server, _rx) = local_server();
        assert!(!server.is_running());
        assert!(server.uptime().is_none());

        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.started_at().is_some());

        // second start is a no-op
        assert_eq!(server.start().await.unwrap(), addr);

        assert!(server.stop().await);
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert!(server.roster().is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let (server, mut rx) = local_server();
        assert!(!server.stop().await);

        match rx.try_recv().unwrap() {
            ServerEvent::Log { kind, text } => {
                assert_eq!(kind, LogKind::Info);
                assert_eq!(text, "Server is not running");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kick_unknown_user() {
        let (server, _rx) = local_server();
        server.start().await.unwrap();

        let err = server.kick("nobody").await.unwrap_err();
        assert!(matches!(err, ServerError::UserNotFound(name) if name == "nobody"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_announce_requires_running_server() {
        let (server, _rx) = local_server();
        assert!(!server.announce("hello").await);

        server.start().await.unwrap();
        assert!(!server.announce("   ").await);
        assert!(server.announce("hello").await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (server, _rx) = local_server();
        server.start().await.unwrap();
        server.stop().await;

        server.start().await.unwrap();
        assert!(server.is_running());
        server.stop().await;
    }
}
