//! Write side of one TCP connection
//!
//! The reading half stays with whichever task owns the pending buffer; this
//! struct owns the writing half and a close signal the reader listens to.
//! Closing is idempotent, so a kick and a failing reader can race safely.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::codec::{encode_line, LineBuffer};
use crate::error::SendError;
use crate::types::ConnectionId;

/// Upper bound on one best-effort control line such as `@KICK`
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared handle used to write lines to a peer and to force it closed
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    /// Write one encoded line
    ///
    /// Lines from concurrent callers never interleave.
    pub async fn send_line(&self, line: &str) -> Result<(), SendError> {
        self.send_frame(&encode_line(line)).await
    }

    /// Write an already encoded frame
    ///
    /// A write still blocked on the peer when `close` is called is abandoned.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), SendError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(SendError::Closed)?;
        write_unless_closed(stream, frame, self.close_tx.subscribe()).await
    }

    /// Write a control line, giving up after [`CONTROL_SEND_TIMEOUT`]
    pub async fn send_control(&self, line: &str) -> Result<(), SendError> {
        tokio::time::timeout(CONTROL_SEND_TIMEOUT, self.send_line(line))
            .await
            .map_err(|_| SendError::Timeout)?
    }

    /// Run `commit` and, if it succeeds, write `line` before any other sender
    /// can reach this connection
    pub async fn send_line_after<E>(
        &self,
        line: &str,
        commit: impl FnOnce() -> Result<(), E>,
    ) -> Result<Result<(), E>, SendError> {
        let mut writer = self.writer.lock().await;
        if let Err(e) = commit() {
            return Ok(Err(e));
        }
        let stream = writer.as_mut().ok_or(SendError::Closed)?;
        write_unless_closed(stream, &encode_line(line), self.close_tx.subscribe()).await?;
        Ok(Ok(()))
    }

    /// Shut down and drop the socket; later calls are no-ops
    ///
    /// Never waits on a stalled peer: the close signal aborts any pending
    /// write before the writer is taken.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_tx.send_replace(true);

        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.id, e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` once `close` has been called
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

async fn write_unless_closed(
    stream: &mut OwnedWriteHalf,
    frame: &[u8],
    mut close_rx: watch::Receiver<bool>,
) -> Result<(), SendError> {
    tokio::select! {
        written = stream.write_all(frame) => Ok(written?),
        _ = wait_for_close(&mut close_rx) => Err(SendError::Closed),
    }
}

/// Bytes requested per read
const READ_CHUNK: usize = 1024;

/// Read side of one TCP connection plus its pending buffer
///
/// Reads end early when the paired [`Connection`] is closed or, while a
/// shutdown receiver is attached, when the server shuts down.
#[derive(Debug)]
pub struct LineReader {
    reader: OwnedReadHalf,
    pending: LineBuffer,
    close_rx: watch::Receiver<bool>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl LineReader {
    pub fn new(reader: OwnedReadHalf, close_rx: watch::Receiver<bool>) -> Self {
        Self {
            reader,
            pending: LineBuffer::new(),
            close_rx,
            shutdown_rx: None,
        }
    }

    /// Also stop reading once `shutdown_rx` flips to `true`
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Stop listening for server shutdown; only a local close ends reads now
    pub fn detach_shutdown(&mut self) {
        self.shutdown_rx = None;
    }

    /// Read one chunk into the pending buffer
    ///
    /// Returns `false` on end of stream or local close.
    pub async fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let shutdown = &mut self.shutdown_rx;

        let n = tokio::select! {
            read = self.reader.read(&mut chunk) => read?,
            _ = wait_for_close(&mut self.close_rx) => return Ok(false),
            _ = wait_for_shutdown(shutdown) => return Ok(false),
        };
        if n == 0 {
            return Ok(false);
        }

        self.pending.extend(&chunk[..n]);
        Ok(true)
    }

    /// Next complete line, reading as needed; `None` once the stream ends
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.pending.next_line() {
                return Ok(Some(line));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Every complete line already buffered
    pub fn drain_lines(&mut self) -> Vec<String> {
        self.pending.drain_lines()
    }
}

async fn wait_for_shutdown(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => wait_for_close(rx).await,
        None => std::future::pending().await,
    }
}

/// Resolve once the flag is `true` or its sender is gone
pub async fn wait_for_close(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_read, write) = client.unwrap().into_split();
        (Connection::new(write), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_send_line_is_framed() {
        let (conn, mut peer) = pair().await;
        conn.send_line("hello").await.unwrap();

        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn test_reader_yields_lines_then_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (read, write) = accepted.unwrap().0.into_split();
        let conn = Connection::new(write);
        let mut reader = LineReader::new(read, conn.subscribe_close());

        let mut client = client.unwrap();
        client.write_all(b"HELLO 1\nali").await.unwrap();
        client.write_all(b"ce\n").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("HELLO 1"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("alice"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_stops_on_local_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (read, write) = accepted.unwrap().0.into_split();
        let conn = Connection::new(write);
        let mut reader = LineReader::new(read, conn.subscribe_close());

        conn.close().await;
        let filled = tokio::time::timeout(Duration::from_secs(1), reader.fill())
            .await
            .unwrap()
            .unwrap();
        assert!(!filled);
    }

    #[tokio::test]
    async fn test_send_line_after_skips_write_on_failed_commit() {
        let (conn, mut peer) = pair().await;

        let refused = conn.send_line_after("@OK", || Err("taken")).await.unwrap();
        assert_eq!(refused, Err("taken"));
        let accepted = conn.send_line_after("@OK", || Ok::<(), ()>(())).await.unwrap();
        assert_eq!(accepted, Ok(()));

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"@OK\n");
    }

    #[tokio::test]
    async fn test_detached_reader_ignores_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (read, write) = accepted.unwrap().0.into_split();
        let conn = Connection::new(write);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut reader = LineReader::new(read, conn.subscribe_close()).with_shutdown(shutdown_rx);

        reader.detach_shutdown();
        shutdown_tx.send_replace(true);
        let pending = tokio::time::timeout(Duration::from_millis(200), reader.fill()).await;
        assert!(pending.is_err());

        let mut client = client.unwrap();
        client.write_all(b"still here\n").await.unwrap();
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("still here")
        );
    }

    #[tokio::test]
    async fn test_attached_reader_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (read, write) = accepted.unwrap().0.into_split();
        let conn = Connection::new(write);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut reader = LineReader::new(read, conn.subscribe_close()).with_shutdown(shutdown_rx);

        shutdown_tx.send_replace(true);
        let filled = tokio::time::timeout(Duration::from_secs(1), reader.fill())
            .await
            .unwrap()
            .unwrap();
        assert!(!filled);
    }

    #[tokio::test]
    async fn test_close_aborts_stalled_write() {
        let (conn, _peer) = pair().await;
        let conn = Arc::new(conn);

        // The peer never reads, so this write fills both socket buffers
        let big = vec![b'x'; 64 * 1024 * 1024];
        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send_frame(&big).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(1), conn.close())
            .await
            .expect("close waited on a stalled write");
        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn test_control_send_is_bounded() {
        let (conn, _peer) = pair().await;
        let conn = Arc::new(conn);

        let big = vec![b'x'; 64 * 1024 * 1024];
        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send_frame(&big).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        assert!(matches!(
            conn.send_control("@KICK").await,
            Err(SendError::Timeout)
        ));
        assert!(started.elapsed() < CONTROL_SEND_TIMEOUT * 3);

        conn.close().await;
        let _ = writer.await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut peer) = pair().await;
        let mut rx = conn.subscribe_close();

        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(matches!(conn.send_line("late").await, Err(SendError::Closed)));
        tokio::time::timeout(Duration::from_secs(1), wait_for_close(&mut rx))
            .await
            .unwrap();

        let mut buf = Vec::new();
        let n = peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
