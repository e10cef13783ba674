//! Per-socket protocol engine shared by every connection role.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐   Message    ┌──────────────┐
//!  socket ──▶│ reader task  │─────────────▶│ worker task  │──▶ Dispatcher::dispatch
//!            │ lines + raw  │   (mpsc)     │ hold-aware   │
//!            └──────┬───────┘              └──────────────┘
//!                   │ raw bytes (oneshot)
//!                   ▼
//!            request_bytes(n) caller
//! ```
//!
//! The reader turns complete lines into [`Message`]s and queues them for the
//! worker, which hands them to the role's [`Dispatcher`] strictly in arrival
//! order. A handler that expects raw file content registers a byte request
//! with [`Connection::request_bytes`] before sending the `ACK` that lets the
//! peer start streaming. The reader peeks for the next byte without consuming
//! it and serves a pending byte request before attempting to read a line, so
//! the raw payload is never mistaken for protocol text.

use crate::error::{NetworkError, Result};
use crate::network::ack::AckTracker;
use crate::network::protocol::Message;
use crate::types::{ConnectionId, StorePort};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Role-specific behaviour plugged into a [`Connection`].
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Handle one message. Errors are logged and the connection stays open.
    async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) -> Result<()>;

    /// Whether this role handles the given message kind at all. Rejected
    /// messages are logged and discarded by the reader.
    fn accepts(&self, _msg: &Message) -> bool {
        true
    }

    /// Whether the worker keeps running while the queue hold is raised.
    fn bypasses_hold(&self, _conn: &Connection) -> bool {
        false
    }

    /// Runs once before the reader starts.
    async fn connected(&self, _conn: &Arc<Connection>) -> Result<()> {
        Ok(())
    }

    /// Runs once after the stream ended, before the worker is stopped.
    async fn disconnected(&self, _conn: &Arc<Connection>) {}
}

enum Inbound {
    Message(Message),
    Stop,
}

struct RawRequest {
    len: usize,
    tx: oneshot::Sender<Bytes>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live protocol connection.
pub struct Connection {
    id: ConnectionId,

    /// Peer label used in logs.
    peer: String,

    /// Exclusive access for both line and raw writes.
    writer: tokio::sync::Mutex<BoxedWriter>,

    /// At most one outstanding raw byte request.
    raw_request: Mutex<Option<RawRequest>>,

    /// At most one outstanding acknowledgement wait.
    acks: AckTracker,

    /// Port announced with `JOIN`, set only on storage-node links.
    store_port: Mutex<Option<StorePort>>,

    /// Cancelled when the stream ends or the connection is closed.
    closed: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("store_port", &*self.store_port.lock())
            .finish()
    }
}

impl Connection {
    /// Start the reader and worker tasks for `stream`.
    ///
    /// `hold` is the queue-hold signal; the worker suspends between messages
    /// while it reads `true` unless the dispatcher exempts this connection.
    pub fn spawn<S>(
        stream: S,
        peer: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
        hold: watch::Receiver<bool>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            raw_request: Mutex::new(None),
            acks: AckTracker::new(),
            store_port: Mutex::new(None),
            closed: CancellationToken::new(),
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_worker(
            conn.clone(),
            dispatcher.clone(),
            queue_rx,
            hold,
        ));

        let reader_conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.connected(&reader_conn).await {
                warn!(conn = %reader_conn.id, peer = %reader_conn.peer, error = %e, "Connection setup failed");
                reader_conn.closed.cancel();
            } else {
                reader_conn
                    .run_reader(BufReader::new(read_half), &*dispatcher, &queue_tx)
                    .await;
            }
            dispatcher.disconnected(&reader_conn).await;
            let _ = queue_tx.send(Inbound::Stop);
        });

        conn
    }

    /// Open a TCP connection to `addr` and spawn its tasks.
    pub async fn connect(
        addr: SocketAddr,
        dispatcher: Arc<dyn Dispatcher>,
        hold: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::spawn(stream, addr.to_string(), dispatcher, hold))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Acknowledgement tracker of this connection.
    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }

    /// Mark this connection as the link of the storage node serving on `port`.
    pub fn set_store_port(&self, port: StorePort) {
        *self.store_port.lock() = Some(port);
    }

    /// Port of the storage node on the other end, if it joined.
    pub fn store_port(&self) -> Option<StorePort> {
        *self.store_port.lock()
    }

    /// Send one protocol message.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let line = format!("{msg}\n");
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(NetworkError::Io)?;
        writer.flush().await.map_err(NetworkError::Io)?;
        debug!(conn = %self.id, peer = %self.peer, "< {msg}");
        Ok(())
    }

    /// Send raw bytes, typically file content.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.map_err(NetworkError::Io)?;
        writer.flush().await.map_err(NetworkError::Io)?;
        debug!(conn = %self.id, peer = %self.peer, len = data.len(), "< raw bytes");
        Ok(())
    }

    /// Register a request for the next `len` raw bytes of the stream.
    ///
    /// Must be called before the message that licenses the peer to stream.
    /// Fails immediately if another request is still pending.
    pub fn request_bytes(&self, len: usize) -> Result<oneshot::Receiver<Bytes>> {
        let (tx, rx) = oneshot::channel();
        if len == 0 {
            let _ = tx.send(Bytes::new());
            return Ok(rx);
        }

        let mut slot = self.raw_request.lock();
        if slot.as_ref().is_some_and(|req| !req.tx.is_closed()) {
            return Err(NetworkError::RawReadPending.into());
        }
        *slot = Some(RawRequest { len, tx });
        Ok(rx)
    }

    /// Drop a byte request whose caller stopped waiting.
    pub fn cancel_bytes_request(&self) {
        self.raw_request.lock().take();
    }

    /// Close the connection. The disconnect hook runs once the reader stops.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn run_reader<R>(
        self: &Arc<Self>,
        mut reader: BufReader<R>,
        dispatcher: &dyn Dispatcher,
        queue: &mpsc::UnboundedSender<Inbound>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut line = Vec::new();
        loop {
            let more = tokio::select! {
                _ = self.closed.cancelled() => false,
                res = reader.fill_buf() => match res {
                    Ok(buf) => !buf.is_empty(),
                    Err(e) => {
                        debug!(conn = %self.id, error = %e, "Read failed");
                        false
                    }
                },
            };
            if !more {
                break;
            }

            let pending = self.raw_request.lock().take();
            if let Some(req) = pending {
                let mut data = vec![0u8; req.len];
                if let Err(e) = reader.read_exact(&mut data).await {
                    debug!(conn = %self.id, error = %e, "Stream ended during raw read");
                    break;
                }
                trace!(conn = %self.id, len = req.len, "> raw bytes");
                if req.tx.send(Bytes::from(data)).is_err() {
                    warn!(conn = %self.id, "Raw bytes arrived after the waiter gave up");
                }
                continue;
            }

            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "Read failed");
                    break;
                }
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(&['\r', '\n'][..]);
            debug!(conn = %self.id, peer = %self.peer, "> {text}");

            match Message::parse(text) {
                Ok(msg) if dispatcher.accepts(&msg) => {
                    if queue.send(Inbound::Message(msg)).is_err() {
                        break;
                    }
                }
                Ok(msg) => {
                    warn!(conn = %self.id, kind = msg.kind(), "Unexpected message on this connection, discarding");
                }
                Err(e) => {
                    warn!(conn = %self.id, error = %e, line = text, "Unparsable message, discarding");
                }
            }
        }

        self.closed.cancel();
        debug!(conn = %self.id, peer = %self.peer, "Connection closed");
    }

    async fn run_worker(
        conn: Arc<Self>,
        dispatcher: Arc<dyn Dispatcher>,
        mut queue: mpsc::UnboundedReceiver<Inbound>,
        mut hold: watch::Receiver<bool>,
    ) {
        while let Some(item) = queue.recv().await {
            let msg = match item {
                Inbound::Message(msg) => msg,
                Inbound::Stop => break,
            };

            if !dispatcher.bypasses_hold(&conn) && *hold.borrow() {
                trace!(conn = %conn.id, "Queue held, pausing");
                // A dropped sender means no hold can ever be raised again.
                let _ = hold.wait_for(|held| !*held).await;
                trace!(conn = %conn.id, "Queue released, resuming");
            }

            let kind = msg.kind();
            if let Err(e) = dispatcher.dispatch(&conn, msg).await {
                warn!(conn = %conn.id, peer = %conn.peer, kind, error = %e, "Failed to handle message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, DuplexStream};

    /// Records every dispatched message.
    struct Recorder {
        tx: mpsc::UnboundedSender<Message>,
        exempt: bool,
        disconnects: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, _conn: &Arc<Connection>, msg: Message) -> Result<()> {
            let _ = self.tx.send(msg);
            Ok(())
        }

        fn accepts(&self, msg: &Message) -> bool {
            !matches!(msg, Message::StoreComplete)
        }

        fn bypasses_hold(&self, _conn: &Connection) -> bool {
            self.exempt
        }

        async fn disconnected(&self, _conn: &Arc<Connection>) {
            let _ = self.disconnects.send(());
        }
    }

    struct Harness {
        conn: Arc<Connection>,
        peer: DuplexStream,
        messages: mpsc::UnboundedReceiver<Message>,
        disconnects: mpsc::UnboundedReceiver<()>,
    }

    fn harness(exempt: bool, hold: watch::Receiver<bool>) -> Harness {
        let (local, peer) = duplex(64 * 1024);
        let (tx, messages) = mpsc::unbounded_channel();
        let (dtx, disconnects) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Recorder {
            tx,
            exempt,
            disconnects: dtx,
        });
        let conn = Connection::spawn(local, "test-peer", dispatcher, hold);
        Harness {
            conn,
            peer,
            messages,
            disconnects,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_dispatches_lines_in_order() {
        let (_hold_tx, hold) = watch::channel(false);
        let mut h = harness(false, hold);

        h.peer
            .write_all(b"LIST\nGARBAGE 1\nSTORE_COMPLETE\nREMOVE a.txt\n")
            .await
            .unwrap();

        assert_eq!(next(&mut h.messages).await, Some(Message::List(vec![])));
        assert_eq!(
            next(&mut h.messages).await,
            Some(Message::Remove {
                name: "a.txt".into()
            })
        );
    }

    #[tokio::test]
    async fn test_raw_bytes_are_not_parsed_as_lines() {
        let (_hold_tx, hold) = watch::channel(false);
        let mut h = harness(false, hold);

        let rx = h.conn.request_bytes(11).unwrap();
        h.peer.write_all(b"LIST x\nACK\nREMOVE b\n").await.unwrap();

        let bytes = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&bytes[..], b"LIST x\nACK\n");
        assert_eq!(
            next(&mut h.messages).await,
            Some(Message::Remove { name: "b".into() })
        );
    }

    #[tokio::test]
    async fn test_second_byte_request_fails_immediately() {
        let (_hold_tx, hold) = watch::channel(false);
        let h = harness(false, hold);

        let _first = h.conn.request_bytes(4).unwrap();
        let second = h.conn.request_bytes(4);
        assert!(matches!(
            second,
            Err(Error::Network(NetworkError::RawReadPending))
        ));

        h.conn.cancel_bytes_request();
        assert!(h.conn.request_bytes(4).is_ok());
    }

    #[tokio::test]
    async fn test_zero_length_request_completes_immediately() {
        let (_hold_tx, hold) = watch::channel(false);
        let h = harness(false, hold);

        let rx = h.conn.request_bytes(0).unwrap();
        assert!(rx.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hold_pauses_worker_but_keeps_queueing() {
        let (hold_tx, hold) = watch::channel(true);
        let mut h = harness(false, hold);

        h.peer.write_all(b"LOAD a\nLOAD b\n").await.unwrap();
        assert_eq!(next(&mut h.messages).await, None);

        hold_tx.send(false).unwrap();
        assert_eq!(
            next(&mut h.messages).await,
            Some(Message::Load { name: "a".into() })
        );
        assert_eq!(
            next(&mut h.messages).await,
            Some(Message::Load { name: "b".into() })
        );
    }

    #[tokio::test]
    async fn test_exempt_connection_ignores_hold() {
        let (_hold_tx, hold) = watch::channel(true);
        let mut h = harness(true, hold);

        h.peer.write_all(b"STORE_ACK f\n").await.unwrap();
        assert_eq!(
            next(&mut h.messages).await,
            Some(Message::StoreAck { name: "f".into() })
        );
    }

    #[tokio::test]
    async fn test_send_writes_terminated_line() {
        let (_hold_tx, hold) = watch::channel(false);
        let h = harness(false, hold);

        h.conn
            .send(&Message::LoadFrom {
                port: 4001,
                size: 12,
            })
            .await
            .unwrap();
        h.conn.send_bytes(b"raw").await.unwrap();

        let mut reader = BufReader::new(h.peer);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "LOAD_FROM 4001 12\n");

        let mut raw = [0u8; 3];
        reader.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"raw");
    }

    #[tokio::test]
    async fn test_disconnect_runs_hook_once() {
        let (_hold_tx, hold) = watch::channel(false);
        let mut h = harness(false, hold);

        drop(h.peer);
        tokio::time::timeout(Duration::from_secs(1), h.disconnects.recv())
            .await
            .unwrap()
            .unwrap();
        h.conn.closed().await;
        assert!(h.conn.is_closed());
        assert!(h.disconnects.try_recv().is_err());
    }
}
