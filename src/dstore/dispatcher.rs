//! Message handling on a storage node.
//!
//! A storage node speaks on two kinds of link:
//!
//! - inbound connections from clients and peers, handled by [`PeerDispatcher`]
//!   (`STORE`, `LOAD_DATA`, `REBALANCE_STORE`);
//! - its single outbound link to the controller, handled by
//!   [`ControllerLinkDispatcher`] (`REMOVE`, `LIST`, `REBALANCE`).

use crate::dstore::storage::FileStore;
use crate::error::{Error, NetworkError, Result, StorageError};
use crate::network::{Connection, Dispatcher, Message};
use crate::rebalancing::RebalanceExecutor;
use crate::types::StorePort;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by every link of one storage node.
pub struct StoreContext {
    port: StorePort,
    timeout: Duration,
    store: Arc<dyn FileStore>,
    executor: Arc<RebalanceExecutor>,
    controller: OnceLock<Arc<Connection>>,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("controller_linked", &self.controller.get().is_some())
            .finish()
    }
}

impl StoreContext {
    pub fn new(port: StorePort, timeout: Duration, store: Arc<dyn FileStore>) -> Arc<Self> {
        Arc::new(Self {
            port,
            timeout,
            executor: Arc::new(RebalanceExecutor::new(store.clone(), timeout)),
            store,
            controller: OnceLock::new(),
        })
    }

    pub fn port(&self) -> StorePort {
        self.port
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    async fn notify_controller(&self, msg: &Message) -> Result<()> {
        match self.controller.get() {
            Some(controller) => controller.send(msg).await,
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    /// Accept `size` raw bytes from `conn`: register the read, license the
    /// peer with `ACK`, then wait for the payload within the timeout.
    async fn receive_file(&self, conn: &Arc<Connection>, name: &str, size: u64) -> Result<Bytes> {
        let len = usize::try_from(size)
            .map_err(|_| Error::Internal(format!("file size {size} does not fit in memory")))?;

        let rx = conn.request_bytes(len).inspect_err(|_| {
            warn!(conn = %conn.id(), file = name, "Another operation is waiting on bytes, refusing");
        })?;

        if let Err(e) = conn.send(&Message::Ack).await {
            conn.cancel_bytes_request();
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(NetworkError::ConnectionClosed.into()),
            Err(_) => {
                conn.cancel_bytes_request();
                error!(conn = %conn.id(), file = name, size, "Timed out waiting for file content");
                Err(Error::Timeout)
            }
        }
    }
}

/// Handles clients and peers connecting to the storage node.
#[derive(Debug)]
pub struct PeerDispatcher {
    ctx: Arc<StoreContext>,
}

impl PeerDispatcher {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Dispatcher for PeerDispatcher {
    async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        match msg {
            Message::Store { name, size } => {
                let data = self.ctx.receive_file(conn, &name, size).await?;
                self.ctx.store.write(&name, &data).await?;
                info!(file = %name, size, "Stored file");
                self.ctx
                    .notify_controller(&Message::StoreAck { name })
                    .await
            }
            Message::RebalanceStore { name, size } => {
                let data = self.ctx.receive_file(conn, &name, size).await?;
                self.ctx.store.write(&name, &data).await?;
                info!(file = %name, size, peer = conn.peer(), "Received file from peer");
                Ok(())
            }
            Message::LoadData { name } => match self.ctx.store.read(&name).await {
                Ok(data) => {
                    debug!(file = %name, len = data.len(), "Serving file");
                    conn.send_bytes(&data).await
                }
                Err(StorageError::NotFound(_)) => {
                    warn!(file = %name, "Requested file is not stored here");
                    conn.send(&Message::ErrorFileDoesNotExist).await
                }
                Err(e) => Err(e.into()),
            },
            other => {
                warn!(kind = other.kind(), "Unhandled message on peer link");
                Ok(())
            }
        }
    }

    fn accepts(&self, msg: &Message) -> bool {
        matches!(
            msg,
            Message::Store { .. } | Message::RebalanceStore { .. } | Message::LoadData { .. }
        )
    }
}

/// Handles the storage node's link to the controller.
#[derive(Debug)]
pub struct ControllerLinkDispatcher {
    ctx: Arc<StoreContext>,
    /// Cancelled when the controller link ends.
    controller_lost: CancellationToken,
}

impl ControllerLinkDispatcher {
    pub fn new(ctx: Arc<StoreContext>, controller_lost: CancellationToken) -> Self {
        Self {
            ctx,
            controller_lost,
        }
    }
}

#[async_trait]
impl Dispatcher for ControllerLinkDispatcher {
    async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        match msg {
            Message::Remove { name } => match self.ctx.store.delete(&name).await {
                Ok(()) => {
                    info!(file = %name, "Removed file");
                    conn.send(&Message::RemoveAck { name }).await
                }
                Err(StorageError::NotFound(_)) => {
                    warn!(file = %name, "Asked to remove a file that is not stored here");
                    conn.send(&Message::ErrorFileDoesNotExist).await
                }
                Err(e) => Err(e.into()),
            },
            Message::List(_) => {
                let names = self.ctx.store.list().await?;
                debug!(files = names.len(), "Reporting file listing");
                conn.send(&Message::List(names)).await
            }
            Message::Rebalance { sends, removes } => {
                let executor = self.ctx.executor.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    executor.execute(sends, removes).await;
                    if let Err(e) = conn.send(&Message::RebalanceComplete).await {
                        warn!(error = %e, "Failed to report rebalance completion");
                    }
                });
                Ok(())
            }
            other => {
                warn!(kind = other.kind(), "Unhandled message on controller link");
                Ok(())
            }
        }
    }

    fn accepts(&self, msg: &Message) -> bool {
        matches!(
            msg,
            Message::Remove { .. } | Message::List(_) | Message::Rebalance { .. }
        )
    }

    fn bypasses_hold(&self, _conn: &Connection) -> bool {
        true
    }

    async fn connected(&self, conn: &Arc<Connection>) -> Result<()> {
        if self.ctx.controller.set(conn.clone()).is_err() {
            return Err(Error::Internal("controller link already established".into()));
        }
        conn.send(&Message::Join {
            port: self.ctx.port,
        })
        .await?;
        info!(port = self.ctx.port, peer = conn.peer(), "Joined controller");
        Ok(())
    }

    async fn disconnected(&self, conn: &Arc<Connection>) {
        error!(peer = conn.peer(), "Lost connection to the controller");
        self.controller_lost.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dstore::storage::MemoryFileStore;
    use crate::testing::utils::{expect_line, expect_silence, read_message};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::watch;

    struct Node {
        ctx: Arc<StoreContext>,
        store: Arc<MemoryFileStore>,
        controller: BufReader<DuplexStream>,
        lost: CancellationToken,
    }

    /// A storage node on port 4001 linked to an in-memory controller end.
    async fn node(timeout_ms: u64) -> Node {
        let store = Arc::new(MemoryFileStore::new());
        let ctx = StoreContext::new(4001, Duration::from_millis(timeout_ms), store.clone());
        let lost = CancellationToken::new();
        let (local, far) = duplex(64 * 1024);
        let (_hold_tx, hold) = watch::channel(false);
        Connection::spawn(
            local,
            "controller",
            Arc::new(ControllerLinkDispatcher::new(ctx.clone(), lost.clone())),
            hold,
        );
        let mut controller = BufReader::new(far);
        expect_line(&mut controller, "JOIN 4001").await;
        Node {
            ctx,
            store,
            controller,
            lost,
        }
    }

    fn client(ctx: &Arc<StoreContext>) -> (Arc<Connection>, BufReader<DuplexStream>) {
        let (local, far) = duplex(64 * 1024);
        let (_hold_tx, hold) = watch::channel(false);
        let conn = Connection::spawn(
            local,
            "client",
            Arc::new(PeerDispatcher::new(ctx.clone())),
            hold,
        );
        (conn, BufReader::new(far))
    }

    #[tokio::test]
    async fn test_store_acks_then_reports_to_controller() {
        let mut n = node(1000).await;
        let (_conn, mut c) = client(&n.ctx);

        c.get_mut().write_all(b"STORE f.txt 5\n").await.unwrap();
        expect_line(&mut c, "ACK").await;
        c.get_mut().write_all(b"hello").await.unwrap();

        expect_line(&mut n.controller, "STORE_ACK f.txt").await;
        assert_eq!(&n.store.read("f.txt").await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_store_without_content_times_out() {
        let mut n = node(100).await;
        let (_conn, mut c) = client(&n.ctx);

        c.get_mut().write_all(b"STORE f.txt 5\n").await.unwrap();
        expect_line(&mut c, "ACK").await;
        expect_silence(&mut n.controller, 300).await;
        assert!(n.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_store_is_not_reported() {
        let mut n = node(1000).await;
        let (_conn, mut c) = client(&n.ctx);

        c.get_mut()
            .write_all(b"REBALANCE_STORE g 3\n")
            .await
            .unwrap();
        expect_line(&mut c, "ACK").await;
        c.get_mut().write_all(b"abc").await.unwrap();

        expect_silence(&mut n.controller, 200).await;
        assert_eq!(&n.store.read("g").await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn test_load_data() {
        let n = node(1000).await;
        n.store.write("f", b"content").await.unwrap();
        let (_conn, mut c) = client(&n.ctx);

        c.get_mut().write_all(b"LOAD_DATA f\n").await.unwrap();
        let mut data = [0u8; 7];
        c.read_exact(&mut data).await.unwrap();
        assert_eq!(&data, b"content");

        c.get_mut().write_all(b"LOAD_DATA missing\n").await.unwrap();
        expect_line(&mut c, "ERROR_FILE_DOES_NOT_EXIST").await;
    }

    #[tokio::test]
    async fn test_remove_and_list_from_controller() {
        let mut n = node(1000).await;
        n.store.write("a", b"1").await.unwrap();
        n.store.write("b", b"2").await.unwrap();

        n.controller.get_mut().write_all(b"LIST\n").await.unwrap();
        expect_line(&mut n.controller, "LIST a b").await;

        n.controller.get_mut().write_all(b"REMOVE a\n").await.unwrap();
        expect_line(&mut n.controller, "REMOVE_ACK a").await;

        n.controller.get_mut().write_all(b"REMOVE a\n").await.unwrap();
        expect_line(&mut n.controller, "ERROR_FILE_DOES_NOT_EXIST").await;
    }

    #[tokio::test]
    async fn test_empty_rebalance_completes() {
        let mut n = node(1000).await;
        n.store.write("a", b"1").await.unwrap();

        n.controller
            .get_mut()
            .write_all(b"REBALANCE 0 1 a\n")
            .await
            .unwrap();
        assert_eq!(
            read_message(&mut n.controller).await,
            Message::RebalanceComplete
        );
        assert!(n.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_controller_loss_is_signalled() {
        let n = node(1000).await;
        drop(n.controller);
        tokio::time::timeout(Duration::from_secs(1), n.lost.cancelled())
            .await
            .unwrap();
    }
}
