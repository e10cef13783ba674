//! Store-side execution of a `REBALANCE` instruction.
//!
//! ```text
//!   REBALANCE ──▶ group sends by destination
//!                   │
//!        ┌──────────┼──────────┐        one task per destination
//!        ▼          ▼          ▼
//!     peer A     peer B     peer C     REBALANCE_STORE → ACK → bytes
//!        └──────────┼──────────┘
//!                   ▼
//!          delete the removal list
//! ```
//!
//! Every push on a link waits for the peer's `ACK` before streaming, so a link
//! carries at most one transfer at a time. Failures are per file: a missing
//! local file or a missed acknowledgement is logged and the run carries on,
//! over a new link when the old one may be out of step. A refused connection
//! fails the rest of that destination's files.

use crate::dstore::storage::FileStore;
use crate::error::Result;
use crate::network::{Connection, Dispatcher, Message};
use crate::types::{local_addr, StorePort};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Counts of a finished rebalance on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Copies delivered to a peer.
    pub transferred: usize,
    /// Copies that could not be delivered.
    pub failed: usize,
    /// Local files deleted.
    pub removed: usize,
}

/// Handles the replies arriving on an outbound transfer link.
struct TransferLink;

#[async_trait]
impl Dispatcher for TransferLink {
    async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        if let Message::Ack = msg {
            conn.acks().ack_received();
        }
        Ok(())
    }

    fn accepts(&self, msg: &Message) -> bool {
        matches!(msg, Message::Ack)
    }
}

/// Pushes local files to peers and deletes the ones the node should shed.
pub struct RebalanceExecutor {
    store: Arc<dyn FileStore>,
    timeout: Duration,
}

impl std::fmt::Debug for RebalanceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceExecutor")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RebalanceExecutor {
    pub fn new(store: Arc<dyn FileStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Carry out one instruction. Deletions happen only after every transfer
    /// task finished.
    pub async fn execute(
        &self,
        sends: Vec<(String, Vec<StorePort>)>,
        removes: Vec<String>,
    ) -> RebalanceReport {
        let mut by_destination: BTreeMap<StorePort, Vec<String>> = BTreeMap::new();
        for (name, ports) in sends {
            for port in ports {
                by_destination.entry(port).or_default().push(name.clone());
            }
        }
        info!(
            destinations = by_destination.len(),
            removes = removes.len(),
            "Executing rebalance"
        );

        let mut tasks = JoinSet::new();
        for (port, names) in by_destination {
            tasks.spawn(transfer_to(self.store.clone(), self.timeout, port, names));
        }

        let mut report = RebalanceReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((transferred, failed)) => {
                    report.transferred += transferred;
                    report.failed += failed;
                }
                Err(e) => warn!(error = %e, "Transfer task failed"),
            }
        }

        for name in &removes {
            match self.store.delete(name).await {
                Ok(()) => report.removed += 1,
                Err(e) => warn!(file = %name, error = %e, "Failed to delete file"),
            }
        }

        info!(?report, "Rebalance executed");
        report
    }
}

/// Open an outbound transfer link to the peer on `port`.
async fn open_link(port: StorePort) -> Result<Arc<Connection>> {
    // Nothing ever raises a hold on an outbound link.
    let (_hold_tx, hold) = watch::channel(false);
    Connection::connect(local_addr(port), Arc::new(TransferLink), hold).await
}

/// Offer one file on `link` and stream it once the peer acknowledged.
async fn offer(
    link: &Connection,
    timeout: Duration,
    port: StorePort,
    name: &str,
    data: &[u8],
) -> bool {
    let ack = link.acks().wait();
    let request = Message::RebalanceStore {
        name: name.to_string(),
        size: data.len() as u64,
    };
    if let Err(e) = link.send(&request).await {
        warn!(file = %name, port, error = %e, "Failed to offer file to peer");
        return false;
    }
    if !ack.received_within(timeout).await {
        warn!(file = %name, port, "Peer did not acknowledge the transfer, skipping");
        return false;
    }
    match link.send_bytes(data).await {
        Ok(()) => {
            debug!(file = %name, port, len = data.len(), "Transferred file");
            true
        }
        Err(e) => {
            warn!(file = %name, port, error = %e, "Failed to stream file to peer");
            false
        }
    }
}

/// Push `names` to the peer on `port`. Returns `(transferred, failed)`.
///
/// A failed offer leaves the peer possibly still waiting for bytes, so the
/// link is dropped and the next file goes over a fresh one.
async fn transfer_to(
    store: Arc<dyn FileStore>,
    timeout: Duration,
    port: StorePort,
    names: Vec<String>,
) -> (usize, usize) {
    let mut link: Option<Arc<Connection>> = None;
    let mut transferred = 0;
    let mut failed = 0;
    let mut pending = names.into_iter();

    while let Some(name) = pending.next() {
        let data = match store.read(&name).await {
            Ok(data) => data,
            Err(e) => {
                warn!(file = %name, port, error = %e, "Cannot read file to transfer, skipping");
                failed += 1;
                continue;
            }
        };

        let conn = match &link {
            Some(conn) => conn.clone(),
            None => match open_link(port).await {
                Ok(conn) => {
                    link = Some(conn.clone());
                    conn
                }
                Err(e) => {
                    warn!(port, error = %e, "Failed to connect to peer for rebalance");
                    failed += 1 + pending.len();
                    break;
                }
            },
        };

        if offer(&conn, timeout, port, &name, &data).await {
            transferred += 1;
        } else {
            failed += 1;
            conn.close().await;
            link = None;
        }
    }

    if let Some(link) = link {
        link.close().await;
    }
    (transferred, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dstore::storage::MemoryFileStore;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn seeded(files: &[(&str, &[u8])]) -> Arc<MemoryFileStore> {
        let store = Arc::new(MemoryFileStore::new());
        for (name, data) in files {
            store.write(name, data).await.unwrap();
        }
        store
    }

    /// Acknowledge every offer on `stream` and collect the files until it closes.
    async fn serve_offers(stream: TcpStream) -> Vec<(String, Vec<u8>)> {
        let mut stream = BufReader::new(stream);
        let mut received = Vec::new();
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let Ok(Message::RebalanceStore { name, size }) = Message::parse(line.trim_end())
            else {
                panic!("unexpected line {line:?}");
            };
            stream.get_mut().write_all(b"ACK\n").await.unwrap();
            let mut data = vec![0u8; size as usize];
            stream.read_exact(&mut data).await.unwrap();
            received.push((name, data));
        }
        received
    }

    /// A peer that acknowledges every offer and collects what it receives.
    async fn accepting_peer() -> (StorePort, tokio::task::JoinHandle<Vec<(String, Vec<u8>)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_offers(stream).await
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_transfers_then_deletes() {
        let store = seeded(&[("a", b"alpha"), ("b", b"beta")]).await;
        let (port, peer) = accepting_peer().await;
        let executor = RebalanceExecutor::new(store.clone(), Duration::from_secs(1));

        let report = executor
            .execute(
                vec![("a".into(), vec![port]), ("b".into(), vec![port])],
                vec!["a".into()],
            )
            .await;

        assert_eq!(
            report,
            RebalanceReport {
                transferred: 2,
                failed: 0,
                removed: 1
            }
        );
        let received = peer.await.unwrap();
        assert_eq!(
            received,
            vec![
                ("a".to_string(), b"alpha".to_vec()),
                ("b".to_string(), b"beta".to_vec())
            ]
        );
        assert_eq!(store.list().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let store = seeded(&[("b", b"beta")]).await;
        let (port, peer) = accepting_peer().await;
        let executor = RebalanceExecutor::new(store, Duration::from_secs(1));

        let report = executor
            .execute(
                vec![("a".into(), vec![port]), ("b".into(), vec![port])],
                vec![],
            )
            .await;

        assert_eq!(report.transferred, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(peer.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let store = seeded(&[("a", b"alpha")]).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let executor = RebalanceExecutor::new(store.clone(), Duration::from_millis(100));
        let report = executor
            .execute(vec![("a".into(), vec![port])], vec!["a".into()])
            .await;

        assert_eq!(report.transferred, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_offer_drops_the_link() {
        let store = seeded(&[("a", b"alpha"), ("b", b"beta")]).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            // First link: take the offer for `a` but never acknowledge it.
            let (first, _) = listener.accept().await.unwrap();
            let mut first = BufReader::new(first);
            let mut offer = String::new();
            first.read_line(&mut offer).await.unwrap();
            let mut rest = Vec::new();
            first.read_to_end(&mut rest).await.unwrap();

            let (second, _) = listener.accept().await.unwrap();
            (offer, rest, serve_offers(second).await)
        });

        let executor = RebalanceExecutor::new(store, Duration::from_millis(100));
        let report = executor
            .execute(
                vec![("a".into(), vec![port]), ("b".into(), vec![port])],
                vec![],
            )
            .await;
        assert_eq!(report.transferred, 1);
        assert_eq!(report.failed, 1);

        let (offer, rest, received) = peer.await.unwrap();
        assert_eq!(offer, "REBALANCE_STORE a 5\n");
        assert!(rest.is_empty(), "link kept carrying data: {rest:?}");
        assert_eq!(received, vec![("b".to_string(), b"beta".to_vec())]);
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_every_file() {
        let store = seeded(&[("a", b"1"), ("b", b"2")]).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let executor = RebalanceExecutor::new(store, Duration::from_millis(100));
        let report = executor
            .execute(
                vec![("a".into(), vec![port]), ("b".into(), vec![port])],
                vec![],
            )
            .await;
        assert_eq!(report.failed, 2);
    }
}
