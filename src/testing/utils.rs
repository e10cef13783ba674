use crate::network::{Connection, Dispatcher, Message};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{duplex, AsyncBufRead, AsyncBufReadExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// How long a test waits for an expected line.
const LINE_TIMEOUT: Duration = Duration::from_secs(3);

/// Dispatcher that drops everything.
struct Silent;

#[async_trait]
impl Dispatcher for Silent {
    async fn dispatch(&self, _conn: &Arc<Connection>, _msg: Message) -> crate::Result<()> {
        Ok(())
    }
}

/// A connection over an in-memory pipe. The returned reader sees every line
/// sent on the connection.
pub(crate) fn pipe() -> (Arc<Connection>, BufReader<DuplexStream>) {
    let (local, far) = duplex(64 * 1024);
    // The sender is dropped: the hold can never be raised.
    let (_hold_tx, hold) = watch::channel(false);
    let conn = Connection::spawn(local, "pipe", Arc::new(Silent), hold);
    (conn, BufReader::new(far))
}

/// Read one line without its terminator. Panics on timeout or end of stream.
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut line = String::new();
    let read = tokio::time::timeout(LINE_TIMEOUT, reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .expect("read failed");
    assert!(read > 0, "stream ended while waiting for a line");
    line.trim_end_matches(&['\r', '\n'][..]).to_string()
}

/// Read one line and assert it equals `expected`.
pub(crate) async fn expect_line<R: AsyncBufRead + Unpin>(reader: &mut R, expected: &str) {
    assert_eq!(read_line(reader).await, expected);
}

/// Read and parse one message.
pub(crate) async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Message {
    let line = read_line(reader).await;
    Message::parse(&line).unwrap_or_else(|e| panic!("unparsable line {line:?}: {e}"))
}

/// Assert nothing arrives for `ms` milliseconds.
pub(crate) async fn expect_silence<R: AsyncBufRead + Unpin>(reader: &mut R, ms: u64) {
    let mut line = String::new();
    match tokio::time::timeout(Duration::from_millis(ms), reader.read_line(&mut line)).await {
        Err(_) | Ok(Ok(0)) => {}
        Ok(result) => panic!("expected silence, got {line:?} ({result:?})"),
    }
}

/// Allocate OS-assigned ports by briefly binding to port 0.
pub(crate) async fn allocate_os_ports(count: usize) -> Vec<u16> {
    let mut ports = Vec::with_capacity(count);
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(listener.local_addr().unwrap().port());
        // Held until every port is picked so none is handed out twice.
        listeners.push(listener);
    }
    ports
}

/// Poll `condition` until it holds or `timeout` expires. Returns whether it held.
pub(crate) async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
