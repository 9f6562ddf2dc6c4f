//! End-to-end tests of the inbound receiver over real localhost sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use mllp_common::framing::{self, END_BLOCK, START_BLOCK};
use mllp_common::{AdapterError, Hl7Ingest, Result};
use mllp_metrics::MetricsRegistry;
use mllp_receiver::MllpReceiver;

/// Ingest fake that records messages and answers `ACK:<msg>`.
struct RecordingSink {
    seen: Mutex<Vec<Vec<u8>>>,
    fail: bool,
    delay_first: Option<Duration>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail: false,
            delay_first: None,
        }
    }
}

#[async_trait]
impl Hl7Ingest for RecordingSink {
    async fn ingest(&self, msg: &[u8]) -> Result<Bytes> {
        let first = {
            let mut seen = self.seen.lock().await;
            seen.push(msg.to_vec());
            seen.len() == 1
        };
        if first {
            if let Some(delay) = self.delay_first {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail {
            return Err(AdapterError::Connection("ingest is down".into()));
        }
        Ok(Bytes::from(format!("ACK:{}", String::from_utf8_lossy(msg))))
    }
}

async fn start_receiver(
    sink: Arc<RecordingSink>,
    metrics: Arc<MetricsRegistry>,
) -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let receiver = MllpReceiver::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, sink, metrics)
        .await
        .unwrap()
        .with_close_notify(notify_tx);
    let addr = receiver.local_addr().unwrap();
    assert_ne!(addr.port(), 0, "OS should have picked a port");
    tokio::spawn(async move {
        let _ = receiver.run().await;
    });
    (addr, notify_rx)
}

async fn send_frame(conn: &mut TcpStream, payload: &[u8]) {
    framing::write_message(conn, payload).await.unwrap();
    conn.flush().await.unwrap();
}

#[tokio::test]
async fn acks_a_message_end_to_end() {
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let (addr, _notify) = start_receiver(sink.clone(), metrics.clone()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    send_frame(&mut conn, b"MSH|^~\\&|A|B|").await;

    let reply = framing::read_message(&mut conn).await.unwrap();
    assert_eq!(&reply[..], b"ACK:MSH|^~\\&|A|B|");

    assert_eq!(*sink.seen.lock().await, vec![b"MSH|^~\\&|A|B|".to_vec()]);
    assert_eq!(metrics.counter_value("receiver-reconnects"), 1);
    assert_eq!(metrics.counter_value("receiver-reads"), 1);
    assert_eq!(metrics.counter_value("receiver-handle-messages"), 1);
    assert_eq!(metrics.counter_value("receiver-writes"), 1);
    assert_eq!(metrics.latency_count("receiver-latency"), 1);
}

#[tokio::test]
async fn messages_on_one_connection_are_serialized() {
    let sink = Arc::new(RecordingSink {
        seen: Mutex::new(Vec::new()),
        fail: false,
        delay_first: Some(Duration::from_millis(100)),
    });
    let metrics = Arc::new(MetricsRegistry::new());
    let (addr, _notify) = start_receiver(sink.clone(), metrics.clone()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    // Both frames hit the socket before the first ACK can come back.
    send_frame(&mut conn, b"first").await;
    send_frame(&mut conn, b"second").await;

    let mut reader = framing::MllpReader::new(&mut conn);
    let reply1 = reader.next().await.unwrap();
    let reply2 = reader.next().await.unwrap();
    assert_eq!(&reply1[..], b"ACK:first");
    assert_eq!(&reply2[..], b"ACK:second");

    let seen = sink.seen.lock().await;
    assert_eq!(*seen, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[tokio::test]
async fn malformed_trailer_closes_without_reply() {
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let (addr, mut notify) = start_receiver(sink.clone(), metrics.clone()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&[START_BLOCK, b'p', b'a', b'y', END_BLOCK, 0x00])
        .await
        .unwrap();
    conn.flush().await.unwrap();

    notify.recv().await.expect("connection should close");
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "no reply expected, got {:?}", rest);

    assert!(sink.seen.lock().await.is_empty());
    assert_eq!(metrics.counter_value("receiver-reads"), 0);
    assert_eq!(metrics.counter_value("receiver-handle-messages"), 0);
}

#[tokio::test]
async fn ingest_failure_closes_without_reply() {
    let sink = Arc::new(RecordingSink {
        seen: Mutex::new(Vec::new()),
        fail: true,
        delay_first: None,
    });
    let metrics = Arc::new(MetricsRegistry::new());
    let (addr, mut notify) = start_receiver(sink.clone(), metrics.clone()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    send_frame(&mut conn, b"doomed").await;

    notify.recv().await.expect("connection should close");
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "no reply expected, got {:?}", rest);

    assert_eq!(metrics.counter_value("receiver-reads"), 1);
    assert_eq!(metrics.counter_value("receiver-handle-messages"), 0);
    assert_eq!(metrics.counter_value("receiver-writes"), 0);
}

#[tokio::test]
async fn peer_disconnect_is_a_clean_close() {
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let (addr, mut notify) = start_receiver(sink, metrics.clone()).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    drop(conn);

    notify.recv().await.expect("connection should close");
    assert_eq!(metrics.counter_value("receiver-reconnects"), 1);
    assert_eq!(metrics.counter_value("receiver-reads"), 0);
}

#[tokio::test]
async fn connections_are_independent() {
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let (addr, _notify) = start_receiver(sink.clone(), metrics.clone()).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    send_frame(&mut second, b"from-second").await;
    let reply = framing::read_message(&mut second).await.unwrap();
    assert_eq!(&reply[..], b"ACK:from-second");

    // The idle first connection did not block the second one.
    send_frame(&mut first, b"from-first").await;
    let reply = framing::read_message(&mut first).await.unwrap();
    assert_eq!(&reply[..], b"ACK:from-first");

    assert_eq!(metrics.counter_value("receiver-reconnects"), 2);
    assert_eq!(metrics.counter_value("receiver-writes"), 2);
}
