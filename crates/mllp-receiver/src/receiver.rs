use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use mllp_common::framing::{self, FrameError, MllpReader};
use mllp_common::{AdapterError, Hl7Ingest, Result};
use mllp_metrics::MetricsRegistry;

const RECONNECTS_METRIC: &str = "receiver-reconnects";
const READS_METRIC: &str = "receiver-reads";
const HANDLE_MESSAGES_METRIC: &str = "receiver-handle-messages";
const WRITES_METRIC: &str = "receiver-writes";
const LATENCY_METRIC: &str = "receiver-latency";

/// Cloud VPCs reset connections that idle for 10 minutes; probing every
/// 3 keeps long-lived sender connections alive.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

/// Inbound MLLP server.
///
/// Accepts TCP connections from on-premise senders and runs one strictly
/// serial read → ingest → ACK loop per connection, each on its own task.
/// Messages on different connections are handled independently; no
/// ordering is promised across connections.
pub struct MllpReceiver<S> {
    listener: TcpListener,
    sink: Arc<S>,
    metrics: Arc<MetricsRegistry>,

    // If set, receives a unit every time a connection closes. Test hook.
    conn_closed: Option<mpsc::UnboundedSender<()>>,
}

impl<S> MllpReceiver<S>
where
    S: Hl7Ingest + 'static,
{
    /// Binds the listener. With `port` 0 the OS picks a free port;
    /// [`MllpReceiver::local_addr`] reports the choice.
    pub async fn bind(
        ip: IpAddr,
        port: u16,
        sink: Arc<S>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port))
            .await
            .map_err(|e| AdapterError::Connection(format!("listening on {}:{}: {}", ip, port, e)))?;

        metrics.new_counter(RECONNECTS_METRIC, "Number of times the receiver reconnects");
        metrics.new_counter(READS_METRIC, "Number of HL7 messages read by the receiver");
        metrics.new_counter(
            HANDLE_MESSAGES_METRIC,
            "Number of received HL7 messages handled successfully",
        );
        metrics.new_counter(WRITES_METRIC, "Number of ACKs written back to senders");
        metrics.new_latency(
            LATENCY_METRIC,
            "The latency between reading an HL7 message and writing its ACK",
        );

        Ok(Self {
            listener,
            sink,
            metrics,
            conn_closed: None,
        })
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| AdapterError::Connection(format!("resolving local addr: {}", e)))
    }

    /// Installs the close-notification channel used by tests to observe
    /// connection teardown.
    pub fn with_close_notify(mut self, notify: mpsc::UnboundedSender<()>) -> Self {
        self.conn_closed = Some(notify);
        self
    }

    /// Accepts connections forever, one task per connection. Returns only
    /// when accepting fails, which is fatal.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| AdapterError::Connection(format!("accept: {}", e)))?;
            tracing::debug!("accepted MLLP connection from {}", peer);
            self.metrics.inc_counter(RECONNECTS_METRIC);

            let sink = self.sink.clone();
            let metrics = self.metrics.clone();
            let conn_closed = self.conn_closed.clone();
            tokio::spawn(handle_connection(stream, sink, metrics, conn_closed));
        }
    }
}

/// Runs the serial message loop for one connection. The next read is not
/// issued until the previous ACK has been written.
async fn handle_connection<S>(
    stream: TcpStream,
    sink: Arc<S>,
    metrics: Arc<MetricsRegistry>,
    conn_closed: Option<mpsc::UnboundedSender<()>>,
) where
    S: Hl7Ingest,
{
    if let Err(err) = SockRef::from(&stream)
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD))
    {
        tracing::warn!("MLLP receiver: failed to enable keep-alive: {}", err);
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = MllpReader::new(read_half);

    loop {
        let msg = match reader.next().await {
            Ok(msg) => msg,
            Err(FrameError::Closed) => break,
            Err(err) => {
                tracing::error!("MLLP receiver: failed to read message: {}", err);
                break;
            }
        };
        let read_time = Instant::now();
        metrics.inc_counter(READS_METRIC);

        let ack = match sink.ingest(&msg).await {
            Ok(ack) => ack,
            Err(err) => {
                // Nothing to frame back; drop the connection so the peer
                // knows the message was not accepted.
                tracing::error!("MLLP receiver: failed to handle message: {}", err);
                break;
            }
        };
        metrics.inc_counter(HANDLE_MESSAGES_METRIC);

        if let Err(err) = write_reply(&mut write_half, &ack).await {
            tracing::error!("MLLP receiver: failed to write ACK: {}", err);
            break;
        }
        metrics.inc_counter(WRITES_METRIC);
        metrics.add_latency(LATENCY_METRIC, read_time.elapsed().as_secs_f64() * 1000.0);
    }

    if let Some(notify) = conn_closed {
        let _ = notify.send(());
    }
}

async fn write_reply(write_half: &mut OwnedWriteHalf, ack: &[u8]) -> std::io::Result<()> {
    framing::write_message(write_half, ack).await?;
    write_half.flush().await
}
