use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use mllp_common::framing;
use mllp_common::{AdapterError, MllpSend, Result};
use mllp_metrics::MetricsRegistry;

const SENT_METRIC: &str = "mllpsender-messages-sent";
const ACK_ERROR_METRIC: &str = "mllpsender-messages-ack-error";
const SEND_ERROR_METRIC: &str = "mllpsender-messages-send-error";
const DIAL_ERROR_METRIC: &str = "mllpsender-connections-dial-error";

/// Outbound MLLP client.
///
/// Every send dials a fresh connection, writes one framed message, reads
/// one framed reply and drops the socket. MLLP does not multiplex and
/// peers routinely close idle sockets, so there is nothing to gain from
/// keeping connections around. Stateless apart from the target address,
/// safe to call from any number of tasks.
pub struct MllpSender {
    addr: String,
    metrics: Arc<MetricsRegistry>,
}

impl MllpSender {
    pub fn new(addr: impl Into<String>, metrics: Arc<MetricsRegistry>) -> Self {
        metrics.new_counter(SENT_METRIC, "Number of HL7 messages sent to the MLLP target");
        metrics.new_counter(
            ACK_ERROR_METRIC,
            "Number of errors when receiving ACKs from the MLLP target",
        );
        metrics.new_counter(
            SEND_ERROR_METRIC,
            "Number of errors when sending HL7 messages to the MLLP target",
        );
        metrics.new_counter(
            DIAL_ERROR_METRIC,
            "Number of errors when dialing the MLLP target",
        );
        Self {
            addr: addr.into(),
            metrics,
        }
    }

    /// Sends one message and returns the peer's framed reply payload.
    /// Exactly one write attempt; retrying is the caller's decision.
    pub async fn send(&self, msg: &[u8]) -> Result<Bytes> {
        self.metrics.inc_counter(SENT_METRIC);

        let mut conn = match TcpStream::connect(&self.addr).await {
            Ok(conn) => conn,
            Err(err) => {
                self.metrics.inc_counter(DIAL_ERROR_METRIC);
                return Err(AdapterError::Connection(format!(
                    "dialing {}: {}",
                    self.addr, err
                )));
            }
        };

        if let Err(err) = write_and_flush(&mut conn, msg).await {
            self.metrics.inc_counter(SEND_ERROR_METRIC);
            return Err(AdapterError::Connection(format!(
                "writing message: {}",
                err
            )));
        }

        match framing::read_message(&mut conn).await {
            Ok(ack) => Ok(ack),
            Err(err) => {
                self.metrics.inc_counter(ACK_ERROR_METRIC);
                Err(AdapterError::Connection(format!("reading ACK: {}", err)))
            }
        }
    }
}

async fn write_and_flush(conn: &mut TcpStream, msg: &[u8]) -> std::io::Result<()> {
    framing::write_message(conn, msg).await?;
    conn.flush().await
}

#[async_trait]
impl MllpSend for MllpSender {
    async fn send(&self, msg: &[u8]) -> Result<Bytes> {
        MllpSender::send(self, msg).await
    }
}
