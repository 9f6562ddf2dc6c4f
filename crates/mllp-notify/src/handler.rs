use std::sync::Arc;
use std::time::Instant;

use mllp_common::{Hl7Fetch, MllpSend, Notification};
use mllp_metrics::MetricsRegistry;

const FETCH_ERROR_METRIC: &str = "pubsub-messages-fetch-error";
const SEND_ERROR_METRIC: &str = "pubsub-messages-send-error";
const PROCESSED_METRIC: &str = "pubsub-messages-processed";
const IGNORED_METRIC: &str = "pubsub-messages-ignored";
const HANDLE_LATENCY_METRIC: &str = "pubsub-message-process-latency";

/// Turns one store notification into one delivery to the MLLP peer.
///
/// The notification payload names a newly created message; the handler
/// fetches it and forwards it downstream, acknowledging only after the
/// peer replied. Any failure leaves the notification unacked so the
/// subscription redelivers it; duplicates on the wire are the price of
/// at-least-once, and suppressing them is the peer's job.
///
/// `handle` keeps no state between calls and may run on any number of
/// tasks concurrently.
pub struct NotificationHandler {
    metrics: Arc<MetricsRegistry>,
    fetcher: Arc<dyn Hl7Fetch>,
    sender: Arc<dyn MllpSend>,
    check_publish_attribute: bool,
}

impl NotificationHandler {
    /// `check_publish_attribute` enables the legacy filter: only
    /// notifications carrying `publish=true` (emitted by explicit create
    /// calls) are forwarded, everything else is counted and dropped.
    pub fn new(
        metrics: Arc<MetricsRegistry>,
        fetcher: Arc<dyn Hl7Fetch>,
        sender: Arc<dyn MllpSend>,
        check_publish_attribute: bool,
    ) -> Self {
        metrics.new_counter(
            FETCH_ERROR_METRIC,
            "Number of errors when fetching notified HL7 messages from the store",
        );
        metrics.new_counter(
            SEND_ERROR_METRIC,
            "Number of errors when sending notified HL7 messages to the MLLP target",
        );
        metrics.new_counter(
            PROCESSED_METRIC,
            "Number of notifications processed (including ignored)",
        );
        metrics.new_counter(IGNORED_METRIC, "Number of notifications ignored");
        metrics.new_latency(
            HANDLE_LATENCY_METRIC,
            "The latency between receiving a notification and sending the HL7 message downstream",
        );

        Self {
            metrics,
            fetcher,
            sender,
            check_publish_attribute,
        }
    }

    /// Processes one notification, acknowledging it only on end-to-end
    /// success.
    pub async fn handle(&self, msg: &dyn Notification) {
        let start = Instant::now();
        self.metrics.inc_counter(PROCESSED_METRIC);

        self.forward(msg).await;

        self.metrics
            .add_latency(HANDLE_LATENCY_METRIC, start.elapsed().as_secs_f64() * 1000.0);
    }

    async fn forward(&self, msg: &dyn Notification) {
        if self.check_publish_attribute
            && msg.attrs().get("publish").map(String::as_str) != Some("true")
        {
            self.metrics.inc_counter(IGNORED_METRIC);
            return;
        }

        let msg_name = String::from_utf8_lossy(msg.data()).into_owned();
        let payload = match self.fetcher.fetch(&msg_name).await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("error fetching message {}: {}", msg_name, err);
                self.metrics.inc_counter(FETCH_ERROR_METRIC);
                return;
            }
        };
        if let Err(err) = self.sender.send(&payload).await {
            tracing::warn!("error sending message {}: {}", msg_name, err);
            self.metrics.inc_counter(SEND_ERROR_METRIC);
            return;
        }

        msg.ack();
    }
}
