//! Pull subscriber for the store's notification topic.
//!
//! Notifications are pulled in batches over the Pub/Sub REST API and
//! handed to the [`NotificationHandler`], one task per message. Acks
//! travel back through a channel to a dedicated task that batches
//! `:acknowledge` calls; a message is only ever acked after its handler
//! finished the downstream round trip, so the subscription redelivers
//! anything the adapter could not place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use mllp_common::{AdapterError, Notification, Result, TokenProvider};

use crate::handler::NotificationHandler;

/// Production endpoint of the Pub/Sub API.
pub const DEFAULT_PUBSUB_PREFIX: &str = "https://pubsub.googleapis.com/v1";

const MAX_PULL_MESSAGES: u32 = 32;
const MAX_ACK_BATCH: usize = 1000;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Names the subscription to pull notifications from.
#[derive(Debug, Clone)]
pub struct PubsubConfig {
    /// API prefix including scheme and version; overridable for tests.
    pub api_prefix: String,
    pub project_id: String,
    pub subscription: String,
}

impl PubsubConfig {
    pub fn new(project_id: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            api_prefix: DEFAULT_PUBSUB_PREFIX.to_string(),
            project_id: project_id.into(),
            subscription: subscription.into(),
        }
    }
}

#[derive(Serialize)]
struct PullRequest {
    #[serde(rename = "maxMessages")]
    max_messages: u32,
}

#[derive(Deserialize, Default)]
struct PullResponse {
    #[serde(rename = "receivedMessages", default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "ackId")]
    ack_id: String,
    #[serde(default)]
    message: PubsubMessage,
}

#[derive(Deserialize, Default)]
struct PubsubMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Serialize)]
struct AcknowledgeRequest {
    #[serde(rename = "ackIds")]
    ack_ids: Vec<String>,
}

/// One pulled Pub/Sub message. Acking enqueues the ack id; the
/// acknowledge task ships it to the service.
struct PubsubNotification {
    data: Vec<u8>,
    attrs: HashMap<String, String>,
    ack_id: String,
    acks: mpsc::UnboundedSender<String>,
}

impl PubsubNotification {
    fn new(received: ReceivedMessage, acks: mpsc::UnboundedSender<String>) -> Self {
        let data = match received.message.data {
            None => Vec::new(),
            Some(encoded) => match base64::engine::general_purpose::STANDARD.decode(&encoded) {
                Ok(data) => data,
                Err(err) => {
                    // An undecodable payload flows through the normal
                    // fetch-failure path and stays unacked.
                    tracing::warn!("undecodable notification payload: {}", err);
                    Vec::new()
                }
            },
        };
        Self {
            data,
            attrs: received.message.attributes,
            ack_id: received.ack_id,
            acks,
        }
    }
}

impl Notification for PubsubNotification {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn attrs(&self) -> &HashMap<String, String> {
        &self.attrs
    }

    fn ack(&self) {
        let _ = self.acks.send(self.ack_id.clone());
    }
}

/// Pulls notifications until a terminal error.
///
/// Transient pull failures are retried with backoff; an authorization or
/// not-found answer means the subscription will never work and is
/// returned to the caller, which treats it as fatal.
pub async fn subscribe(
    config: PubsubConfig,
    tokens: Arc<dyn TokenProvider>,
    handler: Arc<NotificationHandler>,
) -> Result<()> {
    let client = reqwest::Client::new();
    let sub_path = format!(
        "projects/{}/subscriptions/{}",
        config.project_id, config.subscription
    );
    tracing::info!("pulling notifications from {}", sub_path);

    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    tokio::spawn(acknowledge_loop(
        client.clone(),
        config.api_prefix.clone(),
        sub_path.clone(),
        tokens.clone(),
        ack_rx,
    ));

    let mut retry_delay = INITIAL_RETRY_DELAY;
    loop {
        let batch = match pull_once(&client, &config.api_prefix, &sub_path, tokens.as_ref()).await
        {
            Ok(batch) => {
                retry_delay = INITIAL_RETRY_DELAY;
                batch
            }
            Err(err) if is_terminal(&err) => return Err(err),
            Err(err) => {
                tracing::warn!("pull failed, retrying in {:?}: {}", retry_delay, err);
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                continue;
            }
        };

        // One task per notification; the next pull waits for the batch so
        // the number of in-flight handlers stays bounded.
        let mut tasks = JoinSet::new();
        for received in batch {
            let notification = PubsubNotification::new(received, ack_tx.clone());
            let handler = handler.clone();
            tasks.spawn(async move { handler.handle(&notification).await });
        }
        while tasks.join_next().await.is_some() {}
    }
}

fn is_terminal(err: &AdapterError) -> bool {
    matches!(
        err,
        AdapterError::Api {
            status: 401 | 403 | 404,
            ..
        }
    )
}

async fn pull_once(
    client: &reqwest::Client,
    prefix: &str,
    sub_path: &str,
    tokens: &dyn TokenProvider,
) -> Result<Vec<ReceivedMessage>> {
    let token = tokens.access_token().await?;
    let resp = client
        .post(format!("{}/{}:pull", prefix, sub_path))
        .bearer_auth(token)
        .json(&PullRequest {
            max_messages: MAX_PULL_MESSAGES,
        })
        .send()
        .await
        .map_err(|e| AdapterError::Http(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(AdapterError::Api {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        });
    }
    let parsed: PullResponse = resp
        .json()
        .await
        .map_err(|e| AdapterError::InvalidResponse(format!("parsing pull response: {}", e)))?;
    Ok(parsed.received_messages)
}

async fn acknowledge_loop(
    client: reqwest::Client,
    prefix: String,
    sub_path: String,
    tokens: Arc<dyn TokenProvider>,
    mut acks: mpsc::UnboundedReceiver<String>,
) {
    while let Some(first) = acks.recv().await {
        let mut ack_ids = vec![first];
        while ack_ids.len() < MAX_ACK_BATCH {
            match acks.try_recv() {
                Ok(id) => ack_ids.push(id),
                Err(_) => break,
            }
        }
        // A lost ack is not a correctness problem, the notification is
        // simply redelivered.
        if let Err(err) = acknowledge(&client, &prefix, &sub_path, tokens.as_ref(), ack_ids).await
        {
            tracing::warn!("failed to acknowledge notifications: {}", err);
        }
    }
}

async fn acknowledge(
    client: &reqwest::Client,
    prefix: &str,
    sub_path: &str,
    tokens: &dyn TokenProvider,
    ack_ids: Vec<String>,
) -> Result<()> {
    let token = tokens.access_token().await?;
    let resp = client
        .post(format!("{}/{}:acknowledge", prefix, sub_path))
        .bearer_auth(token)
        .json(&AcknowledgeRequest { ack_ids })
        .send()
        .await
        .map_err(|e| AdapterError::Http(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(AdapterError::Api {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(ack_id: &str, data: Option<&str>) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: ack_id.to_string(),
            message: PubsubMessage {
                data: data.map(str::to_string),
                attributes: HashMap::new(),
            },
        }
    }

    #[test]
    fn decodes_base64_payload() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"projects/p");
        let notification = PubsubNotification::new(received("a1", Some(&encoded)), tx);
        assert_eq!(notification.data(), b"projects/p");
    }

    #[test]
    fn undecodable_payload_becomes_empty() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let notification = PubsubNotification::new(received("a1", Some("!!!not-base64!!!")), tx);
        assert!(notification.data().is_empty());
    }

    #[test]
    fn ack_enqueues_the_ack_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notification = PubsubNotification::new(received("ack-42", None), tx);
        notification.ack();
        assert_eq!(rx.try_recv().unwrap(), "ack-42");
    }

    #[test]
    fn terminal_errors_are_classified() {
        for status in [401u16, 403, 404] {
            assert!(is_terminal(&AdapterError::Api {
                status,
                body: String::new()
            }));
        }
        assert!(!is_terminal(&AdapterError::Api {
            status: 429,
            body: String::new()
        }));
        assert!(!is_terminal(&AdapterError::Http("reset".into())));
    }
}
