//! HTTP client for the Cloud HL7v2 store API.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use mllp_common::{
    hl7v2_store_name, parse_hl7v2_message_name, AdapterError, Hl7Fetch, Hl7Ingest, Result,
};
use mllp_metrics::MetricsRegistry;

use mllp_common::TokenProvider;

/// Production endpoint of the Cloud Healthcare API.
pub const DEFAULT_API_PREFIX: &str = "https://healthcare.googleapis.com/v1";

const INGEST_SUFFIX: &str = "messages:ingest";

const SENT_METRIC: &str = "apiclient-sent";
const SEND_ERROR_METRIC: &str = "apiclient-send-error";
const FETCHED_METRIC: &str = "apiclient-fetched";
const FETCH_ERROR_METRIC: &str = "apiclient-fetch-error";
const FETCH_ERROR_INTERNAL_METRIC: &str = "apiclient-fetch-error-internal";

/// Identifies the HL7v2 store the adapter ingests into and fetches from.
#[derive(Debug, Clone)]
pub struct Hl7v2Config {
    /// API prefix including scheme and version; overridable for tests
    /// and proxies.
    pub api_prefix: String,
    pub project_id: String,
    pub location_id: String,
    pub dataset_id: String,
    pub store_id: String,
    /// Whether to log the content of messages the store NACKs. The logs
    /// will contain sensitive data.
    pub log_nacked: bool,
}

#[derive(Serialize)]
struct IngestRequest {
    message: IngestMessage,
}

#[derive(Serialize)]
struct IngestMessage {
    data: String,
}

#[derive(Deserialize)]
struct IngestResponse {
    #[serde(rename = "hl7Ack", default)]
    hl7_ack: Option<String>,
}

#[derive(Deserialize, Default)]
struct IngestErrorResponse {
    #[serde(default)]
    error: IngestErrorBody,
}

#[derive(Deserialize, Default)]
struct IngestErrorBody {
    #[serde(default)]
    details: Vec<IngestErrorDetail>,
}

#[derive(Deserialize, Default)]
struct IngestErrorDetail {
    #[serde(rename = "hl7Nack", default)]
    hl7_nack: Option<String>,
}

#[derive(Deserialize)]
struct MessageResource {
    #[serde(default)]
    data: Option<String>,
}

/// Client of the HL7v2 store API.
///
/// Shared across the inbound connections and the notification tasks;
/// `reqwest::Client` multiplexes the underlying connections.
pub struct Hl7v2Client {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    config: Hl7v2Config,
    store_name: String,
    metrics: Arc<MetricsRegistry>,
}

impl Hl7v2Client {
    pub fn new(
        config: Hl7v2Config,
        tokens: Arc<dyn TokenProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        validate_components(&config)?;

        metrics.new_counter(SENT_METRIC, "Number of HL7 messages sent to the HL7v2 store");
        metrics.new_counter(
            SEND_ERROR_METRIC,
            "Number of errors when sending HL7 messages to the HL7v2 store",
        );
        metrics.new_counter(
            FETCHED_METRIC,
            "Number of HL7 messages fetched from the HL7v2 store",
        );
        metrics.new_counter(
            FETCH_ERROR_METRIC,
            "Number of errors when fetching HL7 messages from the HL7v2 store",
        );
        metrics.new_counter(
            FETCH_ERROR_INTERNAL_METRIC,
            "Number of fetches rejected before reaching the HL7v2 store",
        );

        let http = reqwest::Client::new();
        let store_name = hl7v2_store_name(
            &config.project_id,
            &config.location_id,
            &config.dataset_id,
            &config.store_id,
        );
        Ok(Self {
            http,
            tokens,
            config,
            store_name,
            metrics,
        })
    }

    /// Sends a message to the store's ingest endpoint and returns the
    /// ACK, or the NACK the store embedded in an error response.
    ///
    /// A NACK-bearing error means the message reached the store and was
    /// judged; from the adapter's point of view that is a reply to relay,
    /// not a failure.
    pub async fn ingest(&self, msg: &[u8]) -> Result<Bytes> {
        self.metrics.inc_counter(SENT_METRIC);

        let body = IngestRequest {
            message: IngestMessage {
                data: base64::engine::general_purpose::STANDARD.encode(msg),
            },
        };
        tracing::info!("sending message of size {}", msg.len());

        let token = match self.tokens.access_token().await {
            Ok(token) => token,
            Err(err) => {
                self.metrics.inc_counter(SEND_ERROR_METRIC);
                return Err(err);
            }
        };
        let url = format!("{}/{}/{}", self.config.api_prefix, self.store_name, INGEST_SUFFIX);
        let resp = match self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.metrics.inc_counter(SEND_ERROR_METRIC);
                return Err(AdapterError::Http(err.to_string()));
            }
        };

        let status = resp.status();
        let raw = match resp.bytes().await {
            Ok(raw) => raw,
            Err(err) => {
                self.metrics.inc_counter(SEND_ERROR_METRIC);
                return Err(AdapterError::Http(err.to_string()));
            }
        };

        if !status.is_success() {
            self.metrics.inc_counter(SEND_ERROR_METRIC);
            if let Some(nack) = extract_nack(&raw)? {
                tracing::error!("message was sent, received a NACK response");
                if self.config.log_nacked {
                    tracing::error!("NACKed message content: {}", String::from_utf8_lossy(msg));
                }
                return Ok(nack);
            }
            return Err(AdapterError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&raw).into_owned(),
            });
        }

        let parsed: IngestResponse = serde_json::from_slice(&raw).map_err(|e| {
            self.metrics.inc_counter(SEND_ERROR_METRIC);
            AdapterError::InvalidResponse(format!("parsing ingest response: {}", e))
        })?;
        let ack = decode_field(parsed.hl7_ack, "hl7Ack")?;
        tracing::info!("message was successfully sent");
        Ok(ack)
    }

    /// Retrieves a message by resource name.
    ///
    /// The name must refer to the configured store; notifications for
    /// other stores indicate a subscription misconfiguration and are
    /// rejected before any network call.
    pub async fn fetch(&self, msg_name: &str) -> Result<Bytes> {
        self.metrics.inc_counter(FETCHED_METRIC);

        let name = match parse_hl7v2_message_name(msg_name) {
            Ok(name) => name,
            Err(err) => {
                self.metrics.inc_counter(FETCH_ERROR_INTERNAL_METRIC);
                return Err(err);
            }
        };
        for (got, want, what) in [
            (&name.project_id, &self.config.project_id, "project"),
            (&name.location_id, &self.config.location_id, "location"),
            (&name.dataset_id, &self.config.dataset_id, "dataset"),
            (&name.store_id, &self.config.store_id, "HL7v2 store"),
        ] {
            if got != want {
                self.metrics.inc_counter(FETCH_ERROR_INTERNAL_METRIC);
                return Err(AdapterError::InvalidName(format!(
                    "message name {} is not from expected {} {}",
                    msg_name, what, want
                )));
            }
        }

        tracing::info!("started to fetch message");
        let token = match self.tokens.access_token().await {
            Ok(token) => token,
            Err(err) => {
                self.metrics.inc_counter(FETCH_ERROR_METRIC);
                return Err(err);
            }
        };
        let url = format!("{}/{}", self.config.api_prefix, msg_name);
        let resp = match self.http.get(&url).bearer_auth(token).send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.metrics.inc_counter(FETCH_ERROR_METRIC);
                return Err(AdapterError::Http(err.to_string()));
            }
        };

        let status = resp.status();
        let raw = match resp.bytes().await {
            Ok(raw) => raw,
            Err(err) => {
                self.metrics.inc_counter(FETCH_ERROR_METRIC);
                return Err(AdapterError::Http(err.to_string()));
            }
        };
        if !status.is_success() {
            self.metrics.inc_counter(FETCH_ERROR_METRIC);
            return Err(AdapterError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&raw).into_owned(),
            });
        }

        let parsed: MessageResource = serde_json::from_slice(&raw).map_err(|e| {
            self.metrics.inc_counter(FETCH_ERROR_METRIC);
            AdapterError::InvalidResponse(format!("parsing message resource: {}", e))
        })?;
        let data = decode_field(parsed.data, "data")?;
        tracing::info!("message was successfully fetched");
        Ok(data)
    }
}

#[async_trait]
impl Hl7Ingest for Hl7v2Client {
    async fn ingest(&self, msg: &[u8]) -> Result<Bytes> {
        Hl7v2Client::ingest(self, msg).await
    }
}

#[async_trait]
impl Hl7Fetch for Hl7v2Client {
    async fn fetch(&self, name: &str) -> Result<Bytes> {
        Hl7v2Client::fetch(self, name).await
    }
}

fn validate_components(config: &Hl7v2Config) -> Result<()> {
    for (value, what) in [
        (&config.project_id, "project ID"),
        (&config.location_id, "location ID"),
        (&config.dataset_id, "dataset ID"),
        (&config.store_id, "store ID"),
    ] {
        if value.is_empty() {
            return Err(AdapterError::Config(format!("missing {}", what)));
        }
    }
    Ok(())
}

/// Pulls an embedded NACK out of an ingest error body, if there is one.
fn extract_nack(raw: &[u8]) -> Result<Option<Bytes>> {
    let parsed: IngestErrorResponse = serde_json::from_slice(raw).map_err(|e| {
        AdapterError::InvalidResponse(format!(
            "parsing error response: {}\n{}",
            e,
            String::from_utf8_lossy(raw)
        ))
    })?;
    for detail in parsed.error.details {
        if let Some(nack) = detail.hl7_nack {
            if !nack.is_empty() {
                return decode_field(Some(nack), "hl7Nack").map(Some);
            }
        }
    }
    Ok(None)
}

fn decode_field(field: Option<String>, what: &str) -> Result<Bytes> {
    match field {
        None => Ok(Bytes::new()),
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| AdapterError::InvalidResponse(format!("decoding {}: {}", what, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;

    fn test_client(metrics: Arc<MetricsRegistry>) -> Hl7v2Client {
        Hl7v2Client::new(
            Hl7v2Config {
                api_prefix: "http://127.0.0.1:1/v1".into(),
                project_id: "p".into(),
                location_id: "l".into(),
                dataset_id: "d".into(),
                store_id: "s".into(),
                log_nacked: false,
            },
            Arc::new(StaticTokenProvider("token".into())),
            metrics,
        )
        .unwrap()
    }

    #[test]
    fn rejects_missing_components() {
        let config = Hl7v2Config {
            api_prefix: DEFAULT_API_PREFIX.into(),
            project_id: "p".into(),
            location_id: String::new(),
            dataset_id: "d".into(),
            store_id: "s".into(),
            log_nacked: false,
        };
        let result = Hl7v2Client::new(
            config,
            Arc::new(StaticTokenProvider("token".into())),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(matches!(result, Err(AdapterError::Config(_))));
    }

    #[test]
    fn extracts_nack_from_error_body() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"NACK!");
        let body = format!(
            r#"{{"error": {{"code": 400, "details": [{{"@type": "x"}}, {{"hl7Nack": "{}"}}]}}}}"#,
            encoded
        );
        let nack = extract_nack(body.as_bytes()).unwrap();
        assert_eq!(nack.as_deref(), Some(&b"NACK!"[..]));
    }

    #[test]
    fn no_nack_in_plain_error_body() {
        let body = br#"{"error": {"code": 429, "message": "quota exceeded"}}"#;
        assert!(extract_nack(body).unwrap().is_none());
    }

    #[test]
    fn unparseable_error_body_is_an_error() {
        assert!(extract_nack(b"not json").is_err());
    }

    #[tokio::test]
    async fn fetch_rejects_unparseable_name() {
        let metrics = Arc::new(MetricsRegistry::new());
        let client = test_client(metrics.clone());

        let err = client.fetch("invalid").await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidName(_)));
        assert_eq!(metrics.counter_value(FETCHED_METRIC), 1);
        assert_eq!(metrics.counter_value(FETCH_ERROR_INTERNAL_METRIC), 1);
        assert_eq!(metrics.counter_value(FETCH_ERROR_METRIC), 0);
    }

    #[tokio::test]
    async fn fetch_rejects_foreign_store() {
        let metrics = Arc::new(MetricsRegistry::new());
        let client = test_client(metrics.clone());

        let name = "projects/other/locations/l/datasets/d/hl7V2Stores/s/messages/m";
        let err = client.fetch(name).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidName(_)));
        assert_eq!(metrics.counter_value(FETCH_ERROR_INTERNAL_METRIC), 1);
    }
}
