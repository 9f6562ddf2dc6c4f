//! Best-effort export of the metric registry.
//!
//! Export only makes sense on GCE/GKE, where the metadata server supplies
//! the zone and instance labels that keep fleets of adapters apart. When
//! the probe fails the adapter is running somewhere else; export is
//! skipped and the process carries on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use mllp_common::{AdapterError, Result};

use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const METADATA_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct ExportPayload {
    labels: BTreeMap<String, String>,
    #[serde(flatten)]
    snapshot: MetricsSnapshot,
}

/// Starts serving the registry at `GET /metrics` on the given port.
///
/// Returns `Ok(None)` when the environment probe fails (not on GCE);
/// binding or other startup failures are real errors. The returned task
/// runs for the process lifetime.
pub async fn start_export(
    registry: Arc<MetricsRegistry>,
    port: u16,
) -> Result<Option<JoinHandle<()>>> {
    let mut labels = match probe_environment().await {
        Ok(labels) => labels,
        Err(err) => {
            tracing::warn!("not running on GCE, skipping metrics export: {}", err);
            return Ok(None);
        }
    };
    labels.insert("job".to_string(), "mllp_adapter".to_string());
    // Keep concurrent adapter instances distinguishable.
    let id = format!("{:016x}", rand::random::<u64>());
    tracing::info!("exporting metrics with label id={}", id);
    labels.insert("id".to_string(), id);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| AdapterError::Connection(format!("binding metrics port {}: {}", port, e)))?;
    tracing::info!("serving metrics on port {}", port);

    let labels = Arc::new(labels);
    let handle = tokio::spawn(async move {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!("metrics listener accept failed: {}", err);
                    continue;
                }
            };
            let registry = registry.clone();
            let labels = labels.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let registry = registry.clone();
                    let labels = labels.clone();
                    async move { handle_request(req, &registry, &labels) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("metrics connection error: {}", err);
                }
            });
        }
    });

    Ok(Some(handle))
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: &MetricsRegistry,
    labels: &BTreeMap<String, String>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let payload = ExportPayload {
                labels: labels.clone(),
                snapshot: registry.snapshot(),
            };
            match serde_json::to_vec(&payload) {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap(),
                Err(err) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(err.to_string())))
                    .unwrap(),
            }
        }
        (&Method::GET, "/healthz") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"ok")))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Reads the zone and instance labels from the metadata server.
async fn probe_environment() -> Result<BTreeMap<String, String>> {
    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .map_err(|e| AdapterError::Http(e.to_string()))?;

    let zone = metadata_value(&client, "instance/zone").await?;
    // The metadata server reports "projects/{num}/zones/{zone}".
    let zone = zone.rsplit('/').next().unwrap_or(&zone).to_string();
    let instance = metadata_value(&client, "instance/id").await?;

    let mut labels = BTreeMap::new();
    labels.insert("zone".to_string(), zone);
    labels.insert("instance".to_string(), instance);
    Ok(labels)
}

async fn metadata_value(client: &reqwest::Client, path: &str) -> Result<String> {
    let resp = client
        .get(format!("{}/{}", METADATA_BASE, path))
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| AdapterError::Http(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(AdapterError::Api {
            status: resp.status().as_u16(),
            body: resp.text().await.unwrap_or_default(),
        });
    }
    resp.text()
        .await
        .map_err(|e| AdapterError::Http(e.to_string()))
}
