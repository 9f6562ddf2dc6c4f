//! Round-trip tests against an in-process fake of the HL7v2 store API.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use mllp_common::AdapterError;
use mllp_metrics::MetricsRegistry;
use mllp_store::{Hl7v2Client, Hl7v2Config, StaticTokenProvider};

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Serves a canned HL7v2 store at `/v1/projects/p/locations/l/datasets/d/hl7V2Stores/s`.
///
/// Ingest replies depend on the posted message content: `nack-me` gets a
/// 400 with an embedded NACK, `break-me` a plain 500, anything else a 200
/// carrying `ACK`. Message `found` exists, everything else is a 404.
async fn start_fake_store() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(route))
                    .await;
            });
        }
    });
    addr
}

async fn route(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer "))
        .unwrap_or(false);
    if !authorized {
        return Ok(respond(StatusCode::UNAUTHORIZED, r#"{"error": {"code": 401}}"#));
    }

    let body = req.collect().await?.to_bytes();
    let response = match (method, path.as_str()) {
        (Method::POST, "/v1/projects/p/locations/l/datasets/d/hl7V2Stores/s/messages:ingest") => {
            let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
            let data = parsed["message"]["data"].as_str().unwrap();
            let msg = base64::engine::general_purpose::STANDARD
                .decode(data)
                .unwrap();
            match msg.as_slice() {
                b"nack-me" => respond(
                    StatusCode::BAD_REQUEST,
                    &format!(
                        r#"{{"error": {{"code": 400, "details": [{{"hl7Nack": "{}"}}]}}}}"#,
                        b64(b"NACK")
                    ),
                ),
                b"break-me" => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    r#"{"error": {"code": 500, "message": "store exploded"}}"#,
                ),
                _ => respond(
                    StatusCode::OK,
                    &format!(r#"{{"hl7Ack": "{}"}}"#, b64(b"ACK")),
                ),
            }
        }
        (Method::GET, "/v1/projects/p/locations/l/datasets/d/hl7V2Stores/s/messages/found") => {
            respond(
                StatusCode::OK,
                &format!(r#"{{"name": "{}", "data": "{}"}}"#, path.trim_start_matches("/v1/"), b64(b"hello")),
            )
        }
        _ => respond(StatusCode::NOT_FOUND, r#"{"error": {"code": 404}}"#),
    };
    Ok(response)
}

fn respond(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn client_for(addr: SocketAddr, metrics: Arc<MetricsRegistry>) -> Hl7v2Client {
    Hl7v2Client::new(
        Hl7v2Config {
            api_prefix: format!("http://{}/v1", addr),
            project_id: "p".into(),
            location_id: "l".into(),
            dataset_id: "d".into(),
            store_id: "s".into(),
            log_nacked: false,
        },
        Arc::new(StaticTokenProvider("test-token".into())),
        metrics,
    )
    .unwrap()
}

#[tokio::test]
async fn ingest_returns_ack() {
    let addr = start_fake_store().await;
    let metrics = Arc::new(MetricsRegistry::new());
    let client = client_for(addr, metrics.clone());

    let ack = client.ingest(b"MSH|fine").await.unwrap();
    assert_eq!(&ack[..], b"ACK");
    assert_eq!(metrics.counter_value("apiclient-sent"), 1);
    assert_eq!(metrics.counter_value("apiclient-send-error"), 0);
}

#[tokio::test]
async fn ingest_surfaces_embedded_nack_as_reply() {
    let addr = start_fake_store().await;
    let metrics = Arc::new(MetricsRegistry::new());
    let client = client_for(addr, metrics.clone());

    let reply = client.ingest(b"nack-me").await.unwrap();
    assert_eq!(&reply[..], b"NACK");
    // The NACK still counts as a send error even though it is relayed.
    assert_eq!(metrics.counter_value("apiclient-send-error"), 1);
}

#[tokio::test]
async fn ingest_error_without_nack_fails() {
    let addr = start_fake_store().await;
    let metrics = Arc::new(MetricsRegistry::new());
    let client = client_for(addr, metrics.clone());

    let err = client.ingest(b"break-me").await.unwrap_err();
    match err {
        AdapterError::Api { status, .. } => assert_eq!(status, 500),
        other => panic!("want Api error, got {:?}", other),
    }
    assert_eq!(metrics.counter_value("apiclient-send-error"), 1);
}

#[tokio::test]
async fn fetch_returns_message_data() {
    let addr = start_fake_store().await;
    let metrics = Arc::new(MetricsRegistry::new());
    let client = client_for(addr, metrics.clone());

    let name = "projects/p/locations/l/datasets/d/hl7V2Stores/s/messages/found";
    let msg = client.fetch(name).await.unwrap();
    assert_eq!(&msg[..], b"hello");
    assert_eq!(metrics.counter_value("apiclient-fetched"), 1);
    assert_eq!(metrics.counter_value("apiclient-fetch-error"), 0);
}

#[tokio::test]
async fn fetch_missing_message_fails() {
    let addr = start_fake_store().await;
    let metrics = Arc::new(MetricsRegistry::new());
    let client = client_for(addr, metrics.clone());

    let name = "projects/p/locations/l/datasets/d/hl7V2Stores/s/messages/missing";
    let err = client.fetch(name).await.unwrap_err();
    match err {
        AdapterError::Api { status, .. } => assert_eq!(status, 404),
        other => panic!("want Api error, got {:?}", other),
    }
    assert_eq!(metrics.counter_value("apiclient-fetch-error"), 1);
}
