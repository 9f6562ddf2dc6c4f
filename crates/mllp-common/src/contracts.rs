//! Capability contracts between the adapter core and its collaborators.
//!
//! The core consumes the remote store, the outbound MLLP link and the
//! notification stream exclusively through these traits, so tests swap in
//! in-memory fakes without touching the pipelines.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Posts one HL7v2 message to the remote store and returns the
/// application-level ACK (or NACK) payload the store produced.
#[async_trait]
pub trait Hl7Ingest: Send + Sync {
    async fn ingest(&self, msg: &[u8]) -> Result<Bytes>;
}

/// Retrieves a stored HL7v2 message by its fully-qualified resource name.
#[async_trait]
pub trait Hl7Fetch: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Bytes>;
}

/// Delivers one message to the downstream MLLP peer and returns the
/// framed reply payload.
#[async_trait]
pub trait MllpSend: Send + Sync {
    async fn send(&self, msg: &[u8]) -> Result<Bytes>;
}

/// Supplies bearer tokens for requests against the Cloud APIs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// One delivery from the notification subscription.
///
/// `ack` is fire-and-forget and must be called at most once, only after
/// the message has been forwarded end to end; an unacked notification is
/// redelivered by the subscription after its deadline.
pub trait Notification: Send + Sync {
    fn data(&self) -> &[u8];
    fn attrs(&self) -> &HashMap<String, String>;
    fn ack(&self);
}
