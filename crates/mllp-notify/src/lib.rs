//! Outbound notification pipeline: consume Pub/Sub notifications of new
//! store messages, fetch each message, forward it over MLLP and
//! acknowledge only after the downstream peer accepted it.

mod handler;
mod pubsub;

pub use handler::NotificationHandler;
pub use pubsub::{subscribe, PubsubConfig, DEFAULT_PUBSUB_PREFIX};
