//! Inbound half of the adapter: a long-lived TCP server that bridges
//! MLLP-framed senders to the store's ingest operation and relays the
//! resulting ACK or NACK on the same connection.

mod receiver;

pub use receiver::MllpReceiver;
