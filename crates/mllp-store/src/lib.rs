//! Client of the cloud HL7v2 store.
//!
//! [`Hl7v2Client`] speaks the store's REST API: `ingest` posts a message
//! and returns the store-issued ACK (or the NACK embedded in an error
//! response), `fetch` retrieves a message by resource name. [`auth`]
//! supplies the bearer tokens.

pub mod auth;
mod client;

pub use auth::{FileTokenProvider, MetadataTokenProvider, StaticTokenProvider};
pub use mllp_common::TokenProvider;
pub use client::{Hl7v2Client, Hl7v2Config, DEFAULT_API_PREFIX};
