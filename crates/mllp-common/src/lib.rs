//! Shared building blocks for the MLLP adapter.
//!
//! The adapter bridges on-premise HL7v2 endpoints speaking MLLP over TCP
//! and a cloud HL7v2 store reached over HTTPS. This crate holds the
//! pieces every other crate needs:
//!
//! - [`framing`]: the MLLP wire codec
//! - [`names`]: HL7v2 REST resource-name formatting and parsing
//! - [`contracts`]: the capability traits the core pipelines consume
//! - [`error`]: the shared error type

pub mod contracts;
pub mod error;
pub mod framing;
pub mod names;

pub use contracts::{Hl7Fetch, Hl7Ingest, MllpSend, Notification, TokenProvider};
pub use error::{AdapterError, Result};
pub use framing::{read_message, write_message, FrameError, MllpReader};
pub use names::{hl7v2_message_name, hl7v2_store_name, parse_hl7v2_message_name, Hl7v2MessageName};
