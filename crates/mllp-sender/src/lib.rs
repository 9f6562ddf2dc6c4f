//! Outbound half of the adapter: deliver one HL7v2 message to the
//! downstream MLLP peer and collect its reply.

mod sender;

pub use sender::MllpSender;
