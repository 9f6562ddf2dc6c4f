use thiserror::Error;

use crate::framing::FrameError;

/// Errors shared across the adapter crates.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The HTTP request never produced a response (DNS, TLS, timeouts).
    #[error("request failed: {0}")]
    Http(String),

    /// The remote API answered with a non-success status and no usable
    /// payload.
    #[error("request failed: status {status}\n{body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid resource name: {0}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
