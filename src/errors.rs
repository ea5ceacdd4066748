//! Error taxonomy for the transfer engine.
//!
//! Every failure path maps onto one `TransferError` variant so callers can
//! tell transient exhaustion, semantic API errors, integrity failures and
//! local misuse apart by matching on the variant.

use reqwest::StatusCode;
use serde::Deserialize;
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Error type reported by the API server for a non-2xx response.
///
/// The server answers with `{"error": {"type": "...", "message": "..."}}`;
/// bodies that are not JSON (e.g. a proxy's plain-text 503 page) keep the
/// raw text as the message and use the status reason as the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: msg.into(),
        }
    }

    /// Build an error from a response status and body.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => Self::new(status, envelope.error.error_type, envelope.error.message),
            Err(_) => Self::new(
                status,
                status.canonical_reason().unwrap_or("HTTPError"),
                String::from_utf8_lossy(body).trim().to_string(),
            ),
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// True for the 422 returned when a nonce is replayed with a different body.
    pub fn is_nonce_reuse(&self) -> bool {
        self.status == StatusCode::UNPROCESSABLE_ENTITY
            && self.error_type == "InvalidInput"
            && self.message.to_ascii_lowercase().contains("nonce was reused")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Failure below the HTTP layer: no usable response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("network error: {0}")]
    Network(#[from] TransportError),

    #[error("maximum number of retries reached, or unsafe to retry ({attempts} attempts): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransferError>,
    },

    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("`{0}` set more than once")]
    SetMoreThanOnce(&'static str),

    #[error("checksum mismatch for bytes {start}..{end}: expected {expected}, got {actual}")]
    Integrity {
        start: u64,
        end: u64,
        expected: String,
        actual: String,
    },

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    /// Transient failures are the ones the executor may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Network(_) => true,
            TransferError::Api(api) => api.status.is_server_error(),
            _ => false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, TransferError::RetriesExhausted { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, TransferError::Integrity { .. })
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Protocol(err.to_string())
    }
}

impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(inner) => inner,
            TransferError::Integrity { .. } => io::Error::new(io::ErrorKind::InvalidData, err),
            TransferError::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            TransferError::DeadlineExceeded { .. } => {
                io::Error::new(io::ErrorKind::TimedOut, err)
            }
            other => io::Error::other(other),
        }
    }
}
