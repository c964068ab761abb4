//! Error types for the collection client.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error payload reported by the server (`{code, message, data}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ServerError {
    /// Decode a server error payload, falling back to a generic message when
    /// the payload has an unexpected shape.
    pub fn from_payload(payload: serde_json::Value) -> Self {
        match serde_json::from_value::<ServerError>(payload.clone()) {
            Ok(err) => err,
            Err(_) => ServerError {
                code: 0,
                message: "malformed error payload".to_string(),
                data: payload,
            },
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or connection failure. Never retried internally.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server rejected the filter, collection or query shape.
    #[error("Query error: {0}")]
    Query(ServerError),

    /// Wait-for deadline exceeded. The caller may re-issue the request.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A subscription callback failed. Reported to the error sink only.
    #[error("Callback error: {0}")]
    Callback(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The server sent a reply that does not fit the request.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The client was torn down while the call was outstanding.
    #[error("Client closed")]
    Closed,
}

impl ClientError {
    /// Whether the caller may reasonably re-issue the same request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
