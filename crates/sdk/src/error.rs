//! Error types for the gqlws SDK.

use tokio_tungstenite::tungstenite;

/// Result type for SDK operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Error types that can occur when talking to a graphql-ws server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// WebSocket handshake or I/O failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The server did not acknowledge the connection in time.
    #[error("Timed out waiting for connection_ack")]
    Timeout,

    /// The server answered `connection_init` with `connection_error`.
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// The server sent something the protocol does not allow here.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Check if reconnecting could help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout | Self::Closed)
    }
}
