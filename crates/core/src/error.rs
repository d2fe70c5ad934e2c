// Error types for the protocol engine and its capabilities

/// Failure of the transport capability
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is gone or the transport was already closed
    #[error("transport closed")]
    Closed,

    /// An outbound message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Failure of the execution engine, either when subscribing or mid-stream
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl EngineError {
    pub fn execution(message: impl std::fmt::Display) -> Self {
        Self::Execution(anyhow::anyhow!("{}", message))
    }
}

/// An inbound (or, client side, outbound) message that is not a protocol message
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message of type {0} requires an operation id")]
    MissingId(String),

    #[error("Unexpected message type: {0}")]
    UnexpectedMessage(String),
}

/// A `start` message that cannot be turned into an engine request
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Invalid start payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("No GraphQL query found in the start payload")]
    MissingQuery,
}
