// Transport capability consumed by the protocol engine

use crate::error::TransportError;
use crate::protocol::ServerMessage;
use std::sync::Arc;

/// Outbound half of a bidirectional connection (a WebSocket, a test double, ...)
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send one protocol message to the peer
    async fn send(&self, message: ServerMessage) -> Result<(), TransportError>;

    /// Close the connection with the given close code
    async fn close(&self, code: u16) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn close(&self, code: u16) -> Result<(), TransportError> {
        (**self).close(code).await
    }
}
