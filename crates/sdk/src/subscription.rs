//! Event stream of a single graphql-ws operation.

use crate::error::{ClientError, ClientResult};
use crate::transport::encode;
use futures_util::{Stream, StreamExt};
use gqlws_core::ClientMessage;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;

/// Event senders of the running operations, keyed by operation id.
pub(crate) type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<SubscriptionEvent>>>>;

pub(crate) fn lock_routes(
    routes: &Routes,
) -> MutexGuard<'_, HashMap<String, mpsc::Sender<SubscriptionEvent>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Events delivered for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// One execution result (`{"data": ..., "errors": [...]}`).
    Data(Value),
    /// The operation failed; no further events follow.
    Error(String),
    /// The server finished the operation; no further events follow.
    Complete,
}

/// A running operation.
///
/// Yields [`SubscriptionEvent`]s until the operation completes, fails, or the
/// connection closes. Dropping it stops the operation on the server.
pub struct Subscription {
    id: String,
    events: ReceiverStream<SubscriptionEvent>,
    outbound: mpsc::Sender<Message>,
    routes: Routes,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        events: mpsc::Receiver<SubscriptionEvent>,
        outbound: mpsc::Sender<Message>,
        routes: Routes,
    ) -> Self {
        Self {
            id,
            events: ReceiverStream::new(events),
            outbound,
            routes,
        }
    }

    /// The operation id used on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the next event.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.next().await
    }

    /// Stop the operation. The server sends nothing further for it.
    pub async fn stop(self) -> ClientResult<()> {
        lock_routes(&self.routes).remove(&self.id);

        let frame = encode(&ClientMessage::stop(self.id.clone()))?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Still routed means the server has not finished it
        if lock_routes(&self.routes).remove(&self.id).is_some() {
            if let Ok(frame) = encode(&ClientMessage::stop(self.id.clone())) {
                let _ = self.outbound.try_send(frame);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
