// Operation runner: one closable result stream per operation id

use crate::engine::ResultStream;
use crate::error::EngineError;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// An in-flight subscription operation.
///
/// Wraps the engine's result stream so that one task can iterate it while
/// another closes it. Closing wakes a pending [`Subscription::next`], which
/// then returns `None`, and drops the underlying stream.
pub struct Subscription {
    id: String,
    stream: Mutex<Option<ResultStream>>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(id: impl Into<String>, stream: ResultStream) -> Self {
        Self {
            id: id.into(),
            stream: Mutex::new(Some(stream)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next result item, in the order the engine produced them.
    ///
    /// Returns `None` once the stream is exhausted or the subscription closed;
    /// either way the stream has been released by then.
    pub async fn next(&self) -> Option<Result<Value, EngineError>> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut()?;

        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = stream.next() => item,
        };

        if item.is_none() {
            guard.take();
        }
        item
    }

    /// Stop iteration and release the stream. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        // Waits for a concurrent `next` to observe the cancellation
        self.stream.lock().await.take();
    }

    /// Whether [`Subscription::close`] was called
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
