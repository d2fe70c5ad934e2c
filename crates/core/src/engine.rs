// Execution engine capability consumed by the protocol engine

use crate::context::{merge_context, Context, ContextPrecedence};
use crate::error::{EngineError, StartError};
use crate::protocol::StartPayload;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Asynchronous sequence of result items (`{"data": ..., "errors": [...]}`)
pub type ResultStream = BoxStream<'static, Result<Value, EngineError>>;

/// Everything the engine needs to run one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub query: String,
    pub variables: Option<Map<String, Value>>,
    pub operation_name: Option<String>,
    pub context: Context,
}

impl SubscribeRequest {
    /// Validate a `start` payload and merge its context with the connection's
    pub fn from_start(
        payload: StartPayload,
        connection_context: &Context,
        precedence: ContextPrecedence,
    ) -> Result<Self, StartError> {
        let query = payload
            .query
            .filter(|query| !query.trim().is_empty())
            .ok_or(StartError::MissingQuery)?;

        Ok(Self {
            query,
            variables: payload.variables,
            operation_name: payload.operation_name,
            context: merge_context(connection_context, payload.context, precedence),
        })
    }
}

/// GraphQL execution engine
///
/// `subscribe` must not block: it returns a lazy stream and all work happens
/// while the stream is polled. Dropping the stream releases its resources.
pub trait Engine: Send + Sync {
    fn subscribe(&self, request: SubscribeRequest) -> Result<ResultStream, EngineError>;
}

impl<E: Engine + ?Sized> Engine for Arc<E> {
    fn subscribe(&self, request: SubscribeRequest) -> Result<ResultStream, EngineError> {
        (**self).subscribe(request)
    }
}
