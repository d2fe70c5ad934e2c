pub mod schema;

pub use schema::*;

use async_graphql::{ObjectType, Request, Schema, SubscriptionType, Variables};
use futures::StreamExt;
use gqlws_core::{Engine, EngineError, ResultStream, SubscribeRequest};
use serde_json::Value;

/// Engine over the demo schema
pub type DemoEngine = SchemaEngine<Query, Mutation, Subscription>;

/// Runs graphql-ws operations against an async-graphql schema
pub struct SchemaEngine<Q, M, S> {
    schema: Schema<Q, M, S>,
}

impl<Q, M, S> SchemaEngine<Q, M, S> {
    pub fn new(schema: Schema<Q, M, S>) -> Self {
        Self { schema }
    }
}

// Schema is an Arc internally; derive would needlessly require Q/M/S: Clone
impl<Q, M, S> Clone for SchemaEngine<Q, M, S> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
        }
    }
}

impl<Q, M, S> Engine for SchemaEngine<Q, M, S>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
    S: SubscriptionType + 'static,
{
    fn subscribe(&self, request: SubscribeRequest) -> Result<ResultStream, EngineError> {
        let SubscribeRequest {
            query,
            variables,
            operation_name,
            context,
        } = request;

        let mut graphql_request = Request::new(query).data(context);
        if let Some(variables) = variables {
            graphql_request = graphql_request.variables(Variables::from_json(Value::Object(variables)));
        }
        if let Some(operation_name) = operation_name {
            graphql_request = graphql_request.operation_name(operation_name);
        }

        let stream = self
            .schema
            .execute_stream(graphql_request)
            .map(|response| serde_json::to_value(response).map_err(|e| EngineError::Execution(e.into())));

        Ok(stream.boxed())
    }
}
