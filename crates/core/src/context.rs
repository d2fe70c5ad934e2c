// Execution context shared with every operation of a connection

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Arbitrary key/value data handed to the execution engine
pub type Context = Map<String, Value>;

/// Which side wins when connection and operation context share a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPrecedence {
    #[default]
    Connection,
    Operation,
}

/// Merge the connection-level context with the context sent in a `start` payload
pub fn merge_context(
    connection: &Context,
    operation: Option<Context>,
    precedence: ContextPrecedence,
) -> Context {
    let Some(operation) = operation else {
        return connection.clone();
    };

    match precedence {
        ContextPrecedence::Connection => {
            let mut merged = operation;
            merged.extend(connection.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        }
        ContextPrecedence::Operation => {
            let mut merged = connection.clone();
            merged.extend(operation);
            merged
        }
    }
}

/// Per-connection settings of the protocol engine
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Merged into every operation's execution context
    pub context: Context,
    pub context_precedence: ContextPrecedence,
    /// Interval of `ka` messages after the ack; `None` disables them
    pub keep_alive: Option<Duration>,
}

impl ConnectionConfig {
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_context_precedence(mut self, precedence: ContextPrecedence) -> Self {
        self.context_precedence = precedence;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }
}
