// Sans-I/O engine for the graphql-ws subscription protocol

pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod subscription;
pub mod transport;

pub use connection::Connection;
pub use context::{merge_context, ConnectionConfig, Context, ContextPrecedence};
pub use engine::{Engine, ResultStream, SubscribeRequest};
pub use error::{DecodeError, EngineError, StartError, TransportError};
pub use protocol::{
    error_payload, ClientMessage, Inbound, MessageType, OperationMessage, ServerMessage,
    StartPayload, CLOSE_INTERNAL_ERROR, SUBPROTOCOL,
};
pub use scheduler::{Scheduler, TokioScheduler};
pub use subscription::Subscription;
pub use transport::Transport;
