// graphql-ws protocol types and definitions (legacy subscriptions-transport-ws)

use crate::context::Context;
use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// WebSocket subprotocol advertised during the handshake
pub const SUBPROTOCOL: &str = "graphql-ws";

/// Close code used for handshake failures and `connection_terminate`
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Message kinds of the protocol, in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Client -> Server
    ConnectionInit,
    Start,
    Stop,
    ConnectionTerminate,
    // Server -> Client
    ConnectionAck,
    ConnectionError,
    Data,
    Error,
    Complete,
    KeepAlive,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ConnectionTerminate => "connection_terminate",
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionError => "connection_error",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::KeepAlive => "ka",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            "connection_init" => Self::ConnectionInit,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "connection_terminate" => Self::ConnectionTerminate,
            "connection_ack" => Self::ConnectionAck,
            "connection_error" => Self::ConnectionError,
            "data" => Self::Data,
            "error" => Self::Error,
            "complete" => Self::Complete,
            "ka" => Self::KeepAlive,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope shared by both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationMessage {
    fn new(id: Option<String>, kind: MessageType, payload: Option<Value>) -> Self {
        Self {
            id,
            kind: kind.as_str().to_string(),
            payload,
        }
    }
}

/// A message received from the transport, either still encoded or already decoded
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Json(Value),
}

impl From<String> for Inbound {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Inbound {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Inbound {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Client -> Server messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "OperationMessage")]
pub enum ClientMessage {
    ConnectionInit {
        id: Option<String>,
        payload: Option<Value>,
    },
    Start {
        id: Option<String>,
        payload: Option<Value>,
    },
    Stop {
        id: Option<String>,
    },
    ConnectionTerminate,
    /// Anything whose `type` is missing or not a client kind
    Unsupported {
        id: Option<String>,
        kind: Option<String>,
    },
}

impl ClientMessage {
    /// Decode an inbound message. Only malformed input is an error; unknown
    /// kinds decode to [`ClientMessage::Unsupported`].
    pub fn decode(inbound: Inbound) -> Result<Self, DecodeError> {
        let value = match inbound {
            Inbound::Text(text) => serde_json::from_str(&text)?,
            Inbound::Json(value) => value,
        };

        match value {
            Value::Object(object) => Ok(Self::from_object(object)),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    fn from_object(mut object: Map<String, Value>) -> Self {
        let id = match object.remove("id") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => Some(kind),
            _ => None,
        };
        let payload = object.remove("payload").filter(|payload| !payload.is_null());

        match kind.as_deref().and_then(MessageType::parse) {
            Some(MessageType::ConnectionInit) => Self::ConnectionInit { id, payload },
            Some(MessageType::Start) => Self::Start { id, payload },
            Some(MessageType::Stop) => Self::Stop { id },
            Some(MessageType::ConnectionTerminate) => Self::ConnectionTerminate,
            _ => Self::Unsupported { id, kind },
        }
    }

    /// Build a `start` message from its typed payload
    pub fn start(id: impl Into<String>, payload: &StartPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::Start {
            id: Some(id.into()),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Build a `stop` message
    pub fn stop(id: impl Into<String>) -> Self {
        Self::Stop {
            id: Some(id.into()),
        }
    }
}

impl From<ClientMessage> for OperationMessage {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::ConnectionInit { id, payload } => {
                OperationMessage::new(id, MessageType::ConnectionInit, payload)
            }
            ClientMessage::Start { id, payload } => {
                OperationMessage::new(id, MessageType::Start, payload)
            }
            ClientMessage::Stop { id } => OperationMessage::new(id, MessageType::Stop, None),
            ClientMessage::ConnectionTerminate => {
                OperationMessage::new(None, MessageType::ConnectionTerminate, None)
            }
            ClientMessage::Unsupported { id, kind } => OperationMessage {
                id,
                kind: kind.unwrap_or_default(),
                payload: None,
            },
        }
    }
}

/// Server -> Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "OperationMessage", try_from = "OperationMessage")]
pub enum ServerMessage {
    ConnectionAck,
    ConnectionError { id: Option<String>, payload: Value },
    Data { id: String, payload: Value },
    Error { id: Option<String>, payload: Value },
    Complete { id: String },
    KeepAlive,
}

impl ServerMessage {
    pub fn connection_error(id: Option<String>, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            id,
            payload: error_payload(message),
        }
    }

    pub fn data(id: impl Into<String>, payload: Value) -> Self {
        Self::Data {
            id: id.into(),
            payload,
        }
    }

    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            payload: error_payload(message),
        }
    }

    pub fn complete(id: impl Into<String>) -> Self {
        Self::Complete { id: id.into() }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::ConnectionAck => MessageType::ConnectionAck,
            Self::ConnectionError { .. } => MessageType::ConnectionError,
            Self::Data { .. } => MessageType::Data,
            Self::Error { .. } => MessageType::Error,
            Self::Complete { .. } => MessageType::Complete,
            Self::KeepAlive => MessageType::KeepAlive,
        }
    }

    /// Operation id this message pertains to, if any
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::ConnectionError { id, .. } | Self::Error { id, .. } => id.as_deref(),
            Self::Data { id, .. } | Self::Complete { id } => Some(id),
            Self::ConnectionAck | Self::KeepAlive => None,
        }
    }
}

impl From<ServerMessage> for OperationMessage {
    fn from(message: ServerMessage) -> Self {
        let kind = message.kind();
        match message {
            ServerMessage::ConnectionAck | ServerMessage::KeepAlive => {
                OperationMessage::new(None, kind, None)
            }
            ServerMessage::ConnectionError { id, payload } | ServerMessage::Error { id, payload } => {
                OperationMessage::new(id, kind, Some(payload))
            }
            ServerMessage::Data { id, payload } => OperationMessage::new(Some(id), kind, Some(payload)),
            ServerMessage::Complete { id } => OperationMessage::new(Some(id), kind, None),
        }
    }
}

impl TryFrom<OperationMessage> for ServerMessage {
    type Error = DecodeError;

    fn try_from(message: OperationMessage) -> Result<Self, DecodeError> {
        let OperationMessage { id, kind, payload } = message;
        let missing_id = || DecodeError::MissingId(kind.clone());
        let payload_or_null = |payload: Option<Value>| payload.unwrap_or(Value::Null);

        match MessageType::parse(&kind) {
            Some(MessageType::ConnectionAck) => Ok(ServerMessage::ConnectionAck),
            Some(MessageType::KeepAlive) => Ok(ServerMessage::KeepAlive),
            Some(MessageType::ConnectionError) => Ok(ServerMessage::ConnectionError {
                id,
                payload: payload_or_null(payload),
            }),
            Some(MessageType::Error) => Ok(ServerMessage::Error {
                id,
                payload: payload_or_null(payload),
            }),
            Some(MessageType::Data) => Ok(ServerMessage::Data {
                id: id.ok_or_else(missing_id)?,
                payload: payload_or_null(payload),
            }),
            Some(MessageType::Complete) => Ok(ServerMessage::Complete {
                id: id.ok_or_else(missing_id)?,
            }),
            _ => Err(DecodeError::UnexpectedMessage(kind.clone())),
        }
    }
}

/// Body of every `error` and `connection_error` message
pub fn error_payload(message: impl Into<String>) -> Value {
    json!({ "message": message.into() })
}

/// Payload of a `start` message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(
        default,
        rename = "operationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

impl StartPayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Parse the raw payload of a `start` message; an absent payload is empty
    pub fn from_value(payload: Option<Value>) -> Result<Self, serde_json::Error> {
        match payload {
            Some(payload) => serde_json::from_value(payload),
            None => Ok(Self::default()),
        }
    }
}
