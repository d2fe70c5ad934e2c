//! WebSocket transport speaking the graphql-ws subprotocol.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use futures_util::{SinkExt, StreamExt};
use gqlws_core::{ClientMessage, ServerMessage, SUBPROTOCOL};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

pub(crate) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer closed without a status.
pub(crate) const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub(crate) const CLOSE_ABNORMAL: u16 = 1006;

/// Open the socket and run the `connection_init` / `connection_ack` handshake.
pub(crate) async fn handshake(config: &ClientConfig) -> ClientResult<Socket> {
    let url = config.websocket_url()?;
    debug!(url = %url, "Connecting to graphql-ws server");

    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let (mut socket, response) = connect_async(request).await?;
    let selected = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|protocol| protocol.to_str().ok());
    if selected != Some(SUBPROTOCOL) {
        warn!("Server did not select the {} subprotocol", SUBPROTOCOL);
    }

    let init = ClientMessage::ConnectionInit {
        id: None,
        payload: config.connection_params.clone(),
    };
    socket.send(encode(&init)?).await?;

    match tokio::time::timeout(config.ack_timeout, await_ack(&mut socket)).await {
        Ok(result) => result.map(|()| socket),
        Err(_) => Err(ClientError::Timeout),
    }
}

async fn await_ack(socket: &mut Socket) -> ClientResult<()> {
    while let Some(frame) = socket.next().await {
        let Some(message) = decode(frame?)? else {
            continue;
        };

        match message {
            ServerMessage::ConnectionAck => return Ok(()),
            ServerMessage::KeepAlive => continue,
            ServerMessage::ConnectionError { payload, .. } => {
                return Err(ClientError::ConnectionRejected(error_message(&payload)));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "Unexpected {} message before connection_ack",
                    other.kind()
                )));
            }
        }
    }

    Err(ClientError::Closed)
}

/// Serialize a client message into a text frame.
pub(crate) fn encode(message: &ClientMessage) -> ClientResult<Message> {
    Ok(Message::Text(serde_json::to_string(message)?))
}

/// Decode a frame; control frames yield `None`, a close frame is `Closed`.
pub(crate) fn decode(frame: Message) -> ClientResult<Option<ServerMessage>> {
    match frame {
        Message::Text(text) => Ok(Some(serde_json::from_str(&text)?)),
        Message::Binary(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Message::Close(_) => Err(ClientError::Closed),
        _ => Ok(None),
    }
}

/// The `message` field of an error payload, or the whole payload.
pub(crate) fn error_message(payload: &serde_json::Value) -> String {
    match payload.get("message").and_then(|message| message.as_str()) {
        Some(message) => message.to_string(),
        None => payload.to_string(),
    }
}
