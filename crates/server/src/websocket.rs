use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use gqlws_core::{
    Connection, ServerMessage, TokioScheduler, Transport, TransportError, CLOSE_INTERNAL_ERROR,
    SUBPROTOCOL,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::AppState;

/// Outbound frames buffered per connection before `send` waits
const OUTBOUND_BUFFER: usize = 64;
/// How long queued frames may take to flush after the connection ends
const WRITER_DRAIN: Duration = Duration::from_secs(5);

const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

/// WebSocket handler for graphql-ws subscriptions
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Sends protocol messages through the connection's writer task
pub struct WebSocketTransport {
    outbound: mpsc::Sender<Message>,
}

impl WebSocketTransport {
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self { outbound }
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(&message)?;
        tracing::debug!("Sending {} message", message.kind());
        self.outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, code: u16) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(""),
        };
        self.outbound
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let span = tracing::info_span!("connection", id = %uuid::Uuid::new_v4());
    serve_connection(socket, state).instrument(span).await
}

async fn serve_connection(socket: WebSocket, state: Arc<AppState>) {
    tracing::info!("WebSocket connection opened");

    let (sink, mut stream) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_outbound(sink, outbound_rx).in_current_span());

    let connection = Connection::new(
        WebSocketTransport::new(outbound),
        state.engine.clone(),
        TokioScheduler::new(),
        state.connection.clone(),
    );

    let close_code = loop {
        let frame = tokio::select! {
            _ = connection.closed() => break CLOSE_INTERNAL_ERROR,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                tracing::debug!("Received WS message: {}", text.as_str());
                connection.on_receive(text.as_str().to_owned()).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                connection
                    .on_receive(String::from_utf8_lossy(&bytes).into_owned())
                    .await;
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or(CLOSE_NO_STATUS, |frame| frame.code);
            }
            // Ping/pong is answered by axum
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!("WebSocket error: {}", e);
                break CLOSE_ABNORMAL;
            }
            None => break CLOSE_ABNORMAL,
        }
    };

    connection.on_disconnect(close_code).await;
    drop(connection);
    drop(stream);

    let writer_abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        tracing::debug!("Outbound frames not flushed in time");
        writer_abort.abort();
    }

    tracing::info!("WebSocket connection terminated");
}

/// Owns the socket sink; ends after a close frame or once every sender is gone
async fn write_outbound(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!("Failed to send WebSocket message: {}", e);
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
