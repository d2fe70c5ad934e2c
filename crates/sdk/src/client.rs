//! Main client for graphql-ws servers.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::subscription::{lock_routes, Routes, Subscription, SubscriptionEvent};
use crate::transport::{self, encode, error_message, Socket, CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gqlws_core::{ClientMessage, ServerMessage, StartPayload};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

const OUTBOUND_BUFFER: usize = 32;

/// A connection to a graphql-ws server.
///
/// Operations started with [`GraphQLWsClient::subscribe`] share the
/// connection; each gets its own event stream.
pub struct GraphQLWsClient {
    config: Arc<ClientConfig>,
    outbound: mpsc::Sender<Message>,
    routes: Routes,
    next_id: AtomicU64,
    closed: watch::Receiver<Option<u16>>,
}

impl GraphQLWsClient {
    /// Create a new client builder.
    pub fn builder() -> GraphQLWsClientBuilder {
        GraphQLWsClientBuilder::new()
    }

    /// Connect and wait for the server to acknowledge the connection.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let socket = transport::handshake(&config).await?;
        info!("Connected to graphql-ws server");

        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let routes = Routes::default();
        let (closed_tx, closed) = watch::channel(None);

        tokio::spawn(write_outbound(sink, outbound_rx));
        tokio::spawn(read_inbound(stream, routes.clone(), closed_tx));

        Ok(Self {
            config: Arc::new(config),
            outbound,
            routes,
            next_id: AtomicU64::new(1),
            closed,
        })
    }

    /// Start an operation under a fresh id.
    pub async fn subscribe(&self, payload: StartPayload) -> ClientResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let start = ClientMessage::start(id.clone(), &payload)?;
        let (events, events_rx) = mpsc::channel(self.config.channel_capacity);
        lock_routes(&self.routes).insert(id.clone(), events);

        let subscription = Subscription::new(
            id.clone(),
            events_rx,
            self.outbound.clone(),
            self.routes.clone(),
        );
        self.send(&start).await?;

        Ok(subscription)
    }

    /// Ask the server to end the connection.
    pub async fn terminate(&self) -> ClientResult<()> {
        self.send(&ClientMessage::ConnectionTerminate).await
    }

    /// Wait for the connection to close and return the close code.
    pub async fn closed(&self) -> u16 {
        let mut closed = self.closed.clone();
        let code = match closed.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(CLOSE_ABNORMAL),
            Err(_) => CLOSE_ABNORMAL,
        };
        code
    }

    /// Check if the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    async fn send(&self, message: &ClientMessage) -> ClientResult<()> {
        let frame = encode(message)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

async fn write_outbound(mut sink: SplitSink<Socket, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_inbound(
    mut stream: SplitStream<Socket>,
    routes: Routes,
    closed: watch::Sender<Option<u16>>,
) {
    let code = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                break CLOSE_ABNORMAL;
            }
            None => break CLOSE_ABNORMAL,
        };

        if let Message::Close(close) = &frame {
            break close
                .as_ref()
                .map_or(CLOSE_NO_STATUS, |close| u16::from(close.code));
        }

        match transport::decode(frame) {
            Ok(Some(message)) => route(&routes, message).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring undecodable server message"),
        }
    };

    info!(code, "graphql-ws connection closed");
    // Ends every open event stream
    lock_routes(&routes).clear();
    closed.send_replace(Some(code));
}

async fn route(routes: &Routes, message: ServerMessage) {
    let (id, event, last) = match message {
        ServerMessage::Data { id, payload } => (id, SubscriptionEvent::Data(payload), false),
        ServerMessage::Error {
            id: Some(id),
            payload,
        } => (id, SubscriptionEvent::Error(error_message(&payload)), true),
        ServerMessage::Complete { id } => (id, SubscriptionEvent::Complete, true),
        ServerMessage::Error { id: None, payload } => {
            warn!("Server reported an error: {}", error_message(&payload));
            return;
        }
        ServerMessage::KeepAlive => {
            trace!("Received keep-alive");
            return;
        }
        other => {
            debug!("Ignoring {} message", other.kind());
            return;
        }
    };

    let sender = {
        let mut routes = lock_routes(routes);
        if last {
            routes.remove(&id)
        } else {
            routes.get(&id).cloned()
        }
    };

    match sender {
        Some(sender) => {
            if sender.send(event).await.is_err() {
                lock_routes(routes).remove(&id);
            }
        }
        None => debug!(id = %id, "Dropping event for unknown operation"),
    }
}

/// Builder for [`GraphQLWsClient`].
pub struct GraphQLWsClientBuilder {
    url: Option<String>,
    connection_params: Option<Value>,
    ack_timeout: Option<Duration>,
    channel_capacity: Option<usize>,
}

impl GraphQLWsClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            url: None,
            connection_params: None,
            ack_timeout: None,
            channel_capacity: None,
        }
    }

    /// Set the endpoint of the server.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the `connection_init` payload.
    pub fn connection_params(mut self, params: Value) -> Self {
        self.connection_params = Some(params);
        self
    }

    /// Set how long to wait for `connection_ack`.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Set the per-subscription event buffer.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientResult<ClientConfig> {
        let url = self
            .url
            .ok_or_else(|| ClientError::Config("url is required".to_string()))?;

        let mut config = ClientConfig::parse(&url)?;
        config.connection_params = self.connection_params;
        if let Some(timeout) = self.ack_timeout {
            config.ack_timeout = timeout;
        }
        if let Some(capacity) = self.channel_capacity {
            config.channel_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Build the configuration and connect.
    pub async fn connect(self) -> ClientResult<GraphQLWsClient> {
        GraphQLWsClient::connect(self.build()?).await
    }
}

impl Default for GraphQLWsClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
