// Protocol engine: one instance per client connection

use crate::context::ConnectionConfig;
use crate::engine::{Engine, SubscribeRequest};
use crate::error::StartError;
use crate::protocol::{ClientMessage, Inbound, ServerMessage, StartPayload, CLOSE_INTERNAL_ERROR};
use crate::scheduler::Scheduler;
use crate::subscription::Subscription;
use crate::transport::Transport;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Client-facing message for any engine failure; details only go to the log
const INTERNAL_ERROR: &str = "Internal error";

/// Drives the graphql-ws protocol for a single connection.
///
/// The host feeds it inbound messages through [`Connection::on_receive`] and
/// reports the end of the connection through [`Connection::on_disconnect`].
/// Everything outbound goes through the [`Transport`]. Inbound messages are
/// handled in arrival order; only result delivery runs on the [`Scheduler`],
/// so `on_receive` never waits on an operation's stream.
pub struct Connection<T, E, S> {
    transport: T,
    engine: E,
    scheduler: S,
    config: ConnectionConfig,
    operations: Mutex<HashMap<String, Arc<Subscription>>>,
    closing: AtomicBool,
    closed: CancellationToken,
    keep_alive_started: AtomicBool,
}

impl<T, E, S> Connection<T, E, S>
where
    T: Transport + 'static,
    E: Engine + 'static,
    S: Scheduler + 'static,
{
    pub fn new(transport: T, engine: E, scheduler: S, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            engine,
            scheduler,
            config,
            operations: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            keep_alive_started: AtomicBool::new(false),
        })
    }

    /// Handle one inbound message (raw text or pre-parsed JSON).
    ///
    /// Returns once the message has taken effect: a `stop` that follows a
    /// `start` always finds the operation registered. Results of a started
    /// operation are delivered by a scheduled task.
    pub async fn on_receive(self: &Arc<Self>, message: impl Into<Inbound>) {
        if self.is_closed() {
            tracing::debug!("Ignoring message received after close");
            return;
        }

        let message = match ClientMessage::decode(message.into()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Rejected inbound message: {}", e);
                self.send(ServerMessage::error(None, e.to_string())).await;
                return;
            }
        };

        self.dispatch(message).await;
    }

    /// The underlying connection is gone: stop every operation and cancel
    /// outstanding work. No further messages are processed afterwards.
    pub async fn on_disconnect(&self, close_code: u16) {
        tracing::info!("Connection closed with code {}", close_code);
        self.closing.store(true, Ordering::SeqCst);
        self.closed.cancel();

        let ids: Vec<String> = self.operations.lock().await.keys().cloned().collect();
        for id in &ids {
            self.unsubscribe(id).await;
        }
        if !ids.is_empty() {
            tracing::debug!("Stopped {} operations on disconnect", ids.len());
        }

        self.scheduler.cancel_all();
    }

    /// True once a close has begun, by either side
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed, by either side. A close the
    /// engine initiates has been handed to the transport by then.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Ids of the operations currently registered, sorted
    pub async fn active_operations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.operations.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn dispatch(self: &Arc<Self>, message: ClientMessage) {
        match message {
            ClientMessage::ConnectionInit { id, .. } => self.on_connection_init(id).await,
            ClientMessage::Start { id, payload } => self.on_start(id, payload).await,
            ClientMessage::Stop { id } => {
                if let Some(id) = id {
                    tracing::debug!("Stop requested for operation {}", id);
                    self.unsubscribe(&id).await;
                }
            }
            ClientMessage::ConnectionTerminate => {
                tracing::info!("Client requested connection termination");
                self.close(CLOSE_INTERNAL_ERROR).await;
            }
            ClientMessage::Unsupported { id, kind } => {
                let kind = kind.as_deref().unwrap_or("<missing>");
                tracing::warn!("Unsupported message type: {}", kind);
                self.send(ServerMessage::error(id, format!("Unsupported message type: {}", kind)))
                    .await;
            }
        }
    }

    async fn on_connection_init(self: &Arc<Self>, id: Option<String>) {
        if let Err(e) = self.transport.send(ServerMessage::ConnectionAck).await {
            tracing::error!("Failed to acknowledge connection: {}", e);
            self.send(ServerMessage::connection_error(id, e.to_string())).await;
            self.close(CLOSE_INTERNAL_ERROR).await;
            return;
        }

        if let Some(period) = self.config.keep_alive.filter(|period| !period.is_zero()) {
            if !self.keep_alive_started.swap(true, Ordering::SeqCst) {
                self.start_keep_alive(period);
            }
        }
    }

    async fn on_start(self: &Arc<Self>, id: Option<String>, payload: Option<Value>) {
        let Some(id) = id else {
            tracing::warn!("Rejected start message without an operation id");
            self.send(ServerMessage::error(None, "Operation id is required")).await;
            return;
        };

        // A start for a known id replaces the running operation
        if self.operations.lock().await.contains_key(&id) {
            tracing::debug!("Replacing operation {}", id);
            self.unsubscribe(&id).await;
        }

        let request = StartPayload::from_value(payload)
            .map_err(StartError::from)
            .and_then(|payload| {
                SubscribeRequest::from_start(
                    payload,
                    &self.config.context,
                    self.config.context_precedence,
                )
            });

        match request {
            Ok(request) => self.subscribe(id, request).await,
            Err(e) => {
                tracing::warn!("Rejected operation {}: {}", id, e);
                self.send(ServerMessage::error(Some(id), e.to_string())).await;
            }
        }
    }

    /// Register the operation and schedule delivery of its results
    async fn subscribe(self: &Arc<Self>, id: String, request: SubscribeRequest) {
        let stream = match self.engine.subscribe(request) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to start operation {}: {}", id, e);
                self.send(ServerMessage::error(Some(id), INTERNAL_ERROR)).await;
                return;
            }
        };

        let subscription = Arc::new(Subscription::new(id.clone(), stream));
        let previous = {
            let mut operations = self.operations.lock().await;
            if self.is_closed() {
                tracing::debug!("Dropping operation {} started after close", id);
                return;
            }
            operations.insert(id.clone(), Arc::clone(&subscription))
        };
        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::info!("Started operation {}", id);

        let connection = Arc::clone(self);
        let task = async move { connection.forward(id, subscription).await };
        self.scheduler
            .schedule(Box::pin(task.instrument(tracing::Span::current())));
    }

    /// Send results until the operation ends or is stopped
    async fn forward(&self, id: String, subscription: Arc<Subscription>) {
        while let Some(item) = subscription.next().await {
            if self.is_closed() || !self.is_current(&id, &subscription).await {
                return;
            }

            let payload = match item {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("Operation {} failed: {}", id, e);
                    self.send(ServerMessage::error(Some(id.clone()), INTERNAL_ERROR))
                        .await;
                    self.remove_if_current(&id, &subscription).await;
                    return;
                }
            };

            if let Err(e) = self.transport.send(ServerMessage::data(id.clone(), payload)).await {
                tracing::warn!("Failed to deliver result of operation {}: {}", id, e);
                self.remove_if_current(&id, &subscription).await;
                return;
            }
        }

        // Stopped, replaced or disconnected: the client is not told
        if subscription.is_closed() {
            tracing::debug!("Operation {} stopped", id);
            return;
        }

        self.send(ServerMessage::complete(id.clone())).await;
        self.remove_if_current(&id, &subscription).await;
        tracing::info!("Completed operation {}", id);
    }

    fn start_keep_alive(self: &Arc<Self>, period: Duration) {
        let connection = Arc::clone(self);
        let task = async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = connection.closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = connection.transport.send(ServerMessage::KeepAlive).await {
                    tracing::debug!("Stopping keep-alive: {}", e);
                    break;
                }
            }
        };
        self.scheduler
            .schedule(Box::pin(task.instrument(tracing::Span::current())));
    }

    /// Remove and close the operation. Unknown ids are ignored.
    async fn unsubscribe(&self, id: &str) {
        let removed = self.operations.lock().await.remove(id);
        if let Some(subscription) = removed {
            subscription.close().await;
        }
    }

    async fn is_current(&self, id: &str, subscription: &Arc<Subscription>) -> bool {
        self.operations
            .lock()
            .await
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, subscription))
    }

    async fn remove_if_current(&self, id: &str, subscription: &Arc<Subscription>) {
        {
            let mut operations = self.operations.lock().await;
            if operations
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, subscription))
            {
                operations.remove(id);
            }
        }
        subscription.close().await;
    }

    async fn close(&self, code: u16) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.close(code).await {
            tracing::warn!("Failed to close transport: {}", e);
        }
        self.closed.cancel();
    }

    async fn send(&self, message: ServerMessage) {
        let kind = message.kind();
        if let Err(e) = self.transport.send(message).await {
            tracing::warn!("Failed to send {} message: {}", kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResultStream;
    use crate::error::{EngineError, TransportError};
    use crate::scheduler::TokioScheduler;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const DOGS: &str = "subscription { dogAdded { id name } }";
    const CATS: &str = "subscription { catAdded { id name } }";

    #[derive(Debug, Clone, PartialEq)]
    enum Outbound {
        Message(ServerMessage),
        Close(u16),
    }

    struct RecordingTransport {
        sent: mpsc::UnboundedSender<Outbound>,
        failing_sends: AtomicUsize,
        slow_close: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
            let failing = self
                .failing_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(TransportError::Other(anyhow::anyhow!("socket write failed")));
            }
            self.sent
                .send(Outbound::Message(message))
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&self, code: u16) -> Result<(), TransportError> {
            // Like a socket whose outbound buffer is full
            if self.slow_close.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.sent
                .send(Outbound::Close(code))
                .map_err(|_| TransportError::Closed)
        }
    }

    /// Engine handing out pre-scripted streams, keyed by query text
    #[derive(Default)]
    struct ScriptedEngine {
        streams: std::sync::Mutex<HashMap<String, ResultStream>>,
        requests: std::sync::Mutex<Vec<SubscribeRequest>>,
        refuse: AtomicBool,
    }

    impl ScriptedEngine {
        fn script(&self, query: &str) -> Feed {
            let (feed, stream) = feed();
            self.streams.lock().unwrap().insert(query.to_string(), stream);
            feed
        }

        fn requests(&self) -> Vec<SubscribeRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Engine for ScriptedEngine {
        fn subscribe(&self, request: SubscribeRequest) -> Result<ResultStream, EngineError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.refuse.load(Ordering::SeqCst) {
                return Err(EngineError::InvalidRequest("schema unavailable".to_string()));
            }
            self.streams
                .lock()
                .unwrap()
                .remove(&request.query)
                .ok_or_else(|| EngineError::InvalidRequest(format!("no stream for {}", request.query)))
        }
    }

    struct Released(Arc<AtomicBool>);

    impl Drop for Released {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Test-controlled result stream
    struct Feed {
        tx: mpsc::UnboundedSender<Result<Value, EngineError>>,
        released: Arc<AtomicBool>,
    }

    impl Feed {
        fn push(&self, value: Value) -> bool {
            self.tx.send(Ok(value)).is_ok()
        }

        fn fail(&self, message: &str) {
            let _ = self.tx.send(Err(EngineError::execution(message)));
        }

        fn end(self) {}

        fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    fn feed() -> (Feed, ResultStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let guard = Released(released.clone());
        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        })
        .boxed();
        (Feed { tx, released }, stream)
    }

    type TestConnection = Connection<Arc<RecordingTransport>, Arc<ScriptedEngine>, TokioScheduler>;

    struct Harness {
        connection: Arc<TestConnection>,
        transport: Arc<RecordingTransport>,
        engine: Arc<ScriptedEngine>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ConnectionConfig::default())
        }

        fn with_config(config: ConnectionConfig) -> Self {
            let (tx, outbound) = mpsc::unbounded_channel();
            let transport = Arc::new(RecordingTransport {
                sent: tx,
                failing_sends: AtomicUsize::new(0),
                slow_close: AtomicBool::new(false),
            });
            let engine = Arc::new(ScriptedEngine::default());
            let connection = Connection::new(
                transport.clone(),
                engine.clone(),
                TokioScheduler::new(),
                config,
            );
            Self {
                connection,
                transport,
                engine,
                outbound,
            }
        }

        async fn receive(&self, message: Value) {
            self.connection.on_receive(message).await;
        }

        async fn start(&self, id: &str, query: &str) {
            self.receive(json!({"id": id, "type": "start", "payload": {"query": query}}))
                .await;
        }

        /// Follow the host: wait for the close, then report the disconnect
        async fn tear_down(&self) {
            tokio::time::timeout(Duration::from_secs(1), self.connection.closed())
                .await
                .expect("connection should be closed");
            self.connection.on_disconnect(CLOSE_INTERNAL_ERROR).await;
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut drained = Vec::new();
            while let Ok(outbound) = self.outbound.try_recv() {
                drained.push(outbound);
            }
            drained
        }

        async fn next(&mut self) -> Outbound {
            tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .expect("timed out waiting for an outbound message")
                .expect("transport dropped")
        }

        async fn next_message(&mut self) -> ServerMessage {
            match self.next().await {
                Outbound::Message(message) => message,
                other => panic!("expected a message, got {:?}", other),
            }
        }

        async fn expect_silence(&mut self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(unexpected) = self.outbound.try_recv() {
                panic!("unexpected outbound: {:?}", unexpected);
            }
        }

        async fn init(&mut self) {
            self.receive(json!({"type": "connection_init"})).await;
            assert_eq!(self.next_message().await, ServerMessage::ConnectionAck);
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn error_message(message: &ServerMessage) -> &str {
        match message {
            ServerMessage::Error { payload, .. } | ServerMessage::ConnectionError { payload, .. } => {
                payload["message"].as_str().unwrap_or_default()
            }
            other => panic!("expected an error message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_init_is_acknowledged() {
        let mut harness = Harness::new();
        harness
            .receive(json!({"type": "connection_init", "payload": {"authToken": "secret"}}))
            .await;

        assert_eq!(harness.next_message().await, ServerMessage::ConnectionAck);
        harness.expect_silence().await;
    }

    #[tokio::test]
    async fn test_malformed_input_reports_error_without_id() {
        let mut harness = Harness::new();

        harness.connection.on_receive("not json").await;
        let message = harness.next_message().await;
        assert_eq!(message.id(), None);
        assert!(error_message(&message).starts_with("Invalid JSON"));

        harness.receive(json!([1, 2, 3])).await;
        let message = harness.next_message().await;
        assert_eq!(error_message(&message), "Message must be a JSON object");
    }

    #[tokio::test]
    async fn test_unsupported_message_type() {
        let mut harness = Harness::new();

        harness.receive(json!({"id": "7", "type": "subscribe"})).await;
        let message = harness.next_message().await;
        assert_eq!(message.id(), Some("7"));
        assert_eq!(error_message(&message), "Unsupported message type: subscribe");

        harness.receive(json!({"id": "8"})).await;
        let message = harness.next_message().await;
        assert_eq!(error_message(&message), "Unsupported message type: <missing>");
    }

    #[tokio::test]
    async fn test_results_then_complete() {
        let mut harness = Harness::new();
        harness.init().await;
        let dogs = harness.engine.script(DOGS);

        harness.start("q1", DOGS).await;
        assert!(dogs.push(json!({"data": {"dogAdded": {"id": 1, "name": "Gaspar"}}})));
        assert_eq!(
            harness.next_message().await,
            ServerMessage::data("q1", json!({"data": {"dogAdded": {"id": 1, "name": "Gaspar"}}}))
        );

        assert!(dogs.push(json!({"data": {"dogAdded": {"id": 2, "name": "Lupita"}}})));
        assert_eq!(
            harness.next_message().await,
            ServerMessage::data("q1", json!({"data": {"dogAdded": {"id": 2, "name": "Lupita"}}}))
        );

        let released = dogs.released.clone();
        dogs.end();
        assert_eq!(harness.next_message().await, ServerMessage::complete("q1"));

        wait_until(|| released.load(Ordering::SeqCst)).await;
        assert!(harness.connection.active_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_operations_are_isolated() {
        let mut harness = Harness::new();
        let dogs = harness.engine.script(DOGS);
        let cats = harness.engine.script(CATS);

        harness.start("q1", DOGS).await;
        harness.start("q2", CATS).await;
        wait_until(|| harness.engine.requests().len() == 2).await;

        assert!(cats.push(json!({"data": {"catAdded": {"id": 1}}})));
        assert_eq!(
            harness.next_message().await,
            ServerMessage::data("q2", json!({"data": {"catAdded": {"id": 1}}}))
        );

        assert!(dogs.push(json!({"data": {"dogAdded": {"id": 1}}})));
        assert_eq!(
            harness.next_message().await,
            ServerMessage::data("q1", json!({"data": {"dogAdded": {"id": 1}}}))
        );

        cats.end();
        assert_eq!(harness.next_message().await, ServerMessage::complete("q2"));
        assert_eq!(harness.connection.active_operations().await, vec!["q1".to_string()]);
        assert!(!dogs.is_released());
    }

    #[tokio::test]
    async fn test_start_replaces_existing_operation() {
        let mut harness = Harness::new();
        let first = harness.engine.script(DOGS);
        let second = harness.engine.script(CATS);

        harness.start("q1", DOGS).await;
        assert!(first.push(json!({"n": 1})));
        assert_eq!(harness.next_message().await, ServerMessage::data("q1", json!({"n": 1})));

        harness.start("q1", CATS).await;
        wait_until(|| first.is_released()).await;

        assert!(second.push(json!({"n": 2})));
        assert_eq!(harness.next_message().await, ServerMessage::data("q1", json!({"n": 2})));
        assert_eq!(harness.connection.active_operations().await, vec!["q1".to_string()]);
        harness.expect_silence().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_operation_is_ignored() {
        let mut harness = Harness::new();

        harness.receive(json!({"id": "ghost", "type": "stop"})).await;
        harness.receive(json!({"type": "stop"})).await;
        harness.expect_silence().await;

        harness.init().await;
    }

    #[tokio::test]
    async fn test_stop_releases_operation_without_complete() {
        let mut harness = Harness::new();
        let dogs = harness.engine.script(DOGS);

        harness.start("q1", DOGS).await;
        assert!(dogs.push(json!({"n": 1})));
        assert_eq!(harness.next_message().await, ServerMessage::data("q1", json!({"n": 1})));

        harness.receive(json!({"id": "q1", "type": "stop"})).await;
        wait_until(|| dogs.is_released()).await;

        assert!(harness.connection.active_operations().await.is_empty());
        assert!(!dogs.push(json!({"n": 2})));
        harness.expect_silence().await;
    }

    #[tokio::test]
    async fn test_disconnect_releases_every_operation() {
        let mut harness = Harness::new();
        let queries = [
            "subscription { a }",
            "subscription { b }",
            "subscription { c }",
        ];
        let feeds: Vec<Feed> = queries.iter().map(|query| harness.engine.script(query)).collect();

        for (i, query) in queries.iter().enumerate() {
            harness.start(&format!("q{}", i), query).await;
        }
        wait_until(|| harness.engine.requests().len() == 3).await;
        for (i, feed) in feeds.iter().enumerate() {
            assert!(feed.push(json!({"n": i})));
            assert_eq!(harness.next_message().await.kind().as_str(), "data");
        }

        harness.connection.on_disconnect(1001).await;

        assert!(feeds.iter().all(Feed::is_released));
        assert!(harness.connection.active_operations().await.is_empty());
        assert!(harness.connection.is_closed());

        harness.receive(json!({"type": "connection_init"})).await;
        harness.expect_silence().await;
    }

    #[tokio::test]
    async fn test_terminate_closes_with_internal_error_code() {
        let mut harness = Harness::new();
        harness.init().await;

        harness.receive(json!({"type": "connection_terminate"})).await;
        assert_eq!(harness.next().await, Outbound::Close(CLOSE_INTERNAL_ERROR));

        tokio::time::timeout(Duration::from_secs(1), harness.connection.closed())
            .await
            .expect("connection should be closed");

        harness.engine.script(DOGS);
        harness.start("q1", DOGS).await;
        harness.expect_silence().await;
        assert!(harness.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_mid_stream() {
        let mut harness = Harness::new();
        let dogs = harness.engine.script(DOGS);

        harness.start("q1", DOGS).await;
        assert!(dogs.push(json!({"n": 1})));
        assert_eq!(harness.next_message().await, ServerMessage::data("q1", json!({"n": 1})));

        dogs.fail("database unreachable");
        let message = harness.next_message().await;
        assert_eq!(message.id(), Some("q1"));
        assert_eq!(error_message(&message), "Internal error");

        wait_until(|| dogs.is_released()).await;
        assert!(harness.connection.active_operations().await.is_empty());

        // Other operations keep working
        let cats = harness.engine.script(CATS);
        harness.start("q2", CATS).await;
        wait_until(|| harness.engine.requests().len() == 2).await;
        assert!(cats.push(json!({"n": 2})));
        assert_eq!(harness.next_message().await, ServerMessage::data("q2", json!({"n": 2})));
    }

    #[tokio::test]
    async fn test_engine_refusal() {
        let mut harness = Harness::new();
        harness.engine.refuse.store(true, Ordering::SeqCst);

        harness.start("q1", DOGS).await;
        let message = harness.next_message().await;
        assert_eq!(message.id(), Some("q1"));
        assert_eq!(error_message(&message), "Internal error");
        assert!(harness.connection.active_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_start_messages() {
        let mut harness = Harness::new();

        harness
            .receive(json!({"id": "q1", "type": "start", "payload": {"variables": {}}}))
            .await;
        let message = harness.next_message().await;
        assert_eq!(message.id(), Some("q1"));
        assert_eq!(error_message(&message), "No GraphQL query found in the start payload");

        harness
            .receive(json!({"type": "start", "payload": {"query": DOGS}}))
            .await;
        let message = harness.next_message().await;
        assert_eq!(message.id(), None);
        assert_eq!(error_message(&message), "Operation id is required");

        harness
            .receive(json!({"id": "q2", "type": "start", "payload": {"query": DOGS, "variables": [1]}}))
            .await;
        let message = harness.next_message().await;
        assert!(error_message(&message).starts_with("Invalid start payload"));

        assert!(harness.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_merged_context() {
        let mut connection_context = crate::context::Context::new();
        connection_context.insert("user".to_string(), json!("jane"));
        let harness = Harness::with_config(ConnectionConfig::default().with_context(connection_context));
        let _dogs = harness.engine.script(DOGS);

        harness
            .receive(json!({
                "id": "q1",
                "type": "start",
                "payload": {
                    "query": DOGS,
                    "variables": {"breed": "corgi"},
                    "operationName": "Dogs",
                    "context": {"user": "mallory", "locale": "fr"}
                }
            }))
            .await;
        wait_until(|| harness.engine.requests().len() == 1).await;

        let request = &harness.engine.requests()[0];
        assert_eq!(request.query, DOGS);
        assert_eq!(request.operation_name.as_deref(), Some("Dogs"));
        assert_eq!(request.variables.as_ref().unwrap()["breed"], json!("corgi"));
        assert_eq!(request.context["user"], json!("jane"));
        assert_eq!(request.context["locale"], json!("fr"));
    }

    #[tokio::test]
    async fn test_failed_ack_closes_connection() {
        let mut harness = Harness::new();
        harness.transport.failing_sends.store(1, Ordering::SeqCst);

        harness
            .receive(json!({"id": "init-1", "type": "connection_init"}))
            .await;

        let message = harness.next_message().await;
        assert_eq!(message.kind().as_str(), "connection_error");
        assert_eq!(message.id(), Some("init-1"));
        assert!(error_message(&message).contains("socket write failed"));
        assert_eq!(harness.next().await, Outbound::Close(CLOSE_INTERNAL_ERROR));
        assert!(harness.connection.is_closed());
    }

    #[tokio::test]
    async fn test_keep_alive_after_ack() {
        let mut harness =
            Harness::with_config(ConnectionConfig::default().with_keep_alive(Duration::from_millis(20)));
        harness.init().await;

        assert_eq!(harness.next_message().await, ServerMessage::KeepAlive);
        assert_eq!(harness.next_message().await, ServerMessage::KeepAlive);

        harness.connection.on_disconnect(1000).await;
        while harness.outbound.try_recv().is_ok() {}
        harness.expect_silence().await;
    }

    #[tokio::test]
    async fn test_terminate_close_outlives_teardown() {
        let mut harness = Harness::new();
        harness.transport.slow_close.store(true, Ordering::SeqCst);
        harness.init().await;

        harness.receive(json!({"type": "connection_terminate"})).await;
        harness.tear_down().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.drain(), vec![Outbound::Close(CLOSE_INTERNAL_ERROR)]);
    }

    #[tokio::test]
    async fn test_failed_ack_close_outlives_teardown() {
        let mut harness = Harness::new();
        harness.transport.failing_sends.store(1, Ordering::SeqCst);
        harness.transport.slow_close.store(true, Ordering::SeqCst);

        harness.receive(json!({"type": "connection_init"})).await;
        harness.tear_down().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outbound = harness.drain();
        assert_eq!(outbound.len(), 2);
        assert!(matches!(&outbound[0], Outbound::Message(ServerMessage::ConnectionError { .. })));
        assert_eq!(outbound[1], Outbound::Close(CLOSE_INTERNAL_ERROR));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_right_after_start() {
        let harness = Harness::new();
        let mut feeds = Vec::new();

        for i in 0..200 {
            let query = format!("subscription {{ feed{} }}", i);
            feeds.push(harness.engine.script(&query));
            let id = format!("q{}", i);
            harness.start(&id, &query).await;
            harness.receive(json!({"id": id, "type": "stop"})).await;
        }

        assert!(harness.connection.active_operations().await.is_empty());
        assert!(feeds.iter().all(Feed::is_released));
        assert_eq!(harness.engine.requests().len(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminate_while_operation_streams() {
        let mut harness = Harness::new();
        harness.transport.slow_close.store(true, Ordering::SeqCst);
        let dogs = harness.engine.script(DOGS);

        harness.start("q1", DOGS).await;
        for n in 0..10 {
            assert!(dogs.push(json!({"n": n})));
        }
        harness.receive(json!({"type": "connection_terminate"})).await;
        harness.tear_down().await;

        assert!(dogs.is_released());
        assert!(harness.connection.active_operations().await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let outbound = harness.drain();
        assert!(outbound.contains(&Outbound::Close(CLOSE_INTERNAL_ERROR)));
        assert!(outbound.iter().all(|outbound| match outbound {
            Outbound::Message(message) => message.kind().as_str() == "data",
            Outbound::Close(code) => *code == CLOSE_INTERNAL_ERROR,
        }));
    }
}
