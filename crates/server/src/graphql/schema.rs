use async_graphql::{Context, Json, Object, Result, Schema, SimpleObject, Subscription};
use futures::Stream;
use gqlws_core::Context as RequestContext;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// A dog announced on the feed
#[derive(Debug, Clone, PartialEq, SimpleObject)]
pub struct Dog {
    pub id: i32,
    pub name: String,
    pub nickname: Option<String>,
}

/// In-process publisher behind `Subscription.dogAdded`.
///
/// Publishing `None` ends the stream of every current listener.
#[derive(Clone)]
pub struct DogFeed {
    sender: broadcast::Sender<Option<Dog>>,
}

impl DogFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Announce a dog; returns the number of listeners reached
    pub fn publish(&self, dog: Dog) -> usize {
        self.sender.send(Some(dog)).unwrap_or(0)
    }

    /// End every listener's stream
    pub fn close(&self) -> usize {
        self.sender.send(None).unwrap_or(0)
    }

    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }

    fn listen(&self) -> broadcast::Receiver<Option<Dog>> {
        self.sender.subscribe()
    }
}

impl Default for DogFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Query root
pub struct Query;

#[Object]
impl Query {
    /// Greet someone, or a stranger
    async fn hello(&self, name: Option<String>) -> String {
        format!("Hello {}", name.as_deref().unwrap_or("stranger"))
    }
}

/// Mutation root
pub struct Mutation;

#[Object]
impl Mutation {
    /// Announce a dog to every `dogAdded` subscriber
    async fn add_dog(
        &self,
        ctx: &Context<'_>,
        id: i32,
        name: String,
        nickname: Option<String>,
    ) -> Result<Dog> {
        let dog = Dog { id, name, nickname };
        let listeners = ctx.data::<DogFeed>()?.publish(dog.clone());
        tracing::debug!("Dog {} announced to {} listeners", dog.id, listeners);
        Ok(dog)
    }
}

/// Subscription root
pub struct Subscription;

#[Subscription]
impl Subscription {
    /// Dogs as they are announced, until the feed is closed
    async fn dog_added(&self, ctx: &Context<'_>) -> Result<impl Stream<Item = Dog>> {
        let mut receiver = ctx.data::<DogFeed>()?.listen();

        Ok(async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(Some(dog)) => yield dog,
                    Ok(None) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("dogAdded listener skipped {} dogs", skipped);
                    }
                }
            }
        })
    }

    /// Counts down from `from` to 1, one value per interval
    async fn countdown(
        &self,
        from: i32,
        #[graphql(default = 1000)] interval_ms: u64,
    ) -> impl Stream<Item = i32> {
        let interval = Duration::from_millis(interval_ms);

        async_stream::stream! {
            for value in (1..=from).rev() {
                if value != from {
                    tokio::time::sleep(interval).await;
                }
                yield value;
            }
        }
    }

    /// Emits the execution context entry for `key` once
    async fn context_value(
        &self,
        ctx: &Context<'_>,
        key: String,
    ) -> impl Stream<Item = Option<Json<Value>>> {
        let value = ctx
            .data_opt::<RequestContext>()
            .and_then(|context| context.get(&key))
            .cloned()
            .map(Json);

        futures::stream::once(async move { value })
    }
}

pub type DemoSchema = Schema<Query, Mutation, Subscription>;

/// Build the demo schema
pub fn build_schema(feed: DogFeed) -> DemoSchema {
    Schema::build(Query, Mutation, Subscription)
        .data(feed)
        .finish()
}
