//! Example: Follow the demo server's dog feed.
//!
//! Start the server first (`cargo run -p gqlws-server`), then run with:
//! cargo run --example dog_feed
//!
//! Dogs announced through `mutation { addDog(...) }` show up here.

use gqlws_sdk::{ClientResult, GraphQLWsClient, StartPayload, SubscriptionEvent};
use serde_json::json;

#[tokio::main]
async fn main() -> ClientResult<()> {
    tracing_subscriber::fmt::init();

    println!("Connecting to graphql-ws server...");
    let client = GraphQLWsClient::builder()
        .url("ws://localhost:8080/subscriptions")
        .connection_params(json!({"client": "dog_feed example"}))
        .connect()
        .await?;

    let greeting = client
        .subscribe(StartPayload::new("query Greeting($name: String) { hello(name: $name) }")
            .with_variables(json!({"name": "dog lover"}).as_object().cloned().unwrap_or_default()))
        .await?;
    print_events("hello", greeting).await;

    let dogs = client
        .subscribe(
            StartPayload::new("subscription DogAdded { dogAdded { id name nickname } }")
                .with_operation_name("DogAdded"),
        )
        .await?;

    println!("\nListening for dogs (Ctrl+C to stop)...\n");
    print_events("dogAdded", dogs).await;

    client.terminate().await?;
    println!("Connection closed with code {}", client.closed().await);

    Ok(())
}

async fn print_events(label: &str, mut subscription: gqlws_sdk::Subscription) {
    while let Some(event) = subscription.next_event().await {
        match event {
            SubscriptionEvent::Data(payload) => println!("[{}] {}", label, payload),
            SubscriptionEvent::Error(message) => {
                println!("[{}] error: {}", label, message);
                break;
            }
            SubscriptionEvent::Complete => {
                println!("[{}] complete", label);
                break;
            }
        }
    }
}
