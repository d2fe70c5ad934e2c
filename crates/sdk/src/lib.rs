//! # gqlws SDK
//!
//! Rust client for servers speaking the legacy `graphql-ws` subscription
//! protocol.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gqlws_sdk::{ClientResult, GraphQLWsClient, StartPayload, SubscriptionEvent};
//!
//! #[tokio::main]
//! async fn main() -> ClientResult<()> {
//!     let client = GraphQLWsClient::builder()
//!         .url("ws://localhost:8080/subscriptions")
//!         .connect()
//!         .await?;
//!
//!     let mut dogs = client
//!         .subscribe(StartPayload::new("subscription { dogAdded { id name } }"))
//!         .await?;
//!
//!     while let Some(event) = dogs.next_event().await {
//!         match event {
//!             SubscriptionEvent::Data(payload) => println!("{}", payload),
//!             SubscriptionEvent::Error(message) => eprintln!("{}", message),
//!             SubscriptionEvent::Complete => break,
//!         }
//!     }
//!
//!     client.terminate().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod subscription;
mod transport;

// Re-export main client
pub use client::{GraphQLWsClient, GraphQLWsClientBuilder};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use subscription::{Subscription, SubscriptionEvent};

// Re-export protocol types for convenience
pub use gqlws_core::{Context, StartPayload, SUBPROTOCOL};
