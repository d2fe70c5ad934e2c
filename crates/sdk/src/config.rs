//! Configuration types for the gqlws SDK.

use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Configuration for the graphql-ws client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint of the server (`ws`, `wss`, `http` or `https`).
    pub url: Url,
    /// Payload of the `connection_init` message.
    pub connection_params: Option<Value>,
    /// How long to wait for `connection_ack`.
    pub ack_timeout: Duration,
    /// Buffered events per subscription.
    pub channel_capacity: usize,
}

impl ClientConfig {
    /// Create a new configuration with the given endpoint.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connection_params: None,
            ack_timeout: Duration::from_secs(10),
            channel_capacity: 64,
        }
    }

    /// Parse the endpoint and create a configuration.
    pub fn parse(url: &str) -> ClientResult<Self> {
        Ok(Self::new(Url::parse(url)?))
    }

    /// Set the `connection_init` payload.
    pub fn with_connection_params(mut self, params: Value) -> Self {
        self.connection_params = Some(params);
        self
    }

    /// Set the acknowledgement timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the per-subscription event buffer.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// The endpoint with an HTTP scheme mapped to its WebSocket counterpart.
    pub fn websocket_url(&self) -> ClientResult<Url> {
        let scheme = match self.url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ClientError::Config(format!(
                    "Unsupported URL scheme: {}",
                    other
                )))
            }
        };

        let mut url = self.url.clone();
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config("Failed to set WebSocket scheme".to_string()))?;
        Ok(url)
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        if self.channel_capacity == 0 {
            return Err(ClientError::Config(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        self.websocket_url().map(|_| ())
    }
}
