use crate::graphql::{build_schema, DemoEngine, DogFeed};
use anyhow::{Context as _, Result};
use gqlws_core::{ConnectionConfig, Context, ContextPrecedence};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,

    /// Connection-level context handed to every operation
    #[serde(default)]
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    /// Seconds between `ka` messages; 0 disables keep-alive
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub context_precedence: ContextPrecedence,
}

fn default_keep_alive_secs() -> u64 {
    0
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            context_precedence: ContextPrecedence::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        toml::from_str(&content).context("Failed to parse configuration file")
    }

    /// Settings for each protocol connection
    pub fn connection_config(&self) -> ConnectionConfig {
        let config = ConnectionConfig::default()
            .with_context(self.context.clone())
            .with_context_precedence(self.subscriptions.context_precedence);

        match self.subscriptions.keep_alive_secs {
            0 => config,
            secs => config.with_keep_alive(Duration::from_secs(secs)),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: DemoEngine,
    pub dog_feed: DogFeed,
    pub connection: ConnectionConfig,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let dog_feed = DogFeed::new();
        let engine = DemoEngine::new(build_schema(dog_feed.clone()));

        Self {
            engine,
            dog_feed,
            connection: config.connection_config(),
        }
    }
}
