use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod graphql;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "gqlws")]
#[command(about = "GraphQL subscriptions over the graphql-ws WebSocket protocol", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "GQLWS_CONFIG", default_value = "gqlws.toml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "GQLWS_PORT", default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "GQLWS_HOST", default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gqlws_server=info,gqlws_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting gqlws subscription server");

    // Load configuration
    let config = ServerConfig::load(&args.config)?;

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await?;

    Ok(())
}
