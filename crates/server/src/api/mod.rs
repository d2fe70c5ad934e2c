use crate::config::{AppState, ServerConfig};
use crate::graphql::DogFeed;
use crate::websocket;
use anyhow::Result;
use axum::{response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Start the subscription server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config);
    let dog_feed = state.dog_feed.clone();

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Subscription server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(dog_feed))
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C after ending the dog feed, so its subscribers complete
async fn shutdown_signal(dog_feed: DogFeed) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutting down, ending the dog feed for {} listeners", dog_feed.listeners());
    dog_feed.close();
}

/// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/subscriptions", get(websocket::ws_handler))
        .route("/health", get(health_check))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "gqlws",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
