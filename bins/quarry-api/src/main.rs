mod handlers;
mod metrics;
mod routes;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use quarry_common::config::QuarryConfig;
use quarry_engine::Pipeline;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub struct AppState {
    pub pipeline: Pipeline,
}

pub fn app(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::routes())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Quarry API booting...");

    let config = QuarryConfig::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        anyhow::anyhow!(e)
    })?;

    let pipeline = quarry_engine::build_pipeline(&config).map_err(|e| {
        error!("Failed to build pipeline: {:#}", e);
        e
    })?;

    info!(
        upload_root = %config.upload_root.display(),
        sandbox = ?config.sandbox,
        model = %config.gemini.model,
        max_retries = config.max_retries,
        "Pipeline configured"
    );

    metrics::register();

    let state = Arc::new(AppState { pipeline });
    let app = app(state, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
