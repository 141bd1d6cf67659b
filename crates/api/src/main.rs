//! Relay API server binary entrypoint.

use std::net::SocketAddr;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use relay_common::config::AppConfig;
use relay_common::db::{create_pool, run_migrations};
use relay_common::redis_pool::create_redis_pool;

use relay_api::routes::create_router;
use relay_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("relay_api=debug,relay_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Relay API server...");

    let config = AppConfig::from_env()?;
    if config.jwt_secret.is_none() {
        anyhow::bail!("JWT_SECRET environment variable is required by the API");
    }
    if config.receipt_api_key.is_none() {
        tracing::warn!("RECEIPT_API_KEY not set, POST /api/receipts will reject every request");
    }

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created");

    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let state = AppState::new(pool, redis, config);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    Ok(())
}
