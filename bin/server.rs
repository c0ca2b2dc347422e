// Stipend Ledger - Web Server
// REST API with Axum

use std::sync::Arc;
use stipend_ledger::api;
use stipend_ledger::{EngineConfig, StipendEngine};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stipend_ledger=info,tower_http=info")),
        )
        .init();

    info!("🌐 Stipend Ledger - Web Server");

    let config = EngineConfig::from_env()?;
    let engine = StipendEngine::open(config)?;
    match engine.current_period() {
        Ok(period) => info!(period = %period.period_ref(), "current pay period"),
        Err(e) => tracing::warn!(error = %e, "no current pay period; balance and request calls will fail until one is set"),
    }

    let app = api::router(Arc::new(engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::env::var("STIPEND_LISTEN").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(%addr, "🚀 server running");
    axum::serve(listener, app).await?;
    Ok(())
}
