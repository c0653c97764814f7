use anyhow::anyhow;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ordervox::{AppState, ServerConfig, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Load configuration
    let config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();

    // Create application state (menu, session manager, telephony bridge)
    let app_state = AppState::new(config)?;
    let app = routes::create_app(app_state.clone());

    let listener = TcpListener::bind(&address).await?;
    info!("ordervox listening on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cancel reapers and tear down every live session before exiting
    app_state.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("Shutdown signal received");
}
