//! Causerie hub daemon
//!
//! Binds the broadcast hub and runs until interrupted. The listen port
//! comes from the first CLI argument or `CAUSERIE_PORT` (default 8080).

use causerie_net::{Hub, DEFAULT_PORT};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port = listen_port();
    tracing::info!(port = port, "Starting Causerie hub");

    let hub = match Hub::start(port).await {
        Ok(hub) => hub,
        Err(e) => {
            tracing::error!("Failed to start hub: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %hub.addr(), "Hub listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down");
    hub.shutdown();
}

/// Listen port from the first CLI argument or `CAUSERIE_PORT`.
fn listen_port() -> u16 {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CAUSERIE_PORT").ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}
