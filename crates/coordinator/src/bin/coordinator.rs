//! Coordinator binary entry point
//!
//! Starts the federation coordinator HTTP server. An optional first argument
//! names a JSON configuration file; otherwise defaults apply.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::CoordinatorServer;
use rulefed_core::FederationConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coordinator=info,model_store=info,rule_merge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => FederationConfig::from_json_file(&path)?,
        None => FederationConfig::default(),
    };

    tracing::info!(
        bind = %config.coordinator.bind_address,
        port = config.coordinator.port,
        quorum = config.coordinator.quorum,
        store = %config.store.base_path,
        "Starting coordinator"
    );

    let server = CoordinatorServer::from_config(&config).await?;
    server.run().await?;

    Ok(())
}
