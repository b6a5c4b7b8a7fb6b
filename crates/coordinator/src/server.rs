//! HTTP server wiring and graceful shutdown
//!
//! Assembles storage, global model store, distribution channel and round
//! coordinator from a [`FederationConfig`] and serves the HTTP API until a
//! shutdown signal arrives.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rulefed_core::{codec_by_name, Error, FederationConfig, NetworkConfig, Result};
use storage::{LocalStorage, StorageHandle};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use model_store::GlobalModelStore;

use crate::distribution::{DistributionChannel, HttpPushListener};
use crate::http_api::{self, ApiState};
use crate::service::{CoordinatorBuilder, RoundCoordinatorHandle};

/// Build a running coordinator backed by local storage
pub async fn build_coordinator(config: &FederationConfig) -> Result<RoundCoordinatorHandle> {
    config.validate()?;

    let codec = codec_by_name(&config.store.codec).ok_or_else(|| Error::InvalidConfig {
        message: format!("unknown codec '{}'", config.store.codec),
    })?;
    let backend: StorageHandle = Arc::new(LocalStorage::new(&config.store.base_path));

    let store = Arc::new(GlobalModelStore::open(backend.clone(), codec).await?);
    let distribution = Arc::new(DistributionChannel::new(store.clone()));
    if let Some(url) = &config.distribution.downstream_url {
        let listener = HttpPushListener::new(
            url.clone(),
            store.codec().name(),
            config.distribution.push_timeout,
        )?;
        distribution.on_publish(Arc::new(listener));
    }

    CoordinatorBuilder::new()
        .config(config.coordinator.clone())
        .training(config.training.clone())
        .start(store, distribution, backend)
        .await
}

/// Coordinator HTTP server
pub struct CoordinatorServer {
    addr: SocketAddr,
    coordinator: RoundCoordinatorHandle,
    network: NetworkConfig,
}

impl CoordinatorServer {
    /// Create a server for an already started coordinator
    pub fn new(addr: SocketAddr, coordinator: RoundCoordinatorHandle, network: NetworkConfig) -> Self {
        Self {
            addr,
            coordinator,
            network,
        }
    }

    /// Build the coordinator from configuration and bind to its address
    pub async fn from_config(config: &FederationConfig) -> Result<Self> {
        let addr: SocketAddr = format!(
            "{}:{}",
            config.coordinator.bind_address, config.coordinator.port
        )
        .parse()
        .map_err(|e| Error::InvalidConfig {
            message: format!("invalid bind address: {}", e),
        })?;

        let coordinator = build_coordinator(config).await?;
        Ok(Self::new(addr, coordinator, config.network.clone()))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn coordinator(&self) -> &RoundCoordinatorHandle {
        &self.coordinator
    }

    /// Run the server until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let state = Arc::new(ApiState::new(self.coordinator.clone(), &self.network));
        let router = http_api::create_router(state);

        info!(address = %addr, "Coordinator HTTP API listening");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        self.coordinator.shutdown().await;

        served.map_err(|e| {
            error!(error = %e, "Server error");
            Error::Io(e)
        })?;

        info!("Coordinator server shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
