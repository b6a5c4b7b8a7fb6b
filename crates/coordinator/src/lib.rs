//! Coordinator server for federated rule-model training
//!
//! This crate provides the central server that:
//! - **Rounds**: collects one model per client per round and fires
//!   aggregation exactly once when quorum is reached
//! - **Pipeline**: merges, publishes and distributes on a single task, so
//!   global model versions follow round order
//! - **Distribution**: pushes every published version to listeners and
//!   answers client pulls
//! - **Security**: rate limiting, input validation, request metrics
//!
//! # Example
//!
//! ```no_run
//! use coordinator::CoordinatorServer;
//! use rulefed_core::FederationConfig;
//!
//! #[tokio::main]
//! async fn main() -> rulefed_core::Result<()> {
//!     let config = FederationConfig::default();
//!     CoordinatorServer::from_config(&config).await?.run().await
//! }
//! ```

pub mod distribution;
pub mod http_api;
pub mod middleware;
pub mod round;
pub mod server;
pub mod service;

pub use distribution::{DistributionChannel, HttpPushListener, PublishListener, PullResponse};
pub use http_api::{create_router, ApiState, AppState};
pub use server::{build_coordinator, shutdown_signal, CoordinatorServer};
pub use service::{
    Aggregator, CoordinatorBuilder, RoundCoordinator, RoundCoordinatorHandle, RuleMergeAggregator,
    ROUND_HISTORY_PATH,
};
