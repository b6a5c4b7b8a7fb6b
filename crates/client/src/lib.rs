//! Rulefed client - the participant side of a federation
//!
//! A client bootstraps once to obtain its identity and training parameters,
//! then alternates between submitting a locally mined rule model and pulling
//! the merged global model:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rulefed_client::FederationClient;
//! use rulefed_core::{BincodeCodec, ClientConfig, RuleModel};
//!
//! # async fn example(local: RuleModel) -> rulefed_core::Result<()> {
//! let client = FederationClient::new(&ClientConfig::default(), Arc::new(BincodeCodec))?;
//! let bootstrap = client.bootstrap().await?;
//! let mut known = bootstrap.current_version;
//!
//! for _ in 0..bootstrap.training.rounds {
//!     client.submit(&local, local.sample_size, Duration::from_secs(3)).await?;
//!     let global = client
//!         .await_update(known, Duration::from_millis(500), Duration::from_secs(60))
//!         .await?;
//!     known = global.version;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod retry;

pub use client::FederationClient;
