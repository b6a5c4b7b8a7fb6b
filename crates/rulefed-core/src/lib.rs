//! Rulefed Core - Foundation for federated rule-model coordination
//!
//! Provides the rule model types, the error taxonomy, configuration and
//! the pluggable codec that turns a [`RuleModel`] into wire bytes.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;
pub mod wire;

pub use codec::{codec_by_name, BincodeCodec, JsonCodec, ModelCodec, ModelCodecHandle};
pub use config::{
    ClientConfig, CoordinatorConfig, DeadlinePolicy, DistributionConfig, FederationConfig,
    MergeOrder, NetworkConfig, RetryConfig, StoreConfig, TrainingParams,
};
pub use error::{Error, Result};
pub use types::*;
pub use wire::{BootstrapResponse, ErrorBody, ModelEnvelope, SubmitReceipt, SubmitRequest};
