//! Distribution channel: publish fan-out and client pulls

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rulefed_core::{
    Error, GlobalModel, ModelCodecHandle, ModelEnvelope, ModelVersion, Result, RuleModel,
};
use tracing::{debug, info, warn};

use model_store::GlobalModelStoreHandle;

/// Receives every newly published global model
#[async_trait]
pub trait PublishListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver a published version; failures are logged by the caller
    async fn on_publish(&self, model: &GlobalModel, payload: &Bytes) -> Result<()>;
}

/// Answer to a pull request
#[derive(Debug, Clone, PartialEq)]
pub enum PullResponse {
    /// The caller already has the current version
    NoUpdate,

    /// A newer version, encoded with the store's codec
    Update {
        version: ModelVersion,
        total_sample_size: u64,
        published_at: Option<DateTime<Utc>>,
        payload: Bytes,
    },
}

/// Fans published versions out to listeners and serves pulls from the store
pub struct DistributionChannel {
    store: GlobalModelStoreHandle,
    codec: ModelCodecHandle,
    listeners: RwLock<Vec<Arc<dyn PublishListener>>>,
    last_delivered: AtomicU64,

    /// Codec output of the newest version encoded so far
    encoded: RwLock<Option<(ModelVersion, Bytes)>>,
}

impl DistributionChannel {
    pub fn new(store: GlobalModelStoreHandle) -> Self {
        let codec = store.codec().clone();
        let last_delivered = AtomicU64::new(store.version());
        Self {
            store,
            codec,
            listeners: RwLock::new(Vec::new()),
            last_delivered,
            encoded: RwLock::new(None),
        }
    }

    /// Register a listener for all future publishes
    pub fn on_publish(&self, listener: Arc<dyn PublishListener>) {
        info!(listener = listener.name(), "Registered publish listener");
        self.listeners.write().push(listener);
    }

    /// Deliver `model` to every listener, at most once per version
    ///
    /// Returns the number of listeners that accepted the delivery.
    pub async fn notify(&self, model: &GlobalModel) -> usize {
        let previous = self.last_delivered.fetch_max(model.version, Ordering::SeqCst);
        if model.version <= previous {
            debug!(version = model.version, previous, "Version already delivered");
            return 0;
        }

        let Some(rules) = model.model.as_ref() else {
            return 0;
        };
        let payload = match self.encode(model.version, rules) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(version = model.version, error = %e, "Failed to encode model for delivery");
                return 0;
            }
        };

        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        let mut delivered = 0;
        for listener in listeners {
            match listener.on_publish(model, &payload).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(listener = listener.name(), version = model.version, "Delivered");
                }
                Err(e) => {
                    warn!(
                        listener = listener.name(),
                        version = model.version,
                        error = %e,
                        "Publish delivery failed"
                    );
                }
            }
        }
        delivered
    }

    /// Current model if newer than `known_version`
    pub fn pull(&self, known_version: ModelVersion) -> Result<PullResponse> {
        let Some(current) = self.store.since(known_version) else {
            return Ok(PullResponse::NoUpdate);
        };
        let Some(rules) = current.model.as_ref() else {
            return Ok(PullResponse::NoUpdate);
        };

        Ok(PullResponse::Update {
            version: current.version,
            total_sample_size: current.total_sample_size,
            published_at: current.published_at,
            payload: self.encode(current.version, rules)?,
        })
    }

    /// Encoded `rules` of `version`, reusing the last encoding when it matches
    fn encode(&self, version: ModelVersion, rules: &RuleModel) -> Result<Bytes> {
        if let Some((cached, payload)) = self.encoded.read().as_ref() {
            if *cached == version {
                return Ok(payload.clone());
            }
        }

        let payload = self.codec.encode(rules)?;
        let mut slot = self.encoded.write();
        if slot.as_ref().map_or(true, |(cached, _)| *cached < version) {
            *slot = Some((version, payload.clone()));
        }
        Ok(payload)
    }

    pub fn codec(&self) -> &ModelCodecHandle {
        &self.codec
    }
}

/// Pushes every published version to a downstream HTTP endpoint
pub struct HttpPushListener {
    client: reqwest::Client,
    url: String,
    codec: String,
}

impl HttpPushListener {
    pub fn new(url: impl Into<String>, codec: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("cannot build push client: {}", e),
            })?;
        Ok(Self {
            client,
            url: url.into(),
            codec: codec.to_string(),
        })
    }
}

#[async_trait]
impl PublishListener for HttpPushListener {
    fn name(&self) -> &str {
        &self.url
    }

    async fn on_publish(&self, model: &GlobalModel, payload: &Bytes) -> Result<()> {
        let envelope = ModelEnvelope::new(model.version, model.total_sample_size, &self.codec, payload)
            .published_at(model.published_at);
        let transport = |message: String| Error::TransportFailure {
            endpoint: self.url.clone(),
            message,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(transport(format!("downstream answered {}", response.status())));
        }
        Ok(())
    }
}
