//! Federation configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Round coordination settings
    pub coordinator: CoordinatorConfig,

    /// Training parameters handed to clients at bootstrap
    pub training: TrainingParams,

    /// Global model store settings
    pub store: StoreConfig,

    /// Publish fan-out settings
    pub distribution: DistributionConfig,

    /// HTTP surface settings
    pub network: NetworkConfig,

    /// Client-side settings
    pub client: ClientConfig,
}

impl FederationConfig {
    /// Load configuration from a JSON file; missing sections take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: FederationConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!(path = %path.display(), quorum = config.coordinator.quorum, "Loaded configuration");
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.quorum == 0 {
            return Err(Error::InvalidConfig {
                message: "coordinator.quorum must be greater than zero".to_string(),
            });
        }

        if let DeadlinePolicy::AggregatePartial { min_submissions } = self.coordinator.deadline_policy
        {
            if min_submissions == 0 {
                return Err(Error::InvalidConfig {
                    message: "deadline_policy.min_submissions must be greater than zero"
                        .to_string(),
                });
            }
        }

        if self.coordinator.round_deadline == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig {
                message: "coordinator.round_deadline must be non-zero when set".to_string(),
            });
        }

        if self.client.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig {
                message: "retry.backoff_multiplier must be at least 1.0".to_string(),
            });
        }

        Ok(())
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address to bind the HTTP server
    pub bind_address: String,

    /// Port for the HTTP server
    pub port: u16,

    /// Distinct submissions required before a round aggregates
    pub quorum: usize,

    /// Fold order of a round's submissions
    pub merge_order: MergeOrder,

    /// Reject payloads predicting a different column, when set
    pub expected_target_label: Option<String>,

    /// Close a round that has not reached quorum after this long
    #[serde(with = "opt_millis_serde")]
    pub round_deadline: Option<Duration>,

    /// What to do with a round whose deadline expired
    pub deadline_policy: DeadlinePolicy,

    /// How often to check the open round's deadline
    #[serde(with = "millis_serde")]
    pub deadline_check_interval: Duration,

    /// Publish retry policy for the aggregation pipeline
    pub publish_retry: RetryConfig,

    /// Capacity of the aggregation job queue
    pub pipeline_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            quorum: 2,
            merge_order: MergeOrder::default(),
            expected_target_label: None,
            round_deadline: None,
            deadline_policy: DeadlinePolicy::default(),
            deadline_check_interval: Duration::from_secs(1),
            publish_retry: RetryConfig::default(),
            pipeline_capacity: 16,
        }
    }
}

/// Deterministic fold order of a round's submissions
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MergeOrder {
    /// Ascending client id
    #[default]
    ClientIdAscending,

    /// Largest sample first, ties by ascending client id
    SampleSizeDescending,
}

/// Policy for a round whose deadline expired before quorum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeadlinePolicy {
    /// Aggregate whatever arrived if at least `min_submissions` did, else discard
    AggregatePartial { min_submissions: usize },

    /// Drop the partial round and open the next one
    Discard,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        DeadlinePolicy::AggregatePartial { min_submissions: 1 }
    }
}

/// Training parameters for clients
///
/// The coordinator does not interpret these; it hands them out so that all
/// clients of a federation mine rules with the same thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    /// Minimum rule support in `[0, 1]`
    pub min_support: f64,

    /// Minimum rule confidence in `[0, 1]`
    pub min_confidence: f64,

    /// Number of rounds each client participates in
    pub rounds: u64,

    /// Column to predict
    pub target_label: String,

    /// Dataset name template; `{quorum}` and `{client}` are substituted
    pub dataset_template: String,

    /// Columns clients drop before training
    pub dropped_features: Vec<String>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            min_support: 0.2,
            min_confidence: 0.5,
            rounds: 2,
            target_label: "HeartDisease".to_string(),
            dataset_template: "{quorum}_heart_part_{client}.csv".to_string(),
            dropped_features: vec![
                "BMI".to_string(),
                "AlcoholDrinking".to_string(),
                "MentalHealth".to_string(),
                "Asthma".to_string(),
            ],
        }
    }
}

impl TrainingParams {
    /// Dataset name for the n-th bootstrapped client
    pub fn dataset_name(&self, quorum: usize, client_seq: u64) -> String {
        self.dataset_template
            .replace("{quorum}", &quorum.to_string())
            .replace("{client}", &client_seq.to_string())
    }
}

/// Global model store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base path for persisted versions
    pub base_path: String,

    /// Codec used for persisted and served payloads
    pub codec: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: "./federation-data".to_string(),
            codec: "bincode-v1".to_string(),
        }
    }
}

/// Publish fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Downstream endpoint receiving every published version
    pub downstream_url: Option<String>,

    /// Timeout of one push
    #[serde(with = "millis_serde")]
    pub push_timeout: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            downstream_url: None,
            push_timeout: Duration::from_secs(10),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Request timeout
    #[serde(with = "millis_serde")]
    pub request_timeout: Duration,

    /// Maximum decoded model payload size in bytes
    pub max_payload_bytes: usize,

    /// Sustained submissions per second per client
    pub rate_limit_per_sec: u64,

    /// Burst capacity per client
    pub rate_limit_burst: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_payload_bytes: 64 * 1024 * 1024, // 64MB
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Coordinator base URL
    pub coordinator_url: String,

    /// Timeout of one HTTP request
    #[serde(with = "millis_serde")]
    pub request_timeout: Duration,

    /// Transport retry policy
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://localhost:5000".to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "millis_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Duration as milliseconds
mod millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional duration as milliseconds
mod opt_millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
