//! Core type definitions for federated rule-model rounds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use crate::{Error, Result};

/// Unique identifier types
pub type ClientId = String;
pub type RoundNumber = u64;
pub type ModelVersion = u64;

/// Largest sample size a single submission may claim
pub const MAX_SAMPLE_SIZE: u64 = 1 << 40;

/// A single `attribute=value` condition of a rule antecedent
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Item {
    /// Column name
    pub attribute: String,

    /// Value the column must take
    pub value: String,
}

impl Item {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute, self.value)
    }
}

/// Identity of a rule: canonical antecedent plus consequent
///
/// Two rules are the same rule iff their keys are equal. The antecedent is
/// kept in sorted order, so the insertion order of conditions never matters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey {
    pub antecedent: Vec<Item>,
    pub consequent: String,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.antecedent.iter().map(|i| i.to_string()).collect();
        write!(f, "{{{}}} => {}", items.join(","), self.consequent)
    }
}

/// A classification rule `antecedent => consequent` with its statistics
///
/// Support and confidence are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Conditions that must all hold
    pub antecedent: BTreeSet<Item>,

    /// Predicted label value
    pub consequent: String,

    /// Population frequency of the pattern
    pub support: f64,

    /// Conditional accuracy of the rule given its antecedent holds
    pub confidence: f64,
}

impl Rule {
    /// Create a new rule from its conditions and statistics
    pub fn new<I>(antecedent: I, consequent: impl Into<String>, support: f64, confidence: f64) -> Self
    where
        I: IntoIterator<Item = Item>,
    {
        Self {
            antecedent: antecedent.into_iter().collect(),
            consequent: consequent.into(),
            support,
            confidence,
        }
    }

    /// Antecedent cardinality, used as the last prediction-priority criterion
    pub fn len(&self) -> usize {
        self.antecedent.len()
    }

    /// Whether the rule has no conditions (a default rule)
    pub fn is_empty(&self) -> bool {
        self.antecedent.is_empty()
    }

    /// Identity key of this rule
    pub fn key(&self) -> RuleKey {
        RuleKey {
            antecedent: self.antecedent.iter().cloned().collect(),
            consequent: self.consequent.clone(),
        }
    }

    /// Estimated number of records the pattern was observed in
    pub fn frequency(&self, sample_size: u64) -> f64 {
        self.support * sample_size as f64
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (sup={:.4}, conf={:.4})",
            self.key(),
            self.support,
            self.confidence
        )
    }
}

/// An ordered rule set plus the sample size its statistics come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleModel {
    /// Column the rules predict
    pub target_label: String,

    /// Rules in prediction-priority order
    pub rules: Vec<Rule>,

    /// Number of training records behind the statistics
    pub sample_size: u64,
}

impl RuleModel {
    /// Create a new model
    pub fn new(target_label: impl Into<String>, rules: Vec<Rule>, sample_size: u64) -> Self {
        Self {
            target_label: target_label.into(),
            rules,
            sample_size,
        }
    }

    /// An empty model for a target label
    pub fn empty(target_label: impl Into<String>) -> Self {
        Self::new(target_label, Vec::new(), 0)
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the model has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check the model invariants: unique identity keys and statistics in `[0, 1]`
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.rules.len());
        for rule in &self.rules {
            for (name, value) in [("support", rule.support), ("confidence", rule.confidence)] {
                if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                    return Err(Error::InvalidSubmission {
                        message: format!("rule {} has {} {} outside [0, 1]", rule.key(), name, value),
                    });
                }
            }
            if !seen.insert(rule.key()) {
                return Err(Error::InvalidSubmission {
                    message: format!("duplicate rule {}", rule.key()),
                });
            }
        }
        Ok(())
    }
}

/// A client's local model for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSubmission {
    /// Submitting client, unique within a round
    pub client_id: ClientId,

    /// Round the model was trained for
    pub round_number: RoundNumber,

    /// Number of local training records
    pub sample_size: u64,

    /// Local training time, informational only
    #[serde(with = "duration_secs")]
    pub elapsed_training_time: Duration,

    /// Locally trained rules
    pub payload: RuleModel,
}

/// Round lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoundStatus {
    /// Open for submissions
    Collecting,

    /// Quorum reached, merge and publish in flight
    Aggregating,

    /// Merged model published
    Published,

    /// Publish retries exhausted; the prior global model stays authoritative
    Failed,

    /// Deadline expired and the partial round was dropped
    Discarded,
}

impl RoundStatus {
    /// Returns true if the round accepts submissions
    pub fn is_open(&self) -> bool {
        matches!(self, RoundStatus::Collecting)
    }

    /// Returns true if the round will not change anymore without operator action
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundStatus::Published | RoundStatus::Failed | RoundStatus::Discarded
        )
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundStatus::Collecting => "collecting",
            RoundStatus::Aggregating => "aggregating",
            RoundStatus::Published => "published",
            RoundStatus::Failed => "failed",
            RoundStatus::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// One client's contribution to a round, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub client_id: ClientId,
    pub sample_size: u64,
    pub elapsed_secs: f64,
}

/// Audit record of a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    /// Round number
    pub round_number: RoundNumber,

    /// Current status
    pub status: RoundStatus,

    /// Submissions required before aggregation
    pub quorum: usize,

    /// Accepted contributions, in arrival order
    pub contributions: Vec<Contribution>,

    /// When the round opened
    pub opened_at: DateTime<Utc>,

    /// When the round stopped collecting
    pub closed_at: Option<DateTime<Utc>>,

    /// Global model version this round produced
    pub published_version: Option<ModelVersion>,

    /// Last aggregation error, if any
    pub last_error: Option<String>,
}

impl RoundSummary {
    /// Total sample size contributed by all clients
    pub fn contributed_samples(&self) -> u64 {
        self.contributions.iter().map(|c| c.sample_size).sum()
    }
}

/// The published, versioned global model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    /// Strictly increasing, 0 means no model yet
    pub version: ModelVersion,

    /// Merged rules, absent at version 0
    pub model: Option<RuleModel>,

    /// Cumulative sample size behind the statistics
    pub total_sample_size: u64,

    /// Publish timestamp
    pub published_at: Option<DateTime<Utc>>,
}

impl GlobalModel {
    /// The "no model yet" state
    pub fn initial() -> Self {
        Self {
            version: 0,
            model: None,
            total_sample_size: 0,
            published_at: None,
        }
    }

    /// Returns true once a model has been published
    pub fn has_model(&self) -> bool {
        self.version > 0 && self.model.is_some()
    }
}

impl Default for GlobalModel {
    fn default() -> Self {
        Self::initial()
    }
}

/// Fractional seconds for informational durations
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
