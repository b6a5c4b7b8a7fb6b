//! JSON bodies exchanged between clients, coordinator and downstream servers
//!
//! Model payloads travel base64-encoded; the bytes underneath are the output
//! of the codec named next to them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientId, Error, ModelVersion, Result, RoundNumber, TrainingParams};

/// Base64-encode a payload
pub fn encode_payload(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decode a base64 payload; failures are reported as [`Error::DecodeFailure`]
pub fn decode_payload(encoded: &str, client_id: Option<&str>) -> Result<Bytes> {
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| Error::DecodeFailure {
            client_id: client_id.map(str::to_string),
            reason: format!("invalid base64 payload: {}", e),
        })
}

/// Answer to a client's first connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapResponse {
    /// Identity the client uses for all of its submissions
    pub client_id: ClientId,

    /// Local dataset the client is expected to train on
    pub dataset: String,

    pub open_round: RoundNumber,
    pub quorum: usize,
    pub current_version: ModelVersion,
    pub training: TrainingParams,
}

/// A client's model for one round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitRequest {
    pub client_id: ClientId,
    pub round_number: RoundNumber,
    pub sample_size: u64,
    pub elapsed_secs: f64,

    /// Base64 of the codec output
    pub model: String,
}

/// Acknowledgement of an accepted submission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub round_number: RoundNumber,

    /// Submissions collected in the round, this one included
    pub received: usize,
    pub quorum: usize,

    /// This submission closed the round
    pub quorum_reached: bool,
}

/// A published global model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEnvelope {
    pub version: ModelVersion,
    pub total_sample_size: u64,
    pub codec: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Base64 of the codec output
    pub model: String,
}

impl ModelEnvelope {
    pub fn new(version: ModelVersion, total_sample_size: u64, codec: &str, payload: &[u8]) -> Self {
        Self {
            version,
            total_sample_size,
            codec: codec.to_string(),
            published_at: None,
            model: encode_payload(payload),
        }
    }

    pub fn published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }

    pub fn payload(&self) -> Result<Bytes> {
        decode_payload(&self.model, None)
    }
}

/// Error body returned by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// [`Error::kind`] of the underlying error
    pub error: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_number: Option<RoundNumber>,

    /// Round that is open right now, on stale submissions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_round: Option<RoundNumber>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorBody {
    pub fn from_error(error: &Error) -> Self {
        let mut body = Self {
            error: error.kind().to_string(),
            message: error.to_string(),
            client_id: None,
            round_number: None,
            open_round: None,
            retry_after_ms: None,
        };

        match error {
            Error::DuplicateSubmission {
                client_id,
                round_number,
            } => {
                body.client_id = Some(client_id.clone());
                body.round_number = Some(*round_number);
            }
            Error::StaleSubmission {
                submitted_round,
                open_round,
            } => {
                body.round_number = Some(*submitted_round);
                body.open_round = Some(*open_round);
            }
            Error::DecodeFailure { client_id, .. } => {
                body.client_id = client_id.clone();
            }
            Error::RoundNotFound { round_number } | Error::RoundNotRetryable { round_number, .. } => {
                body.round_number = Some(*round_number);
            }
            Error::RateLimited { retry_after_ms } => {
                body.retry_after_ms = Some(*retry_after_ms);
            }
            _ => {}
        }
        body
    }

    /// Rebuild the typed error on the client side
    ///
    /// Kinds a client cannot act on come back as [`Error::TransportFailure`]
    /// carrying the server's message.
    pub fn into_error(self, endpoint: &str) -> Error {
        match self.error.as_str() {
            "duplicate_submission" => Error::DuplicateSubmission {
                client_id: self.client_id.unwrap_or_default(),
                round_number: self.round_number.unwrap_or_default(),
            },
            "stale_submission" => Error::StaleSubmission {
                submitted_round: self.round_number.unwrap_or_default(),
                open_round: self.open_round.unwrap_or_default(),
            },
            "decode_failure" => Error::DecodeFailure {
                client_id: self.client_id,
                reason: self.message,
            },
            "invalid_submission" => Error::InvalidSubmission {
                message: self.message,
            },
            "round_not_found" => Error::RoundNotFound {
                round_number: self.round_number.unwrap_or_default(),
            },
            "rate_limited" => Error::RateLimited {
                retry_after_ms: self.retry_after_ms.unwrap_or(1000),
            },
            _ => Error::TransportFailure {
                endpoint: endpoint.to_string(),
                message: self.message,
            },
        }
    }
}
