//! Error types for federated round coordination

use thiserror::Error;

/// Result type alias using the rulefed Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for round coordination, merging and persistence
#[derive(Error, Debug)]
pub enum Error {
    // Submission rejections
    #[error("Duplicate submission: client {client_id} already submitted to round {round_number}")]
    DuplicateSubmission { client_id: String, round_number: u64 },

    #[error("Stale submission: round {submitted_round} is not open (open round is {open_round})")]
    StaleSubmission { submitted_round: u64, open_round: u64 },

    #[error("Failed to decode model payload{}: {reason}", client_suffix(.client_id))]
    DecodeFailure {
        client_id: Option<String>,
        reason: String,
    },

    #[error("Invalid submission: {message}")]
    InvalidSubmission { message: String },

    // Round errors
    #[error("Round not found: {round_number}")]
    RoundNotFound { round_number: u64 },

    #[error("Round {round_number} cannot be retried in state {status}")]
    RoundNotRetryable { round_number: u64, status: String },

    #[error("Nothing to aggregate: no submissions and no prior global model")]
    EmptyRound,

    // Global model store errors
    #[error("Failed to persist global model version {version}: {message}")]
    PersistenceFailure { version: u64, message: String },

    #[error("Global model version not found: {version}")]
    VersionNotFound { version: u64 },

    #[error("Model record corrupted: {path} - {reason}")]
    RecordCorrupted { path: String, reason: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Delivery errors
    #[error("Transport failure talking to {endpoint}: {message}")]
    TransportFailure { endpoint: String, message: String },

    #[error("Outcome unknown for request to {endpoint}: {message}")]
    DeliveryUnknown { endpoint: String, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

fn client_suffix(client_id: &Option<String>) -> String {
    match client_id {
        Some(id) => format!(" from client {}", id),
        None => String::new(),
    }
}

impl Error {
    /// Returns true if the same request may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PersistenceFailure { .. }
                | Error::Storage { .. }
                | Error::TransportFailure { .. }
                | Error::RateLimited { .. }
                | Error::Timeout { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RecordCorrupted { .. } | Error::InvalidConfig { .. } | Error::Internal { .. }
        )
    }

    /// Returns true if this is a rejection of a client submission
    /// (the caller gets a distinguishable status, coordinator state is untouched)
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSubmission { .. }
                | Error::StaleSubmission { .. }
                | Error::DecodeFailure { .. }
                | Error::InvalidSubmission { .. }
                | Error::RateLimited { .. }
        )
    }

    /// Stable machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DuplicateSubmission { .. } => "duplicate_submission",
            Error::StaleSubmission { .. } => "stale_submission",
            Error::DecodeFailure { .. } => "decode_failure",
            Error::InvalidSubmission { .. } => "invalid_submission",
            Error::RoundNotFound { .. } => "round_not_found",
            Error::RoundNotRetryable { .. } => "round_not_retryable",
            Error::EmptyRound => "empty_round",
            Error::PersistenceFailure { .. } => "persistence_failure",
            Error::VersionNotFound { .. } => "version_not_found",
            Error::RecordCorrupted { .. } => "record_corrupted",
            Error::Storage { .. } => "storage",
            Error::StoragePathNotFound { .. } => "storage_path_not_found",
            Error::TransportFailure { .. } => "transport_failure",
            Error::DeliveryUnknown { .. } => "delivery_unknown",
            Error::RateLimited { .. } => "rate_limited",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Internal { .. } => "internal",
            Error::Timeout { .. } => "timeout",
            Error::ChannelClosed { .. } => "channel_closed",
        }
    }

    /// Minimum wait the coordinator asked for before the next attempt
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
