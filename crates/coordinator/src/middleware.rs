//! Request guards for the HTTP surface
//!
//! Per-client rate limiting, submission input validation and per-endpoint
//! request metrics.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use rulefed_core::{Error, Result, MAX_SAMPLE_SIZE};
use serde::Serialize;
use tracing::debug;

const IDLE_BUCKET_TTL: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket per client id
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
    last_cleanup: Mutex<Instant>,
}

impl RateLimiter {
    /// `rate` tokens per second, at most `burst` stored
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate: rate.max(1) as f64,
            burst: burst.max(1) as f64,
            buckets: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Take one token for `client_id`
    pub fn check(&self, client_id: &str) -> Result<()> {
        self.maybe_cleanup();
        let now = Instant::now();

        let entry = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.burst,
                    refilled_at: now,
                })
            });
        let mut bucket = entry.value().lock();

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        Err(Error::RateLimited {
            retry_after_ms: ((missing / self.rate) * 1000.0).ceil() as u64,
        })
    }

    fn maybe_cleanup(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_cleanup.lock();
            if now.duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
            *last = now;
        }

        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.get_mut().refilled_at) < IDLE_BUCKET_TTL);
        debug!(remaining = self.buckets.len(), "Rate limiter cleanup completed");
    }
}

/// Field checks on incoming submissions
pub struct InputValidator {
    max_client_id_len: usize,
    max_payload_bytes: usize,
    client_id_pattern: Regex,
}

impl InputValidator {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self {
            max_client_id_len: 128,
            max_payload_bytes,
            // alphanumeric, hyphens, underscores, dots
            client_id_pattern: Regex::new(r"^[A-Za-z0-9_\-\.]+$").expect("valid client id pattern"),
        }
    }

    pub fn validate_client_id(&self, client_id: &str) -> Result<()> {
        if client_id.is_empty() {
            return Err(invalid("client id cannot be empty"));
        }
        if client_id.len() > self.max_client_id_len {
            return Err(invalid(format!(
                "client id exceeds {} characters",
                self.max_client_id_len
            )));
        }
        if !self.client_id_pattern.is_match(client_id) {
            return Err(invalid(
                "client id may only contain alphanumerics, hyphens, underscores and dots",
            ));
        }
        Ok(())
    }

    pub fn validate_sample_size(&self, sample_size: u64) -> Result<()> {
        if sample_size == 0 {
            return Err(invalid("sample size must be positive"));
        }
        if sample_size > MAX_SAMPLE_SIZE {
            return Err(invalid(format!("sample size exceeds {}", MAX_SAMPLE_SIZE)));
        }
        Ok(())
    }

    pub fn validate_elapsed(&self, elapsed_secs: f64) -> Result<()> {
        if !elapsed_secs.is_finite() || elapsed_secs < 0.0 {
            return Err(invalid("elapsed training time must be a non-negative number"));
        }
        Ok(())
    }

    /// Check an encoded payload before decoding it
    pub fn validate_payload_len(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(invalid("model payload is empty"));
        }
        if len > self.max_payload_bytes {
            return Err(invalid(format!(
                "model payload of {} bytes exceeds limit of {}",
                len, self.max_payload_bytes
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidSubmission {
        message: message.into(),
    }
}

#[derive(Default)]
struct EndpointStats {
    requests: AtomicU64,
    errors: AtomicU64,
    latencies_us: Mutex<VecDeque<u64>>,
}

/// Snapshot of one endpoint's counters
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub p99_latency_us: Option<u64>,
}

/// Request, error and latency counters per endpoint
pub struct RequestMetrics {
    endpoints: DashMap<String, EndpointStats>,
    max_samples: usize,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            max_samples: 1000,
        }
    }

    /// Record one finished request
    pub fn record(&self, endpoint: &str, latency: Duration, failed: bool) {
        let stats = self.endpoints.entry(endpoint.to_string()).or_default();
        stats.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }

        let mut samples = stats.latencies_us.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(latency.as_micros() as u64);
    }

    pub fn request_count(&self, endpoint: &str) -> u64 {
        self.endpoints
            .get(endpoint)
            .map(|s| s.requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self, endpoint: &str) -> u64 {
        self.endpoints
            .get(endpoint)
            .map(|s| s.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn p99(samples: &VecDeque<u64>) -> Option<u64> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * 0.99) as usize).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    pub fn snapshot(&self) -> BTreeMap<String, EndpointSnapshot> {
        self.endpoints
            .iter()
            .map(|entry| {
                let stats = entry.value();
                let snapshot = EndpointSnapshot {
                    requests: stats.requests.load(Ordering::Relaxed),
                    errors: stats.errors.load(Ordering::Relaxed),
                    p99_latency_us: Self::p99(&stats.latencies_us.lock()),
                };
                (entry.key().clone(), snapshot)
            })
            .collect()
    }
}
