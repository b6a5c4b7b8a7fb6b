//! HTTP API for federation clients and operators
//!
//! Clients bootstrap, submit models and pull the global model here; operators
//! read round and version history and request retries of failed rounds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rulefed_core::wire::decode_payload;
use rulefed_core::{
    Error, ErrorBody, ModelEnvelope, ModelVersion, NetworkConfig, RoundNumber, SubmitRequest,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};

use crate::distribution::PullResponse;
use crate::middleware::{EndpointSnapshot, InputValidator, RateLimiter, RequestMetrics};
use crate::service::RoundCoordinatorHandle;

/// Shared state for HTTP handlers
pub struct ApiState {
    pub coordinator: RoundCoordinatorHandle,
    pub rate_limiter: RateLimiter,
    pub validator: InputValidator,
    pub metrics: RequestMetrics,
    request_timeout: Duration,
    body_limit: usize,
}

impl ApiState {
    pub fn new(coordinator: RoundCoordinatorHandle, network: &NetworkConfig) -> Self {
        Self {
            coordinator,
            rate_limiter: RateLimiter::new(network.rate_limit_per_sec, network.rate_limit_burst),
            validator: InputValidator::new(network.max_payload_bytes),
            metrics: RequestMetrics::new(),
            request_timeout: network.request_timeout,
            // base64 inflates payloads by 4/3, plus room for the other fields
            body_limit: network.max_payload_bytes / 3 * 4 + 64 * 1024,
        }
    }
}

/// Shared state handle (Arc for thread-safe sharing)
pub type AppState = Arc<ApiState>;

/// Coordinator status for API response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub uptime: u64,
    pub quorum: usize,
    pub open_round: RoundNumber,
    pub received: usize,
    pub current_version: ModelVersion,
    pub queued_rounds: usize,
    pub version: String,
}

/// Request metrics for API response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub uptime: u64,
    pub current_version: ModelVersion,
    pub aggregations_run: u64,
    pub endpoints: BTreeMap<String, EndpointSnapshot>,
}

/// Retry acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub round_number: RoundNumber,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    /// Version the caller already holds
    #[serde(default)]
    pub version: ModelVersion,
}

/// Coordinator error rendered as a JSON body with a distinguishable status
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::DuplicateSubmission { .. } => StatusCode::CONFLICT,
            Error::StaleSubmission { .. } => StatusCode::PRECONDITION_FAILED,
            Error::DecodeFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidSubmission { .. } => StatusCode::BAD_REQUEST,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::RoundNotFound { .. } | Error::VersionNotFound { .. } => StatusCode::NOT_FOUND,
            Error::RoundNotRetryable { .. } => StatusCode::CONFLICT,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_rejection() {
            debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        } else if status.is_server_error() {
            warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the HTTP API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/bootstrap", get(bootstrap))
        .route("/api/submissions", post(submit))
        .route("/api/model", get(get_model))
        .route("/api/rounds", get(get_rounds))
        .route("/api/rounds/current", get(get_current_round))
        .route("/api/rounds/:round_number", get(get_round))
        .route("/api/rounds/:round_number/retry", post(retry_round))
        .route("/api/versions", get(get_versions))
        .route("/api/metrics", get(get_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(DefaultBodyLimit::max(state.body_limit))
        .layer(TimeoutLayer::new(state.request_timeout))
        .layer(cors)
        .with_state(state)
}

/// Record latency and outcome per matched route
async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    state.metrics.record(
        &endpoint,
        start.elapsed(),
        status.is_client_error() || status.is_server_error(),
    );
    response
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Get coordinator status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let received = coordinator
        .open_round()
        .map(|round| round.contributions.len())
        .unwrap_or(0);

    Json(StatusResponse {
        uptime: coordinator.uptime_secs(),
        quorum: coordinator.quorum(),
        open_round: coordinator.open_round_number(),
        received,
        current_version: coordinator.current_version(),
        queued_rounds: coordinator.queued_rounds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Assign a client identity
async fn bootstrap(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.bootstrap())
}

/// Accept one client's model for the open round
async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    state.rate_limiter.check(&request.client_id)?;

    let validator = &state.validator;
    validator.validate_client_id(&request.client_id)?;
    validator.validate_sample_size(request.sample_size)?;
    validator.validate_elapsed(request.elapsed_secs)?;

    let elapsed =
        Duration::try_from_secs_f64(request.elapsed_secs).map_err(|e| Error::InvalidSubmission {
            message: format!("elapsed training time out of range: {}", e),
        })?;
    let payload = decode_payload(&request.model, Some(&request.client_id))?;
    validator.validate_payload_len(payload.len())?;

    debug!(
        client_id = %request.client_id,
        round_number = request.round_number,
        bytes = payload.len(),
        "Submission received"
    );

    let receipt = state
        .coordinator
        .submit_encoded(
            &request.client_id,
            request.round_number,
            request.sample_size,
            elapsed,
            &payload,
        )
        .await?;
    Ok(Json(receipt))
}

/// Current global model if newer than the caller's version
async fn get_model(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
) -> ApiResult<Response> {
    let response = match state.coordinator.pull(query.version)? {
        PullResponse::NoUpdate => StatusCode::NO_CONTENT.into_response(),
        PullResponse::Update {
            version,
            total_sample_size,
            published_at,
            payload,
        } => {
            let codec = state.coordinator.codec().name();
            let envelope = ModelEnvelope::new(version, total_sample_size, codec, &payload)
                .published_at(published_at);
            Json(envelope).into_response()
        }
    };
    Ok(response)
}

/// All round summaries, oldest first
async fn get_rounds(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.rounds())
}

async fn get_current_round(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let coordinator = &state.coordinator;
    coordinator
        .open_round()
        .map(Json)
        .ok_or_else(|| {
            ApiError(Error::RoundNotFound {
                round_number: coordinator.open_round_number(),
            })
        })
}

async fn get_round(
    State(state): State<AppState>,
    Path(round_number): Path<RoundNumber>,
) -> ApiResult<impl IntoResponse> {
    state
        .coordinator
        .round_summary(round_number)
        .map(Json)
        .ok_or(ApiError(Error::RoundNotFound { round_number }))
}

/// Re-queue a failed round for aggregation
async fn retry_round(
    State(state): State<AppState>,
    Path(round_number): Path<RoundNumber>,
) -> ApiResult<impl IntoResponse> {
    state.coordinator.retry_round(round_number).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            round_number,
            status: "aggregating".to_string(),
        }),
    ))
}

/// Published version history
async fn get_versions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.versions().await?))
}

/// Per-endpoint request metrics
async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    Json(MetricsResponse {
        uptime: coordinator.uptime_secs(),
        current_version: coordinator.current_version(),
        aggregations_run: coordinator.aggregations_run(),
        endpoints: state.metrics.snapshot(),
    })
}
