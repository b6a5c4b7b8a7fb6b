//! HTTP surface: status codes and bodies for every endpoint

mod common;

use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use rulefed_core::wire::encode_payload;
use rulefed_core::{
    BincodeCodec, BootstrapResponse, ErrorBody, ModelCodec, ModelEnvelope, RoundSummary,
    SubmitReceipt, SubmitRequest,
};
use serde_json::Value;

use common::{config, model, start_coordinator};

fn submission(client_id: &str, round_number: u64, sample_size: u64) -> Result<SubmitRequest> {
    let payload = BincodeCodec.encode(&model("yes", 0.3, 0.8, sample_size))?;
    Ok(SubmitRequest {
        client_id: client_id.to_string(),
        round_number,
        sample_size,
        elapsed_secs: 1.5,
        model: encode_payload(&payload),
    })
}

async fn post_submission(
    http: &reqwest::Client,
    url: &str,
    request: &SubmitRequest,
) -> Result<reqwest::Response> {
    Ok(http
        .post(format!("{}/api/submissions", url))
        .json(request)
        .send()
        .await?)
}

#[tokio::test]
async fn test_health_status_and_bootstrap() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(3, dir.path())).await?;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("{}/api/health", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");

    let status: Value = http
        .get(format!("{}/api/status", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["quorum"], 3);
    assert_eq!(status["open_round"], 1);
    assert_eq!(status["current_version"], 0);

    let boot: BootstrapResponse = http
        .get(format!("{}/api/bootstrap", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(boot.open_round, 1);
    assert_eq!(boot.quorum, 3);
    assert_eq!(boot.training.target_label, "HeartDisease");

    server.stop().await
}

#[tokio::test]
async fn test_submission_rejections_have_distinct_statuses() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(3, dir.path())).await?;
    let http = reqwest::Client::new();

    let accepted = post_submission(&http, &server.url, &submission("hospital-a", 1, 100)?).await?;
    assert_eq!(accepted.status(), StatusCode::OK);
    let receipt: SubmitReceipt = accepted.json().await?;
    assert_eq!(receipt.received, 1);
    assert!(!receipt.quorum_reached);

    let duplicate = post_submission(&http, &server.url, &submission("hospital-a", 1, 100)?).await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body: ErrorBody = duplicate.json().await?;
    assert_eq!(body.error, "duplicate_submission");

    let stale = post_submission(&http, &server.url, &submission("hospital-b", 7, 100)?).await?;
    assert_eq!(stale.status(), StatusCode::PRECONDITION_FAILED);
    let body: ErrorBody = stale.json().await?;
    assert_eq!(body.open_round, Some(1));

    let mut garbage = submission("hospital-c", 1, 100)?;
    garbage.model = encode_payload(b"definitely not a rule model");
    let undecodable = post_submission(&http, &server.url, &garbage).await?;
    assert_eq!(undecodable.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: ErrorBody = undecodable.json().await?;
    assert_eq!(body.client_id.as_deref(), Some("hospital-c"));

    let mut not_base64 = submission("hospital-d", 1, 100)?;
    not_base64.model = "%%%".to_string();
    let response = post_submission(&http, &server.url, &not_base64).await?;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let empty = post_submission(&http, &server.url, &submission("hospital-e", 1, 0)?).await?;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let huge = post_submission(&http, &server.url, &submission("hospital-f", 1, u64::MAX)?).await?;
    assert_eq!(huge.status(), StatusCode::BAD_REQUEST);

    let bad_id = post_submission(&http, &server.url, &submission("../etc", 1, 10)?).await?;
    assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);

    let round = server.coordinator.open_round().expect("open round");
    assert_eq!(round.contributions.len(), 1);
    assert_eq!(server.coordinator.current_version(), 0);

    server.stop().await
}

#[tokio::test]
async fn test_rate_limited_client() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config(5, dir.path());
    config.network.rate_limit_per_sec = 1;
    config.network.rate_limit_burst = 1;
    let server = start_coordinator(&config).await?;
    let http = reqwest::Client::new();

    let first = post_submission(&http, &server.url, &submission("hospital-a", 1, 100)?).await?;
    assert_eq!(first.status(), StatusCode::OK);

    let second = post_submission(&http, &server.url, &submission("hospital-a", 1, 100)?).await?;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: ErrorBody = second.json().await?;
    assert!(body.retry_after_ms.unwrap_or(0) > 0);

    let other = post_submission(&http, &server.url, &submission("hospital-b", 1, 100)?).await?;
    assert_eq!(other.status(), StatusCode::OK);

    server.stop().await
}

#[tokio::test]
async fn test_model_rounds_and_versions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(1, dir.path())).await?;
    let http = reqwest::Client::new();

    let none = http
        .get(format!("{}/api/model?version=0", server.url))
        .send()
        .await?;
    assert_eq!(none.status(), StatusCode::NO_CONTENT);

    let accepted = post_submission(&http, &server.url, &submission("hospital-a", 1, 100)?).await?;
    assert_eq!(accepted.status(), StatusCode::OK);
    server
        .coordinator
        .wait_for_version(1, Duration::from_secs(5))
        .await?;

    let update = http
        .get(format!("{}/api/model?version=0", server.url))
        .send()
        .await?;
    assert_eq!(update.status(), StatusCode::OK);
    let envelope: ModelEnvelope = update.json().await?;
    assert_eq!(envelope.version, 1);
    assert_eq!(envelope.total_sample_size, 100);
    assert_eq!(
        BincodeCodec.decode(&envelope.payload()?)?,
        model("yes", 0.3, 0.8, 100)
    );

    let current = http
        .get(format!("{}/api/model?version=1", server.url))
        .send()
        .await?;
    assert_eq!(current.status(), StatusCode::NO_CONTENT);

    let rounds: Vec<RoundSummary> = http
        .get(format!("{}/api/rounds", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(rounds.len(), 2);

    let first: Value = http
        .get(format!("{}/api/rounds/1", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(first["status"], "Published");
    assert_eq!(first["published_version"], 1);

    let open: Value = http
        .get(format!("{}/api/rounds/current", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(open["round_number"], 2);
    assert_eq!(open["status"], "Collecting");

    let missing = http
        .get(format!("{}/api/rounds/99", server.url))
        .send()
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let retry = http
        .post(format!("{}/api/rounds/1/retry", server.url))
        .send()
        .await?;
    assert_eq!(retry.status(), StatusCode::CONFLICT);

    let versions: Vec<Value> = http
        .get(format!("{}/api/versions", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["version"], 1);

    let metrics: Value = http
        .get(format!("{}/api/metrics", server.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(metrics["aggregations_run"], 1);
    assert_eq!(metrics["endpoints"]["/api/model"]["requests"], 3);
    assert_eq!(metrics["endpoints"]["/api/rounds/:round_number"]["errors"], 1);

    server.stop().await
}
