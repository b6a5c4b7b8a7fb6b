//! End-to-end federation rounds: clients, coordinator and downstream server over HTTP

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use rulefed_core::{BincodeCodec, Error, ModelCodec, ModelEnvelope, RoundStatus};
use tokio::net::TcpListener;

use common::{client, config, eventually, model, start_coordinator};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

#[tokio::test]
async fn test_two_clients_complete_a_round() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(2, dir.path())).await?;

    let hospital_a = client(&server.url)?;
    let hospital_b = client(&server.url)?;
    let boot_a = hospital_a.bootstrap().await?;
    let boot_b = hospital_b.bootstrap().await?;
    assert_ne!(boot_a.client_id, boot_b.client_id);
    assert_eq!(boot_a.open_round, 1);
    assert_eq!(boot_a.dataset, "2_heart_part_1.csv");
    assert_eq!(boot_b.dataset, "2_heart_part_2.csv");

    let first = hospital_a
        .submit(&model("yes", 0.3, 0.8, 100), 100, Duration::from_secs(2))
        .await?;
    assert!(!first.quorum_reached);
    assert!(hospital_a.pull(0).await?.is_none());

    let second = hospital_b
        .submit(&model("yes", 0.2, 0.7, 50), 50, Duration::from_secs(1))
        .await?;
    assert!(second.quorum_reached);
    assert_eq!(second.received, 2);

    let global = hospital_a.await_update(0, POLL, WAIT).await?;
    assert_eq!(global.version, 1);
    assert_eq!(global.total_sample_size, 150);
    assert!(global.published_at.is_some());

    let rules = global.model.expect("published model");
    assert_eq!(rules.rules.len(), 1);
    assert!((rules.rules[0].support - 40.0 / 150.0).abs() < 1e-9);

    let same = hospital_b.await_update(0, POLL, WAIT).await?;
    assert_eq!(same.version, 1);
    assert!(hospital_b.pull(1).await?.is_none());

    let round = server.coordinator.round_summary(1).expect("round 1");
    assert_eq!(round.status, RoundStatus::Published);
    assert_eq!(round.published_version, Some(1));
    assert_eq!(server.coordinator.open_round_number(), 2);

    server.stop().await
}

#[tokio::test]
async fn test_concurrent_quorum_aggregates_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(5, dir.path())).await?;

    let mut tasks = Vec::new();
    for i in 0..5u64 {
        let url = server.url.clone();
        tasks.push(tokio::spawn(async move {
            let participant = client(&url)?;
            participant.bootstrap().await?;
            let sample_size = 10 * (i + 1);
            let receipt = participant
                .submit(&model("yes", 0.25, 0.75, sample_size), sample_size, Duration::ZERO)
                .await?;
            anyhow::Ok(receipt)
        }));
    }

    let mut closing = 0;
    for task in tasks {
        if task.await??.quorum_reached {
            closing += 1;
        }
    }
    assert_eq!(closing, 1);

    let global = server.coordinator.wait_for_version(1, WAIT).await?;
    assert_eq!(global.total_sample_size, 150);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.coordinator.current_version(), 1);
    assert_eq!(server.coordinator.aggregations_run(), 1);

    let round = server.coordinator.round_summary(1).expect("round 1");
    assert_eq!(round.contributions.len(), 5);

    server.stop().await
}

#[tokio::test]
async fn test_late_client_moves_to_open_round() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(1, dir.path())).await?;

    let early = client(&server.url)?;
    early.bootstrap().await?;
    early
        .submit(&model("yes", 0.3, 0.8, 100), 100, Duration::ZERO)
        .await?;
    server.coordinator.wait_for_version(1, WAIT).await?;

    let late = client(&server.url)?.with_identity("late-hospital", 1);
    let receipt = late
        .submit(&model("yes", 0.4, 0.9, 80), 80, Duration::ZERO)
        .await?;
    assert_eq!(receipt.round_number, 2);
    assert_eq!(late.round_number(), 3);

    let global = late.await_update(1, POLL, WAIT).await?;
    assert_eq!(global.version, 2);
    assert_eq!(global.total_sample_size, 180);

    server.stop().await
}

#[tokio::test]
async fn test_repeated_submission_is_reported_as_duplicate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(3, dir.path())).await?;

    let participant = client(&server.url)?;
    participant.bootstrap().await?;
    participant
        .submit(&model("yes", 0.3, 0.8, 100), 100, Duration::ZERO)
        .await?;

    match participant.submit(&model("yes", 0.3, 0.8, 100), 100, Duration::ZERO).await {
        Err(Error::DuplicateSubmission { round_number, .. }) => assert_eq!(round_number, 1),
        other => panic!("expected duplicate, got {:?}", other),
    }

    let round = server.coordinator.open_round().expect("open round");
    assert_eq!(round.contributions.len(), 1);

    server.stop().await
}

type Inbox = Arc<Mutex<Vec<ModelEnvelope>>>;

async fn start_downstream() -> Result<(String, Inbox)> {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/models",
            post(
                |State(inbox): State<Inbox>, Json(envelope): Json<ModelEnvelope>| async move {
                    inbox.lock().push(envelope);
                    StatusCode::OK
                },
            ),
        )
        .with_state(inbox.clone());

    let port = portpicker::pick_unused_port().expect("No ports free");
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok((format!("http://127.0.0.1:{}/models", port), inbox))
}

#[tokio::test]
async fn test_published_versions_are_pushed_downstream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (downstream_url, inbox) = start_downstream().await?;

    let mut config = config(1, dir.path());
    config.distribution.downstream_url = Some(downstream_url);
    let server = start_coordinator(&config).await?;

    let participant = client(&server.url)?;
    participant.bootstrap().await?;
    participant
        .submit(&model("yes", 0.3, 0.8, 100), 100, Duration::ZERO)
        .await?;
    participant
        .submit(&model("yes", 0.5, 0.9, 100), 100, Duration::ZERO)
        .await?;

    assert!(eventually(WAIT, || inbox.lock().len() == 2).await);

    let delivered = inbox.lock().clone();
    assert_eq!(delivered[0].version, 1);
    assert_eq!(delivered[1].version, 2);
    assert_eq!(delivered[1].total_sample_size, 200);
    assert_eq!(delivered[1].codec, "bincode-v1");

    let pushed = BincodeCodec.decode(&delivered[1].payload()?)?;
    let pulled = participant.pull(1).await?.and_then(|g| g.model).expect("v2");
    assert_eq!(pushed, pulled);

    server.stop().await
}

struct LossyProxy {
    upstream: String,
    http: reqwest::Client,
    lost_once: AtomicBool,
}

type ProxyReply = std::result::Result<(StatusCode, Bytes), StatusCode>;

async fn forward_get(State(proxy): State<Arc<LossyProxy>>, uri: Uri) -> ProxyReply {
    let response = proxy
        .http
        .get(format!("{}{}", proxy.upstream, uri.path()))
        .send()
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?;
    let status = response.status();
    let body = response.bytes().await.map_err(|_| StatusCode::BAD_GATEWAY)?;
    Ok((status, body))
}

/// Delivers every submission, but answers the first one with an empty 502
async fn forward_submission(State(proxy): State<Arc<LossyProxy>>, body: Bytes) -> ProxyReply {
    let response = proxy
        .http
        .post(format!("{}/api/submissions", proxy.upstream))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?;
    if !proxy.lost_once.swap(true, Ordering::SeqCst) {
        return Err(StatusCode::BAD_GATEWAY);
    }
    let status = response.status();
    let body = response.bytes().await.map_err(|_| StatusCode::BAD_GATEWAY)?;
    Ok((status, body))
}

async fn start_lossy_proxy(upstream: &str) -> Result<String> {
    let proxy = Arc::new(LossyProxy {
        upstream: upstream.to_string(),
        http: reqwest::Client::new(),
        lost_once: AtomicBool::new(false),
    });
    let app = Router::new()
        .route("/api/bootstrap", get(forward_get))
        .route("/api/rounds/:round_number", get(forward_get))
        .route("/api/submissions", post(forward_submission))
        .with_state(proxy);

    let port = portpicker::pick_unused_port().expect("No ports free");
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(format!("http://127.0.0.1:{}", port))
}

#[tokio::test]
async fn test_lost_receipt_does_not_count_model_twice() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_coordinator(&config(1, dir.path())).await?;
    let proxy_url = start_lossy_proxy(&server.url).await?;

    let participant = client(&proxy_url)?;
    participant.bootstrap().await?;
    let receipt = participant
        .submit(&model("yes", 0.3, 0.8, 100), 100, Duration::ZERO)
        .await?;
    assert_eq!(receipt.round_number, 1);
    assert_eq!(receipt.received, 1);
    assert!(receipt.quorum_reached);
    assert_eq!(participant.round_number(), 2);

    let global = server.coordinator.wait_for_version(1, WAIT).await?;
    assert_eq!(global.total_sample_size, 100);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.coordinator.current_version(), 1);
    let open = server.coordinator.open_round().expect("open round");
    assert_eq!(open.round_number, 2);
    assert!(open.contributions.is_empty());

    server.stop().await
}

#[tokio::test]
async fn test_restart_keeps_versions_and_round_numbers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(1, dir.path());

    let server = start_coordinator(&config).await?;
    let participant = client(&server.url)?;
    participant.bootstrap().await?;
    participant
        .submit(&model("yes", 0.3, 0.8, 100), 100, Duration::ZERO)
        .await?;
    server.coordinator.wait_for_version(1, WAIT).await?;
    server.stop().await?;

    let restarted = start_coordinator(&config).await?;
    assert_eq!(restarted.coordinator.current_version(), 1);
    assert_eq!(restarted.coordinator.open_round_number(), 2);
    assert_eq!(
        restarted.coordinator.round_summary(1).map(|r| r.status),
        Some(RoundStatus::Published)
    );

    let returning = client(&restarted.url)?;
    let global = returning.pull(0).await?.expect("version 1 survives restart");
    assert_eq!(global.version, 1);
    assert_eq!(global.total_sample_size, 100);

    let boot = returning.bootstrap().await?;
    assert_eq!(boot.current_version, 1);
    assert_eq!(boot.open_round, 2);

    restarted.stop().await
}
