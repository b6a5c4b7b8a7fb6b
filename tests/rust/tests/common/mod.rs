//! Shared harness: a coordinator served over HTTP on a free local port

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coordinator::{build_coordinator, CoordinatorServer, RoundCoordinatorHandle};
use rulefed_client::FederationClient;
use rulefed_core::{
    BincodeCodec, ClientConfig, FederationConfig, Item, RetryConfig, Rule, RuleModel,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct TestCoordinator {
    pub url: String,
    pub coordinator: RoundCoordinatorHandle,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<rulefed_core::Result<()>>,
}

impl TestCoordinator {
    /// Stop serving and wait for the coordinator tasks to finish
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await??;
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn config(quorum: usize, data_dir: &Path) -> FederationConfig {
    let mut config = FederationConfig::default();
    config.coordinator.quorum = quorum;
    config.store.base_path = data_dir.to_string_lossy().into_owned();
    config
}

/// Build a coordinator from `config` and serve it on a free port
pub async fn start_coordinator(config: &FederationConfig) -> Result<TestCoordinator> {
    init_tracing();

    let coordinator = build_coordinator(config).await?;
    let port = portpicker::pick_unused_port().expect("No ports free");
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;

    let server = CoordinatorServer::new(addr, coordinator.clone(), config.network.clone());
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(server.serve(listener, async move {
        rx.await.ok();
    }));

    Ok(TestCoordinator {
        url: format!("http://{}", addr),
        coordinator,
        shutdown: Some(tx),
        handle,
    })
}

pub fn client(url: &str) -> Result<FederationClient> {
    let config = ClientConfig {
        coordinator_url: url.to_string(),
        request_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    };
    Ok(FederationClient::new(&config, Arc::new(BincodeCodec))?)
}

/// One-rule model predicting `consequent` from `x = 1`
pub fn model(consequent: &str, support: f64, confidence: f64, sample_size: u64) -> RuleModel {
    RuleModel::new(
        "HeartDisease",
        vec![Rule::new([Item::new("x", "1")], consequent, support, confidence)],
        sample_size,
    )
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
