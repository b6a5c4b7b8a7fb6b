//! Round coordinator
//!
//! Collects client submissions into rounds, fires aggregation exactly once per
//! round when quorum is reached, and drives merge, publish and distribution on
//! a single pipeline task so that the global model store has one writer and
//! versions follow round order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rule_merge::Aggregate;
use rulefed_core::{
    BootstrapResponse, ClientSubmission, CoordinatorConfig, Error, GlobalModel, MergeOrder,
    ModelCodecHandle, ModelVersion, Result, RoundNumber, RoundSummary, RuleModel, SubmitReceipt,
    TrainingParams, MAX_SAMPLE_SIZE,
};
use storage::StorageHandle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use model_store::{GlobalModelStoreHandle, VersionInfo};

use crate::distribution::{DistributionChannel, PullResponse};
use crate::round::{Admission, AggregationJob, DeadlineOutcome, RoundBook};

/// Path of the persisted round history on the storage backend
pub const ROUND_HISTORY_PATH: &str = "rounds/history.json";

/// Reduces a round's submissions into one model
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        collected: &[ClientSubmission],
        prior: Option<&GlobalModel>,
        order: MergeOrder,
    ) -> Result<Aggregate>;
}

/// Sample-size weighted rule merge
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMergeAggregator;

impl Aggregator for RuleMergeAggregator {
    fn aggregate(
        &self,
        collected: &[ClientSubmission],
        prior: Option<&GlobalModel>,
        order: MergeOrder,
    ) -> Result<Aggregate> {
        rule_merge::aggregate(collected, prior, order)
    }
}

/// Builder for [`RoundCoordinator`]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    training: TrainingParams,
    aggregator: Arc<dyn Aggregator>,
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            training: TrainingParams::default(),
            aggregator: Arc::new(RuleMergeAggregator),
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn training(mut self, training: TrainingParams) -> Self {
        self.training = training;
        self
    }

    pub fn aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Restore round history and start the pipeline and deadline tasks
    ///
    /// `backend` holds the round history; the store must already be open.
    pub async fn start(
        self,
        store: GlobalModelStoreHandle,
        distribution: Arc<DistributionChannel>,
        backend: StorageHandle,
    ) -> Result<Arc<RoundCoordinator>> {
        if self.config.quorum == 0 {
            return Err(Error::InvalidConfig {
                message: "quorum must be greater than zero".to_string(),
            });
        }

        let history = load_history(&backend).await?;
        let book = RoundBook::new(self.config.quorum, self.config.round_deadline, history);
        let (wake_tx, wake_rx) = mpsc::channel(self.config.pipeline_capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let coordinator = Arc::new(RoundCoordinator {
            codec: store.codec().clone(),
            config: self.config,
            training: self.training,
            book: Mutex::new(book),
            store,
            distribution,
            aggregator: self.aggregator,
            backend,
            history_lock: tokio::sync::Mutex::new(()),
            wake_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            start_time: Instant::now(),
            bootstrapped: AtomicU64::new(0),
            aggregations: AtomicU64::new(0),
        });

        coordinator.persist_history().await;

        let mut tasks = vec![tokio::spawn(coordinator.clone().run_pipeline(wake_rx))];
        if coordinator.config.round_deadline.is_some() {
            tasks.push(tokio::spawn(coordinator.clone().run_deadline_check()));
        }
        *coordinator.tasks.lock() = tasks;

        info!(
            open_round = coordinator.open_round_number(),
            quorum = coordinator.config.quorum,
            version = coordinator.store.version(),
            "Round coordinator started"
        );
        Ok(coordinator)
    }
}

async fn load_history(backend: &StorageHandle) -> Result<Vec<RoundSummary>> {
    match backend.read(ROUND_HISTORY_PATH).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(Error::StoragePathNotFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Round coordination service
pub struct RoundCoordinator {
    config: CoordinatorConfig,
    training: TrainingParams,
    codec: ModelCodecHandle,

    /// Open round, queued aggregations and history, one critical section
    book: Mutex<RoundBook>,

    store: GlobalModelStoreHandle,
    distribution: Arc<DistributionChannel>,
    aggregator: Arc<dyn Aggregator>,

    /// Backend for the round history file
    backend: StorageHandle,
    history_lock: tokio::sync::Mutex<()>,

    /// Wakes the pipeline; the queue itself lives in the book
    wake_tx: mpsc::Sender<RoundNumber>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    start_time: Instant,
    bootstrapped: AtomicU64,
    aggregations: AtomicU64,
}

impl RoundCoordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    // ========== Submissions ==========

    /// Hand out a client identity and the training parameters
    pub fn bootstrap(&self) -> BootstrapResponse {
        let seq = self.bootstrapped.fetch_add(1, Ordering::Relaxed) + 1;
        let client_id = Uuid::new_v4().to_string();
        let dataset = self.training.dataset_name(self.config.quorum, seq);
        info!(client_id = %client_id, dataset = %dataset, "Client bootstrapped");

        BootstrapResponse {
            client_id,
            dataset,
            open_round: self.open_round_number(),
            quorum: self.config.quorum,
            current_version: self.store.version(),
            training: self.training.clone(),
        }
    }

    /// Decode an encoded model and submit it
    pub async fn submit_encoded(
        &self,
        client_id: &str,
        round_number: RoundNumber,
        sample_size: u64,
        elapsed_training_time: Duration,
        payload: &[u8],
    ) -> Result<SubmitReceipt> {
        let model = self.codec.decode(payload).map_err(|e| {
            let reason = match e {
                Error::DecodeFailure { reason, .. } => reason,
                other => other.to_string(),
            };
            warn!(
                client_id = %client_id,
                round_number,
                reason = %reason,
                "Rejected undecodable submission"
            );
            Error::DecodeFailure {
                client_id: Some(client_id.to_string()),
                reason,
            }
        })?;

        self.submit(ClientSubmission {
            client_id: client_id.to_string(),
            round_number,
            sample_size,
            elapsed_training_time,
            payload: model,
        })
        .await
    }

    /// Add a submission to the open round
    ///
    /// The submission that completes the quorum closes the round, queues it
    /// for aggregation and opens the next round, all before this returns.
    pub async fn submit(&self, submission: ClientSubmission) -> Result<SubmitReceipt> {
        self.check_submission(&submission)?;
        let client_id = submission.client_id.clone();

        let admission = self.book.lock().accept(submission);
        let admission = match admission {
            Ok(admission) => admission,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Submission rejected");
                return Err(e);
            }
        };

        let receipt = match admission {
            Admission::Collected {
                round_number,
                received,
            } => SubmitReceipt {
                round_number,
                received,
                quorum: self.config.quorum,
                quorum_reached: false,
            },
            Admission::QuorumReached { round_number } => {
                self.wake_pipeline(round_number);
                self.persist_history().await;
                SubmitReceipt {
                    round_number,
                    received: self.config.quorum,
                    quorum: self.config.quorum,
                    quorum_reached: true,
                }
            }
        };

        debug!(
            client_id = %client_id,
            round_number = admission.round_number(),
            received = receipt.received,
            "Submission accepted"
        );
        Ok(receipt)
    }

    fn check_submission(&self, submission: &ClientSubmission) -> Result<()> {
        if submission.client_id.is_empty() {
            return Err(Error::InvalidSubmission {
                message: "client id cannot be empty".to_string(),
            });
        }
        if submission.sample_size == 0 || submission.sample_size > MAX_SAMPLE_SIZE {
            return Err(Error::InvalidSubmission {
                message: format!("sample size must be between 1 and {}", MAX_SAMPLE_SIZE),
            });
        }
        if let Some(expected) = &self.config.expected_target_label {
            if &submission.payload.target_label != expected {
                return Err(Error::InvalidSubmission {
                    message: format!(
                        "model predicts {}, federation predicts {}",
                        submission.payload.target_label, expected
                    ),
                });
            }
        }
        submission.payload.validate()
    }

    // ========== Aggregation pipeline ==========

    fn wake_pipeline(&self, round_number: RoundNumber) {
        // A full channel means a wake-up is already pending; the pipeline
        // drains every queued round per wake-up.
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.wake_tx.try_send(round_number) {
            error!(round_number, "Aggregation pipeline is not running");
        }
    }

    async fn run_pipeline(self: Arc<Self>, mut wake_rx: mpsc::Receiver<RoundNumber>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("Aggregation pipeline started");

        loop {
            tokio::select! {
                wake = wake_rx.recv() => {
                    let Some(round_number) = wake else { break };
                    debug!(round_number, "Pipeline woken");
                    self.drain_queue().await;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Aggregation pipeline stopped");
    }

    async fn drain_queue(&self) {
        loop {
            let job = self.book.lock().next_job();
            let Some(job) = job else { break };
            self.run_job(job).await;
        }
    }

    async fn run_job(&self, job: AggregationJob) {
        let round_number = job.round_number;
        let prior = self.store.current();
        info!(
            round_number,
            submissions = job.submissions.len(),
            prior_version = prior.version,
            "Aggregating round"
        );

        let result = match self.merge(&job, prior).await {
            Ok(merged) => self
                .publish_with_retry(round_number, merged.model, merged.total_sample_size)
                .await,
            Err(e) => Err(e),
        };

        match result {
            Ok(published) => {
                if let Err(e) = self.book.lock().mark_published(round_number, published.version) {
                    error!(round_number, error = %e, "Published round is missing from the book");
                }
                self.persist_history().await;
                info!(
                    round_number,
                    version = published.version,
                    total_sample_size = published.total_sample_size,
                    "Round published"
                );
                self.distribution.notify(&published).await;
            }
            Err(e) => {
                error!(round_number, error = %e, "Round aggregation failed");
                if let Err(e) = self.book.lock().mark_failed(job, &e) {
                    error!(round_number, error = %e, "Failed round is missing from the book");
                }
                self.persist_history().await;
            }
        }
    }

    async fn merge(&self, job: &AggregationJob, prior: Arc<GlobalModel>) -> Result<Aggregate> {
        let aggregator = self.aggregator.clone();
        let submissions = job.submissions.clone();
        let order = self.config.merge_order;
        self.aggregations.fetch_add(1, Ordering::SeqCst);

        tokio::task::spawn_blocking(move || aggregator.aggregate(&submissions, Some(prior.as_ref()), order))
            .await
            .map_err(|e| Error::Internal {
                message: format!("merge task failed: {}", e),
            })?
    }

    async fn publish_with_retry(
        &self,
        round_number: RoundNumber,
        model: RuleModel,
        total_sample_size: u64,
    ) -> Result<Arc<GlobalModel>> {
        let retry = &self.config.publish_retry;
        let mut attempt = 0;

        loop {
            match self.store.publish(model.clone(), total_sample_size).await {
                Ok(published) => return Ok(published),
                Err(e) if attempt < retry.max_retries && !e.is_fatal() => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        round_number,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue a failed round for another aggregation attempt
    pub async fn retry_round(&self, round_number: RoundNumber) -> Result<()> {
        self.book.lock().requeue(round_number)?;
        self.wake_pipeline(round_number);
        self.persist_history().await;
        Ok(())
    }

    // ========== Deadlines ==========

    async fn run_deadline_check(self: Arc<Self>) {
        let interval = self.config.deadline_check_interval;
        let policy = self.config.deadline_policy;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting round deadline check loop"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let outcome = self.book.lock().expire(tokio::time::Instant::now(), policy);
                    self.apply_deadline(outcome).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Round deadline check loop shutting down");
                    break;
                }
            }
        }
    }

    async fn apply_deadline(&self, outcome: DeadlineOutcome) {
        match outcome {
            DeadlineOutcome::NotDue => {}
            DeadlineOutcome::Rearmed { round_number } => {
                debug!(round_number, "Round deadline expired with no submissions, re-armed");
            }
            DeadlineOutcome::Aggregate {
                round_number,
                received,
            } => {
                info!(round_number, received, "Round deadline expired, aggregating partial round");
                self.wake_pipeline(round_number);
                self.persist_history().await;
            }
            DeadlineOutcome::Discarded {
                round_number,
                received,
            } => {
                warn!(round_number, received, "Round deadline expired, partial round discarded");
                self.persist_history().await;
            }
        }
    }

    // ========== History ==========

    async fn persist_history(&self) {
        let _guard = self.history_lock.lock().await;
        let summaries = self.book.lock().summaries();

        let result = match serde_json::to_vec_pretty(&summaries) {
            Ok(data) => self.backend.write(ROUND_HISTORY_PATH, Bytes::from(data)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist round history");
        }
    }

    // ========== Reads ==========

    pub fn open_round_number(&self) -> RoundNumber {
        self.book.lock().open_round_number()
    }

    pub fn open_round(&self) -> Option<RoundSummary> {
        self.book.lock().open_summary()
    }

    pub fn round_summary(&self, round_number: RoundNumber) -> Option<RoundSummary> {
        self.book.lock().summary(round_number)
    }

    /// All rounds, oldest first
    pub fn rounds(&self) -> Vec<RoundSummary> {
        self.book.lock().summaries()
    }

    /// Rounds waiting for the pipeline
    pub fn queued_rounds(&self) -> usize {
        self.book.lock().queued_len()
    }

    pub fn quorum(&self) -> usize {
        self.config.quorum
    }

    pub fn current_model(&self) -> Arc<GlobalModel> {
        self.store.current()
    }

    pub fn current_version(&self) -> ModelVersion {
        self.store.version()
    }

    /// Published version history
    pub async fn versions(&self) -> Result<Vec<VersionInfo>> {
        self.store.history().await
    }

    pub fn pull(&self, known_version: ModelVersion) -> Result<PullResponse> {
        self.distribution.pull(known_version)
    }

    pub fn codec(&self) -> &ModelCodecHandle {
        &self.codec
    }

    /// Number of merge runs started so far
    pub fn aggregations_run(&self) -> u64 {
        self.aggregations.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Wait until `version` (or a later one) is published
    pub async fn wait_for_version(
        &self,
        version: ModelVersion,
        timeout: Duration,
    ) -> Result<Arc<GlobalModel>> {
        let mut updates = self.store.subscribe();
        let wait = async {
            updates
                .wait_for(|model| model.version >= version)
                .await
                .map(|model| Arc::clone(&model))
                .map_err(|_| Error::ChannelClosed {
                    channel: "global model updates".to_string(),
                })
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("wait for version {}", version),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Stop the pipeline and deadline tasks
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
        info!("Round coordinator shut down");
    }
}

/// Thread-safe handle to the coordinator
pub type RoundCoordinatorHandle = Arc<RoundCoordinator>;
