//! HTTP client for the federation coordinator

use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Response, StatusCode};
use rulefed_core::wire::encode_payload;
use rulefed_core::{
    codec_by_name, BootstrapResponse, ClientConfig, ClientId, Error, ErrorBody, GlobalModel,
    ModelCodecHandle, ModelEnvelope, ModelVersion, Result, RetryConfig, RoundNumber, RoundSummary,
    RuleModel, SubmitReceipt, SubmitRequest,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::retry::with_backoff;

#[derive(Debug, Clone, Default)]
struct Session {
    client_id: Option<ClientId>,
    round_number: RoundNumber,
}

/// One federation participant
pub struct FederationClient {
    http: reqwest::Client,
    base_url: String,
    codec: ModelCodecHandle,
    retry: RetryConfig,
    session: Mutex<Session>,
}

impl FederationClient {
    pub fn new(config: &ClientConfig, codec: ModelCodecHandle) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("cannot build http client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
            codec,
            retry: config.retry.clone(),
            session: Mutex::new(Session::default()),
        })
    }

    /// Resume an identity handed out by an earlier bootstrap
    pub fn with_identity(self, client_id: impl Into<ClientId>, round_number: RoundNumber) -> Self {
        *self.session.lock() = Session {
            client_id: Some(client_id.into()),
            round_number,
        };
        self
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.session.lock().client_id.clone()
    }

    /// Round the next submission goes to
    pub fn round_number(&self) -> RoundNumber {
        self.session.lock().round_number
    }

    /// Obtain an identity, the open round and the training parameters
    pub async fn bootstrap(&self) -> Result<BootstrapResponse> {
        let response: BootstrapResponse = self.get_json("/api/bootstrap").await?;
        *self.session.lock() = Session {
            client_id: Some(response.client_id.clone()),
            round_number: response.open_round,
        };

        info!(
            client_id = %response.client_id,
            dataset = %response.dataset,
            open_round = response.open_round,
            "Bootstrapped"
        );
        Ok(response)
    }

    /// Submit a locally trained model to the open round
    ///
    /// A stale answer moves the client to the round the coordinator reports
    /// as open and resubmits there. A duplicate answer is returned as
    /// [`Error::DuplicateSubmission`]; the coordinator already holds this
    /// client's model for that round.
    ///
    /// When a request may have reached the coordinator without an answer
    /// coming back, the round is looked up before anything is resent, so a
    /// model is never counted in two rounds.
    pub async fn submit(
        &self,
        model: &RuleModel,
        sample_size: u64,
        elapsed: Duration,
    ) -> Result<SubmitReceipt> {
        let client_id = self.client_id().ok_or_else(|| Error::InvalidSubmission {
            message: "client has not bootstrapped".to_string(),
        })?;
        let encoded = encode_payload(&self.codec.encode(model)?);

        let mut stale_answers = 0;
        let mut unknown_outcomes = 0;
        loop {
            let request = SubmitRequest {
                client_id: client_id.clone(),
                round_number: self.round_number(),
                sample_size,
                elapsed_secs: elapsed.as_secs_f64(),
                model: encoded.clone(),
            };

            match self.post_submission(&request).await {
                Ok(receipt) => return Ok(self.accepted(&client_id, receipt)),
                Err(Error::DeliveryUnknown { message, .. })
                    if unknown_outcomes < self.retry.max_retries =>
                {
                    unknown_outcomes += 1;
                    warn!(
                        client_id = %client_id,
                        round_number = request.round_number,
                        error = %message,
                        "Submission outcome unknown, checking the round"
                    );
                    if let Some(receipt) = self.recorded(&client_id, request.round_number).await? {
                        return Ok(self.accepted(&client_id, receipt));
                    }
                }
                Err(Error::StaleSubmission {
                    submitted_round,
                    open_round,
                }) if stale_answers < self.retry.max_retries => {
                    if unknown_outcomes > 0 {
                        if let Some(receipt) = self.recorded(&client_id, submitted_round).await? {
                            return Ok(self.accepted(&client_id, receipt));
                        }
                    }
                    stale_answers += 1;
                    warn!(
                        client_id = %client_id,
                        submitted_round,
                        open_round,
                        "Round moved on, resubmitting to the open round"
                    );
                    self.session.lock().round_number = open_round;
                }
                Err(Error::DuplicateSubmission { round_number, .. }) if unknown_outcomes > 0 => {
                    // an earlier attempt did arrive
                    if let Some(receipt) = self.recorded(&client_id, round_number).await? {
                        return Ok(self.accepted(&client_id, receipt));
                    }
                    return Err(Error::DuplicateSubmission {
                        client_id,
                        round_number,
                    });
                }
                Err(e) => {
                    if let Error::DuplicateSubmission { round_number, .. } = &e {
                        info!(client_id = %client_id, round_number, "Round already holds this client's model");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn accepted(&self, client_id: &str, receipt: SubmitReceipt) -> SubmitReceipt {
        self.session.lock().round_number = receipt.round_number + 1;
        info!(
            client_id = %client_id,
            round_number = receipt.round_number,
            received = receipt.received,
            quorum = receipt.quorum,
            "Submission accepted"
        );
        receipt
    }

    /// Receipt for this client's contribution to `round_number`, if the round holds one
    async fn recorded(&self, client_id: &str, round_number: RoundNumber) -> Result<Option<SubmitReceipt>> {
        let summary: RoundSummary = match self.get_json(&format!("/api/rounds/{}", round_number)).await {
            Ok(summary) => summary,
            Err(Error::RoundNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let position = summary
            .contributions
            .iter()
            .position(|c| c.client_id == client_id);
        Ok(position.map(|index| SubmitReceipt {
            round_number,
            received: index + 1,
            quorum: summary.quorum,
            quorum_reached: index + 1 == summary.quorum,
        }))
    }

    /// Global model newer than `known_version`, if any
    pub async fn pull(&self, known_version: ModelVersion) -> Result<Option<GlobalModel>> {
        let url = self.url(&format!("/api/model?version={}", known_version));
        let url = url.as_str();
        let envelope = with_backoff(&self.retry, "pull", |_| async move {
            let response = self.http.get(url).send().await.map_err(|e| transport(url, e))?;
            if response.status() == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            read_json::<ModelEnvelope>(url, response).await.map(Some)
        })
        .await?;

        let Some(envelope) = envelope else {
            debug!(known_version, "No newer global model");
            return Ok(None);
        };

        let codec = codec_by_name(&envelope.codec).ok_or_else(|| Error::DecodeFailure {
            client_id: None,
            reason: format!("unknown codec '{}'", envelope.codec),
        })?;
        let rules = codec.decode(&envelope.payload()?)?;

        debug!(version = envelope.version, rules = rules.rules.len(), "Pulled global model");
        Ok(Some(GlobalModel {
            version: envelope.version,
            model: Some(rules),
            total_sample_size: envelope.total_sample_size,
            published_at: envelope.published_at,
        }))
    }

    /// Poll until a version newer than `known_version` is published
    pub async fn await_update(
        &self,
        known_version: ModelVersion,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<GlobalModel> {
        let poll = async {
            loop {
                if let Some(model) = self.pull(known_version).await? {
                    return Ok::<_, Error>(model);
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("await global model newer than {}", known_version),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let url = url.as_str();
        with_backoff(&self.retry, path, |_| async move {
            let response = self.http.get(url).send().await.map_err(|e| transport(url, e))?;
            read_json(url, response).await
        })
        .await
    }

    /// POST a submission, repeating it only while the coordinator provably never saw it
    async fn post_submission(&self, request: &SubmitRequest) -> Result<SubmitReceipt> {
        let url = self.url("/api/submissions");
        let url = url.as_str();
        with_backoff(&self.retry, "submit", |_| async move {
            let response = self.http.post(url).json(request).send().await.map_err(|e| {
                if e.is_connect() {
                    transport(url, e)
                } else {
                    Error::DeliveryUnknown {
                        endpoint: url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;
            read_json(url, response).await.map_err(|e| match e {
                Error::TransportFailure { endpoint, message } => Error::DeliveryUnknown { endpoint, message },
                other => other,
            })
        })
        .await
    }
}

fn transport(url: &str, error: reqwest::Error) -> Error {
    Error::TransportFailure {
        endpoint: url.to_string(),
        message: error.to_string(),
    }
}

/// Decode a success body, or rebuild the coordinator's typed error
async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|e| transport(url, e));
    }

    match response.json::<ErrorBody>().await {
        Ok(body) => Err(body.into_error(url)),
        Err(_) => Err(Error::TransportFailure {
            endpoint: url.to_string(),
            message: format!("coordinator answered {}", status),
        }),
    }
}
