//! Round book: the open round, queued aggregations and round history
//!
//! Everything here is synchronous and meant to live behind one mutex, so
//! that "insert submission, check quorum, close round, open next round" is a
//! single critical section.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use rulefed_core::{
    ClientId, ClientSubmission, Contribution, DeadlinePolicy, Error, ModelVersion, Result,
    RoundNumber, RoundStatus, RoundSummary,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of an accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted toward quorum; the round keeps collecting
    Collected {
        round_number: RoundNumber,
        received: usize,
    },

    /// This submission completed the quorum; the round was queued for aggregation
    QuorumReached { round_number: RoundNumber },
}

impl Admission {
    pub fn round_number(&self) -> RoundNumber {
        match self {
            Admission::Collected { round_number, .. } => *round_number,
            Admission::QuorumReached { round_number } => *round_number,
        }
    }
}

/// Outcome of a deadline check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// No deadline configured, or not expired yet
    NotDue,

    /// Expired with nothing collected; deadline pushed back
    Rearmed { round_number: RoundNumber },

    /// Partial round queued for aggregation
    Aggregate {
        round_number: RoundNumber,
        received: usize,
    },

    /// Partial round dropped
    Discarded {
        round_number: RoundNumber,
        received: usize,
    },
}

/// A queued aggregation
#[derive(Debug, Clone)]
pub struct AggregationJob {
    pub round_number: RoundNumber,
    pub submissions: Vec<ClientSubmission>,
}

struct OpenRound {
    number: RoundNumber,
    submissions: Vec<ClientSubmission>,
    clients: HashSet<ClientId>,
    deadline: Option<Instant>,
}

/// Round state owned by the coordinator
pub struct RoundBook {
    quorum: usize,
    round_deadline: Option<Duration>,
    open: OpenRound,
    summaries: BTreeMap<RoundNumber, RoundSummary>,
    queued: BTreeMap<RoundNumber, Vec<ClientSubmission>>,
    failed: HashMap<RoundNumber, Vec<ClientSubmission>>,
}

impl RoundBook {
    /// Create a book, continuing numbering after `history`
    ///
    /// Rounds that held submissions when the history was saved without
    /// having published lost those submissions with the process; they are
    /// closed as discarded. An empty collecting round is simply reopened.
    pub fn new(quorum: usize, round_deadline: Option<Duration>, history: Vec<RoundSummary>) -> Self {
        let now = Utc::now();
        let mut summaries = BTreeMap::new();
        for mut summary in history {
            if summary.status.is_open() && summary.contributions.is_empty() {
                // reopened below under the same number
                continue;
            }
            if !summary.status.is_terminal() || summary.status == RoundStatus::Failed {
                warn!(
                    round_number = summary.round_number,
                    status = %summary.status,
                    "Round interrupted by restart, marking discarded"
                );
                summary.status = RoundStatus::Discarded;
                summary.closed_at.get_or_insert(now);
                summary.last_error = Some("interrupted by coordinator restart".to_string());
            }
            summaries.insert(summary.round_number, summary);
        }

        let next = summaries.keys().next_back().map(|n| n + 1).unwrap_or(1);
        let mut book = Self {
            quorum,
            round_deadline,
            open: OpenRound {
                number: next,
                submissions: Vec::new(),
                clients: HashSet::new(),
                deadline: None,
            },
            summaries,
            queued: BTreeMap::new(),
            failed: HashMap::new(),
        };
        book.open_round(next);
        book
    }

    fn open_round(&mut self, number: RoundNumber) {
        self.open = OpenRound {
            number,
            submissions: Vec::new(),
            clients: HashSet::new(),
            deadline: self.round_deadline.map(|d| Instant::now() + d),
        };
        self.summaries.insert(
            number,
            RoundSummary {
                round_number: number,
                status: RoundStatus::Collecting,
                quorum: self.quorum,
                contributions: Vec::new(),
                opened_at: Utc::now(),
                closed_at: None,
                published_version: None,
                last_error: None,
            },
        );
        info!(round_number = number, quorum = self.quorum, "Round opened");
    }

    fn summary_mut(&mut self, round_number: RoundNumber) -> Result<&mut RoundSummary> {
        self.summaries
            .get_mut(&round_number)
            .ok_or(Error::RoundNotFound { round_number })
    }

    /// Close the open round with `status` and open the next one
    fn close_open(&mut self, status: RoundStatus) -> (RoundNumber, Vec<ClientSubmission>) {
        let number = self.open.number;
        let submissions = std::mem::take(&mut self.open.submissions);
        if let Some(summary) = self.summaries.get_mut(&number) {
            summary.status = status;
            summary.closed_at = Some(Utc::now());
        }
        self.open_round(number + 1);
        (number, submissions)
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn open_round_number(&self) -> RoundNumber {
        self.open.number
    }

    /// Submissions received so far in the open round
    pub fn received(&self) -> usize {
        self.open.submissions.len()
    }

    /// Add a submission to the open round
    pub fn accept(&mut self, submission: ClientSubmission) -> Result<Admission> {
        let open_round = self.open.number;
        if submission.round_number != open_round {
            return Err(Error::StaleSubmission {
                submitted_round: submission.round_number,
                open_round,
            });
        }
        if self.open.clients.contains(&submission.client_id) {
            return Err(Error::DuplicateSubmission {
                client_id: submission.client_id,
                round_number: open_round,
            });
        }

        let contribution = Contribution {
            client_id: submission.client_id.clone(),
            sample_size: submission.sample_size,
            elapsed_secs: submission.elapsed_training_time.as_secs_f64(),
        };
        self.summary_mut(open_round)?.contributions.push(contribution);
        self.open.clients.insert(submission.client_id.clone());
        self.open.submissions.push(submission);

        let received = self.open.submissions.len();
        if received == self.quorum {
            let (round_number, submissions) = self.close_open(RoundStatus::Aggregating);
            self.queued.insert(round_number, submissions);
            info!(round_number, received, "Quorum reached, round queued for aggregation");
            return Ok(Admission::QuorumReached { round_number });
        }

        debug!(round_number = open_round, received, quorum = self.quorum, "Submission collected");
        Ok(Admission::Collected {
            round_number: open_round,
            received,
        })
    }

    /// Apply the deadline policy if the open round expired at `now`
    pub fn expire(&mut self, now: Instant, policy: DeadlinePolicy) -> DeadlineOutcome {
        let (Some(deadline), Some(period)) = (self.open.deadline, self.round_deadline) else {
            return DeadlineOutcome::NotDue;
        };
        if now < deadline {
            return DeadlineOutcome::NotDue;
        }

        let received = self.open.submissions.len();
        if received == 0 {
            self.open.deadline = Some(now + period);
            return DeadlineOutcome::Rearmed {
                round_number: self.open.number,
            };
        }

        let aggregate = match policy {
            DeadlinePolicy::AggregatePartial { min_submissions } => received >= min_submissions,
            DeadlinePolicy::Discard => false,
        };

        if aggregate {
            let (round_number, submissions) = self.close_open(RoundStatus::Aggregating);
            self.queued.insert(round_number, submissions);
            DeadlineOutcome::Aggregate {
                round_number,
                received,
            }
        } else {
            let (round_number, _) = self.close_open(RoundStatus::Discarded);
            if let Some(summary) = self.summaries.get_mut(&round_number) {
                summary.last_error = Some(format!(
                    "deadline expired with {} of {} submissions",
                    received, self.quorum
                ));
            }
            DeadlineOutcome::Discarded {
                round_number,
                received,
            }
        }
    }

    /// Take the oldest queued aggregation
    pub fn next_job(&mut self) -> Option<AggregationJob> {
        self.queued
            .pop_first()
            .map(|(round_number, submissions)| AggregationJob {
                round_number,
                submissions,
            })
    }

    /// Number of rounds waiting for the pipeline
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn mark_published(&mut self, round_number: RoundNumber, version: ModelVersion) -> Result<()> {
        let summary = self.summary_mut(round_number)?;
        summary.status = RoundStatus::Published;
        summary.published_version = Some(version);
        summary.last_error = None;
        Ok(())
    }

    /// Record a failed aggregation, keeping its submissions for a retry
    pub fn mark_failed(&mut self, job: AggregationJob, error: &Error) -> Result<()> {
        let summary = self.summary_mut(job.round_number)?;
        summary.status = RoundStatus::Failed;
        summary.last_error = Some(error.to_string());
        self.failed.insert(job.round_number, job.submissions);
        Ok(())
    }

    /// Queue a failed round again
    pub fn requeue(&mut self, round_number: RoundNumber) -> Result<()> {
        let Some(submissions) = self.failed.remove(&round_number) else {
            let summary = self
                .summaries
                .get(&round_number)
                .ok_or(Error::RoundNotFound { round_number })?;
            return Err(Error::RoundNotRetryable {
                round_number,
                status: summary.status.to_string(),
            });
        };

        self.summary_mut(round_number)?.status = RoundStatus::Aggregating;
        self.queued.insert(round_number, submissions);
        info!(round_number, "Failed round queued for retry");
        Ok(())
    }

    pub fn summary(&self, round_number: RoundNumber) -> Option<RoundSummary> {
        self.summaries.get(&round_number).cloned()
    }

    /// All rounds, oldest first
    pub fn summaries(&self) -> Vec<RoundSummary> {
        self.summaries.values().cloned().collect()
    }

    pub fn open_summary(&self) -> Option<RoundSummary> {
        self.summary(self.open.number)
    }
}
