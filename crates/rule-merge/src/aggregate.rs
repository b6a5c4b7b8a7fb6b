//! Round merge: reduce a round's submissions into one model

use rulefed_core::{ClientSubmission, Error, GlobalModel, MergeOrder, Result, RuleModel};
use tracing::{debug, info};

use crate::engine::{merge_with_report, sort_rules, MergeReport};

/// Result of merging one round
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// The merged model, in prediction-priority order
    pub model: RuleModel,

    /// Cumulative sample size behind the merged statistics
    pub total_sample_size: u64,

    /// Number of submissions folded in
    pub contributors: usize,

    /// Merge decisions, summed over all folds
    pub report: MergeReport,
}

/// Submissions in deterministic fold order
pub fn order_submissions(collected: &[ClientSubmission], order: MergeOrder) -> Vec<&ClientSubmission> {
    let mut ordered: Vec<&ClientSubmission> = collected.iter().collect();
    match order {
        MergeOrder::ClientIdAscending => {
            ordered.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        }
        MergeOrder::SampleSizeDescending => {
            ordered.sort_by(|a, b| {
                b.sample_size
                    .cmp(&a.sample_size)
                    .then_with(|| a.client_id.cmp(&b.client_id))
            });
        }
    }
    ordered
}

/// Fold a round's submissions, on top of the prior global model if there is one
///
/// The prior model (weighted by its cumulative sample size) seeds the fold;
/// without one the first submission in `order` does. Every other submission
/// is merged in with its own sample size as weight. A submission without
/// rules leaves the accumulator untouched, so its sample size is not part
/// of `total_sample_size` wherever it lands in the order.
pub fn aggregate(
    collected: &[ClientSubmission],
    prior: Option<&GlobalModel>,
    order: MergeOrder,
) -> Result<Aggregate> {
    let ordered = order_submissions(collected, order);
    let mut pending = ordered.into_iter();

    let mut acc = match prior.and_then(|p| p.model.as_ref().map(|m| (p, m))) {
        Some((prior, model)) if prior.version > 0 => {
            debug!(
                version = prior.version,
                total_sample_size = prior.total_sample_size,
                "Seeding round merge with prior global model"
            );
            let mut seed = model.clone();
            seed.sample_size = prior.total_sample_size;
            seed
        }
        _ => {
            let first = pending.next().ok_or(Error::EmptyRound)?;
            debug!(client_id = %first.client_id, "Seeding round merge with first submission");
            let mut seed = first.payload.clone();
            seed.sample_size = if seed.is_empty() { 0 } else { first.sample_size };
            sort_rules(&mut seed.rules);
            seed
        }
    };

    let mut report = MergeReport::default();
    for submission in pending {
        let base_n = acc.sample_size;
        let (merged, step) =
            merge_with_report(&acc, base_n, &submission.payload, submission.sample_size);
        debug!(
            client_id = %submission.client_id,
            sample_size = submission.sample_size,
            rules = merged.rules.len(),
            "Folded submission"
        );
        report += step;
        acc = merged;
    }

    info!(
        contributors = collected.len(),
        rules = acc.rules.len(),
        total_sample_size = acc.sample_size,
        reconciled = report.reconciled,
        admitted = report.admitted,
        conflicts_kept = report.conflicts_kept,
        conflicts_replaced = report.conflicts_replaced,
        "Round merge complete"
    );

    Ok(Aggregate {
        total_sample_size: acc.sample_size,
        model: acc,
        contributors: collected.len(),
        report,
    })
}
