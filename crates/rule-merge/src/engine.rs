//! Pairwise fold of two rule models

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::AddAssign;

use rulefed_core::{Item, Rule, RuleKey, RuleModel};
use tracing::debug;

use crate::stats::{self, Side};

/// What a merge did to the base rule set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Identical rules whose statistics were reconciled
    pub reconciled: usize,

    /// Conflicts won by the base rule
    pub conflicts_kept: usize,

    /// Conflicts won by the incoming rule (base rule dropped)
    pub conflicts_replaced: usize,

    /// Novel incoming rules appended
    pub admitted: usize,

    /// Statistics computed through a zero-denominator fallback
    pub fallbacks: usize,
}

impl AddAssign for MergeReport {
    fn add_assign(&mut self, other: Self) {
        self.reconciled += other.reconciled;
        self.conflicts_kept += other.conflicts_kept;
        self.conflicts_replaced += other.conflicts_replaced;
        self.admitted += other.admitted;
        self.fallbacks += other.fallbacks;
    }
}

/// Prediction priority: confidence desc, support desc, shorter antecedent first
///
/// Rules equal on all three are ordered by identity key so the result is
/// deterministic.
pub fn priority(a: &Rule, b: &Rule) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.support.total_cmp(&a.support))
        .then_with(|| a.len().cmp(&b.len()))
        .then_with(|| a.key().cmp(&b.key()))
}

/// Sort rules into prediction-priority order
pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(priority);
}

/// Merge `incoming` (trained on `incoming_n` records) into `base` (`base_n` records)
pub fn merge(base: &RuleModel, base_n: u64, incoming: &RuleModel, incoming_n: u64) -> RuleModel {
    merge_with_report(base, base_n, incoming, incoming_n).0
}

/// A base rule during a fold
struct Slot {
    rule: Rule,
    /// Holds an incoming conflict winner; never matched again in this fold
    replaced: bool,
}

/// Merge and report what happened
///
/// Returns `base` unchanged when `incoming` has no rules or `incoming_n` is 0.
pub fn merge_with_report(
    base: &RuleModel,
    base_n: u64,
    incoming: &RuleModel,
    incoming_n: u64,
) -> (RuleModel, MergeReport) {
    let mut report = MergeReport::default();

    if incoming.is_empty() || incoming_n == 0 {
        return (base.clone(), report);
    }

    let mut slots: Vec<Slot> = base
        .rules
        .iter()
        .map(|rule| Slot {
            rule: rule.clone(),
            replaced: false,
        })
        .collect();

    let mut by_key: HashMap<RuleKey, usize> = HashMap::with_capacity(slots.len());
    let mut by_antecedent: HashMap<Vec<Item>, Vec<usize>> = HashMap::new();
    for (idx, slot) in slots.iter().enumerate() {
        let key = slot.rule.key();
        by_antecedent
            .entry(key.antecedent.clone())
            .or_default()
            .push(idx);
        by_key.insert(key, idx);
    }

    let mut admitted = Vec::new();

    for rule_in in &incoming.rules {
        let key = rule_in.key();
        let side_in = Side::new(rule_in.support, rule_in.confidence, incoming_n);

        // Same antecedent, same consequent
        if let Some(&idx) = by_key.get(&key) {
            let slot = &mut slots[idx];
            report.fallbacks += reconcile(&mut slot.rule, base_n, side_in);
            report.reconciled += 1;
            debug!(rule = %slot.rule, "Reconciled rule");
            continue;
        }

        // Same antecedent, different consequent: the strongest base rule competes
        let rival = by_antecedent.get(&key.antecedent).and_then(|candidates| {
            candidates
                .iter()
                .copied()
                .filter(|&idx| !slots[idx].replaced)
                .fold(None, |best: Option<usize>, idx| match best {
                    Some(b) if slots[b].rule.frequency(base_n) >= slots[idx].rule.frequency(base_n) => {
                        Some(b)
                    }
                    _ => Some(idx),
                })
        });

        if let Some(idx) = rival {
            let slot = &mut slots[idx];
            let base_freq = slot.rule.frequency(base_n);
            let in_freq = rule_in.frequency(incoming_n);

            if base_freq >= in_freq {
                report.fallbacks += reconcile(&mut slot.rule, base_n, side_in);
                report.conflicts_kept += 1;
                debug!(
                    kept = %slot.rule,
                    dropped = %key,
                    base_freq,
                    in_freq,
                    "Conflict resolved in favour of base rule"
                );
            } else {
                let side_base = Side::new(slot.rule.support, slot.rule.confidence, base_n);
                let support = stats::discounted_support(side_in, base_n);
                let confidence = stats::discounted_confidence(side_base, side_in);
                report.fallbacks += support.degenerate as usize + confidence.degenerate as usize;

                let mut winner = rule_in.clone();
                winner.support = support.value;
                winner.confidence = confidence.value;

                debug!(
                    installed = %winner,
                    dropped = %slot.rule,
                    base_freq,
                    in_freq,
                    "Conflict resolved in favour of incoming rule"
                );

                by_key.remove(&slot.rule.key());
                slot.rule = winner;
                slot.replaced = true;
                report.conflicts_replaced += 1;
            }
            continue;
        }

        // No counterpart in base
        let support = stats::discounted_support(side_in, base_n);
        report.fallbacks += support.degenerate as usize;

        let mut novel = rule_in.clone();
        novel.support = support.value;
        novel.confidence = stats::novel_confidence(side_in, base_n);
        debug!(rule = %novel, "Admitted novel rule");
        admitted.push(novel);
        report.admitted += 1;
    }

    let mut rules: Vec<Rule> = slots.into_iter().map(|slot| slot.rule).collect();
    rules.extend(admitted);
    sort_rules(&mut rules);

    if report.fallbacks > 0 {
        debug!(
            fallbacks = report.fallbacks,
            "Merge used zero-denominator fallbacks"
        );
    }

    let merged = RuleModel {
        target_label: base.target_label.clone(),
        rules,
        sample_size: base_n.saturating_add(incoming_n),
    };
    (merged, report)
}

/// Reconcile `rule` in place, returning the number of fallbacks taken
fn reconcile(rule: &mut Rule, base_n: u64, incoming: Side) -> usize {
    let base = Side::new(rule.support, rule.confidence, base_n);
    let support = stats::reconcile_support(base, incoming);
    let confidence = stats::reconcile_confidence(base, incoming);
    rule.support = support.value;
    rule.confidence = confidence.value;
    support.degenerate as usize + confidence.degenerate as usize
}
