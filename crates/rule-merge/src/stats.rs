//! Rule statistic reconciliation formulas
//!
//! With `w = support * n` the weighted support of a side:
//!
//! - reconciled support: `(w_b + w_i) / (n_b + n_i)`
//! - reconciled confidence: `(w_b + w_i) * c_b * c_i / (w_b * c_i + w_i * c_b)`
//! - discounted support: `s_i * n_i / (n_b + n_i)`
//! - discounted confidence: `w_i * c_b * c_i / (w_b * c_i + w_i * c_b)`
//!
//! Each formula has an explicit fallback for a zero denominator; results are
//! flagged [`Estimate::degenerate`] when the fallback was taken. Population
//! sums saturate at `u64::MAX`.

/// Statistics of one side of a merge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Side {
    pub support: f64,
    pub confidence: f64,
    pub n: u64,
}

impl Side {
    pub fn new(support: f64, confidence: f64, n: u64) -> Self {
        Self {
            support,
            confidence,
            n,
        }
    }

    /// Estimated number of matching records, `support * n`
    pub fn weight(&self) -> f64 {
        self.support * self.n as f64
    }
}

/// A computed statistic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub value: f64,

    /// The formula's denominator was zero and a fallback rule was applied
    pub degenerate: bool,
}

impl Estimate {
    fn exact(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            degenerate: false,
        }
    }

    fn fallback(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            degenerate: true,
        }
    }
}

/// Sample-size weighted average of two supports
pub fn reconcile_support(base: Side, incoming: Side) -> Estimate {
    let total = base.n.saturating_add(incoming.n);
    if total == 0 {
        return Estimate::fallback(base.support);
    }
    Estimate::exact((base.weight() + incoming.weight()) / total as f64)
}

/// Weighted confidence of a rule seen on both sides
///
/// When the denominator vanishes the confidence of the side with non-zero
/// weighted support times confidence is kept (base first), else 0.
pub fn reconcile_confidence(base: Side, incoming: Side) -> Estimate {
    let (w_b, w_i) = (base.weight(), incoming.weight());
    let denominator = w_b * incoming.confidence + w_i * base.confidence;

    if denominator == 0.0 || !denominator.is_finite() {
        let value = if w_b * base.confidence > 0.0 {
            base.confidence
        } else if w_i * incoming.confidence > 0.0 {
            incoming.confidence
        } else {
            0.0
        };
        return Estimate::fallback(value);
    }

    Estimate::exact((w_b + w_i) * base.confidence * incoming.confidence / denominator)
}

/// Support of an incoming rule with no prior evidence in the base population
pub fn discounted_support(incoming: Side, base_n: u64) -> Estimate {
    let total = base_n.saturating_add(incoming.n);
    if total == 0 {
        return Estimate::fallback(incoming.support);
    }
    Estimate::exact(incoming.weight() / total as f64)
}

/// Confidence of an incoming rule installed over (or next to) a base rule
///
/// `base` holds the displaced rule's statistics; when they contribute
/// nothing to the denominator the incoming confidence is scaled by the
/// sample-size ratio only.
pub fn discounted_confidence(base: Side, incoming: Side) -> Estimate {
    let (w_b, w_i) = (base.weight(), incoming.weight());
    let denominator = w_b * incoming.confidence + w_i * base.confidence;

    if denominator == 0.0 || !denominator.is_finite() {
        return Estimate::fallback(sample_ratio_confidence(incoming, base.n));
    }

    Estimate::exact(w_i * base.confidence * incoming.confidence / denominator)
}

/// Confidence of a novel rule: `c_i * n_i / (n_b + n_i)`
pub fn novel_confidence(incoming: Side, base_n: u64) -> f64 {
    sample_ratio_confidence(incoming, base_n).clamp(0.0, 1.0)
}

fn sample_ratio_confidence(incoming: Side, base_n: u64) -> f64 {
    let total = base_n.saturating_add(incoming.n);
    if total == 0 {
        return incoming.confidence;
    }
    incoming.confidence * incoming.n as f64 / total as f64
}
