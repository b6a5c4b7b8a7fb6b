//! Rule Merge - weighted reconciliation of rule-based classifiers
//!
//! This crate is the pure, deterministic core of a federated round:
//!
//! - **Statistics** ([`stats`]): sample-size weighted support/confidence
//!   reconciliation and the discount applied to rules without prior evidence
//! - **Pairwise fold** ([`engine`]): merge one model into another, resolving
//!   same-antecedent conflicts by estimated frequency
//! - **Round merge** ([`aggregate`]): reduce a round's submissions (and the
//!   prior global model) in a fixed order
//!
//! Nothing here does I/O or locking.
//!
//! # Example
//!
//! ```
//! use rule_merge::merge;
//! use rulefed_core::{Item, Rule, RuleModel};
//!
//! let a = RuleModel::new("label", vec![Rule::new([Item::new("x", "1")], "yes", 0.3, 0.8)], 100);
//! let b = RuleModel::new("label", vec![Rule::new([Item::new("x", "1")], "yes", 0.2, 0.6)], 50);
//!
//! let merged = merge(&a, 100, &b, 50);
//! assert_eq!(merged.rules.len(), 1);
//! assert!((merged.rules[0].support - 0.2667).abs() < 1e-4);
//! assert_eq!(merged.sample_size, 150);
//! ```

pub mod aggregate;
pub mod engine;
pub mod stats;

pub use aggregate::{aggregate, order_submissions, Aggregate};
pub use engine::{merge, merge_with_report, priority, sort_rules, MergeReport};
