//! Controller module for node readiness reconciliation
//!
//! Three cooperating loops: the rule reconciler (rule events, fan-out to
//! nodes, deletion cleanup), the node reconciler (node events against the
//! cached rules) and the report reconciler (per-node audit reports). All
//! three share one `ReadinessController`.

mod cache;
pub mod evaluator;
#[cfg(feature = "metrics")]
pub mod metrics;
mod node;
mod readiness;
mod report;
mod rule;

pub use cache::RuleCache;
pub use node::{node_error_policy, reconcile_node, run_node_controller};
pub use readiness::{
    events, Enforcement, ReadinessController, BOOTSTRAP_ANNOTATION_PREFIX, CLEANUP_FINALIZER,
    FIELD_MANAGER,
};
pub use report::{reconcile_report, report_error_policy, run_report_controller};
pub use rule::{reconcile_rule, rule_error_policy, run_rule_controller};
