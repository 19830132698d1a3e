//! Prometheus metrics for the node readiness operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `node_readiness_rules_total` (gauge): number of rules in the cache.
//! - `node_readiness_taint_operations_total` (counter): taint writes labeled
//!   by rule and operation (add/remove).
//! - `node_readiness_evaluation_duration_seconds` (histogram): duration of a
//!   full rule-vs-cluster evaluation pass.
//! - `node_readiness_failures_total` (counter): operational failures labeled
//!   by rule and reason.
//! - `node_readiness_bootstrap_completed_total` (counter): bootstrap
//!   completions labeled by rule.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for per-rule taint operation counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaintOpLabels {
    pub rule: String,
    pub operation: String,
}

/// Labels for per-rule failure counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub rule: String,
    pub reason: String,
}

/// Labels for per-rule counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleLabels {
    pub rule: String,
}

/// Gauge tracking the number of cached rules
pub static RULES_TOTAL: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Counter tracking taint operations performed by the controller
pub static TAINT_OPERATIONS: Lazy<Family<TaintOpLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking the duration of rule evaluation passes
pub static EVALUATION_DURATION_SECONDS: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(exponential_buckets(0.001, 2.0, 16)));

/// Counter tracking operational failures
pub static FAILURES_TOTAL: Lazy<Family<FailureLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking bootstrap completions
pub static BOOTSTRAP_COMPLETED_TOTAL: Lazy<Family<RuleLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "node_readiness_rules_total",
        "Number of NodeReadinessRules",
        RULES_TOTAL.clone(),
    );
    registry.register(
        "node_readiness_taint_operations_total",
        "Total number of taint operations performed by the controller",
        TAINT_OPERATIONS.clone(),
    );
    registry.register(
        "node_readiness_evaluation_duration_seconds",
        "Duration of rule evaluations",
        EVALUATION_DURATION_SECONDS.clone(),
    );
    registry.register(
        "node_readiness_failures_total",
        "Total number of operational failures",
        FAILURES_TOTAL.clone(),
    );
    registry.register(
        "node_readiness_bootstrap_completed_total",
        "Total number of nodes that have completed bootstrap",
        BOOTSTRAP_COMPLETED_TOTAL.clone(),
    );

    registry
});

/// Set the cached-rule gauge.
pub fn set_rules_total(count: i64) {
    RULES_TOTAL.set(count);
}

/// Count one taint write.
pub fn inc_taint_operation(rule: &str, operation: &str) {
    let labels = TaintOpLabels {
        rule: rule.to_string(),
        operation: operation.to_string(),
    };
    TAINT_OPERATIONS.get_or_create(&labels).inc();
}

/// Observe one full evaluation pass.
pub fn observe_evaluation_duration(seconds: f64) {
    EVALUATION_DURATION_SECONDS.observe(seconds);
}

/// Count one operational failure.
pub fn inc_failure(rule: &str, reason: &str) {
    let labels = FailureLabels {
        rule: rule.to_string(),
        reason: reason.to_string(),
    };
    FAILURES_TOTAL.get_or_create(&labels).inc();
}

/// Count one bootstrap completion.
pub fn inc_bootstrap_completed(rule: &str) {
    let labels = RuleLabels {
        rule: rule.to_string(),
    };
    BOOTSTRAP_COMPLETED_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &REGISTRY) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    buffer
}
