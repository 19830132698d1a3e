//! Rule-versus-node evaluation
//!
//! The evaluator is a pure function of a rule and a node: it performs no I/O
//! and never mutates either input. Both control loops and the report builder
//! share it so a rule can only ever mean one thing for a given node.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;

use crate::crd::{
    ConditionResult, ConditionStatus, NodeReadinessRule, RuleStatus, TaintSpec, TaintStatus,
};

/// Machine-readable evaluation outcomes surfaced in statuses and reports.
pub mod reason {
    pub const INVALID_SELECTOR: &str = "InvalidSelector";
    pub const SELECTOR_MISMATCH: &str = "SelectorMismatch";
    pub const CONDITION_NOT_FOUND: &str = "ConditionNotFound";
    pub const CONDITION_STATUS_MISMATCH: &str = "ConditionStatusMismatch";
    pub const CRITERIA_MET: &str = "CriteriaMet";
}

/// Outcome of evaluating one rule against one node.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Name of the evaluated rule.
    pub rule_name: String,

    /// Overall outcome: Matched, Unmatched or Error.
    pub rule_status: RuleStatus,

    /// Whether the rule's taint triple was observed on the node.
    pub taint_present: bool,

    /// Machine-readable outcome reason.
    pub reason: &'static str,

    /// Human-readable explanation.
    pub message: String,

    /// Per-requirement comparison, in rule order, up to and including the
    /// first failing requirement.
    pub condition_results: Vec<ConditionResult>,
}

impl Evaluation {
    /// Observed taint state as it appears in statuses and reports.
    pub fn taint_status(&self) -> TaintStatus {
        if self.taint_present {
            TaintStatus::Present
        } else {
            TaintStatus::Absent
        }
    }
}

/// Status of a typed condition on the node; `Unknown` when absent.
pub fn condition_status(node: &Node, type_: &str) -> ConditionStatus {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == type_))
        .map(|c| ConditionStatus::parse(&c.status))
        .unwrap_or(ConditionStatus::Unknown)
}

/// Whether a typed condition exists on the node at all.
pub fn condition_exists(node: &Node, type_: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == type_))
        .unwrap_or(false)
}

/// Whether the node carries the exact (key, value, effect) taint triple.
pub fn node_has_taint(node: &Node, taint: &TaintSpec) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| taints.iter().any(|t| taint.matches(t)))
        .unwrap_or(false)
}

fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

/// Evaluate a rule against a node.
///
/// Outcomes, in decision order:
/// - `Error`/`InvalidSelector` when the selector cannot be interpreted;
/// - `Unmatched`/`SelectorMismatch` when the node's labels fall outside it;
/// - `Unmatched`/`ConditionNotFound` when a required condition type is absent
///   (recorded with `currentStatus: Unknown`);
/// - `Unmatched`/`ConditionStatusMismatch` on the first status disagreement;
/// - `Matched`/`CriteriaMet` when every requirement passes.
pub fn evaluate(rule: &NodeReadinessRule, node: &Node) -> Evaluation {
    let rule_name = rule.metadata.name.clone().unwrap_or_default();
    let taint_present = node_has_taint(node, &rule.spec.taint);

    let mut result = Evaluation {
        rule_name,
        rule_status: RuleStatus::Unmatched,
        taint_present,
        reason: reason::SELECTOR_MISMATCH,
        message: String::new(),
        condition_results: Vec::new(),
    };

    if let Err(err) = rule.spec.node_selector.validate() {
        result.rule_status = RuleStatus::Error;
        result.reason = reason::INVALID_SELECTOR;
        result.message = format!("Failed to parse NodeSelector: {err}");
        return result;
    }

    if !rule.spec.node_selector.matches(&node_labels(node)) {
        result.reason = reason::SELECTOR_MISMATCH;
        result.message = "Node labels do not match the rule's NodeSelector.".to_string();
        return result;
    }

    for requirement in &rule.spec.conditions {
        if !condition_exists(node, &requirement.type_) {
            result.condition_results.push(ConditionResult {
                type_: requirement.type_.clone(),
                required_status: requirement.required_status,
                current_status: ConditionStatus::Unknown,
            });
            result.reason = reason::CONDITION_NOT_FOUND;
            result.message = format!(
                "Required condition '{}' was not found on the Node.",
                requirement.type_
            );
            return result;
        }

        let current = condition_status(node, &requirement.type_);
        result.condition_results.push(ConditionResult {
            type_: requirement.type_.clone(),
            required_status: requirement.required_status,
            current_status: current,
        });

        if current != requirement.required_status {
            result.reason = reason::CONDITION_STATUS_MISMATCH;
            result.message = format!(
                "Condition '{}' is '{}', required '{}'.",
                requirement.type_, current, requirement.required_status
            );
            return result;
        }
    }

    result.rule_status = RuleStatus::Matched;
    result.reason = reason::CRITERIA_MET;
    result.message = "Node successfully matches all rule criteria.".to_string();
    result
}
