//! NodeReadinessRuleReport Custom Resource Definition
//!
//! One report exists per node, owner-referenced to it so garbage collection
//! removes the report with the node. The status carries the outcome of every
//! rule's evaluation against that node plus a roll-up summary.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Overall outcome of a rule's criteria against a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RuleStatus {
    /// Selector and every condition requirement passed.
    Matched,

    /// Selector or a condition requirement did not pass.
    #[default]
    Unmatched,

    /// Evaluation itself failed, e.g. an unparseable selector. The controller
    /// cannot tell whether the taint should be present.
    Error,
}

/// Observed presence of a rule's taint on a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TaintStatus {
    Present,
    #[default]
    Absent,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "readiness.node.x-k8s.io",
    version = "v1alpha1",
    kind = "NodeReadinessRuleReport",
    status = "NodeReadinessRuleReportStatus",
    shortname = "nrrp",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Matched Rules","type":"integer","jsonPath":".status.summary.matchedRules"}"#,
    printcolumn = r#"{"name":"Applied Taints","type":"integer","jsonPath":".status.summary.appliedTaints"}"#,
    printcolumn = r#"{"name":"Errors","type":"integer","jsonPath":".status.summary.errors"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessRuleReportSpec {
    /// Name of the node this report describes. Immutable once set; the report
    /// is the single audit record for that node.
    #[schemars(regex(
        pattern = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$"
    ))]
    pub node_name: String,
}

/// Observed state of a NodeReadinessRuleReport.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessRuleReportStatus {
    /// One entry per rule, sorted by rule name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_reports: Vec<ReadinessReport>,

    /// Roll-up counters over all entries.
    #[serde(default)]
    pub summary: ReportSummary,
}

/// Outcome of evaluating one rule against the report's node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    /// Name of the evaluated NodeReadinessRule.
    pub rule_name: String,

    /// Machine-readable outcome, e.g. `CriteriaMet` or `SelectorMismatch`.
    pub reason: String,

    /// Human-readable explanation of the outcome.
    pub message: String,

    /// Whether the node matched the rule's selector and conditions.
    pub rule_status: RuleStatus,

    /// Whether the rule's taint is currently on the node.
    pub taint_status: TaintStatus,

    /// When the controller last assessed this rule against the node.
    pub last_evaluation_time: String,
}

/// High-level overview of the rules applied to a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    /// Rules currently matching the node.
    pub matched_rules: i32,

    /// Rules currently not matching the node.
    pub un_matched_rules: i32,

    /// Taints from these rules currently present on the node.
    pub applied_taints: i32,

    /// Rules that failed to evaluate.
    pub errors: i32,
}

/// Deterministic report name for a node.
pub fn report_name(node_name: &str) -> String {
    format!("nrr-report-{node_name}")
}
