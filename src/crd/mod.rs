//! Custom Resource Definitions for the node readiness operator

mod report;
mod rule;


pub use report::{
    report_name, NodeReadinessRuleReport, NodeReadinessRuleReportSpec,
    NodeReadinessRuleReportStatus, ReadinessReport, ReportSummary, RuleStatus, TaintStatus,
};
pub use rule::{
    ConditionRequirement, ConditionResult, ConditionStatus, DryRunResults, EnforcementMode,
    NodeEvaluation, NodeReadinessRule, NodeReadinessRuleSpec, NodeReadinessRuleStatus,
    NodeSelector, SelectorOperator, SelectorRequirement, TaintEffect, TaintSpec,
};
