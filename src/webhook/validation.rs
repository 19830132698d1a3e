//! NodeReadinessRule admission validation
//!
//! Field checks the CRD schema cannot express, plus the cross-rule
//! uniqueness guarantee the reconcilers rely on: at most one rule may manage
//! a given (taint key, taint effect) tuple.

use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};

use crate::crd::{EnforcementMode, NodeReadinessRule, NodeReadinessRuleSpec, TaintEffect};
use crate::error::{Error, Result};

/// A single validation failure, anchored to the offending field path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a rule spec in isolation. Returns every issue found.
pub fn validate_spec(spec: &NodeReadinessRuleSpec) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if spec.conditions.is_empty() {
        issues.push(ValidationIssue::new(
            "spec.conditions",
            "at least one condition requirement is required",
        ));
    }
    if spec.conditions.len() > 32 {
        issues.push(ValidationIssue::new(
            "spec.conditions",
            "at most 32 condition requirements are allowed",
        ));
    }
    for (i, condition) in spec.conditions.iter().enumerate() {
        if condition.type_.is_empty() {
            issues.push(ValidationIssue::new(
                format!("spec.conditions[{i}].type"),
                "condition type must not be empty",
            ));
        }
        if condition.type_.len() > 316 {
            issues.push(ValidationIssue::new(
                format!("spec.conditions[{i}].type"),
                "condition type must be at most 316 characters",
            ));
        }
    }

    if spec.node_selector.selects_all() {
        issues.push(ValidationIssue::new(
            "spec.nodeSelector",
            "a node selector is required",
        ));
    } else if let Err(err) = spec.node_selector.validate() {
        issues.push(ValidationIssue::new("spec.nodeSelector", err));
    }

    if spec.taint.key.is_empty() {
        issues.push(ValidationIssue::new(
            "spec.taint.key",
            "taint key must not be empty",
        ));
    }

    issues
}

/// Warnings returned alongside an allowed response.
pub fn spec_warnings(spec: &NodeReadinessRuleSpec) -> Vec<String> {
    let mut warnings = Vec::new();

    if spec.taint.effect == TaintEffect::NoExecute
        && spec.enforcement_mode == EnforcementMode::Continuous
    {
        warnings.push(
            "a continuous rule with a NoExecute taint will evict running workloads \
             whenever the node's conditions regress"
                .to_string(),
        );
    }

    warnings
}

/// Reject a rule whose (taint key, effect) tuple is already managed by a
/// different rule. The reconcilers remove taints by exact triple regardless
/// of origin, so two rules sharing a tuple would thrash against each other.
pub async fn check_taint_uniqueness(
    client: Client,
    rule: &NodeReadinessRule,
) -> Result<Option<ValidationIssue>> {
    let rules: Api<NodeReadinessRule> = Api::all(client);
    let existing = rules
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    let name = rule.name_any();
    for other in existing.items {
        if other.name_any() == name {
            continue;
        }
        if other.spec.taint.key == rule.spec.taint.key
            && other.spec.taint.effect == rule.spec.taint.effect
        {
            return Ok(Some(ValidationIssue::new(
                "spec.taint",
                format!(
                    "taint ({}, {}) is already managed by rule {:?}",
                    rule.spec.taint.key,
                    rule.spec.taint.effect,
                    other.name_any()
                ),
            )));
        }
    }

    Ok(None)
}
