//! NodeReadinessRule Custom Resource Definition
//!
//! A NodeReadinessRule binds a set of node-condition requirements to a single
//! scheduling taint. While a selected node fails the requirements the taint is
//! kept on it; once the requirements pass the taint is removed. The
//! `bootstrap-only` mode stops managing a node after its first successful pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::report::TaintStatus;

/// How the controller maintains the desired taint state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EnforcementMode {
    /// Manage the taint only until the node first satisfies the rule's
    /// conditions; thereafter the controller is inert for that node.
    #[serde(rename = "bootstrap-only")]
    BootstrapOnly,

    /// Track condition state for the whole lifetime of the (rule, node) pair.
    #[default]
    #[serde(rename = "continuous")]
    Continuous,
}

/// Tri-state status of a node condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Parse the wire representation found on `NodeCondition.status`.
    /// Anything unrecognized reads as `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node condition and the status it must have for the rule to be satisfied.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRequirement {
    /// Type of the node condition, e.g. `Ready` or `NetworkReady`.
    #[serde(rename = "type")]
    #[schemars(length(min = 1, max = 316))]
    pub type_: String,

    /// Status the condition must report, one of True, False, Unknown.
    pub required_status: ConditionStatus,
}

/// Taint effect accepted by the rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl std::fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The taint managed by a rule, identified by the full (key, value, effect)
/// triple. The controller only ever adds or removes exact triples so it never
/// disturbs unrelated taints that happen to share a key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaintSpec {
    /// Taint key, e.g. `readiness.k8s.io/db-unready`.
    pub key: String,

    /// Optional taint value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Taint effect.
    pub effect: TaintEffect,
}

impl TaintSpec {
    /// Whether a node taint is this exact (key, value, effect) triple.
    /// An absent value and an empty value compare equal, matching the
    /// apiserver's normalization.
    pub fn matches(&self, taint: &Taint) -> bool {
        taint.key == self.key
            && taint.effect == self.effect.as_str()
            && taint.value.as_deref().unwrap_or("") == self.value.as_deref().unwrap_or("")
    }

    /// The corev1 representation used when writing the node spec.
    pub fn to_k8s(&self) -> Taint {
        Taint {
            key: self.key.clone(),
            value: self.value.clone(),
            effect: self.effect.as_str().to_string(),
            time_added: None,
        }
    }
}

/// Operator of a selector requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single match expression over node labels.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SelectorRequirement {
    /// Label key the requirement applies to.
    pub key: String,

    /// Relationship between the key and the values.
    pub operator: SelectorOperator,

    /// Values for In / NotIn. Must be absent for Exists / DoesNotExist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

/// Label selector limiting which nodes a rule applies to. `matchLabels` and
/// `matchExpressions` are ANDed; an empty selector selects every node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

impl NodeSelector {
    /// Whether the selector places no constraint at all.
    pub fn selects_all(&self) -> bool {
        self.match_labels.as_ref().map_or(true, |l| l.is_empty())
            && self.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    }

    /// Reject selectors the apiserver could never satisfy: malformed label
    /// keys, In/NotIn without values, Exists/DoesNotExist with values.
    pub fn validate(&self) -> Result<(), String> {
        for key in self.match_labels.iter().flat_map(|l| l.keys()) {
            validate_label_key(key)?;
        }

        for expr in self.match_expressions.iter().flatten() {
            validate_label_key(&expr.key)?;
            let values = expr.values.as_ref().map(Vec::len).unwrap_or(0);
            match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn if values == 0 => {
                    return Err(format!(
                        "values must be specified when operator is In or NotIn (key {:?})",
                        expr.key
                    ));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist if values != 0 => {
                    return Err(format!(
                        "values must be empty when operator is Exists or DoesNotExist (key {:?})",
                        expr.key
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Whether a node's label set satisfies the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in self.match_labels.iter().flatten() {
            if labels.get(k) != Some(v) {
                return false;
            }
        }

        for expr in self.match_expressions.iter().flatten() {
            let matched = match expr.operator {
                SelectorOperator::In => labels
                    .get(&expr.key)
                    .map(|v| expr.values.iter().flatten().any(|want| want == v))
                    .unwrap_or(false),
                SelectorOperator::NotIn => labels
                    .get(&expr.key)
                    .map(|v| !expr.values.iter().flatten().any(|want| want == v))
                    .unwrap_or(true),
                SelectorOperator::Exists => labels.contains_key(&expr.key),
                SelectorOperator::DoesNotExist => !labels.contains_key(&expr.key),
            };
            if !matched {
                return false;
            }
        }

        true
    }
}

/// Validate a label key of the form `[prefix/]name`.
fn validate_label_key(key: &str) -> Result<(), String> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > 253 {
                return Err(format!("invalid label key prefix {prefix:?}"));
            }
            name
        }
        None => key,
    };

    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(format!("invalid label key {key:?}"))
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "readiness.node.x-k8s.io",
    version = "v1alpha1",
    kind = "NodeReadinessRule",
    status = "NodeReadinessRuleStatus",
    shortname = "nrr",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.enforcementMode"}"#,
    printcolumn = r#"{"name":"Taint","type":"string","jsonPath":".spec.taint.key"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessRuleSpec {
    /// Node conditions that must all hold for the taint to be lifted.
    #[schemars(length(min = 1, max = 32))]
    pub conditions: Vec<ConditionRequirement>,

    /// Whether the rule manages the taint continuously or only until the
    /// node first passes.
    pub enforcement_mode: EnforcementMode,

    /// The taint applied while the conditions are not satisfied.
    pub taint: TaintSpec,

    /// Limits the rule to a subset of nodes. An empty selector matches all.
    #[serde(default)]
    pub node_selector: NodeSelector,

    /// Evaluate and report without mutating any node.
    #[serde(default)]
    pub dry_run: bool,
}

/// Observed state of a NodeReadinessRule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessRuleStatus {
    /// Generation most recently processed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the rule was last evaluated against the cluster's nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_time: Option<String>,

    /// Outcome preview populated when `spec.dryRun` is set. Serialized even
    /// when absent so a merge patch clears stale results once dry-run is
    /// switched off.
    #[serde(default)]
    pub dry_run_results: Option<DryRunResults>,

    /// Per-node evaluation records, sorted by node name. Serialized even when
    /// empty so a merge patch clears entries for nodes that left the selector.
    #[serde(default)]
    pub node_evaluations: Vec<NodeEvaluation>,
}

/// Counts of the actions the controller would take if the rule were enforced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResults {
    /// Nodes matching the rule's selector.
    pub affected_nodes: i32,

    /// Matching nodes that would gain the taint.
    pub taints_to_add: i32,

    /// Matching nodes that would have the taint removed.
    pub taints_to_remove: i32,

    /// Matching nodes missing one or more required condition types entirely.
    pub risky_operations: i32,

    /// Human-readable overview of the evaluation.
    pub summary: String,
}

/// Result of evaluating the rule against one node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvaluation {
    /// Name of the evaluated node.
    pub node_name: String,

    /// Per-requirement comparison of required and observed status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_results: Vec<ConditionResult>,

    /// Whether the rule's taint is on the node after this evaluation.
    pub taint_status: TaintStatus,

    /// When this evaluation happened.
    pub last_evaluation_time: String,
}

/// One condition requirement compared against the node's reported status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionResult {
    /// Condition type that was checked.
    #[serde(rename = "type")]
    pub type_: String,

    /// Status the rule requires.
    pub required_status: ConditionStatus,

    /// Status observed on the node; Unknown when the condition is absent.
    pub current_status: ConditionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = NodeSelector::default();
        assert!(selector.selects_all());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn match_labels_require_exact_values() {
        let selector = NodeSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: None,
        };
        assert!(selector.matches(&labels(&[("env", "prod"), ("zone", "a")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn match_expressions_are_anded_with_labels() {
        let selector = NodeSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: Some(vec![SelectorRequirement {
                key: "zone".into(),
                operator: SelectorOperator::In,
                values: Some(vec!["a".into(), "b".into()]),
            }]),
        };
        assert!(selector.matches(&labels(&[("env", "prod"), ("zone", "b")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("zone", "c")])));
        assert!(!selector.matches(&labels(&[("zone", "a")])));
    }

    #[test]
    fn not_in_matches_when_key_is_absent() {
        let selector = NodeSelector {
            match_labels: None,
            match_expressions: Some(vec![SelectorRequirement {
                key: "tier".into(),
                operator: SelectorOperator::NotIn,
                values: Some(vec!["spot".into()]),
            }]),
        };
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("tier", "ondemand")])));
        assert!(!selector.matches(&labels(&[("tier", "spot")])));
    }

    #[test]
    fn exists_and_does_not_exist() {
        let selector = NodeSelector {
            match_labels: None,
            match_expressions: Some(vec![
                SelectorRequirement {
                    key: "node-role.kubernetes.io/worker".into(),
                    operator: SelectorOperator::Exists,
                    values: None,
                },
                SelectorRequirement {
                    key: "cordoned".into(),
                    operator: SelectorOperator::DoesNotExist,
                    values: None,
                },
            ]),
        };
        assert!(selector.matches(&labels(&[("node-role.kubernetes.io/worker", "")])));
        assert!(!selector.matches(&labels(&[
            ("node-role.kubernetes.io/worker", ""),
            ("cordoned", "true"),
        ])));
    }

    #[test]
    fn in_without_values_is_invalid() {
        let selector = NodeSelector {
            match_labels: None,
            match_expressions: Some(vec![SelectorRequirement {
                key: "env".into(),
                operator: SelectorOperator::In,
                values: None,
            }]),
        };
        assert!(selector.validate().is_err());
    }

    #[test]
    fn exists_with_values_is_invalid() {
        let selector = NodeSelector {
            match_labels: None,
            match_expressions: Some(vec![SelectorRequirement {
                key: "env".into(),
                operator: SelectorOperator::Exists,
                values: Some(vec!["prod".into()]),
            }]),
        };
        assert!(selector.validate().is_err());
    }

    #[test]
    fn malformed_label_key_is_invalid() {
        let selector = NodeSelector {
            match_labels: Some(labels(&[("-123-worker", "machine")])),
            match_expressions: None,
        };
        assert!(selector.validate().is_err());

        let ok = NodeSelector {
            match_labels: Some(labels(&[("node-role.kubernetes.io/worker", "")])),
            match_expressions: None,
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn taint_spec_matches_full_triple() {
        let spec = TaintSpec {
            key: "readiness.k8s.io/db-unready".into(),
            value: None,
            effect: TaintEffect::NoSchedule,
        };

        assert!(spec.matches(&Taint {
            key: "readiness.k8s.io/db-unready".into(),
            value: None,
            effect: "NoSchedule".into(),
            time_added: None,
        }));
        // empty string and absent value are the same taint
        assert!(spec.matches(&Taint {
            key: "readiness.k8s.io/db-unready".into(),
            value: Some(String::new()),
            effect: "NoSchedule".into(),
            time_added: None,
        }));
        assert!(!spec.matches(&Taint {
            key: "readiness.k8s.io/db-unready".into(),
            value: Some("pending".into()),
            effect: "NoSchedule".into(),
            time_added: None,
        }));
        assert!(!spec.matches(&Taint {
            key: "readiness.k8s.io/db-unready".into(),
            value: None,
            effect: "NoExecute".into(),
            time_added: None,
        }));
    }

    #[test]
    fn enforcement_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&EnforcementMode::BootstrapOnly).unwrap(),
            "\"bootstrap-only\""
        );
        assert_eq!(
            serde_json::to_string(&EnforcementMode::Continuous).unwrap(),
            "\"continuous\""
        );
    }

    #[test]
    fn condition_status_parses_node_strings() {
        assert_eq!(ConditionStatus::parse("True"), ConditionStatus::True);
        assert_eq!(ConditionStatus::parse("False"), ConditionStatus::False);
        assert_eq!(ConditionStatus::parse("Unknown"), ConditionStatus::Unknown);
        assert_eq!(ConditionStatus::parse("bogus"), ConditionStatus::Unknown);
    }
}
