//! Shared readiness-controller state and node mutation
//!
//! Both control loops (rule-driven and node-driven) work through one
//! `ReadinessController` value: it owns the rule cache, the event recorder
//! and every write the operator makes to a node. Keeping the writes here
//! guarantees the two loops converge on the same answer for any (rule, node)
//! pair.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::Resource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::crd::{
    EnforcementMode, NodeEvaluation, NodeReadinessRule, NodeReadinessRuleReport, RuleStatus,
    TaintSpec, TaintStatus,
};
use crate::error::{Error, Result};

use super::cache::RuleCache;
use super::evaluator::{self, reason, Evaluation};

/// Finalizer keeping a rule alive until its taints are cleaned up.
pub const CLEANUP_FINALIZER: &str = "readiness.node.x-k8s.io/cleanup-taints";

/// Prefix of the per-rule bootstrap-completion marker annotation on nodes.
pub const BOOTSTRAP_ANNOTATION_PREFIX: &str = "readiness.k8s.io/bootstrap-completed-";

/// Field manager used for all patches issued by the operator.
pub const FIELD_MANAGER: &str = "node-readiness-operator";

/// Event reasons emitted on rules.
pub mod events {
    pub const TAINT_ADDED: &str = "TaintAdded";
    pub const TAINT_REMOVED: &str = "TaintRemoved";
    pub const BOOTSTRAP_COMPLETED: &str = "BootstrapCompleted";
    pub const EVALUATION_ERROR: &str = "EvaluationError";

    pub const ACTION_RECONCILE: &str = "Reconcile";
    pub const ACTION_TAINT: &str = "Taint";
    pub const ACTION_BOOTSTRAP: &str = "Bootstrap";
}

/// Result of enforcing one rule on one node.
#[derive(Clone, Debug)]
pub struct Enforcement {
    /// The underlying evaluation.
    pub evaluation: Evaluation,

    /// Taint state after enforcement. For dry-run rules this is the state
    /// enforcement would have produced.
    pub final_taint: TaintStatus,

    /// Whether a node write actually happened.
    pub changed: bool,
}

impl Enforcement {
    /// Whether the rule's conditions were evaluated on this node (selector
    /// matched and the selector itself was valid). Only evaluated nodes get
    /// `nodeEvaluations` entries in the rule status.
    pub fn conditions_evaluated(&self) -> bool {
        !matches!(
            self.evaluation.reason,
            reason::INVALID_SELECTOR | reason::SELECTOR_MISMATCH
        )
    }

    /// The `nodeEvaluations` entry for this enforcement.
    pub fn to_node_evaluation(&self, node_name: &str) -> NodeEvaluation {
        NodeEvaluation {
            node_name: node_name.to_string(),
            condition_results: self.evaluation.condition_results.clone(),
            taint_status: self.final_taint,
            last_evaluation_time: Utc::now().to_rfc3339(),
        }
    }
}

/// Process-wide controller state shared by the rule, node and report loops.
pub struct ReadinessController {
    client: Client,
    cache: RuleCache,
    recorder: Recorder,
}

impl ReadinessController {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            cache: RuleCache::new(),
            client,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    pub fn rules(&self) -> Api<NodeReadinessRule> {
        Api::all(self.client.clone())
    }

    pub fn reports(&self) -> Api<NodeReadinessRuleReport> {
        Api::all(self.client.clone())
    }

    /// Annotation key marking bootstrap completion of a rule on a node.
    pub fn bootstrap_annotation(rule_name: &str) -> String {
        format!("{BOOTSTRAP_ANNOTATION_PREFIX}{rule_name}")
    }

    /// Whether the node carries the completion marker for a rule.
    pub fn bootstrap_completed(node: &Node, rule_name: &str) -> bool {
        node.metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(&Self::bootstrap_annotation(rule_name)))
            .unwrap_or(false)
    }

    /// Record bootstrap completion on the node. The marker is an annotation
    /// so it shares the node's lifetime and needs no extra persistence; it is
    /// patched separately from the taint write so the two never race inside
    /// one update.
    pub async fn mark_bootstrap_completed(&self, node: &mut Node, rule_name: &str) -> Result<()> {
        let node_name = node.name_any();
        let key = Self::bootstrap_annotation(rule_name);
        let patch = json!({
            "metadata": {
                "annotations": { key: Utc::now().to_rfc3339() }
            }
        });

        let updated = match self
            .nodes()
            .patch(
                &node_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(updated) => updated,
            // the node is gone; its markers are gone with it
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(Error::KubeError(e)),
        };
        *node = updated;

        info!(node = %node_name, rule = %rule_name, "Bootstrap completed");

        #[cfg(feature = "metrics")]
        super::metrics::inc_bootstrap_completed(rule_name);

        Ok(())
    }

    /// Append the taint to the node spec if absent. Returns whether a write
    /// happened; the in-memory node is refreshed on write so follow-up
    /// mutations in the same pass do not trip over a stale resource version.
    pub async fn add_taint(
        &self,
        node: &mut Node,
        taint: &TaintSpec,
        rule_name: &str,
    ) -> Result<bool> {
        if evaluator::node_has_taint(node, taint) {
            return Ok(false);
        }

        let node_name = node.name_any();
        let mut desired = node.clone();
        desired
            .spec
            .get_or_insert_with(Default::default)
            .taints
            .get_or_insert_with(Vec::new)
            .push(taint.to_k8s());

        // A node deleted mid-reconcile is benign: its taints died with it.
        let updated = match self
            .nodes()
            .replace(&node_name, &PostParams::default(), &desired)
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
            Err(e) => return Err(Error::KubeError(e)),
        };
        *node = updated;

        debug!(
            node = %node_name,
            rule = %rule_name,
            key = %taint.key,
            effect = %taint.effect,
            "Added taint"
        );

        #[cfg(feature = "metrics")]
        super::metrics::inc_taint_operation(rule_name, "add");

        Ok(true)
    }

    /// Remove every taint equal to the (key, value, effect) triple. Returns
    /// whether a write happened.
    pub async fn remove_taint(
        &self,
        node: &mut Node,
        taint: &TaintSpec,
        rule_name: &str,
    ) -> Result<bool> {
        if !evaluator::node_has_taint(node, taint) {
            return Ok(false);
        }

        let node_name = node.name_any();
        let mut desired = node.clone();
        if let Some(taints) = desired.spec.as_mut().and_then(|s| s.taints.as_mut()) {
            taints.retain(|t| !taint.matches(t));
        }

        let updated = match self
            .nodes()
            .replace(&node_name, &PostParams::default(), &desired)
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
            Err(e) => return Err(Error::KubeError(e)),
        };
        *node = updated;

        debug!(
            node = %node_name,
            rule = %rule_name,
            key = %taint.key,
            effect = %taint.effect,
            "Removed taint"
        );

        #[cfg(feature = "metrics")]
        super::metrics::inc_taint_operation(rule_name, "remove");

        Ok(true)
    }

    /// Publish an event on a rule. Fire-and-forget: a failed event must never
    /// break reconciliation.
    pub async fn publish_rule_event(
        &self,
        rule: &NodeReadinessRule,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let reference: ObjectReference = rule.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(rule = %rule.name_any(), reason, error = %e, "Failed to publish event");
        }
    }

    /// Converge one (rule, node) pair.
    ///
    /// Returns `None` for a rule with a deletion timestamp: a dying rule must
    /// not contribute new taints, and its removals run through the rule
    /// reconciler's cleanup sweep. Dry-run rules go through the same decision
    /// path with every node write skipped.
    pub async fn enforce_rule_on_node(
        &self,
        rule: &NodeReadinessRule,
        node: &mut Node,
    ) -> Result<Option<Enforcement>> {
        if rule.meta().deletion_timestamp.is_some() {
            return Ok(None);
        }

        let rule_name = rule.name_any();
        let node_name = node.name_any();
        let dry_run = rule.spec.dry_run;
        let evaluation = evaluator::evaluate(rule, node);

        if evaluation.rule_status == RuleStatus::Error {
            warn!(
                rule = %rule_name,
                node = %node_name,
                reason = evaluation.reason,
                "Rule evaluation failed"
            );
            self.publish_rule_event(
                rule,
                EventType::Warning,
                events::EVALUATION_ERROR,
                events::ACTION_RECONCILE,
                format!("Failed to evaluate node {node_name}: {}", evaluation.message),
            )
            .await;

            #[cfg(feature = "metrics")]
            super::metrics::inc_failure(&rule_name, evaluation.reason);

            let final_taint = evaluation.taint_status();
            return Ok(Some(Enforcement {
                evaluation,
                final_taint,
                changed: false,
            }));
        }

        // Outside the selector the rule's taint has no business being on the
        // node; remove the exact triple if a prior match left it behind.
        if evaluation.reason == reason::SELECTOR_MISMATCH {
            let mut changed = false;
            if evaluation.taint_present && !dry_run {
                changed = self
                    .remove_taint(node, &rule.spec.taint, &rule_name)
                    .await?;
                if changed {
                    self.publish_rule_event(
                        rule,
                        EventType::Normal,
                        events::TAINT_REMOVED,
                        events::ACTION_TAINT,
                        format!(
                            "Removed taint {} from node {node_name}: node no longer selected",
                            rule.spec.taint.key
                        ),
                    )
                    .await;
                }
            }
            return Ok(Some(Enforcement {
                evaluation,
                final_taint: TaintStatus::Absent,
                changed,
            }));
        }

        let bootstrap_only = rule.spec.enforcement_mode == EnforcementMode::BootstrapOnly;

        // A completed bootstrap pins the taint absent no matter what the
        // conditions currently say.
        if bootstrap_only && Self::bootstrap_completed(node, &rule_name) {
            let mut changed = false;
            if evaluation.taint_present && !dry_run {
                changed = self
                    .remove_taint(node, &rule.spec.taint, &rule_name)
                    .await?;
                if changed {
                    self.publish_rule_event(
                        rule,
                        EventType::Normal,
                        events::TAINT_REMOVED,
                        events::ACTION_TAINT,
                        format!(
                            "Removed taint {} from node {node_name}: bootstrap already completed",
                            rule.spec.taint.key
                        ),
                    )
                    .await;
                }
            }
            return Ok(Some(Enforcement {
                evaluation,
                final_taint: TaintStatus::Absent,
                changed,
            }));
        }

        if evaluation.rule_status == RuleStatus::Matched {
            let mut changed = false;
            if !dry_run {
                if evaluation.taint_present {
                    changed = self
                        .remove_taint(node, &rule.spec.taint, &rule_name)
                        .await?;
                    if changed {
                        self.publish_rule_event(
                            rule,
                            EventType::Normal,
                            events::TAINT_REMOVED,
                            events::ACTION_TAINT,
                            format!(
                                "Removed taint {} from node {node_name}: all conditions met",
                                rule.spec.taint.key
                            ),
                        )
                        .await;
                    }
                }
                if bootstrap_only {
                    self.mark_bootstrap_completed(node, &rule_name).await?;
                    self.publish_rule_event(
                        rule,
                        EventType::Normal,
                        events::BOOTSTRAP_COMPLETED,
                        events::ACTION_BOOTSTRAP,
                        format!("Node {node_name} completed bootstrap for rule {rule_name}"),
                    )
                    .await;
                }
            }
            return Ok(Some(Enforcement {
                evaluation,
                final_taint: TaintStatus::Absent,
                changed,
            }));
        }

        // Conditions unmet: the node is not ready for scheduling.
        let mut changed = false;
        if !evaluation.taint_present && !dry_run {
            changed = self.add_taint(node, &rule.spec.taint, &rule_name).await?;
            if changed {
                self.publish_rule_event(
                    rule,
                    EventType::Normal,
                    events::TAINT_ADDED,
                    events::ACTION_TAINT,
                    format!(
                        "Added taint {} to node {node_name}: {}",
                        rule.spec.taint.key, evaluation.message
                    ),
                )
                .await;
            }
        }
        Ok(Some(Enforcement {
            evaluation,
            final_taint: TaintStatus::Present,
            changed,
        }))
    }
}
