//! NodeReadinessRule reconciler
//!
//! Handles rule create/update/delete: installs the cleanup finalizer,
//! refreshes the in-memory cache, fans evaluation out to every node, writes
//! rule status (including the dry-run preview) and, on deletion, removes the
//! rule's taints from all nodes before releasing the finalizer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    DryRunResults, EnforcementMode, NodeEvaluation, NodeReadinessRule, NodeReadinessRuleStatus,
    RuleStatus,
};
use crate::error::{Error, Result};

use super::evaluator;
use super::readiness::{ReadinessController, CLEANUP_FINALIZER, FIELD_MANAGER};

/// Resync period for rules; bounds how stale the cache can get if a watch
/// event is missed.
const RULE_RESYNC: Duration = Duration::from_secs(300);

/// Start the rule controller and drive it until shutdown.
///
/// Besides rule events, every node add/change/delete enqueues all cached
/// rules so a fresh node is evaluated without waiting for the resync tick.
pub async fn run_rule_controller(ctx: Arc<ReadinessController>) {
    let rules = ctx.rules();
    let nodes = ctx.nodes();
    let cache = ctx.cache().clone();

    Controller::new(rules, WatcherConfig::default())
        .watches(nodes, WatcherConfig::default(), move |_node: Node| {
            cache
                .names()
                .into_iter()
                .map(|name| ObjectRef::<NodeReadinessRule>::new(&name))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile_rule, rule_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(rule = %obj.0.name, "Rule reconciled"),
                Err(e) => error!(error = ?e, "Rule reconcile error"),
            }
        })
        .await;
}

#[instrument(skip(ctx, rule), fields(rule = %rule.name_any()))]
pub async fn reconcile_rule(
    rule: Arc<NodeReadinessRule>,
    ctx: Arc<ReadinessController>,
) -> Result<Action> {
    let name = rule.name_any();

    // Re-read the rule so this pass works from committed state rather than a
    // possibly stale watch snapshot.
    let rule = match ctx.rules().get_opt(&name).await.map_err(Error::KubeError)? {
        Some(rule) => rule,
        None => {
            ctx.cache().delete(&name);
            return Ok(Action::await_change());
        }
    };

    if rule.meta().deletion_timestamp.is_some() {
        return cleanup_rule(&ctx, rule).await;
    }

    let rule = ensure_finalizer(&ctx, rule).await?;
    ctx.cache().put(rule.clone());

    #[cfg(feature = "metrics")]
    super::metrics::set_rules_total(ctx.cache().len() as i64);

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    // An unparseable selector poisons every node evaluation identically, so
    // fail the whole rule up front instead of once per node.
    if let Err(err) = rule.spec.node_selector.validate() {
        warn!(rule = %name, error = %err, "Invalid node selector");
        ctx.publish_rule_event(
            &rule,
            kube::runtime::events::EventType::Warning,
            super::readiness::events::EVALUATION_ERROR,
            super::readiness::events::ACTION_RECONCILE,
            format!("Failed to parse NodeSelector: {err}"),
        )
        .await;

        #[cfg(feature = "metrics")]
        super::metrics::inc_failure(&name, evaluator::reason::INVALID_SELECTOR);

        patch_rule_status(
            &ctx,
            &name,
            NodeReadinessRuleStatus {
                observed_generation: rule.meta().generation,
                last_evaluation_time: Some(Utc::now().to_rfc3339()),
                dry_run_results: None,
                node_evaluations: Vec::new(),
            },
        )
        .await?;
        return Ok(Action::requeue(RULE_RESYNC));
    }

    let nodes = list_nodes(&ctx).await?;
    let mut evaluations: Vec<NodeEvaluation> = Vec::new();
    let mut preview = DryRunCounts::default();

    for mut node in nodes {
        let node_name = node.name_any();
        let Some(enforcement) = ctx.enforce_rule_on_node(&rule, &mut node).await? else {
            continue;
        };

        if !enforcement.conditions_evaluated() {
            continue;
        }

        if rule.spec.dry_run {
            preview.observe(&rule, &node, &enforcement);
        }
        evaluations.push(enforcement.to_node_evaluation(&node_name));
    }

    evaluations.sort_by(|a, b| a.node_name.cmp(&b.node_name));

    let status = NodeReadinessRuleStatus {
        observed_generation: rule.meta().generation,
        last_evaluation_time: Some(Utc::now().to_rfc3339()),
        dry_run_results: rule.spec.dry_run.then(|| preview.into_results()),
        node_evaluations: evaluations,
    };
    patch_rule_status(&ctx, &name, status).await?;

    #[cfg(feature = "metrics")]
    super::metrics::observe_evaluation_duration(started.elapsed().as_secs_f64());

    Ok(Action::requeue(RULE_RESYNC))
}

/// Deletion path: sweep the rule's taint off every node it could have touched,
/// then release the finalizer so the apiserver can collect the object.
async fn cleanup_rule(
    ctx: &Arc<ReadinessController>,
    rule: NodeReadinessRule,
) -> Result<Action> {
    let name = rule.name_any();
    info!(rule = %name, "Cleaning up rule taints before deletion");

    // Make the deletion state visible to concurrent node reconciles first so
    // none of them re-adds the taint mid-sweep.
    ctx.cache().put(rule.clone());

    let selector_ok = rule.spec.node_selector.validate().is_ok();
    for mut node in list_nodes(ctx).await? {
        // An unparseable selector leaves no way to tell which nodes were
        // matched; sweep them all. Removal is by exact triple so nothing
        // unrelated is touched.
        let matched = !selector_ok
            || rule
                .spec
                .node_selector
                .matches(&node.metadata.labels.clone().unwrap_or_default());
        if !matched {
            continue;
        }

        if ctx.remove_taint(&mut node, &rule.spec.taint, &name).await? {
            ctx.publish_rule_event(
                &rule,
                kube::runtime::events::EventType::Normal,
                super::readiness::events::TAINT_REMOVED,
                super::readiness::events::ACTION_TAINT,
                format!(
                    "Removed taint {} from node {}: rule deleted",
                    rule.spec.taint.key,
                    node.name_any()
                ),
            )
            .await;
        }
    }

    remove_finalizer(ctx, &rule).await?;
    ctx.cache().delete(&name);

    #[cfg(feature = "metrics")]
    super::metrics::set_rules_total(ctx.cache().len() as i64);

    info!(rule = %name, "Released finalizer");
    Ok(Action::await_change())
}

/// Add the cleanup finalizer if missing, returning the stored object.
async fn ensure_finalizer(
    ctx: &Arc<ReadinessController>,
    rule: NodeReadinessRule,
) -> Result<NodeReadinessRule> {
    if rule
        .finalizers()
        .iter()
        .any(|f| f == CLEANUP_FINALIZER)
    {
        return Ok(rule);
    }

    let mut finalizers: Vec<String> = rule.finalizers().to_vec();
    finalizers.push(CLEANUP_FINALIZER.to_string());

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    let updated = ctx
        .rules()
        .patch(
            &rule.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;

    debug!(rule = %rule.name_any(), "Added cleanup finalizer");
    Ok(updated)
}

async fn remove_finalizer(ctx: &Arc<ReadinessController>, rule: &NodeReadinessRule) -> Result<()> {
    let finalizers: Vec<String> = rule
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != CLEANUP_FINALIZER)
        .cloned()
        .collect();

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    ctx.rules()
        .patch(
            &rule.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

async fn list_nodes(ctx: &Arc<ReadinessController>) -> Result<Vec<Node>> {
    let nodes = ctx
        .nodes()
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    Ok(nodes.items)
}

async fn patch_rule_status(
    ctx: &Arc<ReadinessController>,
    name: &str,
    status: NodeReadinessRuleStatus,
) -> Result<()> {
    let patch = json!({ "status": status });
    ctx.rules()
        .patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

pub fn rule_error_policy(
    rule: Arc<NodeReadinessRule>,
    error: &Error,
    _ctx: Arc<ReadinessController>,
) -> Action {
    error!(rule = %rule.name_any(), error = ?error, "Rule reconciliation error");
    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}

/// Accumulator for the dry-run preview over the rule's matching nodes.
#[derive(Default)]
struct DryRunCounts {
    affected_nodes: i32,
    taints_to_add: i32,
    taints_to_remove: i32,
    risky_operations: i32,
}

impl DryRunCounts {
    fn observe(
        &mut self,
        rule: &NodeReadinessRule,
        node: &Node,
        enforcement: &super::readiness::Enforcement,
    ) {
        self.affected_nodes += 1;

        let has_taint = enforcement.evaluation.taint_present;
        let met = enforcement.evaluation.rule_status == RuleStatus::Matched;
        let completed = rule.spec.enforcement_mode == EnforcementMode::BootstrapOnly
            && ReadinessController::bootstrap_completed(node, &rule.name_any());

        if !has_taint && !met && !completed {
            self.taints_to_add += 1;
        }
        if has_taint && (met || completed) {
            self.taints_to_remove += 1;
        }
        // Checked against every requirement, not the evaluation reason: the
        // evaluator stops at the first failure, which can hide a missing
        // condition type behind an earlier status mismatch.
        if rule
            .spec
            .conditions
            .iter()
            .any(|c| !evaluator::condition_exists(node, &c.type_))
        {
            self.risky_operations += 1;
        }
    }

    fn into_results(self) -> DryRunResults {
        let summary = if self.affected_nodes == 0 {
            "No nodes match the rule's selector.".to_string()
        } else {
            let mut parts = vec![format!("{} node(s) match the selector", self.affected_nodes)];
            parts.push(format!("{} taint(s) would be added", self.taints_to_add));
            parts.push(format!("{} taint(s) would be removed", self.taints_to_remove));
            if self.risky_operations > 0 {
                parts.push(format!(
                    "{} node(s) are missing required conditions entirely",
                    self.risky_operations
                ));
            }
            format!("{}.", parts.join("; "))
        };

        DryRunResults {
            affected_nodes: self.affected_nodes,
            taints_to_add: self.taints_to_add,
            taints_to_remove: self.taints_to_remove,
            risky_operations: self.risky_operations,
            summary,
        }
    }
}
