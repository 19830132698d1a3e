//! Node reconciler
//!
//! On every node event the cached rules are replayed against the node: taints
//! are added or removed per rule, bootstrap completions are recorded, and the
//! affected rules' `nodeEvaluations` entries are upserted. Rules carrying a
//! deletion timestamp are skipped so a dying rule never re-taints a node.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, instrument};

use crate::crd::NodeEvaluation;
use crate::error::{Error, Result};

use super::readiness::{ReadinessController, FIELD_MANAGER};

/// Start the node controller and drive it until shutdown.
pub async fn run_node_controller(ctx: Arc<ReadinessController>) {
    let nodes = ctx.nodes();

    Controller::new(nodes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_node, node_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(node = %obj.0.name, "Node reconciled"),
                Err(e) => error!(error = ?e, "Node reconcile error"),
            }
        })
        .await;
}

#[instrument(skip(ctx, node), fields(node = %node.name_any()))]
pub async fn reconcile_node(node: Arc<Node>, ctx: Arc<ReadinessController>) -> Result<Action> {
    let name = node.name_any();

    // Work from committed state; the store copy may predate our own writes.
    // A vanished node needs nothing from us: its report is garbage-collected
    // through the owner reference and the bootstrap markers die with it.
    let mut node = match ctx.nodes().get_opt(&name).await.map_err(Error::KubeError)? {
        Some(node) => node,
        None => return Ok(Action::await_change()),
    };

    let mut affected: Vec<(String, NodeEvaluation)> = Vec::new();

    for rule in ctx.cache().list() {
        let Some(enforcement) = ctx.enforce_rule_on_node(&rule, &mut node).await? else {
            continue;
        };

        if enforcement.conditions_evaluated() {
            affected.push((rule.name_any(), enforcement.to_node_evaluation(&name)));
        }
    }

    for (rule_name, evaluation) in affected {
        upsert_node_evaluation(&ctx, &rule_name, evaluation).await?;
    }

    Ok(Action::await_change())
}

/// Merge one node's evaluation into a rule's status, keyed by node name.
///
/// The write is skipped when nothing but the timestamp would change, so an
/// unchanged node reconciled twice produces no API writes the second time.
async fn upsert_node_evaluation(
    ctx: &Arc<ReadinessController>,
    rule_name: &str,
    evaluation: NodeEvaluation,
) -> Result<()> {
    let rule = match ctx
        .rules()
        .get_opt(rule_name)
        .await
        .map_err(Error::KubeError)?
    {
        Some(rule) => rule,
        // Rule vanished mid-reconcile; its status died with it.
        None => return Ok(()),
    };
    if rule.meta().deletion_timestamp.is_some() {
        return Ok(());
    }

    let mut evaluations = rule
        .status
        .as_ref()
        .map(|s| s.node_evaluations.clone())
        .unwrap_or_default();

    match evaluations
        .iter_mut()
        .find(|e| e.node_name == evaluation.node_name)
    {
        Some(existing) => {
            if evaluations_equivalent(existing, &evaluation) {
                return Ok(());
            }
            *existing = evaluation;
        }
        None => evaluations.push(evaluation),
    }
    evaluations.sort_by(|a, b| a.node_name.cmp(&b.node_name));

    let patch = json!({ "status": { "nodeEvaluations": evaluations } });
    ctx.rules()
        .patch_status(
            rule_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Equality up to the evaluation timestamp.
fn evaluations_equivalent(a: &NodeEvaluation, b: &NodeEvaluation) -> bool {
    a.node_name == b.node_name
        && a.condition_results == b.condition_results
        && a.taint_status == b.taint_status
}

pub fn node_error_policy(node: Arc<Node>, error: &Error, _ctx: Arc<ReadinessController>) -> Action {
    error!(node = %node.name_any(), error = ?error, "Node reconciliation error");
    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}
