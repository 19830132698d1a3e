//! NodeReadinessRuleReport reconciler
//!
//! Produces one audit report per node summarizing every rule's outcome
//! against it. Rules are read from the API rather than the cache: the report
//! documents persisted state, not what the controller happens to have seen.
//! Reports are owner-referenced to their node so they disappear with it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, instrument};

use crate::crd::{
    report_name, NodeReadinessRule, NodeReadinessRuleReport, NodeReadinessRuleReportSpec,
    NodeReadinessRuleReportStatus, ReadinessReport, ReportSummary, RuleStatus, TaintStatus,
};
use crate::error::{Error, Result};

use super::evaluator;
use super::readiness::{ReadinessController, FIELD_MANAGER};

/// Start the report controller and drive it until shutdown.
///
/// Node events come from the controller's own watch; any rule change fans out
/// to every known node through the reflector store, since each rule touches
/// every node's report.
pub async fn run_report_controller(ctx: Arc<ReadinessController>) {
    let nodes = ctx.nodes();
    let rules = ctx.rules();

    let controller = Controller::new(nodes, WatcherConfig::default());
    let node_store = controller.store();

    controller
        .owns(ctx.reports(), WatcherConfig::default())
        .watches(rules, WatcherConfig::default(), move |_rule: NodeReadinessRule| {
            node_store
                .state()
                .into_iter()
                .map(|node| ObjectRef::from_obj(node.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile_report, report_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(node = %obj.0.name, "Report reconciled"),
                Err(e) => error!(error = ?e, "Report reconcile error"),
            }
        })
        .await;
}

#[instrument(skip(ctx, node), fields(node = %node.name_any()))]
pub async fn reconcile_report(node: Arc<Node>, ctx: Arc<ReadinessController>) -> Result<Action> {
    let node_name = node.name_any();

    let node = match ctx
        .nodes()
        .get_opt(&node_name)
        .await
        .map_err(Error::KubeError)?
    {
        Some(node) => node,
        // Owner GC removes the report with the node.
        None => return Ok(Action::await_change()),
    };

    let rules = ctx
        .rules()
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    let status = build_report_status(&rules.items, &node);
    let report_api = ctx.reports();
    let name = report_name(&node_name);

    let existing = report_api
        .get_opt(&name)
        .await
        .map_err(Error::KubeError)?;
    let just_created = existing.is_none();
    if just_created {
        let report = NodeReadinessRuleReport {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                owner_references: Some(vec![node_owner_reference(&node)?]),
                ..Default::default()
            },
            spec: NodeReadinessRuleReportSpec {
                node_name: node_name.clone(),
            },
            status: None,
        };
        report_api
            .create(&PostParams::default(), &report)
            .await
            .map_err(Error::KubeError)?;
        debug!(report = %name, "Created report");
    }

    let current_status = existing.and_then(|r| r.status);
    if !just_created {
        if let Some(current) = &current_status {
            if statuses_equivalent(current, &status) {
                return Ok(Action::await_change());
            }
        }
    }

    let patch = json!({ "status": status });
    report_api
        .patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    debug!(report = %name, "Updated report status");

    Ok(Action::await_change())
}

/// Evaluate every rule against the node and roll the outcomes up.
fn build_report_status(
    rules: &[NodeReadinessRule],
    node: &Node,
) -> NodeReadinessRuleReportStatus {
    let now = Utc::now().to_rfc3339();

    let mut reports: Vec<ReadinessReport> = rules
        .iter()
        .map(|rule| {
            let evaluation = evaluator::evaluate(rule, node);
            ReadinessReport {
                rule_name: evaluation.rule_name.clone(),
                reason: evaluation.reason.to_string(),
                message: evaluation.message.clone(),
                rule_status: evaluation.rule_status,
                taint_status: evaluation.taint_status(),
                last_evaluation_time: now.clone(),
            }
        })
        .collect();
    reports.sort_by(|a, b| a.rule_name.cmp(&b.rule_name));

    let mut summary = ReportSummary::default();
    for report in &reports {
        match report.rule_status {
            RuleStatus::Matched => summary.matched_rules += 1,
            RuleStatus::Unmatched => summary.un_matched_rules += 1,
            RuleStatus::Error => summary.errors += 1,
        }
        if report.taint_status == TaintStatus::Present {
            summary.applied_taints += 1;
        }
    }

    NodeReadinessRuleReportStatus {
        readiness_reports: reports,
        summary,
    }
}

/// Equality up to the per-entry evaluation timestamps, so an unchanged node
/// does not get a fresh status write on every pass.
fn statuses_equivalent(
    a: &NodeReadinessRuleReportStatus,
    b: &NodeReadinessRuleReportStatus,
) -> bool {
    if a.summary != b.summary || a.readiness_reports.len() != b.readiness_reports.len() {
        return false;
    }
    a.readiness_reports
        .iter()
        .zip(b.readiness_reports.iter())
        .all(|(x, y)| {
            x.rule_name == y.rule_name
                && x.reason == y.reason
                && x.message == y.message
                && x.rule_status == y.rule_status
                && x.taint_status == y.taint_status
        })
}

fn node_owner_reference(node: &Node) -> Result<OwnerReference> {
    let uid = node
        .metadata
        .uid
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let name = node
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))?;

    Ok(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

pub fn report_error_policy(
    node: Arc<Node>,
    error: &Error,
    _ctx: Arc<ReadinessController>,
) -> Action {
    error!(node = %node.name_any(), error = ?error, "Report reconciliation error");
    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}
