//! End-to-end reconciliation scenarios against a real cluster.
//!
//! These tests drive the reconcilers directly through a live apiserver (a
//! kind cluster works) with both CRDs installed:
//!
//! ```sh
//! kind create cluster
//! cargo run --bin crdgen | kubectl apply -f -
//! cargo test --test e2e_kind -- --ignored --test-threads=1
//! ```
//!
//! Ignored by default because they need cluster access.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use node_readiness_operator::controller::{
    evaluator, reconcile_node, reconcile_report, reconcile_rule, ReadinessController,
    CLEANUP_FINALIZER,
};
use node_readiness_operator::crd::{
    report_name, ConditionRequirement, ConditionStatus, EnforcementMode, NodeReadinessRule,
    NodeReadinessRuleReport, NodeReadinessRuleSpec, NodeSelector, TaintEffect, TaintSpec,
    TaintStatus,
};

const FIELD_MANAGER: &str = "e2e-kind-test";

async fn test_context() -> (Arc<ReadinessController>, Client) {
    let client = Client::try_default()
        .await
        .expect("requires a reachable Kubernetes cluster");
    (Arc::new(ReadinessController::new(client.clone())), client)
}

fn make_rule(name: &str, taint_key: &str, env: &str, mode: EnforcementMode) -> NodeReadinessRule {
    NodeReadinessRule {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: NodeReadinessRuleSpec {
            conditions: vec![ConditionRequirement {
                type_: "Ready".into(),
                required_status: ConditionStatus::True,
            }],
            enforcement_mode: mode,
            taint: TaintSpec {
                key: taint_key.to_string(),
                value: None,
                effect: TaintEffect::NoSchedule,
            },
            node_selector: NodeSelector {
                match_labels: Some(
                    [("env".to_string(), env.to_string())].into_iter().collect(),
                ),
                match_expressions: None,
            },
            dry_run: false,
        },
        status: None,
    }
}

fn make_node(name: &str, env: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some([("env".to_string(), env.to_string())].into_iter().collect()),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: None,
    }
}

async fn set_ready(client: &Client, node_name: &str, status: &str) {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = json!({
        "status": {
            "conditions": [NodeCondition {
                type_: "Ready".into(),
                status: status.into(),
                ..Default::default()
            }]
        }
    });
    nodes
        .patch_status(
            node_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .expect("failed to patch node condition");
}

async fn fetch_node(client: &Client, name: &str) -> Node {
    Api::<Node>::all(client.clone())
        .get(name)
        .await
        .expect("node should exist")
}

async fn has_taint(client: &Client, node_name: &str, taint: &TaintSpec) -> bool {
    evaluator::node_has_taint(&fetch_node(client, node_name).await, taint)
}

async fn run_rule(ctx: &Arc<ReadinessController>, name: &str) {
    let stub = Arc::new(NodeReadinessRule {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: make_rule(name, "unused", "unused", EnforcementMode::Continuous).spec,
        status: None,
    });
    reconcile_rule(stub, ctx.clone())
        .await
        .expect("rule reconcile failed");
}

async fn run_node(ctx: &Arc<ReadinessController>, name: &str) {
    let stub = Arc::new(Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    });
    reconcile_node(stub, ctx.clone())
        .await
        .expect("node reconcile failed");
}

async fn cleanup(client: &Client, rule_name: &str, node_name: &str) {
    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    if let Ok(Some(rule)) = rules.get_opt(rule_name).await {
        if !rule.finalizers().is_empty() {
            let patch = json!({ "metadata": { "finalizers": [] } });
            let _ = rules
                .patch(
                    rule_name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await;
        }
        let _ = rules.delete(rule_name, &DeleteParams::default()).await;
    }

    let nodes: Api<Node> = Api::all(client.clone());
    let _ = nodes.delete(node_name, &DeleteParams::default()).await;

    let reports: Api<NodeReadinessRuleReport> = Api::all(client.clone());
    let _ = reports
        .delete(&report_name(node_name), &DeleteParams::default())
        .await;
}

/// Scenario: continuous rule, condition unmet, taint gets added and the
/// evaluation lands in the rule status.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn continuous_rule_adds_taint_when_condition_unmet() {
    let (ctx, client) = test_context().await;
    let rule = make_rule("e2e-cont-add", "readiness.k8s.io/e2e-cont-add", "e2e-cont-add", EnforcementMode::Continuous);
    let node = make_node("e2e-cont-add-node", "e2e-cont-add");
    let taint = rule.spec.taint.clone();

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-cont-add-node", "False").await;

    run_rule(&ctx, "e2e-cont-add").await;

    assert!(has_taint(&client, "e2e-cont-add-node", &taint).await);

    let stored = rules.get("e2e-cont-add").await.unwrap();
    let status = stored.status.expect("rule status should be written");
    assert_eq!(status.observed_generation, stored.metadata.generation);
    let eval = status
        .node_evaluations
        .iter()
        .find(|e| e.node_name == "e2e-cont-add-node")
        .expect("evaluation for the node");
    assert_eq!(eval.taint_status, TaintStatus::Present);

    cleanup(&client, "e2e-cont-add", "e2e-cont-add-node").await;
}

/// Scenario: the condition comes true, the taint is removed; on regression it
/// comes back (continuous mode).
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn continuous_rule_tracks_condition_flips() {
    let (ctx, client) = test_context().await;
    let rule = make_rule("e2e-cont-flip", "readiness.k8s.io/e2e-cont-flip", "e2e-cont-flip", EnforcementMode::Continuous);
    let node = make_node("e2e-cont-flip-node", "e2e-cont-flip");
    let taint = rule.spec.taint.clone();

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-cont-flip-node", "False").await;

    run_rule(&ctx, "e2e-cont-flip").await;
    assert!(has_taint(&client, "e2e-cont-flip-node", &taint).await);

    // conditions met: taint removed
    set_ready(&client, "e2e-cont-flip-node", "True").await;
    run_node(&ctx, "e2e-cont-flip-node").await;
    assert!(!has_taint(&client, "e2e-cont-flip-node", &taint).await);

    // conditions regress: taint re-added
    set_ready(&client, "e2e-cont-flip-node", "False").await;
    run_node(&ctx, "e2e-cont-flip-node").await;
    assert!(has_taint(&client, "e2e-cont-flip-node", &taint).await);

    cleanup(&client, "e2e-cont-flip", "e2e-cont-flip-node").await;
}

/// Scenario: bootstrap-only rule removes the taint once, records the marker,
/// and stays inert when the condition later regresses.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn bootstrap_rule_completes_once_and_ignores_regression() {
    let (ctx, client) = test_context().await;
    let rule = make_rule("e2e-boot", "readiness.k8s.io/e2e-boot", "e2e-boot", EnforcementMode::BootstrapOnly);
    let taint = rule.spec.taint.clone();
    let mut node = make_node("e2e-boot-node", "e2e-boot");
    node.spec = Some(NodeSpec {
        taints: Some(vec![taint.to_k8s()]),
        ..Default::default()
    });

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-boot-node", "False").await;

    run_rule(&ctx, "e2e-boot").await;
    assert!(has_taint(&client, "e2e-boot-node", &taint).await);

    // first pass: taint removed, completion marker added
    set_ready(&client, "e2e-boot-node", "True").await;
    run_node(&ctx, "e2e-boot-node").await;
    assert!(!has_taint(&client, "e2e-boot-node", &taint).await);
    let marker = ReadinessController::bootstrap_annotation("e2e-boot");
    let stored = fetch_node(&client, "e2e-boot-node").await;
    assert!(stored
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(&marker))
        .unwrap_or(false));

    // regression after completion: the taint stays absent
    set_ready(&client, "e2e-boot-node", "False").await;
    run_node(&ctx, "e2e-boot-node").await;
    assert!(!has_taint(&client, "e2e-boot-node", &taint).await);

    cleanup(&client, "e2e-boot", "e2e-boot-node").await;
}

/// Scenario: the node is outside the selector; no taint is applied and the
/// report explains why.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn selector_mismatch_leaves_node_alone() {
    let (ctx, client) = test_context().await;
    let rule = make_rule("e2e-sel", "readiness.k8s.io/e2e-sel", "prod", EnforcementMode::Continuous);
    let taint = rule.spec.taint.clone();
    let node = make_node("e2e-sel-node", "dev");

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-sel-node", "True").await;

    run_rule(&ctx, "e2e-sel").await;
    assert!(!has_taint(&client, "e2e-sel-node", &taint).await);

    let node_stub = Arc::new(fetch_node(&client, "e2e-sel-node").await);
    reconcile_report(node_stub, ctx.clone()).await.unwrap();

    let reports: Api<NodeReadinessRuleReport> = Api::all(client.clone());
    let report = reports.get(&report_name("e2e-sel-node")).await.unwrap();
    let status = report.status.expect("report status should be written");
    let entry = status
        .readiness_reports
        .iter()
        .find(|r| r.rule_name == "e2e-sel")
        .expect("entry for the rule");
    assert_eq!(entry.reason, "SelectorMismatch");

    cleanup(&client, "e2e-sel", "e2e-sel-node").await;
}

/// Scenario: deleting a tainting rule removes its taints and releases the
/// finalizer so the object disappears.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn rule_deletion_cleans_up_taints_and_finalizer() {
    let (ctx, client) = test_context().await;
    let rule = make_rule("e2e-del", "readiness.k8s.io/e2e-del", "e2e-del", EnforcementMode::Continuous);
    let taint = rule.spec.taint.clone();
    let node = make_node("e2e-del-node", "e2e-del");

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-del-node", "False").await;

    // install finalizer and taint
    run_rule(&ctx, "e2e-del").await;
    let stored = rules.get("e2e-del").await.unwrap();
    assert!(stored.finalizers().iter().any(|f| f == CLEANUP_FINALIZER));
    assert!(has_taint(&client, "e2e-del-node", &taint).await);

    rules
        .delete("e2e-del", &DeleteParams::default())
        .await
        .unwrap();
    run_rule(&ctx, "e2e-del").await;

    assert!(!has_taint(&client, "e2e-del-node", &taint).await);
    assert!(rules.get_opt("e2e-del").await.unwrap().is_none());

    cleanup(&client, "e2e-del", "e2e-del-node").await;
}

/// Scenario: dry-run rule previews the taint it would add without touching
/// the node.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn dry_run_previews_without_mutating() {
    let (ctx, client) = test_context().await;
    let mut rule = make_rule("e2e-dry", "readiness.k8s.io/e2e-dry", "e2e-dry", EnforcementMode::Continuous);
    rule.spec.dry_run = true;
    let taint = rule.spec.taint.clone();
    let node = make_node("e2e-dry-node", "e2e-dry");

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-dry-node", "False").await;

    run_rule(&ctx, "e2e-dry").await;

    // the node is untouched
    assert!(!has_taint(&client, "e2e-dry-node", &taint).await);

    let stored = rules.get("e2e-dry").await.unwrap();
    let results = stored
        .status
        .and_then(|s| s.dry_run_results)
        .expect("dry-run results should be written");
    assert_eq!(results.affected_nodes, 1);
    assert_eq!(results.taints_to_add, 1);
    assert_eq!(results.taints_to_remove, 0);
    assert!(!results.summary.is_empty());

    cleanup(&client, "e2e-dry", "e2e-dry-node").await;
}

/// Scenario: reconciling an unchanged node twice leaves no trace the second
/// time (no taint flips, same evaluations modulo timestamps).
#[tokio::test]
#[ignore = "requires a Kubernetes cluster with the CRDs installed"]
async fn node_reconcile_is_idempotent() {
    let (ctx, client) = test_context().await;
    let rule = make_rule("e2e-idem", "readiness.k8s.io/e2e-idem", "e2e-idem", EnforcementMode::Continuous);
    let node = make_node("e2e-idem-node", "e2e-idem");

    let rules: Api<NodeReadinessRule> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    rules.create(&PostParams::default(), &rule).await.unwrap();
    nodes.create(&PostParams::default(), &node).await.unwrap();
    set_ready(&client, "e2e-idem-node", "False").await;

    run_rule(&ctx, "e2e-idem").await;
    run_node(&ctx, "e2e-idem-node").await;

    let before = fetch_node(&client, "e2e-idem-node").await;
    let rule_before = rules.get("e2e-idem").await.unwrap();

    run_node(&ctx, "e2e-idem-node").await;

    let after = fetch_node(&client, "e2e-idem-node").await;
    let rule_after = rules.get("e2e-idem").await.unwrap();

    assert_eq!(before.resource_version(), after.resource_version());
    assert_eq!(rule_before.resource_version(), rule_after.resource_version());

    cleanup(&client, "e2e-idem", "e2e-idem-node").await;
}
