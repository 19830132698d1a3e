//! Readiness condition reporter sidecar
//!
//! Polls an HTTP health endpoint and mirrors the result into a node condition
//! so readiness rules can act on it. Runs next to the component it watches;
//! the node name, condition type and endpoint come from the environment:
//!
//! - `NODE_NAME`: node whose condition is patched (required)
//! - `CONDITION_TYPE`: condition type to maintain (required)
//! - `CHECK_ENDPOINT`: URL polled for health (required)
//! - `CHECK_INTERVAL`: poll interval in seconds, default 30

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use node_readiness_operator::Error;
use serde_json::json;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one health probe, mapped onto the condition fields.
#[derive(Clone, Debug)]
struct HealthOutcome {
    healthy: bool,
    reason: String,
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let node_name = require_env("NODE_NAME")?;
    let condition_type = require_env("CONDITION_TYPE")?;
    let endpoint = require_env("CHECK_ENDPOINT")?;
    let interval = std::env::var("CHECK_INTERVAL")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CHECK_INTERVAL);

    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {e}")))?;

    info!(
        node = %node_name,
        condition = %condition_type,
        endpoint = %endpoint,
        interval_secs = interval.as_secs(),
        "Starting readiness condition reporter"
    );

    loop {
        let outcome = check_health(&http, &endpoint).await;

        if let Err(e) =
            update_node_condition(&client, &node_name, &condition_type, &outcome).await
        {
            error!(
                node = %node_name,
                condition = %condition_type,
                error = ?e,
                "Failed to update node condition"
            );
        }

        tokio::time::sleep(interval).await;
    }
}

fn require_env(name: &'static str) -> Result<String, Error> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::ConfigError(format!("environment variable {name} is not set")))
}

/// Probe the endpoint. Any 2xx answer counts as healthy; everything else,
/// including connection failures, reports unhealthy with the reason encoded.
async fn check_health(http: &reqwest::Client, endpoint: &str) -> HealthOutcome {
    let response = match http.get(endpoint).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Health check failed");
            return HealthOutcome {
                healthy: false,
                reason: "EndpointConnectionError".into(),
                message: format!("Failed to reach endpoint {endpoint}: {e}"),
            };
        }
    };

    if response.status().is_success() {
        return HealthOutcome {
            healthy: true,
            reason: "EndpointOK".into(),
            message: format!("Endpoint reports ready at {endpoint}"),
        };
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    HealthOutcome {
        healthy: false,
        reason: "EndpointNotReady".into(),
        message: format!("Endpoint returned status {status} at {endpoint}: {body}"),
    }
}

/// Patch the condition onto the node status, preserving the transition time
/// when the status did not flip. Conflicts are retried on the next tick.
async fn update_node_condition(
    client: &Client,
    node_name: &str,
    condition_type: &str,
    outcome: &HealthOutcome,
) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes.get(node_name).await.map_err(Error::KubeError)?;

    let condition = build_condition(&node, condition_type, outcome);
    let mut conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    match conditions.iter_mut().find(|c| c.type_ == condition_type) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }

    let patch = json!({ "status": { "conditions": conditions } });
    nodes
        .patch_status(
            node_name,
            &PatchParams::apply("readiness-condition-reporter"),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

fn build_condition(node: &Node, condition_type: &str, outcome: &HealthOutcome) -> NodeCondition {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    let status = if outcome.healthy { "True" } else { "False" };

    // keep the transition time stable while the status holds
    let transition_time = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == condition_type))
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Time(Utc::now()));

    NodeCondition {
        type_: condition_type.to_string(),
        status: status.to_string(),
        last_heartbeat_time: Some(Time(Utc::now())),
        last_transition_time: Some(transition_time),
        reason: Some(outcome.reason.clone()),
        message: Some(outcome.message.clone()),
    }
}
