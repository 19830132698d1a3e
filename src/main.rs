//! Operator entry point
//!
//! Starts the rule, node and report controllers plus the optional metrics
//! and admission-webhook servers.

use std::sync::Arc;

use node_readiness_operator::controller::{
    run_node_controller, run_report_controller, run_rule_controller, ReadinessController,
};
use node_readiness_operator::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

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

    info!(
        "Starting node readiness operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let ctx = Arc::new(ReadinessController::new(client.clone()));

    #[cfg(feature = "metrics")]
    {
        let addr = std::env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(&addr).await {
                tracing::error!(error = ?e, "Metrics server error");
            }
        });
    }

    #[cfg(feature = "admission-webhook")]
    {
        let addr = std::env::var("WEBHOOK_ADDR").unwrap_or_else(|_| "0.0.0.0:9443".to_string());
        let webhook_client = client.clone();
        tokio::spawn(async move {
            if let Err(e) =
                node_readiness_operator::webhook::run_server(webhook_client, &addr).await
            {
                tracing::error!(error = ?e, "Webhook server error");
            }
        });
    }

    // All three controllers run until shutdown; if any one of them exits the
    // process winds down rather than limping along partially blind.
    tokio::select! {
        _ = run_rule_controller(ctx.clone()) => info!("Rule controller completed"),
        _ = run_node_controller(ctx.clone()) => info!("Node controller completed"),
        _ = run_report_controller(ctx) => info!("Report controller completed"),
    }

    Ok(())
}

#[cfg(feature = "metrics")]
async fn serve_metrics(addr: &str) -> Result<(), Error> {
    use axum::{routing::get, Router};

    async fn metrics_handler() -> String {
        node_readiness_operator::controller::metrics::render()
    }

    async fn health_handler() -> &'static str {
        "ok"
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("failed to bind metrics address {addr}: {e}")))?;
    info!(%addr, "Serving metrics");

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("metrics server failed: {e}")))?;
    Ok(())
}
