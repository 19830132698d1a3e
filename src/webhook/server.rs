//! Admission webhook server
//!
//! Serves the ValidatingAdmissionWebhook endpoint for NodeReadinessRules.
//! TLS termination is left to the fronting Service / ingress.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::Client;
use tracing::{error, info, instrument, warn};

use crate::crd::NodeReadinessRule;
use crate::error::{Error, Result};

use super::validation::{check_taint_uniqueness, spec_warnings, validate_spec};

/// Webhook server state
struct WebhookState {
    client: Client,
}

/// Bind and serve the webhook endpoints until the process exits.
pub async fn run_server(client: Client, addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::ConfigError(format!("invalid webhook address {addr}: {e}")))?;

    let state = Arc::new(WebhookState { client });
    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/validate", post(validate_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("failed to bind webhook address {addr}: {e}")))?;
    info!(%addr, "Serving admission webhook");

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("webhook server failed: {e}")))?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

#[instrument(skip(state, review))]
async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<NodeReadinessRule>>,
) -> impl IntoResponse {
    let req: AdmissionRequest<NodeReadinessRule> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid admission request: {e}"))
                        .into_review(),
                ),
            );
        }
    };

    let response = match req.object.as_ref() {
        // DELETE carries no object; nothing to validate.
        None => AdmissionResponse::from(&req),
        Some(rule) => review_rule(&state, &req, rule).await,
    };

    (StatusCode::OK, Json(into_dynamic_review(response)))
}

async fn review_rule(
    state: &WebhookState,
    req: &AdmissionRequest<NodeReadinessRule>,
    rule: &NodeReadinessRule,
) -> AdmissionResponse {
    let issues = validate_spec(&rule.spec);
    if !issues.is_empty() {
        let message = issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        info!(rule = %req.name, %message, "Denied rule");
        return AdmissionResponse::from(req).deny(message);
    }

    match check_taint_uniqueness(state.client.clone(), rule).await {
        Ok(Some(conflict)) => {
            info!(rule = %req.name, conflict = %conflict, "Denied rule");
            return AdmissionResponse::from(req).deny(conflict.to_string());
        }
        Ok(None) => {}
        Err(e) => {
            // Fail open on listing errors: the reconcilers tolerate
            // collisions, they just thrash until the duplicate is removed.
            warn!(rule = %req.name, error = ?e, "Uniqueness check failed, allowing");
        }
    }

    let mut response = AdmissionResponse::from(req);
    let warnings = spec_warnings(&rule.spec);
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    response
}

/// The review returned to the apiserver is object-type agnostic.
fn into_dynamic_review(response: AdmissionResponse) -> AdmissionReview<DynamicObject> {
    response.into_review()
}
