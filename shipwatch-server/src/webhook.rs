//! Webhook HTTP surface.
//!
//! One route per registered repository: `POST /webhooks/github/{webhook_id}`.
//! Status codes separate the sender's concerns: 401 for anything that
//! smells of authentication (uniformly, including secret problems on our
//! side), 404 for an unregistered webhook id, 400 for malformed input,
//! 202 once a well-formed authenticated delivery has been accepted, and
//! 500 only when processing genuinely failed and a redelivery could help.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notify;
use crate::payload::{self, EnvironmentClass, OutcomeClass, ParsedEvent};
use crate::reconciler::Reconciler;
use crate::resolver::CommitResolver;
use crate::signature;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/github/{webhook_id}", post(handle_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn reply(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

/// Acknowledge a valid delivery this service chooses not to process.
fn acknowledge(message: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "message": message })),
    )
        .into_response()
}

async fn handle_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    if Uuid::parse_str(&webhook_id).is_err() {
        return reply(StatusCode::BAD_REQUEST, "Malformed webhook id");
    }

    let repository = match state.db.repository_by_webhook_id(&webhook_id) {
        Ok(Some(repository)) => repository,
        Ok(None) => {
            info!("Delivery {} for unknown webhook id {}", delivery_id, webhook_id);
            return reply(StatusCode::NOT_FOUND, "Unknown webhook");
        }
        Err(e) => {
            // Lookup is part of verification; do not leak the distinction.
            error!("Repository lookup failed for delivery {}: {:#}", delivery_id, e);
            return reply(StatusCode::UNAUTHORIZED, "Signature verification failed");
        }
    };

    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !signature::verify_for_repository(&state.cipher, &repository, &body, signature_header) {
        warn!(
            "Rejected delivery {} for {}: signature verification failed",
            delivery_id, repository.full_name
        );
        return reply(StatusCode::UNAUTHORIZED, "Signature verification failed");
    }

    let Some(event_type) = headers.get("x-github-event").and_then(|v| v.to_str().ok()) else {
        return reply(StatusCode::BAD_REQUEST, "Missing x-github-event header");
    };

    let event = match payload::parse(&body, event_type) {
        Ok(ParsedEvent::DeploymentStatus(event)) => event,
        Ok(ParsedEvent::Ignored { event }) => {
            info!("Delivery {}: ignoring {} event", delivery_id, event);
            return acknowledge("Event type not processed");
        }
        Err(e) => {
            warn!("Delivery {}: rejected payload: {}", delivery_id, e);
            return reply(StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    let environment = match &event.environment {
        EnvironmentClass::Tracked(environment) => *environment,
        EnvironmentClass::Untracked(name) => {
            info!(
                "Delivery {}: untracked environment '{}' for {}",
                delivery_id, name, repository.full_name
            );
            return acknowledge("Environment not tracked");
        }
    };
    let outcome = match &event.outcome {
        OutcomeClass::Tracked(outcome) => *outcome,
        OutcomeClass::Unrecognized(raw) => {
            info!(
                "Delivery {}: unrecognized deployment state '{}' for {}",
                delivery_id, raw, repository.full_name
            );
            return acknowledge("Deployment state not tracked");
        }
    };

    info!(
        "Delivery {}: {} deployment {} ({}) for {}",
        delivery_id,
        environment.as_str(),
        event.deployment_id,
        outcome.audit_str(),
        repository.full_name
    );

    let reconciler = Reconciler::new(
        state.db.clone(),
        CommitResolver::new(state.comparer.clone()),
    );
    let transitions = match reconciler
        .process(
            &repository,
            environment,
            outcome,
            &event.sha,
            event.deployment_url.as_deref(),
        )
        .await
    {
        Ok(transitions) => transitions,
        Err(e) => {
            error!("Delivery {}: reconciliation failed: {:#}", delivery_id, e);
            return reply(StatusCode::INTERNAL_SERVER_ERROR, "Processing failed");
        }
    };

    for transition in &transitions {
        if let Err(e) = notify::fan_out(state.publisher.as_ref(), transition).await {
            // Task state is already committed; the 500 surfaces the lost
            // notification to the sender's delivery log.
            error!("Delivery {}: notification fanout failed: {:#}", delivery_id, e);
            return reply(StatusCode::INTERNAL_SERVER_ERROR, "Notification failed");
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "tasksUpdated": transitions.len(),
        })),
    )
        .into_response()
}
