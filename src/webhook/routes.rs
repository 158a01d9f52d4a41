//! HTTP surface: webhook, health, metrics and the operator API.

use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::envelope::{Envelope, sanitize_phone_number};
use super::signature::{SIGNATURE_HEADER, constant_time_eq, verify_signature};
use crate::dispatcher;
use crate::error::{Error, WebhookError, WorkflowError};
use crate::metrics::webhook as webhook_metrics;
use crate::state::AppState;

/// Webhook bodies are small JSON envelopes.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Conversation lines returned with a session lookup.
const HISTORY_LIMIT: usize = 20;

/// Build the router over shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/whatsapp", get(verify_handler).post(receive))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/api/compliance/query", post(query_compliance))
        .route(
            "/api/sessions/{session_id}",
            get(get_session).delete(deactivate_session),
        )
        .route("/api/sessions/phone/{phone}", get(get_session_by_phone))
        .route("/api/roadmaps/{session_id}", get(get_roadmap))
        .route("/api/admin/cleanup", post(cleanup))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// ── Verification handshake ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Check a subscription handshake. Returns the challenge to echo back.
pub fn verify(
    mode: &str,
    token: &str,
    challenge: &str,
    verify_token: &SecretString,
) -> Result<String, WebhookError> {
    if mode != "subscribe" {
        return Err(WebhookError::Authentication(format!(
            "unexpected hub.mode {mode}"
        )));
    }
    if token != verify_token.expose_secret() {
        return Err(WebhookError::Authentication("verify token mismatch".into()));
    }
    Ok(challenge.to_string())
}

async fn verify_handler(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
) -> Response {
    metrics::counter!(webhook_metrics::REQUESTS_TOTAL, "method" => "GET").increment(1);
    let result = verify(
        params.mode.as_deref().unwrap_or_default(),
        params.token.as_deref().unwrap_or_default(),
        params.challenge.as_deref().unwrap_or_default(),
        &state.config.whatsapp.verify_token,
    );
    match result {
        Ok(challenge) => {
            info!("Webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

// ── Message delivery ────────────────────────────────────────────────

async fn receive(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    metrics::counter!(webhook_metrics::REQUESTS_TOTAL, "method" => "POST").increment(1);

    if let Some(secret) = &state.config.whatsapp.app_secret {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(&body, header, secret.expose_secret()) {
            warn!("Webhook signature rejected");
            return error_response(StatusCode::FORBIDDEN, "invalid signature");
        }
    }

    let envelope = match Envelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Malformed webhook body");
            return error_response(StatusCode::BAD_REQUEST, "malformed envelope");
        }
    };

    for message in envelope.messages() {
        if !state.dedup.first_sighting(&message.message_id) {
            metrics::counter!(webhook_metrics::DUPLICATES_TOTAL).increment(1);
            debug!(message_id = %message.message_id, "Duplicate delivery dropped");
            continue;
        }
        let message_id = message.message_id.clone();
        if state.queue.send(message).await.is_err() {
            error!(message_id = %message_id, error = %WebhookError::QueueClosed, "Message not enqueued");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }
        metrics::counter!(webhook_metrics::MESSAGES_ENQUEUED_TOTAL).increment(1);
        debug!(message_id = %message_id, "Message enqueued");
    }

    Json(json!({ "status": "ok" })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "error": message }))).into_response()
}

// ── Health & metrics ────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "compliance-advisor",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.sessions.len().await,
    }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

// ── Operator API ────────────────────────────────────────────────────

/// `None` disables the operator routes entirely.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(token) = &state.config.admin_token else {
        return Err(StatusCode::NOT_FOUND);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(presented) if constant_time_eq(presented, token.expose_secret()) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    phone_number: String,
}

/// Run the pipeline over HTTP and return the roadmap as JSON.
async fn query_compliance(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status.into_response();
    }
    let request: QueryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed compliance query");
            return error_response(StatusCode::BAD_REQUEST, "expected query and phone_number");
        }
    };

    match dispatcher::run_query(&state, &request.phone_number, &request.query).await {
        Ok(roadmap) => Json(roadmap).into_response(),
        Err(e) => {
            let status = match &e {
                Error::Input(_) => StatusCode::BAD_REQUEST,
                Error::Workflow(WorkflowError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
                Error::Workflow(WorkflowError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
                Error::Workflow(WorkflowError::FatalStage { .. }) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(error = %e, status = status.as_u16(), "Compliance query failed");
            error_response(status, &e.to_string())
        }
    }
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status.into_response();
    }
    let session = match state.sessions.find(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Session lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed");
        }
    };

    let history = match &state.db {
        Some(db) => match db.conversation_history(&session_id, HISTORY_LIMIT).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Conversation history unavailable");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    let history: Vec<_> = history
        .iter()
        .map(|entry| {
            json!({
                "direction": entry.direction.as_str(),
                "content": entry.content,
                "created_at": entry.created_at,
            })
        })
        .collect();

    Json(json!({
        "running": state.orchestrator.is_running(&session.session_id),
        "session": session,
        "conversation_history": history,
    }))
    .into_response()
}

/// Live session for a phone number, with the sender's remaining rate budget.
async fn get_session_by_phone(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(phone): Path<String>,
) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status.into_response();
    }
    let sender = sanitize_phone_number(&phone);
    match state.sessions.get(&sender).await {
        Some(session) => Json(json!({
            "running": state.orchestrator.is_running(&session.session_id),
            "rate_limit_remaining": state.rate_limiter.remaining(&sender),
            "session": session,
        }))
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no live session"),
    }
}

async fn deactivate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status.into_response();
    }
    match state.sessions.deactivate(&session_id).await {
        Ok(true) => Json(json!({ "status": "deactivated" })).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Session deactivation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "deactivation failed")
        }
    }
}

async fn get_roadmap(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status.into_response();
    }
    match state.sessions.roadmap(&session_id).await {
        Ok(Some(roadmap)) => Json(roadmap).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "roadmap not found"),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Roadmap lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed")
        }
    }
}

/// Sweep idle sessions and prune the dedup and rate-limit caches now.
async fn cleanup(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status.into_response();
    }
    let expired = state.sessions.sweep().await;
    let (message_ids, buckets) = state.prune_caches(Instant::now());
    info!(expired, message_ids, buckets, "Manual cleanup");
    Json(json!({
        "status": "success",
        "expired_sessions": expired,
        "pruned_message_ids": message_ids,
        "pruned_rate_limit_buckets": buckets,
    }))
    .into_response()
}
