// Handlers: request/error hooks, on-demand actions, status and backup log

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::warn;

use super::AppState;
use crate::error::CollectorError;
use crate::error_capture::ErrorEvent;
use crate::models::ActionResult;
use crate::version::{NAME, VERSION};
use crate::window::resolve_client_ip;

const DEFAULT_LOG_LINES: usize = 50;

/// GET /version: service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "name": NAME,
        "version": VERSION,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct RequestHook {
    uri: String,
    remote_addr: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Admin/ajax traffic the host does not want counted.
    #[serde(default)]
    skip: bool,
}

/// POST /hooks/request: one inbound request seen by the host.
pub(super) async fn request_hook(
    State(state): State<AppState>,
    Json(hook): Json<RequestHook>,
) -> impl IntoResponse {
    if hook.skip {
        return StatusCode::NO_CONTENT.into_response();
    }
    let ip = resolve_client_ip(&hook.headers, hook.remote_addr.as_deref());
    match state.health.track_request(&ip, &hook.uri).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(error = %e, "failed to record request sample");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// POST /hooks/error: runs the event through the handler chain.
pub(super) async fn error_hook(
    State(state): State<AppState>,
    Json(event): Json<ErrorEvent>,
) -> impl IntoResponse {
    state.error_chain.dispatch(&event);
    StatusCode::ACCEPTED
}

/// POST /actions/test-health: blocking health report.
pub(super) async fn test_health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (result, snapshot) = state.health.test_health_report().await;
    Json(json!({
        "success": result.success,
        "message": result.message,
        "snapshot": snapshot,
    }))
}

/// POST /actions/poll-backup: manual backup poll.
pub(super) async fn poll_backup_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.backup.poll_pending_backup().await.to_action_result())
}

/// POST /actions/verify-token
pub(super) async fn verify_token_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (result, data) = match state.collector.verify_token().await {
        Ok(data) => (ActionResult::ok("API token verified."), data),
        Err(CollectorError::Status { body, .. }) => (ActionResult::failed(body), Value::Null),
        Err(e) => (ActionResult::failed(e.to_string()), Value::Null),
    };
    Json(json!({
        "success": result.success,
        "message": result.message,
        "data": data,
    }))
}

/// POST /actions/cleanup-temp: remove stale backup temp files.
pub(super) async fn cleanup_temp_handler(State(state): State<AppState>) -> impl IntoResponse {
    let result = match state.backup.cleanup_temp_files().await {
        Ok(n) => ActionResult::ok(format!("Removed {} temporary files.", n)),
        Err(e) => ActionResult::failed(format!("Cleanup failed: {}", e)),
    };
    Json(result)
}

/// POST /actions/clear-failure-log
pub(super) async fn clear_failure_log_handler(State(state): State<AppState>) -> impl IntoResponse {
    let result = match state.connectivity.clear_failure_log().await {
        Ok(()) => ActionResult::ok("Connection failure log cleared."),
        Err(e) => ActionResult::failed(e.to_string()),
    };
    Json(result)
}

/// GET /status: live snapshot, backup status and connectivity diagnostics.
pub(super) async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (snapshot, snapshot_error) = match state.health.sample().await {
        Ok(s) => (Some(s), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let failures = state.connectivity.failures().await.unwrap_or_default();
    let consecutive = state.connectivity.consecutive_failures().await.unwrap_or(0);
    Json(json!({
        "health": {
            "enabled": state.health.is_enabled(),
            "snapshot": snapshot,
            "error": snapshot_error,
        },
        "backup": state.backup.status().await,
        "backup_requirements": state.backup.check_requirements().await,
        "connectivity": {
            "consecutive_failures": consecutive,
            "recent_failures": failures,
        },
        "collector_configured": state.collector.is_configured(),
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct LogQuery {
    lines: Option<usize>,
}

/// GET /backup/log?lines=N
pub(super) async fn backup_log_handler(
    State(state): State<AppState>,
    Query(q): Query<LogQuery>,
) -> impl IntoResponse {
    Json(json!({
        "entries": state.backup.log().recent_entries(q.lines.unwrap_or(DEFAULT_LOG_LINES)),
    }))
}

/// DELETE /backup/log
pub(super) async fn clear_backup_log_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.backup.log().clear() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
