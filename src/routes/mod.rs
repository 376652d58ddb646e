// Local hook/admin API used by the host runtime

mod http;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::backup::BackupOrchestrator;
use crate::collector::CollectorClient;
use crate::connectivity::ConnectivityMonitor;
use crate::error_capture::HandlerChain;
use crate::health::HealthMonitor;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthMonitor>,
    pub backup: Arc<BackupOrchestrator>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub collector: Arc<CollectorClient>,
    pub error_chain: Arc<HandlerChain>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/status", get(http::status_handler)) // GET /status
        .route("/hooks/request", post(http::request_hook)) // POST /hooks/request
        .route("/hooks/error", post(http::error_hook)) // POST /hooks/error
        .route("/actions/test-health", post(http::test_health_handler))
        .route("/actions/poll-backup", post(http::poll_backup_handler))
        .route("/actions/verify-token", post(http::verify_token_handler))
        .route("/actions/cleanup-temp", post(http::cleanup_temp_handler))
        .route(
            "/actions/clear-failure-log",
            post(http::clear_failure_log_handler),
        )
        .route(
            "/backup/log",
            get(http::backup_log_handler).delete(http::clear_backup_log_handler),
        )
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
