// Integration tests: local hook and admin endpoints

mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::{Behaviour, FakeCollector, quiet_readings, unconfigured_collector};
use errorvault_agent::backup::{BackupOrchestrator, CommandExporter};
use errorvault_agent::clock::SystemClock;
use errorvault_agent::collector::CollectorClient;
use errorvault_agent::config::{AppConfig, CollectorConfig};
use errorvault_agent::connectivity::{ConnectivityMonitor, LogNotifier};
use errorvault_agent::error_capture::{CaptureHandler, ErrorReporter, HandlerChain};
use errorvault_agent::health::HealthMonitor;
use errorvault_agent::routes::{self, AppState};
use errorvault_agent::store::{KvStore, MemoryStore};
use errorvault_agent::sysinfo_repo::StaticProbe;
use serde_json::{Value, json};
use std::sync::Arc;

const TEST_CONFIG: &str = r#"
[server]
port = 8081
host = "127.0.0.1"

[collector]

[health]
enabled = true
request_rate_threshold = 50

[errors]
batch_size = 1
"#;

struct TestApp {
    server: TestServer,
    reporter: Arc<ErrorReporter>,
    _dir: tempfile::TempDir,
}

fn test_app(collector: CollectorConfig) -> TestApp {
    let mut config = AppConfig::load_from_str(TEST_CONFIG).unwrap();
    config.collector = collector;
    let dir = tempfile::TempDir::new().unwrap();
    config.backup.work_dir = dir.path().to_path_buf();

    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let client = Arc::new(CollectorClient::new(&config.collector).unwrap());
    let health = Arc::new(HealthMonitor::new(
        config.health.clone(),
        store.clone(),
        Arc::new(StaticProbe::new(quiet_readings())),
        client.clone(),
        Arc::new(SystemClock),
    ));
    let backup = Arc::new(BackupOrchestrator::new(
        config.backup.clone(),
        store.clone(),
        client.clone(),
        Arc::new(CommandExporter::new(config.backup.export_command.clone())),
    ));
    let connectivity = Arc::new(ConnectivityMonitor::new(
        store,
        client.clone(),
        Arc::new(SystemClock),
        Arc::new(LogNotifier),
        config.connectivity.failure_threshold,
    ));
    let reporter = Arc::new(ErrorReporter::new(config.errors.clone(), client.clone()));
    let mut chain = HandlerChain::new();
    chain.push(Arc::new(CaptureHandler::new(
        config.errors.clone(),
        reporter.clone(),
        Value::Null,
    )));

    let app = routes::app(AppState {
        health,
        backup,
        connectivity,
        collector: client,
        error_chain: Arc::new(chain),
    });
    TestApp {
        server: TestServer::new(app),
        reporter,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_version_endpoint() {
    let app = test_app(unconfigured_collector());
    let response = app.server.get("/version").await;
    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(
        json.get("name").and_then(|v| v.as_str()),
        Some("errorvault-agent")
    );
    assert!(json.get("version").and_then(|v| v.as_str()).is_some());
}

#[tokio::test]
async fn test_request_hook_counts_into_status() {
    let fake = FakeCollector::start().await;
    let app = test_app(fake.config());

    for _ in 0..3 {
        let response = app
            .server
            .post("/hooks/request")
            .json(&json!({
                "uri": "/shop?page=2",
                "remote_addr": "10.0.0.1",
                "headers": { "X-Forwarded-For": "203.0.113.5, 10.0.0.1" }
            }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
    }
    let skipped = app
        .server
        .post("/hooks/request")
        .json(&json!({ "uri": "/admin/ajax", "skip": true }))
        .await;
    skipped.assert_status(StatusCode::NO_CONTENT);

    let response = app.server.get("/status").await;
    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["health"]["enabled"], true);
    assert_eq!(json["health"]["snapshot"]["traffic"]["requests_per_minute"], 3);
    assert_eq!(json["health"]["snapshot"]["traffic"]["unique_ips"], 1);
    assert_eq!(json["health"]["snapshot"]["status"], "healthy");
    assert_eq!(json["collector_configured"], true);
    assert_eq!(json["backup"]["backup_in_progress"], false);
    assert_eq!(json["connectivity"]["consecutive_failures"], 0);
}

#[tokio::test]
async fn test_request_hook_rejects_malformed_body() {
    let app = test_app(unconfigured_collector());
    let response = app
        .server
        .post("/hooks/request")
        .json(&json!({ "remote_addr": "10.0.0.1" }))
        .expect_failure()
        .await;
    assert!(response.status_code().is_client_error());
}

#[tokio::test]
async fn test_error_hook_feeds_capture_chain() {
    let fake = FakeCollector::start().await;
    let app = test_app(fake.config());

    let response = app
        .server
        .post("/hooks/error")
        .json(&json!({
            "level": "fatal",
            "message": "Uncaught TypeError in cart.php",
            "file": "/srv/shop/cart.php",
            "line": 12,
            "request": { "url": "https://shop.example/cart", "method": "GET" }
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    assert_eq!(app.reporter.buffered(), 0);
    assert!(common::wait_until(|| fake.recorded(|r| r.batches.len() == 1)).await);
    let batch = fake.recorded(|r| r.batches[0].clone());
    assert_eq!(batch["errors"][0]["severity"], "fatal");
    assert_eq!(batch["errors"][0]["url"], "https://shop.example/cart");
}

#[tokio::test]
async fn test_actions_without_collector() {
    let app = test_app(unconfigured_collector());

    let json: Value = app.server.post("/actions/poll-backup").await.json();
    assert_eq!(json["success"], false);
    assert!(json["message"].as_str().unwrap().contains("API endpoint and token"));

    let json: Value = app.server.post("/actions/test-health").await.json();
    assert_eq!(json["success"], false);
    assert!(json["snapshot"].is_null());

    let json: Value = app.server.post("/actions/verify-token").await.json();
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_actions_with_collector() {
    let fake = FakeCollector::start().await;
    let app = test_app(fake.config());

    let json: Value = app.server.post("/actions/test-health").await.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["snapshot"]["status"], "healthy");

    let json: Value = app.server.post("/actions/poll-backup").await.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "No pending backup found.");

    let json: Value = app.server.post("/actions/verify-token").await.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "API token verified.");
    assert_eq!(json["data"]["site"], "shop");
}

#[tokio::test]
async fn test_verify_token_surfaces_collector_error() {
    let fake = FakeCollector::start_with(Behaviour {
        verify_status: 403,
        verify_body: json!({ "success": false, "error": "Token revoked." }),
        ..Behaviour::default()
    })
    .await;
    let app = test_app(fake.config());
    let json: Value = app.server.post("/actions/verify-token").await.json();
    assert_eq!(json["success"], false);
    assert_eq!(json["message"], "Token revoked.");
}

#[tokio::test]
async fn test_backup_log_read_and_clear() {
    let fake = FakeCollector::start().await;
    let app = test_app(fake.config());
    app.server.post("/actions/poll-backup").await.assert_status_ok();

    let json: Value = app.server.get("/backup/log").add_query_param("lines", 1).await.json();
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].as_str().unwrap().ends_with("No pending backup found"));

    app.server
        .delete("/backup/log")
        .await
        .assert_status(StatusCode::NO_CONTENT);
    let json: Value = app.server.get("/backup/log").await.json();
    assert!(json["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_maintenance_actions() {
    let app = test_app(unconfigured_collector());

    let json: Value = app.server.post("/actions/cleanup-temp").await.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "Removed 0 temporary files.");

    let json: Value = app.server.post("/actions/clear-failure-log").await.json();
    assert_eq!(json["success"], true);
}
