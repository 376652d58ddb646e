// Shared test helpers: an in-process fake collector and host readings
#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use errorvault_agent::config::CollectorConfig;
use errorvault_agent::sysinfo_repo::{DiskReading, HostReadings, LoadAverage, MemoryReading};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the fake collector answers. Mutable while the server runs.
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub pending_status: u16,
    pub pending_body: Value,
    pub upload_id: Option<String>,
    /// part number -> how many more times it answers 500
    pub part_failures: HashMap<u32, u32>,
    /// When set, every part gets this status.
    pub part_status: Option<u16>,
    pub return_etag: bool,
    pub complete_status: u16,
    /// Statuses for successive single-shot uploads; 200 once drained.
    pub single_statuses: VecDeque<u16>,
    pub ping_status: u16,
    pub verify_status: u16,
    pub verify_body: Value,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            pending_status: 200,
            pending_body: json!({ "success": true, "data": { "has_pending_backup": false } }),
            upload_id: Some("up-1".into()),
            part_failures: HashMap::new(),
            part_status: None,
            return_etag: true,
            complete_status: 200,
            single_statuses: VecDeque::new(),
            ping_status: 200,
            verify_status: 200,
            verify_body: json!({ "success": true, "data": { "site": "shop" } }),
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub alerts: Vec<Value>,
    pub reports: Vec<Value>,
    pub errors: Vec<Value>,
    pub batches: Vec<Value>,
    pub pings: Vec<Value>,
    pub polls: usize,
    pub initiates: Vec<Value>,
    /// (part number, upload id, body length) for every part attempt
    pub part_attempts: Vec<(u32, String, usize)>,
    pub completes: Vec<Value>,
    pub aborts: Vec<Value>,
    /// (content type, body length) for every single-shot attempt
    pub single_uploads: Vec<(String, usize)>,
    pub tokens: Vec<String>,
    pub user_agents: Vec<String>,
}

#[derive(Default)]
pub struct FakeState {
    pub behaviour: Mutex<Behaviour>,
    pub recorded: Mutex<Recorded>,
}

impl FakeState {
    fn note(&self, headers: &HeaderMap) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let mut r = self.recorded.lock().unwrap();
        r.tokens.push(header("x-api-token"));
        r.user_agents.push(header("user-agent"));
    }
}

pub struct FakeCollector {
    /// Base URL in the legacy errors-endpoint form; the client strips `/errors`.
    pub base_url: String,
    pub state: Arc<FakeState>,
}

impl FakeCollector {
    pub async fn start() -> Self {
        Self::start_with(Behaviour::default()).await
    }

    pub async fn start_with(behaviour: Behaviour) -> Self {
        let state = Arc::new(FakeState {
            behaviour: Mutex::new(behaviour),
            recorded: Mutex::new(Recorded::default()),
        });
        let app = Router::new()
            .route("/health/alert", post(alert))
            .route("/health/report", post(report))
            .route("/errors", post(error))
            .route("/errors/batch", post(batch))
            .route("/ping", post(ping))
            .route("/verify", get(verify))
            .route("/backups/pending", get(pending))
            .route("/backups/{id}/upload", post(single_upload))
            .route("/backups/{id}/upload/initiate", post(initiate))
            .route("/backups/{id}/upload/part", post(part))
            .route("/backups/{id}/upload/complete", post(complete))
            .route("/backups/{id}/upload/abort", post(abort))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{}/errors", addr),
            state,
        }
    }

    pub fn config(&self) -> CollectorConfig {
        collector_config(&self.base_url, "test-token")
    }

    pub fn behave(&self, f: impl FnOnce(&mut Behaviour)) {
        f(&mut self.state.behaviour.lock().unwrap());
    }

    pub fn recorded<T>(&self, f: impl FnOnce(&Recorded) -> T) -> T {
        f(&self.state.recorded.lock().unwrap())
    }
}

pub fn collector_config(base_url: &str, token: &str) -> CollectorConfig {
    CollectorConfig {
        base_url: base_url.into(),
        api_token: token.into(),
        site_name: "Test Shop".into(),
        site_url: "https://shop.example".into(),
        notify_timeout_secs: 5,
        control_timeout_secs: 5,
        poll_timeout_secs: 5,
        part_timeout_secs: 5,
        single_upload_timeout_secs: 5,
    }
}

pub fn unconfigured_collector() -> CollectorConfig {
    collector_config("", "")
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn readings(load1: f64, cores: u32, usage: u64, limit: u64) -> HostReadings {
    HostReadings {
        load: Some(LoadAverage {
            one: load1,
            five: load1,
            fifteen: load1,
        }),
        cores,
        memory: MemoryReading {
            usage,
            peak: usage,
            limit,
        },
        disk: DiskReading {
            free: 40 * 1024 * 1024 * 1024,
            total: 100 * 1024 * 1024 * 1024,
        },
    }
}

pub fn quiet_readings() -> HostReadings {
    readings(0.1, 4, 100, 1000)
}

fn ok() -> Json<Value> {
    Json(json!({ "success": true }))
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

async fn alert(
    State(s): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    s.note(&headers);
    s.recorded.lock().unwrap().alerts.push(body);
    ok()
}

async fn report(
    State(s): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    s.note(&headers);
    s.recorded.lock().unwrap().reports.push(body);
    ok()
}

async fn error(State(s): State<Arc<FakeState>>, Json(body): Json<Value>) -> impl IntoResponse {
    s.recorded.lock().unwrap().errors.push(body);
    ok()
}

async fn batch(State(s): State<Arc<FakeState>>, Json(body): Json<Value>) -> impl IntoResponse {
    s.recorded.lock().unwrap().batches.push(body);
    ok()
}

async fn ping(State(s): State<Arc<FakeState>>, Json(body): Json<Value>) -> impl IntoResponse {
    s.recorded.lock().unwrap().pings.push(body);
    let code = s.behaviour.lock().unwrap().ping_status;
    (status(code), ok())
}

async fn verify(State(s): State<Arc<FakeState>>, headers: HeaderMap) -> impl IntoResponse {
    s.note(&headers);
    let b = s.behaviour.lock().unwrap().clone();
    (status(b.verify_status), Json(b.verify_body))
}

async fn pending(State(s): State<Arc<FakeState>>, headers: HeaderMap) -> impl IntoResponse {
    s.note(&headers);
    s.recorded.lock().unwrap().polls += 1;
    let b = s.behaviour.lock().unwrap().clone();
    (status(b.pending_status), Json(b.pending_body))
}

async fn initiate(
    State(s): State<Arc<FakeState>>,
    Path(_id): Path<u64>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    s.recorded.lock().unwrap().initiates.push(body);
    let upload_id = s.behaviour.lock().unwrap().upload_id.clone();
    match upload_id {
        Some(id) => (StatusCode::OK, Json(json!({ "success": true, "data": { "upload_id": id } }))),
        None => (StatusCode::OK, Json(json!({ "success": true }))),
    }
}

async fn part(
    State(s): State<Arc<FakeState>>,
    Path(_id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let part_number: u32 = headers
        .get("x-part-number")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let upload_id = headers
        .get("x-upload-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    s.recorded
        .lock()
        .unwrap()
        .part_attempts
        .push((part_number, upload_id, body.len()));

    let mut b = s.behaviour.lock().unwrap();
    if let Some(code) = b.part_status {
        return (status(code), Json(json!({ "success": false })));
    }
    if let Some(left) = b.part_failures.get_mut(&part_number)
        && *left > 0
    {
        *left -= 1;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false })),
        );
    }
    if b.return_etag {
        (
            StatusCode::OK,
            Json(json!({ "success": true, "data": { "etag": format!("etag-{}", part_number) } })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "success": true })))
    }
}

async fn complete(
    State(s): State<Arc<FakeState>>,
    Path(_id): Path<u64>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    s.recorded.lock().unwrap().completes.push(body);
    let code = s.behaviour.lock().unwrap().complete_status;
    (status(code), ok())
}

async fn abort(
    State(s): State<Arc<FakeState>>,
    Path(_id): Path<u64>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    s.recorded.lock().unwrap().aborts.push(body);
    ok()
}

async fn single_upload(
    State(s): State<Arc<FakeState>>,
    Path(_id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    s.recorded
        .lock()
        .unwrap()
        .single_uploads
        .push((content_type, body.len()));
    let code = s
        .behaviour
        .lock()
        .unwrap()
        .single_statuses
        .pop_front()
        .unwrap_or(200);
    (status(code), ok())
}
