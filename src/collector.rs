// HTTP client for the remote collector. Every call carries the API token and agent
// User-Agent; timeouts are per call class (notify / control / poll / part / single upload).

use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::models::{Alert, BackupJob, HealthSnapshot, PartRecord};
use crate::version::{VERSION, user_agent};
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument};

const TOKEN_HEADER: &str = "X-API-Token";
const UPLOAD_ID_HEADER: &str = "X-Upload-Id";
const PART_NUMBER_HEADER: &str = "X-Part-Number";

pub struct CollectorClient {
    http: Client,
    base_url: String,
    config: CollectorConfig,
}

impl CollectorClient {
    pub fn new(config: &CollectorConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            base_url: normalize_base_url(&config.base_url),
            config: config.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn site_name(&self) -> &str {
        &self.config.site_name
    }

    pub fn site_url(&self) -> &str {
        &self.config.site_url
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        timeout_secs: u64,
    ) -> Result<RequestBuilder, CollectorError> {
        if !self.is_configured() {
            return Err(CollectorError::NotConfigured);
        }
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(Duration::from_secs(timeout_secs))
            .header(TOKEN_HEADER, &self.config.api_token))
    }

    /// POST /health/alert. Callers dispatch this without waiting on the request path.
    #[instrument(skip(self, alert), fields(repo = "collector", operation = "send_alert", alert_type = %alert.alert_type))]
    pub async fn send_alert(&self, alert: &Alert) -> Result<(), CollectorError> {
        let mut body = serde_json::to_value(alert)
            .map_err(|e| CollectorError::InvalidResponse(e.to_string()))?;
        self.add_site_context(&mut body, true);
        let resp = self
            .request(Method::POST, "/health/alert", self.config.notify_timeout_secs)?
            .json(&body)
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// POST /health/report. Status is checked; non-blocking callers just ignore the result.
    #[instrument(skip(self, snapshot), fields(repo = "collector", operation = "send_report"))]
    pub async fn send_report(&self, snapshot: &HealthSnapshot) -> Result<(), CollectorError> {
        let mut body = serde_json::to_value(snapshot)
            .map_err(|e| CollectorError::InvalidResponse(e.to_string()))?;
        self.add_site_context(&mut body, false);
        let resp = self
            .request(Method::POST, "/health/report", self.config.control_timeout_secs)?
            .json(&body)
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// GET /backups/pending. `Ok(None)` when nothing is queued.
    #[instrument(skip(self), fields(repo = "collector", operation = "poll_pending"))]
    pub async fn poll_pending(&self) -> Result<Option<BackupJob>, CollectorError> {
        let resp = self
            .request(Method::GET, "/backups/pending", self.config.poll_timeout_secs)?
            .send()
            .await?;
        let body: Value = exactly_ok(resp).await?.json().await?;
        parse_pending(&body)
    }

    /// POST /backups/{id}/upload/initiate. Returns the server-assigned upload id.
    #[instrument(skip(self, metadata), fields(repo = "collector", operation = "initiate_upload"))]
    pub async fn initiate_upload(
        &self,
        job_id: u64,
        checksum: &str,
        file_size: u64,
        chunk_size: u64,
        total_parts: u32,
        metadata: &Value,
    ) -> Result<String, CollectorError> {
        let resp = self
            .request(
                Method::POST,
                &format!("/backups/{}/upload/initiate", job_id),
                self.config.control_timeout_secs,
            )?
            .json(&json!({
                "checksum": checksum,
                "file_size": file_size,
                "chunk_size": chunk_size,
                "total_parts": total_parts,
                "metadata": metadata,
            }))
            .send()
            .await?;
        let body: Value = exactly_ok(resp).await?.json().await?;
        lookup(&body, "upload_id")
            .and_then(value_to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CollectorError::InvalidResponse("missing upload_id".into()))
    }

    /// POST /backups/{id}/upload/part with the raw chunk. Returns the server etag, if any.
    #[instrument(skip(self, chunk), fields(repo = "collector", operation = "upload_part", chunk_len = chunk.len()))]
    pub async fn upload_part(
        &self,
        job_id: u64,
        upload_id: &str,
        part_number: u32,
        chunk: Bytes,
    ) -> Result<Option<String>, CollectorError> {
        let resp = self
            .request(
                Method::POST,
                &format!("/backups/{}/upload/part", job_id),
                self.config.part_timeout_secs,
            )?
            .header(UPLOAD_ID_HEADER, upload_id)
            .header(PART_NUMBER_HEADER, part_number.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(chunk)
            .send()
            .await?;
        let resp = exactly_ok(resp).await?;
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(lookup(&body, "etag")
            .and_then(value_to_string)
            .filter(|e| !e.is_empty()))
    }

    /// POST /backups/{id}/upload/complete with every acknowledged part in order.
    #[instrument(skip(self, parts), fields(repo = "collector", operation = "complete_upload", parts = parts.len()))]
    pub async fn complete_upload(
        &self,
        job_id: u64,
        upload_id: &str,
        checksum: &str,
        parts: &[PartRecord],
    ) -> Result<(), CollectorError> {
        let resp = self
            .request(
                Method::POST,
                &format!("/backups/{}/upload/complete", job_id),
                self.config.control_timeout_secs,
            )?
            .json(&json!({
                "upload_id": upload_id,
                "checksum": checksum,
                "parts": parts,
            }))
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// POST /backups/{id}/upload/abort. Best effort.
    #[instrument(skip(self), fields(repo = "collector", operation = "abort_upload"))]
    pub async fn abort_upload(&self, job_id: u64, upload_id: &str) -> Result<(), CollectorError> {
        let resp = self
            .request(
                Method::POST,
                &format!("/backups/{}/upload/abort", job_id),
                self.config.notify_timeout_secs,
            )?
            .json(&json!({ "upload_id": upload_id }))
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// POST /backups/{id}/upload as multipart/form-data, one attempt.
    #[instrument(skip(self, archive, metadata), fields(repo = "collector", operation = "upload_single", size = archive.len()))]
    pub async fn upload_single(
        &self,
        job_id: u64,
        file_name: &str,
        archive: Bytes,
        checksum: &str,
        metadata: &Value,
    ) -> Result<(), CollectorError> {
        let len = archive.len() as u64;
        let file_part = reqwest::multipart::Part::stream_with_length(archive, len)
            .file_name(file_name.to_string())
            .mime_str("application/zip")?;
        let form = reqwest::multipart::Form::new()
            .part("backup_archive", file_part)
            .text("checksum", checksum.to_string())
            .text("metadata", metadata.to_string());
        let resp = self
            .request(
                Method::POST,
                &format!("/backups/{}/upload", job_id),
                self.config.single_upload_timeout_secs,
            )?
            .multipart(form)
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// POST /errors with one error record.
    pub async fn send_error(&self, record: &Value) -> Result<(), CollectorError> {
        let resp = self
            .request(Method::POST, "/errors", self.config.notify_timeout_secs)?
            .json(record)
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// POST /errors/batch with `{"errors": [...]}`.
    pub async fn send_batch(&self, records: &[Value]) -> Result<(), CollectorError> {
        let resp = self
            .request(Method::POST, "/errors/batch", self.config.control_timeout_secs)?
            .json(&json!({ "errors": records }))
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// POST /ping, blocking, so failures can be counted.
    #[instrument(skip(self), fields(repo = "collector", operation = "ping"))]
    pub async fn ping(&self, now_unix: u64) -> Result<(), CollectorError> {
        let resp = self
            .request(Method::POST, "/ping", self.config.notify_timeout_secs)?
            .json(&json!({ "timestamp": now_unix, "site_url": self.config.site_url }))
            .send()
            .await?;
        success_or_error(resp).await.map(|_| ())
    }

    /// GET /verify. Returns the `data` object of a successful verification.
    #[instrument(skip(self), fields(repo = "collector", operation = "verify_token"))]
    pub async fn verify_token(&self) -> Result<Value, CollectorError> {
        let resp = self
            .request(Method::GET, "/verify", self.config.control_timeout_secs)?
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status == StatusCode::OK && body.get("success").and_then(Value::as_bool) == Some(true) {
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Invalid response from server.")
            .to_string();
        Err(CollectorError::Status {
            status: status.as_u16(),
            body: message,
        })
    }

    fn add_site_context(&self, body: &mut Value, with_timestamp: bool) {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("site_url".into(), json!(self.config.site_url));
            obj.insert("site_name".into(), json!(self.config.site_name));
            obj.insert("agent_version".into(), json!(VERSION));
            if with_timestamp {
                obj.insert("timestamp".into(), json!(local_timestamp()));
            }
        }
    }
}

/// Local time as `YYYY-mm-dd HH:MM:SS`, the collector's timestamp format.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Strip trailing slashes and a legacy `/errors` suffix.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/errors")
        .unwrap_or(trimmed)
        .to_string()
}

async fn status_error(resp: Response) -> CollectorError {
    match resp.status() {
        StatusCode::UNAUTHORIZED => CollectorError::Unauthorized,
        StatusCode::CONFLICT => CollectorError::Conflict,
        status => {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error (failed to read response body)".to_string());
            debug!(status = status.as_u16(), "collector returned error status");
            CollectorError::Status {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Any 2xx.
async fn success_or_error(resp: Response) -> Result<Response, CollectorError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp).await)
    }
}

/// 200 only; control calls treat other 2xx codes as protocol errors.
async fn exactly_ok(resp: Response) -> Result<Response, CollectorError> {
    if resp.status() == StatusCode::OK {
        Ok(resp)
    } else {
        Err(status_error(resp).await)
    }
}

/// Field at the top level or nested under `data`.
fn lookup<'a>(body: &'a Value, field: &str) -> Option<&'a Value> {
    body.get(field)
        .or_else(|| body.get("data").and_then(|d| d.get(field)))
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

fn parse_pending(body: &Value) -> Result<Option<BackupJob>, CollectorError> {
    let data = body.get("data").unwrap_or(&Value::Null);
    if !data.get("has_pending_backup").is_some_and(is_truthy) {
        return Ok(None);
    }
    let backup = data
        .get("backup")
        .ok_or_else(|| CollectorError::InvalidResponse("missing data.backup".into()))?;
    let id = backup
        .get("id")
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| CollectorError::InvalidResponse("missing or invalid backup id".into()))?;
    let include_uploads = backup.get("include_uploads").is_some_and(is_truthy);
    Ok(Some(BackupJob {
        id,
        include_uploads,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_strips_errors_suffix() {
        assert_eq!(
            normalize_base_url("https://vault.example.com/api/v1/errors/"),
            "https://vault.example.com/api/v1"
        );
        assert_eq!(
            normalize_base_url("https://vault.example.com/api/v1"),
            "https://vault.example.com/api/v1"
        );
    }

    #[test]
    fn parse_pending_reads_job() {
        let body = json!({
            "data": {
                "has_pending_backup": true,
                "backup": { "id": "42", "include_uploads": 1 }
            }
        });
        let job = parse_pending(&body).unwrap().unwrap();
        assert_eq!(job.id, 42);
        assert!(job.include_uploads);
    }

    #[test]
    fn parse_pending_none_when_flag_false() {
        let body = json!({ "data": { "has_pending_backup": false } });
        assert!(parse_pending(&body).unwrap().is_none());
        assert!(parse_pending(&json!({})).unwrap().is_none());
    }

    #[test]
    fn lookup_falls_back_to_data() {
        let body = json!({ "data": { "etag": "abc" } });
        assert_eq!(lookup(&body, "etag"), Some(&json!("abc")));
    }
}
