// Backup orchestrator: poll for a pending job, then export, archive and upload under the
// backup lease. Temp files and the lease are released on every exit path.

pub mod archive;
pub mod export;
pub mod lease;
pub mod log;
pub mod upload;

pub use export::{CommandExporter, Exporter};
pub use lease::{BACKUP_LOCK_KEY, BackupLease};
pub use log::BackupLog;
pub use upload::{ChunkedUploader, SingleUploader, UploadRequest, Uploader, part_count};

use crate::collector::{CollectorClient, local_timestamp};
use crate::config::{BackupConfig, UploadMode};
use crate::error::{BackupError, CollectorError};
use crate::models::{ActionResult, BackupArtifact, BackupJob, format_bytes};
use crate::retry::RetryPolicy;
use crate::store::KvStore;
use crate::version::VERSION;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// Export taking longer than this is logged as a warning.
const SLOW_EXPORT_SECS: u64 = 300;

/// Outcome of one poll or run.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupOutcome {
    NotConfigured,
    /// Another run holds the lease.
    AlreadyRunning,
    NothingPending,
    PollFailed(String),
    Completed { job_id: u64, elapsed_secs: u64 },
    Failed { job_id: u64, reason: String, elapsed_secs: u64 },
}

impl BackupOutcome {
    pub fn to_action_result(&self) -> ActionResult {
        match self {
            BackupOutcome::NotConfigured => {
                ActionResult::failed(CollectorError::NotConfigured.to_string())
            }
            BackupOutcome::AlreadyRunning => ActionResult::ok("Backup already in progress."),
            BackupOutcome::NothingPending => ActionResult::ok("No pending backup found."),
            BackupOutcome::PollFailed(reason) => {
                ActionResult::failed(format!("Poll failed: {}", reason))
            }
            BackupOutcome::Completed {
                job_id,
                elapsed_secs,
            } => ActionResult::ok(format!(
                "Backup {} completed in {} seconds.",
                job_id, elapsed_secs
            )),
            BackupOutcome::Failed { job_id, reason, .. } => {
                ActionResult::failed(format!("Backup {} failed: {}", job_id, reason))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupStatus {
    pub enabled: bool,
    pub backup_in_progress: bool,
    pub temp_dir_exists: bool,
    pub log_file_exists: bool,
    pub log_file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRequirements {
    pub work_dir_writable: bool,
    pub api_configured: bool,
    pub exporter_configured: bool,
    pub all_met: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeEstimate {
    pub uploads_size: u64,
    pub uploads_size_formatted: String,
    pub within_limit: bool,
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    collector: Arc<CollectorClient>,
    lease: BackupLease,
    exporter: Arc<dyn Exporter>,
    uploader: Uploader,
    log: BackupLog,
}

impl BackupOrchestrator {
    pub fn new(
        config: BackupConfig,
        store: Arc<dyn KvStore>,
        collector: Arc<CollectorClient>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        let base = Duration::from_millis(config.retry_base_ms);
        let uploader = match config.upload_mode {
            UploadMode::Chunked => Uploader::Chunked(ChunkedUploader::new(
                collector.clone(),
                config.chunk_size_bytes,
                RetryPolicy::exponential(config.max_part_retries, base),
            )),
            UploadMode::Single => Uploader::Single(SingleUploader::new(
                collector.clone(),
                RetryPolicy::linear(config.max_single_upload_retries, base * 2),
            )),
        };
        Self {
            lease: BackupLease::new(store, Duration::from_secs(config.lock_ttl_secs)),
            log: BackupLog::new(config.log_file()),
            config,
            collector,
            exporter,
            uploader,
        }
    }

    pub fn log(&self) -> &BackupLog {
        &self.log
    }

    pub fn lease(&self) -> &BackupLease {
        &self.lease
    }

    /// Take the lease, ask the collector for a job and run it. A held lease makes this a
    /// no-op. The lease is released before returning.
    #[instrument(skip(self), fields(component = "backup", operation = "poll_pending_backup"))]
    pub async fn poll_pending_backup(&self) -> BackupOutcome {
        if !self.collector.is_configured() {
            self.log.append("Backup polling skipped: API not configured");
            return BackupOutcome::NotConfigured;
        }
        match self.lease.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                self.log.append("Backup already in progress, skipping poll");
                return BackupOutcome::AlreadyRunning;
            }
            Err(e) => {
                self.log.append(&format!("Poll failed: lease unavailable: {}", e));
                return BackupOutcome::PollFailed(e.to_string());
            }
        }

        let outcome = match self.collector.poll_pending().await {
            Err(e) => {
                self.log.append(&format!("Poll failed: {}", e));
                BackupOutcome::PollFailed(e.to_string())
            }
            Ok(None) => {
                self.log.append("No pending backup found");
                BackupOutcome::NothingPending
            }
            Ok(Some(job)) => {
                self.log.append(&format!(
                    "Pending backup found: ID={}, include_uploads={}",
                    job.id,
                    if job.include_uploads { "yes" } else { "no" }
                ));
                self.execute(&job).await
            }
        };
        self.release_lease().await;
        outcome
    }

    /// Run one job start to finish. The lease is released afterwards whether or not this
    /// call took it.
    pub async fn run_backup(&self, job: &BackupJob) -> BackupOutcome {
        let outcome = self.execute(job).await;
        self.release_lease().await;
        outcome
    }

    async fn release_lease(&self) {
        if let Err(e) = self.lease.release().await {
            warn!(error = %e, "failed to release backup lease");
        }
    }

    async fn execute(&self, job: &BackupJob) -> BackupOutcome {
        self.log.append(&format!("Starting backup: ID={}", job.id));
        let started = Instant::now();
        let tmp_dir = self.config.temp_dir();
        let sql_path = tmp_dir.join(format!("backup-{}.sql", job.id));
        let zip_path = tmp_dir.join(format!("backup-{}.zip", job.id));

        let result = self.run_stages(job, &tmp_dir, &sql_path, &zip_path).await;
        remove_if_exists(&sql_path).await;
        remove_if_exists(&zip_path).await;

        let elapsed_secs = started.elapsed().as_secs();
        match result {
            Ok(_) => {
                self.log.append(&format!(
                    "Backup completed successfully in {} seconds",
                    elapsed_secs
                ));
                BackupOutcome::Completed {
                    job_id: job.id,
                    elapsed_secs,
                }
            }
            Err(e) => {
                self.log.append(&format!(
                    "Backup failed after {} seconds: {}",
                    elapsed_secs, e
                ));
                BackupOutcome::Failed {
                    job_id: job.id,
                    reason: e.to_string(),
                    elapsed_secs,
                }
            }
        }
    }

    async fn run_stages(
        &self,
        job: &BackupJob,
        tmp_dir: &Path,
        sql_path: &Path,
        zip_path: &Path,
    ) -> Result<BackupArtifact, BackupError> {
        tokio::fs::create_dir_all(tmp_dir)
            .await
            .map_err(|source| BackupError::TempDir {
                path: tmp_dir.to_path_buf(),
                source,
            })?;

        self.log.append("Exporting database...");
        let export_started = Instant::now();
        self.exporter.export(sql_path).await?;
        let export_secs = export_started.elapsed().as_secs();
        self.log.append(&format!(
            "Database export completed in {} seconds",
            export_secs
        ));
        if export_secs > SLOW_EXPORT_SECS {
            self.log.append(&format!(
                "WARNING: Backup taking longer than expected ({}s elapsed)",
                export_secs
            ));
        }

        self.log.append("Building ZIP archive...");
        let uploads = if job.include_uploads {
            self.config.uploads_dir.clone()
        } else {
            None
        };
        let summary = archive::build_archive(
            sql_path.to_path_buf(),
            zip_path.to_path_buf(),
            uploads,
            Some(self.config.work_dir.clone()),
        )
        .await?;
        if job.include_uploads && !summary.uploads_included {
            self.log.append("Uploads directory not found, skipping");
        } else if summary.uploads_included {
            self.log.append(&format!(
                "Added {} files from uploads directory",
                summary.files_added
            ));
        }
        self.log.append(&format!(
            "Archive created: {:.2}MB, SHA256={}...",
            summary.size_bytes as f64 / 1024.0 / 1024.0,
            &summary.checksum[..16.min(summary.checksum.len())]
        ));
        if summary.size_bytes > self.config.max_archive_bytes {
            return Err(BackupError::too_large(
                summary.size_bytes,
                self.config.max_archive_bytes,
            ));
        }

        let metadata = json!({
            "agent_version": VERSION,
            "include_uploads": job.include_uploads,
            "file_size": summary.size_bytes,
            "site_url": self.collector.site_url(),
            "site_name": self.collector.site_name(),
            "created_at": local_timestamp(),
        });
        self.log.append("Uploading backup...");
        self.uploader
            .upload(
                UploadRequest {
                    job_id: job.id,
                    path: zip_path,
                    checksum: &summary.checksum,
                    size: summary.size_bytes,
                    metadata: &metadata,
                },
                &self.log,
            )
            .await?;

        Ok(BackupArtifact {
            sql_path: sql_path.to_path_buf(),
            zip_path: zip_path.to_path_buf(),
            checksum: summary.checksum,
            size_bytes: summary.size_bytes,
        })
    }

    pub async fn status(&self) -> BackupStatus {
        let log_file_size = self.log.size();
        BackupStatus {
            enabled: self.config.enabled,
            backup_in_progress: self.lease.is_held().await.unwrap_or(false),
            temp_dir_exists: self.config.temp_dir().is_dir(),
            log_file_exists: log_file_size.is_some(),
            log_file_size,
        }
    }

    /// Remove leftover files from the temp dir. Returns how many were removed. Refuses while
    /// the lease is held, since the running job owns those files.
    pub async fn cleanup_temp_files(&self) -> anyhow::Result<usize> {
        anyhow::ensure!(
            !self.lease.is_held().await?,
            "a backup is in progress, temporary files left in place"
        );
        let mut entries = match tokio::fs::read_dir(self.config.temp_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut cleaned = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    pub async fn estimate_uploads_size(&self) -> anyhow::Result<SizeEstimate> {
        let dir: Option<PathBuf> = self.config.uploads_dir.clone();
        let uploads_size = tokio::task::spawn_blocking(move || {
            dir.as_deref().map_or(0, archive::directory_size)
        })
        .await
        .map_err(|e| anyhow::anyhow!("size estimate join: {}", e))?;
        Ok(SizeEstimate {
            uploads_size,
            uploads_size_formatted: format_bytes(uploads_size),
            within_limit: uploads_size < self.config.max_archive_bytes,
        })
    }

    pub async fn check_requirements(&self) -> BackupRequirements {
        let work_dir_writable = is_writable(&self.config.work_dir).await;
        let api_configured = self.collector.is_configured();
        let exporter_configured = !self.config.export_command.is_empty();
        BackupRequirements {
            work_dir_writable,
            api_configured,
            exporter_configured,
            all_met: work_dir_writable && api_configured && exporter_configured,
        }
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), error = %e, "failed to remove backup temp file");
        }
        _ => {}
    }
}

async fn is_writable(dir: &Path) -> bool {
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return false;
    }
    let probe = dir.join(".write-test");
    let ok = tokio::fs::write(&probe, b"").await.is_ok();
    remove_if_exists(&probe).await;
    ok
}
