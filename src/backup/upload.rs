// Archive upload to the collector: the 3-phase chunked protocol (initiate, parts, complete)
// or the single-shot multipart form.

use super::archive::sha256_hex;
use super::log::BackupLog;
use crate::collector::CollectorClient;
use crate::error::{BackupError, CollectorError};
use crate::models::UploadSession;
use crate::retry::{RetryPolicy, retry_with_backoff};
use bytes::Bytes;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{instrument, warn};

const PROGRESS_EVERY_PARTS: u32 = 5;

/// What to upload and for which job.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub job_id: u64,
    pub path: &'a Path,
    pub checksum: &'a str,
    pub size: u64,
    pub metadata: &'a Value,
}

/// Number of parts for `size` bytes: `ceil(size / chunk_size)`.
pub fn part_count(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(chunk_size.max(1)) as u32
}

pub struct ChunkedUploader {
    collector: Arc<CollectorClient>,
    chunk_size: u64,
    retry: RetryPolicy,
}

impl ChunkedUploader {
    pub fn new(collector: Arc<CollectorClient>, chunk_size: u64, retry: RetryPolicy) -> Self {
        Self {
            collector,
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    /// Upload parts 1..N in order. Any part that exhausts its retries, a 409, or a failed
    /// complete aborts the server-side session.
    #[instrument(skip(self, req, log), fields(component = "backup", operation = "chunked_upload", job_id = req.job_id))]
    pub async fn upload(
        &self,
        req: UploadRequest<'_>,
        log: &BackupLog,
    ) -> Result<UploadSession, BackupError> {
        let total_parts = part_count(req.size, self.chunk_size);
        let upload_id = self
            .collector
            .initiate_upload(
                req.job_id,
                req.checksum,
                req.size,
                self.chunk_size,
                total_parts,
                req.metadata,
            )
            .await?;
        log.append(&format!(
            "Upload initiated: upload_id={}, {} parts",
            upload_id, total_parts
        ));

        let mut session = UploadSession::new(upload_id);
        match self.send_parts(&req, &mut session, total_parts, log).await {
            Ok(()) => {}
            Err(e) => {
                self.abort(req.job_id, &session.upload_id).await;
                return Err(e);
            }
        }

        if let Err(e) = self
            .collector
            .complete_upload(req.job_id, &session.upload_id, req.checksum, session.parts())
            .await
        {
            self.abort(req.job_id, &session.upload_id).await;
            return Err(e.into());
        }
        log.append(&format!("Upload completed: {} parts", session.parts().len()));
        Ok(session)
    }

    async fn send_parts(
        &self,
        req: &UploadRequest<'_>,
        session: &mut UploadSession,
        total_parts: u32,
        log: &BackupLog,
    ) -> Result<(), BackupError> {
        let mut file = tokio::fs::File::open(req.path).await?;
        let mut remaining = req.size;
        let upload_id = session.upload_id.clone();

        for part_number in 1..=total_parts {
            let len = remaining.min(self.chunk_size) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            remaining -= len as u64;
            let chunk = Bytes::from(buf);

            let etag = retry_with_backoff(
                &self.retry,
                "upload_part",
                CollectorError::is_retryable,
                |_| {
                    self.collector
                        .upload_part(req.job_id, &upload_id, part_number, chunk.clone())
                },
            )
            .await
            .inspect_err(|e| {
                log.append(&format!("Part {} failed: {}", part_number, e));
            })?
            .unwrap_or_else(|| sha256_hex(&chunk));

            session
                .record_part(part_number, etag)
                .map_err(|e| CollectorError::InvalidResponse(e.to_string()))?;

            if part_number % PROGRESS_EVERY_PARTS == 0 || part_number == total_parts {
                log.append(&format!("Uploaded part {}/{}", part_number, total_parts));
            }
        }
        Ok(())
    }

    /// Best effort; the outcome never changes the job result.
    async fn abort(&self, job_id: u64, upload_id: &str) {
        if let Err(e) = self.collector.abort_upload(job_id, upload_id).await {
            warn!(job_id, upload_id, error = %e, "abort upload failed");
        }
    }
}

pub struct SingleUploader {
    collector: Arc<CollectorClient>,
    retry: RetryPolicy,
}

impl SingleUploader {
    pub fn new(collector: Arc<CollectorClient>, retry: RetryPolicy) -> Self {
        Self { collector, retry }
    }

    /// Whole archive in one multipart request. 409 is not retried.
    #[instrument(skip(self, req, log), fields(component = "backup", operation = "single_upload", job_id = req.job_id))]
    pub async fn upload(&self, req: UploadRequest<'_>, log: &BackupLog) -> Result<(), BackupError> {
        let archive = Bytes::from(tokio::fs::read(req.path).await?);
        let file_name = req
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup.zip".into());
        retry_with_backoff(
            &self.retry,
            "upload_single",
            CollectorError::is_retryable,
            |attempt| {
                if attempt > 0 {
                    log.append(&format!("Retry {}...", attempt));
                }
                self.collector.upload_single(
                    req.job_id,
                    &file_name,
                    archive.clone(),
                    req.checksum,
                    req.metadata,
                )
            },
        )
        .await?;
        Ok(())
    }
}

/// Upload strategy selected by `backup.upload_mode`.
pub enum Uploader {
    Chunked(ChunkedUploader),
    Single(SingleUploader),
}

impl Uploader {
    pub async fn upload(&self, req: UploadRequest<'_>, log: &BackupLog) -> Result<(), BackupError> {
        match self {
            Uploader::Chunked(u) => u.upload(req, log).await.map(|_| ()),
            Uploader::Single(u) => u.upload(req, log).await,
        }
    }
}
