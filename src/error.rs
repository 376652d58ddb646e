// Error taxonomy for collector calls and backup runs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("API endpoint and token are required")]
    NotConfigured,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unauthorized (401) - check API token")]
    Unauthorized,

    #[error("backup no longer accepting uploads (409 Conflict)")]
    Conflict,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CollectorError {
    /// Transport failures and non-2xx responses are retried; a 409 is authoritative and a
    /// missing configuration or malformed body will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::Transport(_)
                | CollectorError::Unauthorized
                | CollectorError::Status { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CollectorError::Conflict)
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to create temporary directory {path}: {source}")]
    TempDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("database export failed: {0}")]
    Export(String),

    #[error("archive creation failed: {0}")]
    Archive(String),

    #[error("backup file exceeds {limit_mb:.0}MB limit ({size_mb:.2}MB)")]
    TooLarge { size_mb: f64, limit_mb: f64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload failed: {0}")]
    Upload(#[from] CollectorError),
}

impl BackupError {
    pub fn too_large(size: u64, limit: u64) -> Self {
        const MB: f64 = 1024.0 * 1024.0;
        BackupError::TooLarge {
            size_mb: size as f64 / MB,
            limit_mb: limit as f64 / MB,
        }
    }
}
