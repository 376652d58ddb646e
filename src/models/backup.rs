// Backup job, artifact and multipart upload session

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pending job handed out by the collector; immutable once claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: u64,
    #[serde(default)]
    pub include_uploads: bool,
}

/// Local files produced for one job. Removed before the orchestrator call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub sql_path: PathBuf,
    pub zip_path: PathBuf,
    /// SHA-256, lowercase hex.
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
}

/// Server-assigned upload plus the parts acknowledged so far, in part order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    parts: Vec<PartRecord>,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            parts: Vec::new(),
        }
    }

    /// Append the next acknowledged part. Parts must arrive as 1, 2, 3, ... with no gaps.
    pub fn record_part(&mut self, part_number: u32, etag: String) -> anyhow::Result<()> {
        let expected = self.parts.len() as u32 + 1;
        anyhow::ensure!(
            part_number == expected,
            "part {} recorded out of order (expected {})",
            part_number,
            expected
        );
        self.parts.push(PartRecord { part_number, etag });
        Ok(())
    }

    pub fn parts(&self) -> &[PartRecord] {
        &self.parts
    }
}
