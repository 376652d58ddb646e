// Export producer: writes a data dump to a target file and reports its size

use crate::error::BackupError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tracing::instrument;

#[async_trait]
pub trait Exporter: Send + Sync {
    /// Write the dump to `target`. Returns the number of bytes written.
    async fn export(&self, target: &Path) -> Result<u64, BackupError>;
}

/// Runs a dump command (e.g. `mysqldump --single-transaction shop`) with stdout redirected
/// to the target file. A non-zero exit or empty output is an export failure.
pub struct CommandExporter {
    command: Vec<String>,
}

impl CommandExporter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }
}

#[async_trait]
impl Exporter for CommandExporter {
    #[instrument(skip(self), fields(component = "backup", operation = "export"))]
    async fn export(&self, target: &Path) -> Result<u64, BackupError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(BackupError::Export("no export command configured".into()));
        };
        let out = std::fs::File::create(target)?;
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Export(format!("failed to run {}: {}", program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Export(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        let size = tokio::fs::metadata(target).await?.len();
        if size == 0 {
            return Err(BackupError::Export("export produced no output".into()));
        }
        Ok(size)
    }
}
