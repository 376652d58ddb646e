// Domain models shared by the health monitor, backup pipeline and collector client

mod alert;
mod backup;
mod health;

pub use alert::{Alert, AlertType, Severity};
pub use backup::{BackupArtifact, BackupJob, PartRecord, UploadSession};
pub use health::{
    CpuSection, DiskSection, HealthSnapshot, HealthStatus, MemorySection, TrafficSection,
};

use serde::{Deserialize, Serialize};

/// Result of an on-demand action (test report, manual poll, token check).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Human-readable byte size with binary units, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".into();
    }
    let pow = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let pow = pow.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(pow as i32);
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[pow])
}

/// Round to one decimal place, as reported in snapshots and alert payloads.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
