// Health snapshot sent with every periodic report

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSection {
    pub load_1min: f64,
    pub load_5min: f64,
    pub load_15min: f64,
    pub cores: u32,
    pub load_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySection {
    pub usage: u64,
    pub usage_formatted: String,
    pub peak: u64,
    pub peak_formatted: String,
    /// 0 = unlimited.
    pub limit: u64,
    pub limit_formatted: String,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSection {
    pub free: u64,
    pub free_formatted: String,
    pub total: u64,
    pub total_formatted: String,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSection {
    pub requests_per_minute: u64,
    pub unique_ips: u64,
}

/// Built fresh on every sample; never stored beyond the report payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Local time, `YYYY-mm-dd HH:MM:SS`.
    pub timestamp: String,
    pub cpu: CpuSection,
    pub memory: MemorySection,
    pub disk: DiskSection,
    pub traffic: TrafficSection,
    pub status: HealthStatus,
}
