use serde::Deserialize;
use std::path::PathBuf;

/// Alert cooldowns the collector UI offers; anything else is rejected.
pub const ALLOWED_ALERT_COOLDOWNS: [u64; 5] = [60, 300, 600, 1800, 3600];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub collector: CollectorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub errors: ErrorCaptureConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Collector API root, e.g. `https://vault.example.com/api/v1`. A trailing `/errors`
    /// (the legacy errors endpoint) is stripped.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub site_name: String,
    #[serde(default)]
    pub site_url: String,
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
    #[serde(default = "default_control_timeout_secs")]
    pub control_timeout_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    #[serde(default = "default_single_upload_timeout_secs")]
    pub single_upload_timeout_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    5
}

fn default_control_timeout_secs() -> u64 {
    10
}

fn default_poll_timeout_secs() -> u64 {
    20
}

fn default_part_timeout_secs() -> u64 {
    120
}

fn default_single_upload_timeout_secs() -> u64 {
    300
}

impl CollectorConfig {
    /// Endpoint and token both present; without them no network call is attempted.
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.api_token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite file for persistent state. In-memory when unset.
    pub path: Option<String>,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_prune_interval_secs() -> u64 {
    3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// Whole-host used/total memory.
    #[default]
    System,
    /// Resident memory of `health.watch_pid`.
    Process,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cpu_load_threshold")]
    pub cpu_load_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_request_rate_threshold")]
    pub request_rate_threshold: u64,
    #[serde(default = "default_request_spike_threshold")]
    pub request_spike_threshold: f64,
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default)]
    pub memory_source: MemorySource,
    pub watch_pid: Option<u32>,
    /// Memory ceiling in bytes; 0 = unlimited (memory checks skipped). When unset the
    /// probe falls back to the cgroup limit or total RAM.
    pub memory_limit_bytes: Option<u64>,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
}

fn default_cpu_load_threshold() -> f64 {
    2.0
}

fn default_memory_threshold() -> f64 {
    80.0
}

fn default_request_rate_threshold() -> u64 {
    100
}

fn default_request_spike_threshold() -> f64 {
    3.0
}

fn default_alert_cooldown_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_report_interval_secs() -> u64 {
    300
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cpu_load_threshold: default_cpu_load_threshold(),
            memory_threshold: default_memory_threshold(),
            request_rate_threshold: default_request_rate_threshold(),
            request_spike_threshold: default_request_spike_threshold(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            check_interval_secs: default_check_interval_secs(),
            report_interval_secs: default_report_interval_secs(),
            memory_source: MemorySource::default(),
            watch_pid: None,
            memory_limit_bytes: None,
            data_root: default_data_root(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Initiate / part / complete.
    #[default]
    Chunked,
    /// Whole archive in one multipart/form-data request.
    Single,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    pub uploads_dir: Option<PathBuf>,
    /// Dump command; its stdout becomes `database.sql`.
    #[serde(default)]
    pub export_command: Vec<String>,
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
    #[serde(default = "default_max_part_retries")]
    pub max_part_retries: u32,
    #[serde(default = "default_max_single_upload_retries")]
    pub max_single_upload_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default)]
    pub upload_mode: UploadMode,
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("data/backups")
}

fn default_chunk_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_archive_bytes() -> u64 {
    512_000 * 1024
}

fn default_max_part_retries() -> u32 {
    3
}

fn default_max_single_upload_retries() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_lock_ttl_secs() -> u64 {
    600
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: default_poll_interval_secs(),
            work_dir: default_work_dir(),
            uploads_dir: None,
            export_command: Vec::new(),
            chunk_size_bytes: default_chunk_size_bytes(),
            max_archive_bytes: default_max_archive_bytes(),
            max_part_retries: default_max_part_retries(),
            max_single_upload_retries: default_max_single_upload_retries(),
            retry_base_ms: default_retry_base_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            upload_mode: UploadMode::default(),
        }
    }
}

impl BackupConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.work_dir.join("tmp")
    }

    pub fn log_file(&self) -> PathBuf {
        self.work_dir.join("backup.log")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorCaptureConfig {
    #[serde(default)]
    pub include_notices: bool,
    #[serde(default)]
    pub include_warnings: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub send_immediately: bool,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval_secs() -> u64 {
    10
}

impl Default for ErrorCaptureConfig {
    fn default() -> Self {
        Self {
            include_notices: false,
            include_warnings: false,
            exclude_patterns: Vec::new(),
            batch_size: default_batch_size(),
            send_immediately: false,
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Consecutive ping failures before the operator is notified (at most once a day).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
}

fn default_ping_interval_secs() -> u64 {
    300
}

fn default_failure_threshold() -> u64 {
    5
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            self.health.cpu_load_threshold > 0.0,
            "health.cpu_load_threshold must be > 0, got {}",
            self.health.cpu_load_threshold
        );
        anyhow::ensure!(
            self.health.memory_threshold > 0.0 && self.health.memory_threshold <= 100.0,
            "health.memory_threshold must be in (0, 100], got {}",
            self.health.memory_threshold
        );
        anyhow::ensure!(
            self.health.request_rate_threshold > 0,
            "health.request_rate_threshold must be > 0, got {}",
            self.health.request_rate_threshold
        );
        anyhow::ensure!(
            self.health.request_spike_threshold > 0.0,
            "health.request_spike_threshold must be > 0, got {}",
            self.health.request_spike_threshold
        );
        anyhow::ensure!(
            ALLOWED_ALERT_COOLDOWNS.contains(&self.health.alert_cooldown_secs),
            "health.alert_cooldown_secs must be one of {:?}, got {}",
            ALLOWED_ALERT_COOLDOWNS,
            self.health.alert_cooldown_secs
        );
        anyhow::ensure!(
            self.health.check_interval_secs > 0,
            "health.check_interval_secs must be > 0, got {}",
            self.health.check_interval_secs
        );
        anyhow::ensure!(
            self.health.report_interval_secs > 0,
            "health.report_interval_secs must be > 0, got {}",
            self.health.report_interval_secs
        );
        anyhow::ensure!(
            self.health.memory_source != MemorySource::Process || self.health.watch_pid.is_some(),
            "health.watch_pid is required when health.memory_source = \"process\""
        );
        anyhow::ensure!(
            self.backup.poll_interval_secs > 0,
            "backup.poll_interval_secs must be > 0, got {}",
            self.backup.poll_interval_secs
        );
        anyhow::ensure!(
            self.backup.chunk_size_bytes > 0,
            "backup.chunk_size_bytes must be > 0, got {}",
            self.backup.chunk_size_bytes
        );
        anyhow::ensure!(
            self.backup.max_archive_bytes > 0,
            "backup.max_archive_bytes must be > 0, got {}",
            self.backup.max_archive_bytes
        );
        anyhow::ensure!(
            self.backup.lock_ttl_secs > 0,
            "backup.lock_ttl_secs must be > 0, got {}",
            self.backup.lock_ttl_secs
        );
        anyhow::ensure!(
            !self.backup.enabled || !self.backup.export_command.is_empty(),
            "backup.export_command must be non-empty when backup.enabled = true"
        );
        anyhow::ensure!(
            self.errors.batch_size > 0,
            "errors.batch_size must be > 0, got {}",
            self.errors.batch_size
        );
        anyhow::ensure!(
            self.errors.flush_interval_secs > 0,
            "errors.flush_interval_secs must be > 0, got {}",
            self.errors.flush_interval_secs
        );
        anyhow::ensure!(
            self.connectivity.ping_interval_secs > 0,
            "connectivity.ping_interval_secs must be > 0, got {}",
            self.connectivity.ping_interval_secs
        );
        anyhow::ensure!(
            self.store.prune_interval_secs > 0,
            "store.prune_interval_secs must be > 0, got {}",
            self.store.prune_interval_secs
        );
        Ok(())
    }
}
