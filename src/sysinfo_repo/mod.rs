// Host readings via sysinfo: load average, core count, memory and disk for the data root

mod linux;

use crate::config::{HealthConfig, MemorySource};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryReading {
    pub usage: u64,
    pub peak: u64,
    /// 0 = unlimited.
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskReading {
    pub free: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostReadings {
    /// None where the platform has no load average; CPU checks are then disabled.
    pub load: Option<LoadAverage>,
    pub cores: u32,
    pub memory: MemoryReading,
    pub disk: DiskReading,
}

/// Source of host readings. The health monitor only sees this seam.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn read(&self) -> anyhow::Result<HostReadings>;
}

pub struct SysinfoRepo {
    sys: Arc<std::sync::Mutex<System>>,
    disks: Arc<std::sync::Mutex<Disks>>,
    cores: u32,
    memory_source: MemorySource,
    watch_pid: Option<u32>,
    memory_limit_override: Option<u64>,
    data_root: PathBuf,
    peak_seen: Arc<AtomicU64>,
}

impl SysinfoRepo {
    pub fn new(config: &HealthConfig) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();
        let cores = match sys.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(0),
            n => n,
        } as u32;
        let disks = Disks::new_with_refreshed_list();
        Self {
            sys: Arc::new(std::sync::Mutex::new(sys)),
            disks: Arc::new(std::sync::Mutex::new(disks)),
            cores,
            memory_source: config.memory_source,
            watch_pid: config.watch_pid,
            memory_limit_override: config.memory_limit_bytes,
            data_root: config.data_root.clone(),
            peak_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    fn load_average() -> Option<LoadAverage> {
        if cfg!(windows) || !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }
        let l = System::load_average();
        Some(LoadAverage {
            one: l.one,
            five: l.five,
            fifteen: l.fifteen,
        })
    }

    #[instrument(skip(self), fields(repo = "sysinfo", operation = "get_memory"))]
    async fn get_memory(&self) -> anyhow::Result<MemoryReading> {
        let sys = self.sys.clone();
        let source = self.memory_source;
        let watch_pid = self.watch_pid;
        let reading = tokio::task::spawn_blocking(move || {
            let mut sys = sys
                .lock()
                .map_err(|e| anyhow::anyhow!("sysinfo lock poisoned: {}", e))?;
            sys.refresh_memory();
            let total = sys.total_memory();
            match (source, watch_pid) {
                (MemorySource::Process, Some(pid)) => {
                    let pid_key = Pid::from_u32(pid);
                    sys.refresh_processes(ProcessesToUpdate::Some(&[pid_key]), true);
                    Ok::<_, anyhow::Error>(sys.process(pid_key).map(|p| {
                        (p.memory(), total, linux::read_peak_rss_linux(pid))
                    }))
                }
                _ => Ok(Some((sys.used_memory(), total, None))),
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("sysinfo task join: {}", e))??;

        // A restarting worker has no process for a while; report memory as unlimited so
        // the memory check sits out this round.
        let Some((usage, total, reported_peak)) = reading else {
            warn!(pid = ?watch_pid, "watched process not found, memory reading unavailable");
            return Ok(MemoryReading::default());
        };

        let previous_peak = self.peak_seen.fetch_max(usage, Ordering::Relaxed);
        let peak = reported_peak.unwrap_or(previous_peak.max(usage)).max(usage);
        let limit = match self.memory_limit_override {
            Some(limit) => limit,
            None => linux::read_cgroup_memory_limit_linux().unwrap_or(total),
        };
        Ok(MemoryReading { usage, peak, limit })
    }

    #[instrument(skip(self), fields(repo = "sysinfo", operation = "get_disk"))]
    async fn get_disk(&self) -> anyhow::Result<DiskReading> {
        let disks = self.disks.clone();
        let root = self.data_root.clone();
        tokio::task::spawn_blocking(move || {
            let mut disks_guard = disks
                .lock()
                .map_err(|e| anyhow::anyhow!("sysinfo disks lock poisoned: {}", e))?;
            disks_guard.refresh(false);
            let mounts: Vec<(PathBuf, DiskReading)> = disks_guard
                .list()
                .iter()
                .map(|d| {
                    (
                        d.mount_point().to_path_buf(),
                        DiskReading {
                            free: d.available_space(),
                            total: d.total_space(),
                        },
                    )
                })
                .collect();
            Ok(disk_for_path(&root, &mounts).unwrap_or_default())
        })
        .await
        .map_err(|e| anyhow::anyhow!("sysinfo task join: {}", e))?
    }
}

#[async_trait]
impl HostProbe for SysinfoRepo {
    async fn read(&self) -> anyhow::Result<HostReadings> {
        Ok(HostReadings {
            load: Self::load_average(),
            cores: self.cores,
            memory: self.get_memory().await?,
            disk: self.get_disk().await?,
        })
    }
}

/// Disk whose mount point is the longest prefix of `path`.
fn disk_for_path(path: &Path, mounts: &[(PathBuf, DiskReading)]) -> Option<DiskReading> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, reading)| *reading)
}

/// Fixed readings, for hosts that push their own numbers and for tests.
pub struct StaticProbe(pub std::sync::Mutex<HostReadings>);

impl StaticProbe {
    pub fn new(readings: HostReadings) -> Self {
        Self(std::sync::Mutex::new(readings))
    }

    pub fn set(&self, readings: HostReadings) -> anyhow::Result<()> {
        *self
            .0
            .lock()
            .map_err(|e| anyhow::anyhow!("static probe lock poisoned: {}", e))? = readings;
        Ok(())
    }
}

#[async_trait]
impl HostProbe for StaticProbe {
    async fn read(&self) -> anyhow::Result<HostReadings> {
        Ok(self
            .0
            .lock()
            .map_err(|e| anyhow::anyhow!("static probe lock poisoned: {}", e))?
            .clone())
    }
}
