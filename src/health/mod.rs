// Health monitoring: request tracking, host sampling, threshold checks and reports

pub mod checks;
mod dispatcher;
mod reporter;

pub use dispatcher::{AlertDispatcher, LAST_ALERT_KEY, LAST_ALERT_TTL};

use crate::clock::Clock;
use crate::collector::{CollectorClient, local_timestamp};
use crate::config::HealthConfig;
use crate::models::{
    Alert, CpuSection, DiskSection, HealthSnapshot, MemorySection, TrafficSection, format_bytes,
    round1,
};
use crate::store::KvStore;
use crate::sysinfo_repo::{HostProbe, HostReadings};
use crate::window::{RequestSample, WindowCounter, window_id};
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn HostProbe>,
    windows: WindowCounter,
    dispatcher: AlertDispatcher,
    collector: Arc<CollectorClient>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        store: Arc<dyn KvStore>,
        probe: Arc<dyn HostProbe>,
        collector: Arc<CollectorClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = AlertDispatcher::new(
            store.clone(),
            collector.clone(),
            clock.clone(),
            config.alert_cooldown_secs,
        );
        Self {
            config,
            probe,
            windows: WindowCounter::new(store),
            dispatcher,
            collector,
            clock,
        }
    }

    /// Monitoring is on and the collector is reachable in principle.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.collector.is_configured()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Count one request in the current minute window. No-op while monitoring is off.
    pub async fn track_request(&self, client_ip: &str, uri: &str) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let sample = RequestSample::new(self.clock.now_unix(), client_ip, uri);
        self.windows.record(&sample).await
    }

    /// Run every check against fresh readings. Alerts are not dispatched.
    pub async fn evaluate(&self) -> anyhow::Result<Vec<Alert>> {
        let now = self.clock.now_unix();
        let (readings, current, previous) = futures_util::future::try_join3(
            self.probe.read(),
            self.windows.read(window_id(now, 0)),
            self.windows.total(window_id(now, -1)),
        )
        .await?;

        let alerts = [
            checks::check_cpu_load(
                readings.load,
                readings.cores,
                self.config.cpu_load_threshold,
            ),
            checks::check_memory_usage(&readings.memory, self.config.memory_threshold),
            checks::check_request_rate(
                &current,
                previous,
                self.config.request_rate_threshold,
                self.config.request_spike_threshold,
            ),
        ]
        .into_iter()
        .flatten()
        .collect();
        Ok(alerts)
    }

    /// Evaluate and dispatch. Returns the alerts that passed the cooldown.
    #[instrument(skip(self), fields(component = "health", operation = "run_health_checks"))]
    pub async fn run_health_checks(&self) -> anyhow::Result<Vec<Alert>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let alerts = self.evaluate().await?;
        let sent = self.dispatcher.dispatch(alerts).await?;
        if !sent.is_empty() {
            debug!(count = sent.len(), "health alerts dispatched");
        }
        Ok(sent)
    }

    /// Build a snapshot from fresh readings and the current window.
    pub async fn sample(&self) -> anyhow::Result<HealthSnapshot> {
        let readings = self.probe.read().await?;
        let current = self
            .windows
            .read(window_id(self.clock.now_unix(), 0))
            .await?;
        Ok(build_snapshot(
            &readings,
            current.total,
            current.unique_ips(),
            self.config.request_rate_threshold,
        ))
    }
}

fn build_snapshot(
    readings: &HostReadings,
    requests_per_minute: u64,
    unique_ips: u64,
    rate_threshold: u64,
) -> HealthSnapshot {
    let load = readings.load;
    let ratio = load
        .map(|l| checks::load_ratio(l.one, readings.cores))
        .unwrap_or(0.0);
    let memory_percent = checks::memory_percent(&readings.memory).unwrap_or(0.0);
    let disk = readings.disk;
    let used_percent = if disk.total > 0 {
        round1(disk.total.saturating_sub(disk.free) as f64 / disk.total as f64 * 100.0)
    } else {
        0.0
    };

    HealthSnapshot {
        timestamp: local_timestamp(),
        cpu: CpuSection {
            load_1min: load.map_or(0.0, |l| l.one),
            load_5min: load.map_or(0.0, |l| l.five),
            load_15min: load.map_or(0.0, |l| l.fifteen),
            cores: readings.cores,
            load_percent: round1(ratio * 100.0),
        },
        memory: MemorySection {
            usage: readings.memory.usage,
            usage_formatted: format_bytes(readings.memory.usage),
            peak: readings.memory.peak,
            peak_formatted: format_bytes(readings.memory.peak),
            limit: readings.memory.limit,
            limit_formatted: if readings.memory.limit == 0 {
                "unlimited".into()
            } else {
                format_bytes(readings.memory.limit)
            },
            usage_percent: round1(memory_percent),
        },
        disk: DiskSection {
            free: disk.free,
            free_formatted: format_bytes(disk.free),
            total: disk.total,
            total_formatted: format_bytes(disk.total),
            used_percent,
        },
        traffic: TrafficSection {
            requests_per_minute,
            unique_ips,
        },
        status: checks::classify_status(ratio, memory_percent, requests_per_minute, rate_threshold),
    }
}
