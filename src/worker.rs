// Background scheduler: independent interval ticks for health checks, periodic reports,
// backup polls, connectivity pings, error-buffer flushes and store pruning.
// Each job runs inline; a slow backup delays the other ticks, which then skip.

use crate::backup::{BackupOrchestrator, BackupOutcome};
use crate::connectivity::ConnectivityMonitor;
use crate::error_capture::ErrorReporter;
use crate::health::HealthMonitor;
use crate::store::KvStore;
use std::sync::Arc;
use tokio::time::{Duration, Interval, MissedTickBehavior, interval_at};

/// Services driven by the worker, plus the shutdown signal.
pub struct WorkerDeps {
    pub health: Arc<HealthMonitor>,
    pub backup: Arc<BackupOrchestrator>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub error_reporter: Arc<ErrorReporter>,
    pub store: Arc<dyn KvStore>,
    pub shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

/// Tick periods in seconds. A job whose feature is disabled still ticks but does nothing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub health_check_interval_secs: u64,
    pub report_interval_secs: u64,
    pub backup_enabled: bool,
    pub backup_poll_interval_secs: u64,
    pub ping_interval_secs: u64,
    pub error_flush_interval_secs: u64,
    pub prune_interval_secs: u64,
}

/// First tick one period from now, so startup does not fire every job at once.
fn ticker(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        health,
        backup,
        connectivity,
        error_reporter,
        store,
        mut shutdown_rx,
    } = deps;

    tokio::spawn(async move {
        let mut health_tick = ticker(config.health_check_interval_secs);
        let mut report_tick = ticker(config.report_interval_secs);
        let mut backup_tick = ticker(config.backup_poll_interval_secs);
        let mut ping_tick = ticker(config.ping_interval_secs);
        let mut flush_tick = ticker(config.error_flush_interval_secs);
        let mut prune_tick = ticker(config.prune_interval_secs);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Worker shutting down");
                    break;
                }
                _ = health_tick.tick() => {
                    if let Err(e) = health.run_health_checks().await {
                        tracing::warn!(error = %e, operation = "run_health_checks", "health check failed");
                    }
                }
                _ = report_tick.tick() => {
                    if let Err(e) = health.send_periodic_report().await {
                        tracing::warn!(error = %e, operation = "send_periodic_report", "health report failed");
                    }
                }
                _ = backup_tick.tick(), if config.backup_enabled => {
                    match backup.poll_pending_backup().await {
                        BackupOutcome::Completed { job_id, elapsed_secs } => {
                            tracing::info!(job_id, elapsed_secs, "backup completed");
                        }
                        BackupOutcome::Failed { job_id, reason, elapsed_secs } => {
                            tracing::error!(job_id, elapsed_secs, reason = %reason, "backup failed");
                        }
                        other => tracing::debug!(outcome = ?other, "backup poll"),
                    }
                }
                _ = ping_tick.tick() => {
                    if let Err(e) = connectivity.ping().await {
                        tracing::warn!(error = %e, operation = "ping", "connectivity check failed");
                    }
                }
                _ = flush_tick.tick() => {
                    error_reporter.flush();
                }
                _ = prune_tick.tick() => {
                    match store.prune_expired().await {
                        Ok(n) if n > 0 => tracing::debug!(removed = n, "pruned expired store entries"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, operation = "prune_expired", "store prune failed"),
                    }
                }
            }
        }

        if let Some(handle) = error_reporter.flush() {
            let _ = handle.await;
        }
        tracing::debug!("Worker stopped");
    })
}
