// Baseline connectivity check against the collector, with a bounded failure log and a
// once-a-day operator notification after repeated consecutive failures.

use crate::clock::Clock;
use crate::collector::{CollectorClient, local_timestamp};
use crate::store::KvStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument, warn};

pub const FAILURE_LOG_KEY: &str = "connection_failures";
pub const CONSECUTIVE_FAILURES_KEY: &str = "consecutive_failures";
pub const NOTIFIED_KEY: &str = "failure_notification_sent";

const FAILURE_LOG_LEN: usize = 20;
const CONSECUTIVE_TTL: Duration = Duration::from_secs(3600);
const NOTIFY_EVERY: Duration = Duration::from_secs(24 * 3600);
const NOTIFY_RECENT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Call that failed, e.g. `ping`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// Local time, `YYYY-mm-dd HH:MM:SS`.
    pub timestamp: String,
    pub time: u64,
}

/// Out-of-band channel to a human operator.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Writes the notification to the log at error level.
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        error!(subject, body, "operator notification");
        Ok(())
    }
}

pub struct ConnectivityMonitor {
    store: Arc<dyn KvStore>,
    collector: Arc<CollectorClient>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn OperatorNotifier>,
    failure_threshold: u64,
}

impl ConnectivityMonitor {
    pub fn new(
        store: Arc<dyn KvStore>,
        collector: Arc<CollectorClient>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn OperatorNotifier>,
        failure_threshold: u64,
    ) -> Self {
        Self {
            store,
            collector,
            clock,
            notifier,
            failure_threshold,
        }
    }

    /// Ping the collector. Returns whether it answered with 2xx. Not attempted while the
    /// collector is unconfigured.
    #[instrument(skip(self), fields(component = "connectivity", operation = "ping"))]
    pub async fn ping(&self) -> anyhow::Result<bool> {
        if !self.collector.is_configured() {
            return Ok(false);
        }
        match self.collector.ping(self.clock.now_unix()).await {
            Ok(()) => {
                self.store.delete(CONSECUTIVE_FAILURES_KEY).await?;
                Ok(true)
            }
            Err(e) => {
                self.record_failure("ping", &e.to_string()).await?;
                Ok(false)
            }
        }
    }

    /// Append to the failure log and bump the consecutive counter; notify the operator once
    /// the count before this failure has reached the threshold.
    pub async fn record_failure(&self, kind: &str, message: &str) -> anyhow::Result<()> {
        warn!(kind, message, "collector connection failure");
        let mut log = self.failures().await?;
        log.push(FailureEntry {
            kind: kind.to_string(),
            message: message.to_string(),
            timestamp: local_timestamp(),
            time: self.clock.now_unix(),
        });
        if log.len() > FAILURE_LOG_LEN {
            log.drain(..log.len() - FAILURE_LOG_LEN);
        }
        self.store.set_json(FAILURE_LOG_KEY, &log, None).await?;

        let consecutive = self
            .store
            .incr(CONSECUTIVE_FAILURES_KEY, CONSECUTIVE_TTL)
            .await?;
        if consecutive.saturating_sub(1) >= self.failure_threshold {
            self.notify_operator(&log).await?;
        }
        Ok(())
    }

    async fn notify_operator(&self, log: &[FailureEntry]) -> anyhow::Result<()> {
        let first_today = self
            .store
            .set_if_absent(NOTIFIED_KEY, b"1".to_vec(), NOTIFY_EVERY)
            .await?;
        if !first_today {
            return Ok(());
        }
        let site = self.collector.site_name();
        let mut body = format!(
            "ErrorVault agent on {} has experienced repeated connection failures.\n\nRecent failures:\n",
            site
        );
        for f in &log[log.len().saturating_sub(NOTIFY_RECENT)..] {
            body.push_str(&format!("- {}: {} - {}\n", f.timestamp, f.kind, f.message));
        }
        body.push_str("\nPlease check the collector endpoint and API token.\n");
        self.notifier
            .notify("[ErrorVault] Connection Issues Detected", &body)
            .await
    }

    pub async fn failures(&self) -> anyhow::Result<Vec<FailureEntry>> {
        Ok(self
            .store
            .get_json(FAILURE_LOG_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn consecutive_failures(&self) -> anyhow::Result<u64> {
        self.store.counter(CONSECUTIVE_FAILURES_KEY).await
    }

    pub async fn clear_failure_log(&self) -> anyhow::Result<()> {
        self.store.delete(FAILURE_LOG_KEY).await?;
        self.store.delete(CONSECUTIVE_FAILURES_KEY).await
    }
}
