// Periodic health reports. The scheduled report is fire-and-forget; the on-demand test
// report waits for the collector and surfaces the outcome.

use super::HealthMonitor;
use crate::error::CollectorError;
use crate::models::{ActionResult, HealthSnapshot};
use std::sync::Arc;
use tracing::{info, warn};

impl HealthMonitor {
    /// Sample and send without waiting for the collector. Skipped while monitoring is off.
    pub async fn send_periodic_report(&self) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let snapshot = self.sample().await?;
        let collector = Arc::clone(&self.collector);
        tokio::spawn(async move {
            if let Err(e) = collector.send_report(&snapshot).await {
                warn!(error = %e, "failed to send periodic health report");
            }
        });
        Ok(())
    }

    /// Sample and send, waiting for the response. Runs even with monitoring disabled so
    /// operators can check connectivity first.
    pub async fn test_health_report(&self) -> (ActionResult, Option<HealthSnapshot>) {
        if !self.collector.is_configured() {
            return (
                ActionResult::failed(CollectorError::NotConfigured.to_string()),
                None,
            );
        }
        let snapshot = match self.sample().await {
            Ok(s) => s,
            Err(e) => {
                return (
                    ActionResult::failed(format!("Failed to sample host health: {}", e)),
                    None,
                );
            }
        };
        match self.collector.send_report(&snapshot).await {
            Ok(()) => {
                info!(status = ?snapshot.status, "test health report sent");
                (
                    ActionResult::ok("Health report sent successfully."),
                    Some(snapshot),
                )
            }
            Err(e) => (
                ActionResult::failed(format!("Failed to send health report: {}", e)),
                Some(snapshot),
            ),
        }
    }
}
