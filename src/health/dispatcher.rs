// Alert dispatch with a per-type cooldown. The cooldown map is a JSON object
// (alert type -> unix seconds of the last send) kept in the store for an hour.

use crate::clock::Clock;
use crate::collector::CollectorClient;
use crate::models::Alert;
use crate::store::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const LAST_ALERT_KEY: &str = "last_health_alert";
pub const LAST_ALERT_TTL: Duration = Duration::from_secs(3600);

pub struct AlertDispatcher {
    store: Arc<dyn KvStore>,
    collector: Arc<CollectorClient>,
    clock: Arc<dyn Clock>,
    cooldown_secs: u64,
    /// Serialises the read-check-write of the cooldown map.
    gate: Mutex<()>,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        collector: Arc<CollectorClient>,
        clock: Arc<dyn Clock>,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            store,
            collector,
            clock,
            cooldown_secs,
            gate: Mutex::new(()),
        }
    }

    /// Drops alerts still in cooldown, records the send time of the rest and hands them to
    /// the collector without waiting. Returns the alerts that went out.
    pub async fn dispatch(&self, alerts: Vec<Alert>) -> anyhow::Result<Vec<Alert>> {
        if alerts.is_empty() {
            return Ok(alerts);
        }
        let _gate = self.gate.lock().await;
        let now = self.clock.now_unix();
        let mut last_sent: HashMap<String, u64> = self
            .store
            .get_json(LAST_ALERT_KEY)
            .await?
            .unwrap_or_default();

        let mut due = Vec::new();
        for alert in alerts {
            let key = alert.alert_type.as_str();
            let cooled = last_sent
                .get(key)
                .is_none_or(|sent| now.saturating_sub(*sent) >= self.cooldown_secs);
            if cooled {
                last_sent.insert(key.to_string(), now);
                due.push(alert);
            } else {
                debug!(alert_type = key, "alert suppressed by cooldown");
            }
        }
        if due.is_empty() {
            return Ok(due);
        }

        self.store
            .set_json(LAST_ALERT_KEY, &last_sent, Some(LAST_ALERT_TTL))
            .await?;

        for alert in &due {
            let collector = self.collector.clone();
            let alert = alert.clone();
            tokio::spawn(async move {
                if let Err(e) = collector.send_alert(&alert).await {
                    warn!(alert_type = %alert.alert_type, error = %e, "failed to send health alert");
                }
            });
        }
        Ok(due)
    }
}
