// Per-minute request counters: total, per client IP and per URL path.
// Keys live ~120s after the last write, enough to compare the current and previous window.

use crate::store::KvStore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub const WINDOW_SECS: u64 = 60;
pub const WINDOW_TTL: Duration = Duration::from_secs(120);

const REQUEST_COUNT_KEY: &str = "request_count";
const REQUEST_IPS_KEY: &str = "request_ips";
const REQUEST_URLS_KEY: &str = "request_urls";

/// Minute bucket id: `floor(unix_time / 60) + offset`.
pub fn window_id(now_unix: u64, offset: i64) -> i64 {
    (now_unix / WINDOW_SECS) as i64 + offset
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSample {
    pub window: i64,
    pub client_ip: String,
    pub url_path: String,
}

impl RequestSample {
    /// Sample for `uri` in the window containing `now_unix`; the query string is dropped so
    /// paths group together.
    pub fn new(now_unix: u64, client_ip: impl Into<String>, uri: &str) -> Self {
        Self {
            window: window_id(now_unix, 0),
            client_ip: client_ip.into(),
            url_path: url_path(uri),
        }
    }
}

/// Request URI without its query string; `/` when empty.
pub fn url_path(uri: &str) -> String {
    let path = uri.split('?').next().unwrap_or_default();
    if path.is_empty() {
        "/".into()
    } else {
        path.to_string()
    }
}

/// First valid address from CF-Connecting-IP, X-Forwarded-For (first hop), X-Real-IP,
/// then the socket peer. `"unknown"` when none parse.
pub fn resolve_client_ip(headers: &HashMap<String, String>, remote_addr: Option<&str>) -> String {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    let candidates = [
        header("cf-connecting-ip"),
        header("x-forwarded-for"),
        header("x-real-ip"),
        remote_addr,
    ];
    candidates
        .into_iter()
        .flatten()
        .filter(|v| !v.is_empty())
        .map(|v| v.split(',').next().unwrap_or_default().trim())
        .find(|v| v.parse::<IpAddr>().is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub total: u64,
    /// IP -> count, first-seen order.
    pub ips: Vec<(String, u64)>,
    /// URL path -> count, first-seen order.
    pub urls: Vec<(String, u64)>,
}

impl WindowCounts {
    pub fn unique_ips(&self) -> u64 {
        self.ips.len() as u64
    }
}

pub struct WindowCounter {
    store: Arc<dyn KvStore>,
}

impl WindowCounter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, sample: &RequestSample) -> anyhow::Result<()> {
        let w = sample.window;
        self.store
            .incr(&format!("{}_{}", REQUEST_COUNT_KEY, w), WINDOW_TTL)
            .await?;
        self.store
            .incr_field(
                &format!("{}_{}", REQUEST_IPS_KEY, w),
                &sample.client_ip,
                WINDOW_TTL,
            )
            .await?;
        self.store
            .incr_field(
                &format!("{}_{}", REQUEST_URLS_KEY, w),
                &sample.url_path,
                WINDOW_TTL,
            )
            .await?;
        Ok(())
    }

    pub async fn read(&self, window: i64) -> anyhow::Result<WindowCounts> {
        Ok(WindowCounts {
            total: self.total(window).await?,
            ips: self
                .store
                .fields(&format!("{}_{}", REQUEST_IPS_KEY, window))
                .await?,
            urls: self
                .store
                .fields(&format!("{}_{}", REQUEST_URLS_KEY, window))
                .await?,
        })
    }

    pub async fn total(&self, window: i64) -> anyhow::Result<u64> {
        self.store
            .counter(&format!("{}_{}", REQUEST_COUNT_KEY, window))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn window_id_is_minute_bucket() {
        assert_eq!(window_id(119, 0), 1);
        assert_eq!(window_id(120, 0), 2);
        assert_eq!(window_id(120, -1), 1);
    }

    #[test]
    fn url_path_drops_query() {
        assert_eq!(url_path("/shop?page=2"), "/shop");
        assert_eq!(url_path(""), "/");
        assert_eq!(url_path("?x=1"), "/");
    }

    #[test]
    fn client_ip_prefers_cloudflare_then_forwarded() {
        let h = headers(&[
            ("CF-Connecting-IP", "203.0.113.9"),
            ("X-Forwarded-For", "198.51.100.1, 10.0.0.1"),
        ]);
        assert_eq!(resolve_client_ip(&h, Some("10.0.0.2")), "203.0.113.9");

        let h = headers(&[("X-Forwarded-For", "198.51.100.1, 10.0.0.1")]);
        assert_eq!(resolve_client_ip(&h, Some("10.0.0.2")), "198.51.100.1");
    }

    #[test]
    fn client_ip_skips_invalid_values() {
        let h = headers(&[("X-Real-IP", "not-an-ip")]);
        assert_eq!(resolve_client_ip(&h, Some("2001:db8::1")), "2001:db8::1");
        assert_eq!(resolve_client_ip(&HashMap::new(), None), "unknown");
    }

    #[tokio::test]
    async fn record_aggregates_per_window() {
        let clock = Arc::new(ManualClock::new(600));
        let counter = WindowCounter::new(Arc::new(MemoryStore::with_clock(clock.clone())));

        counter.record(&RequestSample::new(600, "1.1.1.1", "/a?x=1")).await.unwrap();
        counter.record(&RequestSample::new(610, "2.2.2.2", "/b")).await.unwrap();
        counter.record(&RequestSample::new(620, "1.1.1.1", "/a")).await.unwrap();

        let counts = counter.read(window_id(600, 0)).await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(
            counts.ips,
            vec![("1.1.1.1".to_string(), 2), ("2.2.2.2".to_string(), 1)]
        );
        assert_eq!(
            counts.urls,
            vec![("/a".to_string(), 2), ("/b".to_string(), 1)]
        );
        assert_eq!(counter.total(window_id(600, 1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counters_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(600));
        let counter = WindowCounter::new(Arc::new(MemoryStore::with_clock(clock.clone())));
        counter.record(&RequestSample::new(600, "1.1.1.1", "/")).await.unwrap();
        clock.advance(WINDOW_TTL.as_secs());
        assert_eq!(counter.read(window_id(600, 0)).await.unwrap(), WindowCounts::default());
    }
}
