// Threshold and spike checks. Pure functions over one set of readings; each returns at
// most one alert.

use crate::models::{Alert, AlertType, HealthStatus, Severity, format_bytes};
use crate::sysinfo_repo::{LoadAverage, MemoryReading};
use crate::window::WindowCounts;
use serde_json::json;
use std::net::IpAddr;

const TOP_IPS: usize = 5;
const TOP_URLS: usize = 10;
/// Spike detection needs a non-trivial previous window.
const SPIKE_MIN_PREVIOUS: u64 = 10;
const MEMORY_CRITICAL_PERCENT: f64 = 95.0;
const POTENTIAL_DDOS_MAX_IPS: u64 = 10;

/// `load1 / cores`, or raw `load1` when the core count is unknown.
pub fn load_ratio(load1: f64, cores: u32) -> f64 {
    if cores > 0 {
        load1 / cores as f64
    } else {
        load1
    }
}

/// None for an unlimited (0) ceiling.
pub fn memory_percent(memory: &MemoryReading) -> Option<f64> {
    if memory.limit == 0 {
        return None;
    }
    Some(memory.usage as f64 / memory.limit as f64 * 100.0)
}

pub fn check_cpu_load(load: Option<LoadAverage>, cores: u32, threshold: f64) -> Option<Alert> {
    let load = load?;
    let ratio = load_ratio(load.one, cores);
    if ratio < threshold {
        return None;
    }
    Some(Alert {
        alert_type: AlertType::CpuOverload,
        severity: if ratio >= threshold * 1.5 {
            Severity::Critical
        } else {
            Severity::Warning
        },
        message: format!(
            "High CPU load detected: {:.2} ({:.1}% of capacity)",
            load.one,
            ratio * 100.0
        ),
        data: json!({
            "load_1min": load.one,
            "load_5min": load.five,
            "load_15min": load.fifteen,
            "cpu_cores": cores,
            "load_ratio": (ratio * 100.0).round() / 100.0,
            "threshold": threshold,
        }),
    })
}

pub fn check_memory_usage(memory: &MemoryReading, threshold: f64) -> Option<Alert> {
    let percent = memory_percent(memory)?;
    if percent < threshold {
        return None;
    }
    Some(Alert {
        alert_type: AlertType::MemoryPressure,
        severity: if percent >= MEMORY_CRITICAL_PERCENT {
            Severity::Critical
        } else {
            Severity::Warning
        },
        message: format!(
            "High memory usage: {} of {} ({:.1}%)",
            format_bytes(memory.usage),
            format_bytes(memory.limit),
            percent
        ),
        data: json!({
            "usage": memory.usage,
            "usage_formatted": format_bytes(memory.usage),
            "limit": memory.limit,
            "limit_formatted": format_bytes(memory.limit),
            "usage_percent": crate::models::round1(percent),
            "threshold": threshold,
        }),
    })
}

/// Absolute rate first; the spike check only runs when the absolute check did not fire.
pub fn check_request_rate(
    current: &WindowCounts,
    previous_total: u64,
    rate_threshold: u64,
    spike_threshold: f64,
) -> Option<Alert> {
    let count = current.total;
    let unique_ips = current.unique_ips();

    if count >= rate_threshold {
        let top_ips: Vec<_> = top_n(&current.ips, TOP_IPS)
            .into_iter()
            .map(|(ip, requests)| json!({ "ip": mask_ip(&ip), "requests": requests }))
            .collect();
        return Some(Alert {
            alert_type: AlertType::HighRequestRate,
            severity: if count >= rate_threshold.saturating_mul(2) {
                Severity::Critical
            } else {
                Severity::Warning
            },
            message: format!(
                "High request rate detected: {} requests/min from {} unique IPs",
                count, unique_ips
            ),
            data: json!({
                "requests_per_minute": count,
                "unique_ips": unique_ips,
                "top_ips": top_ips,
                "top_urls": top_urls_json(current),
                "threshold": rate_threshold,
                "potential_ddos": unique_ips < POTENTIAL_DDOS_MAX_IPS
                    && count > rate_threshold.saturating_mul(2),
            }),
        });
    }

    if previous_total > SPIKE_MIN_PREVIOUS
        && count as f64 >= previous_total as f64 * spike_threshold
    {
        let factor = count as f64 / previous_total as f64;
        return Some(Alert {
            alert_type: AlertType::TrafficSpike,
            severity: Severity::Warning,
            message: format!(
                "Traffic spike detected: {} requests ({:.1}x increase)",
                count, factor
            ),
            data: json!({
                "current_rate": count,
                "previous_rate": previous_total,
                "increase_factor": crate::models::round1(factor),
                "unique_ips": unique_ips,
                "top_urls": top_urls_json(current),
            }),
        });
    }

    None
}

fn top_urls_json(current: &WindowCounts) -> Vec<serde_json::Value> {
    top_n(&current.urls, TOP_URLS)
        .into_iter()
        .map(|(url, requests)| json!({ "url": url, "requests": requests }))
        .collect()
}

/// Overall status, first match wins: critical, then warning, else healthy.
pub fn classify_status(
    load_ratio: f64,
    memory_percent: f64,
    requests_per_minute: u64,
    rate_threshold: u64,
) -> HealthStatus {
    if load_ratio >= 3.0
        || memory_percent >= 95.0
        || requests_per_minute >= rate_threshold.saturating_mul(3)
    {
        HealthStatus::Critical
    } else if load_ratio >= 2.0 || memory_percent >= 80.0 || requests_per_minute >= rate_threshold
    {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Highest counts first; equal counts keep first-seen order.
pub fn top_n(entries: &[(String, u64)], limit: usize) -> Vec<(String, u64)> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted.truncate(limit);
    sorted
}

/// Hide the host part: `203.0.xxx.xxx`, first three IPv6 groups, or a fully masked token.
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.xxx.xxx", o[0], o[1])
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:xxxx:xxxx", s[0], s[1], s[2])
        }
        Err(_) => "xxx.xxx.xxx.xxx".into(),
    }
}
