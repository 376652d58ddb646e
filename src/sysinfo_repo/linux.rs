// Linux-specific helpers: /proc and cgroup memory accounting.

/// Peak resident set size (VmHWM) of `pid` in bytes.
pub(super) fn read_peak_rss_linux(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("VmHWM:") {
                let kb = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
                return Some(kb * 1024);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
    None
}

/// Memory ceiling of the current cgroup (v2 `memory.max`, then v1 `limit_in_bytes`).
/// None when unlimited or not running under a memory cgroup.
pub(super) fn read_cgroup_memory_limit_linux() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(v) = std::fs::read_to_string("/sys/fs/cgroup/memory.max") {
            return parse_cgroup_limit(&v);
        }
        if let Ok(v) = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes") {
            return parse_cgroup_limit(&v);
        }
    }
    None
}

/// `max` and the v1 "no limit" sentinel (close to i64::MAX) both mean unlimited.
pub(super) fn parse_cgroup_limit(raw: &str) -> Option<u64> {
    let v = raw.trim();
    if v == "max" {
        return None;
    }
    let bytes = v.parse::<u64>().ok()?;
    if bytes == 0 || bytes >= (1u64 << 62) {
        return None;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cgroup_limit_handles_sentinels() {
        assert_eq!(parse_cgroup_limit("max\n"), None);
        assert_eq!(parse_cgroup_limit("9223372036854771712"), None);
        assert_eq!(parse_cgroup_limit("536870912\n"), Some(536_870_912));
        assert_eq!(parse_cgroup_limit("garbage"), None);
    }
}
