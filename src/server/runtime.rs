//! Tokio worker sizing that respects container CPU limits.
//!
//! Detection order: `RELAY_CPU_LIMIT` ("2" or "2500m"), cgroup v2 `cpu.max`,
//! cgroup v1 quota/period, then the host's available parallelism.

const CPU_LIMIT_ENV: &str = "RELAY_CPU_LIMIT";
const CGROUP_V2_MAX: &str = "/sys/fs/cgroup/cpu.max";
const CGROUP_V1_QUOTA: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const CGROUP_V1_PERIOD: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";

/// Number of runtime worker threads and where the number came from.
/// Runs before logging is set up, so the caller reports it.
pub fn worker_threads() -> (usize, &'static str) {
    if let Some(cores) = std::env::var(CPU_LIMIT_ENV)
        .ok()
        .and_then(|v| parse_cpu_value(&v))
    {
        return (cores.max(1), CPU_LIMIT_ENV);
    }

    if let Some(cores) = std::fs::read_to_string(CGROUP_V2_MAX)
        .ok()
        .and_then(|max| parse_cgroup_v2_cpu(&max))
    {
        return (cores.max(1), "cgroup v2");
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string(CGROUP_V1_QUOTA),
        std::fs::read_to_string(CGROUP_V1_PERIOD),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            return (cores.max(1), "cgroup v1");
        }
    }

    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (host, "host")
}

/// Whole cores from "4" or millicores from "4000m". Fractions round down.
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// `cpu.max` holds "quota period", or "max period" when unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    cores_from_quota(quota.parse().ok()?, period.parse().ok()?)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    cores_from_quota(quota.trim().parse().ok()?, period.trim().parse().ok()?)
}

fn cores_from_quota(quota: i64, period: i64) -> Option<usize> {
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}
