//! cgroup-aware samplers for workers running in Docker or Kubernetes
//!
//! Usage is reported relative to the container limits rather than to the
//! host totals.

use anyhow::{Context, Result};
use async_trait::async_trait;
use shardlease_core::MetricType;
use std::fs;
use std::path::Path;
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::WorkerMetric;

const CPU_SETTLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

pub(crate) fn detect_cgroup_version() -> Result<CgroupVersion> {
    if Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        return Ok(CgroupVersion::V2);
    }
    if Path::new("/sys/fs/cgroup/memory").exists() || Path::new("/sys/fs/cgroup/cpu").exists() {
        return Ok(CgroupVersion::V1);
    }
    anyhow::bail!("no cgroup filesystem detected")
}

pub(crate) fn is_containerized() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    if std::env::var("KUBERNETES_SERVICE_HOST").is_ok() {
        return true;
    }
    fs::read_to_string("/proc/1/cgroup")
        .map(|content| content.contains("docker") || content.contains("kubepods"))
        .unwrap_or(false)
}

/// CPU time consumed by the container between two captures, as a share of
/// its CPU quota (or of every available core when no quota is set).
pub struct CgroupCpuMetric {
    version: CgroupVersion,
    last: Mutex<Option<(u64, Instant)>>,
}

impl CgroupCpuMetric {
    pub fn new(version: CgroupVersion) -> Self {
        Self {
            version,
            last: Mutex::new(None),
        }
    }

    fn usage_usec(&self) -> Result<u64> {
        match self.version {
            CgroupVersion::V2 => {
                let stat = read_file("/sys/fs/cgroup/cpu.stat")?;
                parse_usage_usec(&stat)
            }
            CgroupVersion::V1 => {
                let nanos = read_file_u64("/sys/fs/cgroup/cpuacct/cpuacct.usage")
                    .or_else(|_| read_file_u64("/sys/fs/cgroup/cpu,cpuacct/cpuacct.usage"))?;
                Ok(nanos / 1_000)
            }
        }
    }

    fn limit_cores(&self) -> f64 {
        let quota = match self.version {
            CgroupVersion::V2 => read_file("/sys/fs/cgroup/cpu.max")
                .ok()
                .and_then(|content| parse_cpu_max(&content)),
            CgroupVersion::V1 => {
                let quota = read_file_i64("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
                    .or_else(|_| read_file_i64("/sys/fs/cgroup/cpu,cpuacct/cpu.cfs_quota_us"))
                    .unwrap_or(-1);
                let period = read_file_u64("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
                    .or_else(|_| read_file_u64("/sys/fs/cgroup/cpu,cpuacct/cpu.cfs_period_us"))
                    .unwrap_or(100_000);
                quota_cores(quota, period)
            }
        };
        quota.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0)
        })
    }
}

#[async_trait]
impl WorkerMetric for CgroupCpuMetric {
    fn metric_type(&self) -> MetricType {
        MetricType::Cpu
    }

    async fn capture(&self) -> Result<f64> {
        let mut last = self.last.lock().await;
        let (previous, since) = match *last {
            Some(sample) => sample,
            None => {
                let first = (self.usage_usec()?, Instant::now());
                tokio::time::sleep(CPU_SETTLE_INTERVAL).await;
                first
            }
        };
        let usage = self.usage_usec()?;
        let now = Instant::now();
        *last = Some((usage, now));

        Ok(cpu_percentage(
            usage.saturating_sub(previous),
            now.duration_since(since),
            self.limit_cores(),
        ))
    }
}

/// Memory in use by the container as a share of its memory limit, or of the
/// host memory when the container is unbounded.
pub struct CgroupMemoryMetric {
    version: CgroupVersion,
}

impl CgroupMemoryMetric {
    pub fn new(version: CgroupVersion) -> Self {
        Self { version }
    }
}

#[async_trait]
impl WorkerMetric for CgroupMemoryMetric {
    fn metric_type(&self) -> MetricType {
        MetricType::Memory
    }

    async fn capture(&self) -> Result<f64> {
        let (usage, limit) = match self.version {
            CgroupVersion::V2 => (
                read_file_u64("/sys/fs/cgroup/memory.current")?,
                read_file_u64("/sys/fs/cgroup/memory.max").ok(),
            ),
            CgroupVersion::V1 => (
                read_file_u64("/sys/fs/cgroup/memory/memory.usage_in_bytes")?,
                read_file_u64("/sys/fs/cgroup/memory/memory.limit_in_bytes").ok(),
            ),
        };
        let host = host_total_memory();
        let limit = match limit {
            Some(limit) if limit > 0 && (host == 0 || limit < host) => limit,
            _ => host,
        };
        if limit == 0 {
            return Ok(0.0);
        }
        Ok((usage as f64 / limit as f64 * 100.0).min(100.0))
    }
}

fn host_total_memory() -> u64 {
    let system =
        System::new_with_specifics(RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()));
    system.total_memory()
}

/// Cores granted by a cgroup v2 `cpu.max` line, `None` when unbounded.
pub(crate) fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: u64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None;
    }
    quota_cores(quota.parse().ok()?, period)
}

fn quota_cores(quota: i64, period: u64) -> Option<f64> {
    (quota > 0 && period > 0).then(|| quota as f64 / period as f64)
}

/// `usage_usec` of a cgroup v2 `cpu.stat` file.
pub(crate) fn parse_usage_usec(stat: &str) -> Result<u64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("usage_usec "))
        .context("usage_usec missing from cpu.stat")?
        .trim()
        .parse()
        .context("failed to parse usage_usec")
}

pub(crate) fn cpu_percentage(used_usec: u64, elapsed: Duration, cores: f64) -> f64 {
    let available_usec = elapsed.as_micros() as f64 * cores;
    if available_usec <= 0.0 {
        return 0.0;
    }
    (used_usec as f64 / available_usec * 100.0).min(100.0)
}

fn read_file(path: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))
}

fn read_file_u64(path: &str) -> Result<u64> {
    read_file(path)?
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {} as u64", path))
}

fn read_file_i64(path: &str) -> Result<i64> {
    read_file(path)?
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {} as i64", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_max_quota_and_unbounded() {
        assert_eq!(parse_cpu_max("50000 100000\n"), Some(0.5));
        assert_eq!(parse_cpu_max("200000 100000"), Some(2.0));
        assert_eq!(parse_cpu_max("max 100000"), None);
        assert_eq!(parse_cpu_max(""), None);
        assert_eq!(quota_cores(-1, 100_000), None);
    }

    #[test]
    fn usage_usec_is_read_from_cpu_stat() {
        let stat = "usage_usec 1500000\nuser_usec 1000000\nsystem_usec 500000\n";
        assert_eq!(parse_usage_usec(stat).unwrap(), 1_500_000);
        assert!(parse_usage_usec("user_usec 3\n").is_err());
    }

    #[test]
    fn cpu_percentage_is_relative_to_the_quota() {
        // half a core used over one second with a half-core quota is saturation
        assert_eq!(cpu_percentage(500_000, Duration::from_secs(1), 0.5), 100.0);
        assert_eq!(cpu_percentage(500_000, Duration::from_secs(1), 2.0), 25.0);
        assert_eq!(cpu_percentage(900_000, Duration::from_secs(1), 0.5), 100.0);
        assert_eq!(cpu_percentage(1, Duration::ZERO, 1.0), 0.0);
    }
}
