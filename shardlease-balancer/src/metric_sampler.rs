//! Local resource sampling
//!
//! Raw utilization values consumed by the worker metric aggregator. Host
//! samplers use sysinfo, container samplers read the cgroup limits of the
//! worker; `StaticMetric` reports a settable value.

mod container;

pub use container::{CgroupCpuMetric, CgroupMemoryMetric, CgroupVersion};

use anyhow::Result;
use async_trait::async_trait;
use shardlease_core::{MetricType, OperatingRange};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;

/// Source of raw utilization values (0.0-100.0) for one metric type
#[async_trait]
pub trait WorkerMetric: Send + Sync {
    fn metric_type(&self) -> MetricType;

    async fn capture(&self) -> Result<f64>;

    /// Raw value at which this metric counts as fully utilized.
    fn operating_range(&self) -> OperatingRange {
        OperatingRange::default()
    }
}

/// Average CPU usage across all cores
pub struct SystemCpuMetric {
    system: Arc<Mutex<System>>,
}

impl SystemCpuMetric {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()),
        );
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemCpuMetric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerMetric for SystemCpuMetric {
    fn metric_type(&self) -> MetricType {
        MetricType::Cpu
    }

    async fn capture(&self) -> Result<f64> {
        let mut system = self.system.lock().await;

        system.refresh_cpu_all();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(100)))
            .await;
        system.refresh_cpu_all();

        let cpus = system.cpus();
        if cpus.is_empty() {
            return Ok(0.0);
        }
        let total: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
        Ok((total / cpus.len() as f32) as f64)
    }
}

/// Used memory as a share of total memory
pub struct SystemMemoryMetric {
    system: Arc<Mutex<System>>,
}

impl SystemMemoryMetric {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemMemoryMetric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerMetric for SystemMemoryMetric {
    fn metric_type(&self) -> MetricType {
        MetricType::Memory
    }

    async fn capture(&self) -> Result<f64> {
        let mut system = self.system.lock().await;
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Ok(0.0);
        }
        Ok(system.used_memory() as f64 / total as f64 * 100.0)
    }
}

/// Reports whatever value was last set, or an error when unset.
#[derive(Clone)]
pub struct StaticMetric {
    metric_type: MetricType,
    value: Arc<StdMutex<Option<f64>>>,
    operating_range: OperatingRange,
}

impl StaticMetric {
    pub fn new(metric_type: MetricType, value: f64) -> Self {
        Self {
            metric_type,
            value: Arc::new(StdMutex::new(Some(value))),
            operating_range: OperatingRange::default(),
        }
    }

    pub fn with_operating_range(mut self, max_utilization: f64) -> Self {
        self.operating_range = OperatingRange::new(max_utilization);
        self
    }

    pub fn set(&self, value: Option<f64>) {
        if let Ok(mut guard) = self.value.lock() {
            *guard = value;
        }
    }
}

#[async_trait]
impl WorkerMetric for StaticMetric {
    fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    async fn capture(&self) -> Result<f64> {
        let value = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("static metric lock poisoned"))?;
        value.ok_or_else(|| anyhow::anyhow!("no value set for {}", self.metric_type.as_str()))
    }

    fn operating_range(&self) -> OperatingRange {
        self.operating_range
    }
}

/// CPU and memory samplers for this worker.
///
/// Inside a container the samplers read usage against the cgroup limits;
/// elsewhere, or when no cgroup filesystem is found, they sample the host
/// through sysinfo.
pub fn default_worker_metrics() -> Vec<Arc<dyn WorkerMetric>> {
    if container::is_containerized() {
        match container::detect_cgroup_version() {
            Ok(version) => {
                tracing::info!(cgroup = ?version, "using container-aware worker metrics (cgroups)");
                return vec![
                    Arc::new(CgroupCpuMetric::new(version)),
                    Arc::new(CgroupMemoryMetric::new(version)),
                ];
            }
            Err(e) => tracing::warn!(
                error = %e,
                "container detected but cgroup metrics are unavailable, falling back to native"
            ),
        }
    }

    tracing::info!("using native worker metrics (sysinfo)");
    vec![
        Arc::new(SystemCpuMetric::new()),
        Arc::new(SystemMemoryMetric::new()),
    ]
}
