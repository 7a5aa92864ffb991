use anyhow::Result;
use metrics::gauge;
use shardlease_core::{MetricType, OperatingRange, WorkerMetricSummary, WorkerMetricsStore};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer_metrics::WORKER_UTILIZATION;
use crate::config::AssignmentConfig;
use crate::metric_sampler::WorkerMetric;

// Caps the in-memory buffer if reporting falls behind capture.
const MAX_BUFFERED_SAMPLES: usize = 1_000;

/// Captures local utilization, smooths it, and persists the worker's summary.
///
/// Raw values are buffered in memory at the capture frequency. At every
/// report the buffered values of each metric are averaged, folded into the
/// metric's moving average, appended to its bounded history, and the whole
/// summary is written to the worker metrics store.
#[derive(Clone)]
pub struct WorkerMetricsAggregator {
    worker_id: String,
    metrics: Vec<Arc<dyn WorkerMetric>>,
    store: Arc<dyn WorkerMetricsStore>,
    config: AssignmentConfig,
    samples: Arc<Mutex<HashMap<MetricType, VecDeque<f64>>>>,
    summary: Arc<Mutex<WorkerMetricSummary>>,
}

impl WorkerMetricsAggregator {
    pub fn new(
        worker_id: impl Into<String>,
        metrics: Vec<Arc<dyn WorkerMetric>>,
        store: Arc<dyn WorkerMetricsStore>,
        config: AssignmentConfig,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            summary: Arc::new(Mutex::new(WorkerMetricSummary::new(worker_id.clone()))),
            worker_id,
            metrics,
            store,
            config,
            samples: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Captures one raw value per metric into the in-memory buffer.
    pub async fn capture_once(&self) {
        for metric in &self.metrics {
            match metric.capture().await {
                Ok(value) => {
                    let mut samples = self.samples.lock().await;
                    let buffer = samples.entry(metric.metric_type()).or_default();
                    if buffer.len() >= MAX_BUFFERED_SAMPLES {
                        buffer.pop_front();
                    }
                    buffer.push_back(value);
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.worker_id,
                        metric = metric.metric_type().as_str(),
                        error = %e,
                        "failed to capture worker metric"
                    );
                }
            }
        }
    }

    /// Folds the buffered values into the summary and persists it.
    ///
    /// Returns `None` when nothing was captured since the last report, in
    /// which case nothing is written and the stored summary ages towards
    /// staleness. Without any configured metric the report is a bare
    /// heartbeat that only refreshes the timestamp.
    pub async fn report_once(&self) -> Result<Option<WorkerMetricSummary>> {
        let drained: HashMap<MetricType, VecDeque<f64>> = {
            let mut samples = self.samples.lock().await;
            std::mem::take(&mut *samples)
        };
        if !self.metrics.is_empty() && drained.values().all(VecDeque::is_empty) {
            debug!(worker_id = %self.worker_id, "no worker metric samples captured since last report");
            return Ok(None);
        }

        let snapshot = {
            let mut summary = self.summary.lock().await;
            for (metric_type, values) in drained {
                if values.is_empty() {
                    continue;
                }
                let raw = values.iter().sum::<f64>() / values.len() as f64;
                let stats = summary.metrics.entry(metric_type).or_default();
                stats.operating_range = self.operating_range(metric_type);
                let smoothed = stats.record(
                    raw,
                    self.config.worker_metrics_ema_alpha,
                    self.config.no_of_persisted_metrics_per_worker_metrics,
                );
                gauge!(WORKER_UTILIZATION.name, "metric" => metric_type.as_str()).set(smoothed);
            }
            summary.last_update_ms = now_millis();
            summary.clone()
        };

        self.store.put_worker_metrics(snapshot.clone()).await?;
        debug!(
            worker_id = %self.worker_id,
            utilization = ?snapshot.utilization(),
            "worker metrics reported"
        );
        Ok(Some(snapshot))
    }

    fn operating_range(&self, metric_type: MetricType) -> OperatingRange {
        self.metrics
            .iter()
            .find(|m| m.metric_type() == metric_type)
            .map(|m| m.operating_range())
            .unwrap_or_default()
    }

    /// Latest in-memory summary, whether or not it was persisted.
    pub async fn current_summary(&self) -> WorkerMetricSummary {
        self.summary.lock().await.clone()
    }

    /// Spawns the capture and report loops; both stop when `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            worker_id = %self.worker_id,
            capture_frequency_ms = self.config.in_memory_worker_metrics_capture_frequency_millis,
            reporter_frequency_ms = self.config.worker_metrics_reporter_freq_millis,
            "starting worker metrics aggregator"
        );

        let capture = {
            let aggregator = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(aggregator.config.capture_frequency());
                loop {
                    tokio::select! {
                        _ = interval.tick() => aggregator.capture_once().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let report = {
            let aggregator = self.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(aggregator.config.reporter_frequency());
                // the first tick completes immediately, nothing is buffered yet
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = aggregator.report_once().await {
                                warn!(
                                    worker_id = %aggregator.worker_id,
                                    error = %e,
                                    "failed to persist worker metrics, retrying next period"
                                );
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        vec![capture, report]
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod aggregator_test;
