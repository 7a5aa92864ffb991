use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Utilization ceiling assumed for a worker that stopped reporting.
pub const MAX_UTILIZATION: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Cpu,
    Memory,
    Network,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Cpu => "cpu",
            MetricType::Memory => "memory",
            MetricType::Network => "network",
        }
    }
}

/// Raw value at which a metric counts as fully utilized.
///
/// Utilization is read as a percentage of `max_utilization`, so a metric
/// that should never run past half of its resource uses 50.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingRange {
    pub max_utilization: f64,
}

impl Default for OperatingRange {
    fn default() -> Self {
        Self {
            max_utilization: MAX_UTILIZATION,
        }
    }
}

impl OperatingRange {
    pub fn new(max_utilization: f64) -> Self {
        Self { max_utilization }
    }

    /// `raw` as a percentage of the range. A non-positive range reads as
    /// the default one.
    pub fn normalize(&self, raw: f64) -> f64 {
        if self.max_utilization > 0.0 {
            raw / self.max_utilization * MAX_UTILIZATION
        } else {
            raw
        }
    }
}

/// Smoothed value and recent raw history of one metric.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub smoothed: Option<f64>,
    pub recent: VecDeque<f64>,
    #[serde(default)]
    pub operating_range: OperatingRange,
}

impl MetricStats {
    /// Folds a raw value into the exponential moving average and keeps at
    /// most `history` raw values, evicting the oldest.
    pub fn record(&mut self, raw: f64, alpha: f64, history: usize) -> f64 {
        let smoothed = ema(alpha, raw, self.smoothed);
        self.smoothed = Some(smoothed);
        if history > 0 {
            while self.recent.len() >= history {
                self.recent.pop_front();
            }
            self.recent.push_back(raw);
        }
        smoothed
    }
}

/// `alpha * raw + (1 - alpha) * prev`; the first sample seeds the average.
pub fn ema(alpha: f64, raw: f64, prev: Option<f64>) -> f64 {
    match prev {
        Some(prev) => alpha * raw + (1.0 - alpha) * prev,
        None => raw,
    }
}

/// Per-worker utilization, as persisted by the metric aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetricSummary {
    pub worker_id: String,
    pub metrics: BTreeMap<MetricType, MetricStats>,
    /// Milliseconds since the Unix epoch of the last report.
    pub last_update_ms: u64,
}

impl WorkerMetricSummary {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            metrics: BTreeMap::new(),
            last_update_ms: 0,
        }
    }

    /// Utilization of the most pressured resource, each metric read against
    /// its operating range. `MAX_UTILIZATION` means saturated.
    pub fn utilization(&self) -> Option<f64> {
        self.metrics
            .values()
            .filter_map(|stats| stats.smoothed.map(|v| stats.operating_range.normalize(v)))
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
    }

    pub fn is_stale(&self, now_ms: u64, window: Duration) -> bool {
        now_ms.saturating_sub(self.last_update_ms) > window.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_recomputation_is_reproducible() {
        let raws = [40.0, 80.0, 10.0, 55.0, 55.0];
        let run = |alpha: f64| {
            let mut stats = MetricStats::default();
            raws.iter()
                .map(|r| stats.record(*r, alpha, 3))
                .collect::<Vec<_>>()
        };

        let first = run(0.3);
        assert_eq!(first, run(0.3));
        assert_eq!(first[0], 40.0);
        assert!((first[1] - (0.3 * 80.0 + 0.7 * 40.0)).abs() < 1e-9);
    }

    #[test]
    fn history_is_bounded_and_evicts_oldest() {
        let mut stats = MetricStats::default();
        for raw in 1..=5 {
            stats.record(raw as f64, 0.5, 3);
        }
        assert_eq!(stats.recent, VecDeque::from(vec![3.0, 4.0, 5.0]));
    }

    #[test]
    fn utilization_is_read_against_the_operating_range() {
        let mut summary = WorkerMetricSummary::new("w1");
        summary.metrics.insert(
            MetricType::Cpu,
            MetricStats {
                smoothed: Some(40.0),
                operating_range: OperatingRange::new(50.0),
                ..Default::default()
            },
        );
        summary.metrics.insert(
            MetricType::Memory,
            MetricStats {
                smoothed: Some(60.0),
                ..Default::default()
            },
        );
        assert_eq!(summary.utilization(), Some(80.0));

        assert_eq!(OperatingRange::new(0.0).normalize(30.0), 30.0);
        let stats: MetricStats = serde_json::from_str(r#"{"smoothed":1.0,"recent":[]}"#).unwrap();
        assert_eq!(stats.operating_range, OperatingRange::default());
    }

    #[test]
    fn utilization_is_bottleneck_and_staleness_window() {
        let mut summary = WorkerMetricSummary::new("w1");
        assert_eq!(summary.utilization(), None);

        summary
            .metrics
            .entry(MetricType::Cpu)
            .or_default()
            .record(30.0, 1.0, 1);
        summary
            .metrics
            .entry(MetricType::Memory)
            .or_default()
            .record(70.0, 1.0, 1);
        assert_eq!(summary.utilization(), Some(70.0));

        summary.last_update_ms = 1_000;
        assert!(!summary.is_stale(2_000, Duration::from_secs(1)));
        assert!(summary.is_stale(2_001, Duration::from_secs(1)));
    }
}
