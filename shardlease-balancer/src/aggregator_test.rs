use super::*;
use crate::metric_sampler::StaticMetric;
use shardlease_core::MemoryWorkerMetricsStore;
use std::time::Duration;
use tracing_test::traced_test;

fn aggregator(
    metrics: Vec<Arc<dyn WorkerMetric>>,
    store: Arc<MemoryWorkerMetricsStore>,
) -> WorkerMetricsAggregator {
    let config = AssignmentConfig {
        worker_metrics_ema_alpha: 0.5,
        no_of_persisted_metrics_per_worker_metrics: 2,
        in_memory_worker_metrics_capture_frequency_millis: 10,
        worker_metrics_reporter_freq_millis: 50,
        ..Default::default()
    };
    WorkerMetricsAggregator::new("worker-1", metrics, store, config)
}

/// **Test:** Buffered samples are averaged then smoothed
///
/// **Expectation:** Two captures of 20 and 40 average to 30 for the first
/// report (seeding the average); a later report at 70 smooths to 50.
#[tokio::test]
async fn test_report_averages_and_smooths() {
    let cpu = StaticMetric::new(MetricType::Cpu, 20.0);
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(vec![Arc::new(cpu.clone())], store.clone());

    agg.capture_once().await;
    cpu.set(Some(40.0));
    agg.capture_once().await;
    let first = agg.report_once().await.unwrap().unwrap();
    assert_eq!(first.utilization(), Some(30.0));

    cpu.set(Some(70.0));
    agg.capture_once().await;
    let second = agg.report_once().await.unwrap().unwrap();
    assert_eq!(second.utilization(), Some(50.0));
    assert!(second.last_update_ms > 0);

    let persisted = store.list_worker_metrics().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0], second);
}

/// **Test:** Raw history stays bounded
#[tokio::test]
async fn test_history_bounded_by_persisted_metrics_setting() {
    let cpu = StaticMetric::new(MetricType::Cpu, 10.0);
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(vec![Arc::new(cpu.clone())], store);

    for value in [10.0, 20.0, 30.0] {
        cpu.set(Some(value));
        agg.capture_once().await;
        agg.report_once().await.unwrap();
    }
    let summary = agg.current_summary().await;
    let recent: Vec<f64> = summary.metrics[&MetricType::Cpu].recent.iter().copied().collect();
    assert_eq!(recent, vec![20.0, 30.0]);
}

/// **Test:** Capture failures are logged and skipped
///
/// **Expectation:** With no successful capture nothing is persisted.
#[traced_test]
#[tokio::test]
async fn test_failed_capture_skips_report() {
    let cpu = StaticMetric::new(MetricType::Cpu, 10.0);
    cpu.set(None);
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(vec![Arc::new(cpu)], store.clone());

    agg.capture_once().await;
    assert!(agg.report_once().await.unwrap().is_none());
    assert!(store.list_worker_metrics().await.unwrap().is_empty());
    assert!(logs_contain("failed to capture worker metric"));
}

/// **Test:** Background loops persist and stop on shutdown
#[tokio::test]
async fn test_background_loops_report_until_shutdown() {
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(
        vec![Arc::new(StaticMetric::new(MetricType::Memory, 42.0))],
        store.clone(),
    );
    let (tx, rx) = watch::channel(false);
    let handles = agg.start(rx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let persisted = store.list_worker_metrics().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].utilization(), Some(42.0));
}

/// **Test:** Heartbeat without metrics
///
/// **Expectation:** An aggregator with no metric sources still persists a
/// summary so that the worker stays visible to the fleet.
#[tokio::test]
async fn test_heartbeat_without_metric_sources() {
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(Vec::new(), store.clone());

    let summary = agg.report_once().await.unwrap().unwrap();
    assert!(summary.metrics.is_empty());
    assert_eq!(summary.utilization(), None);
    assert!(summary.last_update_ms > 0);
    assert_eq!(store.list_worker_metrics().await.unwrap().len(), 1);
}

/// **Test:** A metric with a narrowed operating range
///
/// **Expectation:** The range is persisted with the metric and the worker's
/// utilization is read against it.
#[tokio::test]
async fn test_operating_range_is_persisted_and_applied() {
    let cpu = StaticMetric::new(MetricType::Cpu, 40.0).with_operating_range(50.0);
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(vec![Arc::new(cpu)], store.clone());

    agg.capture_once().await;
    let summary = agg.report_once().await.unwrap().unwrap();
    assert_eq!(summary.metrics[&MetricType::Cpu].operating_range.max_utilization, 50.0);
    assert_eq!(summary.utilization(), Some(80.0));
    assert_eq!(store.list_worker_metrics().await.unwrap()[0], summary);
}

/// **Test:** Reporting falls behind capture
///
/// **Expectation:** Only the most recent buffered samples are kept, the
/// oldest being evicted first.
#[tokio::test]
async fn test_sample_buffer_evicts_oldest() {
    let cpu = StaticMetric::new(MetricType::Cpu, 100.0);
    let store = Arc::new(MemoryWorkerMetricsStore::new());
    let agg = aggregator(vec![Arc::new(cpu.clone())], store);

    agg.capture_once().await;
    cpu.set(Some(10.0));
    for _ in 0..MAX_BUFFERED_SAMPLES {
        agg.capture_once().await;
    }
    let summary = agg.report_once().await.unwrap().unwrap();
    assert_eq!(summary.utilization(), Some(10.0));
}
