mod aggregator;
mod assignment;
mod balancer_metrics;
mod config;
mod metric_sampler;
mod rebalancing;

pub use aggregator::WorkerMetricsAggregator;
pub use assignment::{plan_rebalance, LeaseMove, RebalancePlan, WorkerLoad};
pub use balancer_metrics::{Metric, COUNTERS, GAUGES, HISTOGRAMS};
pub use config::AssignmentConfig;
pub use metric_sampler::{
    default_worker_metrics, StaticMetric, SystemCpuMetric, SystemMemoryMetric, WorkerMetric,
};
pub use rebalancing::{execute_moves, AssignmentEngine, MoveHistory, MoveRecord};
