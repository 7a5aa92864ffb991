use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Utilization-aware assignment configuration
///
/// Durations are expressed in milliseconds so the YAML stays flat.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Upper bound on the throughput a single worker may be assigned (KBps), 0 = no cap
    pub max_throughput_per_host_kbps: f64,
    /// Share (0-100) of the ideal load shift applied in a single pass
    pub dampening_percentage: u32,
    /// Minimum utilization gap (percentage points) that triggers a move
    pub rebalance_threshold_percentage: f64,
    /// Allow a move to push the target above the fleet mean when it reduces the gap
    pub allow_throughput_overshoot: bool,
    /// Every Nth pass ignores the threshold, 0 disables forced passes
    pub variance_balancing_frequency: u32,
    /// Smoothing factor of the utilization moving average, in (0, 1]
    pub worker_metrics_ema_alpha: f64,
    /// Raw values retained per worker metric
    pub no_of_persisted_metrics_per_worker_metrics: usize,
    /// Balance lease counts only, ignoring utilization and throughput
    pub disable_worker_metrics: bool,
    /// Silence after which a worker's metrics are considered stale
    pub stale_worker_metrics_threshold_millis: u64,
    /// How often raw metric values are captured in memory
    pub in_memory_worker_metrics_capture_frequency_millis: u64,
    /// How often captured values are folded and persisted
    pub worker_metrics_reporter_freq_millis: u64,
    /// How often the leader runs a rebalancing pass
    pub rebalance_interval_millis: u64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            max_throughput_per_host_kbps: 0.0,
            dampening_percentage: 60,
            rebalance_threshold_percentage: 10.0,
            allow_throughput_overshoot: true,
            variance_balancing_frequency: 3,
            worker_metrics_ema_alpha: 0.5,
            no_of_persisted_metrics_per_worker_metrics: 10,
            disable_worker_metrics: false,
            stale_worker_metrics_threshold_millis: 60_000,
            in_memory_worker_metrics_capture_frequency_millis: 1_000,
            worker_metrics_reporter_freq_millis: 30_000,
            rebalance_interval_millis: 30_000,
        }
    }
}

impl AssignmentConfig {
    /// Rejects out-of-range settings instead of silently clamping them.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_throughput_per_host_kbps >= 0.0,
            "max_throughput_per_host_kbps must not be negative"
        );
        ensure!(
            self.dampening_percentage <= 100,
            "dampening_percentage must be within 0..=100, got {}",
            self.dampening_percentage
        );
        ensure!(
            (0.0..=100.0).contains(&self.rebalance_threshold_percentage),
            "rebalance_threshold_percentage must be within 0..=100, got {}",
            self.rebalance_threshold_percentage
        );
        ensure!(
            self.worker_metrics_ema_alpha > 0.0 && self.worker_metrics_ema_alpha <= 1.0,
            "worker_metrics_ema_alpha must be within (0, 1], got {}",
            self.worker_metrics_ema_alpha
        );
        ensure!(
            self.no_of_persisted_metrics_per_worker_metrics > 0,
            "no_of_persisted_metrics_per_worker_metrics must be positive"
        );
        ensure!(
            self.in_memory_worker_metrics_capture_frequency_millis > 0
                && self.worker_metrics_reporter_freq_millis > 0
                && self.rebalance_interval_millis > 0,
            "metric and rebalance intervals must be positive"
        );
        ensure!(
            self.in_memory_worker_metrics_capture_frequency_millis
                <= self.worker_metrics_reporter_freq_millis,
            "capture frequency must not exceed the reporter frequency"
        );
        Ok(())
    }

    pub fn stale_worker_metrics_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_worker_metrics_threshold_millis)
    }

    pub fn capture_frequency(&self) -> Duration {
        Duration::from_millis(self.in_memory_worker_metrics_capture_frequency_millis)
    }

    pub fn reporter_frequency(&self) -> Duration {
        Duration::from_millis(self.worker_metrics_reporter_freq_millis)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_millis)
    }

    /// Whether pass number `pass` evaluates regardless of the threshold.
    pub fn is_forced_pass(&self, pass: u64) -> bool {
        self.variance_balancing_frequency > 0
            && pass % self.variance_balancing_frequency as u64 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_config_defaults() {
        let config = AssignmentConfig::default();
        assert_eq!(config.dampening_percentage, 60);
        assert_eq!(config.variance_balancing_frequency, 3);
        assert!(config.allow_throughput_overshoot);
        assert!(!config.disable_worker_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "dampening_percentage: 80\ndisable_worker_metrics: true\n";
        let config: AssignmentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.dampening_percentage, 80);
        assert!(config.disable_worker_metrics);
        assert_eq!(config.rebalance_threshold_percentage, 10.0);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let bad = [
            AssignmentConfig {
                dampening_percentage: 101,
                ..Default::default()
            },
            AssignmentConfig {
                worker_metrics_ema_alpha: 0.0,
                ..Default::default()
            },
            AssignmentConfig {
                rebalance_threshold_percentage: -1.0,
                ..Default::default()
            },
            AssignmentConfig {
                no_of_persisted_metrics_per_worker_metrics: 0,
                ..Default::default()
            },
            AssignmentConfig {
                in_memory_worker_metrics_capture_frequency_millis: 60_000,
                worker_metrics_reporter_freq_millis: 1_000,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[test]
    fn test_forced_pass_schedule() {
        let config = AssignmentConfig::default();
        assert!(!config.is_forced_pass(1));
        assert!(!config.is_forced_pass(2));
        assert!(config.is_forced_pass(3));

        let never = AssignmentConfig {
            variance_balancing_frequency: 0,
            ..Default::default()
        };
        assert!(!never.is_forced_pass(3));
    }
}
