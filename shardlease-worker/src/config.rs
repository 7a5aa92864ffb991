use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Lease ownership timings and limits
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LeaseManagementConfig {
    /// A lease whose counter does not move for this long is considered expired
    pub failover_time_millis: u64,
    /// Safety margin subtracted from the renewal period
    pub epsilon_millis: u64,
    /// Upper bound on expired leases taken in a single taker cycle
    pub max_leases_to_steal_at_once: usize,
    /// Upper bound on leases held by this worker, unset = unbounded
    pub max_leases_for_worker: Option<usize>,
    /// How often the leader re-syncs shards of tracked streams
    pub shard_sync_interval_millis: u64,
    /// Retry of lease store calls within one cycle
    pub store_retry: StoreRetryConfig,
}

impl Default for LeaseManagementConfig {
    fn default() -> Self {
        Self {
            failover_time_millis: 10_000,
            epsilon_millis: 25,
            max_leases_to_steal_at_once: 1,
            max_leases_for_worker: None,
            shard_sync_interval_millis: 60_000,
            store_retry: StoreRetryConfig::default(),
        }
    }
}

impl LeaseManagementConfig {
    pub fn failover_time(&self) -> Duration {
        Duration::from_millis(self.failover_time_millis)
    }

    /// A third of the failover time, minus epsilon.
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(
            (self.failover_time_millis / 3)
                .saturating_sub(self.epsilon_millis)
                .max(1),
        )
    }

    pub fn taking_interval(&self) -> Duration {
        Duration::from_millis((self.failover_time_millis + self.epsilon_millis) * 2)
    }

    pub fn shard_sync_interval(&self) -> Duration {
        Duration::from_millis(self.shard_sync_interval_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_retry.max_attempts,
            self.store_retry.base_backoff_ms,
            self.store_retry.max_backoff_ms,
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreRetryConfig {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        }
    }
}

/// Scheduler lifecycle and loop cadence
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_initialization_attempts: usize,
    pub initialization_backoff_millis: u64,
    /// Skip the initial shard sync when the lease table already has leases
    pub skip_shard_sync_at_worker_initialization_if_leases_exist: bool,
    /// Lower bound of the random wait applied while the lease table is empty
    pub min_lease_table_wait_millis: u64,
    /// Upper bound of the random wait applied while the lease table is empty
    pub max_lease_table_wait_millis: u64,
    /// How often emptiness is re-checked during that wait
    pub lease_table_check_frequency_millis: u64,
    pub shard_consumer_dispatch_poll_interval_millis: u64,
    /// How often the tracked stream set is reconciled
    pub stream_sync_interval_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_initialization_attempts: 20,
            initialization_backoff_millis: 1_000,
            skip_shard_sync_at_worker_initialization_if_leases_exist: false,
            min_lease_table_wait_millis: 1_000,
            max_lease_table_wait_millis: 30_000,
            lease_table_check_frequency_millis: 3_000,
            shard_consumer_dispatch_poll_interval_millis: 1_000,
            stream_sync_interval_millis: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn initialization_backoff(&self) -> Duration {
        Duration::from_millis(self.initialization_backoff_millis)
    }

    pub fn lease_table_check_frequency(&self) -> Duration {
        Duration::from_millis(self.lease_table_check_frequency_millis)
    }

    pub fn dispatch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shard_consumer_dispatch_poll_interval_millis)
    }

    pub fn stream_sync_interval(&self) -> Duration {
        Duration::from_millis(self.stream_sync_interval_millis)
    }
}
