use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shardlease_balancer::AssignmentConfig;
use shardlease_core::{InitialPosition, StreamConfig, StreamIdentifier};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{LeaseManagementConfig, SchedulerConfig};
use crate::stream_sync::DeletionStrategy;

const DEFAULT_SHARD_COUNT: usize = 1;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Name of the consuming application, shared by all of its workers
    pub application_name: String,
    /// Identity of this worker, a random one is generated when missing
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Region used to resolve stream ARNs
    pub region: String,
    /// Account owning streams that do not name one
    pub account_id: String,
    /// Lease table name, defaults to the application name
    #[serde(default)]
    pub lease_table_name: Option<String>,
    /// Worker metrics table name, defaults to `<application>-WorkerMetricStats`
    #[serde(default)]
    pub worker_metrics_table_name: Option<String>,
    #[serde(default)]
    pub lease_management: LeaseManagementConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    pub streams: StreamsConfig,
    /// Prometheus exporter listener (optional)
    #[serde(default)]
    pub prometheus: Option<PrometheusConfig>,
}

/// Streams consumed by the application
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_multi_stream")]
    pub multi_stream: bool,
    pub tracked: Vec<TrackedStreamConfig>,
    /// Initial position of streams found only in the lease table
    #[serde(default)]
    pub orphaned_stream_initial_position: InitialPosition,
    #[serde(default)]
    pub deletion_strategy: DeletionStrategyConfig,
}

fn default_multi_stream() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrackedStreamConfig {
    /// `account:stream:epoch` or a stream ARN in multi-stream mode, the
    /// stream name or ARN otherwise
    pub identifier: String,
    #[serde(default)]
    pub initial_position: InitialPosition,
    /// Shards reported by the standalone shard detector
    #[serde(default)]
    pub shard_count: Option<usize>,
}

/// Handling of streams that stop being tracked, tagged by `strategy`
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DeletionStrategyConfig {
    #[default]
    None,
    AutoDetectDeferred {
        wait_period_millis: u64,
    },
    ProvidedList {
        #[serde(default)]
        streams: Option<Vec<String>>,
        wait_period_millis: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub host: String,
    pub port: u16,
}

/// Validated worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfiguration {
    pub application_name: String,
    pub worker_id: String,
    pub region: String,
    pub account_id: String,
    pub lease_table_name: String,
    pub worker_metrics_table_name: String,
    pub lease_management: LeaseManagementConfig,
    pub scheduler: SchedulerConfig,
    pub assignment: AssignmentConfig,
    pub multi_stream: bool,
    pub streams: Vec<StreamConfig>,
    pub shard_counts: HashMap<StreamIdentifier, usize>,
    pub orphaned_stream_initial_position: InitialPosition,
    pub deletion_strategy: DeletionStrategy,
    pub prom_exporter: Option<SocketAddr>,
}

fn parse_stream(identifier: &str, multi_stream: bool) -> Result<StreamIdentifier> {
    let parsed = if multi_stream {
        StreamIdentifier::multi_stream_instance(identifier)
    } else {
        StreamIdentifier::single_stream_instance(identifier)
    };
    parsed.with_context(|| format!("Invalid stream identifier: {}", identifier))
}

fn validate_lease_management(config: &LeaseManagementConfig) -> Result<()> {
    ensure!(
        config.failover_time_millis > 0,
        "failover_time_millis must be positive"
    );
    ensure!(
        config.max_leases_to_steal_at_once > 0,
        "max_leases_to_steal_at_once must be at least 1"
    );
    if let Some(max) = config.max_leases_for_worker {
        ensure!(max > 0, "max_leases_for_worker must be at least 1 when set");
    }
    ensure!(
        config.store_retry.max_attempts > 0,
        "store_retry.max_attempts must be at least 1"
    );
    Ok(())
}

fn validate_scheduler(config: &SchedulerConfig) -> Result<()> {
    ensure!(
        config.max_initialization_attempts > 0,
        "max_initialization_attempts must be at least 1"
    );
    ensure!(
        config.min_lease_table_wait_millis <= config.max_lease_table_wait_millis,
        "min_lease_table_wait_millis ({}) exceeds max_lease_table_wait_millis ({})",
        config.min_lease_table_wait_millis,
        config.max_lease_table_wait_millis
    );
    ensure!(
        config.lease_table_check_frequency_millis > 0,
        "lease_table_check_frequency_millis must be positive"
    );
    Ok(())
}

/// Implementing the TryFrom trait to transform LoadConfiguration into WorkerConfiguration
impl TryFrom<LoadConfiguration> for WorkerConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        ensure!(
            !config.application_name.is_empty(),
            "application_name must not be empty"
        );
        validate_lease_management(&config.lease_management)?;
        validate_scheduler(&config.scheduler)?;
        config.assignment.validate()?;

        let multi_stream = config.streams.multi_stream;
        if !multi_stream && config.streams.tracked.len() != 1 {
            bail!(
                "single-stream mode needs exactly one tracked stream, found {}",
                config.streams.tracked.len()
            );
        }

        let mut streams = Vec::with_capacity(config.streams.tracked.len());
        let mut shard_counts = HashMap::new();
        for tracked in &config.streams.tracked {
            let stream = parse_stream(&tracked.identifier, multi_stream)?;
            let shard_count = tracked.shard_count.unwrap_or(DEFAULT_SHARD_COUNT);
            ensure!(shard_count > 0, "stream {} needs at least one shard", stream);
            if shard_counts.insert(stream.clone(), shard_count).is_some() {
                bail!("stream {} is tracked twice", stream);
            }
            streams.push(StreamConfig::new(stream, tracked.initial_position));
        }

        let deletion_strategy = match config.streams.deletion_strategy {
            DeletionStrategyConfig::None => DeletionStrategy::None,
            DeletionStrategyConfig::AutoDetectDeferred { wait_period_millis } => {
                DeletionStrategy::AutoDetectDeferred {
                    wait_period: Duration::from_millis(wait_period_millis),
                }
            }
            DeletionStrategyConfig::ProvidedList {
                streams: provided,
                wait_period_millis,
            } => DeletionStrategy::ProvidedList {
                stream_identifiers: provided
                    .map(|ids| {
                        ids.iter()
                            .map(|id| parse_stream(id, multi_stream))
                            .collect::<Result<Vec<_>>>()
                    })
                    .transpose()?,
                wait_period: Duration::from_millis(wait_period_millis),
            },
        };

        let prom_exporter: Option<SocketAddr> = match &config.prometheus {
            Some(prometheus) => Some(
                format!("{}:{}", prometheus.host, prometheus.port)
                    .parse()
                    .context("Failed to create prom_exporter")?,
            ),
            None => None,
        };

        let worker_id = config
            .worker_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let lease_table_name = config
            .lease_table_name
            .unwrap_or_else(|| config.application_name.clone());
        let worker_metrics_table_name = config
            .worker_metrics_table_name
            .unwrap_or_else(|| format!("{}-WorkerMetricStats", config.application_name));

        Ok(WorkerConfiguration {
            application_name: config.application_name,
            worker_id,
            region: config.region,
            account_id: config.account_id,
            lease_table_name,
            worker_metrics_table_name,
            lease_management: config.lease_management,
            scheduler: config.scheduler,
            assignment: config.assignment,
            multi_stream,
            streams,
            shard_counts,
            orphaned_stream_initial_position: config.streams.orphaned_stream_initial_position,
            deletion_strategy,
            prom_exporter,
        })
    }
}

#[cfg(test)]
#[path = "service_configuration_test.rs"]
mod service_configuration_test;
