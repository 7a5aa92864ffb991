mod args_parse;

use std::{fs::read_to_string, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use shardlease_balancer::{default_worker_metrics, WorkerMetricsAggregator};
use shardlease_core::{MemoryLeaseStore, MemoryWorkerMetricsStore, StreamArnCache};
use shardlease_worker::{
    lease_metrics::init_metrics,
    standalone::{ConfiguredStreamTracker, LoggingConsumerFactory, StaticShardDetector},
    LeaseCoordinator, LoadConfiguration, Scheduler, SchedulerComponents, WorkerConfiguration,
    WorkerError,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::args_parse::Args;

const CONSUMER_REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .with_context(|| format!("Failed to read config file {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;
    let mut config: WorkerConfiguration = load_config.try_into()?;

    if let Some(worker_id) = args.worker_id {
        config.worker_id = worker_id;
    }
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        config.prom_exporter = Some(prom_address);
    }

    init_metrics(config.prom_exporter, &config.worker_id)?;

    info!(
        application = %config.application_name,
        worker_id = %config.worker_id,
        lease_table = %config.lease_table_name,
        worker_metrics_table = %config.worker_metrics_table_name,
        streams = config.streams.len(),
        "starting shard lease worker with in-memory stores"
    );
    let lease_store = Arc::new(MemoryLeaseStore::new());
    let metrics_store = Arc::new(MemoryWorkerMetricsStore::new());

    let coordinator = Arc::new(LeaseCoordinator::new(
        config.worker_id.clone(),
        lease_store.clone(),
        metrics_store.clone(),
        config.lease_management.clone(),
        config.assignment.clone(),
    ));
    let worker_metrics = if config.assignment.disable_worker_metrics {
        Vec::new()
    } else {
        default_worker_metrics()
    };
    let aggregator = WorkerMetricsAggregator::new(
        config.worker_id.clone(),
        worker_metrics,
        metrics_store,
        config.assignment.clone(),
    );

    let scheduler = Arc::new(
        Scheduler::new(
            config.scheduler.clone(),
            SchedulerComponents {
                lease_store,
                coordinator,
                stream_tracker: Arc::new(ConfiguredStreamTracker::from_configuration(&config)),
                shard_detector: Arc::new(StaticShardDetector::new(config.shard_counts.clone())),
                consumer_factory: Arc::new(LoggingConsumerFactory::new(
                    args.max_consumers,
                    CONSUMER_REPORT_INTERVAL,
                )),
                arn_cache: StreamArnCache::new(config.region.clone(), config.account_id.clone()),
            },
        )
        .with_metrics_aggregator(aggregator),
    );

    let runner = scheduler.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    let result = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            scheduler.shutdown().await;
            run.await?
        }
    };

    match result {
        Ok(()) | Err(WorkerError::ShuttingDown) => {
            scheduler.shutdown().await;
            info!("worker exited");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "worker failed");
            Err(e.into())
        }
    }
}
