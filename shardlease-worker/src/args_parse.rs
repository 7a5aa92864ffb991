use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "shardlease-worker", version, about = "Shard lease worker")]
pub(crate) struct Args {
    /// Path to the worker configuration file
    #[arg(long)]
    pub(crate) config_file: String,

    /// Worker id, overrides the configuration file
    #[arg(long)]
    pub(crate) worker_id: Option<String>,

    /// Prometheus exporter http address, overrides the configuration file
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,

    /// Maximum number of concurrently running shard consumers
    #[arg(long, default_value_t = 256)]
    pub(crate) max_consumers: usize,
}
