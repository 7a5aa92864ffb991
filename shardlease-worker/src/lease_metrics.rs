use metrics_exporter_prometheus::PrometheusBuilder;
use shardlease_balancer as balancer;
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 6] = [
    LEASES_TAKEN_TOTAL,
    LEASES_LOST_TOTAL,
    LEASE_RENEWAL_FAILURES_TOTAL,
    LEASES_CREATED_TOTAL,
    LEASES_DELETED_TOTAL,
    REJECTED_TASKS_TOTAL,
];
pub(crate) const GAUGES: [Metric; 4] = [
    LEASES_HELD,
    ACTIVE_SHARD_CONSUMERS,
    LEADER_STATE,
    TRACKED_STREAMS,
];
pub(crate) const HISTOGRAMS: [Metric; 1] = [STREAM_SYNC_DURATION_SECONDS];

// LEASE Metrics --------------------------

pub(crate) const LEASES_HELD: Metric = Metric {
    name: "shardlease_leases_held",
    description: "Number of leases currently held by this worker",
};

pub(crate) const LEASES_TAKEN_TOTAL: Metric = Metric {
    name: "shardlease_leases_taken_total",
    description: "Total number of leases acquired by this worker",
};

pub(crate) const LEASES_LOST_TOTAL: Metric = Metric {
    name: "shardlease_leases_lost_total",
    description: "Total number of held leases lost to another worker",
};

pub(crate) const LEASE_RENEWAL_FAILURES_TOTAL: Metric = Metric {
    name: "shardlease_lease_renewal_failures_total",
    description: "Total number of renewals that failed after exhausting retries",
};

pub(crate) const LEADER_STATE: Metric = Metric {
    name: "shardlease_leader_state",
    description: "Leader state of this worker (0=follower,1=leader)",
};

// STREAM Metrics --------------------------

pub(crate) const LEASES_CREATED_TOTAL: Metric = Metric {
    name: "shardlease_leases_created_total",
    description: "Total number of leases created by shard discovery",
};

pub(crate) const LEASES_DELETED_TOTAL: Metric = Metric {
    name: "shardlease_leases_deleted_total",
    description: "Total number of leases deleted for finished shards or untracked streams",
};

pub(crate) const TRACKED_STREAMS: Metric = Metric {
    name: "shardlease_tracked_streams",
    description: "Number of streams currently tracked",
};

pub(crate) const STREAM_SYNC_DURATION_SECONDS: Metric = Metric {
    name: "shardlease_stream_sync_duration_seconds",
    description: "Duration of a multi-stream synchronization pass",
};

// SCHEDULER Metrics --------------------------

pub(crate) const ACTIVE_SHARD_CONSUMERS: Metric = Metric {
    name: "shardlease_active_shard_consumers",
    description: "Number of shard consumers owned by the scheduler",
};

pub(crate) const REJECTED_TASKS_TOTAL: Metric = Metric {
    name: "shardlease_rejected_tasks_total",
    description: "Total number of tasks rejected by the execution layer",
};

pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>, worker_id: &str) -> anyhow::Result<()> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("worker", worker_id.to_owned())
            .install()?;
    }

    for metric in COUNTERS {
        register_counter(metric.name, metric.description)
    }
    for metric in GAUGES {
        register_gauge(metric.name, metric.description)
    }
    for metric in HISTOGRAMS {
        register_histogram(metric.name, metric.description)
    }

    for metric in balancer::COUNTERS {
        register_counter(metric.name, metric.description)
    }
    for metric in balancer::GAUGES {
        register_gauge(metric.name, metric.description)
    }
    for metric in balancer::HISTOGRAMS {
        register_histogram(metric.name, metric.description)
    }
    Ok(())
}

fn register_counter(name: &'static str, description: &'static str) {
    metrics::describe_counter!(name, description);
    let _counter = metrics::counter!(name);
}

fn register_gauge(name: &'static str, description: &'static str) {
    metrics::describe_gauge!(name, description);
    let _gauge = metrics::gauge!(name);
}

fn register_histogram(name: &'static str, description: &'static str) {
    metrics::describe_histogram!(name, description);
    let _histogram = metrics::histogram!(name);
}
