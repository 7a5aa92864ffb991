use super::*;

const MINIMAL: &str = r#"
application_name: "orders-processor"
region: "us-east-1"
account_id: "123456789012"
streams:
  tracked:
    - identifier: "123456789012:orders:1700000000"
"#;

fn load(yaml: &str) -> Result<WorkerConfiguration> {
    let load_config: LoadConfiguration = serde_yaml::from_str(yaml)?;
    load_config.try_into()
}

/// **Test:** Sample configuration shipped with the worker
///
/// **Expectation:** Parses and validates, with streams, strategy and exporter resolved.
#[test]
fn test_sample_configuration_loads() {
    let config = load(include_str!("../config/worker.yml")).unwrap();
    assert_eq!(config.application_name, "orders-processor");
    assert_eq!(config.lease_table_name, "orders-processor");
    assert_eq!(
        config.worker_metrics_table_name,
        "orders-processor-WorkerMetricStats"
    );
    assert!(config.multi_stream);
    assert_eq!(config.streams.len(), 2);
    assert_eq!(config.streams[0].initial_position, InitialPosition::TrimHorizon);
    assert_eq!(
        config.streams[1].stream_arn.as_deref(),
        Some("arn:aws:kinesis:us-east-1:123456789012:stream/payments")
    );
    assert_eq!(config.shard_counts[&config.streams[0].stream_identifier], 4);
    assert_eq!(
        config.deletion_strategy,
        DeletionStrategy::AutoDetectDeferred {
            wait_period: Duration::from_secs(3600)
        }
    );
    assert_eq!(config.prom_exporter, Some("0.0.0.0:9040".parse().unwrap()));
}

/// **Test:** Configuration with only the required fields
///
/// **Expectation:** Defaults apply and a random worker id is generated.
#[test]
fn test_minimal_configuration_uses_defaults() {
    let config = load(MINIMAL).unwrap();
    assert!(!config.worker_id.is_empty());
    assert_eq!(config.lease_management, LeaseManagementConfig::default());
    assert_eq!(config.scheduler, SchedulerConfig::default());
    assert_eq!(config.assignment, AssignmentConfig::default());
    assert_eq!(config.deletion_strategy, DeletionStrategy::None);
    assert_eq!(config.orphaned_stream_initial_position, InitialPosition::Latest);
    assert_eq!(config.shard_counts.values().copied().collect::<Vec<_>>(), vec![1]);
    assert!(config.prom_exporter.is_none());
}

/// **Test:** Provided-list strategy naming streams to clean up
///
/// **Expectation:** The names are parsed into stream identifiers.
#[test]
fn test_provided_list_strategy_is_parsed() {
    let yaml = format!(
        "{}{}",
        MINIMAL,
        r#"
  deletion_strategy:
    strategy: provided_list
    streams: ["123456789012:legacy:1600000000"]
    wait_period_millis: 0
"#
    );
    let config = load(&yaml).unwrap();
    match config.deletion_strategy {
        DeletionStrategy::ProvidedList {
            stream_identifiers: Some(ids),
            wait_period,
        } => {
            assert_eq!(ids.len(), 1);
            assert_eq!(ids[0].stream_name(), "legacy");
            assert_eq!(wait_period, Duration::ZERO);
        }
        other => panic!("unexpected strategy {:?}", other),
    }
}

/// **Test:** Invalid settings
///
/// **Expectation:** Each one is rejected when the configuration is loaded, never defaulted.
#[test]
fn test_invalid_configurations_fail_fast() {
    let unknown_strategy = format!(
        "{}{}",
        MINIMAL,
        "  deletion_strategy:\n    strategy: delete_everything\n"
    );
    let bad_identifier = MINIMAL.replace("123456789012:orders:1700000000", "orders");
    let inverted_wait = format!(
        "{}{}",
        MINIMAL,
        "scheduler:\n  min_lease_table_wait_millis: 5000\n  max_lease_table_wait_millis: 1000\n"
    );
    let bad_dampening = format!(
        "{}{}",
        MINIMAL,
        "assignment:\n  dampening_percentage: 150\n"
    );
    let single_stream_with_two = r#"
application_name: "orders-processor"
region: "us-east-1"
account_id: "123456789012"
streams:
  multi_stream: false
  tracked:
    - identifier: "orders"
    - identifier: "payments"
"#;

    for yaml in [
        unknown_strategy.as_str(),
        bad_identifier.as_str(),
        inverted_wait.as_str(),
        bad_dampening.as_str(),
        single_stream_with_two,
    ] {
        assert!(load(yaml).is_err(), "accepted:\n{}", yaml);
    }
}
