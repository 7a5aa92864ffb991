use super::*;

#[test]
fn test_multi_stream_serialization_round_trip() {
    let id = StreamIdentifier::multi_stream_instance("123456789012:orders:1700000000").unwrap();
    assert_eq!(id.account_id(), Some("123456789012"));
    assert_eq!(id.stream_name(), "orders");
    assert_eq!(id.creation_epoch(), Some(1700000000));
    assert!(id.is_multi_stream());
    assert_eq!(id.serialize(), "123456789012:orders:1700000000");
    assert_eq!(
        StreamIdentifier::multi_stream_instance(&id.serialize()).unwrap(),
        id
    );
}

#[test]
fn test_multi_stream_from_arn() {
    let arn = "arn:aws:kinesis:us-east-1:123456789012:stream/clicks";
    let id = StreamIdentifier::multi_stream_instance(arn).unwrap();
    assert_eq!(id.region(), Some("us-east-1"));
    assert_eq!(id.stream_name(), "clicks");
    assert_eq!(id.creation_epoch(), None);
    assert_eq!(id.arn().as_deref(), Some(arn));
    // without an epoch the ARN is the serialized form
    assert_eq!(id.serialize(), arn);
    assert_eq!(StreamIdentifier::multi_stream_instance(&id.serialize()).unwrap(), id);
}

#[test]
fn test_multi_stream_rejects_malformed_input() {
    for input in [
        "orders",
        "acct:orders:1",
        "123:orders",
        "123::1",
        "123:orders:1:extra",
        "arn:aws:kinesis:us-east-1:123:stream/short-account",
        "arn:aws:sqs:us-east-1:123456789012:stream/x",
    ] {
        assert!(
            StreamIdentifier::multi_stream_instance(input).is_err(),
            "{input} should be rejected"
        );
    }
}

#[test]
fn test_single_stream_instance() {
    let id = StreamIdentifier::single_stream_instance("orders").unwrap();
    assert!(!id.is_multi_stream());
    assert_eq!(id.serialize(), "orders");
    assert_eq!(id.arn(), None);

    assert!(StreamIdentifier::single_stream_instance("").is_err());

    let from_arn =
        StreamIdentifier::single_stream_instance("arn:aws:kinesis:eu-west-1:123456789012:stream/x")
            .unwrap();
    assert_eq!(from_arn.stream_name(), "x");
    assert_eq!(from_arn.region(), Some("eu-west-1"));
}

#[test]
fn test_initial_position_checkpoints() {
    assert_eq!(InitialPosition::default(), InitialPosition::Latest);
    assert_eq!(
        InitialPosition::TrimHorizon.initial_checkpoint(),
        Checkpoint::TrimHorizon
    );
    assert_eq!(
        InitialPosition::AtTimestamp(42).initial_checkpoint(),
        Checkpoint::AtTimestamp(42)
    );
}
