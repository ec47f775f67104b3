//! Topic description behavior: validation, derivation and idempotent
//! declaration.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can unwrap/expect/panic

use freshet_core::TopicError;
use freshet_runtime::{App, AppConfig};
use freshet_testing::{MockConsumer, MockProducer, StaticAssignor};
use std::sync::Arc;

fn worker() -> (App, Arc<MockProducer>) {
    let consumer = Arc::new(MockConsumer::new());
    let producer = Arc::new(MockProducer::new());
    let assignor = Arc::new(StaticAssignor::default());
    let app = App::new(AppConfig::new("topic-tests"), consumer, producer.clone(), assignor);
    (app, producer)
}

#[tokio::test]
async fn zero_partitions_is_rejected() {
    let (app, _) = worker();
    let result = app.topic().topic("orders").partitions(0).build();
    assert_eq!(result.err(), Some(TopicError::ZeroPartitions));
}

#[tokio::test]
async fn names_and_pattern_together_are_rejected() {
    let (app, _) = worker();
    let result = app.topic().topic("orders").pattern("^orders-.*$").build();
    assert_eq!(result.err(), Some(TopicError::TopicsAndPattern));
}

#[tokio::test]
async fn derive_twice_with_no_overrides_preserves_configuration() {
    let (app, _) = worker();
    let original = app
        .topic()
        .topic("t1")
        .partitions(8)
        .replicas(3)
        .compacting(true)
        .config_entry("retention.ms", "60000")
        .build()
        .unwrap();

    let twice = original.derive().build().unwrap().derive().build().unwrap();
    assert_eq!(twice.topics(), original.topics());
    assert_eq!(twice.partitions(), original.partitions());
    assert_eq!(twice.replicas(), original.replicas());
    assert_eq!(twice.compacting(), original.compacting());
    assert_eq!(twice.config(), original.config());
}

#[tokio::test]
async fn derive_with_prefix_and_suffix_rewrites_names() {
    let (app, _) = worker();
    let original = app.topic().topic("t1").partitions(8).build().unwrap();
    let derived = original.derive().prefix("p-").suffix("-s").build().unwrap();
    assert_eq!(derived.topics(), ["p-t1-s"]);
    assert_eq!(derived.partitions(), 8);
}

#[tokio::test]
async fn derive_to_a_pattern_topic_is_valid() {
    let (app, _) = worker();
    let original = app.topic().topic("t1").partitions(8).build().unwrap();
    let derived = original
        .derive()
        .topics(Vec::<String>::new())
        .pattern("^x$")
        .build()
        .unwrap();
    assert!(derived.pattern().is_some());
    assert!(derived.topics().is_empty());
    assert!(derived.matches("x"));
    assert_eq!(derived.partitions(), 8);
}

#[tokio::test]
async fn affixes_on_pattern_topics_are_rejected() {
    let (app, _) = worker();
    let pattern = app.topic().pattern("^logs-.*$").build().unwrap();
    let result = pattern.derive().suffix("-copy").build();
    assert_eq!(result.err(), Some(TopicError::PatternAffix));
}

#[tokio::test]
async fn maybe_declare_creates_each_topic_exactly_once() {
    let (app, producer) = worker();
    let topic = app
        .topic()
        .topics(["a", "b"])
        .partitions(4)
        .replicas(1)
        .build()
        .unwrap();

    topic.maybe_declare().await.unwrap();
    topic.maybe_declare().await.unwrap();
    topic.maybe_declare().await.unwrap();

    assert_eq!(
        producer.created_topics(),
        vec![("a".to_string(), 4, 1), ("b".to_string(), 4, 1)]
    );
    // The producer was lazily started exactly once.
    assert_eq!(producer.start_count(), 1);
}

#[tokio::test]
async fn publish_offsets_come_from_the_broker_ack() {
    let (app, producer) = worker();
    let first = app
        .send("acked", None, Some(b"1".to_vec()), None, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = app
        .send("acked", None, Some(b"2".to_vec()), None, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!((first.offset, second.offset), (0, 1));
    assert_eq!(producer.sends_to("acked").len(), 2);
}
