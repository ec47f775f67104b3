//! Fan-out plane behavior: grace-period subscription, reference counting
//! and dynamic resubscription.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can unwrap/expect/panic

use freshet_core::Message;
use freshet_runtime::{App, AppConfig};
use freshet_testing::{MockConsumer, MockProducer, StaticAssignor, eventually, within};
use std::sync::Arc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

fn worker(grace: Duration) -> (App, Arc<MockConsumer>) {
    let consumer = Arc::new(MockConsumer::new());
    let producer = Arc::new(MockProducer::new());
    let assignor = Arc::new(StaticAssignor::default());
    let config = AppConfig {
        subscriber_grace: grace,
        ..AppConfig::new("fanout-tests")
    };
    let app = App::new(config, consumer.clone(), producer, assignor);
    (app, consumer)
}

fn record(topic: &str, offset: i64) -> Message {
    Message::new(topic, 0, offset, None, Some(b"k".to_vec()), Some(b"v".to_vec()))
}

#[tokio::test]
async fn one_subscribe_covers_everything_registered_during_grace() {
    let (app, consumer) = worker(Duration::from_millis(300));
    for name in ["alpha", "beta", "gamma"] {
        let topic = app.topic().topic(name).build().unwrap();
        let _channel = app.topics().acquire(&topic);
    }
    app.start();
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;

    let subscribes = consumer.subscribe_calls();
    assert_eq!(subscribes.len(), 1, "no earlier partial subscribe");
    assert_eq!(subscribes[0], ["alpha", "beta", "gamma"]);
    app.stop().await;
}

#[tokio::test]
async fn fanout_increments_refcount_for_all_subscribers_before_delivery() {
    let (app, consumer) = worker(Duration::from_millis(50));
    let topic = app.topic().topic("x").build().unwrap();
    let channel_one = app.topics().acquire(&topic);
    let channel_two = app.topics().acquire(&topic);
    app.start();
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;

    let injected = consumer.inject(record("x", 1)).await;

    let first = within(DEADLINE, channel_one.next_message()).await.unwrap();
    // Both references were taken before any channel saw the message.
    assert_eq!(first.refcount(), 2);
    let second = within(DEADLINE, channel_two.next_message()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &injected));

    assert_eq!(first.decref(), 1);
    assert_eq!(second.decref(), 0);
    assert_eq!(injected.refcount(), 0);
    app.stop().await;
}

#[tokio::test]
async fn each_channel_sees_partition_records_in_broker_order() {
    let (app, consumer) = worker(Duration::from_millis(50));
    let topic = app.topic().topic("ordered").build().unwrap();
    let channel = app.topics().acquire(&topic);
    app.start();
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;

    for offset in 0..10 {
        consumer.inject(record("ordered", offset)).await;
    }
    for expected in 0..10 {
        let message = within(DEADLINE, channel.next_message()).await.unwrap();
        assert_eq!(message.offset, expected);
        message.decref();
    }
    app.stop().await;
}

#[tokio::test]
async fn add_then_discard_restores_the_subscriber_set() {
    let (app, _consumer) = worker(Duration::from_millis(50));
    let topic = app.topic().topic("transient").build().unwrap();

    let before_len = app.topics().len();
    let before_changes = app.topics().subscription_changes();

    let channel = app.topics().acquire(&topic);
    app.topics().discard(&channel);

    assert_eq!(app.topics().len(), before_len);
    assert_eq!(app.topics().subscription_changes(), before_changes + 2);
    // Discarding again is a no-op.
    app.topics().discard(&channel);
    assert_eq!(app.topics().subscription_changes(), before_changes + 2);
}

#[tokio::test]
async fn acquiring_after_start_triggers_resubscription() {
    let (app, consumer) = worker(Duration::from_millis(50));
    let first = app.topic().topic("first").build().unwrap();
    let _first_channel = app.topics().acquire(&first);
    app.start();
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;
    assert_eq!(consumer.subscribe_calls().len(), 1);

    let second = app.topic().topic("second").build().unwrap();
    let _second_channel = app.topics().acquire(&second);
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;

    let subscribes = consumer.subscribe_calls();
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[1], ["first", "second"]);
    app.stop().await;
}

#[tokio::test]
async fn pattern_channels_receive_matching_topics() {
    let (app, consumer) = worker(Duration::from_millis(50));
    let logs = app.topic().pattern("^logs-.*$").build().unwrap();
    let channel = app.topics().acquire(&logs);
    app.start();
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;
    assert_eq!(consumer.subscribe_calls()[0], ["^logs-.*$"]);

    consumer.inject(record("logs-eu", 7)).await;
    let message = within(DEADLINE, channel.next_message()).await.unwrap();
    assert_eq!(message.topic, "logs-eu");
    message.decref();
    app.stop().await;
}

#[tokio::test]
async fn records_without_subscribers_are_released() {
    let (app, consumer) = worker(Duration::from_millis(50));
    let topic = app.topic().topic("watched").build().unwrap();
    let _channel = app.topics().acquire(&topic);
    app.start();
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;

    let orphan = consumer.inject(record("unwatched", 1)).await;
    // Delivered to nobody: the count never moves.
    assert!(
        eventually(Duration::from_millis(500), || orphan.refcount() == 0).await,
        "orphan record must stay unreferenced"
    );
    app.stop().await;
}
