//! Attachment buffer behavior: commit-gated publishing, idempotence, and
//! drop-on-revoke.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can unwrap/expect/panic

use freshet_core::{Message, PublishError, Tp};
use freshet_runtime::{App, AppConfig, SendTarget, scope_event};
use freshet_testing::{MockConsumer, MockProducer, StaticAssignor, within};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

fn worker() -> (App, Arc<MockConsumer>, Arc<MockProducer>) {
    let consumer = Arc::new(MockConsumer::new());
    let producer = Arc::new(MockProducer::new());
    let assignor = Arc::new(StaticAssignor::default());
    let config = AppConfig {
        subscriber_grace: Duration::from_millis(50),
        ..AppConfig::new("attach-tests")
    };
    let app = App::new(config, consumer.clone(), producer.clone(), assignor);
    (app, consumer, producer)
}

fn source(topic: &str, partition: i32, offset: i64) -> Message {
    Message::new(topic, partition, offset, None, None, Some(b"in".to_vec()))
}

#[tokio::test]
async fn commit_publishes_only_the_committed_offset() {
    let (app, _consumer, producer) = worker();
    let tp = Tp::new("a", 0);
    let out = Arc::new(app.topic().topic("out").build().unwrap());

    let src5 = source("a", 0, 5);
    let src7 = source("a", 0, 7);
    let handle_a = app
        .attachments()
        .put(&src5, SendTarget::from(&out), None, Some(b"fm-a".to_vec()), None, None)
        .await;
    let handle_b = app
        .attachments()
        .put(&src7, SendTarget::from(&out), None, Some(b"fm-b".to_vec()), None, None)
        .await;

    // Nothing is visible before the source offsets commit.
    assert!(producer.sends().is_empty());

    app.attachments().commit(&tp, 5).await;
    let sends = producer.sends_to("out");
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].value.as_deref(), Some(&b"fm-a"[..]));
    let meta = within(DEADLINE, handle_a.wait()).await.unwrap();
    assert_eq!(meta.topic, "out");

    // The committed bucket is gone, the other offset still pending.
    assert!(!app.attachments().has_pending(&tp, 5).await);
    assert!(app.attachments().has_pending(&tp, 7).await);

    app.attachments().commit(&tp, 7).await;
    assert_eq!(producer.sends_to("out").len(), 2);
    within(DEADLINE, handle_b.wait()).await.unwrap();
}

#[tokio::test]
async fn committing_the_same_offset_twice_publishes_once() {
    let (app, _consumer, producer) = worker();
    let tp = Tp::new("a", 0);
    let out = Arc::new(app.topic().topic("out").build().unwrap());
    let src = source("a", 0, 9);
    let _handle = app
        .attachments()
        .put(&src, SendTarget::from(&out), None, Some(b"once".to_vec()), None, None)
        .await;

    app.attachments().commit(&tp, 9).await;
    app.attachments().commit(&tp, 9).await;
    assert_eq!(producer.sends_to("out").len(), 1);
}

#[tokio::test]
async fn multiple_attachments_on_one_offset_all_publish() {
    let (app, _consumer, producer) = worker();
    let tp = Tp::new("a", 0);
    let out = Arc::new(app.topic().topic("out").build().unwrap());
    let src = source("a", 0, 3);
    for value in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        let _handle = app
            .attachments()
            .put(&src, SendTarget::from(&out), None, Some(value), None, None)
            .await;
    }

    app.attachments().commit(&tp, 3).await;
    assert_eq!(producer.sends_to("out").len(), 3);
    assert_eq!(app.attachments().pending_count(&tp).await, 0);
}

#[tokio::test]
async fn revoke_drops_attachments_without_publishing() {
    let (app, _consumer, producer) = worker();
    let tp = Tp::new("a", 0);
    let src = source("a", 0, 5);
    let handle = app
        .attachments()
        .put(&src, SendTarget::from("out"), None, Some(b"never".to_vec()), None, None)
        .await;

    let revoked: HashSet<Tp> = HashSet::from([tp.clone()]);
    app.on_partitions_revoked(revoked).await;

    assert!(matches!(
        within(DEADLINE, handle.wait()).await,
        Err(PublishError::Revoked { .. })
    ));
    // A late commit for the revoked offset publishes nothing.
    app.attachments().commit(&tp, 5).await;
    assert!(producer.sends().is_empty());
}

#[tokio::test]
async fn send_without_current_event_publishes_immediately() {
    let (app, _consumer, producer) = worker();
    let handle = app
        .send("direct", None, Some(b"now".to_vec()), None, None)
        .await
        .unwrap();

    let sends = producer.sends_to("direct");
    assert_eq!(sends.len(), 1);
    assert!(sends[0].waited);
    let meta = within(DEADLINE, handle.wait()).await.unwrap();
    assert_eq!(meta.topic, "direct");
    assert_eq!(producer.start_count(), 1);
}

#[tokio::test]
async fn send_inside_event_scope_attaches_to_the_source_offset() {
    let (app, consumer, producer) = worker();
    let tp = Tp::new("in", 0);
    let message = Arc::new(source("in", 0, 3));
    let event = Arc::new(app.event(Arc::clone(&message)));

    let handle = scope_event(event, async {
        app.send("out", None, Some(b"gated".to_vec()), None, None)
            .await
            .unwrap()
    })
    .await;

    // Attached, not published.
    assert!(producer.sends().is_empty());
    assert!(app.attachments().has_pending(&tp, 3).await);

    // Committing the source offset through the worker drains the bucket.
    let committed = app.commit(HashMap::from([(tp.clone(), 3)])).await.unwrap();
    assert!(committed);
    assert_eq!(consumer.commits().len(), 1);
    let sends = producer.sends_to("out");
    assert_eq!(sends.len(), 1);
    assert!(!sends[0].waited);
    within(DEADLINE, handle.wait()).await.unwrap();
    assert!(!app.attachments().has_pending(&tp, 3).await);
}

#[tokio::test]
async fn forced_send_bypasses_the_current_event() {
    let (app, _consumer, producer) = worker();
    let message = Arc::new(source("in", 0, 8));
    let event = Arc::new(app.event(Arc::clone(&message)));

    let handle = scope_event(event, async {
        app.attachments()
            .maybe_put(
                SendTarget::from("out"),
                None,
                Some(b"forced".to_vec()),
                None,
                None,
                true,
            )
            .await
            .unwrap()
    })
    .await;

    assert_eq!(producer.sends_to("out").len(), 1);
    assert_eq!(app.attachments().pending_count(&Tp::new("in", 0)).await, 0);
    within(DEADLINE, handle.wait()).await.unwrap();
}

#[tokio::test]
async fn failed_attached_publish_reports_through_the_handle() {
    let (app, _consumer, producer) = worker();
    let tp = Tp::new("a", 0);
    let src = source("a", 0, 2);
    let handle = app
        .attachments()
        .put(&src, SendTarget::from("out"), None, Some(b"doomed".to_vec()), None, None)
        .await;

    producer.fail_sends(true);
    // Commit proceeds even though the attached publish fails.
    app.attachments().commit(&tp, 2).await;
    assert!(!app.attachments().has_pending(&tp, 2).await);
    assert!(matches!(
        within(DEADLINE, handle.wait()).await,
        Err(PublishError::Failed { .. })
    ));
}
