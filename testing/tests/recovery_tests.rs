//! Table recovery behavior: changelog replay, abort on revocation and
//! standby lifecycles.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can unwrap/expect/panic

use freshet_core::{ChangelogSpec, Message, TableError, Tp};
use freshet_runtime::{App, AppConfig};
use freshet_testing::{
    ConsumerCall, MemoryTable, MockConsumer, MockProducer, StaticAssignor, eventually, within,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

fn worker() -> (App, Arc<MockConsumer>, Arc<MockProducer>, Arc<StaticAssignor>) {
    let consumer = Arc::new(MockConsumer::new());
    let producer = Arc::new(MockProducer::new());
    let assignor = Arc::new(StaticAssignor::default());
    let config = AppConfig {
        subscriber_grace: Duration::from_millis(50),
        ..AppConfig::new("recovery-tests")
    };
    let app = App::new(config, consumer.clone(), producer.clone(), assignor.clone());
    (app, consumer, producer, assignor)
}

fn changelog_record(topic: &str, offset: i64) -> Message {
    Message::new(
        topic,
        0,
        offset,
        None,
        Some(format!("key-{offset}").into_bytes()),
        Some(format!("value-{offset}").into_bytes()),
    )
}

async fn wait_for_resume(consumer: &MockConsumer, tp: &Tp) {
    assert!(
        eventually(DEADLINE, || {
            consumer.resumes().iter().any(|tps| tps.contains(tp))
        })
        .await,
        "reader never resumed {tp}"
    );
}

#[tokio::test]
async fn recovery_replays_changelog_to_highwater() {
    let (app, consumer, _producer, assignor) = worker();
    let log_tp = Tp::new("t-log", 0);
    let src_tp = Tp::new("orders", 0);

    let table = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    table.set_persisted_offset(log_tp.clone(), 100);
    app.tables().add(table.clone()).unwrap();

    consumer.set_assignment(HashSet::from([log_tp.clone(), src_tp.clone()]));
    consumer.set_highwater(log_tp.clone(), 150);
    assignor.set_actives(HashSet::from([log_tp.clone()]));

    app.start();
    let assigned = HashSet::from([log_tp.clone(), src_tp.clone()]);
    app.on_partitions_assigned(assigned).await.unwrap();

    // The reviver seeks past the persisted offset and resumes its
    // partitions; only then is the changelog channel live.
    wait_for_resume(&consumer, &log_tp).await;
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;
    assert!(consumer.seeks().contains(&(log_tp.clone(), 101)));

    for offset in 101..=150 {
        consumer.inject(changelog_record("t-log", offset)).await;
    }
    within(DEADLINE, app.tables().wait_recovery_completed()).await;

    // Replayed exactly the gap, in order.
    let applied = table.applied();
    assert_eq!(applied.len(), 50);
    assert_eq!(applied.first(), Some(&(log_tp.clone(), 101)));
    assert_eq!(applied.last(), Some(&(log_tp.clone(), 150)));

    assert_eq!(app.tables().table_offsets().get(&log_tp), Some(&150));
    assert_eq!(table.recover_calls(), 1);
    assert_eq!(table.start_calls(), 1);
    assert!(consumer.calls().contains(&ConsumerCall::PerformSeek));

    // Non-changelog partitions resumed, changelog partitions re-paused.
    assert!(consumer.resumes().iter().any(|tps| tps.contains(&src_tp)));
    assert!(consumer.paused().contains(&log_tp));
    assert_eq!(app.tables().standby_count().await, 0);
    app.stop().await;
}

#[tokio::test]
async fn revoke_during_recovery_aborts_without_completing() {
    let (app, consumer, _producer, assignor) = worker();
    let log_tp = Tp::new("t-log", 0);

    let table = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    table.set_persisted_offset(log_tp.clone(), 100);
    app.tables().add(table.clone()).unwrap();

    consumer.set_assignment(HashSet::from([log_tp.clone()]));
    consumer.set_highwater(log_tp.clone(), 1_000_000);
    assignor.set_actives(HashSet::from([log_tp.clone()]));
    assignor.set_standbys(HashSet::from([Tp::new("other-log", 0)]));

    app.start();
    let assigned = HashSet::from([log_tp.clone()]);
    app.on_partitions_assigned(assigned.clone()).await.unwrap();
    wait_for_resume(&consumer, &log_tp).await;

    // Revocation aborts the in-flight recovery and joins it.
    within(DEADLINE, app.on_partitions_revoked(assigned.clone())).await;

    assert!(!app.tables().recovery_completed());
    assert_eq!(app.tables().standby_count().await, 0);
    assert!(consumer.paused().contains(&log_tp));
    assert_eq!(table.revoked_calls().len(), 1);
    assert_eq!(table.recover_calls(), 0);

    // The previous cycle is fully retired: a new assignment is accepted.
    app.on_partitions_assigned(assigned.clone()).await.unwrap();
    within(DEADLINE, app.on_partitions_revoked(assigned)).await;
    app.stop().await;
}

#[tokio::test]
async fn overlapping_assignments_are_rejected() {
    let (app, consumer, _producer, assignor) = worker();
    let log_tp = Tp::new("t-log", 0);

    let table = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    app.tables().add(table).unwrap();
    consumer.set_assignment(HashSet::from([log_tp.clone()]));
    consumer.set_highwater(log_tp.clone(), 1_000_000);
    assignor.set_actives(HashSet::from([log_tp.clone()]));

    app.start();
    let assigned = HashSet::from([log_tp.clone()]);
    app.on_partitions_assigned(assigned.clone()).await.unwrap();
    wait_for_resume(&consumer, &log_tp).await;

    let second = app.on_partitions_assigned(assigned.clone()).await;
    assert_eq!(second.err(), Some(TableError::RecoveryInFlight));

    within(DEADLINE, app.on_partitions_revoked(assigned)).await;
    app.stop().await;
}

#[tokio::test]
async fn tables_cannot_be_added_after_recovery_starts() {
    let (app, _consumer, _producer, _assignor) = worker();
    app.start();
    app.on_partitions_assigned(HashSet::new()).await.unwrap();
    within(DEADLINE, app.tables().wait_recovery_completed()).await;
    assert!(app.tables().recovery_started());

    let late = Arc::new(MemoryTable::new("late", ChangelogSpec::new("late-log", 1)));
    assert!(matches!(
        app.tables().add(late),
        Err(TableError::AddTooLate { .. })
    ));
    app.stop().await;
}

#[tokio::test]
async fn duplicate_table_names_are_rejected() {
    let (app, _consumer, _producer, _assignor) = worker();
    let first = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    let second = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    app.tables().add(first).unwrap();
    assert!(matches!(
        app.tables().add(second),
        Err(TableError::DuplicateTable { .. })
    ));
}

#[tokio::test]
async fn standbys_tail_and_fold_offsets_on_stop() {
    let (app, consumer, _producer, assignor) = worker();
    let log_tp = Tp::new("t-log", 0);

    let table = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    app.tables().add(table.clone()).unwrap();
    assignor.set_standbys(HashSet::from([log_tp.clone()]));

    app.start();
    // Nothing assigned actively; recovery completes and launches the
    // standby for the peer-owned partition.
    app.on_partitions_assigned(HashSet::new()).await.unwrap();
    within(DEADLINE, app.tables().wait_recovery_completed()).await;
    assert_eq!(app.tables().standby_count().await, 1);

    wait_for_resume(&consumer, &log_tp).await;
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;
    for offset in 0..5 {
        consumer.inject(changelog_record("t-log", offset)).await;
    }
    assert!(
        eventually(DEADLINE, || table.applied().len() == 5).await,
        "standby must apply tailed records"
    );

    // Revocation stops the standby and folds its progress into the
    // monotone offset map.
    app.on_partitions_revoked(HashSet::new()).await;
    assert_eq!(app.tables().standby_count().await, 0);
    assert_eq!(app.tables().table_offsets().get(&log_tp), Some(&4));
    app.stop().await;
}

#[tokio::test]
async fn reviver_failure_interrupts_recovery() {
    let (app, consumer, _producer, assignor) = worker();
    let log_tp = Tp::new("t-log", 0);

    let table = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    table.fail_apply(true);
    app.tables().add(table.clone()).unwrap();
    consumer.set_assignment(HashSet::from([log_tp.clone()]));
    consumer.set_highwater(log_tp.clone(), 5);
    assignor.set_actives(HashSet::from([log_tp.clone()]));

    app.start();
    app.on_partitions_assigned(HashSet::from([log_tp.clone()]))
        .await
        .unwrap();
    wait_for_resume(&consumer, &log_tp).await;
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;
    consumer.inject(changelog_record("t-log", 0)).await;

    // The reader faults, re-pauses its partitions and the cycle ends
    // without completing.
    assert!(
        eventually(DEADLINE, || {
            let pauses = consumer
                .calls()
                .iter()
                .filter(|call| matches!(call, ConsumerCall::Pause(tps) if tps.contains(&log_tp)))
                .count();
            pauses >= 2
        })
        .await,
        "faulted reader must re-pause its partitions"
    );
    assert!(!app.tables().recovery_completed());
    assert_eq!(table.recover_calls(), 0);
    assert_eq!(app.tables().standby_count().await, 0);
    app.stop().await;
}

#[tokio::test]
async fn table_offsets_never_decrease() {
    let (app, consumer, _producer, assignor) = worker();
    let log_tp = Tp::new("t-log", 0);

    let table = Arc::new(MemoryTable::new("t", ChangelogSpec::new("t-log", 1)));
    table.set_persisted_offset(log_tp.clone(), 10);
    app.tables().add(table.clone()).unwrap();
    consumer.set_assignment(HashSet::from([log_tp.clone()]));
    consumer.set_highwater(log_tp.clone(), 12);
    assignor.set_actives(HashSet::from([log_tp.clone()]));

    app.start();
    let assigned = HashSet::from([log_tp.clone()]);
    app.on_partitions_assigned(assigned.clone()).await.unwrap();
    wait_for_resume(&consumer, &log_tp).await;
    within(DEADLINE, app.topics().wait_for_subscriptions()).await;
    for offset in 11..=12 {
        consumer.inject(changelog_record("t-log", offset)).await;
    }
    within(DEADLINE, app.tables().wait_recovery_completed()).await;
    assert_eq!(app.tables().table_offsets().get(&log_tp), Some(&12));

    // A later cycle with a stale persisted offset cannot move the map
    // backwards.
    table.set_persisted_offset(log_tp.clone(), 3);
    app.on_partitions_revoked(assigned.clone()).await;
    app.on_partitions_assigned(assigned).await.unwrap();
    within(DEADLINE, app.tables().wait_recovery_completed()).await;
    assert_eq!(app.tables().table_offsets().get(&log_tp), Some(&12));
    app.stop().await;
}
