//! The worker handle.
//!
//! An [`App`] owns exactly one attachment buffer, one table manager, one
//! topic manager, one broker consumer and one lazily-started producer. The
//! shared [`Context`] carries the external collaborators (consumer,
//! producer, assignor, sensors, configuration) so channels and managers can
//! hold a plain handle without owning the app.

use crate::attachments::Attachments;
use crate::config::AppConfig;
use crate::events::Event;
use crate::message::{SendHandle, SendTarget, SentCallback};
use crate::table_manager::TableManager;
use crate::topic::{Topic, TopicBuilder};
use crate::topic_manager::TopicManager;
use freshet_core::{
    BrokerError, Consumer, Message, NullSensor, PartitionAssignor, Producer, Sensor, TableError,
    Tp,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// External collaborators shared by every component of a worker.
///
/// The context never owns the managers; ownership flows one way from
/// [`App`] down.
pub struct Context {
    /// Worker configuration.
    pub config: AppConfig,
    consumer: Arc<dyn Consumer>,
    producer: Arc<dyn Producer>,
    assignor: Arc<dyn PartitionAssignor>,
    sensors: Arc<dyn Sensor>,
    producer_started: OnceCell<()>,
}

impl Context {
    /// Bundle the worker's external collaborators.
    #[must_use]
    pub fn new(
        config: AppConfig,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        assignor: Arc<dyn PartitionAssignor>,
        sensors: Arc<dyn Sensor>,
    ) -> Self {
        Self {
            config,
            consumer,
            producer,
            assignor,
            sensors,
            producer_started: OnceCell::new(),
        }
    }

    /// The worker's single broker consumer.
    #[must_use]
    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    /// The worker's shared producer. Prefer
    /// [`Context::maybe_start_producer`], which guarantees it is running.
    #[must_use]
    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }

    /// The partition assignor computed during group rebalance.
    #[must_use]
    pub fn assignor(&self) -> &Arc<dyn PartitionAssignor> {
        &self.assignor
    }

    /// Instrumentation hooks.
    #[must_use]
    pub fn sensors(&self) -> &Arc<dyn Sensor> {
        &self.sensors
    }

    /// Start the producer on first use and return it.
    ///
    /// # Errors
    ///
    /// Returns the [`BrokerError`] from the producer's start. A failed
    /// start is retried on the next call.
    pub async fn maybe_start_producer(&self) -> Result<&Arc<dyn Producer>, BrokerError> {
        self.producer_started
            .get_or_try_init(|| self.producer.start())
            .await?;
        Ok(&self.producer)
    }
}

/// A Freshet worker: the owner of the core subsystems.
///
/// # Example
///
/// ```ignore
/// let app = App::new(AppConfig::new("orders"), consumer, producer, assignor);
/// app.start();
///
/// let orders = Arc::new(app.topic().topic("orders").build()?);
/// let channel = app.topics().acquire(&orders);
/// while let Some(message) = channel.next_message().await {
///     // dispatch to processors inside scope_event(...)
/// }
/// ```
pub struct App {
    ctx: Arc<Context>,
    attachments: Arc<Attachments>,
    topics: Arc<TopicManager>,
    tables: Arc<TableManager>,
}

impl App {
    /// Create a worker with no-op sensors.
    #[must_use]
    pub fn new(
        config: AppConfig,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        assignor: Arc<dyn PartitionAssignor>,
    ) -> Self {
        Self::with_sensors(config, consumer, producer, assignor, Arc::new(NullSensor))
    }

    /// Create a worker with the given sensors.
    #[must_use]
    pub fn with_sensors(
        config: AppConfig,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        assignor: Arc<dyn PartitionAssignor>,
        sensors: Arc<dyn Sensor>,
    ) -> Self {
        let ctx = Arc::new(Context::new(config, consumer, producer, assignor, sensors));
        let attachments = Arc::new(Attachments::new(Arc::clone(&ctx)));
        let topics = Arc::new(TopicManager::new(Arc::clone(&ctx)));
        let tables = Arc::new(TableManager::new(Arc::clone(&ctx), Arc::clone(&topics)));
        Self {
            ctx,
            attachments,
            topics,
            tables,
        }
    }

    /// The shared worker context.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The attachment buffer.
    #[must_use]
    pub fn attachments(&self) -> &Arc<Attachments> {
        &self.attachments
    }

    /// The fan-out plane.
    #[must_use]
    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    /// The table manager.
    #[must_use]
    pub fn tables(&self) -> &Arc<TableManager> {
        &self.tables
    }

    /// Start describing a topic bound to this worker.
    #[must_use]
    pub fn topic(&self) -> TopicBuilder {
        Topic::builder(Arc::clone(&self.ctx))
    }

    /// Wrap a consumed message as a processor event.
    #[must_use]
    pub fn event(&self, message: Arc<Message>) -> Event {
        Event::new(message, Arc::clone(&self.attachments))
    }

    /// Start the worker's background tasks.
    pub fn start(&self) {
        self.topics.start();
    }

    /// Stop the worker: tables (and any recovery) first, then the fan-out
    /// plane.
    pub async fn stop(&self) {
        self.tables.stop().await;
        self.topics.stop().await;
    }

    /// Send a message, honoring the current-event attachment discipline.
    ///
    /// Inside a processor (a current event is in scope) the message is
    /// attached to the input's offset and published on commit; outside, it
    /// is published immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] when the immediate publish path fails.
    pub async fn send(
        &self,
        channel: impl Into<SendTarget>,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        partition: Option<i32>,
        callback: Option<SentCallback>,
    ) -> Result<SendHandle, BrokerError> {
        self.attachments
            .maybe_put(channel.into(), key, value, partition, callback, false)
            .await
    }

    /// Commit offsets and drain the attachments gated on them.
    ///
    /// # Errors
    ///
    /// Returns the broker failure if the commit itself fails; attached
    /// publish failures are reported through their send handles only.
    pub async fn commit(&self, offsets: HashMap<Tp, i64>) -> Result<bool, BrokerError> {
        let committed = self.topics.commit(offsets.clone()).await?;
        if committed {
            for (tp, offset) in offsets {
                self.attachments.commit(&tp, offset).await;
            }
        }
        Ok(committed)
    }

    /// Route a partition assignment to the managers.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::RecoveryInFlight`] if the previous recovery
    /// cycle is still running.
    pub async fn on_partitions_assigned(&self, assigned: HashSet<Tp>) -> Result<(), TableError> {
        self.topics.on_partitions_assigned(&assigned);
        self.tables.on_partitions_assigned(assigned).await
    }

    /// Route a partition revocation: drop pending attachments for the
    /// revoked partitions, then let the table manager abort recovery and
    /// stop standbys.
    pub async fn on_partitions_revoked(&self, revoked: HashSet<Tp>) {
        self.topics.on_partitions_revoked(&revoked);
        self.attachments.revoke(&revoked).await;
        self.tables.on_partitions_revoked(revoked).await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal no-op collaborators for unit tests inside this crate.
    //! Full-featured mocks live in `freshet-testing`.

    use super::*;
    use freshet_core::{MessageStream, RecordMetadata};
    use std::future::Future;
    use std::pin::Pin;

    pub(crate) struct NoopConsumer;

    impl Consumer for NoopConsumer {
        fn subscribe(
            &self,
            _topics: Vec<String>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn assignment(&self) -> HashSet<Tp> {
            HashSet::new()
        }

        fn pause_partitions(
            &self,
            _tps: HashSet<Tp>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn resume_partitions(
            &self,
            _tps: HashSet<Tp>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn commit(
            &self,
            _offsets: HashMap<Tp, i64>,
        ) -> Pin<Box<dyn Future<Output = Result<bool, BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(true) })
        }

        fn seek(
            &self,
            _tp: Tp,
            _offset: i64,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn highwater(
            &self,
            _tp: Tp,
        ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(None) })
        }

        fn perform_seek(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn messages(&self) -> MessageStream {
            Box::pin(futures::stream::empty())
        }
    }

    pub(crate) struct NoopProducer;

    impl Producer for NoopProducer {
        fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn send<'a>(
            &'a self,
            _topic: &'a str,
            _key: Option<&'a [u8]>,
            _value: Option<&'a [u8]>,
            _partition: Option<i32>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }

        fn send_and_wait<'a>(
            &'a self,
            topic: &'a str,
            _key: Option<&'a [u8]>,
            _value: Option<&'a [u8]>,
            partition: Option<i32>,
        ) -> Pin<Box<dyn Future<Output = Result<RecordMetadata, BrokerError>> + Send + 'a>> {
            Box::pin(async move {
                Ok(RecordMetadata {
                    topic: topic.to_string(),
                    partition: partition.unwrap_or(0),
                    offset: 0,
                })
            })
        }

        fn create_topic<'a>(
            &'a self,
            _topic: &'a str,
            _partitions: i32,
            _replication: i32,
            _config: &'a HashMap<String, String>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    pub(crate) struct NoopAssignor;

    impl PartitionAssignor for NoopAssignor {
        fn assigned_actives(&self) -> HashSet<Tp> {
            HashSet::new()
        }

        fn assigned_standbys(&self) -> HashSet<Tp> {
            HashSet::new()
        }
    }
}

#[cfg(test)]
impl Context {
    /// Context wired to no-op collaborators, for unit tests.
    pub(crate) fn for_tests(config: AppConfig) -> Arc<Self> {
        Arc::new(Self::new(
            config,
            Arc::new(test_support::NoopConsumer),
            Arc::new(test_support::NoopProducer),
            Arc::new(test_support::NoopAssignor),
            Arc::new(NullSensor),
        ))
    }
}
