//! rdkafka consumer adapter.

use freshet_core::{BrokerError, Consumer, Message, MessageStream, Tp};
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{Message as _, Timestamp};
use rdkafka::util::Timeout;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Broker consumer backed by an rdkafka [`StreamConsumer`].
///
/// One instance serves the whole worker: the fan-out plane drives
/// [`KafkaConsumer::messages`] while the table manager pauses, seeks and
/// resumes partitions on the same client during recovery.
pub struct KafkaConsumer {
    inner: Arc<StreamConsumer>,
    buffer_size: usize,
    op_timeout: Duration,
}

impl KafkaConsumer {
    /// Create a builder for configuring the consumer.
    #[must_use]
    pub fn builder() -> KafkaConsumerBuilder {
        KafkaConsumerBuilder::default()
    }

    fn tpl_for(tps: &HashSet<Tp>) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::with_capacity(tps.len());
        for tp in tps {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        tpl
    }
}

/// Builder for a [`KafkaConsumer`].
#[derive(Default)]
pub struct KafkaConsumerBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    auto_offset_reset: Option<String>,
    buffer_size: Option<usize>,
    op_timeout: Option<Duration>,
}

impl KafkaConsumerBuilder {
    /// Comma-separated broker addresses (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group id. Workers of one application share a group.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Where new groups start reading: `"earliest"`, `"latest"` or
    /// `"error"`. Default: `"earliest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Record buffer between the client and the fan-out plane.
    /// Default: 1000.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Timeout for blocking metadata operations (watermarks, committed
    /// offsets). Default: 10 seconds.
    #[must_use]
    pub const fn op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = Some(op_timeout);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] when brokers or group id
    /// are missing, or the client cannot be created.
    pub fn build(self) -> Result<KafkaConsumer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("brokers not configured".to_string()))?;
        let group_id = self
            .group_id
            .ok_or_else(|| BrokerError::ConnectionFailed("group id not configured".to_string()))?;
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        let inner: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("failed to create consumer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            group_id = %group_id,
            auto_offset_reset = %auto_offset_reset,
            "kafka consumer created"
        );

        Ok(KafkaConsumer {
            inner: Arc::new(inner),
            buffer_size: self.buffer_size.unwrap_or(1000),
            op_timeout: self.op_timeout.unwrap_or(Duration::from_secs(10)),
        })
    }
}

impl Consumer for KafkaConsumer {
    fn subscribe(
        &self,
        topics: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.inner
                .subscribe(&refs)
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: e.to_string(),
                })
        })
    }

    fn assignment(&self) -> HashSet<Tp> {
        match self.inner.assignment() {
            Ok(tpl) => tpl
                .elements()
                .iter()
                .map(|e| Tp::new(e.topic(), e.partition()))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read assignment");
                HashSet::new()
            }
        }
    }

    fn pause_partitions(
        &self,
        tps: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let tpl = Self::tpl_for(&tps);
            tracing::debug!(partitions = tps.len(), "pausing partitions");
            self.inner
                .pause(&tpl)
                .map_err(|e| BrokerError::Consumer(e.to_string()))
        })
    }

    fn resume_partitions(
        &self,
        tps: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let tpl = Self::tpl_for(&tps);
            tracing::debug!(partitions = tps.len(), "resuming partitions");
            self.inner
                .resume(&tpl)
                .map_err(|e| BrokerError::Consumer(e.to_string()))
        })
    }

    fn commit(
        &self,
        offsets: HashMap<Tp, i64>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            if offsets.is_empty() {
                return Ok(false);
            }
            let mut tpl = TopicPartitionList::with_capacity(offsets.len());
            for (tp, offset) in &offsets {
                // Kafka commits the *next* offset to read.
                tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(offset + 1))
                    .map_err(|e| BrokerError::Commit(e.to_string()))?;
            }
            self.inner
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| BrokerError::Commit(e.to_string()))?;
            Ok(true)
        })
    }

    fn seek(
        &self,
        tp: Tp,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!(tp = %tp, offset, "seeking");
            self.inner
                .seek(
                    &tp.topic,
                    tp.partition,
                    Offset::Offset(offset),
                    Timeout::After(self.op_timeout),
                )
                .map_err(|e| BrokerError::Consumer(e.to_string()))
        })
    }

    fn highwater(
        &self,
        tp: Tp,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let consumer = Arc::clone(&self.inner);
            let timeout = self.op_timeout;
            let watermarks = tokio::task::spawn_blocking(move || {
                consumer.fetch_watermarks(&tp.topic, tp.partition, Timeout::After(timeout))
            })
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;
            let (low, high) = watermarks;
            if high <= low {
                // Empty partition.
                Ok(None)
            } else {
                // `high` is the next offset to be produced; the last record
                // sits one before it.
                Ok(Some(high - 1))
            }
        })
    }

    fn perform_seek(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let consumer = Arc::clone(&self.inner);
            let timeout = self.op_timeout;
            let committed = tokio::task::spawn_blocking(move || {
                consumer.committed(Timeout::After(timeout))
            })
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;
            for element in committed.elements() {
                if let Offset::Offset(offset) = element.offset() {
                    tracing::debug!(
                        topic = element.topic(),
                        partition = element.partition(),
                        offset,
                        "seeking to committed offset"
                    );
                    self.inner
                        .seek(
                            element.topic(),
                            element.partition(),
                            Offset::Offset(offset),
                            Timeout::After(self.op_timeout),
                        )
                        .map_err(|e| BrokerError::Consumer(e.to_string()))?;
                }
                // Partitions with no committed offset fall back to the
                // client's auto.offset.reset policy.
            }
            Ok(())
        })
    }

    fn messages(&self) -> MessageStream {
        let consumer = Arc::clone(&self.inner);
        let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);

        // The forwarder task owns the receive side of the client; the
        // control-plane calls above keep using the shared handle.
        tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(record) => {
                        let timestamp = match record.timestamp() {
                            Timestamp::CreateTime(ms) | Timestamp::LogAppendTime(ms) => {
                                chrono::DateTime::from_timestamp_millis(ms)
                            }
                            Timestamp::NotAvailable => None,
                        };
                        let message = Arc::new(Message::new(
                            record.topic(),
                            record.partition(),
                            record.offset(),
                            timestamp,
                            record.key().map(<[u8]>::to_vec),
                            record.payload().map(<[u8]>::to_vec),
                        ));
                        if tx.send(Ok(message)).await.is_err() {
                            tracing::debug!("message stream dropped, stopping forwarder");
                            break;
                        }
                    }
                    Err(e) => {
                        let error = BrokerError::Consumer(e.to_string());
                        if tx.send(Err(error)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_consumer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaConsumer>();
        assert_sync::<KafkaConsumer>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = KafkaConsumer::builder().group_id("g").build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }

    #[test]
    fn build_without_group_id_fails() {
        let result = KafkaConsumer::builder().brokers("localhost:9092").build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }

    #[test]
    fn build_with_brokers_and_group_succeeds() {
        // Client creation is lazy; no broker is contacted here.
        let consumer = KafkaConsumer::builder()
            .brokers("localhost:9092")
            .group_id("freshet-test")
            .buffer_size(16)
            .build();
        assert!(consumer.is_ok());
    }
}
