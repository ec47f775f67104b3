//! rdkafka producer adapter.

use freshet_core::{BrokerError, Producer, RecordMetadata};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Broker producer backed by an rdkafka [`FutureProducer`].
///
/// Shared by every channel of a worker. The client buffers and batches;
/// [`Producer::send`] returns once the record is accepted by the local
/// queue, [`Producer::send_and_wait`] once the broker acknowledges it.
pub struct KafkaProducer {
    inner: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    timeout: Duration,
}

impl KafkaProducer {
    /// Create a builder for configuring the producer.
    #[must_use]
    pub fn builder() -> KafkaProducerBuilder {
        KafkaProducerBuilder::default()
    }
}

/// Builder for a [`KafkaProducer`].
#[derive(Default)]
pub struct KafkaProducerBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl KafkaProducerBuilder {
    /// Comma-separated broker addresses (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Acknowledgement mode: `"0"`, `"1"` or `"all"`. Default: `"1"`.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`,
    /// `"zstd"`. Default: `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout for acknowledged sends. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer (and the admin client used for topic creation).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] when brokers are missing or
    /// a client cannot be created.
    pub fn build(self) -> Result<KafkaProducer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("brokers not configured".to_string()))?;
        let acks = self.acks.unwrap_or_else(|| "1".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("compression.type", &compression);

        let inner: FutureProducer = config.create().map_err(|e| {
            BrokerError::ConnectionFailed(format!("failed to create producer: {e}"))
        })?;
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("failed to create admin client: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            "kafka producer created"
        );

        Ok(KafkaProducer {
            inner,
            admin,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
        })
    }
}

impl Producer for KafkaProducer {
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        // The client connects on first use; starting is a latch for the
        // worker, not a broker round-trip.
        Box::pin(async {
            tracing::debug!("kafka producer started");
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        partition: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic);
            if let Some(key) = key {
                record = record.key(key);
            }
            if let Some(value) = value {
                record = record.payload(value);
            }
            if let Some(partition) = partition {
                record = record.partition(partition);
            }
            match self.inner.send_result(record) {
                Ok(delivery) => {
                    let topic = topic.to_string();
                    // Report delivery failures out of band; the caller only
                    // waited for the local queue to accept the record.
                    tokio::spawn(async move {
                        match delivery.await {
                            Ok(Ok(_)) => {}
                            Ok(Err((e, _))) => {
                                tracing::error!(topic = %topic, error = %e, "delivery failed");
                            }
                            Err(_) => {
                                tracing::debug!(topic = %topic, "producer dropped before delivery");
                            }
                        }
                    });
                    Ok(())
                }
                Err((e, _)) => Err(BrokerError::Producer(e.to_string())),
            }
        })
    }

    fn send_and_wait<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        partition: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = Result<RecordMetadata, BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic);
            if let Some(key) = key {
                record = record.key(key);
            }
            if let Some(value) = value {
                record = record.payload(value);
            }
            if let Some(partition) = partition {
                record = record.partition(partition);
            }
            match self.inner.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic = %topic, partition, offset, "record acknowledged");
                    Ok(RecordMetadata {
                        topic: topic.to_string(),
                        partition,
                        offset,
                    })
                }
                Err((e, _)) => {
                    tracing::error!(topic = %topic, error = %e, "failed to publish record");
                    Err(BrokerError::Producer(e.to_string()))
                }
            }
        })
    }

    fn create_topic<'a>(
        &'a self,
        topic: &'a str,
        partitions: i32,
        replication: i32,
        config: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication));
            for (key, value) in config {
                new_topic = new_topic.set(key, value);
            }
            let results = self
                .admin
                .create_topics([&new_topic], &AdminOptions::new())
                .await
                .map_err(|e| BrokerError::CreateTopic {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
            for result in results {
                match result {
                    Ok(name) => tracing::info!(topic = %name, partitions, "topic created"),
                    Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        tracing::debug!(topic = %topic, "topic already exists");
                    }
                    Err((name, code)) => {
                        return Err(BrokerError::CreateTopic {
                            topic: name,
                            reason: code.to_string(),
                        });
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_producer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaProducer>();
        assert_sync::<KafkaProducer>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = KafkaProducer::builder().build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }

    #[test]
    fn build_with_brokers_succeeds() {
        let producer = KafkaProducer::builder()
            .brokers("localhost:9092")
            .acks("all")
            .compression("lz4")
            .build();
        assert!(producer.is_ok());
    }
}
