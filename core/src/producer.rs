//! Broker producer contract.

use crate::error::BrokerError;
use crate::message::RecordMetadata;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Contract for the worker's shared, lazily-started producer.
///
/// The worker starts the producer on first use (topic declaration or first
/// publish), never at construction.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn Producer>` across channels and the attachment buffer.
pub trait Producer: Send + Sync {
    /// Start the producer. Called at most once per worker, before the first
    /// send.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the client cannot be
    /// brought up.
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Hand a record to the producer's buffer without waiting for the
    /// broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Producer`] if the client refuses the record
    /// (e.g. the local queue is full).
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        partition: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;

    /// Publish a record and wait for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Producer`] if the produce fails or times out.
    fn send_and_wait<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        partition: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = Result<RecordMetadata, BrokerError>> + Send + 'a>>;

    /// Create a topic on the broker.
    ///
    /// Creation is idempotent at the worker level: callers guard with a
    /// declare-once latch, and implementations should treat "already
    /// exists" as success.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CreateTopic`] on failure.
    fn create_topic<'a>(
        &'a self,
        topic: &'a str,
        partitions: i32,
        replication: i32,
        config: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;
}
