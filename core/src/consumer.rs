//! Broker consumer contract.
//!
//! The worker owns exactly one consumer. The topic fan-out plane drives its
//! message stream; the table manager pauses, seeks and resumes partitions on
//! it during changelog recovery. Implementations live outside the core
//! (`freshet-kafka` for rdkafka, `freshet-testing` for mocks).

use crate::error::BrokerError;
use crate::message::Message;
use crate::tp::Tp;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of records delivered by the broker.
///
/// Each item is one consumed [`Message`] or a transport error. Within a
/// topic-partition, items arrive in broker offset order.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Arc<Message>, BrokerError>> + Send>>;

/// Contract for the single broker consumer a worker owns.
///
/// # Ordering
///
/// Implementations must deliver records of one topic-partition in offset
/// order on [`Consumer::messages`]. No ordering is promised across
/// partitions.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to enable trait object usage (`Arc<dyn Consumer>`): the topic
/// manager and table manager share one consumer handle.
pub trait Consumer: Send + Sync {
    /// Replace the consumer's subscription with the given topic set.
    ///
    /// Entries starting with `^` are broker-interpreted patterns.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the broker rejects the
    /// subscription.
    fn subscribe(
        &self,
        topics: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// The partitions currently assigned to this consumer.
    fn assignment(&self) -> HashSet<Tp>;

    /// Stop delivering records for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consumer`] if the client rejects the call.
    fn pause_partitions(
        &self,
        tps: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Resume delivering records for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consumer`] if the client rejects the call.
    fn resume_partitions(
        &self,
        tps: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Commit the given offsets (the last processed offset per partition).
    ///
    /// Returns `true` if anything was committed, `false` when the request
    /// was empty or entirely stale.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Commit`] if the broker rejects the commit.
    fn commit(
        &self,
        offsets: HashMap<Tp, i64>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BrokerError>> + Send + '_>>;

    /// Position the consumer at `offset` for `tp`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consumer`] if the seek fails.
    fn seek(
        &self,
        tp: Tp,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// The broker's current end offset for `tp` (the offset of the last
    /// record), or `None` for an empty partition.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consumer`] if watermarks cannot be fetched.
    fn highwater(
        &self,
        tp: Tp,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, BrokerError>> + Send + '_>>;

    /// Re-align the consumer's position with its committed offsets on every
    /// assigned partition.
    ///
    /// The table manager calls this after a successful recovery so the first
    /// record returned per partition is the first not yet reflected in table
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consumer`] if a seek fails.
    fn perform_seek(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Take the consumer's record stream.
    ///
    /// Called once by the fan-out plane; subsequent calls may return an
    /// empty stream.
    fn messages(&self) -> MessageStream;
}
