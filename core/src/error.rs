//! Error taxonomy for the worker core.
//!
//! One enum per concern: topic description, table registration, broker I/O
//! and pending-publish resolution. All error paths are explicit `Result`s;
//! none of these are used for control flow.

use crate::tp::Tp;
use thiserror::Error;

/// Errors raised while describing, deriving or validating topics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// A topic is defined by a list of names or by a pattern, never both.
    #[error("cannot specify both topic names and a pattern")]
    TopicsAndPattern,

    /// Prefixes and suffixes rewrite topic names; pattern topics have none.
    #[error("cannot add a prefix or suffix to a pattern topic")]
    PatternAffix,

    /// Topics must have at least one partition.
    #[error("topic cannot have zero partitions")]
    ZeroPartitions,

    /// The subscription pattern failed to compile.
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    /// The topic has no name to publish to (pattern-only descriptor).
    #[error("topic has no concrete name to publish to")]
    NoTopicName,
}

/// Errors raised by table registration and recovery orchestration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// Tables must be registered before the first partition assignment.
    #[error("cannot add table {name:?}: recovery has already started")]
    AddTooLate {
        /// Name of the table that arrived late.
        name: String,
    },

    /// Table names are unique within a worker.
    #[error("a table named {name:?} is already registered")]
    DuplicateTable {
        /// The colliding name.
        name: String,
    },

    /// A new assignment arrived while a recovery cycle was still in flight.
    #[error("partition assignment received while recovery is in flight")]
    RecoveryInFlight,

    /// Applying a changelog record to the backing store failed.
    #[error("failed to apply changelog record: {0}")]
    Changelog(String),
}

/// Failures reported by the broker consumer or producer.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscription change was rejected by the broker.
    #[error("subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Topics in the rejected subscription.
        topics: Vec<String>,
        /// Broker-reported reason.
        reason: String,
    },

    /// A consume, seek, pause or resume call failed.
    #[error("consumer error: {0}")]
    Consumer(String),

    /// A produce call failed.
    #[error("producer error: {0}")]
    Producer(String),

    /// Topic creation failed.
    #[error("failed to create topic '{topic}': {reason}")]
    CreateTopic {
        /// Topic that could not be created.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// Offset commit failed.
    #[error("commit failed: {0}")]
    Commit(String),
}

/// Why a pending publish never produced record metadata.
///
/// Delivered through the send handle of a pending message; the worker's
/// commit path logs these but does not undo the source commit.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// The broker rejected or failed the produce request.
    #[error("publish to '{topic}' failed: {reason}")]
    Failed {
        /// Destination topic.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The source partition was revoked before its offset was committed, so
    /// the attached message was dropped without publishing.
    #[error("source partition {tp} was revoked before commit")]
    Revoked {
        /// The revoked source partition.
        tp: Tp,
    },

    /// The worker dropped the pending message without resolving it.
    #[error("pending message was dropped before publish")]
    Dropped,
}
