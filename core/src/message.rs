//! Inbound messages and produce acknowledgements.
//!
//! A [`Message`] is one record delivered by the broker consumer. The worker
//! fans a single consumed message out to every in-process channel subscribed
//! to its topic, so the message carries a reference count: the fan-out plane
//! increments it in bulk *before* any delivery begins, and each subscriber
//! decrements it once done. Only when the count returns to zero may the
//! record be considered fully processed by this worker.

use crate::tp::Tp;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A record consumed from the broker.
///
/// Key and value are raw bytes; codecs live outside the worker core.
/// Messages are shared between channels as `Arc<Message>` and tracked with
/// the embedded reference count (see [`Message::incref_bulk`]).
#[derive(Debug)]
pub struct Message {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset of the record within its partition.
    pub offset: i64,
    /// Broker timestamp, when available.
    pub timestamp: Option<DateTime<Utc>>,
    /// Encoded key bytes.
    pub key: Option<Vec<u8>>,
    /// Encoded value bytes.
    pub value: Option<Vec<u8>>,
    refcount: AtomicUsize,
}

impl Message {
    /// Create a new message with a zero reference count.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: Option<DateTime<Utc>>,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp,
            key,
            value,
            refcount: AtomicUsize::new(0),
        }
    }

    /// The topic-partition this record belongs to.
    #[must_use]
    pub fn tp(&self) -> Tp {
        Tp::new(self.topic.clone(), self.partition)
    }

    /// Increment the reference count by `n` subscribers at once.
    ///
    /// The fan-out plane calls this with the full subscriber count before any
    /// channel receives the message, so no early decrement can reach zero
    /// while deliveries are still being enqueued.
    pub fn incref_bulk(&self, n: usize) {
        self.refcount.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrement the reference count, returning the remaining count.
    ///
    /// A return value of zero means every subscriber is done with the record.
    /// Decrementing an already-zero count is a no-op returning zero.
    pub fn decref(&self) -> usize {
        let prev = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(n) => n - 1,
            Err(_) => 0,
        }
    }

    /// Current reference count.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

/// Broker acknowledgement for a produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Topic the record was written to.
    pub topic: String,
    /// Partition the record landed on.
    pub partition: i32,
    /// Offset assigned by the broker, or [`crate::OFFSET_UNKNOWN`] when the
    /// produce was handed to the client buffer without waiting for the ack.
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::new("t", 0, 7, None, Some(b"k".to_vec()), Some(b"v".to_vec()))
    }

    #[test]
    fn incref_bulk_then_decref_counts_down() {
        let msg = message();
        msg.incref_bulk(3);
        assert_eq!(msg.refcount(), 3);
        assert_eq!(msg.decref(), 2);
        assert_eq!(msg.decref(), 1);
        assert_eq!(msg.decref(), 0);
    }

    #[test]
    fn decref_at_zero_is_a_noop() {
        let msg = message();
        assert_eq!(msg.decref(), 0);
        assert_eq!(msg.refcount(), 0);
    }

    #[test]
    fn tp_pairs_topic_and_partition() {
        assert_eq!(message().tp(), Tp::new("t", 0));
    }
}
