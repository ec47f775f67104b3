//! Materialized-table contract.
//!
//! A table ("collection") is named state backed by a compacted changelog
//! topic. The table manager rebuilds it after a partition assignment by
//! replaying the changelog up to the broker highwater, and keeps hot
//! standbys tailing partitions owned by peer workers. The storage engine
//! behind a table is not the worker's business; this contract is the whole
//! surface the recovery engine needs.

use crate::error::TableError;
use crate::message::Message;
use crate::tp::Tp;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

/// Description of a table's changelog topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogSpec {
    /// Changelog topic name.
    pub topic: String,
    /// Partition count (matches the table's source partitioning).
    pub partitions: i32,
}

impl ChangelogSpec {
    /// Create a changelog description.
    #[must_use]
    pub fn new(topic: impl Into<String>, partitions: i32) -> Self {
        Self {
            topic: topic.into(),
            partitions,
        }
    }
}

/// Contract between the table manager and a materialized table.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn Collection>` in the manager's registry.
pub trait Collection: Send + Sync {
    /// Unique table name within the worker.
    fn name(&self) -> &str;

    /// The compacted changelog topic capturing every mutation of this table.
    fn changelog_topic(&self) -> ChangelogSpec;

    /// The last offset the backing store has durably applied for `tp`, or
    /// `None` when the store has seen nothing for that partition.
    fn persisted_offset(&self, tp: &Tp) -> Option<i64>;

    /// Apply one changelog record to the backing store.
    ///
    /// Called by changelog and standby readers during replay; must be
    /// idempotent for re-applied offsets.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Changelog`] if the store rejects the record;
    /// the reader then reports the partition as not recovered.
    fn apply_changelog(
        &self,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), TableError>> + Send + '_>>;

    /// Notification that partitions were assigned to this worker.
    fn on_partitions_assigned(
        &self,
        assigned: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Notification that partitions were revoked from this worker.
    fn on_partitions_revoked(
        &self,
        revoked: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Run user recover callbacks after a successful replay.
    fn call_recover_callbacks(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Start the table if it is not already running.
    fn maybe_start(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Stop the table.
    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
