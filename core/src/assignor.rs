//! Partition assignor contract.

use crate::tp::Tp;
use std::collections::HashSet;

/// Reports which partitions this worker owns actively and which it follows
/// as standby replicas.
///
/// The assignor is computed during the broker's group rebalance; the table
/// manager reads it at the start of every recovery cycle.
pub trait PartitionAssignor: Send + Sync {
    /// Partitions this worker is the active owner of.
    fn assigned_actives(&self) -> HashSet<Tp>;

    /// Partitions this worker follows as a standby replica.
    fn assigned_standbys(&self) -> HashSet<Tp>;
}
