//! In-memory table implementation.

use freshet_core::{ChangelogSpec, Collection, Message, TableError, Tp};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`Collection`] over a hash map, with scripted persisted offsets and
/// full lifecycle call recording.
pub struct MemoryTable {
    name: String,
    changelog: ChangelogSpec,
    fail_apply: AtomicBool,
    persisted: Mutex<HashMap<Tp, i64>>,
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    applied: Mutex<Vec<(Tp, i64)>>,
    recover_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    assigned_calls: Mutex<Vec<HashSet<Tp>>>,
    revoked_calls: Mutex<Vec<HashSet<Tp>>>,
}

impl MemoryTable {
    /// Create a table with the given name and changelog description.
    #[must_use]
    pub fn new(name: impl Into<String>, changelog: ChangelogSpec) -> Self {
        Self {
            name: name.into(),
            changelog,
            fail_apply: AtomicBool::new(false),
            persisted: Mutex::new(HashMap::new()),
            data: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            recover_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            assigned_calls: Mutex::new(Vec::new()),
            revoked_calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the durable offset reported for a partition.
    pub fn set_persisted_offset(&self, tp: Tp, offset: i64) {
        locked(&self.persisted).insert(tp, offset);
    }

    /// Make every subsequent apply fail.
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::Release);
    }

    /// Every `(tp, offset)` applied, in order.
    pub fn applied(&self) -> Vec<(Tp, i64)> {
        locked(&self.applied).clone()
    }

    /// Current value for a key.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        locked(&self.data).get(key).cloned()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        locked(&self.data).len()
    }

    /// Whether the table holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times recover callbacks ran.
    pub fn recover_calls(&self) -> usize {
        self.recover_calls.load(Ordering::Acquire)
    }

    /// How many times `maybe_start` ran.
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::Acquire)
    }

    /// How many times `stop` ran.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::Acquire)
    }

    /// Partition sets passed to `on_partitions_assigned`.
    pub fn assigned_calls(&self) -> Vec<HashSet<Tp>> {
        locked(&self.assigned_calls).clone()
    }

    /// Partition sets passed to `on_partitions_revoked`.
    pub fn revoked_calls(&self) -> Vec<HashSet<Tp>> {
        locked(&self.revoked_calls).clone()
    }
}

impl Collection for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn changelog_topic(&self) -> ChangelogSpec {
        self.changelog.clone()
    }

    fn persisted_offset(&self, tp: &Tp) -> Option<i64> {
        locked(&self.persisted).get(tp).copied()
    }

    fn apply_changelog(
        &self,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), TableError>> + Send + '_>> {
        if self.fail_apply.load(Ordering::Acquire) {
            return Box::pin(async { Err(TableError::Changelog("scripted failure".to_string())) });
        }
        let tp = message.tp();
        let offset = message.offset;
        let key = message.key.clone();
        let value = message.value.clone();
        Box::pin(async move {
            if let Some(key) = key {
                let mut data = locked(&self.data);
                match value {
                    Some(value) => {
                        data.insert(key, value);
                    }
                    // A tombstone deletes the key.
                    None => {
                        data.remove(&key);
                    }
                }
            }
            locked(&self.applied).push((tp, offset));
            Ok(())
        })
    }

    fn on_partitions_assigned(
        &self,
        assigned: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        locked(&self.assigned_calls).push(assigned);
        Box::pin(async {})
    }

    fn on_partitions_revoked(
        &self,
        revoked: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        locked(&self.revoked_calls).push(revoked);
        Box::pin(async {})
    }

    fn call_recover_callbacks(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.recover_calls.fetch_add(1, Ordering::AcqRel);
        Box::pin(async {})
    }

    fn maybe_start(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.start_calls.fetch_add(1, Ordering::AcqRel);
        Box::pin(async {})
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.stop_calls.fetch_add(1, Ordering::AcqRel);
        Box::pin(async {})
    }
}
