//! Table recovery orchestration.
//!
//! The table manager owns every materialized table in the worker. On
//! partition assignment it rebuilds local state by replaying each table's
//! changelog up to the broker highwater, launches standby readers for
//! partitions owned by peers, and aborts the whole cycle cleanly when the
//! assignment changes again.
//!
//! Observable state transitions (logged):
//! `UPDATE → PARTITIONS_ASSIGNED → RECOVER → START_STANDBYS → …` and on
//! revocation `PARTITIONS_REVOKED → STOP_STANDBYS`.

use crate::app::Context;
use crate::changelog::ChangelogReader;
use crate::flight_recorder::FlightRecorder;
use crate::topic::Topic;
use crate::topic_manager::TopicManager;
use freshet_core::{BrokerError, Collection, OFFSET_UNKNOWN, TableError, TopicError, Tp};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Why a recovery cycle ended without swapping tables live.
#[derive(Error, Debug)]
enum RecoveryError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to build changelog channel: {0}")]
    Channel(#[from] TopicError),
    #[error("no changelog channel for table {0:?}")]
    MissingChannel(String),
    #[error("assignor reported active partitions outside the assignment")]
    ActivesOutsideAssignment,
}

/// Orchestrates changelog recovery and standbys for all tables.
///
/// Owned by the [`crate::App`]; one per worker. Tables must be registered
/// with [`TableManager::add`] before the first partition assignment.
pub struct TableManager {
    ctx: Arc<Context>,
    topics: Arc<TopicManager>,
    tables: RwLock<HashMap<String, Arc<dyn Collection>>>,
    /// Changelog channel per table name, acquired once per table.
    channels: StdMutex<HashMap<String, Arc<Topic>>>,
    /// Reverse index: changelog topic name → table.
    changelogs: RwLock<HashMap<String, Arc<dyn Collection>>>,
    /// Monotone maximum of every persisted and replayed offset seen.
    table_offsets: StdMutex<HashMap<Tp, i64>>,
    standbys: Mutex<HashMap<String, Arc<ChangelogReader>>>,
    revivers: Mutex<Vec<Arc<ChangelogReader>>>,
    recovery_started: watch::Sender<bool>,
    recovery_completed: watch::Sender<bool>,
    ongoing: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TableManager {
    /// Create a manager using the given fan-out plane for changelog
    /// channels.
    #[must_use]
    pub fn new(ctx: Arc<Context>, topics: Arc<TopicManager>) -> Self {
        let (recovery_started, _) = watch::channel(false);
        let (recovery_completed, _) = watch::channel(false);
        Self {
            ctx,
            topics,
            tables: RwLock::new(HashMap::new()),
            channels: StdMutex::new(HashMap::new()),
            changelogs: RwLock::new(HashMap::new()),
            table_offsets: StdMutex::new(HashMap::new()),
            standbys: Mutex::new(HashMap::new()),
            revivers: Mutex::new(Vec::new()),
            recovery_started,
            recovery_completed,
            ongoing: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a table.
    ///
    /// # Errors
    ///
    /// - [`TableError::AddTooLate`] once recovery has started
    /// - [`TableError::DuplicateTable`] on a name collision
    pub fn add(&self, table: Arc<dyn Collection>) -> Result<(), TableError> {
        let name = table.name().to_string();
        if *self.recovery_started.borrow() {
            return Err(TableError::AddTooLate { name });
        }
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if tables.contains_key(&name) {
            return Err(TableError::DuplicateTable { name });
        }
        tables.insert(name, table);
        Ok(())
    }

    /// Look up a registered table by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Collection>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of every known changelog topic.
    pub fn changelog_topics(&self) -> BTreeSet<String> {
        self.changelogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of the per-partition table offsets (monotone maxima of all
    /// persisted and replayed offsets observed so far).
    pub fn table_offsets(&self) -> HashMap<Tp, i64> {
        self.table_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a recovery cycle has ever started (the add-table deadline).
    pub fn recovery_started(&self) -> bool {
        *self.recovery_started.borrow()
    }

    /// Whether the most recent recovery cycle completed successfully.
    pub fn recovery_completed(&self) -> bool {
        *self.recovery_completed.borrow()
    }

    /// Wait until the current recovery cycle completes.
    pub async fn wait_recovery_completed(&self) {
        let mut completed = self.recovery_completed.subscribe();
        let _ = completed.wait_for(|done| *done).await;
    }

    /// Number of running standby readers.
    pub async fn standby_count(&self) -> usize {
        self.standbys.lock().await.len()
    }

    /// Start a background recovery cycle for a new partition assignment.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::RecoveryInFlight`] if a previous cycle has not
    /// been aborted or completed; assignment callbacks must never overlap.
    pub async fn on_partitions_assigned(
        self: &Arc<Self>,
        assigned: HashSet<Tp>,
    ) -> Result<(), TableError> {
        tracing::info!(state = "PARTITIONS_ASSIGNED", count = assigned.len(), "partitions assigned");
        {
            let ongoing = self.ongoing.lock().await;
            let revivers = self.revivers.lock().await;
            if ongoing.as_ref().is_some_and(|task| !task.is_finished()) || !revivers.is_empty() {
                return Err(TableError::RecoveryInFlight);
            }
        }
        self.recovery_completed.send_replace(false);
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move { manager.recover(assigned).await });
        *self.ongoing.lock().await = Some(task);
        tracing::info!("triggered recovery in background");
        Ok(())
    }

    /// Abort any in-flight recovery, stop standbys and forward the
    /// revocation to every table. Stages are annotated on a flight recorder
    /// with the configured timeout; slow stages are logged, not
    /// interrupted.
    pub async fn on_partitions_revoked(&self, revoked: HashSet<Tp>) {
        tracing::info!(state = "PARTITIONS_REVOKED", count = revoked.len(), "partitions revoked");
        let recorder = FlightRecorder::new("on_partitions_revoked", self.ctx.config.revoke_timeout);
        recorder.note("aborting ongoing recovery");
        self.maybe_abort_ongoing_recovery().await;
        recorder.note("stopping standbys");
        self.stop_standbys().await;
        recorder.note("notifying tables of revoked partitions");
        for table in self.tables_snapshot() {
            table.on_partitions_revoked(revoked.clone()).await;
        }
        recorder.note("done revoking");
    }

    /// Stop the manager: abort recovery, stop standbys, stop every table.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.maybe_abort_ongoing_recovery().await;
        self.stop_standbys().await;
        for table in self.tables_snapshot() {
            table.stop().await;
        }
    }

    fn tables_snapshot(&self) -> Vec<Arc<dyn Collection>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn is_changelog_tp(&self, tp: &Tp) -> bool {
        self.changelogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&tp.topic)
    }

    /// Fold a table's persisted offsets into the monotone offset map.
    fn sync_persisted_offsets(&self, table: &Arc<dyn Collection>, tps: &HashSet<Tp>) {
        let mut offsets = self
            .table_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for tp in tps {
            if let Some(persisted) = table.persisted_offset(tp) {
                let entry = offsets.entry(tp.clone()).or_insert(OFFSET_UNKNOWN);
                if persisted > *entry {
                    *entry = persisted;
                }
            }
        }
    }

    /// Fold a reader's applied offsets into the monotone offset map.
    fn sync_offsets(&self, reader: &ChangelogReader) {
        let reader_offsets = reader.offsets();
        tracing::debug!(reader = %reader.label(), offsets = reader_offsets.len(), "syncing offsets");
        let mut offsets = self
            .table_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (tp, offset) in reader_offsets {
            if offset >= 0 {
                let entry = offsets.entry(tp).or_insert(OFFSET_UNKNOWN);
                if offset > *entry {
                    *entry = offset;
                }
            }
        }
    }

    /// Acquire changelog channels for new tables, refresh the reverse
    /// index, and pause every assigned changelog partition on the live
    /// consumer so the main fan-out does not consume them.
    async fn update_channels(&self) -> Result<(), RecoveryError> {
        tracing::info!(state = "UPDATE", "updating changelog channels");
        for table in self.tables_snapshot() {
            let name = table.name().to_string();
            let missing = {
                let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
                !channels.contains_key(&name)
            };
            if missing {
                let spec = table.changelog_topic();
                let topic = Topic::builder(Arc::clone(&self.ctx))
                    .topic(spec.topic.clone())
                    .partitions(spec.partitions)
                    .compacting(true)
                    .build()?;
                let channel = self.topics.acquire(&topic);
                self.channels
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name, channel);
            }
            self.changelogs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(table.changelog_topic().topic, table);
        }
        let paused: HashSet<Tp> = self
            .ctx
            .consumer()
            .assignment()
            .into_iter()
            .filter(|tp| self.is_changelog_tp(tp))
            .collect();
        if !paused.is_empty() {
            self.ctx.consumer().pause_partitions(paused).await?;
        }
        Ok(())
    }

    fn channel_for(&self, table: &Arc<dyn Collection>) -> Result<Arc<Topic>, RecoveryError> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table.name())
            .cloned()
            .ok_or_else(|| RecoveryError::MissingChannel(table.name().to_string()))
    }

    /// Seed a reader's start offsets: the monotone maximum of what the
    /// store persisted and what earlier readers replayed.
    fn seed_offsets(&self, table: &Arc<dyn Collection>, tps: &HashSet<Tp>) -> HashMap<Tp, i64> {
        self.sync_persisted_offsets(table, tps);
        let offsets = self
            .table_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tps.iter()
            .filter_map(|tp| offsets.get(tp).map(|offset| (tp.clone(), *offset)))
            .collect()
    }

    fn create_reviver(
        &self,
        table: &Arc<dyn Collection>,
        tps: &HashSet<Tp>,
    ) -> Result<Arc<ChangelogReader>, RecoveryError> {
        let changelog = table.changelog_topic().topic;
        let table_tps: HashSet<Tp> = tps
            .iter()
            .filter(|tp| tp.topic == changelog)
            .cloned()
            .collect();
        let seeded = self.seed_offsets(table, &table_tps);
        let channel = self.channel_for(table)?;
        Ok(Arc::new(ChangelogReader::new(
            Arc::clone(table),
            channel,
            Arc::clone(&self.ctx),
            table_tps,
            seeded,
        )))
    }

    /// Replay every table's changelog up to its highwater. Returns whether
    /// all readers fully recovered.
    async fn recover_changelogs(&self, tps: HashSet<Tp>) -> Result<bool, RecoveryError> {
        tracing::info!(state = "RECOVER", "restoring state from changelog topics");
        let mut revivers = Vec::new();
        for table in self.tables_snapshot() {
            revivers.push(self.create_reviver(&table, &tps)?);
        }
        *self.revivers.lock().await = revivers.clone();
        for reviver in &revivers {
            reviver.start().await;
            tracing::info!(reader = %reviver.label(), "started restoring");
        }
        tracing::info!("waiting for restore to finish");
        futures::future::join_all(revivers.iter().map(|r| r.wait_done_reading())).await;
        tracing::info!("done reading all changelogs");
        for reviver in &revivers {
            self.sync_offsets(reviver);
        }
        for reviver in &revivers {
            reviver.stop().await;
            tracing::info!(reader = %reviver.label(), "stopped restoring");
        }
        Ok(revivers.iter().all(|r| r.recovered()))
    }

    /// Start a standby reader per table owning any of `tps`.
    async fn start_standbys(&self, tps: HashSet<Tp>) -> Result<(), RecoveryError> {
        tracing::info!(state = "START_STANDBYS", count = tps.len(), "starting standbys");
        let mut standbys = self.standbys.lock().await;
        if !standbys.is_empty() {
            tracing::error!("standbys already running, refusing to start more");
            return Ok(());
        }
        let grouped = self.group_table_tps(&tps);
        for (table, table_tps) in grouped {
            let seeded = self.seed_offsets(&table, &table_tps);
            let channel = self.channel_for(&table)?;
            let standby = Arc::new(ChangelogReader::standby(
                Arc::clone(&table),
                channel,
                Arc::clone(&self.ctx),
                table_tps,
                seeded,
            ));
            standby.start().await;
            tracing::info!(reader = %standby.label(), "started standby");
            standbys.insert(table.name().to_string(), standby);
        }
        Ok(())
    }

    /// Stop every standby, folding its offsets into the table offsets.
    async fn stop_standbys(&self) {
        let drained: Vec<Arc<ChangelogReader>> = {
            let mut standbys = self.standbys.lock().await;
            standbys.drain().map(|(_, standby)| standby).collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::info!(state = "STOP_STANDBYS", count = drained.len(), "stopping standbys");
        for standby in drained {
            tracing::info!(reader = %standby.label(), "stopping standby");
            standby.stop().await;
            self.sync_offsets(&standby);
        }
    }

    /// Group changelog partitions by their owning table.
    fn group_table_tps(&self, tps: &HashSet<Tp>) -> Vec<(Arc<dyn Collection>, HashSet<Tp>)> {
        let changelogs = self
            .changelogs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut grouped: HashMap<String, (Arc<dyn Collection>, HashSet<Tp>)> = HashMap::new();
        for tp in tps {
            if let Some(table) = changelogs.get(&tp.topic) {
                grouped
                    .entry(table.name().to_string())
                    .or_insert_with(|| (Arc::clone(table), HashSet::new()))
                    .1
                    .insert(tp.clone());
            }
        }
        grouped.into_values().collect()
    }

    async fn recover(self: Arc<Self>, assigned: HashSet<Tp>) {
        if let Err(e) = self.try_recover(&assigned).await {
            tracing::warn!(error = %e, "recovery interrupted");
        }
        self.revivers.lock().await.clear();
    }

    async fn try_recover(&self, assigned: &HashSet<Tp>) -> Result<(), RecoveryError> {
        let standby_tps = self.ctx.assignor().assigned_standbys();
        let active_tps = self.ctx.assignor().assigned_actives();
        if !active_tps.is_subset(assigned) {
            return Err(RecoveryError::ActivesOutsideAssignment);
        }
        tracing::info!(
            actives = active_tps.len(),
            standbys = standby_tps.len(),
            "new assignments found"
        );
        self.recovery_started.send_replace(true);
        self.update_channels().await?;
        for table in self.tables_snapshot() {
            table.on_partitions_assigned(assigned.clone()).await;
        }
        let did_recover = self.recover_changelogs(active_tps).await?;

        if did_recover && !self.stopped.load(Ordering::Acquire) {
            tracing::info!("restore complete");
            let tables = self.tables_snapshot();
            futures::future::join_all(tables.iter().map(|t| t.call_recover_callbacks())).await;
            self.ctx.consumer().perform_seek().await?;
            self.start_standbys(standby_tps).await?;
            futures::future::join_all(tables.iter().map(|t| t.maybe_start())).await;
            self.recovery_completed.send_replace(true);
            let resume: HashSet<Tp> = assigned
                .iter()
                .filter(|tp| !self.is_changelog_tp(tp))
                .cloned()
                .collect();
            self.ctx.consumer().resume_partitions(resume).await?;
            tracing::info!("new assignments handled");
        } else {
            tracing::info!("recovery interrupted");
        }
        Ok(())
    }

    /// Abort an in-flight recovery: stop every reviver concurrently, then
    /// wait for the recovery task itself. Safe to call from the revocation
    /// path and from [`TableManager::stop`].
    async fn maybe_abort_ongoing_recovery(&self) {
        let task = self.ongoing.lock().await.take();
        if let Some(task) = task {
            if !task.is_finished() {
                tracing::info!("aborting ongoing recovery to start over");
                let revivers: Vec<Arc<ChangelogReader>> = self.revivers.lock().await.clone();
                if !revivers.is_empty() {
                    futures::future::join_all(revivers.iter().map(|r| r.stop())).await;
                }
                tracing::info!("waiting for ongoing recovery to finish");
                let _ = task.await;
                tracing::info!("ongoing recovery halted");
            }
        }
    }
}
