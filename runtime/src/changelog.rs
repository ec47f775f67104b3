//! Changelog replay and standby readers.
//!
//! A [`ChangelogReader`] brings one table's partitions up to the broker
//! highwater captured when it starts: it seeks each partition to the record
//! after the last applied offset, resumes exactly those partitions on the
//! shared consumer, applies every record delivered on the table's changelog
//! channel and reports "done reading" once all partitions reached their
//! highwater. The standby variant never considers itself done and tails
//! until stopped.
//!
//! Readers re-pause their partitions on exit so the fan-out plane stays
//! quiet on changelog partitions between recovery cycles.

use crate::app::Context;
use crate::topic::Topic;
use freshet_core::{BrokerError, Collection, OFFSET_UNKNOWN, Tp};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Bounded replay task for one table's changelog partitions, or an
/// unbounded standby tail.
pub struct ChangelogReader {
    table: Arc<dyn Collection>,
    channel: Arc<Topic>,
    ctx: Arc<Context>,
    tps: HashSet<Tp>,
    standby: bool,
    offsets: StdMutex<HashMap<Tp, i64>>,
    highwaters: StdMutex<HashMap<Tp, i64>>,
    caught_up: AtomicBool,
    faulted: AtomicBool,
    done: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangelogReader {
    /// Create a bounded reader that replays `tps` up to their highwaters.
    ///
    /// `offsets` maps each partition to the last offset already applied to
    /// the table ([`OFFSET_UNKNOWN`] or absent to start from the earliest
    /// record).
    #[must_use]
    pub fn new(
        table: Arc<dyn Collection>,
        channel: Arc<Topic>,
        ctx: Arc<Context>,
        tps: HashSet<Tp>,
        offsets: HashMap<Tp, i64>,
    ) -> Self {
        Self::build(table, channel, ctx, tps, offsets, false)
    }

    /// Create a standby reader: identical, but it tails forever.
    #[must_use]
    pub fn standby(
        table: Arc<dyn Collection>,
        channel: Arc<Topic>,
        ctx: Arc<Context>,
        tps: HashSet<Tp>,
        offsets: HashMap<Tp, i64>,
    ) -> Self {
        Self::build(table, channel, ctx, tps, offsets, true)
    }

    fn build(
        table: Arc<dyn Collection>,
        channel: Arc<Topic>,
        ctx: Arc<Context>,
        tps: HashSet<Tp>,
        offsets: HashMap<Tp, i64>,
        standby: bool,
    ) -> Self {
        let mut seeded = offsets;
        for tp in &tps {
            seeded.entry(tp.clone()).or_insert(OFFSET_UNKNOWN);
        }
        let (done, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            table,
            channel,
            ctx,
            tps,
            standby,
            offsets: StdMutex::new(seeded),
            highwaters: StdMutex::new(HashMap::new()),
            caught_up: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            done,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Display label for logs.
    #[must_use]
    pub fn label(&self) -> String {
        let kind = if self.standby {
            "StandbyReader"
        } else {
            "ChangelogReader"
        };
        format!("{kind}({}, tps={})", self.table.name(), self.tps.len())
    }

    /// The partitions this reader owns.
    #[must_use]
    pub fn tps(&self) -> &HashSet<Tp> {
        &self.tps
    }

    /// Last applied offset per partition ([`OFFSET_UNKNOWN`] where nothing
    /// was applied yet).
    pub fn offsets(&self) -> HashMap<Tp, i64> {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether every partition was brought to its highwater without error.
    /// Always false for standby readers.
    pub fn recovered(&self) -> bool {
        !self.standby
            && self.caught_up.load(Ordering::Acquire)
            && !self.faulted.load(Ordering::Acquire)
    }

    /// Spawn the read loop.
    pub async fn start(self: &Arc<Self>) {
        let reader = Arc::clone(self);
        let task = tokio::spawn(reader.run());
        *self.handle.lock().await = Some(task);
    }

    /// Stop the read loop promptly and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.handle.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Wait until the reader has finished reading (reached every highwater,
    /// faulted, or was stopped).
    pub async fn wait_done_reading(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    async fn run(self: Arc<Self>) {
        if let Err(e) = self.read_changelog().await {
            tracing::warn!(reader = %self.label(), error = %e, "changelog read failed");
            self.faulted.store(true, Ordering::Release);
        }
        // Keep the fan-out plane quiet on our partitions between cycles.
        if let Err(e) = self.ctx.consumer().pause_partitions(self.tps.clone()).await {
            tracing::warn!(reader = %self.label(), error = %e, "failed to re-pause partitions");
        }
        self.done.send_replace(true);
    }

    async fn read_changelog(&self) -> Result<(), BrokerError> {
        let highwaters = self.capture_highwaters().await?;
        self.seek_tps().await?;
        self.ctx
            .consumer()
            .resume_partitions(self.tps.clone())
            .await?;
        tracing::info!(reader = %self.label(), "reading changelog");

        let mut remaining = self.remaining_tps(&highwaters);
        if remaining.is_empty() && !self.standby {
            self.caught_up.store(true, Ordering::Release);
            return Ok(());
        }

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                message = self.channel.next_message() => {
                    let Some(message) = message else { break };
                    let tp = message.tp();
                    if !self.tps.contains(&tp) {
                        message.decref();
                        continue;
                    }
                    if let Err(e) = self.table.apply_changelog(&message).await {
                        tracing::error!(
                            reader = %self.label(),
                            tp = %tp,
                            offset = message.offset,
                            error = %e,
                            "failed to apply changelog record"
                        );
                        self.faulted.store(true, Ordering::Release);
                        message.decref();
                        break;
                    }
                    self.record_offset(&tp, message.offset);
                    message.decref();
                    if !self.standby {
                        if let Some(hw) = highwaters.get(&tp) {
                            if message.offset >= *hw {
                                remaining.remove(&tp);
                            }
                        }
                        if remaining.is_empty() {
                            self.caught_up.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }

    async fn capture_highwaters(&self) -> Result<HashMap<Tp, i64>, BrokerError> {
        let mut highwaters = HashMap::new();
        for tp in &self.tps {
            if let Some(hw) = self.ctx.consumer().highwater(tp.clone()).await? {
                highwaters.insert(tp.clone(), hw);
            }
        }
        *self
            .highwaters
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = highwaters.clone();
        Ok(highwaters)
    }

    /// Seek every partition to the record after the last applied offset.
    async fn seek_tps(&self) -> Result<(), BrokerError> {
        let starts: Vec<(Tp, i64)> = {
            let offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
            self.tps
                .iter()
                .map(|tp| {
                    let last = offsets.get(tp).copied().unwrap_or(OFFSET_UNKNOWN);
                    (tp.clone(), (last + 1).max(0))
                })
                .collect()
        };
        for (tp, next) in starts {
            tracing::debug!(reader = %self.label(), tp = %tp, offset = next, "seeking");
            self.ctx.consumer().seek(tp, next).await?;
        }
        Ok(())
    }

    fn record_offset(&self, tp: &Tp, offset: i64) {
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = offsets.entry(tp.clone()).or_insert(OFFSET_UNKNOWN);
        if offset > *entry {
            *entry = offset;
        }
    }

    /// Partitions that still have records to replay before their highwater.
    fn remaining_tps(&self, highwaters: &HashMap<Tp, i64>) -> HashSet<Tp> {
        let offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        self.tps
            .iter()
            .filter(|tp| match highwaters.get(*tp) {
                // Empty partition: nothing to read.
                None => false,
                Some(hw) => offsets.get(*tp).copied().unwrap_or(OFFSET_UNKNOWN) < *hw,
            })
            .cloned()
            .collect()
    }
}
