//! Per-source-message outbox.
//!
//! When a processor produces downstream messages while handling an input,
//! those outputs must not become visible until the input's offset is
//! committed. The buffer keys every pending output by the source
//! topic-partition and offset; committing that offset drains and publishes
//! the bucket, revoking the partition drops it unpublished.
//!
//! This is a best-effort, non-transactional "effectively-once" discipline:
//! commit of the source is not undone when an attached publish fails.

use crate::app::Context;
use crate::events::current_event;
use crate::message::{FutureMessage, SendHandle, SendTarget, SentCallback};
use crate::topic::Topic;
use freshet_core::{BrokerError, Message, PublishError, Tp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pending attachments per source partition, keyed by source offset.
///
/// Offsets are unique per source record, so ordering among entries of one
/// offset does not matter; the sorted map keeps a future range-drain cheap.
type PendingByOffset = BTreeMap<i64, Vec<FutureMessage>>;

/// The per-source-message outbox (attachment buffer).
///
/// Owned by the [`crate::App`]; one per worker. All mutation happens behind
/// one async lock, and commit removes a bucket *before* publishing it, so a
/// concurrent commit of the same offset is a no-op.
pub struct Attachments {
    ctx: Arc<Context>,
    pending: Mutex<HashMap<Tp, PendingByOffset>>,
}

impl Attachments {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a message, attaching it to the current event when one is in
    /// scope.
    ///
    /// With a current event (a processor is handling an input) and `force`
    /// unset, the message is buffered against the input's offset and
    /// published on commit. Otherwise it is published immediately and the
    /// returned handle is already resolved.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] when the immediate publish path fails; the
    /// attached path reports failures through the handle instead.
    pub async fn maybe_put(
        &self,
        channel: SendTarget,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        partition: Option<i32>,
        callback: Option<SentCallback>,
        force: bool,
    ) -> Result<SendHandle, BrokerError> {
        if !force {
            if let Some(event) = current_event() {
                return Ok(event.attach(channel, key, value, partition, callback).await);
            }
        }
        let topic = self.resolve_channel(&channel)?;
        let (fm, handle) = topic.as_future_message(key, value, partition, callback);
        topic.publish_message(fm, true).await?;
        Ok(handle)
    }

    /// Attach an outbound message to a source message's offset.
    ///
    /// The handle resolves once the source offset is committed and the
    /// publish completes (or fails).
    pub async fn put(
        &self,
        source: &Message,
        channel: SendTarget,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        partition: Option<i32>,
        callback: Option<SentCallback>,
    ) -> SendHandle {
        let (fm, handle) = match self.resolve_channel(&channel) {
            Ok(topic) => topic.as_future_message(key, value, partition, callback),
            Err(e) => {
                // Unresolvable destination: fail the handle, keep nothing.
                let (fm, handle) = FutureMessage::new(
                    crate::message::PendingMessage {
                        channel,
                        key,
                        value,
                        partition,
                    },
                    callback,
                );
                fm.resolve(Err(PublishError::Failed {
                    topic: String::new(),
                    reason: e.to_string(),
                }));
                return handle;
            }
        };
        let tp = source.tp();
        tracing::trace!(tp = %tp, offset = source.offset, "attaching message to source offset");
        let mut pending = self.pending.lock().await;
        pending
            .entry(tp)
            .or_default()
            .entry(source.offset)
            .or_default()
            .push(fm);
        handle
    }

    /// Publish every message attached to `(tp, offset)`.
    ///
    /// The bucket is removed before any publish is awaited, so committing
    /// the same offset twice publishes at most once. Individual publish
    /// failures are logged and reported through the messages' handles; they
    /// do not undo the source commit.
    pub async fn commit(&self, tp: &Tp, offset: i64) {
        let attached = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(tp) {
                Some(by_offset) => by_offset.remove(&offset),
                None => None,
            }
        };
        let Some(attached) = attached else { return };
        tracing::debug!(tp = %tp, offset, count = attached.len(), "publishing attached messages");
        let publishes = attached.into_iter().map(|fm| self.publish_attached(fm));
        futures::future::join_all(publishes).await;
    }

    /// Drop every pending attachment for the revoked partitions without
    /// publishing. Their handles resolve with [`PublishError::Revoked`].
    pub async fn revoke(&self, revoked: &HashSet<Tp>) {
        let mut dropped = Vec::new();
        {
            let mut pending = self.pending.lock().await;
            for tp in revoked {
                if let Some(by_offset) = pending.remove(tp) {
                    for (_, fms) in by_offset {
                        for fm in fms {
                            dropped.push((tp.clone(), fm));
                        }
                    }
                }
            }
        }
        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), "dropping attachments for revoked partitions");
        }
        for (tp, fm) in dropped {
            fm.resolve(Err(PublishError::Revoked { tp }));
        }
    }

    /// Number of attachments currently buffered for a partition.
    pub async fn pending_count(&self, tp: &Tp) -> usize {
        let pending = self.pending.lock().await;
        pending
            .get(tp)
            .map_or(0, |by_offset| by_offset.values().map(Vec::len).sum())
    }

    /// Whether any attachment is buffered for `(tp, offset)`.
    pub async fn has_pending(&self, tp: &Tp, offset: i64) -> bool {
        let pending = self.pending.lock().await;
        pending
            .get(tp)
            .is_some_and(|by_offset| by_offset.contains_key(&offset))
    }

    async fn publish_attached(&self, fm: FutureMessage) {
        match self.resolve_channel(&fm.message().channel) {
            Ok(topic) => {
                if let Err(e) = topic.publish_message(fm, false).await {
                    tracing::warn!(error = %e, "attached publish failed");
                }
            }
            Err(e) => {
                fm.resolve(Err(PublishError::Failed {
                    topic: String::new(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn resolve_channel(&self, target: &SendTarget) -> Result<Arc<Topic>, BrokerError> {
        match target {
            SendTarget::Channel(topic) => Ok(Arc::clone(topic)),
            SendTarget::Name(name) => Topic::builder(Arc::clone(&self.ctx))
                .topic(name.clone())
                .build()
                .map(Arc::new)
                .map_err(|e| BrokerError::Producer(e.to_string())),
        }
    }
}
