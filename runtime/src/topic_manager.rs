//! Single-consumer fan-out plane.
//!
//! One broker consumer serves every channel in the worker. The manager
//! tracks the set of subscribing channels, keeps the consumer's
//! subscription equal to the union of their topics, and multiplexes each
//! delivered record to every channel subscribed to its topic.
//!
//! Three background tasks:
//!
//! - **subscriber**: waits a grace period after start so all processors can
//!   register their topics, issues one `subscribe` for the union, then
//!   re-subscribes whenever the subscriber set changes;
//! - **fan-out**: drives the consumer's record stream, bulk-increments each
//!   record's reference count by the subscriber count *before* any delivery
//!   and enqueues one delivery unit per channel (blocking when the queue is
//!   full — backpressure on the consume loop);
//! - **gatherer**: races the enqueued delivery units, bounding how many are
//!   in flight at once.

use crate::app::Context;
use crate::topic::Topic;
use freshet_core::{BrokerError, Message, Tp};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// Lookup from broker topic name to subscribing channels.
#[derive(Default)]
struct TopicIndex {
    by_name: HashMap<String, Vec<Arc<Topic>>>,
    patterns: Vec<Arc<Topic>>,
}

impl TopicIndex {
    fn channels_for(&self, topic: &str) -> Vec<Arc<Topic>> {
        let mut channels = self.by_name.get(topic).cloned().unwrap_or_default();
        for channel in &self.patterns {
            if channel.matches(topic) {
                channels.push(Arc::clone(channel));
            }
        }
        channels
    }
}

/// One delivery of one message to one channel.
type DeliveryUnit = (Arc<Topic>, Arc<Message>);

/// Owns the worker's single consumer and fans consumed records out to all
/// subscribing channels.
pub struct TopicManager {
    ctx: Arc<Context>,
    subscribers: StdMutex<HashMap<u64, Arc<Topic>>>,
    index: RwLock<TopicIndex>,
    pending_tx: mpsc::Sender<DeliveryUnit>,
    pending_rx: Mutex<Option<mpsc::Receiver<DeliveryUnit>>>,
    /// Generation counter bumped on every subscriber-set change. Changes
    /// flagged before the subscriber task's first subscribe are absorbed
    /// into it rather than triggering a second one.
    subscription_changed: watch::Sender<u64>,
    subscription_applied: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TopicManager {
    /// Create a manager bound to the worker context's consumer.
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(ctx.config.fanout_queue_depth);
        let (subscription_changed, _) = watch::channel(0);
        let (subscription_applied, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            subscribers: StdMutex::new(HashMap::new()),
            index: RwLock::new(TopicIndex::default()),
            pending_tx,
            pending_rx: Mutex::new(Some(pending_rx)),
            subscription_changed,
            subscription_applied,
            shutdown,
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Register a channel as a subscriber. Idempotent.
    pub fn add(&self, channel: Arc<Topic>) {
        let inserted = {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.insert(channel.id(), channel).is_none()
        };
        if inserted {
            self.flag_changes();
        }
    }

    /// Remove a channel from the subscriber set. Idempotent.
    pub fn discard(&self, channel: &Arc<Topic>) {
        let removed = {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.remove(&channel.id()).is_some()
        };
        if removed {
            self.flag_changes();
        }
    }

    /// Turn a topic description into a consumable channel: clone it as an
    /// iterator with its own delivery queue and register the clone.
    pub fn acquire(&self, topic: &Topic) -> Arc<Topic> {
        let channel = Arc::new(topic.clone_as_iterator(self.ctx.config.channel_queue_depth));
        self.add(Arc::clone(&channel));
        channel
    }

    /// Number of registered subscriber channels.
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many subscription-change events have been flagged.
    pub fn subscription_changes(&self) -> u64 {
        *self.subscription_changed.borrow()
    }

    /// Wait until the current subscriber set has been applied to the broker
    /// consumer.
    pub async fn wait_for_subscriptions(&self) {
        let mut applied = self.subscription_applied.subscribe();
        let _ = applied.wait_for(|done| *done).await;
    }

    /// Commit offsets through the worker's consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Commit`] if the broker rejects the commit.
    pub async fn commit(&self, offsets: HashMap<Tp, i64>) -> Result<bool, BrokerError> {
        self.ctx.consumer().commit(offsets).await
    }

    /// Partition assignment notification. State lives in the table manager;
    /// this is a pass-through.
    pub fn on_partitions_assigned(&self, assigned: &HashSet<Tp>) {
        tracing::debug!(count = assigned.len(), "fan-out plane saw partition assignment");
    }

    /// Partition revocation notification. Pass-through, as above.
    pub fn on_partitions_revoked(&self, revoked: &HashSet<Tp>) {
        tracing::debug!(count = revoked.len(), "fan-out plane saw partition revocation");
    }

    /// Spawn the subscriber, fan-out and gatherer tasks.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(Arc::clone(self).subscriber_task()));
        tasks.push(tokio::spawn(Arc::clone(self).gatherer_task()));
        tasks.push(tokio::spawn(Arc::clone(self).fanout_task()));
    }

    /// Stop the background tasks.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Fan one consumed record out to every subscribing channel.
    ///
    /// The reference count is incremented by the full subscriber count
    /// before any delivery unit is enqueued, so no channel's release can
    /// reach zero while siblings are still waiting.
    pub async fn on_message(&self, message: Arc<Message>) {
        let channels = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index.channels_for(&message.topic)
        };
        if channels.is_empty() {
            tracing::trace!(topic = %message.topic, "no subscribers for message");
            return;
        }
        message.incref_bulk(channels.len());
        self.ctx.sensors().on_message_in(&message.tp(), message.offset);
        let enqueues = channels.into_iter().map(|channel| {
            let tx = self.pending_tx.clone();
            let message = Arc::clone(&message);
            async move {
                if tx.send((channel, message)).await.is_err() {
                    tracing::debug!("gatherer stopped, dropping delivery");
                }
            }
        });
        futures::future::join_all(enqueues).await;
    }

    fn flag_changes(&self) {
        self.subscription_applied.send_replace(false);
        self.subscription_changed.send_modify(|generation| *generation += 1);
    }

    /// Rebuild the topic index from the subscriber set, returning the
    /// subscription strings for the consumer (sorted for determinism).
    fn rebuild_index(&self) -> Vec<String> {
        let subscribers: Vec<Arc<Topic>> = {
            let subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.values().cloned().collect()
        };
        let mut index = TopicIndex::default();
        let mut keys = BTreeSet::new();
        for channel in subscribers {
            for key in channel.subscription_keys() {
                keys.insert(key);
            }
            if channel.pattern().is_some() {
                index.patterns.push(channel);
            } else {
                for name in channel.topics() {
                    index
                        .by_name
                        .entry(name.clone())
                        .or_default()
                        .push(Arc::clone(&channel));
                }
            }
        }
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        keys.into_iter().collect()
    }

    async fn resubscribe(&self) {
        let keys = self.rebuild_index();
        tracing::info!(topics = ?keys, "updating consumer subscription");
        match self.ctx.consumer().subscribe(keys).await {
            Ok(()) => {
                self.subscription_applied.send_replace(true);
            }
            Err(e) => tracing::error!(error = %e, "subscription failed"),
        }
    }

    async fn subscriber_task(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut changed = self.subscription_changed.subscribe();
        // Give every processor a chance to register its topics so the first
        // subscribe covers them all.
        tokio::select! {
            () = tokio::time::sleep(self.ctx.config.subscriber_grace) => {}
            _ = shutdown.changed() => return,
        }
        // Changes flagged before this point are part of the first
        // subscription.
        changed.borrow_and_update();
        self.resubscribe().await;
        loop {
            tokio::select! {
                result = changed.changed() => {
                    if result.is_err() {
                        break;
                    }
                    changed.borrow_and_update();
                    self.resubscribe().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn fanout_task(self: Arc<Self>) {
        let mut stream = self.ctx.consumer().messages();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(message)) => self.on_message(message).await,
                    Some(Err(e)) => tracing::error!(error = %e, "consumer stream error"),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("fan-out task exiting");
    }

    async fn gatherer_task(self: Arc<Self>) {
        let Some(mut pending) = self.pending_rx.lock().await.take() else {
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        let mut in_flight = FuturesUnordered::new();
        loop {
            // In-flight deliveries are driven before new units are pulled,
            // so deliveries to one channel start in queue order.
            tokio::select! {
                biased;
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                unit = pending.recv() => match unit {
                    Some((channel, message)) => {
                        in_flight.push(async move { channel.deliver(message).await });
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        // Finish deliveries already pulled off the queue.
        while in_flight.next().await.is_some() {}
        tracing::debug!("gatherer task exiting");
    }
}
