//! Topic descriptions and subscription channels.
//!
//! A [`Topic`] describes one or more broker topics — a list of names or a
//! regex pattern, never both — together with partitioning, replication and
//! broker-level configuration. The same type doubles as a subscription
//! channel: acquiring it through the topic manager yields a clone marked as
//! iterator, with a bounded delivery queue the fan-out plane feeds.

use crate::app::Context;
use crate::message::{FutureMessage, PendingMessage, SendHandle, SendTarget, SentCallback};
use freshet_core::{BrokerError, Message, OFFSET_UNKNOWN, PublishError, RecordMetadata, TopicError};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Declarative description of one or more broker topics, usable as a
/// subscription channel once acquired from the topic manager.
///
/// # Example
///
/// ```ignore
/// let orders = app.topic().topic("orders").partitions(16).build()?;
/// let retries = orders.derive().suffix("-retry").build()?;
/// ```
pub struct Topic {
    ctx: Arc<Context>,
    id: u64,
    topics: Vec<String>,
    pattern: Option<Regex>,
    partitions: i32,
    replicas: i32,
    retention: Option<Duration>,
    compacting: Option<bool>,
    deleting: Option<bool>,
    config: HashMap<String, String>,
    acks: bool,
    declared: AtomicBool,
    is_iterator: bool,
    deliver_tx: Option<mpsc::Sender<Arc<Message>>>,
    queue_rx: Option<Mutex<mpsc::Receiver<Arc<Message>>>>,
}

impl Topic {
    /// Start describing a topic.
    #[must_use]
    pub fn builder(ctx: Arc<Context>) -> TopicBuilder {
        TopicBuilder::new(ctx)
    }

    /// The topic names this descriptor covers (empty for pattern topics).
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// The subscription pattern, for pattern topics.
    #[must_use]
    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }

    /// Partition count used when declaring these topics.
    #[must_use]
    pub fn partitions(&self) -> i32 {
        self.partitions
    }

    /// Replication factor used when declaring these topics.
    #[must_use]
    pub fn replicas(&self) -> i32 {
        self.replicas
    }

    /// Message retention, when overridden.
    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    /// Whether these topics use log compaction.
    #[must_use]
    pub fn compacting(&self) -> Option<bool> {
        self.compacting
    }

    /// Whether these topics allow deletes.
    #[must_use]
    pub fn deleting(&self) -> Option<bool> {
        self.deleting
    }

    /// Topic-level broker configuration.
    #[must_use]
    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    /// True for clones used as message sinks rather than descriptors.
    #[must_use]
    pub fn is_iterator(&self) -> bool {
        self.is_iterator
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The first topic name, if this is a named topic.
    #[must_use]
    pub fn first_name(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }

    /// The subscription strings this channel contributes to the consumer:
    /// the topic names, or the `^`-anchored pattern.
    #[must_use]
    pub fn subscription_keys(&self) -> Vec<String> {
        match &self.pattern {
            Some(pattern) => {
                let src = pattern.as_str();
                if src.starts_with('^') {
                    vec![src.to_string()]
                } else {
                    vec![format!("^{src}")]
                }
            }
            None => self.topics.clone(),
        }
    }

    /// Whether a broker topic name matches this description.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(topic),
            None => self.topics.iter().any(|t| t == topic),
        }
    }

    /// Derive a new topic description from this one.
    ///
    /// The returned builder starts with this topic's full configuration;
    /// override only what should differ. A prefix or suffix rewrites every
    /// topic name and is rejected for pattern topics at build time.
    #[must_use]
    pub fn derive(&self) -> TopicBuilder {
        TopicBuilder {
            ctx: Arc::clone(&self.ctx),
            topics: self.topics.clone(),
            pattern: self.pattern.as_ref().map(|p| p.as_str().to_string()),
            partitions: Some(self.partitions),
            replicas: Some(self.replicas),
            retention: self.retention,
            compacting: self.compacting,
            deleting: self.deleting,
            config: self.config.clone(),
            acks: self.acks,
            prefix: String::new(),
            suffix: String::new(),
        }
    }

    /// Clone this description as an iterator channel with its own delivery
    /// queue. Used by the topic manager when a subscriber acquires the
    /// topic.
    pub(crate) fn clone_as_iterator(&self, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth);
        Self {
            ctx: Arc::clone(&self.ctx),
            id: next_channel_id(),
            topics: self.topics.clone(),
            pattern: self.pattern.clone(),
            partitions: self.partitions,
            replicas: self.replicas,
            retention: self.retention,
            compacting: self.compacting,
            deleting: self.deleting,
            config: self.config.clone(),
            acks: self.acks,
            declared: AtomicBool::new(self.declared.load(Ordering::Acquire)),
            is_iterator: true,
            deliver_tx: Some(tx),
            queue_rx: Some(Mutex::new(rx)),
        }
    }

    /// Build a pending message bound to this channel.
    #[must_use]
    pub fn as_future_message(
        self: &Arc<Self>,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        partition: Option<i32>,
        callback: Option<SentCallback>,
    ) -> (FutureMessage, SendHandle) {
        FutureMessage::new(
            PendingMessage {
                channel: SendTarget::Channel(Arc::clone(self)),
                key,
                value,
                partition,
            },
            callback,
        )
    }

    /// Declare every topic name with the broker, at most once per process.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CreateTopic`] if a declaration fails. The
    /// declared latch is set before declaring, so a failed first call is
    /// not retried by later calls.
    pub async fn maybe_declare(&self) -> Result<(), BrokerError> {
        if !self.declared.swap(true, Ordering::AcqRel) {
            self.declare().await?;
        }
        Ok(())
    }

    /// Declare every topic name with the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CreateTopic`] if creation fails.
    pub async fn declare(&self) -> Result<(), BrokerError> {
        let producer = self.ctx.maybe_start_producer().await?;
        for topic in &self.topics {
            tracing::debug!(topic = %topic, partitions = self.partitions, "declaring topic");
            producer
                .create_topic(topic, self.partitions, self.replicas, &self.config)
                .await?;
        }
        Ok(())
    }

    /// Publish a pending message through this channel.
    ///
    /// Resolves `fm` in every outcome. With `wait` the call returns the
    /// broker acknowledgement; without it the record is handed to the
    /// producer's buffer and the message resolves with an unknown offset.
    ///
    /// # Errors
    ///
    /// Returns the broker failure when the producer rejects the record; the
    /// same failure is reported through the message's send handle.
    pub async fn publish_message(
        &self,
        fm: FutureMessage,
        wait: bool,
    ) -> Result<Option<RecordMetadata>, BrokerError> {
        let dest = match fm
            .message()
            .channel
            .topic_name()
            .or_else(|| self.first_name())
        {
            Some(name) => name.to_string(),
            None => {
                let error = BrokerError::Producer(TopicError::NoTopicName.to_string());
                fm.resolve(Err(PublishError::Failed {
                    topic: String::new(),
                    reason: error.to_string(),
                }));
                return Err(error);
            }
        };
        tracing::debug!(topic = %dest, wait, "publishing message");

        let producer = match self.ctx.maybe_start_producer().await {
            Ok(producer) => producer,
            Err(e) => {
                fm.resolve(Err(PublishError::Failed {
                    topic: dest,
                    reason: e.to_string(),
                }));
                return Err(e);
            }
        };

        let key_size = fm.message().key.as_ref().map_or(0, Vec::len);
        let value_size = fm.message().value.as_ref().map_or(0, Vec::len);
        self.ctx.sensors().on_send_initiated(&dest, key_size, value_size);

        let partition = fm.message().partition;
        if wait {
            let sent = producer
                .send_and_wait(
                    &dest,
                    fm.message().key.as_deref(),
                    fm.message().value.as_deref(),
                    partition,
                )
                .await;
            match sent {
                Ok(metadata) => {
                    self.ctx.sensors().on_send_completed(&metadata);
                    fm.resolve(Ok(metadata.clone()));
                    Ok(Some(metadata))
                }
                Err(e) => {
                    fm.resolve(Err(PublishError::Failed {
                        topic: dest,
                        reason: e.to_string(),
                    }));
                    Err(e)
                }
            }
        } else {
            let sent = producer
                .send(
                    &dest,
                    fm.message().key.as_deref(),
                    fm.message().value.as_deref(),
                    partition,
                )
                .await;
            match sent {
                Ok(()) => {
                    fm.resolve(Ok(RecordMetadata {
                        topic: dest,
                        partition: partition.unwrap_or(-1),
                        offset: OFFSET_UNKNOWN,
                    }));
                    Ok(None)
                }
                Err(e) => {
                    fm.resolve(Err(PublishError::Failed {
                        topic: dest,
                        reason: e.to_string(),
                    }));
                    Err(e)
                }
            }
        }
    }

    /// Enqueue a consumed message into this channel's delivery queue.
    ///
    /// Blocks while the queue is full (backpressure on the fan-out plane).
    /// Non-iterator descriptors and closed channels release the message's
    /// reference instead of delivering.
    pub async fn deliver(&self, message: Arc<Message>) {
        match &self.deliver_tx {
            Some(tx) => {
                if let Err(undelivered) = tx.send(message).await {
                    tracing::debug!(channel = %self, "channel closed, dropping delivery");
                    undelivered.0.decref();
                }
            }
            None => {
                tracing::warn!(channel = %self, "deliver called on a non-iterator topic");
                message.decref();
            }
        }
    }

    /// The next message delivered to this channel, or `None` when the
    /// channel is not an iterator or the fan-out plane shut down.
    pub async fn next_message(&self) -> Option<Arc<Message>> {
        match &self.queue_rx {
            Some(queue) => queue.lock().await.recv().await,
            None => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(f, "{}", pattern.as_str()),
            None => write!(f, "{}", self.topics.join(",")),
        }
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("topics", &self.topics)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("partitions", &self.partitions)
            .field("is_iterator", &self.is_iterator)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Topic`] descriptions.
///
/// Obtained from [`Topic::builder`] (fresh) or [`Topic::derive`] (seeded
/// with an existing topic's configuration).
pub struct TopicBuilder {
    pub(crate) ctx: Arc<Context>,
    pub(crate) topics: Vec<String>,
    pub(crate) pattern: Option<String>,
    pub(crate) partitions: Option<i32>,
    pub(crate) replicas: Option<i32>,
    pub(crate) retention: Option<Duration>,
    pub(crate) compacting: Option<bool>,
    pub(crate) deleting: Option<bool>,
    pub(crate) config: HashMap<String, String>,
    pub(crate) acks: bool,
    pub(crate) prefix: String,
    pub(crate) suffix: String,
}

impl TopicBuilder {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            topics: Vec::new(),
            pattern: None,
            partitions: None,
            replicas: None,
            retention: None,
            compacting: None,
            deleting: None,
            config: HashMap::new(),
            acks: true,
            prefix: String::new(),
            suffix: String::new(),
        }
    }

    /// Add one topic name.
    #[must_use]
    pub fn topic(mut self, name: impl Into<String>) -> Self {
        self.topics.push(name.into());
        self
    }

    /// Replace the topic name list.
    #[must_use]
    pub fn topics<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = names.into_iter().map(Into::into).collect();
        self
    }

    /// Subscribe by regex pattern instead of names.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Clear any pattern, turning a derived pattern topic back into a named
    /// one.
    #[must_use]
    pub fn clear_pattern(mut self) -> Self {
        self.pattern = None;
        self
    }

    /// Partition count (defaults to the application default).
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Replication factor (defaults to the application default).
    #[must_use]
    pub const fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Message retention for declared topics.
    #[must_use]
    pub const fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Enable or disable log compaction.
    #[must_use]
    pub const fn compacting(mut self, compacting: bool) -> Self {
        self.compacting = Some(compacting);
        self
    }

    /// Enable or disable deletes.
    #[must_use]
    pub const fn deleting(mut self, deleting: bool) -> Self {
        self.deleting = Some(deleting);
        self
    }

    /// Set one topic-level broker config entry.
    #[must_use]
    pub fn config_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Whether publishes wait for broker acks by default.
    #[must_use]
    pub const fn acks(mut self, acks: bool) -> Self {
        self.acks = acks;
        self
    }

    /// Prepend a prefix to every topic name.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Append a suffix to every topic name.
    #[must_use]
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Validate and build the topic description.
    ///
    /// # Errors
    ///
    /// - [`TopicError::TopicsAndPattern`] if both names and a pattern were
    ///   given
    /// - [`TopicError::PatternAffix`] if a prefix/suffix was applied to a
    ///   pattern topic
    /// - [`TopicError::ZeroPartitions`] if the partition count is zero
    /// - [`TopicError::InvalidPattern`] if the pattern does not compile
    pub fn build(self) -> Result<Topic, TopicError> {
        if self.pattern.is_some() && !self.topics.is_empty() {
            return Err(TopicError::TopicsAndPattern);
        }
        let mut topics = self.topics;
        if !self.prefix.is_empty() || !self.suffix.is_empty() {
            if self.pattern.is_some() {
                return Err(TopicError::PatternAffix);
            }
            topics = topics
                .into_iter()
                .map(|t| format!("{}{}{}", self.prefix, t, self.suffix))
                .collect();
        }
        let partitions = self
            .partitions
            .unwrap_or(self.ctx.config.default_partitions);
        if partitions == 0 {
            return Err(TopicError::ZeroPartitions);
        }
        let replicas = self.replicas.unwrap_or(self.ctx.config.replication_factor);
        let pattern = self
            .pattern
            .map(|p| Regex::new(&p).map_err(|e| TopicError::InvalidPattern(e.to_string())))
            .transpose()?;

        Ok(Topic {
            ctx: self.ctx,
            id: next_channel_id(),
            topics,
            pattern,
            partitions,
            replicas,
            retention: self.retention,
            compacting: self.compacting,
            deleting: self.deleting,
            config: self.config,
            acks: self.acks,
            declared: AtomicBool::new(false),
            is_iterator: false,
            deliver_tx: None,
            queue_rx: None,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests can unwrap

    use super::*;
    use crate::config::AppConfig;

    fn ctx() -> Arc<Context> {
        Context::for_tests(AppConfig::new("topic-tests"))
    }

    #[test]
    fn both_names_and_pattern_is_rejected() {
        let result = Topic::builder(ctx())
            .topic("orders")
            .pattern("^orders-.*$")
            .build();
        assert_eq!(result.err(), Some(TopicError::TopicsAndPattern));
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let result = Topic::builder(ctx()).topic("orders").partitions(0).build();
        assert_eq!(result.err(), Some(TopicError::ZeroPartitions));
    }

    #[test]
    fn partitions_default_from_config() {
        let topic = Topic::builder(ctx()).topic("orders").build().unwrap();
        assert_eq!(topic.partitions(), 8);
        assert_eq!(topic.replicas(), 1);
    }

    #[test]
    fn derive_copies_configuration() {
        let topic = Topic::builder(ctx())
            .topic("t1")
            .partitions(8)
            .config_entry("cleanup.policy", "compact")
            .build()
            .unwrap();
        let derived = topic.derive().build().unwrap();
        assert_eq!(derived.topics(), topic.topics());
        assert_eq!(derived.partitions(), topic.partitions());
        assert_eq!(derived.config(), topic.config());
    }

    #[test]
    fn derive_with_affixes_rewrites_names() {
        let topic = Topic::builder(ctx()).topic("t1").partitions(8).build().unwrap();
        let derived = topic.derive().prefix("p-").suffix("-s").build().unwrap();
        assert_eq!(derived.topics(), ["p-t1-s"]);
        assert_eq!(derived.partitions(), 8);
    }

    #[test]
    fn derive_affix_on_pattern_is_rejected() {
        let topic = Topic::builder(ctx()).pattern("^x$").build().unwrap();
        let result = topic.derive().prefix("p-").build();
        assert_eq!(result.err(), Some(TopicError::PatternAffix));
    }

    #[test]
    fn pattern_topics_match_by_regex() {
        let topic = Topic::builder(ctx()).pattern("^orders-.*$").build().unwrap();
        assert!(topic.matches("orders-eu"));
        assert!(!topic.matches("payments"));
        assert_eq!(topic.subscription_keys(), ["^orders-.*$"]);
    }

    #[test]
    fn display_joins_names() {
        let topic = Topic::builder(ctx()).topics(["a", "b"]).build().unwrap();
        assert_eq!(topic.to_string(), "a,b");
    }
}
