//! In-memory broker contract implementations.

use freshet_core::{
    BrokerError, Consumer, Message, MessageStream, PartitionAssignor, Producer, RecordMetadata, Tp,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded consumer API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCall {
    /// `subscribe` with the given subscription strings.
    Subscribe(Vec<String>),
    /// `pause_partitions`.
    Pause(BTreeSet<Tp>),
    /// `resume_partitions`.
    Resume(BTreeSet<Tp>),
    /// `commit` with the given offsets (sorted).
    Commit(Vec<(Tp, i64)>),
    /// `seek` on one partition.
    Seek(Tp, i64),
    /// `perform_seek`.
    PerformSeek,
}

/// Scripted broker consumer.
///
/// Tests inject messages with [`MockConsumer::inject`]; the worker sees them
/// on the stream returned by `messages()`. Every control-plane call is
/// recorded for assertions, and pause/resume state is tracked.
pub struct MockConsumer {
    inject_tx: tokio::sync::mpsc::Sender<Result<Arc<Message>, BrokerError>>,
    inject_rx: Mutex<Option<tokio::sync::mpsc::Receiver<Result<Arc<Message>, BrokerError>>>>,
    assignment: Mutex<HashSet<Tp>>,
    highwaters: Mutex<HashMap<Tp, i64>>,
    paused: Mutex<HashSet<Tp>>,
    calls: Mutex<Vec<ConsumerCall>>,
}

impl MockConsumer {
    /// Create a consumer with an empty assignment.
    #[must_use]
    pub fn new() -> Self {
        let (inject_tx, inject_rx) = tokio::sync::mpsc::channel(1024);
        Self {
            inject_tx,
            inject_rx: Mutex::new(Some(inject_rx)),
            assignment: Mutex::new(HashSet::new()),
            highwaters: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the partitions this consumer reports as assigned.
    pub fn set_assignment(&self, tps: HashSet<Tp>) {
        *locked(&self.assignment) = tps;
    }

    /// Script the highwater (last record offset) for a partition.
    pub fn set_highwater(&self, tp: Tp, offset: i64) {
        locked(&self.highwaters).insert(tp, offset);
    }

    /// Deliver a message to the worker, returning the shared handle so the
    /// test can observe its reference count.
    ///
    /// # Panics
    ///
    /// Panics if the injection buffer is closed.
    #[allow(clippy::panic)]
    pub async fn inject(&self, message: Message) -> Arc<Message> {
        let message = Arc::new(message);
        if self.inject_tx.send(Ok(Arc::clone(&message))).await.is_err() {
            panic!("mock consumer stream was dropped");
        }
        message
    }

    /// Deliver a transport error to the worker.
    pub async fn inject_error(&self, error: BrokerError) {
        let _ = self.inject_tx.send(Err(error)).await;
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<ConsumerCall> {
        locked(&self.calls).clone()
    }

    /// The topic sets passed to `subscribe`, in order.
    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        locked(&self.calls)
            .iter()
            .filter_map(|call| match call {
                ConsumerCall::Subscribe(topics) => Some(topics.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded seeks, in order.
    pub fn seeks(&self) -> Vec<(Tp, i64)> {
        locked(&self.calls)
            .iter()
            .filter_map(|call| match call {
                ConsumerCall::Seek(tp, offset) => Some((tp.clone(), *offset)),
                _ => None,
            })
            .collect()
    }

    /// Partition sets passed to `resume_partitions`, in order.
    pub fn resumes(&self) -> Vec<BTreeSet<Tp>> {
        locked(&self.calls)
            .iter()
            .filter_map(|call| match call {
                ConsumerCall::Resume(tps) => Some(tps.clone()),
                _ => None,
            })
            .collect()
    }

    /// Offset maps passed to `commit`, in order.
    pub fn commits(&self) -> Vec<Vec<(Tp, i64)>> {
        locked(&self.calls)
            .iter()
            .filter_map(|call| match call {
                ConsumerCall::Commit(offsets) => Some(offsets.clone()),
                _ => None,
            })
            .collect()
    }

    /// Partitions currently paused.
    pub fn paused(&self) -> HashSet<Tp> {
        locked(&self.paused).clone()
    }

    fn record(&self, call: ConsumerCall) {
        locked(&self.calls).push(call);
    }
}

impl Default for MockConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl Consumer for MockConsumer {
    fn subscribe(
        &self,
        topics: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        self.record(ConsumerCall::Subscribe(topics));
        Box::pin(async { Ok(()) })
    }

    fn assignment(&self) -> HashSet<Tp> {
        locked(&self.assignment).clone()
    }

    fn pause_partitions(
        &self,
        tps: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        locked(&self.paused).extend(tps.iter().cloned());
        self.record(ConsumerCall::Pause(tps.into_iter().collect()));
        Box::pin(async { Ok(()) })
    }

    fn resume_partitions(
        &self,
        tps: HashSet<Tp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        {
            let mut paused = locked(&self.paused);
            for tp in &tps {
                paused.remove(tp);
            }
        }
        self.record(ConsumerCall::Resume(tps.into_iter().collect()));
        Box::pin(async { Ok(()) })
    }

    fn commit(
        &self,
        offsets: HashMap<Tp, i64>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BrokerError>> + Send + '_>> {
        let mut sorted: Vec<(Tp, i64)> = offsets.into_iter().collect();
        sorted.sort();
        let any = !sorted.is_empty();
        self.record(ConsumerCall::Commit(sorted));
        Box::pin(async move { Ok(any) })
    }

    fn seek(
        &self,
        tp: Tp,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        self.record(ConsumerCall::Seek(tp, offset));
        Box::pin(async { Ok(()) })
    }

    fn highwater(
        &self,
        tp: Tp,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, BrokerError>> + Send + '_>> {
        let highwater = locked(&self.highwaters).get(&tp).copied();
        Box::pin(async move { Ok(highwater) })
    }

    fn perform_seek(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        self.record(ConsumerCall::PerformSeek);
        Box::pin(async { Ok(()) })
    }

    fn messages(&self) -> MessageStream {
        let receiver = locked(&self.inject_rx).take();
        let stream = async_stream::stream! {
            if let Some(mut rx) = receiver {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            }
        };
        Box::pin(stream)
    }
}

/// One record handed to the mock producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// Destination topic.
    pub topic: String,
    /// Key bytes.
    pub key: Option<Vec<u8>>,
    /// Value bytes.
    pub value: Option<Vec<u8>>,
    /// Partition hint.
    pub partition: Option<i32>,
    /// Whether the caller waited for the acknowledgement.
    pub waited: bool,
}

/// Recording broker producer.
///
/// Acknowledged sends receive monotone offsets per topic. `fail_sends`
/// scripts produce failures.
pub struct MockProducer {
    started: AtomicUsize,
    fail_sends: AtomicBool,
    sends: Mutex<Vec<SentRecord>>,
    created: Mutex<Vec<(String, i32, i32)>>,
    next_offsets: Mutex<HashMap<String, i64>>,
}

impl MockProducer {
    /// Create an empty producer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            sends: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            next_offsets: Mutex::new(HashMap::new()),
        }
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// How many times `start` was called.
    pub fn start_count(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    /// Every record handed to the producer, in order.
    pub fn sends(&self) -> Vec<SentRecord> {
        locked(&self.sends).clone()
    }

    /// Records sent to one topic.
    pub fn sends_to(&self, topic: &str) -> Vec<SentRecord> {
        locked(&self.sends)
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Topics created through this producer: `(name, partitions,
    /// replication)`.
    pub fn created_topics(&self) -> Vec<(String, i32, i32)> {
        locked(&self.created).clone()
    }

    fn push_send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        partition: Option<i32>,
        waited: bool,
    ) {
        locked(&self.sends).push(SentRecord {
            topic: topic.to_string(),
            key: key.map(<[u8]>::to_vec),
            value: value.map(<[u8]>::to_vec),
            partition,
            waited,
        });
    }
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for MockProducer {
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        self.started.fetch_add(1, Ordering::AcqRel);
        Box::pin(async { Ok(()) })
    }

    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        partition: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(BrokerError::Producer("scripted send failure".to_string()));
            }
            self.push_send(topic, key, value, partition, false);
            Ok(())
        })
    }

    fn send_and_wait<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        partition: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = Result<RecordMetadata, BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(BrokerError::Producer("scripted send failure".to_string()));
            }
            self.push_send(topic, key, value, partition, true);
            let offset = {
                let mut next = locked(&self.next_offsets);
                let slot = next.entry(topic.to_string()).or_insert(0);
                let offset = *slot;
                *slot += 1;
                offset
            };
            Ok(RecordMetadata {
                topic: topic.to_string(),
                partition: partition.unwrap_or(0),
                offset,
            })
        })
    }

    fn create_topic<'a>(
        &'a self,
        topic: &'a str,
        partitions: i32,
        replication: i32,
        _config: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        locked(&self.created).push((topic.to_string(), partitions, replication));
        Box::pin(async { Ok(()) })
    }
}

/// Fixed active/standby partition sets.
#[derive(Default)]
pub struct StaticAssignor {
    actives: Mutex<HashSet<Tp>>,
    standbys: Mutex<HashSet<Tp>>,
}

impl StaticAssignor {
    /// Script the active partitions.
    pub fn set_actives(&self, tps: HashSet<Tp>) {
        *locked(&self.actives) = tps;
    }

    /// Script the standby partitions.
    pub fn set_standbys(&self, tps: HashSet<Tp>) {
        *locked(&self.standbys) = tps;
    }
}

impl PartitionAssignor for StaticAssignor {
    fn assigned_actives(&self) -> HashSet<Tp> {
        locked(&self.actives).clone()
    }

    fn assigned_standbys(&self) -> HashSet<Tp> {
        locked(&self.standbys).clone()
    }
}
