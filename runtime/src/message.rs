//! Outbound messages and their completion handles.
//!
//! Channels mint a [`FutureMessage`] for every outbound record. The message
//! either goes straight to the producer or sits in the attachment buffer
//! until its source offset commits; either way it is resolved exactly once,
//! and the caller observes the outcome through the paired [`SendHandle`].

use crate::topic::Topic;
use freshet_core::{PublishError, RecordMetadata};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Destination of an outbound message.
///
/// Either a concrete channel handle or a bare topic name resolved against
/// the worker's topic factory when the message is enqueued.
#[derive(Clone)]
pub enum SendTarget {
    /// A concrete topic/channel handle.
    Channel(Arc<Topic>),
    /// A topic name, resolved by the worker.
    Name(String),
}

impl SendTarget {
    /// The destination topic name, if one can be determined without the
    /// enclosing channel.
    #[must_use]
    pub fn topic_name(&self) -> Option<&str> {
        match self {
            Self::Channel(topic) => topic.first_name(),
            Self::Name(name) => Some(name),
        }
    }
}

impl fmt::Debug for SendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(topic) => f.debug_tuple("Channel").field(&topic.to_string()).finish(),
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
        }
    }
}

impl From<Arc<Topic>> for SendTarget {
    fn from(topic: Arc<Topic>) -> Self {
        Self::Channel(topic)
    }
}

impl From<&Arc<Topic>> for SendTarget {
    fn from(topic: &Arc<Topic>) -> Self {
        Self::Channel(Arc::clone(topic))
    }
}

impl From<String> for SendTarget {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&str> for SendTarget {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// An outbound record that has not been handed to the producer yet.
///
/// Key and value are already byte-encoded; codecs run upstream of the
/// worker core.
#[derive(Debug)]
pub struct PendingMessage {
    /// Where the record should be published.
    pub channel: SendTarget,
    /// Encoded key bytes.
    pub key: Option<Vec<u8>>,
    /// Encoded value bytes.
    pub value: Option<Vec<u8>>,
    /// Optional partition hint.
    pub partition: Option<i32>,
}

/// Callback invoked once when a pending message resolves.
pub type SentCallback = Box<dyn FnOnce(&Result<RecordMetadata, PublishError>) + Send>;

/// A not-yet-published outbound record plus its completion side.
///
/// Owned by the attachment buffer while pending; ownership transfers to the
/// publish path on commit. Dropping an unresolved `FutureMessage` resolves
/// its handle with [`PublishError::Dropped`].
pub struct FutureMessage {
    message: PendingMessage,
    completion: Option<oneshot::Sender<Result<RecordMetadata, PublishError>>>,
    callback: Option<SentCallback>,
}

impl FutureMessage {
    /// Create a pending message and the handle its producer-side outcome is
    /// reported through.
    #[must_use]
    pub fn new(message: PendingMessage, callback: Option<SentCallback>) -> (Self, SendHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                completion: Some(tx),
                callback,
            },
            SendHandle { rx },
        )
    }

    /// The record waiting to be published.
    #[must_use]
    pub fn message(&self) -> &PendingMessage {
        &self.message
    }

    /// Resolve the message with its final outcome.
    ///
    /// Consumes `self`, so a message can only ever resolve once. The
    /// callback (if any) runs before the handle is woken.
    pub fn resolve(mut self, result: Result<RecordMetadata, PublishError>) {
        if let Some(callback) = self.callback.take() {
            callback(&result);
        }
        if let Some(tx) = self.completion.take() {
            // The handle may have been dropped by a caller that does not
            // care about the outcome.
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for FutureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureMessage")
            .field("message", &self.message)
            .field("resolved", &self.completion.is_none())
            .finish_non_exhaustive()
    }
}

/// Awaitable side of a [`FutureMessage`].
#[derive(Debug)]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<RecordMetadata, PublishError>>,
}

impl SendHandle {
    /// Wait until the message is published (or fails).
    ///
    /// # Errors
    ///
    /// Returns the [`PublishError`] the message resolved with, or
    /// [`PublishError::Dropped`] if the worker discarded the pending message
    /// without resolving it.
    pub async fn wait(self) -> Result<RecordMetadata, PublishError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Dropped),
        }
    }
}
