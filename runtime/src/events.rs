//! Task-local current-event scope.
//!
//! While a processor handles an input message, the worker runs it inside
//! [`scope_event`]. Any `send` issued from that scope finds the input via
//! [`current_event`] and attaches its output to the input's offset instead
//! of publishing immediately (see [`crate::Attachments::maybe_put`]).

use crate::attachments::Attachments;
use crate::message::{SendHandle, SendTarget, SentCallback};
use freshet_core::Message;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_EVENT: Arc<Event>;
}

/// The input message a processor is currently handling.
///
/// Carries the source [`Message`] and the attach hook outbound sends use to
/// bind their publish to the source offset's commit.
pub struct Event {
    message: Arc<Message>,
    attachments: Arc<Attachments>,
}

impl Event {
    /// Create an event for a consumed message.
    #[must_use]
    pub fn new(message: Arc<Message>, attachments: Arc<Attachments>) -> Self {
        Self {
            message,
            attachments,
        }
    }

    /// The source message.
    #[must_use]
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Attach an outbound message to this event's source offset.
    ///
    /// The returned handle resolves when the source offset is committed and
    /// the publish completes.
    pub async fn attach(
        &self,
        channel: SendTarget,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        partition: Option<i32>,
        callback: Option<SentCallback>,
    ) -> SendHandle {
        self.attachments
            .put(&self.message, channel, key, value, partition, callback)
            .await
    }

    /// Release this subscriber's reference on the source message, returning
    /// the remaining reference count.
    pub fn ack(&self) -> usize {
        self.message.decref()
    }
}

/// Run `fut` with `event` as the task-local current event.
pub async fn scope_event<F>(event: Arc<Event>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_EVENT.scope(event, fut).await
}

/// The event the current task is handling, if any.
#[must_use]
pub fn current_event() -> Option<Arc<Event>> {
    CURRENT_EVENT.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Context;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn current_event_is_none_outside_scope() {
        assert!(current_event().is_none());
    }

    #[tokio::test]
    async fn current_event_is_visible_inside_scope() {
        let ctx = Context::for_tests(AppConfig::new("test"));
        let attachments = Arc::new(Attachments::new(ctx));
        let message = Arc::new(Message::new("t", 0, 1, None, None, None));
        let event = Arc::new(Event::new(message, attachments));

        scope_event(event, async {
            let found = current_event();
            assert!(found.is_some_and(|e| e.message().offset == 1));
        })
        .await;
        assert!(current_event().is_none());
    }
}
