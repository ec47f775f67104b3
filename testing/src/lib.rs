//! # Freshet Testing
//!
//! Testing utilities for the Freshet worker: in-memory implementations of
//! the broker and table contracts, deterministic enough to drive the
//! attachment buffer, the fan-out plane and the recovery engine without a
//! broker.
//!
//! - [`MockConsumer`]: scripted assignment and highwaters, message
//!   injection, full call recording (subscribe/pause/resume/seek/commit)
//! - [`MockProducer`]: records every send and topic creation, hands out
//!   monotone offsets for acknowledged sends
//! - [`MemoryTable`]: a `Collection` over a hash map with scripted
//!   persisted offsets and lifecycle call recording
//! - [`StaticAssignor`]: fixed active/standby partition sets
//!
//! ## Example
//!
//! ```ignore
//! let consumer = Arc::new(MockConsumer::new());
//! let producer = Arc::new(MockProducer::new());
//! let assignor = Arc::new(StaticAssignor::default());
//! let app = App::new(AppConfig::new("test"), consumer.clone(), producer, assignor);
//!
//! app.start();
//! consumer.inject(Message::new("orders", 0, 1, None, None, None)).await;
//! ```

pub mod broker_mocks;
pub mod table_mocks;

pub use broker_mocks::{ConsumerCall, MockConsumer, MockProducer, SentRecord, StaticAssignor};
pub use table_mocks::MemoryTable;

use std::future::Future;
use std::time::Duration;

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether the condition held.
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut` with a test deadline, panicking on timeout.
///
/// # Panics
///
/// Panics when the future does not complete within `timeout`.
#[allow(clippy::panic)]
pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    match tokio::time::timeout(timeout, fut).await {
        Ok(output) => output,
        Err(_) => panic!("future did not complete within {timeout:?}"),
    }
}
