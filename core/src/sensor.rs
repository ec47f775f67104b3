//! Instrumentation hooks.
//!
//! Sensors observe the worker's hot paths without being part of them. The
//! default implementation does nothing; deployments plug in their own
//! recorder.

use crate::message::RecordMetadata;
use crate::tp::Tp;

/// Observer for worker-level events.
///
/// All hooks have empty default bodies so implementations only override what
/// they measure.
pub trait Sensor: Send + Sync {
    /// A publish is about to be handed to the producer.
    fn on_send_initiated(&self, topic: &str, key_size: usize, value_size: usize) {
        let _ = (topic, key_size, value_size);
    }

    /// The broker acknowledged a publish.
    fn on_send_completed(&self, metadata: &RecordMetadata) {
        let _ = metadata;
    }

    /// A record arrived from the broker and is about to be fanned out.
    fn on_message_in(&self, tp: &Tp, offset: i64) {
        let _ = (tp, offset);
    }
}

/// Sensor that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSensor;

impl Sensor for NullSensor {}
