//! Stage-annotating watchdog for slow control-plane operations.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Watches a multi-stage operation and complains if it outlives a deadline.
///
/// The caller annotates each stage with [`FlightRecorder::note`]. If the
/// whole operation is still running when the timeout elapses, the recorder
/// logs the last annotated stage at warn level. It never interrupts the
/// operation; dropping the recorder disarms the watchdog.
///
/// # Example
///
/// ```
/// use freshet_runtime::FlightRecorder;
/// use std::time::Duration;
///
/// # async fn example() {
/// let recorder = FlightRecorder::new("rebalance", Duration::from_secs(60));
/// recorder.note("stopping standbys");
/// // ... slow work ...
/// recorder.note("done");
/// # }
/// ```
pub struct FlightRecorder {
    stage: Arc<Mutex<&'static str>>,
    watchdog: JoinHandle<()>,
}

impl FlightRecorder {
    /// Arm a watchdog for the named operation.
    #[must_use]
    pub fn new(operation: &'static str, timeout: Duration) -> Self {
        let stage = Arc::new(Mutex::new("started"));
        let watched = Arc::clone(&stage);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let last = *watched.lock().unwrap_or_else(PoisonError::into_inner);
            tracing::warn!(
                operation,
                last_stage = last,
                timeout_secs = timeout.as_secs(),
                "operation still running past its deadline"
            );
        });
        Self { stage, watchdog }
    }

    /// Record the stage the operation has reached.
    pub fn note(&self, stage: &'static str) {
        tracing::info!(stage, "flight recorder");
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
    }
}

impl Drop for FlightRecorder {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}
