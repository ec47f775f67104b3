//! Worker configuration.

use std::time::Duration;

/// Tunables for a Freshet worker.
///
/// All fields are public; construct with [`AppConfig::new`] and override as
/// needed:
///
/// ```
/// use freshet_runtime::AppConfig;
/// use std::time::Duration;
///
/// let config = AppConfig {
///     subscriber_grace: Duration::from_millis(200),
///     ..AppConfig::new("orders-worker")
/// };
/// assert_eq!(config.default_partitions, 8);
/// ```
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Worker/application identifier, used for logging and group naming.
    pub id: String,
    /// Partition count used for topics that do not specify one.
    pub default_partitions: i32,
    /// Replication factor used for topics that do not specify one.
    pub replication_factor: i32,
    /// How long the subscriber task waits after start before the first
    /// broker subscribe, so every processor gets a chance to register its
    /// topics and a single subscription request covers them all.
    pub subscriber_grace: Duration,
    /// Flight-recorder timeout for the partition-revocation path. Stages
    /// exceeding it are logged, not interrupted.
    pub revoke_timeout: Duration,
    /// Depth of the fan-out pending-delivery queue; the consume loop blocks
    /// when it is full.
    pub fanout_queue_depth: usize,
    /// Depth of each channel's delivery queue.
    pub channel_queue_depth: usize,
}

impl AppConfig {
    /// Configuration with production defaults for the given worker id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            default_partitions: 8,
            replication_factor: 1,
            subscriber_grace: Duration::from_secs(2),
            revoke_timeout: Duration::from_secs(60),
            fanout_queue_depth: 1000,
            channel_queue_depth: 1000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new("freshet")
    }
}
