//! # Freshet Core
//!
//! Core contracts and value types for the Freshet stream-processing worker.
//!
//! A Freshet worker sits atop a partitioned, ordered, replayable log (a
//! Kafka-compatible broker) and hosts stream processors and materialized
//! key/value tables. This crate defines the seams between the worker runtime
//! and its external collaborators:
//!
//! - **[`Tp`]**: topic-partition identifiers, the unit of ordering
//! - **[`Message`]**: an inbound record with worker-side reference counting
//! - **[`Consumer`] / [`Producer`]**: the broker client contracts
//! - **[`Collection`]**: the materialized-table contract (changelog replay)
//! - **[`PartitionAssignor`]**: active/standby partition ownership
//! - **[`Sensor`]**: instrumentation hooks
//!
//! The runtime crate (`freshet-runtime`) builds the attachment buffer, the
//! topic fan-out plane and the table recovery engine on top of these
//! contracts; `freshet-kafka` implements the broker contracts with rdkafka;
//! `freshet-testing` provides in-memory mocks.
//!
//! ## Example
//!
//! ```ignore
//! use freshet_core::{Consumer, Tp};
//!
//! async fn pause_changelogs(consumer: &dyn Consumer, changelogs: &[Tp]) {
//!     let paused = changelogs.iter().cloned().collect();
//!     consumer.pause_partitions(paused).await.ok();
//! }
//! ```

pub mod assignor;
pub mod consumer;
pub mod error;
pub mod message;
pub mod producer;
pub mod sensor;
pub mod table;
pub mod tp;

pub use assignor::PartitionAssignor;
pub use consumer::{Consumer, MessageStream};
pub use error::{BrokerError, PublishError, TableError, TopicError};
pub use message::{Message, RecordMetadata};
pub use producer::Producer;
pub use sensor::{NullSensor, Sensor};
pub use table::{ChangelogSpec, Collection};
pub use tp::{OFFSET_UNKNOWN, Tp};
