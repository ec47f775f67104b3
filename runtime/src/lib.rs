//! # Freshet Runtime
//!
//! The core of the Freshet stream-processing worker: everything between the
//! broker client and user processors.
//!
//! ## Core Components
//!
//! - **[`Attachments`]**: a per-source-message outbox. Messages produced
//!   while handling an input are buffered against the input's offset and
//!   published only once that offset is committed, giving a best-effort
//!   "effectively-once" output discipline without broker transactions.
//! - **[`Topic`]**: a declarative description of one or more broker topics
//!   (names or a pattern) that doubles as a subscription channel when
//!   acquired through the topic manager.
//! - **[`TopicManager`]**: the single-consumer fan-out plane. One broker
//!   consumer subscribes to the union of all declared topics; every
//!   delivered record is reference-counted and multiplexed to each
//!   subscribing channel.
//! - **[`ChangelogReader`]**: a bounded replay task that brings a table's
//!   state up to the broker highwater; its standby variant tails forever.
//! - **[`TableManager`]**: orchestrates changelog recovery across all
//!   tables on partition assignment, runs standbys for replica partitions
//!   and aborts cleanly when assignments change again.
//! - **[`App`]**: owns the single consumer, the lazily-started producer and
//!   the managers; the handle user-facing code interacts with.
//!
//! ## Data Flow
//!
//! ```text
//!            broker
//!              │ consume
//!              ▼
//!        ┌───────────┐   fan-out    ┌──────────┐
//!        │TopicManager│ ───────────▶ │ channels │──▶ processors
//!        └───────────┘              └──────────┘        │ send
//!              ▲                                        ▼
//!              │ commit offset                   ┌─────────────┐
//!              └──────────────────────────────── │ Attachments │
//!                          drain + publish       └─────────────┘
//! ```
//!
//! Recovery path: assignment change → pause changelog partitions → replay
//! via [`ChangelogReader`]s → swap tables live → start standbys → resume.

pub mod app;
pub mod attachments;
pub mod changelog;
pub mod config;
pub mod events;
pub mod flight_recorder;
pub mod message;
pub mod table_manager;
pub mod topic;
pub mod topic_manager;

pub use app::{App, Context};
pub use attachments::Attachments;
pub use changelog::ChangelogReader;
pub use config::AppConfig;
pub use events::{Event, current_event, scope_event};
pub use flight_recorder::FlightRecorder;
pub use message::{FutureMessage, PendingMessage, SendHandle, SendTarget, SentCallback};
pub use table_manager::TableManager;
pub use topic::{Topic, TopicBuilder};
pub use topic_manager::TopicManager;
