//! # Freshet Kafka
//!
//! rdkafka-backed implementations of the Freshet broker contracts.
//!
//! This crate provides a production [`KafkaConsumer`] and [`KafkaProducer`]
//! implementing the `freshet-core` [`Consumer`](freshet_core::Consumer) and
//! [`Producer`](freshet_core::Producer) traits over librdkafka. It works
//! against any Kafka-compatible broker (Apache Kafka, Redpanda, MSK, …).
//!
//! # Delivery Semantics
//!
//! - **Consumer**: auto-commit is disabled; the worker commits explicitly
//!   through the fan-out plane, which is what gates the attachment buffer.
//! - **Producer**: `send` hands records to the client's buffer and reports
//!   delivery failures asynchronously; `send_and_wait` returns the broker
//!   acknowledgement.
//!
//! # Example
//!
//! ```no_run
//! use freshet_kafka::{KafkaConsumer, KafkaProducer};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let consumer = KafkaConsumer::builder()
//!     .brokers("localhost:9092")
//!     .group_id("orders-worker")
//!     .auto_offset_reset("earliest")
//!     .build()?;
//!
//! let producer = KafkaProducer::builder()
//!     .brokers("localhost:9092")
//!     .acks("all")
//!     .compression("lz4")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod producer;

pub use consumer::{KafkaConsumer, KafkaConsumerBuilder};
pub use producer::{KafkaProducer, KafkaProducerBuilder};
