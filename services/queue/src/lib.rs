//! RabbitMQ task queue client for the optiq image optimization service.
//!
//! Provides the durable publish / reliable consume contract between the
//! ingestion API and the worker pool: a direct durable exchange bound to a
//! durable queue, persistent deliveries with publisher confirms, prefetch of
//! one per channel, and ack/nack-with-requeue acknowledgement discipline.

pub mod client;
pub mod task;

pub use client::{QueueClient, QueueError};
pub use task::{ResizeConfig, ResizeData, Task, TaskPayload};
