//! Bounded pooled queue with two-phase dequeue.
//!
//! [`BoundedPooledQueue`] sits between producers (market-data handlers,
//! order-processing stages) and a single consumer task. The consumer
//! reserves the oldest entry, processes it, and commits it; an optional
//! [`QueueScheduler`] is told whenever the oldest pending timestamp changes.

mod bounded;
mod config;
mod error;
mod scheduler;

pub use bounded::{BoundedPooledQueue, QueueEntry, Reservation};
pub use config::QueueConfig;
pub use error::{QueueError, TryEnqueueError};
pub use scheduler::{ConnectionId, EarliestTimeTracker, QueueScheduler};
