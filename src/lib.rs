//! # Order Runtime
//!
//! Low-level runtime primitives for a trading engine. The crate keeps the
//! engine's view of outstanding broker orders durable and crash-recoverable,
//! and coordinates, under concurrent tick, order and fill traffic, when it
//! is safe to advance processing for an instrument.
//!
//! ## Key Features
//!
//! - **Concurrent intrusive list**: [`ConcurrentList`] is a doubly-linked
//!   ring of shared node handles. A node removes itself in O(1), and a
//!   traversal that races a removal either skips the node or ends cleanly.
//!
//! - **Reentrant spin mutex**: [`ReentrantSpinMutex`] is a busy-wait mutex
//!   keyed by the owning thread, reentrant through a hold counter. It guards
//!   only O(1) pointer and counter updates.
//!
//! - **Node pooling**: [`NodePool`] recycles list nodes so that steady-state
//!   enqueue and commit do not allocate. Pools are injected per queue.
//!
//! - **Bounded queue with two-phase dequeue**: [`BoundedPooledQueue`] hands
//!   out a [`Reservation`] for the oldest entry; the entry keeps counting
//!   against capacity until the reservation is committed. An optional
//!   [`QueueScheduler`] is told about the earliest pending timestamp.
//!
//! - **Synchronization counters**: [`SyncCounterSet`] tracks six kinds of
//!   pending work per symbol with lock-free atomics and decides when a
//!   symbol has completed its cycle.
//!
//! - **Durable order store**: [`DurableOrderStore`] indexes orders by broker
//!   id and by logical serial, follows replace chains, and snapshots itself
//!   to a checksummed, framed file from a background thread.
//!
//! ## Concurrency Model
//!
//! Spin locks are only held around pointer and counter updates, never
//! across I/O. Counters use atomics exclusively. The snapshot writer runs on
//! its own thread, and [`DurableOrderStore::wait_for_snapshot`] is the only
//! call that parks the caller. Terminating a queue or closing a store turns
//! every later call into a distinct terminal error
//! ([`QueueError::Terminated`], [`StoreError::Closed`]).
//!
//! ## Example
//!
//! ```rust
//! use order_runtime::prelude::*;
//!
//! let queue: BoundedPooledQueue<&str> = BoundedPooledQueue::new(QueueConfig::new(8));
//! queue.try_enqueue("tick", 5).expect("room in queue");
//!
//! let reservation = queue.try_dequeue().expect("no outstanding reservation");
//! if let Some(reservation) = reservation {
//!     assert_eq!(reservation.timestamp(), Some(5));
//!     let value = reservation.commit().expect("queue running");
//!     assert_eq!(value, "tick");
//! }
//! assert!(queue.is_empty());
//! ```
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber.

pub mod collections;
pub mod counters;
pub mod prelude;
pub mod queue;
pub mod store;
pub mod sync;
mod utils;

pub use collections::{ConcurrentList, ListError, ListNode, NodePool, NodeRef};
pub use counters::{
    Counter, CounterError, CounterSnapshot, PendingWork, SyncCounterRegistry, SyncCounterSet,
};
pub use queue::{
    BoundedPooledQueue, ConnectionId, EarliestTimeTracker, QueueConfig, QueueEntry, QueueError,
    QueueScheduler, Reservation, TryEnqueueError,
};
pub use store::{DurableOrderStore, OrderRecord, OrderRef, OrderState, Side, StoreConfig, StoreError};
pub use sync::{ReentrantSpinMutex, SpinLock};
pub use utils::{current_time_millis, current_time_nanos};
