//! Downstream scheduling hooks for queues.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Identifier handed out by
/// [`BoundedPooledQueue::connect`](super::BoundedPooledQueue::connect).
pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

/// Receives earliest-time and activity transitions from connected queues.
///
/// Calls are made with the queue's spin mutex held, so implementations must
/// return quickly and must not block. Reading the same queue from inside a
/// callback is allowed on the calling thread.
pub trait QueueScheduler: Send + Sync {
    /// The timestamp of the oldest queued entry changed. `None` means the
    /// queue drained.
    fn update_earliest_time(&self, connection: ConnectionId, earliest: Option<u64>);

    /// The queue went from empty to non-empty.
    fn increase_activity(&self, connection: ConnectionId);

    /// The queue went from non-empty to empty.
    fn decrease_activity(&self, connection: ConnectionId);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ConnectionState {
    earliest: Option<u64>,
    activity: i64,
}

/// A [`QueueScheduler`] that records the reported state per connection.
///
/// Lets a time-gated stage ask "what is the oldest pending entry across all
/// my input queues" without walking them.
#[derive(Debug, Default)]
pub struct EarliestTimeTracker {
    connections: DashMap<ConnectionId, ConnectionState>,
}

impl EarliestTimeTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest pending time across every connection.
    #[must_use]
    pub fn earliest_time(&self) -> Option<u64> {
        self.connections
            .iter()
            .filter_map(|entry| entry.value().earliest)
            .min()
    }

    /// Earliest pending time last reported by `connection`.
    #[must_use]
    pub fn earliest_for(&self, connection: ConnectionId) -> Option<u64> {
        self.connections.get(&connection).and_then(|s| s.earliest)
    }

    /// Net activity reported by `connection` (increases minus decreases).
    #[must_use]
    pub fn activity(&self, connection: ConnectionId) -> i64 {
        self.connections.get(&connection).map_or(0, |s| s.activity)
    }

    /// Number of connections whose queue is currently non-empty.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().activity > 0)
            .count()
    }

    /// Forgets a connection.
    pub fn remove(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
    }
}

impl QueueScheduler for EarliestTimeTracker {
    fn update_earliest_time(&self, connection: ConnectionId, earliest: Option<u64>) {
        trace!(connection, ?earliest, "earliest time updated");
        self.connections.entry(connection).or_default().earliest = earliest;
    }

    fn increase_activity(&self, connection: ConnectionId) {
        self.connections.entry(connection).or_default().activity += 1;
    }

    fn decrease_activity(&self, connection: ConnectionId) {
        self.connections.entry(connection).or_default().activity -= 1;
    }
}
