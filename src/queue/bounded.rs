//! Bounded FIFO queue over a pooled [`ConcurrentList`].

use super::config::QueueConfig;
use super::error::{QueueError, TryEnqueueError};
use super::scheduler::{ConnectionId, QueueScheduler, next_connection_id};
use crate::collections::{ConcurrentList, ListError, NodePool, NodeRef};
use crate::sync::ReentrantSpinMutex;
use crossbeam::utils::Backoff;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, trace, warn};

/// A queued value with its ingestion timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry<T> {
    /// The payload.
    pub value: T,
    /// Ingestion time supplied by the producer.
    pub timestamp: u64,
}

struct Connection {
    id: ConnectionId,
    scheduler: Arc<dyn QueueScheduler>,
}

#[derive(Default)]
struct QueueState {
    earliest: Option<u64>,
    connection: Option<Connection>,
}

/// Transition reported to a connected scheduler.
enum Transition {
    BecameActive(u64),
    HeadChanged(u64),
    Drained,
}

/// Bounded multi-producer, single-consumer queue with two-phase dequeue.
///
/// Producers call [`try_enqueue`](Self::try_enqueue) from any thread; it
/// never blocks and reports backpressure as [`TryEnqueueError::Full`]. The
/// consumer reserves the head with [`try_dequeue`](Self::try_dequeue),
/// processes it, then calls [`Reservation::commit`]. The entry stays queued
/// (and counted) until committed.
///
/// # Example
///
/// ```
/// use order_runtime::queue::{BoundedPooledQueue, QueueConfig};
///
/// let queue = BoundedPooledQueue::new(QueueConfig::new(2));
/// queue.try_enqueue("a", 5).unwrap();
/// queue.try_enqueue("b", 2).unwrap();
/// assert!(queue.try_enqueue("c", 9).unwrap_err().is_full());
///
/// let reservation = queue.try_dequeue().unwrap().unwrap();
/// assert_eq!(queue.earliest_pending_time(), Some(5));
/// assert_eq!(reservation.commit().unwrap(), "a");
/// assert_eq!(queue.earliest_pending_time(), Some(2));
/// ```
pub struct BoundedPooledQueue<T> {
    config: QueueConfig,
    list: ConcurrentList<QueueEntry<T>>,
    pool: Arc<NodePool<QueueEntry<T>>>,
    state: ReentrantSpinMutex<RefCell<QueueState>>,
    reserved: AtomicBool,
    backing_up: AtomicBool,
    terminated: AtomicBool,
}

impl<T> BoundedPooledQueue<T> {
    /// Creates a queue with its own node pool.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::with_pool(config, Arc::new(NodePool::with_capacity(config.capacity)))
    }

    /// Creates a queue that allocates its nodes from a shared pool.
    #[must_use]
    pub fn with_pool(config: QueueConfig, pool: Arc<NodePool<QueueEntry<T>>>) -> Self {
        Self {
            config,
            list: ConcurrentList::new(),
            pool,
            state: ReentrantSpinMutex::new(RefCell::new(QueueState::default())),
            reserved: AtomicBool::new(false),
            backing_up: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Appends `value`. Never blocks.
    ///
    /// # Errors
    ///
    /// [`TryEnqueueError::Full`] when the queue holds `capacity` entries,
    /// [`TryEnqueueError::Terminated`] after [`terminate`](Self::terminate).
    pub fn try_enqueue(&self, value: T, timestamp: u64) -> Result<(), TryEnqueueError<T>> {
        if self.is_terminated() {
            return Err(TryEnqueueError::Terminated(value));
        }

        let guard = self.state.lock();
        let len = self.list.len();
        if len >= self.config.capacity {
            trace!(capacity = self.config.capacity, "enqueue rejected, queue full");
            return Err(TryEnqueueError::Full(value));
        }

        let node = self.pool.create(QueueEntry { value, timestamp });
        if let Err(err) = self.list.add_last_node(&node) {
            return Err(TryEnqueueError::Corrupted(err));
        }

        if len == 0 {
            self.notify(&guard, Transition::BecameActive(timestamp));
        }
        if len + 1 >= self.config.backing_up_watermark
            && !self.backing_up.swap(true, Ordering::AcqRel)
        {
            warn!(
                len = len + 1,
                watermark = self.config.backing_up_watermark,
                "queue backing up"
            );
        }
        Ok(())
    }

    /// Reserves the head entry.
    ///
    /// Returns `Ok(None)` when the queue is empty. The entry stays at the
    /// head until the returned [`Reservation`] is committed; dropping the
    /// reservation without committing releases it.
    ///
    /// # Errors
    ///
    /// [`QueueError::UncommittedDequeue`] if a previous reservation is still
    /// alive, [`QueueError::Terminated`] after termination.
    pub fn try_dequeue(&self) -> Result<Option<Reservation<'_, T>>, QueueError> {
        if self.is_terminated() {
            return Err(QueueError::Terminated);
        }
        if self.reserved.swap(true, Ordering::AcqRel) {
            error!("dequeue attempted with an uncommitted reservation outstanding");
            return Err(QueueError::UncommittedDequeue);
        }
        match self.list.first() {
            Some(node) => Ok(Some(Reservation {
                queue: self,
                node: Some(node),
            })),
            None => {
                self.reserved.store(false, Ordering::Release);
                Ok(None)
            }
        }
    }

    /// Clones the head entry's value without reserving it.
    ///
    /// # Errors
    ///
    /// [`QueueError::Terminated`] after termination.
    pub fn try_peek(&self) -> Result<Option<T>, QueueError>
    where
        T: Clone,
    {
        if self.is_terminated() {
            return Err(QueueError::Terminated);
        }
        Ok(self
            .list
            .first()
            .and_then(|node| node.with_value(|entry| entry.value.clone())))
    }

    /// Discards every entry, including a reserved one.
    ///
    /// # Errors
    ///
    /// [`QueueError::Terminated`] after termination.
    pub fn clear(&self) -> Result<(), QueueError> {
        if self.is_terminated() {
            return Err(QueueError::Terminated);
        }
        let guard = self.state.lock();
        let drained = self.list.drain();
        if drained.is_empty() {
            return Ok(());
        }
        let discarded = drained.len();
        for node in drained {
            self.pool.free(node)?;
        }
        self.notify(&guard, Transition::Drained);
        info!(discarded, "queue cleared");
        Ok(())
    }

    /// Spins, yielding, until the consumer has drained the queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::Terminated`] if the queue is terminated before it
    /// empties.
    pub fn flush(&self) -> Result<(), QueueError> {
        let backoff = Backoff::new();
        loop {
            if self.is_terminated() {
                return Err(QueueError::Terminated);
            }
            if self.list.is_empty() {
                return Ok(());
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Marks the queue terminated. Every later operation returns the
    /// terminal error and `flush` loops exit.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            info!(len = self.list.len(), "queue terminated");
        }
    }

    /// Returns `true` once [`terminate`](Self::terminate) has been called.
    #[must_use]
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Attaches a scheduler and returns the connection id it will see.
    ///
    /// A non-empty queue reports its current state immediately. Replaces any
    /// previous connection.
    pub fn connect(&self, scheduler: Arc<dyn QueueScheduler>) -> ConnectionId {
        let guard = self.state.lock();
        self.disconnect_locked(&guard);
        let id = next_connection_id();
        let earliest = {
            let mut state = guard.borrow_mut();
            state.connection = Some(Connection {
                id,
                scheduler: Arc::clone(&scheduler),
            });
            state.earliest
        };
        if let Some(earliest) = earliest {
            scheduler.update_earliest_time(id, Some(earliest));
            scheduler.increase_activity(id);
        }
        info!(connection = id, "queue connected to scheduler");
        id
    }

    /// Detaches the current scheduler, if any.
    pub fn disconnect(&self) {
        let guard = self.state.lock();
        self.disconnect_locked(&guard);
    }

    /// Number of queued entries, including a reserved one.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Maximum number of entries.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Returns `true` when no more entries fit.
    #[must_use]
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.config.capacity
    }

    /// Returns `true` when nothing is queued.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Timestamp of the oldest queued entry.
    #[must_use]
    pub fn earliest_pending_time(&self) -> Option<u64> {
        self.state.lock().borrow().earliest
    }

    /// Returns `true` while occupancy has crossed the watermark and the queue
    /// has not yet drained.
    #[must_use]
    pub fn is_backing_up(&self) -> bool {
        self.backing_up.load(Ordering::Acquire)
    }

    /// The queue's sizing.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The pool nodes are drawn from.
    #[must_use]
    pub fn pool(&self) -> &Arc<NodePool<QueueEntry<T>>> {
        &self.pool
    }

    fn commit_node(&self, node: NodeRef<QueueEntry<T>>) -> Result<T, QueueError> {
        if self.is_terminated() {
            return Err(QueueError::Terminated);
        }
        let guard = self.state.lock();
        if !self.list.contains(&node) {
            return Err(QueueError::EntryDiscarded);
        }
        self.list.remove(&node)?;
        let entry = self
            .pool
            .free(node)?
            .ok_or(QueueError::List(ListError::InvalidNodeState {
                reason: "queued node has no payload",
            }))?;

        let next_time = self
            .list
            .first()
            .and_then(|head| head.with_value(|e| e.timestamp));
        match next_time {
            Some(timestamp) => self.notify(&guard, Transition::HeadChanged(timestamp)),
            None => self.notify(&guard, Transition::Drained),
        }
        Ok(entry.value)
    }

    fn disconnect_locked(&self, state: &RefCell<QueueState>) {
        let (previous, earliest) = {
            let mut state = state.borrow_mut();
            (state.connection.take(), state.earliest)
        };
        if let Some(connection) = previous {
            if earliest.is_some() {
                connection.scheduler.update_earliest_time(connection.id, None);
                connection.scheduler.decrease_activity(connection.id);
            }
            info!(connection = connection.id, "queue disconnected from scheduler");
        }
    }

    /// Records the new earliest time and forwards the transition. The
    /// `RefCell` borrow is released before the scheduler runs.
    fn notify(&self, state: &RefCell<QueueState>, transition: Transition) {
        let connection = {
            let mut state = state.borrow_mut();
            state.earliest = match transition {
                Transition::BecameActive(t) | Transition::HeadChanged(t) => Some(t),
                Transition::Drained => None,
            };
            state
                .connection
                .as_ref()
                .map(|c| (c.id, Arc::clone(&c.scheduler)))
        };

        if matches!(transition, Transition::Drained)
            && self.backing_up.swap(false, Ordering::AcqRel)
        {
            info!("queue drained, no longer backing up");
        }

        let Some((id, scheduler)) = connection else {
            return;
        };
        match transition {
            Transition::BecameActive(t) => {
                scheduler.update_earliest_time(id, Some(t));
                scheduler.increase_activity(id);
            }
            Transition::HeadChanged(t) => scheduler.update_earliest_time(id, Some(t)),
            Transition::Drained => {
                scheduler.update_earliest_time(id, None);
                scheduler.decrease_activity(id);
            }
        }
    }
}

impl<T> Drop for BoundedPooledQueue<T> {
    fn drop(&mut self) {
        self.terminate();
        for node in self.list.drain() {
            // Nodes were just drained, so they are detached.
            let _ = self.pool.free(node);
        }
    }
}

impl<T> fmt::Debug for BoundedPooledQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPooledQueue")
            .field("len", &self.len())
            .field("capacity", &self.config.capacity)
            .field("backing_up", &self.is_backing_up())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

/// A reserved head entry returned by [`BoundedPooledQueue::try_dequeue`].
///
/// Commit it once the entry has been processed. Dropping it uncommitted
/// leaves the entry at the head for the next `try_dequeue`.
#[must_use = "an uncommitted reservation leaves the entry queued"]
pub struct Reservation<'a, T> {
    queue: &'a BoundedPooledQueue<T>,
    node: Option<NodeRef<QueueEntry<T>>>,
}

impl<T> Reservation<'_, T> {
    /// Runs `f` against the reserved value.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.node
            .as_ref()
            .and_then(|node| node.with_value(|entry| f(&entry.value)))
    }

    /// Clones the reserved value.
    #[must_use]
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with_value(T::clone)
    }

    /// Ingestion timestamp of the reserved entry.
    #[must_use]
    pub fn timestamp(&self) -> Option<u64> {
        self.node
            .as_ref()
            .and_then(|node| node.with_value(|entry| entry.timestamp))
    }

    /// Removes the entry from the queue and returns its value.
    ///
    /// # Errors
    ///
    /// [`QueueError::Terminated`] after termination,
    /// [`QueueError::EntryDiscarded`] if the queue was cleared meanwhile.
    pub fn commit(mut self) -> Result<T, QueueError> {
        match self.node.take() {
            Some(node) => self.queue.commit_node(node),
            None => Err(QueueError::EntryDiscarded),
        }
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        self.queue.reserved.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for Reservation<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("timestamp", &self.timestamp())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EarliestTimeTracker;

    fn queue(capacity: usize) -> BoundedPooledQueue<u32> {
        BoundedPooledQueue::new(QueueConfig::new(capacity))
    }

    #[test]
    fn test_enqueue_beyond_capacity_is_rejected() {
        let q = queue(2);
        assert!(q.try_enqueue(1, 10).is_ok());
        assert!(q.try_enqueue(2, 11).is_ok());
        let err = q.try_enqueue(3, 12).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), Some(3));
        assert_eq!(q.len(), 2);
        assert!(q.is_full());
    }

    #[test]
    fn test_dequeue_commit_preserves_fifo() {
        let q = queue(8);
        for v in 1..=3 {
            assert!(q.try_enqueue(v, u64::from(v)).is_ok());
        }
        let mut out = Vec::new();
        while let Ok(Some(reservation)) = q.try_dequeue() {
            out.push(reservation.commit().unwrap_or_else(|e| panic!("{e}")));
        }
        assert_eq!(out, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_reservation_keeps_entry_counted() {
        let q = queue(4);
        assert!(q.try_enqueue(7, 1).is_ok());
        let reservation = q.try_dequeue().ok().flatten();
        let reservation = reservation.unwrap_or_else(|| panic!("reservation"));
        assert_eq!(reservation.value(), Some(7));
        assert_eq!(reservation.timestamp(), Some(1));
        assert_eq!(q.len(), 1);
        assert_eq!(reservation.commit(), Ok(7));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_second_dequeue_without_commit_fails() {
        let q = queue(4);
        assert!(q.try_enqueue(1, 1).is_ok());
        let first = q.try_dequeue();
        assert!(matches!(first, Ok(Some(_))));
        assert!(matches!(q.try_dequeue(), Err(QueueError::UncommittedDequeue)));
        drop(first);
        assert!(matches!(q.try_dequeue(), Ok(Some(_))));
    }

    #[test]
    fn test_dropped_reservation_leaves_entry_at_head() {
        let q = queue(4);
        assert!(q.try_enqueue(1, 1).is_ok());
        assert!(q.try_enqueue(2, 2).is_ok());
        drop(q.try_dequeue());
        assert_eq!(q.try_peek(), Ok(Some(1)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_earliest_pending_time_follows_head() {
        let q = queue(8);
        assert_eq!(q.earliest_pending_time(), None);
        for (v, ts) in [(1, 5), (2, 2), (3, 9)] {
            assert!(q.try_enqueue(v, ts).is_ok());
        }
        assert_eq!(q.earliest_pending_time(), Some(5));

        let reservation = q.try_dequeue().ok().flatten();
        assert_eq!(q.earliest_pending_time(), Some(5));
        assert!(reservation.map(Reservation::commit).is_some());
        assert_eq!(q.earliest_pending_time(), Some(2));
    }

    #[test]
    fn test_scheduler_sees_transitions() {
        let q = queue(8);
        let tracker = Arc::new(EarliestTimeTracker::new());
        let conn = q.connect(Arc::clone(&tracker) as Arc<dyn QueueScheduler>);

        assert!(q.try_enqueue(1, 40).is_ok());
        assert!(q.try_enqueue(2, 50).is_ok());
        assert_eq!(tracker.earliest_for(conn), Some(40));
        assert_eq!(tracker.activity(conn), 1);

        for _ in 0..2 {
            let reservation = q.try_dequeue().ok().flatten();
            assert!(reservation.map(Reservation::commit).is_some());
        }
        assert_eq!(tracker.earliest_for(conn), None);
        assert_eq!(tracker.activity(conn), 0);
    }

    #[test]
    fn test_connect_to_non_empty_queue_reports_state() {
        let q = queue(8);
        assert!(q.try_enqueue(1, 12).is_ok());
        let tracker = Arc::new(EarliestTimeTracker::new());
        let conn = q.connect(Arc::clone(&tracker) as Arc<dyn QueueScheduler>);
        assert_eq!(tracker.earliest_for(conn), Some(12));
        assert_eq!(tracker.activity(conn), 1);

        q.disconnect();
        assert_eq!(tracker.earliest_for(conn), None);
        assert_eq!(tracker.activity(conn), 0);
    }

    #[test]
    fn test_backing_up_flag() {
        let q = BoundedPooledQueue::new(QueueConfig::new(10).with_backing_up_watermark(3));
        for v in 0..2u32 {
            assert!(q.try_enqueue(v, 0).is_ok());
        }
        assert!(!q.is_backing_up());
        assert!(q.try_enqueue(2, 0).is_ok());
        assert!(q.is_backing_up());

        let reservation = q.try_dequeue().ok().flatten();
        assert!(reservation.map(Reservation::commit).is_some());
        assert!(q.is_backing_up());
        assert!(q.clear().is_ok());
        assert!(!q.is_backing_up());
    }

    #[test]
    fn test_clear_discards_reserved_entry() {
        let q = queue(4);
        assert!(q.try_enqueue(1, 1).is_ok());
        let reservation = q.try_dequeue().ok().flatten();
        assert!(q.clear().is_ok());
        assert_eq!(
            reservation.map(Reservation::commit),
            Some(Err(QueueError::EntryDiscarded))
        );
        assert!(q.is_empty());
        assert_eq!(q.earliest_pending_time(), None);
    }

    #[test]
    fn test_terminate_is_terminal() {
        let q = queue(4);
        assert!(q.try_enqueue(1, 1).is_ok());
        q.terminate();
        assert!(q.try_enqueue(2, 2).unwrap_err().is_terminated());
        assert!(matches!(q.try_dequeue(), Err(QueueError::Terminated)));
        assert_eq!(q.try_peek(), Err(QueueError::Terminated));
        assert_eq!(q.flush(), Err(QueueError::Terminated));
    }

    #[test]
    fn test_nodes_are_recycled_through_pool() {
        let q = queue(4);
        for round in 0..10u32 {
            assert!(q.try_enqueue(round, u64::from(round)).is_ok());
            let reservation = q.try_dequeue().ok().flatten();
            assert_eq!(reservation.map(Reservation::commit), Some(Ok(round)));
        }
        assert_eq!(q.pool().count(), 1);
    }
}
