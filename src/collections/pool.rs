use super::error::ListError;
use super::node::{ListNode, NodeRef};
use crate::sync::ReentrantSpinMutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Recycles detached [`ListNode`]s to avoid an allocation per insert.
///
/// The pool is unbounded. A node handed back with [`free`](Self::free) is
/// only recycled if the caller held the last handle to it; nodes still
/// shared elsewhere are simply released to the allocator once the other
/// handles drop.
pub struct NodePool<T> {
    free: ReentrantSpinMutex<RefCell<Vec<NodeRef<T>>>>,
    allocated: AtomicUsize,
}

impl<T> NodePool<T> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty pool with room for `capacity` free nodes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            free: ReentrantSpinMutex::new(RefCell::new(Vec::with_capacity(capacity))),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns a detached node holding `value`, reviving a pooled node when
    /// one is available.
    pub fn create(&self, value: T) -> NodeRef<T> {
        let recycled = {
            let guard = self.free.lock();
            let mut free = guard.borrow_mut();
            free.pop()
        };
        match recycled {
            Some(node) => {
                node.revive(value);
                node
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                ListNode::new(value)
            }
        }
    }

    /// Takes the payload out of `node` and keeps the node for reuse.
    ///
    /// Returns the payload that was stored in the node.
    ///
    /// # Errors
    ///
    /// [`ListError::InvalidNodeState`] if the node is still linked into a
    /// list; it must be removed first.
    pub fn free(&self, node: NodeRef<T>) -> Result<Option<T>, ListError> {
        if node.is_linked() {
            return Err(ListError::InvalidNodeState {
                reason: "node is still linked into a list",
            });
        }
        let value = node.take_value();
        if Arc::strong_count(&node) > 1 {
            trace!("node still shared, not recycled");
            return Ok(value);
        }
        let guard = self.free.lock();
        guard.borrow_mut().push(node);
        Ok(value)
    }

    /// Drops every pooled node.
    pub fn clear(&self) {
        let drained = {
            let guard = self.free.lock();
            std::mem::take(&mut *guard.borrow_mut())
        };
        trace!(released = drained.len(), "node pool cleared");
    }

    /// Number of nodes this pool has allocated over its lifetime.
    #[must_use]
    pub fn count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of nodes waiting to be reused.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().borrow().len()
    }
}

impl<T> Default for NodePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NodePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("allocated", &self.count())
            .field("available", &self.available())
            .finish()
    }
}
