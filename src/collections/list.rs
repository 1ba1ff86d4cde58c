//! Thread-safe intrusive doubly-linked ring.
//!
//! Structural mutations (insert, remove, sorted insert, clear) are serialized
//! by the list's [`ReentrantSpinMutex`]. Traversal does not take that mutex:
//! [`ConcurrentList::next`] and [`ConcurrentList::prev`] only lock the node
//! they are reading. A node removed behind a reader's cursor keeps weak
//! "stale" links to its former neighbours, so the reader either continues to
//! a live node or runs off the end cleanly; it never observes freed memory.
//!
//! # Example
//!
//! ```
//! use order_runtime::collections::ConcurrentList;
//!
//! let list = ConcurrentList::new();
//! let _a = list.add_last(1).unwrap();
//! let b = list.add_last(2).unwrap();
//! let _c = list.add_last(3).unwrap();
//!
//! list.remove(&b).unwrap();
//! assert_eq!(list.to_vec(), vec![1, 3]);
//!
//! // `b` is detached but still safe to walk from.
//! assert_eq!(list.next(&b).and_then(|n| n.value()), Some(3));
//! ```

use super::error::ListError;
use super::node::{DETACHED, Link, Links, ListNode, NodeRef};
use crate::sync::ReentrantSpinMutex;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{error, trace};

static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

struct ListState<T> {
    head: Option<NodeRef<T>>,
    count: usize,
}

/// A concurrent intrusive doubly-linked list with externally held handles.
///
/// Every insert returns a [`NodeRef`] that can later be passed to
/// [`remove`](Self::remove), [`add_before`](Self::add_before) and friends for
/// O(1) positional operations.
///
/// Comparators and other callbacks handed to the list run with the list's
/// mutex held and must not call back into the same list.
pub struct ConcurrentList<T> {
    id: u64,
    state: ReentrantSpinMutex<RefCell<ListState<T>>>,
    len: AtomicUsize,
}

impl<T> ConcurrentList<T> {
    /// Creates an empty list with a process-unique identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            state: ReentrantSpinMutex::new(RefCell::new(ListState {
                head: None,
                count: 0,
            })),
            len: AtomicUsize::new(0),
        }
    }

    /// Identifier stamped into member nodes (see [`ListNode::owner_id`]).
    #[must_use]
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of linked nodes.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if the list has no nodes.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `node` is currently a member of this list.
    #[must_use]
    #[inline]
    pub fn contains(&self, node: &NodeRef<T>) -> bool {
        node.owner_raw() == self.id
    }

    /// The head node.
    #[must_use]
    pub fn first(&self) -> Option<NodeRef<T>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.head.clone()
    }

    /// The tail node.
    #[must_use]
    pub fn last(&self) -> Option<NodeRef<T>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.head.as_ref().and_then(|head| head.prev_link())
    }

    /// Inserts `value` at the head.
    pub fn add_first(&self, value: T) -> Result<NodeRef<T>, ListError> {
        let node = ListNode::new(value);
        self.add_first_node(&node)?;
        Ok(node)
    }

    /// Inserts `value` at the tail.
    pub fn add_last(&self, value: T) -> Result<NodeRef<T>, ListError> {
        let node = ListNode::new(value);
        self.add_last_node(&node)?;
        Ok(node)
    }

    /// Inserts `value` immediately before `anchor`.
    pub fn add_before(&self, anchor: &NodeRef<T>, value: T) -> Result<NodeRef<T>, ListError> {
        let node = ListNode::new(value);
        self.add_before_node(anchor, &node)?;
        Ok(node)
    }

    /// Inserts `value` immediately after `anchor`.
    pub fn add_after(&self, anchor: &NodeRef<T>, value: T) -> Result<NodeRef<T>, ListError> {
        let node = ListNode::new(value);
        self.add_after_node(anchor, &node)?;
        Ok(node)
    }

    /// Links a detached node at the head.
    ///
    /// # Errors
    ///
    /// [`ListError::InvalidNodeState`] if `node` is already a member of this
    /// or another list.
    pub fn add_first_node(&self, node: &NodeRef<T>) -> Result<(), ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.claim(node)?;
        self.link_first(&mut state, node)
    }

    /// Links a detached node at the tail.
    ///
    /// # Errors
    ///
    /// [`ListError::InvalidNodeState`] if `node` is already linked.
    pub fn add_last_node(&self, node: &NodeRef<T>) -> Result<(), ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.claim(node)?;
        self.link_last(&mut state, node)
    }

    /// Links a detached node immediately before `anchor`.
    ///
    /// # Errors
    ///
    /// [`ListError::NodeNotInList`] if `anchor` is not a member,
    /// [`ListError::InvalidNodeState`] if `node` is already linked.
    pub fn add_before_node(&self, anchor: &NodeRef<T>, node: &NodeRef<T>) -> Result<(), ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.ensure_member(anchor)?;
        self.claim(node)?;
        let anchor_is_head = state
            .head
            .as_ref()
            .is_some_and(|head| Arc::ptr_eq(head, anchor));
        if anchor_is_head {
            self.link_first(&mut state, node)
        } else {
            self.link_before(&mut state, anchor, node)
        }
    }

    /// Links a detached node immediately after `anchor`.
    ///
    /// # Errors
    ///
    /// [`ListError::NodeNotInList`] if `anchor` is not a member,
    /// [`ListError::InvalidNodeState`] if `node` is already linked.
    pub fn add_after_node(&self, anchor: &NodeRef<T>, node: &NodeRef<T>) -> Result<(), ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.ensure_member(anchor)?;
        self.claim(node)?;
        let next = anchor
            .next_link()
            .ok_or_else(|| self.corrupted("member node without a successor"))?;
        self.link_between(&mut state, anchor, &next, node);
        Ok(())
    }

    /// Inserts `value` in ascending order according to `cmp`, scanning from
    /// the head. Equal elements keep insertion order: the new node goes after
    /// existing equal ones.
    pub fn sort_first<F>(&self, value: T, cmp: F) -> Result<NodeRef<T>, ListError>
    where
        F: Fn(&T, &T) -> CmpOrdering,
    {
        let node = ListNode::new(value);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        node.set_owner(self.id);
        self.link_sorted(&mut state, &node, &cmp)?;
        Ok(node)
    }

    /// Moves `node` to its sorted position.
    ///
    /// `node` may be a member of this list (it is unlinked first, under the
    /// same critical section) or detached.
    ///
    /// # Errors
    ///
    /// [`ListError::InvalidNodeState`] if `node` belongs to another list.
    pub fn resort_first<F>(&self, node: &NodeRef<T>, cmp: F) -> Result<(), ListError>
    where
        F: Fn(&T, &T) -> CmpOrdering,
    {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match node.owner_raw() {
            DETACHED => {}
            owner if owner == self.id => self.unlink(&mut state, node)?,
            _ => {
                return Err(ListError::InvalidNodeState {
                    reason: "node is owned by another list",
                });
            }
        }
        self.claim(node)?;
        trace!(list = self.id, "resorting node");
        self.link_sorted(&mut state, node, &cmp)
    }

    /// Unlinks `node`.
    ///
    /// # Errors
    ///
    /// [`ListError::NodeNotInList`] if `node` is not a member of this list,
    /// [`ListError::Corrupted`] if its neighbours do not point back at it.
    pub fn remove(&self, node: &NodeRef<T>) -> Result<(), ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.unlink(&mut state, node)
    }

    /// Removes the first node whose value equals `value`.
    pub fn remove_value(&self, value: &T) -> Result<bool, ListError>
    where
        T: PartialEq,
    {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match self.find_in(&state, value)? {
            Some(node) => {
                self.unlink(&mut state, &node)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unlinks and returns the head.
    pub fn remove_first(&self) -> Result<Option<NodeRef<T>>, ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(head) = state.head.clone() else {
            return Ok(None);
        };
        self.unlink(&mut state, &head)?;
        Ok(Some(head))
    }

    /// Unlinks and returns the tail.
    pub fn remove_last(&self) -> Result<Option<NodeRef<T>>, ListError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(head) = state.head.clone() else {
            return Ok(None);
        };
        let tail = head
            .prev_link()
            .ok_or_else(|| self.corrupted("head without a predecessor"))?;
        self.unlink(&mut state, &tail)?;
        Ok(Some(tail))
    }

    /// Finds the first node whose value equals `value`.
    pub fn find(&self, value: &T) -> Result<Option<NodeRef<T>>, ListError>
    where
        T: PartialEq,
    {
        let guard = self.state.lock();
        let state = guard.borrow();
        self.find_in(&state, value)
    }

    /// Unlinks every node.
    pub fn clear(&self) {
        drop(self.drain());
    }

    /// Unlinks every node and returns them in list order, e.g. to hand them
    /// back to a [`NodePool`](super::NodePool).
    pub fn drain(&self) -> Vec<NodeRef<T>> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let mut drained = Vec::with_capacity(state.count);
        let Some(head) = state.head.take() else {
            return drained;
        };

        let mut current = Some(head.clone());
        while let Some(node) = current {
            if drained.len() > state.count {
                error!(list = self.id, "drain walked past the recorded count");
                break;
            }
            let next = node.next_link();
            *node.links.lock() = Links {
                next: Link::None,
                prev: Link::None,
            };
            node.set_head(false);
            node.set_owner(DETACHED);
            drained.push(node);
            current = next.filter(|n| !Arc::ptr_eq(n, &head));
        }

        state.count = 0;
        self.len.store(0, Ordering::Release);
        drained
    }

    /// Node after `node` in forward order, or `None` at the end of a pass.
    ///
    /// Does not take the list mutex. If `node` has been removed, the walk
    /// continues from its last known successor, skipping other removed
    /// nodes; it stops when it reaches the head again or a node that now
    /// belongs to a different list.
    pub fn next(&self, node: &NodeRef<T>) -> Option<NodeRef<T>> {
        let owner = node.owner_raw();
        if owner != DETACHED && owner != self.id {
            return None;
        }
        let mut candidate = node.next_link()?;
        let mut hops = 0usize;
        while candidate.owner_raw() == DETACHED {
            hops += 1;
            if hops > self.len().saturating_add(1) {
                return None;
            }
            candidate = candidate.next_link()?;
        }
        if candidate.owner_raw() != self.id || candidate.is_head() {
            return None;
        }
        Some(candidate)
    }

    /// Node before `node` in forward order, or `None` when `node` is the
    /// head. Same staleness rules as [`next`](Self::next).
    pub fn prev(&self, node: &NodeRef<T>) -> Option<NodeRef<T>> {
        let owner = node.owner_raw();
        if owner != DETACHED && owner != self.id {
            return None;
        }
        if node.is_head() {
            return None;
        }
        let mut candidate = node.prev_link()?;
        let mut hops = 0usize;
        while candidate.owner_raw() == DETACHED {
            hops += 1;
            if hops > self.len().saturating_add(1) {
                return None;
            }
            candidate = candidate.prev_link()?;
        }
        (candidate.owner_raw() == self.id).then_some(candidate)
    }

    /// Lock-free forward iterator over node handles.
    ///
    /// Tolerates concurrent mutation with the semantics of
    /// [`next`](Self::next).
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: None,
            start: None,
        }
    }

    /// Clones all values in list order under the list mutex.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let guard = self.state.lock();
        let state = guard.borrow();
        let mut values = Vec::with_capacity(state.count);
        let mut current = state.head.clone();
        for _ in 0..state.count {
            let Some(node) = current else { break };
            if let Some(value) = node.value() {
                values.push(value);
            }
            current = node.next_link();
        }
        values
    }

    /// Walks the ring in both directions and checks it against the count.
    ///
    /// # Errors
    ///
    /// [`ListError::Corrupted`] describing the first inconsistency found.
    pub fn check_invariants(&self) -> Result<(), ListError> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let Some(head) = state.head.clone() else {
            if state.count != 0 {
                return Err(self.corrupted("empty ring with a non-zero count"));
            }
            return Ok(());
        };
        if !head.is_head() {
            return Err(self.corrupted("head node is not flagged as head"));
        }

        let mut current = head.clone();
        for step in 0..state.count {
            if current.owner_raw() != self.id {
                return Err(self.corrupted(format!("node at step {step} has a foreign owner")));
            }
            let next = current
                .next_link()
                .ok_or_else(|| self.corrupted(format!("missing successor at step {step}")))?;
            let back = next
                .prev_link()
                .ok_or_else(|| self.corrupted(format!("missing predecessor at step {step}")))?;
            if !Arc::ptr_eq(&back, &current) {
                return Err(self.corrupted(format!("asymmetric links at step {step}")));
            }
            current = next;
        }
        if !Arc::ptr_eq(&current, &head) {
            return Err(self.corrupted("forward walk did not return to head"));
        }

        for step in 0..state.count {
            current = current
                .prev_link()
                .ok_or_else(|| self.corrupted(format!("missing predecessor at step {step}")))?;
        }
        if !Arc::ptr_eq(&current, &head) {
            return Err(self.corrupted("backward walk did not return to head"));
        }
        Ok(())
    }

    // ─── Internal linking (caller holds the list mutex) ─────────────────────

    fn claim(&self, node: &NodeRef<T>) -> Result<(), ListError> {
        node.claim(self.id).map_err(|owner| ListError::InvalidNodeState {
            reason: if owner == self.id {
                "node is already a member of this list"
            } else {
                "node is owned by another list"
            },
        })
    }

    fn ensure_member(&self, node: &NodeRef<T>) -> Result<(), ListError> {
        if node.owner_raw() == self.id {
            Ok(())
        } else {
            Err(ListError::NodeNotInList { list_id: self.id })
        }
    }

    fn corrupted(&self, message: impl Into<String>) -> ListError {
        let message = message.into();
        error!(list = self.id, %message, "list corrupted");
        ListError::Corrupted {
            list_id: self.id,
            message,
        }
    }

    fn set_count(&self, state: &mut ListState<T>, count: usize) {
        state.count = count;
        self.len.store(count, Ordering::Release);
    }

    fn link_into_empty(&self, state: &mut ListState<T>, node: &NodeRef<T>) {
        {
            let mut links = node.links.lock();
            links.next = Link::Live(Arc::clone(node));
            links.prev = Link::Live(Arc::clone(node));
        }
        node.set_head(true);
        state.head = Some(Arc::clone(node));
        self.set_count(state, 1);
    }

    /// Splices `node` between two adjacent members. The new node's own links
    /// are written before it becomes reachable from `prev`.
    fn link_between(
        &self,
        state: &mut ListState<T>,
        prev: &NodeRef<T>,
        next: &NodeRef<T>,
        node: &NodeRef<T>,
    ) {
        {
            let mut links = node.links.lock();
            links.next = Link::Live(Arc::clone(next));
            links.prev = Link::Live(Arc::clone(prev));
        }
        prev.links.lock().next = Link::Live(Arc::clone(node));
        next.links.lock().prev = Link::Live(Arc::clone(node));
        let count = state.count + 1;
        self.set_count(state, count);
    }

    fn link_before(
        &self,
        state: &mut ListState<T>,
        anchor: &NodeRef<T>,
        node: &NodeRef<T>,
    ) -> Result<(), ListError> {
        let prev = anchor
            .prev_link()
            .ok_or_else(|| self.corrupted("member node without a predecessor"))?;
        self.link_between(state, &prev, anchor, node);
        Ok(())
    }

    fn link_first(&self, state: &mut ListState<T>, node: &NodeRef<T>) -> Result<(), ListError> {
        let Some(head) = state.head.clone() else {
            self.link_into_empty(state, node);
            return Ok(());
        };
        self.link_before(state, &head, node)?;
        node.set_head(true);
        head.set_head(false);
        state.head = Some(Arc::clone(node));
        Ok(())
    }

    fn link_last(&self, state: &mut ListState<T>, node: &NodeRef<T>) -> Result<(), ListError> {
        match state.head.clone() {
            Some(head) => self.link_before(state, &head, node),
            None => {
                self.link_into_empty(state, node);
                Ok(())
            }
        }
    }

    fn link_sorted<F>(
        &self,
        state: &mut ListState<T>,
        node: &NodeRef<T>,
        cmp: &F,
    ) -> Result<(), ListError>
    where
        F: Fn(&T, &T) -> CmpOrdering,
    {
        let Some(head) = state.head.clone() else {
            self.link_into_empty(state, node);
            return Ok(());
        };

        let mut current = Arc::clone(&head);
        for _ in 0..state.count {
            let goes_before = node
                .with_value(|new| {
                    current.with_value(|existing| cmp(existing, new) == CmpOrdering::Greater)
                })
                .flatten()
                .unwrap_or(false);
            if goes_before {
                if Arc::ptr_eq(&current, &head) {
                    return self.link_first(state, node);
                }
                return self.link_before(state, &current, node);
            }
            current = current
                .next_link()
                .ok_or_else(|| self.corrupted("member node without a successor"))?;
        }
        self.link_before(state, &head, node)
    }

    fn unlink(&self, state: &mut ListState<T>, node: &NodeRef<T>) -> Result<(), ListError> {
        self.ensure_member(node)?;

        let (prev, next) = {
            let links = node.links.lock();
            match (&links.prev, &links.next) {
                (Link::Live(prev), Link::Live(next)) => (Arc::clone(prev), Arc::clone(next)),
                _ => return Err(self.corrupted("member node with stale or missing links")),
            }
        };
        // Separate statements: in a one-node ring both neighbours are `node`.
        let prev_ok = prev.links.lock().next.points_to(node);
        let next_ok = next.links.lock().prev.points_to(node);
        if !prev_ok || !next_ok {
            return Err(self.corrupted("neighbours do not point back at the node"));
        }

        let old_head = state
            .head
            .clone()
            .ok_or_else(|| self.corrupted("member node in an empty list"))?;
        let was_head = Arc::ptr_eq(&old_head, node);

        if state.count <= 1 {
            if !was_head || !Arc::ptr_eq(&next, node) {
                return Err(self.corrupted("single-node ring does not loop on its head"));
            }
            *node.links.lock() = Links {
                next: Link::None,
                prev: Link::None,
            };
            state.head = None;
        } else {
            prev.links.lock().next = Link::Live(Arc::clone(&next));
            next.links.lock().prev = Link::Live(Arc::clone(&prev));
            if was_head {
                next.set_head(true);
                state.head = Some(Arc::clone(&next));
            }
            // Keep the way forward for readers parked on this node, but end
            // the pass where the ring would have wrapped.
            let mut links = node.links.lock();
            links.next = if Arc::ptr_eq(&next, &old_head) {
                Link::None
            } else {
                Link::stale(&next)
            };
            links.prev = if was_head {
                Link::None
            } else {
                Link::stale(&prev)
            };
        }

        node.set_head(false);
        node.set_owner(DETACHED);
        let count = state.count.saturating_sub(1);
        self.set_count(state, count);
        Ok(())
    }

    fn find_in(&self, state: &ListState<T>, value: &T) -> Result<Option<NodeRef<T>>, ListError>
    where
        T: PartialEq,
    {
        let mut current = state.head.clone();
        for _ in 0..state.count {
            let node = current.ok_or_else(|| self.corrupted("ring shorter than its count"))?;
            if node.with_value(|v| v == value).unwrap_or(false) {
                return Ok(Some(node));
            }
            current = node.next_link();
        }
        Ok(None)
    }
}

impl<T> Default for ConcurrentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConcurrentList<T> {
    fn drop(&mut self) {
        // Member nodes hold strong links to each other; break the ring.
        self.clear();
    }
}

impl<T> fmt::Debug for ConcurrentList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentList")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Forward iterator returned by [`ConcurrentList::iter`].
///
/// Yields node handles. Ends after one pass, when it reaches the head again,
/// or when the cursor falls off a removed section of the ring.
pub struct Iter<'a, T> {
    list: &'a ConcurrentList<T>,
    cursor: Option<NodeRef<T>>,
    start: Option<NodeRef<T>>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = NodeRef<T>;

    fn next(&mut self) -> Option<NodeRef<T>> {
        let current = match self.cursor.take() {
            None if self.start.is_none() => {
                let first = self.list.first()?;
                self.start = Some(Arc::clone(&first));
                first
            }
            None => return None,
            Some(cursor) => {
                let next = self.list.next(&cursor)?;
                if self.start.as_ref().is_some_and(|s| Arc::ptr_eq(s, &next)) {
                    return None;
                }
                next
            }
        };
        self.cursor = Some(Arc::clone(&current));
        Some(current)
    }
}
