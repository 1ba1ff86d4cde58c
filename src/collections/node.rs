//! List nodes and their link representation.

use crate::sync::SpinLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Shared handle to a list node.
///
/// Handles are what callers keep to remove or move an element in O(1). A
/// handle stays valid after the node leaves its list; [`ListNode::is_linked`]
/// and [`ListNode::owner_id`] tell whether it is still a member.
pub type NodeRef<T> = Arc<ListNode<T>>;

pub(crate) const DETACHED: u64 = 0;

/// A neighbour reference.
///
/// Nodes inside a ring hold strong links to both neighbours. When a node is
/// detached its links are downgraded to weak "stale" links so that a reader
/// parked on it can keep walking without keeping removed nodes alive.
pub(crate) enum Link<T> {
    None,
    Live(NodeRef<T>),
    Stale(Weak<ListNode<T>>),
}

impl<T> Link<T> {
    #[inline]
    pub(crate) fn resolve(&self) -> Option<NodeRef<T>> {
        match self {
            Link::None => None,
            Link::Live(node) => Some(Arc::clone(node)),
            Link::Stale(weak) => weak.upgrade(),
        }
    }

    #[inline]
    pub(crate) fn points_to(&self, target: &NodeRef<T>) -> bool {
        match self {
            Link::Live(node) => Arc::ptr_eq(node, target),
            _ => false,
        }
    }

    pub(crate) fn stale(node: &NodeRef<T>) -> Self {
        Link::Stale(Arc::downgrade(node))
    }
}

pub(crate) struct Links<T> {
    pub(crate) next: Link<T>,
    pub(crate) prev: Link<T>,
}

impl<T> Links<T> {
    const fn empty() -> Self {
        Self {
            next: Link::None,
            prev: Link::None,
        }
    }
}

/// An element of a [`ConcurrentList`](super::ConcurrentList).
///
/// The payload and the links each sit behind their own short spin lock, so
/// a reader can follow `next`/`prev` or inspect the value without taking the
/// list's mutex.
pub struct ListNode<T> {
    owner: AtomicU64,
    head: AtomicBool,
    generation: AtomicU64,
    value: SpinLock<Option<T>>,
    pub(crate) links: SpinLock<Links<T>>,
}

impl<T> ListNode<T> {
    /// Allocates a detached node holding `value`.
    #[must_use]
    pub fn new(value: T) -> NodeRef<T> {
        Arc::new(Self {
            owner: AtomicU64::new(DETACHED),
            head: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            value: SpinLock::new(Some(value)),
            links: SpinLock::new(Links::empty()),
        })
    }

    /// Identifier of the list this node belongs to, if any.
    #[must_use]
    #[inline]
    pub fn owner_id(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            DETACHED => None,
            id => Some(id),
        }
    }

    /// Returns `true` while the node is a member of some list.
    #[must_use]
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != DETACHED
    }

    /// Number of times this node has been revived by a
    /// [`NodePool`](super::NodePool). A handle that recorded an older
    /// generation refers to a previous life of the node.
    #[must_use]
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Runs `f` against the payload. Returns `None` if the payload has been
    /// taken (the node was freed back to a pool).
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.value.lock();
        guard.as_ref().map(f)
    }

    /// Runs `f` against a mutable payload.
    pub fn with_value_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.value.lock();
        guard.as_mut().map(f)
    }

    /// Clones the payload out of the node.
    #[must_use]
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.lock().clone()
    }

    pub(crate) fn take_value(&self) -> Option<T> {
        self.value.lock().take()
    }

    pub(crate) fn revive(&self, value: T) {
        *self.links.lock() = Links::empty();
        self.head.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.value.lock() = Some(value);
    }

    #[inline]
    pub(crate) fn owner_raw(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn claim(&self, list_id: u64) -> Result<(), u64> {
        self.owner
            .compare_exchange(DETACHED, list_id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    #[inline]
    pub(crate) fn set_owner(&self, owner: u64) {
        self.owner.store(owner, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_head(&self) -> bool {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_head(&self, head: bool) {
        self.head.store(head, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next_link(&self) -> Option<NodeRef<T>> {
        self.links.lock().next.resolve()
    }

    #[inline]
    pub(crate) fn prev_link(&self) -> Option<NodeRef<T>> {
        self.links.lock().prev.resolve()
    }
}

impl<T: fmt::Debug> fmt::Debug for ListNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListNode")
            .field("owner", &self.owner_id())
            .field("generation", &self.generation())
            .field("value", &*self.value.lock())
            .finish_non_exhaustive()
    }
}
