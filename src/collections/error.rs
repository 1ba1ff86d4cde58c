//! Error types for the intrusive list and node pool.

use thiserror::Error;

/// Errors raised by [`ConcurrentList`](super::ConcurrentList) and
/// [`NodePool`](super::NodePool).
///
/// `Corrupted` is an invariant violation: it means the ring no longer
/// matches its own bookkeeping, which only happens through a concurrency
/// bug. Callers should treat it as fatal rather than retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ListError {
    /// The node cannot take part in the requested operation in its current
    /// state (owned by another list, already linked, ...).
    #[error("invalid node state: {reason}")]
    InvalidNodeState {
        /// What was wrong with the node.
        reason: &'static str,
    },

    /// The node is not a member of the list it was used with.
    #[error("node is not a member of list {list_id}")]
    NodeNotInList {
        /// Identifier of the list the operation was issued against.
        list_id: u64,
    },

    /// The ring structure disagrees with the list's bookkeeping.
    #[error("list {list_id} corrupted: {message}")]
    Corrupted {
        /// Identifier of the corrupted list.
        list_id: u64,
        /// Description of the inconsistency.
        message: String,
    },
}
