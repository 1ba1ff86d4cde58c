//! Error types for the bounded queue.

use crate::collections::ListError;
use std::fmt;
use thiserror::Error;

/// Errors returned by dequeue-side queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// `try_dequeue` was called while a reservation from an earlier call
    /// was still outstanding. Only one consumer may drive a queue.
    #[error("dequeue attempted while a previous reservation is uncommitted")]
    UncommittedDequeue,

    /// The queue has been terminated; consumers should leave their loop.
    #[error("queue terminated")]
    Terminated,

    /// The reserved entry was discarded by `clear` before it was committed.
    #[error("reserved entry was discarded before commit")]
    EntryDiscarded,

    /// The underlying list reported an invariant violation.
    #[error(transparent)]
    List(#[from] ListError),
}

impl QueueError {
    /// Returns `true` for the terminal signal.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// Error returned by
/// [`BoundedPooledQueue::try_enqueue`](super::BoundedPooledQueue::try_enqueue).
///
/// `Full` and `Terminated` hand the rejected value back to the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TryEnqueueError<T> {
    /// The queue is at capacity. Non-fatal: retry later.
    Full(T),
    /// The queue has been terminated.
    Terminated(T),
    /// The underlying list reported an invariant violation. The value is
    /// dropped.
    Corrupted(ListError),
}

impl<T> TryEnqueueError<T> {
    /// Returns the value that could not be enqueued.
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Full(value) | Self::Terminated(value) => Some(value),
            Self::Corrupted(_) => None,
        }
    }

    /// Returns `true` if this error is the `Full` variant.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns `true` if this error is the `Terminated` variant.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

impl<T> fmt::Display for TryEnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "queue is full"),
            Self::Terminated(_) => write!(f, "queue terminated"),
            Self::Corrupted(err) => write!(f, "enqueue failed: {err}"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TryEnqueueError<T> {}
