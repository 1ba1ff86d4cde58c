//! Counter set errors.

use super::sync_counter::CounterSnapshot;
use thiserror::Error;

/// Errors raised by [`SyncCounterSet`](super::SyncCounterSet).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CounterError {
    /// `clear` was called while work was still pending. This is a caller
    /// bug, not a retryable condition.
    #[error("cannot clear counters for {symbol} with work pending: {pending}")]
    NotCompleted {
        /// Symbol of the counter set.
        symbol: String,
        /// Counter values at the time of the call.
        pending: CounterSnapshot,
    },
}
