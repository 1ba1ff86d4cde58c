//! Lock-free per-symbol work counters.

mod error;
mod registry;
mod sync_counter;

pub use error::CounterError;
pub use registry::SyncCounterRegistry;
pub use sync_counter::{Counter, CounterSnapshot, PendingWork, SyncCounterSet};
