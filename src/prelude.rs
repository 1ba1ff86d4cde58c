/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 14/10/26
******************************************************************************/

//! Prelude module that re-exports commonly used types and traits.
//!
//! Instead of importing each type individually, you can use:
//!
//! ```rust
//! use order_runtime::prelude::*;
//! ```

// Collections and locks
pub use crate::collections::{ConcurrentList, ListError, NodePool, NodeRef};
pub use crate::sync::ReentrantSpinMutex;

// Queue types
pub use crate::queue::{
    BoundedPooledQueue, EarliestTimeTracker, QueueConfig, QueueError, QueueScheduler,
    Reservation, TryEnqueueError,
};

// Counter types
pub use crate::counters::{
    Counter, CounterError, PendingWork, SyncCounterRegistry, SyncCounterSet,
};

// Store types
pub use crate::store::{
    DurableOrderStore, OrderRecord, OrderRef, OrderState, Side, StoreConfig, StoreError,
};

// Utility functions
pub use crate::utils::{current_time_millis, current_time_nanos};
