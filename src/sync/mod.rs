//! Busy-wait locking primitives for short critical sections.
//!
//! Two locks live here:
//!
//! - [`ReentrantSpinMutex`]: an owner-tracked, recursive spin mutex used by
//!   the list, the node pool and the queue to serialize structural mutation.
//! - [`SpinLock`]: a plain, non-reentrant spin lock that guards a single
//!   node's links and payload.
//!
//! Neither lock parks the thread. Both must only protect O(1) pointer or
//! counter updates and must never be held across I/O, channel operations or
//! any other call that can block.

mod owner;
mod reentrant;
mod spin_lock;

pub use owner::OwnerId;
pub use reentrant::{ReentrantSpinGuard, ReentrantSpinMutex};
pub use spin_lock::{SpinLock, SpinLockGuard};
