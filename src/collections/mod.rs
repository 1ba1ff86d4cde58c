//! Intrusive concurrent collections.
//!
//! [`ConcurrentList`] is a doubly-linked ring whose nodes are shared handles
//! ([`NodeRef`]); [`NodePool`] recycles those nodes. Both are the building
//! blocks of [`BoundedPooledQueue`](crate::queue::BoundedPooledQueue).

mod error;
mod list;
mod node;
mod pool;

pub use error::ListError;
pub use list::{ConcurrentList, Iter};
pub use node::{ListNode, NodeRef};
pub use pool::NodePool;
