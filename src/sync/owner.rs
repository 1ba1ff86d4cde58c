use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_OWNER: OwnerId = OwnerId::allocate();
}

/// Identity of a lock holder.
///
/// Every thread gets a stable id the first time it touches a lock
/// ([`OwnerId::current`]). Explicit ids for the raw, data-less locking API
/// come from [`OwnerId::unique`] and are drawn from the same counter, so
/// they never alias a thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    /// Mints a fresh id that is distinct from every thread id and every
    /// other minted id.
    #[must_use]
    pub fn unique() -> Self {
        Self::allocate()
    }

    /// The id of the calling thread.
    #[must_use]
    #[inline]
    pub fn current() -> Self {
        THREAD_OWNER.with(|owner| *owner)
    }

    /// Raw numeric value.
    #[must_use]
    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }

    fn allocate() -> Self {
        let id = NEXT_THREAD_OWNER.fetch_add(1, Ordering::Relaxed);
        // Zero is the "unlocked" marker and is never handed out.
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}
