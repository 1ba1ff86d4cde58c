//! Owner-tracked recursive spin mutex.

use super::owner::OwnerId;
use crossbeam::utils::Backoff;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const UNLOCKED: u64 = 0;

/// A recursive busy-wait mutex keyed by [`OwnerId`].
///
/// The owning context may lock repeatedly; each extra acquisition bumps a
/// hold count and must be matched by a release. Acquisition never parks the
/// thread: contention is resolved by spinning with [`Backoff`], so the
/// protected region must stay short and must never contain a blocking call.
///
/// Because the same owner can hold several guards at once, guards only hand
/// out `&T`. Mutable state goes in a `RefCell` (or atomics) inside the
/// mutex, the same shape as `parking_lot::ReentrantMutex<RefCell<T>>`.
///
/// # Panics
///
/// Releasing a mutex that is not locked, or releasing it from an owner that
/// does not hold it, is a programming error and panics.
///
/// # Example
///
/// ```
/// use order_runtime::sync::ReentrantSpinMutex;
/// use std::cell::Cell;
///
/// let mutex = ReentrantSpinMutex::new(Cell::new(0));
/// {
///     let outer = mutex.lock();
///     let inner = mutex.lock(); // same thread, does not deadlock
///     inner.set(inner.get() + 1);
///     outer.set(outer.get() + 1);
/// }
/// assert!(!mutex.is_locked());
/// assert_eq!(mutex.lock().get(), 2);
/// ```
pub struct ReentrantSpinMutex<T: ?Sized = ()> {
    owner: AtomicU64,
    holds: AtomicUsize,
    data: T,
}

// SAFETY: `data` is only reachable through a guard, and guards exist only on
// the single owner holding the lock. Sharing the mutex therefore only ever
// gives one owner at a time access to `T`, which requires `T: Send`, not
// `T: Sync`.
unsafe impl<T: ?Sized + Send> Sync for ReentrantSpinMutex<T> {}

impl<T> ReentrantSpinMutex<T> {
    /// Creates an unlocked mutex around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            holds: AtomicUsize::new(0),
            data,
        }
    }

    /// Consumes the mutex and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T: ?Sized> ReentrantSpinMutex<T> {
    fn try_acquire_for(&self, owner: OwnerId) -> bool {
        let current = self.owner.load(Ordering::Acquire);
        if current == owner.get() {
            self.holds.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if current == UNLOCKED
            && self
                .owner
                .compare_exchange(UNLOCKED, owner.get(), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            self.holds.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn acquire_for(&self, owner: OwnerId) {
        let backoff = Backoff::new();
        while !self.try_acquire_for(owner) {
            backoff.snooze();
        }
    }

    fn release_for(&self, owner: OwnerId) {
        let current = self.owner.load(Ordering::Acquire);
        if current == UNLOCKED {
            panic!("ReentrantSpinMutex released by {owner} while unlocked");
        }
        if current != owner.get() {
            panic!("ReentrantSpinMutex released by {owner} while held by owner#{current}");
        }

        let previous = self.holds.fetch_sub(1, Ordering::Relaxed);
        if previous <= 1 {
            self.holds.store(0, Ordering::Relaxed);
            self.owner.store(UNLOCKED, Ordering::Release);
        }
    }

    /// Acquires the mutex for the calling thread and returns a scoped guard.
    ///
    /// Guards are always keyed by the calling thread's [`OwnerId`], so two
    /// threads can never hold guards to the same data at once.
    pub fn lock(&self) -> ReentrantSpinGuard<'_, T> {
        let owner = OwnerId::current();
        self.acquire_for(owner);
        ReentrantSpinGuard {
            mutex: self,
            owner,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the mutex for the calling thread without spinning.
    pub fn try_lock(&self) -> Option<ReentrantSpinGuard<'_, T>> {
        let owner = OwnerId::current();
        self.try_acquire_for(owner).then(|| ReentrantSpinGuard {
            mutex: self,
            owner,
            _not_send: PhantomData,
        })
    }

    /// Returns `true` if any owner currently holds the mutex.
    #[must_use]
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNLOCKED
    }

    /// Returns `true` if the calling thread holds the mutex.
    #[must_use]
    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == OwnerId::current().get()
    }

    /// Returns `true` if a `lock()` from the calling thread would have to
    /// spin, i.e. another owner holds the mutex.
    #[must_use]
    pub fn will_block(&self) -> bool {
        let current = self.owner.load(Ordering::Acquire);
        current != UNLOCKED && current != OwnerId::current().get()
    }

    /// Number of outstanding holds. Only meaningful to the owner.
    #[must_use]
    pub fn hold_count(&self) -> usize {
        self.holds.load(Ordering::Relaxed)
    }
}

/// Raw, owner-keyed locking.
///
/// Only available on a data-less mutex: an [`OwnerId`] is `Copy`, so two
/// contexts presenting the same id would both be admitted, and that must
/// never hand out shared access to data.
///
/// ```compile_fail
/// use order_runtime::sync::{OwnerId, ReentrantSpinMutex};
/// use std::cell::Cell;
///
/// let mutex = ReentrantSpinMutex::new(Cell::new(0));
/// mutex.acquire(OwnerId::unique());
/// ```
impl ReentrantSpinMutex<()> {
    /// Attempts to acquire the mutex for `owner` without spinning.
    ///
    /// Returns `true` if the mutex was free or already held by `owner`.
    pub fn try_acquire(&self, owner: OwnerId) -> bool {
        self.try_acquire_for(owner)
    }

    /// Acquires the mutex for `owner`, busy-waiting until it is free.
    pub fn acquire(&self, owner: OwnerId) {
        self.acquire_for(owner);
    }

    /// Releases one hold of `owner`. The mutex becomes free when the hold
    /// count drops to zero.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is unlocked or held by a different owner.
    pub fn release(&self, owner: OwnerId) {
        self.release_for(owner);
    }
}

impl<T: Default> Default for ReentrantSpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for ReentrantSpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantSpinMutex")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("holds", &self.holds.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Scoped hold on a [`ReentrantSpinMutex`].
///
/// Released on drop, including during unwinding. Not `Send`: a hold belongs
/// to the owner that took it.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct ReentrantSpinGuard<'a, T: ?Sized> {
    mutex: &'a ReentrantSpinMutex<T>,
    owner: OwnerId,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> ReentrantSpinGuard<'_, T> {
    /// The owner this guard was acquired for.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl<T: ?Sized> Deref for ReentrantSpinGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.mutex.data
    }
}

impl<T: ?Sized> Drop for ReentrantSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_for(self.owner);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReentrantSpinGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
