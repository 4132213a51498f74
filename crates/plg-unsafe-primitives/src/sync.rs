//! Recursive critical-section lock
//!
//! Models the kernel's scheduler critical section: a spin lock tagged with the
//! identity of its holder, which the same holder may re-enter any number of
//! times. Lock/unlock passes over a process' threads run entirely under this
//! lock so no thread can be created, destroyed or rescheduled halfway through
//! a pass.
//!
//! Holders are [`LockOwner`] tokens. Every token carries a process-wide
//! unique id, cannot be cloned and is `!Sync`, so a given id can only be
//! presented by one thread at a time. Reentry is therefore always the same
//! thread nesting, never two threads sharing an id.
//!
//! The guard only hands out `&T`. Mutation goes through interior mutability
//! in `T` (the kernel uses a `RefCell`), which keeps reentrant guards from
//! ever producing aliasing `&mut T`.

use core::marker::PhantomData;
use core::ops::Deref;

#[cfg(all(test, feature = "loom"))]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(not(all(test, feature = "loom")))]
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Owner id meaning "unlocked".
const NO_OWNER: u64 = 0;

/// Source of owner ids. Not modeled by loom: ids only need to be unique.
static NEXT_OWNER_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

/// Identity of a critical-section holder.
///
/// Ids are never reused. The token can move between threads but cannot be
/// shared by reference across them.
#[derive(Debug)]
pub struct LockOwner {
    id: u64,
    _not_sync: PhantomData<core::cell::Cell<()>>,
}

impl LockOwner {
    pub fn new() -> Self {
        let id = NEXT_OWNER_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        Self {
            id,
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

/// A reentrant spin lock keyed by [`LockOwner`].
///
/// # Safety Invariants
///
/// 1. `owner` is `NO_OWNER` iff `depth` is zero
/// 2. Only the thread holding the `LockOwner` whose id is stored in `owner`
///    touches `depth` while it is held
/// 3. `data` is only reachable through a live guard
pub struct RecursiveLock<T> {
    owner: AtomicU64,
    depth: AtomicU32,
    data: T,
}

impl<T> RecursiveLock<T> {
    /// Create an unlocked lock around `data`.
    #[cfg(not(all(test, feature = "loom")))]
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU32::new(0),
            data,
        }
    }

    /// Create an unlocked lock around `data`.
    #[cfg(all(test, feature = "loom"))]
    pub fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU32::new(0),
            data,
        }
    }

    /// Acquire the lock for `owner`, spinning while another owner holds it.
    ///
    /// Re-entering with the current owner nests.
    pub fn lock(&self, owner: &LockOwner) -> RecursiveLockGuard<'_, T> {
        let owner = owner.id;
        if self.owner.load(Ordering::Acquire) == owner {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return RecursiveLockGuard { lock: self };
        }
        loop {
            match self
                .owner
                .compare_exchange_weak(NO_OWNER, owner, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(_) => spin_hint(),
            }
        }
        self.depth.store(1, Ordering::Relaxed);
        RecursiveLockGuard { lock: self }
    }

    /// Try to acquire without spinning.
    pub fn try_lock(&self, owner: &LockOwner) -> Option<RecursiveLockGuard<'_, T>> {
        let owner = owner.id;
        if self.owner.load(Ordering::Acquire) == owner {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(RecursiveLockGuard { lock: self });
        }
        self.owner
            .compare_exchange(NO_OWNER, owner, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.depth.store(1, Ordering::Relaxed);
                RecursiveLockGuard { lock: self }
            })
    }

    /// Current holder, if any.
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.data
    }

    fn release(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Release);
        }
    }
}

#[cfg(all(test, feature = "loom"))]
fn spin_hint() {
    loom::thread::yield_now();
}

#[cfg(not(all(test, feature = "loom")))]
fn spin_hint() {
    core::hint::spin_loop();
}

// SAFETY: the lock serializes all access to `data` across owners, and the
// guard only exposes shared references. An owner id can only be presented by
// the one thread holding its `LockOwner` (unique, not `Clone`, `!Sync`), so
// the reentry path never admits a second thread. `T: Send` is enough because
// the value is observed from one thread at a time, exactly as for a mutex.
unsafe impl<T: Send> Sync for RecursiveLock<T> {}
// SAFETY: moving the lock moves `data`, which is Send.
unsafe impl<T: Send> Send for RecursiveLock<T> {}

impl<T: core::fmt::Debug> core::fmt::Debug for RecursiveLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecursiveLock")
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Scoped hold on a [`RecursiveLock`]; releases one nesting level on drop.
pub struct RecursiveLockGuard<'a, T> {
    lock: &'a RecursiveLock<T>,
}

impl<T> Deref for RecursiveLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for RecursiveLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn test_reentrant_lock_nests_and_releases() {
        let lock = RecursiveLock::new(Cell::new(0u32));
        let me = LockOwner::new();
        {
            let outer = lock.lock(&me);
            outer.set(1);
            {
                let inner = lock.lock(&me);
                inner.set(inner.get() + 1);
                assert_eq!(lock.owner(), Some(me.id()));
            }
            // Inner release must not drop ownership
            assert_eq!(lock.owner(), Some(me.id()));
            assert_eq!(outer.get(), 2);
        }
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn test_try_lock_refuses_other_owner() {
        let lock = RecursiveLock::new(());
        let (a, b) = (LockOwner::new(), LockOwner::new());
        let _held = lock.lock(&a);
        assert!(lock.try_lock(&b).is_none());
        assert!(lock.try_lock(&a).is_some());
    }

    #[test]
    fn test_owner_ids_are_unique_and_nonzero() {
        let a = LockOwner::new();
        let b = LockOwner::default();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), NO_OWNER);
    }

    #[test]
    fn test_into_inner() {
        let lock = RecursiveLock::new(Cell::new(5u8));
        lock.lock(&LockOwner::new()).set(9);
        assert_eq!(lock.into_inner().get(), 9);
    }
}
