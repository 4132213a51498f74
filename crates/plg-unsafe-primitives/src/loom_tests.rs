//! Loom tests for the recursive critical-section lock
//!
//! Loom explores all interleavings of the two contending owners below, so a
//! missing Acquire/Release edge shows up as a lost update.
//!
//! # Running Loom Tests
//!
//! ```bash
//! cargo test --package plg-unsafe-primitives --features loom -- --test-threads=1 loom
//! ```

#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::sync::{LockOwner, RecursiveLock};
    use loom::sync::atomic::{AtomicUsize, Ordering};
    use loom::sync::Arc;
    use loom::thread;

    /// Non-atomic read-modify-write under the lock. If two owners ever
    /// overlap, one increment is lost.
    fn bump(lock: &RecursiveLock<AtomicUsize>, owner: &LockOwner) {
        let guard = lock.lock(owner);
        let v = guard.load(Ordering::Relaxed);
        guard.store(v + 1, Ordering::Relaxed);
    }

    #[test]
    fn loom_two_owners_are_mutually_exclusive() {
        loom::model(|| {
            let lock = Arc::new(RecursiveLock::new(AtomicUsize::new(0)));

            let l1 = lock.clone();
            let l2 = lock.clone();

            let t1 = thread::spawn(move || bump(&l1, &LockOwner::new()));
            let t2 = thread::spawn(move || bump(&l2, &LockOwner::new()));

            t1.join().unwrap();
            t2.join().unwrap();

            let guard = lock.lock(&LockOwner::new());
            assert_eq!(guard.load(Ordering::Relaxed), 2, "lost update");
        });
    }

    #[test]
    fn loom_reentry_does_not_leak_ownership() {
        loom::model(|| {
            let lock = Arc::new(RecursiveLock::new(AtomicUsize::new(0)));

            let l1 = lock.clone();
            let t1 = thread::spawn(move || {
                let me = LockOwner::new();
                let outer = l1.lock(&me);
                bump(&l1, &me);
                outer.fetch_add(1, Ordering::Relaxed);
            });
            let l2 = lock.clone();
            let t2 = thread::spawn(move || bump(&l2, &LockOwner::new()));

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(lock.owner(), None);
            assert_eq!(lock.lock(&LockOwner::new()).load(Ordering::Relaxed), 3);
        });
    }
}
