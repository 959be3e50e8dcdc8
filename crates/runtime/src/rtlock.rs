//! The runtime serialization lock
//!
//! One re-entrant mutex per runtime instance serializes all user-visible
//! state mutation: heap object headers, module globals, scheduler queues.
//! Re-entrancy is tracked with a thread-local depth counter so intrinsics
//! that call back into runtime services do not self-deadlock.
//!
//! Lock ordering: this lock is always acquired BEFORE any handle-shard
//! lock. The handle registry debug-asserts that ordering; taking a shard
//! lock first and then this lock is a defect.
//!
//! Blocking host calls (file reads, poll waits, subprocess waits) must
//! never run while this lock is held; the poller and the parallel pool
//! release it around every syscall that can block.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

thread_local! {
    /// Re-entrancy depth of the current thread, per process. Nonzero
    /// means this thread owns some runtime lock.
    static LOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Re-entrant runtime lock.
pub struct RtLock {
    /// Token of the owning thread, 0 when free.
    owner: Mutex<u64>,
    cond: Condvar,
}

impl Default for RtLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RtLock {
    pub fn new() -> Self {
        RtLock {
            owner: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Acquire, blocking other threads. Re-entrant on the owning thread.
    pub fn lock(&self) -> RtLockGuard<'_> {
        let me = thread_token();
        let depth = LOCK_DEPTH.with(|d| d.get());
        if depth > 0 {
            // Already held by this thread; just deepen.
            debug_assert_eq!(
                *self.owner.lock().expect("runtime lock poisoned"),
                me,
                "re-entrant acquire on a lock owned by another thread"
            );
        } else {
            let mut owner = self.owner.lock().expect("runtime lock poisoned");
            while *owner != 0 {
                owner = self.cond.wait(owner).expect("runtime lock poisoned");
            }
            *owner = me;
        }
        LOCK_DEPTH.with(|d| d.set(depth + 1));
        RtLockGuard { lock: self }
    }

    /// True when the calling thread currently holds the lock. Used by
    /// debug assertions on header-mutation paths.
    pub fn held_by_current_thread(&self) -> bool {
        LOCK_DEPTH.with(|d| d.get()) > 0
            && *self.owner.lock().expect("runtime lock poisoned") == thread_token()
    }

    fn unlock(&self) {
        let depth = LOCK_DEPTH.with(|d| d.get());
        debug_assert!(depth > 0, "unlock without lock");
        LOCK_DEPTH.with(|d| d.set(depth - 1));
        if depth == 1 {
            let mut owner = self.owner.lock().expect("runtime lock poisoned");
            *owner = 0;
            drop(owner);
            self.cond.notify_one();
        }
    }
}

/// Guard returned by [`RtLock::lock`]; releases one level on drop.
pub struct RtLockGuard<'a> {
    lock: &'a RtLock,
}

impl Drop for RtLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reentrant_same_thread() {
        let lock = RtLock::new();
        let _a = lock.lock();
        let _b = lock.lock();
        assert!(lock.held_by_current_thread());
    }

    #[test]
    fn test_released_after_all_guards_drop() {
        let lock = RtLock::new();
        {
            let _a = lock.lock();
            let _b = lock.lock();
        }
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn test_excludes_other_threads() {
        let lock = Arc::new(RtLock::new());
        let guard = lock.lock();
        let other = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            // Must block until the main thread releases.
            let _g = other.lock();
            true
        });
        // Give the spawned thread a chance to contend, then release.
        std::thread::sleep(std::time::Duration::from_millis(10));
        drop(guard);
        assert!(handle.join().unwrap());
    }
}
