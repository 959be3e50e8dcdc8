//! Hierarchical cancel tokens
//!
//! Tokens form a tree. Cancelling a token flips its flag and cancels
//! every descendant synchronously at the cancel call; delivery to
//! affected tasks happens at their next suspension point (the
//! scheduler's job, not this module's). A deadline is carried on the
//! token and delivered through the same cancellation path when it
//! expires.
//!
//! A child created under an already-cancelled parent is born cancelled;
//! there is no window where a descendant outruns its ancestor's
//! cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

pub struct CancelToken {
    id: u64,
    cancelled: AtomicBool,
    /// Effective deadline: the minimum of this token's own deadline and
    /// every ancestor's, computed at creation.
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<CancelToken>>>,
}

impl CancelToken {
    /// A root token: never expires, cancelled only explicitly.
    pub fn root() -> Arc<CancelToken> {
        Arc::new(CancelToken {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            deadline: None,
            children: Mutex::new(Vec::new()),
        })
    }

    /// A child token, optionally tightening the deadline. The child
    /// inherits cancellation state and can never outlive the parent's
    /// deadline.
    pub fn child(self: &Arc<CancelToken>, deadline: Option<Instant>) -> Arc<CancelToken> {
        let effective = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Arc::new(CancelToken {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(self.is_cancelled()),
            deadline: effective,
            children: Mutex::new(Vec::new()),
        });
        self.children
            .lock()
            .expect("token children poisoned")
            .push(Arc::downgrade(&child));
        child
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel this token and, synchronously, every descendant.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return; // already cancelled; descendants are too
        }
        let children = self.children.lock().expect("token children poisoned");
        for child in children.iter() {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Deadline check; expiry is equivalent to cancellation and is
    /// delivered through the same path.
    pub fn expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    /// Cancelled or past its deadline.
    pub fn should_cancel(&self, now: Instant) -> bool {
        self.is_cancelled() || self.expired(now)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_propagates_to_descendants() {
        let root = CancelToken::root();
        let child = root.child(None);
        let grandchild = child.child(None);
        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(root.is_cancelled());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let root = CancelToken::root();
        let child = root.child(None);
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_born_cancelled_under_cancelled_parent() {
        let root = CancelToken::root();
        root.cancel();
        let child = root.child(None);
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_deadline_inherits_minimum() {
        let now = Instant::now();
        let near = now + Duration::from_millis(10);
        let far = now + Duration::from_secs(60);
        let root = CancelToken::root();
        let parent = root.child(Some(near));
        let child = parent.child(Some(far));
        assert_eq!(child.deadline(), Some(near));
    }

    #[test]
    fn test_expiry_is_cancellation() {
        let now = Instant::now();
        let token = CancelToken::root().child(Some(now));
        assert!(token.expired(now + Duration::from_millis(1)));
        assert!(token.should_cancel(now + Duration::from_millis(1)));
        assert!(!token.is_cancelled()); // flag flips only via cancel()
    }
}
