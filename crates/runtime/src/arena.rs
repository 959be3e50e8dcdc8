//! Scratch arenas
//!
//! Thread-local bump allocation for transient values built inside
//! intrinsics (string assembly, split buffers, codec staging). Nothing
//! allocated here survives the intrinsic call: results are copied into
//! heap objects before return, so the arena can be reset wholesale.
//!
//! The arena is thread-local, not task-local; tasks on the event loop
//! thread share one arena, parallel-pool workers each get their own.

use bumpalo::Bump;
use std::cell::RefCell;

/// Reset the arena once this much scratch has accumulated.
const SCRATCH_RESET_THRESHOLD: usize = 4 * 1024 * 1024;

thread_local! {
    static SCRATCH: RefCell<Bump> = RefCell::new(Bump::new());
    static SCRATCH_BYTES: RefCell<usize> = const { RefCell::new(0) };
}

/// Run `f` with the thread's scratch arena. The arena may be reset
/// after the call; do not let references escape.
pub fn with_scratch<F, R>(f: F) -> R
where
    F: FnOnce(&Bump) -> R,
{
    SCRATCH.with(|arena| {
        let bump = arena.borrow();
        let result = f(&bump);
        let allocated = bump.allocated_bytes();
        drop(bump);
        SCRATCH_BYTES.with(|bytes| *bytes.borrow_mut() = allocated);
        if allocated > SCRATCH_RESET_THRESHOLD {
            scratch_reset();
        }
        result
    })
}

/// Reset the thread's scratch arena.
pub fn scratch_reset() {
    SCRATCH.with(|arena| arena.borrow_mut().reset());
    SCRATCH_BYTES.with(|bytes| *bytes.borrow_mut() = 0);
}

/// Current scratch usage on this thread (diagnostics).
pub fn scratch_bytes() -> usize {
    SCRATCH_BYTES.with(|bytes| *bytes.borrow())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_alloc_and_reset() {
        scratch_reset();
        let joined = with_scratch(|bump| {
            let a = bump.alloc_str("hello");
            let b = bump.alloc_str(" world");
            format!("{}{}", a, b)
        });
        assert_eq!(joined, "hello world");
        assert!(scratch_bytes() > 0);
        scratch_reset();
        assert_eq!(scratch_bytes(), 0);
    }
}
