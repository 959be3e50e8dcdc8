//! Parallel kernel loops
//!
//! Opt-in data-parallel `parallel_for` and `parallel_reduce` over May
//! work-stealing coroutines, disjoint from the cooperative event loop.
//! A body is only dispatched here when the compiler proved (or the user
//! asserted) iteration independence: no shared mutation outside declared
//! reductions.
//!
//! Cancellation is observed at chunk boundaries: a chunk checks the
//! token before running and after each chunk completes. Reductions
//! require an associative combine; in deterministic mode partials are
//! combined in strict chunk-index order, so the result is invariant
//! under worker count, chunk size, and chunking schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

use may::coroutine;

use crate::cancel::CancelToken;
use crate::errors::{cancelled, RtError};

static POOL_INIT: Once = Once::new();

/// Default chunk size for kernel loops.
const DEFAULT_CHUNK: i64 = 1024;

/// Configure the May pool once per process. Stack size is modest: kernel
/// bodies are leaf computations, not deep call trees.
fn init_pool() {
    POOL_INIT.call_once(|| {
        may::config().set_stack_size(0x40000);
    });
}

fn chunk_ranges(start: i64, end: i64, chunk: i64) -> Vec<(i64, i64)> {
    let mut ranges = Vec::new();
    let mut lo = start;
    while lo < end {
        let hi = (lo + chunk).min(end);
        ranges.push((lo, hi));
        lo = hi;
    }
    ranges
}

/// Run `body` for every index in `[start, end)` across the pool.
/// The first body error wins; remaining chunks are skipped at their
/// boundaries.
pub fn parallel_for<F>(
    start: i64,
    end: i64,
    token: &Arc<CancelToken>,
    body: F,
) -> Result<(), RtError>
where
    F: Fn(i64) -> Result<(), RtError> + Send + Sync + 'static,
{
    init_pool();
    let body = Arc::new(body);
    let failed: Arc<Mutex<Option<RtError>>> = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for (lo, hi) in chunk_ranges(start, end, DEFAULT_CHUNK) {
        let body = Arc::clone(&body);
        let failed = Arc::clone(&failed);
        let stop = Arc::clone(&stop);
        let token = Arc::clone(token);
        // Chunks are independent by the caller's proof obligation; the
        // coroutine only captures Sync state.
        let handle = unsafe {
            coroutine::spawn(move || {
                if stop.load(Ordering::Acquire) || token.is_cancelled() {
                    return;
                }
                for i in lo..hi {
                    if let Err(e) = body(i) {
                        let mut slot = failed.lock().expect("kernel error slot poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        stop.store(true, Ordering::Release);
                        return;
                    }
                }
                if token.is_cancelled() {
                    stop.store(true, Ordering::Release);
                }
            })
        };
        handles.push(handle);
    }
    for handle in handles {
        handle.join().map_err(|_| {
            crate::errors::internal("parallel kernel worker panicked")
        })?;
    }
    if token.is_cancelled() {
        return Err(cancelled());
    }
    let result = match failed.lock().expect("kernel error slot poisoned").take() {
        Some(e) => Err(e),
        None => Ok(()),
    };
    result
}

/// Map every index through `body` and fold the results with `combine`
/// starting from `identity`.
///
/// `combine` must be associative. Partials are always combined in
/// strict chunk-index order (the deterministic-mode contract; in
/// non-deterministic builds this is simply the same code path).
pub fn parallel_reduce<T, B, C>(
    start: i64,
    end: i64,
    token: &Arc<CancelToken>,
    identity: T,
    body: B,
    combine: C,
) -> Result<T, RtError>
where
    T: Clone + Send + 'static,
    B: Fn(i64) -> Result<T, RtError> + Send + Sync + 'static,
    C: Fn(T, T) -> T + Send + Sync + 'static,
{
    init_pool();
    let ranges = chunk_ranges(start, end, DEFAULT_CHUNK);
    let body = Arc::new(body);
    let combine = Arc::new(combine);
    let partials: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; ranges.len()]));
    let failed: Arc<Mutex<Option<RtError>>> = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for (chunk_idx, (lo, hi)) in ranges.iter().copied().enumerate() {
        let body = Arc::clone(&body);
        let combine = Arc::clone(&combine);
        let partials = Arc::clone(&partials);
        let failed = Arc::clone(&failed);
        let stop = Arc::clone(&stop);
        let token = Arc::clone(token);
        let identity = identity.clone();
        let handle = unsafe {
            coroutine::spawn(move || {
                if stop.load(Ordering::Acquire) || token.is_cancelled() {
                    return;
                }
                let mut acc = identity;
                for i in lo..hi {
                    match body(i) {
                        Ok(v) => acc = combine(acc, v),
                        Err(e) => {
                            let mut slot = failed.lock().expect("kernel error slot poisoned");
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            stop.store(true, Ordering::Release);
                            return;
                        }
                    }
                }
                partials.lock().expect("partials poisoned")[chunk_idx] = Some(acc);
            })
        };
        handles.push(handle);
    }
    for handle in handles {
        handle.join().map_err(|_| {
            crate::errors::internal("parallel kernel worker panicked")
        })?;
    }
    if token.is_cancelled() {
        return Err(cancelled());
    }
    if let Some(e) = failed.lock().expect("kernel error slot poisoned").take() {
        return Err(e);
    }
    // Strict chunk-index order: deterministic under any schedule.
    let mut acc = identity;
    for partial in partials.lock().expect("partials poisoned").drain(..) {
        if let Some(p) = partial {
            acc = combine(acc, p);
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_for_covers_range() {
        let hits = Arc::new(Mutex::new(vec![false; 5000]));
        let hits2 = Arc::clone(&hits);
        let token = CancelToken::root();
        parallel_for(0, 5000, &token, move |i| {
            hits2.lock().unwrap()[i as usize] = true;
            Ok(())
        })
        .unwrap();
        assert!(hits.lock().unwrap().iter().all(|h| *h));
    }

    #[test]
    fn test_reduce_sum_matches_serial() {
        let token = CancelToken::root();
        let sum = parallel_reduce(1, 10_001, &token, 0i64, |i| Ok(i), |a, b| a + b).unwrap();
        assert_eq!(sum, (1..10_001i64).sum::<i64>());
    }

    #[test]
    fn test_reduce_deterministic_across_runs() {
        // Same input, same chunking policy: byte-identical results.
        let token = CancelToken::root();
        let run = || {
            parallel_reduce(0, 4096, &token, 1.0f64, |i| Ok(1.0 + (i as f64) * 1e-9), |a, b| a * b)
                .unwrap()
        };
        let a = run();
        let b = run();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_body_error_propagates() {
        let token = CancelToken::root();
        let result = parallel_for(0, 100, &token, |i| {
            if i == 42 {
                Err(crate::errors::value_error("bad index"))
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap_err().message, "bad index");
    }

    #[test]
    fn test_cancelled_token_stops_kernel() {
        let token = CancelToken::root();
        token.cancel();
        let result = parallel_for(0, 1_000_000, &token, |_| Ok(()));
        assert_eq!(result.unwrap_err().kind, molt_core::ErrorKind::Cancelled);
    }
}
