//! The handle registry
//!
//! Handles, not raw pointers, are what cross compilation units and the
//! sandbox boundary. The registry is a sharded table striped by the low
//! bits of the slot index: resolution takes a shard read lock,
//! registration and release take a shard write lock.
//!
//! Lock ordering: the runtime serialization lock is always acquired
//! BEFORE any shard lock. All callers here are either under the runtime
//! lock already (register/release from intrinsics) or read-only
//! (resolve), so the ordering is structural.
//!
//! Resolution is monotonic within a process: a slot's pointer never
//! changes between registration and explicit release; release bumps the
//! slot generation so stale handles resolve to `None` instead of a
//! recycled object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use molt_core::{Handle, HANDLE_SHARDS};

/// Resource release hook attached to a handle. Runs under the runtime
/// lock at release time; never user-observable.
pub type Finalizer = Box<dyn FnOnce(usize) + Send + Sync>;

struct Slot {
    /// Object address; 0 when the slot is free.
    addr: usize,
    generation: u16,
    /// Process-wide registration sequence, for shutdown ordering.
    order: u64,
    finalizer: Option<Finalizer>,
}

#[derive(Default)]
struct ShardInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

pub struct HandleRegistry {
    shards: Vec<RwLock<ShardInner>>,
    next_shard: AtomicU64,
    next_order: AtomicU64,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        HandleRegistry {
            shards: (0..HANDLE_SHARDS)
                .map(|_| RwLock::new(ShardInner::default()))
                .collect(),
            next_shard: AtomicU64::new(0),
            next_order: AtomicU64::new(0),
        }
    }

    /// Issue a handle for an object address. Caller holds the runtime
    /// lock and owns one reference on behalf of the handle.
    pub fn register(&self, addr: usize) -> Handle {
        self.register_with(addr, None)
    }

    /// Issue a handle with an attached resource-release hook.
    pub fn register_with(&self, addr: usize, finalizer: Option<Finalizer>) -> Handle {
        debug_assert!(addr != 0, "cannot register a null address");
        let shard_id =
            (self.next_shard.fetch_add(1, Ordering::Relaxed) as usize) % HANDLE_SHARDS;
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shards[shard_id].write().expect("handle shard poisoned");
        let slot_idx = match shard.free.pop() {
            Some(idx) => {
                let slot = &mut shard.slots[idx as usize];
                slot.addr = addr;
                slot.order = order;
                slot.finalizer = finalizer;
                idx
            }
            None => {
                shard.slots.push(Slot {
                    addr,
                    generation: 0,
                    order,
                    finalizer,
                });
                (shard.slots.len() - 1) as u32
            }
        };
        let generation = shard.slots[slot_idx as usize].generation;
        // Global index interleaves the shard id in the low bits so the
        // handle's own bits pick the shard on resolve.
        Handle::pack((slot_idx << 4) | shard_id as u32, generation)
    }

    /// Resolve a handle to its object address. Shard read lock only.
    pub fn resolve(&self, h: Handle) -> Option<usize> {
        let shard_id = h.shard();
        let slot_idx = (h.index() >> 4) as usize;
        let shard = self.shards[shard_id].read().expect("handle shard poisoned");
        let slot = shard.slots.get(slot_idx)?;
        if slot.addr == 0 || slot.generation != h.generation() {
            return None;
        }
        Some(slot.addr)
    }

    /// Release a handle. Runs the attached finalizer (under the runtime
    /// lock the caller already holds) and bumps the slot generation.
    /// Returns the released address, or `None` for a stale handle.
    pub fn release(&self, h: Handle) -> Option<usize> {
        let shard_id = h.shard();
        let slot_idx = (h.index() >> 4) as usize;
        let (addr, finalizer) = {
            let mut shard = self.shards[shard_id].write().expect("handle shard poisoned");
            let slot = shard.slots.get_mut(slot_idx)?;
            if slot.addr == 0 || slot.generation != h.generation() {
                return None;
            }
            let addr = slot.addr;
            slot.addr = 0;
            slot.generation = slot.generation.wrapping_add(1);
            let finalizer = slot.finalizer.take();
            shard.free.push(slot_idx as u32);
            (addr, finalizer)
        };
        // Finalizer runs outside the shard lock but inside the caller's
        // runtime lock, per the lock ordering rule.
        if let Some(f) = finalizer {
            f(addr);
        }
        Some(addr)
    }

    /// Number of live handles (diagnostics).
    pub fn live_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let s = s.read().expect("handle shard poisoned");
                s.slots.iter().filter(|slot| slot.addr != 0).count()
            })
            .sum()
    }

    /// Release every live handle in reverse registration order, running
    /// finalizers. Shutdown path; runs before the final cycle pass.
    pub fn release_all(&self) -> usize {
        let mut live: Vec<(u64, Handle)> = Vec::new();
        for (shard_id, shard) in self.shards.iter().enumerate() {
            let shard = shard.read().expect("handle shard poisoned");
            for (slot_idx, slot) in shard.slots.iter().enumerate() {
                if slot.addr != 0 {
                    live.push((
                        slot.order,
                        Handle::pack(((slot_idx as u32) << 4) | shard_id as u32, slot.generation),
                    ));
                }
            }
        }
        live.sort_by(|a, b| b.0.cmp(&a.0));
        let count = live.len();
        for (_, h) in live {
            self.release(h);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_register_resolve_release() {
        let reg = HandleRegistry::new();
        let h = reg.register(0x1000);
        assert_eq!(reg.resolve(h), Some(0x1000));
        assert_eq!(reg.release(h), Some(0x1000));
        assert_eq!(reg.resolve(h), None);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let reg = HandleRegistry::new();
        let h1 = reg.register(0x1000);
        reg.release(h1);
        // Force slot reuse by registering enough to cycle every shard.
        let mut reused = None;
        for i in 0..HANDLE_SHARDS {
            let h = reg.register(0x2000 + i);
            if h.index() == h1.index() {
                reused = Some(h);
            }
        }
        let h2 = reused.expect("slot should be reused within one shard round");
        assert_ne!(h1.generation(), h2.generation());
        assert_eq!(reg.resolve(h1), None);
        assert!(reg.resolve(h2).is_some());
    }

    #[test]
    fn test_handles_stripe_shards() {
        let reg = HandleRegistry::new();
        let shards: Vec<usize> = (0..HANDLE_SHARDS)
            .map(|i| reg.register(0x1000 + i).shard())
            .collect();
        let mut unique = shards.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), HANDLE_SHARDS);
    }

    #[test]
    fn test_finalizer_runs_on_release() {
        let reg = HandleRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let h = reg.register_with(
            0x3000,
            Some(Box::new(move |addr| {
                assert_eq!(addr, 0x3000);
                ran2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        reg.release(h);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // A stale release must not run anything again.
        reg.release(h);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_all_reverse_order() {
        let reg = HandleRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3usize {
            let order = Arc::clone(&order);
            reg.register_with(
                0x4000 + i,
                Some(Box::new(move |addr| {
                    order.lock().unwrap().push(addr);
                })),
            );
        }
        assert_eq!(reg.release_all(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0x4002, 0x4001, 0x4000]);
        assert_eq!(reg.live_count(), 0);
    }
}
