//! The reference-counted heap
//!
//! Deterministic, prompt reclamation through explicit reference counts;
//! cyclic garbage is resolved by the deferred trial-deletion collector in
//! [`crate::cycle`].
//!
//! ## Triggers
//!
//! Collection triggers are pure functions of two counters:
//! `allocated_since_gc` and `candidate_bytes`. No wall-clock or other
//! nondeterministic input ever influences reclamation.
//!
//! ## Candidate discipline
//!
//! A release that leaves a positive count on an object whose type may
//! contain cycles queues the object as a cycle candidate (colored purple,
//! BUFFERED set). The collector later trial-deletes from the candidate
//! list. Freeing an object removes it from the list eagerly so the
//! collector never sees a dangling address.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use molt_core::{GcColor, ObjectHeader};
use num_bigint::BigInt;

use crate::errors::FrameEntry;
use crate::value::{
    each_child, size_class_of, CallableData, ErrData, HeapObj, InstanceData, MapData, Payload,
    SetData, StrData, Value,
};

/// Default collection trigger: bytes allocated since the last pass.
pub const DEFAULT_GC_THRESHOLD: usize = 1 << 20;

/// Default collection trigger: bytes sitting on the candidate list.
pub const DEFAULT_CANDIDATE_THRESHOLD: usize = 256 << 10;

/// Heap statistics snapshot (for diagnostics and tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub live_bytes: usize,
    pub live_objects: usize,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub cycle_passes: u64,
}

pub struct Heap {
    live_bytes: AtomicUsize,
    live_objects: AtomicUsize,
    allocated_since_gc: AtomicUsize,
    candidate_bytes: AtomicUsize,
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    pub(crate) cycle_passes: AtomicU64,
    /// Purple candidate addresses. Mutated under the runtime lock.
    pub(crate) candidates: Mutex<Vec<usize>>,
    gc_threshold: usize,
    candidate_threshold: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_thresholds(DEFAULT_GC_THRESHOLD, DEFAULT_CANDIDATE_THRESHOLD)
    }

    pub fn with_thresholds(gc_threshold: usize, candidate_threshold: usize) -> Self {
        Heap {
            live_bytes: AtomicUsize::new(0),
            live_objects: AtomicUsize::new(0),
            allocated_since_gc: AtomicUsize::new(0),
            candidate_bytes: AtomicUsize::new(0),
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            cycle_passes: AtomicU64::new(0),
            candidates: Mutex::new(Vec::new()),
            gc_threshold,
            candidate_threshold,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a heap object. The returned value owns one reference.
    pub fn alloc(&self, payload: Payload) -> Value {
        let tag = payload.tag();
        let size_class = size_class_of(&payload);
        let bytes = payload.approx_bytes();
        let obj = Box::new(HeapObj {
            header: ObjectHeader::new(tag, size_class),
            payload,
        });
        let ptr = Box::into_raw(obj);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.allocated_since_gc.fetch_add(bytes, Ordering::Relaxed);
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        Value::from_heap(ptr)
    }

    /// Integer constructor: immediate when small, BigInt otherwise.
    /// Promotion never changes the observable value.
    pub fn int(&self, n: i64) -> Value {
        match molt_core::RawValue::try_from_small_int(n) {
            Some(raw) => Value(raw),
            None => self.alloc(Payload::BigInt(BigInt::from(n))),
        }
    }

    /// BigInt constructor that demotes back to the immediate form when
    /// the value fits, so equal values share one representation.
    pub fn big_int(&self, n: BigInt) -> Value {
        if let Ok(small) = i64::try_from(&n) {
            if let Some(raw) = molt_core::RawValue::try_from_small_int(small) {
                return Value(raw);
            }
        }
        self.alloc(Payload::BigInt(n))
    }

    pub fn str(&self, s: impl Into<String>) -> Value {
        self.alloc(Payload::Str(StrData::new(s.into())))
    }

    pub fn bytes(&self, b: Vec<u8>) -> Value {
        self.alloc(Payload::Bytes(b))
    }

    pub fn list(&self, items: Vec<Value>) -> Value {
        self.alloc(Payload::List(std::cell::RefCell::new(items)))
    }

    pub fn tuple(&self, items: Vec<Value>) -> Value {
        self.alloc(Payload::Tuple(items.into_boxed_slice()))
    }

    pub fn map(&self) -> Value {
        self.alloc(Payload::Map(std::cell::RefCell::new(MapData::default())))
    }

    /// Shaped map with one slot per shape key, in shape order.
    pub fn shaped_map(&self, shape: u32, slots: Vec<Value>) -> Value {
        let v = self.alloc(Payload::Map(std::cell::RefCell::new(MapData {
            shape: Some(shape),
            slots,
            entries: Vec::new(),
        })));
        v.obj().expect("fresh map").header.set_shape(Some(shape));
        v
    }

    pub fn set(&self) -> Value {
        self.alloc(Payload::Set(std::cell::RefCell::new(SetData::default())))
    }

    pub fn instance(&self, class_id: u32, fields: Vec<Value>) -> Value {
        self.alloc(Payload::Instance(InstanceData {
            class_id,
            fields: std::cell::RefCell::new(fields),
        }))
    }

    pub fn callable(&self, function_id: u32, captures: Vec<Value>) -> Value {
        self.alloc(Payload::Callable(CallableData {
            function_id,
            captures: captures.into_boxed_slice(),
        }))
    }

    pub fn error(
        &self,
        kind: molt_core::ErrorKind,
        message: impl Into<String>,
        cause: Option<Value>,
        frames: Vec<FrameEntry>,
    ) -> Value {
        self.alloc(Payload::Error(ErrData {
            kind,
            message: message.into(),
            cause,
            frames,
        }))
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Take one reference. No-op for immediates.
    pub fn retain(&self, v: Value) {
        if let Some(obj) = v.obj() {
            obj.header.retain();
            // A retained object is live again; drop any purple marking
            // so the collector does not trial-delete it needlessly.
            if obj.header.color() == GcColor::Purple {
                obj.header.set_color(GcColor::Black);
            }
        }
    }

    /// Drop one reference. Frees at zero; queues a cycle candidate when
    /// a positive count remains on a cyclic type.
    pub fn release(&self, v: Value) {
        let Some(ptr) = v.obj_ptr() else { return };
        let header = &unsafe { &*ptr }.header;
        let remaining = header.release();
        if remaining == 0 {
            self.free(ptr);
        } else if header.tag().may_contain_cycles() {
            self.add_candidate(ptr);
        }
    }

    fn add_candidate(&self, ptr: *mut HeapObj) {
        let obj = unsafe { &*ptr };
        if obj.header.is_buffered() {
            return;
        }
        obj.header.set_buffered(true);
        obj.header.set_color(GcColor::Purple);
        self.candidate_bytes
            .fetch_add(obj.payload.approx_bytes(), Ordering::Relaxed);
        self.candidates
            .lock()
            .expect("candidate list poisoned")
            .push(ptr as usize);
    }

    /// Free an object whose count reached zero, releasing its children.
    /// Iterative so deep ownership chains cannot overflow the stack.
    fn free(&self, ptr: *mut HeapObj) {
        let mut worklist = vec![ptr];
        while let Some(p) = worklist.pop() {
            let obj = unsafe { Box::from_raw(p) };
            self.unbuffer(p, &obj);
            self.live_bytes
                .fetch_sub(obj.payload.approx_bytes(), Ordering::Relaxed);
            self.live_objects.fetch_sub(1, Ordering::Relaxed);
            self.total_freed.fetch_add(1, Ordering::Relaxed);
            each_child(&obj, |child| {
                if let Some(cp) = child.obj_ptr() {
                    let ch = &unsafe { &*cp }.header;
                    if ch.release() == 0 {
                        worklist.push(cp);
                    } else if ch.tag().may_contain_cycles() {
                        self.add_candidate(cp);
                    }
                }
            });
            drop(obj);
        }
    }

    /// Remove a dying object from the candidate list, eagerly.
    fn unbuffer(&self, ptr: *mut HeapObj, obj: &HeapObj) {
        if obj.header.is_buffered() {
            obj.header.set_buffered(false);
            self.candidate_bytes
                .fetch_sub(obj.payload.approx_bytes().min(
                    self.candidate_bytes.load(Ordering::Relaxed),
                ), Ordering::Relaxed);
            self.candidates
                .lock()
                .expect("candidate list poisoned")
                .retain(|&a| a != ptr as usize);
        }
    }

    /// Free without touching children. Used by the cycle collector,
    /// which accounts for edges itself.
    pub(crate) fn free_raw(&self, ptr: *mut HeapObj) {
        let obj = unsafe { Box::from_raw(ptr) };
        self.live_bytes
            .fetch_sub(obj.payload.approx_bytes(), Ordering::Relaxed);
        self.live_objects.fetch_sub(1, Ordering::Relaxed);
        self.total_freed.fetch_add(1, Ordering::Relaxed);
        drop(obj);
    }

    /// Publication barrier: marks the object (and transitively its
    /// children) shared, upgrading RC traffic to atomic RMW.
    pub fn publish(&self, v: Value) {
        let Some(obj) = v.obj() else { return };
        if obj.header.is_shared() {
            return;
        }
        obj.header.mark_shared();
        each_child(obj, |child| self.publish(child));
    }

    // =========================================================================
    // Triggers and stats
    // =========================================================================

    /// Deterministic trigger check: a function of the byte counters only.
    pub fn should_collect(&self) -> bool {
        self.allocated_since_gc.load(Ordering::Relaxed) >= self.gc_threshold
            || self.candidate_bytes.load(Ordering::Relaxed) >= self.candidate_threshold
    }

    pub(crate) fn reset_gc_window(&self) {
        self.allocated_since_gc.store(0, Ordering::Relaxed);
        self.candidate_bytes.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            live_objects: self.live_objects.load(Ordering::Relaxed),
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            cycle_passes: self.cycle_passes.load(Ordering::Relaxed),
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

/// Shape descriptors for record-like mappings. Interned per runtime;
/// the index is what object headers and LIR carry.
#[derive(Debug, Default)]
pub struct ShapeTable {
    descs: Mutex<Vec<Vec<String>>>,
}

impl ShapeTable {
    pub fn new() -> Self {
        ShapeTable::default()
    }

    /// Intern a key set (in slot order). Re-interning the same keys
    /// returns the same index.
    pub fn intern(&self, keys: Vec<String>) -> u32 {
        let mut descs = self.descs.lock().expect("shape table poisoned");
        if let Some(idx) = descs.iter().position(|d| *d == keys) {
            return idx as u32;
        }
        descs.push(keys);
        (descs.len() - 1) as u32
    }

    /// Slot offset of `key` within shape `idx`.
    pub fn offset(&self, idx: u32, key: &str) -> Option<usize> {
        let descs = self.descs.lock().expect("shape table poisoned");
        descs
            .get(idx as usize)
            .and_then(|keys| keys.iter().position(|k| k == key))
    }

    pub fn keys(&self, idx: u32) -> Vec<String> {
        let descs = self.descs.lock().expect("shape table poisoned");
        descs.get(idx as usize).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let heap = Heap::new();
        let base = heap.live_bytes();
        let v = heap.str("hello world");
        assert!(heap.live_bytes() > base);
        assert_eq!(heap.stats().live_objects, 1);
        heap.release(v);
        assert_eq!(heap.live_bytes(), base);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn test_int_promotion_boundary() {
        let heap = Heap::new();
        let small = heap.int(molt_core::MAX_SMALL_INT);
        assert!(!small.is_heap());
        let big = heap.int(molt_core::MAX_SMALL_INT + 1);
        assert!(big.is_heap());
        // Same numeric value either way.
        assert_eq!(big.expect_i64().unwrap(), molt_core::MAX_SMALL_INT + 1);
        heap.release(big);
    }

    #[test]
    fn test_big_int_demotes_when_small() {
        let heap = Heap::new();
        let v = heap.big_int(BigInt::from(7));
        assert!(!v.is_heap());
        assert_eq!(v.expect_i64().unwrap(), 7);
    }

    #[test]
    fn test_release_frees_children() {
        let heap = Heap::new();
        let base = heap.live_bytes();
        let s = heap.str("element");
        let l = heap.list(vec![s]);
        // The list owns the string's only reference now.
        heap.release(l);
        assert_eq!(heap.live_bytes(), base);
    }

    #[test]
    fn test_candidate_queued_on_partial_release() {
        let heap = Heap::new();
        let l = heap.list(vec![]);
        heap.retain(l);
        heap.release(l);
        // rc 1 remains on a cyclic type: queued as candidate.
        assert_eq!(heap.candidates.lock().unwrap().len(), 1);
        assert!(l.obj().unwrap().header.is_buffered());
        heap.release(l);
        // Freeing removed it from the list.
        assert!(heap.candidates.lock().unwrap().is_empty());
    }

    #[test]
    fn test_trigger_is_byte_driven() {
        let heap = Heap::with_thresholds(64, 1 << 30);
        assert!(!heap.should_collect());
        let v = heap.str("a string comfortably past the threshold of 64 bytes in total");
        assert!(heap.should_collect());
        heap.release(v);
    }

    #[test]
    fn test_shape_interning() {
        let shapes = ShapeTable::new();
        let a = shapes.intern(vec!["x".into(), "y".into()]);
        let b = shapes.intern(vec!["x".into(), "y".into()]);
        let c = shapes.intern(vec!["y".into(), "x".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(shapes.offset(a, "y"), Some(1));
        assert_eq!(shapes.offset(a, "z"), None);
    }

    #[test]
    fn test_publish_marks_shared_transitively() {
        let heap = Heap::new();
        let s = heap.str("inner");
        let l = heap.list(vec![s]);
        heap.publish(l);
        assert!(l.obj().unwrap().header.is_shared());
        assert!(s.obj().unwrap().header.is_shared());
        heap.release(l);
    }
}
