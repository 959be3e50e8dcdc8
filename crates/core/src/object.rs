//! Heap object headers
//!
//! Every heap object starts with an [`ObjectHeader`]: type tag, reference
//! count, GC color, size class, and an optional shape-descriptor index for
//! record-shaped mappings.
//!
//! ## Reference counting discipline
//!
//! The count starts biased to the allocating thread: while only the owner
//! thread touches the object, increments and decrements use plain
//! load/store (no RMW). Publishing the object to a shared location sets
//! the SHARED flag, after which all RC traffic uses atomic RMW ops.
//!
//! Headers are mutated only while the runtime serialization lock is held;
//! the atomics here exist so the cycle collector and diagnostics can read
//! headers without data races, not to support lock-free mutation.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Heap object type tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// Arbitrary-precision integer (overflow form of small ints)
    BigInt = 0,
    /// UTF-8 string (validity is a construction invariant)
    Str = 1,
    /// Raw byte string
    Bytes = 2,
    /// Growable array
    List = 3,
    /// Immutable fixed-length array
    Tuple = 4,
    /// Mapping; may carry a shape descriptor for record-like use
    Map = 5,
    /// Hash set
    Set = 6,
    /// Class instance (nominal)
    Instance = 7,
    /// Callable with captured environment
    Callable = 8,
    /// Raised error object (kind, message, cause chain, traceback)
    Error = 9,
    /// Scheduled task (scheduler-registry id)
    Task = 10,
    /// Bounded channel endpoint (channel-registry id)
    Channel = 11,
    /// Open file (handle-attached resource)
    File = 12,
    /// Container iterator (source + cursor)
    Iter = 13,
}

impl TypeTag {
    /// Whether values of this type can participate in reference cycles.
    /// Only these are ever queued as cycle-collection candidates.
    #[inline]
    pub fn may_contain_cycles(self) -> bool {
        matches!(
            self,
            TypeTag::List
                | TypeTag::Tuple
                | TypeTag::Map
                | TypeTag::Set
                | TypeTag::Instance
                | TypeTag::Callable
                | TypeTag::Error
                | TypeTag::Iter
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::BigInt => "int",
            TypeTag::Str => "str",
            TypeTag::Bytes => "bytes",
            TypeTag::List => "list",
            TypeTag::Tuple => "tuple",
            TypeTag::Map => "map",
            TypeTag::Set => "set",
            TypeTag::Instance => "instance",
            TypeTag::Callable => "callable",
            TypeTag::Error => "error",
            TypeTag::Task => "task",
            TypeTag::Channel => "channel",
            TypeTag::File => "file",
            TypeTag::Iter => "iterator",
        }
    }
}

/// Tri-color marking state for the trial-deletion cycle collector,
/// plus purple for "possible cycle root" candidates.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcColor {
    /// In use, or proven reachable
    Black = 0,
    /// Possible cycle root (queued as candidate)
    Purple = 1,
    /// Being visited by trial deletion
    Gray = 2,
    /// Provisionally garbage
    White = 3,
}

impl GcColor {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GcColor::Black,
            1 => GcColor::Purple,
            2 => GcColor::Gray,
            _ => GcColor::White,
        }
    }
}

/// Allocation size classes. Coarse; the allocator only uses these to
/// bucket free lists and accounting.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// <= 64 payload bytes
    Small = 0,
    /// <= 512 payload bytes
    Medium = 1,
    /// everything larger
    Large = 2,
}

impl SizeClass {
    pub fn for_size(bytes: usize) -> Self {
        if bytes <= 64 {
            SizeClass::Small
        } else if bytes <= 512 {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

/// Header flag: RC upgraded to shared (atomic RMW) mode.
pub const FLAG_SHARED: u8 = 1 << 0;
/// Header flag: object is on the cycle-candidate list.
pub const FLAG_BUFFERED: u8 = 1 << 1;
/// Header flag: young generation (nursery accounting).
pub const FLAG_YOUNG: u8 = 1 << 2;

/// Shape index meaning "no shape descriptor".
pub const NO_SHAPE: u32 = u32::MAX;

/// The header at the front of every heap object.
#[derive(Debug)]
pub struct ObjectHeader {
    tag: TypeTag,
    size_class: SizeClass,
    flags: AtomicU8,
    color: AtomicU8,
    rc: AtomicU32,
    shape: AtomicU32,
}

impl ObjectHeader {
    /// New header with RC biased to the allocating thread (count 1,
    /// young, not shared).
    pub fn new(tag: TypeTag, size_class: SizeClass) -> Self {
        ObjectHeader {
            tag,
            size_class,
            flags: AtomicU8::new(FLAG_YOUNG),
            color: AtomicU8::new(GcColor::Black as u8),
            rc: AtomicU32::new(1),
            shape: AtomicU32::new(NO_SHAPE),
        }
    }

    #[inline(always)]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    #[inline(always)]
    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    #[inline(always)]
    pub fn rc(&self) -> u32 {
        self.rc.load(Ordering::Acquire)
    }

    /// Biased increment: plain load/store while the object is unshared.
    /// Caller holds the runtime lock.
    #[inline(always)]
    pub fn retain(&self) {
        if self.is_shared() {
            self.rc.fetch_add(1, Ordering::AcqRel);
        } else {
            let n = self.rc.load(Ordering::Relaxed);
            self.rc.store(n + 1, Ordering::Relaxed);
        }
    }

    /// Biased decrement; returns the new count. Caller holds the runtime
    /// lock and must free the object when this returns 0.
    #[inline(always)]
    pub fn release(&self) -> u32 {
        if self.is_shared() {
            self.rc.fetch_sub(1, Ordering::AcqRel) - 1
        } else {
            let n = self.rc.load(Ordering::Relaxed);
            debug_assert!(n > 0, "release on dead object");
            self.rc.store(n - 1, Ordering::Relaxed);
            n - 1
        }
    }

    /// Internal RC adjustment used by trial deletion.
    #[inline(always)]
    pub fn set_rc(&self, n: u32) {
        self.rc.store(n, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_shared(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_SHARED != 0
    }

    /// Upgrade to shared (atomic) RC on publication to a shared location.
    #[inline(always)]
    pub fn mark_shared(&self) {
        self.flags.fetch_or(FLAG_SHARED, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_young(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_YOUNG != 0
    }

    /// Promote out of the nursery generation.
    #[inline(always)]
    pub fn promote(&self) {
        self.flags.fetch_and(!FLAG_YOUNG, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_buffered(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_BUFFERED != 0
    }

    #[inline(always)]
    pub fn set_buffered(&self, on: bool) {
        if on {
            self.flags.fetch_or(FLAG_BUFFERED, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_BUFFERED, Ordering::AcqRel);
        }
    }

    #[inline(always)]
    pub fn color(&self) -> GcColor {
        GcColor::from_u8(self.color.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_color(&self, c: GcColor) {
        self.color.store(c as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn shape(&self) -> Option<u32> {
        match self.shape.load(Ordering::Acquire) {
            NO_SHAPE => None,
            s => Some(s),
        }
    }

    #[inline(always)]
    pub fn set_shape(&self, idx: Option<u32>) {
        self.shape.store(idx.unwrap_or(NO_SHAPE), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fresh_state() {
        let h = ObjectHeader::new(TypeTag::List, SizeClass::Small);
        assert_eq!(h.rc(), 1);
        assert!(h.is_young());
        assert!(!h.is_shared());
        assert_eq!(h.color(), GcColor::Black);
        assert_eq!(h.shape(), None);
    }

    #[test]
    fn test_retain_release() {
        let h = ObjectHeader::new(TypeTag::Str, SizeClass::Small);
        h.retain();
        h.retain();
        assert_eq!(h.rc(), 3);
        assert_eq!(h.release(), 2);
        assert_eq!(h.release(), 1);
        assert_eq!(h.release(), 0);
    }

    #[test]
    fn test_shared_upgrade() {
        let h = ObjectHeader::new(TypeTag::Map, SizeClass::Medium);
        assert!(!h.is_shared());
        h.mark_shared();
        assert!(h.is_shared());
        h.retain();
        assert_eq!(h.rc(), 2);
    }

    #[test]
    fn test_cycle_eligibility() {
        assert!(TypeTag::List.may_contain_cycles());
        assert!(TypeTag::Instance.may_contain_cycles());
        assert!(!TypeTag::Str.may_contain_cycles());
        assert!(!TypeTag::BigInt.may_contain_cycles());
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(SizeClass::for_size(8), SizeClass::Small);
        assert_eq!(SizeClass::for_size(64), SizeClass::Small);
        assert_eq!(SizeClass::for_size(65), SizeClass::Medium);
        assert_eq!(SizeClass::for_size(4096), SizeClass::Large);
    }
}
