//! The intrinsic table
//!
//! Intrinsics are the closed set of runtime operations that lowered code
//! invokes directly by numeric id — never through dynamic name lookup.
//! Each entry declares its argument kinds, result kind, effect set, and
//! required capabilities. The compiler consults this table to type calls
//! and to reject calls whose capability is absent from the build
//! manifest; the runtime dispatches on the id.
//!
//! Ids are grouped by domain and stable across releases: renumbering an
//! intrinsic is an ABI break for every compiled artifact.

use crate::caps::{Capability, CapabilitySet};

/// Abstract value kinds used in intrinsic signatures. This is the
/// signature-level view; the full inference lattice lives in the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Any,
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Map,
    Set,
    Callable,
    Error,
    Task,
    Channel,
    Iter,
    Handle,
}

/// Effect annotations, a small bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectSet(u8);

impl EffectSet {
    /// No observable effect; freely reorderable and elidable.
    pub const PURE: EffectSet = EffectSet(0);
    /// Reads runtime or host state.
    pub const READS: EffectSet = EffectSet(1 << 0);
    /// Writes runtime or host state.
    pub const WRITES: EffectSet = EffectSet(1 << 1);
    /// May suspend the running task (scheduler-visible).
    pub const SUSPENDS: EffectSet = EffectSet(1 << 2);
    /// May raise.
    pub const RAISES: EffectSet = EffectSet(1 << 3);

    pub const fn or(self, other: EffectSet) -> EffectSet {
        EffectSet(self.0 | other.0)
    }

    pub const fn reads(self) -> bool {
        self.0 & Self::READS.0 != 0
    }

    pub const fn writes(self) -> bool {
        self.0 & Self::WRITES.0 != 0
    }

    pub const fn suspends(self) -> bool {
        self.0 & Self::SUSPENDS.0 != 0
    }

    pub const fn raises(self) -> bool {
        self.0 & Self::RAISES.0 != 0
    }

    /// Pure enough to elide when the result is unused.
    pub const fn is_pure(self) -> bool {
        self.0 == 0
    }
}

/// One row of the intrinsic table.
#[derive(Debug, Clone, Copy)]
pub struct IntrinsicDef {
    pub id: Intrinsic,
    pub name: &'static str,
    pub params: &'static [ValueKind],
    pub result: ValueKind,
    pub effects: EffectSet,
    pub caps: CapabilitySet,
}

macro_rules! intrinsic_table {
    ($(
        $id:literal $variant:ident $name:literal
            ($($p:ident),*) -> $ret:ident, $fx:expr, $caps:expr;
    )*) => {
        /// Intrinsic identifiers. Discriminants are the wire ids.
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Intrinsic {
            $($variant = $id,)*
        }

        impl Intrinsic {
            /// Decode a wire id.
            pub fn from_u16(id: u16) -> Option<Intrinsic> {
                match id {
                    $($id => Some(Intrinsic::$variant),)*
                    _ => None,
                }
            }
        }

        /// The full table, in id order.
        pub static INTRINSIC_TABLE: &[IntrinsicDef] = &[
            $(IntrinsicDef {
                id: Intrinsic::$variant,
                name: $name,
                params: &[$(ValueKind::$p),*],
                result: ValueKind::$ret,
                effects: $fx,
                caps: $caps,
            },)*
        ];
    };
}

const NONE: CapabilitySet = CapabilitySet::empty();
const P: EffectSet = EffectSet::PURE;
const R: EffectSet = EffectSet::READS;
const W: EffectSet = EffectSet::WRITES;
const S: EffectSet = EffectSet::SUSPENDS;
const E: EffectSet = EffectSet::RAISES;

intrinsic_table! {
    // --- integer arithmetic (overflow promotes, so pure ops never raise)
    0x000 IntAdd "int_add" (Int, Int) -> Int, P, NONE;
    0x001 IntSub "int_sub" (Int, Int) -> Int, P, NONE;
    0x002 IntMul "int_mul" (Int, Int) -> Int, P, NONE;
    0x003 IntDiv "int_div" (Int, Int) -> Int, E, NONE;
    0x004 IntMod "int_mod" (Int, Int) -> Int, E, NONE;
    0x005 IntNeg "int_neg" (Int) -> Int, P, NONE;
    0x006 IntAnd "int_and" (Int, Int) -> Int, P, NONE;
    0x007 IntOr "int_or" (Int, Int) -> Int, P, NONE;
    0x008 IntXor "int_xor" (Int, Int) -> Int, P, NONE;
    0x009 IntShl "int_shl" (Int, Int) -> Int, E, NONE;
    0x00A IntShr "int_shr" (Int, Int) -> Int, E, NONE;
    0x00B IntInvert "int_invert" (Int) -> Int, P, NONE;

    // --- float arithmetic
    0x010 FloatAdd "float_add" (Float, Float) -> Float, P, NONE;
    0x011 FloatSub "float_sub" (Float, Float) -> Float, P, NONE;
    0x012 FloatMul "float_mul" (Float, Float) -> Float, P, NONE;
    0x013 FloatDiv "float_div" (Float, Float) -> Float, E, NONE;
    0x014 FloatNeg "float_neg" (Float) -> Float, P, NONE;

    // --- boolean / comparison / hashing
    0x018 BoolNot "bool_not" (Bool) -> Bool, P, NONE;
    0x01A CmpEq "cmp_eq" (Any, Any) -> Bool, P, NONE;
    0x01B CmpLt "cmp_lt" (Any, Any) -> Bool, E, NONE;
    0x01C CmpLe "cmp_le" (Any, Any) -> Bool, E, NONE;
    0x01E ValueHash "value_hash" (Any) -> Int, E, NONE;

    // --- dynamic-path operators (general variants, deopt targets)
    0x020 AnyAdd "any_add" (Any, Any) -> Any, E, NONE;
    0x021 AnySub "any_sub" (Any, Any) -> Any, E, NONE;
    0x022 AnyMul "any_mul" (Any, Any) -> Any, E, NONE;
    0x023 AnyDiv "any_div" (Any, Any) -> Any, E, NONE;
    0x024 AnyFloorDiv "any_floordiv" (Any, Any) -> Any, E, NONE;
    0x025 AnyMod "any_mod" (Any, Any) -> Any, E, NONE;
    0x026 AnyNeg "any_neg" (Any) -> Any, E, NONE;
    0x027 AnyNot "any_not" (Any) -> Bool, P, NONE;
    0x028 AnyContains "any_contains" (Any, Any) -> Bool, E, NONE;
    0x029 AnyLen "any_len" (Any) -> Int, E, NONE;
    0x02A AnyGetItem "any_get_item" (Any, Any) -> Any, R.or(E), NONE;
    0x02B AnySetItem "any_set_item" (Any, Any, Any) -> Null, W.or(E), NONE;
    0x02C AnyGetAttr "any_get_attr" (Any, Str) -> Any, R.or(E), NONE;
    0x02D AnySetAttr "any_set_attr" (Any, Str, Any) -> Null, W.or(E), NONE;

    // --- containers
    0x100 ListNew "list_new" () -> List, W, NONE;
    0x101 ListPush "list_push" (List, Any) -> Null, W, NONE;
    0x102 ListPop "list_pop" (List) -> Any, W.or(E), NONE;
    0x103 ListGet "list_get" (List, Int) -> Any, R.or(E), NONE;
    0x104 ListSet "list_set" (List, Int, Any) -> Null, W.or(E), NONE;
    0x105 ListLen "list_len" (List) -> Int, R, NONE;
    0x108 TupleNew "tuple_new" (List) -> Tuple, W, NONE;
    0x109 TupleGet "tuple_get" (Tuple, Int) -> Any, R.or(E), NONE;
    0x10A TupleLen "tuple_len" (Tuple) -> Int, R, NONE;
    0x110 MapNew "map_new" () -> Map, W, NONE;
    0x111 MapGet "map_get" (Map, Any) -> Any, R.or(E), NONE;
    0x112 MapSet "map_set" (Map, Any, Any) -> Null, W.or(E), NONE;
    0x113 MapDel "map_del" (Map, Any) -> Null, W.or(E), NONE;
    0x114 MapHas "map_has" (Map, Any) -> Bool, R.or(E), NONE;
    0x115 MapLen "map_len" (Map) -> Int, R, NONE;
    0x116 MapKeys "map_keys" (Map) -> List, R, NONE;
    0x118 SetNew "set_new" () -> Set, W, NONE;
    0x119 SetAdd "set_add" (Set, Any) -> Null, W.or(E), NONE;
    0x11A SetHas "set_has" (Set, Any) -> Bool, R.or(E), NONE;
    0x11B SetLen "set_len" (Set) -> Int, R, NONE;
    0x120 IterNew "iter_new" (Any) -> Iter, W.or(E), NONE;
    0x121 IterNext "iter_next" (Iter) -> Tuple, W, NONE;

    // --- strings and bytes (indices are codepoint indices)
    0x200 StrLen "str_len" (Str) -> Int, P, NONE;
    0x201 StrConcat "str_concat" (Str, Str) -> Str, P, NONE;
    0x202 StrFind "str_find" (Str, Str) -> Int, P, NONE;
    0x203 StrSplit "str_split" (Str, Str) -> List, W.or(E), NONE;
    0x204 StrReplace "str_replace" (Str, Str, Str) -> Str, P, NONE;
    0x205 StrCasefold "str_casefold" (Str) -> Str, P, NONE;
    0x206 StrEncode "str_encode" (Str) -> Bytes, W, NONE;
    0x207 BytesDecode "bytes_decode" (Bytes) -> Str, W.or(E), NONE;
    0x208 StrIndex "str_index" (Str, Int) -> Str, E, NONE;
    0x209 StrFormat "str_format" (Str, List) -> Str, E, NONE;
    0x20A NumFormat "num_format" (Any, Str) -> Str, E, NONE;

    // --- I/O (print goes to the standard streams, no capability)
    0x300 Print "print" (Any) -> Null, W, NONE;
    0x301 IoOpen "io_open" (Str, Str) -> Handle, W.or(E),
        CapabilitySet::empty().with(Capability::FsRead);
    0x302 IoRead "io_read" (Handle, Int) -> Bytes, W.or(E),
        CapabilitySet::empty().with(Capability::FsRead);
    0x303 IoWrite "io_write" (Handle, Bytes) -> Int, W.or(E),
        CapabilitySet::empty().with(Capability::FsWrite);
    0x304 IoClose "io_close" (Handle) -> Null, W.or(E), NONE;
    0x310 EnvGet "env_get" (Str) -> Any, R.or(E),
        CapabilitySet::empty().with(Capability::EnvRead);
    0x311 EnvSet "env_set" (Str, Str) -> Null, W.or(E),
        CapabilitySet::empty().with(Capability::EnvWrite);

    // --- scheduler and channels
    0x400 TaskSpawn "task_spawn" (Callable) -> Task, W, NONE;
    0x401 TaskSleep "task_sleep" (Float) -> Null, S.or(E), NONE;
    0x402 TaskCurrent "task_current" () -> Task, R, NONE;
    0x403 TaskCancel "task_cancel" (Task) -> Null, W, NONE;
    0x404 TaskJoin "task_join" (Task) -> Any, S.or(E), NONE;
    0x405 TaskYield "task_yield" () -> Null, S.or(E), NONE;
    0x410 ChanNew "chan_new" (Int) -> Channel, W.or(E), NONE;
    0x411 ChanSend "chan_send" (Channel, Any) -> Null, S.or(E), NONE;
    0x412 ChanRecv "chan_recv" (Channel) -> Any, S.or(E), NONE;
    0x413 ChanTrySend "chan_try_send" (Channel, Any) -> Bool, W.or(E), NONE;
    0x414 ChanTryRecv "chan_try_recv" (Channel) -> Tuple, W.or(E), NONE;
    0x415 ChanClose "chan_close" (Channel) -> Null, W, NONE;

    // --- time and randomness
    0x500 TimeMonotonic "time_monotonic" () -> Float, R, NONE;
    0x501 TimePerf "time_perf" () -> Float, R, NONE;
    0x502 TimeWall "time_wall" () -> Float, R.or(E),
        CapabilitySet::empty().with(Capability::TimeWall);
    0x510 RandomSecure "random_secure" (Int) -> Bytes, R.or(E),
        CapabilitySet::empty().with(Capability::RandomSecure);

    // --- error construction
    0x600 ErrNew "err_new" (Str, Str) -> Error, W.or(E), NONE;

    // --- parallel kernels
    0x700 ParallelFor "parallel_for" (Int, Int, Callable) -> Null, W.or(E), NONE;
    0x701 ParallelReduce "parallel_reduce" (Int, Int, Callable, Any, Callable) -> Any,
        W.or(E), NONE;
}

impl Intrinsic {
    /// The table row for this intrinsic.
    pub fn def(self) -> &'static IntrinsicDef {
        // Table is small and in id order; linear scan is fine off the
        // hot path (runtime dispatch goes through a match, not this).
        INTRINSIC_TABLE
            .iter()
            .find(|d| d.id == self)
            .expect("intrinsic missing from table")
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }
}

/// Look up an intrinsic by name (used by the frontend when lowering
/// builtin calls; lowered code itself uses ids).
pub fn by_name(name: &str) -> Option<&'static IntrinsicDef> {
    INTRINSIC_TABLE.iter().find(|d| d.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique_and_ordered() {
        let mut prev: Option<u16> = None;
        for def in INTRINSIC_TABLE {
            let id = def.id as u16;
            if let Some(p) = prev {
                assert!(id > p, "table out of id order at {}", def.name);
            }
            prev = Some(id);
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        for def in INTRINSIC_TABLE {
            assert_eq!(Intrinsic::from_u16(def.id as u16), Some(def.id));
        }
        assert_eq!(Intrinsic::from_u16(0xFFFF), None);
    }

    #[test]
    fn test_by_name() {
        let def = by_name("chan_send").unwrap();
        assert_eq!(def.id, Intrinsic::ChanSend);
        assert!(def.effects.suspends());
        assert!(by_name("no_such_intrinsic").is_none());
    }

    #[test]
    fn test_capability_requirements() {
        assert!(Intrinsic::TimeWall
            .def()
            .caps
            .contains(Capability::TimeWall));
        assert!(Intrinsic::IntAdd.def().caps == CapabilitySet::empty());
        assert!(Intrinsic::IoWrite.def().caps.contains(Capability::FsWrite));
    }

    #[test]
    fn test_suspension_points_marked() {
        // Exactly the operations the scheduler treats as suspension
        // points carry SUSPENDS.
        for i in [
            Intrinsic::TaskSleep,
            Intrinsic::TaskJoin,
            Intrinsic::TaskYield,
            Intrinsic::ChanSend,
            Intrinsic::ChanRecv,
        ] {
            assert!(i.def().effects.suspends(), "{} must suspend", i.name());
        }
        for i in [Intrinsic::IntAdd, Intrinsic::MapGet, Intrinsic::ChanTrySend] {
            assert!(!i.def().effects.suspends(), "{} must not suspend", i.name());
        }
    }
}
