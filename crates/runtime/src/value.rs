//! Runtime values
//!
//! A [`Value`] is one NaN-boxed word. Heap payloads live behind the
//! `HeapPtr` tag in a [`HeapObj`]: an [`ObjectHeader`] followed by the
//! payload variant. Values are `Copy`; ownership is explicit reference
//! counting through the heap, never Rust `Drop`.
//!
//! ## Safety
//!
//! Heap addresses are created only by the heap allocator
//! (`Box::into_raw`) and freed only when the reference count reaches
//! zero under the runtime lock, so dereferencing a reachable value's
//! pointer is sound. All payload mutation goes through `RefCell` and is
//! serialized by the runtime lock.

use std::cell::RefCell;
use std::collections::VecDeque;

use molt_core::{ErrorKind, Handle, ObjectHeader, RawValue, SizeClass, TypeTag};
use num_bigint::BigInt;
use num_bigint::Sign;

use crate::errors::{type_error, FrameEntry, RtError};

/// One NaN-boxed value word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value(pub RawValue);

/// A heap object: header plus payload.
#[derive(Debug)]
pub struct HeapObj {
    pub header: ObjectHeader,
    pub payload: Payload,
}

/// Heap payload variants, one per [`TypeTag`].
#[derive(Debug)]
pub enum Payload {
    BigInt(BigInt),
    Str(StrData),
    Bytes(Vec<u8>),
    List(RefCell<Vec<Value>>),
    Tuple(Box<[Value]>),
    Map(RefCell<MapData>),
    Set(RefCell<SetData>),
    Instance(InstanceData),
    Callable(CallableData),
    Error(ErrData),
    Task(u64),
    Channel(u64),
    File(RefCell<Option<std::fs::File>>),
    Iter(RefCell<IterState>),
}

/// Cursor over a container snapshot. Lists are iterated by index; maps
/// and sets iterate their insertion order; strings yield codepoints.
#[derive(Debug)]
pub struct IterState {
    pub source: Value,
    pub pos: usize,
}

impl Payload {
    pub fn tag(&self) -> TypeTag {
        match self {
            Payload::BigInt(_) => TypeTag::BigInt,
            Payload::Str(_) => TypeTag::Str,
            Payload::Bytes(_) => TypeTag::Bytes,
            Payload::List(_) => TypeTag::List,
            Payload::Tuple(_) => TypeTag::Tuple,
            Payload::Map(_) => TypeTag::Map,
            Payload::Set(_) => TypeTag::Set,
            Payload::Instance(_) => TypeTag::Instance,
            Payload::Callable(_) => TypeTag::Callable,
            Payload::Error(_) => TypeTag::Error,
            Payload::Task(_) => TypeTag::Task,
            Payload::Channel(_) => TypeTag::Channel,
            Payload::File(_) => TypeTag::File,
            Payload::Iter(_) => TypeTag::Iter,
        }
    }

    /// Rough payload footprint for allocation accounting and GC triggers.
    pub fn approx_bytes(&self) -> usize {
        let base = std::mem::size_of::<HeapObj>();
        base + match self {
            Payload::BigInt(n) => (n.bits() as usize + 7) / 8,
            Payload::Str(s) => s.text.capacity(),
            Payload::Bytes(b) => b.capacity(),
            Payload::List(l) => l.borrow().capacity() * std::mem::size_of::<Value>(),
            Payload::Tuple(t) => t.len() * std::mem::size_of::<Value>(),
            Payload::Map(m) => m.borrow().approx_bytes(),
            Payload::Set(s) => s.borrow().entries.capacity() * 24,
            Payload::Instance(i) => i.fields.borrow().capacity() * std::mem::size_of::<Value>(),
            Payload::Callable(c) => c.captures.len() * std::mem::size_of::<Value>(),
            Payload::Error(e) => e.message.capacity() + e.frames.len() * 48,
            Payload::Task(_) | Payload::Channel(_) | Payload::File(_) => 0,
            Payload::Iter(_) => std::mem::size_of::<IterState>(),
        }
    }
}

/// String payload with a content flag gating ASCII fast paths.
#[derive(Debug)]
pub struct StrData {
    pub text: String,
    /// True when every byte is ASCII; set at construction.
    pub ascii: bool,
}

impl StrData {
    pub fn new(text: String) -> Self {
        let ascii = text.is_ascii();
        StrData { text, ascii }
    }
}

/// Insertion-ordered mapping with an optional record shape.
///
/// Shaped maps store values in fixed slots (one per shape key, in shape
/// order); dynamic maps keep insertion-ordered `(hash, key, value)`
/// entries. Widening a shaped map past its descriptor dissolves the
/// shape: slots are rematerialized as ordinary entries at the boundary.
#[derive(Debug, Default)]
pub struct MapData {
    pub shape: Option<u32>,
    pub slots: Vec<Value>,
    pub entries: Vec<(u64, Value, Value)>,
}

impl MapData {
    pub fn approx_bytes(&self) -> usize {
        self.slots.capacity() * std::mem::size_of::<Value>() + self.entries.capacity() * 40
    }
}

/// Insertion-ordered hash set.
#[derive(Debug, Default)]
pub struct SetData {
    pub entries: Vec<(u64, Value)>,
}

/// Nominal class instance: class id plus field slots.
#[derive(Debug)]
pub struct InstanceData {
    pub class_id: u32,
    pub fields: RefCell<Vec<Value>>,
}

/// A callable bound to runtime code: entry index into the artifact's
/// function table plus captured environment values.
#[derive(Debug)]
pub struct CallableData {
    pub function_id: u32,
    pub captures: Box<[Value]>,
}

/// Raised-error payload. The cause is a Value (an Error object) so
/// chains are ordinary heap graphs.
#[derive(Debug)]
pub struct ErrData {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Value>,
    pub frames: Vec<FrameEntry>,
}

impl Value {
    // =========================================================================
    // Construction of immediates
    // =========================================================================

    pub fn null() -> Value {
        Value(RawValue::null())
    }

    pub fn bool(b: bool) -> Value {
        Value(RawValue::from_bool(b))
    }

    pub fn float(f: f64) -> Value {
        Value(RawValue::from_float(f))
    }

    /// Small-int immediate; caller must have checked the range (the heap
    /// promotes to BigInt otherwise).
    pub fn small_int(n: i64) -> Value {
        Value(RawValue::from_small_int(n))
    }

    pub fn handle(h: Handle) -> Value {
        Value(RawValue::from_handle(h))
    }

    pub(crate) fn from_heap(obj: *mut HeapObj) -> Value {
        Value(RawValue::from_heap_addr(obj as usize))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn is_heap(self) -> bool {
        self.0.is_heap_ptr()
    }

    /// The heap object behind this value, if it is a heap pointer.
    #[inline]
    pub fn obj(self) -> Option<&'static HeapObj> {
        if self.0.is_heap_ptr() {
            // Sound per the module safety contract: the allocator issued
            // this address and frees it only at RC zero under the lock.
            Some(unsafe { &*(self.0.as_heap_addr() as *const HeapObj) })
        } else {
            None
        }
    }

    pub(crate) fn obj_ptr(self) -> Option<*mut HeapObj> {
        if self.0.is_heap_ptr() {
            Some(self.0.as_heap_addr() as *mut HeapObj)
        } else {
            None
        }
    }

    /// The user-visible type name.
    pub fn type_name(self) -> &'static str {
        if self.0.is_float() {
            "float"
        } else if self.0.is_small_int() {
            "int"
        } else if self.0.is_null() {
            "null"
        } else if self.0.is_bool() {
            "bool"
        } else if self.0.is_handle() {
            "handle"
        } else {
            self.obj().map(|o| o.header.tag().name()).unwrap_or("object")
        }
    }

    /// Truthiness per source-language rules.
    pub fn truthy(self) -> bool {
        if self.0.is_float() {
            return self.0.as_float() != 0.0;
        }
        if self.0.is_small_int() {
            return self.0.as_small_int() != 0;
        }
        if self.0.is_null() {
            return false;
        }
        if self.0.is_bool() {
            return self.0.as_bool();
        }
        if self.0.is_handle() {
            return true;
        }
        match &self.obj().expect("heap value").payload {
            Payload::BigInt(n) => n.sign() != Sign::NoSign,
            Payload::Str(s) => !s.text.is_empty(),
            Payload::Bytes(b) => !b.is_empty(),
            Payload::List(l) => !l.borrow().is_empty(),
            Payload::Tuple(t) => !t.is_empty(),
            Payload::Map(m) => {
                let m = m.borrow();
                if m.shape.is_some() {
                    !m.slots.is_empty()
                } else {
                    !m.entries.is_empty()
                }
            }
            Payload::Set(s) => !s.borrow().entries.is_empty(),
            _ => true,
        }
    }

    /// Integer view covering both the immediate and the promoted form.
    pub fn as_int(self) -> Option<IntRepr<'static>> {
        if self.0.is_small_int() {
            return Some(IntRepr::Small(self.0.as_small_int()));
        }
        if self.0.is_bool() {
            return Some(IntRepr::Small(self.0.as_bool() as i64));
        }
        match self.obj().map(|o| &o.payload) {
            Some(Payload::BigInt(n)) => Some(IntRepr::Big(n)),
            _ => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        if self.0.is_float() {
            return Some(self.0.as_float());
        }
        match self.as_int()? {
            IntRepr::Small(n) => Some(n as f64),
            IntRepr::Big(n) => {
                // Lossy only for magnitudes beyond 2^53, as in the source
                // language's int-to-float coercion.
                let (sign, digits) = n.to_u64_digits();
                let mut f = 0.0f64;
                for d in digits.iter().rev() {
                    f = f * 1.8446744073709552e19 + *d as f64;
                }
                Some(if sign == Sign::Minus { -f } else { f })
            }
        }
    }

    pub fn as_str(self) -> Option<&'static str> {
        match self.obj().map(|o| &o.payload) {
            Some(Payload::Str(s)) => Some(&s.text),
            _ => None,
        }
    }

    pub fn expect_str(self) -> Result<&'static str, RtError> {
        self.as_str()
            .ok_or_else(|| type_error(format!("expected str, got {}", self.type_name())))
    }

    /// Machine-integer view, erroring for non-ints and out-of-range
    /// bigints (indices, counts, channel bounds).
    pub fn expect_i64(self) -> Result<i64, RtError> {
        match self.as_int() {
            Some(IntRepr::Small(n)) => Ok(n),
            Some(IntRepr::Big(n)) => i64::try_from(n.clone())
                .map_err(|_| type_error("integer too large for this operation")),
            None => Err(type_error(format!("expected int, got {}", self.type_name()))),
        }
    }
}

/// Integer representation: immediate or promoted.
#[derive(Debug, Clone, Copy)]
pub enum IntRepr<'a> {
    Small(i64),
    Big(&'a BigInt),
}

impl IntRepr<'_> {
    pub fn to_bigint(self) -> BigInt {
        match self {
            IntRepr::Small(n) => BigInt::from(n),
            IntRepr::Big(n) => n.clone(),
        }
    }
}

/// Enumerate the heap children of an object (the edges the cycle
/// collector and release walk).
pub fn each_child(obj: &HeapObj, mut f: impl FnMut(Value)) {
    match &obj.payload {
        Payload::List(l) => {
            for v in l.borrow().iter() {
                f(*v);
            }
        }
        Payload::Tuple(t) => {
            for v in t.iter() {
                f(*v);
            }
        }
        Payload::Map(m) => {
            let m = m.borrow();
            for v in m.slots.iter() {
                f(*v);
            }
            for (_, k, v) in m.entries.iter() {
                f(*k);
                f(*v);
            }
        }
        Payload::Set(s) => {
            for (_, v) in s.borrow().entries.iter() {
                f(*v);
            }
        }
        Payload::Instance(i) => {
            for v in i.fields.borrow().iter() {
                f(*v);
            }
        }
        Payload::Callable(c) => {
            for v in c.captures.iter() {
                f(*v);
            }
        }
        Payload::Error(e) => {
            if let Some(c) = e.cause {
                f(c);
            }
        }
        Payload::Iter(state) => f(state.borrow().source),
        _ => {}
    }
}

/// Structural equality. Identical words are equal without a deref;
/// numerics compare across representations; containers compare deeply.
pub fn value_eq(a: Value, b: Value) -> bool {
    if a.0.to_bits() == b.0.to_bits() {
        // Same immediate, same singleton, or same object identity.
        // NaN float words are canonical, so NaN == NaN here is fine for
        // container membership (matching the source language's identity
        // shortcut).
        return true;
    }
    // Cross-representation numerics.
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return match (x, y) {
            (IntRepr::Small(m), IntRepr::Small(n)) => m == n,
            _ => x.to_bigint() == y.to_bigint(),
        };
    }
    if a.0.is_float() || b.0.is_float() {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return x == y;
        }
        return false;
    }
    match (a.obj().map(|o| &o.payload), b.obj().map(|o| &o.payload)) {
        (Some(Payload::Str(x)), Some(Payload::Str(y))) => x.text == y.text,
        (Some(Payload::Bytes(x)), Some(Payload::Bytes(y))) => x == y,
        (Some(Payload::List(x)), Some(Payload::List(y))) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| value_eq(*p, *q))
        }
        (Some(Payload::Tuple(x)), Some(Payload::Tuple(y))) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| value_eq(*p, *q))
        }
        _ => false,
    }
}

/// Seeded value hash. Containers other than tuples are unhashable.
pub fn value_hash(seed: u64, v: Value) -> Result<u64, RtError> {
    use molt_core::hash;
    if v.0.is_float() {
        return Ok(hash::hash_float(seed, v.0.as_float()));
    }
    if v.0.is_small_int() {
        return Ok(hash::hash_int(seed, v.0.as_small_int()));
    }
    if v.0.is_null() {
        return Ok(hash::hash_null(seed));
    }
    if v.0.is_bool() {
        // Bools hash as their integer values, matching cross-type equality.
        return Ok(hash::hash_int(seed, v.0.as_bool() as i64));
    }
    if v.0.is_handle() {
        let mut h = hash::SeededHasher::new(seed);
        h.write_tag(hash::HashTag::Handle);
        h.write_u64(v.0.as_handle().to_word());
        return Ok(h.finish());
    }
    match &v.obj().expect("heap value").payload {
        Payload::BigInt(n) => {
            let (sign, bytes) = n.to_bytes_le();
            Ok(hash::hash_big_int(seed, sign == Sign::Minus, &bytes))
        }
        Payload::Str(s) => Ok(hash::hash_str(seed, &s.text)),
        Payload::Bytes(b) => Ok(hash::hash_bytes(seed, b)),
        Payload::Tuple(t) => {
            let mut h = hash::SeededHasher::new(seed);
            h.write_tag(hash::HashTag::Tuple);
            for elem in t.iter() {
                h.write_u64(value_hash(seed, *elem)?);
            }
            Ok(h.finish())
        }
        p => Err(type_error(format!("unhashable type: {}", p.tag().name()))),
    }
}

/// Developer-facing rendering (tracebacks, diagnostics, `print` of
/// non-string values).
pub fn value_repr(v: Value) -> String {
    if v.0.is_float() {
        let f = v.0.as_float();
        if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e16 {
            return format!("{:.1}", f);
        }
        return format!("{}", f);
    }
    if v.0.is_small_int() {
        return v.0.as_small_int().to_string();
    }
    if v.0.is_null() {
        return "null".to_string();
    }
    if v.0.is_bool() {
        return if v.0.as_bool() { "true" } else { "false" }.to_string();
    }
    if v.0.is_handle() {
        return format!("<{}>", v.0.as_handle());
    }
    match &v.obj().expect("heap value").payload {
        Payload::BigInt(n) => n.to_string(),
        Payload::Str(s) => format!("{:?}", s.text),
        Payload::Bytes(b) => format!("b\"{}\"", b.escape_ascii()),
        Payload::List(l) => {
            let items: Vec<String> = l.borrow().iter().map(|v| value_repr(*v)).collect();
            format!("[{}]", items.join(", "))
        }
        Payload::Tuple(t) => {
            let items: Vec<String> = t.iter().map(|v| value_repr(*v)).collect();
            format!("({})", items.join(", "))
        }
        Payload::Map(m) => {
            let m = m.borrow();
            let items: Vec<String> = m
                .entries
                .iter()
                .map(|(_, k, v)| format!("{}: {}", value_repr(*k), value_repr(*v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        Payload::Set(s) => {
            let items: Vec<String> = s
                .borrow()
                .entries
                .iter()
                .map(|(_, v)| value_repr(*v))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        Payload::Instance(i) => format!("<instance class:{}>", i.class_id),
        Payload::Callable(c) => format!("<callable fn:{}>", c.function_id),
        Payload::Error(e) => format!("{}({:?})", e.kind.name(), e.message),
        Payload::Task(id) => format!("<task {}>", id),
        Payload::Channel(id) => format!("<channel {}>", id),
        Payload::File(_) => "<file>".to_string(),
        Payload::Iter(_) => "<iterator>".to_string(),
    }
}

/// Plain-text rendering for `print`: strings print unquoted, everything
/// else falls back to `value_repr`.
pub fn value_display(v: Value) -> String {
    match v.as_str() {
        Some(s) => s.to_string(),
        None => value_repr(v),
    }
}

/// Convenience for allocation sites: size class for a payload.
pub fn size_class_of(payload: &Payload) -> SizeClass {
    SizeClass::for_size(payload.approx_bytes())
}

/// Channel queue used by the scheduler; re-exported here so the payload
/// and its owner stay in one crate.
pub type ValueQueue = VecDeque<Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_truthiness() {
        assert!(!Value::null().truthy());
        assert!(!Value::bool(false).truthy());
        assert!(Value::bool(true).truthy());
        assert!(!Value::small_int(0).truthy());
        assert!(Value::small_int(-3).truthy());
        assert!(!Value::float(0.0).truthy());
        assert!(Value::float(0.5).truthy());
    }

    #[test]
    fn test_cross_type_numeric_eq() {
        assert!(value_eq(Value::small_int(3), Value::float(3.0)));
        assert!(value_eq(Value::bool(true), Value::small_int(1)));
        assert!(!value_eq(Value::small_int(3), Value::float(3.5)));
        assert!(!value_eq(Value::null(), Value::small_int(0)));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::null().type_name(), "null");
        assert_eq!(Value::small_int(1).type_name(), "int");
        assert_eq!(Value::float(1.0).type_name(), "float");
        assert_eq!(Value::bool(true).type_name(), "bool");
    }

    #[test]
    fn test_immediate_hash_matches_core() {
        use molt_core::hash;
        assert_eq!(
            value_hash(0, Value::small_int(5)).unwrap(),
            hash::hash_int(0, 5)
        );
        assert_eq!(
            value_hash(0, Value::float(5.0)).unwrap(),
            hash::hash_int(0, 5)
        );
        assert_eq!(value_hash(0, Value::null()).unwrap(), hash::hash_null(0));
    }
}
