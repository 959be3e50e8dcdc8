//! The default structured codec
//!
//! Serializable representation of runtime values for the sandbox
//! boundary, persistence, and message exchange. Runtime `Value`s carry
//! NaN-boxed pointers, so encoding goes through an owned [`TypedValue`]
//! tree first.
//!
//! # Why BTreeMap?
//!
//! `TypedValue::Map` uses `BTreeMap` so the same logical map always
//! serializes to identical bytes: the codec is part of the deterministic
//! artifact surface (checksums, reproducible snapshots), not just an
//! interchange format.
//!
//! Code-bearing values (callables), scheduler state (tasks, channels),
//! open files, and raw handles never cross the boundary; encoding them
//! is an error.

use std::collections::BTreeMap;

use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};

use crate::heap::Heap;
use crate::value::{Payload, Value};

/// Error during encode/decode.
#[derive(Debug)]
pub enum CodecError {
    /// Code, scheduler state, files, and handles are not representable.
    NotRepresentable(&'static str),
    /// Mapping key type outside the key subset.
    UnhashableKey(&'static str),
    /// Bincode encode/decode failure.
    Bincode(Box<bincode::Error>),
    /// Non-finite floats cannot be mapping keys.
    NonFiniteKey(f64),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::NotRepresentable(what) => {
                write!(f, "{} values cannot be encoded", what)
            }
            CodecError::UnhashableKey(what) => {
                write!(f, "{} values cannot be mapping keys", what)
            }
            CodecError::Bincode(e) => write!(f, "codec error: {}", e),
            CodecError::NonFiniteKey(v) => write!(f, "non-finite mapping key {}", v),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Bincode(Box::new(e))
    }
}

/// Keys ordered for deterministic serialization. Floats are excluded:
/// the key subset mirrors what the runtime will hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypedKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Sign and little-endian magnitude of a promoted integer.
    BigInt { negative: bool, magnitude: Vec<u8> },
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<TypedKey>),
}

/// Owned serializable value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Null,
    Bool(bool),
    Int(i64),
    BigInt { negative: bool, magnitude: Vec<u8> },
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<TypedValue>),
    Tuple(Vec<TypedValue>),
    Map(BTreeMap<TypedKey, TypedValue>),
    Set(Vec<TypedKey>),
}

/// Lower a runtime value into the owned tree.
pub fn to_typed(rt_shapes: &crate::heap::ShapeTable, v: Value) -> Result<TypedValue, CodecError> {
    if v.0.is_float() {
        return Ok(TypedValue::Float(v.0.as_float()));
    }
    if v.0.is_small_int() {
        return Ok(TypedValue::Int(v.0.as_small_int()));
    }
    if v.0.is_null() {
        return Ok(TypedValue::Null);
    }
    if v.0.is_bool() {
        return Ok(TypedValue::Bool(v.0.as_bool()));
    }
    if v.0.is_handle() {
        return Err(CodecError::NotRepresentable("handle"));
    }
    match &v.obj().expect("heap value").payload {
        Payload::BigInt(n) => {
            let (sign, magnitude) = n.to_bytes_le();
            Ok(TypedValue::BigInt {
                negative: sign == Sign::Minus,
                magnitude,
            })
        }
        Payload::Str(s) => Ok(TypedValue::Str(s.text.clone())),
        Payload::Bytes(b) => Ok(TypedValue::Bytes(b.clone())),
        Payload::List(items) => Ok(TypedValue::List(
            items
                .borrow()
                .iter()
                .map(|v| to_typed(rt_shapes, *v))
                .collect::<Result<_, _>>()?,
        )),
        Payload::Tuple(items) => Ok(TypedValue::Tuple(
            items
                .iter()
                .map(|v| to_typed(rt_shapes, *v))
                .collect::<Result<_, _>>()?,
        )),
        Payload::Map(m) => {
            let m = m.borrow();
            let mut out = BTreeMap::new();
            if let Some(shape) = m.shape {
                // Shaped maps rematerialize their keys for the wire.
                let keys = rt_shapes.keys(shape);
                for (key, slot) in keys.iter().zip(m.slots.iter()) {
                    out.insert(TypedKey::Str(key.clone()), to_typed(rt_shapes, *slot)?);
                }
            } else {
                for (_, k, val) in m.entries.iter() {
                    out.insert(to_key(rt_shapes, *k)?, to_typed(rt_shapes, *val)?);
                }
            }
            Ok(TypedValue::Map(out))
        }
        Payload::Set(s) => {
            let mut keys: Vec<TypedKey> = s
                .borrow()
                .entries
                .iter()
                .map(|(_, v)| to_key(rt_shapes, *v))
                .collect::<Result<_, _>>()?;
            keys.sort();
            Ok(TypedValue::Set(keys))
        }
        Payload::Instance(_) => Err(CodecError::NotRepresentable("instance")),
        Payload::Callable(_) => Err(CodecError::NotRepresentable("callable")),
        Payload::Error(_) => Err(CodecError::NotRepresentable("error")),
        Payload::Task(_) => Err(CodecError::NotRepresentable("task")),
        Payload::Channel(_) => Err(CodecError::NotRepresentable("channel")),
        Payload::File(_) => Err(CodecError::NotRepresentable("file")),
        Payload::Iter(_) => Err(CodecError::NotRepresentable("iterator")),
    }
}

fn to_key(rt_shapes: &crate::heap::ShapeTable, v: Value) -> Result<TypedKey, CodecError> {
    if v.0.is_float() {
        return Err(CodecError::UnhashableKey("float"));
    }
    match to_typed(rt_shapes, v)? {
        TypedValue::Null => Ok(TypedKey::Null),
        TypedValue::Bool(b) => Ok(TypedKey::Bool(b)),
        TypedValue::Int(n) => Ok(TypedKey::Int(n)),
        TypedValue::BigInt {
            negative,
            magnitude,
        } => Ok(TypedKey::BigInt {
            negative,
            magnitude,
        }),
        TypedValue::Str(s) => Ok(TypedKey::Str(s)),
        TypedValue::Bytes(b) => Ok(TypedKey::Bytes(b)),
        TypedValue::Tuple(items) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                keys.push(match item {
                    TypedValue::Null => TypedKey::Null,
                    TypedValue::Bool(b) => TypedKey::Bool(b),
                    TypedValue::Int(n) => TypedKey::Int(n),
                    TypedValue::Str(s) => TypedKey::Str(s),
                    TypedValue::Bytes(b) => TypedKey::Bytes(b),
                    _ => return Err(CodecError::UnhashableKey("nested container")),
                });
            }
            Ok(TypedKey::Tuple(keys))
        }
        _ => Err(CodecError::UnhashableKey("container")),
    }
}

/// Rebuild a runtime value from the owned tree. Hashes for map/set
/// entries use the runtime's seed.
pub fn from_typed(
    heap: &Heap,
    shapes: &crate::heap::ShapeTable,
    seed: u64,
    tv: &TypedValue,
) -> Value {
    match tv {
        TypedValue::Null => Value::null(),
        TypedValue::Bool(b) => Value::bool(*b),
        TypedValue::Int(n) => heap.int(*n),
        TypedValue::BigInt {
            negative,
            magnitude,
        } => {
            let sign = if *negative { Sign::Minus } else { Sign::Plus };
            heap.big_int(BigInt::from_bytes_le(sign, magnitude))
        }
        TypedValue::Float(f) => Value::float(*f),
        TypedValue::Str(s) => heap.str(s.clone()),
        TypedValue::Bytes(b) => heap.bytes(b.clone()),
        TypedValue::List(items) => {
            let vs = items
                .iter()
                .map(|item| from_typed(heap, shapes, seed, item))
                .collect();
            heap.list(vs)
        }
        TypedValue::Tuple(items) => {
            let vs = items
                .iter()
                .map(|item| from_typed(heap, shapes, seed, item))
                .collect();
            heap.tuple(vs)
        }
        TypedValue::Map(entries) => {
            let m = heap.map();
            for (k, val) in entries {
                let key = from_typed(heap, shapes, seed, &key_to_value(k));
                let value = from_typed(heap, shapes, seed, val);
                let hash = crate::value::value_hash(seed, key).expect("key subset is hashable");
                if let Payload::Map(data) = &m.obj().expect("fresh map").payload {
                    data.borrow_mut().entries.push((hash, key, value));
                }
            }
            m
        }
        TypedValue::Set(keys) => {
            let s = heap.set();
            for k in keys {
                let key = from_typed(heap, shapes, seed, &key_to_value(k));
                let hash = crate::value::value_hash(seed, key).expect("key subset is hashable");
                if let Payload::Set(data) = &s.obj().expect("fresh set").payload {
                    data.borrow_mut().entries.push((hash, key));
                }
            }
            s
        }
    }
}

fn key_to_value(k: &TypedKey) -> TypedValue {
    match k {
        TypedKey::Null => TypedValue::Null,
        TypedKey::Bool(b) => TypedValue::Bool(*b),
        TypedKey::Int(n) => TypedValue::Int(*n),
        TypedKey::BigInt {
            negative,
            magnitude,
        } => TypedValue::BigInt {
            negative: *negative,
            magnitude: magnitude.clone(),
        },
        TypedKey::Str(s) => TypedValue::Str(s.clone()),
        TypedKey::Bytes(b) => TypedValue::Bytes(b.clone()),
        TypedKey::Tuple(items) => TypedValue::Tuple(items.iter().map(key_to_value).collect()),
    }
}

/// Render as JSON for manifests and diagnostics. Byte strings become
/// base64; map keys render through their display form.
pub fn to_json(tv: &TypedValue) -> serde_json::Value {
    use base64::Engine;
    use serde_json::Value as J;
    match tv {
        TypedValue::Null => J::Null,
        TypedValue::Bool(b) => J::Bool(*b),
        TypedValue::Int(n) => J::from(*n),
        TypedValue::BigInt {
            negative,
            magnitude,
        } => {
            let sign = if *negative { Sign::Minus } else { Sign::Plus };
            J::String(BigInt::from_bytes_le(sign, magnitude).to_string())
        }
        TypedValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .unwrap_or(J::Null),
        TypedValue::Str(s) => J::String(s.clone()),
        TypedValue::Bytes(b) => {
            J::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        TypedValue::List(items) | TypedValue::Tuple(items) => {
            J::Array(items.iter().map(to_json).collect())
        }
        TypedValue::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(key_display(k), to_json(v));
            }
            J::Object(map)
        }
        TypedValue::Set(keys) => J::Array(
            keys.iter()
                .map(|k| to_json(&key_to_value(k)))
                .collect(),
        ),
    }
}

fn key_display(k: &TypedKey) -> String {
    match k {
        TypedKey::Null => "null".to_string(),
        TypedKey::Bool(b) => b.to_string(),
        TypedKey::Int(n) => n.to_string(),
        TypedKey::BigInt {
            negative,
            magnitude,
        } => {
            let sign = if *negative { Sign::Minus } else { Sign::Plus };
            BigInt::from_bytes_le(sign, magnitude).to_string()
        }
        TypedKey::Str(s) => s.clone(),
        TypedKey::Bytes(b) => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(b)
        }
        TypedKey::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(key_display).collect();
            format!("({})", parts.join(","))
        }
    }
}

/// Encode to the compact binary form.
pub fn encode(tv: &TypedValue) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(tv)?)
}

/// Decode from the compact binary form.
pub fn decode(bytes: &[u8]) -> Result<TypedValue, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ShapeTable;

    fn roundtrip(tv: &TypedValue) -> TypedValue {
        decode(&encode(tv).unwrap()).unwrap()
    }

    #[test]
    fn test_scalar_roundtrips() {
        for tv in [
            TypedValue::Null,
            TypedValue::Bool(true),
            TypedValue::Int(-42),
            TypedValue::Float(2.5),
            TypedValue::Str("héllo".into()),
            TypedValue::Bytes(vec![0, 255, 7]),
        ] {
            assert_eq!(roundtrip(&tv), tv);
        }
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert(TypedKey::Str("xs".into()), TypedValue::List(vec![
            TypedValue::Int(1),
            TypedValue::Tuple(vec![TypedValue::Null, TypedValue::Bool(false)]),
        ]));
        let tv = TypedValue::Map(map);
        assert_eq!(roundtrip(&tv), tv);
    }

    #[test]
    fn test_map_bytes_are_key_order_independent() {
        // BTreeMap: insertion order cannot leak into the encoding.
        let mut a = BTreeMap::new();
        a.insert(TypedKey::Str("a".into()), TypedValue::Int(1));
        a.insert(TypedKey::Str("b".into()), TypedValue::Int(2));
        let mut b = BTreeMap::new();
        b.insert(TypedKey::Str("b".into()), TypedValue::Int(2));
        b.insert(TypedKey::Str("a".into()), TypedValue::Int(1));
        assert_eq!(
            encode(&TypedValue::Map(a)).unwrap(),
            encode(&TypedValue::Map(b)).unwrap()
        );
    }

    #[test]
    fn test_value_to_typed_and_back() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let inner = heap.list(vec![heap.int(1), heap.str("two"), Value::float(3.0)]);
        let tv = to_typed(&shapes, inner).unwrap();
        let back = from_typed(&heap, &shapes, 0, &tv);
        assert!(crate::value::value_eq(inner, back));
        heap.release(inner);
        heap.release(back);
    }

    #[test]
    fn test_shaped_map_encodes_as_plain_map() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let shape = shapes.intern(vec!["x".into(), "y".into()]);
        let m = heap.shaped_map(shape, vec![heap.int(3), heap.int(4)]);
        let tv = to_typed(&shapes, m).unwrap();
        match &tv {
            TypedValue::Map(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(
                    entries.get(&TypedKey::Str("x".into())),
                    Some(&TypedValue::Int(3))
                );
            }
            other => panic!("expected map, got {:?}", other),
        }
        heap.release(m);
    }

    #[test]
    fn test_json_rendering() {
        let tv = TypedValue::List(vec![
            TypedValue::Int(1),
            TypedValue::Bytes(vec![1, 2, 3]),
            TypedValue::Null,
        ]);
        let json = to_json(&tv);
        assert_eq!(json[0], serde_json::json!(1));
        // Bytes render as base64.
        assert_eq!(json[1], serde_json::json!("AQID"));
        assert_eq!(json[2], serde_json::Value::Null);
    }

    #[test]
    fn test_code_bearing_values_rejected() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let c = heap.callable(1, vec![]);
        assert!(matches!(
            to_typed(&shapes, c),
            Err(CodecError::NotRepresentable("callable"))
        ));
        heap.release(c);
    }
}
