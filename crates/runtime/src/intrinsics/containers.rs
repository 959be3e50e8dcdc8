//! Container intrinsics
//!
//! ## Ownership convention
//!
//! Containers own references to their elements: mutators that store a
//! value retain it, mutators that remove a value transfer the reference
//! to the caller, and plain loads return a borrowed value (the caller
//! retains if it needs to keep it). LIR emits the matching releases.
//!
//! ## Shaped maps
//!
//! A map with a shape descriptor stores its values in fixed slots.
//! Reading a key in the shape is an offset load; reading a key outside
//! it raises KeyError. A write outside the shape (or any delete)
//! dissolves the shape: slots rematerialize as ordinary entries and the
//! map continues as a dynamic mapping.

use crate::errors::{index_error, key_error, type_error, RtError};
use crate::heap::{Heap, ShapeTable};
use crate::value::{value_eq, value_hash, value_repr, IterState, MapData, Payload, Value};

fn list_ref(v: Value) -> Result<&'static std::cell::RefCell<Vec<Value>>, RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::List(l)) => Ok(l),
        _ => Err(type_error(format!("expected list, got {}", v.type_name()))),
    }
}

fn map_ref(v: Value) -> Result<&'static std::cell::RefCell<MapData>, RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::Map(m)) => Ok(m),
        _ => Err(type_error(format!("expected map, got {}", v.type_name()))),
    }
}

fn norm_index(i: i64, len: usize) -> Result<usize, RtError> {
    let eff = if i < 0 { i + len as i64 } else { i };
    if eff < 0 || eff >= len as i64 {
        Err(index_error(format!("index {} out of range", i)))
    } else {
        Ok(eff as usize)
    }
}

// =============================================================================
// Lists
// =============================================================================

pub fn list_push(heap: &Heap, list: Value, item: Value) -> Result<Value, RtError> {
    heap.retain(item);
    list_ref(list)?.borrow_mut().push(item);
    Ok(Value::null())
}

/// Pop transfers the element's reference to the caller.
pub fn list_pop(_heap: &Heap, list: Value) -> Result<Value, RtError> {
    list_ref(list)?
        .borrow_mut()
        .pop()
        .ok_or_else(|| index_error("pop from empty list"))
}

pub fn list_get(list: Value, idx: Value) -> Result<Value, RtError> {
    let items = list_ref(list)?.borrow();
    let i = norm_index(idx.expect_i64()?, items.len())?;
    Ok(items[i])
}

pub fn list_set(heap: &Heap, list: Value, idx: Value, item: Value) -> Result<Value, RtError> {
    let items = list_ref(list)?;
    let mut items = items.borrow_mut();
    let i = norm_index(idx.expect_i64()?, items.len())?;
    heap.retain(item);
    heap.release(items[i]);
    items[i] = item;
    Ok(Value::null())
}

pub fn list_len(heap: &Heap, list: Value) -> Result<Value, RtError> {
    Ok(heap.int(list_ref(list)?.borrow().len() as i64))
}

// =============================================================================
// Tuples
// =============================================================================

/// Build a tuple from a list snapshot, retaining every element.
pub fn tuple_new(heap: &Heap, list: Value) -> Result<Value, RtError> {
    let items = list_ref(list)?.borrow().clone();
    for item in &items {
        heap.retain(*item);
    }
    Ok(heap.tuple(items))
}

pub fn tuple_get(tuple: Value, idx: Value) -> Result<Value, RtError> {
    match tuple.obj().map(|o| &o.payload) {
        Some(Payload::Tuple(items)) => {
            let i = norm_index(idx.expect_i64()?, items.len())?;
            Ok(items[i])
        }
        _ => Err(type_error(format!(
            "expected tuple, got {}",
            tuple.type_name()
        ))),
    }
}

pub fn tuple_len(heap: &Heap, tuple: Value) -> Result<Value, RtError> {
    match tuple.obj().map(|o| &o.payload) {
        Some(Payload::Tuple(items)) => Ok(heap.int(items.len() as i64)),
        _ => Err(type_error(format!(
            "expected tuple, got {}",
            tuple.type_name()
        ))),
    }
}

// =============================================================================
// Maps
// =============================================================================

/// Dissolve a shape in place: slots become ordinary entries keyed by
/// the shape's key strings. Both representations stay observably
/// identical at the boundary.
fn dissolve_shape(heap: &Heap, shapes: &ShapeTable, seed: u64, map: Value) -> Result<(), RtError> {
    let data = map_ref(map)?;
    let mut data = data.borrow_mut();
    let Some(shape) = data.shape else { return Ok(()) };
    let keys = shapes.keys(shape);
    let slots = std::mem::take(&mut data.slots);
    for (key, slot) in keys.into_iter().zip(slots.into_iter()) {
        let key_value = heap.str(key);
        let hash = value_hash(seed, key_value)?;
        data.entries.push((hash, key_value, slot));
    }
    data.shape = None;
    drop(data);
    map.obj().expect("map object").header.set_shape(None);
    Ok(())
}

pub fn map_get(
    shapes: &ShapeTable,
    seed: u64,
    map: Value,
    key: Value,
) -> Result<Value, RtError> {
    let data = map_ref(map)?.borrow();
    if let Some(shape) = data.shape {
        let k = key
            .as_str()
            .ok_or_else(|| key_error(value_repr(key)))?;
        return match shapes.offset(shape, k) {
            Some(off) => Ok(data.slots[off]),
            None => Err(key_error(format!("{:?}", k))),
        };
    }
    let hash = value_hash(seed, key)?;
    for (h, k, v) in data.entries.iter() {
        if *h == hash && value_eq(*k, key) {
            return Ok(*v);
        }
    }
    Err(key_error(value_repr(key)))
}

pub fn map_set(
    heap: &Heap,
    shapes: &ShapeTable,
    seed: u64,
    map: Value,
    key: Value,
    value: Value,
) -> Result<Value, RtError> {
    {
        let data = map_ref(map)?;
        let mut data = data.borrow_mut();
        if let Some(shape) = data.shape {
            if let Some(off) = key.as_str().and_then(|k| shapes.offset(shape, k)) {
                heap.retain(value);
                heap.release(data.slots[off]);
                data.slots[off] = value;
                return Ok(Value::null());
            }
            // Key outside the shape: fall through to dissolve below.
        } else {
            let hash = value_hash(seed, key)?;
            for (h, k, v) in data.entries.iter_mut() {
                if *h == hash && value_eq(*k, key) {
                    heap.retain(value);
                    heap.release(*v);
                    *v = value;
                    return Ok(Value::null());
                }
            }
            heap.retain(key);
            heap.retain(value);
            data.entries.push((hash, key, value));
            return Ok(Value::null());
        }
    }
    dissolve_shape(heap, shapes, seed, map)?;
    map_set(heap, shapes, seed, map, key, value)
}

pub fn map_del(
    heap: &Heap,
    shapes: &ShapeTable,
    seed: u64,
    map: Value,
    key: Value,
) -> Result<Value, RtError> {
    // Any delete dissolves a shape: the fixed key set no longer holds.
    dissolve_shape(heap, shapes, seed, map)?;
    let data = map_ref(map)?;
    let mut data = data.borrow_mut();
    let hash = value_hash(seed, key)?;
    match data
        .entries
        .iter()
        .position(|(h, k, _)| *h == hash && value_eq(*k, key))
    {
        Some(pos) => {
            let (_, k, v) = data.entries.remove(pos);
            heap.release(k);
            heap.release(v);
            Ok(Value::null())
        }
        None => Err(key_error(value_repr(key))),
    }
}

pub fn map_has(
    shapes: &ShapeTable,
    seed: u64,
    map: Value,
    key: Value,
) -> Result<Value, RtError> {
    match map_get(shapes, seed, map, key) {
        Ok(_) => Ok(Value::bool(true)),
        Err(e) if e.kind == molt_core::ErrorKind::Key => Ok(Value::bool(false)),
        Err(e) => Err(e),
    }
}

pub fn map_len(heap: &Heap, map: Value) -> Result<Value, RtError> {
    let data = map_ref(map)?.borrow();
    let len = if data.shape.is_some() {
        data.slots.len()
    } else {
        data.entries.len()
    };
    Ok(heap.int(len as i64))
}

/// Keys in insertion (or shape) order.
pub fn map_keys(heap: &Heap, shapes: &ShapeTable, map: Value) -> Result<Value, RtError> {
    let data = map_ref(map)?.borrow();
    let keys: Vec<Value> = if let Some(shape) = data.shape {
        shapes.keys(shape).into_iter().map(|k| heap.str(k)).collect()
    } else {
        data.entries
            .iter()
            .map(|(_, k, _)| {
                heap.retain(*k);
                *k
            })
            .collect()
    };
    Ok(heap.list(keys))
}

// =============================================================================
// Sets
// =============================================================================

fn set_ref(v: Value) -> Result<&'static std::cell::RefCell<crate::value::SetData>, RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::Set(s)) => Ok(s),
        _ => Err(type_error(format!("expected set, got {}", v.type_name()))),
    }
}

pub fn set_add(heap: &Heap, seed: u64, set: Value, item: Value) -> Result<Value, RtError> {
    let hash = value_hash(seed, item)?;
    let data = set_ref(set)?;
    let mut data = data.borrow_mut();
    if data
        .entries
        .iter()
        .any(|(h, v)| *h == hash && value_eq(*v, item))
    {
        return Ok(Value::null());
    }
    heap.retain(item);
    data.entries.push((hash, item));
    Ok(Value::null())
}

pub fn set_has(seed: u64, set: Value, item: Value) -> Result<Value, RtError> {
    let hash = value_hash(seed, item)?;
    let data = set_ref(set)?.borrow();
    Ok(Value::bool(
        data.entries
            .iter()
            .any(|(h, v)| *h == hash && value_eq(*v, item)),
    ))
}

pub fn set_len(heap: &Heap, set: Value) -> Result<Value, RtError> {
    Ok(heap.int(set_ref(set)?.borrow().entries.len() as i64))
}

// =============================================================================
// Iterators
// =============================================================================

/// Iterator acquisition: lists, tuples, strings, maps (keys), sets.
pub fn iter_new(heap: &Heap, source: Value) -> Result<Value, RtError> {
    let ok = matches!(
        source.obj().map(|o| &o.payload),
        Some(
            Payload::List(_)
                | Payload::Tuple(_)
                | Payload::Str(_)
                | Payload::Map(_)
                | Payload::Set(_)
        )
    );
    if !ok {
        return Err(type_error(format!(
            "{} is not iterable",
            source.type_name()
        )));
    }
    heap.retain(source);
    Ok(heap.alloc(Payload::Iter(std::cell::RefCell::new(IterState {
        source,
        pos: 0,
    }))))
}

/// Advance an iterator: returns `(value, done)`. The yielded value is
/// retained for the caller; when `done` is true the value slot is null.
pub fn iter_next(heap: &Heap, shapes: &ShapeTable, iter: Value) -> Result<Value, RtError> {
    let state = match iter.obj().map(|o| &o.payload) {
        Some(Payload::Iter(s)) => s,
        _ => {
            return Err(type_error(format!(
                "expected iterator, got {}",
                iter.type_name()
            )))
        }
    };
    let mut state = state.borrow_mut();
    let pos = state.pos;
    let item: Option<Value> = match &state.source.obj().expect("iterable is heap").payload {
        Payload::List(items) => items.borrow().get(pos).copied(),
        Payload::Tuple(items) => items.get(pos).copied(),
        Payload::Str(s) => s.text.chars().nth(pos).map(|c| heap.str(c.to_string())),
        Payload::Map(m) => {
            let m = m.borrow();
            if let Some(shape) = m.shape {
                shapes.keys(shape).get(pos).map(|k| heap.str(k.clone()))
            } else {
                m.entries.get(pos).map(|(_, k, _)| *k)
            }
        }
        Payload::Set(s) => s.borrow().entries.get(pos).map(|(_, v)| *v),
        _ => return Err(type_error("iterator source was replaced")),
    };
    match item {
        Some(v) => {
            state.pos += 1;
            heap.retain(v);
            Ok(heap.tuple(vec![v, Value::bool(false)]))
        }
        None => Ok(heap.tuple(vec![Value::null(), Value::bool(true)])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_push_get_set() {
        let heap = Heap::new();
        let l = heap.list(vec![]);
        list_push(&heap, l, heap.int(10)).unwrap();
        list_push(&heap, l, heap.int(20)).unwrap();
        assert_eq!(list_len(&heap, l).unwrap().expect_i64().unwrap(), 2);
        assert_eq!(
            list_get(l, heap.int(-1)).unwrap().expect_i64().unwrap(),
            20
        );
        list_set(&heap, l, heap.int(0), heap.int(99)).unwrap();
        assert_eq!(list_get(l, heap.int(0)).unwrap().expect_i64().unwrap(), 99);
        let err = list_get(l, heap.int(5)).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Index);
        heap.release(l);
    }

    #[test]
    fn test_map_set_get_del() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let m = heap.map();
        let k = heap.str("name");
        map_set(&heap, &shapes, 0, m, k, heap.str("molt")).unwrap();
        let got = map_get(&shapes, 0, m, k).unwrap();
        assert_eq!(got.as_str().unwrap(), "molt");
        assert!(map_has(&shapes, 0, m, k).unwrap().truthy());
        map_del(&heap, &shapes, 0, m, k).unwrap();
        let err = map_get(&shapes, 0, m, k).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Key);
        heap.release(k);
        heap.release(m);
    }

    #[test]
    fn test_shaped_map_reads_and_widening() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let shape = shapes.intern(vec!["x".into(), "y".into()]);
        let m = heap.shaped_map(shape, vec![heap.int(3), heap.int(4)]);

        // Read of a shape key after a write returns the written value.
        let kx = heap.str("x");
        map_set(&heap, &shapes, 0, m, kx, heap.int(30)).unwrap();
        assert_eq!(
            map_get(&shapes, 0, m, kx).unwrap().expect_i64().unwrap(),
            30
        );
        // Read of a key outside the shape raises KeyError.
        let kz = heap.str("z");
        let err = map_get(&shapes, 0, m, kz).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Key);

        // Writing outside the shape dissolves it; both old and new keys
        // stay readable.
        map_set(&heap, &shapes, 0, m, kz, heap.int(5)).unwrap();
        assert!(m.obj().unwrap().header.shape().is_none());
        assert_eq!(
            map_get(&shapes, 0, m, kx).unwrap().expect_i64().unwrap(),
            30
        );
        assert_eq!(map_get(&shapes, 0, m, kz).unwrap().expect_i64().unwrap(), 5);
        heap.release(kx);
        heap.release(kz);
        heap.release(m);
    }

    #[test]
    fn test_set_dedupe() {
        let heap = Heap::new();
        let s = heap.set();
        set_add(&heap, 0, s, heap.int(1)).unwrap();
        set_add(&heap, 0, s, heap.int(1)).unwrap();
        set_add(&heap, 0, s, heap.int(2)).unwrap();
        assert_eq!(set_len(&heap, s).unwrap().expect_i64().unwrap(), 2);
        assert!(set_has(0, s, heap.int(1)).unwrap().truthy());
        assert!(!set_has(0, s, heap.int(3)).unwrap().truthy());
        heap.release(s);
    }

    #[test]
    fn test_iteration_protocol() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let l = heap.list(vec![heap.int(5), heap.int(6)]);
        let it = iter_new(&heap, l).unwrap();
        let mut seen = Vec::new();
        loop {
            let step = iter_next(&heap, &shapes, it).unwrap();
            let done = tuple_get(step, heap.int(1)).unwrap();
            if done.truthy() {
                heap.release(step);
                break;
            }
            seen.push(tuple_get(step, heap.int(0)).unwrap().expect_i64().unwrap());
            heap.release(step);
        }
        assert_eq!(seen, vec![5, 6]);
        heap.release(it);
        heap.release(l);
    }

    #[test]
    fn test_iter_rejects_noniterable() {
        let heap = Heap::new();
        assert!(iter_new(&heap, Value::small_int(3)).is_err());
    }

    #[test]
    fn test_unhashable_key_rejected() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let m = heap.map();
        let bad_key = heap.list(vec![]);
        let err = map_set(&heap, &shapes, 0, m, bad_key, heap.int(1)).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Type);
        heap.release(bad_key);
        heap.release(m);
    }
}
