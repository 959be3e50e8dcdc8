//! Dynamic-path operators
//!
//! The general (all-dynamic) code paths and deopt targets dispatch on
//! runtime tags here. Typed code never reaches these; a guard failure
//! or an untyped general variant does.

use crate::errors::{key_error, type_error, zero_division, RtError};
use crate::heap::{Heap, ShapeTable};
use crate::runtime::Runtime;
use crate::value::{value_eq, Payload, Value};

use super::{containers, num, str_ops};

fn both_ints(a: Value, b: Value) -> bool {
    a.as_int().is_some() && b.as_int().is_some()
}

fn both_numeric(a: Value, b: Value) -> bool {
    (a.0.is_float() || a.as_int().is_some()) && (b.0.is_float() || b.as_int().is_some())
}

pub fn any_add(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    if both_ints(a, b) {
        return num::int_add(heap, a, b);
    }
    if both_numeric(a, b) {
        return Ok(Value::float(
            a.as_f64().expect("numeric") + b.as_f64().expect("numeric"),
        ));
    }
    match (a.obj().map(|o| &o.payload), b.obj().map(|o| &o.payload)) {
        (Some(Payload::Str(_)), Some(Payload::Str(_))) => str_ops::str_concat(heap, a, b),
        (Some(Payload::List(x)), Some(Payload::List(y))) => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().copied());
            for item in &items {
                heap.retain(*item);
            }
            Ok(heap.list(items))
        }
        _ => Err(type_error(format!(
            "unsupported operand types for +: {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

pub fn any_sub(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    if both_ints(a, b) {
        return num::int_sub(heap, a, b);
    }
    if both_numeric(a, b) {
        return Ok(Value::float(
            a.as_f64().expect("numeric") - b.as_f64().expect("numeric"),
        ));
    }
    Err(type_error(format!(
        "unsupported operand types for -: {} and {}",
        a.type_name(),
        b.type_name()
    )))
}

pub fn any_mul(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    if both_ints(a, b) {
        return num::int_mul(heap, a, b);
    }
    if both_numeric(a, b) {
        return Ok(Value::float(
            a.as_f64().expect("numeric") * b.as_f64().expect("numeric"),
        ));
    }
    Err(type_error(format!(
        "unsupported operand types for *: {} and {}",
        a.type_name(),
        b.type_name()
    )))
}

/// True division: always a float over numerics.
pub fn any_div(a: Value, b: Value) -> Result<Value, RtError> {
    if both_numeric(a, b) {
        let d = b.as_f64().expect("numeric");
        if d == 0.0 {
            return Err(zero_division("division by zero"));
        }
        return Ok(Value::float(a.as_f64().expect("numeric") / d));
    }
    Err(type_error(format!(
        "unsupported operand types for /: {} and {}",
        a.type_name(),
        b.type_name()
    )))
}

pub fn any_floordiv(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    if both_ints(a, b) {
        return num::int_div(heap, a, b);
    }
    if both_numeric(a, b) {
        let d = b.as_f64().expect("numeric");
        if d == 0.0 {
            return Err(zero_division("division by zero"));
        }
        return Ok(Value::float((a.as_f64().expect("numeric") / d).floor()));
    }
    Err(type_error(format!(
        "unsupported operand types for //: {} and {}",
        a.type_name(),
        b.type_name()
    )))
}

pub fn any_mod(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    if both_ints(a, b) {
        return num::int_mod(heap, a, b);
    }
    if both_numeric(a, b) {
        let d = b.as_f64().expect("numeric");
        if d == 0.0 {
            return Err(zero_division("modulo by zero"));
        }
        let x = a.as_f64().expect("numeric");
        // Sign follows the divisor, as in the integer case.
        let r = x - (x / d).floor() * d;
        return Ok(Value::float(r));
    }
    Err(type_error(format!(
        "unsupported operand types for %: {} and {}",
        a.type_name(),
        b.type_name()
    )))
}

pub fn any_neg(heap: &Heap, a: Value) -> Result<Value, RtError> {
    if a.as_int().is_some() {
        return num::int_neg(heap, a);
    }
    if a.0.is_float() {
        return Ok(Value::float(-a.0.as_float()));
    }
    Err(type_error(format!("cannot negate {}", a.type_name())))
}

pub fn any_not(a: Value) -> Result<Value, RtError> {
    Ok(Value::bool(!a.truthy()))
}

/// Membership: substring for strings, element for sequences and sets,
/// key for mappings.
pub fn any_contains(
    shapes: &ShapeTable,
    seed: u64,
    container: Value,
    item: Value,
) -> Result<Value, RtError> {
    match container.obj().map(|o| &o.payload) {
        Some(Payload::Str(s)) => {
            let needle = item.expect_str()?;
            Ok(Value::bool(s.text.contains(needle)))
        }
        Some(Payload::List(items)) => Ok(Value::bool(
            items.borrow().iter().any(|v| value_eq(*v, item)),
        )),
        Some(Payload::Tuple(items)) => {
            Ok(Value::bool(items.iter().any(|v| value_eq(*v, item))))
        }
        Some(Payload::Set(_)) => containers::set_has(seed, container, item),
        Some(Payload::Map(_)) => containers::map_has(shapes, seed, container, item),
        _ => Err(type_error(format!(
            "{} is not a container",
            container.type_name()
        ))),
    }
}

pub fn any_len(heap: &Heap, v: Value) -> Result<Value, RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::Str(_)) => str_ops::str_len(heap, v),
        Some(Payload::Bytes(b)) => Ok(heap.int(b.len() as i64)),
        Some(Payload::List(_)) => containers::list_len(heap, v),
        Some(Payload::Tuple(_)) => containers::tuple_len(heap, v),
        Some(Payload::Map(_)) => containers::map_len(heap, v),
        Some(Payload::Set(_)) => containers::set_len(heap, v),
        _ => Err(type_error(format!("{} has no length", v.type_name()))),
    }
}

pub fn any_get_item(
    heap: &Heap,
    shapes: &ShapeTable,
    seed: u64,
    obj: Value,
    index: Value,
) -> Result<Value, RtError> {
    match obj.obj().map(|o| &o.payload) {
        Some(Payload::List(_)) => containers::list_get(obj, index),
        Some(Payload::Tuple(_)) => containers::tuple_get(obj, index),
        Some(Payload::Map(_)) => containers::map_get(shapes, seed, obj, index),
        Some(Payload::Str(_)) => str_ops::str_index(heap, obj, index),
        Some(Payload::Bytes(b)) => {
            let i = index.expect_i64()?;
            let len = b.len() as i64;
            let eff = if i < 0 { i + len } else { i };
            if eff < 0 || eff >= len {
                Err(crate::errors::index_error(format!(
                    "bytes index {} out of range",
                    i
                )))
            } else {
                Ok(heap.int(b[eff as usize] as i64))
            }
        }
        _ => Err(type_error(format!(
            "{} is not subscriptable",
            obj.type_name()
        ))),
    }
}

pub fn any_set_item(
    heap: &Heap,
    shapes: &ShapeTable,
    seed: u64,
    obj: Value,
    index: Value,
    value: Value,
) -> Result<Value, RtError> {
    match obj.obj().map(|o| &o.payload) {
        Some(Payload::List(_)) => containers::list_set(heap, obj, index, value),
        Some(Payload::Map(_)) => containers::map_set(heap, shapes, seed, obj, index, value),
        _ => Err(type_error(format!(
            "{} does not support item assignment",
            obj.type_name()
        ))),
    }
}

pub fn any_get_attr(rt: &Runtime, obj: Value, name: Value) -> Result<Value, RtError> {
    let name = name.expect_str()?;
    match obj.obj().map(|o| &o.payload) {
        Some(Payload::Instance(inst)) => {
            match rt.class_field_offset(inst.class_id, name) {
                Some(offset) => Ok(inst.fields.borrow()[offset]),
                None => Err(key_error(format!("no attribute '{}'", name))),
            }
        }
        _ => Err(type_error(format!(
            "{} has no attributes",
            obj.type_name()
        ))),
    }
}

pub fn any_set_attr(rt: &Runtime, obj: Value, name: Value, value: Value) -> Result<Value, RtError> {
    let name = name.expect_str()?;
    match obj.obj().map(|o| &o.payload) {
        Some(Payload::Instance(inst)) => {
            match rt.class_field_offset(inst.class_id, name) {
                Some(offset) => {
                    rt.heap.retain(value);
                    let old = inst.fields.borrow()[offset];
                    inst.fields.borrow_mut()[offset] = value;
                    rt.heap.release(old);
                    Ok(Value::null())
                }
                None => Err(key_error(format!("no attribute '{}'", name))),
            }
        }
        _ => Err(type_error(format!(
            "{} has no attributes",
            obj.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_add_dispatch() {
        let heap = Heap::new();
        assert_eq!(
            any_add(&heap, Value::small_int(2), Value::small_int(3))
                .unwrap()
                .expect_i64()
                .unwrap(),
            5
        );
        let r = any_add(&heap, Value::small_int(2), Value::float(0.5)).unwrap();
        assert_eq!(r.0.as_float(), 2.5);
        let s = any_add(&heap, heap.str("ab"), heap.str("cd")).unwrap();
        assert_eq!(s.as_str().unwrap(), "abcd");
        assert!(any_add(&heap, heap.str("a"), Value::small_int(1)).is_err());
    }

    #[test]
    fn test_any_div_always_float() {
        let r = any_div(Value::small_int(7), Value::small_int(2)).unwrap();
        assert_eq!(r.0.as_float(), 3.5);
        assert!(any_div(Value::small_int(1), Value::small_int(0)).is_err());
    }

    #[test]
    fn test_any_contains() {
        let heap = Heap::new();
        let shapes = ShapeTable::new();
        let s = heap.str("hello world");
        let needle = heap.str("lo w");
        assert!(any_contains(&shapes, 0, s, needle).unwrap().truthy());
        let l = heap.list(vec![heap.int(1), heap.int(2)]);
        assert!(any_contains(&shapes, 0, l, heap.int(2)).unwrap().truthy());
        assert!(!any_contains(&shapes, 0, l, heap.int(9)).unwrap().truthy());
    }

    #[test]
    fn test_any_attr_via_class_registry() {
        let rt = Runtime::default();
        let class = rt.register_class(vec!["x".into(), "y".into()]);
        let inst = rt.heap.instance(class, vec![rt.heap.int(1), rt.heap.int(2)]);
        let name = rt.heap.str("y");
        assert_eq!(
            any_get_attr(&rt, inst, name).unwrap().expect_i64().unwrap(),
            2
        );
        any_set_attr(&rt, inst, name, rt.heap.int(9)).unwrap();
        assert_eq!(
            any_get_attr(&rt, inst, name).unwrap().expect_i64().unwrap(),
            9
        );
        let missing = rt.heap.str("z");
        assert!(any_get_attr(&rt, inst, missing).is_err());
    }
}
