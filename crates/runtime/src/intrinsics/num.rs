//! Numeric intrinsics
//!
//! Integer arithmetic promotes from the 31-bit immediate form to BigInt
//! on overflow with no observable change in value; BigInt results that
//! fit demote back, so equal values share one representation.
//!
//! Division and modulus are floor-based: the modulus sign follows the
//! divisor, not the dividend.

use num_bigint::BigInt;

use crate::errors::{type_error, value_error, zero_division, RtError};
use crate::heap::Heap;
use crate::value::{IntRepr, Value};

fn int_args(a: Value, b: Value) -> Result<(IntRepr<'static>, IntRepr<'static>), RtError> {
    match (a.as_int(), b.as_int()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(type_error(format!(
            "expected int operands, got {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn float_args(a: Value, b: Value) -> Result<(f64, f64), RtError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(type_error(format!(
            "expected float operands, got {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

pub fn int_add(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    match int_args(a, b)? {
        // Immediates are 31-bit, so i64 addition cannot overflow.
        (IntRepr::Small(x), IntRepr::Small(y)) => Ok(heap.int(x + y)),
        (x, y) => Ok(heap.big_int(x.to_bigint() + y.to_bigint())),
    }
}

pub fn int_sub(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    match int_args(a, b)? {
        (IntRepr::Small(x), IntRepr::Small(y)) => Ok(heap.int(x - y)),
        (x, y) => Ok(heap.big_int(x.to_bigint() - y.to_bigint())),
    }
}

pub fn int_mul(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    match int_args(a, b)? {
        // 31-bit * 31-bit fits i64.
        (IntRepr::Small(x), IntRepr::Small(y)) => Ok(heap.int(x * y)),
        (x, y) => Ok(heap.big_int(x.to_bigint() * y.to_bigint())),
    }
}

/// Floor division: rounds toward negative infinity.
pub fn int_div(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    match int_args(a, b)? {
        (IntRepr::Small(x), IntRepr::Small(y)) => {
            if y == 0 {
                return Err(zero_division("integer division by zero"));
            }
            Ok(heap.int(small_floor_div(x, y)))
        }
        (x, y) => {
            let (x, y) = (x.to_bigint(), y.to_bigint());
            if y == BigInt::from(0) {
                return Err(zero_division("integer division by zero"));
            }
            Ok(heap.big_int(big_floor_div(&x, &y)))
        }
    }
}

fn small_floor_div(x: i64, y: i64) -> i64 {
    let q = x / y;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

fn small_floor_mod(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && ((r < 0) != (y < 0)) {
        r + y
    } else {
        r
    }
}

fn big_floor_div(x: &BigInt, y: &BigInt) -> BigInt {
    let q = x / y;
    let r = x % y;
    let zero = BigInt::from(0);
    if r != zero && ((r < zero) != (*y < zero)) {
        q - 1
    } else {
        q
    }
}

fn big_floor_mod(x: &BigInt, y: &BigInt) -> BigInt {
    let r = x % y;
    let zero = BigInt::from(0);
    if r != zero && ((r < zero) != (*y < zero)) {
        r + y
    } else {
        r
    }
}

/// Floor modulus: the result's sign follows the divisor.
pub fn int_mod(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    match int_args(a, b)? {
        (IntRepr::Small(x), IntRepr::Small(y)) => {
            if y == 0 {
                return Err(zero_division("integer modulo by zero"));
            }
            Ok(heap.int(small_floor_mod(x, y)))
        }
        (x, y) => {
            let (x, y) = (x.to_bigint(), y.to_bigint());
            if y == BigInt::from(0) {
                return Err(zero_division("integer modulo by zero"));
            }
            Ok(heap.big_int(big_floor_mod(&x, &y)))
        }
    }
}

pub fn int_neg(heap: &Heap, a: Value) -> Result<Value, RtError> {
    match a.as_int() {
        Some(IntRepr::Small(x)) => Ok(heap.int(-x)),
        Some(IntRepr::Big(x)) => Ok(heap.big_int(-x.clone())),
        None => Err(type_error(format!("expected int, got {}", a.type_name()))),
    }
}

pub fn int_invert(heap: &Heap, a: Value) -> Result<Value, RtError> {
    match a.as_int() {
        Some(IntRepr::Small(x)) => Ok(heap.int(-x - 1)),
        Some(IntRepr::Big(x)) => Ok(heap.big_int(-(x.clone()) - 1)),
        None => Err(type_error(format!("expected int, got {}", a.type_name()))),
    }
}

macro_rules! bitwise {
    ($name:ident, $op:tt) => {
        pub fn $name(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
            match int_args(a, b)? {
                (IntRepr::Small(x), IntRepr::Small(y)) => Ok(heap.int(x $op y)),
                (x, y) => Ok(heap.big_int(x.to_bigint() $op y.to_bigint())),
            }
        }
    };
}

bitwise!(int_and, &);
bitwise!(int_or, |);
bitwise!(int_xor, ^);

pub fn int_shl(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    let (x, y) = int_args(a, b)?;
    let shift = match y {
        IntRepr::Small(n) if n >= 0 => n as u64,
        _ => return Err(value_error("negative or oversized shift count")),
    };
    if shift > 1 << 20 {
        return Err(value_error("shift count too large"));
    }
    Ok(heap.big_int(x.to_bigint() << shift as usize))
}

pub fn int_shr(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    let (x, y) = int_args(a, b)?;
    let shift = match y {
        IntRepr::Small(n) if n >= 0 => n as u64,
        _ => return Err(value_error("negative or oversized shift count")),
    };
    // Arithmetic shift: floor semantics for negatives, like floor div
    // by a power of two.
    Ok(heap.big_int(x.to_bigint() >> shift.min(1 << 20) as usize))
}

pub fn float_add(a: Value, b: Value) -> Result<Value, RtError> {
    let (x, y) = float_args(a, b)?;
    Ok(Value::float(x + y))
}

pub fn float_sub(a: Value, b: Value) -> Result<Value, RtError> {
    let (x, y) = float_args(a, b)?;
    Ok(Value::float(x - y))
}

pub fn float_mul(a: Value, b: Value) -> Result<Value, RtError> {
    let (x, y) = float_args(a, b)?;
    Ok(Value::float(x * y))
}

pub fn float_div(a: Value, b: Value) -> Result<Value, RtError> {
    let (x, y) = float_args(a, b)?;
    if y == 0.0 {
        return Err(zero_division("float division by zero"));
    }
    Ok(Value::float(x / y))
}

pub fn float_neg(a: Value) -> Result<Value, RtError> {
    match a.as_f64() {
        Some(x) => Ok(Value::float(-x)),
        None => Err(type_error(format!("expected float, got {}", a.type_name()))),
    }
}

pub fn bool_not(a: Value) -> Result<Value, RtError> {
    if a.0.is_bool() {
        Ok(Value::bool(!a.0.as_bool()))
    } else {
        Err(type_error(format!("expected bool, got {}", a.type_name())))
    }
}

/// Ordering comparison across numerics, strings, bytes, and sequences.
pub fn cmp_lt(a: Value, b: Value) -> Result<Value, RtError> {
    Ok(Value::bool(value_cmp(a, b)? == std::cmp::Ordering::Less))
}

pub fn cmp_le(a: Value, b: Value) -> Result<Value, RtError> {
    Ok(Value::bool(value_cmp(a, b)? != std::cmp::Ordering::Greater))
}

pub fn value_cmp(a: Value, b: Value) -> Result<std::cmp::Ordering, RtError> {
    use crate::value::Payload;
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(match (x, y) {
            (IntRepr::Small(m), IntRepr::Small(n)) => m.cmp(&n),
            _ => x.to_bigint().cmp(&y.to_bigint()),
        });
    }
    if a.0.is_float() || b.0.is_float() {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return x.partial_cmp(&y).ok_or_else(|| {
                value_error("comparison with NaN is unordered")
            });
        }
    }
    match (a.obj().map(|o| &o.payload), b.obj().map(|o| &o.payload)) {
        (Some(Payload::Str(x)), Some(Payload::Str(y))) => Ok(x.text.cmp(&y.text)),
        (Some(Payload::Bytes(x)), Some(Payload::Bytes(y))) => Ok(x.cmp(y)),
        (Some(Payload::List(x)), Some(Payload::List(y))) => {
            let (x, y) = (x.borrow(), y.borrow());
            seq_cmp(x.iter().copied(), y.iter().copied())
        }
        (Some(Payload::Tuple(x)), Some(Payload::Tuple(y))) => {
            seq_cmp(x.iter().copied(), y.iter().copied())
        }
        _ => Err(type_error(format!(
            "'<' not supported between {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn seq_cmp(
    xs: impl Iterator<Item = Value>,
    ys: impl Iterator<Item = Value>,
) -> Result<std::cmp::Ordering, RtError> {
    use std::cmp::Ordering;
    let mut xs = xs.fuse();
    let mut ys = ys.fuse();
    loop {
        match (xs.next(), ys.next()) {
            (None, None) => return Ok(Ordering::Equal),
            (None, Some(_)) => return Ok(Ordering::Less),
            (Some(_), None) => return Ok(Ordering::Greater),
            (Some(x), Some(y)) => {
                let ord = value_cmp(x, y)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_core::MAX_SMALL_INT;

    #[test]
    fn test_add_promotes_on_overflow() {
        let heap = Heap::new();
        let a = heap.int(MAX_SMALL_INT);
        let b = heap.int(1);
        let sum = int_add(&heap, a, b).unwrap();
        assert!(sum.is_heap());
        assert_eq!(sum.expect_i64().unwrap(), MAX_SMALL_INT + 1);
        // Subtracting back demotes to the immediate form.
        let back = int_sub(&heap, sum, b).unwrap();
        assert!(!back.is_heap());
        assert_eq!(back.expect_i64().unwrap(), MAX_SMALL_INT);
        heap.release(sum);
    }

    #[test]
    fn test_mod_sign_follows_divisor() {
        let heap = Heap::new();
        let cases = [(7, 3, 1), (-7, 3, 2), (7, -3, -2), (-7, -3, -1)];
        for (a, b, want) in cases {
            let r = int_mod(&heap, heap.int(a), heap.int(b)).unwrap();
            assert_eq!(r.expect_i64().unwrap(), want, "{} % {}", a, b);
        }
    }

    #[test]
    fn test_floor_division() {
        let heap = Heap::new();
        let cases = [(7, 2, 3), (-7, 2, -4), (7, -2, -4), (-7, -2, 3)];
        for (a, b, want) in cases {
            let r = int_div(&heap, heap.int(a), heap.int(b)).unwrap();
            assert_eq!(r.expect_i64().unwrap(), want, "{} // {}", a, b);
        }
    }

    #[test]
    fn test_zero_division_raises() {
        let heap = Heap::new();
        let err = int_div(&heap, heap.int(1), heap.int(0)).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::ZeroDivision);
        let err = float_div(Value::float(1.0), Value::float(0.0)).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::ZeroDivision);
    }

    #[test]
    fn test_big_mod_matches_small() {
        let heap = Heap::new();
        // Push operands through the BigInt path and compare semantics.
        let big = heap.big_int(num_bigint::BigInt::from(-7) + num_bigint::BigInt::from(0));
        let r = int_mod(&heap, big, heap.int(3)).unwrap();
        assert_eq!(r.expect_i64().unwrap(), 2);
    }

    #[test]
    fn test_shift_guards() {
        let heap = Heap::new();
        assert!(int_shl(&heap, heap.int(1), heap.int(-1)).is_err());
        let r = int_shl(&heap, heap.int(1), heap.int(40)).unwrap();
        assert_eq!(r.expect_i64().unwrap(), 1i64 << 40);
        let r = int_shr(&heap, heap.int(-9), heap.int(1)).unwrap();
        assert_eq!(r.expect_i64().unwrap(), -5); // floor semantics
    }

    #[test]
    fn test_cmp_mixed_numerics() {
        assert!(cmp_lt(Value::small_int(2), Value::float(2.5))
            .unwrap()
            .truthy());
        assert!(!cmp_lt(Value::float(3.0), Value::small_int(3))
            .unwrap()
            .truthy());
        assert!(cmp_le(Value::small_int(3), Value::small_int(3))
            .unwrap()
            .truthy());
    }

    #[test]
    fn test_cmp_type_error() {
        let heap = Heap::new();
        let s = heap.str("x");
        assert!(cmp_lt(Value::small_int(1), s).is_err());
        heap.release(s);
    }
}
