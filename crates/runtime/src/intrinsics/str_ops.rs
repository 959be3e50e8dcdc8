//! String and bytes intrinsics
//!
//! String indices are codepoint indices throughout. Operations check
//! the per-string ASCII content flag and take a byte-indexed fast path
//! when it is set; the slow path counts codepoints.
//!
//! UTF-8 validity is a construction invariant: every `Str` was checked
//! when built, so decoding is the only place a ValueError can enter.

use bumpalo::collections::String as BumpString;

use crate::arena::with_scratch;
use crate::errors::{index_error, type_error, value_error, RtError};
use crate::heap::Heap;
use crate::value::{value_display, Payload, Value};

fn str_arg(v: Value) -> Result<(&'static str, bool), RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::Str(s)) => Ok((s.text.as_str(), s.ascii)),
        _ => Err(type_error(format!("expected str, got {}", v.type_name()))),
    }
}

fn bytes_arg(v: Value) -> Result<&'static [u8], RtError> {
    match v.obj().map(|o| &o.payload) {
        Some(Payload::Bytes(b)) => Ok(b.as_slice()),
        _ => Err(type_error(format!("expected bytes, got {}", v.type_name()))),
    }
}

/// Length in codepoints.
pub fn str_len(heap: &Heap, v: Value) -> Result<Value, RtError> {
    let (s, ascii) = str_arg(v)?;
    let len = if ascii { s.len() } else { s.chars().count() };
    Ok(heap.int(len as i64))
}

pub fn str_concat(heap: &Heap, a: Value, b: Value) -> Result<Value, RtError> {
    let (x, _) = str_arg(a)?;
    let (y, _) = str_arg(b)?;
    let joined = with_scratch(|bump| {
        let mut s = BumpString::with_capacity_in(x.len() + y.len(), bump);
        s.push_str(x);
        s.push_str(y);
        s.as_str().to_string()
    });
    Ok(heap.str(joined))
}

/// Find the needle; returns the codepoint offset or -1. On a
/// mixed-ASCII haystack the byte offset is converted to a codepoint
/// offset by counting.
pub fn str_find(heap: &Heap, haystack: Value, needle: Value) -> Result<Value, RtError> {
    let (h, ascii) = str_arg(haystack)?;
    let (n, _) = str_arg(needle)?;
    match h.find(n) {
        None => Ok(heap.int(-1)),
        Some(byte_off) => {
            let cp_off = if ascii {
                byte_off
            } else {
                h[..byte_off].chars().count()
            };
            Ok(heap.int(cp_off as i64))
        }
    }
}

pub fn str_split(heap: &Heap, v: Value, sep: Value) -> Result<Value, RtError> {
    let (s, _) = str_arg(v)?;
    let (sep, _) = str_arg(sep)?;
    if sep.is_empty() {
        return Err(value_error("empty separator"));
    }
    let parts: Vec<Value> = s.split(sep).map(|part| heap.str(part)).collect();
    Ok(heap.list(parts))
}

pub fn str_replace(heap: &Heap, v: Value, from: Value, to: Value) -> Result<Value, RtError> {
    let (s, _) = str_arg(v)?;
    let (from, _) = str_arg(from)?;
    let (to, _) = str_arg(to)?;
    if from.is_empty() {
        return Err(value_error("empty replacement pattern"));
    }
    Ok(heap.str(s.replace(from, to)))
}

/// Case folding for caseless comparison. ASCII strings lower in place
/// on the fast path.
pub fn str_casefold(heap: &Heap, v: Value) -> Result<Value, RtError> {
    let (s, ascii) = str_arg(v)?;
    if ascii {
        Ok(heap.str(s.to_ascii_lowercase()))
    } else {
        Ok(heap.str(s.to_lowercase()))
    }
}

pub fn str_encode(heap: &Heap, v: Value) -> Result<Value, RtError> {
    let (s, _) = str_arg(v)?;
    Ok(heap.bytes(s.as_bytes().to_vec()))
}

pub fn bytes_decode(heap: &Heap, v: Value) -> Result<Value, RtError> {
    let b = bytes_arg(v)?;
    match std::str::from_utf8(b) {
        Ok(s) => Ok(heap.str(s)),
        Err(e) => Err(value_error(format!(
            "invalid UTF-8 at byte {}",
            e.valid_up_to()
        ))),
    }
}

/// One-codepoint string at a codepoint index; negative indices count
/// from the end.
pub fn str_index(heap: &Heap, v: Value, idx: Value) -> Result<Value, RtError> {
    let (s, ascii) = str_arg(v)?;
    let i = idx.expect_i64()?;
    let len = if ascii { s.len() } else { s.chars().count() };
    let eff = if i < 0 { i + len as i64 } else { i };
    if eff < 0 || eff >= len as i64 {
        return Err(index_error(format!("string index {} out of range", i)));
    }
    if ascii {
        let b = s.as_bytes()[eff as usize];
        Ok(heap.str((b as char).to_string()))
    } else {
        let c = s.chars().nth(eff as usize).expect("bounds checked");
        Ok(heap.str(c.to_string()))
    }
}

/// Sequential `{}` substitution; `{{` and `}}` escape the braces.
pub fn str_format(heap: &Heap, template: Value, args: Value) -> Result<Value, RtError> {
    let (t, _) = str_arg(template)?;
    let items: Vec<Value> = match args.obj().map(|o| &o.payload) {
        Some(Payload::List(l)) => l.borrow().clone(),
        _ => return Err(type_error("format arguments must be a list")),
    };
    let out = with_scratch(|bump| -> Result<String, RtError> {
        let mut out = BumpString::with_capacity_in(t.len() + 16 * items.len(), bump);
        let mut next = 0usize;
        let mut chars = t.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' if chars.peek() == Some(&'}') => {
                    chars.next();
                    let arg = items
                        .get(next)
                        .ok_or_else(|| value_error("not enough format arguments"))?;
                    next += 1;
                    out.push_str(&value_display(*arg));
                }
                '{' | '}' => return Err(value_error("unmatched brace in format string")),
                c => out.push(c),
            }
        }
        if next != items.len() {
            return Err(value_error("too many format arguments"));
        }
        Ok(out.as_str().to_string())
    })?;
    Ok(heap.str(out))
}

/// Numeric formatting with a small spec language: "" (default), "d",
/// "b", "o", "x", "X", ".Nf", "e".
pub fn num_format(heap: &Heap, v: Value, spec: Value) -> Result<Value, RtError> {
    let (spec, _) = str_arg(spec)?;
    let out = match spec {
        "" => value_display(v),
        "d" => match v.as_int() {
            Some(i) => match i {
                crate::value::IntRepr::Small(n) => n.to_string(),
                crate::value::IntRepr::Big(n) => n.to_string(),
            },
            None => return Err(value_error("'d' format requires an int")),
        },
        "b" | "o" | "x" | "X" => {
            let n = v.expect_i64()?;
            match spec {
                "b" => format!("{:b}", n),
                "o" => format!("{:o}", n),
                "x" => format!("{:x}", n),
                _ => format!("{:X}", n),
            }
        }
        "e" => {
            let f = v
                .as_f64()
                .ok_or_else(|| value_error("'e' format requires a number"))?;
            format!("{:e}", f)
        }
        _ if spec.starts_with('.') && spec.ends_with('f') => {
            let digits: usize = spec[1..spec.len() - 1]
                .parse()
                .map_err(|_| value_error(format!("bad format spec '{}'", spec)))?;
            let f = v
                .as_f64()
                .ok_or_else(|| value_error("fixed format requires a number"))?;
            format!("{:.*}", digits, f)
        }
        _ => return Err(value_error(format!("unknown format spec '{}'", spec))),
    };
    Ok(heap.str(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_is_codepoints() {
        let heap = Heap::new();
        let ascii = heap.str("hello");
        let mixed = heap.str("héllo");
        assert_eq!(str_len(&heap, ascii).unwrap().expect_i64().unwrap(), 5);
        assert_eq!(str_len(&heap, mixed).unwrap().expect_i64().unwrap(), 5);
    }

    #[test]
    fn test_find_codepoint_offset_mixed() {
        let heap = Heap::new();
        // 'é' is two bytes; the codepoint offset of "llo" is 2.
        let h = heap.str("héllo");
        let n = heap.str("llo");
        assert_eq!(str_find(&heap, h, n).unwrap().expect_i64().unwrap(), 2);
        let missing = heap.str("zzz");
        assert_eq!(str_find(&heap, h, missing).unwrap().expect_i64().unwrap(), -1);
    }

    #[test]
    fn test_index_negative_and_bounds() {
        let heap = Heap::new();
        let s = heap.str("héllo");
        let last = str_index(&heap, s, heap.int(-1)).unwrap();
        assert_eq!(last.as_str().unwrap(), "o");
        let first = str_index(&heap, s, heap.int(1)).unwrap();
        assert_eq!(first.as_str().unwrap(), "é");
        let err = str_index(&heap, s, heap.int(5)).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Index);
    }

    #[test]
    fn test_split_and_replace() {
        let heap = Heap::new();
        let s = heap.str("a,b,,c");
        let sep = heap.str(",");
        let parts = str_split(&heap, s, sep).unwrap();
        if let Payload::List(items) = &parts.obj().unwrap().payload {
            let texts: Vec<&str> = items.borrow().iter().map(|v| v.as_str().unwrap()).collect();
            assert_eq!(texts, vec!["a", "b", "", "c"]);
        } else {
            panic!("expected list");
        }
        let empty_sep = heap.str("");
        assert!(str_split(&heap, s, empty_sep).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let heap = Heap::new();
        let s = heap.str("héllo");
        let b = str_encode(&heap, s).unwrap();
        let back = bytes_decode(&heap, b).unwrap();
        assert_eq!(back.as_str().unwrap(), "héllo");
        let bad = heap.bytes(vec![0xFF, 0xFE]);
        let err = bytes_decode(&heap, bad).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Value);
    }

    #[test]
    fn test_format_substitution() {
        let heap = Heap::new();
        let t = heap.str("{} + {} = {{{}}}");
        let args = heap.list(vec![heap.int(1), heap.int(2), heap.int(3)]);
        let out = str_format(&heap, t, args).unwrap();
        assert_eq!(out.as_str().unwrap(), "1 + 2 = {3}");

        let t2 = heap.str("{}");
        let too_many = heap.list(vec![heap.int(1), heap.int(2)]);
        assert!(str_format(&heap, t2, too_many).is_err());
    }

    #[test]
    fn test_num_format_specs() {
        let heap = Heap::new();
        let x = heap.int(255);
        assert_eq!(
            num_format(&heap, x, heap.str("x")).unwrap().as_str().unwrap(),
            "ff"
        );
        assert_eq!(
            num_format(&heap, Value::float(3.14159), heap.str(".2f"))
                .unwrap()
                .as_str()
                .unwrap(),
            "3.14"
        );
        assert!(num_format(&heap, x, heap.str("q")).is_err());
    }
}
