//! Deterministic hashing
//!
//! Two distinct concerns share this module:
//!
//! - **Value hashing**: seeded FNV-1a over tag-prefixed bytes. With seed 0
//!   (the deterministic default) the same value always hashes to the same
//!   word across processes; a nonzero seed perturbs per-process hashing
//!   without changing equality.
//! - **Symbol identity**: `sha256(path:line:col:expr)`, the stable name
//!   hash carried by every symbol in the module graph.
//!
//! An integral float must hash equal to the equal integer, so `hash_float`
//! delegates to `hash_int` when the value is exactly representable.

use sha2::{Digest, Sha256};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Tag bytes prefixed so values of different types never collide by
/// construction (e.g. `0` vs `"0"`).
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum HashTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Str = 4,
    Bytes = 5,
    Tuple = 6,
    Handle = 7,
}

/// Streaming FNV-1a seeded hasher.
#[derive(Debug, Clone)]
pub struct SeededHasher {
    state: u64,
}

impl SeededHasher {
    pub fn new(seed: u64) -> Self {
        // Mix the seed through one round so seed 1 and 2 diverge fully.
        let mut state = FNV_OFFSET;
        for b in seed.to_le_bytes() {
            state ^= b as u64;
            state = state.wrapping_mul(FNV_PRIME);
        }
        SeededHasher { state }
    }

    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= b as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline]
    pub fn write_tag(&mut self, tag: HashTag) {
        self.write(&[tag as u8]);
    }

    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.state
    }
}

/// One-shot hash of a byte string under a seed.
pub fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Bytes);
    h.write(bytes);
    h.finish()
}

/// One-shot hash of a string under a seed.
pub fn hash_str(seed: u64, s: &str) -> u64 {
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Str);
    h.write(s.as_bytes());
    h.finish()
}

/// Hash a machine integer.
pub fn hash_int(seed: u64, n: i64) -> u64 {
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Int);
    h.write_u64(n as u64);
    h.finish()
}

/// Hash the sign and little-endian magnitude of a big integer. The caller
/// passes the canonical (no leading zero limb) form so equal values hash
/// equal regardless of how they were computed.
pub fn hash_big_int(seed: u64, negative: bool, magnitude_le: &[u8]) -> u64 {
    // Small-representable magnitudes must match hash_int.
    if magnitude_le.len() <= 8 {
        let mut buf = [0u8; 8];
        buf[..magnitude_le.len()].copy_from_slice(magnitude_le);
        let mag = u64::from_le_bytes(buf);
        if mag <= i64::MAX as u64 {
            let n = if negative { -(mag as i64) } else { mag as i64 };
            return hash_int(seed, n);
        }
    }
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Int);
    h.write(&[negative as u8]);
    h.write(magnitude_le);
    h.finish()
}

/// Hash a float. Integral values hash as the equal integer; -0.0 hashes
/// as 0; all NaNs hash alike.
pub fn hash_float(seed: u64, f: f64) -> u64 {
    if f == 0.0 {
        return hash_int(seed, 0);
    }
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        return hash_int(seed, f as i64);
    }
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Float);
    let bits = if f.is_nan() {
        crate::nanbox::CANONICAL_NAN
    } else {
        f.to_bits()
    };
    h.write_u64(bits);
    h.finish()
}

/// Hash a boolean.
pub fn hash_bool(seed: u64, b: bool) -> u64 {
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Bool);
    h.write(&[b as u8]);
    h.finish()
}

/// Hash the null singleton.
pub fn hash_null(seed: u64) -> u64 {
    let mut h = SeededHasher::new(seed);
    h.write_tag(HashTag::Null);
    h.finish()
}

/// Stable symbol identity: hex `sha256("{path}:{line}:{col}:{expr}")`.
pub fn symbol_identity(path: &str, line: u32, col: u32, expr: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(line.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(col.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(expr.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_under_fixed_seed() {
        assert_eq!(hash_str(0, "hello"), hash_str(0, "hello"));
        assert_eq!(hash_int(7, 42), hash_int(7, 42));
    }

    #[test]
    fn test_seed_perturbs() {
        assert_ne!(hash_str(0, "hello"), hash_str(1, "hello"));
        assert_ne!(hash_str(1, "hello"), hash_str(2, "hello"));
    }

    #[test]
    fn test_type_tags_separate() {
        // "0" as a string must not collide with 0 as an int.
        assert_ne!(hash_str(0, "0"), hash_int(0, 0));
        assert_ne!(hash_bytes(0, b"a"), hash_str(0, "a"));
    }

    #[test]
    fn test_integral_float_equals_int() {
        assert_eq!(hash_float(0, 3.0), hash_int(0, 3));
        assert_eq!(hash_float(0, -0.0), hash_int(0, 0));
        assert_ne!(hash_float(0, 3.5), hash_int(0, 3));
    }

    #[test]
    fn test_nans_hash_alike() {
        let a = hash_float(0, f64::NAN);
        let b = hash_float(0, -f64::NAN);
        assert_eq!(a, b);
    }

    #[test]
    fn test_big_int_small_form_agrees() {
        // 42 as a bigint magnitude must hash like the small int 42.
        assert_eq!(hash_big_int(0, false, &[42]), hash_int(0, 42));
        assert_eq!(hash_big_int(0, true, &[42]), hash_int(0, -42));
    }

    #[test]
    fn test_symbol_identity_stable() {
        let a = symbol_identity("pkg/mod.mt", 10, 4, "def f");
        let b = symbol_identity("pkg/mod.mt", 10, 4, "def f");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, symbol_identity("pkg/mod.mt", 10, 5, "def f"));
    }
}
