//! The inference lattice
//!
//! `Never` (bottom) -> concrete types -> canonicalized unions ->
//! `Dynamic` (top). Joins are monotone: once a value widens it never
//! narrows, so the fixed-point iteration in `infer` terminates.
//!
//! Unions are canonical: flattened, sorted by a stable key, duplicates
//! removed. A union that would exceed [`MAX_UNION_WIDTH`] members folds
//! to `Dynamic`.

/// Union width beyond which inference gives up and widens.
pub const MAX_UNION_WIDTH: usize = 3;

/// Structural nesting beyond which joins widen to Dynamic. Keeps the
/// fixed point finite for programs that grow their own container
/// nesting (`x = [x]` in a loop).
pub const MAX_TYPE_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    /// Bottom: no value flows here (unreached code, empty joins).
    Never,
    Int,
    Float,
    Bool,
    Null,
    Str,
    Bytes,
    Tuple(Vec<Ty>),
    List(Box<Ty>),
    Map {
        key: Box<Ty>,
        value: Box<Ty>,
        /// Shape descriptor index for record-like mappings.
        shape: Option<u32>,
    },
    Set(Box<Ty>),
    /// Nominal class instance.
    Class(u32),
    /// Callable value; `target` is the known function index when the
    /// callee is a single known function.
    Callable { target: Option<usize> },
    Error,
    Task,
    Channel,
    Iter(Box<Ty>),
    Handle,
    Union(Vec<Ty>),
    /// Top: terminal fallback.
    Dynamic,
}

impl Ty {
    pub fn map(key: Ty, value: Ty, shape: Option<u32>) -> Ty {
        Ty::Map {
            key: Box::new(key),
            value: Box::new(value),
            shape,
        }
    }

    pub fn list(elem: Ty) -> Ty {
        Ty::List(Box::new(elem))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float | Ty::Bool)
    }

    /// A stable sort key for union canonicalization. Derived from the
    /// debug form, which is deterministic for this enum.
    fn sort_key(&self) -> String {
        format!("{:?}", self)
    }

    /// True when a value of this type is statically concrete (no union,
    /// no Dynamic anywhere at the top level).
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Ty::Union(_) | Ty::Dynamic | Ty::Never)
    }

    fn depth(&self) -> usize {
        match self {
            Ty::List(e) | Ty::Set(e) | Ty::Iter(e) => 1 + e.depth(),
            Ty::Map { key, value, .. } => 1 + key.depth().max(value.depth()),
            Ty::Tuple(elems) => 1 + elems.iter().map(Ty::depth).max().unwrap_or(0),
            Ty::Union(members) => 1 + members.iter().map(Ty::depth).max().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Canonicalize a member list into a type: flatten nested unions, sort,
/// dedupe, fold singletons, and widen past the width limit.
pub fn canonical_union(members: Vec<Ty>) -> Ty {
    let mut flat = Vec::new();
    let mut stack = members;
    while let Some(t) = stack.pop() {
        match t {
            Ty::Union(inner) => stack.extend(inner),
            Ty::Never => {}
            Ty::Dynamic => return Ty::Dynamic,
            other => flat.push(other),
        }
    }
    flat.sort_by_key(|t| t.sort_key());
    flat.dedup();
    match flat.len() {
        0 => Ty::Never,
        1 => flat.pop().expect("length checked"),
        n if n > MAX_UNION_WIDTH => Ty::Dynamic,
        _ => Ty::Union(flat),
    }
}

/// Lattice join. Conservative: structure merges where shapes agree,
/// widens to a union (then Dynamic) where they do not. Nesting past
/// [`MAX_TYPE_DEPTH`] widens so the fixed point stays finite.
pub fn join(a: &Ty, b: &Ty) -> Ty {
    if a == b {
        return a.clone();
    }
    if a.depth() > MAX_TYPE_DEPTH || b.depth() > MAX_TYPE_DEPTH {
        return Ty::Dynamic;
    }
    match (a, b) {
        (Ty::Never, t) | (t, Ty::Never) => t.clone(),
        (Ty::Dynamic, _) | (_, Ty::Dynamic) => Ty::Dynamic,
        (Ty::List(x), Ty::List(y)) => Ty::list(join(x, y)),
        (Ty::Set(x), Ty::Set(y)) => Ty::Set(Box::new(join(x, y))),
        (Ty::Iter(x), Ty::Iter(y)) => Ty::Iter(Box::new(join(x, y))),
        (Ty::Tuple(xs), Ty::Tuple(ys)) if xs.len() == ys.len() => {
            Ty::Tuple(xs.iter().zip(ys).map(|(x, y)| join(x, y)).collect())
        }
        (
            Ty::Map {
                key: k1,
                value: v1,
                shape: s1,
            },
            Ty::Map {
                key: k2,
                value: v2,
                shape: s2,
            },
        ) => {
            // Shapes must agree to survive a join; a merge of two
            // different record layouts dissolves to a dynamic map.
            let shape = if s1 == s2 { *s1 } else { None };
            Ty::map(join(k1, k2), join(v1, v2), shape)
        }
        (Ty::Callable { target: t1 }, Ty::Callable { target: t2 }) => Ty::Callable {
            target: if t1 == t2 { *t1 } else { None },
        },
        (x, y) => canonical_union(vec![x.clone(), y.clone()]),
    }
}

/// Map a signature-level [`molt_core::ValueKind`] into the lattice.
pub fn ty_of_kind(kind: molt_core::ValueKind) -> Ty {
    use molt_core::ValueKind as K;
    match kind {
        K::Any => Ty::Dynamic,
        K::Null => Ty::Null,
        K::Bool => Ty::Bool,
        K::Int => Ty::Int,
        K::Float => Ty::Float,
        K::Str => Ty::Str,
        K::Bytes => Ty::Bytes,
        K::List => Ty::list(Ty::Dynamic),
        K::Tuple => Ty::Dynamic,
        K::Map => Ty::map(Ty::Dynamic, Ty::Dynamic, None),
        K::Set => Ty::Set(Box::new(Ty::Dynamic)),
        K::Callable => Ty::Callable { target: None },
        K::Error => Ty::Error,
        K::Task => Ty::Task,
        K::Channel => Ty::Channel,
        K::Iter => Ty::Iter(Box::new(Ty::Dynamic)),
        K::Handle => Ty::Handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_identity_and_bottom() {
        assert_eq!(join(&Ty::Int, &Ty::Int), Ty::Int);
        assert_eq!(join(&Ty::Never, &Ty::Str), Ty::Str);
        assert_eq!(join(&Ty::Dynamic, &Ty::Int), Ty::Dynamic);
    }

    #[test]
    fn test_union_canonical() {
        let a = join(&Ty::Int, &Ty::Str);
        let b = join(&Ty::Str, &Ty::Int);
        // Order-independent canonical form.
        assert_eq!(a, b);
        assert!(matches!(a, Ty::Union(ref m) if m.len() == 2));
        // Duplicates collapse.
        assert_eq!(join(&a, &Ty::Int), a);
    }

    #[test]
    fn test_union_width_folds_to_dynamic() {
        let u = canonical_union(vec![Ty::Int, Ty::Str, Ty::Bool, Ty::Null]);
        assert_eq!(u, Ty::Dynamic);
    }

    #[test]
    fn test_list_join_merges_element() {
        let a = Ty::list(Ty::Int);
        let b = Ty::list(Ty::Str);
        match join(&a, &b) {
            Ty::List(elem) => assert!(matches!(*elem, Ty::Union(_))),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_shape_dissolves_on_mismatched_join() {
        let a = Ty::map(Ty::Str, Ty::Int, Some(0));
        let b = Ty::map(Ty::Str, Ty::Int, Some(1));
        match join(&a, &b) {
            Ty::Map { shape, .. } => assert_eq!(shape, None),
            other => panic!("expected map, got {:?}", other),
        }
        // Agreeing shapes survive.
        match join(&a, &a.clone()) {
            Ty::Map { shape, .. } => assert_eq!(shape, Some(0)),
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_join_lengths() {
        let a = Ty::Tuple(vec![Ty::Int, Ty::Int]);
        let b = Ty::Tuple(vec![Ty::Int, Ty::Str]);
        match join(&a, &b) {
            Ty::Tuple(elems) => assert!(matches!(elems[1], Ty::Union(_))),
            other => panic!("expected tuple, got {:?}", other),
        }
        let c = Ty::Tuple(vec![Ty::Int]);
        assert!(matches!(join(&a, &c), Ty::Union(_)));
    }
}
