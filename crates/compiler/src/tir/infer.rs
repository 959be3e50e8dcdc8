//! Type and shape inference
//!
//! A global monotone fixed point over the lattice in [`super::types`].
//! Function summaries (parameter and return types) are context
//! insensitive: call sites join their argument types into the callee's
//! parameters, returns join into the summary, and the module iterates
//! until nothing widens. Transfer functions mirror runtime semantics
//! and widen toward `Dynamic` whenever no invariant proves the
//! specific case.
//!
//! Shape inference runs inside the same fixed point: a mapping built
//! with constant string keys gets a shape descriptor; writing a key
//! outside the shape, deleting, or escaping through a polymorphic sink
//! dissolves it. Dissolution is monotone (shapes only ever dissolve),
//! so iteration terminates.

use std::collections::{HashMap, HashSet};

use molt_core::Intrinsic;

use crate::ast::{BinOp, CmpOp};
use crate::diag::{CompileError, Stage};

use super::types::{join, ty_of_kind, Ty};
use super::{OpKind, TConst, Term, TirFunc, TirModule, ValueId};

type IResult<T> = Result<T, CompileError>;

/// Per-function summary used across the module fixed point.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSummary {
    pub params: Vec<Ty>,
    pub ret: Ty,
}

#[derive(Debug)]
pub struct Inference {
    pub summaries: Vec<FuncSummary>,
    /// Per-shape field types, parallel to `TirModule::shapes`.
    pub shape_field_tys: Vec<Vec<Ty>>,
    /// Dissolved shape descriptors (record layout no longer provable).
    pub dissolved: HashSet<u32>,
    /// Per-class field types, parallel to class field lists.
    pub class_field_tys: Vec<Vec<Ty>>,
}

/// Run inference over the whole module, mutating `value_tys` in place
/// and resolving method calls. `seeds` come from a Type Facts Artifact.
pub fn infer_module(
    module: &mut TirModule,
    seeds: &HashMap<String, FuncSummary>,
    strict: bool,
) -> IResult<Inference> {
    let mut inf = Inference {
        summaries: module
            .functions
            .iter()
            .map(|f| {
                let seeded = seeds.get(&f.name);
                FuncSummary {
                    params: match seeded {
                        Some(s) if s.params.len() == f.params.len() => s.params.clone(),
                        _ => vec![Ty::Never; f.params.len()],
                    },
                    ret: Ty::Never,
                }
            })
            .collect(),
        shape_field_tys: Vec::new(),
        dissolved: HashSet::new(),
        class_field_tys: module
            .classes
            .iter()
            .map(|c| vec![Ty::Never; c.fields.len()])
            .collect(),
    };

    // The module entry runs with no arguments; everything else gets its
    // parameter types from observed call sites (or the artifact seeds).
    // Functions never called keep Never params until the general pass
    // below widens them.
    for _round in 0..16 {
        let before = snapshot(&inf);
        for idx in 0..module.functions.len() {
            infer_function(module, idx, &mut inf)?;
        }
        if snapshot(&inf) == before {
            break;
        }
    }

    // General variants: anything still uncalled is typed all-dynamic,
    // the terminal fallback every deopt path can rely on.
    let mut widened = false;
    for (idx, summary) in inf.summaries.iter_mut().enumerate() {
        for p in summary.params.iter_mut() {
            if *p == Ty::Never {
                *p = Ty::Dynamic;
                widened = true;
            }
        }
        let _ = idx;
    }
    if widened {
        for _round in 0..16 {
            let before = snapshot(&inf);
            for idx in 0..module.functions.len() {
                infer_function(module, idx, &mut inf)?;
            }
            if snapshot(&inf) == before {
                break;
            }
        }
    }

    // Strict facts are assertions: an inferred summary outside the
    // declared one is a compile-time error.
    if strict {
        for (f, summary) in module.functions.iter().zip(&inf.summaries) {
            if let Some(declared) = seeds.get(&f.name) {
                if join(&summary.ret, &declared.ret) != declared.ret {
                    return Err(CompileError::at(
                        Stage::Infer,
                        f.span.clone(),
                        format!(
                            "{}: inferred return {:?} contradicts declared {:?}",
                            f.name, summary.ret, declared.ret
                        ),
                    ));
                }
                for (i, (inferred, decl)) in
                    summary.params.iter().zip(&declared.params).enumerate()
                {
                    if join(inferred, decl) != *decl {
                        return Err(CompileError::at(
                            Stage::Infer,
                            f.span.clone(),
                            format!(
                                "{}: parameter {} observed as {:?}, declared {:?}",
                                f.name, i, inferred, decl
                            ),
                        ));
                    }
                }
            }
        }
    }

    // Rewrite dissolved shapes out of the value types.
    if !inf.dissolved.is_empty() {
        for f in &mut module.functions {
            for ty in &mut f.value_tys {
                strip_dissolved(ty, &inf.dissolved);
            }
        }
    }

    Ok(inf)
}

fn snapshot(inf: &Inference) -> (Vec<FuncSummary>, usize, Vec<Vec<Ty>>, Vec<Vec<Ty>>) {
    (
        inf.summaries.clone(),
        inf.dissolved.len(),
        inf.shape_field_tys.clone(),
        inf.class_field_tys.clone(),
    )
}

fn strip_dissolved(ty: &mut Ty, dissolved: &HashSet<u32>) {
    match ty {
        Ty::Map { shape, key, value } => {
            if let Some(s) = shape {
                if dissolved.contains(s) {
                    *shape = None;
                }
            }
            strip_dissolved(key, dissolved);
            strip_dissolved(value, dissolved);
        }
        Ty::List(e) | Ty::Set(e) | Ty::Iter(e) => strip_dissolved(e, dissolved),
        Ty::Tuple(elems) => {
            for e in elems {
                strip_dissolved(e, dissolved);
            }
        }
        Ty::Union(members) => {
            for m in members {
                strip_dissolved(m, dissolved);
            }
        }
        _ => {}
    }
}

/// One local fixed point over a function's CFG.
pub fn infer_function(module: &mut TirModule, idx: usize, inf: &mut Inference) -> IResult<()> {
    // Entry parameters come from the summary ("module init" runs with
    // none and is its own entry).
    let is_entry = idx == module.entry;
    let param_tys: Vec<Ty> = if is_entry {
        Vec::new()
    } else {
        inf.summaries[idx].params.clone()
    };

    // Skip bodies nothing calls yet; their params are still Never.
    if !is_entry && param_tys.iter().any(|t| *t == Ty::Never) && !param_tys.is_empty() {
        return Ok(());
    }

    loop {
        let mut changed = false;
        // Seed entry block params.
        {
            let f = &mut module.functions[idx];
            let entry_params: Vec<ValueId> = f.blocks[f.entry as usize].params.clone();
            for (p, ty) in entry_params.iter().zip(param_tys.iter()) {
                changed |= widen(f, *p, ty.clone());
            }
        }
        // Straight passes over all blocks until stable; block order is
        // construction order, which is deterministic.
        for b in 0..module.functions[idx].blocks.len() {
            changed |= infer_block(module, idx, b, inf)?;
        }
        if !changed {
            break;
        }
    }
    Ok(())
}

fn widen(f: &mut TirFunc, v: ValueId, ty: Ty) -> bool {
    let cur = &f.value_tys[v as usize];
    let joined = join(cur, &ty);
    if joined != *cur {
        f.value_tys[v as usize] = joined;
        true
    } else {
        false
    }
}

fn const_str_of(f: &TirFunc, v: ValueId) -> Option<String> {
    for block in &f.blocks {
        for op in &block.ops {
            if op.dst == Some(v) {
                if let OpKind::Const(TConst::Str(s)) = &op.kind {
                    return Some(s.clone());
                }
                return None;
            }
        }
    }
    None
}

fn const_int_of(f: &TirFunc, v: ValueId) -> Option<i64> {
    for block in &f.blocks {
        for op in &block.ops {
            if op.dst == Some(v) {
                if let OpKind::Const(TConst::Int(n)) = &op.kind {
                    return Some(*n);
                }
                return None;
            }
        }
    }
    None
}

fn infer_block(
    module: &mut TirModule,
    fidx: usize,
    bidx: usize,
    inf: &mut Inference,
) -> IResult<bool> {
    let mut changed = false;

    // Work over op list by index to satisfy the borrow checker while we
    // also mutate summaries and the shape tables.
    let op_count = module.functions[fidx].blocks[bidx].ops.len();
    for oidx in 0..op_count {
        let (dst, kind) = {
            let op = &module.functions[fidx].blocks[bidx].ops[oidx];
            (op.dst, op.kind.clone())
        };
        let ty = transfer(module, fidx, &kind, inf)?;
        // Method resolution is part of the transfer; write back the
        // resolved target once known.
        if let OpKind::CallMethod { obj, name, args, resolved: None } = &kind {
            if let Some(r) = resolve_class_method(module, fidx, *obj, name) {
                // Join args into the method's parameter summary
                // (self = the receiver class).
                let (class, func) = r;
                let recv = Ty::Class(class);
                join_params(inf, func, std::iter::once(recv).chain(
                    args.iter().map(|a| module.functions[fidx].value_tys[*a as usize].clone()),
                ));
                if let OpKind::CallMethod { resolved, .. } =
                    &mut module.functions[fidx].blocks[bidx].ops[oidx].kind
                {
                    *resolved = Some(r);
                    changed = true;
                }
            }
        }
        if let Some(d) = dst {
            if let Some(ty) = ty {
                changed |= widen(&mut module.functions[fidx], d, ty);
            }
        }
    }

    // Terminator: propagate edge arguments and the return summary.
    let term = module.functions[fidx].blocks[bidx].term.clone();
    match &term {
        Term::Jump { to, args } => {
            changed |= propagate_edge(&mut module.functions[fidx], *to, args);
        }
        Term::Branch {
            then_to,
            then_args,
            else_to,
            else_args,
            ..
        } => {
            changed |= propagate_edge(&mut module.functions[fidx], *then_to, then_args);
            changed |= propagate_edge(&mut module.functions[fidx], *else_to, else_args);
        }
        Term::Return(v) => {
            let ty = module.functions[fidx].value_tys[*v as usize].clone();
            let joined = join(&inf.summaries[fidx].ret, &ty);
            if joined != inf.summaries[fidx].ret {
                inf.summaries[fidx].ret = joined;
                changed = true;
            }
        }
        Term::Yield { resume, .. } | Term::Await { resume, .. } => {
            // The resume parameter is whatever the scheduler sends;
            // nothing narrower than Dynamic is sound.
            let resume_params = module.functions[fidx].blocks[*resume as usize].params.clone();
            for p in resume_params {
                changed |= widen(&mut module.functions[fidx], p, Ty::Dynamic);
            }
        }
        Term::Raise(_) | Term::Unterminated => {}
    }
    // Handler entry parameter is always an error value.
    if let Some(h) = module.functions[fidx].blocks[bidx].handler {
        let hparams = module.functions[fidx].blocks[h as usize].params.clone();
        if let Some(err_param) = hparams.first() {
            changed |= widen(&mut module.functions[fidx], *err_param, Ty::Error);
        }
    }
    Ok(changed)
}

fn propagate_edge(f: &mut TirFunc, to: super::BlockId, args: &[ValueId]) -> bool {
    let params = f.blocks[to as usize].params.clone();
    let mut changed = false;
    for (p, a) in params.iter().zip(args.iter()) {
        let ty = f.value_tys[*a as usize].clone();
        changed |= widen(f, *p, ty);
    }
    changed
}

fn join_params(inf: &mut Inference, func: usize, tys: impl Iterator<Item = Ty>) {
    for (i, ty) in tys.enumerate() {
        if let Some(slot) = inf.summaries[func].params.get_mut(i) {
            *slot = join(slot, &ty);
        }
    }
}

fn resolve_class_method(
    module: &TirModule,
    fidx: usize,
    obj: ValueId,
    name: &str,
) -> Option<(u32, usize)> {
    let obj_ty = &module.functions[fidx].value_tys[obj as usize];
    if let Ty::Class(id) = obj_ty {
        let class = &module.classes[*id as usize];
        class
            .methods
            .iter()
            .find(|(m, _)| m == name)
            .map(|(_, func)| (*id, *func))
    } else {
        None
    }
}

/// Builtin container/string methods, resolved by receiver type.
pub fn builtin_method(recv: &Ty, name: &str) -> Option<Intrinsic> {
    match (recv, name) {
        (Ty::List(_), "append") => Some(Intrinsic::ListPush),
        (Ty::List(_), "pop") => Some(Intrinsic::ListPop),
        (Ty::Map { .. }, "keys") => Some(Intrinsic::MapKeys),
        (Ty::Set(_), "add") => Some(Intrinsic::SetAdd),
        (Ty::Str, "find") => Some(Intrinsic::StrFind),
        (Ty::Str, "split") => Some(Intrinsic::StrSplit),
        (Ty::Str, "replace") => Some(Intrinsic::StrReplace),
        (Ty::Str, "lower") => Some(Intrinsic::StrCasefold),
        (Ty::Str, "encode") => Some(Intrinsic::StrEncode),
        (Ty::Bytes, "decode") => Some(Intrinsic::BytesDecode),
        _ => None,
    }
}

/// The per-op transfer function. Returns the destination type (None
/// for void ops).
fn transfer(
    module: &mut TirModule,
    fidx: usize,
    kind: &OpKind,
    inf: &mut Inference,
) -> IResult<Option<Ty>> {
    let ty_of = |module: &TirModule, v: &ValueId| -> Ty {
        module.functions[fidx].value_tys[*v as usize].clone()
    };
    Ok(match kind {
        OpKind::Const(c) => Some(match c {
            TConst::Int(_) | TConst::BigInt(_) => Ty::Int,
            TConst::Float(_) => Ty::Float,
            TConst::Str(_) => Ty::Str,
            TConst::Bool(_) => Ty::Bool,
            TConst::None => Ty::Null,
        }),
        OpKind::Binary { op, l, r } => {
            let (lt, rt) = (ty_of(module, l), ty_of(module, r));
            Some(binary_result(*op, &lt, &rt))
        }
        OpKind::Compare { op, .. } => Some(match op {
            CmpOp::Eq | CmpOp::Ne | CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => Ty::Bool,
            CmpOp::In | CmpOp::NotIn => Ty::Bool,
        }),
        OpKind::Not(_) => Some(Ty::Bool),
        OpKind::Neg(v) => Some(match ty_of(module, v) {
            Ty::Int => Ty::Int,
            Ty::Float => Ty::Float,
            Ty::Bool => Ty::Int,
            Ty::Dynamic => Ty::Dynamic,
            _ => Ty::Dynamic,
        }),
        OpKind::MakeTuple(items) => Some(Ty::Tuple(
            items.iter().map(|v| ty_of(module, v)).collect(),
        )),
        OpKind::MakeList(items) => {
            let elem = items
                .iter()
                .map(|v| ty_of(module, v))
                .fold(Ty::Never, |a, b| join(&a, &b));
            Some(Ty::list(elem))
        }
        OpKind::MakeSet(items) => {
            let elem = items
                .iter()
                .map(|v| ty_of(module, v))
                .fold(Ty::Never, |a, b| join(&a, &b));
            Some(Ty::Set(Box::new(elem)))
        }
        OpKind::MakeMap { keys, values } => {
            // Record-shaped when every key is a constant string.
            let const_keys: Option<Vec<String>> = keys
                .iter()
                .map(|k| const_str_of(&module.functions[fidx], *k))
                .collect();
            match const_keys {
                Some(names) if !names.is_empty() => {
                    let shape = module.intern_shape(names.clone());
                    while inf.shape_field_tys.len() <= shape as usize {
                        inf.shape_field_tys.push(Vec::new());
                    }
                    let field_tys: Vec<Ty> =
                        values.iter().map(|v| ty_of(module, v)).collect();
                    let slot = &mut inf.shape_field_tys[shape as usize];
                    if slot.is_empty() {
                        *slot = field_tys.clone();
                    } else {
                        for (s, t) in slot.iter_mut().zip(&field_tys) {
                            *s = join(s, t);
                        }
                    }
                    let value = field_tys.iter().fold(Ty::Never, |a, b| join(&a, b));
                    Some(Ty::map(Ty::Str, value, Some(shape)))
                }
                _ => {
                    let key = keys
                        .iter()
                        .map(|v| ty_of(module, v))
                        .fold(Ty::Never, |a, b| join(&a, &b));
                    let value = values
                        .iter()
                        .map(|v| ty_of(module, v))
                        .fold(Ty::Never, |a, b| join(&a, &b));
                    Some(Ty::map(key, value, None))
                }
            }
        }
        OpKind::GetItem { obj, index } => Some(match ty_of(module, obj) {
            Ty::List(e) => (*e).clone(),
            Ty::Tuple(elems) => match const_int_of(&module.functions[fidx], *index) {
                Some(i) if (i as usize) < elems.len() && i >= 0 => elems[i as usize].clone(),
                _ => elems.iter().fold(Ty::Never, |a, b| join(&a, b)),
            },
            Ty::Map { value, shape, .. } => match shape {
                Some(s) if !inf.dissolved.contains(&s) => {
                    match const_str_of(&module.functions[fidx], *index)
                        .and_then(|k| module.shapes[s as usize].iter().position(|f| *f == k))
                    {
                        Some(field) => inf
                            .shape_field_tys
                            .get(s as usize)
                            .and_then(|tys| tys.get(field))
                            .cloned()
                            .unwrap_or(Ty::Dynamic),
                        // Key outside (or not constant): the record
                        // layout is no longer provable.
                        None => {
                            inf.dissolved.insert(s);
                            (*value).clone()
                        }
                    }
                }
                _ => (*value).clone(),
            },
            Ty::Str => Ty::Str,
            Ty::Bytes => Ty::Int,
            _ => Ty::Dynamic,
        }),
        OpKind::SetItem { obj, index, value } => {
            if let Ty::Map { shape: Some(s), .. } = ty_of(module, obj) {
                if !inf.dissolved.contains(&s) {
                    match const_str_of(&module.functions[fidx], *index)
                        .and_then(|k| module.shapes[s as usize].iter().position(|f| *f == k))
                    {
                        Some(field) => {
                            let vt = ty_of(module, value);
                            while inf.shape_field_tys.len() <= s as usize {
                                inf.shape_field_tys.push(Vec::new());
                            }
                            let slot = &mut inf.shape_field_tys[s as usize];
                            if let Some(t) = slot.get_mut(field) {
                                *t = join(t, &vt);
                            }
                        }
                        None => {
                            inf.dissolved.insert(s);
                        }
                    }
                }
            }
            None
        }
        OpKind::GetAttr { obj, name } => {
            let obj_ty = ty_of(module, obj);
            match obj_ty {
                Ty::Class(id) => {
                    let class = &module.classes[id as usize];
                    match class.fields.iter().position(|f| f == name) {
                        Some(field) => Some(
                            inf.class_field_tys[id as usize]
                                .get(field)
                                .cloned()
                                .unwrap_or(Ty::Dynamic),
                        ),
                        None => {
                            // Unknown field but maybe a bound method
                            // reference; treat as callable.
                            match class.methods.iter().find(|(m, _)| m == name) {
                                Some((_, func)) => Some(Ty::Callable {
                                    target: Some(*func),
                                }),
                                None => Some(Ty::Dynamic),
                            }
                        }
                    }
                }
                _ => Some(Ty::Dynamic),
            }
        }
        OpKind::SetAttr { obj, name, value } => {
            if let Ty::Class(id) = ty_of(module, obj) {
                let class = &module.classes[id as usize];
                if let Some(field) = class.fields.iter().position(|f| f == name) {
                    let vt = ty_of(module, value);
                    let slot = &mut inf.class_field_tys[id as usize][field];
                    *slot = join(slot, &vt);
                }
            }
            None
        }
        OpKind::SeqLen(_) => Some(Ty::Int),
        OpKind::Call { func, args, .. } => {
            join_params(
                inf,
                *func,
                args.iter().map(|a| ty_of(module, a)),
            );
            Some(inf.summaries[*func].ret.clone())
        }
        OpKind::CallValue { callee, args } => match ty_of(module, callee) {
            Ty::Callable {
                target: Some(func),
            } => {
                join_params(inf, func, args.iter().map(|a| ty_of(module, a)));
                Some(inf.summaries[func].ret.clone())
            }
            _ => Some(Ty::Dynamic),
        },
        OpKind::CallMethod {
            obj,
            name,
            resolved,
            ..
        } => {
            if let Some((_, func)) = resolved {
                Some(inf.summaries[*func].ret.clone())
            } else {
                let recv = ty_of(module, obj);
                match builtin_method(&recv, name) {
                    Some(intr) => Some(ty_of_kind(intr.def().result)),
                    None => Some(Ty::Dynamic),
                }
            }
        }
        OpKind::MakeInstance { class, args } => {
            // Constructor calls __init__ with self first.
            let init = module.classes[*class as usize]
                .methods
                .iter()
                .find(|(m, _)| m == "__init__")
                .map(|(_, f)| *f);
            if let Some(init) = init {
                join_params(
                    inf,
                    init,
                    std::iter::once(Ty::Class(*class))
                        .chain(args.iter().map(|a| ty_of(module, a))),
                );
            }
            Some(Ty::Class(*class))
        }
        OpKind::Intrinsic { id, args } => Some(intrinsic_result(module, fidx, *id, args)),
        OpKind::FuncRef(func) => Some(Ty::Callable {
            target: Some(*func),
        }),
        OpKind::IterNew(v) => Some(match ty_of(module, v) {
            Ty::List(e) => Ty::Iter(e),
            Ty::Set(e) => Ty::Iter(e),
            Ty::Str => Ty::Iter(Box::new(Ty::Str)),
            Ty::Tuple(elems) => {
                Ty::Iter(Box::new(elems.iter().fold(Ty::Never, |a, b| join(&a, b))))
            }
            Ty::Map { key, .. } => Ty::Iter(key),
            _ => Ty::Iter(Box::new(Ty::Dynamic)),
        }),
        OpKind::IterNext(v) => Some(match ty_of(module, v) {
            Ty::Iter(e) => Ty::Tuple(vec![join(&e, &Ty::Null), Ty::Bool]),
            _ => Ty::Tuple(vec![Ty::Dynamic, Ty::Bool]),
        }),
        OpKind::ErrIsA { .. } => Some(Ty::Bool),
        OpKind::SetErrCause { .. } => Some(Ty::Error),
    })
}

fn binary_result(op: BinOp, l: &Ty, r: &Ty) -> Ty {
    use BinOp::*;
    match (op, l, r) {
        (_, Ty::Dynamic, _) | (_, _, Ty::Dynamic) => Ty::Dynamic,
        (Div, a, b) if a.is_numeric() && b.is_numeric() => Ty::Float,
        (_, Ty::Int, Ty::Int) | (_, Ty::Bool, Ty::Int) | (_, Ty::Int, Ty::Bool) => Ty::Int,
        (_, Ty::Float, b) if b.is_numeric() => Ty::Float,
        (_, a, Ty::Float) if a.is_numeric() => Ty::Float,
        (Add, Ty::Str, Ty::Str) => Ty::Str,
        (Add, Ty::List(a), Ty::List(b)) => Ty::list(join(a, b)),
        (Mod, Ty::Str, _) => Ty::Str,
        _ => Ty::Dynamic,
    }
}

fn intrinsic_result(
    module: &TirModule,
    fidx: usize,
    id: Intrinsic,
    args: &[ValueId],
) -> Ty {
    let ty_of = |v: &ValueId| module.functions[fidx].value_tys[*v as usize].clone();
    match id {
        // Structure-aware results.
        Intrinsic::TupleGet => match args.first().map(ty_of) {
            Some(Ty::Tuple(elems)) => {
                match args.get(1).and_then(|v| const_int_of(&module.functions[fidx], *v)) {
                    Some(i) if i >= 0 && (i as usize) < elems.len() => elems[i as usize].clone(),
                    _ => elems.iter().fold(Ty::Never, |a, b| join(&a, b)),
                }
            }
            _ => Ty::Dynamic,
        },
        Intrinsic::ListGet => match args.first().map(ty_of) {
            Some(Ty::List(e)) => (*e).clone(),
            _ => Ty::Dynamic,
        },
        Intrinsic::ChanRecv | Intrinsic::TaskJoin => Ty::Dynamic,
        Intrinsic::ChanTryRecv => Ty::Tuple(vec![Ty::Dynamic, Ty::Bool]),
        _ => ty_of_kind(id.def().result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::lower_module;
    use crate::parser::parse;
    use crate::tir::build::build_module;

    fn infer(src: &str) -> (TirModule, Inference) {
        let ast = parse(src, "test.mt", "test").expect("parse");
        let hir = lower_module(&ast).expect("lower");
        let mut tir = build_module(&hir).expect("build");
        let inf = infer_module(&mut tir, &HashMap::new(), false).expect("infer");
        (tir, inf)
    }

    fn func<'a>(t: &'a TirModule, name: &str) -> &'a TirFunc {
        t.functions
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("function {} not found", name))
    }

    #[test]
    fn test_int_arithmetic_stays_int() {
        let (t, inf) = infer("def f(a, b):\n    return a + b\n\nx = f(1, 2)\n");
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        assert_eq!(inf.summaries[fi].params, vec![Ty::Int, Ty::Int]);
        assert_eq!(inf.summaries[fi].ret, Ty::Int);
    }

    #[test]
    fn test_mixed_call_sites_widen_to_union() {
        let (t, inf) = infer("def f(a):\n    return a\n\nx = f(1)\ny = f(\"s\")\n");
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        assert!(matches!(inf.summaries[fi].params[0], Ty::Union(_)));
        assert!(matches!(inf.summaries[fi].ret, Ty::Union(_)));
    }

    #[test]
    fn test_true_division_is_float() {
        let (t, inf) = infer("def f(a, b):\n    return a / b\n\nx = f(1, 2)\n");
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        assert_eq!(inf.summaries[fi].ret, Ty::Float);
    }

    #[test]
    fn test_literal_map_gets_shape() {
        let (t, _inf) = infer("def f():\n    return {\"x\": 1, \"y\": 2}\n\nm = f()\n");
        assert_eq!(t.shapes.len(), 1);
        assert_eq!(t.shapes[0], vec!["x", "y"]);
        let f = func(&t, "test.f");
        let shaped = f
            .value_tys
            .iter()
            .any(|ty| matches!(ty, Ty::Map { shape: Some(_), .. }));
        assert!(shaped);
    }

    #[test]
    fn test_shaped_read_returns_field_type() {
        let (t, inf) = infer(
            "def f(p):\n    return p[\"x\"] + p[\"y\"]\n\nr = f({\"x\": 1, \"y\": 2})\n",
        );
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        assert_eq!(inf.summaries[fi].ret, Ty::Int);
        assert!(inf.dissolved.is_empty());
    }

    #[test]
    fn test_nonconst_key_write_dissolves_shape() {
        let (_t, inf) = infer(
            "def f(p, k):\n    p[k] = 3\n    return p\n\nr = f({\"x\": 1}, \"z\")\n",
        );
        assert_eq!(inf.dissolved.len(), 1);
    }

    #[test]
    fn test_class_fields_typed() {
        let (t, inf) = infer(
            "class P:\n    def __init__(self, x):\n        self.x = x\n    def get(self):\n        return self.x\n\np = P(3)\nv = p.get()\n",
        );
        let gi = t
            .functions
            .iter()
            .position(|f| f.name.ends_with("P.get"))
            .unwrap();
        assert_eq!(inf.summaries[gi].ret, Ty::Int);
        // The method call resolved statically.
        let init = func(&t, "test.__init__");
        let resolved = init
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op.kind, OpKind::CallMethod { resolved: Some(_), .. }));
        assert!(resolved);
    }

    #[test]
    fn test_uncalled_function_becomes_general_variant() {
        let (t, inf) = infer("def f(a):\n    return a\n");
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        assert_eq!(inf.summaries[fi].params, vec![Ty::Dynamic]);
    }

    #[test]
    fn test_strict_facts_mismatch_errors() {
        let ast = parse("def f(a):\n    return a\n\nx = f(\"s\")\n", "t.mt", "t").unwrap();
        let hir = lower_module(&ast).unwrap();
        let mut tir = build_module(&hir).unwrap();
        let mut seeds = HashMap::new();
        seeds.insert(
            "t.f".to_string(),
            FuncSummary {
                params: vec![Ty::Int],
                ret: Ty::Int,
            },
        );
        let err = infer_module(&mut tir, &seeds, true).unwrap_err();
        assert!(err.message.contains("parameter") || err.message.contains("return"));
    }
}
