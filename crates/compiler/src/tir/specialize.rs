//! Specialization and dispatch selection
//!
//! For every direct call site the inference recorded an argument type
//! tuple. A concrete tuple observed at enough sites (or the only tuple
//! a function ever sees) gets a monomorphized variant: a clone of the
//! function re-inferred under the pinned parameter types. The general
//! (all-dynamic) body always remains as the deopt target.
//!
//! Call sites then classify as:
//! - **Static**: unique known target, concrete arguments; calls the
//!   matching variant directly when one exists.
//! - **Guarded**: one argument is a small union of concrete types and a
//!   variant matches one member; a runtime guard dispatches, and a
//!   frame descriptor records how to deopt to the general path.
//! - **Dynamic**: no useful prediction; full runtime dispatch through
//!   the call-site cache.

use std::collections::HashMap;

use crate::diag::CompileError;

use super::infer::{infer_function, FuncSummary, Inference};
use super::types::Ty;
use super::{Dispatch, FrameDescriptor, OpKind, TirModule};

/// A concrete tuple must appear at this many direct call sites to earn
/// a variant (a function's sole observed tuple always qualifies).
pub const SPECIALIZE_THRESHOLD: usize = 2;

#[derive(Debug, Default)]
pub struct SpecTable {
    /// base function index -> (argument tuple, variant index)
    pub variants: HashMap<usize, Vec<(Vec<Ty>, usize)>>,
}

impl SpecTable {
    pub fn variant_for(&self, func: usize, args: &[Ty]) -> Option<usize> {
        self.variants
            .get(&func)?
            .iter()
            .find(|(tuple, _)| tuple == args)
            .map(|(_, v)| *v)
    }
}

pub fn specialize_module(
    module: &mut TirModule,
    inf: &mut Inference,
) -> Result<SpecTable, CompileError> {
    // 1. Gather observed concrete argument tuples per direct callee.
    let mut observed: HashMap<usize, Vec<Vec<Ty>>> = HashMap::new();
    for f in &module.functions {
        for block in &f.blocks {
            for op in &block.ops {
                if let OpKind::Call { func, args, .. } = &op.kind {
                    let tuple: Vec<Ty> = args
                        .iter()
                        .map(|a| f.value_tys[*a as usize].clone())
                        .collect();
                    if !tuple.is_empty() && tuple.iter().all(|t| t.is_concrete()) {
                        observed.entry(*func).or_default().push(tuple);
                    }
                }
            }
        }
    }

    // 2. Create variants above the threshold. Iteration order is by
    //    function index so variant numbering is deterministic.
    let mut table = SpecTable::default();
    let mut callees: Vec<usize> = observed.keys().copied().collect();
    callees.sort_unstable();
    for callee in callees {
        let tuples = &observed[&callee];
        let mut distinct: Vec<(Vec<Ty>, usize)> = Vec::new();
        for t in tuples {
            match distinct.iter_mut().find(|(d, _)| d == t) {
                Some((_, n)) => *n += 1,
                None => distinct.push((t.clone(), 1)),
            }
        }
        let sole = distinct.len() == 1;
        for (tuple, count) in distinct {
            if count >= SPECIALIZE_THRESHOLD || sole {
                let variant_idx = module.functions.len();
                let mut variant = module.functions[callee].clone();
                variant.name = format!(
                    "{}$spec{}",
                    variant.name,
                    table.variants.get(&callee).map(|v| v.len()).unwrap_or(0)
                );
                module.functions.push(variant);
                inf.summaries.push(FuncSummary {
                    params: tuple.clone(),
                    ret: Ty::Never,
                });
                infer_function(module, variant_idx, inf)?;
                table
                    .variants
                    .entry(callee)
                    .or_default()
                    .push((tuple, variant_idx));
            }
        }
    }

    // 3. Classify every direct call site.
    for fidx in 0..module.functions.len() {
        for bidx in 0..module.functions[fidx].blocks.len() {
            for oidx in 0..module.functions[fidx].blocks[bidx].ops.len() {
                let (callee, tuple, span) = {
                    let op = &module.functions[fidx].blocks[bidx].ops[oidx];
                    match &op.kind {
                        OpKind::Call { func, args, .. } => {
                            let f = &module.functions[fidx];
                            (
                                *func,
                                args.iter()
                                    .map(|a| f.value_tys[*a as usize].clone())
                                    .collect::<Vec<_>>(),
                                op.span.clone(),
                            )
                        }
                        _ => continue,
                    }
                };
                let dispatch = if tuple.iter().all(|t| t.is_concrete()) {
                    Dispatch::Static {
                        variant: table.variant_for(callee, &tuple),
                    }
                } else if let Some((guard_pos, members)) = single_union_arg(&tuple) {
                    // A guard on the union argument can reach a
                    // variant for one of its members.
                    let mut choice = None;
                    for member in &members {
                        let mut guessed = tuple.clone();
                        guessed[guard_pos] = member.clone();
                        if let Some(v) = table.variant_for(callee, &guessed) {
                            choice = Some(v);
                            break;
                        }
                    }
                    match choice {
                        Some(variant) => {
                            let frame_idx = {
                                let f = &mut module.functions[fidx];
                                f.frames.push(FrameDescriptor {
                                    function: f.name.clone(),
                                    file: module.file.clone(),
                                    line: span.line,
                                    locals: f.param_names.clone(),
                                });
                                f.frames.len() - 1
                            };
                            Dispatch::Guarded {
                                variant,
                                frame: frame_idx,
                            }
                        }
                        None => Dispatch::Dynamic,
                    }
                } else {
                    Dispatch::Dynamic
                };
                if let OpKind::Call {
                    dispatch: slot, ..
                } = &mut module.functions[fidx].blocks[bidx].ops[oidx].kind
                {
                    *slot = dispatch;
                }
            }
        }
    }
    Ok(table)
}

/// A tuple with exactly one small-union member and everything else
/// concrete; returns its position and members.
fn single_union_arg(tuple: &[Ty]) -> Option<(usize, Vec<Ty>)> {
    let mut found = None;
    for (i, t) in tuple.iter().enumerate() {
        match t {
            Ty::Union(members) if members.iter().all(|m| m.is_concrete()) => {
                if found.is_some() {
                    return None;
                }
                found = Some((i, members.clone()));
            }
            t if t.is_concrete() => {}
            _ => return None,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::lower_module;
    use crate::parser::parse;
    use crate::tir::build::build_module;
    use crate::tir::infer::infer_module;
    use std::collections::HashMap as Map;

    fn run(src: &str) -> (TirModule, Inference, SpecTable) {
        let ast = parse(src, "test.mt", "test").expect("parse");
        let hir = lower_module(&ast).expect("lower");
        let mut tir = build_module(&hir).expect("build");
        let mut inf = infer_module(&mut tir, &Map::new(), false).expect("infer");
        let table = specialize_module(&mut tir, &mut inf).expect("specialize");
        (tir, inf, table)
    }

    #[test]
    fn test_repeated_tuple_creates_variant() {
        let (t, inf, table) = run(
            "def f(a, b):\n    return a + b\n\nx = f(1, 2)\ny = f(3, 4)\n",
        );
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        let variants = &table.variants[&fi];
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].0, vec![Ty::Int, Ty::Int]);
        let vi = variants[0].1;
        assert!(t.functions[vi].name.contains("$spec"));
        assert_eq!(inf.summaries[vi].ret, Ty::Int);
    }

    #[test]
    fn test_sole_tuple_specializes_below_threshold() {
        let (t, _inf, table) = run("def f(a):\n    return a + 1\n\nx = f(41)\n");
        let fi = t.functions.iter().position(|f| f.name == "test.f").unwrap();
        assert!(table.variant_for(fi, &[Ty::Int]).is_some());
    }

    #[test]
    fn test_static_dispatch_selected() {
        let (t, _inf, _table) = run("def f(a):\n    return a\n\nx = f(1)\ny = f(2)\n");
        let init = t
            .functions
            .iter()
            .find(|f| f.name == "test.__init__")
            .unwrap();
        let statics = init
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .filter(|op| {
                matches!(
                    op.kind,
                    OpKind::Call {
                        dispatch: Dispatch::Static { variant: Some(_) },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(statics, 2);
    }

    #[test]
    fn test_union_argument_gets_guard_with_frame() {
        let (t, _inf, _table) = run(
            "def id(a):\n    return a\n\ndef pick(c):\n    if c:\n        v = 1\n    else:\n        v = 2.5\n    return id(v)\n\nx = pick(True)\ny = id(7)\nz = id(8)\n",
        );
        let pick = t
            .functions
            .iter()
            .find(|f| f.name == "test.pick")
            .unwrap();
        let guarded = pick
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op.kind, OpKind::Call { dispatch: Dispatch::Guarded { .. }, .. }));
        assert!(guarded);
        // The guard recorded a frame descriptor to deopt through.
        assert!(!pick.frames.is_empty());
    }

    #[test]
    fn test_dynamic_when_no_prediction() {
        let (t, _inf, _table) = run(
            "def id(a):\n    return a\n\ndef call_with(v):\n    return id(v)\n\nx = id(1)\ny = id(2)\n",
        );
        // call_with's v is Dynamic (general variant), so its site
        // cannot be static.
        let cw = t
            .functions
            .iter()
            .find(|f| f.name == "test.call_with")
            .unwrap();
        let dynamic = cw
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op.kind, OpKind::Call { dispatch: Dispatch::Dynamic, .. }));
        assert!(dynamic);
    }
}
