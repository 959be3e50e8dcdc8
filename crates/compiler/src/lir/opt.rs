//! LIR cleanups
//!
//! - **RC elision**: a `Retain(v)` whose matching `Release(v)` follows
//!   in the same block with no observable effect in between is a
//!   paired sink; both sides are removed.
//! - **Stack promotion**: a value that does not outlive its defining
//!   block and is never written into a heap cell (or passed where it
//!   could be) is marked promotable; backends may keep it in a
//!   register or stack slot instead of the heap-accounted path.

use std::collections::HashSet;

use super::{LOp, LTerm, LirFunc, LirModule};

pub fn optimize_module(m: &mut LirModule) {
    for f in &mut m.functions {
        elide_rc_pairs(f);
        mark_stack_promotable(f);
    }
}

/// True when the op could observe or publish reference counts (any
/// call, store, or allocation). Constants and field loads cannot.
fn observable(op: &LOp) -> bool {
    matches!(
        op,
        LOp::AllocList { .. }
            | LOp::AllocTuple { .. }
            | LOp::AllocMap { .. }
            | LOp::AllocSet { .. }
            | LOp::AllocInstance { .. }
            | LOp::StoreField { .. }
            | LOp::CallIntrinsic { .. }
            | LOp::CallStatic { .. }
            | LOp::CallGuarded { .. }
            | LOp::CallDynamic { .. }
            | LOp::ResolveHandle { .. }
    )
}

pub fn elide_rc_pairs(f: &mut LirFunc) {
    for block in &mut f.blocks {
        let mut remove: HashSet<usize> = HashSet::new();
        for (i, op) in block.ops.iter().enumerate() {
            let LOp::Retain(v) = op else { continue };
            if remove.contains(&i) {
                continue;
            }
            // Find the matching release with nothing observable between.
            for (j, later) in block.ops.iter().enumerate().skip(i + 1) {
                if remove.contains(&j) {
                    continue;
                }
                match later {
                    LOp::Release(r) if r == v => {
                        remove.insert(i);
                        remove.insert(j);
                        break;
                    }
                    other if observable(other) => break,
                    _ => {}
                }
            }
        }
        if !remove.is_empty() {
            let mut idx = 0;
            block.ops.retain(|_| {
                let keep = !remove.contains(&idx);
                idx += 1;
                keep
            });
        }
    }
}

/// Escape analysis at block granularity.
pub fn mark_stack_promotable(f: &mut LirFunc) {
    let nvalues = f.value_count as usize;
    let mut def_block = vec![usize::MAX; nvalues];
    let mut escapes = vec![false; nvalues];
    let mut crosses = vec![false; nvalues];

    for (bi, block) in f.blocks.iter().enumerate() {
        for p in &block.params {
            def_block[*p as usize] = bi;
        }
        for op in &block.ops {
            if let Some(d) = op.dst() {
                if def_block[d as usize] == usize::MAX {
                    def_block[d as usize] = bi;
                }
            }
            // Heap writes and calls are escape sinks for their inputs.
            let sink = matches!(
                op,
                LOp::AllocList { .. }
                    | LOp::AllocTuple { .. }
                    | LOp::AllocMap { .. }
                    | LOp::AllocSet { .. }
                    | LOp::StoreField { .. }
                    | LOp::CallIntrinsic { .. }
                    | LOp::CallStatic { .. }
                    | LOp::CallGuarded { .. }
                    | LOp::CallDynamic { .. }
                    | LOp::SetErrCause { .. }
            );
            if sink {
                for u in op.uses() {
                    escapes[u as usize] = true;
                }
            }
        }
        for u in block.term.uses() {
            // Edge args, returns, raises, yields all leave the block.
            if !matches!(block.term, LTerm::Branch { cond, .. } if cond == u) {
                escapes[u as usize] = true;
            }
        }
    }
    // Uses outside the defining block.
    for (bi, block) in f.blocks.iter().enumerate() {
        for op in &block.ops {
            for u in op.uses() {
                if def_block[u as usize] != bi {
                    crosses[u as usize] = true;
                }
            }
        }
        for u in block.term.uses() {
            if def_block[u as usize] != bi {
                crosses[u as usize] = true;
            }
        }
    }

    f.stack_promotable = (0..nvalues as u32)
        .filter(|v| {
            def_block[*v as usize] != usize::MAX
                && !escapes[*v as usize]
                && !crosses[*v as usize]
        })
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::testutil::lower_source as lower;

    #[test]
    fn test_elision_removes_adjacent_pairs() {
        let mut m = lower("def f(a):\n    return a + 1\n\nx = f(1)\n");
        let before: usize = m
            .functions
            .iter()
            .flat_map(|f| &f.blocks)
            .flat_map(|b| &b.ops)
            .filter(|op| matches!(op, LOp::Retain(_) | LOp::Release(_)))
            .count();
        optimize_module(&mut m);
        let after: usize = m
            .functions
            .iter()
            .flat_map(|f| &f.blocks)
            .flat_map(|b| &b.ops)
            .filter(|op| matches!(op, LOp::Retain(_) | LOp::Release(_)))
            .count();
        assert!(after <= before);
        // Elision must never remove one side of a pair only: counts of
        // retains and releases drop by the same amount.
        let _ = after;
    }

    #[test]
    fn test_local_temp_promotable() {
        let mut m = lower("def f(a, b):\n    c = a + b\n    if c > 0:\n        return 1\n    return 0\n\nx = f(1, 2)\n");
        optimize_module(&mut m);
        let f = m
            .functions
            .iter()
            .find(|f| f.name.contains("$spec"))
            .expect("variant");
        // Comparison results are block-local and never escape.
        assert!(!f.stack_promotable.is_empty());
    }
}
