//! Low-level IR
//!
//! LIR makes memory and ownership explicit: allocations, reference-count
//! adjustments, fixed-offset field loads/stores for shape-stable
//! records and instances, handle resolution, and classified call forms.
//!
//! ## Ownership model
//!
//! Every owning definition (allocation, intrinsic result, call result)
//! carries exactly one reference. Lowering inserts a `Release` where
//! the value dies (computed by liveness), and a `Retain` when a value
//! is passed along a CFG edge into a block parameter (the parameter is
//! its own owned reference). Raising operations terminate their block;
//! the block's `unwind_releases` list the values that die if the
//! operation unwinds instead of completing. The verifier in
//! [`verify`] checks the balance on every normal and exceptional path.

pub mod lower;
pub mod opt;
pub mod verify;

use crate::source::Span;
use crate::tir::FrameDescriptor;
use molt_core::Intrinsic;

pub type LValue = u32;
pub type LBlockId = u32;

#[derive(Debug, Clone)]
pub struct LirModule {
    pub name: String,
    pub file: String,
    pub functions: Vec<LirFunc>,
    /// Shape descriptors carried over from TIR (slot order = offset).
    pub shapes: Vec<Vec<String>>,
    /// Per-class field lists (slot order = offset).
    pub classes: Vec<Vec<String>>,
    pub entry: usize,
}

#[derive(Debug, Clone)]
pub struct LirFunc {
    pub name: String,
    pub identity: String,
    pub params: Vec<LValue>,
    pub blocks: Vec<LBlock>,
    pub value_count: u32,
    pub frames: Vec<FrameDescriptor>,
    pub is_generator: bool,
    /// Generator resume table: state index -> block.
    pub resume_points: Vec<LBlockId>,
    /// Values provably confined to their defining block and never
    /// written to the heap; backends may keep them in registers.
    pub stack_promotable: Vec<LValue>,
}

#[derive(Debug, Clone)]
pub struct LBlock {
    pub params: Vec<LValue>,
    pub ops: Vec<LOp>,
    pub term: LTerm,
    /// Unwind target when an op in this block raises.
    pub unwind: Option<LBlockId>,
    /// Values that die on the unwind edge (released by the unwinder
    /// before entering the handler).
    pub unwind_releases: Vec<LValue>,
}

/// What a guard tests before entering a specialized variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardTy {
    Int,
    Float,
    Bool,
    Str,
    Class(u32),
}

#[derive(Debug, Clone)]
pub enum LOp {
    ConstInt { dst: LValue, value: i64 },
    ConstBigInt { dst: LValue, text: String },
    ConstFloat { dst: LValue, value: f64 },
    ConstStr { dst: LValue, value: String },
    ConstBool { dst: LValue, value: bool },
    ConstNull { dst: LValue },

    /// Take one reference.
    Retain(LValue),
    /// Drop one reference.
    Release(LValue),

    /// Allocations. Element/argument references are retained by the
    /// constructor; the dst owns one reference.
    AllocList { dst: LValue, elems: Vec<LValue> },
    AllocTuple { dst: LValue, elems: Vec<LValue> },
    AllocMap {
        dst: LValue,
        shape: Option<u32>,
        keys: Vec<LValue>,
        values: Vec<LValue>,
    },
    AllocSet { dst: LValue, elems: Vec<LValue> },
    AllocInstance { dst: LValue, class: u32 },

    /// Fixed-offset load/store (shape-stable records, instances).
    LoadField { dst: LValue, obj: LValue, offset: u32 },
    StoreField { obj: LValue, offset: u32, value: LValue },

    /// Resolve a handle to an object pointer.
    ResolveHandle { dst: LValue, handle: LValue },

    /// Runtime intrinsic call, by wire id.
    CallIntrinsic {
        dst: LValue,
        id: Intrinsic,
        args: Vec<LValue>,
    },
    /// Direct call to a known function (possibly a specialized
    /// variant).
    CallStatic {
        dst: LValue,
        func: usize,
        args: Vec<LValue>,
    },
    /// Guarded call: test `guard_ty` on args[guard_arg]; on success
    /// call the variant, on mismatch deopt to the general function
    /// using the recorded frame.
    CallGuarded {
        dst: LValue,
        general: usize,
        variant: usize,
        guard_arg: usize,
        guard_ty: GuardTy,
        frame: usize,
        args: Vec<LValue>,
    },
    /// Full runtime dispatch through a callable value.
    CallDynamic {
        dst: LValue,
        callee: LValue,
        args: Vec<LValue>,
    },

    /// A module function as a callable value.
    MakeCallable { dst: LValue, func: usize },

    /// Error-kind test and cause attachment.
    ErrIsA { dst: LValue, err: LValue, kind: String },
    SetErrCause { dst: LValue, err: LValue, cause: LValue },

    Move { dst: LValue, src: LValue },
}

impl LOp {
    pub fn dst(&self) -> Option<LValue> {
        match self {
            LOp::ConstInt { dst, .. }
            | LOp::ConstBigInt { dst, .. }
            | LOp::ConstFloat { dst, .. }
            | LOp::ConstStr { dst, .. }
            | LOp::ConstBool { dst, .. }
            | LOp::ConstNull { dst }
            | LOp::AllocList { dst, .. }
            | LOp::AllocTuple { dst, .. }
            | LOp::AllocMap { dst, .. }
            | LOp::AllocSet { dst, .. }
            | LOp::AllocInstance { dst, .. }
            | LOp::LoadField { dst, .. }
            | LOp::ResolveHandle { dst, .. }
            | LOp::CallIntrinsic { dst, .. }
            | LOp::CallStatic { dst, .. }
            | LOp::CallGuarded { dst, .. }
            | LOp::CallDynamic { dst, .. }
            | LOp::MakeCallable { dst, .. }
            | LOp::ErrIsA { dst, .. }
            | LOp::SetErrCause { dst, .. }
            | LOp::Move { dst, .. } => Some(*dst),
            LOp::Retain(_) | LOp::Release(_) | LOp::StoreField { .. } => None,
        }
    }

    /// Whether the result owns a reference the frame must release.
    /// Loads are borrows; constants of immediates own nothing that
    /// needs releasing, but releasing an immediate is a no-op so they
    /// are treated uniformly as non-owning.
    pub fn owns_result(&self) -> bool {
        matches!(
            self,
            LOp::ConstBigInt { .. }
                | LOp::ConstStr { .. }
                | LOp::AllocList { .. }
                | LOp::AllocTuple { .. }
                | LOp::AllocMap { .. }
                | LOp::AllocSet { .. }
                | LOp::AllocInstance { .. }
                | LOp::CallIntrinsic { .. }
                | LOp::CallStatic { .. }
                | LOp::CallGuarded { .. }
                | LOp::CallDynamic { .. }
                | LOp::MakeCallable { .. }
                | LOp::SetErrCause { .. }
        )
    }

    /// Whether the op can raise (and therefore must end its block when
    /// a handler is active).
    pub fn may_raise(&self) -> bool {
        match self {
            LOp::CallIntrinsic { id, .. } => id.def().effects.raises(),
            LOp::CallStatic { .. } | LOp::CallGuarded { .. } | LOp::CallDynamic { .. } => true,
            _ => false,
        }
    }

    pub fn uses(&self) -> Vec<LValue> {
        match self {
            LOp::Retain(v) | LOp::Release(v) => vec![*v],
            LOp::AllocList { elems, .. }
            | LOp::AllocTuple { elems, .. }
            | LOp::AllocSet { elems, .. } => elems.clone(),
            LOp::AllocMap { keys, values, .. } => {
                keys.iter().chain(values.iter()).copied().collect()
            }
            LOp::AllocInstance { .. } => Vec::new(),
            LOp::LoadField { obj, .. } => vec![*obj],
            LOp::StoreField { obj, value, .. } => vec![*obj, *value],
            LOp::ResolveHandle { handle, .. } => vec![*handle],
            LOp::CallIntrinsic { args, .. }
            | LOp::CallStatic { args, .. }
            | LOp::CallGuarded { args, .. } => args.clone(),
            LOp::CallDynamic { callee, args, .. } => {
                std::iter::once(*callee).chain(args.iter().copied()).collect()
            }
            LOp::ErrIsA { err, .. } => vec![*err],
            LOp::SetErrCause { err, cause, .. } => vec![*err, *cause],
            LOp::Move { src, .. } => vec![*src],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LTerm {
    Jump {
        to: LBlockId,
        args: Vec<LValue>,
    },
    /// Branch on truthiness.
    Branch {
        cond: LValue,
        then_to: LBlockId,
        then_args: Vec<LValue>,
        else_to: LBlockId,
        else_args: Vec<LValue>,
    },
    Return(LValue),
    Raise(LValue),
    /// Generator suspension with its resume state index.
    Yield {
        value: LValue,
        state: u32,
        resume: LBlockId,
    },
    /// Await a task result; resume receives it.
    Await {
        value: LValue,
        resume: LBlockId,
    },
}

impl LTerm {
    pub fn successors(&self) -> Vec<LBlockId> {
        match self {
            LTerm::Jump { to, .. } => vec![*to],
            LTerm::Branch {
                then_to, else_to, ..
            } => vec![*then_to, *else_to],
            LTerm::Yield { resume, .. } | LTerm::Await { resume, .. } => vec![*resume],
            LTerm::Return(_) | LTerm::Raise(_) => Vec::new(),
        }
    }

    pub fn edge_args(&self, succ: LBlockId) -> Vec<LValue> {
        match self {
            LTerm::Jump { to, args } if *to == succ => args.clone(),
            LTerm::Branch {
                then_to,
                then_args,
                else_to,
                else_args,
                ..
            } => {
                if *then_to == succ {
                    then_args.clone()
                } else if *else_to == succ {
                    else_args.clone()
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn uses(&self) -> Vec<LValue> {
        match self {
            LTerm::Jump { args, .. } => args.clone(),
            LTerm::Branch {
                cond,
                then_args,
                else_args,
                ..
            } => std::iter::once(*cond)
                .chain(then_args.iter().copied())
                .chain(else_args.iter().copied())
                .collect(),
            LTerm::Return(v) | LTerm::Raise(v) => vec![*v],
            LTerm::Yield { value, .. } | LTerm::Await { value, .. } => vec![*value],
        }
    }
}

/// Op metadata kept for diagnostics.
#[derive(Debug, Clone)]
pub struct OpDebug {
    pub span: Span,
}

#[cfg(test)]
pub mod testutil {
    use super::LirModule;
    use std::collections::HashMap;

    /// Full frontend-to-LIR pipeline for tests.
    pub fn lower_source(src: &str) -> LirModule {
        let ast = crate::parser::parse(src, "test.mt", "test").expect("parse");
        let hir = crate::hir::lower_module(&ast).expect("hir");
        let mut tir = crate::tir::build::build_module(&hir).expect("tir");
        let mut inf =
            crate::tir::infer::infer_module(&mut tir, &HashMap::new(), false).expect("infer");
        crate::tir::specialize::specialize_module(&mut tir, &mut inf).expect("specialize");
        super::lower::lower_module(&tir, &inf).expect("lir")
    }
}
