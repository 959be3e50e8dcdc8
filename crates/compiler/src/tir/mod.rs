//! Typed SSA
//!
//! TIR is a control-flow graph of basic blocks in block-parameter SSA
//! form: every value has exactly one defining operation, merges happen
//! through block parameters, and after inference every value carries a
//! concrete lattice type (never `unknown`).
//!
//! Exceptional flow is explicit: each block records its active handler
//! block; `raise` (and any operation whose intrinsic may raise) unwinds
//! to that block, or out of the function when there is none.
//!
//! Generator functions are state machines already at this level: a
//! `yield` terminator names its resume block, and the function's
//! resume-point table is the dispatch a backend emits for resumption.

pub mod build;
pub mod facts;
pub mod infer;
pub mod specialize;
pub mod types;

use crate::ast::{BinOp, CmpOp};
use crate::source::Span;
use molt_core::Intrinsic;
use types::Ty;

pub type ValueId = u32;
pub type BlockId = u32;

#[derive(Debug, Clone)]
pub struct TirModule {
    pub name: String,
    pub file: String,
    pub imports: Vec<String>,
    pub functions: Vec<TirFunc>,
    pub classes: Vec<TirClass>,
    /// Interned shape descriptors: key sets in slot order.
    pub shapes: Vec<Vec<String>>,
    pub entry: usize,
}

impl TirModule {
    /// Intern a shape key set, returning its descriptor index.
    pub fn intern_shape(&mut self, keys: Vec<String>) -> u32 {
        if let Some(idx) = self.shapes.iter().position(|s| *s == keys) {
            return idx as u32;
        }
        self.shapes.push(keys);
        (self.shapes.len() - 1) as u32
    }
}

#[derive(Debug, Clone)]
pub struct TirClass {
    pub name: String,
    pub fields: Vec<String>,
    /// Method name -> function index.
    pub methods: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct TirFunc {
    pub name: String,
    /// Stable symbol identity hash.
    pub identity: String,
    pub params: Vec<ValueId>,
    /// Source parameter names (frame descriptors, diagnostics).
    pub param_names: Vec<String>,
    pub blocks: Vec<Block>,
    /// Per-value type information, indexed by [`ValueId`].
    pub value_tys: Vec<Ty>,
    pub entry: BlockId,
    pub is_async: bool,
    pub is_generator: bool,
    /// Resume-point table for generators: state i resumes at
    /// `resume_points[i]`.
    pub resume_points: Vec<BlockId>,
    /// Frame descriptors for guarded sites and tracebacks.
    pub frames: Vec<FrameDescriptor>,
    pub self_class: Option<u32>,
    pub span: Span,
}

impl TirFunc {
    pub fn new_value(&mut self) -> ValueId {
        self.value_tys.push(Ty::Never);
        (self.value_tys.len() - 1) as ValueId
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id as usize]
    }
}

/// A frame descriptor: enough to rebuild a source frame at a deopt
/// point or while unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub function: String,
    pub file: String,
    pub line: u32,
    /// Live local slot names at this point, in slot order.
    pub locals: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub params: Vec<ValueId>,
    pub ops: Vec<Op>,
    pub term: Term,
    /// Active handler block; raising operations unwind here.
    pub handler: Option<BlockId>,
}

#[derive(Debug, Clone)]
pub struct Op {
    pub dst: Option<ValueId>,
    pub kind: OpKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum OpKind {
    Const(TConst),
    /// Generic binary operator; inference narrows it to a concrete
    /// intrinsic (or leaves it dynamic).
    Binary { op: BinOp, l: ValueId, r: ValueId },
    Compare { op: CmpOp, l: ValueId, r: ValueId },
    Not(ValueId),
    Neg(ValueId),
    MakeTuple(Vec<ValueId>),
    MakeList(Vec<ValueId>),
    MakeMap { keys: Vec<ValueId>, values: Vec<ValueId> },
    MakeSet(Vec<ValueId>),
    /// Subscript load/store; shaped maps lower these to fixed offsets.
    GetItem { obj: ValueId, index: ValueId },
    SetItem { obj: ValueId, index: ValueId, value: ValueId },
    GetAttr { obj: ValueId, name: String },
    SetAttr { obj: ValueId, name: String, value: ValueId },
    SeqLen(ValueId),
    /// Direct call to a module function. Dispatch selection is filled
    /// by specialization.
    Call {
        func: usize,
        args: Vec<ValueId>,
        dispatch: Dispatch,
    },
    /// Call of a callable value.
    CallValue { callee: ValueId, args: Vec<ValueId> },
    /// Method call; `resolved` points at the unique static target when
    /// the class is known and stable.
    CallMethod {
        obj: ValueId,
        name: String,
        args: Vec<ValueId>,
        resolved: Option<(u32, usize)>,
    },
    /// Class construction (allocates, then calls `__init__` if any).
    MakeInstance { class: u32, args: Vec<ValueId> },
    Intrinsic { id: Intrinsic, args: Vec<ValueId> },
    /// A module function as a callable value.
    FuncRef(usize),
    IterNew(ValueId),
    IterNext(ValueId),
    /// Kind test against the error taxonomy (handler dispatch).
    ErrIsA { err: ValueId, kind: ValueId },
    /// Attach a structured cause to an error value; yields the error.
    SetErrCause { err: ValueId, cause: ValueId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TConst {
    Int(i64),
    BigInt(String),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

/// Call-site dispatch classification (spec'd Static/Guarded/Dynamic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Not yet classified.
    Unresolved,
    /// Unique known target; may name a specialized variant.
    Static { variant: Option<usize> },
    /// Likely target behind a runtime guard; on mismatch, deopt to the
    /// general path using the frame descriptor.
    Guarded { variant: usize, frame: usize },
    /// Full runtime dispatch through the site cache.
    Dynamic,
}

#[derive(Debug, Clone)]
pub enum Term {
    Jump {
        to: BlockId,
        args: Vec<ValueId>,
    },
    Branch {
        cond: ValueId,
        then_to: BlockId,
        then_args: Vec<ValueId>,
        else_to: BlockId,
        else_args: Vec<ValueId>,
    },
    Return(ValueId),
    Raise(ValueId),
    /// Generator suspension: emit `value`, resume at `resume` (whose
    /// single parameter receives the sent value).
    Yield {
        value: ValueId,
        resume: BlockId,
    },
    /// Task suspension awaiting `value`; `resume`'s single parameter
    /// receives the awaited result.
    Await {
        value: ValueId,
        resume: BlockId,
    },
    /// Placeholder while a block is under construction.
    Unterminated,
}

impl Term {
    /// Successor blocks of this terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Term::Jump { to, .. } => vec![*to],
            Term::Branch {
                then_to, else_to, ..
            } => vec![*then_to, *else_to],
            Term::Yield { resume, .. } | Term::Await { resume, .. } => vec![*resume],
            _ => Vec::new(),
        }
    }
}

/// Render a function for snapshots and debugging.
pub fn display_func(f: &TirFunc) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "fn {} (entry b{})", f.name, f.entry);
    for (i, block) in f.blocks.iter().enumerate() {
        let params: Vec<String> = block.params.iter().map(|p| format!("v{}", p)).collect();
        let handler = match block.handler {
            Some(h) => format!(" handler=b{}", h),
            None => String::new(),
        };
        let _ = writeln!(out, "b{}({}){}:", i, params.join(", "), handler);
        for op in &block.ops {
            let dst = match op.dst {
                Some(d) => format!("v{} = ", d),
                None => String::new(),
            };
            let _ = writeln!(out, "  {}{:?}", dst, op.kind);
        }
        let _ = writeln!(out, "  {:?}", block.term);
    }
    out
}
