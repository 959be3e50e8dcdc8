//! TIR to LIR lowering
//!
//! Two phases per function:
//!
//! 1. **Translation.** Each TIR operation becomes explicit LIR:
//!    typed operators select their intrinsic (`int_add`, `float_mul`,
//!    `str_concat`); dynamic operands fall back to the `any_*` runtime
//!    paths; shape-stable record access becomes fixed-offset
//!    loads/stores; call sites become their classified form. A block is
//!    split after every operation that may raise, so each LIR block has
//!    at most one potential unwind point (its last op) and the unwind
//!    metadata is exact.
//!
//! 2. **Ownership.** Liveness places one `Release` at every value's
//!    death point, `Retain`s transfer references onto CFG edges and out
//!    of returns, and each block's `unwind_releases` names what dies if
//!    its raising op unwinds. The verifier checks the result.

use std::collections::{HashMap, HashSet};

use molt_core::Intrinsic;

use crate::ast::{BinOp, CmpOp};
use crate::diag::{CompileError, Stage};
use crate::tir::infer::Inference;
use crate::tir::types::Ty;
use crate::tir::{Dispatch, OpKind, TConst, Term, TirFunc, TirModule, ValueId};

use super::{GuardTy, LBlock, LBlockId, LOp, LTerm, LValue, LirFunc, LirModule};

type LResult<T> = Result<T, CompileError>;

pub fn lower_module(tir: &TirModule, inf: &Inference) -> LResult<LirModule> {
    let mut functions = Vec::new();
    for f in &tir.functions {
        let mut lf = FnLowerer::new(tir, inf, f).lower()?;
        insert_rc(&mut lf);
        functions.push(lf);
    }
    Ok(LirModule {
        name: tir.name.clone(),
        file: tir.file.clone(),
        functions,
        shapes: tir.shapes.clone(),
        classes: tir.classes.iter().map(|c| c.fields.clone()).collect(),
        entry: tir.entry,
    })
}

struct FnLowerer<'a> {
    tir: &'a TirModule,
    inf: &'a Inference,
    src: &'a TirFunc,
    out: LirFunc,
    /// TIR block -> LIR entry block.
    block_map: Vec<LBlockId>,
    const_strs: HashMap<ValueId, String>,
    cur: LBlockId,
}

impl<'a> FnLowerer<'a> {
    fn new(tir: &'a TirModule, inf: &'a Inference, src: &'a TirFunc) -> Self {
        FnLowerer {
            tir,
            inf,
            src,
            out: LirFunc {
                name: src.name.clone(),
                identity: src.identity.clone(),
                params: src.params.clone(),
                blocks: Vec::new(),
                value_count: src.value_tys.len() as u32,
                frames: src.frames.clone(),
                is_generator: src.is_generator,
                resume_points: Vec::new(),
                stack_promotable: Vec::new(),
            },
            block_map: Vec::new(),
            const_strs: HashMap::new(),
            cur: 0,
        }
    }

    fn ty(&self, v: ValueId) -> &Ty {
        &self.src.value_tys[v as usize]
    }

    fn temp(&mut self) -> LValue {
        let v = self.out.value_count;
        self.out.value_count += 1;
        v
    }

    fn push(&mut self, op: LOp) {
        self.out.blocks[self.cur as usize].ops.push(op);
    }

    /// Split the current block after a raising op: the continuation
    /// inherits the unwind target.
    fn split(&mut self) {
        let unwind = self.out.blocks[self.cur as usize].unwind;
        self.out.blocks.push(LBlock {
            params: Vec::new(),
            ops: Vec::new(),
            term: LTerm::Return(0), // placeholder; overwritten below
            unwind,
            unwind_releases: Vec::new(),
        });
        let cont = (self.out.blocks.len() - 1) as LBlockId;
        self.out.blocks[self.cur as usize].term = LTerm::Jump {
            to: cont,
            args: Vec::new(),
        };
        self.cur = cont;
    }

    fn err(&self, span: &crate::source::Span, msg: impl Into<String>) -> CompileError {
        CompileError::at(Stage::Lir, span.clone(), msg)
    }

    fn lower(mut self) -> LResult<LirFunc> {
        // Constant pre-scan (shaped-key and tuple-index resolution).
        for block in &self.src.blocks {
            for op in &block.ops {
                if let (Some(dst), OpKind::Const(TConst::Str(s))) = (op.dst, &op.kind) {
                    self.const_strs.insert(dst, s.clone());
                }
            }
        }

        // One LIR entry block per TIR block, preserving params.
        for tb in &self.src.blocks {
            self.out.blocks.push(LBlock {
                params: tb.params.clone(),
                ops: Vec::new(),
                term: LTerm::Return(0), // placeholder
                unwind: None,
                unwind_releases: Vec::new(),
            });
            self.block_map.push((self.out.blocks.len() - 1) as LBlockId);
        }
        for (i, tb) in self.src.blocks.iter().enumerate() {
            let entry = self.block_map[i];
            self.out.blocks[entry as usize].unwind = tb.handler.map(|h| self.block_map[h as usize]);
        }
        self.out.resume_points = self
            .src
            .resume_points
            .iter()
            .map(|b| self.block_map[*b as usize])
            .collect();

        for (i, _) in self.src.blocks.iter().enumerate() {
            self.cur = self.block_map[i];
            let block = &self.src.blocks[i];
            for op in &block.ops {
                self.lower_op(op)?;
            }
            self.lower_term(&block.term)?;
        }
        Ok(self.out)
    }

    fn lower_op(&mut self, op: &crate::tir::Op) -> LResult<()> {
        let dst = op.dst.unwrap_or_else(|| {
            // Void TIR ops still produce an LIR slot for uniformity.
            0
        });
        let span = op.span.clone();
        let mut raised = false;
        match &op.kind {
            OpKind::Const(c) => {
                let dst = op.dst.expect("const has a destination");
                match c {
                    TConst::Int(n) => self.push(LOp::ConstInt { dst, value: *n }),
                    TConst::BigInt(s) => {
                        self.push(LOp::ConstBigInt {
                            dst,
                            text: s.clone(),
                        });
                    }
                    TConst::Float(f) => self.push(LOp::ConstFloat { dst, value: *f }),
                    TConst::Str(s) => self.push(LOp::ConstStr {
                        dst,
                        value: s.clone(),
                    }),
                    TConst::Bool(b) => self.push(LOp::ConstBool { dst, value: *b }),
                    TConst::None => self.push(LOp::ConstNull { dst }),
                }
            }
            OpKind::Binary { op: bop, l, r } => {
                let id = self.select_binary(*bop, *l, *r);
                self.push(LOp::CallIntrinsic {
                    dst,
                    id,
                    args: vec![*l, *r],
                });
                raised = id.def().effects.raises();
            }
            OpKind::Compare { op: cop, l, r } => {
                raised = self.lower_compare(dst, *cop, *l, *r);
            }
            OpKind::Not(v) => {
                let id = if *self.ty(*v) == Ty::Bool {
                    Intrinsic::BoolNot
                } else {
                    Intrinsic::AnyNot
                };
                self.push(LOp::CallIntrinsic {
                    dst,
                    id,
                    args: vec![*v],
                });
            }
            OpKind::Neg(v) => {
                let id = match self.ty(*v) {
                    Ty::Int | Ty::Bool => Intrinsic::IntNeg,
                    Ty::Float => Intrinsic::FloatNeg,
                    _ => Intrinsic::AnyNeg,
                };
                self.push(LOp::CallIntrinsic {
                    dst,
                    id,
                    args: vec![*v],
                });
                raised = id.def().effects.raises();
            }
            OpKind::MakeTuple(items) => self.push(LOp::AllocTuple {
                dst,
                elems: items.clone(),
            }),
            OpKind::MakeList(items) => self.push(LOp::AllocList {
                dst,
                elems: items.clone(),
            }),
            OpKind::MakeSet(items) => self.push(LOp::AllocSet {
                dst,
                elems: items.clone(),
            }),
            OpKind::MakeMap { keys, values } => {
                let shape = match self.ty(dst) {
                    Ty::Map { shape, .. } => *shape,
                    _ => None,
                };
                self.push(LOp::AllocMap {
                    dst,
                    shape,
                    keys: keys.clone(),
                    values: values.clone(),
                });
            }
            OpKind::GetItem { obj, index } => {
                raised = self.lower_get_item(dst, *obj, *index);
            }
            OpKind::SetItem { obj, index, value } => {
                raised = self.lower_set_item(*obj, *index, *value);
            }
            OpKind::GetAttr { obj, name } => {
                match self.ty(*obj) {
                    Ty::Class(id) => {
                        let class = &self.tir.classes[*id as usize];
                        if let Some(offset) = class.fields.iter().position(|f| f == name) {
                            self.push(LOp::LoadField {
                                dst,
                                obj: *obj,
                                offset: offset as u32,
                            });
                        } else if let Some((_, func)) =
                            class.methods.iter().find(|(m, _)| m == name)
                        {
                            self.push(LOp::MakeCallable { dst, func: *func });
                        } else {
                            return Err(self.err(
                                &span,
                                format!("'{}' has no attribute '{}'", class.name, name),
                            ));
                        }
                    }
                    _ => {
                        // General path: attribute by name at runtime.
                        let name_v = self.temp();
                        self.push(LOp::ConstStr {
                            dst: name_v,
                            value: name.clone(),
                        });
                        self.push(LOp::CallIntrinsic {
                            dst,
                            id: Intrinsic::AnyGetAttr,
                            args: vec![*obj, name_v],
                        });
                        raised = true;
                    }
                }
            }
            OpKind::SetAttr { obj, name, value } => match self.ty(*obj) {
                Ty::Class(id) => {
                    let class = &self.tir.classes[*id as usize];
                    let offset = class
                        .fields
                        .iter()
                        .position(|f| f == name)
                        .ok_or_else(|| {
                            self.err(
                                &span,
                                format!("'{}' has no attribute '{}'", class.name, name),
                            )
                        })?;
                    self.push(LOp::StoreField {
                        obj: *obj,
                        offset: offset as u32,
                        value: *value,
                    });
                }
                _ => {
                    let name_v = self.temp();
                    self.push(LOp::ConstStr {
                        dst: name_v,
                        value: name.clone(),
                    });
                    let sink = self.temp();
                    self.push(LOp::CallIntrinsic {
                        dst: sink,
                        id: Intrinsic::AnySetAttr,
                        args: vec![*obj, name_v, *value],
                    });
                    raised = true;
                }
            },
            OpKind::SeqLen(v) => {
                let id = match self.ty(*v) {
                    Ty::Str => Intrinsic::StrLen,
                    Ty::List(_) => Intrinsic::ListLen,
                    Ty::Tuple(_) => Intrinsic::TupleLen,
                    Ty::Map { .. } => Intrinsic::MapLen,
                    Ty::Set(_) => Intrinsic::SetLen,
                    _ => Intrinsic::AnyLen,
                };
                self.push(LOp::CallIntrinsic {
                    dst,
                    id,
                    args: vec![*v],
                });
                raised = id.def().effects.raises();
            }
            OpKind::Call {
                func,
                args,
                dispatch,
            } => {
                match dispatch {
                    Dispatch::Static { variant: Some(v) } => self.push(LOp::CallStatic {
                        dst,
                        func: *v,
                        args: args.clone(),
                    }),
                    Dispatch::Guarded { variant, frame } => {
                        match self.guard_info(*variant, args) {
                            Some((guard_arg, guard_ty)) => self.push(LOp::CallGuarded {
                                dst,
                                general: *func,
                                variant: *variant,
                                guard_arg,
                                guard_ty,
                                frame: *frame,
                                args: args.clone(),
                            }),
                            None => self.push(LOp::CallStatic {
                                dst,
                                func: *func,
                                args: args.clone(),
                            }),
                        }
                    }
                    _ => self.push(LOp::CallStatic {
                        dst,
                        func: *func,
                        args: args.clone(),
                    }),
                }
                raised = true;
            }
            OpKind::CallValue { callee, args } => {
                self.push(LOp::CallDynamic {
                    dst,
                    callee: *callee,
                    args: args.clone(),
                });
                raised = true;
            }
            OpKind::CallMethod {
                obj,
                name,
                args,
                resolved,
            } => {
                if let Some((_, func)) = resolved {
                    let mut full = vec![*obj];
                    full.extend(args.iter().copied());
                    self.push(LOp::CallStatic {
                        dst,
                        func: *func,
                        args: full,
                    });
                } else if let Some(id) =
                    crate::tir::infer::builtin_method(self.ty(*obj), name)
                {
                    let mut full = vec![*obj];
                    full.extend(args.iter().copied());
                    self.push(LOp::CallIntrinsic {
                        dst,
                        id,
                        args: full,
                    });
                } else {
                    return Err(self.err(
                        &span,
                        format!(
                            "cannot resolve method '{}' on {:?}; method calls need a nominal receiver",
                            name,
                            self.ty(*obj)
                        ),
                    ));
                }
                raised = true;
            }
            OpKind::MakeInstance { class, args } => {
                self.push(LOp::AllocInstance { dst, class: *class });
                let init = self.tir.classes[*class as usize]
                    .methods
                    .iter()
                    .find(|(m, _)| m == "__init__")
                    .map(|(_, f)| *f);
                if let Some(init) = init {
                    let sink = self.temp();
                    let mut full = vec![dst];
                    full.extend(args.iter().copied());
                    self.push(LOp::CallStatic {
                        dst: sink,
                        func: init,
                        args: full,
                    });
                    raised = true;
                }
            }
            OpKind::Intrinsic { id, args } => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: *id,
                    args: args.clone(),
                });
                raised = id.def().effects.raises();
            }
            OpKind::FuncRef(func) => self.push(LOp::MakeCallable { dst, func: *func }),
            OpKind::IterNew(v) => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::IterNew,
                    args: vec![*v],
                });
                raised = true;
            }
            OpKind::IterNext(v) => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::IterNext,
                    args: vec![*v],
                });
            }
            OpKind::ErrIsA { err, kind } => {
                let kind = self
                    .const_strs
                    .get(kind)
                    .cloned()
                    .ok_or_else(|| self.err(&span, "error kind must be a constant"))?;
                self.push(LOp::ErrIsA {
                    dst,
                    err: *err,
                    kind,
                });
            }
            OpKind::SetErrCause { err, cause } => {
                self.push(LOp::SetErrCause {
                    dst,
                    err: *err,
                    cause: *cause,
                });
            }
        }
        if raised {
            self.split();
        }
        Ok(())
    }

    fn select_binary(&self, op: BinOp, l: ValueId, r: ValueId) -> Intrinsic {
        use BinOp::*;
        let (lt, rt) = (self.ty(l), self.ty(r));
        let ints = matches!(lt, Ty::Int | Ty::Bool) && matches!(rt, Ty::Int | Ty::Bool);
        let floats =
            (lt.is_numeric() && *rt == Ty::Float) || (*lt == Ty::Float && rt.is_numeric());
        match op {
            Add if ints => Intrinsic::IntAdd,
            Sub if ints => Intrinsic::IntSub,
            Mul if ints => Intrinsic::IntMul,
            FloorDiv if ints => Intrinsic::IntDiv,
            Mod if ints => Intrinsic::IntMod,
            Add if floats => Intrinsic::FloatAdd,
            Sub if floats => Intrinsic::FloatSub,
            Mul if floats => Intrinsic::FloatMul,
            Div if floats => Intrinsic::FloatDiv,
            Add if *lt == Ty::Str && *rt == Ty::Str => Intrinsic::StrConcat,
            Add => Intrinsic::AnyAdd,
            Sub => Intrinsic::AnySub,
            Mul => Intrinsic::AnyMul,
            Div => Intrinsic::AnyDiv,
            FloorDiv => Intrinsic::AnyFloorDiv,
            Mod => Intrinsic::AnyMod,
        }
    }

    /// Returns whether the emitted op may raise.
    fn lower_compare(&mut self, dst: LValue, op: CmpOp, l: ValueId, r: ValueId) -> bool {
        use CmpOp::*;
        match op {
            Eq => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::CmpEq,
                    args: vec![l, r],
                });
                false
            }
            Ne => {
                let eq = self.temp();
                self.push(LOp::CallIntrinsic {
                    dst: eq,
                    id: Intrinsic::CmpEq,
                    args: vec![l, r],
                });
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::BoolNot,
                    args: vec![eq],
                });
                false
            }
            Lt => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::CmpLt,
                    args: vec![l, r],
                });
                true
            }
            Gt => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::CmpLt,
                    args: vec![r, l],
                });
                true
            }
            Le => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::CmpLe,
                    args: vec![l, r],
                });
                true
            }
            Ge => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::CmpLe,
                    args: vec![r, l],
                });
                true
            }
            In => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::AnyContains,
                    args: vec![r, l],
                });
                true
            }
            NotIn => {
                let has = self.temp();
                self.push(LOp::CallIntrinsic {
                    dst: has,
                    id: Intrinsic::AnyContains,
                    args: vec![r, l],
                });
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::BoolNot,
                    args: vec![has],
                });
                true
            }
        }
    }

    fn lower_get_item(&mut self, dst: LValue, obj: ValueId, index: ValueId) -> bool {
        match self.ty(obj) {
            Ty::Map {
                shape: Some(s), ..
            } => {
                if let Some(offset) = self
                    .const_strs
                    .get(&index)
                    .and_then(|k| self.tir.shapes[*s as usize].iter().position(|f| f == k))
                {
                    // The shape-specialized path: a fixed-offset load,
                    // no hash lookup.
                    self.push(LOp::LoadField {
                        dst,
                        obj,
                        offset: offset as u32,
                    });
                    return false;
                }
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::MapGet,
                    args: vec![obj, index],
                });
                true
            }
            Ty::Map { .. } => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::MapGet,
                    args: vec![obj, index],
                });
                true
            }
            Ty::List(_) => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::ListGet,
                    args: vec![obj, index],
                });
                true
            }
            Ty::Tuple(_) => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::TupleGet,
                    args: vec![obj, index],
                });
                true
            }
            Ty::Str => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::StrIndex,
                    args: vec![obj, index],
                });
                true
            }
            _ => {
                self.push(LOp::CallIntrinsic {
                    dst,
                    id: Intrinsic::AnyGetItem,
                    args: vec![obj, index],
                });
                true
            }
        }
    }

    fn lower_set_item(&mut self, obj: ValueId, index: ValueId, value: ValueId) -> bool {
        let sink = self.temp();
        match self.ty(obj) {
            Ty::Map {
                shape: Some(s), ..
            } => {
                if let Some(offset) = self
                    .const_strs
                    .get(&index)
                    .and_then(|k| self.tir.shapes[*s as usize].iter().position(|f| f == k))
                {
                    self.push(LOp::StoreField {
                        obj,
                        offset: offset as u32,
                        value,
                    });
                    return false;
                }
                self.push(LOp::CallIntrinsic {
                    dst: sink,
                    id: Intrinsic::MapSet,
                    args: vec![obj, index, value],
                });
                true
            }
            Ty::Map { .. } => {
                self.push(LOp::CallIntrinsic {
                    dst: sink,
                    id: Intrinsic::MapSet,
                    args: vec![obj, index, value],
                });
                true
            }
            Ty::List(_) => {
                self.push(LOp::CallIntrinsic {
                    dst: sink,
                    id: Intrinsic::ListSet,
                    args: vec![obj, index, value],
                });
                true
            }
            _ => {
                self.push(LOp::CallIntrinsic {
                    dst: sink,
                    id: Intrinsic::AnySetItem,
                    args: vec![obj, index, value],
                });
                true
            }
        }
    }

    fn guard_info(&self, variant: usize, args: &[ValueId]) -> Option<(usize, GuardTy)> {
        let vparams = &self.inf.summaries[variant].params;
        for (i, a) in args.iter().enumerate() {
            if !matches!(self.ty(*a), Ty::Union(_)) {
                continue;
            }
            let guard_ty = match vparams.get(i)? {
                Ty::Int => GuardTy::Int,
                Ty::Float => GuardTy::Float,
                Ty::Bool => GuardTy::Bool,
                Ty::Str => GuardTy::Str,
                Ty::Class(c) => GuardTy::Class(*c),
                _ => return None,
            };
            return Some((i, guard_ty));
        }
        None
    }

    fn lower_term(&mut self, term: &Term) -> LResult<()> {
        let lterm = match term {
            Term::Jump { to, args } => LTerm::Jump {
                to: self.block_map[*to as usize],
                args: args.clone(),
            },
            Term::Branch {
                cond,
                then_to,
                then_args,
                else_to,
                else_args,
            } => LTerm::Branch {
                cond: *cond,
                then_to: self.block_map[*then_to as usize],
                then_args: then_args.clone(),
                else_to: self.block_map[*else_to as usize],
                else_args: else_args.clone(),
            },
            Term::Return(v) => LTerm::Return(*v),
            Term::Raise(v) => LTerm::Raise(*v),
            Term::Yield { value, resume } => {
                let state = self
                    .src
                    .resume_points
                    .iter()
                    .position(|b| b == resume)
                    .unwrap_or(0) as u32;
                LTerm::Yield {
                    value: *value,
                    state,
                    resume: self.block_map[*resume as usize],
                }
            }
            Term::Await { value, resume } => LTerm::Await {
                value: *value,
                resume: self.block_map[*resume as usize],
            },
            Term::Unterminated => LTerm::Return(0),
        };
        self.out.blocks[self.cur as usize].term = lterm;
        Ok(())
    }
}

// =============================================================================
// Ownership insertion
// =============================================================================

/// Insert retains/releases per the ownership model in the module docs.
pub fn insert_rc(f: &mut LirFunc) {
    let nblocks = f.blocks.len();
    let nvalues = f.value_count as usize;

    // Owned values: owning op results plus non-entry block params.
    let mut owned = vec![false; nvalues];
    for (bi, block) in f.blocks.iter().enumerate() {
        if bi != 0 {
            for p in &block.params {
                owned[*p as usize] = true;
            }
        }
        for op in &block.ops {
            if op.owns_result() {
                if let Some(d) = op.dst() {
                    owned[d as usize] = true;
                }
            }
        }
    }

    // Liveness over the CFG including unwind edges.
    let mut live_in: Vec<HashSet<LValue>> = vec![HashSet::new(); nblocks];
    let mut live_out: Vec<HashSet<LValue>> = vec![HashSet::new(); nblocks];
    loop {
        let mut changed = false;
        for bi in (0..nblocks).rev() {
            let block = &f.blocks[bi];
            let mut out = HashSet::new();
            for succ in block.term.successors() {
                out.extend(live_in[succ as usize].iter().copied());
                // Successor params are defined by the edge, not live-in.
                for p in &f.blocks[succ as usize].params {
                    out.remove(p);
                }
            }
            if let Some(h) = block.unwind {
                out.extend(live_in[h as usize].iter().copied());
                for p in &f.blocks[h as usize].params {
                    out.remove(p);
                }
            }
            // Backward through the block.
            let mut live = out.clone();
            for v in block.term.uses() {
                live.insert(v);
            }
            for op in block.ops.iter().rev() {
                if let Some(d) = op.dst() {
                    live.remove(&d);
                }
                for u in op.uses() {
                    live.insert(u);
                }
            }
            for p in &block.params {
                live.remove(p);
            }
            if live != live_in[bi] || out != live_out[bi] {
                live_in[bi] = live;
                live_out[bi] = out;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Values that die at a Branch terminator (condition, one-sided edge
    // arguments). Their releases belong on the edges, after the branch
    // has read them; collected here for the trampoline phase.
    let mut branch_term_dying: Vec<Vec<LValue>> = vec![Vec::new(); nblocks];

    for bi in 0..nblocks {
        let block = &f.blocks[bi];
        let is_branch = matches!(block.term, LTerm::Branch { .. });
        // Values present in this block (params, live-in, defs).
        let mut present: HashSet<LValue> = live_in[bi].clone();
        present.extend(block.params.iter().copied());
        let mut last_use: HashMap<LValue, usize> = HashMap::new();
        const TERM_USE: usize = usize::MAX;
        for (oi, op) in block.ops.iter().enumerate() {
            for u in op.uses() {
                last_use.insert(u, oi);
            }
            if let Some(d) = op.dst() {
                present.insert(d);
                last_use.entry(d).or_insert(oi);
            }
        }
        for u in block.term.uses() {
            last_use.insert(u, TERM_USE);
        }

        // Values transferred out by the terminator.
        let transferred: Vec<LValue> = match &block.term {
            LTerm::Return(v) | LTerm::Raise(v) => vec![*v],
            LTerm::Yield { value, .. } | LTerm::Await { value, .. } => vec![*value],
            _ => Vec::new(),
        };

        // Dying owned values: present but not live out.
        let mut dying: Vec<LValue> = present
            .iter()
            .copied()
            .filter(|v| owned[*v as usize] && !live_out[bi].contains(v))
            .collect();
        dying.sort_unstable();

        let raising_idx = block.ops.iter().position(|op| op.may_raise());
        let raising_dst = raising_idx.and_then(|i| block.ops[i].dst());

        // Unwind metadata: what still holds a reference if the raising
        // op (always the last op, by block splitting) unwinds.
        let unwind_releases: Vec<LValue> = if let Some(ri) = raising_idx {
            let handler_live: HashSet<LValue> = block
                .unwind
                .map(|h| live_in[h as usize].clone())
                .unwrap_or_default();
            let mut dies: Vec<LValue> = present
                .iter()
                .copied()
                .filter(|v| {
                    owned[*v as usize]
                        && Some(*v) != raising_dst
                        && !handler_live.contains(v)
                        && (live_out[bi].contains(v)
                            || last_use.get(v).copied().unwrap_or(0) >= ri
                            || transferred.contains(v))
                })
                .collect();
            dies.sort_unstable();
            dies
        } else {
            Vec::new()
        };

        // Rebuild the op list with releases after last uses.
        let block = &mut f.blocks[bi];
        let old_ops = std::mem::take(&mut block.ops);
        let mut new_ops = Vec::with_capacity(old_ops.len() + dying.len());
        for (oi, op) in old_ops.into_iter().enumerate() {
            new_ops.push(op);
            for v in &dying {
                if last_use.get(v) == Some(&oi) && !transferred.contains(v) {
                    new_ops.push(LOp::Release(*v));
                }
            }
        }
        // Edge retains: successors' params each take a fresh reference.
        // Branch edges handle both retains and terminator-time releases
        // in their per-edge trampolines, after the branch has read its
        // operands.
        if !is_branch {
            for arg in edge_arg_list(&block.term) {
                new_ops.push(LOp::Retain(arg));
            }
        }
        // Dying values whose last use is the terminator.
        for v in &dying {
            if last_use.get(v) == Some(&TERM_USE) && !transferred.contains(v) {
                if is_branch {
                    branch_term_dying[bi].push(*v);
                } else {
                    new_ops.push(LOp::Release(*v));
                }
            }
            // Dying but never used at all (e.g. ignored results with
            // no recorded use): release at block end.
            if !last_use.contains_key(v) && !transferred.contains(v) {
                new_ops.push(LOp::Release(*v));
            }
        }
        // Transfers out of the frame: make sure a reference leaves.
        for v in &transferred {
            let leaves_owned = owned[*v as usize] && !live_out[bi].contains(v);
            if !leaves_owned {
                new_ops.push(LOp::Retain(*v));
            }
        }
        block.ops = new_ops;
        block.unwind_releases = unwind_releases;
    }

    // Per-edge bookkeeping for branches. A branch edge may need
    // retains (its arguments feed the successor's parameters), a
    // transfer (an argument dying here hands its reference over), and
    // releases (the condition, the other side's arguments, and values
    // live into the sibling successor only). All of it runs after the
    // branch has read its operands, in a trampoline block on the edge.
    for bi in 0..nblocks {
        let LTerm::Branch {
            cond,
            then_to,
            then_args,
            else_to,
            else_args,
        } = f.blocks[bi].term.clone()
        else {
            continue;
        };
        let term_dying = branch_term_dying[bi].clone();
        let route = |to: LBlockId, args: Vec<LValue>, f: &mut LirFunc| -> (LBlockId, Vec<LValue>) {
            let mut ops: Vec<LOp> = Vec::new();
            // Arguments not dying here need a fresh reference for the
            // successor parameter; a dying argument transfers its own
            // reference (once — a repeated argument retains for the
            // extra positions).
            let mut transferred_once: Vec<LValue> = Vec::new();
            for a in &args {
                if term_dying.contains(a) && !transferred_once.contains(a) {
                    transferred_once.push(*a);
                } else {
                    ops.push(LOp::Retain(*a));
                }
            }
            // Terminator-time deaths not consumed by this edge.
            let mut releases: Vec<LValue> = term_dying
                .iter()
                .copied()
                .filter(|v| !args.contains(v))
                .collect();
            // Values that survive the block but are dead on this edge.
            releases.extend(live_out[bi].iter().copied().filter(|v| {
                owned[*v as usize]
                    && !live_in[to as usize].contains(v)
                    && !args.contains(v)
                    && !term_dying.contains(v)
            }));
            releases.sort_unstable();
            ops.extend(releases.into_iter().map(LOp::Release));
            if ops.is_empty() {
                return (to, args);
            }
            let unwind = f.blocks[bi].unwind;
            f.blocks.push(LBlock {
                params: Vec::new(),
                ops,
                term: LTerm::Jump { to, args },
                unwind,
                unwind_releases: Vec::new(),
            });
            ((f.blocks.len() - 1) as LBlockId, Vec::new())
        };
        let (then_to, then_args) = route(then_to, then_args, f);
        let (else_to, else_args) = route(else_to, else_args, f);
        f.blocks[bi].term = LTerm::Branch {
            cond,
            then_to,
            then_args,
            else_to,
            else_args,
        };
    }
}

fn edge_arg_list(term: &LTerm) -> Vec<LValue> {
    match term {
        LTerm::Jump { args, .. } => args.clone(),
        LTerm::Branch {
            then_args,
            else_args,
            ..
        } => then_args.iter().chain(else_args.iter()).copied().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::testutil::lower_source as lower;

    fn func<'a>(m: &'a LirModule, name: &str) -> &'a LirFunc {
        m.functions
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("function {} missing", name))
    }

    #[test]
    fn test_int_add_selected_for_typed_operands() {
        let m = lower("def f(a, b):\n    return a + b\n\nx = f(1, 2)\n");
        let spec = m
            .functions
            .iter()
            .find(|f| f.name.contains("$spec"))
            .expect("specialized variant");
        let uses_int_add = spec.blocks.iter().flat_map(|b| &b.ops).any(|op| {
            matches!(op, LOp::CallIntrinsic { id: Intrinsic::IntAdd, .. })
        });
        assert!(uses_int_add);
    }

    /// The shape-specialization scenario: a record parameter with
    /// constant keys compiles to fixed-offset loads, with no map-get
    /// intrinsic anywhere in the specialized body.
    #[test]
    fn test_shaped_access_is_fixed_offset() {
        let m = lower(
            "def f(p):\n    return p[\"x\"] + p[\"y\"]\n\nr = f({\"x\": 3, \"y\": 4})\n",
        );
        let spec = m
            .functions
            .iter()
            .find(|f| f.name.contains("$spec"))
            .expect("specialized variant");
        let field_loads = spec
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .filter(|op| matches!(op, LOp::LoadField { .. }))
            .count();
        assert_eq!(field_loads, 2);
        let map_gets = spec.blocks.iter().flat_map(|b| &b.ops).any(|op| {
            matches!(op, LOp::CallIntrinsic { id: Intrinsic::MapGet, .. })
        });
        assert!(!map_gets, "shaped reads must not hash-lookup");
    }

    #[test]
    fn test_allocation_gets_release() {
        let m = lower("def f():\n    xs = [1, 2]\n    return 0\n\nr = f()\n");
        let f = func(&m, "test.f");
        let allocs = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .filter(|op| matches!(op, LOp::AllocList { .. }))
            .count();
        let releases = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .filter(|op| matches!(op, LOp::Release(_)))
            .count();
        assert_eq!(allocs, 1);
        assert!(releases >= 1, "the dead list must be released");
    }

    #[test]
    fn test_returned_value_not_released() {
        let m = lower("def f():\n    xs = [1]\n    return xs\n\nr = f()\n");
        let f = func(&m, "test.f");
        // Find the list's destination, then assert no release on it.
        let list_dst = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .find_map(|op| match op {
                LOp::AllocList { dst, .. } => Some(*dst),
                _ => None,
            })
            .expect("list allocation present");
        let released = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op, LOp::Release(v) if *v == list_dst));
        assert!(!released, "ownership of the return value transfers out");
    }

    #[test]
    fn test_raising_ops_split_blocks() {
        let m = lower("def f(m, k):\n    return m[k]\n\nr = f({\"a\": 1}, \"a\")\n");
        for f in &m.functions {
            for block in &f.blocks {
                let raising = block.ops.iter().filter(|op| op.may_raise()).count();
                assert!(raising <= 1, "{}: more than one raising op per block", f.name);
                if raising == 1 {
                    let pos = block.ops.iter().position(|op| op.may_raise()).unwrap();
                    let after: usize = block.ops[pos + 1..]
                        .iter()
                        .filter(|op| !matches!(op, LOp::Retain(_) | LOp::Release(_)))
                        .count();
                    assert_eq!(after, 0, "raising op must end its block");
                }
            }
        }
    }

    #[test]
    fn test_dynamic_attr_uses_general_path() {
        let m = lower(
            "class P:\n    def __init__(self, x):\n        self.x = x\n\ndef f(p):\n    return p.x\n\nq = P(1)\nr = f(q)\n",
        );
        // f's parameter is Class(0) via the call site, so the load is a
        // fixed offset.
        let f = func(&m, "test.f");
        let has_field_load = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op, LOp::LoadField { .. }));
        assert!(has_field_load);
    }
}
