//! HIR to TIR: SSA construction
//!
//! Classic on-the-fly SSA construction over block parameters: local
//! variables are resolved per block, merges materialize as block
//! parameters, and unsealed blocks (loop headers) collect incomplete
//! parameters that are resolved when the last predecessor is known.
//!
//! Exception handling uses snapshot semantics: a handler block resolves
//! locals as they were at try entry (the same state a frame descriptor
//! captures), which keeps every SSA use dominated by its definition
//! without modeling mid-block unwind edges.

use std::collections::{HashMap, HashSet};

use crate::diag::{CompileError, Stage};
use crate::hir::{HConst, HExpr, HHandler, HStmt, HirFunc, HirModule};
use crate::source::Span;

use super::{Block, BlockId, Dispatch, Op, OpKind, TConst, Term, TirClass, TirFunc, TirModule, ValueId};

type BResult<T> = Result<T, CompileError>;

pub fn build_module(hir: &HirModule) -> BResult<TirModule> {
    // Name resolution tables shared by every function body.
    let mut func_index: HashMap<String, usize> = HashMap::new();
    for (i, f) in hir.functions.iter().enumerate() {
        func_index.insert(f.name.clone(), i);
        if f.self_class.is_none() {
            if let Some(short) = f.name.rsplit('.').next() {
                func_index.entry(short.to_string()).or_insert(i);
            }
        }
    }
    let mut class_index: HashMap<String, u32> = HashMap::new();
    for (i, c) in hir.classes.iter().enumerate() {
        class_index.insert(c.name.clone(), i as u32);
    }

    let mut functions = Vec::new();
    for f in &hir.functions {
        functions.push(FuncBuilder::new(hir, &func_index, &class_index, f).build()?);
    }
    let classes = hir
        .classes
        .iter()
        .map(|c| TirClass {
            name: c.name.clone(),
            fields: c.fields.clone(),
            methods: c.methods.clone(),
        })
        .collect();

    Ok(TirModule {
        name: hir.name.clone(),
        file: hir.file.clone(),
        imports: hir.imports.clone(),
        functions,
        classes,
        shapes: Vec::new(),
        entry: hir.entry,
    })
}

struct FuncBuilder<'a> {
    hir: &'a HirModule,
    func_index: &'a HashMap<String, usize>,
    class_index: &'a HashMap<String, u32>,
    src: &'a HirFunc,
    f: TirFunc,
    current: BlockId,
    /// var -> block -> value
    defs: HashMap<String, HashMap<BlockId, ValueId>>,
    sealed: HashSet<BlockId>,
    /// Incomplete block parameters of unsealed blocks: (var, param).
    incomplete: HashMap<BlockId, Vec<(String, ValueId)>>,
    preds: HashMap<BlockId, Vec<BlockId>>,
    /// (continue target, break target)
    loops: Vec<(BlockId, BlockId)>,
    handlers: Vec<BlockId>,
    /// Pending finally bodies, innermost last.
    finallys: Vec<Vec<HStmt>>,
    /// Handler-entry local snapshots: block -> var -> value.
    handler_snapshots: HashMap<BlockId, HashMap<String, ValueId>>,
    /// True once the current block has a real terminator.
    terminated: bool,
}

impl<'a> FuncBuilder<'a> {
    fn new(
        hir: &'a HirModule,
        func_index: &'a HashMap<String, usize>,
        class_index: &'a HashMap<String, u32>,
        src: &'a HirFunc,
    ) -> Self {
        let mut f = TirFunc {
            name: src.name.clone(),
            identity: src.symbol.identity.clone(),
            params: Vec::new(),
            param_names: src.params.clone(),
            blocks: Vec::new(),
            value_tys: Vec::new(),
            entry: 0,
            is_async: src.is_async,
            is_generator: src.is_generator,
            resume_points: Vec::new(),
            frames: Vec::new(),
            self_class: src.self_class,
            span: src.span.clone(),
        };
        f.blocks.push(Block {
            params: Vec::new(),
            ops: Vec::new(),
            term: Term::Unterminated,
            handler: None,
        });
        FuncBuilder {
            hir,
            func_index,
            class_index,
            src,
            f,
            current: 0,
            defs: HashMap::new(),
            sealed: HashSet::new(),
            incomplete: HashMap::new(),
            preds: HashMap::new(),
            loops: Vec::new(),
            handlers: Vec::new(),
            finallys: Vec::new(),
            handler_snapshots: HashMap::new(),
            terminated: false,
        }
    }

    fn build(mut self) -> BResult<TirFunc> {
        self.sealed.insert(0);
        // Entry state 0 of a generator is the function entry itself.
        if self.src.is_generator {
            self.f.resume_points.push(0);
        }
        for (i, name) in self.src.params.iter().enumerate() {
            let v = self.f.new_value();
            self.f.blocks[0].params.push(v);
            self.f.params.push(v);
            self.write_var(name, 0, v);
            let _ = i;
        }
        let body = self.src.body.clone();
        for stmt in &body {
            self.build_stmt(stmt)?;
            if self.terminated {
                break;
            }
        }
        if !self.terminated {
            let none = self.emit_const(TConst::None, &self.src.span.clone());
            self.set_term(Term::Return(none));
        }
        // Any block left unterminated is an unreachable continuation;
        // normalize it to return null so the CFG stays well-formed.
        for i in 0..self.f.blocks.len() {
            if matches!(self.f.blocks[i].term, Term::Unterminated) {
                self.f.value_tys.push(super::types::Ty::Never);
                let v = (self.f.value_tys.len() - 1) as ValueId;
                self.f.blocks[i].ops.push(Op {
                    dst: Some(v),
                    kind: OpKind::Const(TConst::None),
                    span: self.src.span.clone(),
                });
                self.f.blocks[i].term = Term::Return(v);
            }
        }
        Ok(self.f)
    }

    // =========================================================================
    // SSA plumbing
    // =========================================================================

    fn new_block(&mut self) -> BlockId {
        let handler = self.handlers.last().copied();
        self.f.blocks.push(Block {
            params: Vec::new(),
            ops: Vec::new(),
            term: Term::Unterminated,
            handler,
        });
        (self.f.blocks.len() - 1) as BlockId
    }

    fn seal(&mut self, block: BlockId) {
        if self.sealed.contains(&block) {
            return;
        }
        if let Some(pending) = self.incomplete.remove(&block) {
            for (var, param) in pending {
                self.fill_param(block, &var, param);
            }
        }
        self.sealed.insert(block);
    }

    /// Resolve an incomplete parameter: read the variable in every
    /// predecessor and append the edge argument.
    fn fill_param(&mut self, block: BlockId, var: &str, _param: ValueId) {
        let preds = self.preds.get(&block).cloned().unwrap_or_default();
        for pred in preds {
            let arg = self.read_var(var, pred);
            self.add_edge_arg(pred, block, arg);
        }
    }

    fn add_edge_arg(&mut self, pred: BlockId, target: BlockId, arg: ValueId) {
        match &mut self.f.blocks[pred as usize].term {
            Term::Jump { to, args } if *to == target => args.push(arg),
            Term::Branch {
                then_to,
                then_args,
                else_to,
                else_args,
                ..
            } => {
                if *then_to == target {
                    then_args.push(arg);
                }
                if *else_to == target {
                    else_args.push(arg);
                }
            }
            Term::Yield { resume, .. } if *resume == target => {
                // The resume edge's single argument is the sent value,
                // provided by the scheduler; locals resolve through the
                // frame, so nothing is appended here.
            }
            _ => {}
        }
    }

    fn write_var(&mut self, var: &str, block: BlockId, value: ValueId) {
        self.defs
            .entry(var.to_string())
            .or_default()
            .insert(block, value);
    }

    fn read_var(&mut self, var: &str, block: BlockId) -> ValueId {
        if let Some(v) = self.defs.get(var).and_then(|m| m.get(&block)) {
            return *v;
        }
        // Handler blocks resolve through their try-entry snapshot.
        if let Some(snapshot) = self.handler_snapshots.get(&block) {
            if let Some(v) = snapshot.get(var) {
                let v = *v;
                self.write_var(var, block, v);
                return v;
            }
        }
        let v = if !self.sealed.contains(&block) {
            let param = self.f.new_value();
            self.f.blocks[block as usize].params.push(param);
            self.incomplete
                .entry(block)
                .or_default()
                .push((var.to_string(), param));
            param
        } else {
            let preds = self.preds.get(&block).cloned().unwrap_or_default();
            match preds.len() {
                0 => {
                    // Unbound here (unreachable continuation or a name
                    // never assigned on this path): null constant.
                    let v = self.f.new_value();
                    self.f.blocks[block as usize].ops.insert(
                        0,
                        Op {
                            dst: Some(v),
                            kind: OpKind::Const(TConst::None),
                            span: self.src.span.clone(),
                        },
                    );
                    v
                }
                1 => {
                    let p = preds[0];
                    self.read_var(var, p)
                }
                _ => {
                    let param = self.f.new_value();
                    self.f.blocks[block as usize].params.push(param);
                    // Record before recursing so cycles terminate.
                    self.write_var(var, block, param);
                    self.fill_param(block, var, param);
                    param
                }
            }
        };
        self.write_var(var, block, v);
        v
    }

    fn set_term(&mut self, term: Term) {
        for succ in term.successors() {
            self.preds.entry(succ).or_default().push(self.current);
        }
        self.f.blocks[self.current as usize].term = term;
        self.terminated = true;
    }

    /// Switch to a new current block (after a terminator).
    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
        self.terminated = false;
    }

    fn emit(&mut self, kind: OpKind, span: &Span) -> ValueId {
        let dst = self.f.new_value();
        self.f.blocks[self.current as usize].ops.push(Op {
            dst: Some(dst),
            kind,
            span: span.clone(),
        });
        dst
    }

    fn emit_void(&mut self, kind: OpKind, span: &Span) {
        self.f.blocks[self.current as usize].ops.push(Op {
            dst: None,
            kind,
            span: span.clone(),
        });
    }

    fn emit_const(&mut self, c: TConst, span: &Span) -> ValueId {
        self.emit(OpKind::Const(c), span)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn build_block_stmts(&mut self, stmts: &[HStmt]) -> BResult<()> {
        for stmt in stmts {
            if self.terminated {
                break;
            }
            self.build_stmt(stmt)?;
        }
        Ok(())
    }

    fn build_stmt(&mut self, stmt: &HStmt) -> BResult<()> {
        match stmt {
            HStmt::Expr(e) => {
                self.build_expr(e)?;
            }
            HStmt::Assign { name, value } => {
                let v = self.build_expr(value)?;
                self.write_var(name, self.current, v);
            }
            HStmt::StoreIndex { obj, index, value } => {
                let o = self.build_expr(obj)?;
                let i = self.build_expr(index)?;
                let v = self.build_expr(value)?;
                self.emit_void(
                    OpKind::SetItem {
                        obj: o,
                        index: i,
                        value: v,
                    },
                    &self.src.span.clone(),
                );
            }
            HStmt::StoreAttr { obj, name, value } => {
                let o = self.build_expr(obj)?;
                let v = self.build_expr(value)?;
                self.emit_void(
                    OpKind::SetAttr {
                        obj: o,
                        name: name.clone(),
                        value: v,
                    },
                    &self.src.span.clone(),
                );
            }
            HStmt::If { cond, then, orelse } => {
                let c = self.build_expr(cond)?;
                let then_b = self.new_block();
                let else_b = self.new_block();
                let join_b = self.new_block();
                self.set_term(Term::Branch {
                    cond: c,
                    then_to: then_b,
                    then_args: Vec::new(),
                    else_to: else_b,
                    else_args: Vec::new(),
                });
                self.seal(then_b);
                self.seal(else_b);

                self.switch_to(then_b);
                self.build_block_stmts(then)?;
                if !self.terminated {
                    self.set_term(Term::Jump {
                        to: join_b,
                        args: Vec::new(),
                    });
                }
                self.switch_to(else_b);
                self.build_block_stmts(orelse)?;
                if !self.terminated {
                    self.set_term(Term::Jump {
                        to: join_b,
                        args: Vec::new(),
                    });
                }
                self.seal(join_b);
                self.switch_to(join_b);
            }
            HStmt::While { cond, body } => {
                let header = self.new_block();
                self.set_term(Term::Jump {
                    to: header,
                    args: Vec::new(),
                });
                self.switch_to(header);
                let c = self.build_expr(cond)?;
                let body_b = self.new_block();
                let exit_b = self.new_block();
                self.set_term(Term::Branch {
                    cond: c,
                    then_to: body_b,
                    then_args: Vec::new(),
                    else_to: exit_b,
                    else_args: Vec::new(),
                });
                self.seal(body_b);
                self.switch_to(body_b);
                self.loops.push((header, exit_b));
                self.build_block_stmts(body)?;
                self.loops.pop();
                if !self.terminated {
                    self.set_term(Term::Jump {
                        to: header,
                        args: Vec::new(),
                    });
                }
                // All back edges are in; the header can resolve its
                // incomplete parameters now.
                self.seal(header);
                self.seal(exit_b);
                self.switch_to(exit_b);
            }
            HStmt::Break => {
                self.run_pending_finallys()?;
                let (_, exit_b) = *self
                    .loops
                    .last()
                    .ok_or_else(|| self.err("break outside loop"))?;
                self.set_term(Term::Jump {
                    to: exit_b,
                    args: Vec::new(),
                });
                let dead = self.new_block();
                self.seal(dead);
                self.switch_to(dead);
                self.terminated = true;
            }
            HStmt::Continue => {
                self.run_pending_finallys()?;
                let (header, _) = *self
                    .loops
                    .last()
                    .ok_or_else(|| self.err("continue outside loop"))?;
                self.set_term(Term::Jump {
                    to: header,
                    args: Vec::new(),
                });
                let dead = self.new_block();
                self.seal(dead);
                self.switch_to(dead);
                self.terminated = true;
            }
            HStmt::Return(e) => {
                let v = self.build_expr(e)?;
                self.run_pending_finallys()?;
                self.set_term(Term::Return(v));
            }
            HStmt::Raise { exc, cause, span } => {
                let mut err = self.build_expr(exc)?;
                if let Some(cause) = cause {
                    let c = self.build_expr(cause)?;
                    err = self.emit(OpKind::SetErrCause { err, cause: c }, span);
                }
                self.set_term(Term::Raise(err));
            }
            HStmt::Try {
                body,
                handlers,
                finally,
            } => {
                self.build_try(body, handlers, finally)?;
            }
        }
        Ok(())
    }

    /// Inline pending finally bodies (innermost first) before an early
    /// exit. Their own statements run with the finally popped so a
    /// nested return cannot recurse.
    fn run_pending_finallys(&mut self) -> BResult<()> {
        let pending = self.finallys.clone();
        for fin in pending.iter().rev() {
            let saved = std::mem::take(&mut self.finallys);
            self.build_block_stmts(fin)?;
            self.finallys = saved;
            if self.terminated {
                break;
            }
        }
        Ok(())
    }

    fn build_try(
        &mut self,
        body: &[HStmt],
        handlers: &[HHandler],
        finally: &[HStmt],
    ) -> BResult<()> {
        // Snapshot locals at try entry for handler-side resolution.
        // Sorted: snapshot order must not depend on map iteration.
        let mut vars: Vec<String> = self.defs.keys().cloned().collect();
        vars.sort();
        let mut snapshot = HashMap::new();
        for var in vars {
            let v = self.read_var(&var, self.current);
            snapshot.insert(var, v);
        }

        let handler_b = self.new_block();
        let err_param = self.f.new_value();
        self.f.blocks[handler_b as usize].params.push(err_param);
        self.handler_snapshots.insert(handler_b, snapshot);
        self.sealed.insert(handler_b); // resolved via snapshot, not preds

        let after_b = self.new_block();

        // Body runs under the handler, with the finally pending for
        // early exits.
        self.handlers.push(handler_b);
        if !finally.is_empty() {
            self.finallys.push(finally.to_vec());
        }
        let body_entry = self.new_block();
        self.set_term(Term::Jump {
            to: body_entry,
            args: Vec::new(),
        });
        self.seal(body_entry);
        self.switch_to(body_entry);
        self.build_block_stmts(body)?;
        if !finally.is_empty() {
            self.finallys.pop();
        }
        self.handlers.pop();
        if !self.terminated {
            // Normal exit: run the finally, then continue.
            self.build_block_stmts(finally)?;
            if !self.terminated {
                self.set_term(Term::Jump {
                    to: after_b,
                    args: Vec::new(),
                });
            }
        }

        // Handler dispatch chain.
        self.switch_to(handler_b);
        let span = self.src.span.clone();
        let mut matched_any_catchall = false;
        for h in handlers {
            let test = match h.kind {
                None => {
                    matched_any_catchall = true;
                    self.emit_const(TConst::Bool(true), &span)
                }
                Some(kind) => {
                    let kind_name = self.emit_const(TConst::Str(kind.name().to_string()), &span);
                    self.emit(
                        OpKind::ErrIsA {
                            err: err_param,
                            kind: kind_name,
                        },
                        &span,
                    )
                }
            };
            let h_body = self.new_block();
            let next = self.new_block();
            self.set_term(Term::Branch {
                cond: test,
                then_to: h_body,
                then_args: Vec::new(),
                else_to: next,
                else_args: Vec::new(),
            });
            self.seal(h_body);
            self.seal(next);
            self.switch_to(h_body);
            if let Some(bind) = &h.bind {
                self.write_var(bind, self.current, err_param);
            }
            self.build_block_stmts(&h.body)?;
            if !self.terminated {
                self.build_block_stmts(finally)?;
                if !self.terminated {
                    self.set_term(Term::Jump {
                        to: after_b,
                        args: Vec::new(),
                    });
                }
            }
            self.switch_to(next);
            // Handler test blocks resolve locals like the handler entry.
            let snap = self.handler_snapshots[&handler_b].clone();
            self.handler_snapshots.insert(next, snap);
        }
        if !matched_any_catchall {
            // Unmatched error: run the finally, then keep unwinding.
            self.build_block_stmts(finally)?;
            if !self.terminated {
                self.set_term(Term::Raise(err_param));
            }
        } else if !self.terminated {
            self.build_block_stmts(finally)?;
            if !self.terminated {
                self.set_term(Term::Raise(err_param));
            }
        }

        self.seal(after_b);
        self.switch_to(after_b);
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn build_expr(&mut self, e: &HExpr) -> BResult<ValueId> {
        let span = self.src.span.clone();
        Ok(match e {
            HExpr::Const(c) => {
                let tc = match c {
                    HConst::Int(n) => TConst::Int(*n),
                    HConst::BigInt(s) => TConst::BigInt(s.clone()),
                    HConst::Float(f) => TConst::Float(*f),
                    HConst::Str(s) => TConst::Str(s.clone()),
                    HConst::Bool(b) => TConst::Bool(*b),
                    HConst::None => TConst::None,
                };
                self.emit_const(tc, &span)
            }
            HExpr::Name(n, _) => self.read_var(n, self.current),
            HExpr::FuncRef(name) => {
                let idx = *self
                    .func_index
                    .get(name)
                    .ok_or_else(|| self.err(format!("unknown function '{}'", name)))?;
                self.emit(OpKind::FuncRef(idx), &span)
            }
            HExpr::MakeTuple(items) => {
                let vs = self.build_exprs(items)?;
                self.emit(OpKind::MakeTuple(vs), &span)
            }
            HExpr::MakeList(items) => {
                let vs = self.build_exprs(items)?;
                self.emit(OpKind::MakeList(vs), &span)
            }
            HExpr::MakeSet(items) => {
                let vs = self.build_exprs(items)?;
                self.emit(OpKind::MakeSet(vs), &span)
            }
            HExpr::MakeMap(pairs) => {
                let mut keys = Vec::new();
                let mut values = Vec::new();
                for (k, v) in pairs {
                    keys.push(self.build_expr(k)?);
                    values.push(self.build_expr(v)?);
                }
                self.emit(OpKind::MakeMap { keys, values }, &span)
            }
            HExpr::Binary {
                op,
                left,
                right,
                span,
            } => {
                let l = self.build_expr(left)?;
                let r = self.build_expr(right)?;
                self.emit(OpKind::Binary { op: *op, l, r }, span)
            }
            HExpr::Compare {
                op,
                left,
                right,
                span,
            } => {
                let l = self.build_expr(left)?;
                let r = self.build_expr(right)?;
                self.emit(OpKind::Compare { op: *op, l, r }, span)
            }
            HExpr::And(l, r) => self.build_short_circuit(l, r, true)?,
            HExpr::Or(l, r) => self.build_short_circuit(l, r, false)?,
            HExpr::Not(x) => {
                let v = self.build_expr(x)?;
                self.emit(OpKind::Not(v), &span)
            }
            HExpr::Neg(x, span) => {
                let v = self.build_expr(x)?;
                self.emit(OpKind::Neg(v), span)
            }
            HExpr::CallFunc { name, args, span } => {
                let args = self.build_exprs(args)?;
                if let Some(class) = self.class_index.get(name) {
                    self.emit(
                        OpKind::MakeInstance {
                            class: *class,
                            args,
                        },
                        span,
                    )
                } else {
                    let func = *self
                        .func_index
                        .get(name)
                        .ok_or_else(|| self.err(format!("unknown function '{}'", name)))?;
                    self.emit(
                        OpKind::Call {
                            func,
                            args,
                            dispatch: Dispatch::Unresolved,
                        },
                        span,
                    )
                }
            }
            HExpr::CallValue { callee, args, span } => {
                let c = self.build_expr(callee)?;
                let args = self.build_exprs(args)?;
                self.emit(OpKind::CallValue { callee: c, args }, span)
            }
            HExpr::CallMethod {
                obj,
                name,
                args,
                span,
            } => {
                let o = self.build_expr(obj)?;
                let args = self.build_exprs(args)?;
                self.emit(
                    OpKind::CallMethod {
                        obj: o,
                        name: name.clone(),
                        args,
                        resolved: None,
                    },
                    span,
                )
            }
            HExpr::Intrinsic { id, args, span } => {
                let args = self.build_exprs(args)?;
                self.emit(OpKind::Intrinsic { id: *id, args }, span)
            }
            HExpr::SeqLen(x, span) => {
                let v = self.build_expr(x)?;
                self.emit(OpKind::SeqLen(v), span)
            }
            HExpr::Index { obj, index, span } => {
                let o = self.build_expr(obj)?;
                let i = self.build_expr(index)?;
                self.emit(OpKind::GetItem { obj: o, index: i }, span)
            }
            HExpr::Attr { obj, name, span } => {
                let o = self.build_expr(obj)?;
                self.emit(
                    OpKind::GetAttr {
                        obj: o,
                        name: name.clone(),
                    },
                    span,
                )
            }
            HExpr::IterAcquire(x, span) => {
                let v = self.build_expr(x)?;
                self.emit(OpKind::IterNew(v), span)
            }
            HExpr::IterStep(x) => {
                let v = self.build_expr(x)?;
                self.emit(OpKind::IterNext(v), &span)
            }
            HExpr::Await(x, span) => {
                let v = self.build_expr(x)?;
                let resume = self.new_block();
                let result = self.f.new_value();
                self.f.blocks[resume as usize].params.push(result);
                self.set_term(Term::Await { value: v, resume });
                self.seal(resume);
                let _ = span;
                self.switch_to(resume);
                result
            }
            HExpr::Yield(x, span) => {
                if !self.src.is_generator && !self.src.is_async {
                    return Err(CompileError::at(
                        Stage::Lower,
                        span.clone(),
                        "yield outside generator function",
                    ));
                }
                let v = self.build_expr(x)?;
                let resume = self.new_block();
                let sent = self.f.new_value();
                self.f.blocks[resume as usize].params.push(sent);
                self.f.resume_points.push(resume);
                self.set_term(Term::Yield { value: v, resume });
                self.seal(resume);
                self.switch_to(resume);
                sent
            }
        })
    }

    fn build_exprs(&mut self, items: &[HExpr]) -> BResult<Vec<ValueId>> {
        items.iter().map(|e| self.build_expr(e)).collect()
    }

    /// `and`/`or` with operand-value semantics: the merge block takes
    /// the chosen operand as its parameter.
    fn build_short_circuit(&mut self, l: &HExpr, r: &HExpr, is_and: bool) -> BResult<ValueId> {
        let lv = self.build_expr(l)?;
        let rhs_b = self.new_block();
        let join_b = self.new_block();
        if is_and {
            // l and r: falsy l short-circuits with l.
            self.set_term(Term::Branch {
                cond: lv,
                then_to: rhs_b,
                then_args: Vec::new(),
                else_to: join_b,
                else_args: vec![lv],
            });
        } else {
            self.set_term(Term::Branch {
                cond: lv,
                then_to: join_b,
                then_args: vec![lv],
                else_to: rhs_b,
                else_args: Vec::new(),
            });
        }
        let result = self.f.new_value();
        self.f.blocks[join_b as usize].params.push(result);
        self.seal(rhs_b);
        self.switch_to(rhs_b);
        let rv = self.build_expr(r)?;
        self.set_term(Term::Jump {
            to: join_b,
            args: vec![rv],
        });
        self.seal(join_b);
        self.switch_to(join_b);
        Ok(result)
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(Stage::Lower, self.src.span.clone(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::lower_module;
    use crate::parser::parse;

    fn build(src: &str) -> TirModule {
        let ast = parse(src, "test.mt", "test").expect("parse");
        let hir = lower_module(&ast).expect("lower");
        build_module(&hir).expect("build")
    }

    /// Every value has exactly one defining operation and every block
    /// argument count matches the target's parameter count.
    fn check_ssa(f: &TirFunc) {
        let mut defined = vec![false; f.value_tys.len()];
        for p in &f.params {
            assert!(!defined[*p as usize], "param defined twice");
            defined[*p as usize] = true;
        }
        for block in &f.blocks {
            for p in &block.params {
                if !f.params.contains(p) {
                    assert!(!defined[*p as usize], "block param v{} defined twice", p);
                    defined[*p as usize] = true;
                }
            }
            for op in &block.ops {
                if let Some(d) = op.dst {
                    assert!(!defined[d as usize], "value v{} defined twice", d);
                    defined[d as usize] = true;
                }
            }
        }
        for block in &f.blocks {
            for succ in block.term.successors() {
                let args = match &block.term {
                    Term::Jump { args, .. } => args.len(),
                    Term::Branch {
                        then_to,
                        then_args,
                        else_args,
                        ..
                    } => {
                        if *then_to == succ {
                            then_args.len()
                        } else {
                            else_args.len()
                        }
                    }
                    Term::Yield { .. } | Term::Await { .. } => 1,
                    _ => 0,
                };
                let want = f.blocks[succ as usize].params.len();
                assert_eq!(
                    args, want,
                    "edge to b{} passes {} args for {} params in {}",
                    succ, args, want, f.name
                );
            }
        }
    }

    #[test]
    fn test_straightline_ssa() {
        let t = build("def f(a, b):\n    c = a + b\n    return c * a\n");
        let f = &t.functions[0];
        assert_eq!(f.params.len(), 2);
        check_ssa(f);
    }

    #[test]
    fn test_if_merge_creates_block_param() {
        let t = build(
            "def f(a):\n    if a:\n        x = 1\n    else:\n        x = 2\n    return x\n",
        );
        let f = &t.functions[0];
        check_ssa(f);
        // The merge of x must be a block parameter somewhere.
        let has_merge_param = f
            .blocks
            .iter()
            .enumerate()
            .any(|(i, b)| i != f.entry as usize && !b.params.is_empty());
        assert!(has_merge_param);
    }

    #[test]
    fn test_while_loop_header_params() {
        let t = build("def f(n):\n    i = 0\n    while i < n:\n        i = i + 1\n    return i\n");
        let f = &t.functions[0];
        check_ssa(f);
        // The loop-carried i becomes a header parameter.
        let has_loop_param = f.blocks.iter().any(|b| {
            !b.params.is_empty()
                && matches!(b.term, Term::Branch { .. })
        });
        assert!(has_loop_param);
    }

    #[test]
    fn test_short_circuit_produces_merge() {
        let t = build("def f(a, b):\n    return a and b\n");
        check_ssa(&t.functions[0]);
    }

    #[test]
    fn test_try_handler_block_wired() {
        let t = build(
            "def f(m, k):\n    try:\n        return m[k]\n    except KeyError:\n        return None\n",
        );
        let f = &t.functions[0];
        check_ssa(f);
        // Some block must carry a handler edge.
        assert!(f.blocks.iter().any(|b| b.handler.is_some()));
        // And some op must be the kind test.
        let has_err_test = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op.kind, OpKind::ErrIsA { .. }));
        assert!(has_err_test);
    }

    #[test]
    fn test_generator_resume_points() {
        let t = build("def g(n):\n    for i in range(n):\n        yield i\n");
        let f = &t.functions[0];
        assert!(f.is_generator);
        // Entry state plus one yield.
        assert_eq!(f.resume_points.len(), 2);
        assert!(f
            .blocks
            .iter()
            .any(|b| matches!(b.term, Term::Yield { .. })));
        check_ssa(f);
    }

    #[test]
    fn test_class_construction_op() {
        let t = build(
            "class P:\n    def __init__(self, x):\n        self.x = x\n\ndef f():\n    return P(3)\n",
        );
        let f = t
            .functions
            .iter()
            .find(|f| f.name == "test.f")
            .expect("f present");
        let has_make = f
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|op| matches!(op.kind, OpKind::MakeInstance { .. }));
        assert!(has_make);
    }

    #[test]
    fn test_finally_inlined_on_return() {
        let t = build(
            "def f(r):\n    try:\n        return 1\n    finally:\n        print(r)\n",
        );
        let f = &t.functions[0];
        check_ssa(f);
        // The print intrinsic must appear before some Return.
        let mut saw_print_block_with_return = false;
        for b in &f.blocks {
            let has_print = b
                .ops
                .iter()
                .any(|op| matches!(op.kind, OpKind::Intrinsic { id, .. } if id == molt_core::Intrinsic::Print));
            if has_print && matches!(b.term, Term::Return(_)) {
                saw_print_block_with_return = true;
            }
        }
        assert!(saw_print_block_with_return);
    }
}
