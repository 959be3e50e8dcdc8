//! Native backend
//!
//! Emits LLVM IR text (opaque-pointer form) from LIR and links the
//! result against the runtime static library with clang.
//!
//! ## Calling convention
//!
//! Every compiled function is a resumable step function:
//!
//! ```text
//! define i32 @molt_fn_N(ptr %frame, ptr %out)
//! ```
//!
//! `frame[0]` holds the resume state, `frame[1]` the resume payload,
//! and every LIR value has a fixed frame slot above that (the frame IS
//! the frame descriptor's storage). Suspension points (yield, await,
//! suspending intrinsics, and nested calls whose callee suspended)
//! store their state and return a step code from
//! [`molt_core::abi::step`]; the scheduler re-enters with the payload
//! in `frame[1]`. Clang's optimizer is responsible for keeping the
//! slot traffic in registers on the non-suspending fast paths.
//!
//! The emitted text is deterministic: stable symbol order, no
//! timestamps, content-addressed string constants.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use molt_core::{Intrinsic, RawValue};

use crate::config::BuildConfig;
use crate::diag::{CompileError, Stage};
use crate::lir::{GuardTy, LBlockId, LOp, LTerm, LValue, LirFunc, LirModule};

/// Maximum frame slots a dynamically callable function may use (the
/// runtime's fixed frame allocation for callable values).
const FRAME_BUDGET: usize = 256;

/// Minimum clang major version; the emitted IR uses opaque pointers.
const MIN_CLANG_VERSION: u32 = 15;

static CLANG_VERSION_CHECKED: OnceLock<Result<u32, String>> = OnceLock::new();

type NResult<T> = Result<T, CompileError>;

fn backend_err(message: impl Into<String>) -> CompileError {
    CompileError::new(Stage::Backend, message, None)
}

/// Suspending intrinsics become scheduler steps, not runtime calls.
fn step_code_of(id: Intrinsic) -> Option<i32> {
    use molt_core::abi::step;
    match id {
        Intrinsic::TaskSleep => Some(step::SLEEP),
        Intrinsic::TaskYield => Some(step::YIELD_NOW),
        Intrinsic::TaskJoin => Some(step::JOIN),
        Intrinsic::ChanSend => Some(step::CHAN_SEND),
        Intrinsic::ChanRecv => Some(step::CHAN_RECV),
        _ => None,
    }
}

pub fn emit_ir(lir: &LirModule) -> NResult<String> {
    let mut e = Emitter {
        lir,
        out: String::new(),
        strings: Vec::new(),
    };
    e.emit_module()?;
    Ok(e.finish())
}

struct Emitter<'a> {
    lir: &'a LirModule,
    out: String,
    /// Interned string constants: (name, bytes).
    strings: Vec<(String, Vec<u8>)>,
}

impl<'a> Emitter<'a> {
    fn intern_str(&mut self, s: &str) -> (String, usize) {
        let bytes = s.as_bytes().to_vec();
        if let Some((name, b)) = self.strings.iter().find(|(_, b)| *b == bytes) {
            return (name.clone(), b.len());
        }
        let name = format!("@str.{}", self.strings.len());
        let len = bytes.len();
        self.strings.push((name.clone(), bytes));
        (self.strings.last().expect("just pushed").0.clone(), len)
    }

    fn emit_module(&mut self) -> NResult<()> {
        let _ = writeln!(self.out, "; module {}", self.lir.name);
        self.emit_declares();
        for (i, f) in self.lir.functions.iter().enumerate() {
            self.emit_function(i, f)?;
        }
        self.emit_main()?;
        Ok(())
    }

    fn emit_declares(&mut self) {
        let decls = [
            "declare void @molt_rt_init(i16)",
            "declare i32 @molt_rt_run_toplevel(i32)",
            "declare void @molt_rt_register_function(i32, ptr)",
            "declare i32 @molt_rt_register_class(i32, ptr, ptr)",
            "declare i32 @molt_rt_register_shape(i32, ptr, ptr)",
            "declare i64 @molt_rt_int(i64)",
            "declare i64 @molt_rt_bigint_const(ptr, i64)",
            "declare i64 @molt_rt_str_const(ptr, i64)",
            "declare void @molt_rt_retain(i64)",
            "declare void @molt_rt_release(i64)",
            "declare i32 @molt_rt_intrinsic(i16, i32, ptr, ptr)",
            "declare i32 @molt_rt_truthy(i64)",
            "declare i64 @molt_rt_take_error_value()",
            "declare void @molt_rt_raise_value(i64)",
            "declare ptr @molt_rt_frame_alloc(i64)",
            "declare void @molt_rt_frame_free(ptr, i64)",
            "declare i64 @molt_rt_list(i32, ptr)",
            "declare i64 @molt_rt_tuple(i32, ptr)",
            "declare i32 @molt_rt_set(i32, ptr, ptr)",
            "declare i32 @molt_rt_map_new(i32, ptr, ptr, ptr)",
            "declare i64 @molt_rt_shaped_map(i32, i32, ptr)",
            "declare i64 @molt_rt_instance(i32, i32)",
            "declare i64 @molt_rt_load_field(i64, i32)",
            "declare void @molt_rt_store_field(i64, i32, i64)",
            "declare i64 @molt_rt_handle_resolve(i64)",
            "declare i64 @molt_rt_callable(i32)",
            "declare i64 @molt_rt_spawn_callable(i64)",
            "declare i32 @molt_rt_call_value(i64, i32, ptr, ptr)",
            "declare i32 @molt_rt_err_is_a(i64, ptr, i64)",
            "declare i64 @molt_rt_err_set_cause(i64, i64)",
            "declare i32 @molt_rt_guard(i64, i32, i32)",
            "declare i32 @molt_rt_parallel_for(i64, i64, i64)",
            "declare i32 @molt_rt_parallel_reduce(i64, i64, i64, i64, i64, ptr)",
        ];
        for d in decls {
            let _ = writeln!(self.out, "{}", d);
        }
        let _ = writeln!(self.out);
    }

    fn frame_slots(&self, f: &LirFunc) -> usize {
        // state + payload + values + one pointer slot per call site.
        2 + f.value_count as usize + call_site_count(f)
    }

    fn emit_function(&mut self, idx: usize, f: &'a LirFunc) -> NResult<()> {
        if self.frame_slots(f) > FRAME_BUDGET {
            return Err(backend_err(format!(
                "{}: frame exceeds the {}-slot budget",
                f.name, FRAME_BUDGET
            )));
        }
        let mut fe = FuncEmitter::new(self, idx, f);
        fe.emit()
    }

    /// Bootstrap: register shapes, classes, and functions, then drive
    /// the module entry on the scheduler.
    fn emit_main(&mut self) -> NResult<()> {
        // Shape/class name tables as globals.
        let mut tables = String::new();
        let mut shape_tables = Vec::new();
        for (si, shape) in self.lir.shapes.iter().enumerate() {
            let names: Vec<(String, usize)> =
                shape.iter().map(|k| self.intern_str(k)).collect();
            let ptrs: Vec<String> = names.iter().map(|(n, _)| format!("ptr {}", n)).collect();
            let lens: Vec<String> = names.iter().map(|(_, l)| format!("i64 {}", l)).collect();
            let _ = writeln!(
                tables,
                "@shape.{}.ptrs = private constant [{} x ptr] [{}]",
                si,
                shape.len(),
                ptrs.join(", ")
            );
            let _ = writeln!(
                tables,
                "@shape.{}.lens = private constant [{} x i64] [{}]",
                si,
                shape.len(),
                lens.join(", ")
            );
            shape_tables.push((si, shape.len()));
        }
        let mut class_tables = Vec::new();
        for (ci, class) in self.lir.classes.iter().enumerate() {
            let names: Vec<(String, usize)> =
                class.iter().map(|k| self.intern_str(k)).collect();
            let ptrs: Vec<String> = names.iter().map(|(n, _)| format!("ptr {}", n)).collect();
            let lens: Vec<String> = names.iter().map(|(_, l)| format!("i64 {}", l)).collect();
            let _ = writeln!(
                tables,
                "@class.{}.ptrs = private constant [{} x ptr] [{}]",
                ci,
                class.len().max(1),
                if ptrs.is_empty() {
                    "ptr null".to_string()
                } else {
                    ptrs.join(", ")
                }
            );
            let _ = writeln!(
                tables,
                "@class.{}.lens = private constant [{} x i64] [{}]",
                ci,
                class.len().max(1),
                if lens.is_empty() {
                    "i64 0".to_string()
                } else {
                    lens.join(", ")
                }
            );
            class_tables.push((ci, class.len()));
        }
        self.out.push_str(&tables);

        let _ = writeln!(self.out, "define i32 @main() {{");
        let _ = writeln!(self.out, "entry:");
        // Capability manifest mask baked into the artifact.
        let _ = writeln!(self.out, "  call void @molt_rt_init(i16 {})", self.caps_mask());
        for (si, len) in shape_tables {
            let _ = writeln!(
                self.out,
                "  %shape{} = call i32 @molt_rt_register_shape(i32 {}, ptr @shape.{}.ptrs, ptr @shape.{}.lens)",
                si, len, si, si
            );
        }
        for (ci, len) in class_tables {
            let _ = writeln!(
                self.out,
                "  %class{} = call i32 @molt_rt_register_class(i32 {}, ptr @class.{}.ptrs, ptr @class.{}.lens)",
                ci, len, ci, ci
            );
        }
        for i in 0..self.lir.functions.len() {
            let _ = writeln!(
                self.out,
                "  call void @molt_rt_register_function(i32 {}, ptr @molt_fn_{})",
                i, i
            );
        }
        let _ = writeln!(
            self.out,
            "  %code = call i32 @molt_rt_run_toplevel(i32 {})",
            self.lir.entry
        );
        let _ = writeln!(self.out, "  ret i32 %code");
        let _ = writeln!(self.out, "}}");
        Ok(())
    }

    fn caps_mask(&self) -> u16 {
        // Emitted as zero; build_native substitutes the manifest mask
        // so the IR text itself stays config-independent for tests.
        0
    }

    fn finish(self) -> String {
        let mut head = String::new();
        for (name, bytes) in &self.strings {
            let escaped: String = bytes
                .iter()
                .map(|b| {
                    if b.is_ascii_alphanumeric() || *b == b' ' || *b == b'_' || *b == b'.' {
                        (*b as char).to_string()
                    } else {
                        format!("\\{:02X}", b)
                    }
                })
                .collect();
            let _ = writeln!(
                head,
                "{} = private unnamed_addr constant [{} x i8] c\"{}\"",
                name,
                bytes.len(),
                escaped
            );
        }
        format!("{}\n{}", head, self.out)
    }
}

fn call_site_count(f: &LirFunc) -> usize {
    f.blocks
        .iter()
        .flat_map(|b| &b.ops)
        .filter(|op| {
            matches!(
                op,
                LOp::CallStatic { .. } | LOp::CallGuarded { .. }
            )
        })
        .count()
}

/// Per-function emission state.
struct FuncEmitter<'a, 'b> {
    parent: &'b mut Emitter<'a>,
    idx: usize,
    f: &'a LirFunc,
    body: String,
    tmp: u32,
    /// Resume state -> label.
    states: Vec<(u32, String)>,
    next_state: u32,
    /// Call-site frame-pointer slots, assigned in op order.
    call_slot: usize,
    /// Blocks that receive a resume payload into their first param.
    resume_blocks: Vec<LBlockId>,
}

impl<'a, 'b> FuncEmitter<'a, 'b> {
    fn new(parent: &'b mut Emitter<'a>, idx: usize, f: &'a LirFunc) -> Self {
        // Yield states are pre-assigned by the LIR resume table; other
        // suspension points number upward from there.
        let next_state = (f.resume_points.len() as u32).max(1);
        FuncEmitter {
            parent,
            idx,
            f,
            body: String::new(),
            tmp: 0,
            states: Vec::new(),
            next_state,
            call_slot: 0,
            resume_blocks: Vec::new(),
        }
    }

    fn t(&mut self) -> String {
        self.tmp += 1;
        format!("%t{}", self.tmp)
    }

    fn slot_addr(&mut self, v: LValue) -> String {
        let addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %frame, i64 {}",
            addr,
            2 + v as i64
        );
        addr
    }

    fn load(&mut self, v: LValue) -> String {
        let addr = self.slot_addr(v);
        let reg = self.t();
        let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, addr);
        reg
    }

    fn store(&mut self, v: LValue, reg: &str) {
        let addr = self.slot_addr(v);
        let _ = writeln!(self.body, "  store i64 {}, ptr {}", reg, addr);
    }

    fn store_const(&mut self, v: LValue, bits: u64) {
        let addr = self.slot_addr(v);
        let _ = writeln!(self.body, "  store i64 {}, ptr {}", bits as i64, addr);
    }

    fn out_word(&mut self, i: usize, reg: &str) {
        let addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %out, i64 {}",
            addr, i
        );
        let _ = writeln!(self.body, "  store i64 {}, ptr {}", reg, addr);
    }

    fn set_state(&mut self, state: u32) {
        let _ = writeln!(self.body, "  store i64 {}, ptr %frame", state);
    }

    fn alloc_state(&mut self, label: String) -> u32 {
        let s = self.next_state;
        self.next_state += 1;
        self.states.push((s, label));
        s
    }

    /// Copy an argument list into the shared arg buffer; returns the
    /// buffer pointer register.
    fn fill_args(&mut self, args: &[LValue]) -> String {
        let buf = self.t();
        let _ = writeln!(self.body, "  {} = alloca [{} x i64]", buf, args.len().max(1));
        for (i, a) in args.iter().enumerate() {
            let v = self.load(*a);
            let addr = self.t();
            let _ = writeln!(
                self.body,
                "  {} = getelementptr inbounds i64, ptr {}, i64 {}",
                addr, buf, i
            );
            let _ = writeln!(self.body, "  store i64 {}, ptr {}", v, addr);
        }
        buf
    }

    /// Emit the status check + unwind path after a status-returning
    /// runtime call.
    fn check_status(&mut self, status_reg: &str, block: LBlockId) {
        let cont = format!("ok{}", {
            self.tmp += 1;
            self.tmp
        });
        let uw = format!("uw{}", self.tmp);
        let cmp = self.t();
        let _ = writeln!(self.body, "  {} = icmp ne i32 {}, 0", cmp, status_reg);
        let _ = writeln!(self.body, "  br i1 {}, label %{}, label %{}", cmp, uw, cont);
        let _ = writeln!(self.body, "{}:", uw);
        self.emit_unwind(block);
        let _ = writeln!(self.body, "{}:", cont);
    }

    fn emit_unwind(&mut self, block: LBlockId) {
        let b = &self.f.blocks[block as usize];
        for v in &b.unwind_releases {
            let reg = self.load(*v);
            let _ = writeln!(self.body, "  call void @molt_rt_release(i64 {})", reg);
        }
        match b.unwind {
            Some(handler) => {
                let err = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_take_error_value()",
                    err
                );
                let hparams = self.f.blocks[handler as usize].params.clone();
                if let Some(p) = hparams.first() {
                    self.store(*p, &err.clone());
                }
                let _ = writeln!(self.body, "  br label %b{}", handler);
            }
            None => {
                let _ = writeln!(self.body, "  ret i32 1");
            }
        }
    }

    fn emit(&mut self) -> NResult<()> {
        // Collect resume-target blocks (yield/await payload prologues)
        // and pre-register yield states.
        for (si, b) in self.f.resume_points.iter().enumerate() {
            if si > 0 || !self.f.is_generator {
                self.resume_blocks.push(*b);
            }
            self.states.push((si as u32, format!("b{}", b)));
        }
        for block in &self.f.blocks {
            if let LTerm::Await { resume, .. } = block.term {
                self.resume_blocks.push(resume);
            }
        }
        if self.f.is_generator {
            // State 0 of a generator is its entry.
            self.states.retain(|(s, _)| *s != 0);
            self.states.push((0, "b0".to_string()));
        }

        for bi in 0..self.f.blocks.len() {
            self.emit_block(bi as LBlockId)?;
        }

        // Assemble: header, state dispatch, body.
        let mut text = String::new();
        let _ = writeln!(
            text,
            "define i32 @molt_fn_{}(ptr %frame, ptr %out) {{",
            self.idx
        );
        let _ = writeln!(text, "dispatch:");
        let _ = writeln!(text, "  %state.word = load i64, ptr %frame");
        let _ = writeln!(text, "  %state = trunc i64 %state.word to i32");
        let mut arms: Vec<String> = self
            .states
            .iter()
            .filter(|(s, _)| *s != 0)
            .map(|(s, label)| format!("i32 {}, label %{}", s, label))
            .collect();
        arms.sort();
        let _ = writeln!(
            text,
            "  switch i32 %state, label %b0 [ {} ]",
            arms.join(" ")
        );
        text.push_str(&self.body);
        let _ = writeln!(text, "}}");
        let _ = writeln!(text);
        self.parent.out.push_str(&text);
        Ok(())
    }

    fn emit_block(&mut self, bid: LBlockId) -> NResult<()> {
        let _ = writeln!(self.body, "b{}:", bid);
        // Resume prologue: the scheduler's payload lands in the block's
        // first parameter.
        if self.resume_blocks.contains(&bid) {
            let params = self.f.blocks[bid as usize].params.clone();
            if let Some(p) = params.first() {
                let payload = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = getelementptr inbounds i64, ptr %frame, i64 1",
                    payload
                );
                let reg = self.t();
                let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, payload);
                self.store(*p, &reg.clone());
            }
        }
        let ops = self.f.blocks[bid as usize].ops.clone();
        for op in &ops {
            self.emit_op(bid, op)?;
        }
        let term = self.f.blocks[bid as usize].term.clone();
        self.emit_term(bid, &term)?;
        Ok(())
    }

    fn emit_op(&mut self, bid: LBlockId, op: &LOp) -> NResult<()> {
        match op {
            LOp::ConstInt { dst, value } => match RawValue::try_from_small_int(*value) {
                Some(raw) => self.store_const(*dst, raw.to_bits()),
                None => {
                    let reg = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i64 @molt_rt_int(i64 {})",
                        reg, value
                    );
                    self.store(*dst, &reg.clone());
                }
            },
            LOp::ConstBigInt { dst, text } => {
                let (name, len) = self.parent.intern_str(text);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_bigint_const(ptr {}, i64 {})",
                    reg, name, len
                );
                self.store(*dst, &reg.clone());
            }
            LOp::ConstFloat { dst, value } => {
                self.store_const(*dst, RawValue::from_float(*value).to_bits());
            }
            LOp::ConstStr { dst, value } => {
                let (name, len) = self.parent.intern_str(value);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_str_const(ptr {}, i64 {})",
                    reg, name, len
                );
                self.store(*dst, &reg.clone());
            }
            LOp::ConstBool { dst, value } => {
                self.store_const(*dst, RawValue::from_bool(*value).to_bits());
            }
            LOp::ConstNull { dst } => {
                self.store_const(*dst, RawValue::null().to_bits());
            }
            LOp::Retain(v) => {
                let reg = self.load(*v);
                let _ = writeln!(self.body, "  call void @molt_rt_retain(i64 {})", reg);
            }
            LOp::Release(v) => {
                let reg = self.load(*v);
                let _ = writeln!(self.body, "  call void @molt_rt_release(i64 {})", reg);
            }
            LOp::AllocList { dst, elems } => {
                let buf = self.fill_args(elems);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_list(i32 {}, ptr {})",
                    reg,
                    elems.len(),
                    buf
                );
                self.store(*dst, &reg.clone());
            }
            LOp::AllocTuple { dst, elems } => {
                let buf = self.fill_args(elems);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_tuple(i32 {}, ptr {})",
                    reg,
                    elems.len(),
                    buf
                );
                self.store(*dst, &reg.clone());
            }
            LOp::AllocSet { dst, elems } => {
                let buf = self.fill_args(elems);
                let res = self.t();
                let _ = writeln!(self.body, "  {} = alloca i64", res);
                let status = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i32 @molt_rt_set(i32 {}, ptr {}, ptr {})",
                    status,
                    elems.len(),
                    buf,
                    res
                );
                self.check_status(&status.clone(), bid);
                let reg = self.t();
                let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, res);
                self.store(*dst, &reg.clone());
            }
            LOp::AllocMap {
                dst,
                shape,
                keys,
                values,
            } => match shape {
                Some(s) => {
                    let buf = self.fill_args(values);
                    let reg = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i64 @molt_rt_shaped_map(i32 {}, i32 {}, ptr {})",
                        reg,
                        s,
                        values.len(),
                        buf
                    );
                    self.store(*dst, &reg.clone());
                }
                None => {
                    let kbuf = self.fill_args(keys);
                    let vbuf = self.fill_args(values);
                    let res = self.t();
                    let _ = writeln!(self.body, "  {} = alloca i64", res);
                    let status = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i32 @molt_rt_map_new(i32 {}, ptr {}, ptr {}, ptr {})",
                        status,
                        keys.len(),
                        kbuf,
                        vbuf,
                        res
                    );
                    self.check_status(&status.clone(), bid);
                    let reg = self.t();
                    let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, res);
                    self.store(*dst, &reg.clone());
                }
            },
            LOp::AllocInstance { dst, class } => {
                let fields = self.parent.lir.classes[*class as usize].len();
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_instance(i32 {}, i32 {})",
                    reg, class, fields
                );
                self.store(*dst, &reg.clone());
            }
            LOp::LoadField { dst, obj, offset } => {
                let o = self.load(*obj);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_load_field(i64 {}, i32 {})",
                    reg, o, offset
                );
                self.store(*dst, &reg.clone());
            }
            LOp::StoreField { obj, offset, value } => {
                let o = self.load(*obj);
                let v = self.load(*value);
                let _ = writeln!(
                    self.body,
                    "  call void @molt_rt_store_field(i64 {}, i32 {}, i64 {})",
                    o, offset, v
                );
            }
            LOp::ResolveHandle { dst, handle } => {
                let h = self.load(*handle);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_handle_resolve(i64 {})",
                    reg, h
                );
                self.store(*dst, &reg.clone());
            }
            LOp::CallIntrinsic { dst, id, args } => {
                if let Some(code) = step_code_of(*id) {
                    self.emit_suspension(bid, *dst, code, args);
                } else if *id == Intrinsic::TaskSpawn {
                    let callee = self.load(args[0]);
                    let reg = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i64 @molt_rt_spawn_callable(i64 {})",
                        reg, callee
                    );
                    self.store(*dst, &reg.clone());
                } else if *id == Intrinsic::ParallelFor {
                    let start = self.load(args[0]);
                    let end = self.load(args[1]);
                    let body = self.load(args[2]);
                    let status = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i32 @molt_rt_parallel_for(i64 {}, i64 {}, i64 {})",
                        status, start, end, body
                    );
                    self.check_status(&status.clone(), bid);
                    self.store_const(*dst, RawValue::null().to_bits());
                } else if *id == Intrinsic::ParallelReduce {
                    let start = self.load(args[0]);
                    let end = self.load(args[1]);
                    let body = self.load(args[2]);
                    let identity = self.load(args[3]);
                    let combine = self.load(args[4]);
                    let res = self.t();
                    let _ = writeln!(self.body, "  {} = alloca i64", res);
                    let status = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i32 @molt_rt_parallel_reduce(i64 {}, i64 {}, i64 {}, i64 {}, i64 {}, ptr {})",
                        status, start, end, body, identity, combine, res
                    );
                    self.check_status(&status.clone(), bid);
                    let reg = self.t();
                    let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, res);
                    self.store(*dst, &reg.clone());
                } else {
                    let buf = self.fill_args(args);
                    let res = self.t();
                    let _ = writeln!(self.body, "  {} = alloca i64", res);
                    let status = self.t();
                    let _ = writeln!(
                        self.body,
                        "  {} = call i32 @molt_rt_intrinsic(i16 {}, i32 {}, ptr {}, ptr {})",
                        status,
                        *id as u16,
                        args.len(),
                        buf,
                        res
                    );
                    self.check_status(&status.clone(), bid);
                    let reg = self.t();
                    let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, res);
                    self.store(*dst, &reg.clone());
                }
            }
            LOp::CallStatic { dst, func, args } => {
                self.emit_static_call(bid, *dst, *func, args, None);
            }
            LOp::CallGuarded {
                dst,
                general,
                variant,
                guard_arg,
                guard_ty,
                frame: _,
                args,
            } => {
                // Guard, then one of two drive sequences.
                let g = self.load(args[*guard_arg]);
                let (kind, class) = match guard_ty {
                    GuardTy::Int => (0, 0),
                    GuardTy::Float => (1, 0),
                    GuardTy::Bool => (2, 0),
                    GuardTy::Str => (3, 0),
                    GuardTy::Class(c) => (4, *c),
                };
                let hit = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i32 @molt_rt_guard(i64 {}, i32 {}, i32 {})",
                    hit, g, kind, class
                );
                let cond = self.t();
                let _ = writeln!(self.body, "  {} = icmp ne i32 {}, 0", cond, hit);
                self.tmp += 1;
                let fast = format!("guard.fast{}", self.tmp);
                let slow = format!("guard.slow{}", self.tmp);
                let done = format!("guard.done{}", self.tmp);
                let _ = writeln!(
                    self.body,
                    "  br i1 {}, label %{}, label %{}",
                    cond, fast, slow
                );
                let _ = writeln!(self.body, "{}:", fast);
                self.emit_static_call(bid, *dst, *variant, args, Some(&done));
                let _ = writeln!(self.body, "{}:", slow);
                // Deopt: the general path restores the source frame
                // from the descriptor-backed slots and proceeds.
                self.emit_static_call(bid, *dst, *general, args, Some(&done));
                let _ = writeln!(self.body, "{}:", done);
            }
            LOp::CallDynamic { dst, callee, args } => {
                let c = self.load(*callee);
                let buf = self.fill_args(args);
                let res = self.t();
                let _ = writeln!(self.body, "  {} = alloca i64", res);
                let status = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i32 @molt_rt_call_value(i64 {}, i32 {}, ptr {}, ptr {})",
                    status,
                    c,
                    args.len(),
                    buf,
                    res
                );
                self.check_status(&status.clone(), bid);
                let reg = self.t();
                let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, res);
                self.store(*dst, &reg.clone());
            }
            LOp::MakeCallable { dst, func } => {
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_callable(i32 {})",
                    reg, func
                );
                self.store(*dst, &reg.clone());
            }
            LOp::ErrIsA { dst, err, kind } => {
                let e = self.load(*err);
                let (name, len) = self.parent.intern_str(kind);
                let hit = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i32 @molt_rt_err_is_a(i64 {}, ptr {}, i64 {})",
                    hit, e, name, len
                );
                let cond = self.t();
                let _ = writeln!(self.body, "  {} = icmp ne i32 {}, 0", cond, hit);
                let sel = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = select i1 {}, i64 {}, i64 {}",
                    sel,
                    cond,
                    RawValue::from_bool(true).to_bits() as i64,
                    RawValue::from_bool(false).to_bits() as i64
                );
                self.store(*dst, &sel.clone());
            }
            LOp::SetErrCause { dst, err, cause } => {
                let e = self.load(*err);
                let c = self.load(*cause);
                let reg = self.t();
                let _ = writeln!(
                    self.body,
                    "  {} = call i64 @molt_rt_err_set_cause(i64 {}, i64 {})",
                    reg, e, c
                );
                self.store(*dst, &reg.clone());
            }
            LOp::Move { dst, src } => {
                let reg = self.load(*src);
                self.store(*dst, &reg.clone());
            }
        }
        Ok(())
    }

    /// A suspending intrinsic: fill the step payload, save state,
    /// return the code; resumption continues inline with the payload.
    fn emit_suspension(&mut self, _bid: LBlockId, dst: LValue, code: i32, args: &[LValue]) {
        self.tmp += 1;
        let label = format!("cs{}", self.tmp);
        let state = self.alloc_state(format!("{}", label));
        for (i, a) in args.iter().enumerate() {
            let v = self.load(*a);
            self.out_word(i + 1, &v.clone());
        }
        self.set_state(state);
        let _ = writeln!(self.body, "  ret i32 {}", code);
        let _ = writeln!(self.body, "{}:", label);
        // Resume payload becomes the intrinsic's result.
        let addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %frame, i64 1",
            addr
        );
        let reg = self.t();
        let _ = writeln!(self.body, "  {} = load i64, ptr {}", reg, addr);
        self.store(dst, &reg.clone());
    }

    /// Direct call with suspension propagation: drive the callee frame
    /// until it returns or raises; propagate any step outward and
    /// re-drive on resume.
    fn emit_static_call(
        &mut self,
        bid: LBlockId,
        dst: LValue,
        func: usize,
        args: &[LValue],
        join_label: Option<&str>,
    ) {
        let callee = &self.parent.lir.functions[func];
        let callee_slots = 2 + callee.value_count as usize + call_site_count(callee);
        let fp_slot = 2 + self.f.value_count as usize + self.call_slot;
        self.call_slot += 1;
        self.tmp += 1;
        let n = self.tmp;
        let drive = format!("drive{}", n);
        let done = format!("calldone{}", n);
        let resume_label = format!("cs{}", n);
        let state = self.alloc_state(resume_label.clone());

        // Fresh child frame with arguments in its parameter slots.
        let cf = self.t();
        let _ = writeln!(
            self.body,
            "  {} = call ptr @molt_rt_frame_alloc(i64 {})",
            cf, callee_slots
        );
        for (i, a) in args.iter().enumerate() {
            let v = self.load(*a);
            let addr = self.t();
            let _ = writeln!(
                self.body,
                "  {} = getelementptr inbounds i64, ptr {}, i64 {}",
                addr,
                cf,
                2 + i
            );
            let _ = writeln!(self.body, "  store i64 {}, ptr {}", v, addr);
        }
        let fp_addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %frame, i64 {}",
            fp_addr, fp_slot
        );
        let cf_word = self.t();
        let _ = writeln!(self.body, "  {} = ptrtoint ptr {} to i64", cf_word, cf);
        let _ = writeln!(self.body, "  store i64 {}, ptr {}", cf_word, fp_addr);
        let _ = writeln!(self.body, "  br label %{}", drive);

        // Resume path: forward the scheduler payload into the child.
        let _ = writeln!(self.body, "{}:", resume_label);
        let r_fp_addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %frame, i64 {}",
            r_fp_addr, fp_slot
        );
        let r_word = self.t();
        let _ = writeln!(self.body, "  {} = load i64, ptr {}", r_word, r_fp_addr);
        let r_cf = self.t();
        let _ = writeln!(self.body, "  {} = inttoptr i64 {} to ptr", r_cf, r_word);
        let payload_addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %frame, i64 1",
            payload_addr
        );
        let payload = self.t();
        let _ = writeln!(self.body, "  {} = load i64, ptr {}", payload, payload_addr);
        let child_payload = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr {}, i64 1",
            child_payload, r_cf
        );
        let _ = writeln!(self.body, "  store i64 {}, ptr {}", payload, child_payload);
        let _ = writeln!(self.body, "  br label %{}", drive);

        // Drive: step the callee, switch on its status.
        let _ = writeln!(self.body, "{}:", drive);
        let d_fp_addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %frame, i64 {}",
            d_fp_addr, fp_slot
        );
        let d_word = self.t();
        let _ = writeln!(self.body, "  {} = load i64, ptr {}", d_word, d_fp_addr);
        let d_cf = self.t();
        let _ = writeln!(self.body, "  {} = inttoptr i64 {} to ptr", d_cf, d_word);
        let status = self.t();
        let _ = writeln!(
            self.body,
            "  {} = call i32 @molt_fn_{}(ptr {}, ptr %out)",
            status, func, d_cf
        );
        let raised = format!("callraise{}", n);
        let suspended = format!("callsuspend{}", n);
        let _ = writeln!(
            self.body,
            "  switch i32 {}, label %{} [ i32 0, label %{} i32 1, label %{} ]",
            status, suspended, done, raised
        );

        // Raised: free the child frame, then unwind.
        let _ = writeln!(self.body, "{}:", raised);
        let _ = writeln!(
            self.body,
            "  call void @molt_rt_frame_free(ptr {}, i64 {})",
            d_cf, callee_slots
        );
        self.emit_unwind(bid);

        // Suspended: save our state and propagate the step outward.
        let _ = writeln!(self.body, "{}:", suspended);
        self.set_state(state);
        let _ = writeln!(self.body, "  ret i32 {}", status);

        // Done: result is in out[1]; free the child frame.
        let _ = writeln!(self.body, "{}:", done);
        let res_addr = self.t();
        let _ = writeln!(
            self.body,
            "  {} = getelementptr inbounds i64, ptr %out, i64 1",
            res_addr
        );
        let res = self.t();
        let _ = writeln!(self.body, "  {} = load i64, ptr {}", res, res_addr);
        self.store(dst, &res.clone());
        let _ = writeln!(
            self.body,
            "  call void @molt_rt_frame_free(ptr {}, i64 {})",
            d_cf, callee_slots
        );
        if let Some(join) = join_label {
            let _ = writeln!(self.body, "  br label %{}", join);
        }
    }

    fn emit_term(&mut self, bid: LBlockId, term: &LTerm) -> NResult<()> {
        match term {
            LTerm::Jump { to, args } => {
                let params = self.f.blocks[*to as usize].params.clone();
                for (p, a) in params.iter().zip(args.iter()) {
                    let v = self.load(*a);
                    self.store(*p, &v.clone());
                }
                let _ = writeln!(self.body, "  br label %b{}", to);
            }
            LTerm::Branch {
                cond,
                then_to,
                then_args,
                else_to,
                else_args,
            } => {
                let c = self.load(*cond);
                let t = self.t();
                let _ = writeln!(self.body, "  {} = call i32 @molt_rt_truthy(i64 {})", t, c);
                let b = self.t();
                let _ = writeln!(self.body, "  {} = icmp ne i32 {}, 0", b, t);
                self.tmp += 1;
                let then_tramp = format!("e{}t", self.tmp);
                let else_tramp = format!("e{}f", self.tmp);
                let _ = writeln!(
                    self.body,
                    "  br i1 {}, label %{}, label %{}",
                    b, then_tramp, else_tramp
                );
                let _ = writeln!(self.body, "{}:", then_tramp);
                let params = self.f.blocks[*then_to as usize].params.clone();
                for (p, a) in params.iter().zip(then_args.iter()) {
                    let v = self.load(*a);
                    self.store(*p, &v.clone());
                }
                let _ = writeln!(self.body, "  br label %b{}", then_to);
                let _ = writeln!(self.body, "{}:", else_tramp);
                let params = self.f.blocks[*else_to as usize].params.clone();
                for (p, a) in params.iter().zip(else_args.iter()) {
                    let v = self.load(*a);
                    self.store(*p, &v.clone());
                }
                let _ = writeln!(self.body, "  br label %b{}", else_to);
            }
            LTerm::Return(v) => {
                let reg = self.load(*v);
                self.out_word(1, &reg.clone());
                let _ = writeln!(self.body, "  ret i32 0");
            }
            LTerm::Raise(v) => {
                let reg = self.load(*v);
                match self.f.blocks[bid as usize].unwind {
                    Some(handler) => {
                        let hparams = self.f.blocks[handler as usize].params.clone();
                        if let Some(p) = hparams.first() {
                            self.store(*p, &reg.clone());
                        }
                        let _ = writeln!(self.body, "  br label %b{}", handler);
                    }
                    None => {
                        let _ = writeln!(
                            self.body,
                            "  call void @molt_rt_raise_value(i64 {})",
                            reg
                        );
                        let _ = writeln!(self.body, "  ret i32 1");
                    }
                }
            }
            LTerm::Yield {
                value,
                state,
                resume: _,
            } => {
                let reg = self.load(*value);
                self.out_word(1, &reg.clone());
                self.set_state(*state);
                let _ = writeln!(self.body, "  ret i32 {}", molt_core::abi::step::YIELD);
            }
            LTerm::Await { value, resume } => {
                let reg = self.load(*value);
                self.out_word(1, &reg.clone());
                let state = self.alloc_state(format!("b{}", resume));
                self.set_state(state);
                let _ = writeln!(self.body, "  ret i32 {}", molt_core::abi::step::JOIN);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Link driver
// =============================================================================

fn parse_clang_version(output: &str) -> Option<u32> {
    for line in output.lines() {
        if let Some(idx) = line.find("clang version ") {
            let after = &line[idx + "clang version ".len()..];
            let major: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !major.is_empty() {
                return major.parse().ok();
            }
        }
    }
    None
}

fn check_clang_version() -> Result<u32, String> {
    CLANG_VERSION_CHECKED
        .get_or_init(|| {
            let output = Command::new("clang")
                .arg("--version")
                .output()
                .map_err(|e| {
                    format!(
                        "failed to run clang: {}. Install clang {} or later.",
                        e, MIN_CLANG_VERSION
                    )
                })?;
            if !output.status.success() {
                return Err("clang --version failed".to_string());
            }
            let text = String::from_utf8_lossy(&output.stdout);
            let version = parse_clang_version(&text).ok_or_else(|| {
                format!(
                    "could not parse clang version; moltc requires clang {}+",
                    MIN_CLANG_VERSION
                )
            })?;
            if version < MIN_CLANG_VERSION {
                return Err(format!(
                    "clang {} found, but the emitted IR needs {}+ (opaque pointers)",
                    version, MIN_CLANG_VERSION
                ));
            }
            Ok(version)
        })
        .clone()
}

/// Emit IR, then compile and link a native executable.
pub fn build_native(
    lir: &LirModule,
    config: &BuildConfig,
    output: &Path,
) -> NResult<()> {
    let ir = emit_ir(lir)?;
    // The capability manifest mask is baked into the init call.
    let ir = ir.replace(
        "call void @molt_rt_init(i16 0)",
        &format!("call void @molt_rt_init(i16 {})", config.caps.mask()),
    );

    let ir_path = output.with_extension("ll");
    std::fs::write(&ir_path, &ir)
        .map_err(|e| backend_err(format!("failed to write IR: {}", e)))?;

    check_clang_version().map_err(backend_err)?;

    let runtime_lib = config
        .runtime_lib
        .clone()
        .ok_or_else(|| {
            backend_err(
                "runtime static library not found; set MOLT_RUNTIME_LIB to libmolt_runtime.a",
            )
        })?;

    let status = Command::new("clang")
        .arg(config.opt_level.clang_flag())
        .arg(&ir_path)
        .arg(&runtime_lib)
        .arg("-lpthread")
        .arg("-ldl")
        .arg("-lm")
        .arg("-o")
        .arg(output)
        .output()
        .map_err(|e| backend_err(format!("failed to run clang: {}", e)))?;
    if !status.status.success() {
        return Err(backend_err(format!(
            "clang link failed:\n{}",
            String::from_utf8_lossy(&status.stderr)
        )));
    }
    if !config.keep_ir {
        let _ = std::fs::remove_file(&ir_path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::testutil::lower_source;

    #[test]
    fn test_emission_is_deterministic() {
        let lir = lower_source("def f(a):\n    return a + 1\n\nx = f(1)\nprint(x)\n");
        let a = emit_ir(&lir).unwrap();
        let b = emit_ir(&lir).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hello_ir_shape() {
        let lir = lower_source("print(\"hello\")\n");
        let ir = emit_ir(&lir).unwrap();
        // One function per LIR function plus the bootstrap main.
        assert!(ir.contains("define i32 @molt_fn_0"));
        assert!(ir.contains("define i32 @main()"));
        assert!(ir.contains("@molt_rt_run_toplevel"));
        // The literal lives in the string pool.
        assert!(ir.contains("c\"hello\""));
        // No timestamps or absolute paths leak into the text.
        assert!(!ir.contains("/root/"));
    }

    #[test]
    fn test_suspending_intrinsic_returns_step() {
        let lir = lower_source("def worker():\n    sleep(0.01)\n    return 1\n\nt = spawn(worker)\n");
        let ir = emit_ir(&lir).unwrap();
        // Sleep emits the SLEEP step code return, not an intrinsic call.
        assert!(ir.contains(&format!("ret i32 {}", molt_core::abi::step::SLEEP)));
        assert!(ir.contains("@molt_rt_spawn_callable"));
    }

    #[test]
    fn test_generator_has_state_dispatch() {
        let lir = lower_source("def g(n):\n    for i in range(n):\n        yield i\n\nit = g(3)\n");
        let ir = emit_ir(&lir).unwrap();
        assert!(ir.contains("switch i32 %state"));
        assert!(ir.contains(&format!("ret i32 {}", molt_core::abi::step::YIELD)));
    }

    #[test]
    fn test_parse_clang_version() {
        assert_eq!(
            parse_clang_version("Ubuntu clang version 15.0.7\nTarget: x86_64"),
            Some(15)
        );
        assert_eq!(
            parse_clang_version("Homebrew clang version 17.0.6"),
            Some(17)
        );
        assert_eq!(parse_clang_version("no version"), None);
    }

    #[test]
    fn test_capability_mask_baked_into_init() {
        let lir = lower_source("print(\"x\")\n");
        let ir = emit_ir(&lir).unwrap();
        assert!(ir.contains("call void @molt_rt_init(i16 0)"));
    }
}
