//! High-level IR and frontend lowering
//!
//! HIR is the desugared core: surface sugar is rewritten into a small
//! explicit set of constructs here, before any typing.
//!
//! - `for` becomes a `while` over an iterator acquired with the
//!   iterator-acquisition operator (counted loops for literal `range`).
//! - `with` becomes acquire-then-`try`/`finally`-release.
//! - Comprehensions become synthesized functions (captures passed as
//!   parameters), called at the comprehension site.
//! - `match` expands into a decision tree of tests and binding
//!   extractions over a `$matched` flag.
//! - Assignment targets (tuple unpacking, starred rest, subscript and
//!   attribute targets) linearize into primitive stores.
//! - Imports resolve eagerly to module identities; there is no runtime
//!   string-to-module resolution.
//!
//! Malformed patterns, invalid targets, and dynamic-execution forms
//! (`eval`/`exec`) fail HERE with a precise location; nothing falls
//! back to runtime.

use molt_core::{ErrorKind, Intrinsic};

use crate::ast;
use crate::ast::{BinOp, BoolOpKind, CmpOp, UnaryOp};
use crate::diag::{CompileError, Stage};
use crate::source::{Span, Symbol, SymbolKind};

// =============================================================================
// HIR data
// =============================================================================

#[derive(Debug, Clone)]
pub struct HirModule {
    pub name: String,
    pub file: String,
    pub imports: Vec<String>,
    pub functions: Vec<HirFunc>,
    pub classes: Vec<HirClass>,
    /// Index of the module initialization function.
    pub entry: usize,
}

#[derive(Debug, Clone)]
pub struct HirClass {
    pub id: u32,
    pub name: String,
    /// Field slots in first-assignment order, discovered from
    /// `self.<field> = ...` in `__init__`.
    pub fields: Vec<String>,
    /// Method name -> function index.
    pub methods: Vec<(String, usize)>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct HirFunc {
    pub name: String,
    pub symbol: Symbol,
    pub params: Vec<String>,
    pub body: Vec<HStmt>,
    pub is_async: bool,
    pub is_generator: bool,
    /// Method receiver class, when this function is a method.
    pub self_class: Option<u32>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum HStmt {
    Expr(HExpr),
    Assign { name: String, value: HExpr },
    StoreIndex { obj: HExpr, index: HExpr, value: HExpr },
    StoreAttr { obj: HExpr, name: String, value: HExpr },
    If { cond: HExpr, then: Vec<HStmt>, orelse: Vec<HStmt> },
    While { cond: HExpr, body: Vec<HStmt> },
    Break,
    Continue,
    Return(HExpr),
    Raise { exc: HExpr, cause: Option<HExpr>, span: Span },
    Try {
        body: Vec<HStmt>,
        handlers: Vec<HHandler>,
        finally: Vec<HStmt>,
    },
}

#[derive(Debug, Clone)]
pub struct HHandler {
    /// None catches everything.
    pub kind: Option<ErrorKind>,
    pub bind: Option<String>,
    pub body: Vec<HStmt>,
}

#[derive(Debug, Clone)]
pub enum HExpr {
    Const(HConst),
    /// Unresolved name: parameter, local, module function, or class.
    Name(String, Span),
    /// Reference to a module function as a callable value.
    FuncRef(String),
    MakeTuple(Vec<HExpr>),
    MakeList(Vec<HExpr>),
    MakeMap(Vec<(HExpr, HExpr)>),
    MakeSet(Vec<HExpr>),
    Binary { op: BinOp, left: Box<HExpr>, right: Box<HExpr>, span: Span },
    Compare { op: CmpOp, left: Box<HExpr>, right: Box<HExpr>, span: Span },
    And(Box<HExpr>, Box<HExpr>),
    Or(Box<HExpr>, Box<HExpr>),
    Not(Box<HExpr>),
    Neg(Box<HExpr>, Span),
    /// Direct call of a known module function or class constructor.
    CallFunc { name: String, args: Vec<HExpr>, span: Span },
    /// Call of a callable value.
    CallValue { callee: Box<HExpr>, args: Vec<HExpr>, span: Span },
    /// Method call; resolution (class static vs builtin) happens in TIR.
    CallMethod { obj: Box<HExpr>, name: String, args: Vec<HExpr>, span: Span },
    /// Direct intrinsic invocation (builtins lower to these).
    Intrinsic { id: Intrinsic, args: Vec<HExpr>, span: Span },
    /// Sequence length (list/tuple/str/map/set), resolved by type.
    SeqLen(Box<HExpr>, Span),
    Index { obj: Box<HExpr>, index: Box<HExpr>, span: Span },
    Attr { obj: Box<HExpr>, name: String, span: Span },
    /// Iterator acquisition.
    IterAcquire(Box<HExpr>, Span),
    /// Iterator step: yields a `(value, done)` pair.
    IterStep(Box<HExpr>),
    Await(Box<HExpr>, Span),
    Yield(Box<HExpr>, Span),
}

#[derive(Debug, Clone)]
pub enum HConst {
    Int(i64),
    BigInt(String),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

impl HExpr {
    fn const_none() -> HExpr {
        HExpr::Const(HConst::None)
    }

    fn const_bool(b: bool) -> HExpr {
        HExpr::Const(HConst::Bool(b))
    }

    fn const_int(n: i64) -> HExpr {
        HExpr::Const(HConst::Int(n))
    }

    fn const_str(s: &str) -> HExpr {
        HExpr::Const(HConst::Str(s.to_string()))
    }
}

// =============================================================================
// Lowering
// =============================================================================

/// Dynamic-execution forms rejected at lowering time.
const DYNAMIC_EXEC_FORMS: [&str; 3] = ["eval", "exec", "compile"];

/// Names the frontend lowers directly to intrinsics (unless shadowed by
/// a local binding).
const BUILTIN_NAMES: [&str; 29] = [
    "print",
    "len",
    "str",
    "hash",
    "range",
    "spawn",
    "sleep",
    "join",
    "cancel",
    "current_task",
    "yield_now",
    "channel",
    "send",
    "recv",
    "try_send",
    "try_recv",
    "close_channel",
    "open",
    "read",
    "write",
    "close",
    "env_get",
    "env_set",
    "monotonic",
    "perf_counter",
    "wall_clock",
    "random_bytes",
    "parallel_for",
    "parallel_reduce",
];

type LResult<T> = Result<T, CompileError>;

pub fn lower_module(module: &ast::Module) -> LResult<HirModule> {
    let mut lowerer = Lowerer {
        file: module.file.clone(),
        module_name: module.name.clone(),
        functions: Vec::new(),
        classes: Vec::new(),
        func_names: Vec::new(),
        class_names: Vec::new(),
        tmp_counter: 0,
    };

    // First pass: collect module-level function and class names so
    // forward references resolve.
    for stmt in &module.body {
        match &stmt.kind {
            ast::StmtKind::Def(f) => lowerer.func_names.push(f.name.clone()),
            ast::StmtKind::ClassDef(c) => lowerer.class_names.push(c.name.clone()),
            _ => {}
        }
    }

    let mut init_body = Vec::new();
    for stmt in &module.body {
        match &stmt.kind {
            ast::StmtKind::Def(f) => {
                lowerer.lower_function(f, None)?;
            }
            ast::StmtKind::ClassDef(c) => {
                lowerer.lower_class(c)?;
            }
            ast::StmtKind::Import { .. } => {
                // Imports resolved eagerly by the driver; nothing to
                // execute at runtime.
            }
            _ => {
                let mut scope = Scope::new(&[]);
                lowerer.lower_stmt(stmt, &mut init_body, &mut scope)?;
            }
        }
    }

    // The module initialization block becomes an ordinary function.
    let init_span = Span::new(module.file.clone(), 1, 1);
    let entry = lowerer.functions.len();
    lowerer.functions.push(HirFunc {
        name: format!("{}.__init__", module.name),
        symbol: Symbol::new(
            format!("{}.__init__", module.name),
            init_span.clone(),
            SymbolKind::Function,
            "module init",
        ),
        params: Vec::new(),
        body: init_body,
        is_async: false,
        is_generator: false,
        self_class: None,
        span: init_span,
    });

    Ok(HirModule {
        name: module.name.clone(),
        file: module.file.clone(),
        imports: module.imports.clone(),
        functions: lowerer.functions,
        classes: lowerer.classes,
        entry,
    })
}

struct Lowerer {
    file: String,
    module_name: String,
    functions: Vec<HirFunc>,
    classes: Vec<HirClass>,
    func_names: Vec<String>,
    class_names: Vec<String>,
    tmp_counter: u32,
}

/// Per-function lowering scope: parameter and local names, for
/// resolving comprehension captures.
struct Scope {
    names: Vec<String>,
}

impl Scope {
    fn new(params: &[String]) -> Self {
        Scope {
            names: params.to_vec(),
        }
    }

    fn declare(&mut self, name: &str) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl Lowerer {
    fn tmp(&mut self, what: &str) -> String {
        self.tmp_counter += 1;
        format!("${}{}", what, self.tmp_counter)
    }

    fn err(&self, span: &Span, message: impl Into<String>) -> CompileError {
        CompileError::at(Stage::Lower, span.clone(), message)
    }

    fn lower_function(&mut self, f: &ast::FuncDef, self_class: Option<u32>) -> LResult<usize> {
        let qual = match self_class {
            Some(id) => format!(
                "{}.{}.{}",
                self.module_name,
                self.classes
                    .iter()
                    .find(|c| c.id == id)
                    .map(|c| c.name.as_str())
                    .unwrap_or("?"),
                f.name
            ),
            None => format!("{}.{}", self.module_name, f.name),
        };
        let mut scope = Scope::new(&f.params);
        let mut body = Vec::new();
        for stmt in &f.body {
            self.lower_stmt(stmt, &mut body, &mut scope)?;
        }
        let is_generator = body_has_yield(&body);
        let idx = self.functions.len();
        self.functions.push(HirFunc {
            name: qual.clone(),
            symbol: Symbol::new(
                qual,
                f.span.clone(),
                SymbolKind::Function,
                &format!("def {}", f.name),
            ),
            params: f.params.clone(),
            body,
            is_async: f.is_async,
            is_generator,
            self_class,
            span: f.span.clone(),
        });
        Ok(idx)
    }

    fn lower_class(&mut self, c: &ast::ClassDef) -> LResult<()> {
        let class_id = self.classes.len() as u32;
        // Field discovery: first-assignment order of `self.<f>` in
        // __init__.
        let mut fields = Vec::new();
        if let Some(init) = c.methods.iter().find(|m| m.name == "__init__") {
            collect_self_fields(&init.body, &mut fields);
        }
        self.classes.push(HirClass {
            id: class_id,
            name: c.name.clone(),
            fields,
            methods: Vec::new(),
            span: c.span.clone(),
        });
        for method in &c.methods {
            if method.params.first().map(|p| p.as_str()) != Some("self") {
                return Err(self.err(&method.span, "methods must take 'self' first"));
            }
            let idx = self.lower_function(method, Some(class_id))?;
            self.classes[class_id as usize]
                .methods
                .push((method.name.clone(), idx));
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn lower_stmt(
        &mut self,
        stmt: &ast::Stmt,
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
    ) -> LResult<()> {
        match &stmt.kind {
            ast::StmtKind::Expr(e) => {
                let h = self.lower_expr(e, scope)?;
                out.push(HStmt::Expr(h));
            }
            ast::StmtKind::Assign { target, value } => {
                let v = self.lower_expr(value, scope)?;
                self.lower_assign(target, v, out, scope)?;
            }
            ast::StmtKind::AugAssign { target, op, value } => {
                let loaded = self.target_as_expr(target, scope)?;
                let v = self.lower_expr(value, scope)?;
                let combined = HExpr::Binary {
                    op: *op,
                    left: Box::new(loaded),
                    right: Box::new(v),
                    span: target.span().clone(),
                };
                self.lower_assign(target, combined, out, scope)?;
            }
            ast::StmtKind::If { cond, then, orelse } => {
                let c = self.lower_expr(cond, scope)?;
                let mut t = Vec::new();
                for s in then {
                    self.lower_stmt(s, &mut t, scope)?;
                }
                let mut e = Vec::new();
                for s in orelse {
                    self.lower_stmt(s, &mut e, scope)?;
                }
                out.push(HStmt::If {
                    cond: c,
                    then: t,
                    orelse: e,
                });
            }
            ast::StmtKind::While { cond, body } => {
                let c = self.lower_expr(cond, scope)?;
                let mut b = Vec::new();
                for s in body {
                    self.lower_stmt(s, &mut b, scope)?;
                }
                out.push(HStmt::While { cond: c, body: b });
            }
            ast::StmtKind::For { target, iter, body } => {
                self.lower_for(target, iter, body, out, scope)?;
            }
            ast::StmtKind::Def(f) => {
                return Err(self.err(
                    &f.span,
                    "nested function definitions are outside the supported subset",
                ));
            }
            ast::StmtKind::ClassDef(c) => {
                return Err(self.err(
                    &c.span,
                    "class definitions are only supported at module level",
                ));
            }
            ast::StmtKind::Return(value) => {
                let v = match value {
                    Some(e) => self.lower_expr(e, scope)?,
                    None => HExpr::const_none(),
                };
                out.push(HStmt::Return(v));
            }
            ast::StmtKind::Pass => {}
            ast::StmtKind::Break => out.push(HStmt::Break),
            ast::StmtKind::Continue => out.push(HStmt::Continue),
            ast::StmtKind::Import { .. } => {
                // Handled at module granularity.
            }
            ast::StmtKind::With { ctx, name, body } => {
                self.lower_with(ctx, name.as_deref(), body, out, scope, &stmt.span)?;
            }
            ast::StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                let mut b = Vec::new();
                for s in body {
                    self.lower_stmt(s, &mut b, scope)?;
                }
                let mut hs = Vec::new();
                for h in handlers {
                    let kind = match &h.kind {
                        None => None,
                        Some(name) => Some(ErrorKind::parse(name).ok_or_else(|| {
                            self.err(&h.span, format!("unknown error kind '{}'", name))
                        })?),
                    };
                    if let Some(bind) = &h.name {
                        scope.declare(bind);
                    }
                    let mut hb = Vec::new();
                    for s in &h.body {
                        self.lower_stmt(s, &mut hb, scope)?;
                    }
                    hs.push(HHandler {
                        kind,
                        bind: h.name.clone(),
                        body: hb,
                    });
                }
                let mut fin = Vec::new();
                for s in finally {
                    self.lower_stmt(s, &mut fin, scope)?;
                }
                out.push(HStmt::Try {
                    body: b,
                    handlers: hs,
                    finally: fin,
                });
            }
            ast::StmtKind::Raise { exc, cause } => {
                let exc = match exc {
                    Some(e) => self.lower_expr(e, scope)?,
                    None => {
                        return Err(self.err(
                            &stmt.span,
                            "bare raise outside a handler is not supported",
                        ))
                    }
                };
                let cause = match cause {
                    Some(c) => Some(self.lower_expr(c, scope)?),
                    None => None,
                };
                out.push(HStmt::Raise {
                    exc,
                    cause,
                    span: stmt.span.clone(),
                });
            }
            ast::StmtKind::Match { subject, arms } => {
                self.lower_match(subject, arms, out, scope, &stmt.span)?;
            }
            ast::StmtKind::Assert { cond, message } => {
                // assert cond, msg  =>  if not cond: raise ValueError(msg)
                let c = self.lower_expr(cond, scope)?;
                let msg = match message {
                    Some(m) => self.lower_expr(m, scope)?,
                    None => HExpr::const_str("assertion failed"),
                };
                out.push(HStmt::If {
                    cond: HExpr::Not(Box::new(c)),
                    then: vec![HStmt::Raise {
                        exc: HExpr::Intrinsic {
                            id: Intrinsic::ErrNew,
                            args: vec![HExpr::const_str("ValueError"), msg],
                            span: stmt.span.clone(),
                        },
                        cause: None,
                        span: stmt.span.clone(),
                    }],
                    orelse: Vec::new(),
                });
            }
        }
        Ok(())
    }

    /// Linearize an assignment target into primitive stores.
    fn lower_assign(
        &mut self,
        target: &ast::Target,
        value: HExpr,
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
    ) -> LResult<()> {
        match target {
            ast::Target::Name(name, _) => {
                scope.declare(name);
                out.push(HStmt::Assign {
                    name: name.clone(),
                    value,
                });
            }
            ast::Target::Subscript { value: obj, index, span: _ } => {
                let obj = self.lower_expr(obj, scope)?;
                let index = self.lower_expr(index, scope)?;
                out.push(HStmt::StoreIndex { obj, index, value });
            }
            ast::Target::Attribute { value: obj, name, span: _ } => {
                let obj = self.lower_expr(obj, scope)?;
                out.push(HStmt::StoreAttr {
                    obj,
                    name: name.clone(),
                    value,
                });
            }
            ast::Target::Starred(_, span) => {
                return Err(self.err(span, "starred target outside tuple unpacking"));
            }
            ast::Target::Tuple(items, span) => {
                self.lower_tuple_unpack(items, span, value, out, scope)?;
            }
        }
        Ok(())
    }

    /// Tuple unpacking with at most one starred rest target.
    fn lower_tuple_unpack(
        &mut self,
        items: &[ast::Target],
        span: &Span,
        value: HExpr,
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
    ) -> LResult<()> {
        let star_count = items
            .iter()
            .filter(|t| matches!(t, ast::Target::Starred(..)))
            .count();
        if star_count > 1 {
            return Err(self.err(span, "more than one starred target in unpacking"));
        }
        let subject = self.tmp("unpack");
        scope.declare(&subject);
        out.push(HStmt::Assign {
            name: subject.clone(),
            value,
        });
        let load = |name: &str| HExpr::Name(name.to_string(), span.clone());
        let star_pos = items
            .iter()
            .position(|t| matches!(t, ast::Target::Starred(..)));

        match star_pos {
            None => {
                for (i, item) in items.iter().enumerate() {
                    let elem = HExpr::Index {
                        obj: Box::new(load(&subject)),
                        index: Box::new(HExpr::const_int(i as i64)),
                        span: span.clone(),
                    };
                    self.lower_assign(item, elem, out, scope)?;
                }
            }
            Some(pos) => {
                let after = items.len() - pos - 1;
                let len_name = self.tmp("len");
                scope.declare(&len_name);
                out.push(HStmt::Assign {
                    name: len_name.clone(),
                    value: HExpr::SeqLen(Box::new(load(&subject)), span.clone()),
                });
                // Fixed prefix.
                for (i, item) in items[..pos].iter().enumerate() {
                    let elem = HExpr::Index {
                        obj: Box::new(load(&subject)),
                        index: Box::new(HExpr::const_int(i as i64)),
                        span: span.clone(),
                    };
                    self.lower_assign(item, elem, out, scope)?;
                }
                // Starred rest: a fresh list filled by a counted loop.
                let ast::Target::Starred(inner, _) = &items[pos] else {
                    unreachable!("position found above");
                };
                let rest_name = self.tmp("rest");
                scope.declare(&rest_name);
                out.push(HStmt::Assign {
                    name: rest_name.clone(),
                    value: HExpr::MakeList(Vec::new()),
                });
                let idx_name = self.tmp("i");
                scope.declare(&idx_name);
                out.push(HStmt::Assign {
                    name: idx_name.clone(),
                    value: HExpr::const_int(pos as i64),
                });
                let upper = HExpr::Binary {
                    op: BinOp::Sub,
                    left: Box::new(load(&len_name)),
                    right: Box::new(HExpr::const_int(after as i64)),
                    span: span.clone(),
                };
                out.push(HStmt::While {
                    cond: HExpr::Compare {
                        op: CmpOp::Lt,
                        left: Box::new(load(&idx_name)),
                        right: Box::new(upper),
                        span: span.clone(),
                    },
                    body: vec![
                        HStmt::Expr(HExpr::Intrinsic {
                            id: Intrinsic::ListPush,
                            args: vec![
                                load(&rest_name),
                                HExpr::Index {
                                    obj: Box::new(load(&subject)),
                                    index: Box::new(load(&idx_name)),
                                    span: span.clone(),
                                },
                            ],
                            span: span.clone(),
                        }),
                        HStmt::Assign {
                            name: idx_name.clone(),
                            value: HExpr::Binary {
                                op: BinOp::Add,
                                left: Box::new(load(&idx_name)),
                                right: Box::new(HExpr::const_int(1)),
                                span: span.clone(),
                            },
                        },
                    ],
                });
                self.lower_assign(inner, load(&rest_name), out, scope)?;
                // Fixed suffix, indexed from the end.
                for (i, item) in items[pos + 1..].iter().enumerate() {
                    let from_end = after as i64 - i as i64;
                    let elem = HExpr::Index {
                        obj: Box::new(load(&subject)),
                        index: Box::new(HExpr::Binary {
                            op: BinOp::Sub,
                            left: Box::new(load(&len_name)),
                            right: Box::new(HExpr::const_int(from_end)),
                            span: span.clone(),
                        }),
                        span: span.clone(),
                    };
                    self.lower_assign(item, elem, out, scope)?;
                }
            }
        }
        Ok(())
    }

    /// `for` becomes a counted loop for literal `range`, otherwise a
    /// `while` over the iterator protocol.
    fn lower_for(
        &mut self,
        target: &ast::Target,
        iter: &ast::Expr,
        body: &[ast::Stmt],
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
    ) -> LResult<()> {
        let span = iter.span.clone();
        // Counted loop: for x in range(a[, b])
        if let ast::ExprKind::Call { callee, args } = &iter.kind {
            if matches!(&callee.kind, ast::ExprKind::Name(n) if n == "range")
                && !scope.contains("range")
            {
                let (start, stop) = match args.len() {
                    1 => (HExpr::const_int(0), self.lower_expr(&args[0], scope)?),
                    2 => (
                        self.lower_expr(&args[0], scope)?,
                        self.lower_expr(&args[1], scope)?,
                    ),
                    _ => return Err(self.err(&span, "range takes 1 or 2 arguments")),
                };
                let counter = self.tmp("for");
                let stop_name = self.tmp("stop");
                scope.declare(&counter);
                scope.declare(&stop_name);
                out.push(HStmt::Assign {
                    name: counter.clone(),
                    value: start,
                });
                out.push(HStmt::Assign {
                    name: stop_name.clone(),
                    value: stop,
                });
                let mut loop_body = Vec::new();
                self.lower_assign(
                    target,
                    HExpr::Name(counter.clone(), span.clone()),
                    &mut loop_body,
                    scope,
                )?;
                for s in body {
                    self.lower_stmt(s, &mut loop_body, scope)?;
                }
                loop_body.push(HStmt::Assign {
                    name: counter.clone(),
                    value: HExpr::Binary {
                        op: BinOp::Add,
                        left: Box::new(HExpr::Name(counter.clone(), span.clone())),
                        right: Box::new(HExpr::const_int(1)),
                        span: span.clone(),
                    },
                });
                out.push(HStmt::While {
                    cond: HExpr::Compare {
                        op: CmpOp::Lt,
                        left: Box::new(HExpr::Name(counter, span.clone())),
                        right: Box::new(HExpr::Name(stop_name, span.clone())),
                        span: span.clone(),
                    },
                    body: loop_body,
                });
                return Ok(());
            }
        }

        // General protocol loop.
        let it_name = self.tmp("iter");
        scope.declare(&it_name);
        let iter_h = self.lower_expr(iter, scope)?;
        out.push(HStmt::Assign {
            name: it_name.clone(),
            value: HExpr::IterAcquire(Box::new(iter_h), span.clone()),
        });
        let step_name = self.tmp("step");
        scope.declare(&step_name);
        let mut loop_body = vec![
            HStmt::Assign {
                name: step_name.clone(),
                value: HExpr::IterStep(Box::new(HExpr::Name(it_name.clone(), span.clone()))),
            },
            HStmt::If {
                cond: HExpr::Intrinsic {
                    id: Intrinsic::TupleGet,
                    args: vec![
                        HExpr::Name(step_name.clone(), span.clone()),
                        HExpr::const_int(1),
                    ],
                    span: span.clone(),
                },
                then: vec![HStmt::Break],
                orelse: Vec::new(),
            },
        ];
        self.lower_assign(
            target,
            HExpr::Intrinsic {
                id: Intrinsic::TupleGet,
                args: vec![
                    HExpr::Name(step_name.clone(), span.clone()),
                    HExpr::const_int(0),
                ],
                span: span.clone(),
            },
            &mut loop_body,
            scope,
        )?;
        for s in body {
            self.lower_stmt(s, &mut loop_body, scope)?;
        }
        out.push(HStmt::While {
            cond: HExpr::const_bool(true),
            body: loop_body,
        });
        Ok(())
    }

    /// `with ctx as name:` becomes enter, `try` body `finally` exit.
    fn lower_with(
        &mut self,
        ctx: &ast::Expr,
        name: Option<&str>,
        body: &[ast::Stmt],
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
        span: &Span,
    ) -> LResult<()> {
        let ctx_name = self.tmp("ctx");
        scope.declare(&ctx_name);
        let ctx_h = self.lower_expr(ctx, scope)?;
        out.push(HStmt::Assign {
            name: ctx_name.clone(),
            value: ctx_h,
        });
        let entered = HExpr::CallMethod {
            obj: Box::new(HExpr::Name(ctx_name.clone(), span.clone())),
            name: "__enter__".to_string(),
            args: Vec::new(),
            span: span.clone(),
        };
        let mut inner = Vec::new();
        match name {
            Some(n) => {
                scope.declare(n);
                inner.push(HStmt::Assign {
                    name: n.to_string(),
                    value: entered,
                });
            }
            None => inner.push(HStmt::Expr(entered)),
        }
        for s in body {
            self.lower_stmt(s, &mut inner, scope)?;
        }
        out.push(HStmt::Try {
            body: inner,
            handlers: Vec::new(),
            finally: vec![HStmt::Expr(HExpr::CallMethod {
                obj: Box::new(HExpr::Name(ctx_name, span.clone())),
                name: "__exit__".to_string(),
                args: Vec::new(),
                span: span.clone(),
            })],
        });
        Ok(())
    }

    /// `match` expands into a decision tree over a `$matched` flag.
    fn lower_match(
        &mut self,
        subject: &ast::Expr,
        arms: &[ast::MatchArm],
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
        span: &Span,
    ) -> LResult<()> {
        let subj_name = self.tmp("subject");
        scope.declare(&subj_name);
        let s = self.lower_expr(subject, scope)?;
        out.push(HStmt::Assign {
            name: subj_name.clone(),
            value: s,
        });
        let matched = self.tmp("matched");
        scope.declare(&matched);
        out.push(HStmt::Assign {
            name: matched.clone(),
            value: HExpr::const_bool(false),
        });
        for arm in arms {
            let subject_load = HExpr::Name(subj_name.clone(), span.clone());
            let (test, mut binds) =
                self.lower_pattern(&arm.pattern, subject_load, scope, &arm.span)?;
            let mut arm_body = Vec::new();
            for s in &arm.body {
                self.lower_stmt(s, &mut arm_body, scope)?;
            }
            let mut guarded_body = vec![HStmt::Assign {
                name: matched.clone(),
                value: HExpr::const_bool(true),
            }];
            guarded_body.extend(arm_body);
            let inner = match &arm.guard {
                Some(g) => {
                    let guard = self.lower_expr(g, scope)?;
                    vec![HStmt::If {
                        cond: guard,
                        then: guarded_body,
                        orelse: Vec::new(),
                    }]
                }
                None => guarded_body,
            };
            binds.extend(inner);
            out.push(HStmt::If {
                cond: HExpr::And(
                    Box::new(HExpr::Not(Box::new(HExpr::Name(
                        matched.clone(),
                        span.clone(),
                    )))),
                    Box::new(test),
                ),
                then: binds,
                orelse: Vec::new(),
            });
        }
        Ok(())
    }

    /// A pattern lowers to (test expression, binding statements). The
    /// bindings run only after the test passed.
    fn lower_pattern(
        &mut self,
        pattern: &ast::Pattern,
        subject: HExpr,
        scope: &mut Scope,
        span: &Span,
    ) -> LResult<(HExpr, Vec<HStmt>)> {
        match pattern {
            ast::Pattern::Wildcard => Ok((HExpr::const_bool(true), Vec::new())),
            ast::Pattern::Capture(name) => {
                scope.declare(name);
                Ok((
                    HExpr::const_bool(true),
                    vec![HStmt::Assign {
                        name: name.clone(),
                        value: subject,
                    }],
                ))
            }
            ast::Pattern::Literal(lit) => {
                let l = self.lower_expr(lit, scope)?;
                Ok((
                    HExpr::Compare {
                        op: CmpOp::Eq,
                        left: Box::new(subject),
                        right: Box::new(l),
                        span: span.clone(),
                    },
                    Vec::new(),
                ))
            }
            ast::Pattern::Tuple(items) => {
                // Length test plus element tests; bindings from all
                // elements, in order.
                let mut test = HExpr::Compare {
                    op: CmpOp::Eq,
                    left: Box::new(HExpr::SeqLen(Box::new(subject.clone()), span.clone())),
                    right: Box::new(HExpr::const_int(items.len() as i64)),
                    span: span.clone(),
                };
                let mut binds = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    let elem = HExpr::Index {
                        obj: Box::new(subject.clone()),
                        index: Box::new(HExpr::const_int(i as i64)),
                        span: span.clone(),
                    };
                    let (sub_test, sub_binds) = self.lower_pattern(item, elem, scope, span)?;
                    test = HExpr::And(Box::new(test), Box::new(sub_test));
                    binds.extend(sub_binds);
                }
                Ok((test, binds))
            }
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn lower_expr(&mut self, e: &ast::Expr, scope: &mut Scope) -> LResult<HExpr> {
        let span = e.span.clone();
        Ok(match &e.kind {
            ast::ExprKind::Int(n) => HExpr::const_int(*n),
            ast::ExprKind::BigInt(text) => HExpr::Const(HConst::BigInt(text.clone())),
            ast::ExprKind::Float(f) => HExpr::Const(HConst::Float(*f)),
            ast::ExprKind::Str(s) => HExpr::Const(HConst::Str(s.clone())),
            ast::ExprKind::Bool(b) => HExpr::const_bool(*b),
            ast::ExprKind::NoneLit => HExpr::const_none(),
            ast::ExprKind::Name(n) => {
                if !scope.contains(n) && self.func_names.iter().any(|f| f == n) {
                    HExpr::FuncRef(n.clone())
                } else {
                    HExpr::Name(n.clone(), span)
                }
            }
            ast::ExprKind::Tuple(items) => {
                HExpr::MakeTuple(self.lower_exprs(items, scope)?)
            }
            ast::ExprKind::List(items) => HExpr::MakeList(self.lower_exprs(items, scope)?),
            ast::ExprKind::Set(items) => HExpr::MakeSet(self.lower_exprs(items, scope)?),
            ast::ExprKind::Map(pairs) => {
                let mut out = Vec::new();
                for (k, v) in pairs {
                    out.push((self.lower_expr(k, scope)?, self.lower_expr(v, scope)?));
                }
                HExpr::MakeMap(out)
            }
            ast::ExprKind::Unary { op, operand } => {
                let o = self.lower_expr(operand, scope)?;
                match op {
                    UnaryOp::Not => HExpr::Not(Box::new(o)),
                    UnaryOp::Neg => HExpr::Neg(Box::new(o), span),
                }
            }
            ast::ExprKind::Binary { op, left, right } => HExpr::Binary {
                op: *op,
                left: Box::new(self.lower_expr(left, scope)?),
                right: Box::new(self.lower_expr(right, scope)?),
                span,
            },
            ast::ExprKind::Compare { op, left, right } => HExpr::Compare {
                op: *op,
                left: Box::new(self.lower_expr(left, scope)?),
                right: Box::new(self.lower_expr(right, scope)?),
                span,
            },
            ast::ExprKind::BoolOp { op, left, right } => {
                let l = Box::new(self.lower_expr(left, scope)?);
                let r = Box::new(self.lower_expr(right, scope)?);
                match op {
                    BoolOpKind::And => HExpr::And(l, r),
                    BoolOpKind::Or => HExpr::Or(l, r),
                }
            }
            ast::ExprKind::Call { callee, args } => {
                self.lower_call(callee, args, scope, &span)?
            }
            ast::ExprKind::Attribute { value, name } => HExpr::Attr {
                obj: Box::new(self.lower_expr(value, scope)?),
                name: name.clone(),
                span,
            },
            ast::ExprKind::Subscript { value, index } => HExpr::Index {
                obj: Box::new(self.lower_expr(value, scope)?),
                index: Box::new(self.lower_expr(index, scope)?),
                span,
            },
            ast::ExprKind::Await(inner) => {
                HExpr::Await(Box::new(self.lower_expr(inner, scope)?), span)
            }
            ast::ExprKind::Yield(inner) => {
                let v = match inner {
                    Some(e) => self.lower_expr(e, scope)?,
                    None => HExpr::const_none(),
                };
                HExpr::Yield(Box::new(v), span)
            }
            ast::ExprKind::ListComp { elem, clauses } => {
                self.lower_comprehension(CompKind::List, elem, None, clauses, scope, &span)?
            }
            ast::ExprKind::SetComp { elem, clauses } => {
                self.lower_comprehension(CompKind::Set, elem, None, clauses, scope, &span)?
            }
            ast::ExprKind::MapComp {
                key,
                value,
                clauses,
            } => self.lower_comprehension(CompKind::Map, key, Some(value), clauses, scope, &span)?,
            ast::ExprKind::GenExp { elem, clauses } => {
                // A generator expression is the generator-function form
                // of the comprehension desugar.
                self.lower_comprehension(CompKind::Generator, elem, None, clauses, scope, &span)?
            }
        })
    }

    fn lower_exprs(&mut self, items: &[ast::Expr], scope: &mut Scope) -> LResult<Vec<HExpr>> {
        items
            .iter()
            .map(|e| self.lower_expr(e, scope))
            .collect()
    }

    fn lower_call(
        &mut self,
        callee: &ast::Expr,
        args: &[ast::Expr],
        scope: &mut Scope,
        span: &Span,
    ) -> LResult<HExpr> {
        // Method call sugar.
        if let ast::ExprKind::Attribute { value, name } = &callee.kind {
            return Ok(HExpr::CallMethod {
                obj: Box::new(self.lower_expr(value, scope)?),
                name: name.clone(),
                args: self.lower_exprs(args, scope)?,
                span: span.clone(),
            });
        }
        let ast::ExprKind::Name(name) = &callee.kind else {
            // Calling an arbitrary expression: a callable value.
            return Ok(HExpr::CallValue {
                callee: Box::new(self.lower_expr(callee, scope)?),
                args: self.lower_exprs(args, scope)?,
                span: span.clone(),
            });
        };

        if DYNAMIC_EXEC_FORMS.contains(&name.as_str()) && !scope.contains(name) {
            return Err(self.err(
                span,
                format!("dynamic code execution ('{}') is outside the supported subset", name),
            ));
        }

        // Local callable shadows everything.
        if scope.contains(name) {
            return Ok(HExpr::CallValue {
                callee: Box::new(HExpr::Name(name.clone(), span.clone())),
                args: self.lower_exprs(args, scope)?,
                span: span.clone(),
            });
        }

        // Error-kind constructors: KeyError("message").
        if let Some(kind) = ErrorKind::parse(name) {
            let message = match args.len() {
                0 => HExpr::const_str(""),
                1 => self.lower_expr(&args[0], scope)?,
                _ => return Err(self.err(span, "error constructors take one message")),
            };
            return Ok(HExpr::Intrinsic {
                id: Intrinsic::ErrNew,
                args: vec![HExpr::const_str(kind.name()), message],
                span: span.clone(),
            });
        }

        // Frontend builtins.
        if BUILTIN_NAMES.contains(&name.as_str()) {
            let lowered_args = self.lower_exprs(args, scope)?;
            return Ok(self
                .lower_builtin(name, lowered_args, span)?
                .expect("name is in the builtin table"));
        }

        // Module function or class constructor.
        if self.func_names.iter().any(|f| f == name) || self.class_names.iter().any(|c| c == name)
        {
            return Ok(HExpr::CallFunc {
                name: name.clone(),
                args: self.lower_exprs(args, scope)?,
                span: span.clone(),
            });
        }

        Err(self.err(span, format!("unknown function '{}'", name)))
    }

    /// The frontend builtin table: names that lower straight to
    /// intrinsic calls. `None` means the name is not a builtin.
    fn lower_builtin(
        &mut self,
        name: &str,
        args: Vec<HExpr>,
        span: &Span,
    ) -> LResult<Option<HExpr>> {
        let intr = |id, args| {
            Ok(Some(HExpr::Intrinsic {
                id,
                args,
                span: span.clone(),
            }))
        };
        let arity = |want: usize, args: &Vec<HExpr>| -> LResult<()> {
            if args.len() != want {
                Err(CompileError::at(
                    Stage::Lower,
                    span.clone(),
                    format!("{} takes {} argument(s), got {}", name, want, args.len()),
                ))
            } else {
                Ok(())
            }
        };
        match name {
            "print" => {
                arity(1, &args)?;
                intr(Intrinsic::Print, args)
            }
            "len" => {
                arity(1, &args)?;
                Ok(Some(HExpr::SeqLen(
                    Box::new(args.into_iter().next().expect("arity checked")),
                    span.clone(),
                )))
            }
            "str" => {
                arity(1, &args)?;
                let mut args = args;
                args.push(HExpr::const_str(""));
                intr(Intrinsic::NumFormat, args)
            }
            "hash" => {
                arity(1, &args)?;
                intr(Intrinsic::ValueHash, args)
            }
            "range" => Err(self.err(
                span,
                "range is only supported as a for-loop iterable",
            )),
            "spawn" => {
                arity(1, &args)?;
                intr(Intrinsic::TaskSpawn, args)
            }
            "sleep" => {
                arity(1, &args)?;
                intr(Intrinsic::TaskSleep, args)
            }
            "join" => {
                arity(1, &args)?;
                intr(Intrinsic::TaskJoin, args)
            }
            "cancel" => {
                arity(1, &args)?;
                intr(Intrinsic::TaskCancel, args)
            }
            "current_task" => {
                arity(0, &args)?;
                intr(Intrinsic::TaskCurrent, args)
            }
            "yield_now" => {
                arity(0, &args)?;
                intr(Intrinsic::TaskYield, args)
            }
            "channel" => {
                arity(1, &args)?;
                intr(Intrinsic::ChanNew, args)
            }
            "send" => {
                arity(2, &args)?;
                intr(Intrinsic::ChanSend, args)
            }
            "recv" => {
                arity(1, &args)?;
                intr(Intrinsic::ChanRecv, args)
            }
            "try_send" => {
                arity(2, &args)?;
                intr(Intrinsic::ChanTrySend, args)
            }
            "try_recv" => {
                arity(1, &args)?;
                intr(Intrinsic::ChanTryRecv, args)
            }
            "close_channel" => {
                arity(1, &args)?;
                intr(Intrinsic::ChanClose, args)
            }
            "open" => {
                arity(2, &args)?;
                intr(Intrinsic::IoOpen, args)
            }
            "read" => {
                arity(2, &args)?;
                intr(Intrinsic::IoRead, args)
            }
            "write" => {
                arity(2, &args)?;
                intr(Intrinsic::IoWrite, args)
            }
            "close" => {
                arity(1, &args)?;
                intr(Intrinsic::IoClose, args)
            }
            "env_get" => {
                arity(1, &args)?;
                intr(Intrinsic::EnvGet, args)
            }
            "env_set" => {
                arity(2, &args)?;
                intr(Intrinsic::EnvSet, args)
            }
            "monotonic" => {
                arity(0, &args)?;
                intr(Intrinsic::TimeMonotonic, args)
            }
            "perf_counter" => {
                arity(0, &args)?;
                intr(Intrinsic::TimePerf, args)
            }
            "wall_clock" => {
                arity(0, &args)?;
                intr(Intrinsic::TimeWall, args)
            }
            "random_bytes" => {
                arity(1, &args)?;
                intr(Intrinsic::RandomSecure, args)
            }
            "parallel_for" => {
                arity(3, &args)?;
                intr(Intrinsic::ParallelFor, args)
            }
            "parallel_reduce" => {
                arity(5, &args)?;
                intr(Intrinsic::ParallelReduce, args)
            }
            _ => Ok(None),
        }
    }

    /// Comprehension desugar: a synthesized function taking the free
    /// names as parameters, returning the accumulated container (or
    /// yielding, for generator form).
    fn lower_comprehension(
        &mut self,
        kind: CompKind,
        elem: &ast::Expr,
        map_value: Option<&ast::Expr>,
        clauses: &[ast::CompClause],
        scope: &mut Scope,
        span: &Span,
    ) -> LResult<HExpr> {
        // Free names: referenced in the comprehension, bound outside it.
        let mut bound = Vec::new();
        for clause in clauses {
            collect_target_names(&clause.target, &mut bound);
        }
        let mut used = Vec::new();
        collect_expr_names(elem, &mut used);
        if let Some(v) = map_value {
            collect_expr_names(v, &mut used);
        }
        for clause in clauses {
            collect_expr_names(&clause.iter, &mut used);
            for c in &clause.conds {
                collect_expr_names(c, &mut used);
            }
        }
        let captures: Vec<String> = used
            .into_iter()
            .filter(|n| scope.contains(n) && !bound.contains(n))
            .collect();

        // Build the synthesized body. Clause targets are in scope
        // before any clause expression lowers, so a target that shadows
        // a module function resolves as a local.
        let mut inner_scope = Scope::new(&captures);
        for name in &bound {
            inner_scope.declare(name);
        }
        let acc = self.tmp("acc");
        inner_scope.declare(&acc);
        let mut body = Vec::new();
        let acc_init = match kind {
            CompKind::List | CompKind::Generator => HExpr::MakeList(Vec::new()),
            CompKind::Set => HExpr::MakeSet(Vec::new()),
            CompKind::Map => HExpr::MakeMap(Vec::new()),
        };
        if kind != CompKind::Generator {
            body.push(HStmt::Assign {
                name: acc.clone(),
                value: acc_init,
            });
        }

        // Innermost statement: accumulate or yield.
        let elem_h = self.lower_expr_in(elem, &mut inner_scope)?;
        let innermost = match kind {
            CompKind::List => HStmt::Expr(HExpr::Intrinsic {
                id: Intrinsic::ListPush,
                args: vec![HExpr::Name(acc.clone(), span.clone()), elem_h],
                span: span.clone(),
            }),
            CompKind::Set => HStmt::Expr(HExpr::Intrinsic {
                id: Intrinsic::SetAdd,
                args: vec![HExpr::Name(acc.clone(), span.clone()), elem_h],
                span: span.clone(),
            }),
            CompKind::Map => {
                let v = self.lower_expr_in(
                    map_value.expect("map comprehension has a value"),
                    &mut inner_scope,
                )?;
                HStmt::Expr(HExpr::Intrinsic {
                    id: Intrinsic::MapSet,
                    args: vec![HExpr::Name(acc.clone(), span.clone()), elem_h, v],
                    span: span.clone(),
                })
            }
            CompKind::Generator => HStmt::Expr(HExpr::Yield(Box::new(elem_h), span.clone())),
        };

        // Wrap innermost in condition tests and loops, inside-out.
        let mut current = vec![innermost];
        for clause in clauses.iter().rev() {
            for cond in clause.conds.iter().rev() {
                let c = self.lower_expr_in(cond, &mut inner_scope)?;
                current = vec![HStmt::If {
                    cond: c,
                    then: current,
                    orelse: Vec::new(),
                }];
            }
            let mut loop_out = Vec::new();
            let body_stmts = std::mem::take(&mut current);
            self.lower_for_clause(clause, body_stmts, &mut loop_out, &mut inner_scope)?;
            current = loop_out;
        }
        body.extend(current);
        if kind != CompKind::Generator {
            body.push(HStmt::Return(HExpr::Name(acc, span.clone())));
        }

        let comp_name = format!("{}$comp{}", self.module_name, self.functions.len());
        let idx = self.functions.len();
        self.functions.push(HirFunc {
            name: comp_name.clone(),
            symbol: Symbol::new(
                comp_name.clone(),
                span.clone(),
                SymbolKind::Function,
                "comprehension",
            ),
            params: captures.clone(),
            body,
            is_async: false,
            is_generator: kind == CompKind::Generator,
            self_class: None,
            span: span.clone(),
        });
        self.func_names.push(comp_name.clone());
        let _ = idx;

        Ok(HExpr::CallFunc {
            name: comp_name,
            args: captures
                .iter()
                .map(|n| HExpr::Name(n.clone(), span.clone()))
                .collect(),
            span: span.clone(),
        })
    }

    /// Lower one comprehension `for` clause around the prepared body.
    fn lower_for_clause(
        &mut self,
        clause: &ast::CompClause,
        body: Vec<HStmt>,
        out: &mut Vec<HStmt>,
        scope: &mut Scope,
    ) -> LResult<()> {
        let span = clause.iter.span.clone();
        let it_name = self.tmp("iter");
        scope.declare(&it_name);
        let iter_h = self.lower_expr_in(&clause.iter, scope)?;
        out.push(HStmt::Assign {
            name: it_name.clone(),
            value: HExpr::IterAcquire(Box::new(iter_h), span.clone()),
        });
        let step_name = self.tmp("step");
        scope.declare(&step_name);
        let mut loop_body = vec![
            HStmt::Assign {
                name: step_name.clone(),
                value: HExpr::IterStep(Box::new(HExpr::Name(it_name.clone(), span.clone()))),
            },
            HStmt::If {
                cond: HExpr::Intrinsic {
                    id: Intrinsic::TupleGet,
                    args: vec![
                        HExpr::Name(step_name.clone(), span.clone()),
                        HExpr::const_int(1),
                    ],
                    span: span.clone(),
                },
                then: vec![HStmt::Break],
                orelse: Vec::new(),
            },
        ];
        self.lower_assign(
            &clause.target,
            HExpr::Intrinsic {
                id: Intrinsic::TupleGet,
                args: vec![
                    HExpr::Name(step_name, span.clone()),
                    HExpr::const_int(0),
                ],
                span: span.clone(),
            },
            &mut loop_body,
            scope,
        )?;
        loop_body.extend(body);
        out.push(HStmt::While {
            cond: HExpr::const_bool(true),
            body: loop_body,
        });
        Ok(())
    }

    fn lower_expr_in(&mut self, e: &ast::Expr, scope: &mut Scope) -> LResult<HExpr> {
        self.lower_expr(e, scope)
    }

    fn target_as_expr(&mut self, target: &ast::Target, scope: &mut Scope) -> LResult<HExpr> {
        match target {
            ast::Target::Name(n, span) => Ok(HExpr::Name(n.clone(), span.clone())),
            ast::Target::Subscript { value, index, span } => Ok(HExpr::Index {
                obj: Box::new(self.lower_expr(value, scope)?),
                index: Box::new(self.lower_expr(index, scope)?),
                span: span.clone(),
            }),
            ast::Target::Attribute { value, name, span } => Ok(HExpr::Attr {
                obj: Box::new(self.lower_expr(value, scope)?),
                name: name.clone(),
                span: span.clone(),
            }),
            other => Err(self.err(
                other.span(),
                "augmented assignment target must be a name, subscript, or attribute",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompKind {
    List,
    Set,
    Map,
    Generator,
}

// =============================================================================
// Small tree walks
// =============================================================================

fn collect_self_fields(body: &[ast::Stmt], fields: &mut Vec<String>) {
    for stmt in body {
        match &stmt.kind {
            ast::StmtKind::Assign { target, .. } => collect_self_fields_target(target, fields),
            ast::StmtKind::If { then, orelse, .. } => {
                collect_self_fields(then, fields);
                collect_self_fields(orelse, fields);
            }
            ast::StmtKind::While { body, .. } | ast::StmtKind::For { body, .. } => {
                collect_self_fields(body, fields);
            }
            _ => {}
        }
    }
}

fn collect_self_fields_target(target: &ast::Target, fields: &mut Vec<String>) {
    match target {
        ast::Target::Attribute { value, name, .. } => {
            if matches!(&value.kind, ast::ExprKind::Name(n) if n == "self")
                && !fields.contains(name)
            {
                fields.push(name.clone());
            }
        }
        ast::Target::Tuple(items, _) => {
            for t in items {
                collect_self_fields_target(t, fields);
            }
        }
        _ => {}
    }
}

fn collect_target_names(target: &ast::Target, out: &mut Vec<String>) {
    match target {
        ast::Target::Name(n, _) => out.push(n.clone()),
        ast::Target::Tuple(items, _) => {
            for t in items {
                collect_target_names(t, out);
            }
        }
        ast::Target::Starred(inner, _) => collect_target_names(inner, out),
        _ => {}
    }
}

fn collect_expr_names(e: &ast::Expr, out: &mut Vec<String>) {
    use ast::ExprKind as K;
    match &e.kind {
        K::Name(n) => out.push(n.clone()),
        K::Tuple(items) | K::List(items) | K::Set(items) => {
            for i in items {
                collect_expr_names(i, out);
            }
        }
        K::Map(pairs) => {
            for (k, v) in pairs {
                collect_expr_names(k, out);
                collect_expr_names(v, out);
            }
        }
        K::Unary { operand, .. } => collect_expr_names(operand, out),
        K::Binary { left, right, .. }
        | K::Compare { left, right, .. }
        | K::BoolOp { left, right, .. } => {
            collect_expr_names(left, out);
            collect_expr_names(right, out);
        }
        K::Call { callee, args } => {
            collect_expr_names(callee, out);
            for a in args {
                collect_expr_names(a, out);
            }
        }
        K::Attribute { value, .. } => collect_expr_names(value, out),
        K::Subscript { value, index } => {
            collect_expr_names(value, out);
            collect_expr_names(index, out);
        }
        K::Await(inner) => collect_expr_names(inner, out),
        K::Yield(Some(inner)) => collect_expr_names(inner, out),
        K::ListComp { elem, clauses }
        | K::SetComp { elem, clauses }
        | K::GenExp { elem, clauses } => {
            collect_expr_names(elem, out);
            for c in clauses {
                collect_expr_names(&c.iter, out);
                for cond in &c.conds {
                    collect_expr_names(cond, out);
                }
            }
        }
        K::MapComp { key, value, clauses } => {
            collect_expr_names(key, out);
            collect_expr_names(value, out);
            for c in clauses {
                collect_expr_names(&c.iter, out);
                for cond in &c.conds {
                    collect_expr_names(cond, out);
                }
            }
        }
        _ => {}
    }
}

fn body_has_yield(body: &[HStmt]) -> bool {
    fn expr_has_yield(e: &HExpr) -> bool {
        match e {
            HExpr::Yield(..) => true,
            HExpr::And(l, r) | HExpr::Or(l, r) => expr_has_yield(l) || expr_has_yield(r),
            HExpr::Not(x) | HExpr::Neg(x, _) | HExpr::SeqLen(x, _) => expr_has_yield(x),
            HExpr::Binary { left, right, .. } | HExpr::Compare { left, right, .. } => {
                expr_has_yield(left) || expr_has_yield(right)
            }
            HExpr::MakeTuple(xs) | HExpr::MakeList(xs) | HExpr::MakeSet(xs) => {
                xs.iter().any(expr_has_yield)
            }
            HExpr::MakeMap(pairs) => pairs
                .iter()
                .any(|(k, v)| expr_has_yield(k) || expr_has_yield(v)),
            HExpr::CallFunc { args, .. } | HExpr::Intrinsic { args, .. } => {
                args.iter().any(expr_has_yield)
            }
            HExpr::CallValue { callee, args, .. } => {
                expr_has_yield(callee) || args.iter().any(expr_has_yield)
            }
            HExpr::CallMethod { obj, args, .. } => {
                expr_has_yield(obj) || args.iter().any(expr_has_yield)
            }
            HExpr::Index { obj, index, .. } => expr_has_yield(obj) || expr_has_yield(index),
            HExpr::Attr { obj, .. } => expr_has_yield(obj),
            HExpr::IterAcquire(x, _) | HExpr::IterStep(x) | HExpr::Await(x, _) => {
                expr_has_yield(x)
            }
            _ => false,
        }
    }
    fn stmt_has_yield(s: &HStmt) -> bool {
        match s {
            HStmt::Expr(e) | HStmt::Assign { value: e, .. } | HStmt::Return(e) => {
                expr_has_yield(e)
            }
            HStmt::StoreIndex { obj, index, value } => {
                expr_has_yield(obj) || expr_has_yield(index) || expr_has_yield(value)
            }
            HStmt::StoreAttr { obj, value, .. } => expr_has_yield(obj) || expr_has_yield(value),
            HStmt::If { cond, then, orelse } => {
                expr_has_yield(cond)
                    || then.iter().any(stmt_has_yield)
                    || orelse.iter().any(stmt_has_yield)
            }
            HStmt::While { cond, body } => {
                expr_has_yield(cond) || body.iter().any(stmt_has_yield)
            }
            HStmt::Raise { exc, cause, .. } => {
                expr_has_yield(exc) || cause.as_ref().map(expr_has_yield).unwrap_or(false)
            }
            HStmt::Try {
                body,
                handlers,
                finally,
            } => {
                body.iter().any(stmt_has_yield)
                    || handlers.iter().any(|h| h.body.iter().any(stmt_has_yield))
                    || finally.iter().any(stmt_has_yield)
            }
            HStmt::Break | HStmt::Continue => false,
        }
    }
    body.iter().any(stmt_has_yield)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn lower(src: &str) -> HirModule {
        let m = parse(src, "test.mt", "test").expect("parse");
        lower_module(&m).expect("lower")
    }

    fn lower_err(src: &str) -> CompileError {
        let m = parse(src, "test.mt", "test").expect("parse");
        lower_module(&m).expect_err("expected lowering error")
    }

    #[test]
    fn test_for_becomes_while_over_iterator() {
        let h = lower("def f(xs):\n    for x in xs:\n        print(x)\n");
        let f = &h.functions[0];
        // No For remains; the loop is a While and the body acquires an
        // iterator first.
        assert!(f.body.iter().any(|s| matches!(s, HStmt::While { .. })));
        assert!(f
            .body
            .iter()
            .any(|s| matches!(s, HStmt::Assign { value: HExpr::IterAcquire(..), .. })));
    }

    #[test]
    fn test_range_for_becomes_counted_loop() {
        let h = lower("def f(n):\n    for i in range(n):\n        print(i)\n");
        let f = &h.functions[0];
        // Counted loop: no iterator acquisition at all.
        assert!(!f
            .body
            .iter()
            .any(|s| matches!(s, HStmt::Assign { value: HExpr::IterAcquire(..), .. })));
        assert!(f.body.iter().any(|s| matches!(s, HStmt::While { .. })));
    }

    #[test]
    fn test_with_becomes_try_finally() {
        let h = lower("def f(r):\n    with r as h:\n        print(h)\n");
        let f = &h.functions[0];
        let has_try_finally = f.body.iter().any(|s| {
            matches!(s, HStmt::Try { finally, handlers, .. }
                if !finally.is_empty() && handlers.is_empty())
        });
        assert!(has_try_finally);
    }

    #[test]
    fn test_comprehension_synthesizes_function() {
        let h = lower("def f(xs, k):\n    return [x * k for x in xs if x > 0]\n");
        // f plus the synthesized comprehension function plus module init.
        assert_eq!(h.functions.len(), 3);
        let comp = h
            .functions
            .iter()
            .find(|f| f.name.contains("$comp"))
            .expect("synthesized comprehension function");
        // The free name `k` (and the iterable `xs`) become parameters.
        assert!(comp.params.contains(&"k".to_string()));
        assert!(comp.params.contains(&"xs".to_string()));
        assert!(!comp.is_generator);
    }

    #[test]
    fn test_genexp_is_generator_function() {
        let h = lower("def f(xs):\n    return (x for x in xs)\n");
        let comp = h
            .functions
            .iter()
            .find(|f| f.name.contains("$comp"))
            .expect("synthesized generator function");
        assert!(comp.is_generator);
    }

    #[test]
    fn test_match_lowering_produces_decision_tree() {
        let h = lower(
            "def f(x):\n    match x:\n        case 0:\n            return 1\n        case (a, b):\n            return a\n        case _:\n            return 2\n",
        );
        let f = &h.functions[0];
        // Three arms -> three guarded ifs after the two seed assigns.
        let ifs = f
            .body
            .iter()
            .filter(|s| matches!(s, HStmt::If { .. }))
            .count();
        assert_eq!(ifs, 3);
    }

    #[test]
    fn test_starred_unpack_linearized() {
        let h = lower("def f(xs):\n    a, *mid, b = xs\n    return mid\n");
        let f = &h.functions[0];
        // The rest-loop shows up as a While; stores are primitive.
        assert!(f.body.iter().any(|s| matches!(s, HStmt::While { .. })));
    }

    #[test]
    fn test_dynamic_exec_rejected() {
        let e = lower_err("def f(s):\n    return eval(s)\n");
        assert!(e.message.contains("dynamic code execution"));
        assert_eq!(e.span.as_ref().unwrap().line, 2);
    }

    #[test]
    fn test_unknown_error_kind_rejected() {
        let e = lower_err("def f():\n    try:\n        pass\n    except Bogus:\n        pass\n");
        assert!(e.message.contains("unknown error kind"));
    }

    #[test]
    fn test_error_constructor_lowers_to_err_new() {
        let h = lower("def f():\n    raise KeyError(\"missing\")\n");
        let f = &h.functions[0];
        assert!(f.body.iter().any(|s| matches!(
            s,
            HStmt::Raise {
                exc: HExpr::Intrinsic {
                    id: Intrinsic::ErrNew,
                    ..
                },
                ..
            }
        )));
    }

    #[test]
    fn test_class_fields_discovered_in_order() {
        let h = lower(
            "class Point:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\n",
        );
        assert_eq!(h.classes.len(), 1);
        assert_eq!(h.classes[0].fields, vec!["x", "y"]);
        assert_eq!(h.classes[0].methods.len(), 1);
    }

    #[test]
    fn test_generator_flag_from_yield() {
        let h = lower("def g(n):\n    for i in range(n):\n        yield i\n");
        assert!(h.functions[0].is_generator);
    }

    #[test]
    fn test_nested_def_rejected() {
        let e = lower_err("def f():\n    def g():\n        pass\n    return g\n");
        assert!(e.message.contains("nested function"));
    }
}
