//! Parser
//!
//! Recursive descent over the lexer's token stream. Indentation already
//! arrives as `Indent`/`Dedent` tokens, so blocks parse like bracketed
//! regions. The parser builds the surface AST only; all desugaring
//! happens in HIR lowering.

use crate::ast::*;
use crate::diag::{CompileError, Stage};
use crate::lexer::{Tok, Token};
use crate::source::Span;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
}

type PResult<T> = Result<T, CompileError>;

impl Parser {
    pub fn new(tokens: Vec<Token>, file: &str) -> Self {
        Parser {
            tokens,
            pos: 0,
            file: file.to_string(),
        }
    }

    /// Parse a whole module.
    pub fn parse_module(mut self, module_name: &str) -> PResult<Module> {
        let mut body = Vec::new();
        let mut imports = Vec::new();
        while !self.check(&Tok::EndOfFile) {
            let stmt = self.parse_stmt()?;
            if let StmtKind::Import { module } = &stmt.kind {
                imports.push(module.clone());
            }
            body.push(stmt);
        }
        Ok(Module {
            name: module_name.to_string(),
            file: self.file.clone(),
            imports,
            body,
        })
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos].span.clone()
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> PResult<Token> {
        if self.check(tok) {
            Ok(self.advance())
        } else {
            Err(self.err(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(Stage::Parse, self.peek_span(), message)
    }

    fn expect_name(&mut self, what: &str) -> PResult<(String, Span)> {
        let span = self.peek_span();
        match self.peek().clone() {
            Tok::Name(n) => {
                self.advance();
                Ok((n, span))
            }
            other => Err(self.err(format!("expected {}, found {:?}", what, other))),
        }
    }

    fn expect_newline(&mut self) -> PResult<()> {
        self.expect(&Tok::Newline, "end of statement")?;
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&Tok::Colon, "':'")?;
        self.expect_newline()?;
        self.expect(&Tok::Indent, "indented block")?;
        let mut body = Vec::new();
        while !self.check(&Tok::Dedent) && !self.check(&Tok::EndOfFile) {
            body.push(self.parse_stmt()?);
        }
        self.expect(&Tok::Dedent, "dedent")?;
        Ok(body)
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        match self.peek().clone() {
            Tok::KwIf => self.parse_if(),
            Tok::KwWhile => self.parse_while(),
            Tok::KwFor => self.parse_for(),
            Tok::KwDef => self.parse_def(false),
            Tok::KwAsync => {
                self.advance();
                if !self.check(&Tok::KwDef) {
                    return Err(self.err("expected 'def' after 'async'"));
                }
                self.parse_def(true)
            }
            Tok::KwClass => self.parse_class(),
            Tok::KwWith => self.parse_with(),
            Tok::KwTry => self.parse_try(),
            Tok::KwMatch => self.parse_match(),
            Tok::KwReturn => {
                self.advance();
                let value = if self.check(&Tok::Newline) {
                    None
                } else {
                    Some(self.parse_expr_list()?)
                };
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Return(value),
                    span,
                })
            }
            Tok::KwPass => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Pass,
                    span,
                })
            }
            Tok::KwBreak => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span,
                })
            }
            Tok::KwContinue => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span,
                })
            }
            Tok::KwImport => {
                self.advance();
                let (module, _) = self.expect_name("module name")?;
                let mut full = module;
                while self.eat(&Tok::Dot) {
                    let (part, _) = self.expect_name("module path segment")?;
                    full.push('.');
                    full.push_str(&part);
                }
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Import { module: full },
                    span,
                })
            }
            Tok::KwRaise => {
                self.advance();
                let (exc, cause) = if self.check(&Tok::Newline) {
                    (None, None)
                } else {
                    let exc = self.parse_expr()?;
                    let cause = if self.eat(&Tok::KwFrom) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    (Some(exc), cause)
                };
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Raise { exc, cause },
                    span,
                })
            }
            Tok::KwAssert => {
                self.advance();
                let cond = self.parse_expr()?;
                let message = if self.eat(&Tok::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Assert { cond, message },
                    span,
                })
            }
            _ => self.parse_expr_or_assign(),
        }
    }

    /// Expression statement, assignment, or augmented assignment. The
    /// left side parses as an expression list (stars allowed) and is
    /// converted to a target if an `=` follows.
    fn parse_expr_or_assign(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        let (exprs, has_star) = self.parse_star_expr_list()?;
        match self.peek().clone() {
            Tok::Assign => {
                self.advance();
                let target = self.exprs_to_target(exprs, has_star, &span)?;
                let value = self.parse_expr_list()?;
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Assign { target, value },
                    span,
                })
            }
            aug @ (Tok::PlusAssign | Tok::MinusAssign | Tok::StarAssign) => {
                self.advance();
                if has_star || exprs.len() != 1 {
                    return Err(CompileError::at(
                        Stage::Parse,
                        span,
                        "augmented assignment needs a single target",
                    ));
                }
                let target = self.exprs_to_target(exprs, false, &span)?;
                let op = match aug {
                    Tok::PlusAssign => BinOp::Add,
                    Tok::MinusAssign => BinOp::Sub,
                    _ => BinOp::Mul,
                };
                let value = self.parse_expr()?;
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::AugAssign { target, op, value },
                    span,
                })
            }
            _ => {
                if has_star {
                    return Err(CompileError::at(
                        Stage::Parse,
                        span,
                        "starred expression outside assignment target",
                    ));
                }
                let expr = self.exprs_to_expr(exprs, &span);
                self.expect_newline()?;
                Ok(Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                })
            }
        }
    }

    /// Comma-separated expressions where `*expr` items are permitted.
    /// Returns the items (star markers encoded as a leading `*` entry in
    /// `stars`) and whether any star occurred.
    fn parse_star_expr_list(&mut self) -> PResult<(Vec<(bool, Expr)>, bool)> {
        let mut items = Vec::new();
        let mut any_star = false;
        loop {
            let star = self.eat(&Tok::Star);
            any_star |= star;
            items.push((star, self.parse_expr()?));
            if !self.eat(&Tok::Comma) {
                break;
            }
            if self.check(&Tok::Newline) || self.check(&Tok::Assign) {
                break; // trailing comma
            }
        }
        Ok((items, any_star))
    }

    fn exprs_to_expr(&self, mut exprs: Vec<(bool, Expr)>, span: &Span) -> Expr {
        if exprs.len() == 1 {
            exprs.remove(0).1
        } else {
            Expr {
                kind: ExprKind::Tuple(exprs.into_iter().map(|(_, e)| e).collect()),
                span: span.clone(),
            }
        }
    }

    fn exprs_to_target(
        &self,
        exprs: Vec<(bool, Expr)>,
        _has_star: bool,
        span: &Span,
    ) -> PResult<Target> {
        let mut targets = Vec::new();
        let single = exprs.len() == 1;
        for (star, e) in exprs {
            let t = self.expr_to_target(e)?;
            targets.push(if star {
                Target::Starred(Box::new(t), span.clone())
            } else {
                t
            });
        }
        if single {
            Ok(targets.remove(0))
        } else {
            Ok(Target::Tuple(targets, span.clone()))
        }
    }

    /// Convert an already-parsed expression into an assignment target.
    /// Anything else is an invalid-assignment-target error at the
    /// expression's own location.
    fn expr_to_target(&self, e: Expr) -> PResult<Target> {
        let span = e.span.clone();
        match e.kind {
            ExprKind::Name(n) => Ok(Target::Name(n, span)),
            ExprKind::Tuple(items) => {
                let mut targets = Vec::new();
                for item in items {
                    targets.push(self.expr_to_target(item)?);
                }
                Ok(Target::Tuple(targets, span))
            }
            ExprKind::Subscript { value, index } => Ok(Target::Subscript {
                value,
                index,
                span,
            }),
            ExprKind::Attribute { value, name } => Ok(Target::Attribute { value, name, span }),
            _ => Err(CompileError::at(
                Stage::Parse,
                span,
                "invalid assignment target",
            )),
        }
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance(); // if / elif
        let cond = self.parse_expr()?;
        let then = self.parse_block()?;
        let orelse = if self.check(&Tok::KwElif) {
            vec![self.parse_if()?]
        } else if self.eat(&Tok::KwElse) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { cond, then, orelse },
            span,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance();
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::While { cond, body },
            span,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance();
        let (exprs, has_star) = self.parse_star_expr_list_until(&Tok::KwIn)?;
        let target = self.exprs_to_target(exprs, has_star, &span)?;
        self.expect(&Tok::KwIn, "'in'")?;
        let iter = self.parse_expr_list()?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            span,
        })
    }

    /// Like `parse_star_expr_list` but stops before `until` (used for
    /// `for ... in`).
    fn parse_star_expr_list_until(&mut self, until: &Tok) -> PResult<(Vec<(bool, Expr)>, bool)> {
        let mut items = Vec::new();
        let mut any_star = false;
        loop {
            let star = self.eat(&Tok::Star);
            any_star |= star;
            items.push((star, self.parse_expr()?));
            if !self.eat(&Tok::Comma) {
                break;
            }
            if self.check(until) {
                break;
            }
        }
        Ok((items, any_star))
    }

    fn parse_def(&mut self, is_async: bool) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance(); // def
        let (name, _) = self.expect_name("function name")?;
        self.expect(&Tok::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.check(&Tok::RParen) {
            let (p, _) = self.expect_name("parameter name")?;
            params.push(p);
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::Def(FuncDef {
                name,
                params,
                body,
                is_async,
                span: span.clone(),
            }),
            span,
        })
    }

    fn parse_class(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance();
        let (name, _) = self.expect_name("class name")?;
        self.expect(&Tok::Colon, "':'")?;
        self.expect_newline()?;
        self.expect(&Tok::Indent, "class body")?;
        let mut methods = Vec::new();
        while !self.check(&Tok::Dedent) && !self.check(&Tok::EndOfFile) {
            if self.eat(&Tok::KwPass) {
                self.expect_newline()?;
                continue;
            }
            match self.parse_stmt()? {
                Stmt {
                    kind: StmtKind::Def(f),
                    ..
                } => methods.push(f),
                other => {
                    return Err(CompileError::at(
                        Stage::Parse,
                        other.span,
                        "only method definitions are supported in class bodies",
                    ))
                }
            }
        }
        self.expect(&Tok::Dedent, "dedent")?;
        Ok(Stmt {
            kind: StmtKind::ClassDef(ClassDef {
                name,
                methods,
                span: span.clone(),
            }),
            span,
        })
    }

    fn parse_with(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance();
        let ctx = self.parse_expr()?;
        let name = if self.eat(&Tok::KwAs) {
            Some(self.expect_name("binding name")?.0)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::With { ctx, name, body },
            span,
        })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.check(&Tok::KwExcept) {
            let hspan = self.peek_span();
            self.advance();
            let kind = if self.check(&Tok::Colon) {
                None
            } else {
                Some(self.expect_name("error kind")?.0)
            };
            let name = if self.eat(&Tok::KwAs) {
                Some(self.expect_name("binding name")?.0)
            } else {
                None
            };
            let hbody = self.parse_block()?;
            handlers.push(Handler {
                kind,
                name,
                body: hbody,
                span: hspan,
            });
        }
        let finally = if self.eat(&Tok::KwFinally) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finally.is_empty() {
            return Err(CompileError::at(
                Stage::Parse,
                span,
                "try needs at least one except or finally clause",
            ));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                finally,
            },
            span,
        })
    }

    fn parse_match(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        self.advance();
        let subject = self.parse_expr()?;
        self.expect(&Tok::Colon, "':'")?;
        self.expect_newline()?;
        self.expect(&Tok::Indent, "match body")?;
        let mut arms = Vec::new();
        while self.check(&Tok::KwCase) {
            let aspan = self.peek_span();
            self.advance();
            let pattern = self.parse_pattern()?;
            let guard = if self.eat(&Tok::KwIf) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            let body = self.parse_block()?;
            arms.push(MatchArm {
                pattern,
                guard,
                body,
                span: aspan,
            });
        }
        self.expect(&Tok::Dedent, "dedent")?;
        if arms.is_empty() {
            return Err(CompileError::at(
                Stage::Parse,
                span,
                "match needs at least one case",
            ));
        }
        Ok(Stmt {
            kind: StmtKind::Match { subject, arms },
            span,
        })
    }

    fn parse_pattern(&mut self) -> PResult<Pattern> {
        // Bare comma list is a tuple pattern.
        let first = self.parse_pattern_atom()?;
        if !self.check(&Tok::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.check(&Tok::Colon) || self.check(&Tok::KwIf) {
                break;
            }
            items.push(self.parse_pattern_atom()?);
        }
        Ok(Pattern::Tuple(items))
    }

    fn parse_pattern_atom(&mut self) -> PResult<Pattern> {
        let span = self.peek_span();
        match self.peek().clone() {
            Tok::LParen => {
                self.advance();
                let mut items = vec![self.parse_pattern_atom()?];
                while self.eat(&Tok::Comma) {
                    if self.check(&Tok::RParen) {
                        break;
                    }
                    items.push(self.parse_pattern_atom()?);
                }
                self.expect(&Tok::RParen, "')'")?;
                if items.len() == 1 {
                    Ok(items.remove(0))
                } else {
                    Ok(Pattern::Tuple(items))
                }
            }
            Tok::Int(n) => {
                self.advance();
                Ok(Pattern::Literal(Expr {
                    kind: ExprKind::Int(n),
                    span,
                }))
            }
            Tok::Minus => {
                self.advance();
                match self.peek().clone() {
                    Tok::Int(n) => {
                        self.advance();
                        Ok(Pattern::Literal(Expr {
                            kind: ExprKind::Int(-n),
                            span,
                        }))
                    }
                    _ => Err(self.err("expected integer after '-' in pattern")),
                }
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Pattern::Literal(Expr {
                    kind: ExprKind::Str(s),
                    span,
                }))
            }
            Tok::KwTrue => {
                self.advance();
                Ok(Pattern::Literal(Expr {
                    kind: ExprKind::Bool(true),
                    span,
                }))
            }
            Tok::KwFalse => {
                self.advance();
                Ok(Pattern::Literal(Expr {
                    kind: ExprKind::Bool(false),
                    span,
                }))
            }
            Tok::KwNone => {
                self.advance();
                Ok(Pattern::Literal(Expr {
                    kind: ExprKind::NoneLit,
                    span,
                }))
            }
            Tok::Name(n) => {
                self.advance();
                if n == "_" {
                    Ok(Pattern::Wildcard)
                } else {
                    Ok(Pattern::Capture(n))
                }
            }
            other => Err(self.err(format!("unsupported pattern {:?}", other))),
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// An expression list: `a, b, c` makes a tuple.
    fn parse_expr_list(&mut self) -> PResult<Expr> {
        let span = self.peek_span();
        let first = self.parse_expr()?;
        if !self.check(&Tok::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.check(&Tok::Newline) || self.check(&Tok::RParen) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span,
        })
    }

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        let span = self.peek_span();
        if self.eat(&Tok::KwYield) {
            let value = if self.check(&Tok::Newline)
                || self.check(&Tok::RParen)
                || self.check(&Tok::Comma)
            {
                None
            } else {
                Some(Box::new(self.parse_or()?))
            };
            return Ok(Expr {
                kind: ExprKind::Yield(value),
                span,
            });
        }
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        while self.check(&Tok::KwOr) {
            let span = self.peek_span();
            self.advance();
            let right = self.parse_and()?;
            left = Expr {
                kind: ExprKind::BoolOp {
                    op: BoolOpKind::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_not()?;
        while self.check(&Tok::KwAnd) {
            let span = self.peek_span();
            self.advance();
            let right = self.parse_not()?;
            left = Expr {
                kind: ExprKind::BoolOp {
                    op: BoolOpKind::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.check(&Tok::KwNot) {
            let span = self.peek_span();
            self.advance();
            // `not x in y` parses as `not (x in y)`.
            let operand = self.parse_not()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let left = self.parse_arith()?;
        let span = self.peek_span();
        let op = match self.peek() {
            Tok::Eq => CmpOp::Eq,
            Tok::Ne => CmpOp::Ne,
            Tok::Lt => CmpOp::Lt,
            Tok::Le => CmpOp::Le,
            Tok::Gt => CmpOp::Gt,
            Tok::Ge => CmpOp::Ge,
            Tok::KwIn => CmpOp::In,
            Tok::KwNot => {
                // `not in`
                if matches!(self.tokens.get(self.pos + 1).map(|t| &t.tok), Some(Tok::KwIn)) {
                    self.advance();
                    self.advance();
                    let right = self.parse_arith()?;
                    return Ok(Expr {
                        kind: ExprKind::Compare {
                            op: CmpOp::NotIn,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        span,
                    });
                }
                return Ok(left);
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_arith()?;
        Ok(Expr {
            kind: ExprKind::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        })
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            let span = self.peek_span();
            self.advance();
            let right = self.parse_term()?;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::SlashSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            let span = self.peek_span();
            self.advance();
            let right = self.parse_unary()?;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let span = self.peek_span();
        if self.eat(&Tok::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        if self.eat(&Tok::KwAwait) {
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Await(Box::new(operand)),
                span,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            let span = self.peek_span();
            if self.eat(&Tok::LParen) {
                let mut args = Vec::new();
                while !self.check(&Tok::RParen) {
                    args.push(self.parse_expr()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(&Tok::RParen, "')'")?;
                expr = Expr {
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    span,
                };
            } else if self.eat(&Tok::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&Tok::RBracket, "']'")?;
                expr = Expr {
                    kind: ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                };
            } else if self.eat(&Tok::Dot) {
                let (name, _) = self.expect_name("attribute name")?;
                expr = Expr {
                    kind: ExprKind::Attribute {
                        value: Box::new(expr),
                        name,
                    },
                    span,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let span = self.peek_span();
        match self.peek().clone() {
            Tok::Int(n) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Int(n),
                    span,
                })
            }
            Tok::BigInt(text) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::BigInt(text),
                    span,
                })
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Float(f),
                    span,
                })
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Str(s),
                    span,
                })
            }
            Tok::KwTrue => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(true),
                    span,
                })
            }
            Tok::KwFalse => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(false),
                    span,
                })
            }
            Tok::KwNone => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::NoneLit,
                    span,
                })
            }
            Tok::Name(n) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Name(n),
                    span,
                })
            }
            Tok::LParen => {
                self.advance();
                if self.eat(&Tok::RParen) {
                    return Ok(Expr {
                        kind: ExprKind::Tuple(Vec::new()),
                        span,
                    });
                }
                let first = self.parse_expr()?;
                // Generator expression: (elem for target in iter)
                if self.check(&Tok::KwFor) {
                    let clauses = self.parse_comp_clauses()?;
                    self.expect(&Tok::RParen, "')'")?;
                    return Ok(Expr {
                        kind: ExprKind::GenExp {
                            elem: Box::new(first),
                            clauses,
                        },
                        span,
                    });
                }
                if self.check(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.eat(&Tok::Comma) {
                        if self.check(&Tok::RParen) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    return Ok(Expr {
                        kind: ExprKind::Tuple(items),
                        span,
                    });
                }
                self.expect(&Tok::RParen, "')'")?;
                Ok(first)
            }
            Tok::LBracket => {
                self.advance();
                if self.eat(&Tok::RBracket) {
                    return Ok(Expr {
                        kind: ExprKind::List(Vec::new()),
                        span,
                    });
                }
                let first = self.parse_expr()?;
                if self.check(&Tok::KwFor) {
                    let clauses = self.parse_comp_clauses()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    return Ok(Expr {
                        kind: ExprKind::ListComp {
                            elem: Box::new(first),
                            clauses,
                        },
                        span,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Tok::Comma) {
                    if self.check(&Tok::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(&Tok::RBracket, "']'")?;
                Ok(Expr {
                    kind: ExprKind::List(items),
                    span,
                })
            }
            Tok::LBrace => {
                self.advance();
                if self.eat(&Tok::RBrace) {
                    return Ok(Expr {
                        kind: ExprKind::Map(Vec::new()),
                        span,
                    });
                }
                let first = self.parse_expr()?;
                if self.eat(&Tok::Colon) {
                    // Mapping display or comprehension.
                    let value = self.parse_expr()?;
                    if self.check(&Tok::KwFor) {
                        let clauses = self.parse_comp_clauses()?;
                        self.expect(&Tok::RBrace, "'}'")?;
                        return Ok(Expr {
                            kind: ExprKind::MapComp {
                                key: Box::new(first),
                                value: Box::new(value),
                                clauses,
                            },
                            span,
                        });
                    }
                    let mut pairs = vec![(first, value)];
                    while self.eat(&Tok::Comma) {
                        if self.check(&Tok::RBrace) {
                            break;
                        }
                        let k = self.parse_expr()?;
                        self.expect(&Tok::Colon, "':'")?;
                        let v = self.parse_expr()?;
                        pairs.push((k, v));
                    }
                    self.expect(&Tok::RBrace, "'}'")?;
                    return Ok(Expr {
                        kind: ExprKind::Map(pairs),
                        span,
                    });
                }
                // Set display or comprehension.
                if self.check(&Tok::KwFor) {
                    let clauses = self.parse_comp_clauses()?;
                    self.expect(&Tok::RBrace, "'}'")?;
                    return Ok(Expr {
                        kind: ExprKind::SetComp {
                            elem: Box::new(first),
                            clauses,
                        },
                        span,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Tok::Comma) {
                    if self.check(&Tok::RBrace) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(&Tok::RBrace, "'}'")?;
                Ok(Expr {
                    kind: ExprKind::Set(items),
                    span,
                })
            }
            other => Err(self.err(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_comp_clauses(&mut self) -> PResult<Vec<CompClause>> {
        let mut clauses = Vec::new();
        while self.check(&Tok::KwFor) {
            let span = self.peek_span();
            self.advance();
            let (exprs, has_star) = self.parse_star_expr_list_until(&Tok::KwIn)?;
            let target = self.exprs_to_target(exprs, has_star, &span)?;
            self.expect(&Tok::KwIn, "'in'")?;
            let iter = self.parse_or()?;
            let mut conds = Vec::new();
            while self.check(&Tok::KwIf) {
                self.advance();
                conds.push(self.parse_or()?);
            }
            clauses.push(CompClause {
                target,
                iter,
                conds,
            });
        }
        Ok(clauses)
    }
}

/// Parse a source string into a module.
pub fn parse(source: &str, file: &str, module_name: &str) -> Result<Module, CompileError> {
    let tokens = crate::lexer::tokenize(source, file)?;
    Parser::new(tokens, file).parse_module(module_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Module {
        parse(src, "test.mt", "test").expect("parse failed")
    }

    #[test]
    fn test_hello() {
        let m = parse_ok("print(\"hello\")\n");
        assert_eq!(m.body.len(), 1);
        assert!(matches!(
            &m.body[0].kind,
            StmtKind::Expr(Expr {
                kind: ExprKind::Call { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_def_and_return() {
        let m = parse_ok("def f(p):\n    return p[\"x\"] + p[\"y\"]\n");
        match &m.body[0].kind {
            StmtKind::Def(f) => {
                assert_eq!(f.name, "f");
                assert_eq!(f.params, vec!["p"]);
                assert!(matches!(f.body[0].kind, StmtKind::Return(Some(_))));
            }
            other => panic!("expected def, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_unpack_with_star() {
        let m = parse_ok("a, *rest = xs\n");
        match &m.body[0].kind {
            StmtKind::Assign { target, .. } => match target {
                Target::Tuple(items, _) => {
                    assert_eq!(items.len(), 2);
                    assert!(matches!(items[1], Target::Starred(..)));
                }
                other => panic!("expected tuple target, got {:?}", other),
            },
            other => panic!("expected assign, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse("1 + 2 = x\n", "t.mt", "t").unwrap_err();
        assert!(err.message.contains("invalid assignment target"));
        assert_eq!(err.span.as_ref().unwrap().line, 1);
    }

    #[test]
    fn test_if_elif_else() {
        let m = parse_ok("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        match &m.body[0].kind {
            StmtKind::If { orelse, .. } => {
                assert!(matches!(orelse[0].kind, StmtKind::If { .. }));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_comprehension() {
        let m = parse_ok("ys = [x * 2 for x in xs if x > 0]\n");
        match &m.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::ListComp { clauses, .. } => {
                    assert_eq!(clauses.len(), 1);
                    assert_eq!(clauses[0].conds.len(), 1);
                }
                other => panic!("expected list comp, got {:?}", other),
            },
            other => panic!("expected assign, got {:?}", other),
        }
    }

    #[test]
    fn test_with_and_try() {
        let m = parse_ok(
            "with open_file() as f:\n    use(f)\ntry:\n    g()\nexcept KeyError as e:\n    h(e)\nfinally:\n    cleanup()\n",
        );
        assert!(matches!(m.body[0].kind, StmtKind::With { .. }));
        match &m.body[1].kind {
            StmtKind::Try {
                handlers, finally, ..
            } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].kind.as_deref(), Some("KeyError"));
                assert_eq!(finally.len(), 1);
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_match_patterns() {
        let m = parse_ok(
            "match x:\n    case 0:\n        a()\n    case (1, y):\n        b(y)\n    case _:\n        c()\n",
        );
        match &m.body[0].kind {
            StmtKind::Match { arms, .. } => {
                assert_eq!(arms.len(), 3);
                assert!(matches!(arms[0].pattern, Pattern::Literal(_)));
                assert!(matches!(arms[1].pattern, Pattern::Tuple(_)));
                assert!(matches!(arms[2].pattern, Pattern::Wildcard));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_class_def() {
        let m = parse_ok(
            "class Point:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\n    def norm(self):\n        return self.x * self.x + self.y * self.y\n",
        );
        match &m.body[0].kind {
            StmtKind::ClassDef(c) => {
                assert_eq!(c.name, "Point");
                assert_eq!(c.methods.len(), 2);
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_imports_collected() {
        let m = parse_ok("import util\nimport pkg.sub\n");
        assert_eq!(m.imports, vec!["util", "pkg.sub"]);
    }

    #[test]
    fn test_async_await() {
        let m = parse_ok("async def f(c):\n    v = await recv(c)\n    return v\n");
        match &m.body[0].kind {
            StmtKind::Def(f) => assert!(f.is_async),
            other => panic!("expected def, got {:?}", other),
        }
    }
}
