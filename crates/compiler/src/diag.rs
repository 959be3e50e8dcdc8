//! Compile-time diagnostics
//!
//! Every pipeline stage reports failure through [`CompileError`]: an
//! error kind, a message, and a precise source location where one
//! exists. Lowering-time rejections (malformed patterns, unsupported
//! dynamic forms) carry the exact offending span; later stages point at
//! the construct that seeded the analysis.

use crate::source::Span;

/// Which stage rejected the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lex,
    Parse,
    Lower,
    Infer,
    Lir,
    Backend,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Lex => "lex",
            Stage::Parse => "parse",
            Stage::Lower => "lower",
            Stage::Infer => "typecheck",
            Stage::Lir => "lir",
            Stage::Backend => "backend",
        }
    }
}

/// A compile error with an optional location.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub stage: Stage,
    pub message: String,
    pub span: Option<Span>,
}

impl CompileError {
    pub fn new(stage: Stage, message: impl Into<String>, span: Option<Span>) -> Self {
        CompileError {
            stage,
            message: message.into(),
            span,
        }
    }

    pub fn at(stage: Stage, span: Span, message: impl Into<String>) -> Self {
        Self::new(stage, message, Some(span))
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "{}:{}:{}: {} error: {}",
                span.file, span.line, span.col, self.stage.name(), self.message
            ),
            None => write!(f, "{} error: {}", self.stage.name(), self.message),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<CompileError> for String {
    fn from(e: CompileError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_span() {
        let span = Span::new("app.mt", 3, 7);
        let e = CompileError::at(Stage::Lower, span, "invalid assignment target");
        assert_eq!(
            e.to_string(),
            "app.mt:3:7: lower error: invalid assignment target"
        );
    }
}
