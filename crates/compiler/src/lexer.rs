//! Lexer
//!
//! Tokenizes the indentation-delimited surface syntax. Indentation is
//! resolved here: the lexer synthesizes `Indent` / `Dedent` tokens from
//! leading whitespace, so the parser only sees a bracketed structure.
//! Blank lines and comment-only lines produce no tokens. Inside
//! parentheses and brackets, newlines and indentation are insignificant.

use crate::diag::{CompileError, Stage};
use crate::source::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    // Structure
    Newline,
    Indent,
    Dedent,
    EndOfFile,
    // Literals and names
    Int(i64),
    BigInt(String),
    Float(f64),
    Str(String),
    Name(String),
    // Keywords
    KwDef,
    KwClass,
    KwIf,
    KwElif,
    KwElse,
    KwWhile,
    KwFor,
    KwIn,
    KwReturn,
    KwPass,
    KwBreak,
    KwContinue,
    KwImport,
    KwWith,
    KwAs,
    KwTry,
    KwExcept,
    KwFinally,
    KwRaise,
    KwFrom,
    KwMatch,
    KwCase,
    KwAnd,
    KwOr,
    KwNot,
    KwTrue,
    KwFalse,
    KwNone,
    KwAsync,
    KwAwait,
    KwYield,
    KwAssert,
    // Punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Arrow,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

fn keyword(name: &str) -> Option<Tok> {
    Some(match name {
        "def" => Tok::KwDef,
        "class" => Tok::KwClass,
        "if" => Tok::KwIf,
        "elif" => Tok::KwElif,
        "else" => Tok::KwElse,
        "while" => Tok::KwWhile,
        "for" => Tok::KwFor,
        "in" => Tok::KwIn,
        "return" => Tok::KwReturn,
        "pass" => Tok::KwPass,
        "break" => Tok::KwBreak,
        "continue" => Tok::KwContinue,
        "import" => Tok::KwImport,
        "with" => Tok::KwWith,
        "as" => Tok::KwAs,
        "try" => Tok::KwTry,
        "except" => Tok::KwExcept,
        "finally" => Tok::KwFinally,
        "raise" => Tok::KwRaise,
        "from" => Tok::KwFrom,
        "match" => Tok::KwMatch,
        "case" => Tok::KwCase,
        "and" => Tok::KwAnd,
        "or" => Tok::KwOr,
        "not" => Tok::KwNot,
        "True" => Tok::KwTrue,
        "False" => Tok::KwFalse,
        "None" => Tok::KwNone,
        "async" => Tok::KwAsync,
        "await" => Tok::KwAwait,
        "yield" => Tok::KwYield,
        "assert" => Tok::KwAssert,
        _ => return None,
    })
}

pub struct Lexer<'src> {
    src: &'src [u8],
    file: String,
    pos: usize,
    line: u32,
    col: u32,
    indents: Vec<usize>,
    /// Nesting depth of (), [], {}; newlines vanish inside.
    paren_depth: usize,
    tokens: Vec<Token>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str, file: &str) -> Self {
        Lexer {
            src: source.as_bytes(),
            file: file.to_string(),
            pos: 0,
            line: 1,
            col: 1,
            indents: vec![0],
            paren_depth: 0,
            tokens: Vec::new(),
        }
    }

    fn span(&self) -> Span {
        Span::new(self.file.clone(), self.line, self.col)
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(Stage::Lex, self.span(), message)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn push(&mut self, tok: Tok, span: Span) {
        self.tokens.push(Token { tok, span });
    }

    /// Tokenize the whole source.
    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        self.handle_line_start()?;
        while self.pos < self.src.len() {
            let span = self.span();
            let c = self.peek().expect("bounds checked");
            match c {
                b' ' | b'\t' => {
                    self.bump();
                }
                b'#' => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                b'\n' => {
                    self.bump();
                    if self.paren_depth == 0 {
                        // Collapse runs of blank lines into one Newline.
                        if !matches!(
                            self.tokens.last().map(|t| &t.tok),
                            Some(Tok::Newline) | Some(Tok::Indent) | None
                        ) {
                            self.push(Tok::Newline, span);
                        }
                        self.handle_line_start()?;
                    }
                }
                b'0'..=b'9' => self.lex_number(span)?,
                b'"' | b'\'' => self.lex_string(span, c)?,
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_name(span),
                _ => self.lex_operator(span)?,
            }
        }
        // Close the file: final newline plus pending dedents.
        if !matches!(self.tokens.last().map(|t| &t.tok), Some(Tok::Newline) | None) {
            let span = self.span();
            self.push(Tok::Newline, span);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            let span = self.span();
            self.push(Tok::Dedent, span);
        }
        let span = self.span();
        self.push(Tok::EndOfFile, span);
        Ok(self.tokens)
    }

    /// Measure leading whitespace at a line start and emit
    /// Indent/Dedent tokens. Skips blank and comment-only lines.
    fn handle_line_start(&mut self) -> Result<(), CompileError> {
        loop {
            let mut width = 0usize;
            loop {
                match self.peek() {
                    Some(b' ') => {
                        width += 1;
                        self.bump();
                    }
                    Some(b'\t') => {
                        return Err(self.err("tab indentation is not supported"));
                    }
                    _ => break,
                }
            }
            match self.peek() {
                // Blank or comment-only line: consume and re-measure.
                Some(b'\n') => {
                    self.bump();
                    continue;
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                None => return Ok(()),
                _ => {}
            }
            let current = *self.indents.last().expect("indent stack nonempty");
            if width > current {
                self.indents.push(width);
                let span = self.span();
                self.push(Tok::Indent, span);
            } else if width < current {
                while width < *self.indents.last().expect("indent stack nonempty") {
                    self.indents.pop();
                    let span = self.span();
                    self.push(Tok::Dedent, span);
                }
                if width != *self.indents.last().expect("indent stack nonempty") {
                    return Err(self.err("unindent does not match any outer level"));
                }
            }
            return Ok(());
        }
    }

    fn lex_number(&mut self, span: Span) -> Result<(), CompileError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' | b'_' => {
                    self.bump();
                }
                b'.' if !is_float && matches!(self.peek2(), Some(b'0'..=b'9')) => {
                    is_float = true;
                    self.bump();
                }
                b'e' | b'E' if !is_float => break,
                _ => break,
            }
        }
        let text: String = std::str::from_utf8(&self.src[start..self.pos])
            .expect("digits are ASCII")
            .replace('_', "");
        if is_float {
            let f = text
                .parse::<f64>()
                .map_err(|_| self.err(format!("invalid float literal '{}'", text)))?;
            self.push(Tok::Float(f), span);
        } else {
            match text.parse::<i64>() {
                Ok(n) => self.push(Tok::Int(n), span),
                // Too large for i64: carry as a decimal string, the
                // constant folds into a BigInt at lowering.
                Err(_) => self.push(Tok::BigInt(text), span),
            }
        }
        Ok(())
    }

    fn lex_string(&mut self, span: Span, quote: u8) -> Result<(), CompileError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    return Err(self.err("unterminated string literal"));
                }
                Some(c) if c == quote => break,
                Some(b'\\') => {
                    let esc = self
                        .bump()
                        .ok_or_else(|| self.err("unterminated string escape"))?;
                    match esc {
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        b'r' => out.push('\r'),
                        b'0' => out.push('\0'),
                        b'\\' => out.push('\\'),
                        b'\'' => out.push('\''),
                        b'"' => out.push('"'),
                        other => {
                            return Err(self.err(format!(
                                "unsupported string escape '\\{}'",
                                other as char
                            )))
                        }
                    }
                }
                Some(c) if c < 0x80 => out.push(c as char),
                Some(first) => {
                    // Re-assemble a UTF-8 sequence.
                    let extra = match first {
                        0xC0..=0xDF => 1,
                        0xE0..=0xEF => 2,
                        0xF0..=0xF7 => 3,
                        _ => return Err(self.err("invalid UTF-8 in string literal")),
                    };
                    let mut buf = vec![first];
                    for _ in 0..extra {
                        buf.push(
                            self.bump()
                                .ok_or_else(|| self.err("invalid UTF-8 in string literal"))?,
                        );
                    }
                    out.push_str(
                        std::str::from_utf8(&buf)
                            .map_err(|_| self.err("invalid UTF-8 in string literal"))?,
                    );
                }
            }
        }
        self.push(Tok::Str(out), span);
        Ok(())
    }

    fn lex_name(&mut self, span: Span) {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let name = std::str::from_utf8(&self.src[start..self.pos])
            .expect("identifier bytes are ASCII")
            .to_string();
        match keyword(&name) {
            Some(tok) => self.push(tok, span),
            None => self.push(Tok::Name(name), span),
        }
    }

    fn lex_operator(&mut self, span: Span) -> Result<(), CompileError> {
        let c = self.bump().expect("caller peeked");
        let two = |lexer: &mut Lexer, next: u8| -> bool {
            if lexer.peek() == Some(next) {
                lexer.bump();
                true
            } else {
                false
            }
        };
        let tok = match c {
            b'(' => {
                self.paren_depth += 1;
                Tok::LParen
            }
            b')' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Tok::RParen
            }
            b'[' => {
                self.paren_depth += 1;
                Tok::LBracket
            }
            b']' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Tok::RBracket
            }
            b'{' => {
                self.paren_depth += 1;
                Tok::LBrace
            }
            b'}' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Tok::RBrace
            }
            b',' => Tok::Comma,
            b':' => Tok::Colon,
            b'.' => Tok::Dot,
            b'+' => {
                if two(self, b'=') {
                    Tok::PlusAssign
                } else {
                    Tok::Plus
                }
            }
            b'-' => {
                if two(self, b'>') {
                    Tok::Arrow
                } else if two(self, b'=') {
                    Tok::MinusAssign
                } else {
                    Tok::Minus
                }
            }
            b'*' => {
                if two(self, b'=') {
                    Tok::StarAssign
                } else {
                    Tok::Star
                }
            }
            b'/' => {
                if two(self, b'/') {
                    Tok::SlashSlash
                } else {
                    Tok::Slash
                }
            }
            b'%' => Tok::Percent,
            b'=' => {
                if two(self, b'=') {
                    Tok::Eq
                } else {
                    Tok::Assign
                }
            }
            b'!' => {
                if two(self, b'=') {
                    Tok::Ne
                } else {
                    return Err(self.err("unexpected '!'"));
                }
            }
            b'<' => {
                if two(self, b'=') {
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            b'>' => {
                if two(self, b'=') {
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            other => {
                return Err(self.err(format!("unexpected character '{}'", other as char)));
            }
        };
        self.push(tok, span);
        Ok(())
    }
}

/// Convenience entry point.
pub fn tokenize(source: &str, file: &str) -> Result<Vec<Token>, CompileError> {
    Lexer::new(source, file).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src, "test.mt")
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn test_indent_dedent_synthesis() {
        let tokens = toks("if x:\n    y = 1\nz = 2\n");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        let indent_pos = tokens.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent_pos = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let a = toks("x = 1\n\n# comment\n   # indented comment\ny = 2\n");
        let b = toks("x = 1\ny = 2\n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_newlines_insignificant_in_brackets() {
        let tokens = toks("x = [1,\n     2]\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!tokens.contains(&Tok::Indent));
    }

    #[test]
    fn test_numbers() {
        assert!(matches!(toks("42\n")[0], Tok::Int(42)));
        assert!(matches!(toks("3.5\n")[0], Tok::Float(_)));
        assert!(matches!(
            toks("123456789012345678901234567890\n")[0],
            Tok::BigInt(_)
        ));
    }

    #[test]
    fn test_string_escapes() {
        match &toks("\"a\\nb\"\n")[0] {
            Tok::Str(s) => assert_eq!(s, "a\nb"),
            other => panic!("expected string, got {:?}", other),
        }
        match &toks("'héllo'\n")[0] {
            Tok::Str(s) => assert_eq!(s, "héllo"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_operators() {
        let tokens = toks("a // b <= c != d -> e\n");
        assert!(tokens.contains(&Tok::SlashSlash));
        assert!(tokens.contains(&Tok::Le));
        assert!(tokens.contains(&Tok::Ne));
        assert!(tokens.contains(&Tok::Arrow));
    }

    #[test]
    fn test_bad_unindent_rejected() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n", "t.mt").unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn test_keywords_vs_names() {
        let tokens = toks("for format in formats\n");
        assert_eq!(tokens[0], Tok::KwFor);
        assert!(matches!(&tokens[1], Tok::Name(n) if n == "format"));
        assert_eq!(tokens[2], Tok::KwIn);
    }
}
