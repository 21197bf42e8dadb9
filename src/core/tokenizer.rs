// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Tokenizer for assembly source with spans.
//!
//! Produces one flat token stream per line. Number literals cover the
//! `#1234`, `$1234`, `0x`, `%1010`, `0b`, trailing-`h`/`b` and real forms;
//! string literals are decoded to the Spectrum character set at tokenize
//! time with the raw text preserved for re-emission.

use crate::core::text_utils::{is_ident_char, is_ident_start, is_space};
use crate::core::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col_start: usize,
    pub col_end: usize,
}

impl Span {
    pub fn new(line: u32, start: usize, end: usize) -> Self {
        Self {
            line,
            col_start: start + 1,
            col_end: end + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLiteral {
    pub raw: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberLiteral {
    pub text: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Plus,
    Minus,
    Multiply,
    Divide,
    Mod,
    Shl,
    Shr,
    BitNot,
    LogicNot,
    BitAnd,
    BitOr,
    BitXor,
    LogicAnd,
    LogicOr,
    LogicXor,
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(NumberLiteral),
    String(StringLiteral),
    MacroParam(String),
    Comma,
    Colon,
    DoubleColon,
    Dot,
    OpenParen,
    CloseParen,
    Assign,
    Question,
    Dollar,
    DollarDollar,
    Operator(OperatorKind),
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn to_source_text(&self) -> String {
        match &self.kind {
            TokenKind::Identifier(name) => name.clone(),
            TokenKind::Number(num) => num.text.clone(),
            TokenKind::String(lit) => lit.raw.clone(),
            TokenKind::MacroParam(name) => format!("{{{{{name}}}}}"),
            TokenKind::Comma => ",".to_string(),
            TokenKind::Colon => ":".to_string(),
            TokenKind::DoubleColon => "::".to_string(),
            TokenKind::Dot => ".".to_string(),
            TokenKind::OpenParen => "(".to_string(),
            TokenKind::CloseParen => ")".to_string(),
            TokenKind::Assign => "=".to_string(),
            TokenKind::Question => "?".to_string(),
            TokenKind::Dollar => "$".to_string(),
            TokenKind::DollarDollar => "$$".to_string(),
            TokenKind::Operator(op) => match op {
                OperatorKind::Plus => "+",
                OperatorKind::Minus => "-",
                OperatorKind::Multiply => "*",
                OperatorKind::Divide => "/",
                OperatorKind::Mod => "%",
                OperatorKind::Shl => "<<",
                OperatorKind::Shr => ">>",
                OperatorKind::BitNot => "~",
                OperatorKind::LogicNot => "!",
                OperatorKind::BitAnd => "&",
                OperatorKind::BitOr => "|",
                OperatorKind::BitXor => "^",
                OperatorKind::LogicAnd => "&&",
                OperatorKind::LogicOr => "||",
                OperatorKind::LogicXor => "^^",
                OperatorKind::Eq => "==",
                OperatorKind::Ne => "!=",
                OperatorKind::Ge => ">=",
                OperatorKind::Gt => ">",
                OperatorKind::Le => "<=",
                OperatorKind::Lt => "<",
            }
            .to_string(),
            TokenKind::End => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenError {
    pub message: String,
    pub column: usize,
}

impl TokenError {
    fn new(message: impl Into<String>, column: usize) -> Self {
        Self {
            message: message.into(),
            column: column + 1,
        }
    }
}

pub struct Tokenizer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    prev_is_value: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str, line: u32) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
            line,
            prev_is_value: false,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, TokenError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::End;
            self.prev_is_value = matches!(
                token.kind,
                TokenKind::Identifier(_)
                    | TokenKind::Number(_)
                    | TokenKind::String(_)
                    | TokenKind::CloseParen
                    | TokenKind::Dollar
                    | TokenKind::DollarDollar
            );
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.bytes.get(self.pos + off).copied()
    }

    fn next_token(&mut self) -> Result<Token, TokenError> {
        while self.peek().is_some_and(is_space) {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(self.simple(TokenKind::End, start));
        };

        // Comment runs to end of line.
        if c == b';' {
            self.pos = self.bytes.len();
            return Ok(self.simple(TokenKind::End, start));
        }

        if c == b'{' && self.peek_at(1) == Some(b'{') {
            return self.take_macro_param(start);
        }

        if is_ident_start(c) {
            return Ok(self.take_identifier(start));
        }
        if c.is_ascii_digit() {
            return self.take_number(start);
        }
        if c == b'"' {
            return self.take_string(start);
        }
        if c == b'\'' {
            return self.take_char(start);
        }
        if c == b'#' {
            self.pos += 1;
            return self.take_radix_digits(start, 16, "Invalid hex literal");
        }
        if c == b'$' {
            return self.take_dollar(start);
        }
        if c == b'%' && !self.prev_is_value && self.peek_at(1).is_some_and(|d| d == b'0' || d == b'1')
        {
            self.pos += 1;
            return self.take_radix_digits(start, 2, "Invalid binary literal");
        }

        self.pos += 1;
        let kind = match c {
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Dot,
            b'(' => TokenKind::OpenParen,
            b')' => TokenKind::CloseParen,
            b'?' => TokenKind::Question,
            b'+' => TokenKind::Operator(OperatorKind::Plus),
            b'-' => TokenKind::Operator(OperatorKind::Minus),
            b'*' => TokenKind::Operator(OperatorKind::Multiply),
            b'/' => TokenKind::Operator(OperatorKind::Divide),
            b'%' => TokenKind::Operator(OperatorKind::Mod),
            b'~' => TokenKind::Operator(OperatorKind::BitNot),
            b':' => {
                if self.peek() == Some(b':') {
                    self.pos += 1;
                    TokenKind::DoubleColon
                } else {
                    TokenKind::Colon
                }
            }
            b'=' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::Eq)
                } else {
                    TokenKind::Assign
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::Ne)
                } else {
                    TokenKind::Operator(OperatorKind::LogicNot)
                }
            }
            b'<' => match self.peek() {
                Some(b'<') => {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::Shl)
                }
                Some(b'=') => {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::Le)
                }
                _ => TokenKind::Operator(OperatorKind::Lt),
            },
            b'>' => match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::Shr)
                }
                Some(b'=') => {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::Ge)
                }
                _ => TokenKind::Operator(OperatorKind::Gt),
            },
            b'&' => {
                if self.peek() == Some(b'&') {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::LogicAnd)
                } else {
                    TokenKind::Operator(OperatorKind::BitAnd)
                }
            }
            b'|' => {
                if self.peek() == Some(b'|') {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::LogicOr)
                } else {
                    TokenKind::Operator(OperatorKind::BitOr)
                }
            }
            b'^' => {
                if self.peek() == Some(b'^') {
                    self.pos += 1;
                    TokenKind::Operator(OperatorKind::LogicXor)
                } else {
                    TokenKind::Operator(OperatorKind::BitXor)
                }
            }
            b'@' => {
                // Local-name marker. Only meaningful before an identifier.
                if self.peek().is_some_and(is_ident_start) {
                    let token = self.take_identifier(self.pos);
                    let name = match token.kind {
                        TokenKind::Identifier(name) => name,
                        _ => unreachable!(),
                    };
                    return Ok(Token {
                        kind: TokenKind::Identifier(format!("@{name}")),
                        span: Span::new(self.line, start, self.pos),
                    });
                }
                return Err(TokenError::new("Stray '@'", start));
            }
            _ => {
                return Err(TokenError::new(
                    format!("Unexpected character '{}'", c as char),
                    start,
                ))
            }
        };
        Ok(Token {
            kind,
            span: Span::new(self.line, start, self.pos),
        })
    }

    fn simple(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            span: Span::new(self.line, start, self.pos),
        }
    }

    fn take_identifier(&mut self, start: usize) -> Token {
        self.pos += 1;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        let mut name = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        // AF' is a single register name.
        if name.eq_ignore_ascii_case("AF") && self.peek() == Some(b'\'') {
            self.pos += 1;
            name.push('\'');
        }
        Token {
            kind: TokenKind::Identifier(name),
            span: Span::new(self.line, start, self.pos),
        }
    }

    fn take_macro_param(&mut self, start: usize) -> Result<Token, TokenError> {
        self.pos += 2;
        while self.peek().is_some_and(is_space) {
            self.pos += 1;
        }
        let name_start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if name_start == self.pos {
            return Err(TokenError::new("Empty macro parameter reference", start));
        }
        let name = String::from_utf8_lossy(&self.bytes[name_start..self.pos]).to_string();
        while self.peek().is_some_and(is_space) {
            self.pos += 1;
        }
        if self.peek() != Some(b'}') || self.peek_at(1) != Some(b'}') {
            return Err(TokenError::new("Unterminated macro parameter, expected '}}'", start));
        }
        self.pos += 2;
        Ok(Token {
            kind: TokenKind::MacroParam(name),
            span: Span::new(self.line, start, self.pos),
        })
    }

    fn take_dollar(&mut self, start: usize) -> Result<Token, TokenError> {
        self.pos += 1;
        if self.peek() == Some(b'$') {
            self.pos += 1;
            return Ok(self.simple(TokenKind::DollarDollar, start));
        }
        let run_start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if run_start == self.pos {
            return Ok(self.simple(TokenKind::Dollar, start));
        }
        let run = &self.bytes[run_start..self.pos];
        if run.iter().all(u8::is_ascii_hexdigit) {
            let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
            let digits = String::from_utf8_lossy(run).to_string();
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| TokenError::new("Invalid hex literal", start))?;
            return Ok(Token {
                kind: TokenKind::Number(NumberLiteral {
                    text,
                    value: Value::Int(value),
                }),
                span: Span::new(self.line, start, self.pos),
            });
        }
        // `$cnt` and friends read as identifiers with the marker kept.
        let name = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        Ok(Token {
            kind: TokenKind::Identifier(name),
            span: Span::new(self.line, start, self.pos),
        })
    }

    fn take_radix_digits(
        &mut self,
        start: usize,
        radix: u32,
        error: &str,
    ) -> Result<Token, TokenError> {
        let digit_start = self.pos;
        while self
            .peek()
            .is_some_and(|c| (c as char).is_digit(radix) || c == b'_')
        {
            self.pos += 1;
        }
        if digit_start == self.pos {
            return Err(TokenError::new(error, start));
        }
        let digits: String = self.bytes[digit_start..self.pos]
            .iter()
            .map(|&c| c as char)
            .filter(|&c| c != '_')
            .collect();
        let value = i64::from_str_radix(&digits, radix)
            .map_err(|_| TokenError::new(error, start))?;
        let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        Ok(Token {
            kind: TokenKind::Number(NumberLiteral {
                text,
                value: Value::Int(value),
            }),
            span: Span::new(self.line, start, self.pos),
        })
    }

    fn take_number(&mut self, start: usize) -> Result<Token, TokenError> {
        // 0x / 0b prefixes first.
        if self.peek() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x') | Some(b'X') => {
                    self.pos += 2;
                    return self.take_radix_digits(start, 16, "Invalid hex literal");
                }
                Some(b'b') | Some(b'B')
                    if self
                        .peek_at(2)
                        .is_some_and(|c| c == b'0' || c == b'1' || c == b'_') =>
                {
                    self.pos += 2;
                    return self.take_radix_digits(start, 2, "Invalid binary literal");
                }
                _ => {}
            }
        }

        // Gather the alphanumeric run; decide the base from its shape.
        let run_start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let run: String = self.bytes[run_start..self.pos]
            .iter()
            .map(|&c| c as char)
            .filter(|&c| c != '_')
            .collect();

        // Real literal: digits '.' digits with optional exponent.
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.peek().is_some_and(|c| c == b'e' || c == b'E') {
                let mut ahead = 1;
                if self
                    .peek_at(ahead)
                    .is_some_and(|c| c == b'+' || c == b'-')
                {
                    ahead += 1;
                }
                if self.peek_at(ahead).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += ahead;
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                }
            }
            let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
            let value: f64 = text
                .parse()
                .map_err(|_| TokenError::new("Invalid real literal", start))?;
            return Ok(Token {
                kind: TokenKind::Number(NumberLiteral {
                    text,
                    value: Value::Real(value),
                }),
                span: Span::new(self.line, start, self.pos),
            });
        }

        let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        let lower = run.to_ascii_lowercase();
        let value = if let Some(hex) = lower.strip_suffix('h') {
            i64::from_str_radix(hex, 16).ok()
        } else if let Some(bin) = lower.strip_suffix('b') {
            if bin.bytes().all(|c| c == b'0' || c == b'1') {
                i64::from_str_radix(bin, 2).ok()
            } else {
                None
            }
        } else {
            run.parse::<i64>().ok()
        };
        let value = value.ok_or_else(|| TokenError::new("Invalid number literal", start))?;
        Ok(Token {
            kind: TokenKind::Number(NumberLiteral {
                text,
                value: Value::Int(value),
            }),
            span: Span::new(self.line, start, self.pos),
        })
    }

    fn take_string(&mut self, start: usize) -> Result<Token, TokenError> {
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(TokenError::new("Unterminated string literal", start));
            };
            self.pos += 1;
            match c {
                b'"' => break,
                b'\\' => bytes.push(self.take_escape(start)?),
                _ => bytes.push(c),
            }
        }
        let raw = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        Ok(Token {
            kind: TokenKind::String(StringLiteral { raw, bytes }),
            span: Span::new(self.line, start, self.pos),
        })
    }

    fn take_char(&mut self, start: usize) -> Result<Token, TokenError> {
        self.pos += 1;
        let Some(c) = self.peek() else {
            return Err(TokenError::new("Unterminated character literal", start));
        };
        self.pos += 1;
        let value = if c == b'\\' {
            self.take_escape(start)?
        } else {
            c
        };
        if self.peek() != Some(b'\'') {
            return Err(TokenError::new("Unterminated character literal", start));
        }
        self.pos += 1;
        let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        Ok(Token {
            kind: TokenKind::Number(NumberLiteral {
                text,
                value: Value::Int(i64::from(value)),
            }),
            span: Span::new(self.line, start, self.pos),
        })
    }

    /// Spectrum character escapes, positioned after the backslash.
    fn take_escape(&mut self, start: usize) -> Result<u8, TokenError> {
        let Some(c) = self.peek() else {
            return Err(TokenError::new("Unterminated escape sequence", start));
        };
        self.pos += 1;
        let byte = match c {
            b'i' => 0x10,
            b'p' => 0x11,
            b'f' => 0x12,
            b'b' => 0x13,
            b'I' => 0x14,
            b'o' => 0x15,
            b'a' => 0x16,
            b't' => 0x17,
            b'P' => 0x60, // pound
            b'C' => 0x7F, // copyright
            b'0' => 0x00,
            b'"' => b'"',
            b'\'' => b'\'',
            b'\\' => b'\\',
            b'x' => {
                let hi = self.peek();
                let lo = self.peek_at(1);
                match (hi, lo) {
                    (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                        self.pos += 2;
                        let pair = [hi, lo];
                        let text = std::str::from_utf8(&pair).unwrap_or("00");
                        u8::from_str_radix(text, 16).unwrap_or(0)
                    }
                    _ => return Err(TokenError::new("Invalid \\x escape, expected two hex digits", start)),
                }
            }
            _ => {
                return Err(TokenError::new(
                    format!("Unknown escape '\\{}'", c as char),
                    start,
                ))
            }
        };
        Ok(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::{OperatorKind, TokenKind, Tokenizer};
    use crate::core::value::Value;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Tokenizer::new(input, 1)
            .tokenize()
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn int_at(input: &str, index: usize) -> i64 {
        match &kinds(input)[index] {
            TokenKind::Number(num) => num.value.as_int().unwrap(),
            other => panic!("expected number, got {other:?}"),
        }
    }

    #[test]
    fn hex_literal_forms() {
        assert_eq!(int_at("$9000", 0), 0x9000);
        assert_eq!(int_at("#1234", 0), 0x1234);
        assert_eq!(int_at("0x2A", 0), 42);
        assert_eq!(int_at("2Ah", 0), 42);
    }

    #[test]
    fn binary_and_decimal_forms() {
        assert_eq!(int_at("%1010", 0), 10);
        assert_eq!(int_at("0b1010_1010", 0), 0xAA);
        assert_eq!(int_at("1010b", 0), 10);
        assert_eq!(int_at("42", 0), 42);
    }

    #[test]
    fn percent_is_modulo_after_value() {
        let toks = kinds("5 % 2");
        assert!(matches!(toks[1], TokenKind::Operator(OperatorKind::Mod)));
    }

    #[test]
    fn real_literals() {
        match &kinds("3.14")[0] {
            TokenKind::Number(num) => assert_eq!(num.value, Value::Real(3.14)),
            other => panic!("expected real, got {other:?}"),
        }
    }

    #[test]
    fn dollar_forms() {
        assert!(matches!(kinds("$")[0], TokenKind::Dollar));
        assert!(matches!(kinds("$$")[0], TokenKind::DollarDollar));
        match &kinds("$cnt")[0] {
            TokenKind::Identifier(name) => assert_eq!(name, "$cnt"),
            other => panic!("expected identifier, got {other:?}"),
        }
    }

    #[test]
    fn af_prime_is_one_identifier() {
        match &kinds("af'")[0] {
            TokenKind::Identifier(name) => assert_eq!(name, "af'"),
            other => panic!("expected identifier, got {other:?}"),
        }
    }

    #[test]
    fn backtick_and_at_identifiers() {
        match &kinds("`tmp")[0] {
            TokenKind::Identifier(name) => assert_eq!(name, "`tmp"),
            other => panic!("expected identifier, got {other:?}"),
        }
        match &kinds("@inner")[0] {
            TokenKind::Identifier(name) => assert_eq!(name, "@inner"),
            other => panic!("expected identifier, got {other:?}"),
        }
    }

    #[test]
    fn spectrum_string_escapes() {
        match &kinds(r#""a\i\P\xFF\0""#)[0] {
            TokenKind::String(lit) => {
                assert_eq!(lit.bytes, vec![b'a', 0x10, 0x60, 0xFF, 0x00]);
            }
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn char_literal_value() {
        assert_eq!(int_at("'A'", 0), 65);
        assert_eq!(int_at(r"'\i'", 0), 0x10);
    }

    #[test]
    fn macro_param_token() {
        match &kinds("{{count}}")[0] {
            TokenKind::MacroParam(name) => assert_eq!(name, "count"),
            other => panic!("expected macro param, got {other:?}"),
        }
    }

    #[test]
    fn comment_terminates_line() {
        let toks = kinds("nop ; comment");
        assert_eq!(toks.len(), 2);
        assert!(matches!(toks[1], TokenKind::End));
    }

    #[test]
    fn double_colon_token() {
        assert!(matches!(kinds("::root")[0], TokenKind::DoubleColon));
    }
}
