// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Line parser producing [`SourceLine`] records for the statement driver.
//!
//! Each source line parses independently into an optional label plus a
//! payload: a pragma, a Z80 operation with classified operands, a
//! control-flow statement, a `name = expr` assignment, a macro/struct
//! invocation, or nothing. Expressions parse into an AST evaluated later;
//! the parser never resolves symbols.

use crate::core::text_utils::to_upper;
use crate::core::tokenizer::{
    NumberLiteral, OperatorKind, Span, StringLiteral, Token, TokenKind, Tokenizer,
};
use crate::core::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    BitNot,
    LogicNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    LogicAnd,
    LogicOr,
    LogicXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A symbol reference in one of the four name forms.
#[derive(Debug, Clone, PartialEq)]
pub struct NamePath {
    /// `::` prefix: resolution starts at the root module.
    pub rooted: bool,
    /// `@` prefix: only the current module's scopes and symbols.
    pub local: bool,
    pub segments: Vec<String>,
    pub span: Span,
}

impl NamePath {
    pub fn simple(name: &str, span: Span) -> Self {
        Self {
            rooted: false,
            local: false,
            segments: vec![name.to_string()],
            span,
        }
    }

    pub fn is_simple(&self) -> bool {
        !self.rooted && !self.local && self.segments.len() == 1
    }

    pub fn display(&self) -> String {
        let mut out = String::new();
        if self.rooted {
            out.push_str("::");
        }
        out.push_str(&self.segments.join("."));
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value, Span),
    Str(StringLiteral, Span),
    Symbol(NamePath),
    /// `$` - logical current address.
    CurAddress(Span),
    /// `$$` - address of the current instruction start.
    CurInstruction(Span),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        span: Span,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    /// `{{name}}` surviving outside a macro body; evaluating it is an error.
    MacroParam(String, Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal(_, span)
            | Expr::Str(_, span)
            | Expr::CurAddress(span)
            | Expr::CurInstruction(span)
            | Expr::MacroParam(_, span) => *span,
            Expr::Symbol(path) => path.span,
            Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Ternary { span, .. }
            | Expr::Call { span, .. } => *span,
        }
    }
}

/// Operand classification as the encoder consumes it. Register and
/// condition names stay as strings; the encoder maps them to indexes.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(String, Span),
    Condition(String, Span),
    RegIndirect(String, Span),
    CPort(Span),
    Indexed {
        base: String,
        offset: Option<Expr>,
        negative: bool,
        span: Span,
    },
    MemIndirect(Expr, Span),
    Expr(Expr),
}

impl Operand {
    pub fn span(&self) -> Span {
        match self {
            Operand::Reg(_, span)
            | Operand::Condition(_, span)
            | Operand::RegIndirect(_, span)
            | Operand::CPort(span)
            | Operand::Indexed { span, .. }
            | Operand::MemIndirect(_, span) => *span,
            Operand::Expr(expr) => expr.span(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub mnemonic: String,
    pub span: Span,
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pragma {
    Org(Expr),
    Xorg(Expr),
    Disp(Expr),
    Ent(Expr),
    Xent(Expr),
    Equ(Expr),
    Var(Expr),
    DefB(Vec<Expr>),
    DefW(Vec<Expr>),
    DefM {
        exprs: Vec<Expr>,
        bit7: bool,
        null: bool,
    },
    DefH(Expr),
    DefS(Vec<Expr>),
    FillB(Vec<Expr>),
    FillW(Vec<Expr>),
    Align(Option<Expr>),
    DefG(String, Span),
    DefGx(Expr),
    Skip(Vec<Expr>),
    Trace {
        hex: bool,
        exprs: Vec<Expr>,
    },
    Model(String, Span),
    RndSeed(Option<Expr>),
    Error(Expr),
    IncludeBin(Vec<Expr>),
    CompareBin(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IfKind {
    If(Expr),
    IfUsed(NamePath),
    IfNotUsed(NamePath),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    If(IfKind),
    Elif(Expr),
    Else,
    Endif,
    Loop(Expr),
    EndLoop,
    Repeat,
    Until(Expr),
    While(Expr),
    Wend,
    For {
        var: String,
        var_span: Span,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
    },
    Next,
    Break,
    Continue,
    Proc,
    Endp,
    Local(Vec<(String, Span)>),
    Module(Option<String>),
    EndModule,
    Macro(Vec<(String, Span)>),
    EndMacro,
    Struct,
    EndStruct,
}

/// A macro/struct invocation argument, kept as source text so that
/// substitution inlines the argument literally.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeArg {
    pub text: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinePayload {
    None,
    Pragma(Pragma),
    Operation(Operation),
    Statement(Statement),
    VarAssign {
        name: String,
        span: Span,
        expr: Expr,
    },
    Invocation {
        name: NamePath,
        args: Vec<InvokeArg>,
    },
}

#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ParseIssue {
    pub message: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct SourceLine {
    pub file_index: usize,
    pub line: u32,
    pub label: Option<Label>,
    pub payload: LinePayload,
    /// The line contains `{{name}}` references.
    pub has_macro_params: bool,
    pub issue: Option<ParseIssue>,
}

impl SourceLine {
    fn empty(file_index: usize, line: u32) -> Self {
        Self {
            file_index,
            line,
            label: None,
            payload: LinePayload::None,
            has_macro_params: false,
            issue: None,
        }
    }
}

/// An input file handed to the assembler.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub lines: Vec<String>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: &str) -> Self {
        Self {
            name: name.into(),
            lines: text.lines().map(str::to_string).collect(),
        }
    }
}

pub fn is_register_name(name: &str) -> bool {
    matches!(
        to_upper(name).as_str(),
        "A" | "B" | "C" | "D" | "E" | "H" | "L" | "F" | "I" | "R" | "BC" | "DE" | "HL" | "SP"
            | "AF" | "AF'" | "IX" | "IY" | "XH" | "XL" | "YH" | "YL" | "IXH" | "IXL" | "IYH"
            | "IYL"
    )
}

pub fn is_condition_name(name: &str) -> bool {
    matches!(
        to_upper(name).as_str(),
        "NZ" | "Z" | "NC" | "C" | "PO" | "PE" | "P" | "M"
    )
}

/// Mnemonics whose first operand may be a branch condition.
fn takes_condition(mnemonic: &str) -> bool {
    matches!(to_upper(mnemonic).as_str(), "JP" | "JR" | "CALL" | "RET")
}

pub fn is_mnemonic_name(name: &str) -> bool {
    matches!(
        to_upper(name).as_str(),
        "NOP" | "RLCA" | "RRCA" | "RLA" | "RRA" | "DAA" | "CPL" | "SCF" | "CCF" | "HALT"
            | "EXX" | "DI" | "EI" | "NEG" | "RETN" | "RETI" | "RRD" | "RLD" | "LDI" | "CPI"
            | "INI" | "OUTI" | "LDD" | "CPD" | "IND" | "OUTD" | "LDIR" | "CPIR" | "INIR"
            | "OTIR" | "LDDR" | "CPDR" | "INDR" | "OTDR" | "LD" | "INC" | "DEC" | "ADD"
            | "ADC" | "SUB" | "SBC" | "AND" | "XOR" | "OR" | "CP" | "RLC" | "RRC" | "RL"
            | "RR" | "SLA" | "SRA" | "SLL" | "SRL" | "BIT" | "RES" | "SET" | "JP" | "JR"
            | "CALL" | "RET" | "RST" | "DJNZ" | "PUSH" | "POP" | "EX" | "IN" | "OUT" | "IM"
            | "SWAPNIB" | "MUL" | "OUTINB" | "LDIX" | "LDIRX" | "LDDX" | "LDDRX" | "PIXELDN"
            | "PIXELAD" | "SETAE" | "LDPIRX" | "LDIRSCALE" | "NEXTREG" | "MIRROR" | "TEST"
            | "BSLA" | "BSRA" | "BSRL" | "BSRF" | "BRLC"
    )
}

fn is_pragma_keyword(name: &str) -> bool {
    matches!(
        to_upper(name).as_str(),
        "ORG" | "XORG" | "DISP" | "ENT" | "XENT" | "EQU" | "VAR" | "DEFB" | "DB" | "DEFW"
            | "DW" | "DEFM" | "DM" | "DEFN" | "DEFMN" | "DEFH" | "DH" | "DEFS" | "DS"
            | "FILLB" | "FILLW" | "ALIGN" | "DEFG" | "DG" | "DEFGX" | "DGX" | "SKIP"
            | "TRACE" | "HTRACE" | "MODEL" | "RNDSEED" | "ERROR" | "INCLUDEBIN" | "COMPAREBIN"
    )
}

fn is_statement_keyword(name: &str) -> bool {
    matches!(
        to_upper(name).as_str(),
        "IF" | "IFUSED" | "IFNOTUSED" | "ELIF" | "ELSE" | "ENDIF" | "LOOP" | "ENDL" | "LEND"
            | "REPEAT" | "UNTIL" | "WHILE" | "WEND" | "FOR" | "NEXT" | "BREAK" | "CONTINUE"
            | "PROC" | "ENDP" | "PEND" | "LOCAL" | "MODULE" | "ENDMODULE" | "MODULEEND"
            | "MACRO" | "ENDM" | "MEND" | "STRUCT" | "ENDS"
    )
}

fn is_any_keyword(name: &str) -> bool {
    is_pragma_keyword(name) || is_statement_keyword(name) || is_mnemonic_name(name)
}

/// Parse every line of every file into a flat, file-ordered line list.
pub fn parse_source(files: &[SourceFile]) -> Vec<SourceLine> {
    let mut out = Vec::new();
    for (file_index, file) in files.iter().enumerate() {
        for (ix, text) in file.lines.iter().enumerate() {
            out.push(parse_line(text, file_index, ix as u32 + 1));
        }
    }
    out
}

pub fn parse_line(text: &str, file_index: usize, line_no: u32) -> SourceLine {
    let mut result = SourceLine::empty(file_index, line_no);
    // DEFG patterns are free-form pixel art; they bypass the tokenizer.
    if let Some(line) = try_parse_defg(text, file_index, line_no) {
        return line;
    }
    let tokens = match Tokenizer::new(text, line_no).tokenize() {
        Ok(tokens) => tokens,
        Err(err) => {
            result.issue = Some(ParseIssue {
                message: err.message,
                span: Span::new(line_no, err.column.saturating_sub(1), err.column),
            });
            return result;
        }
    };
    result.has_macro_params = tokens
        .iter()
        .any(|t| matches!(t.kind, TokenKind::MacroParam(_)));

    let mut parser = LineParser {
        text,
        tokens: &tokens,
        pos: 0,
    };
    match parser.parse(&mut result) {
        Ok(()) => {}
        Err(issue) => result.issue = Some(issue),
    }
    result
}

/// Recognize `[label[:]] DEFG <pattern>` with string scanning only, so the
/// pattern may contain characters the tokenizer rejects.
fn try_parse_defg(text: &str, file_index: usize, line_no: u32) -> Option<SourceLine> {
    let (code, _) = crate::core::text_utils::split_comment(text);
    let mut rest = code;
    let mut label = None;

    let word_end = |s: &str| {
        s.find(|c: char| c.is_whitespace() || c == ':')
            .unwrap_or(s.len())
    };

    let trimmed = rest.trim_start();
    let lead = rest.len() - trimmed.len();
    let first_end = word_end(trimmed);
    let first = &trimmed[..first_end];
    if first.is_empty() {
        return None;
    }

    let is_defg_word = |w: &str| {
        let w = w.strip_prefix('.').unwrap_or(w);
        w.eq_ignore_ascii_case("DEFG") || w.eq_ignore_ascii_case("DG")
    };

    if is_defg_word(first) {
        rest = &trimmed[first_end..];
    } else {
        // Possible label before the keyword.
        if !first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '`')
        {
            return None;
        }
        let after = trimmed[first_end..].trim_start_matches(':');
        let after_trim = after.trim_start();
        let second_end = word_end(after_trim);
        let second = &after_trim[..second_end];
        if !is_defg_word(second) {
            return None;
        }
        label = Some(Label {
            name: first.to_string(),
            span: Span::new(line_no, lead, lead + first_end),
        });
        rest = &after_trim[second_end..];
    }

    let pattern = rest.trim();
    let span = Span::new(line_no, code.len() - rest.len(), code.len());
    Some(SourceLine {
        file_index,
        line: line_no,
        label,
        payload: LinePayload::Pragma(Pragma::DefG(pattern.to_string(), span)),
        has_macro_params: false,
        issue: if pattern.is_empty() {
            Some(ParseIssue {
                message: "DEFG requires a pixel pattern".to_string(),
                span,
            })
        } else {
            None
        },
    })
}

struct LineParser<'a> {
    text: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

type ParseResult<T> = Result<T, ParseIssue>;

impl<'a> LineParser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, off: usize) -> &Token {
        &self.tokens[(self.pos + off).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> &Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::End)
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(ParseIssue {
            message: message.into(),
            span: self.peek().span,
        })
    }

    fn expect_identifier(&mut self, what: &str) -> ParseResult<(String, Span)> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                let span = self.peek().span;
                self.bump();
                Ok((name, span))
            }
            _ => self.error(format!("Expected {what}")),
        }
    }

    fn expect_end(&self) -> ParseResult<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(ParseIssue {
                message: format!(
                    "Unexpected '{}' at end of line",
                    self.peek().to_source_text()
                ),
                span: self.peek().span,
            })
        }
    }

    fn parse(&mut self, line: &mut SourceLine) -> ParseResult<()> {
        if self.at_end() {
            return Ok(());
        }

        // Explicit label: `name:`.
        if let TokenKind::Identifier(name) = &self.peek().kind {
            if matches!(self.peek_at(1).kind, TokenKind::Colon) {
                line.label = Some(Label {
                    name: name.clone(),
                    span: self.peek().span,
                });
                self.bump();
                self.bump();
            }
        }

        // Colon-free label: an identifier that is not a keyword, followed
        // by end of line, a dotted directive, or a keyword identifier.
        if line.label.is_none() {
            if let TokenKind::Identifier(name) = &self.peek().kind {
                if !is_any_keyword(name) {
                    let take = match &self.peek_at(1).kind {
                        TokenKind::End | TokenKind::Dot => true,
                        TokenKind::Identifier(next) => is_any_keyword(next),
                        _ => false,
                    };
                    if take {
                        line.label = Some(Label {
                            name: name.clone(),
                            span: self.peek().span,
                        });
                        self.bump();
                    }
                }
            }
        }

        if self.at_end() {
            return Ok(());
        }

        // `name = expr` assignment (variable or struct field).
        if line.label.is_none() {
            if let TokenKind::Identifier(name) = &self.peek().kind {
                if matches!(self.peek_at(1).kind, TokenKind::Assign) {
                    let name = name.clone();
                    let span = self.peek().span;
                    self.bump();
                    self.bump();
                    let expr = self.parse_expr()?;
                    self.expect_end()?;
                    line.payload = LinePayload::VarAssign { name, span, expr };
                    return Ok(());
                }
            }
        }

        // Keyword, dotted or bare.
        let keyword = match &self.peek().kind {
            TokenKind::Dot => {
                self.bump();
                let (name, span) = self.expect_identifier("directive name after '.'")?;
                Some((name, span))
            }
            TokenKind::Identifier(name)
                if is_pragma_keyword(name) || is_statement_keyword(name) =>
            {
                let name = name.clone();
                let span = self.peek().span;
                self.bump();
                Some((name, span))
            }
            _ => None,
        };

        if let Some((keyword, span)) = keyword {
            if is_pragma_keyword(&keyword) {
                let pragma = self.parse_pragma(&keyword)?;
                self.expect_end()?;
                line.payload = LinePayload::Pragma(pragma);
                return Ok(());
            }
            if is_statement_keyword(&keyword) {
                let statement = self.parse_statement(&keyword)?;
                self.expect_end()?;
                line.payload = LinePayload::Statement(statement);
                return Ok(());
            }
            return Err(ParseIssue {
                message: format!("Unknown directive '.{keyword}'"),
                span,
            });
        }

        // Operation or invocation.
        if let TokenKind::Identifier(name) = &self.peek().kind {
            if is_mnemonic_name(name) {
                let mnemonic = name.clone();
                let span = self.peek().span;
                self.bump();
                let operands = self.parse_operands(&mnemonic)?;
                self.expect_end()?;
                line.payload = LinePayload::Operation(Operation {
                    mnemonic,
                    span,
                    operands,
                });
                return Ok(());
            }
            // `Name(...)` or `Mod.Name(...)` invocation.
            let path = self.parse_name_path()?;
            if matches!(self.peek().kind, TokenKind::OpenParen) {
                let args = self.parse_invoke_args()?;
                self.expect_end()?;
                line.payload = LinePayload::Invocation { name: path, args };
                return Ok(());
            }
            return Err(ParseIssue {
                message: format!("Unknown mnemonic or directive '{}'", path.display()),
                span: path.span,
            });
        }

        self.error(format!(
            "Unexpected '{}' at start of statement",
            self.peek().to_source_text()
        ))
    }

    // ---- pragmas -------------------------------------------------------

    fn parse_pragma(&mut self, keyword: &str) -> ParseResult<Pragma> {
        let upper = to_upper(keyword);
        Ok(match upper.as_str() {
            "ORG" => Pragma::Org(self.parse_expr()?),
            "XORG" => Pragma::Xorg(self.parse_expr()?),
            "DISP" => Pragma::Disp(self.parse_expr()?),
            "ENT" => Pragma::Ent(self.parse_expr()?),
            "XENT" => Pragma::Xent(self.parse_expr()?),
            "EQU" => Pragma::Equ(self.parse_expr()?),
            "VAR" => Pragma::Var(self.parse_expr()?),
            "DEFB" | "DB" => Pragma::DefB(self.parse_expr_list()?),
            "DEFW" | "DW" => Pragma::DefW(self.parse_expr_list()?),
            "DEFM" | "DM" => Pragma::DefM {
                exprs: self.parse_expr_list()?,
                bit7: false,
                null: false,
            },
            "DEFN" => Pragma::DefM {
                exprs: self.parse_expr_list()?,
                bit7: false,
                null: true,
            },
            "DEFMN" => Pragma::DefM {
                exprs: self.parse_expr_list()?,
                bit7: true,
                null: true,
            },
            "DEFH" | "DH" => Pragma::DefH(self.parse_expr()?),
            "DEFS" | "DS" => Pragma::DefS(self.parse_expr_list()?),
            "FILLB" => Pragma::FillB(self.parse_expr_list()?),
            "FILLW" => Pragma::FillW(self.parse_expr_list()?),
            "ALIGN" => {
                if self.at_end() {
                    Pragma::Align(None)
                } else {
                    Pragma::Align(Some(self.parse_expr()?))
                }
            }
            "DEFG" | "DG" => {
                // The rest of the line is a raw pixel pattern.
                let span = self.peek().span;
                let col = span.col_start.saturating_sub(1).min(self.text.len());
                let pattern = self.text[col..].trim_end().to_string();
                self.pos = self.tokens.len() - 1;
                Pragma::DefG(pattern, span)
            }
            "DEFGX" | "DGX" => Pragma::DefGx(self.parse_expr()?),
            "SKIP" => Pragma::Skip(self.parse_expr_list()?),
            "TRACE" => Pragma::Trace {
                hex: false,
                exprs: self.parse_expr_list()?,
            },
            "HTRACE" => Pragma::Trace {
                hex: true,
                exprs: self.parse_expr_list()?,
            },
            "MODEL" => {
                let (name, span) = self.expect_identifier("model name")?;
                Pragma::Model(name, span)
            }
            "RNDSEED" => {
                if self.at_end() {
                    Pragma::RndSeed(None)
                } else {
                    Pragma::RndSeed(Some(self.parse_expr()?))
                }
            }
            "ERROR" => Pragma::Error(self.parse_expr()?),
            "INCLUDEBIN" => Pragma::IncludeBin(self.parse_expr_list()?),
            "COMPAREBIN" => Pragma::CompareBin(self.parse_expr()?),
            _ => return self.error(format!("Unknown pragma '{keyword}'")),
        })
    }

    fn parse_expr_list(&mut self) -> ParseResult<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while matches!(self.peek().kind, TokenKind::Comma) {
            self.bump();
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    // ---- statements ----------------------------------------------------

    fn parse_statement(&mut self, keyword: &str) -> ParseResult<Statement> {
        let upper = to_upper(keyword);
        Ok(match upper.as_str() {
            "IF" => Statement::If(IfKind::If(self.parse_expr()?)),
            "IFUSED" => Statement::If(IfKind::IfUsed(self.parse_name_path()?)),
            "IFNOTUSED" => Statement::If(IfKind::IfNotUsed(self.parse_name_path()?)),
            "ELIF" => Statement::Elif(self.parse_expr()?),
            "ELSE" => Statement::Else,
            "ENDIF" => Statement::Endif,
            "LOOP" => Statement::Loop(self.parse_expr()?),
            "ENDL" | "LEND" => Statement::EndLoop,
            "REPEAT" => Statement::Repeat,
            "UNTIL" => Statement::Until(self.parse_expr()?),
            "WHILE" => Statement::While(self.parse_expr()?),
            "WEND" => Statement::Wend,
            "FOR" => self.parse_for()?,
            "NEXT" => Statement::Next,
            "BREAK" => Statement::Break,
            "CONTINUE" => Statement::Continue,
            "PROC" => Statement::Proc,
            "ENDP" | "PEND" => Statement::Endp,
            "LOCAL" => {
                let mut names = Vec::new();
                loop {
                    let (name, span) = self.expect_identifier("local symbol name")?;
                    names.push((name, span));
                    if matches!(self.peek().kind, TokenKind::Comma) {
                        self.bump();
                    } else {
                        break;
                    }
                }
                Statement::Local(names)
            }
            "MODULE" => {
                if self.at_end() {
                    Statement::Module(None)
                } else {
                    let (name, _) = self.expect_identifier("module name")?;
                    Statement::Module(Some(name))
                }
            }
            "ENDMODULE" | "MODULEEND" => Statement::EndModule,
            "MACRO" => {
                let mut params = Vec::new();
                let parenthesized = matches!(self.peek().kind, TokenKind::OpenParen);
                if parenthesized {
                    self.bump();
                }
                if !self.at_end() && !matches!(self.peek().kind, TokenKind::CloseParen) {
                    loop {
                        let (name, span) = self.expect_identifier("macro parameter name")?;
                        params.push((name, span));
                        if matches!(self.peek().kind, TokenKind::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                if parenthesized {
                    if !matches!(self.peek().kind, TokenKind::CloseParen) {
                        return self.error("Expected ')' after macro parameters");
                    }
                    self.bump();
                }
                Statement::Macro(params)
            }
            "ENDM" | "MEND" => Statement::EndMacro,
            "STRUCT" => Statement::Struct,
            "ENDS" => Statement::EndStruct,
            _ => return self.error(format!("Unknown statement '{keyword}'")),
        })
    }

    fn parse_for(&mut self) -> ParseResult<Statement> {
        let (var, var_span) = self.expect_identifier("loop variable")?;
        if !matches!(self.peek().kind, TokenKind::Assign) {
            return self.error("Expected '=' after FOR variable");
        }
        self.bump();
        let from = self.parse_expr()?;
        self.expect_keyword("TO")?;
        let to = self.parse_expr()?;
        let step = if self.try_keyword("STEP") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::For {
            var,
            var_span,
            from,
            to,
            step,
        })
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.try_keyword(keyword) {
            Ok(())
        } else {
            self.error(format!("Expected '{keyword}'"))
        }
    }

    /// Consume a `TO` / `STEP`-style keyword, dotted or bare.
    fn try_keyword(&mut self, keyword: &str) -> bool {
        let dotted = matches!(self.peek().kind, TokenKind::Dot);
        let probe = if dotted { self.peek_at(1) } else { self.peek() };
        if let TokenKind::Identifier(name) = &probe.kind {
            if name.eq_ignore_ascii_case(keyword) {
                self.bump();
                if dotted {
                    self.bump();
                }
                return true;
            }
        }
        false
    }

    // ---- operands ------------------------------------------------------

    fn parse_operands(&mut self, mnemonic: &str) -> ParseResult<Vec<Operand>> {
        let mut operands = Vec::new();
        if self.at_end() {
            return Ok(operands);
        }
        loop {
            let condition_slot = operands.is_empty() && takes_condition(mnemonic);
            operands.push(self.parse_operand(condition_slot)?);
            if matches!(self.peek().kind, TokenKind::Comma) {
                self.bump();
            } else {
                break;
            }
        }
        Ok(operands)
    }

    fn parse_operand(&mut self, condition_slot: bool) -> ParseResult<Operand> {
        if let TokenKind::Identifier(name) = &self.peek().kind {
            if condition_slot && is_condition_name(name) {
                let name = name.clone();
                let span = self.peek().span;
                self.bump();
                // `C` doubles as a register; in the condition slot of a
                // branch it is always the condition.
                return Ok(Operand::Condition(name, span));
            }
            if is_register_name(name) {
                let name = name.clone();
                let span = self.peek().span;
                self.bump();
                return Ok(Operand::Reg(name, span));
            }
        }

        if matches!(self.peek().kind, TokenKind::OpenParen) {
            if let Some(operand) = self.try_parse_indirect()? {
                return Ok(operand);
            }
        }

        Ok(Operand::Expr(self.parse_expr()?))
    }

    /// A parenthesized operand is indirection only when the closing paren
    /// ends the operand; `(2+3)*4` stays an expression.
    fn try_parse_indirect(&mut self) -> ParseResult<Option<Operand>> {
        let open_span = self.peek().span;
        let close = self.find_matching_paren()?;
        let ends_operand = matches!(
            self.tokens[close + 1].kind,
            TokenKind::Comma | TokenKind::End
        );
        if !ends_operand {
            return Ok(None);
        }

        self.bump(); // consume '('
        // Single register inside parens.
        if let TokenKind::Identifier(name) = &self.peek().kind {
            if close == self.pos + 1 && is_register_name(name) {
                let upper = to_upper(name);
                let span = Span {
                    line: open_span.line,
                    col_start: open_span.col_start,
                    col_end: self.peek_at(1).span.col_end,
                };
                self.bump();
                self.bump(); // ')'
                return Ok(Some(match upper.as_str() {
                    "C" => Operand::CPort(span),
                    "IX" | "IY" => Operand::Indexed {
                        base: upper,
                        offset: None,
                        negative: false,
                        span,
                    },
                    _ => Operand::RegIndirect(upper, span),
                }));
            }
            // (IX+d) / (IY-d)
            if is_register_name(name) && matches!(to_upper(name).as_str(), "IX" | "IY") {
                let base = to_upper(name);
                self.bump();
                let negative = match &self.peek().kind {
                    TokenKind::Operator(OperatorKind::Plus) => false,
                    TokenKind::Operator(OperatorKind::Minus) => true,
                    _ => return self.error("Expected '+' or '-' after index register"),
                };
                self.bump();
                let offset = self.parse_expr()?;
                if !matches!(self.peek().kind, TokenKind::CloseParen) {
                    return self.error("Expected ')' after indexed address");
                }
                let span = Span {
                    line: open_span.line,
                    col_start: open_span.col_start,
                    col_end: self.peek().span.col_end,
                };
                self.bump();
                return Ok(Some(Operand::Indexed {
                    base,
                    offset: Some(offset),
                    negative,
                    span,
                }));
            }
        }

        // (expr) memory indirection.
        let expr = self.parse_expr()?;
        if !matches!(self.peek().kind, TokenKind::CloseParen) {
            return self.error("Expected ')' after address expression");
        }
        let span = Span {
            line: open_span.line,
            col_start: open_span.col_start,
            col_end: self.peek().span.col_end,
        };
        self.bump();
        Ok(Some(Operand::MemIndirect(expr, span)))
    }

    fn find_matching_paren(&self) -> ParseResult<usize> {
        let mut depth = 0usize;
        for (ix, token) in self.tokens.iter().enumerate().skip(self.pos) {
            match token.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(ix);
                    }
                }
                TokenKind::End => break,
                _ => {}
            }
        }
        self.error("Unbalanced parentheses")
    }

    // ---- invocation ----------------------------------------------------

    fn parse_invoke_args(&mut self) -> ParseResult<Vec<InvokeArg>> {
        self.bump(); // '('
        let mut args = Vec::new();
        if matches!(self.peek().kind, TokenKind::CloseParen) {
            self.bump();
            return Ok(args);
        }
        loop {
            let start = self.peek().span;
            let mut depth = 0usize;
            let mut end = start;
            loop {
                match self.peek().kind {
                    TokenKind::OpenParen => depth += 1,
                    TokenKind::CloseParen if depth == 0 => break,
                    TokenKind::CloseParen => depth -= 1,
                    TokenKind::Comma if depth == 0 => break,
                    TokenKind::End => return self.error("Unterminated invocation argument list"),
                    _ => {}
                }
                end = self.peek().span;
                self.bump();
            }
            let lo = start.col_start.saturating_sub(1).min(self.text.len());
            let hi = end.col_end.saturating_sub(1).min(self.text.len());
            args.push(InvokeArg {
                text: self.text[lo..hi].trim().to_string(),
                span: Span {
                    line: start.line,
                    col_start: start.col_start,
                    col_end: end.col_end,
                },
            });
            if matches!(self.peek().kind, TokenKind::Comma) {
                self.bump();
            } else {
                break;
            }
        }
        if !matches!(self.peek().kind, TokenKind::CloseParen) {
            return self.error("Expected ')' after invocation arguments");
        }
        self.bump();
        Ok(args)
    }

    // ---- expressions ---------------------------------------------------

    pub fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> ParseResult<Expr> {
        let cond = self.parse_binary(0)?;
        if matches!(self.peek().kind, TokenKind::Question) {
            let span = self.peek().span;
            self.bump();
            let then_expr = self.parse_ternary()?;
            if !matches!(self.peek().kind, TokenKind::Colon) {
                return self.error("Expected ':' in conditional expression");
            }
            self.bump();
            let else_expr = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                span,
            });
        }
        Ok(cond)
    }

    fn binary_op(&self, min_level: u8) -> Option<(BinaryOp, u8)> {
        let op = match self.peek().kind {
            TokenKind::Operator(op) => op,
            _ => return None,
        };
        let (mapped, level) = match op {
            OperatorKind::LogicOr => (BinaryOp::LogicOr, 1),
            OperatorKind::LogicXor => (BinaryOp::LogicXor, 1),
            OperatorKind::LogicAnd => (BinaryOp::LogicAnd, 2),
            OperatorKind::BitOr => (BinaryOp::BitOr, 3),
            OperatorKind::BitXor => (BinaryOp::BitXor, 4),
            OperatorKind::BitAnd => (BinaryOp::BitAnd, 5),
            OperatorKind::Eq => (BinaryOp::Eq, 6),
            OperatorKind::Ne => (BinaryOp::Ne, 6),
            OperatorKind::Lt => (BinaryOp::Lt, 7),
            OperatorKind::Le => (BinaryOp::Le, 7),
            OperatorKind::Gt => (BinaryOp::Gt, 7),
            OperatorKind::Ge => (BinaryOp::Ge, 7),
            OperatorKind::Shl => (BinaryOp::Shl, 8),
            OperatorKind::Shr => (BinaryOp::Shr, 8),
            OperatorKind::Plus => (BinaryOp::Add, 9),
            OperatorKind::Minus => (BinaryOp::Subtract, 9),
            OperatorKind::Multiply => (BinaryOp::Multiply, 10),
            OperatorKind::Divide => (BinaryOp::Divide, 10),
            OperatorKind::Mod => (BinaryOp::Mod, 10),
            _ => return None,
        };
        if level >= min_level {
            Some((mapped, level))
        } else {
            None
        }
    }

    fn parse_binary(&mut self, min_level: u8) -> ParseResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, level)) = self.binary_op(min_level) {
            let span = self.peek().span;
            self.bump();
            let rhs = self.parse_binary(level + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Operator(OperatorKind::Plus) => Some(UnaryOp::Plus),
            TokenKind::Operator(OperatorKind::Minus) => Some(UnaryOp::Minus),
            TokenKind::Operator(OperatorKind::BitNot) => Some(UnaryOp::BitNot),
            TokenKind::Operator(OperatorKind::LogicNot) => Some(UnaryOp::LogicNot),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.peek().span;
            self.bump();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
                span,
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let span = self.peek().span;
        match self.peek().kind.clone() {
            TokenKind::Number(NumberLiteral { value, .. }) => {
                self.bump();
                Ok(Expr::Literal(value, span))
            }
            TokenKind::String(lit) => {
                self.bump();
                Ok(Expr::Str(lit, span))
            }
            TokenKind::Dollar => {
                self.bump();
                Ok(Expr::CurAddress(span))
            }
            TokenKind::DollarDollar => {
                self.bump();
                Ok(Expr::CurInstruction(span))
            }
            TokenKind::MacroParam(name) => {
                self.bump();
                Ok(Expr::MacroParam(name, span))
            }
            TokenKind::OpenParen => {
                self.bump();
                let expr = self.parse_expr()?;
                if !matches!(self.peek().kind, TokenKind::CloseParen) {
                    return self.error("Expected ')'");
                }
                self.bump();
                Ok(expr)
            }
            TokenKind::DoubleColon | TokenKind::Identifier(_) => {
                // `true` / `false` literals, function calls, symbol paths.
                if let TokenKind::Identifier(name) = &self.peek().kind {
                    if name.eq_ignore_ascii_case("true") {
                        self.bump();
                        return Ok(Expr::Literal(Value::Bool(true), span));
                    }
                    if name.eq_ignore_ascii_case("false") {
                        self.bump();
                        return Ok(Expr::Literal(Value::Bool(false), span));
                    }
                    if matches!(self.peek_at(1).kind, TokenKind::OpenParen) {
                        let name = name.clone();
                        self.bump();
                        self.bump();
                        let mut args = Vec::new();
                        if !matches!(self.peek().kind, TokenKind::CloseParen) {
                            loop {
                                args.push(self.parse_expr()?);
                                if matches!(self.peek().kind, TokenKind::Comma) {
                                    self.bump();
                                } else {
                                    break;
                                }
                            }
                        }
                        if !matches!(self.peek().kind, TokenKind::CloseParen) {
                            return self.error("Expected ')' after function arguments");
                        }
                        self.bump();
                        return Ok(Expr::Call { name, args, span });
                    }
                }
                let path = self.parse_name_path()?;
                Ok(Expr::Symbol(path))
            }
            _ => self.error(format!(
                "Unexpected '{}' in expression",
                self.peek().to_source_text()
            )),
        }
    }

    fn parse_name_path(&mut self) -> ParseResult<NamePath> {
        let start_span = self.peek().span;
        let rooted = matches!(self.peek().kind, TokenKind::DoubleColon);
        if rooted {
            self.bump();
        }
        let (first, first_span) = self.expect_identifier("symbol name")?;
        let local = first.starts_with('@');
        let mut segments = vec![if local {
            first[1..].to_string()
        } else {
            first
        }];
        let mut end_span = first_span;
        while matches!(self.peek().kind, TokenKind::Dot)
            && matches!(self.peek_at(1).kind, TokenKind::Identifier(_))
        {
            self.bump();
            let (seg, seg_span) = self.expect_identifier("name segment")?;
            segments.push(seg);
            end_span = seg_span;
        }
        Ok(NamePath {
            rooted,
            local,
            segments,
            span: Span {
                line: start_span.line,
                col_start: start_span.col_start,
                col_end: end_span.col_end,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SourceLine {
        parse_line(text, 0, 1)
    }

    fn payload(text: &str) -> LinePayload {
        let line = parse(text);
        assert!(line.issue.is_none(), "parse issue: {:?}", line.issue);
        line.payload
    }

    #[test]
    fn empty_and_comment_lines() {
        assert!(matches!(payload(""), LinePayload::None));
        assert!(matches!(payload("   ; note"), LinePayload::None));
    }

    #[test]
    fn label_only_line() {
        let line = parse("target:");
        assert_eq!(line.label.as_ref().map(|l| l.name.as_str()), Some("target"));
        assert!(matches!(line.payload, LinePayload::None));
    }

    #[test]
    fn colon_free_label_before_instruction() {
        let line = parse("start ld a,b");
        assert_eq!(line.label.as_ref().map(|l| l.name.as_str()), Some("start"));
        assert!(matches!(line.payload, LinePayload::Operation(_)));
    }

    #[test]
    fn operation_with_register_operands() {
        match payload("ld a,b") {
            LinePayload::Operation(op) => {
                assert_eq!(op.mnemonic, "ld");
                assert_eq!(op.operands.len(), 2);
                assert!(matches!(&op.operands[0], Operand::Reg(r, _) if r == "a"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn hl_indirect_operand() {
        match payload("ld (hl),a") {
            LinePayload::Operation(op) => {
                assert!(matches!(&op.operands[0], Operand::RegIndirect(r, _) if r == "HL"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn indexed_operand_with_sign() {
        match payload("bit 3,(iy-2)") {
            LinePayload::Operation(op) => match &op.operands[1] {
                Operand::Indexed { base, negative, offset, .. } => {
                    assert_eq!(base, "IY");
                    assert!(*negative);
                    assert!(offset.is_some());
                }
                other => panic!("unexpected operand {other:?}"),
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn condition_only_for_branches() {
        match payload("jr nz,skip") {
            LinePayload::Operation(op) => {
                assert!(matches!(&op.operands[0], Operand::Condition(c, _) if c == "nz"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        match payload("ld c,1") {
            LinePayload::Operation(op) => {
                assert!(matches!(&op.operands[0], Operand::Reg(r, _) if r == "c"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn parenthesized_expression_is_not_indirection() {
        match payload("defb (2+3)*4") {
            LinePayload::Pragma(Pragma::DefB(exprs)) => {
                assert!(matches!(exprs[0], Expr::Binary { .. }));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn mem_indirect_operand() {
        match payload("ld hl,(data)") {
            LinePayload::Operation(op) => {
                assert!(matches!(&op.operands[1], Operand::MemIndirect(_, _)));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn pragma_with_dotted_keyword_and_label() {
        let line = parse("size: .equ 100");
        assert_eq!(line.label.as_ref().map(|l| l.name.as_str()), Some("size"));
        assert!(matches!(line.payload, LinePayload::Pragma(Pragma::Equ(_))));
    }

    #[test]
    fn var_assignment_payload() {
        match payload("count = 5") {
            LinePayload::VarAssign { name, .. } => assert_eq!(name, "count"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn for_statement_with_step() {
        match payload(".for i = 1 .to 10 .step 2") {
            LinePayload::Statement(Statement::For { var, step, .. }) => {
                assert_eq!(var, "i");
                assert!(step.is_some());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn macro_definition_params() {
        match payload("MyMac: .macro(first, second)") {
            LinePayload::Statement(Statement::Macro(params)) => {
                assert_eq!(params.len(), 2);
                assert_eq!(params[0].0, "first");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn invocation_with_argument_text() {
        match payload("MyMac(hl, 5+2)") {
            LinePayload::Invocation { name, args } => {
                assert_eq!(name.display(), "MyMac");
                assert_eq!(args[0].text, "hl");
                assert_eq!(args[1].text, "5+2");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn struct_invocation_with_label() {
        let line = parse("inst: MyS()");
        assert_eq!(line.label.as_ref().map(|l| l.name.as_str()), Some("inst"));
        assert!(matches!(line.payload, LinePayload::Invocation { .. }));
    }

    #[test]
    fn qualified_and_rooted_paths() {
        match payload("defw Outer.Inner.sym") {
            LinePayload::Pragma(Pragma::DefW(exprs)) => match &exprs[0] {
                Expr::Symbol(path) => {
                    assert_eq!(path.segments, vec!["Outer", "Inner", "sym"]);
                    assert!(!path.rooted);
                }
                other => panic!("unexpected expr {other:?}"),
            },
            other => panic!("unexpected payload {other:?}"),
        }
        match payload("defw ::top") {
            LinePayload::Pragma(Pragma::DefW(exprs)) => {
                assert!(matches!(&exprs[0], Expr::Symbol(path) if path.rooted));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn macro_param_flag_set() {
        let line = parse("ld a,{{value}}");
        assert!(line.has_macro_params);
    }

    #[test]
    fn ternary_expression() {
        match payload("defb 1 > 0 ? 10 : 20") {
            LinePayload::Pragma(Pragma::DefB(exprs)) => {
                assert!(matches!(exprs[0], Expr::Ternary { .. }));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_mnemonic_is_an_issue() {
        let line = parse("frobnicate a,b");
        assert!(line.issue.is_some());
    }

    #[test]
    fn defg_takes_raw_pattern() {
        match payload(".defg ....XXXX") {
            LinePayload::Pragma(Pragma::DefG(pattern, _)) => assert_eq!(pattern, "....XXXX"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn jp_indirect_ix() {
        match payload("jp (ix)") {
            LinePayload::Operation(op) => {
                assert!(matches!(&op.operands[0], Operand::Indexed { base, offset: None, .. } if base == "IX"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
