// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Assembler driver.
//!
//! Walks the parsed line list with an index cursor, anchors overflow
//! labels, dispatches pragmas/operations/statements, and owns all mutable
//! state of one assemble run: segments, the module tree, the fixup log,
//! diagnostics and output bookkeeping. Concurrent assembles use
//! independent instances; nothing is shared.

pub mod cli;
pub mod error;
pub mod listing;

mod flow;
mod invoke;
mod pragmas;

#[cfg(test)]
mod tests;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::expr::{eval_expr, EvalContext, EvalFailure, EvalResult, Rng};
use crate::core::fixup::{jr_displacement, Fixup, FixupKind};
use crate::core::parser::{
    parse_source, Expr, LinePayload, NamePath, Operation, Pragma, SourceFile, SourceLine,
    Statement,
};
use crate::core::segment::Segment;
use crate::core::symbol_table::{
    DefineOutcome, LocalScope, Symbol, SymbolKind, SymbolTable, ROOT_MODULE,
};
use crate::core::tokenizer::Span;
use crate::core::value::Value;
use crate::z80::encoder::encode;
use crate::z80::{ConstEval, ConstIssue, Encoded, Part};

use error::{codes, Diagnostic, Severity};
use invoke::StructMode;
use listing::{AssemblyOutput, CompareBinRequest, ListingItem, SourceMap, SymbolEntry, TraceMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumModel {
    Spectrum48,
    Spectrum128,
    SpectrumP3,
    Next,
}

impl SpectrumModel {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SPECTRUM48" => Some(Self::Spectrum48),
            "SPECTRUM128" => Some(Self::Spectrum128),
            "SPECTRUMP3" => Some(Self::SpectrumP3),
            "NEXT" => Some(Self::Next),
            _ => None,
        }
    }
}

/// Tunables for one assemble run.
#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    /// Origin used when the source emits before any ORG.
    pub default_start: u16,
    /// A loop body aborts once it contributes this many errors.
    pub loop_error_limit: usize,
    pub max_loop_iterations: u32,
    pub max_macro_depth: usize,
    /// Preset model; the MODEL pragma overrides it.
    pub model: Option<SpectrumModel>,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            default_start: 0x8000,
            loop_error_limit: 16,
            max_loop_iterations: 0xFFFF,
            max_macro_depth: 64,
            model: None,
        }
    }
}

/// Assemble parsed source files into segments, symbols, listing, source
/// map and diagnostics.
pub fn assemble(files: Vec<SourceFile>, options: AssemblerOptions) -> AssemblyOutput {
    let lines = parse_source(&files);
    let mut assembler = Assembler::new(files, options);
    let _ = assembler.exec_range(&lines, 0, lines.len());
    assembler.finalize();
    assembler.into_output()
}

/// Convenience entry for a single in-memory source.
pub fn assemble_text(source: &str, options: AssemblerOptions) -> AssemblyOutput {
    assemble(vec![SourceFile::new("source.z80asm", source)], options)
}

/// Control flow escaping an executed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
}

/// What the driver does after one line.
pub(crate) enum LineOutcome {
    Advance,
    JumpTo(usize),
    Break,
    Continue,
}

/// An overflow label pending its anchor address.
#[derive(Debug, Clone)]
pub(crate) struct PendingLabel {
    name: String,
    span: Span,
    file_index: usize,
    line: u32,
}

pub struct Assembler {
    pub(crate) options: AssemblerOptions,
    pub(crate) files: Vec<SourceFile>,
    pub(crate) symbols: SymbolTable,
    pub(crate) current_module: usize,
    pub(crate) segments: Vec<Segment>,
    pub(crate) current_segment: Option<usize>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) listing: Vec<ListingItem>,
    pub(crate) source_map: SourceMap,
    pub(crate) trace_messages: Vec<TraceMessage>,
    pub(crate) compare_bins: Vec<CompareBinRequest>,
    pub(crate) entry: Option<u16>,
    pub(crate) export_entry: Option<u16>,
    pub(crate) model: Option<SpectrumModel>,
    pub(crate) model_pragma_seen: bool,
    pub(crate) rng: Option<Rng>,
    pub(crate) failure: bool,
    pub(crate) macro_depth: usize,
    pub(crate) struct_mode: Option<StructMode>,
    /// Replaying a struct body to emit its default pattern.
    pub(crate) struct_clone: bool,
    pub(crate) overflow_label: Option<PendingLabel>,
    pub(crate) anon_module_counter: u32,
}

impl Assembler {
    fn new(files: Vec<SourceFile>, options: AssemblerOptions) -> Self {
        let model = options.model;
        Self {
            options,
            files,
            symbols: SymbolTable::new(),
            current_module: ROOT_MODULE,
            segments: Vec::new(),
            current_segment: None,
            diagnostics: Vec::new(),
            listing: Vec::new(),
            source_map: SourceMap::default(),
            trace_messages: Vec::new(),
            compare_bins: Vec::new(),
            entry: None,
            export_entry: None,
            model,
            model_pragma_seen: false,
            rng: None,
            failure: false,
            macro_depth: 0,
            struct_mode: None,
            struct_clone: false,
            overflow_label: None,
            anon_module_counter: 0,
        }
    }

    // ---- diagnostics ----------------------------------------------------

    pub(crate) fn diag(&mut self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Error {
            self.failure = true;
            if let Some(scope) = self.symbols.innermost_scope_mut(self.current_module) {
                scope.error_count += 1;
            }
        }
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn error_at(&mut self, line: &SourceLine, code: &'static str, message: String) {
        self.diag(Diagnostic::error(code, message).at(line.file_index, line.line));
    }

    pub(crate) fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|diag| diag.severity == Severity::Error)
            .count()
    }

    // ---- location and evaluation ----------------------------------------

    pub(crate) fn next_enabled(&self) -> bool {
        self.model == Some(SpectrumModel::Next)
    }

    pub(crate) fn ensure_segment(&mut self) -> usize {
        match self.current_segment {
            Some(index) => index,
            None => {
                let index = self.segments.len();
                self.segments.push(Segment::new(self.options.default_start));
                self.current_segment = Some(index);
                index
            }
        }
    }

    /// Logical current address without forcing a segment into existence.
    pub(crate) fn cur_logical(&self) -> i64 {
        match self.current_segment {
            Some(index) => self.segments[index].logical_address(),
            None => i64::from(self.options.default_start),
        }
    }

    pub(crate) fn cur_instruction(&self) -> i64 {
        match self.current_segment {
            Some(index) => self.segments[index].instruction_address(),
            None => i64::from(self.options.default_start),
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> EvalResult {
        let cur_addr = self.cur_logical();
        let cur_instr = self.cur_instruction();
        let mut env = EvalEnv {
            symbols: &mut self.symbols,
            module: self.current_module,
            cur_addr,
            cur_instr,
            rng: &mut self.rng,
        };
        eval_expr(expr, &mut env)
    }

    /// Evaluate an expression that must produce an integer right now;
    /// diagnoses and returns `None` otherwise.
    pub(crate) fn eval_int_now(&mut self, expr: &Expr, line: &SourceLine) -> Option<i64> {
        match self.eval(expr) {
            Ok(value) => match value.as_int() {
                Some(int) => Some(int),
                None => {
                    self.error_at(
                        line,
                        codes::STRING_NOT_ALLOWED,
                        "String value where a number is required".to_string(),
                    );
                    None
                }
            },
            Err(EvalFailure::Unresolved { symbol, .. }) => {
                self.error_at(
                    line,
                    codes::EXPRESSION_ERROR,
                    format!("Expression must be resolvable here, '{symbol}' is undefined"),
                );
                None
            }
            Err(EvalFailure::Error(err)) => {
                self.error_at(line, codes::EXPRESSION_ERROR, err.message);
                None
            }
        }
    }

    // ---- emission --------------------------------------------------------

    pub(crate) fn emit_byte(&mut self, value: u8, line: &SourceLine) -> bool {
        let index = self.ensure_segment();
        if self.segments[index].overflows(1) {
            self.error_at(
                line,
                codes::EMISSION_OVERFLOW,
                "Emission would exceed the 64K address space".to_string(),
            );
            return false;
        }
        self.segments[index].emit_byte(value);
        true
    }

    pub(crate) fn emit_word(&mut self, value: u16, line: &SourceLine) -> bool {
        self.emit_byte(value as u8, line) && self.emit_byte((value >> 8) as u8, line)
    }

    fn record_fixup_here(&mut self, kind: FixupKind, expr: Option<Expr>, line: &SourceLine, span: Span) {
        let segment = self.ensure_segment();
        let offset = self.segments[segment].len();
        let reference = self.cur_logical();
        let fixup = Fixup {
            kind,
            segment,
            offset,
            reference,
            expr,
            module: self.current_module,
            file_index: line.file_index,
            line: line.line,
            span,
        };
        self.symbols.record_fixup(self.current_module, fixup);
    }

    /// Emit an 8-bit immediate: placeholder plus `Bit8` fixup when the
    /// expression is not yet evaluable. Overflow keeps the low byte.
    pub(crate) fn emit_expr8(&mut self, expr: &Expr, line: &SourceLine) {
        match self.eval(expr) {
            Ok(value) => match value.as_int() {
                Some(int) => {
                    self.emit_byte(int as u8, line);
                }
                None => {
                    self.error_at(
                        line,
                        codes::STRING_NOT_ALLOWED,
                        "String value where a number is required".to_string(),
                    );
                    self.emit_byte(0, line);
                }
            },
            Err(EvalFailure::Unresolved { .. }) => {
                self.record_fixup_here(FixupKind::Bit8, Some(expr.clone()), line, expr.span());
                self.emit_byte(0, line);
            }
            Err(EvalFailure::Error(err)) => {
                self.error_at(line, codes::EXPRESSION_ERROR, err.message);
                self.emit_byte(0, line);
            }
        }
    }

    pub(crate) fn emit_expr16(&mut self, expr: &Expr, line: &SourceLine, big_endian: bool) {
        match self.eval(expr) {
            Ok(value) => match value.as_int() {
                Some(int) => {
                    let word = int as u16;
                    if big_endian {
                        self.emit_byte((word >> 8) as u8, line);
                        self.emit_byte(word as u8, line);
                    } else {
                        self.emit_word(word, line);
                    }
                }
                None => {
                    self.error_at(
                        line,
                        codes::STRING_NOT_ALLOWED,
                        "String value where a number is required".to_string(),
                    );
                    self.emit_word(0, line);
                }
            },
            Err(EvalFailure::Unresolved { .. }) => {
                // Big-endian immediates exist only in `PUSH nn`, whose
                // operand is required to be resolvable.
                if big_endian {
                    self.error_at(
                        line,
                        codes::EXPRESSION_ERROR,
                        "PUSH nn operand must be resolvable here".to_string(),
                    );
                } else {
                    self.record_fixup_here(FixupKind::Bit16, Some(expr.clone()), line, expr.span());
                }
                self.emit_word(0, line);
            }
            Err(EvalFailure::Error(err)) => {
                self.error_at(line, codes::EXPRESSION_ERROR, err.message);
                self.emit_word(0, line);
            }
        }
    }

    /// Emit a PC-relative displacement byte for JR/DJNZ.
    pub(crate) fn emit_rel(&mut self, expr: &Expr, line: &SourceLine) {
        match self.eval(expr) {
            Ok(value) => match value.as_int() {
                Some(target) => {
                    let reference = self.cur_logical() + 1;
                    match jr_displacement(target, reference) {
                        Some(disp) => {
                            self.emit_byte(disp as u8, line);
                        }
                        None => {
                            self.error_at(
                                line,
                                codes::RELATIVE_JUMP_RANGE,
                                format!(
                                    "Relative jump to {target:#06X} is out of the -128..127 range"
                                ),
                            );
                            self.emit_byte(0, line);
                        }
                    }
                }
                None => {
                    self.error_at(
                        line,
                        codes::STRING_NOT_ALLOWED,
                        "String value where a number is required".to_string(),
                    );
                    self.emit_byte(0, line);
                }
            },
            Err(EvalFailure::Unresolved { .. }) => {
                self.record_fixup_here(FixupKind::Jr, Some(expr.clone()), line, expr.span());
                self.emit_byte(0, line);
            }
            Err(EvalFailure::Error(err)) => {
                self.error_at(line, codes::EXPRESSION_ERROR, err.message);
                self.emit_byte(0, line);
            }
        }
    }

    // ---- labels ----------------------------------------------------------

    fn define_symbol(
        &mut self,
        name: &str,
        span: Span,
        file_index: usize,
        line: u32,
        value: Value,
        kind: SymbolKind,
    ) {
        let symbol = Symbol::new(name, value, kind, file_index, line);
        if self.symbols.define(self.current_module, symbol) == DefineOutcome::Duplicate {
            self.diag(
                Diagnostic::error(
                    codes::DUPLICATE_SYMBOL,
                    format!("Symbol '{name}' is already defined in this scope"),
                )
                .at(file_index, line)
                .with_span(span)
                .with_token(name),
            );
        }
    }

    pub(crate) fn define_symbol_checked(
        &mut self,
        name: &str,
        span: Span,
        line: &SourceLine,
        value: Value,
        kind: SymbolKind,
    ) {
        self.define_symbol(name, span, line.file_index, line.line, value, kind);
    }

    /// VAR semantics: update an existing variable in place, else define.
    pub(crate) fn assign_variable_checked(
        &mut self,
        name: &str,
        span: Span,
        line: &SourceLine,
        value: Value,
    ) {
        let symbol = Symbol::new(name, value, SymbolKind::Variable, line.file_index, line.line);
        if self.symbols.assign_variable(self.current_module, symbol) == DefineOutcome::Duplicate {
            self.diag(
                Diagnostic::error(
                    codes::DUPLICATE_SYMBOL,
                    format!("Symbol '{name}' is already defined and is not a variable"),
                )
                .at(line.file_index, line.line)
                .with_span(span)
                .with_token(name),
            );
        }
    }

    /// Record a fixup that binds a symbol or entry pointer rather than
    /// patching bytes; it needs no segment position.
    pub(crate) fn record_pointer_fixup(&mut self, kind: FixupKind, expr: &Expr, line: &SourceLine) {
        let fixup = Fixup {
            kind,
            segment: self.current_segment.unwrap_or(0),
            offset: 0,
            reference: self.cur_logical(),
            expr: Some(expr.clone()),
            module: self.current_module,
            file_index: line.file_index,
            line: line.line,
            span: expr.span(),
        };
        self.symbols.record_fixup(self.current_module, fixup);
    }

    pub(crate) fn bind_label(
        &mut self,
        name: &str,
        span: Span,
        file_index: usize,
        line: u32,
        value: Value,
    ) {
        self.define_symbol(name, span, file_index, line, value, SymbolKind::Label);
    }

    /// Anchor a pending label-only line at the current address.
    pub(crate) fn anchor_overflow(&mut self) {
        if let Some(pending) = self.overflow_label.take() {
            let address = Value::Int(self.cur_logical());
            self.bind_label(
                &pending.name,
                pending.span,
                pending.file_index,
                pending.line,
                address,
            );
        }
    }

    // ---- driver ----------------------------------------------------------

    pub(crate) fn exec_range(&mut self, lines: &[SourceLine], start: usize, end: usize) -> Flow {
        let mut ix = start;
        while ix < end {
            match self.exec_line(lines, ix) {
                LineOutcome::Advance => ix += 1,
                LineOutcome::JumpTo(next) => ix = next,
                LineOutcome::Break => return Flow::Break,
                LineOutcome::Continue => return Flow::Continue,
            }
        }
        Flow::Normal
    }

    fn exec_line(&mut self, lines: &[SourceLine], ix: usize) -> LineOutcome {
        let line = &lines[ix];

        // An open struct invocation consumes field assignments; the first
        // other line closes it.
        if self.struct_mode.is_some() {
            if let LinePayload::VarAssign { name, span, expr } = &line.payload {
                invoke::struct_field_assign(self, line, name, *span, expr);
                return LineOutcome::Advance;
            }
            invoke::close_struct_mode(self);
        }

        if let Some(issue) = &line.issue {
            let message = issue.message.clone();
            self.diag(
                Diagnostic::error(codes::SYNTAX_ERROR, message)
                    .at(line.file_index, line.line)
                    .with_span(issue.span),
            );
            return LineOutcome::Advance;
        }

        // Macro-parameter spans on an executed line mean the line is
        // outside any macro body; bodies are skipped at definition time.
        if line.has_macro_params {
            self.error_at(
                line,
                codes::MACRO_PARAM_OUTSIDE,
                "Macro parameter reference outside a macro body".to_string(),
            );
            return LineOutcome::Advance;
        }

        // Label-only lines become the overflow label.
        if matches!(line.payload, LinePayload::None) {
            if let Some(label) = &line.label {
                if !self.struct_clone {
                    self.anchor_overflow();
                    self.overflow_label = Some(PendingLabel {
                        name: label.name.clone(),
                        span: label.span,
                        file_index: line.file_index,
                        line: line.line,
                    });
                }
            }
            return LineOutcome::Advance;
        }

        if !self.struct_clone {
            self.anchor_overflow();
            if Self::label_binds_to_address(&line.payload) {
                if let Some(label) = &line.label {
                    let address = Value::Int(self.cur_logical());
                    let (name, span) = (label.name.clone(), label.span);
                    self.bind_label(&name, span, line.file_index, line.line, address);
                }
            }
        }

        // Latch the instruction start so `$$` works in operand exprs.
        if matches!(
            line.payload,
            LinePayload::Operation(_) | LinePayload::Pragma(_)
        ) {
            if let Some(index) = self.current_segment {
                self.segments[index].mark_instruction_start();
            }
        }

        let seg_before = self.current_segment;
        let len_before = seg_before.map(|ix| self.segments[ix].len()).unwrap_or(0);

        let outcome = match &line.payload {
            LinePayload::Pragma(pragma) => {
                pragmas::apply(self, line, pragma);
                LineOutcome::Advance
            }
            LinePayload::Operation(op) => {
                self.exec_operation(line, op);
                LineOutcome::Advance
            }
            LinePayload::Statement(statement) => flow::exec_statement(self, lines, ix, statement),
            LinePayload::VarAssign { name, span, expr } => {
                self.exec_var_assign(line, name, *span, expr);
                LineOutcome::Advance
            }
            LinePayload::Invocation { name, args } => invoke::invoke(self, lines, line, name, args),
            LinePayload::None => LineOutcome::Advance,
        };

        // Per-emission bookkeeping: listing item plus both source maps.
        // Block statements do not emit themselves; their bodies do.
        let line_emits = matches!(
            line.payload,
            LinePayload::Operation(_) | LinePayload::Pragma(_)
        );
        if line_emits && self.current_segment == seg_before {
            if let Some(seg_ix) = seg_before {
                let len_after = self.segments[seg_ix].len();
                if len_after > len_before {
                    let segment = &self.segments[seg_ix];
                    let address = (i64::from(segment.start_address)
                        + segment.displacement.unwrap_or(0) as i64
                        + len_before as i64) as u16;
                    self.listing.push(ListingItem {
                        address,
                        file_index: line.file_index,
                        line: line.line,
                        segment_index: seg_ix,
                        range: (len_before, len_after),
                    });
                    self.source_map.record(line.file_index, line.line, address);
                }
            }
        }

        outcome
    }

    /// EQU/VAR/ORG bind the line label themselves; macro and struct
    /// definitions use it as the definition name.
    fn label_binds_to_address(payload: &LinePayload) -> bool {
        !matches!(
            payload,
            LinePayload::Pragma(Pragma::Equ(_) | Pragma::Var(_) | Pragma::Org(_))
                | LinePayload::Statement(Statement::Macro(_) | Statement::Struct)
                | LinePayload::VarAssign { .. }
        )
    }

    fn exec_operation(&mut self, line: &SourceLine, op: &Operation) {
        let next_enabled = self.next_enabled();
        let encoded = {
            let cur_addr = self.cur_logical();
            let cur_instr = self.cur_instruction();
            let mut env = EvalEnv {
                symbols: &mut self.symbols,
                module: self.current_module,
                cur_addr,
                cur_instr,
                rng: &mut self.rng,
            };
            encode(op, next_enabled, &mut env)
        };
        match encoded {
            Encoded::Error(err) => {
                let mut diagnostic = Diagnostic::error(err.code, err.message)
                    .at(line.file_index, line.line)
                    .with_token(op.mnemonic.clone());
                if let Some(span) = err.span {
                    diagnostic = diagnostic.with_span(span);
                }
                self.diag(diagnostic);
            }
            Encoded::Parts(parts) => {
                for part in parts {
                    match part {
                        Part::Byte(byte) => {
                            self.emit_byte(byte, line);
                        }
                        Part::Imm8(expr) => self.emit_expr8(&expr, line),
                        Part::Imm16(expr) => self.emit_expr16(&expr, line, false),
                        Part::Imm16Be(expr) => self.emit_expr16(&expr, line, true),
                        Part::Rel(expr) => self.emit_rel(&expr, line),
                    }
                }
            }
        }
    }

    /// `name = expr` outside a struct invocation is a VAR binding; an
    /// existing variable is updated where it lives.
    fn exec_var_assign(&mut self, line: &SourceLine, name: &str, span: Span, expr: &Expr) {
        match self.eval(expr) {
            Ok(value) => self.assign_variable_checked(name, span, line, value),
            Err(EvalFailure::Unresolved { symbol, .. }) => {
                self.error_at(
                    line,
                    codes::VAR_NEEDS_VALUE,
                    format!("Variable value must evaluate immediately, '{symbol}' is undefined"),
                );
            }
            Err(EvalFailure::Error(err)) => {
                self.error_at(line, codes::EXPRESSION_ERROR, err.message);
            }
        }
    }

    // ---- fixup resolution -------------------------------------------------

    /// One resolution attempt for one fixup. `Ok(())` also covers fixups
    /// diagnosed as permanently failed; `Err` returns the missing symbol.
    fn try_resolve_fixup(&mut self, fixup: &Fixup) -> Result<(), String> {
        let eval_in = |asm: &mut Self, expr: &Expr| -> Result<i64, Result<(), String>> {
            let mut env = EvalEnv {
                symbols: &mut asm.symbols,
                module: fixup.module,
                cur_addr: fixup.reference,
                cur_instr: fixup.reference,
                rng: &mut asm.rng,
            };
            match eval_expr(expr, &mut env) {
                Ok(value) => match value.as_int() {
                    Some(int) => Ok(int),
                    None => {
                        asm.diag(
                            Diagnostic::error(
                                codes::STRING_NOT_ALLOWED,
                                "String value where a number is required".to_string(),
                            )
                            .at(fixup.file_index, fixup.line)
                            .with_span(fixup.span),
                        );
                        Err(Ok(()))
                    }
                },
                Err(EvalFailure::Unresolved { symbol, .. }) => Err(Err(symbol)),
                Err(EvalFailure::Error(err)) => {
                    asm.diag(
                        Diagnostic::error(codes::EXPRESSION_ERROR, err.message)
                            .at(fixup.file_index, fixup.line)
                            .with_span(fixup.span),
                    );
                    Err(Ok(()))
                }
            }
        };

        match &fixup.kind {
            FixupKind::Bit8 => {
                let value = match eval_in(self, fixup.expr.as_ref().expect("bit8 expr")) {
                    Ok(value) => value,
                    Err(done) => return done,
                };
                self.segments[fixup.segment].patch_byte(fixup.offset, value as u8);
                Ok(())
            }
            FixupKind::Bit16 => {
                let value = match eval_in(self, fixup.expr.as_ref().expect("bit16 expr")) {
                    Ok(value) => value,
                    Err(done) => return done,
                };
                self.segments[fixup.segment].patch_word(fixup.offset, value as u16);
                Ok(())
            }
            FixupKind::Jr => {
                let target = match eval_in(self, fixup.expr.as_ref().expect("jr expr")) {
                    Ok(value) => value,
                    Err(done) => return done,
                };
                match jr_displacement(target, fixup.reference + 1) {
                    Some(disp) => {
                        self.segments[fixup.segment].patch_byte(fixup.offset, disp as u8);
                    }
                    None => {
                        self.diag(
                            Diagnostic::error(
                                codes::RELATIVE_JUMP_RANGE,
                                format!(
                                    "Relative jump to {target:#06X} is out of the -128..127 range"
                                ),
                            )
                            .at(fixup.file_index, fixup.line)
                            .with_span(fixup.span),
                        );
                    }
                }
                Ok(())
            }
            FixupKind::Equ { name } => {
                let value = match eval_in(self, fixup.expr.as_ref().expect("equ expr")) {
                    Ok(value) => value,
                    Err(done) => return done,
                };
                let name = name.clone();
                let symbol = Symbol::new(
                    &name,
                    Value::Int(value),
                    SymbolKind::Label,
                    fixup.file_index,
                    fixup.line,
                );
                if self.symbols.define_in_module(fixup.module, symbol) == DefineOutcome::Duplicate {
                    self.diag(
                        Diagnostic::error(
                            codes::DUPLICATE_SYMBOL,
                            format!("Symbol '{name}' is already defined in this scope"),
                        )
                        .at(fixup.file_index, fixup.line)
                        .with_span(fixup.span),
                    );
                }
                Ok(())
            }
            FixupKind::Ent => {
                let value = match eval_in(self, fixup.expr.as_ref().expect("ent expr")) {
                    Ok(value) => value,
                    Err(done) => return done,
                };
                self.entry = Some(value as u16);
                Ok(())
            }
            FixupKind::Xent => {
                let value = match eval_in(self, fixup.expr.as_ref().expect("xent expr")) {
                    Ok(value) => value,
                    Err(done) => return done,
                };
                self.export_entry = Some(value as u16);
                Ok(())
            }
            FixupKind::Struct { overlay } => {
                // All field patches resolve together or the fixup stays.
                let mut resolved = Vec::with_capacity(overlay.len());
                for patch in overlay {
                    let value = match eval_in(self, &patch.expr) {
                        Ok(value) => value,
                        Err(done) => return done,
                    };
                    resolved.push((patch.offset, patch.size, value));
                }
                for (field_offset, size, value) in resolved {
                    let at = fixup.offset + field_offset as usize;
                    if size == 2 {
                        self.segments[fixup.segment].patch_word(at, value as u16);
                    } else {
                        self.segments[fixup.segment].patch_byte(at, value as u8);
                    }
                }
                Ok(())
            }
        }
    }

    /// Run fixed-point resolution passes over a fixup list; whatever is
    /// left could not progress.
    pub(crate) fn resolve_fixup_list(&mut self, mut fixups: Vec<Fixup>) -> Vec<(Fixup, String)> {
        loop {
            if fixups.is_empty() {
                return Vec::new();
            }
            let mut remaining = Vec::new();
            let mut progressed = false;
            for fixup in fixups {
                match self.try_resolve_fixup(&fixup) {
                    Ok(()) => progressed = true,
                    Err(missing) => remaining.push((fixup, missing)),
                }
            }
            if remaining.is_empty() {
                return Vec::new();
            }
            if !progressed {
                return remaining;
            }
            fixups = remaining.into_iter().map(|(fixup, _)| fixup).collect();
        }
    }

    /// Pop the innermost scope, resolving its fixups; the unresolved rest
    /// propagates to the enclosing scope or the module.
    pub(crate) fn pop_scope_resolving(&mut self) -> Option<LocalScope> {
        let scope = self.symbols.pop_scope(self.current_module)?;
        let fixups = scope.fixups.clone();
        let unresolved = self.resolve_fixup_list(fixups);
        for (fixup, _) in unresolved {
            self.symbols.record_fixup(self.current_module, fixup);
        }
        Some(scope)
    }

    /// Resolve a module's own fixups at its END; leftovers propagate to
    /// the parent (or stay for finalisation at the root).
    pub(crate) fn resolve_module_fixups(&mut self, module: usize) {
        let fixups = std::mem::take(&mut self.symbols.module_mut(module).fixups);
        let unresolved = self.resolve_fixup_list(fixups);
        match self.symbols.module(module).parent {
            Some(parent) => {
                for (fixup, _) in unresolved {
                    self.symbols.module_mut(parent).fixups.push(fixup);
                }
            }
            None => {
                for (fixup, _) in unresolved {
                    self.symbols.module_mut(module).fixups.push(fixup);
                }
            }
        }
    }

    fn finalize(&mut self) {
        invoke::close_struct_mode(self);
        self.anchor_overflow();

        // Scopes left open by unterminated blocks.
        while self.symbols.innermost_scope(self.current_module).is_some() {
            let _ = self.pop_scope_resolving();
        }

        // Collect every module's remaining fixups for the global pass.
        let mut all = Vec::new();
        for module in 0..self.symbols.module_count() {
            let fixups = std::mem::take(&mut self.symbols.module_mut(module).fixups);
            all.extend(fixups);
        }
        let unresolved = self.resolve_fixup_list(all);
        for (fixup, missing) in unresolved {
            self.diag(
                Diagnostic::error(
                    codes::UNRESOLVED_SYMBOL,
                    format!(
                        "Unresolved {} fixup, symbol '{missing}' is undefined",
                        fixup.kind_name()
                    ),
                )
                .at(fixup.file_index, fixup.line)
                .with_span(fixup.span)
                .with_token(missing),
            );
        }
    }

    fn into_output(mut self) -> AssemblyOutput {
        let mut symbols = Vec::new();
        for module in 0..self.symbols.module_count() {
            let prefix = self.symbols.module_path(module);
            for symbol in self.symbols.module(module).symbols() {
                let name = if prefix.is_empty() {
                    symbol.name.clone()
                } else {
                    format!("{prefix}.{}", symbol.name)
                };
                symbols.push(SymbolEntry {
                    name,
                    value: symbol.value.clone(),
                    kind: symbol.kind,
                    usage_count: symbol.usage_count,
                });
            }
        }
        symbols.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));

        let failed = self.failure;
        AssemblyOutput {
            segments: std::mem::take(&mut self.segments),
            symbols,
            listing: std::mem::take(&mut self.listing),
            source_map: std::mem::take(&mut self.source_map),
            diagnostics: std::mem::take(&mut self.diagnostics),
            entry: self.entry,
            export_entry: self.export_entry,
            trace_messages: std::mem::take(&mut self.trace_messages),
            compare_bins: std::mem::take(&mut self.compare_bins),
            failed,
        }
    }
}

/// Evaluation environment for one expression: the symbol registry plus the
/// location counters frozen at the call site.
pub(crate) struct EvalEnv<'a> {
    pub(crate) symbols: &'a mut SymbolTable,
    pub(crate) module: usize,
    pub(crate) cur_addr: i64,
    pub(crate) cur_instr: i64,
    pub(crate) rng: &'a mut Option<Rng>,
}

impl EvalContext for EvalEnv<'_> {
    fn lookup_symbol(&mut self, path: &NamePath) -> Option<Value> {
        self.symbols.lookup(self.module, path)
    }

    fn current_address(&self) -> i64 {
        self.cur_addr
    }

    fn current_instruction_address(&self) -> i64 {
        self.cur_instr
    }

    fn rnd(&mut self) -> i64 {
        let rng = self.rng.get_or_insert_with(|| {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            Rng::seeded(nanos)
        });
        (rng.next() & 0xffff) as i64
    }
}

impl ConstEval for EvalEnv<'_> {
    fn const_value(&mut self, expr: &Expr) -> Result<i64, ConstIssue> {
        match eval_expr(expr, self) {
            Ok(value) => value
                .as_int()
                .ok_or_else(|| ConstIssue::Error("String value where a number is required".to_string())),
            Err(EvalFailure::Unresolved { symbol, .. }) => Err(ConstIssue::Unresolved(symbol)),
            Err(EvalFailure::Error(err)) => Err(ConstIssue::Error(err.message)),
        }
    }
}
