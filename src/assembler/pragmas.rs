// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Pragma processor. Each pragma is a small algorithm with defined side
//! effects on the segments, the symbol registry or the output records.

use std::path::{Path, PathBuf};

use crate::core::expr::{EvalFailure, Rng};
use crate::core::fixup::FixupKind;
use crate::core::parser::{Expr, Pragma, SourceLine};
use crate::core::segment::Segment;
use crate::core::symbol_table::SymbolKind;
use crate::core::value::Value;

use super::error::{codes, Diagnostic};
use super::listing::{CompareBinRequest, TraceMessage};
use super::{Assembler, SpectrumModel};

pub(super) fn apply(asm: &mut Assembler, line: &SourceLine, pragma: &Pragma) {
    match pragma {
        Pragma::Org(expr) => org(asm, line, expr),
        Pragma::Xorg(expr) => xorg(asm, line, expr),
        Pragma::Disp(expr) => disp(asm, line, expr),
        Pragma::Ent(expr) => entry(asm, line, expr, false),
        Pragma::Xent(expr) => entry(asm, line, expr, true),
        Pragma::Equ(expr) => equ(asm, line, expr),
        Pragma::Var(expr) => var(asm, line, expr),
        Pragma::DefB(exprs) => {
            for expr in exprs {
                asm.emit_expr8(expr, line);
            }
        }
        Pragma::DefW(exprs) => {
            for expr in exprs {
                asm.emit_expr16(expr, line, false);
            }
        }
        Pragma::DefM { exprs, bit7, null } => defm(asm, line, exprs, *bit7, *null),
        Pragma::DefH(expr) => defh(asm, line, expr),
        Pragma::DefS(exprs) => defs(asm, line, exprs),
        Pragma::FillB(exprs) => fill(asm, line, exprs, false),
        Pragma::FillW(exprs) => fill(asm, line, exprs, true),
        Pragma::Align(expr) => align(asm, line, expr.as_ref()),
        Pragma::DefG(pattern, span) => defg(asm, line, pattern, *span),
        Pragma::DefGx(expr) => defgx(asm, line, expr),
        Pragma::Skip(exprs) => skip(asm, line, exprs),
        Pragma::Trace { hex, exprs } => trace(asm, line, exprs, *hex),
        Pragma::Model(name, span) => model(asm, line, name, *span),
        Pragma::RndSeed(expr) => rndseed(asm, line, expr.as_ref()),
        Pragma::Error(expr) => user_error(asm, line, expr),
        Pragma::IncludeBin(exprs) => include_bin(asm, line, exprs),
        Pragma::CompareBin(expr) => compare_bin(asm, line, expr),
    }
}

// ---- location pragmas ---------------------------------------------------

fn org(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let Some(value) = asm.eval_int_now(expr, line) else {
        return;
    };
    let address = value as u16;

    match asm.current_segment {
        Some(index) if asm.segments[index].is_empty() => {
            asm.segments[index].start_address = address;
        }
        Some(_) => {
            // Bytes are out already: a new ORG starts a new segment.
            let index = asm.segments.len();
            asm.segments.push(Segment::new(address));
            asm.current_segment = Some(index);
        }
        None => {
            let index = asm.segments.len();
            asm.segments.push(Segment::new(address));
            asm.current_segment = Some(index);
        }
    }

    if let Some(label) = &line.label {
        let (name, span) = (label.name.clone(), label.span);
        asm.bind_label(
            &name,
            span,
            line.file_index,
            line.line,
            Value::Int(i64::from(address)),
        );
    }
}

fn xorg(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let Some(value) = asm.eval_int_now(expr, line) else {
        return;
    };
    let index = asm.ensure_segment();
    if !asm.segments[index].is_empty() {
        asm.error_at(
            line,
            codes::XORG_AFTER_EMIT,
            "XORG must be set before any bytes are emitted into the segment".to_string(),
        );
        return;
    }
    asm.segments[index].xorg = Some(value as u16);
}

fn disp(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let Some(value) = asm.eval_int_now(expr, line) else {
        return;
    };
    let index = asm.ensure_segment();
    asm.segments[index].displacement = Some(value as i32);
}

fn entry(asm: &mut Assembler, line: &SourceLine, expr: &Expr, exported: bool) {
    match asm.eval(expr) {
        Ok(value) => match value.as_word() {
            Some(word) => {
                if exported {
                    asm.export_entry = Some(word);
                } else {
                    asm.entry = Some(word);
                }
            }
            None => asm.error_at(
                line,
                codes::STRING_NOT_ALLOWED,
                "String value where a number is required".to_string(),
            ),
        },
        Err(EvalFailure::Unresolved { .. }) => {
            let kind = if exported {
                FixupKind::Xent
            } else {
                FixupKind::Ent
            };
            asm.record_pointer_fixup(kind, expr, line);
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
        }
    }
}

// ---- symbol pragmas -----------------------------------------------------

fn equ(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let Some(label) = &line.label else {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "EQU requires a label".to_string(),
        );
        return;
    };
    let (name, span) = (label.name.clone(), label.span);
    match asm.eval(expr) {
        Ok(value) => {
            asm.define_symbol_checked(&name, span, line, value, SymbolKind::Label);
        }
        Err(EvalFailure::Unresolved { .. }) => {
            asm.record_pointer_fixup(FixupKind::Equ { name }, expr, line);
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
        }
    }
}

fn var(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let Some(label) = &line.label else {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "VAR requires a label".to_string(),
        );
        return;
    };
    let (name, span) = (label.name.clone(), label.span);
    match asm.eval(expr) {
        Ok(value) => {
            asm.assign_variable_checked(&name, span, line, value);
        }
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::VAR_NEEDS_VALUE,
                format!("Variable value must evaluate immediately, '{symbol}' is undefined"),
            );
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
        }
    }
}

// ---- data pragmas -------------------------------------------------------

/// Spectrum bytes of an evaluated string value; chars map one-to-one.
pub(super) fn string_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

fn defm(asm: &mut Assembler, line: &SourceLine, exprs: &[Expr], bit7: bool, null: bool) {
    let mut emitted = 0usize;
    for expr in exprs {
        match asm.eval(expr) {
            Ok(Value::Str(text)) => {
                for byte in string_bytes(&text) {
                    if asm.emit_byte(byte, line) {
                        emitted += 1;
                    }
                }
            }
            Ok(other) => match other.as_int() {
                Some(int) => {
                    if asm.emit_byte(int as u8, line) {
                        emitted += 1;
                    }
                }
                None => asm.error_at(
                    line,
                    codes::EXPRESSION_ERROR,
                    "DEFM operand must be a string or a byte value".to_string(),
                ),
            },
            Err(EvalFailure::Unresolved { symbol, .. }) => {
                asm.error_at(
                    line,
                    codes::EXPRESSION_ERROR,
                    format!("DEFM operand must be resolvable here, '{symbol}' is undefined"),
                );
            }
            Err(EvalFailure::Error(err)) => {
                asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            }
        }
    }
    if bit7 && emitted > 0 {
        if let Some(index) = asm.current_segment {
            let segment = &mut asm.segments[index];
            if let Some(last) = segment.emitted.last_mut() {
                *last |= 0x80;
            }
        }
    }
    if null {
        asm.emit_byte(0, line);
    }
}

fn defh(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let text = match asm.eval(expr) {
        Ok(Value::Str(text)) => text,
        Ok(_) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                "DEFH requires a string of hex digit pairs".to_string(),
            );
            return;
        }
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("DEFH operand must be resolvable here, '{symbol}' is undefined"),
            );
            return;
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            return;
        }
    };
    if text.len() % 2 != 0 {
        asm.error_at(
            line,
            codes::DEFH_ODD_LENGTH,
            "DEFH string must have an even number of hex digits".to_string(),
        );
        return;
    }
    let chars: Vec<char> = text.chars().collect();
    for pair in chars.chunks(2) {
        let (hi, lo) = (pair[0], pair[1]);
        match (hi.to_digit(16), lo.to_digit(16)) {
            (Some(hi), Some(lo)) => {
                asm.emit_byte(((hi << 4) | lo) as u8, line);
            }
            _ => {
                asm.error_at(
                    line,
                    codes::DEFH_ODD_LENGTH,
                    format!("DEFH string contains a non-hex pair '{hi}{lo}'"),
                );
                return;
            }
        }
    }
}

fn defs(asm: &mut Assembler, line: &SourceLine, exprs: &[Expr]) {
    if exprs.is_empty() || exprs.len() > 2 {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "DEFS expects a count and an optional fill byte".to_string(),
        );
        return;
    }
    let Some(count) = asm.eval_int_now(&exprs[0], line) else {
        return;
    };
    let fill = match exprs.get(1) {
        Some(expr) => match asm.eval_int_now(expr, line) {
            Some(value) => value as u8,
            None => return,
        },
        None => 0,
    };
    for _ in 0..count.max(0) {
        if !asm.emit_byte(fill, line) {
            return;
        }
    }
}

fn fill(asm: &mut Assembler, line: &SourceLine, exprs: &[Expr], word: bool) {
    if exprs.len() != 2 {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "FILL expects a count and a value".to_string(),
        );
        return;
    }
    let Some(count) = asm.eval_int_now(&exprs[0], line) else {
        return;
    };
    let Some(value) = asm.eval_int_now(&exprs[1], line) else {
        return;
    };
    for _ in 0..count.max(0) {
        let ok = if word {
            asm.emit_word(value as u16, line)
        } else {
            asm.emit_byte(value as u8, line)
        };
        if !ok {
            return;
        }
    }
}

fn align(asm: &mut Assembler, line: &SourceLine, expr: Option<&Expr>) {
    let alignment = match expr {
        Some(expr) => match asm.eval_int_now(expr, line) {
            Some(value) => value,
            None => return,
        },
        None => 0x100,
    };
    if !(1..=0x4000).contains(&alignment) {
        asm.error_at(
            line,
            codes::ALIGN_RANGE,
            format!("ALIGN value {alignment} out of range (1-16384)"),
        );
        return;
    }
    while asm.cur_logical() % alignment != 0 {
        if !asm.emit_byte(0, line) {
            return;
        }
    }
}

/// Convert an ASCII pixel pattern into bytes. `.`, `_`, `-` and space are
/// clear pixels, anything else is set.
fn pattern_bits(pattern: &str) -> Vec<bool> {
    pattern
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| !matches!(c, '.' | '_' | '-'))
        .collect()
}

fn emit_pattern(asm: &mut Assembler, line: &SourceLine, bits: &[bool], right_aligned: bool) {
    if bits.is_empty() {
        asm.error_at(
            line,
            codes::DEFG_EMPTY,
            "DEFG requires a pixel pattern".to_string(),
        );
        return;
    }
    let padding = (8 - bits.len() % 8) % 8;
    let mut padded = Vec::with_capacity(bits.len() + padding);
    if right_aligned {
        padded.extend(std::iter::repeat(false).take(padding));
        padded.extend_from_slice(bits);
    } else {
        padded.extend_from_slice(bits);
        padded.extend(std::iter::repeat(false).take(padding));
    }
    for chunk in padded.chunks(8) {
        let mut byte = 0u8;
        for (ix, bit) in chunk.iter().enumerate() {
            if *bit {
                byte |= 0x80 >> ix;
            }
        }
        if !asm.emit_byte(byte, line) {
            return;
        }
    }
}

fn defg(asm: &mut Assembler, line: &SourceLine, pattern: &str, _span: crate::core::tokenizer::Span) {
    emit_pattern(asm, line, &pattern_bits(pattern), false);
}

fn defgx(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let text = match asm.eval(expr) {
        Ok(Value::Str(text)) => text,
        Ok(_) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                "DEFGX requires a string pattern".to_string(),
            );
            return;
        }
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("DEFGX operand must be resolvable here, '{symbol}' is undefined"),
            );
            return;
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            return;
        }
    };
    let trimmed = text.trim_start();
    let (right_aligned, pattern) = match trimmed.chars().next() {
        Some('>') => (true, &trimmed[1..]),
        Some('<') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    emit_pattern(asm, line, &pattern_bits(pattern), right_aligned);
}

fn skip(asm: &mut Assembler, line: &SourceLine, exprs: &[Expr]) {
    if exprs.is_empty() || exprs.len() > 2 {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "SKIP expects a target address and an optional fill byte".to_string(),
        );
        return;
    }
    let Some(target) = asm.eval_int_now(&exprs[0], line) else {
        return;
    };
    let fill = match exprs.get(1) {
        Some(expr) => match asm.eval_int_now(expr, line) {
            Some(value) => value as u8,
            None => return,
        },
        None => 0xFF,
    };
    let current = asm.cur_logical();
    if target < current {
        asm.error_at(
            line,
            codes::SKIP_BELOW_CURRENT,
            format!("SKIP target {target:#06X} is below the current address {current:#06X}"),
        );
        return;
    }
    while asm.cur_logical() < target {
        if !asm.emit_byte(fill, line) {
            return;
        }
    }
}

// ---- host-facing pragmas ------------------------------------------------

fn trace(asm: &mut Assembler, line: &SourceLine, exprs: &[Expr], hex: bool) {
    let mut parts = Vec::new();
    for expr in exprs {
        match asm.eval(expr) {
            Ok(value) => parts.push(format_trace_value(&value, hex)),
            Err(EvalFailure::Unresolved { symbol, .. }) => {
                asm.error_at(
                    line,
                    codes::EXPRESSION_ERROR,
                    format!("TRACE operand must be resolvable here, '{symbol}' is undefined"),
                );
                return;
            }
            Err(EvalFailure::Error(err)) => {
                asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
                return;
            }
        }
    }
    asm.trace_messages.push(TraceMessage {
        text: parts.join(""),
        file_index: line.file_index,
        line: line.line,
    });
}

fn format_trace_value(value: &Value, hex: bool) -> String {
    if !hex {
        return value.to_string();
    }
    match value {
        Value::Str(text) => string_bytes(text)
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect(),
        other => match other.as_int() {
            Some(int) => format!("{:04X}", int as u16),
            None => other.to_string(),
        },
    }
}

fn model(asm: &mut Assembler, line: &SourceLine, name: &str, span: crate::core::tokenizer::Span) {
    if asm.model_pragma_seen {
        asm.diag(
            Diagnostic::error(
                codes::MODEL_ALREADY_SET,
                "MODEL may only appear once".to_string(),
            )
            .at(line.file_index, line.line)
            .with_span(span)
            .with_token(name),
        );
        return;
    }
    match SpectrumModel::parse(name) {
        Some(model) => {
            asm.model = Some(model);
            asm.model_pragma_seen = true;
        }
        None => {
            asm.diag(
                Diagnostic::error(
                    codes::SYNTAX_ERROR,
                    format!("Unknown model '{name}', expected SPECTRUM48, SPECTRUM128, SPECTRUMP3 or NEXT"),
                )
                .at(line.file_index, line.line)
                .with_span(span)
                .with_token(name),
            );
        }
    }
}

fn rndseed(asm: &mut Assembler, line: &SourceLine, expr: Option<&Expr>) {
    match expr {
        Some(expr) => {
            if let Some(seed) = asm.eval_int_now(expr, line) {
                asm.rng = Some(Rng::seeded(seed as u64));
            }
        }
        // Cleared: the next rnd() reseeds from the wall clock.
        None => asm.rng = None,
    }
}

fn user_error(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let message = match asm.eval(expr) {
        Ok(value) => value.to_string(),
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            format!("<unresolved: {symbol}>")
        }
        Err(EvalFailure::Error(err)) => err.message,
    };
    asm.error_at(line, codes::USER_ERROR, message);
}

fn include_bin(asm: &mut Assembler, line: &SourceLine, exprs: &[Expr]) {
    if exprs.is_empty() || exprs.len() > 3 {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "INCLUDEBIN expects a path with optional offset and length".to_string(),
        );
        return;
    }
    let path = match asm.eval(&exprs[0]) {
        Ok(Value::Str(path)) => path,
        Ok(_) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                "INCLUDEBIN path must be a string".to_string(),
            );
            return;
        }
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("INCLUDEBIN path must be resolvable here, '{symbol}' is undefined"),
            );
            return;
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            return;
        }
    };

    let resolved = resolve_relative(asm, line.file_index, &path);
    let data = match std::fs::read(&resolved) {
        Ok(data) => data,
        Err(err) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("Cannot read '{}': {err}", resolved.display()),
            );
            return;
        }
    };

    let offset = match exprs.get(1) {
        Some(expr) => match asm.eval_int_now(expr, line) {
            Some(value) => value,
            None => return,
        },
        None => 0,
    };
    if offset < 0 || offset as usize > data.len() {
        asm.error_at(
            line,
            codes::INCLUDE_BIN_OFFSET,
            format!("INCLUDEBIN offset {offset} out of range (file is {} bytes)", data.len()),
        );
        return;
    }
    let length = match exprs.get(2) {
        Some(expr) => match asm.eval_int_now(expr, line) {
            Some(value) => value,
            None => return,
        },
        None => data.len() as i64 - offset,
    };
    if length < 0 || (offset + length) as usize > data.len() {
        asm.error_at(
            line,
            codes::INCLUDE_BIN_LENGTH,
            format!("INCLUDEBIN length {length} out of range (file is {} bytes)", data.len()),
        );
        return;
    }

    for &byte in &data[offset as usize..(offset + length) as usize] {
        if !asm.emit_byte(byte, line) {
            return;
        }
    }
}

fn compare_bin(asm: &mut Assembler, line: &SourceLine, expr: &Expr) {
    let path = match asm.eval(expr) {
        Ok(Value::Str(path)) => path,
        Ok(_) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                "COMPAREBIN path must be a string".to_string(),
            );
            return;
        }
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("COMPAREBIN path must be resolvable here, '{symbol}' is undefined"),
            );
            return;
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            return;
        }
    };
    let segment_index = asm.ensure_segment();
    let offset = asm.segments[segment_index].len();
    let resolved = resolve_relative(asm, line.file_index, &path);
    asm.compare_bins.push(CompareBinRequest {
        path: resolved.to_string_lossy().to_string(),
        segment_index,
        offset,
        file_index: line.file_index,
        line: line.line,
    });
}

/// Resolve a path relative to the directory of the including source file.
fn resolve_relative(asm: &Assembler, file_index: usize, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let base = asm
        .files
        .get(file_index)
        .map(|file| Path::new(&file.name))
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new(""));
    base.join(candidate)
}

#[cfg(test)]
mod tests {
    use super::{pattern_bits, string_bytes};

    #[test]
    fn pattern_bits_classify_pixels() {
        let bits = pattern_bits("..XX");
        assert_eq!(bits, vec![false, false, true, true]);
        let bits = pattern_bits("_-O ");
        assert_eq!(bits, vec![false, false, true]);
    }

    #[test]
    fn string_bytes_round_trip_high_bytes() {
        let text: String = [0x7Fu8, 0xFF, b'A'].iter().map(|&b| b as char).collect();
        assert_eq!(string_bytes(&text), vec![0x7F, 0xFF, b'A']);
    }
}
