// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Diagnostics: stable codes, severity, source locations and context
//! rendering.

use std::fmt;

use crate::core::tokenizer::Span;

/// Stable diagnostic codes. The numbering is part of the tool's contract;
/// hosts match on these strings.
pub mod codes {
    pub const INVALID_OPERANDS: &str = "Z0001";
    pub const BIT_INDEX_RANGE: &str = "Z0002";
    pub const REG_INDIRECT_HL_ONLY: &str = "Z0004";
    pub const UNKNOWN_MNEMONIC: &str = "Z0010";
    pub const RELATIVE_JUMP_RANGE: &str = "Z0022";
    pub const DUPLICATE_SYMBOL: &str = "Z0040";
    pub const SKIP_BELOW_CURRENT: &str = "Z0081";
    pub const MODEL_ALREADY_SET: &str = "Z0088";
    pub const SYNTAX_ERROR: &str = "Z0100";
    pub const NEXT_ONLY: &str = "Z0102";
    pub const EXPRESSION_ERROR: &str = "Z0201";
    pub const UNRESOLVED_SYMBOL: &str = "Z0202";
    pub const STRING_NOT_ALLOWED: &str = "Z0305";
    pub const ALIGN_RANGE: &str = "Z0301";
    pub const DEFH_ODD_LENGTH: &str = "Z0302";
    pub const MACRO_NAME_COLLISION: &str = "Z0402";
    pub const UNKNOWN_MACRO: &str = "Z0403";
    pub const MACRO_ARG_COUNT: &str = "Z0404";
    pub const MACRO_PARAM_OUTSIDE: &str = "Z0405";
    pub const LOCAL_OUTSIDE_PROC: &str = "Z0406";
    pub const LOCAL_NAME_INVALID: &str = "Z0407";
    pub const LOOP_ERROR_LIMIT: &str = "Z0408";
    pub const LOOP_ITERATION_LIMIT: &str = "Z0409";
    pub const ORPHAN_BLOCK_END: &str = "Z0410";
    pub const MISSING_BLOCK_END: &str = "Z0411";
    pub const FOR_STEP_ZERO: &str = "Z0412";
    pub const STRING_CONDITION: &str = "Z0413";
    pub const DUPLICATE_MACRO_PARAM: &str = "Z0417";
    pub const INCLUDE_BIN_OFFSET: &str = "Z0424";
    pub const INCLUDE_BIN_LENGTH: &str = "Z0425";
    pub const XORG_AFTER_EMIT: &str = "Z0431";
    pub const STRUCT_FIELD_UNKNOWN: &str = "Z0441";
    pub const STRUCT_SIZE_OVERFLOW: &str = "Z0442";
    pub const DEFG_EMPTY: &str = "Z0443";
    pub const EMISSION_OVERFLOW: &str = "Z0444";
    pub const VAR_NEEDS_VALUE: &str = "Z0445";
    pub const MACRO_DEPTH: &str = "Z0447";
    pub const USER_ERROR: &str = "Z0500";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A diagnostic with location and offending-token context.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    pub file_index: usize,
    /// 1-based source line.
    pub line: u32,
    /// 0-based column.
    pub column: usize,
    pub token: String,
}

impl Diagnostic {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            file_index: 0,
            line: 0,
            column: 0,
            token: String::new(),
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    pub fn at(mut self, file_index: usize, line: u32) -> Self {
        self.file_index = file_index;
        self.line = line;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        if self.line == 0 {
            self.line = span.line;
        }
        self.column = span.col_start.saturating_sub(1);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn format(&self) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        format!("{}: {sev} {}: {}", self.line, self.code, self.message)
    }

    /// Render with the offending source line and a caret column marker.
    pub fn format_with_context(
        &self,
        file_name: Option<&str>,
        source_lines: Option<&[String]>,
        use_color: bool,
    ) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        let header = match file_name {
            Some(name) => format!("{name}:{}: {sev} {}", self.line, self.code),
            None => format!("{}: {sev} {}", self.line, self.code),
        };

        let mut out = String::new();
        out.push_str(&header);
        out.push('\n');
        for context in build_context_lines(self.line, self.column, source_lines, use_color) {
            out.push_str(&context);
            out.push('\n');
        }
        out.push_str(&format!("{sev}: {}", self.message));
        if !self.token.is_empty() {
            out.push_str(&format!(" ('{}')", self.token));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// Build the `NNNNN | source` context block with a caret line.
pub fn build_context_lines(
    line_num: u32,
    column: usize,
    lines: Option<&[String]>,
    use_color: bool,
) -> Vec<String> {
    let mut out = Vec::new();
    let line_idx = line_num.saturating_sub(1) as usize;

    let lines = match lines {
        Some(lines) if line_idx < lines.len() => lines,
        _ => {
            out.push(format!("{line_num:>5} | <source unavailable>"));
            return out;
        }
    };

    let line = &lines[line_idx];
    out.push(format!("{line_num:>5} | {line}"));

    let mut caret = String::new();
    caret.push_str(&" ".repeat(8 + column.min(line.len())));
    if use_color {
        caret.push_str("\x1b[31m^\x1b[0m");
    } else {
        caret.push('^');
    }
    out.push(caret);
    out
}

/// Overall counts for a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassCounts {
    pub lines: u32,
    pub errors: u32,
    pub warnings: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_code_and_severity() {
        let diag = Diagnostic::error(codes::DUPLICATE_SYMBOL, "Duplicate symbol").at(0, 12);
        assert_eq!(diag.format(), "12: ERROR Z0040: Duplicate symbol");
    }

    #[test]
    fn context_renders_caret_at_column() {
        let lines = vec!["  ld a,b".to_string()];
        let out = build_context_lines(1, 5, Some(&lines), false);
        assert_eq!(out[0], "    1 |   ld a,b");
        assert!(out[1].ends_with('^'));
        assert_eq!(out[1].len(), 8 + 5 + 1);
    }

    #[test]
    fn context_survives_missing_source() {
        let out = build_context_lines(9, 0, None, false);
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("<source unavailable>"));
    }
}
