// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Macro and struct invocation.
//!
//! Macro invocation substitutes `{{name}}` references in the body's
//! source text with the argument text, re-parses the result and replays
//! the produced lines in a nested scope. Struct invocation replays the
//! struct body to emit its default byte pattern, then collects
//! field-assignment overrides until the first non-assignment line closes
//! the invocation with a `Struct` fixup.

use crate::core::fixup::{FieldPatch, Fixup, FixupKind};
use crate::core::parser::{parse_line, Expr, InvokeArg, NamePath, SourceLine};
use crate::core::symbol_table::{LocalScope, MacroDef, StructDef, StructField};
use crate::core::tokenizer::Span;
use crate::core::value::Value;

use super::error::codes;
use super::{Assembler, Flow, LineOutcome};

/// State of an open struct invocation.
pub(crate) struct StructMode {
    fields: Vec<StructField>,
    segment: usize,
    offset: usize,
    reference: i64,
    overlay: Vec<FieldPatch>,
    file_index: usize,
    line: u32,
    span: Span,
}

pub(super) fn invoke(
    asm: &mut Assembler,
    _lines: &[SourceLine],
    line: &SourceLine,
    name: &NamePath,
    args: &[InvokeArg],
) -> LineOutcome {
    if let Some((_, def)) = asm.symbols.find_struct(asm.current_module, name) {
        let def = def.clone();
        if !args.is_empty() {
            asm.error_at(
                line,
                codes::SYNTAX_ERROR,
                format!("Struct invocation '{}' takes no arguments", name.display()),
            );
        }
        struct_invoke(asm, line, name.span, &def);
        return LineOutcome::Advance;
    }
    if let Some((_, def)) = asm.symbols.find_macro(asm.current_module, name) {
        let def = def.clone();
        return macro_invoke(asm, line, &def, args);
    }
    asm.error_at(
        line,
        codes::UNKNOWN_MACRO,
        format!("Unknown macro or struct '{}'", name.display()),
    );
    LineOutcome::Advance
}

// ---- struct invocation --------------------------------------------------

fn struct_invoke(asm: &mut Assembler, line: &SourceLine, span: Span, def: &StructDef) {
    let segment = asm.ensure_segment();
    if asm.segments[segment].overflows(usize::from(def.size)) {
        asm.error_at(
            line,
            codes::STRUCT_SIZE_OVERFLOW,
            format!(
                "Struct '{}' ({} bytes) does not fit the emission window",
                def.name, def.size
            ),
        );
        return;
    }
    let offset = asm.segments[segment].len();
    let reference = asm.cur_logical();

    // Clone mode: replay the body for the default pattern; field labels
    // are not bound as symbols.
    asm.struct_clone = true;
    let _ = asm.exec_range(&def.body, 0, def.body.len());
    asm.struct_clone = false;

    asm.struct_mode = Some(StructMode {
        fields: def.fields.clone(),
        segment,
        offset,
        reference,
        overlay: Vec::new(),
        file_index: line.file_index,
        line: line.line,
        span,
    });
}

/// A `field = expr` line inside an open struct invocation.
pub(super) fn struct_field_assign(
    asm: &mut Assembler,
    line: &SourceLine,
    name: &str,
    span: Span,
    expr: &Expr,
) {
    let field = asm
        .struct_mode
        .as_ref()
        .and_then(|mode| {
            mode.fields
                .iter()
                .find(|field| field.name.eq_ignore_ascii_case(name))
        })
        .map(|field| (field.offset, field.size));
    match field {
        Some((offset, size)) => {
            let patch = FieldPatch {
                offset,
                size: size.clamp(1, 2),
                expr: expr.clone(),
            };
            if let Some(mode) = asm.struct_mode.as_mut() {
                mode.overlay.push(patch);
            }
        }
        None => {
            asm.diag(
                super::error::Diagnostic::error(
                    codes::STRUCT_FIELD_UNKNOWN,
                    format!("Struct has no field named '{name}'"),
                )
                .at(line.file_index, line.line)
                .with_span(span)
                .with_token(name),
            );
        }
    }
}

/// Close an open struct invocation, installing its overlay as a `Struct`
/// fixup.
pub(super) fn close_struct_mode(asm: &mut Assembler) {
    let Some(mode) = asm.struct_mode.take() else {
        return;
    };
    if mode.overlay.is_empty() {
        return;
    }
    let fixup = Fixup {
        kind: FixupKind::Struct {
            overlay: mode.overlay,
        },
        segment: mode.segment,
        offset: mode.offset,
        reference: mode.reference,
        expr: None,
        module: asm.current_module,
        file_index: mode.file_index,
        line: mode.line,
        span: mode.span,
    };
    asm.symbols.record_fixup(asm.current_module, fixup);
}

// ---- macro invocation ---------------------------------------------------

fn macro_invoke(
    asm: &mut Assembler,
    line: &SourceLine,
    def: &MacroDef,
    args: &[InvokeArg],
) -> LineOutcome {
    if args.len() != def.params.len() {
        asm.error_at(
            line,
            codes::MACRO_ARG_COUNT,
            format!(
                "Macro '{}' expects {} argument(s), got {}",
                def.name,
                def.params.len(),
                args.len()
            ),
        );
        return LineOutcome::Advance;
    }
    if asm.macro_depth >= asm.options.max_macro_depth {
        asm.error_at(
            line,
            codes::MACRO_DEPTH,
            format!("Macro expansion exceeded the depth limit of {}", asm.options.max_macro_depth),
        );
        return LineOutcome::Advance;
    }

    // Substitute into the raw body text and re-parse; the expanded lines
    // keep the body's source coordinates so diagnostics point at real
    // source.
    let expanded: Vec<SourceLine> = def
        .body
        .iter()
        .map(|body_line| {
            let text = substitute_params(&body_line.text, &def.params, args);
            parse_line(&text, body_line.file_index, body_line.line)
        })
        .collect();

    asm.macro_depth += 1;
    asm.symbols
        .push_scope(asm.current_module, LocalScope::macro_scope());
    let flow = asm.exec_range(&expanded, 0, expanded.len());
    let _ = asm.pop_scope_resolving();
    asm.macro_depth -= 1;

    // The label on the macro's ENDM binds after the expansion.
    if let Some(end_label) = &def.end_label {
        let address = Value::Int(asm.cur_logical());
        let (name, file, line_no) = (end_label.clone(), line.file_index, line.line);
        asm.bind_label(&name, Span::default(), file, line_no, address);
    }

    match flow {
        Flow::Normal => LineOutcome::Advance,
        Flow::Break => LineOutcome::Break,
        Flow::Continue => LineOutcome::Continue,
    }
}

/// Replace every `{{name}}` occurrence with the matching argument's
/// source text. Unknown names stay in place and are diagnosed when the
/// re-parsed line executes.
fn substitute_params(text: &str, params: &[String], args: &[InvokeArg]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        if let Some(close_rel) = rest[open + 2..].find("}}") {
            let name = rest[open + 2..open + 2 + close_rel].trim();
            if let Some(pos) = params
                .iter()
                .position(|param| param.eq_ignore_ascii_case(name))
            {
                out.push_str(&rest[..open]);
                out.push_str(&args[pos].text);
                rest = &rest[open + 2 + close_rel + 2..];
                continue;
            }
        }
        out.push_str(&rest[..open + 2]);
        rest = &rest[open + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::substitute_params;
    use crate::core::parser::InvokeArg;
    use crate::core::tokenizer::Span;

    fn arg(text: &str) -> InvokeArg {
        InvokeArg {
            text: text.to_string(),
            span: Span::default(),
        }
    }

    #[test]
    fn substitutes_all_occurrences() {
        let params = vec!["reg".to_string(), "val".to_string()];
        let args = vec![arg("hl"), arg("5+2")];
        assert_eq!(
            substitute_params("ld {{reg}},{{val}} ; {{reg}}", &params, &args),
            "ld hl,5+2 ; hl"
        );
    }

    #[test]
    fn parameter_names_match_case_insensitively() {
        let params = vec!["Count".to_string()];
        let args = vec![arg("3")];
        assert_eq!(substitute_params("defb {{count}}", &params, &args), "defb 3");
    }

    #[test]
    fn unknown_names_are_preserved() {
        let params = vec!["a".to_string()];
        let args = vec![arg("1")];
        assert_eq!(
            substitute_params("defb {{a}},{{nope}}", &params, &args),
            "defb 1,{{nope}}"
        );
    }

    #[test]
    fn text_without_params_is_untouched() {
        assert_eq!(substitute_params("ld a,b", &[], &[]), "ld a,b");
    }
}
