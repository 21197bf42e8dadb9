// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Control-flow statements: conditional arms, the four loop forms, PROC
//! and MODULE blocks, and MACRO/STRUCT definition collection.
//!
//! Block statements share a single scan-forward-for-matching-end pass
//! that tracks the nesting of inner blocks. Bodies execute by re-running
//! line ranges; every iteration runs in a fresh local scope whose fixups
//! resolve when the scope pops.

use crate::core::expr::EvalFailure;
use crate::core::parser::{Expr, IfKind, LinePayload, NamePath, SourceLine, Statement};
use crate::core::symbol_table::{
    DefineOutcome, LocalScope, MacroBodyLine, MacroDef, StructDef, StructField, Symbol, SymbolKind,
};
use crate::core::value::Value;

use super::error::{codes, Diagnostic};
use super::{Assembler, Flow, LineOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    Loop,
    Repeat,
    While,
    For,
    Proc,
    Module,
    Macro,
    Struct,
}

fn opens(statement: &Statement) -> Option<BlockKind> {
    match statement {
        Statement::If(_) => Some(BlockKind::If),
        Statement::Loop(_) => Some(BlockKind::Loop),
        Statement::Repeat => Some(BlockKind::Repeat),
        Statement::While(_) => Some(BlockKind::While),
        Statement::For { .. } => Some(BlockKind::For),
        Statement::Proc => Some(BlockKind::Proc),
        Statement::Module(_) => Some(BlockKind::Module),
        Statement::Macro(_) => Some(BlockKind::Macro),
        Statement::Struct => Some(BlockKind::Struct),
        _ => None,
    }
}

fn closes(statement: &Statement) -> Option<BlockKind> {
    match statement {
        Statement::Endif => Some(BlockKind::If),
        Statement::EndLoop => Some(BlockKind::Loop),
        Statement::Until(_) => Some(BlockKind::Repeat),
        Statement::Wend => Some(BlockKind::While),
        Statement::Next => Some(BlockKind::For),
        Statement::Endp => Some(BlockKind::Proc),
        Statement::EndModule => Some(BlockKind::Module),
        Statement::EndMacro => Some(BlockKind::Macro),
        Statement::EndStruct => Some(BlockKind::Struct),
        _ => None,
    }
}

/// Index of the matching end line for the block opened at `start`.
fn find_block_end(lines: &[SourceLine], start: usize, kind: BlockKind) -> Option<usize> {
    let mut stack: Vec<BlockKind> = Vec::new();
    for (ix, line) in lines.iter().enumerate().skip(start + 1) {
        let LinePayload::Statement(statement) = &line.payload else {
            continue;
        };
        if let Some(opened) = opens(statement) {
            stack.push(opened);
            continue;
        }
        if let Some(closed) = closes(statement) {
            match stack.last() {
                Some(&top) if top == closed => {
                    stack.pop();
                }
                Some(_) => {
                    // Malformed nesting; let the inner block's own
                    // execution report it.
                    stack.pop();
                }
                None if closed == kind => return Some(ix),
                None => continue,
            }
        }
    }
    None
}

fn missing_end(asm: &mut Assembler, line: &SourceLine, what: &str) -> LineOutcome {
    asm.error_at(
        line,
        codes::MISSING_BLOCK_END,
        format!("{what} has no matching end statement"),
    );
    LineOutcome::Advance
}

fn orphan(asm: &mut Assembler, line: &SourceLine, what: &str) -> LineOutcome {
    asm.error_at(
        line,
        codes::ORPHAN_BLOCK_END,
        format!("'{what}' without a matching block start"),
    );
    LineOutcome::Advance
}

/// Bind the end line's label at the address following the block.
fn bind_end_label(asm: &mut Assembler, lines: &[SourceLine], end: usize) {
    if let Some(label) = &lines[end].label {
        let (name, span) = (label.name.clone(), label.span);
        let address = Value::Int(asm.cur_logical());
        asm.bind_label(&name, span, lines[end].file_index, lines[end].line, address);
    }
}

/// Immediate truthiness of a condition; strings and deferred symbols are
/// diagnosed.
fn eval_condition(asm: &mut Assembler, expr: &Expr, line: &SourceLine) -> Option<bool> {
    match asm.eval(expr) {
        Ok(value) => match value.truthy() {
            Some(truthy) => Some(truthy),
            None => {
                asm.error_at(
                    line,
                    codes::STRING_CONDITION,
                    "A condition must not be a string".to_string(),
                );
                None
            }
        },
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("Condition must be resolvable here, '{symbol}' is undefined"),
            );
            None
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            None
        }
    }
}

fn symbol_is_used(asm: &mut Assembler, path: &NamePath) -> bool {
    asm.symbols
        .usage_count(asm.current_module, path)
        .is_some_and(|count| count > 0)
}

/// Bind `$cnt` in a freshly pushed iteration scope.
fn bind_loop_counter(asm: &mut Assembler, line: &SourceLine, counter: u32) {
    let symbol = Symbol::new(
        "$cnt",
        Value::Int(i64::from(counter)),
        SymbolKind::Variable,
        line.file_index,
        line.line,
    );
    let _ = asm.symbols.define(asm.current_module, symbol);
}

pub(super) fn exec_statement(
    asm: &mut Assembler,
    lines: &[SourceLine],
    ix: usize,
    statement: &Statement,
) -> LineOutcome {
    let line = &lines[ix];
    match statement {
        Statement::If(kind) => exec_if(asm, lines, ix, kind),
        Statement::Loop(count) => exec_loop(asm, lines, ix, count),
        Statement::Repeat => exec_repeat(asm, lines, ix),
        Statement::While(cond) => exec_while(asm, lines, ix, cond),
        Statement::For {
            var,
            from,
            to,
            step,
            ..
        } => exec_for(asm, lines, ix, var, from, to, step.as_ref()),
        Statement::Proc => exec_proc(asm, lines, ix),
        Statement::Local(names) => exec_local(asm, line, names),
        Statement::Module(name) => exec_module(asm, lines, ix, name.as_deref()),
        Statement::Macro(params) => collect_macro(asm, lines, ix, params),
        Statement::Struct => collect_struct(asm, lines, ix),
        Statement::Break => {
            match asm.symbols.innermost_loop_scope_mut(asm.current_module) {
                Some(scope) => {
                    scope.break_requested = true;
                    LineOutcome::Break
                }
                None => orphan(asm, line, "BREAK"),
            }
        }
        Statement::Continue => {
            match asm.symbols.innermost_loop_scope_mut(asm.current_module) {
                Some(scope) => {
                    scope.continue_requested = true;
                    LineOutcome::Continue
                }
                None => orphan(asm, line, "CONTINUE"),
            }
        }
        Statement::Elif(_) => orphan(asm, line, "ELIF"),
        Statement::Else => orphan(asm, line, "ELSE"),
        Statement::Endif => orphan(asm, line, "ENDIF"),
        Statement::EndLoop => orphan(asm, line, "ENDL"),
        Statement::Until(_) => orphan(asm, line, "UNTIL"),
        Statement::Wend => orphan(asm, line, "WEND"),
        Statement::Next => orphan(asm, line, "NEXT"),
        Statement::Endp => orphan(asm, line, "ENDP"),
        Statement::EndModule => orphan(asm, line, "ENDMODULE"),
        Statement::EndMacro => orphan(asm, line, "ENDM"),
        Statement::EndStruct => orphan(asm, line, "ENDS"),
    }
}

// ---- IF / ELIF / ELSE / ENDIF -------------------------------------------

enum ArmCond {
    Expr(Expr),
    Used(NamePath, bool),
    Else,
}

struct IfArm {
    cond: ArmCond,
    cond_line: usize,
    start: usize,
    end: usize,
}

fn exec_if(asm: &mut Assembler, lines: &[SourceLine], ix: usize, kind: &IfKind) -> LineOutcome {
    let Some(end) = find_block_end(lines, ix, BlockKind::If) else {
        return missing_end(asm, &lines[ix], "IF");
    };

    // Collect the arm boundaries at scan time.
    let mut arms: Vec<IfArm> = Vec::new();
    let mut cond = match kind {
        IfKind::If(expr) => ArmCond::Expr(expr.clone()),
        IfKind::IfUsed(path) => ArmCond::Used(path.clone(), true),
        IfKind::IfNotUsed(path) => ArmCond::Used(path.clone(), false),
    };
    let mut cond_line = ix;
    let mut start = ix + 1;
    let mut depth = 0usize;
    let mut seen_else = false;
    for scan in ix + 1..end {
        let LinePayload::Statement(statement) = &lines[scan].payload else {
            continue;
        };
        if opens(statement).is_some() {
            depth += 1;
            continue;
        }
        if closes(statement).is_some() {
            depth = depth.saturating_sub(1);
            continue;
        }
        if depth > 0 {
            continue;
        }
        match statement {
            Statement::Elif(expr) => {
                arms.push(IfArm {
                    cond,
                    cond_line,
                    start,
                    end: scan,
                });
                if seen_else {
                    asm.error_at(
                        &lines[scan],
                        codes::SYNTAX_ERROR,
                        "ELIF after ELSE".to_string(),
                    );
                }
                cond = ArmCond::Expr(expr.clone());
                cond_line = scan;
                start = scan + 1;
            }
            Statement::Else => {
                arms.push(IfArm {
                    cond,
                    cond_line,
                    start,
                    end: scan,
                });
                if seen_else {
                    asm.error_at(
                        &lines[scan],
                        codes::SYNTAX_ERROR,
                        "Multiple ELSE arms".to_string(),
                    );
                }
                seen_else = true;
                cond = ArmCond::Else;
                cond_line = scan;
                start = scan + 1;
            }
            _ => {}
        }
    }
    arms.push(IfArm {
        cond,
        cond_line,
        start,
        end,
    });

    // Execute the first truthy arm; conditions evaluate top to bottom.
    for arm in arms {
        let taken = match &arm.cond {
            ArmCond::Expr(expr) => {
                eval_condition(asm, expr, &lines[arm.cond_line]).unwrap_or(false)
            }
            ArmCond::Used(path, want_used) => symbol_is_used(asm, path) == *want_used,
            ArmCond::Else => true,
        };
        if taken {
            let flow = asm.exec_range(lines, arm.start, arm.end);
            bind_end_label(asm, lines, end);
            return match flow {
                Flow::Normal => LineOutcome::JumpTo(end + 1),
                Flow::Break => LineOutcome::Break,
                Flow::Continue => LineOutcome::Continue,
            };
        }
    }
    bind_end_label(asm, lines, end);
    LineOutcome::JumpTo(end + 1)
}

// ---- loops --------------------------------------------------------------

/// Shared per-iteration scaffold for the four loop statements. Returns
/// `false` when the loop must stop.
fn run_iteration(
    asm: &mut Assembler,
    lines: &[SourceLine],
    body: (usize, usize),
    line: &SourceLine,
    counter: u32,
    loop_var: Option<(&str, Value)>,
) -> bool {
    asm.symbols
        .push_scope(asm.current_module, LocalScope::loop_scope(counter));
    bind_loop_counter(asm, line, counter);
    if let Some((name, value)) = loop_var {
        let symbol = Symbol::new(name, value, SymbolKind::Variable, line.file_index, line.line);
        let _ = asm.symbols.define(asm.current_module, symbol);
    }
    let flow = asm.exec_range(lines, body.0, body.1);
    let _ = asm.pop_scope_resolving();
    !matches!(flow, Flow::Break)
}

/// Loop abort once its body has contributed too many errors.
fn error_limit_hit(asm: &mut Assembler, line: &SourceLine, errors_at_entry: usize) -> bool {
    if asm.error_count() - errors_at_entry > asm.options.loop_error_limit {
        asm.error_at(
            line,
            codes::LOOP_ERROR_LIMIT,
            "Too many errors in this loop, aborting".to_string(),
        );
        return true;
    }
    false
}

fn exec_loop(asm: &mut Assembler, lines: &[SourceLine], ix: usize, count: &Expr) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::Loop) else {
        return missing_end(asm, line, "LOOP");
    };
    let Some(count) = asm.eval_int_now(count, line) else {
        return LineOutcome::JumpTo(end + 1);
    };
    if count > i64::from(asm.options.max_loop_iterations) {
        asm.error_at(
            line,
            codes::LOOP_ITERATION_LIMIT,
            format!("LOOP count {count} exceeds the iteration limit"),
        );
        return LineOutcome::JumpTo(end + 1);
    }
    let errors_at_entry = asm.error_count();
    for iteration in 1..=count.max(0) {
        let keep_going = run_iteration(asm, lines, (ix + 1, end), line, iteration as u32, None);
        if !keep_going || error_limit_hit(asm, line, errors_at_entry) {
            break;
        }
    }
    bind_end_label(asm, lines, end);
    LineOutcome::JumpTo(end + 1)
}

fn exec_repeat(asm: &mut Assembler, lines: &[SourceLine], ix: usize) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::Repeat) else {
        return missing_end(asm, line, "REPEAT");
    };
    let until_expr = match &lines[end].payload {
        LinePayload::Statement(Statement::Until(expr)) => expr.clone(),
        _ => unreachable!("scan matched UNTIL"),
    };
    let errors_at_entry = asm.error_count();
    let mut iteration: u32 = 0;
    loop {
        iteration += 1;
        if iteration > asm.options.max_loop_iterations {
            asm.error_at(
                line,
                codes::LOOP_ITERATION_LIMIT,
                "REPEAT exceeded the iteration limit".to_string(),
            );
            break;
        }
        // The condition may use `$cnt`, so it evaluates inside the
        // iteration scope, before the pop.
        asm.symbols
            .push_scope(asm.current_module, LocalScope::loop_scope(iteration));
        bind_loop_counter(asm, line, iteration);
        let flow = asm.exec_range(lines, ix + 1, end);
        let done = match flow {
            Flow::Break => true,
            _ => eval_condition(asm, &until_expr, &lines[end]).unwrap_or(true),
        };
        let _ = asm.pop_scope_resolving();
        if done || error_limit_hit(asm, line, errors_at_entry) {
            break;
        }
    }
    bind_end_label(asm, lines, end);
    LineOutcome::JumpTo(end + 1)
}

fn exec_while(asm: &mut Assembler, lines: &[SourceLine], ix: usize, cond: &Expr) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::While) else {
        return missing_end(asm, line, "WHILE");
    };
    let errors_at_entry = asm.error_count();
    let mut iteration: u32 = 0;
    loop {
        if !eval_condition(asm, cond, line).unwrap_or(false) {
            break;
        }
        iteration += 1;
        if iteration > asm.options.max_loop_iterations {
            asm.error_at(
                line,
                codes::LOOP_ITERATION_LIMIT,
                "WHILE exceeded the iteration limit".to_string(),
            );
            break;
        }
        let keep_going = run_iteration(asm, lines, (ix + 1, end), line, iteration, None);
        if !keep_going || error_limit_hit(asm, line, errors_at_entry) {
            break;
        }
    }
    bind_end_label(asm, lines, end);
    LineOutcome::JumpTo(end + 1)
}

fn exec_for(
    asm: &mut Assembler,
    lines: &[SourceLine],
    ix: usize,
    var: &str,
    from: &Expr,
    to: &Expr,
    step: Option<&Expr>,
) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::For) else {
        return missing_end(asm, line, "FOR");
    };

    let Some(from_val) = eval_for_operand(asm, from, line) else {
        return LineOutcome::JumpTo(end + 1);
    };
    let Some(to_val) = eval_for_operand(asm, to, line) else {
        return LineOutcome::JumpTo(end + 1);
    };
    let step_val = match step {
        Some(expr) => match eval_for_operand(asm, expr, line) {
            Some(value) => value,
            None => return LineOutcome::JumpTo(end + 1),
        },
        None => Value::Int(1),
    };

    // Integer semantics only when every bound is integral.
    let integral = from_val.is_integral() && to_val.is_integral() && step_val.is_integral();
    let (from_f, to_f, step_f) = (
        from_val.as_real().unwrap_or_default(),
        to_val.as_real().unwrap_or_default(),
        step_val.as_real().unwrap_or_default(),
    );
    if step_f == 0.0 {
        asm.error_at(
            line,
            codes::FOR_STEP_ZERO,
            "FOR step must not be zero".to_string(),
        );
        return LineOutcome::JumpTo(end + 1);
    }

    let errors_at_entry = asm.error_count();
    let mut value = from_f;
    let mut iteration: u32 = 0;
    while (step_f > 0.0 && value <= to_f) || (step_f < 0.0 && value >= to_f) {
        iteration += 1;
        if iteration > asm.options.max_loop_iterations {
            asm.error_at(
                line,
                codes::LOOP_ITERATION_LIMIT,
                "FOR exceeded the iteration limit".to_string(),
            );
            break;
        }
        let bound = if integral {
            Value::Int(value as i64)
        } else {
            Value::Real(value)
        };
        let keep_going = run_iteration(asm, lines, (ix + 1, end), line, iteration, Some((var, bound)));
        if !keep_going || error_limit_hit(asm, line, errors_at_entry) {
            break;
        }
        value += step_f;
    }
    bind_end_label(asm, lines, end);
    LineOutcome::JumpTo(end + 1)
}

fn eval_for_operand(asm: &mut Assembler, expr: &Expr, line: &SourceLine) -> Option<Value> {
    match asm.eval(expr) {
        Ok(value) if !value.is_string() => Some(value),
        Ok(_) => {
            asm.error_at(
                line,
                codes::STRING_NOT_ALLOWED,
                "String value where a number is required".to_string(),
            );
            None
        }
        Err(EvalFailure::Unresolved { symbol, .. }) => {
            asm.error_at(
                line,
                codes::EXPRESSION_ERROR,
                format!("FOR bound must be resolvable here, '{symbol}' is undefined"),
            );
            None
        }
        Err(EvalFailure::Error(err)) => {
            asm.error_at(line, codes::EXPRESSION_ERROR, err.message);
            None
        }
    }
}

// ---- PROC / LOCAL -------------------------------------------------------

fn exec_proc(asm: &mut Assembler, lines: &[SourceLine], ix: usize) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::Proc) else {
        return missing_end(asm, line, "PROC");
    };
    asm.symbols
        .push_scope(asm.current_module, LocalScope::proc_scope());
    let flow = asm.exec_range(lines, ix + 1, end);
    let _ = asm.pop_scope_resolving();
    bind_end_label(asm, lines, end);
    match flow {
        Flow::Normal => LineOutcome::JumpTo(end + 1),
        Flow::Break => LineOutcome::Break,
        Flow::Continue => LineOutcome::Continue,
    }
}

fn exec_local(
    asm: &mut Assembler,
    line: &SourceLine,
    names: &[(String, crate::core::tokenizer::Span)],
) -> LineOutcome {
    let has_proc_scope = asm
        .symbols
        .innermost_scope(asm.current_module)
        .is_some_and(|scope| scope.is_proc_scope);
    if !has_proc_scope {
        asm.error_at(
            line,
            codes::LOCAL_OUTSIDE_PROC,
            "LOCAL is only valid directly inside a PROC".to_string(),
        );
        return LineOutcome::Advance;
    }
    for (name, span) in names {
        if name.starts_with('`') {
            asm.diag(
                Diagnostic::error(
                    codes::LOCAL_NAME_INVALID,
                    format!("LOCAL name '{name}' must not be a temporary name"),
                )
                .at(line.file_index, line.line)
                .with_span(*span)
                .with_token(name.clone()),
            );
            continue;
        }
        let scope = asm
            .symbols
            .innermost_scope_mut(asm.current_module)
            .expect("proc scope checked above");
        if scope.books(name) {
            asm.diag(
                Diagnostic::error(
                    codes::LOCAL_NAME_INVALID,
                    format!("LOCAL name '{name}' is listed twice"),
                )
                .at(line.file_index, line.line)
                .with_span(*span)
                .with_token(name.clone()),
            );
            continue;
        }
        scope.local_bookings.push(name.clone());
    }
    LineOutcome::Advance
}

// ---- MODULE -------------------------------------------------------------

fn exec_module(
    asm: &mut Assembler,
    lines: &[SourceLine],
    ix: usize,
    name: Option<&str>,
) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::Module) else {
        return missing_end(asm, line, "MODULE");
    };

    let generated;
    let name = match name {
        Some(name) => name,
        None => {
            asm.anon_module_counter += 1;
            generated = format!("MODULE{}", asm.anon_module_counter);
            generated.as_str()
        }
    };

    let parent = asm.current_module;
    let child = asm.symbols.ensure_child(parent, name);
    asm.current_module = child;
    let flow = asm.exec_range(lines, ix + 1, end);
    // Scopes opened inside the module close with it.
    while asm.symbols.innermost_scope(child).is_some() {
        let _ = asm.pop_scope_resolving();
    }
    asm.resolve_module_fixups(child);
    asm.current_module = parent;
    bind_end_label(asm, lines, end);
    match flow {
        Flow::Normal => LineOutcome::JumpTo(end + 1),
        Flow::Break => LineOutcome::Break,
        Flow::Continue => LineOutcome::Continue,
    }
}

// ---- MACRO / STRUCT definitions -----------------------------------------

fn collect_macro(
    asm: &mut Assembler,
    lines: &[SourceLine],
    ix: usize,
    params: &[(String, crate::core::tokenizer::Span)],
) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::Macro) else {
        return missing_end(asm, line, "MACRO");
    };
    let Some(label) = &line.label else {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "A macro definition requires a name label".to_string(),
        );
        return LineOutcome::JumpTo(end + 1);
    };

    let mut names: Vec<String> = Vec::new();
    for (param, span) in params {
        if names.iter().any(|seen| seen.eq_ignore_ascii_case(param)) {
            asm.diag(
                Diagnostic::error(
                    codes::DUPLICATE_MACRO_PARAM,
                    format!("Duplicate macro parameter '{param}'"),
                )
                .at(line.file_index, line.line)
                .with_span(*span)
                .with_token(param.clone()),
            );
            continue;
        }
        names.push(param.clone());
    }

    // The body is stored as raw text so invocation can substitute
    // arguments and re-parse.
    let mut body = Vec::with_capacity(end - ix - 1);
    for body_line in &lines[ix + 1..end] {
        let text = asm
            .files
            .get(body_line.file_index)
            .and_then(|file| file.lines.get(body_line.line.saturating_sub(1) as usize))
            .cloned()
            .unwrap_or_default();
        body.push(MacroBodyLine {
            file_index: body_line.file_index,
            line: body_line.line,
            text,
        });
    }

    let def = MacroDef {
        name: label.name.clone(),
        params: names,
        body,
        end_label: lines[end].label.as_ref().map(|l| l.name.clone()),
        def_file: line.file_index,
        def_line: line.line,
    };
    if asm.symbols.define_macro(asm.current_module, def) == DefineOutcome::Duplicate {
        asm.diag(
            Diagnostic::error(
                codes::MACRO_NAME_COLLISION,
                format!("Macro name '{}' collides with an existing definition", label.name),
            )
            .at(line.file_index, line.line)
            .with_span(label.span)
            .with_token(label.name.clone()),
        );
    }
    LineOutcome::JumpTo(end + 1)
}

fn collect_struct(asm: &mut Assembler, lines: &[SourceLine], ix: usize) -> LineOutcome {
    let line = &lines[ix];
    let Some(end) = find_block_end(lines, ix, BlockKind::Struct) else {
        return missing_end(asm, line, "STRUCT");
    };
    let Some(label) = &line.label else {
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "A struct definition requires a name label".to_string(),
        );
        return LineOutcome::JumpTo(end + 1);
    };

    let mut fields: Vec<StructField> = Vec::new();
    let mut offset: u32 = 0;
    for body_line in &lines[ix + 1..end] {
        let Some(size) = struct_line_size(asm, body_line) else {
            continue;
        };
        if let Some(field_label) = &body_line.label {
            if fields
                .iter()
                .any(|field| field.name.eq_ignore_ascii_case(&field_label.name))
            {
                asm.diag(
                    Diagnostic::error(
                        codes::DUPLICATE_SYMBOL,
                        format!("Duplicate struct field '{}'", field_label.name),
                    )
                    .at(body_line.file_index, body_line.line)
                    .with_span(field_label.span)
                    .with_token(field_label.name.clone()),
                );
            } else {
                fields.push(StructField {
                    name: field_label.name.clone(),
                    offset: offset as u16,
                    size: size.min(2) as u16,
                });
            }
        }
        offset += size;
    }
    if offset > 0xFFFF {
        asm.error_at(
            line,
            codes::STRUCT_SIZE_OVERFLOW,
            format!("Struct '{}' is larger than 64K", label.name),
        );
        return LineOutcome::JumpTo(end + 1);
    }

    let def = StructDef {
        name: label.name.clone(),
        body: lines[ix + 1..end].to_vec(),
        fields,
        size: offset as u16,
        def_file: line.file_index,
        def_line: line.line,
    };
    if asm.symbols.define_struct(asm.current_module, def) == DefineOutcome::Duplicate {
        asm.diag(
            Diagnostic::error(
                codes::DUPLICATE_SYMBOL,
                format!("Struct name '{}' collides with an existing definition", label.name),
            )
            .at(line.file_index, line.line)
            .with_span(label.span)
            .with_token(label.name.clone()),
        );
    }
    LineOutcome::JumpTo(end + 1)
}

/// Byte size a struct body line contributes; `None` diagnoses an invalid
/// body line.
fn struct_line_size(asm: &mut Assembler, line: &SourceLine) -> Option<u32> {
    use crate::core::parser::Pragma;
    let LinePayload::Pragma(pragma) = &line.payload else {
        if matches!(line.payload, LinePayload::None) {
            return Some(0);
        }
        asm.error_at(
            line,
            codes::SYNTAX_ERROR,
            "Only data definition pragmas are allowed in a struct body".to_string(),
        );
        return None;
    };
    match pragma {
        Pragma::DefB(exprs) => Some(exprs.len() as u32),
        Pragma::DefW(exprs) => Some(exprs.len() as u32 * 2),
        Pragma::DefM { exprs, null, .. } => {
            let mut size = 0u32;
            for expr in exprs {
                match asm.eval(expr) {
                    Ok(Value::Str(text)) => size += text.chars().count() as u32,
                    Ok(_) => size += 1,
                    Err(_) => {
                        asm.error_at(
                            line,
                            codes::EXPRESSION_ERROR,
                            "Struct field strings must be resolvable at definition".to_string(),
                        );
                        return None;
                    }
                }
            }
            Some(size + u32::from(*null))
        }
        Pragma::DefH(expr) => match asm.eval(expr) {
            Ok(Value::Str(text)) => Some(text.chars().count() as u32 / 2),
            _ => {
                asm.error_at(
                    line,
                    codes::EXPRESSION_ERROR,
                    "Struct DEFH must be a literal hex string".to_string(),
                );
                None
            }
        },
        Pragma::DefS(exprs) => {
            let count = exprs
                .first()
                .and_then(|expr| asm.eval_int_now(expr, line))?;
            Some(count.max(0) as u32)
        }
        Pragma::FillB(exprs) => {
            let count = exprs
                .first()
                .and_then(|expr| asm.eval_int_now(expr, line))?;
            Some(count.max(0) as u32)
        }
        Pragma::FillW(exprs) => {
            let count = exprs
                .first()
                .and_then(|expr| asm.eval_int_now(expr, line))?;
            Some(count.max(0) as u32 * 2)
        }
        Pragma::DefG(pattern, _) => {
            let bits = pattern.chars().filter(|c| !c.is_whitespace()).count() as u32;
            Some(bits.div_ceil(8))
        }
        _ => {
            asm.error_at(
                line,
                codes::SYNTAX_ERROR,
                "Only data definition pragmas are allowed in a struct body".to_string(),
            );
            None
        }
    }
}
