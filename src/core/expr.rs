// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Expression evaluation over tagged values.
//!
//! Evaluation distinguishes three outcomes: a concrete [`Value`], an
//! unresolved symbol reference (the caller records a fixup and retries
//! later), and a hard error (type or arithmetic). The context trait keeps
//! the evaluator free of symbol-table and segment knowledge.

use crate::core::parser::{BinaryOp, Expr, NamePath, UnaryOp};
use crate::core::tokenizer::Span;
use crate::core::value::Value;

#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
    pub span: Option<Span>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
        }
    }

    pub fn with_span(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span: Some(span),
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Why an expression did not produce a value.
#[derive(Debug, Clone)]
pub enum EvalFailure {
    /// A referenced symbol is not (yet) defined; may resolve later.
    Unresolved { symbol: String, span: Span },
    /// Type or arithmetic error; will never resolve.
    Error(EvalError),
}

pub type EvalResult = Result<Value, EvalFailure>;

/// Evaluation context: symbol resolution, location counters and the
/// per-instance random source.
pub trait EvalContext {
    /// Resolve a symbol reference; `None` marks it unresolved-for-now.
    fn lookup_symbol(&mut self, path: &NamePath) -> Option<Value>;

    /// Logical current address (`$`).
    fn current_address(&self) -> i64;

    /// Logical address of the current instruction start (`$$`).
    fn current_instruction_address(&self) -> i64;

    fn rnd(&mut self) -> i64;
}

/// xorshift64* generator; deterministic per seed, one per assembler
/// instance.
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            state: seed | 1,
        }
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

pub fn eval_expr(expr: &Expr, ctx: &mut dyn EvalContext) -> EvalResult {
    match expr {
        Expr::Literal(value, _) => Ok(value.clone()),

        // Bytes map to chars one-to-one so that Spectrum-encoded bytes
        // survive a round trip through string operations.
        Expr::Str(lit, _) => Ok(Value::Str(
            lit.bytes.iter().map(|&b| b as char).collect(),
        )),

        Expr::Symbol(path) => match ctx.lookup_symbol(path) {
            Some(value) => Ok(value),
            None => Err(EvalFailure::Unresolved {
                symbol: path.display(),
                span: path.span,
            }),
        },

        Expr::CurAddress(_) => Ok(Value::Int(ctx.current_address())),
        Expr::CurInstruction(_) => Ok(Value::Int(ctx.current_instruction_address())),

        Expr::Unary { op, expr, span } => {
            let value = eval_expr(expr, ctx)?;
            apply_unary(*op, value, *span)
        }

        Expr::Binary { op, lhs, rhs, span } => {
            let left = eval_expr(lhs, ctx)?;
            let right = eval_expr(rhs, ctx)?;
            apply_binary(*op, left, right, *span)
        }

        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
            span,
        } => {
            let cond = eval_expr(cond, ctx)?;
            let truthy = cond.truthy().ok_or_else(|| {
                EvalFailure::Error(EvalError::with_span(
                    "Condition must not be a string",
                    *span,
                ))
            })?;
            if truthy {
                eval_expr(then_expr, ctx)
            } else {
                eval_expr(else_expr, ctx)
            }
        }

        Expr::Call { name, args, span } => eval_call(name, args, *span, ctx),

        Expr::MacroParam(name, span) => Err(EvalFailure::Error(EvalError::with_span(
            format!("Macro parameter {{{{{name}}}}} outside a macro body"),
            *span,
        ))),
    }
}

fn type_error(message: impl Into<String>, span: Span) -> EvalFailure {
    EvalFailure::Error(EvalError::with_span(message, span))
}

pub fn apply_unary(op: UnaryOp, value: Value, span: Span) -> EvalResult {
    match op {
        UnaryOp::Plus => match value {
            Value::Str(_) => Err(type_error("Unary '+' requires a numeric operand", span)),
            other => Ok(other),
        },
        UnaryOp::Minus => match value {
            Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
            Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
            Value::Real(v) => Ok(Value::Real(-v)),
            Value::Str(_) => Err(type_error("Unary '-' requires a numeric operand", span)),
        },
        UnaryOp::BitNot => match value.as_int() {
            Some(v) => Ok(Value::Int(!v)),
            None => Err(type_error("Unary '~' requires a numeric operand", span)),
        },
        UnaryOp::LogicNot => match value.truthy() {
            Some(v) => Ok(Value::Bool(!v)),
            None => Err(type_error("Unary '!' requires a numeric operand", span)),
        },
    }
}

pub fn apply_binary(op: BinaryOp, left: Value, right: Value, span: Span) -> EvalResult {
    use BinaryOp::*;

    // String concatenation is the only string arithmetic.
    if let (Add, Value::Str(l), Value::Str(r)) = (op, &left, &right) {
        return Ok(Value::Str(format!("{l}{r}")));
    }

    match op {
        Eq | Ne | Lt | Le | Gt | Ge => return compare(op, left, right, span),
        LogicAnd | LogicOr | LogicXor => {
            let l = left
                .truthy()
                .ok_or_else(|| type_error("Logical operator requires numeric operands", span))?;
            let r = right
                .truthy()
                .ok_or_else(|| type_error("Logical operator requires numeric operands", span))?;
            return Ok(Value::Bool(match op {
                LogicAnd => l && r,
                LogicOr => l || r,
                _ => l ^ r,
            }));
        }
        Shl | Shr | BitAnd | BitOr | BitXor => {
            let l = left
                .as_int()
                .ok_or_else(|| type_error("Bitwise operator requires numeric operands", span))?;
            let r = right
                .as_int()
                .ok_or_else(|| type_error("Bitwise operator requires numeric operands", span))?;
            return Ok(Value::Int(match op {
                Shl => l << (r & 0x3f),
                Shr => ((l as u64) >> (r & 0x3f)) as i64,
                BitAnd => l & r,
                BitOr => l | r,
                _ => l ^ r,
            }));
        }
        _ => {}
    }

    // Arithmetic with bool->int promotion and int/real widening.
    if left.is_string() || right.is_string() {
        return Err(type_error("Arithmetic requires numeric operands", span));
    }
    if left.is_integral() && right.is_integral() {
        let l = left.as_int().unwrap_or_default();
        let r = right.as_int().unwrap_or_default();
        let value = match op {
            Add => l.wrapping_add(r),
            Subtract => l.wrapping_sub(r),
            Multiply => l.wrapping_mul(r),
            Divide => {
                if r == 0 {
                    return Err(type_error("Division by zero", span));
                }
                l / r
            }
            Mod => {
                if r == 0 {
                    return Err(type_error("Modulo by zero", span));
                }
                l % r
            }
            _ => unreachable!("non-arithmetic op handled above"),
        };
        return Ok(Value::Int(value));
    }

    let l = left.as_real().unwrap_or_default();
    let r = right.as_real().unwrap_or_default();
    let value = match op {
        Add => l + r,
        Subtract => l - r,
        Multiply => l * r,
        Divide => {
            if r == 0.0 {
                return Err(type_error("Division by zero", span));
            }
            l / r
        }
        Mod => {
            if r == 0.0 {
                return Err(type_error("Modulo by zero", span));
            }
            l % r
        }
        _ => unreachable!("non-arithmetic op handled above"),
    };
    Ok(Value::Real(value))
}

fn compare(op: BinaryOp, left: Value, right: Value, span: Span) -> EvalResult {
    use BinaryOp::*;
    let ordering = match (&left, &right) {
        (Value::Str(l), Value::Str(r)) => l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase()),
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            return Err(type_error("Cannot compare string with number", span))
        }
        _ => {
            let l = left.as_real().unwrap_or_default();
            let r = right.as_real().unwrap_or_default();
            match l.partial_cmp(&r) {
                Some(ordering) => ordering,
                None => return Err(type_error("Comparison is undefined", span)),
            }
        }
    };
    Ok(Value::Bool(match op {
        Eq => ordering.is_eq(),
        Ne => !ordering.is_eq(),
        Lt => ordering.is_lt(),
        Le => ordering.is_le(),
        Gt => ordering.is_gt(),
        Ge => ordering.is_ge(),
        _ => unreachable!("comparison op"),
    }))
}

fn eval_call(name: &str, args: &[Expr], span: Span, ctx: &mut dyn EvalContext) -> EvalResult {
    let arity = |expected: usize| -> Result<(), EvalFailure> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(type_error(
                format!("Function '{name}' expects {expected} argument(s)"),
                span,
            ))
        }
    };
    let numeric = |value: Value| -> Result<f64, EvalFailure> {
        value
            .as_real()
            .ok_or_else(|| type_error(format!("Function '{name}' requires a numeric argument"), span))
    };

    match name.to_ascii_lowercase().as_str() {
        "abs" => {
            arity(1)?;
            match eval_expr(&args[0], ctx)? {
                Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                Value::Real(v) => Ok(Value::Real(v.abs())),
                Value::Str(_) => Err(type_error("Function 'abs' requires a numeric argument", span)),
            }
        }
        "min" | "max" => {
            arity(2)?;
            let a = eval_expr(&args[0], ctx)?;
            let b = eval_expr(&args[1], ctx)?;
            if a.is_string() || b.is_string() {
                return Err(type_error(
                    format!("Function '{name}' requires numeric arguments"),
                    span,
                ));
            }
            let pick_a = if name.eq_ignore_ascii_case("min") {
                a.as_real().unwrap_or_default() <= b.as_real().unwrap_or_default()
            } else {
                a.as_real().unwrap_or_default() >= b.as_real().unwrap_or_default()
            };
            Ok(if pick_a { a } else { b })
        }
        "sqrt" => {
            arity(1)?;
            let v = numeric(eval_expr(&args[0], ctx)?)?;
            if v < 0.0 {
                return Err(type_error("Square root of a negative value", span));
            }
            Ok(Value::Real(v.sqrt()))
        }
        "low" => {
            arity(1)?;
            let v = eval_expr(&args[0], ctx)?
                .as_int()
                .ok_or_else(|| type_error("Function 'low' requires a numeric argument", span))?;
            Ok(Value::Int(v & 0xff))
        }
        "high" => {
            arity(1)?;
            let v = eval_expr(&args[0], ctx)?
                .as_int()
                .ok_or_else(|| type_error("Function 'high' requires a numeric argument", span))?;
            Ok(Value::Int((v >> 8) & 0xff))
        }
        "int" => {
            arity(1)?;
            let v = eval_expr(&args[0], ctx)?
                .as_int()
                .ok_or_else(|| type_error("Function 'int' requires a numeric argument", span))?;
            Ok(Value::Int(v))
        }
        "frac" => {
            arity(1)?;
            let v = numeric(eval_expr(&args[0], ctx)?)?;
            Ok(Value::Real(v.fract()))
        }
        "len" => {
            arity(1)?;
            match eval_expr(&args[0], ctx)? {
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                _ => Err(type_error("Function 'len' requires a string argument", span)),
            }
        }
        "rnd" => {
            arity(0)?;
            Ok(Value::Int(ctx.rnd()))
        }
        _ => Err(type_error(format!("Unknown function '{name}'"), span)),
    }
}
