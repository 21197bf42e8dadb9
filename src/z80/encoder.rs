// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Rule-matched Z80 instruction encoder.
//!
//! Every mnemonic handler validates the operand shape first and then
//! builds the emission plan: prefix bytes, opcode, immediates. An operand
//! shape no rule accepts yields a single diagnostic naming the mnemonic.

use crate::assembler::error::codes;
use crate::core::parser::{Expr, Operand, Operation, UnaryOp};
use crate::core::text_utils::to_upper;
use crate::core::value::Value;

use super::table::{
    alu_index, condition_index, index_prefix, jr_opcode, lookup_trivial, reg16_af_index,
    reg16_index, reg8_half, reg8_index, shift_index,
};
use super::{ConstEval, ConstIssue, EncodeError, Encoded, Part};

/// Normalized operand view the handlers match on.
enum Opd {
    R8(u8),
    R8Half { prefix: u8, index: u8 },
    /// I, R and the F pseudo-register of `IN F,(C)`.
    R8Spec(char),
    /// BC, DE, HL, SP, AF, AF', IX, IY by upper-case name.
    R16(String),
    /// (BC), (DE), (HL), (SP).
    RInd(String),
    Idx { prefix: u8, offset: Expr },
    Mem(Expr),
    CPort,
    Cond(String),
    Imm(Expr),
}

fn classify(operand: &Operand) -> Opd {
    match operand {
        Operand::Reg(name, _) => {
            if let Some(index) = reg8_index(name) {
                return Opd::R8(index);
            }
            if let Some((prefix, index)) = reg8_half(name) {
                return Opd::R8Half { prefix, index };
            }
            let upper = to_upper(name);
            match upper.as_str() {
                "I" => Opd::R8Spec('I'),
                "R" => Opd::R8Spec('R'),
                "F" => Opd::R8Spec('F'),
                _ => Opd::R16(upper),
            }
        }
        Operand::Condition(name, _) => Opd::Cond(to_upper(name)),
        Operand::RegIndirect(name, _) => Opd::RInd(to_upper(name)),
        Operand::CPort(_) => Opd::CPort,
        Operand::Indexed {
            base,
            offset,
            negative,
            span,
        } => {
            let prefix = index_prefix(base).unwrap_or(0xDD);
            let offset = match offset {
                Some(expr) if *negative => Expr::Unary {
                    op: UnaryOp::Minus,
                    expr: Box::new(expr.clone()),
                    span: *span,
                },
                Some(expr) => expr.clone(),
                None => Expr::Literal(Value::Int(0), *span),
            };
            Opd::Idx { prefix, offset }
        }
        Operand::MemIndirect(expr, _) => Opd::Mem(expr.clone()),
        Operand::Expr(expr) => Opd::Imm(expr.clone()),
    }
}

fn invalid(operation: &Operation) -> Encoded {
    Encoded::Error(EncodeError {
        code: codes::INVALID_OPERANDS,
        message: format!(
            "Invalid operand combination for '{}'",
            to_upper(&operation.mnemonic)
        ),
        span: Some(operation.span),
    })
}

fn hl_only(operation: &Operation) -> Encoded {
    Encoded::Error(EncodeError {
        code: codes::REG_INDIRECT_HL_ONLY,
        message: format!(
            "Register-indirect operand of '{}' must be (HL)",
            to_upper(&operation.mnemonic)
        ),
        span: Some(operation.span),
    })
}

fn next_only(operation: &Operation) -> Encoded {
    Encoded::Error(EncodeError {
        code: codes::NEXT_ONLY,
        message: format!(
            "'{}' form is only valid on the Spectrum Next model",
            to_upper(&operation.mnemonic)
        ),
        span: Some(operation.span),
    })
}

fn error(code: &'static str, message: impl Into<String>, operation: &Operation) -> Encoded {
    Encoded::Error(EncodeError {
        code,
        message: message.into(),
        span: Some(operation.span),
    })
}

fn ok(parts: Vec<Part>) -> Encoded {
    Encoded::Parts(parts)
}

/// Force-evaluate an expression that shapes the opcode itself.
fn const_or_error(
    consts: &mut dyn ConstEval,
    expr: &Expr,
    code: &'static str,
    what: &str,
    operation: &Operation,
) -> Result<i64, Encoded> {
    match consts.const_value(expr) {
        Ok(value) => Ok(value),
        Err(ConstIssue::Unresolved(symbol)) => Err(error(
            code,
            format!("{what} must be resolvable at this point, '{symbol}' is undefined"),
            operation,
        )),
        Err(ConstIssue::Error(message)) => Err(error(code, message, operation)),
    }
}

pub fn encode(operation: &Operation, next_enabled: bool, consts: &mut dyn ConstEval) -> Encoded {
    let mnemonic = to_upper(&operation.mnemonic);

    if let Some(trivial) = lookup_trivial(&mnemonic) {
        if !operation.operands.is_empty() {
            return invalid(operation);
        }
        if trivial.next_only && !next_enabled {
            return next_only(operation);
        }
        return ok(trivial.bytes.iter().copied().map(Part::Byte).collect());
    }

    let ops: Vec<Opd> = operation.operands.iter().map(classify).collect();

    match mnemonic.as_str() {
        "LD" => encode_ld(operation, &ops),
        "INC" | "DEC" => encode_inc_dec(operation, &mnemonic, &ops),
        "ADD" | "ADC" | "SUB" | "SBC" | "AND" | "XOR" | "OR" | "CP" => {
            encode_alu(operation, &mnemonic, &ops, next_enabled)
        }
        "RLC" | "RRC" | "RL" | "RR" | "SLA" | "SRA" | "SLL" | "SRL" => {
            encode_shift(operation, &mnemonic, &ops)
        }
        "BIT" | "RES" | "SET" => encode_bit_op(operation, &mnemonic, &ops, consts),
        "JP" => encode_jp(operation, &ops, next_enabled),
        "JR" => encode_jr(operation, &ops),
        "CALL" => encode_call(operation, &ops),
        "RET" => encode_ret(operation, &ops),
        "RST" => encode_rst(operation, &ops, consts),
        "DJNZ" => match ops.as_slice() {
            [Opd::Imm(target)] => ok(vec![Part::Byte(0x10), Part::Rel(target.clone())]),
            _ => invalid(operation),
        },
        "PUSH" | "POP" => encode_push_pop(operation, &mnemonic, &ops, next_enabled),
        "EX" => encode_ex(operation, &ops),
        "IN" => encode_in(operation, &ops),
        "OUT" => encode_out(operation, &ops, consts),
        "IM" => encode_im(operation, &ops, consts),
        "MUL" => encode_mul(operation, &ops, next_enabled),
        "NEXTREG" => encode_nextreg(operation, &ops, next_enabled),
        "MIRROR" => match ops.as_slice() {
            [] | [Opd::R8(7)] if next_enabled => ok(vec![Part::Byte(0xED), Part::Byte(0x24)]),
            [] | [Opd::R8(7)] => next_only(operation),
            _ => invalid(operation),
        },
        "TEST" => match ops.as_slice() {
            [Opd::Imm(value)] if next_enabled => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x27),
                Part::Imm8(value.clone()),
            ]),
            [Opd::Imm(_)] => next_only(operation),
            _ => invalid(operation),
        },
        "BSLA" | "BSRA" | "BSRL" | "BSRF" | "BRLC" => {
            encode_barrel_shift(operation, &mnemonic, &ops, next_enabled)
        }
        _ => error(
            codes::UNKNOWN_MNEMONIC,
            format!("Unknown mnemonic '{mnemonic}'"),
            operation,
        ),
    }
}

// ---- LD ----------------------------------------------------------------

fn encode_ld(operation: &Operation, ops: &[Opd]) -> Encoded {
    match ops {
        // 8-bit register moves and loads.
        [Opd::R8(dst), Opd::R8(src)] => ok(vec![Part::Byte(0x40 + (dst << 3) + src)]),
        [Opd::R8(dst), Opd::R8Half { prefix, index }] => {
            // XH/XL/YH/YL pair only with A,B,C,D,E.
            if matches!(dst, 4 | 5) {
                return invalid(operation);
            }
            ok(vec![Part::Byte(*prefix), Part::Byte(0x40 + (dst << 3) + index)])
        }
        [Opd::R8Half { prefix, index }, Opd::R8(src)] => {
            if matches!(src, 4 | 5) {
                return invalid(operation);
            }
            ok(vec![Part::Byte(*prefix), Part::Byte(0x40 + (index << 3) + src)])
        }
        [Opd::R8Half { prefix: p1, index: d }, Opd::R8Half { prefix: p2, index: s }] => {
            if p1 != p2 {
                return invalid(operation);
            }
            ok(vec![Part::Byte(*p1), Part::Byte(0x40 + (d << 3) + s)])
        }
        [Opd::R8Half { prefix, index }, Opd::Imm(value)] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0x06 + (index << 3)),
            Part::Imm8(value.clone()),
        ]),
        [Opd::R8(dst), Opd::RInd(src)] => match src.as_str() {
            "HL" => ok(vec![Part::Byte(0x46 + (dst << 3))]),
            "BC" if *dst == 7 => ok(vec![Part::Byte(0x0A)]),
            "DE" if *dst == 7 => ok(vec![Part::Byte(0x1A)]),
            _ => invalid(operation),
        },
        [Opd::RInd(dst), Opd::R8(src)] => match dst.as_str() {
            "HL" => ok(vec![Part::Byte(0x70 + src)]),
            "BC" if *src == 7 => ok(vec![Part::Byte(0x02)]),
            "DE" if *src == 7 => ok(vec![Part::Byte(0x12)]),
            _ => invalid(operation),
        },
        [Opd::RInd(dst), Opd::Imm(value)] if dst == "HL" => {
            ok(vec![Part::Byte(0x36), Part::Imm8(value.clone())])
        }
        [Opd::R8(dst), Opd::Idx { prefix, offset }] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0x46 + (dst << 3)),
            Part::Imm8(offset.clone()),
        ]),
        [Opd::Idx { prefix, offset }, Opd::R8(src)] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0x70 + src),
            Part::Imm8(offset.clone()),
        ]),
        [Opd::Idx { prefix, offset }, Opd::Imm(value)] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0x36),
            Part::Imm8(offset.clone()),
            Part::Imm8(value.clone()),
        ]),
        [Opd::R8(7), Opd::Mem(address)] => {
            ok(vec![Part::Byte(0x3A), Part::Imm16(address.clone())])
        }
        [Opd::Mem(address), Opd::R8(7)] => {
            ok(vec![Part::Byte(0x32), Part::Imm16(address.clone())])
        }
        [Opd::R8(dst), Opd::Imm(value)] => ok(vec![
            Part::Byte(0x06 + (dst << 3)),
            Part::Imm8(value.clone()),
        ]),

        // Interrupt/refresh registers.
        [Opd::R8(7), Opd::R8Spec('I')] => ok(vec![Part::Byte(0xED), Part::Byte(0x57)]),
        [Opd::R8(7), Opd::R8Spec('R')] => ok(vec![Part::Byte(0xED), Part::Byte(0x5F)]),
        [Opd::R8Spec('I'), Opd::R8(7)] => ok(vec![Part::Byte(0xED), Part::Byte(0x47)]),
        [Opd::R8Spec('R'), Opd::R8(7)] => ok(vec![Part::Byte(0xED), Part::Byte(0x4F)]),

        // 16-bit immediate loads.
        [Opd::R16(dst), Opd::Imm(value)] => match dst.as_str() {
            "BC" | "DE" | "HL" | "SP" => {
                let rr = reg16_index(dst).expect("main 16-bit register");
                ok(vec![
                    Part::Byte(0x01 + (rr << 4)),
                    Part::Imm16(value.clone()),
                ])
            }
            "IX" | "IY" => ok(vec![
                Part::Byte(index_prefix(dst).expect("index register")),
                Part::Byte(0x21),
                Part::Imm16(value.clone()),
            ]),
            _ => invalid(operation),
        },

        // 16-bit absolute loads.
        [Opd::R16(dst), Opd::Mem(address)] => match dst.as_str() {
            "HL" => ok(vec![Part::Byte(0x2A), Part::Imm16(address.clone())]),
            "BC" => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x4B),
                Part::Imm16(address.clone()),
            ]),
            "DE" => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x5B),
                Part::Imm16(address.clone()),
            ]),
            "SP" => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x7B),
                Part::Imm16(address.clone()),
            ]),
            "IX" | "IY" => ok(vec![
                Part::Byte(index_prefix(dst).expect("index register")),
                Part::Byte(0x2A),
                Part::Imm16(address.clone()),
            ]),
            _ => invalid(operation),
        },
        [Opd::Mem(address), Opd::R16(src)] => match src.as_str() {
            "HL" => ok(vec![Part::Byte(0x22), Part::Imm16(address.clone())]),
            "BC" => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x43),
                Part::Imm16(address.clone()),
            ]),
            "DE" => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x53),
                Part::Imm16(address.clone()),
            ]),
            "SP" => ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x73),
                Part::Imm16(address.clone()),
            ]),
            "IX" | "IY" => ok(vec![
                Part::Byte(index_prefix(src).expect("index register")),
                Part::Byte(0x22),
                Part::Imm16(address.clone()),
            ]),
            _ => invalid(operation),
        },

        // Stack pointer transfers.
        [Opd::R16(dst), Opd::R16(src)] if dst == "SP" => match src.as_str() {
            "HL" => ok(vec![Part::Byte(0xF9)]),
            "IX" | "IY" => ok(vec![
                Part::Byte(index_prefix(src).expect("index register")),
                Part::Byte(0xF9),
            ]),
            _ => invalid(operation),
        },

        _ => invalid(operation),
    }
}

// ---- INC / DEC ---------------------------------------------------------

fn encode_inc_dec(operation: &Operation, mnemonic: &str, ops: &[Opd]) -> Encoded {
    let dec = mnemonic == "DEC";
    let base8: u8 = if dec { 0x05 } else { 0x04 };
    let base_hl: u8 = if dec { 0x35 } else { 0x34 };
    let base16: u8 = if dec { 0x0B } else { 0x03 };
    match ops {
        [Opd::R8(reg)] => ok(vec![Part::Byte(base8 + (reg << 3))]),
        [Opd::R8Half { prefix, index }] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(base8 + (index << 3)),
        ]),
        [Opd::RInd(name)] if name == "HL" => ok(vec![Part::Byte(base_hl)]),
        [Opd::RInd(_)] => hl_only(operation),
        [Opd::Idx { prefix, offset }] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(base_hl),
            Part::Imm8(offset.clone()),
        ]),
        [Opd::R16(name)] => match name.as_str() {
            "BC" | "DE" | "HL" | "SP" => {
                let rr = reg16_index(name).expect("main 16-bit register");
                ok(vec![Part::Byte(base16 + (rr << 4))])
            }
            "IX" | "IY" => ok(vec![
                Part::Byte(index_prefix(name).expect("index register")),
                Part::Byte(if dec { 0x2B } else { 0x23 }),
            ]),
            _ => invalid(operation),
        },
        _ => invalid(operation),
    }
}

// ---- ALU ---------------------------------------------------------------

fn encode_alu(operation: &Operation, mnemonic: &str, ops: &[Opd], next_enabled: bool) -> Encoded {
    let alu = alu_index(mnemonic).expect("ALU mnemonic");

    // 16-bit forms with an explicit destination register.
    if let [Opd::R16(dst), rest @ ..] = ops {
        match (mnemonic, dst.as_str()) {
            ("ADD", "HL") | ("ADC", "HL") | ("SBC", "HL") => {
                if let [Opd::R16(src)] = rest {
                    if let Some(rr) = reg16_index(src) {
                        return match mnemonic {
                            "ADD" => ok(vec![Part::Byte(0x09 + (rr << 4))]),
                            "ADC" => ok(vec![Part::Byte(0xED), Part::Byte(0x4A + (rr << 4))]),
                            _ => ok(vec![Part::Byte(0xED), Part::Byte(0x42 + (rr << 4))]),
                        };
                    }
                }
                if mnemonic == "ADD" {
                    return encode_add_16_next(operation, "HL", rest, next_enabled);
                }
                return invalid(operation);
            }
            ("ADD", "BC") | ("ADD", "DE") => {
                return encode_add_16_next(operation, dst, rest, next_enabled);
            }
            ("ADD", "IX") | ("ADD", "IY") => {
                let prefix = index_prefix(dst).expect("index register");
                if let [Opd::R16(src)] = rest {
                    // The index register pairs with BC, DE, itself and SP.
                    let pp = match src.as_str() {
                        "BC" => 0u8,
                        "DE" => 1,
                        s if s == dst => 2,
                        "SP" => 3,
                        _ => return invalid(operation),
                    };
                    return ok(vec![Part::Byte(prefix), Part::Byte(0x09 + (pp << 4))]);
                }
                return invalid(operation);
            }
            _ => return invalid(operation),
        }
    }

    // 8-bit accumulator forms, with or without the explicit A.
    let sources: &[Opd] = match ops {
        [Opd::R8(7), rest @ ..] if rest.len() == 1 => rest,
        [single] => std::slice::from_ref(single),
        _ => return invalid(operation),
    };
    match sources {
        [Opd::R8(src)] => ok(vec![Part::Byte(0x80 + (alu << 3) + src)]),
        [Opd::R8Half { prefix, index }] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0x80 + (alu << 3) + index),
        ]),
        [Opd::RInd(name)] if name == "HL" => ok(vec![Part::Byte(0x80 + (alu << 3) + 6)]),
        [Opd::RInd(_)] => hl_only(operation),
        [Opd::Idx { prefix, offset }] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0x80 + (alu << 3) + 6),
            Part::Imm8(offset.clone()),
        ]),
        [Opd::Imm(value)] => ok(vec![
            Part::Byte(0xC6 + (alu << 3)),
            Part::Imm8(value.clone()),
        ]),
        _ => invalid(operation),
    }
}

/// Next-only `ADD rr,A` / `ADD rr,nn` forms.
fn encode_add_16_next(
    operation: &Operation,
    dst: &str,
    rest: &[Opd],
    next_enabled: bool,
) -> Encoded {
    let (acc_op, imm_op) = match dst {
        "HL" => (0x31u8, 0x34u8),
        "DE" => (0x32, 0x35),
        "BC" => (0x33, 0x36),
        _ => return invalid(operation),
    };
    match rest {
        [Opd::R8(7)] => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![Part::Byte(0xED), Part::Byte(acc_op)])
        }
        [Opd::Imm(value)] => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![
                Part::Byte(0xED),
                Part::Byte(imm_op),
                Part::Imm16(value.clone()),
            ])
        }
        _ => invalid(operation),
    }
}

// ---- shifts and rotates ------------------------------------------------

fn encode_shift(operation: &Operation, mnemonic: &str, ops: &[Opd]) -> Encoded {
    let shift = shift_index(mnemonic).expect("shift mnemonic");
    match ops {
        [Opd::R8(reg)] => ok(vec![Part::Byte(0xCB), Part::Byte((shift << 3) + reg)]),
        [Opd::RInd(name)] if name == "HL" => {
            ok(vec![Part::Byte(0xCB), Part::Byte((shift << 3) + 6)])
        }
        [Opd::RInd(_)] => hl_only(operation),
        // DD CB d op: the displacement precedes the operation byte.
        [Opd::Idx { prefix, offset }] => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0xCB),
            Part::Imm8(offset.clone()),
            Part::Byte((shift << 3) + 6),
        ]),
        _ => invalid(operation),
    }
}

// ---- BIT / RES / SET ---------------------------------------------------

fn encode_bit_op(
    operation: &Operation,
    mnemonic: &str,
    ops: &[Opd],
    consts: &mut dyn ConstEval,
) -> Encoded {
    let base: u8 = match mnemonic {
        "BIT" => 0x40,
        "RES" => 0x80,
        _ => 0xC0,
    };
    let [Opd::Imm(bit_expr), target] = ops else {
        return invalid(operation);
    };
    let bit = match const_or_error(
        consts,
        bit_expr,
        codes::BIT_INDEX_RANGE,
        "Bit index",
        operation,
    ) {
        Ok(value) => value,
        Err(encoded) => return encoded,
    };
    if !(0..=7).contains(&bit) {
        return error(
            codes::BIT_INDEX_RANGE,
            format!("Bit index {bit} out of range (0-7)"),
            operation,
        );
    }
    let bit = bit as u8;
    match target {
        Opd::R8(reg) => ok(vec![Part::Byte(0xCB), Part::Byte(base + (bit << 3) + reg)]),
        Opd::RInd(name) if name == "HL" => {
            ok(vec![Part::Byte(0xCB), Part::Byte(base + (bit << 3) + 6)])
        }
        Opd::RInd(_) => hl_only(operation),
        Opd::Idx { prefix, offset } => ok(vec![
            Part::Byte(*prefix),
            Part::Byte(0xCB),
            Part::Imm8(offset.clone()),
            Part::Byte(base + (bit << 3) + 6),
        ]),
        _ => invalid(operation),
    }
}

// ---- jumps and calls ---------------------------------------------------

fn encode_jp(operation: &Operation, ops: &[Opd], next_enabled: bool) -> Encoded {
    match ops {
        [Opd::Imm(target)] => ok(vec![Part::Byte(0xC3), Part::Imm16(target.clone())]),
        [Opd::Cond(cond), Opd::Imm(target)] => {
            let cc = condition_index(cond).expect("condition");
            ok(vec![
                Part::Byte(0xC2 + (cc << 3)),
                Part::Imm16(target.clone()),
            ])
        }
        [Opd::RInd(name)] if name == "HL" => ok(vec![Part::Byte(0xE9)]),
        [Opd::Idx { prefix, offset }] => {
            if !matches!(offset, Expr::Literal(Value::Int(0), _)) {
                return invalid(operation);
            }
            ok(vec![Part::Byte(*prefix), Part::Byte(0xE9)])
        }
        [Opd::CPort] => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![Part::Byte(0xED), Part::Byte(0x98)])
        }
        _ => invalid(operation),
    }
}

fn encode_jr(operation: &Operation, ops: &[Opd]) -> Encoded {
    match ops {
        [Opd::Imm(target)] => ok(vec![Part::Byte(0x18), Part::Rel(target.clone())]),
        [Opd::Cond(cond), Opd::Imm(target)] => match jr_opcode(cond) {
            Some(opcode) => ok(vec![Part::Byte(opcode), Part::Rel(target.clone())]),
            None => invalid(operation),
        },
        _ => invalid(operation),
    }
}

fn encode_call(operation: &Operation, ops: &[Opd]) -> Encoded {
    match ops {
        [Opd::Imm(target)] => ok(vec![Part::Byte(0xCD), Part::Imm16(target.clone())]),
        [Opd::Cond(cond), Opd::Imm(target)] => {
            let cc = condition_index(cond).expect("condition");
            ok(vec![
                Part::Byte(0xC4 + (cc << 3)),
                Part::Imm16(target.clone()),
            ])
        }
        _ => invalid(operation),
    }
}

fn encode_ret(operation: &Operation, ops: &[Opd]) -> Encoded {
    match ops {
        [] => ok(vec![Part::Byte(0xC9)]),
        [Opd::Cond(cond)] => {
            let cc = condition_index(cond).expect("condition");
            ok(vec![Part::Byte(0xC0 + (cc << 3))])
        }
        _ => invalid(operation),
    }
}

fn encode_rst(operation: &Operation, ops: &[Opd], consts: &mut dyn ConstEval) -> Encoded {
    let [Opd::Imm(target)] = ops else {
        return invalid(operation);
    };
    let value = match const_or_error(
        consts,
        target,
        codes::INVALID_OPERANDS,
        "RST target",
        operation,
    ) {
        Ok(value) => value,
        Err(encoded) => return encoded,
    };
    if value % 8 != 0 || !(0..=0x38).contains(&value) {
        return error(
            codes::INVALID_OPERANDS,
            format!("RST target {value:#04X} must be one of 00,08,10,18,20,28,30,38"),
            operation,
        );
    }
    ok(vec![Part::Byte(0xC7 + value as u8)])
}

// ---- stack -------------------------------------------------------------

fn encode_push_pop(
    operation: &Operation,
    mnemonic: &str,
    ops: &[Opd],
    next_enabled: bool,
) -> Encoded {
    let push = mnemonic == "PUSH";
    let base: u8 = if push { 0xC5 } else { 0xC1 };
    match ops {
        [Opd::R16(name)] => {
            if let Some(rr) = reg16_af_index(name) {
                return ok(vec![Part::Byte(base + (rr << 4))]);
            }
            match name.as_str() {
                "IX" | "IY" => ok(vec![
                    Part::Byte(index_prefix(name).expect("index register")),
                    Part::Byte(if push { 0xE5 } else { 0xE1 }),
                ]),
                _ => invalid(operation),
            }
        }
        // Next-only PUSH nn, big-endian immediate.
        [Opd::Imm(value)] if push => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x8A),
                Part::Imm16Be(value.clone()),
            ])
        }
        _ => invalid(operation),
    }
}

// ---- exchanges ---------------------------------------------------------

fn encode_ex(operation: &Operation, ops: &[Opd]) -> Encoded {
    match ops {
        [Opd::R16(a), Opd::R16(b)] if a == "DE" && b == "HL" => ok(vec![Part::Byte(0xEB)]),
        [Opd::R16(a), Opd::R16(b)] if a == "AF" && b == "AF'" => ok(vec![Part::Byte(0x08)]),
        [Opd::RInd(sp), Opd::R16(reg)] if sp == "SP" => match reg.as_str() {
            "HL" => ok(vec![Part::Byte(0xE3)]),
            "IX" | "IY" => ok(vec![
                Part::Byte(index_prefix(reg).expect("index register")),
                Part::Byte(0xE3),
            ]),
            _ => invalid(operation),
        },
        _ => invalid(operation),
    }
}

// ---- I/O ---------------------------------------------------------------

fn encode_in(operation: &Operation, ops: &[Opd]) -> Encoded {
    match ops {
        [Opd::R8(7), Opd::Mem(port)] => {
            ok(vec![Part::Byte(0xDB), Part::Imm8(port.clone())])
        }
        [Opd::R8(reg), Opd::CPort] => ok(vec![
            Part::Byte(0xED),
            Part::Byte(0x40 + (reg << 3)),
        ]),
        // IN (C) and IN F,(C): read flags, discard result.
        [Opd::CPort] | [Opd::R8Spec('F'), Opd::CPort] => {
            ok(vec![Part::Byte(0xED), Part::Byte(0x70)])
        }
        _ => invalid(operation),
    }
}

fn encode_out(operation: &Operation, ops: &[Opd], consts: &mut dyn ConstEval) -> Encoded {
    match ops {
        [Opd::Mem(port), Opd::R8(7)] => {
            ok(vec![Part::Byte(0xD3), Part::Imm8(port.clone())])
        }
        [Opd::CPort, Opd::R8(reg)] => ok(vec![
            Part::Byte(0xED),
            Part::Byte(0x41 + (reg << 3)),
        ]),
        // OUT (C),0 is the only immediate form.
        [Opd::CPort, Opd::Imm(value)] => {
            let value = match const_or_error(
                consts,
                value,
                codes::INVALID_OPERANDS,
                "OUT operand",
                operation,
            ) {
                Ok(value) => value,
                Err(encoded) => return encoded,
            };
            if value != 0 {
                return error(
                    codes::INVALID_OPERANDS,
                    "Only OUT (C),0 is valid with an immediate operand",
                    operation,
                );
            }
            ok(vec![Part::Byte(0xED), Part::Byte(0x71)])
        }
        _ => invalid(operation),
    }
}

fn encode_im(operation: &Operation, ops: &[Opd], consts: &mut dyn ConstEval) -> Encoded {
    let [Opd::Imm(mode)] = ops else {
        return invalid(operation);
    };
    let mode = match const_or_error(
        consts,
        mode,
        codes::INVALID_OPERANDS,
        "Interrupt mode",
        operation,
    ) {
        Ok(value) => value,
        Err(encoded) => return encoded,
    };
    let opcode = match mode {
        0 => 0x46,
        1 => 0x56,
        2 => 0x5E,
        _ => {
            return error(
                codes::INVALID_OPERANDS,
                format!("Interrupt mode {mode} out of range (0-2)"),
                operation,
            )
        }
    };
    ok(vec![Part::Byte(0xED), Part::Byte(opcode)])
}

// ---- Next arithmetic ---------------------------------------------------

fn encode_mul(operation: &Operation, ops: &[Opd], next_enabled: bool) -> Encoded {
    let shape_ok = match ops {
        [] => true,
        [Opd::R8(2), Opd::R8(3)] => true, // MUL D,E
        _ => false,
    };
    if !shape_ok {
        return invalid(operation);
    }
    if !next_enabled {
        return next_only(operation);
    }
    ok(vec![Part::Byte(0xED), Part::Byte(0x30)])
}

fn encode_nextreg(operation: &Operation, ops: &[Opd], next_enabled: bool) -> Encoded {
    match ops {
        [Opd::Imm(register), Opd::Imm(value)] => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x91),
                Part::Imm8(register.clone()),
                Part::Imm8(value.clone()),
            ])
        }
        [Opd::Imm(register), Opd::R8(7)] => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![
                Part::Byte(0xED),
                Part::Byte(0x92),
                Part::Imm8(register.clone()),
            ])
        }
        _ => invalid(operation),
    }
}

fn encode_barrel_shift(
    operation: &Operation,
    mnemonic: &str,
    ops: &[Opd],
    next_enabled: bool,
) -> Encoded {
    let opcode: u8 = match mnemonic {
        "BSLA" => 0x28,
        "BSRA" => 0x29,
        "BSRL" => 0x2A,
        "BSRF" => 0x2B,
        _ => 0x2C, // BRLC
    };
    match ops {
        [Opd::R16(de), Opd::R8(0)] if de == "DE" => {
            if !next_enabled {
                return next_only(operation);
            }
            ok(vec![Part::Byte(0xED), Part::Byte(opcode)])
        }
        _ => invalid(operation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::{parse_line, LinePayload};

    struct NoConsts;

    impl ConstEval for NoConsts {
        fn const_value(&mut self, expr: &Expr) -> Result<i64, ConstIssue> {
            match expr {
                Expr::Literal(Value::Int(v), _) => Ok(*v),
                Expr::Unary {
                    op: UnaryOp::Minus,
                    expr,
                    ..
                } => self.const_value(expr).map(|v| -v),
                _ => Err(ConstIssue::Unresolved("sym".to_string())),
            }
        }
    }

    fn encode_line(text: &str) -> Encoded {
        encode_line_on(text, true)
    }

    fn encode_line_on(text: &str, next_enabled: bool) -> Encoded {
        let line = parse_line(text, 0, 1);
        assert!(line.issue.is_none(), "parse issue: {:?}", line.issue);
        match line.payload {
            LinePayload::Operation(op) => encode(&op, next_enabled, &mut NoConsts),
            other => panic!("not an operation: {other:?}"),
        }
    }

    fn bytes(text: &str) -> Vec<u8> {
        bytes_on(text, true)
    }

    fn bytes_on(text: &str, next_enabled: bool) -> Vec<u8> {
        match encode_line_on(text, next_enabled) {
            Encoded::Parts(parts) => parts
                .into_iter()
                .map(|part| match part {
                    Part::Byte(b) => b,
                    Part::Imm8(expr) | Part::Rel(expr) => match NoConsts.const_value(&expr) {
                        Ok(v) => v as u8,
                        Err(err) => panic!("non-const imm8 in '{text}': {err:?}"),
                    },
                    other => panic!("multi-byte part in byte test for '{text}': {other:?}"),
                })
                .collect(),
            Encoded::Error(err) => panic!("encode error for '{text}': {}", err.message),
        }
    }

    fn err_code(text: &str) -> &'static str {
        match encode_line(text) {
            Encoded::Error(err) => err.code,
            Encoded::Parts(_) => panic!("expected error for '{text}'"),
        }
    }

    #[test]
    fn trivial_opcodes() {
        assert_eq!(bytes("nop"), vec![0x00]);
        assert_eq!(bytes("halt"), vec![0x76]);
        assert_eq!(bytes("exx"), vec![0xD9]);
        assert_eq!(bytes("neg"), vec![0xED, 0x44]);
        assert_eq!(bytes("ldir"), vec![0xED, 0xB0]);
        assert_eq!(bytes("otdr"), vec![0xED, 0xBB]);
    }

    #[test]
    fn ld_register_matrix_samples() {
        assert_eq!(bytes("ld a,b"), vec![0x78]);
        assert_eq!(bytes("ld b,c"), vec![0x41]);
        assert_eq!(bytes("ld l,a"), vec![0x6F]);
        assert_eq!(bytes("ld a,5"), vec![0x3E, 0x05]);
        assert_eq!(bytes("ld (hl),a"), vec![0x77]);
        assert_eq!(bytes("ld e,(hl)"), vec![0x5E]);
        assert_eq!(bytes("ld (hl),$20"), vec![0x36, 0x20]);
    }

    #[test]
    fn ld_accumulator_memory_forms() {
        assert_eq!(bytes("ld a,(bc)"), vec![0x0A]);
        assert_eq!(bytes("ld a,(de)"), vec![0x1A]);
        assert_eq!(bytes("ld (bc),a"), vec![0x02]);
        assert_eq!(bytes("ld (de),a"), vec![0x12]);
    }

    #[test]
    fn ld_special_registers() {
        assert_eq!(bytes("ld a,i"), vec![0xED, 0x57]);
        assert_eq!(bytes("ld a,r"), vec![0xED, 0x5F]);
        assert_eq!(bytes("ld i,a"), vec![0xED, 0x47]);
        assert_eq!(bytes("ld r,a"), vec![0xED, 0x4F]);
    }

    #[test]
    fn ld_index_halves() {
        assert_eq!(bytes("ld a,xh"), vec![0xDD, 0x7C]);
        assert_eq!(bytes("ld yl,b"), vec![0xFD, 0x68]);
        assert_eq!(bytes("ld xh,$12"), vec![0xDD, 0x26, 0x12]);
        assert_eq!(bytes("ld xh,xl"), vec![0xDD, 0x65]);
        // Halves never pair with H, L or the other index bank.
        assert_eq!(err_code("ld h,xh"), codes::INVALID_OPERANDS);
        assert_eq!(err_code("ld xh,yl"), codes::INVALID_OPERANDS);
    }

    #[test]
    fn ld_indexed_memory() {
        assert_eq!(bytes("ld (ix+5),10"), vec![0xDD, 0x36, 0x05, 0x0A]);
        assert_eq!(bytes("ld a,(ix+3)"), vec![0xDD, 0x7E, 0x03]);
        assert_eq!(bytes("ld (iy-2),d"), vec![0xFD, 0x72, 0xFE]);
    }

    #[test]
    fn ld_sixteen_bit_forms() {
        match encode_line("ld hl,$1234") {
            Encoded::Parts(parts) => {
                assert!(matches!(parts[0], Part::Byte(0x21)));
                assert!(matches!(parts[1], Part::Imm16(_)));
            }
            Encoded::Error(err) => panic!("{}", err.message),
        }
        assert!(matches!(encode_line("ld ix,$1234"), Encoded::Parts(_)));
        assert!(matches!(encode_line("ld bc,(data)"), Encoded::Parts(_)));
        assert_eq!(bytes("ld sp,hl"), vec![0xF9]);
        assert_eq!(bytes("ld sp,ix"), vec![0xDD, 0xF9]);
    }

    #[test]
    fn inc_dec_forms() {
        assert_eq!(bytes("inc a"), vec![0x3C]);
        assert_eq!(bytes("dec b"), vec![0x05]);
        assert_eq!(bytes("inc (hl)"), vec![0x34]);
        assert_eq!(bytes("inc bc"), vec![0x03]);
        assert_eq!(bytes("dec sp"), vec![0x3B]);
        assert_eq!(bytes("inc ix"), vec![0xDD, 0x23]);
        assert_eq!(bytes("dec iy"), vec![0xFD, 0x2B]);
        assert_eq!(bytes("inc (ix+1)"), vec![0xDD, 0x34, 0x01]);
        assert_eq!(bytes("inc xh"), vec![0xDD, 0x24]);
        assert_eq!(err_code("inc (bc)"), codes::REG_INDIRECT_HL_ONLY);
    }

    #[test]
    fn alu_forms() {
        assert_eq!(bytes("add a,b"), vec![0x80]);
        assert_eq!(bytes("adc a,c"), vec![0x89]);
        assert_eq!(bytes("sub d"), vec![0x92]);
        assert_eq!(bytes("sub a,d"), vec![0x92]);
        assert_eq!(bytes("and e"), vec![0xA3]);
        assert_eq!(bytes("xor a"), vec![0xAF]);
        assert_eq!(bytes("or (hl)"), vec![0xB6]);
        assert_eq!(bytes("cp 5"), vec![0xFE, 0x05]);
        assert_eq!(bytes("add a,$10"), vec![0xC6, 0x10]);
        assert_eq!(bytes("sbc a,(ix+2)"), vec![0xDD, 0x9E, 0x02]);
        assert_eq!(bytes("add a,xl"), vec![0xDD, 0x85]);
    }

    #[test]
    fn sixteen_bit_arithmetic() {
        assert_eq!(bytes("add hl,bc"), vec![0x09]);
        assert_eq!(bytes("add hl,sp"), vec![0x39]);
        assert_eq!(bytes("adc hl,de"), vec![0xED, 0x5A]);
        assert_eq!(bytes("sbc hl,hl"), vec![0xED, 0x62]);
        assert_eq!(bytes("add ix,bc"), vec![0xDD, 0x09]);
        assert_eq!(bytes("add ix,ix"), vec![0xDD, 0x29]);
        assert_eq!(bytes("add iy,sp"), vec![0xFD, 0x39]);
        assert_eq!(err_code("add ix,hl"), codes::INVALID_OPERANDS);
    }

    #[test]
    fn shift_and_rotate_forms() {
        assert_eq!(bytes("rlc b"), vec![0xCB, 0x00]);
        assert_eq!(bytes("rrc c"), vec![0xCB, 0x09]);
        assert_eq!(bytes("rl d"), vec![0xCB, 0x12]);
        assert_eq!(bytes("sla (hl)"), vec![0xCB, 0x26]);
        assert_eq!(bytes("sll e"), vec![0xCB, 0x33]);
        assert_eq!(bytes("srl a"), vec![0xCB, 0x3F]);
        // Displacement byte precedes the operation byte.
        assert_eq!(bytes("rlc (ix+1)"), vec![0xDD, 0xCB, 0x01, 0x06]);
        assert_eq!(bytes("sra (iy-1)"), vec![0xFD, 0xCB, 0xFF, 0x2E]);
    }

    #[test]
    fn bit_res_set_forms() {
        assert_eq!(bytes("bit 0,a"), vec![0xCB, 0x47]);
        assert_eq!(bytes("bit 7,(hl)"), vec![0xCB, 0x7E]);
        assert_eq!(bytes("res 1,b"), vec![0xCB, 0x88]);
        assert_eq!(bytes("set 4,(hl)"), vec![0xCB, 0xE6]);
        assert_eq!(bytes("bit 3,(iy-2)"), vec![0xFD, 0xCB, 0xFE, 0x5E]);
        assert_eq!(bytes("set 6,(ix+0)"), vec![0xDD, 0xCB, 0x00, 0xF6]);
        assert_eq!(err_code("bit 8,a"), codes::BIT_INDEX_RANGE);
    }

    #[test]
    fn jumps_and_calls() {
        assert!(matches!(encode_line("jp $8000"), Encoded::Parts(_)));
        match encode_line("jp nz,$8000") {
            Encoded::Parts(parts) => assert!(matches!(parts[0], Part::Byte(0xC2))),
            Encoded::Error(err) => panic!("{}", err.message),
        }
        match encode_line("call pe,$8000") {
            Encoded::Parts(parts) => assert!(matches!(parts[0], Part::Byte(0xEC))),
            Encoded::Error(err) => panic!("{}", err.message),
        }
        assert_eq!(bytes("jp (hl)"), vec![0xE9]);
        assert_eq!(bytes("jp (ix)"), vec![0xDD, 0xE9]);
        assert_eq!(bytes("ret"), vec![0xC9]);
        assert_eq!(bytes("ret m"), vec![0xF8]);
        assert_eq!(bytes("ret nz"), vec![0xC0]);
    }

    #[test]
    fn jr_condition_subset() {
        match encode_line("jr z,$8000") {
            Encoded::Parts(parts) => assert!(matches!(parts[0], Part::Byte(0x28))),
            Encoded::Error(err) => panic!("{}", err.message),
        }
        assert_eq!(err_code("jr po,$8000"), codes::INVALID_OPERANDS);
    }

    #[test]
    fn rst_requires_vector_byte_values() {
        assert_eq!(bytes("rst 0"), vec![0xC7]);
        assert_eq!(bytes("rst $08"), vec![0xCF]);
        assert_eq!(bytes("rst $38"), vec![0xFF]);
        assert_eq!(err_code("rst 3"), codes::INVALID_OPERANDS);
        assert_eq!(err_code("rst $40"), codes::INVALID_OPERANDS);
    }

    #[test]
    fn push_pop_forms() {
        assert_eq!(bytes("push bc"), vec![0xC5]);
        assert_eq!(bytes("push af"), vec![0xF5]);
        assert_eq!(bytes("pop hl"), vec![0xE1]);
        assert_eq!(bytes("push ix"), vec![0xDD, 0xE5]);
        assert_eq!(bytes("pop iy"), vec![0xFD, 0xE1]);
        assert_eq!(err_code("push sp"), codes::INVALID_OPERANDS);
    }

    #[test]
    fn exchange_forms() {
        assert_eq!(bytes("ex de,hl"), vec![0xEB]);
        assert_eq!(bytes("ex af,af'"), vec![0x08]);
        assert_eq!(bytes("ex (sp),hl"), vec![0xE3]);
        assert_eq!(bytes("ex (sp),ix"), vec![0xDD, 0xE3]);
    }

    #[test]
    fn io_forms() {
        assert_eq!(bytes("in a,($fe)"), vec![0xDB, 0xFE]);
        assert_eq!(bytes("in b,(c)"), vec![0xED, 0x40]);
        assert_eq!(bytes("in f,(c)"), vec![0xED, 0x70]);
        assert_eq!(bytes("out ($fe),a"), vec![0xD3, 0xFE]);
        assert_eq!(bytes("out (c),e"), vec![0xED, 0x59]);
        assert_eq!(bytes("out (c),0"), vec![0xED, 0x71]);
    }

    #[test]
    fn interrupt_modes() {
        assert_eq!(bytes("im 0"), vec![0xED, 0x46]);
        assert_eq!(bytes("im 1"), vec![0xED, 0x56]);
        assert_eq!(bytes("im 2"), vec![0xED, 0x5E]);
        assert_eq!(err_code("im 3"), codes::INVALID_OPERANDS);
    }

    #[test]
    fn next_only_instructions() {
        assert_eq!(bytes("swapnib"), vec![0xED, 0x23]);
        assert_eq!(bytes("mul d,e"), vec![0xED, 0x30]);
        assert_eq!(bytes("pixelad"), vec![0xED, 0x94]);
        assert_eq!(bytes("ldirx"), vec![0xED, 0xB4]);
        assert_eq!(bytes("mirror a"), vec![0xED, 0x24]);
        assert_eq!(bytes("nextreg 7,2"), vec![0xED, 0x91, 0x07, 0x02]);
        assert_eq!(bytes("nextreg $16,a"), vec![0xED, 0x92, 0x16]);
        assert_eq!(bytes("bsla de,b"), vec![0xED, 0x28]);
        assert_eq!(bytes("add hl,a"), vec![0xED, 0x31]);
        assert_eq!(bytes("jp (c)"), vec![0xED, 0x98]);
    }

    #[test]
    fn next_only_rejected_on_classic_models() {
        match encode_line_on("swapnib", false) {
            Encoded::Error(err) => assert_eq!(err.code, codes::NEXT_ONLY),
            Encoded::Parts(_) => panic!("expected model gate"),
        }
        match encode_line_on("mul d,e", false) {
            Encoded::Error(err) => assert_eq!(err.code, codes::NEXT_ONLY),
            Encoded::Parts(_) => panic!("expected model gate"),
        }
        // Classic forms keep working regardless of model.
        assert_eq!(bytes_on("add hl,bc", false), vec![0x09]);
    }

    #[test]
    fn operand_mismatch_names_the_mnemonic() {
        match encode_line("ld (bc),b") {
            Encoded::Error(err) => {
                assert_eq!(err.code, codes::INVALID_OPERANDS);
                assert!(err.message.contains("LD"), "message: {}", err.message);
            }
            Encoded::Parts(_) => panic!("expected error"),
        }
        assert_eq!(err_code("ex hl,de"), codes::INVALID_OPERANDS);
        assert_eq!(err_code("ld i,b"), codes::INVALID_OPERANDS);
    }
}
