// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Z80 encoding tables: trivial opcodes, register/condition/ALU indexes
//! and the Spectrum Next-only instruction set.

use crate::core::text_utils::to_upper;

/// An operand-less instruction with a fixed byte sequence.
pub struct TrivialOp {
    pub mnemonic: &'static str,
    pub bytes: &'static [u8],
    pub next_only: bool,
}

pub static TRIVIAL_OPS: &[TrivialOp] = &[
    TrivialOp { mnemonic: "NOP", bytes: &[0x00], next_only: false },
    TrivialOp { mnemonic: "RLCA", bytes: &[0x07], next_only: false },
    TrivialOp { mnemonic: "RRCA", bytes: &[0x0F], next_only: false },
    TrivialOp { mnemonic: "RLA", bytes: &[0x17], next_only: false },
    TrivialOp { mnemonic: "RRA", bytes: &[0x1F], next_only: false },
    TrivialOp { mnemonic: "DAA", bytes: &[0x27], next_only: false },
    TrivialOp { mnemonic: "CPL", bytes: &[0x2F], next_only: false },
    TrivialOp { mnemonic: "SCF", bytes: &[0x37], next_only: false },
    TrivialOp { mnemonic: "CCF", bytes: &[0x3F], next_only: false },
    TrivialOp { mnemonic: "HALT", bytes: &[0x76], next_only: false },
    TrivialOp { mnemonic: "EXX", bytes: &[0xD9], next_only: false },
    TrivialOp { mnemonic: "DI", bytes: &[0xF3], next_only: false },
    TrivialOp { mnemonic: "EI", bytes: &[0xFB], next_only: false },
    TrivialOp { mnemonic: "NEG", bytes: &[0xED, 0x44], next_only: false },
    TrivialOp { mnemonic: "RETN", bytes: &[0xED, 0x45], next_only: false },
    TrivialOp { mnemonic: "RETI", bytes: &[0xED, 0x4D], next_only: false },
    TrivialOp { mnemonic: "RRD", bytes: &[0xED, 0x67], next_only: false },
    TrivialOp { mnemonic: "RLD", bytes: &[0xED, 0x6F], next_only: false },
    TrivialOp { mnemonic: "LDI", bytes: &[0xED, 0xA0], next_only: false },
    TrivialOp { mnemonic: "CPI", bytes: &[0xED, 0xA1], next_only: false },
    TrivialOp { mnemonic: "INI", bytes: &[0xED, 0xA2], next_only: false },
    TrivialOp { mnemonic: "OUTI", bytes: &[0xED, 0xA3], next_only: false },
    TrivialOp { mnemonic: "LDD", bytes: &[0xED, 0xA8], next_only: false },
    TrivialOp { mnemonic: "CPD", bytes: &[0xED, 0xA9], next_only: false },
    TrivialOp { mnemonic: "IND", bytes: &[0xED, 0xAA], next_only: false },
    TrivialOp { mnemonic: "OUTD", bytes: &[0xED, 0xAB], next_only: false },
    TrivialOp { mnemonic: "LDIR", bytes: &[0xED, 0xB0], next_only: false },
    TrivialOp { mnemonic: "CPIR", bytes: &[0xED, 0xB1], next_only: false },
    TrivialOp { mnemonic: "INIR", bytes: &[0xED, 0xB2], next_only: false },
    TrivialOp { mnemonic: "OTIR", bytes: &[0xED, 0xB3], next_only: false },
    TrivialOp { mnemonic: "LDDR", bytes: &[0xED, 0xB8], next_only: false },
    TrivialOp { mnemonic: "CPDR", bytes: &[0xED, 0xB9], next_only: false },
    TrivialOp { mnemonic: "INDR", bytes: &[0xED, 0xBA], next_only: false },
    TrivialOp { mnemonic: "OTDR", bytes: &[0xED, 0xBB], next_only: false },
    // Spectrum Next extensions.
    TrivialOp { mnemonic: "SWAPNIB", bytes: &[0xED, 0x23], next_only: true },
    TrivialOp { mnemonic: "OUTINB", bytes: &[0xED, 0x90], next_only: true },
    TrivialOp { mnemonic: "LDIX", bytes: &[0xED, 0xA4], next_only: true },
    TrivialOp { mnemonic: "LDIRX", bytes: &[0xED, 0xB4], next_only: true },
    TrivialOp { mnemonic: "LDDX", bytes: &[0xED, 0xAC], next_only: true },
    TrivialOp { mnemonic: "LDDRX", bytes: &[0xED, 0xBC], next_only: true },
    TrivialOp { mnemonic: "PIXELDN", bytes: &[0xED, 0x93], next_only: true },
    TrivialOp { mnemonic: "PIXELAD", bytes: &[0xED, 0x94], next_only: true },
    TrivialOp { mnemonic: "SETAE", bytes: &[0xED, 0x95], next_only: true },
    TrivialOp { mnemonic: "LDPIRX", bytes: &[0xED, 0xB7], next_only: true },
    TrivialOp { mnemonic: "LDIRSCALE", bytes: &[0xED, 0xB6], next_only: true },
];

pub fn lookup_trivial(mnemonic: &str) -> Option<&'static TrivialOp> {
    TRIVIAL_OPS
        .iter()
        .find(|op| op.mnemonic.eq_ignore_ascii_case(mnemonic))
}

/// 8-bit register index used across the main opcode plane.
/// `(HL)` takes slot 6; the encoder supplies it explicitly.
pub fn reg8_index(name: &str) -> Option<u8> {
    match to_upper(name).as_str() {
        "B" => Some(0),
        "C" => Some(1),
        "D" => Some(2),
        "E" => Some(3),
        "H" => Some(4),
        "L" => Some(5),
        "A" => Some(7),
        _ => None,
    }
}

/// 16-bit register index for the `ADD HL,rr` family.
pub fn reg16_index(name: &str) -> Option<u8> {
    match to_upper(name).as_str() {
        "BC" => Some(0),
        "DE" => Some(1),
        "HL" => Some(2),
        "SP" => Some(3),
        _ => None,
    }
}

/// 16-bit register index for PUSH/POP, where AF replaces SP.
pub fn reg16_af_index(name: &str) -> Option<u8> {
    match to_upper(name).as_str() {
        "BC" => Some(0),
        "DE" => Some(1),
        "HL" => Some(2),
        "AF" => Some(3),
        _ => None,
    }
}

pub fn condition_index(name: &str) -> Option<u8> {
    match to_upper(name).as_str() {
        "NZ" => Some(0),
        "Z" => Some(1),
        "NC" => Some(2),
        "C" => Some(3),
        "PO" => Some(4),
        "PE" => Some(5),
        "P" => Some(6),
        "M" => Some(7),
        _ => None,
    }
}

/// `JR` accepts the first four conditions only.
pub fn jr_opcode(condition: &str) -> Option<u8> {
    match to_upper(condition).as_str() {
        "NZ" => Some(0x20),
        "Z" => Some(0x28),
        "NC" => Some(0x30),
        "C" => Some(0x38),
        _ => None,
    }
}

pub fn alu_index(mnemonic: &str) -> Option<u8> {
    match to_upper(mnemonic).as_str() {
        "ADD" => Some(0),
        "ADC" => Some(1),
        "SUB" => Some(2),
        "SBC" => Some(3),
        "AND" => Some(4),
        "XOR" => Some(5),
        "OR" => Some(6),
        "CP" => Some(7),
        _ => None,
    }
}

pub fn shift_index(mnemonic: &str) -> Option<u8> {
    match to_upper(mnemonic).as_str() {
        "RLC" => Some(0),
        "RRC" => Some(1),
        "RL" => Some(2),
        "RR" => Some(3),
        "SLA" => Some(4),
        "SRA" => Some(5),
        "SLL" => Some(6),
        "SRL" => Some(7),
        _ => None,
    }
}

/// `DD` for IX, `FD` for IY.
pub fn index_prefix(base: &str) -> Option<u8> {
    match to_upper(base).as_str() {
        "IX" => Some(0xDD),
        "IY" => Some(0xFD),
        _ => None,
    }
}

/// Index-register 8-bit halves act like H/L under a DD/FD prefix.
/// Returns (prefix, register index).
pub fn reg8_half(name: &str) -> Option<(u8, u8)> {
    match to_upper(name).as_str() {
        "XH" | "IXH" => Some((0xDD, 4)),
        "XL" | "IXL" => Some((0xDD, 5)),
        "YH" | "IYH" => Some((0xFD, 4)),
        "YL" | "IYL" => Some((0xFD, 5)),
        _ => None,
    }
}
