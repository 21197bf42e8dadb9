// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{codes, Severity};
use super::listing::AssemblyOutput;
use super::{assemble_text, AssemblerOptions, SpectrumModel};
use crate::core::value::Value;

fn assemble(source: &str) -> AssemblyOutput {
    assemble_text(source, AssemblerOptions::default())
}

fn assemble_next(source: &str) -> AssemblyOutput {
    let options = AssemblerOptions {
        model: Some(SpectrumModel::Next),
        ..AssemblerOptions::default()
    };
    assemble_text(source, options)
}

fn assemble_ok(source: &str) -> AssemblyOutput {
    let output = assemble(source);
    assert!(
        !output.failed,
        "assembly failed for:\n{source}\ndiagnostics: {:?}",
        output
            .diagnostics
            .iter()
            .map(|d| d.format())
            .collect::<Vec<_>>()
    );
    output
}

fn first_bytes(output: &AssemblyOutput) -> Vec<u8> {
    output
        .segments
        .first()
        .map(|segment| segment.emitted.clone())
        .unwrap_or_default()
}

fn bytes_of(source: &str) -> Vec<u8> {
    first_bytes(&assemble_ok(source))
}

fn diag_codes(output: &AssemblyOutput) -> Vec<&'static str> {
    output.diagnostics.iter().map(|diag| diag.code).collect()
}

fn has_code(output: &AssemblyOutput, code: &str) -> bool {
    output.diagnostics.iter().any(|diag| diag.code == code)
}

fn symbol_value(output: &AssemblyOutput, name: &str) -> i64 {
    output
        .symbols
        .iter()
        .find(|symbol| symbol.name.eq_ignore_ascii_case(name))
        .unwrap_or_else(|| panic!("symbol '{name}' not in output"))
        .value
        .as_int()
        .unwrap_or_else(|| panic!("symbol '{name}' is not numeric"))
}

// ---- specification scenarios --------------------------------------------

#[test]
fn scenario_nop_at_default_origin() {
    let output = assemble_ok("nop");
    assert_eq!(output.segments.len(), 1);
    assert_eq!(output.segments[0].start_address, 0x8000);
    assert_eq!(output.segments[0].emitted, vec![0x00]);
}

#[test]
fn scenario_basic_sequence() {
    let output = assemble_ok("ORG $9000\nld a,b\nld a,5\nld (hl),a\nhalt");
    assert_eq!(output.segments[0].start_address, 0x9000);
    assert_eq!(output.segments[0].emitted, vec![0x78, 0x3E, 0x05, 0x77, 0x76]);
}

#[test]
fn scenario_forward_label() {
    let source = "ORG $8000\n  jr target\n  nop\ntarget: ret";
    let output = assemble_ok(source);
    assert_eq!(output.segments[0].emitted, vec![0x18, 0x01, 0x00, 0xC9]);
    assert_eq!(symbol_value(&output, "target"), 0x8003);
}

#[test]
fn scenario_indexed_store() {
    assert_eq!(bytes_of("LD (IX+5),10"), vec![0xDD, 0x36, 0x05, 0x0A]);
}

#[test]
fn scenario_indexed_bit() {
    assert_eq!(bytes_of("BIT 3,(IY-2)"), vec![0xFD, 0xCB, 0xFE, 0x5E]);
}

#[test]
fn scenario_struct_invocation() {
    let source = "\
ORG $8000
MyS: .struct
       fld1 .defb 0
       fld2 .defw 0
     .ends
inst: MyS()
       fld2 = #1234
";
    let output = assemble_ok(source);
    assert_eq!(output.segments[0].emitted, vec![0x00, 0x34, 0x12]);
    assert_eq!(symbol_value(&output, "inst"), 0x8000);

    let probe = assemble_ok(
        "MyS: .struct\n fld1 .defb 0\n fld2 .defw 0\n.ends\ndefb MyS.fld2, MyS",
    );
    assert_eq!(first_bytes(&probe), vec![1, 3]);
}

// ---- labels and symbols -------------------------------------------------

#[test]
fn overflow_label_anchors_at_next_emission() {
    let source = "org $8000\nnop\npending:\n\nnext: nop";
    let output = assemble_ok(source);
    assert_eq!(symbol_value(&output, "pending"), 0x8001);
    assert_eq!(symbol_value(&output, "next"), 0x8001);
}

#[test]
fn trailing_overflow_label_binds_at_end() {
    let output = assemble_ok("org $8000\nnop\nfinish:");
    assert_eq!(symbol_value(&output, "finish"), 0x8001);
}

#[test]
fn duplicate_labels_are_diagnosed() {
    let output = assemble("twice: nop\ntwice: nop");
    assert!(has_code(&output, codes::DUPLICATE_SYMBOL));
    assert!(output.failed);
}

#[test]
fn symbol_lookup_is_case_insensitive() {
    let output = assemble_ok("Value: .equ 42\ndefb VALUE, value");
    assert_eq!(first_bytes(&output), vec![42, 42]);
}

#[test]
fn mnemonics_and_registers_ignore_case() {
    assert_eq!(bytes_of("LD A,B\nld a,b\nLd A,b"), vec![0x78, 0x78, 0x78]);
}

#[test]
fn equ_order_is_irrelevant() {
    let forward = assemble_ok("aa: .equ bb + 1\nbb: .equ 2\ndefb aa");
    let backward = assemble_ok("defb aa\nbb: .equ 2\naa: .equ bb + 1");
    assert_eq!(first_bytes(&forward), vec![3]);
    assert_eq!(first_bytes(&backward), vec![3]);
    assert_eq!(symbol_value(&forward, "aa"), 3);
}

#[test]
fn var_rebinding_is_allowed() {
    let output = assemble_ok("counter: .var 1\ncounter: .var 2\ndefb counter");
    assert_eq!(first_bytes(&output), vec![2]);
}

#[test]
fn var_requires_immediate_value() {
    let output = assemble("later: .var missing\nmissing: .equ 1");
    assert!(has_code(&output, codes::VAR_NEEDS_VALUE));
}

#[test]
fn assignment_form_updates_variable_in_place() {
    let output = assemble_ok("counter = 1\ncounter = counter + 5\ndefb counter");
    assert_eq!(first_bytes(&output), vec![6]);
}

#[test]
fn unresolved_symbol_is_reported_at_finalisation() {
    let output = assemble("defb nowhere");
    assert!(has_code(&output, codes::UNRESOLVED_SYMBOL));
    let diag = output
        .diagnostics
        .iter()
        .find(|diag| diag.code == codes::UNRESOLVED_SYMBOL)
        .expect("unresolved diagnostic");
    assert!(diag.message.contains("nowhere"), "message: {}", diag.message);
}

// ---- fixups -------------------------------------------------------------

#[test]
fn forward_references_patch_bytes_and_words() {
    let source = "org $8000\nld a,low(target)\nld hl,target\ntarget: nop";
    let output = assemble_ok(source);
    // target = 0x8005: two-byte load, three-byte load.
    assert_eq!(
        output.segments[0].emitted,
        vec![0x3E, 0x05, 0x21, 0x05, 0x80, 0x00]
    );
}

#[test]
fn backward_relative_jump() {
    let source = "org $8000\nback: nop\njr back";
    let output = assemble_ok(source);
    // jr at 0x8001; d = 0x8000 - 0x8003 = -3.
    assert_eq!(output.segments[0].emitted, vec![0x00, 0x18, 0xFD]);
}

#[test]
fn djnz_encodes_relative_target() {
    let source = "org $8000\nstart: nop\ndjnz start";
    let output = assemble_ok(source);
    assert_eq!(output.segments[0].emitted, vec![0x00, 0x10, 0xFD]);
}

#[test]
fn relative_jump_out_of_range() {
    let output = assemble("org $8000\njr far\n.skip $8200\nfar: nop");
    assert!(has_code(&output, codes::RELATIVE_JUMP_RANGE));
}

#[test]
fn deferred_entry_pointers_resolve() {
    let output = assemble_ok(".ent start\n.xent start\norg $9000\nstart: nop");
    assert_eq!(output.entry, Some(0x9000));
    assert_eq!(output.export_entry, Some(0x9000));
}

#[test]
fn immediate_entry_uses_current_address() {
    let output = assemble_ok("org $9000\n.ent $\nnop");
    assert_eq!(output.entry, Some(0x9000));
}

// ---- segments -----------------------------------------------------------

#[test]
fn org_after_emission_starts_new_segment() {
    let output = assemble_ok("org $8000\nnop\norg $9000\nnop");
    assert_eq!(output.segments.len(), 2);
    assert_eq!(output.segments[0].start_address, 0x8000);
    assert_eq!(output.segments[1].start_address, 0x9000);
    assert_eq!(output.segments[1].emitted, vec![0x00]);
}

#[test]
fn org_label_takes_the_new_address() {
    let output = assemble_ok("here: .org $C000\nnop");
    assert_eq!(symbol_value(&output, "here"), 0xC000);
}

#[test]
fn displacement_shifts_logical_addresses_only() {
    let output = assemble_ok("org $8000\n.disp $100\nplaced: nop\ndefw placed");
    assert_eq!(symbol_value(&output, "placed"), 0x8100);
    // Physically still three bytes from the segment start.
    assert_eq!(output.segments[0].emitted, vec![0x00, 0x00, 0x81]);
}

#[test]
fn xorg_overrides_output_record_address() {
    let output = assemble_ok(".xorg $4000\nnop");
    assert_eq!(output.segments[0].xorg, Some(0x4000));
    assert_eq!(output.segments[0].start_address, 0x8000);
}

#[test]
fn xorg_after_emission_is_an_error() {
    let output = assemble("nop\n.xorg $4000");
    assert!(has_code(&output, codes::XORG_AFTER_EMIT));
}

#[test]
fn emission_overflow_is_diagnosed() {
    let output = assemble("org $FFFF\ndefw 1");
    assert!(has_code(&output, codes::EMISSION_OVERFLOW));
}

#[test]
fn dollar_and_instruction_start() {
    let output = assemble_ok("org $8000\ndefw $\nld hl,$$");
    // defw sees $ = 0x8000; ld hl,$$ sees its own start 0x8002.
    assert_eq!(
        output.segments[0].emitted,
        vec![0x00, 0x80, 0x21, 0x02, 0x80]
    );
}

// ---- data pragmas -------------------------------------------------------

#[test]
fn defb_and_defw_emit_expressions() {
    assert_eq!(
        bytes_of("defb 1, 2, $10+5\ndefw $1234"),
        vec![1, 2, 0x15, 0x34, 0x12]
    );
}

#[test]
fn defb_rejects_strings() {
    let output = assemble("defb \"no\"");
    assert!(has_code(&output, codes::STRING_NOT_ALLOWED));
}

#[test]
fn defm_family_terminators() {
    assert_eq!(bytes_of(".defm \"ab\""), vec![0x61, 0x62]);
    assert_eq!(bytes_of(".defn \"ab\""), vec![0x61, 0x62, 0x00]);
    assert_eq!(bytes_of(".defmn \"ab\""), vec![0x61, 0xE2, 0x00]);
}

#[test]
fn defm_spectrum_escapes() {
    assert_eq!(bytes_of(r#".defm "\i\P\C\xAB""#), vec![0x10, 0x60, 0x7F, 0xAB]);
}

#[test]
fn defh_hex_pairs() {
    assert_eq!(bytes_of(".defh \"0A1bFF\""), vec![0x0A, 0x1B, 0xFF]);
    let output = assemble(".defh \"0A1\"");
    assert!(has_code(&output, codes::DEFH_ODD_LENGTH));
}

#[test]
fn defs_and_fills() {
    assert_eq!(bytes_of(".defs 3"), vec![0, 0, 0]);
    assert_eq!(bytes_of(".defs 2, $AA"), vec![0xAA, 0xAA]);
    assert_eq!(bytes_of(".fillb 3, $1F"), vec![0x1F, 0x1F, 0x1F]);
    assert_eq!(
        bytes_of(".fillw 2, $1234"),
        vec![0x34, 0x12, 0x34, 0x12]
    );
}

#[test]
fn align_pads_with_zeros() {
    let output = assemble_ok("org $8001\ndefb 1\n.align 4\naligned: nop");
    assert_eq!(symbol_value(&output, "aligned"), 0x8004);
    assert_eq!(output.segments[0].emitted, vec![1, 0, 0, 0x00]);
}

#[test]
fn align_range_is_checked() {
    let output = assemble(".align 0");
    assert!(has_code(&output, codes::ALIGN_RANGE));
    let output = assemble(".align 16385");
    assert!(has_code(&output, codes::ALIGN_RANGE));
}

#[test]
fn defg_left_aligned_pattern() {
    assert_eq!(bytes_of(".defg ....XXXX"), vec![0x0F]);
    assert_eq!(bytes_of(".defg XXXX"), vec![0xF0]);
    assert_eq!(bytes_of(".defg X...X...X"), vec![0x88, 0x80]);
}

#[test]
fn defgx_alignment_prefix() {
    assert_eq!(bytes_of(".defgx \">..XXXX\""), vec![0x0F]);
    assert_eq!(bytes_of(".defgx \"<..XXXX\""), vec![0x3C]);
}

#[test]
fn skip_fills_to_target() {
    let output = assemble_ok("org $8000\ndefb 1\n.skip $8004\nend_: nop");
    assert_eq!(
        output.segments[0].emitted,
        vec![1, 0xFF, 0xFF, 0xFF, 0x00]
    );
    assert_eq!(symbol_value(&output, "end_"), 0x8004);
}

#[test]
fn skip_below_current_is_an_error() {
    let output = assemble("org $8000\ndefw 0\n.skip $8001");
    assert!(has_code(&output, codes::SKIP_BELOW_CURRENT));
}

#[test]
fn trace_messages_reach_the_host() {
    let output = assemble_ok(".trace \"count=\", 4+3");
    assert_eq!(output.trace_messages.len(), 1);
    assert_eq!(output.trace_messages[0].text, "count=7");

    let output = assemble_ok(".htrace $1234");
    assert_eq!(output.trace_messages[0].text, "1234");
}

#[test]
fn model_can_only_be_set_once() {
    let output = assemble(".model SPECTRUM48\n.model NEXT");
    assert!(has_code(&output, codes::MODEL_ALREADY_SET));
}

#[test]
fn rndseed_makes_rnd_deterministic() {
    let source = ".rndseed 99\ndefb rnd() & $ff, rnd() & $ff";
    let first = assemble_ok(source);
    let second = assemble_ok(source);
    assert_eq!(first_bytes(&first), first_bytes(&second));
}

#[test]
fn error_pragma_is_fatal() {
    let output = assemble(".error \"custom failure\"");
    assert!(output.failed);
    let diag = output
        .diagnostics
        .iter()
        .find(|diag| diag.code == codes::USER_ERROR)
        .expect("Z0500 diagnostic");
    assert_eq!(diag.severity, Severity::Error);
    assert!(diag.message.contains("custom failure"));
}

// ---- binary includes ----------------------------------------------------

static INCLUDE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_binary(content: &[u8]) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = INCLUDE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "nexforge-test-{}-{nanos}-{counter}.bin",
        std::process::id()
    ));
    fs::write(&path, content).expect("write temp binary");
    path
}

#[test]
fn includebin_emits_file_slice() {
    let path = temp_binary(&[1, 2, 3, 4, 5]);
    let source = format!(".includebin \"{}\", 1, 3", path.display());
    let output = assemble_ok(&source);
    assert_eq!(first_bytes(&output), vec![2, 3, 4]);
    let _ = fs::remove_file(&path);
}

#[test]
fn includebin_range_checks() {
    let path = temp_binary(&[1, 2, 3]);
    let output = assemble(&format!(".includebin \"{}\", 9", path.display()));
    assert!(has_code(&output, codes::INCLUDE_BIN_OFFSET));
    let output = assemble(&format!(".includebin \"{}\", 1, 9", path.display()));
    assert!(has_code(&output, codes::INCLUDE_BIN_LENGTH));
    let _ = fs::remove_file(&path);
}

#[test]
fn comparebin_records_request() {
    let output = assemble_ok("org $8000\nnop\n.comparebin \"ref.bin\"");
    assert_eq!(output.compare_bins.len(), 1);
    assert_eq!(output.compare_bins[0].offset, 1);
    assert!(output.compare_bins[0].path.ends_with("ref.bin"));
}

// ---- conditionals -------------------------------------------------------

#[test]
fn if_selects_first_truthy_arm() {
    let source = "\
.if 0
defb 1
.elif 1
defb 2
.else
defb 3
.endif";
    assert_eq!(bytes_of(source), vec![2]);
}

#[test]
fn else_arm_runs_when_nothing_matches() {
    let source = ".if 0\ndefb 1\n.elif 0\ndefb 2\n.else\ndefb 3\n.endif";
    assert_eq!(bytes_of(source), vec![3]);
}

#[test]
fn nested_conditionals() {
    let source = "\
.if 1
.if 0
defb 1
.else
defb 2
.endif
.endif";
    assert_eq!(bytes_of(source), vec![2]);
}

#[test]
fn string_condition_is_diagnosed() {
    let output = assemble(".if \"yes\"\nnop\n.endif");
    assert!(has_code(&output, codes::STRING_CONDITION));
}

#[test]
fn ifused_checks_usage_at_evaluation_point() {
    let used = "flagv: .equ 1\ndefb flagv\n.ifused flagv\ndefb 9\n.endif";
    assert_eq!(bytes_of(used), vec![1, 9]);

    let unused = "flagv: .equ 1\n.ifnotused flagv\ndefb 9\n.endif";
    assert_eq!(bytes_of(unused), vec![9]);
}

#[test]
fn endif_label_binds_after_block() {
    let output = assemble_ok("org $8000\n.if 1\nnop\nafter: .endif\ndefw after");
    assert_eq!(symbol_value(&output, "after"), 0x8001);
}

// ---- loops --------------------------------------------------------------

#[test]
fn loop_repeats_body_with_counter() {
    assert_eq!(bytes_of(".loop 3\ndefb $cnt\n.endl"), vec![1, 2, 3]);
}

#[test]
fn loop_break_and_continue() {
    let source = ".loop 5\n.if $cnt == 4\n.break\n.endif\ndefb $cnt\n.endl";
    assert_eq!(bytes_of(source), vec![1, 2, 3]);

    let source = ".loop 4\n.if $cnt == 2\n.continue\n.endif\ndefb $cnt\n.endl";
    assert_eq!(bytes_of(source), vec![1, 3, 4]);
}

#[test]
fn repeat_runs_at_least_once() {
    assert_eq!(bytes_of(".repeat\ndefb $cnt\n.until $cnt == 2"), vec![1, 2]);
    assert_eq!(bytes_of(".repeat\ndefb 7\n.until 1"), vec![7]);
}

#[test]
fn while_checks_before_each_iteration() {
    let source = "count = 0\n.while count < 3\ndefb count\ncount = count + 1\n.wend";
    assert_eq!(bytes_of(source), vec![0, 1, 2]);
    assert_eq!(bytes_of("cnt2 = 5\n.while cnt2 < 3\ndefb 1\n.wend"), Vec::<u8>::new());
}

#[test]
fn for_loop_with_step() {
    assert_eq!(bytes_of(".for idx = 1 .to 5 .step 2\ndefb idx\n.next"), vec![1, 3, 5]);
    assert_eq!(bytes_of(".for idx = 3 .to 1 .step -1\ndefb idx\n.next"), vec![3, 2, 1]);
}

#[test]
fn for_step_zero_is_an_error() {
    let output = assemble(".for idx = 1 .to 5 .step 0\ndefb idx\n.next");
    assert!(has_code(&output, codes::FOR_STEP_ZERO));
}

#[test]
fn loop_iteration_limit() {
    let output = assemble(".loop 100000\n.endl");
    assert!(has_code(&output, codes::LOOP_ITERATION_LIMIT));
}

#[test]
fn loop_error_threshold_aborts_early() {
    let output = assemble(".loop 100\nbogusmnemonic 1\n.endl");
    assert!(has_code(&output, codes::LOOP_ERROR_LIMIT));
    // Far fewer than 100 body errors were reported before the abort.
    let body_errors = diag_codes(&output)
        .iter()
        .filter(|&&code| code == codes::SYNTAX_ERROR)
        .count();
    assert!(body_errors < 30, "{body_errors} errors escaped the limit");
}

#[test]
fn labels_in_loops_live_per_iteration() {
    // Same label every iteration; the per-iteration scope makes it legal.
    let output = assemble_ok(".loop 2\nhere: defb $cnt\njr here\n.endl");
    assert!(!output.failed);
}

#[test]
fn backtick_names_never_reach_the_symbol_table() {
    let output = assemble_ok(".loop 2\n`tmp: .equ $cnt\ndefb `tmp\n.endl");
    assert_eq!(first_bytes(&output), vec![1, 2]);
    assert!(
        output.symbols.iter().all(|s| !s.name.contains('`')),
        "temporary name leaked: {:?}",
        output.symbols.iter().map(|s| &s.name).collect::<Vec<_>>()
    );
}

// ---- procedures and modules ---------------------------------------------

#[test]
fn proc_local_shadows_outer_symbol() {
    let source = "\
scratch: .equ 1
.proc
.local scratch
scratch: .equ 2
defb scratch
.endp
defb scratch";
    assert_eq!(bytes_of(source), vec![2, 1]);
}

#[test]
fn local_outside_proc_is_an_error() {
    let output = assemble(".local name1");
    assert!(has_code(&output, codes::LOCAL_OUTSIDE_PROC));
}

#[test]
fn module_symbols_need_qualification() {
    let source = "\
.module Outer
val: .equ 1
.module Inner
val2: .equ 2
.endmodule
.endmodule
defw Outer.val, Outer.Inner.val2";
    assert_eq!(bytes_of(source), vec![1, 0, 2, 0]);
}

#[test]
fn module_lookup_walks_outward_and_roots() {
    let source = "\
shared: .equ 7
.module M
inner: .equ shared + 1
over: .equ 1
defb inner, ::shared, over
.endmodule";
    assert_eq!(bytes_of(source), vec![8, 7, 1]);
}

#[test]
fn local_form_stays_in_module() {
    let source = "\
outer_only: .equ 1
.module M
defb @outer_only
.endmodule";
    let output = assemble(source);
    assert!(has_code(&output, codes::UNRESOLVED_SYMBOL));
}

#[test]
fn forward_reference_into_module() {
    let source = "defw Later.point\n.module Later\npoint: .equ $1234\n.endmodule";
    assert_eq!(bytes_of(source), vec![0x34, 0x12]);
}

// ---- macros -------------------------------------------------------------

#[test]
fn macro_substitutes_arguments_textually() {
    let source = "\
Twice: .macro(val)
  defb {{val}}, {{val}}*2
.endm
Twice(3)";
    assert_eq!(bytes_of(source), vec![3, 6]);
}

#[test]
fn macro_register_arguments_inline_literally() {
    let source = "\
LoadIt: .macro(reg, v)
  ld {{reg}},{{v}}
.endm
LoadIt(a, 5)
LoadIt(hl, $1234)";
    assert_eq!(bytes_of(source), vec![0x3E, 0x05, 0x21, 0x34, 0x12]);
}

#[test]
fn macro_expansion_matches_inlined_source() {
    let expanded = bytes_of(
        "Emit: .macro(v)\n  defb {{v}}\n  defw {{v}}+1\n.endm\nEmit($10)",
    );
    let inlined = bytes_of("defb $10\ndefw $10+1");
    assert_eq!(expanded, inlined);
}

#[test]
fn macro_invocation_label_binds_at_call_site() {
    let source = "Pad: .macro()\n  nop\n.endm\norg $8000\nnop\ncall_site: Pad()\ndefw call_site";
    let output = assemble_ok(source);
    assert_eq!(symbol_value(&output, "call_site"), 0x8001);
}

#[test]
fn macro_labels_stay_in_invocation_scope() {
    let source = "\
Blk: .macro()
inner: nop
  jr inner
.endm
Blk()
Blk()";
    let output = assemble_ok(source);
    assert!(!output.failed);
}

#[test]
fn unknown_macro_is_diagnosed() {
    let output = assemble("Nothing(1)");
    assert!(has_code(&output, codes::UNKNOWN_MACRO));
}

#[test]
fn macro_argument_count_mismatch() {
    let output = assemble("Two: .macro(p1, p2)\n  nop\n.endm\nTwo(1)");
    assert!(has_code(&output, codes::MACRO_ARG_COUNT));
}

#[test]
fn duplicate_macro_parameter() {
    let output = assemble("Bad: .macro(par, PAR)\n  nop\n.endm");
    assert!(has_code(&output, codes::DUPLICATE_MACRO_PARAM));
}

#[test]
fn macro_name_collision() {
    let output = assemble("Mk: .macro()\n nop\n.endm\nMk: .macro()\n nop\n.endm");
    assert!(has_code(&output, codes::MACRO_NAME_COLLISION));
}

#[test]
fn macro_parameter_outside_body() {
    let output = assemble("ld a,{{loose}}");
    assert!(has_code(&output, codes::MACRO_PARAM_OUTSIDE));
}

#[test]
fn nested_macro_invocation() {
    let source = "\
One: .macro(v)
  defb {{v}}
.endm
Three: .macro(v)
  One({{v}})
  One({{v}}+1)
  One({{v}}+2)
.endm
Three(5)";
    assert_eq!(bytes_of(source), vec![5, 6, 7]);
}

// ---- structs ------------------------------------------------------------

#[test]
fn struct_fields_have_monotonic_offsets() {
    let source = "\
Rec: .struct
  first  .defb 0
  second .defw 0
  third  .defs 4
  fourth .defb 0
.ends
defb Rec.first, Rec.second, Rec.third, Rec.fourth, Rec";
    assert_eq!(bytes_of(source), vec![0, 1, 3, 7, 8]);
}

#[test]
fn struct_default_pattern_comes_from_body() {
    let source = "\
Pair: .struct
  lo .defb $AA
  hi .defb $BB
.ends
Pair()";
    assert_eq!(bytes_of(source), vec![0xAA, 0xBB]);
}

#[test]
fn struct_field_override_patches_bytes() {
    let source = "\
Pair: .struct
  lo .defb 0
  hi .defw $FFFF
.ends
Pair()
  hi = $0102
nop";
    assert_eq!(bytes_of(source), vec![0x00, 0x02, 0x01, 0x00]);
}

#[test]
fn struct_unknown_field_is_diagnosed() {
    let source = "S1: .struct\n f1 .defb 0\n.ends\nS1()\n nothere = 1";
    let output = assemble(source);
    assert!(has_code(&output, codes::STRUCT_FIELD_UNKNOWN));
}

#[test]
fn struct_field_override_accepts_forward_refs() {
    let source = "\
S2: .struct
  fld .defw 0
.ends
org $8000
S2()
  fld = late
late: .equ $1234";
    assert_eq!(bytes_of(source), vec![0x34, 0x12]);
}

// ---- model gating -------------------------------------------------------

#[test]
fn next_instructions_require_next_model() {
    let output = assemble("swapnib");
    assert!(has_code(&output, codes::NEXT_ONLY));

    let output = assemble(".model NEXT\nswapnib\nmul d,e\npixelad");
    assert!(!output.failed);
    assert_eq!(
        first_bytes(&output),
        vec![0xED, 0x23, 0xED, 0x30, 0xED, 0x94]
    );
}

#[test]
fn cli_model_preset_enables_next() {
    let output = assemble_next("nextreg 7,2");
    assert!(!output.failed);
    assert_eq!(first_bytes(&output), vec![0xED, 0x91, 0x07, 0x02]);
}

// ---- operand diagnostics ------------------------------------------------

#[test]
fn invalid_operand_combination_names_mnemonic() {
    let output = assemble("ld (bc),c");
    assert!(has_code(&output, codes::INVALID_OPERANDS));
    let diag = &output.diagnostics[0];
    assert!(diag.message.contains("LD"), "message: {}", diag.message);
    assert_eq!(diag.token, "ld");
}

#[test]
fn register_indirect_must_be_hl() {
    let output = assemble("inc (de)");
    assert!(has_code(&output, codes::REG_INDIRECT_HL_ONLY));
}

#[test]
fn bit_index_out_of_range() {
    let output = assemble("set 8,b");
    assert!(has_code(&output, codes::BIT_INDEX_RANGE));
}

// ---- outputs ------------------------------------------------------------

#[test]
fn listing_records_byte_ranges() {
    let output = assemble_ok("org $9000\nld a,b\nld a,5\nhalt");
    assert_eq!(output.listing.len(), 3);
    assert_eq!(output.listing[0].address, 0x9000);
    assert_eq!(output.listing[0].range, (0, 1));
    assert_eq!(output.listing[1].address, 0x9001);
    assert_eq!(output.listing[1].range, (1, 3));
    assert_eq!(output.listing[2].address, 0x9003);
    assert_eq!(output.listing[2].line, 4);
}

#[test]
fn source_map_is_bidirectional() {
    let output = assemble_ok("org $9000\nld a,b\nld a,5");
    assert_eq!(output.source_map.source_of(0x9000), Some((0, 2)));
    assert_eq!(output.source_map.source_of(0x9001), Some((0, 3)));
    assert_eq!(output.source_map.addresses_of(0, 3), &[0x9001]);
}

#[test]
fn loop_lines_map_to_every_iteration_address() {
    let output = assemble_ok("org $8000\n.loop 3\ndefb 0\n.endl");
    assert_eq!(
        output.source_map.addresses_of(0, 3),
        &[0x8000, 0x8001, 0x8002]
    );
}

#[test]
fn outputs_survive_failure() {
    let output = assemble("org $8000\nnop\ndefb missing_sym");
    assert!(output.failed);
    assert_eq!(output.segments[0].emitted.len(), 2);
    assert!(!output.listing.is_empty());
    assert!(!output.source_map.is_empty());
}

#[test]
fn symbol_usage_counts_are_exported() {
    let output = assemble_ok("used3: .equ 5\ndefb used3, used3, used3\nunused: .equ 6");
    let used = output
        .symbols
        .iter()
        .find(|s| s.name == "used3")
        .expect("used symbol");
    assert_eq!(used.usage_count, 3);
    let unused = output
        .symbols
        .iter()
        .find(|s| s.name == "unused")
        .expect("unused symbol");
    assert_eq!(unused.usage_count, 0);
}

#[test]
fn module_symbols_export_qualified_names() {
    let output = assemble_ok(".module Outer\nval: .equ 1\n.endmodule");
    assert!(output.symbols.iter().any(|s| s.name == "Outer.val"));
}

#[test]
fn diagnostics_carry_location() {
    let output = assemble("nop\nld (bc),c");
    let diag = &output.diagnostics[0];
    assert_eq!(diag.line, 2);
    assert_eq!(diag.file_index, 0);
}

// ---- expressions in context ---------------------------------------------

#[test]
fn ternary_and_functions_in_operands() {
    assert_eq!(bytes_of("defb 1 > 0 ? $10 : $20"), vec![0x10]);
    assert_eq!(bytes_of("defb max(3, min(9, 5))"), vec![5]);
}

#[test]
fn real_arithmetic_truncates_on_emission() {
    assert_eq!(bytes_of("defb 7 / 2.0 + 0.5"), vec![4]);
}

#[test]
fn division_by_zero_is_reported() {
    let output = assemble("defb 1 / 0");
    assert!(has_code(&output, codes::EXPRESSION_ERROR));
}

#[test]
fn loop_counter_in_expressions() {
    assert_eq!(
        bytes_of(".loop 2\ndefw $cnt * $100\n.endl"),
        vec![0x00, 0x01, 0x00, 0x02]
    );
}

#[test]
fn value_kinds_round_trip_through_symbols() {
    let output = assemble_ok("flag: .equ 1 == 1\ntext: .equ \"hi\"\ndefb flag\ndefb len(text)");
    assert_eq!(first_bytes(&output), vec![1, 2]);
    let text = output
        .symbols
        .iter()
        .find(|s| s.name == "text")
        .expect("text symbol");
    assert_eq!(text.value, Value::Str("hi".to_string()));
}
