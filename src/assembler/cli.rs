// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Command-line interface parsing and argument validation.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};

use crate::assembler::error::Diagnostic;
use crate::assembler::listing::{write_segment_bin, ListingWriter};
use crate::assembler::{assemble, AssemblerOptions, SpectrumModel};
use crate::core::parser::SourceFile;

pub const VERSION: &str = "0.9";

const LONG_ABOUT: &str = "Z80 / Spectrum Next assembler with modules, macros and structs.

Outputs are opt-in: specify at least one of -b/--bin, -l/--list or
-s/--sym. Use -o/--outfile to set the output base name when filenames
are omitted. With multiple segments, binary outputs are named
<base>-<start>.bin.";

#[derive(Parser, Debug)]
#[command(
    name = "nexforge",
    version = VERSION,
    about = "Z80 / Spectrum Next assembler",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    #[arg(
        short = 'b',
        long = "bin",
        action = ArgAction::SetTrue,
        long_help = "Emit one raw binary file per output segment, named <base>.bin or <base>-<start>.bin."
    )]
    pub bin: bool,
    #[arg(
        short = 'l',
        long = "list",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit a listing file. FILE is optional; when omitted, the output base is used and a .lst extension is added."
    )]
    pub list_name: Option<String>,
    #[arg(
        short = 's',
        long = "sym",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit a symbol dump. FILE is optional; when omitted, the output base is used and a .sym extension is added."
    )]
    pub sym_name: Option<String>,
    #[arg(
        short = 'o',
        long = "outfile",
        value_name = "BASE",
        long_help = "Output filename base when -b/-l/-s omit filenames. Defaults to the input base."
    )]
    pub outfile: Option<String>,
    #[arg(
        short = 'm',
        long = "model",
        value_name = "MODEL",
        long_help = "Preset Spectrum model: SPECTRUM48, SPECTRUM128, SPECTRUMP3 or NEXT. A MODEL pragma in the source overrides it."
    )]
    pub model: Option<String>,
    #[arg(
        long = "org",
        value_name = "aaaa",
        long_help = "Default origin as 4 hex digits, used before the first ORG. Defaults to 8000."
    )]
    pub org: Option<String>,
    #[arg(
        short = 't',
        long = "trace",
        action = ArgAction::SetTrue,
        long_help = "Print TRACE pragma messages to stderr."
    )]
    pub show_trace: bool,
    #[arg(
        short = 'i',
        long = "infile",
        value_name = "FILE",
        action = ArgAction::Append,
        required = true,
        long_help = "Input assembly file (repeatable)."
    )]
    pub infiles: Vec<PathBuf>,
}

/// Report of one input file's run, for the caller to print.
pub struct RunReport {
    pub file_name: String,
    pub source_lines: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub failed: bool,
}

#[derive(Debug)]
pub struct CliError {
    pub message: String,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

fn cli_error(message: impl Into<String>) -> CliError {
    CliError {
        message: message.into(),
    }
}

pub fn is_valid_hex_4(s: &str) -> bool {
    s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Translate CLI arguments into assembler options.
pub fn validate_cli(cli: &Cli) -> Result<AssemblerOptions, CliError> {
    let mut options = AssemblerOptions::default();
    if let Some(model) = &cli.model {
        options.model = Some(
            SpectrumModel::parse(model)
                .ok_or_else(|| cli_error(format!("Unknown model '{model}'")))?,
        );
    }
    if let Some(org) = &cli.org {
        if !is_valid_hex_4(org) {
            return Err(cli_error(format!(
                "Invalid --org '{org}', expected 4 hex digits"
            )));
        }
        options.default_start =
            u16::from_str_radix(org, 16).map_err(|_| cli_error("Invalid --org value"))?;
    }
    Ok(options)
}

pub fn input_base_from_path(path: &Path) -> Result<(String, String), CliError> {
    let name = path.to_string_lossy().to_string();
    let base = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| cli_error(format!("Invalid input filename '{name}'")))?
        .to_string();
    Ok((name, base))
}

pub fn resolve_output_path(base: &str, chosen: Option<String>, extension: &str) -> Option<String> {
    match chosen {
        Some(name) if name.is_empty() => Some(format!("{base}.{extension}")),
        Some(name) => Some(name),
        None => None,
    }
}

/// Run the assembler over every input file.
pub fn run() -> Result<Vec<RunReport>, CliError> {
    let cli = Cli::parse();
    let options = validate_cli(&cli)?;

    let mut reports = Vec::new();
    for path in &cli.infiles {
        let (name, base) = input_base_from_path(path)?;
        let out_base = cli.outfile.clone().unwrap_or(base);
        let text = fs::read_to_string(path)
            .map_err(|err| cli_error(format!("Cannot read '{name}': {err}")))?;
        let file = SourceFile::new(name.clone(), &text);
        let source_lines = file.lines.clone();

        let output = assemble(vec![file], options.clone());

        if cli.bin && !output.failed {
            let multiple = output.segments.len() > 1;
            for segment in &output.segments {
                let bin_name = if multiple {
                    format!("{out_base}-{:04X}.bin", segment.start_address)
                } else {
                    format!("{out_base}.bin")
                };
                let file = File::create(&bin_name)
                    .map_err(|err| cli_error(format!("Cannot create '{bin_name}': {err}")))?;
                write_segment_bin(file, segment)
                    .map_err(|err| cli_error(format!("Cannot write '{bin_name}': {err}")))?;
            }
        }

        if let Some(list_path) = resolve_output_path(&out_base, cli.list_name.clone(), "lst") {
            let file = File::create(&list_path)
                .map_err(|err| cli_error(format!("Cannot create '{list_path}': {err}")))?;
            let mut listing = ListingWriter::new(file);
            let title = format!("nexforge Z80 Assembler v{VERSION}");
            let files = [SourceFile {
                name: name.clone(),
                lines: source_lines.clone(),
            }];
            listing
                .header(&title)
                .and_then(|()| listing.write_output(&output, &files))
                .and_then(|()| listing.footer(&output))
                .map_err(|err| cli_error(format!("Cannot write '{list_path}': {err}")))?;
        }

        if let Some(sym_path) = resolve_output_path(&out_base, cli.sym_name.clone(), "sym") {
            let mut text = String::new();
            for symbol in &output.symbols {
                if let Some(value) = symbol.value.as_int() {
                    text.push_str(&format!("{:04X} {}\n", value as u16, symbol.name));
                }
            }
            fs::write(&sym_path, text)
                .map_err(|err| cli_error(format!("Cannot write '{sym_path}': {err}")))?;
        }

        if cli.show_trace {
            for message in &output.trace_messages {
                eprintln!("TRACE {}:{}: {}", name, message.line, message.text);
            }
        }

        reports.push(RunReport {
            file_name: name,
            source_lines,
            diagnostics: output.diagnostics,
            failed: output.failed,
        });
    }

    Ok(reports)
}
