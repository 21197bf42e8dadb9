// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for nexforge.

fn main() {
    let use_color = std::env::var("NO_COLOR").is_err();
    match nexforge::assembler::cli::run() {
        Ok(reports) => {
            let mut failed = false;
            for report in &reports {
                for diag in &report.diagnostics {
                    eprintln!(
                        "{}",
                        diag.format_with_context(
                            Some(report.file_name.as_str()),
                            Some(report.source_lines.as_slice()),
                            use_color
                        )
                    );
                }
                failed |= report.failed;
            }
            if failed {
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
