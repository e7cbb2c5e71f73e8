//! Offline symbolization of a recorded trace
//!
//! Rewrites raw hex frame lines with the same floor lookup the live tracer
//! uses. Header comments, blank separators, terminators and lines that are
//! already symbolic pass through untouched.

use std::io::{self, BufRead, Write};

use rustc_demangle::demangle;

use crate::symbolization::{Resolution, SymbolTable};

/// Line counters of one post-processing run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolizeStats {
    pub lines: u64,
    pub resolved: u64,
    /// Raw addresses below the first symbol
    pub unresolved: u64,
}

/// Copy `input` to `output`, resolving raw addresses
///
/// # Errors
/// Returns the first read or write error
pub fn symbolize_trace<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    table: &SymbolTable,
    demangle_names: bool,
) -> io::Result<SymbolizeStats> {
    let mut stats = SymbolizeStats::default();
    for line in input.lines() {
        let line = line?;
        stats.lines += 1;

        let Some(address) = frame_address(&line) else {
            writeln!(output, "{line}")?;
            continue;
        };
        match table.resolve(address) {
            Resolution::Raw(_) => {
                stats.unresolved += 1;
                writeln!(output, "{line}")?;
            }
            Resolution::Exact(name) => {
                stats.resolved += 1;
                writeln!(output, "{}", display_name(name, demangle_names))?;
            }
            Resolution::Offset(name, offset) => {
                stats.resolved += 1;
                writeln!(output, "{}+{offset:#x}", display_name(name, demangle_names))?;
            }
        }
    }
    output.flush()?;
    Ok(stats)
}

/// Address of a raw frame line; `None` for markers and symbolic lines
fn frame_address(line: &str) -> Option<u64> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with('#') || line == "0" || line == "1" {
        return None;
    }
    let digits = line.strip_prefix("0x").or_else(|| line.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

fn display_name(name: &str, demangle_names: bool) -> String {
    if demangle_names {
        format!("{:#}", demangle(name))
    } else {
        name.to_string()
    }
}
