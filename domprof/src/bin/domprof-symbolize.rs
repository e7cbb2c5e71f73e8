//! # domprof-symbolize
//!
//! `domprof-symbolize [--demangle] <SYMBOL_TABLE> <TRACE_FILE>`
//!
//! Resolves the raw addresses of a recorded trace and writes the result to
//! standard output. Exit code 1 for usage errors, 2 if an input cannot be
//! read.

use std::fs::File;
use std::io::{self, BufReader};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use domprof::cli::SymbolizeArgs;
use domprof::export::symbolize_trace;
use domprof::symbolization::read_symbol_table;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_INPUT: i32 = 2;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match SymbolizeArgs::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => {
            // --help / --version
            let _ = e.print();
            std::process::exit(EXIT_SUCCESS);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    std::process::exit(match run(&args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_INPUT
        }
    });
}

fn run(args: &SymbolizeArgs) -> Result<()> {
    let table = read_symbol_table(&args.symbol_table)
        .with_context(|| format!("Cannot read symbol table {}", args.symbol_table.display()))?;
    let trace = File::open(&args.trace)
        .with_context(|| format!("Cannot open trace file {}", args.trace.display()))?;

    let stdout = io::stdout().lock();
    let stats = symbolize_trace(BufReader::new(trace), stdout, &table, args.demangle)
        .with_context(|| format!("Failed to symbolize {}", args.trace.display()))?;
    info!(
        "{} lines, {} addresses resolved, {} below the first symbol",
        stats.lines, stats.resolved, stats.unresolved
    );
    Ok(())
}
