//! CLI argument definitions

use clap::Parser;
use domprof_abi::DEFAULT_DOMCTL_INTERFACE_VERSION;
use std::path::PathBuf;

use crate::memory::DEFAULT_MAX_CACHED_PAGES;
use crate::profiling::stack_walker::DEFAULT_MAX_DEPTH;

#[derive(Parser, Debug)]
#[command(
    name = "domprof",
    about = "Sample the call stacks of a running Xen guest from outside the guest",
    after_help = "\
EXAMPLES:
    sudo domprof trace.txt 7                  Sample domain 7 once per second for 1s
    sudo domprof -F 100 -T 30 - 7             100 Hz for 30s, trace to stdout
    sudo domprof -s guest.syms out.txt 7      Resolve frames while tracing
    domprof-symbolize guest.syms out.txt      Resolve a recorded trace afterwards"
)]
pub struct Args {
    /// Trace output file, or - for standard output
    #[arg(value_name = "OUTFILE")]
    pub output: String,

    /// Id of the domain to trace
    #[arg(value_name = "DOMID")]
    pub domid: u16,

    /// Samples per second
    #[arg(short = 'F', long, default_value_t = 1, value_name = "HZ")]
    pub frequency: u32,

    /// Tracing duration in seconds
    #[arg(short = 'T', long = "time", default_value_t = 1, value_name = "SECONDS")]
    pub time: u32,

    /// Warn on stderr whenever a sample misses its deadline
    #[arg(short = 'M', long)]
    pub missed_deadlines: bool,

    /// Resolve addresses with this symbol table (nm -n output or ELF image)
    #[arg(short, long, value_name = "TAB")]
    pub symbol_table: Option<PathBuf>,

    /// Log progress and timing information
    #[arg(short, long)]
    pub verbose: bool,

    /// Stop walking a stack after this many frames
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH, value_name = "FRAMES")]
    pub max_depth: usize,

    /// Upper bound on guest pages kept mapped
    #[arg(long, default_value_t = DEFAULT_MAX_CACHED_PAGES, value_name = "PAGES")]
    pub max_cached_pages: usize,

    /// Xen domctl interface version (must match the running hypervisor)
    #[arg(
        long,
        value_parser = parse_u32_auto_radix,
        default_value_t = DEFAULT_DOMCTL_INTERFACE_VERSION,
        value_name = "VERSION"
    )]
    pub domctl_version: u32,
}

/// Arguments of the offline post-processor
#[derive(Parser, Debug)]
#[command(
    name = "domprof-symbolize",
    about = "Resolve raw addresses in a domprof trace, writing to stdout"
)]
pub struct SymbolizeArgs {
    /// Symbol table (nm -n output or ELF image)
    #[arg(value_name = "SYMBOL_TABLE")]
    pub symbol_table: PathBuf,

    /// Trace recorded by domprof
    #[arg(value_name = "TRACE_FILE")]
    pub trace: PathBuf,

    /// Demangle Rust symbol names
    #[arg(long)]
    pub demangle: bool,
}

fn parse_u32_auto_radix(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["domprof", "out.txt", "7"]).unwrap();
        assert_eq!(args.output, "out.txt");
        assert_eq!(args.domid, 7);
        assert_eq!((args.frequency, args.time), (1, 1));
        assert!(!args.missed_deadlines);
        assert_eq!(args.domctl_version, DEFAULT_DOMCTL_INTERFACE_VERSION);
        assert_eq!(args.max_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn test_short_flags() {
        let args = Args::try_parse_from([
            "domprof", "-F", "250", "-T", "10", "-M", "-s", "guest.syms", "-v", "-", "3",
        ])
        .unwrap();
        assert_eq!((args.frequency, args.time), (250, 10));
        assert!(args.missed_deadlines && args.verbose);
        assert_eq!(args.symbol_table, Some(PathBuf::from("guest.syms")));
        assert_eq!(args.output, "-");
    }

    #[test]
    fn test_rejects_bad_domid() {
        assert!(Args::try_parse_from(["domprof", "out", "dom7"]).is_err());
        assert!(Args::try_parse_from(["domprof", "out", "70000"]).is_err());
        assert!(Args::try_parse_from(["domprof", "out"]).is_err());
    }

    #[test]
    fn test_domctl_version_radix() {
        assert_eq!(parse_u32_auto_radix("0x12"), Ok(0x12));
        assert_eq!(parse_u32_auto_radix("18"), Ok(18));
        assert!(parse_u32_auto_radix("x").is_err());
    }

    #[test]
    fn test_symbolize_args() {
        let args = SymbolizeArgs::try_parse_from(["domprof-symbolize", "--demangle", "a.syms", "t.txt"])
            .unwrap();
        assert!(args.demangle);
        assert_eq!(args.trace, PathBuf::from("t.txt"));
    }
}
