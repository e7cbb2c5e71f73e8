//! # domprof - Main Entry Point
//!
//! `domprof [options] <OUTFILE|-> <DOMID>`
//!
//! Validates arguments, opens the trace output, loads the optional symbol
//! table, runs the pre-flight checks, opens the privcmd session and hands
//! everything to [`domprof::profiling::trace_domain`]. Every failure class
//! maps to its own exit code (see [`domprof::domain::errors`]).

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use domprof::cli::{Args, TraceConfig};
use domprof::domain::errors::{EXIT_ERROR, EXIT_SHUT_DOWN, EXIT_SUCCESS};
use domprof::domain::TraceError;
use domprof::profiling::{RunOutcome, TraceSummary};
use domprof::symbolization::load_symbol_table;

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    std::process::exit(match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

/// `warn` by default, `info` with `-v`; `RUST_LOG` wins over both
fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<TraceError>().map_or(EXIT_ERROR, TraceError::exit_code)
}

fn run(args: Args) -> Result<i32> {
    let config = TraceConfig::from_args(args)?;
    let out = config.output.open()?;
    let symbols = config.symbol_table.as_deref().and_then(load_symbol_table);
    if let Some(table) = &symbols {
        info!("Loaded {} symbols", table.len());
    }

    let summary = trace(&config, out, symbols.as_ref())?;
    match summary.outcome {
        RunOutcome::Completed => Ok(EXIT_SUCCESS),
        RunOutcome::DomainShutDown => {
            eprintln!("{}", TraceError::DomainShutDown(config.domain));
            Ok(EXIT_SHUT_DOWN)
        }
    }
}

#[cfg(target_os = "linux")]
fn trace(
    config: &TraceConfig,
    out: Box<dyn std::io::Write>,
    symbols: Option<&domprof::symbolization::SymbolTable>,
) -> Result<TraceSummary> {
    use domprof::hypervisor::xen::{XenSession, PRIVCMD_PATH};
    use domprof::preflight::run_preflight_checks;
    use domprof::profiling::{trace_domain, MonotonicClock};

    run_preflight_checks(PRIVCMD_PATH)
        .map_err(|e| TraceError::HypervisorUnavailable(format!("{e:#}")))?;
    let session = XenSession::open(config.domctl_version)
        .map_err(|e| TraceError::HypervisorUnavailable(e.to_string()))?;

    let result = trace_domain(&session, config, out, symbols, MonotonicClock::new());
    if let Err(e) = session.close() {
        warn!("Failed to close hypervisor session: {e}");
    }
    Ok(result?)
}

#[cfg(not(target_os = "linux"))]
fn trace(
    _config: &TraceConfig,
    _out: Box<dyn std::io::Write>,
    _symbols: Option<&domprof::symbolization::SymbolTable>,
) -> Result<TraceSummary> {
    Err(TraceError::HypervisorUnavailable("Xen domain control requires a Linux control domain".into()).into())
}
