//! Validated tracer configuration

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use super::args::Args;
use crate::domain::{DomainId, TraceError};

/// Where the trace goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl OutputTarget {
    /// Create (or truncate) the output
    ///
    /// # Errors
    /// Returns [`TraceError::OutputFile`] if the file cannot be created
    pub fn open(&self) -> Result<Box<dyn Write>, TraceError> {
        match self {
            OutputTarget::Stdout => Ok(Box::new(io::stdout().lock())),
            OutputTarget::File(path) => File::create(path)
                .map(|file| Box::new(file) as Box<dyn Write>)
                .map_err(|source| TraceError::OutputFile { path: path.display().to_string(), source }),
        }
    }
}

/// Everything a tracing run needs, checked for consistency
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub domain: DomainId,
    pub output: OutputTarget,
    pub frequency: u32,
    pub duration_secs: u32,
    pub warn_missed_deadlines: bool,
    pub symbol_table: Option<PathBuf>,
    pub max_depth: usize,
    pub max_cached_pages: usize,
    pub domctl_version: u32,
}

impl TraceConfig {
    /// Validate parsed arguments
    ///
    /// # Errors
    /// Returns [`TraceError::InvalidArguments`] for domain 0 or a zero
    /// frequency, duration, depth or cache size
    pub fn from_args(args: Args) -> Result<Self, TraceError> {
        let domain = DomainId(args.domid);
        if domain.is_control_domain() {
            return Err(TraceError::InvalidArguments(
                "cannot trace domain 0 (the control domain)".to_string(),
            ));
        }
        for (name, value) in [
            ("--frequency", args.frequency as usize),
            ("--time", args.time as usize),
            ("--max-depth", args.max_depth),
            ("--max-cached-pages", args.max_cached_pages),
        ] {
            if value == 0 {
                return Err(TraceError::InvalidArguments(format!("{name} must be greater than 0")));
            }
        }

        let output = if args.output == "-" {
            OutputTarget::Stdout
        } else {
            OutputTarget::File(PathBuf::from(args.output))
        };

        Ok(Self {
            domain,
            output,
            frequency: args.frequency,
            duration_secs: args.time,
            warn_missed_deadlines: args.missed_deadlines,
            symbol_table: args.symbol_table,
            max_depth: args.max_depth,
            max_cached_pages: args.max_cached_pages,
            domctl_version: args.domctl_version,
        })
    }
}
