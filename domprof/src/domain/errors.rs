//! Structured error types for domprof
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Fatal conditions surface as [`TraceError`], which owns the process exit
//! code for each failure class.

use super::types::{DomainId, Mfn, VcpuId};
use thiserror::Error;

// Exit codes
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_OUTPUT: i32 = 3;
pub const EXIT_HYPERVISOR: i32 = 4;
pub const EXIT_DOMAIN: i32 = 5;
pub const EXIT_WORD_SIZE: i32 = 6;
pub const EXIT_PAUSE: i32 = 7;
pub const EXIT_SHUT_DOWN: i32 = 8;

/// Failures talking to the hypervisor
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Cannot open {path}: {source}")]
    Open { path: String, source: std::io::Error },

    #[error("Failed to allocate locked hypercall buffer: {0}")]
    Buffer(std::io::Error),

    #[error("Failed to close hypervisor session: {0}")]
    Close(std::io::Error),

    #[error("{op} hypercall failed for {domain}: {source}")]
    Hypercall { op: &'static str, domain: DomainId, source: std::io::Error },

    #[error("{0} does not exist")]
    DomainNotFound(DomainId),

    #[error("{vcpu} of {domain} is not available")]
    VcpuUnavailable { domain: DomainId, vcpu: VcpuId },

    #[error("Failed to map {mfn} of {domain}: {reason}")]
    MapFailed { domain: DomainId, mfn: Mfn, reason: String },

    #[error("Unexpected word size ({0} bytes)")]
    UnsupportedWordSize(u32),
}

/// Guest virtual to machine address translation failures
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("Page fault at level {level} translating {vaddr:#x}")]
    PageFault { level: u8, vaddr: u64 },

    #[error("Reserved descriptor {descriptor:#x} translating {vaddr:#x}")]
    ReservedDescriptor { descriptor: u32, vaddr: u64 },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

/// Symbol table construction failures
#[derive(Error, Debug)]
pub enum SymbolTableError {
    #[error("Symbol table is full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    #[error("Symbol at {key:#x} follows {previous:#x}; entries must be sorted")]
    OutOfOrder { previous: u64, key: u64 },

    #[error("No valid symbols found")]
    Empty,

    #[error("Failed to parse ELF symbols: {0}")]
    Elf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fatal tracing failures, one variant per exit code class
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Cannot open output file {path}: {source}")]
    OutputFile { path: String, source: std::io::Error },

    #[error("Cannot connect to the hypervisor (is this Xen?): {0}")]
    HypervisorUnavailable(String),

    #[error("Could not access information for {domain} (does it exist?): {source}")]
    DomainUnavailable { domain: DomainId, source: HypervisorError },

    #[error("Failed to retrieve word size for {domain}: {source}")]
    WordSizeUnavailable { domain: DomainId, source: HypervisorError },

    #[error("{0} is an HVM guest; only PV guests can be traced")]
    HvmUnsupported(DomainId),

    #[error("Could not pause {domain}: {source}")]
    PauseFailed { domain: DomainId, source: HypervisorError },

    #[error("Could not unpause {domain}: {source}")]
    ResumeFailed { domain: DomainId, source: HypervisorError },

    #[error("{0} shut down while tracing")]
    DomainShutDown(DomainId),

    #[error("Failed to write trace: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    /// Process exit code for this failure class
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceError::InvalidArguments(_) => EXIT_USAGE,
            TraceError::OutputFile { .. } => EXIT_OUTPUT,
            TraceError::HypervisorUnavailable(_) => EXIT_HYPERVISOR,
            TraceError::DomainUnavailable { .. } => EXIT_DOMAIN,
            TraceError::WordSizeUnavailable { .. } | TraceError::HvmUnsupported(_) => {
                EXIT_WORD_SIZE
            }
            TraceError::PauseFailed { .. } | TraceError::ResumeFailed { .. } => EXIT_PAUSE,
            TraceError::DomainShutDown(_) => EXIT_SHUT_DOWN,
            TraceError::Io(_) => EXIT_ERROR,
        }
    }
}
