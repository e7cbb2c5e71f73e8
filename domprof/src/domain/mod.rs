//! Domain model for domprof
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern (a VCPU index is not a domain id)
//! - Word-size aware guest address arithmetic
//! - Structured error handling with stable exit codes

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{DomainId, GuestArch, Mfn, VcpuId, WordSize};

pub use errors::{HypervisorError, SymbolTableError, TraceError, TranslateError};
