//! Trace output
//!
//! The live tracer writes the text trace format ([`TraceWriter`]);
//! `domprof-symbolize` resolves raw addresses in a recorded trace afterwards
//! ([`symbolize_trace`]).

pub mod postprocess;
pub mod trace_writer;

pub use postprocess::{symbolize_trace, SymbolizeStats};
pub use trace_writer::{local_timestamp, TraceWriter, TRACE_MAGIC};
