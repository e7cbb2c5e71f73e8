//! Command-line interface: argument parsing and validated configuration

pub mod args;
pub mod config;

pub use args::{Args, SymbolizeArgs};
pub use config::{OutputTarget, TraceConfig};
