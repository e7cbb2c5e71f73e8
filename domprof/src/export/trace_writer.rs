//! Trace file writer
//!
//! ```text
//! #domprof guest stack trace
//! #tracing domain 7 on 2026-10-16 14:02:11 CEST (+0200)
//!
//! 0xffffffff81012345          one line per frame, innermost first
//! schedule+0x3c               (resolved when a symbol table is loaded)
//! 1                           1 = walk finished, 0 = walk aborted
//!                             blank line ends the stack
//! ```

use std::ffi::CStr;
use std::io::{self, BufWriter, Write};

use crate::domain::DomainId;
use crate::profiling::stack_walker::StackTrace;
use crate::symbolization::SymbolTable;

/// First header line, identifies the format
pub const TRACE_MAGIC: &str = "#domprof guest stack trace";

/// Buffered writer for the trace format
pub struct TraceWriter<W: Write> {
    out: BufWriter<W>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out: BufWriter::new(out) }
    }

    /// Write the comment header and the separating blank line
    ///
    /// # Errors
    /// Returns any I/O error from the underlying writer
    pub fn write_header(&mut self, domain: DomainId, timestamp: &str) -> io::Result<()> {
        writeln!(self.out, "{TRACE_MAGIC}")?;
        writeln!(self.out, "#tracing domain {} on {timestamp}", domain.0)?;
        writeln!(self.out)
    }

    /// Write one stack, its terminator and a blank line
    ///
    /// # Errors
    /// Returns any I/O error from the underlying writer
    pub fn write_stack(&mut self, trace: &StackTrace, symbols: Option<&SymbolTable>) -> io::Result<()> {
        for &address in &trace.frames {
            match symbols {
                Some(table) => writeln!(self.out, "{}", table.resolve(address))?,
                None => writeln!(self.out, "{address:#x}")?,
            }
        }
        writeln!(self.out, "{}", trace.outcome.terminator())?;
        writeln!(self.out)
    }

    /// Flush and hand back the underlying writer
    ///
    /// # Errors
    /// Returns the flush error if buffered data cannot be written
    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(io::IntoInnerError::into_error)
    }
}

/// Current local time, e.g. `2026-10-16 14:02:11 CEST (+0200)`
#[allow(unsafe_code)] // time/localtime_r/strftime
#[must_use]
pub fn local_timestamp() -> String {
    let mut buf = [0 as libc::c_char; 64];
    // SAFETY: tm is fully written by localtime_r before strftime reads it,
    // and strftime never writes more than buf.len() bytes
    let written = unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&raw const now, &raw mut tm).is_null() {
            return format!("unix time {now}");
        }
        libc::strftime(buf.as_mut_ptr(), buf.len(), c"%Y-%m-%d %H:%M:%S %Z (%z)".as_ptr(), &raw const tm)
    };
    if written == 0 {
        return String::from("unknown time");
    }
    // SAFETY: strftime returned a non-zero length, so buf holds a NUL-terminated string
    unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiling::stack_walker::WalkOutcome;
    use crate::symbolization::SymbolTableBuilder;

    fn written(f: impl FnOnce(&mut TraceWriter<Vec<u8>>)) -> String {
        let mut writer = TraceWriter::new(Vec::new());
        f(&mut writer);
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn test_header() {
        let text = written(|w| w.write_header(DomainId(7), "now").unwrap());
        assert_eq!(text, "#domprof guest stack trace\n#tracing domain 7 on now\n\n");
    }

    #[test]
    fn test_raw_stack() {
        let trace = StackTrace { frames: vec![0xffff_ffff_8100_0010, 0x4000], outcome: WalkOutcome::Done };
        let text = written(|w| w.write_stack(&trace, None).unwrap());
        assert_eq!(text, "0xffffffff81000010\n0x4000\n1\n\n");
    }

    #[test]
    fn test_resolved_and_aborted_stack() {
        let mut builder = SymbolTableBuilder::with_capacity(2);
        builder.push(0x1000, "main").unwrap();
        builder.push(0x2000, "worker").unwrap();
        let table = builder.finish();

        let trace = StackTrace { frames: vec![0x2010, 0x1000, 0x10], outcome: WalkOutcome::Aborted };
        let text = written(|w| w.write_stack(&trace, Some(&table)).unwrap());
        assert_eq!(text, "worker+0x10\nmain\n0x10\n0\n\n");
    }

    #[test]
    fn test_local_timestamp_shape() {
        let stamp = local_timestamp();
        assert!(stamp.len() >= "2026-01-01 00:00:00".len());
        assert_eq!(stamp.as_bytes()[4], b'-');
    }
}
