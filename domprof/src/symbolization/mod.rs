//! # Symbol Resolution
//!
//! Turns raw guest instruction addresses into `name` or `name+0xOFFSET`.
//!
//! ## Where Symbols Come From
//!
//! A traced guest is usually a unikernel or a kernel image, linked at a fixed
//! address. There is no ASLR to undo and no `/proc/<pid>/maps` to consult: the
//! addresses captured from the guest are the link-time addresses. A plain
//! sorted symbol list is enough.
//!
//! Two inputs are accepted ([`load_symbol_table`]):
//!
//! ```text
//! nm -n guest.elf > guest.syms        # text, one symbol per line
//! ffffffff81000000 T startup_64
//! ffffffff81000100 T secondary_startup_64
//!
//! guest.elf                           # or the ELF image itself
//! ```
//!
//! Anything unreadable or without a single valid line disables resolution
//! for the run. The trace then carries raw addresses, which
//! `domprof-symbolize` can resolve later.
//!
//! ## Lookup
//!
//! The [`SymbolTable`] is a sorted boxed slice, built once and never
//! modified. Two recursive binary searches run over it:
//!
//! - [`SymbolTable::find_exact`]: the entry at exactly this address
//! - [`SymbolTable::find_not_above`]: the entry with the largest address
//!   `<= key`, i.e. the function an instruction address falls into
//!
//! ```text
//!   entries:   0x1000 foo     0x1080 bar          0x1200 baz
//!                 │              │                   │
//!   key 0x10a4 ───┼──────────────┘ floor = bar, offset 0x24
//!   key 0x0fff ───┘ below the first symbol: unresolved
//! ```
//!
//! [`SymbolTable::resolve`] wraps the floor query into a [`Resolution`]:
//! bare `name` on an exact hit, `name+0xOFFSET` inside a symbol, and the raw
//! hex address below the first symbol. The live tracer and the offline
//! post-processor share this, so both produce identical lines.
//!
//! ## Demangling
//!
//! Rust guests (unikernels built with `no_std` toolchains) carry mangled
//! names. The post-processor demangles on request with `rustc-demangle`.

pub mod loader;
pub mod symbol_table;

pub use loader::{load_symbol_table, read_symbol_table};
pub use symbol_table::{Resolution, SymbolEntry, SymbolTable, SymbolTableBuilder};
