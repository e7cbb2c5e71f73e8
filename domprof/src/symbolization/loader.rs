//! Symbol table loading
//!
//! Accepts `nm -n` style text (`<hex address> <type> <name>` per line) or an
//! ELF image, detected by its magic bytes.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use object::{Object, ObjectSymbol, SymbolKind};

use super::symbol_table::{SymbolTable, SymbolTableBuilder};
use crate::domain::SymbolTableError;

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Load a symbol table, or `None` if the file yields no usable symbols
///
/// Failures are logged; tracing continues with raw addresses.
#[must_use]
pub fn load_symbol_table(path: &Path) -> Option<SymbolTable> {
    match read_symbol_table(path) {
        Ok(table) => {
            debug!("Loaded {} symbols from {}", table.len(), path.display());
            Some(table)
        }
        Err(e) => {
            warn!("Will not resolve symbols from {}: {e}", path.display());
            None
        }
    }
}

/// Read and parse a symbol file
///
/// # Errors
/// Returns an error if the file cannot be read, is a malformed ELF image, or
/// contains no valid symbols
pub fn read_symbol_table(path: &Path) -> Result<SymbolTable, SymbolTableError> {
    let data = fs::read(path)?;
    if data.starts_with(ELF_MAGIC) {
        parse_elf_symbols(&data)
    } else {
        parse_nm_symbols(&String::from_utf8_lossy(&data))
    }
}

/// Parse `nm` output
///
/// Lines without an address (undefined symbols) or without a name are
/// skipped. Unsorted input is sorted rather than rejected.
///
/// # Errors
/// Returns [`SymbolTableError::Empty`] if no line is valid
pub fn parse_nm_symbols(text: &str) -> Result<SymbolTable, SymbolTableError> {
    let mut symbols: Vec<(u64, &str)> = Vec::new();
    let mut skipped = 0usize;
    for line in text.lines() {
        match parse_nm_line(line) {
            Some(symbol) => symbols.push(symbol),
            None if line.trim().is_empty() => {}
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("Skipped {skipped} malformed symbol lines");
    }
    build(symbols)
}

fn parse_nm_line(line: &str) -> Option<(u64, &str)> {
    let (address, rest) = line.split_once(' ')?;
    let address = u64::from_str_radix(address.trim_start_matches("0x"), 16).ok()?;
    let mut chars = rest.chars();
    let kind = chars.next()?;
    if kind.is_whitespace() || chars.next() != Some(' ') {
        return None;
    }
    let name = chars.as_str().trim_end();
    if name.is_empty() {
        return None;
    }
    Some((address, name))
}

/// Collect function symbols from an ELF image
///
/// # Errors
/// Returns [`SymbolTableError::Elf`] for an unparsable image and
/// [`SymbolTableError::Empty`] if it has no function symbols
pub fn parse_elf_symbols(data: &[u8]) -> Result<SymbolTable, SymbolTableError> {
    let file = object::File::parse(data).map_err(|e| SymbolTableError::Elf(e.to_string()))?;
    let symbols = file
        .symbols()
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.address() != 0)
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            (!name.is_empty()).then_some((symbol.address(), name))
        })
        .collect();
    build(symbols)
}

fn build(mut symbols: Vec<(u64, &str)>) -> Result<SymbolTable, SymbolTableError> {
    if symbols.is_empty() {
        return Err(SymbolTableError::Empty);
    }
    if !symbols.is_sorted_by_key(|&(address, _)| address) {
        debug!("Symbol input is not sorted by address, sorting");
        symbols.sort_by_key(|&(address, _)| address);
    }
    symbols.dedup_by_key(|&mut (address, _)| address);

    let mut builder = SymbolTableBuilder::with_capacity(symbols.len());
    for (address, name) in symbols {
        builder.push(address, name)?;
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_nm_output() {
        let text = "\
0000000000001000 T _start
0000000000001040 t helper function
                 U external_symbol
0000000000001100 T main
";
        let table = parse_nm_symbols(text).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.entries()[1].name, "helper function");
        assert_eq!(table.resolve(0x1104).to_string(), "main+0x4");
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let table = parse_nm_symbols("2000 T b\n1000 T a\n1000 W a_alias\n").unwrap();
        let addresses: Vec<u64> = table.entries().iter().map(|e| e.address).collect();
        assert_eq!(addresses, vec![0x1000, 0x2000]);
    }

    #[test]
    fn test_garbage_yields_empty_error() {
        assert!(matches!(parse_nm_symbols(""), Err(SymbolTableError::Empty)));
        assert!(matches!(
            parse_nm_symbols("not a symbol\nzzzz T nope\n1000\n1000 T\n"),
            Err(SymbolTableError::Empty)
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ffffffff81000000 T startup_64").unwrap();
        writeln!(file, "ffffffff81000100 T secondary_startup_64").unwrap();

        let table = load_symbol_table(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve(0xffff_ffff_8100_0101).to_string(), "secondary_startup_64+0x1");
    }

    #[test]
    fn test_load_missing_or_malformed_disables_resolution() {
        assert!(load_symbol_table(Path::new("/nonexistent/System.map")).is_none());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not a symbol table").unwrap();
        assert!(load_symbol_table(file.path()).is_none());
    }

    #[test]
    fn test_truncated_elf_is_rejected() {
        let err = parse_elf_symbols(b"\x7fELF\x02\x01").unwrap_err();
        assert!(matches!(err, SymbolTableError::Elf(_)));
    }
}
