//! Static, sorted symbol table with exact and floor lookups
//!
//! Built once from `(address, name)` pairs in ascending order, then only read.
//! The table never changes after [`SymbolTableBuilder::finish`], which is what
//! keeps the binary searches valid.

use std::fmt;

use crate::domain::SymbolTableError;

/// One symbol: start address and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub address: u64,
    pub name: String,
}

/// Fixed-capacity builder for a [`SymbolTable`]
#[derive(Debug)]
pub struct SymbolTableBuilder {
    entries: Vec<SymbolEntry>,
    capacity: usize,
}

impl SymbolTableBuilder {
    /// Reserve room for exactly `capacity` entries
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), capacity }
    }

    /// Append the next entry
    ///
    /// # Errors
    /// Returns [`SymbolTableError::CapacityExceeded`] once the table is full and
    /// [`SymbolTableError::OutOfOrder`] if `address` is below the previous one
    pub fn push(&mut self, address: u64, name: impl Into<String>) -> Result<(), SymbolTableError> {
        if self.entries.len() >= self.capacity {
            return Err(SymbolTableError::CapacityExceeded { capacity: self.capacity });
        }
        if let Some(previous) = self.entries.last() {
            if address < previous.address {
                return Err(SymbolTableError::OutOfOrder { previous: previous.address, key: address });
            }
        }
        self.entries.push(SymbolEntry { address, name: name.into() });
        Ok(())
    }

    /// Number of entries filled so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> SymbolTable {
        SymbolTable { entries: self.entries.into_boxed_slice() }
    }
}

/// Immutable symbol table sorted by address
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Box<[SymbolEntry]>,
}

impl SymbolTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[SymbolEntry] {
        &self.entries
    }

    /// Entry whose address is exactly `key`
    #[must_use]
    pub fn find_exact(&self, key: u64) -> Option<&SymbolEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.find_exact_in(key, 0, self.entries.len() - 1)
    }

    fn find_exact_in(&self, key: u64, first: usize, last: usize) -> Option<&SymbolEntry> {
        if first > last {
            return None;
        }
        let median = first + (last - first) / 2;
        let (lo, hi, mid) = (&self.entries[first], &self.entries[last], &self.entries[median]);

        if key == lo.address {
            Some(lo)
        } else if key < lo.address {
            None
        } else if key == hi.address {
            Some(hi)
        } else if key > hi.address {
            None
        } else if key == mid.address {
            Some(mid)
        } else if key < mid.address {
            // median > first here, since key > lo.address
            self.find_exact_in(key, first, median - 1)
        } else {
            self.find_exact_in(key, median + 1, last)
        }
    }

    /// Entry with the largest address not above `key`
    #[must_use]
    pub fn find_not_above(&self, key: u64) -> Option<&SymbolEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.find_not_above_in(key, 0, self.entries.len() - 1)
    }

    fn find_not_above_in(&self, key: u64, first: usize, last: usize) -> Option<&SymbolEntry> {
        let lo = &self.entries[first];
        if key < lo.address {
            return None;
        }
        if key >= self.entries[last].address {
            return Some(&self.entries[last]);
        }
        // key lies in [entries[first], entries[last]) so first < last
        if key < self.entries[first + 1].address {
            return Some(lo);
        }
        let median = first + (last - first) / 2;
        if key < self.entries[median].address {
            self.find_not_above_in(key, first, median - 1)
        } else {
            self.find_not_above_in(key, median, last)
        }
    }

    /// Resolve an address against the symbol that contains it
    #[must_use]
    pub fn resolve(&self, address: u64) -> Resolution<'_> {
        match self.find_not_above(address) {
            Some(entry) if entry.address == address => Resolution::Exact(&entry.name),
            Some(entry) => Resolution::Offset(&entry.name, address - entry.address),
            None => Resolution::Raw(address),
        }
    }
}

/// How an address is written to a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// Below the first symbol, or no table
    Raw(u64),
    Exact(&'a str),
    Offset(&'a str, u64),
}

impl fmt::Display for Resolution<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Raw(address) => write!(f, "{address:#x}"),
            Resolution::Exact(name) => f.write_str(name),
            Resolution::Offset(name, offset) => write!(f, "{name}+{offset:#x}"),
        }
    }
}
