//! Cache of guest pages mapped into the profiler
//!
//! Keyed by (address-space root, page-aligned guest virtual address). A
//! round touches tens of pages, mostly the same kernel stack pages again and
//! again, so a lookup hit saves a full page-table walk plus a map call.
//!
//! The cache is bounded: when it is full the next insert drops every mapping
//! first. Callers only ever get copies of guest bytes out of [`GuestMemory`]
//! (or borrows that end before the next `&mut self` call), so clearing is
//! always safe.

use std::collections::HashMap;

use domprof_abi::PAGE_SIZE;
use log::debug;

use super::translate::{arm_uses_ttbr1, translate};
use crate::domain::{DomainId, WordSize};
use crate::hypervisor::{Hypervisor, RegisterState, VcpuContext};

/// Default bound on cached page mappings
pub const DEFAULT_MAX_CACHED_PAGES: usize = 4096;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PageKey {
    /// Table base the lookup starts from
    root: u64,
    /// ARM TTBR0/TTBR1 split (`ttbcr.N`), 0 on x86
    split: u32,
    base: u64,
}

/// Page cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Translations or mappings that failed
    pub failures: u64,
    /// Mappings dropped because the cache was full
    pub evictions: u64,
}

/// Read access to the memory of one guest domain
pub struct GuestMemory<'h, H: Hypervisor + ?Sized> {
    hv: &'h H,
    domain: DomainId,
    pages: HashMap<PageKey, H::Page>,
    max_pages: usize,
    stats: CacheStats,
}

impl<'h, H: Hypervisor + ?Sized> GuestMemory<'h, H> {
    #[must_use]
    pub fn new(hv: &'h H, domain: DomainId, max_pages: usize) -> Self {
        Self { hv, domain, pages: HashMap::new(), max_pages: max_pages.max(1), stats: CacheStats::default() }
    }

    #[must_use]
    pub fn hypervisor(&self) -> &'h H {
        self.hv
    }

    #[must_use]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of pages currently mapped
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Bytes from `vaddr` to the end of its page, or `None` if the address
    /// has no mapping
    pub fn resolve(&mut self, ctx: &VcpuContext, vaddr: u64) -> Option<&[u8]> {
        let vaddr = ctx.word_size().truncate(vaddr);
        let base = vaddr & !PAGE_MASK;
        let offset = (vaddr & PAGE_MASK) as usize;
        let key = page_key(ctx, base);

        if self.pages.contains_key(&key) {
            self.stats.hits += 1;
        } else {
            let page = self.map_page(ctx, base)?;
            if self.pages.len() >= self.max_pages {
                debug!("Page cache full ({} pages), dropping all mappings", self.pages.len());
                self.stats.evictions += self.pages.len() as u64;
                self.pages.clear();
            }
            self.stats.misses += 1;
            self.pages.insert(key, page);
        }

        self.pages.get(&key).map(|page| &page.as_ref()[offset..])
    }

    fn map_page(&mut self, ctx: &VcpuContext, base: u64) -> Option<H::Page> {
        let mfn = match translate(self.hv, self.domain, ctx, base) {
            Ok(mfn) => mfn,
            Err(e) => {
                debug!("No mapping for {base:#x} in {}: {e}", self.domain);
                self.stats.failures += 1;
                return None;
            }
        };
        match self.hv.map_frame(self.domain, mfn) {
            Ok(page) => {
                debug!("Mapped {base:#x} ({mfn})");
                Some(page)
            }
            Err(e) => {
                debug!("Cannot map page {base:#x} ({mfn}): {e}");
                self.stats.failures += 1;
                None
            }
        }
    }

    /// Read one little-endian guest word at `vaddr`
    ///
    /// A word straddling a page boundary is assembled from both pages.
    pub fn read_word(&mut self, ctx: &VcpuContext, vaddr: u64) -> Option<u64> {
        let word_size = ctx.word_size();
        let len = word_size.bytes();
        let mut bytes = [0u8; 8];

        let first = self.resolve(ctx, vaddr)?;
        let head = first.len().min(len);
        bytes[..head].copy_from_slice(&first[..head]);

        if head < len {
            let next = word_size.offset(vaddr, head as u64);
            let second = self.resolve(ctx, next)?;
            bytes[head..len].copy_from_slice(&second[..len - head]);
        }

        Some(match word_size {
            WordSize::Eight => u64::from_le_bytes(bytes),
            WordSize::Four => u64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        })
    }
}

/// Identifies the page tables `vaddr` translates through
fn page_key(ctx: &VcpuContext, base: u64) -> PageKey {
    match ctx {
        VcpuContext::X86(regs) => PageKey { root: regs.cr3, split: 0, base },
        VcpuContext::Arm(regs) => {
            let root = if arm_uses_ttbr1(regs, base as u32) { regs.ttbr1 } else { regs.ttbr0 };
            PageKey { root, split: regs.ttbcr & 0x7, base }
        }
    }
}
