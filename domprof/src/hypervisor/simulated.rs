//! In-memory guest for exercising the profiler without Xen
//!
//! A [`SimulatedDomain`] owns a set of machine frames, a list of VCPU register
//! snapshots and a pause counter. Page-table fixtures build x86 and ARM
//! address spaces inside those frames, so translation, stack walking and the
//! full trace loop run against the same code paths as on real hardware.
//!
//! Faults are injected explicitly: unmappable frames, refused pause/resume,
//! offline VCPUs, HVM flag, bogus address size, shutdown after N rounds.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;

use domprof_abi::{PAGE_SHIFT, PAGE_SIZE};

use super::{DomainInfo, Hypervisor, VcpuContext};
use crate::domain::{DomainId, HypervisorError, Mfn, VcpuId, WordSize};

const PTE_PRESENT: u64 = 1;
const PTE_PAGE_SIZE: u64 = 1 << 7;
const PTE_FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const ARM_L1_COARSE: u32 = 0b01;
const ARM_L1_SECTION: u32 = 0b10;
const ARM_L2_LARGE: u32 = 0b01;
const ARM_L2_SMALL: u32 = 0b10;

#[derive(Debug, Default)]
struct Counters {
    pause_depth: u32,
    pauses: u64,
    resumes: u64,
    frames_mapped: u64,
    /// Register or memory reads issued while the domain was running
    unpaused_reads: u64,
}

/// Simulated guest domain
#[derive(Debug)]
pub struct SimulatedDomain {
    domain: DomainId,
    address_size: u32,
    hvm: bool,
    dying: bool,
    vcpus: Vec<Option<VcpuContext>>,
    frames: HashMap<u64, Vec<u8>>,
    unmappable: HashSet<u64>,
    next_mfn: u64,
    fail_pause: bool,
    fail_resume: bool,
    shut_down_after: Option<u64>,
    counters: RefCell<Counters>,
}

impl SimulatedDomain {
    #[must_use]
    pub fn new(domain: DomainId, word_size: WordSize) -> Self {
        Self {
            domain,
            address_size: u32::try_from(word_size.bytes()).unwrap_or(8),
            hvm: false,
            dying: false,
            vcpus: Vec::new(),
            frames: HashMap::new(),
            unmappable: HashSet::new(),
            next_mfn: 0x1000,
            fail_pause: false,
            fail_resume: false,
            shut_down_after: None,
            counters: RefCell::new(Counters::default()),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Add an online VCPU, returning its index
    pub fn add_vcpu(&mut self, context: VcpuContext) -> VcpuId {
        self.vcpus.push(Some(context));
        VcpuId(u32::try_from(self.vcpus.len() - 1).unwrap_or(u32::MAX))
    }

    /// Add a VCPU whose context cannot be read
    pub fn add_offline_vcpu(&mut self) -> VcpuId {
        self.vcpus.push(None);
        VcpuId(u32::try_from(self.vcpus.len() - 1).unwrap_or(u32::MAX))
    }

    /// Report a raw address size in bytes, valid or not
    pub fn set_address_size(&mut self, bytes: u32) {
        self.address_size = bytes;
    }

    pub fn set_hvm(&mut self, hvm: bool) {
        self.hvm = hvm;
    }

    pub fn set_dying(&mut self, dying: bool) {
        self.dying = dying;
    }

    /// Report the domain as shut down once `rounds` resumes have happened
    pub fn shut_down_after(&mut self, rounds: u64) {
        self.shut_down_after = Some(rounds);
    }

    pub fn fail_pause(&mut self) {
        self.fail_pause = true;
    }

    pub fn fail_resume(&mut self) {
        self.fail_resume = true;
    }

    /// Make `map_frame` fail for this frame
    pub fn make_unmappable(&mut self, mfn: u64) {
        self.unmappable.insert(mfn);
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.counters.borrow().pause_depth > 0
    }

    #[must_use]
    pub fn pause_count(&self) -> u64 {
        self.counters.borrow().pauses
    }

    #[must_use]
    pub fn resume_count(&self) -> u64 {
        self.counters.borrow().resumes
    }

    #[must_use]
    pub fn frames_mapped(&self) -> u64 {
        self.counters.borrow().frames_mapped
    }

    #[must_use]
    pub fn unpaused_reads(&self) -> u64 {
        self.counters.borrow().unpaused_reads
    }

    // ------------------------------------------------------------------
    // Machine memory
    // ------------------------------------------------------------------

    /// Allocate a zeroed frame
    pub fn alloc_frame(&mut self) -> u64 {
        self.alloc_frames(1, 1)
    }

    /// Allocate `count` contiguous zeroed frames, the first aligned to `align`
    pub fn alloc_frames(&mut self, count: u64, align: u64) -> u64 {
        let first = self.next_mfn.next_multiple_of(align);
        for mfn in first..first + count {
            self.frames.insert(mfn, vec![0; PAGE_SIZE]);
        }
        self.next_mfn = first + count;
        first
    }

    fn frame_mut(&mut self, paddr: u64) -> (&mut Vec<u8>, usize) {
        let mfn = paddr >> PAGE_SHIFT;
        let offset = (paddr as usize) & (PAGE_SIZE - 1);
        let frame = self.frames.entry(mfn).or_insert_with(|| vec![0; PAGE_SIZE]);
        (frame, offset)
    }

    /// Store little-endian bytes at a machine address
    ///
    /// # Panics
    /// Panics if the bytes cross a frame boundary
    pub fn write_phys(&mut self, paddr: u64, bytes: &[u8]) {
        let (frame, offset) = self.frame_mut(paddr);
        frame[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_phys_u64(&mut self, paddr: u64, value: u64) {
        self.write_phys(paddr, &value.to_le_bytes());
    }

    pub fn write_phys_u32(&mut self, paddr: u64, value: u32) {
        self.write_phys(paddr, &value.to_le_bytes());
    }

    fn read_phys_u64(&mut self, paddr: u64) -> u64 {
        let (frame, offset) = self.frame_mut(paddr);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&frame[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn read_phys_u32(&mut self, paddr: u64) -> u32 {
        let (frame, offset) = self.frame_mut(paddr);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&frame[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    // ------------------------------------------------------------------
    // x86 page-table fixtures
    // ------------------------------------------------------------------

    /// `cr3` value Xen reports for a top-level table at `root`
    #[must_use]
    pub fn x86_cr3(root: u64, word_size: WordSize) -> u64 {
        match word_size {
            WordSize::Eight => root << PAGE_SHIFT,
            // Extended cr3: pfn rotated left by 12 within 32 bits
            WordSize::Four => {
                let pfn = root as u32;
                u64::from(pfn.rotate_left(12))
            }
        }
    }

    fn x86_levels(word_size: WordSize) -> u8 {
        match word_size {
            WordSize::Eight => 4,
            WordSize::Four => 3,
        }
    }

    fn x86_entry_addr(table: u64, vaddr: u64, level: u8) -> u64 {
        let index = (vaddr >> (12 + 9 * (u32::from(level) - 1))) & 0x1FF;
        (table << PAGE_SHIFT) + index * 8
    }

    /// Walk from `root` down to the table at `stop_level`, creating tables
    fn x86_table_at(&mut self, root: u64, vaddr: u64, stop_level: u8, word_size: WordSize) -> u64 {
        let mut table = root;
        let mut level = Self::x86_levels(word_size);
        while level > stop_level {
            let entry_addr = Self::x86_entry_addr(table, vaddr, level);
            let entry = self.read_phys_u64(entry_addr);
            table = if entry & PTE_PRESENT != 0 {
                (entry & PTE_FRAME_MASK) >> PAGE_SHIFT
            } else {
                let next = self.alloc_frame();
                self.write_phys_u64(entry_addr, (next << PAGE_SHIFT) | PTE_PRESENT);
                next
            };
            level -= 1;
        }
        table
    }

    /// Map a 4 KiB page `vaddr` -> frame `target`
    pub fn map_x86_page(&mut self, root: u64, vaddr: u64, target: u64, word_size: WordSize) {
        let table = self.x86_table_at(root, vaddr, 1, word_size);
        let entry_addr = Self::x86_entry_addr(table, vaddr, 1);
        self.write_phys_u64(entry_addr, (target << PAGE_SHIFT) | PTE_PRESENT);
    }

    /// Map a large page at `level` (2 = 2 MiB, 3 = 1 GiB) starting at frame `target`
    pub fn map_x86_large_page(
        &mut self,
        root: u64,
        vaddr: u64,
        target: u64,
        level: u8,
        word_size: WordSize,
    ) {
        let table = self.x86_table_at(root, vaddr, level, word_size);
        let entry_addr = Self::x86_entry_addr(table, vaddr, level);
        self.write_phys_u64(entry_addr, (target << PAGE_SHIFT) | PTE_PAGE_SIZE | PTE_PRESENT);
    }

    // ------------------------------------------------------------------
    // ARM short-descriptor fixtures
    // ------------------------------------------------------------------

    /// Allocate a 16 KiB first-level table, returning its machine address
    pub fn alloc_arm_l1_table(&mut self) -> u64 {
        self.alloc_frames(4, 4) << PAGE_SHIFT
    }

    fn arm_l1_entry_addr(l1_base: u64, vaddr: u32) -> u64 {
        l1_base + u64::from(vaddr >> 20) * 4
    }

    /// Map the 1 MiB section containing `vaddr` to machine address `target`
    pub fn map_arm_section(&mut self, l1_base: u64, vaddr: u32, target: u64) {
        let descriptor = (target as u32 & 0xFFF0_0000) | ARM_L1_SECTION;
        self.write_phys_u32(Self::arm_l1_entry_addr(l1_base, vaddr), descriptor);
    }

    fn arm_l2_table(&mut self, l1_base: u64, vaddr: u32) -> u64 {
        let entry_addr = Self::arm_l1_entry_addr(l1_base, vaddr);
        let descriptor = self.read_phys_u32(entry_addr);
        if descriptor & 0b11 == ARM_L1_COARSE {
            return u64::from(descriptor & 0xFFFF_FC00);
        }
        let l2 = self.alloc_frame() << PAGE_SHIFT;
        self.write_phys_u32(entry_addr, l2 as u32 | ARM_L1_COARSE);
        l2
    }

    /// Map a 4 KiB small page `vaddr` -> frame `target`
    pub fn map_arm_small_page(&mut self, l1_base: u64, vaddr: u32, target: u64) {
        let l2 = self.arm_l2_table(l1_base, vaddr);
        let entry_addr = l2 + u64::from((vaddr >> 12) & 0xFF) * 4;
        self.write_phys_u32(entry_addr, ((target << PAGE_SHIFT) as u32) | ARM_L2_SMALL);
    }

    /// Map the 64 KiB large page containing `vaddr` to machine address `target`
    pub fn map_arm_large_page(&mut self, l1_base: u64, vaddr: u32, target: u64) {
        let l2 = self.arm_l2_table(l1_base, vaddr);
        let descriptor = (target as u32 & 0xFFFF_0000) | ARM_L2_LARGE;
        // The descriptor repeats across all 16 slots covering the large page
        let first = (vaddr >> 12) & 0xF0;
        for slot in first..first + 16 {
            self.write_phys_u32(l2 + u64::from(slot) * 4, descriptor);
        }
    }

    fn check_domain(&self, domain: DomainId) -> Result<(), HypervisorError> {
        if domain == self.domain {
            Ok(())
        } else {
            Err(HypervisorError::DomainNotFound(domain))
        }
    }

    fn note_read(&self) {
        let mut counters = self.counters.borrow_mut();
        if counters.pause_depth == 0 {
            counters.unpaused_reads += 1;
        }
    }
}

fn refused(op: &'static str, domain: DomainId) -> HypervisorError {
    HypervisorError::Hypercall {
        op,
        domain,
        source: io::Error::from(io::ErrorKind::PermissionDenied),
    }
}

impl Hypervisor for SimulatedDomain {
    type Page = Vec<u8>;

    fn domain_info(&self, domain: DomainId) -> Result<DomainInfo, HypervisorError> {
        self.check_domain(domain)?;
        let resumes = self.counters.borrow().resumes;
        let shut_down = self.shut_down_after.is_some_and(|rounds| resumes >= rounds);
        Ok(DomainInfo {
            domain,
            max_vcpu_id: u32::try_from(self.vcpus.len().saturating_sub(1)).unwrap_or(u32::MAX),
            dying: self.dying,
            shut_down,
            hvm: self.hvm,
        })
    }

    fn word_size(&self, domain: DomainId) -> Result<WordSize, HypervisorError> {
        self.check_domain(domain)?;
        WordSize::try_from(self.address_size).map_err(HypervisorError::UnsupportedWordSize)
    }

    fn vcpu_context(&self, domain: DomainId, vcpu: VcpuId) -> Result<VcpuContext, HypervisorError> {
        self.check_domain(domain)?;
        self.note_read();
        match self.vcpus.get(vcpu.0 as usize) {
            Some(Some(context)) => Ok(*context),
            _ => Err(HypervisorError::VcpuUnavailable { domain, vcpu }),
        }
    }

    fn pause(&self, domain: DomainId) -> Result<(), HypervisorError> {
        self.check_domain(domain)?;
        if self.fail_pause {
            return Err(refused("pausedomain", domain));
        }
        let mut counters = self.counters.borrow_mut();
        counters.pauses += 1;
        counters.pause_depth += 1;
        Ok(())
    }

    fn resume(&self, domain: DomainId) -> Result<(), HypervisorError> {
        self.check_domain(domain)?;
        if self.fail_resume {
            return Err(refused("unpausedomain", domain));
        }
        let mut counters = self.counters.borrow_mut();
        counters.resumes += 1;
        counters.pause_depth = counters.pause_depth.saturating_sub(1);
        Ok(())
    }

    fn map_frame(&self, domain: DomainId, mfn: Mfn) -> Result<Vec<u8>, HypervisorError> {
        self.check_domain(domain)?;
        self.note_read();
        if self.unmappable.contains(&mfn.0) {
            return Err(HypervisorError::MapFailed {
                domain,
                mfn,
                reason: "frame not owned by domain".to_string(),
            });
        }
        let page = self.frames.get(&mfn.0).cloned().ok_or_else(|| HypervisorError::MapFailed {
            domain,
            mfn,
            reason: "no such frame".to_string(),
        })?;
        self.counters.borrow_mut().frames_mapped += 1;
        Ok(page)
    }
}
