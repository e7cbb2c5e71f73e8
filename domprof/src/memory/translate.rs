//! Guest virtual to machine address translation
//!
//! Walks the guest's own page tables from outside the guest. Every table (or
//! descriptor) is read by mapping the machine frame that holds it.
//!
//! x86 PV guests use long-mode (4 levels, 48-bit VA) or PAE (3 levels) paging
//! with 8-byte entries. ARM guests use the short-descriptor format: a 4096
//! entry first-level table and 256 entry second-level tables, 4-byte
//! descriptors.

use domprof_abi::{PAGE_SHIFT, PAGE_SIZE};

use crate::domain::{DomainId, Mfn, TranslateError, WordSize};
use crate::hypervisor::{ArmRegisters, Hypervisor, VcpuContext, X86Registers};

const PTE_PRESENT: u64 = 1;
const PTE_PAGE_SIZE: u64 = 1 << 7;
/// Physical address bits 12..=51 of an x86 entry
const PTE_FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const X86_64_VA_MASK: u64 = (1 << 48) - 1;

/// Translate `vaddr` to the machine frame that backs it
///
/// # Errors
/// Returns [`TranslateError::PageFault`] for a missing entry at any level,
/// [`TranslateError::ReservedDescriptor`] for an ARM descriptor of type 3, and
/// [`TranslateError::Hypervisor`] when a table frame cannot be mapped
pub fn translate<H: Hypervisor + ?Sized>(
    hv: &H,
    domain: DomainId,
    ctx: &VcpuContext,
    vaddr: u64,
) -> Result<Mfn, TranslateError> {
    let maddr = match ctx {
        VcpuContext::X86(regs) => translate_x86(hv, domain, regs, vaddr)?,
        VcpuContext::Arm(regs) => translate_arm(hv, domain, regs, vaddr)?,
    };
    Ok(Mfn(maddr >> PAGE_SHIFT))
}

/// Read a little-endian `u64` at a machine address
///
/// # Errors
/// Returns an error if the containing frame cannot be mapped
pub fn read_phys_u64<H: Hypervisor + ?Sized>(
    hv: &H,
    domain: DomainId,
    maddr: u64,
) -> Result<u64, TranslateError> {
    let mut bytes = [0u8; 8];
    read_phys(hv, domain, maddr, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Read a little-endian `u32` at a machine address
///
/// # Errors
/// Returns an error if the containing frame cannot be mapped
pub fn read_phys_u32<H: Hypervisor + ?Sized>(
    hv: &H,
    domain: DomainId,
    maddr: u64,
) -> Result<u32, TranslateError> {
    let mut bytes = [0u8; 4];
    read_phys(hv, domain, maddr, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Entries are naturally aligned, so a read never crosses a frame
fn read_phys<H: Hypervisor + ?Sized>(
    hv: &H,
    domain: DomainId,
    maddr: u64,
    out: &mut [u8],
) -> Result<(), TranslateError> {
    let page = hv.map_frame(domain, Mfn(maddr >> PAGE_SHIFT))?;
    let offset = (maddr as usize) & (PAGE_SIZE - 1);
    out.copy_from_slice(&page.as_ref()[offset..offset + out.len()]);
    Ok(())
}

// ============================================================================
// x86
// ============================================================================

fn translate_x86<H: Hypervisor + ?Sized>(
    hv: &H,
    domain: DomainId,
    regs: &X86Registers,
    vaddr: u64,
) -> Result<u64, TranslateError> {
    // Large pages exist at level 2 and, in long mode, level 3
    let (mut table, levels, max_large_level) = match regs.word_size {
        WordSize::Eight => {
            let base = ((regs.cr3 >> PAGE_SHIFT) << PAGE_SHIFT) & X86_64_VA_MASK;
            (base, 4u8, 3u8)
        }
        WordSize::Four => {
            // Xen hands 32-bit guests cr3 in its extended format (pfn rotated by 12)
            let pfn = ((regs.cr3 >> 12) | (regs.cr3 << 20)) as u32;
            (u64::from(pfn) << PAGE_SHIFT, 3, 2)
        }
    };
    let vaddr = regs.word_size.truncate(vaddr);

    for level in (1..=levels).rev() {
        let shift = PAGE_SHIFT + 9 * u32::from(level - 1);
        let index = (vaddr >> shift) & 0x1FF;
        let entry = read_phys_u64(hv, domain, table + index * 8)?;
        if entry & PTE_PRESENT == 0 {
            return Err(TranslateError::PageFault { level, vaddr });
        }
        if (2..=max_large_level).contains(&level) && entry & PTE_PAGE_SIZE != 0 {
            let offset_mask = (1u64 << shift) - 1;
            return Ok((entry & PTE_FRAME_MASK & !offset_mask) | (vaddr & offset_mask));
        }
        table = entry & PTE_FRAME_MASK;
    }
    Ok(table | (vaddr & (PAGE_SIZE as u64 - 1)))
}

// ============================================================================
// ARM short descriptors
// ============================================================================

const ARM_DESC_TYPE_MASK: u32 = 0b11;
const ARM_L1_FAULT: u32 = 0b00;
const ARM_L1_PAGE_TABLE: u32 = 0b01;
const ARM_L1_SECTION: u32 = 0b10;
const ARM_L1_SUPERSECTION_BIT: u32 = 1 << 18;
const ARM_L2_FAULT: u32 = 0b00;
const ARM_L2_LARGE_PAGE: u32 = 0b01;

/// TTBR1 covers addresses whose top N bits are not all zero, `N = ttbcr & 7`
pub(crate) fn arm_uses_ttbr1(regs: &ArmRegisters, va: u32) -> bool {
    let n = regs.ttbcr & 0x7;
    n > 0 && va >> (32 - n) != 0
}

fn translate_arm<H: Hypervisor + ?Sized>(
    hv: &H,
    domain: DomainId,
    regs: &ArmRegisters,
    vaddr: u64,
) -> Result<u64, TranslateError> {
    let va = vaddr as u32;
    let n = regs.ttbcr & 0x7;

    let l1_entry = if arm_uses_ttbr1(regs, va) {
        (regs.ttbr1 & !0x3FFF) + u64::from(va >> 20) * 4
    } else {
        let base = regs.ttbr0 & !((1u64 << (14 - n)) - 1);
        base + u64::from((va & (u32::MAX >> n)) >> 20) * 4
    };

    let l1 = read_phys_u32(hv, domain, l1_entry)?;
    match l1 & ARM_DESC_TYPE_MASK {
        ARM_L1_FAULT => Err(TranslateError::PageFault { level: 1, vaddr }),
        ARM_L1_SECTION if l1 & ARM_L1_SUPERSECTION_BIT != 0 => {
            Ok(u64::from((l1 & 0xFF00_0000) | (va & 0x00FF_FFFF)))
        }
        ARM_L1_SECTION => Ok(u64::from((l1 & 0xFFF0_0000) | (va & 0x000F_FFFF))),
        ARM_L1_PAGE_TABLE => {
            let l2_entry = u64::from((l1 & 0xFFFF_FC00) | (((va >> 12) & 0xFF) << 2));
            let l2 = read_phys_u32(hv, domain, l2_entry)?;
            match l2 & ARM_DESC_TYPE_MASK {
                ARM_L2_FAULT => Err(TranslateError::PageFault { level: 2, vaddr }),
                ARM_L2_LARGE_PAGE => Ok(u64::from((l2 & 0xFFFF_0000) | (va & 0xFFFF))),
                // 0b10 and 0b11 are both small pages (bit 0 is XN)
                _ => Ok(u64::from((l2 & 0xFFFF_F000) | (va & 0x0FFF))),
            }
        }
        _ => Err(TranslateError::ReservedDescriptor { descriptor: l1, vaddr }),
    }
}
