//! Frame-pointer stack walking
//!
//! With frame pointers, every frame starts with the caller's saved frame
//! pointer, immediately followed by the return address:
//!
//! ```text
//!   fp ──► [ saved fp  ] ──► next frame
//!          [ ret addr  ]     (fp + word)
//! ```
//!
//! The instruction pointer is reported as the first "return address". The walk
//! ends normally at a null frame pointer.

use log::debug;

use crate::hypervisor::{Hypervisor, RegisterState, VcpuContext};
use crate::memory::GuestMemory;

/// Default bound on frames per walk; also catches cyclic chains
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// How a walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Reached a null frame pointer
    Done,
    /// A stack word could not be read, or the depth limit was hit
    Aborted,
}

impl WalkOutcome {
    /// Terminator line written after the frames
    #[must_use]
    pub fn terminator(self) -> &'static str {
        match self {
            WalkOutcome::Done => "1",
            WalkOutcome::Aborted => "0",
        }
    }
}

/// Return addresses of one VCPU, innermost first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub frames: Vec<u64>,
    pub outcome: WalkOutcome,
}

/// Strategy for recovering a call stack from registers and guest memory
pub trait StackWalker<H: Hypervisor + ?Sized> {
    fn walk(&self, memory: &mut GuestMemory<'_, H>, ctx: &VcpuContext) -> StackTrace;
}

/// Follows the saved frame-pointer chain
#[derive(Debug, Clone, Copy)]
pub struct FramePointerWalker {
    max_depth: usize,
}

impl FramePointerWalker {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for FramePointerWalker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl<H: Hypervisor + ?Sized> StackWalker<H> for FramePointerWalker {
    fn walk(&self, memory: &mut GuestMemory<'_, H>, ctx: &VcpuContext) -> StackTrace {
        let word_size = ctx.word_size();
        let mut ret = word_size.truncate(ctx.instruction_pointer());
        let mut fp = word_size.truncate(ctx.frame_pointer());
        let mut frames = Vec::new();

        let aborted = |frames| StackTrace { frames, outcome: WalkOutcome::Aborted };

        while fp != 0 {
            if frames.len() >= self.max_depth {
                debug!("Stack deeper than {} frames, giving up", self.max_depth);
                return aborted(frames);
            }
            frames.push(ret);

            // The two words may live on different pages
            let Some(next_fp) = memory.read_word(ctx, fp) else {
                debug!("Unreadable frame pointer slot at {fp:#x}");
                return aborted(frames);
            };
            let ret_slot = word_size.offset(fp, word_size.bytes() as u64);
            let Some(next_ret) = memory.read_word(ctx, ret_slot) else {
                debug!("Unreadable return address slot at {ret_slot:#x}");
                return aborted(frames);
            };
            fp = next_fp;
            ret = next_ret;
        }
        StackTrace { frames, outcome: WalkOutcome::Done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainId, WordSize};
    use crate::hypervisor::simulated::SimulatedDomain;
    use crate::hypervisor::{ArmRegisters, X86Registers};
    use domprof_abi::PAGE_SHIFT;

    const DOM: DomainId = DomainId(3);
    const STACK_TOP: u64 = 0xffff_c900_0001_0000;

    /// Lay out `depth` chained frames, one per stack page
    ///
    /// Returns `(page vaddr, frame)` pairs, innermost first. Frame `i` sits at
    /// page offset 0x100 and links to frame `i + 1`.
    fn build_chain(sim: &mut SimulatedDomain, root: u64, depth: u64) -> Vec<(u64, u64)> {
        let mut pages = Vec::new();
        for i in 0..depth {
            let frame = sim.alloc_frame();
            let vaddr = STACK_TOP - (i + 1) * 0x1000;
            sim.map_x86_page(root, vaddr, frame, WordSize::Eight);
            pages.push((vaddr, frame));
        }
        for (i, &(_, frame)) in pages.iter().enumerate() {
            let next_fp = pages.get(i + 1).map_or(0, |&(vaddr, _)| vaddr + 0x100);
            let base = (frame << PAGE_SHIFT) + 0x100;
            sim.write_phys_u64(base, next_fp);
            sim.write_phys_u64(base + 8, 0xffff_ffff_8100_0000 + i as u64 + 1);
        }
        pages
    }

    fn ctx(root: u64, fp: u64) -> VcpuContext {
        VcpuContext::X86(X86Registers {
            word_size: WordSize::Eight,
            ip: 0xffff_ffff_8100_0000,
            fp,
            cr3: SimulatedDomain::x86_cr3(root, WordSize::Eight),
        })
    }

    #[test]
    fn test_chain_ends_done_after_k_frames() {
        let mut sim = SimulatedDomain::new(DOM, WordSize::Eight);
        let root = sim.alloc_frame();
        let pages = build_chain(&mut sim, root, 5);

        let mut memory = GuestMemory::new(&sim, DOM, 64);
        let trace = FramePointerWalker::default().walk(&mut memory, &ctx(root, pages[0].0 + 0x100));
        assert_eq!(trace.outcome, WalkOutcome::Done);
        let expected: Vec<u64> = (0..5).map(|i| 0xffff_ffff_8100_0000 + i).collect();
        assert_eq!(trace.frames, expected);
    }

    #[test]
    fn test_null_frame_pointer_emits_nothing() {
        let mut sim = SimulatedDomain::new(DOM, WordSize::Eight);
        let root = sim.alloc_frame();
        let mut memory = GuestMemory::new(&sim, DOM, 64);
        let trace = FramePointerWalker::default().walk(&mut memory, &ctx(root, 0));
        assert_eq!(trace, StackTrace { frames: vec![], outcome: WalkOutcome::Done });
        assert_eq!(WalkOutcome::Done.terminator(), "1");
    }

    #[test]
    fn test_unmappable_frame_aborts() {
        let mut sim = SimulatedDomain::new(DOM, WordSize::Eight);
        let root = sim.alloc_frame();
        let pages = build_chain(&mut sim, root, 5);
        sim.make_unmappable(pages[2].1);

        let mut memory = GuestMemory::new(&sim, DOM, 64);
        let trace = FramePointerWalker::default().walk(&mut memory, &ctx(root, pages[0].0 + 0x100));
        assert_eq!(trace.outcome, WalkOutcome::Aborted);
        // ip plus the return addresses read from the two reachable frames
        assert_eq!(trace.frames.len(), 3);
        assert_eq!(trace.frames[2], 0xffff_ffff_8100_0002);
    }

    #[test]
    fn test_cyclic_chain_hits_depth_limit() {
        let mut sim = SimulatedDomain::new(DOM, WordSize::Eight);
        let root = sim.alloc_frame();
        let frame = sim.alloc_frame();
        sim.map_x86_page(root, 0x8000, frame, WordSize::Eight);
        // fp points at itself
        sim.write_phys_u64(frame << PAGE_SHIFT, 0x8000);
        sim.write_phys_u64((frame << PAGE_SHIFT) + 8, 0x1234);

        let mut memory = GuestMemory::new(&sim, DOM, 64);
        let trace = FramePointerWalker::new(8).walk(&mut memory, &ctx(root, 0x8000));
        assert_eq!(trace.outcome, WalkOutcome::Aborted);
        assert_eq!(trace.frames.len(), 8);
        assert_eq!(WalkOutcome::Aborted.terminator(), "0");
    }

    #[test]
    fn test_arm_return_slot_on_next_page() {
        let mut sim = SimulatedDomain::new(DOM, WordSize::Four);
        let l1 = sim.alloc_arm_l1_table();
        let low = sim.alloc_frame();
        let high = sim.alloc_frame();
        sim.map_arm_small_page(l1, 0x8000_0000, low);
        sim.map_arm_small_page(l1, 0x8000_1000, high);
        // Saved fp in the last word of one page, return address on the next
        sim.write_phys_u32((low << PAGE_SHIFT) + 0xffc, 0);
        sim.write_phys_u32(high << PAGE_SHIFT, 0x8000_4444);

        let ctx = VcpuContext::Arm(ArmRegisters {
            pc: 0x8000_2000,
            fp: 0x8000_0ffc,
            ttbcr: 0,
            ttbr0: l1,
            ttbr1: 0,
        });
        let mut memory = GuestMemory::new(&sim, DOM, 64);
        let trace = FramePointerWalker::default().walk(&mut memory, &ctx);
        assert_eq!(trace.frames, vec![0x8000_2000]);
        assert_eq!(trace.outcome, WalkOutcome::Done);
        assert_eq!(memory.len(), 2);
    }
}
