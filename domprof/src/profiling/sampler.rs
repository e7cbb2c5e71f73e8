//! One sampling round: pause, walk every VCPU, write, resume

use std::io::Write;

use log::{debug, warn};

use super::scheduler::RoundRunner;
use super::stack_walker::{StackWalker, WalkOutcome};
use crate::domain::{DomainId, TraceError, VcpuId};
use crate::export::TraceWriter;
use crate::hypervisor::{Hypervisor, PauseGuard};
use crate::memory::GuestMemory;
use crate::symbolization::SymbolTable;

/// Per-run walk counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub rounds: u64,
    pub stacks: u64,
    pub frames: u64,
    pub aborted_walks: u64,
    /// VCPUs whose registers could not be read
    pub skipped_vcpus: u64,
}

/// Samples every VCPU of one domain per round
pub struct Sampler<'a, H: Hypervisor + ?Sized, S, W: Write> {
    memory: GuestMemory<'a, H>,
    walker: S,
    writer: TraceWriter<W>,
    symbols: Option<&'a SymbolTable>,
    max_vcpu_id: u32,
    stats: SamplerStats,
}

impl<'a, H, S, W> Sampler<'a, H, S, W>
where
    H: Hypervisor + ?Sized,
    S: StackWalker<H>,
    W: Write,
{
    pub fn new(
        memory: GuestMemory<'a, H>,
        walker: S,
        writer: TraceWriter<W>,
        symbols: Option<&'a SymbolTable>,
        max_vcpu_id: u32,
    ) -> Self {
        Self { memory, walker, writer, symbols, max_vcpu_id, stats: SamplerStats::default() }
    }

    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    #[must_use]
    pub fn memory(&self) -> &GuestMemory<'a, H> {
        &self.memory
    }

    fn domain(&self) -> DomainId {
        self.memory.domain()
    }

    /// Flush buffered trace output and return the writer
    ///
    /// # Errors
    /// Returns the I/O error if the trace cannot be written out
    pub fn finish(self) -> Result<W, TraceError> {
        Ok(self.writer.into_inner()?)
    }

    fn sample_vcpu(&mut self, vcpu: VcpuId) -> Result<(), TraceError> {
        let domain = self.domain();
        let ctx = match self.memory.hypervisor().vcpu_context(domain, vcpu) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Failed to get context for {vcpu}, skipping trace: {e}");
                self.stats.skipped_vcpus += 1;
                return Ok(());
            }
        };

        let trace = self.walker.walk(&mut self.memory, &ctx);
        if trace.outcome == WalkOutcome::Aborted {
            debug!("Walk of {vcpu} aborted after {} frames", trace.frames.len());
            self.stats.aborted_walks += 1;
        }
        self.stats.stacks += 1;
        self.stats.frames += trace.frames.len() as u64;
        self.writer.write_stack(&trace, self.symbols)?;
        Ok(())
    }
}

impl<H, S, W> RoundRunner for Sampler<'_, H, S, W>
where
    H: Hypervisor + ?Sized,
    S: StackWalker<H>,
    W: Write,
{
    fn domain_shut_down(&mut self) -> bool {
        self.memory.hypervisor().is_domain_shut_down(self.domain())
    }

    fn run_round(&mut self) -> Result<(), TraceError> {
        let domain = self.domain();
        let hv = self.memory.hypervisor();
        // Dropping the guard on an early return resumes the domain
        let guard =
            PauseGuard::pause(hv, domain).map_err(|source| TraceError::PauseFailed { domain, source })?;

        for vcpu in 0..=self.max_vcpu_id {
            self.sample_vcpu(VcpuId(vcpu))?;
        }

        guard.resume().map_err(|source| TraceError::ResumeFailed { domain, source })?;
        self.stats.rounds += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WordSize;
    use crate::hypervisor::simulated::SimulatedDomain;
    use crate::hypervisor::{VcpuContext, X86Registers};
    use crate::profiling::stack_walker::FramePointerWalker;
    use domprof_abi::PAGE_SHIFT;

    const DOM: DomainId = DomainId(2);

    fn ctx(cr3: u64, ip: u64, fp: u64) -> VcpuContext {
        VcpuContext::X86(X86Registers { word_size: WordSize::Eight, ip, fp, cr3 })
    }

    /// Two VCPUs: one with a two-frame chain, one with an unreadable stack
    fn guest() -> SimulatedDomain {
        let mut sim = SimulatedDomain::new(DOM, WordSize::Eight);
        let root = sim.alloc_frame();
        let stack = sim.alloc_frame();
        sim.map_x86_page(root, 0x7000, stack, WordSize::Eight);
        sim.write_phys_u64((stack << PAGE_SHIFT) + 0x10, 0);
        sim.write_phys_u64((stack << PAGE_SHIFT) + 0x18, 0x4242);

        let cr3 = SimulatedDomain::x86_cr3(root, WordSize::Eight);
        sim.add_vcpu(ctx(cr3, 0x1111, 0x7010));
        sim.add_vcpu(ctx(cr3, 0x2222, 0x9000));
        sim
    }

    fn sampler(sim: &SimulatedDomain) -> Sampler<'_, SimulatedDomain, FramePointerWalker, Vec<u8>> {
        Sampler::new(
            GuestMemory::new(sim, DOM, 16),
            FramePointerWalker::default(),
            TraceWriter::new(Vec::new()),
            None,
            sim.domain_info(DOM).unwrap().max_vcpu_id,
        )
    }

    #[test]
    fn test_round_walks_every_vcpu_while_paused() {
        let sim = guest();
        let mut sampler = sampler(&sim);
        sampler.run_round().unwrap();

        assert_eq!(sim.pause_count(), 1);
        assert_eq!(sim.resume_count(), 1);
        assert_eq!(sim.unpaused_reads(), 0);
        let stats = sampler.stats();
        assert_eq!((stats.stacks, stats.aborted_walks, stats.skipped_vcpus), (2, 1, 0));

        let out = String::from_utf8(sampler.finish().unwrap()).unwrap();
        assert_eq!(out, "0x1111\n1\n\n0x2222\n0\n\n");
    }

    #[test]
    fn test_unreadable_vcpu_is_skipped() {
        let mut sim = guest();
        sim.add_offline_vcpu();
        let mut sampler = sampler(&sim);
        sampler.run_round().unwrap();

        assert_eq!(sampler.stats().skipped_vcpus, 1);
        let out = String::from_utf8(sampler.finish().unwrap()).unwrap();
        assert_eq!(out.matches("\n\n").count(), 2);
    }

    #[test]
    fn test_pause_failure_is_fatal() {
        let mut sim = guest();
        sim.fail_pause();
        let mut sampler = sampler(&sim);
        let err = sampler.run_round().unwrap_err();
        assert!(matches!(err, TraceError::PauseFailed { .. }));
        assert_eq!(sim.resume_count(), 0);
    }

    #[test]
    fn test_resume_failure_is_fatal() {
        let mut sim = guest();
        sim.fail_resume();
        let mut sampler = sampler(&sim);
        let err = sampler.run_round().unwrap_err();
        assert!(matches!(err, TraceError::ResumeFailed { .. }));
    }

    #[test]
    fn test_shutdown_detection() {
        let mut sim = guest();
        sim.shut_down_after(1);
        let mut sampler = sampler(&sim);
        assert!(!sampler.domain_shut_down());
        sampler.run_round().unwrap();
        assert!(sampler.domain_shut_down());
    }
}
