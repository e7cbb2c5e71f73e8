//! Full tracing run against one domain

use std::io::Write;

use log::{info, warn};

use super::sampler::{Sampler, SamplerStats};
use super::scheduler::{
    calibrate, Calibration, Clock, RunOutcome, SampleSchedule, SampleScheduler, ScheduleStats,
    CALIBRATION_ROUNDS,
};
use super::stack_walker::FramePointerWalker;
use crate::cli::TraceConfig;
use crate::domain::TraceError;
use crate::export::{local_timestamp, TraceWriter};
use crate::hypervisor::Hypervisor;
use crate::memory::{CacheStats, GuestMemory};
use crate::symbolization::SymbolTable;

/// Counters of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSummary {
    pub outcome: RunOutcome,
    pub calibration: Calibration,
    pub schedule: ScheduleStats,
    pub sampler: SamplerStats,
    pub cache: CacheStats,
}

/// Trace `config.domain` into `out` until the schedule completes or the
/// domain shuts down
///
/// # Errors
/// - [`TraceError::DomainUnavailable`] if the domain cannot be queried
/// - [`TraceError::HvmUnsupported`] for HVM guests
/// - [`TraceError::WordSizeUnavailable`] if the word size is unknown or invalid
/// - [`TraceError::PauseFailed`] / [`TraceError::ResumeFailed`] mid-run
/// - [`TraceError::Io`] if the trace cannot be written
pub fn trace_domain<H, W, C>(
    hv: &H,
    config: &TraceConfig,
    out: W,
    symbols: Option<&SymbolTable>,
    clock: C,
) -> Result<TraceSummary, TraceError>
where
    H: Hypervisor + ?Sized,
    W: Write,
    C: Clock,
{
    let domain = config.domain;
    let info = hv
        .domain_info(domain)
        .map_err(|source| TraceError::DomainUnavailable { domain, source })?;
    if info.hvm {
        return Err(TraceError::HvmUnsupported(domain));
    }
    let word_size = hv
        .word_size(domain)
        .map_err(|source| TraceError::WordSizeUnavailable { domain, source })?;
    info!("Tracing {domain}: {word_size}, {} VCPUs", u64::from(info.max_vcpu_id) + 1);

    let mut writer = TraceWriter::new(out);
    writer.write_header(domain, &local_timestamp())?;

    let calibration = calibrate(&clock, CALIBRATION_ROUNDS);
    info!(
        "Timer overhead {:?}, minimum reliable sleep {:?}",
        calibration.timer_overhead, calibration.min_sleep
    );

    let memory = GuestMemory::new(hv, domain, config.max_cached_pages);
    let walker = FramePointerWalker::new(config.max_depth);
    let mut sampler = Sampler::new(memory, walker, writer, symbols, info.max_vcpu_id);

    let schedule = SampleSchedule {
        frequency: config.frequency,
        duration_secs: config.duration_secs,
        calibration,
        warn_missed_deadlines: config.warn_missed_deadlines,
    };
    let mut scheduler = SampleScheduler::new(clock, schedule);
    let outcome = scheduler.run(&mut sampler)?;

    let summary = TraceSummary {
        outcome,
        calibration,
        schedule: scheduler.stats(),
        sampler: sampler.stats(),
        cache: sampler.memory().stats(),
    };
    sampler.finish()?;
    info!(
        "{} rounds, {} stacks ({} aborted), {} missed deadlines",
        summary.schedule.rounds,
        summary.sampler.stacks,
        summary.sampler.aborted_walks,
        summary.schedule.missed_deadlines
    );
    if summary.schedule.missed_deadlines > 0 {
        warn!("Missed {} deadlines", summary.schedule.missed_deadlines);
    }
    Ok(summary)
}
