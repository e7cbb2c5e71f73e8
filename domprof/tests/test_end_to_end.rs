//! Full tracing runs against a simulated guest

use std::cell::Cell;
use std::path::PathBuf;
use std::time::Duration;

use domprof::cli::{OutputTarget, TraceConfig};
use domprof::domain::errors::{EXIT_DOMAIN, EXIT_PAUSE, EXIT_WORD_SIZE};
use domprof::domain::{DomainId, WordSize};
use domprof::export::TRACE_MAGIC;
use domprof::hypervisor::simulated::SimulatedDomain;
use domprof::hypervisor::{ArmRegisters, VcpuContext, X86Registers};
use domprof::profiling::{trace_domain, Clock, RunOutcome};
use domprof::symbolization::{load_symbol_table, SymbolTableBuilder};
use domprof_abi::PAGE_SHIFT;

const DOM: DomainId = DomainId(7);
const KERNEL_STACK: u64 = 0xffff_c900_0000_4000;

/// Reads advance by `tick`, sleeps by the requested time
struct FakeClock {
    now: Cell<Duration>,
    tick: Duration,
}

impl FakeClock {
    fn new() -> Self {
        Self::with_tick(Duration::from_micros(1))
    }

    fn with_tick(tick: Duration) -> Self {
        Self { now: Cell::new(Duration::ZERO), tick }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        self.now.set(self.now.get() + self.tick);
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

fn config(frequency: u32, duration_secs: u32) -> TraceConfig {
    TraceConfig {
        domain: DOM,
        output: OutputTarget::Stdout,
        frequency,
        duration_secs,
        warn_missed_deadlines: false,
        symbol_table: None,
        max_depth: 512,
        max_cached_pages: 64,
        domctl_version: 0x15,
    }
}

/// 64-bit PV guest with two VCPUs sharing one address space
///
/// VCPU 0 is three frames deep (`0x...1000` -> `0x...2000` -> `0x...3000`),
/// VCPU 1 sits at the bottom of its stack.
fn x86_guest() -> SimulatedDomain {
    let mut sim = SimulatedDomain::new(DOM, WordSize::Eight);
    let root = sim.alloc_frame();
    let stack = sim.alloc_frame();
    sim.map_x86_page(root, KERNEL_STACK, stack, WordSize::Eight);

    let base = stack << PAGE_SHIFT;
    sim.write_phys_u64(base + 0x100, KERNEL_STACK + 0x200);
    sim.write_phys_u64(base + 0x108, 0xffff_ffff_8100_2000);
    sim.write_phys_u64(base + 0x200, KERNEL_STACK + 0x300);
    sim.write_phys_u64(base + 0x208, 0xffff_ffff_8100_3000);
    sim.write_phys_u64(base + 0x300, 0);
    sim.write_phys_u64(base + 0x308, 0);

    let cr3 = SimulatedDomain::x86_cr3(root, WordSize::Eight);
    sim.add_vcpu(VcpuContext::X86(X86Registers {
        word_size: WordSize::Eight,
        ip: 0xffff_ffff_8100_1000,
        fp: KERNEL_STACK + 0x100,
        cr3,
    }));
    sim.add_vcpu(VcpuContext::X86(X86Registers {
        word_size: WordSize::Eight,
        ip: 0xffff_ffff_8100_4000,
        fp: 0,
        cr3,
    }));
    sim
}

fn body(out: &[u8]) -> String {
    let text = String::from_utf8(out.to_vec()).unwrap();
    let (header, body) = text.split_once("\n\n").unwrap();
    assert!(header.starts_with(TRACE_MAGIC));
    assert!(header.contains("#tracing domain 7 on "));
    body.to_string()
}

#[test]
fn test_one_round_two_vcpus() {
    let sim = x86_guest();
    let clock = FakeClock::new();
    let mut out = Vec::new();

    let summary = trace_domain(&sim, &config(1, 1), &mut out, None, &clock).unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.schedule.rounds, 1);
    assert_eq!(summary.schedule.missed_deadlines, 0);
    assert_eq!(summary.sampler.stacks, 2);
    assert_eq!(
        body(&out),
        "0xffffffff81001000\n0xffffffff81002000\n0xffffffff81003000\n1\n\n\
         1\n\n"
    );
    assert!(!sim.is_paused());
    assert_eq!(sim.unpaused_reads(), 0);
    assert_eq!(sim.pause_count(), sim.resume_count());
}

#[test]
fn test_symbolized_run() {
    let sim = x86_guest();
    let mut builder = SymbolTableBuilder::with_capacity(4);
    builder.push(0xffff_ffff_8100_1000, "do_idle").unwrap();
    builder.push(0xffff_ffff_8100_1800, "cpu_startup_entry").unwrap();
    let table = builder.finish();
    let mut out = Vec::new();

    trace_domain(&sim, &config(1, 1), &mut out, Some(&table), FakeClock::new()).unwrap();

    assert_eq!(
        body(&out),
        "do_idle\ncpu_startup_entry+0x800\ncpu_startup_entry+0x1800\n1\n\n1\n\n"
    );
}

#[test]
fn test_malformed_symbol_file_falls_back_to_raw_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("garbage.syms");
    std::fs::write(&path, "this is not a symbol table\n\x7fELF").unwrap();
    let symbols = load_symbol_table(&path);
    assert!(symbols.is_none());

    let sim = x86_guest();
    let mut out = Vec::new();
    trace_domain(&sim, &config(1, 1), &mut out, symbols.as_ref(), FakeClock::new()).unwrap();
    assert!(body(&out).starts_with("0xffffffff81001000\n"));
}

#[test]
fn test_many_rounds_keep_schedule() {
    let sim = x86_guest();
    let clock = FakeClock::new();
    let mut out = Vec::new();

    let summary = trace_domain(&sim, &config(50, 2), &mut out, None, &clock).unwrap();

    assert_eq!(summary.schedule.rounds, 100);
    assert_eq!(summary.schedule.missed_deadlines, 0);
    assert_eq!(summary.sampler.stacks, 200);
    // One stack page plus four table levels, mapped once and then cached
    assert_eq!(sim.frames_mapped(), 5);
    assert!(summary.cache.hits > 0);
    // Sleep-or-spin after every round but the last
    assert_eq!(summary.schedule.sleeps + summary.schedule.busy_waits, 99);
    assert!(clock.now() >= Duration::from_millis(1980));
}

#[test]
fn test_slow_rounds_count_missed_deadlines() {
    let sim = x86_guest();
    // Every clock read costs more than the 100ms period
    let clock = FakeClock::with_tick(Duration::from_millis(200));
    let mut out = Vec::new();

    let summary = trace_domain(&sim, &config(10, 1), &mut out, None, &clock).unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.schedule.rounds, 10);
    assert_eq!(summary.schedule.missed_deadlines, 10);
    assert_eq!(summary.schedule.sleeps + summary.schedule.busy_waits, 0);
    assert_eq!(summary.sampler.stacks, 20);
}

#[test]
fn test_domain_shutdown_stops_early() {
    let mut sim = x86_guest();
    sim.shut_down_after(3);
    let mut out = Vec::new();

    let summary = trace_domain(&sim, &config(10, 1), &mut out, None, FakeClock::new()).unwrap();

    assert_eq!(summary.outcome, RunOutcome::DomainShutDown);
    assert_eq!(summary.schedule.rounds, 3);
    let terminators = body(&out).lines().filter(|line| *line == "1").count();
    assert_eq!(terminators, 6);
}

#[test]
fn test_dying_domain_is_not_sampled() {
    let mut sim = x86_guest();
    sim.set_dying(true);
    let mut out = Vec::new();

    let summary = trace_domain(&sim, &config(10, 1), &mut out, None, FakeClock::new()).unwrap();

    assert_eq!(summary.outcome, RunOutcome::DomainShutDown);
    assert_eq!(summary.schedule.rounds, 0);
    assert_eq!(sim.pause_count(), 0);
    assert!(body(&out).is_empty());
}

#[test]
fn test_arm_guest() {
    let mut sim = SimulatedDomain::new(DOM, WordSize::Four);
    let l1 = sim.alloc_arm_l1_table();
    let stack = sim.alloc_frame();
    sim.map_arm_small_page(l1, 0xc080_0000, stack);
    let base = stack << PAGE_SHIFT;
    sim.write_phys_u32(base + 0x40, 0xc080_0080);
    sim.write_phys_u32(base + 0x44, 0xc000_2000);
    sim.write_phys_u32(base + 0x80, 0);
    sim.add_vcpu(VcpuContext::Arm(ArmRegisters {
        pc: 0xc000_1000,
        fp: 0xc080_0040,
        ttbcr: 0,
        ttbr0: l1,
        ttbr1: 0,
    }));
    let mut out = Vec::new();

    trace_domain(&sim, &config(1, 1), &mut out, None, FakeClock::new()).unwrap();

    assert_eq!(body(&out), "0xc0001000\n0xc0002000\n1\n\n");
}

#[test]
fn test_unknown_domain() {
    let sim = x86_guest();
    let mut config = config(1, 1);
    config.domain = DomainId(99);

    let err = trace_domain(&sim, &config, Vec::new(), None, FakeClock::new()).unwrap_err();
    assert_eq!(err.exit_code(), EXIT_DOMAIN);
}

#[test]
fn test_hvm_guest_rejected() {
    let mut sim = x86_guest();
    sim.set_hvm(true);
    let mut out = Vec::new();

    let err = trace_domain(&sim, &config(1, 1), &mut out, None, FakeClock::new()).unwrap_err();
    assert_eq!(err.exit_code(), EXIT_WORD_SIZE);
    assert!(out.is_empty());
    assert_eq!(sim.pause_count(), 0);
}

#[test]
fn test_unsupported_word_size() {
    let mut sim = x86_guest();
    sim.set_address_size(2);

    let err = trace_domain(&sim, &config(1, 1), Vec::new(), None, FakeClock::new()).unwrap_err();
    assert_eq!(err.exit_code(), EXIT_WORD_SIZE);
}

#[test]
fn test_pause_failure_is_fatal() {
    let mut sim = x86_guest();
    sim.fail_pause();

    let err = trace_domain(&sim, &config(1, 1), Vec::new(), None, FakeClock::new()).unwrap_err();
    assert_eq!(err.exit_code(), EXIT_PAUSE);
}
