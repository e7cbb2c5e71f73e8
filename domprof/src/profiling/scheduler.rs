//! Soft real-time sampling loop
//!
//! Rounds fire on a fixed grid: `deadline(n) = start + n * period`. After a
//! round the scheduler waits for the next deadline, either by sleeping or,
//! when the time left is shorter than a sleep can reliably be, by spinning on
//! the clock. A round that overruns its deadline is counted as missed and the
//! next one starts immediately.
//!
//! The clock is injected ([`Clock`]) so the timing decisions are testable.

// Durations are reported as seconds + nanoseconds
#![allow(clippy::cast_possible_truncation)]

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::domain::TraceError;

/// Rounds used to measure timer overhead and minimum sleep
pub const CALIBRATION_ROUNDS: u32 = 100;

/// Monotonic time source
pub trait Clock {
    /// Time since an arbitrary fixed origin
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// [`Instant`] and [`thread::sleep`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Measured timing characteristics of the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calibration {
    /// Average cost of one clock read
    pub timer_overhead: Duration,
    /// Shortest wait a sleep reliably honours
    pub min_sleep: Duration,
}

/// Measure timer overhead and minimum sleep, averaged over `rounds`
pub fn calibrate<C: Clock + ?Sized>(clock: &C, rounds: u32) -> Calibration {
    let rounds = rounds.max(1);
    let mut slept = Duration::ZERO;
    let mut overhead = Duration::ZERO;

    // A zero-length sleep returns without a syscall, so ask for 1ns
    for _ in 0..rounds {
        let before = clock.now();
        clock.sleep(Duration::from_nanos(1));
        slept += clock.now().saturating_sub(before);
    }
    for _ in 0..rounds {
        let before = clock.now();
        overhead += clock.now().saturating_sub(before);
    }

    let timer_overhead = overhead / rounds;
    Calibration { timer_overhead, min_sleep: slept / rounds + timer_overhead }
}

/// What to run and how often
#[derive(Debug, Clone, Copy)]
pub struct SampleSchedule {
    /// Rounds per second
    pub frequency: u32,
    /// Run length in seconds
    pub duration_secs: u32,
    pub calibration: Calibration,
    /// Report each overrun on stderr
    pub warn_missed_deadlines: bool,
}

impl SampleSchedule {
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.frequency.max(1)
    }

    #[must_use]
    pub fn total_rounds(&self) -> u64 {
        u64::from(self.frequency) * u64::from(self.duration_secs)
    }
}

/// Loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub rounds: u64,
    pub missed_deadlines: u64,
    pub busy_waits: u64,
    pub sleeps: u64,
}

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every scheduled round ran
    Completed,
    /// The domain went away; the loop stopped early
    DomainShutDown,
}

/// One unit of sampling work
pub trait RoundRunner {
    /// Checked before every round
    fn domain_shut_down(&mut self) -> bool;

    /// # Errors
    /// Any error aborts the whole run
    fn run_round(&mut self) -> Result<(), TraceError>;
}

/// Drives a [`RoundRunner`] at the scheduled rate
pub struct SampleScheduler<C: Clock> {
    clock: C,
    schedule: SampleSchedule,
    stats: ScheduleStats,
}

impl<C: Clock> SampleScheduler<C> {
    #[must_use]
    pub fn new(clock: C, schedule: SampleSchedule) -> Self {
        Self { clock, schedule, stats: ScheduleStats::default() }
    }

    #[must_use]
    pub fn stats(&self) -> ScheduleStats {
        self.stats
    }

    /// Run every scheduled round
    ///
    /// # Errors
    /// Returns the first error from [`RoundRunner::run_round`]
    pub fn run<R: RoundRunner + ?Sized>(&mut self, runner: &mut R) -> Result<RunOutcome, TraceError> {
        let period = self.schedule.period();
        let total = self.schedule.total_rounds();
        let min_sleep = self.schedule.calibration.min_sleep;
        debug!("Scheduling {total} rounds every {period:?}");

        let mut deadline = self.clock.now();
        for round in 0..total {
            if runner.domain_shut_down() {
                info!("Domain shut down after {round} of {total} rounds");
                return Ok(RunOutcome::DomainShutDown);
            }
            deadline += period;

            runner.run_round()?;
            self.stats.rounds += 1;

            let end = self.clock.now();
            if end > deadline {
                self.stats.missed_deadlines += 1;
                if self.schedule.warn_missed_deadlines {
                    let behind = end - deadline;
                    eprintln!(
                        "we're falling behind by {}.{:09}!",
                        behind.as_secs(),
                        behind.subsec_nanos()
                    );
                }
                continue;
            }
            if round + 1 == total {
                break;
            }

            let remaining = deadline - end;
            if remaining < min_sleep {
                // Too close for a sleep to wake up in time
                self.stats.busy_waits += 1;
                while self.clock.now() < deadline {
                    std::hint::spin_loop();
                }
            } else {
                self.stats.sleeps += 1;
                self.clock.sleep(remaining);
            }
        }
        Ok(RunOutcome::Completed)
    }
}
