//! Profiling core
//!
//! - [`stack_walker`]: frame-pointer unwinding of one VCPU
//! - [`sampler`]: one round over every VCPU under a domain pause
//! - [`scheduler`]: calibrated fixed-rate loop around the rounds
//! - [`tracer`]: wires everything together for one run

pub mod sampler;
pub mod scheduler;
pub mod stack_walker;
pub mod tracer;

pub use sampler::{Sampler, SamplerStats};
pub use scheduler::{
    calibrate, Calibration, Clock, MonotonicClock, RoundRunner, RunOutcome, SampleSchedule,
    SampleScheduler, ScheduleStats,
};
pub use stack_walker::{FramePointerWalker, StackTrace, StackWalker, WalkOutcome};
pub use tracer::{trace_domain, TraceSummary};
