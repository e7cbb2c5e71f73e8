//! # domprof - Out-of-guest Stack Sampler for Xen Domains
//!
//! domprof samples the call stacks of a running Xen guest from the control
//! domain. The guest needs no agent, no kernel module and no cooperation:
//! the tracer pauses the domain, snapshots every VCPU's registers, follows
//! the frame-pointer chain through the guest's own page tables, and resumes
//! the domain. Done at a fixed rate for a fixed time, this yields a
//! statistical profile of where the guest spends its time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Guest Domain (domU)                        │
//! │            registers, page tables, stack memory                 │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ domctl hypercalls, foreign page maps
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  domprof (control domain)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Hypervisor  │──▶│    Memory    │──▶│  Profiling   │         │
//! │  │ (privcmd)    │   │ (page walk)  │   │ (FP unwind)  │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │                 │
//! │                      ┌──────────────┐         ▼                 │
//! │                      │ Symbolization│──▶┌──────────────┐        │
//! │                      │ (nm / ELF)   │   │    Export    │        │
//! │                      └──────────────┘   │ (trace file) │        │
//! │                                         └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`hypervisor`]: the [`hypervisor::Hypervisor`] trait, the privcmd
//!   transport and an in-memory simulated domain
//! - [`memory`]: virtual-to-machine translation for x86-64, x86-32 (PAE)
//!   and ARM short descriptors, plus a bounded cache of mapped pages
//! - [`profiling`]: the stack walker, the per-round sampler and the
//!   calibrated real-time scheduler
//! - [`symbolization`]: sorted symbol tables with exact and floor lookup
//! - [`export`]: the line-oriented trace format and offline symbolization
//! - [`cli`]: argument parsing and validated configuration
//! - [`domain`]: core types (`DomainId`, `VcpuId`, `Mfn`, `WordSize`) and errors
//! - [`preflight`]: host checks with actionable messages
//!
//! ## Typical Usage
//!
//! ```bash
//! # 100 samples per second for 30 seconds
//! sudo domprof -F 100 -T 30 trace.txt 7
//!
//! # Resolve the raw addresses afterwards
//! domprof-symbolize System.map trace.txt > trace.sym.txt
//! ```
//!
//! ## Key Concepts
//!
//! - **Domain pause**: all VCPUs stop, so registers and stack memory are
//!   consistent while a round is taken
//! - **MFN**: machine frame number, the hypervisor's physical page index
//! - **Frame pointer chain**: `[fp]` holds the caller's frame pointer and
//!   `[fp + word]` the return address
//! - **Deadline**: the time a round should start; missing it is counted and
//!   optionally reported, never compensated

pub mod cli;
pub mod domain;
pub mod export;
pub mod hypervisor;
pub mod memory;
pub mod preflight;
pub mod profiling;
pub mod symbolization;
