//! # Hypervisor Control
//!
//! Everything domprof needs from the hypervisor goes through the
//! [`Hypervisor`] trait:
//!
//! - domain lifecycle queries (max VCPU id, dying/shutdown/HVM flags)
//! - guest word size
//! - per-VCPU register snapshots ([`VcpuContext`])
//! - pause/resume of the whole domain
//! - read-only mapping of single machine frames
//!
//! ## Implementations
//!
//! - [`xen::XenSession`]: the real transport over `/dev/xen/privcmd`
//! - `simulated::SimulatedDomain`: an in-memory guest with fault injection,
//!   used to exercise translation, walking and scheduling without Xen
//!   (unit tests, or the `simulated` feature)
//!
//! ## Pause Discipline
//!
//! A paused domain that is never resumed is a hung guest. Every sampling
//! round pauses through a [`PauseGuard`], which resumes the domain on drop
//! if the round bails out before calling [`PauseGuard::resume`].

use log::{error, warn};

use crate::domain::{DomainId, HypervisorError, Mfn, VcpuId, WordSize};

pub mod context;
#[cfg(any(test, feature = "simulated"))]
pub mod simulated;
#[cfg(target_os = "linux")]
pub mod xen;

pub use context::{ArmRegisters, RegisterState, VcpuContext, X86Registers};

/// Domain state as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub domain: DomainId,
    /// Highest valid VCPU index
    pub max_vcpu_id: u32,
    pub dying: bool,
    pub shut_down: bool,
    pub hvm: bool,
}

/// Control session with a hypervisor
pub trait Hypervisor {
    /// A read-only mapping of one machine frame; unmapped on drop
    type Page: AsRef<[u8]>;

    /// Query domain state
    ///
    /// # Errors
    /// Returns an error if the domain does not exist or the query fails
    fn domain_info(&self, domain: DomainId) -> Result<DomainInfo, HypervisorError>;

    /// Guest word size
    ///
    /// # Errors
    /// Returns an error if the size cannot be queried or is neither 4 nor 8
    fn word_size(&self, domain: DomainId) -> Result<WordSize, HypervisorError>;

    /// Snapshot the registers of one VCPU
    ///
    /// # Errors
    /// Returns an error for an invalid VCPU index or a domain that is gone
    fn vcpu_context(&self, domain: DomainId, vcpu: VcpuId) -> Result<VcpuContext, HypervisorError>;

    /// Pause every VCPU of the domain
    ///
    /// # Errors
    /// Returns an error if the hypervisor refuses
    fn pause(&self, domain: DomainId) -> Result<(), HypervisorError>;

    /// Undo one [`Hypervisor::pause`]
    ///
    /// # Errors
    /// Returns an error if the hypervisor refuses
    fn resume(&self, domain: DomainId) -> Result<(), HypervisorError>;

    /// Map one machine frame of the domain read-only
    ///
    /// # Errors
    /// Returns an error if the frame does not belong to the domain or the
    /// mapping fails
    fn map_frame(&self, domain: DomainId, mfn: Mfn) -> Result<Self::Page, HypervisorError>;

    /// True if the domain is dying or shut down
    ///
    /// Any query failure also counts as shut down, so callers stop instead of
    /// operating on undefined state.
    fn is_domain_shut_down(&self, domain: DomainId) -> bool {
        match self.domain_info(domain) {
            Ok(info) => info.dying || info.shut_down,
            Err(e) => {
                warn!("Failed to query state of {domain}, assuming it shut down: {e}");
                true
            }
        }
    }
}

/// Keeps a domain paused for the lifetime of the guard
pub struct PauseGuard<'h, H: Hypervisor + ?Sized> {
    hypervisor: &'h H,
    domain: DomainId,
    paused: bool,
}

impl<'h, H: Hypervisor + ?Sized> PauseGuard<'h, H> {
    /// Pause `domain`
    ///
    /// # Errors
    /// Returns the hypervisor error if the pause fails; nothing to undo then
    pub fn pause(hypervisor: &'h H, domain: DomainId) -> Result<Self, HypervisorError> {
        hypervisor.pause(domain)?;
        Ok(Self { hypervisor, domain, paused: true })
    }

    /// Resume the domain and report the outcome
    ///
    /// # Errors
    /// Returns the hypervisor error if the resume fails
    pub fn resume(mut self) -> Result<(), HypervisorError> {
        self.paused = false;
        self.hypervisor.resume(self.domain)
    }
}

impl<H: Hypervisor + ?Sized> Drop for PauseGuard<'_, H> {
    fn drop(&mut self) {
        if self.paused {
            if let Err(e) = self.hypervisor.resume(self.domain) {
                error!("Could not unpause {} after an aborted round: {e}", self.domain);
            }
        }
    }
}
