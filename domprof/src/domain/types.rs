//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a VCPU index where
//! a domain id is expected, and keep guest address arithmetic tied to the
//! guest's word size.

use std::fmt;

/// Xen domain id
///
/// Domain 0 is the control domain; it cannot be traced from itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(pub u16);

impl DomainId {
    /// Returns true for the control domain (dom0)
    #[must_use]
    pub fn is_control_domain(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domid {}", self.0)
    }
}

/// Virtual CPU index within a domain (0-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcpuId(pub u32);

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VCPU {}", self.0)
    }
}

/// Machine frame number
///
/// The hypervisor-side page frame backing a guest page. Physical address
/// `mfn << PAGE_SHIFT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mfn(pub u64);

impl fmt::Display for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mfn {:#x}", self.0)
    }
}

/// Width of a guest machine word
///
/// Determined once per domain before tracing starts. Every guest address is
/// masked to this width before it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordSize {
    Four,
    Eight,
}

impl WordSize {
    /// Word width in bytes
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            WordSize::Four => 4,
            WordSize::Eight => 8,
        }
    }

    /// Mask covering every valid address bit
    #[must_use]
    pub fn mask(self) -> u64 {
        match self {
            WordSize::Four => u64::from(u32::MAX),
            WordSize::Eight => u64::MAX,
        }
    }

    /// Truncate an address to this width
    #[must_use]
    pub fn truncate(self, addr: u64) -> u64 {
        addr & self.mask()
    }

    /// `addr + delta`, wrapping at this width
    #[must_use]
    pub fn offset(self, addr: u64, delta: u64) -> u64 {
        self.truncate(addr.wrapping_add(delta))
    }
}

impl TryFrom<u32> for WordSize {
    type Error = u32;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        match bytes {
            4 => Ok(WordSize::Four),
            8 => Ok(WordSize::Eight),
            other => Err(other),
        }
    }
}

impl fmt::Display for WordSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

/// Guest CPU architecture family
///
/// Selects the register-context layout and the page-table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestArch {
    /// x86 PV guests (64-bit, or 32-bit with PAE paging)
    X86,
    /// 32-bit ARM guests using short-descriptor page tables
    Arm,
}

impl GuestArch {
    /// Architecture of guests running on this host's hypervisor
    #[must_use]
    pub fn host() -> Self {
        if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            GuestArch::Arm
        } else {
            GuestArch::X86
        }
    }
}
