//! # Hypervisor ABI (privcmd ↔ Xen ↔ domprof)
//!
//! Defines the data structures and constants exchanged with the Xen hypervisor
//! through the Linux `privcmd` driver. All types use `#[repr(C)]` so their
//! layout matches the C definitions in Xen's public headers and in
//! `include/uapi/xen/privcmd.h`.
//!
//! ## Transport
//!
//! 1. **Hypercalls** - `IOCTL_PRIVCMD_HYPERCALL` with a [`PrivcmdHypercall`]
//!    whose first argument points at a [`XenDomctl`] in locked memory.
//! 2. **Foreign mappings** - `IOCTL_PRIVCMD_MMAPBATCH_V2` with a
//!    [`PrivcmdMmapBatchV2`] that maps guest frames into a VMA previously
//!    created by `mmap()` on the privcmd file descriptor.
//!
//! ## Register Contexts
//!
//! `XEN_DOMCTL_getvcpucontext` writes a `vcpu_guest_context` whose layout
//! depends on the host architecture and, on x86, on the guest's bitness. The
//! profiler only needs a handful of registers, so [`context`] records byte
//! offsets instead of mirroring the full structures.

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Paging
// ============================================================================

/// Page shift shared by every architecture the profiler supports
pub const PAGE_SHIFT: u32 = 12;

/// Size of one guest page / machine frame in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// ============================================================================
// Hypercall and domctl numbers
// ============================================================================

/// `__HYPERVISOR_domctl`
pub const HYPERVISOR_DOMCTL: u64 = 36;

/// `XEN_DOMCTL_pausedomain`
pub const DOMCTL_PAUSEDOMAIN: u32 = 3;

/// `XEN_DOMCTL_unpausedomain`
pub const DOMCTL_UNPAUSEDOMAIN: u32 = 4;

/// `XEN_DOMCTL_getdomaininfo`
///
/// Returns the first domain whose id is **greater than or equal to** the
/// requested one, so callers must compare the returned id.
pub const DOMCTL_GETDOMAININFO: u32 = 5;

/// `XEN_DOMCTL_getvcpucontext`
pub const DOMCTL_GETVCPUCONTEXT: u32 = 13;

/// `XEN_DOMCTL_get_address_size` (x86 only, answer in bits)
pub const DOMCTL_GET_ADDRESS_SIZE: u32 = 36;

/// `XEN_DOMCTL_INTERFACE_VERSION` of Xen 4.17
///
/// The hypervisor rejects domctls carrying any other version, so this must
/// match the running Xen; the tracer lets the user override it.
pub const DEFAULT_DOMCTL_INTERFACE_VERSION: u32 = 0x15;

// ============================================================================
// Domain info flags (xen_domctl_getdomaininfo.flags)
// ============================================================================

/// Domain is scheduled to die
pub const DOMINF_DYING: u32 = 1 << 0;

/// Domain is hardware-virtualized
pub const DOMINF_HVM_GUEST: u32 = 1 << 1;

/// Domain has shut down (the reason is in the upper flag bits)
pub const DOMINF_SHUTDOWN: u32 = 1 << 2;

// ============================================================================
// privcmd ioctls
// ============================================================================

const fn privcmd_ioc(nr: u32, size: usize) -> u32 {
    // _IOC(_IOC_NONE, 'P', nr, size); _IOC_NONE is 0 on every Linux arch we target
    ((size as u32) << 16) | ((b'P' as u32) << 8) | nr
}

/// `IOCTL_PRIVCMD_HYPERCALL`
pub const IOCTL_PRIVCMD_HYPERCALL: u32 =
    privcmd_ioc(0, core::mem::size_of::<PrivcmdHypercall>());

/// `IOCTL_PRIVCMD_MMAPBATCH_V2`
pub const IOCTL_PRIVCMD_MMAPBATCH_V2: u32 =
    privcmd_ioc(4, core::mem::size_of::<PrivcmdMmapBatchV2>());

/// Argument of `IOCTL_PRIVCMD_HYPERCALL` (`struct privcmd_hypercall`)
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct PrivcmdHypercall {
    /// Hypercall number, e.g. [`HYPERVISOR_DOMCTL`]
    pub op: u64,
    /// Hypercall arguments; pointers are passed as integers
    pub arg: [u64; 5],
}

/// Argument of `IOCTL_PRIVCMD_MMAPBATCH_V2` (`struct privcmd_mmapbatch_v2`)
///
/// `addr` must be the start of a VMA obtained by `mmap()`ing the privcmd
/// device; after the ioctl every entry of `err` holds 0 or a negative errno
/// for the corresponding frame in `arr`.
#[repr(C)]
pub struct PrivcmdMmapBatchV2 {
    /// Number of frames in `arr`
    pub num: u32,
    /// Target domain id
    pub dom: u16,
    /// Virtual address of the destination VMA
    pub addr: u64,
    /// Frame numbers to map
    pub arr: *const u64,
    /// Per-frame error codes written by the kernel
    pub err: *mut i32,
}

// ============================================================================
// struct xen_domctl
// ============================================================================

/// Size of the `u` union inside `struct xen_domctl`
pub const DOMCTL_PAYLOAD_SIZE: usize = 128;

/// Generic domctl request (`struct xen_domctl`)
///
/// The per-command union is exposed as raw bytes; the `*_OFFSET` constants
/// below name the fields this profiler reads or writes.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct XenDomctl {
    pub cmd: u32,
    pub interface_version: u32,
    pub domain: u16,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: [u16; 3],
    pub payload: [u8; DOMCTL_PAYLOAD_SIZE],
}

impl XenDomctl {
    /// Build a zeroed request for `cmd` against `domain`
    #[must_use]
    pub const fn new(cmd: u32, interface_version: u32, domain: u16) -> Self {
        Self { cmd, interface_version, domain, _pad: [0; 3], payload: [0; DOMCTL_PAYLOAD_SIZE] }
    }

    /// Read a native-endian `u16` from the payload
    #[must_use]
    pub fn payload_u16(&self, offset: usize) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.payload[offset..offset + 2]);
        u16::from_ne_bytes(bytes)
    }

    /// Read a native-endian `u32` from the payload
    #[must_use]
    pub fn payload_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.payload[offset..offset + 4]);
        u32::from_ne_bytes(bytes)
    }

    /// Write a native-endian `u32` into the payload
    pub fn set_payload_u32(&mut self, offset: usize, value: u32) {
        self.payload[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Write a native-endian `u64` into the payload
    pub fn set_payload_u64(&mut self, offset: usize, value: u64) {
        self.payload[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }
}

/// `xen_domctl_getdomaininfo.domain`
pub const GETDOMAININFO_DOMAIN_OFFSET: usize = 0;
/// `xen_domctl_getdomaininfo.flags`
pub const GETDOMAININFO_FLAGS_OFFSET: usize = 4;
/// `xen_domctl_getdomaininfo.max_vcpu_id`
pub const GETDOMAININFO_MAX_VCPU_ID_OFFSET: usize = 68;

/// `xen_domctl_vcpucontext.vcpu`
pub const VCPUCONTEXT_VCPU_OFFSET: usize = 0;
/// `xen_domctl_vcpucontext.ctxt` (64-bit guest handle)
pub const VCPUCONTEXT_CTXT_OFFSET: usize = 8;

/// `xen_domctl_address_size.size`
pub const ADDRESS_SIZE_OFFSET: usize = 0;

// ============================================================================
// vcpu_guest_context layouts
// ============================================================================

/// Byte offsets of the registers the profiler reads from a
/// `vcpu_guest_context` buffer.
pub mod context {
    /// Buffer size that fits every supported `vcpu_guest_context` layout
    pub const BUFFER_SIZE: usize = 8192;

    /// x86-64 PV guest, native layout
    pub mod x86_64 {
        /// `user_regs.rbp`
        pub const RBP: usize = 552;
        /// `user_regs.rip`
        pub const RIP: usize = 648;
        /// `ctrlreg[3]`
        pub const CR3: usize = 5008;
    }

    /// x86-32 PV guest, compat layout (returned for 32-bit domains)
    pub mod x86_32 {
        /// `user_regs.ebp`
        pub const EBP: usize = 536;
        /// `user_regs.eip`
        pub const EIP: usize = 548;
        /// `ctrlreg[3]`
        pub const CR3: usize = 2728;
    }

    /// 32-bit ARM guest
    pub mod arm {
        /// `user_regs.r11_usr`, the AArch32 frame pointer in ARM state
        pub const R11_USR: usize = 96;
        /// `user_regs.pc32`
        pub const PC32: usize = 256;
        /// `ttbcr`
        pub const TTBCR: usize = 328;
        /// `ttbr0`
        pub const TTBR0: usize = 336;
        /// `ttbr1`
        pub const TTBR1: usize = 344;
    }
}
