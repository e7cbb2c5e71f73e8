//! Xen control session over the Linux `privcmd` driver
//!
//! Hypercalls go through `IOCTL_PRIVCMD_HYPERCALL`. The hypervisor reads and
//! writes the domctl and the register context directly, so both live in one
//! page-aligned, mlocked buffer ([`HypercallBuffer`]) for the whole session:
//!
//! ```text
//!   offset 0          PAGE_SIZE                    PAGE_SIZE + 8192
//!   ┌───────────────┬──────────────────────────────┐
//!   │ xen_domctl    │ vcpu_guest_context           │
//!   └───────────────┴──────────────────────────────┘
//! ```
//!
//! Guest frames are mapped one at a time with `IOCTL_PRIVCMD_MMAPBATCH_V2`
//! into a VMA created by `mmap()`ing the privcmd device.

#![allow(unsafe_code)] // ioctl/mmap on the privcmd device

use std::cell::Cell;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::ptr::NonNull;

use domprof_abi::{
    context::BUFFER_SIZE, PrivcmdHypercall, PrivcmdMmapBatchV2, XenDomctl, ADDRESS_SIZE_OFFSET,
    DOMCTL_GETDOMAININFO, DOMCTL_GETVCPUCONTEXT, DOMCTL_GET_ADDRESS_SIZE, DOMCTL_PAUSEDOMAIN,
    DOMCTL_UNPAUSEDOMAIN, DOMINF_DYING, DOMINF_HVM_GUEST, DOMINF_SHUTDOWN,
    GETDOMAININFO_DOMAIN_OFFSET, GETDOMAININFO_FLAGS_OFFSET, GETDOMAININFO_MAX_VCPU_ID_OFFSET,
    HYPERVISOR_DOMCTL, IOCTL_PRIVCMD_HYPERCALL, IOCTL_PRIVCMD_MMAPBATCH_V2, PAGE_SIZE,
    VCPUCONTEXT_CTXT_OFFSET, VCPUCONTEXT_VCPU_OFFSET,
};
use log::debug;

use super::{DomainInfo, Hypervisor, VcpuContext};
use crate::domain::{DomainId, GuestArch, HypervisorError, Mfn, VcpuId, WordSize};

/// Device node of the privcmd driver
pub const PRIVCMD_PATH: &str = "/dev/xen/privcmd";

const CONTEXT_OFFSET: usize = PAGE_SIZE;
const BUFFER_LEN: usize = CONTEXT_OFFSET + BUFFER_SIZE;

/// Page-aligned anonymous memory pinned with `mlock`
struct HypercallBuffer {
    ptr: NonNull<u8>,
}

impl HypercallBuffer {
    fn new() -> io::Result<Self> {
        // SAFETY: anonymous private mapping, no aliasing with existing memory
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                BUFFER_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let Some(ptr) = NonNull::new(addr.cast::<u8>()) else {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        };
        // SAFETY: addr/BUFFER_LEN is the mapping created above
        if unsafe { libc::mlock(addr, BUFFER_LEN) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: same mapping, not yet shared
            unsafe { libc::munmap(addr, BUFFER_LEN) };
            return Err(err);
        }
        Ok(Self { ptr })
    }

    fn domctl_ptr(&self) -> *mut XenDomctl {
        self.ptr.as_ptr().cast::<XenDomctl>()
    }

    fn context_ptr(&self) -> *mut u8 {
        // SAFETY: CONTEXT_OFFSET < BUFFER_LEN
        unsafe { self.ptr.as_ptr().add(CONTEXT_OFFSET) }
    }

    fn context(&self) -> &[u8] {
        // SAFETY: the context area is BUFFER_SIZE bytes inside the mapping
        unsafe { std::slice::from_raw_parts(self.context_ptr(), BUFFER_SIZE) }
    }
}

impl Drop for HypercallBuffer {
    fn drop(&mut self) {
        let addr = self.ptr.as_ptr().cast::<libc::c_void>();
        // SAFETY: unmapping the region created in new(); no references outlive self
        unsafe {
            libc::munlock(addr, BUFFER_LEN);
            libc::munmap(addr, BUFFER_LEN);
        }
    }
}

/// One guest frame mapped read-only into this process
pub struct ForeignPage {
    ptr: NonNull<u8>,
}

impl AsRef<[u8]> for ForeignPage {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: ptr is a live PROT_READ mapping of PAGE_SIZE bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for ForeignPage {
    fn drop(&mut self) {
        // SAFETY: mapping created by map_frame(), borrowed slices end with self
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), PAGE_SIZE) };
    }
}

/// Open control session with the hypervisor
pub struct XenSession {
    privcmd: File,
    buffer: HypercallBuffer,
    interface_version: u32,
    arch: GuestArch,
    word_size_cache: Cell<Option<(DomainId, WordSize)>>,
}

impl XenSession {
    /// Open `/dev/xen/privcmd` and allocate the hypercall buffer
    ///
    /// # Errors
    /// Returns an error if the device cannot be opened (not running on Xen,
    /// missing privileges) or the buffer cannot be locked
    pub fn open(interface_version: u32) -> Result<Self, HypervisorError> {
        let privcmd = File::options()
            .read(true)
            .write(true)
            .open(PRIVCMD_PATH)
            .map_err(|source| HypervisorError::Open { path: PRIVCMD_PATH.to_string(), source })?;
        let buffer = HypercallBuffer::new().map_err(HypervisorError::Buffer)?;
        debug!("Opened {PRIVCMD_PATH} (domctl interface {interface_version:#x})");
        Ok(Self {
            privcmd,
            buffer,
            interface_version,
            arch: GuestArch::host(),
            word_size_cache: Cell::new(None),
        })
    }

    /// Release the session, reporting a failing close
    ///
    /// # Errors
    /// Returns an error if closing the device fails
    pub fn close(self) -> Result<(), HypervisorError> {
        let Self { privcmd, buffer, .. } = self;
        drop(buffer);
        let fd = privcmd.into_raw_fd();
        // SAFETY: fd was just released from the File and is closed exactly once
        if unsafe { libc::close(fd) } != 0 {
            return Err(HypervisorError::Close(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Issue one domctl, returning the hypervisor's reply
    fn domctl(
        &self,
        op: &'static str,
        domain: DomainId,
        request: XenDomctl,
    ) -> Result<XenDomctl, HypervisorError> {
        let slot = self.buffer.domctl_ptr();
        // SAFETY: slot points at locked memory large enough for a XenDomctl
        unsafe { slot.write(request) };

        let mut call = PrivcmdHypercall { op: HYPERVISOR_DOMCTL, arg: [slot as u64, 0, 0, 0, 0] };
        // SAFETY: call is a valid privcmd_hypercall for the lifetime of the ioctl
        let ret = unsafe {
            libc::ioctl(self.privcmd.as_raw_fd(), IOCTL_PRIVCMD_HYPERCALL as _, &raw mut call)
        };
        if ret < 0 {
            return Err(HypervisorError::Hypercall {
                op,
                domain,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: the hypervisor has finished writing the reply
        Ok(unsafe { slot.read() })
    }

    fn request(&self, cmd: u32, domain: DomainId) -> XenDomctl {
        XenDomctl::new(cmd, self.interface_version, domain.0)
    }
}

impl Hypervisor for XenSession {
    type Page = ForeignPage;

    fn domain_info(&self, domain: DomainId) -> Result<DomainInfo, HypervisorError> {
        let request = self.request(DOMCTL_GETDOMAININFO, domain);
        let reply = match self.domctl("getdomaininfo", domain, request) {
            Ok(reply) => reply,
            Err(HypervisorError::Hypercall { source, .. })
                if source.raw_os_error() == Some(libc::ESRCH) =>
            {
                return Err(HypervisorError::DomainNotFound(domain));
            }
            Err(e) => return Err(e),
        };

        // getdomaininfo answers with the next existing domain at or above the id
        if reply.payload_u16(GETDOMAININFO_DOMAIN_OFFSET) != domain.0 {
            return Err(HypervisorError::DomainNotFound(domain));
        }
        let flags = reply.payload_u32(GETDOMAININFO_FLAGS_OFFSET);
        Ok(DomainInfo {
            domain,
            max_vcpu_id: reply.payload_u32(GETDOMAININFO_MAX_VCPU_ID_OFFSET),
            dying: flags & DOMINF_DYING != 0,
            shut_down: flags & DOMINF_SHUTDOWN != 0,
            hvm: flags & DOMINF_HVM_GUEST != 0,
        })
    }

    fn word_size(&self, domain: DomainId) -> Result<WordSize, HypervisorError> {
        if self.arch == GuestArch::Arm {
            return Ok(WordSize::Four);
        }
        if let Some((cached, size)) = self.word_size_cache.get() {
            if cached == domain {
                return Ok(size);
            }
        }
        let request = self.request(DOMCTL_GET_ADDRESS_SIZE, domain);
        let reply = self.domctl("get_address_size", domain, request)?;
        let bytes = reply.payload_u32(ADDRESS_SIZE_OFFSET) / 8;
        let size = WordSize::try_from(bytes).map_err(HypervisorError::UnsupportedWordSize)?;
        self.word_size_cache.set(Some((domain, size)));
        Ok(size)
    }

    fn vcpu_context(&self, domain: DomainId, vcpu: VcpuId) -> Result<VcpuContext, HypervisorError> {
        // Resolve the word size first: it reuses the shared buffer
        let word_size = self.word_size(domain)?;

        let ctxt = self.buffer.context_ptr();
        // SAFETY: the context area is BUFFER_SIZE writable bytes
        unsafe { ctxt.write_bytes(0, BUFFER_SIZE) };

        let mut request = self.request(DOMCTL_GETVCPUCONTEXT, domain);
        request.set_payload_u32(VCPUCONTEXT_VCPU_OFFSET, vcpu.0);
        request.set_payload_u64(VCPUCONTEXT_CTXT_OFFSET, ctxt as u64);
        match self.domctl("getvcpucontext", domain, request) {
            Ok(_) => {}
            Err(HypervisorError::Hypercall { source, .. })
                if matches!(
                    source.raw_os_error(),
                    Some(libc::ESRCH | libc::EINVAL | libc::ENODATA)
                ) =>
            {
                return Err(HypervisorError::VcpuUnavailable { domain, vcpu });
            }
            Err(e) => return Err(e),
        }

        let buf = self.buffer.context();
        Ok(match self.arch {
            GuestArch::X86 => VcpuContext::decode_x86(buf, word_size),
            GuestArch::Arm => VcpuContext::decode_arm(buf),
        })
    }

    fn pause(&self, domain: DomainId) -> Result<(), HypervisorError> {
        let request = self.request(DOMCTL_PAUSEDOMAIN, domain);
        self.domctl("pausedomain", domain, request).map(|_| ())
    }

    fn resume(&self, domain: DomainId) -> Result<(), HypervisorError> {
        let request = self.request(DOMCTL_UNPAUSEDOMAIN, domain);
        self.domctl("unpausedomain", domain, request).map(|_| ())
    }

    fn map_frame(&self, domain: DomainId, mfn: Mfn) -> Result<ForeignPage, HypervisorError> {
        let map_failed = |reason: String| HypervisorError::MapFailed { domain, mfn, reason };

        // SAFETY: creates a fresh VMA backed by the privcmd device
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED,
                self.privcmd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(map_failed(io::Error::last_os_error().to_string()));
        }
        let Some(ptr) = NonNull::new(addr.cast::<u8>()) else {
            return Err(map_failed("mmap returned null".to_string()));
        };
        // Unmapped on every early return below
        let page = ForeignPage { ptr };

        let frame = mfn.0;
        let mut frame_err: i32 = 0;
        let mut batch = PrivcmdMmapBatchV2 {
            num: 1,
            dom: domain.0,
            addr: addr as u64,
            arr: &raw const frame,
            err: &raw mut frame_err,
        };
        // SAFETY: batch and the one-element arrays outlive the ioctl
        let ret = unsafe {
            libc::ioctl(self.privcmd.as_raw_fd(), IOCTL_PRIVCMD_MMAPBATCH_V2 as _, &raw mut batch)
        };
        if ret < 0 {
            return Err(map_failed(io::Error::last_os_error().to_string()));
        }
        if frame_err != 0 {
            return Err(map_failed(io::Error::from_raw_os_error(-frame_err).to_string()));
        }
        Ok(page)
    }
}
