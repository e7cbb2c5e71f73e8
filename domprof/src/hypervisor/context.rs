//! Per-architecture VCPU register snapshots
//!
//! The stack walker only needs the instruction pointer, the frame pointer and
//! the word size ([`RegisterState`]). Address translation additionally needs
//! the page-table base registers, which stay on the concrete register types.

use domprof_abi::context as layout;

use crate::domain::WordSize;

/// Register capability needed to start a stack walk
pub trait RegisterState {
    fn instruction_pointer(&self) -> u64;
    fn frame_pointer(&self) -> u64;
    fn word_size(&self) -> WordSize;
}

/// x86 PV guest registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Registers {
    pub word_size: WordSize,
    /// `rip` / `eip`
    pub ip: u64,
    /// `rbp` / `ebp`
    pub fp: u64,
    /// Raw `cr3` as Xen reports it (extended format for 32-bit guests)
    pub cr3: u64,
}

impl RegisterState for X86Registers {
    fn instruction_pointer(&self) -> u64 {
        self.ip
    }

    fn frame_pointer(&self) -> u64 {
        self.fp
    }

    fn word_size(&self) -> WordSize {
        self.word_size
    }
}

/// 32-bit ARM guest registers (ARM state, APCS frame pointer in r11)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmRegisters {
    pub pc: u32,
    pub fp: u32,
    pub ttbcr: u32,
    pub ttbr0: u64,
    pub ttbr1: u64,
}

impl RegisterState for ArmRegisters {
    fn instruction_pointer(&self) -> u64 {
        u64::from(self.pc)
    }

    fn frame_pointer(&self) -> u64 {
        u64::from(self.fp)
    }

    fn word_size(&self) -> WordSize {
        WordSize::Four
    }
}

/// Register snapshot of one VCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuContext {
    X86(X86Registers),
    Arm(ArmRegisters),
}

impl VcpuContext {
    /// Decode an x86 `vcpu_guest_context` buffer
    ///
    /// Xen returns the compat layout for 32-bit guests, so the word size
    /// selects the offsets.
    #[must_use]
    pub fn decode_x86(buf: &[u8], word_size: WordSize) -> Self {
        let regs = match word_size {
            WordSize::Eight => X86Registers {
                word_size,
                ip: read_u64(buf, layout::x86_64::RIP),
                fp: read_u64(buf, layout::x86_64::RBP),
                cr3: read_u64(buf, layout::x86_64::CR3),
            },
            WordSize::Four => X86Registers {
                word_size,
                ip: u64::from(read_u32(buf, layout::x86_32::EIP)),
                fp: u64::from(read_u32(buf, layout::x86_32::EBP)),
                cr3: u64::from(read_u32(buf, layout::x86_32::CR3)),
            },
        };
        VcpuContext::X86(regs)
    }

    /// Decode an ARM `vcpu_guest_context` buffer
    #[must_use]
    pub fn decode_arm(buf: &[u8]) -> Self {
        VcpuContext::Arm(ArmRegisters {
            pc: read_u32(buf, layout::arm::PC32),
            fp: read_u32(buf, layout::arm::R11_USR),
            // ttbcr is 32 bits wide; Xen stores it in a 64-bit slot
            ttbcr: read_u32(buf, layout::arm::TTBCR),
            ttbr0: read_u64(buf, layout::arm::TTBR0),
            ttbr1: read_u64(buf, layout::arm::TTBR1),
        })
    }

    fn registers(&self) -> &dyn RegisterState {
        match self {
            VcpuContext::X86(regs) => regs,
            VcpuContext::Arm(regs) => regs,
        }
    }
}

impl RegisterState for VcpuContext {
    fn instruction_pointer(&self) -> u64 {
        self.registers().instruction_pointer()
    }

    fn frame_pointer(&self) -> u64 {
        self.registers().frame_pointer()
    }

    fn word_size(&self) -> WordSize {
        self.registers().word_size()
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}
