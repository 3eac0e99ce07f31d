//! Register state of a virtual CPU as seen by whichever level is running on it.

use crate::intel::instruction::VmxRegister;

/// General-purpose registers plus RIP, RSP and RFLAGS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x90);

impl GuestRegisters {
    /// Reads a register by its VMX instruction-information encoding.
    pub fn get(&self, register: VmxRegister) -> u64 {
        match register {
            VmxRegister::Rax => self.rax,
            VmxRegister::Rcx => self.rcx,
            VmxRegister::Rdx => self.rdx,
            VmxRegister::Rbx => self.rbx,
            VmxRegister::Rsp => self.rsp,
            VmxRegister::Rbp => self.rbp,
            VmxRegister::Rsi => self.rsi,
            VmxRegister::Rdi => self.rdi,
            VmxRegister::R8 => self.r8,
            VmxRegister::R9 => self.r9,
            VmxRegister::R10 => self.r10,
            VmxRegister::R11 => self.r11,
            VmxRegister::R12 => self.r12,
            VmxRegister::R13 => self.r13,
            VmxRegister::R14 => self.r14,
            VmxRegister::R15 => self.r15,
        }
    }

    /// Writes a register by its VMX instruction-information encoding.
    pub fn set(&mut self, register: VmxRegister, value: u64) {
        let slot = match register {
            VmxRegister::Rax => &mut self.rax,
            VmxRegister::Rcx => &mut self.rcx,
            VmxRegister::Rdx => &mut self.rdx,
            VmxRegister::Rbx => &mut self.rbx,
            VmxRegister::Rsp => &mut self.rsp,
            VmxRegister::Rbp => &mut self.rbp,
            VmxRegister::Rsi => &mut self.rsi,
            VmxRegister::Rdi => &mut self.rdi,
            VmxRegister::R8 => &mut self.r8,
            VmxRegister::R9 => &mut self.r9,
            VmxRegister::R10 => &mut self.r10,
            VmxRegister::R11 => &mut self.r11,
            VmxRegister::R12 => &mut self.r12,
            VmxRegister::R13 => &mut self.r13,
            VmxRegister::R14 => &mut self.r14,
            VmxRegister::R15 => &mut self.r15,
        };
        *slot = value;
    }
}

/// A segment register in its VMCS form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

/// Segment registers in VMX instruction-information order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegisters {
    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
}

impl SegmentRegisters {
    pub fn as_array(&self) -> [&Segment; 6] {
        [&self.es, &self.cs, &self.ss, &self.ds, &self.fs, &self.gs]
    }

    pub fn as_array_mut(&mut self) -> [&mut Segment; 6] {
        [&mut self.es, &mut self.cs, &mut self.ss, &mut self.ds, &mut self.fs, &mut self.gs]
    }
}

/// Everything the virtual VMCS guest-state and host-state areas describe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub registers: GuestRegisters,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub efer: u64,
    pub segments: SegmentRegisters,
    pub interruptibility: u32,
}

impl CpuState {
    /// Architectural state after INIT.
    pub fn reset() -> Self {
        let mut state = Self::default();
        state.registers.rflags = 0x2;
        state.registers.rip = 0xFFF0;
        state.cr0 = 0x6000_0010;
        state.dr7 = 0x400;
        for segment in state.segments.as_array_mut() {
            segment.limit = 0xFFFF;
            segment.access_rights = 0x93;
        }
        state.segments.cs.access_rights = 0x9B;
        state.segments.cs.selector = 0xF000;
        state.segments.cs.base = 0xFFFF_0000;
        state
    }
}
