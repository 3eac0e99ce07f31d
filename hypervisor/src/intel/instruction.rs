//! Operand decoding for VMX instructions executed by the guest hypervisor.
//!
//! On a VM exit caused by a VMX instruction the processor provides the
//! VM-exit instruction-information field and, for memory operands, the
//! displacement in the exit qualification. Together with the register state
//! they are enough to locate the operand without decoding instruction bytes.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-13. Format of the VM-Exit Instruction-Information Field as Used for VMCLEAR, VMPTRLD, VMPTRST, VMXON, XRSTORS, and XSAVES
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-14. Format of the VM-Exit Instruction-Information Field as Used for VMREAD and VMWRITE

use {
    crate::intel::registers::{GuestRegisters, SegmentRegisters},
    bit_field::BitField,
    bitfield::bitfield,
};

bitfield! {
    /// VM-exit instruction-information field.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmxInstructionInfo(u32);

    impl Debug;

    pub u8, scaling, set_scaling: 1, 0;
    pub u8, reg1, set_reg1: 6, 3;
    pub u8, address_size, set_address_size: 9, 7;
    /// 1 when the operand is a register, 0 when it is in memory.
    pub memreg, set_memreg: 10;
    pub u8, segment, set_segment: 17, 15;
    pub u8, index_reg, set_index_reg: 21, 18;
    pub index_reg_invalid, set_index_reg_invalid: 22;
    pub u8, base_reg, set_base_reg: 26, 23;
    pub base_reg_invalid, set_base_reg_invalid: 27;
    pub u8, reg2, set_reg2: 31, 28;
}

/// Register numbering used by the instruction-information field.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxRegister {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl VmxRegister {
    pub fn from_u8(value: u8) -> Self {
        use VmxRegister::*;
        match value & 0xF {
            0 => Rax,
            1 => Rcx,
            2 => Rdx,
            3 => Rbx,
            4 => Rsp,
            5 => Rbp,
            6 => Rsi,
            7 => Rdi,
            8 => R8,
            9 => R9,
            10 => R10,
            11 => R11,
            12 => R12,
            13 => R13,
            14 => R14,
            _ => R15,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxSegment {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl VmxSegment {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Es),
            1 => Some(Self::Cs),
            2 => Some(Self::Ss),
            3 => Some(Self::Ds),
            4 => Some(Self::Fs),
            5 => Some(Self::Gs),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressSize {
    Bits16,
    Bits32,
    Bits64,
}

impl AddressSize {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Bits16),
            1 => Some(Self::Bits32),
            2 => Some(Self::Bits64),
            _ => None,
        }
    }

    fn truncate(&self, address: u64) -> u64 {
        match self {
            Self::Bits16 => address.get_bits(0..16),
            Self::Bits32 => address.get_bits(0..32),
            Self::Bits64 => address,
        }
    }
}

/// The decoded operand of a VMX instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxOperand {
    Register(VmxRegister),
    /// Guest-linear address of a memory operand.
    Memory(u64),
}

/// Reasons an instruction-information field cannot be turned into an operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    ReservedAddressSize(u8),
    ReservedSegment(u8),
}

impl VmxInstructionInfo {
    /// Register holding the VMCS field encoding for VMREAD/VMWRITE.
    pub fn encoding_register(&self) -> VmxRegister {
        VmxRegister::from_u8(self.reg2())
    }

    /// Locates the primary operand.
    ///
    /// `displacement` is the exit qualification. The effective address is
    /// `base + index * 2^scaling + displacement`, truncated to the address size,
    /// plus the segment base. With a 64-bit address size only FS and GS have a
    /// base.
    pub fn decode_operand(
        &self,
        displacement: u64,
        registers: &GuestRegisters,
        segments: &SegmentRegisters,
    ) -> Result<VmxOperand, DecodeError> {
        if self.memreg() {
            return Ok(VmxOperand::Register(VmxRegister::from_u8(self.reg1())));
        }

        let address_size =
            AddressSize::from_u8(self.address_size()).ok_or(DecodeError::ReservedAddressSize(self.address_size()))?;
        let segment = VmxSegment::from_u8(self.segment()).ok_or(DecodeError::ReservedSegment(self.segment()))?;

        let base = match self.base_reg_invalid() {
            true => 0,
            false => registers.get(VmxRegister::from_u8(self.base_reg())),
        };
        let index = match self.index_reg_invalid() {
            true => 0,
            false => registers.get(VmxRegister::from_u8(self.index_reg())) << self.scaling(),
        };

        let offset = address_size.truncate(base.wrapping_add(index).wrapping_add(displacement));

        let segment_base = match (address_size, segment) {
            (AddressSize::Bits64, VmxSegment::Fs) => segments.fs.base,
            (AddressSize::Bits64, VmxSegment::Gs) => segments.gs.base,
            (AddressSize::Bits64, _) => 0,
            (_, VmxSegment::Es) => segments.es.base,
            (_, VmxSegment::Cs) => segments.cs.base,
            (_, VmxSegment::Ss) => segments.ss.base,
            (_, VmxSegment::Ds) => segments.ds.base,
            (_, VmxSegment::Fs) => segments.fs.base,
            (_, VmxSegment::Gs) => segments.gs.base,
        };

        Ok(VmxOperand::Memory(segment_base.wrapping_add(offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_info(base: Option<u8>, index: Option<u8>, scaling: u8, size: u8, segment: u8) -> VmxInstructionInfo {
        let mut info = VmxInstructionInfo(0);
        info.set_scaling(scaling);
        info.set_address_size(size);
        info.set_segment(segment);
        match base {
            Some(reg) => info.set_base_reg(reg),
            None => info.set_base_reg_invalid(true),
        }
        match index {
            Some(reg) => info.set_index_reg(reg),
            None => info.set_index_reg_invalid(true),
        }
        info
    }

    #[test]
    fn register_operand() {
        let mut info = VmxInstructionInfo(0);
        info.set_memreg(true);
        info.set_reg1(VmxRegister::R9 as u8);
        info.set_reg2(VmxRegister::Rdx as u8);

        let operand = info.decode_operand(0, &GuestRegisters::default(), &SegmentRegisters::default());
        assert_eq!(operand, Ok(VmxOperand::Register(VmxRegister::R9)));
        assert_eq!(info.encoding_register(), VmxRegister::Rdx);
    }

    #[test]
    fn base_index_scale_displacement() {
        let registers = GuestRegisters { rbx: 0x1000, rsi: 0x20, ..Default::default() };
        let mut segments = SegmentRegisters::default();
        segments.ds.base = 0x5000_0000;
        segments.gs.base = 0x7000;

        // [rbx + rsi*8 + 0x10], 64-bit, DS: DS base ignored.
        let info = memory_info(Some(3), Some(6), 3, 2, 3);
        assert_eq!(info.decode_operand(0x10, &registers, &segments), Ok(VmxOperand::Memory(0x1110)));

        // Same with GS override.
        let info = memory_info(Some(3), Some(6), 3, 2, 5);
        assert_eq!(info.decode_operand(0x10, &registers, &segments), Ok(VmxOperand::Memory(0x8110)));
    }

    #[test]
    fn address_size_truncation_and_segment_base() {
        let registers = GuestRegisters { rax: 0xFFFF_FFF0, ..Default::default() };
        let mut segments = SegmentRegisters::default();
        segments.ds.base = 0x10_0000;

        // 32-bit [eax + 0x20] wraps, then DS base applies.
        let info = memory_info(Some(0), None, 0, 1, 3);
        assert_eq!(info.decode_operand(0x20, &registers, &segments), Ok(VmxOperand::Memory(0x10_0010)));
    }

    #[test]
    fn reserved_encodings() {
        let info = memory_info(None, None, 0, 3, 0);
        assert_eq!(
            info.decode_operand(0, &GuestRegisters::default(), &SegmentRegisters::default()),
            Err(DecodeError::ReservedAddressSize(3))
        );
        let info = memory_info(None, None, 0, 2, 6);
        assert_eq!(
            info.decode_operand(0, &GuestRegisters::default(), &SegmentRegisters::default()),
            Err(DecodeError::ReservedSegment(6))
        );
    }
}
