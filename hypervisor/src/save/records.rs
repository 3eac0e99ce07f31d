//! Built-in record layouts.

use {
    crate::{
        error::SaveError,
        intel::{
            events::{EventInjection, PendingEvent},
            instruction::VmxRegister,
            nested::{DeferredInterrupt, SavedNestedState},
            registers::{CpuState, Segment},
            vcpu::Vcpu,
        },
        save::{registry::HVM_SAVE_HEADER, SaveRecord},
    },
    bit_field::BitField,
    core::mem::size_of,
    zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout},
};

pub const HVM_FILE_MAGIC: u32 = 0x5438_1286;
pub const HVM_FILE_VERSION: u32 = 1;

/// Snapshot header, always the first record.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct HvmSaveHeader {
    pub magic: u32,
    pub version: u32,
    pub changeset: u64,
    /// CPUID.1:EAX of the saving host.
    pub cpuid: u32,
    pub gtsc_khz: u32,
}
const_assert_eq!(size_of::<HvmSaveHeader>(), 24);

impl SaveRecord for HvmSaveHeader {
    const TYPECODE: u16 = HVM_SAVE_HEADER;
}

pub const HVM_SAVE_CPU: u16 = 2;
pub const HVM_SAVE_NESTED_VMX: u16 = 32;

/// Register state of one vCPU.
///
/// Layouts up to and including `interruptibility` were written by earlier
/// versions; they are loaded through the compat path.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CpuRecord {
    /// RAX..R15 in instruction-encoding order.
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    /// ES, CS, SS, DS, FS, GS.
    pub segment_bases: [u64; 6],
    pub segment_limits: [u32; 6],
    pub segment_access_rights: [u32; 6],
    pub segment_selectors: [u16; 6],
    pub interruptibility: u32,
    pub efer: u64,
    pub pending_event: u32,
    pub pending_error_code: u32,
    pub pending_instruction_len: u32,
    pub reserved: u32,
}
const_assert_eq!(size_of::<CpuRecord>(), 312);

/// Length of the layout without EFER and the pending event.
const CPU_RECORD_COMPAT_LENGTH: u32 = 288;

const CR0_PG: usize = 31;
const CR4_PAE: usize = 5;
/// CS access rights: 64-bit mode active.
const CS_L: usize = 13;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

impl SaveRecord for CpuRecord {
    const TYPECODE: u16 = HVM_SAVE_CPU;
    const COMPAT_LENGTH: Option<u32> = Some(CPU_RECORD_COMPAT_LENGTH);

    /// Old layouts did not carry EFER: derive long mode from paging state.
    fn fix_compat(&mut self) {
        let cs_long = self.segment_access_rights[1].get_bit(CS_L);
        if self.cr0.get_bit(CR0_PG) && self.cr4.get_bit(CR4_PAE) && cs_long {
            self.efer = EFER_LME | EFER_LMA;
        }
        log::debug!("Fixed up compat CPU record, EFER {:#x}", self.efer);
    }
}

impl CpuRecord {
    pub fn from_vcpu(vcpu: &Vcpu) -> Self {
        let state = &vcpu.state;
        let segments = state.segments.as_array();

        let mut gprs = [0u64; 16];
        for (index, value) in gprs.iter_mut().enumerate() {
            *value = state.registers.get(VmxRegister::from_u8(index as u8));
        }

        let pending = vcpu.pending_event.unwrap_or_default();

        Self {
            gprs,
            rip: state.registers.rip,
            rflags: state.registers.rflags,
            cr0: state.cr0,
            cr3: state.cr3,
            cr4: state.cr4,
            dr7: state.dr7,
            segment_bases: segments.map(|segment| segment.base),
            segment_limits: segments.map(|segment| segment.limit),
            segment_access_rights: segments.map(|segment| segment.access_rights),
            segment_selectors: segments.map(|segment| segment.selector),
            interruptibility: state.interruptibility,
            efer: state.efer,
            pending_event: pending.info.bits(),
            pending_error_code: pending.error_code,
            pending_instruction_len: pending.instruction_len,
            reserved: 0,
        }
    }

    pub fn apply(&self, vcpu: &mut Vcpu) {
        let mut state = CpuState::default();

        for (index, value) in self.gprs.iter().enumerate() {
            state.registers.set(VmxRegister::from_u8(index as u8), *value);
        }
        state.registers.rip = self.rip;
        state.registers.rflags = self.rflags;
        state.cr0 = self.cr0;
        state.cr3 = self.cr3;
        state.cr4 = self.cr4;
        state.dr7 = self.dr7;
        state.efer = self.efer;
        state.interruptibility = self.interruptibility;

        for (index, segment) in state.segments.as_array_mut().into_iter().enumerate() {
            *segment = Segment {
                selector: self.segment_selectors[index],
                base: self.segment_bases[index],
                limit: self.segment_limits[index],
                access_rights: self.segment_access_rights[index],
            };
        }

        vcpu.state = state;

        let info = EventInjection(self.pending_event);
        vcpu.pending_event = match info.valid() {
            true => Some(PendingEvent {
                info,
                error_code: self.pending_error_code,
                instruction_len: self.pending_instruction_len,
            }),
            false => None,
        };
    }
}

/// `NestedVmxRecord::flags`
const NESTED_VMXON: usize = 0;
const NESTED_CURRENT: usize = 1;
const NESTED_GUEST_MODE: usize = 2;
const NESTED_INTR_VALID: usize = 3;
const NESTED_IO_BITMAP_A: usize = 4;
const NESTED_IO_BITMAP_B: usize = 5;

/// Nested VMX context of one vCPU. The virtual VMCS contents, launch state
/// included, stay in guest memory.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct NestedVmxRecord {
    pub vmxon_region_pa: u64,
    pub current_vmcs_pa: u64,
    pub io_bitmap: [u64; 2],
    pub intr_info: u32,
    pub intr_error_code: u32,
    pub flags: u32,
    pub reserved: u32,
}
const_assert_eq!(size_of::<NestedVmxRecord>(), 48);

impl SaveRecord for NestedVmxRecord {
    const TYPECODE: u16 = HVM_SAVE_NESTED_VMX;
}

impl NestedVmxRecord {
    pub fn from_saved(saved: &SavedNestedState) -> Self {
        let mut flags = 0u32;
        flags.set_bit(NESTED_VMXON, saved.vmxon_region_pa.is_some());
        flags.set_bit(NESTED_CURRENT, saved.current.is_some());
        flags.set_bit(NESTED_GUEST_MODE, saved.guest_mode);
        flags.set_bit(NESTED_INTR_VALID, saved.intr.valid);
        flags.set_bit(NESTED_IO_BITMAP_A, saved.io_bitmap[0].is_some());
        flags.set_bit(NESTED_IO_BITMAP_B, saved.io_bitmap[1].is_some());

        Self {
            vmxon_region_pa: saved.vmxon_region_pa.unwrap_or(0),
            current_vmcs_pa: saved.current.unwrap_or(0),
            io_bitmap: saved.io_bitmap.map(|bitmap| bitmap.unwrap_or(0)),
            intr_info: saved.intr.intr_info,
            intr_error_code: saved.intr.error_code,
            flags,
            reserved: 0,
        }
    }

    pub fn to_saved(&self) -> Result<SavedNestedState, SaveError> {
        let flag = |bit: usize| self.flags.get_bit(bit);
        let present = |bit: usize, value: u64| flag(bit).then_some(value);

        let saved = SavedNestedState {
            vmxon_region_pa: present(NESTED_VMXON, self.vmxon_region_pa),
            current: present(NESTED_CURRENT, self.current_vmcs_pa),
            io_bitmap: [
                present(NESTED_IO_BITMAP_A, self.io_bitmap[0]),
                present(NESTED_IO_BITMAP_B, self.io_bitmap[1]),
            ],
            intr: DeferredInterrupt {
                intr_info: self.intr_info,
                error_code: self.intr_error_code,
                valid: flag(NESTED_INTR_VALID),
            },
            guest_mode: flag(NESTED_GUEST_MODE),
        };

        // A current region or a running L2 outside VMX operation cannot be restored.
        if saved.vmxon_region_pa.is_none() && (saved.current.is_some() || saved.guest_mode) {
            return Err(SaveError::InvalidRecord(HVM_SAVE_NESTED_VMX));
        }
        if saved.guest_mode && saved.current.is_none() {
            return Err(SaveError::InvalidRecord(HVM_SAVE_NESTED_VMX));
        }

        Ok(saved)
    }

    /// Whether the record describes a vCPU outside VMX operation, which needs no record.
    pub fn is_default(saved: &SavedNestedState) -> bool {
        *saved == SavedNestedState::default()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::config::DomainConfig, zerocopy::FromZeros};

    #[test]
    fn cpu_record_restores_registers_and_pending_event() {
        let mut vcpu = Vcpu::new(1, &DomainConfig::default());
        vcpu.state.registers.r13 = 0x1313;
        vcpu.state.registers.rsp = 0x7ff0;
        vcpu.state.efer = 0xD01;
        vcpu.state.segments.fs.base = 0xdead_0000;
        vcpu.pending_event = Some(PendingEvent::new(EventInjection::general_protection(), 0));

        let record = CpuRecord::from_vcpu(&vcpu);
        let mut restored = Vcpu::new(1, &DomainConfig::default());
        record.apply(&mut restored);

        assert_eq!(restored.state, vcpu.state);
        assert_eq!(restored.pending_event, vcpu.pending_event);
    }

    #[test]
    fn compat_cpu_record_derives_long_mode() {
        let mut record = CpuRecord::new_zeroed();
        record.cr0 = 1 << 31 | 1;
        record.cr4 = 1 << 5;
        record.segment_access_rights[1] = 0xA09B;
        record.fix_compat();
        assert_eq!(record.efer, 0x500);

        let mut record = CpuRecord::new_zeroed();
        record.cr0 = 1;
        record.fix_compat();
        assert_eq!(record.efer, 0);
    }

    #[test]
    fn nested_record_round_trips_saved_state() {
        let saved = SavedNestedState {
            vmxon_region_pa: Some(0x1000),
            current: Some(0x2000),
            io_bitmap: [Some(0x4000), None],
            intr: DeferredInterrupt { intr_info: 0x8000_0030, error_code: 0, valid: true },
            guest_mode: true,
        };

        let record = NestedVmxRecord::from_saved(&saved);
        assert_eq!(record.to_saved(), Ok(saved));
        assert!(NestedVmxRecord::is_default(&SavedNestedState::default()));
    }

    #[test]
    fn inconsistent_nested_record_is_rejected() {
        let mut record = NestedVmxRecord::new_zeroed();
        record.flags = 1 << NESTED_GUEST_MODE;
        assert_eq!(record.to_saved(), Err(SaveError::InvalidRecord(HVM_SAVE_NESTED_VMX)));

        let mut record = NestedVmxRecord::new_zeroed();
        record.flags = 1 << NESTED_CURRENT;
        record.current_vmcs_pa = 0x2000;
        assert!(record.to_saved().is_err());
    }
}
