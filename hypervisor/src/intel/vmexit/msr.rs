//! Emulates the VMX capability MSRs seen by the guest hypervisor.
//!
//! The values describe the virtual VMX implementation rather than the host
//! processor: only the controls the nested dispatcher honours can be set, the
//! virtual VMCS revision is reported in IA32_VMX_BASIC, and the TRUE_* and
//! EPT/VPID capability MSRs are not exposed. Any other MSR is left to the caller.

use {
    crate::{
        config::{PAGE_SIZE, VVMCS_REVISION},
        error::VmxFault,
        intel::{vcpu::Vcpu, vmexit::ExitType},
    },
    x86::{
        msr,
        vmx::vmcs::control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
    },
};

/// Enum representing the type of MSR access.
///
/// There are two types of MSR access: reading from an MSR and writing to an MSR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

/// IA32_FEATURE_CONTROL.Lock
const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
/// IA32_FEATURE_CONTROL.EnableVmxOutsideSmx
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// IA32_VMX_BASIC: memory type write-back.
const VMX_BASIC_MEMORY_TYPE_WB: u64 = 6;

/// Default1 class of each control MSR: bits that must be 1.
const PINBASED_DEFAULT1: u32 = 0x0000_0016;
const PROCBASED_DEFAULT1: u32 = 0x0401_E172;
const EXIT_DEFAULT1: u32 = 0x0003_6DFF;
const ENTRY_DEFAULT1: u32 = 0x0000_11FF;

/// IA32_VMX_MISC: the preemption timer counts at TSC >> 5.
const VMX_MISC: u64 = 1 << 5;

const CR0_FIXED0: u64 = 0x8000_0021;
const CR0_FIXED1: u64 = 0xFFFF_FFFF;
const CR4_FIXED0: u64 = 0x2000;
const CR4_FIXED1: u64 = 0x0037_27FF;

/// Highest index used in any VMCS field encoding, in bits 9:1.
const VMCS_ENUM: u64 = 0x3E;

fn supported_pinbased() -> PinbasedControls {
    PinbasedControls::EXTERNAL_INTERRUPT_EXITING | PinbasedControls::NMI_EXITING | PinbasedControls::VIRTUAL_NMIS
}

fn supported_procbased() -> PrimaryControls {
    PrimaryControls::INTERRUPT_WINDOW_EXITING
        | PrimaryControls::USE_TSC_OFFSETTING
        | PrimaryControls::HLT_EXITING
        | PrimaryControls::INVLPG_EXITING
        | PrimaryControls::MWAIT_EXITING
        | PrimaryControls::RDPMC_EXITING
        | PrimaryControls::RDTSC_EXITING
        | PrimaryControls::CR3_LOAD_EXITING
        | PrimaryControls::CR3_STORE_EXITING
        | PrimaryControls::CR8_LOAD_EXITING
        | PrimaryControls::CR8_STORE_EXITING
        | PrimaryControls::NMI_WINDOW_EXITING
        | PrimaryControls::MOV_DR_EXITING
        | PrimaryControls::UNCOND_IO_EXITING
        | PrimaryControls::USE_IO_BITMAPS
        | PrimaryControls::MONITOR_TRAP_FLAG
        | PrimaryControls::USE_MSR_BITMAPS
        | PrimaryControls::MONITOR_EXITING
        | PrimaryControls::PAUSE_EXITING
        | PrimaryControls::SECONDARY_CONTROLS
}

fn supported_exit() -> ExitControls {
    ExitControls::HOST_ADDRESS_SPACE_SIZE
        | ExitControls::ACK_INTERRUPT_ON_EXIT
        | ExitControls::SAVE_IA32_EFER
        | ExitControls::LOAD_IA32_EFER
}

fn supported_entry() -> EntryControls {
    EntryControls::IA32E_MODE_GUEST | EntryControls::LOAD_IA32_EFER
}

fn supported_secondary() -> SecondaryControls {
    SecondaryControls::ENABLE_RDTSCP
}

/// Control capability MSR: allowed-0 settings in the low half, allowed-1 settings in the high half.
fn control_capability(default1: u32, supported: u32) -> u64 {
    u64::from(default1) | u64::from(default1 | supported) << 32
}

/// Whether `msr` belongs to the VMX capability range.
fn is_vmx_capability_msr(msr: u32) -> bool {
    (msr::IA32_VMX_BASIC..=msr::IA32_VMX_VMFUNC).contains(&msr)
}

/// Value of a virtual VMX capability MSR, or the fault a read raises.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.1 BASIC VMX INFORMATION
pub fn vmx_capability(msr: u32, nested_virtualization: bool) -> Result<u64, VmxFault> {
    if msr == msr::IA32_FEATURE_CONTROL {
        return Ok(match nested_virtualization {
            true => FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_OUTSIDE_SMX,
            false => FEATURE_CONTROL_LOCKED,
        });
    }

    if !nested_virtualization {
        return Err(VmxFault::UnsupportedMsr(msr));
    }

    let value = match msr {
        msr::IA32_VMX_BASIC => {
            u64::from(VVMCS_REVISION) | (PAGE_SIZE as u64) << 32 | VMX_BASIC_MEMORY_TYPE_WB << 50
        }
        msr::IA32_VMX_PINBASED_CTLS => control_capability(PINBASED_DEFAULT1, supported_pinbased().bits()),
        msr::IA32_VMX_PROCBASED_CTLS => control_capability(PROCBASED_DEFAULT1, supported_procbased().bits()),
        msr::IA32_VMX_EXIT_CTLS => control_capability(EXIT_DEFAULT1, supported_exit().bits()),
        msr::IA32_VMX_ENTRY_CTLS => control_capability(ENTRY_DEFAULT1, supported_entry().bits()),
        msr::IA32_VMX_PROCBASED_CTLS2 => control_capability(0, supported_secondary().bits()),
        msr::IA32_VMX_MISC => VMX_MISC,
        msr::IA32_VMX_CR0_FIXED0 => CR0_FIXED0,
        msr::IA32_VMX_CR0_FIXED1 => CR0_FIXED1,
        msr::IA32_VMX_CR4_FIXED0 => CR4_FIXED0,
        msr::IA32_VMX_CR4_FIXED1 => CR4_FIXED1,
        msr::IA32_VMX_VMCS_ENUM => VMCS_ENUM,
        _ => return Err(VmxFault::UnsupportedMsr(msr)),
    };

    Ok(value)
}

/// Handles RDMSR and WRMSR exits taken by the guest hypervisor.
///
/// Reads of the VMX capability MSRs return the virtual capabilities in EDX:EAX.
/// Writes to them, or to the locked IA32_FEATURE_CONTROL, raise #GP(0). Every
/// other MSR is returned as [`ExitType::Unhandled`].
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: RDMSR—Read From Model Specific Register or WRMSR—Write to Model Specific Register
/// and Table C-1. Basic Exit Reasons 31 and 32.
pub fn handle_msr_access(vcpu: &mut Vcpu, access_type: MsrAccessType) -> Result<ExitType, VmxFault> {
    const MSR_MASK_LOW: u64 = u32::MAX as u64;

    let msr_id = vcpu.state.registers.rcx as u32;
    if msr_id != msr::IA32_FEATURE_CONTROL && !is_vmx_capability_msr(msr_id) {
        return Ok(ExitType::Unhandled);
    }

    match access_type {
        MsrAccessType::Read => {
            let msr_value = vmx_capability(msr_id, vcpu.nested_virtualization())?;
            let registers = &mut vcpu.state.registers;
            registers.rdx = msr_value >> 32;
            registers.rax = msr_value & MSR_MASK_LOW;
            log::trace!("RDMSR {:#x} -> {:#x}", msr_id, msr_value);
        }
        MsrAccessType::Write => return Err(VmxFault::ReadOnlyMsr(msr_id)),
    }

    Ok(ExitType::IncrementRIP)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::DomainConfig,
            intel::{events::ExceptionVector, memory::GuestRam, vmerror::VmxBasicExitReason, vmexit::ExitInfo},
        },
    };

    fn rdmsr(vcpu: &mut Vcpu, msr: u32) -> ExitType {
        let mut ram = GuestRam::new(0x1000);
        vcpu.state.registers.rcx = u64::from(msr);
        let exit = ExitInfo { reason: VmxBasicExitReason::Rdmsr as u32, instruction_len: 2, ..Default::default() };
        vcpu.handle_vmexit(&mut ram, &exit).unwrap()
    }

    fn edx_eax(vcpu: &Vcpu) -> u64 {
        vcpu.state.registers.rdx << 32 | vcpu.state.registers.rax
    }

    #[test]
    fn vmx_basic_reports_virtual_revision() {
        let mut vcpu = Vcpu::new(0, &DomainConfig::default());
        assert_eq!(rdmsr(&mut vcpu, msr::IA32_VMX_BASIC), ExitType::IncrementRIP);

        let value = edx_eax(&vcpu);
        assert_eq!(value as u32, VVMCS_REVISION);
        assert_eq!((value >> 32) & 0x1FFF, 0x1000);
        assert_eq!((value >> 50) & 0xF, 6);
        assert_eq!(vcpu.state.registers.rip, 0xFFF2);
    }

    #[test]
    fn control_msrs_keep_default1_bits() {
        let value = vmx_capability(msr::IA32_VMX_PROCBASED_CTLS, true).unwrap();
        let allowed0 = value as u32;
        let allowed1 = (value >> 32) as u32;

        assert_eq!(allowed0, PROCBASED_DEFAULT1);
        assert_eq!(allowed1 & allowed0, allowed0);
        assert_ne!(allowed1 & PrimaryControls::USE_IO_BITMAPS.bits(), 0);
        assert_eq!(allowed1 & PrimaryControls::USE_TPR_SHADOW.bits(), 0);

        let secondary = vmx_capability(msr::IA32_VMX_PROCBASED_CTLS2, true).unwrap();
        assert_eq!(secondary >> 32, u64::from(SecondaryControls::ENABLE_RDTSCP.bits()));
    }

    #[test]
    fn feature_control_is_locked() {
        assert_eq!(vmx_capability(msr::IA32_FEATURE_CONTROL, true), Ok(0b101));
        assert_eq!(vmx_capability(msr::IA32_FEATURE_CONTROL, false), Ok(0b001));
    }

    #[test]
    fn hidden_msrs_raise_general_protection() {
        let mut vcpu = Vcpu::new(0, &DomainConfig::default());
        assert_eq!(rdmsr(&mut vcpu, msr::IA32_VMX_TRUE_PINBASED_CTLS), ExitType::Continue);
        assert_eq!(
            vcpu.take_pending_event().map(|event| event.info.vector()),
            Some(ExceptionVector::GeneralProtection as u8)
        );

        let config = DomainConfig { nested_virtualization: false, ..Default::default() };
        let mut vcpu = Vcpu::new(0, &config);
        rdmsr(&mut vcpu, msr::IA32_VMX_BASIC);
        assert!(vcpu.pending_event.is_some());
    }

    #[test]
    fn writes_are_rejected_and_other_msrs_unhandled() {
        let mut vcpu = Vcpu::new(0, &DomainConfig::default());
        vcpu.state.registers.rcx = u64::from(msr::IA32_VMX_CR0_FIXED0);
        assert_eq!(
            handle_msr_access(&mut vcpu, MsrAccessType::Write),
            Err(VmxFault::ReadOnlyMsr(msr::IA32_VMX_CR0_FIXED0))
        );

        vcpu.state.registers.rcx = u64::from(msr::IA32_EFER);
        assert_eq!(handle_msr_access(&mut vcpu, MsrAccessType::Read), Ok(ExitType::Unhandled));
    }
}
