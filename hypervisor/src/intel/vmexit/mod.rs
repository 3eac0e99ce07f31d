//! A module providing utilities and structures for handling VM exits.
//!
//! Exits taken while the guest hypervisor (L1) runs are emulated here: VMX
//! instructions, the VMX capability MSRs and CPUID. Exits taken while the nested
//! guest (L2) runs are either reflected to L1 as a virtual VM exit or handled on
//! its behalf, see [`nested`].

use {
    crate::{
        error::{FaultDisposition, HypervisorError, VmxFault},
        intel::{
            events::{EventInjection, PendingEvent},
            memory::GuestMemory,
            vcpu::Vcpu,
            vmerror::VmxBasicExitReason,
            vmexit::{
                cpuid::handle_cpuid,
                exception::handle_exception,
                msr::{handle_msr_access, MsrAccessType},
                nested::handle_nested_vmexit,
                rdtsc::handle_rdtsc,
                vmx::handle_vmx_instruction,
            },
        },
    },
    x86::{current::rflags::RFlags, vmx::vmcs::ro},
};

pub mod cpuid;
pub mod exception;
pub mod msr;
pub mod nested;
pub mod rdtsc;
pub mod vmx;

/// Exit information the processor records on a VM exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9 VM-EXIT INFORMATION FIELDS
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub reason: u32,
    pub qualification: u64,
    pub instruction_len: u32,
    pub instruction_info: u32,
    pub interruption_info: u32,
    pub interruption_error_code: u32,
    pub idt_vectoring_info: u32,
    pub idt_vectoring_error_code: u32,
}

/// What the dispatcher did with an exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitType {
    /// Resume the running level as is.
    Continue,
    /// The instruction was emulated; RIP has been moved past it.
    IncrementRIP,
    /// Not emulated here; the caller must handle the exit.
    Unhandled,
}

/// Represents a VM exit, which can be caused by various reasons.
pub struct VmExit;

impl VmExit {
    pub fn new() -> Self {
        Self
    }

    /// Handles the VM-exit.
    ///
    /// This function interprets the VM exit reason and invokes the appropriate handler based on the exit type.
    ///
    /// # Arguments
    ///
    /// * `vcpu` - The vCPU that took the exit.
    /// * `memory` - Guest-physical memory of the vCPU's domain.
    /// * `exit` - The exit information recorded by the processor.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.2 Instructions That Cause VM Exits Unconditionally
    pub fn handle_vmexit<M: GuestMemory + ?Sized>(
        &self,
        vcpu: &mut Vcpu,
        memory: &mut M,
        exit: &ExitInfo,
    ) -> Result<ExitType, HypervisorError> {
        let Some(basic_exit_reason) = VmxBasicExitReason::from_u32(exit.reason) else {
            log::error!("Unknown exit reason: {:#x}", exit.reason);
            return Err(HypervisorError::UnknownVMExitReason(exit.reason));
        };
        log::trace!("vCPU {} basic exit reason: {}", vcpu.id(), basic_exit_reason);

        if vcpu.nested.guest_mode() {
            return handle_nested_vmexit(vcpu, memory, exit, basic_exit_reason);
        }

        let exit_type = match basic_exit_reason {
            VmxBasicExitReason::Cpuid => handle_cpuid(vcpu),
            VmxBasicExitReason::Rdtsc => handle_rdtsc(vcpu),
            VmxBasicExitReason::ExceptionOrNmi => handle_exception(vcpu, exit),
            VmxBasicExitReason::Rdmsr => match handle_msr_access(vcpu, MsrAccessType::Read) {
                Ok(exit_type) => exit_type,
                Err(fault) => Self::reflect_fault(vcpu, fault)?,
            },
            VmxBasicExitReason::Wrmsr => match handle_msr_access(vcpu, MsrAccessType::Write) {
                Ok(exit_type) => exit_type,
                Err(fault) => Self::reflect_fault(vcpu, fault)?,
            },
            reason if reason.is_vmx_instruction() => handle_vmx_instruction(vcpu, memory, exit, reason)?,
            _ => ExitType::Unhandled,
        };

        if exit_type == ExitType::IncrementRIP {
            Self::advance_guest_rip(vcpu, exit);
        }

        Ok(exit_type)
    }

    /// Makes a guest-input fault visible to the guest hypervisor.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 CONVENTIONS
    pub fn reflect_fault(vcpu: &mut Vcpu, fault: VmxFault) -> Result<ExitType, HypervisorError> {
        log::warn!("vCPU {}: {}", vcpu.id(), fault);

        match fault.disposition() {
            FaultDisposition::InvalidOpcode => {
                vcpu.pending_event = Some(PendingEvent::new(EventInjection::invalid_opcode(), 0));
                Ok(ExitType::Continue)
            }
            FaultDisposition::GeneralProtection => {
                vcpu.pending_event = Some(PendingEvent::new(EventInjection::general_protection(), 0));
                Ok(ExitType::Continue)
            }
            FaultDisposition::FailInvalid => {
                Self::vm_fail_invalid(vcpu);
                Ok(ExitType::IncrementRIP)
            }
            FaultDisposition::FailValid(error) => {
                // Without a current VMCS there is nowhere to store the error number.
                match vcpu.nested.current_vmcs_mut() {
                    Some(vmcs) => {
                        vmcs.set(ro::VM_INSTRUCTION_ERROR, error as u64);
                        Self::set_status_flags(vcpu, RFlags::FLAGS_ZF);
                    }
                    None => Self::vm_fail_invalid(vcpu),
                }
                Ok(ExitType::IncrementRIP)
            }
            FaultDisposition::EntryFailure => {
                vcpu.nested.fail_vmentry(&mut vcpu.state, 0)?;
                Ok(ExitType::Continue)
            }
        }
    }

    /// VMsucceed: clears CF, PF, AF, ZF, SF and OF.
    pub fn vm_succeed(vcpu: &mut Vcpu) {
        Self::set_status_flags(vcpu, RFlags::empty());
    }

    /// VMfailInvalid: sets CF and clears the other status flags.
    fn vm_fail_invalid(vcpu: &mut Vcpu) {
        Self::set_status_flags(vcpu, RFlags::FLAGS_CF);
    }

    fn set_status_flags(vcpu: &mut Vcpu, set: RFlags) {
        let status = RFlags::FLAGS_CF
            | RFlags::FLAGS_PF
            | RFlags::FLAGS_AF
            | RFlags::FLAGS_ZF
            | RFlags::FLAGS_SF
            | RFlags::FLAGS_OF;

        let mut flags = RFlags::from_raw(vcpu.state.registers.rflags);
        flags.remove(status);
        flags.insert(set);
        vcpu.state.registers.rflags = flags.bits();
    }

    /// Advances the guest's instruction pointer (RIP) past the instruction that caused the exit.
    pub(crate) fn advance_guest_rip(vcpu: &mut Vcpu, exit: &ExitInfo) {
        let registers = &mut vcpu.state.registers;
        registers.rip = registers.rip.wrapping_add(u64::from(exit.instruction_len));
    }
}

impl Default for VmExit {
    fn default() -> Self {
        Self::new()
    }
}
