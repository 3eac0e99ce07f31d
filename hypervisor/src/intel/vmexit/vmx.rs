//! Emulation of the VMX instructions executed by the guest hypervisor.
//!
//! Every handler validates its operands in the order the processor does and
//! reports malformed guest input as a [`VmxFault`]. Only host-side failures,
//! such as running out of memory for a virtual VMCS shadow, are returned as
//! errors.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.3 VMX INSTRUCTIONS

use {
    crate::{
        config::{PAGE_SIZE, VVMCS_REVISION},
        error::{HypervisorError, VmxFault},
        intel::{
            instruction::{VmxInstructionInfo, VmxOperand},
            memory::GuestMemory,
            vcpu::Vcpu,
            vmerror::VmxBasicExitReason,
            vmexit::{ExitInfo, ExitType, VmExit},
            vvmcs::VirtualVmcs,
        },
    },
    bit_field::BitField,
    x86::vmx::vmcs::{control, guest, host},
    x86_64::PhysAddr,
};

/// Result of emulating one VMX instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxOutcome {
    /// VMsucceed.
    Succeeded,
    /// The guest sees a fault or a VMfail.
    Failed(VmxFault),
    /// A virtual VM entry took place; L2 is now running.
    EnteredNested,
}

/// Control fields that must be written before a VM entry.
const REQUIRED_CONTROL_FIELDS: [u32; 4] = [
    control::PINBASED_EXEC_CONTROLS,
    control::PRIMARY_PROCBASED_EXEC_CONTROLS,
    control::VMEXIT_CONTROLS,
    control::VMENTRY_CONTROLS,
];

const REQUIRED_HOST_FIELDS: [u32; 2] = [host::RIP, host::RSP];

const REQUIRED_GUEST_FIELDS: [u32; 2] = [guest::RIP, guest::RSP];

/// CR4.VMXE
const CR4_VMXE: usize = 13;

/// Unwraps a guest-input check, turning a fault into the instruction's outcome.
macro_rules! check {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(fault) => return Ok(VmxOutcome::Failed(fault)),
        }
    };
}

/// Emulates the VMX instruction behind `reason` and applies its outcome.
pub fn handle_vmx_instruction<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
    reason: VmxBasicExitReason,
) -> Result<ExitType, HypervisorError> {
    let outcome = match reason {
        VmxBasicExitReason::Vmxon => handle_vmxon(vcpu, memory, exit)?,
        VmxBasicExitReason::Vmxoff => handle_vmxoff(vcpu, memory)?,
        VmxBasicExitReason::Vmptrld => handle_vmptrld(vcpu, memory, exit)?,
        VmxBasicExitReason::Vmptrst => handle_vmptrst(vcpu, memory, exit)?,
        VmxBasicExitReason::Vmclear => handle_vmclear(vcpu, memory, exit)?,
        VmxBasicExitReason::Vmread => handle_vmread(vcpu, memory, exit)?,
        VmxBasicExitReason::Vmwrite => handle_vmwrite(vcpu, memory, exit)?,
        VmxBasicExitReason::Vmlaunch => handle_vmentry(vcpu, true)?,
        VmxBasicExitReason::Vmresume => handle_vmentry(vcpu, false)?,
        _ => VmxOutcome::Failed(VmxFault::UnsupportedInstruction),
    };

    log::trace!("{} -> {:?}", reason, outcome);

    match outcome {
        VmxOutcome::Succeeded => {
            VmExit::vm_succeed(vcpu);
            Ok(ExitType::IncrementRIP)
        }
        VmxOutcome::EnteredNested => Ok(ExitType::Continue),
        VmxOutcome::Failed(fault) => VmExit::reflect_fault(vcpu, fault),
    }
}

/// VMX instructions other than VMXON require VMX operation.
fn require_vmx_operation(vcpu: &Vcpu) -> Result<(), VmxFault> {
    if !vcpu.nested_virtualization() {
        return Err(VmxFault::NestedVirtualizationDisabled);
    }
    if !vcpu.nested.in_vmx_operation() {
        return Err(VmxFault::NotInVmxOperation);
    }
    Ok(())
}

fn decode_operand(vcpu: &Vcpu, exit: &ExitInfo) -> Result<VmxOperand, VmxFault> {
    VmxInstructionInfo(exit.instruction_info)
        .decode_operand(exit.qualification, &vcpu.state.registers, &vcpu.state.segments)
        .map_err(|_| VmxFault::MalformedOperand)
}

fn memory_operand(vcpu: &Vcpu, exit: &ExitInfo) -> Result<u64, VmxFault> {
    match decode_operand(vcpu, exit)? {
        VmxOperand::Memory(address) => Ok(address),
        VmxOperand::Register(_) => Err(VmxFault::MemoryOperandRequired),
    }
}

/// Reads the 64-bit physical address held by the m64 operand.
fn read_pointer<M: GuestMemory + ?Sized>(vcpu: &Vcpu, memory: &M, exit: &ExitInfo) -> Result<u64, VmxFault> {
    let address = memory_operand(vcpu, exit)?;
    memory.read_u64(address).map_err(|_| VmxFault::InaccessibleOperand(address))
}

/// A region pointer must be 4-KByte aligned and within the physical-address width.
fn is_valid_region_pointer(vcpu: &Vcpu, pointer: u64) -> bool {
    let aligned = PhysAddr::try_new(pointer).map_or(false, |address| address.is_aligned(PAGE_SIZE as u64));
    aligned && pointer < vcpu.physical_address_limit()
}

/// Register holding the VMCS component encoding for VMREAD and VMWRITE.
fn field_encoding(vcpu: &Vcpu, exit: &ExitInfo) -> Result<u32, VmxFault> {
    let register = VmxInstructionInfo(exit.instruction_info).encoding_register();
    let value = vcpu.state.registers.get(register);
    u32::try_from(value).map_err(|_| VmxFault::InvalidField(value as u32))
}

/// VMXON: enters VMX operation.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMXON—Enter VMX Operation
pub fn handle_vmxon<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
) -> Result<VmxOutcome, HypervisorError> {
    if !vcpu.nested_virtualization() {
        return Ok(VmxOutcome::Failed(VmxFault::NestedVirtualizationDisabled));
    }
    if !vcpu.state.cr4.get_bit(CR4_VMXE) {
        return Ok(VmxOutcome::Failed(VmxFault::VmxeClear));
    }
    if vcpu.nested.in_vmx_operation() {
        return Ok(VmxOutcome::Failed(VmxFault::VmxonInVmxOperation));
    }

    let pointer = check!(read_pointer(vcpu, &*memory, exit));
    if !is_valid_region_pointer(vcpu, pointer) {
        return Ok(VmxOutcome::Failed(VmxFault::InvalidOperand(pointer)));
    }

    match VirtualVmcs::peek_revision(&*memory, pointer) {
        Ok(VVMCS_REVISION) => {}
        Ok(revision) => {
            log::warn!("VMXON region {:#x} has revision {:#x}", pointer, revision);
            return Ok(VmxOutcome::Failed(VmxFault::InvalidOperand(pointer)));
        }
        Err(_) => return Ok(VmxOutcome::Failed(VmxFault::InvalidOperand(pointer))),
    }

    vcpu.nested.enter_vmx_operation(pointer);
    Ok(VmxOutcome::Succeeded)
}

/// VMXOFF: leaves VMX operation from any state other than L2 running.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMXOFF—Leave VMX Operation
pub fn handle_vmxoff<M: GuestMemory + ?Sized>(vcpu: &mut Vcpu, memory: &mut M) -> Result<VmxOutcome, HypervisorError> {
    if !vcpu.nested_virtualization() {
        return Ok(VmxOutcome::Failed(VmxFault::NestedVirtualizationDisabled));
    }

    vcpu.nested.leave_vmx_operation(memory)?;
    Ok(VmxOutcome::Succeeded)
}

/// VMPTRLD: makes a virtual VMCS current.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMPTRLD—Load Pointer to Virtual-Machine Control Structure
pub fn handle_vmptrld<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
) -> Result<VmxOutcome, HypervisorError> {
    check!(require_vmx_operation(vcpu));

    let pointer = check!(read_pointer(vcpu, &*memory, exit));
    if !is_valid_region_pointer(vcpu, pointer) {
        return Ok(VmxOutcome::Failed(VmxFault::InvalidPointer(pointer)));
    }
    if vcpu.nested.vmxon_region() == Some(pointer) {
        return Ok(VmxOutcome::Failed(VmxFault::VmxonPointer));
    }

    let revision = check!(VirtualVmcs::peek_revision(&*memory, pointer).map_err(|_| VmxFault::InvalidPointer(pointer)));
    if revision != VVMCS_REVISION {
        return Ok(VmxOutcome::Failed(VmxFault::RevisionMismatch(revision)));
    }

    vcpu.nested.make_current(memory, pointer)?;
    Ok(VmxOutcome::Succeeded)
}

/// VMPTRST: stores the current-VMCS pointer, all ones when there is none.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMPTRST—Store Pointer to Virtual-Machine Control Structure
pub fn handle_vmptrst<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
) -> Result<VmxOutcome, HypervisorError> {
    check!(require_vmx_operation(vcpu));

    let address = check!(memory_operand(vcpu, exit));
    let pointer = vcpu.nested.current_pointer().unwrap_or(u64::MAX);
    check!(memory.write_u64(address, pointer).map_err(|_| VmxFault::InaccessibleOperand(address)));

    Ok(VmxOutcome::Succeeded)
}

/// VMCLEAR: writes a region back and sets its launch state to clear.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMCLEAR—Clear Virtual-Machine Control Structure
pub fn handle_vmclear<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
) -> Result<VmxOutcome, HypervisorError> {
    check!(require_vmx_operation(vcpu));

    let pointer = check!(read_pointer(vcpu, &*memory, exit));
    if !is_valid_region_pointer(vcpu, pointer) || memory.read_u32(pointer).is_err() {
        return Ok(VmxOutcome::Failed(VmxFault::InvalidClearPointer(pointer)));
    }
    if vcpu.nested.vmxon_region() == Some(pointer) {
        return Ok(VmxOutcome::Failed(VmxFault::ClearVmxonPointer));
    }

    vcpu.nested.clear(memory, pointer)?;
    Ok(VmxOutcome::Succeeded)
}

/// VMREAD: copies a field of the current virtual VMCS to a register or memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMREAD—Read Field from Virtual-Machine Control Structure
pub fn handle_vmread<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
) -> Result<VmxOutcome, HypervisorError> {
    check!(require_vmx_operation(vcpu));

    let Some(vmcs) = vcpu.nested.current_vmcs() else {
        return Ok(VmxOutcome::Failed(VmxFault::NoCurrentVmcs));
    };
    let encoding = check!(field_encoding(vcpu, exit));
    let value = check!(vmcs.guest_read(encoding));

    match check!(decode_operand(vcpu, exit)) {
        VmxOperand::Register(register) => vcpu.state.registers.set(register, value),
        VmxOperand::Memory(address) => {
            check!(memory.write_u64(address, value).map_err(|_| VmxFault::InaccessibleOperand(address)))
        }
    }

    log::trace!("VMREAD {:#x} -> {:#x}", encoding, value);
    Ok(VmxOutcome::Succeeded)
}

/// VMWRITE: copies a register or memory operand into a field of the current virtual VMCS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMWRITE—Write Field to Virtual-Machine Control Structure
pub fn handle_vmwrite<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
) -> Result<VmxOutcome, HypervisorError> {
    check!(require_vmx_operation(vcpu));

    if vcpu.nested.current_vmcs().is_none() {
        return Ok(VmxOutcome::Failed(VmxFault::NoCurrentVmcs));
    }
    let encoding = check!(field_encoding(vcpu, exit));

    let value = match check!(decode_operand(vcpu, exit)) {
        VmxOperand::Register(register) => vcpu.state.registers.get(register),
        VmxOperand::Memory(address) => {
            check!(memory.read_u64(address).map_err(|_| VmxFault::InaccessibleOperand(address)))
        }
    };

    let Some(vmcs) = vcpu.nested.current_vmcs_mut() else {
        return Ok(VmxOutcome::Failed(VmxFault::NoCurrentVmcs));
    };
    check!(vmcs.guest_write(encoding, value));

    log::trace!("VMWRITE {:#x} <- {:#x}", encoding, value);
    Ok(VmxOutcome::Succeeded)
}

/// VMLAUNCH and VMRESUME: virtual VM entry into L2.
///
/// Checks run in architectural order: launch state, control fields, host-state
/// fields and finally guest-state fields. A guest-state failure is not a VMfail
/// but a VM exit delivered to L1.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: VMLAUNCH/VMRESUME—Launch/Resume Virtual Machine
pub fn handle_vmentry(vcpu: &mut Vcpu, launch: bool) -> Result<VmxOutcome, HypervisorError> {
    check!(require_vmx_operation(vcpu));

    let Some(current) = vcpu.nested.current() else {
        return Ok(VmxOutcome::Failed(VmxFault::NoCurrentVmcs));
    };

    let launched = current.vmcs.is_launched();
    if launch && launched {
        return Ok(VmxOutcome::Failed(VmxFault::LaunchNonClear));
    }
    if !launch && !launched {
        return Ok(VmxOutcome::Failed(VmxFault::ResumeNonLaunched));
    }

    let vmcs = &current.vmcs;
    if let Some(field) = REQUIRED_CONTROL_FIELDS.iter().find(|field| !vmcs.is_written(**field)) {
        return Ok(VmxOutcome::Failed(VmxFault::EntryInvalidControlField(*field)));
    }
    if let Some(field) = REQUIRED_HOST_FIELDS.iter().find(|field| !vmcs.is_written(**field)) {
        return Ok(VmxOutcome::Failed(VmxFault::EntryInvalidHostState(*field)));
    }
    if let Some(field) = REQUIRED_GUEST_FIELDS.iter().find(|field| !vmcs.is_written(**field)) {
        return Ok(VmxOutcome::Failed(VmxFault::EntryInvalidGuestState(*field)));
    }

    vcpu.nested.virtual_vmentry(&mut vcpu.state, &mut vcpu.pending_event, launch)?;
    Ok(VmxOutcome::EnteredNested)
}
