//! Handles the `CPUID` instruction executed by the guest hypervisor and controls
//! whether VMX is advertised to it.

use {
    crate::intel::{vcpu::Vcpu, vmexit::ExitType},
    bit_field::BitField,
    x86::cpuid::cpuid,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// CPUID leaves the handler adjusts.
enum CpuidLeaf {
    /// CPUID function for feature information.
    FeatureInformation = 0x1,
}

/// Enumerates specific feature bits in the ECX register for CPUID instruction results.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FeatureBits {
    /// Bit 5 of ECX for CPUID with EAX=1, indicating VMX support.
    VmxSupportBit = 5,
}

/// Handles the `CPUID` VM-exit.
///
/// The instruction is executed on the host and CPUID.1H:ECX.VMX[bit 5] is then
/// forced to match whether nested virtualization is enabled for the domain.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 10.
pub fn handle_cpuid(vcpu: &mut Vcpu) -> ExitType {
    let vmx_supported = vcpu.nested_virtualization();
    let registers = &mut vcpu.state.registers;
    let leaf = registers.rax as u32;
    let sub_leaf = registers.rcx as u32;

    let mut cpuid_result = cpuid!(leaf, sub_leaf);

    if leaf == CpuidLeaf::FeatureInformation as u32 {
        cpuid_result.ecx.set_bit(FeatureBits::VmxSupportBit as usize, vmx_supported);
    }

    registers.rax = cpuid_result.eax as u64;
    registers.rbx = cpuid_result.ebx as u64;
    registers.rcx = cpuid_result.ecx as u64;
    registers.rdx = cpuid_result.edx as u64;

    log::trace!("CPUID {:#x}:{:#x} -> ECX {:#x}", leaf, sub_leaf, registers.rcx);

    ExitType::IncrementRIP
}
