//! Handles the `RDTSC` instruction, applying the TSC offset L1 programmed for
//! L2 while the nested guest runs.

use {
    crate::intel::{vcpu::Vcpu, vmexit::ExitType},
    x86::time::rdtsc,
};

/// Handles the `RDTSC` VM-exit.
///
/// Reads the host's time-stamp counter, adds the nested TSC offset when L2 is
/// running, and returns the low and high halves in RAX and RDX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 16.
pub fn handle_rdtsc(vcpu: &mut Vcpu) -> ExitType {
    let offset = match vcpu.nested.guest_mode() {
        true => vcpu.nested.tsc_offset(),
        false => 0,
    };

    let tsc = unsafe { rdtsc() }.wrapping_add(offset);

    let registers = &mut vcpu.state.registers;
    registers.rax = tsc & 0xFFFFFFFF; // Low 32 bits
    registers.rdx = tsc >> 32; // High 32 bits

    ExitType::IncrementRIP
}
