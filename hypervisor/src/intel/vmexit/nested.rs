//! Exits taken while the nested guest (L2) runs.
//!
//! Each exit is either reflected to the guest hypervisor (L1) as a virtual VM
//! exit, because L1 asked for it through its execution controls, bitmaps or
//! because the instruction always exits, or it is handled by L0 on L2's behalf
//! without L1 noticing.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1 INSTRUCTIONS THAT CAUSE VM EXITS

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{EventInjection, InterruptionType},
            memory::GuestMemory,
            nested::NestedVmx,
            vcpu::Vcpu,
            vmerror::VmxBasicExitReason,
            vmexit::{
                exception::{handle_exception, intercepts_exception},
                msr::{handle_msr_access, MsrAccessType},
                rdtsc::handle_rdtsc,
                ExitInfo,
                ExitType,
                VmExit,
            },
            vvmcs::VirtualVmcs,
        },
    },
    bit_field::BitField,
    x86::vmx::vmcs::control::{self, PinbasedControls, PrimaryControls},
};

/// Ports covered by I/O bitmap A; higher ports are in bitmap B.
const IO_BITMAP_A_PORTS: u32 = 0x8000;

/// MSR bitmap layout: read-low, read-high, write-low, write-high, 1 KiB each.
const MSR_BITMAP_HIGH_OFFSET: u64 = 0x400;
const MSR_BITMAP_WRITE_OFFSET: u64 = 0x800;
const MSR_LOW_RANGE_END: u32 = 0x1FFF;
const MSR_HIGH_RANGE_START: u32 = 0xC000_0000;
const MSR_HIGH_RANGE_END: u32 = 0xC000_1FFF;

/// Handles an exit taken by L2.
pub fn handle_nested_vmexit<M: GuestMemory + ?Sized>(
    vcpu: &mut Vcpu,
    memory: &mut M,
    exit: &ExitInfo,
    reason: VmxBasicExitReason,
) -> Result<ExitType, HypervisorError> {
    if l1_intercepts(vcpu, &*memory, exit, reason)? {
        log::debug!("Reflecting {} to L1", reason);
        vcpu.nested.virtual_vmexit(&mut vcpu.state, &mut vcpu.pending_event, exit)?;
        return Ok(ExitType::Continue);
    }

    if let Some(event) = NestedVmx::idtv_handling(exit) {
        log::trace!("Reinjecting interrupted event {:#x} into L2", event.info.bits());
        vcpu.pending_event = Some(event);
    }

    let exit_type = match reason {
        VmxBasicExitReason::ExceptionOrNmi => handle_exception(vcpu, exit),
        VmxBasicExitReason::Rdtsc => handle_rdtsc(vcpu),
        VmxBasicExitReason::Rdmsr => match handle_msr_access(vcpu, MsrAccessType::Read) {
            Ok(exit_type) => exit_type,
            Err(fault) => VmExit::reflect_fault(vcpu, fault)?,
        },
        VmxBasicExitReason::Wrmsr => match handle_msr_access(vcpu, MsrAccessType::Write) {
            Ok(exit_type) => exit_type,
            Err(fault) => VmExit::reflect_fault(vcpu, fault)?,
        },
        _ => ExitType::Unhandled,
    };

    if exit_type == ExitType::IncrementRIP {
        VmExit::advance_guest_rip(vcpu, exit);
    }

    Ok(exit_type)
}

/// Whether L1 asked to see this exit.
#[rustfmt::skip]
fn l1_intercepts<M: GuestMemory + ?Sized>(
    vcpu: &Vcpu,
    memory: &M,
    exit: &ExitInfo,
    reason: VmxBasicExitReason,
) -> Result<bool, HypervisorError> {
    let Some(vmcs) = vcpu.nested.current_vmcs() else {
        return Err(HypervisorError::MissingCurrentVmcs);
    };

    let pinbased = PinbasedControls::from_bits_truncate(vmcs.get(control::PINBASED_EXEC_CONTROLS) as u32);
    let primary = NestedVmx::primary_controls(vmcs);

    use VmxBasicExitReason::*;
    let intercepted = match reason {
        reason if reason.is_vmx_instruction() => true,
        TripleFault | TaskSwitch | Cpuid | Getsec | Invd | Xsetbv | ControlRegisterAccesses => true,

        ExceptionOrNmi => {
            let info = EventInjection(exit.interruption_info);
            match info.interruption_type() {
                Some(InterruptionType::NonMaskableInterrupt) => pinbased.contains(PinbasedControls::NMI_EXITING),
                _ => intercepts_exception(vmcs, info.vector(), exit.interruption_error_code),
            }
        }
        ExternalInterrupt => pinbased.contains(PinbasedControls::EXTERNAL_INTERRUPT_EXITING),
        VmxPreemptionTimerExpired => pinbased.contains(PinbasedControls::VMX_PREEMPTION_TIMER),

        InterruptWindow => primary.contains(PrimaryControls::INTERRUPT_WINDOW_EXITING),
        NmiWindow => primary.contains(PrimaryControls::NMI_WINDOW_EXITING),
        Hlt => primary.contains(PrimaryControls::HLT_EXITING),
        Invlpg => primary.contains(PrimaryControls::INVLPG_EXITING),
        Rdpmc => primary.contains(PrimaryControls::RDPMC_EXITING),
        Rdtsc | Rdtscp => primary.contains(PrimaryControls::RDTSC_EXITING),
        MovDr => primary.contains(PrimaryControls::MOV_DR_EXITING),
        Mwait => primary.contains(PrimaryControls::MWAIT_EXITING),
        Monitor => primary.contains(PrimaryControls::MONITOR_EXITING),
        Pause => primary.contains(PrimaryControls::PAUSE_EXITING),
        MonitorTrapFlag => primary.contains(PrimaryControls::MONITOR_TRAP_FLAG),

        IoInstruction => match primary.contains(PrimaryControls::USE_IO_BITMAPS) {
            true => io_bitmap_intercepts(vcpu, memory, exit.qualification),
            false => primary.contains(PrimaryControls::UNCOND_IO_EXITING),
        },
        Rdmsr | Wrmsr => match primary.contains(PrimaryControls::USE_MSR_BITMAPS) {
            true => msr_bitmap_intercepts(vmcs, memory, vcpu.state.registers.rcx as u32, reason == Wrmsr),
            false => true,
        },

        _ => false,
    };

    Ok(intercepted)
}

/// I/O bitmaps A and B as latched at VM entry: an access exits when the bit of
/// any port it touches is set.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally
fn io_bitmap_intercepts<M: GuestMemory + ?Sized>(vcpu: &Vcpu, memory: &M, qualification: u64) -> bool {
    let port = qualification.get_bits(16..32) as u32;
    let size = qualification.get_bits(0..3) as u32 + 1;
    let bitmaps = vcpu.nested.io_bitmaps();

    (port..port + size).any(|port| {
        let port = port & 0xFFFF;
        let (bitmap, bit) = match port < IO_BITMAP_A_PORTS {
            true => (bitmaps[0], port),
            false => (bitmaps[1], port - IO_BITMAP_A_PORTS),
        };
        let Some(bitmap) = bitmap else {
            return true;
        };
        bitmap_bit(memory, bitmap + u64::from(bit / 8), bit % 8)
    })
}

/// MSR bitmap lookup; MSRs outside the two covered ranges always exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.9 MSR-Bitmap Address
fn msr_bitmap_intercepts<M: GuestMemory + ?Sized>(vmcs: &VirtualVmcs, memory: &M, msr: u32, write: bool) -> bool {
    let (range_offset, index) = match msr {
        0..=MSR_LOW_RANGE_END => (0, msr),
        MSR_HIGH_RANGE_START..=MSR_HIGH_RANGE_END => (MSR_BITMAP_HIGH_OFFSET, msr - MSR_HIGH_RANGE_START),
        _ => return true,
    };
    let access_offset = if write { MSR_BITMAP_WRITE_OFFSET } else { 0 };

    let bitmap = vmcs.get(control::MSR_BITMAPS_ADDR_FULL);
    bitmap_bit(memory, bitmap + access_offset + range_offset + u64::from(index / 8), index % 8)
}

/// Reads one bitmap bit; an unreadable bitmap counts as set.
fn bitmap_bit<M: GuestMemory + ?Sized>(memory: &M, byte_address: u64, bit: u32) -> bool {
    let mut byte = [0u8; 1];
    match memory.read(byte_address, &mut byte) {
        Ok(()) => byte[0].get_bit(bit as usize),
        Err(error) => {
            log::warn!("Unreadable bitmap byte at {:#x}: {}", byte_address, error);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::{DomainConfig, VVMCS_REVISION},
            intel::{events::ExceptionVector, memory::GuestRam, nested::NestedState},
        },
        x86::vmx::vmcs::{guest, host, ro},
    };

    const IO_BITMAP_A: u64 = 0x4000;
    const IO_BITMAP_B: u64 = 0x5000;
    const MSR_BITMAP: u64 = 0x6000;

    fn running_l2(primary: PrimaryControls) -> (Vcpu, GuestRam) {
        let mut ram = GuestRam::new(0x10000);
        ram.write_u32(0x2000, VVMCS_REVISION).unwrap();

        let mut vcpu = Vcpu::new(0, &DomainConfig::default());
        vcpu.nested.enter_vmx_operation(0x1000);
        vcpu.nested.make_current(&mut ram, 0x2000).unwrap();
        let vmcs = vcpu.nested.current_vmcs_mut().unwrap();
        vmcs.set(control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(primary.bits()));
        vmcs.set(control::IO_BITMAP_A_ADDR_FULL, IO_BITMAP_A);
        vmcs.set(control::IO_BITMAP_B_ADDR_FULL, IO_BITMAP_B);
        vmcs.set(control::MSR_BITMAPS_ADDR_FULL, MSR_BITMAP);
        vmcs.set(host::RIP, 0x8000);
        vmcs.set(guest::RIP, 0x40_0000);
        vcpu.nested.virtual_vmentry(&mut vcpu.state, &mut vcpu.pending_event, true).unwrap();
        (vcpu, ram)
    }

    fn exit(vcpu: &mut Vcpu, ram: &mut GuestRam, exit: ExitInfo) -> ExitType {
        vcpu.handle_vmexit(ram, &exit).unwrap()
    }

    fn simple(reason: VmxBasicExitReason) -> ExitInfo {
        ExitInfo { reason: reason as u32, instruction_len: 1, ..Default::default() }
    }

    fn reflected_reason(vcpu: &Vcpu) -> Option<u64> {
        match vcpu.nested.state() {
            NestedState::Active => vcpu.nested.current_vmcs().map(|vmcs| vmcs.get(ro::EXIT_REASON)),
            _ => None,
        }
    }

    #[test]
    fn hlt_follows_l1_control() {
        let (mut vcpu, mut ram) = running_l2(PrimaryControls::empty());
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Hlt)), ExitType::Unhandled);
        assert!(vcpu.nested.guest_mode());

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::HLT_EXITING);
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Hlt)), ExitType::Continue);
        assert_eq!(reflected_reason(&vcpu), Some(VmxBasicExitReason::Hlt as u64));
        assert_eq!(vcpu.state.registers.rip, 0x8000);
    }

    #[test]
    fn io_bitmaps_select_ports() {
        let (mut vcpu, mut ram) = running_l2(PrimaryControls::USE_IO_BITMAPS);
        // Port 0x60 in bitmap A, port 0x8001 in bitmap B.
        ram.write(IO_BITMAP_A + 0x60 / 8, &[1 << (0x60 % 8)]).unwrap();
        ram.write(IO_BITMAP_B, &[0b10]).unwrap();

        let io = |port: u64, size: u64| ExitInfo {
            reason: VmxBasicExitReason::IoInstruction as u32,
            qualification: port << 16 | (size - 1),
            ..Default::default()
        };

        assert_eq!(exit(&mut vcpu, &mut ram, io(0x61, 1)), ExitType::Unhandled);
        assert_eq!(exit(&mut vcpu, &mut ram, io(0x8000, 1)), ExitType::Unhandled);

        // A two-byte access to 0x5F also touches 0x60.
        assert_eq!(exit(&mut vcpu, &mut ram, io(0x5F, 2)), ExitType::Continue);
        assert_eq!(reflected_reason(&vcpu), Some(VmxBasicExitReason::IoInstruction as u64));

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::USE_IO_BITMAPS);
        ram.write(IO_BITMAP_B, &[0b10]).unwrap();
        assert_eq!(exit(&mut vcpu, &mut ram, io(0x8001, 1)), ExitType::Continue);
    }

    #[test]
    fn unconditional_io_exiting() {
        let io = ExitInfo { reason: VmxBasicExitReason::IoInstruction as u32, ..Default::default() };

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::empty());
        assert_eq!(exit(&mut vcpu, &mut ram, io), ExitType::Unhandled);

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::UNCOND_IO_EXITING);
        assert_eq!(exit(&mut vcpu, &mut ram, io), ExitType::Continue);
        assert!(!vcpu.nested.guest_mode());
    }

    #[test]
    fn msr_bitmaps_select_msrs() {
        let (mut vcpu, mut ram) = running_l2(PrimaryControls::USE_MSR_BITMAPS);
        // Reads of 0x10 and writes of 0xC0000080 exit.
        ram.write(MSR_BITMAP + 2, &[0b1]).unwrap();
        ram.write(MSR_BITMAP + MSR_BITMAP_WRITE_OFFSET + MSR_BITMAP_HIGH_OFFSET + 0x10, &[0b1]).unwrap();

        vcpu.state.registers.rcx = 0x11;
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Rdmsr)), ExitType::Unhandled);
        vcpu.state.registers.rcx = 0xC000_0080;
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Rdmsr)), ExitType::Unhandled);
        vcpu.state.registers.rcx = 0x4000_0000;
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Rdmsr)), ExitType::Continue);

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::USE_MSR_BITMAPS);
        ram.write(MSR_BITMAP + MSR_BITMAP_WRITE_OFFSET + MSR_BITMAP_HIGH_OFFSET + 0x10, &[0b1]).unwrap();
        vcpu.state.registers.rcx = 0xC000_0080;
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Wrmsr)), ExitType::Continue);

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::empty());
        vcpu.state.registers.rcx = 0x11;
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Rdmsr)), ExitType::Continue);
    }

    #[test]
    fn unintercepted_exception_is_reinjected_into_l2() {
        let (mut vcpu, mut ram) = running_l2(PrimaryControls::empty());
        let info = EventInjection::new(InterruptionType::HardwareException, ExceptionVector::PageFault as u8, true);
        let fault = ExitInfo {
            reason: VmxBasicExitReason::ExceptionOrNmi as u32,
            interruption_info: info.bits(),
            interruption_error_code: 2,
            ..Default::default()
        };

        assert_eq!(exit(&mut vcpu, &mut ram, fault), ExitType::Continue);
        assert!(vcpu.nested.guest_mode());
        assert_eq!(vcpu.pending_event.map(|event| event.info.vector()), Some(14));

        vcpu.pending_event = None;
        vcpu.nested.current_vmcs_mut().unwrap().set(control::EXCEPTION_BITMAP, 1 << 14);
        assert_eq!(exit(&mut vcpu, &mut ram, fault), ExitType::Continue);
        assert_eq!(reflected_reason(&vcpu), Some(0));
    }

    #[test]
    fn interrupted_delivery_is_reinjected_for_l0_exits() {
        let (mut vcpu, mut ram) = running_l2(PrimaryControls::empty());
        let event = EventInjection::external_interrupt(0x41);
        let ept = ExitInfo {
            reason: VmxBasicExitReason::EptViolation as u32,
            idt_vectoring_info: event.bits(),
            ..Default::default()
        };

        assert_eq!(exit(&mut vcpu, &mut ram, ept), ExitType::Unhandled);
        assert_eq!(vcpu.pending_event.map(|pending| pending.info.vector()), Some(0x41));
    }

    #[test]
    fn rdtsc_in_l2_is_emulated_unless_intercepted() {
        let (mut vcpu, mut ram) = running_l2(PrimaryControls::USE_TSC_OFFSETTING);
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Rdtsc)), ExitType::IncrementRIP);
        assert_eq!(vcpu.state.registers.rip, 0x40_0001);

        let (mut vcpu, mut ram) = running_l2(PrimaryControls::RDTSC_EXITING);
        assert_eq!(exit(&mut vcpu, &mut ram, simple(VmxBasicExitReason::Rdtsc)), ExitType::Continue);
        assert_eq!(reflected_reason(&vcpu), Some(VmxBasicExitReason::Rdtsc as u64));
    }
}
