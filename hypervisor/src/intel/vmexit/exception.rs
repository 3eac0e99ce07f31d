//! Exception and NMI exits.

use {
    crate::intel::{
        events::{EventInjection, ExceptionVector, PendingEvent},
        vcpu::Vcpu,
        vmexit::{ExitInfo, ExitType},
        vvmcs::VirtualVmcs,
    },
    bit_field::BitField,
    x86::vmx::vmcs::control,
};

/// Handles an exception or NMI exit by injecting the event back into the level that raised it.
pub fn handle_exception(vcpu: &mut Vcpu, exit: &ExitInfo) -> ExitType {
    let info = EventInjection(exit.interruption_info);
    if !info.valid() {
        log::warn!("Exception exit without valid interruption information: {:#x}", exit.interruption_info);
        return ExitType::Unhandled;
    }

    log::trace!("Exception {} reinjected, error code {:#x}", info.vector(), exit.interruption_error_code);

    let mut event = info;
    event.set_nmi_unblocking(false);
    vcpu.pending_event = Some(PendingEvent {
        info: event,
        error_code: exit.interruption_error_code,
        instruction_len: exit.instruction_len,
    });

    ExitType::Continue
}

/// Whether L1's exception bitmap intercepts `vector` raised in L2.
///
/// A page fault is intercepted when bit 14 of the bitmap is set and the error
/// code matches the mask/match pair, or when bit 14 is clear and it does not.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.2 OTHER CAUSES OF VM EXITS
pub fn intercepts_exception(vmcs: &VirtualVmcs, vector: u8, error_code: u32) -> bool {
    if vector >= 32 {
        return false;
    }

    let bitmap = vmcs.get(control::EXCEPTION_BITMAP) as u32;
    let intercepted = bitmap.get_bit(vector as usize);

    if vector != ExceptionVector::PageFault as u8 {
        return intercepted;
    }

    let mask = vmcs.get(control::PAGE_FAULT_ERR_CODE_MASK) as u32;
    let expected = vmcs.get(control::PAGE_FAULT_ERR_CODE_MATCH) as u32;
    intercepted == (error_code & mask == expected)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::DomainConfig, intel::events::InterruptionType},
    };

    fn vmcs_with_bitmap(bitmap: u32, mask: u32, expected: u32) -> VirtualVmcs {
        let mut vmcs = VirtualVmcs::new(0).unwrap();
        vmcs.set(control::EXCEPTION_BITMAP, u64::from(bitmap));
        vmcs.set(control::PAGE_FAULT_ERR_CODE_MASK, u64::from(mask));
        vmcs.set(control::PAGE_FAULT_ERR_CODE_MATCH, u64::from(expected));
        vmcs
    }

    #[test]
    fn bitmap_selects_vectors() {
        let vmcs = vmcs_with_bitmap(1 << ExceptionVector::GeneralProtection as u32, 0, 0);
        assert!(intercepts_exception(&vmcs, ExceptionVector::GeneralProtection as u8, 0));
        assert!(!intercepts_exception(&vmcs, ExceptionVector::InvalidOpcode as u8, 0));
        assert!(!intercepts_exception(&vmcs, 40, 0));
    }

    #[test]
    fn page_fault_mask_and_match() {
        // Intercept only write faults (error code bit 1).
        let vmcs = vmcs_with_bitmap(1 << 14, 0b10, 0b10);
        assert!(intercepts_exception(&vmcs, 14, 0b11));
        assert!(!intercepts_exception(&vmcs, 14, 0b01));

        // Bit 14 clear inverts the sense.
        let vmcs = vmcs_with_bitmap(0, 0b10, 0b10);
        assert!(!intercepts_exception(&vmcs, 14, 0b10));
        assert!(intercepts_exception(&vmcs, 14, 0b00));
    }

    #[test]
    fn exception_is_reinjected() {
        let mut vcpu = Vcpu::new(0, &DomainConfig::default());
        let info = EventInjection::new(InterruptionType::HardwareException, ExceptionVector::PageFault as u8, true);
        let exit = ExitInfo { interruption_info: info.bits(), interruption_error_code: 6, ..Default::default() };

        assert_eq!(handle_exception(&mut vcpu, &exit), ExitType::Continue);
        let event = vcpu.take_pending_event().unwrap();
        assert_eq!(event.info.vector(), 14);
        assert_eq!(event.error_code, 6);

        assert_eq!(handle_exception(&mut vcpu, &ExitInfo::default()), ExitType::Unhandled);
    }
}
