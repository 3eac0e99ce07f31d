//! Event injection for both levels of guest.
//!
//! The same interruption-information format is used for the VM-entry
//! interruption-information field, the VM-exit interruption information and the
//! IDT-vectoring information, so one type covers all three.

use {bitfield::bitfield, bitflags::bitflags};

bitfield! {
    /// Interruption-information field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub u8, vector, set_vector: 7, 0;

    /// Interruption type, see [`InterruptionType`].
    pub u8, kind, set_kind: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub deliver_error_code, set_deliver_error_code: 11;

    /// NMI unblocking due to IRET (exit information only)
    pub nmi_unblocking, set_nmi_unblocking: 12;

    // Reserved: 30:13

    /// Valid
    pub valid, set_valid: 31;
}

/// Exceptions the dispatcher raises or inspects.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-1. Exceptions and Interrupts
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionVector {
    InvalidOpcode = 6,
    GeneralProtection = 13,
    PageFault = 14,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

bitflags! {
    /// Guest interruptibility state.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-3. Format of Interruptibility State
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptibilityState: u32 {
        const BLOCKING_BY_STI = 1 << 0;
        const BLOCKING_BY_MOV_SS = 1 << 1;
        const BLOCKING_BY_SMI = 1 << 2;
        const BLOCKING_BY_NMI = 1 << 3;
    }
}

impl EventInjection {
    /// Builds a valid event of the given type.
    pub fn new(kind: InterruptionType, vector: u8, deliver_error_code: bool) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(vector);
        event.set_kind(kind as u8);
        event.set_deliver_error_code(deliver_error_code);
        event.set_valid(true);
        event
    }

    /// #UD, delivered without an error code.
    pub fn invalid_opcode() -> Self {
        Self::new(InterruptionType::HardwareException, ExceptionVector::InvalidOpcode as u8, false)
    }

    /// #GP, delivered with an error code.
    pub fn general_protection() -> Self {
        Self::new(InterruptionType::HardwareException, ExceptionVector::GeneralProtection as u8, true)
    }

    pub fn external_interrupt(vector: u8) -> Self {
        Self::new(InterruptionType::ExternalInterrupt, vector, false)
    }

    pub fn interruption_type(&self) -> Option<InterruptionType> {
        match self.kind() {
            0 => Some(InterruptionType::ExternalInterrupt),
            2 => Some(InterruptionType::NonMaskableInterrupt),
            3 => Some(InterruptionType::HardwareException),
            4 => Some(InterruptionType::SoftwareInterrupt),
            5 => Some(InterruptionType::PrivilegedSoftwareException),
            6 => Some(InterruptionType::SoftwareException),
            7 => Some(InterruptionType::OtherEvent),
            _ => None,
        }
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// An event waiting to be delivered on the next entry into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingEvent {
    pub info: EventInjection,
    pub error_code: u32,
    pub instruction_len: u32,
}

impl PendingEvent {
    pub fn new(info: EventInjection, error_code: u32) -> Self {
        Self { info, error_code, instruction_len: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_protection_layout() {
        let event = EventInjection::general_protection();
        // vector 13, type 3, deliver error code, valid
        assert_eq!(event.bits(), 0x8000_0B0D);
        assert_eq!(event.interruption_type(), Some(InterruptionType::HardwareException));
    }

    #[test]
    fn external_interrupt_layout() {
        let event = EventInjection::external_interrupt(0x30);
        assert_eq!(event.bits(), 0x8000_0030);
        assert!(!event.deliver_error_code());
    }
}
