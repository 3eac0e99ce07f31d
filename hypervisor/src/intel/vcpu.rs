//! Virtual CPU of a domain.
//!
//! A `Vcpu` owns the register state of whichever level is running on it, the
//! nested VMX context of its guest hypervisor, and the event waiting to be
//! injected on the next entry. All mutation goes through `&mut Vcpu`, so
//! distinct vCPUs can be driven from separate threads.

use {
    crate::{
        config::DomainConfig,
        error::HypervisorError,
        intel::{
            events::{EventInjection, InterruptibilityState, PendingEvent},
            memory::GuestMemory,
            nested::NestedVmx,
            registers::CpuState,
            vmerror::VmxBasicExitReason,
            vmexit::{ExitInfo, ExitType, VmExit},
        },
    },
    x86::vmx::vmcs::control::{self, ExitControls, PinbasedControls},
};

/// Represents a virtual CPU and its nested virtualization state.
#[derive(Debug)]
pub struct Vcpu {
    /// Index of the vCPU within its domain, used as the snapshot instance id.
    id: u16,

    /// Register state of L1, or of L2 while it runs.
    pub state: CpuState,

    /// Nested VMX context of the guest hypervisor.
    pub nested: NestedVmx,

    /// Event injected on the next entry into the running level.
    pub pending_event: Option<PendingEvent>,

    nested_virtualization: bool,
    physical_address_limit: u64,
}

impl Vcpu {
    /// Creates a vCPU in its INIT state.
    pub fn new(id: u16, config: &DomainConfig) -> Self {
        log::debug!("Initialising vCPU {}", id);

        Self {
            id,
            state: CpuState::reset(),
            nested: NestedVmx::new(),
            pending_event: None,
            nested_virtualization: config.nested_virtualization,
            physical_address_limit: config.physical_address_limit(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Whether VMX is exposed to this vCPU's guest.
    pub fn nested_virtualization(&self) -> bool {
        self.nested_virtualization
    }

    /// One past the highest guest-physical address the guest may name.
    pub fn physical_address_limit(&self) -> u64 {
        self.physical_address_limit
    }

    /// Returns the vCPU to its INIT state, dropping any nested context.
    pub fn reset(&mut self) {
        log::debug!("Resetting vCPU {}", self.id);
        self.state = CpuState::reset();
        self.nested.reset();
        self.pending_event = None;
    }

    /// Tears the vCPU down. Consuming it rules out any operation still in flight.
    pub fn destroy(self) {
        log::debug!("Destroying vCPU {} in nested state {:?}", self.id, self.nested.state());
    }

    /// Handles a VM exit taken while this vCPU ran.
    pub fn handle_vmexit<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &mut M,
        exit: &ExitInfo,
    ) -> Result<ExitType, HypervisorError> {
        VmExit::new().handle_vmexit(self, memory, exit)
    }

    /// Removes the event to inject on the next entry.
    pub fn take_pending_event(&mut self) -> Option<PendingEvent> {
        self.pending_event.take()
    }

    /// Whether an external interrupt cannot be delivered right now.
    ///
    /// An STI or MOV-SS shadow blocks at either level. While L2 runs, an
    /// interrupt is also blocked when one for L1 is already latched or an event
    /// for L2 has not been delivered yet. Outside of L2 a pending event blocks.
    pub fn intr_blocked(&self) -> bool {
        let shadow = InterruptibilityState::BLOCKING_BY_STI | InterruptibilityState::BLOCKING_BY_MOV_SS;
        if InterruptibilityState::from_bits_truncate(self.state.interruptibility).intersects(shadow) {
            return true;
        }

        match self.nested.guest_mode() {
            true => self.nested.intr.valid || self.pending_event.is_some(),
            false => self.pending_event.is_some(),
        }
    }

    /// Delivers an external interrupt destined for L1.
    ///
    /// While L2 runs and L1 intercepts external interrupts, a virtual VM exit is
    /// delivered to L1. With acknowledge-on-exit the vector is reported in the
    /// exit interruption information; otherwise the interrupt is deferred and
    /// injected into L1 after the exit. Without the intercept the interrupt goes
    /// to L2.
    pub fn deliver_interrupt(&mut self, vector: u8) -> Result<(), HypervisorError> {
        let event = EventInjection::external_interrupt(vector);

        if !self.nested.guest_mode() {
            log::trace!("Injecting interrupt {:#x} into L1", vector);
            self.pending_event = Some(PendingEvent::new(event, 0));
            return Ok(());
        }

        let Some(vmcs) = self.nested.current_vmcs() else {
            return Err(HypervisorError::MissingCurrentVmcs);
        };
        let pinbased = PinbasedControls::from_bits_truncate(vmcs.get(control::PINBASED_EXEC_CONTROLS) as u32);
        let exit_controls = ExitControls::from_bits_truncate(vmcs.get(control::VMEXIT_CONTROLS) as u32);

        if !pinbased.contains(PinbasedControls::EXTERNAL_INTERRUPT_EXITING) {
            log::trace!("Injecting interrupt {:#x} into L2", vector);
            self.pending_event = Some(PendingEvent::new(event, 0));
            return Ok(());
        }

        let mut exit = ExitInfo { reason: VmxBasicExitReason::ExternalInterrupt as u32, ..Default::default() };
        if exit_controls.contains(ExitControls::ACK_INTERRUPT_ON_EXIT) {
            exit.interruption_info = event.bits();
        } else {
            self.nested.defer_interrupt(event, 0);
        }

        self.nested.virtual_vmexit(&mut self.state, &mut self.pending_event, &exit)
    }
}
