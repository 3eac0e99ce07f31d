//! Per-vCPU nested VMX context.
//!
//! Tracks whether the guest hypervisor (L1) is in VMX operation, which virtual
//! VMCS is current and whether the nested guest (L2) is the one running. The
//! launch state of each region is kept in the region itself. Virtual VM entries and exits move register
//! state between the vCPU and the guest-state and host-state areas of the
//! current virtual VMCS.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{EventInjection, PendingEvent},
            memory::GuestMemory,
            registers::CpuState,
            vmerror::{VmxBasicExitReason, VMX_EXIT_REASONS_FAILED_VMENTRY},
            vmexit::ExitInfo,
            vvmcs::VirtualVmcs,
        },
    },
    x86::vmx::vmcs::{
        control::{self, PrimaryControls},
        guest, host, ro,
    },
};

/// Guest segment encodings in ES, CS, SS, DS, FS, GS order: selector, base, limit, access rights.
const GUEST_SEGMENT_FIELDS: [[u32; 4]; 6] = [
    [guest::ES_SELECTOR, guest::ES_BASE, guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS],
    [guest::CS_SELECTOR, guest::CS_BASE, guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS],
    [guest::SS_SELECTOR, guest::SS_BASE, guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS],
    [guest::DS_SELECTOR, guest::DS_BASE, guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS],
    [guest::FS_SELECTOR, guest::FS_BASE, guest::FS_LIMIT, guest::FS_ACCESS_RIGHTS],
    [guest::GS_SELECTOR, guest::GS_BASE, guest::GS_LIMIT, guest::GS_ACCESS_RIGHTS],
];

/// Host selector encodings in ES, CS, SS, DS, FS, GS order.
const HOST_SELECTOR_FIELDS: [u32; 6] = [
    host::ES_SELECTOR,
    host::CS_SELECTOR,
    host::SS_SELECTOR,
    host::DS_SELECTOR,
    host::FS_SELECTOR,
    host::GS_SELECTOR,
];

/// Access rights loaded on VM exit: 64-bit code for CS, read/write data otherwise.
const HOST_CODE_ACCESS_RIGHTS: u32 = 0xA09B;
const HOST_DATA_ACCESS_RIGHTS: u32 = 0xC093;

/// Where a vCPU stands in the nested VMX state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NestedState {
    /// L1 is not in VMX operation.
    Off,
    /// In VMX operation without a current virtual VMCS.
    On,
    /// A virtual VMCS is current.
    Active,
    /// L2 is running on the vCPU.
    NestedGuestRunning,
}

/// An interrupt for L1 that arrived while L2 was running.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DeferredInterrupt {
    pub intr_info: u32,
    pub error_code: u32,
    pub valid: bool,
}

impl DeferredInterrupt {
    fn take(&mut self) -> Option<PendingEvent> {
        if !self.valid {
            return None;
        }
        self.valid = false;
        Some(PendingEvent::new(EventInjection(self.intr_info), self.error_code))
    }
}

/// The current virtual VMCS: its guest-physical address and shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentVmcs {
    pub gpa: u64,
    pub vmcs: VirtualVmcs,
}

#[derive(Debug, Default)]
pub struct NestedVmx {
    vmxon_region_pa: Option<u64>,
    /// I/O bitmaps A (ports 0..0x7fff) and B (0x8000..0xffff) latched at VM entry.
    io_bitmap: [Option<u64>; 2],
    pub intr: DeferredInterrupt,
    current: Option<CurrentVmcs>,
    guest_mode: bool,
}

impl NestedVmx {
    /// Creates the context of a freshly initialised vCPU, outside VMX operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all nested state without writing anything back to guest memory.
    pub fn reset(&mut self) {
        log::debug!("Resetting nested VMX state");
        *self = Self::default();
    }

    pub fn state(&self) -> NestedState {
        match (self.vmxon_region_pa, self.guest_mode, &self.current) {
            (None, _, _) => NestedState::Off,
            (Some(_), true, _) => NestedState::NestedGuestRunning,
            (Some(_), false, Some(_)) => NestedState::Active,
            (Some(_), false, None) => NestedState::On,
        }
    }

    pub fn in_vmx_operation(&self) -> bool {
        self.vmxon_region_pa.is_some()
    }

    pub fn guest_mode(&self) -> bool {
        self.guest_mode
    }

    pub fn vmxon_region(&self) -> Option<u64> {
        self.vmxon_region_pa
    }

    pub fn current(&self) -> Option<&CurrentVmcs> {
        self.current.as_ref()
    }

    pub fn current_vmcs(&self) -> Option<&VirtualVmcs> {
        self.current.as_ref().map(|current| &current.vmcs)
    }

    pub fn current_vmcs_mut(&mut self) -> Option<&mut VirtualVmcs> {
        self.current.as_mut().map(|current| &mut current.vmcs)
    }

    /// Guest-physical address of the current virtual VMCS.
    pub fn current_pointer(&self) -> Option<u64> {
        self.current.as_ref().map(|current| current.gpa)
    }

    pub fn io_bitmaps(&self) -> [Option<u64>; 2] {
        self.io_bitmap
    }

    /// VMXON: enters VMX operation with the given region.
    pub fn enter_vmx_operation(&mut self, vmxon_region_pa: u64) {
        log::info!("Entering VMX operation, VMXON region {:#x}", vmxon_region_pa);
        self.vmxon_region_pa = Some(vmxon_region_pa);
    }

    /// VMXOFF: writes the current virtual VMCS back and leaves VMX operation.
    pub fn leave_vmx_operation<M: GuestMemory + ?Sized>(&mut self, memory: &mut M) -> Result<(), HypervisorError> {
        if self.guest_mode {
            return Err(HypervisorError::NestedGuestRunning);
        }

        self.flush(memory)?;

        log::info!("Leaving VMX operation");
        *self = Self::default();
        Ok(())
    }

    /// VMPTRLD: makes the region at `gpa` current, writing back the previous one.
    pub fn make_current<M: GuestMemory + ?Sized>(&mut self, memory: &mut M, gpa: u64) -> Result<(), HypervisorError> {
        if self.current_pointer() == Some(gpa) {
            return Ok(());
        }

        let mut vmcs = VirtualVmcs::new(0)?;
        vmcs.reload(&*memory, gpa)?;

        if let Some(previous) = &self.current {
            log::trace!("Flushing virtual VMCS {:#x}", previous.gpa);
            previous.vmcs.flush(memory, previous.gpa)?;
        }

        log::debug!("Virtual VMCS {:#x} is now current", gpa);
        self.current = Some(CurrentVmcs { gpa, vmcs });
        Ok(())
    }

    /// VMCLEAR: sets the launch state of `gpa` to clear, writing it back if current.
    pub fn clear<M: GuestMemory + ?Sized>(&mut self, memory: &mut M, gpa: u64) -> Result<(), HypervisorError> {
        match &mut self.current {
            Some(current) if current.gpa == gpa => {
                let launched = current.vmcs.is_launched();
                current.vmcs.set_launched(false);
                if let Err(error) = current.vmcs.flush(memory, gpa) {
                    current.vmcs.set_launched(launched);
                    return Err(error.into());
                }
                self.current = None;
            }
            _ => VirtualVmcs::clear_launch_state(memory, gpa)?,
        }
        log::debug!("Virtual VMCS {:#x} cleared", gpa);
        Ok(())
    }

    /// Writes the current virtual VMCS back to guest memory, keeping it current.
    pub fn flush<M: GuestMemory + ?Sized>(&self, memory: &mut M) -> Result<(), HypervisorError> {
        if let Some(current) = &self.current {
            current.vmcs.flush(memory, current.gpa)?;
        }
        Ok(())
    }

    /// Rebuilds the context from saved pointers, re-shadowing the current region.
    pub fn restore<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        saved: &SavedNestedState,
    ) -> Result<(), HypervisorError> {
        self.reset();
        self.vmxon_region_pa = saved.vmxon_region_pa;
        self.io_bitmap = saved.io_bitmap;
        self.intr = saved.intr;
        self.guest_mode = saved.guest_mode;

        if let Some(gpa) = saved.current {
            let mut vmcs = VirtualVmcs::new(0)?;
            vmcs.reload(memory, gpa)?;
            self.current = Some(CurrentVmcs { gpa, vmcs });
        }
        Ok(())
    }

    /// Captures everything needed to rebuild the context except the region contents.
    pub fn saved_state(&self) -> SavedNestedState {
        SavedNestedState {
            vmxon_region_pa: self.vmxon_region_pa,
            current: self.current_pointer(),
            io_bitmap: self.io_bitmap,
            intr: self.intr,
            guest_mode: self.guest_mode,
        }
    }

    /// CR3 L1 programmed for L2.
    pub fn guest_cr3(&self) -> u64 {
        self.current_vmcs().map_or(0, |vmcs| vmcs.get(guest::CR3))
    }

    /// CR3 L1 runs with after a VM exit.
    pub fn host_cr3(&self) -> u64 {
        self.current_vmcs().map_or(0, |vmcs| vmcs.get(host::CR3))
    }

    /// Address-space identifier (VPID) of L2.
    pub fn asid(&self) -> u16 {
        self.current_vmcs().map_or(0, |vmcs| vmcs.get(control::VPID) as u16)
    }

    /// TSC offset L1 applies to L2, zero unless TSC offsetting is enabled.
    pub fn tsc_offset(&self) -> u64 {
        match self.current_vmcs() {
            Some(vmcs) if Self::primary_controls(vmcs).contains(PrimaryControls::USE_TSC_OFFSETTING) => {
                vmcs.get(control::TSC_OFFSET_FULL)
            }
            _ => 0,
        }
    }

    pub fn primary_controls(vmcs: &VirtualVmcs) -> PrimaryControls {
        PrimaryControls::from_bits_truncate(vmcs.get(control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32)
    }

    /// Latches an interrupt for L1 to be injected after the next virtual VM exit.
    pub fn defer_interrupt(&mut self, info: EventInjection, error_code: u32) {
        log::trace!("Deferring interrupt {:#x} for L1", info.bits());
        self.intr = DeferredInterrupt { intr_info: info.bits(), error_code, valid: true };
    }

    /// Virtual VM entry into L2.
    ///
    /// Host-state fields L1 left unwritten are taken from L1's current context,
    /// the guest-state area is loaded into the vCPU and a valid VM-entry
    /// interruption-information field becomes the pending event for L2.
    pub fn virtual_vmentry(
        &mut self,
        state: &mut CpuState,
        pending: &mut Option<PendingEvent>,
        launch: bool,
    ) -> Result<(), HypervisorError> {
        let Some(current) = self.current.as_mut() else {
            return Err(HypervisorError::MissingCurrentVmcs);
        };
        let vmcs = &mut current.vmcs;

        Self::save_host_state(vmcs, state);
        Self::load_guest_state(vmcs, state);

        let controls = Self::primary_controls(vmcs);
        self.io_bitmap = match controls.contains(PrimaryControls::USE_IO_BITMAPS) {
            true => [Some(vmcs.get(control::IO_BITMAP_A_ADDR_FULL)), Some(vmcs.get(control::IO_BITMAP_B_ADDR_FULL))],
            false => [None, None],
        };

        let entry_info = EventInjection(vmcs.get(control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32);
        *pending = match entry_info.valid() {
            true => Some(PendingEvent {
                info: entry_info,
                error_code: vmcs.get(control::VMENTRY_EXCEPTION_ERR_CODE) as u32,
                instruction_len: vmcs.get(control::VMENTRY_INSTRUCTION_LEN) as u32,
            }),
            false => None,
        };

        if launch {
            vmcs.set_launched(true);
        }
        self.guest_mode = true;

        log::info!("Virtual VM entry to L2 at {:#x}", state.registers.rip);
        Ok(())
    }

    /// Virtual VM exit from L2 to L1.
    ///
    /// An event still pending for L2 is reported in the IDT-vectoring fields
    /// when the exit itself did not interrupt an event delivery.
    pub fn virtual_vmexit(
        &mut self,
        state: &mut CpuState,
        pending: &mut Option<PendingEvent>,
        exit: &ExitInfo,
    ) -> Result<(), HypervisorError> {
        let Some(current) = self.current.as_mut() else {
            return Err(HypervisorError::MissingCurrentVmcs);
        };
        let vmcs = &mut current.vmcs;

        Self::save_guest_state(vmcs, state);

        let (idt_vectoring_info, idt_vectoring_error_code) =
            match (EventInjection(exit.idt_vectoring_info).valid(), pending.take()) {
                (false, Some(event)) => (event.info.bits(), event.error_code),
                _ => (exit.idt_vectoring_info, exit.idt_vectoring_error_code),
            };

        vmcs.set(ro::EXIT_REASON, u64::from(exit.reason));
        vmcs.set(ro::EXIT_QUALIFICATION, exit.qualification);
        vmcs.set(ro::VMEXIT_INSTRUCTION_LEN, u64::from(exit.instruction_len));
        vmcs.set(ro::VMEXIT_INSTRUCTION_INFO, u64::from(exit.instruction_info));
        vmcs.set(ro::VMEXIT_INTERRUPTION_INFO, u64::from(exit.interruption_info));
        vmcs.set(ro::VMEXIT_INTERRUPTION_ERR_CODE, u64::from(exit.interruption_error_code));
        vmcs.set(ro::IDT_VECTORING_INFO, u64::from(idt_vectoring_info));
        vmcs.set(ro::IDT_VECTORING_ERR_CODE, u64::from(idt_vectoring_error_code));

        Self::clear_entry_interruption(vmcs);
        Self::load_host_state(vmcs, state);

        self.guest_mode = false;
        self.io_bitmap = [None, None];
        *pending = self.intr.take();

        log::info!(
            "Virtual VM exit to L1: reason {:#x}, qualification {:#x}",
            exit.reason,
            exit.qualification
        );
        Ok(())
    }

    /// A VM entry that failed on guest state: L1 sees exit reason 33 with bit 31 set.
    pub fn fail_vmentry(&mut self, state: &mut CpuState, qualification: u64) -> Result<(), HypervisorError> {
        let Some(current) = self.current.as_mut() else {
            return Err(HypervisorError::MissingCurrentVmcs);
        };
        let vmcs = &mut current.vmcs;

        let reason = VmxBasicExitReason::VmEntryFailureInvalidGuestState as u32 | VMX_EXIT_REASONS_FAILED_VMENTRY;
        vmcs.set(ro::EXIT_REASON, u64::from(reason));
        vmcs.set(ro::EXIT_QUALIFICATION, qualification);

        Self::save_host_state(vmcs, state);
        Self::clear_entry_interruption(vmcs);
        Self::load_host_state(vmcs, state);

        log::warn!("Virtual VM entry failed on guest state, exit reason {:#x}", reason);
        Ok(())
    }

    /// IDT-vectoring handling for exits L0 handles itself: an event whose
    /// delivery was interrupted is re-injected into L2.
    pub fn idtv_handling(exit: &ExitInfo) -> Option<PendingEvent> {
        let info = EventInjection(exit.idt_vectoring_info);
        if !info.valid() {
            return None;
        }

        let mut reinjected = info;
        reinjected.set_nmi_unblocking(false);
        Some(PendingEvent {
            info: reinjected,
            error_code: exit.idt_vectoring_error_code,
            instruction_len: exit.instruction_len,
        })
    }

    fn clear_entry_interruption(vmcs: &mut VirtualVmcs) {
        let mut entry_info = EventInjection(vmcs.get(control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32);
        if entry_info.valid() {
            entry_info.set_valid(false);
            vmcs.set(control::VMENTRY_INTERRUPTION_INFO_FIELD, u64::from(entry_info.bits()));
        }
    }

    /// Fills host-state fields L1 has not written from its current context.
    fn save_host_state(vmcs: &mut VirtualVmcs, state: &CpuState) {
        let defaults = [
            (host::CR0, state.cr0),
            (host::CR3, state.cr3),
            (host::CR4, state.cr4),
            (host::IA32_EFER_FULL, state.efer),
            (host::FS_BASE, state.segments.fs.base),
            (host::GS_BASE, state.segments.gs.base),
        ];
        for (encoding, value) in defaults {
            if !vmcs.is_written(encoding) {
                vmcs.set(encoding, value);
            }
        }

        for (encoding, segment) in HOST_SELECTOR_FIELDS.iter().zip(state.segments.as_array()) {
            if !vmcs.is_written(*encoding) {
                vmcs.set(*encoding, u64::from(segment.selector));
            }
        }
    }

    fn load_host_state(vmcs: &VirtualVmcs, state: &mut CpuState) {
        state.registers.rip = vmcs.get(host::RIP);
        state.registers.rsp = vmcs.get(host::RSP);
        state.registers.rflags = 0x2;
        state.cr0 = vmcs.get(host::CR0);
        state.cr3 = vmcs.get(host::CR3);
        state.cr4 = vmcs.get(host::CR4);
        state.efer = vmcs.get(host::IA32_EFER_FULL);
        state.dr7 = 0x400;
        state.interruptibility = 0;

        for (encoding, segment) in HOST_SELECTOR_FIELDS.iter().zip(state.segments.as_array_mut()) {
            segment.selector = vmcs.get(*encoding) as u16;
            segment.base = 0;
            segment.limit = u32::MAX;
            segment.access_rights = HOST_DATA_ACCESS_RIGHTS;
        }
        state.segments.cs.access_rights = HOST_CODE_ACCESS_RIGHTS;
        state.segments.fs.base = vmcs.get(host::FS_BASE);
        state.segments.gs.base = vmcs.get(host::GS_BASE);
    }

    fn load_guest_state(vmcs: &VirtualVmcs, state: &mut CpuState) {
        state.registers.rip = vmcs.get(guest::RIP);
        state.registers.rsp = vmcs.get(guest::RSP);
        state.registers.rflags = vmcs.get(guest::RFLAGS);
        state.cr0 = vmcs.get(guest::CR0);
        state.cr3 = vmcs.get(guest::CR3);
        state.cr4 = vmcs.get(guest::CR4);
        state.dr7 = vmcs.get(guest::DR7);
        state.efer = vmcs.get(guest::IA32_EFER_FULL);
        state.interruptibility = vmcs.get(guest::INTERRUPTIBILITY_STATE) as u32;

        for (fields, segment) in GUEST_SEGMENT_FIELDS.iter().zip(state.segments.as_array_mut()) {
            segment.selector = vmcs.get(fields[0]) as u16;
            segment.base = vmcs.get(fields[1]);
            segment.limit = vmcs.get(fields[2]) as u32;
            segment.access_rights = vmcs.get(fields[3]) as u32;
        }
    }

    fn save_guest_state(vmcs: &mut VirtualVmcs, state: &CpuState) {
        vmcs.set(guest::RIP, state.registers.rip);
        vmcs.set(guest::RSP, state.registers.rsp);
        vmcs.set(guest::RFLAGS, state.registers.rflags);
        vmcs.set(guest::CR0, state.cr0);
        vmcs.set(guest::CR3, state.cr3);
        vmcs.set(guest::CR4, state.cr4);
        vmcs.set(guest::DR7, state.dr7);
        vmcs.set(guest::IA32_EFER_FULL, state.efer);
        vmcs.set(guest::INTERRUPTIBILITY_STATE, u64::from(state.interruptibility));

        for (fields, segment) in GUEST_SEGMENT_FIELDS.iter().zip(state.segments.as_array()) {
            vmcs.set(fields[0], u64::from(segment.selector));
            vmcs.set(fields[1], segment.base);
            vmcs.set(fields[2], u64::from(segment.limit));
            vmcs.set(fields[3], u64::from(segment.access_rights));
        }
    }
}

/// Nested VMX context minus the virtual VMCS contents, which live in guest memory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedNestedState {
    pub vmxon_region_pa: Option<u64>,
    pub current: Option<u64>,
    pub io_bitmap: [Option<u64>; 2],
    pub intr: DeferredInterrupt,
    pub guest_mode: bool,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::VVMCS_REVISION, intel::memory::GuestRam},
    };

    const VMXON_REGION: u64 = 0x1000;
    const VMCS_A: u64 = 0x2000;
    const VMCS_B: u64 = 0x3000;

    fn prepared_ram() -> GuestRam {
        let mut ram = GuestRam::new(0x10000);
        for region in [VMXON_REGION, VMCS_A, VMCS_B] {
            ram.write_u32(region, VVMCS_REVISION).unwrap();
        }
        ram
    }

    fn nested_with_current(ram: &mut GuestRam) -> NestedVmx {
        let mut nested = NestedVmx::new();
        nested.enter_vmx_operation(VMXON_REGION);
        nested.make_current(ram, VMCS_A).unwrap();
        let vmcs = nested.current_vmcs_mut().unwrap();
        vmcs.set(host::RIP, 0xffff_8000_0000_1000);
        vmcs.set(host::RSP, 0xffff_8000_0000_8000);
        vmcs.set(guest::RIP, 0x40_0000);
        vmcs.set(guest::RSP, 0x7000);
        vmcs.set(guest::RFLAGS, 0x202);
        vmcs.set(guest::CS_SELECTOR, 0x33);
        nested
    }

    #[test]
    fn state_machine_transitions() {
        let mut ram = prepared_ram();
        let mut nested = NestedVmx::new();
        assert_eq!(nested.state(), NestedState::Off);

        nested.enter_vmx_operation(VMXON_REGION);
        assert_eq!(nested.state(), NestedState::On);

        nested.make_current(&mut ram, VMCS_A).unwrap();
        assert_eq!(nested.state(), NestedState::Active);

        let mut state = CpuState::reset();
        let mut pending = None;
        nested.virtual_vmentry(&mut state, &mut pending, true).unwrap();
        assert_eq!(nested.state(), NestedState::NestedGuestRunning);
        assert_eq!(nested.leave_vmx_operation(&mut ram), Err(HypervisorError::NestedGuestRunning));

        let exit = ExitInfo { reason: VmxBasicExitReason::Cpuid as u32, instruction_len: 2, ..Default::default() };
        nested.virtual_vmexit(&mut state, &mut pending, &exit).unwrap();
        assert_eq!(nested.state(), NestedState::Active);

        nested.leave_vmx_operation(&mut ram).unwrap();
        assert_eq!(nested.state(), NestedState::Off);

        let mut reloaded = VirtualVmcs::new(0).unwrap();
        reloaded.reload(&ram, VMCS_A).unwrap();
        assert!(reloaded.is_launched());
    }

    #[test]
    fn switching_current_flushes_previous() {
        let mut ram = prepared_ram();
        let mut nested = NestedVmx::new();
        nested.enter_vmx_operation(VMXON_REGION);
        nested.make_current(&mut ram, VMCS_A).unwrap();
        nested.current_vmcs_mut().unwrap().set(guest::RIP, 0x1234);

        nested.make_current(&mut ram, VMCS_B).unwrap();
        assert_eq!(nested.current_pointer(), Some(VMCS_B));

        let mut reloaded = VirtualVmcs::new(0).unwrap();
        reloaded.reload(&ram, VMCS_A).unwrap();
        assert_eq!(reloaded.get(guest::RIP), 0x1234);
    }

    #[test]
    fn clear_resets_launch_state_of_any_region() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);
        let mut state = CpuState::reset();
        let mut pending = None;
        nested.virtual_vmentry(&mut state, &mut pending, true).unwrap();
        let exit = ExitInfo { reason: VmxBasicExitReason::Hlt as u32, ..Default::default() };
        nested.virtual_vmexit(&mut state, &mut pending, &exit).unwrap();

        // Launched region A is switched away from, then cleared while not current.
        nested.make_current(&mut ram, VMCS_B).unwrap();
        nested.clear(&mut ram, VMCS_A).unwrap();
        assert_eq!(nested.current_pointer(), Some(VMCS_B));

        nested.make_current(&mut ram, VMCS_A).unwrap();
        assert!(!nested.current_vmcs().unwrap().is_launched());

        nested.clear(&mut ram, VMCS_A).unwrap();
        assert_eq!(nested.current_pointer(), None);
    }

    #[test]
    fn failed_flush_keeps_current_vmcs() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);
        let mut small = GuestRam::new(0x2000);

        assert!(nested.leave_vmx_operation(&mut small).is_err());
        assert_eq!(nested.state(), NestedState::Active);
        assert!(nested.make_current(&mut small, VMXON_REGION).is_err());
        assert!(nested.clear(&mut small, VMCS_A).is_err());
        assert_eq!(nested.current_pointer(), Some(VMCS_A));
        assert_eq!(nested.current_vmcs().unwrap().get(guest::RIP), 0x40_0000);

        nested.leave_vmx_operation(&mut ram).unwrap();
        let mut reloaded = VirtualVmcs::new(0).unwrap();
        reloaded.reload(&ram, VMCS_A).unwrap();
        assert_eq!(reloaded.get(guest::RIP), 0x40_0000);
    }

    #[test]
    fn entry_and_exit_move_state() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);

        let mut state = CpuState::reset();
        state.cr3 = 0x1ab000;
        state.registers.rbx = 0x55;
        let mut pending = None;

        nested.virtual_vmentry(&mut state, &mut pending, true).unwrap();
        assert!(nested.current_vmcs().unwrap().is_launched());
        assert_eq!(state.registers.rip, 0x40_0000);
        assert_eq!(state.registers.rsp, 0x7000);
        assert_eq!(state.segments.cs.selector, 0x33);
        // General-purpose registers pass through untouched.
        assert_eq!(state.registers.rbx, 0x55);
        // Unwritten host CR3 was taken from L1.
        assert_eq!(nested.host_cr3(), 0x1ab000);

        state.registers.rip = 0x40_0010;
        let exit = ExitInfo {
            reason: VmxBasicExitReason::Hlt as u32,
            qualification: 0,
            instruction_len: 1,
            ..Default::default()
        };
        nested.virtual_vmexit(&mut state, &mut pending, &exit).unwrap();

        assert_eq!(state.registers.rip, 0xffff_8000_0000_1000);
        assert_eq!(state.registers.rsp, 0xffff_8000_0000_8000);
        assert_eq!(state.cr3, 0x1ab000);
        let vmcs = nested.current_vmcs().unwrap();
        assert_eq!(vmcs.get(guest::RIP), 0x40_0010);
        assert_eq!(vmcs.get(ro::EXIT_REASON), VmxBasicExitReason::Hlt as u64);
        assert_eq!(vmcs.get(ro::VMEXIT_INSTRUCTION_LEN), 1);
    }

    #[test]
    fn entry_injects_and_exit_reports_undelivered_event() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);
        let event = EventInjection::general_protection();
        {
            let vmcs = nested.current_vmcs_mut().unwrap();
            vmcs.set(control::VMENTRY_INTERRUPTION_INFO_FIELD, u64::from(event.bits()));
            vmcs.set(control::VMENTRY_EXCEPTION_ERR_CODE, 0x10);
        }

        let mut state = CpuState::reset();
        let mut pending = None;
        nested.virtual_vmentry(&mut state, &mut pending, true).unwrap();
        assert_eq!(pending, Some(PendingEvent { info: event, error_code: 0x10, instruction_len: 0 }));

        let exit = ExitInfo { reason: VmxBasicExitReason::ExternalInterrupt as u32, ..Default::default() };
        nested.virtual_vmexit(&mut state, &mut pending, &exit).unwrap();

        let vmcs = nested.current_vmcs().unwrap();
        assert_eq!(vmcs.get(ro::IDT_VECTORING_INFO), u64::from(event.bits()));
        assert_eq!(vmcs.get(ro::IDT_VECTORING_ERR_CODE), 0x10);
        assert!(!EventInjection(vmcs.get(control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32).valid());
        assert_eq!(pending, None);
    }

    #[test]
    fn deferred_interrupt_reaches_l1_after_exit() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);
        let mut state = CpuState::reset();
        let mut pending = None;
        nested.virtual_vmentry(&mut state, &mut pending, true).unwrap();

        nested.defer_interrupt(EventInjection::external_interrupt(0x41), 0);
        let exit = ExitInfo { reason: VmxBasicExitReason::ExternalInterrupt as u32, ..Default::default() };
        nested.virtual_vmexit(&mut state, &mut pending, &exit).unwrap();

        assert_eq!(pending.map(|event| event.info.vector()), Some(0x41));
        assert!(!nested.intr.valid);
    }

    #[test]
    fn failed_entry_reports_reason_33() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);
        let mut state = CpuState::reset();

        nested.fail_vmentry(&mut state, 0).unwrap();

        assert_eq!(nested.current_vmcs().unwrap().get(ro::EXIT_REASON), 0x8000_0021);
        assert_eq!(state.registers.rip, 0xffff_8000_0000_1000);
        assert!(!nested.guest_mode());
    }

    #[test]
    fn accessors_follow_controls() {
        let mut ram = prepared_ram();
        let mut nested = nested_with_current(&mut ram);
        {
            let vmcs = nested.current_vmcs_mut().unwrap();
            vmcs.set(control::VPID, 5);
            vmcs.set(guest::CR3, 0x9000);
            vmcs.set(control::TSC_OFFSET_FULL, 0x1000);
        }
        assert_eq!(nested.asid(), 5);
        assert_eq!(nested.guest_cr3(), 0x9000);
        assert_eq!(nested.tsc_offset(), 0);

        nested
            .current_vmcs_mut()
            .unwrap()
            .set(control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(PrimaryControls::USE_TSC_OFFSETTING.bits()));
        assert_eq!(nested.tsc_offset(), 0x1000);
    }

    #[test]
    fn idt_vectoring_event_is_reinjected() {
        let exit = ExitInfo {
            idt_vectoring_info: EventInjection::general_protection().bits(),
            idt_vectoring_error_code: 8,
            ..Default::default()
        };
        let event = NestedVmx::idtv_handling(&exit).unwrap();
        assert_eq!(event.info, EventInjection::general_protection());
        assert_eq!(event.error_code, 8);
        assert_eq!(NestedVmx::idtv_handling(&ExitInfo::default()), None);
    }
}
