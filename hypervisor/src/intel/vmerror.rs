//! VM-exit reasons and VM-instruction error numbers.
//!
//! The dispatcher uses these both to understand exits coming from the host and
//! to synthesize exits and instruction errors for the guest hypervisor.

/// Bit 31 of the exit reason: the exit was caused by a failed VM entry.
pub const VMX_EXIT_REASONS_FAILED_VMENTRY: u32 = 1 << 31;

/// Basic VM-exit reasons understood by the nested dispatcher.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    Xsetbv = 55,
}

impl VmxBasicExitReason {
    /// Converts a 32-bit exit reason to its basic exit reason.
    ///
    /// The lower 16 bits of the exit reason field form the basic exit reason.
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmxBasicExitReason::*;
        match (value & 0xFFFF) as u16 {
            0 => Some(ExceptionOrNmi),
            1 => Some(ExternalInterrupt),
            2 => Some(TripleFault),
            3 => Some(InitSignal),
            4 => Some(StartupIpi),
            7 => Some(InterruptWindow),
            8 => Some(NmiWindow),
            9 => Some(TaskSwitch),
            10 => Some(Cpuid),
            11 => Some(Getsec),
            12 => Some(Hlt),
            13 => Some(Invd),
            14 => Some(Invlpg),
            15 => Some(Rdpmc),
            16 => Some(Rdtsc),
            18 => Some(Vmcall),
            19 => Some(Vmclear),
            20 => Some(Vmlaunch),
            21 => Some(Vmptrld),
            22 => Some(Vmptrst),
            23 => Some(Vmread),
            24 => Some(Vmresume),
            25 => Some(Vmwrite),
            26 => Some(Vmxoff),
            27 => Some(Vmxon),
            28 => Some(ControlRegisterAccesses),
            29 => Some(MovDr),
            30 => Some(IoInstruction),
            31 => Some(Rdmsr),
            32 => Some(Wrmsr),
            33 => Some(VmEntryFailureInvalidGuestState),
            34 => Some(VmEntryFailureMsrLoading),
            36 => Some(Mwait),
            37 => Some(MonitorTrapFlag),
            39 => Some(Monitor),
            40 => Some(Pause),
            48 => Some(EptViolation),
            49 => Some(EptMisconfiguration),
            50 => Some(Invept),
            51 => Some(Rdtscp),
            52 => Some(VmxPreemptionTimerExpired),
            53 => Some(Invvpid),
            55 => Some(Xsetbv),
            _ => None,
        }
    }

    /// Instructions introduced with VMX. They always exit from non-root operation.
    pub fn is_vmx_instruction(&self) -> bool {
        use VmxBasicExitReason::*;
        matches!(
            self,
            Vmcall | Vmclear | Vmlaunch | Vmptrld | Vmptrst | Vmread | Vmresume | Vmwrite | Vmxoff | Vmxon | Invept | Invvpid
        )
    }
}

impl core::fmt::Display for VmxBasicExitReason {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        use VmxBasicExitReason::*;
        let description = match *self {
            ExceptionOrNmi => "Exception or NMI",
            ExternalInterrupt => "External interrupt",
            TripleFault => "Triple fault",
            InitSignal => "INIT signal",
            StartupIpi => "SIPI",
            InterruptWindow => "Interrupt window",
            NmiWindow => "NMI window",
            TaskSwitch => "Task switch",
            Cpuid => "CPUID",
            Getsec => "GETSEC",
            Hlt => "HLT",
            Invd => "INVD",
            Invlpg => "INVLPG",
            Rdpmc => "RDPMC",
            Rdtsc => "RDTSC",
            Vmcall => "VMCALL",
            Vmclear => "VMCLEAR",
            Vmlaunch => "VMLAUNCH",
            Vmptrld => "VMPTRLD",
            Vmptrst => "VMPTRST",
            Vmread => "VMREAD",
            Vmresume => "VMRESUME",
            Vmwrite => "VMWRITE",
            Vmxoff => "VMXOFF",
            Vmxon => "VMXON",
            ControlRegisterAccesses => "Control-register access",
            MovDr => "MOV DR",
            IoInstruction => "I/O instruction",
            Rdmsr => "RDMSR",
            Wrmsr => "WRMSR",
            VmEntryFailureInvalidGuestState => "VM-entry failure due to invalid guest state",
            VmEntryFailureMsrLoading => "VM-entry failure due to MSR loading",
            Mwait => "MWAIT",
            MonitorTrapFlag => "Monitor trap flag",
            Monitor => "MONITOR",
            Pause => "PAUSE",
            EptViolation => "EPT violation",
            EptMisconfiguration => "EPT misconfiguration",
            Invept => "INVEPT",
            Rdtscp => "RDTSCP",
            VmxPreemptionTimerExpired => "VMX-preemption timer expired",
            Invvpid => "INVVPID",
            Xsetbv => "XSETBV",
        };
        write!(f, "{}", description)
    }
}

/// VM-instruction error numbers stored in the VM-instruction error field on VMfailValid.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 31-1. VM-Instruction Error Numbers
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmInstructionError {
    VmclearInvalidAddress = 2,
    VmclearWithVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmEntryInvalidControlFields = 7,
    VmEntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldWithVmxonPointer = 10,
    VmptrldIncorrectVmcsRevision = 11,
    VmreadVmwriteUnsupportedVmcsComponent = 12,
    VmwriteReadonlyVmcsComponent = 13,
    VmxonInRoot = 15,
}

impl core::fmt::Display for VmInstructionError {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        use VmInstructionError::*;
        let description = match *self {
            VmclearInvalidAddress => "2: VMCLEAR with invalid physical address",
            VmclearWithVmxonPointer => "3: VMCLEAR with VMXON pointer",
            VmlaunchNonClearVmcs => "4: VMLAUNCH with non-clear VMCS",
            VmresumeNonLaunchedVmcs => "5: VMRESUME with non-launched VMCS",
            VmEntryInvalidControlFields => "7: VM entry with invalid control field(s)",
            VmEntryInvalidHostState => "8: VM entry with invalid host-state field(s)",
            VmptrldInvalidAddress => "9: VMPTRLD with invalid physical address",
            VmptrldWithVmxonPointer => "10: VMPTRLD with VMXON pointer",
            VmptrldIncorrectVmcsRevision => "11: VMPTRLD with incorrect VMCS revision identifier",
            VmreadVmwriteUnsupportedVmcsComponent => "12: VMREAD/VMWRITE of unsupported VMCS component",
            VmwriteReadonlyVmcsComponent => "13: VMWRITE to read-only VMCS component",
            VmxonInRoot => "15: VMXON in VMX root operation",
        };
        write!(f, "{}", description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_reason_ignores_upper_bits() {
        let reason = VMX_EXIT_REASONS_FAILED_VMENTRY | 33;
        assert_eq!(
            VmxBasicExitReason::from_u32(reason),
            Some(VmxBasicExitReason::VmEntryFailureInvalidGuestState)
        );
        assert_eq!(VmxBasicExitReason::from_u32(35), None);
    }

    #[test]
    fn instruction_error_display_carries_its_number() {
        for error in [
            VmInstructionError::VmclearInvalidAddress,
            VmInstructionError::VmptrldIncorrectVmcsRevision,
            VmInstructionError::VmxonInRoot,
        ] {
            let text = format!("{}", error);
            assert!(text.starts_with(&format!("{}: ", error as u32)), "{}", text);
        }
    }
}
