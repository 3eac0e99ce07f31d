//! Error types for the nested VMX dispatcher and the HVM save/restore codec.
//!
//! Three families are kept apart:
//! - [`HypervisorError`]: host-level failures that abort the current operation.
//! - [`VmxFault`]: malformed guest input, always reflected back into the guest.
//! - [`SaveError`]: snapshot format and capacity errors reported to the caller.

use {crate::intel::vmerror::VmInstructionError, thiserror_no_std::Error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Failed to allocate memory for a virtual VMCS shadow")]
    MemoryAllocationFailed,
    #[error("Nested virtualization requires VMX support on the host CPU")]
    VMXUnsupported,
    #[error("Intel CPU not found")]
    CPUUnsupported,
    #[error("Unknown VM exit reason: {0:#x}")]
    UnknownVMExitReason(u32),
    #[error("Guest memory access failed at {0:#x}")]
    GuestMemoryAccessFailed(u64),
    #[error("Nested operation attempted on a vCPU running a nested guest")]
    NestedGuestRunning,
    #[error("Virtual VM entry or exit without a current virtual VMCS")]
    MissingCurrentVmcs,
    #[error("Invalid vCPU index: {0}")]
    InvalidVcpu(u16),
    #[error("Snapshot operation failed: {0}")]
    Snapshot(SaveError),
}

impl From<SaveError> for HypervisorError {
    fn from(error: SaveError) -> Self {
        Self::Snapshot(error)
    }
}

/// How a [`VmxFault`] becomes visible to the guest hypervisor.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 CONVENTIONS
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Inject #UD.
    InvalidOpcode,
    /// Inject #GP(0).
    GeneralProtection,
    /// VMfailInvalid: RFLAGS.CF = 1.
    FailInvalid,
    /// VMfailValid: RFLAGS.ZF = 1 and the error number is stored in the current VMCS.
    FailValid(VmInstructionError),
    /// VM entry failed on guest state; a VM exit with reason 33 is delivered to L1.
    EntryFailure,
}

/// Guest-input errors raised while emulating a VMX instruction.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxFault {
    #[error("VMX instruction executed outside of VMX operation")]
    NotInVmxOperation,
    #[error("Nested virtualization is not enabled for this domain")]
    NestedVirtualizationDisabled,
    #[error("CR4.VMXE is clear")]
    VmxeClear,
    #[error("Instruction requires a memory operand")]
    MemoryOperandRequired,
    #[error("Operand uses a reserved address size or segment")]
    MalformedOperand,
    #[error("VMX instruction is not supported for nested guests")]
    UnsupportedInstruction,
    #[error("Memory operand at {0:#x} is not accessible")]
    InaccessibleOperand(u64),
    #[error("Invalid VMXON region pointer {0:#x}")]
    InvalidOperand(u64),
    #[error("VMXON executed in VMX operation")]
    VmxonInVmxOperation,
    #[error("No current virtual VMCS")]
    NoCurrentVmcs,
    #[error("Invalid virtual VMCS pointer {0:#x}")]
    InvalidPointer(u64),
    #[error("Virtual VMCS pointer equals the VMXON pointer")]
    VmxonPointer,
    #[error("Virtual VMCS revision {0:#x} does not match")]
    RevisionMismatch(u32),
    #[error("Unsupported VMCS component encoding {0:#x}")]
    InvalidField(u32),
    #[error("VMWRITE to read-only VMCS component {0:#x}")]
    ReadOnlyField(u32),
    #[error("VMCLEAR with invalid pointer {0:#x}")]
    InvalidClearPointer(u64),
    #[error("VMCLEAR with the VMXON pointer")]
    ClearVmxonPointer,
    #[error("VMLAUNCH with a non-clear virtual VMCS")]
    LaunchNonClear,
    #[error("VMRESUME with a non-launched virtual VMCS")]
    ResumeNonLaunched,
    #[error("VM entry with invalid control field {0:#x}")]
    EntryInvalidControlField(u32),
    #[error("VM entry with invalid host-state field {0:#x}")]
    EntryInvalidHostState(u32),
    #[error("VM entry with invalid guest-state field {0:#x}")]
    EntryInvalidGuestState(u32),
    #[error("Write to read-only VMX capability MSR {0:#x}")]
    ReadOnlyMsr(u32),
    #[error("VMX capability MSR {0:#x} is not exposed")]
    UnsupportedMsr(u32),
}

impl VmxFault {
    /// Returns the guest-visible effect of the fault.
    pub fn disposition(&self) -> FaultDisposition {
        use VmxFault::*;
        match *self {
            NotInVmxOperation
            | NestedVirtualizationDisabled
            | VmxeClear
            | MemoryOperandRequired
            | MalformedOperand
            | UnsupportedInstruction => FaultDisposition::InvalidOpcode,
            InaccessibleOperand(_) | ReadOnlyMsr(_) | UnsupportedMsr(_) => FaultDisposition::GeneralProtection,
            InvalidOperand(_) | NoCurrentVmcs => FaultDisposition::FailInvalid,
            VmxonInVmxOperation => FaultDisposition::FailValid(VmInstructionError::VmxonInRoot),
            InvalidPointer(_) => FaultDisposition::FailValid(VmInstructionError::VmptrldInvalidAddress),
            VmxonPointer => FaultDisposition::FailValid(VmInstructionError::VmptrldWithVmxonPointer),
            RevisionMismatch(_) => FaultDisposition::FailValid(VmInstructionError::VmptrldIncorrectVmcsRevision),
            InvalidField(_) => FaultDisposition::FailValid(VmInstructionError::VmreadVmwriteUnsupportedVmcsComponent),
            ReadOnlyField(_) => FaultDisposition::FailValid(VmInstructionError::VmwriteReadonlyVmcsComponent),
            InvalidClearPointer(_) => FaultDisposition::FailValid(VmInstructionError::VmclearInvalidAddress),
            ClearVmxonPointer => FaultDisposition::FailValid(VmInstructionError::VmclearWithVmxonPointer),
            LaunchNonClear => FaultDisposition::FailValid(VmInstructionError::VmlaunchNonClearVmcs),
            ResumeNonLaunched => FaultDisposition::FailValid(VmInstructionError::VmresumeNonLaunchedVmcs),
            EntryInvalidControlField(_) => FaultDisposition::FailValid(VmInstructionError::VmEntryInvalidControlFields),
            EntryInvalidHostState(_) => FaultDisposition::FailValid(VmInstructionError::VmEntryInvalidHostState),
            EntryInvalidGuestState(_) => FaultDisposition::EntryFailure,
        }
    }
}

/// Errors raised by the HVM save/restore codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaveError {
    #[error("Not enough space for record {typecode} ({needed} bytes, {available} available)")]
    OutOfSpace { typecode: u16, needed: usize, available: usize },
    #[error("Expected record type {expected}, found {found}")]
    RecordTypeMismatch { expected: u16, found: u16 },
    #[error("Record type {typecode} has length {found}, expected {expected}")]
    RecordLengthMismatch { typecode: u16, expected: u32, found: u32 },
    #[error("Unknown record type {0}")]
    UnknownRecordType(u16),
    #[error("Snapshot truncated at offset {0}")]
    Truncated(usize),
    #[error("Bad snapshot header: {0}")]
    BadHeader(&'static str),
    #[error("Record type {typecode} names instance {instance} which does not exist")]
    NoSuchInstance { typecode: u16, instance: u16 },
    #[error("Save handler {name} failed")]
    HandlerFailed { name: &'static str },
    #[error("No record of type {typecode} for instance {instance}")]
    NoSuchRecord { typecode: u16, instance: u16 },
    #[error("Failed to allocate a {0} byte snapshot buffer")]
    AllocationFailed(usize),
    #[error("Record type {0} contains an invalid value")]
    InvalidRecord(u16),
}
