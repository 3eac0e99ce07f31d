//! Domain configuration and the virtual VMX capabilities reported to L1.

/// Revision identifier of the virtual VMCS layout.
///
/// The layout is not architectural, so it uses its own revision with bit 30 set
/// to keep it apart from any processor-defined identifier.
pub const VVMCS_REVISION: u32 = 0x4000_0001;

/// Size of a VMXON region or a virtual VMCS region.
pub const PAGE_SIZE: usize = 0x1000;

/// Per-domain settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainConfig {
    /// Number of virtual CPUs.
    pub vcpus: u16,

    /// Whether VMX is exposed to the guest.
    pub nested_virtualization: bool,

    /// Size of the guest physical address space backed by RAM, in bytes.
    pub memory_size: usize,

    /// Physical-address width reported to the guest.
    pub physical_address_bits: u8,

    /// Guest TSC frequency in kHz, recorded in the snapshot header.
    pub tsc_khz: u32,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            nested_virtualization: true,
            memory_size: 16 * 1024 * 1024,
            physical_address_bits: 39,
            tsc_khz: 0,
        }
    }
}

impl DomainConfig {
    /// Highest valid guest-physical address plus one.
    pub fn physical_address_limit(&self) -> u64 {
        1u64 << self.physical_address_bits
    }
}
