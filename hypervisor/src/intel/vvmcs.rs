//! The virtual VMCS seen by the guest hypervisor.
//!
//! The physical VMCS layout is implementation specific, so the guest gets a
//! custom one. It occupies a 4-KByte page viewed as `u64[512]`; a field lives at
//! the slot offset built from its encoding:
//!
//! ```text
//!              9       7      5               0
//!              --------------------------------
//!      offset: | width | type |     index     |
//!              --------------------------------
//! ```
//!
//! so every `(width, type)` class holds at most 32 fields. Offset 0 carries the
//! revision and abort indicator, and the only field that would land there, the
//! VPID, is moved to offset 63. The `(16-bit, read-only)` class has no
//! architectural fields; offsets 32..40 of it keep the mask of written fields
//! and offset 40 the launch state.
//!
//! While a virtual VMCS is current, the hypervisor works on a shadow of the page
//! kept as one slot array per class, and writes it back on VMCLEAR, on VMPTRLD of
//! another region and on VMXOFF.

use {
    crate::{
        config::PAGE_SIZE,
        error::{HypervisorError, VmxFault},
        intel::memory::{GuestMemory, GuestMemoryError},
    },
    alloc::vec::Vec,
    bitfield::bitfield,
    zerocopy::IntoBytes,
};

/// Fields per `(width, type)` class.
pub const FIELDS_PER_CLASS: usize = 32;

/// Number of `(width, type)` classes.
const CLASS_COUNT: usize = 16;

/// Slot offset the VPID field is relocated to.
const VPID_OFFSET: usize = 63;

/// First slot offset of the written-field mask.
const WRITTEN_MASK_OFFSET: usize = 32;

/// Slots occupied by the written-field mask (one bit per slot).
const WRITTEN_MASK_SLOTS: usize = CLASS_COUNT / 2;

/// Slot offset of the launch state, non-zero once launched.
const LAUNCH_STATE_OFFSET: usize = WRITTEN_MASK_OFFSET + WRITTEN_MASK_SLOTS;

const SLOTS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u64>();
const_assert_eq!(SLOTS_PER_PAGE, CLASS_COUNT * FIELDS_PER_CLASS);

bitfield! {
    /// VMCS component encoding, as passed to VMREAD and VMWRITE.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-21. Structure of VMCS Component Encoding
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct VmcsEncoding(u32);

    impl Debug;

    pub high_access, _: 0;
    pub u16, index, _: 9, 1;
    pub u8, type_bits, _: 11, 10;
    pub reserved1, _: 12;
    pub u8, width_bits, _: 14, 13;
    pub u32, reserved2, _: 31, 15;
}

/// Width of a VMCS field, as found in bits 14:13 of its encoding.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldWidth {
    Bits16 = 0,
    Bits64 = 1,
    Bits32 = 2,
    Natural = 3,
}

impl FieldWidth {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Bits16,
            1 => Self::Bits64,
            2 => Self::Bits32,
            _ => Self::Natural,
        }
    }

    /// Mask of the bits a field of this width can hold. Natural width is 64 bits.
    pub fn mask(&self) -> u64 {
        match self {
            Self::Bits16 => 0xFFFF,
            Self::Bits32 => 0xFFFF_FFFF,
            Self::Bits64 | Self::Natural => u64::MAX,
        }
    }
}

/// Area of a VMCS field, as found in bits 11:10 of its encoding.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldType {
    Control = 0,
    ReadOnly = 1,
    GuestState = 2,
    HostState = 3,
}

impl FieldType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Control,
            1 => Self::ReadOnly,
            2 => Self::GuestState,
            _ => Self::HostState,
        }
    }
}

/// Whether a 64-bit field is accessed in full or only its upper half.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessType {
    Full,
    High,
}

/// A validated field encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmcsField {
    pub encoding: u32,
    pub access: AccessType,
    pub index: u8,
    pub kind: FieldType,
    pub width: FieldWidth,
}

impl VmcsField {
    /// Decodes and bounds-checks an encoding supplied by the guest.
    pub fn decode(encoding: u32) -> Result<Self, VmxFault> {
        let raw = VmcsEncoding(encoding);

        if raw.reserved1() || raw.reserved2() != 0 {
            return Err(VmxFault::InvalidField(encoding));
        }

        let index = raw.index();
        if index as usize >= FIELDS_PER_CLASS {
            return Err(VmxFault::InvalidField(encoding));
        }

        let kind = FieldType::from_bits(raw.type_bits());
        let width = FieldWidth::from_bits(raw.width_bits());

        // The 16-bit read-only class has no fields; its page area is internal.
        if kind == FieldType::ReadOnly && width == FieldWidth::Bits16 {
            return Err(VmxFault::InvalidField(encoding));
        }

        let access = if raw.high_access() { AccessType::High } else { AccessType::Full };
        if access == AccessType::High && width != FieldWidth::Bits64 {
            return Err(VmxFault::InvalidField(encoding));
        }

        Ok(Self { encoding, access, index: index as u8, kind, width })
    }

    /// Slot offset of the field within the page.
    pub fn offset(&self) -> usize {
        let offset = (self.index as usize) | (self.kind as usize) << 5 | (self.width as usize) << 7;
        if offset == 0 {
            VPID_OFFSET
        } else {
            offset
        }
    }
}

/// Header of the virtual VMCS page.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct VvmcsHeader {
    pub revision: u32,
    pub abort: u32,
}

/// Shadow of a virtual VMCS page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualVmcs {
    pub header: VvmcsHeader,
    /// One 32-slot array per `(width, type)` class, indexed by `offset >> 5`.
    classes: Vec<[u64; FIELDS_PER_CLASS]>,
    /// One bit per slot, set once the field has been written.
    written: [u32; CLASS_COUNT],
    launched: bool,
}

impl VirtualVmcs {
    /// Allocates a zeroed shadow.
    pub fn new(revision: u32) -> Result<Self, HypervisorError> {
        let mut classes = Vec::new();
        classes
            .try_reserve_exact(CLASS_COUNT)
            .map_err(|_| HypervisorError::MemoryAllocationFailed)?;
        classes.resize(CLASS_COUNT, [0u64; FIELDS_PER_CLASS]);

        Ok(Self {
            header: VvmcsHeader { revision, abort: 0 },
            classes,
            written: [0; CLASS_COUNT],
            launched: false,
        })
    }

    /// Reads the revision identifier of a region without shadowing it.
    pub fn peek_revision<M: GuestMemory + ?Sized>(memory: &M, gpa: u64) -> Result<u32, GuestMemoryError> {
        memory.read_u32(gpa)
    }

    /// Replaces the shadow with the contents of the page at `gpa`.
    pub fn reload<M: GuestMemory + ?Sized>(&mut self, memory: &M, gpa: u64) -> Result<(), GuestMemoryError> {
        let mut page = [0u64; SLOTS_PER_PAGE];
        memory.read(gpa, page.as_mut_bytes())?;

        self.header = VvmcsHeader { revision: page[0] as u32, abort: (page[0] >> 32) as u32 };

        for (offset, value) in page.iter().enumerate() {
            if Self::is_internal_offset(offset) {
                continue;
            }
            self.classes[offset / FIELDS_PER_CLASS][offset % FIELDS_PER_CLASS] = *value;
        }

        for slot in 0..WRITTEN_MASK_SLOTS {
            let bits = page[WRITTEN_MASK_OFFSET + slot];
            self.written[slot * 2] = bits as u32;
            self.written[slot * 2 + 1] = (bits >> 32) as u32;
        }
        self.launched = page[LAUNCH_STATE_OFFSET] != 0;

        Ok(())
    }

    /// Writes the shadow back to the page at `gpa`.
    pub fn flush<M: GuestMemory + ?Sized>(&self, memory: &mut M, gpa: u64) -> Result<(), GuestMemoryError> {
        let mut page = [0u64; SLOTS_PER_PAGE];
        page[0] = u64::from(self.header.revision) | u64::from(self.header.abort) << 32;

        for (offset, slot) in page.iter_mut().enumerate() {
            if Self::is_internal_offset(offset) {
                continue;
            }
            *slot = self.classes[offset / FIELDS_PER_CLASS][offset % FIELDS_PER_CLASS];
        }

        for slot in 0..WRITTEN_MASK_SLOTS {
            page[WRITTEN_MASK_OFFSET + slot] =
                u64::from(self.written[slot * 2]) | u64::from(self.written[slot * 2 + 1]) << 32;
        }
        page[LAUNCH_STATE_OFFSET] = u64::from(self.launched);

        memory.write(gpa, page.as_bytes())
    }

    /// Sets the launch state of a region that is not shadowed to clear.
    pub fn clear_launch_state<M: GuestMemory + ?Sized>(memory: &mut M, gpa: u64) -> Result<(), GuestMemoryError> {
        memory.write_u64(gpa + (LAUNCH_STATE_OFFSET * core::mem::size_of::<u64>()) as u64, 0)
    }

    fn is_internal_offset(offset: usize) -> bool {
        offset == 0 || (WRITTEN_MASK_OFFSET..=LAUNCH_STATE_OFFSET).contains(&offset)
    }

    /// Whether VMLAUNCH has been executed since the region was last cleared.
    pub fn is_launched(&self) -> bool {
        self.launched
    }

    pub fn set_launched(&mut self, launched: bool) {
        self.launched = launched;
    }

    /// Reads a decoded field.
    pub fn read(&self, field: VmcsField) -> u64 {
        let offset = field.offset();
        let value = self.classes[offset / FIELDS_PER_CLASS][offset % FIELDS_PER_CLASS];

        match field.access {
            AccessType::High => value >> 32,
            AccessType::Full => value & field.width.mask(),
        }
    }

    /// Writes a decoded field, truncating to its width.
    pub fn write(&mut self, field: VmcsField, value: u64) {
        let offset = field.offset();
        let (class, index) = (offset / FIELDS_PER_CLASS, offset % FIELDS_PER_CLASS);
        let slot = &mut self.classes[class][index];

        *slot = match field.access {
            AccessType::High => (*slot & 0xFFFF_FFFF) | (value & 0xFFFF_FFFF) << 32,
            AccessType::Full => value & field.width.mask(),
        };
        self.written[class] |= 1 << index;
    }

    /// VMREAD on behalf of the guest.
    pub fn guest_read(&self, encoding: u32) -> Result<u64, VmxFault> {
        let field = VmcsField::decode(encoding)?;
        Ok(self.read(field))
    }

    /// VMWRITE on behalf of the guest. Read-only fields are rejected.
    pub fn guest_write(&mut self, encoding: u32, value: u64) -> Result<(), VmxFault> {
        let field = VmcsField::decode(encoding)?;
        if field.kind == FieldType::ReadOnly {
            return Err(VmxFault::ReadOnlyField(encoding));
        }
        self.write(field, value);
        Ok(())
    }

    /// Reads a field by encoding on behalf of the hypervisor. Unsupported encodings read as zero.
    pub fn get(&self, encoding: u32) -> u64 {
        match VmcsField::decode(encoding) {
            Ok(field) => self.read(field),
            Err(_) => {
                log::error!("Unsupported virtual VMCS encoding {:#x}", encoding);
                0
            }
        }
    }

    /// Writes a field by encoding on behalf of the hypervisor, including read-only fields.
    pub fn set(&mut self, encoding: u32, value: u64) {
        match VmcsField::decode(encoding) {
            Ok(field) => self.write(field, value),
            Err(_) => log::error!("Unsupported virtual VMCS encoding {:#x}", encoding),
        }
    }

    /// Whether the field has been written since the region was created.
    pub fn is_written(&self, encoding: u32) -> bool {
        match VmcsField::decode(encoding) {
            Ok(field) => {
                let offset = field.offset();
                self.written[offset / FIELDS_PER_CLASS] & (1 << (offset % FIELDS_PER_CLASS)) != 0
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::memory::GuestRam,
        x86::vmx::vmcs::{control, guest, ro},
    };

    /// width 32, type CONTROL, index 5
    const CONTROL32_INDEX5: u32 = (2 << 13) | (5 << 1);

    #[test]
    fn control32_round_trip() {
        let mut vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        vmcs.guest_write(CONTROL32_INDEX5, 0x1234_5678).unwrap();
        assert_eq!(vmcs.guest_read(CONTROL32_INDEX5), Ok(0x1234_5678));
    }

    #[test]
    fn unwritten_field_reads_zero() {
        let vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        assert_eq!(vmcs.guest_read(guest::RIP), Ok(0));
        assert!(!vmcs.is_written(guest::RIP));
    }

    #[test]
    fn writes_truncate_to_width() {
        let mut vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        vmcs.guest_write(guest::CS_SELECTOR, 0xdead_beef).unwrap();
        assert_eq!(vmcs.guest_read(guest::CS_SELECTOR), Ok(0xbeef));
        vmcs.guest_write(control::PINBASED_EXEC_CONTROLS, u64::MAX).unwrap();
        assert_eq!(vmcs.guest_read(control::PINBASED_EXEC_CONTROLS), Ok(0xFFFF_FFFF));
    }

    #[test]
    fn high_access_addresses_upper_half() {
        let mut vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        vmcs.guest_write(control::TSC_OFFSET_FULL, 0x1111_2222_3333_4444).unwrap();
        assert_eq!(vmcs.guest_read(control::TSC_OFFSET_FULL | 1), Ok(0x1111_2222));

        vmcs.guest_write(control::TSC_OFFSET_FULL | 1, 0xaaaa_bbbb).unwrap();
        assert_eq!(vmcs.guest_read(control::TSC_OFFSET_FULL), Ok(0xaaaa_bbbb_3333_4444));

        // The high half of a 32-bit field does not exist.
        assert_eq!(
            vmcs.guest_read(control::PINBASED_EXEC_CONTROLS | 1),
            Err(VmxFault::InvalidField(control::PINBASED_EXEC_CONTROLS | 1))
        );
    }

    #[test]
    fn out_of_range_encodings_are_rejected() {
        let vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        let index32 = (2 << 13) | (32 << 1);
        assert_eq!(vmcs.guest_read(index32), Err(VmxFault::InvalidField(index32)));
        assert_eq!(vmcs.guest_read(1 << 12), Err(VmxFault::InvalidField(1 << 12)));
        assert_eq!(vmcs.guest_read(1 << 15), Err(VmxFault::InvalidField(1 << 15)));
    }

    #[test]
    fn read_only_fields_reject_guest_writes() {
        let mut vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        assert_eq!(vmcs.guest_write(ro::EXIT_REASON, 1), Err(VmxFault::ReadOnlyField(ro::EXIT_REASON)));
        vmcs.set(ro::EXIT_REASON, 10);
        assert_eq!(vmcs.guest_read(ro::EXIT_REASON), Ok(10));
    }

    #[test]
    fn vpid_is_relocated() {
        let field = VmcsField::decode(control::VPID).unwrap();
        assert_eq!(field.offset(), 63);
        let field = VmcsField::decode(guest::ES_SELECTOR).unwrap();
        assert_eq!(field.offset(), 2 << 5);
    }

    #[test]
    fn page_round_trip_keeps_written_mask() {
        let mut ram = GuestRam::new(0x3000);
        let mut vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        vmcs.guest_write(control::VPID, 7).unwrap();
        vmcs.guest_write(guest::RIP, 0x1000).unwrap();
        vmcs.flush(&mut ram, 0x1000).unwrap();

        assert_eq!(VirtualVmcs::peek_revision(&ram, 0x1000), Ok(0x4000_0001));
        assert_eq!(ram.read_u64(0x1000 + 63 * 8), Ok(7));

        let mut loaded = VirtualVmcs::new(0).unwrap();
        loaded.reload(&ram, 0x1000).unwrap();
        assert_eq!(loaded, vmcs);
        assert!(loaded.is_written(guest::RIP));
        assert!(!loaded.is_written(guest::RSP));
    }

    #[test]
    fn launch_state_lives_in_the_page() {
        let mut ram = GuestRam::new(0x3000);
        let mut vmcs = VirtualVmcs::new(0x4000_0001).unwrap();
        vmcs.set_launched(true);
        vmcs.flush(&mut ram, 0x1000).unwrap();

        let mut loaded = VirtualVmcs::new(0).unwrap();
        loaded.reload(&ram, 0x1000).unwrap();
        assert!(loaded.is_launched());

        VirtualVmcs::clear_launch_state(&mut ram, 0x1000).unwrap();
        loaded.reload(&ram, 0x1000).unwrap();
        assert!(!loaded.is_launched());
        assert_eq!(loaded.header.revision, 0x4000_0001);
    }
}
