//! Guest-physical memory access used by the dispatcher.
//!
//! The VMXON region, virtual VMCS pages and I/O bitmaps all live in guest
//! memory. Linear addresses produced by operand decoding are treated as
//! guest-physical; guest paging is not walked.

use {
    crate::error::HypervisorError,
    alloc::{vec, vec::Vec},
    thiserror_no_std::Error,
};

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuestMemoryError {
    #[error("Guest physical range {address:#x}+{len:#x} is not backed")]
    Unbacked { address: u64, len: usize },
}

impl From<GuestMemoryError> for HypervisorError {
    fn from(error: GuestMemoryError) -> Self {
        match error {
            GuestMemoryError::Unbacked { address, .. } => HypervisorError::GuestMemoryAccessFailed(address),
        }
    }
}

/// Access to a domain's guest-physical address space.
pub trait GuestMemory {
    fn read(&self, gpa: u64, buffer: &mut [u8]) -> Result<(), GuestMemoryError>;

    fn write(&mut self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError>;

    fn read_u64(&self, gpa: u64) -> Result<u64, GuestMemoryError> {
        let mut bytes = [0u8; 8];
        self.read(gpa, &mut bytes)?;
        Ok(u64::from_ne_bytes(bytes))
    }

    fn read_u32(&self, gpa: u64) -> Result<u32, GuestMemoryError> {
        let mut bytes = [0u8; 4];
        self.read(gpa, &mut bytes)?;
        Ok(u32::from_ne_bytes(bytes))
    }

    fn write_u64(&mut self, gpa: u64, value: u64) -> Result<(), GuestMemoryError> {
        self.write(gpa, &value.to_ne_bytes())
    }

    fn write_u32(&mut self, gpa: u64, value: u32) -> Result<(), GuestMemoryError> {
        self.write(gpa, &value.to_ne_bytes())
    }
}

/// Flat RAM starting at guest-physical address zero.
pub struct GuestRam {
    bytes: Vec<u8>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0u8; size] }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, gpa: u64, len: usize) -> Result<core::ops::Range<usize>, GuestMemoryError> {
        let unbacked = GuestMemoryError::Unbacked { address: gpa, len };
        let start = usize::try_from(gpa).map_err(|_| unbacked)?;
        let end = start.checked_add(len).ok_or(unbacked)?;
        if end > self.bytes.len() {
            return Err(unbacked);
        }
        Ok(start..end)
    }
}

impl GuestMemory for GuestRam {
    fn read(&self, gpa: u64, buffer: &mut [u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(gpa, buffer.len())?;
        buffer.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(gpa, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_writes() {
        let mut ram = GuestRam::new(0x2000);
        ram.write_u64(0x1ff8, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(ram.read_u64(0x1ff8).unwrap(), 0xdead_beef_cafe_f00d);
        assert_eq!(ram.read_u32(0x1ff8).unwrap(), 0xcafe_f00d);
    }

    #[test]
    fn rejects_unbacked_ranges() {
        let ram = GuestRam::new(0x1000);
        let mut buffer = [0u8; 8];
        assert_eq!(
            ram.read(0xffc, &mut buffer),
            Err(GuestMemoryError::Unbacked { address: 0xffc, len: 8 })
        );
        assert!(ram.read(u64::MAX, &mut buffer).is_err());
    }
}
