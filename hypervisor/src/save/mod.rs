//! HVM save/restore: a flat stream of typed, length-prefixed records.
//!
//! Every record is a [`SaveDescriptor`] followed by `length` payload bytes, in
//! host byte order, back to back with no outer framing. A snapshot starts with
//! a header record and ends with an END record; in between, every registered
//! [`StateHandler`](registry::StateHandler) emits its records.

use {
    crate::error::SaveError,
    alloc::vec::Vec,
    core::mem::size_of,
    zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout},
};

pub mod hvm;
pub mod records;
pub mod registry;

/// Descriptor preceding every record payload.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SaveDescriptor {
    pub typecode: u16,
    pub instance: u16,
    pub length: u32,
}
const_assert_eq!(size_of::<SaveDescriptor>(), 8);

pub const DESCRIPTOR_SIZE: usize = size_of::<SaveDescriptor>();

/// A snapshot buffer with its cursor.
///
/// Saving fills a buffer of fixed size, sized up front from the registry's
/// maximum record sizes. Loading walks a buffer produced by a previous save.
#[derive(Debug)]
pub struct HvmDomainContext {
    data: Vec<u8>,
    cur: usize,
    /// Payload bytes still owed by the record opened with `init_entry`.
    open_entry: Option<u32>,
}

impl HvmDomainContext {
    /// Allocates a zeroed buffer of `size` bytes for saving.
    pub fn with_size(size: usize) -> Result<Self, SaveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| SaveError::AllocationFailed(size))?;
        data.resize(size, 0);
        Ok(Self { data, cur: 0, open_entry: None })
    }

    /// Wraps a saved stream for loading.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, cur: 0, open_entry: None }
    }

    pub fn cursor(&self) -> usize {
        self.cur
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cur >= self.data.len()
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.cur]
    }

    /// Consumes the context, returning the bytes written so far.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.cur);
        self.data
    }

    /// Opens a record: checks there is room for descriptor and payload and writes the descriptor.
    ///
    /// On `OutOfSpace` the cursor is left unchanged.
    pub fn init_entry(&mut self, typecode: u16, instance: u16, length: u32) -> Result<(), SaveError> {
        assert!(self.open_entry.is_none(), "record opened before the previous one was written");

        let available = self.size() - self.cur;
        let needed = DESCRIPTOR_SIZE + length as usize;
        if needed > available {
            log::error!("HVM save: no room for a {} byte record of type {}", needed, typecode);
            return Err(SaveError::OutOfSpace { typecode, needed, available });
        }

        let descriptor = SaveDescriptor { typecode, instance, length };
        self.data[self.cur..self.cur + DESCRIPTOR_SIZE].copy_from_slice(descriptor.as_bytes());
        self.cur += DESCRIPTOR_SIZE;
        self.open_entry = Some(length);
        Ok(())
    }

    /// Writes the payload of the record opened by [`Self::init_entry`].
    ///
    /// # Panics
    ///
    /// If no record is open or `src` is not exactly the declared length.
    pub fn write_entry(&mut self, src: &[u8]) {
        let Some(length) = self.open_entry.take() else {
            panic!("write_entry without init_entry");
        };
        let length = length as usize;
        assert_eq!(src.len(), length, "record payload does not match its declared length");

        self.data[self.cur..self.cur + length].copy_from_slice(src);
        self.cur += length;
    }

    /// Descriptor of the record at the cursor, `None` at the end of the stream.
    pub fn peek_descriptor(&self) -> Result<Option<SaveDescriptor>, SaveError> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let bytes = self.data.get(self.cur..self.cur + DESCRIPTOR_SIZE).ok_or(SaveError::Truncated(self.cur))?;
        let descriptor = SaveDescriptor::read_from_bytes(bytes).map_err(|_| SaveError::Truncated(self.cur))?;

        if self.cur + DESCRIPTOR_SIZE + descriptor.length as usize > self.size() {
            return Err(SaveError::Truncated(self.cur));
        }
        Ok(Some(descriptor))
    }

    /// Instance id of the record at the cursor, without consuming it.
    pub fn load_instance(&self) -> Result<u16, SaveError> {
        self.peek_descriptor()?.map(|descriptor| descriptor.instance).ok_or(SaveError::Truncated(self.cur))
    }

    /// Validates the record at the cursor against the expected type and length.
    ///
    /// In strict mode the lengths must be equal. Otherwise a shorter record is
    /// accepted and will be zero-extended by [`Self::read_entry`].
    pub fn check_entry(&self, typecode: u16, length: u32, strict: bool) -> Result<SaveDescriptor, SaveError> {
        let descriptor = self.peek_descriptor()?.ok_or(SaveError::Truncated(self.cur))?;

        if descriptor.typecode != typecode {
            return Err(SaveError::RecordTypeMismatch { expected: typecode, found: descriptor.typecode });
        }

        let acceptable = match strict {
            true => descriptor.length == length,
            false => descriptor.length <= length,
        };
        if !acceptable {
            return Err(SaveError::RecordLengthMismatch { typecode, expected: length, found: descriptor.length });
        }

        Ok(descriptor)
    }

    /// Consumes the record at the cursor into `dst`, zero-filling whatever the record does not cover.
    pub fn read_entry(&mut self, typecode: u16, dst: &mut [u8], strict: bool) -> Result<SaveDescriptor, SaveError> {
        let descriptor = self.check_entry(typecode, dst.len() as u32, strict)?;
        let start = self.cur + DESCRIPTOR_SIZE;
        let length = descriptor.length as usize;

        dst[..length].copy_from_slice(&self.data[start..start + length]);
        dst[length..].fill(0);
        self.cur = start + length;
        Ok(descriptor)
    }

    /// Skips the record at the cursor.
    pub fn skip_entry(&mut self) -> Result<SaveDescriptor, SaveError> {
        let descriptor = self.peek_descriptor()?.ok_or(SaveError::Truncated(self.cur))?;
        self.cur += DESCRIPTOR_SIZE + descriptor.length as usize;
        Ok(descriptor)
    }

    /// Writes a typed record.
    pub fn save_entry<R: SaveRecord>(&mut self, instance: u16, record: &R) -> Result<(), SaveError> {
        self.init_entry(R::TYPECODE, instance, R::LENGTH)?;
        self.write_entry(record.as_bytes());
        Ok(())
    }

    /// Reads a typed record of exactly the current layout, or of its compat layout followed by the fix-up.
    pub fn load_entry<R: SaveRecord>(&mut self) -> Result<(u16, R), SaveError> {
        let mut record = R::new_zeroed();

        let descriptor = match R::COMPAT_LENGTH {
            Some(compat) if self.check_entry(R::TYPECODE, compat, true).is_ok() => {
                let descriptor = self.read_entry(R::TYPECODE, record.as_mut_bytes(), false)?;
                record.fix_compat();
                descriptor
            }
            _ => self.read_entry(R::TYPECODE, record.as_mut_bytes(), true)?,
        };

        Ok((descriptor.instance, record))
    }

    /// Reads a typed record, accepting any shorter length and zero-extending it.
    pub fn load_entry_zero_extend<R: SaveRecord>(&mut self) -> Result<(u16, R), SaveError> {
        let mut record = R::new_zeroed();
        let descriptor = self.read_entry(R::TYPECODE, record.as_mut_bytes(), false)?;
        Ok((descriptor.instance, record))
    }
}

/// A fixed-layout record with a registered type code.
pub trait SaveRecord: IntoBytes + FromBytes + Immutable + KnownLayout + Sized {
    const TYPECODE: u16;

    const LENGTH: u32 = size_of::<Self>() as u32;

    /// Length of an older, shorter layout still accepted at load.
    const COMPAT_LENGTH: Option<u32> = None;

    /// Completes a record loaded from the compat layout; the missing tail reads as zero.
    fn fix_compat(&mut self) {}
}
