//! Save-handler registration.
//!
//! Handlers are registered through a [`RegistryBuilder`] during initialisation
//! and the builder is then sealed into an immutable [`SaveRegistry`], which can
//! be shared between threads without locking.

use {
    crate::{error::SaveError, save::HvmDomainContext},
    alloc::{boxed::Box, collections::BTreeMap},
};

/// Type codes reserved by the snapshot framing.
pub const HVM_SAVE_END: u16 = 0;
pub const HVM_SAVE_HEADER: u16 = 1;

/// How many records of a type a snapshot holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SaveKind {
    /// One record with instance id 0.
    PerDomain,
    /// One record per vCPU, the instance id being the vCPU index.
    PerVcpu,
}

/// Whatever owns the state the handlers save: a domain, or a test double.
pub trait SaveOwner {
    /// Number of vCPUs, hence of per-vCPU instances.
    fn vcpu_count(&self) -> u16;

    /// Guest TSC frequency recorded in the snapshot header.
    fn tsc_khz(&self) -> u32;
}

/// Saves and restores the state of one record type.
pub trait StateHandler<T>: Send + Sync {
    /// Emits the records of `instance`. A handler may emit nothing when the state is default.
    fn save(&self, owner: &T, instance: u16, ctx: &mut HvmDomainContext) -> Result<(), SaveError>;

    /// Consumes exactly one record, the one at the cursor, which belongs to `instance`.
    fn load(&self, owner: &mut T, instance: u16, ctx: &mut HvmDomainContext) -> Result<(), SaveError>;
}

/// A registered record type.
pub struct SaveEntry<T> {
    pub name: &'static str,
    pub handler: Box<dyn StateHandler<T>>,
    /// Largest payload one instance may emit.
    pub max_size: u32,
    pub kind: SaveKind,
}

impl<T> SaveEntry<T> {
    /// Instance ids this type is saved for.
    pub fn instances(&self, owner: &T) -> core::ops::Range<u16>
    where
        T: SaveOwner,
    {
        match self.kind {
            SaveKind::PerDomain => 0..1,
            SaveKind::PerVcpu => 0..owner.vcpu_count(),
        }
    }
}

/// Collects registrations until the registry is sealed.
pub struct RegistryBuilder<T> {
    entries: BTreeMap<u16, SaveEntry<T>>,
}

impl<T> RegistryBuilder<T> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Registers the handler of `typecode`.
    ///
    /// # Panics
    ///
    /// If `typecode` is reserved for the header or END record, or already registered.
    pub fn register(
        mut self,
        typecode: u16,
        name: &'static str,
        handler: impl StateHandler<T> + 'static,
        max_size: u32,
        kind: SaveKind,
    ) -> Self {
        assert!(
            typecode != HVM_SAVE_END && typecode != HVM_SAVE_HEADER,
            "type code {} is reserved",
            typecode
        );
        assert!(!self.entries.contains_key(&typecode), "type code {} ({}) registered twice", typecode, name);

        log::debug!("Registering HVM save handler {} for type {}", name, typecode);
        self.entries.insert(typecode, SaveEntry { name, handler: Box::new(handler), max_size, kind });
        self
    }

    /// Seals the registry.
    pub fn build(self) -> SaveRegistry<T> {
        SaveRegistry { entries: self.entries }
    }
}

impl<T> Default for RegistryBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sealed mapping from type code to handler.
pub struct SaveRegistry<T> {
    entries: BTreeMap<u16, SaveEntry<T>>,
}

impl<T> SaveRegistry<T> {
    pub fn get(&self, typecode: u16) -> Option<&SaveEntry<T>> {
        self.entries.get(&typecode)
    }

    /// Registered types in type-code order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &SaveEntry<T>)> {
        self.entries.iter().map(|(typecode, entry)| (*typecode, entry))
    }
}
