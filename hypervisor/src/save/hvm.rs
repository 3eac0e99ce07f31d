//! Save and load drivers walking a [`SaveRegistry`].

use {
    crate::{
        error::SaveError,
        save::{
            records::{HvmSaveHeader, HVM_FILE_MAGIC, HVM_FILE_VERSION},
            registry::{SaveEntry, SaveOwner, SaveRegistry, HVM_SAVE_END},
            HvmDomainContext,
            SaveRecord,
            DESCRIPTOR_SIZE,
        },
    },
    alloc::{vec, vec::Vec},
    x86::cpuid::cpuid,
};

/// What [`hvm_load`] does with a record whose type has no registered handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnknownRecordPolicy {
    /// Fail with [`SaveError::UnknownRecordType`], leaving the cursor on the record.
    Strict,
    /// Skip the record with a warning.
    Tolerant,
}

/// CPUID.1:EAX of the host, recorded in and checked against the header.
fn host_cpuid_signature() -> u32 {
    cpuid!(1).eax
}

/// Runs the save handler of one instance.
///
/// # Panics
///
/// If the handler wrote more than one descriptor plus its registered maximum size.
fn save_instance<T: SaveOwner>(
    entry: &SaveEntry<T>,
    owner: &T,
    instance: u16,
    ctx: &mut HvmDomainContext,
) -> Result<(), SaveError> {
    let before = ctx.cursor();
    entry.handler.save(owner, instance, ctx)?;

    let written = ctx.cursor() - before;
    assert!(
        written <= DESCRIPTOR_SIZE + entry.max_size as usize,
        "HVM save: {} instance {} wrote {} bytes, over its budget of {}",
        entry.name,
        instance,
        written,
        DESCRIPTOR_SIZE + entry.max_size as usize
    );
    Ok(())
}

/// Bytes needed to save every registered type at its maximum size, framing included.
pub fn hvm_save_size<T: SaveOwner>(registry: &SaveRegistry<T>, owner: &T) -> usize {
    let records: usize = registry
        .iter()
        .map(|(_, entry)| entry.instances(owner).len() * (DESCRIPTOR_SIZE + entry.max_size as usize))
        .sum();

    DESCRIPTOR_SIZE + HvmSaveHeader::LENGTH as usize + records + DESCRIPTOR_SIZE
}

/// Saves `owner`: header, then every registered type in type-code order, then END.
///
/// The first failing handler aborts the save; the partial buffer is dropped.
pub fn hvm_save<T: SaveOwner>(registry: &SaveRegistry<T>, owner: &T) -> Result<HvmDomainContext, SaveError> {
    let mut ctx = HvmDomainContext::with_size(hvm_save_size(registry, owner))?;

    let header = HvmSaveHeader {
        magic: HVM_FILE_MAGIC,
        version: HVM_FILE_VERSION,
        changeset: 0,
        cpuid: host_cpuid_signature(),
        gtsc_khz: owner.tsc_khz(),
    };
    ctx.save_entry(0, &header)?;

    for (typecode, entry) in registry.iter() {
        for instance in entry.instances(owner) {
            log::trace!("HVM save: {} instance {}", entry.name, instance);

            if let Err(error) = save_instance(entry, owner, instance, &mut ctx) {
                log::error!("HVM save: failed to save type {} ({}) instance {}: {}", typecode, entry.name, instance, error);
                return Err(SaveError::HandlerFailed { name: entry.name });
            }
        }
    }

    ctx.init_entry(HVM_SAVE_END, 0, 0)?;
    ctx.write_entry(&[]);

    log::info!("HVM save: {} bytes", ctx.cursor());
    Ok(ctx)
}

/// Loads a snapshot into `owner`.
///
/// Records are dispatched by type code until the END record or the end of the
/// buffer. `policy` decides whether a type without a handler fails the load or
/// is skipped. An empty snapshot is valid and loads nothing.
///
/// # Panics
///
/// If a load handler returns without consuming its record.
pub fn hvm_load<T: SaveOwner>(
    registry: &SaveRegistry<T>,
    owner: &mut T,
    ctx: &mut HvmDomainContext,
    policy: UnknownRecordPolicy,
) -> Result<(), SaveError> {
    if ctx.size() == 0 {
        log::debug!("HVM restore: empty snapshot");
        return Ok(());
    }

    let (_, header) = ctx.load_entry::<HvmSaveHeader>()?;
    if header.magic != HVM_FILE_MAGIC {
        return Err(SaveError::BadHeader("magic mismatch"));
    }
    if header.version != HVM_FILE_VERSION {
        return Err(SaveError::BadHeader("unsupported version"));
    }
    if header.cpuid != host_cpuid_signature() {
        log::warn!("HVM restore: saved on CPU {:#x}, restoring on {:#x}", header.cpuid, host_cpuid_signature());
    }

    while let Some(descriptor) = ctx.peek_descriptor()? {
        if descriptor.typecode == HVM_SAVE_END {
            ctx.skip_entry()?;
            break;
        }

        let Some(entry) = registry.get(descriptor.typecode) else {
            if policy == UnknownRecordPolicy::Strict {
                log::error!("HVM restore: unknown record type {}", descriptor.typecode);
                return Err(SaveError::UnknownRecordType(descriptor.typecode));
            }
            log::warn!("HVM restore: skipping unknown record type {}", descriptor.typecode);
            ctx.skip_entry()?;
            continue;
        };

        if !entry.instances(owner).contains(&descriptor.instance) {
            return Err(SaveError::NoSuchInstance { typecode: descriptor.typecode, instance: descriptor.instance });
        }

        log::trace!("HVM restore: {} instance {}", entry.name, descriptor.instance);
        let before = ctx.cursor();
        entry.handler.load(owner, descriptor.instance, ctx)?;
        assert!(ctx.cursor() > before, "HVM restore: {} handler did not consume its record", entry.name);
    }

    Ok(())
}

/// Saves a single record: the payload `typecode` emits for `instance`.
pub fn hvm_save_one<T: SaveOwner>(
    registry: &SaveRegistry<T>,
    owner: &T,
    typecode: u16,
    instance: u16,
) -> Result<Vec<u8>, SaveError> {
    let entry = registry.get(typecode).ok_or(SaveError::UnknownRecordType(typecode))?;
    if !entry.instances(owner).contains(&instance) {
        return Err(SaveError::NoSuchInstance { typecode, instance });
    }

    let mut ctx = HvmDomainContext::with_size(DESCRIPTOR_SIZE + entry.max_size as usize)?;
    save_instance(entry, owner, instance, &mut ctx)?;

    let mut ctx = HvmDomainContext::from_bytes(ctx.into_bytes());
    while let Some(descriptor) = ctx.peek_descriptor()? {
        if descriptor.typecode == typecode && descriptor.instance == instance {
            let mut payload = vec![0u8; descriptor.length as usize];
            ctx.read_entry(typecode, &mut payload, true)?;
            return Ok(payload);
        }
        ctx.skip_entry()?;
    }

    Err(SaveError::NoSuchRecord { typecode, instance })
}
