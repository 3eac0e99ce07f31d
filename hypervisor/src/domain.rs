//! A domain: its vCPUs, its guest-physical memory and its snapshot handlers.

use {
    crate::{
        config::DomainConfig,
        error::{HypervisorError, SaveError},
        intel::{
            memory::GuestRam,
            vcpu::Vcpu,
            vmexit::{ExitInfo, ExitType},
        },
        save::{
            hvm::{hvm_load, hvm_save, hvm_save_one, hvm_save_size, UnknownRecordPolicy},
            records::{CpuRecord, NestedVmxRecord, HVM_SAVE_CPU, HVM_SAVE_NESTED_VMX},
            registry::{RegistryBuilder, SaveKind, SaveOwner, SaveRegistry, StateHandler},
            HvmDomainContext,
            SaveRecord,
        },
    },
    alloc::vec::Vec,
    lazy_static::lazy_static,
};

lazy_static! {
    /// Record types every domain saves, sealed on first use.
    static ref SAVE_REGISTRY: SaveRegistry<Domain> = RegistryBuilder::new()
        .register(HVM_SAVE_CPU, "CPU", CpuHandler, CpuRecord::LENGTH, SaveKind::PerVcpu)
        .register(HVM_SAVE_NESTED_VMX, "NESTED_VMX", NestedVmxHandler, NestedVmxRecord::LENGTH, SaveKind::PerVcpu)
        .build();
}

pub struct Domain {
    config: DomainConfig,
    vcpus: Vec<Vcpu>,
    memory: GuestRam,
}

impl Domain {
    pub fn new(config: DomainConfig) -> Result<Self, HypervisorError> {
        #[cfg(feature = "host-vmx-check")]
        {
            if config.nested_virtualization {
                /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX */
                Self::has_intel_cpu()?;
                Self::has_vmx_support()?;
                log::info!("Host CPU supports VMX");
            }
        }

        let vcpus = (0..config.vcpus).map(|id| Vcpu::new(id, &config)).collect::<Vec<_>>();
        log::info!(
            "Created domain with {} vCPUs, {:#x} bytes of memory, nested virtualization {}",
            vcpus.len(),
            config.memory_size,
            config.nested_virtualization
        );

        Ok(Self { config, vcpus, memory: GuestRam::new(config.memory_size) })
    }

    /// Check to see if CPU is Intel (“GenuineIntel”).
    #[cfg(feature = "host-vmx-check")]
    fn has_intel_cpu() -> Result<(), HypervisorError> {
        let cpuid = x86::cpuid::CpuId::new();
        if let Some(vi) = cpuid.get_vendor_info() {
            if vi.as_str() == "GenuineIntel" {
                return Ok(());
            }
        }
        Err(HypervisorError::CPUUnsupported)
    }

    /// Check processor supports for Virtual Machine Extension (VMX) technology - CPUID.1:ECX.VMX\[bit 5] = 1
    #[cfg(feature = "host-vmx-check")]
    fn has_vmx_support() -> Result<(), HypervisorError> {
        let cpuid = x86::cpuid::CpuId::new();
        if let Some(fi) = cpuid.get_feature_info() {
            if fi.has_vmx() {
                return Ok(());
            }
        }
        Err(HypervisorError::VMXUnsupported)
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn vcpu(&self, id: u16) -> Result<&Vcpu, HypervisorError> {
        self.vcpus.get(id as usize).ok_or(HypervisorError::InvalidVcpu(id))
    }

    pub fn vcpu_mut(&mut self, id: u16) -> Result<&mut Vcpu, HypervisorError> {
        self.vcpus.get_mut(id as usize).ok_or(HypervisorError::InvalidVcpu(id))
    }

    pub fn memory(&self) -> &GuestRam {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuestRam {
        &mut self.memory
    }

    /// Handles a VM exit taken by vCPU `vcpu_id`.
    pub fn handle_vmexit(&mut self, vcpu_id: u16, exit: &ExitInfo) -> Result<ExitType, HypervisorError> {
        let Self { vcpus, memory, .. } = self;
        let vcpu = vcpus.get_mut(vcpu_id as usize).ok_or(HypervisorError::InvalidVcpu(vcpu_id))?;
        vcpu.handle_vmexit(memory, exit)
    }

    /// Bytes a snapshot of this domain may take at most.
    pub fn save_size(&self) -> usize {
        hvm_save_size(&*SAVE_REGISTRY, self)
    }

    /// Snapshots the domain. Its vCPUs must be paused.
    ///
    /// Shadowed virtual VMCSs are written back to guest memory first, so the
    /// snapshot of the memory holds their contents.
    pub fn save(&mut self) -> Result<Vec<u8>, HypervisorError> {
        for vcpu in &self.vcpus {
            vcpu.nested.flush(&mut self.memory)?;
        }

        let ctx = hvm_save(&*SAVE_REGISTRY, self)?;
        Ok(ctx.into_bytes())
    }

    /// Restores a snapshot taken by [`Domain::save`]. Guest memory must already hold
    /// the saved contents.
    ///
    /// Every vCPU is reset first; a vCPU without records stays in its INIT state.
    /// `policy` decides whether record types this build does not know fail the restore.
    pub fn restore(&mut self, snapshot: &[u8], policy: UnknownRecordPolicy) -> Result<(), HypervisorError> {
        self.vcpus.iter_mut().for_each(Vcpu::reset);

        let mut ctx = HvmDomainContext::from_bytes(snapshot.to_vec());
        hvm_load(&*SAVE_REGISTRY, self, &mut ctx, policy)?;

        log::info!("Restored domain from a {} byte snapshot", snapshot.len());
        Ok(())
    }

    /// Payload of the record `typecode` saves for `instance`.
    pub fn save_one(&mut self, typecode: u16, instance: u16) -> Result<Vec<u8>, HypervisorError> {
        if let Some(vcpu) = self.vcpus.get(instance as usize) {
            vcpu.nested.flush(&mut self.memory)?;
        }

        Ok(hvm_save_one(&*SAVE_REGISTRY, self, typecode, instance)?)
    }
}

impl SaveOwner for Domain {
    fn vcpu_count(&self) -> u16 {
        self.vcpus.len() as u16
    }

    fn tsc_khz(&self) -> u32 {
        self.config.tsc_khz
    }
}

fn saved_vcpu(domain: &Domain, typecode: u16, instance: u16) -> Result<&Vcpu, SaveError> {
    domain.vcpus.get(instance as usize).ok_or(SaveError::NoSuchInstance { typecode, instance })
}

/// Checks the record at the cursor belongs to the instance the driver dispatched it for.
fn check_instance(typecode: u16, expected: u16, found: u16) -> Result<(), SaveError> {
    match expected == found {
        true => Ok(()),
        false => Err(SaveError::NoSuchInstance { typecode, instance: found }),
    }
}

struct CpuHandler;

impl StateHandler<Domain> for CpuHandler {
    fn save(&self, owner: &Domain, instance: u16, ctx: &mut HvmDomainContext) -> Result<(), SaveError> {
        let vcpu = saved_vcpu(owner, HVM_SAVE_CPU, instance)?;
        ctx.save_entry(instance, &CpuRecord::from_vcpu(vcpu))
    }

    fn load(&self, owner: &mut Domain, instance: u16, ctx: &mut HvmDomainContext) -> Result<(), SaveError> {
        let (found, record) = ctx.load_entry::<CpuRecord>()?;
        check_instance(HVM_SAVE_CPU, instance, found)?;

        let vcpu = owner
            .vcpus
            .get_mut(instance as usize)
            .ok_or(SaveError::NoSuchInstance { typecode: HVM_SAVE_CPU, instance })?;
        record.apply(vcpu);
        Ok(())
    }
}

struct NestedVmxHandler;

impl StateHandler<Domain> for NestedVmxHandler {
    /// A vCPU outside VMX operation emits no record.
    fn save(&self, owner: &Domain, instance: u16, ctx: &mut HvmDomainContext) -> Result<(), SaveError> {
        let saved = saved_vcpu(owner, HVM_SAVE_NESTED_VMX, instance)?.nested.saved_state();
        if NestedVmxRecord::is_default(&saved) {
            return Ok(());
        }

        ctx.save_entry(instance, &NestedVmxRecord::from_saved(&saved))
    }

    fn load(&self, owner: &mut Domain, instance: u16, ctx: &mut HvmDomainContext) -> Result<(), SaveError> {
        let (found, record) = ctx.load_entry::<NestedVmxRecord>()?;
        check_instance(HVM_SAVE_NESTED_VMX, instance, found)?;
        let saved = record.to_saved()?;

        let Domain { vcpus, memory, .. } = owner;
        let vcpu = vcpus
            .get_mut(instance as usize)
            .ok_or(SaveError::NoSuchInstance { typecode: HVM_SAVE_NESTED_VMX, instance })?;

        vcpu.nested.restore(&*memory, &saved).map_err(|error| {
            log::error!("vCPU {}: failed to restore nested VMX state: {}", instance, error);
            match error {
                HypervisorError::Snapshot(error) => error,
                _ => SaveError::HandlerFailed { name: "NESTED_VMX" },
            }
        })
    }
}
