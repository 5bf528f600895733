use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::{
    sanitize_vm_configs, EptFlags, GuestPhysAddr, SecureWorldMemory, Vm, VmConfig, VmHal, VmId,
    VmRef, VmType, CONFIG_MAX_VM_NUM, INVALID_VM_ID,
};

const _: () = assert!(CONFIG_MAX_VM_NUM <= u64::BITS as usize);

static EMPTY_CONFIG: VmConfig = VmConfig::EMPTY;

/// The table of VM instances, one slot per configuration record.
///
/// A slot is claimed by atomically setting its bit in the occupancy bitmap, so concurrent
/// [`VmRegistry::create_vm`] calls from different cores never bind the same identifier twice.
pub struct VmRegistry<H: VmHal> {
    configs: &'static [VmConfig],
    sanitized: AtomicBool,
    occupied: AtomicU64,
    slots: [RwLock<Option<VmRef<H>>>; CONFIG_MAX_VM_NUM],
}

impl<H: VmHal> VmRegistry<H> {
    /// A registry over the static configuration table, with every slot free.
    pub fn new(configs: &'static [VmConfig]) -> Self {
        Self {
            configs,
            sanitized: AtomicBool::new(false),
            occupied: AtomicU64::new(0),
            slots: core::array::from_fn(|_| RwLock::new(None)),
        }
    }

    /// Validate the configuration table. Must succeed before any VM is created.
    pub fn sanitize_vm_config(&self) -> AxResult {
        sanitize_vm_configs(self.configs)?;
        self.sanitized.store(true, Ordering::Release);
        Ok(())
    }

    /// The configuration record of slot `vm_id`, the empty record for unused slots.
    pub fn get_vm_config(&self, vm_id: VmId) -> &'static VmConfig {
        self.configs.get(vm_id).unwrap_or(&EMPTY_CONFIG)
    }

    /// The lowest identifier not bound to a live VM, or [`INVALID_VM_ID`].
    pub fn find_free_vm_id(&self) -> VmId {
        let occupied = self.occupied.load(Ordering::Acquire);
        (0..CONFIG_MAX_VM_NUM)
            .find(|id| occupied & (1 << id) == 0)
            .unwrap_or(INVALID_VM_ID)
    }

    /// The live VM bound to `vm_id`.
    pub fn get_vm_from_vmid(&self, vm_id: VmId) -> Option<VmRef<H>> {
        self.slots.get(vm_id)?.read().clone()
    }

    /// The Service OS VM, if it is alive.
    pub fn get_sos_vm(&self) -> Option<VmRef<H>> {
        let vm_id = self
            .configs
            .iter()
            .position(|config| config.vm_type == VmType::ServiceOs)?;
        self.get_vm_from_vmid(vm_id)
    }

    pub fn is_sos_vm(&self, vm: &Vm<H>) -> bool {
        vm.is_sos()
    }

    /// Bind the configuration of slot `vm_id` to a new VM in [`crate::VmState::Created`].
    ///
    /// Either the VM is fully built and registered, or the slot is left free.
    pub fn create_vm(&self, vm_id: VmId) -> AxResult<VmRef<H>> {
        if !self.sanitized.load(Ordering::Acquire) {
            return ax_err!(BadState, "VM configurations not sanitized");
        }
        if vm_id >= CONFIG_MAX_VM_NUM {
            return ax_err!(InvalidInput, format!("invalid VM id {}", vm_id));
        }
        let config = self.get_vm_config(vm_id);
        if !config.is_defined() {
            return ax_err!(InvalidInput, format!("VM{} is not configured", vm_id));
        }

        let bit = 1 << vm_id;
        if self.occupied.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return ax_err!(AlreadyExists, format!("VM{} already exists", vm_id));
        }
        match Vm::new(vm_id, config) {
            Ok(vm) => {
                let vm = Arc::new(vm);
                *self.slots[vm_id].write() = Some(vm.clone());
                info!("VM{} ({}) created", vm_id, config.name);
                Ok(vm)
            }
            Err(err) => {
                self.occupied.fetch_and(!bit, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn live_vm(&self, vm_id: VmId) -> AxResult<VmRef<H>> {
        match self.get_vm_from_vmid(vm_id) {
            Some(vm) => Ok(vm),
            None => ax_err!(NotFound, format!("VM{} does not exist", vm_id)),
        }
    }

    /// Create the vcpus of a created VM and load its guest image.
    pub fn prepare_vm(&self, vm_id: VmId) -> AxResult {
        self.live_vm(vm_id)?.prepare()
    }

    pub fn start_vm(&self, vm_id: VmId) -> AxResult {
        self.live_vm(vm_id)?.start()
    }

    pub fn pause_vm(&self, vm_id: VmId) -> AxResult {
        self.live_vm(vm_id)?.pause()
    }

    pub fn resume_vm(&self, vm_id: VmId) -> AxResult {
        self.live_vm(vm_id)?.resume()
    }

    pub fn resume_vm_from_s3(&self, vm_id: VmId, wakeup_vec: u32) -> AxResult {
        self.live_vm(vm_id)?.resume_from_s3(wakeup_vec)
    }

    /// Bring a paused VM back to [`crate::VmState::Created`].
    pub fn reset_vm(&self, vm_id: VmId) -> AxResult {
        let vm = self.live_vm(vm_id)?;
        if let Some(memory) = vm.reset()? {
            self.sos_restore_secure_memory(vm_id, memory);
        }
        Ok(())
    }

    /// Release every resource of a VM and free its slot.
    pub fn shutdown_vm(&self, vm_id: VmId) -> AxResult {
        let vm = self.live_vm(vm_id)?;
        let freed = vm.shutdown()?;
        if let Some(memory) = freed {
            self.sos_restore_secure_memory(vm_id, memory);
        }
        *self.slots[vm_id].write() = None;
        self.occupied.fetch_and(!(1 << vm_id), Ordering::AcqRel);
        Ok(())
    }

    /// Build the secure world of `vm_id` out of `[gpa_orig, gpa_orig + size)`.
    ///
    /// The memory also disappears from the identity view of the Service OS.
    pub fn create_secure_world(&self, vm_id: VmId, gpa_orig: GuestPhysAddr, size: usize) -> AxResult {
        let vm = self.live_vm(vm_id)?;
        let memory = vm.create_secure_world(gpa_orig, size)?;
        if let Some(sos) = self.get_sos_vm().filter(|sos| sos.id() != vm_id) {
            let gpa = GuestPhysAddr::from_usize(memory.base_hpa.as_usize());
            if sos.translate(gpa).is_some_and(|(hpa, _)| hpa == memory.base_hpa) {
                sos.ept_unmap(gpa, memory.length)?;
            }
        }
        Ok(())
    }

    /// Drop the secure world of `vm_id`, giving its memory back to both normal worlds.
    pub fn destroy_secure_world(&self, vm_id: VmId, clear: bool) -> AxResult {
        let vm = self.live_vm(vm_id)?;
        if let Some(memory) = vm.destroy_secure_world(clear)? {
            self.sos_restore_secure_memory(vm_id, memory);
        }
        Ok(())
    }

    fn sos_restore_secure_memory(&self, vm_id: VmId, memory: SecureWorldMemory) {
        let Some(sos) = self.get_sos_vm().filter(|sos| sos.id() != vm_id) else {
            return;
        };
        let covered = sos.config().memory_range().is_some_and(|range| {
            range.start <= memory.base_hpa && memory.base_hpa + memory.length <= range.end
        });
        if covered {
            let gpa = GuestPhysAddr::from_usize(memory.base_hpa.as_usize());
            if let Err(err) = sos.ept_map(gpa, memory.base_hpa, memory.length, EptFlags::RWX_WB) {
                warn!("SOS VM{} cannot remap secure memory: {:?}", sos.id(), err);
            }
        }
    }

    /// Create, prepare and start every hypervisor-launched VM whose BSP runs on `pcpu_id`.
    ///
    /// Called once per physical CPU at boot. A failure is fatal to the platform. A VM built by
    /// this call is shut down before the error is returned, a VM already bound to the slot is
    /// left alone.
    pub fn launch_vms(&self, pcpu_id: usize) -> AxResult {
        for (vm_id, config) in self.configs.iter().enumerate() {
            if !matches!(config.vm_type, VmType::PreLaunched | VmType::ServiceOs)
                || config.bsp_pcpu_id() != Some(pcpu_id)
            {
                continue;
            }
            info!("Launching VM{} ({}) on pCPU{}", vm_id, config.name, pcpu_id);
            let vm = self.create_vm(vm_id).inspect_err(|err| {
                error!("Failed to create VM{}: {:?}", vm_id, err);
            })?;
            if let Err(err) = vm.prepare().and_then(|_| vm.start()) {
                error!("Failed to launch VM{}: {:?}", vm_id, err);
                if let Err(err) = self.shutdown_vm(vm_id) {
                    warn!("VM{} cleanup failed: {:?}", vm_id, err);
                }
                return Err(err);
            }
        }
        Ok(())
    }
}
