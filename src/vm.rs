use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};

use axerrno::{ax_err, AxResult};
use memory_addr::MemoryAddr;
use spin::{Mutex, RwLock};

use crate::address_space::VmAddressSpace;
use crate::e820::lowmem_top;
use crate::{
    CpuidTable, E820Entry, E820Type, EptFlags, GuestFlags, GuestPhysAddr, HostPhysAddr,
    HostPmData, HostVirtAddr, IoBitmap, IommuDomain, MmioRegion, MsrBitmap, MsrIntercept,
    SecureWorldControl, SecureWorldMemory, SoftirqDevEntry, VCpu, VCpuRef, VCpuSet, VCpuState,
    VIoapic, VPci, VPicWireMode, VUart, VmConfig, VmHal, VmId, VmType, World,
    CONFIG_MAX_EMULATED_MMIO_REGIONS,
};
#[cfg(feature = "partition")]
use crate::PartitionInfo;

/// Where the kernel of a hypervisor-launched VM is loaded.
const DEFAULT_KERNEL_LOAD_GPA: usize = 0x100_0000;
/// Offset of the 64-bit entry point inside a bzImage payload.
const KERNEL_ENTRY_OFFSET: usize = 0x200;
/// Where the boot parameters (zero page) of a hypervisor-launched VM are placed.
const BOOT_PARAMS_GPA: usize = 0x1_0000;
/// Where the kernel command line of a hypervisor-launched VM is placed.
const BOOTARGS_LOAD_GPA: usize = 0x2_0000;

const MSR_IA32_TSC_ADJUST: u32 = 0x3b;
const MSR_IA32_BIOS_UPDT_TRIG: u32 = 0x79;
const MSR_IA32_MTRR_CAP: u32 = 0xfe;
const MSR_IA32_VMX_BASIC: u32 = 0x480;
const MSR_IA32_VMX_VMFUNC: u32 = 0x491;
const MSR_IA32_MTRR_PHYSBASE_0: u32 = 0x200;
const MSR_IA32_MTRR_PHYSMASK_9: u32 = 0x213;
const MSR_IA32_MTRR_FIX64K_00000: u32 = 0x250;
const MSR_IA32_MTRR_FIX16K_80000: u32 = 0x258;
const MSR_IA32_MTRR_FIX16K_A0000: u32 = 0x259;
const MSR_IA32_MTRR_FIX4K_C0000: u32 = 0x268;
const MSR_IA32_MTRR_FIX4K_F8000: u32 = 0x26f;
const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
const MSR_IA32_TSC_DEADLINE: u32 = 0x6e0;
const MSR_X2APIC_FIRST: u32 = 0x800;
const MSR_X2APIC_LAST: u32 = 0x8ff;

/// The state of a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    /// Not created, or shut down.
    Unknown = 0,
    /// Created, possibly prepared, not running.
    Created = 1,
    /// Running.
    Started = 2,
    /// Paused, can be resumed or reset.
    Paused = 3,
}

/// Kind of guest kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GuestKernelType {
    /// A single-image OS.
    Mono = 1,
    /// A Linux kernel booted through the 64-bit boot protocol.
    #[default]
    Linux = 2,
}

/// Kernel image information, common to all guest types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelInfo {
    /// Host address of the image to copy, `None` until the image is known.
    pub src_hva: Option<HostVirtAddr>,
    /// Where the image is copied in the guest.
    pub load_gpa: GuestPhysAddr,
    /// Where the BSP starts executing.
    pub entry_gpa: GuestPhysAddr,
    /// Size of the image in bytes.
    pub size: usize,
}

/// Linux boot artifacts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinuxInfo {
    /// Host address of the initial ramdisk, if any.
    pub ramdisk_src_hva: Option<HostVirtAddr>,
    /// Where the ramdisk is copied in the guest.
    pub ramdisk_load_gpa: GuestPhysAddr,
    /// Size of the ramdisk in bytes.
    pub ramdisk_size: usize,
    /// Host address of the kernel command line.
    pub bootargs_src_hva: Option<HostVirtAddr>,
    /// Where the command line is copied in the guest.
    pub bootargs_load_gpa: GuestPhysAddr,
    /// Size of the command line, terminating NUL included.
    pub bootargs_size: usize,
}

/// Software information of a VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmSwInfo {
    /// How the kernel is booted.
    pub kernel_type: GuestKernelType,
    /// The kernel image.
    pub kernel_info: KernelInfo,
    /// Linux boot artifacts, unused for [`GuestKernelType::Mono`].
    pub linux_info: LinuxInfo,
    /// Host address of the page shared with the device model for I/O requests.
    pub io_shared_page: Option<HostVirtAddr>,
    /// I/O requests are completed by polling instead of notification.
    pub is_completion_polling: bool,
}

impl VmSwInfo {
    fn for_config(config: &VmConfig) -> Self {
        let mut sw = Self {
            is_completion_polling: config
                .guest_flags
                .contains(GuestFlags::IO_COMPLETION_POLLING),
            ..Self::default()
        };
        if matches!(config.vm_type, VmType::PreLaunched | VmType::ServiceOs) {
            let load_gpa = GuestPhysAddr::from_usize(DEFAULT_KERNEL_LOAD_GPA);
            sw.kernel_info.load_gpa = load_gpa;
            sw.kernel_info.entry_gpa = load_gpa + KERNEL_ENTRY_OFFSET;

            let bootargs = config.os_config.bootargs;
            sw.linux_info.bootargs_src_hva = Some(HostVirtAddr::from_usize(bootargs.as_ptr() as usize));
            sw.linux_info.bootargs_load_gpa = GuestPhysAddr::from_usize(BOOTARGS_LOAD_GPA);
            // terminating NUL
            sw.linux_info.bootargs_size = bootargs.len() + 1;
        }
        sw
    }
}

/// Power-management information of a VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmPmInfo {
    /// Number of P-states exposed to the guest.
    pub px_cnt: u8,
    /// Number of C-states exposed to the guest.
    pub cx_cnt: u8,
    /// Host data describing the sleep states, Service OS only.
    pub sx_state_data: Option<HostPhysAddr>,
}

impl From<HostPmData> for VmPmInfo {
    fn from(data: HostPmData) -> Self {
        Self {
            px_cnt: data.px_cnt,
            cx_cnt: data.cx_cnt,
            sx_state_data: data.sx_state_data,
        }
    }
}

/// The hardware-visible interception bitmaps, boxed once and never moved.
struct VmBitmaps {
    io: Box<IoBitmap>,
    msr: Box<MsrBitmap>,
}

/// The virtual hardware of a VM.
struct VmHwInfo {
    vcpus: VCpuSet,
    /// Top of the guest RAM below 4G.
    gpa_lowtop: u64,
}

/// The mutable part of [`Vm`] guarded by the state lock.
struct VmInnerMut {
    state: VmState,
    sw: VmSwInfo,
    pm: VmPmInfo,
    e820: Vec<E820Entry>,
    wire_mode: VPicWireMode,
    vuart: VUart,
    vioapic: VIoapic,
    vpci: VPci,
    mmio_regions: Vec<MmioRegion>,
    iommu: Option<IommuDomain>,
    #[cfg(feature = "partition")]
    partition: Option<PartitionInfo>,
}

/// A VM instance.
///
/// Lock order: state lock, then vcpus, then address space. The state lock is never held
/// across an EPT update.
pub struct Vm<H: VmHal> {
    id: VmId,
    config: &'static VmConfig,
    cpuid: CpuidTable,
    bitmaps: Mutex<VmBitmaps>,
    inner_mut: Mutex<VmInnerMut>,
    hw: RwLock<VmHwInfo>,
    /// `None` once the VM is shut down.
    address_space: Mutex<Option<VmAddressSpace<H>>>,
    /// Present only when the secure world is enabled in the configuration.
    sworld: Option<Mutex<SecureWorldControl>>,
    softirq_devs: Mutex<VecDeque<SoftirqDevEntry>>,
}

/// A reference to a VM.
pub type VmRef<H> = Arc<Vm<H>>;

impl<H: VmHal> Vm<H> {
    /// Build a VM in [`VmState::Created`] from its configuration.
    ///
    /// The IOMMU domain is created last, so a failure never leaks it.
    pub(crate) fn new(id: VmId, config: &'static VmConfig) -> AxResult<Self> {
        let mut address_space = VmAddressSpace::new();
        let mut e820 = Vec::new();
        let mem = config.memory;
        let io = match config.vm_type {
            VmType::PreLaunched => {
                if mem.size != 0 {
                    address_space.map_normal(
                        GuestPhysAddr::from_usize(0),
                        mem.start_hpa,
                        mem.size,
                        EptFlags::RWX_WB,
                    )?;
                    e820.push(E820Entry::new(0, mem.size as u64, E820Type::Ram));
                }
                IoBitmap::new_trap_all()
            }
            VmType::ServiceOs => {
                if mem.size != 0 {
                    address_space.map_normal(
                        GuestPhysAddr::from_usize(mem.start_hpa.as_usize()),
                        mem.start_hpa,
                        mem.size,
                        EptFlags::RWX_WB,
                    )?;
                    e820.push(E820Entry::new(
                        mem.start_hpa.as_usize() as u64,
                        mem.size as u64,
                        E820Type::Ram,
                    ));
                }
                IoBitmap::new_passthrough()
            }
            VmType::Normal => IoBitmap::new_trap_all(),
            VmType::Undefined => {
                return ax_err!(InvalidInput, format!("VM{}: undefined configuration", id))
            }
        };
        debug!("VM{} EPT root {:?}", id, address_space.nworld().root_paddr());

        let cpuid = CpuidTable::from_host::<H>()?;
        let pm = if config.vm_type == VmType::ServiceOs {
            H::host_pm_data().map(VmPmInfo::from).unwrap_or_default()
        } else {
            VmPmInfo::default()
        };
        let iommu = H::create_iommu_domain(id, address_space.nworld().eptp())?;

        Ok(Self {
            id,
            config,
            cpuid,
            bitmaps: Mutex::new(VmBitmaps {
                io,
                msr: Self::init_msr_bitmap(config),
            }),
            inner_mut: Mutex::new(VmInnerMut {
                state: VmState::Created,
                sw: VmSwInfo::default(),
                pm,
                e820,
                wire_mode: VPicWireMode::default(),
                vuart: VUart::new(config.vuart),
                vioapic: VIoapic::new(),
                vpci: VPci::with_ptdevs(config.pci_ptdevs),
                mmio_regions: Vec::with_capacity(CONFIG_MAX_EMULATED_MMIO_REGIONS),
                iommu: Some(iommu),
                #[cfg(feature = "partition")]
                partition: None,
            }),
            hw: RwLock::new(VmHwInfo {
                vcpus: VCpuSet::new(),
                gpa_lowtop: 0,
            }),
            address_space: Mutex::new(Some(address_space)),
            sworld: config
                .secure_world_enabled()
                .then(|| Mutex::new(SecureWorldControl::new())),
            softirq_devs: Mutex::new(VecDeque::new()),
        })
    }

    fn init_msr_bitmap(config: &VmConfig) -> Box<MsrBitmap> {
        let mut msr = MsrBitmap::new();
        msr.set(MSR_IA32_TSC_DEADLINE, MsrIntercept::ReadWrite);
        msr.set(MSR_IA32_TSC_ADJUST, MsrIntercept::ReadWrite);
        msr.set(MSR_IA32_BIOS_UPDT_TRIG, MsrIntercept::Write);
        msr.set_range(MSR_IA32_VMX_BASIC, MSR_IA32_VMX_VMFUNC, MsrIntercept::ReadWrite);

        msr.set(MSR_IA32_MTRR_CAP, MsrIntercept::ReadWrite);
        msr.set_range(
            MSR_IA32_MTRR_PHYSBASE_0,
            MSR_IA32_MTRR_PHYSMASK_9,
            MsrIntercept::ReadWrite,
        );
        msr.set(MSR_IA32_MTRR_FIX64K_00000, MsrIntercept::ReadWrite);
        msr.set(MSR_IA32_MTRR_FIX16K_80000, MsrIntercept::ReadWrite);
        msr.set(MSR_IA32_MTRR_FIX16K_A0000, MsrIntercept::ReadWrite);
        msr.set_range(
            MSR_IA32_MTRR_FIX4K_C0000,
            MSR_IA32_MTRR_FIX4K_F8000,
            MsrIntercept::ReadWrite,
        );
        msr.set(MSR_IA32_MTRR_DEF_TYPE, MsrIntercept::ReadWrite);

        if !config.lapic_passthrough() {
            msr.set_range(MSR_X2APIC_FIRST, MSR_X2APIC_LAST, MsrIntercept::ReadWrite);
        }
        msr
    }

    /// Get the id of the VM.
    pub const fn id(&self) -> VmId {
        self.id
    }

    /// Get the configuration the VM was created from.
    pub const fn config(&self) -> &'static VmConfig {
        self.config
    }

    /// Get the GUID of the VM.
    pub const fn guid(&self) -> [u8; 16] {
        self.config.guid
    }

    /// Whether this is the Service OS VM.
    pub fn is_sos(&self) -> bool {
        self.config.vm_type == VmType::ServiceOs
    }

    /// Get the state of the VM.
    pub fn state(&self) -> VmState {
        self.inner_mut.lock().state
    }

    /// The virtual CPUID table.
    pub fn cpuid(&self) -> &CpuidTable {
        &self.cpuid
    }

    /// Number of vcpus created by [`crate::VmRegistry::prepare_vm`].
    pub fn vcpu_count(&self) -> usize {
        self.hw.read().vcpus.len()
    }

    /// All vcpus in creation order.
    pub fn vcpus(&self) -> Vec<VCpuRef> {
        self.hw.read().vcpus.iter().cloned().collect()
    }

    /// The vcpu with the given virtual id.
    pub fn vcpu_from_vid(&self, vcpu_id: usize) -> Option<VCpuRef> {
        self.hw.read().vcpus.vcpu_from_vid(vcpu_id).cloned()
    }

    /// The vcpu pinned to the given physical CPU.
    pub fn vcpu_from_pid(&self, pcpu_id: usize) -> Option<VCpuRef> {
        self.hw.read().vcpus.vcpu_from_pid(pcpu_id).cloned()
    }

    /// The BSP of the VM.
    pub fn get_primary_vcpu(&self) -> Option<VCpuRef> {
        self.hw.read().vcpus.get_primary_vcpu().cloned()
    }

    /// Top of the guest RAM below 4G.
    pub fn gpa_lowtop(&self) -> u64 {
        self.hw.read().gpa_lowtop
    }

    /// The guest physical memory map.
    pub fn e820(&self) -> Vec<E820Entry> {
        self.inner_mut.lock().e820.clone()
    }

    /// A copy of the software information.
    pub fn sw_info(&self) -> VmSwInfo {
        self.inner_mut.lock().sw
    }

    /// Modify the software information, e.g. to record the I/O shared page.
    pub fn with_sw_info_mut<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut VmSwInfo) -> T,
    {
        f(&mut self.inner_mut.lock().sw)
    }

    /// Power-management information exposed to the guest.
    pub fn pm_info(&self) -> VmPmInfo {
        self.inner_mut.lock().pm
    }

    /// Where the virtual PIC output is wired.
    pub fn wire_mode(&self) -> VPicWireMode {
        self.inner_mut.lock().wire_mode
    }

    /// Rewire the virtual PIC output.
    pub fn set_wire_mode(&self, mode: VPicWireMode) {
        self.inner_mut.lock().wire_mode = mode;
    }

    /// The virtual UART slot.
    pub fn vuart(&self) -> VUart {
        self.inner_mut.lock().vuart
    }

    /// Access the virtual IOAPIC slot.
    pub fn with_vioapic<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut VIoapic) -> T,
    {
        f(&mut self.inner_mut.lock().vioapic)
    }

    /// Access the virtual PCI slot.
    pub fn with_vpci<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut VPci) -> T,
    {
        f(&mut self.inner_mut.lock().vpci)
    }

    /// The IOMMU domain, `None` once released.
    pub fn iommu_domain(&self) -> Option<IommuDomain> {
        self.inner_mut.lock().iommu
    }

    /// The static tables built for a pre-launched VM in partition mode.
    #[cfg(feature = "partition")]
    pub fn partition_info(&self) -> Option<PartitionInfo> {
        self.inner_mut.lock().partition.clone()
    }

    /// Physical addresses of I/O bitmaps A and B.
    pub fn io_bitmap_paddrs(&self) -> (HostPhysAddr, HostPhysAddr) {
        self.bitmaps.lock().io.paddrs::<H>()
    }

    /// Physical address of the MSR bitmap.
    pub fn msr_bitmap_paddr(&self) -> HostPhysAddr {
        self.bitmaps.lock().msr.paddr::<H>()
    }

    /// Trap or pass through `count` ports starting at `port`.
    pub fn set_io_intercept(&self, port: u16, count: u32, intercept: bool) {
        let mut bitmaps = self.bitmaps.lock();
        if intercept {
            bitmaps.io.intercept(port, count);
        } else {
            bitmaps.io.allow(port, count);
        }
    }

    /// Whether accesses to `port` exit to the hypervisor.
    pub fn is_io_intercepted(&self, port: u16) -> bool {
        self.bitmaps.lock().io.is_intercepted(port)
    }

    /// Set how `msr` is trapped.
    pub fn set_msr_intercept(&self, msr: u32, mode: MsrIntercept) {
        self.bitmaps.lock().msr.set(msr, mode);
    }

    /// How `msr` is trapped.
    pub fn msr_intercept(&self, msr: u32) -> MsrIntercept {
        self.bitmaps.lock().msr.get(msr)
    }

    fn with_address_space<F, T>(&self, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut VmAddressSpace<H>) -> AxResult<T>,
    {
        match self.address_space.lock().as_mut() {
            Some(aspace) => f(aspace),
            None => ax_err!(BadState, format!("VM{} address space released", self.id)),
        }
    }

    /// Map guest memory in the normal world.
    pub fn ept_map(
        &self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: usize,
        flags: EptFlags,
    ) -> AxResult {
        self.with_address_space(|aspace| aspace.map_normal(gpa, hpa, size, flags))
    }

    /// Unmap guest memory from the normal world.
    pub fn ept_unmap(&self, gpa: GuestPhysAddr, size: usize) -> AxResult {
        self.with_address_space(|aspace| aspace.unmap_normal(gpa, size))
    }

    /// Translate a normal-world guest physical address.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, EptFlags)> {
        self.address_space.lock().as_ref()?.nworld().translate(gpa)
    }

    /// Translate a secure-world guest physical address.
    pub fn translate_secure(&self, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, EptFlags)> {
        self.address_space.lock().as_ref()?.sworld()?.translate(gpa)
    }

    /// The EPT pointer `vcpu` must run with, depending on its world.
    pub fn vcpu_eptp(&self, vcpu: &VCpu) -> Option<u64> {
        let aspace = self.address_space.lock();
        let aspace = aspace.as_ref()?;
        match vcpu.world() {
            World::Normal => Some(aspace.nworld().eptp()),
            World::Secure => aspace.sworld().map(|ept| ept.eptp()),
        }
    }

    /// Register an emulated MMIO range `[start, end)`.
    ///
    /// The range is removed from the identity view of the Service OS so every access exits.
    pub fn register_mmio_region(
        &self,
        start: GuestPhysAddr,
        end: GuestPhysAddr,
        handler_data: usize,
    ) -> AxResult {
        if start >= end {
            return ax_err!(InvalidInput, "empty MMIO region");
        }
        {
            let mut inner = self.inner_mut.lock();
            if inner.state == VmState::Unknown {
                return ax_err!(BadState, format!("VM{} is shut down", self.id));
            }
            if inner.mmio_regions.len() >= CONFIG_MAX_EMULATED_MMIO_REGIONS {
                return ax_err!(NoMemory, "too many emulated MMIO regions");
            }
            if inner.mmio_regions.iter().any(|r| r.overlaps(start, end)) {
                return ax_err!(AlreadyExists, "MMIO region overlaps a registered one");
            }
            inner.mmio_regions.push(MmioRegion {
                start,
                end,
                handler_data,
            });
        }

        if self.is_sos() {
            let (page_start, page_end) = (start.align_down_4k(), end.align_up_4k());
            if let Err(err) = self.ept_unmap(page_start, page_end.as_usize() - page_start.as_usize()) {
                self.inner_mut
                    .lock()
                    .mmio_regions
                    .retain(|r| !(r.start == start && r.end == end));
                return Err(err);
            }
        }
        debug!("VM{} MMIO region {:?}..{:?} registered", self.id, start, end);
        Ok(())
    }

    /// Remove the emulated MMIO range starting at `start`.
    pub fn unregister_mmio_region(&self, start: GuestPhysAddr) -> Option<MmioRegion> {
        let mut inner = self.inner_mut.lock();
        let index = inner.mmio_regions.iter().position(|r| r.start == start)?;
        Some(inner.mmio_regions.remove(index))
    }

    /// The emulated MMIO range containing `gpa`.
    pub fn find_mmio_region(&self, gpa: GuestPhysAddr) -> Option<MmioRegion> {
        self.inner_mut
            .lock()
            .mmio_regions
            .iter()
            .find(|r| r.contains(gpa))
            .copied()
    }

    /// Defer device work to the softirq of the VM.
    pub fn queue_softirq_dev(&self, entry: SoftirqDevEntry) {
        self.softirq_devs.lock().push_back(entry);
    }

    /// Take the oldest deferred device work.
    pub fn pop_softirq_dev(&self) -> Option<SoftirqDevEntry> {
        self.softirq_devs.lock().pop_front()
    }

    fn secure_world_control(&self) -> AxResult<&Mutex<SecureWorldControl>> {
        match &self.sworld {
            Some(control) => Ok(control),
            None => ax_err!(
                Unsupported,
                format!("VM{} has no secure world", self.id)
            ),
        }
    }

    /// Access the secure world control block.
    pub fn with_secure_world<F, T>(&self, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut SecureWorldControl) -> AxResult<T>,
    {
        f(&mut self.secure_world_control()?.lock())
    }

    /// Memory of the secure world, if it has been created.
    pub fn secure_world_memory(&self) -> Option<SecureWorldMemory> {
        self.sworld.as_ref()?.lock().memory()
    }

    /// Build the secure world out of `[gpa_orig, gpa_orig + size)` of the normal world.
    pub(crate) fn create_secure_world(
        &self,
        gpa_orig: GuestPhysAddr,
        size: usize,
    ) -> AxResult<SecureWorldMemory> {
        let control = self.secure_world_control()?;
        if self.state() == VmState::Unknown {
            return ax_err!(BadState, format!("VM{} is shut down", self.id));
        }
        let memory = self.with_address_space(|aspace| aspace.create_secure_world(gpa_orig, size))?;
        control.lock().activate(memory);
        info!("VM{} secure world created", self.id);
        Ok(memory)
    }

    /// Drop the secure world, if any, and give its memory back to the normal world.
    pub(crate) fn destroy_secure_world(&self, clear: bool) -> AxResult<Option<SecureWorldMemory>> {
        let Some(control) = &self.sworld else {
            return Ok(None);
        };
        control.lock().reset();
        let memory = self.with_address_space(|aspace| aspace.destroy_secure_world(clear))?;
        if memory.is_some() {
            info!("VM{} secure world destroyed", self.id);
        }
        Ok(memory)
    }

    /// Switch the world `vcpu` executes in.
    pub fn switch_world(&self, vcpu: &VCpu, next: World) -> AxResult {
        if vcpu.vm_id() != self.id {
            return ax_err!(InvalidInput, "vCPU belongs to another VM");
        }
        self.with_secure_world(|control| control.switch_world(vcpu, next))
    }

    fn is_hv_launched(&self) -> bool {
        matches!(self.config.vm_type, VmType::PreLaunched | VmType::ServiceOs)
    }

    /// Load the guest image of a hypervisor-launched VM. Other VMs are loaded by the device
    /// model and only get their default software information.
    fn load_software(&self) -> AxResult<VmSwInfo> {
        let mut sw = VmSwInfo::for_config(self.config);
        if self.is_hv_launched() {
            H::load_guest_image(self.id, self.config, &mut sw)?;
        }
        Ok(sw)
    }

    fn set_boot_entry(&self, bsp: &VCpu, sw: &VmSwInfo) {
        if self.is_hv_launched() {
            bsp.with_context_mut(World::Normal, |ctx| {
                ctx.set_long_mode_entry(sw.kernel_info.entry_gpa.as_usize() as u64, BOOT_PARAMS_GPA as u64)
            });
        }
    }

    /// Create the vcpus, load the guest image and set the BSP entry.
    ///
    /// Nothing is committed unless every step succeeds.
    pub(crate) fn prepare(&self) -> AxResult {
        if self.state() != VmState::Created {
            return ax_err!(BadState, format!("VM{} is not created", self.id));
        }
        if !self.hw.read().vcpus.is_empty() {
            return ax_err!(BadState, format!("VM{} is already prepared", self.id));
        }

        let mut vcpus = VCpuSet::new();
        for (vcpu_id, pcpu_id) in self.config.pcpus().enumerate() {
            vcpus.push(Arc::new(VCpu::new(self.id, vcpu_id, pcpu_id, vcpu_id == 0)))?;
        }
        let Some(bsp) = vcpus.get_primary_vcpu().cloned() else {
            return ax_err!(InvalidInput, format!("VM{} has no pcpu assigned", self.id));
        };

        #[cfg(feature = "partition")]
        let partition = match self.config.vm_type {
            VmType::PreLaunched => Some(PartitionInfo::build(self.id, self.config)?),
            _ => None,
        };

        let sw = self.load_software()?;
        self.set_boot_entry(&bsp, &sw);

        let mut inner = self.inner_mut.lock();
        let mut hw = self.hw.write();
        if inner.state != VmState::Created || !hw.vcpus.is_empty() {
            return ax_err!(BadState, format!("VM{} changed while being prepared", self.id));
        }
        #[cfg(feature = "partition")]
        if let Some(info) = partition {
            inner.e820 = info.ve820.to_vec();
            inner.vpci.set_vdevs(info.vdevs.clone());
            self.bitmaps
                .lock()
                .io
                .intercept(crate::partition::RTC_PORT, crate::partition::RTC_PORT_COUNT);
            inner.partition = Some(info);
        }
        inner.sw = sw;
        hw.gpa_lowtop = lowmem_top(&inner.e820);
        hw.vcpus = vcpus;
        info!("VM{} prepared with {} vCPUs", self.id, hw.vcpus.len());
        Ok(())
    }

    /// `Created -> Started`: launch the BSP.
    pub fn start(&self) -> AxResult {
        let mut inner = self.inner_mut.lock();
        if inner.state != VmState::Created {
            return ax_err!(
                BadState,
                format!("VM{} cannot start from {:?}", self.id, inner.state)
            );
        }
        let hw = self.hw.read();
        let Some(bsp) = hw.vcpus.get_primary_vcpu() else {
            return ax_err!(BadState, format!("VM{} is not prepared", self.id));
        };
        bsp.with_state_transition(&[VCpuState::Init], VCpuState::Running, || {
            H::launch_vcpu(self.id, bsp.id(), bsp.pcpu_id())
        })?;
        inner.state = VmState::Started;
        info!("VM{} started", self.id);
        Ok(())
    }

    /// `Started -> Paused`. Pausing a paused VM does nothing.
    pub fn pause(&self) -> AxResult {
        let mut inner = self.inner_mut.lock();
        match inner.state {
            VmState::Paused => Ok(()),
            VmState::Started => {
                for vcpu in self.hw.read().vcpus.iter() {
                    if vcpu.state() == VCpuState::Running {
                        vcpu.with_state_transition(&[VCpuState::Running], VCpuState::Paused, || {
                            H::pause_vcpu(self.id, vcpu.id(), vcpu.pcpu_id());
                            Ok(())
                        })?;
                    }
                }
                inner.state = VmState::Paused;
                info!("VM{} paused", self.id);
                Ok(())
            }
            state => ax_err!(BadState, format!("VM{} cannot pause from {:?}", self.id, state)),
        }
    }

    /// `Paused -> Started`. Resuming a running VM does nothing.
    pub fn resume(&self) -> AxResult {
        let mut inner = self.inner_mut.lock();
        match inner.state {
            VmState::Started => Ok(()),
            VmState::Paused => {
                for vcpu in self.hw.read().vcpus.iter() {
                    if vcpu.state() == VCpuState::Paused {
                        vcpu.with_state_transition(&[VCpuState::Paused], VCpuState::Running, || {
                            H::resume_vcpu(self.id, vcpu.id(), vcpu.pcpu_id());
                            Ok(())
                        })?;
                    }
                }
                inner.state = VmState::Started;
                info!("VM{} resumed", self.id);
                Ok(())
            }
            state => ax_err!(BadState, format!("VM{} cannot resume from {:?}", self.id, state)),
        }
    }

    /// Resume a VM paused for S3: the BSP restarts in real mode at `wakeup_vec`, the APs wait
    /// for INIT-SIPI.
    pub fn resume_from_s3(&self, wakeup_vec: u32) -> AxResult {
        let mut inner = self.inner_mut.lock();
        if inner.state != VmState::Paused {
            return ax_err!(
                BadState,
                format!("VM{} cannot wake up from {:?}", self.id, inner.state)
            );
        }
        let hw = self.hw.read();
        let Some(bsp) = hw.vcpus.get_primary_vcpu() else {
            return ax_err!(BadState, format!("VM{} has no BSP", self.id));
        };
        for vcpu in hw.vcpus.iter() {
            vcpu.reset();
        }
        bsp.with_context_mut(World::Normal, |ctx| ctx.set_real_mode_entry(wakeup_vec));
        bsp.with_state_transition(&[VCpuState::Init], VCpuState::Running, || {
            H::launch_vcpu(self.id, bsp.id(), bsp.pcpu_id())
        })?;
        inner.state = VmState::Started;
        info!("VM{} resumed from S3 at {:#x}", self.id, wakeup_vec);
        Ok(())
    }

    /// `Paused -> Created`, discarding vcpu and device state.
    ///
    /// A hypervisor-launched VM gets its guest image reloaded and its BSP pointed at the kernel
    /// entry again. Returns the memory of the secure world if one was dropped.
    pub(crate) fn reset(&self) -> AxResult<Option<SecureWorldMemory>> {
        {
            let mut inner = self.inner_mut.lock();
            if inner.state != VmState::Paused {
                return ax_err!(
                    BadState,
                    format!("VM{} cannot reset from {:?}", self.id, inner.state)
                );
            }
            let reloaded = if self.is_hv_launched() {
                Some(self.load_software()?)
            } else {
                None
            };
            let hw = self.hw.read();
            for vcpu in hw.vcpus.iter() {
                vcpu.reset();
            }
            if let Some(sw) = reloaded {
                if let Some(bsp) = hw.vcpus.get_primary_vcpu() {
                    self.set_boot_entry(bsp, &sw);
                }
                inner.sw = sw;
            }
            drop(hw);
            inner.wire_mode = VPicWireMode::default();
            inner.vuart = VUart::new(self.config.vuart);
            inner.vioapic.reset();
            inner.state = VmState::Created;
        }
        self.softirq_devs.lock().clear();
        let freed = self.destroy_secure_world(false)?;
        info!("VM{} reset", self.id);
        Ok(freed)
    }

    fn offline_vcpu(&self, vcpu: &VCpu) -> AxResult {
        let was_running = vcpu.state() == VCpuState::Running;
        vcpu.with_state_transition(
            &[
                VCpuState::Init,
                VCpuState::Running,
                VCpuState::Paused,
                VCpuState::Zombie,
            ],
            VCpuState::Zombie,
            || {
                if was_running {
                    H::pause_vcpu(self.id, vcpu.id(), vcpu.pcpu_id());
                }
                Ok(())
            },
        )?;
        vcpu.with_state_transition(&[VCpuState::Zombie], VCpuState::Offline, || {
            H::offline_vcpu(self.id, vcpu.id(), vcpu.pcpu_id());
            Ok(())
        })
    }

    /// Release every resource of the VM and move it to [`VmState::Unknown`].
    ///
    /// Returns the memory of the secure world if one was dropped.
    pub(crate) fn shutdown(&self) -> AxResult<Option<SecureWorldMemory>> {
        {
            let mut inner = self.inner_mut.lock();
            if inner.state == VmState::Unknown {
                return ax_err!(BadState, format!("VM{} is not alive", self.id));
            }
            inner.state = VmState::Unknown;
        }

        let vcpus = self.hw.write().vcpus.take_all();
        for vcpu in &vcpus {
            if let Err(err) = self.offline_vcpu(vcpu) {
                warn!("VM{} vCPU{} offline failed: {:?}", self.id, vcpu.id(), err);
            }
        }

        let freed = match self.destroy_secure_world(true) {
            Ok(freed) => freed,
            Err(err) => {
                warn!("VM{} secure world teardown failed: {:?}", self.id, err);
                None
            }
        };
        self.address_space.lock().take();

        let iommu = {
            let mut inner = self.inner_mut.lock();
            inner.vpci.cleanup();
            inner.mmio_regions.clear();
            inner.e820.clear();
            #[cfg(feature = "partition")]
            {
                inner.partition = None;
            }
            inner.iommu.take()
        };
        if let Some(domain) = iommu {
            H::destroy_iommu_domain(domain);
        }
        self.softirq_devs.lock().clear();
        info!("VM{} shut down", self.id);
        Ok(freed)
    }
}

impl<H: VmHal> Drop for Vm<H> {
    fn drop(&mut self) {
        if let Some(domain) = self.inner_mut.get_mut().iommu.take() {
            H::destroy_iommu_domain(domain);
        }
    }
}
