//! The static VM configuration table.
//!
//! One [`VmConfig`] record exists per possible VM slot. The table is produced by the board
//! description before the hypervisor brings up any VM, validated once by
//! [`sanitize_vm_configs`] and never mutated afterwards.

use core::fmt;

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;
use memory_addr::{AddrRange, MemoryAddr};

use crate::HostPhysAddr;

/// Maximum number of VMs, i.e. the size of the configuration table and the VM registry.
pub const CONFIG_MAX_VM_NUM: usize = 8;
/// Maximum number of vcpus of a single VM.
pub const CONFIG_MAX_VCPUS_PER_VM: usize = 8;
/// Maximum number of physical CPUs on the platform.
pub const CONFIG_MAX_PCPU_NUM: usize = 64;
/// Maximum number of emulated MMIO regions of a single VM.
pub const CONFIG_MAX_EMULATED_MMIO_REGIONS: usize = 16;
/// Maximum length of the boot arguments of a VM.
pub const MAX_BOOTARGS_SIZE: usize = 1024;
/// Maximum length of a VM or OS name.
pub const MAX_CONFIG_NAME_SIZE: usize = 32;

/// The type of a VM.
///
/// - `PreLaunched` VMs are launched by the hypervisor with dedicated physical CPUs and LAPIC
///   passthrough.
/// - The `ServiceOs` VM is launched by the hypervisor and emulates devices for other VMs.
/// - `Normal` VMs are post-launched by the device model running in the Service OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VmType {
    /// The slot is not in use.
    #[default]
    Undefined = 0,
    /// Launched by the hypervisor at boot.
    PreLaunched = 1,
    /// The privileged Service OS.
    ServiceOs = 2,
    /// Post-launched by the device model.
    Normal = 3,
}

bitflags! {
    /// Guest feature flags of a VM configuration.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GuestFlags: u64 {
        /// The VM owns an isolated secure world.
        const SECURE_WORLD_ENABLED = 1 << 0;
        /// The local APIC is passed through to the guest.
        const LAPIC_PASSTHROUGH = 1 << 1;
        /// I/O requests are completed by polling instead of notification.
        const IO_COMPLETION_POLLING = 1 << 2;
    }
}

/// A PCI bus/device/function triple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PciBdf {
    /// Bus number.
    pub bus: u8,
    /// Device number, must be below 32.
    pub dev: u8,
    /// Function number, must be below 8.
    pub func: u8,
}

impl PciBdf {
    /// Create a new BDF.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Self {
        Self { bus, dev, func }
    }

    /// Whether the device and function numbers are in range.
    pub const fn is_well_formed(&self) -> bool {
        self.dev < 32 && self.func < 8
    }

    /// The 16-bit encoding `bus[15:8] dev[7:3] func[2:0]`.
    pub const fn value(&self) -> u16 {
        ((self.bus as u16) << 8) | (((self.dev & 0x1f) as u16) << 3) | ((self.func & 0x7) as u16)
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.dev, self.func)
    }
}

/// Memory of a VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmMemConfig {
    /// Start host physical address, meaningful for hypervisor-launched VMs only.
    pub start_hpa: HostPhysAddr,
    /// Size of the VM memory in bytes.
    pub size: usize,
}

/// A passthrough PCI device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PciPtDevConfig {
    /// BDF seen by the guest.
    pub vbdf: PciBdf,
    /// BDF of the physical device.
    pub pbdf: PciBdf,
}

/// OS information of a VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmOsConfig {
    /// OS name, only used for debugging.
    pub name: &'static str,
    /// Kernel command line.
    pub bootargs: &'static str,
}

/// The configuration of one VM slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// The type of the VM.
    pub vm_type: VmType,
    /// The name of the VM, only used for debugging.
    pub name: &'static str,
    /// The GUID of the VM.
    pub guid: [u8; 16],
    /// The physical CPUs assigned to the VM. The lowest one runs the BSP.
    pub pcpu_bitmap: u64,
    /// Guest feature flags.
    pub guest_flags: GuestFlags,
    /// Memory of the VM.
    pub memory: VmMemConfig,
    /// Passthrough PCI devices.
    pub pci_ptdevs: &'static [PciPtDevConfig],
    /// OS information.
    pub os_config: VmOsConfig,
    /// Whether a virtual UART is provided to the VM.
    pub vuart: bool,
}

impl VmConfig {
    /// The record of an unused slot.
    pub const EMPTY: Self = Self {
        vm_type: VmType::Undefined,
        name: "",
        guid: [0; 16],
        pcpu_bitmap: 0,
        guest_flags: GuestFlags::empty(),
        memory: VmMemConfig {
            start_hpa: HostPhysAddr::from_usize(0),
            size: 0,
        },
        pci_ptdevs: &[],
        os_config: VmOsConfig {
            name: "",
            bootargs: "",
        },
        vuart: false,
    };

    /// Whether this slot describes a VM at all.
    pub const fn is_defined(&self) -> bool {
        !matches!(self.vm_type, VmType::Undefined)
    }

    /// Whether the VM owns a secure world.
    pub const fn secure_world_enabled(&self) -> bool {
        self.guest_flags.contains(GuestFlags::SECURE_WORLD_ENABLED)
    }

    /// Whether the local APIC is passed through to the VM.
    pub const fn lapic_passthrough(&self) -> bool {
        self.guest_flags.contains(GuestFlags::LAPIC_PASSTHROUGH)
    }

    /// The physical CPU running the BSP of the VM, i.e. the lowest assigned one.
    pub const fn bsp_pcpu_id(&self) -> Option<usize> {
        if self.pcpu_bitmap == 0 {
            None
        } else {
            Some(self.pcpu_bitmap.trailing_zeros() as usize)
        }
    }

    /// Iterate over the assigned physical CPUs in ascending order.
    pub fn pcpus(&self) -> impl Iterator<Item = usize> {
        let bitmap = self.pcpu_bitmap;
        (0..u64::BITS as usize).filter(move |i| bitmap & (1 << i) != 0)
    }

    /// The host physical range of the VM memory, if any.
    pub fn memory_range(&self) -> Option<AddrRange<HostPhysAddr>> {
        if self.memory.size == 0 {
            None
        } else {
            AddrRange::try_from_start_size(self.memory.start_hpa, self.memory.size)
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Number of physical CPUs assigned to a VM.
pub const fn get_vm_pcpu_nums(config: &VmConfig) -> usize {
    config.pcpu_bitmap.count_ones() as usize
}

/// Validate the whole configuration table.
///
/// Undefined slots are skipped. Any inconsistency is reported as [`axerrno::AxError::InvalidInput`]
/// and is fatal to the bring-up of the platform.
pub fn sanitize_vm_configs(configs: &[VmConfig]) -> AxResult {
    if configs.len() > CONFIG_MAX_VM_NUM {
        return ax_err!(InvalidInput, "too many VM configurations");
    }

    let mut prelaunch_pcpus: u64 = 0;
    let mut sos_id = None;

    for (vm_id, config) in configs.iter().enumerate() {
        if !config.is_defined() {
            continue;
        }
        sanitize_one(vm_id, config)?;

        match config.vm_type {
            VmType::PreLaunched => {
                if config.pcpu_bitmap == 0 {
                    return ax_err!(
                        InvalidInput,
                        format!("VM{}: pre-launched VM has no pcpu assigned", vm_id)
                    );
                }
                if prelaunch_pcpus & config.pcpu_bitmap != 0 {
                    return ax_err!(
                        InvalidInput,
                        format!("VM{}: pcpus shared with another pre-launched VM", vm_id)
                    );
                }
                prelaunch_pcpus |= config.pcpu_bitmap;
            }
            VmType::ServiceOs => {
                if let Some(other) = sos_id.replace(vm_id) {
                    return ax_err!(
                        InvalidInput,
                        format!("VM{}: VM{} is already the Service OS", vm_id, other)
                    );
                }
                if config.pcpu_bitmap == 0 {
                    return ax_err!(
                        InvalidInput,
                        format!("VM{}: Service OS has no pcpu assigned", vm_id)
                    );
                }
                if config.lapic_passthrough() {
                    return ax_err!(
                        InvalidInput,
                        format!("VM{}: LAPIC passthrough is not allowed for the Service OS", vm_id)
                    );
                }
            }
            VmType::Normal | VmType::Undefined => {}
        }
    }

    // The Service OS runs on whatever is left by the pre-launched VMs.
    if let Some(sos_id) = sos_id {
        if configs[sos_id].pcpu_bitmap & prelaunch_pcpus != 0 {
            return ax_err!(
                InvalidInput,
                format!("VM{}: Service OS pcpus overlap a pre-launched VM", sos_id)
            );
        }
    }

    for (i, a) in configs.iter().enumerate().filter(|(_, c)| c.is_defined()) {
        for (j, b) in configs
            .iter()
            .enumerate()
            .skip(i + 1)
            .filter(|(_, c)| c.is_defined())
        {
            if a.guid == b.guid {
                return ax_err!(
                    InvalidInput,
                    format!("VM{} and VM{} share the same GUID", i, j)
                );
            }
            if owns_host_memory(a) && owns_host_memory(b) {
                if let (Some(ra), Some(rb)) = (a.memory_range(), b.memory_range()) {
                    if ra.overlaps(rb) {
                        return ax_err!(
                            InvalidInput,
                            format!("VM{} and VM{} have overlapping memory", i, j)
                        );
                    }
                }
            }
            for pa in a.pci_ptdevs {
                if b.pci_ptdevs.iter().any(|pb| pb.pbdf == pa.pbdf) {
                    return ax_err!(
                        InvalidInput,
                        format!("VM{} and VM{} both own PCI device {}", i, j, pa.pbdf)
                    );
                }
            }
        }
    }

    Ok(())
}

/// The memory of hypervisor-launched VMs is carved out of host memory by the configuration.
fn owns_host_memory(config: &VmConfig) -> bool {
    matches!(config.vm_type, VmType::PreLaunched | VmType::ServiceOs)
}

/// Checks of a single record.
fn sanitize_one(vm_id: usize, config: &VmConfig) -> AxResult {
    if config.name.len() > MAX_CONFIG_NAME_SIZE || config.os_config.name.len() > MAX_CONFIG_NAME_SIZE
    {
        return ax_err!(InvalidInput, format!("VM{}: name too long", vm_id));
    }
    if config.os_config.bootargs.len() > MAX_BOOTARGS_SIZE {
        return ax_err!(InvalidInput, format!("VM{}: bootargs too long", vm_id));
    }
    if config
        .pcpu_bitmap
        .checked_shr(CONFIG_MAX_PCPU_NUM as u32)
        .unwrap_or(0)
        != 0
    {
        return ax_err!(InvalidInput, format!("VM{}: pcpu out of range", vm_id));
    }
    if get_vm_pcpu_nums(config) > CONFIG_MAX_VCPUS_PER_VM {
        return ax_err!(InvalidInput, format!("VM{}: too many pcpus assigned", vm_id));
    }
    if !config.memory.start_hpa.is_aligned_4k() || config.memory.size % crate::PAGE_SIZE != 0 {
        return ax_err!(InvalidInput, format!("VM{}: memory not page aligned", vm_id));
    }
    if config.memory.size != 0 && config.memory_range().is_none() {
        return ax_err!(InvalidInput, format!("VM{}: memory range overflows", vm_id));
    }
    #[cfg(feature = "partition")]
    if config.vm_type == VmType::PreLaunched {
        crate::partition::check_partition_memory(vm_id, config)?;
    }

    for (i, dev) in config.pci_ptdevs.iter().enumerate() {
        if !dev.vbdf.is_well_formed() || !dev.pbdf.is_well_formed() {
            return ax_err!(
                InvalidInput,
                format!("VM{}: malformed BDF pair {} -> {}", vm_id, dev.vbdf, dev.pbdf)
            );
        }
        let duplicated = config.pci_ptdevs[i + 1..]
            .iter()
            .any(|other| other.vbdf == dev.vbdf || other.pbdf == dev.pbdf);
        if duplicated {
            return ax_err!(
                InvalidInput,
                format!("VM{}: PCI device {} assigned twice", vm_id, dev.vbdf)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn prelaunched(guid: u8, pcpus: u64, start: usize, size: usize) -> VmConfig {
        VmConfig {
            vm_type: VmType::PreLaunched,
            name: "pre",
            guid: [guid; 16],
            pcpu_bitmap: pcpus,
            guest_flags: GuestFlags::LAPIC_PASSTHROUGH,
            memory: VmMemConfig {
                start_hpa: HostPhysAddr::from_usize(start),
                size,
            },
            ..VmConfig::EMPTY
        }
    }

    #[test]
    fn test_empty_table_is_valid() {
        assert!(sanitize_vm_configs(&[VmConfig::EMPTY; CONFIG_MAX_VM_NUM]).is_ok());
    }

    #[test]
    fn test_duplicate_guid_rejected() {
        let configs = [
            prelaunched(1, 0b01, 0x1000_0000, 0x100_0000),
            prelaunched(1, 0b10, 0x2000_0000, 0x100_0000),
        ];
        assert_eq!(sanitize_vm_configs(&configs), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_overlapping_memory_rejected() {
        let configs = [
            prelaunched(1, 0b01, 0x1000_0000, 0x100_0000),
            prelaunched(2, 0b10, 0x1080_0000, 0x100_0000),
        ];
        assert_eq!(sanitize_vm_configs(&configs), Err(AxError::InvalidInput));

        let configs = [
            prelaunched(1, 0b01, 0x1000_0000, 0x100_0000),
            prelaunched(2, 0b10, 0x1100_0000, 0x100_0000),
        ];
        assert!(sanitize_vm_configs(&configs).is_ok());
    }

    #[test]
    fn test_shared_prelaunched_pcpu_rejected() {
        let configs = [
            prelaunched(1, 0b011, 0x1000_0000, 0x100_0000),
            prelaunched(2, 0b110, 0x2000_0000, 0x100_0000),
        ];
        assert_eq!(sanitize_vm_configs(&configs), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_single_service_os() {
        let sos = VmConfig {
            vm_type: VmType::ServiceOs,
            guid: [9; 16],
            pcpu_bitmap: 0b1100,
            ..VmConfig::EMPTY
        };
        let second = VmConfig {
            guid: [10; 16],
            ..sos
        };
        assert!(sanitize_vm_configs(&[sos]).is_ok());
        assert_eq!(sanitize_vm_configs(&[sos, second]), Err(AxError::InvalidInput));

        let with_lapic_pt = VmConfig {
            guest_flags: GuestFlags::LAPIC_PASSTHROUGH,
            ..sos
        };
        assert_eq!(sanitize_vm_configs(&[with_lapic_pt]), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_malformed_bdf_rejected() {
        static BAD: [PciPtDevConfig; 1] = [PciPtDevConfig {
            vbdf: PciBdf::new(0, 32, 0),
            pbdf: PciBdf::new(0, 2, 0),
        }];
        static TWICE: [PciPtDevConfig; 2] = [
            PciPtDevConfig {
                vbdf: PciBdf::new(0, 1, 0),
                pbdf: PciBdf::new(0, 2, 0),
            },
            PciPtDevConfig {
                vbdf: PciBdf::new(0, 1, 0),
                pbdf: PciBdf::new(0, 3, 0),
            },
        ];
        let mut config = prelaunched(1, 0b1, 0x1000_0000, 0x100_0000);
        config.pci_ptdevs = &BAD;
        assert_eq!(sanitize_vm_configs(&[config]), Err(AxError::InvalidInput));
        config.pci_ptdevs = &TWICE;
        assert_eq!(sanitize_vm_configs(&[config]), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_pcpu_helpers() {
        let config = prelaunched(1, 0b1010_0100, 0, 0);
        assert_eq!(get_vm_pcpu_nums(&config), 3);
        assert_eq!(config.bsp_pcpu_id(), Some(2));
        assert_eq!(config.pcpus().collect::<alloc::vec::Vec<_>>(), [2, 5, 7]);
        assert_eq!(VmConfig::EMPTY.bsp_pcpu_id(), None);
    }

    #[test]
    fn test_bdf_encoding() {
        let bdf = PciBdf::new(0x3, 0x1f, 0x7);
        assert_eq!(bdf.value(), 0x03ff);
        assert_eq!(format!("{}", bdf), "03:1f.7");
    }
}
