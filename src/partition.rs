//! Static device tables of pre-launched VMs in partition mode.
//!
//! The tables are built once when the VM is prepared and never regenerated. The byte-level
//! encoding of the MP table is left to the firmware emulation, only its content is built here.

use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::{
    get_vm_pcpu_nums, E820Entry, E820Type, PciBdf, PciVdev, VmConfig, VmId,
    CONFIG_MAX_VCPUS_PER_VM,
};

/// Number of entries of the virtual E820 map.
pub const NUM_E820_ENTRIES: usize = 5;
/// Base of the MP table reservation.
pub const MPTABLE_BASE: u64 = 0xf_0000;
/// Size of the MP table reservation.
pub const MPTABLE_SIZE: u64 = 0x1_0000;
/// Start of the RAM above the legacy area.
pub const HIGH_RAM_START: u64 = 0x10_0000;
/// Start of the PCI hole, guest RAM ends below it.
pub const PCI_HOLE_BASE: u64 = 0xe000_0000;
/// End of the PCI hole.
pub const PCI_HOLE_END: u64 = 1 << 32;

/// First CMOS/RTC port.
pub const RTC_PORT: u16 = 0x70;
/// Number of CMOS/RTC ports.
pub const RTC_PORT_COUNT: u32 = 2;

const LAPIC_BASE: u32 = 0xfee0_0000;
const IOAPIC_BASE: u32 = 0xfec0_0000;
const IOAPIC_VERSION: u8 = 0x11;
const LAPIC_VERSION: u8 = 0x14;
const ISA_IRQ_COUNT: u8 = 16;
/// The IRQ0 timer is routed to IOAPIC pin 2.
const TIMER_IOAPIC_PIN: u8 = 2;
/// Local interrupt entries target every local APIC.
const ALL_LAPICS: u8 = 0xff;

/// Offset of the virtual RTC: the guest clock starts aligned with the host one.
const DEFAULT_VRTC_OFFSET: u8 = 0;

/// The virtual E820 map of a partitioned VM with `mem_size` bytes of RAM.
///
/// `mem_size` must lie in `(HIGH_RAM_START, PCI_HOLE_BASE]`, see [`check_partition_memory`].
pub fn build_ve820(mem_size: usize) -> [E820Entry; NUM_E820_ENTRIES] {
    let size = mem_size as u64;
    [
        E820Entry::new(0, MPTABLE_BASE, E820Type::Ram),
        E820Entry::new(MPTABLE_BASE, MPTABLE_SIZE, E820Type::Reserved),
        E820Entry::new(HIGH_RAM_START, size - HIGH_RAM_START, E820Type::Ram),
        E820Entry::new(size, PCI_HOLE_BASE - size, E820Type::Reserved),
        E820Entry::new(PCI_HOLE_BASE, PCI_HOLE_END - PCI_HOLE_BASE, E820Type::Reserved),
    ]
}

/// The memory of a partitioned VM must fit its virtual E820 map.
pub fn check_partition_memory(vm_id: VmId, config: &VmConfig) -> AxResult {
    let size = config.memory.size as u64;
    if size <= HIGH_RAM_START || size > PCI_HOLE_BASE {
        return ax_err!(
            InvalidInput,
            format!("VM{}: memory size {:#x} unusable in partition mode", vm_id, size)
        );
    }
    Ok(())
}

/// A processor entry of the MP table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpProcEntry {
    /// Local APIC id of the processor.
    pub lapic_id: u8,
    /// Local APIC version.
    pub lapic_version: u8,
    /// The processor is usable.
    pub enabled: bool,
    /// The processor is the bootstrap processor.
    pub bsp: bool,
}

/// The IOAPIC entry of the MP table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpIoapicEntry {
    /// IOAPIC id.
    pub id: u8,
    /// IOAPIC version.
    pub version: u8,
    /// MMIO base of the IOAPIC.
    pub addr: u32,
}

/// Type of an MP interrupt assignment entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpIntType {
    Int = 0,
    Nmi = 1,
    Smi = 2,
    ExtInt = 3,
}

/// An I/O or local interrupt assignment entry of the MP table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpIntEntry {
    /// Kind of interrupt delivered.
    pub int_type: MpIntType,
    /// Bus the interrupt originates from.
    pub src_bus: u8,
    /// IRQ on the source bus.
    pub src_irq: u8,
    /// IOAPIC id for I/O entries, local APIC id (or all) for local entries.
    pub dst_id: u8,
    /// IOAPIC pin or LINTx.
    pub dst_pin: u8,
}

/// Content of the MP table of a partitioned VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MpTable {
    /// Guest physical address the table is placed at.
    pub base: u64,
    /// MMIO base of the local APICs.
    pub lapic_addr: u32,
    /// One entry per vcpu, the BSP first.
    pub processors: Vec<MpProcEntry>,
    pub ioapic: MpIoapicEntry,
    /// ISA interrupt assignments to IOAPIC pins.
    pub io_ints: Vec<MpIntEntry>,
    /// ExtINT on LINT0 and NMI on LINT1.
    pub local_ints: [MpIntEntry; 2],
}

impl MpTable {
    /// An MP table for a VM with `pcpu_nums` vcpus, the first one being the BSP.
    pub fn build(pcpu_nums: usize) -> AxResult<Self> {
        if pcpu_nums == 0 || pcpu_nums > CONFIG_MAX_VCPUS_PER_VM {
            return ax_err!(InvalidInput, format!("invalid vCPU count {}", pcpu_nums));
        }
        let processors = (0..pcpu_nums)
            .map(|i| MpProcEntry {
                lapic_id: i as u8,
                lapic_version: LAPIC_VERSION,
                enabled: true,
                bsp: i == 0,
            })
            .collect();
        // the IOAPIC takes the first id after the local APICs
        let ioapic = MpIoapicEntry {
            id: pcpu_nums as u8,
            version: IOAPIC_VERSION,
            addr: IOAPIC_BASE,
        };

        let io_ints = (0..ISA_IRQ_COUNT)
            .map(|pin| {
                let (int_type, src_irq) = match pin {
                    0 => (MpIntType::ExtInt, 0),
                    TIMER_IOAPIC_PIN => (MpIntType::Int, 0),
                    pin => (MpIntType::Int, pin),
                };
                MpIntEntry {
                    int_type,
                    src_bus: 0,
                    src_irq,
                    dst_id: ioapic.id,
                    dst_pin: pin,
                }
            })
            .collect();
        let local_ints = [
            MpIntEntry {
                int_type: MpIntType::ExtInt,
                src_bus: 0,
                src_irq: 0,
                dst_id: ALL_LAPICS,
                dst_pin: 0,
            },
            MpIntEntry {
                int_type: MpIntType::Nmi,
                src_bus: 0,
                src_irq: 0,
                dst_id: ALL_LAPICS,
                dst_pin: 1,
            },
        ];

        Ok(Self {
            base: MPTABLE_BASE,
            lapic_addr: LAPIC_BASE,
            processors,
            ioapic,
            io_ints,
            local_ints,
        })
    }

    /// Number of entries following the header.
    pub fn entry_count(&self) -> usize {
        // one bus entry
        self.processors.len() + 1 + 1 + self.io_ints.len() + self.local_ints.len()
    }
}

/// The static PCI devices of a partitioned VM: the host bridge, then the passthrough devices.
pub fn build_vpci_vdevs(config: &VmConfig) -> Vec<PciVdev> {
    let mut vdevs = Vec::with_capacity(config.pci_ptdevs.len() + 1);
    vdevs.push(PciVdev {
        vbdf: PciBdf::new(0, 0, 0),
        pbdf: None,
    });
    vdevs.extend(config.pci_ptdevs.iter().map(|dev| PciVdev {
        vbdf: dev.vbdf,
        pbdf: Some(dev.pbdf),
    }));
    vdevs
}

/// Everything partition mode adds to a pre-launched VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    /// The virtual E820 map.
    pub ve820: [E820Entry; NUM_E820_ENTRIES],
    pub mptable: MpTable,
    /// Static PCI devices, host bridge first.
    pub vdevs: Vec<PciVdev>,
    /// Offset of the virtual RTC from the host clock.
    pub vrtc_offset: u8,
}

impl PartitionInfo {
    /// Build every table of a pre-launched VM.
    pub fn build(vm_id: VmId, config: &VmConfig) -> AxResult<Self> {
        check_partition_memory(vm_id, config)?;
        let info = Self {
            ve820: build_ve820(config.memory.size),
            mptable: MpTable::build(get_vm_pcpu_nums(config))?,
            vdevs: build_vpci_vdevs(config),
            vrtc_offset: DEFAULT_VRTC_OFFSET,
        };
        debug!(
            "VM{} partition tables: {} MP entries, {} PCI devices",
            vm_id,
            info.mptable.entry_count(),
            info.vdevs.len()
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PciPtDevConfig, VmMemConfig, VmType};
    use axerrno::AxError;

    static PTDEVS: [PciPtDevConfig; 1] = [PciPtDevConfig {
        vbdf: PciBdf::new(0, 1, 0),
        pbdf: PciBdf::new(0, 0x1f, 6),
    }];

    fn config(size: usize, pcpu_bitmap: u64) -> VmConfig {
        VmConfig {
            vm_type: VmType::PreLaunched,
            pcpu_bitmap,
            memory: VmMemConfig {
                size,
                ..VmMemConfig::default()
            },
            pci_ptdevs: &PTDEVS,
            ..VmConfig::EMPTY
        }
    }

    #[test]
    fn test_ve820_layout() {
        let ve820 = build_ve820(0x2000_0000);
        assert_eq!(ve820[0], E820Entry::new(0, 0xf_0000, E820Type::Ram));
        assert_eq!(ve820[1].ty, E820Type::Reserved);
        assert_eq!(ve820[2].end(), 0x2000_0000);
        assert_eq!(ve820[3].end(), PCI_HOLE_BASE);
        assert_eq!(ve820[4].end(), 1 << 32);
        for pair in ve820.windows(2) {
            assert_eq!(pair[0].end(), pair[1].base);
        }
    }

    #[test]
    fn test_memory_size_bounds() {
        assert!(check_partition_memory(0, &config(0x1000_0000, 1)).is_ok());
        assert!(check_partition_memory(0, &config(PCI_HOLE_BASE as usize, 1)).is_ok());
        assert_eq!(
            check_partition_memory(0, &config(0x10_0000, 1)),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            check_partition_memory(0, &config(0xf000_0000, 1)),
            Err(AxError::InvalidInput)
        );
    }

    #[test]
    fn test_mptable_follows_pcpus() {
        let info = PartitionInfo::build(1, &config(0x1000_0000, 0b1100)).unwrap();
        let mptable = &info.mptable;
        assert_eq!(mptable.processors.len(), 2);
        assert!(mptable.processors[0].bsp);
        assert!(!mptable.processors[1].bsp);
        assert_eq!(mptable.ioapic.id, 2);
        assert_eq!(mptable.io_ints.len(), 16);
        assert_eq!(mptable.io_ints[2].src_irq, 0);
        assert_eq!(mptable.io_ints[0].int_type, MpIntType::ExtInt);
        assert_eq!(mptable.entry_count(), 2 + 1 + 1 + 16 + 2);

        assert_eq!(MpTable::build(0), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_vpci_list() {
        let vdevs = build_vpci_vdevs(&config(0x1000_0000, 1));
        assert_eq!(vdevs.len(), 2);
        assert_eq!(vdevs[0].vbdf, PciBdf::new(0, 0, 0));
        assert_eq!(vdevs[0].pbdf, None);
        assert_eq!(vdevs[1].pbdf, Some(PciBdf::new(0, 0x1f, 6)));
    }
}
