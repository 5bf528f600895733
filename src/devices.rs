//! Storage of the emulated devices owned by a VM.
//!
//! The device models themselves live outside this crate. Only their slots are allocated,
//! reset and released here.

use alloc::vec::Vec;

use crate::{GuestPhysAddr, PciBdf, PciPtDevConfig};

/// Where the output of the virtual PIC is wired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VPicWireMode {
    /// INTR pin of the BSP, the reset default.
    #[default]
    Intr = 0,
    /// LINT0 of the local APIC.
    Lapic,
    /// Pin 0 of the IOAPIC.
    Ioapic,
    /// Not connected.
    Null,
}

/// Virtual 16550 UART slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VUart {
    /// Whether the guest sees the UART at all.
    pub enabled: bool,
    /// First of the 8 I/O ports of the UART.
    pub base_port: u16,
    /// Interrupt line raised by the UART.
    pub irq: u32,
}

impl VUart {
    /// Legacy COM1 port base.
    pub const COM1_PORT: u16 = 0x3f8;
    /// Legacy COM1 interrupt line.
    pub const COM1_IRQ: u32 = 4;

    /// A UART slot at COM1.
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            base_port: Self::COM1_PORT,
            irq: Self::COM1_IRQ,
        }
    }
}

/// Virtual IOAPIC slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VIoapic {
    /// IOAPIC id reported to the guest.
    pub id: u32,
    /// Redirection table, one entry per pin.
    pub rtbl: [u64; VIoapic::PINS],
}

impl VIoapic {
    /// Number of input pins.
    pub const PINS: usize = 24;
    const RTE_MASKED: u64 = 1 << 16;

    /// An IOAPIC with every pin masked.
    pub const fn new() -> Self {
        Self {
            id: 0,
            rtbl: [Self::RTE_MASKED; Self::PINS],
        }
    }

    /// Mask every pin again.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for VIoapic {
    fn default() -> Self {
        Self::new()
    }
}

/// A device on the virtual PCI bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciVdev {
    /// BDF seen by the guest.
    pub vbdf: PciBdf,
    /// Backing physical device, `None` for purely emulated ones.
    pub pbdf: Option<PciBdf>,
}

/// Virtual PCI bus slot.
#[derive(Clone, Debug, Default)]
pub struct VPci {
    vdevs: Vec<PciVdev>,
}

impl VPci {
    /// A bus holding the passthrough devices of a VM.
    pub fn with_ptdevs(ptdevs: &[PciPtDevConfig]) -> Self {
        Self {
            vdevs: ptdevs
                .iter()
                .map(|dev| PciVdev {
                    vbdf: dev.vbdf,
                    pbdf: Some(dev.pbdf),
                })
                .collect(),
        }
    }

    /// Replace the device list.
    pub fn set_vdevs(&mut self, vdevs: Vec<PciVdev>) {
        self.vdevs = vdevs;
    }

    pub fn vdevs(&self) -> &[PciVdev] {
        &self.vdevs
    }

    pub fn find(&self, vbdf: PciBdf) -> Option<&PciVdev> {
        self.vdevs.iter().find(|d| d.vbdf == vbdf)
    }

    /// Remove every device.
    pub fn cleanup(&mut self) {
        self.vdevs.clear();
    }
}

/// An emulated MMIO range `[start, end)` and the opaque data of its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioRegion {
    pub start: GuestPhysAddr,
    pub end: GuestPhysAddr,
    pub handler_data: usize,
}

impl MmioRegion {
    pub fn contains(&self, gpa: GuestPhysAddr) -> bool {
        self.start <= gpa && gpa < self.end
    }

    pub fn overlaps(&self, start: GuestPhysAddr, end: GuestPhysAddr) -> bool {
        self.start < end && start < self.end
    }

    pub fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }
}

/// Device work deferred to the softirq of the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftirqDevEntry {
    /// Virtual BDF of the passthrough device that raised the interrupt.
    pub vbdf: PciBdf,
    /// Physical interrupt vector.
    pub phys_irq: u32,
    /// Virtual interrupt line or MSI vector to inject.
    pub virt_irq: u32,
}
