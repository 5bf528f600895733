//! Virtual CPUID table of a VM.

use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::VmHal;

/// The subleaf of the entry is significant for lookups.
pub const CPUID_CHECK_SUBLEAF: u32 = 1 << 0;
/// Maximum number of CPUID entries of a VM.
pub const MAX_VM_VCPUID_ENTRIES: usize = 64;

/// Highest basic leaf exposed to guests.
const MAX_BASIC_LEAF: u32 = 0x16;
/// Highest extended leaf exposed to guests.
const MAX_EXTENDED_LEAF: u32 = 0x8000_0008;
const HYPERVISOR_LEAF: u32 = 0x4000_0000;
/// "AxVMAxVMAxVM" in ebx, ecx, edx.
const HYPERVISOR_SIGNATURE: [u32; 3] = [0x4d56_7841, 0x4d56_7841, 0x4d56_7841];

const LEAF1_ECX_VMX: u32 = 1 << 5;
const LEAF1_ECX_SMX: u32 = 1 << 6;
const LEAF1_ECX_HYPERVISOR: u32 = 1 << 31;

/// One cached CPUID result.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidEntry {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub leaf: u32,
    pub subleaf: u32,
    /// [`CPUID_CHECK_SUBLEAF`] or 0.
    pub flags: u32,
}

impl CpuidEntry {
    fn from_host<H: VmHal>(leaf: u32, subleaf: u32, flags: u32) -> Self {
        let [eax, ebx, ecx, edx] = H::cpuid(leaf, subleaf);
        Self {
            eax,
            ebx,
            ecx,
            edx,
            leaf,
            subleaf,
            flags,
        }
    }

    /// Whether this entry answers `cpuid(leaf, subleaf)`.
    pub fn matches(&self, leaf: u32, subleaf: u32) -> bool {
        self.leaf == leaf && (self.flags & CPUID_CHECK_SUBLEAF == 0 || self.subleaf == subleaf)
    }
}

/// The CPUID leaves a VM sees, at most [`MAX_VM_VCPUID_ENTRIES`] of them.
#[derive(Clone, Debug, Default)]
pub struct CpuidTable {
    entries: Vec<CpuidEntry>,
    level: u32,
    xlevel: u32,
}

impl CpuidTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_VM_VCPUID_ENTRIES),
            level: 0,
            xlevel: 0,
        }
    }

    /// Build the table from the host CPUID, hiding virtualization extensions and advertising
    /// the hypervisor.
    pub fn from_host<H: VmHal>() -> AxResult<Self> {
        let mut table = Self::new();

        let leaf0 = CpuidEntry::from_host::<H>(0, 0, 0);
        table.level = leaf0.eax.min(MAX_BASIC_LEAF);
        table.add_entry(CpuidEntry {
            eax: table.level,
            ..leaf0
        })?;

        for leaf in 1..=table.level {
            match leaf {
                // deterministic cache parameters, terminated by a null cache type
                0x04 => {
                    for subleaf in 0.. {
                        let entry = CpuidEntry::from_host::<H>(leaf, subleaf, CPUID_CHECK_SUBLEAF);
                        if entry.eax & 0x1f == 0 {
                            break;
                        }
                        table.add_entry(entry)?;
                    }
                }
                // extended topology, terminated by a null level type
                0x0b => {
                    for subleaf in 0.. {
                        let entry = CpuidEntry::from_host::<H>(leaf, subleaf, CPUID_CHECK_SUBLEAF);
                        if subleaf != 0 && (entry.ecx >> 8) & 0xff == 0 {
                            break;
                        }
                        table.add_entry(entry)?;
                    }
                }
                0x07 => {
                    table.add_entry(CpuidEntry::from_host::<H>(leaf, 0, CPUID_CHECK_SUBLEAF))?;
                }
                // processor extended state, components 2..=9 only when supported
                0x0d => {
                    for subleaf in 0..=9 {
                        let entry = CpuidEntry::from_host::<H>(leaf, subleaf, CPUID_CHECK_SUBLEAF);
                        if subleaf < 2 || entry.eax != 0 {
                            table.add_entry(entry)?;
                        }
                    }
                }
                0x01 => {
                    let mut entry = CpuidEntry::from_host::<H>(leaf, 0, 0);
                    entry.ecx &= !(LEAF1_ECX_VMX | LEAF1_ECX_SMX);
                    entry.ecx |= LEAF1_ECX_HYPERVISOR;
                    table.add_entry(entry)?;
                }
                _ => table.add_entry(CpuidEntry::from_host::<H>(leaf, 0, 0))?,
            }
        }

        table.add_entry(CpuidEntry {
            eax: HYPERVISOR_LEAF,
            ebx: HYPERVISOR_SIGNATURE[0],
            ecx: HYPERVISOR_SIGNATURE[1],
            edx: HYPERVISOR_SIGNATURE[2],
            leaf: HYPERVISOR_LEAF,
            subleaf: 0,
            flags: 0,
        })?;

        let ext0 = CpuidEntry::from_host::<H>(0x8000_0000, 0, 0);
        table.xlevel = ext0.eax.min(MAX_EXTENDED_LEAF);
        table.add_entry(CpuidEntry {
            eax: table.xlevel,
            ..ext0
        })?;
        for leaf in 0x8000_0001..=table.xlevel {
            table.add_entry(CpuidEntry::from_host::<H>(leaf, 0, 0))?;
        }

        debug!(
            "vCPUID: {} entries, level {:#x}, xlevel {:#x}",
            table.entries.len(),
            table.level,
            table.xlevel
        );
        Ok(table)
    }

    /// Append an entry.
    pub fn add_entry(&mut self, entry: CpuidEntry) -> AxResult {
        if self.entries.len() >= MAX_VM_VCPUID_ENTRIES {
            return ax_err!(NoMemory, "vCPUID table is full");
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Find the entry answering `cpuid(leaf, subleaf)`.
    ///
    /// A leaf above the highest basic (or extended) leaf returns the data of the highest one,
    /// as real processors do.
    pub fn find(&self, leaf: u32, subleaf: u32) -> Option<&CpuidEntry> {
        let found = self.entries.iter().find(|e| e.matches(leaf, subleaf));
        if found.is_some() {
            return found;
        }
        let limit = if leaf & 0x8000_0000 != 0 {
            self.xlevel
        } else {
            self.level
        };
        if leaf > limit {
            self.entries.iter().find(|e| e.matches(limit, subleaf))
        } else {
            None
        }
    }

    /// Highest basic leaf.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Highest extended leaf.
    pub fn xlevel(&self) -> u32 {
        self.xlevel
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockHal;
    use axerrno::AxError;

    #[test]
    fn test_from_host_hides_vmx() {
        let table = CpuidTable::from_host::<MockHal>().unwrap();
        let leaf1 = table.find(1, 0).unwrap();
        assert_eq!(leaf1.ecx & LEAF1_ECX_VMX, 0);
        assert_ne!(leaf1.ecx & LEAF1_ECX_HYPERVISOR, 0);
        assert_eq!(table.level(), 0xd);
        assert_eq!(table.xlevel(), 0x8000_0008);
        assert!(table.len() <= MAX_VM_VCPUID_ENTRIES);
    }

    #[test]
    fn test_subleaf_lookup() {
        let table = CpuidTable::from_host::<MockHal>().unwrap();
        // leaf 4 has three caches in the mock
        assert_eq!(table.find(4, 2).unwrap().subleaf, 2);
        assert!(table.find(4, 3).is_none());
        // leaf 6 ignores the subleaf
        assert_eq!(table.find(6, 5).unwrap().subleaf, 0);
    }

    #[test]
    fn test_out_of_range_leaf_falls_back() {
        let table = CpuidTable::from_host::<MockHal>().unwrap();
        assert_eq!(table.find(0x14, 0), table.find(0xd, 0));
        assert_eq!(table.find(0x8000_0010, 0).unwrap().leaf, 0x8000_0008);
        assert!(table.find(0x4000_0000, 0).is_some());
    }

    #[test]
    fn test_table_capacity() {
        let mut table = CpuidTable::new();
        for leaf in 0..MAX_VM_VCPUID_ENTRIES as u32 {
            table
                .add_entry(CpuidEntry {
                    leaf,
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(
            table.add_entry(CpuidEntry::default()),
            Err(AxError::NoMemory)
        );
    }
}
