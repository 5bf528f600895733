//! Extended page tables: the guest-physical to host-physical translation hierarchy.

use alloc::{boxed::Box, vec::Vec};
use core::marker::PhantomData;

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;
use memory_addr::{MemoryAddr, PAGE_SIZE_2M, PAGE_SIZE_4K};

use crate::{GuestPhysAddr, HostPhysAddr, HostVirtAddr, VmHal};

bitflags! {
    /// Bits of an EPT entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Execute access.
        const EXECUTE = 1 << 2;
        /// Write-back memory type (leaf entries only).
        const MEM_TYPE_WB = 6 << 3;
        /// Ignore the guest PAT memory type.
        const IGNORE_PAT = 1 << 6;
        /// The entry maps a 2M page instead of referencing a table.
        const HUGE_PAGE = 1 << 7;
        /// Set by hardware on access.
        const ACCESSED = 1 << 8;
        /// Set by hardware on write.
        const DIRTY = 1 << 9;
    }
}

impl EptFlags {
    /// Full access.
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
    /// Full access to write-back memory, the flags of ordinary guest RAM.
    pub const RWX_WB: Self = Self::RWX.union(Self::MEM_TYPE_WB);
}

const ENTRY_COUNT: usize = 512;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
/// Level of the PML4 table, the PT is level 0.
const ROOT_LEVEL: usize = 3;

/// A 4K-aligned table of 512 entries.
#[repr(C, align(4096))]
struct PageTable([u64; ENTRY_COUNT]);

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE_4K);

const fn level_shift(level: usize) -> usize {
    12 + 9 * level
}

const fn level_size(level: usize) -> usize {
    1 << level_shift(level)
}

const fn entry_index(gpa: usize, level: usize) -> usize {
    (gpa >> level_shift(level)) & (ENTRY_COUNT - 1)
}

const fn is_present(entry: u64) -> bool {
    entry & EptFlags::RWX.bits() != 0
}

const fn is_leaf(entry: u64, level: usize) -> bool {
    level == 0 || entry & EptFlags::HUGE_PAGE.bits() != 0
}

const fn entry_paddr(entry: u64) -> HostPhysAddr {
    HostPhysAddr::from_usize((entry & PTE_ADDR_MASK) as usize)
}

/// A 4-level EPT hierarchy.
///
/// The hierarchy owns every table it allocated. A secure-world hierarchy may additionally
/// reference tables owned by the normal-world hierarchy of the same VM; those references are
/// plain physical addresses and are never freed through it.
///
/// Tables are reached through [`VmHal::phys_to_virt`], callers serialize all operations on
/// hierarchies that share tables.
pub struct EptHierarchy<H: VmHal> {
    root: HostPhysAddr,
    tables: Vec<Box<PageTable>>,
    _phantom: PhantomData<H>,
}

impl<H: VmHal> EptHierarchy<H> {
    /// Create an empty hierarchy with a zeroed root table.
    pub fn new() -> Self {
        let mut ept = Self {
            root: HostPhysAddr::from_usize(0),
            tables: Vec::new(),
            _phantom: PhantomData,
        };
        ept.root = ept.alloc_table();
        ept
    }

    /// Physical address of the root (PML4) table.
    pub fn root_paddr(&self) -> HostPhysAddr {
        self.root
    }

    /// The EPT pointer handed to hardware: write-back, 4-level walk.
    pub fn eptp(&self) -> u64 {
        self.root.as_usize() as u64 | (3 << 3) | 6
    }

    /// Number of tables owned by this hierarchy.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn alloc_table(&mut self) -> HostPhysAddr {
        let table = Box::new(PageTable([0; ENTRY_COUNT]));
        let vaddr = HostVirtAddr::from_usize(&*table as *const PageTable as usize);
        self.tables.push(table);
        H::virt_to_phys(vaddr)
    }

    fn table_ptr(table: HostPhysAddr) -> *mut u64 {
        H::phys_to_virt(table).as_mut_ptr() as *mut u64
    }

    pub(crate) fn read_entry(table: HostPhysAddr, index: usize) -> u64 {
        debug_assert!(index < ENTRY_COUNT);
        // SAFETY: `table` is a live page table of this VM and `index` is in bounds.
        unsafe { Self::table_ptr(table).add(index).read_volatile() }
    }

    pub(crate) fn write_entry(table: HostPhysAddr, index: usize, entry: u64) {
        debug_assert!(index < ENTRY_COUNT);
        // SAFETY: same as `read_entry`, mutation is serialized by the owner of the hierarchy.
        unsafe { Self::table_ptr(table).add(index).write_volatile(entry) }
    }

    /// Walk down to the table at `level` covering `gpa`, allocating missing tables.
    fn table_at(&mut self, gpa: usize, level: usize) -> AxResult<HostPhysAddr> {
        let mut table = self.root;
        for cur in (level + 1..=ROOT_LEVEL).rev() {
            let index = entry_index(gpa, cur);
            let entry = Self::read_entry(table, index);
            table = if !is_present(entry) {
                let next = self.alloc_table();
                Self::write_entry(table, index, next.as_usize() as u64 | EptFlags::RWX.bits());
                next
            } else if is_leaf(entry, cur) {
                return ax_err!(AlreadyExists, "GPA already covered by a huge page");
            } else {
                entry_paddr(entry)
            };
        }
        Ok(table)
    }

    /// Map `[gpa, gpa + size)` to `[hpa, hpa + size)`.
    ///
    /// 2M pages are used wherever both addresses and the remaining size allow it. Fails without
    /// leaving partial mappings if any page in the range is already mapped.
    pub fn map(
        &mut self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: usize,
        flags: EptFlags,
    ) -> AxResult {
        if !gpa.is_aligned_4k() || !hpa.is_aligned_4k() || size % PAGE_SIZE_4K != 0 {
            return ax_err!(InvalidInput, "EPT mapping not page aligned");
        }
        trace!(
            "EPT map {:#x}..{:#x} -> {:#x}, {:?}",
            gpa.as_usize(),
            gpa.as_usize() + size,
            hpa.as_usize(),
            flags
        );

        let leaf_flags = flags - EptFlags::HUGE_PAGE;
        let mut done = 0;
        while done < size {
            let (g, h) = (gpa.as_usize() + done, hpa.as_usize() + done);
            let level = if g % PAGE_SIZE_2M == 0 && h % PAGE_SIZE_2M == 0 && size - done >= PAGE_SIZE_2M
            {
                1
            } else {
                0
            };
            let mut entry_flags = leaf_flags;
            if level == 1 {
                entry_flags |= EptFlags::HUGE_PAGE;
            }

            let result = self.table_at(g, level).and_then(|table| {
                let index = entry_index(g, level);
                let mut entry = Self::read_entry(table, index);
                if level == 1 && is_present(entry) && !is_leaf(entry, level) {
                    self.prune_table(table, index, entry_paddr(entry));
                    entry = Self::read_entry(table, index);
                }
                if is_present(entry) {
                    ax_err!(AlreadyExists, "GPA already mapped")
                } else {
                    Self::write_entry(table, index, h as u64 | entry_flags.bits());
                    Ok(())
                }
            });
            if let Err(err) = result {
                self.unmap(gpa, done)?;
                return Err(err);
            }
            done += level_size(level);
        }
        Ok(())
    }

    /// Unmap `[gpa, gpa + size)`. Holes in the range are skipped, 2M pages only partially
    /// covered by the range are split first.
    ///
    /// A PT left without any present entry is freed. Directory tables are kept, the secure
    /// world may reference them.
    pub fn unmap(&mut self, gpa: GuestPhysAddr, size: usize) -> AxResult {
        if !gpa.is_aligned_4k() || size % PAGE_SIZE_4K != 0 {
            return ax_err!(InvalidInput, "EPT unmapping not page aligned");
        }
        trace!("EPT unmap {:#x}..{:#x}", gpa.as_usize(), gpa.as_usize() + size);

        let end = gpa.as_usize() + size;
        let mut g = gpa.as_usize();
        'outer: while g < end {
            let mut table = self.root;
            let mut parent = None;
            for level in (0..=ROOT_LEVEL).rev() {
                let index = entry_index(g, level);
                let entry = Self::read_entry(table, index);
                let span = level_size(level);
                if !is_present(entry) {
                    g = (g & !(span - 1)) + span;
                } else if !is_leaf(entry, level) {
                    parent = Some((table, index));
                    table = entry_paddr(entry);
                    continue;
                } else if g % span == 0 && end - g >= span {
                    Self::write_entry(table, index, 0);
                    g += span;
                } else {
                    self.split_huge_page(table, index, entry);
                    continue 'outer;
                }
                if level == 0 && (g % PAGE_SIZE_2M == 0 || g >= end) {
                    if let Some((pd, pd_index)) = parent {
                        self.prune_table(pd, pd_index, table);
                    }
                }
                continue 'outer;
            }
        }
        Ok(())
    }

    /// Free `table`, referenced by `parent[index]`, if it is empty and owned by this hierarchy.
    fn prune_table(&mut self, parent: HostPhysAddr, index: usize, table: HostPhysAddr) {
        if (0..ENTRY_COUNT).any(|i| is_present(Self::read_entry(table, i))) {
            return;
        }
        let owned = self.tables.iter().position(|t| {
            H::virt_to_phys(HostVirtAddr::from_usize(&**t as *const PageTable as usize)) == table
        });
        if let Some(pos) = owned {
            Self::write_entry(parent, index, 0);
            self.tables.swap_remove(pos);
        }
    }

    /// Replace the 2M page at `table[index]` by a table of 512 4K pages with the same flags.
    fn split_huge_page(&mut self, table: HostPhysAddr, index: usize, entry: u64) {
        let base = entry & PTE_ADDR_MASK;
        let flags = entry & !PTE_ADDR_MASK & !EptFlags::HUGE_PAGE.bits();
        let pt = self.alloc_table();
        for i in 0..ENTRY_COUNT {
            Self::write_entry(pt, i, (base + (i * PAGE_SIZE_4K) as u64) | flags);
        }
        Self::write_entry(table, index, pt.as_usize() as u64 | EptFlags::RWX.bits());
    }

    /// Translate a guest physical address.
    ///
    /// The returned flags are the leaf flags with access rights restricted by every
    /// upper-level entry, as the hardware evaluates them.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, EptFlags)> {
        let g = gpa.as_usize();
        let mut table = self.root;
        let mut access = EptFlags::RWX.bits();
        for level in (0..=ROOT_LEVEL).rev() {
            let entry = Self::read_entry(table, entry_index(g, level));
            if !is_present(entry) {
                return None;
            }
            access &= entry;
            if is_leaf(entry, level) {
                let offset = g & (level_size(level) - 1);
                let flags = (entry & !PTE_ADDR_MASK & !EptFlags::RWX.bits()) | access;
                return Some((
                    entry_paddr(entry) + offset,
                    EptFlags::from_bits_truncate(flags),
                ));
            }
            table = entry_paddr(entry);
        }
        None
    }

    /// Visit every leaf mapping as `(gpa, hpa, size, effective flags)` in ascending GPA order.
    pub fn walk<F>(&self, mut f: F)
    where
        F: FnMut(GuestPhysAddr, HostPhysAddr, usize, EptFlags),
    {
        Self::walk_table(self.root, ROOT_LEVEL, 0, EptFlags::RWX.bits(), &mut f);
    }

    fn walk_table<F>(table: HostPhysAddr, level: usize, base: usize, access: u64, f: &mut F)
    where
        F: FnMut(GuestPhysAddr, HostPhysAddr, usize, EptFlags),
    {
        for index in 0..ENTRY_COUNT {
            let entry = Self::read_entry(table, index);
            if !is_present(entry) {
                continue;
            }
            let gpa = base + (index << level_shift(level));
            let access = access & entry;
            if is_leaf(entry, level) {
                let flags = (entry & !PTE_ADDR_MASK & !EptFlags::RWX.bits()) | access;
                f(
                    GuestPhysAddr::from_usize(gpa),
                    entry_paddr(entry),
                    level_size(level),
                    EptFlags::from_bits_truncate(flags),
                );
            } else {
                Self::walk_table(entry_paddr(entry), level - 1, gpa, access, f);
            }
        }
    }

    /// Make the first `count` 1G slots of `normal` visible through this hierarchy without
    /// execute permission.
    ///
    /// This hierarchy gets its own PML4 entry 0 and PDPT; the PDPT entries are copies of the
    /// normal world's, so both share the lower-level tables.
    pub(crate) fn share_pdpt_entries(&mut self, normal: &Self, count: usize) {
        let pdpt = self.alloc_table();
        Self::write_entry(self.root, 0, pdpt.as_usize() as u64 | EptFlags::RWX.bits());

        let pml4e = Self::read_entry(normal.root, 0);
        if !is_present(pml4e) {
            return;
        }
        let src = entry_paddr(pml4e);
        for i in 0..count.min(ENTRY_COUNT) {
            let pdpte = Self::read_entry(src, i);
            if is_present(pdpte) {
                Self::write_entry(pdpt, i, pdpte & !EptFlags::EXECUTE.bits());
            }
        }
    }
}

impl<H: VmHal> Default for EptHierarchy<H> {
    fn default() -> Self {
        Self::new()
    }
}
