//! The EPT hierarchies of a VM and the rules tying them together.

use axerrno::{ax_err, AxResult};
use memory_addr::{MemoryAddr, PAGE_SIZE_4K};

use crate::{
    EptFlags, EptHierarchy, GuestPhysAddr, HostPhysAddr, SecureWorldMemory, VmHal,
    TRUSTY_EPT_REBASE_GPA,
};

/// Largest secure world, it lives in a single 1G slot of the secure hierarchy.
const MAX_SECURE_WORLD_SIZE: usize = 1 << 30;
/// Number of 1G slots of the normal world visible from the secure world.
const SHARED_PDPT_ENTRIES: usize = TRUSTY_EPT_REBASE_GPA >> 30;

/// The normal-world hierarchy of a VM and, while the secure world exists, the secure one.
///
/// Normal-world mappings are confined below [`TRUSTY_EPT_REBASE_GPA`] and may never reach
/// secure memory.
pub struct VmAddressSpace<H: VmHal> {
    nworld: EptHierarchy<H>,
    sworld: Option<EptHierarchy<H>>,
    secure_memory: Option<SecureWorldMemory>,
}

impl<H: VmHal> VmAddressSpace<H> {
    pub fn new() -> Self {
        Self {
            nworld: EptHierarchy::new(),
            sworld: None,
            secure_memory: None,
        }
    }

    /// The normal-world hierarchy.
    pub fn nworld(&self) -> &EptHierarchy<H> {
        &self.nworld
    }

    /// The secure-world hierarchy, if any.
    pub fn sworld(&self) -> Option<&EptHierarchy<H>> {
        self.sworld.as_ref()
    }

    pub fn secure_memory(&self) -> Option<SecureWorldMemory> {
        self.secure_memory
    }

    /// Map guest memory in the normal world.
    pub fn map_normal(
        &mut self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: usize,
        flags: EptFlags,
    ) -> AxResult {
        if gpa.as_usize().checked_add(size).map_or(true, |end| end > TRUSTY_EPT_REBASE_GPA) {
            return ax_err!(InvalidInput, "normal world GPA out of range");
        }
        if let Some(mem) = self.secure_memory {
            if mem.overlaps_hpa(hpa, size) {
                return ax_err!(PermissionDenied, "normal world cannot map secure memory");
            }
        }
        self.nworld.map(gpa, hpa, size, flags)
    }

    /// Unmap guest memory from the normal world.
    pub fn unmap_normal(&mut self, gpa: GuestPhysAddr, size: usize) -> AxResult {
        self.nworld.unmap(gpa, size)
    }

    /// The host range backing `[gpa, gpa + size)` in the normal world, if it is mapped and
    /// contiguous.
    fn contiguous_hpa(&self, gpa: GuestPhysAddr, size: usize) -> Option<HostPhysAddr> {
        let (base, _) = self.nworld.translate(gpa)?;
        (0..size).step_by(PAGE_SIZE_4K).all(|offset| {
            self.nworld
                .translate(gpa + offset)
                .is_some_and(|(hpa, _)| hpa == base + offset)
        })
        .then_some(base)
    }

    /// Take `[gpa_orig, gpa_orig + size)` away from the normal world and build the secure
    /// world around it.
    pub fn create_secure_world(
        &mut self,
        gpa_orig: GuestPhysAddr,
        size: usize,
    ) -> AxResult<SecureWorldMemory> {
        if self.sworld.is_some() {
            return ax_err!(AlreadyExists, "secure world already created");
        }
        if !gpa_orig.is_aligned_4k() || size == 0 || size % PAGE_SIZE_4K != 0 {
            return ax_err!(InvalidInput, "secure world memory not page aligned");
        }
        if size > MAX_SECURE_WORLD_SIZE {
            return ax_err!(InvalidInput, "secure world memory too large");
        }
        let Some(hpa) = self.contiguous_hpa(gpa_orig, size) else {
            return ax_err!(InvalidInput, "secure world memory not backed contiguously");
        };

        self.nworld.unmap(gpa_orig, size)?;

        let mut sworld = EptHierarchy::new();
        sworld.share_pdpt_entries(&self.nworld, SHARED_PDPT_ENTRIES);
        if let Err(err) = sworld.map(
            GuestPhysAddr::from_usize(TRUSTY_EPT_REBASE_GPA),
            hpa,
            size,
            EptFlags::RWX_WB,
        ) {
            self.nworld.map(gpa_orig, hpa, size, EptFlags::RWX_WB)?;
            return Err(err);
        }

        let memory = SecureWorldMemory {
            base_gpa_in_normal: gpa_orig,
            base_hpa: hpa,
            length: size,
        };
        debug!(
            "secure world created: {:?} -> {:?}, size {:#x}",
            gpa_orig, hpa, size
        );
        self.sworld = Some(sworld);
        self.secure_memory = Some(memory);
        Ok(memory)
    }

    /// Drop the secure world and give its memory back to the normal world, zeroing it first
    /// if `clear` is set.
    pub fn destroy_secure_world(&mut self, clear: bool) -> AxResult<Option<SecureWorldMemory>> {
        let Some(memory) = self.secure_memory.take() else {
            return Ok(None);
        };
        self.sworld = None;

        if clear {
            let vaddr = H::phys_to_virt(memory.base_hpa);
            // SAFETY: the range is guest memory of this VM that no world maps any more.
            unsafe { core::ptr::write_bytes(vaddr.as_mut_ptr(), 0, memory.length) };
        }
        self.nworld.map(
            memory.base_gpa_in_normal,
            memory.base_hpa,
            memory.length,
            EptFlags::RWX_WB,
        )?;
        debug!("secure world destroyed, memory returned to {:?}", memory.base_gpa_in_normal);
        Ok(Some(memory))
    }
}

impl<H: VmHal> Default for VmAddressSpace<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockHal;
    use axerrno::AxError;

    const RAM_HPA: usize = 0x1_0000_0000;
    const RAM_SIZE: usize = 0x800_0000;
    const SECURE_GPA: usize = 0x400_0000;
    const SECURE_SIZE: usize = 0x100_0000;

    fn gpa(v: usize) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(v)
    }

    fn hpa(v: usize) -> HostPhysAddr {
        HostPhysAddr::from_usize(v)
    }

    fn with_secure_world() -> VmAddressSpace<MockHal> {
        let mut aspace = VmAddressSpace::<MockHal>::new();
        aspace
            .map_normal(gpa(0), hpa(RAM_HPA), RAM_SIZE, EptFlags::RWX_WB)
            .unwrap();
        aspace
            .create_secure_world(gpa(SECURE_GPA), SECURE_SIZE)
            .unwrap();
        aspace
    }

    #[test]
    fn test_secure_pages_unreachable_from_normal_world() {
        let aspace = with_secure_world();
        let secure = aspace.secure_memory().unwrap();
        assert_eq!(secure.base_hpa, hpa(RAM_HPA + SECURE_GPA));

        let mut leaked = false;
        aspace.nworld().walk(|_, h, size, _| {
            leaked |= secure.overlaps_hpa(h, size);
        });
        assert!(!leaked);
        assert!(aspace.nworld().translate(gpa(SECURE_GPA)).is_none());
        assert!(aspace
            .nworld()
            .translate(gpa(TRUSTY_EPT_REBASE_GPA))
            .is_none());
    }

    #[test]
    fn test_secure_world_sees_normal_world() {
        let aspace = with_secure_world();
        let sworld = aspace.sworld().unwrap();

        let (pa, flags) = sworld.translate(gpa(TRUSTY_EPT_REBASE_GPA + 0x1000)).unwrap();
        assert_eq!(pa, hpa(RAM_HPA + SECURE_GPA + 0x1000));
        assert!(flags.contains(EptFlags::EXECUTE));

        // normal memory is shared, without execute permission
        let (pa, flags) = sworld.translate(gpa(0x2000)).unwrap();
        assert_eq!(pa, hpa(RAM_HPA + 0x2000));
        assert!(flags.contains(EptFlags::READ | EptFlags::WRITE));
        assert!(!flags.contains(EptFlags::EXECUTE));
        // the original location of the secure memory is a hole for both worlds
        assert!(sworld.translate(gpa(SECURE_GPA)).is_none());
    }

    #[test]
    fn test_normal_world_cannot_remap_secure_memory() {
        let mut aspace = with_secure_world();
        assert_eq!(
            aspace.map_normal(
                gpa(0x2000_0000),
                hpa(RAM_HPA + SECURE_GPA),
                0x1000,
                EptFlags::RWX_WB
            ),
            Err(AxError::PermissionDenied)
        );
        assert_eq!(
            aspace.map_normal(
                gpa(TRUSTY_EPT_REBASE_GPA),
                hpa(0x5000_0000),
                0x1000,
                EptFlags::RWX_WB
            ),
            Err(AxError::InvalidInput)
        );
    }

    #[test]
    fn test_destroy_returns_memory() {
        let mut aspace = with_secure_world();
        let memory = aspace.destroy_secure_world(false).unwrap().unwrap();
        assert_eq!(memory.length, SECURE_SIZE);
        assert!(aspace.sworld().is_none());
        assert_eq!(
            aspace.nworld().translate(gpa(SECURE_GPA)).unwrap().0,
            hpa(RAM_HPA + SECURE_GPA)
        );
        assert_eq!(aspace.destroy_secure_world(false), Ok(None));
    }

    #[test]
    fn test_create_requires_backed_memory() {
        let mut aspace = VmAddressSpace::<MockHal>::new();
        assert_eq!(
            aspace.create_secure_world(gpa(SECURE_GPA), SECURE_SIZE),
            Err(AxError::InvalidInput)
        );
        let mut aspace = with_secure_world();
        assert_eq!(
            aspace.create_secure_world(gpa(0), 0x1000),
            Err(AxError::AlreadyExists)
        );
    }
}
