//! Secure world of a VM: control block and the world switch.
//!
//! The secure world sees the whole normal world (without execute permission) plus its own
//! memory, remapped at [`TRUSTY_EPT_REBASE_GPA`]. The normal world never sees secure memory.
//! Only the BSP ever enters the secure world, so the control block keeps a single context
//! snapshot.

use axerrno::{ax_err, AxResult};

use crate::{CpuContext, GuestPhysAddr, HostPhysAddr, VCpu};

/// Guest physical address where the secure world sees its own memory (511G).
pub const TRUSTY_EPT_REBASE_GPA: usize = 511 << 30;

/// Execution world of a vcpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum World {
    Normal = 0,
    Secure = 1,
}

/// Where the secure world memory came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecureWorldMemory {
    /// Address of the memory in the normal world before it was taken away.
    pub base_gpa_in_normal: GuestPhysAddr,
    /// Host physical address of the memory.
    pub base_hpa: HostPhysAddr,
    /// Size in bytes.
    pub length: usize,
}

impl SecureWorldMemory {
    /// Whether `[hpa, hpa + size)` intersects the secure memory.
    pub fn overlaps_hpa(&self, hpa: HostPhysAddr, size: usize) -> bool {
        let (start, end) = (self.base_hpa.as_usize(), self.base_hpa.as_usize() + self.length);
        hpa.as_usize() < end && start < hpa.as_usize() + size
    }
}

/// Secure world control block of a VM.
pub struct SecureWorldControl {
    /// Memory of the secure world, `Some` while it is active.
    memory: Option<SecureWorldMemory>,
    /// Whether `snapshot` holds a saved context.
    ctx_saved: bool,
    /// The normal-world context of the BSP saved on its last entry to the secure world.
    snapshot: CpuContext,
}

impl SecureWorldControl {
    pub const fn new() -> Self {
        Self {
            memory: None,
            ctx_saved: false,
            snapshot: CpuContext::reset_state(),
        }
    }

    /// Whether the secure world has been created.
    pub fn is_active(&self) -> bool {
        self.memory.is_some()
    }

    pub fn memory(&self) -> Option<SecureWorldMemory> {
        self.memory
    }

    pub(crate) fn activate(&mut self, memory: SecureWorldMemory) {
        self.memory = Some(memory);
    }

    /// Whether a context is saved in the snapshot slot.
    pub fn is_ctx_saved(&self) -> bool {
        self.ctx_saved
    }

    /// Forget the secure world and the saved context.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn check_vcpu(vcpu: &VCpu) -> AxResult {
        if !vcpu.is_bsp() {
            return ax_err!(
                PermissionDenied,
                format!("VM{} vCPU{} is not the BSP", vcpu.vm_id(), vcpu.id())
            );
        }
        Ok(())
    }

    /// Save the `world` context of `vcpu` into the snapshot slot, overwriting any previous one.
    pub fn save_context(&mut self, vcpu: &VCpu, world: World) -> AxResult {
        Self::check_vcpu(vcpu)?;
        self.snapshot = vcpu.context(world);
        self.ctx_saved = true;
        Ok(())
    }

    /// Restore the snapshot into the `world` context of `vcpu`.
    pub fn restore_context(&self, vcpu: &VCpu, world: World) -> AxResult {
        Self::check_vcpu(vcpu)?;
        if !self.ctx_saved {
            return ax_err!(BadState, "no secure world snapshot saved");
        }
        vcpu.set_context(world, self.snapshot);
        Ok(())
    }

    /// Switch `vcpu` to `next`.
    ///
    /// Entering the secure world saves the normal-world context, leaving it restores that
    /// context. Switching to the current world does nothing.
    pub fn switch_world(&mut self, vcpu: &VCpu, next: World) -> AxResult {
        if !self.is_active() {
            return ax_err!(BadState, "secure world is not active");
        }
        Self::check_vcpu(vcpu)?;
        if vcpu.world() == next {
            return Ok(());
        }
        match next {
            World::Secure => self.save_context(vcpu, World::Normal)?,
            World::Normal => self.restore_context(vcpu, World::Normal)?,
        }
        vcpu.set_world(next);
        debug!("VM{} vCPU{} switched to {:?} world", vcpu.vm_id(), vcpu.id(), next);
        Ok(())
    }
}

impl Default for SecureWorldControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn active_control() -> SecureWorldControl {
        let mut control = SecureWorldControl::new();
        control.activate(SecureWorldMemory {
            base_gpa_in_normal: GuestPhysAddr::from_usize(0x1000_0000),
            base_hpa: HostPhysAddr::from_usize(0x9000_0000),
            length: 0x100_0000,
        });
        control
    }

    #[test]
    fn test_snapshot_round_trip() {
        let vcpu = VCpu::new(0, 0, 0, true);
        vcpu.with_context_mut(World::Normal, |ctx| {
            ctx.regs.rax = 0xdead_beef;
            ctx.regs.r15 = u64::MAX;
            ctx.rip = 0xffff_ffff_8100_0000;
            ctx.cr3 = 0x1234_5000;
            ctx.cs.selector = 0x10;
        });
        let saved = vcpu.context(World::Normal);

        let mut control = SecureWorldControl::new();
        control.save_context(&vcpu, World::Normal).unwrap();
        vcpu.set_context(World::Normal, CpuContext::reset_state());
        control.restore_context(&vcpu, World::Normal).unwrap();

        assert_eq!(vcpu.context(World::Normal), saved);
    }

    #[test]
    fn test_snapshot_is_overwritten() {
        let vcpu = VCpu::new(0, 0, 0, true);
        let mut control = SecureWorldControl::new();

        vcpu.with_context_mut(World::Normal, |ctx| ctx.rip = 1);
        control.save_context(&vcpu, World::Normal).unwrap();
        vcpu.with_context_mut(World::Normal, |ctx| ctx.rip = 2);
        control.save_context(&vcpu, World::Normal).unwrap();

        vcpu.with_context_mut(World::Normal, |ctx| ctx.rip = 3);
        control.restore_context(&vcpu, World::Normal).unwrap();
        assert_eq!(vcpu.context(World::Normal).rip, 2);
    }

    #[test]
    fn test_switch_world() {
        let bsp = VCpu::new(0, 0, 0, true);
        let mut control = active_control();

        bsp.with_context_mut(World::Normal, |ctx| ctx.rip = 0x8000);
        control.switch_world(&bsp, World::Secure).unwrap();
        assert_eq!(bsp.world(), World::Secure);

        // secure world code clobbers the normal context the hardware would have loaded
        bsp.with_context_mut(World::Normal, |ctx| ctx.rip = 0);
        control.switch_world(&bsp, World::Normal).unwrap();
        assert_eq!(bsp.world(), World::Normal);
        assert_eq!(bsp.context(World::Normal).rip, 0x8000);
    }

    #[test]
    fn test_switch_rejected() {
        let ap = VCpu::new(0, 1, 1, false);
        let bsp = VCpu::new(0, 0, 0, true);

        let mut inactive = SecureWorldControl::new();
        assert_eq!(
            inactive.switch_world(&bsp, World::Secure),
            Err(AxError::BadState)
        );

        let mut control = active_control();
        assert_eq!(
            control.switch_world(&ap, World::Secure),
            Err(AxError::PermissionDenied)
        );
        assert_eq!(ap.world(), World::Normal);
        assert_eq!(
            control.restore_context(&bsp, World::Normal),
            Err(AxError::BadState)
        );
    }
}
