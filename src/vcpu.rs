use alloc::{sync::Arc, vec::Vec};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::{CpuContext, VCpuId, VmId, World, CONFIG_MAX_VCPUS_PER_VM};

/// The constant part of [`VCpu`].
struct VCpuInnerConst {
    /// The id of the vcpu inside its VM.
    id: VCpuId,
    /// The id of the VM owning the vcpu.
    vm_id: VmId,
    /// The physical CPU the vcpu is pinned to.
    pcpu_id: usize,
    /// Whether the vcpu is the bootstrap processor of its VM.
    is_bsp: bool,
}

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// The vcpu is released, it will never run again.
    Offline = 0,
    /// The vcpu is created but has not run yet.
    Init = 1,
    /// The vcpu is runnable on its physical CPU.
    Running = 2,
    /// The vcpu is paused and can be resumed.
    Paused = 3,
    /// The vcpu is paused waiting for its VM to be reset or shut down.
    Zombie = 4,
}

/// The mutable part of [`VCpu`].
struct VCpuInnerMut {
    /// The state of the vcpu.
    state: VCpuState,
    /// The world the vcpu currently executes in.
    world: World,
    /// Register context of each world.
    contexts: [CpuContext; 2],
}

/// A virtual CPU as seen by the VM resource manager.
///
/// Execution itself happens below this crate. A vcpu here is the identity (id, physical CPU,
/// BSP flag, owning VM), the state machine and the saved register contexts.
///
/// All the methods take `&self`, the mutable part is protected by a spinlock.
pub struct VCpu {
    /// The constant part of the vcpu.
    inner_const: VCpuInnerConst,
    /// The mutable part of the vcpu.
    inner_mut: Mutex<VCpuInnerMut>,
}

/// A reference to a vcpu.
pub type VCpuRef = Arc<VCpu>;

impl VCpu {
    /// Create a new [`VCpu`] in [`VCpuState::Init`].
    pub fn new(vm_id: VmId, id: VCpuId, pcpu_id: usize, is_bsp: bool) -> Self {
        Self {
            inner_const: VCpuInnerConst {
                id,
                vm_id,
                pcpu_id,
                is_bsp,
            },
            inner_mut: Mutex::new(VCpuInnerMut {
                state: VCpuState::Init,
                world: World::Normal,
                contexts: [CpuContext::reset_state(); 2],
            }),
        }
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> VCpuId {
        self.inner_const.id
    }

    /// Get the id of the VM owning the vcpu.
    pub const fn vm_id(&self) -> VmId {
        self.inner_const.vm_id
    }

    /// Get the id of the physical CPU the vcpu runs on.
    pub const fn pcpu_id(&self) -> usize {
        self.inner_const.pcpu_id
    }

    /// Get whether the vcpu is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.inner_const.is_bsp
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner_mut.lock().state
    }

    /// Execute a block with the state of the vcpu transitioned from one of `from` to `to`.
    ///
    /// If the current state is not in `from`, nothing is executed and an error is returned.
    /// The state is set to `to` only if the block succeeds.
    pub fn with_state_transition<F, T>(&self, from: &[VCpuState], to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.lock();
        if !from.contains(&inner_mut.state) {
            ax_err!(
                BadState,
                format!(
                    "VM{} vCPU{} state is not {:?}, but {:?}",
                    self.vm_id(),
                    self.id(),
                    from,
                    inner_mut.state
                )
            )
        } else {
            let result = f();
            if result.is_ok() {
                inner_mut.state = to;
            }
            result
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(&[from], to, || Ok(()))
    }

    /// The world the vcpu executes in.
    pub fn world(&self) -> World {
        self.inner_mut.lock().world
    }

    pub(crate) fn set_world(&self, world: World) {
        self.inner_mut.lock().world = world;
    }

    /// A copy of the register context of `world`.
    pub fn context(&self, world: World) -> CpuContext {
        self.inner_mut.lock().contexts[world as usize]
    }

    /// Overwrite the register context of `world`.
    pub fn set_context(&self, world: World, context: CpuContext) {
        self.inner_mut.lock().contexts[world as usize] = context;
    }

    /// Modify the register context of `world` in place.
    pub fn with_context_mut<F, T>(&self, world: World, f: F) -> T
    where
        F: FnOnce(&mut CpuContext) -> T,
    {
        f(&mut self.inner_mut.lock().contexts[world as usize])
    }

    /// Discard all volatile state: back to [`VCpuState::Init`] in the normal world with
    /// power-on registers.
    pub fn reset(&self) {
        let mut inner_mut = self.inner_mut.lock();
        inner_mut.state = VCpuState::Init;
        inner_mut.world = World::Normal;
        inner_mut.contexts = [CpuContext::reset_state(); 2];
    }
}

/// The vcpus of a VM, at most [`CONFIG_MAX_VCPUS_PER_VM`], in creation order.
#[derive(Default)]
pub struct VCpuSet {
    vcpus: Vec<VCpuRef>,
}

impl VCpuSet {
    /// An empty set with room for every vcpu a VM may have.
    pub fn new() -> Self {
        Self {
            vcpus: Vec::with_capacity(CONFIG_MAX_VCPUS_PER_VM),
        }
    }

    /// Append a vcpu.
    ///
    /// Fails if the set is full, if the id is already taken or if a second BSP is added.
    pub fn push(&mut self, vcpu: VCpuRef) -> AxResult {
        if self.vcpus.len() >= CONFIG_MAX_VCPUS_PER_VM {
            return ax_err!(NoMemory, "too many vcpus");
        }
        if self.vcpu_from_vid(vcpu.id()).is_some() {
            return ax_err!(AlreadyExists, format!("vCPU{} already exists", vcpu.id()));
        }
        if vcpu.is_bsp() && self.get_primary_vcpu().is_some() {
            return ax_err!(AlreadyExists, "BSP already exists");
        }
        self.vcpus.push(vcpu);
        Ok(())
    }

    /// Number of vcpus.
    pub fn len(&self) -> usize {
        self.vcpus.len()
    }

    /// Whether there is no vcpu.
    pub fn is_empty(&self) -> bool {
        self.vcpus.is_empty()
    }

    /// Iterate over the vcpus in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &VCpuRef> {
        self.vcpus.iter()
    }

    /// The first vcpu with the given id.
    pub fn vcpu_from_vid(&self, vcpu_id: VCpuId) -> Option<&VCpuRef> {
        self.vcpus.iter().find(|vcpu| vcpu.id() == vcpu_id)
    }

    /// The first vcpu pinned to the given physical CPU.
    pub fn vcpu_from_pid(&self, pcpu_id: usize) -> Option<&VCpuRef> {
        self.vcpus.iter().find(|vcpu| vcpu.pcpu_id() == pcpu_id)
    }

    /// The BSP.
    pub fn get_primary_vcpu(&self) -> Option<&VCpuRef> {
        self.vcpus.iter().find(|vcpu| vcpu.is_bsp())
    }

    /// Remove every vcpu, returning them.
    pub fn take_all(&mut self) -> Vec<VCpuRef> {
        core::mem::take(&mut self.vcpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn two_vcpus() -> VCpuSet {
        let mut set = VCpuSet::new();
        set.push(Arc::new(VCpu::new(1, 0, 2, true))).unwrap();
        set.push(Arc::new(VCpu::new(1, 1, 3, false))).unwrap();
        set
    }

    #[test]
    fn test_lookups() {
        let set = two_vcpus();

        let vcpu = set.vcpu_from_vid(1).unwrap();
        assert_eq!((vcpu.id(), vcpu.pcpu_id()), (1, 3));

        let vcpu = set.vcpu_from_pid(2).unwrap();
        assert_eq!(vcpu.id(), 0);

        let bsp = set.get_primary_vcpu().unwrap();
        assert_eq!(bsp.id(), 0);
        assert!(bsp.is_bsp());

        assert!(set.vcpu_from_vid(5).is_none());
        assert!(set.vcpu_from_pid(7).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let mut set = VCpuSet::new();
        set.push(Arc::new(VCpu::new(1, 0, 4, true))).unwrap();
        set.push(Arc::new(VCpu::new(1, 1, 4, false))).unwrap();
        assert_eq!(set.vcpu_from_pid(4).unwrap().id(), 0);
    }

    #[test]
    fn test_single_bsp() {
        let mut set = two_vcpus();
        assert_eq!(
            set.push(Arc::new(VCpu::new(1, 2, 5, true))),
            Err(AxError::AlreadyExists)
        );
        assert_eq!(
            set.push(Arc::new(VCpu::new(1, 1, 5, false))),
            Err(AxError::AlreadyExists)
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capacity() {
        let mut set = VCpuSet::new();
        for id in 0..CONFIG_MAX_VCPUS_PER_VM {
            set.push(Arc::new(VCpu::new(0, id, id, id == 0))).unwrap();
        }
        assert_eq!(
            set.push(Arc::new(VCpu::new(0, CONFIG_MAX_VCPUS_PER_VM, 0, false))),
            Err(AxError::NoMemory)
        );
    }

    #[test]
    fn test_vcpu_state_transitions() {
        let vcpu = VCpu::new(0, 0, 0, true);

        assert_eq!(vcpu.state(), VCpuState::Init);
        assert!(vcpu.transition_state(VCpuState::Init, VCpuState::Running).is_ok());
        assert_eq!(vcpu.state(), VCpuState::Running);

        // Invalid transition is rejected and leaves the state alone
        assert!(vcpu.transition_state(VCpuState::Paused, VCpuState::Running).is_err());
        assert_eq!(vcpu.state(), VCpuState::Running);

        // A failing block does not change the state
        let result: AxResult = vcpu.with_state_transition(&[VCpuState::Running], VCpuState::Paused, || {
            Err(AxError::Unsupported)
        });
        assert!(result.is_err());
        assert_eq!(vcpu.state(), VCpuState::Running);
    }

    #[test]
    fn test_vcpu_reset() {
        let vcpu = VCpu::new(0, 0, 0, true);
        vcpu.with_context_mut(World::Normal, |ctx| ctx.rip = 0x1234);
        vcpu.set_world(World::Secure);
        vcpu.transition_state(VCpuState::Init, VCpuState::Running).unwrap();

        vcpu.reset();
        assert_eq!(vcpu.state(), VCpuState::Init);
        assert_eq!(vcpu.world(), World::Normal);
        assert_eq!(vcpu.context(World::Normal), CpuContext::reset_state());
    }
}
