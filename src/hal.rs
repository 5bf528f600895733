use axerrno::AxResult;

use crate::{HostPhysAddr, HostVirtAddr, VCpuId, VmConfig, VmId, VmSwInfo};

/// Opaque handle of an IOMMU domain, owned by the IOMMU management module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IommuDomain(pub usize);

/// Power-state data of the host, handed to the Service OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostPmData {
    /// Number of valid Px states.
    pub px_cnt: u8,
    /// Number of valid Cx states.
    pub cx_cnt: u8,
    /// Host physical address of the S3/S5 data.
    pub sx_state_data: Option<HostPhysAddr>,
}

/// The interfaces which the underlying software (hypervisor platform layer) must implement.
///
/// Everything this crate needs from below (address translation, host CPUID, IOMMU domains,
/// image loading, actually scheduling vcpus) goes through here.
pub trait VmHal: Sized + Send + Sync + 'static {
    /// Converts a host virtual address to a host physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Executes `cpuid` on the host, returning `[eax, ebx, ecx, edx]`.
    fn cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: `cpuid` is available on every x86_64 processor.
            let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
            [r.eax, r.ebx, r.ecx, r.edx]
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (leaf, subleaf);
            [0; 4]
        }
    }

    /// Creates the IOMMU domain of a VM whose DMA is translated by `eptp`.
    fn create_iommu_domain(vm_id: VmId, eptp: u64) -> AxResult<IommuDomain>;

    /// Destroys an IOMMU domain created by [`VmHal::create_iommu_domain`].
    fn destroy_iommu_domain(domain: IommuDomain);

    /// Loads the kernel, ramdisk and boot arguments of a hypervisor-launched VM and fills
    /// the load addresses in `sw`.
    fn load_guest_image(vm_id: VmId, config: &VmConfig, sw: &mut VmSwInfo) -> AxResult {
        let _ = (vm_id, config, sw);
        Ok(())
    }

    /// Makes a vcpu runnable on its physical CPU.
    fn launch_vcpu(vm_id: VmId, vcpu_id: VCpuId, pcpu_id: usize) -> AxResult {
        let _ = (vm_id, vcpu_id, pcpu_id);
        Ok(())
    }

    /// Stops a running vcpu and waits until it is off its physical CPU.
    fn pause_vcpu(vm_id: VmId, vcpu_id: VCpuId, pcpu_id: usize) {
        let _ = (vm_id, vcpu_id, pcpu_id);
    }

    /// Makes a paused vcpu runnable again.
    fn resume_vcpu(vm_id: VmId, vcpu_id: VCpuId, pcpu_id: usize) {
        let _ = (vm_id, vcpu_id, pcpu_id);
    }

    /// Removes a vcpu from its physical CPU for good.
    fn offline_vcpu(vm_id: VmId, vcpu_id: VCpuId, pcpu_id: usize) {
        let _ = (vm_id, vcpu_id, pcpu_id);
    }

    /// Power-state data of the host, if collected.
    fn host_pm_data() -> Option<HostPmData> {
        None
    }
}
