// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVMM - VM resource management for a bare-metal hypervisor.
//!
//! This crate owns the authoritative representation of every guest VM: its virtual CPUs,
//! its two-stage (EPT) translation hierarchies, the hardware-visible interception bitmaps,
//! its secure world and its lifecycle state. It exposes the operations that create, prepare,
//! start, pause, resume, reset and shut down a VM.
//!
//! # Features
//!
//! - Fixed-capacity VM registry with atomic identifier allocation
//! - VM state machine (Unknown → Created → Started ⇄ Paused)
//! - Normal-world and secure-world EPT hierarchies with asymmetric visibility
//! - Page-aligned I/O and MSR interception bitmaps
//! - Static configuration table sanitation
//! - Partition-mode static device tables (`partition` feature)
//!
//! Everything below the VM model (instruction emulation, device behaviour, IOMMU programming,
//! actually running a vcpu) is reached through the [`VmHal`] trait.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod address_space; // Normal-world and secure-world EPT hierarchies of a VM
mod bitmap; // Page-aligned I/O and MSR interception bitmaps
mod config; // Static VM configuration table and its sanitation
mod context; // Saved register context of a vcpu
mod cpuid; // Per-VM virtual CPUID table
mod devices; // Storage slots of the emulated devices
mod e820; // Guest physical memory map
mod ept; // Two-stage translation hierarchy
mod hal; // Hardware abstraction layer interfaces
mod partition; // Static device tables for partition mode
mod registry; // VM registry, identifier allocator and launch path
mod secure_world; // Secure world control block and world switch
mod vcpu; // Virtual CPUs and their lookups
mod vm; // The VM instance and its state machine


// Public API exports
pub use address_space::VmAddressSpace;
pub use bitmap::{IoBitmap, MsrBitmap, MsrIntercept};
pub use config::*;
pub use context::{CpuContext, GuestRegisters, SegmentSel};
pub use cpuid::{CpuidEntry, CpuidTable, CPUID_CHECK_SUBLEAF, MAX_VM_VCPUID_ENTRIES};
pub use devices::{MmioRegion, PciVdev, SoftirqDevEntry, VIoapic, VPci, VPicWireMode, VUart};
pub use e820::{E820Entry, E820Type};
pub use ept::{EptFlags, EptHierarchy};
pub use hal::{HostPmData, IommuDomain, VmHal};
pub use partition::*;
pub use registry::VmRegistry;
pub use secure_world::{SecureWorldControl, SecureWorldMemory, World, TRUSTY_EPT_REBASE_GPA};
pub use vcpu::{VCpu, VCpuRef, VCpuSet, VCpuState};
pub use vm::{GuestKernelType, KernelInfo, LinuxInfo, Vm, VmPmInfo, VmRef, VmState, VmSwInfo};

use memory_addr::{PhysAddr, VirtAddr};

memory_addr::def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;

/// Identifier of a VM, dense over `[0, CONFIG_MAX_VM_NUM)`.
pub type VmId = usize;
/// Identifier of a vcpu inside its VM.
pub type VCpuId = usize;

/// The "no such VM" sentinel returned by [`VmRegistry::find_free_vm_id`].
pub const INVALID_VM_ID: VmId = 0xffff;

/// Size of a 4K page.
pub const PAGE_SIZE: usize = memory_addr::PAGE_SIZE_4K;
