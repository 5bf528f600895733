//! Interception bitmaps consumed by the virtualization hardware.
//!
//! Both bitmaps are referenced by physical page address from the VMCS, so they are
//! page-aligned and allocated once per VM; they must not move after the VM is started.

use alloc::boxed::Box;

use crate::{HostPhysAddr, HostVirtAddr, VmHal, PAGE_SIZE};

/// I/O bitmaps A (ports `0x0000..=0x7fff`) and B (ports `0x8000..=0xffff`).
///
/// A set bit makes an access to the port exit to the hypervisor.
#[repr(C, align(4096))]
pub struct IoBitmap([u8; PAGE_SIZE * 2]);

const _: () = assert!(core::mem::size_of::<IoBitmap>() == PAGE_SIZE * 2);

impl IoBitmap {
    /// A bitmap trapping every port.
    pub fn new_trap_all() -> Box<Self> {
        Box::new(Self([0xff; PAGE_SIZE * 2]))
    }

    /// A bitmap passing every port through.
    pub fn new_passthrough() -> Box<Self> {
        Box::new(Self([0; PAGE_SIZE * 2]))
    }

    fn set_range(&mut self, port: u16, count: u32, intercept: bool) {
        let start = port as u32;
        let end = start.saturating_add(count).min(0x1_0000);
        for p in start..end {
            let (byte, bit) = ((p / 8) as usize, p % 8);
            if intercept {
                self.0[byte] |= 1 << bit;
            } else {
                self.0[byte] &= !(1 << bit);
            }
        }
    }

    /// Trap accesses to `count` ports starting at `port`.
    pub fn intercept(&mut self, port: u16, count: u32) {
        self.set_range(port, count, true);
    }

    /// Pass accesses to `count` ports starting at `port` through to the hardware.
    pub fn allow(&mut self, port: u16, count: u32) {
        self.set_range(port, count, false);
    }

    /// Whether accesses to `port` are trapped.
    pub fn is_intercepted(&self, port: u16) -> bool {
        self.0[port as usize / 8] & (1 << (port % 8)) != 0
    }

    /// Physical addresses of bitmap A and bitmap B.
    pub fn paddrs<H: VmHal>(&self) -> (HostPhysAddr, HostPhysAddr) {
        let a = H::virt_to_phys(HostVirtAddr::from_usize(self.0.as_ptr() as usize));
        (a, a + PAGE_SIZE)
    }
}

/// Which accesses of an MSR are trapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrIntercept {
    /// Neither reads nor writes.
    None,
    /// Reads only.
    Read,
    /// Writes only.
    Write,
    /// Reads and writes.
    ReadWrite,
}

/// MSR bitmap: read-low, read-high, write-low and write-high quarters of 1K each.
///
/// "Low" covers MSRs `0x0000_0000..=0x0000_1fff`, "high" covers `0xc000_0000..=0xc000_1fff`.
/// MSRs outside both ranges always exit.
#[repr(C, align(4096))]
pub struct MsrBitmap([u8; PAGE_SIZE]);

const _: () = assert!(core::mem::size_of::<MsrBitmap>() == PAGE_SIZE);

impl MsrBitmap {
    const QUARTER: usize = PAGE_SIZE / 4;

    /// A bitmap trapping nothing.
    pub fn new() -> Box<Self> {
        Box::new(Self([0; PAGE_SIZE]))
    }

    /// Byte offset and bit of `msr` in the read quarters, `None` if the MSR is not covered.
    fn locate(msr: u32) -> Option<(usize, u8)> {
        let (base, index) = match msr {
            0x0000_0000..=0x0000_1fff => (0, msr),
            0xc000_0000..=0xc000_1fff => (Self::QUARTER, msr - 0xc000_0000),
            _ => return None,
        };
        Some((base + (index / 8) as usize, (index % 8) as u8))
    }

    /// Set how `msr` is trapped. Uncovered MSRs are ignored since they always exit.
    pub fn set(&mut self, msr: u32, mode: MsrIntercept) {
        let Some((offset, bit)) = Self::locate(msr) else {
            return;
        };
        let (read, write) = match mode {
            MsrIntercept::None => (false, false),
            MsrIntercept::Read => (true, false),
            MsrIntercept::Write => (false, true),
            MsrIntercept::ReadWrite => (true, true),
        };
        for (offset, on) in [(offset, read), (offset + Self::QUARTER * 2, write)] {
            if on {
                self.0[offset] |= 1 << bit;
            } else {
                self.0[offset] &= !(1 << bit);
            }
        }
    }

    /// Set how every MSR in `first..=last` is trapped.
    pub fn set_range(&mut self, first: u32, last: u32, mode: MsrIntercept) {
        for msr in first..=last {
            self.set(msr, mode);
        }
    }

    /// How `msr` is trapped.
    pub fn get(&self, msr: u32) -> MsrIntercept {
        let Some((offset, bit)) = Self::locate(msr) else {
            return MsrIntercept::ReadWrite;
        };
        let read = self.0[offset] & (1 << bit) != 0;
        let write = self.0[offset + Self::QUARTER * 2] & (1 << bit) != 0;
        match (read, write) {
            (false, false) => MsrIntercept::None,
            (true, false) => MsrIntercept::Read,
            (false, true) => MsrIntercept::Write,
            (true, true) => MsrIntercept::ReadWrite,
        }
    }

    /// Physical address of the bitmap.
    pub fn paddr<H: VmHal>(&self) -> HostPhysAddr {
        H::virt_to_phys(HostVirtAddr::from_usize(self.0.as_ptr() as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockHal;

    #[test]
    fn test_bitmaps_are_page_aligned() {
        let io = IoBitmap::new_trap_all();
        let msr = MsrBitmap::new();
        let (a, b) = io.paddrs::<MockHal>();
        assert_eq!(a.as_usize() % PAGE_SIZE, 0);
        assert_eq!(b.as_usize() - a.as_usize(), PAGE_SIZE);
        assert_eq!(msr.paddr::<MockHal>().as_usize() % PAGE_SIZE, 0);
    }

    #[test]
    fn test_io_bitmap_ranges() {
        let mut io = IoBitmap::new_passthrough();
        assert!(!io.is_intercepted(0x3f8));
        io.intercept(0x3f8, 8);
        assert!(io.is_intercepted(0x3f8));
        assert!(io.is_intercepted(0x3ff));
        assert!(!io.is_intercepted(0x400));

        let mut io = IoBitmap::new_trap_all();
        io.allow(0xfff0, 0x100);
        assert!(io.is_intercepted(0xffef));
        assert!(!io.is_intercepted(0xffff));

        // counts past the end of the port space are clamped
        io.intercept(0xfff0, u32::MAX);
        assert!(io.is_intercepted(0xfff0));
        assert!(io.is_intercepted(0xffff));
        io.allow(0, u32::MAX);
        assert!(!io.is_intercepted(0));
        assert!(!io.is_intercepted(0xffff));
    }

    #[test]
    fn test_msr_bitmap_quarters() {
        let mut msr = MsrBitmap::new();
        msr.set(0x6e0, MsrIntercept::ReadWrite);
        msr.set(0xc000_0080, MsrIntercept::Write);
        assert_eq!(msr.get(0x6e0), MsrIntercept::ReadWrite);
        assert_eq!(msr.get(0xc000_0080), MsrIntercept::Write);
        assert_eq!(msr.get(0x6e1), MsrIntercept::None);
        // not covered by the bitmap, always exits
        assert_eq!(msr.get(0x4000_0000), MsrIntercept::ReadWrite);

        msr.set(0x6e0, MsrIntercept::None);
        assert_eq!(msr.get(0x6e0), MsrIntercept::None);
    }
}
