/// Type of an E820 region.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
    AcpiReclaim = 3,
    AcpiNvs = 4,
    Unusable = 5,
}

/// One region of a guest physical memory map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct E820Entry {
    pub base: u64,
    pub length: u64,
    pub ty: E820Type,
}

impl E820Entry {
    pub const fn new(base: u64, length: u64, ty: E820Type) -> Self {
        Self { base, length, ty }
    }

    /// One past the last byte of the region.
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Top of the RAM below 4G described by `entries`.
pub(crate) fn lowmem_top(entries: &[E820Entry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.ty == E820Type::Ram && e.end() <= 1 << 32)
        .map(|e| e.end())
        .max()
        .unwrap_or(0)
}
