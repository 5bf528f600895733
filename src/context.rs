/// General purpose registers, in the order the VM-exit stub saves them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// A segment register in VMCS form.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentSel {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: u32,
}

impl SegmentSel {
    /// A real-mode code/data segment with the given selector.
    pub const fn real_mode(selector: u16, attr: u32) -> Self {
        Self {
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            attr,
        }
    }
}

/// The complete register context of a vcpu in one world.
///
/// This is what a world switch saves and restores, so it is plain data that can be copied
/// bit for bit.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuContext {
    pub regs: GuestRegisters,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub ia32_efer: u64,
    pub ia32_pat: u64,
    pub ia32_sysenter_cs: u64,
    pub ia32_sysenter_esp: u64,
    pub ia32_sysenter_eip: u64,
    pub ia32_star: u64,
    pub ia32_lstar: u64,
    pub ia32_fmask: u64,
    pub ia32_kernel_gs_base: u64,
    pub cs: SegmentSel,
    pub ss: SegmentSel,
    pub ds: SegmentSel,
    pub es: SegmentSel,
    pub fs: SegmentSel,
    pub gs: SegmentSel,
    pub tr: SegmentSel,
    pub ldtr: SegmentSel,
    pub gdtr: SegmentSel,
    pub idtr: SegmentSel,
    pub dr7: u64,
    pub tsc_offset: u64,
}

impl CpuContext {
    /// Power-on state: real mode, executing at `0xf000:0xfff0`.
    pub const fn reset_state() -> Self {
        const DATA: u32 = 0x0093;
        Self {
            regs: GuestRegisters {
                rax: 0,
                rcx: 0,
                rdx: 0,
                rbx: 0,
                _unused_rsp: 0,
                rbp: 0,
                rsi: 0,
                rdi: 0,
                r8: 0,
                r9: 0,
                r10: 0,
                r11: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
            },
            rsp: 0,
            rip: 0xfff0,
            rflags: 0x2,
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            ia32_efer: 0,
            ia32_pat: 0x0007_0406_0007_0406,
            ia32_sysenter_cs: 0,
            ia32_sysenter_esp: 0,
            ia32_sysenter_eip: 0,
            ia32_star: 0,
            ia32_lstar: 0,
            ia32_fmask: 0,
            ia32_kernel_gs_base: 0,
            cs: SegmentSel {
                selector: 0xf000,
                base: 0xffff_0000,
                limit: 0xffff,
                attr: 0x009b,
            },
            ss: SegmentSel::real_mode(0, DATA),
            ds: SegmentSel::real_mode(0, DATA),
            es: SegmentSel::real_mode(0, DATA),
            fs: SegmentSel::real_mode(0, DATA),
            gs: SegmentSel::real_mode(0, DATA),
            tr: SegmentSel {
                selector: 0,
                base: 0,
                limit: 0xffff,
                attr: 0x008b,
            },
            ldtr: SegmentSel {
                selector: 0,
                base: 0,
                limit: 0xffff,
                attr: 0x0082,
            },
            gdtr: SegmentSel {
                selector: 0,
                base: 0,
                limit: 0xffff,
                attr: 0,
            },
            idtr: SegmentSel {
                selector: 0,
                base: 0,
                limit: 0xffff,
                attr: 0,
            },
            dr7: 0x400,
            tsc_offset: 0,
        }
    }

    /// Real-mode entry at the physical address `vector`, as used by INIT-SIPI and by the
    /// ACPI S3 waking vector.
    pub fn set_real_mode_entry(&mut self, vector: u32) {
        let selector = ((vector >> 4) & 0xffff) as u16;
        self.cs = SegmentSel::real_mode(selector, 0x009b);
        self.rip = (vector & 0xf) as u64;
    }

    /// Entry at a 64-bit guest address with the boot parameters in `rsi`, as the Linux
    /// 64-bit boot protocol expects.
    pub fn set_long_mode_entry(&mut self, entry: u64, boot_params: u64) {
        self.rip = entry;
        self.regs.rsi = boot_params;
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::reset_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_mode_entry() {
        let mut ctx = CpuContext::reset_state();
        ctx.set_real_mode_entry(0x9a_123);
        assert_eq!(ctx.cs.selector, 0x9a12);
        assert_eq!(ctx.cs.base, 0x9a120);
        assert_eq!(ctx.rip, 0x3);
        assert_eq!(ctx.cs.base + ctx.rip, 0x9a_123);
    }
}
