//! Mode-aware register context.
//!
//! A [`RegisterContext`] is the unit the harness loads into the CPU before a
//! scenario and the unit a [`crate::TrapFrame`] captures afterwards. Contexts
//! under construction may temporarily violate the CPL == CS.RPL invariant;
//! [`RegisterContext::is_consistent`] is the finalization check drivers apply
//! before injection.

use crate::flags::RFLAGS_RESERVED1;
use crate::mode::{CpuMode, Width};
use crate::selector::Selector;

/// GPR indices into [`RegisterContext::gpr`].
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
}

/// Segment register slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SegReg::Es => "es",
            SegReg::Cs => "cs",
            SegReg::Ss => "ss",
            SegReg::Ds => "ds",
            SegReg::Fs => "fs",
            SegReg::Gs => "gs",
        }
    }
}

/// Mode-aware snapshot of architectural state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    pub gpr: [u64; 16],
    rip: u64,
    rflags: u64,
    seg: [Selector; 6],
    pub cpl: u8,
    pub cr0: u64,
    pub cr2: u64,
    pub mode: CpuMode,
}

impl RegisterContext {
    pub fn new(mode: CpuMode) -> Self {
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFLAGS_RESERVED1,
            seg: [Selector::NULL; 6],
            cpl: 0,
            cr0: 0,
            cr2: 0,
            mode,
        }
    }

    pub fn width(&self) -> Width {
        self.mode.width()
    }

    pub fn rip(&self) -> u64 {
        self.rip & self.mode.width().ip_mask()
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip & self.mode.width().ip_mask();
    }

    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    pub fn set_rflags(&mut self, flags: u64) {
        // Bit 1 is always set.
        self.rflags = flags | RFLAGS_RESERVED1;
    }

    pub fn set_flag(&mut self, mask: u64, val: bool) {
        if val {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    pub fn get_flag(&self, mask: u64) -> bool {
        (self.rflags & mask) != 0
    }

    pub fn seg(&self, reg: SegReg) -> Selector {
        self.seg[reg as usize]
    }

    pub fn set_seg(&mut self, reg: SegReg, sel: Selector) {
        self.seg[reg as usize] = sel;
    }

    pub fn stack_ptr(&self) -> u64 {
        self.gpr[gpr::RSP] & self.width().ip_mask()
    }

    pub fn set_stack_ptr(&mut self, val: u64) {
        let mask = self.width().ip_mask();
        self.gpr[gpr::RSP] = (self.gpr[gpr::RSP] & !mask) | (val & mask);
    }

    /// Rewrite CS/SS/DS/ES RPLs and the CPL to simulate "this code was
    /// running at ring `ring`" without executing a ring transition.
    ///
    /// Real mode and V8086 have no rings; the call is a no-op there.
    pub fn convert_to_ring(&mut self, ring: u8) {
        if !self.mode.is_protected() {
            return;
        }
        for reg in [SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Es] {
            let sel = self.seg(reg);
            if !sel.is_null() {
                self.set_seg(reg, sel.with_rpl(ring));
            }
        }
        self.cpl = ring;
    }

    /// Finalization invariant for a valid resting state: CPL matches the RPL
    /// encoded in CS (protected modes), or is 3 in V8086 and 0 in real mode.
    pub fn is_consistent(&self) -> bool {
        match self.mode {
            CpuMode::Real => self.cpl == 0,
            CpuMode::Vm86 => self.cpl == 3,
            _ => self.cpl == self.seg(SegReg::Cs).rpl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rip_masked_by_mode_width() {
        let mut ctx = RegisterContext::new(CpuMode::Prot16);
        ctx.set_rip(0x12_3456);
        assert_eq!(ctx.rip(), 0x3456);

        let mut ctx = RegisterContext::new(CpuMode::Long64);
        ctx.set_rip(0xFFFF_8000_0000_0000);
        assert_eq!(ctx.rip(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn convert_to_ring_rewrites_rpls() {
        let mut ctx = RegisterContext::new(CpuMode::Prot32);
        ctx.set_seg(SegReg::Cs, Selector(0x08));
        ctx.set_seg(SegReg::Ss, Selector(0x10));
        ctx.set_seg(SegReg::Ds, Selector(0x10));
        ctx.convert_to_ring(3);
        assert_eq!(ctx.seg(SegReg::Cs), Selector(0x0B));
        assert_eq!(ctx.seg(SegReg::Ss), Selector(0x13));
        assert_eq!(ctx.cpl, 3);
        assert!(ctx.is_consistent());
    }

    #[test]
    fn convert_to_ring_skips_null_and_real_mode() {
        let mut ctx = RegisterContext::new(CpuMode::Prot32);
        ctx.set_seg(SegReg::Cs, Selector(0x08));
        ctx.set_seg(SegReg::Es, Selector::NULL);
        ctx.convert_to_ring(2);
        assert_eq!(ctx.seg(SegReg::Es), Selector::NULL);

        let mut real = RegisterContext::new(CpuMode::Real);
        real.set_seg(SegReg::Cs, Selector(0x1234));
        real.convert_to_ring(3);
        assert_eq!(real.seg(SegReg::Cs), Selector(0x1234));
        assert_eq!(real.cpl, 0);
    }

    #[test]
    fn stack_ptr_width() {
        let mut ctx = RegisterContext::new(CpuMode::Prot16);
        ctx.gpr[gpr::RSP] = 0xAAAA_BBBB_CCCC_DDDD;
        assert_eq!(ctx.stack_ptr(), 0xDDDD);
        ctx.set_stack_ptr(0x1_0100);
        assert_eq!(ctx.stack_ptr(), 0x0100);
        // Upper bits untouched at W16.
        assert_eq!(ctx.gpr[gpr::RSP] >> 16, 0xAAAA_BBBB_CCCC);
    }
}
