//! Segment selectors and hardware error-code construction.

use std::fmt;

/// A raw segment selector: 13-bit table index, TI bit, 2-bit RPL.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector(pub u16);

impl Selector {
    pub const NULL: Selector = Selector(0);

    pub fn new(index: u16, ldt: bool, rpl: u8) -> Self {
        Selector((index << 3) | ((ldt as u16) << 2) | (rpl as u16 & 3))
    }

    pub fn index(self) -> u16 {
        self.0 >> 3
    }

    pub fn is_ldt(self) -> bool {
        (self.0 & 0b100) != 0
    }

    pub fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    pub fn with_rpl(self, rpl: u8) -> Self {
        Selector((self.0 & !3) | (rpl as u16 & 3))
    }

    /// Null for privilege purposes: index 0 in the GDT, any RPL.
    pub fn is_null(self) -> bool {
        (self.0 & !3) == 0 && !self.is_ldt()
    }

    /// Byte offset of the descriptor within its table.
    pub fn table_offset(self) -> u64 {
        (self.0 & !0b111) as u64
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:#06x})", self.0)
    }
}

/// Selector-format error code as pushed for #GP/#NP/#SS/#TS.
///
/// Bits 0/1 are EXT and IDT; the selector's RPL bits are replaced, the TI bit
/// and index are preserved.
pub fn selector_error_code(sel: Selector, ext: bool, idt: bool) -> u32 {
    ((sel.0 as u32) & !0b11) | ((idt as u32) << 1) | (ext as u32)
}

/// Page-fault error code bits.
pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;
pub const PF_RSVD: u32 = 1 << 3;
pub const PF_INSTR: u32 = 1 << 4;

/// #PF error code for a data access.
pub fn pf_error_code(present: bool, write: bool, user: bool) -> u32 {
    (present as u32) | ((write as u32) << 1) | ((user as u32) << 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_fields() {
        let sel = Selector::new(5, false, 3);
        assert_eq!(sel.0, 0x2B);
        assert_eq!(sel.index(), 5);
        assert_eq!(sel.rpl(), 3);
        assert!(!sel.is_ldt());
        assert_eq!(sel.table_offset(), 0x28);
    }

    #[test]
    fn null_ignores_rpl() {
        assert!(Selector(0).is_null());
        assert!(Selector(3).is_null());
        assert!(!Selector(8).is_null());
        // LDT selector 0 is not the architectural null selector.
        assert!(!Selector(0b100).is_null());
    }

    #[test]
    fn error_code_replaces_rpl() {
        let sel = Selector(0x2B);
        assert_eq!(selector_error_code(sel, false, false), 0x28);
        assert_eq!(selector_error_code(sel, true, false), 0x29);
        assert_eq!(selector_error_code(sel, false, true), 0x2A);
    }

    #[test]
    fn pf_error_code_bits() {
        assert_eq!(pf_error_code(false, true, true), PF_WRITE | PF_USER);
        assert_eq!(pf_error_code(true, false, false), PF_PRESENT);
    }
}
