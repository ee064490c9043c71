//! CPU operating modes and operand widths.
//!
//! Modes carry a stable `u8` encoding because the public entry points are
//! `fn(u8) -> u8` linked into the surrounding test kit. The low nibble is the
//! code bitness, the high nibble the system environment, so helpers like
//! [`CpuMode::is_paged`] are cheap mask tests.

/// Operand/stack-frame width of the code currently under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bitness(self) -> u32 {
        match self {
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    /// Size in bytes of one stack slot (push/pop unit) at this width.
    pub fn slot_bytes(self) -> u64 {
        match self {
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub fn ip_mask(self) -> u64 {
        match self {
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
            Width::W64 => u64::MAX,
        }
    }

    /// Byte length of the SIDT/SGDT/LIDT/LGDT memory operand at this width.
    ///
    /// 16- and 32-bit code use the 6-byte limit+base32 image; 64-bit code uses
    /// the 10-byte limit+base64 image.
    pub fn table_image_len(self) -> usize {
        match self {
            Width::W16 | Width::W32 => 6,
            Width::W64 => 10,
        }
    }
}

const CODE_16: u8 = 0x01;
const CODE_32: u8 = 0x02;
const CODE_64: u8 = 0x04;
const CODE_V86: u8 = 0x08;

const SYS_RM: u8 = 0x00;
const SYS_PE: u8 = 0x10;
const SYS_PP: u8 = 0x30;
const SYS_LM: u8 = 0x70;

/// CPU operating mode for one conformance scenario.
///
/// Protected mode is split into unpaged (`Prot*`) and paged (`Paged*`)
/// variants because paged-ness decides whether the boundary axis enumerates
/// page faults at all. Long mode is always paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Vm86,
    Prot16,
    Prot32,
    Paged16,
    Paged32,
    Long16,
    Long32,
    Long64,
}

impl CpuMode {
    pub const ALL: [CpuMode; 9] = [
        CpuMode::Real,
        CpuMode::Vm86,
        CpuMode::Prot16,
        CpuMode::Prot32,
        CpuMode::Paged16,
        CpuMode::Paged32,
        CpuMode::Long16,
        CpuMode::Long32,
        CpuMode::Long64,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            x if x == CpuMode::Real.raw() => CpuMode::Real,
            x if x == CpuMode::Vm86.raw() => CpuMode::Vm86,
            x if x == CpuMode::Prot16.raw() => CpuMode::Prot16,
            x if x == CpuMode::Prot32.raw() => CpuMode::Prot32,
            x if x == CpuMode::Paged16.raw() => CpuMode::Paged16,
            x if x == CpuMode::Paged32.raw() => CpuMode::Paged32,
            x if x == CpuMode::Long16.raw() => CpuMode::Long16,
            x if x == CpuMode::Long32.raw() => CpuMode::Long32,
            x if x == CpuMode::Long64.raw() => CpuMode::Long64,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u8 {
        match self {
            CpuMode::Real => SYS_RM | CODE_16,
            CpuMode::Vm86 => SYS_PE | CODE_V86,
            CpuMode::Prot16 => SYS_PE | CODE_16,
            CpuMode::Prot32 => SYS_PE | CODE_32,
            CpuMode::Paged16 => SYS_PP | CODE_16,
            CpuMode::Paged32 => SYS_PP | CODE_32,
            CpuMode::Long16 => SYS_LM | CODE_16,
            CpuMode::Long32 => SYS_LM | CODE_32,
            CpuMode::Long64 => SYS_LM | CODE_64,
        }
    }

    /// Width of the code segment scenarios execute in.
    pub fn width(self) -> Width {
        match self {
            CpuMode::Real | CpuMode::Vm86 | CpuMode::Prot16 | CpuMode::Paged16 | CpuMode::Long16 => {
                Width::W16
            }
            CpuMode::Prot32 | CpuMode::Paged32 | CpuMode::Long32 => Width::W32,
            CpuMode::Long64 => Width::W64,
        }
    }

    pub fn is_paged(self) -> bool {
        matches!(
            self,
            CpuMode::Paged16 | CpuMode::Paged32 | CpuMode::Long16 | CpuMode::Long32 | CpuMode::Long64
        )
    }

    pub fn is_long(self) -> bool {
        matches!(self, CpuMode::Long16 | CpuMode::Long32 | CpuMode::Long64)
    }

    /// 64-bit code segment: segmentation is mostly off, canonical checks on.
    pub fn is_64bit_code(self) -> bool {
        self == CpuMode::Long64
    }

    /// Real mode and V8086 share descriptor-free segment semantics.
    pub fn is_real_or_v86(self) -> bool {
        matches!(self, CpuMode::Real | CpuMode::Vm86)
    }

    pub fn is_v86(self) -> bool {
        self == CpuMode::Vm86
    }

    /// Whether descriptor-table protection checks apply to transfers.
    pub fn is_protected(self) -> bool {
        !self.is_real_or_v86()
    }

    pub fn label(self) -> &'static str {
        match self {
            CpuMode::Real => "rm",
            CpuMode::Vm86 => "v86",
            CpuMode::Prot16 => "pe16",
            CpuMode::Prot32 => "pe32",
            CpuMode::Paged16 => "pp16",
            CpuMode::Paged32 => "pp32",
            CpuMode::Long16 => "lm16",
            CpuMode::Long32 => "lm32",
            CpuMode::Long64 => "lm64",
        }
    }
}

pub fn mask_bits(bits: u32) -> u64 {
    match bits {
        16 => 0xFFFF,
        32 => 0xFFFF_FFFF,
        64 => u64::MAX,
        _ => (1u64 << bits) - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for mode in CpuMode::ALL {
            assert_eq!(CpuMode::from_raw(mode.raw()), Some(mode), "{mode:?}");
        }
        assert_eq!(CpuMode::from_raw(0x00), None);
        assert_eq!(CpuMode::from_raw(0xFF), None);
    }

    #[test]
    fn long_modes_are_paged() {
        for mode in [CpuMode::Long16, CpuMode::Long32, CpuMode::Long64] {
            assert!(mode.is_paged());
            assert!(mode.is_long());
        }
        assert!(!CpuMode::Prot32.is_paged());
        assert!(CpuMode::Paged32.is_paged());
    }

    #[test]
    fn table_image_lengths() {
        assert_eq!(Width::W16.table_image_len(), 6);
        assert_eq!(Width::W32.table_image_len(), 6);
        assert_eq!(Width::W64.table_image_len(), 10);
    }
}
