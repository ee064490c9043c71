//! Synthetic GDT/IDT descriptor descriptions with bit-exact hardware encoding.
//!
//! A [`DescriptorSpec`] can express any field combination, including
//! deliberately malformed ones; nothing is normalized on encode. Type codes
//! follow the hardware 4-bit type field, with `s` selecting the code/data
//! space over the system space.

use bitflags::bitflags;

use crate::selector::Selector;

bitflags! {
    /// Individual bits of the descriptor access byte (byte 5).
    ///
    /// `RW` is "writable" for data segments and "readable" for code segments;
    /// `DC` is "expand-down" for data and "conforming" for code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegAccess: u8 {
        const ACCESSED = 1 << 0;
        const RW = 1 << 1;
        const DC = 1 << 2;
        const EXEC = 1 << 3;
        const S = 1 << 4;
        const PRESENT = 1 << 7;
    }
}

/// System-descriptor type codes (S=0).
pub mod system_type {
    pub const TSS16_AVAIL: u8 = 0x1;
    pub const LDT: u8 = 0x2;
    pub const TSS16_BUSY: u8 = 0x3;
    pub const CALL_GATE16: u8 = 0x4;
    pub const TASK_GATE: u8 = 0x5;
    pub const INT_GATE16: u8 = 0x6;
    pub const TRAP_GATE16: u8 = 0x7;
    pub const TSS32_AVAIL: u8 = 0x9;
    pub const TSS32_BUSY: u8 = 0xB;
    pub const CALL_GATE32: u8 = 0xC;
    pub const INT_GATE32: u8 = 0xE;
    pub const TRAP_GATE32: u8 = 0xF;
}

/// A synthetic segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSpec {
    pub base: u32,
    /// Raw 20-bit limit field (before granularity scaling).
    pub limit: u32,
    /// 4-bit type field.
    pub type_code: u8,
    /// S bit: true = code/data, false = system.
    pub s: bool,
    pub dpl: u8,
    pub present: bool,
    /// G bit: limit is in 4 KiB units.
    pub granularity: bool,
    /// D/B bit.
    pub default_big: bool,
    /// L bit (64-bit code segment).
    pub long: bool,
    pub avl: bool,
}

impl DescriptorSpec {
    /// Non-conforming, readable code segment.
    pub fn code(base: u32, limit: u32, dpl: u8) -> Self {
        Self {
            base,
            limit,
            type_code: 0xA, // code, readable, non-conforming
            s: true,
            dpl,
            present: true,
            granularity: false,
            default_big: true,
            long: false,
            avl: false,
        }
    }

    /// Conforming, readable code segment.
    pub fn code_conforming(base: u32, limit: u32, dpl: u8) -> Self {
        Self {
            type_code: 0xE, // code, readable, conforming
            ..Self::code(base, limit, dpl)
        }
    }

    /// 64-bit code segment (L=1, D=0).
    pub fn code_long(dpl: u8) -> Self {
        Self {
            default_big: false,
            long: true,
            ..Self::code(0, 0xF_FFFF, dpl)
        }
    }

    /// Writable data segment.
    pub fn data(base: u32, limit: u32, dpl: u8) -> Self {
        Self {
            base,
            limit,
            type_code: 0x2, // data, writable
            s: true,
            dpl,
            present: true,
            granularity: false,
            default_big: true,
            long: false,
            avl: false,
        }
    }

    /// Read-only data segment.
    pub fn data_read_only(base: u32, limit: u32, dpl: u8) -> Self {
        Self {
            type_code: 0x0,
            ..Self::data(base, limit, dpl)
        }
    }

    /// Available 32-bit TSS.
    pub fn tss32(base: u32, limit: u32) -> Self {
        Self {
            base,
            limit,
            type_code: system_type::TSS32_AVAIL,
            s: false,
            dpl: 0,
            present: true,
            granularity: false,
            default_big: false,
            long: false,
            avl: false,
        }
    }

    pub fn with_present(self, present: bool) -> Self {
        Self { present, ..self }
    }

    pub fn with_dpl(self, dpl: u8) -> Self {
        Self { dpl, ..self }
    }

    pub fn with_type(self, type_code: u8, s: bool) -> Self {
        Self { type_code, s, ..self }
    }

    pub fn with_accessed(self, accessed: bool) -> Self {
        let type_code = if accessed {
            self.type_code | 1
        } else {
            self.type_code & !1
        };
        Self { type_code, ..self }
    }

    pub fn is_code(&self) -> bool {
        self.s && (self.type_code & 0x8) != 0
    }

    pub fn is_data(&self) -> bool {
        self.s && (self.type_code & 0x8) == 0
    }

    pub fn is_conforming_code(&self) -> bool {
        self.is_code() && (self.type_code & 0x4) != 0
    }

    pub fn is_readable_code(&self) -> bool {
        self.is_code() && (self.type_code & 0x2) != 0
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_data() && (self.type_code & 0x2) != 0
    }

    pub fn is_expand_down(&self) -> bool {
        self.is_data() && (self.type_code & 0x4) != 0
    }

    pub fn is_accessed(&self) -> bool {
        self.s && (self.type_code & 0x1) != 0
    }

    /// Byte-granular limit after granularity scaling.
    pub fn effective_limit(&self) -> u64 {
        let limit = (self.limit & 0xF_FFFF) as u64;
        if self.granularity {
            (limit << 12) | 0xFFF
        } else {
            limit
        }
    }

    /// Hardware 8-byte GDT/LDT encoding.
    pub fn encode(&self) -> [u8; 8] {
        let limit = self.limit & 0xF_FFFF;
        let access = (self.type_code & 0xF)
            | ((self.s as u8) << 4)
            | ((self.dpl & 3) << 5)
            | ((self.present as u8) << 7);
        let flags = ((limit >> 16) as u8 & 0xF)
            | ((self.avl as u8) << 4)
            | ((self.long as u8) << 5)
            | ((self.default_big as u8) << 6)
            | ((self.granularity as u8) << 7);
        [
            (limit & 0xFF) as u8,
            ((limit >> 8) & 0xFF) as u8,
            (self.base & 0xFF) as u8,
            ((self.base >> 8) & 0xFF) as u8,
            ((self.base >> 16) & 0xFF) as u8,
            access,
            flags,
            ((self.base >> 24) & 0xFF) as u8,
        ]
    }

    pub fn decode(raw: [u8; 8]) -> Self {
        let limit = (raw[0] as u32) | ((raw[1] as u32) << 8) | (((raw[6] & 0xF) as u32) << 16);
        let base = (raw[2] as u32)
            | ((raw[3] as u32) << 8)
            | ((raw[4] as u32) << 16)
            | ((raw[7] as u32) << 24);
        let access = raw[5];
        Self {
            base,
            limit,
            type_code: access & 0xF,
            s: (access & 0x10) != 0,
            dpl: (access >> 5) & 3,
            present: (access & 0x80) != 0,
            granularity: (raw[6] & 0x80) != 0,
            default_big: (raw[6] & 0x40) != 0,
            long: (raw[6] & 0x20) != 0,
            avl: (raw[6] & 0x10) != 0,
        }
    }
}

/// Gate type for [`GateSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Call16,
    Call32,
    Interrupt32,
    Trap32,
    Task,
}

impl GateKind {
    pub fn type_code(self) -> u8 {
        match self {
            GateKind::Call16 => system_type::CALL_GATE16,
            GateKind::Call32 => system_type::CALL_GATE32,
            GateKind::Interrupt32 => system_type::INT_GATE32,
            GateKind::Trap32 => system_type::TRAP_GATE32,
            GateKind::Task => system_type::TASK_GATE,
        }
    }
}

/// A synthetic gate descriptor (call/interrupt/trap/task).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSpec {
    pub kind: GateKind,
    pub selector: Selector,
    pub offset: u32,
    pub dpl: u8,
    pub present: bool,
    /// Call gates only: dword/word count copied on a stack switch.
    pub param_count: u8,
}

impl GateSpec {
    pub fn call32(selector: Selector, offset: u32, dpl: u8) -> Self {
        Self {
            kind: GateKind::Call32,
            selector,
            offset,
            dpl,
            present: true,
            param_count: 0,
        }
    }

    pub fn call16(selector: Selector, offset: u32, dpl: u8) -> Self {
        Self {
            kind: GateKind::Call16,
            ..Self::call32(selector, offset, dpl)
        }
    }

    pub fn with_present(self, present: bool) -> Self {
        Self { present, ..self }
    }

    pub fn with_type_code(self, kind: GateKind) -> Self {
        Self { kind, ..self }
    }

    /// Hardware 8-byte gate encoding (same layout for GDT call gates and
    /// 32-bit IDT gates).
    pub fn encode(&self) -> [u8; 8] {
        let access = self.kind.type_code()
            | ((self.dpl & 3) << 5)
            | ((self.present as u8) << 7);
        [
            (self.offset & 0xFF) as u8,
            ((self.offset >> 8) & 0xFF) as u8,
            (self.selector.0 & 0xFF) as u8,
            (self.selector.0 >> 8) as u8,
            self.param_count & 0x1F,
            access,
            ((self.offset >> 16) & 0xFF) as u8,
            ((self.offset >> 24) & 0xFF) as u8,
        ]
    }

    pub fn decode(raw: [u8; 8]) -> Option<Self> {
        let access = raw[5];
        let kind = match access & 0xF {
            system_type::CALL_GATE16 => GateKind::Call16,
            system_type::CALL_GATE32 => GateKind::Call32,
            system_type::INT_GATE32 => GateKind::Interrupt32,
            system_type::TRAP_GATE32 => GateKind::Trap32,
            system_type::TASK_GATE => GateKind::Task,
            _ => return None,
        };
        Some(Self {
            kind,
            selector: Selector((raw[2] as u16) | ((raw[3] as u16) << 8)),
            offset: (raw[0] as u32)
                | ((raw[1] as u32) << 8)
                | ((raw[6] as u32) << 16)
                | ((raw[7] as u32) << 24),
            dpl: (access >> 5) & 3,
            present: (access & 0x80) != 0,
            param_count: raw[4] & 0x1F,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_flat_code_segment() {
        // Classic flat 4 GiB ring-0 code descriptor.
        let spec = DescriptorSpec {
            granularity: true,
            ..DescriptorSpec::code(0, 0xF_FFFF, 0)
        };
        assert_eq!(spec.encode(), [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let specs = [
            DescriptorSpec::code(0x0012_3456, 0xABCDE, 3),
            DescriptorSpec::code_conforming(0, 0xFFFF, 1).with_present(false),
            DescriptorSpec::data(0xFFFF_0000, 0x1_0000, 2),
            DescriptorSpec::tss32(0x8000, 0x67),
            DescriptorSpec::code_long(0),
        ];
        for spec in specs {
            let decoded = DescriptorSpec::decode(spec.encode());
            // The 20-bit limit field truncates on encode.
            let expect = DescriptorSpec {
                limit: spec.limit & 0xF_FFFF,
                ..spec
            };
            assert_eq!(decoded, expect, "{spec:?}");
        }
    }

    #[test]
    fn no_normalization_of_odd_combinations() {
        // Present expand-down conforming nonsense must encode exactly as given.
        let spec = DescriptorSpec::data(0, 0, 0).with_type(0xD, true);
        let decoded = DescriptorSpec::decode(spec.encode());
        assert_eq!(decoded.type_code, 0xD);
    }

    #[test]
    fn granularity_scales_limit() {
        let spec = DescriptorSpec {
            granularity: true,
            ..DescriptorSpec::data(0, 0x3, 0)
        };
        assert_eq!(spec.effective_limit(), 0x3FFF);
        let flat = DescriptorSpec {
            granularity: true,
            ..DescriptorSpec::data(0, 0xF_FFFF, 0)
        };
        assert_eq!(flat.effective_limit(), 0xFFFF_FFFF);
    }

    #[test]
    fn gate_round_trip() {
        let gate = GateSpec::call32(Selector(0x18), 0xDEAD_BEEF, 3);
        assert_eq!(GateSpec::decode(gate.encode()), Some(gate));
        let absent = gate.with_present(false);
        assert_eq!(GateSpec::decode(absent.encode()), Some(absent));
    }

    #[test]
    fn accessed_bit_toggles_type_bit0() {
        let code = DescriptorSpec::code(0, 0xFFFF, 0);
        assert!(!code.is_accessed());
        assert!(code.with_accessed(true).is_accessed());
        assert_eq!(code.with_accessed(true).type_code, 0xB);
    }
}
