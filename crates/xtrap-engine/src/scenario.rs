//! The enumeration axes every family driver iterates.
//!
//! Three axes recur: ring x RPL, descriptor presence x type, and byte-granular
//! boundary sliding. Drivers cross them with family-specific operands; each
//! produced scenario is consumed by exactly one iteration and leaves no state
//! behind (scratch slots are arena-scoped, pages are re-protected).

use xtrap_state::descriptor::system_type;
use xtrap_state::{CpuMode, DescriptorSpec};

/// Destination ring x selector RPL cross product.
pub fn ring_axis() -> impl Iterator<Item = (u8, u8)> {
    (0..4u8).flat_map(|ring| (0..4u8).map(move |rpl| (ring, rpl)))
}

/// One point on the presence/type axis.
#[derive(Debug, Clone, Copy)]
pub struct TypeCase {
    pub label: &'static str,
    pub type_code: u8,
    pub s: bool,
    pub present: bool,
}

impl TypeCase {
    pub fn is_code(&self) -> bool {
        self.s && (self.type_code & 0x8) != 0
    }

    /// Apply this case to a baseline descriptor.
    pub fn apply(&self, base: DescriptorSpec) -> DescriptorSpec {
        base.with_type(self.type_code, self.s).with_present(self.present)
    }
}

/// Descriptor type codes crossed with the present bit, for verifying that a
/// wrong type faults ahead of an absent descriptor.
pub fn presence_type_axis() -> Vec<TypeCase> {
    let types: [(&'static str, u8, bool); 6] = [
        ("data-rw", 0x2, true),
        ("data-ro", 0x0, true),
        ("code-nonconf", 0xA, true),
        ("code-conf", 0xE, true),
        ("tss32-avail", system_type::TSS32_AVAIL, false),
        ("ldt", system_type::LDT, false),
    ];
    let mut out = Vec::with_capacity(types.len() * 2);
    for (label, type_code, s) in types {
        for present in [true, false] {
            out.push(TypeCase {
                label,
                type_code,
                s,
                present,
            });
        }
    }
    out
}

/// Offsets for the boundary axis: slide a `len`-byte operand so it moves from
/// fully inside to fully outside a boundary at `edge`, one byte at a time.
///
/// Yields operand start offsets `edge - len - 1 ..= edge + 1`, so the sweep
/// includes one fully-legal position before the straddle and one fully-illegal
/// position after it.
pub fn boundary_axis(edge: u64, len: u64) -> impl Iterator<Item = u64> {
    let first = edge.saturating_sub(len + 1);
    first..=edge + 1
}

/// Whether the boundary axis should enumerate page faults in this mode.
pub fn enumerates_page_faults(mode: CpuMode) -> bool {
    mode.is_paged()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_axis_is_a_full_cross_product() {
        let points: Vec<_> = ring_axis().collect();
        assert_eq!(points.len(), 16);
        assert!(points.contains(&(0, 3)));
        assert!(points.contains(&(3, 0)));
    }

    #[test]
    fn presence_type_axis_pairs_every_type_with_both_presence_values() {
        let axis = presence_type_axis();
        assert_eq!(axis.len(), 12);
        for case in &axis {
            assert!(axis
                .iter()
                .any(|c| c.label == case.label && c.present != case.present));
        }
    }

    #[test]
    fn boundary_axis_covers_the_straddle_byte_by_byte() {
        let offsets: Vec<_> = boundary_axis(16, 6).collect();
        assert_eq!(offsets.first(), Some(&9));
        assert_eq!(offsets.last(), Some(&17));
        // Consecutive offsets differ by exactly one byte.
        for pair in offsets.windows(2) {
            assert_eq!(pair[1] - pair[0], 1);
        }
    }
}
