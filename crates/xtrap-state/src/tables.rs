//! IDTR/GDTR pseudo-descriptors and their SIDT/SGDT memory images.

use crate::mode::Width;

/// Value of a descriptor-table register (IDTR or GDTR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

impl TableRegister {
    pub fn new(base: u64, limit: u16) -> Self {
        Self { base, limit }
    }

    /// The exact byte image SIDT/SGDT stores for this width: 2-byte limit
    /// followed by a 4-byte (16/32-bit code) or 8-byte (64-bit code) base.
    pub fn to_image(self, width: Width) -> Vec<u8> {
        let mut out = Vec::with_capacity(width.table_image_len());
        out.extend_from_slice(&self.limit.to_le_bytes());
        match width {
            Width::W16 | Width::W32 => out.extend_from_slice(&(self.base as u32).to_le_bytes()),
            Width::W64 => out.extend_from_slice(&self.base.to_le_bytes()),
        }
        out
    }

    /// Parse the value LIDT/LGDT loads from `image` at this width.
    ///
    /// A 16-bit operand loads only 24 bits of base; the high byte is zeroed.
    pub fn from_image(image: &[u8], width: Width) -> Self {
        let limit = u16::from_le_bytes([image[0], image[1]]);
        let base = match width {
            Width::W16 => {
                u32::from_le_bytes([image[2], image[3], image[4], 0]) as u64
            }
            Width::W32 => u32::from_le_bytes([image[2], image[3], image[4], image[5]]) as u64,
            Width::W64 => u64::from_le_bytes([
                image[2], image[3], image[4], image[5], image[6], image[7], image[8], image[9],
            ]),
        };
        Self { base, limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_lengths_match_width() {
        let reg = TableRegister::new(0x0012_3456_789A_BCDE, 0x07FF);
        assert_eq!(reg.to_image(Width::W16).len(), 6);
        assert_eq!(reg.to_image(Width::W32).len(), 6);
        assert_eq!(reg.to_image(Width::W64).len(), 10);
    }

    #[test]
    fn w16_load_truncates_base_to_24_bits() {
        let image = [0xFF, 0x03, 0x78, 0x56, 0x34, 0x12];
        let reg = TableRegister::from_image(&image, Width::W16);
        assert_eq!(reg.limit, 0x03FF);
        assert_eq!(reg.base, 0x0034_5678);
        let reg32 = TableRegister::from_image(&image, Width::W32);
        assert_eq!(reg32.base, 0x1234_5678);
    }

    #[test]
    fn round_trip_w32_w64() {
        let reg = TableRegister::new(0xFEDC_BA98, 0x1234);
        assert_eq!(TableRegister::from_image(&reg.to_image(Width::W32), Width::W32), reg);
        let long = TableRegister::new(0xFFFF_8000_0000_1000, 0xFFF);
        assert_eq!(TableRegister::from_image(&long.to_image(Width::W64), Width::W64), long);
    }
}
