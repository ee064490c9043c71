//! Width-parametric construction of RETF/IRET stack images.
//!
//! The slot order is pop order: the first value pushed into the builder lands
//! at the lowest address, i.e. at the stack pointer the instruction starts
//! from. One builder replaces the per-width hand-laid byte arrays.

use xtrap_state::{Selector, Width};

#[derive(Debug)]
pub struct StackFrameBuilder {
    width: Width,
    slots: Vec<u64>,
}

impl StackFrameBuilder {
    pub fn new(width: Width) -> Self {
        Self {
            width,
            slots: Vec::new(),
        }
    }

    /// Frame for a far RET: IP then CS.
    pub fn ret_far(width: Width, ip: u64, cs: Selector) -> Self {
        let mut b = Self::new(width);
        b.slot(ip).slot(cs.0 as u64);
        b
    }

    /// Frame for an IRET: IP, CS, FLAGS.
    pub fn iret(width: Width, ip: u64, cs: Selector, flags: u64) -> Self {
        let mut b = Self::new(width);
        b.slot(ip).slot(cs.0 as u64).slot(flags);
        b
    }

    pub fn slot(&mut self, value: u64) -> &mut Self {
        self.slots.push(value);
        self
    }

    /// Append the outer-stack SP and SS slots.
    pub fn outer(&mut self, sp: u64, ss: Selector) -> &mut Self {
        self.slot(sp).slot(ss.0 as u64)
    }

    pub fn len(&self) -> u64 {
        self.slots.len() as u64 * self.width.slot_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The exact byte image, lowest address first.
    pub fn image(&self) -> Vec<u8> {
        let slot = self.width.slot_bytes() as usize;
        let mut out = Vec::with_capacity(self.slots.len() * slot);
        for value in &self.slots {
            out.extend_from_slice(&value.to_le_bytes()[..slot]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_sizes_track_width() {
        let b16 = StackFrameBuilder::ret_far(Width::W16, 0x1234, Selector(0x08));
        assert_eq!(b16.image(), vec![0x34, 0x12, 0x08, 0x00]);

        let b32 = StackFrameBuilder::ret_far(Width::W32, 0x1234, Selector(0x08));
        assert_eq!(b32.len(), 8);
        assert_eq!(&b32.image()[..4], &[0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn iret64_frame_is_five_eight_byte_slots() {
        let mut b = StackFrameBuilder::iret(Width::W64, 0x4000, Selector(0x08), 0x202);
        b.outer(0x7000, Selector(0x10));
        assert_eq!(b.len(), 40);
        let image = b.image();
        assert_eq!(&image[0..8], &0x4000u64.to_le_bytes());
        assert_eq!(&image[32..40], &0x10u64.to_le_bytes());
    }
}
