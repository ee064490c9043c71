//! Scoped acquisition of scratch descriptor-table slots.
//!
//! Drivers exclusively own the scratch GDT slots for the duration of one
//! scenario. The arena hands slots out closure-scoped: the previous slot
//! image is saved before the synthetic descriptor is installed and written
//! back when the closure returns, so every later scenario observes the
//! known-good baseline no matter how the current one ended.

use xtrap_state::{DescriptorSpec, GateSpec, Selector};

use crate::kit::{SetupError, TestKit};

#[derive(Debug)]
pub struct ScratchSlotArena {
    in_use: Vec<bool>,
}

impl ScratchSlotArena {
    pub fn new<K: TestKit>(kit: &K) -> Self {
        Self {
            in_use: vec![false; kit.scratch_slot_count()],
        }
    }

    fn acquire(&mut self) -> Result<usize, SetupError> {
        let slot = self
            .in_use
            .iter()
            .position(|used| !used)
            .ok_or(SetupError::NoScratchSlot)?;
        self.in_use[slot] = true;
        Ok(slot)
    }

    /// Install a raw 8-byte descriptor image in a free scratch slot and run
    /// `f` with its selector. The slot baseline is restored before returning.
    pub fn with_raw<K: TestKit, R>(
        &mut self,
        kit: &mut K,
        raw: [u8; 8],
        f: impl FnOnce(&mut Self, &mut K, Selector) -> R,
    ) -> Result<R, SetupError> {
        let slot = self.acquire()?;
        let baseline = kit.read_gdt_slot(slot);
        kit.write_gdt_slot(slot, raw);
        let sel = kit.scratch_selector(slot);

        let out = f(self, kit, sel);

        kit.write_gdt_slot(slot, baseline);
        self.in_use[slot] = false;
        Ok(out)
    }

    pub fn with_descriptor<K: TestKit, R>(
        &mut self,
        kit: &mut K,
        spec: &DescriptorSpec,
        f: impl FnOnce(&mut Self, &mut K, Selector) -> R,
    ) -> Result<R, SetupError> {
        self.with_raw(kit, spec.encode(), f)
    }

    pub fn with_gate<K: TestKit, R>(
        &mut self,
        kit: &mut K,
        gate: &GateSpec,
        f: impl FnOnce(&mut Self, &mut K, Selector) -> R,
    ) -> Result<R, SetupError> {
        self.with_raw(kit, gate.encode(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceKit;
    use xtrap_state::CpuMode;

    #[test]
    fn slot_restored_after_use() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        let mut arena = ScratchSlotArena::new(&kit);
        let baseline = kit.read_gdt_slot(0);

        let spec = DescriptorSpec::code(0, 0xFFFF, 3);
        arena
            .with_descriptor(&mut kit, &spec, |_, kit, sel| {
                assert_eq!(kit.read_gdt_slot(0), spec.encode());
                assert_eq!(sel.index() as u64 * 8, sel.table_offset());
            })
            .unwrap();

        assert_eq!(kit.read_gdt_slot(0), baseline);
    }

    #[test]
    fn nested_acquisition_uses_distinct_slots() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        let mut arena = ScratchSlotArena::new(&kit);
        let code = DescriptorSpec::code(0, 0xFFFF, 0);
        let data = DescriptorSpec::data(0, 0xFFFF, 0);

        arena
            .with_descriptor(&mut kit, &code, |arena, kit, cs| {
                arena
                    .with_descriptor(kit, &data, |_, _, ss| {
                        assert_ne!(cs.index(), ss.index());
                    })
                    .unwrap();
            })
            .unwrap();
    }

    #[test]
    fn exhaustion_is_a_setup_error() {
        let kit = ReferenceKit::new(CpuMode::Prot32);
        let mut arena = ScratchSlotArena {
            in_use: vec![true; kit.scratch_slot_count()],
        };
        let mut kit = kit;
        let spec = DescriptorSpec::data(0, 0, 0);
        let err = arena
            .with_descriptor(&mut kit, &spec, |_, _, _| ())
            .unwrap_err();
        assert_eq!(err, SetupError::NoScratchSlot);
    }
}
