//! Run-to-sentinel wrapper over [`TestKit::run_under_trap`].
//!
//! A scenario snippet is the instruction under test followed by a UD2 at a
//! designated address (and at every address control may legally land on).
//! The raw executor reports that UD2 as an ordinary #UD; this wrapper turns
//! a #UD whose faulting RIP is one of the declared sentinel addresses into
//! the success outcome, so drivers and the comparator only ever see
//! [`TrapReason::Sentinel`] for a run that completed.

use tracing::trace;

use xtrap_state::{Exception, RegisterContext, TrapFrame, TrapReason};

use crate::kit::{FatalError, TestKit};

/// Per-run harness knobs.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Reset DR0-7/DR6 before the run. On by default; scenarios that
    /// deliberately program hardware breakpoints opt out.
    pub reset_debug_regs: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reset_debug_regs: true,
        }
    }
}

/// Execute `ctx` until the first exception and classify the result.
pub fn run_to_sentinel<K: TestKit>(
    kit: &mut K,
    ctx: &RegisterContext,
    sentinels: &[u64],
    opts: RunOptions,
) -> Result<TrapFrame, FatalError> {
    debug_assert!(ctx.is_consistent(), "context injected before finalization");

    if opts.reset_debug_regs {
        kit.reset_debug_regs();
    }

    let mut frame = kit.run_under_trap(ctx)?;
    if frame.reason == TrapReason::Exception(Exception::InvalidOpcode)
        && sentinels.contains(&frame.ctx.rip())
    {
        trace!(rip = frame.ctx.rip(), "reached sentinel");
        frame.reason = TrapReason::Sentinel;
        frame.error_code = 0;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kit::{
        CpuFeature, PageFlags, PageKind, SetupError, TestKit,
    };
    use xtrap_state::{CpuMode, Selector, TableRegister};

    /// Minimal scripted kit: replays a fixed frame.
    struct OneShotKit {
        frame: TrapFrame,
        debug_resets: usize,
    }

    impl TestKit for OneShotKit {
        fn capture_context(&mut self, mode: CpuMode, _extra_stack: u16) -> RegisterContext {
            RegisterContext::new(mode)
        }

        fn run_under_trap(&mut self, _ctx: &RegisterContext) -> Result<TrapFrame, FatalError> {
            Ok(self.frame.clone())
        }

        fn alloc_page(&mut self, _kind: PageKind) -> Result<u64, SetupError> {
            Err(SetupError::AllocFailed)
        }

        fn protect_page(
            &mut self,
            _addr: u64,
            _len: u64,
            _set: PageFlags,
            _clear: PageFlags,
        ) -> Result<(), SetupError> {
            Ok(())
        }

        fn read_mem(&mut self, _addr: u64, _buf: &mut [u8]) {}
        fn write_mem(&mut self, _addr: u64, _bytes: &[u8]) {}

        fn code_selector(&self, _ring: u8) -> Selector {
            Selector(0x08)
        }

        fn data_selector(&self, _ring: u8) -> Selector {
            Selector(0x10)
        }

        fn scratch_slot_count(&self) -> usize {
            0
        }

        fn scratch_selector(&self, _slot: usize) -> Selector {
            Selector::NULL
        }

        fn read_gdt_slot(&mut self, _slot: usize) -> [u8; 8] {
            [0; 8]
        }

        fn write_gdt_slot(&mut self, _slot: usize, _raw: [u8; 8]) {}

        fn gdtr(&self) -> TableRegister {
            TableRegister::default()
        }

        fn idtr(&self) -> TableRegister {
            TableRegister::default()
        }

        fn set_gdtr(&mut self, _reg: TableRegister) {}
        fn set_idtr(&mut self, _reg: TableRegister) {}

        fn ring_stack(&self, _ring: u8) -> (Selector, u64) {
            (Selector(0x10), 0)
        }

        fn set_ring_stack(&mut self, _ring: u8, _sel: Selector, _sp: u64) {}

        fn has_feature(&self, _feature: CpuFeature) -> bool {
            true
        }

        fn reset_debug_regs(&mut self) {
            self.debug_resets += 1;
        }
    }

    fn ud_frame_at(rip: u64) -> TrapFrame {
        let mut ctx = RegisterContext::new(CpuMode::Prot32);
        ctx.set_seg(xtrap_state::regs::SegReg::Cs, Selector(0x08));
        ctx.set_rip(rip);
        TrapFrame {
            reason: TrapReason::Exception(Exception::InvalidOpcode),
            error_code: 0,
            cr2: 0,
            ctx,
            handler_cs: Selector(0x08),
            handler_ss: Selector(0x10),
            handler_rflags: 0x2,
        }
    }

    #[test]
    fn ud_at_sentinel_becomes_success() {
        let mut kit = OneShotKit {
            frame: ud_frame_at(0x1005),
            debug_resets: 0,
        };
        let ctx = kit.frame.ctx.clone();
        let frame = run_to_sentinel(&mut kit, &ctx, &[0x1005], RunOptions::default()).unwrap();
        assert_eq!(frame.reason, TrapReason::Sentinel);
        assert_eq!(kit.debug_resets, 1);
    }

    #[test]
    fn ud_elsewhere_stays_an_exception() {
        let mut kit = OneShotKit {
            frame: ud_frame_at(0x2000),
            debug_resets: 0,
        };
        let ctx = kit.frame.ctx.clone();
        let frame = run_to_sentinel(&mut kit, &ctx, &[0x1005], RunOptions::default()).unwrap();
        assert_eq!(
            frame.reason,
            TrapReason::Exception(Exception::InvalidOpcode)
        );
    }

    #[test]
    fn debug_reset_can_be_opted_out() {
        let mut kit = OneShotKit {
            frame: ud_frame_at(0x1005),
            debug_resets: 0,
        };
        let ctx = kit.frame.ctx.clone();
        let opts = RunOptions {
            reset_debug_regs: false,
        };
        run_to_sentinel(&mut kit, &ctx, &[0x1005], opts).unwrap();
        assert_eq!(kit.debug_resets, 0);
    }
}
