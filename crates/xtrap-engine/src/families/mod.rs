//! Instruction-family drivers.
//!
//! Each driver is a thin composition over the shared pieces: it lays out the
//! snippet (instruction bytes plus a sentinel), translates scenario points
//! into concrete selectors/offsets, predicts the trap frame through the
//! expectation model, runs the snippet, and hands both frames to the
//! comparator. A driver that cannot establish a precondition records a skip
//! and moves on; only a fatal executor outcome aborts the family.

pub mod far_branch;
pub mod iret;
pub mod load_tables;
pub mod near_branch;
pub mod ret_far;
pub mod ret_near;
pub mod store_tables;

use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, RegisterContext, Selector, TrapFrame, Width};

use xtrap_harness::{
    run_to_sentinel, FatalError, Reporter, RunOptions, SetupError, TestKit,
};

use crate::compare::{compare_frames, CompareMasks};

/// Sentinel instruction: UD2.
pub(crate) const UD2: [u8; 2] = [0x0F, 0x0B];

/// RIP value for code placed at linear `addr` under the kit's default code
/// selectors (paragraph-relative in real/V8086, window-relative in 16-bit
/// protected modes).
pub(crate) fn code_rip<K: TestKit>(kit: &K, addr: u64) -> u64 {
    kit.code_offset(addr)
}

/// A resting context executing at `addr` in ring `ring`.
pub(crate) fn base_context<K: TestKit>(
    kit: &mut K,
    mode: CpuMode,
    ring: u8,
    addr: u64,
) -> RegisterContext {
    let mut ctx = kit.capture_context(mode, 0);
    if mode.is_real_or_v86() {
        ctx.set_seg(SegReg::Cs, Selector((addr >> 4) as u16));
        ctx.set_rip(addr & 0xF);
        return ctx;
    }
    if ring != 0 {
        ctx.set_seg(SegReg::Cs, kit.code_selector(ring));
        ctx.set_seg(SegReg::Ds, kit.data_selector(ring));
        ctx.set_seg(SegReg::Es, kit.data_selector(ring));
        let (ss, sp) = kit.ring_stack(ring);
        ctx.set_seg(SegReg::Ss, ss);
        ctx.set_stack_ptr(sp);
        ctx.cpl = ring;
    }
    ctx.set_rip(kit.code_offset(addr));
    ctx
}

/// Record a skip for a failed precondition and turn the error into `None`.
pub(crate) fn setup_or_skip<T>(
    reporter: &mut Reporter,
    what: &str,
    result: Result<T, SetupError>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(err) => {
            reporter.skip(&format!("{what}: {err}"));
            None
        }
    }
}

/// Run one scenario and compare against the prediction.
pub(crate) fn run_case<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    snippet: &[u8],
    ctx: &RegisterContext,
    sentinels: &[u64],
    expected: &TrapFrame,
    masks: CompareMasks,
) -> Result<bool, FatalError> {
    let frame = run_to_sentinel(kit, ctx, sentinels, RunOptions::default())?;
    Ok(compare_frames(
        reporter, mode, snippet, expected, &frame, masks,
    ))
}

/// Outward transfers null out data segments the new privilege cannot hold.
/// The flat data selectors used by the drivers all carry DPL == RPL, so the
/// RPL is enough to decide.
pub(crate) fn drop_inaccessible(ctx: &mut RegisterContext, new_cpl: u8) {
    for reg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        let sel = ctx.seg(reg);
        if sel.is_null() {
            continue;
        }
        if sel.rpl() < new_cpl {
            ctx.set_seg(reg, Selector::NULL);
        }
    }
}

/// `0F 01 /reg` with a displacement-only memory operand, or `[bx]` in 16-bit
/// code when `bx` is set.
pub(crate) fn table_insn(mode: CpuMode, reg: u8, disp: u64, bx: bool) -> Vec<u8> {
    match mode.width() {
        Width::W16 => {
            if bx {
                vec![0x0F, 0x01, 0x07 | (reg << 3)]
            } else {
                let d = (disp as u16).to_le_bytes();
                vec![0x0F, 0x01, 0x06 | (reg << 3), d[0], d[1]]
            }
        }
        Width::W32 => {
            let d = (disp as u32).to_le_bytes();
            vec![0x0F, 0x01, 0x05 | (reg << 3), d[0], d[1], d[2], d[3]]
        }
        Width::W64 => {
            let d = (disp as u32).to_le_bytes();
            vec![0x0F, 0x01, 0x04 | (reg << 3), 0x25, d[0], d[1], d[2], d[3]]
        }
    }
}

/// Flat 4 GiB code descriptor with the D/L bits matching `mode`.
pub(crate) fn flat_code(mode: CpuMode, dpl: u8) -> DescriptorSpec {
    let mut desc = DescriptorSpec {
        granularity: true,
        ..DescriptorSpec::code(0, 0xF_FFFF, dpl)
    };
    match mode.width() {
        Width::W16 => desc.default_big = false,
        Width::W32 => {}
        Width::W64 => {
            desc.default_big = false;
            desc.long = true;
        }
    }
    desc
}

/// Flat writable data descriptor.
pub(crate) fn flat_data(dpl: u8) -> DescriptorSpec {
    DescriptorSpec {
        granularity: true,
        ..DescriptorSpec::data(0, 0xF_FFFF, dpl)
    }
}

/// Verify a byte range in memory and report one failure if it differs.
pub(crate) fn check_memory<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    what: &str,
    addr: u64,
    expected: &[u8],
) -> bool {
    let mut actual = vec![0u8; expected.len()];
    kit.read_mem(addr, &mut actual);
    if actual == expected {
        return true;
    }
    reporter.fail(&format!(
        "{what}: expected {} at {addr:#x}, found {}",
        hex(expected),
        hex(&actual)
    ));
    false
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
