//! Near RET driver (C3, C2 imm16).
//!
//! The return offset is popped through SS first (stack faults win), then
//! limit/canonical-checked against CS; the immediate is added to the stack
//! pointer only on success.

use xtrap_state::protection::{AccessKind, Fault};
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, Width};

use xtrap_harness::{FatalError, PageFlags, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::frames::StackFrameBuilder;
use crate::quirks::CpuQuirks;

use super::{base_context, code_rip, run_case, setup_or_skip, UD2};

fn ret_width(mode: CpuMode) -> Width {
    if mode.is_64bit_code() {
        Width::W64
    } else {
        mode.width()
    }
}

fn encode(imm: Option<u16>) -> Vec<u8> {
    match imm {
        None => vec![0xC3],
        Some(imm) => {
            let b = imm.to_le_bytes();
            vec![0xC2, b[0], b[1]]
        }
    }
}

pub fn run<K: TestKit>(
    kit: &mut K,
    mode: CpuMode,
    quirks: CpuQuirks,
    reporter: &mut Reporter,
) -> Result<(), FatalError> {
    let masks = CompareMasks::new(quirks);
    let Some(code_page) = setup_or_skip(reporter, "code page", kit.alloc_page(PageKind::Code))
    else {
        return Ok(());
    };

    let rings: &[u8] = if mode.is_real_or_v86() { &[0] } else { &[0, 3] };
    for imm in [None, Some(8u16)] {
        for &ring in rings {
            reporter.set_sub_test(if imm.is_some() {
                "ret-imm"
            } else {
                "ret"
            });
            success_case(kit, reporter, mode, quirks, masks, imm, ring, code_page)?;
        }
    }

    if mode.is_protected() {
        let mut arena = ScratchSlotArena::new(kit);

        if !mode.is_64bit_code() {
            reporter.set_sub_test("target-limit");
            target_limit_case(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

            reporter.set_sub_test("stack-ss");
            stack_ss_case(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
        } else {
            reporter.set_sub_test("non-canonical");
            non_canonical_case(kit, reporter, mode, quirks, masks, code_page)?;
        }

        if mode.is_paged() {
            reporter.set_sub_test("stack-pf");
            stack_pf_case(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn success_case<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    imm: Option<u16>,
    ring: u8,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = ret_width(mode);
    let target = code_rip(kit, code_page) + 0x40;

    let snippet = encode(imm);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + 0x40, &UD2);

    let mut ctx = base_context(kit, mode, ring, code_page);
    let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
    ctx.set_stack_ptr(sp);
    let frame = StackFrameBuilder::new(width).slot(target).image();
    kit.write_mem(stack_base(mode, &ctx) + sp, &frame);

    let mut final_ctx = ctx.clone();
    final_ctx.set_rip(target);
    final_ctx.set_stack_ptr(
        sp.wrapping_add(width.slot_bytes() + imm.unwrap_or(0) as u64) & mode.width().ip_mask(),
    );
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    run_case(kit, reporter, mode, &snippet, &ctx, &[target], &expected, masks)?;
    Ok(())
}

fn stack_base(mode: CpuMode, ctx: &xtrap_state::RegisterContext) -> u64 {
    if mode.is_real_or_v86() {
        (ctx.seg(SegReg::Ss).0 as u64) << 4
    } else {
        0
    }
}

/// Popped offset beyond a short scratch-CS limit: #GP(0) with the frame
/// still on the stack.
#[allow(clippy::too_many_arguments)]
fn target_limit_case<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = ret_width(mode);
    let limit = 0x10u64;
    let mut cs = DescriptorSpec::code(code_page as u32, limit as u32, 0);
    cs.default_big = mode.width() == Width::W32;

    let snippet = encode(None);
    kit.write_mem(code_page, &snippet);

    let r = arena.with_descriptor(kit, &cs, |_, kit, sel| -> Result<(), FatalError> {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_seg(SegReg::Cs, sel);
        ctx.set_rip(0);
        let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
        ctx.set_stack_ptr(sp);
        let frame = StackFrameBuilder::new(width).slot(limit + 0x10).image();
        kit.write_mem(sp, &frame);

        let expected = expect::fault_frame(kit, &ctx, Fault::gp0(), quirks);
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
        Ok(())
    });
    match r {
        Ok(inner) => inner,
        Err(err) => {
            reporter.skip(&format!("cs slot: {err}"));
            Ok(())
        }
    }
}

/// Pop straddling a short scratch SS: #SS(0) before any CS check.
#[allow(clippy::too_many_arguments)]
fn stack_ss_case<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = ret_width(mode);
    let ss_limit = 0xFu64;
    let ss = DescriptorSpec::data(0, ss_limit as u32, 0);

    let snippet = encode(None);
    kit.write_mem(code_page, &snippet);

    let r = arena.with_descriptor(kit, &ss, |_, kit, sel| -> Result<(), FatalError> {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_seg(SegReg::Ss, sel);
        // First frame byte fits the limit, the second does not.
        ctx.set_stack_ptr(ss_limit);

        let (outcome, _) = expect::predict_mem_op(
            MemOp {
                offset: ctx.stack_ptr(),
                len: width.slot_bytes(),
                seg_base: 0,
                seg_limit: ss_limit,
                through_ss: true,
                kind: AccessKind::Read,
            },
            false,
            |_| true,
        );
        let expected = match outcome {
            ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            ExpectedOutcome::Success => {
                reporter.fail("pop unexpectedly fits the scratch stack");
                return Ok(());
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
        Ok(())
    });
    match r {
        Ok(inner) => inner,
        Err(err) => {
            reporter.skip(&format!("ss slot: {err}"));
            Ok(())
        }
    }
}

/// 64-bit: popping a non-canonical return offset is #GP(0).
fn non_canonical_case<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let snippet = encode(None);
    kit.write_mem(code_page, &snippet);

    let mut ctx = base_context(kit, mode, 0, code_page);
    let sp = ctx.stack_ptr() - 0x100;
    ctx.set_stack_ptr(sp);
    let frame = StackFrameBuilder::new(Width::W64)
        .slot(0x0000_8000_0000_0000)
        .image();
    kit.write_mem(sp, &frame);

    let expected = expect::fault_frame(kit, &ctx, Fault::gp0(), quirks);
    run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
    Ok(())
}

/// Pop from an unmapped page: #PF, CR2 at the first frame byte.
#[allow(clippy::too_many_arguments)]
fn stack_pf_case<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let Some(pf_page) = setup_or_skip(reporter, "stack page", kit.alloc_page(PageKind::Stack))
    else {
        return Ok(());
    };
    if setup_or_skip(
        reporter,
        "unmap stack page",
        kit.protect_page(pf_page, 0x1000, PageFlags::empty(), PageFlags::PRESENT),
    )
    .is_none()
    {
        return Ok(());
    }

    let width = ret_width(mode);
    let snippet = encode(None);
    kit.write_mem(code_page, &snippet);

    let predict = |sp: u64, seg_base: u64, seg_limit: u64| {
        expect::predict_mem_op(
            MemOp {
                offset: sp,
                len: width.slot_bytes(),
                seg_base,
                seg_limit,
                through_ss: true,
                kind: AccessKind::Read,
            },
            false,
            |_| false,
        )
        .0
    };

    if mode.is_64bit_code() {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_stack_ptr(pf_page + 0x20);
        let expected = match predict(pf_page + 0x20, 0, u64::MAX) {
            ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            ExpectedOutcome::Success => {
                reporter.fail("pop unexpectedly succeeded on an unmapped page");
                return Ok(());
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
    } else {
        let ss = DescriptorSpec::data(pf_page as u32, 0xFFF, 0);
        let r = arena.with_descriptor(kit, &ss, |_, kit, sel| -> Result<(), FatalError> {
            let mut ctx = base_context(kit, mode, 0, code_page);
            ctx.set_seg(SegReg::Ss, sel);
            ctx.set_stack_ptr(0x20);
            let expected = match predict(0x20, pf_page, 0xFFF) {
                ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
                ExpectedOutcome::Success => {
                    reporter.fail("pop unexpectedly succeeded on an unmapped page");
                    return Ok(());
                }
            };
            run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
            Ok(())
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("ss slot: {err}")),
        }
    }
    Ok(())
}
