//! Far RET driver (CB, CA imm16).
//!
//! The ordering contract under test: both CS frame slots are popped and the
//! CS selector fully validated before the outer SS:SP slots are even read, so
//! junk in the SS slots cannot change the fault of a bad CS. An outward
//! return additionally loads the outer stack, clears data segments that the
//! new privilege cannot hold, and only marks descriptors accessed on commit.

use xtrap_state::protection::{AccessKind, Fault};
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, Selector, Width};

use xtrap_harness::{FatalError, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::frames::StackFrameBuilder;
use crate::quirks::CpuQuirks;
use crate::scenario::ring_axis;

use super::{base_context, drop_inaccessible, flat_code, run_case, setup_or_skip, UD2};

/// Operand width of the return: CB defaults to 32-bit even in 64-bit code;
/// the driver uses REX.W there to exercise the full frame.
fn ret_width(mode: CpuMode) -> Width {
    if mode.is_64bit_code() {
        Width::W64
    } else {
        mode.width()
    }
}

fn encode(mode: CpuMode, imm: Option<u16>) -> Vec<u8> {
    let mut out = Vec::new();
    if mode.is_64bit_code() {
        out.push(0x48);
    }
    match imm {
        None => out.push(0xCB),
        Some(imm) => {
            out.push(0xCA);
            out.extend_from_slice(&imm.to_le_bytes());
        }
    }
    out
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
    let mut arena = ScratchSlotArena::new(kit);

    if mode.is_real_or_v86() {
        for imm in [None, Some(6u16)] {
            reporter.set_sub_test(if imm.is_some() { "retf-imm" } else { "retf" });
            real_case(kit, reporter, mode, quirks, masks, imm, code_page)?;
        }
        return Ok(());
    }

    reporter.set_sub_test("same-ring-scratch");
    same_ring_scratch(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("ring-matrix");
    ring_matrix(kit, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("cs-before-ss");
    cs_before_ss(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("outer-ss");
    outer_ss_faults(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("frame-read");
    frame_read_fault(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    if mode.is_64bit_code() {
        reporter.set_sub_test("non-canonical");
        non_canonical(kit, reporter, mode, quirks, masks, code_page)?;
    }

    reporter.set_sub_test("retf-imm");
    imm_case(kit, reporter, mode, quirks, masks, code_page)?;
    Ok(())
}

fn real_case<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    imm: Option<u16>,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = ret_width(mode);
    let slot = width.slot_bytes();
    let target_ip = 0x40u64;
    let target_cs = Selector((code_page >> 4) as u16);

    let snippet = encode(mode, imm);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + target_ip, &UD2);

    let mut ctx = base_context(kit, mode, 0, code_page);
    let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
    ctx.set_stack_ptr(sp);
    let frame = StackFrameBuilder::ret_far(width, target_ip, target_cs).image();
    kit.write_mem(sp, &frame); // SS base 0

    let mut final_ctx = ctx.clone();
    final_ctx.set_seg(SegReg::Cs, target_cs);
    final_ctx.set_rip(target_ip);
    final_ctx.set_stack_ptr(
        sp.wrapping_add(2 * slot + imm.unwrap_or(0) as u64) & mode.width().ip_mask(),
    );
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    Ok(())
}

/// Locate the scratch-slot index backing `sel` so the raw descriptor can be
/// inspected after a run.
fn scratch_index<K: TestKit>(kit: &K, sel: Selector) -> Option<usize> {
    (0..kit.scratch_slot_count()).find(|&i| kit.scratch_selector(i).index() == sel.index())
}

/// Same-ring return into a scratch CS at rings 0 and 3; the scratch
/// descriptor must come back with the accessed bit set, and a second return
/// must leave the image unchanged.
#[allow(clippy::too_many_arguments)]
fn same_ring_scratch<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = ret_width(mode);
    let slot = width.slot_bytes();

    for ring in [0u8, 3] {
        reporter.next_step();
        let mut cs = flat_code(mode, ring);
        cs.base = code_page as u32;
        cs.limit = 0xFFF;
        cs.granularity = false;

        let snippet = encode(mode, None);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + 0x40, &UD2);

        let r = arena.with_descriptor(kit, &cs, |_, kit, sel| -> Result<(), FatalError> {
            let sel = sel.with_rpl(ring);
            let mut ctx = base_context(kit, mode, ring, code_page);
            let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
            ctx.set_stack_ptr(sp);
            let frame = StackFrameBuilder::ret_far(width, 0x40, sel).image();
            kit.write_mem(sp, &frame);

            let mut final_ctx = ctx.clone();
            final_ctx.set_seg(SegReg::Cs, sel);
            final_ctx.set_rip(0x40);
            final_ctx.set_stack_ptr(sp.wrapping_add(2 * slot) & mode.width().ip_mask());
            let expected = expect::sentinel_frame(kit, final_ctx, quirks);

            let first = run_case(kit, reporter, mode, &snippet, &ctx, &[0x40], &expected, masks)?;

            if first {
                let Some(idx) = scratch_index(kit, sel) else {
                    reporter.fail("scratch selector has no backing slot");
                    return Ok(());
                };
                let raw = kit.read_gdt_slot(idx);
                let after = DescriptorSpec::decode(raw);
                if !after.is_accessed() {
                    reporter.fail("committed return left the accessed bit clear");
                }
                // Idempotence: a second commit must not change the image.
                run_case(kit, reporter, mode, &snippet, &ctx, &[0x40], &expected, masks)?;
                if kit.read_gdt_slot(idx) != raw {
                    reporter.fail("second return rewrote the descriptor image");
                }
            }
            Ok(())
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("cs slot: {err}")),
        }
    }
    Ok(())
}

/// Every (current ring, target RPL) pair against the flat ring selectors:
/// inward is #GP(selector), same-ring commits in place, outward switches the
/// stack and drops now-inaccessible data segments.
fn ring_matrix<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = ret_width(mode);
    let slot = width.slot_bytes();

    for (cur, tgt) in ring_axis() {
        reporter.next_step();
        let snippet = encode(mode, None);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + 0x40, &UD2);

        let target_ip = kit.code_offset(code_page) + 0x40;
        let target_cs = kit.code_selector(tgt);
        let target_desc = flat_code(mode, tgt);
        let (outer_ss, outer_sp) = (kit.ring_stack(tgt).0, kit.ring_stack(tgt).1 - 0x80);

        let mut ctx = base_context(kit, mode, cur, code_page);
        let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
        ctx.set_stack_ptr(sp);
        let mut frame = StackFrameBuilder::ret_far(width, target_ip, target_cs);
        if tgt > cur {
            frame.outer(outer_sp, outer_ss);
        }
        kit.write_mem(sp, &frame.image());

        let outcome = expect::predict_far_ret(
            mode,
            cur,
            width,
            target_cs,
            Some(&target_desc),
            target_ip,
            |new_cpl| {
                let desc = DescriptorSpec {
                    granularity: true,
                    ..DescriptorSpec::data(0, 0xF_FFFF, new_cpl)
                };
                (outer_ss, Some(desc))
            },
        );

        let expected = match outcome {
            Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            Ok(new_cpl) => {
                let mut final_ctx = ctx.clone();
                final_ctx.set_seg(SegReg::Cs, target_cs);
                final_ctx.set_rip(target_ip);
                if new_cpl > cur {
                    final_ctx.cpl = new_cpl;
                    final_ctx.set_seg(SegReg::Ss, outer_ss);
                    final_ctx.set_stack_ptr(outer_sp & width.ip_mask());
                    drop_inaccessible(&mut final_ctx, new_cpl);
                } else {
                    final_ctx.set_stack_ptr(sp.wrapping_add(2 * slot) & mode.width().ip_mask());
                }
                expect::sentinel_frame(kit, final_ctx, quirks)
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    }
    Ok(())
}

/// A bad CS must produce its fault no matter what garbage sits in the outer
/// SS:SP slots: they are read only after CS validation succeeds.
#[allow(clippy::too_many_arguments)]
fn cs_before_ss<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = ret_width(mode);

    // A data descriptor where a code segment is required, RPL 2: the return
    // fails on type, outward to ring 2 from ring 0.
    let bad_cs_desc = DescriptorSpec::data(0, 0xFFFF, 2);
    let snippet = encode(mode, None);
    kit.write_mem(code_page, &snippet);

    let junk_ss: [u16; 3] = [0x0000, 0x0003, 0xFFF3];
    for junk in junk_ss {
        reporter.next_step();
        let r = arena.with_descriptor(kit, &bad_cs_desc, |_, kit, sel| -> Result<(), FatalError> {
            let sel = sel.with_rpl(2);
            let mut ctx = base_context(kit, mode, 0, code_page);
            let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
            ctx.set_stack_ptr(sp);
            let mut frame = StackFrameBuilder::ret_far(width, 0x40, sel);
            frame.outer(0xDEAD, Selector(junk));
            kit.write_mem(sp, &frame.image());

            let expected = expect::fault_frame(kit, &ctx, Fault::gp_sel(sel), quirks);
            run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
            Ok(())
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("cs slot: {err}")),
        }
    }
    Ok(())
}

/// Outward return with a bad outer SS: privilege mismatch is #GP(SS), a
/// not-present stack segment is #SS(SS), a null SS is #GP(0).
#[allow(clippy::too_many_arguments)]
fn outer_ss_faults<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = ret_width(mode);
    let target_ip = kit.code_offset(code_page) + 0x40;
    let target_cs = kit.code_selector(3);
    let snippet = encode(mode, None);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + 0x40, &UD2);

    // DPL 0 data segment presented as a ring-3 stack.
    let mismatched = DescriptorSpec::data(0, 0xFFFF, 0);
    // Right shape, not present.
    let absent = DescriptorSpec::data(0, 0xFFFF, 3).with_present(false);

    for (label, desc) in [
        ("dpl-mismatch", Some(mismatched)),
        ("not-present", Some(absent)),
        ("null", None),
    ] {
        reporter.next_step();
        let run_with = |kit: &mut K,
                        reporter: &mut Reporter,
                        ss: Selector,
                        ss_desc: Option<DescriptorSpec>|
         -> Result<(), FatalError> {
            let mut ctx = base_context(kit, mode, 0, code_page);
            let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
            ctx.set_stack_ptr(sp);
            let mut frame = StackFrameBuilder::ret_far(width, target_ip, target_cs);
            frame.outer(0x9F00, ss);
            kit.write_mem(sp, &frame.image());

            let outcome = expect::predict_far_ret(
                mode,
                0,
                width,
                target_cs,
                Some(&flat_code(mode, 3)),
                target_ip,
                |_| (ss, ss_desc),
            );
            let expected = match outcome {
                Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
                Ok(_) => {
                    reporter.fail(&format!("{label}: bad outer SS unexpectedly accepted"));
                    return Ok(());
                }
            };
            run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
            Ok(())
        };

        match desc {
            Some(spec) => {
                let r = arena.with_descriptor(kit, &spec, |_, kit, sel| -> Result<(), FatalError> {
                    run_with(kit, reporter, sel.with_rpl(3), Some(spec))
                });
                match r {
                    Ok(inner) => inner?,
                    Err(err) => reporter.skip(&format!("ss slot: {err}")),
                }
            }
            None => run_with(kit, reporter, Selector::NULL, None)?,
        }
    }
    Ok(())
}

/// Popping the CS:IP frame itself through a tiny SS is a stack fault before
/// any selector is seen.
#[allow(clippy::too_many_arguments)]
fn frame_read_fault<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    if mode.is_64bit_code() {
        // No SS limit to straddle; covered by the paging families.
        return Ok(());
    }
    reporter.next_step();
    let width = ret_width(mode);
    let ss_limit = 0xFu64;
    let ss = DescriptorSpec::data(0, ss_limit as u32, 0);
    let snippet = encode(mode, None);
    kit.write_mem(code_page, &snippet);

    let r = arena.with_descriptor(kit, &ss, |_, kit, sel| -> Result<(), FatalError> {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_seg(SegReg::Ss, sel);
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
                reporter.fail("frame pop unexpectedly fits the scratch stack");
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

/// 64-bit same-ring return to a non-canonical offset: #GP(0).
fn non_canonical<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = ret_width(mode);
    let snippet = encode(mode, None);
    kit.write_mem(code_page, &snippet);

    let mut ctx = base_context(kit, mode, 0, code_page);
    let sp = ctx.stack_ptr() - 0x100;
    ctx.set_stack_ptr(sp);
    let frame =
        StackFrameBuilder::ret_far(width, 0x0000_8000_0000_0000, kit.code_selector(0)).image();
    kit.write_mem(sp, &frame);

    let expected = expect::fault_frame(kit, &ctx, Fault::gp0(), quirks);
    run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
    Ok(())
}

/// CA imm16: the immediate is applied to the inner stack pointer.
fn imm_case<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = ret_width(mode);
    let slot = width.slot_bytes();
    let imm = 2 * slot as u16;

    let snippet = encode(mode, Some(imm));
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + 0x40, &UD2);

    let target_ip = kit.code_offset(code_page) + 0x40;
    let target_cs = kit.code_selector(0);

    let mut ctx = base_context(kit, mode, 0, code_page);
    let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
    ctx.set_stack_ptr(sp);
    let frame = StackFrameBuilder::ret_far(width, target_ip, target_cs).image();
    kit.write_mem(sp, &frame);

    let mut final_ctx = ctx.clone();
    final_ctx.set_rip(target_ip);
    final_ctx
        .set_stack_ptr(sp.wrapping_add(2 * slot + imm as u64) & mode.width().ip_mask());
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    Ok(())
}
