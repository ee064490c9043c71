//! IRET driver (CF, REX.W CF).
//!
//! Beyond the far-RET ordering contract, IRET adds the flags image: a 16-bit
//! frame only replaces the low word, IOPL only moves at ring 0, IF only when
//! CPL <= IOPL. In 64-bit code the frame is always five slots and an NT=1
//! load on top of NT=1 refuses before the target page is even probed. In
//! 64-bit code only the REX.W form is driven; the 32-bit form pops a frame
//! shape no handler builds.

use xtrap_state::flags::{RFLAGS_CF, RFLAGS_IF, RFLAGS_IOPL_MASK, RFLAGS_NT, RFLAGS_RESERVED1};
use xtrap_state::protection::{AccessKind, Fault};
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, Selector, Width};

use xtrap_harness::{FatalError, PageFlags, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::frames::StackFrameBuilder;
use crate::quirks::CpuQuirks;
use crate::scenario::ring_axis;

use super::{base_context, drop_inaccessible, flat_code, run_case, setup_or_skip, UD2};

fn iret_width(mode: CpuMode) -> Width {
    if mode.is_64bit_code() {
        Width::W64
    } else {
        mode.width()
    }
}

fn encode(mode: CpuMode) -> Vec<u8> {
    if mode.is_64bit_code() {
        vec![0x48, 0xCF]
    } else {
        vec![0xCF]
    }
}

/// Build the frame for `width`, appending SS:SP slots whenever the
/// instruction will pop them.
fn iret_frame(
    width: Width,
    ip: u64,
    cs: Selector,
    flags: u64,
    outer: Option<(u64, Selector)>,
) -> Vec<u8> {
    let mut b = StackFrameBuilder::iret(width, ip, cs, flags);
    if let Some((sp, ss)) = outer {
        b.outer(sp, ss);
    }
    b.image()
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

    if mode.is_real_or_v86() {
        reporter.set_sub_test("flag-merge");
        real_case(kit, reporter, mode, quirks, masks, code_page)?;
        return Ok(());
    }

    let mut arena = ScratchSlotArena::new(kit);

    reporter.set_sub_test("same-ring-scratch");
    same_ring_scratch(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("ring-matrix");
    ring_matrix(kit, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("iopl-merge");
    iopl_merge(kit, reporter, mode, quirks, masks, code_page)?;

    if !mode.is_64bit_code() {
        reporter.set_sub_test("frame-read");
        frame_read_fault(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
    }

    if mode.is_64bit_code() {
        reporter.set_sub_test("nt-conflict");
        nt_conflict(kit, reporter, mode, quirks, masks, code_page)?;
    } else if mode.is_paged() {
        reporter.set_sub_test("target-pf");
        target_pf(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
    }
    Ok(())
}

/// Real/V8086: the popped image replaces only the low flag word, reserved
/// bit 1 reads back set, and the stack pointer advances by three slots.
fn real_case<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = iret_width(mode);
    let slot = width.slot_bytes();
    let target_ip = 0x40u64;
    let target_cs = Selector((code_page >> 4) as u16);

    let snippet = encode(mode);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + target_ip, &UD2);

    let mut ctx = base_context(kit, mode, 0, code_page);
    let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
    ctx.set_stack_ptr(sp);
    let popped = ctx.rflags() | RFLAGS_CF;
    let frame = iret_frame(width, target_ip, target_cs, popped, None);
    kit.write_mem(sp, &frame); // SS base 0

    let mut final_ctx = ctx.clone();
    final_ctx.set_seg(SegReg::Cs, target_cs);
    final_ctx.set_rip(target_ip);
    final_ctx.set_stack_ptr(sp.wrapping_add(3 * slot) & mode.width().ip_mask());
    final_ctx.set_rflags((ctx.rflags() & !0xFFFF) | (popped & 0xFFFF) | RFLAGS_RESERVED1);
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    Ok(())
}

fn scratch_index<K: TestKit>(kit: &K, sel: Selector) -> Option<usize> {
    (0..kit.scratch_slot_count()).find(|&i| kit.scratch_selector(i).index() == sel.index())
}

/// Same-ring return into a scratch CS at rings 0 and 3: the accessed bit must
/// come back set and a repeat run must leave the descriptor image alone.
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
    let width = iret_width(mode);
    let slot = width.slot_bytes();

    for ring in [0u8, 3] {
        reporter.next_step();
        // In 64-bit code the CS base is ignored, so the scratch descriptor
        // stays flat and the frame IP is the linear target.
        let (cs, target_ip) = if mode.is_64bit_code() {
            (flat_code(mode, ring), code_page + 0x40)
        } else {
            let mut cs = flat_code(mode, ring);
            cs.base = code_page as u32;
            cs.limit = 0xFFF;
            cs.granularity = false;
            (cs, 0x40)
        };

        let snippet = encode(mode);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + 0x40, &UD2);

        let r = arena.with_descriptor(kit, &cs, |_, kit, sel| -> Result<(), FatalError> {
            let sel = sel.with_rpl(ring);
            let mut ctx = base_context(kit, mode, ring, code_page);
            let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
            ctx.set_stack_ptr(sp);
            let popped = ctx.rflags() | RFLAGS_CF;
            let outer = (width == Width::W64)
                .then(|| (ctx.stack_ptr().wrapping_add(0x40), ctx.seg(SegReg::Ss)));
            let frame = iret_frame(width, target_ip, sel, popped, outer);
            kit.write_mem(sp, &frame);

            let mut final_ctx = ctx.clone();
            final_ctx.set_seg(SegReg::Cs, sel);
            final_ctx.set_rip(target_ip);
            final_ctx.set_rflags(expect::iret_flag_merge(ctx.rflags(), popped, width, ring));
            match outer {
                Some((new_sp, new_ss)) => {
                    final_ctx.set_seg(SegReg::Ss, new_ss);
                    final_ctx.set_stack_ptr(new_sp & width.ip_mask());
                }
                None => {
                    final_ctx.set_stack_ptr(sp.wrapping_add(3 * slot) & mode.width().ip_mask())
                }
            }
            let expected = expect::sentinel_frame(kit, final_ctx, quirks);

            let first =
                run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;

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
                run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
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

/// Every (current ring, frame RPL) pair against the flat ring selectors.
fn ring_matrix<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = iret_width(mode);
    let slot = width.slot_bytes();

    for (cur, tgt) in ring_axis() {
        reporter.next_step();
        let snippet = encode(mode);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + 0x40, &UD2);

        let target_ip = kit.code_offset(code_page) + 0x40;
        let target_cs = kit.code_selector(tgt);
        let target_desc = flat_code(mode, tgt);

        let mut ctx = base_context(kit, mode, cur, code_page);
        let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
        ctx.set_stack_ptr(sp);
        let popped = ctx.rflags() | RFLAGS_CF;

        // The frame pops SS:SP on every 64-bit return and on any outward one.
        let pops = width == Width::W64 || tgt > cur;
        let (outer_ss, outer_sp) = if tgt > cur {
            (kit.ring_stack(tgt).0, kit.ring_stack(tgt).1 - 0x80)
        } else {
            (ctx.seg(SegReg::Ss), ctx.stack_ptr().wrapping_add(0x40))
        };
        let frame = iret_frame(
            width,
            target_ip,
            target_cs,
            popped,
            pops.then_some((outer_sp, outer_ss)),
        );
        kit.write_mem(sp, &frame);

        let outcome = expect::predict_iret(
            mode,
            cur,
            width,
            ctx.rflags(),
            target_ip,
            target_cs,
            Some(&target_desc),
            popped,
            |new_cpl| {
                let desc = DescriptorSpec {
                    granularity: true,
                    ..DescriptorSpec::data(0, 0xF_FFFF, new_cpl)
                };
                (outer_ss, Some(desc))
            },
            |_| true,
        );

        let expected = match outcome {
            Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            Ok(commit) => {
                let mut final_ctx = ctx.clone();
                final_ctx.cpl = commit.new_cpl;
                final_ctx.set_seg(SegReg::Cs, target_cs);
                final_ctx.set_rip(target_ip);
                final_ctx.set_rflags(commit.rflags);
                if commit.popped_stack {
                    final_ctx.set_seg(SegReg::Ss, outer_ss);
                    final_ctx.set_stack_ptr(outer_sp & width.ip_mask());
                } else {
                    final_ctx.set_stack_ptr(sp.wrapping_add(3 * slot) & mode.width().ip_mask());
                }
                if commit.new_cpl > cur {
                    drop_inaccessible(&mut final_ctx, commit.new_cpl);
                }
                expect::sentinel_frame(kit, final_ctx, quirks)
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    }
    Ok(())
}

/// Ring 3 with IOPL 0: the popped image may wiggle IOPL and IF all it wants,
/// only the unprivileged bits land.
fn iopl_merge<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = iret_width(mode);
    let slot = width.slot_bytes();
    let target_ip = kit.code_offset(code_page) + 0x40;
    let target_cs = kit.code_selector(3);

    let snippet = encode(mode);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + 0x40, &UD2);

    let mut ctx = base_context(kit, mode, 3, code_page);
    let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
    ctx.set_stack_ptr(sp);
    let popped = ctx.rflags() | RFLAGS_CF | RFLAGS_IF | RFLAGS_IOPL_MASK;
    let pops = width == Width::W64;
    let outer = (ctx.stack_ptr().wrapping_add(0x40), ctx.seg(SegReg::Ss));
    let frame = iret_frame(width, target_ip, target_cs, popped, pops.then_some(outer));
    kit.write_mem(sp, &frame);

    let mut final_ctx = ctx.clone();
    final_ctx.set_rip(target_ip);
    final_ctx.set_rflags(expect::iret_flag_merge(ctx.rflags(), popped, width, 3));
    if pops {
        final_ctx.set_stack_ptr(outer.0 & width.ip_mask());
    } else {
        final_ctx.set_stack_ptr(sp.wrapping_add(3 * slot) & mode.width().ip_mask());
    }
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    Ok(())
}

/// Popping the three-slot frame through a tiny SS faults before any selector
/// is seen.
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
    reporter.next_step();
    let width = iret_width(mode);
    let ss_limit = 0xFu64;
    let ss = DescriptorSpec::data(0, ss_limit as u32, 0);
    let snippet = encode(mode);
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

/// 64-bit NT precedence: NT=1 on NT=1 is #GP(0) whether or not the target
/// page exists; without the conflict the same frame reports the fetch #PF.
fn nt_conflict<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = iret_width(mode);
    let Some(pf_page) = setup_or_skip(reporter, "target page", kit.alloc_page(PageKind::Code))
    else {
        return Ok(());
    };
    if setup_or_skip(
        reporter,
        "unmap target page",
        kit.protect_page(pf_page, 0x1000, PageFlags::empty(), PageFlags::PRESENT),
    )
    .is_none()
    {
        return Ok(());
    }

    let snippet = encode(mode);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + 0x40, &UD2);

    // (current NT, target IP, page present).
    let cases = [
        (true, pf_page, false),
        (true, code_page + 0x40, true),
        (false, pf_page, false),
    ];
    for (nt, target_ip, present) in cases {
        reporter.next_step();
        let target_cs = kit.code_selector(0);
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_flag(RFLAGS_NT, nt);
        let sp = ctx.stack_ptr().wrapping_sub(0x100);
        ctx.set_stack_ptr(sp);
        let popped = ctx.rflags() | RFLAGS_NT;
        let outer = (ctx.stack_ptr().wrapping_add(0x40), ctx.seg(SegReg::Ss));
        let frame = iret_frame(width, target_ip, target_cs, popped, Some(outer));
        kit.write_mem(sp, &frame);

        let outcome = expect::predict_iret(
            mode,
            0,
            width,
            ctx.rflags(),
            target_ip,
            target_cs,
            Some(&flat_code(mode, 0)),
            popped,
            |_| (outer.1, Some(flat_code_data())),
            |_| present,
        );
        let expected = match outcome {
            Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            Ok(commit) => {
                let mut final_ctx = ctx.clone();
                final_ctx.set_rip(target_ip);
                final_ctx.set_rflags(commit.rflags);
                final_ctx.set_stack_ptr(outer.0);
                expect::sentinel_frame(kit, final_ctx, quirks)
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    }

    setup_or_skip(
        reporter,
        "remap target page",
        kit.protect_page(pf_page, 0x1000, PageFlags::PRESENT, PageFlags::empty()),
    );
    Ok(())
}

fn flat_code_data() -> DescriptorSpec {
    DescriptorSpec {
        granularity: true,
        ..DescriptorSpec::data(0, 0xF_FFFF, 0)
    }
}

/// Legacy paged: a frame CS whose base sits on an unmapped page reports the
/// instruction-fetch #PF with CR2 at the target linear address.
#[allow(clippy::too_many_arguments)]
fn target_pf<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = iret_width(mode);
    let Some(pf_page) = setup_or_skip(reporter, "target page", kit.alloc_page(PageKind::Code))
    else {
        return Ok(());
    };
    if setup_or_skip(
        reporter,
        "unmap target page",
        kit.protect_page(pf_page, 0x1000, PageFlags::empty(), PageFlags::PRESENT),
    )
    .is_none()
    {
        return Ok(());
    }

    let mut cs = DescriptorSpec::code(pf_page as u32, 0xFFF, 0);
    cs.default_big = mode.width() == Width::W32;
    let snippet = encode(mode);
    kit.write_mem(code_page, &snippet);

    let r = arena.with_descriptor(kit, &cs, |_, kit, sel| -> Result<(), FatalError> {
        let mut ctx = base_context(kit, mode, 0, code_page);
        let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
        ctx.set_stack_ptr(sp);
        let popped = ctx.rflags() | RFLAGS_CF;
        let frame = iret_frame(width, 0, sel, popped, None);
        kit.write_mem(sp, &frame);

        let outcome = expect::predict_iret(
            mode,
            0,
            width,
            ctx.rflags(),
            0,
            sel,
            Some(&cs),
            popped,
            |_| (Selector::NULL, None),
            |lin| !(pf_page..pf_page + 0x1000).contains(&lin),
        );
        let expected = match outcome {
            Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            Ok(_) => {
                reporter.fail("unmapped target unexpectedly reached");
                return Ok(());
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
        Ok(())
    });
    if let Err(err) = &r {
        reporter.skip(&format!("cs slot: {err}"));
    }

    setup_or_skip(
        reporter,
        "remap target page",
        kit.protect_page(pf_page, 0x1000, PageFlags::PRESENT, PageFlags::empty()),
    );
    match r {
        Ok(inner) => inner,
        Err(_) => Ok(()),
    }
}
