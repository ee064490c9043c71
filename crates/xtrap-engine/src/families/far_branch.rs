//! Far JMP/CALL driver (EA, 9A, FF /3, FF /5).
//!
//! Direct forms carry the selector in the instruction; indirect forms read a
//! far pointer through DS, so the pointer bytes themselves can fault before
//! any selector is seen. A selector with S=0 routes through the call-gate
//! walk, where the gate type outranks both its privilege and its presence.
//! The direct forms do not exist in 64-bit code; the indirect operand there
//! is m16:32 unless REX.W asks for m16:64, with the 0x66 prefix honoured
//! only on AMD parts.

use xtrap_state::protection::{AccessKind, Fault};
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, Exception, GateSpec, Selector, Width};

use xtrap_harness::{FatalError, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::frames::StackFrameBuilder;
use crate::quirks::CpuQuirks;
use crate::scenario::presence_type_axis;

use super::{base_context, check_memory, flat_code, run_case, setup_or_skip, UD2};

/// EA/9A with a ptr16:16 or ptr16:32 immediate.
fn encode_direct(mode: CpuMode, call: bool, sel: Selector, offset: u64) -> Vec<u8> {
    let mut out = vec![if call { 0x9A } else { 0xEA }];
    match mode.width() {
        Width::W16 => out.extend_from_slice(&(offset as u16).to_le_bytes()),
        _ => out.extend_from_slice(&(offset as u32).to_le_bytes()),
    }
    out.extend_from_slice(&sel.0.to_le_bytes());
    out
}

/// FF /3 (CALL) or FF /5 (JMP) with a displacement-only memory operand.
fn encode_indirect(mode: CpuMode, call: bool, disp: u64, rex_w: bool, opsize: bool) -> Vec<u8> {
    let reg = if call { 3u8 } else { 5 };
    let mut out = Vec::new();
    if opsize {
        out.push(0x66);
    }
    if rex_w {
        out.push(0x48);
    }
    out.push(0xFF);
    match mode.width() {
        Width::W16 => {
            out.push(0x06 | (reg << 3));
            out.extend_from_slice(&(disp as u16).to_le_bytes());
        }
        Width::W32 => {
            out.push(0x05 | (reg << 3));
            out.extend_from_slice(&(disp as u32).to_le_bytes());
        }
        Width::W64 => {
            out.push(0x04 | (reg << 3));
            out.push(0x25);
            out.extend_from_slice(&(disp as u32).to_le_bytes());
        }
    }
    out
}

/// Far-pointer image: offset slot then a 16-bit selector.
fn far_pointer(width: Width, offset: u64, sel: Selector) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&offset.to_le_bytes()[..width.slot_bytes() as usize]);
    out.extend_from_slice(&sel.0.to_le_bytes());
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

    if mode.is_real_or_v86() {
        for call in [false, true] {
            reporter.set_sub_test(if call { "direct-call" } else { "direct-jmp" });
            real_direct(kit, reporter, mode, quirks, masks, call, code_page)?;
        }
        return Ok(());
    }

    let mut arena = ScratchSlotArena::new(kit);

    if mode.is_64bit_code() {
        reporter.set_sub_test("direct-ud");
        direct_ud64(kit, reporter, mode, quirks, masks, code_page)?;

        reporter.set_sub_test("indirect");
        long_indirect(kit, reporter, mode, quirks, masks, code_page)?;

        reporter.set_sub_test("prefix-width");
        prefix_width(kit, reporter, mode, quirks, masks, code_page)?;
        return Ok(());
    }

    for call in [false, true] {
        reporter.set_sub_test(if call { "direct-call" } else { "direct-jmp" });
        direct_success(kit, reporter, mode, quirks, masks, call, code_page)?;
    }

    reporter.set_sub_test("type-matrix");
    type_matrix(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("direct-limit");
    direct_limit(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("gates");
    gate_cases(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("indirect");
    legacy_indirect(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

    reporter.set_sub_test("indirect-limit");
    indirect_limit(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
    Ok(())
}

/// Real/V8086: CS is loaded raw; a far CALL pushes CS then IP.
#[allow(clippy::too_many_arguments)]
fn real_direct<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    call: bool,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = mode.width();
    let slot = width.slot_bytes();
    let target_ip = 0x40u64;
    let target_cs = Selector((code_page >> 4) as u16);

    let snippet = encode_direct(mode, call, target_cs, target_ip);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + target_ip, &UD2);

    let mut ctx = base_context(kit, mode, 0, code_page);
    let sp = ctx.stack_ptr().wrapping_sub(0x100) & width.ip_mask();
    ctx.set_stack_ptr(sp);
    let next = ctx.rip() + snippet.len() as u64;

    let mut final_ctx = ctx.clone();
    final_ctx.set_seg(SegReg::Cs, target_cs);
    final_ctx.set_rip(target_ip);
    if call {
        final_ctx.set_stack_ptr(sp.wrapping_sub(2 * slot) & width.ip_mask());
    }
    let expected = expect::sentinel_frame(kit, final_ctx.clone(), quirks);

    let ok = run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    if ok && call {
        // Pushed image, lowest address first: return IP, then the old CS.
        let pushed = StackFrameBuilder::new(width)
            .slot(next)
            .slot(ctx.seg(SegReg::Cs).0 as u64)
            .image();
        let base = (ctx.seg(SegReg::Ss).0 as u64) << 4;
        check_memory(
            kit,
            reporter,
            "call frame",
            base + final_ctx.stack_ptr(),
            &pushed,
        );
    }
    Ok(())
}

/// Protected direct transfer to the flat ring selectors at rings 0 and 3.
#[allow(clippy::too_many_arguments)]
fn direct_success<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    call: bool,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = mode.width();
    let slot = width.slot_bytes();

    for ring in [0u8, 3] {
        reporter.next_step();
        let target_ip = kit.code_offset(code_page) + 0x40;
        let target_cs = kit.code_selector(ring);

        let snippet = encode_direct(mode, call, target_cs, target_ip);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + 0x40, &UD2);

        let mut ctx = base_context(kit, mode, ring, code_page);
        let sp = ctx.stack_ptr().wrapping_sub(0x100) & width.ip_mask();
        ctx.set_stack_ptr(sp);
        let next = ctx.rip() + snippet.len() as u64;

        let mut final_ctx = ctx.clone();
        final_ctx.set_seg(SegReg::Cs, target_cs.with_rpl(ring));
        final_ctx.set_rip(target_ip);
        if call {
            final_ctx.set_stack_ptr(sp.wrapping_sub(2 * slot) & width.ip_mask());
        }
        let expected = expect::sentinel_frame(kit, final_ctx.clone(), quirks);

        let ok = run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
        if ok && call {
            let pushed = StackFrameBuilder::new(width)
                .slot(next)
                .slot(ctx.seg(SegReg::Cs).0 as u64)
                .image();
            check_memory(kit, reporter, "call frame", final_ctx.stack_ptr(), &pushed);
        }
    }
    Ok(())
}

/// Every descriptor type crossed with the present bit, as a JMP target: a
/// wrong type is #GP(selector) even when the descriptor is also not present.
#[allow(clippy::too_many_arguments)]
fn type_matrix<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let width = mode.width();
    let mut baseline = flat_code(mode, 0);
    baseline.base = code_page as u32;
    baseline.limit = 0xFFF;
    baseline.granularity = false;

    for case in presence_type_axis() {
        reporter.next_step();
        let desc = case.apply(baseline);

        let r = arena.with_descriptor(kit, &desc, |_, kit, sel| -> Result<(), FatalError> {
            let snippet = encode_direct(mode, false, sel, 0x40);
            kit.write_mem(code_page, &snippet);
            kit.write_mem(code_page + 0x40, &UD2);

            let ctx = base_context(kit, mode, 0, code_page);
            let outcome = if desc.s {
                expect::predict_direct_transfer(mode, 0, width, false, sel, Some(&desc), 0x40)
            } else {
                // System descriptor: the gate walk rejects the type first.
                expect::predict_gate_transfer(
                    0,
                    false,
                    sel,
                    false,
                    desc.dpl,
                    desc.present,
                    Selector::NULL,
                    None,
                    0,
                )
                .map(|_| ())
            };

            let expected = match outcome {
                Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
                Ok(()) => {
                    let mut final_ctx = ctx.clone();
                    final_ctx.set_seg(SegReg::Cs, sel.with_rpl(0));
                    final_ctx.set_rip(0x40);
                    expect::sentinel_frame(kit, final_ctx, quirks)
                }
            };
            run_case(kit, reporter, mode, &snippet, &ctx, &[0x40], &expected, masks)?;
            Ok(())
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("{}: {err}", case.label)),
        }
    }
    Ok(())
}

/// Direct JMP past the target limit: #GP(0).
#[allow(clippy::too_many_arguments)]
fn direct_limit<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = mode.width();
    let mut cs = flat_code(mode, 0);
    cs.base = code_page as u32;
    cs.limit = 0x10;
    cs.granularity = false;

    let r = arena.with_descriptor(kit, &cs, |_, kit, sel| -> Result<(), FatalError> {
        let snippet = encode_direct(mode, false, sel, 0x20);
        kit.write_mem(code_page, &snippet);

        let ctx = base_context(kit, mode, 0, code_page);
        let outcome = expect::predict_direct_transfer(mode, 0, width, false, sel, Some(&cs), 0x20);
        let expected = match outcome {
            Err(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            Ok(()) => {
                reporter.fail("offset past the limit unexpectedly accepted");
                return Ok(());
            }
        };
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

/// Call-gate walk: same-ring JMP/CALL, the ring-3-to-ring-0 stack switch, the
/// JMP privilege-change refusal, and gate privilege outranking gate presence.
#[allow(clippy::too_many_arguments)]
fn gate_cases<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let target_off = kit.code_offset(code_page) + 0x40;

    // (call, current ring, gate DPL, gate present, 16-bit gate).
    let mut cases: Vec<(bool, u8, u8, bool, bool)> = vec![
        (false, 0, 0, true, false),
        (true, 0, 0, true, false),
        (true, 3, 3, true, false),
        (false, 3, 3, true, false),
        (true, 3, 0, true, false),
        (true, 3, 0, false, false),
        (true, 3, 3, false, false),
    ];
    if mode.width() == Width::W16 {
        cases.push((true, 0, 0, true, true));
    }

    for (call, cur, gate_dpl, gate_present, gate16) in cases {
        reporter.next_step();
        let target_sel = kit.code_selector(0);
        let gate = if gate16 {
            GateSpec::call16(target_sel, target_off as u32, gate_dpl)
        } else {
            GateSpec::call32(target_sel, target_off as u32, gate_dpl)
        }
        .with_present(gate_present);
        let gate_width = if gate16 { Width::W16 } else { Width::W32 };

        let r = arena.with_gate(kit, &gate, |_, kit, gate_sel| -> Result<(), FatalError> {
            let gate_sel = gate_sel.with_rpl(cur);
            let snippet = encode_direct(mode, call, gate_sel, 0xDEAD);
            kit.write_mem(code_page, &snippet);
            kit.write_mem(code_page + 0x40, &UD2);

            let mut ctx = base_context(kit, mode, cur, code_page);
            let sp = ctx.stack_ptr().wrapping_sub(0x100) & mode.width().ip_mask();
            ctx.set_stack_ptr(sp);
            let next = ctx.rip() + snippet.len() as u64;

            let target_desc = flat_code(mode, 0);
            let outcome = expect::predict_gate_transfer(
                cur,
                call,
                gate_sel,
                true,
                gate_dpl,
                gate_present,
                target_sel,
                Some(&target_desc),
                (target_off as u32) as u64 & gate_width.ip_mask(),
            );

            let (expected, pushed_at, pushed) = match outcome {
                Err(fault) => (expect::fault_frame(kit, &ctx, fault, quirks), None, Vec::new()),
                Ok(new_cpl) => {
                    let target = (target_off as u32) as u64 & gate_width.ip_mask();
                    let mut final_ctx = ctx.clone();
                    final_ctx.set_seg(SegReg::Cs, target_sel.with_rpl(new_cpl));
                    final_ctx.set_rip(target);
                    let slot = gate_width.slot_bytes();
                    let (at, image) = if call && new_cpl < cur {
                        // Stack switch: old SS, SP, CS and the return IP land
                        // on the inner-ring stack.
                        let (new_ss, top) = kit.ring_stack(new_cpl);
                        let new_sp = top.wrapping_sub(4 * slot) & gate_width.ip_mask();
                        final_ctx.cpl = new_cpl;
                        final_ctx.set_seg(SegReg::Ss, new_ss);
                        final_ctx.set_stack_ptr(new_sp);
                        let image = StackFrameBuilder::new(gate_width)
                            .slot(next)
                            .slot(ctx.seg(SegReg::Cs).0 as u64)
                            .slot(sp)
                            .slot(ctx.seg(SegReg::Ss).0 as u64)
                            .image();
                        (Some(new_sp), image)
                    } else if call {
                        let new_sp = sp.wrapping_sub(2 * slot) & mode.width().ip_mask();
                        final_ctx.set_stack_ptr(new_sp);
                        let image = StackFrameBuilder::new(gate_width)
                            .slot(next)
                            .slot(ctx.seg(SegReg::Cs).0 as u64)
                            .image();
                        (Some(new_sp), image)
                    } else {
                        (None, Vec::new())
                    };
                    (
                        expect::sentinel_frame(kit, final_ctx, quirks),
                        at,
                        image,
                    )
                }
            };

            let sentinels: &[u64] = &[(target_off as u32) as u64 & gate_width.ip_mask()];
            let ok = run_case(kit, reporter, mode, &snippet, &ctx, sentinels, &expected, masks)?;
            if ok {
                if let Some(at) = pushed_at {
                    check_memory(kit, reporter, "call frame", at, &pushed);
                }
            }
            Ok(())
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("gate slot: {err}")),
        }
    }
    Ok(())
}

/// Indirect JMP through a far pointer in memory.
#[allow(clippy::too_many_arguments)]
fn legacy_indirect<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = mode.width();
    let Some(data_page) = setup_or_skip(reporter, "data page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };

    let target_ip = kit.code_offset(code_page) + 0x40;
    let target_cs = kit.code_selector(0);
    let pointer = far_pointer(width, target_ip, target_cs);
    kit.write_mem(code_page + 0x40, &UD2);

    let run_with = |kit: &mut K,
                    reporter: &mut Reporter,
                    disp: u64,
                    ds: Option<Selector>|
     -> Result<(), FatalError> {
        let snippet = encode_indirect(mode, false, disp, false, false);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(data_page, &pointer);

        let mut ctx = base_context(kit, mode, 0, code_page);
        if let Some(ds) = ds {
            ctx.set_seg(SegReg::Ds, ds);
        }
        let mut final_ctx = ctx.clone();
        final_ctx.set_seg(SegReg::Cs, target_cs.with_rpl(0));
        final_ctx.set_rip(target_ip);
        let expected = expect::sentinel_frame(kit, final_ctx, quirks);
        run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
        Ok(())
    };

    if width == Width::W16 {
        // The pointer sits past 16-bit reach of the flat DS; use a scratch DS
        // based at the data page.
        let ds = DescriptorSpec::data(data_page as u32, 0xFFF, 0);
        let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
            run_with(kit, reporter, 0, Some(sel))
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("ds slot: {err}")),
        }
    } else {
        run_with(kit, reporter, data_page, None)?;
    }
    Ok(())
}

/// Far pointer straddling the DS limit: the read faults before any selector
/// check.
#[allow(clippy::too_many_arguments)]
fn indirect_limit<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let width = mode.width();
    let ptr_len = width.slot_bytes() + 2;
    let Some(data_page) = setup_or_skip(reporter, "data page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };

    let limit = 0x10u64;
    let disp = limit - 2; // pointer tail lands past the limit
    let ds = DescriptorSpec::data(data_page as u32, limit as u32, 0);

    let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
        let snippet = encode_indirect(mode, false, disp, false, false);
        kit.write_mem(code_page, &snippet);

        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_seg(SegReg::Ds, sel);

        let (outcome, _) = expect::predict_mem_op(
            MemOp {
                offset: disp,
                len: ptr_len,
                seg_base: data_page,
                seg_limit: limit,
                through_ss: false,
                kind: AccessKind::Read,
            },
            false,
            |_| true,
        );
        let expected = match outcome {
            ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            ExpectedOutcome::Success => {
                reporter.fail("pointer read unexpectedly fits the scratch segment");
                return Ok(());
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
        Ok(())
    });
    match r {
        Ok(inner) => inner,
        Err(err) => {
            reporter.skip(&format!("ds slot: {err}"));
            Ok(())
        }
    }
}

/// EA and 9A are invalid opcodes in 64-bit code.
fn direct_ud64<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    for op in [0xEAu8, 0x9A] {
        reporter.next_step();
        let mut snippet = vec![op];
        snippet.extend_from_slice(&(0x40u32).to_le_bytes());
        snippet.extend_from_slice(&kit.code_selector(0).0.to_le_bytes());
        kit.write_mem(code_page, &snippet);

        let ctx = base_context(kit, mode, 0, code_page);
        let fault = Fault {
            exception: Exception::InvalidOpcode,
            error_code: 0,
            cr2: 0,
        };
        let expected = expect::fault_frame(kit, &ctx, fault, quirks);
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
    }
    Ok(())
}

/// 64-bit indirect: m16:32 by default, m16:64 under REX.W, and a REX.W
/// pointer with a non-canonical offset is #GP(0).
fn long_indirect<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    let Some(data_page) = setup_or_skip(reporter, "data page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };
    let target_cs = kit.code_selector(0);
    kit.write_mem(code_page + 0x40, &UD2);

    for (call, rex_w) in [(false, false), (true, false), (false, true)] {
        reporter.next_step();
        let ptr_width = if rex_w { Width::W64 } else { Width::W32 };
        let target_ip = code_page + 0x40;
        let pointer = far_pointer(ptr_width, target_ip, target_cs);
        kit.write_mem(data_page, &pointer);

        let snippet = encode_indirect(mode, call, data_page, rex_w, false);
        kit.write_mem(code_page, &snippet);

        let mut ctx = base_context(kit, mode, 0, code_page);
        let sp = ctx.stack_ptr() - 0x100;
        ctx.set_stack_ptr(sp);
        let next = ctx.rip() + snippet.len() as u64;

        let mut final_ctx = ctx.clone();
        final_ctx.set_seg(SegReg::Cs, target_cs.with_rpl(0));
        final_ctx.set_rip(target_ip);
        if call {
            final_ctx.set_stack_ptr(sp - 2 * ptr_width.slot_bytes());
        }
        let expected = expect::sentinel_frame(kit, final_ctx.clone(), quirks);

        let ok = run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
        if ok && call {
            let pushed = StackFrameBuilder::new(ptr_width)
                .slot(next)
                .slot(ctx.seg(SegReg::Cs).0 as u64)
                .image();
            check_memory(kit, reporter, "call frame", final_ctx.stack_ptr(), &pushed);
        }
    }

    // Non-canonical m16:64 offset.
    reporter.next_step();
    let pointer = far_pointer(Width::W64, 0x0000_8000_0000_0000, target_cs);
    kit.write_mem(data_page, &pointer);
    let snippet = encode_indirect(mode, false, data_page, true, false);
    kit.write_mem(code_page, &snippet);

    let ctx = base_context(kit, mode, 0, code_page);
    let expected = expect::fault_frame(kit, &ctx, Fault::gp0(), quirks);
    run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
    Ok(())
}

/// The 0x66 prefix on a 64-bit far branch: AMD parts honour it (m16:16),
/// Intel parts keep the 32-bit offset.
fn prefix_width<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let Some(data_page) = setup_or_skip(reporter, "data page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };
    let target_cs = kit.code_selector(0);

    let (ptr_width, target_ip) = if quirks.amd_far_prefix {
        // A 16-bit offset can only reach low memory; drop the sentinel there.
        (Width::W16, 0xE000u64)
    } else {
        (Width::W32, code_page + 0x40)
    };
    kit.write_mem(target_ip, &UD2);

    let pointer = far_pointer(ptr_width, target_ip, target_cs);
    kit.write_mem(data_page, &pointer);
    let snippet = encode_indirect(mode, false, data_page, false, true);
    kit.write_mem(code_page, &snippet);

    let ctx = base_context(kit, mode, 0, code_page);
    let mut final_ctx = ctx.clone();
    final_ctx.set_seg(SegReg::Cs, target_cs.with_rpl(0));
    final_ctx.set_rip(target_ip);
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    run_case(kit, reporter, mode, &snippet, &ctx, &[target_ip], &expected, masks)?;
    Ok(())
}
