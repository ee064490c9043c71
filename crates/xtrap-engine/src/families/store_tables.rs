//! SGDT/SIDT driver.
//!
//! Table stores are unprivileged on the parts under test, so the interesting
//! axes are byte-exactness (exactly 6 or 10 bytes, guard bytes untouched),
//! the 16-bit `DS:BX` addressing form, and the boundary axis: a store that
//! straddles a segment limit or a not-present page must commit exactly the
//! bytes before the first illegal one.

use xtrap_state::protection::AccessKind;
use xtrap_state::regs::{gpr, SegReg};
use xtrap_state::{CpuMode, DescriptorSpec, TableRegister, Width};

use xtrap_harness::{FatalError, PageFlags, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::quirks::CpuQuirks;
use crate::scenario::boundary_axis;

use super::{base_context, check_memory, code_rip, run_case, setup_or_skip, UD2};

const GUARD: u8 = 0xCC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableOp {
    Sgdt,
    Sidt,
}

impl TableOp {
    fn modrm_reg(self) -> u8 {
        match self {
            TableOp::Sgdt => 0,
            TableOp::Sidt => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TableOp::Sgdt => "sgdt",
            TableOp::Sidt => "sidt",
        }
    }

    fn value<K: TestKit>(self, kit: &K) -> TableRegister {
        match self {
            TableOp::Sgdt => kit.gdtr(),
            TableOp::Sidt => kit.idtr(),
        }
    }
}

fn image_len(mode: CpuMode) -> u64 {
    if mode.is_64bit_code() {
        10
    } else {
        6
    }
}

fn image<K: TestKit>(kit: &K, op: TableOp, mode: CpuMode) -> Vec<u8> {
    let width = if mode.is_64bit_code() {
        Width::W64
    } else {
        Width::W32
    };
    op.value(kit).to_image(width)
}

fn encode(mode: CpuMode, reg: u8, disp: u64, bx: bool) -> Vec<u8> {
    super::table_insn(mode, reg, disp, bx)
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
    let Some(data_page) = setup_or_skip(reporter, "data page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };
    let mut arena = ScratchSlotArena::new(kit);

    for op in [TableOp::Sgdt, TableOp::Sidt] {
        reporter.set_sub_test(&format!("{}/store", op.name()));
        plain_stores(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;

        if mode.width() == Width::W16 {
            reporter.set_sub_test(&format!("{}/ds-bx", op.name()));
            bx_form(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;
        }

        if mode.is_protected() && !mode.is_64bit_code() {
            reporter.set_sub_test(&format!("{}/limit-boundary", op.name()));
            limit_boundary(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;
        }

        if mode.is_paged() {
            reporter.set_sub_test(&format!("{}/page-boundary", op.name()));
            page_boundary(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;
        }
    }
    Ok(())
}

/// Guard-byte fill around the destination, one byte on each side.
fn fill_guard<K: TestKit>(kit: &mut K, buf: u64, len: u64) {
    kit.write_mem(buf - 1, &vec![GUARD; len as usize + 2]);
}

#[allow(clippy::too_many_arguments)]
fn plain_stores<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    op: TableOp,
    code_page: u64,
    data_page: u64,
) -> Result<(), FatalError> {
    let rings: &[u8] = if mode.is_real_or_v86() {
        &[0]
    } else {
        &[0, 3]
    };
    for &ring in rings {
        reporter.next_step();
        let buf_off = 0x80u64;
        let buf = data_page + buf_off;
        let len = image_len(mode);
        fill_guard(kit, buf, len);

        if mode.is_real_or_v86() {
            let snippet = encode(mode, op.modrm_reg(), buf_off, false);
            run_plain(kit, reporter, mode, quirks, masks, op, ring, code_page, buf, &snippet, |ctx| {
                ctx.set_seg(SegReg::Ds, xtrap_state::Selector((data_page >> 4) as u16));
            })?;
        } else if mode.is_64bit_code() {
            let snippet = encode(mode, op.modrm_reg(), buf, false);
            run_plain(kit, reporter, mode, quirks, masks, op, ring, code_page, buf, &snippet, |_| {})?;
        } else {
            // Scratch DS over the data page so the offset fits every width.
            let ds = DescriptorSpec::data(data_page as u32, 0xFFF, ring);
            let snippet = encode(mode, op.modrm_reg(), buf_off, false);
            let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
                run_plain(kit, reporter, mode, quirks, masks, op, ring, code_page, buf, &snippet, |ctx| {
                    ctx.set_seg(SegReg::Ds, sel.with_rpl(ring));
                })
            });
            match r {
                Ok(inner) => inner?,
                Err(err) => reporter.skip(&format!("ds slot: {err}")),
            }
        }
    }
    Ok(())
}

/// Run one expected-success store and verify the written image and both
/// guard bytes.
#[allow(clippy::too_many_arguments)]
fn run_plain<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    op: TableOp,
    ring: u8,
    code_page: u64,
    buf: u64,
    snippet: &[u8],
    fixup: impl FnOnce(&mut xtrap_state::RegisterContext),
) -> Result<(), FatalError> {
    kit.write_mem(code_page, snippet);
    kit.write_mem(code_page + snippet.len() as u64, &UD2);

    let mut ctx = base_context(kit, mode, ring, code_page);
    fixup(&mut ctx);
    let sentinel = code_rip(kit, code_page) + snippet.len() as u64;

    let mut final_ctx = ctx.clone();
    final_ctx.set_rip(sentinel);
    let expected = expect::sentinel_frame(kit, final_ctx, quirks);

    if run_case(kit, reporter, mode, snippet, &ctx, &[sentinel], &expected, masks)? {
        let mut want = vec![GUARD];
        want.extend_from_slice(&image(kit, op, mode));
        want.push(GUARD);
        check_memory(kit, reporter, "stored image", buf - 1, &want);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn bx_form<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    op: TableOp,
    code_page: u64,
    data_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let buf_off = 0x90u64;
    let buf = data_page + buf_off;
    let len = image_len(mode);
    fill_guard(kit, buf, len);

    let snippet = encode(mode, op.modrm_reg(), 0, true);
    if mode.is_real_or_v86() {
        run_plain(kit, reporter, mode, quirks, masks, op, 0, code_page, buf, &snippet, |ctx| {
            ctx.set_seg(SegReg::Ds, xtrap_state::Selector((data_page >> 4) as u16));
            ctx.gpr[gpr::RBX] = buf_off;
        })?;
    } else {
        let ds = DescriptorSpec::data(data_page as u32, 0xFFF, 0);
        let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
            run_plain(kit, reporter, mode, quirks, masks, op, 0, code_page, buf, &snippet, |ctx| {
                ctx.set_seg(SegReg::Ds, sel);
                ctx.gpr[gpr::RBX] = buf_off;
            })
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("ds slot: {err}")),
        }
    }
    Ok(())
}

/// Slide the destination across a scratch-DS segment limit and assert the
/// partial image plus #GP(0) at exactly the off-by-one point.
#[allow(clippy::too_many_arguments)]
fn limit_boundary<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    op: TableOp,
    code_page: u64,
    data_page: u64,
) -> Result<(), FatalError> {
    let len = image_len(mode);
    let limit = 0x40u64;
    let ds = DescriptorSpec::data(data_page as u32, limit as u32, 0);

    for off in boundary_axis(limit + 1, len) {
        reporter.next_step();
        let buf = data_page + off;
        fill_guard(kit, buf, len);

        let snippet = encode(mode, op.modrm_reg(), off, false);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + snippet.len() as u64, &UD2);

        let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
            let mut ctx = base_context(kit, mode, 0, code_page);
            ctx.set_seg(SegReg::Ds, sel);
            let sentinel = code_rip(kit, code_page) + snippet.len() as u64;

            let (outcome, written) = expect::predict_mem_op(
                MemOp {
                    offset: off,
                    len,
                    seg_base: data_page,
                    seg_limit: limit,
                    through_ss: false,
                    kind: AccessKind::Write,
                },
                false,
                |_| true,
            );
            let expected = match outcome {
                ExpectedOutcome::Success => {
                    let mut final_ctx = ctx.clone();
                    final_ctx.set_rip(sentinel);
                    expect::sentinel_frame(kit, final_ctx, quirks)
                }
                ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            };

            if run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)? {
                let full = image(kit, op, mode);
                let mut want = full[..written as usize].to_vec();
                want.extend(std::iter::repeat(GUARD).take((len - written) as usize + 1));
                check_memory(kit, reporter, "partial image", buf, &want);
            }
            Ok(())
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("ds slot: {err}")),
        }
    }
    Ok(())
}

/// Slide the destination across a not-present page edge and assert #PF with
/// the first inaccessible linear address in CR2, bytes before it committed.
#[allow(clippy::too_many_arguments)]
fn page_boundary<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    op: TableOp,
    code_page: u64,
    data_page: u64,
) -> Result<(), FatalError> {
    let len = image_len(mode);
    let Some(second_page) = setup_or_skip(reporter, "guard page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };
    if second_page != data_page + 0x1000 {
        // The sweep needs two adjacent pages.
        reporter.skip("non-adjacent data pages");
        return Ok(());
    }
    if setup_or_skip(
        reporter,
        "unmap guard page",
        kit.protect_page(second_page, 0x1000, PageFlags::empty(), PageFlags::PRESENT),
    )
    .is_none()
    {
        return Ok(());
    }

    let edge = 0x1000u64; // offset of the page edge within the scratch DS
    for off in boundary_axis(edge, len) {
        reporter.next_step();
        let buf = data_page + off;
        kit.write_mem(buf - 1, &[GUARD]);
        kit.write_mem(buf, &vec![GUARD; (edge.saturating_sub(off)).min(len) as usize]);

        let (snippet, ds) = if mode.is_64bit_code() {
            (encode(mode, op.modrm_reg(), buf, false), None)
        } else {
            (
                encode(mode, op.modrm_reg(), off, false),
                Some(DescriptorSpec::data(data_page as u32, 0x1FFF, 0)),
            )
        };
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + snippet.len() as u64, &UD2);

        let (seg_base, operand_off) = if mode.is_64bit_code() {
            (0, buf)
        } else {
            (data_page, off)
        };
        let (outcome, written) = expect::predict_mem_op(
            MemOp {
                offset: operand_off,
                len,
                seg_base,
                seg_limit: if mode.is_64bit_code() {
                    u64::MAX
                } else {
                    0x1FFF
                },
                through_ss: false,
                kind: AccessKind::Write,
            },
            false,
            |lin| lin < second_page,
        );

        let run_one = |kit: &mut K,
                       reporter: &mut Reporter,
                       ctx: xtrap_state::RegisterContext|
         -> Result<(), FatalError> {
            let sentinel = code_rip(kit, code_page) + snippet.len() as u64;
            let expected = match outcome {
                ExpectedOutcome::Success => {
                    let mut final_ctx = ctx.clone();
                    final_ctx.set_rip(sentinel);
                    expect::sentinel_frame(kit, final_ctx, quirks)
                }
                ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            };
            if run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)? {
                let full = image(kit, op, mode);
                let want = full[..written as usize].to_vec();
                if !want.is_empty() {
                    check_memory(kit, reporter, "partial image", buf, &want);
                }
            }
            Ok(())
        };

        match ds {
            Some(desc) => {
                let r = arena.with_descriptor(kit, &desc, |_, kit, sel| -> Result<(), FatalError> {
                    let mut ctx = base_context(kit, mode, 0, code_page);
                    ctx.set_seg(SegReg::Ds, sel);
                    run_one(kit, reporter, ctx)
                });
                match r {
                    Ok(inner) => inner?,
                    Err(err) => reporter.skip(&format!("ds slot: {err}")),
                }
            }
            None => {
                let ctx = base_context(kit, mode, 0, code_page);
                run_one(kit, reporter, ctx)?;
            }
        }
    }

    // Re-map the guard page for later families.
    let _ = kit.protect_page(second_page, 0x1000, PageFlags::PRESENT, PageFlags::empty());
    Ok(())
}
