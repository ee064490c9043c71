//! LGDT/LIDT driver.
//!
//! Loads are privileged: CPL 0 only, and V8086 always takes #GP(0) regardless
//! of IOPL. The ring-0 scenarios load crafted images that keep both tables
//! usable, verify the new register value through the kit, and restore the old
//! one before moving on. The 16-bit operand size only loads a 24-bit base;
//! the store/load/store round trip must reproduce the stored image exactly.

use xtrap_state::protection::{AccessKind, Fault};
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, Selector, TableRegister, Width};

use xtrap_harness::{FatalError, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::quirks::CpuQuirks;
use crate::scenario::boundary_axis;

use super::{base_context, check_memory, code_rip, run_case, setup_or_skip, table_insn, UD2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableOp {
    Lgdt,
    Lidt,
}

impl TableOp {
    fn modrm_reg(self) -> u8 {
        match self {
            TableOp::Lgdt => 2,
            TableOp::Lidt => 3,
        }
    }

    fn store_reg(self) -> u8 {
        match self {
            TableOp::Lgdt => 0,
            TableOp::Lidt => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TableOp::Lgdt => "lgdt",
            TableOp::Lidt => "lidt",
        }
    }

    fn value<K: TestKit>(self, kit: &K) -> TableRegister {
        match self {
            TableOp::Lgdt => kit.gdtr(),
            TableOp::Lidt => kit.idtr(),
        }
    }

    fn restore<K: TestKit>(self, kit: &mut K, value: TableRegister) {
        match self {
            TableOp::Lgdt => kit.set_gdtr(value),
            TableOp::Lidt => kit.set_idtr(value),
        }
    }
}

/// Width the register is actually loaded at.
fn eff_width(mode: CpuMode) -> Width {
    if mode.is_64bit_code() {
        Width::W64
    } else {
        mode.width()
    }
}

fn image_len(mode: CpuMode) -> u64 {
    eff_width(mode).table_image_len() as u64
}

/// How the memory operand reaches a linear buffer in `mode`: the encoded
/// displacement plus whether a scratch DS over the data page is required
/// (16-bit displacements cannot reach the allocated pages).
fn operand_disp(mode: CpuMode, buf: u64, off: u64) -> (u64, bool) {
    if mode.is_real_or_v86() {
        (off, false)
    } else if mode.width() == Width::W16 {
        (off, true)
    } else {
        (buf, false)
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
    let Some(data_page) = setup_or_skip(reporter, "data page", kit.alloc_page(PageKind::Data))
    else {
        return Ok(());
    };
    let mut arena = ScratchSlotArena::new(kit);

    for op in [TableOp::Lgdt, TableOp::Lidt] {
        reporter.set_sub_test(&format!("{}/load", op.name()));
        ring0_load(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;

        if !mode.is_v86() {
            reporter.set_sub_test(&format!("{}/round-trip", op.name()));
            round_trip(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;
        }

        if mode.is_protected() && mode.width() == Width::W16 {
            reporter.set_sub_test(&format!("{}/base-truncate", op.name()));
            base_truncate(kit, &mut arena, reporter, mode, quirks, masks, op, code_page, data_page)?;
        }

        if mode.is_protected() {
            reporter.set_sub_test(&format!("{}/ring3", op.name()));
            ring3_faults(kit, reporter, mode, quirks, masks, op, code_page, data_page)?;
        }
    }

    if mode.is_protected() && !mode.is_64bit_code() {
        reporter.set_sub_test("lgdt/limit-boundary");
        read_boundary(kit, &mut arena, reporter, mode, quirks, masks, code_page, data_page)?;
    }
    Ok(())
}

/// Target register value for a successful load that keeps the table usable:
/// same base, a larger but still valid limit.
fn crafted(old: TableRegister) -> TableRegister {
    TableRegister::new(old.base, old.limit | 0x0F)
}

/// One scenario executed with the operand wired up for `mode`. `prep` writes
/// the buffer and produces the expected frame for the prepared context.
#[allow(clippy::too_many_arguments)]
fn with_operand<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    ring: u8,
    op_reg: u8,
    code_page: u64,
    data_page: u64,
    off: u64,
    body: impl FnOnce(&mut K, &mut Reporter, xtrap_state::RegisterContext, Vec<u8>, u64) -> Result<(), FatalError>,
) -> Result<(), FatalError> {
    let buf = data_page + off;
    let (disp, scratch) = operand_disp(mode, buf, off);
    let snippet = table_insn(mode, op_reg, disp, false);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + snippet.len() as u64, &UD2);
    let sentinel = code_rip(kit, code_page) + snippet.len() as u64;

    if scratch {
        let ds = DescriptorSpec::data(data_page as u32, 0xFFF, ring);
        let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
            let mut ctx = base_context(kit, mode, ring, code_page);
            ctx.set_seg(SegReg::Ds, sel.with_rpl(ring));
            body(kit, reporter, ctx, snippet.clone(), sentinel)
        });
        match r {
            Ok(inner) => inner,
            Err(err) => {
                reporter.skip(&format!("ds slot: {err}"));
                Ok(())
            }
        }
    } else {
        let mut ctx = base_context(kit, mode, ring, code_page);
        if mode.is_real_or_v86() {
            ctx.set_seg(SegReg::Ds, Selector((data_page >> 4) as u16));
        }
        body(kit, reporter, ctx, snippet, sentinel)
    }
}

#[allow(clippy::too_many_arguments)]
fn ring0_load<K: TestKit>(
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
    let old = op.value(kit);
    let wanted = crafted(old);
    let off = 0x80u64;

    with_operand(
        kit, arena, reporter, mode, 0, op.modrm_reg(), code_page, data_page, off,
        |kit, reporter, ctx, snippet, sentinel| {
            kit.write_mem(data_page + off, &wanted.to_image(eff_width(mode)));

            let expected = if mode.is_v86() {
                // Privileged even under IOPL 3.
                expect::fault_frame(kit, &ctx, Fault::gp0(), quirks)
            } else {
                let mut final_ctx = ctx.clone();
                final_ctx.set_rip(sentinel);
                expect::sentinel_frame(kit, final_ctx, quirks)
            };

            if run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)? {
                let now = op.value(kit);
                let want = if mode.is_v86() { old } else { wanted };
                if now != want {
                    reporter.fail(&format!(
                        "{} register: expected base {:#x} limit {:#x}, found base {:#x} limit {:#x}",
                        op.name(),
                        want.base,
                        want.limit,
                        now.base,
                        now.limit
                    ));
                }
            }
            op.restore(kit, old);
            Ok(())
        },
    )
}

/// Store, load the stored image back, store again: both images and the
/// register itself must be unchanged.
#[allow(clippy::too_many_arguments)]
fn round_trip<K: TestKit>(
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
    let old = op.value(kit);
    let len = image_len(mode) as usize;
    let first = 0x100u64;
    let second = 0x140u64;

    for (reg, off) in [
        (op.store_reg(), first),
        (op.modrm_reg(), first),
        (op.store_reg(), second),
    ] {
        reporter.next_step();
        with_operand(
            kit, arena, reporter, mode, 0, reg, code_page, data_page, off,
            |kit, reporter, ctx, snippet, sentinel| {
                let mut final_ctx = ctx.clone();
                final_ctx.set_rip(sentinel);
                let expected = expect::sentinel_frame(kit, final_ctx, quirks);
                run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)?;
                Ok(())
            },
        )?;
    }

    let mut first_image = vec![0u8; len];
    kit.read_mem(data_page + first, &mut first_image);
    check_memory(kit, reporter, "round-trip image", data_page + second, &first_image);
    if op.value(kit) != old {
        reporter.fail(&format!("{} register changed across round trip", op.name()));
        op.restore(kit, old);
    }
    Ok(())
}

/// 16-bit operand size: the high base byte in the image is ignored and the
/// register gets a 24-bit base.
#[allow(clippy::too_many_arguments)]
fn base_truncate<K: TestKit>(
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
    let old = op.value(kit);
    let wanted = crafted(old);
    let off = 0x180u64;

    with_operand(
        kit, arena, reporter, mode, 0, op.modrm_reg(), code_page, data_page, off,
        |kit, reporter, ctx, snippet, sentinel| {
            let mut image = wanted.to_image(Width::W32);
            image[5] = 0xFF; // high base byte, must be dropped
            kit.write_mem(data_page + off, &image);

            let mut final_ctx = ctx.clone();
            final_ctx.set_rip(sentinel);
            let expected = expect::sentinel_frame(kit, final_ctx, quirks);

            if run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)? {
                let now = op.value(kit);
                if now.base != (wanted.base & 0x00FF_FFFF) || now.limit != wanted.limit {
                    reporter.fail(&format!(
                        "{}: 24-bit base not honored: base {:#x} limit {:#x}",
                        op.name(),
                        now.base,
                        now.limit
                    ));
                }
            }
            op.restore(kit, old);
            Ok(())
        },
    )
}

/// CPL 3 takes #GP(0) before the operand is touched; the table register and
/// the buffer must be left alone.
#[allow(clippy::too_many_arguments)]
fn ring3_faults<K: TestKit>(
    kit: &mut K,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    op: TableOp,
    code_page: u64,
    data_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let old = op.value(kit);
    let off = 0x1C0u64;

    // The operand is never reached, so the flat ring-3 DS is fine even where
    // the displacement cannot address the buffer.
    let disp = if mode.width() == Width::W16 { off } else { data_page + off };
    let snippet = table_insn(mode, op.modrm_reg(), disp, false);
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + snippet.len() as u64, &UD2);
    let sentinel = code_rip(kit, code_page) + snippet.len() as u64;

    let ctx = base_context(kit, mode, 3, code_page);
    let expected = expect::fault_frame(kit, &ctx, Fault::gp0(), quirks);
    if run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)? {
        if op.value(kit) != old {
            reporter.fail(&format!("{} register changed by a faulting load", op.name()));
            op.restore(kit, old);
        }
    }
    Ok(())
}

/// Slide the 6-byte operand read across a scratch-DS limit; a load that
/// faults must leave the register untouched, one that fits loads the valid
/// image placed there.
#[allow(clippy::too_many_arguments)]
fn read_boundary<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
    data_page: u64,
) -> Result<(), FatalError> {
    let op = TableOp::Lgdt;
    let len = image_len(mode);
    let limit = 0x60u64;
    let old = op.value(kit);

    for off in boundary_axis(limit + 1, len) {
        reporter.next_step();
        let snippet = table_insn(mode, op.modrm_reg(), off, false);
        kit.write_mem(code_page, &snippet);
        kit.write_mem(code_page + snippet.len() as u64, &UD2);
        let sentinel = code_rip(kit, code_page) + snippet.len() as u64;

        // A fitting read must load something valid: the current value.
        kit.write_mem(data_page + off, &old.to_image(eff_width(mode)));

        let ds = DescriptorSpec::data(data_page as u32, limit as u32, 0);
        let r = arena.with_descriptor(kit, &ds, |_, kit, sel| -> Result<(), FatalError> {
            let mut ctx = base_context(kit, mode, 0, code_page);
            ctx.set_seg(SegReg::Ds, sel);

            let (outcome, _) = expect::predict_mem_op(
                MemOp {
                    offset: off,
                    len,
                    seg_base: data_page,
                    seg_limit: limit,
                    through_ss: false,
                    kind: AccessKind::Read,
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

            if run_case(kit, reporter, mode, &snippet, &ctx, &[sentinel], &expected, masks)?
                && op.value(kit) != old
            {
                reporter.fail("gdtr changed by a straddling load");
                op.restore(kit, old);
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
