//! Near JMP/CALL driver (EB, E9, E8).
//!
//! The target is limit-checked (canonical-checked in 64-bit code) before the
//! CALL pushes its return address, so a bad target never touches the stack
//! and a bad stack faults only after a good target. Successful CALLs must
//! leave exactly the next-instruction offset on the stack.

use xtrap_state::protection::{AccessKind, Fault};
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, DescriptorSpec, RegisterContext, Width};

use xtrap_harness::{FatalError, PageFlags, PageKind, Reporter, ScratchSlotArena, TestKit};

use crate::compare::CompareMasks;
use crate::expect::{self, ExpectedOutcome, MemOp};
use crate::quirks::CpuQuirks;

use super::{base_context, check_memory, code_rip, run_case, setup_or_skip, UD2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NearOp {
    JmpShort,
    Jmp,
    Call,
}

impl NearOp {
    fn name(self) -> &'static str {
        match self {
            NearOp::JmpShort => "jmp-short",
            NearOp::Jmp => "jmp",
            NearOp::Call => "call",
        }
    }

    fn is_call(self) -> bool {
        self == NearOp::Call
    }

    /// Encode a branch whose target is `rel` bytes past the instruction end.
    fn encode(self, mode: CpuMode, rel: i64) -> Vec<u8> {
        match self {
            NearOp::JmpShort => vec![0xEB, rel as i8 as u8],
            NearOp::Jmp | NearOp::Call => {
                let opcode = if self.is_call() { 0xE8 } else { 0xE9 };
                if mode.width() == Width::W16 {
                    let r = (rel as i16).to_le_bytes();
                    vec![opcode, r[0], r[1]]
                } else {
                    let r = (rel as i32).to_le_bytes();
                    vec![opcode, r[0], r[1], r[2], r[3]]
                }
            }
        }
    }
}

/// Operand width of near branches: always 64-bit in 64-bit code.
fn branch_width(mode: CpuMode) -> Width {
    if mode.is_64bit_code() {
        Width::W64
    } else {
        mode.width()
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
    for op in [NearOp::JmpShort, NearOp::Jmp, NearOp::Call] {
        for &ring in rings {
            reporter.set_sub_test(&format!("{}/ring{ring}", op.name()));
            success_case(kit, reporter, mode, quirks, masks, op, ring, code_page)?;
        }
    }

    if mode.is_protected() {
        let mut arena = ScratchSlotArena::new(kit);

        if !mode.is_64bit_code() {
            reporter.set_sub_test("cs-limit");
            limit_case(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;

            reporter.set_sub_test("call-push-ss");
            push_ss_case(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
        }

        if mode.is_paged() {
            reporter.set_sub_test("call-push-pf");
            push_pf_case(kit, &mut arena, reporter, mode, quirks, masks, code_page)?;
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
    op: NearOp,
    ring: u8,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let gap = 0x10u64;
    let snippet = op.encode(mode, gap as i64);
    let len = snippet.len() as u64;

    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + len, &vec![0x90u8; gap as usize]);
    kit.write_mem(code_page + len + gap, &UD2);

    let ctx = base_context(kit, mode, ring, code_page);
    let next = code_rip(kit, code_page) + len;
    let target = next + gap;

    let mut final_ctx = ctx.clone();
    final_ctx.set_rip(target);
    if op.is_call() {
        let slot = branch_width(mode).slot_bytes();
        let sp = ctx.stack_ptr().wrapping_sub(slot) & mode.width().ip_mask();
        final_ctx.set_stack_ptr(sp);
    }
    let expected = expect::sentinel_frame(kit, final_ctx.clone(), quirks);

    if run_case(kit, reporter, mode, &snippet, &ctx, &[target], &expected, masks)? && op.is_call() {
        // The return offset must sit on the stack, byte-exact.
        let slot = branch_width(mode).slot_bytes() as usize;
        let ss_base = stack_base(kit, mode, &final_ctx);
        let want = &next.to_le_bytes()[..slot];
        check_memory(
            kit,
            reporter,
            "pushed return offset",
            ss_base.wrapping_add(final_ctx.stack_ptr()),
            want,
        );
    }
    Ok(())
}

/// Linear base of the stack segment in `ctx`.
fn stack_base<K: TestKit>(_kit: &K, mode: CpuMode, ctx: &RegisterContext) -> u64 {
    if mode.is_real_or_v86() {
        (ctx.seg(SegReg::Ss).0 as u64) << 4
    } else {
        // Flat ring stacks in every protected configuration used here.
        0
    }
}

/// Branch target past a short scratch-CS limit: #GP(0), no state change.
#[allow(clippy::too_many_arguments)]
fn limit_case<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let limit = 0x10u64;
    let target = 0x20u64;

    let mut cs = DescriptorSpec::code(code_page as u32, limit as u32, 0);
    cs.default_big = mode.width() == Width::W32;

    let snippet = NearOp::Jmp.encode(mode, 0);
    let len = snippet.len() as u64;
    let rel = target as i64 - len as i64;
    let snippet = NearOp::Jmp.encode(mode, rel);
    kit.write_mem(code_page, &snippet);

    let r = arena.with_descriptor(kit, &cs, |_, kit, sel| -> Result<(), FatalError> {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_seg(SegReg::Cs, sel);
        ctx.set_rip(0);

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

/// Good target, bad stack: the push wraps below a short scratch SS and takes
/// #SS(0) only after the target check passed.
#[allow(clippy::too_many_arguments)]
fn push_ss_case<K: TestKit>(
    kit: &mut K,
    arena: &mut ScratchSlotArena,
    reporter: &mut Reporter,
    mode: CpuMode,
    quirks: CpuQuirks,
    masks: CompareMasks,
    code_page: u64,
) -> Result<(), FatalError> {
    reporter.next_step();
    let gap = 0x10u64;
    let snippet = NearOp::Call.encode(mode, gap as i64);
    let len = snippet.len() as u64;
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + len, &vec![0x90u8; gap as usize]);
    kit.write_mem(code_page + len + gap, &UD2);

    let ss_limit = 0xFu64;
    let ss = DescriptorSpec::data(0, ss_limit as u32, 0);
    let r = arena.with_descriptor(kit, &ss, |_, kit, sel| -> Result<(), FatalError> {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_seg(SegReg::Ss, sel);
        // SP 0 wraps the push below the segment at every operand width.
        ctx.set_stack_ptr(0);

        let slot = branch_width(mode).slot_bytes();
        let push_at = ctx.stack_ptr().wrapping_sub(slot) & mode.width().ip_mask();
        let (outcome, _) = expect::predict_mem_op(
            MemOp {
                offset: push_at,
                len: slot,
                seg_base: 0,
                seg_limit: ss_limit,
                through_ss: true,
                kind: AccessKind::Write,
            },
            false,
            |_| true,
        );
        let expected = match outcome {
            ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            ExpectedOutcome::Success => {
                reporter.fail("push unexpectedly fits the scratch stack");
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

/// Good target, stack on a not-present page: #PF with the push address in
/// CR2 and the write bit in the error code.
#[allow(clippy::too_many_arguments)]
fn push_pf_case<K: TestKit>(
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

    let gap = 0x10u64;
    let snippet = NearOp::Call.encode(mode, gap as i64);
    let len = snippet.len() as u64;
    kit.write_mem(code_page, &snippet);
    kit.write_mem(code_page + len, &vec![0x90u8; gap as usize]);
    kit.write_mem(code_page + len + gap, &UD2);

    let slot = branch_width(mode).slot_bytes();
    let run_one = |kit: &mut K, reporter: &mut Reporter, ctx: RegisterContext, sp_base: u64|
     -> Result<(), FatalError> {
        let push_at = ctx.stack_ptr().wrapping_sub(slot) & mode.width().ip_mask();
        let (outcome, _) = expect::predict_mem_op(
            MemOp {
                offset: push_at,
                len: slot,
                seg_base: sp_base,
                seg_limit: if mode.is_64bit_code() { u64::MAX } else { 0xFFF },
                through_ss: true,
                kind: AccessKind::Write,
            },
            false,
            |_| false,
        );
        let expected = match outcome {
            ExpectedOutcome::Fault(fault) => expect::fault_frame(kit, &ctx, fault, quirks),
            ExpectedOutcome::Success => {
                reporter.fail("push unexpectedly succeeded on an unmapped page");
                return Ok(());
            }
        };
        run_case(kit, reporter, mode, &snippet, &ctx, &[], &expected, masks)?;
        Ok(())
    };

    if mode.is_64bit_code() {
        let mut ctx = base_context(kit, mode, 0, code_page);
        ctx.set_stack_ptr(pf_page + 0x10);
        run_one(kit, reporter, ctx, 0)?;
    } else {
        let ss = DescriptorSpec::data(pf_page as u32, 0xFFF, 0);
        let r = arena.with_descriptor(kit, &ss, |_, kit, sel| -> Result<(), FatalError> {
            let mut ctx = base_context(kit, mode, 0, code_page);
            ctx.set_seg(SegReg::Ss, sel);
            ctx.set_stack_ptr(0x10);
            run_one(kit, reporter, ctx, pf_page)
        });
        match r {
            Ok(inner) => inner?,
            Err(err) => reporter.skip(&format!("ss slot: {err}")),
        }
    }
    Ok(())
}
