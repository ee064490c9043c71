//! Expectation model: the fault-precedence state machine.
//!
//! Every predictor walks the documented check order and returns the outcome
//! of the first unsatisfied condition: descriptor/gate type, then gate
//! privilege, then presence, then target type/privilege, then segment limits,
//! then paging, then success. There is no partial outcome; each scenario maps
//! to exactly one terminal.
//!
//! The heavy per-descriptor rules live in `xtrap_state::protection` and are
//! shared with the reference executor; this module sequences them per
//! instruction family and turns the result into a full predicted [`TrapFrame`].

use xtrap_state::flags::RFLAGS_RF;
use xtrap_state::protection::{
    check_byte_range, check_call_gate, check_code_selector, check_stack_selector, is_canonical,
    AccessKind, CodeLoad, Fault, StackLoad,
};
use xtrap_state::{
    CpuMode, DescriptorSpec, Exception, RegisterContext, Selector, TrapFrame, TrapReason, Width,
};

use xtrap_harness::TestKit;

pub use xtrap_harness::reference::iret_flag_merge;

use crate::quirks::CpuQuirks;

/// Terminal outcome of the precedence walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutcome {
    Fault(Fault),
    Success,
}

impl ExpectedOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, ExpectedOutcome::Success)
    }
}

impl From<Result<(), Fault>> for ExpectedOutcome {
    fn from(r: Result<(), Fault>) -> Self {
        match r {
            Ok(()) => ExpectedOutcome::Success,
            Err(f) => ExpectedOutcome::Fault(f),
        }
    }
}

/// Predicted frame for a scenario that faults: registers are untouched (the
/// hardware contract is atomic fault-or-succeed), CR2 and the error code come
/// from the fault, and the handler flags image carries RF on post-486 parts.
pub fn fault_frame<K: TestKit>(
    kit: &K,
    ctx: &RegisterContext,
    fault: Fault,
    quirks: CpuQuirks,
) -> TrapFrame {
    let mut ctx = ctx.clone();
    ctx.cr2 = fault.cr2;
    let handler_rflags = if quirks.post_486_rf {
        ctx.rflags() | RFLAGS_RF
    } else {
        ctx.rflags()
    };
    TrapFrame {
        reason: TrapReason::Exception(fault.exception),
        error_code: fault.error_code,
        cr2: fault.cr2,
        ctx,
        handler_cs: kit.code_selector(0),
        handler_ss: kit.data_selector(0),
        handler_rflags,
    }
}

/// Predicted frame for a scenario that reaches the sentinel with final state
/// `ctx`. The sentinel is reported via a #UD the harness reclassifies, so the
/// handler flags image still carries RF on post-486 parts.
pub fn sentinel_frame<K: TestKit>(kit: &K, ctx: RegisterContext, quirks: CpuQuirks) -> TrapFrame {
    let handler_rflags = if quirks.post_486_rf {
        ctx.rflags() | RFLAGS_RF
    } else {
        ctx.rflags()
    };
    TrapFrame {
        reason: TrapReason::Sentinel,
        error_code: 0,
        cr2: 0,
        ctx,
        handler_cs: kit.code_selector(0),
        handler_ss: kit.data_selector(0),
        handler_rflags,
    }
}

/// A multi-byte memory operand access (steps 5 and 6 of the walk).
#[derive(Debug, Clone, Copy)]
pub struct MemOp {
    pub offset: u64,
    pub len: u64,
    pub seg_base: u64,
    pub seg_limit: u64,
    pub through_ss: bool,
    pub kind: AccessKind,
}

/// Per-byte limit-then-paging walk. Also reports how many bytes were legally
/// reachable before the first fault; for stores that is exactly the partial
/// image left in memory.
pub fn predict_mem_op(
    op: MemOp,
    user: bool,
    mut page_present: impl FnMut(u64) -> bool,
) -> (ExpectedOutcome, u64) {
    for i in 0..op.len {
        let r = check_byte_range(
            op.offset.wrapping_add(i),
            1,
            op.seg_limit,
            op.seg_base,
            op.through_ss,
            op.kind,
            user,
            &mut page_present,
        );
        if let Err(fault) = r {
            return (ExpectedOutcome::Fault(fault), i);
        }
    }
    (ExpectedOutcome::Success, op.len)
}

/// Far RET: CS checks run to completion before any SS/SP slot on the stack is
/// consulted; the target IP limit check comes after a successful SS load.
/// Returns the new CPL on success.
pub fn predict_far_ret(
    mode: CpuMode,
    cpl: u8,
    width: Width,
    cs: Selector,
    cs_desc: Option<&DescriptorSpec>,
    ip: u64,
    outer_ss: impl FnOnce(u8) -> (Selector, Option<DescriptorSpec>),
) -> Result<u8, Fault> {
    let new_cpl = check_code_selector(cs, cs_desc, cpl, CodeLoad::Return)?;
    let cs_desc = cs_desc.expect("return target validated");

    if new_cpl > cpl {
        let (ss, ss_desc) = outer_ss(new_cpl);
        check_stack_selector(ss, ss_desc.as_ref(), new_cpl, StackLoad::Return)?;
    }

    if mode.is_64bit_code() {
        if !is_canonical(ip) {
            return Err(Fault::gp0());
        }
    } else if (ip & width.ip_mask()) > cs_desc.effective_limit() {
        return Err(Fault::gp0());
    }
    Ok(new_cpl)
}

/// Direct far JMP/CALL to a code-segment selector.
pub fn predict_direct_transfer(
    mode: CpuMode,
    cpl: u8,
    width: Width,
    call: bool,
    sel: Selector,
    desc: Option<&DescriptorSpec>,
    offset: u64,
) -> Result<(), Fault> {
    let load = if call { CodeLoad::Call } else { CodeLoad::Jmp };
    check_code_selector(sel, desc, cpl, load)?;
    let desc = desc.expect("transfer target validated");

    let target = offset & width.ip_mask();
    if mode.is_64bit_code() {
        if !is_canonical(target) {
            return Err(Fault::gp0());
        }
    } else if target > desc.effective_limit() {
        return Err(Fault::gp0());
    }
    Ok(())
}

/// Far JMP/CALL through a call gate. `gate_type_ok` is whether the system
/// descriptor is a call gate at all (step 1); the gate DPL check is step 2,
/// gate presence step 3, and the target CS walk steps 3-4. Returns the new
/// CPL on success.
#[allow(clippy::too_many_arguments)]
pub fn predict_gate_transfer(
    cpl: u8,
    call: bool,
    gate_sel: Selector,
    gate_type_ok: bool,
    gate_dpl: u8,
    gate_present: bool,
    target_sel: Selector,
    target_desc: Option<&DescriptorSpec>,
    gate_offset: u64,
) -> Result<u8, Fault> {
    check_call_gate(gate_sel, gate_type_ok, gate_dpl, gate_present, cpl)?;

    if target_sel.is_null() {
        return Err(Fault::gp0());
    }
    let new_cpl = check_code_selector(target_sel, target_desc, cpl, CodeLoad::ThroughGate)?;
    let target_desc = target_desc.expect("gate target validated");

    if !call && new_cpl != cpl {
        return Err(Fault::gp_sel(target_sel));
    }
    if gate_offset > target_desc.effective_limit() {
        return Err(Fault::gp0());
    }
    Ok(new_cpl)
}

/// Successful-IRET summary: the privilege the frame commits to, the merged
/// flags image, and whether SS:SP came from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IretCommit {
    pub new_cpl: u8,
    pub rflags: u64,
    pub popped_stack: bool,
}

/// Full IRET precedence walk. `outer` supplies the SS slot (and its
/// descriptor) and is consulted only when the frame pops SS:SP; the target
/// page-presence closure runs last, after every selector check.
#[allow(clippy::too_many_arguments)]
pub fn predict_iret(
    mode: CpuMode,
    cpl: u8,
    width: Width,
    current_rflags: u64,
    ip: u64,
    cs: Selector,
    cs_desc: Option<&DescriptorSpec>,
    popped_rflags: u64,
    outer: impl FnOnce(u8) -> (Selector, Option<DescriptorSpec>),
    target_page_present: impl FnOnce(u64) -> bool,
) -> Result<IretCommit, Fault> {
    if let Some(fault) = iret_nt_conflict(width, current_rflags, popped_rflags) {
        return Err(fault);
    }
    if mode.is_64bit_code() && !is_canonical(ip) {
        return Err(Fault::gp0());
    }

    let new_cpl = check_code_selector(cs, cs_desc, cpl, CodeLoad::Return)?;
    let cs_desc = cs_desc.expect("return target validated");

    let popped_stack = width == Width::W64 || new_cpl > cpl;
    if popped_stack {
        let (ss, ss_desc) = outer(new_cpl);
        if new_cpl > cpl || !ss.is_null() {
            check_stack_selector(ss, ss_desc.as_ref(), new_cpl, StackLoad::Return)?;
        }
    }

    if !mode.is_64bit_code() && (ip & width.ip_mask()) > cs_desc.effective_limit() {
        return Err(Fault::gp0());
    }

    let target = cs_desc.base as u64 + (ip & width.ip_mask());
    if !target_page_present(target) {
        return Err(fetch_page_fault(target, new_cpl == 3));
    }

    Ok(IretCommit {
        new_cpl,
        rflags: iret_flag_merge(current_rflags, popped_rflags, width, cpl),
        popped_stack,
    })
}

/// IRET in 64-bit code: loading NT=1 while NT is already set is #GP(0) ahead
/// of every later check, including target-page presence.
pub fn iret_nt_conflict(width: Width, current_rflags: u64, popped_rflags: u64) -> Option<Fault> {
    use xtrap_state::flags::RFLAGS_NT;
    if width == Width::W64
        && (current_rflags & RFLAGS_NT) != 0
        && (popped_rflags & RFLAGS_NT) != 0
    {
        return Some(Fault::gp0());
    }
    None
}

/// Fault predicted when instruction fetch at the transfer target lands on a
/// not-present page.
pub fn fetch_page_fault(linear: u64, user: bool) -> Fault {
    use xtrap_state::selector::{pf_error_code, PF_INSTR};
    Fault {
        exception: Exception::PageFault,
        error_code: pf_error_code(false, false, user) | PF_INSTR,
        cr2: linear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xtrap_state::selector::selector_error_code;

    fn flat_code(dpl: u8) -> DescriptorSpec {
        DescriptorSpec {
            granularity: true,
            ..DescriptorSpec::code(0, 0xF_FFFF, dpl)
        }
    }

    #[test]
    fn far_ret_checks_cs_before_consulting_ss() {
        // Target CS RPL below CPL: the outer-SS closure must never run.
        let sel = Selector::new(5, false, 0);
        let desc = flat_code(0);
        let err = predict_far_ret(
            CpuMode::Prot32,
            3,
            Width::W32,
            sel,
            Some(&desc),
            0x1000,
            |_| panic!("SS consulted after CS failure"),
        )
        .unwrap_err();
        assert_eq!(err, Fault::gp_sel(sel));
    }

    #[test]
    fn far_ret_outer_ss_not_present_is_stack_fault() {
        let cs = Selector::new(5, false, 3);
        let cs_desc = flat_code(3);
        let ss = Selector::new(6, false, 3);
        let ss_desc = DescriptorSpec::data(0, 0xFFFF, 3).with_present(false);
        let err = predict_far_ret(
            CpuMode::Prot32,
            0,
            Width::W32,
            cs,
            Some(&cs_desc),
            0x10,
            |_| (ss, Some(ss_desc)),
        )
        .unwrap_err();
        assert_eq!(err, Fault::ss_sel(ss));
    }

    #[test]
    fn mem_op_reports_bytes_written_before_the_fault() {
        // Limit cuts two bytes into a six-byte store.
        let op = MemOp {
            offset: 14,
            len: 6,
            seg_base: 0,
            seg_limit: 15,
            through_ss: false,
            kind: AccessKind::Write,
        };
        let (outcome, written) = predict_mem_op(op, false, |_| true);
        assert_eq!(outcome, ExpectedOutcome::Fault(Fault::gp0()));
        assert_eq!(written, 2);
    }

    #[test]
    fn mem_op_page_fault_carries_first_bad_linear() {
        let op = MemOp {
            offset: 0xFFE,
            len: 6,
            seg_base: 0x1_0000,
            seg_limit: u32::MAX as u64,
            through_ss: false,
            kind: AccessKind::Write,
        };
        let (outcome, written) = predict_mem_op(op, false, |lin| lin < 0x1_1000);
        match outcome {
            ExpectedOutcome::Fault(f) => {
                assert_eq!(f.exception, Exception::PageFault);
                assert_eq!(f.cr2, 0x1_1000);
            }
            other => panic!("expected #PF, got {other:?}"),
        }
        assert_eq!(written, 2);
    }

    #[test]
    fn gate_type_beats_gate_presence_and_privilege() {
        let gate = Selector::new(7, false, 3);
        let err = predict_gate_transfer(
            3,
            true,
            gate,
            false, // not a call gate
            0,
            false,
            Selector::NULL,
            None,
            0,
        )
        .unwrap_err();
        assert_eq!(
            err.error_code,
            selector_error_code(gate, false, false)
        );
        assert_eq!(err.exception, Exception::GeneralProtection);
    }

    #[test]
    fn jmp_through_gate_must_not_change_privilege() {
        let gate = Selector::new(7, false, 3);
        let target = Selector::new(8, false, 0);
        let desc = flat_code(0);
        let err = predict_gate_transfer(3, false, gate, true, 3, true, target, Some(&desc), 0x10)
            .unwrap_err();
        assert_eq!(err, Fault::gp_sel(target));
    }

    #[test]
    fn nt_conflict_only_applies_to_64_bit_frames() {
        use xtrap_state::flags::RFLAGS_NT;
        assert_eq!(
            iret_nt_conflict(Width::W64, RFLAGS_NT, RFLAGS_NT),
            Some(Fault::gp0())
        );
        assert_eq!(iret_nt_conflict(Width::W32, RFLAGS_NT, RFLAGS_NT), None);
        assert_eq!(iret_nt_conflict(Width::W64, 0, RFLAGS_NT), None);
    }
}
