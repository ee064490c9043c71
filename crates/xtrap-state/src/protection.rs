//! Shared protection-check rules.
//!
//! These are the CPU-documented validation sequences for control transfers,
//! expressed as pure functions over [`DescriptorSpec`] values. The expectation
//! model predicts outcomes by walking them; the reference executor applies
//! them before mutating state. Check ordering is load-bearing: an invalid
//! *type* always faults before the present bit is consulted, and privilege
//! failures beat not-present failures.

use crate::descriptor::DescriptorSpec;
use crate::selector::{pf_error_code, selector_error_code, Selector};
use crate::trapframe::Exception;

/// One predicted/observed fault: vector plus hardware error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub exception: Exception,
    pub error_code: u32,
    /// CR2 for page faults.
    pub cr2: u64,
}

impl Fault {
    pub fn gp0() -> Self {
        Self {
            exception: Exception::GeneralProtection,
            error_code: 0,
            cr2: 0,
        }
    }

    pub fn gp_sel(sel: Selector) -> Self {
        Self {
            exception: Exception::GeneralProtection,
            error_code: selector_error_code(sel, false, false),
            cr2: 0,
        }
    }

    pub fn np_sel(sel: Selector) -> Self {
        Self {
            exception: Exception::SegmentNotPresent,
            error_code: selector_error_code(sel, false, false),
            cr2: 0,
        }
    }

    pub fn ss_sel(sel: Selector) -> Self {
        Self {
            exception: Exception::StackFault,
            error_code: selector_error_code(sel, false, false),
            cr2: 0,
        }
    }

    pub fn ss0() -> Self {
        Self {
            exception: Exception::StackFault,
            error_code: 0,
            cr2: 0,
        }
    }

    pub fn ts_sel(sel: Selector) -> Self {
        Self {
            exception: Exception::InvalidTss,
            error_code: selector_error_code(sel, false, false),
            cr2: 0,
        }
    }

    pub fn pf(linear: u64, write: bool, user: bool) -> Self {
        Self {
            exception: Exception::PageFault,
            error_code: pf_error_code(false, write, user),
            cr2: linear,
        }
    }
}

/// Flavor of control transfer loading a code selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLoad {
    /// Far JMP directly to a code-segment selector.
    Jmp,
    /// Far CALL directly to a code-segment selector.
    Call,
    /// Target CS named by a call gate.
    ThroughGate,
    /// Far RET / IRET return CS popped off the stack.
    Return,
}

/// Validate a code selector for a far transfer. `None` for `desc` means the
/// selector points outside the descriptor table.
///
/// Returns the new CPL on success. For [`CodeLoad::Return`] the new CPL is
/// the selector's RPL; otherwise it is unchanged (conforming or same-ring)
/// or lowered by a gate transfer (handled by the caller).
pub fn check_code_selector(
    sel: Selector,
    desc: Option<&DescriptorSpec>,
    cpl: u8,
    load: CodeLoad,
) -> Result<u8, Fault> {
    if sel.is_null() {
        return Err(Fault::gp0());
    }
    let Some(desc) = desc else {
        return Err(Fault::gp_sel(sel));
    };

    // Type validity first: wrong type faults even if also not-present.
    if !desc.is_code() {
        return Err(Fault::gp_sel(sel));
    }

    match load {
        CodeLoad::Jmp | CodeLoad::Call => {
            if desc.is_conforming_code() {
                if desc.dpl > cpl {
                    return Err(Fault::gp_sel(sel));
                }
            } else {
                if sel.rpl() > cpl || desc.dpl != cpl {
                    return Err(Fault::gp_sel(sel));
                }
            }
        }
        CodeLoad::ThroughGate => {
            // Gate DPL was already checked; the target must not be less
            // privileged than the caller.
            if desc.dpl > cpl {
                return Err(Fault::gp_sel(sel));
            }
        }
        CodeLoad::Return => {
            if sel.rpl() < cpl {
                return Err(Fault::gp_sel(sel));
            }
            if desc.is_conforming_code() {
                if desc.dpl > sel.rpl() {
                    return Err(Fault::gp_sel(sel));
                }
            } else if desc.dpl != sel.rpl() {
                return Err(Fault::gp_sel(sel));
            }
        }
    }

    if !desc.present {
        return Err(Fault::np_sel(sel));
    }

    Ok(match load {
        CodeLoad::Return => sel.rpl(),
        CodeLoad::ThroughGate => {
            if desc.is_conforming_code() {
                cpl
            } else {
                desc.dpl
            }
        }
        CodeLoad::Jmp | CodeLoad::Call => cpl,
    })
}

/// Source of the SS value being validated, which decides the fault vector on
/// privilege/type violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackLoad {
    /// SS:SP popped off the stack by far RET / IRET to an outer ring.
    Return,
    /// SS:SP fetched from the TSS for an inner-ring gate transfer.
    TssSwitch,
}

/// Validate a stack selector for a privilege-level change to `new_cpl`.
pub fn check_stack_selector(
    sel: Selector,
    desc: Option<&DescriptorSpec>,
    new_cpl: u8,
    load: StackLoad,
) -> Result<(), Fault> {
    let bad = |sel| match load {
        StackLoad::Return => Fault::gp_sel(sel),
        StackLoad::TssSwitch => Fault::ts_sel(sel),
    };

    if sel.is_null() {
        return Err(match load {
            StackLoad::Return => Fault::gp0(),
            StackLoad::TssSwitch => Fault::ts_sel(sel),
        });
    }
    let Some(desc) = desc else {
        return Err(bad(sel));
    };

    if !desc.is_writable_data() {
        return Err(bad(sel));
    }
    if sel.rpl() != new_cpl || desc.dpl != new_cpl {
        return Err(bad(sel));
    }

    // Stack-segment not-present is #SS, not #NP.
    if !desc.present {
        return Err(Fault::ss_sel(sel));
    }
    Ok(())
}

/// Validate a call-gate descriptor itself (type, DPL, presence — in that
/// order) for a far JMP/CALL with requestor privilege `rpl` at `cpl`.
pub fn check_call_gate(
    sel: Selector,
    gate_type_ok: bool,
    gate_dpl: u8,
    gate_present: bool,
    cpl: u8,
) -> Result<(), Fault> {
    if !gate_type_ok {
        return Err(Fault::gp_sel(sel));
    }
    if cpl > gate_dpl || sel.rpl() > gate_dpl {
        return Err(Fault::gp_sel(sel));
    }
    if !gate_present {
        return Err(Fault::np_sel(sel));
    }
    Ok(())
}

/// Byte access direction for limit/paging checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Per-byte limit-then-paging walk over `[offset, offset + len)`.
///
/// Bytes are checked in ascending address order. For each byte the segment
/// limit is consulted first, then page presence, so a limit violation on an
/// earlier byte pre-empts a page fault on a later byte and vice versa. The
/// limit fault is #SS(0) for SS-relative accesses and #GP(0) otherwise.
pub fn check_byte_range(
    offset: u64,
    len: u64,
    seg_limit: u64,
    seg_base: u64,
    through_ss: bool,
    kind: AccessKind,
    user: bool,
    mut page_present: impl FnMut(u64) -> bool,
) -> Result<(), Fault> {
    for i in 0..len {
        let off = offset.wrapping_add(i);
        if off > seg_limit {
            return Err(if through_ss { Fault::ss0() } else { Fault::gp0() });
        }
        let linear = seg_base.wrapping_add(off);
        if !page_present(linear) {
            return Err(Fault::pf(linear, kind == AccessKind::Write, user));
        }
    }
    Ok(())
}

/// Canonical-address check for 64-bit mode (bits 63:48 sign-extend bit 47).
pub fn is_canonical(addr: u64) -> bool {
    let sign = (addr >> 47) & 1;
    let upper = addr >> 48;
    if sign == 0 {
        upper == 0
    } else {
        upper == 0xFFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(dpl: u8) -> DescriptorSpec {
        DescriptorSpec::code(0, 0xFFFF, dpl)
    }

    #[test]
    fn type_beats_present() {
        // A data segment that is also not-present must report #GP(sel), never #NP.
        let sel = Selector(0x28);
        let desc = DescriptorSpec::data(0, 0xFFFF, 0).with_present(false);
        let err = check_code_selector(sel, Some(&desc), 0, CodeLoad::Jmp).unwrap_err();
        assert_eq!(err, Fault::gp_sel(sel));
    }

    #[test]
    fn present_checked_after_privilege() {
        let sel = Selector(0x28).with_rpl(0);
        // DPL mismatch and not-present: privilege loses to nothing, #GP first.
        let desc = code(2).with_present(false);
        let err = check_code_selector(sel, Some(&desc), 0, CodeLoad::Jmp).unwrap_err();
        assert_eq!(err.exception, Exception::GeneralProtection);

        // Privilege fine, not-present: #NP with the selector error code.
        let desc = code(0).with_present(false);
        let err = check_code_selector(sel, Some(&desc), 0, CodeLoad::Jmp).unwrap_err();
        assert_eq!(err, Fault::np_sel(sel));
    }

    #[test]
    fn conforming_relaxes_dpl() {
        let sel = Selector(0x28).with_rpl(3);
        let conf = DescriptorSpec::code_conforming(0, 0xFFFF, 0);
        // CPL 3 through DPL-0 conforming code: allowed, CPL unchanged.
        assert_eq!(check_code_selector(sel, Some(&conf), 3, CodeLoad::Jmp), Ok(3));
        // Non-conforming DPL 0 from CPL 3: #GP.
        let nonconf = code(0);
        assert!(check_code_selector(sel, Some(&nonconf), 3, CodeLoad::Jmp).is_err());
    }

    #[test]
    fn return_to_inner_ring_rejected() {
        // RET target RPL below CPL is #GP(sel) regardless of descriptor.
        let sel = Selector(0x28).with_rpl(0);
        let desc = code(0);
        let err = check_code_selector(sel, Some(&desc), 3, CodeLoad::Return).unwrap_err();
        assert_eq!(err, Fault::gp_sel(sel));
    }

    #[test]
    fn return_new_cpl_is_rpl() {
        let sel = Selector(0x28).with_rpl(3);
        let desc = code(3);
        assert_eq!(
            check_code_selector(sel, Some(&desc), 0, CodeLoad::Return),
            Ok(3)
        );
    }

    #[test]
    fn stack_selector_not_present_is_ss() {
        let sel = Selector(0x30).with_rpl(3);
        let desc = DescriptorSpec::data(0, 0xFFFF, 3).with_present(false);
        let err = check_stack_selector(sel, Some(&desc), 3, StackLoad::Return).unwrap_err();
        assert_eq!(err, Fault::ss_sel(sel));
    }

    #[test]
    fn stack_selector_wrong_type_vector_depends_on_source() {
        let sel = Selector(0x30).with_rpl(3);
        let ro = DescriptorSpec::data_read_only(0, 0xFFFF, 3);
        assert_eq!(
            check_stack_selector(sel, Some(&ro), 3, StackLoad::Return).unwrap_err(),
            Fault::gp_sel(sel)
        );
        assert_eq!(
            check_stack_selector(sel, Some(&ro), 3, StackLoad::TssSwitch).unwrap_err(),
            Fault::ts_sel(sel)
        );
    }

    #[test]
    fn gate_privilege_beats_presence() {
        let sel = Selector(0x38).with_rpl(3);
        // Gate DPL 0, caller CPL 3, gate also absent: #GP wins.
        assert_eq!(
            check_call_gate(sel, true, 0, false, 3).unwrap_err(),
            Fault::gp_sel(sel)
        );
        // Privilege fine, absent gate: #NP.
        assert_eq!(
            check_call_gate(sel, true, 3, false, 3).unwrap_err(),
            Fault::np_sel(sel)
        );
    }

    #[test]
    fn byte_range_limit_beats_later_page_fault() {
        // Limit cuts at offset 4; page absent from offset 2. The limit check
        // only fires at offset 5, so the page fault at offset 2 wins.
        let err = check_byte_range(0, 6, 4, 0x1000, false, AccessKind::Write, false, |lin| {
            lin < 0x1002
        })
        .unwrap_err();
        assert_eq!(err.exception, Exception::PageFault);
        assert_eq!(err.cr2, 0x1002);

        // Limit cuts at offset 1; pages all present: #GP(0) at the second byte.
        let err = check_byte_range(0, 6, 1, 0x1000, false, AccessKind::Write, false, |_| true)
            .unwrap_err();
        assert_eq!(err, Fault::gp0());
    }

    #[test]
    fn byte_range_ss_flavour() {
        let err = check_byte_range(10, 4, 8, 0, true, AccessKind::Write, false, |_| true)
            .unwrap_err();
        assert_eq!(err, Fault::ss0());
    }

    #[test]
    fn canonical_boundaries() {
        assert!(is_canonical(0x0000_7FFF_FFFF_FFFF));
        assert!(!is_canonical(0x0000_8000_0000_0000));
        assert!(is_canonical(0xFFFF_8000_0000_0000));
        assert!(!is_canonical(0xFFFF_7FFF_FFFF_FFFF));
    }
}
