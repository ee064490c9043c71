//! Captured machine state at the moment a trap (or the success sentinel) is
//! reached.

use crate::regs::RegisterContext;
use crate::selector::Selector;

/// Architecturally defined x86 exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,          // #DE
    Debug = 1,                // #DB
    Breakpoint = 3,           // #BP
    Overflow = 4,             // #OF
    InvalidOpcode = 6,        // #UD
    DoubleFault = 8,          // #DF
    InvalidTss = 10,          // #TS
    SegmentNotPresent = 11,   // #NP
    StackFault = 12,          // #SS
    GeneralProtection = 13,   // #GP
    PageFault = 14,           // #PF
    AlignmentCheck = 17,      // #AC
}

impl Exception {
    #[inline]
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Exception::DivideError => "#DE",
            Exception::Debug => "#DB",
            Exception::Breakpoint => "#BP",
            Exception::Overflow => "#OF",
            Exception::InvalidOpcode => "#UD",
            Exception::DoubleFault => "#DF",
            Exception::InvalidTss => "#TS",
            Exception::SegmentNotPresent => "#NP",
            Exception::StackFault => "#SS",
            Exception::GeneralProtection => "#GP",
            Exception::PageFault => "#PF",
            Exception::AlignmentCheck => "#AC",
        }
    }
}

/// How the run under trap ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    /// Execution reached the designated sentinel instruction.
    Sentinel,
    /// A hardware exception fired.
    Exception(Exception),
}

impl TrapReason {
    pub fn is_sentinel(self) -> bool {
        self == TrapReason::Sentinel
    }
}

/// The captured post-execution state of one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapFrame {
    pub reason: TrapReason,
    /// Hardware error code; zero when the exception pushes none.
    pub error_code: u32,
    /// CR2 at handler entry (page faults only; zero otherwise).
    pub cr2: u64,
    /// All register values at the moment of the trap.
    pub ctx: RegisterContext,
    /// CS the trap handler actually ran with.
    pub handler_cs: Selector,
    /// SS the trap handler actually ran with.
    pub handler_ss: Selector,
    /// Raw RFLAGS image at handler entry (RF and friends included).
    pub handler_rflags: u64,
}

impl TrapFrame {
    /// A frame for a run that reached the sentinel with final state `ctx`.
    pub fn sentinel(ctx: RegisterContext, handler_cs: Selector, handler_ss: Selector) -> Self {
        let handler_rflags = ctx.rflags();
        Self {
            reason: TrapReason::Sentinel,
            error_code: 0,
            cr2: 0,
            ctx,
            handler_cs,
            handler_ss,
            handler_rflags,
        }
    }
}
