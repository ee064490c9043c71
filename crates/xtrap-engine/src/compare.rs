//! Field-by-field trap-frame comparison.
//!
//! Vector and error code are compared exactly. Register state is compared
//! field by field under a mask table: RF in the handler flags image is only
//! meaningful on post-486 parts, and families may declare further flag bits
//! non-deterministic. Every mismatch is reported through the sink with the
//! current step id and mode label plus a disassembly of the snippet bytes;
//! nothing is silently ignored.

use std::fmt::Write as _;

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use xtrap_state::flags::RFLAGS_RF;
use xtrap_state::regs::SegReg;
use xtrap_state::{CpuMode, TrapFrame, TrapReason};

use xtrap_harness::Reporter;

use crate::quirks::CpuQuirks;

/// Which frame bits participate in the comparison.
#[derive(Debug, Clone, Copy)]
pub struct CompareMasks {
    /// Mask over the captured context RFLAGS.
    pub rflags: u64,
    /// Mask over the raw handler-entry flags image.
    pub handler_rflags: u64,
}

impl CompareMasks {
    pub fn new(quirks: CpuQuirks) -> Self {
        Self {
            rflags: u64::MAX,
            // Pre-486 parts do not set RF on fault entry; its value is not
            // part of the contract there.
            handler_rflags: if quirks.post_486_rf {
                u64::MAX
            } else {
                !RFLAGS_RF
            },
        }
    }

    /// Exclude additional context-flag bits from the comparison.
    pub fn ignore_flags(mut self, bits: u64) -> Self {
        self.rflags &= !bits;
        self
    }
}

/// Compare `actual` against `expected`; on mismatch, report one failure with
/// a structural diff and return `false`.
pub fn compare_frames(
    reporter: &mut Reporter,
    mode: CpuMode,
    snippet: &[u8],
    expected: &TrapFrame,
    actual: &TrapFrame,
    masks: CompareMasks,
) -> bool {
    let mut diff = String::new();

    if expected.reason != actual.reason {
        push_diff(
            &mut diff,
            "reason",
            &format_reason(expected.reason),
            &format_reason(actual.reason),
        );
    }
    if expected.error_code != actual.error_code {
        push_diff(
            &mut diff,
            "error_code",
            &format!("{:#x}", expected.error_code),
            &format!("{:#x}", actual.error_code),
        );
    }
    if expected.cr2 != actual.cr2 {
        push_diff(
            &mut diff,
            "cr2",
            &format!("{:#x}", expected.cr2),
            &format!("{:#x}", actual.cr2),
        );
    }

    let (e, a) = (&expected.ctx, &actual.ctx);
    if e.rip() != a.rip() {
        push_diff(
            &mut diff,
            "rip",
            &format!("{:#x}", e.rip()),
            &format!("{:#x}", a.rip()),
        );
    }
    for i in 0..16 {
        if e.gpr[i] != a.gpr[i] {
            push_diff(
                &mut diff,
                &format!("gpr[{i}]"),
                &format!("{:#x}", e.gpr[i]),
                &format!("{:#x}", a.gpr[i]),
            );
        }
    }
    if (e.rflags() ^ a.rflags()) & masks.rflags != 0 {
        push_diff(
            &mut diff,
            "rflags",
            &format!("{:#x}", e.rflags()),
            &format!("{:#x}", a.rflags()),
        );
    }
    for reg in SegReg::ALL {
        if e.seg(reg) != a.seg(reg) {
            push_diff(
                &mut diff,
                reg.name(),
                &format!("{:#06x}", e.seg(reg).0),
                &format!("{:#06x}", a.seg(reg).0),
            );
        }
    }
    if e.cpl != a.cpl {
        push_diff(&mut diff, "cpl", &e.cpl.to_string(), &a.cpl.to_string());
    }
    if e.cr2 != a.cr2 {
        push_diff(
            &mut diff,
            "ctx.cr2",
            &format!("{:#x}", e.cr2),
            &format!("{:#x}", a.cr2),
        );
    }

    if expected.handler_cs != actual.handler_cs {
        push_diff(
            &mut diff,
            "handler_cs",
            &format!("{:#06x}", expected.handler_cs.0),
            &format!("{:#06x}", actual.handler_cs.0),
        );
    }
    if expected.handler_ss != actual.handler_ss {
        push_diff(
            &mut diff,
            "handler_ss",
            &format!("{:#06x}", expected.handler_ss.0),
            &format!("{:#06x}", actual.handler_ss.0),
        );
    }
    if (expected.handler_rflags ^ actual.handler_rflags) & masks.handler_rflags != 0 {
        push_diff(
            &mut diff,
            "handler_rflags",
            &format!("{:#x}", expected.handler_rflags),
            &format!("{:#x}", actual.handler_rflags),
        );
    }

    if diff.is_empty() {
        return true;
    }

    let mut msg = String::new();
    let byte_hex = snippet
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(&mut msg, "frame mismatch");
    let _ = writeln!(&mut msg, "bytes: {byte_hex}");
    let _ = writeln!(&mut msg, "insn: {}", disassemble(snippet, mode));
    let _ = write!(&mut msg, "{diff}");
    reporter.fail(msg.trim_end());
    false
}

fn format_reason(reason: TrapReason) -> String {
    match reason {
        TrapReason::Sentinel => "sentinel".to_string(),
        TrapReason::Exception(e) => format!("{} (vector {})", e.mnemonic(), e.vector()),
    }
}

fn push_diff(out: &mut String, field: &str, expected: &str, actual: &str) {
    let _ = writeln!(out, "  {field}: expected {expected}, actual {actual}");
}

/// Disassemble the instruction under test for the failure report.
fn disassemble(bytes: &[u8], mode: CpuMode) -> String {
    if bytes.is_empty() {
        return "<no bytes>".to_string();
    }
    let mut decoder = Decoder::new(mode.width().bitness(), bytes, DecoderOptions::NONE);
    let instr = decoder.decode();
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(&instr, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use xtrap_state::{Exception, RegisterContext, Selector};

    fn frame(rip: u64) -> TrapFrame {
        let mut ctx = RegisterContext::new(CpuMode::Prot32);
        ctx.set_seg(SegReg::Cs, Selector(0x08));
        ctx.set_rip(rip);
        TrapFrame {
            reason: TrapReason::Sentinel,
            error_code: 0,
            cr2: 0,
            ctx,
            handler_cs: Selector(0x08),
            handler_ss: Selector(0x10),
            handler_rflags: 0x2,
        }
    }

    fn quirks() -> CpuQuirks {
        CpuQuirks {
            post_486_rf: true,
            amd_far_prefix: false,
            long_mode: true,
        }
    }

    #[test]
    fn equal_frames_pass_without_reporting() {
        let mut reporter = Reporter::new("test", CpuMode::Prot32);
        let f = frame(0x1000);
        assert!(compare_frames(
            &mut reporter,
            CpuMode::Prot32,
            &[0xC3],
            &f,
            &f.clone(),
            CompareMasks::new(quirks()),
        ));
        assert_eq!(reporter.failures(), 0);
    }

    #[test]
    fn rip_mismatch_reports_one_failure_with_disassembly() {
        let mut reporter = Reporter::new("test", CpuMode::Prot32);
        reporter.next_step();
        let expected = frame(0x1000);
        let actual = frame(0x1001);
        assert!(!compare_frames(
            &mut reporter,
            CpuMode::Prot32,
            &[0xC3],
            &expected,
            &actual,
            CompareMasks::new(quirks()),
        ));
        assert_eq!(reporter.failures(), 1);
        let msg = &reporter.messages()[0];
        assert!(msg.contains("rip"), "{msg}");
        assert!(msg.contains("ret"), "{msg}");
    }

    #[test]
    fn vector_and_error_code_compared_exactly() {
        let mut reporter = Reporter::new("test", CpuMode::Prot32);
        let expected = frame(0x1000);
        let mut actual = frame(0x1000);
        actual.reason = TrapReason::Exception(Exception::GeneralProtection);
        actual.error_code = 0x28;
        assert!(!compare_frames(
            &mut reporter,
            CpuMode::Prot32,
            &[0xC3],
            &expected,
            &actual,
            CompareMasks::new(quirks()),
        ));
        assert!(reporter.messages()[0].contains("#GP"));
    }

    #[test]
    fn pre_486_rf_is_masked_in_handler_flags() {
        let mut reporter = Reporter::new("test", CpuMode::Prot32);
        let expected = frame(0x1000);
        let mut actual = frame(0x1000);
        actual.handler_rflags |= RFLAGS_RF;
        let masks = CompareMasks::new(CpuQuirks {
            post_486_rf: false,
            ..quirks()
        });
        assert!(compare_frames(
            &mut reporter,
            CpuMode::Prot32,
            &[0xC3],
            &expected,
            &actual,
            masks,
        ));
    }
}
