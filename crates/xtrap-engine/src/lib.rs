#![forbid(unsafe_code)]

//! Conformance engine for x86 protection-checked control transfers.
//!
//! Seven instruction families (SIDT/SGDT, LIDT/LGDT, IRET, near JMP/CALL,
//! far JMP/CALL, near RET, far RET) are driven across the CPU mode matrix.
//! Each scenario predicts the resulting trap frame through the expectation
//! model, executes the instruction through a [`TestKit`], and compares the
//! two frames field by field. The public surface is FFI-shaped: one
//! `fn(u8) -> u8` entry point per family, keyed by the raw mode encoding,
//! plus [`run_all`] for driving every family in one pass.

pub mod compare;
pub mod expect;
pub mod families;
pub mod frames;
pub mod quirks;
pub mod report;
pub mod scenario;

use std::path::Path;

use xtrap_harness::{FatalError, Reporter, TestKit};
use xtrap_state::CpuMode;

use crate::quirks::CpuQuirks;
use crate::report::RunReport;

/// The entry point ran; any semantic mismatches went to the reporter.
pub const STATUS_OK: u8 = 0;
/// Unknown mode encoding or a prerequisite CPU feature is absent.
pub const STATUS_SKIPPED: u8 = 0x77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    StoreTables,
    LoadTables,
    Iret,
    NearBranch,
    FarBranch,
    RetNear,
    RetFar,
}

impl Family {
    pub const ALL: [Family; 7] = [
        Family::StoreTables,
        Family::LoadTables,
        Family::Iret,
        Family::NearBranch,
        Family::FarBranch,
        Family::RetNear,
        Family::RetFar,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Family::StoreTables => "store-tables",
            Family::LoadTables => "load-tables",
            Family::Iret => "iret",
            Family::NearBranch => "near-branch",
            Family::FarBranch => "far-branch",
            Family::RetNear => "ret-near",
            Family::RetFar => "ret-far",
        }
    }

    pub fn run<K: TestKit>(
        self,
        kit: &mut K,
        mode: CpuMode,
        quirks: CpuQuirks,
        reporter: &mut Reporter,
    ) -> Result<(), FatalError> {
        match self {
            Family::StoreTables => families::store_tables::run(kit, mode, quirks, reporter),
            Family::LoadTables => families::load_tables::run(kit, mode, quirks, reporter),
            Family::Iret => families::iret::run(kit, mode, quirks, reporter),
            Family::NearBranch => families::near_branch::run(kit, mode, quirks, reporter),
            Family::FarBranch => families::far_branch::run(kit, mode, quirks, reporter),
            Family::RetNear => families::ret_near::run(kit, mode, quirks, reporter),
            Family::RetFar => families::ret_far::run(kit, mode, quirks, reporter),
        }
    }
}

/// Resolve the raw mode byte and gate on required CPU features.
fn resolve<K: TestKit>(kit: &K, cpu_mode: u8) -> Option<(CpuMode, CpuQuirks)> {
    let mode = CpuMode::from_raw(cpu_mode)?;
    let quirks = CpuQuirks::detect(kit);
    if mode.is_long() && !quirks.long_mode {
        return None;
    }
    Some((mode, quirks))
}

/// Run one family in one mode. Returns [`STATUS_SKIPPED`] when the mode
/// encoding is unknown or needs an absent feature; everything else, including
/// a fatal executor outcome, is [`STATUS_OK`] with the details reported.
pub fn entry<K: TestKit>(kit: &mut K, cpu_mode: u8, family: Family) -> u8 {
    let Some((mode, quirks)) = resolve(kit, cpu_mode) else {
        return STATUS_SKIPPED;
    };
    let mut reporter = Reporter::new(family.name(), mode);
    if let Err(err) = family.run(kit, mode, quirks, &mut reporter) {
        tracing::error!(
            target: "xtrap",
            "{}/{}: fatal: {err}",
            family.name(),
            mode.label()
        );
    }
    STATUS_OK
}

pub fn entry_store_tables<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::StoreTables)
}

pub fn entry_load_tables<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::LoadTables)
}

pub fn entry_iret<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::Iret)
}

pub fn entry_near_branch<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::NearBranch)
}

pub fn entry_far_branch<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::FarBranch)
}

pub fn entry_ret_near<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::RetNear)
}

pub fn entry_ret_far<K: TestKit>(kit: &mut K, cpu_mode: u8) -> u8 {
    entry(kit, cpu_mode, Family::RetFar)
}

/// Run every family in `cpu_mode` and collect a [`RunReport`].
///
/// `XTRAP_FILTER` restricts the run to families whose name contains the
/// value; `XTRAP_REPORT_PATH` additionally writes the report as JSON. A
/// fatal executor outcome stops the run and is recorded on the report.
pub fn run_all<K: TestKit>(kit: &mut K, cpu_mode: u8) -> RunReport {
    let label = CpuMode::from_raw(cpu_mode).map_or("unknown", CpuMode::label);
    let mut report = RunReport::new(label);

    if let Some((mode, quirks)) = resolve(kit, cpu_mode) {
        let filter = std::env::var("XTRAP_FILTER").ok();
        for family in Family::ALL {
            if let Some(filter) = &filter {
                if !family.name().contains(filter.as_str()) {
                    continue;
                }
            }
            let mut reporter = Reporter::new(family.name(), mode);
            let outcome = family.run(kit, mode, quirks, &mut reporter);
            report.record(
                family.name(),
                reporter.step(),
                reporter.failures(),
                reporter.skipped(),
            );
            if let Err(err) = outcome {
                report.fatal = Some(err.to_string());
                break;
            }
        }
    }

    if let Ok(path) = std::env::var("XTRAP_REPORT_PATH") {
        if let Err(err) = report.write_json(Path::new(&path)) {
            tracing::error!(target: "xtrap", "failed to write report to {path}: {err}");
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use xtrap_harness::ReferenceKit;

    #[test]
    fn family_names_are_distinct() {
        for a in Family::ALL {
            for b in Family::ALL {
                if a != b {
                    assert_ne!(a.name(), b.name());
                }
            }
        }
    }

    #[test]
    fn unknown_mode_encoding_is_skipped() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        assert_eq!(entry(&mut kit, 0xFF, Family::Iret), STATUS_SKIPPED);
    }
}
