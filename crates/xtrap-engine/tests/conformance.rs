//! End-to-end runs of every family against the reference kit.
//!
//! A conforming executor must produce zero mismatches in every mode; each
//! sabotage knob must surface as counted failures without aborting the run;
//! a fatal outcome must stop the family and land on the report.

use xtrap_engine::{entry, run_all, Family, STATUS_OK};
use xtrap_engine::quirks::CpuQuirks;
use xtrap_harness::{FatalError, ReferenceKit, Reporter, Sabotage};
use xtrap_state::CpuMode;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn run_family(kit: &mut ReferenceKit, mode: CpuMode, family: Family) -> Result<Reporter, FatalError> {
    let quirks = CpuQuirks::detect(kit);
    let mut reporter = Reporter::new(family.name(), mode);
    family.run(kit, mode, quirks, &mut reporter)?;
    Ok(reporter)
}

#[test]
fn conforming_reference_runs_cleanly_in_every_mode() {
    init_tracing();
    for mode in CpuMode::ALL {
        for family in Family::ALL {
            let mut kit = ReferenceKit::new(mode);
            let reporter = run_family(&mut kit, mode, family).unwrap();
            assert_eq!(
                reporter.failures(),
                0,
                "{}/{}: {:#?}",
                family.name(),
                mode.label(),
                reporter.messages()
            );
            assert!(
                reporter.step() > 0,
                "{}/{}: no scenarios ran",
                family.name(),
                mode.label()
            );
        }
    }
}

#[test]
fn amd_prefix_handling_runs_cleanly_in_64_bit() {
    init_tracing();
    let mut kit = ReferenceKit::new(CpuMode::Long64);
    kit.set_amd_far_prefix(true);
    let reporter = run_family(&mut kit, CpuMode::Long64, Family::FarBranch).unwrap();
    assert_eq!(reporter.failures(), 0, "{:#?}", reporter.messages());
}

#[test]
fn dropped_accessed_bit_is_a_counted_failure() {
    init_tracing();
    let mut kit = ReferenceKit::new(CpuMode::Prot32);
    kit.set_sabotage(Some(Sabotage::DropAccessedBit));
    let reporter = run_family(&mut kit, CpuMode::Prot32, Family::RetFar).unwrap();
    assert!(reporter.failures() > 0);
}

#[test]
fn zeroed_error_codes_are_counted_failures() {
    init_tracing();
    let mut kit = ReferenceKit::new(CpuMode::Prot32);
    kit.set_sabotage(Some(Sabotage::ZeroErrorCode));
    let reporter = run_family(&mut kit, CpuMode::Prot32, Family::RetFar).unwrap();
    assert!(reporter.failures() > 0);
}

#[test]
fn skewed_rip_is_a_counted_failure_and_the_run_continues() {
    init_tracing();
    let mut kit = ReferenceKit::new(CpuMode::Prot32);
    kit.set_sabotage(Some(Sabotage::SkewRip));
    let reporter = run_family(&mut kit, CpuMode::Prot32, Family::NearBranch).unwrap();
    assert!(reporter.failures() > 0);
    // Every scenario still ran; sabotage never aborts the family.
    assert!(reporter.step() > 1);
}

#[test]
fn fatal_outcome_aborts_the_family_but_not_the_entry_point() {
    init_tracing();
    let mut kit = ReferenceKit::new(CpuMode::Prot32);
    kit.set_fatal_on_run(1);
    let err = run_family(&mut kit, CpuMode::Prot32, Family::StoreTables).unwrap_err();
    assert_eq!(err, FatalError::DoubleFault);

    // The FFI-shaped entry point reports the fatal and still returns "ran".
    let mut kit = ReferenceKit::new(CpuMode::Prot32);
    kit.set_fatal_on_run(1);
    assert_eq!(
        entry(&mut kit, CpuMode::Prot32.raw(), Family::StoreTables),
        STATUS_OK
    );
}

#[test]
fn run_all_honours_filter_and_writes_the_report() {
    init_tracing();
    let path = std::env::temp_dir().join("xtrap-conformance-report.json");
    std::env::set_var("XTRAP_FILTER", "ret-near");
    std::env::set_var("XTRAP_REPORT_PATH", &path);

    let mut kit = ReferenceKit::new(CpuMode::Paged32);
    let report = run_all(&mut kit, CpuMode::Paged32.raw());

    std::env::remove_var("XTRAP_FILTER");
    std::env::remove_var("XTRAP_REPORT_PATH");

    assert_eq!(report.families.len(), 1);
    assert!(report.families.contains_key("ret-near"));
    assert_eq!(report.total_failures, 0);

    let json = std::fs::read_to_string(&path).unwrap();
    let back: xtrap_engine::report::RunReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.mode, "pp32");
    let _ = std::fs::remove_file(&path);

    // With the environment cleared, a fatal outcome lands on the report.
    let mut kit = ReferenceKit::new(CpuMode::Prot32);
    kit.set_fatal_on_run(3);
    let report = run_all(&mut kit, CpuMode::Prot32.raw());
    assert!(report.fatal.is_some());
}
