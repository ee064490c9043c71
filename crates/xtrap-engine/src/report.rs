//! Machine-readable run report.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyOutcome {
    pub scenarios: u64,
    pub failures: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: String,
    pub families: BTreeMap<String, FamilyOutcome>,
    pub total_failures: u64,
    pub total_skipped: u64,
    pub fatal: Option<String>,
}

impl RunReport {
    pub fn new(mode_label: &str) -> Self {
        Self {
            mode: mode_label.to_string(),
            families: BTreeMap::new(),
            total_failures: 0,
            total_skipped: 0,
            fatal: None,
        }
    }

    pub fn record(&mut self, family: &str, scenarios: u64, failures: u64, skipped: u64) {
        let entry = self.families.entry(family.to_string()).or_default();
        entry.scenarios += scenarios;
        entry.failures += failures;
        entry.skipped += skipped;
        self.total_failures += failures;
        self.total_skipped += skipped;
    }

    pub fn print_summary(&self) {
        eprintln!(
            "xtrap [{}]: {} failures, {} skipped",
            self.mode, self.total_failures, self.total_skipped
        );
        for (family, outcome) in &self.families {
            eprintln!(
                "  {family}: {} scenarios, {} failures, {} skipped",
                outcome.scenarios, outcome.failures, outcome.skipped
            );
        }
        if let Some(fatal) = &self.fatal {
            eprintln!("  FATAL: {fatal}");
        }
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_across_families() {
        let mut report = RunReport::new("pe32");
        report.record("iret", 40, 2, 1);
        report.record("ret-far", 30, 0, 0);
        assert_eq!(report.total_failures, 2);
        assert_eq!(report.total_skipped, 1);
        assert_eq!(report.families.len(), 2);
    }

    #[test]
    fn report_round_trips_through_json() {
        let mut report = RunReport::new("lm64");
        report.record("store-tables", 12, 0, 0);
        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, "lm64");
        assert_eq!(back.families["store-tables"].scenarios, 12);
    }
}
