//! Diagnostic sink: step counter, failure/skip accounting, mode-labelled
//! messages.
//!
//! Semantic mismatches and infrastructure skips are disjoint counters so a
//! broken allocation can never masquerade as a CPU behaviour bug. Every
//! failure is emitted exactly once, prefixed with the step id and CPU mode
//! label, and mirrored to `tracing`.

use tracing::{error, warn};

use xtrap_state::CpuMode;

#[derive(Debug)]
pub struct Reporter {
    entry: &'static str,
    mode: CpuMode,
    sub_test: String,
    /// Monotonic per-entry-point scenario counter.
    step: u64,
    failures: u64,
    skipped: u64,
    messages: Vec<String>,
}

impl Reporter {
    pub fn new(entry: &'static str, mode: CpuMode) -> Self {
        Self {
            entry,
            mode,
            sub_test: String::new(),
            step: 0,
            failures: 0,
            skipped: 0,
            messages: Vec::new(),
        }
    }

    /// Name the sub-test subsequent failures belong to.
    pub fn set_sub_test(&mut self, name: &str) {
        self.sub_test = name.to_string();
    }

    /// Advance the step counter; called once per scenario.
    pub fn next_step(&mut self) -> u64 {
        self.step += 1;
        self.step
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Record a semantic mismatch. The run continues.
    pub fn fail(&mut self, message: &str) {
        self.failures += 1;
        let line = format!(
            "{}/{}: step {} [{}]: {}",
            self.entry,
            self.mode.label(),
            self.step,
            self.sub_test,
            message
        );
        error!(target: "xtrap", "{line}");
        self.messages.push(line);
    }

    /// Record an infrastructure problem; the affected sub-test is skipped.
    pub fn skip(&mut self, message: &str) {
        self.skipped += 1;
        warn!(
            target: "xtrap",
            "{}/{}: step {} [{}]: skipped: {}",
            self.entry,
            self.mode.label(),
            self.step,
            self.sub_test,
            message
        );
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_and_skips_are_disjoint() {
        let mut r = Reporter::new("iret", CpuMode::Paged32);
        r.next_step();
        r.fail("vector mismatch");
        r.skip("alloc failed");
        assert_eq!(r.failures(), 1);
        assert_eq!(r.skipped(), 1);
    }

    #[test]
    fn message_carries_step_and_mode() {
        let mut r = Reporter::new("ret-far", CpuMode::Long64);
        r.set_sub_test("outer-ring");
        r.next_step();
        r.next_step();
        r.fail("boom");
        let msg = &r.messages()[0];
        assert!(msg.contains("step 2"), "{msg}");
        assert!(msg.contains("lm64"), "{msg}");
        assert!(msg.contains("outer-ring"), "{msg}");
    }
}
