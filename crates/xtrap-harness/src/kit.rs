//! The external test-kit runtime seam.
//!
//! These are the collaborators the engine consumes but does not implement:
//! context construction, the fault-intercepting executor, paging primitives,
//! and the scratch descriptor-table slots. Keeping them behind one trait lets
//! the same drivers run against real hardware glue or against the in-process
//! [`crate::reference::ReferenceKit`].

use bitflags::bitflags;
use thiserror::Error;

use xtrap_state::{CpuMode, RegisterContext, Selector, TableRegister, TrapFrame};

bitflags! {
    /// Page protection bits understood by [`TestKit::protect_page`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// What a freshly allocated scratch page will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Code,
    Data,
    Stack,
}

/// CPU capabilities the engine may need to gate scenarios on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFeature {
    /// IA-32e long mode is available.
    LongMode,
    /// 80486-or-later RF-flag behaviour on fault entry.
    Post486Rf,
    /// AMD-style handling of the operand-size prefix on 64-bit far branches
    /// (prefix honoured; Intel forces 64-bit).
    AmdFarBranchPrefix,
}

/// Test-infrastructure failure: the scenario could not even be set up.
///
/// These are reported once and the affected sub-test skipped; they never
/// count as CPU semantic failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("scratch page allocation failed")]
    AllocFailed,
    #[error("no free scratch descriptor slot")]
    NoScratchSlot,
    #[error("cpu feature prerequisite missing: {0}")]
    FeatureMissing(&'static str),
    #[error("unsupported cpu mode byte {0:#04x}")]
    BadMode(u8),
}

/// The run did not produce a capturable trap frame: the machine double
/// faulted or halted. Fatal to the whole run, reported distinctly from an
/// ordinary mismatch, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("double fault while running scenario")]
    DoubleFault,
    #[error("machine halted while running scenario")]
    MachineHalt,
}

/// The primitive runtime the engine runs on top of.
pub trait TestKit {
    /// Snapshot a valid resting state for `mode`, with `extra_stack` bytes of
    /// headroom reserved below the stack pointer.
    fn capture_context(&mut self, mode: CpuMode, extra_stack: u16) -> RegisterContext;

    /// Load `ctx`, execute until the first hardware exception, and return the
    /// captured frame. Never lets a fault escape; a double fault or halt is
    /// the fatal error instead.
    fn run_under_trap(&mut self, ctx: &RegisterContext) -> Result<TrapFrame, FatalError>;

    fn alloc_page(&mut self, kind: PageKind) -> Result<u64, SetupError>;
    fn protect_page(
        &mut self,
        addr: u64,
        len: u64,
        set: PageFlags,
        clear: PageFlags,
    ) -> Result<(), SetupError>;

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]);
    fn write_mem(&mut self, addr: u64, bytes: &[u8]);

    /// Well-known flat code/data selectors for each ring.
    fn code_selector(&self, ring: u8) -> Selector;
    fn data_selector(&self, ring: u8) -> Selector;

    /// IP offset at which code placed at linear `addr` executes under the
    /// kit's default code selectors for the current mode.
    fn code_offset(&self, addr: u64) -> u64 {
        addr
    }

    /// Scratch GDT slots owned by drivers for the duration of one scenario.
    fn scratch_slot_count(&self) -> usize;
    fn scratch_selector(&self, slot: usize) -> Selector;
    fn read_gdt_slot(&mut self, slot: usize) -> [u8; 8];
    fn write_gdt_slot(&mut self, slot: usize, raw: [u8; 8]);

    fn gdtr(&self) -> TableRegister;
    fn idtr(&self) -> TableRegister;
    fn set_gdtr(&mut self, reg: TableRegister);
    fn set_idtr(&mut self, reg: TableRegister);

    /// SS:SP the TSS supplies for an inner-ring stack switch.
    fn ring_stack(&self, ring: u8) -> (Selector, u64);
    fn set_ring_stack(&mut self, ring: u8, sel: Selector, sp: u64);

    fn has_feature(&self, feature: CpuFeature) -> bool;

    /// Clear DR0-DR7 and DR6 to their power-on values. Debug-register state
    /// is caller-visible across runs and must be reset by iterations that
    /// depend on it.
    fn reset_debug_regs(&mut self);
}
