#![forbid(unsafe_code)]

//! Architectural data model for the protection/control-transfer conformance
//! engine.
//!
//! Everything in this crate is pure data and pure rules: CPU operating modes,
//! register contexts, segment selectors and descriptors, descriptor-table
//! pseudo-descriptors, captured trap frames, and the shared protection-check
//! helpers that both the expectation model and the reference executor walk.
//! No I/O, no execution.

pub mod descriptor;
pub mod flags;
pub mod mode;
pub mod protection;
pub mod regs;
pub mod selector;
pub mod tables;
pub mod trapframe;

pub use descriptor::{DescriptorSpec, GateSpec, SegAccess};
pub use mode::{CpuMode, Width};
pub use regs::RegisterContext;
pub use selector::Selector;
pub use tables::TableRegister;
pub use trapframe::{Exception, TrapFrame, TrapReason};
