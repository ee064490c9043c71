#![forbid(unsafe_code)]

//! Trap-capture execution harness and the seam to the surrounding test-kit
//! runtime.
//!
//! The engine never talks to the CPU directly: everything goes through the
//! [`TestKit`] trait, which models the primitives the embedding runtime
//! provides (context capture, fault-intercepting execution, page allocation,
//! scratch descriptor slots). [`reference::ReferenceKit`] is a pure-software
//! implementation of the same seam used by the test suite.

pub mod arena;
pub mod harness;
pub mod kit;
pub mod reference;
pub mod report;

pub use arena::ScratchSlotArena;
pub use harness::{run_to_sentinel, RunOptions};
pub use kit::{CpuFeature, FatalError, PageFlags, PageKind, SetupError, TestKit};
pub use reference::{ReferenceKit, Sabotage};
pub use report::Reporter;
