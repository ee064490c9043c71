//! CPU-generation capability set, resolved once per run.
//!
//! Generation-conditional behaviour (RF on fault entry, AMD operand-size
//! prefix handling on 64-bit far branches) is captured here and threaded into
//! the expectation model, instead of vendor checks scattered through drivers.

use xtrap_harness::{CpuFeature, TestKit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQuirks {
    /// 80486-and-later parts set RFLAGS.RF in the handler-entry flags image.
    pub post_486_rf: bool,
    /// AMD parts honour the 0x66 prefix on 64-bit far branches; Intel forces
    /// a 32-bit offset unless REX.W is present.
    pub amd_far_prefix: bool,
    pub long_mode: bool,
}

impl CpuQuirks {
    pub fn detect<K: TestKit>(kit: &K) -> Self {
        Self {
            post_486_rf: kit.has_feature(CpuFeature::Post486Rf),
            amd_far_prefix: kit.has_feature(CpuFeature::AmdFarBranchPrefix),
            long_mode: kit.has_feature(CpuFeature::LongMode),
        }
    }
}
