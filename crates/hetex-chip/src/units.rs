//! Execution units.
//!
//! The SoC pairs a general-purpose control core with a fixed-point DSP
//! co-processor. Every scheduled operator runs on exactly one of them.

use std::fmt;

/// An execution unit capable of running operator kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionUnit {
    /// The control core. Kernels run as direct calls on its worker.
    Control,
    /// The DSP co-processor. Kernels run behind the RPC bridge.
    Coprocessor,
}

impl ExecutionUnit {
    /// Both units, in lane order.
    pub const ALL: [Self; 2] = [Self::Control, Self::Coprocessor];

    /// Lane index used for per-unit tables.
    pub const fn index(self) -> usize {
        match self {
            Self::Control => 0,
            Self::Coprocessor => 1,
        }
    }

    /// Short name used in thread names and log fields.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Coprocessor => "coproc",
        }
    }
}

impl fmt::Display for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
