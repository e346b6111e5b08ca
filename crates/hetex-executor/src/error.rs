//! Error types for executor operations

use hetex_chip::units::ExecutionUnit;
use thiserror::Error;

use crate::ops::OperatorId;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors that can occur while scheduling or running operators
#[derive(Debug, Error)]
pub enum ExecError {
    /// Allocator exhausted, or a persistent buffer was allocated without a base
    #[error("Out of memory: {reason}")]
    OutOfMemory {
        /// Reason for failure
        reason: String,
    },

    /// Remap on a buffer that cannot be re-pointed
    #[error("Invalid remap: {reason}")]
    InvalidRemap {
        /// Reason for failure
        reason: String,
    },

    /// Submission to the co-processor failed
    #[error("Remote dispatch failed: {reason}")]
    RemoteDispatchFailed {
        /// Reason for failure
        reason: String,
    },

    /// Operator id is not in the registration table
    #[error("Unknown operator {op:?}")]
    UnknownOperator {
        /// Requested operator
        op: OperatorId,
    },

    /// Operator registered, but not runnable on the requested unit
    #[error("Operator {op:?} is not supported on the {unit} unit")]
    UnsupportedUnit {
        /// Requested operator
        op: OperatorId,
        /// Requested unit
        unit: ExecutionUnit,
    },

    /// Operand list or sizes do not match the operator
    #[error("Invalid operand: {reason}")]
    InvalidOperand {
        /// Reason for failure
        reason: String,
    },

    /// Buffer has no backing memory
    #[error("Buffer {buffer} is not backed by memory")]
    NotBacked {
        /// Buffer id
        buffer: u64,
    },

    /// Buffer already has backing memory
    #[error("Buffer {buffer} is already backed by memory")]
    AlreadyBacked {
        /// Buffer id
        buffer: u64,
    },

    /// Kernel reported failure
    #[error("Kernel {op:?} failed: {reason}")]
    KernelFailed {
        /// Operator that failed
        op: OperatorId,
        /// Reason reported by the kernel
        reason: String,
    },

    /// Bounded wait elapsed
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for failure
        reason: String,
    },

    /// Access outside any backed memory region
    #[error("Memory access fault at {address:#010x} ({len} bytes)")]
    Memory {
        /// Faulting address
        address: u32,
        /// Access length
        len: usize,
    },

    /// Executor lanes have been shut down
    #[error("Executor is shut down")]
    ShutDown,
}

impl ExecError {
    /// Create an out of memory error
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Create an invalid remap error
    pub fn invalid_remap(reason: impl Into<String>) -> Self {
        Self::InvalidRemap {
            reason: reason.into(),
        }
    }

    /// Create a remote dispatch failed error
    pub fn remote_dispatch_failed(reason: impl Into<String>) -> Self {
        Self::RemoteDispatchFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid operand error
    pub fn invalid_operand(reason: impl Into<String>) -> Self {
        Self::InvalidOperand {
            reason: reason.into(),
        }
    }

    /// Create a kernel failed error
    pub fn kernel_failed(op: OperatorId, reason: impl Into<String>) -> Self {
        Self::KernelFailed {
            op,
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a timeout error from a duration
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
