//! Executor build limits and co-processor memory budgets.
//!
//! Defaults the firmware image is built with. The hosted executor treats
//! them as configuration defaults; the co-processor budgets are physical.

// ── Scheduling ───────────────────────────────────────────────────────────────

/// Scheduling table capacity (concurrently in-flight work items).
pub const MAX_SCHEDULED_WORK: usize = 4;

/// Maximum input descriptors per work item (two operands plus two scratch,
/// with one spare).
pub const MAX_INPUTS: usize = 5;

/// Dispatch queue depth for the control-core lane.
pub const CONTROL_QUEUE_DEPTH: usize = 4;

/// Dispatch queue depth for the co-processor lane.
pub const COPROCESSOR_QUEUE_DEPTH: usize = 4;

/// Table capacity above which the linear hazard scan is worth replacing
/// with a buffer-to-producer index.
pub const LINEAR_SCAN_SLOT_LIMIT: usize = 32;

// ── Co-processor memory ──────────────────────────────────────────────────────

/// Co-processor memory available to weights plus bias of one operator.
pub const WEIGHT_BIAS_BUDGET: usize = 15 * 1024;

/// Co-processor memory available to input plus output of one operator.
pub const INOUT_BUDGET: usize = 12 * 1024;

/// Largest single transfer the 16-bit length field can describe.
///
/// A length of exactly 65536 is sent as 65535; anything longer cannot be
/// represented and must be streamed.
pub const MAX_TRANSFER_LEN: usize = 1 << 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_fit_shared_window() {
        assert!(WEIGHT_BIAS_BUDGET + INOUT_BUDGET < crate::memmap::SHARED.size as usize);
    }
}
