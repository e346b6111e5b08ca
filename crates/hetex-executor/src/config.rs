//! Executor configuration
//!
//! Defaults match the firmware build constants in [`hetex_chip::limits`].
//! Every field can be overridden from the environment with
//! [`ExecutorConfig::from_env`].

use std::time::Duration;

use hetex_chip::limits;
use hetex_chip::memmap::MemoryClass;
use tracing::{debug, warn};

use crate::error::{ExecError, Result};
use crate::scheduler::MAX_SLOTS;

/// What retirement does when a kernel reports failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelFailurePolicy {
    /// Log the failure and retire the item as if it succeeded.
    #[default]
    RetireAsSuccess,
    /// Reclaim buffers as usual, but hand the failure to whoever waits on
    /// the item: stalled consumers, `wait` and `wait_all`.
    Propagate,
}

impl std::str::FromStr for KernelFailurePolicy {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retire" | "retire-as-success" => Ok(Self::RetireAsSuccess),
            "propagate" => Ok(Self::Propagate),
            other => Err(ExecError::invalid_config(format!("unknown failure policy '{other}'"))),
        }
    }
}

/// Co-processor memory one operator may occupy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoprocessorBudget {
    /// Bytes for weights plus bias
    pub weight_bias_bytes: usize,
    /// Bytes for input plus output
    pub inout_bytes: usize,
}

impl Default for CoprocessorBudget {
    fn default() -> Self {
        Self {
            weight_bias_bytes: limits::WEIGHT_BIAS_BUDGET,
            inout_bytes: limits::INOUT_BUDGET,
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Scheduling table capacity
    pub max_scheduled_work: usize,
    /// Maximum inputs per work item
    pub max_inputs: usize,
    /// Control-core lane queue depth
    pub control_queue_depth: usize,
    /// Co-processor lane queue depth
    pub coprocessor_queue_depth: usize,
    /// Bound on hazard and vacancy stalls; `None` waits forever
    pub admission_timeout: Option<Duration>,
    /// Bound on each co-processor round-trip; `None` waits forever
    pub remote_timeout: Option<Duration>,
    /// Failure handling on retirement
    pub kernel_failure_policy: KernelFailurePolicy,
    /// Co-processor memory budgets used to decide streaming
    pub budget: CoprocessorBudget,
    /// Record an execution trace
    pub trace: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_scheduled_work: limits::MAX_SCHEDULED_WORK,
            max_inputs: limits::MAX_INPUTS,
            control_queue_depth: limits::CONTROL_QUEUE_DEPTH,
            coprocessor_queue_depth: limits::COPROCESSOR_QUEUE_DEPTH,
            admission_timeout: None,
            remote_timeout: None,
            kernel_failure_policy: KernelFailurePolicy::default(),
            budget: CoprocessorBudget::default(),
            trace: false,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `HETEX_*` environment variables
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `HETEX_MAX_SCHEDULED_WORK` | `max_scheduled_work` |
    /// | `HETEX_QUEUE_DEPTH` | both lane depths |
    /// | `HETEX_ADMISSION_TIMEOUT_MS` | `admission_timeout` |
    /// | `HETEX_REMOTE_TIMEOUT_MS` | `remote_timeout` |
    /// | `HETEX_FAILURE_POLICY` | `retire` or `propagate` |
    /// | `HETEX_TRACE` | `1`/`true` enables the trace |
    /// | `HETEX_WEIGHT_BUDGET` | `budget.weight_bias_bytes` |
    /// | `HETEX_INOUT_BUDGET` | `budget.inout_bytes` |
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a variable does not parse or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn number(key: &str, raw: &str) -> Result<usize> {
            raw.trim()
                .parse()
                .map_err(|_| ExecError::invalid_config(format!("{key}={raw} is not a number")))
        }

        let mut cfg = Self::default();
        if let Some(v) = lookup("HETEX_MAX_SCHEDULED_WORK") {
            cfg.max_scheduled_work = number("HETEX_MAX_SCHEDULED_WORK", &v)?;
        }
        if let Some(v) = lookup("HETEX_QUEUE_DEPTH") {
            let depth = number("HETEX_QUEUE_DEPTH", &v)?;
            cfg.control_queue_depth = depth;
            cfg.coprocessor_queue_depth = depth;
        }
        if let Some(v) = lookup("HETEX_ADMISSION_TIMEOUT_MS") {
            let ms = number("HETEX_ADMISSION_TIMEOUT_MS", &v)? as u64;
            cfg.admission_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(v) = lookup("HETEX_REMOTE_TIMEOUT_MS") {
            let ms = number("HETEX_REMOTE_TIMEOUT_MS", &v)? as u64;
            cfg.remote_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(v) = lookup("HETEX_FAILURE_POLICY") {
            cfg.kernel_failure_policy = v.parse()?;
        }
        if let Some(v) = lookup("HETEX_TRACE") {
            cfg.trace = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("HETEX_WEIGHT_BUDGET") {
            cfg.budget.weight_bias_bytes = number("HETEX_WEIGHT_BUDGET", &v)?;
        }
        if let Some(v) = lookup("HETEX_INOUT_BUDGET") {
            cfg.budget.inout_bytes = number("HETEX_INOUT_BUDGET", &v)?;
        }

        debug!(?cfg, "Executor configuration from environment");
        cfg.validate()?;
        Ok(cfg)
    }

    /// Set the scheduling table capacity
    pub fn with_capacity(mut self, slots: usize) -> Self {
        self.max_scheduled_work = slots;
        self
    }

    /// Set both lane queue depths
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.control_queue_depth = depth;
        self.coprocessor_queue_depth = depth;
        self
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: KernelFailurePolicy) -> Self {
        self.kernel_failure_policy = policy;
        self
    }

    /// Set the co-processor budgets
    pub fn with_budget(mut self, budget: CoprocessorBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Bound admission stalls
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = Some(timeout);
        self
    }

    /// Bound co-processor round-trips
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }

    /// Enable the execution trace
    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero capacities or budgets.
    pub fn validate(&self) -> Result<()> {
        if self.max_scheduled_work == 0 || self.max_scheduled_work > MAX_SLOTS {
            return Err(ExecError::invalid_config(format!(
                "max_scheduled_work must be in 1..={MAX_SLOTS}, got {}",
                self.max_scheduled_work
            )));
        }
        if self.max_inputs == 0 {
            return Err(ExecError::invalid_config("max_inputs must be non-zero"));
        }
        if self.control_queue_depth == 0 || self.coprocessor_queue_depth == 0 {
            return Err(ExecError::invalid_config("queue depths must be non-zero"));
        }
        if self.budget.weight_bias_bytes == 0 || self.budget.inout_bytes == 0 {
            return Err(ExecError::invalid_config("co-processor budgets must be non-zero"));
        }
        if self.max_scheduled_work > limits::LINEAR_SCAN_SLOT_LIMIT {
            warn!(
                slots = self.max_scheduled_work,
                "Hazard scan is linear in table capacity; consider a buffer-to-producer index"
            );
        }
        Ok(())
    }
}

/// Sizes of the simulated memory pools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Control-core pool bytes
    pub control_bytes: u32,
    /// Co-processor pool bytes
    pub coprocessor_bytes: u32,
    /// Shared pool bytes
    pub shared_bytes: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            control_bytes: MemoryClass::ControlLocal.window().size,
            coprocessor_bytes: MemoryClass::CoprocessorLocal.window().size,
            shared_bytes: MemoryClass::Shared.window().size,
        }
    }
}

impl MemoryConfig {
    /// Pool size for one class, clamped to its window
    pub fn pool_bytes(&self, class: MemoryClass) -> u32 {
        let requested = match class {
            MemoryClass::ControlLocal => self.control_bytes,
            MemoryClass::CoprocessorLocal => self.coprocessor_bytes,
            MemoryClass::Shared => self.shared_bytes,
        };
        requested.min(class.window().size)
    }

    /// Create minimal pools for testing exhaustion
    #[cfg(test)]
    pub const fn minimal() -> Self {
        Self {
            control_bytes: 256,
            coprocessor_bytes: 256,
            shared_bytes: 256,
        }
    }
}
