//! Execution trace
//!
//! Opt-in record of scheduling events with a global sequence number. Tests
//! use it to check ordering (a consumer is never dispatched before its
//! producer retired); the CLI prints it with `--trace`.

use std::sync::atomic::{AtomicU64, Ordering};

use hetex_chip::units::ExecutionUnit;
use parking_lot::Mutex;

use crate::ops::OperatorId;
use crate::scheduler::WorkId;

/// One scheduling event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// Admission blocked on the item in `on`
    Stalled {
        /// Item being waited for
        on: WorkId,
    },
    /// Installed in the scheduling table
    Admitted,
    /// Picked up by a worker
    Dispatched,
    /// Retired; `ok` is false when the kernel failed
    Retired {
        /// Kernel outcome
        ok: bool,
    },
    /// A buffer was destroyed during retirement or a free request
    Destroyed {
        /// Buffer id
        buffer: u64,
    },
}

/// A recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    /// Global sequence number
    pub seq: u64,
    /// Work item concerned, if any
    pub work: Option<WorkId>,
    /// Operator concerned, if any
    pub op: Option<OperatorId>,
    /// Unit concerned, if any
    pub unit: Option<ExecutionUnit>,
    /// What happened
    pub kind: TraceKind,
}

/// Event log shared by the table and workers
#[derive(Debug, Default)]
pub struct TraceLog {
    enabled: bool,
    seq: AtomicU64,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceLog {
    /// Create a log; a disabled log drops every event
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub(crate) fn record(
        &self,
        work: Option<WorkId>,
        op: Option<OperatorId>,
        unit: Option<ExecutionUnit>,
        kind: TraceKind,
    ) {
        if !self.enabled {
            return;
        }
        let mut events = self.events.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        events.push(TraceEvent { seq, work, op, unit, kind });
    }

    /// Copy of every event so far, in sequence order
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Sequence number of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&TraceEvent) -> bool) -> Option<u64> {
        self.events.lock().iter().find(|e| pred(e)).map(|e| e.seq)
    }

    /// Drop recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
