// SPDX-License-Identifier: AGPL-3.0-only

//! Scheduling table and hazard detector
//!
//! A fixed-capacity table of in-flight work items behind one mutex, with a
//! condition variable per slot. Admission scans the occupied slots for
//! buffer conflicts with the incoming item and, on a hit, blocks the caller
//! on the conflicting slot until it retires, then rescans from the top.
//!
//! ```text
//!        admit                     stall requested
//! Free ─────────▶ Active ───────────────────────────▶ StallRequested
//!  ▲                │                                      │
//!  └──── retire ────┴──────────────── retire ──────────────┘
//! ```
//!
//! Conflicts, for an incoming item `N` against an in-flight item `S`:
//!
//! | Hazard | Condition |
//! |--------|-----------|
//! | read-after-write | an input of `N` is the output of `S` |
//! | write-after-write | the output of `N` is the output of `S` |
//! | write-after-read | the output of `N` is an input of `S` |
//!
//! The lock is always released while blocked and retirement signals under
//! it, so a producer's buffer transitions are visible before any stalled
//! consumer resumes. The scan is linear in `slots × inputs`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hetex_chip::units::ExecutionUnit;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::buffer::{Access, Buffer, Release, Role};
use crate::config::KernelFailurePolicy;
use crate::error::{ExecError, Result};
use crate::memory::{Address, MemorySystem};
use crate::ops::{OpParams, Operand, OperatorId, Variant};
use crate::trace::{TraceKind, TraceLog};

/// Generation-tagged handle to a scheduled work item
///
/// The slot index is the item's identity while it is in flight; the
/// generation makes a stale handle to a reused slot detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId {
    slot: u8,
    generation: u32,
}

impl WorkId {
    /// Slot index
    pub fn slot(self) -> usize {
        usize::from(self.slot)
    }

    /// Generation of the slot when the item was admitted
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}.{}", self.slot, self.generation)
    }
}

/// One operator invocation
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Unit that runs it
    pub unit: ExecutionUnit,
    /// Operator
    pub op: OperatorId,
    /// Kernel variant
    pub variant: Variant,
    /// Inputs, in kernel order; scratch buffers go last
    pub inputs: Vec<Buffer>,
    /// Output
    pub output: Buffer,
    /// Parameters, dropped on retirement
    pub params: OpParams,
}

impl WorkItem {
    /// Item with no inputs and no parameters
    pub fn new(unit: ExecutionUnit, op: OperatorId, output: &Buffer) -> Self {
        Self {
            unit,
            op,
            variant: Variant::Standard,
            inputs: Vec::new(),
            output: output.clone(),
            params: OpParams::None,
        }
    }

    /// Set the variant
    pub fn variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    /// Append an input
    pub fn input(mut self, buffer: &Buffer) -> Self {
        self.inputs.push(buffer.clone());
        self
    }

    /// Set the parameters
    pub fn params(mut self, params: OpParams) -> Self {
        self.params = params;
        self
    }
}

/// Externally visible slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for admission
    Free,
    /// Holds an in-flight item
    Active,
    /// Holds an in-flight item someone is waiting on
    StallRequested,
}

/// A kernel failure kept for the waiters of its item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelFailure {
    /// Failed item
    pub work: WorkId,
    /// Its operator
    pub op: OperatorId,
    /// Reported reason
    pub reason: String,
}

impl KernelFailure {
    fn to_error(&self) -> ExecError {
        ExecError::kernel_failed(self.op, format!("{}: {}", self.work, self.reason))
    }
}

/// An admitted item as a worker needs it, resolved under the table lock
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub id: WorkId,
    pub unit: ExecutionUnit,
    pub op: OperatorId,
    pub variant: Variant,
    pub inputs: Vec<Operand>,
    pub output: Operand,
    pub params: OpParams,
}

#[derive(Debug)]
struct Scheduled {
    item: WorkItem,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    stall_requested: bool,
    work: Option<Scheduled>,
}

#[derive(Debug)]
struct TableState {
    slots: Vec<Slot>,
    failures: Vec<KernelFailure>,
}

impl TableState {
    fn id(&self, slot: usize) -> WorkId {
        WorkId {
            slot: u8::try_from(slot).unwrap_or(u8::MAX),
            generation: self.slots[slot].generation,
        }
    }

    fn conflict(&self, item: &WorkItem) -> Option<(usize, &'static str)> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            let s = &slot.work.as_ref()?.item;
            if item.inputs.iter().any(|b| *b == s.output) {
                Some((idx, "read-after-write"))
            } else if item.output == s.output {
                Some((idx, "write-after-write"))
            } else if s.inputs.contains(&item.output) {
                Some((idx, "write-after-read"))
            } else {
                None
            }
        })
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.work.is_none())
    }

    fn occupied(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.work.is_some())
    }
}

type Deadline = Option<(Instant, Duration)>;

/// Most slots a table can address; [`WorkId`] carries the slot as a byte
pub const MAX_SLOTS: usize = u8::MAX as usize;

/// Table-wide settings
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    /// Slots
    pub capacity: usize,
    /// Maximum inputs per item
    pub max_inputs: usize,
    /// Bound on admission stalls
    pub admission_timeout: Option<Duration>,
    /// Failure handling
    pub policy: KernelFailurePolicy,
}

/// Fixed-capacity scheduling table
pub struct SchedulingTable {
    config: TableConfig,
    state: Mutex<TableState>,
    retired: Vec<Condvar>,
    vacancy: Condvar,
    memory: Arc<dyn MemorySystem>,
    trace: Arc<TraceLog>,
}

impl fmt::Debug for SchedulingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingTable")
            .field("config", &self.config)
            .field("occupancy", &self.occupancy())
            .finish_non_exhaustive()
    }
}

impl SchedulingTable {
    /// Create an empty table; capacity is clamped to [`MAX_SLOTS`]
    pub fn new(
        mut config: TableConfig,
        memory: Arc<dyn MemorySystem>,
        trace: Arc<TraceLog>,
    ) -> Self {
        if config.capacity > MAX_SLOTS {
            let requested = config.capacity;
            warn!(requested, max = MAX_SLOTS, "Scheduling table capacity clamped");
            config.capacity = MAX_SLOTS;
        }
        Self {
            state: Mutex::new(TableState {
                slots: (0..config.capacity).map(|_| Slot::default()).collect(),
                failures: Vec::new(),
            }),
            retired: (0..config.capacity).map(|_| Condvar::new()).collect(),
            vacancy: Condvar::new(),
            config,
            memory,
            trace,
        }
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Admit `item`, blocking on conflicting in-flight items
    ///
    /// With `output_is_also_input` the output is read and written in place
    /// and every input aliasing it takes the `InputOutput` role.
    ///
    /// # Errors
    ///
    /// - `InvalidOperand` for too many inputs or a read-only output
    /// - `NotBacked` if any buffer has no memory
    /// - `Timeout` if a stall outlasts the admission timeout
    /// - `KernelFailed` if the item this one stalled on failed and the
    ///   policy is `Propagate`
    pub fn admit(&self, item: WorkItem, output_is_also_input: bool) -> Result<WorkId> {
        if item.inputs.len() > self.config.max_inputs {
            return Err(ExecError::invalid_operand(format!(
                "{:?} has {} inputs, at most {} allowed",
                item.op,
                item.inputs.len(),
                self.config.max_inputs
            )));
        }
        if item.output.spec().access == Access::ReadOnly {
            return Err(ExecError::invalid_operand(format!(
                "output buffer {} is read-only",
                item.output.id()
            )));
        }

        let deadline = self.config.admission_timeout.map(|t| (Instant::now() + t, t));
        let mut state = self.state.lock();
        let slot = loop {
            if let Some((idx, hazard)) = state.conflict(&item) {
                let producer = state.id(idx);
                state.slots[idx].stall_requested = true;
                debug!(op = ?item.op, on = %producer, hazard, "Admission stalled");
                let stalled = TraceKind::Stalled { on: producer };
                self.trace.record(None, Some(item.op), Some(item.unit), stalled);
                self.wait_retired(&mut state, producer, deadline)?;
                if self.config.policy == KernelFailurePolicy::Propagate {
                    if let Some(failure) = state.failures.iter().find(|f| f.work == producer) {
                        return Err(failure.to_error());
                    }
                }
                continue;
            }
            if let Some(idx) = state.free_slot() {
                break idx;
            }
            debug!(op = ?item.op, "No free slot, waiting for a retirement");
            self.wait_vacancy(&mut state, deadline)?;
        };

        for buffer in item.inputs.iter().chain(std::iter::once(&item.output)) {
            buffer.address()?;
        }
        item.output
            .attach(if output_is_also_input { Role::InputOutput } else { Role::Output })?;
        for input in &item.inputs {
            let role = if output_is_also_input && *input == item.output {
                Role::InputOutput
            } else {
                Role::Input
            };
            input.attach(role)?;
        }

        let id = state.id(slot);
        let (op, unit) = (item.op, item.unit);
        let entry = &mut state.slots[slot];
        entry.stall_requested = false;
        entry.work = Some(Scheduled { item });
        debug!(work = %id, ?op, %unit, "Admitted");
        self.trace.record(Some(id), Some(op), Some(unit), TraceKind::Admitted);
        Ok(id)
    }

    /// Resolve an admitted item for its worker
    pub(crate) fn dispatch(&self, id: WorkId) -> Result<Dispatch> {
        let state = self.state.lock();
        let item = state
            .slots
            .get(id.slot())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.work.as_ref())
            .map(|s| &s.item)
            .ok_or_else(|| ExecError::invalid_operand(format!("{id} is not in flight")))?;
        let operand = |b: &Buffer| -> Result<Operand> {
            Ok(Operand {
                addr: b.address()?,
                len: b.byte_len(),
            })
        };
        let dispatch = Dispatch {
            id,
            unit: item.unit,
            op: item.op,
            variant: item.variant,
            inputs: item.inputs.iter().map(operand).collect::<Result<_>>()?,
            output: operand(&item.output)?,
            params: item.params.clone(),
        };
        self.trace.record(Some(id), Some(item.op), Some(item.unit), TraceKind::Dispatched);
        Ok(dispatch)
    }

    /// Retire an item: reclaim its buffers, free its slot, wake waiters
    ///
    /// `outcome` carries the kernel failure reason, if any.
    pub fn retire(&self, id: WorkId, outcome: std::result::Result<(), String>) {
        let mut state = self.state.lock();
        let current = state.slots.get_mut(id.slot()).filter(|s| s.generation == id.generation);
        let Some(slot) = current else {
            warn!(work = %id, "Retirement of a stale work id ignored");
            return;
        };
        let Some(Scheduled { item }) = slot.work.take() else {
            warn!(work = %id, "Retirement of an empty slot ignored");
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        slot.stall_requested = false;

        let memory = self.memory.as_ref();
        for input in &item.inputs {
            if input.release_input(memory) == Release::Destroyed {
                let destroyed = TraceKind::Destroyed { buffer: input.id() };
                self.trace.record(Some(id), Some(item.op), None, destroyed);
            }
        }
        if item.output.release_output(memory) == Release::Destroyed {
            let destroyed = TraceKind::Destroyed { buffer: item.output.id() };
            self.trace.record(Some(id), Some(item.op), None, destroyed);
        }

        let ok = outcome.is_ok();
        if let Err(reason) = outcome {
            error!(work = %id, op = ?item.op, %reason, "Kernel failed");
            if self.config.policy == KernelFailurePolicy::Propagate {
                // At most one unreported failure per slot.
                if let Some(pos) = state.failures.iter().position(|f| f.work.slot == id.slot) {
                    let stale = state.failures.swap_remove(pos);
                    warn!(
                        work = %stale.work,
                        "Unreported failure superseded by a later one in its slot"
                    );
                }
                state.failures.push(KernelFailure { work: id, op: item.op, reason });
            }
        }
        debug!(work = %id, op = ?item.op, ok, "Retired");
        self.trace.record(Some(id), Some(item.op), Some(item.unit), TraceKind::Retired { ok });
        drop(item);

        self.retired[id.slot()].notify_all();
        self.vacancy.notify_all();
    }

    /// Free a buffer now, or defer until its last user retires
    pub fn request_free(&self, buffer: &Buffer) -> Result<()> {
        let _state = self.state.lock();
        match buffer.request_free(self.memory.as_ref()) {
            Release::Kept => Err(ExecError::NotBacked { buffer: buffer.id() }),
            Release::Destroyed => {
                self.trace.record(None, None, None, TraceKind::Destroyed { buffer: buffer.id() });
                Ok(())
            }
            Release::Deferred | Release::Idled => Ok(()),
        }
    }

    /// Re-point a buffer that no in-flight item references
    pub fn remap(&self, buffer: &Buffer, base: Address, offset: usize) -> Result<Address> {
        let _state = self.state.lock();
        buffer.remap(self.memory.as_ref(), base, offset)
    }

    /// Wait for one item to retire
    ///
    /// # Errors
    ///
    /// `Timeout` past `timeout`; `KernelFailed` (reported once) under the
    /// `Propagate` policy.
    pub fn wait(&self, id: WorkId, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut state = self.state.lock();
        if id.slot() >= state.slots.len() {
            return Err(ExecError::invalid_operand(format!("{id} names no slot")));
        }
        let slot = &mut state.slots[id.slot()];
        if slot.generation == id.generation && slot.work.is_some() {
            slot.stall_requested = true;
            self.wait_retired(&mut state, id, deadline)?;
        }
        if let Some(pos) = state.failures.iter().position(|f| f.work == id) {
            return Err(state.failures.remove(pos).to_error());
        }
        Ok(())
    }

    /// Global barrier: return once every slot is free
    ///
    /// # Errors
    ///
    /// `Timeout` past `timeout`; under the `Propagate` policy, the first
    /// unreported failure as `KernelFailed`, after which the failure list is
    /// cleared.
    pub fn wait_all(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut state = self.state.lock();
        while let Some(idx) = state.occupied() {
            let id = state.id(idx);
            state.slots[idx].stall_requested = true;
            self.wait_retired(&mut state, id, deadline)?;
        }
        let mut failures = std::mem::take(&mut state.failures);
        if failures.is_empty() {
            Ok(())
        } else {
            if failures.len() > 1 {
                warn!(count = failures.len(), "Multiple kernel failures since last barrier");
            }
            Err(failures.swap_remove(0).to_error())
        }
    }

    /// Snapshot of every slot's state
    pub fn occupancy(&self) -> Vec<SlotState> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|s| match (&s.work, s.stall_requested) {
                (None, _) => SlotState::Free,
                (Some(_), false) => SlotState::Active,
                (Some(_), true) => SlotState::StallRequested,
            })
            .collect()
    }

    /// Number of in-flight items
    pub fn in_flight(&self) -> usize {
        self.state.lock().slots.iter().filter(|s| s.work.is_some()).count()
    }

    /// `deadline` pairs the instant to give up at with the bound it came from
    fn wait_retired(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        id: WorkId,
        deadline: Deadline,
    ) -> Result<()> {
        let signal = &self.retired[id.slot()];
        while state.slots[id.slot()].generation == id.generation {
            match deadline {
                None => signal.wait(state),
                Some((at, bound)) => {
                    let timed_out = signal.wait_until(state, at).timed_out();
                    if timed_out && state.slots[id.slot()].generation == id.generation {
                        return Err(ExecError::timeout(bound));
                    }
                }
            }
        }
        Ok(())
    }

    fn wait_vacancy(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        deadline: Deadline,
    ) -> Result<()> {
        match deadline {
            None => self.vacancy.wait(state),
            Some((at, bound)) => {
                if self.vacancy.wait_until(state, at).timed_out() && state.free_slot().is_none() {
                    return Err(ExecError::timeout(bound));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSpec, BufferState};
    use crate::memory::SystemMemory;
    use std::thread;

    fn table(capacity: usize, policy: KernelFailurePolicy) -> (SchedulingTable, Arc<SystemMemory>) {
        let memory = Arc::new(SystemMemory::default());
        let config = TableConfig {
            capacity,
            max_inputs: 5,
            admission_timeout: Some(Duration::from_secs(5)),
            policy,
        };
        (SchedulingTable::new(config, memory.clone(), Arc::new(TraceLog::new(true))), memory)
    }

    fn backed(memory: &SystemMemory, spec: BufferSpec) -> Buffer {
        let buf = Buffer::new(spec);
        buf.allocate(memory, None, 0).unwrap();
        buf
    }

    fn item(inputs: &[&Buffer], output: &Buffer) -> WorkItem {
        let item = WorkItem::new(ExecutionUnit::Control, OperatorId::Custom(0), output);
        inputs.iter().fold(item, |w, b| w.input(b))
    }

    #[test]
    fn first_admission_takes_slot_zero() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let (a, b) = (backed(&mem, BufferSpec::new(4)), backed(&mem, BufferSpec::new(4)));
        let id = table.admit(item(&[&a], &b), false).unwrap();
        assert_eq!(id.slot(), 0);
        assert_eq!(b.usage_count(), 1);
        assert_eq!(b.role(), Role::Output);
        assert_eq!(a.role(), Role::Input);
        assert_eq!(table.occupancy()[0], SlotState::Active);
    }

    #[test]
    fn generation_changes_on_reuse() {
        let (table, mem) = table(1, KernelFailurePolicy::RetireAsSuccess);
        let b = backed(&mem, BufferSpec::new(4));
        let first = table.admit(item(&[], &b), false).unwrap();
        table.retire(first, Ok(()));
        let second = table.admit(item(&[], &b), false).unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        // stale handle is ignored
        table.retire(first, Ok(()));
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn read_after_write_stalls_until_retire() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let table = Arc::new(table);
        let (a, b, c) = (
            backed(&mem, BufferSpec::new(4)),
            backed(&mem, BufferSpec::new(4)),
            backed(&mem, BufferSpec::new(4)),
        );
        let producer = table.admit(item(&[&a], &b), false).unwrap();

        let consumer = {
            let (table, b, c) = (table.clone(), b.clone(), c.clone());
            thread::spawn(move || table.admit(item(&[&b], &c), false))
        };
        while table.occupancy()[producer.slot()] != SlotState::StallRequested {
            thread::yield_now();
        }
        assert_eq!(table.in_flight(), 1);
        table.retire(producer, Ok(()));
        let id = consumer.join().unwrap().unwrap();
        assert_eq!(b.usage_count(), 1);
        assert_eq!(b.role(), Role::Input);
        assert_eq!(id.slot(), 0);
    }

    #[test]
    fn write_after_read_stalls() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let (a, b, c) = (
            backed(&mem, BufferSpec::new(4)),
            backed(&mem, BufferSpec::new(4)),
            backed(&mem, BufferSpec::new(4)),
        );
        let reader = table.admit(item(&[&a], &b), false).unwrap();
        let table = Arc::new(table);
        let writer = {
            let (table, a, c) = (table.clone(), a.clone(), c.clone());
            thread::spawn(move || table.admit(item(&[&c], &a), false))
        };
        while table.occupancy()[reader.slot()] != SlotState::StallRequested {
            thread::yield_now();
        }
        table.retire(reader, Ok(()));
        writer.join().unwrap().unwrap();
        assert_eq!(a.role(), Role::Output);
    }

    #[test]
    fn full_table_waits_for_vacancy() {
        let (table, mem) = table(1, KernelFailurePolicy::RetireAsSuccess);
        let table = Arc::new(table);
        let first = table.admit(item(&[], &backed(&mem, BufferSpec::new(4))), false).unwrap();
        let other = backed(&mem, BufferSpec::new(4));
        let second = {
            let table = table.clone();
            thread::spawn(move || table.admit(item(&[], &other), false))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!second.is_finished());
        table.retire(first, Ok(()));
        assert_eq!(second.join().unwrap().unwrap().slot(), 0);
    }

    #[test]
    fn admission_timeout() {
        let memory = Arc::new(SystemMemory::default());
        let config = TableConfig {
            capacity: 2,
            max_inputs: 5,
            admission_timeout: Some(Duration::from_millis(20)),
            policy: KernelFailurePolicy::RetireAsSuccess,
        };
        let table = SchedulingTable::new(config, memory.clone(), Arc::new(TraceLog::new(false)));
        let (a, b) = (backed(&memory, BufferSpec::new(4)), backed(&memory, BufferSpec::new(4)));
        table.admit(item(&[&a], &b), false).unwrap();
        let c = backed(&memory, BufferSpec::new(4));
        assert!(matches!(table.admit(item(&[&b], &c), false), Err(ExecError::Timeout { .. })));
        assert_eq!(c.usage_count(), 0);
    }

    #[test]
    fn per_operation_scratch_destroyed_on_retire() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let scratch = backed(&mem, BufferSpec::new(16).per_operation());
        let out = backed(&mem, BufferSpec::new(4));
        let id = table.admit(item(&[&scratch], &out), false).unwrap();
        table.retire(id, Ok(()));
        assert_eq!(scratch.state(), BufferState::Unbacked);
        assert_eq!(out.state(), BufferState::Idle);
    }

    #[test]
    fn in_place_roles() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let data = backed(&mem, BufferSpec::new(4));
        let id = table.admit(item(&[&data], &data), true).unwrap();
        assert_eq!(data.role(), Role::InputOutput);
        assert_eq!(data.usage_count(), 2);
        table.retire(id, Ok(()));
        assert_eq!(data.usage_count(), 0);
        assert_eq!(data.state(), BufferState::Idle);
    }

    #[test]
    fn rejects_read_only_output_and_too_many_inputs() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let ro = backed(&mem, BufferSpec::new(4).read_only());
        let rw = backed(&mem, BufferSpec::new(4));
        let refused = |r: Result<WorkId>| matches!(r, Err(ExecError::InvalidOperand { .. }));
        assert!(refused(table.admit(item(&[], &ro), false)));
        let many = [&ro; 6];
        assert!(refused(table.admit(item(&many, &rw), false)));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn unbacked_buffer_rejected_without_side_effects() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let input = backed(&mem, BufferSpec::new(4));
        let out = Buffer::new(BufferSpec::new(4));
        let admitted = table.admit(item(&[&input], &out), false);
        assert!(matches!(admitted, Err(ExecError::NotBacked { .. })));
        assert_eq!(input.usage_count(), 0);
    }

    #[test]
    fn propagate_policy_reports_failures_once() {
        let (table, mem) = table(4, KernelFailurePolicy::Propagate);
        let out = backed(&mem, BufferSpec::new(4));
        let id = table.admit(item(&[], &out), false).unwrap();
        table.retire(id, Err("boom".into()));
        assert_eq!(out.usage_count(), 0);
        assert!(matches!(table.wait(id, None), Err(ExecError::KernelFailed { .. })));
        assert!(table.wait_all(None).is_ok());
    }

    #[test]
    fn oversized_capacity_is_clamped_to_addressable_slots() {
        let (table, mem) = table(MAX_SLOTS + 45, KernelFailurePolicy::RetireAsSuccess);
        assert_eq!(table.occupancy().len(), MAX_SLOTS);
        let outs: Vec<Buffer> = (0..MAX_SLOTS).map(|_| backed(&mem, BufferSpec::new(1))).collect();
        let ids: Vec<WorkId> =
            outs.iter().map(|o| table.admit(item(&[], o), false).unwrap()).collect();
        let last = ids[MAX_SLOTS - 1];
        assert_eq!(last.slot(), MAX_SLOTS - 1);
        assert_eq!(table.dispatch(last).unwrap().id, last);
    }

    #[test]
    fn dispatch_carries_the_current_generation() {
        let (table, mem) = table(1, KernelFailurePolicy::RetireAsSuccess);
        let out = backed(&mem, BufferSpec::new(4));
        let first = table.admit(item(&[], &out), false).unwrap();
        table.retire(first, Ok(()));
        let second = table.admit(item(&[], &out), false).unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_eq!(table.dispatch(second).unwrap().id, second);
        assert!(table.dispatch(first).is_err());
    }

    #[test]
    fn unreported_failures_stay_bounded_per_slot() {
        let (table, mem) = table(2, KernelFailurePolicy::Propagate);
        let out = backed(&mem, BufferSpec::new(4));
        let mut last = None;
        for _ in 0..50 {
            let id = table.admit(item(&[], &out), false).unwrap();
            table.retire(id, Err("boom".into()));
            last = Some(id);
        }
        assert_eq!(table.state.lock().failures.len(), 1);
        assert!(matches!(table.wait(last.unwrap(), None), Err(ExecError::KernelFailed { .. })));
        assert!(table.wait_all(None).is_ok());
    }

    #[test]
    fn retire_as_success_swallows_failures() {
        let (table, mem) = table(4, KernelFailurePolicy::RetireAsSuccess);
        let id = table.admit(item(&[], &backed(&mem, BufferSpec::new(4))), false).unwrap();
        table.retire(id, Err("boom".into()));
        assert!(table.wait_all(None).is_ok());
    }
}
