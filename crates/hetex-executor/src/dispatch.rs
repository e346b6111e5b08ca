//! Dispatch lanes
//!
//! One bounded FIFO of [`WorkId`]s and one worker thread per execution
//! unit. A worker pops an id, resolves the item under the table lock, runs
//! it through the operator table (locally or over the bridge) and retires
//! it. Items are always retired, failed or not, so buffers are reclaimed
//! and waiters wake.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use hetex_chip::units::ExecutionUnit;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::error::{ExecError, Result};
use crate::memory::MemorySystem;
use crate::ops::{KernelContext, OperatorTable};
use crate::scheduler::{SchedulingTable, WorkId};

/// State shared by every lane worker
#[derive(Debug)]
pub(crate) struct LaneContext {
    pub table: Arc<SchedulingTable>,
    pub operators: Arc<OperatorTable>,
    pub memory: Arc<dyn MemorySystem>,
    pub bridge: Bridge,
}

/// The two dispatch lanes
#[derive(Debug)]
pub(crate) struct Lanes {
    queues: [Option<Sender<WorkId>>; 2],
    workers: Vec<JoinHandle<()>>,
}

impl Lanes {
    /// Spawn one worker per unit; `depths` is indexed by unit
    pub(crate) fn start(cx: Arc<LaneContext>, depths: [usize; 2]) -> Result<Self> {
        let mut queues = [None, None];
        let mut workers = Vec::with_capacity(ExecutionUnit::ALL.len());
        for unit in ExecutionUnit::ALL {
            let (tx, rx) = bounded(depths[unit.index()]);
            let cx = Arc::clone(&cx);
            let worker = thread::Builder::new()
                .name(format!("hetex-{}", unit.name()))
                .spawn(move || run_lane(unit, &rx, &cx))
                .map_err(|e| {
                    ExecError::invalid_config(format!("cannot spawn {unit} worker: {e}"))
                })?;
            queues[unit.index()] = Some(tx);
            workers.push(worker);
        }
        info!(control = depths[0], coprocessor = depths[1], "Dispatch lanes started");
        Ok(Self { queues, workers })
    }

    /// Queue an admitted item; blocks while the lane is full
    pub(crate) fn submit(&self, unit: ExecutionUnit, id: WorkId) -> Result<()> {
        let queue = self.queues[unit.index()].as_ref().ok_or(ExecError::ShutDown)?;
        queue.send(id).map_err(|_| ExecError::ShutDown)?;
        debug!(work = %id, %unit, "Queued");
        Ok(())
    }

    /// Close both lanes, let the workers drain them, and join
    pub(crate) fn shutdown(&mut self) {
        for queue in &mut self.queues {
            drop(queue.take());
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Lane worker panicked");
            }
        }
        info!("Dispatch lanes stopped");
    }
}

impl Drop for Lanes {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn run_lane(unit: ExecutionUnit, queue: &Receiver<WorkId>, cx: &LaneContext) {
    for id in queue {
        let outcome = execute(unit, id, cx);
        cx.table.retire(id, outcome.map_err(|e| e.to_string()));
    }
    debug!(%unit, "Lane drained");
}

fn execute(unit: ExecutionUnit, id: WorkId, cx: &LaneContext) -> Result<()> {
    let d = cx.table.dispatch(id)?;
    debug_assert_eq!((d.id, d.unit), (id, unit));
    let entry = cx.operators.resolve(d.op, d.variant, unit).map_err(|e| {
        error!(
            work = %d.id,
            op = ?d.op,
            variant = ?d.variant,
            %unit,
            error = %e,
            "No kernel registered"
        );
        e
    })?;
    if !entry.arity.contains(&d.inputs.len()) {
        return Err(ExecError::invalid_operand(format!(
            "{} ({:?}) takes {:?} inputs, got {}",
            d.id,
            d.op,
            entry.arity,
            d.inputs.len()
        )));
    }
    match (unit, &entry.local, entry.remote) {
        (ExecutionUnit::Control, Some(kernel), _) => kernel(&KernelContext {
            op: d.op,
            variant: d.variant,
            inputs: &d.inputs,
            output: d.output,
            params: &d.params,
            memory: cx.memory.as_ref(),
        }),
        (ExecutionUnit::Coprocessor, _, Some(remote)) => cx.bridge.invoke(remote, &d),
        _ => Err(ExecError::UnsupportedUnit { op: d.op, unit }),
    }
}
