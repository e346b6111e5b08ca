// SPDX-License-Identifier: AGPL-3.0-only

//! Executor façade
//!
//! Owns the scheduling table, both dispatch lanes and the co-processor
//! bridge. Entry points validate operands synchronously, admit the item
//! (blocking on hazards) and queue it on its unit's lane; they return the
//! item's [`WorkId`] without waiting for it to run.
//!
//! ```text
//! conv2d(..) ──validate──▶ admit ──▶ lane[unit] ──▶ worker ──▶ kernel / bridge
//!                             ▲                                    │
//!                             └────────── retire, wake ◀───────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hetex_chip::units::ExecutionUnit;
use tracing::info;

use crate::bridge::{Bridge, Transport};
use crate::buffer::{Buffer, BufferSpec};
use crate::config::ExecutorConfig;
use crate::dispatch::{LaneContext, Lanes};
use crate::error::{ExecError, Result};
use crate::kernels::{
    AddOpt, ConcatHeightOpt, Conv2dOpt, ConvReluPoolOpt, FcOpt, Pool2dOpt, PoolKind, SigmoidOpt,
    Window, WindowOp,
};
use crate::memory::{Address, MemorySystem};
use crate::ops::{OpParams, OperatorId, OperatorTable, Variant};
use crate::scheduler::{SchedulingTable, SlotState, TableConfig, WorkId, WorkItem};
use crate::trace::TraceLog;

/// Heterogeneous operator executor
pub struct Executor {
    config: ExecutorConfig,
    memory: Arc<dyn MemorySystem>,
    table: Arc<SchedulingTable>,
    operators: Arc<OperatorTable>,
    trace: Arc<TraceLog>,
    lanes: Lanes,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("operators", &self.operators.len())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor with the reference kernels registered
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation or a lane worker
    /// cannot be spawned.
    pub fn new(
        config: ExecutorConfig,
        memory: Arc<dyn MemorySystem>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_operators(config, memory, transport, OperatorTable::with_reference_kernels())
    }

    /// Create an executor dispatching through `operators`
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_operators(
        config: ExecutorConfig,
        memory: Arc<dyn MemorySystem>,
        transport: Arc<dyn Transport>,
        operators: OperatorTable,
    ) -> Result<Self> {
        config.validate()?;
        let trace = Arc::new(TraceLog::new(config.trace));
        let table = Arc::new(SchedulingTable::new(
            TableConfig {
                capacity: config.max_scheduled_work,
                max_inputs: config.max_inputs,
                admission_timeout: config.admission_timeout,
                policy: config.kernel_failure_policy,
            },
            Arc::clone(&memory),
            Arc::clone(&trace),
        ));
        let operators = Arc::new(operators);
        let bridge =
            Bridge::new(transport, Arc::clone(&memory), config.budget, config.remote_timeout);
        let lanes = Lanes::start(
            Arc::new(LaneContext {
                table: Arc::clone(&table),
                operators: Arc::clone(&operators),
                memory: Arc::clone(&memory),
                bridge,
            }),
            [config.control_queue_depth, config.coprocessor_queue_depth],
        )?;
        info!(
            slots = config.max_scheduled_work,
            operators = operators.len(),
            policy = ?config.kernel_failure_policy,
            "Executor initialised"
        );
        Ok(Self {
            config,
            memory,
            table,
            operators,
            trace,
            lanes,
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execution trace; empty unless enabled in the configuration
    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    /// Per-slot state of the scheduling table
    pub fn occupancy(&self) -> Vec<SlotState> {
        self.table.occupancy()
    }

    /// Number of items admitted and not yet retired
    pub fn in_flight(&self) -> usize {
        self.table.in_flight()
    }

    // ── Buffers ──────────────────────────────────────────────────────────────

    /// Create a descriptor and back it from its class's pool
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the pool is exhausted or the origin is persistent.
    pub fn create_buffer(&self, spec: BufferSpec) -> Result<Buffer> {
        let buffer = Buffer::new(spec);
        self.allocate(&buffer, None, 0)?;
        Ok(buffer)
    }

    /// Back `buffer` with memory
    ///
    /// With `base`, maps onto `base + offset * element_size` without taking
    /// ownership; otherwise allocates from the pool.
    ///
    /// # Errors
    ///
    /// `AlreadyBacked`, or `OutOfMemory` as for [`create_buffer`](Self::create_buffer).
    pub fn allocate(
        &self,
        buffer: &Buffer,
        base: Option<Address>,
        offset: usize,
    ) -> Result<Address> {
        buffer.allocate(self.memory.as_ref(), base, offset)
    }

    /// Re-point a backed, unreferenced buffer
    ///
    /// # Errors
    ///
    /// `InvalidRemap` for an unbacked or in-flight buffer or a null base.
    pub fn remap(&self, buffer: &Buffer, base: Address, offset: usize) -> Result<Address> {
        self.table.remap(buffer, base, offset)
    }

    /// Resolved address of a backed buffer
    ///
    /// # Errors
    ///
    /// `NotBacked` if the buffer has no memory.
    pub fn address_of(&self, buffer: &Buffer) -> Result<Address> {
        buffer.address()
    }

    /// Free now, or once the last in-flight item using the buffer retires
    ///
    /// # Errors
    ///
    /// `NotBacked` if the buffer was never backed or is already destroyed.
    pub fn request_free(&self, buffer: &Buffer) -> Result<()> {
        self.table.request_free(buffer)
    }

    /// Overwrite a buffer's contents
    ///
    /// # Errors
    ///
    /// `InvalidOperand` if `data` is not exactly the buffer's size.
    pub fn write_buffer(&self, buffer: &Buffer, data: &[u8]) -> Result<()> {
        if data.len() != buffer.byte_len() {
            return Err(ExecError::invalid_operand(format!(
                "buffer {} holds {} bytes, got {}",
                buffer.id(),
                buffer.byte_len(),
                data.len()
            )));
        }
        self.memory.write(buffer.address()?, data)
    }

    /// Copy a buffer's contents out
    ///
    /// # Errors
    ///
    /// `NotBacked` if the buffer has no memory.
    pub fn read_buffer(&self, buffer: &Buffer) -> Result<Bytes> {
        Ok(Bytes::from(self.memory.read(buffer.address()?, buffer.byte_len())?))
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Admit and queue an arbitrary item
    ///
    /// With `output_is_also_input`, inputs aliasing the output are updated
    /// in place.
    ///
    /// # Errors
    ///
    /// `UnknownOperator`/`UnsupportedUnit` before admission, then anything
    /// [`SchedulingTable::admit`] returns.
    pub fn submit(&self, item: WorkItem, output_is_also_input: bool) -> Result<WorkId> {
        let entry = self.operators.resolve(item.op, item.variant, item.unit)?;
        if !entry.arity.contains(&item.inputs.len()) {
            return Err(ExecError::invalid_operand(format!(
                "{:?} takes {:?} inputs, got {}",
                item.op,
                entry.arity,
                item.inputs.len()
            )));
        }
        let unit = item.unit;
        let id = self.table.admit(item, output_is_also_input)?;
        if let Err(e) = self.lanes.submit(unit, id) {
            self.table.retire(id, Err(e.to_string()));
            return Err(e);
        }
        Ok(id)
    }

    /// 2-D convolution; `scratch` is appended as a last input
    ///
    /// # Errors
    ///
    /// `InvalidOperand` if a buffer's size disagrees with `opt`; otherwise as
    /// [`submit`](Self::submit).
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Conv2dOpt,
    ) -> Result<WorkId> {
        let operands = [input, weights, bias];
        let (op, variant) = (OperatorId::Conv2d, Variant::Standard);
        self.conv(op, variant, unit, operands, scratch, output, opt, false)
    }

    /// Depthwise 2-D convolution; `opt.num_filt` is the depth multiplier
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    #[allow(clippy::too_many_arguments)]
    pub fn depthwise_conv2d(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Conv2dOpt,
    ) -> Result<WorkId> {
        let operands = [input, weights, bias];
        let (op, variant) = (OperatorId::Conv2d, Variant::Depthwise);
        self.conv(op, variant, unit, operands, scratch, output, opt, false)
    }

    /// Depthwise convolution overwriting `data`
    ///
    /// The output shape must equal the input shape.
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    pub fn depthwise_conv2d_inplace(
        &self,
        unit: ExecutionUnit,
        data: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        scratch: Option<&Buffer>,
        opt: Conv2dOpt,
    ) -> Result<WorkId> {
        let operands = [data, weights, bias];
        self.conv(OperatorId::Conv2d, Variant::Depthwise, unit, operands, scratch, data, opt, true)
    }

    /// 1×1 convolution
    ///
    /// # Errors
    ///
    /// `InvalidOperand` for a kernel other than 1×1; otherwise as
    /// [`conv2d`](Self::conv2d).
    #[allow(clippy::too_many_arguments)]
    pub fn pointwise_conv2d(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Conv2dOpt,
    ) -> Result<WorkId> {
        let operands = [input, weights, bias];
        self.pointwise(Variant::Standard, unit, operands, scratch, output, opt)
    }

    /// 1×1 convolution on the co-processor's fast path
    ///
    /// Same semantics as [`pointwise_conv2d`](Self::pointwise_conv2d); only
    /// the co-processor registers this variant.
    ///
    /// # Errors
    ///
    /// `UnsupportedUnit` on the control core; otherwise as
    /// [`pointwise_conv2d`](Self::pointwise_conv2d).
    pub fn pointwise_conv2d_fast(
        &self,
        input: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        output: &Buffer,
        opt: Conv2dOpt,
    ) -> Result<WorkId> {
        let operands = [input, weights, bias];
        self.pointwise(Variant::Fast, ExecutionUnit::Coprocessor, operands, None, output, opt)
    }

    /// Average pooling
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    pub fn avgpool2d(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Pool2dOpt,
    ) -> Result<WorkId> {
        self.pool(OperatorId::AvgPool2d, unit, input, scratch, output, opt)
    }

    /// Max pooling
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    pub fn maxpool2d(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Pool2dOpt,
    ) -> Result<WorkId> {
        self.pool(OperatorId::MaxPool2d, unit, input, scratch, output, opt)
    }

    /// In-place ReLU
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit).
    pub fn relu(&self, unit: ExecutionUnit, data: &Buffer) -> Result<WorkId> {
        self.submit(WorkItem::new(unit, OperatorId::Relu, data).input(data), true)
    }

    /// In-place sigmoid, control core only
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit).
    pub fn sigmoid(&self, unit: ExecutionUnit, data: &Buffer, opt: SigmoidOpt) -> Result<WorkId> {
        let item = WorkItem::new(unit, OperatorId::Sigmoid, data).input(data);
        self.submit(item.params(OpParams::Sigmoid(opt)), true)
    }

    /// Stack `top` over `bottom` along the height axis
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    pub fn concat_height(
        &self,
        unit: ExecutionUnit,
        top: &Buffer,
        bottom: &Buffer,
        output: &Buffer,
        opt: ConcatHeightOpt,
    ) -> Result<WorkId> {
        expect_size(top, "top", opt.top_len())?;
        expect_size(bottom, "bottom", opt.bottom_len())?;
        expect_size(output, "output", opt.output_len())?;
        let item = WorkItem::new(unit, OperatorId::ConcatHeight, output).input(top).input(bottom);
        self.submit(item.params(OpParams::Concat(opt)), false)
    }

    /// Channel-planar convolution, ReLU and 2×2 average pooling in one item
    ///
    /// # Errors
    ///
    /// `InvalidOperand` for unsupported parameters or a mis-sized buffer;
    /// otherwise as [`submit`](Self::submit).
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d_relu_avgpool(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: ConvReluPoolOpt,
    ) -> Result<WorkId> {
        opt.check().map_err(|f| ExecError::invalid_operand(f.to_string()))?;
        expect_size(input, "input", opt.input_len())?;
        expect_size(weights, "weights", opt.weight_len())?;
        expect_size(bias, "bias", opt.bias_len())?;
        expect_size(output, "output", opt.output_len())?;
        let item = with_scratch(
            WorkItem::new(unit, OperatorId::ConvReluAvgPool, output)
                .input(input)
                .input(weights)
                .input(bias),
            scratch,
        );
        self.submit(item.params(OpParams::ConvReluPool(opt)), false)
    }

    /// Fully-connected layer
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    #[allow(clippy::too_many_arguments)]
    pub fn fully_connected(
        &self,
        unit: ExecutionUnit,
        input: &Buffer,
        weights: &Buffer,
        bias: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: FcOpt,
    ) -> Result<WorkId> {
        let (cols, rows) = (usize::from(opt.filt_cols), usize::from(opt.filt_rows));
        expect_size(input, "input", usize::from(opt.input_length))?;
        expect_size(weights, "weights", rows * cols)?;
        expect_size(bias, "bias", rows)?;
        expect_size(output, "output", rows)?;
        let item = with_scratch(
            WorkItem::new(unit, OperatorId::FullyConnected, output)
                .input(input)
                .input(weights)
                .input(bias),
            scratch,
        );
        self.submit(item.params(OpParams::Dense(opt)), false)
    }

    /// Saturating elementwise add
    ///
    /// # Errors
    ///
    /// As [`conv2d`](Self::conv2d).
    pub fn add(
        &self,
        unit: ExecutionUnit,
        a: &Buffer,
        b: &Buffer,
        output: &Buffer,
        opt: AddOpt,
    ) -> Result<WorkId> {
        let n = usize::from(opt.num_elem);
        expect_size(a, "first operand", n)?;
        expect_size(b, "second operand", n)?;
        expect_size(output, "output", n)?;
        let item = WorkItem::new(unit, OperatorId::Add, output).input(a).input(b);
        self.submit(item.params(OpParams::Add(opt)), false)
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Wait for one item to retire
    ///
    /// # Errors
    ///
    /// `KernelFailed` once for a failed item under the `Propagate` policy.
    pub fn wait(&self, id: WorkId) -> Result<()> {
        self.table.wait(id, None)
    }

    /// Wait for one item, at most `timeout`
    ///
    /// # Errors
    ///
    /// `Timeout`, or as [`wait`](Self::wait).
    pub fn wait_timeout(&self, id: WorkId, timeout: Duration) -> Result<()> {
        self.table.wait(id, Some(timeout))
    }

    /// Block until every admitted item has retired
    ///
    /// # Errors
    ///
    /// Under the `Propagate` policy, the first failure since the previous
    /// barrier.
    pub fn wait_all(&self) -> Result<()> {
        self.table.wait_all(None)
    }

    /// Barrier bounded by `timeout`
    ///
    /// # Errors
    ///
    /// `Timeout`, or as [`wait_all`](Self::wait_all).
    pub fn wait_all_timeout(&self, timeout: Duration) -> Result<()> {
        self.table.wait_all(Some(timeout))
    }

    /// Drain outstanding work and stop the lanes
    ///
    /// # Errors
    ///
    /// As [`wait_all`](Self::wait_all); the lanes stop either way.
    pub fn shutdown(mut self) -> Result<()> {
        let drained = self.table.wait_all(None);
        self.lanes.shutdown();
        drained
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn conv(
        &self,
        op: OperatorId,
        variant: Variant,
        unit: ExecutionUnit,
        [input, weights, bias]: [&Buffer; 3],
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Conv2dOpt,
        in_place: bool,
    ) -> Result<WorkId> {
        let win = opt.window();
        let wop = WindowOp::Conv {
            kind: opt.kind(variant == Variant::Depthwise),
            requant: opt.requant(),
        };
        check_window(&win, &wop, input, output)?;
        expect_size(weights, "weights", wop.weight_len(&win))?;
        expect_size(bias, "bias", wop.bias_len(&win))?;
        let item = with_scratch(
            WorkItem::new(unit, op, output)
                .variant(variant)
                .input(input)
                .input(weights)
                .input(bias),
            scratch,
        );
        self.submit(item.params(OpParams::Conv(opt)), in_place)
    }

    fn pointwise(
        &self,
        variant: Variant,
        unit: ExecutionUnit,
        operands: [&Buffer; 3],
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Conv2dOpt,
    ) -> Result<WorkId> {
        if opt.filt_rows != 1 || opt.filt_cols != 1 {
            return Err(ExecError::invalid_operand(format!(
                "pointwise kernel must be 1x1, got {}x{}",
                opt.filt_rows, opt.filt_cols
            )));
        }
        let op = OperatorId::PointwiseConv2d;
        self.conv(op, variant, unit, operands, scratch, output, opt, false)
    }

    fn pool(
        &self,
        op: OperatorId,
        unit: ExecutionUnit,
        input: &Buffer,
        scratch: Option<&Buffer>,
        output: &Buffer,
        opt: Pool2dOpt,
    ) -> Result<WorkId> {
        let win = opt.window();
        let wop = WindowOp::Pool {
            kind: if op == OperatorId::MaxPool2d {
                PoolKind::Max
            } else {
                PoolKind::Average
            },
            out_lshift: opt.out_lshift,
            act_min: opt.act_min,
            act_max: opt.act_max,
        };
        check_window(&win, &wop, input, output)?;
        let item = with_scratch(WorkItem::new(unit, op, output).input(input), scratch);
        self.submit(item.params(OpParams::Pool(opt)), false)
    }
}

fn with_scratch(item: WorkItem, scratch: Option<&Buffer>) -> WorkItem {
    match scratch {
        Some(s) => item.input(s),
        None => item,
    }
}

fn check_window(win: &Window, wop: &WindowOp, input: &Buffer, output: &Buffer) -> Result<()> {
    win.check().map_err(|f| ExecError::invalid_operand(f.to_string()))?;
    expect_size(input, "input", win.input_len())?;
    expect_size(output, "output", win.output_len(wop.out_depth(win)))
}

fn expect_size(buffer: &Buffer, name: &str, expected: usize) -> Result<()> {
    if buffer.byte_len() == expected {
        Ok(())
    } else {
        Err(ExecError::invalid_operand(format!(
            "{name} buffer {} is {} bytes, expected {expected}",
            buffer.id(),
            buffer.byte_len()
        )))
    }
}
