// SPDX-License-Identifier: AGPL-3.0-only

//! Operator registration table
//!
//! Workers dispatch through an [`OperatorTable`] keyed by
//! `(OperatorId, Variant)`. Each entry declares its arity and how it can run:
//! a local kernel for the control core, a co-processor op tag for the remote
//! bridge, or both. An id that is not registered is an ordinary error value
//! ([`ExecError::UnknownOperator`]), never a silent fall-through.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use bytes::Bytes;
use hetex_chip::rpc::RemoteOp;
use hetex_chip::units::ExecutionUnit;

use crate::error::{ExecError, Result};
use crate::kernels::{
    self, AddOpt, ConcatHeightOpt, Conv2dOpt, ConvReluPoolOpt, FcOpt, KernelFault, Layout,
    Pool2dOpt, PoolKind, SigmoidOpt,
};
use crate::memory::{Address, MemorySystem};

/// Operator identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorId {
    /// 2-D convolution, standard or depthwise
    Conv2d,
    /// 1×1 convolution
    PointwiseConv2d,
    /// Average pooling
    AvgPool2d,
    /// Max pooling
    MaxPool2d,
    /// In-place ReLU
    Relu,
    /// Fully-connected layer
    FullyConnected,
    /// Saturating add
    Add,
    /// In-place table sigmoid
    Sigmoid,
    /// Two tensors stacked along the height axis
    ConcatHeight,
    /// Channel-planar convolution, ReLU and 2×2 average pooling
    ConvReluAvgPool,
    /// Application-registered operator
    Custom(u16),
}

/// Kernel variant within an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Variant {
    /// The only variant for most operators
    #[default]
    Standard,
    /// Depthwise convolution
    Depthwise,
    /// Co-processor-only fast path of an operator
    Fast,
}

/// Owned operator parameters, released when the work item retires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpParams {
    /// Convolution
    Conv(Conv2dOpt),
    /// Pooling
    Pool(Pool2dOpt),
    /// Fully connected
    Dense(FcOpt),
    /// Add
    Add(AddOpt),
    /// Sigmoid
    Sigmoid(SigmoidOpt),
    /// Height concatenation
    Concat(ConcatHeightOpt),
    /// Fused convolution and pooling
    ConvReluPool(ConvReluPoolOpt),
    /// Operators without parameters
    None,
    /// Custom operator payload
    Opaque(Bytes),
}

/// A resolved operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    /// Resolved address
    pub addr: Address,
    /// Length in bytes
    pub len: usize,
}

/// Everything a kernel sees of one work item
pub struct KernelContext<'a> {
    /// Operator being run
    pub op: OperatorId,
    /// Variant being run
    pub variant: Variant,
    /// Resolved inputs, in submission order
    pub inputs: &'a [Operand],
    /// Resolved output
    pub output: Operand,
    /// Parameters
    pub params: &'a OpParams,
    /// Memory the operands live in
    pub memory: &'a dyn MemorySystem,
}

impl KernelContext<'_> {
    /// Read input `i` as q7
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperand` for a missing input or a memory fault.
    pub fn input(&self, i: usize) -> Result<Vec<i8>> {
        let operand = self
            .inputs
            .get(i)
            .ok_or_else(|| ExecError::invalid_operand(format!("{:?} has no input {i}", self.op)))?;
        let bytes = self.memory.read(operand.addr, operand.len)?;
        Ok(bytemuck::cast_slice::<u8, i8>(&bytes).to_vec())
    }

    /// Write the output as q7
    ///
    /// # Errors
    ///
    /// Returns a memory fault if the output range is not writable.
    pub fn write_output(&self, data: &[i8]) -> Result<()> {
        self.memory.write(self.output.addr, bytemuck::cast_slice::<i8, u8>(data))
    }

    /// Map a kernel fault onto this operator
    pub fn fault(&self, fault: KernelFault) -> ExecError {
        ExecError::kernel_failed(self.op, fault.to_string())
    }

    fn wrong_params(&self) -> ExecError {
        ExecError::kernel_failed(self.op, format!("unexpected parameters {:?}", self.params))
    }
}

/// Control-core kernel
pub type LocalKernel = Arc<dyn Fn(&KernelContext<'_>) -> Result<()> + Send + Sync>;

/// One registered operator
#[derive(Clone)]
pub struct OperatorEntry {
    /// Accepted input counts
    pub arity: RangeInclusive<usize>,
    /// Kernel for the control core
    pub local: Option<LocalKernel>,
    /// Op tag for the co-processor
    pub remote: Option<RemoteOp>,
}

impl fmt::Debug for OperatorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorEntry")
            .field("arity", &self.arity)
            .field("local", &self.local.is_some())
            .field("remote", &self.remote)
            .finish()
    }
}

impl OperatorEntry {
    /// Entry with a control-core kernel
    pub fn local<F>(arity: RangeInclusive<usize>, kernel: F) -> Self
    where
        F: Fn(&KernelContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            arity,
            local: Some(Arc::new(kernel)),
            remote: None,
        }
    }

    /// Entry that only runs on the co-processor
    pub fn remote(arity: RangeInclusive<usize>, op: RemoteOp) -> Self {
        Self {
            arity,
            local: None,
            remote: Some(op),
        }
    }

    /// Also runnable on the co-processor as `op`
    pub fn with_remote(mut self, op: RemoteOp) -> Self {
        self.remote = Some(op);
        self
    }

    /// Whether `unit` can run this operator
    pub fn supports(&self, unit: ExecutionUnit) -> bool {
        match unit {
            ExecutionUnit::Control => self.local.is_some(),
            ExecutionUnit::Coprocessor => self.remote.is_some(),
        }
    }
}

/// Registration table
#[derive(Debug, Clone, Default)]
pub struct OperatorTable {
    entries: HashMap<(OperatorId, Variant), OperatorEntry>,
}

impl OperatorTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the reference kernels for every built-in operator
    pub fn with_reference_kernels() -> Self {
        use OperatorId as Op;
        use Variant::{Depthwise, Fast, Standard};

        let mut table = Self::new();
        let conv_std =
            OperatorEntry::local(3..=4, |cx| conv(cx, false)).with_remote(RemoteOp::Conv2d);
        let conv_dw =
            OperatorEntry::local(3..=4, |cx| conv(cx, true)).with_remote(RemoteOp::DepthwiseConv2d);
        let pw = OperatorEntry::local(3..=4, pointwise).with_remote(RemoteOp::Conv2d);
        let avg = OperatorEntry::local(1..=2, |cx| pool(cx, PoolKind::Average))
            .with_remote(RemoteOp::AvgPool2d);
        let max = OperatorEntry::local(1..=2, |cx| pool(cx, PoolKind::Max))
            .with_remote(RemoteOp::MaxPool2d);
        let rectify = OperatorEntry::local(1..=1, relu).with_remote(RemoteOp::Relu);
        let fused =
            OperatorEntry::local(3..=4, conv_relu_pool).with_remote(RemoteOp::ConvReluAvgPool);

        table.register(Op::Conv2d, Standard, conv_std);
        table.register(Op::Conv2d, Depthwise, conv_dw);
        table.register(Op::PointwiseConv2d, Standard, pw);
        table.register(Op::PointwiseConv2d, Fast, OperatorEntry::remote(3..=4, RemoteOp::Conv2d));
        table.register(Op::AvgPool2d, Standard, avg);
        table.register(Op::MaxPool2d, Standard, max);
        table.register(Op::Relu, Standard, rectify);
        table.register(Op::FullyConnected, Standard, OperatorEntry::local(3..=4, dense));
        table.register(Op::Add, Standard, OperatorEntry::local(2..=2, add));
        table.register(Op::Sigmoid, Standard, OperatorEntry::local(1..=1, sigmoid));
        table.register(Op::ConcatHeight, Standard, OperatorEntry::local(2..=2, concat_height));
        table.register(Op::ConvReluAvgPool, Standard, fused);
        table
    }

    /// Register or replace an operator, returning the previous entry
    pub fn register(
        &mut self,
        op: OperatorId,
        variant: Variant,
        entry: OperatorEntry,
    ) -> Option<OperatorEntry> {
        self.entries.insert((op, variant), entry)
    }

    /// Look up an operator
    ///
    /// # Errors
    ///
    /// Returns `UnknownOperator` if it is not registered.
    pub fn lookup(&self, op: OperatorId, variant: Variant) -> Result<&OperatorEntry> {
        self.entries.get(&(op, variant)).ok_or(ExecError::UnknownOperator { op })
    }

    /// Look up an operator runnable on `unit`
    ///
    /// # Errors
    ///
    /// Returns `UnknownOperator` or `UnsupportedUnit`.
    pub fn resolve(
        &self,
        op: OperatorId,
        variant: Variant,
        unit: ExecutionUnit,
    ) -> Result<&OperatorEntry> {
        let entry = self.lookup(op, variant)?;
        if entry.supports(unit) {
            Ok(entry)
        } else {
            Err(ExecError::UnsupportedUnit { op, unit })
        }
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Reference kernels ────────────────────────────────────────────────────────

fn conv(cx: &KernelContext<'_>, depthwise: bool) -> Result<()> {
    let OpParams::Conv(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let win = opt.window();
    let kind = opt.kind(depthwise);
    let (input, weights, bias) = (cx.input(0)?, cx.input(1)?, cx.input(2)?);
    let mut out = vec![0i8; win.output_len(kind.out_depth(win.in_depth))];
    let requant = opt.requant();
    kernels::window::conv2d(&win, kind, Layout::Hwc, &input, &weights, &bias, &requant, &mut out)
        .map_err(|f| cx.fault(f))?;
    cx.write_output(&out)
}

fn pointwise(cx: &KernelContext<'_>) -> Result<()> {
    if let OpParams::Conv(opt) = cx.params {
        if opt.filt_rows != 1 || opt.filt_cols != 1 {
            return Err(cx.fault(KernelFault::BadParams(format!(
                "pointwise kernel is {}x{}",
                opt.filt_rows, opt.filt_cols
            ))));
        }
    }
    conv(cx, false)
}

fn pool(cx: &KernelContext<'_>, kind: PoolKind) -> Result<()> {
    let OpParams::Pool(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let win = opt.window();
    let input = cx.input(0)?;
    let mut out = vec![0i8; win.output_len(win.in_depth)];
    let (lshift, lo, hi) = (opt.out_lshift, opt.act_min, opt.act_max);
    kernels::window::pool2d(&win, kind, Layout::Hwc, &input, lshift, lo, hi, &mut out)
        .map_err(|f| cx.fault(f))?;
    cx.write_output(&out)
}

fn relu(cx: &KernelContext<'_>) -> Result<()> {
    let mut data = cx.input(0)?;
    kernels::elementwise::relu(&mut data);
    cx.write_output(&data)
}

fn sigmoid(cx: &KernelContext<'_>) -> Result<()> {
    let OpParams::Sigmoid(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let mut data = cx.input(0)?;
    kernels::elementwise::sigmoid(&mut data, opt).map_err(|f| cx.fault(f))?;
    cx.write_output(&data)
}

fn concat_height(cx: &KernelContext<'_>) -> Result<()> {
    let OpParams::Concat(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let (top, bottom) = (cx.input(0)?, cx.input(1)?);
    let mut out = vec![0i8; opt.output_len()];
    kernels::concat::concat_height(&top, &bottom, opt, &mut out).map_err(|f| cx.fault(f))?;
    cx.write_output(&out)
}

fn conv_relu_pool(cx: &KernelContext<'_>) -> Result<()> {
    let OpParams::ConvReluPool(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let (input, weights, bias) = (cx.input(0)?, cx.input(1)?, cx.input(2)?);
    let mut out = vec![0i8; opt.output_len()];
    kernels::fused::conv_relu_avgpool(opt, &input, &weights, &bias, &mut out)
        .map_err(|f| cx.fault(f))?;
    cx.write_output(&out)
}

fn dense(cx: &KernelContext<'_>) -> Result<()> {
    let OpParams::Dense(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let (input, weights, bias) = (cx.input(0)?, cx.input(1)?, cx.input(2)?);
    let mut out = vec![0i8; usize::from(opt.filt_rows)];
    kernels::dense::fully_connected(&input, &weights, &bias, opt, &mut out)
        .map_err(|f| cx.fault(f))?;
    cx.write_output(&out)
}

fn add(cx: &KernelContext<'_>) -> Result<()> {
    let OpParams::Add(opt) = cx.params else {
        return Err(cx.wrong_params());
    };
    let (a, b) = (cx.input(0)?, cx.input(1)?);
    let mut out = vec![0i8; usize::from(opt.num_elem)];
    kernels::elementwise::add(&a, &b, opt, &mut out).map_err(|f| cx.fault(f))?;
    cx.write_output(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_table_covers_builtins() {
        let table = OperatorTable::with_reference_kernels();
        assert_eq!(table.len(), 12);
        let co = ExecutionUnit::Coprocessor;
        assert!(table.resolve(OperatorId::Conv2d, Variant::Depthwise, co).is_ok());
        assert!(table.resolve(OperatorId::Add, Variant::Standard, ExecutionUnit::Control).is_ok());
        assert!(table.resolve(OperatorId::ConvReluAvgPool, Variant::Standard, co).is_ok());
    }

    #[test]
    fn fast_pointwise_is_coprocessor_only() {
        let table = OperatorTable::with_reference_kernels();
        let fast = (OperatorId::PointwiseConv2d, Variant::Fast);
        assert!(table.resolve(fast.0, fast.1, ExecutionUnit::Coprocessor).is_ok());
        assert!(matches!(
            table.resolve(fast.0, fast.1, ExecutionUnit::Control),
            Err(ExecError::UnsupportedUnit { unit: ExecutionUnit::Control, .. })
        ));
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let table = OperatorTable::with_reference_kernels();
        assert!(matches!(
            table.lookup(OperatorId::Custom(9), Variant::Standard),
            Err(ExecError::UnknownOperator { op: OperatorId::Custom(9) })
        ));
        assert!(matches!(
            table.lookup(OperatorId::Relu, Variant::Depthwise),
            Err(ExecError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn control_only_operators() {
        let table = OperatorTable::with_reference_kernels();
        for op in [OperatorId::FullyConnected, OperatorId::Sigmoid, OperatorId::ConcatHeight] {
            assert!(matches!(
                table.resolve(op, Variant::Standard, ExecutionUnit::Coprocessor),
                Err(ExecError::UnsupportedUnit { unit: ExecutionUnit::Coprocessor, .. })
            ));
        }
    }

    #[test]
    fn register_replaces() {
        let mut table = OperatorTable::new();
        assert!(table.is_empty());
        let id = OperatorId::Custom(1);
        let first = table.register(id, Variant::Standard, OperatorEntry::local(0..=1, |_| Ok(())));
        assert!(first.is_none());
        let second = table.register(id, Variant::Standard, OperatorEntry::local(0..=2, |_| Ok(())));
        assert_eq!(second.map(|e| e.arity), Some(0..=1));
    }
}
