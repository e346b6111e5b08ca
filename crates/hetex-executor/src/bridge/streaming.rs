//! Oversized-operand streaming
//!
//! When a windowed operator's working set does not fit the co-processor
//! budgets, the output is cut into row bands and output-channel groups. Each
//! chunk is one round-trip over a channel-planar input patch holding exactly
//! the input rows the band needs. Standard convolution groups read every
//! input channel; depthwise and pooling groups carry only their own:
//!
//! ```text
//!   caller input (HWC)            shared memory                  caller output (HWC)
//!  ┌────────────────┐   rows    ┌─────────┬─────────┐          ┌────────────────┐
//!  │ band 0 rows    │──to CHW──▶│ patch A │ patch B │          │ band 0         │
//!  │ band 1 rows    │           └────┬────┴────┬────┘          │ band 1         │
//!  │ ...            │                │  one in flight          │ ...            │
//!  └────────────────┘                ▼                         └────────────────┘
//!                                co-processor ──▶ out chunk (CHW) ──scatter──▲
//! ```
//!
//! The next patch is filled while the current chunk is in flight; only one
//! request is ever outstanding.

use std::ops::Range;

use hetex_chip::limits::MAX_TRANSFER_LEN;
use hetex_chip::memmap::MemoryClass;
use hetex_chip::rpc::{RemoteMessage, RemoteOp, ShmemBuf};
use tracing::{debug, info};

use super::message::{describe, encode_window};
use super::Bridge;
use crate::config::CoprocessorBudget;
use crate::error::{ExecError, Result};
use crate::kernels::{ConvKind, Layout, Window, WindowOp};
use crate::layout;
use crate::memory::{Address, MemorySystem};
use crate::ops::{OperatorId, Operand};

/// How an operator is partitioned for the co-processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPlan {
    /// Output rows per band
    pub band_rows: usize,
    /// Output channels per group
    pub group_filters: usize,
    /// Output row ranges
    pub bands: Vec<Range<usize>>,
    /// Output channel ranges
    pub groups: Vec<Range<usize>>,
}

impl StreamPlan {
    /// Round-trips needed
    pub fn chunks(&self) -> usize {
        self.bands.len() * self.groups.len()
    }
}

/// Whether the whole operator fits the budgets in one round-trip
pub fn fits_single_shot(win: &Window, op: &WindowOp, budget: &CoprocessorBudget) -> bool {
    let out_len = win.output_len(op.out_depth(win));
    let (w, b) = (op.weight_len(win), op.bias_len(win));
    win.input_len() + out_len <= budget.inout_bytes
        && w + b <= budget.weight_bias_bytes
        && [win.input_len(), out_len, w, b].iter().all(|&n| n <= MAX_TRANSFER_LEN)
}

/// Input rows needed by an output band, and the band's own window
///
/// The band window's `pad_top` counts the implicit zero rows above the first
/// input row the patch holds.
pub fn band_window(win: &Window, rows: &Range<usize>) -> (Window, Range<usize>) {
    let first = (rows.start * win.row_stride) as isize - win.pad_top as isize;
    let last = ((rows.end - 1) * win.row_stride + win.filt_rows) as isize - win.pad_top as isize;
    let in_rows = win.in_rows as isize;
    let start = first.clamp(0, in_rows);
    let end = last.clamp(start, in_rows);
    let band = Window {
        in_rows: (end - start) as usize,
        pad_top: (start - first) as usize,
        out_rows: rows.len(),
        ..*win
    };
    (band, start as usize..end as usize)
}

fn patch_rows(win: &Window, band_rows: usize) -> usize {
    ((band_rows - 1) * win.row_stride + win.filt_rows).min(win.in_rows)
}

/// Partition `op` over `win` to fit `budget`
///
/// # Errors
///
/// Returns `RemoteDispatchFailed` if even one output row of one output
/// channel cannot fit.
pub fn plan(win: &Window, op: &WindowOp, budget: &CoprocessorBudget) -> Result<StreamPlan> {
    let out_depth = op.out_depth(win);
    if win.out_rows == 0 || out_depth == 0 {
        return Err(ExecError::remote_dispatch_failed("operator produces no output"));
    }
    let per_channel = (op.weight_len(win) + op.bias_len(win)) / out_depth;
    let granule = op.filter_granule();
    let weight_room = budget.weight_bias_bytes.min(MAX_TRANSFER_LEN);
    let mut group_filters = if per_channel == 0 {
        out_depth
    } else {
        (weight_room / per_channel / granule * granule).min(out_depth)
    };
    if group_filters == 0 {
        return Err(ExecError::remote_dispatch_failed(format!(
            "weights of {granule} output channel(s) exceed the {} byte co-processor budget",
            budget.weight_bias_bytes
        )));
    }

    // Narrow the groups until one output row fits the in/out budget.
    let band_rows = loop {
        let row_in = win.in_cols * op.group_inputs(win, &(0..group_filters)).len();
        let row_out = win.out_cols * group_filters;
        let fits = |n: usize| {
            let (patch, out) = (patch_rows(win, n) * row_in, n * row_out);
            patch + out <= budget.inout_bytes
                && patch <= MAX_TRANSFER_LEN
                && out <= MAX_TRANSFER_LEN
        };
        if let Some(rows) = (1..=win.out_rows).take_while(|&n| fits(n)).last() {
            break rows;
        }
        if group_filters <= granule {
            return Err(ExecError::remote_dispatch_failed(format!(
                "one output row needs {} bytes, co-processor in/out budget is {}",
                patch_rows(win, 1) * row_in + row_out,
                budget.inout_bytes
            )));
        }
        group_filters = (group_filters / 2 / granule).max(1) * granule;
    };

    let split = |total: usize, step: usize| -> Vec<Range<usize>> {
        (0..total).step_by(step).map(|s| s..(s + step).min(total)).collect()
    };
    Ok(StreamPlan {
        band_rows,
        group_filters,
        bands: split(win.out_rows, band_rows),
        groups: split(out_depth, group_filters),
    })
}

/// Shared-memory blocks owned by one remote invocation, freed on drop
pub(super) struct SharedScratch<'a> {
    memory: &'a dyn MemorySystem,
    blocks: Vec<Address>,
}

impl<'a> SharedScratch<'a> {
    pub(super) fn new(memory: &'a dyn MemorySystem) -> Self {
        Self { memory, blocks: Vec::new() }
    }

    pub(super) fn alloc(&mut self, len: usize) -> Result<Address> {
        let addr = self.memory.alloc(len, MemoryClass::Shared).ok_or_else(|| {
            ExecError::remote_dispatch_failed(format!("shared pool exhausted ({len} bytes)"))
        })?;
        self.blocks.push(addr);
        Ok(addr)
    }

    /// Give up ownership of every block without freeing it
    pub(super) fn abandon(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.blocks)
    }

    pub(super) fn stage(&mut self, data: &[i8]) -> Result<Operand> {
        let addr = self.alloc(data.len())?;
        self.memory.write(addr, bytemuck::cast_slice(data))?;
        Ok(Operand { addr, len: data.len() })
    }
}

impl Drop for SharedScratch<'_> {
    fn drop(&mut self) {
        for addr in self.blocks.drain(..) {
            self.memory.free(addr, MemoryClass::Shared);
        }
    }
}

/// Operands of a windowed remote call
pub(super) struct WindowCall {
    pub op: OperatorId,
    pub remote: RemoteOp,
    pub win: Window,
    pub wop: WindowOp,
    pub input: Operand,
    pub weights: Option<Operand>,
    pub bias: Option<Operand>,
    pub output: Operand,
}

impl Bridge {
    pub(super) fn run_streamed(&self, call: &WindowCall) -> Result<()> {
        let memory = self.memory.as_ref();
        let plan = plan(&call.win, &call.wop, &self.budget)?;
        info!(
            op = ?call.op,
            bands = plan.bands.len(),
            groups = plan.groups.len(),
            band_rows = plan.band_rows,
            "Streaming oversized operator"
        );

        let win = &call.win;
        let out_depth = call.wop.out_depth(win);
        let mut scratch = SharedScratch::new(memory);
        let msg_addr = scratch.alloc(RemoteMessage::BYTES)?;
        let inputs: Vec<Range<usize>> =
            plan.groups.iter().map(|g| call.wop.group_inputs(win, g)).collect();
        let widest = inputs.iter().map(Range::len).max().unwrap_or(0);
        let max_patch = patch_rows(win, plan.band_rows) * win.in_cols * widest;
        let patches = [scratch.alloc(max_patch)?, scratch.alloc(max_patch)?];
        let out_chunk = scratch.alloc(plan.band_rows * win.out_cols * plan.group_filters)?;

        // Per-group weights and bias in co-processor layout.
        let mut group_params = Vec::with_capacity(plan.groups.len());
        if let (Some(w), Some(b)) = (call.weights, call.bias) {
            let weights = read_q7(memory, w)?;
            let bias = read_q7(memory, b)?;
            let (weights, per_filter) = match call.wop {
                WindowOp::Conv { kind: ConvKind::Standard { .. }, .. } => (
                    layout::reorder_conv_weights(
                        &weights,
                        out_depth,
                        win.filt_rows,
                        win.filt_cols,
                        win.in_depth,
                    ),
                    win.filt_rows * win.filt_cols * win.in_depth,
                ),
                _ => (
                    layout::reorder_depthwise_weights(
                        &weights,
                        win.filt_rows,
                        win.filt_cols,
                        out_depth,
                    ),
                    win.filt_rows * win.filt_cols,
                ),
            };
            for g in &plan.groups {
                let w = scratch.stage(&weights[g.start * per_filter..g.end * per_filter])?;
                let b = scratch.stage(&bias[g.clone()])?;
                group_params.push((describe(w)?, describe(b)?));
            }
        } else {
            group_params.resize(plan.groups.len(), (ShmemBuf::default(), ShmemBuf::default()));
        }

        // In-place calls overwrite rows later bands still read.
        let snapshot = overlaps(call.input, call.output)
            .then(|| read_q7(memory, call.input))
            .transpose()?;
        let row_in = win.in_cols * win.in_depth;
        // CHW planes of one band's rows, restricted to one group's inputs.
        let fill = |(band, group): (usize, usize), slot: usize| -> Result<Operand> {
            let (_, rows) = band_window(win, &plan.bands[band]);
            let plane = rows.len() * win.in_cols;
            let channels = &inputs[group];
            let patch = Operand { addr: patches[slot], len: plane * channels.len() };
            if plane > 0 && !channels.is_empty() {
                let hwc = match &snapshot {
                    Some(all) => all[rows.start * row_in..rows.end * row_in].to_vec(),
                    None => read_q7(memory, Operand {
                        addr: call.input.addr.offset(rows.start * row_in)?,
                        len: rows.len() * row_in,
                    })?,
                };
                let chw = layout::hwc_to_chw(&hwc, rows.len(), win.in_cols, win.in_depth);
                let planes = &chw[channels.start * plane..channels.end * plane];
                memory.write(patch.addr, bytemuck::cast_slice(planes))?;
            }
            Ok(patch)
        };

        let chunks: Vec<(usize, usize)> = (0..plan.bands.len())
            .flat_map(|b| (0..plan.groups.len()).map(move |g| (b, g)))
            .collect();
        let patch_key = |&(b, g): &(usize, usize)| (b, inputs[g].clone());
        let mut slot = 0;
        let first = *chunks
            .first()
            .ok_or_else(|| ExecError::remote_dispatch_failed("stream plan has no chunks"))?;
        let mut patch = fill(first, slot)?;
        let mut next_patch = None;
        let mut band_out = Vec::new();

        for (n, chunk) in chunks.iter().enumerate() {
            let (b, g) = *chunk;
            if let Some(p) = next_patch.take() {
                patch = p;
            }
            let (bw, _) = band_window(win, &plan.bands[b]);
            let gw = Window { in_depth: inputs[g].len(), ..bw };
            let filters = plan.groups[g].clone();
            let wop = call.wop.with_filters(filters.len());
            if g == 0 {
                band_out = vec![0i8; bw.output_len(out_depth)];
            }
            let chunk_out = Operand { addr: out_chunk, len: gw.output_len(filters.len()) };
            let mut msg = RemoteMessage {
                input: describe(patch)?,
                output: describe(chunk_out)?,
                weight: group_params[g].0,
                bias: group_params[g].1,
                params: encode_window(&gw, &wop, Layout::Chw),
                ..RemoteMessage::default()
            };
            let sequence = self.post(call.remote, msg_addr, &mut msg)?;
            debug!(op = ?call.op, chunk = n, band = b, group = g, sequence, "Chunk posted");

            // Overlap: stage the next patch into the idle slot while this chunk runs.
            let upcoming = chunks.get(n + 1).filter(|next| patch_key(*next) != patch_key(chunk));
            if let Some(next) = upcoming {
                slot ^= 1;
                next_patch = Some(fill(*next, slot)?);
            }
            self.await_response(call.op, call.remote, (msg_addr, sequence), &mut scratch)?;

            let chw = read_q7(memory, chunk_out)?;
            layout::scatter_chw_into_hwc(
                &chw,
                bw.out_rows,
                bw.out_cols,
                filters.len(),
                &mut band_out,
                out_depth,
                filters.start,
            );
            if g + 1 == plan.groups.len() {
                let at = plan.bands[b].start * win.out_cols * out_depth;
                memory.write(call.output.addr.offset(at)?, bytemuck::cast_slice(&band_out))?;
                debug!(op = ?call.op, band = b, "Band reassembled");
            }
        }
        Ok(())
    }
}

fn overlaps(a: Operand, b: Operand) -> bool {
    let (a0, b0) = (a.addr.0 as usize, b.addr.0 as usize);
    a0 < b0 + b.len && b0 < a0 + a.len
}

fn read_q7(memory: &dyn MemorySystem, operand: Operand) -> Result<Vec<i8>> {
    let bytes = memory.read(operand.addr, operand.len)?;
    Ok(bytemuck::cast_slice::<u8, i8>(&bytes).to_vec())
}
