// SPDX-License-Identifier: AGPL-3.0-only

//! Remote co-processor bridge
//!
//! Turns a dispatched work item into one or more RPC round-trips:
//!
//! 1. Operands that fit the co-processor budgets go out single-shot: the
//!    message describes the caller's buffers in place (`HWC` layout).
//! 2. Oversized windowed operators are streamed in chunks, see
//!    [`streaming`].
//! 3. ReLU is split into flat in-place chunks when it exceeds the in/out
//!    budget.
//! 4. The fused convolution + ReLU + pooling operator is single-shot only;
//!    operands over budget are refused.
//!
//! Every round-trip stamps a fresh sequence number into a [`RemoteMessage`]
//! in shared memory, posts it through the [`Transport`] and blocks until the
//! response for that message and sequence arrives. Scratch memory is
//! released on every path out, except after a timeout: the co-processor may
//! still read or write it, so it is held until the late response drains.

pub mod message;
pub mod streaming;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use hetex_chip::limits::MAX_TRANSFER_LEN;
use hetex_chip::memmap::MemoryClass;
use hetex_chip::rpc::{RemoteMessage, RemoteOp, MODULE_EXECUTOR, STATUS_OK, STATUS_PENDING};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoprocessorBudget;
use crate::error::{ExecError, Result};
use crate::kernels::{KernelFault, Layout, PoolKind, Window, WindowOp};
use crate::memory::{Address, MemorySystem};
use crate::ops::{OpParams, Operand, OperatorId, Variant};
use crate::scheduler::Dispatch;

use self::message::{describe, encode_count, encode_fused, encode_window};
use self::streaming::{SharedScratch, WindowCall};
pub use self::streaming::{fits_single_shot, plan, StreamPlan};
pub use self::transport::{Response, ResponseHandler, Transport};

/// Bridge from the co-processor lane to the transport
pub struct Bridge {
    transport: Arc<dyn Transport>,
    memory: Arc<dyn MemorySystem>,
    budget: CoprocessorBudget,
    timeout: Option<Duration>,
    responses: Receiver<Response>,
    sequence: AtomicU16,
    /// Scratch of timed-out requests, by message address, with the
    /// sequence number their late response will carry
    orphans: Mutex<HashMap<Address, (u16, Vec<Address>)>>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("transport", &self.transport)
            .field("budget", &self.budget)
            .field("timeout", &self.timeout)
            .field("orphans", &self.orphans.lock().len())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Create a bridge and register its response callback
    pub fn new(
        transport: Arc<dyn Transport>,
        memory: Arc<dyn MemorySystem>,
        budget: CoprocessorBudget,
        timeout: Option<Duration>,
    ) -> Self {
        let (raise, responses) = unbounded();
        transport.on_response(
            MODULE_EXECUTOR,
            Arc::new(move |_, response: Response| {
                if raise.send(response).is_err() {
                    debug!(op = response.op, "Response after the bridge closed");
                }
            }),
        );
        Self {
            transport,
            memory,
            budget,
            timeout,
            responses,
            sequence: AtomicU16::new(0),
            orphans: Mutex::new(HashMap::new()),
        }
    }

    /// Run a dispatched item on the co-processor
    pub(crate) fn invoke(&self, remote: RemoteOp, d: &Dispatch) -> Result<()> {
        match remote {
            RemoteOp::Relu => self.run_relu(d),
            RemoteOp::ConvReluAvgPool => self.run_fused(d),
            _ => {
                let call = window_call(remote, d)?;
                if fits_single_shot(&call.win, &call.wop, &self.budget) {
                    self.run_single(&call)
                } else {
                    self.run_streamed(&call)
                }
            }
        }
    }

    fn run_single(&self, call: &WindowCall) -> Result<()> {
        let mut scratch = SharedScratch::new(self.memory.as_ref());
        let msg_addr = scratch.alloc(RemoteMessage::BYTES)?;
        let mut msg = RemoteMessage {
            input: describe(call.input)?,
            output: describe(call.output)?,
            weight: call.weights.map(describe).transpose()?.unwrap_or_default(),
            bias: call.bias.map(describe).transpose()?.unwrap_or_default(),
            params: encode_window(&call.win, &call.wop, Layout::Hwc),
            ..RemoteMessage::default()
        };
        let sequence = self.post(call.remote, msg_addr, &mut msg)?;
        self.await_response(call.op, call.remote, (msg_addr, sequence), &mut scratch)
    }

    fn run_relu(&self, d: &Dispatch) -> Result<()> {
        let input = *d
            .inputs
            .first()
            .ok_or_else(|| ExecError::invalid_operand("Relu is missing its input"))?;
        if input.len != d.output.len {
            let fault = KernelFault::ShapeMismatch {
                operand: "output",
                expected: input.len,
                got: d.output.len,
            };
            return Err(ExecError::kernel_failed(d.op, fault.to_string()));
        }
        // Input and output both count against the in/out budget.
        let step = (self.budget.inout_bytes / 2).clamp(1, MAX_TRANSFER_LEN);
        let mut scratch = SharedScratch::new(self.memory.as_ref());
        let msg_addr = scratch.alloc(RemoteMessage::BYTES)?;
        for start in (0..input.len).step_by(step) {
            let len = step.min(input.len - start);
            let mut msg = RemoteMessage {
                input: describe(Operand { addr: input.addr.offset(start)?, len })?,
                output: describe(Operand { addr: d.output.addr.offset(start)?, len })?,
                params: encode_count(len),
                ..RemoteMessage::default()
            };
            let sequence = self.post(RemoteOp::Relu, msg_addr, &mut msg)?;
            self.await_response(d.op, RemoteOp::Relu, (msg_addr, sequence), &mut scratch)?;
        }
        Ok(())
    }

    fn run_fused(&self, d: &Dispatch) -> Result<()> {
        let OpParams::ConvReluPool(opt) = &d.params else {
            return Err(ExecError::kernel_failed(
                d.op,
                format!("unexpected parameters {:?} for the fused operator", d.params),
            ));
        };
        opt.check().map_err(|f| ExecError::kernel_failed(d.op, f.to_string()))?;
        let input = expect_operand(d, "input", d.inputs.first(), opt.input_len())?;
        let weights = expect_operand(d, "weights", d.inputs.get(1), opt.weight_len())?;
        let bias = expect_operand(d, "bias", d.inputs.get(2), opt.bias_len())?;
        let output = expect_operand(d, "output", Some(&d.output), opt.output_len())?;

        let lens = [input.len, output.len, weights.len, bias.len];
        if input.len + output.len > self.budget.inout_bytes
            || weights.len + bias.len > self.budget.weight_bias_bytes
            || lens.iter().any(|&n| n > MAX_TRANSFER_LEN)
        {
            return Err(ExecError::remote_dispatch_failed(format!(
                "fused operator needs {} in/out and {} weight bytes, budget is {:?}",
                input.len + output.len,
                weights.len + bias.len,
                self.budget
            )));
        }

        let mut scratch = SharedScratch::new(self.memory.as_ref());
        let msg_addr = scratch.alloc(RemoteMessage::BYTES)?;
        let mut msg = RemoteMessage {
            input: describe(input)?,
            output: describe(output)?,
            weight: describe(weights)?,
            bias: describe(bias)?,
            params: encode_fused(opt),
            ..RemoteMessage::default()
        };
        let sequence = self.post(RemoteOp::ConvReluAvgPool, msg_addr, &mut msg)?;
        self.await_response(d.op, RemoteOp::ConvReluAvgPool, (msg_addr, sequence), &mut scratch)
    }

    /// Stamp `msg` with the next sequence number, write it and post it
    ///
    /// Responses already queued are settled first; none of them can answer
    /// this request.
    fn post(&self, remote: RemoteOp, msg_addr: Address, msg: &mut RemoteMessage) -> Result<u16> {
        while let Ok(stale) = self.responses.try_recv() {
            self.settle(stale);
        }
        msg.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.memory.write(msg_addr, &msg.to_bytes())?;
        self.transport
            .submit(MODULE_EXECUTOR, remote.tag(), msg_addr)
            .map_err(|e| ExecError::remote_dispatch_failed(format!("{remote:?}: {e}")))?;
        debug!(?remote, sequence = msg.sequence, message = %msg_addr, "Posted");
        Ok(msg.sequence)
    }

    /// Block until the co-processor answers `(message, sequence)` and check
    /// the status it wrote
    ///
    /// Other responses are settled while waiting. On timeout the scratch is
    /// handed over to the orphan list instead of being freed.
    fn await_response(
        &self,
        op: OperatorId,
        remote: RemoteOp,
        (msg_addr, sequence): (Address, u16),
        scratch: &mut SharedScratch<'_>,
    ) -> Result<()> {
        let deadline = self.timeout.map(|t| (Instant::now() + t, t));
        loop {
            let received = match deadline {
                None => self.responses.recv().map_err(|_| ExecError::ShutDown),
                Some((at, t)) => self.responses.recv_deadline(at).map_err(|e| match e {
                    RecvTimeoutError::Timeout => ExecError::timeout(t),
                    RecvTimeoutError::Disconnected => ExecError::ShutDown,
                }),
            };
            let response = match received {
                Ok(response) => response,
                Err(e) => {
                    if matches!(e, ExecError::Timeout { .. }) {
                        self.orphan(msg_addr, sequence, scratch);
                    }
                    return Err(e);
                }
            };
            if response.message != msg_addr || response.sequence != sequence {
                self.settle(response);
                continue;
            }
            if response.op != remote.tag() {
                return Err(ExecError::remote_dispatch_failed(format!(
                    "{remote:?} request answered with op tag {}",
                    response.op
                )));
            }
            break;
        }
        let raw = self.memory.read(msg_addr, 2)?;
        match u16::from_le_bytes([raw[0], raw[1]]) {
            STATUS_OK => Ok(()),
            STATUS_PENDING => Err(ExecError::remote_dispatch_failed(format!(
                "{remote:?} answered without writing a status"
            ))),
            status => Err(ExecError::kernel_failed(op, format!("co-processor status {status}"))),
        }
    }

    fn orphan(&self, msg_addr: Address, sequence: u16, scratch: &mut SharedScratch<'_>) {
        let blocks = scratch.abandon();
        warn!(
            message = %msg_addr,
            sequence,
            blocks = blocks.len(),
            "Holding scratch until the late response"
        );
        self.orphans.lock().insert(msg_addr, (sequence, blocks));
    }

    /// Dispose of a response nobody is waiting for
    fn settle(&self, response: Response) {
        let mut orphans = self.orphans.lock();
        let expected = orphans.get(&response.message).map(|&(sequence, _)| sequence);
        if expected != Some(response.sequence) {
            warn!(
                op = response.op,
                sequence = response.sequence,
                message = %response.message,
                "Discarding unexpected co-processor response"
            );
            return;
        }
        if let Some((_, blocks)) = orphans.remove(&response.message) {
            for addr in blocks {
                self.memory.free(addr, MemoryClass::Shared);
            }
        }
        info!(
            message = %response.message,
            sequence = response.sequence,
            "Late response drained, scratch released"
        );
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        for (_, (sequence, blocks)) in self.orphans.get_mut().drain() {
            debug!(
                sequence,
                blocks = blocks.len(),
                "Releasing scratch of an unanswered request"
            );
            for addr in blocks {
                self.memory.free(addr, MemoryClass::Shared);
            }
        }
    }
}

/// Check that `operand` is present and `len` bytes long
fn expect_operand(
    d: &Dispatch,
    name: &'static str,
    operand: Option<&Operand>,
    len: usize,
) -> Result<Operand> {
    let operand = operand
        .ok_or_else(|| ExecError::invalid_operand(format!("{:?} is missing its {name}", d.op)))?;
    if operand.len != len {
        let fault = KernelFault::ShapeMismatch { operand: name, expected: len, got: operand.len };
        return Err(ExecError::kernel_failed(d.op, fault.to_string()));
    }
    Ok(*operand)
}

fn window_call(remote: RemoteOp, d: &Dispatch) -> Result<WindowCall> {
    let (win, wop): (Window, WindowOp) = match (&d.params, remote) {
        (OpParams::Conv(opt), RemoteOp::Conv2d | RemoteOp::DepthwiseConv2d) => {
            if d.variant == Variant::Fast && (opt.filt_rows, opt.filt_cols) != (1, 1) {
                return Err(ExecError::kernel_failed(
                    d.op,
                    format!("fast path is 1x1 only, got {}x{}", opt.filt_rows, opt.filt_cols),
                ));
            }
            (
                opt.window(),
                WindowOp::Conv {
                    kind: opt.kind(d.variant == Variant::Depthwise),
                    requant: opt.requant(),
                },
            )
        }
        (OpParams::Pool(opt), RemoteOp::AvgPool2d | RemoteOp::MaxPool2d) => (
            opt.window(),
            WindowOp::Pool {
                kind: if remote == RemoteOp::MaxPool2d { PoolKind::Max } else { PoolKind::Average },
                out_lshift: opt.out_lshift,
                act_min: opt.act_min,
                act_max: opt.act_max,
            },
        ),
        (params, _) => {
            return Err(ExecError::kernel_failed(
                d.op,
                format!("unexpected parameters {params:?} for {remote:?}"),
            ));
        }
    };

    let input = expect_operand(d, "input", d.inputs.first(), win.input_len())?;
    let out_len = win.output_len(wop.out_depth(&win));
    let output = expect_operand(d, "output", Some(&d.output), out_len)?;
    let (weights, bias) = match wop {
        WindowOp::Conv { .. } => (
            Some(expect_operand(d, "weights", d.inputs.get(1), wop.weight_len(&win))?),
            Some(expect_operand(d, "bias", d.inputs.get(2), wop.bias_len(&win))?),
        ),
        WindowOp::Pool { .. } => (None, None),
    };
    Ok(WindowCall {
        op: d.op,
        remote,
        win,
        wop,
        input,
        weights,
        bias,
        output,
    })
}
