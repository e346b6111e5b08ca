// SPDX-License-Identifier: AGPL-3.0-only

//! Software co-processor
//!
//! Implements [`Transport`] with a worker thread standing in for the DSP
//! firmware. Requests arrive through a bounded mailbox; for each one the
//! worker:
//!
//! 1. reads the [`RemoteMessage`] at the posted address,
//! 2. checks every operand's size field against the parameter words,
//! 3. runs the reference kernel in the requested layout (the fused
//!    convolution + pooling operator is always channel-planar),
//! 4. writes the status word and raises the registered response callback
//!    with the sequence word it read.
//!
//! ## Fault injection
//!
//! Tests can refuse submissions, overwrite the next status word or swallow
//! responses, and add a fixed latency per request to widen race windows.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hetex_chip::limits::COPROCESSOR_QUEUE_DEPTH;
use hetex_chip::rpc::{
    encode_len, ModuleTag, RemoteMessage, RemoteOp, ShmemBuf, STATUS_BAD_ADDRESS, STATUS_BAD_PARAMS,
    STATUS_OK, STATUS_UNKNOWN_OP,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::message::{decode_count, decode_fused, decode_window};
use crate::bridge::{Response, ResponseHandler, Transport};
use crate::error::{ExecError, Result};
use crate::kernels::{elementwise, fused};
use crate::memory::{Address, MemorySystem};

#[derive(Debug, Clone, Copy)]
struct Request {
    module: ModuleTag,
    op: u8,
    message: Address,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_submits: u32,
    corrupt_status: Option<u16>,
    drop_responses: u32,
}

#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<ModuleTag, ResponseHandler>>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    served: AtomicU64,
}

/// Thread-backed co-processor
pub struct SoftwareCoprocessor {
    mailbox: Option<Sender<Request>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for SoftwareCoprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareCoprocessor")
            .field("served", &self.requests_served())
            .field("faults", &*self.shared.faults.lock())
            .finish_non_exhaustive()
    }
}

impl SoftwareCoprocessor {
    /// Start the co-processor thread over `memory`
    ///
    /// # Errors
    ///
    /// Returns `RemoteDispatchFailed` if the thread cannot be spawned.
    pub fn start(memory: Arc<dyn MemorySystem>) -> Result<Self> {
        let (mailbox, requests) = bounded(COPROCESSOR_QUEUE_DEPTH);
        let shared = Arc::new(Shared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("hetex-dsp".into())
                .spawn(move || serve_loop(&requests, memory.as_ref(), &shared))
                .map_err(|e| {
                    ExecError::remote_dispatch_failed(format!("co-processor thread: {e}"))
                })?
        };
        info!("Software co-processor started");
        Ok(Self {
            mailbox: Some(mailbox),
            shared,
            worker: Some(worker),
        })
    }

    /// Delay every request by `latency` before it is served
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Refuse the next `count` submissions
    pub fn refuse_next_submits(&self, count: u32) {
        self.shared.faults.lock().refuse_submits = count;
    }

    /// Write `status` instead of the real outcome for the next request
    pub fn corrupt_next_status(&self, status: u16) {
        self.shared.faults.lock().corrupt_status = Some(status);
    }

    /// Serve the next `count` requests without raising the response callback
    pub fn drop_next_responses(&self, count: u32) {
        self.shared.faults.lock().drop_responses = count;
    }

    /// Requests served so far, including failed ones
    pub fn requests_served(&self) -> u64 {
        self.shared.served.load(Ordering::Acquire)
    }
}

impl Transport for SoftwareCoprocessor {
    fn submit(&self, module: ModuleTag, op: u8, message: Address) -> Result<()> {
        {
            let mut faults = self.shared.faults.lock();
            if faults.refuse_submits > 0 {
                faults.refuse_submits -= 1;
                return Err(ExecError::remote_dispatch_failed("mailbox refused the request"));
            }
        }
        let mailbox = self.mailbox.as_ref().ok_or(ExecError::ShutDown)?;
        mailbox.try_send(Request { module, op, message }).map_err(|e| match e {
            TrySendError::Full(_) => ExecError::remote_dispatch_failed("mailbox full"),
            TrySendError::Disconnected(_) => ExecError::ShutDown,
        })
    }

    fn on_response(&self, module: ModuleTag, handler: ResponseHandler) {
        self.shared.handlers.lock().insert(module, handler);
    }
}

impl Drop for SoftwareCoprocessor {
    fn drop(&mut self) {
        drop(self.mailbox.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Co-processor thread panicked");
            }
        }
        debug!(served = self.requests_served(), "Software co-processor stopped");
    }
}

fn serve_loop(requests: &Receiver<Request>, memory: &dyn MemorySystem, shared: &Shared) {
    for req in requests {
        let latency = *shared.latency.lock();
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let (mut status, sequence) = serve(memory, req.op, req.message);
        let (corrupt, drop_response) = {
            let mut faults = shared.faults.lock();
            let drop_response = faults.drop_responses > 0;
            faults.drop_responses = faults.drop_responses.saturating_sub(1);
            (faults.corrupt_status.take(), drop_response)
        };
        if let Some(injected) = corrupt {
            status = injected;
        }
        if let Err(e) = memory.write(req.message, &status.to_le_bytes()) {
            warn!(message = %req.message, error = %e, "Cannot write status word");
        }
        shared.served.fetch_add(1, Ordering::AcqRel);
        debug!(op = req.op, sequence, status, "Request served");

        if drop_response {
            continue;
        }
        let handler = shared.handlers.lock().get(&req.module).cloned();
        match handler {
            Some(handler) => handler(
                req.module,
                Response { op: req.op, message: req.message, sequence },
            ),
            None => warn!(module = req.module.0, "No response handler registered"),
        }
    }
}

/// Run one request; returns its status word and the message's sequence word
fn serve(memory: &dyn MemorySystem, tag: u8, message: Address) -> (u16, u16) {
    let Some(msg) = memory
        .read(message, RemoteMessage::BYTES)
        .ok()
        .and_then(|raw| RemoteMessage::from_bytes(&raw))
    else {
        return (STATUS_BAD_ADDRESS, 0);
    };
    let Some(op) = RemoteOp::from_tag(tag) else {
        return (STATUS_UNKNOWN_OP, msg.sequence);
    };
    match execute(memory, op, &msg) {
        Ok(()) => (STATUS_OK, msg.sequence),
        Err(status) => (status, msg.sequence),
    }
}

fn execute(
    memory: &dyn MemorySystem,
    op: RemoteOp,
    msg: &RemoteMessage,
) -> std::result::Result<(), u16> {
    if op == RemoteOp::Relu {
        let count = decode_count(&msg.params);
        let mut data = fetch(memory, &msg.input, count)?;
        elementwise::relu(&mut data);
        return store(memory, &msg.output, &data);
    }
    if op == RemoteOp::ConvReluAvgPool {
        let opt = decode_fused(&msg.params).map_err(|_| STATUS_BAD_PARAMS)?;
        let input = fetch(memory, &msg.input, opt.input_len())?;
        let weights = fetch(memory, &msg.weight, opt.weight_len())?;
        let bias = fetch(memory, &msg.bias, opt.bias_len())?;
        let mut out = vec![0i8; opt.output_len()];
        fused::conv_relu_avgpool(&opt, &input, &weights, &bias, &mut out)
            .map_err(|_| STATUS_BAD_PARAMS)?;
        return store(memory, &msg.output, &out);
    }

    let (win, wop, layout) = decode_window(op, &msg.params).map_err(|_| STATUS_BAD_PARAMS)?;
    let input = fetch(memory, &msg.input, win.input_len())?;
    let weights = fetch(memory, &msg.weight, wop.weight_len(&win))?;
    let bias = fetch(memory, &msg.bias, wop.bias_len(&win))?;
    let mut out = vec![0i8; win.output_len(wop.out_depth(&win))];
    wop.run(&win, layout, &input, &weights, &bias, &mut out)
        .map_err(|_| STATUS_BAD_PARAMS)?;
    store(memory, &msg.output, &out)
}

fn fetch(
    memory: &dyn MemorySystem,
    buf: &ShmemBuf,
    len: usize,
) -> std::result::Result<Vec<i8>, u16> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if encode_len(len) != Some(buf.size) {
        return Err(STATUS_BAD_PARAMS);
    }
    let bytes = memory.read(Address(buf.address()), len).map_err(|_| STATUS_BAD_ADDRESS)?;
    Ok(bytemuck::cast_slice::<u8, i8>(&bytes).to_vec())
}

fn store(memory: &dyn MemorySystem, buf: &ShmemBuf, data: &[i8]) -> std::result::Result<(), u16> {
    if encode_len(data.len()) != Some(buf.size) {
        return Err(STATUS_BAD_PARAMS);
    }
    memory
        .write(Address(buf.address()), bytemuck::cast_slice(data))
        .map_err(|_| STATUS_BAD_ADDRESS)
}
