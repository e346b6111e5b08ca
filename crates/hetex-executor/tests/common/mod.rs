//! Shared fixtures for the executor integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use hetex_executor::kernels::{Conv2dOpt, Pool2dOpt};
use hetex_executor::{
    Buffer, BufferSpec, ExecError, Executor, ExecutorConfig, KernelContext, OperatorEntry,
    OperatorId, OperatorTable, Result, SoftwareCoprocessor, SystemMemory, Variant,
};
use tracing_subscriber::EnvFilter;

pub const PATIENCE: Duration = Duration::from_secs(10);

/// Blocks until released, then copies input 0 to the output
pub const GATE: OperatorId = OperatorId::Custom(1);
/// Copies input 0 to the output
pub const COPY: OperatorId = OperatorId::Custom(2);
/// Always fails
pub const FAIL: OperatorId = OperatorId::Custom(3);

// ── PRNG ─────────────────────────────────────────────────────────────────────

pub struct Xoshiro {
    s: [u64; 4],
}

impl Xoshiro {
    pub fn new(seed: u64) -> Self {
        let s = [
            seed ^ 0x9e37_79b9_7f4a_7c15,
            seed.wrapping_add(0x6c62_272e_07bb_0142),
            seed.rotate_left(17) ^ 0xc2b2_ae3d_27d4_eb4f,
            seed.rotate_right(5),
        ];
        let mut rng = Self { s };
        for _ in 0..20 {
            let _ = rng.next_u64();
        }
        rng
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3])).rotate_left(23).wrapping_add(self.s[0]);
        let t = self.s[1].wrapping_shl(17);
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    /// `n` bytes of q7 data in `-range..range`
    pub fn q7(&mut self, n: usize, range: u8) -> Vec<u8> {
        let span = u64::from(range) * 2;
        (0..n)
            .map(|_| ((self.next_u64() % span) as i64 - i64::from(range)) as i8 as u8)
            .collect()
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub exec: Executor,
    pub memory: Arc<SystemMemory>,
    pub dsp: Arc<SoftwareCoprocessor>,
    gate: Sender<()>,
}

impl Harness {
    pub fn new(config: ExecutorConfig) -> Self {
        init_tracing();
        let memory = Arc::new(SystemMemory::default());
        let dsp = Arc::new(
            SoftwareCoprocessor::start(memory.clone()).expect("Failed to start co-processor"),
        );
        let (gate, opened) = unbounded();
        let operators = test_operators(opened);
        let exec = Executor::with_operators(config, memory.clone(), dsp.clone(), operators)
            .expect("Failed to create executor");
        Self { exec, memory, dsp, gate }
    }

    /// Let one blocked `GATE` kernel proceed
    pub fn open_gate(&self) {
        self.gate.send(()).expect("Gate receiver dropped");
    }

    pub fn buffer(&self, spec: BufferSpec) -> Buffer {
        self.exec.create_buffer(spec).expect("Failed to allocate buffer")
    }

    pub fn filled(&self, data: &[u8]) -> Buffer {
        let buf = self.buffer(BufferSpec::new(data.len()));
        self.exec.write_buffer(&buf, data).expect("Failed to write buffer");
        buf
    }

    pub fn contents(&self, buf: &Buffer) -> Vec<u8> {
        self.exec.read_buffer(buf).expect("Failed to read buffer").to_vec()
    }
}

/// Route executor logs through the test writer; `RUST_LOG` overrides
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

pub fn config() -> ExecutorConfig {
    ExecutorConfig::default().with_admission_timeout(PATIENCE).with_trace()
}

fn copy(cx: &KernelContext<'_>) -> Result<()> {
    let data = cx.input(0)?;
    cx.write_output(&data)
}

fn test_operators(opened: Receiver<()>) -> OperatorTable {
    let mut ops = OperatorTable::with_reference_kernels();
    ops.register(
        GATE,
        Variant::Standard,
        OperatorEntry::local(1..=5, move |cx| {
            opened
                .recv_timeout(PATIENCE)
                .map_err(|_| ExecError::kernel_failed(cx.op, "gate never opened"))?;
            copy(cx)
        }),
    );
    ops.register(COPY, Variant::Standard, OperatorEntry::local(1..=5, copy));
    ops.register(
        FAIL,
        Variant::Standard,
        OperatorEntry::local(1..=5, |cx| Err(ExecError::kernel_failed(cx.op, "injected failure"))),
    );
    ops
}

/// Poll `cond` until it holds or [`PATIENCE`] runs out
pub fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ── Operator shapes ──────────────────────────────────────────────────────────

/// Square `k`×`k` convolution with "same" padding and unit stride
pub fn same_conv(rows: u16, cols: u16, depth: u16, filters: u16, k: u16) -> Conv2dOpt {
    Conv2dOpt {
        in_rows: rows,
        in_cols: cols,
        in_depth: depth,
        num_filt: filters,
        filt_rows: k,
        filt_cols: k,
        row_pad: k / 2,
        col_pad: k / 2,
        row_stride: 1,
        col_stride: 1,
        bias_lshift: 1,
        out_rshift: 7,
        out_rows: rows,
        out_cols: cols,
        act_min: -128,
        act_max: 127,
    }
}

/// `k`×`k` pooling with stride `stride` and padding `pad`
pub fn pool(rows: u16, cols: u16, depth: u16, k: u16, stride: u16, pad: u16) -> Pool2dOpt {
    Pool2dOpt {
        in_rows: rows,
        in_cols: cols,
        in_depth: depth,
        filt_rows: k,
        filt_cols: k,
        row_pad: pad,
        col_pad: pad,
        row_stride: stride,
        col_stride: stride,
        out_rows: (rows + 2 * pad - k) / stride + 1,
        out_cols: (cols + 2 * pad - k) / stride + 1,
        out_lshift: 0,
        act_min: -128,
        act_max: 127,
    }
}
