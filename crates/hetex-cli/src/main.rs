//! `hetex`: command-line front end for the heterogeneous operator executor.
//!
//! ```text
//! USAGE:
//!   hetex run [--front coproc] [--trace]   Demo CNN on both units vs control-only
//!   hetex plan <rows> <cols> <depth> <filters> <k>   Co-processor streaming plan
//!   hetex config                           Effective configuration (HETEX_* env)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use hetex_chip::units::ExecutionUnit;
use hetex_executor::bridge::{fits_single_shot, plan};
use hetex_executor::kernels::{AddOpt, Conv2dOpt, FcOpt, Pool2dOpt, WindowOp};
use hetex_executor::{
    Buffer, BufferSpec, Executor, ExecutorConfig, SoftwareCoprocessor, SystemMemory,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hetex", about = "Heterogeneous operator executor", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a small CNN with the front layers on one unit and compare the
    /// result against a control-core-only run.
    Run {
        /// Unit for the convolution and activation layers.
        #[arg(long, value_enum, default_value_t = Unit::Coproc)]
        front: Unit,
        /// Input height and width.
        #[arg(long, default_value_t = 32)]
        size: u16,
        /// Input channels.
        #[arg(long, default_value_t = 4)]
        depth: u16,
        /// Convolution filters.
        #[arg(long, default_value_t = 8)]
        filters: u16,
        /// Inferences per unit placement.
        #[arg(long, default_value_t = 4)]
        repeat: usize,
        /// PRNG seed for inputs and weights.
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Print the execution trace of the last inference.
        #[arg(long)]
        trace: bool,
    },
    /// Show how a "same" convolution is partitioned for the co-processor.
    Plan {
        /// Input rows.
        rows: u16,
        /// Input columns.
        cols: u16,
        /// Input channels.
        depth: u16,
        /// Output channels.
        filters: u16,
        /// Square kernel size.
        k: u16,
        /// Depthwise instead of standard convolution.
        #[arg(long)]
        depthwise: bool,
    },
    /// Print the configuration after `HETEX_*` overrides.
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Unit {
    Control,
    Coproc,
}

impl From<Unit> for ExecutionUnit {
    fn from(u: Unit) -> Self {
        match u {
            Unit::Control => Self::Control,
            Unit::Coproc => Self::Coprocessor,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Run { front, size, depth, filters, repeat, seed, trace } => {
            let net = Network::new(size, depth, filters, seed)?;
            cmd_run(&net, front.into(), repeat, trace)?;
        }
        Cmd::Plan { rows, cols, depth, filters, k, depthwise } => {
            cmd_plan(rows, cols, depth, filters, k, depthwise)?;
        }
        Cmd::Config => cmd_config()?,
    }

    Ok(())
}

// ── Demo network ─────────────────────────────────────────────────────────────

const CLASSES: u16 = 10;

/// conv3x3 → relu → maxpool2x2 → fc → add(residual)
struct Network {
    conv: Conv2dOpt,
    pool: Pool2dOpt,
    fc: FcOpt,
    add: AddOpt,
    image: Vec<u8>,
    conv_w: Vec<u8>,
    conv_b: Vec<u8>,
    fc_w: Vec<u8>,
    fc_b: Vec<u8>,
    residual: Vec<u8>,
}

impl Network {
    fn new(size: u16, depth: u16, filters: u16, seed: u64) -> Result<Self> {
        if size < 2 || size % 2 != 0 {
            bail!("--size must be an even number >= 2, got {size}");
        }
        let half = size / 2;
        let features = u16::try_from(usize::from(half) * usize::from(half) * usize::from(filters))
            .context("pooled feature map exceeds the fully connected input limit")?;

        let conv = Conv2dOpt {
            in_rows: size,
            in_cols: size,
            in_depth: depth,
            num_filt: filters,
            filt_rows: 3,
            filt_cols: 3,
            row_pad: 1,
            col_pad: 1,
            row_stride: 1,
            col_stride: 1,
            bias_lshift: 1,
            out_rshift: 7,
            out_rows: size,
            out_cols: size,
            act_min: -128,
            act_max: 127,
        };
        let pool = Pool2dOpt {
            in_rows: size,
            in_cols: size,
            in_depth: filters,
            filt_rows: 2,
            filt_cols: 2,
            row_pad: 0,
            col_pad: 0,
            row_stride: 2,
            col_stride: 2,
            out_rows: half,
            out_cols: half,
            out_lshift: 0,
            act_min: -128,
            act_max: 127,
        };
        let fc = FcOpt {
            filt_cols: features,
            filt_rows: CLASSES,
            bias_shift: 2,
            out_shift: 8,
            input_length: features,
            act_min: -128,
            act_max: 127,
        };
        let add = AddOpt { int_bits1: 2, int_bits2: 3, out_rshift: 1, num_elem: CLASSES };

        let win = conv.window();
        let wop = WindowOp::Conv { kind: conv.kind(false), requant: conv.requant() };
        let mut rng = SplitMix(seed);
        Ok(Self {
            image: rng.q7(win.input_len(), 128),
            conv_w: rng.q7(wop.weight_len(&win), 64),
            conv_b: rng.q7(wop.bias_len(&win), 32),
            fc_w: rng.q7(usize::from(CLASSES) * usize::from(features), 32),
            fc_b: rng.q7(usize::from(CLASSES), 16),
            residual: rng.q7(usize::from(CLASSES), 64),
            conv,
            pool,
            fc,
            add,
        })
    }

    /// One inference, submitted without intermediate waits
    fn infer(&self, exec: &Executor, front: ExecutionUnit) -> Result<Bytes> {
        let filled = |data: &[u8]| -> Result<Buffer> {
            let buf = exec.create_buffer(BufferSpec::new(data.len()))?;
            exec.write_buffer(&buf, data)?;
            Ok(buf)
        };
        let conv_win = self.conv.window();
        let pool_win = self.pool.window();

        let image = filled(&self.image)?;
        let (conv_w, conv_b) = (filled(&self.conv_w)?, filled(&self.conv_b)?);
        let (fc_w, fc_b) = (filled(&self.fc_w)?, filled(&self.fc_b)?);
        let residual = filled(&self.residual)?;
        let feature_len = conv_win.output_len(usize::from(self.conv.num_filt));
        let features = exec.create_buffer(BufferSpec::new(feature_len).per_operation())?;
        let pooled = exec.create_buffer(BufferSpec::new(pool_win.output_len(pool_win.in_depth)))?;
        let logits = exec.create_buffer(BufferSpec::new(usize::from(CLASSES)))?;
        let out = exec.create_buffer(BufferSpec::new(usize::from(CLASSES)))?;

        exec.conv2d(front, &image, &conv_w, &conv_b, None, &features, self.conv)?;
        exec.relu(front, &features)?;
        let control = ExecutionUnit::Control;
        exec.maxpool2d(control, &features, None, &pooled, self.pool)?;
        exec.fully_connected(control, &pooled, &fc_w, &fc_b, None, &logits, self.fc)?;
        exec.add(control, &logits, &residual, &out, self.add)?;
        exec.wait_all()?;

        let result = exec.read_buffer(&out)?;
        for buf in [&image, &conv_w, &conv_b, &fc_w, &fc_b, &residual, &pooled, &logits, &out] {
            exec.request_free(buf)?;
        }
        Ok(result)
    }
}

/// Deterministic input generator
struct SplitMix(u64);

impl SplitMix {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn q7(&mut self, n: usize, range: u8) -> Vec<u8> {
        let span = u64::from(range) * 2;
        (0..n)
            .map(|_| ((self.next_u64() % span) as i64 - i64::from(range)) as i8 as u8)
            .collect()
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn cmd_run(net: &Network, front: ExecutionUnit, repeat: usize, trace: bool) -> Result<()> {
    let mut config = ExecutorConfig::from_env()?;
    config.trace |= trace;
    let memory = Arc::new(SystemMemory::default());
    let dsp = Arc::new(SoftwareCoprocessor::start(memory.clone())?);
    let exec = Executor::new(config, memory, dsp.clone())?;

    let repeat = repeat.max(1);
    let timed = |unit: ExecutionUnit| -> Result<(Bytes, Duration)> {
        let start = Instant::now();
        let mut last = Bytes::new();
        for _ in 0..repeat {
            exec.trace().clear();
            last = net.infer(&exec, unit)?;
        }
        Ok((last, start.elapsed() / u32::try_from(repeat).unwrap_or(u32::MAX)))
    };

    let (reference, local_time) = timed(ExecutionUnit::Control)?;
    let served = dsp.requests_served();
    let (result, front_time) = timed(front)?;
    let remote_requests = dsp.requests_served() - served;
    info!(%front, repeat, remote_requests, "Demo finished");

    println!("Network      : conv3x3 → relu → maxpool2x2 → fc → add");
    println!("Front layers : {front}");
    println!("control-only : {:>10.3} ms/inference", local_time.as_secs_f64() * 1e3);
    let label = format!("{front} front");
    println!("{label:<13}: {:>10.3} ms/inference", front_time.as_secs_f64() * 1e3);
    println!("Co-proc calls: {remote_requests}");
    println!("Logits       : {:?}", result.iter().map(|&b| b as i8).collect::<Vec<_>>());

    if trace {
        println!();
        for ev in exec.trace().snapshot() {
            let work = ev.work.map_or_else(|| "-".to_string(), |w| w.to_string());
            let unit = ev.unit.map_or("-", ExecutionUnit::name);
            println!("{:>5}  {work:<8} {unit:<8} {:?} {:?}", ev.seq, ev.op, ev.kind);
        }
    }

    exec.shutdown()?;
    if result != reference {
        bail!("{front} placement diverged from the control-only reference");
    }
    println!("Match        : bit-identical");
    Ok(())
}

fn cmd_plan(rows: u16, cols: u16, depth: u16, filters: u16, k: u16, depthwise: bool) -> Result<()> {
    if k == 0 {
        bail!("kernel size must be at least 1");
    }
    let opt = Conv2dOpt {
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
        bias_lshift: 0,
        out_rshift: 0,
        out_rows: rows,
        out_cols: cols,
        act_min: -128,
        act_max: 127,
    };
    let win = opt.window();
    let wop = WindowOp::Conv { kind: opt.kind(depthwise), requant: opt.requant() };
    let budget = ExecutorConfig::from_env()?.budget;
    let out_len = win.output_len(wop.out_depth(&win));

    println!("Input        : {rows}×{cols}×{depth} ({} bytes)", win.input_len());
    println!("Output       : {rows}×{cols}×{} ({out_len} bytes)", wop.out_depth(&win));
    println!("Weights+bias : {} bytes", wop.weight_len(&win) + wop.bias_len(&win));
    println!(
        "Budget       : {} weight+bias, {} in+out",
        budget.weight_bias_bytes, budget.inout_bytes
    );

    if fits_single_shot(&win, &wop, &budget) {
        println!("Plan         : single shot");
        return Ok(());
    }
    let p = plan(&win, &wop, &budget)?;
    println!(
        "Plan         : {} band(s) of {} row(s) × {} group(s) of {} filter(s) = {} round-trips",
        p.bands.len(),
        p.band_rows,
        p.groups.len(),
        p.group_filters,
        p.chunks()
    );
    Ok(())
}

fn cmd_config() -> Result<()> {
    let c = ExecutorConfig::from_env()?;
    let ms = |d: Option<Duration>| {
        d.map_or_else(|| "none".to_string(), |d| format!("{} ms", d.as_millis()))
    };
    println!("Scheduled work   : {}", c.max_scheduled_work);
    println!("Inputs per item  : {}", c.max_inputs);
    println!(
        "Queue depth      : control={} coproc={}",
        c.control_queue_depth, c.coprocessor_queue_depth
    );
    println!("Admission timeout: {}", ms(c.admission_timeout));
    println!("Remote timeout   : {}", ms(c.remote_timeout));
    println!("Failure policy   : {:?}", c.kernel_failure_policy);
    println!("Weight budget    : {} bytes", c.budget.weight_bias_bytes);
    println!("In/out budget    : {} bytes", c.budget.inout_bytes);
    println!("Trace            : {}", c.trace);
    Ok(())
}
