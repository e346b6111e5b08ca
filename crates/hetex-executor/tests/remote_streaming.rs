//! Co-processor dispatch: single-shot and streamed results must be
//! bit-identical to the control-core kernels over the same tensors.

mod common;

use std::time::Duration;

use common::{config, pool, same_conv, Harness, Xoshiro, PATIENCE};
use hetex_chip::memmap::MemoryClass;
use hetex_chip::rpc::STATUS_BAD_PARAMS;
use hetex_chip::units::ExecutionUnit;
use hetex_executor::bridge::plan;
use hetex_executor::kernels::{Conv2dOpt, ConvReluPoolOpt, Pool2dOpt, WindowOp};
use hetex_executor::{Buffer, BufferSpec, CoprocessorBudget, ExecError, KernelFailurePolicy};

const CONTROL: ExecutionUnit = ExecutionUnit::Control;
const DSP: ExecutionUnit = ExecutionUnit::Coprocessor;

struct ConvCase {
    input: Vec<u8>,
    weights: Vec<u8>,
    bias: Vec<u8>,
    out_len: usize,
}

impl ConvCase {
    fn new(opt: &Conv2dOpt, depthwise: bool, seed: u64) -> Self {
        let mut rng = Xoshiro::new(seed);
        let win = opt.window();
        let wop = WindowOp::Conv { kind: opt.kind(depthwise), requant: opt.requant() };
        Self {
            input: rng.q7(win.input_len(), 128),
            weights: rng.q7(wop.weight_len(&win), 64),
            bias: rng.q7(wop.bias_len(&win), 32),
            out_len: win.output_len(wop.out_depth(&win)),
        }
    }

    fn stage(&self, h: &Harness) -> (Buffer, Buffer, Buffer) {
        (h.filled(&self.input), h.filled(&self.weights), h.filled(&self.bias))
    }

    fn run(&self, h: &Harness, unit: ExecutionUnit, opt: Conv2dOpt, depthwise: bool) -> Vec<u8> {
        let (input, weights, bias) = self.stage(h);
        let output = h.buffer(BufferSpec::new(self.out_len));
        let id = if depthwise {
            h.exec.depthwise_conv2d(unit, &input, &weights, &bias, None, &output, opt)
        } else {
            h.exec.conv2d(unit, &input, &weights, &bias, None, &output, opt)
        }
        .expect("submit conv");
        h.exec.wait_timeout(id, PATIENCE).expect("conv");
        h.contents(&output)
    }
}

fn run_pool(h: &Harness, unit: ExecutionUnit, input: &[u8], opt: Pool2dOpt, max: bool) -> Vec<u8> {
    let win = opt.window();
    let src = h.filled(input);
    let dst = h.buffer(BufferSpec::new(win.output_len(win.in_depth)));
    let id = if max {
        h.exec.maxpool2d(unit, &src, None, &dst, opt)
    } else {
        h.exec.avgpool2d(unit, &src, None, &dst, opt)
    }
    .expect("submit pool");
    h.exec.wait_timeout(id, PATIENCE).expect("pool");
    h.contents(&dst)
}

fn run_fused(h: &Harness, unit: ExecutionUnit, opt: ConvReluPoolOpt, seed: u64) -> Vec<u8> {
    let mut rng = Xoshiro::new(seed);
    let input = h.filled(&rng.q7(opt.input_len(), 128));
    let weights = h.filled(&rng.q7(opt.weight_len(), 64));
    let bias = h.filled(&rng.q7(opt.bias_len(), 32));
    let output = h.buffer(BufferSpec::new(opt.output_len()));
    let id = h
        .exec
        .conv2d_relu_avgpool(unit, &input, &weights, &bias, None, &output, opt)
        .expect("submit fused");
    h.exec.wait_timeout(id, PATIENCE).expect("fused");
    h.contents(&output)
}

fn fused_opt(rows: u16, cols: u16, depth: u16, filters: u16, kernel: u16) -> ConvReluPoolOpt {
    ConvReluPoolOpt {
        in_rows: rows,
        in_cols: cols,
        in_depth: depth,
        num_filt: filters,
        kernel,
        bias_lshift: 1,
        out_rshift: 6,
        act_min: -128,
        act_max: 127,
    }
}

fn failure_reason(outcome: hetex_executor::Result<()>) -> String {
    match outcome {
        Err(ExecError::KernelFailed { reason, .. }) => reason,
        other => panic!("expected KernelFailed, got {other:?}"),
    }
}

fn served_during(h: &Harness, f: impl FnOnce()) -> u64 {
    let before = h.dsp.requests_served();
    f();
    h.dsp.requests_served() - before
}

#[test]
fn small_conv_goes_single_shot() {
    let h = Harness::new(config());
    let opt = same_conv(8, 8, 4, 8, 3);
    let case = ConvCase::new(&opt, false, 1);

    let reference = case.run(&h, CONTROL, opt, false);
    let mut remote = Vec::new();
    let requests = served_during(&h, || remote = case.run(&h, DSP, opt, false));
    assert_eq!(requests, 1);
    assert_eq!(remote, reference);
}

#[test]
fn streamed_conv_matches_local_kernel() {
    let h = Harness::new(config());
    let opt = same_conv(32, 32, 8, 8, 3);
    let case = ConvCase::new(&opt, false, 2);
    let shared_before = h.memory.live_blocks(MemoryClass::Shared);

    let reference = case.run(&h, CONTROL, opt, false);
    let mut streamed = Vec::new();
    let requests = served_during(&h, || streamed = case.run(&h, DSP, opt, false));

    let win = opt.window();
    let wop = WindowOp::Conv { kind: opt.kind(false), requant: opt.requant() };
    let expected = plan(&win, &wop, &h.exec.config().budget).expect("plan");
    assert!(expected.chunks() > 1);
    assert_eq!(requests, expected.chunks() as u64);
    assert_eq!(streamed, reference);
    assert_eq!(h.memory.live_blocks(MemoryClass::Shared), shared_before, "scratch leaked");
}

#[test]
fn filter_groups_reassemble_channels() {
    let h = Harness::new(config());
    let opt = same_conv(8, 8, 64, 64, 3);
    let case = ConvCase::new(&opt, false, 3);

    let win = opt.window();
    let wop = WindowOp::Conv { kind: opt.kind(false), requant: opt.requant() };
    let expected = plan(&win, &wop, &h.exec.config().budget).expect("plan");
    assert!(expected.groups.len() > 1, "weights should not fit in one group");

    assert_eq!(case.run(&h, DSP, opt, false), case.run(&h, CONTROL, opt, false));
}

#[test]
fn strided_conv_bands_track_padding() {
    let h = Harness::new(config());
    let opt = Conv2dOpt {
        row_stride: 2,
        col_stride: 2,
        out_rows: 20,
        out_cols: 20,
        ..same_conv(40, 40, 8, 16, 5)
    };
    let case = ConvCase::new(&opt, false, 4);
    assert_eq!(case.run(&h, DSP, opt, false), case.run(&h, CONTROL, opt, false));
}

#[test]
fn streamed_depthwise_matches_local_kernel() {
    let h = Harness::new(config());
    let opt = same_conv(32, 32, 8, 2, 3);
    let case = ConvCase::new(&opt, true, 5);
    assert_eq!(case.run(&h, DSP, opt, true), case.run(&h, CONTROL, opt, true));
}

#[test]
fn depthwise_weights_over_budget_stream_in_channel_groups() {
    let budget = CoprocessorBudget { weight_bias_bytes: 100, inout_bytes: 700 };
    let h = Harness::new(config().with_budget(budget));
    let opt = same_conv(8, 8, 16, 2, 3);
    let case = ConvCase::new(&opt, true, 11);

    let win = opt.window();
    let wop = WindowOp::Conv { kind: opt.kind(true), requant: opt.requant() };
    assert!(wop.weight_len(&win) + wop.bias_len(&win) > budget.weight_bias_bytes);
    let expected = plan(&win, &wop, &budget).expect("plan");
    assert!(expected.groups.len() > 1);
    assert!(expected.groups.iter().all(|g| g.start % 2 == 0 && g.end % 2 == 0), "{expected:?}");

    let reference = case.run(&h, CONTROL, opt, true);
    let mut streamed = Vec::new();
    let requests = served_during(&h, || streamed = case.run(&h, DSP, opt, true));
    assert_eq!(requests, expected.chunks() as u64);
    assert_eq!(streamed, reference);
}

#[test]
fn wide_pooling_streams_in_channel_groups() {
    let budget = CoprocessorBudget { weight_bias_bytes: 100, inout_bytes: 400 };
    let h = Harness::new(config().with_budget(budget));
    let opt = pool(16, 16, 16, 2, 2, 0);
    let input = Xoshiro::new(12).q7(opt.window().input_len(), 128);

    let wop = WindowOp::Pool {
        kind: hetex_executor::kernels::PoolKind::Max,
        out_lshift: 0,
        act_min: -128,
        act_max: 127,
    };
    assert_eq!(plan(&opt.window(), &wop, &budget).expect("plan").groups, vec![0..8, 8..16]);
    assert_eq!(run_pool(&h, DSP, &input, opt, true), run_pool(&h, CONTROL, &input, opt, true));
}

#[test]
fn in_place_depthwise_streams_from_a_snapshot() {
    let h = Harness::new(config());
    let opt = same_conv(32, 32, 8, 1, 3);
    let case = ConvCase::new(&opt, true, 6);

    let run = |unit| {
        let (data, weights, bias) = case.stage(&h);
        let id = h
            .exec
            .depthwise_conv2d_inplace(unit, &data, &weights, &bias, None, opt)
            .expect("submit");
        h.exec.wait_timeout(id, PATIENCE).expect("in-place conv");
        h.contents(&data)
    };
    let local = run(CONTROL);
    assert_eq!(local, case.run(&h, CONTROL, opt, true), "in-place differs from out-of-place");
    assert_eq!(run(DSP), local);
}

#[test]
fn streamed_pooling_matches_local_kernel() {
    let h = Harness::new(config());
    let mut rng = Xoshiro::new(7);

    let max = pool(48, 48, 8, 2, 2, 0);
    let input = rng.q7(max.window().input_len(), 128);
    assert_eq!(run_pool(&h, DSP, &input, max, true), run_pool(&h, CONTROL, &input, max, true));

    let avg = pool(32, 32, 8, 3, 1, 1);
    let input = rng.q7(avg.window().input_len(), 128);
    let remote = run_pool(&h, DSP, &input, avg, false);
    assert_eq!(remote, run_pool(&h, CONTROL, &input, avg, false));
}

#[test]
fn large_relu_is_chunked() {
    let h = Harness::new(config());
    let data = Xoshiro::new(8).q7(40_000, 128);

    let local = h.filled(&data);
    h.exec.relu(CONTROL, &local).expect("relu");
    h.exec.wait_all_timeout(PATIENCE).expect("barrier");

    let remote = h.filled(&data);
    let requests = served_during(&h, || {
        h.exec.relu(DSP, &remote).expect("relu");
        h.exec.wait_all_timeout(PATIENCE).expect("barrier");
    });
    let step = h.exec.config().budget.inout_bytes / 2;
    assert_eq!(requests as usize, data.len().div_ceil(step));
    assert_eq!(h.contents(&remote), h.contents(&local));
}

#[test]
fn row_wider_than_budget_is_refused() {
    let h = Harness::new(config().with_failure_policy(KernelFailurePolicy::Propagate));
    // One 8-channel input row is 70000 bytes, past the largest single transfer.
    let cols: u16 = 8_750;
    let opt = Conv2dOpt { in_cols: cols, out_cols: cols, ..same_conv(1, 1, 8, 1, 1) };
    let case = ConvCase::new(&opt, false, 9);
    let (input, weights, bias) = case.stage(&h);
    let output = h.buffer(BufferSpec::new(case.out_len));

    let id = h
        .exec
        .pointwise_conv2d(DSP, &input, &weights, &bias, None, &output, opt)
        .expect("submit");
    let reason = failure_reason(h.exec.wait_timeout(id, PATIENCE));
    assert!(reason.contains("Remote dispatch failed"), "{reason}");
    assert_eq!(h.dsp.requests_served(), 0);
    assert_eq!(output.state(), hetex_executor::BufferState::Idle);
}

#[test]
fn refused_submission_surfaces_and_frees_scratch() {
    let h = Harness::new(config().with_failure_policy(KernelFailurePolicy::Propagate));
    let shared_before = h.memory.live_blocks(MemoryClass::Shared);
    let data = h.filled(&[0x80; 64]);

    h.dsp.refuse_next_submits(1);
    let id = h.exec.relu(DSP, &data).expect("admit");
    let reason = failure_reason(h.exec.wait(id));
    assert!(reason.contains("Remote dispatch failed"), "{reason}");
    assert_eq!(h.memory.live_blocks(MemoryClass::Shared), shared_before);
    assert_eq!(h.contents(&data), vec![0x80; 64], "kernel ran despite refusal");
}

#[test]
fn bad_status_surfaces_as_kernel_failure() {
    let h = Harness::new(config().with_failure_policy(KernelFailurePolicy::Propagate));
    let data = h.filled(&[1; 16]);

    h.dsp.corrupt_next_status(STATUS_BAD_PARAMS);
    let id = h.exec.relu(DSP, &data).expect("admit");
    let reason = failure_reason(h.exec.wait(id));
    assert!(reason.contains("status 1"), "{reason}");
}

#[test]
fn lost_response_times_out() {
    let h = Harness::new(
        config()
            .with_failure_policy(KernelFailurePolicy::Propagate)
            .with_remote_timeout(Duration::from_millis(100)),
    );
    let shared_before = h.memory.live_blocks(MemoryClass::Shared);
    let data = h.filled(&[1; 16]);

    h.dsp.drop_next_responses(1);
    let id = h.exec.relu(DSP, &data).expect("admit");
    let reason = failure_reason(h.exec.wait(id));
    assert!(reason.contains("timeout"), "{reason}");
    // The message block stays reserved for an answer that may still come.
    assert_eq!(h.memory.live_blocks(MemoryClass::Shared), shared_before + 1);

    // The bridge recovers for the next request.
    let id = h.exec.relu(DSP, &data).expect("admit");
    h.exec.wait_timeout(id, PATIENCE).expect("relu after timeout");
    assert_eq!(h.memory.live_blocks(MemoryClass::Shared), shared_before + 1);
}

#[test]
fn late_response_is_not_taken_for_the_next_request() {
    let h = Harness::new(
        config()
            .with_failure_policy(KernelFailurePolicy::Propagate)
            .with_remote_timeout(Duration::from_millis(300)),
    );
    let shared_before = h.memory.live_blocks(MemoryClass::Shared);
    let slow = h.filled(&[0x81; 16]);
    let next = h.filled(&[0xF0; 16]);

    h.dsp.set_latency(Duration::from_millis(450));
    let id = h.exec.relu(DSP, &slow).expect("admit");
    assert!(matches!(h.exec.wait(id), Err(ExecError::KernelFailed { .. })));
    let held = h.memory.live_blocks(MemoryClass::Shared);
    assert!(held > shared_before, "scratch freed under a live request");
    h.dsp.set_latency(Duration::ZERO);

    // Queued behind the slow request, so its response arrives first and must be skipped.
    let id = h.exec.relu(DSP, &next).expect("admit");
    h.exec.wait_timeout(id, PATIENCE).expect("relu after a late response");
    assert_eq!(h.contents(&next), vec![0; 16]);
    assert_eq!(h.dsp.requests_served(), 2);
    let after = h.memory.live_blocks(MemoryClass::Shared);
    assert_eq!(after, shared_before, "late scratch never released");
}

#[test]
fn unpartitionable_operator_fails_cleanly() {
    let budget = CoprocessorBudget { weight_bias_bytes: 8, inout_bytes: 12 * 1024 };
    let h = Harness::new(
        config()
            .with_failure_policy(KernelFailurePolicy::Propagate)
            .with_budget(budget),
    );
    let opt = same_conv(8, 8, 4, 4, 3);
    let case = ConvCase::new(&opt, false, 10);
    let (input, weights, bias) = case.stage(&h);
    let output = h.buffer(BufferSpec::new(case.out_len));

    let id = h.exec.conv2d(DSP, &input, &weights, &bias, None, &output, opt).expect("submit");
    assert!(matches!(h.exec.wait(id), Err(ExecError::KernelFailed { .. })));
    assert_eq!(h.dsp.requests_served(), 0);
}

#[test]
fn fused_conv_relu_pool_matches_local_kernel() {
    let h = Harness::new(config());
    for (seed, kernel) in [(13, 3), (14, 2)] {
        let opt = fused_opt(12, 12, 4, 8, kernel);
        let local = run_fused(&h, CONTROL, opt, seed);
        assert_eq!(local.len(), opt.output_len());
        assert!(local.iter().all(|&b| (b as i8) >= 0), "pooled a negative activation");

        let mut remote = Vec::new();
        let requests = served_during(&h, || remote = run_fused(&h, DSP, opt, seed));
        assert_eq!(requests, 1);
        assert_eq!(remote, local, "kernel {kernel}");
    }
}

#[test]
fn fused_operator_over_budget_is_refused() {
    let budget = CoprocessorBudget { weight_bias_bytes: 15 * 1024, inout_bytes: 600 };
    let h = Harness::new(
        config()
            .with_failure_policy(KernelFailurePolicy::Propagate)
            .with_budget(budget),
    );
    // 576 input bytes plus 200 output bytes
    let opt = fused_opt(12, 12, 4, 8, 3);
    let mut rng = Xoshiro::new(15);
    let input = h.filled(&rng.q7(opt.input_len(), 128));
    let weights = h.filled(&rng.q7(opt.weight_len(), 64));
    let bias = h.filled(&rng.q7(opt.bias_len(), 32));
    let output = h.buffer(BufferSpec::new(opt.output_len()));

    let id = h
        .exec
        .conv2d_relu_avgpool(DSP, &input, &weights, &bias, None, &output, opt)
        .expect("submit");
    let reason = failure_reason(h.exec.wait_timeout(id, PATIENCE));
    assert!(reason.contains("Remote dispatch failed"), "{reason}");
    assert_eq!(h.dsp.requests_served(), 0);

    // The control core has no such limit.
    assert_eq!(run_fused(&h, CONTROL, opt, 15).len(), opt.output_len());
}

#[test]
fn fast_pointwise_matches_standard_path() {
    let h = Harness::new(config());
    let opt = same_conv(8, 8, 16, 8, 1);
    let case = ConvCase::new(&opt, false, 16);

    let run = |fast: bool| {
        let (input, weights, bias) = case.stage(&h);
        let output = h.buffer(BufferSpec::new(case.out_len));
        let id = if fast {
            h.exec.pointwise_conv2d_fast(&input, &weights, &bias, &output, opt)
        } else {
            h.exec.pointwise_conv2d(CONTROL, &input, &weights, &bias, None, &output, opt)
        }
        .expect("submit pointwise");
        h.exec.wait_timeout(id, PATIENCE).expect("pointwise");
        h.contents(&output)
    };
    let mut fast = Vec::new();
    let requests = served_during(&h, || fast = run(true));
    assert_eq!(requests, 1);
    assert_eq!(fast, run(false));

    let wide = same_conv(8, 8, 16, 8, 3);
    let (input, weights, bias) = ConvCase::new(&wide, false, 17).stage(&h);
    let output = h.buffer(BufferSpec::new(case.out_len));
    let refused = h.exec.pointwise_conv2d_fast(&input, &weights, &bias, &output, wide);
    assert!(matches!(refused, Err(ExecError::InvalidOperand { .. })));
}
