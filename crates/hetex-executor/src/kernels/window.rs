//! Windowed kernels: convolution and pooling
//!
//! A [`Window`] describes one sliding-window pass in absolute terms. Padding
//! is only ever implicit (out-of-range taps are skipped), and bottom/right
//! padding follows from `out_rows`/`out_cols`. That lets the same kernel run
//! over a whole tensor or over a row patch whose top padding has been
//! adjusted to where the patch starts.

use std::ops::Range;

use super::{expect_len, saturate, KernelFault, Requant};

/// Element order of a 3-D activation tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `[row][col][channel]`, used by callers and the control core
    Hwc,
    /// `[channel][row][col]`, native to the co-processor
    Chw,
}

impl Layout {
    #[inline]
    pub(crate) const fn index(
        self,
        rows: usize,
        cols: usize,
        depth: usize,
        r: usize,
        c: usize,
        ch: usize,
    ) -> usize {
        match self {
            Self::Hwc => (r * cols + c) * depth + ch,
            Self::Chw => (ch * rows + r) * cols + c,
        }
    }
}

/// Convolution flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    /// Every filter sees every input channel
    Standard {
        /// Number of filters (output channels)
        filters: usize,
    },
    /// Each input channel has its own `multiplier` filters
    Depthwise {
        /// Output channels per input channel
        multiplier: usize,
    },
}

impl ConvKind {
    /// Output channels for `in_depth` input channels
    pub const fn out_depth(self, in_depth: usize) -> usize {
        match self {
            Self::Standard { filters } => filters,
            Self::Depthwise { multiplier } => in_depth * multiplier,
        }
    }

    /// Weight elements for one output channel
    pub const fn weights_per_output(self, win: &Window) -> usize {
        match self {
            Self::Standard { .. } => win.filt_rows * win.filt_cols * win.in_depth,
            Self::Depthwise { .. } => win.filt_rows * win.filt_cols,
        }
    }
}

/// Pooling flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Mean of the in-range taps
    Average,
    /// Maximum of the in-range taps
    Max,
}

/// Geometry of one sliding-window pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Window {
    pub in_rows: usize,
    pub in_cols: usize,
    pub in_depth: usize,
    pub filt_rows: usize,
    pub filt_cols: usize,
    pub row_stride: usize,
    pub col_stride: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub out_rows: usize,
    pub out_cols: usize,
}

impl Window {
    /// Input elements
    pub const fn input_len(&self) -> usize {
        self.in_rows * self.in_cols * self.in_depth
    }

    /// Output elements for `out_depth` output channels
    pub const fn output_len(&self, out_depth: usize) -> usize {
        self.out_rows * self.out_cols * out_depth
    }

    pub(crate) fn check(&self) -> Result<(), KernelFault> {
        let dims = [self.filt_rows, self.filt_cols, self.row_stride, self.col_stride];
        if dims.contains(&0) {
            return Err(KernelFault::BadParams(format!("degenerate window {self:?}")));
        }
        Ok(())
    }

    /// Input row for output row `r`, kernel row `i`, if in range
    #[inline]
    fn in_row(&self, r: usize, i: usize) -> Option<usize> {
        (r * self.row_stride + i).checked_sub(self.pad_top).filter(|&ir| ir < self.in_rows)
    }

    #[inline]
    fn in_col(&self, c: usize, j: usize) -> Option<usize> {
        (c * self.col_stride + j).checked_sub(self.pad_left).filter(|&ic| ic < self.in_cols)
    }
}

/// Parameters of a 2-D convolution, as callers supply them
///
/// For depthwise convolution `num_filt` is the depth multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Conv2dOpt {
    pub in_rows: u16,
    pub in_cols: u16,
    pub in_depth: u16,
    pub num_filt: u16,
    pub filt_rows: u16,
    pub filt_cols: u16,
    pub row_pad: u16,
    pub col_pad: u16,
    pub row_stride: u16,
    pub col_stride: u16,
    pub bias_lshift: u16,
    pub out_rshift: u16,
    pub out_rows: u16,
    pub out_cols: u16,
    pub act_min: i16,
    pub act_max: i16,
}

impl Conv2dOpt {
    /// Whole-tensor window
    pub fn window(&self) -> Window {
        Window {
            in_rows: self.in_rows.into(),
            in_cols: self.in_cols.into(),
            in_depth: self.in_depth.into(),
            filt_rows: self.filt_rows.into(),
            filt_cols: self.filt_cols.into(),
            row_stride: self.row_stride.into(),
            col_stride: self.col_stride.into(),
            pad_top: self.row_pad.into(),
            pad_left: self.col_pad.into(),
            out_rows: self.out_rows.into(),
            out_cols: self.out_cols.into(),
        }
    }

    /// Output requantisation
    pub const fn requant(&self) -> Requant {
        Requant {
            bias_lshift: self.bias_lshift,
            out_rshift: self.out_rshift,
            act_min: self.act_min,
            act_max: self.act_max,
        }
    }

    /// Convolution flavour for a standard or depthwise variant
    pub fn kind(&self, depthwise: bool) -> ConvKind {
        if depthwise {
            ConvKind::Depthwise { multiplier: self.num_filt.into() }
        } else {
            ConvKind::Standard { filters: self.num_filt.into() }
        }
    }
}

/// Parameters of a 2-D pooling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Pool2dOpt {
    pub in_rows: u16,
    pub in_cols: u16,
    pub in_depth: u16,
    pub filt_rows: u16,
    pub filt_cols: u16,
    pub row_pad: u16,
    pub col_pad: u16,
    pub row_stride: u16,
    pub col_stride: u16,
    pub out_rows: u16,
    pub out_cols: u16,
    pub out_lshift: u16,
    pub act_min: i16,
    pub act_max: i16,
}

impl Pool2dOpt {
    /// Whole-tensor window
    pub fn window(&self) -> Window {
        Window {
            in_rows: self.in_rows.into(),
            in_cols: self.in_cols.into(),
            in_depth: self.in_depth.into(),
            filt_rows: self.filt_rows.into(),
            filt_cols: self.filt_cols.into(),
            row_stride: self.row_stride.into(),
            col_stride: self.col_stride.into(),
            pad_top: self.row_pad.into(),
            pad_left: self.col_pad.into(),
            out_rows: self.out_rows.into(),
            out_cols: self.out_cols.into(),
        }
    }
}

/// A windowed operator together with its output quantisation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOp {
    /// Convolution
    Conv {
        /// Flavour and channel count
        kind: ConvKind,
        /// Output requantisation
        requant: Requant,
    },
    /// Pooling
    Pool {
        /// Flavour
        kind: PoolKind,
        /// Output left shift
        out_lshift: u16,
        /// Lower clamp
        act_min: i16,
        /// Upper clamp
        act_max: i16,
    },
}

impl WindowOp {
    /// Output channels
    pub const fn out_depth(&self, win: &Window) -> usize {
        match self {
            Self::Conv { kind, .. } => kind.out_depth(win.in_depth),
            Self::Pool { .. } => win.in_depth,
        }
    }

    /// Weight elements
    pub const fn weight_len(&self, win: &Window) -> usize {
        match self {
            Self::Conv { kind, .. } => kind.weights_per_output(win) * kind.out_depth(win.in_depth),
            Self::Pool { .. } => 0,
        }
    }

    /// Bias elements
    pub const fn bias_len(&self, win: &Window) -> usize {
        match self {
            Self::Conv { kind, .. } => kind.out_depth(win.in_depth),
            Self::Pool { .. } => 0,
        }
    }

    /// Output channels that must land in the same group when the operator
    /// is split by channel
    pub const fn filter_granule(&self) -> usize {
        match self {
            Self::Conv {
                kind: ConvKind::Depthwise { multiplier },
                ..
            } if *multiplier > 1 => *multiplier,
            _ => 1,
        }
    }

    /// Input channels read by the output channels in `filters`
    ///
    /// Standard convolution reads every input channel; depthwise convolution
    /// and pooling read only the channels feeding their own outputs.
    pub fn group_inputs(&self, win: &Window, filters: &Range<usize>) -> Range<usize> {
        match self {
            Self::Conv { kind: ConvKind::Standard { .. }, .. } => 0..win.in_depth,
            Self::Conv { kind: ConvKind::Depthwise { multiplier }, .. } => {
                let m = (*multiplier).max(1);
                filters.start / m..filters.end / m
            }
            Self::Pool { .. } => filters.clone(),
        }
    }

    /// Same operator restricted to `filters` output channels
    #[must_use]
    pub const fn with_filters(self, filters: usize) -> Self {
        match self {
            Self::Conv { kind: ConvKind::Standard { .. }, requant } => Self::Conv {
                kind: ConvKind::Standard { filters },
                requant,
            },
            other => other,
        }
    }

    /// Run over whole operands in `layout`
    ///
    /// # Errors
    ///
    /// Propagates the kernel's fault.
    pub fn run(
        &self,
        win: &Window,
        layout: Layout,
        input: &[i8],
        weights: &[i8],
        bias: &[i8],
        output: &mut [i8],
    ) -> Result<(), KernelFault> {
        match *self {
            Self::Conv { kind, requant } => {
                conv2d(win, kind, layout, input, weights, bias, &requant, output)
            }
            Self::Pool { kind, out_lshift, act_min, act_max } => {
                pool2d(win, kind, layout, input, out_lshift, act_min, act_max, output)
            }
        }
    }
}

/// Weight element index
///
/// Standard weights are `[f][kh][kw][cin]` in `Hwc` and `[f][cin][kh][kw]` in
/// `Chw`; depthwise weights are `[kh][kw][o]` and `[o][kh][kw]`.
#[inline]
#[allow(clippy::too_many_arguments)]
fn weight_index(
    kind: ConvKind,
    layout: Layout,
    win: &Window,
    out_depth: usize,
    o: usize,
    i: usize,
    j: usize,
    ch: usize,
) -> usize {
    let (kh, kw, cin) = (win.filt_rows, win.filt_cols, win.in_depth);
    match (kind, layout) {
        (ConvKind::Standard { .. }, Layout::Hwc) => ((o * kh + i) * kw + j) * cin + ch,
        (ConvKind::Standard { .. }, Layout::Chw) => ((o * cin + ch) * kh + i) * kw + j,
        (ConvKind::Depthwise { .. }, Layout::Hwc) => (i * kw + j) * out_depth + o,
        (ConvKind::Depthwise { .. }, Layout::Chw) => (o * kh + i) * kw + j,
    }
}

/// q7 convolution
///
/// `input`, `weights` and `output` all use `layout`. Accumulation is i32
/// wrapping, seeded with the shifted bias and a rounding term.
///
/// # Errors
///
/// Returns a fault if the window or requantisation is degenerate, or an
/// operand length disagrees with the window.
#[allow(clippy::too_many_arguments)]
pub fn conv2d(
    win: &Window,
    kind: ConvKind,
    layout: Layout,
    input: &[i8],
    weights: &[i8],
    bias: &[i8],
    rq: &Requant,
    output: &mut [i8],
) -> Result<(), KernelFault> {
    win.check()?;
    rq.check()?;
    let out_depth = kind.out_depth(win.in_depth);
    if let ConvKind::Depthwise { multiplier: 0 } | ConvKind::Standard { filters: 0 } = kind {
        return Err(KernelFault::BadParams("no output channels".into()));
    }
    expect_len("input", input, win.input_len())?;
    expect_len("weights", weights, kind.weights_per_output(win) * out_depth)?;
    expect_len("bias", bias, out_depth)?;
    expect_len("output", output, win.output_len(out_depth))?;

    let (rows, cols, depth) = (win.in_rows, win.in_cols, win.in_depth);
    for r in 0..win.out_rows {
        for c in 0..win.out_cols {
            for o in 0..out_depth {
                let mut acc = rq.seed(bias[o]);
                for i in 0..win.filt_rows {
                    let Some(ir) = win.in_row(r, i) else { continue };
                    for j in 0..win.filt_cols {
                        let Some(ic) = win.in_col(c, j) else { continue };
                        let channels = match kind {
                            ConvKind::Standard { .. } => 0..depth,
                            ConvKind::Depthwise { multiplier } => {
                                (o / multiplier)..(o / multiplier + 1)
                            }
                        };
                        for ch in channels {
                            let x = i32::from(input[layout.index(rows, cols, depth, ir, ic, ch)]);
                            let at = weight_index(kind, layout, win, out_depth, o, i, j, ch);
                            let w = i32::from(weights[at]);
                            acc = acc.wrapping_add(x * w);
                        }
                    }
                }
                let at = layout.index(win.out_rows, win.out_cols, out_depth, r, c, o);
                output[at] = rq.finish(acc);
            }
        }
    }
    Ok(())
}

/// q7 pooling
///
/// Only in-range taps count: an average near a padded border divides by the
/// number of real taps. The result is shifted left by `out_lshift` and
/// clamped to `[act_min, act_max]`.
///
/// # Errors
///
/// Returns a fault for a degenerate window or mismatched operand lengths.
#[allow(clippy::too_many_arguments)]
pub fn pool2d(
    win: &Window,
    kind: PoolKind,
    layout: Layout,
    input: &[i8],
    out_lshift: u16,
    act_min: i16,
    act_max: i16,
    output: &mut [i8],
) -> Result<(), KernelFault> {
    win.check()?;
    if out_lshift > 7 || act_min > act_max {
        return Err(KernelFault::BadParams(format!(
            "out_lshift {out_lshift}, act range {act_min}..={act_max}"
        )));
    }
    expect_len("input", input, win.input_len())?;
    expect_len("output", output, win.output_len(win.in_depth))?;

    let (rows, cols, depth) = (win.in_rows, win.in_cols, win.in_depth);
    for r in 0..win.out_rows {
        for c in 0..win.out_cols {
            for ch in 0..depth {
                let mut sum = 0i32;
                let mut max = i32::from(i8::MIN);
                let mut taps = 0i32;
                for i in 0..win.filt_rows {
                    let Some(ir) = win.in_row(r, i) else { continue };
                    for j in 0..win.filt_cols {
                        let Some(ic) = win.in_col(c, j) else { continue };
                        let x = i32::from(input[layout.index(rows, cols, depth, ir, ic, ch)]);
                        sum += x;
                        max = max.max(x);
                        taps += 1;
                    }
                }
                let v = match kind {
                    PoolKind::Average if taps > 0 => sum / taps,
                    PoolKind::Average => 0,
                    PoolKind::Max => max,
                };
                let v = (v << out_lshift).clamp(i32::from(act_min), i32::from(act_max));
                output[layout.index(win.out_rows, win.out_cols, depth, r, c, ch)] = saturate(v);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;

    fn window(
        in_rows: usize,
        in_cols: usize,
        depth: usize,
        k: usize,
        stride: usize,
        pad: usize,
    ) -> Window {
        let out = |n: usize| (n + 2 * pad - k) / stride + 1;
        Window {
            in_rows,
            in_cols,
            in_depth: depth,
            filt_rows: k,
            filt_cols: k,
            row_stride: stride,
            col_stride: stride,
            pad_top: pad,
            pad_left: pad,
            out_rows: out(in_rows),
            out_cols: out(in_cols),
        }
    }

    const PASS: Requant = Requant { bias_lshift: 0, out_rshift: 0, act_min: -128, act_max: 127 };
    const ONE: ConvKind = ConvKind::Standard { filters: 1 };

    #[test]
    fn conv_identity_kernel() {
        let win = window(3, 3, 1, 1, 1, 0);
        let input: Vec<i8> = (1..=9).collect();
        let mut out = vec![0i8; 9];
        conv2d(&win, ONE, Layout::Hwc, &input, &[1], &[0], &PASS, &mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn conv_padding_skips_out_of_range_taps() {
        let win = window(2, 2, 1, 3, 1, 1);
        let input = [1i8, 2, 3, 4];
        let mut out = [0i8; 4];
        conv2d(&win, ONE, Layout::Hwc, &input, &[1; 9], &[0], &PASS, &mut out).unwrap();
        assert_eq!(out, [10, 10, 10, 10]);
    }

    #[test]
    fn conv_bias_shift_and_rounding() {
        let win = window(1, 1, 1, 1, 1, 0);
        let rq = Requant { bias_lshift: 2, out_rshift: 1, act_min: -128, act_max: 127 };
        let mut out = [0i8; 1];
        // (3 << 2) + 1 + 5*1 = 18, >> 1 = 9
        conv2d(&win, ONE, Layout::Hwc, &[5], &[1], &[3], &rq, &mut out).unwrap();
        assert_eq!(out, [9]);
    }

    #[test]
    fn conv_saturates_and_clamps() {
        let win = window(1, 1, 1, 1, 1, 0);
        let relu = Requant { act_min: 0, ..PASS };
        let mut out = [0i8; 1];
        conv2d(&win, ONE, Layout::Hwc, &[100], &[100], &[0], &PASS, &mut out).unwrap();
        assert_eq!(out, [127]);
        conv2d(&win, ONE, Layout::Hwc, &[-5], &[1], &[0], &relu, &mut out).unwrap();
        assert_eq!(out, [0]);
    }

    #[test]
    fn chw_matches_hwc() {
        let win = window(5, 4, 3, 3, 2, 1);
        let kind = ConvKind::Standard { filters: 2 };
        let input: Vec<i8> = (0..win.input_len()).map(|i| (i as i8).wrapping_mul(7)).collect();
        let weights: Vec<i8> = (0..2 * 27).map(|i| (i % 5) as i8 - 2).collect();
        let bias = [1i8, -1];
        let rq = Requant { out_rshift: 3, ..PASS };

        let mut hwc = vec![0i8; win.output_len(2)];
        conv2d(&win, kind, Layout::Hwc, &input, &weights, &bias, &rq, &mut hwc).unwrap();

        let in_chw = layout::hwc_to_chw(&input, 5, 4, 3);
        let w_chw = layout::reorder_conv_weights(&weights, 2, 3, 3, 3);
        let mut chw = vec![0i8; win.output_len(2)];
        conv2d(&win, kind, Layout::Chw, &in_chw, &w_chw, &bias, &rq, &mut chw).unwrap();

        assert_eq!(layout::chw_to_hwc(&chw, win.out_rows, win.out_cols, 2), hwc);
    }

    #[test]
    fn depthwise_uses_own_channel() {
        let win = window(1, 1, 2, 1, 1, 0);
        let kind = ConvKind::Depthwise { multiplier: 2 };
        let mut out = [0i8; 4];
        // o = c*2 + k: weights [kh][kw][o]
        conv2d(&win, kind, Layout::Hwc, &[3, 5], &[1, 2, 3, 4], &[0; 4], &PASS, &mut out).unwrap();
        assert_eq!(out, [3, 6, 15, 20]);
    }

    #[test]
    fn pool_average_counts_real_taps() {
        let win = window(2, 2, 1, 2, 2, 0);
        let mut out = [0i8; 1];
        let input = [1, 2, 3, 6];
        pool2d(&win, PoolKind::Average, Layout::Hwc, &input, 0, -128, 127, &mut out).unwrap();
        assert_eq!(out, [3]);

        let padded = window(2, 2, 1, 3, 1, 1);
        let mut out = [0i8; 4];
        let input = [4; 4];
        pool2d(&padded, PoolKind::Average, Layout::Hwc, &input, 0, -128, 127, &mut out).unwrap();
        assert_eq!(out, [4; 4]);
    }

    #[test]
    fn pool_max() {
        let win = window(2, 2, 2, 2, 1, 0);
        let mut out = [0i8; 2];
        let input = [1, -1, 7, -8, -3, -2, 0, -4];
        pool2d(&win, PoolKind::Max, Layout::Hwc, &input, 0, -128, 127, &mut out).unwrap();
        assert_eq!(out, [7, -1]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let win = window(2, 2, 1, 1, 1, 0);
        let mut out = [0i8; 4];
        let err = conv2d(&win, ONE, Layout::Hwc, &[0; 3], &[1], &[0], &PASS, &mut out).unwrap_err();
        assert_eq!(err, KernelFault::ShapeMismatch { operand: "input", expected: 4, got: 3 });
    }
}
