//! Fused convolution, ReLU and 2×2 average pooling
//!
//! The whole chain runs channel-planar (`CHW`) with unit convolution stride
//! and no padding, which is the only form the co-processor firmware ships.
//! The result is exactly [`conv2d`](super::window::conv2d) followed by
//! [`relu`](super::elementwise::relu) and a 2×2 stride-2
//! [`pool2d`](super::window::pool2d) average.

use super::elementwise::relu;
use super::window::{conv2d, pool2d, ConvKind, Layout, PoolKind, Window};
use super::{expect_len, KernelFault, Requant};

/// Parameters of the fused operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct ConvReluPoolOpt {
    pub in_rows: u16,
    pub in_cols: u16,
    pub in_depth: u16,
    pub num_filt: u16,
    /// Square kernel size, 2 or 3
    pub kernel: u16,
    pub bias_lshift: u16,
    pub out_rshift: u16,
    pub act_min: i16,
    pub act_max: i16,
}

impl ConvReluPoolOpt {
    /// Window of the convolution stage
    pub fn conv_window(&self) -> Window {
        let k = usize::from(self.kernel);
        let out = |n: u16| (usize::from(n) + 1).saturating_sub(k);
        Window {
            in_rows: self.in_rows.into(),
            in_cols: self.in_cols.into(),
            in_depth: self.in_depth.into(),
            filt_rows: k,
            filt_cols: k,
            row_stride: 1,
            col_stride: 1,
            pad_top: 0,
            pad_left: 0,
            out_rows: out(self.in_rows),
            out_cols: out(self.in_cols),
        }
    }

    /// Window of the pooling stage, over the convolution output
    pub fn pool_window(&self) -> Window {
        let conv = self.conv_window();
        Window {
            in_rows: conv.out_rows,
            in_cols: conv.out_cols,
            in_depth: self.num_filt.into(),
            filt_rows: 2,
            filt_cols: 2,
            row_stride: 2,
            col_stride: 2,
            pad_top: 0,
            pad_left: 0,
            out_rows: conv.out_rows / 2,
            out_cols: conv.out_cols / 2,
        }
    }

    /// Convolution requantisation
    pub const fn requant(&self) -> Requant {
        Requant {
            bias_lshift: self.bias_lshift,
            out_rshift: self.out_rshift,
            act_min: self.act_min,
            act_max: self.act_max,
        }
    }

    /// Bytes of the input tensor
    pub fn input_len(&self) -> usize {
        self.conv_window().input_len()
    }

    /// Bytes of the weights, `[filter][channel][row][col]`
    pub fn weight_len(&self) -> usize {
        let k = usize::from(self.kernel);
        usize::from(self.num_filt) * usize::from(self.in_depth) * k * k
    }

    /// Bytes of the bias
    pub fn bias_len(&self) -> usize {
        self.num_filt.into()
    }

    /// Bytes of the pooled output
    pub fn output_len(&self) -> usize {
        let pool = self.pool_window();
        pool.output_len(pool.in_depth)
    }

    /// Reject kernel sizes and shapes the fused form does not cover
    ///
    /// # Errors
    ///
    /// Returns `BadParams` for a kernel other than 2 or 3, no filters, or an
    /// input too small to leave one pooled row and column.
    pub fn check(&self) -> Result<(), KernelFault> {
        if !matches!(self.kernel, 2 | 3) {
            return Err(KernelFault::BadParams(format!(
                "fused kernel must be 2x2 or 3x3, got {0}x{0}",
                self.kernel
            )));
        }
        if self.num_filt == 0 {
            return Err(KernelFault::BadParams("no output channels".into()));
        }
        let pool = self.pool_window();
        if pool.out_rows == 0 || pool.out_cols == 0 {
            return Err(KernelFault::BadParams(format!(
                "{}x{} input leaves nothing to pool",
                self.in_rows, self.in_cols
            )));
        }
        self.requant().check()
    }
}

/// Run the fused chain over `CHW` operands
///
/// # Errors
///
/// Returns a fault for unsupported parameters or mismatched operand lengths.
pub fn conv_relu_avgpool(
    opt: &ConvReluPoolOpt,
    input: &[i8],
    weights: &[i8],
    bias: &[i8],
    out: &mut [i8],
) -> Result<(), KernelFault> {
    opt.check()?;
    expect_len("output", out, opt.output_len())?;
    let conv = opt.conv_window();
    let mut activations = vec![0i8; conv.output_len(opt.num_filt.into())];
    conv2d(
        &conv,
        ConvKind::Standard { filters: opt.num_filt.into() },
        Layout::Chw,
        input,
        weights,
        bias,
        &opt.requant(),
        &mut activations,
    )?;
    relu(&mut activations);
    let (lo, hi) = (i16::from(i8::MIN), i16::from(i8::MAX));
    pool2d(&opt.pool_window(), PoolKind::Average, Layout::Chw, &activations, 0, lo, hi, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(rows: u16, cols: u16, depth: u16, filters: u16, kernel: u16) -> ConvReluPoolOpt {
        ConvReluPoolOpt {
            in_rows: rows,
            in_cols: cols,
            in_depth: depth,
            num_filt: filters,
            kernel,
            act_min: -128,
            act_max: 127,
            ..ConvReluPoolOpt::default()
        }
    }

    #[test]
    fn shapes_follow_the_kernel() {
        let two = opt(5, 5, 1, 2, 2);
        assert_eq!((two.conv_window().out_rows, two.pool_window().out_rows), (4, 2));
        assert_eq!(two.output_len(), 2 * 2 * 2);
        let three = opt(8, 6, 3, 4, 3);
        assert_eq!((three.pool_window().out_rows, three.pool_window().out_cols), (3, 2));
        assert_eq!(three.weight_len(), 4 * 3 * 9);
    }

    #[test]
    fn negative_sums_are_zeroed_before_pooling() {
        // 3x3 input, one channel, 2x2 box filter; the conv output is
        // [[a, b], [c, d]] and the pool averages all four.
        let o = opt(3, 3, 1, 1, 2);
        let input = [1, -9, 1, 1, 1, 1, 1, 1, 1];
        let mut out = [0i8; 1];
        conv_relu_avgpool(&o, &input, &[1; 4], &[0], &mut out).unwrap();
        // conv = [[-6, -6], [4, 4]], relu = [[0, 0], [4, 4]], mean 2
        assert_eq!(out, [2]);
    }

    #[test]
    fn other_kernels_are_refused() {
        let o = opt(8, 8, 1, 1, 5);
        assert!(matches!(o.check(), Err(KernelFault::BadParams(_))));
        let tiny = opt(2, 2, 1, 1, 2);
        assert!(tiny.check().is_err());
    }
}
