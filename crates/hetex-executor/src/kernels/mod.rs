//! Reference q7 kernels
//!
//! Signed 8-bit fixed-point kernels shared by the control-core lane and the
//! software co-processor. Both sides call the same arithmetic, so a result
//! computed remotely in channel-planar patches is bit-identical to the same
//! operator computed locally over the whole interleaved tensor.
//!
//! | Module | Operators |
//! |--------|-----------|
//! | [`window`] | standard / depthwise convolution, average / max pooling |
//! | [`fused`] | CHW convolution + ReLU + 2×2 average pooling |
//! | [`elementwise`] | ReLU, sigmoid, saturating add |
//! | [`concat`] | height-axis concatenation |
//! | [`dense`] | fully connected |

pub mod concat;
pub mod dense;
pub mod elementwise;
pub mod fused;
pub mod window;

pub use concat::ConcatHeightOpt;
pub use dense::FcOpt;
pub use elementwise::{AddOpt, SigmoidOpt};
pub use fused::ConvReluPoolOpt;
pub use window::{Conv2dOpt, ConvKind, Layout, Pool2dOpt, PoolKind, Window, WindowOp};

use thiserror::Error;

/// Why a kernel refused to run
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelFault {
    /// Operand length does not match the parameters
    #[error("{operand} has {got} bytes, parameters require {expected}")]
    ShapeMismatch {
        /// Operand name
        operand: &'static str,
        /// Length implied by the parameters
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// Parameters are out of range
    #[error("bad parameters: {0}")]
    BadParams(String),
}

pub(crate) fn expect_len(
    operand: &'static str,
    data: &[i8],
    expected: usize,
) -> Result<(), KernelFault> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(KernelFault::ShapeMismatch {
            operand,
            expected,
            got: data.len(),
        })
    }
}

/// Output requantisation shared by convolution and fully-connected kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requant {
    /// Bias is shifted left by this before accumulation
    pub bias_lshift: u16,
    /// Accumulator is shifted right by this, with rounding
    pub out_rshift: u16,
    /// Lower clamp
    pub act_min: i16,
    /// Upper clamp
    pub act_max: i16,
}

impl Requant {
    pub(crate) fn check(&self) -> Result<(), KernelFault> {
        if self.bias_lshift > 23 || self.out_rshift > 30 {
            return Err(KernelFault::BadParams(format!(
                "shifts out of range (bias_lshift {}, out_rshift {})",
                self.bias_lshift, self.out_rshift
            )));
        }
        if self.act_min > self.act_max {
            return Err(KernelFault::BadParams(format!(
                "act_min {} above act_max {}",
                self.act_min, self.act_max
            )));
        }
        Ok(())
    }

    /// Accumulator seed for one output element
    pub(crate) fn seed(&self, bias: i8) -> i32 {
        let round = if self.out_rshift > 0 { 1 << (self.out_rshift - 1) } else { 0 };
        (i32::from(bias) << self.bias_lshift) + round
    }

    pub(crate) fn finish(&self, acc: i32) -> i8 {
        saturate((acc >> self.out_rshift).clamp(i32::from(self.act_min), i32::from(self.act_max)))
    }
}

pub(crate) fn saturate(v: i32) -> i8 {
    v.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8
}
