//! Fully-connected kernel

use super::{expect_len, KernelFault, Requant};

/// Parameters of a q7 fully-connected layer
///
/// Weights are row-major `[filt_rows][filt_cols]`: one row per output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FcOpt {
    /// Weight columns, equal to the input length
    pub filt_cols: u16,
    /// Weight rows, equal to the output length
    pub filt_rows: u16,
    /// Bias left shift
    pub bias_shift: u16,
    /// Output right shift
    pub out_shift: u16,
    /// Input elements
    pub input_length: u16,
    /// Lower clamp
    pub act_min: i16,
    /// Upper clamp
    pub act_max: i16,
}

impl FcOpt {
    /// Output requantisation
    pub const fn requant(&self) -> Requant {
        Requant {
            bias_lshift: self.bias_shift,
            out_rshift: self.out_shift,
            act_min: self.act_min,
            act_max: self.act_max,
        }
    }
}

/// q7 fully-connected layer
///
/// # Errors
///
/// Returns a fault when `input_length` disagrees with `filt_cols` or an
/// operand has the wrong length.
pub fn fully_connected(
    input: &[i8],
    weights: &[i8],
    bias: &[i8],
    opt: &FcOpt,
    output: &mut [i8],
) -> Result<(), KernelFault> {
    let rq = opt.requant();
    rq.check()?;
    if opt.input_length != opt.filt_cols {
        return Err(KernelFault::BadParams(format!(
            "input_length {} != filt_cols {}",
            opt.input_length, opt.filt_cols
        )));
    }
    let (cols, rows) = (usize::from(opt.filt_cols), usize::from(opt.filt_rows));
    expect_len("input", input, cols)?;
    expect_len("weights", weights, rows * cols)?;
    expect_len("bias", bias, rows)?;
    expect_len("output", output, rows)?;

    for (o, (row, &b)) in output.iter_mut().zip(weights.chunks_exact(cols).zip(bias)) {
        let acc = row
            .iter()
            .zip(input)
            .fold(rq.seed(b), |acc, (&w, &x)| acc.wrapping_add(i32::from(w) * i32::from(x)));
        *o = rq.finish(acc);
    }
    Ok(())
}
