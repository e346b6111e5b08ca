//! Tensor concatenation

use super::{expect_len, KernelFault};

/// Parameters of a two-way q7 concatenation along the height axis
///
/// Both inputs are HWC with the same width and depth. Each is shifted right
/// by its own amount so both land on the format of the input with the
/// widest range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct ConcatHeightOpt {
    pub top_rows: u16,
    pub bottom_rows: u16,
    pub cols: u16,
    pub depth: u16,
    pub top_rshift: u16,
    pub bottom_rshift: u16,
}

impl ConcatHeightOpt {
    /// Bytes in one input row
    pub fn row_len(&self) -> usize {
        usize::from(self.cols) * usize::from(self.depth)
    }

    /// Bytes of the upper input
    pub fn top_len(&self) -> usize {
        usize::from(self.top_rows) * self.row_len()
    }

    /// Bytes of the lower input
    pub fn bottom_len(&self) -> usize {
        usize::from(self.bottom_rows) * self.row_len()
    }

    /// Bytes of the output
    pub fn output_len(&self) -> usize {
        self.top_len() + self.bottom_len()
    }
}

/// Stack `top` above `bottom`
///
/// In HWC the rows of the second input simply follow those of the first.
///
/// # Errors
///
/// Returns a fault for a shift above 7 or mismatched operand lengths.
pub fn concat_height(
    top: &[i8],
    bottom: &[i8],
    opt: &ConcatHeightOpt,
    out: &mut [i8],
) -> Result<(), KernelFault> {
    if opt.top_rshift > 7 || opt.bottom_rshift > 7 {
        return Err(KernelFault::BadParams(format!(
            "shifts {} and {} exceed 7",
            opt.top_rshift, opt.bottom_rshift
        )));
    }
    expect_len("upper input", top, opt.top_len())?;
    expect_len("lower input", bottom, opt.bottom_len())?;
    expect_len("output", out, opt.output_len())?;

    let (upper, lower) = out.split_at_mut(top.len());
    for (o, &x) in upper.iter_mut().zip(top) {
        *o = x >> opt.top_rshift;
    }
    for (o, &x) in lower.iter_mut().zip(bottom) {
        *o = x >> opt.bottom_rshift;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_follow_each_other() {
        let opt = ConcatHeightOpt {
            top_rows: 1,
            bottom_rows: 2,
            cols: 2,
            depth: 1,
            ..Default::default()
        };
        let mut out = [0i8; 6];
        concat_height(&[1, 2], &[3, 4, 5, 6], &opt, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn each_input_keeps_its_own_shift() {
        let opt = ConcatHeightOpt {
            top_rows: 1,
            bottom_rows: 1,
            cols: 1,
            depth: 2,
            top_rshift: 1,
            bottom_rshift: 0,
        };
        let mut out = [0i8; 4];
        concat_height(&[64, -3], &[64, -3], &opt, &mut out).unwrap();
        assert_eq!(out, [32, -2, 64, -3]);
    }

    #[test]
    fn mismatched_width_is_refused() {
        let opt = ConcatHeightOpt {
            top_rows: 1,
            bottom_rows: 1,
            cols: 2,
            depth: 1,
            ..Default::default()
        };
        assert!(matches!(
            concat_height(&[1, 2], &[3], &opt, &mut [0; 4]),
            Err(KernelFault::ShapeMismatch { operand: "lower input", .. })
        ));
    }
}
